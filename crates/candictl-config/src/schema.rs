//! OpenAPI schema store for configuration documents
//!
//! Schema files are YAML documents of the form
//!
//! ```yaml
//! kind: ClusterConfiguration
//! apiVersions:
//! - apiVersion: deckhouse.io/v1
//!   openAPISpec:
//!     type: object
//!     required: [apiVersion, kind, clusterType]
//!     properties: ...
//! ```
//!
//! Only the subset of OpenAPI the bundled schemas use is understood: `type`,
//! `properties`, `required`, `additionalProperties`, `items`, `enum`,
//! `minimum`/`maximum`, `minItems`/`maxItems`, `minLength`/`maxLength`,
//! `oneOf` and `anyOf`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use candictl_common::{Error, Result};

/// Identifies a document type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaIndex {
    /// `apiVersion` of the document
    pub api_version: String,
    /// `kind` of the document
    pub kind: String,
}

impl SchemaIndex {
    /// Build an index
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Read `apiVersion` and `kind` from a document
    pub fn of(doc: &Value) -> Result<Self> {
        let get = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| Error::config_invalid(format!("document has no {}", key)))
        };
        Ok(Self {
            api_version: get("apiVersion")?,
            kind: get("kind")?,
        })
    }
}

impl fmt::Display for SchemaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.kind, self.api_version)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaFile {
    kind: String,
    api_versions: Vec<SchemaVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaVersion {
    api_version: String,
    #[serde(rename = "openAPISpec")]
    open_api_spec: Value,
}

/// Schemas indexed by `apiVersion` and `kind`
#[derive(Debug, Clone, Default)]
pub struct SchemaStore {
    schemas: HashMap<SchemaIndex, Value>,
}

impl SchemaStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cluster-wide schemas and those of every provider under
    /// `providers_dir/<provider>/openapi`.
    pub fn from_dirs(schema_dir: &Path, providers_dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        store.load_dir(schema_dir)?;

        if let Ok(entries) = fs::read_dir(providers_dir) {
            for entry in entries.flatten() {
                let openapi = entry.path().join("openapi");
                if openapi.is_dir() {
                    store.load_dir(&openapi)?;
                }
            }
        }
        debug!(schemas = store.schemas.len(), "Schema store loaded");
        Ok(store)
    }

    /// Load every `*.yaml` schema file in `dir`. Files that are not schemas
    /// are skipped.
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
            .collect();
        paths.sort();

        for path in paths {
            let data = fs::read_to_string(&path)?;
            match serde_yaml::from_str::<SchemaFile>(&data) {
                Ok(file) => self.add_file(file),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping non-schema file"),
            }
        }
        Ok(())
    }

    /// Add schemas from the text of one schema file
    pub fn load_str(&mut self, data: &str) -> Result<()> {
        let file: SchemaFile = serde_yaml::from_str(data)
            .map_err(|e| Error::serialization_for("schema", e.to_string()))?;
        self.add_file(file);
        Ok(())
    }

    fn add_file(&mut self, file: SchemaFile) {
        for version in file.api_versions {
            let index = SchemaIndex::new(version.api_version, file.kind.clone());
            if self.schemas.insert(index.clone(), version.open_api_spec).is_some() {
                warn!(schema = %index, "Schema registered twice, keeping the last one");
            }
        }
    }

    /// Register a schema directly
    pub fn register(&mut self, index: SchemaIndex, schema: Value) {
        self.schemas.insert(index, schema);
    }

    /// Whether a schema exists for `index`
    pub fn has(&self, index: &SchemaIndex) -> bool {
        self.schemas.contains_key(index)
    }

    /// Validate a document, returning its index.
    ///
    /// Documents of unknown kinds fail validation.
    pub fn validate(&self, doc: &Value) -> Result<SchemaIndex> {
        let index = SchemaIndex::of(doc)?;
        let schema = self.schemas.get(&index).ok_or_else(|| {
            Error::config_invalid_in(
                index.to_string(),
                "no schema found for this kind and apiVersion",
            )
        })?;

        let mut errors = Vec::new();
        validate_value(schema, doc, "", &mut errors);
        if errors.is_empty() {
            Ok(index)
        } else {
            Err(Error::config_invalid_in(index.to_string(), errors.join("; ")))
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

fn validate_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if value.is_null()
        && schema
            .get("nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    {
        return;
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            errors.push(format!("{}: expected {}", display_path(path), expected));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!(
                "{}: {} is not one of {}",
                display_path(path),
                value,
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                errors.push(format!("{}: {} is less than {}", display_path(path), n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                errors.push(format!("{}: {} is greater than {}", display_path(path), n, max));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                errors.push(format!("{}: shorter than {}", display_path(path), min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                errors.push(format!("{}: longer than {}", display_path(path), max));
            }
        }
    }

    if let Some(items) = value.as_array() {
        let len = items.len() as u64;
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if len < min {
                errors.push(format!("{}: fewer than {} items", display_path(path), min));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if len > max {
                errors.push(format!("{}: more than {} items", display_path(path), max));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate_value(item_schema, item, &format!("{}[{}]", path, i), errors);
            }
        }
    }

    if let Some(object) = value.as_object() {
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    errors.push(format!("{}: {} is required", display_path(path), key));
                }
            }
        }

        for (key, child) in object {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            match properties.and_then(|p| p.get(key)) {
                Some(child_schema) => validate_value(child_schema, child, &child_path, errors),
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        errors.push(format!("{}: unknown field", child_path));
                    }
                    Some(additional @ Value::Object(_)) => {
                        validate_value(additional, child, &child_path, errors);
                    }
                    _ => {}
                },
            }
        }
    }

    if let Some(variants) = schema.get("oneOf").and_then(Value::as_array) {
        let matching = variants
            .iter()
            .filter(|variant| {
                let mut scratch = Vec::new();
                validate_value(variant, value, path, &mut scratch);
                scratch.is_empty()
            })
            .count();
        if matching != 1 {
            errors.push(format!(
                "{}: must match exactly one schema in oneOf, matched {}",
                display_path(path),
                matching
            ));
        }
    }

    if let Some(variants) = schema.get("anyOf").and_then(Value::as_array) {
        let any = variants.iter().any(|variant| {
            let mut scratch = Vec::new();
            validate_value(variant, value, path, &mut scratch);
            scratch.is_empty()
        });
        if !any {
            errors.push(format!(
                "{}: must match at least one schema in anyOf",
                display_path(path)
            ));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) const CLUSTER_CONFIGURATION_SCHEMA: &str = r#"
kind: ClusterConfiguration
apiVersions:
- apiVersion: deckhouse.io/v1
  openAPISpec:
    type: object
    additionalProperties: false
    required: [apiVersion, kind, clusterType, kubernetesVersion, podSubnetCIDR, serviceSubnetCIDR]
    properties:
      apiVersion:
        type: string
        enum: [deckhouse.io/v1, deckhouse.io/v1alpha1]
      kind:
        type: string
        enum: [ClusterConfiguration]
      clusterType:
        type: string
        enum: [Cloud, Static]
      cloud:
        type: object
        required: [provider]
        properties:
          provider:
            type: string
          prefix:
            type: string
      podSubnetCIDR:
        type: string
      podSubnetNodeCIDRPrefix:
        type: string
      serviceSubnetCIDR:
        type: string
      clusterDomain:
        type: string
      defaultCRI:
        type: string
      kubernetesVersion:
        type: string
        enum: ["1.16", "1.19", "1.21", "Automatic"]
  "#;

    pub(crate) const INIT_CONFIGURATION_SCHEMA: &str = r#"
kind: InitConfiguration
apiVersions:
- apiVersion: deckhouse.io/v1
  openAPISpec:
    type: object
    additionalProperties: false
    required: [apiVersion, kind, deckhouse]
    properties:
      apiVersion:
        type: string
      kind:
        type: string
      deckhouse:
        type: object
        oneOf:
        - required: [releaseChannel]
        - required: [devBranch]
        properties:
          imagesRepo:
            type: string
            minLength: 1
          registryDockerCfg:
            type: string
          releaseChannel:
            type: string
            enum: [Alpha, Beta, EarlyAccess, Stable, RockSolid]
          devBranch:
            type: string
          bundle:
            type: string
          logLevel:
            type: string
            enum: [Debug, Info, Error]
          configOverrides:
            type: object
  "#;

    pub(crate) const STATIC_CLUSTER_CONFIGURATION_SCHEMA: &str = r#"
kind: StaticClusterConfiguration
apiVersions:
- apiVersion: deckhouse.io/v1
  openAPISpec:
    type: object
    additionalProperties: false
    required: [apiVersion, kind]
    properties:
      apiVersion:
        type: string
      kind:
        type: string
      internalNetworkCIDRs:
        type: array
        items:
          type: string
  "#;

    pub(crate) fn test_store() -> SchemaStore {
        let mut store = SchemaStore::new();
        store.load_str(CLUSTER_CONFIGURATION_SCHEMA).unwrap();
        store.load_str(INIT_CONFIGURATION_SCHEMA).unwrap();
        store.load_str(STATIC_CLUSTER_CONFIGURATION_SCHEMA).unwrap();
        store
    }

    fn cluster_doc() -> Value {
        json!({
            "apiVersion": "deckhouse.io/v1",
            "kind": "ClusterConfiguration",
            "clusterType": "Static",
            "kubernetesVersion": "1.16",
            "podSubnetCIDR": "10.222.0.0/16",
            "serviceSubnetCIDR": "10.111.0.0/16",
        })
    }

    #[test]
    fn test_valid_document() {
        let index = test_store().validate(&cluster_doc()).unwrap();
        assert_eq!(index, SchemaIndex::new("deckhouse.io/v1", "ClusterConfiguration"));
    }

    #[test]
    fn test_unknown_kind_fails() {
        let doc = json!({ "apiVersion": "deckhouse.io/v1", "kind": "Mystery" });
        let err = test_store().validate(&doc).unwrap_err();
        assert!(err.to_string().contains("no schema found"));
    }

    #[test]
    fn test_missing_kind_fails() {
        assert!(test_store().validate(&json!({ "apiVersion": "v1" })).is_err());
    }

    #[test]
    fn test_enum_and_required_errors_are_reported() {
        let mut doc = cluster_doc();
        doc["clusterType"] = json!("Hybrid");
        doc.as_object_mut().unwrap().remove("podSubnetCIDR");

        let msg = test_store().validate(&doc).unwrap_err().to_string();
        assert!(msg.contains("clusterType"));
        assert!(msg.contains("podSubnetCIDR is required"));
    }

    #[test]
    fn test_additional_properties_false() {
        let mut doc = cluster_doc();
        doc["unexpected"] = json!(true);
        let msg = test_store().validate(&doc).unwrap_err().to_string();
        assert!(msg.contains("unexpected: unknown field"));
    }

    #[test]
    fn test_one_of() {
        let store = test_store();
        let both = json!({
            "apiVersion": "deckhouse.io/v1",
            "kind": "InitConfiguration",
            "deckhouse": { "releaseChannel": "Stable", "devBranch": "main" },
        });
        assert!(store.validate(&both).is_err());

        let one = json!({
            "apiVersion": "deckhouse.io/v1",
            "kind": "InitConfiguration",
            "deckhouse": { "devBranch": "main", "imagesRepo": "r" },
        });
        store.validate(&one).unwrap();
    }

    #[test]
    fn test_array_items_and_bounds() {
        let schema = json!({
            "type": "array",
            "minItems": 1,
            "maxItems": 2,
            "items": { "type": "integer", "minimum": 1, "maximum": 10 },
        });
        let mut errors = Vec::new();
        validate_value(&schema, &json!([0, 11, 3]), "replicas", &mut errors);
        assert_eq!(errors.len(), 3);

        errors.clear();
        validate_value(&schema, &json!([5]), "replicas", &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_load_dir_skips_non_schema_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cluster_configuration.yaml"), CLUSTER_CONFIGURATION_SCHEMA)
            .unwrap();
        fs::write(dir.path().join("doc.yaml"), "just: text").unwrap();
        fs::write(dir.path().join("README.md"), "# schemas").unwrap();

        let mut store = SchemaStore::new();
        store.load_dir(dir.path()).unwrap();
        assert!(store.has(&SchemaIndex::new("deckhouse.io/v1", "ClusterConfiguration")));
        assert_eq!(store.schemas.len(), 1);
    }
}
