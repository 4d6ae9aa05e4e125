//! Declarative resources applied after the platform is installed

use std::fmt;
use std::fs;
use std::path::Path;

use serde_json::Value;

use candictl_common::{Error, Result};

use crate::parse::split_yaml_documents;

/// One resource from the resources file
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// `apiVersion`
    pub api_version: String,
    /// `kind`
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if any
    pub namespace: Option<String>,
    /// The full object
    pub object: Value,
}

impl Resource {
    /// Build from a parsed document
    pub fn from_value(object: Value) -> Result<Self> {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

        let api_version = text(object.get("apiVersion"))
            .ok_or_else(|| Error::config_invalid_in("resources", "resource has no apiVersion"))?;
        let kind = text(object.get("kind"))
            .ok_or_else(|| Error::config_invalid_in("resources", "resource has no kind"))?;
        let metadata = object.get("metadata");
        let name = text(metadata.and_then(|m| m.get("name"))).ok_or_else(|| {
            Error::config_invalid_in("resources", format!("{} has no metadata.name", kind))
        })?;
        let namespace = text(metadata.and_then(|m| m.get("namespace")));

        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
            object,
        })
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Parse a multi-document resources file
pub fn parse_resources(path: &Path) -> Result<Vec<Resource>> {
    let data = fs::read_to_string(path)?;
    parse_resources_from_data(&data)
}

/// Parse resources from a multi-document YAML string
pub fn parse_resources_from_data(data: &str) -> Result<Vec<Resource>> {
    split_yaml_documents(data)?
        .into_iter()
        .map(Resource::from_value)
        .collect()
}
