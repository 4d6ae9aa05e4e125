//! On-disk state cache
//!
//! One directory per cluster identity, one file per key (`<key>.tfstate`).
//! A `.tombstone` file in the directory marks the cache as exhausted: the
//! cluster it belongs to was already bootstrapped or destroyed, and opening
//! the cache again fails with [`Error::CacheExhausted`].
//!
//! Typed records are stored with a small binary envelope: a magic tag, a
//! format version and a payload length, followed by the JSON payload.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Sentinel file name
pub const TOMBSTONE_KEY: &str = ".tombstone";

/// Suffix appended to every key on disk
pub const STATE_SUFFIX: &str = ".tfstate";

const RECORD_MAGIC: &[u8; 4] = b"CDCR";
const RECORD_VERSION: u8 = 1;
const RECORD_HEADER_LEN: usize = 4 + 1 + 4;

/// Deterministic 64-character lowercase hex name for a cache identity
pub fn identity_hash(identity: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, identity.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::serialization("cache record is larger than 4 GiB"))?;

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    out.extend_from_slice(RECORD_MAGIC);
    out.push(RECORD_VERSION);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_record<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    if data.len() < RECORD_HEADER_LEN || &data[..4] != RECORD_MAGIC {
        return Err(Error::cache_corrupt(key, "missing record header"));
    }
    if data[4] != RECORD_VERSION {
        return Err(Error::cache_corrupt(
            key,
            format!(
                "record version {} is not supported (expected {})",
                data[4], RECORD_VERSION
            ),
        ));
    }
    let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let payload = &data[RECORD_HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::cache_corrupt(
            key,
            format!("payload is {} bytes, header says {}", payload.len(), len),
        ));
    }
    serde_json::from_slice(payload).map_err(|e| Error::cache_corrupt(key, e.to_string()))
}

/// Content-addressed cache directory for one cluster identity
#[derive(Debug)]
pub struct StateCache {
    dir: PathBuf,
    clean_list: Mutex<Vec<String>>,
}

impl StateCache {
    /// Open (creating if needed) the cache for `identity` under `base`
    pub fn open(base: &Path, identity: &str) -> Result<Self> {
        Self::open_dir(base.join(identity_hash(identity)))
    }

    /// Open (creating if needed) the cache at an explicit directory
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        if dir.join(TOMBSTONE_KEY).exists() {
            return Err(Error::CacheExhausted { path: dir });
        }

        debug!(dir = %dir.display(), "State cache opened");
        Ok(Self {
            dir,
            clean_list: Mutex::new(Vec::new()),
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, STATE_SUFFIX))
    }

    /// Store bytes under `key`
    pub fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(self.object_path(key))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Store a copy of the file at `path` under `key`
    pub fn save_by_path(&self, key: &str, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        self.save(key, &data)
    }

    /// Load bytes stored under `key`
    pub fn load(&self, key: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.object_path(key))?)
    }

    /// Whether `key` is present
    pub fn in_cache(&self, key: &str) -> bool {
        self.object_path(key).exists()
    }

    /// Remove `key`. Missing keys are not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a typed record under `key`
    pub fn save_struct<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.save(key, &encode_record(value)?)
    }

    /// Load a typed record stored with [`StateCache::save_struct`]
    pub fn load_struct<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        decode_record(key, &self.load(key)?)
    }

    /// Visit every file in lexicographic order with its file name and content.
    ///
    /// The tombstone and subdirectories are skipped.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> Result<()>,
    {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == TOMBSTONE_KEY {
                continue;
            }
            names.push(name);
        }
        names.sort();

        for name in names {
            let data = fs::read(self.dir.join(&name))?;
            f(&name, &data)?;
        }
        Ok(())
    }

    /// Schedule `key` for removal at [`StateCache::clean`]
    pub fn add_to_clean(&self, key: &str) {
        self.clean_list.lock().push(key.to_string());
    }

    /// Remove scheduled keys and drop the tombstone
    pub fn clean(&self) -> Result<()> {
        let keys = std::mem::take(&mut *self.clean_list.lock());
        for key in keys {
            if let Err(e) = self.delete(&key) {
                warn!(key = %key, error = %e, "Failed to remove cache entry");
            }
        }
        fs::write(self.dir.join(TOMBSTONE_KEY), b"")?;
        info!(dir = %self.dir.display(), "State cache marked as exhausted");
        Ok(())
    }

    /// Remove every entry, keeping the directory itself
    pub fn clean_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.clean_list.lock().clear();
        info!(dir = %self.dir.display(), "State cache dropped");
        Ok(())
    }
}

/// Cache that stores nothing. Object paths still point into a scratch directory.
#[derive(Debug)]
pub struct DummyCache {
    dir: PathBuf,
}

impl DummyCache {
    /// Create a dummy cache whose object paths live under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

/// The cache implementations the pipeline accepts
#[derive(Debug)]
pub enum Cache {
    /// Persistent on-disk cache
    State(StateCache),
    /// No-op cache
    Dummy(DummyCache),
}

impl Cache {
    /// Open a persistent cache for `identity` under `base`
    pub fn open(base: &Path, identity: &str) -> Result<Self> {
        StateCache::open(base, identity).map(Self::State)
    }

    /// Open a persistent cache at an explicit directory
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        StateCache::open_dir(dir).map(Self::State)
    }

    /// Create a dummy cache
    pub fn dummy(dir: impl Into<PathBuf>) -> Result<Self> {
        DummyCache::new(dir).map(Self::Dummy)
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        match self {
            Self::State(c) => c.dir(),
            Self::Dummy(c) => &c.dir,
        }
    }

    /// Path of the file backing `key`
    pub fn object_path(&self, key: &str) -> PathBuf {
        match self {
            Self::State(c) => c.object_path(key),
            Self::Dummy(c) => c.dir.join(format!("{}{}", key, STATE_SUFFIX)),
        }
    }

    /// Store bytes under `key`
    pub fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        match self {
            Self::State(c) => c.save(key, data),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Store a copy of the file at `path` under `key`
    pub fn save_by_path(&self, key: &str, path: &Path) -> Result<()> {
        match self {
            Self::State(c) => c.save_by_path(key, path),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Load bytes stored under `key`
    pub fn load(&self, key: &str) -> Result<Vec<u8>> {
        match self {
            Self::State(c) => c.load(key),
            Self::Dummy(_) => Ok(Vec::new()),
        }
    }

    /// Whether `key` is present
    pub fn in_cache(&self, key: &str) -> bool {
        match self {
            Self::State(c) => c.in_cache(key),
            Self::Dummy(_) => false,
        }
    }

    /// Remove `key`
    pub fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::State(c) => c.delete(key),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Store a typed record
    pub fn save_struct<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        match self {
            Self::State(c) => c.save_struct(key, value),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Load a typed record
    pub fn load_struct<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self {
            Self::State(c) => c.load_struct(key),
            Self::Dummy(_) => Err(Error::cache_corrupt(key, "dummy cache holds no records")),
        }
    }

    /// Visit every entry in lexicographic order
    pub fn iterate<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> Result<()>,
    {
        match self {
            Self::State(c) => c.iterate(f),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Schedule `key` for removal at [`Cache::clean`]
    pub fn add_to_clean(&self, key: &str) {
        if let Self::State(c) = self {
            c.add_to_clean(key);
        }
    }

    /// Remove scheduled keys and drop the tombstone
    pub fn clean(&self) -> Result<()> {
        match self {
            Self::State(c) => c.clean(),
            Self::Dummy(_) => Ok(()),
        }
    }

    /// Remove every entry
    pub fn clean_all(&self) -> Result<()> {
        match self {
            Self::State(c) => c.clean_all(),
            Self::Dummy(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Checkpoint {
        name: String,
        replicas: u32,
    }

    #[test]
    fn test_identity_hash_is_stable_hex() {
        let a = identity_hash("test-identity");
        let b = identity_hash("test-identity");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, identity_hash("other-identity"));
    }

    #[test]
    fn test_same_identity_same_directory() {
        let base = tempfile::tempdir().unwrap();
        let first = StateCache::open(base.path(), "test-identity").unwrap();
        first.save("uuid", b"1234").unwrap();

        let second = StateCache::open(base.path(), "test-identity").unwrap();
        assert_eq!(first.dir(), second.dir());
        assert_eq!(second.load("uuid").unwrap(), b"1234");
    }

    #[test]
    fn test_save_load_delete() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();

        assert!(!cache.in_cache("base-infrastructure"));
        cache.save("base-infrastructure", b"{}").unwrap();
        assert!(cache.in_cache("base-infrastructure"));
        assert!(cache
            .object_path("base-infrastructure")
            .ends_with("base-infrastructure.tfstate"));

        cache.delete("base-infrastructure").unwrap();
        assert!(!cache.in_cache("base-infrastructure"));
        cache.delete("base-infrastructure").unwrap();
    }

    #[test]
    fn test_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        cache.save("k", b"secret").unwrap();
        let mode = fs::metadata(cache.object_path("k")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_struct_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        let value = Checkpoint {
            name: "master".to_string(),
            replicas: 3,
        };
        cache.save_struct("checkpoint", &value).unwrap();
        let loaded: Checkpoint = cache.load_struct("checkpoint").unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_struct_version_mismatch_is_corrupt() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        let mut data = encode_record(&42u32).unwrap();
        data[4] = 99;
        cache.save("n", &data).unwrap();

        let err = cache.load_struct::<u32>("n").unwrap_err();
        assert!(matches!(err, Error::CacheCorrupt { .. }));
    }

    #[test]
    fn test_struct_raw_bytes_are_corrupt() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        cache.save("raw", b"{\"a\":1}").unwrap();
        assert!(matches!(
            cache.load_struct::<u32>("raw"),
            Err(Error::CacheCorrupt { .. })
        ));
    }

    #[test]
    fn test_iterate_is_lexicographic_and_skips_tombstone() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        cache.save("b", b"2").unwrap();
        cache.save("a", b"1").unwrap();
        fs::write(cache.dir().join("some_trash"), b"x").unwrap();
        fs::write(cache.dir().join(TOMBSTONE_KEY), b"").unwrap();

        let mut seen = Vec::new();
        cache
            .iterate(|name, _| {
                seen.push(name.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a.tfstate", "b.tfstate", "some_trash"]);
    }

    #[test]
    fn test_save_never_touches_tombstone() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        cache.save("k", b"v").unwrap();
        assert!(!cache.dir().join(TOMBSTONE_KEY).exists());
    }

    #[test]
    fn test_clean_removes_scheduled_and_tombstones() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "test-identity").unwrap();
        cache.save("keep", b"1").unwrap();
        cache.save("drop", b"2").unwrap();
        cache.add_to_clean("drop");

        cache.clean().unwrap();

        assert!(cache.in_cache("keep"));
        assert!(!cache.in_cache("drop"));
        assert!(cache.dir().join(TOMBSTONE_KEY).exists());

        let err = StateCache::open(base.path(), "test-identity").unwrap_err();
        match err {
            Error::CacheExhausted { path } => assert_eq!(path, cache.dir()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_clean_all_empties_directory() {
        let base = tempfile::tempdir().unwrap();
        let cache = StateCache::open(base.path(), "c").unwrap();
        cache.save("a", b"1").unwrap();
        cache.clean_all().unwrap();
        assert!(!cache.in_cache("a"));
        assert!(cache.dir().exists());
    }

    #[test]
    fn test_dummy_cache_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::dummy(dir.path()).unwrap();
        cache.save("k", b"v").unwrap();
        assert!(!cache.in_cache("k"));
        assert!(cache.object_path("k").starts_with(dir.path()));
        cache.clean().unwrap();
        assert!(!dir.path().join(TOMBSTONE_KEY).exists());
    }
}
