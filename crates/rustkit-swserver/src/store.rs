//! Persistence of registrations.
//!
//! The coordinator loads every record once at startup and writes through on
//! mutation. Two stores are provided: an in-memory one and a JSON file.

use crate::error::StoreError;
use crate::types::{RegistrationKey, ResponsePolicyHeaders, UpdateViaCache, WorkerType};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use url::Url;

/// File name used inside the registration database directory.
pub const REGISTRATIONS_FILE: &str = "registrations.json";

/// Persisted form of a registration and its active worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub key: RegistrationKey,
    pub update_via_cache: UpdateViaCache,
    pub last_update_time: Option<SystemTime>,
    pub script_url: Url,
    pub script: String,
    pub policy: ResponsePolicyHeaders,
    pub worker_type: WorkerType,
}

/// Storage backend for registration records.
pub trait RegistrationStore: Send {
    /// Read every stored record.
    fn load(&mut self) -> Result<Vec<RegistrationRecord>, StoreError>;

    /// Insert or replace the record for `record.key`.
    fn update_registration(&mut self, record: RegistrationRecord) -> Result<(), StoreError>;

    fn remove_registration(&mut self, key: &RegistrationKey) -> Result<(), StoreError>;

    fn clear_all(&mut self) -> Result<(), StoreError>;
}

// ==================== Memory ====================

/// Store that keeps records in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<RegistrationKey, RegistrationRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with records, as if a previous session had written them.
    pub fn with_records(records: impl IntoIterator<Item = RegistrationRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
        }
    }

    pub fn get(&self, key: &RegistrationKey) -> Option<&RegistrationRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RegistrationStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<RegistrationRecord>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn update_registration(&mut self, record: RegistrationRecord) -> Result<(), StoreError> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    fn remove_registration(&mut self, key: &RegistrationKey) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), StoreError> {
        self.records.clear();
        Ok(())
    }
}

// ==================== JSON file ====================

/// Store that rewrites a JSON file on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: MemoryStore,
}

impl JsonFileStore {
    /// Use `directory/registrations.json`. Nothing is read until `load`.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            path: directory.as_ref().join(REGISTRATIONS_FILE),
            records: MemoryStore::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut records: Vec<&RegistrationRecord> = self.records.records.values().collect();
        records.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        let bytes = serde_json::to_vec_pretty(&records)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), count = records.len(), "Registration store flushed");
        Ok(())
    }
}

impl RegistrationStore for JsonFileStore {
    fn load(&mut self) -> Result<Vec<RegistrationRecord>, StoreError> {
        if let Some(directory) = self.path.parent() {
            if directory.exists() && !directory.is_dir() {
                return Err(StoreError::Unavailable(format!(
                    "'{}' is not a directory",
                    directory.display()
                )));
            }
        }
        let records: Vec<RegistrationRecord> = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        self.records = MemoryStore::with_records(records.iter().cloned());
        Ok(records)
    }

    fn update_registration(&mut self, record: RegistrationRecord) -> Result<(), StoreError> {
        self.records.update_registration(record)?;
        self.flush()
    }

    fn remove_registration(&mut self, key: &RegistrationKey) -> Result<(), StoreError> {
        self.records.remove_registration(key)?;
        self.flush()
    }

    fn clear_all(&mut self) -> Result<(), StoreError> {
        self.records.clear_all()?;
        self.flush()
    }
}

/// Pick the store for a registration database directory.
pub fn open_store(directory: Option<&Path>) -> Box<dyn RegistrationStore> {
    match directory {
        Some(directory) => Box::new(JsonFileStore::new(directory)),
        None => Box::new(MemoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityOriginData;

    fn record(path: &str) -> RegistrationRecord {
        let scope = Url::parse(&format!("https://example.com{}", path)).unwrap();
        RegistrationRecord {
            key: RegistrationKey::new(SecurityOriginData::from_url(&scope), scope.clone()),
            update_via_cache: UpdateViaCache::Imports,
            last_update_time: Some(SystemTime::UNIX_EPOCH),
            script_url: scope.join("sw.js").unwrap(),
            script: "// sw".into(),
            policy: ResponsePolicyHeaders::default(),
            worker_type: WorkerType::Classic,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rustkit-swserver-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        store.update_registration(record("/a/")).unwrap();
        store.update_registration(record("/b/")).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);

        store.remove_registration(&record("/a/").key).unwrap();
        assert!(store.get(&record("/a/").key).is_none());

        store.clear_all().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = temp_dir("missing");
        let mut store = JsonFileStore::new(&dir);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let dir = temp_dir("persist");
        {
            let mut store = JsonFileStore::new(&dir);
            store.load().unwrap();
            store.update_registration(record("/a/")).unwrap();
            store.update_registration(record("/b/")).unwrap();
            store.remove_registration(&record("/b/").key).unwrap();
        }

        let mut reopened = JsonFileStore::new(&dir);
        let records = reopened.load().unwrap();
        assert_eq!(records, vec![record("/a/")]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(REGISTRATIONS_FILE), b"not json").unwrap();

        let mut store = JsonFileStore::new(&dir);
        assert!(matches!(store.load(), Err(StoreError::Serialization(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_store_directory_is_a_file() {
        let path = temp_dir("not-a-dir");
        let _ = fs::remove_file(&path);
        fs::write(&path, b"").unwrap();

        let mut store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Unavailable(_))));
        let _ = fs::remove_file(&path);
    }
}
