//! Persisted document stores used to track task completion.
//!
//! A store is organised as databases of named collections of JSON documents,
//! each document addressed by an identifier. Completion writes are upserts
//! keyed by that identifier, so repeating one is harmless and concurrent
//! writers of the same identity end with the last one winning.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};

use crate::error::StoreError;

pub trait DocumentStore: Send + Sync {
    /// Whether a document with this identifier exists in the collection.
    fn contains(&self, database: &str, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Whether any document in the collection matches the partial document
    /// `predicate`. An empty predicate matches any document.
    fn find(
        &self,
        database: &str,
        collection: &str,
        predicate: &Map<String, Value>,
    ) -> Result<bool, StoreError>;

    /// Inserts the document, replacing any previous one with the same
    /// identifier.
    fn upsert(
        &self,
        database: &str,
        collection: &str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError>;
}

/// Checks whether `document` contains every entry of `predicate`.
///
/// Nested objects in the predicate are matched partially as well, any other
/// value has to be equal.
pub fn matches(document: &Value, predicate: &Map<String, Value>) -> bool {
    let Value::Object(document) = document else {
        return predicate.is_empty();
    };

    predicate.iter().all(|(key, expected)| match document.get(key) {
        Some(actual) => match expected {
            Value::Object(inner) => matches(actual, inner),
            _ => actual == expected,
        },
        None => false,
    })
}

/// A store kept on disk, one JSON file per document:
/// `<root>/<database>/<collection>/<id>.json`.
///
/// The root directory has to exist; if it doesn't (an unmounted network
/// share, for example) every operation reports the store as unreachable.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: Utf8PathBuf,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FsStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn collection_dir(&self, database: &str, collection: &str) -> Result<Utf8PathBuf, StoreError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(self.root.join(database).join(collection)),
            _ => Err(StoreError::Unreachable(self.root.to_string())),
        }
    }
}

impl DocumentStore for FsStore {
    fn contains(&self, database: &str, collection: &str, id: &str) -> Result<bool, StoreError> {
        let path = self
            .collection_dir(database, collection)?
            .join(id)
            .with_extension("json");

        path.try_exists().map_err(|e| StoreError::Io(path, e))
    }

    fn find(
        &self,
        database: &str,
        collection: &str,
        predicate: &Map<String, Value>,
    ) -> Result<bool, StoreError> {
        let dir = self.collection_dir(database, collection)?;

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::Io(dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(dir.clone(), e))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };

            if path.extension() != Some("json") {
                continue;
            }

            let text = fs::read_to_string(&path).map_err(|e| StoreError::Io(path.clone(), e))?;
            let document: Value =
                serde_json::from_str(&text).map_err(|e| StoreError::Document(path.clone(), e))?;

            if matches(&document, predicate) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn upsert(
        &self,
        database: &str,
        collection: &str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let dir = self.collection_dir(database, collection)?;
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;

        let path = dir.join(id).with_extension("json");
        let temp = dir.join(format!(
            ".{id}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::Document(path.clone(), e))?;

        fs::write(&temp, bytes).map_err(|e| StoreError::Io(temp.clone(), e))?;
        fs::rename(&temp, &path).map_err(|e| StoreError::Io(path, e))?;

        Ok(())
    }
}

type Collection = BTreeMap<String, Value>;

/// A store living in memory, for tests and dry runs.
///
/// It can be switched off with [`MemoryStore::set_available`] to simulate an
/// outage.
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(String, String), Collection>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of documents in a collection.
    pub fn count(&self, database: &str, collection: &str) -> usize {
        self.collections
            .read()
            .map(|map| {
                map.get(&(database.to_string(), collection.to_string()))
                    .map_or(0, BTreeMap::len)
            })
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable("memory".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn contains(&self, database: &str, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let map = self
            .collections
            .read()
            .map_err(|_| StoreError::Unreachable("memory".to_string()))?;

        Ok(map
            .get(&(database.to_string(), collection.to_string()))
            .is_some_and(|docs| docs.contains_key(id)))
    }

    fn find(
        &self,
        database: &str,
        collection: &str,
        predicate: &Map<String, Value>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let map = self
            .collections
            .read()
            .map_err(|_| StoreError::Unreachable("memory".to_string()))?;

        Ok(map
            .get(&(database.to_string(), collection.to_string()))
            .is_some_and(|docs| docs.values().any(|doc| matches(doc, predicate))))
    }

    fn upsert(
        &self,
        database: &str,
        collection: &str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut map = self
            .collections
            .write()
            .map_err(|_| StoreError::Unreachable("memory".to_string()))?;

        map.entry((database.to_string(), collection.to_string()))
            .or_default()
            .insert(id.to_string(), document);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn predicate(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("predicate must be an object"),
        }
    }

    #[test]
    fn test_matches_partial() {
        let doc = json!({ "a": 1, "b": { "c": 2, "d": 3 }, "e": [1, 2] });

        assert!(matches(&doc, &predicate(json!({}))));
        assert!(matches(&doc, &predicate(json!({ "a": 1 }))));
        assert!(matches(&doc, &predicate(json!({ "b": { "c": 2 } }))));
        assert!(matches(&doc, &predicate(json!({ "e": [1, 2] }))));
        assert!(!matches(&doc, &predicate(json!({ "a": "1" }))));
        assert!(!matches(&doc, &predicate(json!({ "e": [1] }))));
        assert!(!matches(&doc, &predicate(json!({ "z": null }))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(!store.contains("db", "c", "x").unwrap());
        assert!(!store.find("db", "c", &Map::new()).unwrap());

        store.upsert("db", "c", "x", json!({ "k": 1 })).unwrap();
        store.upsert("db", "c", "x", json!({ "k": 2 })).unwrap();

        assert!(store.contains("db", "c", "x").unwrap());
        assert!(store.find("db", "c", &predicate(json!({ "k": 2 }))).unwrap());
        assert!(!store.find("db", "c", &predicate(json!({ "k": 1 }))).unwrap());
        assert_eq!(store.count("db", "c"), 1);

        store.set_available(false);
        assert!(matches!(
            store.contains("db", "c", "x"),
            Err(StoreError::Unreachable(_))
        ));
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = FsStore::new(&root);

        assert!(!store.contains("db", "results", "a").unwrap());
        assert!(!store.find("db", "results", &Map::new()).unwrap());

        store
            .upsert("db", "results", "a", json!({ "task_identity": "a", "score": 0.5 }))
            .unwrap();

        assert!(store.contains("db", "results", "a").unwrap());
        assert!(
            store
                .find("db", "results", &predicate(json!({ "task_identity": "a" })))
                .unwrap()
        );
        assert!(
            !store
                .find("db", "results", &predicate(json!({ "task_identity": "b" })))
                .unwrap()
        );

        // No temporary files are left behind.
        let names: Vec<_> = fs::read_dir(root.join("db/results"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);
    }

    #[test]
    fn test_fs_store_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("missing")).unwrap();
        let store = FsStore::new(root);

        assert!(matches!(
            store.contains("db", "c", "x"),
            Err(StoreError::Unreachable(_))
        ));
        assert!(matches!(
            store.upsert("db", "c", "x", json!({})),
            Err(StoreError::Unreachable(_))
        ));
    }
}
