//! Completion targets: how a task finds out whether its work is already done.

use std::fmt::Display;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::store::DocumentStore;

/// Where the completion of a task is recorded.
///
/// Both variants consult the external store and never guess: if the store
/// can't be reached the check fails with [`StoreError`] instead of reporting
/// the task as done or not done.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Done once a document matching `predicate` exists in the collection.
    ///
    /// The external job writes that document itself, so recording completion
    /// is a no-op here, completion is only ever observed.
    DocumentExistence {
        database: String,
        collection: String,
        predicate: Map<String, Value>,
    },
    /// Done once a document with identifier `id` exists in the collection.
    CollectionMembership {
        database: String,
        collection: String,
        id: String,
    },
}

impl Target {
    pub fn exists(&self, store: &dyn DocumentStore) -> Result<bool, StoreError> {
        match self {
            Target::DocumentExistence {
                database,
                collection,
                predicate,
            } => store.find(database, collection, predicate),
            Target::CollectionMembership {
                database,
                collection,
                id,
            } => store.contains(database, collection, id),
        }
    }

    /// Records a successful run.
    ///
    /// For [`Target::CollectionMembership`] the `result` document is upserted
    /// under the target's identifier, with `_id` set to it.
    pub fn record_done(&self, store: &dyn DocumentStore, result: Value) -> Result<(), StoreError> {
        match self {
            Target::DocumentExistence { .. } => Ok(()),
            Target::CollectionMembership {
                database,
                collection,
                id,
            } => {
                let document = match result {
                    Value::Object(mut map) => {
                        map.insert("_id".into(), Value::String(id.clone()));
                        Value::Object(map)
                    }
                    other => {
                        let mut map = Map::new();
                        map.insert("_id".into(), Value::String(id.clone()));
                        map.insert("result".into(), other);
                        Value::Object(map)
                    }
                };

                store.upsert(database, collection, id, document)
            }
        }
    }

    pub fn database(&self) -> &str {
        match self {
            Target::DocumentExistence { database, .. } => database,
            Target::CollectionMembership { database, .. } => database,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Target::DocumentExistence { collection, .. } => collection,
            Target::CollectionMembership { collection, .. } => collection,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::DocumentExistence {
                database,
                collection,
                predicate,
            } => write!(
                f,
                "{database}.{collection} matching {}",
                Value::Object(predicate.clone())
            ),
            Target::CollectionMembership {
                database,
                collection,
                id,
            } => write!(f, "{database}.{collection}/{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn membership() -> Target {
        Target::CollectionMembership {
            database: "db".into(),
            collection: "processing".into(),
            id: "abc".into(),
        }
    }

    fn existence() -> Target {
        let mut predicate = Map::new();
        predicate.insert("task_identity".into(), json!("abc"));

        Target::DocumentExistence {
            database: "db".into(),
            collection: "results".into(),
            predicate,
        }
    }

    #[test]
    fn test_membership_record_then_exists() {
        let store = MemoryStore::new();
        let target = membership();

        assert!(!target.exists(&store).unwrap());
        target.record_done(&store, json!({ "exit_code": 0 })).unwrap();
        assert!(target.exists(&store).unwrap());

        // Recording twice is harmless.
        target.record_done(&store, json!({ "exit_code": 0 })).unwrap();
        assert_eq!(store.count("db", "processing"), 1);
    }

    #[test]
    fn test_existence_record_is_noop() {
        let store = MemoryStore::new();
        let target = existence();

        target.record_done(&store, json!({})).unwrap();
        assert!(!target.exists(&store).unwrap());

        // Written by the external job.
        store
            .upsert("db", "results", "r1", json!({ "task_identity": "abc", "f1": 0.9 }))
            .unwrap();
        assert!(target.exists(&store).unwrap());
    }

    #[test]
    fn test_unavailable_store_fails_check() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(existence().exists(&store).is_err());
        assert!(membership().exists(&store).is_err());
        assert!(membership().record_done(&store, json!({})).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(membership().to_string(), "db.processing/abc");
        assert_eq!(
            existence().to_string(),
            r#"db.results matching {"task_identity":"abc"}"#
        );
    }
}
