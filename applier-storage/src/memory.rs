use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use applier_base::err;
use applier_net::{CollectionId, IndexId};
use serde_json::Value;

use crate::{CollectionChange, LocalTransaction, StorageCollaborator, StorageError};

#[derive(Clone, Debug)]
struct CollectionMeta {
    name: String,
    is_system: bool,
    properties: Value,
    indexes: Vec<(IndexId, Value)>,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<(u64, String), (u64, Value, bool)>,
    collections: HashMap<u64, CollectionMeta>,
    name_to_id: HashMap<String, u64>,
}

enum StagedOp {
    Insert {
        cid: u64,
        key: String,
        rev: u64,
        data: Value,
        is_edge: bool,
    },
    Update {
        cid: u64,
        key: String,
        rev: u64,
        data: Value,
    },
    Remove {
        cid: u64,
        key: String,
    },
}

/// A small in-process stand-in for the real transactional collection store,
/// good enough to exercise the apply engine and follower loop in tests.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    pub fn get(&self, cid: CollectionId, key: &str) -> Option<(u64, Value, bool)> {
        self.inner
            .lock()
            .unwrap()
            .documents
            .get(&(cid.0, key.to_owned()))
            .cloned()
    }

    pub fn collection_exists(&self, cid: CollectionId) -> bool {
        self.inner.lock().unwrap().collections.contains_key(&cid.0)
    }

    /// Test helper: seeds a collection so a `ColCreate` marker isn't required
    /// before exercising document ops.
    pub fn seed_collection(&self, cid: CollectionId, name: &str, is_system: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.collections.insert(
            cid.0,
            CollectionMeta {
                name: name.to_owned(),
                is_system,
                properties: Value::Null,
                indexes: Vec::new(),
            },
        );
        inner.name_to_id.insert(name.to_owned(), cid.0);
    }
}

impl StorageCollaborator for MemoryStorage {
    fn resolve_collection(&self, cid: CollectionId, name: Option<&str>) -> CollectionId {
        if let Some(name) = name {
            let inner = self.inner.lock().unwrap();
            if let Some(&local_id) = inner.name_to_id.get(name) {
                if local_id != cid.0 {
                    return CollectionId(local_id);
                }
            }
        }
        cid
    }

    fn begin(&self) -> Result<Box<dyn LocalTransaction>, StorageError> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: Vec::new(),
        }))
    }

    fn collection_create(&self, cid: CollectionId, properties: Value) -> Result<(), StorageError> {
        let name = properties
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::Other(err("collection payload missing name")))?
            .to_owned();
        let is_system = name.starts_with('_');
        let mut inner = self.inner.lock().unwrap();
        inner.name_to_id.insert(name.clone(), cid.0);
        inner.collections.insert(
            cid.0,
            CollectionMeta {
                name,
                is_system,
                properties,
                indexes: Vec::new(),
            },
        );
        Ok(())
    }

    fn collection_drop(&self, cid: CollectionId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let meta = inner
            .collections
            .remove(&cid.0)
            .ok_or(StorageError::NotFound)?;
        inner.name_to_id.remove(&meta.name);
        inner.documents.retain(|(c, _), _| *c != cid.0);
        Ok(())
    }

    fn collection_rename(&self, cid: CollectionId, new_name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let old_name = {
            let meta = inner
                .collections
                .get_mut(&cid.0)
                .ok_or(StorageError::NotFound)?;
            let old = meta.name.clone();
            meta.name = new_name.to_owned();
            old
        };
        inner.name_to_id.remove(&old_name);
        inner.name_to_id.insert(new_name.to_owned(), cid.0);
        Ok(())
    }

    fn collection_change(
        &self,
        cid: CollectionId,
        change: CollectionChange,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let meta = inner
            .collections
            .get_mut(&cid.0)
            .ok_or(StorageError::NotFound)?;
        let props = meta.properties.as_object_mut();
        if let Some(obj) = props {
            if let Some(v) = change.wait_for_sync {
                obj.insert("waitForSync".into(), Value::Bool(v));
            }
            if let Some(v) = change.do_compact {
                obj.insert("doCompact".into(), Value::Bool(v));
            }
            if let Some(v) = change.maximal_size {
                obj.insert("maximalSize".into(), Value::from(v));
            }
            if let Some(v) = change.index_buckets {
                obj.insert("indexBuckets".into(), Value::from(v));
            }
        }
        Ok(())
    }

    fn index_create(&self, cid: CollectionId, index: Value) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let meta = inner
            .collections
            .get_mut(&cid.0)
            .ok_or(StorageError::NotFound)?;
        let id = index
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Other(err("index payload missing id")))?;
        meta.indexes.push((IndexId(id), index));
        Ok(())
    }

    fn index_drop(&self, cid: CollectionId, idx: IndexId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let meta = inner
            .collections
            .get_mut(&cid.0)
            .ok_or(StorageError::NotFound)?;
        let before = meta.indexes.len();
        meta.indexes.retain(|(id, _)| *id != idx);
        if meta.indexes.len() == before {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn is_system_collection(&self, cid: CollectionId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .collections
            .get(&cid.0)
            .map(|m| m.is_system)
            .unwrap_or_else(|| {
                // Unknown collection: fall back to the name convention so
                // callers that haven't seeded metadata still get a sane
                // idempotence decision for `_`-prefixed markers.
                false
            })
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<StagedOp>,
}

impl LocalTransaction for MemoryTransaction {
    fn exists(&mut self, cid: CollectionId, key: &str) -> Result<bool, StorageError> {
        for op in self.staged.iter().rev() {
            match op {
                StagedOp::Insert { cid: c, key: k, .. } | StagedOp::Update { cid: c, key: k, .. }
                    if *c == cid.0 && k == key =>
                {
                    return Ok(true)
                }
                StagedOp::Remove { cid: c, key: k } if *c == cid.0 && k == key => {
                    return Ok(false)
                }
                _ => {}
            }
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .documents
            .contains_key(&(cid.0, key.to_owned())))
    }

    fn insert(
        &mut self,
        cid: CollectionId,
        key: &str,
        rev: u64,
        data: Value,
        is_edge: bool,
    ) -> Result<(), StorageError> {
        self.staged.push(StagedOp::Insert {
            cid: cid.0,
            key: key.to_owned(),
            rev,
            data,
            is_edge,
        });
        Ok(())
    }

    fn update(
        &mut self,
        cid: CollectionId,
        key: &str,
        rev: u64,
        data: Value,
    ) -> Result<(), StorageError> {
        self.staged.push(StagedOp::Update {
            cid: cid.0,
            key: key.to_owned(),
            rev,
            data,
        });
        Ok(())
    }

    fn remove(&mut self, cid: CollectionId, key: &str, _rev: u64) -> Result<(), StorageError> {
        self.staged.push(StagedOp::Remove {
            cid: cid.0,
            key: key.to_owned(),
        });
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        for op in self.staged {
            match op {
                StagedOp::Insert {
                    cid,
                    key,
                    rev,
                    data,
                    is_edge,
                } => {
                    if inner.documents.contains_key(&(cid, key.clone())) {
                        tracing::debug!(
                            target: "applier",
                            collection = cid,
                            key = %key,
                            "insert conflicts with an existing document"
                        );
                        return Err(StorageError::UniqueConstraintViolated);
                    }
                    inner.documents.insert((cid, key), (rev, data, is_edge));
                }
                StagedOp::Update {
                    cid,
                    key,
                    rev,
                    data,
                } => {
                    let is_edge = inner
                        .documents
                        .get(&(cid, key.clone()))
                        .map(|(_, _, e)| *e)
                        .unwrap_or(false);
                    inner.documents.insert((cid, key), (rev, data, is_edge));
                }
                StagedOp::Remove { cid, key } => {
                    inner.documents.remove(&(cid, key));
                }
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<(), StorageError> {
        // Staged ops were never applied to `inner`; dropping them is enough.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn standalone_insert_then_remove() {
        let store = MemoryStorage::new();
        store.seed_collection(CollectionId(7), "things", false);

        let mut txn = store.begin().unwrap();
        assert!(!txn.exists(CollectionId(7), "a").unwrap());
        txn.insert(CollectionId(7), "a", 1, Value::from(1), false)
            .unwrap();
        txn.commit().unwrap();
        assert!(store.get(CollectionId(7), "a").is_some());

        let mut txn = store.begin().unwrap();
        txn.remove(CollectionId(7), "a", 2).unwrap();
        txn.commit().unwrap();
        assert!(store.get(CollectionId(7), "a").is_none());
    }

    #[test]
    fn abort_leaves_no_trace() {
        let store = MemoryStorage::new();
        store.seed_collection(CollectionId(7), "things", false);
        let mut txn = store.begin().unwrap();
        txn.insert(CollectionId(7), "a", 1, Value::from(1), false)
            .unwrap();
        txn.abort().unwrap();
        assert!(store.get(CollectionId(7), "a").is_none());
    }

    #[test]
    fn duplicate_insert_is_unique_violation() {
        let store = MemoryStorage::new();
        store.seed_collection(CollectionId(7), "things", false);
        let mut txn = store.begin().unwrap();
        txn.insert(CollectionId(7), "a", 1, Value::from(1), false)
            .unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        txn.insert(CollectionId(7), "a", 2, Value::from(2), false)
            .unwrap();
        assert!(matches!(
            txn.commit(),
            Err(StorageError::UniqueConstraintViolated)
        ));
    }

    #[test]
    fn resolve_collection_prefers_local_id_for_same_name() {
        let store = MemoryStorage::new();
        store.seed_collection(CollectionId(99), "things", false);
        assert_eq!(
            store.resolve_collection(CollectionId(7), Some("things")),
            CollectionId(99)
        );
        assert_eq!(
            store.resolve_collection(CollectionId(7), Some("others")),
            CollectionId(7)
        );
    }
}
