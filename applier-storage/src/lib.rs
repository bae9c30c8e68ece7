// The storage collaborator is the transactional-collection interface the
// applier requires but does not implement: the physical storage engine,
// write-ahead log, and index implementations live on the other side of this
// trait. `memory` provides a small in-process implementation used by
// applier-core's tests.

use applier_net::{CollectionId, IndexId};
use serde_json::Value;

pub mod memory;

#[derive(Debug)]
pub enum StorageError {
    /// A unique-index violation. System collections swallow this at the
    /// apply-engine layer; user collections surface it.
    UniqueConstraintViolated,
    NotFound,
    Other(applier_base::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::UniqueConstraintViolated => write!(f, "unique constraint violated"),
            StorageError::NotFound => write!(f, "not found"),
            StorageError::Other(e) => write!(f, "{e:?}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<applier_base::Error> for StorageError {
    fn from(e: applier_base::Error) -> Self {
        StorageError::Other(e)
    }
}

/// The mutable subset of collection properties a `ColChange` marker may
/// touch. Any other field in the wire payload is ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionChange {
    pub wait_for_sync: Option<bool>,
    pub do_compact: Option<bool>,
    pub maximal_size: Option<i64>,
    pub index_buckets: Option<i64>,
}

impl CollectionChange {
    /// Extracts the mutable subset from an arbitrary wire payload, ignoring
    /// everything else.
    pub fn from_payload(payload: &Value) -> Self {
        CollectionChange {
            wait_for_sync: payload.get("waitForSync").and_then(Value::as_bool),
            do_compact: payload.get("doCompact").and_then(Value::as_bool),
            maximal_size: payload.get("maximalSize").and_then(Value::as_i64),
            index_buckets: payload.get("indexBuckets").and_then(Value::as_i64),
        }
    }
}

/// A local transaction handle, scoped either to a single standalone marker
/// or to the whole lifetime of a master transaction id. Dropped without a
/// commit/abort call, it must behave as an abort (see the `Drop` contract on
/// implementations).
pub trait LocalTransaction: Send {
    fn exists(&mut self, cid: CollectionId, key: &str) -> Result<bool, StorageError>;
    fn insert(
        &mut self,
        cid: CollectionId,
        key: &str,
        rev: u64,
        data: Value,
        is_edge: bool,
    ) -> Result<(), StorageError>;
    fn update(
        &mut self,
        cid: CollectionId,
        key: &str,
        rev: u64,
        data: Value,
    ) -> Result<(), StorageError>;
    fn remove(&mut self, cid: CollectionId, key: &str, rev: u64) -> Result<(), StorageError>;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

pub trait StorageCollaborator: Send + Sync {
    /// Resolves a master collection id to the id the follower should use
    /// locally. If a same-named local collection already exists under a
    /// different id, the local id wins.
    fn resolve_collection(&self, cid: CollectionId, name: Option<&str>) -> CollectionId;

    fn begin(&self) -> Result<Box<dyn LocalTransaction>, StorageError>;

    fn collection_create(&self, cid: CollectionId, properties: Value) -> Result<(), StorageError>;
    fn collection_drop(&self, cid: CollectionId) -> Result<(), StorageError>;
    fn collection_rename(&self, cid: CollectionId, new_name: &str) -> Result<(), StorageError>;
    fn collection_change(
        &self,
        cid: CollectionId,
        change: CollectionChange,
    ) -> Result<(), StorageError>;

    fn index_create(&self, cid: CollectionId, index: Value) -> Result<(), StorageError>;
    fn index_drop(&self, cid: CollectionId, idx: IndexId) -> Result<(), StorageError>;

    /// `true` if `cid` names a system collection (leading underscore),
    /// used to decide whether a `UniqueConstraintViolated` is swallowed.
    fn is_system_collection(&self, cid: CollectionId) -> bool;
}
