use std::collections::HashMap;

use applier_net::TransactionId;
use applier_storage::{LocalTransaction, StorageError};

/// In-memory map from master transaction id to a local replication
/// transaction handle. A `None` entry is a pre-resume placeholder seeded
/// from the initial `openTransactions` call; a `Some` entry is a live local
/// transaction. Owned by the worker, never shared.
#[derive(Default)]
pub struct TransactionRegistry {
    entries: HashMap<TransactionId, Option<Box<dyn LocalTransaction>>>,
}

pub enum Entry<'a> {
    Live(&'a mut Box<dyn LocalTransaction>),
    Placeholder,
}

pub enum LiveLookup<'a> {
    /// No entry at all — the master is talking about a transaction this
    /// follower never heard start.
    Missing,
    /// A pre-resume placeholder with no local handle yet. A document
    /// operation against it is still unexpected: the follower only gets a
    /// handle to operate on once it replays that transaction's own
    /// `TxnStart` marker.
    Placeholder,
    Handle(&'a mut Box<dyn LocalTransaction>),
}

impl TransactionRegistry {
    pub fn new() -> Self {
        TransactionRegistry::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tid: TransactionId) -> bool {
        self.entries.contains_key(&tid)
    }

    /// All transaction ids currently tracked, live or placeholder — what
    /// the follower reports to the master as "open on this side" in the
    /// next follow-log request body.
    pub fn open_ids(&self) -> Vec<TransactionId> {
        self.entries.keys().copied().collect()
    }

    /// Seeds a pre-resume placeholder, as returned by `openTransactions`.
    pub fn seed_placeholder(&mut self, tid: TransactionId) {
        self.entries.entry(tid).or_insert(None);
    }

    pub fn entry(&mut self, tid: TransactionId) -> Option<Entry<'_>> {
        match self.entries.get_mut(&tid) {
            Some(Some(handle)) => Some(Entry::Live(handle)),
            Some(None) => Some(Entry::Placeholder),
            None => None,
        }
    }

    /// Looks up the live handle for `tid`. Never begins a transaction on
    /// the caller's behalf — a placeholder only becomes live through
    /// [`TransactionRegistry::start`], driven by that transaction's own
    /// `TxnStart` marker. `Missing` and `Placeholder` are both reported to
    /// the caller as distinct reasons a document operation has no handle to
    /// run against; both are unexpected-transaction protocol errors, not
    /// storage errors.
    pub fn live(&mut self, tid: TransactionId) -> LiveLookup<'_> {
        match self.entries.get_mut(&tid) {
            None => LiveLookup::Missing,
            Some(None) => LiveLookup::Placeholder,
            Some(Some(handle)) => LiveLookup::Handle(handle),
        }
    }

    /// `TxnStart`: if a live entry already exists for `tid` it is aborted
    /// and replaced — defensive, should not happen in practice.
    pub fn start(&mut self, tid: TransactionId, handle: Box<dyn LocalTransaction>) {
        if let Some(Some(old)) = self.entries.insert(tid, Some(handle)) {
            let _ = old.abort();
        }
    }

    /// `TxnCommit`/`TxnAbort`: removes and returns the entry, or `None` if
    /// there wasn't one (caller surfaces `UnexpectedMarker`).
    pub fn take(&mut self, tid: TransactionId) -> Option<Option<Box<dyn LocalTransaction>>> {
        self.entries.remove(&tid)
    }

    /// Shutdown: abort every live transaction still registered.
    pub fn abort_all(&mut self) -> Result<(), StorageError> {
        let mut first_err = None;
        for (_, entry) in self.entries.drain() {
            if let Some(handle) = entry {
                if let Err(e) = handle.abort() {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use applier_net::CollectionId;
    use applier_storage::memory::MemoryStorage;
    use applier_storage::StorageCollaborator;
    use test_log::test;

    #[test]
    fn placeholder_then_commit_empties_registry() {
        let mut reg = TransactionRegistry::new();
        reg.seed_placeholder(TransactionId(1));
        assert!(reg.contains(TransactionId(1)));
        assert!(matches!(reg.entry(TransactionId(1)), Some(Entry::Placeholder)));
        let taken = reg.take(TransactionId(1));
        assert!(matches!(taken, Some(None)));
        assert!(!reg.contains(TransactionId(1)));
    }

    #[test]
    fn start_replaces_and_aborts_stale_live_entry() {
        let storage = MemoryStorage::new();
        storage.seed_collection(CollectionId(1), "c", false);
        let mut reg = TransactionRegistry::new();
        let h1 = storage.begin().unwrap();
        reg.start(TransactionId(5), h1);
        let h2 = storage.begin().unwrap();
        reg.start(TransactionId(5), h2);
        assert!(reg.contains(TransactionId(5)));
    }

    #[test]
    fn abort_all_empties_registry() {
        let storage = MemoryStorage::new();
        let mut reg = TransactionRegistry::new();
        reg.start(TransactionId(1), storage.begin().unwrap());
        reg.seed_placeholder(TransactionId(2));
        reg.abort_all().unwrap();
        assert!(reg.is_empty());
    }
}
