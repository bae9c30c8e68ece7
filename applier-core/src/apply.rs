use std::sync::Arc;

use applier_net::{Marker, Tick};
use applier_storage::{CollectionChange, StorageCollaborator, StorageError};

use crate::config::Config;
use crate::error::ApplyError;
use crate::filter::should_skip;
use crate::registry::{LiveLookup, TransactionRegistry};
use crate::state::{StateHandle, TickKind};

/// Turns a decoded marker stream into calls against a [`StorageCollaborator`],
/// tracking the transaction registry and the applier's tick/counter state as
/// it goes.
pub struct ApplyEngine<S> {
    storage: Arc<S>,
    registry: TransactionRegistry,
    config: Config,
    state: StateHandle,
    ignore_errors_remaining: i64,
}

impl<S: StorageCollaborator> ApplyEngine<S> {
    pub fn new(storage: Arc<S>, config: Config, state: StateHandle) -> Self {
        let ignore_errors_remaining = config.ignore_errors;
        ApplyEngine {
            storage,
            registry: TransactionRegistry::new(),
            config,
            state,
            ignore_errors_remaining,
        }
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TransactionRegistry {
        &mut self.registry
    }

    pub fn abort_open_transactions(&mut self) -> Result<(), StorageError> {
        self.registry.abort_all()
    }

    /// Applies a single marker, or drops it per the filter rules. Advances
    /// `last_processed`/`last_applied`/`safe_resume` as appropriate and
    /// updates the skip/apply counters. Caller is the follower loop, which
    /// decides what to do with a returned `Err` (retry, stop, or bump the
    /// ignore-errors-exhausted tick into the persisted `last_error`).
    pub fn apply(&mut self, marker: &Marker, first_regular_tick: Tick) -> Result<(), ApplyError> {
        if should_skip(marker, first_regular_tick, &self.config, &self.registry) {
            self.state.record_skipped();
            self.state.advance(TickKind::LastProcessed, marker.tick());
            return Ok(());
        }

        self.dispatch(marker)?;

        self.state.record_applied();
        let tick = marker.tick();
        self.state.advance(TickKind::LastProcessed, tick);
        self.state.advance(TickKind::LastApplied, tick);
        if self.registry.is_empty() {
            self.state.advance(TickKind::SafeResume, tick);
        }
        Ok(())
    }

    fn dispatch(&mut self, marker: &Marker) -> Result<(), ApplyError> {
        match marker {
            Marker::DocInsert {
                tick,
                tid,
                cid,
                cname,
                key,
                rev,
                data,
                is_edge,
            } => self.apply_doc_write(*tick, *tid, *cid, cname.as_deref(), key, *rev, data.clone(), *is_edge),
            Marker::DocRemove {
                tick,
                tid,
                cid,
                cname,
                key,
                rev,
            } => self.apply_doc_remove(*tick, *tid, *cid, cname.as_deref(), key, *rev),
            Marker::TxnStart { tick, tid } => match self.storage.begin() {
                Ok(handle) => {
                    self.registry.start(*tid, handle);
                    Ok(())
                }
                Err(e) => self.finish_storage_result(*tick, false, Err(e)),
            },
            Marker::TxnCommit { tick, tid } => self.finish_transaction(*tick, *tid, true),
            Marker::TxnAbort { tick, tid } => self.finish_transaction(*tick, *tid, false),
            Marker::ColCreate { tick, cid, collection } => {
                let name = collection.get("name").and_then(|v| v.as_str());
                let local_cid = self.storage.resolve_collection(*cid, name);
                let result = self.storage.collection_create(local_cid, collection.clone());
                self.finish_storage_result(*tick, false, result)
            }
            Marker::ColDrop { tick, cid } => {
                let result = self.storage.collection_drop(*cid);
                self.finish_storage_result(*tick, false, result)
            }
            Marker::ColRename { tick, cid, new_name } => {
                let result = self.storage.collection_rename(*cid, new_name);
                self.finish_storage_result(*tick, false, result)
            }
            Marker::ColChange { tick, cid, properties } => {
                let change = CollectionChange::from_payload(properties);
                let result = self.storage.collection_change(*cid, change);
                self.finish_storage_result(*tick, false, result)
            }
            Marker::IdxCreate { tick, cid, index } => {
                let result = self.storage.index_create(*cid, index.clone());
                self.finish_storage_result(*tick, false, result)
            }
            Marker::IdxDrop { tick, cid, idx } => {
                let result = self.storage.index_drop(*cid, *idx);
                self.finish_storage_result(*tick, false, result)
            }
        }
    }

    fn apply_doc_write(
        &mut self,
        tick: Tick,
        tid: Option<applier_net::TransactionId>,
        cid: applier_net::CollectionId,
        cname: Option<&str>,
        key: &str,
        rev: u64,
        data: serde_json::Value,
        is_edge: bool,
    ) -> Result<(), ApplyError> {
        let local_cid = self.storage.resolve_collection(cid, cname);
        let is_system = self.storage.is_system_collection(local_cid);

        match tid {
            None => {
                let result = (|| -> Result<(), StorageError> {
                    let mut handle = self.storage.begin()?;
                    let exists = handle.exists(local_cid, key)?;
                    let op = if exists {
                        handle.update(local_cid, key, rev, data.clone())
                    } else {
                        handle.insert(local_cid, key, rev, data.clone(), is_edge)
                    };
                    match op {
                        Ok(()) => handle.commit(),
                        Err(e) => {
                            let _ = handle.abort();
                            Err(e)
                        }
                    }
                })();
                self.finish_storage_result(tick, is_system, result)
            }
            Some(t) => match self.registry.live(t) {
                LiveLookup::Missing | LiveLookup::Placeholder => {
                    Err(ApplyError::UnexpectedTransaction { tid: t })
                }
                LiveLookup::Handle(handle) => {
                    let result = (|| -> Result<(), StorageError> {
                        let exists = handle.exists(local_cid, key)?;
                        if exists {
                            handle.update(local_cid, key, rev, data.clone())
                        } else {
                            handle.insert(local_cid, key, rev, data.clone(), is_edge)
                        }
                    })();
                    self.finish_storage_result(tick, is_system, result)
                }
            },
        }
    }

    fn apply_doc_remove(
        &mut self,
        tick: Tick,
        tid: Option<applier_net::TransactionId>,
        cid: applier_net::CollectionId,
        cname: Option<&str>,
        key: &str,
        rev: u64,
    ) -> Result<(), ApplyError> {
        let local_cid = self.storage.resolve_collection(cid, cname);
        let is_system = self.storage.is_system_collection(local_cid);

        match tid {
            None => {
                let result = (|| -> Result<(), StorageError> {
                    let mut handle = self.storage.begin()?;
                    match handle.remove(local_cid, key, rev) {
                        Ok(()) => handle.commit(),
                        Err(e) => {
                            let _ = handle.abort();
                            Err(e)
                        }
                    }
                })();
                self.finish_storage_result(tick, is_system, result)
            }
            Some(t) => match self.registry.live(t) {
                LiveLookup::Missing | LiveLookup::Placeholder => {
                    Err(ApplyError::UnexpectedTransaction { tid: t })
                }
                LiveLookup::Handle(handle) => {
                    let result = handle.remove(local_cid, key, rev);
                    self.finish_storage_result(tick, is_system, result)
                }
            },
        }
    }

    fn finish_transaction(
        &mut self,
        tick: Tick,
        tid: applier_net::TransactionId,
        commit: bool,
    ) -> Result<(), ApplyError> {
        match self.registry.take(tid) {
            None => Err(ApplyError::UnexpectedMarker { tick }),
            Some(None) => Ok(()),
            Some(Some(handle)) => {
                let result = if commit { handle.commit() } else { handle.abort() };
                self.finish_storage_result(tick, false, result)
            }
        }
    }

    /// Routes a storage-layer failure through the idempotence and
    /// ignore-errors rules. A unique-constraint or not-found conflict on a
    /// system collection is swallowed outright — replaying the replication
    /// log against a collection that already converged must be a no-op.
    /// Anything else is either skipped against the configured budget (with
    /// a warning) or surfaced as a fatal `Storage` error.
    fn finish_storage_result(
        &mut self,
        tick: Tick,
        is_system: bool,
        result: Result<(), StorageError>,
    ) -> Result<(), ApplyError> {
        match result {
            Ok(()) => Ok(()),
            Err(StorageError::UniqueConstraintViolated) | Err(StorageError::NotFound) if is_system => {
                Ok(())
            }
            Err(e) => {
                if self.ignore_errors_remaining > 0 {
                    self.ignore_errors_remaining -= 1;
                    self.state.record_skipped();
                    tracing::warn!(target: "applier", %tick, error = %e, "skipping marker after storage error");
                    Ok(())
                } else {
                    Err(ApplyError::Storage {
                        tick,
                        message: ApplyError::truncate_marker_text(&e.to_string()),
                    })
                }
            }
        }
    }
}
