use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use applier_net::{decode_markers, Tick, TransactionId, WireClient};
use applier_storage::StorageCollaborator;

use crate::apply::ApplyEngine;
use crate::config::Config;
use crate::error::ApplyError;
use crate::progress::Progress;
use crate::state::{require_matching_server_id, StateHandle, StateStore, TickKind};

/// Shared flag an operator (or a signal handler) flips to ask a [`Syncer`]
/// to stop at the next safe boundary. Checked inside [`Syncer::wait`] and
/// between follow-log batches; never mid-marker.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The two retry wait durations: `NoResponse` backs off for 10s, a
/// `MasterError` response for 30s. Exposed as a field (rather than hardcoded
/// constants) so tests can shrink them instead of taking a real 10-30s hit
/// per retried call; production code should leave this at [`Timings::default`].
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    pub no_response_wait: Duration,
    pub master_error_wait: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            no_response_wait: Duration::from_secs(10),
            master_error_wait: Duration::from_secs(30),
        }
    }
}

/// Top-level control loop: handshake, the open-transactions bridge, and the
/// adaptively-polled follow-log loop. Owns one [`ApplyEngine`] and drives it
/// against whatever [`WireClient`] and durable [`StateStore`] it was built
/// with — a real HTTP master and file-backed state in production, in-memory
/// doubles in tests.
pub struct Syncer<W, S> {
    wire: W,
    state_store: Box<dyn StateStore>,
    config: Config,
    stop: StopFlag,
    state: StateHandle,
    apply_engine: ApplyEngine<S>,
    timings: Timings,
}

impl<W: WireClient, S: StorageCollaborator> Syncer<W, S> {
    pub fn new(
        wire: W,
        storage: Arc<S>,
        state_store: Box<dyn StateStore>,
        config: Config,
    ) -> Result<Self, ApplyError> {
        let loaded = state_store.load().map_err(|e| {
            ApplyError::InvalidResponse(format!("failed to load persisted state: {e}"))
        })?;
        let state = StateHandle::new(loaded);
        let apply_engine = ApplyEngine::new(storage, config.clone(), state.clone());
        Ok(Syncer {
            wire,
            state_store,
            config,
            stop: StopFlag::new(),
            state,
            apply_engine,
            timings: Timings::default(),
        })
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Whether a transaction id has a live or placeholder entry in the
    /// open-transaction registry. Exposed mainly for tests that check the
    /// open-transactions bridge seeded the registry it claimed to.
    pub fn has_open_transaction(&self, tid: TransactionId) -> bool {
        self.apply_engine.registry().contains(tid)
    }

    /// Runs until a fatal error, a clean stop, or (in a real deployment)
    /// forever. `initial_tick` is only consulted when there is no durable
    /// `lastAppliedTick` to resume from yet.
    pub fn run(&mut self, initial_tick: Tick) -> Result<(), ApplyError> {
        let info = self.handshake()?;

        {
            let loaded_server_id = self.state.snapshot().master_server_id;
            require_matching_server_id(loaded_server_id, info.server_id).map_err(|_| {
                ApplyError::MasterChanged {
                    expected: loaded_server_id.unwrap_or_default(),
                    actual: info.server_id,
                }
            })?;
            self.state.set_master_server_id(info.server_id);
        }

        let from_tick = {
            let snapshot = self.state.snapshot();
            if snapshot.last_applied_tick.is_none() {
                initial_tick
            } else {
                snapshot.last_applied_tick
            }
        };
        let first_regular = from_tick;
        let feature_ok = info.supports_open_transactions_bridge();
        let safe_resume = self.state.snapshot().safe_resume_tick;

        let mut fetch_tick = from_tick;
        if feature_ok && !safe_resume.is_none() && safe_resume < from_tick {
            let resp = self.with_retry(|wire| wire.open_transactions(safe_resume, from_tick))?;
            fetch_tick = resp.start_tick;
            for tid in resp.ids {
                self.apply_engine.registry_mut().seed_placeholder(tid);
            }
        }

        self.main_loop(fetch_tick, first_regular, feature_ok)
    }

    fn handshake(&mut self) -> Result<applier_net::MasterInfo, ApplyError> {
        self.with_retry(|wire| wire.master_info())
    }

    fn retry_wait(&self, err: &ApplyError) -> Duration {
        match err {
            ApplyError::NoResponse(_) => self.timings.no_response_wait,
            ApplyError::MasterError { .. } => self.timings.master_error_wait,
            _ => Duration::ZERO,
        }
    }

    fn main_loop(
        &mut self,
        mut fetch_tick: Tick,
        first_regular: Tick,
        use_put_bridge: bool,
    ) -> Result<(), ApplyError> {
        let mut connect_retries = 0u32;
        let mut inactive_cycles = 0u32;

        loop {
            if self.stop.is_stopped() {
                return Err(ApplyError::Stopped);
            }

            let open_ids: Vec<TransactionId> = self.apply_engine.registry().open_ids();
            let call = self.wire.follow_log(
                fetch_tick,
                first_regular,
                self.config.include_system,
                self.config.chunk_size,
                &open_ids,
                use_put_bridge,
            );

            let resp = match call {
                Err(e) => {
                    let apply_err = ApplyError::from(e);
                    if !apply_err.is_retryable() {
                        self.fail(apply_err.to_string());
                        return Err(apply_err);
                    }
                    connect_retries += 1;
                    self.state.record_failed_connect();
                    self.checkpoint(false);
                    if connect_retries > self.config.max_connect_retries {
                        self.fail(apply_err.to_string());
                        return Err(apply_err);
                    }
                    let wait = self.retry_wait(&apply_err);
                    if !self.wait(wait) {
                        return Err(ApplyError::Stopped);
                    }
                    continue;
                }
                Ok(resp) => resp,
            };
            connect_retries = 0;

            if self.config.require_from_present && !resp.from_present && !fetch_tick.is_none() {
                let err = ApplyError::StartTickNotPresent;
                self.fail(err.to_string());
                return Err(err);
            }

            self.state.record_total_request();
            self.state.advance(TickKind::LastAvailable, resp.last_tick);

            let worked = resp.last_included > fetch_tick;
            if worked {
                fetch_tick = resp.last_included;
            }

            let markers = decode_markers(&resp.body, self.config.ignore_errors)
                .map_err(|e| ApplyError::InvalidResponse(e.to_string()))?;

            for marker in &markers {
                if let Err(e) = self.apply_engine.apply(marker, first_regular) {
                    self.fail(e.to_string());
                    return Err(e);
                }
            }
            if !markers.is_empty() {
                self.checkpoint(true);
            }

            if self.config.verbose {
                Progress::from_state(&self.state.snapshot()).log();
            }

            let mut sleep = if worked {
                inactive_cycles = 0;
                Duration::ZERO
            } else if resp.active {
                Duration::from_millis(500)
            } else {
                Duration::from_secs(5)
            };

            if self.config.adaptive_polling && !worked {
                inactive_cycles += 1;
                let multiplier = if inactive_cycles > 60 {
                    5
                } else if inactive_cycles > 30 {
                    3
                } else if inactive_cycles > 15 {
                    2
                } else {
                    1
                };
                sleep *= multiplier;
            }

            if sleep > Duration::ZERO {
                if !self.wait(sleep) {
                    return Err(ApplyError::Stopped);
                }
            } else if self.stop.is_stopped() {
                return Err(ApplyError::Stopped);
            }
        }
    }

    fn fail(&mut self, message: String) {
        self.state.set_last_error(Some(message));
        self.checkpoint(true);
    }

    fn checkpoint(&self, durable: bool) {
        let snapshot = self.state.snapshot();
        if let Err(e) = self.state_store.save(&snapshot, durable) {
            tracing::warn!(target: "applier", error = %e, "failed to persist applier state");
        }
    }

    fn with_retry<T>(
        &mut self,
        mut f: impl FnMut(&W) -> Result<T, applier_net::WireError>,
    ) -> Result<T, ApplyError> {
        let mut attempts = 0u32;
        loop {
            match f(&self.wire) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let apply_err = ApplyError::from(e);
                    if !apply_err.is_retryable() {
                        return Err(apply_err);
                    }
                    attempts += 1;
                    self.state.record_failed_connect();
                    self.checkpoint(false);
                    if attempts > self.config.max_connect_retries {
                        return Err(apply_err);
                    }
                    let wait = self.retry_wait(&apply_err);
                    if !self.wait(wait) {
                        return Err(ApplyError::Stopped);
                    }
                }
            }
        }
    }

    /// Sleeps up to `dur`, polling the stop flag in short slices. Returns
    /// `false` the moment a stop is observed; `true` if the full duration
    /// elapsed uninterrupted.
    fn wait(&self, dur: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::ZERO {
            if self.stop.is_stopped() {
                return false;
            }
            let slice = remaining.min(SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
        !self.stop.is_stopped()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use applier_net::{FollowLogResponse, MasterInfo, OpenTransactionsResponse, ServerId, WireError};
    use applier_storage::memory::MemoryStorage;
    use applier_net::CollectionId;
    use std::sync::Mutex;
    use test_log::test;

    use crate::state::MemoryStateStore;

    /// A scripted [`WireClient`]: each call pops the next canned response
    /// off its queue. Panics if called more times than scripted — tests
    /// assert the loop asks exactly what's expected.
    struct ScriptedWire {
        master_info: Mutex<Vec<Result<MasterInfo, WireError>>>,
        open_transactions: Mutex<Vec<Result<OpenTransactionsResponse, WireError>>>,
        follow_log: Mutex<Vec<Result<FollowLogResponse, WireError>>>,
    }

    impl ScriptedWire {
        fn new(
            master_info: Vec<Result<MasterInfo, WireError>>,
            open_transactions: Vec<Result<OpenTransactionsResponse, WireError>>,
            follow_log: Vec<Result<FollowLogResponse, WireError>>,
        ) -> Self {
            ScriptedWire {
                master_info: Mutex::new(master_info),
                open_transactions: Mutex::new(open_transactions),
                follow_log: Mutex::new(follow_log),
            }
        }
    }

    impl WireClient for ScriptedWire {
        fn master_info(&self) -> Result<MasterInfo, WireError> {
            self.master_info.lock().unwrap().remove(0)
        }

        fn open_transactions(
            &self,
            _from: Tick,
            _to: Tick,
        ) -> Result<OpenTransactionsResponse, WireError> {
            self.open_transactions.lock().unwrap().remove(0)
        }

        fn follow_log(
            &self,
            _fetch_tick: Tick,
            _first_regular: Tick,
            _include_system: bool,
            _chunk_size: usize,
            _open_transactions: &[TransactionId],
            _use_put_bridge: bool,
        ) -> Result<FollowLogResponse, WireError> {
            self.follow_log.lock().unwrap().remove(0)
        }
    }

    fn info(server_id: u64) -> MasterInfo {
        MasterInfo {
            server_id: ServerId(server_id),
            major_version: 2,
            minor_version: 8,
            endpoint: "tcp://test".into(),
        }
    }

    #[test]
    fn cold_start_applies_markers_and_checkpoints() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_collection(CollectionId(7), "things", false);
        let body = "{\"tick\":\"1001\",\"type\":2300,\"cid\":\"7\",\"key\":\"a\",\"rev\":\"1\",\"data\":{}}\n\
                     {\"tick\":\"1002\",\"type\":2302,\"cid\":\"7\",\"key\":\"a\",\"rev\":\"2\"}\n";
        let wire = ScriptedWire::new(
            vec![Ok(info(42))],
            vec![],
            vec![
                Ok(FollowLogResponse {
                    check_more: false,
                    from_present: true,
                    active: true,
                    last_included: Tick(1002),
                    last_tick: Tick(1002),
                    body: body.to_owned(),
                }),
                // ends the loop deterministically after one batch, instead
                // of racing a real stop-flag flip against a background thread
                Err(WireError::InvalidResponse("test harness stop".into())),
            ],
        );
        let state_store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        let mut syncer = Syncer::new(wire, storage.clone(), state_store, Config::default()).unwrap();

        let err = syncer.run(Tick(1000)).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidResponse(_)));

        let snapshot = syncer.state().snapshot();
        assert_eq!(snapshot.master_server_id, Some(ServerId(42)));
        assert_eq!(snapshot.last_applied_tick, Tick(1002));
        assert_eq!(snapshot.safe_resume_tick, Tick(1002));
        assert!(storage.get(CollectionId(7), "a").is_none());
    }

    #[test]
    fn identity_change_is_fatal_before_any_marker_applies() {
        let storage = Arc::new(MemoryStorage::new());
        let wire = ScriptedWire::new(vec![Ok(info(77))], vec![], vec![]);
        let mut seeded = crate::state::ApplierState::fresh();
        seeded.master_server_id = Some(ServerId(42));
        let state_store: Box<dyn StateStore> = Box::new(MemoryStateStore::seed(seeded));
        let mut syncer = Syncer::new(wire, storage, state_store, Config::default()).unwrap();

        let err = syncer.run(Tick(0)).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::MasterChanged { expected, actual }
                if expected == ServerId(42) && actual == ServerId(77)
        ));
    }

    #[test]
    fn from_present_false_is_fatal_when_required() {
        let storage = Arc::new(MemoryStorage::new());
        let wire = ScriptedWire::new(
            vec![Ok(info(42))],
            vec![],
            vec![Ok(FollowLogResponse {
                check_more: false,
                from_present: false,
                active: true,
                last_included: Tick(1000),
                last_tick: Tick(1000),
                body: String::new(),
            })],
        );
        let state_store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        let mut config = Config::default();
        config.require_from_present = true;
        let mut syncer = Syncer::new(wire, storage, state_store, config).unwrap();

        let err = syncer.run(Tick(1000)).unwrap_err();
        assert!(matches!(err, ApplyError::StartTickNotPresent));
    }

    #[test]
    fn open_transactions_bridge_seeds_placeholders_on_resume() {
        let storage = Arc::new(MemoryStorage::new());
        let wire = ScriptedWire::new(
            vec![Ok(info(42))],
            vec![Ok(OpenTransactionsResponse {
                start_tick: Tick(900),
                from_present: true,
                ids: vec![TransactionId(55), TransactionId(56)],
            })],
            vec![
                Ok(FollowLogResponse {
                    check_more: false,
                    from_present: true,
                    active: true,
                    last_included: Tick(950),
                    last_tick: Tick(950),
                    body: String::new(),
                }),
                Err(WireError::InvalidResponse("test harness stop".into())),
            ],
        );
        let mut seeded = crate::state::ApplierState::fresh();
        seeded.last_applied_tick = Tick(1000);
        seeded.safe_resume_tick = Tick(500);
        let state_store: Box<dyn StateStore> = Box::new(MemoryStateStore::seed(seeded));
        let mut syncer = Syncer::new(wire, storage, state_store, Config::default()).unwrap();

        let err = syncer.run(Tick(0)).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidResponse(_)));
        assert!(syncer.has_open_transaction(TransactionId(55)));
        assert!(syncer.has_open_transaction(TransactionId(56)));
    }

    #[test]
    fn transient_errors_retry_then_succeed() {
        let storage = Arc::new(MemoryStorage::new());
        let wire = ScriptedWire::new(
            vec![Ok(info(42))],
            vec![],
            vec![
                Err(WireError::NoResponse("connection refused".into())),
                Err(WireError::NoResponse("connection refused".into())),
                Ok(FollowLogResponse {
                    check_more: false,
                    from_present: true,
                    active: true,
                    last_included: Tick(1001),
                    last_tick: Tick(1001),
                    body: String::new(),
                }),
                Err(WireError::InvalidResponse("test harness stop".into())),
            ],
        );
        let state_store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        let mut syncer = Syncer::new(wire, storage, state_store, Config::default())
            .unwrap()
            .with_timings(Timings {
                no_response_wait: Duration::from_millis(1),
                master_error_wait: Duration::from_millis(1),
            });

        let err = syncer.run(Tick(1000)).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidResponse(_)));
        assert_eq!(syncer.state().snapshot().failed_connects, 2);
    }
}
