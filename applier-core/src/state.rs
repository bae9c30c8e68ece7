use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use applier_base::{err, Error};
use applier_net::{ServerId, Tick};

/// Durable applier state. Round-trip equivalence through
/// [`StateStore::save`]/[`StateStore::load`] is the only contract on the
/// persisted representation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplierState {
    pub master_server_id: Option<ServerId>,
    pub active: bool,
    pub last_applied_tick: Tick,
    pub last_processed_tick: Tick,
    pub safe_resume_tick: Tick,
    pub last_available_tick: Tick,
    pub total_requests: u64,
    pub failed_connects: u64,
    pub skipped_operations: u64,
    pub events_applied: u64,
    pub last_error: Option<String>,
}

impl ApplierState {
    /// A freshly initialized state: all ticks zero, counters zero,
    /// `master_server_id` unset so the follower loop knows to seed it on
    /// the first successful handshake.
    pub fn fresh() -> Self {
        ApplierState::default()
    }

    pub fn is_uninitialized(&self) -> bool {
        self.master_server_id.is_none()
    }

    /// `safe_resume <= last_applied <= last_processed <= last_available`,
    /// and none of these four ever decreases.
    pub fn check_tick_invariant(&self) -> bool {
        self.safe_resume_tick <= self.last_applied_tick
            && self.last_applied_tick <= self.last_processed_tick
            && self.last_processed_tick <= self.last_available_tick
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickKind {
    LastProcessed,
    LastApplied,
    SafeResume,
    LastAvailable,
}

/// Thread-owned handle around `ApplierState`. The worker runs single
/// threaded but the lock still exists, taken only for short critical
/// sections, so progress reporting and checkpointing read a consistent
/// snapshot.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<ApplierState>>,
}

impl StateHandle {
    pub fn new(state: ApplierState) -> Self {
        StateHandle {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> ApplierState {
        self.inner.lock().unwrap().clone()
    }

    /// Monotonically updates one tick field. A non-monotonic update (a new
    /// value that wouldn't increase the field) is silently ignored — it is
    /// not an error.
    pub fn advance(&self, kind: TickKind, tick: Tick) {
        let mut state = self.inner.lock().unwrap();
        let field = match kind {
            TickKind::LastProcessed => &mut state.last_processed_tick,
            TickKind::LastApplied => &mut state.last_applied_tick,
            TickKind::SafeResume => &mut state.safe_resume_tick,
            TickKind::LastAvailable => &mut state.last_available_tick,
        };
        if tick > *field {
            *field = tick;
        }
    }

    pub fn set_master_server_id(&self, id: ServerId) {
        self.inner.lock().unwrap().master_server_id = Some(id);
    }

    pub fn record_failed_connect(&self) {
        self.inner.lock().unwrap().failed_connects += 1;
    }

    pub fn record_total_request(&self) {
        self.inner.lock().unwrap().total_requests += 1;
    }

    pub fn record_skipped(&self) {
        self.inner.lock().unwrap().skipped_operations += 1;
    }

    pub fn record_applied(&self) {
        self.inner.lock().unwrap().events_applied += 1;
    }

    pub fn set_active(&self, active: bool) {
        self.inner.lock().unwrap().active = active;
    }

    pub fn set_last_error(&self, message: Option<String>) {
        self.inner.lock().unwrap().last_error = message;
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut ApplierState) -> R) -> R {
        let mut state = self.inner.lock().unwrap();
        f(&mut state)
    }
}

/// Persistence for the one small `ApplierState` record per replicated
/// database.
pub trait StateStore: Send {
    /// Returns a freshly initialized state if no record exists yet.
    fn load(&self) -> Result<ApplierState, Error>;

    /// Writes atomically. Failures do not abort the applier by themselves —
    /// they are returned here so the caller can decide how to log and react
    /// to them, not swallowed in this layer.
    fn save(&self, state: &ApplierState, durable: bool) -> Result<(), Error>;
}

/// File-backed `StateStore`. Uses MessagePack (already a teacher
/// dependency for wire serialization) for the on-disk record; the format is
/// not part of the external contract, only round-trip equivalence is.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStore { path: path.into() }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<ApplierState, Error> {
        match fs::read(&self.path) {
            Ok(bytes) => rmp_serde::from_slice(&bytes).map_err(Error::from),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ApplierState::fresh()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn save(&self, state: &ApplierState, durable: bool) -> Result<(), Error> {
        let bytes = rmp_serde::to_vec(state).map_err(Error::from)?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, &bytes).map_err(Error::from)?;
        if durable {
            if let Ok(f) = fs::File::open(&tmp) {
                let _ = f.sync_all();
            }
        }
        fs::rename(&tmp, &self.path).map_err(Error::from)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// In-memory `StateStore`, used by tests and by `Syncer` unit tests that
/// don't want filesystem side effects.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Option<ApplierState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }

    pub fn seed(state: ApplierState) -> Self {
        MemoryStateStore {
            inner: Mutex::new(Some(state)),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<ApplierState, Error> {
        Ok(self.inner.lock().unwrap().clone().unwrap_or_default())
    }

    fn save(&self, state: &ApplierState, _durable: bool) -> Result<(), Error> {
        *self.inner.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

pub fn require_matching_server_id(loaded: Option<ServerId>, handshake: ServerId) -> Result<(), Error> {
    if let Some(loaded) = loaded {
        if loaded != handshake {
            return Err(err(format!(
                "master changed: persisted {loaded}, handshake {handshake}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn advance_is_monotonic_and_silent_on_regression() {
        let handle = StateHandle::new(ApplierState::fresh());
        handle.advance(TickKind::LastProcessed, Tick(100));
        assert_eq!(handle.snapshot().last_processed_tick, Tick(100));
        handle.advance(TickKind::LastProcessed, Tick(50));
        assert_eq!(handle.snapshot().last_processed_tick, Tick(100));
        handle.advance(TickKind::LastProcessed, Tick(150));
        assert_eq!(handle.snapshot().last_processed_tick, Tick(150));
    }

    #[test]
    fn fresh_state_is_uninitialized() {
        assert!(ApplierState::fresh().is_uninitialized());
        let mut s = ApplierState::fresh();
        s.master_server_id = Some(ServerId(1));
        assert!(!s.is_uninitialized());
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStateStore::new();
        let mut state = ApplierState::fresh();
        state.last_applied_tick = Tick(42);
        store.save(&state, true).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn file_store_round_trips() {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NONCE: AtomicU64 = AtomicU64::new(0);
        let n = NONCE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "applier-state-test-{}-{}.mp",
            std::process::id(),
            n
        ));
        let store = FileStateStore::new(&path);
        let mut state = ApplierState::fresh();
        state.master_server_id = Some(ServerId(42));
        state.safe_resume_tick = Tick(7);
        store.save(&state, true).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn server_id_mismatch_is_fatal() {
        assert!(require_matching_server_id(Some(ServerId(42)), ServerId(77)).is_err());
        assert!(require_matching_server_id(Some(ServerId(42)), ServerId(42)).is_ok());
        assert!(require_matching_server_id(None, ServerId(42)).is_ok());
    }
}
