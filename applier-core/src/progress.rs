use applier_net::{ServerId, Tick};

use crate::state::ApplierState;

/// A human-readable snapshot of follower progress, the shape logged at
/// `info` level every cycle when `Config::verbose` is set, and returned to
/// an operator asking "how far behind is this applier".
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub master_server_id: Option<ServerId>,
    pub active: bool,
    pub last_applied_tick: Tick,
    pub last_processed_tick: Tick,
    pub safe_resume_tick: Tick,
    pub last_available_tick: Tick,
    pub lag: u64,
    pub total_requests: u64,
    pub failed_connects: u64,
    pub skipped_operations: u64,
    pub events_applied: u64,
    pub last_error: Option<String>,
}

impl Progress {
    pub fn from_state(state: &ApplierState) -> Self {
        let lag = state
            .last_available_tick
            .0
            .saturating_sub(state.last_applied_tick.0);
        Progress {
            master_server_id: state.master_server_id,
            active: state.active,
            last_applied_tick: state.last_applied_tick,
            last_processed_tick: state.last_processed_tick,
            safe_resume_tick: state.safe_resume_tick,
            last_available_tick: state.last_available_tick,
            lag,
            total_requests: state.total_requests,
            failed_connects: state.failed_connects,
            skipped_operations: state.skipped_operations,
            events_applied: state.events_applied,
            last_error: state.last_error.clone(),
        }
    }

    pub fn log(&self) {
        tracing::info!(
            target: "applier",
            master_server_id = ?self.master_server_id,
            active = self.active,
            last_applied = %self.last_applied_tick,
            last_processed = %self.last_processed_tick,
            safe_resume = %self.safe_resume_tick,
            last_available = %self.last_available_tick,
            lag,
            requests = self.total_requests,
            failed_connects = self.failed_connects,
            skipped = self.skipped_operations,
            applied = self.events_applied,
            "follower progress",
        );
    }
}
