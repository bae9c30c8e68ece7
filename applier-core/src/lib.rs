//! The follower's brain: configuration, persisted state, the transaction
//! registry, marker filtering, the apply engine, and the control loop that
//! ties them to a [`applier_net::WireClient`] and an
//! [`applier_storage::StorageCollaborator`].

mod apply;
mod config;
mod error;
mod filter;
mod progress;
mod registry;
mod state;
mod syncer;

pub use apply::ApplyEngine;
pub use config::{Config, RestrictType};
pub use error::ApplyError;
pub use filter::should_skip;
pub use progress::Progress;
pub use registry::{Entry, LiveLookup, TransactionRegistry};
pub use state::{
    require_matching_server_id, ApplierState, FileStateStore, MemoryStateStore, StateHandle,
    StateStore, TickKind,
};
pub use syncer::{StopFlag, Syncer, Timings};
