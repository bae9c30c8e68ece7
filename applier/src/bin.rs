//! Thin binary entry point. Reads its bootstrap parameters from the
//! environment and runs a [`applier_core::Syncer`] to completion or fatal
//! error. The storage collaborator wired in here is the in-memory stand-in
//! from `applier-storage`; a real deployment swaps it for its own
//! transactional collection store — this crate does not own that side of
//! the boundary.

use std::sync::Arc;

use applier_storage::memory::MemoryStorage;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bootstrap = match applier::EnvBootstrap::from_env() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(target: "applier", error = %e, "failed to read bootstrap environment");
            std::process::exit(1);
        }
    };

    let storage = Arc::new(MemoryStorage::new());
    let (mut syncer, initial_tick) = match applier::build_syncer(bootstrap, storage) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(target: "applier", error = %e, "failed to build syncer");
            std::process::exit(1);
        }
    };

    match syncer.run(initial_tick) {
        Ok(()) => {}
        Err(e) if e.is_stopped() => {
            tracing::info!(target: "applier", "stopped");
        }
        Err(e) => {
            tracing::error!(target: "applier", error = %e, "applier stopped with a fatal error");
            std::process::exit(1);
        }
    }
}
