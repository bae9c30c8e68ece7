//! Composition root: reads the handful of environment variables this
//! component bootstraps itself from, wires an [`applier_net::HttpWireClient`]
//! and a caller-supplied [`applier_storage::StorageCollaborator`] into a
//! [`applier_core::Syncer`], and hands it back ready to run. CLI parsing,
//! daemonization, and config-file loading are a layer above this one and out
//! of scope here.

use std::env;
use std::sync::Arc;

use applier_base::{err, Error};
use applier_net::{HttpWireClient, ServerId, Tick};
use applier_storage::StorageCollaborator;

use applier_core::{Config, RestrictType, Syncer};

/// The bootstrap parameters read from the process environment.
pub struct EnvBootstrap {
    pub master_url: String,
    pub own_server_id: ServerId,
    pub state_path: String,
    pub initial_tick: Tick,
    pub config: Config,
}

fn env_var(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| err(format!("missing required environment variable {name}")))
}

fn env_flag(name: &str, default: bool) -> Result<bool, Error> {
    match env::var(name) {
        Ok(v) => v
            .parse::<bool>()
            .map_err(|_| err(format!("malformed boolean in {name}"))),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, Error> {
    match env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| err(format!("malformed integer in {name}"))),
        Err(_) => Ok(default),
    }
}

impl EnvBootstrap {
    /// Reads `APPLIER_MASTER_URL`, `APPLIER_SERVER_ID`, `APPLIER_STATE_PATH`
    /// (all required), `APPLIER_INITIAL_TICK` (default 0), and the
    /// configuration options table from their `APPLIER_*` equivalents.
    pub fn from_env() -> Result<Self, Error> {
        let master_url = env_var("APPLIER_MASTER_URL")?;
        let own_server_id = env_var("APPLIER_SERVER_ID")?
            .parse::<u64>()
            .map(ServerId)
            .map_err(|_| err("APPLIER_SERVER_ID must be a decimal integer"))?;
        let state_path = env_var("APPLIER_STATE_PATH")?;
        let initial_tick = Tick(env_u64("APPLIER_INITIAL_TICK", 0)?);

        let defaults = Config::default();
        let restrict_type = match env::var("APPLIER_RESTRICT_TYPE").as_deref() {
            Ok("include") => RestrictType::Include,
            Ok("exclude") => RestrictType::Exclude,
            Ok("none") | Err(_) => RestrictType::None,
            Ok(other) => return Err(err(format!("unknown APPLIER_RESTRICT_TYPE: {other}"))),
        };
        let restrict_collections = env::var("APPLIER_RESTRICT_COLLECTIONS")
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default();

        let config = Config {
            chunk_size: env_u64("APPLIER_CHUNK_SIZE", defaults.chunk_size as u64)? as usize,
            include_system: env_flag("APPLIER_INCLUDE_SYSTEM", defaults.include_system)?,
            restrict_type,
            restrict_collections,
            require_from_present: env_flag(
                "APPLIER_REQUIRE_FROM_PRESENT",
                defaults.require_from_present,
            )?,
            verbose: env_flag("APPLIER_VERBOSE", defaults.verbose)?,
            max_connect_retries: env_u64(
                "APPLIER_MAX_CONNECT_RETRIES",
                defaults.max_connect_retries as u64,
            )? as u32,
            ignore_errors: env_u64("APPLIER_IGNORE_ERRORS", defaults.ignore_errors as u64)? as i64,
            adaptive_polling: env_flag("APPLIER_ADAPTIVE_POLLING", defaults.adaptive_polling)?,
        };

        Ok(EnvBootstrap {
            master_url,
            own_server_id,
            state_path,
            initial_tick,
            config,
        })
    }
}

/// Builds a ready-to-run [`Syncer`] against a real HTTP master, using
/// whatever [`StorageCollaborator`] the caller provides. Returns the syncer
/// and the initial tick to pass to [`Syncer::run`].
pub fn build_syncer<S: StorageCollaborator>(
    bootstrap: EnvBootstrap,
    storage: Arc<S>,
) -> Result<(Syncer<HttpWireClient, S>, Tick), applier_core::ApplyError> {
    let wire = HttpWireClient::new(bootstrap.master_url, bootstrap.own_server_id);
    let state_store: Box<dyn applier_core::StateStore> =
        Box::new(applier_core::FileStateStore::new(bootstrap.state_path));
    let syncer = Syncer::new(wire, storage, state_store, bootstrap.config)?;
    Ok((syncer, bootstrap.initial_tick))
}
