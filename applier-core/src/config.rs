/// The recognized configuration options. Parsing these from a file or CLI is
/// out of scope here; this struct is the contract a bootstrapping layer
/// constructs and hands to a [`crate::syncer::Syncer`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes hint to the master per follow-log batch.
    pub chunk_size: usize,
    /// Include markers whose collection name starts with `_`.
    pub include_system: bool,
    pub restrict_type: RestrictType,
    pub restrict_collections: std::collections::BTreeSet<String>,
    /// Fail fatally if the master cannot serve from the resume tick.
    pub require_from_present: bool,
    /// Emit progress strings to the info log.
    pub verbose: bool,
    /// Cap for transient `NoResponse`/`MasterError` retries.
    pub max_connect_retries: u32,
    /// Budget of per-marker apply errors to skip with a warning.
    pub ignore_errors: i64,
    /// Multiply idle sleep by 2/3/5 after 15/30/60 idle cycles.
    pub adaptive_polling: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestrictType {
    None,
    Include,
    Exclude,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: 262_144,
            include_system: false,
            restrict_type: RestrictType::None,
            restrict_collections: Default::default(),
            require_from_present: false,
            verbose: false,
            max_connect_retries: 5,
            ignore_errors: 0,
            adaptive_polling: true,
        }
    }
}
