use applier_net::{ServerId, Tick, TransactionId};

/// The exhaustive error taxonomy the applier can raise. Every fallible call
/// in this crate returns one of these; the follower loop is the only place
/// that decides what to do about a given variant.
#[derive(Debug)]
pub enum ApplyError {
    /// Transient wire: connection-level failure talking to the master.
    NoResponse(String),
    /// Transient wire: the master answered with an HTTP-level error.
    MasterError { status: u16, message: String },
    /// Protocol: a response the master sent doesn't parse, or is missing
    /// required headers. Fatal — indicates a broken master or version skew.
    InvalidResponse(String),
    /// Resume: the master can no longer serve from the requested tick.
    /// Fatal — operator must do a full resync.
    StartTickNotPresent,
    /// Identity: the master's server id no longer matches what was
    /// persisted at an earlier run. Fatal.
    MasterChanged { expected: ServerId, actual: ServerId },
    /// Transaction protocol: a document op under a `tid` the registry has no
    /// live handle for — either no entry at all, or only a pre-resume
    /// placeholder still waiting on its own `TxnStart` marker. Fatal, budget
    /// does not apply.
    UnexpectedTransaction { tid: TransactionId },
    /// Transaction protocol: `TxnCommit`/`TxnAbort` with no registry entry,
    /// or a marker type that isn't recognized. Fatal, budget does not apply.
    UnexpectedMarker { tick: Tick },
    /// Apply: a storage-collaborator error that has exhausted the
    /// `ignoreErrors` budget. Carries the offending marker, truncated.
    Storage { tick: Tick, message: String },
    /// External: the applier was asked to stop. Clean shutdown, not an
    /// error — callers should not log this as a failure.
    Stopped,
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::NoResponse(msg) => write!(f, "no response from master: {msg}"),
            ApplyError::MasterError { status, message } => {
                write!(f, "master error {status}: {message}")
            }
            ApplyError::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            ApplyError::StartTickNotPresent => {
                write!(f, "requested start tick is no longer present on master")
            }
            ApplyError::MasterChanged { expected, actual } => write!(
                f,
                "master changed: expected server id {expected}, got {actual}"
            ),
            ApplyError::UnexpectedTransaction { tid } => {
                write!(f, "unexpected transaction {tid}")
            }
            ApplyError::UnexpectedMarker { tick } => write!(f, "unexpected marker at tick {tick}"),
            ApplyError::Storage { tick, message } => {
                write!(f, "apply failed at tick {tick}: {message}")
            }
            ApplyError::Stopped => write!(f, "applier stopped"),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<applier_net::WireError> for ApplyError {
    fn from(e: applier_net::WireError) -> Self {
        match e {
            applier_net::WireError::NoResponse(msg) => ApplyError::NoResponse(msg),
            applier_net::WireError::MasterError { status, message } => {
                ApplyError::MasterError { status, message }
            }
            applier_net::WireError::InvalidResponse(msg) => ApplyError::InvalidResponse(msg),
        }
    }
}

impl ApplyError {
    /// Transient wire errors are retried up to `maxConnectRetries` by the
    /// follower loop; everything else is fatal on first occurrence (modulo
    /// the `ignoreErrors` budget already having been applied before a
    /// `Storage` error is constructed).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::NoResponse(_) | ApplyError::MasterError { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ApplyError::Stopped)
    }

    pub fn truncate_marker_text(text: &str) -> String {
        if text.len() > 256 {
            format!("{}...", &text[..256])
        } else {
            text.to_owned()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn only_wire_errors_are_retryable() {
        assert!(ApplyError::NoResponse("x".into()).is_retryable());
        assert!(ApplyError::MasterError { status: 503, message: "x".into() }.is_retryable());
        assert!(!ApplyError::InvalidResponse("x".into()).is_retryable());
        assert!(!ApplyError::StartTickNotPresent.is_retryable());
        assert!(!ApplyError::Stopped.is_retryable());
    }
}
