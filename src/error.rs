use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which pipeline phase a submission failed in. Attached to [`Error::Rejected`]
/// so the submitter can distinguish terminal rejects from transient faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Conformance,
    Duplicate,
    Crypto,
    AuthChain,
    Prev,
    Authorize,
    Persist,
    Publish,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Conformance => "conformance",
            Phase::Duplicate => "duplicate",
            Phase::Crypto => "crypto",
            Phase::AuthChain => "auth_chain",
            Phase::Prev => "prev",
            Phase::Authorize => "authorize",
            Phase::Persist => "persist",
            Phase::Publish => "publish",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed event: {0}")]
    Conformance(String),
    #[error("event exceeds maximum size of {max} bytes ({size})")]
    EventTooLarge { size: usize, max: usize },
    #[error("bad json: {0}")]
    BadJson(String),
    #[error("cryptographic check failed: {0}")]
    Crypto(String),
    #[error("not authorized: {0}")]
    Auth(String),
    #[error("state missing: {0}")]
    StateMissing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("protocol violation from {peer}: {reason}")]
    Protocol { peer: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("interrupted")]
    Interrupted,
    #[error("timed out")]
    Timeout,
    #[error("{phase} phase: {source}")]
    Rejected {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Annotate an error with the VM phase it surfaced in. Idempotent so
    /// phase-boundary catches do not nest.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Error::Rejected { .. } => self,
            other => Error::Rejected {
                phase,
                source: Box::new(other),
            },
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Rejected { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Transient errors are retried by the VM with backoff; everything else
    /// is a terminal reject.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage(_) | Error::Timeout => true,
            Error::Rejected { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
