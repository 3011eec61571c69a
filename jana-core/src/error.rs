use thiserror::Error;

use jana_contracts::FactoryError;

/// Top-level engine error categories, per the run-level propagation policy:
/// `QueueFull`/`PoolEmpty`/source-try-again are folded into
/// [`crate::metrics::ArrowStatus::ComeBackLater`] by arrow callers and never
/// reach here; everything in this enum either aborts the run or is surfaced
/// to an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to load plugin {name:?}: {reason}")]
    PluginLoad { name: String, reason: String },

    #[error("failed to open event source {name:?}: {reason}")]
    SourceOpen { name: String, reason: String },

    #[error("factory error: {0}")]
    Factory(#[from] FactoryError),

    #[error("user callback failed for event {event_number}: {message}")]
    User { event_number: u64, message: String },

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether this error should abort the run (per spec.md §7's
    /// propagation policy), as opposed to being logged-and-continued.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::User { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
