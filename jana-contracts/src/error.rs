use thiserror::Error;

/// Errors a factory (or the engine acting on its behalf) can report while
/// resolving a `(result-type, tag)` pair for an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    /// No factory is registered for the requested `(type, tag)` pair.
    #[error("no factory registered for tag {tag:?}")]
    Missing { tag: String },

    /// A factory's `process` was re-entered while already running for the
    /// same event, i.e. the call graph has a cycle.
    #[error("factory cycle detected at tag {tag:?}")]
    Cycle { tag: String },

    /// The caller requested a type that does not match what the factory
    /// actually produces. Indicates a programming error, not user input.
    #[error("factory at tag {tag:?} does not produce the requested type")]
    TypeMismatch { tag: String },

    /// The user's `init`, `change_run`, or `process` callback returned an
    /// error. Carries a human-readable message; the offending event is
    /// dropped by the caller unless fail-fast is configured.
    #[error("user callback failed: {0}")]
    User(String),
}
