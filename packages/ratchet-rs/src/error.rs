//! Structured error types for the coordination core.
//!
//! `EngineError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Callers branch on the variant to decide whether a failure
//! is the caller's fault (`NoMatchingTransition`, `InvalidDefinition`), a
//! concurrency outcome (`Conflict`), or a system fault (`Storage`).
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is internal transport (ergonomic inside store backends and
//!   action handlers)
//! - `EngineError` is the only error type that crosses the crate boundary
//!
//! Action-handler failures never surface here at all: they are absorbed into
//! the transition log as per-action outcomes (see [`crate::dispatch`]).

use thiserror::Error;

/// Errors from predicate-tree evaluation.
///
/// Evaluation is deliberately forgiving: missing fields and unknown operators
/// resolve to a boolean rather than an error. The only hard failure is a leaf
/// that carries neither `field` nor `op` — there is nothing to evaluate.
#[derive(Debug, Error)]
pub enum PredicateError {
    /// A leaf node is missing both `field` and `op`.
    #[error("malformed predicate: {0}")]
    Malformed(String),
}

/// Errors from the state-machine engine and routing engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No machine is registered under this name.
    #[error("unknown machine '{kind}'")]
    UnknownMachine { kind: String },

    /// A machine definition failed validation at registration.
    #[error("invalid machine definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// A firing was attempted but no transition row matched: either no row
    /// exists for `(from, event)` or every guard evaluated false.
    ///
    /// This is a caller error. Nothing was written.
    #[error("no transition for {kind}/{id}: state '{state}' does not accept event '{event}'")]
    NoMatchingTransition {
        kind: String,
        id: String,
        state: String,
        event: String,
    },

    /// A guard or rule condition could not be evaluated.
    #[error(transparent)]
    MalformedPredicate(#[from] PredicateError),

    /// Lock contention or unique-constraint retries exceeded their budget.
    ///
    /// This is expected under concurrency. The operation may be retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation's context was cancelled before the transaction committed.
    ///
    /// Nothing was written. Recoverable by retry.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage backend failed (connection, serialization, constraint).
    ///
    /// This is a system-level failure, not a concurrency issue.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.into())
    }
}

impl EngineError {
    /// True for failures the caller caused and can correct; false for system
    /// faults.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownMachine { .. }
                | EngineError::InvalidDefinition { .. }
                | EngineError::NoMatchingTransition { .. }
                | EngineError::MalformedPredicate(_)
        )
    }
}
