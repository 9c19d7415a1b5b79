//! Error types for the coordination kernel.
//!
//! Every fallible operation surfaces one of five machine-readable codes:
//!
//! - `VALIDATION_FAILED`: malformed input, unknown entity, bad state transition
//! - `LOCKED`: resource or worker held by another owner (back off and retry)
//! - `STALE_REVISION`: optimistic-concurrency conflict at the store layer
//! - `PANIC_MODE`: global write freeze is active
//! - `INTERNAL_ERROR`: persistence failure or retry exhaustion
//!
//! Lower layers never reinterpret errors from layers above them. The
//! transaction runner retries only `StaleRevision` and passes everything
//! else straight through.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for all kernel operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed input, unknown entity reference, or invalid state transition.
    /// Safe to retry after correcting the input.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The resource (or worker) is held by another owner.
    #[error("resource '{resource}' is locked by '{holder}'")]
    Locked {
        /// The contended resource (normalized path or worker reference).
        resource: String,
        /// The conflicting holder's owner id.
        holder: String,
    },

    /// Optimistic-concurrency conflict: the document moved underneath the
    /// caller. Absorbed by the transaction runner's retry loop.
    #[error("stale revision: expected {expected}, found {actual}")]
    StaleRevision {
        /// The revision the caller read before computing its update.
        expected: u64,
        /// The revision actually on disk.
        actual: u64,
    },

    /// The global write freeze is active; only the panic toggle itself and
    /// recovery operations are permitted.
    #[error("panic mode is active - mutating operations are frozen")]
    PanicMode,

    /// Persistence failure, on-disk corruption, or retry exhaustion. Fatal
    /// for the calling operation; on-disk state is never corrupted because
    /// writes are atomic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable error code (`SCREAMING_SNAKE_CASE`), stable across
    /// releases and propagated verbatim to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::Locked { .. } => "LOCKED",
            Self::StaleRevision { .. } => "STALE_REVISION",
            Self::PanicMode => "PANIC_MODE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Semantic exit code for CLI-facing callers.
    ///
    /// - 1: user error (validation, bad input)
    /// - 2: system error (persistence, retry exhaustion)
    /// - 3: contention or freeze (locked, panic mode)
    /// - 4: state conflict (stale revision)
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ValidationFailed(_) => 1,
            Self::Internal(_) => 2,
            Self::Locked { .. } | Self::PanicMode => 3,
            Self::StaleRevision { .. } => 4,
        }
    }

    /// Whether a caller may reasonably retry the operation later without
    /// changing its input.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::StaleRevision { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationFailed(err.to_string())
    }
}
