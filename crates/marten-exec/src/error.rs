//! Execution-layer errors.

use thiserror::Error;

/// Recoverable errors surfaced by the trampoline.
///
/// Contract breaches (an unknown stop descriptor, a stale frame handle)
/// are not represented here: they panic at the point of detection, since
/// they mean the compiler/runtime contract itself was violated.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The guarded recursion check rejected a nested entry before any
    /// native code ran. The interpreter surfaces this as its ordinary
    /// overflow condition.
    #[error("compiled-unit entry depth {depth} reached the limit of {limit}")]
    DepthExceeded {
        /// Nesting depth at the attempted entry.
        depth: usize,
        /// Configured limit (see `max_enter_depth`).
        limit: usize,
    },
}

/// Result type for trampoline operations.
pub type Result<T> = std::result::Result<T, ExecError>;
