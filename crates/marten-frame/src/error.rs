//! Frame-layer errors.

use thiserror::Error;

/// Errors from frame allocation and growth.
///
/// There is deliberately no recoverable variant for contract breaches
/// (stale handles, kind mismatches, unknown descriptors): those panic at
/// the point of detection, because a frame smaller or differently shaped
/// than its compiled unit expects cannot be run with.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The allocator could not provide backing store for a frame of the
    /// requested slot count. Callers must treat this as fatal; there is
    /// no safe partial state to resume from.
    #[error("frame allocation of {words} slots failed")]
    AllocationFailed {
        /// Requested slot count.
        words: usize,
    },
}

/// Result type for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;
