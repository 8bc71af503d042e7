//! Write-barrier hook toward the collector.
//!
//! Growing a frame rewrites an already-published record wholesale; if the
//! collector is generational it must hear about that, since the rewritten
//! frame may now point at younger objects than its own generation.

use crate::frame::FrameHandle;

/// Collector-side notification for bulk frame mutation.
pub trait Barrier: Send + Sync {
    /// The frame behind `handle` was rewritten outside the collector's
    /// sight and should be treated as freshly mutated.
    fn frame_mutated(&self, handle: FrameHandle);
}

/// Barrier that drops every notification, for collectors (and tests)
/// that rescan everything anyway.
#[derive(Debug, Default)]
pub struct NullBarrier;

impl Barrier for NullBarrier {
    fn frame_mutated(&self, _handle: FrameHandle) {}
}
