//! Shared per-compiled-unit frame sizing.
//!
//! One `FrameInfo` exists per compiled unit and is referenced by every
//! frame built for it. It records the largest slot count any trace or
//! bridge of that unit has ever needed. It only grows: a frame allocated
//! against an older, smaller depth stays valid until it is explicitly
//! grown to the current one.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Machine word size in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Byte offset of the slot area within the frame layout compiled code
/// addresses: one word each for the info link, the two stop descriptors,
/// the gc map, the scratch stack depth, the saved payload and the pending
/// exception.
pub const FRAME_BASE_OFFSET: usize = 7 * WORD;

/// Grow-only frame sizing shared by all activations of one compiled unit.
///
/// Growth is published with plain atomic stores, so concurrent readers
/// need no lock: a reader either sees the old size (and any frame it
/// already holds is still valid for that size) or the new one.
#[derive(Debug)]
pub struct FrameInfo {
    depth: AtomicUsize,
    size: AtomicUsize,
}

impl FrameInfo {
    /// A fresh info with no slots yet.
    pub fn new() -> Self {
        FrameInfo {
            depth: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// A fresh info already sized for `depth` slots.
    pub fn with_depth(depth: usize) -> Self {
        let info = FrameInfo::new();
        info.update(FRAME_BASE_OFFSET, depth);
        info
    }

    /// Grow the recorded depth to `new_depth` if it is larger.
    ///
    /// Idempotent for smaller or equal depths. The byte size is published
    /// before the depth so a reader acting on the new depth never sees a
    /// stale size.
    pub fn update(&self, base_offset: usize, new_depth: usize) {
        if new_depth <= self.depth.load(Ordering::Acquire) {
            return;
        }
        self.size
            .fetch_max(base_offset + new_depth * WORD, Ordering::AcqRel);
        self.depth.fetch_max(new_depth, Ordering::AcqRel);
    }

    /// Largest slot count observed so far.
    pub fn frame_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Byte size of a frame at the current depth.
    pub fn frame_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

impl Default for FrameInfo {
    fn default() -> Self {
        FrameInfo::new()
    }
}
