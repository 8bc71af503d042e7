//! Runtime execution counters.

/// Snapshot of runtime counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeStats {
    /// Number of trampoline entries into compiled code.
    pub enters: u64,
    /// Number of activations that ran to completion.
    pub finishes: u64,
    /// Number of guard failures that reached the trampoline.
    pub guard_failures: u64,
    /// Number of guard failures redirected into an attached bridge.
    pub bridge_transfers: u64,
    /// Number of in-place frame growths.
    pub frame_growths: u64,
    /// Number of entries rejected by the recursion-depth guard.
    pub depth_rejections: u64,
}
