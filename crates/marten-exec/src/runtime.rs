//! The runtime cell shared by every thread, and the per-thread
//! execution context bound to the execution right.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::thread;

use marten_frame::{Barrier, FrameArena, FrameHandle, GcMapInterner, GcRef};
use smallvec::SmallVec;

use crate::descr::DescrTable;
use crate::right::{ExecutionRight, SavedRoots};
use crate::stats::RuntimeStats;
use crate::trampoline::CompiledUnit;

/// Mutable runtime state: touched only by the thread holding the
/// execution right.
#[derive(Default)]
pub struct RuntimeCore {
    /// Every live frame.
    pub arena: FrameArena,
    /// Every registered stop descriptor.
    pub descrs: DescrTable,
    /// Shared liveness maps.
    pub gcmaps: GcMapInterner,
    /// Execution counters.
    pub stats: RuntimeStats,
}

/// Process-wide JIT runtime: the execution right plus the state it
/// guards.
pub struct JitRuntime {
    right: ExecutionRight,
    core: UnsafeCell<RuntimeCore>,
}

// SAFETY: `core` is only ever accessed through an `ExecContext`, which
// exists exactly while its thread holds the execution right, so no two
// threads touch it concurrently.
unsafe impl Send for JitRuntime {}
unsafe impl Sync for JitRuntime {}

impl JitRuntime {
    /// A runtime whose frame growths report to nobody.
    pub fn new() -> Self {
        JitRuntime {
            right: ExecutionRight::new(),
            core: UnsafeCell::new(RuntimeCore::default()),
        }
    }

    /// A runtime whose frame arena reports bulk mutation to `barrier`.
    pub fn with_barrier(barrier: Box<dyn Barrier>) -> Self {
        JitRuntime {
            right: ExecutionRight::new(),
            core: UnsafeCell::new(RuntimeCore {
                arena: FrameArena::with_barrier(barrier),
                ..RuntimeCore::default()
            }),
        }
    }

    /// Block until the execution right is free, then bind it to this
    /// thread. The returned context is the only door to the runtime
    /// core; dropping it releases the right.
    pub fn attach(&self) -> ExecContext<'_> {
        self.right.acquire();
        ExecContext {
            rt: self,
            depth: 0,
            live_frames: SmallVec::new(),
            current_unit: None,
            holding: true,
        }
    }

    pub(crate) fn right(&self) -> &ExecutionRight {
        &self.right
    }
}

impl Default for JitRuntime {
    fn default() -> Self {
        JitRuntime::new()
    }
}

/// Per-thread execution context, alive exactly while this thread holds
/// the execution right (except inside [`ExecContext::external_call`]).
pub struct ExecContext<'rt> {
    pub(crate) rt: &'rt JitRuntime,
    pub(crate) depth: usize,
    pub(crate) live_frames: SmallVec<[FrameHandle; 4]>,
    pub(crate) current_unit: Option<NonNull<CompiledUnit>>,
    holding: bool,
}

impl ExecContext<'_> {
    /// The runtime core. Valid because constructing this context took
    /// the execution right.
    pub fn core(&mut self) -> &mut RuntimeCore {
        debug_assert!(self.holding, "core access without the execution right");
        // SAFETY: this thread holds the execution right (see
        // `JitRuntime`), and the returned borrow is tied to `&mut self`,
        // so it cannot outlive an `external_call` release.
        unsafe { &mut *self.rt.core.get() }
    }

    /// Copy of the runtime counters.
    pub fn stats(&mut self) -> RuntimeStats {
        self.core().stats
    }

    /// Run `call` with the execution right released, as compiled code
    /// must before calling an external function that can block.
    ///
    /// This thread's live frame chain is published to the registry so a
    /// collection run by whichever thread takes the right next can trace
    /// it; on return the right is reacquired (blocking while a peer
    /// holds it) and the registry entry retired.
    pub fn external_call<R>(&mut self, call: impl FnOnce() -> R) -> R {
        let thread = thread::current().id();
        let roots = SavedRoots {
            frames: self.live_frames.clone(),
        };

        #[cfg(feature = "exec_logging")]
        tracing::trace!(
            target: "marten::exec",
            frames = roots.frames.len(),
            "releasing execution right for external call"
        );

        self.holding = false;
        self.rt.right().release_for_call(thread, roots);
        let result = call();
        self.rt.right().reacquire_after_call(thread);
        self.holding = true;
        result
    }

    /// Walk every reference the collector must treat as a root from this
    /// runtime's threads: the calling context's live frames plus the
    /// saved chains of every thread suspended in an external call.
    pub fn trace_thread_roots(&mut self, visit: &mut dyn FnMut(NonNull<GcRef>)) {
        let mut handles: Vec<FrameHandle> = self.live_frames.to_vec();
        handles.extend(self.rt.right().saved_frames());

        let core = self.core();
        for handle in handles {
            if core.arena.try_resolve(handle).is_none() {
                continue;
            }
            core.arena.trace_begin(handle);
            while let Some(ptr) = core.arena.trace_next(handle) {
                visit(ptr);
            }
        }
    }

    /// Frames this context currently treats as roots.
    pub fn live_frames(&self) -> &[FrameHandle] {
        &self.live_frames
    }
}

impl Drop for ExecContext<'_> {
    fn drop(&mut self) {
        if self.holding {
            self.rt.right().release();
        } else {
            // Unwound out of an external call: the right was already
            // given up, only the registry entry is left to retire.
            self.rt.right().retire(thread::current().id());
        }
    }
}
