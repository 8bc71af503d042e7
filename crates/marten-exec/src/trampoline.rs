//! The execution trampoline: into compiled code and back out.
//!
//! A compiled unit's entry point has the fixed shape
//! `(frame, context) -> frame`: it receives the freshly filled frame and
//! returns the frame it stopped in, which need not be the same one (any
//! call back into the runtime may have grown it). The trampoline
//! marshals interpreter values in, resolves the returned handle, and
//! classifies why execution stopped.

use std::sync::{Arc, OnceLock};

use marten_frame::{FrameError, FrameHandle, FrameInfo, GcRef, Slot, ValueKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::descr::{DescrToken, Stop};
use crate::error::ExecError;
use crate::runtime::ExecContext;

/// Signature of every compiled entry point and bridge.
pub type EntryFn = fn(FrameHandle, &mut ExecContext<'_>) -> FrameHandle;

/// Default bound on nested compiled-unit entries.
pub const DEFAULT_MAX_ENTER_DEPTH: usize = 400;

static MAX_ENTER_DEPTH: OnceLock<usize> = OnceLock::new();

/// Maximum nesting of [`ExecContext::enter`] before the depth guard
/// rejects the entry with [`ExecError::DepthExceeded`].
///
/// Defaults to [`DEFAULT_MAX_ENTER_DEPTH`]. Override with
/// `MARTEN_MAX_ENTER_DEPTH=<usize>`.
pub fn max_enter_depth() -> usize {
    *MAX_ENTER_DEPTH.get_or_init(|| {
        std::env::var("MARTEN_MAX_ENTER_DEPTH")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_MAX_ENTER_DEPTH)
    })
}

/// Descriptor tokens a unit's compiled code has baked in: its finish
/// descriptor and one token per guard.
#[derive(Debug, Clone)]
pub struct UnitDescrs {
    /// Token stored on clean completion.
    pub finish: DescrToken,
    /// Guard tokens in guard order.
    pub guards: SmallVec<[DescrToken; 4]>,
}

impl UnitDescrs {
    /// Descriptors for a unit with no guards.
    pub fn new(finish: DescrToken) -> Self {
        UnitDescrs {
            finish,
            guards: SmallVec::new(),
        }
    }

    /// Descriptors for a unit with guards in guard order.
    pub fn with_guards(finish: DescrToken, guards: &[DescrToken]) -> Self {
        UnitDescrs {
            finish,
            guards: guards.iter().copied().collect(),
        }
    }
}

/// One compiled unit: entry point, frame sizing, the fixed
/// argument-to-slot mapping chosen at compile time, and the guard
/// dispatch table that bridge attachment patches.
pub struct CompiledUnit {
    info: Arc<FrameInfo>,
    entry: EntryFn,
    arg_slots: Vec<(u32, ValueKind)>,
    descrs: UnitDescrs,
    bridges: FxHashMap<DescrToken, EntryFn>,
}

impl CompiledUnit {
    /// A unit whose frames need `frame_depth` slots.
    pub fn new(
        frame_depth: usize,
        entry: EntryFn,
        arg_slots: Vec<(u32, ValueKind)>,
        descrs: UnitDescrs,
    ) -> Self {
        CompiledUnit {
            info: Arc::new(FrameInfo::with_depth(frame_depth)),
            entry,
            arg_slots,
            descrs,
            bridges: FxHashMap::default(),
        }
    }

    /// The shared sizing record for this unit's frames.
    pub fn info(&self) -> &Arc<FrameInfo> {
        &self.info
    }

    /// The descriptor tokens this unit's code stores.
    pub fn descrs(&self) -> &UnitDescrs {
        &self.descrs
    }

    /// Patch `guard` so its next failure transfers into `entry` instead
    /// of bailing out. The guard's descriptor and liveness map stay as
    /// they are; only the dispatch is rewritten. A bridge that needs a
    /// deeper frame grows the unit's sizing here, so frames allocated
    /// from now on are already big enough.
    pub fn attach_bridge(&mut self, guard: DescrToken, entry: EntryFn, frame_depth: usize) {
        self.info
            .update(marten_frame::FRAME_BASE_OFFSET, frame_depth);
        self.bridges.insert(guard, entry);
    }

    /// The bridge attached to `guard`, if any.
    pub fn bridge_for(&self, guard: DescrToken) -> Option<EntryFn> {
        self.bridges.get(&guard).copied()
    }
}

/// Why a trampoline round ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    /// Clean completion. The frame has been freed.
    Finished {
        /// Result values in result order, by the finish descriptor's
        /// statically-known kinds.
        values: SmallVec<[Slot; 4]>,
        /// Pending exceptional value, passed through unchanged (null if
        /// none).
        guard_exc: GcRef,
    },
    /// A guard failed. The frame is kept alive so the interpreter can
    /// read the fail values out of it.
    GuardFailed {
        /// The guard's descriptor token.
        token: DescrToken,
        /// Identity of the failed assumption.
        guard_id: u64,
        /// Source position interpretation resumes from.
        resume_pc: u32,
        /// Total failures of this guard including this one.
        failures: u64,
    },
}

fn fatal_allocation(error: FrameError) -> ! {
    // A frame smaller than its compiled unit requires cannot be run
    // with, so there is nothing to recover to.
    eprintln!("fatal: {error}");
    std::process::abort();
}

impl ExecContext<'_> {
    /// Run `unit` on `args`.
    ///
    /// Allocates a frame from the unit's sizing record, marshals each
    /// argument into its fixed slot by kind, calls the entry point, and
    /// resolves the returned handle before anything else touches it.
    /// The recursion-depth guard runs first and fails recoverably,
    /// before any native code is involved.
    pub fn enter(&mut self, unit: &CompiledUnit, args: &[Slot]) -> Result<FrameHandle, ExecError> {
        let limit = max_enter_depth();
        if self.depth >= limit {
            self.core().stats.depth_rejections += 1;
            return Err(ExecError::DepthExceeded {
                depth: self.depth,
                limit,
            });
        }
        assert_eq!(
            args.len(),
            unit.arg_slots.len(),
            "unit takes {} arguments, got {}",
            unit.arg_slots.len(),
            args.len()
        );

        let handle = match self.core().arena.allocate(unit.info()) {
            Ok(handle) => handle,
            Err(error) => fatal_allocation(error),
        };
        for (arg, &(slot, kind)) in args.iter().zip(&unit.arg_slots) {
            let arena = &mut self.core().arena;
            let slot = slot as usize;
            match (*arg, kind) {
                (Slot::Int(value), ValueKind::Int) => arena.set_int(handle, slot, value),
                (Slot::Float(value), ValueKind::Float) => arena.set_float(handle, slot, value),
                (Slot::Ref(value), ValueKind::Ref) => arena.set_ref(handle, slot, value),
                (given, expected) => panic!(
                    "argument for slot {slot} is {:?}, unit expects {:?}",
                    given.kind(),
                    expected
                ),
            }
        }
        self.core().stats.enters += 1;

        #[cfg(feature = "exec_logging")]
        tracing::debug!(
            target: "marten::exec",
            ?handle,
            depth = self.depth,
            "entering compiled unit"
        );

        self.depth += 1;
        self.live_frames.push(handle);
        let previous_unit = self.current_unit.replace(std::ptr::NonNull::from(unit));
        let returned = (unit.entry)(handle, self);
        self.current_unit = previous_unit;
        self.live_frames.pop();
        self.depth -= 1;

        // Compiled code may have replaced the frame it was handed;
        // resolve before anything else reads through the handle.
        if self.core().arena.try_resolve(returned).is_none() {
            panic!("compiled code returned a dead frame {returned:?}");
        }
        Ok(returned)
    }

    /// Classify why the frame behind `handle` stopped and extract what
    /// the interpreter needs.
    ///
    /// A descriptor unknown to the table means the compiler/runtime
    /// contract was violated and panics.
    pub fn exit(&mut self, handle: FrameHandle) -> ExitStatus {
        let core = self.core();
        let stop = core.descrs.latest(core.arena.resolve(handle));
        match stop {
            Stop::Finished { token } => {
                let results = core.descrs.finish_results(token);
                let mut values: SmallVec<[Slot; 4]> = SmallVec::new();
                for &(slot, kind) in &results {
                    values.push(core.arena.get_slot(handle, slot as usize, kind));
                }
                let guard_exc = core.arena.resolve_mut(handle).take_guard_exc();
                core.arena.free(handle);
                core.stats.finishes += 1;

                #[cfg(feature = "exec_logging")]
                tracing::debug!(
                    target: "marten::exec",
                    results = values.len(),
                    "compiled unit finished"
                );

                ExitStatus::Finished { values, guard_exc }
            }
            Stop::Guard {
                token,
                guard_id,
                resume_pc,
            } => {
                let failures = core.descrs.record_failure(token);
                core.stats.guard_failures += 1;

                #[cfg(feature = "exec_logging")]
                tracing::debug!(
                    target: "marten::exec",
                    guard_id,
                    resume_pc,
                    failures,
                    "guard failed"
                );

                ExitStatus::GuardFailed {
                    token,
                    guard_id,
                    resume_pc,
                    failures,
                }
            }
        }
    }

    /// The descriptor tokens of the unit currently executing. Only
    /// meaningful from inside an entry point or bridge.
    pub fn unit_descrs(&self) -> UnitDescrs {
        let unit = self
            .current_unit
            .expect("descriptor tokens requested outside compiled code");
        // SAFETY: `current_unit` is set by `enter` for the duration of
        // the entry call, and the unit is borrowed for that whole call.
        unsafe { unit.as_ref() }.descrs().clone()
    }

    /// The guard-failure epilogue compiled code runs when a guard's
    /// condition does not hold: if a bridge was attached to `guard`,
    /// execution transfers there and no bailout happens; otherwise the
    /// guard's descriptor and liveness map are stored and the frame is
    /// returned toward the trampoline.
    pub fn guard_failed(&mut self, handle: FrameHandle, guard: DescrToken) -> FrameHandle {
        let bridge = {
            let unit = self
                .current_unit
                .expect("guard failure outside compiled code");
            // SAFETY: as in `unit_descrs`.
            unsafe { unit.as_ref() }.bridge_for(guard)
        };
        if let Some(bridge) = bridge {
            self.core().stats.bridge_transfers += 1;
            return bridge(handle, self);
        }
        let gcmap = self.core().descrs.gcmap_of(guard);
        self.core()
            .arena
            .store_descriptor(handle, guard.as_gc_ref(), gcmap);
        handle
    }

    /// The completion epilogue: store the finish descriptor and its
    /// liveness map, then hand the frame back toward the trampoline.
    pub fn finish(&mut self, handle: FrameHandle, token: DescrToken) -> FrameHandle {
        let gcmap = self.core().descrs.gcmap_of(token);
        self.core()
            .arena
            .store_descriptor(handle, token.as_gc_ref(), gcmap);
        handle
    }

    /// Grow the frame behind `handle` in place to at least `new_depth`
    /// slots. Allocation failure aborts: a frame smaller than its unit
    /// requires is nothing that can be resumed.
    pub fn grow_frame(&mut self, handle: FrameHandle, new_depth: usize) -> FrameHandle {
        let before = self.core().arena.resolve(handle).depth();
        match self.core().arena.grow(handle, new_depth) {
            Ok(handle) => {
                if self.core().arena.resolve(handle).depth() > before {
                    self.core().stats.frame_growths += 1;
                }
                handle
            }
            Err(error) => fatal_allocation(error),
        }
    }
}
