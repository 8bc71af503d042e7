//! The frame record and its arena.
//!
//! A frame holds one activation's live values while (and after) running
//! compiled code. Frames live in an arena and are addressed through
//! generation-checked handles; compiled code, the trampoline and the
//! collector all name a frame by handle and resolve it on every access,
//! so growing a frame in place never leaves a stale pointer behind.

use std::sync::Arc;

use crate::barrier::{Barrier, NullBarrier};
use crate::error::{FrameError, Result};
use crate::frame_info::{FRAME_BASE_OFFSET, FrameInfo};
use crate::gcmap::GcMap;
use crate::slot::{GcRef, Slot, ValueKind};
use crate::tracer::TraceCursor;

/// Generation-checked handle to a frame in a [`FrameArena`].
///
/// A handle outlives the frame it names; resolving after the frame was
/// freed (and its arena slot reused) is detected, not silently misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    index: u32,
    generation: u32,
}

/// One activation record of a compiled unit.
#[derive(Debug)]
pub struct Frame {
    pub(crate) info: Arc<FrameInfo>,
    pub(crate) descr: GcRef,
    pub(crate) force_descr: GcRef,
    pub(crate) gcmap: Option<Arc<GcMap>>,
    pub(crate) extra_stack_depth: usize,
    pub(crate) savedata: GcRef,
    pub(crate) guard_exc: GcRef,
    pub(crate) cursor: TraceCursor,
    pub(crate) slots: Box<[Slot]>,
}

impl Frame {
    fn new(info: Arc<FrameInfo>) -> Result<Frame> {
        let slots = alloc_slots(info.frame_depth())?;
        Ok(Frame {
            info,
            descr: GcRef::NULL,
            force_descr: GcRef::NULL,
            gcmap: None,
            extra_stack_depth: 0,
            savedata: GcRef::NULL,
            guard_exc: GcRef::NULL,
            cursor: TraceCursor::Done,
            slots,
        })
    }

    /// The sizing record of the compiled unit this frame belongs to.
    pub fn info(&self) -> &Arc<FrameInfo> {
        &self.info
    }

    /// Number of slots in this frame. May lag `info().frame_depth()`
    /// until the frame is grown.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Copy of the raw slot at `index`, tag included.
    pub fn slot(&self, index: usize) -> Slot {
        self.slots[index]
    }

    /// Read slot `index` as a machine integer.
    pub fn get_int(&self, index: usize) -> i64 {
        match self.slots[index] {
            Slot::Int(value) => value,
            other => panic!("slot {index} holds {:?}, not an int", other.kind()),
        }
    }

    /// Read slot `index` as a double.
    pub fn get_float(&self, index: usize) -> f64 {
        match self.slots[index] {
            Slot::Float(value) => value,
            other => panic!("slot {index} holds {:?}, not a float", other.kind()),
        }
    }

    /// Read slot `index` as a collector reference.
    pub fn get_ref(&self, index: usize) -> GcRef {
        match self.slots[index] {
            Slot::Ref(value) => value,
            other => panic!("slot {index} holds {:?}, not a reference", other.kind()),
        }
    }

    /// Write a machine integer into slot `index`.
    pub fn set_int(&mut self, index: usize, value: i64) {
        self.slots[index] = Slot::Int(value);
    }

    /// Write a double into slot `index`.
    pub fn set_float(&mut self, index: usize, value: f64) {
        self.slots[index] = Slot::Float(value);
    }

    /// Write a collector reference into slot `index`.
    pub fn set_ref(&mut self, index: usize, value: GcRef) {
        self.slots[index] = Slot::Ref(value);
    }

    /// Write `value` into slot `index`, dispatching on its tag.
    pub fn set_slot(&mut self, index: usize, value: Slot) {
        self.slots[index] = value;
    }

    /// Why this frame stopped; null while it is still running.
    pub fn descr(&self) -> GcRef {
        self.descr
    }

    /// Set the stopping descriptor.
    pub fn set_descr(&mut self, descr: GcRef) {
        self.descr = descr;
    }

    /// Descriptor to install when this frame is forced out of a
    /// not-yet-finished activation.
    pub fn force_descr(&self) -> GcRef {
        self.force_descr
    }

    /// Set the forcing descriptor.
    pub fn set_force_descr(&mut self, descr: GcRef) {
        self.force_descr = descr;
    }

    /// The liveness map of the most recent suspension point, if any.
    pub fn gcmap(&self) -> Option<&Arc<GcMap>> {
        self.gcmap.as_ref()
    }

    /// Install a liveness map (or clear it with `None`).
    pub fn set_gcmap(&mut self, gcmap: Option<Arc<GcMap>>) {
        self.gcmap = gcmap;
    }

    /// Install the stopping descriptor and that suspension point's
    /// liveness map in one step; this is what the guard-failure epilogue
    /// of compiled code performs before returning to the trampoline.
    pub fn store_descriptor(&mut self, descr: GcRef, gcmap: Arc<GcMap>) {
        self.descr = descr;
        self.gcmap = Some(gcmap);
    }

    /// Scratch depth used transiently around nested native calls. No
    /// contract across suspension points.
    pub fn extra_stack_depth(&self) -> usize {
        self.extra_stack_depth
    }

    /// Set the scratch call depth.
    pub fn set_extra_stack_depth(&mut self, depth: usize) {
        self.extra_stack_depth = depth;
    }

    /// Opaque payload the interpreter may attach; never interpreted here.
    pub fn savedata(&self) -> GcRef {
        self.savedata
    }

    /// Attach an opaque payload.
    pub fn set_savedata(&mut self, data: GcRef) {
        self.savedata = data;
    }

    /// Pending exceptional value, passed through to the interpreter
    /// unchanged.
    pub fn guard_exc(&self) -> GcRef {
        self.guard_exc
    }

    /// Set the pending exceptional value.
    pub fn set_guard_exc(&mut self, exc: GcRef) {
        self.guard_exc = exc;
    }

    /// Take the pending exceptional value, leaving null.
    pub fn take_guard_exc(&mut self) -> GcRef {
        std::mem::replace(&mut self.guard_exc, GcRef::NULL)
    }
}

fn alloc_slots(depth: usize) -> Result<Box<[Slot]>> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(depth)
        .map_err(|_| FrameError::AllocationFailed { words: depth })?;
    slots.resize(depth, Slot::default());
    Ok(slots.into_boxed_slice())
}

struct ArenaEntry {
    generation: u32,
    frame: Option<Frame>,
}

/// Arena owning every live frame, indexed by [`FrameHandle`].
pub struct FrameArena {
    entries: Vec<ArenaEntry>,
    free: Vec<u32>,
    barrier: Box<dyn Barrier>,
}

impl FrameArena {
    /// An arena whose growth notifications go nowhere.
    pub fn new() -> Self {
        FrameArena::with_barrier(Box::new(NullBarrier))
    }

    /// An arena that reports bulk frame mutation to `barrier`.
    pub fn with_barrier(barrier: Box<dyn Barrier>) -> Self {
        FrameArena {
            entries: Vec::new(),
            free: Vec::new(),
            barrier,
        }
    }

    /// Allocate a zero-initialized frame sized for `info.frame_depth()`.
    ///
    /// Failure to back the slot storage is fatal to the caller; see
    /// [`FrameError::AllocationFailed`].
    pub fn allocate(&mut self, info: &Arc<FrameInfo>) -> Result<FrameHandle> {
        let frame = Frame::new(Arc::clone(info))?;
        let handle = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.frame = Some(frame);
                FrameHandle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = u32::try_from(self.entries.len()).expect("frame arena exhausted");
                self.entries.push(ArenaEntry {
                    generation: 0,
                    frame: Some(frame),
                });
                FrameHandle {
                    index,
                    generation: 0,
                }
            }
        };
        Ok(handle)
    }

    /// Look up `handle`, returning `None` if the frame was freed or the
    /// handle belongs to another arena's numbering.
    pub fn try_resolve(&self, handle: FrameHandle) -> Option<&Frame> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.frame.as_ref())
    }

    /// Mutable variant of [`FrameArena::try_resolve`].
    pub fn try_resolve_mut(&mut self, handle: FrameHandle) -> Option<&mut Frame> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.frame.as_mut())
    }

    /// Resolve `handle` to its frame. A stale handle is a contract
    /// violation between the runtime and compiled code and panics.
    pub fn resolve(&self, handle: FrameHandle) -> &Frame {
        match self.try_resolve(handle) {
            Some(frame) => frame,
            None => panic!("stale frame handle {handle:?}"),
        }
    }

    /// Mutable variant of [`FrameArena::resolve`].
    pub fn resolve_mut(&mut self, handle: FrameHandle) -> &mut Frame {
        match self.try_resolve_mut(handle) {
            Some(frame) => frame,
            None => panic!("stale frame handle {handle:?}"),
        }
    }

    /// Retire a dead frame. Its handle (and any copy of it) goes stale.
    pub fn free(&mut self, handle: FrameHandle) {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .unwrap_or_else(|| panic!("freeing stale frame handle {handle:?}"));
        entry.frame = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
    }

    /// Number of live frames.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.frame.is_some())
            .count()
    }

    /// Grow the frame behind `handle` so it has at least `new_depth`
    /// slots, updating the compiled unit's [`FrameInfo`] first so future
    /// allocations are already big enough.
    ///
    /// Existing slot contents are kept positionally, as are `savedata`
    /// and the pending exception; the stop descriptors, the gc map and
    /// the scratch depth are cleared — whoever resumes execution
    /// re-establishes them. The arena slot is rewritten in place, so the
    /// returned handle equals `handle` and every outstanding copy of it
    /// stays valid. The collector's barrier is notified afterward.
    pub fn grow(&mut self, handle: FrameHandle, new_depth: usize) -> Result<FrameHandle> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .unwrap_or_else(|| panic!("growing stale frame handle {handle:?}"));
        let frame = entry
            .frame
            .as_mut()
            .unwrap_or_else(|| panic!("growing stale frame handle {handle:?}"));

        if new_depth > frame.info.frame_depth() {
            frame.info.update(FRAME_BASE_OFFSET, new_depth);
        }
        let target = frame.info.frame_depth();
        if target <= frame.slots.len() {
            return Ok(handle);
        }

        let mut slots = alloc_slots(target)?;
        slots[..frame.slots.len()].copy_from_slice(&frame.slots);
        // The old storage drops here; nothing keeps its references alive.
        frame.slots = slots;
        frame.descr = GcRef::NULL;
        frame.force_descr = GcRef::NULL;
        frame.gcmap = None;
        frame.extra_stack_depth = 0;
        frame.cursor = TraceCursor::Done;

        #[cfg(feature = "frame_logging")]
        tracing::debug!(
            target: "marten::frame",
            ?handle,
            depth = target,
            "frame grown in place"
        );

        self.barrier.frame_mutated(handle);
        Ok(handle)
    }

    /// Read slot `index` of `handle` as a machine integer.
    pub fn get_int(&self, handle: FrameHandle, index: usize) -> i64 {
        self.resolve(handle).get_int(index)
    }

    /// Read slot `index` of `handle` as a double.
    pub fn get_float(&self, handle: FrameHandle, index: usize) -> f64 {
        self.resolve(handle).get_float(index)
    }

    /// Read slot `index` of `handle` as a collector reference.
    pub fn get_ref(&self, handle: FrameHandle, index: usize) -> GcRef {
        self.resolve(handle).get_ref(index)
    }

    /// Write a machine integer into slot `index` of `handle`.
    pub fn set_int(&mut self, handle: FrameHandle, index: usize, value: i64) {
        self.resolve_mut(handle).set_int(index, value);
    }

    /// Write a double into slot `index` of `handle`.
    pub fn set_float(&mut self, handle: FrameHandle, index: usize, value: f64) {
        self.resolve_mut(handle).set_float(index, value);
    }

    /// Write a collector reference into slot `index` of `handle`.
    pub fn set_ref(&mut self, handle: FrameHandle, index: usize, value: GcRef) {
        self.resolve_mut(handle).set_ref(index, value);
    }

    /// Read a slot of `handle` by the kind the caller expects, returning
    /// the tagged value.
    pub fn get_slot(&self, handle: FrameHandle, index: usize, kind: ValueKind) -> Slot {
        let frame = self.resolve(handle);
        match kind {
            ValueKind::Int => Slot::Int(frame.get_int(index)),
            ValueKind::Float => Slot::Float(frame.get_float(index)),
            ValueKind::Ref => Slot::Ref(frame.get_ref(index)),
        }
    }

    /// See [`Frame::store_descriptor`].
    pub fn store_descriptor(&mut self, handle: FrameHandle, descr: GcRef, gcmap: Arc<GcMap>) {
        self.resolve_mut(handle).store_descriptor(descr, gcmap);
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        FrameArena::new()
    }
}
