//! Stop descriptors and the guard-recovery protocol.
//!
//! A frame that stopped running carries an opaque descriptor token
//! saying why: a finish descriptor for program completion, or a guard
//! descriptor naming the runtime assumption that failed. The table here
//! owns the descriptors behind those tokens, decodes fail values out of
//! dead frames, and tracks per-guard failure counts so the runtime can
//! decide when a guard deserves a bridge.

use std::sync::Arc;

use marten_frame::{FailLocation, Frame, GcMap, GcMapInterner, GcRef, Storage, ValueKind};
use smallvec::SmallVec;

/// Opaque word-sized token identifying a descriptor, stored in
/// `Frame::descr` where the collector treats it like any other
/// reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescrToken(GcRef);

impl DescrToken {
    /// The reference representation compiled code stores into a frame.
    pub fn as_gc_ref(self) -> GcRef {
        self.0
    }

    fn from_index(index: usize) -> DescrToken {
        DescrToken(GcRef::from_addr(index + 1))
    }

    fn index(self) -> Option<usize> {
        if self.0.is_null() {
            None
        } else {
            Some(self.0.addr() - 1)
        }
    }
}

/// Descriptor for an activation that ran to completion.
#[derive(Debug)]
pub struct FinishDescr {
    /// Result values: slot index and statically-known kind, in result
    /// order.
    pub results: SmallVec<[(u32, ValueKind); 4]>,
    /// Liveness at the finish point (the reference results, typically
    /// zero or one bit).
    pub gcmap: Arc<GcMap>,
}

/// Descriptor for one guard: where to resume interpretation and where
/// the values live across it land.
#[derive(Debug)]
pub struct GuardDescr {
    /// Identity of the failed runtime assumption.
    pub guard_id: u64,
    /// Source position interpretation resumes from after a bailout.
    pub resume_pc: u32,
    /// Fail values: slot index and kind, in fail-value order. By the
    /// time a bailout reaches the trampoline every value is in a slot;
    /// register locations were resolved by the code generator's spills.
    pub fail_slots: SmallVec<[(u32, ValueKind); 8]>,
    /// Liveness across this guard.
    pub gcmap: Arc<GcMap>,
    failures: u64,
}

impl GuardDescr {
    /// How often this guard has failed so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// A registered descriptor.
#[derive(Debug)]
pub enum Descr {
    /// Completion descriptor.
    Finish(FinishDescr),
    /// Guard descriptor.
    Guard(GuardDescr),
}

/// Classification of a stopped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The activation ran to completion.
    Finished {
        /// The finish descriptor's token.
        token: DescrToken,
    },
    /// A guard failed and execution bailed out.
    Guard {
        /// The guard descriptor's token.
        token: DescrToken,
        /// Identity of the failed assumption.
        guard_id: u64,
        /// Where interpretation resumes.
        resume_pc: u32,
    },
}

/// Table owning every descriptor a compiled unit's code can name.
#[derive(Debug, Default)]
pub struct DescrTable {
    descrs: Vec<Descr>,
}

impl DescrTable {
    /// An empty table.
    pub fn new() -> Self {
        DescrTable::default()
    }

    /// Register a completion descriptor for results at the given slots.
    pub fn register_finish(
        &mut self,
        results: &[(u32, ValueKind)],
        interner: &GcMapInterner,
        frame_depth: usize,
    ) -> DescrToken {
        let locations: SmallVec<[FailLocation; 4]> = results
            .iter()
            .map(|&(slot, kind)| FailLocation {
                kind,
                storage: Storage::Slot(slot),
            })
            .collect();
        let gcmap = interner.intern(&locations, frame_depth);
        self.push(Descr::Finish(FinishDescr {
            results: results.iter().copied().collect(),
            gcmap,
        }))
    }

    /// Register a guard descriptor from the code generator's
    /// fail-location list. Every location must already be a slot; a
    /// reference still in a register at registration time is a code
    /// generator bug.
    pub fn register_guard(
        &mut self,
        guard_id: u64,
        resume_pc: u32,
        locations: &[FailLocation],
        interner: &GcMapInterner,
        frame_depth: usize,
    ) -> DescrToken {
        let fail_slots: SmallVec<[(u32, ValueKind); 8]> = locations
            .iter()
            .map(|location| match location.storage {
                Storage::Slot(slot) => (slot, location.kind),
                Storage::Register(register) => {
                    panic!("guard {guard_id}: fail value still in register {register}")
                }
            })
            .collect();
        let gcmap = interner.intern(locations, frame_depth);
        self.push(Descr::Guard(GuardDescr {
            guard_id,
            resume_pc,
            fail_slots,
            gcmap,
            failures: 0,
        }))
    }

    fn push(&mut self, descr: Descr) -> DescrToken {
        let token = DescrToken::from_index(self.descrs.len());
        self.descrs.push(descr);
        token
    }

    /// Look up a token, if it names a descriptor in this table.
    pub fn lookup(&self, token: DescrToken) -> Option<&Descr> {
        token.index().and_then(|index| self.descrs.get(index))
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descrs.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.descrs.is_empty()
    }

    /// The liveness map associated with `token`.
    pub fn gcmap_of(&self, token: DescrToken) -> Arc<GcMap> {
        match self.expect(token) {
            Descr::Finish(finish) => Arc::clone(&finish.gcmap),
            Descr::Guard(guard) => Arc::clone(&guard.gcmap),
        }
    }

    /// Classify why `frame` stopped.
    ///
    /// A frame with no descriptor, or with a token this table never
    /// issued, means the compiler/runtime contract was violated; that is
    /// fatal, not recoverable.
    pub fn latest(&self, frame: &Frame) -> Stop {
        let token = DescrToken(frame.descr());
        match self.expect(token) {
            Descr::Finish(_) => Stop::Finished { token },
            Descr::Guard(guard) => Stop::Guard {
                token,
                guard_id: guard.guard_id,
                resume_pc: guard.resume_pc,
            },
        }
    }

    /// Read the `index`-th stop value of `frame` as an integer, using
    /// the stopping descriptor's location list.
    pub fn get_int_value(&self, frame: &Frame, index: usize) -> i64 {
        frame.get_int(self.value_slot(frame, index))
    }

    /// Read the `index`-th stop value of `frame` as a double.
    pub fn get_float_value(&self, frame: &Frame, index: usize) -> f64 {
        frame.get_float(self.value_slot(frame, index))
    }

    /// Read the `index`-th stop value of `frame` as a reference.
    pub fn get_ref_value(&self, frame: &Frame, index: usize) -> GcRef {
        frame.get_ref(self.value_slot(frame, index))
    }

    fn value_slot(&self, frame: &Frame, index: usize) -> usize {
        let token = DescrToken(frame.descr());
        let (slot, _kind) = match self.expect(token) {
            Descr::Finish(finish) => finish.results[index],
            Descr::Guard(guard) => guard.fail_slots[index],
        };
        slot as usize
    }

    /// The result locations of the finish descriptor behind `token`.
    pub fn finish_results(&self, token: DescrToken) -> SmallVec<[(u32, ValueKind); 4]> {
        match self.expect(token) {
            Descr::Finish(finish) => finish.results.clone(),
            Descr::Guard(_) => panic!("descriptor {token:?} is not a finish descriptor"),
        }
    }

    /// Record one more failure of the guard behind `token`, returning
    /// the new count.
    pub fn record_failure(&mut self, token: DescrToken) -> u64 {
        let index = token
            .index()
            .unwrap_or_else(|| panic!("recording failure for null descriptor"));
        match self.descrs.get_mut(index) {
            Some(Descr::Guard(guard)) => {
                guard.failures += 1;
                guard.failures
            }
            _ => panic!("recording failure for non-guard descriptor {token:?}"),
        }
    }

    fn expect(&self, token: DescrToken) -> &Descr {
        match self.lookup(token) {
            Some(descr) => descr,
            None => panic!("unknown stop descriptor {:?}", token.as_gc_ref()),
        }
    }
}

/// Force a not-yet-finished activation out of compiled code: the
/// forcing descriptor becomes the stopping descriptor, after which the
/// frame reads like any other bailed-out frame.
pub fn force(frame: &mut Frame) {
    frame.set_descr(frame.force_descr());
}
