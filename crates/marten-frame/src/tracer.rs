//! Resumable enumeration of a frame's collector-owned references.
//!
//! The collector pulls one reference address per call and may suspend
//! between calls, so the position of a trace in progress lives in the
//! frame itself. A pass yields the fixed reference fields first, in a
//! fixed order, then the address of every slot whose gc map bit is set;
//! each address is yielded exactly once per pass.

use std::ptr::NonNull;

use crate::frame::{Frame, FrameArena, FrameHandle};
use crate::gcmap::BITS_PER_WORD;
use crate::slot::{GcRef, Slot};

/// Number of fixed reference fields a frame owns besides its slots.
pub const FIXED_TRACE_FIELDS: u8 = 4;

/// Position of a trace pass over one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCursor {
    /// About to yield the fixed field at this position.
    Fixed(u8),
    /// Scanning gc map bits, next candidate at `(word, bit)`.
    Slots {
        /// Bitmap word to scan next.
        word: usize,
        /// Bit within that word to scan next.
        bit: u32,
    },
    /// Pass complete (or never begun).
    Done,
}

impl Frame {
    /// Start a fresh trace pass, discarding any previous position.
    pub fn trace_begin(&mut self) {
        self.cursor = TraceCursor::Fixed(0);
    }

    /// Yield the next collector-owned address, or `None` once the pass
    /// is complete. The position survives across calls, so a collector
    /// visiting one reference at a time resumes without rescanning.
    ///
    /// The returned pointer stays valid until the frame is grown or
    /// freed; a moving collector rewrites the reference through it.
    pub fn trace_next(&mut self) -> Option<NonNull<GcRef>> {
        match self.cursor {
            TraceCursor::Fixed(position) => {
                let ptr = NonNull::from(match position {
                    0 => &mut self.descr,
                    1 => &mut self.force_descr,
                    2 => &mut self.savedata,
                    _ => &mut self.guard_exc,
                });
                self.cursor = if position + 1 < FIXED_TRACE_FIELDS {
                    TraceCursor::Fixed(position + 1)
                } else if self.gcmap.is_some() {
                    TraceCursor::Slots { word: 0, bit: 0 }
                } else {
                    // No suspension-point map installed (e.g. right after
                    // a clean finish): the slots are not scanned at all.
                    TraceCursor::Done
                };
                Some(ptr)
            }
            TraceCursor::Slots { word, bit } => {
                let map = self.gcmap.clone().expect("slot scan without gc map");
                let words = map.words();
                let mut word = word;
                let mut bit = bit as usize;
                loop {
                    if word >= words.len() {
                        self.cursor = TraceCursor::Done;
                        return None;
                    }
                    if bit >= BITS_PER_WORD {
                        word += 1;
                        bit = 0;
                        continue;
                    }
                    let pending = words[word] & (usize::MAX << bit);
                    if pending == 0 {
                        word += 1;
                        bit = 0;
                        continue;
                    }
                    let offset = pending.trailing_zeros() as usize;
                    let index = word * BITS_PER_WORD + offset;
                    self.cursor = TraceCursor::Slots {
                        word,
                        bit: (offset + 1) as u32,
                    };
                    match &mut self.slots[index] {
                        Slot::Ref(slot_ref) => return Some(NonNull::from(slot_ref)),
                        other => {
                            panic!("gcmap bit {index} set over a {:?} slot", other.kind())
                        }
                    }
                }
            }
            TraceCursor::Done => None,
        }
    }

    /// Iterator over a full trace pass (restarts the cursor).
    pub fn tracer(&mut self) -> FrameTracer<'_> {
        self.trace_begin();
        FrameTracer { frame: self }
    }
}

impl FrameArena {
    /// Start a trace pass over the frame behind `handle`.
    pub fn trace_begin(&mut self, handle: FrameHandle) {
        self.resolve_mut(handle).trace_begin();
    }

    /// Advance the trace pass of `handle` by one reference. This is the
    /// operation the collector drives: call [`FrameArena::trace_begin`]
    /// once, then this until it returns `None`.
    pub fn trace_next(&mut self, handle: FrameHandle) -> Option<NonNull<GcRef>> {
        self.resolve_mut(handle).trace_next()
    }
}

/// Iterator adapter over [`Frame::trace_next`] for collectors that pull
/// a whole pass eagerly.
pub struct FrameTracer<'a> {
    frame: &'a mut Frame,
}

impl Iterator for FrameTracer<'_> {
    type Item = NonNull<GcRef>;

    fn next(&mut self) -> Option<NonNull<GcRef>> {
        self.frame.trace_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_info::FrameInfo;
    use crate::gcmap::{FailLocation, GcMap, Storage};
    use crate::slot::ValueKind;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn arena_with_frame(depth: usize) -> (FrameArena, FrameHandle) {
        let mut arena = FrameArena::new();
        let info = Arc::new(FrameInfo::with_depth(depth));
        let handle = arena.allocate(&info).unwrap();
        (arena, handle)
    }

    fn ref_map(indices: &[u32], depth: usize) -> Arc<GcMap> {
        let locations: Vec<FailLocation> = indices
            .iter()
            .map(|&index| FailLocation {
                kind: ValueKind::Ref,
                storage: Storage::Slot(index),
            })
            .collect();
        Arc::new(GcMap::from_fail_locations(&locations, depth))
    }

    #[test]
    fn pass_yields_fixed_fields_then_set_bits_in_order() {
        let depth = BITS_PER_WORD + 8;
        let (mut arena, handle) = arena_with_frame(depth);
        let live = [1u32, 5, (BITS_PER_WORD - 1) as u32, BITS_PER_WORD as u32, (depth - 1) as u32];
        for &index in &live {
            arena.set_ref(handle, index as usize, GcRef::from_addr(0x100 + index as usize));
        }
        arena
            .resolve_mut(handle)
            .set_gcmap(Some(ref_map(&live, depth)));

        let frame = arena.resolve_mut(handle);
        let yielded: Vec<usize> = frame.tracer().map(|ptr| ptr.as_ptr() as usize).collect();
        assert_eq!(yielded.len(), FIXED_TRACE_FIELDS as usize + live.len());

        let expected_fixed = [
            NonNull::from(&mut frame.descr).as_ptr() as usize,
            NonNull::from(&mut frame.force_descr).as_ptr() as usize,
            NonNull::from(&mut frame.savedata).as_ptr() as usize,
            NonNull::from(&mut frame.guard_exc).as_ptr() as usize,
        ];
        assert_eq!(&yielded[..4], &expected_fixed);

        let slot_addrs: Vec<usize> = live
            .iter()
            .map(|&index| match &mut frame.slots[index as usize] {
                Slot::Ref(slot_ref) => NonNull::from(slot_ref).as_ptr() as usize,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(&yielded[4..], &slot_addrs);

        let unique: HashSet<usize> = yielded.iter().copied().collect();
        assert_eq!(unique.len(), yielded.len());
    }

    #[test]
    fn pass_terminates_and_stays_terminated() {
        let (mut arena, handle) = arena_with_frame(4);
        arena.set_ref(handle, 2, GcRef::from_addr(0x20));
        arena.resolve_mut(handle).set_gcmap(Some(ref_map(&[2], 4)));

        arena.trace_begin(handle);
        let mut count = 0;
        while arena.trace_next(handle).is_some() {
            count += 1;
        }
        assert_eq!(count, FIXED_TRACE_FIELDS as usize + 1);
        assert!(arena.trace_next(handle).is_none());
        assert!(arena.trace_next(handle).is_none());
    }

    #[test]
    fn cursor_survives_between_calls() {
        let (mut arena, handle) = arena_with_frame(8);
        for index in [1, 4, 6] {
            arena.set_ref(handle, index, GcRef::from_addr(0x40 + index));
        }
        arena
            .resolve_mut(handle)
            .set_gcmap(Some(ref_map(&[1, 4, 6], 8)));

        arena.trace_begin(handle);
        let mut first_two = Vec::new();
        for _ in 0..2 {
            first_two.push(arena.trace_next(handle).unwrap().as_ptr() as usize);
        }
        // Unrelated resolves between collector steps must not disturb it.
        let _ = arena.get_ref(handle, 1);
        let mut rest = Vec::new();
        while let Some(ptr) = arena.trace_next(handle) {
            rest.push(ptr.as_ptr() as usize);
        }
        assert_eq!(first_two.len() + rest.len(), FIXED_TRACE_FIELDS as usize + 3);
        let unique: HashSet<usize> = first_two.iter().chain(rest.iter()).copied().collect();
        assert_eq!(unique.len(), first_two.len() + rest.len());
    }

    #[test]
    fn missing_gcmap_skips_slots_entirely() {
        let (mut arena, handle) = arena_with_frame(4);
        arena.set_ref(handle, 0, GcRef::from_addr(0x99));
        let frame = arena.resolve_mut(handle);
        assert_eq!(frame.tracer().count(), FIXED_TRACE_FIELDS as usize);
    }

    #[test]
    fn collector_can_rewrite_references_in_place() {
        let (mut arena, handle) = arena_with_frame(3);
        arena.set_ref(handle, 1, GcRef::from_addr(0x1000));
        {
            let frame = arena.resolve_mut(handle);
            frame.set_descr(GcRef::from_addr(0x2000));
            frame.set_gcmap(Some(ref_map(&[1], 3)));
        }

        // Simulate a moving collector relocating every object it visits.
        arena.trace_begin(handle);
        while let Some(ptr) = arena.trace_next(handle) {
            let old = unsafe { ptr.as_ptr().read() };
            if !old.is_null() {
                unsafe { ptr.as_ptr().write(GcRef::from_addr(old.addr() + 0x10)) };
            }
        }

        assert_eq!(arena.resolve(handle).descr().addr(), 0x2010);
        assert_eq!(arena.get_ref(handle, 1).addr(), 0x1010);
    }

    #[test]
    fn restarting_repeats_the_full_pass() {
        let (mut arena, handle) = arena_with_frame(2);
        arena.set_ref(handle, 0, GcRef::from_addr(0x7));
        arena.resolve_mut(handle).set_gcmap(Some(ref_map(&[0], 2)));

        let frame = arena.resolve_mut(handle);
        let first: Vec<usize> = frame.tracer().map(|ptr| ptr.as_ptr() as usize).collect();
        let second: Vec<usize> = frame.tracer().map(|ptr| ptr.as_ptr() as usize).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), FIXED_TRACE_FIELDS as usize + 1);
    }

    #[test]
    #[should_panic(expected = "set over")]
    fn map_bit_over_non_ref_slot_is_fatal() {
        let (mut arena, handle) = arena_with_frame(2);
        arena.set_int(handle, 0, 17);
        arena.resolve_mut(handle).set_gcmap(Some(ref_map(&[0], 2)));
        let frame = arena.resolve_mut(handle);
        let _ = frame.tracer().count();
    }
}
