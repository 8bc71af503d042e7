//! Per-suspension-point liveness bitmaps.
//!
//! A `GcMap` records, one bit per frame slot, which slots hold a live
//! collector reference at a specific guard or call site. Maps are rebuilt
//! (never mutated) for each suspension point and interned: guards with
//! identical liveness share one instance, and interned maps live for the
//! process lifetime because dead code may still name them.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::slot::ValueKind;

/// Bits per bitmap word.
pub const BITS_PER_WORD: usize = usize::BITS as usize;

/// Where the code generator left a live value at a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Still in a machine register. Reference-kinded values must be
    /// spilled to a slot before the map built here can be trusted; that
    /// spill is the code generator's obligation.
    Register(u8),
    /// In the frame slot at this index.
    Slot(u32),
}

/// One value live across a guard or call, paired with where the compiler
/// left it. Consumed while building a `GcMap` and a recovery descriptor,
/// then discarded.
#[derive(Debug, Clone, Copy)]
pub struct FailLocation {
    /// Kind of the live value.
    pub kind: ValueKind,
    /// Its storage at the suspension point.
    pub storage: Storage,
}

/// Immutable liveness bitmap: bit `i` set means frame slot `i` holds a
/// live collector reference.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GcMap {
    words: Box<[usize]>,
}

impl GcMap {
    /// Build a map for a frame of `frame_depth` slots from the live set
    /// at one suspension point.
    ///
    /// Only reference-kinded values stored in slots set a bit. A
    /// reference still in a register is a code-generator bug at this
    /// point and trips a debug assertion.
    pub fn from_fail_locations(locations: &[FailLocation], frame_depth: usize) -> GcMap {
        let mut words = vec![0usize; frame_depth.div_ceil(BITS_PER_WORD)].into_boxed_slice();
        for location in locations {
            if location.kind != ValueKind::Ref {
                continue;
            }
            match location.storage {
                Storage::Register(_reg) => {
                    debug_assert!(false, "live reference left in register {_reg} at suspension");
                }
                Storage::Slot(index) => {
                    let index = index as usize;
                    assert!(index < frame_depth, "fail location slot {index} out of frame");
                    words[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
                }
            }
        }
        GcMap { words }
    }

    /// Whether bit `index` is set.
    pub fn bit(&self, index: usize) -> bool {
        self.words
            .get(index / BITS_PER_WORD)
            .is_some_and(|word| word & (1 << (index % BITS_PER_WORD)) != 0)
    }

    /// The raw bitmap words.
    pub fn words(&self) -> &[usize] {
        &self.words
    }

    /// Number of set bits.
    pub fn live_count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// Intern table handing out shared `Arc<GcMap>` instances.
///
/// Equal liveness sets resolve to the same map (the one-slot "finished"
/// map is the common case). Entries are never evicted; a descriptor or a
/// suspended frame may reference a map indefinitely.
#[derive(Debug, Default)]
pub struct GcMapInterner {
    maps: Mutex<FxHashMap<Box<[usize]>, Arc<GcMap>>>,
}

impl GcMapInterner {
    /// An empty intern table.
    pub fn new() -> Self {
        GcMapInterner::default()
    }

    /// Intern the map for `locations` over a frame of `frame_depth` slots.
    pub fn intern(&self, locations: &[FailLocation], frame_depth: usize) -> Arc<GcMap> {
        let map = GcMap::from_fail_locations(locations, frame_depth);
        let mut maps = self.maps.lock();
        if let Some(shared) = maps.get(map.words()) {
            return Arc::clone(shared);
        }
        let shared = Arc::new(map);
        maps.insert(shared.words.clone(), Arc::clone(&shared));
        shared
    }

    /// Number of distinct maps interned so far.
    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    /// Whether no map has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.maps.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ref_at(index: u32) -> FailLocation {
        FailLocation {
            kind: ValueKind::Ref,
            storage: Storage::Slot(index),
        }
    }

    fn int_at(index: u32) -> FailLocation {
        FailLocation {
            kind: ValueKind::Int,
            storage: Storage::Slot(index),
        }
    }

    #[test]
    fn only_slot_refs_set_bits() {
        let map = GcMap::from_fail_locations(
            &[
                int_at(0),
                ref_at(1),
                FailLocation {
                    kind: ValueKind::Float,
                    storage: Storage::Slot(2),
                },
                ref_at(3),
                FailLocation {
                    kind: ValueKind::Int,
                    storage: Storage::Register(4),
                },
            ],
            8,
        );
        assert!(!map.bit(0));
        assert!(map.bit(1));
        assert!(!map.bit(2));
        assert!(map.bit(3));
        assert_eq!(map.live_count(), 2);
    }

    #[test]
    fn bits_span_word_boundaries() {
        let depth = BITS_PER_WORD + 5;
        let last = (depth - 1) as u32;
        let map = GcMap::from_fail_locations(&[ref_at(0), ref_at(last)], depth);
        assert_eq!(map.words().len(), 2);
        assert!(map.bit(0));
        assert!(map.bit(last as usize));
        assert!(!map.bit(1));
        assert!(!map.bit(BITS_PER_WORD));
        assert_eq!(map.live_count(), 2);
    }

    #[test]
    fn out_of_range_bit_reads_false() {
        let map = GcMap::from_fail_locations(&[ref_at(0)], 4);
        assert!(!map.bit(4));
        assert!(!map.bit(1000));
    }

    #[test]
    #[should_panic(expected = "out of frame")]
    fn slot_beyond_frame_depth_rejected() {
        let _ = GcMap::from_fail_locations(&[ref_at(9)], 4);
    }

    #[test]
    fn interner_shares_equal_liveness() {
        let interner = GcMapInterner::new();
        let a = interner.intern(&[ref_at(0), ref_at(2)], 8);
        let b = interner.intern(&[ref_at(2), ref_at(0), int_at(1)], 8);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);

        let c = interner.intern(&[ref_at(1)], 8);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
    }
}
