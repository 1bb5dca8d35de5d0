//! Arena heap properties: live blocks never overlap, frees coalesce

use proptest::prelude::*;
use rtx_shared_memory::{Heap, HeapHeader, Segment, SegmentKey, SegmentManager, ShmOff};

const ARENA: usize = 64 * 1024;

fn arena() -> Segment {
    SegmentManager::create_anonymous(SegmentKey::from_raw(0x00AB_CDEF), ARENA, 1, 1)
        .expect("anonymous segment")
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..2048).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..200)) {
        let seg = arena();
        // SAFETY: the header sits in [0, 64), the arena after it.
        let mut heap = unsafe {
            Heap::init(seg.data_ptr(), seg.data_ptr() as *mut HeapHeader, 64, ARENA as u32)
        };
        let mut live: Vec<(ShmOff, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(off) = heap.alloc(size) {
                        prop_assert_eq!(off % 8, 0);
                        prop_assert!(heap.usable_size(off).unwrap() >= size);
                        for &(o, s) in &live {
                            let disjoint = off as usize + size <= o as usize
                                || o as usize + s <= off as usize;
                            prop_assert!(disjoint, "{off}+{size} overlaps {o}+{s}");
                        }
                        live.push((off, size));
                    }
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let (off, _) = live.swap_remove(i % live.len());
                        prop_assert!(heap.free(off).is_ok());
                        prop_assert!(heap.free(off).is_err());
                    }
                }
            }
            prop_assert!(heap.check());
            prop_assert_eq!(heap.stats().live as usize, live.len());
        }

        for (off, _) in live.drain(..) {
            heap.free(off).unwrap();
        }
        let stats = heap.stats();
        prop_assert_eq!(stats.fragments, 1);
        prop_assert_eq!(stats.free, stats.total);
    }
}

#[test]
fn exhaustion_reports_available_bytes() {
    let seg = arena();
    // SAFETY: as above.
    let mut heap =
        unsafe { Heap::init(seg.data_ptr(), seg.data_ptr() as *mut HeapHeader, 64, ARENA as u32) };
    let err = heap.alloc(ARENA).unwrap_err();
    assert!(matches!(
        err,
        rtx_shared_memory::ShmError::AllocationExhausted { requested, .. } if requested == ARENA
    ));
}
