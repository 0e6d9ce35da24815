//! Property tests for area placement and transfer chunking

use nfp_cpp_proxy::{
    cpp::{target, ACTION_RW},
    transfer::plan_chunks_with,
    AreaAllocator, CppId, SimulatedDevice, WindowManager, AREA_AUTO,
};
use proptest::prelude::*;

const PAGE: u64 = 4096;

#[derive(Debug, Clone)]
enum AreaOp {
    Auto(u64),       // pages
    At(u64, u64),    // page index, pages
    Release(usize),  // index into live areas
}

fn arb_area_op() -> impl Strategy<Value = AreaOp> {
    prop_oneof![
        (1u64..=8).prop_map(AreaOp::Auto),
        (0u64..64, 1u64..=8).prop_map(|(at, pages)| AreaOp::At(at, pages)),
        (0usize..16).prop_map(AreaOp::Release),
    ]
}

// ── Area placement ────────────────────────────────────────────

proptest! {
    /// Whatever mix of automatic and explicit requests and releases is
    /// applied, live areas stay page aligned and never overlap.
    #[test]
    fn areas_never_overlap(ops in proptest::collection::vec(arb_area_op(), 1..64)) {
        let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
        let mut areas = AreaAllocator::new(PAGE).unwrap();
        let id = CppId::new(target::MU, ACTION_RW, 0);

        for op in ops {
            let before = areas.len();
            match op {
                AreaOp::Auto(pages) => {
                    let offset = areas.request(&mut windows, AREA_AUTO, id, 0, pages * PAGE, 1).unwrap();
                    prop_assert_eq!(areas.len(), before + 1);
                    prop_assert_eq!(offset % PAGE, 0);
                }
                AreaOp::At(at, pages) => {
                    if areas.request(&mut windows, at * PAGE, id, 0, pages * PAGE, 1).is_err() {
                        prop_assert_eq!(areas.len(), before);
                    }
                }
                AreaOp::Release(n) => {
                    let offset = areas.iter().nth(n).map(|area| area.offset);
                    if let Some(offset) = offset {
                        areas.release(&mut windows, offset).unwrap();
                        prop_assert_eq!(areas.len(), before - 1);
                    }
                }
            }

            let live: Vec<_> = areas.iter().map(|area| (area.offset, area.end())).collect();
            for pair in live.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "areas {:?} overlap", pair);
            }
            prop_assert_eq!(windows.open_areas(), areas.len());
        }
    }

    /// A misaligned explicit request changes nothing.
    #[test]
    fn misaligned_request_is_inert(at in 1u64..PAGE, pages in 1u64..=4) {
        let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
        let mut areas = AreaAllocator::new(PAGE).unwrap();
        let id = CppId::new(target::MU, ACTION_RW, 0);
        areas.request(&mut windows, AREA_AUTO, id, 0, PAGE, 1).unwrap();

        prop_assert!(areas.request(&mut windows, at, id, 0, pages * PAGE, 1).is_err());
        prop_assert!(areas.request(&mut windows, AREA_AUTO, id, 0, pages * PAGE + at, 1).is_err());
        prop_assert_eq!(areas.len(), 1);
        prop_assert_eq!(windows.open_areas(), 1);
    }
}

// ── Chunking ──────────────────────────────────────────────────

proptest! {
    /// Chunks tile the transfer contiguously and none crosses a boundary
    /// multiple.
    #[test]
    fn chunks_respect_boundary(
        address in 0u64..(1 << 36),
        count in 0u64..(1 << 22),
        shift in 6u32..21,
    ) {
        let boundary = 1u64 << shift;
        let mut cursor = address;
        let mut total = 0u64;

        for (chunk_address, len) in plan_chunks_with(address, count, boundary) {
            prop_assert_eq!(chunk_address, cursor);
            prop_assert!(len > 0);
            prop_assert_eq!(chunk_address / boundary, (chunk_address + len - 1) / boundary);
            cursor += len;
            total += len;
        }
        prop_assert_eq!(total, count);
    }
}
