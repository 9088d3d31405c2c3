//! Property-based tests for scatter-gather offset resolution.

use mcas_backend::MemoryRegion;
use mcas_shard::offset_to_sg_list;
use proptest::prelude::*;

/// Generator for a plausible region list: 1..6 regions of 1..64 KiB,
/// placed at non-contiguous synthetic bases.
fn any_regions() -> impl Strategy<Value = Vec<MemoryRegion>> {
    proptest::collection::vec(1usize..64 * 1024, 1..6).prop_map(|lens| {
        let mut base = 0x1000_0000u64;
        lens.into_iter()
            .map(|len| {
                let r = MemoryRegion { base, len };
                // keep a gap so adjacent regions are never contiguous
                base += (len as u64) + 0x10_0000;
                r
            })
            .collect()
    })
}

proptest! {
    /// The SG list bytes sum to exactly `size - excess_length`, and no
    /// element escapes its region.
    #[test]
    fn test_sg_coverage_and_bounds(
        regions in any_regions(),
        lo in 0u64..200_000,
        size in 1u64..200_000,
    ) {
        let total: u64 = regions.iter().map(|r| r.len as u64).sum();
        prop_assume!(lo < total);

        let r = offset_to_sg_list(lo, lo + size, &regions).expect("in-range request resolves");

        let covered: u64 = r.sg_list.iter().map(|e| e.len).sum();
        prop_assert_eq!(covered, size - r.excess_length);

        for e in &r.sg_list {
            let inside = regions.iter().any(|region| {
                e.addr >= region.base && e.addr + e.len <= region.base + region.len as u64
            });
            prop_assert!(inside, "element {:#x}+{} outside every region", e.addr, e.len);
        }
    }

    /// Elements are emitted in offset order and are non-empty, and the
    /// registration range encloses them all.
    #[test]
    fn test_sg_elements_ordered_and_enclosed(
        regions in any_regions(),
        lo in 0u64..100_000,
        size in 1u64..100_000,
    ) {
        let total: u64 = regions.iter().map(|r| r.len as u64).sum();
        prop_assume!(lo < total);

        let r = offset_to_sg_list(lo, lo + size, &regions).expect("resolves");
        prop_assert!(!r.sg_list.is_empty());
        for e in &r.sg_list {
            prop_assert!(e.len > 0);
            prop_assert!(r.mr_low <= e.addr);
            prop_assert!(e.addr + e.len <= r.mr_high);
        }
        prop_assert_eq!(r.mr_low, r.sg_list[0].addr);
        let last = r.sg_list.last().expect("non-empty");
        prop_assert_eq!(r.mr_high, last.addr + last.len);
    }

    /// Splitting a request at any midpoint covers the same bytes as one
    /// request over the whole range.
    #[test]
    fn test_sg_split_composes(
        regions in any_regions(),
        lo in 0u64..50_000,
        a in 1u64..25_000,
        b in 1u64..25_000,
    ) {
        let total: u64 = regions.iter().map(|r| r.len as u64).sum();
        prop_assume!(lo + a + b <= total);

        let whole = offset_to_sg_list(lo, lo + a + b, &regions).expect("whole resolves");
        let left = offset_to_sg_list(lo, lo + a, &regions).expect("left resolves");
        let right = offset_to_sg_list(lo + a, lo + a + b, &regions).expect("right resolves");

        prop_assert_eq!(whole.excess_length, 0);
        let whole_bytes: u64 = whole.sg_list.iter().map(|e| e.len).sum();
        let split_bytes: u64 = left.sg_list.iter().chain(right.sg_list.iter()).map(|e| e.len).sum();
        prop_assert_eq!(whole_bytes, split_bytes);
        prop_assert_eq!(whole.mr_low, left.mr_low);
        prop_assert_eq!(whole.mr_high, right.mr_high);
    }
}
