//! Property tests for sub-block staging.

use fc_block::{BioOp, DeviceGeometry, DeviceTable, Page, Segment};
use fc_io::{IoEngine, IoTarget, PagePool};
use fc_types::{DeviceId, Sector, SectorRange};
use proptest::prelude::*;
use std::time::Duration;

const BLOCK: usize = 4096;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Writing any sector sub-range then reading it back returns the written
    /// bytes, and every other byte of the disk is untouched.
    #[test]
    fn sub_block_write_round_trips(
        start in 0_u64..24,
        len in 1_u64..16,
        fill in any::<u8>(),
        background in any::<u8>(),
        max_segments in 1_usize..4,
    ) {
        prop_assume!(fill != background);
        let table = DeviceTable::new();
        let (bdev, mem) = table
            .add_mem_disk("mem0", DeviceId::new(7, 0), DeviceGeometry::new(BLOCK as u32, max_segments, 64).expect("geometry"))
            .expect("disk");
        mem.poke(0, &vec![background; 64 * 512]);
        let target = IoTarget::routed(bdev);
        let engine = IoEngine::new(PagePool::new(8), Duration::from_millis(1));

        let bytes = usize::try_from(len * 512).expect("len");
        let region = SectorRange::new(Sector(start), len);
        engine
            .submit_sync(&target, region, BioOp::Write, &[Segment::whole(Page::from_vec(vec![fill; bytes]))])
            .expect("write");

        let out = Page::zeroed(bytes);
        engine
            .submit_sync(&target, region, BioOp::Read, &[Segment::whole(out.clone())])
            .expect("read");
        prop_assert_eq!(out.to_vec(), vec![fill; bytes]);

        let lo = usize::try_from(start * 512).expect("lo");
        prop_assert!(mem.peek(0, lo).iter().all(|b| *b == background));
        prop_assert!(mem.peek(lo + bytes, 64 * 512 - lo - bytes).iter().all(|b| *b == background));
    }
}
