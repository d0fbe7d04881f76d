//! In-memory disk backend.

use crate::bio::{Bio, BioOp};
use crate::device::{BlockDev, DeviceGeometry, DeviceTable, RequestHandler};
use crate::page::{gather, scatter};
use crate::IoStats;
use fc_error::{Errno, IoStatus, Result};
use fc_types::{DeviceId, SECTOR_SIZE, Sector, SectorRange};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// RAM-backed disk that enforces its geometry.
///
/// Requests execute inline on the submitting thread unless the disk is
/// [held](MemDisk::hold), in which case they queue until
/// [`release`](MemDisk::release), which lets tests keep I/O in flight.
pub struct MemDisk {
    geometry: DeviceGeometry,
    bytes: Mutex<Vec<u8>>,
    held: Mutex<Option<VecDeque<Bio>>>,
    faults: Mutex<BTreeSet<u64>>,
    stats: Mutex<IoStats>,
}

impl MemDisk {
    #[must_use]
    pub fn new(geometry: DeviceGeometry) -> Arc<Self> {
        let len = usize::try_from(geometry.capacity_sectors * SECTOR_SIZE).unwrap_or(0);
        Arc::new(Self {
            geometry,
            bytes: Mutex::new(vec![0_u8; len]),
            held: Mutex::new(None),
            faults: Mutex::new(BTreeSet::new()),
            stats: Mutex::new(IoStats::default()),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Queue subsequent requests instead of executing them.
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(VecDeque::new());
        }
    }

    /// Stop holding and execute every queued request in arrival order on the
    /// calling thread. Returns the number released.
    pub fn release(&self) -> usize {
        let queued = self.held.lock().take().unwrap_or_default();
        let n = queued.len();
        for bio in queued {
            self.execute(bio);
        }
        n
    }

    /// Like [`release`](Self::release), but the newest request runs first.
    pub fn release_newest_first(&self) -> usize {
        let queued = self.held.lock().take().unwrap_or_default();
        let n = queued.len();
        for bio in queued.into_iter().rev() {
            self.execute(bio);
        }
        n
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().as_ref().map_or(0, VecDeque::len)
    }

    /// Fail every request that touches `sector` with `EIO`.
    pub fn fail_sector(&self, sector: Sector) {
        self.faults.lock().insert(sector.0);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Raw read bypassing the request path.
    #[must_use]
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes
            .lock()
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Raw write bypassing the request path.
    pub fn poke(&self, offset: usize, data: &[u8]) {
        if let Some(dst) = self.bytes.lock().get_mut(offset..offset + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }

    fn execute(&self, bio: Bio) {
        let status = self.service(&bio);
        if status.is_err() {
            self.stats.lock().errors += 1;
        }
        bio.complete(status);
    }

    fn service(&self, bio: &Bio) -> IoStatus {
        if bio.op() == BioOp::Flush {
            self.stats.lock().flushes += 1;
            return Ok(());
        }
        let range = bio.range();
        if range.end() > self.geometry.capacity_sectors {
            debug!(target: "fc::memdisk", sector = range.start.0, count = range.count, "request_out_of_bounds");
            return Err(Errno::EIO);
        }
        if bio.op().has_data() {
            self.check_shape(bio)?;
        }
        if self.touches_fault(range) {
            return Err(Errno::EIO);
        }

        let offset = usize::try_from(range.start.0 * SECTOR_SIZE).map_err(|_| Errno::EIO)?;
        let len = usize::try_from(bio.bytes()).map_err(|_| Errno::EIO)?;
        let mut stats = self.stats.lock();
        match bio.op() {
            BioOp::Read => {
                let data = self.peek(offset, len);
                scatter(bio.segments(), &data);
                stats.reads += 1;
                stats.bytes_read += bio.bytes();
            }
            BioOp::Write => {
                self.poke(offset, &gather(bio.segments()));
                stats.writes += 1;
                stats.bytes_written += bio.bytes();
            }
            BioOp::Discard => {
                if let Some(dst) = self.bytes.lock().get_mut(offset..offset + len) {
                    dst.fill(0);
                }
                stats.discards += 1;
            }
            BioOp::Flush => {}
        }
        stats.max_segments_seen = stats.max_segments_seen.max(bio.segments().len());
        drop(stats);
        trace!(target: "fc::memdisk", op = bio.op().as_str(), sector = range.start.0, count = range.count, "request_done");
        Ok(())
    }

    fn check_shape(&self, bio: &Bio) -> IoStatus {
        let lbs = u64::from(self.geometry.logical_block_size);
        let misaligned = (bio.sector().0 * SECTOR_SIZE) % lbs != 0 || bio.bytes() % lbs != 0;
        if bio.segments().len() > self.geometry.max_segments || misaligned || bio.bytes() == 0 {
            debug!(
                target: "fc::memdisk",
                sector = bio.sector().0,
                bytes = bio.bytes(),
                segments = bio.segments().len(),
                "request_violates_geometry"
            );
            self.stats.lock().rejected += 1;
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn touches_fault(&self, range: SectorRange) -> bool {
        self.faults
            .lock()
            .range(range.start.0..range.end())
            .next()
            .is_some()
    }
}

impl RequestHandler for MemDisk {
    fn make_request(&self, bio: Bio) {
        let bio = {
            let mut held = self.held.lock();
            match held.as_mut() {
                Some(queue) => {
                    queue.push_back(bio);
                    return;
                }
                None => bio,
            }
        };
        self.execute(bio);
    }
}

impl std::fmt::Debug for MemDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDisk")
            .field("geometry", &self.geometry)
            .field("held", &self.held_count())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl DeviceTable {
    /// Register a new in-memory disk under `name`.
    pub fn add_mem_disk(
        &self,
        name: &str,
        id: DeviceId,
        geometry: DeviceGeometry,
    ) -> Result<(Arc<BlockDev>, Arc<MemDisk>)> {
        let mem = MemDisk::new(geometry);
        let bdev = self.add_disk(name, id, geometry, Arc::clone(&mem) as Arc<dyn RequestHandler>)?;
        Ok((bdev, mem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BioCompletion;
    use crate::page::{Page, Segment};
    use std::sync::mpsc;

    fn disk(lbs: u32, max_segments: usize) -> (Arc<BlockDev>, Arc<MemDisk>) {
        let table = DeviceTable::new();
        table
            .add_mem_disk(
                "mem0",
                DeviceId::new(7, 0),
                DeviceGeometry::new(lbs, max_segments, 64).expect("geometry"),
            )
            .expect("mem disk")
    }

    fn submit(
        bdev: &Arc<BlockDev>,
        sector: u64,
        op: BioOp,
        segments: Vec<Segment>,
    ) -> mpsc::Receiver<BioCompletion> {
        let (tx, rx) = mpsc::channel();
        bdev.submit(
            Bio::new(Arc::clone(bdev), Sector(sector), op, segments)
                .with_end_io(move |c| tx.send(c).expect("send")),
        );
        rx
    }

    #[test]
    fn write_then_read_back() {
        let (bdev, mem) = disk(512, 4);
        let data = Page::from_vec(vec![0xAB; 1024]);
        let rx = submit(&bdev, 4, BioOp::Write, vec![Segment::whole(data)]);
        assert_eq!(rx.recv().expect("write").status, Ok(()));

        let out = Page::zeroed(1024);
        let rx = submit(&bdev, 4, BioOp::Read, vec![Segment::whole(out.clone())]);
        assert_eq!(rx.recv().expect("read").status, Ok(()));
        assert_eq!(out.to_vec(), vec![0xAB; 1024]);
        assert_eq!(mem.peek(4 * 512, 1), vec![0xAB]);

        let stats = mem.stats();
        assert_eq!((stats.reads, stats.writes), (1, 1));
        assert_eq!(stats.bytes_written, 1024);
    }

    #[test]
    fn rejects_misaligned_and_oversegmented_requests() {
        let (bdev, mem) = disk(4096, 2);
        let rx = submit(&bdev, 1, BioOp::Read, vec![Segment::whole(Page::zeroed(4096))]);
        assert_eq!(rx.recv().expect("done").status, Err(Errno::EINVAL));

        let segs = (0..3).map(|_| Segment::whole(Page::zeroed(4096))).collect();
        let rx = submit(&bdev, 0, BioOp::Write, segs);
        assert_eq!(rx.recv().expect("done").status, Err(Errno::EINVAL));
        assert_eq!(mem.stats().rejected, 2);
    }

    #[test]
    fn held_requests_complete_on_release() {
        let (bdev, mem) = disk(512, 4);
        mem.hold();
        let rx = submit(&bdev, 0, BioOp::Read, vec![Segment::whole(Page::zeroed(512))]);
        assert!(rx.try_recv().is_err());
        assert_eq!(mem.held_count(), 1);
        assert_eq!(mem.release(), 1);
        assert_eq!(rx.recv().expect("done").status, Ok(()));
    }

    #[test]
    fn release_newest_first_reverses_queued_order() {
        let (bdev, mem) = disk(512, 4);
        mem.hold();
        let first = submit(&bdev, 0, BioOp::Write, vec![Segment::whole(Page::from_vec(vec![1; 512]))]);
        let second = submit(&bdev, 0, BioOp::Write, vec![Segment::whole(Page::from_vec(vec![2; 512]))]);
        assert_eq!(mem.release_newest_first(), 2);
        assert_eq!(first.recv().expect("done").status, Ok(()));
        assert_eq!(second.recv().expect("done").status, Ok(()));
        // The older write ran last.
        assert_eq!(mem.peek(0, 512), vec![1; 512]);
    }

    #[test]
    fn injected_fault_fails_overlapping_requests_only() {
        let (bdev, mem) = disk(512, 4);
        mem.fail_sector(Sector(10));
        let rx = submit(&bdev, 9, BioOp::Read, vec![Segment::whole(Page::zeroed(1024))]);
        assert_eq!(rx.recv().expect("done").status, Err(Errno::EIO));
        let rx = submit(&bdev, 11, BioOp::Read, vec![Segment::whole(Page::zeroed(512))]);
        assert_eq!(rx.recv().expect("done").status, Ok(()));
        mem.clear_faults();
        let rx = submit(&bdev, 10, BioOp::Read, vec![Segment::whole(Page::zeroed(512))]);
        assert_eq!(rx.recv().expect("done").status, Ok(()));
        assert_eq!(mem.stats().errors, 1);
    }

    #[test]
    fn discard_zeroes_range() {
        let (bdev, mem) = disk(512, 4);
        mem.poke(0, &[0xFF; 2048]);
        let (tx, rx) = mpsc::channel();
        bdev.submit(
            Bio::discard(Arc::clone(&bdev), Sector(1), 2).with_end_io(move |c| tx.send(c).expect("send")),
        );
        assert_eq!(rx.recv().expect("done").status, Ok(()));
        assert_eq!(mem.peek(0, 512), vec![0xFF; 512]);
        assert_eq!(mem.peek(512, 1024), vec![0; 1024]);
        assert_eq!(mem.peek(1536, 512), vec![0xFF; 512]);
    }
}
