//! Alignment/split engine.
//!
//! [`IoEngine::dispatch`] turns one logical region into physically valid
//! submissions on an [`IoTarget`]:
//!
//! - A leading or trailing piece that starts off a logical-block boundary,
//!   or is shorter than one logical block, is staged: the containing block is
//!   read into a pool page, the caller's bytes are copied out of it (read) or
//!   into it (write), and for writes the whole block is written back before
//!   the piece completes.
//! - Aligned runs are grouped into the fewest bios that respect the target's
//!   `max_segments`; a fragment only partly consumed by one bio continues in
//!   the next.
//!
//! Every submission holds one [`IoRef`] on the caller's tracker.

use crate::pool::PagePool;
use crate::target::IoTarget;
use crate::tracker::{IoRef, IoTracker};
use fc_block::{Bio, BioOp, Segment, SegmentCursor, gather, scatter, segments_len};
use fc_error::{FcError, IoStatus, Result};
use fc_types::{SECTOR_SIZE, Sector, SectorRange};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Counters for one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    /// Aligned bios issued directly.
    pub submissions: u64,
    /// Read-modify-write staging operations.
    pub staged: u64,
    /// Aligned blocks that had to be bounced because their fragments could
    /// not fill a block within the segment limit.
    pub bounced: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submissions: AtomicU64,
    staged: AtomicU64,
    bounced: AtomicU64,
}

#[derive(Debug)]
pub struct IoEngine {
    pool: Arc<PagePool>,
    abort_poll: Duration,
    counters: Counters,
}

impl IoEngine {
    /// `abort_poll` is the sleep between checks while waiting out the
    /// issued parts of a partially submitted operation.
    #[must_use]
    pub fn new(pool: Arc<PagePool>, abort_poll: Duration) -> Self {
        Self {
            pool,
            abort_poll,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            submissions: self.counters.submissions.load(Ordering::Relaxed),
            staged: self.counters.staged.load(Ordering::Relaxed),
            bounced: self.counters.bounced.load(Ordering::Relaxed),
        }
    }

    /// Issue `region` (relative to `target`) under `tracker`.
    ///
    /// On error nothing further is issued; parts already issued still hold
    /// references, so the caller must [`IoTracker::abort`] the tracker.
    pub fn dispatch(
        &self,
        target: &IoTarget,
        region: SectorRange,
        op: BioOp,
        segments: &[Segment],
        tracker: &IoTracker,
    ) -> Result<()> {
        if op != BioOp::Flush && region.end() > target.bdev().nr_sects() {
            return Err(FcError::InvalidArgument(format!(
                "region {region} beyond {} ({} sectors)",
                target.name(),
                target.bdev().nr_sects()
            )));
        }
        match op {
            BioOp::Flush => {
                let part = tracker.get();
                target.submit(
                    Bio::flush(Arc::clone(target.bdev()))
                        .with_end_io(move |c| part.finish(c.status)),
                );
                Ok(())
            }
            BioOp::Discard => {
                let part = tracker.get();
                target.submit(
                    Bio::discard(Arc::clone(target.bdev()), region.start, region.count)
                        .with_end_io(move |c| part.finish(c.status)),
                );
                Ok(())
            }
            BioOp::Read | BioOp::Write => self.dispatch_data(target, region, op, segments, tracker),
        }
    }

    fn dispatch_data(
        &self,
        target: &IoTarget,
        region: SectorRange,
        op: BioOp,
        segments: &[Segment],
        tracker: &IoTracker,
    ) -> Result<()> {
        let expected = region.count * SECTOR_SIZE;
        if segments_len(segments) as u64 != expected {
            return Err(FcError::InvalidArgument(format!(
                "fragments carry {} bytes for a {expected}-byte region",
                segments_len(segments)
            )));
        }
        let geometry = *target.geometry();
        let lbs = geometry.lbs_sectors();
        let lbs_bytes = geometry.logical_block_size as usize;

        let mut cursor = SegmentCursor::new(segments);
        let mut sector = region.start.0;
        let mut left = region.count;
        while left > 0 {
            let within = sector % lbs;
            if within != 0 || left < lbs {
                let n = (lbs - within).min(left);
                let pieces = cursor.take(sector_bytes(n), usize::MAX);
                self.stage(target, Sector(sector - within), within, op, pieces, tracker)?;
                sector += n;
                left -= n;
                continue;
            }

            let run = left - left % lbs;
            let mut pieces = cursor.take(sector_bytes(run), geometry.max_segments);
            let taken = segments_len(&pieces);
            let excess = taken % lbs_bytes;
            if excess != 0 {
                cursor.rewind(excess);
                trim_tail(&mut pieces, excess);
            }
            let usable = taken - excess;
            if usable == 0 {
                let pieces = cursor.take(lbs_bytes, usize::MAX);
                self.counters.bounced.fetch_add(1, Ordering::Relaxed);
                self.stage(target, Sector(sector), 0, op, pieces, tracker)?;
                sector += lbs;
                left -= lbs;
                continue;
            }

            let n = usable as u64 / SECTOR_SIZE;
            trace!(
                target: "fc::io",
                device = %target.name(),
                sector,
                count = n,
                segments = pieces.len(),
                "aligned_submit"
            );
            let part = tracker.get();
            self.counters.submissions.fetch_add(1, Ordering::Relaxed);
            target.submit(
                Bio::new(Arc::clone(target.bdev()), Sector(sector), op, pieces)
                    .with_end_io(move |c| part.finish(c.status)),
            );
            sector += n;
            left -= n;
        }
        Ok(())
    }

    /// Read-modify-write one logical block for a sub-block piece starting
    /// `within` sectors into the block at `block`.
    fn stage(
        &self,
        target: &IoTarget,
        block: Sector,
        within: u64,
        op: BioOp,
        fragments: Vec<Segment>,
        tracker: &IoTracker,
    ) -> Result<()> {
        let staging = self
            .pool
            .try_page(target.geometry().logical_block_size as usize)?;
        let done: IoRef = tracker.get();
        self.counters.staged.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "fc::io",
            device = %target.name(),
            block = block.0,
            within,
            bytes = segments_len(&fragments),
            op = op.as_str(),
            "unaligned_staging"
        );

        let offset = sector_bytes(within);
        let page = staging.page().clone();
        let write_target = target.clone();
        let read = Bio::new(
            Arc::clone(target.bdev()),
            block,
            BioOp::Read,
            vec![Segment::whole(page.clone())],
        )
        .with_sync(true)
        .with_end_io(move |c| {
            if c.status.is_err() {
                done.finish(c.status);
                return;
            }
            if op == BioOp::Write {
                page.write_at(offset, &gather(&fragments));
                let write = Bio::new(
                    Arc::clone(write_target.bdev()),
                    block,
                    BioOp::Write,
                    vec![Segment::whole(page)],
                )
                .with_sync(true)
                .with_end_io(move |c| {
                    drop(staging);
                    done.finish(c.status);
                });
                write_target.submit(write);
            } else {
                let mut buf = vec![0_u8; segments_len(&fragments)];
                page.read_at(offset, &mut buf);
                scatter(&fragments, &buf);
                drop(staging);
                done.finish(Ok(()));
            }
        });
        target.submit(read);
        Ok(())
    }

    /// Issue `region` and block until it completes.
    pub fn submit_sync(
        &self,
        target: &IoTarget,
        region: SectorRange,
        op: BioOp,
        segments: &[Segment],
    ) -> Result<()> {
        let tracker = IoTracker::sync();
        if let Err(err) = self.dispatch(target, region, op, segments, &tracker) {
            let _ = tracker.abort(self.abort_poll);
            return Err(err);
        }
        tracker.wait().map_err(|errno| FcError::DeviceIo {
            device: target.name().to_owned(),
            errno,
        })
    }

    /// Issue `region` and run `done` once every part has completed.
    ///
    /// If submission fails partway, `done` never runs and the error is
    /// returned after the issued parts have drained.
    pub fn submit_async(
        &self,
        target: &IoTarget,
        region: SectorRange,
        op: BioOp,
        segments: &[Segment],
        done: impl FnOnce(IoStatus) + Send + 'static,
    ) -> Result<()> {
        let tracker = IoTracker::with_callback(done);
        if let Err(err) = self.dispatch(target, region, op, segments, &tracker) {
            let _ = tracker.abort(self.abort_poll);
            return Err(err);
        }
        tracker.submit();
        Ok(())
    }

    /// Zero-payload flush; returns once every earlier completion on the
    /// target's path has been ordered before it.
    pub fn barrier(&self, target: &IoTarget) -> Result<()> {
        self.submit_sync(target, SectorRange::new(Sector::ZERO, 0), BioOp::Flush, &[])
    }
}

fn sector_bytes(sectors: u64) -> usize {
    usize::try_from(sectors * SECTOR_SIZE).unwrap_or(usize::MAX)
}

fn trim_tail(pieces: &mut Vec<Segment>, mut excess: usize) {
    while excess > 0 {
        let Some(last) = pieces.pop() else {
            return;
        };
        if last.len() > excess {
            pieces.push(last.slice(0, last.len() - excess));
            return;
        }
        excess -= last.len();
    }
}
