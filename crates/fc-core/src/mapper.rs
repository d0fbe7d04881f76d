//! Serves one routed request against its cache instance.
//!
//! The request arrives rebased onto the source device and is processed one
//! cache block at a time. Source-bound pieces of adjacent blocks are merged
//! back into a single submission. Every physical submission holds a share
//! of one tracker, whose callback completes the caller's bio and only then
//! releases the instance's in-flight count.

use crate::cachemap::{Admission, Lookup, SlotState};
use crate::cleaner;
use crate::instance::{CacheInstance, Counters, InflightGuard};
use fc_block::{Bio, BioOp, Segment, SegmentCursor};
use fc_error::{Errno, IoStatus, Result};
use fc_io::{IoRef, IoTracker};
use fc_types::{BlockSectors, CacheMode, SECTOR_SIZE, Sector, SectorRange};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// A request the mapper refused before or during submission. The shim
/// restores its original sector and completes it with `errno`.
pub(crate) struct Rejected {
    pub(crate) bio: Bio,
    pub(crate) errno: Errno,
}

/// Serve `bio`, already rebased onto the source device. `origin` is its
/// sector before rebasing; a request that fails completes addressed there.
pub(crate) fn map(
    inst: &Arc<CacheInstance>,
    bio: Bio,
    origin: Sector,
    inflight: InflightGuard,
) -> std::result::Result<(), Rejected> {
    let range = bio.range();
    let op = bio.op();
    if op != BioOp::Flush && range.end() > inst.source().nr_sects() {
        debug!(
            target: "fc::mapper",
            name = %inst.name(),
            sector = range.start.0,
            count = range.count,
            "request_beyond_source"
        );
        return Err(Rejected {
            bio,
            errno: Errno::EINVAL,
        });
    }
    match op {
        BioOp::Read => Counters::bump(&inst.counters.reads),
        BioOp::Write => Counters::bump(&inst.counters.writes),
        BioOp::Discard | BioOp::Flush => {}
    }

    let segments = bio.segments().to_vec();
    let parked = Arc::new(Mutex::new(Some(bio)));
    let tracker = {
        let parked = Arc::clone(&parked);
        let inst = Arc::clone(inst);
        IoTracker::with_callback(move |status| {
            if status.is_err() && op == BioOp::Write {
                forget_clean_blocks(&inst, range);
            }
            let bio = parked.lock().take();
            if let Some(mut bio) = bio {
                if status.is_err() {
                    bio.set_sector(origin);
                }
                bio.complete(status);
            }
            drop(inflight);
        })
    };

    let issued = if inst.is_failed() {
        Counters::bump(&inst.counters.uncached);
        inst.engine
            .dispatch(&inst.source_target(), range, op, &segments, &tracker)
    } else {
        match op {
            BioOp::Read => map_read(inst, range, &segments, &tracker),
            BioOp::Write => map_write(inst, range, &segments, &tracker),
            BioOp::Discard => map_discard(inst, range, &tracker),
            BioOp::Flush => map_flush(inst, &tracker),
        }
    };

    match issued {
        Ok(()) => {
            tracker.submit();
            Ok(())
        }
        Err(err) => {
            let _ = tracker.abort(inst.config().structural_drain_poll());
            let bio = parked.lock().take();
            debug!(target: "fc::mapper", name = %inst.name(), error = %err, "map_failed");
            bio.map_or(Ok(()), |bio| {
                Err(Rejected {
                    bio,
                    errno: err.as_errno(),
                })
            })
        }
    }
}

/// Split `range` at cache block boundaries.
fn block_pieces(bs: BlockSectors, range: SectorRange) -> impl Iterator<Item = (u64, SectorRange)> {
    let mut sector = range.start.0;
    let end = range.end();
    std::iter::from_fn(move || {
        if sector >= end {
            return None;
        }
        let block = bs.block_of(Sector(sector));
        let block_end = bs.first_sector(block + 1).0;
        let n = block_end.min(end) - sector;
        let piece = SectorRange::new(Sector(sector), n);
        sector += n;
        Some((block, piece))
    })
}

fn piece_bytes(piece: SectorRange) -> usize {
    usize::try_from(piece.count * SECTOR_SIZE).unwrap_or(usize::MAX)
}

/// Adjacent source-bound pieces, merged into one submission.
#[derive(Default)]
struct SourceRun {
    range: Option<SectorRange>,
    segments: Vec<Segment>,
}

impl SourceRun {
    fn push(
        &mut self,
        inst: &CacheInstance,
        op: BioOp,
        tracker: &IoTracker,
        piece: SectorRange,
        fragments: Vec<Segment>,
    ) -> Result<()> {
        match &mut self.range {
            Some(run) if run.end() == piece.start.0 => run.count += piece.count,
            _ => {
                self.flush(inst, op, tracker)?;
                self.range = Some(piece);
            }
        }
        self.segments.extend(fragments);
        Ok(())
    }

    fn flush(&mut self, inst: &CacheInstance, op: BioOp, tracker: &IoTracker) -> Result<()> {
        if let Some(range) = self.range.take() {
            let segments = std::mem::take(&mut self.segments);
            inst.engine
                .dispatch(&inst.source_target(), range, op, &segments, tracker)?;
        }
        Ok(())
    }
}

/// One cache-device share of a mapped request.
///
/// Settles the residency map and the caller's tracker share when dropped,
/// which happens after the device completes or, if submission failed,
/// when the unused completion closure is discarded.
struct CacheShare {
    inst: Arc<CacheInstance>,
    part: Option<IoRef>,
    /// Cache-device status; `None` until the device completes.
    device: Option<IoStatus>,
    /// Status reported to the caller instead of the device status.
    caller: Option<IoStatus>,
    fill: Option<(u64, Admission, SlotState)>,
    /// Dirty block being rewritten. Marked dirty again once the write lands,
    /// so a flush that copied the older contents cannot leave it clean.
    redirty: Option<u64>,
    invalidate_on_error: Option<u64>,
    /// Slot pinned by a cache read hit.
    pinned: Option<u64>,
}

impl CacheShare {
    fn new(inst: &Arc<CacheInstance>, tracker: &IoTracker) -> Self {
        Self {
            inst: Arc::clone(inst),
            part: Some(tracker.get()),
            device: None,
            caller: None,
            fill: None,
            redirty: None,
            invalidate_on_error: None,
            pinned: None,
        }
    }

    fn submit(self, region: SectorRange, op: BioOp, fragments: &[Segment]) -> Result<()> {
        let inst = Arc::clone(&self.inst);
        inst.engine
            .submit_async(&inst.cache_target(), region, op, fragments, move |status| {
                let mut share = self;
                share.device = Some(status);
            })
    }
}

impl Drop for CacheShare {
    fn drop(&mut self) {
        if let Some(Err(errno)) = self.device {
            self.inst.mark_failed(errno);
        }
        let ok = matches!(self.device, Some(Ok(())));
        {
            let mut map = self.inst.map.lock();
            if let Some((block, admission, state)) = self.fill {
                map.complete_fill(block, admission, ok, state);
            }
            if ok {
                if let Some(block) = self.redirty {
                    map.mark_dirty(block);
                }
            } else if let Some(block) = self.invalidate_on_error {
                map.invalidate(block);
            }
            if let Some(slot) = self.pinned {
                map.unpin_read(slot);
            }
        }
        if let Some(part) = self.part.take() {
            let status = self
                .caller
                .unwrap_or_else(|| self.device.unwrap_or(Err(Errno::EIO)));
            part.finish(status);
        }
    }
}

fn map_read(
    inst: &Arc<CacheInstance>,
    range: SectorRange,
    segments: &[Segment],
    tracker: &IoTracker,
) -> Result<()> {
    let bs = inst.block_sectors();
    let full = u64::from(bs.get());
    let populate_allowed = !inst.flags().read_only;
    let mut cursor = SegmentCursor::new(segments);
    let mut run = SourceRun::default();

    for (block, piece) in block_pieces(bs, range) {
        let fragments = cursor.take(piece_bytes(piece), usize::MAX);
        let lookup = inst.map.lock().pin_for_read(block);
        match lookup {
            Lookup::Resident { slot, .. } => {
                Counters::bump(&inst.counters.read_hits);
                if let Err(err) = run.flush(inst, BioOp::Read, tracker) {
                    inst.map.lock().unpin_read(slot);
                    return Err(err);
                }
                // The share owns the pin from here and unpins when dropped.
                let mut share = CacheShare::new(inst, tracker);
                share.pinned = Some(slot);
                let offset = piece.start.0 - bs.first_sector(block).0;
                share.submit(
                    inst.slot_region(slot, offset, piece.count),
                    BioOp::Read,
                    &fragments,
                )?;
            }
            Lookup::Absent if populate_allowed && piece.count == full => {
                let admission = inst.map.lock().admit(block);
                match admission {
                    Some(admission) => {
                        run.flush(inst, BioOp::Read, tracker)?;
                        populate(inst, block, admission, piece, fragments, tracker)?;
                    }
                    None => run.push(inst, BioOp::Read, tracker, piece, fragments)?,
                }
            }
            Lookup::Absent | Lookup::Filling => {
                run.push(inst, BioOp::Read, tracker, piece, fragments)?;
            }
        }
    }
    run.flush(inst, BioOp::Read, tracker)
}

/// Read a full block miss from the source, then install it in the cache.
/// The caller sees only the source read's status.
fn populate(
    inst: &Arc<CacheInstance>,
    block: u64,
    admission: Admission,
    piece: SectorRange,
    fragments: Vec<Segment>,
    tracker: &IoTracker,
) -> Result<()> {
    let mut share = CacheShare::new(inst, tracker);
    share.fill = Some((block, admission, SlotState::Valid));
    share.caller = Some(Err(Errno::EIO));
    let region = inst.slot_region(admission.slot, 0, piece.count);
    trace!(target: "fc::mapper", name = %inst.name(), block, slot = admission.slot, "read_miss_populate");

    let cache_fragments = fragments.clone();
    inst.engine.submit_async(
        &inst.source_target(),
        piece,
        BioOp::Read,
        &fragments,
        move |status| {
            let mut share = share;
            share.caller = Some(status);
            if status.is_err() {
                return;
            }
            // A refused cache write drops the share: the fill is abandoned
            // and the caller still sees the successful source read.
            let _ = share.submit(region, BioOp::Write, &cache_fragments);
        },
    )
}

fn map_write(
    inst: &Arc<CacheInstance>,
    range: SectorRange,
    segments: &[Segment],
    tracker: &IoTracker,
) -> Result<()> {
    let bs = inst.block_sectors();
    let full = u64::from(bs.get());
    let mode = inst.mode();
    let flags = inst.flags();
    let cacheable = mode != CacheMode::ReadOnly && !flags.read_only;
    let write_back = cacheable && mode.is_write_back() && !flags.flush_in_progress;
    let mut cursor = SegmentCursor::new(segments);
    let mut run = SourceRun::default();
    let mut dirtied = false;

    for (block, piece) in block_pieces(bs, range) {
        let fragments = cursor.take(piece_bytes(piece), usize::MAX);
        let offset = piece.start.0 - bs.first_sector(block).0;
        let lookup = inst.map.lock().lookup(block);
        match lookup {
            Lookup::Resident { slot, dirty } => {
                Counters::bump(&inst.counters.write_hits);
                let region = inst.slot_region(slot, offset, piece.count);
                if write_back || (cacheable && dirty) {
                    // Dirty blocks stay cache-only even while a drain is
                    // running; only new dirty blocks are refused.
                    inst.map.lock().mark_dirty(block);
                    dirtied = true;
                    let mut share = CacheShare::new(inst, tracker);
                    share.redirty = Some(block);
                    share.invalidate_on_error = Some(block);
                    share.submit(region, BioOp::Write, &fragments)?;
                } else if cacheable || dirty {
                    // Keep the cached copy current; the caller sees the
                    // source write's status.
                    inst.map.lock().note_write(block);
                    let mut share = CacheShare::new(inst, tracker);
                    share.invalidate_on_error = Some(block);
                    share.caller = Some(Ok(()));
                    share.submit(region, BioOp::Write, &fragments)?;
                    run.push(inst, BioOp::Write, tracker, piece, fragments)?;
                } else {
                    inst.map.lock().invalidate(block);
                    run.push(inst, BioOp::Write, tracker, piece, fragments)?;
                }
            }
            Lookup::Filling => {
                inst.map.lock().invalidate(block);
                run.push(inst, BioOp::Write, tracker, piece, fragments)?;
            }
            Lookup::Absent => {
                let admission = if cacheable && piece.count == full {
                    inst.map.lock().admit(block)
                } else {
                    None
                };
                let region = |a: Admission| inst.slot_region(a.slot, 0, full);
                match admission {
                    Some(a) if write_back => {
                        dirtied = true;
                        let mut share = CacheShare::new(inst, tracker);
                        share.fill = Some((block, a, SlotState::Dirty));
                        share.submit(region(a), BioOp::Write, &fragments)?;
                    }
                    Some(a) => {
                        let mut share = CacheShare::new(inst, tracker);
                        share.fill = Some((block, a, SlotState::Valid));
                        share.caller = Some(Ok(()));
                        share.submit(region(a), BioOp::Write, &fragments)?;
                        run.push(inst, BioOp::Write, tracker, piece, fragments)?;
                    }
                    None => run.push(inst, BioOp::Write, tracker, piece, fragments)?,
                }
            }
        }
    }
    run.flush(inst, BioOp::Write, tracker)?;
    if dirtied {
        cleaner::kick_if_over_high_water(inst);
    }
    Ok(())
}

fn map_discard(inst: &Arc<CacheInstance>, range: SectorRange, tracker: &IoTracker) -> Result<()> {
    let bs = inst.block_sectors();
    let full = u64::from(bs.get());
    {
        let mut map = inst.map.lock();
        for (block, piece) in block_pieces(bs, range) {
            if piece.count == full && map.state_of(block) != SlotState::Dirty {
                map.invalidate(block);
            }
        }
    }
    inst.engine
        .dispatch(&inst.source_target(), range, BioOp::Discard, &[], tracker)
}

/// After a failed write the cached copy of a clean block may be newer than
/// the source; drop it.
fn forget_clean_blocks(inst: &CacheInstance, range: SectorRange) {
    let bs = inst.block_sectors();
    let mut map = inst.map.lock();
    for (block, _) in block_pieces(bs, range) {
        if map.state_of(block) != SlotState::Dirty {
            map.invalidate(block);
        }
    }
}

fn map_flush(inst: &Arc<CacheInstance>, tracker: &IoTracker) -> Result<()> {
    let empty = SectorRange::new(Sector::ZERO, 0);
    inst.engine
        .dispatch(&inst.cache_target(), empty, BioOp::Flush, &[], tracker)?;
    inst.engine
        .dispatch(&inst.source_target(), empty, BioOp::Flush, &[], tracker)
}
