//! Write-back cleaning: copying dirty cache blocks back to the source.
//!
//! A background thread per write-back instance flushes in batches on a
//! fixed interval, or sooner when writes push the dirty share over the
//! high-water mark. Structural operations drain dirty blocks synchronously
//! with [`finish_dirty`].

use crate::config::CleanerConfig;
use crate::instance::CacheInstance;
use crate::registry::Registry;
use fc_block::{BioOp, Page, Segment};
use fc_error::{FcError, Result};
use fc_types::SectorRange;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Signal {
    stop: bool,
    kicked: bool,
}

#[derive(Debug, Default)]
struct Shared {
    signal: Mutex<Signal>,
    wake: Condvar,
}

impl Shared {
    fn kick(&self) {
        self.signal.lock().kicked = true;
        self.wake.notify_one();
    }

    fn request_stop(&self) {
        self.signal.lock().stop = true;
        self.wake.notify_one();
    }

    fn stopping(&self) -> bool {
        self.signal.lock().stop
    }
}

/// Handle to a running cleaner thread.
#[derive(Debug)]
pub(crate) struct CleanerHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    fn stop(mut self) {
        self.shared.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "fc::cleaner", "cleaner_thread_panicked");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        // Detached: the thread exits at its next wake-up.
        self.shared.request_stop();
    }
}

/// Start the cleaner for `inst` unless one is already running.
pub(crate) fn start(inst: &Arc<CacheInstance>) -> Result<()> {
    let mut slot = inst.cleaner.lock();
    if slot.is_some() {
        return Ok(());
    }
    let shared = Arc::new(Shared::default());
    let config = inst.config().cleaner;
    let weak = Arc::downgrade(inst);
    let thread = std::thread::Builder::new()
        .name(format!("fc-clean-{}", inst.name()))
        .spawn({
            let shared = Arc::clone(&shared);
            move || run(&weak, &shared, config)
        })?;
    *slot = Some(CleanerHandle {
        shared,
        thread: Some(thread),
    });
    debug!(target: "fc::cleaner", name = %inst.name(), interval_ms = config.interval_ms, "cleaner_started");
    Ok(())
}

/// Stop and join the cleaner, if running.
pub(crate) fn stop(inst: &CacheInstance) {
    let handle = inst.cleaner.lock().take();
    if let Some(handle) = handle {
        handle.stop();
        debug!(target: "fc::cleaner", name = %inst.name(), "cleaner_stopped");
    }
}

fn over_high_water(inst: &CacheInstance) -> bool {
    let (dirty, capacity) = {
        let map = inst.map.lock();
        (map.dirty_count(), map.capacity())
    };
    let percent = u64::from(inst.config().cleaner.dirty_high_water_percent);
    dirty > 0 && dirty * 100 >= capacity * percent
}

/// Wake the cleaner early if the dirty share has reached the high-water
/// mark.
pub(crate) fn kick_if_over_high_water(inst: &CacheInstance) {
    if over_high_water(inst) {
        if let Some(handle) = inst.cleaner.lock().as_ref() {
            handle.shared.kick();
        }
    }
}

fn run(weak: &Weak<CacheInstance>, shared: &Shared, config: CleanerConfig) {
    loop {
        {
            let mut signal = shared.signal.lock();
            if !signal.stop && !signal.kicked {
                let _ = shared.wake.wait_for(&mut signal, config.interval());
            }
            if signal.stop {
                return;
            }
            signal.kicked = false;
        }
        let Some(inst) = weak.upgrade() else {
            return;
        };
        if inst.is_failed() {
            continue;
        }
        let mut before = inst.dirty_count();
        while before > 0 && !shared.stopping() {
            match flush_dirty(&inst) {
                Ok(remaining) if remaining < before && over_high_water(&inst) => before = remaining,
                Ok(_) => break,
                Err(err) => {
                    warn!(target: "fc::cleaner", name = %inst.name(), error = %err, "cleaner_pass_failed");
                    break;
                }
            }
        }
    }
}

/// Copy up to one batch of dirty blocks to the source and mark them clean.
///
/// A block written again while it was being copied stays dirty. Returns
/// the dirty count after the pass.
pub fn flush_dirty(inst: &Arc<CacheInstance>) -> Result<u64> {
    let entries = inst.map.lock().dirty_blocks(inst.config().cleaner.batch_blocks);
    if entries.is_empty() {
        return Ok(0);
    }
    let bs = inst.block_sectors();
    let full = u64::from(bs.get());
    let len = usize::try_from(bs.bytes())
        .map_err(|_| FcError::InvalidArgument("cache block too large".to_owned()))?;

    let wb = inst.wb.lock();
    let mut flushed = 0_u64;
    let mut failed = 0_u64;
    for (i, entry) in entries.iter().enumerate() {
        if inst.is_failed() {
            return Err(FcError::FailedState(inst.name().to_owned()));
        }
        let page = wb
            .as_ref()
            .and_then(|res| res.buffers.get(i))
            .map_or_else(|| Page::zeroed(len), |buf| buf.page().clone());
        let segments = [Segment::whole(page)];

        let read = inst.engine.submit_sync(
            &inst.cache_target(),
            inst.slot_region(entry.slot, 0, full),
            BioOp::Read,
            &segments,
        );
        if let Err(err) = read {
            if let FcError::DeviceIo { errno, .. } = &err {
                inst.mark_failed(*errno);
            }
            warn!(target: "fc::cleaner", name = %inst.name(), block = entry.block, error = %err, "dirty_read_failed");
            failed += 1;
            continue;
        }

        let source_region = SectorRange::new(bs.first_sector(entry.block), full);
        match inst
            .engine
            .submit_sync(&inst.source_target(), source_region, BioOp::Write, &segments)
        {
            Ok(()) => {
                if inst.map.lock().mark_clean(*entry) {
                    flushed += 1;
                }
            }
            Err(err) => {
                warn!(target: "fc::cleaner", name = %inst.name(), block = entry.block, error = %err, "dirty_writeback_failed");
                failed += 1;
            }
        }
    }
    drop(wb);

    let remaining = inst.dirty_count();
    debug!(target: "fc::cleaner", name = %inst.name(), flushed, failed, remaining, "flush_pass");
    Ok(remaining)
}

/// Flush until clean or until `retries` passes make no progress. Returns
/// the dirty count left behind.
pub(crate) fn flush_until_clean(inst: &Arc<CacheInstance>, mut retries: u32) -> Result<u64> {
    let mut remaining = inst.dirty_count();
    while remaining > 0 && retries > 0 {
        let after = flush_dirty(inst)?;
        if after >= remaining {
            retries -= 1;
        }
        remaining = after;
    }
    Ok(remaining)
}

/// Drive the dirty count of `inst` to zero before a structural change.
///
/// Sets the flush-in-progress flag under the registry write lock and drains
/// in-flight requests, so no later write dirties a block. The flag stays
/// set until the caller ends its modification. Gives up when the instance
/// fails, when a shutdown pre-empts it, or after the configured number of
/// passes without progress.
pub fn finish_dirty(inst: &Arc<CacheInstance>, registry: &Registry) -> Result<()> {
    {
        let _shard = registry.shard(inst.source().disk().id()).write();
        inst.update_flags(|f| f.flush_in_progress = true);
        inst.wait_inflight_zero(inst.config().structural_drain_poll());
    }

    let mut retries = inst.config().finish_dirty_retries;
    let mut remaining = inst.dirty_count();
    info!(target: "fc::cleaner", name = %inst.name(), dirty = remaining, "finish_dirty_start");
    while remaining > 0 {
        let flags = inst.flags();
        if flags.failed {
            return Err(FcError::FailedState(inst.name().to_owned()));
        }
        if flags.shutdown_in_progress {
            debug!(target: "fc::cleaner", name = %inst.name(), remaining, "finish_dirty_preempted");
            break;
        }
        let after = flush_dirty(inst)?;
        if after >= remaining {
            retries = retries.saturating_sub(1);
            debug!(target: "fc::cleaner", name = %inst.name(), remaining = after, retries, "finish_dirty_no_progress");
            if retries == 0 {
                remaining = after;
                break;
            }
        }
        remaining = after;
    }

    if remaining > 0 {
        warn!(target: "fc::cleaner", name = %inst.name(), remaining, "finish_dirty_incomplete");
        return Err(FcError::DirtyFlushIncomplete {
            name: inst.name().to_owned(),
            remaining,
        });
    }
    info!(target: "fc::cleaner", name = %inst.name(), "finish_dirty_done");
    Ok(())
}
