//! Entry point installed on every disk that carries at least one cache.
//!
//! Requests fully inside an instance are rebased and handed to the mapper.
//! Requests straddling an instance boundary are split into one-sector
//! children and routed again. Everything else goes to the disk's original
//! entry point unchanged.

use crate::instance::Counters;
use crate::mapper::{self, Rejected};
use crate::registry::{Decision, Registry};
use fc_block::{Bio, BioOp, RequestHandler, SegmentCursor};
use fc_error::{Errno, IoStatus};
use fc_types::{DevKind, SECTOR_SIZE, Sector};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) struct Shim {
    registry: Weak<Registry>,
}

impl Shim {
    pub(crate) fn new(registry: &Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::downgrade(registry),
        })
    }

    fn route(&self, mut bio: Bio) {
        let disk = Arc::clone(bio.bdev().disk());
        let Some(registry) = self.registry.upgrade() else {
            disk.original_handler().make_request(bio);
            return;
        };
        if bio.op().has_data() && bio.bytes() % SECTOR_SIZE != 0 {
            debug!(target: "fc::shim", disk = %disk.name(), bytes = bio.bytes(), "request_not_sector_sized");
            bio.complete(Err(Errno::EINVAL));
            return;
        }

        let range = bio.range();
        match registry.classify(disk.id(), range) {
            Decision::Cache(inst, inflight) => {
                let absolute = bio.sector();
                if inst.kind() == DevKind::Partition {
                    bio.set_sector(Sector(absolute.0 - inst.extent().start.0));
                }
                trace!(
                    target: "fc::shim",
                    name = %inst.name(),
                    op = bio.op().as_str(),
                    sector = absolute.0,
                    rebased = bio.sector().0,
                    count = range.count,
                    "route_cached"
                );
                if let Err(Rejected { mut bio, errno }) = mapper::map(&inst, bio, absolute, inflight) {
                    bio.set_sector(absolute);
                    bio.complete(Err(errno));
                }
            }
            Decision::Overlap(inst) => {
                Counters::bump(&inst.counters.overlap_splits);
                if bio.op() == BioOp::Discard {
                    debug!(target: "fc::shim", name = %inst.name(), sector = range.start.0, count = range.count, "overlap_discard_refused");
                    bio.complete(Err(Errno::EOPNOTSUPP));
                    return;
                }
                debug!(target: "fc::shim", name = %inst.name(), sector = range.start.0, count = range.count, "overlap_split");
                drop(inst);
                self.split(bio);
            }
            Decision::Miss(stashed) => {
                let handler = stashed.unwrap_or_else(|| disk.original_handler());
                handler.make_request(bio);
            }
        }
    }

    /// Re-route `parent` one sector at a time. Every child is built before
    /// any is routed, so the parent cannot complete early.
    fn split(&self, parent: Bio) {
        let count = usize::try_from(parent.sectors()).unwrap_or(usize::MAX);
        let group = Arc::new(SplitGroup {
            parent: Mutex::new(None),
            remaining: AtomicUsize::new(count),
            error: AtomicI32::new(0),
        });
        let segments = parent.segments().to_vec();
        let mut cursor = SegmentCursor::new(&segments);
        let children: Vec<Bio> = (0..parent.sectors())
            .map(|i| {
                let sector = Sector(parent.sector().0 + i);
                let fragments = cursor.take(SECTOR_SIZE as usize, usize::MAX);
                let group = Arc::clone(&group);
                Bio::new(Arc::clone(parent.bdev()), sector, parent.op(), fragments)
                    .with_sync(parent.is_sync())
                    .with_end_io(move |c| group.child_done(c.status))
            })
            .collect();
        *group.parent.lock() = Some(parent);
        for child in children {
            self.route(child);
        }
    }
}

impl RequestHandler for Shim {
    fn make_request(&self, bio: Bio) {
        self.route(bio);
    }
}

/// Completion state shared by the children of one split request.
struct SplitGroup {
    parent: Mutex<Option<Bio>>,
    remaining: AtomicUsize,
    /// First child error, as an errno; zero while none failed.
    error: AtomicI32,
}

impl SplitGroup {
    fn child_done(&self, status: IoStatus) {
        if let Err(errno) = status {
            let _ = self
                .error
                .compare_exchange(0, errno.get(), Ordering::AcqRel, Ordering::Acquire);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let parent = self.parent.lock().take();
            if let Some(parent) = parent {
                let status = match self.error.load(Ordering::Acquire) {
                    0 => Ok(()),
                    errno => Err(Errno(errno)),
                };
                parent.complete(status);
            }
        }
    }
}
