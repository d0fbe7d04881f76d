//! Sharded table of active cache instances, keyed by containing disk.
//!
//! Each shard is an independently locked list. Routing takes a shard's read
//! lock; activation, deactivation and drains take its write lock.

use crate::instance::{CacheInstance, InflightGuard};
use fc_block::{BlockDev, RequestHandler};
use fc_error::{FcError, Result};
use fc_types::{DevKind, DeviceId, SectorRange};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

type Shard = Vec<Arc<CacheInstance>>;

/// Outcome of classifying one request.
pub(crate) enum Decision {
    /// Fully inside `instance`; counted in flight.
    Cache(Arc<CacheInstance>, InflightGuard),
    /// Straddles the bounds of `instance`.
    Overlap(Arc<CacheInstance>),
    /// No instance claims the request. Carries the stashed original entry
    /// point when the disk still has instances.
    Miss(Option<Arc<dyn RequestHandler>>),
}

#[derive(Debug)]
pub struct Registry {
    shards: Vec<RwLock<Shard>>,
}

impl Registry {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        info!(target: "fc::registry", shard_count, "registry_init");
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn shard(&self, disk: DeviceId) -> &RwLock<Shard> {
        &self.shards[disk.shard(self.shards.len())]
    }

    /// Classify a request on `disk` covering the absolute sectors `range`.
    ///
    /// A whole-disk instance claims everything on its disk. A partition
    /// instance claims requests that fit inside its extent; one that only
    /// intersects it is an overlap.
    pub(crate) fn classify(&self, disk: DeviceId, range: SectorRange) -> Decision {
        let shard = self.shard(disk).read();
        let mut stashed = None;
        for inst in shard.iter().filter(|i| i.source().disk().id() == disk) {
            if inst.kind() == DevKind::WholeDisk || inst.extent().contains(&range) {
                let guard = inst.begin_io();
                return Decision::Cache(Arc::clone(inst), guard);
            }
            if inst.extent().intersects(&range) {
                return Decision::Overlap(Arc::clone(inst));
            }
            stashed.get_or_insert_with(|| Arc::clone(inst.original()));
        }
        Decision::Miss(stashed)
    }

    /// Look a cache up by name across every shard.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<CacheInstance>> {
        self.shards.iter().find_map(|shard| {
            shard
                .read()
                .iter()
                .find(|i| i.name() == name)
                .map(Arc::clone)
        })
    }

    /// Every instance, in shard order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<CacheInstance>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().clone())
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub(crate) fn snapshot_shard(&self, index: usize) -> Shard {
        self.shards.get(index).map(|s| s.read().clone()).unwrap_or_default()
    }
}

/// Reject `source` if it conflicts with an instance already on its disk:
/// a whole disk and any partition are exclusive, and partitions may not
/// overlap.
pub(crate) fn check_device_conflict(shard: &[Arc<CacheInstance>], source: &BlockDev) -> Result<()> {
    let disk = source.disk().id();
    for inst in shard.iter().filter(|i| i.source().disk().id() == disk) {
        if inst.kind() == DevKind::WholeDisk || source.is_whole_disk() {
            return Err(FcError::DeviceConflict(format!(
                "{} already has cache {} ({:?}); whole-disk and partition caches are exclusive",
                source.disk().name(),
                inst.name(),
                inst.kind()
            )));
        }
        if inst.extent().intersects(&source.extent()) {
            return Err(FcError::DeviceConflict(format!(
                "{} overlaps cache {} on {}",
                source.name(),
                inst.name(),
                inst.extent()
            )));
        }
    }
    Ok(())
}

/// Whether any instance in `shard` sits on `disk`.
pub(crate) fn disk_in_use(shard: &[Arc<CacheInstance>], disk: DeviceId) -> bool {
    shard.iter().any(|i| i.source().disk().id() == disk)
}
