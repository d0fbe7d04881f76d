//! One active cache binding and its runtime state.

use crate::cachemap::CacheMap;
use crate::cleaner::CleanerHandle;
use crate::config::{CacheOptions, ManagerConfig};
use crate::metadata::CacheRecord;
use fc_block::{BlockDev, RequestHandler};
use fc_error::{Errno, FcError, Result};
use fc_io::{EngineCounters, IoEngine, IoTarget, PagePool, PooledPage};
use fc_types::{BlockSectors, CacheMode, DevKind, PolicyKind, Sector, SectorRange};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Mode and policy, changed together under `edit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub mode: CacheMode,
    pub policy: PolicyKind,
}

/// Lifecycle flags. Guarded by one short-held mutex, never by the registry
/// lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstanceFlags {
    pub failed: bool,
    pub degraded: bool,
    /// Forced read-only by reboot quiesce.
    pub read_only: bool,
    pub shutdown_in_progress: bool,
    pub modification_in_progress: bool,
    pub deleted: bool,
    /// Dirty blocks are being drained; writes must not create new ones.
    pub flush_in_progress: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) reads: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) read_hits: AtomicU64,
    pub(crate) write_hits: AtomicU64,
    pub(crate) uncached: AtomicU64,
    pub(crate) overlap_splits: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-instance request statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub read_hits: u64,
    pub write_hits: u64,
    /// Requests forwarded uncached because the instance had failed.
    pub uncached: u64,
    /// Boundary-straddling requests split into per-sector children.
    pub overlap_splits: u64,
    pub io: EngineCounters,
}

/// Serializable view of one instance for `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub name: String,
    pub source: String,
    pub cache: String,
    pub kind: DevKind,
    /// Absolute sector bounds on the source disk, inclusive.
    pub dev_start_sect: u64,
    pub dev_end_sect: u64,
    pub mode: CacheMode,
    pub policy: PolicyKind,
    pub block_sectors: u32,
    pub capacity_blocks: u64,
    pub resident_blocks: u64,
    pub dirty_blocks: u64,
    pub inflight: u64,
    pub flags: InstanceFlags,
    pub stats: CacheStats,
}

/// Buffers the write-back cleaner copies dirty blocks through. Present only
/// while the instance is in write-back mode.
#[derive(Debug)]
pub(crate) struct WriteBackResources {
    pub(crate) buffers: Vec<PooledPage>,
}

/// Everything fixed at create time.
pub(crate) struct InstanceParts {
    pub(crate) name: String,
    pub(crate) source: Arc<BlockDev>,
    pub(crate) cache: Arc<BlockDev>,
    pub(crate) source_path: String,
    pub(crate) cache_path: String,
    pub(crate) settings: Settings,
    pub(crate) block_sectors: BlockSectors,
    pub(crate) options: CacheOptions,
    pub(crate) map: CacheMap,
    pub(crate) pool: Arc<PagePool>,
    pub(crate) config: Arc<ManagerConfig>,
}

pub struct CacheInstance {
    name: String,
    source: Arc<BlockDev>,
    cache: Arc<BlockDev>,
    source_path: String,
    cache_path: String,
    kind: DevKind,
    extent: SectorRange,
    block_sectors: BlockSectors,
    options: CacheOptions,
    config: Arc<ManagerConfig>,
    settings: RwLock<Settings>,
    flags: Mutex<InstanceFlags>,
    inflight: AtomicU64,
    drain_lock: Mutex<()>,
    drained: Condvar,
    /// Non-intercepted entry point of the source disk, shared by every
    /// instance on that disk.
    original: Arc<dyn RequestHandler>,
    cache_original: Arc<dyn RequestHandler>,
    pub(crate) map: Mutex<CacheMap>,
    pub(crate) engine: IoEngine,
    pool: Arc<PagePool>,
    pub(crate) wb: Mutex<Option<WriteBackResources>>,
    pub(crate) cleaner: Mutex<Option<CleanerHandle>>,
    pub(crate) counters: Counters,
}

impl CacheInstance {
    pub(crate) fn new(parts: InstanceParts) -> Self {
        let kind = if parts.source.is_whole_disk() {
            DevKind::WholeDisk
        } else {
            DevKind::Partition
        };
        let original = parts.source.disk().original_handler();
        let cache_original = parts.cache.disk().original_handler();
        let engine = IoEngine::new(Arc::clone(&parts.pool), parts.config.structural_drain_poll());
        Self {
            name: parts.name,
            extent: parts.source.extent(),
            source: parts.source,
            cache: parts.cache,
            source_path: parts.source_path,
            cache_path: parts.cache_path,
            kind,
            block_sectors: parts.block_sectors,
            options: parts.options,
            config: parts.config,
            settings: RwLock::new(parts.settings),
            flags: Mutex::new(InstanceFlags::default()),
            inflight: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            original,
            cache_original,
            map: Mutex::new(parts.map),
            engine,
            pool: parts.pool,
            wb: Mutex::new(None),
            cleaner: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> &Arc<BlockDev> {
        &self.source
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockDev> {
        &self.cache
    }

    #[must_use]
    pub fn kind(&self) -> DevKind {
        self.kind
    }

    /// Absolute sector span of the source on its disk.
    #[must_use]
    pub fn extent(&self) -> SectorRange {
        self.extent
    }

    #[must_use]
    pub fn block_sectors(&self) -> BlockSectors {
        self.block_sectors
    }

    #[must_use]
    pub fn options(&self) -> CacheOptions {
        self.options
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn settings(&self) -> Settings {
        *self.settings.read()
    }

    pub(crate) fn set_settings(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    #[must_use]
    pub fn mode(&self) -> CacheMode {
        self.settings.read().mode
    }

    #[must_use]
    pub fn flags(&self) -> InstanceFlags {
        *self.flags.lock()
    }

    /// Apply `f` to the flags under their lock.
    pub(crate) fn update_flags<R>(&self, f: impl FnOnce(&mut InstanceFlags) -> R) -> R {
        f(&mut self.flags.lock())
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.flags.lock().failed
    }

    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        self.map.lock().dirty_count()
    }

    #[must_use]
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn original(&self) -> &Arc<dyn RequestHandler> {
        &self.original
    }

    /// Claim the lifecycle slot for an edit or delete.
    pub(crate) fn begin_modification(&self) -> Result<()> {
        let mut flags = self.flags.lock();
        if flags.shutdown_in_progress {
            return Err(FcError::ShutdownInProgress(self.name.clone()));
        }
        if flags.modification_in_progress {
            return Err(FcError::Busy(self.name.clone()));
        }
        flags.modification_in_progress = true;
        Ok(())
    }

    pub(crate) fn end_modification(&self) {
        let mut flags = self.flags.lock();
        flags.modification_in_progress = false;
        flags.flush_in_progress = false;
    }

    /// Cache-device I/O failed: stop caching.
    pub(crate) fn mark_failed(&self, errno: Errno) {
        let newly = self.update_flags(|f| !std::mem::replace(&mut f.failed, true));
        if newly {
            error!(target: "fc::instance", name = %self.name, %errno, "cache_device_failed");
        }
    }

    /// Count one routed request; the returned guard uncounts it on drop.
    pub(crate) fn begin_io(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            inst: Arc::clone(self),
        }
    }

    fn end_io(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }

    /// Block until no routed request is in flight.
    pub(crate) fn wait_inflight_zero(&self, poll: Duration) {
        let mut guard = self.drain_lock.lock();
        let mut logged = false;
        while self.inflight.load(Ordering::Acquire) > 0 {
            if !logged {
                debug!(
                    target: "fc::instance",
                    name = %self.name,
                    inflight = self.inflight.load(Ordering::Relaxed),
                    "drain_wait"
                );
                logged = true;
            }
            let _ = self.drained.wait_for(&mut guard, poll);
        }
    }

    /// Source device, reached through its original entry point.
    pub(crate) fn source_target(&self) -> IoTarget {
        IoTarget::bypass(Arc::clone(&self.source), Arc::clone(&self.original))
    }

    pub(crate) fn cache_target(&self) -> IoTarget {
        IoTarget::bypass(Arc::clone(&self.cache), Arc::clone(&self.cache_original))
    }

    /// Region of cache slot `slot` starting `offset` sectors into the block.
    pub(crate) fn slot_region(&self, slot: u64, offset: u64, count: u64) -> SectorRange {
        let first = self.block_sectors.first_sector(slot);
        SectorRange::new(Sector(first.0 + offset), count)
    }

    /// Allocate write-back resources. No-op if already present.
    pub(crate) fn allocate_write_back(&self) -> Result<()> {
        let mut wb = self.wb.lock();
        if wb.is_some() {
            return Ok(());
        }
        let len = usize::try_from(self.block_sectors.bytes())
            .map_err(|_| FcError::InvalidArgument("cache block too large".to_owned()))?;
        let buffers = (0..self.config.cleaner.batch_blocks)
            .map(|_| self.pool.try_page(len))
            .collect::<Result<Vec<_>>>()?;
        debug!(target: "fc::instance", name = %self.name, buffers = buffers.len(), "write_back_resources_allocated");
        *wb = Some(WriteBackResources { buffers });
        Ok(())
    }

    pub(crate) fn free_write_back(&self) {
        if self.wb.lock().take().is_some() {
            debug!(target: "fc::instance", name = %self.name, "write_back_resources_freed");
        }
    }

    #[must_use]
    pub fn has_write_back_resources(&self) -> bool {
        self.wb.lock().is_some()
    }

    pub(crate) fn record(&self) -> CacheRecord {
        let settings = self.settings();
        CacheRecord {
            name: self.name.clone(),
            source_path: self.source_path.clone(),
            cache_path: self.cache_path.clone(),
            mode: settings.mode,
            policy: settings.policy,
            block_sectors: self.block_sectors.get(),
            options: self.options,
            read_only: self.flags().read_only,
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            read_hits: c.read_hits.load(Ordering::Relaxed),
            write_hits: c.write_hits.load(Ordering::Relaxed),
            uncached: c.uncached.load(Ordering::Relaxed),
            overlap_splits: c.overlap_splits.load(Ordering::Relaxed),
            io: self.engine.counters(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> CacheSummary {
        let settings = self.settings();
        let (capacity, resident, dirty) = {
            let map = self.map.lock();
            (map.capacity(), map.resident(), map.dirty_count())
        };
        CacheSummary {
            name: self.name.clone(),
            source: self.source_path.clone(),
            cache: self.cache_path.clone(),
            kind: self.kind,
            dev_start_sect: self.extent.start.0,
            dev_end_sect: self.extent.last().0,
            mode: settings.mode,
            policy: settings.policy,
            block_sectors: self.block_sectors.get(),
            capacity_blocks: capacity,
            resident_blocks: resident,
            dirty_blocks: dirty,
            inflight: self.inflight(),
            flags: self.flags(),
            stats: self.stats(),
        }
    }

    pub(crate) fn log_activated(&self) {
        let settings = self.settings();
        info!(
            target: "fc::lifecycle",
            name = %self.name,
            source = %self.source_path,
            cache = %self.cache_path,
            kind = ?self.kind,
            extent = %self.extent,
            mode = %settings.mode,
            policy = %settings.policy,
            "cache_activate"
        );
    }
}

impl std::fmt::Debug for CacheInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInstance")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("cache", &self.cache.name())
            .field("kind", &self.kind)
            .field("extent", &self.extent)
            .field("settings", &self.settings())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

/// In-flight count held by one routed request.
pub(crate) struct InflightGuard {
    inst: Arc<CacheInstance>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inst.end_io();
    }
}
