//! Lifecycle controller: create, delete, edit, list, reboot quiesce and
//! restore of cache instances.
//!
//! Structural changes on one instance are serialised by its
//! modification flag. Changes that alter routing or per-request behaviour
//! happen under the write lock of the instance's registry shard, after the
//! instance's in-flight requests have drained.

use crate::cachemap::CacheMap;
use crate::cleaner;
use crate::config::{CacheOptions, ManagerConfig};
use crate::instance::{CacheInstance, CacheSummary, InstanceParts, Settings};
use crate::metadata::MetadataStore;
use crate::policy::{ReplacementPolicy, build_policy};
use crate::registry::{Registry, check_device_conflict, disk_in_use};
use crate::shim::Shim;
use fc_block::{BlockDev, DeviceTable, RequestHandler};
use fc_error::{FcError, Result};
use fc_io::PagePool;
use fc_types::{BlockSectors, CacheMode, PolicyKind};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Arguments of [`CacheManager::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub name: String,
    /// Source device path or name.
    pub source: String,
    /// Cache device path or name.
    pub cache: String,
    pub mode: CacheMode,
    pub policy: PolicyKind,
    pub options: CacheOptions,
}

impl CreateParams {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        cache: impl Into<String>,
        mode: CacheMode,
        policy: PolicyKind,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            cache: cache.into(),
            mode,
            policy,
            options: CacheOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RebootState {
    Running,
    Quiescing,
    Quiesced,
}

pub struct CacheManager {
    config: Arc<ManagerConfig>,
    devices: Arc<DeviceTable>,
    registry: Arc<Registry>,
    shim: Arc<Shim>,
    store: Arc<dyn MetadataStore>,
    pool: Arc<PagePool>,
    /// Names claimed by a create that has not finished yet, plus every
    /// registered name.
    names: Mutex<BTreeSet<String>>,
    /// Held from the device-role checks until the instance is registered.
    creating: Mutex<()>,
    reboot: Mutex<RebootState>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("caches", &self.registry.count())
            .field("reboot", &*self.reboot.lock())
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(
        config: ManagerConfig,
        devices: Arc<DeviceTable>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(config.shard_count));
        let shim = Shim::new(&registry);
        let pool = PagePool::new(config.staging_pool_pages);
        Ok(Self {
            config: Arc::new(config),
            devices,
            registry,
            shim,
            store,
            pool,
            names: Mutex::new(BTreeSet::new()),
            creating: Mutex::new(()),
            reboot: Mutex::new(RebootState::Running),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Look up a registered cache.
    pub fn lookup(&self, name: &str) -> Result<Arc<CacheInstance>> {
        self.registry
            .lookup(name)
            .ok_or_else(|| FcError::NotFound(format!("cache {name}")))
    }

    #[must_use]
    pub fn cache_count(&self) -> usize {
        self.registry.count()
    }

    #[must_use]
    pub fn list(&self) -> Vec<CacheSummary> {
        self.registry.list().iter().map(|inst| inst.summary()).collect()
    }

    // ── Create ─────────────────────────────────────────────────────────────

    /// Bind a cache device to a source device and start routing the
    /// source's requests through it.
    pub fn create(&self, params: CreateParams) -> Result<Arc<CacheInstance>> {
        if params.name.is_empty() {
            return Err(FcError::InvalidArgument("cache name is empty".to_owned()));
        }
        if *self.reboot.lock() != RebootState::Running {
            return Err(FcError::ShutdownInProgress(params.name));
        }
        let block_sectors = params.options.resolve_block_sectors(&self.config)?;
        let source = self.devices.open(&params.source)?;
        let cache = self.devices.open(&params.cache)?;
        if source.disk().id() == cache.disk().id() {
            return Err(FcError::DeviceConflict(format!(
                "source {} and cache {} share disk {}",
                source.name(),
                cache.name(),
                source.disk().name()
            )));
        }

        if !self.names.lock().insert(params.name.clone()) {
            return Err(FcError::Exists(format!("cache {}", params.name)));
        }
        let name = params.name.clone();
        let created = self.create_reserved(params, source, cache, block_sectors);
        if let Err(err) = &created {
            self.names.lock().remove(&name);
            warn!(target: "fc::lifecycle", name = %name, error = %err, "cache_create_failed");
        }
        created
    }

    fn create_reserved(
        &self,
        params: CreateParams,
        source: Arc<BlockDev>,
        cache: Arc<BlockDev>,
        block_sectors: BlockSectors,
    ) -> Result<Arc<CacheInstance>> {
        let _creating = self.creating.lock();
        self.check_device_roles(&source, &cache)?;
        check_device_conflict(&self.registry.shard(source.disk().id()).read(), &source)?;

        let lbs = u64::from(cache.geometry().logical_block_size);
        if block_sectors.bytes() % lbs != 0 {
            return Err(FcError::InvalidArgument(format!(
                "cache block of {} bytes is not a multiple of {}'s {lbs}-byte logical block",
                block_sectors.bytes(),
                cache.name()
            )));
        }
        let capacity = cache.nr_sects() / u64::from(block_sectors.get());
        let map = CacheMap::new(capacity, build_policy(params.policy, capacity)?);

        let inst = Arc::new(CacheInstance::new(InstanceParts {
            name: params.name,
            source,
            cache,
            source_path: params.source,
            cache_path: params.cache,
            settings: Settings {
                mode: params.mode,
                policy: params.policy,
            },
            block_sectors,
            options: params.options,
            map,
            pool: Arc::clone(&self.pool),
            config: Arc::clone(&self.config),
        }));
        if params.mode.is_write_back() {
            inst.allocate_write_back()?;
        }
        self.store.persist(&inst.record())?;
        if let Err(err) = self.activate(&inst) {
            if let Err(remove_err) = self.store.remove(inst.name()) {
                warn!(target: "fc::lifecycle", name = %inst.name(), error = %remove_err, "metadata_remove_failed");
            }
            return Err(err);
        }
        if params.mode.is_write_back() {
            self.start_cleaner(&inst);
        }
        Ok(inst)
    }

    /// A device may serve as a cache for one instance only, and a cache
    /// device is never itself cached.
    fn check_device_roles(&self, source: &BlockDev, cache: &BlockDev) -> Result<()> {
        for other in self.registry.list() {
            let other_cache = other.cache().disk().id();
            if other_cache == cache.disk().id() && other.cache().extent().intersects(&cache.extent()) {
                return Err(FcError::DeviceConflict(format!(
                    "{} is already the cache device of {}",
                    cache.name(),
                    other.name()
                )));
            }
            if other.source().disk().id() == cache.disk().id() {
                return Err(FcError::DeviceConflict(format!(
                    "{} carries cache {} and cannot be a cache device",
                    cache.disk().name(),
                    other.name()
                )));
            }
            if other_cache == source.disk().id() {
                return Err(FcError::DeviceConflict(format!(
                    "{} is the cache disk of {}",
                    source.disk().name(),
                    other.name()
                )));
            }
        }
        Ok(())
    }

    fn activate(&self, inst: &Arc<CacheInstance>) -> Result<()> {
        let disk = inst.source().disk();
        let mut shard = self.registry.shard(disk.id()).write();
        check_device_conflict(&shard, inst.source())?;
        if !disk_in_use(&shard, disk.id()) {
            let shim: Arc<dyn RequestHandler> = self.shim.clone();
            disk.intercept(shim);
        }
        shard.push(Arc::clone(inst));
        // Requests begun under the previous routing complete before any
        // later activation on this disk proceeds.
        if let Err(err) = inst.engine.barrier(&inst.source_target()) {
            warn!(target: "fc::lifecycle", name = %inst.name(), error = %err, "activation_barrier_failed");
        }
        drop(shard);
        inst.log_activated();
        Ok(())
    }

    fn start_cleaner(&self, inst: &Arc<CacheInstance>) {
        if let Err(err) = cleaner::start(inst) {
            warn!(target: "fc::lifecycle", name = %inst.name(), error = %err, "cleaner_start_failed");
        }
    }

    // ── Delete ─────────────────────────────────────────────────────────────

    /// Remove a cache, flushing its dirty blocks first unless forced.
    ///
    /// Returns once no request routed to the instance is still in flight.
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let inst = self.lookup(name)?;
        let flags = inst.flags();
        if !force && (flags.failed || flags.degraded) {
            return Err(FcError::FailedState(name.to_owned()));
        }
        inst.begin_modification()?;
        cleaner::stop(&inst);

        let flush = inst.mode().is_write_back()
            && !inst.is_failed()
            && !force
            && !inst.options().fast_remove;
        if flush {
            if let Err(err) = cleaner::finish_dirty(&inst, &self.registry) {
                inst.end_modification();
                if inst.mode().is_write_back() && !inst.is_failed() {
                    self.start_cleaner(&inst);
                }
                warn!(target: "fc::lifecycle", name, error = %err, "cache_delete_aborted");
                return Err(err);
            }
        }

        self.deactivate(&inst);
        inst.update_flags(|f| f.deleted = true);
        inst.wait_inflight_zero(self.config.delete_drain_poll());
        inst.free_write_back();
        if let Err(err) = self.store.remove(name) {
            warn!(target: "fc::lifecycle", name, error = %err, "metadata_remove_failed");
        }
        self.names.lock().remove(name);
        inst.end_modification();
        info!(target: "fc::lifecycle", name, dirty = inst.dirty_count(), force, "cache_delete");
        Ok(())
    }

    fn deactivate(&self, inst: &Arc<CacheInstance>) {
        let disk = inst.source().disk();
        let mut shard = self.registry.shard(disk.id()).write();
        shard.retain(|other| !Arc::ptr_eq(other, inst));
        if !disk_in_use(&shard, disk.id()) {
            disk.restore();
        }
    }

    // ── Edit ───────────────────────────────────────────────────────────────

    /// Change the mode and/or replacement policy of a cache.
    pub fn edit(&self, name: &str, mode: Option<CacheMode>, policy: Option<PolicyKind>) -> Result<()> {
        let inst = self.lookup(name)?;
        let current = inst.settings();
        let target = Settings {
            mode: mode.unwrap_or(current.mode),
            policy: policy.unwrap_or(current.policy),
        };
        if target == current {
            debug!(target: "fc::lifecycle", name, "cache_edit_noop");
            return Ok(());
        }
        let flags = inst.flags();
        if flags.failed || flags.degraded {
            return Err(FcError::FailedState(name.to_owned()));
        }
        inst.begin_modification()?;
        let mode_changes = target.mode != current.mode;
        if mode_changes && current.mode.is_write_back() {
            cleaner::stop(&inst);
        }

        let result = self.apply_edit(&inst, current, target);
        inst.end_modification();
        if inst.mode().is_write_back() && !inst.is_failed() {
            self.start_cleaner(&inst);
        }
        match &result {
            Ok(()) => info!(
                target: "fc::lifecycle",
                name,
                mode = %target.mode,
                policy = %target.policy,
                "cache_edit"
            ),
            Err(err) => warn!(target: "fc::lifecycle", name, error = %err, "cache_edit_failed"),
        }
        result
    }

    fn apply_edit(&self, inst: &Arc<CacheInstance>, current: Settings, target: Settings) -> Result<()> {
        if current.mode.is_write_back() && !target.mode.is_write_back() {
            cleaner::finish_dirty(inst, &self.registry)?;
        }

        let shard = self.registry.shard(inst.source().disk().id()).write();
        inst.wait_inflight_zero(self.config.structural_drain_poll());
        // Everything fallible happens before the first change is committed.
        let policy = if target.policy == current.policy {
            None
        } else {
            let capacity = inst.map.lock().capacity();
            Some(build_policy(target.policy, capacity)?)
        };
        let mode_changes = target.mode != current.mode;
        if mode_changes && target.mode.is_write_back() {
            inst.allocate_write_back()?;
        }
        if let Some(policy) = policy {
            install_policy(inst, policy);
        }
        if mode_changes {
            switch_mode(inst, current.mode, target.mode);
        }
        let persisted = self.store.persist(&inst.record());
        drop(shard);

        if let Err(err) = persisted {
            inst.update_flags(|f| f.degraded = true);
            error!(target: "fc::lifecycle", name = %inst.name(), error = %err, "metadata_persist_failed");
            return Err(FcError::Metadata(format!(
                "{}: settings changed but not persisted: {err}",
                inst.name()
            )));
        }
        Ok(())
    }

    // ── Reboot quiesce ─────────────────────────────────────────────────────

    /// Make every healthy cache read-only ahead of a reboot.
    ///
    /// Only the first call does any work. Returns the number of caches
    /// quiesced.
    pub fn reboot_quiesce(&self) -> Result<usize> {
        {
            let mut state = self.reboot.lock();
            if *state != RebootState::Running {
                debug!(target: "fc::lifecycle", "reboot_quiesce_repeat");
                return Ok(0);
            }
            *state = RebootState::Quiescing;
        }
        info!(target: "fc::lifecycle", caches = self.registry.count(), "reboot_quiesce_start");
        let mut quiesced = 0;
        for index in 0..self.registry.shard_count() {
            for inst in self.registry.snapshot_shard(index) {
                if self.quiesce_instance(&inst) {
                    quiesced += 1;
                }
            }
        }
        *self.reboot.lock() = RebootState::Quiesced;
        info!(target: "fc::lifecycle", quiesced, "reboot_quiesce_done");
        Ok(quiesced)
    }

    fn quiesce_instance(&self, inst: &Arc<CacheInstance>) -> bool {
        let flags = inst.flags();
        if flags.failed || flags.degraded {
            warn!(target: "fc::lifecycle", name = %inst.name(), failed = flags.failed, degraded = flags.degraded, "quiesce_skip_unhealthy");
            return false;
        }

        let lock = self.registry.shard(inst.source().disk().id());
        let mut shard = lock.write();
        inst.update_flags(|f| f.shutdown_in_progress = true);
        while inst.flags().modification_in_progress {
            drop(shard);
            std::thread::sleep(Duration::from_millis(1));
            shard = lock.write();
        }
        if inst.flags().deleted {
            drop(shard);
            inst.update_flags(|f| f.shutdown_in_progress = false);
            debug!(target: "fc::lifecycle", name = %inst.name(), "quiesce_skip_deleted");
            return false;
        }
        // Requests classified while the lock was released above drain here;
        // anything later sees the read-only flag and dirties nothing new.
        inst.wait_inflight_zero(self.config.structural_drain_poll());
        inst.update_flags(|f| f.read_only = true);
        cleaner::stop(inst);
        drop(shard);

        if inst.options().cold_boot && !self.config.force_warm_boot && inst.dirty_count() > 0 {
            match cleaner::flush_until_clean(inst, self.config.finish_dirty_retries) {
                Ok(0) => {}
                Ok(remaining) => {
                    warn!(target: "fc::lifecycle", name = %inst.name(), remaining, "quiesce_dirty_left");
                }
                Err(err) => {
                    warn!(target: "fc::lifecycle", name = %inst.name(), error = %err, "quiesce_flush_failed");
                }
            }
        }
        if let Err(err) = self.store.persist(&inst.record()) {
            warn!(target: "fc::lifecycle", name = %inst.name(), error = %err, "metadata_persist_failed");
        }
        inst.update_flags(|f| f.shutdown_in_progress = false);
        info!(target: "fc::lifecycle", name = %inst.name(), dirty = inst.dirty_count(), "cache_quiesced");
        true
    }

    // ── Restore ────────────────────────────────────────────────────────────

    /// Recreate every stored cache that is not already registered. Records
    /// that fail to restore are logged and skipped.
    pub fn restore_all(&self) -> Result<usize> {
        let mut restored = 0;
        for record in self.store.load_all()? {
            if self.registry.lookup(&record.name).is_some() {
                continue;
            }
            let params = CreateParams {
                name: record.name.clone(),
                source: record.source_path.clone(),
                cache: record.cache_path.clone(),
                mode: record.mode,
                policy: record.policy,
                options: CacheOptions {
                    block_sectors: Some(record.block_sectors),
                    ..record.options
                },
            };
            match self.create(params) {
                Ok(inst) => {
                    if record.read_only {
                        inst.update_flags(|f| f.read_only = true);
                        if let Err(err) = self.store.persist(&inst.record()) {
                            warn!(target: "fc::lifecycle", name = %record.name, error = %err, "metadata_persist_failed");
                        }
                    }
                    restored += 1;
                }
                Err(err) => {
                    warn!(target: "fc::lifecycle", name = %record.name, error = %err, "cache_restore_failed");
                }
            }
        }
        info!(target: "fc::lifecycle", restored, "restore_all");
        Ok(restored)
    }
}

fn install_policy(inst: &CacheInstance, policy: Box<dyn ReplacementPolicy>) {
    let kind = policy.kind();
    let old = inst.map.lock().swap_policy(policy);
    debug!(target: "fc::lifecycle", name = %inst.name(), from = %old.kind(), to = %kind, "policy_switched");
    inst.set_settings(Settings {
        policy: kind,
        ..inst.settings()
    });
}

/// Write-back resources for `to` must already be allocated.
fn switch_mode(inst: &CacheInstance, from: CacheMode, to: CacheMode) {
    if from.is_write_back() && !to.is_write_back() {
        inst.free_write_back();
    }
    inst.set_settings(Settings {
        mode: to,
        ..inst.settings()
    });
    debug!(target: "fc::lifecycle", name = %inst.name(), %from, %to, "mode_switched");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use fc_block::{DeviceGeometry, MemDisk};
    use fc_types::DeviceId;

    fn manager() -> (CacheManager, Arc<MemoryMetadataStore>) {
        let devices = Arc::new(DeviceTable::new());
        let geometry = DeviceGeometry::new(512, 16, 4096).expect("geometry");
        devices
            .add_mem_disk("sdb", DeviceId::new(8, 16), geometry)
            .expect("sdb");
        devices
            .add_mem_disk("sdc", DeviceId::new(8, 32), geometry)
            .expect("sdc");
        devices
            .add_mem_disk("nvme0n1", DeviceId::new(259, 0), geometry)
            .expect("nvme");
        let store = Arc::new(MemoryMetadataStore::new());
        let manager = CacheManager::new(
            ManagerConfig {
                shard_count: 4,
                ..ManagerConfig::default()
            },
            devices,
            store.clone(),
        )
        .expect("manager");
        (manager, store)
    }

    fn wt(name: &str, source: &str, cache: &str) -> CreateParams {
        CreateParams::new(name, source, cache, CacheMode::WriteThrough, PolicyKind::Lru)
    }

    #[test]
    fn create_rejects_duplicates_and_conflicts() {
        let (manager, store) = manager();
        manager.create(wt("c1", "/dev/sdb", "/dev/nvme0n1")).expect("create");
        assert!(store.load("c1").expect("load").is_some());

        assert!(matches!(
            manager.create(wt("c1", "/dev/sdc", "/dev/nvme0n1")),
            Err(FcError::Exists(_))
        ));
        assert!(matches!(
            manager.create(wt("c2", "/dev/sdc", "/dev/nvme0n1")),
            Err(FcError::DeviceConflict(_))
        ));
        assert!(matches!(
            manager.create(wt("c3", "/dev/sdb", "/dev/sdc")),
            Err(FcError::DeviceConflict(_))
        ));
        assert!(matches!(
            manager.create(wt("c4", "/dev/sdx", "/dev/sdc")),
            Err(FcError::NotFound(_))
        ));
        assert!(matches!(
            manager.create(wt("c5", "/dev/sdc", "/dev/sdc")),
            Err(FcError::DeviceConflict(_))
        ));
        assert_eq!(manager.cache_count(), 1);
    }

    #[test]
    fn racing_creates_cannot_share_a_cache_device() {
        for _ in 0..20 {
            let (manager, _) = manager();
            let gate = std::sync::Barrier::new(2);
            let results: Vec<_> = std::thread::scope(|scope| {
                let handles: Vec<_> = [("c1", "sdb"), ("c2", "sdc")]
                    .into_iter()
                    .map(|(name, source)| {
                        let (manager, gate) = (&manager, &gate);
                        scope.spawn(move || {
                            gate.wait();
                            manager.create(wt(name, source, "nvme0n1"))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("join"))
                    .collect()
            });
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(
                results
                    .iter()
                    .any(|r| matches!(r, Err(FcError::DeviceConflict(_))))
            );
            assert_eq!(manager.cache_count(), 1);
        }
    }

    #[test]
    fn failed_create_releases_its_name() {
        let (manager, store) = manager();
        store.fail_next_persists(1);
        assert!(matches!(
            manager.create(wt("c1", "sdb", "nvme0n1")),
            Err(FcError::Metadata(_))
        ));
        assert_eq!(manager.cache_count(), 0);
        assert!(!manager.devices().open("sdb").expect("sdb").disk().is_intercepted());
        manager.create(wt("c1", "sdb", "nvme0n1")).expect("retry succeeds");
    }

    #[test]
    fn edit_is_noop_when_settings_match() {
        let (manager, _) = manager();
        manager.create(wt("c1", "sdb", "nvme0n1")).expect("create");
        manager
            .edit("c1", Some(CacheMode::WriteThrough), Some(PolicyKind::Lru))
            .expect("noop edit");
        manager.edit("c1", None, Some(PolicyKind::Fifo)).expect("policy edit");
        let summary = &manager.list()[0];
        assert_eq!(summary.policy, PolicyKind::Fifo);
        assert_eq!(summary.mode, CacheMode::WriteThrough);
    }

    #[test]
    fn edit_rejected_while_modification_in_progress() {
        let (manager, _) = manager();
        let inst = manager.create(wt("c1", "sdb", "nvme0n1")).expect("create");
        inst.begin_modification().expect("claim");
        assert!(matches!(
            manager.edit("c1", Some(CacheMode::WriteBack), None),
            Err(FcError::Busy(_))
        ));
        assert!(matches!(manager.delete("c1", false), Err(FcError::Busy(_))));
        inst.end_modification();
        manager.delete("c1", false).expect("delete");
    }

    #[test]
    fn quiesce_runs_once_and_blocks_creates() {
        let (manager, store) = manager();
        manager.create(wt("c1", "sdb", "nvme0n1")).expect("create");
        assert_eq!(manager.reboot_quiesce().expect("quiesce"), 1);
        assert_eq!(manager.reboot_quiesce().expect("repeat"), 0);
        assert!(manager.list()[0].flags.read_only);
        assert!(store.load("c1").expect("load").expect("record").read_only);
        assert!(matches!(
            manager.create(wt("c2", "sdc", "nvme0n1")),
            Err(FcError::ShutdownInProgress(_))
        ));
    }

    #[test]
    fn restore_all_recreates_stored_caches() {
        let (manager, store) = manager();
        manager.create(wt("c1", "sdb", "nvme0n1")).expect("create");
        let record = store.load("c1").expect("load").expect("record");
        manager.delete("c1", false).expect("delete");
        let mut quiesced = record.clone();
        quiesced.read_only = true;
        store.persist(&quiesced).expect("persist");

        assert_eq!(manager.restore_all().expect("restore"), 1);
        assert_eq!(manager.restore_all().expect("restore again"), 0);
        let inst = manager.lookup("c1").expect("restored");
        assert!(inst.flags().read_only);
        assert_eq!(inst.block_sectors().get(), record.block_sectors);
    }
}
