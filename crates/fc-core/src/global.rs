//! Process-wide cache manager with explicit init and teardown.

use crate::manager::CacheManager;
use fc_error::{FcError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

static MANAGER: RwLock<Option<Arc<CacheManager>>> = parking_lot::const_rwlock(None);

/// Install `manager` as the process-wide instance.
pub fn init_global(manager: CacheManager) -> Result<Arc<CacheManager>> {
    let mut slot = MANAGER.write();
    if slot.is_some() {
        return Err(FcError::Exists("global cache manager".to_owned()));
    }
    let manager = Arc::new(manager);
    *slot = Some(Arc::clone(&manager));
    info!(target: "fc::global", shards = manager.registry().shard_count(), "global_init");
    Ok(manager)
}

/// The process-wide manager, if initialised.
pub fn global() -> Result<Arc<CacheManager>> {
    MANAGER
        .read()
        .clone()
        .ok_or_else(|| FcError::NotFound("global cache manager".to_owned()))
}

/// Drop the process-wide manager. Refused while any cache is registered.
pub fn teardown_global() -> Result<()> {
    let mut slot = MANAGER.write();
    let Some(manager) = slot.as_ref() else {
        return Ok(());
    };
    let caches = manager.cache_count();
    if caches > 0 {
        return Err(FcError::Busy(format!("{caches} caches still registered")));
    }
    *slot = None;
    info!(target: "fc::global", "global_teardown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::CreateParams;
    use crate::metadata::MemoryMetadataStore;
    use fc_block::{DeviceGeometry, DeviceTable};
    use fc_types::{CacheMode, DeviceId, PolicyKind};

    // The only test touching the global slot, so it owns the whole sequence.
    #[test]
    fn init_use_and_teardown() {
        let devices = Arc::new(DeviceTable::new());
        let geometry = DeviceGeometry::new(512, 8, 1024).expect("geometry");
        devices
            .add_mem_disk("sda", DeviceId::new(8, 0), geometry)
            .expect("sda");
        devices
            .add_mem_disk("sdb", DeviceId::new(8, 16), geometry)
            .expect("sdb");
        let manager = CacheManager::new(
            ManagerConfig::default(),
            devices,
            Arc::new(MemoryMetadataStore::new()),
        )
        .expect("manager");

        assert!(matches!(global(), Err(FcError::NotFound(_))));
        init_global(manager).expect("init");
        let again = CacheManager::new(
            ManagerConfig::default(),
            Arc::new(DeviceTable::new()),
            Arc::new(MemoryMetadataStore::new()),
        )
        .expect("second manager");
        assert!(matches!(init_global(again), Err(FcError::Exists(_))));

        let manager = global().expect("global");
        manager
            .create(CreateParams::new(
                "c1",
                "sda",
                "sdb",
                CacheMode::WriteThrough,
                PolicyKind::Fifo,
            ))
            .expect("create");
        assert!(matches!(teardown_global(), Err(FcError::Busy(_))));
        manager.delete("c1", false).expect("delete");
        teardown_global().expect("teardown");
        assert!(global().is_err());
        teardown_global().expect("teardown is idempotent");
    }
}
