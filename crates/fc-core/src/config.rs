//! Manager and per-cache configuration.

use fc_error::{FcError, Result};
use fc_types::{
    BlockSectors, DEFAULT_BLOCK_SECTORS, DEFAULT_REGISTRY_SHARDS, FINISH_DIRTY_RETRY_COUNT,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Background cleaner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Wake-up period; any dirty blocks are flushed at least this often.
    pub interval_ms: u64,
    /// Dirty share of the cache (percent) that wakes the cleaner early.
    pub dirty_high_water_percent: u8,
    /// Dirty blocks flushed per pass.
    pub batch_blocks: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            dirty_high_water_percent: 60,
            batch_blocks: 64,
        }
    }
}

impl CleanerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Process-wide cache manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Registry shards (independently locked buckets).
    pub shard_count: usize,
    /// Cache block size used when a cache does not choose one.
    pub default_block_sectors: u32,
    /// Flush passes without progress tolerated before giving up on dirty
    /// blocks during delete/edit.
    pub finish_dirty_retries: u32,
    /// Poll interval while draining in-flight I/O for edit and quiesce.
    pub structural_drain_poll_ms: u64,
    /// Poll interval while draining in-flight I/O after delete.
    pub delete_drain_poll_ms: u64,
    /// Upper bound on live read-modify-write staging pages.
    pub staging_pool_pages: usize,
    /// Skip dirty flushing on reboot quiesce even for cold-boot caches.
    pub force_warm_boot: bool,
    pub cleaner: CleanerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_REGISTRY_SHARDS,
            default_block_sectors: DEFAULT_BLOCK_SECTORS,
            finish_dirty_retries: FINISH_DIRTY_RETRY_COUNT,
            structural_drain_poll_ms: 1,
            delete_drain_poll_ms: 100,
            staging_pool_pages: 1024,
            force_warm_boot: false,
            cleaner: CleanerConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load and validate a JSON config. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            FcError::InvalidArgument(format!("{}: {e}", path.as_ref().display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(invalid("shard_count must be at least 1"));
        }
        BlockSectors::new(self.default_block_sectors)
            .map_err(|e| FcError::InvalidArgument(e.to_string()))?;
        if self.finish_dirty_retries == 0 {
            return Err(invalid("finish_dirty_retries must be at least 1"));
        }
        if self.staging_pool_pages == 0 {
            return Err(invalid("staging_pool_pages must be at least 1"));
        }
        if self.cleaner.batch_blocks == 0 {
            return Err(invalid("cleaner.batch_blocks must be at least 1"));
        }
        if self.cleaner.dirty_high_water_percent > 100 {
            return Err(invalid("cleaner.dirty_high_water_percent must be <= 100"));
        }
        Ok(())
    }

    #[must_use]
    pub fn structural_drain_poll(&self) -> Duration {
        Duration::from_millis(self.structural_drain_poll_ms.max(1))
    }

    #[must_use]
    pub fn delete_drain_poll(&self) -> Duration {
        Duration::from_millis(self.delete_drain_poll_ms.max(1))
    }
}

fn invalid(msg: &str) -> FcError {
    FcError::InvalidArgument(msg.to_owned())
}

/// Options chosen per cache at create time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Cache block size in sectors; `None` uses the manager default.
    pub block_sectors: Option<u32>,
    /// Flush dirty blocks during reboot quiesce.
    pub cold_boot: bool,
    /// Skip dirty flushing on delete.
    pub fast_remove: bool,
}

impl CacheOptions {
    pub fn resolve_block_sectors(&self, config: &ManagerConfig) -> Result<BlockSectors> {
        BlockSectors::new(self.block_sectors.unwrap_or(config.default_block_sectors))
            .map_err(|e| FcError::InvalidArgument(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.shard_count, 256);
        assert_eq!(config.default_block_sectors, 8);
        assert_eq!(config.finish_dirty_retries, 5);
        assert_eq!(config.delete_drain_poll(), Duration::from_millis(100));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_json_takes_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        write!(file, r#"{{"shard_count": 8, "cleaner": {{"interval_ms": 10}}}}"#).expect("write");
        let config = ManagerConfig::from_json_file(file.path()).expect("load");
        assert_eq!(config.shard_count, 8);
        assert_eq!(config.cleaner.interval_ms, 10);
        assert_eq!(config.cleaner.batch_blocks, 64);
        assert_eq!(config.staging_pool_pages, 1024);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ManagerConfig {
            default_block_sectors: 6,
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(FcError::InvalidArgument(_))));
        config.default_block_sectors = 8;
        config.shard_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn block_sectors_resolution() {
        let config = ManagerConfig::default();
        let opts = CacheOptions::default();
        assert_eq!(opts.resolve_block_sectors(&config).expect("bs").get(), 8);
        let opts = CacheOptions {
            block_sectors: Some(3),
            ..CacheOptions::default()
        };
        assert!(opts.resolve_block_sectors(&config).is_err());
    }
}
