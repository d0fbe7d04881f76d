#![forbid(unsafe_code)]
//! Plain data types shared by every FrankenCache crate.
//!
//! Units: all positions and lengths on a device are expressed in 512-byte
//! sectors (`Sector`) unless a name says `bytes`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;
pub const PAGE_SIZE: usize = 4096;

/// Number of independently locked registry buckets.
pub const DEFAULT_REGISTRY_SHARDS: usize = 256;

/// Default cache block size in sectors (4 KiB).
pub const DEFAULT_BLOCK_SECTORS: u32 = 8;

/// Flush passes allowed to make no progress before a dirty drain gives up.
pub const FINISH_DIRTY_RETRY_COUNT: u32 = 5;

/// Kernel-style device number of a disk or partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Map this device to one of `shard_count` buckets.
    ///
    /// Partitions of one disk must be hashed by the *containing* disk id so
    /// that they share a bucket; callers pass the containing id.
    #[must_use]
    #[inline]
    pub fn shard(self, shard_count: usize) -> usize {
        if shard_count == 0 {
            return 0;
        }
        let raw = (u64::from(self.major) << 32) | u64::from(self.minor);
        // Multiply by a large odd constant and fold so that consecutive minors
        // spread across buckets.
        let mixed = raw.wrapping_mul(0x517c_c1b7_2722_0a95);
        let folded = mixed ^ (mixed >> 29);
        let count = u64::try_from(shard_count).unwrap_or(u64::MAX);
        usize::try_from(folded % count).unwrap_or(0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Absolute or relative sector number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Sector(pub u64);

impl Sector {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, sectors: u64) -> Option<Self> {
        self.0.checked_sub(sectors).map(Self)
    }

    /// Byte offset of this sector.
    #[must_use]
    pub fn to_bytes(self) -> Option<u64> {
        self.0.checked_mul(SECTOR_SIZE)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Convert a byte length to whole sectors (truncating).
#[must_use]
#[inline]
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}

/// Convert sectors to bytes, saturating on overflow.
#[must_use]
#[inline]
pub fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors.saturating_mul(SECTOR_SIZE)
}

/// Half-open sector range `[start, start + count)`.
///
/// Invariant: `count > 0` for any range that describes data; zero-length
/// ranges only describe payload-free requests (flush barriers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRange {
    pub start: Sector,
    pub count: u64,
}

impl SectorRange {
    #[must_use]
    pub const fn new(start: Sector, count: u64) -> Self {
        Self { start, count }
    }

    /// Build the range covering the inclusive bounds `[first, last]`.
    #[must_use]
    pub fn from_inclusive(first: Sector, last: Sector) -> Self {
        Self {
            start: first,
            count: last.0.saturating_sub(first.0).saturating_add(1),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One past the last sector.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0.saturating_add(self.count)
    }

    /// Last sector in the range. Meaningless for empty ranges.
    #[must_use]
    pub fn last(&self) -> Sector {
        Sector(self.end().saturating_sub(1))
    }

    #[must_use]
    pub fn contains_sector(&self, sector: Sector) -> bool {
        sector.0 >= self.start.0 && sector.0 < self.end()
    }

    /// True when `other` lies entirely inside `self`.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        !other.is_empty() && other.start.0 >= self.start.0 && other.end() <= self.end()
    }

    /// True when the two ranges share at least one sector.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.0 < other.end()
            && other.start.0 < self.end()
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.0, self.end())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unknown {field} value: {value}")]
    UnknownValue { field: &'static str, value: String },
}

/// Cache operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    ReadOnly,
    WriteThrough,
    WriteBack,
}

impl CacheMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::WriteThrough => "wt",
            Self::WriteBack => "wb",
        }
    }

    #[must_use]
    pub fn is_write_back(self) -> bool {
        matches!(self, Self::WriteBack)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ro" | "read_only" | "read-only" => Ok(Self::ReadOnly),
            "wt" | "write_through" | "write-through" => Ok(Self::WriteThrough),
            "wb" | "write_back" | "write-back" => Ok(Self::WriteBack),
            _ => Err(ParseError::UnknownValue {
                field: "mode",
                value: s.to_owned(),
            }),
        }
    }
}

/// Replacement policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Fifo,
    Lru,
    Rand,
}

impl PolicyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lru => "lru",
            Self::Rand => "rand",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lru" => Ok(Self::Lru),
            "rand" | "random" => Ok(Self::Rand),
            _ => Err(ParseError::UnknownValue {
                field: "policy",
                value: s.to_owned(),
            }),
        }
    }
}

/// Whether an instance caches a whole disk or one partition of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevKind {
    WholeDisk,
    Partition,
}

/// Validated cache block size in sectors (power of two, at least one sector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockSectors(u32);

impl BlockSectors {
    pub fn new(sectors: u32) -> Result<Self, ParseError> {
        if sectors == 0 || !sectors.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_sectors",
                reason: "must be a non-zero power of two",
            });
        }
        Ok(Self(sectors))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn bytes(self) -> u64 {
        sectors_to_bytes(u64::from(self.0))
    }

    /// Cache block index containing `sector`.
    #[must_use]
    pub fn block_of(self, sector: Sector) -> u64 {
        sector.0 >> self.0.trailing_zeros()
    }

    /// First sector of cache block `block`.
    #[must_use]
    pub fn first_sector(self, block: u64) -> Sector {
        Sector(block << self.0.trailing_zeros())
    }
}

impl Default for BlockSectors {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SECTORS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn range_containment_and_intersection() {
        let part = SectorRange::from_inclusive(Sector(2048), Sector(4095));
        assert_eq!(part.count, 2048);
        assert!(part.contains(&SectorRange::new(Sector(2048), 8)));
        assert!(part.contains(&SectorRange::new(Sector(4088), 8)));
        assert!(!part.contains(&SectorRange::new(Sector(4090), 8)));
        assert!(part.intersects(&SectorRange::new(Sector(4090), 8)));
        assert!(part.intersects(&SectorRange::new(Sector(2040), 16)));
        assert!(!part.intersects(&SectorRange::new(Sector(4096), 8)));
        assert!(!part.intersects(&SectorRange::new(Sector(0), 0)));
    }

    #[test]
    fn range_spanning_whole_partition_intersects_without_endpoints_inside() {
        let part = SectorRange::new(Sector(100), 10);
        let outer = SectorRange::new(Sector(90), 40);
        assert!(part.intersects(&outer));
        assert!(!part.contains(&outer));
    }

    #[test]
    fn mode_and_policy_parse() {
        assert_eq!("wb".parse::<CacheMode>(), Ok(CacheMode::WriteBack));
        assert_eq!("Write-Through".parse::<CacheMode>(), Ok(CacheMode::WriteThrough));
        assert_eq!("ro".parse::<CacheMode>(), Ok(CacheMode::ReadOnly));
        assert!("mirror".parse::<CacheMode>().is_err());
        assert_eq!("lru".parse::<PolicyKind>(), Ok(PolicyKind::Lru));
        assert_eq!("random".parse::<PolicyKind>(), Ok(PolicyKind::Rand));
        assert_eq!(CacheMode::WriteBack.to_string(), "wb");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&CacheMode::WriteThrough).expect("serialize");
        assert_eq!(json, "\"write_through\"");
        let kind: DevKind = serde_json::from_str("\"whole_disk\"").expect("deserialize");
        assert_eq!(kind, DevKind::WholeDisk);
    }

    #[test]
    fn block_sectors_validation() {
        assert!(BlockSectors::new(0).is_err());
        assert!(BlockSectors::new(6).is_err());
        let bs = BlockSectors::new(8).expect("valid");
        assert_eq!(bs.bytes(), 4096);
        assert_eq!(bs.block_of(Sector(15)), 1);
        assert_eq!(bs.first_sector(3), Sector(24));
    }

    #[test]
    fn partitions_of_one_disk_share_a_shard() {
        let disk = DeviceId::new(8, 16);
        assert_eq!(disk.shard(256), disk.shard(256));
        assert!(disk.shard(256) < 256);
        assert_eq!(disk.shard(0), 0);
    }

    proptest! {
        #[test]
        fn contained_ranges_always_intersect(
            start in 0_u64..1_000_000,
            len in 1_u64..10_000,
            off in 0_u64..10_000,
            sub in 1_u64..10_000,
        ) {
            let outer = SectorRange::new(Sector(start), len);
            let inner_start = start + off % len;
            let inner_len = sub.min(outer.end() - inner_start);
            let inner = SectorRange::new(Sector(inner_start), inner_len);
            prop_assert!(outer.contains(&inner));
            prop_assert!(outer.intersects(&inner));
        }
    }
}
