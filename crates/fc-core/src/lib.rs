#![forbid(unsafe_code)]
//! Transparent block-cache interception and dispatch.
//!
//! A [`CacheManager`] binds a fast cache device to a slower source device
//! (a whole disk or one partition of it). The first cache on a disk swaps
//! the disk's entry point for a routing shim; requests that fall inside a
//! cache are rebased and served through the cache, requests that straddle
//! a cache boundary are split into one-sector children, and everything
//! else reaches the original entry point untouched.

pub mod cachemap;
pub mod cleaner;
pub mod config;
pub mod global;
pub mod instance;
pub mod manager;
mod mapper;
pub mod metadata;
pub mod policy;
pub mod registry;
mod shim;

pub use cachemap::{CacheMap, Lookup, SlotState};
pub use cleaner::{finish_dirty, flush_dirty};
pub use config::{CacheOptions, CleanerConfig, ManagerConfig};
pub use global::{global, init_global, teardown_global};
pub use instance::{CacheInstance, CacheStats, CacheSummary, InstanceFlags, Settings};
pub use manager::{CacheManager, CreateParams};
pub use metadata::{CacheRecord, JsonMetadataStore, MemoryMetadataStore, MetadataStore};
pub use policy::{ReplacementPolicy, build_policy};
pub use registry::Registry;
