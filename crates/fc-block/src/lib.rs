#![forbid(unsafe_code)]
//! Block I/O provider model.
//!
//! This crate is the platform the cache layer is inserted into:
//!
//! - [`Page`]/[`Segment`]: shared data buffers and request fragments.
//! - [`Bio`]: a block request with a one-shot completion callback. Every bio
//!   completes exactly once; dropping one completes it with `EIO`.
//! - [`Disk`]: a physical device with a swappable [`Route`]. Interception
//!   installs a shim in front of the original handler; restoring removes it.
//! - [`BlockDev`]: a whole-disk or partition handle that remaps
//!   partition-relative sectors onto its disk.
//! - [`MemDisk`]/[`FileDisk`]: backends that execute requests.

mod bio;
mod device;
mod file;
mod mem;
mod page;

pub use bio::{Bio, BioCompletion, BioOp, EndIo};
pub use device::{BlockDev, DeviceGeometry, DeviceTable, Disk, RequestHandler, Route};
pub use file::FileDisk;
pub use mem::MemDisk;
pub use page::{Page, Segment, SegmentCursor, gather, scatter, segments_len};

use serde::Serialize;

/// Per-backend request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    pub flushes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Requests refused for violating the device geometry.
    pub rejected: u64,
    /// Requests completed with an error (including rejections).
    pub errors: u64,
    pub max_segments_seen: usize,
}
