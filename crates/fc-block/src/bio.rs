//! Block I/O requests.

use crate::device::BlockDev;
use crate::page::{Segment, segments_len};
use fc_error::{Errno, IoStatus};
use fc_types::{SECTOR_SIZE, Sector, SectorRange, bytes_to_sectors};
use std::sync::Arc;
use tracing::warn;

/// Direction of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioOp {
    Read,
    Write,
    /// Payload-free trim of a sector range.
    Discard,
    /// Zero-size barrier.
    Flush,
}

impl BioOp {
    /// Whether the request carries caller data fragments.
    #[must_use]
    pub fn has_data(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Discard => "discard",
            Self::Flush => "flush",
        }
    }
}

/// Delivered exactly once to a bio's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BioCompletion {
    /// Sector the bio carried when it completed.
    pub sector: Sector,
    pub bytes: u64,
    pub op: BioOp,
    pub status: IoStatus,
}

/// One-shot completion callback.
pub type EndIo = Box<dyn FnOnce(BioCompletion) + Send + 'static>;

/// An in-flight block request.
///
/// `sector` is relative to `bdev` until the bio is submitted through
/// [`BlockDev::submit`], which rebases it onto the containing disk. A bio is
/// consumed by [`Bio::complete`]; dropping one without completing it
/// completes it with `EIO`.
pub struct Bio {
    bdev: Arc<BlockDev>,
    sector: Sector,
    op: BioOp,
    sync: bool,
    segments: Vec<Segment>,
    bytes: u64,
    end_io: Option<EndIo>,
}

impl Bio {
    /// Data request covering every byte of `segments`.
    #[must_use]
    pub fn new(bdev: Arc<BlockDev>, sector: Sector, op: BioOp, segments: Vec<Segment>) -> Self {
        let bytes = segments_len(&segments) as u64;
        Self {
            bdev,
            sector,
            op,
            sync: false,
            segments,
            bytes,
            end_io: None,
        }
    }

    #[must_use]
    pub fn discard(bdev: Arc<BlockDev>, sector: Sector, sectors: u64) -> Self {
        Self {
            bdev,
            sector,
            op: BioOp::Discard,
            sync: false,
            segments: Vec::new(),
            bytes: sectors * SECTOR_SIZE,
            end_io: None,
        }
    }

    #[must_use]
    pub fn flush(bdev: Arc<BlockDev>) -> Self {
        Self {
            bdev,
            sector: Sector::ZERO,
            op: BioOp::Flush,
            sync: true,
            segments: Vec::new(),
            bytes: 0,
            end_io: None,
        }
    }

    #[must_use]
    pub fn with_end_io(mut self, end_io: impl FnOnce(BioCompletion) + Send + 'static) -> Self {
        self.end_io = Some(Box::new(end_io));
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Replace the completion callback, returning the previous one.
    pub fn replace_end_io(&mut self, end_io: EndIo) -> Option<EndIo> {
        self.end_io.replace(end_io)
    }

    #[must_use]
    pub fn bdev(&self) -> &Arc<BlockDev> {
        &self.bdev
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn set_sector(&mut self, sector: Sector) {
        self.sector = sector;
    }

    #[must_use]
    pub fn op(&self) -> BioOp {
        self.op
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn sectors(&self) -> u64 {
        bytes_to_sectors(self.bytes)
    }

    /// Sector span of the request at its current addressing.
    #[must_use]
    pub fn range(&self) -> SectorRange {
        SectorRange::new(self.sector, self.sectors())
    }

    /// Deliver `status` to the completion callback and consume the bio.
    pub fn complete(mut self, status: IoStatus) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self.completion(status));
        }
    }

    fn completion(&self, status: IoStatus) -> BioCompletion {
        BioCompletion {
            sector: self.sector,
            bytes: self.bytes,
            op: self.op,
            status,
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if let Some(end_io) = self.end_io.take() {
            warn!(
                target: "fc::bio",
                device = %self.bdev.name(),
                sector = self.sector.0,
                op = self.op.as_str(),
                "bio_dropped_uncompleted"
            );
            end_io(self.completion(Err(Errno::EIO)));
        }
    }
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("device", &self.bdev.name())
            .field("sector", &self.sector)
            .field("op", &self.op)
            .field("bytes", &self.bytes)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}
