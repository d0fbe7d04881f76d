//! File-backed disk using positional I/O.

use crate::bio::{Bio, BioOp};
use crate::device::{DeviceGeometry, RequestHandler};
use crate::page::{gather, scatter};
use crate::IoStats;
use fc_error::{Errno, FcError, IoStatus, Result};
use fc_types::SECTOR_SIZE;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Disk backed by a regular file or block special file.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Requests execute inline.
#[derive(Debug)]
pub struct FileDisk {
    file: Arc<File>,
    geometry: DeviceGeometry,
    writable: bool,
    stats: Mutex<IoStats>,
}

impl FileDisk {
    /// Open `path` read-write if possible, read-only otherwise. Capacity is
    /// the file length rounded down to whole logical blocks.
    pub fn open(path: impl AsRef<Path>, logical_block_size: u32, max_segments: usize) -> Result<Arc<Self>> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let lbs = u64::from(logical_block_size);
        if lbs == 0 || len < lbs {
            return Err(FcError::InvalidArgument(format!(
                "{} is smaller than one {logical_block_size}-byte block",
                path.as_ref().display()
            )));
        }
        let geometry = DeviceGeometry::new(logical_block_size, max_segments, (len / lbs) * lbs / SECTOR_SIZE)?;
        Ok(Arc::new(Self {
            file: Arc::new(file),
            geometry,
            writable,
            stats: Mutex::new(IoStats::default()),
        }))
    }

    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }

    fn service(&self, bio: &Bio) -> IoStatus {
        let range = bio.range();
        if bio.op() != BioOp::Flush && range.end() > self.geometry.capacity_sectors {
            return Err(Errno::EIO);
        }
        let offset = range.start.0 * SECTOR_SIZE;
        match bio.op() {
            BioOp::Read => {
                let mut buf = vec![0_u8; usize::try_from(bio.bytes()).map_err(|_| Errno::EINVAL)?];
                self.file.read_exact_at(&mut buf, offset).map_err(to_errno)?;
                scatter(bio.segments(), &buf);
                let mut s = self.stats.lock();
                s.reads += 1;
                s.bytes_read += bio.bytes();
            }
            BioOp::Write => {
                if !self.writable {
                    return Err(Errno::EIO);
                }
                self.file
                    .write_all_at(&gather(bio.segments()), offset)
                    .map_err(to_errno)?;
                let mut s = self.stats.lock();
                s.writes += 1;
                s.bytes_written += bio.bytes();
            }
            BioOp::Discard => {
                // Regular files have no portable hole-punch through FileExt.
                self.stats.lock().discards += 1;
            }
            BioOp::Flush => {
                self.file.sync_all().map_err(to_errno)?;
                self.stats.lock().flushes += 1;
            }
        }
        Ok(())
    }
}

fn to_errno(err: std::io::Error) -> Errno {
    Errno(FcError::Io(err).to_errno())
}

impl RequestHandler for FileDisk {
    fn make_request(&self, bio: Bio) {
        let status = self.service(&bio);
        if let Err(errno) = status {
            warn!(target: "fc::filedisk", sector = bio.sector().0, op = bio.op().as_str(), %errno, "request_failed");
            self.stats.lock().errors += 1;
        }
        bio.complete(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTable;
    use crate::page::{Page, Segment};
    use fc_types::{DeviceId, Sector};
    use std::io::Write;
    use std::sync::mpsc;

    #[test]
    fn file_disk_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&vec![0_u8; 16 * 4096]).expect("fill");
        tmp.flush().expect("flush");

        let disk = FileDisk::open(tmp.path(), 4096, 8).expect("open");
        assert_eq!(disk.geometry().capacity_sectors, 128);

        let table = DeviceTable::new();
        let bdev = table
            .add_disk("loop0", DeviceId::new(7, 0), *disk.geometry(), disk.clone())
            .expect("add");

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let data = Page::from_vec(vec![0x5A; 8192]);
        bdev.submit(
            Bio::new(Arc::clone(&bdev), Sector(8), BioOp::Write, vec![Segment::whole(data)])
                .with_end_io(move |c| tx.send(c.status).expect("send")),
        );
        assert_eq!(rx.recv().expect("write"), Ok(()));

        let out = Page::zeroed(4096);
        bdev.submit(
            Bio::new(Arc::clone(&bdev), Sector(16), BioOp::Read, vec![Segment::whole(out.clone())])
                .with_end_io(move |c| tx2.send(c.status).expect("send")),
        );
        assert_eq!(rx.recv().expect("read"), Ok(()));
        assert_eq!(out.to_vec(), vec![0x5A; 4096]);
        assert_eq!(disk.stats().writes, 1);
    }

    #[test]
    fn rejects_file_smaller_than_a_block() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        assert!(matches!(
            FileDisk::open(tmp.path(), 4096, 8),
            Err(FcError::InvalidArgument(_))
        ));
    }
}
