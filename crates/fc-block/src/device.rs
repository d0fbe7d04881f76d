//! Disks, their request routes, and whole-disk/partition handles.

use crate::bio::Bio;
use fc_error::{Errno, FcError, Result};
use fc_types::{DeviceId, SECTOR_SIZE, Sector, SectorRange};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// A request entry point.
///
/// Implementations must eventually complete every bio they accept, on any
/// thread. `make_request` itself must not block on physical I/O.
pub trait RequestHandler: Send + Sync {
    fn make_request(&self, bio: Bio);
}

/// Where a disk sends inbound requests.
///
/// The interception shim and the handler it wraps are separate variants, so
/// the shim can never be mistaken for the original path it forwards to.
#[derive(Clone)]
pub enum Route {
    Direct(Arc<dyn RequestHandler>),
    Intercepted {
        shim: Arc<dyn RequestHandler>,
        original: Arc<dyn RequestHandler>,
    },
}

impl Route {
    #[must_use]
    pub fn entry(&self) -> &Arc<dyn RequestHandler> {
        match self {
            Self::Direct(handler) => handler,
            Self::Intercepted { shim, .. } => shim,
        }
    }

    #[must_use]
    pub fn original(&self) -> &Arc<dyn RequestHandler> {
        match self {
            Self::Direct(handler) | Self::Intercepted { original: handler, .. } => handler,
        }
    }
}

/// Physical constraints a submission must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    /// Smallest addressable unit in bytes (power of two, >= 512).
    pub logical_block_size: u32,
    /// Maximum fragments per request.
    pub max_segments: usize,
    pub capacity_sectors: u64,
}

impl DeviceGeometry {
    pub fn new(logical_block_size: u32, max_segments: usize, capacity_sectors: u64) -> Result<Self> {
        if !logical_block_size.is_power_of_two() || u64::from(logical_block_size) < SECTOR_SIZE {
            return Err(FcError::InvalidArgument(format!(
                "logical block size {logical_block_size} is not a power of two >= {SECTOR_SIZE}"
            )));
        }
        if max_segments == 0 {
            return Err(FcError::InvalidArgument(
                "max_segments must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            logical_block_size,
            max_segments,
            capacity_sectors,
        })
    }

    /// Logical block size in sectors.
    #[must_use]
    pub fn lbs_sectors(&self) -> u64 {
        u64::from(self.logical_block_size) / SECTOR_SIZE
    }
}

/// A physical (containing) device.
pub struct Disk {
    id: DeviceId,
    name: String,
    geometry: DeviceGeometry,
    route: RwLock<Route>,
}

impl Disk {
    #[must_use]
    pub fn new(
        id: DeviceId,
        name: impl Into<String>,
        geometry: DeviceGeometry,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            geometry,
            route: RwLock::new(Route::Direct(handler)),
        })
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Hand `bio` (absolute sector) to the current entry point.
    ///
    /// The route lock is released before the handler runs.
    pub fn submit(&self, bio: Bio) {
        let entry = Arc::clone(self.route.read().entry());
        entry.make_request(bio);
    }

    /// The non-intercepted handler, whatever the current route.
    #[must_use]
    pub fn original_handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(self.route.read().original())
    }

    #[must_use]
    pub fn is_intercepted(&self) -> bool {
        matches!(*self.route.read(), Route::Intercepted { .. })
    }

    /// Install `shim` as the entry point and return the handler it wraps.
    ///
    /// If the disk is already intercepted the existing route is kept and its
    /// original is returned.
    pub fn intercept(&self, shim: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> {
        let mut route = self.route.write();
        match &*route {
            Route::Intercepted { original, .. } => {
                debug!(target: "fc::device", disk = %self.name, "intercept_already_installed");
                Arc::clone(original)
            }
            Route::Direct(original) => {
                let original = Arc::clone(original);
                *route = Route::Intercepted {
                    shim,
                    original: Arc::clone(&original),
                };
                info!(target: "fc::device", disk = %self.name, "entry_point_intercepted");
                original
            }
        }
    }

    /// Route requests straight to the original handler again.
    pub fn restore(&self) {
        let mut route = self.route.write();
        if let Route::Intercepted { original, .. } = &*route {
            *route = Route::Direct(Arc::clone(original));
            info!(target: "fc::device", disk = %self.name, "entry_point_restored");
        }
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("intercepted", &self.is_intercepted())
            .finish()
    }
}

/// A whole disk or one partition of it.
#[derive(Debug)]
pub struct BlockDev {
    id: DeviceId,
    name: String,
    disk: Arc<Disk>,
    start: Sector,
    nr_sects: u64,
}

impl BlockDev {
    #[must_use]
    pub fn whole(disk: &Arc<Disk>) -> Arc<Self> {
        Arc::new(Self {
            id: disk.id(),
            name: disk.name().to_owned(),
            disk: Arc::clone(disk),
            start: Sector::ZERO,
            nr_sects: disk.geometry().capacity_sectors,
        })
    }

    pub fn partition(
        disk: &Arc<Disk>,
        id: DeviceId,
        name: impl Into<String>,
        start: Sector,
        nr_sects: u64,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let extent = SectorRange::new(start, nr_sects);
        if nr_sects == 0 || extent.end() > disk.geometry().capacity_sectors {
            return Err(FcError::InvalidArgument(format!(
                "partition {name} extent {extent} exceeds disk {} ({} sectors)",
                disk.name(),
                disk.geometry().capacity_sectors
            )));
        }
        if id == disk.id() {
            return Err(FcError::InvalidArgument(format!(
                "partition {name} reuses disk id {id}"
            )));
        }
        Ok(Arc::new(Self {
            id,
            name,
            disk: Arc::clone(disk),
            start,
            nr_sects,
        }))
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        self.disk.geometry()
    }

    #[must_use]
    pub fn is_whole_disk(&self) -> bool {
        self.id == self.disk.id()
    }

    #[must_use]
    pub fn start(&self) -> Sector {
        self.start
    }

    #[must_use]
    pub fn nr_sects(&self) -> u64 {
        self.nr_sects
    }

    /// Absolute sector span on the containing disk.
    #[must_use]
    pub fn extent(&self) -> SectorRange {
        SectorRange::new(self.start, self.nr_sects)
    }

    /// Remap `bio` from device-relative to absolute addressing and submit it
    /// to the containing disk's current entry point.
    pub fn submit(&self, mut bio: Bio) {
        let range = bio.range();
        if range.end() > self.nr_sects {
            debug!(
                target: "fc::device",
                device = %self.name,
                sector = range.start.0,
                count = range.count,
                nr_sects = self.nr_sects,
                "bio_beyond_device"
            );
            bio.complete(Err(Errno::EIO));
            return;
        }
        bio.set_sector(Sector(range.start.0 + self.start.0));
        trace!(target: "fc::device", device = %self.name, sector = bio.sector().0, "bio_submit");
        self.disk.submit(bio);
    }
}

/// Name → device resolution for the devices known to this process.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: RwLock<BTreeMap<String, Arc<BlockDev>>>,
}

impl DeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disk and its whole-disk handle.
    pub fn add_disk(
        &self,
        name: &str,
        id: DeviceId,
        geometry: DeviceGeometry,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<BlockDev>> {
        let disk = Disk::new(id, name, geometry, handler);
        let bdev = BlockDev::whole(&disk);
        self.insert(Arc::clone(&bdev))?;
        Ok(bdev)
    }

    /// Register partition `index` of disk `disk_name`, named `<disk><index>`.
    pub fn add_partition(
        &self,
        disk_name: &str,
        index: u32,
        start: Sector,
        nr_sects: u64,
    ) -> Result<Arc<BlockDev>> {
        let whole = self.open(disk_name)?;
        if !whole.is_whole_disk() {
            return Err(FcError::InvalidArgument(format!(
                "{disk_name} is not a whole disk"
            )));
        }
        let disk = whole.disk();
        let id = DeviceId::new(disk.id().major, disk.id().minor + index);
        let part = BlockDev::partition(disk, id, format!("{disk_name}{index}"), start, nr_sects)?;
        self.insert(Arc::clone(&part))?;
        Ok(part)
    }

    fn insert(&self, bdev: Arc<BlockDev>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(bdev.name()) {
            return Err(FcError::Exists(format!("device {}", bdev.name())));
        }
        devices.insert(bdev.name().to_owned(), bdev);
        Ok(())
    }

    /// Resolve `path` (`/dev/<name>` or a bare name).
    pub fn open(&self, path: &str) -> Result<Arc<BlockDev>> {
        let name = path.strip_prefix("/dev/").unwrap_or(path);
        self.devices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FcError::NotFound(format!("device {path}")))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{BioCompletion, BioOp};
    use crate::page::{Page, Segment};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, BioOp)>>,
    }

    impl RequestHandler for Recorder {
        fn make_request(&self, bio: Bio) {
            self.seen.lock().push((bio.sector().0, bio.op()));
            bio.complete(Ok(()));
        }
    }

    fn geometry() -> DeviceGeometry {
        DeviceGeometry::new(512, 16, 1000).expect("geometry")
    }

    #[test]
    fn geometry_validation() {
        assert!(DeviceGeometry::new(1000, 4, 8).is_err());
        assert!(DeviceGeometry::new(256, 4, 8).is_err());
        assert!(DeviceGeometry::new(4096, 0, 8).is_err());
        assert_eq!(DeviceGeometry::new(4096, 4, 8).expect("geo").lbs_sectors(), 8);
    }

    #[test]
    fn partition_submit_remaps_to_absolute_sector() {
        let recorder = Arc::new(Recorder::default());
        let table = DeviceTable::new();
        table
            .add_disk("sdb", DeviceId::new(8, 16), geometry(), recorder.clone())
            .expect("disk");
        let part = table
            .add_partition("sdb", 1, Sector(100), 200)
            .expect("partition");
        assert_eq!(part.name(), "sdb1");
        assert!(!part.is_whole_disk());

        let seg = Segment::whole(Page::zeroed(512));
        part.submit(Bio::new(Arc::clone(&part), Sector(5), BioOp::Read, vec![seg]));
        assert_eq!(*recorder.seen.lock(), vec![(105, BioOp::Read)]);
    }

    #[test]
    fn partition_rejects_request_past_its_end() {
        let recorder = Arc::new(Recorder::default());
        let table = DeviceTable::new();
        table
            .add_disk("sdc", DeviceId::new(8, 32), geometry(), recorder.clone())
            .expect("disk");
        let part = table.add_partition("sdc", 2, Sector(0), 10).expect("partition");

        let (tx, rx) = std::sync::mpsc::channel::<BioCompletion>();
        let seg = Segment::whole(Page::zeroed(1024));
        part.submit(
            Bio::new(Arc::clone(&part), Sector(9), BioOp::Write, vec![seg])
                .with_end_io(move |c| tx.send(c).expect("send")),
        );
        assert_eq!(rx.recv().expect("completion").status, Err(Errno::EIO));
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn intercept_and_restore_swap_the_entry_point() {
        let original = Arc::new(Recorder::default());
        let shim = Arc::new(Recorder::default());
        let disk = Disk::new(DeviceId::new(8, 48), "sdd", geometry(), original.clone());
        let bdev = BlockDev::whole(&disk);

        let stashed = disk.intercept(shim.clone());
        assert!(disk.is_intercepted());
        // A second interception keeps the first shim and the same original.
        let again = disk.intercept(Arc::new(Recorder::default()));
        assert!(Arc::ptr_eq(&stashed, &again));

        bdev.submit(Bio::flush(Arc::clone(&bdev)));
        assert_eq!(shim.seen.lock().len(), 1);
        assert!(original.seen.lock().is_empty());

        disk.restore();
        assert!(!disk.is_intercepted());
        bdev.submit(Bio::flush(Arc::clone(&bdev)));
        assert_eq!(original.seen.lock().len(), 1);
    }

    #[test]
    fn dropped_bio_completes_with_eio() {
        let disk = Disk::new(
            DeviceId::new(8, 64),
            "sde",
            geometry(),
            Arc::new(Recorder::default()),
        );
        let bdev = BlockDev::whole(&disk);
        let (tx, rx) = std::sync::mpsc::channel::<BioCompletion>();
        let bio = Bio::discard(bdev, Sector(3), 2).with_end_io(move |c| tx.send(c).expect("send"));
        drop(bio);
        let done = rx.recv().expect("completion");
        assert_eq!(done.status, Err(Errno::EIO));
        assert_eq!(done.bytes, 1024);
    }

    #[test]
    fn open_strips_dev_prefix_and_reports_missing() {
        let table = DeviceTable::new();
        table
            .add_disk("sdf", DeviceId::new(8, 80), geometry(), Arc::new(Recorder::default()))
            .expect("disk");
        assert!(table.open("/dev/sdf").is_ok());
        assert!(matches!(table.open("/dev/nope"), Err(FcError::NotFound(_))));
        assert!(matches!(
            table.add_disk("sdf", DeviceId::new(8, 96), geometry(), Arc::new(Recorder::default())),
            Err(FcError::Exists(_))
        ));
    }
}
