use fc_block::{Bio, BlockDev, DeviceGeometry, RequestHandler};
use fc_error::Errno;
use fc_types::Sector;
use std::sync::Arc;
use tracing::trace;

/// Where the engine sends physical submissions.
///
/// A routed target submits through the device's current entry point. A
/// bypass target remaps onto the containing disk and calls a fixed handler
/// directly, which is how cached I/O reaches the original path of an
/// intercepted source disk without re-entering the shim.
#[derive(Clone)]
pub struct IoTarget {
    bdev: Arc<BlockDev>,
    bypass: Option<Arc<dyn RequestHandler>>,
}

impl IoTarget {
    #[must_use]
    pub fn routed(bdev: Arc<BlockDev>) -> Self {
        Self { bdev, bypass: None }
    }

    #[must_use]
    pub fn bypass(bdev: Arc<BlockDev>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            bdev,
            bypass: Some(handler),
        }
    }

    #[must_use]
    pub fn bdev(&self) -> &Arc<BlockDev> {
        &self.bdev
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.bdev.name()
    }

    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        self.bdev.geometry()
    }

    /// Submit `bio`, addressed relative to this target's device.
    pub fn submit(&self, mut bio: Bio) {
        match &self.bypass {
            None => self.bdev.submit(bio),
            Some(handler) => {
                if bio.range().end() > self.bdev.nr_sects() {
                    bio.complete(Err(Errno::EIO));
                    return;
                }
                bio.set_sector(Sector(bio.sector().0 + self.bdev.start().0));
                trace!(target: "fc::io", device = %self.bdev.name(), sector = bio.sector().0, "bypass_submit");
                handler.make_request(bio);
            }
        }
    }
}

impl std::fmt::Debug for IoTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoTarget")
            .field("device", &self.bdev.name())
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}
