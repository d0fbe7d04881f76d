//! JSON-described device setups and step sequences for `fc-cli simulate`.

use anyhow::{Context, Result, bail};
use fc_block::{Bio, BioOp, BlockDev, DeviceGeometry, DeviceTable, FileDisk, Page, RequestHandler, Segment};
use fc_core::{
    CacheManager, CacheOptions, CacheSummary, CreateParams, ManagerConfig, MetadataStore,
};
use fc_error::{Errno, FcError, IoStatus};
use fc_types::{CacheMode, DeviceId, PolicyKind, SECTOR_SIZE, Sector};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing::{info, warn};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub config: ManagerConfig,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    /// In-memory capacity. Ignored when `file` backs the disk.
    #[serde(default)]
    pub sectors: u64,
    #[serde(default = "default_logical_block_size")]
    pub logical_block_size: u32,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
}

fn default_logical_block_size() -> u32 {
    512
}

fn default_max_segments() -> usize {
    128
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub index: u32,
    pub start: u64,
    pub sectors: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Create {
        name: String,
        source: String,
        cache: String,
        mode: CacheMode,
        policy: PolicyKind,
        #[serde(default)]
        options: CacheOptions,
    },
    Edit {
        name: String,
        #[serde(default)]
        mode: Option<CacheMode>,
        #[serde(default)]
        policy: Option<PolicyKind>,
    },
    Delete {
        name: String,
        #[serde(default)]
        force: bool,
    },
    Read {
        device: String,
        sector: u64,
        sectors: u64,
    },
    Write {
        device: String,
        sector: u64,
        sectors: u64,
        fill: u8,
    },
    Discard {
        device: String,
        sector: u64,
        sectors: u64,
    },
    Flush {
        device: String,
    },
    /// Run one cleaner pass by hand.
    FlushDirty {
        name: String,
    },
    Quiesce,
    Restore,
    List,
}

impl Step {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Discard { .. } => "discard",
            Self::Flush { .. } => "flush",
            Self::FlushDirty { .. } => "flush_dirty",
            Self::Quiesce => "quiesce",
            Self::Restore => "restore",
            Self::List => "list",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    pub detail: String,
    /// Negative errno on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub steps: Vec<StepReport>,
    pub caches: Vec<CacheSummary>,
}

impl Report {
    #[must_use]
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

pub fn load(path: &std::path::Path) -> Result<Scenario> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    let scenario: Scenario = serde_json::from_str(&text)
        .with_context(|| format!("invalid scenario {}", path.display()))?;
    scenario.config.validate().context("invalid manager config")?;
    Ok(scenario)
}

/// Register every device of `scenario` and build a manager over them.
pub fn build_manager(scenario: &Scenario, store: Arc<dyn MetadataStore>) -> Result<CacheManager> {
    let devices = Arc::new(DeviceTable::new());
    for spec in &scenario.devices {
        let id = DeviceId::new(spec.major, spec.minor);
        if let Some(path) = &spec.file {
            let disk = FileDisk::open(path, spec.logical_block_size, spec.max_segments)
                .with_context(|| format!("failed to open backing file for {}", spec.name))?;
            let geometry = *disk.geometry();
            devices.add_disk(&spec.name, id, geometry, disk as Arc<dyn RequestHandler>)?;
        } else {
            let geometry = DeviceGeometry::new(spec.logical_block_size, spec.max_segments, spec.sectors)
                .with_context(|| format!("invalid geometry for {}", spec.name))?;
            devices.add_mem_disk(&spec.name, id, geometry)?;
        }
        for part in &spec.partitions {
            devices
                .add_partition(&spec.name, part.index, Sector(part.start), part.sectors)
                .with_context(|| format!("invalid partition {}{}", spec.name, part.index))?;
        }
        info!(target: "fc::cli", name = %spec.name, %id, partitions = spec.partitions.len(), "device_registered");
    }
    Ok(CacheManager::new(scenario.config.clone(), devices, store)?)
}

/// Run `steps` in order. A failing step is recorded and the run goes on.
pub fn run_steps(manager: &CacheManager, steps: &[Step]) -> Report {
    let steps = steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let outcome = run_step(manager, step);
            let (ok, detail, errno) = match outcome {
                Ok(detail) => (true, detail, None),
                Err(StepError::Cache(err)) => {
                    let errno = err.to_errno();
                    (false, err.to_string(), Some(-errno))
                }
                Err(StepError::Io(errno)) => (false, errno.to_string(), Some(-errno.get())),
                Err(StepError::Other(err)) => (false, format!("{err:#}"), None),
            };
            if !ok {
                warn!(target: "fc::cli", index, op = step.op(), %detail, "step_failed");
            }
            StepReport {
                index,
                op: step.op(),
                ok,
                detail,
                errno,
            }
        })
        .collect();
    Report {
        steps,
        caches: manager.list(),
    }
}

/// Delete whatever caches the scenario left behind, flushing first when
/// possible.
pub fn teardown(manager: &CacheManager) {
    for summary in manager.list() {
        if let Err(err) = manager.delete(&summary.name, false) {
            warn!(target: "fc::cli", name = %summary.name, %err, "teardown_delete_forced");
            if let Err(err) = manager.delete(&summary.name, true) {
                warn!(target: "fc::cli", name = %summary.name, %err, "teardown_delete_failed");
            }
        }
    }
}

enum StepError {
    Cache(FcError),
    Io(Errno),
    Other(anyhow::Error),
}

impl From<FcError> for StepError {
    fn from(err: FcError) -> Self {
        Self::Cache(err)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

fn run_step(manager: &CacheManager, step: &Step) -> std::result::Result<String, StepError> {
    match step {
        Step::Create {
            name,
            source,
            cache,
            mode,
            policy,
            options,
        } => {
            let inst = manager.create(
                CreateParams::new(name, source, cache, *mode, *policy).with_options(*options),
            )?;
            Ok(format!(
                "{} caches {} of {} with {} blocks",
                inst.name(),
                inst.extent(),
                inst.source().disk().name(),
                inst.summary().capacity_blocks,
            ))
        }
        Step::Edit { name, mode, policy } => {
            manager.edit(name, *mode, *policy)?;
            let settings = manager.lookup(name)?.settings();
            Ok(format!("{name} now {} {}", settings.mode, settings.policy))
        }
        Step::Delete { name, force } => {
            manager.delete(name, *force)?;
            Ok(format!("{name} deleted"))
        }
        Step::Read {
            device,
            sector,
            sectors,
        } => {
            let bdev = manager.devices().open(device)?;
            let page = Page::zeroed(data_len(*sectors)?);
            let bio = Bio::new(
                Arc::clone(&bdev),
                Sector(*sector),
                BioOp::Read,
                vec![Segment::whole(page.clone())],
            );
            submit_wait(&bdev, bio)?;
            Ok(format!("fnv1a={:016x}", fnv1a(&page.to_vec())))
        }
        Step::Write {
            device,
            sector,
            sectors,
            fill,
        } => {
            let bdev = manager.devices().open(device)?;
            let page = Page::from_vec(vec![*fill; data_len(*sectors)?]);
            let bio = Bio::new(
                Arc::clone(&bdev),
                Sector(*sector),
                BioOp::Write,
                vec![Segment::whole(page)],
            );
            submit_wait(&bdev, bio)?;
            Ok(format!("wrote {sectors} sectors of {fill:#04x}"))
        }
        Step::Discard {
            device,
            sector,
            sectors,
        } => {
            let bdev = manager.devices().open(device)?;
            submit_wait(&bdev, Bio::discard(Arc::clone(&bdev), Sector(*sector), *sectors))?;
            Ok(format!("discarded {sectors} sectors"))
        }
        Step::Flush { device } => {
            let bdev = manager.devices().open(device)?;
            submit_wait(&bdev, Bio::flush(Arc::clone(&bdev)))?;
            Ok("flushed".to_owned())
        }
        Step::FlushDirty { name } => {
            let remaining = fc_core::flush_dirty(&manager.lookup(name)?)?;
            Ok(format!("{remaining} dirty blocks remain"))
        }
        Step::Quiesce => {
            let count = manager.reboot_quiesce()?;
            Ok(format!("{count} caches quiesced"))
        }
        Step::Restore => {
            let count = manager.restore_all()?;
            Ok(format!("{count} caches restored"))
        }
        Step::List => {
            let names: Vec<String> = manager.list().into_iter().map(|s| s.name).collect();
            Ok(names.join(","))
        }
    }
}

fn data_len(sectors: u64) -> Result<usize> {
    if sectors == 0 {
        bail!("data requests need at least one sector");
    }
    sectors
        .checked_mul(SECTOR_SIZE)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .context("request too large")
}

fn submit_wait(bdev: &Arc<BlockDev>, bio: Bio) -> std::result::Result<(), StepError> {
    let (tx, rx) = mpsc::channel::<IoStatus>();
    bdev.submit(bio.with_end_io(move |c| {
        let _ = tx.send(c.status);
    }));
    let status = rx
        .recv_timeout(IO_TIMEOUT)
        .map_err(|_| StepError::Other(anyhow::anyhow!("request did not complete within {IO_TIMEOUT:?}")))?;
    status.map_err(StepError::Io)
}

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
