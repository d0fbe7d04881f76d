#![forbid(unsafe_code)]

mod scenario;

use anyhow::{Context, Result, bail};
use fc_core::{JsonMetadataStore, ManagerConfig, MemoryMetadataStore, MetadataStore};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Log to stderr; `RUST_LOG` overrides the default `info` filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "simulate" => {
            let Some(path) = args.next() else {
                bail!("simulate requires a scenario path");
            };
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|a| a == "--json");
            let metadata_dir = remaining
                .iter()
                .position(|a| a == "--metadata-dir")
                .map(|i| {
                    remaining
                        .get(i + 1)
                        .map(PathBuf::from)
                        .context("--metadata-dir requires a directory")
                })
                .transpose()?;
            simulate(Path::new(&path), json, metadata_dir.as_deref())
        }
        "check-config" => {
            let Some(path) = args.next() else {
                bail!("check-config requires a config path");
            };
            check_config(Path::new(&path))
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        _ => bail!("unknown command: {command}"),
    }
}

fn simulate(path: &Path, json: bool, metadata_dir: Option<&Path>) -> Result<()> {
    let scenario = scenario::load(path)?;
    let store: Arc<dyn MetadataStore> = match metadata_dir {
        Some(dir) => Arc::new(
            JsonMetadataStore::open(dir)
                .with_context(|| format!("failed to open metadata dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryMetadataStore::new()),
    };

    let manager = fc_core::init_global(scenario::build_manager(&scenario, store)?)?;
    let report = scenario::run_steps(&manager, &scenario.steps);
    scenario::teardown(&manager);
    drop(manager);
    fc_core::teardown_global().context("failed to tear down cache manager")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        for step in &report.steps {
            let status = if step.ok { "ok" } else { "FAILED" };
            println!("[{:>3}] {:<12} {:<6} {}", step.index, step.op, status, step.detail);
        }
        println!();
        if report.caches.is_empty() {
            println!("no caches registered at end of scenario");
        }
        for cache in &report.caches {
            println!(
                "{} {} -> {} mode={} policy={} resident={} dirty={} hits={}/{}",
                cache.name,
                cache.source,
                cache.cache,
                cache.mode,
                cache.policy,
                cache.resident_blocks,
                cache.dirty_blocks,
                cache.stats.read_hits,
                cache.stats.reads,
            );
        }
    }

    let failed = report.failed_steps();
    if failed > 0 {
        bail!("{failed} of {} steps failed", report.steps.len());
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = ManagerConfig::from_json_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("serialize config")?
    );
    Ok(())
}

fn print_usage() {
    println!("fc-cli: block cache interception layer scenario runner");
    println!();
    println!("USAGE:");
    println!("  fc-cli simulate <scenario.json> [--json] [--metadata-dir <dir>]");
    println!("  fc-cli check-config <config.json>");
    println!();
    println!("A scenario lists in-memory or file-backed disks and a sequence of");
    println!("create/edit/delete/read/write/discard/flush/quiesce/restore steps.");
    println!("Set RUST_LOG=fc=debug for per-request routing events.");
}
