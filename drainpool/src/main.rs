// SPDX-License-Identifier: MIT
// drainpool: downloads a list of URLs with a pool of workers
//
// - Every URL (or manifest entry) is handed to the download pool.
// - Outcomes are logged through the queue-backed logger.
// - Both pools are shut down with the configured timeout before exiting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use serde::Deserialize;

use drainpool::download::{DownloadHandle, DownloadPool, Downloaded, FileFetcher, Mode, Target};
use drainpool::global_config::{self, LogConfig, PoolConfig, ShutdownMode};
use drainpool::logging::{self, DEFAULT_FORMAT};
use drainpool::task_state::TaskState;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// URLs to download (file:// URLs or plain paths)
    #[arg(value_name = "URL")]
    urls: Vec<String>,

    /// Number of download workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Seconds to wait for the workers on shutdown (0 allowed)
    #[arg(long, value_name = "SECS")]
    shutdown_timeout: Option<u64>,

    /// Wait for the workers on shutdown for as long as it takes
    #[arg(long)]
    wait_forever: bool,

    /// What to do about records left behind by a forced shutdown
    #[arg(long, value_enum, default_value_t)]
    shutdown_mode: ShutdownMode,

    /// Grace period of the draining worker, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 50)]
    drain_grace_ms: u64,

    /// JSON array of {"url", "target", "overwrite"} entries
    #[arg(long, value_name = "JSON")]
    manifest: Option<PathBuf>,

    /// Directory to store downloads in. Without it, downloads are kept in memory.
    #[arg(long, value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Overwrite existing files and redo finished downloads
    #[arg(long)]
    overwrite: bool,

    /// Download in the calling thread instead of queueing
    #[arg(long)]
    blocking: bool,

    /// Log filter directives, e.g. "info,drainpool::pool=debug"
    #[arg(long, env = "DRAINPOOL_LOG", default_value = "info")]
    log_filter: String,

    /// Log line template
    #[arg(long, default_value = DEFAULT_FORMAT)]
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    url: String,
    #[serde(default)]
    target: Option<PathBuf>,
    #[serde(default)]
    overwrite: bool,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.workers == 0 {
        return Err("--workers must be at least 1".into());
    }

    if args.wait_forever && args.shutdown_timeout.is_some() {
        return Err("--wait-forever and --shutdown-timeout may not be used together".into());
    }

    if args.urls.is_empty() && args.manifest.is_none() {
        return Err("nothing to download: pass at least one URL or --manifest".into());
    }

    if let Some(out_dir) = &args.out_dir {
        if !out_dir.is_dir() {
            return Err(format!("--out-dir {} is not a directory", out_dir.display()));
        }
    }

    Ok(())
}

fn pool_config(args: &Args) -> PoolConfig {
    let timeout = match (args.wait_forever, args.shutdown_timeout) {
        (true, _) => None,
        (false, Some(secs)) => Some(Duration::from_secs(secs)),
        (false, None) => PoolConfig::default().shutdown_timeout,
    };
    PoolConfig::new("download")
        .with_workers(args.workers)
        .with_shutdown_timeout(timeout)
        .with_drain_grace(Duration::from_millis(args.drain_grace_ms))
        .with_shutdown_mode(args.shutdown_mode)
}

fn read_manifest(path: &Path) -> anyhow::Result<Vec<ManifestEntry>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Last path segment of the URL, used as file name inside `--out-dir`.
fn file_name(url: &str) -> &str {
    let path = url.split_once("://").map_or(url, |(_, rest)| rest);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => "index",
    }
}

fn target_for(url: &str, explicit: Option<PathBuf>, out_dir: Option<&Path>) -> Target {
    match (explicit, out_dir) {
        (Some(path), _) => Target::File(path),
        (None, Some(dir)) => Target::File(dir.join(file_name(url))),
        (None, None) => Target::Memory,
    }
}

fn report(pool: &DownloadPool, handle: &DownloadHandle) -> bool {
    match pool.wait(handle, None) {
        Some(TaskState::Done(Downloaded::Memory(bytes))) => {
            info!("{}: {} byte(s) in memory", handle.url(), bytes.len());
            true
        }
        Some(TaskState::Done(Downloaded::File(path))) => {
            info!("{}: saved to {}", handle.url(), path.display());
            true
        }
        Some(TaskState::Done(Downloaded::Existing(path))) => {
            info!("{}: {} already exists", handle.url(), path.display());
            true
        }
        Some(TaskState::Failed(err)) => {
            error!("{}: {err}", handle.url());
            false
        }
        other => {
            error!("{}: unexpected state {:?}", handle.url(), other.map(|s| s.name()));
            false
        }
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let pool_config = pool_config(&args);
    let log_config = LogConfig {
        filter: args.log_filter.clone(),
        format: args.log_format.clone(),
        ..LogConfig::default()
    };
    global_config::initialize_global_config(pool_config.clone(), log_config.clone());

    if let Err(e) = logging::init(&global_config::get_log_config()) {
        eprintln!("Falling back to env_logger: {e:#}");
        let _ = env_logger::Builder::new()
            .parse_filters(&args.log_filter)
            .try_init();
    }

    let mut jobs: Vec<(String, Target, bool)> = args
        .urls
        .iter()
        .map(|url| {
            let target = target_for(url, None, args.out_dir.as_deref());
            (url.clone(), target, args.overwrite)
        })
        .collect();

    if let Some(manifest) = &args.manifest {
        match read_manifest(manifest) {
            Ok(entries) => jobs.extend(entries.into_iter().map(|entry| {
                let target = target_for(&entry.url, entry.target, args.out_dir.as_deref());
                (entry.url, target, entry.overwrite || args.overwrite)
            })),
            Err(e) => {
                eprintln!("Error: cannot read manifest {}: {e:#}", manifest.display());
                let _ = logging::shutdown(log_config.pool.shutdown_timeout);
                std::process::exit(2);
            }
        }
    }

    info!("Starting drainpool with {} download(s)", jobs.len());

    let pool = match DownloadPool::shared(global_config::get_pool_config(), FileFetcher) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Cannot start the download pool: {e}");
            let _ = logging::shutdown(log_config.pool.shutdown_timeout);
            std::process::exit(1);
        }
    };

    let mode = if args.blocking {
        Mode::Blocking
    } else {
        Mode::Async
    };

    let mut all_done = true;
    let mut handles = Vec::with_capacity(jobs.len());
    for (url, target, overwrite) in jobs {
        match pool.download(&url, target, mode, overwrite) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!("{url}: {e}");
                all_done = false;
            }
        }
    }

    for handle in &handles {
        all_done &= report(&pool, handle);
    }

    match pool.shutdown(pool_config.shutdown_timeout) {
        Ok(report) if report.forced => {
            warn!("Download pool shut down forcibly: {report:?}");
        }
        Ok(report) => info!("Download pool shut down in {:?}", report.elapsed),
        Err(e) => {
            error!("Download pool shutdown failed: {e}");
            all_done = false;
        }
    }

    info!("Stopping drainpool");
    if let Err(e) = logging::shutdown(log_config.pool.shutdown_timeout) {
        eprintln!("Log sink shutdown failed: {e}");
    }

    std::process::exit(if all_done { 0 } else { 1 });
}
