//! vigil_sweep - one retention sweep pass
//!
//! Deletes locally stored evidence clips and offline alerts older than the
//! retention window. The daemon runs the same pass daily in-process; this
//! binary exists for external cron, and the two are safe to run at the same
//! time.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use vigil_core::sweeper;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding locally stored evidence clips.
    #[arg(long, env = "LOCAL_EVIDENCE_DIR", default_value = "local_evidence")]
    evidence_dir: PathBuf,
    /// Directory holding spooled offline alerts.
    #[arg(long, env = "OFFLINE_ALERTS_DIR", default_value = "offline_alerts")]
    offline_alerts_dir: PathBuf,
    /// Delete files older than this many days.
    #[arg(long, env = "RETENTION_DAYS", default_value_t = 30)]
    retention_days: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let retention = Duration::from_secs(args.retention_days * 24 * 60 * 60);
    let stats = sweeper::sweep_once(&args.evidence_dir, &args.offline_alerts_dir, retention);
    println!(
        "scanned {} files, deleted {}, {} failures",
        stats.scanned, stats.deleted, stats.failed
    );
    Ok(())
}
