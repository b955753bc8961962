//! Retention sweeper.
//!
//! Bounds disk usage by deleting locally stored evidence clips (and their
//! sidecars) and offline alerts older than the retention window, by file
//! modification time. Runs daily in-process; the `vigil_sweep` binary runs
//! the same pass for external cron, and both are safe to run concurrently:
//! a file the other pass already unlinked is logged and skipped, never
//! fatal.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Outcome of one sweep pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Delete files older than `retention` under both directories. Missing
/// directories are fine (nothing has been spooled or stored yet).
pub fn sweep_once(
    evidence_dir: &Path,
    offline_alerts_dir: &Path,
    retention: Duration,
) -> SweepStats {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut stats = SweepStats::default();
    for dir in [evidence_dir, offline_alerts_dir] {
        sweep_dir(dir, cutoff, &mut stats);
    }
    log::info!(
        "retention sweep: scanned={} deleted={} failed={}",
        stats.scanned,
        stats.deleted,
        stats.failed
    );
    stats
}

fn sweep_dir(dir: &Path, cutoff: SystemTime, stats: &mut SweepStats) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            log::warn!("retention sweep cannot read '{}': {}", dir.display(), err);
            return;
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        stats.scanned += 1;
        match file_older_than(&path, cutoff) {
            Ok(true) => match std::fs::remove_file(&path) {
                Ok(()) => {
                    log::info!("retention sweep deleted '{}'", path.display());
                    stats.deleted += 1;
                }
                Err(err) => {
                    // A concurrent sweep may have won the race; not fatal.
                    log::warn!("retention sweep unlink '{}' failed: {}", path.display(), err);
                    stats.failed += 1;
                }
            },
            Ok(false) => {}
            Err(err) => {
                log::warn!("retention sweep stat '{}' failed: {}", path.display(), err);
                stats.failed += 1;
            }
        }
    }
}

fn file_older_than(path: &Path, cutoff: SystemTime) -> Result<bool> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified < cutoff)
}

/// In-process daily sweeper thread.
pub struct RetentionSweeper {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const STOP_POLL: Duration = Duration::from_millis(200);

impl RetentionSweeper {
    pub fn spawn(
        evidence_dir: PathBuf,
        offline_alerts_dir: PathBuf,
        retention_days: u64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
        let join = std::thread::spawn(move || {
            // First pass at startup, then daily.
            sweep_once(&evidence_dir, &offline_alerts_dir, retention);
            let mut next = std::time::Instant::now() + SWEEP_INTERVAL;
            loop {
                while std::time::Instant::now() < next {
                    if stop_thread.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(STOP_POLL);
                }
                sweep_once(&evidence_dir, &offline_alerts_dir, retention);
                next += SWEEP_INTERVAL;
            }
        });
        Self {
            stop,
            join: Some(join),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
