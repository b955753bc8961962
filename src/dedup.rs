//! Persistent duplicate-incident suppression.
//!
//! Process-wide key -> last-seen store with a cooldown query, TTL pruning,
//! and a JSON file behind it so suppression survives restarts (the same
//! looped footage must not re-alert after a crash). Keys are namespaced
//! `"<tenant_id>:<hex>"` by the caller so tenants never suppress each other.
//!
//! Locking discipline: the map lives under a mutex, but no lock is ever held
//! across I/O. Mutations mark the cache dirty and wake a background flusher
//! that snapshots under the lock and writes outside it; flushes coalesce, at
//! most one is pending. A failed write degrades the cache to in-memory with
//! a warning, it never fails the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::now_epoch_s;

/// On-disk value: `{ "last_seen_at": epoch-seconds, "incident_kind": "..." }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupEntry {
    pub last_seen_at: f64,
    #[serde(default)]
    pub incident_kind: String,
}

struct CacheState {
    entries: Mutex<HashMap<String, DedupEntry>>,
    dirty: Mutex<bool>,
    wake: Condvar,
    stop: AtomicBool,
    path: Option<PathBuf>,
}

/// Key -> timestamp store with cooldown semantics and file persistence.
pub struct DedupCache {
    state: Arc<CacheState>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl DedupCache {
    /// Open a cache backed by `path`. A missing or corrupt file starts the
    /// cache empty with a warning; it is never fatal.
    pub fn open(path: &Path) -> Self {
        let entries = match load_entries(path) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "dedup cache '{}' unreadable, starting empty: {:#}",
                    path.display(),
                    err
                );
                HashMap::new()
            }
        };
        log::info!(
            "dedup cache loaded: {} entries from '{}'",
            entries.len(),
            path.display()
        );
        Self::with_entries(entries, Some(path.to_path_buf()))
    }

    /// In-memory cache with no persistence (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self::with_entries(HashMap::new(), None)
    }

    fn with_entries(entries: HashMap<String, DedupEntry>, path: Option<PathBuf>) -> Self {
        let state = Arc::new(CacheState {
            entries: Mutex::new(entries),
            dirty: Mutex::new(false),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            path,
        });

        let flusher = if state.path.is_some() {
            let state = state.clone();
            Some(std::thread::spawn(move || flusher_loop(&state)))
        } else {
            None
        };

        Self {
            state,
            flusher: Mutex::new(flusher),
        }
    }

    /// Is `key` inside its cooldown window? Returns the seconds since the key
    /// was last seen when an entry exists.
    pub fn is_duplicate(&self, key: &str, cooldown: Duration) -> (bool, Option<f64>) {
        self.is_duplicate_at(key, cooldown, now_epoch_s())
    }

    pub fn is_duplicate_at(&self, key: &str, cooldown: Duration, now: f64) -> (bool, Option<f64>) {
        let entries = self.state.entries.lock().expect("dedup map poisoned");
        match entries.get(key) {
            Some(entry) => {
                let elapsed = now - entry.last_seen_at;
                (elapsed < cooldown.as_secs_f64(), Some(elapsed))
            }
            None => (false, None),
        }
    }

    /// Record a sighting of `key` now and schedule persistence.
    pub fn record(&self, key: &str, incident_kind: &str) {
        self.record_at(key, incident_kind, now_epoch_s());
    }

    pub fn record_at(&self, key: &str, incident_kind: &str, at: f64) {
        {
            let mut entries = self.state.entries.lock().expect("dedup map poisoned");
            entries.insert(
                key.to_string(),
                DedupEntry {
                    last_seen_at: at,
                    incident_kind: incident_kind.to_string(),
                },
            );
        }
        self.mark_dirty();
    }

    /// Remove entries last seen more than `ttl` ago. Returns how many were
    /// dropped.
    pub fn prune(&self, ttl: Duration) -> usize {
        self.prune_at(ttl, now_epoch_s())
    }

    pub fn prune_at(&self, ttl: Duration, now: f64) -> usize {
        let removed = {
            let mut entries = self.state.entries.lock().expect("dedup map poisoned");
            let before = entries.len();
            entries.retain(|_, e| now - e.last_seen_at <= ttl.as_secs_f64());
            before - entries.len()
        };
        if removed > 0 {
            log::info!("dedup cache pruned {} expired entries", removed);
            self.mark_dirty();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.entries.lock().expect("dedup map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronous flush: snapshot under the lock, write outside it.
    pub fn flush_now(&self) -> Result<()> {
        flush_once(&self.state)
    }

    fn mark_dirty(&self) {
        let mut dirty = self.state.dirty.lock().expect("dedup dirty flag poisoned");
        *dirty = true;
        self.state.wake.notify_one();
    }

    /// Stop the flusher and write any pending state. Called by the engine on
    /// shutdown; Drop does the same for ad-hoc uses.
    pub fn close(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.wake.notify_one();
        if let Some(handle) = self.flusher.lock().expect("flusher handle poisoned").take() {
            let _ = handle.join();
        }
        if let Err(err) = self.flush_now() {
            log::warn!("dedup cache final flush failed: {:#}", err);
        }
    }
}

impl Drop for DedupCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn flusher_loop(state: &CacheState) {
    loop {
        {
            let mut dirty = state.dirty.lock().expect("dedup dirty flag poisoned");
            while !*dirty && !state.stop.load(Ordering::SeqCst) {
                let (guard, _) = state
                    .wake
                    .wait_timeout(dirty, Duration::from_secs(1))
                    .expect("dedup dirty flag poisoned");
                dirty = guard;
            }
            if !*dirty {
                // stop requested with nothing pending
                return;
            }
            *dirty = false;
        }
        if let Err(err) = flush_once(state) {
            log::warn!("dedup cache persist failed, keeping in-memory state: {:#}", err);
        }
        if state.stop.load(Ordering::SeqCst) {
            return;
        }
    }
}

fn flush_once(state: &CacheState) -> Result<()> {
    let Some(path) = &state.path else {
        return Ok(());
    };
    let snapshot = {
        let entries = state.entries.lock().expect("dedup map poisoned");
        entries.clone()
    };
    write_entries(path, &snapshot)
}

fn load_entries(path: &Path) -> Result<HashMap<String, DedupEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).context("read dedup cache"),
    };
    serde_json::from_slice(&bytes).context("parse dedup cache")
}

/// Temp-then-rename so a crash mid-write never leaves a truncated cache.
fn write_entries(path: &Path, entries: &HashMap<String, DedupEntry>) -> Result<()> {
    let json = serde_json::to_vec_pretty(entries).context("serialize dedup cache")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("write dedup cache temp '{}'", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename dedup cache into '{}'", path.display()))?;
    Ok(())
}

/// Namespace a fingerprint under its tenant so the shared cache never
/// collapses incidents across tenants.
pub fn tenant_key(tenant_id: i64, fingerprint_hex: &str) -> String {
    format!("{}:{}", tenant_id, fingerprint_hex)
}
