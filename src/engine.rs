//! Process-wide wiring.
//!
//! The engine owns everything the API surface needs: the tenant store, the
//! per-source frame rings and their analyzer threads, the incident channel
//! and its coordinator, the dedup cache, and the retention sweeper. It is
//! built once at startup and passed by reference; nothing in here is a
//! global.
//!
//! Source ownership: source ids are claimed process-wide by the first tenant
//! that ingests under them. Any later touch from another tenant is a
//! `ForeignSource` error, which the API maps to 403: one tenant can never
//! read, append to, or analyze another tenant's feed.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::analyzer::{analyze_source_once, SourceAnalyzer, SourceContext, StageOutcome};
use crate::config::Config;
use crate::coordinator::{IncidentCoordinator, IncidentOutcome};
use crate::dedup::DedupCache;
use crate::dispatcher::{AlertDispatcher, MailTransport, SmtpTransport};
use crate::publisher::{EvidencePublisher, HttpObjectStore, ObjectStore};
use crate::ring::FrameRing;
use crate::sweeper::RetentionSweeper;
use crate::tenant::TenantStore;
use crate::transport::RetryPolicy;
use crate::vision::{HttpVisionClient, VisionClient};
use crate::{now_epoch_s, AnalysisVerdict, ConfirmedIncident, ConfirmerSource};

const INCIDENT_CHANNEL_CAPACITY: usize = 64;
const MAX_SOURCE_ID_LEN: usize = 64;

// -------------------- Errors --------------------

/// Gate-level failures the API maps onto status codes.
#[derive(Debug)]
pub enum EngineError {
    /// The source id is claimed by another tenant.
    ForeignSource,
    /// Malformed caller input.
    InvalidInput(String),
    Internal(anyhow::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForeignSource => write!(f, "source belongs to another tenant"),
            Self::InvalidInput(msg) => write!(f, "{}", msg),
            Self::Internal(err) => write!(f, "{:#}", err),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

/// Source ids are short local identifiers, not paths or URLs.
fn validate_source_id(source_id: &str) -> Result<(), EngineError> {
    if source_id.is_empty() || source_id.len() > MAX_SOURCE_ID_LEN {
        return Err(EngineError::InvalidInput(format!(
            "source_id must be 1..={} characters",
            MAX_SOURCE_ID_LEN
        )));
    }
    if !source_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(EngineError::InvalidInput(
            "source_id may contain only [A-Za-z0-9._-]".to_string(),
        ));
    }
    Ok(())
}

// -------------------- Dependency injection --------------------

/// External collaborators, swappable for tests.
pub struct EngineDeps {
    pub vision: Arc<dyn VisionClient>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub mail: Option<Arc<dyn MailTransport>>,
    pub upload_policy: RetryPolicy,
    pub dispatch_policy: RetryPolicy,
}

impl EngineDeps {
    /// Production wiring from configuration.
    pub fn from_config(cfg: &Config) -> Self {
        let object_store: Option<Arc<dyn ObjectStore>> =
            cfg.evidence.store_base_url.as_ref().map(|base| {
                Arc::new(HttpObjectStore::new(
                    base.clone(),
                    cfg.evidence.store_credential.clone(),
                    cfg.evidence.upload_timeout,
                )) as Arc<dyn ObjectStore>
            });
        Self {
            vision: Arc::new(HttpVisionClient::new(cfg.vision.clone())),
            object_store,
            mail: None,
            upload_policy: RetryPolicy::with_retries(cfg.evidence.upload_retries),
            dispatch_policy: RetryPolicy::with_retries(cfg.smtp.dispatch_retries),
        }
    }
}

// -------------------- Sources --------------------

struct SourceSlot {
    tenant_id: i64,
    source_name: String,
    ring: Arc<RwLock<FrameRing>>,
    analyzer: SourceAnalyzer,
}

/// Per-source view for the buffer status endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub source_name: String,
    pub frames: usize,
    pub covered_seconds: f64,
}

// -------------------- Engine --------------------

pub struct Engine {
    cfg: Config,
    tenants: Arc<TenantStore>,
    dedup: Arc<DedupCache>,
    vision: Arc<dyn VisionClient>,
    coordinator: Arc<IncidentCoordinator>,
    sources: RwLock<HashMap<String, SourceSlot>>,
    incidents_tx: Mutex<Option<SyncSender<ConfirmedIncident>>>,
    coordinator_join: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<RetentionSweeper>>,
}

impl Engine {
    pub fn new(cfg: Config, deps: EngineDeps) -> Result<Arc<Self>> {
        let tenants = Arc::new(TenantStore::open(&cfg.db_path).context("open tenant store")?);

        let dedup = Arc::new(DedupCache::open(&cfg.dedup_cache_path));
        dedup.prune(cfg.dedup_ttl);

        let publisher = Arc::new(EvidencePublisher::new(
            cfg.evidence.clone(),
            deps.object_store,
            deps.upload_policy,
            cfg.retention_days,
        ));

        let mail: Arc<dyn MailTransport> = deps
            .mail
            .unwrap_or_else(|| Arc::new(SmtpTransport::new(cfg.smtp.clone())));
        let dispatcher = Arc::new(AlertDispatcher::new(
            mail,
            deps.dispatch_policy,
            cfg.offline_alerts_dir.clone(),
        ));

        let coordinator = Arc::new(IncidentCoordinator::new(
            dedup.clone(),
            publisher,
            dispatcher,
            tenants.clone(),
            cfg.dedup_cooldown,
            cfg.pipeline.target_fps,
            (cfg.evidence.max_clip_size_mb as usize).saturating_mul(1024 * 1024),
        ));

        let (tx, rx): (SyncSender<ConfirmedIncident>, Receiver<ConfirmedIncident>) =
            std::sync::mpsc::sync_channel(INCIDENT_CHANNEL_CAPACITY);
        let coordinator_join = coordinator.clone().spawn(rx);

        let sweeper = RetentionSweeper::spawn(
            cfg.evidence.local_dir.clone(),
            cfg.offline_alerts_dir.clone(),
            cfg.retention_days,
        );

        Ok(Arc::new(Self {
            cfg,
            tenants,
            dedup,
            vision: deps.vision,
            coordinator,
            sources: RwLock::new(HashMap::new()),
            incidents_tx: Mutex::new(Some(tx)),
            coordinator_join: Mutex::new(Some(coordinator_join)),
            sweeper: Mutex::new(Some(sweeper)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn tenants(&self) -> &Arc<TenantStore> {
        &self.tenants
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    // -------------------- Ingest --------------------

    /// Append a frame to `(tenant, source)`, claiming the source and
    /// spawning its analyzer on first use. Returns the ring depth.
    pub fn ingest_frame(
        &self,
        tenant_id: i64,
        source_id: &str,
        source_name: &str,
        jpeg: Vec<u8>,
    ) -> Result<usize, EngineError> {
        validate_source_id(source_id)?;
        if jpeg.is_empty() {
            return Err(EngineError::InvalidInput("frame_data is empty".to_string()));
        }

        // Fast path: the source already exists.
        {
            let sources = self.sources.read().expect("sources registry poisoned");
            if let Some(slot) = sources.get(source_id) {
                if slot.tenant_id != tenant_id {
                    return Err(EngineError::ForeignSource);
                }
                let mut ring = slot.ring.write().expect("frame ring poisoned");
                ring.append(jpeg);
                return Ok(ring.len());
            }
        }

        let mut sources = self.sources.write().expect("sources registry poisoned");
        // Lost the race? Re-check under the write lock.
        if let Some(slot) = sources.get(source_id) {
            if slot.tenant_id != tenant_id {
                return Err(EngineError::ForeignSource);
            }
            let mut ring = slot.ring.write().expect("frame ring poisoned");
            ring.append(jpeg);
            return Ok(ring.len());
        }

        let ring = Arc::new(RwLock::new(FrameRing::new(self.cfg.pipeline.ring_capacity())));
        let len = {
            let mut guard = ring.write().expect("frame ring poisoned");
            guard.append(jpeg);
            guard.len()
        };

        let tx = self
            .incidents_tx
            .lock()
            .expect("incident sender poisoned")
            .clone()
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("engine is shutting down")))?;
        let ctx = SourceContext {
            tenant_id,
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
        };
        let analyzer = SourceAnalyzer::spawn(
            ctx,
            ring.clone(),
            self.vision.clone(),
            self.cfg.pipeline.clone(),
            tx,
        );
        log::info!(
            "source registered tenant={} source={} name={:?}",
            tenant_id,
            source_id,
            source_name
        );
        sources.insert(
            source_id.to_string(),
            SourceSlot {
                tenant_id,
                source_name: source_name.to_string(),
                ring,
                analyzer,
            },
        );
        Ok(len)
    }

    /// Ring depth and coverage for every source the tenant owns.
    pub fn buffer_status(&self, tenant_id: i64) -> Vec<SourceStatus> {
        let sources = self.sources.read().expect("sources registry poisoned");
        let mut out: Vec<SourceStatus> = sources
            .iter()
            .filter(|(_, slot)| slot.tenant_id == tenant_id)
            .map(|(id, slot)| {
                let ring = slot.ring.read().expect("frame ring poisoned");
                SourceStatus {
                    source_id: id.clone(),
                    source_name: slot.source_name.clone(),
                    frames: ring.len(),
                    covered_seconds: ring.covered_seconds(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }

    // -------------------- On-demand analysis --------------------

    /// Run one screen-and-confirm cycle for each named source, synchronously.
    /// Confirmed incidents also enter the normal pipeline. Returns
    /// `(source_id, source_name, outcome)` per source.
    pub fn analyze_on_demand(
        &self,
        tenant_id: i64,
        source_ids: &[String],
    ) -> Result<Vec<(String, String, StageOutcome)>, EngineError> {
        if source_ids.is_empty() {
            return Err(EngineError::InvalidInput("source_ids is empty".to_string()));
        }

        // Resolve rings up front so a foreign id fails the whole request
        // before any vision spend.
        let mut targets = Vec::with_capacity(source_ids.len());
        {
            let sources = self.sources.read().expect("sources registry poisoned");
            for source_id in source_ids {
                validate_source_id(source_id)?;
                match sources.get(source_id) {
                    Some(slot) if slot.tenant_id == tenant_id => targets.push((
                        source_id.clone(),
                        slot.source_name.clone(),
                        slot.ring.clone(),
                    )),
                    Some(_) => return Err(EngineError::ForeignSource),
                    None => {
                        return Err(EngineError::InvalidInput(format!(
                            "unknown source '{}'",
                            source_id
                        )))
                    }
                }
            }
        }

        let mut reports = Vec::with_capacity(targets.len());
        for (source_id, source_name, ring) in targets {
            let ctx = SourceContext {
                tenant_id,
                source_id: source_id.clone(),
                source_name: source_name.clone(),
            };
            let outcome =
                analyze_source_once(&ctx, &ring, self.vision.as_ref(), &self.cfg.pipeline);
            if let StageOutcome::Confirmed(incident) = &outcome {
                self.forward_incident((**incident).clone());
            }
            reports.push((source_id, source_name, outcome));
        }
        Ok(reports)
    }

    fn forward_incident(&self, incident: ConfirmedIncident) {
        let sender = self
            .incidents_tx
            .lock()
            .expect("incident sender poisoned")
            .clone();
        if let Some(tx) = sender {
            match tx.try_send(incident) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => log::warn!(
                    "incident channel full, dropping on-demand incident source={}",
                    dropped.source_id
                ),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    // -------------------- Client-submitted alerts --------------------

    /// Process a preformed alert from a client that runs its own detection.
    /// Still subject to dedup, evidence publication, and dispatch. The
    /// evidence window is whatever the tenant's ring currently holds for the
    /// named source (capped to `frame_count` newest frames when given).
    pub fn submit_alert(
        &self,
        tenant_id: i64,
        source_id: &str,
        incident_kind: &str,
        narrative: &str,
        frame_count: usize,
    ) -> Result<IncidentOutcome, EngineError> {
        validate_source_id(source_id)?;
        let (source_name, window) = {
            let sources = self.sources.read().expect("sources registry poisoned");
            match sources.get(source_id) {
                Some(slot) if slot.tenant_id == tenant_id => {
                    let ring = slot.ring.read().expect("frame ring poisoned");
                    let mut window =
                        ring.window_ending_at(self.cfg.pipeline.long_window_s as f64, now_epoch_s());
                    if frame_count > 0 && window.len() > frame_count {
                        window.drain(..window.len() - frame_count);
                    }
                    (slot.source_name.clone(), window)
                }
                Some(_) => return Err(EngineError::ForeignSource),
                // A client doing its own detection may never have buffered
                // frames with us; alert without evidence.
                None => (source_id.to_string(), Vec::new()),
            }
        };

        let incident = ConfirmedIncident {
            tenant_id,
            source_id: source_id.to_string(),
            source_name,
            detected_at: now_epoch_s(),
            screener_verdict: AnalysisVerdict {
                incident: true,
                incident_kind: incident_kind.to_string(),
                confidence: 0.0,
                narrative: narrative.to_string(),
                per_frame: vec![],
            },
            confirmer_verdict: None,
            confirmer_source: ConfirmerSource::ClientSubmitted,
            window,
        };
        Ok(self.coordinator.process(&incident))
    }

    // -------------------- Shutdown --------------------

    /// Drain the pipeline: stop analyzers (bounded grace per source), close
    /// the incident channel, wait for the coordinator, flush the dedup
    /// cache, stop the sweeper. Frames are ephemeral and simply dropped.
    pub fn shutdown(&self) {
        log::info!("engine shutdown requested");

        let slots: Vec<SourceSlot> = {
            let mut sources = self.sources.write().expect("sources registry poisoned");
            sources.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.analyzer.request_stop();
        }
        for mut slot in slots {
            if !slot.analyzer.join_with_grace(self.cfg.shutdown_grace) {
                log::warn!("analyzer for a source did not stop within grace, abandoning");
            }
        }

        // Closing the last sender ends the coordinator loop.
        self.incidents_tx
            .lock()
            .expect("incident sender poisoned")
            .take();
        if let Some(join) = self
            .coordinator_join
            .lock()
            .expect("coordinator handle poisoned")
            .take()
        {
            let _ = join.join();
        }

        if let Some(sweeper) = self.sweeper.lock().expect("sweeper handle poisoned").take() {
            sweeper.stop();
        }

        self.dedup.close();
        log::info!("engine shutdown complete");
    }
}
