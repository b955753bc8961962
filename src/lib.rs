//! Vigil analysis core.
//!
//! This crate implements the analysis pipeline for a multi-tenant video
//! surveillance analyzer:
//!
//! 1. **Buffering**: every source continuously appends JPEG frames into a
//!    bounded per-source ring (`ring`).
//! 2. **Screening**: a cheap vision model looks at the trailing short window
//!    on a timer (`analyzer`).
//! 3. **Confirmation**: screener positives are re-checked by a stronger model
//!    on the trailing long window; the confirmer can veto (`analyzer`).
//! 4. **Publication**: confirmed incidents are deduplicated, packaged into an
//!    evidence clip, uploaded, and alerted (`coordinator`, `clip`,
//!    `publisher`, `dispatcher`).
//!
//! The tenant gate (`tenant`) fronts everything: every API call resolves a
//! credential to exactly one active tenant, and all per-tenant state (rings,
//! dedup keys, usage, offline alerts) is namespaced by that tenant.
//!
//! # Module Structure
//!
//! - `ring`: per-source frame ring buffer
//! - `fingerprint`: perceptual dedup keys
//! - `dedup`: persistent duplicate suppression
//! - `vision`: screener/confirmer client
//! - `analyzer`: two-stage detection state machine
//! - `coordinator`: incident-to-evidence pipeline
//! - `clip`: evidence clip assembly (MJPEG-in-MP4)
//! - `publisher` / `dispatcher`: upload and alerting with retry + fallback
//! - `tenant`: authentication, isolation, quota accounting
//! - `api`: public HTTP surface
//! - `engine`: process-wide wiring

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod analyzer;
pub mod api;
pub mod clip;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod fingerprint;
pub mod publisher;
pub mod ring;
pub mod sweeper;
pub mod tenant;
pub mod transport;
pub mod vision;

pub use config::Config;
pub use dedup::DedupCache;
pub use engine::Engine;
pub use ring::FrameRing;
pub use vision::{AnalysisContext, VisionClient, VisionError, VisionRole};

// -------------------- Frames --------------------

/// One captured still image from a source.
///
/// Frames are immutable once appended; the ring and every snapshot share them
/// via `Arc` so that an analyzer carrying a detection window never copies
/// payload bytes and never blocks ingest.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonically increasing per-source sequence number.
    pub seq: u64,
    /// Capture timestamp, seconds since the UNIX epoch.
    pub captured_at: f64,
    /// Self-contained JPEG payload.
    pub jpeg: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u64, captured_at: f64, jpeg: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            seq,
            captured_at,
            jpeg,
        })
    }
}

// -------------------- Verdicts --------------------

/// Position of a representative frame within the analyzed window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramePosition {
    Start,
    Middle,
    End,
}

impl std::fmt::Display for FramePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Middle => write!(f, "middle"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Per-frame detection outcome from the confirmer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameVerdict {
    pub position: FramePosition,
    pub incident: bool,
    #[serde(default)]
    pub narrative: String,
}

/// Structured result of one vision call.
///
/// `incident` is the only field decisions are made on. `confidence` is
/// advisory and `narrative` is opaque payload for humans; neither is ever
/// inspected for control flow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnalysisVerdict {
    pub incident: bool,
    #[serde(default)]
    pub incident_kind: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub narrative: String,
    /// One entry per input frame. Populated by the confirmer role; screener
    /// verdicts usually leave it empty.
    #[serde(default)]
    pub per_frame: Vec<FrameVerdict>,
}

impl AnalysisVerdict {
    /// Count of representative frames the model flagged.
    pub fn incident_frame_count(&self) -> usize {
        self.per_frame.iter().filter(|f| f.incident).count()
    }
}

// -------------------- Incidents --------------------

/// Screener-positive detection, snapshotted at detection time.
///
/// The captured window is carried forward so downstream stages see the exact
/// frames the screener saw, not whatever the ring contains later. The
/// coordinator never reaches back into the ring.
#[derive(Clone, Debug)]
pub struct IncidentCandidate {
    pub tenant_id: i64,
    pub source_id: String,
    pub source_name: String,
    /// Detection timestamp, seconds since the UNIX epoch.
    pub detected_at: f64,
    pub screener_verdict: AnalysisVerdict,
    /// Long-window snapshot taken at the screening instant.
    pub window: Vec<Arc<Frame>>,
}

impl IncidentCandidate {
    /// Consume the candidate into a ConfirmedIncident. Candidates exist only
    /// between a screener positive and the confirmation decision; vetoed
    /// candidates are simply dropped.
    pub fn confirm(
        self,
        confirmer_verdict: Option<AnalysisVerdict>,
        confirmer_source: ConfirmerSource,
    ) -> ConfirmedIncident {
        ConfirmedIncident {
            tenant_id: self.tenant_id,
            source_id: self.source_id,
            source_name: self.source_name,
            detected_at: self.detected_at,
            screener_verdict: self.screener_verdict,
            confirmer_verdict,
            confirmer_source,
            window: self.window,
        }
    }
}

/// Where the confirmation decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmerSource {
    /// The confirmer ran and agreed on at least the configured threshold.
    Confirmer,
    /// The confirmer was unreachable after a screener positive; the incident
    /// is emitted on the screener's word alone so dedup and alerting still
    /// run during provider outages.
    FallbackScreenerOnly,
    /// A client performed its own detection and submitted the alert
    /// preformed; no vision call of ours stands behind it.
    ClientSubmitted,
}

impl std::fmt::Display for ConfirmerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmer => write!(f, "confirmer"),
            Self::FallbackScreenerOnly => write!(f, "fallback-screener-only"),
            Self::ClientSubmitted => write!(f, "client-submitted"),
        }
    }
}

/// A candidate the confirmer agreed with (or fell through on), ready for the
/// coordinator. Consumed exactly once.
#[derive(Clone, Debug)]
pub struct ConfirmedIncident {
    pub tenant_id: i64,
    pub source_id: String,
    pub source_name: String,
    pub detected_at: f64,
    pub screener_verdict: AnalysisVerdict,
    pub confirmer_verdict: Option<AnalysisVerdict>,
    pub confirmer_source: ConfirmerSource,
    pub window: Vec<Arc<Frame>>,
}

impl ConfirmedIncident {
    /// The incident kind to report: the confirmer's if present, else the
    /// screener's.
    pub fn incident_kind(&self) -> &str {
        match &self.confirmer_verdict {
            Some(v) if !v.incident_kind.is_empty() => &v.incident_kind,
            _ => &self.screener_verdict.incident_kind,
        }
    }

    /// Middle frame of the captured window (fingerprint representative).
    pub fn middle_frame(&self) -> Option<&Arc<Frame>> {
        if self.window.is_empty() {
            return None;
        }
        self.window.get(self.window.len() / 2)
    }
}

// -------------------- Time helpers --------------------

/// Seconds since the UNIX epoch, as f64 (sub-second precision).
pub fn now_epoch_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// RFC 3339 / ISO-8601 UTC timestamp for API payloads and spool filenames.
pub fn iso_timestamp(epoch_s: f64) -> String {
    let secs = epoch_s.floor() as i64;
    let nanos = ((epoch_s - secs as f64) * 1e9) as u32;
    match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, nanos) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => String::from("1970-01-01T00:00:00Z"),
    }
}

/// ISO timestamp safe for filenames (no colons).
pub fn iso_timestamp_for_filename(epoch_s: f64) -> String {
    iso_timestamp(epoch_s).replace(':', "-")
}
