//! Vision model client.
//!
//! Two named model handles (screener, confirmer) behind one uniform call:
//! frames in, structured verdict out. The pipeline only ever branches on
//! `role`; concrete model identifiers live in configuration and are carried
//! opaquely to the wire.
//!
//! Error contract: this client never retries. Transient failures (timeouts,
//! rate limits, 5xx, transport) and permanent ones (other 4xx, malformed
//! bodies) are distinguished so the analyzer can pick its own policy per
//! role.

use serde::Deserialize;
use std::sync::Arc;

use base64::Engine as _;

use crate::config::VisionConfig;
use crate::{AnalysisVerdict, Frame, FramePosition, FrameVerdict};

// -------------------- Roles --------------------

/// Which stage of the pipeline is asking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisionRole {
    /// Low-latency, low-cost, high-recall first pass.
    Screener,
    /// Higher-cost second pass, run only on screener positives; may veto.
    Confirmer,
}

impl std::fmt::Display for VisionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Screener => write!(f, "screener"),
            Self::Confirmer => write!(f, "confirmer"),
        }
    }
}

// -------------------- Errors --------------------

/// A vision call failure, classified for the caller's retry/fallback choice.
#[derive(Clone, Debug)]
pub struct VisionError {
    /// Permanent errors (auth, bad request, malformed response) must not be
    /// retried; transient ones may be.
    pub permanent: bool,
    pub reason: String,
}

impl VisionError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            permanent: false,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            permanent: true,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for VisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vision {} error: {}",
            if self.permanent { "permanent" } else { "transient" },
            self.reason
        )
    }
}

impl std::error::Error for VisionError {}

/// HTTP statuses worth retrying: timeouts, throttling, server-side failures.
pub(crate) fn status_is_transient(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

// -------------------- Client trait --------------------

/// Free-text context passed through to the model prompt. Opaque to the
/// pipeline; never inspected for control flow.
#[derive(Clone, Debug, Default)]
pub struct AnalysisContext {
    pub source_name: String,
    /// Optional carry-over, e.g. the screener narrative handed to the
    /// confirmer.
    pub detail: Option<String>,
}

/// Uniform "analyze frames, get a verdict" contract.
///
/// Tests substitute fakes; production wires [`HttpVisionClient`]. Frames are
/// JPEG-encoded and the total payload must respect the provider limit; the
/// pipeline keeps representative-frame counts small (1 for screening, 3 for
/// confirmation) so this never binds in practice.
pub trait VisionClient: Send + Sync {
    fn analyze(
        &self,
        role: VisionRole,
        frames: &[Arc<Frame>],
        context: &AnalysisContext,
    ) -> Result<AnalysisVerdict, VisionError>;
}

// -------------------- HTTP implementation --------------------

const SCREENER_PROMPT: &str = "You are screening one frame of security camera footage. \
Report whether a security incident (intrusion, theft, vandalism, tampering, violence) \
is visible. Respond with JSON: {\"incident\": bool, \"incident_kind\": string, \
\"confidence\": number, \"narrative\": string}.";

const CONFIRMER_PROMPT: &str = "You are confirming a suspected security incident across \
several frames sampled from the same camera over a few seconds. Judge each frame \
independently. Respond with JSON: {\"incident\": bool, \"incident_kind\": string, \
\"confidence\": number, \"narrative\": string, \"per_frame\": \
[{\"incident\": bool, \"narrative\": string}, ...]} with exactly one per_frame entry \
per input frame, in order.";

/// Verdict shape on the wire. Field absence is tolerated everywhere except
/// `incident`; the per-frame list is validated by the caller for the
/// confirmer role.
#[derive(Debug, Deserialize)]
struct WireVerdict {
    incident: bool,
    #[serde(default)]
    incident_kind: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    narrative: String,
    #[serde(default)]
    per_frame: Vec<WireFrameVerdict>,
}

#[derive(Debug, Deserialize)]
struct WireFrameVerdict {
    incident: bool,
    #[serde(default)]
    narrative: String,
}

/// Assign window positions to per-frame entries by index: first frame is
/// `start`, last is `end`, everything between is `middle`.
pub(crate) fn position_for_index(index: usize, total: usize) -> FramePosition {
    if index == 0 {
        FramePosition::Start
    } else if index + 1 == total {
        FramePosition::End
    } else {
        FramePosition::Middle
    }
}

fn verdict_from_wire(wire: WireVerdict, role: VisionRole, frame_count: usize) -> Result<AnalysisVerdict, VisionError> {
    if role == VisionRole::Confirmer && wire.per_frame.len() != frame_count {
        return Err(VisionError::permanent(format!(
            "confirmer returned {} per-frame entries for {} frames",
            wire.per_frame.len(),
            frame_count
        )));
    }
    let total = wire.per_frame.len();
    Ok(AnalysisVerdict {
        incident: wire.incident,
        incident_kind: wire.incident_kind,
        confidence: wire.confidence,
        narrative: wire.narrative,
        per_frame: wire
            .per_frame
            .into_iter()
            .enumerate()
            .map(|(i, f)| FrameVerdict {
                position: position_for_index(i, total),
                incident: f.incident,
                narrative: f.narrative,
            })
            .collect(),
    })
}

/// Vision provider client over HTTP.
///
/// One JSON POST per call: `{ model, prompt, frames: [base64 jpeg] }`.
pub struct HttpVisionClient {
    agent: ureq::Agent,
    cfg: VisionConfig,
}

impl HttpVisionClient {
    pub fn new(cfg: VisionConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(cfg.timeout)
            .build();
        Self { agent, cfg }
    }

    fn model_for(&self, role: VisionRole) -> &str {
        match role {
            VisionRole::Screener => &self.cfg.screener_model,
            VisionRole::Confirmer => &self.cfg.confirmer_model,
        }
    }
}

impl VisionClient for HttpVisionClient {
    fn analyze(
        &self,
        role: VisionRole,
        frames: &[Arc<Frame>],
        context: &AnalysisContext,
    ) -> Result<AnalysisVerdict, VisionError> {
        let url = self
            .cfg
            .api_url
            .as_deref()
            .ok_or_else(|| VisionError::permanent("VISION_API_URL not configured"))?;
        if frames.is_empty() {
            return Err(VisionError::permanent("no frames to analyze"));
        }

        let prompt_base = match role {
            VisionRole::Screener => SCREENER_PROMPT,
            VisionRole::Confirmer => CONFIRMER_PROMPT,
        };
        let mut prompt = format!("{} Camera: {}.", prompt_base, context.source_name);
        if let Some(detail) = &context.detail {
            prompt.push_str(" Context: ");
            prompt.push_str(detail);
        }

        let encoded: Vec<String> = frames
            .iter()
            .map(|f| base64::engine::general_purpose::STANDARD.encode(&f.jpeg))
            .collect();

        let body = serde_json::json!({
            "model": self.model_for(role),
            "prompt": prompt,
            "frames": encoded,
        });

        let mut request = self.agent.post(url);
        if let Some(key) = &self.cfg.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }

        let response = match request.send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let detail = response
                    .into_string()
                    .unwrap_or_else(|_| String::from("<unreadable body>"));
                let reason = format!("{} HTTP {}: {}", role, status, truncate(&detail, 200));
                return if status_is_transient(status) {
                    Err(VisionError::transient(reason))
                } else {
                    Err(VisionError::permanent(reason))
                };
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(VisionError::transient(format!("{} transport: {}", role, err)));
            }
        };

        let wire: WireVerdict = response
            .into_json()
            .map_err(|err| VisionError::permanent(format!("{} malformed verdict: {}", role, err)))?;
        verdict_from_wire(wire, role, frames.len())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
