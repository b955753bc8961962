//! Incident-to-evidence pipeline.
//!
//! Consumes confirmed incidents exactly once, in arrival order, on a single
//! consumer thread:
//!
//! 1. fingerprint the middle frame of the captured window,
//! 2. consult the dedup cache (suppressed incidents stop here),
//! 3. assemble the evidence clip and publish it,
//! 4. build and dispatch the alert,
//! 5. record the dedup key only after a successful dispatch, so a scene
//!    whose alert keeps failing is retried by the next detection instead of
//!    being silenced.
//!
//! The coordinator never calls back into the analyzer or the rings: the
//! incident carries its own frames.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clip;
use crate::dedup::{tenant_key, DedupCache};
use crate::dispatcher::{AlertDispatcher, AlertMessage, DispatchResult};
use crate::fingerprint::{self, key_hex};
use crate::publisher::{EvidencePublisher, PublishedEvidence, StorageLocation};
use crate::tenant::TenantStore;
use crate::{iso_timestamp, ConfirmedIncident};

/// Everything the coordinator did (or decided not to do) for one incident.
#[derive(Debug)]
pub enum IncidentOutcome {
    /// Same scene seen within the cooldown; nothing touched downstream.
    Suppressed {
        key: String,
        seconds_since_last: f64,
    },
    /// The pipeline ran to the dispatcher.
    Processed {
        delivered: bool,
        spooled: bool,
        recipient: Option<String>,
        evidence: Option<PublishedEvidence>,
    },
    /// The incident could not be taken anywhere (no addressee).
    Dropped { reason: String },
}

pub struct IncidentCoordinator {
    dedup: Arc<DedupCache>,
    publisher: Arc<EvidencePublisher>,
    dispatcher: Arc<AlertDispatcher>,
    tenants: Arc<TenantStore>,
    cooldown: Duration,
    target_fps: u32,
    max_clip_bytes: usize,
}

impl IncidentCoordinator {
    pub fn new(
        dedup: Arc<DedupCache>,
        publisher: Arc<EvidencePublisher>,
        dispatcher: Arc<AlertDispatcher>,
        tenants: Arc<TenantStore>,
        cooldown: Duration,
        target_fps: u32,
        max_clip_bytes: usize,
    ) -> Self {
        Self {
            dedup,
            publisher,
            dispatcher,
            tenants,
            cooldown,
            target_fps,
            max_clip_bytes,
        }
    }

    /// Consume the incident channel until every sender is gone.
    pub fn spawn(self: Arc<Self>, incidents: Receiver<ConfirmedIncident>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            log::info!("incident coordinator started");
            for incident in incidents.iter() {
                self.process(&incident);
            }
            log::info!("incident coordinator stopped (channel closed)");
        })
    }

    /// Run one incident through dedup, evidence, and alerting.
    pub fn process(&self, incident: &ConfirmedIncident) -> IncidentOutcome {
        let kind = incident.incident_kind().to_string();

        // Fingerprint the middle frame; an undecodable frame costs us dedup
        // for this incident, not the alert.
        let key = incident.middle_frame().and_then(|frame| {
            match fingerprint::fingerprint(&frame.jpeg) {
                Ok(raw) => Some(tenant_key(incident.tenant_id, &key_hex(&raw))),
                Err(err) => {
                    log::warn!(
                        "fingerprint failed source={} seq={}: {:#}",
                        incident.source_id,
                        frame.seq,
                        err
                    );
                    None
                }
            }
        });

        if let Some(key) = &key {
            let (duplicate, since) = self.dedup.is_duplicate(key, self.cooldown);
            if duplicate {
                let seconds_since_last = since.unwrap_or(0.0);
                log::info!(
                    "suppressed seconds_since_last={:.1} key={} source={}",
                    seconds_since_last,
                    key,
                    incident.source_id
                );
                return IncidentOutcome::Suppressed {
                    key: key.clone(),
                    seconds_since_last,
                };
            }
        }

        let evidence = self.publish_evidence(incident, &kind);

        let tenant = match self.tenants.get_tenant(incident.tenant_id) {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                log::error!("incident for unknown tenant {}", incident.tenant_id);
                return IncidentOutcome::Dropped {
                    reason: format!("unknown tenant {}", incident.tenant_id),
                };
            }
            Err(err) => {
                log::error!("tenant lookup failed: {:#}", err);
                return IncidentOutcome::Dropped {
                    reason: "tenant store unavailable".to_string(),
                };
            }
        };

        let alert = build_alert(incident, &tenant.name, tenant.contact_email.clone(), &kind, evidence.as_ref());

        match self.dispatcher.dispatch(&alert) {
            Ok(DispatchResult::Delivered { recipient, .. }) => {
                // Recording after dispatch keeps failing scenes re-alertable.
                if let Some(key) = &key {
                    self.dedup.record(key, &kind);
                }
                IncidentOutcome::Processed {
                    delivered: true,
                    spooled: false,
                    recipient: Some(recipient),
                    evidence,
                }
            }
            Ok(DispatchResult::Spooled { recipient, .. }) => IncidentOutcome::Processed {
                delivered: false,
                spooled: true,
                recipient: Some(recipient),
                evidence,
            },
            Ok(DispatchResult::NoRecipient) => IncidentOutcome::Dropped {
                reason: "no contact address configured".to_string(),
            },
            Err(err) => {
                log::error!("alert dispatch failed internally: {:#}", err);
                IncidentOutcome::Processed {
                    delivered: false,
                    spooled: false,
                    recipient: None,
                    evidence,
                }
            }
        }
    }

    fn publish_evidence(
        &self,
        incident: &ConfirmedIncident,
        kind: &str,
    ) -> Option<PublishedEvidence> {
        if incident.window.is_empty() {
            log::warn!(
                "incident without captured frames source={}, alerting without evidence",
                incident.source_id
            );
            return None;
        }
        let clip = match clip::assemble(&incident.window, self.target_fps, self.max_clip_bytes) {
            Ok(clip) => clip,
            Err(err) => {
                log::error!(
                    "clip assembly failed source={}: {:#}, alerting without evidence",
                    incident.source_id,
                    err
                );
                return None;
            }
        };
        match self
            .publisher
            .publish(&clip, incident.tenant_id, &incident.source_id, kind)
        {
            Ok(evidence) => Some(evidence),
            Err(err) => {
                log::error!(
                    "evidence publication failed source={}: {:#}, alerting without evidence",
                    incident.source_id,
                    err
                );
                None
            }
        }
    }
}

/// Render the human-facing alert: tenant display name, timestamp, kind, the
/// screener narrative, the confirmer narrative when present, and the clip
/// URL with its expiry.
fn build_alert(
    incident: &ConfirmedIncident,
    tenant_name: &str,
    recipient: Option<String>,
    kind: &str,
    evidence: Option<&PublishedEvidence>,
) -> AlertMessage {
    let mut body = String::new();
    body.push_str(&format!("Security incident confirmed for {}\n\n", tenant_name));
    body.push_str(&format!("Time: {}\n", iso_timestamp(incident.detected_at)));
    body.push_str(&format!(
        "Source: {} ({})\n",
        incident.source_name, incident.source_id
    ));
    body.push_str(&format!("Incident kind: {}\n", kind));
    body.push_str(&format!("Confirmation: {}\n", incident.confirmer_source));
    body.push_str(&format!(
        "\nScreener assessment:\n{}\n",
        incident.screener_verdict.narrative
    ));
    if let Some(confirmer) = &incident.confirmer_verdict {
        body.push_str(&format!("\nConfirmer assessment:\n{}\n", confirmer.narrative));
    }
    match evidence {
        Some(evidence) => {
            body.push_str(&format!(
                "\nEvidence clip: {}\nClip expires: {}\n",
                evidence.url, evidence.expires_at_iso
            ));
            if evidence.storage == StorageLocation::Local {
                body.push_str("Note: clip is stored locally on the analyzer host.\n");
            }
        }
        None => body.push_str("\nEvidence clip unavailable for this incident.\n"),
    }

    AlertMessage {
        tenant_id: incident.tenant_id,
        recipient,
        subject: format!("[vigil] {} at {}", kind, incident.source_name),
        body,
        incident_kind: kind.to_string(),
        narrative: incident.screener_verdict.narrative.clone(),
        evidence_url: evidence.map(|e| e.url.clone()),
    }
}
