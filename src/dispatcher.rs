//! Alert delivery with offline spooling.
//!
//! The dispatcher owns the human-facing side of an incident: it retries SMTP
//! delivery under the shared backoff policy and, when the relay stays down,
//! serializes the alert into the offline spool directory. The spool file is
//! the durable record; no further retries are scheduled here, operators
//! replay the spool out-of-band.
//!
//! A tenant without a contact address is a distinct, typed outcome
//! (`NoRecipient`): there is no addressee to spool for, so the coordinator
//! logs and drops instead.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SmtpConfig;
use crate::transport::{smtp, RetryPolicy};
use crate::{iso_timestamp, iso_timestamp_for_filename, now_epoch_s};

/// Fully rendered alert, ready for transport.
#[derive(Clone, Debug)]
pub struct AlertMessage {
    pub tenant_id: i64,
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
    pub incident_kind: String,
    pub narrative: String,
    pub evidence_url: Option<String>,
}

/// What happened to one alert. Degraded paths are explicit, never silent.
#[derive(Clone, Debug)]
pub enum DispatchResult {
    Delivered {
        recipient: String,
        attempts: u32,
    },
    /// Delivery exhausted its retries; the alert now lives in the spool.
    Spooled {
        recipient: String,
        spool_path: PathBuf,
        reason: String,
        attempts: u32,
    },
    /// The tenant has no contact address configured.
    NoRecipient,
}

impl DispatchResult {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// The mail transport, as the dispatcher needs it. Production is SMTP;
/// tests count calls and script failures.
pub trait MailTransport: Send + Sync {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

pub struct SmtpTransport {
    cfg: SmtpConfig,
}

impl SmtpTransport {
    pub fn new(cfg: SmtpConfig) -> Self {
        Self { cfg }
    }
}

impl MailTransport for SmtpTransport {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        smtp::send_mail(&self.cfg, recipient, subject, body)
    }
}

pub struct AlertDispatcher {
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    spool_dir: PathBuf,
}

impl AlertDispatcher {
    pub fn new(transport: Arc<dyn MailTransport>, policy: RetryPolicy, spool_dir: PathBuf) -> Self {
        Self {
            transport,
            policy,
            spool_dir,
        }
    }

    /// Deliver or spool. The spool file exists before this returns, so a
    /// crash immediately after cannot lose the alert.
    pub fn dispatch(&self, alert: &AlertMessage) -> Result<DispatchResult> {
        let Some(recipient) = alert.recipient.as_deref() else {
            log::warn!(
                "alert dropped tenant={} kind={}: no contact address configured",
                alert.tenant_id,
                alert.incident_kind
            );
            return Ok(DispatchResult::NoRecipient);
        };

        let mut attempts = 0;
        let failure = loop {
            attempts += 1;
            match self.transport.send(recipient, &alert.subject, &alert.body) {
                Ok(()) => {
                    log::info!(
                        "alert delivered tenant={} recipient={} attempts={}",
                        alert.tenant_id,
                        recipient,
                        attempts
                    );
                    return Ok(DispatchResult::Delivered {
                        recipient: recipient.to_string(),
                        attempts,
                    });
                }
                Err(err) if attempts < self.policy.max_attempts() => {
                    let delay = self.policy.delay_before_retry(attempts);
                    log::warn!(
                        "alert dispatch attempt {}/{} failed, retrying in {:.0?}: {:#}",
                        attempts,
                        self.policy.max_attempts(),
                        delay,
                        err
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => break err,
            }
        };

        let reason = format!("{:#}", failure);
        let spool_path = self.spool(alert, recipient, &reason)?;
        log::warn!(
            "alert spooled tenant={} path={} after {} attempts: {}",
            alert.tenant_id,
            spool_path.display(),
            attempts,
            reason
        );
        Ok(DispatchResult::Spooled {
            recipient: recipient.to_string(),
            spool_path,
            reason,
            attempts,
        })
    }

    fn spool(&self, alert: &AlertMessage, recipient: &str, reason: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.spool_dir).with_context(|| {
            format!("create offline alerts dir '{}'", self.spool_dir.display())
        })?;
        let now = now_epoch_s();
        let filename = format!(
            "alert-{}-t{}-{}.txt",
            iso_timestamp_for_filename(now),
            alert.tenant_id,
            hex::encode(rand::random::<[u8; 4]>())
        );
        let path = self.spool_dir.join(filename);

        let mut contents = String::new();
        contents.push_str(&format!("spooled_at: {}\n", iso_timestamp(now)));
        contents.push_str(&format!("tenant_id: {}\n", alert.tenant_id));
        contents.push_str(&format!("recipient: {}\n", recipient));
        contents.push_str(&format!("incident_kind: {}\n", alert.incident_kind));
        contents.push_str(&format!(
            "evidence_url: {}\n",
            alert.evidence_url.as_deref().unwrap_or("(none)")
        ));
        contents.push_str(&format!("failure_reason: {}\n", reason));
        contents.push_str(&format!("narrative: {}\n", alert.narrative));
        contents.push_str(&format!("subject: {}\n", alert.subject));
        contents.push_str("\n");
        contents.push_str(&alert.body);
        contents.push('\n');

        std::fs::write(&path, contents)
            .with_context(|| format!("write offline alert '{}'", path.display()))?;
        Ok(path)
    }
}
