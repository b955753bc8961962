//! Evidence publication.
//!
//! Primary path: multipart upload to the object store, retried with
//! exponential backoff. Exhaustion (or a store that was never configured)
//! falls back to a content-addressed file in the local evidence directory
//! with a sidecar describing ownership and expiry. The fallback is not a
//! silent success: the returned record says `storage: Local` so callers can
//! surface the degraded mode, and the local expiry follows the retention
//! policy instead of the store's.
//!
//! Access tokens: `hex(SHA256(clip_id || expires_at_iso || secret))[..32]`.
//! The serving side recomputes from the same inputs, so the expiry string
//! must travel verbatim.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clip::AssembledClip;
use crate::config::EvidenceConfig;
use crate::transport::RetryPolicy;
use crate::{iso_timestamp, now_epoch_s};

// -------------------- Access tokens --------------------

/// First 16 bytes (hex) of `SHA256(clip_id || expires_at_iso || secret)`.
pub fn access_token(clip_id: &str, expires_at_iso: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(clip_id.as_bytes());
    hasher.update(expires_at_iso.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

// -------------------- Store contract --------------------

/// One upload attempt's failure, classified for the retry loop.
#[derive(Clone, Debug)]
pub struct UploadError {
    pub retryable: bool,
    pub reason: String,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "upload {} error: {}",
            if self.retryable { "retryable" } else { "permanent" },
            self.reason
        )
    }
}

impl std::error::Error for UploadError {}

/// What the store hands back on success.
#[derive(Clone, Debug)]
pub struct UploadReceipt {
    pub video_id: String,
    pub private_link: Option<String>,
    pub expiration_time: Option<String>,
}

/// The remote object store, as the publisher needs it. Tests substitute
/// fakes that count attempts.
pub trait ObjectStore: Send + Sync {
    fn upload(
        &self,
        mp4: &[u8],
        video_id: &str,
        expiration_hours: u64,
    ) -> Result<UploadReceipt, UploadError>;
}

// -------------------- HTTP store client --------------------

#[derive(Debug, Deserialize)]
struct WireUploadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    video_id: String,
    #[serde(default)]
    private_link: Option<String>,
    #[serde(default)]
    expiration_time: Option<String>,
}

/// `POST {base}/api/v1/videos/upload` with a hand-built multipart body.
pub struct HttpObjectStore {
    base_url: String,
    credential: Option<String>,
    agent: ureq::Agent,
}

impl HttpObjectStore {
    pub fn new(base_url: String, credential: Option<String>, timeout: std::time::Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn upload(
        &self,
        mp4: &[u8],
        video_id: &str,
        expiration_hours: u64,
    ) -> Result<UploadReceipt, UploadError> {
        let boundary = format!("vigil-{}", hex::encode(rand::random::<[u8; 12]>()));
        let metadata = serde_json::json!({ "video_id": video_id }).to_string();
        let body = multipart_body(&boundary, mp4, video_id, &metadata, expiration_hours);

        let url = format!("{}/api/v1/videos/upload", self.base_url);
        let mut request = self.agent.post(&url).set(
            "Content-Type",
            &format!("multipart/form-data; boundary={}", boundary),
        );
        if let Some(credential) = &self.credential {
            request = request.set("Authorization", &format!("Bearer {}", credential));
        }

        let response = match request.send_bytes(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(UploadError {
                    retryable: matches!(status, 408 | 429) || (500..600).contains(&status),
                    reason: format!("object store HTTP {}", status),
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(UploadError {
                    retryable: true,
                    reason: format!("object store transport: {}", err),
                });
            }
        };

        let wire: WireUploadResponse = response.into_json().map_err(|err| UploadError {
            retryable: false,
            reason: format!("object store malformed response: {}", err),
        })?;
        if !wire.success || wire.video_id.is_empty() {
            return Err(UploadError {
                retryable: false,
                reason: "object store rejected the upload".to_string(),
            });
        }
        Ok(UploadReceipt {
            video_id: wire.video_id,
            private_link: wire.private_link,
            expiration_time: wire.expiration_time,
        })
    }
}

fn multipart_body(
    boundary: &str,
    mp4: &[u8],
    video_id: &str,
    metadata: &str,
    expiration_hours: u64,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(mp4.len() + 1024);
    let mut text_part = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    };
    text_part("metadata", metadata);
    text_part("expiration_hours", &expiration_hours.to_string());
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"{}.mp4\"\r\n\
             Content-Type: video/mp4\r\n\r\n",
            boundary, video_id
        )
        .as_bytes(),
    );
    body.extend_from_slice(mp4);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

// -------------------- Publisher --------------------

/// Where an evidence clip ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    Remote,
    Local,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Durable record of one published clip.
#[derive(Clone, Debug)]
pub struct PublishedEvidence {
    pub clip_id: String,
    pub url: String,
    pub storage: StorageLocation,
    pub expires_at: f64,
    pub expires_at_iso: String,
    pub access_token: String,
    pub byte_size: usize,
    pub attempts: u32,
    pub local_path: Option<PathBuf>,
}

/// Sidecar JSON written next to every locally stored clip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceSidecar {
    pub tenant_id: i64,
    pub source_id: String,
    pub incident_kind: String,
    pub produced_at: f64,
    pub expires_at: f64,
    pub byte_size: usize,
}

pub struct EvidencePublisher {
    store: Option<Arc<dyn ObjectStore>>,
    cfg: EvidenceConfig,
    policy: RetryPolicy,
    retention_days: u64,
}

impl EvidencePublisher {
    pub fn new(
        cfg: EvidenceConfig,
        store: Option<Arc<dyn ObjectStore>>,
        policy: RetryPolicy,
        retention_days: u64,
    ) -> Self {
        Self {
            store,
            cfg,
            policy,
            retention_days,
        }
    }

    /// Upload the clip, falling back to local storage on exhaustion.
    pub fn publish(
        &self,
        clip: &AssembledClip,
        tenant_id: i64,
        source_id: &str,
        incident_kind: &str,
    ) -> Result<PublishedEvidence> {
        let produced_at = now_epoch_s();
        let content_id = content_id(&clip.mp4);

        if let Some(store) = &self.store {
            match self.upload_with_retry(store.as_ref(), &clip.mp4, &content_id) {
                Ok((receipt, attempts)) => {
                    return Ok(self.remote_record(clip, receipt, produced_at, attempts));
                }
                Err((reason, attempts)) => {
                    log::warn!(
                        "evidence upload failed after {} attempts, falling back to local storage: {}",
                        attempts,
                        reason
                    );
                    let mut record = self.store_locally(
                        clip,
                        &content_id,
                        tenant_id,
                        source_id,
                        incident_kind,
                        produced_at,
                    )?;
                    record.attempts = attempts;
                    return Ok(record);
                }
            }
        }

        self.store_locally(clip, &content_id, tenant_id, source_id, incident_kind, produced_at)
    }

    fn upload_with_retry(
        &self,
        store: &dyn ObjectStore,
        mp4: &[u8],
        video_id: &str,
    ) -> Result<(UploadReceipt, u32), (String, u32)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match store.upload(mp4, video_id, self.cfg.expiry_hours) {
                Ok(receipt) => return Ok((receipt, attempts)),
                Err(err) if err.retryable && attempts < self.policy.max_attempts() => {
                    let delay = self.policy.delay_before_retry(attempts);
                    log::warn!(
                        "evidence upload attempt {}/{} failed, retrying in {:.0?}: {}",
                        attempts,
                        self.policy.max_attempts(),
                        delay,
                        err
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err((err.reason, attempts)),
            }
        }
    }

    fn remote_record(
        &self,
        clip: &AssembledClip,
        receipt: UploadReceipt,
        produced_at: f64,
        attempts: u32,
    ) -> PublishedEvidence {
        let expires_at = produced_at + self.cfg.expiry_hours as f64 * 3600.0;
        // The store's expiry string wins when present: tokens are verified
        // against the exact string, not the instant it denotes.
        let expires_at_iso = receipt
            .expiration_time
            .clone()
            .unwrap_or_else(|| iso_timestamp(expires_at));
        let token = access_token(&receipt.video_id, &expires_at_iso, &self.cfg.token_secret);
        let url = format!(
            "{}/video/{}?token={}",
            self.cfg.public_base_url.trim_end_matches('/'),
            receipt.video_id,
            token
        );
        PublishedEvidence {
            clip_id: receipt.video_id,
            url,
            storage: StorageLocation::Remote,
            expires_at,
            expires_at_iso,
            access_token: token,
            byte_size: clip.byte_size(),
            attempts,
            local_path: None,
        }
    }

    fn store_locally(
        &self,
        clip: &AssembledClip,
        content_id: &str,
        tenant_id: i64,
        source_id: &str,
        incident_kind: &str,
        produced_at: f64,
    ) -> Result<PublishedEvidence> {
        std::fs::create_dir_all(&self.cfg.local_dir).with_context(|| {
            format!("create local evidence dir '{}'", self.cfg.local_dir.display())
        })?;
        let path = self.cfg.local_dir.join(format!("{}.mp4", content_id));
        std::fs::write(&path, &clip.mp4)
            .with_context(|| format!("write local evidence '{}'", path.display()))?;

        let expires_at = produced_at + self.retention_days as f64 * 86_400.0;
        let sidecar = EvidenceSidecar {
            tenant_id,
            source_id: source_id.to_string(),
            incident_kind: incident_kind.to_string(),
            produced_at,
            expires_at,
            byte_size: clip.byte_size(),
        };
        let sidecar_path = sidecar_path_for(&path);
        std::fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?)
            .with_context(|| format!("write evidence sidecar '{}'", sidecar_path.display()))?;

        let expires_at_iso = iso_timestamp(expires_at);
        let token = access_token(content_id, &expires_at_iso, &self.cfg.token_secret);
        log::info!(
            "evidence stored locally clip_id={} path={}",
            content_id,
            path.display()
        );
        Ok(PublishedEvidence {
            clip_id: content_id.to_string(),
            url: format!("local://{}", path.display()),
            storage: StorageLocation::Local,
            expires_at,
            expires_at_iso,
            access_token: token,
            byte_size: clip.byte_size(),
            attempts: 0,
            local_path: Some(path),
        })
    }
}

/// Content address: first 16 bytes (hex) of the clip's SHA-256.
pub fn content_id(mp4: &[u8]) -> String {
    let digest = Sha256::digest(mp4);
    hex::encode(&digest[..16])
}

pub fn sidecar_path_for(clip_path: &Path) -> PathBuf {
    clip_path.with_extension("json")
}
