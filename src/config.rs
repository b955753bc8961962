//! Process configuration.
//!
//! All configuration is environment-variable driven; the recognized set is
//! read once at startup into a [`Config`] that is passed by reference into
//! components. Nothing in the library reads the environment after startup.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8971";
const DEFAULT_DB_PATH: &str = "vigil.db";
const DEFAULT_CREDENTIAL_HEADERS: &str = "authorization,x-api-key";
const DEFAULT_DEDUP_CACHE_PATH: &str = ".incident_cache.json";
const DEFAULT_DEDUP_COOLDOWN_S: u64 = 300;
const DEFAULT_DEDUP_TTL_S: u64 = 86_400;
const DEFAULT_SHORT_WINDOW_S: u64 = 3;
const DEFAULT_LONG_WINDOW_S: u64 = 10;
const DEFAULT_TARGET_FPS: u32 = 25;
const DEFAULT_SCREEN_INTERVAL_S: u64 = 3;
const DEFAULT_CONFIRM_THRESHOLD: usize = 1;
const DEFAULT_MAX_CLIP_SIZE_MB: u64 = 20;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_UPLOAD_RETRIES: u32 = 3;
const DEFAULT_DISPATCH_RETRIES: u32 = 3;
const DEFAULT_EXPIRY_HOURS: u64 = 72;
const DEFAULT_LOCAL_EVIDENCE_DIR: &str = "local_evidence";
const DEFAULT_OFFLINE_ALERTS_DIR: &str = "offline_alerts";
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_VISION_TIMEOUT_S: u64 = 30;
const DEFAULT_UPLOAD_TIMEOUT_S: u64 = 60;
const DEFAULT_SMTP_TIMEOUT_S: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_S: u64 = 10;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_url(name: &str) -> Result<Option<String>> {
    match env_opt(name) {
        Some(raw) => {
            url::Url::parse(&raw).map_err(|e| anyhow!("invalid URL in {}: {}", name, e))?;
            Ok(Some(raw.trim_end_matches('/').to_string()))
        }
        None => Ok(None),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Pipeline timing knobs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Trailing window analyzed by the screener.
    pub short_window_s: u64,
    /// Trailing window carried as evidence and analyzed by the confirmer.
    pub long_window_s: u64,
    /// Nominal source frame rate; sizes the ring and paces clip playback.
    pub target_fps: u32,
    /// Wall-clock interval between screening ticks.
    pub screen_interval_s: u64,
    /// How many of the representative frames the confirmer must flag.
    pub confirm_threshold: usize,
}

impl PipelineConfig {
    /// Ring capacity: enough frames to cover the long window at target fps.
    pub fn ring_capacity(&self) -> usize {
        (self.long_window_s as usize).saturating_mul(self.target_fps as usize)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            short_window_s: DEFAULT_SHORT_WINDOW_S,
            long_window_s: DEFAULT_LONG_WINDOW_S,
            target_fps: DEFAULT_TARGET_FPS,
            screen_interval_s: DEFAULT_SCREEN_INTERVAL_S,
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
        }
    }
}

/// Vision provider endpoints and model handles.
///
/// Model identifiers are configuration only; nothing in the pipeline
/// branches on them. `role` is the decision input.
#[derive(Clone, Debug, Default)]
pub struct VisionConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub screener_model: String,
    pub confirmer_model: String,
    pub timeout: Duration,
}

/// Evidence publication endpoints and policy.
#[derive(Clone, Debug)]
pub struct EvidenceConfig {
    pub store_base_url: Option<String>,
    pub store_credential: Option<String>,
    /// Public base used both to mint and to verify tokenized clip URLs.
    /// The two sides must agree or tokens will be rejected.
    pub public_base_url: String,
    pub token_secret: String,
    pub local_dir: PathBuf,
    pub max_clip_size_mb: u64,
    pub upload_retries: u32,
    pub upload_timeout: Duration,
    pub expiry_hours: u64,
}

/// Alert transport.
#[derive(Clone, Debug, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub timeout: Duration,
    pub dispatch_retries: u32,
}

/// Complete process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    /// Header names checked for tenant credentials, lowercase, in order.
    pub credential_headers: Vec<String>,
    pub admin_credential: Option<String>,
    pub pipeline: PipelineConfig,
    pub vision: VisionConfig,
    pub evidence: EvidenceConfig,
    pub smtp: SmtpConfig,
    pub dedup_cache_path: PathBuf,
    pub dedup_cooldown: Duration,
    pub dedup_ttl: Duration,
    pub offline_alerts_dir: PathBuf,
    pub retention_days: u64,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Read the recognized environment variable set.
    pub fn from_env() -> Result<Self> {
        let pipeline = PipelineConfig {
            short_window_s: env_parse("SHORT_WINDOW_S", DEFAULT_SHORT_WINDOW_S)?,
            long_window_s: env_parse("LONG_WINDOW_S", DEFAULT_LONG_WINDOW_S)?,
            target_fps: env_parse("TARGET_FPS", DEFAULT_TARGET_FPS)?,
            screen_interval_s: env_parse("SCREEN_INTERVAL_S", DEFAULT_SCREEN_INTERVAL_S)?,
            confirm_threshold: env_parse("CONFIRM_THRESHOLD", DEFAULT_CONFIRM_THRESHOLD)?,
        };
        if pipeline.target_fps == 0 {
            return Err(anyhow!("TARGET_FPS must be >= 1"));
        }
        if pipeline.long_window_s < pipeline.short_window_s {
            return Err(anyhow!("LONG_WINDOW_S must cover SHORT_WINDOW_S"));
        }

        let vision = VisionConfig {
            api_url: env_url("VISION_API_URL")?,
            api_key: env_opt("VISION_API_KEY"),
            screener_model: env_string("VISION_SCREENER_MODEL", "screener-default"),
            confirmer_model: env_string("VISION_CONFIRMER_MODEL", "confirmer-default"),
            timeout: Duration::from_secs(env_parse(
                "VISION_TIMEOUT_S",
                DEFAULT_VISION_TIMEOUT_S,
            )?),
        };

        let evidence = EvidenceConfig {
            store_base_url: env_url("OBJECT_STORE_BASE_URL")?,
            store_credential: env_opt("OBJECT_STORE_CREDENTIAL"),
            public_base_url: env_string("EVIDENCE_BASE_URL", "http://127.0.0.1:8971"),
            token_secret: env_string("EVIDENCE_TOKEN_SECRET", "change-me"),
            local_dir: PathBuf::from(env_string("LOCAL_EVIDENCE_DIR", DEFAULT_LOCAL_EVIDENCE_DIR)),
            max_clip_size_mb: env_parse("MAX_CLIP_SIZE_MB", DEFAULT_MAX_CLIP_SIZE_MB)?,
            upload_retries: env_parse("UPLOAD_RETRIES", DEFAULT_UPLOAD_RETRIES)?,
            upload_timeout: Duration::from_secs(env_parse(
                "UPLOAD_TIMEOUT_S",
                DEFAULT_UPLOAD_TIMEOUT_S,
            )?),
            expiry_hours: env_parse("EXPIRY_HOURS", DEFAULT_EXPIRY_HOURS)?,
        };

        let smtp = SmtpConfig {
            host: env_opt("SMTP_HOST"),
            port: env_parse("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            user: env_opt("SMTP_USER"),
            password: env_opt("SMTP_PASSWORD"),
            from: env_string("SMTP_FROM", "vigil@localhost"),
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_S", DEFAULT_SMTP_TIMEOUT_S)?),
            dispatch_retries: env_parse("DISPATCH_RETRIES", DEFAULT_DISPATCH_RETRIES)?,
        };

        let credential_headers = env_string("CREDENTIAL_HEADER_NAMES", DEFAULT_CREDENTIAL_HEADERS)
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect::<Vec<_>>();
        if credential_headers.is_empty() {
            return Err(anyhow!("CREDENTIAL_HEADER_NAMES must name at least one header"));
        }

        Ok(Self {
            bind_addr: env_string("VIGIL_BIND_ADDR", DEFAULT_BIND_ADDR),
            db_path: env_string("VIGIL_DB_PATH", DEFAULT_DB_PATH),
            credential_headers,
            admin_credential: env_opt("ADMIN_CREDENTIAL"),
            pipeline,
            vision,
            evidence,
            smtp,
            dedup_cache_path: PathBuf::from(env_string(
                "DEDUP_CACHE_PATH",
                DEFAULT_DEDUP_CACHE_PATH,
            )),
            dedup_cooldown: Duration::from_secs(env_parse(
                "DEDUP_COOLDOWN_S",
                DEFAULT_DEDUP_COOLDOWN_S,
            )?),
            dedup_ttl: Duration::from_secs(env_parse("DEDUP_TTL_S", DEFAULT_DEDUP_TTL_S)?),
            offline_alerts_dir: PathBuf::from(env_string(
                "OFFLINE_ALERTS_DIR",
                DEFAULT_OFFLINE_ALERTS_DIR,
            )),
            retention_days: env_parse("RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            shutdown_grace: Duration::from_secs(env_parse(
                "SHUTDOWN_GRACE_S",
                DEFAULT_SHUTDOWN_GRACE_S,
            )?),
        })
    }
}

impl Default for Config {
    /// Defaults suitable for tests: no external endpoints configured.
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            db_path: ":memory:".to_string(),
            credential_headers: DEFAULT_CREDENTIAL_HEADERS
                .split(',')
                .map(str::to_string)
                .collect(),
            admin_credential: None,
            pipeline: PipelineConfig::default(),
            vision: VisionConfig {
                timeout: Duration::from_secs(DEFAULT_VISION_TIMEOUT_S),
                ..VisionConfig::default()
            },
            evidence: EvidenceConfig {
                store_base_url: None,
                store_credential: None,
                public_base_url: "http://127.0.0.1:8971".to_string(),
                token_secret: "change-me".to_string(),
                local_dir: PathBuf::from(DEFAULT_LOCAL_EVIDENCE_DIR),
                max_clip_size_mb: DEFAULT_MAX_CLIP_SIZE_MB,
                upload_retries: DEFAULT_UPLOAD_RETRIES,
                upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_S),
                expiry_hours: DEFAULT_EXPIRY_HOURS,
            },
            smtp: SmtpConfig {
                port: DEFAULT_SMTP_PORT,
                from: "vigil@localhost".to_string(),
                timeout: Duration::from_secs(DEFAULT_SMTP_TIMEOUT_S),
                dispatch_retries: DEFAULT_DISPATCH_RETRIES,
                ..SmtpConfig::default()
            },
            dedup_cache_path: PathBuf::from(DEFAULT_DEDUP_CACHE_PATH),
            dedup_cooldown: Duration::from_secs(DEFAULT_DEDUP_COOLDOWN_S),
            dedup_ttl: Duration::from_secs(DEFAULT_DEDUP_TTL_S),
            offline_alerts_dir: PathBuf::from(DEFAULT_OFFLINE_ALERTS_DIR),
            retention_days: DEFAULT_RETENTION_DAYS,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_S),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_covers_long_window() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.ring_capacity(), 250);
    }

    #[test]
    fn default_config_has_no_external_endpoints() {
        let cfg = Config::default();
        assert!(cfg.vision.api_url.is_none());
        assert!(cfg.evidence.store_base_url.is_none());
        assert!(cfg.smtp.host.is_none());
        assert_eq!(cfg.pipeline.confirm_threshold, 1);
    }
}
