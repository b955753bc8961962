//! Shared fixtures for the integration tests: a scripted vision client, a
//! recording mail transport, scriptable object stores, and a running engine
//! plus API server on an ephemeral port.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Read as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_core::config::Config;
use vigil_core::api::{ApiHandle, ApiServer};
use vigil_core::dispatcher::MailTransport;
use vigil_core::engine::{Engine, EngineDeps};
use vigil_core::publisher::{ObjectStore, UploadError, UploadReceipt};
use vigil_core::transport::RetryPolicy;
use vigil_core::{
    AnalysisContext, AnalysisVerdict, Frame, FramePosition, FrameVerdict, VisionClient,
    VisionError, VisionRole,
};

// -------------------- Vision --------------------

pub struct ScriptedVision {
    screener: Mutex<VecDeque<Result<AnalysisVerdict, VisionError>>>,
    confirmer: Mutex<VecDeque<Result<AnalysisVerdict, VisionError>>>,
}

impl ScriptedVision {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            screener: Mutex::new(VecDeque::new()),
            confirmer: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push_screener(&self, result: Result<AnalysisVerdict, VisionError>) {
        self.screener.lock().unwrap().push_back(result);
    }

    pub fn push_confirmer(&self, result: Result<AnalysisVerdict, VisionError>) {
        self.confirmer.lock().unwrap().push_back(result);
    }

    /// One screener-positive / confirmer-confirms exchange.
    pub fn script_confirmed_detection(&self, kind: &str) {
        self.push_screener(Ok(screener_positive(kind)));
        self.push_confirmer(Ok(confirmer_verdict(kind, &[false, true, false])));
    }
}

impl VisionClient for ScriptedVision {
    fn analyze(
        &self,
        role: VisionRole,
        _frames: &[Arc<Frame>],
        _context: &AnalysisContext,
    ) -> Result<AnalysisVerdict, VisionError> {
        let queue = match role {
            VisionRole::Screener => &self.screener,
            VisionRole::Confirmer => &self.confirmer,
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(AnalysisVerdict::default()))
    }
}

pub fn screener_positive(kind: &str) -> AnalysisVerdict {
    AnalysisVerdict {
        incident: true,
        incident_kind: kind.to_string(),
        confidence: 0.9,
        narrative: format!("possible {} at fence line", kind),
        per_frame: vec![],
    }
}

pub fn confirmer_verdict(kind: &str, flags: &[bool]) -> AnalysisVerdict {
    let positions = [FramePosition::Start, FramePosition::Middle, FramePosition::End];
    AnalysisVerdict {
        incident: flags.iter().any(|&f| f),
        incident_kind: kind.to_string(),
        confidence: 0.85,
        narrative: format!("window reviewed for {}", kind),
        per_frame: flags
            .iter()
            .enumerate()
            .map(|(i, &incident)| FrameVerdict {
                position: positions[i.min(2)],
                incident,
                narrative: String::new(),
            })
            .collect(),
    }
}

// -------------------- Mail --------------------

#[derive(Clone, Debug)]
pub struct SentMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

pub struct RecordingMail {
    pub sent: Mutex<Vec<SentMail>>,
    pub attempts: AtomicU32,
    pub failure: Mutex<Option<String>>,
}

impl RecordingMail {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            failure: Mutex::new(None),
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            failure: Mutex::new(Some(reason.to_string())),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MailTransport for RecordingMail {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.failure.lock().unwrap().as_ref() {
            return Err(anyhow::anyhow!("{}", reason));
        }
        self.sent.lock().unwrap().push(SentMail {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

// -------------------- Object store --------------------

pub struct ScriptedStore {
    pub attempts: AtomicU32,
    pub always_fail_with: Option<UploadError>,
}

impl ScriptedStore {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            always_fail_with: None,
        })
    }

    pub fn outage() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            always_fail_with: Some(UploadError {
                retryable: true,
                reason: "object store HTTP 503".to_string(),
            }),
        })
    }
}

impl ObjectStore for ScriptedStore {
    fn upload(
        &self,
        _mp4: &[u8],
        video_id: &str,
        _expiration_hours: u64,
    ) -> Result<UploadReceipt, UploadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.always_fail_with {
            return Err(err.clone());
        }
        Ok(UploadReceipt {
            video_id: format!("store-{}", video_id),
            private_link: None,
            expiration_time: Some("2026-09-01T00:00:00Z".to_string()),
        })
    }
}

// -------------------- Frames --------------------

/// A small synthetic camera scene, stable per `shade` so fingerprints
/// collapse repeats.
pub fn jpeg_scene(shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_fn(64, 48, |x, _| {
        if x < 32 {
            image::Rgb([shade, shade, shade])
        } else {
            image::Rgb([255 - shade, 255 - shade, 255 - shade])
        }
    });
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90);
    encoder
        .encode(img.as_raw(), 64, 48, image::ExtendedColorType::Rgb8)
        .unwrap();
    jpeg
}

// -------------------- Harness --------------------

pub struct TestServer {
    pub engine: Arc<Engine>,
    pub api: Option<ApiHandle>,
    pub base_url: String,
    pub vision: Arc<ScriptedVision>,
    pub mail: Arc<RecordingMail>,
    pub store: Option<Arc<ScriptedStore>>,
    pub dir: tempfile::TempDir,
}

pub const ADMIN_KEY: &str = "test-admin-key";

impl TestServer {
    pub fn start(mail: Arc<RecordingMail>, store: Option<Arc<ScriptedStore>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.bind_addr = "127.0.0.1:0".to_string();
        cfg.admin_credential = Some(ADMIN_KEY.to_string());
        cfg.dedup_cache_path = dir.path().join("cache.json");
        cfg.evidence.local_dir = dir.path().join("evidence");
        cfg.evidence.public_base_url = "http://evidence.test".to_string();
        cfg.offline_alerts_dir = dir.path().join("alerts");
        // Keep the timer out of the way; tests drive analysis on demand.
        cfg.pipeline.screen_interval_s = 3600;

        let vision = ScriptedVision::new();
        let deps = EngineDeps {
            vision: vision.clone(),
            object_store: store
                .clone()
                .map(|s| s as Arc<dyn ObjectStore>),
            mail: Some(mail.clone() as Arc<dyn MailTransport>),
            upload_policy: RetryPolicy::immediate(3),
            dispatch_policy: RetryPolicy::immediate(3),
        };
        let engine = Engine::new(cfg, deps).unwrap();
        let api = ApiServer::new(engine.clone()).spawn().unwrap();
        let base_url = format!("http://{}", api.addr);
        Self {
            engine,
            api: Some(api),
            base_url,
            vision,
            mail,
            store,
            dir,
        }
    }

    pub fn stop(mut self) {
        if let Some(api) = self.api.take() {
            api.stop().unwrap();
        }
        self.engine.shutdown();
    }

    /// Create a tenant through the admin API, returning (id, credential).
    pub fn create_tenant(&self, name: &str, email: Option<&str>) -> (i64, String) {
        let response = ureq::post(&format!("{}/admin/tenants", self.base_url))
            .set("X-Admin-Key", ADMIN_KEY)
            .send_json(serde_json::json!({ "name": name, "email": email }))
            .unwrap();
        let body: serde_json::Value = response.into_json().unwrap();
        (
            body["tenant_id"].as_i64().unwrap(),
            body["credential"].as_str().unwrap().to_string(),
        )
    }

    pub fn post(
        &self,
        path: &str,
        credential: &str,
        body: serde_json::Value,
    ) -> (u16, serde_json::Value) {
        let result = ureq::post(&format!("{}{}", self.base_url, path))
            .set("X-API-Key", credential)
            .send_json(body);
        response_to_json(result)
    }

    pub fn get(&self, path: &str, credential: &str) -> (u16, serde_json::Value) {
        let result = ureq::get(&format!("{}{}", self.base_url, path))
            .set("X-API-Key", credential)
            .call();
        response_to_json(result)
    }

    /// Raw GET without credentials; returns (status, content-type, body).
    pub fn get_raw(&self, path: &str) -> (u16, String, Vec<u8>) {
        let result = ureq::get(&format!("{}{}", self.base_url, path)).call();
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => panic!("transport error: {}", err),
        };
        let status = response.status();
        let content_type = response.content_type().to_string();
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body).unwrap();
        (status, content_type, body)
    }

    pub fn buffer_frames(&self, credential: &str, source_id: &str, count: usize, shade: u8) {
        let encoded = base64_jpeg(shade);
        for _ in 0..count {
            let (status, _) = self.post(
                "/buffer/frame",
                credential,
                serde_json::json!({
                    "source_id": source_id,
                    "source_name": format!("{} camera", source_id),
                    "frame_data": encoded,
                    "frame_count": 1,
                }),
            );
            assert_eq!(status, 200);
        }
    }

    pub fn analyze(&self, credential: &str, source_ids: &[&str]) -> (u16, serde_json::Value) {
        self.post(
            "/analyze/on-demand",
            credential,
            serde_json::json!({ "source_ids": source_ids }),
        )
    }

    /// Evidence files (clips only, not sidecars) currently on disk.
    pub fn local_clips(&self) -> Vec<std::path::PathBuf> {
        let dir = self.dir.path().join("evidence");
        match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "mp4").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn spooled_alerts(&self) -> Vec<std::path::PathBuf> {
        let dir = self.dir.path().join("alerts");
        match std::fs::read_dir(&dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn base64_jpeg(shade: u8) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(jpeg_scene(shade))
}

pub fn response_to_json(
    result: Result<ureq::Response, ureq::Error>,
) -> (u16, serde_json::Value) {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => panic!("transport error: {}", err),
    };
    let status = response.status();
    let body: serde_json::Value = response.into_json().unwrap_or(serde_json::Value::Null);
    (status, body)
}

/// Poll until `predicate` holds; the coordinator runs on its own thread.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}
