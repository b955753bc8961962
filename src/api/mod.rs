//! Public HTTP surface.
//!
//! A small HTTP/1.1 server on `std::net::TcpListener`: accept loop with a
//! shutdown flag, one handler thread per connection, one request per
//! connection. Bodies are JSON with explicit `Content-Length`; responses
//! carry stable `error_code` strings so clients can branch without parsing
//! prose.
//!
//! Authentication: every endpoint except `GET /health` and the token-gated
//! clip routes resolves a tenant credential (`Authorization: Bearer` or
//! `X-API-Key`, configurable). Admin endpoints are gated by the
//! process-wide `X-Admin-Key` instead, so the first tenant can be created
//! before any tenant credential exists. Clip access is deliberately
//! self-authorizing: possession of a valid token grants the bytes,
//! regardless of which tenant asks.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::analyzer::StageOutcome;
use crate::clip;
use crate::coordinator::IncidentOutcome;
use crate::engine::{Engine, EngineError};
use crate::publisher::{access_token, sidecar_path_for, EvidenceSidecar};
use crate::tenant::TenantRecord;
use crate::{iso_timestamp, now_epoch_s};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

// Usage costs, in provider-call-equivalent units. Billing interprets them.
const COST_BUFFER_FRAME: f64 = 0.01;
const COST_ANALYZE_PER_SOURCE: f64 = 1.0;
const COST_ALERT: f64 = 1.0;
const COST_CLIP_OP: f64 = 0.25;

// -------------------- Server handle --------------------

pub struct ApiServer {
    engine: Arc<Engine>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

impl ApiServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured: SocketAddr = self
            .engine
            .config()
            .bind_addr
            .parse()
            .context("parse VIGIL_BIND_ADDR")?;
        let listener = TcpListener::bind(configured)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let engine = self.engine;
        let join = std::thread::spawn(move || {
            run_api(listener, engine, shutdown_thread);
        });
        log::info!("api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, engine: Arc<Engine>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &engine) {
                        log::warn!("api connection error: {:#}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::error!("api accept failed: {}", err);
                return;
            }
        }
    }
}

// -------------------- Request / response plumbing --------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Credential lookup across the configured header list, in order.
    /// `Authorization` strips an optional `Bearer` prefix; other headers are
    /// taken verbatim.
    fn credential(&self, header_names: &[String]) -> Option<String> {
        for name in header_names {
            if let Some(value) = self.header(name) {
                let value = value.trim();
                if name == "authorization" {
                    let mut parts = value.splitn(2, char::is_whitespace);
                    match (parts.next(), parts.next()) {
                        (Some(scheme), Some(rest)) if scheme.eq_ignore_ascii_case("bearer") => {
                            return Some(rest.trim().to_string());
                        }
                        _ => continue,
                    }
                }
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.raw_path.split('?').nth(1)?;
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
        None
    }

    fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Response> {
        serde_json::from_slice(&self.body)
            .map_err(|err| Response::error(400, "bad_request", &format!("invalid JSON body: {}", err)))
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn ok(value: serde_json::Value) -> Self {
        Self::json(200, &value)
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        Self::json(
            status,
            &serde_json::json!({ "error": message, "error_code": code }),
        )
    }

    fn mp4(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "video/mp4",
            body,
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, Response> {
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|_| Response::error(500, "internal", "socket setup failed"))?;

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(Response::error(400, "bad_request", "headers too large"));
        }
        let n = stream.read(&mut buf).map_err(map_read_err)?;
        if n == 0 {
            return Err(Response::error(400, "bad_request", "connection closed mid-request"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Response::error(400, "bad_request", "empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Response::error(400, "bad_request", "missing method"))?
        .to_string();
    let raw_path = parts
        .next()
        .ok_or_else(|| Response::error(400, "bad_request", "missing path"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse().unwrap_or(usize::MAX))
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(Response::error(413, "bad_request", "body too large"));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).map_err(map_read_err)?;
        if n == 0 {
            return Err(Response::error(400, "bad_request", "connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(&raw_path).to_string();
    Ok(HttpRequest {
        method,
        path,
        raw_path,
        headers,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn map_read_err(err: std::io::Error) -> Response {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            Response::error(408, "timeout", "request read timed out")
        }
        _ => Response::error(400, "bad_request", "request read failed"),
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        408 => "HTTP/1.1 408 Request Timeout",
        413 => "HTTP/1.1 413 Payload Too Large",
        429 => "HTTP/1.1 429 Too Many Requests",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line(response.status),
        response.content_type,
        response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

fn handle_connection(mut stream: TcpStream, engine: &Engine) -> Result<()> {
    let response = match read_request(&mut stream) {
        Ok(request) => route(engine, &request),
        Err(response) => response,
    };
    write_response(&mut stream, &response)
}

// -------------------- Routing --------------------

fn route(engine: &Engine, request: &HttpRequest) -> Response {
    let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();

    // Unauthenticated surface.
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => {
            return Response::ok(serde_json::json!({
                "status": "healthy",
                "timestamp": iso_timestamp(now_epoch_s()),
            }));
        }
        // Token possession, not tenant identity, gates clip access.
        ("GET", ["evidence", clip_id]) | ("GET", ["video", clip_id]) => {
            return serve_clip(engine, request, clip_id);
        }
        _ => {}
    }

    // Admin surface: process-wide key, no tenant credential needed (the
    // first tenant has to come from somewhere).
    if segments.first() == Some(&"admin") {
        return route_admin(engine, request, &segments);
    }

    // Everything else is tenant-scoped.
    let Some(credential) = request.credential(&engine.config().credential_headers) else {
        return Response::error(401, "unauthorized", "missing credential");
    };
    let tenant = match engine.tenants().authenticate(&credential) {
        Ok(Some(tenant)) => tenant,
        Ok(None) => return Response::error(401, "unauthorized", "invalid or revoked credential"),
        Err(err) => {
            log::error!("credential check failed: {:#}", err);
            return Response::error(500, "internal", "credential check failed");
        }
    };

    let (response, cost) = match (request.method.as_str(), segments.as_slice()) {
        ("POST", ["buffer", "frame"]) => buffer_frame(engine, &tenant, request),
        ("GET", ["buffer", "status"]) => buffer_status(engine, &tenant),
        ("POST", ["analyze", "on-demand"]) => analyze_on_demand(engine, &tenant, request),
        ("POST", ["alert"]) => submit_alert(engine, &tenant, request),
        ("POST", ["evidence", "assemble"]) => assemble_clip(engine, request, false),
        ("POST", ["evidence", "compress"]) => assemble_clip(engine, request, true),
        ("GET", ["usage"]) => usage_summary(engine, &tenant),
        (_, ["buffer", ..]) | (_, ["analyze", ..]) | (_, ["alert"]) | (_, ["evidence", ..])
        | (_, ["usage"]) => (
            Response::error(405, "method_not_allowed", "method not allowed"),
            0.0,
        ),
        _ => (Response::error(404, "not_found", "no such endpoint"), 0.0),
    };

    if response.status < 400 && cost > 0.0 {
        if let Err(err) = engine.tenants().record_usage(tenant.id, &request.path, cost) {
            log::warn!("usage record failed tenant={}: {:#}", tenant.id, err);
        }
    }
    response
}

fn engine_error_response(err: EngineError) -> Response {
    match err {
        EngineError::ForeignSource => {
            Response::error(403, "forbidden", "source belongs to another tenant")
        }
        EngineError::InvalidInput(msg) => Response::error(400, "bad_request", &msg),
        EngineError::Internal(err) => {
            log::error!("internal error: {:#}", err);
            Response::error(500, "internal", "internal error")
        }
    }
}

// -------------------- Tenant endpoints --------------------

#[derive(Deserialize)]
struct BufferFrameRequest {
    source_id: String,
    #[serde(default)]
    source_name: String,
    frame_data: String,
    #[serde(default)]
    #[allow(dead_code)]
    frame_count: u64,
}

fn buffer_frame(engine: &Engine, tenant: &TenantRecord, request: &HttpRequest) -> (Response, f64) {
    let req: BufferFrameRequest = match request.json() {
        Ok(req) => req,
        Err(response) => return (response, 0.0),
    };
    let jpeg = match base64::engine::general_purpose::STANDARD.decode(&req.frame_data) {
        Ok(jpeg) => jpeg,
        Err(err) => {
            return (
                Response::error(400, "bad_request", &format!("frame_data is not base64: {}", err)),
                0.0,
            )
        }
    };
    let source_name = if req.source_name.is_empty() {
        req.source_id.clone()
    } else {
        req.source_name.clone()
    };
    match engine.ingest_frame(tenant.id, &req.source_id, &source_name, jpeg) {
        Ok(depth) => (
            Response::ok(serde_json::json!({
                "status": "buffered",
                "buffer_size": depth,
            })),
            COST_BUFFER_FRAME,
        ),
        Err(err) => (engine_error_response(err), 0.0),
    }
}

fn buffer_status(engine: &Engine, tenant: &TenantRecord) -> (Response, f64) {
    let sources = engine.buffer_status(tenant.id);
    (
        Response::ok(serde_json::json!({
            "tenant_name": tenant.name,
            "sources": sources,
        })),
        0.0,
    )
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    source_ids: Vec<String>,
}

fn analyze_on_demand(
    engine: &Engine,
    tenant: &TenantRecord,
    request: &HttpRequest,
) -> (Response, f64) {
    let req: AnalyzeRequest = match request.json() {
        Ok(req) => req,
        Err(response) => return (response, 0.0),
    };
    let reports = match engine.analyze_on_demand(tenant.id, &req.source_ids) {
        Ok(reports) => reports,
        Err(err) => return (engine_error_response(err), 0.0),
    };

    let mut sources = serde_json::Map::new();
    let mut screener_positives = 0u32;
    let mut confirmations = 0u32;
    let mut vetoes = 0u32;
    let mut any_confirmed = false;
    for (source_id, source_name, outcome) in &reports {
        match outcome {
            StageOutcome::Confirmed(_) => {
                screener_positives += 1;
                confirmations += 1;
                any_confirmed = true;
            }
            StageOutcome::Veto { .. } => {
                screener_positives += 1;
                vetoes += 1;
            }
            _ => {}
        }
        sources.insert(
            source_id.clone(),
            source_report(source_name, outcome),
        );
    }

    let count = reports.len();
    (
        Response::ok(serde_json::json!({
            "tenant_name": tenant.name,
            "timestamp": iso_timestamp(now_epoch_s()),
            "sources_analyzed": count,
            "sources": sources,
            "summary": {
                "screener_positives": screener_positives,
                "confirmer_confirmations": confirmations,
                "confirmer_vetoes": vetoes,
                "any_confirmed": any_confirmed,
            },
        })),
        COST_ANALYZE_PER_SOURCE * count as f64,
    )
}

fn source_report(source_name: &str, outcome: &StageOutcome) -> serde_json::Value {
    let base = |incident: bool, confirmed: bool, veto: bool| {
        serde_json::json!({
            "source_name": source_name,
            "has_security_incident": incident,
            "confirmer_confirmation": confirmed,
            "confirmer_veto": veto,
            "incident_type": "",
            "narrative": "",
            "per_frame": [],
        })
    };
    match outcome {
        StageOutcome::NoFrames => {
            let mut v = base(false, false, false);
            v["narrative"] = serde_json::json!("no recent frames buffered");
            v
        }
        StageOutcome::ScreenerNegative { verdict } => {
            let mut v = base(false, false, false);
            v["narrative"] = serde_json::json!(verdict.narrative);
            v
        }
        StageOutcome::ScreenerError { error } => {
            let mut v = base(false, false, false);
            v["narrative"] = serde_json::json!("screening unavailable, treated as negative");
            v["error"] = serde_json::json!(error.to_string());
            v
        }
        StageOutcome::Veto { screener, confirmer } => {
            let mut v = base(false, false, true);
            v["incident_type"] = serde_json::json!(screener.incident_kind);
            v["narrative"] = serde_json::json!(screener.narrative);
            v["per_frame"] = serde_json::json!(confirmer.per_frame);
            v
        }
        StageOutcome::Confirmed(incident) => {
            let mut v = base(true, true, false);
            v["incident_type"] = serde_json::json!(incident.incident_kind());
            v["narrative"] = serde_json::json!(incident.screener_verdict.narrative);
            if let Some(confirmer) = &incident.confirmer_verdict {
                v["per_frame"] = serde_json::json!(confirmer.per_frame);
            }
            v["confirmation_source"] = serde_json::json!(incident.confirmer_source.to_string());
            v
        }
    }
}

#[derive(Deserialize)]
struct AlertRequest {
    narrative: String,
    incident_type: String,
    #[serde(default)]
    risk: String,
    #[serde(default)]
    frame_count: usize,
    source_id: String,
}

fn submit_alert(engine: &Engine, tenant: &TenantRecord, request: &HttpRequest) -> (Response, f64) {
    let req: AlertRequest = match request.json() {
        Ok(req) => req,
        Err(response) => return (response, 0.0),
    };
    let narrative = if req.risk.is_empty() {
        req.narrative.clone()
    } else {
        format!("[risk {}] {}", req.risk, req.narrative)
    };
    let outcome = match engine.submit_alert(
        tenant.id,
        &req.source_id,
        &req.incident_type,
        &narrative,
        req.frame_count,
    ) {
        Ok(outcome) => outcome,
        Err(err) => return (engine_error_response(err), 0.0),
    };

    match outcome {
        IncidentOutcome::Dropped { reason } if reason.contains("contact") => (
            Response::error(400, "tenant_state", "tenant contact address not configured"),
            0.0,
        ),
        IncidentOutcome::Dropped { reason } => {
            (Response::error(500, "internal", &reason), 0.0)
        }
        IncidentOutcome::Suppressed {
            seconds_since_last, ..
        } => (
            Response::ok(serde_json::json!({
                "delivered": false,
                "suppressed": true,
                "seconds_since_last": seconds_since_last,
                "recipient": tenant.contact_email,
                "evidence_url": serde_json::Value::Null,
                "storage_location": "none",
            })),
            COST_ALERT,
        ),
        IncidentOutcome::Processed {
            delivered,
            spooled,
            recipient,
            evidence,
        } => (
            Response::ok(serde_json::json!({
                "delivered": delivered,
                "spooled": spooled,
                "recipient": recipient,
                "evidence_url": evidence.as_ref().map(|e| e.url.clone()),
                "storage_location": evidence
                    .as_ref()
                    .map(|e| e.storage.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            })),
            COST_ALERT,
        ),
    }
}

#[derive(Deserialize)]
struct AssembleRequest {
    frames: Vec<String>,
    #[serde(default)]
    fps: Option<u32>,
    #[serde(default)]
    max_size_mb: Option<u64>,
}

/// `/evidence/assemble` packages frames as-is under the configured budget;
/// `/evidence/compress` is the same operation with the budget (optionally
/// overridden) applied as the point of the call.
fn assemble_clip(engine: &Engine, request: &HttpRequest, compress: bool) -> (Response, f64) {
    let req: AssembleRequest = match request.json() {
        Ok(req) => req,
        Err(response) => return (response, 0.0),
    };
    if req.frames.is_empty() {
        return (
            Response::error(400, "bad_request", "frames is empty"),
            0.0,
        );
    }

    let mut frames = Vec::with_capacity(req.frames.len());
    for (i, encoded) in req.frames.iter().enumerate() {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(jpeg) => {
                let at = now_epoch_s() + i as f64 / engine.config().pipeline.target_fps as f64;
                frames.push(crate::Frame::new(i as u64, at, jpeg));
            }
            Err(err) => {
                return (
                    Response::error(
                        400,
                        "bad_request",
                        &format!("frames[{}] is not base64: {}", i, err),
                    ),
                    0.0,
                )
            }
        }
    }

    let fps = req.fps.unwrap_or(engine.config().pipeline.target_fps);
    let budget_mb = if compress {
        req.max_size_mb
            .unwrap_or(engine.config().evidence.max_clip_size_mb)
    } else {
        engine.config().evidence.max_clip_size_mb
    };
    let max_bytes = (budget_mb as usize).saturating_mul(1024 * 1024);

    match clip::assemble(&frames, fps, max_bytes) {
        Ok(assembled) => (
            Response::ok(serde_json::json!({
                "clip": base64::engine::general_purpose::STANDARD.encode(&assembled.mp4),
                "byte_size": assembled.byte_size(),
                "frame_count": assembled.frame_count,
                "fps": assembled.fps,
                "width": assembled.width,
                "height": assembled.height,
                "scale": assembled.scale,
                "duration_s": assembled.duration_s,
                "oversized": assembled.oversized,
            })),
            COST_CLIP_OP,
        ),
        Err(err) => (
            Response::error(400, "bad_request", &format!("clip assembly failed: {:#}", err)),
            0.0,
        ),
    }
}

fn usage_summary(engine: &Engine, tenant: &TenantRecord) -> (Response, f64) {
    match engine.tenants().usage_summary(tenant.id) {
        Ok(summary) => {
            let total: f64 = summary.iter().map(|a| a.total_cost).sum();
            (
                Response::ok(serde_json::json!({
                    "tenant_name": tenant.name,
                    "usage": summary,
                    "total_cost": total,
                })),
                0.0,
            )
        }
        Err(err) => {
            log::error!("usage summary failed: {:#}", err);
            (Response::error(500, "internal", "usage lookup failed"), 0.0)
        }
    }
}

// -------------------- Clip serving --------------------

/// Serve a locally stored clip by id. Tokens are self-authorizing: the check
/// is `token == SHA256(clip_id || expires_at_iso || secret)[..16]`, nothing
/// about the caller.
fn serve_clip(engine: &Engine, request: &HttpRequest, clip_id: &str) -> Response {
    if clip_id.is_empty() || !clip_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Response::error(404, "not_found", "Clip not found");
    }
    let Some(token) = request.query_param("token") else {
        return Response::error(403, "forbidden", "Invalid token");
    };

    let evidence = &engine.config().evidence;
    let clip_path = evidence.local_dir.join(format!("{}.mp4", clip_id));
    let sidecar_path = sidecar_path_for(&clip_path);
    let sidecar: EvidenceSidecar = match std::fs::read(&sidecar_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        Some(sidecar) => sidecar,
        None => return Response::error(404, "not_found", "Clip not found"),
    };

    if now_epoch_s() > sidecar.expires_at {
        return Response::error(404, "not_found", "Clip not found");
    }

    let expected = access_token(clip_id, &iso_timestamp(sidecar.expires_at), &evidence.token_secret);
    if token != expected {
        return Response::error(403, "forbidden", "Invalid token");
    }

    match std::fs::read(&clip_path) {
        Ok(bytes) => Response::mp4(bytes),
        Err(_) => Response::error(404, "not_found", "Clip not found"),
    }
}

// -------------------- Admin endpoints --------------------

#[derive(Deserialize)]
struct CreateTenantRequest {
    name: String,
    #[serde(default)]
    email: Option<String>,
}

fn route_admin(engine: &Engine, request: &HttpRequest, segments: &[&str]) -> Response {
    let Some(expected) = engine.config().admin_credential.as_deref() else {
        return Response::error(403, "forbidden", "admin interface disabled");
    };
    match request.header("x-admin-key") {
        Some(presented) if presented == expected => {}
        _ => return Response::error(401, "unauthorized", "missing or invalid admin credential"),
    }

    match (request.method.as_str(), segments) {
        ("POST", ["admin", "tenants"]) => {
            let req: CreateTenantRequest = match request.json() {
                Ok(req) => req,
                Err(response) => return response,
            };
            match engine
                .tenants()
                .create_tenant(&req.name, req.email.as_deref())
            {
                Ok((tenant, credential)) => Response::ok(serde_json::json!({
                    "tenant_id": tenant.id,
                    // Returned exactly once; only the digest survives.
                    "credential": credential,
                })),
                Err(err) => Response::error(400, "bad_request", &format!("{:#}", err)),
            }
        }
        ("GET", ["admin", "tenants"]) => match engine.tenants().list_tenants() {
            Ok(tenants) => {
                let rows: Vec<serde_json::Value> = tenants
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "tenant_id": t.id,
                            "name": t.name,
                            "contact_email": t.contact_email,
                            "active": t.active,
                        })
                    })
                    .collect();
                Response::ok(serde_json::json!({ "tenants": rows }))
            }
            Err(err) => {
                log::error!("tenant list failed: {:#}", err);
                Response::error(500, "internal", "tenant list failed")
            }
        },
        ("POST", ["admin", "tenants", id, action @ ("revoke" | "reactivate")]) => {
            let Ok(tenant_id) = id.parse::<i64>() else {
                return Response::error(400, "bad_request", "tenant id must be an integer");
            };
            let result = if *action == "revoke" {
                engine.tenants().revoke_tenant(tenant_id)
            } else {
                engine.tenants().reactivate_tenant(tenant_id)
            };
            match result {
                Ok(count) => Response::ok(serde_json::json!({
                    "status": if *action == "revoke" { "revoked" } else { "reactivated" },
                    "count": count,
                })),
                Err(err) => Response::error(404, "not_found", &format!("{:#}", err)),
            }
        }
        _ => Response::error(404, "not_found", "no such admin endpoint"),
    }
}
