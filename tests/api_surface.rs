//! API surface behavior: health, client-submitted alerts, clip assembly
//! endpoints, and the error contract.

mod common;

use common::*;
use std::time::Duration;

#[test]
fn health_needs_no_credentials() {
    let server = TestServer::start(RecordingMail::working(), None);
    let (status, _, body) = server.get_raw("/health");
    assert_eq!(status, 200);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].as_str().unwrap().contains('T'));
    server.stop();
}

/// A client that performs its own detection submits a preformed alert; the
/// pipeline still runs dedup, evidence, and dispatch.
#[test]
fn client_submitted_alert_publishes_and_delivers() {
    let mail = RecordingMail::working();
    let server = TestServer::start(mail.clone(), None);
    let (_, credential) = server.create_tenant("Acme", Some("ops@acme.example"));

    server.buffer_frames(&credential, "cam-pos", 30, 20);
    let (status, body) = server.post(
        "/alert",
        &credential,
        serde_json::json!({
            "narrative": "till opened with no sale",
            "incident_type": "register-tamper",
            "risk": "HIGH",
            "frame_count": 20,
            "source_id": "cam-pos",
        }),
    );
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], true);
    assert_eq!(body["recipient"], "ops@acme.example");
    assert_eq!(body["storage_location"], "local");
    assert!(body["evidence_url"].as_str().unwrap().starts_with("local://"));

    assert_eq!(mail.sent_count(), 1);
    let sent = mail.sent.lock().unwrap()[0].clone();
    assert!(sent.body.contains("till opened with no sale"));
    assert!(sent.body.contains("risk HIGH"));
    assert!(sent.subject.contains("register-tamper"));
    assert_eq!(server.local_clips().len(), 1);

    // The same submitted scene inside the cooldown is suppressed.
    let (status, body) = server.post(
        "/alert",
        &credential,
        serde_json::json!({
            "narrative": "till opened with no sale",
            "incident_type": "register-tamper",
            "risk": "HIGH",
            "frame_count": 20,
            "source_id": "cam-pos",
        }),
    );
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], false);
    assert_eq!(body["suppressed"], true);
    assert_eq!(mail.sent_count(), 1);
    server.stop();
}

/// Alerts for a tenant without a contact address are a 400, not a spool.
#[test]
fn alert_without_contact_address_is_rejected() {
    let mail = RecordingMail::working();
    let server = TestServer::start(mail.clone(), None);
    let (_, credential) = server.create_tenant("No Contact Inc", None);

    server.buffer_frames(&credential, "cam-1", 5, 20);
    let (status, body) = server.post(
        "/alert",
        &credential,
        serde_json::json!({
            "narrative": "n",
            "incident_type": "k",
            "source_id": "cam-1",
        }),
    );
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "tenant_state");
    assert!(body["error"].as_str().unwrap().contains("contact address"));
    assert_eq!(mail.sent_count(), 0);
    assert!(server.spooled_alerts().is_empty());
    server.stop();
}

/// Alerts may reference a source that never buffered with us; the alert is
/// dispatched without evidence.
#[test]
fn alert_for_unbuffered_source_goes_out_without_evidence() {
    let mail = RecordingMail::working();
    let server = TestServer::start(mail.clone(), None);
    let (_, credential) = server.create_tenant("Acme", Some("ops@acme.example"));

    let (status, body) = server.post(
        "/alert",
        &credential,
        serde_json::json!({
            "narrative": "external detector fired",
            "incident_type": "intrusion",
            "source_id": "external-1",
        }),
    );
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], true);
    assert_eq!(body["storage_location"], "none");
    assert!(body["evidence_url"].is_null());
    assert_eq!(mail.sent_count(), 1);
    assert!(mail.sent.lock().unwrap()[0]
        .body
        .contains("Evidence clip unavailable"));
    server.stop();
}

#[test]
fn assemble_and_compress_round_trip() {
    let server = TestServer::start(RecordingMail::working(), None);
    let (_, credential) = server.create_tenant("Acme", None);

    let frames: Vec<String> = (0..10).map(|_| base64_jpeg(40)).collect();
    let (status, body) = server.post(
        "/evidence/assemble",
        &credential,
        serde_json::json!({ "frames": frames, "fps": 10 }),
    );
    assert_eq!(status, 200);
    assert_eq!(body["frame_count"].as_u64().unwrap(), 10);
    assert_eq!(body["fps"].as_u64().unwrap(), 10);
    assert_eq!(body["oversized"], false);
    use base64::Engine as _;
    let clip = base64::engine::general_purpose::STANDARD
        .decode(body["clip"].as_str().unwrap())
        .unwrap();
    assert_eq!(&clip[4..8], b"ftyp");
    assert_eq!(clip.len() as u64, body["byte_size"].as_u64().unwrap());

    // Compression applies the budget rules; an absurd budget steps down to
    // the floor and reports the clip oversized.
    let (status, body) = server.post(
        "/evidence/compress",
        &credential,
        serde_json::json!({ "frames": frames, "fps": 25, "max_size_mb": 0 }),
    );
    assert_eq!(status, 200);
    assert_eq!(body["oversized"], true);
    assert_eq!(body["fps"].as_u64().unwrap(), 10);
    assert!(body["scale"].as_f64().unwrap() < 1.0);
    server.stop();
}

#[test]
fn error_contract_is_stable() {
    let server = TestServer::start(RecordingMail::working(), None);
    let (_, credential) = server.create_tenant("Acme", None);

    // Missing credential.
    let (status, _, body) = server.get_raw("/usage");
    assert_eq!(status, 401);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error_code"], "unauthorized");

    // Unknown route.
    let (status, body) = server.get("/nope", &credential);
    assert_eq!(status, 404);
    assert_eq!(body["error_code"], "not_found");

    // Wrong method on a known route.
    let (status, body) = server.get("/alert", &credential);
    assert_eq!(status, 405);
    assert_eq!(body["error_code"], "method_not_allowed");

    // Malformed JSON body.
    let result = ureq::post(&format!("{}/analyze/on-demand", server.base_url))
        .set("X-API-Key", &credential)
        .set("Content-Type", "application/json")
        .send_string("{not json");
    let (status, body) = response_to_json(result);
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "bad_request");

    // Invalid source ids.
    let (status, body) = server.post(
        "/buffer/frame",
        &credential,
        serde_json::json!({
            "source_id": "has space",
            "frame_data": base64_jpeg(10),
        }),
    );
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "bad_request");

    // Garbage frame payload.
    let (status, body) = server.post(
        "/buffer/frame",
        &credential,
        serde_json::json!({
            "source_id": "cam-1",
            "frame_data": "!!!not base64!!!",
        }),
    );
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "bad_request");
    server.stop();
}

/// The retention sweep removes expired local clips and spooled alerts.
#[test]
fn retention_sweep_clears_old_artifacts() {
    let mail = RecordingMail::failing("relay down");
    let server = TestServer::start(mail.clone(), None);
    let (_, credential) = server.create_tenant("Acme", Some("ops@acme.example"));

    // Produce one local clip and one spooled alert.
    server.buffer_frames(&credential, "cam-1", 30, 20);
    server.vision.script_confirmed_detection("intrusion");
    let (status, _) = server.analyze(&credential, &["cam-1"]);
    assert_eq!(status, 200);
    assert!(wait_until(Duration::from_secs(10), || {
        !server.local_clips().is_empty() && !server.spooled_alerts().is_empty()
    }));

    // Zero retention treats everything as expired; the pass is the same one
    // the daemon and the cron binary run.
    let stats = vigil_core::sweeper::sweep_once(
        &server.dir.path().join("evidence"),
        &server.dir.path().join("alerts"),
        Duration::ZERO,
    );
    assert!(stats.deleted >= 2);
    assert!(server.local_clips().is_empty());
    assert!(server.spooled_alerts().is_empty());
    server.stop();
}
