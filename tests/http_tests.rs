// HTTP API tests
//
// Requests go straight to the router with tower's oneshot; the voice session
// behind it runs on the shared fakes.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{
    FakeCaptureBackend, FakeDeviceRegistry, FakeDiagnostics, FakeOutput, FakeStore, FakeTransport,
};
use live_voice::audio::{
    AudioCapturePipeline, CaptureConfig, ContextRegistry, DeviceRegistry, OutputContext,
};
use live_voice::http::{create_router, AppState, OutputDevicesResponse, SessionDefaults, StatusResponse};
use live_voice::session::{ClientConfig, LiveConfig, SessionClient};
use live_voice::voice::{VoiceConfig, VoiceSession};
use live_voice::ConnectionState;
use serde_json::json;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    transport: Arc<FakeTransport>,
    backend: Arc<FakeCaptureBackend>,
}

fn app_with(backend: FakeCaptureBackend) -> TestApp {
    let transport = FakeTransport::new();
    let (store, _saved) = FakeStore::new();
    let client = SessionClient::new(
        transport.clone(),
        store,
        FakeDiagnostics::new(),
        ClientConfig::default(),
    );

    let backend = Arc::new(backend);
    let capture = AudioCapturePipeline::new(backend.clone(), CaptureConfig::default());
    let output = FakeOutput::new();
    let registry = FakeDeviceRegistry::with_devices(&["speakers", "headset"]);

    let voice = VoiceSession::new(
        client,
        capture,
        Arc::new(ContextRegistry::new()),
        move || Ok(output as Arc<dyn OutputContext>),
        Some(registry as Arc<dyn DeviceRegistry>),
        VoiceConfig::default(),
    )
    .unwrap();

    let defaults = SessionDefaults {
        model: "models/default".to_string(),
        config: LiveConfig::default(),
    };

    TestApp {
        router: create_router(AppState::new(Arc::new(voice), defaults)),
        transport,
        backend,
    }
}

fn app() -> TestApp {
    app_with(FakeCaptureBackend::new(16000))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health_check() {
    let app = app();

    let (status, body) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_status_when_idle() {
    let app = app();

    let (status, body) = send(&app.router, get("/session/status")).await;
    assert_eq!(status, StatusCode::OK);

    let parsed: StatusResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.status, ConnectionState::Disconnected);
    assert!(!parsed.connected);
    assert!(!parsed.capturing);
    assert_eq!(parsed.session_id, None);
}

#[tokio::test]
async fn test_connect_uses_default_model() {
    let app = app();

    let (status, body) = send(&app.router, post("/session/connect", json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["model"], "models/default");
    assert_eq!(parsed["status"], "connected");
    assert_eq!(app.transport.last().model, "models/default");

    // A second connect conflicts
    let (status, _) = send(
        &app.router,
        post("/session/connect", json!({ "model": "models/other" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.transport.connection_count(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_bad_gateway() {
    let app = app();
    app.transport
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let (status, _) = send(&app.router, post("/session/connect", json!({}))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_text_requires_connection() {
    let app = app();

    let (status, _) = send(&app.router, post("/session/text", json!({ "text": "hi" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    send(&app.router, post("/session/connect", json!({}))).await;
    let (status, _) = send(&app.router, post("/session/text", json!({ "text": "hi" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(app.transport.last().sent().len(), 1);
}

#[tokio::test]
async fn test_disconnect_reports_result() {
    let app = app();
    send(&app.router, post("/session/connect", json!({}))).await;

    let (status, body) = send(&app.router, post("/session/disconnect", json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["disconnected"], true);
    assert_eq!(parsed["status"], "disconnected");
}

#[tokio::test]
async fn test_capture_start_without_device_is_unavailable() {
    let mut backend = FakeCaptureBackend::new(16000);
    backend.unavailable = true;
    let app = app_with(backend);

    let (status, _) = send(&app.router, post("/capture/start", json!({ "mic": true }))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_capture_start_and_mute() {
    let app = app();

    let (status, _) = send(&app.router, post("/capture/start", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.backend.device_count(), 1);

    let (_, body) = send(&app.router, post("/capture/mute", json!({}))).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["muted"], true);

    let (status, _) = send(&app.router, post("/capture/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_output_devices() {
    let app = app();

    let (status, body) = send(&app.router, get("/devices/output")).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: OutputDevicesResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.devices.len(), 2);
    assert_eq!(parsed.active.unwrap().device_id, "speakers");

    let (status, body) = send(
        &app.router,
        post("/devices/output", json!({ "device_id": "headset" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: OutputDevicesResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.active.unwrap().device_id, "headset");

    let (status, _) = send(
        &app.router,
        post("/devices/output", json!({ "device_id": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
