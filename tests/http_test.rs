//! Router-level coverage of the HTTP surface: real requests through
//! `axum::Router` via `tower::ServiceExt::oneshot`, no socket.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use jarvis_core::config::AppConfig;
use jarvis_core::generation::GenerationManager;
use jarvis_core::http::{self, AppState};
use jarvis_core::registry::metadata::{ModelMetadata, ModelState};
use jarvis_core::registry::{HubClient, ModelRegistry};
use jarvis_core::sandbox::Sandbox;
use jarvis_core::{build_app_state, logging::LogBuffer};
use tower::ServiceExt;

/// Never touches the network: used by tests that need to exercise
/// `start_download`'s bookkeeping without a live model hub.
struct StubHub;

#[async_trait::async_trait]
impl HubClient for StubHub {
    async fn probe(&self, _repo_id: &str, _filename: &str, _hf_token: Option<&str>) -> jarvis_core::error::Result<Option<u64>> {
        Ok(None)
    }
}

async fn build_state_with_stub_hub(token: Option<&str>) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::load_with_hub(dir.path().to_path_buf(), Arc::new(StubHub))
        .await
        .unwrap();
    let generation = Arc::new(GenerationManager::new());
    Arc::clone(&generation).start().await;
    let sandbox = Arc::new(Sandbox::new([dir.path().to_path_buf()]));
    let config = AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        models_dir: dir.path().to_path_buf(),
        token: token.map(str::to_string),
        auto_start: true,
    };
    let state = AppState {
        config: Arc::new(config),
        registry,
        generation,
        sandbox,
        logs: shared_logs(),
    };
    (state, dir)
}

static LOGS: OnceLock<LogBuffer> = OnceLock::new();

fn shared_logs() -> LogBuffer {
    LOGS.get_or_init(logging_init).clone()
}

fn logging_init() -> LogBuffer {
    jarvis_core::logging::init()
}

async fn build_state(token: Option<&str>) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        models_dir: dir.path().to_path_buf(),
        token: token.map(str::to_string),
        auto_start: true,
    };
    let state = build_app_state(config, shared_logs()).await.unwrap();
    (state, dir)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_auth(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", token)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_is_ok_without_a_configured_token() {
    let (state, _dir) = build_state(None).await;
    let app = http::create_router(state);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_token_is_rejected_when_one_is_configured() {
    let (state, _dir) = build_state(Some("s3cr3t")).await;
    let app = http::create_router(state);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn matching_token_is_accepted() {
    let (state, _dir) = build_state(Some("s3cr3t")).await;
    let app = http::create_router(state);
    let response = app.oneshot(get_with_auth("/health", "s3cr3t")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn config_masks_the_token() {
    let (state, _dir) = build_state(Some("s3cr3t")).await;
    let app = http::create_router(state);
    let response = app.oneshot(get_with_auth("/config", "s3cr3t")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["token"], "***");
}

/// No model loaded yields a 503 with the literal `detail` message.
#[tokio::test]
async fn chat_without_a_loaded_model_is_503() {
    let (state, _dir) = build_state(None).await;
    let app = http::create_router(state);
    let response = app.oneshot(post_json("/chat/completions", r#"{"prompt":"hi"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["detail"], "No model is currently loaded");
}

/// The generation backends are deterministic stand-ins for real
/// inference kernels, so this exercises the request/response plumbing —
/// parsing, routing through the generation manager, shaping
/// `ChatResponse` — without a backend that happens to emit a fenced
/// actions block.
#[tokio::test]
async fn chat_with_a_loaded_model_returns_its_completion() {
    let (state, dir) = build_state(None).await;
    let artifact = dir.path().join("model.safetensors");
    tokio::fs::write(&artifact, b"stub-weights").await.unwrap();

    let mut metadata = ModelMetadata::new("alpha");
    metadata.state = ModelState::Ready;
    metadata.local_path = Some(artifact);
    state.generation.load_from_metadata(&metadata).await.unwrap();

    let app = http::create_router(state);
    let response = app
        .oneshot(post_json("/chat/completions", r#"{"prompt":"hey there"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["message"].as_str().unwrap().starts_with("Acknowledged:"));
    assert!(body.get("actions").is_none());
}

/// A command that outlives its timeout is killed and reported as a 504.
#[tokio::test]
async fn actions_run_times_out_with_504() {
    let (state, _dir) = build_state(None).await;
    let app = http::create_router(state);
    let response = app
        .oneshot(post_json("/actions/run", r#"{"command":["sleep","5"],"timeout":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = json_body(response).await;
    assert_eq!(body["detail"], "Command timed out");
}

#[tokio::test]
async fn actions_open_rejects_paths_outside_the_sandbox() {
    let (state, _dir) = build_state(None).await;
    let app = http::create_router(state);
    let response = app
        .oneshot(post_json("/actions/open", r#"{"path":"/etc/passwd"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn removing_an_unknown_model_is_404() {
    let (state, _dir) = build_state(None).await;
    let app = http::create_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/models/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn activating_an_unready_model_is_409() {
    let (state, _dir) = build_state_with_stub_hub(None).await;
    state
        .registry
        .start_download(
            "alpha".into(),
            "org/demo".into(),
            "model.bin".into(),
            None,
            None,
            Default::default(),
        )
        .await
        .unwrap();

    let app = http::create_router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/models/alpha/activate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
