//! HTTP surface: routes, request validation, SSE framing, and
//! error-to-status-code mapping. Wiring only — every handler delegates
//! straight into the registry, generation manager, or sandbox for its
//! actual behaviour.

mod auth;
mod sse;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AppConfig;
use crate::error::Result;
use crate::generation::actions::Action;
use crate::generation::prompt::HistoryEntry;
use crate::generation::{GenerationManager, GenerationRequest, StreamEvent};
use crate::logging::LogBuffer;
use crate::registry::metadata::ModelMetadata;
use crate::registry::ModelRegistry;
use crate::sandbox::{CommandSpec, ReadOptions, RunOptions, Sandbox};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a route handler needs, cloned cheaply into each request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: ModelRegistry,
    pub generation: Arc<GenerationManager>,
    pub sandbox: Arc<Sandbox>,
    pub logs: LogBuffer,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/logs", get(get_logs))
        .route("/status", get(get_status))
        .route("/models", get(list_models))
        .route("/models/stream", get(sse::stream_models))
        .route("/models/:id/download", post(download_model))
        .route("/models/:id/activate", post(activate_model))
        .route("/models/:id", delete(remove_model))
        .route("/models/:id/progress", get(get_progress))
        .route("/chat/completions", post(chat_completions))
        .route("/actions/open", post(actions_open))
        .route("/actions/read", post(actions_read))
        .route("/actions/run", post(actions_run))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_token))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.masked())
}

async fn get_logs(State(state): State<AppState>) -> Json<Vec<crate::logging::LogRecord>> {
    Json(state.logs.snapshot())
}

#[derive(Serialize)]
struct StatusResponse {
    model: crate::generation::GenerationStatus,
    roots: Vec<std::path::PathBuf>,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        model: state.generation.status().await,
        roots: state.sandbox.roots().to_vec(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelMetadata>> {
    Json(state.registry.list_models().await)
}

#[derive(Deserialize)]
struct DownloadRequest {
    repo_id: String,
    filename: String,
    #[serde(default)]
    hf_token: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

async fn download_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(request): Json<DownloadRequest>,
) -> Result<Response> {
    let metadata = state
        .registry
        .start_download(
            model_id,
            request.repo_id,
            request.filename,
            request.hf_token,
            request.checksum,
            request.tags.into_iter().map(|t| t.to_lowercase()).collect(),
        )
        .await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(metadata)).into_response())
}

#[derive(Serialize)]
struct ActivateResponse {
    #[serde(flatten)]
    metadata: ModelMetadata,
    runtime: crate::generation::GenerationStatus,
}

/// Loads the model, then flips the registry's ACTIVE flag only once
/// that succeeds. If the registry rejects the flip (e.g. a concurrent
/// removal), the freshly loaded model is unloaded rather than left
/// dangling.
async fn activate_model(State(state): State<AppState>, Path(model_id): Path<String>) -> Result<Json<ActivateResponse>> {
    let metadata = state.registry.get_metadata(&model_id).await?;
    state.generation.load_from_metadata(&metadata).await?;
    let activated = match state.registry.activate_model(&model_id).await {
        Ok(activated) => activated,
        Err(err) => {
            state.generation.unload_model().await;
            return Err(err);
        }
    };
    let runtime = state.generation.status().await;
    Ok(Json(ActivateResponse {
        metadata: activated,
        runtime,
    }))
}

async fn remove_model(State(state): State<AppState>, Path(model_id): Path<String>) -> Result<axum::http::StatusCode> {
    let removed = state.registry.remove_model(&model_id).await?;
    if removed.state == crate::registry::metadata::ModelState::Active {
        state.generation.unload_model().await;
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn get_progress(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<crate::registry::progress::ProgressRecord>> {
    Ok(Json(state.registry.get_progress(&model_id).await?))
}

#[derive(Deserialize)]
struct ChatRequest {
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    stream: bool,
}

#[derive(Serialize)]
struct ChatResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    actions: Option<Vec<Action>>,
}

async fn chat_completions(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Result<Response> {
    let generation_request = GenerationRequest {
        prompt: request.prompt,
        system_prompt: request.system_prompt,
        history: request.history,
    };

    if !request.stream {
        let result = state.generation.generate(generation_request).await?;
        return Ok(Json(ChatResponse {
            message: result.message,
            actions: result.actions,
        })
        .into_response());
    }

    let events = state.generation.generate_stream(generation_request).await?;
    let stream = tokio_stream::wrappers::ReceiverStream::new(events)
        .map(|event| Ok::<_, std::convert::Infallible>(to_sse_event(&event)));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"))
        .into_response())
}

fn to_sse_event(event: &StreamEvent) -> axum::response::sse::Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    axum::response::sse::Event::default().data(payload)
}

#[derive(Deserialize)]
struct OpenRequest {
    path: String,
}

async fn actions_open(State(state): State<AppState>, Json(request): Json<OpenRequest>) -> Result<Response> {
    let result = state.sandbox.open(&request.path).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize)]
struct ReadRequest {
    path: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default = "default_max_bytes")]
    max_bytes: usize,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_max_bytes() -> usize {
    65_536
}

async fn actions_read(State(state): State<AppState>, Json(request): Json<ReadRequest>) -> Result<Response> {
    let options = ReadOptions {
        encoding: request.encoding,
        offset: request.offset,
        length: request.length,
        max_bytes: request.max_bytes,
    };
    let result = state.sandbox.read(&request.path, options).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandJson {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Deserialize)]
struct RunRequest {
    command: CommandJson,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default = "default_timeout_secs")]
    timeout: u64,
    #[serde(default)]
    shell: bool,
}

fn default_timeout_secs() -> u64 {
    60
}

async fn actions_run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Result<Response> {
    let command = match request.command {
        CommandJson::Argv(parts) => CommandSpec::Argv(parts),
        CommandJson::Shell(text) => CommandSpec::Shell(text),
    };
    let options = RunOptions {
        cwd: request.cwd,
        timeout: Duration::from_secs(request.timeout),
        shell: request.shell,
    };
    let result = state.sandbox.run(command, options).await?;
    Ok(Json(result).into_response())
}
