//! Generation manager: single-writer lifecycle over at most one loaded
//! model, plus blocking and streaming generation.

pub mod backend;
pub mod prompt;
pub mod actions;

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{JarvisError, Result};
use crate::registry::metadata::ModelMetadata;

use backend::{make_backend, Backend, BackendKind, ChunkStream};
use prompt::{build_prompt, HistoryEntry};

const METRICS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_NEW_TOKENS: usize = 256;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemMetrics {
    pub rss: u64,
    pub vms: u64,
    pub percent: f32,
    pub system_total: u64,
    pub system_available: u64,
    pub system_percent: f32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationStatus {
    pub model_id: Option<String>,
    pub backend: Option<BackendKind>,
    pub metrics: Option<SystemMetrics>,
}

struct LoadedModel {
    model_id: String,
    backend_kind: BackendKind,
    backend: Box<dyn Backend>,
    max_new_tokens: usize,
}

pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationResult {
    pub message: String,
    pub actions: Option<Vec<actions::Action>>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { delta: String },
    Result {
        message: String,
        actions: Option<Vec<actions::Action>>,
    },
    Error { message: String },
}

/// Owns the 0-or-1 loaded model and the periodic metrics sampler.
pub struct GenerationManager {
    lifecycle: Mutex<Option<LoadedModel>>,
    generation: Mutex<()>,
    metrics: RwLock<Option<SystemMetrics>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    pid: Pid,
}

impl GenerationManager {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(None),
            generation: Mutex::new(()),
            metrics: RwLock::new(None),
            sampler: Mutex::new(None),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Launches the 5-second process-metrics sampler. Takes `Arc<Self>`
    /// by value (clone before calling if the caller still needs its
    /// own handle) since the sampler task outlives this call.
    pub async fn start(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut system = System::new_all();
            loop {
                tokio::time::sleep(METRICS_INTERVAL).await;
                system.refresh_all();
                let metrics = system.process(manager.pid).map(|process| {
                    let total = system.total_memory();
                    let available = system.available_memory();
                    SystemMetrics {
                        rss: process.memory(),
                        vms: process.virtual_memory(),
                        percent: if total > 0 {
                            process.memory() as f32 / total as f32 * 100.0
                        } else {
                            0.0
                        },
                        system_total: total,
                        system_available: available,
                        system_percent: if total > 0 {
                            (total - available) as f32 / total as f32 * 100.0
                        } else {
                            0.0
                        },
                    }
                });
                *manager.metrics.write().await = metrics;
            }
        });
        *self.sampler.lock().await = Some(handle);
    }

    /// Cancels the sampler and unloads the model.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sampler.lock().await.take() {
            handle.abort();
        }
        self.unload_model().await;
    }

    /// Resolves backend kind from the metadata, unloads any current
    /// model, and loads the new one.
    pub async fn load_from_metadata(&self, metadata: &ModelMetadata) -> Result<()> {
        let local_path = metadata
            .local_path
            .as_ref()
            .ok_or_else(|| JarvisError::Conflict(format!("model '{}' has no local artifact", metadata.model_id)))?;
        let backend_kind = BackendKind::resolve(local_path, &metadata.tags);

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(mut current) = lifecycle.take() {
            current.backend.unload().await;
        }

        let mut backend = make_backend(backend_kind);
        let path = local_path.clone();
        backend.load(&path).await?;

        *lifecycle = Some(LoadedModel {
            model_id: metadata.model_id.clone(),
            backend_kind,
            backend,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        });
        Ok(())
    }

    /// Drops the model handle. Idempotent.
    pub async fn unload_model(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(mut current) = lifecycle.take() {
            current.backend.unload().await;
        }
    }

    pub async fn status(&self) -> GenerationStatus {
        let lifecycle = self.lifecycle.lock().await;
        GenerationStatus {
            model_id: lifecycle.as_ref().map(|m| m.model_id.clone()),
            backend: lifecycle.as_ref().map(|m| m.backend_kind),
            metrics: self.metrics.read().await.clone(),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Blocking generation: builds the prompt, runs the backend under
    /// the `generation` lock, then parses actions out of the result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let prompt = build_prompt(
            &request.prompt,
            request.system_prompt.as_deref(),
            &request.history,
        );

        let _generation_guard = self.generation.lock().await;
        let lifecycle = self.lifecycle.lock().await;
        let model = lifecycle.as_ref().ok_or(JarvisError::NotLoaded)?;

        let raw = model.backend.complete(&prompt, model.max_new_tokens).await?;
        let (message, actions) = actions::parse_actions(&raw);
        Ok(GenerationResult { message, actions })
    }

    /// Streaming generation: forwards backend chunks verbatim, then
    /// emits a single terminal `result` (or `error`) event computed
    /// from the accumulated buffer.
    pub async fn generate_stream(&self, request: GenerationRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let prompt = build_prompt(
            &request.prompt,
            request.system_prompt.as_deref(),
            &request.history,
        );

        let (tx, rx) = mpsc::channel(64);

        let _generation_guard = self.generation.lock().await;
        let lifecycle = self.lifecycle.lock().await;
        let model = lifecycle.as_ref().ok_or(JarvisError::NotLoaded)?;
        let mut backend_stream: ChunkStream = model.backend.stream(&prompt, model.max_new_tokens).await?;

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(delta) = backend_stream.recv().await {
                buffer.push_str(&delta);
                if tx.send(StreamEvent::Chunk { delta }).await.is_err() {
                    return;
                }
            }
            let (message, actions) = actions::parse_actions(&buffer);
            let _ = tx.send(StreamEvent::Result { message, actions }).await;
        });

        Ok(rx)
    }
}

impl Default for GenerationManager {
    fn default() -> Self {
        Self::new()
    }
}
