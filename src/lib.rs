//! Jarvis Core: a local HTTP service that manages the lifecycle of
//! large language models on a developer workstation — downloading
//! artifacts, tracking their state, activating exactly one model at a
//! time, serving chat completions (including streaming), and exposing
//! a sandboxed filesystem/command surface the model's output can
//! drive.
//!
//! # Example
//!
//! ```no_run
//! use jarvis_core::config::AppConfig;
//!
//! # async fn run(config: AppConfig) -> anyhow::Result<()> {
//! let logs = jarvis_core::logging::init();
//! let state = jarvis_core::build_app_state(config, logs).await?;
//! let app = jarvis_core::http::create_router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod generation;
pub mod http;
pub mod logging;
pub mod registry;
pub mod sandbox;

use std::sync::Arc;

use config::AppConfig;
use generation::GenerationManager;
use http::AppState;
use logging::LogBuffer;
use registry::ModelRegistry;
use sandbox::Sandbox;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Wires up the registry, generation manager, and sandbox for `config`
/// and starts their background tasks (the generation manager's 5s
/// process-metrics sampler). Used by both `main.rs` and integration
/// tests that need a fully assembled `AppState`.
pub async fn build_app_state(config: AppConfig, logs: LogBuffer) -> Result<AppState> {
    let registry = ModelRegistry::load(config.models_dir.clone()).await?;

    let generation = Arc::new(GenerationManager::new());
    Arc::clone(&generation).start().await;

    // Root allow-list for the sandboxed action surface: the process
    // working directory and the registry's storage root.
    let cwd = std::env::current_dir()?;
    let sandbox = Arc::new(Sandbox::new([cwd, config.models_dir.clone()]));

    Ok(AppState {
        config: Arc::new(config),
        registry,
        generation,
        sandbox,
        logs,
    })
}

/// Cancels background tasks and in-flight downloads. Best-effort;
/// called on graceful shutdown (SIGINT/SIGTERM).
pub async fn shutdown(state: &AppState) {
    state.registry.shutdown().await;
    state.generation.shutdown().await;
}
