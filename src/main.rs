use std::path::PathBuf;

use clap::Parser;
use jarvis_core::config::{resolve_config, CliArgs};
use jarvis_core::{build_app_state, http, shutdown, Result};

const CONFIG_FILE_NAME: &str = "config.json";

#[tokio::main]
async fn main() -> Result<()> {
    let logs = jarvis_core::logging::init();

    let cli = CliArgs::parse();
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jarvis-core");
    let config_file = config_dir.join(CONFIG_FILE_NAME);

    let config = resolve_config(cli, &config_file)?;
    if !config.auto_start {
        tracing::info!("auto_start is disabled; configuration resolved, exiting");
        return Ok(());
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = build_app_state(config, logs).await?;
    let app = http::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr.as_str()).await?;
    tracing::info!(%bind_addr, "jarvis-core listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());
    server.await?;

    shutdown(&state).await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
