use anyhow::{Context, Result};
use camera_control::{HttpCameraClient, ModelResolver};
use session_node::{router, AppState, Config, SessionController};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = telemetry::LogConfig::new("session-node").with_version(env!("CARGO_PKG_VERSION"));
    let _log_guard = telemetry::init_structured_logging(log_config);

    let config = Config::from_env()?;

    let camera = HttpCameraClient::new(&config.camera_base_url, config.camera_timeout)
        .context("failed to build camera client")?;
    let resolver = match &config.rules_file {
        Some(path) => ModelResolver::from_yaml_file(path)?,
        None => ModelResolver::default(),
    };

    let controller = SessionController::new(Arc::new(camera), resolver, config.controller.clone());
    let app = router(AppState {
        controller: controller.clone(),
        save_dir: config.save_dir.clone(),
    });

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        camera = %config.camera_base_url,
        version = common::VERSION,
        "session-node listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(stop_on_signal(controller))
        .await?;

    info!("session-node stopped");
    Ok(())
}

/// Waits for a termination signal, then stops the session through the same
/// path as `POST /v1/session/stop`. A start still in progress is cancelled.
async fn stop_on_signal(controller: SessionController) {
    shutdown_signal().await;
    match controller.stop().await {
        Ok(snapshot) => info!(phase = %snapshot.phase, "session stopped on shutdown"),
        Err(e) => warn!(error = %e, "failed to stop session on shutdown"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
