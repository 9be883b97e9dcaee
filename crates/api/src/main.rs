use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use script_exporter_api::config::ServerConfig;
use script_exporter_api::router::build_app_router;
use script_exporter_api::state::AppState;
use script_exporter_core::dispatcher::Dispatcher;
use script_exporter_core::runner::ProcessRunner;
use script_exporter_core::telemetry::ExporterMetrics;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "script_exporter_api=debug,script_exporter_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        host = %config.host,
        port = config.port,
        telemetry_path = %config.telemetry_path,
        script_path = %config.script_path.display(),
        format = config.output_format().as_str(),
        timeout_secs = config.script_timeout_secs,
        workers = config.script_workers,
        "Loaded server configuration",
    );

    // --- Metrics ---
    let metrics = Arc::new(ExporterMetrics::new().expect("Failed to register exporter metrics"));

    // --- Dispatcher ---
    let runner = Arc::new(ProcessRunner::new().kill_process_group(config.kill_process_group));
    let (dispatcher, dispatcher_handle) =
        Dispatcher::start(config.dispatcher_settings(), runner, Arc::clone(&metrics));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        dispatcher,
        metrics,
    };

    // --- Router ---
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Unable to setup HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    // Serving has ended and every dispatcher handle is gone, so the admission
    // loop exits once the scripts still running have finished.
    tracing::info!("Server stopped accepting connections, waiting for running scripts");
    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    match tokio::time::timeout(drain, dispatcher_handle).await {
        Ok(Ok(())) => tracing::info!("Dispatcher stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Dispatcher task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Scripts still running after shutdown timeout",
        ),
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
