use std::sync::Arc;

use script_exporter_core::dispatcher::Dispatcher;
use script_exporter_core::telemetry::ExporterMetrics;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: every field is an `Arc` or a handle.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Handle to the admission loop that runs scripts.
    pub dispatcher: Dispatcher,
    /// The exporter's own metrics, served at the bare telemetry path.
    pub metrics: Arc<ExporterMetrics>,
}
