#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use script_exporter_api::config::ServerConfig;
use script_exporter_api::router::build_app_router;
use script_exporter_api::state::AppState;
use script_exporter_core::dispatcher::Dispatcher;
use script_exporter_core::runner::ProcessRunner;
use script_exporter_core::telemetry::ExporterMetrics;

/// A running application plus the scratch directory holding its scripts.
pub struct TestApp {
    pub router: Router,
    pub metrics: Arc<ExporterMetrics>,
    pub scripts: TempDir,
}

/// Build a test `ServerConfig` that resolves scripts under `script_dir`.
///
/// Scripts get 2 seconds; the request timeout stays well above that.
pub fn test_config(script_dir: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        script_path: script_dir.to_path_buf(),
        script_timeout_secs: 2,
        request_timeout_secs: 30,
        ..ServerConfig::default()
    }
}

/// Write an executable script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Build the full application with the default test configuration.
pub fn build_test_app() -> TestApp {
    build_test_app_with(|_| {})
}

/// Build the full application, letting the caller adjust the configuration.
///
/// Uses the same router builder as `main.rs`, so tests exercise the
/// production middleware stack. Must be called inside a Tokio runtime.
pub fn build_test_app_with(configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let scripts = tempfile::tempdir().unwrap();
    let mut config = test_config(scripts.path());
    configure(&mut config);
    config.validate().unwrap();

    let metrics = Arc::new(ExporterMetrics::new().unwrap());
    let runner = Arc::new(ProcessRunner::new().kill_process_group(config.kill_process_group));
    let (dispatcher, _handle) =
        Dispatcher::start(config.dispatcher_settings(), runner, Arc::clone(&metrics));

    let state = AppState {
        config: Arc::new(config.clone()),
        dispatcher,
        metrics: Arc::clone(&metrics),
    };

    TestApp {
        router: build_app_router(state, &config),
        metrics,
        scripts,
    }
}

/// Send a GET request through the router.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Sum of a counter family's value for one script.
pub fn counter(metrics: &ExporterMetrics, name: &str, script: &str) -> f64 {
    metrics
        .registry()
        .gather()
        .into_iter()
        .filter(|mf| mf.get_name() == name)
        .flat_map(|mf| mf.get_metric().to_vec())
        .filter(|m| m.get_label().iter().any(|l| l.get_value() == script))
        .map(|m| m.get_counter().get_value())
        .sum()
}

/// Value of a gauge family for one script, zero when the series is absent.
pub fn gauge(metrics: &ExporterMetrics, name: &str, script: &str) -> f64 {
    metrics
        .registry()
        .gather()
        .into_iter()
        .filter(|mf| mf.get_name() == name)
        .flat_map(|mf| mf.get_metric().to_vec())
        .filter(|m| m.get_label().iter().any(|l| l.get_value() == script))
        .map(|m| m.get_gauge().get_value())
        .sum()
}
