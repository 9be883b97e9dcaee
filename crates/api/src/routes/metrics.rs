//! Metrics endpoints.
//!
//! `{prefix}` and `{prefix}/` serve the exporter's own metrics.
//! `{prefix}/{script}` runs one script and serves what it printed.

use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use script_exporter_core::context::RunContext;
use script_exporter_core::exposition::{self, Gatherer};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

fn text_response(body: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response()
}

fn encode(gatherer: &dyn Gatherer) -> AppResult<Response> {
    Ok(text_response(exposition::encode_text(gatherer)?))
}

/// GET {prefix} -- the exporter's own counters plus process metrics.
async fn own_metrics(State(state): State<AppState>) -> AppResult<Response> {
    encode(state.metrics.registry())
}

/// GET {prefix}/{*script} -- run `script` and expose its output.
async fn script_metrics(
    State(state): State<AppState>,
    script: Result<Path<String>, PathRejection>,
) -> AppResult<Response> {
    let Path(script) = script.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;

    let ctx = RunContext::with_timeout(state.config.script_timeout());
    // Dropping the handler (client went away) cancels the run.
    let _cancel_on_drop = ctx.cancel_on_drop();

    let output = match state.dispatcher.execute(&script, ctx).await.into_result() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(script = %script, error = %e, "Error running script");
            return Err(e.into());
        }
    };

    let body = exposition::assemble(state.config.output_format(), &output)
        .map_err(AppError::from)
        .and_then(|gatherer| exposition::encode_text(gatherer.as_ref()).map_err(AppError::from));

    match body {
        Ok(body) => Ok(text_response(body)),
        Err(e) => {
            state.metrics.record_parse_error(&script);
            tracing::warn!(script = %script, error = %e, "Error parsing script output");
            Err(e)
        }
    }
}

/// Mount the metrics routes under `prefix`, which must start with `/` and
/// have no trailing `/`.
pub fn router(prefix: &str) -> Router<AppState> {
    Router::new()
        .route(prefix, get(own_metrics))
        .route(&format!("{prefix}/"), get(own_metrics))
        .route(&format!("{prefix}/{{*script}}"), get(script_metrics))
}
