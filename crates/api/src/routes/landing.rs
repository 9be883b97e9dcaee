use axum::extract::State;
use axum::response::Html;
use axum::{routing::get, Router};

use crate::state::AppState;

/// GET / -- a minimal page pointing at the telemetry path.
async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Script Exporter</title></head>\n\
         <body>\n\
         <h1>Script Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        path = state.config.telemetry_path,
    ))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(landing))
}
