//! HTTP branch routes: landing page, info/status queries and metrics.

use crate::error::Error;
use crate::metrics::PrometheusMetrics;
use crate::quake::{InfoResponse, OobClient, StatusResponse};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Game server address shown to browsers and queried out-of-band.
    pub server_addr: String,
    pub client: OobClient,
    pub metrics: Arc<PrometheusMetrics>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Resolution { .. } | Error::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn http_router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT]);
    Router::new()
        .route("/", get(index))
        .route("/info", get(info))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(cors)
        .with_state(state)
}

/// GET / renders a minimal landing page carrying the server address.
async fn index(State(state): State<HttpState>) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html><head><title>q3gate</title></head>\
         <body data-server-addr=\"{addr}\"><p>Game server: {addr}</p></body></html>\n",
        addr = escape_html(&state.server_addr)
    ))
}

async fn info(State(state): State<HttpState>) -> Result<Json<InfoResponse>, Error> {
    let info = state.client.get_info(&state.server_addr).await?;
    Ok(Json(info))
}

async fn status(State(state): State<HttpState>) -> Result<Json<StatusResponse>, Error> {
    let status = state.client.get_status(&state.server_addr).await?;
    Ok(Json(status))
}

async fn metrics(State(state): State<HttpState>) -> Result<Response, Error> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        let timeout = Error::Timeout {
            addr: "x".into(),
            timeout: std::time::Duration::from_secs(5),
        };
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            Error::Protocol("bad".into()).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::process("ioq3ded", "gone").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn escapes_address() {
        assert_eq!(escape_html("<a&b>\""), "&lt;a&amp;b&gt;&quot;");
    }
}
