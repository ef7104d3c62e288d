use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, Method, Uri},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;

use crate::services::proxy::{ProxyError, ProxyRequest, UpstreamResponse, UpstreamService};
use crate::AppState;

/// Image payloads (try-on, background removal) are larger than axum's 2 MB default.
const MAX_PROXY_BODY_BYTES: usize = 20 * 1024 * 1024;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_services))
        .route("/:service/*path", any(forward))
        .layer(DefaultBodyLimit::max(MAX_PROXY_BODY_BYTES))
}

#[derive(Debug, Serialize)]
pub struct ServiceAvailability {
    pub service: &'static str,
    pub configured: bool,
}

async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceAvailability>> {
    let services = [
        UpstreamService::Chat,
        UpstreamService::Image,
        UpstreamService::Background,
        UpstreamService::Tryon,
        UpstreamService::Search,
    ];
    Json(
        services
            .into_iter()
            .map(|service| ServiceAvailability {
                service: service.as_str(),
                configured: state.proxy.is_configured(service),
            })
            .collect(),
    )
}

async fn forward(
    State(state): State<Arc<AppState>>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, ProxyError> {
    let service = service.parse::<UpstreamService>()?;
    state
        .proxy
        .forward(
            service,
            ProxyRequest {
                method,
                path: &path,
                query: uri.query(),
                content_type: headers.get(header::CONTENT_TYPE),
                body,
            },
        )
        .await
}
