//! Credential-attaching forwarder for the upstream AI/search services.
//!
//! The browser never sees the API keys: it calls `/api/proxy/{service}/...`
//! and this module replays the request against the fixed upstream host with
//! the server-held credential. Upstream responses are passed back as-is.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::{
    body::Bytes,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error, warn};

use crate::config::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamService {
    /// OpenAI chat/completions.
    Chat,
    /// Replicate image generation.
    Image,
    /// remove.bg background removal.
    Background,
    /// FASHN virtual try-on.
    Tryon,
    /// Serper web/shopping search.
    Search,
}

impl UpstreamService {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamService::Chat => "chat",
            UpstreamService::Image => "image",
            UpstreamService::Background => "background",
            UpstreamService::Tryon => "tryon",
            UpstreamService::Search => "search",
        }
    }
}

impl fmt::Display for UpstreamService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpstreamService {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(UpstreamService::Chat),
            "image" => Ok(UpstreamService::Image),
            "background" => Ok(UpstreamService::Background),
            "tryon" => Ok(UpstreamService::Tryon),
            "search" => Ok(UpstreamService::Search),
            other => Err(ProxyError::UnknownService(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    Bearer,
    Header(&'static str),
}

#[derive(Debug, Clone)]
struct ProxyTarget {
    base_url: String,
    credential: Option<String>,
    auth: AuthStyle,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Unknown upstream service: {0}")]
    UnknownService(String),

    #[error("Upstream service '{0}' is not configured")]
    NotConfigured(UpstreamService),

    #[error("Invalid upstream path: {0}")]
    InvalidPath(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProxyError::UnknownService(_) => (StatusCode::NOT_FOUND, "unknown_service"),
            ProxyError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured"),
            ProxyError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "invalid_path"),
            ProxyError::Upstream(e) => {
                error!("Proxy upstream failure: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "proxy_error")
            }
        };

        let body = serde_json::json!({
            "error": code,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Raw upstream answer, relayed unchanged.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        if let Some(content_type) = self.content_type {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Outgoing request as received from the client.
#[derive(Debug)]
pub struct ProxyRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub content_type: Option<&'a HeaderValue>,
    pub body: Bytes,
}

pub struct UpstreamProxy {
    http: reqwest::Client,
    targets: HashMap<UpstreamService, ProxyTarget>,
    timeout: Duration,
}

impl UpstreamProxy {
    pub fn from_config(config: &ProxyConfig, http: reqwest::Client) -> Self {
        let targets = HashMap::from([
            (
                UpstreamService::Chat,
                ProxyTarget {
                    base_url: config.openai_base_url.clone(),
                    credential: config.openai_api_key.clone(),
                    auth: AuthStyle::Bearer,
                },
            ),
            (
                UpstreamService::Image,
                ProxyTarget {
                    base_url: config.replicate_base_url.clone(),
                    credential: config.replicate_api_token.clone(),
                    auth: AuthStyle::Bearer,
                },
            ),
            (
                UpstreamService::Background,
                ProxyTarget {
                    base_url: config.remove_bg_base_url.clone(),
                    credential: config.remove_bg_api_key.clone(),
                    auth: AuthStyle::Header("X-Api-Key"),
                },
            ),
            (
                UpstreamService::Tryon,
                ProxyTarget {
                    base_url: config.fashn_base_url.clone(),
                    credential: config.fashn_api_key.clone(),
                    auth: AuthStyle::Bearer,
                },
            ),
            (
                UpstreamService::Search,
                ProxyTarget {
                    base_url: config.serper_base_url.clone(),
                    credential: config.serper_api_key.clone(),
                    auth: AuthStyle::Header("X-API-KEY"),
                },
            ),
        ]);

        Self {
            http,
            targets,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn is_configured(&self, service: UpstreamService) -> bool {
        self.targets
            .get(&service)
            .is_some_and(|t| t.credential.is_some())
    }

    fn target(&self, service: UpstreamService) -> Result<(&ProxyTarget, &str), ProxyError> {
        let target = self
            .targets
            .get(&service)
            .ok_or(ProxyError::NotConfigured(service))?;
        let credential = target
            .credential
            .as_deref()
            .ok_or(ProxyError::NotConfigured(service))?;
        Ok((target, credential))
    }

    /// Join the upstream base with the client path. Traversal segments are
    /// rejected so a client cannot escape the service's API prefix.
    pub fn upstream_url(
        base_url: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<String, ProxyError> {
        let path = path.trim_start_matches('/');
        if path.split('/').any(|segment| segment == ".." || segment == ".")
            || path.contains('\\')
            || path.contains("://")
        {
            return Err(ProxyError::InvalidPath(path.to_string()));
        }

        let mut url = format!("{}/{}", base_url.trim_end_matches('/'), path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    pub async fn forward(
        &self,
        service: UpstreamService,
        request: ProxyRequest<'_>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let (target, credential) = self.target(service)?;
        let url = Self::upstream_url(&target.base_url, request.path, request.query)?;
        debug!("Proxying {} {} to {}", request.method, request.path, service);

        let mut builder = self
            .http
            .request(request.method, &url)
            .timeout(self.timeout)
            .header(header::ACCEPT, "application/json");
        builder = match target.auth {
            AuthStyle::Bearer => builder.bearer_auth(credential),
            AuthStyle::Header(name) => builder.header(name, credential),
        };
        if let Some(content_type) = request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type.clone());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Upstream {} answered {}", service, status);
        }
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
