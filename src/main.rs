use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
mod middleware;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::{body::Body, response::IntoResponse, Json};
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use db::repository::ReminderStore;
use services::{
    calendar::{CalendarImporter, CalendarProviders, OAuthStateSigner},
    init,
    notifications::NotificationDispatcher,
    permission::PermissionGateway,
    proxy::UpstreamProxy,
    scheduler::ReminderScheduler,
};

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub store: ReminderStore,
    pub gateway: Arc<PermissionGateway>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub scheduler: Arc<ReminderScheduler>,
    pub calendars: CalendarProviders,
    pub importer: CalendarImporter,
    pub proxy: UpstreamProxy,
    pub oauth_state: Arc<OAuthStateSigner>,
}

/// Governor rejections in the proxy's `{error, message}` envelope.
fn rate_limited_response(error: GovernorError) -> http::Response<Body> {
    let (status, message, retry_after) = match error {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limit exceeded; retry in {}s", wait_time),
            Some(wait_time),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::BAD_REQUEST,
            "Unable to determine client IP for rate limiting".to_string(),
            None,
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Rate limiting error".to_string(),
            None,
        ),
    };

    let mut resp = (
        status,
        Json(serde_json::json!({ "error": "rate_limited", "message": message })),
    )
        .into_response();
    if let Some(secs) = retry_after {
        resp.headers_mut()
            .insert(http::header::RETRY_AFTER, HeaderValue::from(secs));
    }
    resp
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outfit_reminders=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Outfit Reminders Service");

    let pool = init::init_db(&config).await?;
    let platform = init::build_notification_platform(&config);
    let app_state = init::build_state(config.clone(), pool, platform)?;

    // Request notification permission and start the periodic sweep.
    app_state.scheduler.initialize().await;

    // Upstream proxy limiter
    let mut proxy_builder = GovernorConfigBuilder::default();
    proxy_builder.per_second(config.rate_limit.proxy_per_second.into());
    proxy_builder.burst_size(config.rate_limit.proxy_burst);
    proxy_builder.key_extractor(SmartIpKeyExtractor);
    proxy_builder.error_handler(rate_limited_response);
    let proxy_gov_conf = Arc::new(
        proxy_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build proxy governor config"))?,
    );

    // Forget idle client keys once a minute.
    let proxy_cleaner = {
        let limiter = proxy_gov_conf.limiter().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                limiter.retain_recent();
                tracing::debug!("proxy rate limiter size: {}", limiter.len());
            }
        })
    };

    let proxy_rate_layer = GovernorLayer {
        config: proxy_gov_conf.clone(),
    };

    let frontend_origin = config
        .server
        .frontend_url
        .parse::<HeaderValue>()
        .map_err(|e| anyhow::anyhow!("Invalid FRONTEND_URL for CORS: {}", e))?;

    // Build router
    let app = routes::api_router()
        // AI and search upstreams (rate limited per client IP)
        .nest(
            "/api/proxy",
            routes::proxy::router().layer(proxy_rate_layer),
        )
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn(middleware::csp::csp_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(frontend_origin)
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                    http::Method::PATCH,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                ])
                .allow_credentials(true),
        );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received; server future dropped to stop accepting new connections");
        }
    }

    app_state.scheduler.stop();
    proxy_cleaner.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
