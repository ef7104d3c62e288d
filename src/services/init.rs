//! Initialization helpers for the application:
//! - database connection + migrations
//! - construction of the shared services that make up `AppState`
//!
//! This module keeps the wiring out of `main.rs`.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;

use crate::config::Config;
use crate::db::repository::{ReminderStore, SqliteKeyValueStorage};
use crate::services::calendar::{
    CalendarImporter, CalendarProviders, OAuthStateSigner, ProviderContext,
};
use crate::services::notifications::{NotificationDispatcher, NotificationTemplate};
use crate::services::permission::{PermissionGateway, PermissionPolicy};
use crate::services::platform::{DesktopNotifier, NotificationPlatform};
use crate::services::proxy::UpstreamProxy;
use crate::services::scheduler::ReminderScheduler;
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", scheme, host, port_part, url.path())
    } else if let Some(at_pos) = db_url.find('@') {
        format!("(redacted){}", &db_url[at_pos + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool and run migrations.
///
/// The parent directory of the database file is created when missing.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub async fn memory_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

pub fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.proxy.timeout_seconds))
        .build()?)
}

/// Desktop notifications are skipped entirely when the operator denies them.
pub fn build_notification_platform(config: &Config) -> Option<Arc<dyn NotificationPlatform>> {
    match config.notifications.desktop {
        PermissionPolicy::Denied => {
            tracing::info!("Desktop notifications disabled; reminders go to in-process listeners only");
            None
        }
        policy => Some(Arc::new(DesktopNotifier::new(
            policy,
            config.server.frontend_url.clone(),
        ))),
    }
}

/// Build every shared service on top of an opened pool.
pub fn build_state(
    config: Config,
    pool: sqlx::SqlitePool,
    platform: Option<Arc<dyn NotificationPlatform>>,
) -> Result<Arc<AppState>> {
    let http = build_http_client(&config)?;

    let store = ReminderStore::new(
        Arc::new(SqliteKeyValueStorage::new(pool.clone())),
        config.store.reminder_key.clone(),
    );

    let gateway = Arc::new(PermissionGateway::new(platform));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        gateway.clone(),
        NotificationTemplate::from(&config.notifications),
    ));
    let scheduler = Arc::new(ReminderScheduler::from_config(
        &config.scheduler,
        store.clone(),
        dispatcher.clone(),
    ));

    let oauth_state = Arc::new(OAuthStateSigner::new(config.jwt.secret.clone()));
    let calendars = CalendarProviders::new(
        ProviderContext {
            pool: pool.clone(),
            http: http.clone(),
            signer: oauth_state.clone(),
            public_url: config.server.public_url.clone(),
        },
        &config.calendar,
    );
    let importer = CalendarImporter::new(
        store.clone(),
        chrono::Duration::hours(config.scheduler.import_lead_hours),
    );
    let proxy = UpstreamProxy::from_config(&config.proxy, http);

    Ok(Arc::new(AppState {
        db: pool,
        config,
        store,
        gateway,
        dispatcher,
        scheduler,
        calendars,
        importer,
        proxy,
        oauth_state,
    }))
}
