pub mod calendar;
pub mod health;
pub mod notifications;
pub mod proxy;
pub mod reminders;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

/// Every endpoint except the rate-limited upstream proxy, which `main`
/// nests under `/api/proxy` with its governor layer.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/reminders", reminders::router())
        .nest("/api/notifications", notifications::router())
        .nest("/api/calendar", calendar::router())
}
