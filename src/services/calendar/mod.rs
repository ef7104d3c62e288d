//! Calendar provider abstraction.
//!
//! One `CalendarProvider` implementation per vendor, selected by
//! `CalendarProviderKind`. Write access is an optional capability exposed
//! through `event_writer`.

pub mod apple;
pub mod google;
pub mod import;
pub mod oauth;
pub mod outlook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::config::CalendarConfig;
use crate::db::models::{CalendarEvent, CalendarProviderKind, EventDraft, SyncStatus};
use crate::db::repository::CalendarConnectionRepository;
use crate::error::{AppError, AppResult};

pub use apple::AppleCalendar;
pub use google::GoogleCalendar;
pub use import::{CalendarImporter, ImportReport};
pub use oauth::{OAuthStateSigner, ProviderContext};
pub use outlook::OutlookCalendar;

pub const DEFAULT_DAYS_AHEAD: u32 = 30;

/// Where to send the user to grant calendar access.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub provider: CalendarProviderKind,
    pub authorization_url: String,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn kind(&self) -> CalendarProviderKind;

    async fn is_connected(&self) -> bool;

    /// Build the vendor authorization URL. The flow completes through the
    /// callback route, which calls `complete_connection`.
    fn connect(&self, return_path: Option<&str>) -> AppResult<AuthorizationRequest>;

    async fn complete_connection(&self, code: &str) -> AppResult<SyncStatus>;

    async fn disconnect(&self) -> AppResult<()>;

    async fn get_sync_status(&self) -> AppResult<SyncStatus>;

    /// Upcoming events in `[now, now + days_ahead]`, ordered by start.
    async fn fetch_events(&self, days_ahead: u32) -> AppResult<Vec<CalendarEvent>>;

    fn event_writer(&self) -> Option<&dyn CalendarEventWriter> {
        None
    }
}

#[async_trait]
pub trait CalendarEventWriter: Send + Sync {
    async fn create_event(&self, draft: &EventDraft) -> AppResult<CalendarEvent>;
    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> AppResult<CalendarEvent>;
    async fn delete_event(&self, event_id: &str) -> AppResult<()>;
}

pub fn build_provider(
    kind: CalendarProviderKind,
    ctx: ProviderContext,
    config: &CalendarConfig,
) -> Arc<dyn CalendarProvider> {
    match kind {
        CalendarProviderKind::Google => Arc::new(GoogleCalendar::new(ctx, config.google.clone())),
        CalendarProviderKind::Apple => Arc::new(AppleCalendar::new(ctx, config.apple.clone())),
        CalendarProviderKind::Outlook => Arc::new(OutlookCalendar::new(
            ctx,
            config.outlook.clone(),
            &config.outlook_tenant,
        )),
    }
}

/// All adapters, keyed by provider.
#[derive(Clone)]
pub struct CalendarProviders {
    providers: HashMap<CalendarProviderKind, Arc<dyn CalendarProvider>>,
}

impl CalendarProviders {
    pub fn new(ctx: ProviderContext, config: &CalendarConfig) -> Self {
        let providers = CalendarProviderKind::ALL
            .iter()
            .map(|kind| (*kind, build_provider(*kind, ctx.clone(), config)))
            .collect();
        Self { providers }
    }

    pub fn get(&self, kind: CalendarProviderKind) -> AppResult<&Arc<dyn CalendarProvider>> {
        self.providers
            .get(&kind)
            .ok_or_else(|| AppError::NotFound(format!("Calendar provider {}", kind)))
    }
}

/// Shared `is_connected`/`get_sync_status`/`disconnect` behavior backed by the
/// connection row.
pub(crate) async fn stored_status(
    pool: &sqlx::SqlitePool,
    kind: CalendarProviderKind,
) -> AppResult<SyncStatus> {
    let conn = CalendarConnectionRepository::find(pool, kind).await?;
    Ok(SyncStatus::from_connection(conn.as_ref()))
}

/// Only local paths or absolute URLs on the frontend origin are accepted as
/// post-connect destinations.
pub fn sanitize_return_path(raw: Option<&str>, frontend_base: &str) -> String {
    const FALLBACK: &str = "/settings/calendar";
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return FALLBACK.to_string();
    };

    if raw.starts_with('/') && !raw.starts_with("//") {
        return raw.to_string();
    }
    if let (Ok(target), Ok(front)) = (url::Url::parse(raw), url::Url::parse(frontend_base)) {
        if target.origin() == front.origin() {
            return raw.to_string();
        }
    }

    tracing::warn!("Rejected unsafe calendar return path: {}", raw);
    FALLBACK.to_string()
}

/// Frontend URL for a return path; absolute URLs are used as-is.
pub fn compose_return_url(frontend_base: &str, return_path: &str) -> String {
    if return_path.starts_with("http://") || return_path.starts_with("https://") {
        return_path.to_string()
    } else {
        format!("{}{}", frontend_base.trim_end_matches('/'), return_path)
    }
}

/// Parse a vendor timestamp: RFC 3339, a naive UTC date-time (Graph with
/// `Prefer: outlook.timezone="UTC"`), or an all-day date.
pub(crate) fn parse_vendor_time(raw: &str) -> Option<chrono::DateTime<Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_path_rejects_foreign_origins() {
        let front = "http://localhost:3000";
        assert_eq!(sanitize_return_path(Some("/planner"), front), "/planner");
        assert_eq!(
            sanitize_return_path(Some("http://localhost:3000/planner"), front),
            "http://localhost:3000/planner"
        );
        assert_eq!(
            sanitize_return_path(Some("//evil.example"), front),
            "/settings/calendar"
        );
        assert_eq!(
            sanitize_return_path(Some("https://evil.example/x"), front),
            "/settings/calendar"
        );
        assert_eq!(sanitize_return_path(None, front), "/settings/calendar");
    }

    #[test]
    fn return_url_joins_relative_paths() {
        assert_eq!(
            compose_return_url("http://localhost:3000/", "/planner"),
            "http://localhost:3000/planner"
        );
        assert_eq!(
            compose_return_url("http://localhost:3000", "http://localhost:3000/x"),
            "http://localhost:3000/x"
        );
    }

    #[test]
    fn vendor_times_parse_in_all_shapes() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 18, 30, 0).unwrap();
        assert_eq!(parse_vendor_time("2025-03-01T19:30:00+01:00"), Some(expected));
        assert_eq!(parse_vendor_time("2025-03-01T18:30:00.0000000"), Some(expected));
        assert_eq!(
            parse_vendor_time("2025-03-01"),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_vendor_time("tomorrow"), None);
    }
}
