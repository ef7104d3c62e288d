use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, patch, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{CalendarEvent, CalendarProviderKind, EventDraft, SyncStatus};
use crate::error::{AppError, AppResult};
use crate::services::calendar::{
    compose_return_url, sanitize_return_path, CalendarEventWriter, CalendarProvider,
    ImportReport, DEFAULT_DAYS_AHEAD,
};
use crate::AppState;

const MAX_DAYS_AHEAD: u32 = 365;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(overview))
        .route("/:provider/connect", get(connect))
        .route("/:provider/callback", get(callback_query).post(callback_form))
        .route("/:provider/disconnect", post(disconnect))
        .route("/:provider/status", get(status))
        .route("/:provider/events", get(list_events).post(create_event))
        .route(
            "/:provider/events/:event_id",
            patch(update_event).delete(delete_event),
        )
        .route("/:provider/import", post(import_events))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub return_path: Option<String>,
}

/// Provider redirect parameters. Apple posts them as a form, the others use
/// the query string.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub days_ahead: Option<u32>,
}

impl EventsQuery {
    fn days(&self) -> AppResult<u32> {
        match self.days_ahead {
            None => Ok(DEFAULT_DAYS_AHEAD),
            Some(days) if (1..=MAX_DAYS_AHEAD).contains(&days) => Ok(days),
            Some(days) => Err(AppError::Validation(format!(
                "days_ahead must be between 1 and {}, got {}",
                MAX_DAYS_AHEAD, days
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub provider: CalendarProviderKind,
    pub name: &'static str,
    #[serde(flatten)]
    pub status: SyncStatus,
}

fn provider(state: &AppState, raw: &str) -> AppResult<Arc<dyn CalendarProvider>> {
    let kind = raw
        .parse::<CalendarProviderKind>()
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(state.calendars.get(kind)?.clone())
}

fn writer(provider: &dyn CalendarProvider) -> AppResult<&dyn CalendarEventWriter> {
    provider.event_writer().ok_or_else(|| {
        AppError::Unsupported(format!("{} does not support writing events", provider.kind()))
    })
}

fn validate_draft(draft: &EventDraft) -> AppResult<()> {
    if draft.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    if let Some(end) = draft.end {
        if end < draft.start {
            return Err(AppError::Validation(
                "event end must not precede its start".to_string(),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn overview(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<ProviderStatus>>> {
    let mut statuses = Vec::with_capacity(CalendarProviderKind::ALL.len());
    for kind in CalendarProviderKind::ALL {
        let status = state.calendars.get(kind)?.get_sync_status().await?;
        statuses.push(ProviderStatus {
            provider: kind,
            name: kind.display_name(),
            status,
        });
    }
    Ok(Json(statuses))
}

async fn connect(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> AppResult<Redirect> {
    let provider = provider(&state, &raw)?;
    let return_path = sanitize_return_path(
        query.return_path.as_deref(),
        &state.config.server.frontend_url,
    );
    let request = provider.connect(Some(return_path.as_str()))?;
    tracing::info!("Starting {} calendar authorization", request.provider);
    Ok(Redirect::to(&request.authorization_url))
}

async fn callback_query(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(params): Query<CallbackParams>,
) -> AppResult<Redirect> {
    finish_connection(&state, &raw, params).await
}

async fn callback_form(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Form(params): Form<CallbackParams>,
) -> AppResult<Redirect> {
    finish_connection(&state, &raw, params).await
}

/// Verify the signed state, exchange the code and send the browser back to
/// the frontend with the outcome in the query string.
async fn finish_connection(
    state: &AppState,
    raw: &str,
    params: CallbackParams,
) -> AppResult<Redirect> {
    let provider = provider(state, raw)?;
    let kind = provider.kind();
    let frontend = &state.config.server.frontend_url;

    let claims = state
        .oauth_state
        .verify(params.state.as_deref().unwrap_or_default(), kind)?;
    let return_path = sanitize_return_path(claims.return_path.as_deref(), frontend);

    let outcome = match (params.error, params.code) {
        (Some(error), _) => Err(params.error_description.unwrap_or(error)),
        (None, None) => Err("missing authorization code".to_string()),
        (None, Some(code)) => provider
            .complete_connection(&code)
            .await
            .map_err(|e| e.to_string()),
    };

    let base = compose_return_url(frontend, &return_path);
    let separator = if base.contains('?') { '&' } else { '?' };
    let target = match outcome {
        Ok(status) => {
            tracing::info!(
                "Connected {} calendar{}",
                kind,
                status
                    .account_email
                    .as_deref()
                    .map(|e| format!(" for {}", e))
                    .unwrap_or_default()
            );
            format!("{}{}calendar={}&status=connected", base, separator, kind)
        }
        Err(message) => {
            tracing::warn!("{} calendar connection failed: {}", kind, message);
            format!(
                "{}{}calendar={}&status=error&message={}",
                base,
                separator,
                kind,
                urlencoding::encode(&message)
            )
        }
    };

    Ok(Redirect::to(&target))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> AppResult<StatusCode> {
    let provider = provider(&state, &raw)?;
    provider.disconnect().await?;
    tracing::info!("Disconnected {} calendar", provider.kind());
    Ok(StatusCode::NO_CONTENT)
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> AppResult<Json<SyncStatus>> {
    Ok(Json(provider(&state, &raw)?.get_sync_status().await?))
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<Vec<CalendarEvent>>> {
    let days = query.days()?;
    Ok(Json(provider(&state, &raw)?.fetch_events(days).await?))
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Json(draft): Json<EventDraft>,
) -> AppResult<(StatusCode, Json<CalendarEvent>)> {
    validate_draft(&draft)?;
    let provider = provider(&state, &raw)?;
    let event = writer(provider.as_ref())?.create_event(&draft).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path((raw, event_id)): Path<(String, String)>,
    Json(draft): Json<EventDraft>,
) -> AppResult<Json<CalendarEvent>> {
    validate_draft(&draft)?;
    let provider = provider(&state, &raw)?;
    Ok(Json(
        writer(provider.as_ref())?
            .update_event(&event_id, &draft)
            .await?,
    ))
}

async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path((raw, event_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let provider = provider(&state, &raw)?;
    writer(provider.as_ref())?.delete_event(&event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Turn upcoming events into outfit reminders.
async fn import_events(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<ImportReport>> {
    let days = query.days()?;
    let provider = provider(&state, &raw)?;
    Ok(Json(state.importer.import(provider.as_ref(), days).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn days_ahead_is_bounded() {
        assert_eq!(EventsQuery { days_ahead: None }.days().unwrap(), DEFAULT_DAYS_AHEAD);
        assert_eq!(EventsQuery { days_ahead: Some(7) }.days().unwrap(), 7);
        assert!(EventsQuery { days_ahead: Some(0) }.days().is_err());
        assert!(EventsQuery { days_ahead: Some(366) }.days().is_err());
    }

    #[test]
    fn drafts_need_a_title_and_ordered_times() {
        let start = Utc::now();
        let mut draft = EventDraft {
            title: "Gala".to_string(),
            start,
            end: Some(start + Duration::hours(2)),
            location: None,
            description: None,
        };
        assert!(validate_draft(&draft).is_ok());

        draft.end = Some(start - Duration::hours(1));
        assert!(matches!(validate_draft(&draft), Err(AppError::Validation(_))));

        draft.end = None;
        draft.title = "  ".to_string();
        assert!(matches!(validate_draft(&draft), Err(AppError::Validation(_))));
    }
}
