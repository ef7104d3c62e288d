use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::db::models::{NewReminder, ReminderId, ReminderRecord};
use crate::error::{AppError, AppResult};
use crate::services::notifications::REMINDER_EVENT_CHANNEL;
use crate::services::scheduler::SweepReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_reminders).post(create_reminder))
        .route("/sweep", post(sweep_now))
        .route("/events", get(reminder_events))
        .route("/:id", delete(dismiss_reminder))
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReminderRequest {
    pub reminder_date: DateTime<Utc>,
    pub event_date: DateTime<Utc>,
    pub occasion: String,
    pub message: String,
    #[serde(default)]
    pub shopping_links: Vec<String>,
}

impl CreateReminderRequest {
    fn validate(self) -> AppResult<NewReminder> {
        let occasion = self.occasion.trim().to_string();
        let message = self.message.trim().to_string();
        if occasion.is_empty() {
            return Err(AppError::Validation("occasion must not be empty".to_string()));
        }
        if message.is_empty() {
            return Err(AppError::Validation("message must not be empty".to_string()));
        }
        for link in &self.shopping_links {
            let valid = url::Url::parse(link)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                return Err(AppError::Validation(format!(
                    "shopping link is not an http(s) URL: {}",
                    link
                )));
            }
        }

        Ok(NewReminder {
            reminder_date: self.reminder_date,
            event_date: self.event_date,
            occasion,
            message,
            shopping_links: self.shopping_links,
            source_event_id: None,
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_reminders(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<ReminderRecord>>> {
    Ok(Json(state.store.list().await?))
}

async fn create_reminder(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateReminderRequest>,
) -> AppResult<(StatusCode, Json<ReminderRecord>)> {
    let record = state.store.create(request.validate()?).await?;
    tracing::info!(
        "Created reminder {} for '{}' due {}",
        record.id,
        record.occasion,
        record.reminder_date
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn dismiss_reminder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = ReminderId::from_path(&id);
    if state.store.dismiss(&id).await? {
        tracing::info!("Dismissed reminder {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Reminder {}", id)))
    }
}

/// Run a sweep now instead of waiting for the next timer tick.
async fn sweep_now(State(state): State<Arc<AppState>>) -> Json<SweepReport> {
    Json(state.scheduler.sweep().await)
}

/// Server-sent stream of `outfit-reminder` events.
async fn reminder_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.dispatcher.subscribe();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(record) => {
                    match Event::default()
                        .event(REMINDER_EVENT_CHANNEL)
                        .id(record.id.to_string())
                        .json_data(&record)
                    {
                        Ok(event) => return Some((Ok(event), receiver)),
                        Err(e) => tracing::warn!("Failed to encode reminder event: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Reminder event listener lagged; {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
