use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use super::CalendarProvider;
use crate::db::models::{CalendarEvent, NewReminder, ReminderRecord};
use crate::db::repository::reminder_store::push_new;
use crate::db::repository::ReminderStore;
use crate::error::AppResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub reminders: Vec<ReminderRecord>,
}

/// Stable reference from a reminder back to the calendar event it came from.
pub fn source_event_id(event: &CalendarEvent) -> String {
    format!("{}:{}", event.provider, event.id)
}

/// Reminders for upcoming events that were not imported before. Each is due
/// `lead` before the event starts, or right away if that moment has passed.
pub fn plan_import(
    events: &[CalendarEvent],
    existing: &[ReminderRecord],
    lead: Duration,
    now: DateTime<Utc>,
) -> Vec<NewReminder> {
    let mut seen: HashSet<String> = existing
        .iter()
        .filter_map(|r| r.source_event_id.clone())
        .collect();

    events
        .iter()
        .filter(|event| event.start > now)
        .filter(|event| seen.insert(source_event_id(event)))
        .map(|event| {
            let message = match &event.location {
                Some(location) => format!("Plan your outfit for {} at {}", event.title, location),
                None => format!("Plan your outfit for {}", event.title),
            };
            NewReminder {
                reminder_date: std::cmp::max(event.start - lead, now),
                event_date: event.start,
                occasion: event.title.clone(),
                message,
                shopping_links: Vec::new(),
                source_event_id: Some(source_event_id(event)),
            }
        })
        .collect()
}

/// Pulls upcoming calendar events into the reminder store.
pub struct CalendarImporter {
    store: ReminderStore,
    lead: Duration,
}

impl CalendarImporter {
    pub fn new(store: ReminderStore, lead: Duration) -> Self {
        Self { store, lead }
    }

    pub async fn import(
        &self,
        provider: &dyn CalendarProvider,
        days_ahead: u32,
    ) -> AppResult<ImportReport> {
        let events = provider.fetch_events(days_ahead).await?;
        let now = Utc::now();

        // Planning and insertion share one store cycle so concurrent imports
        // cannot both add the same event.
        let (reminders, skipped) = self
            .store
            .modify(|records| {
                let planned = plan_import(&events, records, self.lead, now);
                let skipped = events.len() - planned.len();
                let created: Vec<ReminderRecord> = planned
                    .into_iter()
                    .map(|new| push_new(records, new, now))
                    .collect();
                (created, skipped)
            })
            .await?;
        info!(
            "Imported {} reminder(s) from {} ({} skipped)",
            reminders.len(),
            provider.kind(),
            skipped
        );

        Ok(ImportReport {
            imported: reminders.len(),
            skipped,
            reminders,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::db::models::{CalendarProviderKind, SyncStatus};
    use crate::db::repository::kv_store::memory::MemoryKeyValueStorage;
    use crate::error::AppError;
    use crate::services::calendar::AuthorizationRequest;

    struct FixedCalendar {
        events: Vec<CalendarEvent>,
    }

    #[async_trait]
    impl CalendarProvider for FixedCalendar {
        fn kind(&self) -> CalendarProviderKind {
            CalendarProviderKind::Google
        }

        async fn is_connected(&self) -> bool {
            true
        }

        fn connect(&self, _return_path: Option<&str>) -> AppResult<AuthorizationRequest> {
            Err(AppError::Unsupported("fixed".to_string()))
        }

        async fn complete_connection(&self, _code: &str) -> AppResult<SyncStatus> {
            Err(AppError::Unsupported("fixed".to_string()))
        }

        async fn disconnect(&self) -> AppResult<()> {
            Ok(())
        }

        async fn get_sync_status(&self) -> AppResult<SyncStatus> {
            Ok(SyncStatus::from_connection(None))
        }

        async fn fetch_events(&self, _days_ahead: u32) -> AppResult<Vec<CalendarEvent>> {
            Ok(self.events.clone())
        }
    }

    fn event(id: &str, start: DateTime<Utc>) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            provider: CalendarProviderKind::Google,
            title: format!("Event {}", id),
            start,
            end: None,
            location: None,
            description: None,
        }
    }

    #[test]
    fn reminder_is_due_lead_time_before_event() {
        let now = Utc::now();
        let start = now + Duration::days(3);
        let planned = plan_import(&[event("a", start)], &[], Duration::hours(24), now);

        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].reminder_date, start - Duration::hours(24));
        assert_eq!(planned[0].event_date, start);
        assert_eq!(planned[0].source_event_id.as_deref(), Some("google:a"));
    }

    #[test]
    fn imminent_event_is_due_immediately_and_past_events_are_skipped() {
        let now = Utc::now();
        let planned = plan_import(
            &[
                event("soon", now + Duration::hours(2)),
                event("past", now - Duration::hours(2)),
            ],
            &[],
            Duration::hours(24),
            now,
        );

        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].reminder_date, now);
    }

    #[tokio::test]
    async fn importing_twice_does_not_duplicate() {
        let now = Utc::now();
        let calendar = FixedCalendar {
            events: vec![
                event("a", now + Duration::days(2)),
                event("b", now + Duration::days(5)),
            ],
        };
        let store = ReminderStore::new(Arc::new(MemoryKeyValueStorage::new()), "outfit_reminders");
        let importer = CalendarImporter::new(store.clone(), Duration::hours(24));

        let first = importer.import(&calendar, 30).await.unwrap();
        let second = importer.import(&calendar, 30).await.unwrap();

        assert_eq!(first.imported, 2);
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(store.load().await.len(), 2);
    }
}
