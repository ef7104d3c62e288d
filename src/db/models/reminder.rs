use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Reminder Models (persisted as one JSON document in the key-value store)
// ============================================================================

/// Reminder identifier. New reminders get UUID strings; numeric ids written by
/// older clients are kept as numbers so the stored document round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReminderId {
    Numeric(i64),
    Text(String),
}

impl ReminderId {
    pub fn generate() -> Self {
        ReminderId::Text(uuid::Uuid::new_v4().to_string())
    }

    /// Parse an id coming from a URL path segment.
    pub fn from_path(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => ReminderId::Numeric(n),
            Err(_) => ReminderId::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for ReminderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReminderId::Numeric(n) => write!(f, "{}", n),
            ReminderId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderRecord {
    pub id: ReminderId,
    pub reminder_date: DateTime<Utc>,
    pub event_date: DateTime<Utc>,
    pub occasion: String,
    pub message: String,
    #[serde(default)]
    pub shopping_links: Vec<String>,
    #[serde(default)]
    pub notified: bool,
    pub created_at: DateTime<Utc>,
    /// Calendar event this reminder was imported from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
}

impl ReminderRecord {
    /// Due: reminder time has passed and nothing was dispatched yet.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.notified && self.reminder_date <= now
    }

    /// Expired: the event lies more than `retention` before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.event_date < now - retention
    }

    /// Tag used for system notifications; a second dispatch of the same id
    /// replaces the pending notification instead of stacking a new one.
    pub fn notification_tag(&self) -> String {
        format!("outfit-reminder-{}", self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReminder {
    pub reminder_date: DateTime<Utc>,
    pub event_date: DateTime<Utc>,
    pub occasion: String,
    pub message: String,
    #[serde(default)]
    pub shopping_links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
}

impl NewReminder {
    pub fn into_record(self, now: DateTime<Utc>) -> ReminderRecord {
        ReminderRecord {
            id: ReminderId::generate(),
            reminder_date: self.reminder_date,
            event_date: self.event_date,
            occasion: self.occasion,
            message: self.message,
            shopping_links: self.shopping_links,
            notified: false,
            created_at: now,
            source_event_id: self.source_event_id,
        }
    }
}
