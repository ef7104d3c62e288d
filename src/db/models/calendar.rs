use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Calendar Connection Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarProviderKind {
    Google,
    Apple,
    Outlook,
}

impl CalendarProviderKind {
    pub const ALL: [CalendarProviderKind; 3] = [
        CalendarProviderKind::Google,
        CalendarProviderKind::Apple,
        CalendarProviderKind::Outlook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarProviderKind::Google => "google",
            CalendarProviderKind::Apple => "apple",
            CalendarProviderKind::Outlook => "outlook",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            CalendarProviderKind::Google => "Google Calendar",
            CalendarProviderKind::Apple => "Apple Calendar",
            CalendarProviderKind::Outlook => "Outlook Calendar",
        }
    }
}

impl fmt::Display for CalendarProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown calendar provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for CalendarProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" => Ok(CalendarProviderKind::Google),
            "apple" | "icloud" => Ok(CalendarProviderKind::Apple),
            "outlook" | "microsoft" => Ok(CalendarProviderKind::Outlook),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Stored state of one provider connection (`calendar_connections` table).
#[derive(Debug, Clone)]
pub struct CalendarConnection {
    pub provider: CalendarProviderKind,
    pub is_active: bool,
    pub calendar_email: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarConnection {
    /// Access token that is still valid for at least `margin_secs`.
    pub fn usable_access_token(&self, now: DateTime<Utc>, margin_secs: i64) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        match self.token_expires_at {
            Some(exp) if exp - chrono::Duration::seconds(margin_secs) <= now => None,
            _ => Some(token),
        }
    }
}

/// Tokens obtained from a completed authorization flow.
#[derive(Debug, Clone)]
pub struct ConnectionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub calendar_email: Option<String>,
}

// ============================================================================
// Provider-neutral API shapes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub provider: CalendarProviderKind,
    pub title: String,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_connected: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub account_email: Option<String>,
}

impl SyncStatus {
    pub fn from_connection(conn: Option<&CalendarConnection>) -> Self {
        match conn {
            Some(c) => SyncStatus {
                is_connected: c.is_active,
                last_sync_time: c.last_sync_at,
                error: c.last_error.clone(),
                account_email: c.calendar_email.clone(),
            },
            None => SyncStatus {
                is_connected: false,
                last_sync_time: None,
                error: None,
                account_email: None,
            },
        }
    }
}
