use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::oauth::{OAuthClient, OAuthEndpoints, ProviderContext};
use super::{
    parse_vendor_time, stored_status, AuthorizationRequest, CalendarEventWriter, CalendarProvider,
};
use crate::config::OAuthClientConfig;
use crate::db::models::{CalendarEvent, CalendarProviderKind, EventDraft, SyncStatus};
use crate::db::repository::CalendarConnectionRepository;
use crate::error::{AppError, AppResult};

// https://developers.google.com/calendar/api/v3/reference/events
const GOOGLE_API_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const CALENDAR_ID: &str = "primary";
const PAGE_SIZE: &str = "250";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventTime {
    date_time: Option<String>,
    /// All-day events carry only a date.
    date: Option<String>,
}

impl GoogleEventTime {
    fn parse(&self) -> Option<DateTime<Utc>> {
        self.date_time
            .as_deref()
            .or(self.date.as_deref())
            .and_then(parse_vendor_time)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    start: GoogleEventTime,
    #[serde(default)]
    end: Option<GoogleEventTime>,
}

impl GoogleEvent {
    fn into_calendar_event(self) -> Option<CalendarEvent> {
        if self.status.as_deref() == Some("cancelled") {
            return None;
        }
        let start = self.start.parse()?;
        Some(CalendarEvent {
            id: self.id,
            provider: CalendarProviderKind::Google,
            title: self
                .summary
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "(untitled event)".to_string()),
            start,
            end: self.end.as_ref().and_then(GoogleEventTime::parse),
            location: self.location.filter(|s| !s.is_empty()),
            description: self.description.filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventsPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventDateTime {
    date_time: String,
    time_zone: &'static str,
}

impl GoogleEventDateTime {
    fn utc(at: DateTime<Utc>) -> Self {
        Self {
            date_time: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            time_zone: "UTC",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventAttributes {
    summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    start: GoogleEventDateTime,
    end: GoogleEventDateTime,
}

impl From<&EventDraft> for GoogleEventAttributes {
    fn from(draft: &EventDraft) -> Self {
        Self {
            summary: draft.title.clone(),
            description: draft.description.clone(),
            location: draft.location.clone(),
            start: GoogleEventDateTime::utc(draft.start),
            end: GoogleEventDateTime::utc(draft.end.unwrap_or(draft.start + Duration::hours(1))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
}

pub struct GoogleCalendar {
    oauth: OAuthClient,
}

impl GoogleCalendar {
    pub fn new(ctx: ProviderContext, credentials: OAuthClientConfig) -> Self {
        let endpoints = OAuthEndpoints {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/calendar.events",
                "https://www.googleapis.com/auth/userinfo.email",
            ],
            // Offline access plus forced consent so a refresh token is issued.
            extra_authorize_params: vec![
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
            ],
            scope_on_refresh: false,
        };
        Self {
            oauth: OAuthClient::new(CalendarProviderKind::Google, ctx, credentials, endpoints),
        }
    }

    fn events_url() -> String {
        format!("{}/calendars/{}/events", GOOGLE_API_BASE_URL, CALENDAR_ID)
    }

    async fn fetch_email(&self, access_token: &str) -> AppResult<Option<String>> {
        let response = self
            .oauth
            .send_with_backoff(|| self.oauth.http().get(USERINFO_URL).bearer_auth(access_token))
            .await?;
        if !response.status().is_success() {
            return Err(AppError::CalendarProvider(format!(
                "Google userinfo request failed ({})",
                response.status()
            )));
        }
        let info: UserInfo = response.json().await?;
        Ok(info.email)
    }

    async fn list_events(&self, days_ahead: u32) -> AppResult<Vec<CalendarEvent>> {
        let now = Utc::now();
        let time_min = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let time_max =
            (now + Duration::days(days_ahead as i64)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let url = Self::events_url();

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self
                .oauth
                .send_authorized(|token| {
                    let mut req = self
                        .oauth
                        .http()
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[
                            ("timeMin", time_min.as_str()),
                            ("timeMax", time_max.as_str()),
                            ("singleEvents", "true"),
                            ("orderBy", "startTime"),
                            ("maxResults", PAGE_SIZE),
                        ]);
                    if let Some(page) = &page_token {
                        req = req.query(&[("pageToken", page.as_str())]);
                    }
                    req
                })
                .await?;

            let page: GoogleEventsPage = response.json().await.map_err(|e| {
                AppError::CalendarProvider(format!("Failed to parse Google events: {}", e))
            })?;
            events.extend(page.items.into_iter().filter_map(GoogleEvent::into_calendar_event));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        events.sort_by_key(|e| e.start);
        Ok(events)
    }

    async fn write_event(
        &self,
        method: reqwest::Method,
        url: String,
        draft: &EventDraft,
    ) -> AppResult<CalendarEvent> {
        let body = GoogleEventAttributes::from(draft);
        let response = self
            .oauth
            .send_authorized(|token| {
                self.oauth
                    .http()
                    .request(method.clone(), &url)
                    .bearer_auth(token)
                    .json(&body)
            })
            .await?;

        let event: GoogleEvent = response.json().await.map_err(|e| {
            AppError::CalendarProvider(format!("Failed to parse Google event: {}", e))
        })?;
        event.into_calendar_event().ok_or_else(|| {
            AppError::CalendarProvider("Google returned an event without a start time".to_string())
        })
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    fn kind(&self) -> CalendarProviderKind {
        CalendarProviderKind::Google
    }

    async fn is_connected(&self) -> bool {
        stored_status(self.oauth.pool(), self.kind())
            .await
            .map(|s| s.is_connected)
            .unwrap_or(false)
    }

    fn connect(&self, return_path: Option<&str>) -> AppResult<AuthorizationRequest> {
        Ok(AuthorizationRequest {
            provider: self.kind(),
            authorization_url: self.oauth.authorize_url(return_path)?,
        })
    }

    async fn complete_connection(&self, code: &str) -> AppResult<SyncStatus> {
        let tokens = self.oauth.exchange_code(code).await?;
        let email = match self.fetch_email(&tokens.access_token).await {
            Ok(email) => email,
            Err(e) => {
                warn!("Could not read Google account email: {}", e);
                None
            }
        };

        let conn = CalendarConnectionRepository::upsert_tokens(
            self.oauth.pool(),
            self.kind(),
            &tokens.into_connection_tokens(email),
        )
        .await?;
        info!(
            "Google Calendar connected for {}",
            conn.calendar_email.as_deref().unwrap_or("unknown account")
        );
        Ok(SyncStatus::from_connection(Some(&conn)))
    }

    async fn disconnect(&self) -> AppResult<()> {
        if let Some(conn) = CalendarConnectionRepository::find(self.oauth.pool(), self.kind()).await? {
            // Revoking the refresh token also invalidates its access tokens.
            if let Some(token) = conn.refresh_token.or(conn.access_token) {
                let revoke = self
                    .oauth
                    .http()
                    .post(REVOKE_URL)
                    .form(&[("token", token.as_str())])
                    .send()
                    .await;
                if let Err(e) = revoke {
                    warn!("Failed to revoke Google token: {}", e);
                }
            }
        }
        CalendarConnectionRepository::deactivate(self.oauth.pool(), self.kind()).await?;
        info!("Google Calendar disconnected");
        Ok(())
    }

    async fn get_sync_status(&self) -> AppResult<SyncStatus> {
        stored_status(self.oauth.pool(), self.kind()).await
    }

    async fn fetch_events(&self, days_ahead: u32) -> AppResult<Vec<CalendarEvent>> {
        let result = self.list_events(days_ahead).await;
        self.oauth.track(result).await
    }

    fn event_writer(&self) -> Option<&dyn CalendarEventWriter> {
        Some(self)
    }
}

#[async_trait]
impl CalendarEventWriter for GoogleCalendar {
    async fn create_event(&self, draft: &EventDraft) -> AppResult<CalendarEvent> {
        let result = self
            .write_event(reqwest::Method::POST, Self::events_url(), draft)
            .await;
        self.oauth.track(result).await
    }

    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> AppResult<CalendarEvent> {
        let url = format!("{}/{}", Self::events_url(), urlencoding::encode(event_id));
        let result = self.write_event(reqwest::Method::PATCH, url, draft).await;
        self.oauth.track(result).await
    }

    async fn delete_event(&self, event_id: &str) -> AppResult<()> {
        let url = format!("{}/{}", Self::events_url(), urlencoding::encode(event_id));
        let result = self
            .oauth
            .send_authorized(|token| self.oauth.http().delete(&url).bearer_auth(token))
            .await
            .map(|_| ());
        self.oauth.track(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timed_and_all_day_events_convert() {
        let page: GoogleEventsPage = serde_json::from_str(
            r#"{
                "items": [
                    {
                        "id": "evt1",
                        "status": "confirmed",
                        "summary": "Gala dinner",
                        "location": "Opera House",
                        "start": {"dateTime": "2025-05-10T19:00:00+02:00"},
                        "end": {"dateTime": "2025-05-10T23:00:00+02:00"}
                    },
                    {
                        "id": "evt2",
                        "start": {"date": "2025-05-12"},
                        "end": {"date": "2025-05-13"}
                    },
                    {
                        "id": "evt3",
                        "status": "cancelled",
                        "summary": "Dropped",
                        "start": {"dateTime": "2025-05-11T10:00:00Z"}
                    }
                ],
                "nextPageToken": "abc"
            }"#,
        )
        .unwrap();

        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
        let events: Vec<CalendarEvent> = page
            .items
            .into_iter()
            .filter_map(GoogleEvent::into_calendar_event)
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].title, "Gala dinner");
        assert_eq!(
            events[0].start,
            Utc.with_ymd_and_hms(2025, 5, 10, 17, 0, 0).unwrap()
        );
        assert_eq!(events[0].location.as_deref(), Some("Opera House"));
        assert_eq!(events[1].title, "(untitled event)");
        assert_eq!(
            events[1].start,
            Utc.with_ymd_and_hms(2025, 5, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn draft_without_end_lasts_an_hour() {
        let start = Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap();
        let body = serde_json::to_value(GoogleEventAttributes::from(&EventDraft {
            title: "Fitting".to_string(),
            start,
            end: None,
            location: None,
            description: None,
        }))
        .unwrap();

        assert_eq!(body["summary"], "Fitting");
        assert_eq!(body["start"]["dateTime"], "2025-05-10T09:00:00Z");
        assert_eq!(body["end"]["dateTime"], "2025-05-10T10:00:00Z");
        assert_eq!(body["end"]["timeZone"], "UTC");
        assert!(body.get("location").is_none());
    }
}
