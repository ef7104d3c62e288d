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

// https://learn.microsoft.com/en-us/graph/api/user-list-calendarview
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
/// Ask Graph to express all event times in UTC.
const PREFER_UTC: &str = "outlook.timezone=\"UTC\"";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookEventTime {
    /// `2017-08-29T04:00:00.0000000`, zone given separately.
    date_time: String,
    time_zone: String,
}

impl OutlookEventTime {
    fn utc(at: DateTime<Utc>) -> Self {
        Self {
            date_time: at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            time_zone: "UTC".to_string(),
        }
    }

    fn parse(&self) -> Option<DateTime<Utc>> {
        if !self.time_zone.eq_ignore_ascii_case("UTC") {
            warn!(
                "Outlook returned a {} time despite the UTC preference; reading it as UTC",
                self.time_zone
            );
        }
        parse_vendor_time(self.date_time.trim_end_matches('Z'))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookLocation {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookEvent {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_preview: Option<String>,
    #[serde(default)]
    location: Option<OutlookLocation>,
    start: OutlookEventTime,
    #[serde(default)]
    end: Option<OutlookEventTime>,
    #[serde(default)]
    is_cancelled: bool,
}

impl OutlookEvent {
    fn into_calendar_event(self) -> Option<CalendarEvent> {
        if self.is_cancelled {
            return None;
        }
        let start = self.start.parse()?;
        Some(CalendarEvent {
            id: self.id,
            provider: CalendarProviderKind::Outlook,
            title: self
                .subject
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "(untitled event)".to_string()),
            start,
            end: self.end.as_ref().and_then(OutlookEventTime::parse),
            location: self
                .location
                .and_then(|l| l.display_name)
                .filter(|s| !s.is_empty()),
            description: self.body_preview.filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OutlookEventsPage {
    #[serde(default)]
    value: Vec<OutlookEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutlookEventBody {
    content_type: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutlookEventAttributes {
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<OutlookEventBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<OutlookLocation>,
    start: OutlookEventTime,
    end: OutlookEventTime,
}

impl From<&EventDraft> for OutlookEventAttributes {
    fn from(draft: &EventDraft) -> Self {
        Self {
            subject: draft.title.clone(),
            body: draft.description.clone().map(|content| OutlookEventBody {
                content_type: "text",
                content,
            }),
            location: draft.location.clone().map(|name| OutlookLocation {
                display_name: Some(name),
            }),
            start: OutlookEventTime::utc(draft.start),
            end: OutlookEventTime::utc(draft.end.unwrap_or(draft.start + Duration::hours(1))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

pub struct OutlookCalendar {
    oauth: OAuthClient,
}

impl OutlookCalendar {
    pub fn new(ctx: ProviderContext, credentials: OAuthClientConfig, tenant: &str) -> Self {
        let endpoints = OAuthEndpoints {
            authorize_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
                tenant
            ),
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant
            ),
            scopes: vec!["offline_access", "User.Read", "Calendars.ReadWrite"],
            extra_authorize_params: vec![("response_mode", "query")],
            scope_on_refresh: true,
        };
        Self {
            oauth: OAuthClient::new(CalendarProviderKind::Outlook, ctx, credentials, endpoints),
        }
    }

    async fn fetch_email(&self, access_token: &str) -> AppResult<Option<String>> {
        let url = format!("{}/me", GRAPH_BASE_URL);
        let response = self
            .oauth
            .send_with_backoff(|| self.oauth.http().get(&url).bearer_auth(access_token))
            .await?;
        if !response.status().is_success() {
            return Err(AppError::CalendarProvider(format!(
                "Graph /me request failed ({})",
                response.status()
            )));
        }
        let user: GraphUser = response.json().await?;
        Ok(user.mail.or(user.user_principal_name))
    }

    async fn list_events(&self, days_ahead: u32) -> AppResult<Vec<CalendarEvent>> {
        let now = Utc::now();
        let start = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end =
            (now + Duration::days(days_ahead as i64)).to_rfc3339_opts(SecondsFormat::Secs, true);

        let first_page = url::Url::parse_with_params(
            &format!("{}/me/calendarView", GRAPH_BASE_URL),
            &[
                ("startDateTime", start.as_str()),
                ("endDateTime", end.as_str()),
                ("$orderby", "start/dateTime"),
                ("$top", PAGE_SIZE),
            ],
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let mut events = Vec::new();
        let mut next: Option<String> = Some(first_page.into());
        while let Some(url) = next.take() {
            let response = self
                .oauth
                .send_authorized(|token| {
                    self.oauth
                        .http()
                        .get(&url)
                        .bearer_auth(token)
                        .header("Prefer", PREFER_UTC)
                })
                .await?;

            let page: OutlookEventsPage = response.json().await.map_err(|e| {
                AppError::CalendarProvider(format!("Failed to parse Outlook events: {}", e))
            })?;
            events.extend(page.value.into_iter().filter_map(OutlookEvent::into_calendar_event));
            next = page.next_link;
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
        let body = OutlookEventAttributes::from(draft);
        let response = self
            .oauth
            .send_authorized(|token| {
                self.oauth
                    .http()
                    .request(method.clone(), &url)
                    .bearer_auth(token)
                    .header("Prefer", PREFER_UTC)
                    .json(&body)
            })
            .await?;

        let event: OutlookEvent = response.json().await.map_err(|e| {
            AppError::CalendarProvider(format!("Failed to parse Outlook event: {}", e))
        })?;
        event.into_calendar_event().ok_or_else(|| {
            AppError::CalendarProvider("Outlook returned an unreadable event".to_string())
        })
    }

    fn event_url(event_id: &str) -> String {
        format!("{}/me/events/{}", GRAPH_BASE_URL, urlencoding::encode(event_id))
    }
}

#[async_trait]
impl CalendarProvider for OutlookCalendar {
    fn kind(&self) -> CalendarProviderKind {
        CalendarProviderKind::Outlook
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
                warn!("Could not read Microsoft account email: {}", e);
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
            "Outlook Calendar connected for {}",
            conn.calendar_email.as_deref().unwrap_or("unknown account")
        );
        Ok(SyncStatus::from_connection(Some(&conn)))
    }

    async fn disconnect(&self) -> AppResult<()> {
        CalendarConnectionRepository::deactivate(self.oauth.pool(), self.kind()).await?;
        info!("Outlook Calendar disconnected");
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
impl CalendarEventWriter for OutlookCalendar {
    async fn create_event(&self, draft: &EventDraft) -> AppResult<CalendarEvent> {
        let url = format!("{}/me/events", GRAPH_BASE_URL);
        let result = self.write_event(reqwest::Method::POST, url, draft).await;
        self.oauth.track(result).await
    }

    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> AppResult<CalendarEvent> {
        let result = self
            .write_event(reqwest::Method::PATCH, Self::event_url(event_id), draft)
            .await;
        self.oauth.track(result).await
    }

    async fn delete_event(&self, event_id: &str) -> AppResult<()> {
        let url = Self::event_url(event_id);
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
    fn calendar_view_page_converts() {
        let page: OutlookEventsPage = serde_json::from_str(
            r#"{
                "value": [
                    {
                        "id": "AAMk1",
                        "subject": "Board meeting",
                        "bodyPreview": "Quarterly review",
                        "location": {"displayName": "HQ"},
                        "start": {"dateTime": "2025-06-02T08:30:00.0000000", "timeZone": "UTC"},
                        "end": {"dateTime": "2025-06-02T10:00:00.0000000", "timeZone": "UTC"},
                        "isCancelled": false
                    },
                    {
                        "id": "AAMk2",
                        "subject": "Cancelled lunch",
                        "start": {"dateTime": "2025-06-03T12:00:00.0000000", "timeZone": "UTC"},
                        "isCancelled": true
                    }
                ],
                "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/calendarView?$skip=100"
            }"#,
        )
        .unwrap();

        assert!(page.next_link.is_some());
        let events: Vec<CalendarEvent> = page
            .value
            .into_iter()
            .filter_map(OutlookEvent::into_calendar_event)
            .collect();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Board meeting");
        assert_eq!(
            events[0].start,
            Utc.with_ymd_and_hms(2025, 6, 2, 8, 30, 0).unwrap()
        );
        assert_eq!(events[0].location.as_deref(), Some("HQ"));
        assert_eq!(events[0].description.as_deref(), Some("Quarterly review"));
    }

    #[test]
    fn draft_serializes_for_graph() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let body = serde_json::to_value(OutlookEventAttributes::from(&EventDraft {
            title: "Tailor".to_string(),
            start,
            end: Some(start + Duration::minutes(30)),
            location: Some("Savile Row".to_string()),
            description: Some("Bring the jacket".to_string()),
        }))
        .unwrap();

        assert_eq!(body["subject"], "Tailor");
        assert_eq!(body["body"]["contentType"], "text");
        assert_eq!(body["location"]["displayName"], "Savile Row");
        assert_eq!(body["end"]["dateTime"], "2025-06-02T08:30:00");
        assert_eq!(body["end"]["timeZone"], "UTC");
    }
}
