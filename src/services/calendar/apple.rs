//! Sign in with Apple.
//!
//! Apple exposes no REST calendar API; iCloud calendars are only reachable
//! over CalDAV with an app-specific password. The adapter therefore handles
//! the account connection only: reading events and writing are unsupported.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{info, warn};

use super::oauth::{OAuthClient, OAuthEndpoints, ProviderContext};
use super::{stored_status, AuthorizationRequest, CalendarProvider};
use crate::config::OAuthClientConfig;
use crate::db::models::{CalendarEvent, CalendarProviderKind, SyncStatus};
use crate::db::repository::CalendarConnectionRepository;
use crate::error::{AppError, AppResult};

const APPLE_ISSUER: &str = "https://appleid.apple.com";

#[derive(Debug, Deserialize)]
struct AppleIdClaims {
    #[allow(dead_code)]
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Read the account email from an id_token returned by Apple's token
/// endpoint. The token arrives directly from Apple over TLS, so only the
/// issuer and audience are checked.
fn email_from_id_token(id_token: &str, client_id: &str) -> AppResult<Option<String>> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[APPLE_ISSUER]);

    let data = decode::<AppleIdClaims>(id_token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims.email)
}

pub struct AppleCalendar {
    oauth: OAuthClient,
}

impl AppleCalendar {
    pub fn new(ctx: ProviderContext, credentials: OAuthClientConfig) -> Self {
        let endpoints = OAuthEndpoints {
            authorize_url: format!("{}/auth/authorize", APPLE_ISSUER),
            token_url: format!("{}/auth/token", APPLE_ISSUER),
            scopes: vec!["email"],
            // Apple requires form_post whenever a scope is requested.
            extra_authorize_params: vec![("response_mode", "form_post")],
            scope_on_refresh: false,
        };
        Self {
            oauth: OAuthClient::new(CalendarProviderKind::Apple, ctx, credentials, endpoints),
        }
    }
}

#[async_trait]
impl CalendarProvider for AppleCalendar {
    fn kind(&self) -> CalendarProviderKind {
        CalendarProviderKind::Apple
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
        let mut tokens = self.oauth.exchange_code(code).await?;
        let email = match tokens.id_token.take() {
            Some(id_token) => match email_from_id_token(&id_token, self.oauth.client_id()?) {
                Ok(email) => email,
                Err(e) => {
                    warn!("Could not read Apple id_token: {}", e);
                    None
                }
            },
            None => None,
        };

        let conn = CalendarConnectionRepository::upsert_tokens(
            self.oauth.pool(),
            self.kind(),
            &tokens.into_connection_tokens(email),
        )
        .await?;
        info!(
            "Apple account connected for {}",
            conn.calendar_email.as_deref().unwrap_or("unknown account")
        );
        Ok(SyncStatus::from_connection(Some(&conn)))
    }

    async fn disconnect(&self) -> AppResult<()> {
        CalendarConnectionRepository::deactivate(self.oauth.pool(), self.kind()).await?;
        info!("Apple account disconnected");
        Ok(())
    }

    async fn get_sync_status(&self) -> AppResult<SyncStatus> {
        stored_status(self.oauth.pool(), self.kind()).await
    }

    async fn fetch_events(&self, _days_ahead: u32) -> AppResult<Vec<CalendarEvent>> {
        let result = if self.is_connected().await {
            Err(AppError::Unsupported(
                "Apple does not offer calendar event access through Sign in with Apple".to_string(),
            ))
        } else {
            Err(AppError::NotConnected(
                "Apple Calendar is not connected".to_string(),
            ))
        };
        self.oauth.track(result).await
    }
}
