//! OAuth 2.0 plumbing shared by the calendar adapters: signed `state`
//! parameters, code exchange, token refresh and a retrying request helper.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::config::OAuthClientConfig;
use crate::db::models::{CalendarProviderKind, ConnectionTokens};
use crate::db::repository::CalendarConnectionRepository;
use crate::error::{AppError, AppResult};

/// Refresh access tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;
const STATE_LIFETIME_MINUTES: i64 = 10;
/// Upper bound for one retry wait, including a vendor `Retry-After`.
const MAX_BACKOFF_SECS: u64 = 30;

// ============================================================================
// Signed state
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStateClaims {
    pub csrf_token: String,
    pub provider: CalendarProviderKind,
    pub return_path: Option<String>,
    pub iat: usize,
    pub exp: usize,
}

/// Signs the OAuth `state` parameter as a short-lived JWT so no CSRF cookie
/// is needed across the provider redirect.
pub struct OAuthStateSigner {
    secret: String,
}

impl OAuthStateSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(
        &self,
        provider: CalendarProviderKind,
        return_path: Option<&str>,
    ) -> AppResult<String> {
        let now = Utc::now();
        let claims = OAuthStateClaims {
            csrf_token: generate_random_string(32),
            provider,
            return_path: return_path.filter(|p| !p.is_empty()).map(String::from),
            iat: now.timestamp() as usize,
            exp: (now + Duration::minutes(STATE_LIFETIME_MINUTES)).timestamp() as usize,
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// Decode a state parameter and check it was issued for `provider`.
    pub fn verify(&self, token: &str, provider: CalendarProviderKind) -> AppResult<OAuthStateClaims> {
        let data = decode::<OAuthStateClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;

        if data.claims.provider != provider {
            return Err(AppError::BadRequest(format!(
                "OAuth state was issued for {}, not {}",
                data.claims.provider, provider
            )));
        }
        Ok(data.claims)
    }
}

/// Seconds to wait before retrying: the vendor's `Retry-After` when it is a
/// plain number, else the current backoff, capped at `MAX_BACKOFF_SECS`.
fn retry_delay_secs(retry_after: Option<&reqwest::header::HeaderValue>, backoff_secs: u64) -> u64 {
    retry_after
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(backoff_secs)
        .min(MAX_BACKOFF_SECS)
}

fn generate_random_string(length: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

// ============================================================================
// Token endpoint
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| now + Duration::seconds(secs))
    }

    pub fn into_connection_tokens(self, calendar_email: Option<String>) -> ConnectionTokens {
        let expires_at = self.expires_at(Utc::now());
        ConnectionTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            calendar_email,
        }
    }
}

/// Vendor endpoints and options for one provider.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<&'static str>,
    pub extra_authorize_params: Vec<(&'static str, &'static str)>,
    /// Microsoft requires the scope again on refresh; Google rejects unknown ones.
    pub scope_on_refresh: bool,
}

/// Everything the adapters need besides their endpoints.
#[derive(Clone)]
pub struct ProviderContext {
    pub pool: SqlitePool,
    pub http: reqwest::Client,
    pub signer: Arc<OAuthStateSigner>,
    /// Public base URL of this service, used to build callback URLs.
    pub public_url: String,
}

impl ProviderContext {
    pub fn redirect_uri(&self, provider: CalendarProviderKind) -> String {
        format!(
            "{}/api/calendar/{}/callback",
            self.public_url.trim_end_matches('/'),
            provider
        )
    }
}

/// Per-provider OAuth client bound to the connection row of that provider.
pub struct OAuthClient {
    kind: CalendarProviderKind,
    ctx: ProviderContext,
    credentials: OAuthClientConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(
        kind: CalendarProviderKind,
        ctx: ProviderContext,
        credentials: OAuthClientConfig,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            kind,
            ctx,
            credentials,
            endpoints,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.ctx.pool
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.ctx.http
    }

    pub fn client_id(&self) -> AppResult<&str> {
        self.credentials.client_id.as_deref().ok_or_else(|| {
            AppError::Config(format!("{} is not configured", self.kind.display_name()))
        })
    }

    fn client_secret(&self) -> AppResult<&str> {
        self.credentials.client_secret.as_deref().ok_or_else(|| {
            AppError::Config(format!("{} is not configured", self.kind.display_name()))
        })
    }

    pub fn authorize_url(&self, return_path: Option<&str>) -> AppResult<String> {
        let client_id = self.client_id()?;
        let state = self.ctx.signer.sign(self.kind, return_path)?;
        let scope = self.endpoints.scopes.join(" ");
        let redirect_uri = self.ctx.redirect_uri(self.kind);

        let mut url = url::Url::parse(&self.endpoints.authorize_url)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", client_id)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &scope)
                .append_pair("state", &state);
            for (key, value) in &self.endpoints.extra_authorize_params {
                query.append_pair(key, value);
            }
        }
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> AppResult<TokenResponse> {
        let redirect_uri = self.ctx.redirect_uri(self.kind);
        let params = [
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret()?),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        // Authorization codes are single-use, so the exchange is never retried.
        self.token_request(&params, false).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenResponse> {
        let scope = self.endpoints.scopes.join(" ");
        let mut params = vec![
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret()?),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if self.endpoints.scope_on_refresh {
            params.push(("scope", scope.as_str()));
        }
        self.token_request(&params, true).await
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        retry: bool,
    ) -> AppResult<TokenResponse> {
        let request = || self.ctx.http.post(&self.endpoints.token_url).form(params);
        let response = if retry {
            self.send_with_backoff(request).await?
        } else {
            request().send().await?
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::CalendarProvider(format!(
                "{} token request failed ({}): {}",
                self.kind.display_name(),
                status,
                body
            )));
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            AppError::CalendarProvider(format!(
                "Failed to parse {} token response: {}",
                self.kind.display_name(),
                e
            ))
        })
    }

    /// A valid access token for the stored connection, refreshing and
    /// persisting it when it is about to expire.
    pub async fn access_token(&self) -> AppResult<String> {
        let conn = CalendarConnectionRepository::find(&self.ctx.pool, self.kind)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| {
                AppError::NotConnected(format!("{} is not connected", self.kind.display_name()))
            })?;

        if let Some(token) = conn.usable_access_token(Utc::now(), TOKEN_EXPIRY_MARGIN_SECS) {
            return Ok(token.to_string());
        }

        let refresh_token = conn.refresh_token.as_deref().ok_or_else(|| {
            AppError::CalendarProvider(format!(
                "{} access token expired and no refresh token is stored; reconnect the calendar",
                self.kind.display_name()
            ))
        })?;

        debug!("Refreshing {} access token", self.kind);
        let refreshed = self.refresh(refresh_token).await?;
        let expires_at = refreshed.expires_at(Utc::now());
        CalendarConnectionRepository::update_access_token(
            &self.ctx.pool,
            self.kind,
            &refreshed.access_token,
            expires_at,
        )
        .await?;

        Ok(refreshed.access_token)
    }

    /// Record the outcome of a provider call on the connection row: failures
    /// become the last error, successes update the sync time.
    pub async fn track<T>(&self, result: AppResult<T>) -> AppResult<T> {
        match &result {
            Ok(_) => {
                if let Err(e) =
                    CalendarConnectionRepository::mark_synced(&self.ctx.pool, self.kind, Utc::now())
                        .await
                {
                    warn!("Failed to record {} sync time: {}", self.kind, e);
                }
            }
            Err(AppError::NotConnected(_)) | Err(AppError::Unsupported(_)) => {}
            Err(err) => {
                warn!("{} request failed: {}", self.kind.display_name(), err);
                if let Err(e) = CalendarConnectionRepository::record_error(
                    &self.ctx.pool,
                    self.kind,
                    &err.to_string(),
                )
                .await
                {
                    warn!("Failed to record {} error: {}", self.kind, e);
                }
            }
        }
        result
    }

    /// Send a request, retrying 429/5xx responses and network errors with
    /// exponential backoff. Other statuses are returned to the caller.
    pub async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 4;
        let mut backoff_secs: u64 = 1;

        for attempt in 0..MAX_RETRIES {
            match make_request().send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        let wait_secs = retry_delay_secs(
                            resp.headers().get(reqwest::header::RETRY_AFTER),
                            backoff_secs,
                        );

                        if attempt + 1 >= MAX_RETRIES {
                            let status = resp.status();
                            let body = resp.text().await.unwrap_or_default();
                            return Err(AppError::CalendarProvider(format!(
                                "{} failed after {} attempts ({}): {}",
                                self.kind.display_name(),
                                attempt + 1,
                                status,
                                body
                            )));
                        }

                        warn!(
                            "Transient {} error (status: {}). Retrying in {}s (attempt {}/{})",
                            self.kind,
                            resp.status(),
                            wait_secs,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                        backoff_secs = std::cmp::min(backoff_secs * 2, MAX_BACKOFF_SECS);
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(
                        "{} request failed: {}. Retrying in {}s (attempt {}/{})",
                        self.kind,
                        e,
                        backoff_secs,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = std::cmp::min(backoff_secs * 2, MAX_BACKOFF_SECS);
                }
            }
        }

        Err(AppError::CalendarProvider(format!(
            "Exceeded {} retry attempts",
            self.kind.display_name()
        )))
    }

    /// Authorized request helper: attaches the bearer token and turns
    /// non-success statuses into provider errors.
    pub async fn send_authorized<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = self.send_with_backoff(|| make_request(&token)).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::CalendarProvider(format!(
                "{} API error ({}): {}",
                self.kind.display_name(),
                status,
                body
            )));
        }
        Ok(response)
    }
}
