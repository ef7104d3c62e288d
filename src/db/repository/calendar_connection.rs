use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::db::models::{CalendarConnection, CalendarProviderKind, ConnectionTokens};
use crate::error::{AppError, AppResult};

/// Repository for the `calendar_connections` table (one row per provider).
pub struct CalendarConnectionRepository;

const SELECT_COLUMNS: &str = r#"
    provider,
    is_active,
    calendar_email,
    access_token,
    refresh_token,
    token_expires_at,
    last_sync_at,
    last_error,
    created_at,
    updated_at
"#;

fn map_row(row: &SqliteRow) -> AppResult<CalendarConnection> {
    let provider: String = row.try_get("provider")?;
    let provider = provider
        .parse::<CalendarProviderKind>()
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

    Ok(CalendarConnection {
        provider,
        is_active: row.try_get("is_active")?,
        calendar_email: row.try_get("calendar_email")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl CalendarConnectionRepository {
    pub async fn find(
        pool: &SqlitePool,
        provider: CalendarProviderKind,
    ) -> AppResult<Option<CalendarConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM calendar_connections WHERE provider = ?",
            SELECT_COLUMNS
        ))
        .bind(provider.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.as_ref().map(map_row).transpose()
    }

    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<CalendarConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM calendar_connections ORDER BY provider",
            SELECT_COLUMNS
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        rows.iter().map(map_row).collect()
    }

    /// Store tokens from a completed authorization and mark the connection active.
    ///
    /// A missing refresh token keeps the previously stored one; providers only
    /// return it on first consent.
    pub async fn upsert_tokens(
        pool: &SqlitePool,
        provider: CalendarProviderKind,
        tokens: &ConnectionTokens,
    ) -> AppResult<CalendarConnection> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO calendar_connections (
                provider,
                is_active,
                calendar_email,
                access_token,
                refresh_token,
                token_expires_at,
                last_error,
                created_at,
                updated_at
            )
            VALUES (?, 1, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(provider) DO UPDATE SET
                is_active = 1,
                calendar_email = COALESCE(excluded.calendar_email, calendar_connections.calendar_email),
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, calendar_connections.refresh_token),
                token_expires_at = excluded.token_expires_at,
                last_error = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(provider.as_str())
        .bind(tokens.calendar_email.as_deref())
        .bind(&tokens.access_token)
        .bind(tokens.refresh_token.as_deref())
        .bind(tokens.expires_at)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Self::find(pool, provider)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("connection row vanished")))
    }

    /// Replace the access token after a refresh.
    pub async fn update_access_token(
        pool: &SqlitePool,
        provider: CalendarProviderKind,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE calendar_connections
            SET access_token = ?, token_expires_at = ?, updated_at = ?
            WHERE provider = ?
            "#,
        )
        .bind(access_token)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(provider.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_synced(
        pool: &SqlitePool,
        provider: CalendarProviderKind,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE calendar_connections
            SET last_sync_at = ?, last_error = NULL, updated_at = ?
            WHERE provider = ?
            "#,
        )
        .bind(at)
        .bind(Utc::now())
        .bind(provider.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn record_error(
        pool: &SqlitePool,
        provider: CalendarProviderKind,
        message: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE calendar_connections
            SET last_error = ?, updated_at = ?
            WHERE provider = ?
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(provider.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Forget tokens and deactivate. The row stays so the UI can show the last sync time.
    pub async fn deactivate(pool: &SqlitePool, provider: CalendarProviderKind) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE calendar_connections
            SET is_active = 0,
                access_token = NULL,
                refresh_token = NULL,
                token_expires_at = NULL,
                last_error = NULL,
                updated_at = ?
            WHERE provider = ?
            "#,
        )
        .bind(Utc::now())
        .bind(provider.as_str())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
