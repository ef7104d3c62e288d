use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

/// Durable string-keyed document storage.
///
/// Each call is a single statement, so one `set` either fully replaces the
/// previous value or leaves it untouched.
#[async_trait]
pub trait KeyValueStorage: Send + Sync + 'static {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;
}

/// `kv_store` table backed storage.
#[derive(Clone)]
pub struct SqliteKeyValueStorage {
    pool: SqlitePool,
}

impl SqliteKeyValueStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStorage for SqliteKeyValueStorage {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar(r#"SELECT value FROM kv_store WHERE key = ?"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Database)?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::init::memory_pool;

    #[tokio::test]
    async fn sqlite_set_then_get_overwrites() {
        let pool = memory_pool().await;
        let storage = SqliteKeyValueStorage::new(pool);

        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "[1]").await.unwrap();
        storage.set("k", "[2]").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("[2]".to_string()));
    }
}
