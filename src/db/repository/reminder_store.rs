use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::db::models::{NewReminder, ReminderId, ReminderRecord};
use crate::db::repository::KeyValueStorage;
use crate::error::AppResult;

/// Reminder list persisted as a single JSON document under a fixed key.
///
/// `load` never fails: absent, corrupt or unreadable data yields an empty
/// list. `save` logs and swallows write failures so a broken storage backend
/// degrades reminders instead of taking the scheduler down.
///
/// Clones share one write lock. Every load-modify-save cycle runs under it,
/// so a sweep and an HTTP write never overwrite each other.
#[derive(Clone)]
pub struct ReminderStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    write_lock: Arc<Mutex<()>>,
}

impl ReminderStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Hold the write lock across a longer cycle that uses `load`/`save`
    /// directly. Do not call `modify` or the mutating helpers while holding it.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Load, apply `f` and save if the list changed, all under the write lock.
    pub async fn modify<T>(&self, f: impl FnOnce(&mut Vec<ReminderRecord>) -> T) -> AppResult<T> {
        let _guard = self.exclusive().await;
        let mut records = self.try_load().await?;
        let before = records.clone();
        let out = f(&mut records);
        if records != before {
            self.try_save(&records).await?;
        }
        Ok(out)
    }

    pub async fn load(&self) -> Vec<ReminderRecord> {
        match self.try_load().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to read reminders from storage: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn save(&self, records: &[ReminderRecord]) {
        if let Err(e) = self.try_save(records).await {
            error!(
                "Failed to persist {} reminders; changes are kept in memory only for this cycle: {}",
                records.len(),
                e
            );
        }
    }

    /// All reminders ordered by when they become due.
    pub async fn list(&self) -> AppResult<Vec<ReminderRecord>> {
        let mut records = self.try_load().await?;
        records.sort_by_key(|r| r.reminder_date);
        Ok(records)
    }

    /// Like `load`, but storage errors are returned. Corrupt documents still
    /// read as empty.
    pub async fn try_load(&self) -> AppResult<Vec<ReminderRecord>> {
        let Some(raw) = self.storage.get(&self.key).await? else {
            debug!("No reminders stored under '{}'", self.key);
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<ReminderRecord>>(&raw) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(
                    "Stored reminders under '{}' are corrupt; treating as empty: {}",
                    self.key, e
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn try_save(&self, records: &[ReminderRecord]) -> AppResult<()> {
        let raw = serde_json::to_string(records)?;
        self.storage.set(&self.key, &raw).await
    }

    /// Store a new reminder, assigning its id and creation time.
    pub async fn create(&self, new: NewReminder) -> AppResult<ReminderRecord> {
        self.modify(|records| push_new(records, new, Utc::now()))
            .await
    }

    /// Remove a reminder by id. Returns whether anything was removed.
    pub async fn dismiss(&self, id: &ReminderId) -> AppResult<bool> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| &r.id != id);
            records.len() != before
        })
        .await
    }
}

/// Append a new reminder with an id not yet present in `records`.
pub(crate) fn push_new(
    records: &mut Vec<ReminderRecord>,
    new: NewReminder,
    now: chrono::DateTime<Utc>,
) -> ReminderRecord {
    let mut record = new.into_record(now);
    while records.iter().any(|r| r.id == record.id) {
        record.id = ReminderId::generate();
    }
    records.push(record.clone());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::kv_store::memory::MemoryKeyValueStorage;
    use chrono::Duration;

    const KEY: &str = "outfit_reminders";

    fn new_reminder(occasion: &str) -> NewReminder {
        let now = Utc::now();
        NewReminder {
            reminder_date: now + Duration::hours(1),
            event_date: now + Duration::days(1),
            occasion: occasion.to_string(),
            message: format!("Get ready for {}", occasion),
            shopping_links: vec!["https://shop.example/dress".to_string()],
            source_event_id: None,
        }
    }

    #[tokio::test]
    async fn missing_document_loads_empty() {
        let store = ReminderStore::new(Arc::new(MemoryKeyValueStorage::new()), KEY);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_document_loads_empty() {
        let storage = Arc::new(MemoryKeyValueStorage::with_value(KEY, "{not json"));
        let store = ReminderStore::new(storage, KEY);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn read_failure_loads_empty() {
        let storage = Arc::new(MemoryKeyValueStorage::new());
        storage.fail_reads(true);
        let store = ReminderStore::new(storage, KEY);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let storage = Arc::new(MemoryKeyValueStorage::new());
        storage.fail_writes(true);
        let store = ReminderStore::new(storage.clone(), KEY);

        store.save(&[new_reminder("Party").into_record(Utc::now())]).await;
        assert_eq!(storage.raw(KEY), None);
    }

    #[tokio::test]
    async fn save_of_load_is_a_no_op() {
        let storage = Arc::new(MemoryKeyValueStorage::new());
        let store = ReminderStore::new(storage.clone(), KEY);
        store.create(new_reminder("Wedding")).await.unwrap();
        store.create(new_reminder("Interview")).await.unwrap();

        let before = storage.raw(KEY).unwrap();
        let loaded = store.load().await;
        store.save(&loaded).await;

        assert_eq!(storage.raw(KEY).unwrap(), before);
        assert_eq!(store.load().await, loaded);
    }

    #[tokio::test]
    async fn legacy_numeric_ids_survive_a_save() {
        let legacy = r#"[{"id":1700000000000,"reminderDate":"2024-01-01T08:00:00Z","eventDate":"2024-01-02T08:00:00Z","occasion":"Brunch","message":"Iron the shirt","shoppingLinks":[],"notified":true,"createdAt":"2023-12-30T08:00:00Z"}]"#;
        let storage = Arc::new(MemoryKeyValueStorage::with_value(KEY, legacy));
        let store = ReminderStore::new(storage.clone(), KEY);

        let loaded = store.load().await;
        store.save(&loaded).await;
        assert_eq!(storage.raw(KEY).unwrap(), legacy);
    }

    #[tokio::test]
    async fn create_assigns_fresh_state() {
        let store = ReminderStore::new(Arc::new(MemoryKeyValueStorage::new()), KEY);
        let a = store.create(new_reminder("Gala")).await.unwrap();
        let b = store.create(new_reminder("Gala")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert!(!a.notified);
        assert_eq!(store.load().await.len(), 2);
    }

    #[tokio::test]
    async fn dismiss_removes_only_the_matching_record() {
        let store = ReminderStore::new(Arc::new(MemoryKeyValueStorage::new()), KEY);
        let a = store.create(new_reminder("Gala")).await.unwrap();
        let b = store.create(new_reminder("Dinner")).await.unwrap();

        assert!(store.dismiss(&a.id).await.unwrap());
        assert!(!store.dismiss(&a.id).await.unwrap());

        let remaining = store.load().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
    }

    #[tokio::test]
    async fn create_propagates_storage_errors() {
        let storage = Arc::new(MemoryKeyValueStorage::new());
        storage.fail_reads(true);
        let store = ReminderStore::new(storage.clone(), KEY);

        assert!(store.create(new_reminder("Gala")).await.is_err());
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test]
    async fn dismissing_an_unknown_id_writes_nothing() {
        let storage = Arc::new(MemoryKeyValueStorage::new());
        let store = ReminderStore::new(storage.clone(), KEY);
        store.create(new_reminder("Gala")).await.unwrap();
        let writes = storage.write_count();

        assert!(!store.dismiss(&ReminderId::Numeric(7)).await.unwrap());
        assert_eq!(storage.write_count(), writes);
    }

    #[tokio::test]
    async fn concurrent_creates_are_all_kept() {
        let store = ReminderStore::new(Arc::new(MemoryKeyValueStorage::new()), KEY);
        let creates = (0..8).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.create(new_reminder(&format!("Event {}", i))).await })
        });
        for handle in futures::future::join_all(creates).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(store.load().await.len(), 8);
    }
}
