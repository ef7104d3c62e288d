//! Hourly reminder sweep.
//!
//! `ReminderScheduler` owns at most one recurring timer task. `initialize`
//! asks for notification permission, sweeps once right away and then arms the
//! timer; calling it again replaces the previous timer instead of adding a
//! second one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::db::repository::ReminderStore;
use crate::services::notifications::NotificationDispatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dispatched: usize,
    pub removed: usize,
}

/// State shared between the scheduler handle and its timer task.
struct SweepCore {
    store: ReminderStore,
    dispatcher: Arc<NotificationDispatcher>,
    retention: chrono::Duration,
    sweeps: AtomicUsize,
}

impl SweepCore {
    async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        // Held until both writes are done; HTTP writes wait for the sweep.
        let _guard = self.store.exclusive().await;
        let mut records = self.store.load().await;

        let due: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_due(now))
            .map(|(i, _)| i)
            .collect();

        if !due.is_empty() {
            join_all(due.iter().map(|&i| self.dispatcher.dispatch(&records[i]))).await;
            for &i in &due {
                records[i].notified = true;
            }
            self.store.save(&records).await;
        }

        let cutoff_count = records.len();
        records.retain(|r| !r.is_expired(now, self.retention));
        let removed = cutoff_count - records.len();
        if removed > 0 {
            self.store.save(&records).await;
        }

        self.sweeps.fetch_add(1, Ordering::SeqCst);

        let report = SweepReport {
            dispatched: due.len(),
            removed,
        };
        debug!(
            "Reminder sweep done: {} dispatched, {} removed",
            report.dispatched, report.removed
        );
        report
    }
}

struct RunningTimer {
    stop: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ReminderScheduler {
    core: Arc<SweepCore>,
    period: Duration,
    timer: Mutex<Option<RunningTimer>>,
}

impl ReminderScheduler {
    pub fn new(
        store: ReminderStore,
        dispatcher: Arc<NotificationDispatcher>,
        period: Duration,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            core: Arc::new(SweepCore {
                store,
                dispatcher,
                retention,
                sweeps: AtomicUsize::new(0),
            }),
            period,
            timer: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &SchedulerConfig,
        store: ReminderStore,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self::new(
            store,
            dispatcher,
            Duration::from_secs(config.sweep_interval_seconds),
            chrono::Duration::days(config.retention_days),
        )
    }

    /// Request permission, sweep once immediately, then sweep every period.
    pub async fn initialize(&self) {
        let permission = self.core.dispatcher.gateway().request_permission().await;
        debug!("Scheduler starting with notification permission {}", permission);

        let report = self.core.sweep_at(Utc::now()).await;
        info!(
            "Initial reminder sweep: {} dispatched, {} removed",
            report.dispatched, report.removed
        );

        self.arm();
    }

    /// Cancel the recurring timer. A sweep that is already running finishes.
    pub fn stop(&self) {
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(timer) = previous {
            let _ = timer.stop.send(());
            info!("Reminder scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn sweep(&self) -> SweepReport {
        self.core.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.core.sweep_at(now).await
    }

    pub fn sweeps_completed(&self) -> usize {
        self.core.sweeps.load(Ordering::SeqCst)
    }

    fn arm(&self) {
        // First tick one full period from now; the immediate sweep already ran.
        let start = Instant::now() + self.period;
        let period = self.period;
        let core = self.core.clone();
        let (stop, mut stop_rx) = broadcast::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => {
                        debug!("Reminder timer received stop signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let report = core.sweep_at(Utc::now()).await;
                if report.dispatched > 0 || report.removed > 0 {
                    info!(
                        "Reminder sweep: {} dispatched, {} removed",
                        report.dispatched, report.removed
                    );
                }
            }
        });

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(RunningTimer { stop, handle });
        if let Some(old) = previous {
            let _ = old.stop.send(());
            debug!("Replaced existing reminder timer");
        }

        info!("Reminder scheduler armed; sweeping every {}s", period.as_secs());
    }
}

impl Drop for ReminderScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewReminder, ReminderId, ReminderRecord};
    use crate::db::repository::kv_store::memory::MemoryKeyValueStorage;
    use crate::services::notifications::NotificationTemplate;
    use crate::services::permission::{PermissionGateway, PermissionState};
    use crate::services::platform::testing::RecordingPlatform;
    use crate::services::platform::NotificationPlatform;
    use chrono::Duration as ChronoDuration;

    const KEY: &str = "outfit_reminders";
    const PERIOD: Duration = Duration::from_secs(60 * 60);

    struct Harness {
        storage: Arc<MemoryKeyValueStorage>,
        store: ReminderStore,
        platform: Arc<RecordingPlatform>,
        dispatcher: Arc<NotificationDispatcher>,
        scheduler: ReminderScheduler,
    }

    fn harness(permission: PermissionState, records: &[ReminderRecord]) -> Harness {
        let storage = Arc::new(MemoryKeyValueStorage::with_value(
            KEY,
            &serde_json::to_string(records).unwrap(),
        ));
        let platform = Arc::new(RecordingPlatform::new(permission));
        let gateway = Arc::new(PermissionGateway::new(Some(
            platform.clone() as Arc<dyn NotificationPlatform>
        )));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            gateway,
            NotificationTemplate::default(),
        ));
        let store = ReminderStore::new(storage.clone(), KEY);
        let scheduler = ReminderScheduler::new(
            store.clone(),
            dispatcher.clone(),
            PERIOD,
            ChronoDuration::days(7),
        );
        Harness {
            storage,
            store,
            platform,
            dispatcher,
            scheduler,
        }
    }

    fn record(
        id: i64,
        now: DateTime<Utc>,
        reminder: ChronoDuration,
        event: ChronoDuration,
        notified: bool,
    ) -> ReminderRecord {
        ReminderRecord {
            id: ReminderId::Numeric(id),
            reminder_date: now + reminder,
            event_date: now + event,
            occasion: format!("Occasion {}", id),
            message: format!("Reminder {}", id),
            shopping_links: vec![],
            notified,
            created_at: now - ChronoDuration::days(30),
            source_event_id: None,
        }
    }

    fn stored(h: &Harness) -> Vec<ReminderRecord> {
        serde_json::from_str(&h.storage.raw(KEY).unwrap()).unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn due_record_with_future_event_is_dispatched_and_kept() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[record(1, now, -ChronoDuration::minutes(1), ChronoDuration::days(1), false)],
        );

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report, SweepReport { dispatched: 1, removed: 0 });
        assert_eq!(h.platform.shown().len(), 1);
        let records = stored(&h);
        assert_eq!(records.len(), 1);
        assert!(records[0].notified);
    }

    #[tokio::test]
    async fn expired_notified_record_is_removed_without_dispatch() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[record(1, now, -ChronoDuration::days(9), -ChronoDuration::days(8), true)],
        );

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report, SweepReport { dispatched: 0, removed: 1 });
        assert!(h.platform.shown().is_empty());
        assert!(stored(&h).is_empty());
    }

    #[tokio::test]
    async fn future_record_is_left_alone() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[record(1, now, ChronoDuration::hours(2), ChronoDuration::days(2), false)],
        );

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report, SweepReport::default());
        assert!(h.platform.shown().is_empty());
        assert_eq!(h.storage.write_count(), 0);
        assert!(!stored(&h)[0].notified);
    }

    #[tokio::test]
    async fn each_due_record_is_dispatched_exactly_once() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[
                record(1, now, -ChronoDuration::hours(1), ChronoDuration::days(1), false),
                record(2, now, -ChronoDuration::minutes(1), ChronoDuration::days(3), false),
                record(3, now, -ChronoDuration::hours(5), ChronoDuration::days(1), true),
            ],
        );

        let first = h.scheduler.sweep_at(now).await;
        let second = h.scheduler.sweep_at(now + ChronoDuration::hours(1)).await;

        assert_eq!(first.dispatched, 2);
        assert_eq!(second, SweepReport::default());
        let tags: Vec<String> = h.platform.shown().into_iter().map(|n| n.tag).collect();
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&"outfit-reminder-1".to_string()));
        assert!(tags.contains(&"outfit-reminder-2".to_string()));
        assert!(stored(&h).iter().all(|r| r.notified));
    }

    #[tokio::test]
    async fn second_sweep_of_unchanged_store_writes_nothing() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[
                record(1, now, -ChronoDuration::hours(1), ChronoDuration::days(1), false),
                record(2, now, -ChronoDuration::days(10), -ChronoDuration::days(9), false),
            ],
        );

        h.scheduler.sweep_at(now).await;
        let writes = h.storage.write_count();
        let snapshot = h.storage.raw(KEY);

        h.scheduler.sweep_at(now).await;

        assert_eq!(h.storage.write_count(), writes);
        assert_eq!(h.storage.raw(KEY), snapshot);
    }

    #[tokio::test]
    async fn expired_unnotified_record_is_removed_after_its_dispatch() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[record(1, now, -ChronoDuration::days(10), -ChronoDuration::days(8), false)],
        );

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report, SweepReport { dispatched: 1, removed: 1 });
        assert!(stored(&h).is_empty());
    }

    #[tokio::test]
    async fn denied_permission_still_publishes_events() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Denied,
            &[record(1, now, -ChronoDuration::minutes(1), ChronoDuration::days(1), false)],
        );
        let mut events = h.dispatcher.subscribe();

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report.dispatched, 1);
        assert!(h.platform.shown().is_empty());
        assert_eq!(events.recv().await.unwrap().id, ReminderId::Numeric(1));
        assert!(stored(&h)[0].notified);
    }

    #[tokio::test]
    async fn write_failure_does_not_stop_the_sweep() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[record(1, now, -ChronoDuration::minutes(1), ChronoDuration::days(1), false)],
        );
        h.storage.fail_writes(true);

        let report = h.scheduler.sweep_at(now).await;

        assert_eq!(report.dispatched, 1);
        assert!(!stored(&h)[0].notified);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_during_a_sweep_are_not_lost() {
        let now = Utc::now();
        let h = harness(
            PermissionState::Granted,
            &[
                record(1, now, -ChronoDuration::minutes(1), ChronoDuration::days(1), false),
                record(2, now, ChronoDuration::hours(3), ChronoDuration::days(2), false),
            ],
        );
        h.platform.delay_show(Duration::from_millis(100));

        let scheduler = Arc::new(h.scheduler);
        let sweep = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.sweep_at(now).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let created = h
            .store
            .create(NewReminder {
                reminder_date: now + ChronoDuration::hours(5),
                event_date: now + ChronoDuration::days(4),
                occasion: "Concert".to_string(),
                message: "Find the black boots".to_string(),
                shopping_links: vec![],
                source_event_id: None,
            })
            .await
            .unwrap();
        assert!(h.store.dismiss(&ReminderId::Numeric(2)).await.unwrap());

        assert_eq!(sweep.await.unwrap().dispatched, 1);
        let records = h.store.load().await;
        let ids: Vec<&ReminderId> = records.iter().map(|r| &r.id).collect();
        assert_eq!(ids, vec![&ReminderId::Numeric(1), &created.id]);
        assert!(records[0].notified);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_twice_keeps_a_single_timer() {
        let h = harness(PermissionState::Granted, &[]);

        h.scheduler.initialize().await;
        h.scheduler.initialize().await;
        assert_eq!(h.scheduler.sweeps_completed(), 2);

        tokio::time::advance(PERIOD).await;
        settle().await;
        assert_eq!(h.scheduler.sweeps_completed(), 3);

        tokio::time::advance(PERIOD / 2).await;
        settle().await;
        assert_eq!(h.scheduler.sweeps_completed(), 3);

        tokio::time::advance(PERIOD / 2).await;
        settle().await;
        assert_eq!(h.scheduler.sweeps_completed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_future_sweeps() {
        let h = harness(PermissionState::Granted, &[]);

        h.scheduler.initialize().await;
        assert!(h.scheduler.is_running());
        h.scheduler.stop();
        settle().await;

        tokio::time::advance(PERIOD * 3).await;
        settle().await;

        assert_eq!(h.scheduler.sweeps_completed(), 1);
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn initialize_requests_permission_once() {
        let h = harness(PermissionState::Default, &[]);
        h.platform.answer_requests_with(PermissionState::Default);

        h.scheduler.initialize().await;
        h.scheduler.initialize().await;

        assert_eq!(h.platform.permission_requests(), 1);
        h.scheduler.stop();
    }
}
