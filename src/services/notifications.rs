use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::db::models::ReminderRecord;
use crate::services::permission::{PermissionGateway, PermissionState};
use crate::services::platform::{ActivationTarget, SystemNotification};

/// Name of the in-process event carrying a dispatched reminder.
pub const REMINDER_EVENT_CHANNEL: &str = "outfit-reminder";

const EVENT_BUFFER: usize = 64;

/// Result of one dispatch, mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub system_notification: bool,
    pub event_receivers: usize,
}

#[derive(Debug, Clone)]
pub struct NotificationTemplate {
    pub title: String,
    pub icon: Option<String>,
    pub require_interaction: bool,
}

impl From<&NotificationConfig> for NotificationTemplate {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            title: config.title.clone(),
            icon: config.icon.clone(),
            require_interaction: config.require_interaction,
        }
    }
}

impl Default for NotificationTemplate {
    fn default() -> Self {
        Self {
            title: "Outfit Reminder".to_string(),
            icon: None,
            require_interaction: true,
        }
    }
}

/// Delivers due reminders: a system notification when permitted, and an
/// in-process `outfit-reminder` event every time.
pub struct NotificationDispatcher {
    gateway: Arc<PermissionGateway>,
    events: broadcast::Sender<ReminderRecord>,
    template: NotificationTemplate,
}

impl NotificationDispatcher {
    pub fn new(gateway: Arc<PermissionGateway>, template: NotificationTemplate) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            gateway,
            events,
            template,
        }
    }

    pub fn gateway(&self) -> &Arc<PermissionGateway> {
        &self.gateway
    }

    /// Receive every reminder dispatched from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReminderRecord> {
        self.events.subscribe()
    }

    pub fn build_notification(&self, record: &ReminderRecord) -> SystemNotification {
        let activation = match record.shopping_links.first() {
            Some(link) => ActivationTarget::OpenLink(link.clone()),
            None => ActivationTarget::FocusApp,
        };

        SystemNotification {
            title: self.template.title.clone(),
            body: record.message.clone(),
            icon: self.template.icon.clone(),
            tag: record.notification_tag(),
            require_interaction: self.template.require_interaction,
            activation,
        }
    }

    /// Never fails. A system notification error is logged and the in-process
    /// event is published regardless.
    pub async fn dispatch(&self, record: &ReminderRecord) -> DispatchOutcome {
        let mut system_notification = false;

        match self.gateway.platform() {
            Some(platform) if self.gateway.state() == PermissionState::Granted => {
                match platform.show(self.build_notification(record)).await {
                    Ok(()) => system_notification = true,
                    Err(e) => warn!(
                        "System notification for reminder {} failed: {}",
                        record.id, e
                    ),
                }
            }
            Some(_) => debug!(
                "Notification permission is {}; reminder {} goes to in-process listeners only",
                self.gateway.state(),
                record.id
            ),
            None => {}
        }

        // No receivers is not an error; the UI may simply not be listening.
        let event_receivers = self.events.send(record.clone()).unwrap_or(0);
        debug!(
            "Published '{}' event for reminder {} to {} listener(s)",
            REMINDER_EVENT_CHANNEL, record.id, event_receivers
        );

        DispatchOutcome {
            system_notification,
            event_receivers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ReminderId;
    use crate::services::platform::testing::RecordingPlatform;
    use crate::services::platform::NotificationPlatform;
    use chrono::{Duration, Utc};

    fn record(links: Vec<&str>) -> ReminderRecord {
        let now = Utc::now();
        ReminderRecord {
            id: ReminderId::Text("abc".to_string()),
            reminder_date: now - Duration::minutes(5),
            event_date: now + Duration::days(1),
            occasion: "Wedding".to_string(),
            message: "Pick up the suit".to_string(),
            shopping_links: links.into_iter().map(String::from).collect(),
            notified: false,
            created_at: now - Duration::days(3),
            source_event_id: None,
        }
    }

    fn dispatcher(platform: Option<Arc<RecordingPlatform>>) -> NotificationDispatcher {
        let platform = platform.map(|p| p as Arc<dyn NotificationPlatform>);
        NotificationDispatcher::new(
            Arc::new(PermissionGateway::new(platform)),
            NotificationTemplate::default(),
        )
    }

    #[tokio::test]
    async fn granted_shows_notification_and_emits_event() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Granted));
        let dispatcher = dispatcher(Some(platform.clone()));
        let mut events = dispatcher.subscribe();

        let outcome = dispatcher.dispatch(&record(vec![])).await;

        assert!(outcome.system_notification);
        assert_eq!(outcome.event_receivers, 1);
        let shown = platform.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Outfit Reminder");
        assert_eq!(shown[0].body, "Pick up the suit");
        assert_eq!(shown[0].tag, "outfit-reminder-abc");
        assert!(shown[0].require_interaction);
        assert_eq!(shown[0].activation, ActivationTarget::FocusApp);
        assert_eq!(events.recv().await.unwrap().id, record(vec![]).id);
    }

    #[tokio::test]
    async fn denied_emits_event_without_touching_platform() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Denied));
        let dispatcher = dispatcher(Some(platform.clone()));
        let mut events = dispatcher.subscribe();

        let outcome = dispatcher.dispatch(&record(vec![])).await;

        assert!(!outcome.system_notification);
        assert!(platform.shown().is_empty());
        assert_eq!(platform.permission_requests(), 0);
        assert_eq!(events.recv().await.unwrap().message, "Pick up the suit");
    }

    #[tokio::test]
    async fn show_failure_still_emits_event() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Granted));
        platform.fail_show(true);
        let dispatcher = dispatcher(Some(platform));
        let mut events = dispatcher.subscribe();

        let outcome = dispatcher.dispatch(&record(vec![])).await;

        assert!(!outcome.system_notification);
        assert!(events.recv().await.is_ok());
    }

    #[tokio::test]
    async fn no_platform_and_no_listeners_is_fine() {
        let dispatcher = dispatcher(None);
        let outcome = dispatcher.dispatch(&record(vec![])).await;
        assert_eq!(
            outcome,
            DispatchOutcome {
                system_notification: false,
                event_receivers: 0
            }
        );
    }

    #[test]
    fn first_shopping_link_becomes_activation_target() {
        let dispatcher = dispatcher(None);
        let n = dispatcher.build_notification(&record(vec![
            "https://shop.example/a",
            "https://shop.example/b",
        ]));
        assert_eq!(
            n.activation,
            ActivationTarget::OpenLink("https://shop.example/a".to_string())
        );
    }
}
