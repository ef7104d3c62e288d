//! Desktop notification platform.
//!
//! The dispatcher talks to a `NotificationPlatform`; the production
//! implementation shows notifications through the desktop notification
//! server via `notify-rust` and opens links with `open`.

use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::services::permission::{PermissionPolicy, PermissionState};

/// What happens when the user clicks the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationTarget {
    /// Bring the application UI to the front.
    FocusApp,
    /// Open a shopping link.
    OpenLink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemNotification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    /// Notifications sharing a tag replace each other.
    pub tag: String,
    pub require_interaction: bool,
    pub activation: ActivationTarget,
}

#[async_trait]
pub trait NotificationPlatform: Send + Sync + 'static {
    fn permission(&self) -> PermissionState;
    async fn request_permission(&self) -> PermissionState;
    async fn show(&self, notification: SystemNotification) -> AppResult<()>;
}

/// Stable non-zero numeric id for a tag, used as the replace id on
/// freedesktop notification servers.
pub fn tag_replace_id(tag: &str) -> u32 {
    let digest = Sha256::digest(tag.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]).max(1)
}

/// Run `work` on a named OS thread outside the runtime's blocking pool.
/// Such threads may wait on the user indefinitely without delaying runtime
/// shutdown.
fn spawn_detached<F>(work: F) -> AppResult<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("desktop-notification".to_string())
        .spawn(work)
        .map(|_| ())
        .map_err(|e| AppError::Notification(format!("failed to start notification thread: {}", e)))
}

pub struct DesktopNotifier {
    state: Mutex<PermissionState>,
    app_name: String,
    /// Opened when a notification without shopping links is activated.
    app_url: String,
}

impl DesktopNotifier {
    pub fn new(policy: PermissionPolicy, app_url: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(policy.initial_state()),
            app_name: env!("CARGO_PKG_NAME").to_string(),
            app_url: app_url.into(),
        }
    }

    fn set_state(&self, state: PermissionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn activate(target: &ActivationTarget, app_url: &str) {
        let url = match target {
            ActivationTarget::FocusApp => app_url,
            ActivationTarget::OpenLink(link) => link.as_str(),
        };
        if let Err(e) = open::that(url) {
            warn!("Failed to open {} after notification activation: {}", url, e);
        }
    }
}

#[async_trait]
impl NotificationPlatform for DesktopNotifier {
    fn permission(&self) -> PermissionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn request_permission(&self) -> PermissionState {
        if self.permission() != PermissionState::Default {
            return self.permission();
        }

        // A desktop session grants permission implicitly; the only thing to
        // check is that a notification server is actually reachable.
        #[cfg(all(unix, not(target_os = "macos")))]
        let state = match tokio::task::spawn_blocking(notify_rust::get_server_information).await
        {
            Ok(Ok(info)) => {
                info!(
                    "Notification server found: {} {} ({})",
                    info.name, info.version, info.vendor
                );
                PermissionState::Granted
            }
            Ok(Err(e)) => {
                warn!("No desktop notification server reachable: {}", e);
                PermissionState::Denied
            }
            Err(e) => {
                warn!("Notification server query panicked: {}", e);
                PermissionState::Denied
            }
        };

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        let state = PermissionState::Granted;

        self.set_state(state);
        state
    }

    async fn show(&self, notification: SystemNotification) -> AppResult<()> {
        let app_name = self.app_name.clone();
        let app_url = self.app_url.clone();
        let (shown_tx, shown_rx) = tokio::sync::oneshot::channel::<AppResult<()>>();

        // The handle never leaves this thread: after reporting the show
        // result it waits for activation until the notification closes.
        spawn_detached(move || {
            let mut n = notify_rust::Notification::new();
            n.appname(&app_name)
                .summary(&notification.title)
                .body(&notification.body);
            if let Some(icon) = &notification.icon {
                n.icon(icon);
            }
            if notification.require_interaction {
                n.timeout(notify_rust::Timeout::Never);
            }

            #[cfg(all(unix, not(target_os = "macos")))]
            {
                n.id(tag_replace_id(&notification.tag));
                n.action("default", "Open");
                if notification.require_interaction {
                    n.hint(notify_rust::Hint::Resident(true));
                }

                match n.show() {
                    Ok(handle) => {
                        let _ = shown_tx.send(Ok(()));
                        let target = notification.activation;
                        handle.wait_for_action(|action| {
                            if action == "default" {
                                DesktopNotifier::activate(&target, &app_url);
                            }
                        });
                    }
                    Err(e) => {
                        let _ = shown_tx.send(Err(AppError::Notification(e.to_string())));
                    }
                }
            }

            #[cfg(not(all(unix, not(target_os = "macos"))))]
            {
                let result = n
                    .show()
                    .map(|_| ())
                    .map_err(|e| AppError::Notification(e.to_string()));
                if result.is_ok() {
                    debug!(
                        "Activation {:?} is not tracked on this platform (app at {})",
                        notification.activation, app_url
                    );
                }
                let _ = shown_tx.send(result);
            }
        })?;

        shown_rx
            .await
            .map_err(|_| AppError::Notification("notification task ended unexpectedly".to_string()))??;
        debug!("Desktop notification shown");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_id_is_stable_and_non_zero() {
        let a = tag_replace_id("outfit-reminder-1");
        assert_eq!(a, tag_replace_id("outfit-reminder-1"));
        assert_ne!(a, tag_replace_id("outfit-reminder-2"));
        assert_ne!(a, 0);
    }

    #[test]
    fn pending_notification_threads_do_not_block_runtime_shutdown() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                spawn_detached(move || {
                    let _ = release_rx.recv();
                })
                .unwrap();
            });
            drop(runtime);
            let _ = done_tx.send(());
        });

        assert!(done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .is_ok());
        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn explicit_policy_skips_platform_query() {
        let granted = DesktopNotifier::new(PermissionPolicy::Granted, "http://localhost:3000");
        assert_eq!(granted.request_permission().await, PermissionState::Granted);

        let denied = DesktopNotifier::new(PermissionPolicy::Denied, "http://localhost:3000");
        assert_eq!(denied.request_permission().await, PermissionState::Denied);
    }
}
