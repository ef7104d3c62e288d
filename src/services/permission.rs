use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::services::platform::NotificationPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Default,
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
            PermissionState::Default => "default",
        })
    }
}

/// Operator choice for desktop notifications (`DESKTOP_NOTIFICATIONS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    Granted,
    Denied,
    /// Start in `default` and query the platform on the first request.
    Ask,
}

impl PermissionPolicy {
    pub fn initial_state(&self) -> PermissionState {
        match self {
            PermissionPolicy::Granted => PermissionState::Granted,
            PermissionPolicy::Denied => PermissionState::Denied,
            PermissionPolicy::Ask => PermissionState::Default,
        }
    }
}

impl FromStr for PermissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "granted" | "1" | "true" | "yes" => Ok(PermissionPolicy::Granted),
            "denied" | "0" | "false" | "no" => Ok(PermissionPolicy::Denied),
            "ask" | "default" | "" => Ok(PermissionPolicy::Ask),
            other => Err(other.to_string()),
        }
    }
}

/// Gatekeeper for system notification permission.
///
/// Without a platform the gateway always answers `denied` and never touches
/// anything, which makes the dispatcher fall back to in-process events only.
pub struct PermissionGateway {
    platform: Option<Arc<dyn NotificationPlatform>>,
    auto_requested: AtomicBool,
}

impl PermissionGateway {
    pub fn new(platform: Option<Arc<dyn NotificationPlatform>>) -> Self {
        Self {
            platform,
            auto_requested: AtomicBool::new(false),
        }
    }

    pub fn platform(&self) -> Option<&Arc<dyn NotificationPlatform>> {
        self.platform.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.platform.is_some()
    }

    pub fn state(&self) -> PermissionState {
        match &self.platform {
            Some(platform) => platform.permission(),
            None => PermissionState::Denied,
        }
    }

    /// Automatic request made on scheduler start. Prompts at most once per
    /// gateway, and only while the state is still `default`.
    pub async fn request_permission(&self) -> PermissionState {
        let Some(platform) = &self.platform else {
            debug!("No notification platform available; using in-process events only");
            return PermissionState::Denied;
        };

        let current = platform.permission();
        if current != PermissionState::Default {
            return current;
        }

        if self.auto_requested.swap(true, Ordering::SeqCst) {
            return current;
        }

        let state = platform.request_permission().await;
        info!("Notification permission resolved to {}", state);
        state
    }

    /// Explicit, user-initiated request. Still a no-op once the state is decided.
    pub async fn prompt(&self) -> PermissionState {
        match &self.platform {
            Some(platform) if platform.permission() == PermissionState::Default => {
                self.auto_requested.store(true, Ordering::SeqCst);
                platform.request_permission().await
            }
            Some(platform) => platform.permission(),
            None => PermissionState::Denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::platform::testing::RecordingPlatform;

    #[tokio::test]
    async fn missing_platform_short_circuits_to_denied() {
        let gateway = PermissionGateway::new(None);
        assert_eq!(gateway.request_permission().await, PermissionState::Denied);
        assert!(!gateway.is_available());
    }

    #[tokio::test]
    async fn requests_only_once_while_default() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Default));
        platform.answer_requests_with(PermissionState::Default);
        let gateway = PermissionGateway::new(Some(platform.clone()));

        gateway.request_permission().await;
        gateway.request_permission().await;

        assert_eq!(platform.permission_requests(), 1);
    }

    #[tokio::test]
    async fn decided_state_is_never_reprompted() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Denied));
        let gateway = PermissionGateway::new(Some(platform.clone()));

        assert_eq!(gateway.request_permission().await, PermissionState::Denied);
        assert_eq!(gateway.prompt().await, PermissionState::Denied);
        assert_eq!(platform.permission_requests(), 0);
    }

    #[tokio::test]
    async fn default_resolves_through_platform() {
        let platform = Arc::new(RecordingPlatform::new(PermissionState::Default));
        platform.answer_requests_with(PermissionState::Granted);
        let gateway = PermissionGateway::new(Some(platform.clone()));

        assert_eq!(gateway.request_permission().await, PermissionState::Granted);
        assert_eq!(gateway.state(), PermissionState::Granted);
    }

    #[test]
    fn policy_parses_env_values() {
        assert_eq!("granted".parse::<PermissionPolicy>(), Ok(PermissionPolicy::Granted));
        assert_eq!("No".parse::<PermissionPolicy>(), Ok(PermissionPolicy::Denied));
        assert_eq!("ask".parse::<PermissionPolicy>(), Ok(PermissionPolicy::Ask));
        assert!("maybe".parse::<PermissionPolicy>().is_err());
    }
}
