//! Signals forwarded to the notification collaborator
//!
//! The transport reports remote error payloads and firmware lifecycle
//! changes here; interpreting them (toasts, persistent banners) is left to
//! whoever subscribes.

use serde::{Deserialize, Serialize};

/// Firmware lifecycle as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Startup,
    Ready,
    Shutdown,
    Error,
}

impl SystemStatus {
    /// Map a lifecycle notification method to the status it announces
    pub fn from_notification(method: &str) -> Option<Self> {
        match method {
            "notify_klippy_shutdown" => Some(SystemStatus::Shutdown),
            "notify_klippy_disconnected" => Some(SystemStatus::Error),
            "notify_klippy_ready" => Some(SystemStatus::Ready),
            _ => None,
        }
    }

    /// Parse the `state` field of `printer.info`
    pub fn from_klippy_state(state: &str) -> Option<Self> {
        match state {
            "startup" => Some(SystemStatus::Startup),
            "ready" => Some(SystemStatus::Ready),
            "shutdown" => Some(SystemStatus::Shutdown),
            "error" => Some(SystemStatus::Error),
            _ => None,
        }
    }

    /// Whether the firmware is stopped and needs a restart
    pub fn is_halted(&self) -> bool {
        matches!(self, SystemStatus::Shutdown | SystemStatus::Error)
    }
}

/// Event published on the alert stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// A request was answered with an error object
    RemoteError { code: i64, message: String },
    /// Firmware lifecycle changed
    SystemStatus { status: SystemStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_notifications() {
        assert_eq!(
            SystemStatus::from_notification("notify_klippy_shutdown"),
            Some(SystemStatus::Shutdown)
        );
        assert_eq!(
            SystemStatus::from_notification("notify_klippy_disconnected"),
            Some(SystemStatus::Error)
        );
        assert_eq!(
            SystemStatus::from_notification("notify_klippy_ready"),
            Some(SystemStatus::Ready)
        );
        assert_eq!(SystemStatus::from_notification("notify_status_update"), None);
    }

    #[test]
    fn test_halted_states() {
        assert!(SystemStatus::Shutdown.is_halted());
        assert!(SystemStatus::Error.is_halted());
        assert!(!SystemStatus::from_klippy_state("ready").unwrap().is_halted());
        assert_eq!(SystemStatus::from_klippy_state("bogus"), None);
    }
}
