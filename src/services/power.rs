//! Device power boundary
//!
//! Power control is an optional server component. A server without it
//! answers every `machine.device_power.*` call with method-not-found, which
//! is treated as "no devices" rather than an error.

use crate::client::{Notification, RpcSender};
use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Notification carrying power device changes
pub const POWER_CHANGED: &str = "notify_power_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    On,
    Off,
    #[default]
    Init,
    Error,
    /// The server has no power component
    Unavailable,
}

impl PowerState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "on" => PowerState::On,
            "off" => PowerState::Off,
            "init" => PowerState::Init,
            "unavailable" => PowerState::Unavailable,
            _ => PowerState::Error,
        }
    }

    /// Whether the device can be switched
    pub fn is_available(&self) -> bool {
        !matches!(self, PowerState::Error | PowerState::Unavailable)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Init => "init",
            PowerState::Error => "error",
            PowerState::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

impl Serialize for PowerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PowerState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::parse(&String::deserialize(deserializer)?))
    }
}

/// One switchable power device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerDevice {
    pub device: String,
    #[serde(default)]
    pub status: PowerState,
    #[serde(default)]
    pub locked_while_printing: bool,
    #[serde(rename = "type", default = "unknown_type")]
    pub device_type: String,
}

fn unknown_type() -> String {
    "unknown".to_string()
}

impl PowerDevice {
    /// Locked devices refuse switching while a job is printing or paused
    pub fn is_locked(&self, print_stats_state: Option<&str>) -> bool {
        self.locked_while_printing && matches!(print_stats_state, Some("printing" | "paused"))
    }
}

/// Power component client
#[derive(Debug)]
pub struct PowerService<S> {
    rpc: S,
}

impl<S: RpcSender> PowerService<S> {
    pub fn new(rpc: S) -> Self {
        Self { rpc }
    }

    /// List configured devices; empty when the component is not installed
    pub async fn list_devices(&self) -> Result<Vec<PowerDevice>> {
        match self.rpc.call("machine.device_power.devices", json!({})).await {
            Ok(result) => {
                let devices = result.get("devices").cloned().unwrap_or(Value::Array(vec![]));
                Ok(serde_json::from_value(devices)?)
            }
            Err(e) if e.is_method_not_found() => {
                debug!("Power component not installed");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Query one device. Failures map to a state instead of an error.
    pub async fn device_status(&self, device: &str) -> PowerState {
        match self
            .rpc
            .call("machine.device_power.status", json!({ device: null }))
            .await
        {
            Ok(result) => result
                .get(device)
                .and_then(Value::as_str)
                .map(PowerState::parse)
                .unwrap_or(PowerState::Error),
            Err(e) if e.is_method_not_found() => PowerState::Unavailable,
            Err(e) => {
                warn!("Failed to query power device '{}': {}", device, e);
                PowerState::Error
            }
        }
    }

    /// Switch a device on or off; returns the state the server reports
    pub async fn set_power(&self, device: &str, on: bool) -> Result<PowerState> {
        let method = if on {
            "machine.device_power.on"
        } else {
            "machine.device_power.off"
        };
        let result = self.rpc.call(method, json!({ device: null })).await?;
        Ok(result
            .get(device)
            .and_then(Value::as_str)
            .map(PowerState::parse)
            .unwrap_or(PowerState::Init))
    }
}

/// Last known state of every power device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerRegistry {
    devices: BTreeMap<String, PowerDevice>,
}

impl PowerRegistry {
    pub fn new(devices: Vec<PowerDevice>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.device.clone(), device))
                .collect(),
        }
    }

    pub fn get(&self, device: &str) -> Option<&PowerDevice> {
        self.devices.get(device)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Apply a `notify_power_changed` push; returns whether anything changed
    pub fn apply_power_changed(&mut self, notification: &Notification) -> bool {
        if notification.method != POWER_CHANGED {
            return false;
        }
        let Some(updates) = notification.payload().and_then(Value::as_object) else {
            return false;
        };

        let mut changed = false;
        for (name, info) in updates {
            let status = info
                .get("status")
                .and_then(Value::as_str)
                .map(PowerState::parse)
                .unwrap_or_default();
            let entry = self.devices.entry(name.clone()).or_insert_with(|| PowerDevice {
                device: name.clone(),
                status,
                locked_while_printing: false,
                device_type: unknown_type(),
            });
            entry.status = status;
            entry.locked_while_printing = info
                .get("locked_while_printing")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let Some(kind) = info.get("type").and_then(Value::as_str) {
                entry.device_type = kind.to_string();
            }
            changed = true;
        }
        changed
    }

    /// The device named `preferred`, else one named "printer", else the first
    pub fn select(&self, preferred: Option<&str>) -> Option<&PowerDevice> {
        preferred
            .and_then(|name| self.devices.get(name))
            .or_else(|| {
                self.devices
                    .values()
                    .find(|d| d.device.eq_ignore_ascii_case("printer"))
            })
            .or_else(|| self.devices.values().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::METHOD_NOT_FOUND;
    use crate::mock::MockRpc;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_missing_component_lists_nothing() {
        let rpc = Arc::new(MockRpc::new());
        rpc.fail("machine.device_power.devices", METHOD_NOT_FOUND, "Method not found");
        rpc.fail("machine.device_power.status", METHOD_NOT_FOUND, "Method not found");
        let power = PowerService::new(rpc.clone());

        assert!(power.list_devices().await.unwrap().is_empty());
        assert_eq!(power.device_status("printer").await, PowerState::Unavailable);
    }

    #[tokio::test]
    async fn test_other_failures() {
        let rpc = Arc::new(MockRpc::new());
        rpc.fail("machine.device_power.devices", 500, "Internal error");
        rpc.fail("machine.device_power.status", 500, "Internal error");
        let power = PowerService::new(rpc.clone());

        assert!(power.list_devices().await.is_err());
        assert_eq!(power.device_status("printer").await, PowerState::Error);
    }

    #[tokio::test]
    async fn test_list_and_switch() {
        let rpc = Arc::new(MockRpc::new());
        rpc.respond(
            "machine.device_power.devices",
            json!({"devices": [
                {"device": "printer", "status": "off", "locked_while_printing": true, "type": "gpio"},
                {"device": "lights", "status": "on"}
            ]}),
        );
        rpc.respond("machine.device_power.on", json!({"printer": "on"}));
        let power = PowerService::new(rpc.clone());

        let devices = power.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].status, PowerState::Off);
        assert_eq!(devices[1].device_type, "unknown");

        assert_eq!(power.set_power("printer", true).await.unwrap(), PowerState::On);
        assert_eq!(
            rpc.calls_for("machine.device_power.on"),
            vec![json!({"printer": null})]
        );
    }

    #[test]
    fn test_power_changed_notification() {
        let mut registry = PowerRegistry::new(vec![PowerDevice {
            device: "printer".into(),
            status: PowerState::Off,
            locked_while_printing: false,
            device_type: "gpio".into(),
        }]);

        let changed = registry.apply_power_changed(&Notification::new(
            POWER_CHANGED,
            Some(json!([{
                "printer": {"status": "on", "locked_while_printing": true},
                "heater": {"status": "off", "type": "tplink_smartplug"}
            }])),
        ));

        assert!(changed);
        let printer = registry.get("printer").unwrap();
        assert_eq!(printer.status, PowerState::On);
        assert_eq!(printer.device_type, "gpio");
        assert!(printer.is_locked(Some("printing")));
        assert!(!printer.is_locked(Some("standby")));
        assert_eq!(registry.get("heater").unwrap().status, PowerState::Off);

        assert!(!registry.apply_power_changed(&Notification::new("notify_status_update", None)));
    }

    #[test]
    fn test_select_prefers_printer() {
        let registry = PowerRegistry::new(vec![
            PowerDevice {
                device: "aux".into(),
                status: PowerState::On,
                locked_while_printing: false,
                device_type: "gpio".into(),
            },
            PowerDevice {
                device: "Printer".into(),
                status: PowerState::Off,
                locked_while_printing: false,
                device_type: "gpio".into(),
            },
        ]);
        assert_eq!(registry.select(None).unwrap().device, "Printer");
        assert_eq!(registry.select(Some("aux")).unwrap().device, "aux");
        assert_eq!(registry.select(Some("missing")).unwrap().device, "Printer");
        assert!(PowerRegistry::default().select(None).is_none());
    }
}
