//! Subscription builder
//!
//! Turns a discovered [`ObjectCatalog`] plus the fixed core objects into a
//! `printer.objects.subscribe` request and the matching snapshot query.

use crate::client::RpcSender;
use crate::discovery::ObjectCatalog;
use crate::error::{Result, SyncError};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Objects subscribed on every machine, with their field lists
pub const CORE_OBJECTS: &[(&str, &[&str])] = &[
    (
        "toolhead",
        &[
            "position",
            "homed_axes",
            "print_time",
            "max_velocity",
            "max_accel",
            "square_corner_velocity",
            "max_accel_to_decel",
            "minimum_cruise_ratio",
        ],
    ),
    (
        "gcode_move",
        &["speed_factor", "extrude_factor", "homing_origin"],
    ),
    (
        "print_stats",
        &[
            "state",
            "filename",
            "print_duration",
            "total_duration",
            "filament_used",
            "message",
        ],
    ),
    ("virtual_sdcard", &["progress", "file_path", "is_active"]),
    (
        "motion_report",
        &["live_velocity", "live_extruder_velocity"],
    ),
    ("idle_timeout", &["state"]),
];

const TEMPERATURE_FIELDS: &[&str] = &["temperature", "target"];
const EXTRUDER_FIELDS: &[&str] = &["temperature", "target", "pressure_advance", "smooth_time"];

/// Object set and field lists for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPlan {
    objects: BTreeMap<String, Vec<&'static str>>,
}

impl SubscriptionPlan {
    /// Core objects plus every discovered sensor and device
    pub fn build(catalog: &ObjectCatalog) -> Self {
        let mut objects: BTreeMap<String, Vec<&'static str>> = CORE_OBJECTS
            .iter()
            .map(|(name, fields)| (name.to_string(), fields.to_vec()))
            .collect();

        for sensor in &catalog.sensors {
            let fields = if catalog.extruders.contains(&sensor.id) {
                EXTRUDER_FIELDS
            } else {
                TEMPERATURE_FIELDS
            };
            objects.insert(sensor.id.clone(), fields.to_vec());
        }
        for device in &catalog.devices {
            objects.insert(device.id.clone(), vec![device.kind.value_field()]);
        }

        Self { objects }
    }

    pub fn fields(&self, object: &str) -> Option<&[&'static str]> {
        self.objects.get(object).map(Vec::as_slice)
    }

    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Params for `printer.objects.subscribe`
    pub fn subscribe_params(&self) -> Value {
        let objects: Map<String, Value> = self
            .objects
            .iter()
            .map(|(name, fields)| (name.clone(), json!(fields)))
            .collect();
        json!({ "objects": objects })
    }

    /// Params for `printer.objects.query` with null selectors, meaning
    /// every subscribed field
    pub fn query_params(&self) -> Value {
        let objects: Map<String, Value> = self
            .objects
            .keys()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        json!({ "objects": objects })
    }
}

/// Subscribe to the plan's objects, then query a full snapshot.
/// Returns the snapshot's `status` map, ready to merge.
pub async fn subscribe<S>(rpc: &S, plan: &SubscriptionPlan) -> Result<Value>
where
    S: RpcSender + ?Sized,
{
    rpc.call("printer.objects.subscribe", plan.subscribe_params())
        .await?;
    debug!("Subscribed to {} objects", plan.len());

    let response = rpc
        .call("printer.objects.query", plan.query_params())
        .await?;
    snapshot_status(response)
}

/// Extract the `status` map from a `printer.objects.query` response
pub fn snapshot_status(mut response: Value) -> Result<Value> {
    match response.get_mut("status") {
        Some(status) if status.is_object() => Ok(status.take()),
        _ => Err(SyncError::parsing_error(
            "Object query response has no 'status' object",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRpc;
    use pretty_assertions::assert_eq;

    fn catalog() -> ObjectCatalog {
        ObjectCatalog::from_names([
            "extruder",
            "heater_bed",
            "fan",
            "output_pin caselight",
            "mcu",
        ])
    }

    #[test]
    fn test_field_lists() {
        let plan = SubscriptionPlan::build(&catalog());

        assert_eq!(
            plan.fields("extruder"),
            Some(&["temperature", "target", "pressure_advance", "smooth_time"][..])
        );
        assert_eq!(plan.fields("heater_bed"), Some(&["temperature", "target"][..]));
        assert_eq!(plan.fields("fan"), Some(&["speed"][..]));
        assert_eq!(plan.fields("output_pin caselight"), Some(&["value"][..]));
        assert_eq!(plan.fields("mcu"), None);
        assert_eq!(plan.len(), CORE_OBJECTS.len() + 4);
    }

    #[test]
    fn test_query_uses_identical_set() {
        let plan = SubscriptionPlan::build(&catalog());
        let subscribe = plan.subscribe_params();
        let query = plan.query_params();

        let subscribed: Vec<&String> = subscribe["objects"].as_object().unwrap().keys().collect();
        let queried: Vec<&String> = query["objects"].as_object().unwrap().keys().collect();
        assert_eq!(subscribed, queried);
        assert!(query["objects"]
            .as_object()
            .unwrap()
            .values()
            .all(Value::is_null));
    }

    #[tokio::test]
    async fn test_subscribe_then_query() {
        let rpc = MockRpc::new();
        rpc.respond("printer.objects.subscribe", json!({"eventtime": 1.0, "status": {}}));
        rpc.respond(
            "printer.objects.query",
            json!({"eventtime": 1.0, "status": {"extruder": {"temperature": 21.0}}}),
        );

        let plan = SubscriptionPlan::build(&catalog());
        let snapshot = subscribe(&rpc, &plan).await.unwrap();

        assert_eq!(snapshot, json!({"extruder": {"temperature": 21.0}}));
        let methods: Vec<String> = rpc.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["printer.objects.subscribe", "printer.objects.query"]);
    }

    #[tokio::test]
    async fn test_subscribe_propagates_remote_error() {
        let rpc = MockRpc::new();
        rpc.fail("printer.objects.subscribe", 503, "Klippy not ready");
        let plan = SubscriptionPlan::build(&ObjectCatalog::default());

        let err = subscribe(&rpc, &plan).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote { code: 503, .. }));
        assert!(rpc.calls_for("printer.objects.query").is_empty());
    }
}
