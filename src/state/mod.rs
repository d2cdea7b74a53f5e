//! Authoritative in-memory machine model
//!
//! The model is owned by [`StateEngine`] and mutated only through its merge
//! path. Consumers receive cloned snapshots published by the session.

pub mod engine;
pub mod history;
pub mod status;

pub use engine::{FileMetadata, MergeOutcome, StateEngine};
pub use history::{History, HistorySample, HISTORY_CAPACITY};
pub use status::MachineStatus;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extruder selected when discovery finds none
pub const DEFAULT_EXTRUDER: &str = "extruder";

/// Toolhead coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

/// A temperature-capable object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub label: String,
    pub current: f64,
    pub target: Option<f64>,
}

impl SensorEntry {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            current: 0.0,
            target: Some(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Fan,
    Pin,
}

impl DeviceKind {
    /// Status field carrying the device's current output
    pub fn value_field(&self) -> &'static str {
        match self {
            DeviceKind::Fan => "speed",
            DeviceKind::Pin => "value",
        }
    }
}

/// A fan or output pin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub value: f64,
    pub max: f64,
}

/// The deceleration limit reported by the firmware.
///
/// Newer firmware reports a minimum cruise ratio, older firmware an
/// accel-to-decel value. Only one of the two is ever held.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "value", rename_all = "snake_case")]
pub enum DecelLimit {
    MinimumCruiseRatio(f64),
    MaxAccelToDecel(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionLimits {
    pub max_velocity: Option<f64>,
    pub max_accel: Option<f64>,
    pub square_corner_velocity: Option<f64>,
    pub decel: Option<DecelLimit>,
}

/// Fields of the active print job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub filename: Option<String>,
    /// Fraction of the file consumed, 0.0 to 1.0
    pub progress: f64,
    pub print_duration: f64,
    pub total_duration: f64,
    pub filament_used: f64,
    pub message: Option<String>,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
}

/// Slicer metadata for the active file
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub layer_height: Option<f64>,
    pub first_layer_height: Option<f64>,
    pub object_height: Option<f64>,
    pub layer_count: Option<u32>,
}

/// Operator-chosen amounts read by the command emitters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Increments {
    /// Jog step in mm
    pub jog_distance: f64,
    /// Jog feedrate in mm/min
    pub jog_feedrate: f64,
    /// Extrude/retract length in mm
    pub extrude_amount: f64,
    /// Extrude/retract feedrate in mm/min
    pub extrude_feedrate: f64,
}

impl Default for Increments {
    fn default() -> Self {
        Self {
            jog_distance: 10.0,
            jog_feedrate: 3000.0,
            extrude_amount: 10.0,
            extrude_feedrate: 300.0,
        }
    }
}

/// Aggregate root of everything known about the machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineModel {
    pub status: MachineStatus,
    /// Raw `print_stats.state`
    pub print_stats_state: Option<String>,
    /// Raw `idle_timeout.state`
    pub idle_state: Option<String>,

    pub position: Position,
    pub homed_axes: String,

    pub sensors: BTreeMap<String, SensorEntry>,
    pub devices: BTreeMap<String, DeviceEntry>,
    pub history: History,

    pub extruders: Vec<String>,
    pub active_extruder: String,
    pub mcus: Vec<String>,
    pub pressure_advance: Option<f64>,
    pub smooth_time: Option<f64>,

    /// Percent, 100 = unscaled
    pub speed_factor: u32,
    /// Percent, 100 = unscaled
    pub extrusion_factor: u32,
    pub limits: MotionLimits,

    pub job: PrintJob,
    pub layer_metadata: LayerMetadata,
    pub last_completed_filename: Option<String>,
    pub z_offset: f64,

    pub live_velocity: f64,
    pub live_extruder_velocity: f64,

    pub increments: Increments,
}

impl Default for MachineModel {
    fn default() -> Self {
        Self {
            status: MachineStatus::Standby,
            print_stats_state: None,
            idle_state: None,
            position: Position::default(),
            homed_axes: String::new(),
            sensors: BTreeMap::new(),
            devices: BTreeMap::new(),
            history: History::default(),
            extruders: Vec::new(),
            active_extruder: DEFAULT_EXTRUDER.to_string(),
            mcus: Vec::new(),
            pressure_advance: None,
            smooth_time: None,
            speed_factor: 100,
            extrusion_factor: 100,
            limits: MotionLimits::default(),
            job: PrintJob::default(),
            layer_metadata: LayerMetadata::default(),
            last_completed_filename: None,
            z_offset: 0.0,
            live_velocity: 0.0,
            live_extruder_velocity: 0.0,
            increments: Increments::default(),
        }
    }
}

impl MachineModel {
    /// Whether `axis` (x, y or z) has been homed
    pub fn is_homed(&self, axis: char) -> bool {
        self.homed_axes.contains(axis.to_ascii_lowercase())
    }

    /// Sensor entry of the active extruder, if tracked
    pub fn active_extruder_sensor(&self) -> Option<&SensorEntry> {
        self.sensors.get(&self.active_extruder)
    }
}
