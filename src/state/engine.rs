//! State reconciliation engine
//!
//! Every status fragment, whether from the initial snapshot query or a
//! `notify_status_update` push, goes through [`StateEngine::merge`]. A
//! fragment maps object names to partial field maps; any key may be absent
//! and unrecognized fields are skipped, so merging never fails.
//!
//! The engine performs no I/O. When a merge needs file metadata it says so
//! in the returned [`MergeOutcome`] and the caller hands the result back
//! through [`StateEngine::apply_file_metadata`].

use super::{
    DecelLimit, DeviceEntry, Increments, LayerMetadata, MachineModel, MachineStatus, Position,
    SensorEntry,
};
use crate::discovery::{classify, device_max, Category, ObjectCatalog};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Side effects requested by one merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// File whose slicer metadata should be fetched
    pub fetch_metadata: Option<String>,
    pub status_changed: bool,
}

/// Slicer metadata as returned by `server.files.metadata`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub layer_height: Option<f64>,
    #[serde(default)]
    pub first_layer_height: Option<f64>,
    #[serde(default)]
    pub object_height: Option<f64>,
    #[serde(default)]
    pub layer_count: Option<u32>,
}

/// Owner of the machine model
#[derive(Debug, Clone, Default)]
pub struct StateEngine {
    model: MachineModel,
}

impl StateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_increments(increments: Increments) -> Self {
        Self {
            model: MachineModel {
                increments,
                ..MachineModel::default()
            },
        }
    }

    pub fn model(&self) -> &MachineModel {
        &self.model
    }

    /// Merge a status fragment stamped with the current time
    pub fn merge(&mut self, fragment: &Value) -> MergeOutcome {
        self.merge_at(fragment, chrono::Utc::now().timestamp_millis())
    }

    /// Merge a status fragment; `now_ms` stamps any history sample
    pub fn merge_at(&mut self, fragment: &Value, now_ms: i64) -> MergeOutcome {
        let Some(fragment) = fragment.as_object() else {
            debug!("Ignoring non-object status fragment");
            return MergeOutcome::default();
        };

        let model = &mut self.model;
        let previous_status = model.status.clone();
        let previous_raw = model.print_stats_state.clone();
        let previous_filename = model.job.filename.clone();
        let mut outcome = MergeOutcome::default();

        if let Some(toolhead) = object(fragment, "toolhead") {
            apply_position(model, toolhead);
            apply_limits(model, toolhead);
        }

        let batch = apply_tracked_objects(model, fragment);
        if !batch.is_empty() {
            model.history.record(now_ms, &batch, &model.sensors);
        }

        if let Some(stats) = object(fragment, "print_stats") {
            apply_print_stats(model, stats);
        }
        if model.print_stats_state.as_deref() == Some("printing")
            && (previous_raw.as_deref() != Some("printing")
                || model.job.filename != previous_filename)
        {
            outcome.fetch_metadata = model.job.filename.clone();
        }

        if let Some(state) = object(fragment, "idle_timeout").and_then(|idle| text(idle, "state")) {
            model.idle_state = Some(state.to_string());
        }

        model.status = MachineStatus::derive(
            model.print_stats_state.as_deref(),
            model.idle_state.as_deref(),
        );

        if model.status != previous_status {
            info!("Machine status {} -> {}", previous_status, model.status);
            if model.status.is_finished() {
                if let Some(filename) = model.job.filename.clone() {
                    model.last_completed_filename = Some(filename);
                }
            }
            if previous_status == MachineStatus::Printing && model.status.ends_print() {
                reset_print_fields(model);
            }
        }

        if let Some(sdcard) = object(fragment, "virtual_sdcard") {
            apply_file_reader(model, sdcard);
        }

        if let Some(gcode_move) = object(fragment, "gcode_move") {
            if let Some(factor) = number(gcode_move, "speed_factor") {
                model.speed_factor = percent(factor);
            }
            if let Some(factor) = number(gcode_move, "extrude_factor") {
                model.extrusion_factor = percent(factor);
            }
            if let Some(z) = gcode_move
                .get("homing_origin")
                .and_then(Value::as_array)
                .and_then(|origin| origin.get(2))
                .and_then(Value::as_f64)
            {
                model.z_offset = z;
            }
        }

        if let Some(motion) = object(fragment, "motion_report") {
            if let Some(v) = number(motion, "live_velocity") {
                model.live_velocity = v;
            }
            if let Some(v) = number(motion, "live_extruder_velocity") {
                model.live_extruder_velocity = v;
            }
        }
        if model.status != MachineStatus::Printing {
            model.live_velocity = 0.0;
            model.live_extruder_velocity = 0.0;
        }

        outcome.status_changed = model.status != previous_status;
        outcome
    }

    /// Register discovered objects without touching entries already tracked
    pub fn apply_catalog(&mut self, catalog: &ObjectCatalog) {
        let model = &mut self.model;
        for sensor in &catalog.sensors {
            model
                .sensors
                .entry(sensor.id.clone())
                .or_insert_with(|| sensor.clone());
        }
        for device in &catalog.devices {
            model
                .devices
                .entry(device.id.clone())
                .or_insert_with(|| device.clone());
        }
        model.extruders = catalog.extruders.clone();
        model.mcus = catalog.mcus.clone();
        model.active_extruder = catalog.select_extruder(Some(model.active_extruder.as_str()));
    }

    /// Store slicer metadata for `filename` if it is still the job being
    /// printed or paused. Returns whether the metadata was applied.
    pub fn apply_file_metadata(&mut self, filename: &str, metadata: FileMetadata) -> bool {
        let model = &mut self.model;
        if model.job.filename.as_deref() != Some(filename) {
            debug!("Discarding metadata for '{}': no longer the active job", filename);
            return false;
        }
        if !matches!(model.status, MachineStatus::Printing | MachineStatus::Paused) {
            debug!("Discarding metadata for '{}': job is {}", filename, model.status);
            return false;
        }

        model.layer_metadata = LayerMetadata {
            layer_height: metadata.layer_height,
            first_layer_height: metadata.first_layer_height.or(metadata.layer_height),
            object_height: metadata.object_height,
            layer_count: metadata.layer_count,
        };
        model.job.total_layers = total_layers(&model.layer_metadata);
        model.job.current_layer = Some(0);
        true
    }

    /// Select the extruder used by extrude/retract commands
    pub fn select_extruder(&mut self, name: &str) -> Result<()> {
        if !self.model.extruders.iter().any(|e| e == name) {
            return Err(SyncError::invalid_input(format!("Unknown extruder '{name}'")));
        }
        if self.model.active_extruder != name {
            self.model.active_extruder = name.to_string();
            self.model.pressure_advance = None;
            self.model.smooth_time = None;
        }
        Ok(())
    }

    pub fn set_increments(&mut self, increments: Increments) {
        self.model.increments = increments;
    }

    /// Forget everything tied to the closed connection. Operator settings,
    /// the preferred extruder and the reprint filename survive.
    pub fn reset_connection(&mut self) {
        let previous = std::mem::take(&mut self.model);
        self.model = MachineModel {
            increments: previous.increments,
            active_extruder: previous.active_extruder,
            last_completed_filename: previous.last_completed_filename,
            ..MachineModel::default()
        };
    }
}

fn object<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    map.get(key).and_then(Value::as_object)
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn text<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn percent(factor: f64) -> u32 {
    (factor * 100.0).round().max(0.0) as u32
}

fn apply_position(model: &mut MachineModel, toolhead: &Map<String, Value>) {
    if let Some(axes) = toolhead.get("position").and_then(Value::as_array) {
        let coords: Vec<f64> = axes.iter().filter_map(Value::as_f64).collect();
        if axes.len() >= 4 && coords.len() == axes.len() {
            model.position = Position {
                x: coords[0],
                y: coords[1],
                z: coords[2],
                e: coords[3],
            };
            if model.status == MachineStatus::Printing {
                if let Some(layer) = layer_at(model.position.z, &model.layer_metadata) {
                    model.job.current_layer = Some(layer);
                }
            }
        }
    }
    if let Some(homed) = text(toolhead, "homed_axes") {
        model.homed_axes = homed.to_string();
    }
}

fn apply_limits(model: &mut MachineModel, toolhead: &Map<String, Value>) {
    let limits = &mut model.limits;
    if let Some(v) = number(toolhead, "max_velocity") {
        limits.max_velocity = Some(v);
    }
    if let Some(v) = number(toolhead, "max_accel") {
        limits.max_accel = Some(v);
    }
    if let Some(v) = number(toolhead, "square_corner_velocity") {
        limits.square_corner_velocity = Some(v);
    }
    // minimum_cruise_ratio is applied last so it wins when both arrive
    if let Some(v) = number(toolhead, "max_accel_to_decel") {
        limits.decel = Some(DecelLimit::MaxAccelToDecel(v));
    }
    if let Some(v) = number(toolhead, "minimum_cruise_ratio") {
        limits.decel = Some(DecelLimit::MinimumCruiseRatio(v));
    }
}

/// Copy fields of tracked sensors and devices; returns this batch's
/// temperature readings
fn apply_tracked_objects(
    model: &mut MachineModel,
    fragment: &Map<String, Value>,
) -> BTreeMap<String, f64> {
    let mut batch = BTreeMap::new();

    for (id, fields) in fragment {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        if !model.sensors.contains_key(id) && !model.devices.contains_key(id) {
            track_unseen(model, id);
        }

        if let Some(sensor) = model.sensors.get_mut(id) {
            if let Some(current) = number(fields, "temperature") {
                sensor.current = current;
                batch.insert(id.clone(), current);
            }
            if let Some(target) = number(fields, "target") {
                sensor.target = Some(target);
            }
        }

        if let Some(device) = model.devices.get_mut(id) {
            if let Some(value) = number(fields, device.kind.value_field()) {
                device.value = value;
            }
        }

        if *id == model.active_extruder {
            if let Some(pa) = number(fields, "pressure_advance") {
                model.pressure_advance = Some(pa);
            }
            if let Some(st) = number(fields, "smooth_time") {
                model.smooth_time = Some(st);
            }
        }
    }

    batch
}

/// Start tracking an object first seen in an update
fn track_unseen(model: &mut MachineModel, id: &str) {
    let Some(classified) = classify(id) else {
        return;
    };
    if classified.category.is_temperature() {
        debug!("Tracking sensor '{}' first seen in an update", id);
        model
            .sensors
            .insert(id.to_string(), SensorEntry::new(id, classified.label));
        if classified.category == Category::Extruder
            && !model.extruders.iter().any(|e| e == id)
        {
            model.extruders.push(id.to_string());
        }
    } else if let Some(kind) = classified.category.device_kind() {
        debug!("Tracking device '{}' first seen in an update", id);
        model.devices.insert(
            id.to_string(),
            DeviceEntry {
                id: id.to_string(),
                label: classified.label,
                kind,
                value: 0.0,
                max: device_max(id, kind),
            },
        );
    }
}

fn apply_print_stats(model: &mut MachineModel, stats: &Map<String, Value>) {
    if let Some(state) = text(stats, "state") {
        model.print_stats_state = Some(state.to_string());
    }
    if let Some(filename) = text(stats, "filename") {
        model.job.filename = (!filename.is_empty()).then(|| filename.to_string());
    }
    if let Some(v) = number(stats, "print_duration") {
        model.job.print_duration = v;
    }
    if let Some(v) = number(stats, "total_duration") {
        model.job.total_duration = v;
    }
    if let Some(v) = number(stats, "filament_used") {
        model.job.filament_used = v;
    }
    if let Some(message) = text(stats, "message") {
        model.job.message = (!message.is_empty()).then(|| message.to_string());
    }
}

/// Progress always comes from the file reader; its path is only a
/// fallback for the print job filename
fn apply_file_reader(model: &mut MachineModel, sdcard: &Map<String, Value>) {
    if let Some(progress) = number(sdcard, "progress") {
        model.job.progress = progress.clamp(0.0, 1.0);
    }
    if model.job.filename.is_none() {
        if let Some(path) = text(sdcard, "file_path").filter(|p| !p.is_empty()) {
            model.job.filename = Some(relative_gcode_path(path).to_string());
        }
    }
}

/// Strip the host's gcode root from an absolute file reader path
fn relative_gcode_path(path: &str) -> &str {
    match path.rfind("/gcodes/") {
        Some(index) => &path[index + "/gcodes/".len()..],
        None => path,
    }
}

fn reset_print_fields(model: &mut MachineModel) {
    model.job.current_layer = None;
    model.job.total_layers = None;
    model.layer_metadata = LayerMetadata::default();
    model.live_velocity = 0.0;
    model.live_extruder_velocity = 0.0;
}

/// `max(0, round((z - first_layer_height) / layer_height))`
pub fn layer_at(z: f64, metadata: &LayerMetadata) -> Option<u32> {
    let layer_height = metadata.layer_height.filter(|h| *h > 0.0)?;
    let first_layer_height = metadata.first_layer_height.unwrap_or(layer_height);
    Some(((z - first_layer_height) / layer_height).round().max(0.0) as u32)
}

/// Layer count from object height, falling back to the slicer's own count
pub fn total_layers(metadata: &LayerMetadata) -> Option<u32> {
    match (
        metadata.layer_height.filter(|h| *h > 0.0),
        metadata.first_layer_height,
        metadata.object_height,
    ) {
        (Some(layer_height), Some(first), Some(object_height)) => {
            let layers = ((object_height - first) / layer_height).round() + 1.0;
            Some(layers.max(0.0) as u32)
        }
        _ => metadata.layer_count,
    }
}
