//! Test fixtures and utilities for consistent test setup
//!
//! Provides reusable printer data and configuration helpers using rstest
//! fixtures.

use moonraker_sync::SyncConfig;
use rstest::*;
use serde_json::{json, Value};
use std::time::Duration;

/// Configuration with a short request deadline
#[fixture]
pub fn test_sync_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.server.request_timeout = Duration::from_secs(5);
    config
}

/// Objects listed by a two-extruder printer with a chamber sensor
#[fixture]
pub fn printer_objects() -> Vec<&'static str> {
    vec![
        "webhooks",
        "configfile",
        "mcu",
        "mcu EBBCan",
        "toolhead",
        "gcode_move",
        "print_stats",
        "virtual_sdcard",
        "idle_timeout",
        "motion_report",
        "heater_bed",
        "extruder",
        "extruder1",
        "extruder_stepper belt",
        "temperature_sensor chamber",
        "fan",
        "fan_generic exhaust_fan",
        "output_pin caselight",
    ]
}

/// Subscription snapshot of an idle, homed printer
#[fixture]
pub fn idle_snapshot() -> Value {
    json!({
        "toolhead": {
            "position": [120.0, 110.5, 15.2, 0.0],
            "homed_axes": "xyz",
            "max_velocity": 300.0,
            "max_accel": 3000.0,
            "square_corner_velocity": 5.0,
            "minimum_cruise_ratio": 0.5
        },
        "gcode_move": { "speed_factor": 1.0, "extrude_factor": 0.95, "homing_origin": [0.0, 0.0, -0.05, 0.0] },
        "print_stats": { "state": "standby", "filename": "", "print_duration": 0.0 },
        "virtual_sdcard": { "progress": 0.0, "file_path": null, "is_active": false },
        "idle_timeout": { "state": "Idle" },
        "heater_bed": { "temperature": 59.8, "target": 60.0 },
        "extruder": { "temperature": 25.3, "target": 0.0, "pressure_advance": 0.035, "smooth_time": 0.04 },
        "extruder1": { "temperature": 24.9, "target": 0.0, "pressure_advance": 0.05, "smooth_time": 0.04 },
        "temperature_sensor chamber": { "temperature": 31.0 },
        "fan": { "speed": 0.0 },
        "fan_generic exhaust_fan": { "speed": 0.35 },
        "output_pin caselight": { "value": 1.0 }
    })
}
