//! Command emitters
//!
//! Each emitter formats a G-code script or RPC call from an operator
//! intent and sends it. Emitters never touch the model; the resulting
//! state arrives later through status pushes. Amounts such as the jog
//! step come from the increments in the latest published model.

use crate::client::RpcSender;
use crate::config::{Macro, MacroSettings, EXTRUDER_PLACEHOLDER};
use crate::error::{Result, SyncError};
use crate::state::{DeviceKind, MachineModel};
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(SyncError::invalid_input(format!("Unknown axis '{other}'"))),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        })
    }
}

/// Sign of a relative move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

/// Formats and sends operator commands
pub struct CommandEmitter<S> {
    rpc: S,
    model: watch::Receiver<MachineModel>,
    macros: MacroSettings,
}

impl<S: RpcSender> CommandEmitter<S> {
    pub fn new(rpc: S, model: watch::Receiver<MachineModel>, macros: MacroSettings) -> Self {
        Self { rpc, model, macros }
    }

    /// Run a raw G-code script
    pub async fn script(&self, script: &str) -> Result<Value> {
        if script.trim().is_empty() {
            return Err(SyncError::invalid_input("Empty G-code script"));
        }
        self.rpc
            .call("printer.gcode.script", json!({ "script": script }))
            .await
    }

    /// Relative move of one jog step on `axis`
    pub async fn jog(&self, axis: Axis, direction: Direction) -> Result<Value> {
        let increments = self.model.borrow().increments;
        let distance = direction.sign() * increments.jog_distance;
        self.script(&format!(
            "G91\nG1 {axis}{distance} F{}\nG90",
            increments.jog_feedrate
        ))
        .await
    }

    /// Home the given axes, or all of them when empty
    pub async fn home(&self, axes: &[Axis]) -> Result<Value> {
        let mut script = String::from("G28");
        for axis in axes {
            script.push(' ');
            script.push_str(&axis.to_string());
        }
        self.script(&script).await
    }

    pub async fn motors_off(&self) -> Result<Value> {
        self.script("M84").await
    }

    pub async fn emergency_stop(&self) -> Result<Value> {
        info!("Emergency stop requested");
        self.rpc.call("printer.emergency_stop", json!({})).await
    }

    /// Push filament through the active extruder by one extrude step
    pub async fn extrude(&self) -> Result<Value> {
        self.extrude_signed(Direction::Positive).await
    }

    /// Pull filament back by one extrude step
    pub async fn retract(&self) -> Result<Value> {
        self.extrude_signed(Direction::Negative).await
    }

    async fn extrude_signed(&self, direction: Direction) -> Result<Value> {
        let script = {
            let model = self.model.borrow();
            let increments = model.increments;
            let amount = direction.sign() * increments.extrude_amount;
            let mut script = String::new();
            if model.extruders.len() > 1 {
                script.push_str(&format!(
                    "ACTIVATE_EXTRUDER EXTRUDER={}\n",
                    model.active_extruder
                ));
            }
            script.push_str(&format!(
                "M83\nG1 E{amount} F{}",
                increments.extrude_feedrate
            ));
            script
        };
        self.script(&script).await
    }

    /// Speed factor in percent
    pub async fn set_speed_factor(&self, percent: u32) -> Result<Value> {
        self.script(&format!("M220 S{percent}")).await
    }

    /// Extrusion factor in percent
    pub async fn set_extrusion_factor(&self, percent: u32) -> Result<Value> {
        self.script(&format!("M221 S{percent}")).await
    }

    /// Set the target of a heater or temperature fan
    pub async fn set_temperature(&self, sensor: &str, target: f64) -> Result<Value> {
        if !(target.is_finite() && target >= 0.0) {
            return Err(SyncError::invalid_input(format!("Invalid target {target}")));
        }
        let script = if sensor.starts_with("temperature_fan") {
            format!(
                "SET_TEMPERATURE_FAN_TARGET TEMPERATURE_FAN={} TARGET={target}",
                instance_name(sensor)
            )
        } else if sensor == "heater_bed"
            || sensor.starts_with("extruder")
            || sensor.starts_with("heater_generic")
        {
            format!(
                "SET_HEATER_TEMPERATURE HEATER={} TARGET={target}",
                instance_name(sensor)
            )
        } else {
            return Err(SyncError::invalid_input(format!(
                "'{sensor}' has no settable target"
            )));
        };
        self.script(&script).await
    }

    /// Set a fan or pin output, `value` in the device's own scale
    pub async fn set_device(&self, device: &str, value: f64) -> Result<Value> {
        let (kind, max) = {
            let model = self.model.borrow();
            let entry = model
                .devices
                .get(device)
                .ok_or_else(|| SyncError::invalid_input(format!("Unknown device '{device}'")))?;
            (entry.kind, entry.max)
        };
        let value = value.clamp(0.0, max);

        let script = match kind {
            DeviceKind::Fan if device == "fan" => {
                format!("M106 S{}", (value / max * 255.0).round() as u32)
            }
            DeviceKind::Fan => format!(
                "SET_FAN_SPEED FAN={} SPEED={}",
                instance_name(device),
                value / max
            ),
            DeviceKind::Pin => format!("SET_PIN PIN={} VALUE={value}", instance_name(device)),
        };
        self.script(&script).await
    }

    /// Nudge the Z offset by `delta` mm, applying it to the current position
    pub async fn adjust_z_offset(&self, delta: f64) -> Result<Value> {
        self.script(&format!("SET_GCODE_OFFSET Z_ADJUST={delta} MOVE=1"))
            .await
    }

    pub async fn start_print(&self, filename: &str) -> Result<Value> {
        info!("Starting print of {}", filename);
        self.rpc
            .call("printer.print.start", json!({ "filename": filename }))
            .await
    }

    pub async fn pause(&self) -> Result<Value> {
        self.rpc.call("printer.print.pause", json!({})).await
    }

    pub async fn resume(&self) -> Result<Value> {
        self.rpc.call("printer.print.resume", json!({})).await
    }

    pub async fn cancel(&self) -> Result<Value> {
        self.rpc.call("printer.print.cancel", json!({})).await
    }

    /// Start the last completed or cancelled file again
    pub async fn reprint_last(&self) -> Result<Value> {
        let filename = self
            .model
            .borrow()
            .last_completed_filename
            .clone()
            .ok_or_else(|| SyncError::invalid_input("No completed print to repeat"))?;
        self.start_print(&filename).await
    }

    pub async fn load_filament(&self) -> Result<Value> {
        let script = self.fill_template(&self.macros.load_filament);
        self.script(&script).await
    }

    pub async fn unload_filament(&self) -> Result<Value> {
        let script = self.fill_template(&self.macros.unload_filament);
        self.script(&script).await
    }

    /// Run a panel macro
    pub async fn run_macro(&self, entry: &Macro) -> Result<Value> {
        let script = self.fill_template(&entry.gcode);
        self.script(&script).await
    }

    fn fill_template(&self, template: &str) -> String {
        template.replace(EXTRUDER_PLACEHOLDER, &self.model.borrow().active_extruder)
    }
}

/// `fan_generic exhaust` -> `exhaust`, bare names unchanged
fn instance_name(object: &str) -> &str {
    object
        .split_once(' ')
        .map(|(_, name)| name.trim())
        .unwrap_or(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ObjectCatalog;
    use crate::mock::MockRpc;
    use crate::state::{Increments, StateEngine};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn emitter(increments: Increments) -> (Arc<MockRpc>, CommandEmitter<Arc<MockRpc>>) {
        let mut engine = StateEngine::with_increments(increments);
        engine.apply_catalog(&ObjectCatalog::from_names([
            "extruder",
            "extruder1",
            "heater_bed",
            "temperature_fan chamber",
            "temperature_sensor mcu_temp",
            "fan",
            "fan_generic exhaust",
            "output_pin caselight",
            "output_pin fan_boost",
        ]));
        engine.merge(&json!({"print_stats": {"state": "complete", "filename": "benchy.gcode"}}));
        let (_tx, rx) = watch::channel(engine.model().clone());
        let rpc = Arc::new(MockRpc::new());
        (
            rpc.clone(),
            CommandEmitter::new(rpc, rx, MacroSettings::default()),
        )
    }

    #[tokio::test]
    async fn test_jog_uses_increments() {
        let (rpc, commands) = emitter(Increments {
            jog_distance: 0.1,
            ..Increments::default()
        });
        commands.jog(Axis::X, Direction::Negative).await.unwrap();
        commands.jog(Axis::Z, Direction::Positive).await.unwrap();

        assert_eq!(
            rpc.scripts(),
            vec!["G91\nG1 X-0.1 F3000\nG90", "G91\nG1 Z0.1 F3000\nG90"]
        );
    }

    #[tokio::test]
    async fn test_homing_and_motors() {
        let (rpc, commands) = emitter(Increments::default());
        commands.home(&[]).await.unwrap();
        commands.home(&[Axis::X, Axis::Y]).await.unwrap();
        commands.motors_off().await.unwrap();
        commands.emergency_stop().await.unwrap();

        assert_eq!(rpc.scripts(), vec!["G28", "G28 X Y", "M84"]);
        assert_eq!(rpc.calls_for("printer.emergency_stop").len(), 1);
    }

    #[tokio::test]
    async fn test_extrude_selects_active_extruder() {
        let (rpc, commands) = emitter(Increments {
            extrude_amount: 5.0,
            extrude_feedrate: 120.0,
            ..Increments::default()
        });
        commands.retract().await.unwrap();

        assert_eq!(
            rpc.scripts(),
            vec!["ACTIVATE_EXTRUDER EXTRUDER=extruder\nM83\nG1 E-5 F120"]
        );
    }

    #[tokio::test]
    async fn test_factor_and_temperature_templates() {
        let (rpc, commands) = emitter(Increments::default());
        commands.set_speed_factor(150).await.unwrap();
        commands.set_extrusion_factor(95).await.unwrap();
        commands.set_temperature("extruder1", 215.0).await.unwrap();
        commands.set_temperature("heater_bed", 60.0).await.unwrap();
        commands
            .set_temperature("temperature_fan chamber", 45.0)
            .await
            .unwrap();
        assert!(commands
            .set_temperature("temperature_sensor mcu_temp", 10.0)
            .await
            .is_err());

        assert_eq!(
            rpc.scripts(),
            vec![
                "M220 S150",
                "M221 S95",
                "SET_HEATER_TEMPERATURE HEATER=extruder1 TARGET=215",
                "SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET=60",
                "SET_TEMPERATURE_FAN_TARGET TEMPERATURE_FAN=chamber TARGET=45",
            ]
        );
    }

    #[tokio::test]
    async fn test_device_templates() {
        let (rpc, commands) = emitter(Increments::default());
        commands.set_device("fan", 0.5).await.unwrap();
        commands.set_device("fan_generic exhaust", 2.0).await.unwrap();
        commands.set_device("output_pin caselight", 1.0).await.unwrap();
        commands.set_device("output_pin fan_boost", 128.0).await.unwrap();
        assert!(commands.set_device("fan_generic missing", 1.0).await.is_err());

        assert_eq!(
            rpc.scripts(),
            vec![
                "M106 S128",
                "SET_FAN_SPEED FAN=exhaust SPEED=1",
                "SET_PIN PIN=caselight VALUE=1",
                "SET_PIN PIN=fan_boost VALUE=128",
            ]
        );
    }

    #[tokio::test]
    async fn test_print_control() {
        let (rpc, commands) = emitter(Increments::default());
        commands.reprint_last().await.unwrap();
        commands.pause().await.unwrap();
        commands.resume().await.unwrap();
        commands.cancel().await.unwrap();
        commands.adjust_z_offset(-0.025).await.unwrap();

        assert_eq!(
            rpc.calls_for("printer.print.start"),
            vec![json!({"filename": "benchy.gcode"})]
        );
        assert_eq!(rpc.calls_for("printer.print.pause").len(), 1);
        assert_eq!(rpc.calls_for("printer.print.cancel").len(), 1);
        assert_eq!(rpc.scripts(), vec!["SET_GCODE_OFFSET Z_ADJUST=-0.025 MOVE=1"]);
    }

    #[tokio::test]
    async fn test_filament_macros() {
        let (rpc, commands) = emitter(Increments::default());
        commands.load_filament().await.unwrap();
        commands.unload_filament().await.unwrap();

        assert_eq!(
            rpc.scripts(),
            vec![
                "LOAD_FILAMENT EXTRUDER=extruder",
                "UNLOAD_FILAMENT EXTRUDER=extruder"
            ]
        );
    }

    #[tokio::test]
    async fn test_commands_fail_without_channel() {
        let (rpc, commands) = emitter(Increments::default());
        rpc.disconnect("printer.gcode.script");
        assert!(matches!(
            commands.motors_off().await,
            Err(SyncError::NotConnected)
        ));
        assert!(commands.script("  ").await.is_err());
    }
}
