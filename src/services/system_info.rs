//! Host, firmware and MCU information queries

use crate::client::RpcSender;
use crate::discovery::classify;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Firmware running behind the server (Klipper or a fork)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub name: String,
    pub version: String,
    pub state: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub total_memory: u64,
    pub memory_units: String,
    pub distribution: String,
    pub distribution_version: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McuInfo {
    /// Remote object name, e.g. `mcu toolhead`
    pub object: String,
    /// Display name, e.g. `MCU (Toolhead)`
    pub label: String,
    pub firmware_name: String,
    pub version: String,
    pub build_versions: Option<String>,
    pub mcu_type: String,
}

fn text_or(map: &Value, key: &str, default: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Query `printer.info`
pub async fn firmware_info<S>(rpc: &S) -> Result<FirmwareInfo>
where
    S: RpcSender + ?Sized,
{
    let info = rpc.call("printer.info", json!({})).await?;
    Ok(FirmwareInfo {
        name: text_or(&info, "app", "Klipper"),
        version: text_or(&info, "software_version", "Unknown"),
        state: text_or(&info, "state", "unknown"),
        hostname: info.get("hostname").and_then(Value::as_str).map(str::to_string),
    })
}

/// Query `machine.system_info`
pub async fn host_info<S>(rpc: &S) -> Result<HostInfo>
where
    S: RpcSender + ?Sized,
{
    let response = rpc.call("machine.system_info", json!({})).await?;
    let info = response
        .get("system_info")
        .ok_or_else(|| SyncError::parsing_error("Response has no 'system_info' object"))?;
    let cpu = info.get("cpu_info").cloned().unwrap_or(Value::Null);
    let distribution = info.get("distribution").cloned().unwrap_or(Value::Null);

    let cpu_model = cpu
        .get("model")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| cpu.get("cpu_desc").and_then(Value::as_str))
        .unwrap_or("Unknown")
        .to_string();

    Ok(HostInfo {
        cpu_model,
        cpu_cores: cpu.get("cpu_count").and_then(Value::as_u64).unwrap_or(0) as u32,
        total_memory: cpu.get("total_memory").and_then(Value::as_u64).unwrap_or(0),
        memory_units: text_or(&cpu, "memory_units", "kB"),
        distribution: text_or(&distribution, "name", "Unknown"),
        distribution_version: distribution
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string),
        hostname: info.get("hostname").and_then(Value::as_str).map(str::to_string),
    })
}

/// Query version data of the given MCU objects
pub async fn mcu_info<S>(rpc: &S, mcus: &[String], firmware_name: &str) -> Result<Vec<McuInfo>>
where
    S: RpcSender + ?Sized,
{
    if mcus.is_empty() {
        return Ok(Vec::new());
    }

    let objects: Map<String, Value> = mcus
        .iter()
        .map(|name| {
            (
                name.clone(),
                json!(["mcu_version", "mcu_build_versions", "mcu_constants"]),
            )
        })
        .collect();
    let response = rpc
        .call("printer.objects.query", json!({ "objects": objects }))
        .await?;
    let status = response
        .get("status")
        .ok_or_else(|| SyncError::parsing_error("Object query response has no 'status' object"))?;

    Ok(mcus
        .iter()
        .filter_map(|name| {
            let info = status.get(name)?;
            Some(McuInfo {
                object: name.clone(),
                label: classify(name)
                    .map(|c| c.label)
                    .unwrap_or_else(|| name.to_uppercase()),
                firmware_name: firmware_name.to_string(),
                version: text_or(info, "mcu_version", "Unknown"),
                build_versions: info
                    .get("mcu_build_versions")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                mcu_type: info
                    .get("mcu_constants")
                    .map(|constants| text_or(constants, "MCU", "Unknown"))
                    .unwrap_or_else(|| "Unknown".to_string()),
            })
        })
        .collect())
}

/// Render a memory size for display
pub fn format_memory(value: u64, units: &str) -> String {
    if value == 0 {
        return "N/A".to_string();
    }
    if units == "kB" {
        let mb = value as f64 / 1024.0;
        if mb >= 1024.0 {
            return format!("{:.1} GB", mb / 1024.0);
        }
        return format!("{mb:.0} MB");
    }
    format!("{value} {units}")
}
