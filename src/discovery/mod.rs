//! Capability discovery for the remote object catalog
//!
//! The set of sensors, fans, pins and extruders on a machine is not known
//! ahead of time. After each connection the catalog is listed and every
//! name is run through [`RULES`], a declarative table mapping a name
//! matcher to a category and a label rule. Names outside every rule are
//! ignored.

use crate::client::RpcSender;
use crate::error::{Result, SyncError};
use crate::state::{DeviceEntry, DeviceKind, SensorEntry, DEFAULT_EXTRUDER};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// Semantic category of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Temperature,
    /// Temperature-capable and selectable as the active tool
    Extruder,
    Fan,
    Pin,
    Mcu,
}

impl Category {
    pub fn is_temperature(&self) -> bool {
        matches!(self, Category::Temperature | Category::Extruder)
    }

    pub fn device_kind(&self) -> Option<DeviceKind> {
        match self {
            Category::Fan => Some(DeviceKind::Fan),
            Category::Pin => Some(DeviceKind::Pin),
            _ => None,
        }
    }
}

/// How a rule recognizes an object name
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// The whole name
    Exact(&'static str),
    /// The name starts with this string
    Prefix(&'static str),
    /// The base name optionally followed by digits (`extruder`, `extruder1`)
    Indexed(&'static str),
    /// The base name alone or followed by a space and an instance name
    Compound(&'static str),
}

impl Matcher {
    fn matches(&self, name: &str) -> bool {
        match *self {
            Matcher::Exact(exact) => name == exact,
            Matcher::Prefix(prefix) => name.starts_with(prefix),
            Matcher::Indexed(base) => name
                .strip_prefix(base)
                .is_some_and(|index| index.chars().all(|c| c.is_ascii_digit())),
            Matcher::Compound(base) => {
                name == base || name.strip_prefix(base).is_some_and(|rest| rest.starts_with(' '))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LabelRule {
    Fixed(&'static str),
    /// Instance name, or the bare name with known prefixes stripped,
    /// upper-cased with underscores as spaces
    Derived,
    /// `MCU` or `MCU (Name)`
    Mcu,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub matcher: Matcher,
    pub category: Category,
    pub label: LabelRule,
}

/// Classification table, first match wins
pub const RULES: &[Rule] = &[
    Rule {
        matcher: Matcher::Exact("heater_bed"),
        category: Category::Temperature,
        label: LabelRule::Fixed("BED"),
    },
    Rule {
        matcher: Matcher::Indexed("extruder"),
        category: Category::Extruder,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Prefix("temperature_sensor"),
        category: Category::Temperature,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Prefix("temperature_fan"),
        category: Category::Temperature,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Prefix("heater_generic"),
        category: Category::Temperature,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Exact("fan"),
        category: Category::Fan,
        label: LabelRule::Fixed("PART FAN"),
    },
    Rule {
        matcher: Matcher::Prefix("fan_generic"),
        category: Category::Fan,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Prefix("output_pin"),
        category: Category::Pin,
        label: LabelRule::Derived,
    },
    Rule {
        matcher: Matcher::Compound("mcu"),
        category: Category::Mcu,
        label: LabelRule::Mcu,
    },
];

/// Prefixes removed from single-word names before casing
const STRIPPED_PREFIXES: &[&str] = &["temperature_sensor_", "heater_generic_"];

/// Result of running one name through the rule table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: Category,
    pub label: String,
}

/// Classify a remote object name, or `None` when no rule matches
pub fn classify(name: &str) -> Option<Classified> {
    RULES
        .iter()
        .find(|rule| rule.matcher.matches(name))
        .map(|rule| Classified {
            category: rule.category,
            label: match rule.label {
                LabelRule::Fixed(label) => label.to_string(),
                LabelRule::Derived => derive_label(name),
                LabelRule::Mcu => mcu_label(name),
            },
        })
}

/// Human label for a remote object name
pub fn derive_label(name: &str) -> String {
    if name == "heater_bed" {
        return "BED".to_string();
    }
    if name == "fan" {
        return "PART FAN".to_string();
    }

    let base = match name.split_once(' ') {
        Some((_, instance)) => instance.trim(),
        None => STRIPPED_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .unwrap_or(name),
    };
    base.to_uppercase().replace('_', " ")
}

fn mcu_label(name: &str) -> String {
    match name.split_once(' ') {
        Some((_, instance)) => {
            let mut chars = instance.trim().chars();
            match chars.next() {
                Some(first) => format!("MCU ({}{})", first.to_uppercase(), chars.as_str()),
                None => "MCU".to_string(),
            }
        }
        None => name.to_uppercase(),
    }
}

/// Output scale of a device: fan-named pins take 0-255, everything else 0-1
pub fn device_max(name: &str, kind: DeviceKind) -> f64 {
    match kind {
        DeviceKind::Pin if name.contains("fan") => 255.0,
        _ => 1.0,
    }
}

/// Everything one catalog listing yielded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectCatalog {
    pub sensors: Vec<SensorEntry>,
    pub devices: Vec<DeviceEntry>,
    pub extruders: Vec<String>,
    pub mcus: Vec<String>,
}

impl ObjectCatalog {
    /// Classify every name in catalog order
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut catalog = ObjectCatalog::default();
        for name in names {
            let name = name.as_ref();
            let Some(classified) = classify(name) else {
                debug!("Ignoring unrecognized object '{}'", name);
                continue;
            };

            if classified.category == Category::Extruder {
                catalog.extruders.push(name.to_string());
            }
            if classified.category.is_temperature() {
                catalog.sensors.push(SensorEntry::new(name, classified.label));
            } else if let Some(kind) = classified.category.device_kind() {
                catalog.devices.push(DeviceEntry {
                    id: name.to_string(),
                    label: classified.label,
                    kind,
                    value: 0.0,
                    max: device_max(name, kind),
                });
            } else if classified.category == Category::Mcu {
                catalog.mcus.push(name.to_string());
            }
        }
        catalog
    }

    /// Keep `previous` if it still exists, else the first extruder, else the default
    pub fn select_extruder(&self, previous: Option<&str>) -> String {
        previous
            .filter(|prev| self.extruders.iter().any(|e| e == prev))
            .or_else(|| self.extruders.first().map(String::as_str))
            .unwrap_or(DEFAULT_EXTRUDER)
            .to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.devices.is_empty() && self.mcus.is_empty()
    }
}

/// List the remote catalog and classify it
pub async fn discover<S>(rpc: &S) -> Result<ObjectCatalog>
where
    S: RpcSender + ?Sized,
{
    let response = rpc.call("printer.objects.list", json!({})).await?;
    let names = response
        .get("objects")
        .and_then(|objects| objects.as_array())
        .ok_or_else(|| SyncError::discovery("Object list response has no 'objects' array"))?;

    let catalog = ObjectCatalog::from_names(names.iter().filter_map(|name| name.as_str()));
    info!(
        "Discovered {} sensors, {} devices, {} extruders, {} MCUs",
        catalog.sensors.len(),
        catalog.devices.len(),
        catalog.extruders.len(),
        catalog.mcus.len()
    );
    Ok(catalog)
}
