//! Derived machine status
//!
//! Two independent upstream signals feed the status: the print job state
//! reported by `print_stats` and the `idle_timeout` state. Motion without a
//! file job (homing, probing, macros) shows up as `standby` + `Printing`
//! and is reported as [`MachineStatus::Busy`].

use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum MachineStatus {
    #[default]
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    Busy,
    /// Any other raw state, upper-cased
    Other(String),
}

impl MachineStatus {
    /// Compute the status from the raw print job state and idle state
    pub fn derive(print_stats_state: Option<&str>, idle_state: Option<&str>) -> Self {
        let raw = print_stats_state.unwrap_or("standby");
        let idle_printing = idle_state.is_some_and(|idle| idle.eq_ignore_ascii_case("printing"));

        if raw.eq_ignore_ascii_case("standby") && idle_printing {
            MachineStatus::Busy
        } else {
            Self::from_raw(raw)
        }
    }

    fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "STANDBY" => MachineStatus::Standby,
            "PRINTING" => MachineStatus::Printing,
            "PAUSED" => MachineStatus::Paused,
            "COMPLETE" => MachineStatus::Complete,
            "CANCELLED" => MachineStatus::Cancelled,
            "ERROR" => MachineStatus::Error,
            "BUSY" => MachineStatus::Busy,
            other => MachineStatus::Other(other.to_string()),
        }
    }

    /// States that archive the filename for reprint
    pub fn is_finished(&self) -> bool {
        matches!(self, MachineStatus::Complete | MachineStatus::Cancelled)
    }

    /// States that end the per-print bookkeeping when entered from PRINTING
    pub fn ends_print(&self) -> bool {
        matches!(
            self,
            MachineStatus::Complete
                | MachineStatus::Cancelled
                | MachineStatus::Error
                | MachineStatus::Standby
        )
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Standby => write!(f, "STANDBY"),
            MachineStatus::Printing => write!(f, "PRINTING"),
            MachineStatus::Paused => write!(f, "PAUSED"),
            MachineStatus::Complete => write!(f, "COMPLETE"),
            MachineStatus::Cancelled => write!(f, "CANCELLED"),
            MachineStatus::Error => write!(f, "ERROR"),
            MachineStatus::Busy => write!(f, "BUSY"),
            MachineStatus::Other(raw) => write!(f, "{raw}"),
        }
    }
}

impl Serialize for MachineStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MachineStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_raw(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("standby"), Some("Printing"), MachineStatus::Busy)]
    #[case(Some("standby"), Some("Idle"), MachineStatus::Standby)]
    #[case(Some("standby"), None, MachineStatus::Standby)]
    #[case(Some("printing"), Some("Printing"), MachineStatus::Printing)]
    #[case(Some("printing"), Some("Ready"), MachineStatus::Printing)]
    #[case(Some("paused"), Some("Printing"), MachineStatus::Paused)]
    #[case(Some("complete"), None, MachineStatus::Complete)]
    #[case(Some("cancelled"), Some("Idle"), MachineStatus::Cancelled)]
    #[case(Some("error"), None, MachineStatus::Error)]
    #[case(Some("calibrating"), None, MachineStatus::Other("CALIBRATING".into()))]
    #[case(None, Some("Printing"), MachineStatus::Busy)]
    fn test_derive(
        #[case] raw: Option<&str>,
        #[case] idle: Option<&str>,
        #[case] expected: MachineStatus,
    ) {
        assert_eq!(MachineStatus::derive(raw, idle), expected);
    }

    #[test]
    fn test_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(MachineStatus::Busy).unwrap(),
            serde_json::json!("BUSY")
        );
        assert_eq!(
            serde_json::to_value(MachineStatus::Other("CALIBRATING".into())).unwrap(),
            serde_json::json!("CALIBRATING")
        );
    }
}
