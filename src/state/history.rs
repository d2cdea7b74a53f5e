//! Bounded temperature history for graphing

use super::SensorEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Maximum number of samples kept
pub const HISTORY_CAPACITY: usize = 300;

/// One point in time across every tracked sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub readings: BTreeMap<String, f64>,
}

/// FIFO ring of samples, oldest first
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct History {
    samples: VecDeque<HistorySample>,
}

impl History {
    /// Append a sample seeded from the previous one, overlaid with this
    /// batch's readings and then with every known sensor's current value.
    pub fn record(
        &mut self,
        timestamp: i64,
        batch: &BTreeMap<String, f64>,
        sensors: &BTreeMap<String, SensorEntry>,
    ) {
        let mut readings = self
            .samples
            .back()
            .map(|last| last.readings.clone())
            .unwrap_or_default();
        readings.extend(batch.iter().map(|(id, value)| (id.clone(), *value)));
        readings.extend(sensors.iter().map(|(id, sensor)| (id.clone(), sensor.current)));

        self.samples.push_back(HistorySample { timestamp, readings });
        while self.samples.len() > HISTORY_CAPACITY {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&HistorySample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistorySample> {
        self.samples.iter()
    }

    /// Readings of one sensor across the buffer, oldest first
    pub fn series<'a>(&'a self, sensor: &'a str) -> impl Iterator<Item = (i64, f64)> + 'a {
        self.samples
            .iter()
            .filter_map(move |s| s.readings.get(sensor).map(|v| (s.timestamp, *v)))
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
