use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::pins::{Level, LogicalPin};
use crate::sensor::pipeline::{FrameStats, LinkState};
use crate::sensor::SensorReading;
use crate::sync::{read, write};

// ---------------------------------------------------------------------------
// Latest reading, shared between the sensor callback and the cadences
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ReadingCell {
    inner: RwLock<Option<SensorReading>>,
}

impl ReadingCell {
    pub fn set(&self, reading: SensorReading) {
        *write(&self.inner) = Some(reading);
    }

    pub fn get(&self) -> Option<SensorReading> {
        *read(&self.inner)
    }
}

// ---------------------------------------------------------------------------
// Dashboard views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub soil_moisture_a: Option<f64>,
    pub soil_moisture_b: Option<f64>,
    pub main_tank_level: Option<f64>,
    pub second_tank_level: Option<f64>,
    pub manual_mode: bool,
    pub timed_run: bool,
    pub last_pin_states: BTreeMap<LogicalPin, Level>,
}

/// What `GET /api/status` returns.
#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub snapshot: DashboardSnapshot,
    pub sensor_link: LinkState,
    pub frames: FrameStats,
    pub simulated_pins: bool,
    pub uptime_secs: u64,
}
