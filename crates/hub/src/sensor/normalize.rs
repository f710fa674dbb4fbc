//! Raw sensor counts to percentages.

use serde::{Deserialize, Serialize};

use super::protocol::RawFrame;
use crate::error::NormalizationError;

/// Inclusive raw domain of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRange {
    pub min: i64,
    pub max: i64,
}

impl RawRange {
    /// `max - min`, or `None` when the range is empty or the difference does
    /// not fit in an `i64`.
    pub fn span(&self) -> Option<i64> {
        self.max.checked_sub(self.min).filter(|s| *s > 0)
    }

    /// Linear map of `[min, max]` onto `[0, 100]`. Values outside the domain
    /// are rejected, never clamped.
    pub fn normalize(&self, value: i64) -> Result<f64, NormalizationError> {
        let invalid = NormalizationError {
            value,
            min: self.min,
            max: self.max,
        };
        match self.span() {
            Some(span) if (self.min..=self.max).contains(&value) => {
                // value lies inside the range, so this cannot overflow
                Ok((value - self.min) as f64 * 100.0 / span as f64)
            }
            _ => Err(invalid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRanges {
    pub soil: RawRange,
    pub tank: RawRange,
}

/// One normalized sample. `None` marks a channel whose raw value was
/// outside its domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorReading {
    pub soil_moisture_a: Option<f64>,
    pub soil_moisture_b: Option<f64>,
    pub main_tank_level: Option<f64>,
    pub second_tank_level: Option<f64>,
}

impl SensorReading {
    pub fn from_frame(frame: &RawFrame, ranges: &ChannelRanges) -> Self {
        let [a, b, main, second] = frame.fields;
        Self {
            soil_moisture_a: channel("soil_moisture_a", &ranges.soil, a),
            soil_moisture_b: channel("soil_moisture_b", &ranges.soil, b),
            main_tank_level: channel("main_tank_level", &ranges.tank, main),
            second_tank_level: channel("second_tank_level", &ranges.tank, second),
        }
    }

    /// Fold a new sample into the last good one: invalid channels keep their
    /// previous value.
    pub fn merged_onto(self, previous: Option<&SensorReading>) -> Self {
        let Some(prev) = previous else {
            return self;
        };
        Self {
            soil_moisture_a: self.soil_moisture_a.or(prev.soil_moisture_a),
            soil_moisture_b: self.soil_moisture_b.or(prev.soil_moisture_b),
            main_tank_level: self.main_tank_level.or(prev.main_tank_level),
            second_tank_level: self.second_tank_level.or(prev.second_tank_level),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.soil_moisture_a.is_none()
            && self.soil_moisture_b.is_none()
            && self.main_tank_level.is_none()
            && self.second_tank_level.is_none()
    }
}

fn channel(name: &'static str, range: &RawRange, raw: i64) -> Option<f64> {
    match range.normalize(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(channel = name, "reading dropped: {e}");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
