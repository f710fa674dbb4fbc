//! Status display. The default adapter renders the two 16-column LCD lines
//! to the log; a hardware LCD driver would implement the same trait.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

use crate::pins::LogicalPin;
use crate::sensor::SensorReading;
use crate::sync::lock;

pub const COLUMNS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    pub reading: SensorReading,
    pub manual: bool,
    /// Relay ON/OFF, already translated through the relay polarity.
    pub relays: BTreeMap<LogicalPin, bool>,
}

pub trait StatusDisplay: Send + Sync {
    fn show(&self, frame: &DisplayFrame) -> Result<()>;
}

/// Two lines: mode (with relay flags in manual), then soil and tank
/// percentages.
pub fn render_lines(frame: &DisplayFrame) -> [String; 2] {
    let mode = if frame.manual {
        let flag = |pin: LogicalPin| {
            if frame.relays.get(&pin).copied().unwrap_or(false) {
                '1'
            } else {
                '0'
            }
        };
        format!(
            "MANUAL A{}B{}T{}R{}",
            flag(LogicalPin::OutflowA),
            flag(LogicalPin::OutflowB),
            flag(LogicalPin::TapToMain),
            flag(LogicalPin::RainwaterToMain)
        )
    } else {
        "AUTO".to_string()
    };

    let r = &frame.reading;
    let values = format!(
        "H{:>3}{:>4}T{:>3}{:>4}",
        pct(r.soil_moisture_a),
        pct(r.soil_moisture_b),
        pct(r.main_tank_level),
        pct(r.second_tank_level)
    );

    [fit(mode), fit(values)]
}

fn pct(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.0}", v),
        None => "--".to_string(),
    }
}

fn fit(mut line: String) -> String {
    line.truncate(COLUMNS);
    format!("{line:<width$}", width = COLUMNS)
}

/// Logs the rendered lines whenever they change.
#[derive(Default)]
pub struct ConsoleDisplay {
    last: Mutex<Option<[String; 2]>>,
}

impl StatusDisplay for ConsoleDisplay {
    fn show(&self, frame: &DisplayFrame) -> Result<()> {
        let lines = render_lines(frame);
        let mut last = lock(&self.last);
        if last.as_ref() != Some(&lines) {
            info!(line1 = %lines[0].trim_end(), line2 = %lines[1].trim_end(), "display");
            *last = Some(lines);
        }
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDisplay {
    frames: Mutex<Vec<DisplayFrame>>,
}

#[cfg(test)]
impl RecordingDisplay {
    pub(crate) fn frames(&self) -> Vec<DisplayFrame> {
        self.frames.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl StatusDisplay for RecordingDisplay {
    fn show(&self, frame: &DisplayFrame) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}
