//! Momentary push buttons that toggle relays while in manual mode.

use crate::pins::{Level, LogicalPin};

/// Switch input and the relay it toggles.
pub const SWITCHES: [(LogicalPin, LogicalPin); 4] = [
    (LogicalPin::OutflowAManual, LogicalPin::OutflowA),
    (LogicalPin::OutflowBManual, LogicalPin::OutflowB),
    (LogicalPin::TapManual, LogicalPin::TapToMain),
    (LogicalPin::RainwaterManual, LogicalPin::RainwaterToMain),
];

/// Edge detector over the four switches. An unasserted (high) to asserted
/// (low) transition is one press. No time-based debounce.
#[derive(Debug, Clone)]
pub struct ManualSwitches {
    last: [Level; 4],
    relay_on: [bool; 4],
}

impl Default for ManualSwitches {
    fn default() -> Self {
        Self {
            last: [Level::High; 4],
            relay_on: [false; 4],
        }
    }
}

impl ManualSwitches {
    /// Take the current levels as the baseline and forget all toggles, so a
    /// switch held down while entering manual mode is not a press.
    pub fn rebaseline(&mut self, read: impl Fn(LogicalPin) -> Level) {
        for (i, (switch, _)) in SWITCHES.iter().enumerate() {
            self.last[i] = read(*switch);
        }
        self.relay_on = [false; 4];
    }

    /// Relays to drive after this poll, with their new ON state.
    pub fn poll(&mut self, read: impl Fn(LogicalPin) -> Level) -> Vec<(LogicalPin, bool)> {
        let mut toggled = Vec::new();
        for (i, (switch, relay)) in SWITCHES.iter().enumerate() {
            let level = read(*switch);
            if self.last[i] == Level::High && level == Level::Low {
                self.relay_on[i] = !self.relay_on[i];
                toggled.push((*relay, self.relay_on[i]));
            }
            self.last[i] = level;
        }
        toggled
    }
}
