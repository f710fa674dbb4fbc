//! Pure decision rules for the automatic control cadence.
//!
//! ```text
//! soil:      < low ──▶ OPEN     >= high ──▶ CLOSE (latched until < low)
//! tap fill:  main < tank_low ──▶ OPEN, otherwise CLOSE
//! rainwater: main < tank_low ──▶ OPEN
//!            main >= tank_high ──▶ CLOSE (latched)
//!            latched and main >= reopen ──▶ stay CLOSED
//!            main < reopen ──▶ OPEN
//!            second tank empty ──▶ CLOSE
//! ```

use crate::config::ControlThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveCommand {
    Open,
    Close,
}

impl ValveCommand {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

/// Two-threshold control for one soil channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoilHysteresis {
    was_high: bool,
}

impl SoilHysteresis {
    pub fn evaluate(&mut self, value: f64, low: f64, high: f64) -> Option<ValveCommand> {
        if value >= high {
            self.was_high = true;
            Some(ValveCommand::Close)
        } else if value < low {
            self.was_high = false;
            Some(ValveCommand::Open)
        } else if self.was_high {
            Some(ValveCommand::Close)
        } else {
            None
        }
    }

    pub fn was_high(&self) -> bool {
        self.was_high
    }
}

/// Three-band control for the rainwater transfer valve.
#[derive(Debug, Default, Clone, Copy)]
pub struct RainwaterHysteresis {
    was_high: bool,
}

impl RainwaterHysteresis {
    pub fn evaluate(
        &mut self,
        main: f64,
        second: Option<f64>,
        t: &ControlThresholds,
    ) -> Option<ValveCommand> {
        // nothing to transfer from an empty rainwater tank
        if second.is_some_and(|s| s <= 0.0) {
            return Some(ValveCommand::Close);
        }
        if main < t.tank_low {
            self.was_high = false;
            Some(ValveCommand::Open)
        } else if main >= t.tank_high {
            self.was_high = true;
            Some(ValveCommand::Close)
        } else if main < t.reopen_threshold() {
            self.was_high = false;
            Some(ValveCommand::Open)
        } else if self.was_high {
            Some(ValveCommand::Close)
        } else {
            None
        }
    }

    pub fn was_high(&self) -> bool {
        self.was_high
    }
}

pub fn tap_command(main: f64, tank_low: f64) -> ValveCommand {
    if main < tank_low {
        ValveCommand::Open
    } else {
        ValveCommand::Close
    }
}

/// Remembers the last condition written for a channel so a condition that
/// holds for many cycles is written and audited once.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionLatch {
    logged: Option<ValveCommand>,
}

impl ConditionLatch {
    pub fn needs_log(&self, command: ValveCommand) -> bool {
        self.logged != Some(command)
    }

    pub fn mark(&mut self, command: ValveCommand) {
        self.logged = Some(command);
    }

    pub fn clear(&mut self) {
        self.logged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValveCommand::{Close, Open};

    fn thresholds() -> ControlThresholds {
        ControlThresholds {
            soil_low: 30.0,
            soil_high: 80.0,
            tank_low: 20.0,
            tank_high: 90.0,
            reopen_margin: 10.0,
        }
    }

    #[test]
    fn soil_dip_sequence() {
        let mut h = SoilHysteresis::default();
        let got: Vec<_> = [85.0, 50.0, 25.0, 50.0]
            .into_iter()
            .map(|v| h.evaluate(v, 30.0, 80.0))
            .collect();
        assert_eq!(got, vec![Some(Close), Some(Close), Some(Open), None]);
        assert!(!h.was_high());
    }

    #[test]
    fn soil_boundaries() {
        let mut h = SoilHysteresis::default();
        assert_eq!(h.evaluate(30.0, 30.0, 80.0), None, "low is not below low");
        assert_eq!(h.evaluate(80.0, 30.0, 80.0), Some(Close));
        assert!(h.was_high());
        assert_eq!(h.evaluate(29.9, 30.0, 80.0), Some(Open));
    }

    #[test]
    fn tap_follows_tank_low() {
        assert_eq!(tap_command(10.0, 20.0), Open);
        assert_eq!(tap_command(20.0, 20.0), Close);
        assert_eq!(tap_command(60.0, 20.0), Close);
    }

    #[test]
    fn rainwater_three_bands() {
        let t = thresholds();
        let mut h = RainwaterHysteresis::default();
        let got: Vec<_> = [95.0, 50.0, 25.0, 50.0, 10.0]
            .into_iter()
            .map(|m| h.evaluate(m, Some(50.0), &t))
            .collect();
        // full, still latched, below reopen, mid-band unlatched, below low
        assert_eq!(got, vec![Some(Close), Some(Close), Some(Open), None, Some(Open)]);
    }

    #[test]
    fn rainwater_held_closed_while_second_tank_empty() {
        let t = thresholds();
        let mut h = RainwaterHysteresis::default();
        assert_eq!(h.evaluate(5.0, Some(0.0), &t), Some(Close));
        assert_eq!(h.evaluate(5.0, None, &t), Some(Open), "unknown is not empty");
    }

    #[test]
    fn latch_flips_once_per_condition() {
        let mut latch = ConditionLatch::default();
        assert!(latch.needs_log(Open));
        latch.mark(Open);
        assert!(!latch.needs_log(Open));
        assert!(latch.needs_log(Close));
        latch.mark(Close);
        assert!(latch.needs_log(Open));
        latch.clear();
        assert!(latch.needs_log(Close));
    }
}
