//! Stateful sensor simulator shared by the hub's simulator mode and the
//! node emulator.
//!
//! Each channel is a random walk with mean reversion and a steady drift
//! (soil dries out, tanks drain), plus per-reading noise, occasional spikes
//! and a permanent per-channel offset. Opening the outflows wets the soil.
//! Samples always stay inside the channel's raw range.

use std::fmt;

use super::normalize::{ChannelRanges, RawRange};
use super::protocol::RawFrame;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles, selected by name in settings or `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries out; the soil hysteresis kicks in after a
    /// while.
    Drying,
    /// Hovers near the centre with little noise. Good for the dashboard.
    Stable,
    /// Noisy, with frequent large spikes.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    /// (drift, walk sigma, mean reversion, noise sigma, spike probability,
    /// spike sigma, start) as fractions of the channel span.
    fn params(self) -> (f64, f64, f64, f64, f32, f64, f64) {
        match self {
            Self::Drying => (0.004, 0.010, 0.02, 0.006, 0.03, 0.15, 0.5),
            Self::Stable => (0.0005, 0.004, 0.05, 0.003, 0.005, 0.07, 0.5),
            Self::Flaky => (0.003, 0.018, 0.02, 0.015, 0.10, 0.22, 0.5),
            Self::Wet => (0.001, 0.006, 0.02, 0.004, 0.02, 0.10, 0.85),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct Channel {
    range: RawRange,
    /// "True" value in raw units. Evolves each tick.
    base: f64,
    /// Permanent calibration offset. Two sensors in the same soil never
    /// read identically.
    offset: f64,
    noise_sigma: f64,
    /// Per-sample drift in raw units; negative is drier or emptier.
    drift: f64,
    /// Per-sample change while the outflows are open.
    watering_rate: f64,
}

impl Channel {
    fn span(&self) -> f64 {
        self.range.max as f64 - self.range.min as f64
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct ReadingSim {
    scenario: Scenario,
    channels: Vec<Channel>,
    walk_frac: f64,
    mean_reversion: f64,
    spike_prob: f32,
    spike_frac: f64,
    watering: bool,
}

impl ReadingSim {
    pub fn new(scenario: Scenario, ranges: ChannelRanges) -> Self {
        let (drift, walk, mean_rev, noise, spike_prob, spike, start) = scenario.params();

        // soil A, soil B, main tank, second tank
        let layout = [
            (ranges.soil, -drift, 0.05),
            (ranges.soil, -drift, 0.05),
            (ranges.tank, -drift * 0.5, -0.01),
            (ranges.tank, drift * 0.25, 0.0),
        ];

        let channels = layout
            .into_iter()
            .map(|(range, drift, watering_rate)| {
                let span = range.max as f64 - range.min as f64;
                let jitter = gaussian(0.0, span * 0.03);
                let start_base = range.min as f64 + start * span + jitter;
                Channel {
                    range,
                    base: start_base.clamp(range.min as f64, range.max as f64),
                    offset: gaussian(0.0, span * 0.02),
                    noise_sigma: span * noise * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                    drift: drift * span,
                    watering_rate: watering_rate * span,
                }
            })
            .collect();

        Self {
            scenario,
            channels,
            walk_frac: walk,
            mean_reversion: mean_rev,
            spike_prob,
            spike_frac: spike,
            watering: false,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Tell the simulator whether the outflow valves are open.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Advance every channel one tick and return the raw frame.
    pub fn next_frame(&mut self) -> RawFrame {
        let mut fields = [0i64; 4];
        for (slot, index) in fields.iter_mut().zip(0..self.channels.len()) {
            *slot = self.sample(index);
        }
        RawFrame { fields }
    }

    fn sample(&mut self, index: usize) -> i64 {
        let watering = self.watering;
        let (walk_frac, mean_rev, spike_prob, spike_frac) = (
            self.walk_frac,
            self.mean_reversion,
            self.spike_prob,
            self.spike_frac,
        );
        let ch = &mut self.channels[index];
        let span = ch.span();
        let (lo, hi) = (ch.range.min as f64, ch.range.max as f64);
        let center = (lo + hi) / 2.0;

        // -- Evolve the base value ----------------------------------------

        let pull = mean_rev * (center - ch.base);
        let walk = gaussian(0.0, span * walk_frac);
        let wet = if watering { ch.watering_rate } else { 0.0 };
        ch.base = (ch.base + ch.drift + pull + walk + wet).clamp(lo, hi);

        // -- Build the instantaneous reading ------------------------------

        let noise = gaussian(0.0, ch.noise_sigma);
        let spike = if fastrand::f32() < spike_prob {
            gaussian(0.0, span * spike_frac)
        } else {
            0.0
        };

        (ch.base + ch.offset + noise + spike).round().clamp(lo, hi) as i64
    }
}

// ===========================================================================
// Tests
// ===========================================================================
