//! TOML settings: loading, validation and hot reload.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::pins::PinLayout;
use crate::sensor::normalize::{ChannelRanges, RawRange};
use crate::sync::{lock, read, write};

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub thresholds: ControlThresholds,
    #[serde(default)]
    pub water_times: Vec<ClockTime>,
    #[serde(default = "default_true")]
    pub threshold_enabled: bool,
    #[serde(default)]
    pub timer_enabled: bool,
    /// How long a scheduled run keeps both outflows open.
    #[serde(default = "default_timer_run_secs")]
    pub timer_run_secs: u64,
    pub sensor: SensorSettings,
    #[serde(default)]
    pub pins: PinSettings,
    #[serde(default)]
    pub cadence: CadenceSettings,
}

/// Percentages. The rainwater valve reopens below `tank_low + reopen_margin`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlThresholds {
    #[serde(default = "default_soil_low")]
    pub soil_low: f64,
    #[serde(default = "default_soil_high")]
    pub soil_high: f64,
    #[serde(default = "default_tank_low")]
    pub tank_low: f64,
    #[serde(default = "default_tank_high")]
    pub tank_high: f64,
    #[serde(default = "default_reopen_margin")]
    pub reopen_margin: f64,
}

impl ControlThresholds {
    pub fn reopen_threshold(&self) -> f64 {
        self.tank_low + self.reopen_margin
    }
}

impl Default for ControlThresholds {
    fn default() -> Self {
        Self {
            soil_low: default_soil_low(),
            soil_high: default_soil_high(),
            tank_low: default_tank_low(),
            tank_high: default_tank_high(),
            reopen_margin: default_reopen_margin(),
        }
    }
}

/// Wall-clock trigger written as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn to_time(self) -> Option<time::Time> {
        time::Time::from_hms(self.hour, self.minute, 0).ok()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not HH:MM"))?;
        let hour: u8 = h.parse().map_err(|_| format!("'{s}' has a bad hour"))?;
        let minute: u8 = m.parse().map_err(|_| format!("'{s}' has a bad minute"))?;
        Self::new(hour, minute).ok_or_else(|| format!("'{s}' is not a clock time"))
    }
}

impl TryFrom<String> for ClockTime {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClockTime> for String {
    fn from(t: ClockTime) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorSettings {
    /// Synthesize readings instead of opening a transport.
    #[serde(default)]
    pub simulator: bool,
    /// `tcp://host:port`, `host:port` or `/dev/ttyUSB0[@baud]`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_soil_range")]
    pub soil_range: RawRange,
    /// Depends on tank geometry; no sensible default exists.
    pub tank_range: RawRange,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_simulator_interval_ms")]
    pub simulator_interval_ms: u64,
    #[serde(default = "default_scenario")]
    pub scenario: String,
}

impl SensorSettings {
    pub fn ranges(&self) -> ChannelRanges {
        ChannelRanges {
            soil: self.soil_range,
            tank: self.tank_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PinSettings {
    #[serde(default)]
    pub layout: PinLayout,
    #[serde(default = "default_true")]
    pub relay_active_low: bool,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            layout: PinLayout::default(),
            relay_active_low: true,
            settle_ms: default_settle_ms(),
        }
    }
}

/// Periods of the control cadences.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CadenceSettings {
    #[serde(default = "default_control_ms")]
    pub control_ms: u64,
    #[serde(default = "default_timer_ms")]
    pub timer_ms: u64,
    #[serde(default = "default_switch_poll_ms")]
    pub switch_poll_ms: u64,
    #[serde(default = "default_mode_poll_ms")]
    pub mode_poll_ms: u64,
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            control_ms: default_control_ms(),
            timer_ms: default_timer_ms(),
            switch_poll_ms: default_switch_poll_ms(),
            mode_poll_ms: default_mode_poll_ms(),
            status_secs: default_status_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_timer_run_secs() -> u64 {
    60
}
fn default_soil_low() -> f64 {
    30.0
}
fn default_soil_high() -> f64 {
    80.0
}
fn default_tank_low() -> f64 {
    20.0
}
fn default_tank_high() -> f64 {
    90.0
}
fn default_reopen_margin() -> f64 {
    10.0
}
fn default_soil_range() -> RawRange {
    RawRange { min: 0, max: 100 }
}
fn default_reconnect_ms() -> u64 {
    5_000
}
fn default_idle_secs() -> u64 {
    60
}
fn default_simulator_interval_ms() -> u64 {
    4_000
}
fn default_scenario() -> String {
    "drying".into()
}
fn default_settle_ms() -> u64 {
    3_000
}
fn default_control_ms() -> u64 {
    5_000
}
fn default_timer_ms() -> u64 {
    10_000
}
fn default_switch_poll_ms() -> u64 {
    50
}
fn default_mode_poll_ms() -> u64 {
    250
}
fn default_status_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_thresholds(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_periods(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        for (name, value) in [
            ("soil_low", t.soil_low),
            ("soil_high", t.soil_high),
            ("tank_low", t.tank_low),
            ("tank_high", t.tank_high),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("thresholds: {name} {value} out of range [0, 100]"));
            }
        }
        if t.soil_low >= t.soil_high {
            errors.push(format!(
                "thresholds: soil_high ({}) must be greater than soil_low ({})",
                t.soil_high, t.soil_low
            ));
        }
        if t.tank_low >= t.tank_high {
            errors.push(format!(
                "thresholds: tank_high ({}) must be greater than tank_low ({})",
                t.tank_high, t.tank_low
            ));
        }
        if t.reopen_margin < 0.0 {
            errors.push(format!(
                "thresholds: reopen_margin must not be negative, got {}",
                t.reopen_margin
            ));
        } else if t.reopen_threshold() >= t.tank_high {
            errors.push(format!(
                "thresholds: reopen threshold ({}) must be below tank_high ({})",
                t.reopen_threshold(),
                t.tank_high
            ));
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<ClockTime> = HashSet::new();
        for (i, entry) in self.water_times.iter().enumerate() {
            if ClockTime::new(entry.hour, entry.minute).is_none() {
                errors.push(format!("water_times[{i}]: {entry} is not a clock time"));
            } else if !seen.insert(*entry) {
                errors.push(format!("water_times[{i}]: duplicate entry {entry}"));
            }
        }
        if self.timer_run_secs == 0 {
            errors.push("timer_run_secs must be positive, got 0".into());
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        for (name, range) in [("soil_range", s.soil_range), ("tank_range", s.tank_range)] {
            if range.min >= range.max {
                errors.push(format!(
                    "sensor: {name} max ({}) must be greater than min ({})",
                    range.max, range.min
                ));
            } else if range.span().is_none() {
                errors.push(format!(
                    "sensor: {name} [{}, {}] is wider than a raw reading can be",
                    range.min, range.max
                ));
            }
        }
        if !s.simulator {
            match s.address.as_deref().map(str::trim) {
                None | Some("") => {
                    errors.push("sensor: address is required unless simulator = true".into())
                }
                Some(addr) => {
                    if let Err(e) = addr.parse::<crate::sensor::transport::SensorAddress>() {
                        errors.push(format!("sensor: {e}"));
                    }
                }
            }
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();
        for (pin, bcm) in self.pins.layout.assignments() {
            if !VALID_GPIO_PINS.contains(&bcm) {
                errors.push(format!(
                    "pins: {pin} gpio {bcm} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(bcm) {
                errors.push(format!(
                    "pins: {pin} gpio {bcm} is already used by another pin"
                ));
            }
        }
    }

    fn validate_periods(&self, errors: &mut Vec<String>) {
        let c = &self.cadence;
        for (name, value) in [
            ("cadence.control_ms", c.control_ms),
            ("cadence.timer_ms", c.timer_ms),
            ("cadence.switch_poll_ms", c.switch_poll_ms),
            ("cadence.mode_poll_ms", c.mode_poll_ms),
            ("cadence.status_secs", c.status_secs),
            ("sensor.reconnect_ms", self.sensor.reconnect_ms),
            ("sensor.idle_secs", self.sensor.idle_secs),
            ("sensor.simulator_interval_ms", self.sensor.simulator_interval_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

pub fn parse(contents: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(contents).context("failed to parse settings")?;
    settings.validate()?;
    Ok(settings)
}

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse(&contents).with_context(|| format!("invalid config: {}", path.display()))
}

// ---------------------------------------------------------------------------
// Shared, reloadable handle
// ---------------------------------------------------------------------------

/// Current settings shared by every component. Readers take a cheap
/// snapshot; a reload swaps the whole value.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
    path: Option<PathBuf>,
    modified: Arc<Mutex<Option<SystemTime>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
            path: None,
            modified: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = load(&path)?;
        let modified = modified_at(&path);
        info!(
            path = %path.display(),
            water_times = settings.water_times.len(),
            simulator = settings.sensor.simulator,
            "settings loaded"
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
            path: Some(path),
            modified: Arc::new(Mutex::new(modified)),
        })
    }

    pub fn current(&self) -> Arc<Settings> {
        read(&self.inner).clone()
    }

    pub fn replace(&self, settings: Settings) {
        *write(&self.inner) = Arc::new(settings);
    }

    /// Re-read the file when its modification time moved. An invalid edit is
    /// logged and the previous settings stay in force.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let modified = modified_at(path);
        {
            let mut last = lock(&self.modified);
            if modified.is_none() || *last == modified {
                return Ok(false);
            }
            *last = modified;
        }

        match load(path) {
            Ok(settings) => {
                if *self.current() == settings {
                    return Ok(false);
                }
                self.replace(settings);
                info!(path = %path.display(), "settings reloaded");
                Ok(true)
            }
            Err(e) => {
                warn!("keeping previous settings: {e:#}");
                Ok(false)
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl CadenceSettings {
    pub fn control(&self) -> Duration {
        Duration::from_millis(self.control_ms)
    }
    pub fn timer(&self) -> Duration {
        Duration::from_millis(self.timer_ms)
    }
    pub fn switch_poll(&self) -> Duration {
        Duration::from_millis(self.switch_poll_ms)
    }
    pub fn mode_poll(&self) -> Duration {
        Duration::from_millis(self.mode_poll_ms)
    }
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
