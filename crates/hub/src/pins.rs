//! Named logical pins over GPIO. The `gpio` feature gates the real rppal
//! driver; when it is off, or when no GPIO hardware answers the probe, the
//! board runs in simulation mode and logs every write as intent.

use anyhow::Result;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};
#[cfg(feature = "gpio")]
use std::collections::HashMap;

use crate::audit::{AuditKind, AuditSink};
use crate::error::PinError;
use crate::sync::{lock, read, write};

// ---------------------------------------------------------------------------
// Logical pins and levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalPin {
    OutflowA,
    OutflowB,
    RainwaterToMain,
    TapToMain,
    ManualMode,
    OutflowAManual,
    OutflowBManual,
    TapManual,
    RainwaterManual,
}

impl LogicalPin {
    /// Valve relays, driven as outputs.
    pub const RELAYS: [LogicalPin; 4] = [
        LogicalPin::OutflowA,
        LogicalPin::OutflowB,
        LogicalPin::RainwaterToMain,
        LogicalPin::TapToMain,
    ];

    /// Mode selector and momentary switches, pulled up.
    pub const INPUTS: [LogicalPin; 5] = [
        LogicalPin::ManualMode,
        LogicalPin::OutflowAManual,
        LogicalPin::OutflowBManual,
        LogicalPin::TapManual,
        LogicalPin::RainwaterManual,
    ];

    pub fn is_output(self) -> bool {
        Self::RELAYS.contains(&self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OutflowA => "outflow_a",
            Self::OutflowB => "outflow_b",
            Self::RainwaterToMain => "rainwater_to_main",
            Self::TapToMain => "tap_to_main",
            Self::ManualMode => "manual_mode",
            Self::OutflowAManual => "outflow_a_manual",
            Self::OutflowBManual => "outflow_b_manual",
            Self::TapManual => "tap_manual",
            Self::RainwaterManual => "rainwater_manual",
        }
    }
}

impl fmt::Display for LogicalPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digital level. Serialised as `0`/`1` for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

#[cfg(feature = "gpio")]
impl From<rppal::gpio::Level> for Level {
    fn from(l: rppal::gpio::Level) -> Self {
        match l {
            rppal::gpio::Level::Low => Self::Low,
            rppal::gpio::Level::High => Self::High,
        }
    }
}

#[cfg(feature = "gpio")]
impl From<Level> for rppal::gpio::Level {
    fn from(l: Level) -> Self {
        match l {
            Level::Low => Self::Low,
            Level::High => Self::High,
        }
    }
}

// ---------------------------------------------------------------------------
// BCM wiring
// ---------------------------------------------------------------------------

/// BCM GPIO numbers for every logical pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinLayout {
    pub outflow_a: u8,
    pub outflow_b: u8,
    pub rainwater_to_main: u8,
    pub tap_to_main: u8,
    pub manual_mode: u8,
    pub outflow_a_manual: u8,
    pub outflow_b_manual: u8,
    pub tap_manual: u8,
    pub rainwater_manual: u8,
}

impl Default for PinLayout {
    fn default() -> Self {
        Self {
            outflow_a: 4,
            outflow_b: 17,
            rainwater_to_main: 26,
            tap_to_main: 22,
            manual_mode: 23,
            outflow_a_manual: 24,
            outflow_b_manual: 25,
            tap_manual: 5,
            rainwater_manual: 6,
        }
    }
}

impl PinLayout {
    pub fn bcm(&self, pin: LogicalPin) -> u8 {
        match pin {
            LogicalPin::OutflowA => self.outflow_a,
            LogicalPin::OutflowB => self.outflow_b,
            LogicalPin::RainwaterToMain => self.rainwater_to_main,
            LogicalPin::TapToMain => self.tap_to_main,
            LogicalPin::ManualMode => self.manual_mode,
            LogicalPin::OutflowAManual => self.outflow_a_manual,
            LogicalPin::OutflowBManual => self.outflow_b_manual,
            LogicalPin::TapManual => self.tap_manual,
            LogicalPin::RainwaterManual => self.rainwater_manual,
        }
    }

    pub fn assignments(&self) -> Vec<(LogicalPin, u8)> {
        LogicalPin::RELAYS
            .iter()
            .chain(LogicalPin::INPUTS.iter())
            .map(|&p| (p, self.bcm(p)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Backend capability
// ---------------------------------------------------------------------------

pub trait PinBackend: Send {
    /// Configure relays as outputs and inputs with pull-up bias.
    fn initialize(&mut self) -> Result<()>;

    fn read(&self, pin: LogicalPin) -> Level;

    fn write(&mut self, pin: LogicalPin, level: Level) -> Result<(), PinError>;

    /// The selector is pulled up, so an asserted switch reads low.
    fn manual_mode_flag(&self) -> bool {
        self.read(LogicalPin::ManualMode) == Level::Low
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Pick the backend once at startup.
pub fn probe(layout: &PinLayout) -> Box<dyn PinBackend> {
    #[cfg(feature = "gpio")]
    {
        match Gpio::new() {
            Ok(gpio) => return Box::new(RppalBackend::new(gpio, layout.clone())),
            Err(e) => warn!("gpio hardware not detected ({e}); using simulation"),
        }
    }
    #[cfg(not(feature = "gpio"))]
    {
        info!(
            pins = layout.assignments().len(),
            "built without the gpio feature; using simulation"
        );
    }
    Box::new(SimBackend::default())
}

// ---------------------------------------------------------------------------
// Real GPIO (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RppalBackend {
    gpio: Gpio,
    layout: PinLayout,
    outputs: HashMap<LogicalPin, OutputPin>,
    inputs: HashMap<LogicalPin, InputPin>,
}

#[cfg(feature = "gpio")]
impl RppalBackend {
    pub fn new(gpio: Gpio, layout: PinLayout) -> Self {
        Self {
            gpio,
            layout,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
        }
    }
}

#[cfg(feature = "gpio")]
impl PinBackend for RppalBackend {
    fn initialize(&mut self) -> Result<()> {
        use anyhow::Context;

        for pin in LogicalPin::RELAYS {
            let bcm = self.layout.bcm(pin);
            let out = self
                .gpio
                .get(bcm)
                .with_context(|| format!("failed to claim gpio {bcm} for {pin}"))?
                .into_output();
            self.outputs.insert(pin, out);
        }
        for pin in LogicalPin::INPUTS {
            let bcm = self.layout.bcm(pin);
            let input = self
                .gpio
                .get(bcm)
                .with_context(|| format!("failed to claim gpio {bcm} for {pin}"))?
                .into_input_pullup();
            self.inputs.insert(pin, input);
        }
        Ok(())
    }

    fn read(&self, pin: LogicalPin) -> Level {
        if let Some(input) = self.inputs.get(&pin) {
            return input.read().into();
        }
        match self.outputs.get(&pin) {
            Some(out) if out.is_set_low() => Level::Low,
            _ => Level::High,
        }
    }

    fn write(&mut self, pin: LogicalPin, level: Level) -> Result<(), PinError> {
        let out = self
            .outputs
            .get_mut(&pin)
            .ok_or(PinError::NotAnOutput(pin))?;
        out.write(level.into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Simulation (development, no hardware, logs intent)
// ---------------------------------------------------------------------------

/// Writes are remembered and logged; inputs always read unasserted.
#[derive(Default)]
pub struct SimBackend {
    outputs: BTreeMap<LogicalPin, Level>,
}

impl PinBackend for SimBackend {
    fn initialize(&mut self) -> Result<()> {
        info!("[sim-gpio] pin board initialised (no hardware)");
        Ok(())
    }

    fn read(&self, pin: LogicalPin) -> Level {
        self.outputs.get(&pin).copied().unwrap_or(Level::High)
    }

    fn write(&mut self, pin: LogicalPin, level: Level) -> Result<(), PinError> {
        if !pin.is_output() {
            return Err(PinError::NotAnOutput(pin));
        }
        self.outputs.insert(pin, level);
        info!(pin = %pin, level = level.as_u8(), "[sim-gpio] write (not wired)");
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Pin board: backend + last-state tracking + audit
// ---------------------------------------------------------------------------

pub struct PinBoard {
    backend: Mutex<Box<dyn PinBackend>>,
    states: RwLock<BTreeMap<LogicalPin, Level>>,
    ready: AtomicBool,
    simulated: AtomicBool,
    relay_active_low: bool,
    settle: Duration,
    audit: Arc<dyn AuditSink>,
}

impl PinBoard {
    pub fn new(
        backend: Box<dyn PinBackend>,
        relay_active_low: bool,
        settle: Duration,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let simulated = backend.is_simulated();
        Self {
            backend: Mutex::new(backend),
            states: RwLock::new(BTreeMap::new()),
            ready: AtomicBool::new(false),
            simulated: AtomicBool::new(simulated),
            relay_active_low,
            settle,
            audit,
        }
    }

    /// Wait for the hardware to settle, configure every pin and drive all
    /// relays OFF. A backend that fails to configure is replaced by the
    /// simulator for the rest of the process lifetime.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        tokio::time::sleep(self.settle).await;

        let mut backend = lock(&self.backend);
        if let Err(e) = backend.initialize() {
            warn!("gpio initialisation failed ({e:#}); switching to simulation");
            *backend = Box::new(SimBackend::default());
            backend.initialize()?;
        }

        let off = self.relay_level(false);
        let mut states = write(&self.states);
        for relay in LogicalPin::RELAYS {
            backend.write(relay, off)?;
            states.insert(relay, off);
        }

        self.simulated.store(backend.is_simulated(), Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        info!(simulated = backend.is_simulated(), "pin board ready, all relays off");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated.load(Ordering::SeqCst)
    }

    /// Drive `pin` to `level` and record it. Automatic writes are audited.
    pub fn write(&self, pin: LogicalPin, level: Level, automatic: bool) -> Result<(), PinError> {
        if !self.is_ready() {
            return Err(PinError::NotInitialized(pin));
        }
        if !pin.is_output() {
            return Err(PinError::NotAnOutput(pin));
        }

        let previous = {
            let mut backend = lock(&self.backend);
            backend.write(pin, level)?;
            write(&self.states).insert(pin, level)
        };

        if automatic {
            let state = if self.relay_is_on(level) { "ON" } else { "OFF" };
            self.audit.append(
                AuditKind::AutomationTrigger,
                None,
                &format!("Automation {pin} set to {state}"),
                Some(serde_json::json!({
                    "pin": pin,
                    "level": level.as_u8(),
                    "previous": previous.map(Level::as_u8),
                })),
            );
        }
        Ok(())
    }

    pub fn set_relay(&self, pin: LogicalPin, on: bool, automatic: bool) -> Result<(), PinError> {
        self.write(pin, self.relay_level(on), automatic)
    }

    pub fn all_relays_off(&self) -> Result<(), PinError> {
        for relay in LogicalPin::RELAYS {
            self.set_relay(relay, false, false)?;
        }
        Ok(())
    }

    /// Many common relay boards are active-low.
    pub fn relay_level(&self, on: bool) -> Level {
        if on != self.relay_active_low {
            Level::High
        } else {
            Level::Low
        }
    }

    pub fn relay_is_on(&self, level: Level) -> bool {
        (level == Level::High) != self.relay_active_low
    }

    /// Inputs read unasserted (high) until the board is initialised.
    pub fn read(&self, pin: LogicalPin) -> Level {
        if !self.is_ready() {
            return Level::High;
        }
        lock(&self.backend).read(pin)
    }

    pub fn manual_mode_flag(&self) -> bool {
        self.is_ready() && lock(&self.backend).manual_mode_flag()
    }

    pub fn last_state(&self, pin: LogicalPin) -> Option<Level> {
        read(&self.states).get(&pin).copied()
    }

    pub fn last_states(&self) -> BTreeMap<LogicalPin, Level> {
        read(&self.states).clone()
    }
}

// ---------------------------------------------------------------------------
// Test double: inputs can be driven from the test
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct ScriptedPins {
    inputs: Arc<Mutex<BTreeMap<LogicalPin, Level>>>,
    writes: Arc<Mutex<Vec<(LogicalPin, Level)>>>,
}

#[cfg(test)]
impl ScriptedPins {
    pub(crate) fn set_input(&self, pin: LogicalPin, level: Level) {
        self.inputs.lock().unwrap().insert(pin, level);
    }

    pub(crate) fn writes(&self) -> Vec<(LogicalPin, Level)> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

#[cfg(test)]
impl PinBackend for ScriptedPins {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&self, pin: LogicalPin) -> Level {
        self.inputs
            .lock()
            .unwrap()
            .get(&pin)
            .copied()
            .unwrap_or(Level::High)
    }

    fn write(&mut self, pin: LogicalPin, level: Level) -> Result<(), PinError> {
        self.writes.lock().unwrap().push((pin, level));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
