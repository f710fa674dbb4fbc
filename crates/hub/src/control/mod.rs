//! Control loop: automatic hysteresis control, timed watering, manual
//! override and AUTO/MANUAL arbitration.
//!
//! Every cadence body is a plain method on [`Controller`]; `main` wires them
//! to [`cadence::Cadences`]. Locks are always taken in the order
//! `auto -> timer -> switches`, and each cadence rechecks the mode after
//! taking its lock, so once `enter_manual` returns no automatic write can
//! follow.

pub mod cadence;
pub mod hysteresis;
pub mod manual;
pub mod schedule;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info};

use crate::audit::{AuditKind, AuditSink};
use crate::config::{ClockTime, SettingsHandle};
use crate::display::{DisplayFrame, StatusDisplay};
use crate::error::PinError;
use crate::pins::{LogicalPin, PinBoard};
use crate::sensor::SensorReading;
use crate::state::{DashboardSnapshot, ReadingCell};
use crate::sync::lock;

use hysteresis::{tap_command, ConditionLatch, RainwaterHysteresis, SoilHysteresis, ValveCommand};
use manual::ManualSwitches;
use schedule::{Trigger, WaterTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

/// Hysteresis flags and per-channel latches. Reset on every mode change.
#[derive(Debug, Default)]
struct AutoState {
    soil_a: SoilHysteresis,
    soil_b: SoilHysteresis,
    rainwater: RainwaterHysteresis,
    soil_a_latch: ConditionLatch,
    soil_b_latch: ConditionLatch,
    tap_latch: ConditionLatch,
    rainwater_latch: ConditionLatch,
}

impl AutoState {
    /// Forget what was written to the outflows so the next automatic cycle
    /// writes them afresh.
    fn release_outflows(&mut self) {
        self.soil_a_latch.clear();
        self.soil_b_latch.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct TimedRun {
    entry: ClockTime,
    until: Instant,
}

#[derive(Debug, Default)]
struct TimerState {
    timer: WaterTimer,
    run: Option<TimedRun>,
}

pub struct Controller {
    settings: SettingsHandle,
    pins: Arc<PinBoard>,
    audit: Arc<dyn AuditSink>,
    display: Arc<dyn StatusDisplay>,
    utc_offset: UtcOffset,
    reading: ReadingCell,
    manual: AtomicBool,
    auto: Mutex<AutoState>,
    timer: Mutex<TimerState>,
    switches: Mutex<ManualSwitches>,
}

impl Controller {
    pub fn new(
        settings: SettingsHandle,
        pins: Arc<PinBoard>,
        audit: Arc<dyn AuditSink>,
        display: Arc<dyn StatusDisplay>,
        utc_offset: UtcOffset,
    ) -> Self {
        Self {
            settings,
            pins,
            audit,
            display,
            utc_offset,
            reading: ReadingCell::default(),
            manual: AtomicBool::new(false),
            auto: Mutex::new(AutoState::default()),
            timer: Mutex::new(TimerState::default()),
            switches: Mutex::new(ManualSwitches::default()),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.is_manual() {
            Mode::Manual
        } else {
            Mode::Auto
        }
    }

    fn is_manual(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Sensor callback
    // -----------------------------------------------------------------------

    /// Store the reading for the next cycles and refresh the display.
    pub fn on_reading(&self, reading: &SensorReading) -> Result<()> {
        self.reading.set(*reading);
        self.display
            .show(&self.display_frame(*reading))
            .context("display update failed")
    }

    fn display_frame(&self, reading: SensorReading) -> DisplayFrame {
        DisplayFrame {
            reading,
            manual: self.is_manual(),
            relays: LogicalPin::RELAYS
                .iter()
                .filter_map(|&p| {
                    self.pins
                        .last_state(p)
                        .map(|level| (p, self.pins.relay_is_on(level)))
                })
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // (a) Automatic control
    // -----------------------------------------------------------------------

    pub fn automatic_cycle(&self) -> Result<()> {
        if self.is_manual() {
            return Ok(());
        }
        let settings = self.settings.current();
        if !settings.threshold_enabled {
            return Ok(());
        }
        let Some(reading) = self.reading.get() else {
            debug!("no sensor reading yet; automatic control idle");
            return Ok(());
        };

        let mut guard = lock(&self.auto);
        if self.is_manual() {
            return Ok(());
        }
        let timed_run = lock(&self.timer).run.is_some();
        let t = settings.thresholds;
        let auto = &mut *guard;
        let mut failures = Vec::new();

        // a timed run owns the outflows until it ends
        if !timed_run {
            if let Some(v) = reading.soil_moisture_a {
                if let Some(cmd) = auto.soil_a.evaluate(v, t.soil_low, t.soil_high) {
                    self.apply(LogicalPin::OutflowA, cmd, &mut auto.soil_a_latch, &mut failures);
                }
            }
            if let Some(v) = reading.soil_moisture_b {
                if let Some(cmd) = auto.soil_b.evaluate(v, t.soil_low, t.soil_high) {
                    self.apply(LogicalPin::OutflowB, cmd, &mut auto.soil_b_latch, &mut failures);
                }
            }
        }

        if let Some(main) = reading.main_tank_level {
            let tap = tap_command(main, t.tank_low);
            self.apply(LogicalPin::TapToMain, tap, &mut auto.tap_latch, &mut failures);

            if let Some(cmd) = auto.rainwater.evaluate(main, reading.second_tank_level, &t) {
                self.apply(
                    LogicalPin::RainwaterToMain,
                    cmd,
                    &mut auto.rainwater_latch,
                    &mut failures,
                );
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("automatic control: {}", failures.join("; "))
        }
    }

    /// Write `cmd` only when the channel's condition changed. A relay already
    /// at the commanded level is latched without a write or an audit. The
    /// latch is set after a successful write, so a failed write is retried
    /// next cycle.
    fn apply(
        &self,
        pin: LogicalPin,
        cmd: ValveCommand,
        latch: &mut ConditionLatch,
        failures: &mut Vec<String>,
    ) {
        if !latch.needs_log(cmd) {
            return;
        }
        if self.pins.last_state(pin) == Some(self.pins.relay_level(cmd.is_open())) {
            latch.mark(cmd);
            return;
        }
        match self.pins.set_relay(pin, cmd.is_open(), true) {
            Ok(()) => {
                latch.mark(cmd);
                info!(pin = %pin, command = ?cmd, "automation");
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // (b) Timer-based watering
    // -----------------------------------------------------------------------

    pub fn timer_cycle(&self) -> Result<()> {
        let now = OffsetDateTime::now_utc().to_offset(self.utc_offset);
        self.timer_cycle_at(now, Instant::now())
    }

    /// `now` is local wall-clock time for the schedule; `clock` measures the
    /// run duration.
    pub fn timer_cycle_at(&self, now: OffsetDateTime, clock: Instant) -> Result<()> {
        if self.is_manual() {
            return Ok(());
        }
        let settings = self.settings.current();

        let mut auto = lock(&self.auto);
        let mut timer = lock(&self.timer);
        if self.is_manual() {
            return Ok(());
        }

        if let Some(run) = timer.run.filter(|r| clock >= r.until) {
            self.set_outflows(false)
                .context("failed to close outflows after timed watering")?;
            timer.run = None;
            auto.release_outflows();
            info!(entry = %run.entry, "timed watering finished");
        }

        if !settings.timer_enabled {
            return Ok(());
        }

        for trigger in timer.timer.due(&settings.water_times, now) {
            match trigger {
                Trigger::Run(entry) => {
                    let duration = Duration::from_secs(settings.timer_run_secs);
                    timer.run = Some(TimedRun {
                        entry,
                        until: clock + duration,
                    });
                    auto.release_outflows();
                    self.audit.append(
                        AuditKind::ScheduleRun,
                        None,
                        &format!("Scheduled watering {entry} started"),
                        Some(serde_json::json!({
                            "entry": entry,
                            "duration_secs": settings.timer_run_secs,
                        })),
                    );
                    info!(entry = %entry, secs = settings.timer_run_secs, "timed watering started");
                    self.set_outflows(true)
                        .context("failed to open outflows for timed watering")?;
                }
                Trigger::Missed { entry, late_by } => {
                    self.audit.append(
                        AuditKind::ScheduleMissed,
                        None,
                        &format!("Scheduled watering {entry} missed"),
                        Some(serde_json::json!({
                            "entry": entry,
                            "late_by_secs": late_by.whole_seconds(),
                        })),
                    );
                    info!(entry = %entry, late_by_secs = late_by.whole_seconds(), "timed watering missed");
                }
            }
        }
        Ok(())
    }

    fn set_outflows(&self, on: bool) -> Result<(), PinError> {
        for pin in [LogicalPin::OutflowA, LogicalPin::OutflowB] {
            self.pins.set_relay(pin, on, false)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // (c) Manual switches
    // -----------------------------------------------------------------------

    pub fn switch_cycle(&self) -> Result<()> {
        if !self.is_manual() {
            return Ok(());
        }
        let mut switches = lock(&self.switches);
        if !self.is_manual() {
            return Ok(());
        }
        for (relay, on) in switches.poll(|p| self.pins.read(p)) {
            self.pins.set_relay(relay, on, false)?;
            info!(relay = %relay, on, "manual switch");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // (d) Mode arbitration
    // -----------------------------------------------------------------------

    pub fn mode_cycle(&self) -> Result<()> {
        match (self.pins.manual_mode_flag(), self.is_manual()) {
            (true, false) => self.enter_manual(),
            (false, true) => self.leave_manual(),
            _ => Ok(()),
        }
    }

    /// Force every relay OFF, reset automatic state and take the switch
    /// baseline. Holds every cadence lock, so no automatic write interleaves.
    pub fn enter_manual(&self) -> Result<()> {
        let mut auto = lock(&self.auto);
        let mut timer = lock(&self.timer);
        let mut switches = lock(&self.switches);
        if self.manual.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *auto = AutoState::default();
        timer.run = None;
        switches.rebaseline(|p| self.pins.read(p));
        let result = self.pins.all_relays_off();

        self.audit.append(
            AuditKind::ModeChange,
            None,
            "Manual mode engaged",
            Some(serde_json::json!({ "mode": Mode::Manual })),
        );
        info!("manual mode engaged, all relays off");
        result.context("failed to switch relays off entering manual mode")
    }

    /// Holds the switch lock too, so a switch cycle that already passed its
    /// mode check cannot write after automation resumes.
    pub fn leave_manual(&self) -> Result<()> {
        let mut auto = lock(&self.auto);
        let _switches = lock(&self.switches);
        if !self.manual.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        *auto = AutoState::default();

        self.audit.append(
            AuditKind::ModeChange,
            None,
            "Automatic mode resumed",
            Some(serde_json::json!({ "mode": Mode::Auto })),
        );
        info!("automatic mode resumed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Periodic history entry with the current reading.
    pub fn status_cycle(&self) -> Result<()> {
        if self.reading.get().is_none() {
            return Ok(());
        }
        let snapshot = self.snapshot();
        let payload = serde_json::to_value(&snapshot).context("failed to encode status")?;
        self.audit
            .append(AuditKind::StatusUpdate, None, "Periodic status", Some(payload));
        Ok(())
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        let reading = self.reading.get().unwrap_or_default();
        DashboardSnapshot {
            soil_moisture_a: reading.soil_moisture_a,
            soil_moisture_b: reading.soil_moisture_b,
            main_tank_level: reading.main_tank_level,
            second_tank_level: reading.second_tank_level,
            manual_mode: self.is_manual(),
            timed_run: lock(&self.timer).run.is_some(),
            last_pin_states: self.pins.last_states(),
        }
    }

    pub fn outflows_open(&self) -> bool {
        [LogicalPin::OutflowA, LogicalPin::OutflowB].iter().any(|&p| {
            self.pins
                .last_state(p)
                .is_some_and(|level| self.pins.relay_is_on(level))
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
