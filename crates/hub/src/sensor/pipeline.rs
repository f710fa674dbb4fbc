//! Sensor ingestion: owns the link (or the simulator), decodes frames,
//! normalizes them and fans the readings out to subscribers.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::normalize::{ChannelRanges, SensorReading};
use super::protocol::{FrameBuffer, RawFrame};
use super::sim::{ReadingSim, Scenario};
use super::transport::{SensorAddress, Transport};
use crate::error::TransportError;
use crate::sync::{lock, read, write};

/// Called synchronously for every reading, in registration order.
pub type Subscriber = Arc<dyn Fn(&SensorReading) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Simulated,
}

#[derive(Debug, Clone)]
pub enum SensorSource {
    Simulator {
        scenario: Scenario,
        interval: Duration,
    },
    Link {
        address: SensorAddress,
        reconnect: Duration,
        idle: Duration,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub accepted: u64,
    pub dropped: u64,
}

pub struct SensorPipeline {
    ranges: RwLock<ChannelRanges>,
    latest: RwLock<Option<SensorReading>>,
    subscribers: Mutex<Vec<Subscriber>>,
    link: RwLock<LinkState>,
    accepted: AtomicU64,
    dropped: AtomicU64,
    watering: AtomicBool,
}

impl SensorPipeline {
    pub fn new(ranges: ChannelRanges) -> Self {
        Self {
            ranges: RwLock::new(ranges),
            latest: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            link: RwLock::new(LinkState::Disconnected),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            watering: AtomicBool::new(false),
        }
    }

    pub fn set_ranges(&self, ranges: ChannelRanges) {
        *write(&self.ranges) = ranges;
    }

    pub fn latest(&self) -> Option<SensorReading> {
        *read(&self.latest)
    }

    pub fn link_state(&self) -> LinkState {
        *read(&self.link)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Feedback for the simulator: outflows open wets the soil.
    pub fn set_watering(&self, on: bool) {
        self.watering.store(on, Ordering::Relaxed);
    }

    fn set_link(&self, state: LinkState) {
        let mut link = write(&self.link);
        if *link != state {
            debug!(from = ?*link, to = ?state, "sensor link state");
            *link = state;
        }
    }

    /// Register `subscriber` and immediately replay the cached reading.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let index = {
            let mut subscribers = lock(&self.subscribers);
            subscribers.push(subscriber.clone());
            subscribers.len() - 1
        };
        if let Some(reading) = self.latest() {
            notify(index, &subscriber, &reading);
        }
    }

    /// Normalize one decoded frame, fold it into the last good reading and
    /// publish it.
    pub fn ingest_frame(&self, frame: &RawFrame) {
        let ranges = *read(&self.ranges);
        let fresh = SensorReading::from_frame(frame, &ranges);
        let reading = {
            let mut latest = write(&self.latest);
            let merged = fresh.merged_onto(latest.as_ref());
            if merged.is_empty() {
                return;
            }
            *latest = Some(merged);
            merged
        };
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.publish(&reading);
    }

    /// Feed raw transport bytes through `buffer`, publishing every valid frame.
    pub fn ingest_bytes(&self, buffer: &mut FrameBuffer, bytes: &[u8]) {
        buffer.push(bytes);
        while let Some(parsed) = buffer.next_frame() {
            match parsed {
                Ok(frame) => self.ingest_frame(&frame),
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("sensor frame dropped: {e}");
                }
            }
        }
    }

    /// Notify every subscriber. A failing or panicking subscriber is logged
    /// and the rest still run.
    pub fn publish(&self, reading: &SensorReading) {
        let subscribers: Vec<Subscriber> = lock(&self.subscribers).clone();
        for (i, subscriber) in subscribers.iter().enumerate() {
            notify(i, subscriber, reading);
        }
    }

    /// Drive the source forever.
    pub async fn run(self: Arc<Self>, source: SensorSource) {
        match source {
            SensorSource::Simulator { scenario, interval } => {
                self.run_simulator(scenario, interval).await
            }
            SensorSource::Link {
                address,
                reconnect,
                idle,
            } => self.run_link(address, reconnect, idle).await,
        }
    }

    async fn run_simulator(&self, scenario: Scenario, period: Duration) {
        self.set_link(LinkState::Simulated);
        let ranges = *read(&self.ranges);
        let mut sim = ReadingSim::new(scenario, ranges);
        info!(%scenario, every_ms = period.as_millis() as u64, "sensor simulator started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sim.set_watering(self.watering.load(Ordering::Relaxed));
            let frame = sim.next_frame();
            self.ingest_frame(&frame);
        }
    }

    /// One loop owns the transport, so at most one reconnect is ever pending.
    async fn run_link(&self, address: SensorAddress, reconnect: Duration, idle: Duration) {
        loop {
            self.set_link(LinkState::Connecting);
            match Transport::open(&address).await {
                Ok(transport) => {
                    self.set_link(LinkState::Connected);
                    info!(%address, "sensor link connected");
                    let e = self.pump(transport, idle).await;
                    warn!(%address, "sensor link lost: {e}");
                }
                Err(e) => warn!("sensor link unavailable: {e}"),
            }
            self.set_link(LinkState::Disconnected);
            sleep(reconnect).await;
        }
    }

    async fn pump(&self, mut transport: Transport, idle: Duration) -> TransportError {
        let mut buffer = FrameBuffer::new();
        loop {
            match transport.read_chunk(idle).await {
                Ok(bytes) => self.ingest_bytes(&mut buffer, &bytes),
                Err(e) => return e,
            }
        }
    }
}

fn notify(index: usize, subscriber: &Subscriber, reading: &SensorReading) {
    match catch_unwind(AssertUnwindSafe(|| subscriber(reading))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(subscriber = index, "sensor subscriber failed: {e:#}"),
        Err(_) => error!(subscriber = index, "sensor subscriber panicked"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
