//! Sensor node emulator: serves `<a,b,c,d|sum>` frames over TCP so the hub
//! can run its real link code without the field hardware.

use anyhow::{Context, Result};
use irrigation_hub::sensor::sim::{ReadingSim, Scenario};
use irrigation_hub::sensor::{ChannelRanges, RawRange};
use std::{env, net::SocketAddr, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct NodeConfig {
    listen: String,
    sample_every: Duration,
    scenario: Scenario,
    ranges: ChannelRanges,
}

impl NodeConfig {
    fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: i64| -> i64 {
            get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };
        Self {
            listen: get("NODE_LISTEN").unwrap_or_else(|| "0.0.0.0:1444".to_string()),
            sample_every: Duration::from_millis(num("SAMPLE_EVERY_MS", 4000).max(1) as u64),
            scenario: Scenario::from_str_lossy(&get("SIM_SCENARIO").unwrap_or_default()),
            ranges: ChannelRanges {
                soil: raw_range("SOIL", num("SOIL_RAW_MIN", 0), num("SOIL_RAW_MAX", 100), (0, 100)),
                tank: raw_range("TANK", num("TANK_RAW_MIN", 0), num("TANK_RAW_MAX", 450), (0, 450)),
            },
        }
    }
}

/// The simulator needs a non-empty range; anything else falls back to the
/// default.
fn raw_range(channel: &str, min: i64, max: i64, default: (i64, i64)) -> RawRange {
    let range = RawRange { min, max };
    if range.span().is_some() {
        return range;
    }
    let (min, max) = default;
    warn!(
        channel,
        requested_min = range.min,
        requested_max = range.max,
        min,
        max,
        "invalid raw range, using default"
    );
    RawRange { min, max }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = NodeConfig::from_env();
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!(
        listen = %cfg.listen,
        scenario = %cfg.scenario,
        every_ms = cfg.sample_every.as_millis() as u64,
        "sensor node emulator ready"
    );

    let (tx, _) = broadcast::channel::<String>(16);
    tokio::spawn(sample_loop(cfg.clone(), tx.clone()));
    accept_loop(listener, tx).await
}

/// Encode one frame per tick and hand it to every connected client.
async fn sample_loop(cfg: NodeConfig, tx: broadcast::Sender<String>) {
    let mut sim = ReadingSim::new(cfg.scenario, cfg.ranges);
    let mut ticker = interval(cfg.sample_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let frame = sim.next_frame().encode();
        debug!(%frame, clients = tx.receiver_count(), "sample");
        // no clients is fine
        let _ = tx.send(frame);
    }
}

async fn accept_loop(listener: TcpListener, tx: broadcast::Sender<String>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        info!(%peer, "hub connected");
        tokio::spawn(serve_client(stream, peer, tx.subscribe()));
    }
}

async fn serve_client(mut stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if let Err(e) = stream.write_all(frame.as_bytes()).await {
                    info!(%peer, "hub disconnected: {e}");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%peer, skipped = n, "client too slow, frames skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
