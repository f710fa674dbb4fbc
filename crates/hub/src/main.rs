use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration, time::Instant};
use time::UtcOffset;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_hub::audit::{AuditSink, DbAuditSink, TracingAuditSink};
use irrigation_hub::config::{SensorSettings, SettingsHandle};
use irrigation_hub::control::cadence::Cadences;
use irrigation_hub::control::Controller;
use irrigation_hub::db::Db;
use irrigation_hub::display::ConsoleDisplay;
use irrigation_hub::pins::{self, PinBoard};
use irrigation_hub::sensor::sim::Scenario;
use irrigation_hub::sensor::transport::SensorAddress;
use irrigation_hub::sensor::{SensorPipeline, SensorReading, SensorSource, Subscriber};
use irrigation_hub::web::{self, WebState};

const SETTINGS_POLL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // must be read before any other thread exists
    let utc_offset = UtcOffset::current_local_offset().unwrap_or_else(|_| {
        warn!("local utc offset unavailable; schedule runs in UTC");
        UtcOffset::UTC
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(utc_offset))
}

async fn run(utc_offset: UtcOffset) -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Settings ────────────────────────────────────────────────────
    let settings = SettingsHandle::from_file(&config_path)?;
    let initial = settings.current();

    // ── Audit store ─────────────────────────────────────────────────
    let (db, audit) = match open_db(&db_url).await {
        Ok(db) => {
            let (sink, _writer) = DbAuditSink::spawn(db.clone());
            (Some(db), Arc::new(sink) as Arc<dyn AuditSink>)
        }
        Err(e) => {
            warn!("audit store unavailable ({e:#}); audits go to the log only");
            (None, Arc::new(TracingAuditSink) as Arc<dyn AuditSink>)
        }
    };

    // ── Pins ────────────────────────────────────────────────────────
    let pins = Arc::new(PinBoard::new(
        pins::probe(&initial.pins.layout),
        initial.pins.relay_active_low,
        Duration::from_millis(initial.pins.settle_ms),
        audit.clone(),
    ));

    // ── Controller + sensor pipeline ────────────────────────────────
    let controller = Arc::new(Controller::new(
        settings.clone(),
        pins.clone(),
        audit,
        Arc::new(ConsoleDisplay::default()),
        utc_offset,
    ));

    let pipeline = Arc::new(SensorPipeline::new(initial.sensor.ranges()));
    let ctrl = controller.clone();
    let on_reading: Subscriber = Arc::new(move |r: &SensorReading| ctrl.on_reading(r));
    pipeline.subscribe(on_reading);
    tokio::spawn(pipeline.clone().run(sensor_source(&initial.sensor)?));

    pins.initialize().await?;
    // pick up a manual selector that is already asserted before automation runs
    if let Err(e) = controller.mode_cycle() {
        error!("initial mode check failed: {e:#}");
    }

    // ── Cadences ────────────────────────────────────────────────────
    let periods = initial.cadence.clone();
    let mut cadences = Cadences::new();

    let (c, p) = (controller.clone(), pipeline.clone());
    cadences.every("control", periods.control(), move || {
        let (c, p) = (c.clone(), p.clone());
        async move {
            let result = c.automatic_cycle();
            p.set_watering(c.outflows_open());
            result
        }
    });

    let c = controller.clone();
    cadences.every("timer", periods.timer(), move || {
        let c = c.clone();
        async move { c.timer_cycle() }
    });

    let c = controller.clone();
    cadences.every("switches", periods.switch_poll(), move || {
        let c = c.clone();
        async move { c.switch_cycle() }
    });

    let c = controller.clone();
    cadences.every("mode", periods.mode_poll(), move || {
        let c = c.clone();
        async move { c.mode_cycle() }
    });

    let c = controller.clone();
    cadences.every("status", periods.status(), move || {
        let c = c.clone();
        async move { c.status_cycle() }
    });

    let (s, p) = (settings.clone(), pipeline.clone());
    cadences.every("settings", SETTINGS_POLL, move || {
        let (s, p) = (s.clone(), p.clone());
        async move {
            if s.reload_if_changed()? {
                p.set_ranges(s.current().sensor.ranges());
            }
            anyhow::Ok(())
        }
    });

    info!(cadences = ?cadences.names(), "controller running");

    // ── Web server ──────────────────────────────────────────────────
    let web_state = WebState {
        controller: controller.clone(),
        pipeline: pipeline.clone(),
        pins: pins.clone(),
        db,
        started_at: Instant::now(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("{e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    cadences.shutdown();
    if let Err(e) = pins.all_relays_off() {
        error!("failed to switch relays off on shutdown: {e}");
    }
    Ok(())
}

async fn open_db(db_url: &str) -> Result<Db> {
    let db = Db::connect(db_url).await?;
    db.migrate().await?;
    info!(url = db_url, "audit store ready");
    Ok(db)
}

fn sensor_source(sensor: &SensorSettings) -> Result<SensorSource> {
    if sensor.simulator {
        return Ok(SensorSource::Simulator {
            scenario: Scenario::from_str_lossy(&sensor.scenario),
            interval: Duration::from_millis(sensor.simulator_interval_ms),
        });
    }
    let address: SensorAddress = sensor
        .address
        .as_deref()
        .context("sensor.address is required unless sensor.simulator is set")?
        .parse()?;
    Ok(SensorSource::Link {
        address,
        reconnect: Duration::from_millis(sensor.reconnect_ms),
        idle: Duration::from_secs(sensor.idle_secs),
    })
}
