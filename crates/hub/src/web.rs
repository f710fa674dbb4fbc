use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::control::Controller;
use crate::db::Db;
use crate::pins::PinBoard;
use crate::sensor::SensorPipeline;
use crate::state::StatusResponse;

const DEFAULT_AUDIT_LIMIT: i64 = 50;
const MAX_AUDIT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct WebState {
    pub controller: Arc<Controller>,
    pub pipeline: Arc<SensorPipeline>,
    pub pins: Arc<PinBoard>,
    pub db: Option<Db>,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/audits", get(api_audits))
        .with_state(state)
}

async fn api_status(State(state): State<WebState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        snapshot: state.controller.snapshot(),
        sensor_link: state.pipeline.link_state(),
        frames: state.pipeline.stats(),
        simulated_pins: state.pins.is_simulated(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<i64>,
    /// Audit kind filter, e.g. `MODE_CHANGE`.
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn api_audits(State(state): State<WebState>, Query(q): Query<AuditQuery>) -> Response {
    let Some(db) = state.db.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "audit store not configured").into_response();
    };
    let limit = q.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT);
    let rows = match q.kind.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(kind) => db.audits_of_kind(&kind.to_ascii_uppercase(), limit).await,
        None => db.recent_audits(limit).await,
    };
    match rows {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("api/audits: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "audit query failed").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: WebState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "dashboard api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, AuditKind, RecordingAudit};
    use crate::config::{self, SettingsHandle};
    use crate::display::RecordingDisplay;
    use crate::pins::SimBackend;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use time::UtcOffset;
    use tower::ServiceExt;

    const SETTINGS: &str = r#"
[sensor]
simulator = true
tank_range = { min = 0, max = 450 }
"#;

    async fn state(db: Option<Db>) -> WebState {
        let settings = config::parse(SETTINGS).unwrap();
        let audit = Arc::new(RecordingAudit::default());
        let pins = Arc::new(PinBoard::new(
            Box::new(SimBackend::default()),
            true,
            Duration::ZERO,
            audit.clone(),
        ));
        pins.initialize().await.unwrap();
        let pipeline = Arc::new(SensorPipeline::new(settings.sensor.ranges()));
        let controller = Arc::new(Controller::new(
            SettingsHandle::new(settings),
            pins.clone(),
            audit,
            Arc::new(RecordingDisplay::default()),
            UtcOffset::UTC,
        ));
        WebState {
            controller,
            pipeline,
            pins,
            db,
            started_at: Instant::now(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Option<Value>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn status_reports_snapshot() {
        let state = state(None).await;
        let reading = crate::sensor::SensorReading {
            soil_moisture_a: Some(45.0),
            ..Default::default()
        };
        state.controller.on_reading(&reading).unwrap();

        let (status, body) = get_json(router(state), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body["soil_moisture_a"], 45.0);
        assert_eq!(body["soil_moisture_b"], Value::Null);
        assert_eq!(body["manual_mode"], false);
        assert_eq!(body["sensor_link"], "disconnected");
        assert_eq!(body["simulated_pins"], true);
        // relays driven OFF at init; active-low so OFF is 1
        assert_eq!(body["last_pin_states"]["outflow_a"], 1);
    }

    #[tokio::test]
    async fn audits_unavailable_without_db() {
        let (status, _) = get_json(router(state(None).await), "/api/audits").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn audits_newest_first_with_limit() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for i in 0..3 {
            let entry = AuditEntry::new(AuditKind::StatusUpdate, None, &format!("status {i}"), None);
            db.insert_audit(&entry).await.unwrap();
        }

        let app = router(state(Some(db)).await);
        let (status, body) = get_json(app, "/api/audits?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["description"], "status 2");
        assert_eq!(rows[0]["kind"], "STATUS_UPDATE");
    }

    #[tokio::test]
    async fn audits_filtered_by_type() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for kind in [AuditKind::ModeChange, AuditKind::StatusUpdate, AuditKind::ModeChange] {
            let entry = AuditEntry::new(kind, None, kind.as_str(), None);
            db.insert_audit(&entry).await.unwrap();
        }
        let app = router(state(Some(db)).await);

        let (status, body) = get_json(app.clone(), "/api/audits?type=MODE_CHANGE").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        let kinds: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["MODE_CHANGE", "MODE_CHANGE"]);

        let (_, body) = get_json(app.clone(), "/api/audits?type=status_update&limit=5").await;
        assert_eq!(body.unwrap().as_array().unwrap().len(), 1);

        let (_, body) = get_json(app, "/api/audits?type=").await;
        assert_eq!(body.unwrap().as_array().unwrap().len(), 3, "empty filter lists everything");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (status, _) = get_json(router(state(None).await), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
