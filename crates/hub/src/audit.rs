//! Fire-and-forget audit trail. The control loop appends entries without
//! waiting; sinks log and swallow their own failures.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    AutomationTrigger,
    ScheduleRun,
    ScheduleMissed,
    ModeChange,
    StatusUpdate,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutomationTrigger => "AUTOMATION_TRIGGER",
            Self::ScheduleRun => "SCHEDULE_RUN",
            Self::ScheduleMissed => "SCHEDULE_MISSED",
            Self::ModeChange => "MODE_CHANGE",
            Self::StatusUpdate => "STATUS_UPDATE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: i64,
    pub kind: AuditKind,
    /// `None` for entries raised by the controller itself.
    pub actor: Option<String>,
    pub description: String,
    pub payload: Option<Value>,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        actor: Option<&str>,
        description: &str,
        payload: Option<Value>,
    ) -> Self {
        Self {
            ts: time::OffsetDateTime::now_utc().unix_timestamp(),
            kind,
            actor: actor.map(str::to_string),
            description: description.to_string(),
            payload,
        }
    }
}

pub trait AuditSink: Send + Sync {
    /// Record an entry. Must not block the caller and must not fail.
    fn append(&self, kind: AuditKind, actor: Option<&str>, description: &str, payload: Option<Value>);
}

// ---------------------------------------------------------------------------
// Log-only sink (no database configured)
// ---------------------------------------------------------------------------

pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, kind: AuditKind, actor: Option<&str>, description: &str, payload: Option<Value>) {
        info!(
            kind = kind.as_str(),
            actor = actor.unwrap_or("system"),
            payload = payload.map(|p| p.to_string()).unwrap_or_default(),
            "audit: {description}"
        );
    }
}

// ---------------------------------------------------------------------------
// SQLite-backed sink
// ---------------------------------------------------------------------------

/// Queues entries on an unbounded channel; a background task drains them
/// into the `audits` table.
pub struct DbAuditSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl DbAuditSink {
    pub fn spawn(db: Db) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();
        let writer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = db.insert_audit(&entry).await {
                    error!(kind = entry.kind.as_str(), "audit: insert failed: {e:#}");
                }
            }
        });
        (Self { tx }, writer)
    }
}

impl AuditSink for DbAuditSink {
    fn append(&self, kind: AuditKind, actor: Option<&str>, description: &str, payload: Option<Value>) {
        let entry = AuditEntry::new(kind, actor, description, payload);
        if self.tx.send(entry).is_err() {
            warn!(kind = kind.as_str(), "audit: writer stopped, dropping entry");
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingAudit {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
}

#[cfg(test)]
impl RecordingAudit {
    pub(crate) fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, kind: AuditKind) -> usize {
        self.entries().iter().filter(|e| e.kind == kind).count()
    }
}

#[cfg(test)]
impl AuditSink for RecordingAudit {
    fn append(&self, kind: AuditKind, actor: Option<&str>, description: &str, payload: Option<Value>) {
        self.entries
            .lock()
            .unwrap()
            .push(AuditEntry::new(kind, actor, description, payload));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
