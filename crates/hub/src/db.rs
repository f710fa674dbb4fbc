use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::audit::AuditEntry;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub ts: i64,
    pub kind: String,
    pub actor: Option<String>,
    pub description: String,
    pub payload: Option<String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // every in-memory connection is its own database
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Audit trail
    // ----------------------------

    pub async fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        let payload = entry.payload.as_ref().map(|p| p.to_string());
        sqlx::query(
            r#"
            INSERT INTO audits (ts, kind, actor, description, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.ts)
        .bind(entry.kind.as_str())
        .bind(entry.actor.as_deref())
        .bind(&entry.description)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("insert_audit failed")?;
        Ok(())
    }

    /// Newest entries first.
    pub async fn recent_audits(&self, limit: i64) -> Result<Vec<AuditRow>> {
        sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, ts, kind, actor, description, payload
            FROM audits
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_audits failed")
    }

    pub async fn audits_of_kind(&self, kind: &str, limit: i64) -> Result<Vec<AuditRow>> {
        sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, ts, kind, actor, description, payload
            FROM audits
            WHERE kind = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("audits_of_kind failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
