//! Durable record of every successfully uploaded (or deliberately skipped)
//! event, backed by a single-file SQLite database.
//!
//! A row exists iff the clip is durably on the remote at `remote_path`. Rows
//! with an empty `remote_path` are skip markers: the event is treated as
//! backed up but there is nothing to delete remotely.

use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::warn;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    camera_id TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    remote_path TEXT NOT NULL,
    uploaded_at INTEGER NOT NULL
)";

/// Write attempts before a database error is escalated as fatal.
const WRITE_ATTEMPTS: u32 = 4;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One backed-up event.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub event_id: String,
    pub event_type: String,
    pub camera_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Full rclone path of the uploaded object; empty for skip markers.
    pub remote_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// The event ledger. All writes go through the single pooled connection, so
/// they are serialized.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path`. Failure here is fatal.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("failed to open ledger {path:?}: {e}")))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::Database(format!("failed to create events table: {e}")))?;

        Ok(Ledger { pool })
    }

    pub async fn has(&self, event_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("ledger lookup failed: {e}")))?;
        Ok(row.is_some())
    }

    /// Insert or replace a row. Idempotent on the event id; the newest
    /// `remote_path` wins. Transient failures are retried with backoff before
    /// the error escalates.
    pub async fn put(&self, row: &LedgerRow) -> Result<()> {
        let mut delay = WRITE_RETRY_DELAY;
        let mut last_error = String::new();

        for attempt in 1..=WRITE_ATTEMPTS {
            let result = sqlx::query(
                "INSERT OR REPLACE INTO events
                 (id, type, camera_id, start_ts, end_ts, remote_path, uploaded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.event_id)
            .bind(&row.event_type)
            .bind(&row.camera_id)
            .bind(row.start.timestamp())
            .bind(row.end.timestamp())
            .bind(&row.remote_path)
            .bind(row.uploaded_at.timestamp())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < WRITE_ATTEMPTS {
                        warn!(
                            "Ledger write for {} failed (attempt {attempt}/{WRITE_ATTEMPTS}): {e}",
                            row.event_id
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(Error::Database(format!(
            "ledger write for {} failed after {WRITE_ATTEMPTS} attempts: {last_error}",
            row.event_id
        ))
        .into())
    }

    pub async fn delete(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("ledger delete failed: {e}")))?;
        Ok(())
    }

    /// Rows whose event ended strictly before `cutoff`, oldest first.
    ///
    /// Strict comparison keeps events exactly on the retention boundary for
    /// the next pass.
    pub async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT id, remote_path FROM events WHERE end_ts < ? ORDER BY end_ts ASC",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("ledger scan failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("id"), row.get::<String, _>("remote_path")))
            .collect())
    }

    /// Ids of all events whose start falls inside `[from, to]`.
    pub async fn ids_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM events WHERE start_ts >= ? AND start_ts <= ?")
            .bind(from.timestamp())
            .bind(to.timestamp())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("ledger window scan failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("id"))
            .collect())
    }

    /// Flush and close the underlying database.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
