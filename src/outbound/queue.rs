//! Write-ahead delivery queue.
//!
//! A delivery is persisted before its first send and resolved exactly once
//! when the call finishes: `ack` removes the record, `fail` keeps it with a
//! reason for inspection and replay. Records still `pending` after a restart
//! were interrupted mid-delivery.

use crate::channels::traits::OutboundIdentity;
use crate::outbound::mirror::MirrorSpec;
use crate::outbound::payloads::ReplyPayload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identifier handed out by [`DeliveryQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueueId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for QueueId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to replay a delivery call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedDelivery {
    pub channel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub payloads: Vec<ReplyPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<OutboundIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Enqueued and not yet resolved.
    Pending,
    /// Resolved with a failure; eligible for replay.
    Failed,
    /// Out of retries; kept for inspection only.
    Dead,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => anyhow::bail!("Unknown queue status: {other}"),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored record with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueId,
    pub delivery: QueuedDelivery,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn new(id: QueueId, delivery: QueuedDelivery) -> Self {
        Self {
            id,
            delivery,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
        }
    }
}

/// Persistence seam for the write-ahead queue. Backends must tolerate
/// concurrent calls from independent deliveries.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Durably persist `delivery`; the record must survive a crash once this returns.
    async fn enqueue(&self, delivery: &QueuedDelivery) -> Result<QueueId>;

    /// Resolve as delivered. Unknown ids are ignored.
    async fn ack(&self, id: &QueueId) -> Result<()>;

    /// Resolve as failed with `reason`, counting one more attempt.
    async fn fail(&self, id: &QueueId, reason: &str) -> Result<()>;

    /// Pending and failed records, oldest first.
    async fn load_pending(&self) -> Result<Vec<QueueEntry>>;

    async fn mark_dead(&self, id: &QueueId, reason: &str) -> Result<()>;

    /// Every record, oldest first.
    async fn list(&self) -> Result<Vec<QueueEntry>>;

    /// Delete a record regardless of state. Returns whether it existed.
    async fn remove(&self, id: &QueueId) -> Result<bool>;
}

// ── SQLite backend ───────────────────────────────────────────────

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS delivery_queue (
    id              TEXT PRIMARY KEY,
    channel         TEXT NOT NULL,
    recipient       TEXT NOT NULL,
    delivery        TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    enqueued_at     TEXT NOT NULL,
    last_attempt_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_delivery_queue_status ON delivery_queue(status, enqueued_at);";

const SELECT_COLUMNS: &str =
    "id, delivery, status, retry_count, last_error, enqueued_at, last_attempt_at";

/// SQLite-backed queue. One row per record; payloads stored as JSON.
pub struct SqliteDeliveryQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeliveryQueue {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create queue directory: {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open delivery queue DB: {}", db_path.display()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set delivery queue pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create delivery queue schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .context("Delivery queue task panicked")?
    }

    async fn select(&self, sql_filter: &'static str) -> Result<Vec<QueueEntry>> {
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM delivery_queue {sql_filter} ORDER BY enqueued_at ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], map_queue_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in delivery queue: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

fn map_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let delivery_raw: String = row.get(1)?;
    let delivery: QueuedDelivery = serde_json::from_str(&delivery_raw)
        .context("Invalid delivery JSON in queue")
        .map_err(sql_conversion_error)?;
    let status_raw: String = row.get(2)?;
    let enqueued_raw: String = row.get(5)?;
    let last_attempt_raw: Option<String> = row.get(6)?;

    Ok(QueueEntry {
        id: QueueId(row.get(0)?),
        delivery,
        status: QueueStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        retry_count: row.get(3)?,
        last_error: row.get(4)?,
        enqueued_at: parse_rfc3339(&enqueued_raw).map_err(sql_conversion_error)?,
        last_attempt_at: last_attempt_raw
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(sql_conversion_error)?,
    })
}

#[async_trait]
impl DeliveryQueue for SqliteDeliveryQueue {
    async fn enqueue(&self, delivery: &QueuedDelivery) -> Result<QueueId> {
        let entry = QueueEntry::new(QueueId::generate(), delivery.clone());
        let delivery_json = serde_json::to_string(&entry.delivery)?;
        let id = entry.id.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO delivery_queue (id, channel, recipient, delivery, status, retry_count, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
                params![
                    entry.id.as_str(),
                    entry.delivery.channel,
                    entry.delivery.to,
                    delivery_json,
                    timestamp(entry.enqueued_at),
                ],
            )
            .context("Failed to insert delivery queue record")?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn ack(&self, id: &QueueId) -> Result<()> {
        let id = id.clone();
        self.with_connection(move |conn| {
            conn.execute("DELETE FROM delivery_queue WHERE id = ?1", params![id.as_str()])
                .context("Failed to acknowledge delivery queue record")?;
            Ok(())
        })
        .await
    }

    async fn fail(&self, id: &QueueId, reason: &str) -> Result<()> {
        let id = id.clone();
        let reason = reason.to_string();
        self.with_connection(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE delivery_queue
                     SET status = 'failed', retry_count = retry_count + 1, last_error = ?2, last_attempt_at = ?3
                     WHERE id = ?1",
                    params![id.as_str(), reason, timestamp(Utc::now())],
                )
                .context("Failed to mark delivery queue record failed")?;
            if changed == 0 {
                anyhow::bail!("Delivery queue record '{id}' not found");
            }
            Ok(())
        })
        .await
    }

    async fn load_pending(&self) -> Result<Vec<QueueEntry>> {
        self.select("WHERE status IN ('pending', 'failed')").await
    }

    async fn mark_dead(&self, id: &QueueId, reason: &str) -> Result<()> {
        let id = id.clone();
        let reason = reason.to_string();
        self.with_connection(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE delivery_queue SET status = 'dead', last_error = ?2 WHERE id = ?1",
                    params![id.as_str(), reason],
                )
                .context("Failed to mark delivery queue record dead")?;
            if changed == 0 {
                anyhow::bail!("Delivery queue record '{id}' not found");
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        self.select("").await
    }

    async fn remove(&self, id: &QueueId) -> Result<bool> {
        let id = id.clone();
        self.with_connection(move |conn| {
            let existed: Option<String> = conn
                .query_row(
                    "SELECT id FROM delivery_queue WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute("DELETE FROM delivery_queue WHERE id = ?1", params![id.as_str()])
                .context("Failed to remove delivery queue record")?;
            Ok(existed.is_some())
        })
        .await
    }
}

// ── In-memory backend ────────────────────────────────────────────

/// Process-local queue. Records do not survive a restart.
#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, id: &QueueId, f: impl FnOnce(&mut QueueEntry)) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| &entry.id == id)
            .with_context(|| format!("Delivery queue record '{id}' not found"))?;
        f(entry);
        Ok(())
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, delivery: &QueuedDelivery) -> Result<QueueId> {
        let entry = QueueEntry::new(QueueId::generate(), delivery.clone());
        let id = entry.id.clone();
        self.entries.lock().push(entry);
        Ok(id)
    }

    async fn ack(&self, id: &QueueId) -> Result<()> {
        self.entries.lock().retain(|entry| &entry.id != id);
        Ok(())
    }

    async fn fail(&self, id: &QueueId, reason: &str) -> Result<()> {
        self.update(id, |entry| {
            entry.status = QueueStatus::Failed;
            entry.retry_count += 1;
            entry.last_error = Some(reason.to_string());
            entry.last_attempt_at = Some(Utc::now());
        })
    }

    async fn load_pending(&self) -> Result<Vec<QueueEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.status != QueueStatus::Dead)
            .cloned()
            .collect())
    }

    async fn mark_dead(&self, id: &QueueId, reason: &str) -> Result<()> {
        self.update(id, |entry| {
            entry.status = QueueStatus::Dead;
            entry.last_error = Some(reason.to_string());
        })
    }

    async fn list(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.entries.lock().clone())
    }

    async fn remove(&self, id: &QueueId) -> Result<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| &entry.id != id);
        Ok(entries.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn delivery(to: &str) -> QueuedDelivery {
        QueuedDelivery {
            channel: "telegram".into(),
            to: to.into(),
            payloads: vec![ReplyPayload::text("hello")],
            best_effort: true,
            ..QueuedDelivery::default()
        }
    }

    #[tokio::test]
    async fn sqlite_enqueue_ack_removes_record() {
        let tmp = TempDir::new().unwrap();
        let queue = SqliteDeliveryQueue::open(&tmp.path().join("state/queue.db")).unwrap();

        let id = queue.enqueue(&delivery("chat-1")).await.unwrap();
        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].status, QueueStatus::Pending);
        assert_eq!(listed[0].delivery, delivery("chat-1"));

        queue.ack(&id).await.unwrap();
        assert!(queue.list().await.unwrap().is_empty());
        // ack is idempotent
        queue.ack(&id).await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_fail_keeps_record_with_reason_and_counts_attempts() {
        let tmp = TempDir::new().unwrap();
        let queue = SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap();

        let id = queue.enqueue(&delivery("chat-1")).await.unwrap();
        queue.fail(&id, "chat not found").await.unwrap();
        queue.fail(&id, "still not found").await.unwrap();

        let pending = queue.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, QueueStatus::Failed);
        assert_eq!(pending[0].retry_count, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("still not found"));
        assert!(pending[0].last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn sqlite_records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.db");
        let id = {
            let queue = SqliteDeliveryQueue::open(&path).unwrap();
            queue.enqueue(&delivery("chat-1")).await.unwrap()
        };

        let reopened = SqliteDeliveryQueue::open(&path).unwrap();
        let pending = reopened.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn sqlite_dead_records_are_not_pending() {
        let tmp = TempDir::new().unwrap();
        let queue = SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap();

        let first = queue.enqueue(&delivery("a")).await.unwrap();
        let second = queue.enqueue(&delivery("b")).await.unwrap();
        queue.mark_dead(&first, "retries exhausted").await.unwrap();

        let pending = queue.load_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert_eq!(queue.list().await.unwrap().len(), 2);

        assert!(queue.remove(&first).await.unwrap());
        assert!(!queue.remove(&first).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_fail_unknown_id_errors() {
        let tmp = TempDir::new().unwrap();
        let queue = SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap();
        assert!(queue.fail(&QueueId::from("missing"), "x").await.is_err());
    }

    #[tokio::test]
    async fn sqlite_concurrent_enqueues_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let id = queue.enqueue(&delivery(&format!("chat-{i}"))).await.unwrap();
                if i % 2 == 0 {
                    queue.ack(&id).await.unwrap();
                } else {
                    queue.fail(&id, "boom").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 8);
        assert!(remaining.iter().all(|entry| entry.status == QueueStatus::Failed));
    }

    #[tokio::test]
    async fn in_memory_queue_tracks_lifecycle() {
        let queue = InMemoryDeliveryQueue::new();
        let id = queue.enqueue(&delivery("chat-1")).await.unwrap();
        queue.fail(&id, "partial delivery failure (bestEffort)").await.unwrap();

        let entries = queue.list().await.unwrap();
        assert_eq!(entries[0].status, QueueStatus::Failed);
        assert_eq!(entries[0].retry_count, 1);

        queue.mark_dead(&id, "gave up").await.unwrap();
        assert!(queue.load_pending().await.unwrap().is_empty());
        assert!(queue.remove(&id).await.unwrap());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [QueueStatus::Pending, QueueStatus::Failed, QueueStatus::Dead] {
            assert_eq!(QueueStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(QueueStatus::parse("done").is_err());
    }
}
