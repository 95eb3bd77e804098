//! Write-ahead queue persistence and crash-recovery tests.
//!
//! Uses the SQLite backend in isolated temp directories. Recovery runs
//! against a counting channel adapter so replays are observable.

use anyhow::Result;
use async_trait::async_trait;
use courier::channels::{ChannelOutbound, ChannelRegistry, OutboundDeliveryResult, OutboundSendContext};
use courier::config::{OutboundConfig, QueueConfig};
use courier::outbound::{
    recover_pending_deliveries, ChunkUnit, DeliveryQueue, DeliveryRequest, OutboundDelivery,
    QueueStatus, QueuedDelivery, RecoverySummary, ReplyPayload, SqliteDeliveryQueue,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct CountingChannel {
    sent: Mutex<Vec<String>>,
    fail: bool,
}

impl CountingChannel {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail,
        })
    }
}

#[async_trait]
impl ChannelOutbound for CountingChannel {
    fn id(&self) -> &str {
        "mock"
    }

    async fn send_text(
        &self,
        _ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> Result<OutboundDeliveryResult> {
        if self.fail {
            anyhow::bail!("gateway unavailable");
        }
        self.sent.lock().push(unit.text.clone());
        Ok(OutboundDeliveryResult::new("mock", "1"))
    }

    async fn send_media(
        &self,
        _ctx: &OutboundSendContext,
        _caption: &ChunkUnit,
        media_url: &str,
    ) -> Result<OutboundDeliveryResult> {
        self.sent.lock().push(media_url.to_string());
        Ok(OutboundDeliveryResult::new("mock", "1"))
    }
}

fn delivery_for(channel: Arc<CountingChannel>, queue: Arc<SqliteDeliveryQueue>) -> OutboundDelivery {
    let mut registry = ChannelRegistry::new();
    registry.register(channel);
    OutboundDelivery::new(Arc::new(registry), OutboundConfig::default()).with_queue(queue)
}

fn record(text: &str) -> QueuedDelivery {
    QueuedDelivery {
        channel: "mock".into(),
        to: "chat".into(),
        payloads: vec![ReplyPayload::text(text)],
        ..QueuedDelivery::default()
    }
}

fn no_backoff() -> QueueConfig {
    QueueConfig {
        backoff_secs: vec![0],
        in_flight_grace_secs: 0,
        ..QueueConfig::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn records_survive_reopening_the_database() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state").join("queue.db");

    let id = {
        let queue = SqliteDeliveryQueue::open(&db).unwrap();
        queue.enqueue(&record("survivor")).await.unwrap()
    };

    let reopened = SqliteDeliveryQueue::open(&db).unwrap();
    let pending = reopened.load_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].status, QueueStatus::Pending);
    assert_eq!(pending[0].delivery, record("survivor"));
}

#[tokio::test]
async fn delivery_leaves_no_record_behind_on_success() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());

    delivery
        .deliver(DeliveryRequest::new("mock", "chat", vec![ReplyPayload::text("hi")]))
        .await
        .unwrap();

    assert_eq!(channel.sent.lock().clone(), vec!["hi"]);
    assert!(queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_delivery_is_kept_for_replay() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let delivery = delivery_for(CountingChannel::new(true), queue.clone());

    assert!(delivery
        .deliver(DeliveryRequest::new("mock", "chat", vec![ReplyPayload::text("hi")]))
        .await
        .is_err());

    let pending = queue.load_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, QueueStatus::Failed);
    assert_eq!(pending[0].retry_count, 1);
    assert!(pending[0].last_attempt_at.is_some());
    assert!(pending[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("gateway unavailable"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recovery_replays_and_acks_pending_records() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    queue.enqueue(&record("first")).await.unwrap();
    queue.enqueue(&record("second")).await.unwrap();

    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), None)
        .await
        .unwrap();

    assert_eq!(
        summary,
        RecoverySummary {
            recovered: 2,
            ..RecoverySummary::default()
        }
    );
    assert_eq!(channel.sent.lock().clone(), vec!["first", "second"]);
    assert!(queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn recovery_defers_records_inside_their_backoff_window() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let id = queue.enqueue(&record("fresh")).await.unwrap();
    queue.fail(&id, "gateway unavailable").await.unwrap();

    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());
    let config = QueueConfig {
        backoff_secs: vec![3600],
        in_flight_grace_secs: 0,
        ..QueueConfig::default()
    };
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &config, None)
        .await
        .unwrap();

    assert_eq!(summary.deferred, 1);
    assert!(channel.sent.lock().is_empty());
    assert_eq!(queue.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn recovery_leaves_recent_pending_records_to_their_sender() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    queue.enqueue(&record("in flight")).await.unwrap();

    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());
    let config = QueueConfig {
        in_flight_grace_secs: 3600,
        ..no_backoff()
    };
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &config, None)
        .await
        .unwrap();

    assert_eq!(summary.deferred, 1);
    assert!(channel.sent.lock().is_empty());
    assert_eq!(queue.list().await.unwrap()[0].status, QueueStatus::Pending);
}

#[tokio::test]
async fn recovery_counts_another_failure() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let id = queue.enqueue(&record("flaky")).await.unwrap();

    let delivery = delivery_for(CountingChannel::new(true), queue.clone());
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), None)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let entries = queue.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].status, QueueStatus::Failed);
    assert_eq!(entries[0].retry_count, 1);
}

#[tokio::test]
async fn recovery_moves_exhausted_records_to_dead_letter() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let id = queue.enqueue(&record("hopeless")).await.unwrap();
    queue.fail(&id, "gateway unavailable").await.unwrap();
    queue.fail(&id, "gateway unavailable").await.unwrap();

    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());
    let config = QueueConfig {
        max_retries: 2,
        ..no_backoff()
    };
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &config, None)
        .await
        .unwrap();

    assert_eq!(summary.dead, 1);
    assert!(channel.sent.lock().is_empty());
    assert!(queue.load_pending().await.unwrap().is_empty());

    let entries = queue.list().await.unwrap();
    assert_eq!(entries[0].status, QueueStatus::Dead);
    assert!(entries[0]
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("retries exhausted after 2 attempts"));
}

#[tokio::test]
async fn recovery_stops_when_aborted() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    queue.enqueue(&record("later")).await.unwrap();

    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());
    let token = CancellationToken::new();
    token.cancel();
    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), Some(token))
        .await
        .unwrap();

    assert_eq!(summary, RecoverySummary::default());
    assert!(channel.sent.lock().is_empty());
    assert_eq!(queue.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unconfigured_channel_goes_dead_on_first_replay() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let delivery = delivery_for(CountingChannel::new(false), queue.clone());
    let id = queue
        .enqueue(&QueuedDelivery {
            channel: "nope".into(),
            ..record("lost")
        })
        .await
        .unwrap();

    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), None)
        .await
        .unwrap();
    assert_eq!(summary.dead, 1);
    assert_eq!(summary.failed, 0);

    let entries = queue.list().await.unwrap();
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].status, QueueStatus::Dead);
    assert_eq!(entries[0].retry_count, 0);
    assert!(queue.load_pending().await.unwrap().is_empty());

    let again = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), None)
        .await
        .unwrap();
    assert_eq!(again, RecoverySummary::default());
}

#[tokio::test]
async fn record_failed_as_unconfigured_is_not_replayed() {
    let tmp = TempDir::new().unwrap();
    let queue = Arc::new(SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap());
    let channel = CountingChannel::new(false);
    let delivery = delivery_for(channel.clone(), queue.clone());

    let err = delivery
        .deliver(DeliveryRequest::new("nope", "chat", vec![ReplyPayload::text("hi")]))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(queue.load_pending().await.unwrap()[0].status, QueueStatus::Failed);

    let summary = recover_pending_deliveries(&delivery, queue.as_ref(), &no_backoff(), None)
        .await
        .unwrap();

    assert_eq!(summary.dead, 1);
    assert!(channel.sent.lock().is_empty());
    let entries = queue.list().await.unwrap();
    assert_eq!(entries[0].status, QueueStatus::Dead);
    assert_eq!(entries[0].retry_count, 1);
    assert_eq!(
        entries[0].last_error.as_deref(),
        Some("outbound not configured for channel: nope")
    );
}
