//! Crash recovery: replay queue records that were never acknowledged.

use crate::config::QueueConfig;
use crate::outbound::deliver::{DeliveryRequest, OutboundDelivery};
use crate::outbound::error::DeliveryError;
use crate::outbound::queue::{DeliveryQueue, QueueEntry, QueueStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome counts of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub recovered: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dead: usize,
}

/// Backoff before the next attempt of a record that has already been tried
/// `retry_count` times. The last configured step repeats.
pub fn backoff_for(config: &QueueConfig, retry_count: u32) -> Duration {
    let steps = &config.backoff_secs;
    if steps.is_empty() {
        return Duration::ZERO;
    }
    let index = (retry_count as usize).min(steps.len() - 1);
    Duration::from_secs(steps[index])
}

/// Earliest replay time. A `pending` record may still be in flight in the
/// process that enqueued it, so it waits out the in-flight grace instead of
/// the retry backoff.
fn next_attempt_at(config: &QueueConfig, entry: &QueueEntry) -> DateTime<Utc> {
    let (since, wait) = match entry.status {
        QueueStatus::Pending => (
            entry.enqueued_at,
            Duration::from_secs(config.in_flight_grace_secs),
        ),
        _ => (
            entry.last_attempt_at.unwrap_or(entry.enqueued_at),
            backoff_for(config, entry.retry_count),
        ),
    };
    since + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Replay every pending or failed record, oldest first.
///
/// Records out of retries, or whose failure cannot be fixed by retrying, are
/// moved to the dead state; records still inside their backoff window are
/// left for a later pass. Replays bypass the queue, so the original record is
/// resolved here: acked on success, failed again otherwise.
pub async fn recover_pending_deliveries(
    delivery: &OutboundDelivery,
    queue: &dyn DeliveryQueue,
    config: &QueueConfig,
    abort: Option<CancellationToken>,
) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();
    let entries = queue.load_pending().await?;
    if entries.is_empty() {
        return Ok(summary);
    }
    tracing::info!(count = entries.len(), "recovering queued deliveries");

    let now = Utc::now();
    for entry in entries {
        if abort.as_ref().is_some_and(CancellationToken::is_cancelled) {
            tracing::info!("delivery recovery interrupted");
            break;
        }

        if entry.retry_count >= config.max_retries {
            let reason = format!(
                "retries exhausted after {} attempts: {}",
                entry.retry_count,
                entry.last_error.as_deref().unwrap_or("unknown error")
            );
            queue.mark_dead(&entry.id, &reason).await?;
            tracing::warn!(queue_id = %entry.id, channel = %entry.delivery.channel, "delivery moved to dead letter");
            summary.dead += 1;
            continue;
        }

        if let Some(last_error) = entry
            .last_error
            .as_deref()
            .filter(|reason| DeliveryError::is_fatal_reason(reason))
        {
            queue.mark_dead(&entry.id, last_error).await?;
            tracing::warn!(queue_id = %entry.id, channel = %entry.delivery.channel, "non-retryable delivery moved to dead letter");
            summary.dead += 1;
            continue;
        }

        if next_attempt_at(config, &entry) > now {
            tracing::debug!(queue_id = %entry.id, "delivery still backing off; deferred");
            summary.deferred += 1;
            continue;
        }

        let mut request = DeliveryRequest::from_queued(entry.delivery.clone());
        request.skip_queue = true;
        request.abort = abort.clone();

        match delivery.deliver(request).await {
            Ok(results) => {
                queue.ack(&entry.id).await?;
                tracing::info!(queue_id = %entry.id, sent = results.len(), "queued delivery recovered");
                summary.recovered += 1;
            }
            Err(err) if err.is_abort() => {
                tracing::info!(queue_id = %entry.id, "delivery recovery interrupted");
                break;
            }
            Err(err) if !err.is_retryable() => {
                queue.mark_dead(&entry.id, &err.reason()).await?;
                tracing::warn!(queue_id = %entry.id, error = %err, "non-retryable delivery moved to dead letter");
                summary.dead += 1;
            }
            Err(err) => {
                queue.fail(&entry.id, &err.reason()).await?;
                tracing::warn!(queue_id = %entry.id, error = %err, "queued delivery failed again");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_steps_clamp_to_the_last_value() {
        let config = QueueConfig::default();
        assert_eq!(backoff_for(&config, 0), Duration::from_secs(5));
        assert_eq!(backoff_for(&config, 2), Duration::from_secs(120));
        assert_eq!(backoff_for(&config, 40), Duration::from_secs(600));

        let empty = QueueConfig {
            backoff_secs: Vec::new(),
            ..QueueConfig::default()
        };
        assert_eq!(backoff_for(&empty, 3), Duration::ZERO);
    }
}
