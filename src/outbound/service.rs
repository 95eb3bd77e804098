use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::hooks::runner_from_config;
use crate::outbound::deliver::OutboundDelivery;
use crate::outbound::mirror::JsonlTranscriptStore;
use crate::outbound::queue::{DeliveryQueue, SqliteDeliveryQueue};
use crate::outbound::recovery::{recover_pending_deliveries, RecoverySummary};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Process-wide delivery wiring: registry, hooks, queue, and mirror are built
/// once at startup and shared by every delivery.
pub struct DeliveryService {
    delivery: OutboundDelivery,
    config: Config,
}

impl DeliveryService {
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = ChannelRegistry::from_config(config)?;
        let mut delivery = OutboundDelivery::new(Arc::new(registry), config.outbound.clone());

        if let Some(runner) = runner_from_config(&config.hooks) {
            delivery = delivery.with_hooks(Arc::new(runner));
        }

        if config.queue.enabled {
            let db_path = config.queue.resolve_db_path(&config.workspace_dir);
            let queue = SqliteDeliveryQueue::open(&db_path)
                .with_context(|| format!("Failed to open delivery queue at {}", db_path.display()))?;
            delivery = delivery.with_queue(Arc::new(queue));
        }

        if config.mirror.enabled {
            let dir = config.mirror.resolve_dir(&config.workspace_dir);
            delivery = delivery.with_mirror(Arc::new(JsonlTranscriptStore::new(dir)));
        }

        Ok(Self {
            delivery,
            config: config.clone(),
        })
    }

    pub fn delivery(&self) -> &OutboundDelivery {
        &self.delivery
    }

    pub fn queue(&self) -> Result<&Arc<dyn DeliveryQueue>> {
        self.delivery
            .queue()
            .context("Delivery queue is disabled ([queue] enabled = false)")
    }

    pub async fn recover(&self, abort: Option<CancellationToken>) -> Result<RecoverySummary> {
        let queue = Arc::clone(self.queue()?);
        recover_pending_deliveries(&self.delivery, queue.as_ref(), &self.config.queue, abort).await
    }
}
