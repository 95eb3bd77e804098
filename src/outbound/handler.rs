use crate::channels::traits::{
    ChannelOutbound, OutboundCapabilities, OutboundDeliveryResult, OutboundSendContext,
};
use crate::channels::ChannelRegistry;
use crate::config::OutboundConfig;
use crate::outbound::chunk::{
    resolve_chunk_mode, resolve_text_chunk_limit, ChunkPlan, ChunkUnit, TextChunking,
};
use crate::outbound::error::DeliveryError;
use crate::outbound::payloads::NormalizedOutboundPayload;
use std::sync::Arc;

/// A channel adapter bound to one delivery call: destination context and the
/// resolved chunk plan. Owned by that call and never shared.
pub struct ChannelHandler {
    channel: String,
    adapter: Arc<dyn ChannelOutbound>,
    ctx: OutboundSendContext,
    capabilities: OutboundCapabilities,
    plan: ChunkPlan,
}

impl ChannelHandler {
    /// Resolve `channel` from the registry. An adapter without both text and
    /// media support is a configuration error.
    pub fn resolve(
        registry: &ChannelRegistry,
        channel: &str,
        ctx: OutboundSendContext,
        config: &OutboundConfig,
    ) -> Result<Self, DeliveryError> {
        let not_configured = || DeliveryError::NotConfigured {
            channel: channel.to_string(),
        };
        let adapter = registry.get(channel).ok_or_else(not_configured)?;
        let capabilities = adapter.capabilities();
        if !(capabilities.text && capabilities.media) {
            return Err(not_configured());
        }

        let plan = match adapter.text_chunking() {
            None => ChunkPlan::unbounded(),
            Some(chunking) => ChunkPlan {
                chunking: Some(chunking),
                limit: Some(resolve_text_chunk_limit(
                    config,
                    channel,
                    ctx.account_id.as_deref(),
                    adapter.text_chunk_limit(),
                )),
                mode: resolve_chunk_mode(config, channel, ctx.account_id.as_deref()),
            },
        };

        tracing::debug!(
            channel,
            limit = ?plan.limit,
            mode = ?plan.mode,
            "resolved channel handler"
        );

        Ok(Self {
            channel: channel.to_string(),
            adapter,
            ctx,
            capabilities,
            plan,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn supports_payload(&self) -> bool {
        self.capabilities.payload
    }

    /// Caption as sent with media. Rich-text channels get the styled form of
    /// the whole caption; it is never split.
    pub fn caption_unit(&self, caption: &str) -> ChunkUnit {
        match self.plan.chunking {
            Some(TextChunking::RichText { splitter }) if !caption.trim().is_empty() => {
                splitter(caption, usize::MAX)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| ChunkUnit::plain(caption))
            }
            _ => ChunkUnit::plain(caption),
        }
    }

    pub async fn send_text(&self, unit: &ChunkUnit) -> anyhow::Result<OutboundDeliveryResult> {
        self.adapter.send_text(&self.ctx, unit).await
    }

    pub async fn send_media(
        &self,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        self.adapter.send_media(&self.ctx, caption, media_url).await
    }

    pub async fn send_payload(
        &self,
        payload: &NormalizedOutboundPayload,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        self.adapter.send_payload(&self.ctx, payload).await
    }
}
