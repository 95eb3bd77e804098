use crate::outbound::chunk::{ChunkUnit, TextChunking};
use crate::outbound::payloads::NormalizedOutboundPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sender identity override (display name / avatar) for channels that support it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

/// Destination and correlation for one delivery call, shared by every unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundSendContext {
    pub to: String,
    pub account_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    pub identity: Option<OutboundIdentity>,
    /// Deliver without a notification where the platform supports it.
    pub silent: bool,
}

/// What an adapter can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundCapabilities {
    pub text: bool,
    pub media: bool,
    /// Accepts a whole payload with opaque channel data via `send_payload`.
    pub payload: bool,
}

impl Default for OutboundCapabilities {
    fn default() -> Self {
        Self {
            text: true,
            media: true,
            payload: false,
        }
    }
}

/// One dispatched unit, as reported by the channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundDeliveryResult {
    pub channel: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl OutboundDeliveryResult {
    pub fn new(channel: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message_id: message_id.into(),
            ..Self::default()
        }
    }
}

/// Outbound side of a messaging platform. Implement for any channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Registry id (lowercase, e.g. `"telegram"`).
    fn id(&self) -> &str;

    fn capabilities(&self) -> OutboundCapabilities {
        OutboundCapabilities::default()
    }

    /// How text is split before sending. `None` sends each text body as one unit.
    fn text_chunking(&self) -> Option<TextChunking> {
        None
    }

    /// Adapter default for the chunk limit; config overrides win.
    fn text_chunk_limit(&self) -> Option<usize> {
        None
    }

    async fn send_text(
        &self,
        ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> anyhow::Result<OutboundDeliveryResult>;

    async fn send_media(
        &self,
        ctx: &OutboundSendContext,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult>;

    /// Send a whole payload carrying opaque channel data.
    async fn send_payload(
        &self,
        _ctx: &OutboundSendContext,
        _payload: &NormalizedOutboundPayload,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        anyhow::bail!("channel {} does not accept channel payloads", self.id())
    }
}
