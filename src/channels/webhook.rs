use super::traits::{
    ChannelOutbound, OutboundCapabilities, OutboundDeliveryResult, OutboundSendContext,
};
use crate::config::WebhookConfig;
use crate::outbound::chunk::{chunk_text, ChunkUnit, ChunkerMode, TextChunking};
use crate::outbound::payloads::NormalizedOutboundPayload;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Generic HTTP channel: one JSON POST per outbound unit.
pub struct WebhookOutbound {
    url: String,
    bearer_token: Option<String>,
    text_chunk_limit: Option<usize>,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum WebhookKind {
    Text,
    Media,
    Payload,
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    kind: WebhookKind,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<&'a super::traits::OutboundIdentity>,
    silent: bool,
    text: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    styles: &'a [crate::outbound::rich_text::StyleRange],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    media_urls: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_data: Option<&'a serde_json::Value>,
}

impl<'a> WebhookBody<'a> {
    fn new(kind: WebhookKind, ctx: &'a OutboundSendContext, text: &'a str) -> Self {
        Self {
            kind,
            to: &ctx.to,
            account_id: ctx.account_id.as_deref(),
            thread_id: ctx.thread_id.as_deref(),
            reply_to_id: ctx.reply_to_id.as_deref(),
            identity: ctx.identity.as_ref(),
            silent: ctx.silent,
            text,
            styles: &[],
            media_urls: &[],
            channel_data: None,
        }
    }
}

impl WebhookOutbound {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url: config.url.trim().to_string(),
            bearer_token: config
                .bearer_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
            text_chunk_limit: config.text_chunk_limit,
            client,
        })
    }

    async fn post(&self, body: &WebhookBody<'_>) -> anyhow::Result<OutboundDeliveryResult> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Webhook POST failed ({status}): {text}");
        }

        let parsed: Option<serde_json::Value> = serde_json::from_str(&text).ok();
        let message_id = parsed
            .as_ref()
            .and_then(|value| value.get("id"))
            .and_then(|id| match id {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut result = OutboundDeliveryResult::new("webhook", message_id);
        result.conversation_id = Some(body.to.to_string());
        result.meta = parsed;
        Ok(result)
    }
}

#[async_trait]
impl ChannelOutbound for WebhookOutbound {
    fn id(&self) -> &str {
        "webhook"
    }

    fn capabilities(&self) -> OutboundCapabilities {
        OutboundCapabilities {
            text: true,
            media: true,
            payload: true,
        }
    }

    fn text_chunking(&self) -> Option<TextChunking> {
        self.text_chunk_limit.map(|_| TextChunking::Plain {
            chunker: chunk_text,
            mode: ChunkerMode::Text,
        })
    }

    fn text_chunk_limit(&self) -> Option<usize> {
        self.text_chunk_limit
    }

    async fn send_text(
        &self,
        ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let mut body = WebhookBody::new(WebhookKind::Text, ctx, &unit.text);
        body.styles = &unit.styles;
        self.post(&body).await
    }

    async fn send_media(
        &self,
        ctx: &OutboundSendContext,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let media = [media_url.to_string()];
        let mut body = WebhookBody::new(WebhookKind::Media, ctx, &caption.text);
        body.styles = &caption.styles;
        body.media_urls = &media;
        self.post(&body).await
    }

    async fn send_payload(
        &self,
        ctx: &OutboundSendContext,
        payload: &NormalizedOutboundPayload,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let mut body = WebhookBody::new(WebhookKind::Payload, ctx, &payload.text);
        body.media_urls = &payload.media_urls;
        body.channel_data = payload.channel_data.as_ref();
        self.post(&body).await
    }
}
