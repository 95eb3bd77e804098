use super::traits::{
    ChannelOutbound, OutboundCapabilities, OutboundDeliveryResult, OutboundSendContext,
};
use crate::config::SignalConfig;
use crate::outbound::chunk::{ChunkUnit, TextChunking};
use crate::outbound::rich_text::{markdown_to_styled_chunks, StyleRange};
use crate::util::{file_name_from_url, utf16_len_of_prefix};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use std::time::Duration;
use uuid::Uuid;

const GROUP_TARGET_PREFIX: &str = "group:";

/// Signal caps a message body at 2000 characters before it becomes a long-text attachment.
pub const SIGNAL_TEXT_CHUNK_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecipientTarget {
    Direct(String),
    Group(String),
}

/// Signal outbound adapter using signal-cli daemon's JSON-RPC API.
///
/// Sends via `POST /api/v1/rpc` on a running `signal-cli daemon --http <host:port>`.
/// Text is rendered as plain text plus `textStyle` ranges.
pub struct SignalOutbound {
    http_url: String,
    account: String,
    config: SignalConfig,
    client: Client,
}

impl SignalOutbound {
    pub fn new(config: &SignalConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Signal HTTP client")?;
        Ok(Self {
            http_url: config.http_url.trim_end_matches('/').to_string(),
            account: config.account.clone(),
            config: config.clone(),
            client,
        })
    }

    fn is_e164(recipient: &str) -> bool {
        let Some(number) = recipient.strip_prefix('+') else {
            return false;
        };
        (2..=15).contains(&number.len()) && number.chars().all(|c| c.is_ascii_digit())
    }

    fn is_uuid(s: &str) -> bool {
        Uuid::parse_str(s).is_ok()
    }

    fn parse_recipient_target(recipient: &str) -> RecipientTarget {
        if let Some(group_id) = recipient.strip_prefix(GROUP_TARGET_PREFIX) {
            return RecipientTarget::Group(group_id.to_string());
        }

        if Self::is_e164(recipient) || Self::is_uuid(recipient) {
            RecipientTarget::Direct(recipient.to_string())
        } else {
            RecipientTarget::Group(recipient.to_string())
        }
    }

    /// signal-cli `textStyle` entries (`start:length:STYLE`) in UTF-16 offsets.
    fn text_style_params(text: &str, styles: &[StyleRange]) -> Vec<String> {
        styles
            .iter()
            .filter(|range| range.length > 0)
            .map(|range| {
                let start = utf16_len_of_prefix(text, range.start);
                let end = utf16_len_of_prefix(text, range.start + range.length);
                format!("{start}:{}:{}", end - start, range.style.as_str())
            })
            .collect()
    }

    fn send_params(&self, ctx: &OutboundSendContext, unit: &ChunkUnit) -> serde_json::Value {
        let mut params = match Self::parse_recipient_target(&ctx.to) {
            RecipientTarget::Direct(number) => serde_json::json!({
                "recipient": [number],
                "account": &self.account,
            }),
            RecipientTarget::Group(group_id) => serde_json::json!({
                "groupId": group_id,
                "account": &self.account,
            }),
        };
        params["message"] = serde_json::Value::String(unit.text.clone());

        let styles = Self::text_style_params(&unit.text, &unit.styles);
        if !styles.is_empty() {
            params["textStyle"] = serde_json::json!(styles);
        }
        if let Some(quote) = ctx.reply_to_id.as_deref().and_then(|id| id.parse::<i64>().ok()) {
            params["quoteTimestamp"] = serde_json::json!(quote);
        }
        params
    }

    /// Remote URLs are fetched and inlined as a data URI; local paths are
    /// handed to signal-cli unchanged. Downloads stop once `max_bytes` is passed.
    async fn attachment_param(&self, media_url: &str, max_bytes: u64) -> anyhow::Result<String> {
        if !(media_url.starts_with("http://") || media_url.starts_with("https://")) {
            return Ok(media_url
                .strip_prefix("file://")
                .unwrap_or(media_url)
                .to_string());
        }

        let mut resp = self
            .client
            .get(media_url)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Signal attachment download failed ({}): {media_url}", resp.status());
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("application/octet-stream")
            .to_string();
        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                anyhow::bail!(
                    "Signal attachment too large ({len} bytes, max {max_bytes}): {media_url}"
                );
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > max_bytes {
                anyhow::bail!(
                    "Signal attachment too large (over {max_bytes} bytes): {media_url}"
                );
            }
        }

        let filename = file_name_from_url(media_url).unwrap_or_else(|| "attachment".into());
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(format!("data:{mime};filename={filename};base64,{data}"))
    }

    /// Send a JSON-RPC request to signal-cli daemon.
    async fn rpc_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let url = format!("{}/api/v1/rpc", self.http_url);
        let id = Uuid::new_v4().to_string();

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if resp.status().as_u16() == 201 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Signal RPC {method} failed ({status}): {text}");
        }

        let text = resp.text().await?;
        if text.is_empty() {
            return Ok(None);
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        if let Some(err) = parsed.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
            let msg = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown");
            anyhow::bail!("Signal RPC error {code}: {msg}");
        }

        Ok(parsed.get("result").cloned())
    }

    async fn send(
        &self,
        ctx: &OutboundSendContext,
        params: serde_json::Value,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let result = self.rpc_request("send", params).await?;
        let timestamp = result
            .as_ref()
            .and_then(|r| r.get("timestamp"))
            .and_then(serde_json::Value::as_i64);

        let message_id = timestamp
            .map(|ts| ts.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut delivered = OutboundDeliveryResult::new("signal", message_id);
        delivered.timestamp = timestamp;
        delivered.conversation_id = Some(ctx.to.clone());
        Ok(delivered)
    }
}

#[async_trait]
impl ChannelOutbound for SignalOutbound {
    fn id(&self) -> &str {
        "signal"
    }

    fn capabilities(&self) -> OutboundCapabilities {
        OutboundCapabilities {
            text: true,
            media: true,
            payload: false,
        }
    }

    fn text_chunking(&self) -> Option<TextChunking> {
        Some(TextChunking::RichText {
            splitter: markdown_to_styled_chunks,
        })
    }

    fn text_chunk_limit(&self) -> Option<usize> {
        Some(SIGNAL_TEXT_CHUNK_LIMIT)
    }

    async fn send_text(
        &self,
        ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let params = self.send_params(ctx, unit);
        self.send(ctx, params).await
    }

    async fn send_media(
        &self,
        ctx: &OutboundSendContext,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let mut params = self.send_params(ctx, caption);
        let max_bytes = self.config.media_max_bytes(ctx.account_id.as_deref());
        let attachment = self.attachment_param(media_url, max_bytes).await?;
        params["attachments"] = serde_json::json!([attachment]);
        self.send(ctx, params).await
    }
}
