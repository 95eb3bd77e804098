use super::traits::{ChannelOutbound, OutboundDeliveryResult, OutboundSendContext};
use crate::outbound::chunk::{chunk_text, ChunkUnit, ChunkerMode, TextChunking};
use async_trait::async_trait;
use std::io::Write;
use uuid::Uuid;

/// Prints outbound units to stdout. Useful for dry runs of a delivery.
#[derive(Default)]
pub struct CliOutbound;

impl CliOutbound {
    pub fn new() -> Self {
        Self
    }

    fn format_text(ctx: &OutboundSendContext, text: &str) -> String {
        let thread = ctx
            .thread_id
            .as_deref()
            .map(|thread| format!(" #{thread}"))
            .unwrap_or_default();
        format!("[{}{thread}] {text}", ctx.to)
    }

    fn emit(line: &str) -> anyhow::Result<OutboundDeliveryResult> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        Ok(OutboundDeliveryResult::new("cli", Uuid::new_v4().to_string()))
    }
}

#[async_trait]
impl ChannelOutbound for CliOutbound {
    fn id(&self) -> &str {
        "cli"
    }

    fn text_chunking(&self) -> Option<TextChunking> {
        Some(TextChunking::Plain {
            chunker: chunk_text,
            mode: ChunkerMode::Text,
        })
    }

    async fn send_text(
        &self,
        ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        Self::emit(&Self::format_text(ctx, &unit.text))
    }

    async fn send_media(
        &self,
        ctx: &OutboundSendContext,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let line = if caption.text.is_empty() {
            format!("[media] {media_url}")
        } else {
            format!("[media] {media_url} | {}", caption.text)
        };
        Self::emit(&Self::format_text(ctx, &line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_destination_and_thread() {
        let ctx = OutboundSendContext {
            to: "alice".into(),
            thread_id: Some("7".into()),
            ..OutboundSendContext::default()
        };
        assert_eq!(CliOutbound::format_text(&ctx, "hi"), "[alice #7] hi");
    }

    #[tokio::test]
    async fn send_text_returns_cli_result() {
        let ctx = OutboundSendContext {
            to: "alice".into(),
            ..OutboundSendContext::default()
        };
        let result = CliOutbound::new()
            .send_text(&ctx, &ChunkUnit::plain("hello"))
            .await
            .unwrap();
        assert_eq!(result.channel, "cli");
        assert!(!result.message_id.is_empty());
    }
}
