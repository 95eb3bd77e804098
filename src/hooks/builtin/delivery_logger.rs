use crate::hooks::{HookContext, HookHandler, HookKind, MessageSentEvent};
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;

const PREVIEW_CHARS: usize = 80;

/// Logs every send outcome for auditing.
pub struct DeliveryLoggerHook;

impl DeliveryLoggerHook {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HookHandler for DeliveryLoggerHook {
    fn name(&self) -> &str {
        "delivery-logger"
    }

    fn priority(&self) -> i32 {
        -100
    }

    fn handles(&self, kind: HookKind) -> bool {
        kind == HookKind::MessageSent
    }

    async fn on_message_sent(
        &self,
        event: &MessageSentEvent,
        ctx: &HookContext,
    ) -> anyhow::Result<()> {
        let preview = truncate_with_ellipsis(&event.content, PREVIEW_CHARS);
        if event.success {
            tracing::info!(
                channel = %ctx.channel_id,
                account = ctx.account_id.as_deref().unwrap_or("default"),
                to = %event.to,
                chars = event.content.chars().count(),
                %preview,
                "outbound unit delivered"
            );
        } else {
            tracing::warn!(
                channel = %ctx.channel_id,
                account = ctx.account_id.as_deref().unwrap_or("default"),
                to = %event.to,
                error = event.error.as_deref().unwrap_or("unknown"),
                %preview,
                "outbound unit not delivered"
            );
        }
        Ok(())
    }
}
