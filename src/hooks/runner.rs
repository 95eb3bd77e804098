use super::traits::{
    HookContext, HookHandler, HookKind, HookResult, MessageSendingEvent, MessageSentEvent,
};
use anyhow::Context;

/// Ordered set of hook handlers, shared process-wide behind an `Arc`.
#[derive(Default)]
pub struct HookRunner {
    handlers: Vec<Box<dyn HookHandler>>,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run by descending priority, then registration order.
    pub fn register(&mut self, handler: Box<dyn HookHandler>) {
        self.handlers.push(handler);
        self.handlers
            .sort_by_key(|handler| std::cmp::Reverse(handler.priority()));
    }

    pub fn has_hooks(&self, kind: HookKind) -> bool {
        self.handlers.iter().any(|handler| handler.handles(kind))
    }

    /// Chain every `message_sending` handler: each sees the previous handler's
    /// content, and the first cancel wins. A handler error aborts the chain.
    pub async fn run_on_message_sending(
        &self,
        event: MessageSendingEvent,
        ctx: &HookContext,
    ) -> anyhow::Result<HookResult<String>> {
        let MessageSendingEvent {
            to,
            mut content,
            metadata,
        } = event;

        for handler in self
            .handlers
            .iter()
            .filter(|handler| handler.handles(HookKind::MessageSending))
        {
            let step = MessageSendingEvent {
                to: to.clone(),
                content,
                metadata: metadata.clone(),
            };
            match handler
                .on_message_sending(step, ctx)
                .await
                .with_context(|| format!("message_sending hook '{}' failed", handler.name()))?
            {
                HookResult::Cancel(reason) => {
                    tracing::debug!(hook = handler.name(), %reason, "message_sending hook canceled unit");
                    return Ok(HookResult::Cancel(reason));
                }
                HookResult::Continue(next) => content = next,
            }
        }

        Ok(HookResult::Continue(content))
    }

    /// Notify every `message_sent` handler. All handlers run; the first error is returned.
    pub async fn run_on_message_sent(
        &self,
        event: &MessageSentEvent,
        ctx: &HookContext,
    ) -> anyhow::Result<()> {
        let mut first_error = None;
        for handler in self
            .handlers
            .iter()
            .filter(|handler| handler.handles(HookKind::MessageSent))
        {
            if let Err(err) = handler.on_message_sent(event, ctx).await {
                let err = err.context(format!("message_sent hook '{}' failed", handler.name()));
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
