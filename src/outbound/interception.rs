//! Hook interception around each atomic send unit, plus the `Recovered`
//! outcome used wherever a failure is logged and delivery continues.

use crate::hooks::{
    HookContext, HookKind, HookResult, HookRunner, MessageMetadata, MessageSendingEvent,
    MessageSentEvent,
};
use std::sync::Arc;

/// Outcome of a fire-and-forget step: either it worked, or it failed and
/// `value` is the fallback to continue with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered<T> {
    Ok(T),
    Degraded { value: T, reason: String },
}

impl<T> Recovered<T> {
    pub fn from_result(result: anyhow::Result<T>, fallback: impl FnOnce() -> T) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Degraded {
                value: fallback(),
                reason: format!("{err:#}"),
            },
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => value,
        }
    }

    /// Unwrap to the value, logging a degraded outcome at warn.
    pub fn settle(self, step: &str) -> T {
        match self {
            Self::Ok(value) => value,
            Self::Degraded { value, reason } => {
                tracing::warn!(step, %reason, "recovered from failure; continuing");
                value
            }
        }
    }
}

/// What to do with a unit after `message_sending` hooks ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    Send(String),
    Cancel(String),
}

/// Per-call binding of the hook runner to one destination.
///
/// Hook presence is queried once at construction; when no handler is
/// registered for a kind, that hook point is a pass-through.
pub struct MessageInterceptor {
    runner: Option<Arc<HookRunner>>,
    can_send_hook: bool,
    can_sent_hook: bool,
    to: String,
    metadata: MessageMetadata,
    ctx: HookContext,
}

impl MessageInterceptor {
    pub fn new(
        runner: Option<Arc<HookRunner>>,
        to: &str,
        metadata: MessageMetadata,
        ctx: HookContext,
    ) -> Self {
        let can_send_hook = runner
            .as_ref()
            .is_some_and(|runner| runner.has_hooks(HookKind::MessageSending));
        let can_sent_hook = runner
            .as_ref()
            .is_some_and(|runner| runner.has_hooks(HookKind::MessageSent));
        Self {
            runner,
            can_send_hook,
            can_sent_hook,
            to: to.to_string(),
            metadata,
            ctx,
        }
    }

    /// Run `message_sending` hooks. A hook error passes the original content through.
    pub async fn before_send(&self, content: &str) -> Recovered<SendDecision> {
        let Some(runner) = self.runner.as_ref().filter(|_| self.can_send_hook) else {
            return Recovered::Ok(SendDecision::Send(content.to_string()));
        };

        let event = MessageSendingEvent {
            to: self.to.clone(),
            content: content.to_string(),
            metadata: self.metadata.clone(),
        };
        let outcome = runner
            .run_on_message_sending(event, &self.ctx)
            .await
            .map(|result| match result {
                HookResult::Continue(content) => SendDecision::Send(content),
                HookResult::Cancel(reason) => SendDecision::Cancel(reason),
            })
            .map_err(|err| {
                err.context(format!(
                    "message_sending hook failed: channel={} to={}",
                    self.metadata.channel, self.to
                ))
            });
        Recovered::from_result(outcome, || SendDecision::Send(content.to_string()))
    }

    /// Report a send attempt to `message_sent` hooks. Errors are never propagated.
    pub async fn after_send(
        &self,
        content: &str,
        success: bool,
        error: Option<String>,
    ) -> Recovered<()> {
        let Some(runner) = self.runner.as_ref().filter(|_| self.can_sent_hook) else {
            return Recovered::Ok(());
        };

        let event = MessageSentEvent {
            to: self.to.clone(),
            content: content.to_string(),
            success,
            error,
        };
        let outcome = runner.run_on_message_sent(&event, &self.ctx).await.map_err(|err| {
            err.context(format!(
                "message_sent hook failed: channel={} to={}",
                self.metadata.channel, self.to
            ))
        });
        Recovered::from_result(outcome, || ())
    }
}
