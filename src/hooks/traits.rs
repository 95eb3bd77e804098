use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a modifying hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult<T> {
    /// Proceed with the (possibly rewritten) value.
    Continue(T),
    /// Suppress the operation, with a reason for logs and reports.
    Cancel(String),
}

impl<T> HookResult<T> {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    MessageSending,
    MessageSent,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageSending => "message_sending",
            Self::MessageSent => "message_sent",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub channel: String,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
}

/// A unit about to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendingEvent {
    pub to: String,
    pub content: String,
    pub metadata: MessageMetadata,
}

/// Report on a unit after its send attempt (or cancellation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentEvent {
    pub to: String,
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Conversation the hooked message belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookContext {
    pub channel_id: String,
    pub account_id: Option<String>,
    pub conversation_id: String,
    pub session_key: Option<String>,
    pub session_id: Option<String>,
}

/// A registered hook. Handlers only receive the kinds they declare in [`HookHandler::handles`].
#[async_trait]
pub trait HookHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn handles(&self, kind: HookKind) -> bool;

    async fn on_message_sending(
        &self,
        event: MessageSendingEvent,
        _ctx: &HookContext,
    ) -> anyhow::Result<HookResult<String>> {
        Ok(HookResult::Continue(event.content))
    }

    async fn on_message_sent(
        &self,
        _event: &MessageSentEvent,
        _ctx: &HookContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
