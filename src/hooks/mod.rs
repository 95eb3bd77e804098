//! Message hooks: externally supplied policy that sees every outgoing unit.
//!
//! `message_sending` handlers may rewrite or cancel a unit before it is sent;
//! `message_sent` handlers are notified of every attempt's outcome.

pub mod builtin;
mod runner;
mod traits;

pub use runner::HookRunner;
pub use traits::{
    HookContext, HookHandler, HookKind, HookResult, MessageMetadata, MessageSendingEvent,
    MessageSentEvent,
};

use crate::config::HooksConfig;

/// Build the process-wide hook runner from config. `None` when hooks are disabled.
pub fn runner_from_config(config: &HooksConfig) -> Option<HookRunner> {
    if !config.enabled {
        return None;
    }
    let mut runner = HookRunner::new();
    if config.builtin.delivery_logger {
        runner.register(Box::new(builtin::DeliveryLoggerHook::new()));
    }
    Some(runner)
}
