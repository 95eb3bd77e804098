//! Outbound channel adapters.
//!
//! Each platform implements [`ChannelOutbound`] in its own submodule. The
//! [`ChannelRegistry`] maps channel ids to adapters and is built from the
//! `[channels_config]` section by [`ChannelRegistry::from_config`].
//!
//! # Extension
//!
//! To add a channel, implement [`ChannelOutbound`] in a new submodule and wire
//! it into [`ChannelRegistry::from_config`].

pub mod cli;
pub mod metadata_cache;
pub mod signal;
pub mod telegram;
pub mod traits;
pub mod webhook;

pub use cli::CliOutbound;
pub use metadata_cache::MetadataCache;
pub use signal::SignalOutbound;
pub use telegram::TelegramOutbound;
#[allow(unused_imports)]
pub use traits::{
    ChannelOutbound, OutboundCapabilities, OutboundDeliveryResult, OutboundIdentity,
    OutboundSendContext,
};
pub use webhook::WebhookOutbound;

use crate::config::Config;
use std::collections::HashMap;
use std::sync::Arc;

/// Channel id → adapter. Ids are matched case-insensitively.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelOutbound>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own id, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ChannelOutbound>) {
        self.adapters
            .insert(adapter.id().to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelOutbound>> {
        self.adapters
            .get(&channel.trim().to_ascii_lowercase())
            .cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let channels = &config.channels_config;

        if channels.cli {
            registry.register(Arc::new(CliOutbound::new()));
        }
        if let Some(webhook) = &channels.webhook {
            registry.register(Arc::new(WebhookOutbound::new(webhook)?));
        }
        if let Some(telegram) = &channels.telegram {
            registry.register(Arc::new(TelegramOutbound::new(
                telegram,
                &config.metadata_cache,
            )?));
        }
        if let Some(signal) = &channels.signal {
            registry.register(Arc::new(SignalOutbound::new(signal)?));
        }

        tracing::debug!(channels = ?registry.ids(), "channel registry ready");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SignalConfig, TelegramConfig};

    #[test]
    fn default_config_registers_cli_only() {
        let registry = ChannelRegistry::from_config(&Config::default()).unwrap();
        assert_eq!(registry.ids(), vec!["cli"]);
    }

    #[test]
    fn configured_channels_are_registered() {
        let mut config = Config::default();
        config.channels_config.cli = false;
        config.channels_config.telegram = Some(TelegramConfig {
            bot_token: "123:ABC".into(),
            api_base: "https://api.telegram.org".into(),
        });
        config.channels_config.signal = Some(SignalConfig::new(
            "http://127.0.0.1:8686",
            "+1234567890",
        ));

        let registry = ChannelRegistry::from_config(&config).unwrap();
        assert_eq!(registry.ids(), vec!["signal", "telegram"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = ChannelRegistry::from_config(&Config::default()).unwrap();
        assert!(registry.get(" CLI ").is_some());
        assert!(registry.get("discord").is_none());
    }
}
