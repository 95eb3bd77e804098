pub mod schema;
pub mod traits;

pub use schema::{
    AccountOutboundConfig, BuiltinHooksConfig, ChannelOutboundConfig, ChannelsConfig, ChunkMode,
    Config, HooksConfig, MetadataCacheConfig, MirrorConfig, OutboundConfig, QueueConfig,
    SignalAccountConfig, SignalConfig, TelegramConfig, WebhookConfig, DEFAULT_TEXT_CHUNK_LIMIT,
};
