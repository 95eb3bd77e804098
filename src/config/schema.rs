use crate::config::traits::ChannelConfig;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Fallback text chunk limit when neither the channel adapter nor the config provides one.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4000;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level courier configuration, loaded from `config.toml`.
///
/// Resolution order: `COURIER_CONFIG_DIR` env → `COURIER_WORKSPACE` env → `~/.courier/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Text chunking defaults and per-channel/per-account overrides (`[outbound]`).
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Write-ahead delivery queue (`[queue]`).
    #[serde(default)]
    pub queue: QueueConfig,

    /// Message hooks (`[hooks]`).
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Session transcript mirroring (`[mirror]`).
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Conversation/thread metadata cache used by channel adapters (`[metadata_cache]`).
    #[serde(default)]
    pub metadata_cache: MetadataCacheConfig,

    /// Channel adapter configurations (`[channels_config]`).
    #[serde(default)]
    pub channels_config: ChannelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let courier_dir = home.join(".courier");

        Self {
            workspace_dir: courier_dir.join("workspace"),
            config_path: courier_dir.join("config.toml"),
            outbound: OutboundConfig::default(),
            queue: QueueConfig::default(),
            hooks: HooksConfig::default(),
            mirror: MirrorConfig::default(),
            metadata_cache: MetadataCacheConfig::default(),
            channels_config: ChannelsConfig::default(),
        }
    }
}

// ── Outbound chunking ─────────────────────────────────────────────

/// How a text body is split before it is handed to a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    /// Split purely on the length limit, preferring whitespace boundaries.
    #[default]
    Length,
    /// Split on paragraph (blank line) boundaries first, then enforce the limit.
    Newline,
}

/// Outbound text chunking configuration (`[outbound]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutboundConfig {
    /// Chunk limit used when no channel or account override applies. Default: `4000`.
    #[serde(default = "default_text_chunk_limit")]
    pub default_text_chunk_limit: usize,
    /// Per-channel overrides keyed by channel id (`[outbound.channels.telegram]`).
    #[serde(default)]
    pub channels: HashMap<String, ChannelOutboundConfig>,
}

fn default_text_chunk_limit() -> usize {
    DEFAULT_TEXT_CHUNK_LIMIT
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            default_text_chunk_limit: DEFAULT_TEXT_CHUNK_LIMIT,
            channels: HashMap::new(),
        }
    }
}

impl OutboundConfig {
    /// Channel section for `channel`, matched case-insensitively.
    pub fn channel(&self, channel: &str) -> Option<&ChannelOutboundConfig> {
        self.channels.get(channel).or_else(|| {
            self.channels
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(channel))
                .map(|(_, value)| value)
        })
    }

    /// Account section for `account` under `channel`.
    pub fn account(&self, channel: &str, account: Option<&str>) -> Option<&AccountOutboundConfig> {
        let account = account.map(str::trim).filter(|a| !a.is_empty())?;
        self.channel(channel)?.accounts.get(account)
    }
}

/// Per-channel chunking overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChannelOutboundConfig {
    /// Maximum characters per outbound text unit.
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
    /// Chunk mode for this channel.
    #[serde(default)]
    pub chunk_mode: Option<ChunkMode>,
    /// Per-account overrides keyed by account id.
    #[serde(default)]
    pub accounts: HashMap<String, AccountOutboundConfig>,
}

/// Per-account chunking overrides; these take precedence over the channel section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccountOutboundConfig {
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
    #[serde(default)]
    pub chunk_mode: Option<ChunkMode>,
}

// ── Delivery queue ────────────────────────────────────────────────

/// Write-ahead delivery queue configuration (`[queue]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueueConfig {
    /// Persist every delivery before sending. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database path, relative to the workspace unless absolute. `~` is expanded.
    #[serde(default = "default_queue_db_path")]
    pub db_path: String,
    /// Attempts after which a failed record is moved to the dead-letter state. Default: `5`.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// Backoff before each replay attempt, in seconds. The last value repeats.
    #[serde(default = "default_queue_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Age before a never-resolved (`pending`) record is treated as orphaned
    /// and replayed, in seconds. Covers a delivery still sending in another
    /// process. Default: `300`.
    #[serde(default = "default_queue_in_flight_grace_secs")]
    pub in_flight_grace_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_queue_db_path() -> String {
    "state/delivery-queue.db".into()
}

fn default_queue_max_retries() -> u32 {
    5
}

fn default_queue_backoff_secs() -> Vec<u64> {
    vec![5, 25, 120, 600]
}

fn default_queue_in_flight_grace_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_queue_db_path(),
            max_retries: default_queue_max_retries(),
            backoff_secs: default_queue_backoff_secs(),
            in_flight_grace_secs: default_queue_in_flight_grace_secs(),
        }
    }
}

impl QueueConfig {
    /// Absolute database path for this workspace.
    pub fn resolve_db_path(&self, workspace_dir: &Path) -> PathBuf {
        resolve_workspace_path(&self.db_path, workspace_dir)
    }
}

fn resolve_workspace_path(raw: &str, workspace_dir: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw.trim()).into_owned());
    if expanded.is_absolute() {
        expanded
    } else {
        workspace_dir.join(expanded)
    }
}

// ── Hooks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HooksConfig {
    /// Enable message hook execution.
    ///
    /// Hooks run in-process and see every outgoing unit before it is sent.
    pub enabled: bool,
    #[serde(default)]
    pub builtin: BuiltinHooksConfig,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            builtin: BuiltinHooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BuiltinHooksConfig {
    /// Enable the delivery-logger hook (logs every send outcome for auditing).
    #[serde(default)]
    pub delivery_logger: bool,
}

// ── Transcript mirror ────────────────────────────────────────────

/// Session transcript mirroring (`[mirror]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MirrorConfig {
    /// Append delivered replies to session transcripts when a mirror target is given.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transcript directory, relative to the workspace unless absolute.
    #[serde(default = "default_mirror_dir")]
    pub dir: String,
}

fn default_mirror_dir() -> String {
    "transcripts".into()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_mirror_dir(),
        }
    }
}

impl MirrorConfig {
    pub fn resolve_dir(&self, workspace_dir: &Path) -> PathBuf {
        resolve_workspace_path(&self.dir, workspace_dir)
    }
}

// ── Metadata cache ───────────────────────────────────────────────

/// Bounds for the per-conversation metadata cache (`[metadata_cache]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetadataCacheConfig {
    /// Seconds a cached entry stays valid. Default: `21600` (6 hours).
    #[serde(default = "default_metadata_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum cached entries; the oldest entry is evicted first. Default: `500`.
    #[serde(default = "default_metadata_cache_max_entries")]
    pub max_entries: usize,
}

fn default_metadata_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_metadata_cache_max_entries() -> usize {
    500
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_metadata_cache_ttl_secs(),
            max_entries: default_metadata_cache_max_entries(),
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────

/// Top-level channel configurations (`[channels_config]` section).
///
/// Each channel sub-section (e.g. `telegram`, `signal`) is optional;
/// setting it to `Some(...)` registers that channel's outbound adapter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChannelsConfig {
    /// Enable the stdout CLI channel. Default: `true`.
    #[serde(default = "default_true")]
    pub cli: bool,
    /// Generic HTTP webhook channel configuration.
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Telegram bot channel configuration.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    /// Signal channel configuration.
    #[serde(default)]
    pub signal: Option<SignalConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            cli: true,
            webhook: None,
            telegram: None,
            signal: None,
        }
    }
}

impl ChannelsConfig {
    /// Display name and configured flag for every known channel.
    pub fn channels(&self) -> Vec<(&'static str, &'static str, bool)> {
        vec![
            ("CLI", "stdout", self.cli),
            (
                WebhookConfig::name(),
                WebhookConfig::desc(),
                self.webhook.is_some(),
            ),
            (
                TelegramConfig::name(),
                TelegramConfig::desc(),
                self.telegram.is_some(),
            ),
            (
                SignalConfig::name(),
                SignalConfig::desc(),
                self.signal.is_some(),
            ),
        ]
    }
}

/// Outbound HTTP webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookConfig {
    /// Endpoint receiving one JSON POST per outbound unit.
    pub url: String,
    /// Optional bearer token sent in the `Authorization` header.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Adapter-level chunk limit. Omit to send each payload's text as one unit.
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
}

impl ChannelConfig for WebhookConfig {
    fn name() -> &'static str {
        "Webhook"
    }
    fn desc() -> &'static str {
        "HTTP endpoint"
    }
}

/// Telegram bot channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TelegramConfig {
    /// Telegram Bot API token (from @BotFather).
    pub bot_token: String,
    /// Bot API base URL. Default: `https://api.telegram.org`.
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

impl ChannelConfig for TelegramConfig {
    fn name() -> &'static str {
        "Telegram"
    }
    fn desc() -> &'static str {
        "deliver through your bot"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SignalConfig {
    /// Base URL for the signal-cli HTTP daemon (e.g. "http://127.0.0.1:8686").
    pub http_url: String,
    /// E.164 phone number of the signal-cli account (e.g. "+1234567890").
    pub account: String,
    /// Largest remote attachment fetched for inlining, in MB. Default: `50`.
    #[serde(default = "default_signal_media_max_mb")]
    pub media_max_mb: u64,
    /// Per-account overrides keyed by account id (`[channels_config.signal.accounts.<id>]`).
    #[serde(default)]
    pub accounts: HashMap<String, SignalAccountConfig>,
}

/// Per-account Signal overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SignalAccountConfig {
    #[serde(default)]
    pub media_max_mb: Option<u64>,
}

fn default_signal_media_max_mb() -> u64 {
    50
}

impl SignalConfig {
    pub fn new(http_url: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into(),
            account: account.into(),
            media_max_mb: default_signal_media_max_mb(),
            accounts: HashMap::new(),
        }
    }

    /// Attachment size cap in bytes: account override, then channel value.
    pub fn media_max_bytes(&self, account_id: Option<&str>) -> u64 {
        let mb = account_id
            .and_then(|id| self.accounts.get(id))
            .and_then(|account| account.media_max_mb)
            .unwrap_or(self.media_max_mb);
        mb.saturating_mul(1024 * 1024)
    }
}

impl ChannelConfig for SignalConfig {
    fn name() -> &'static str {
        "Signal"
    }
    fn desc() -> &'static str {
        "An open-source, encrypted messaging service"
    }
}

// ── Loading / saving ─────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".courier"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigResolutionSource {
    EnvConfigDir,
    EnvWorkspace,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::EnvConfigDir => "COURIER_CONFIG_DIR",
            Self::EnvWorkspace => "COURIER_WORKSPACE",
            Self::DefaultConfigDir => "default",
        }
    }
}

fn resolve_runtime_config_dirs() -> Result<(PathBuf, PathBuf, ConfigResolutionSource)> {
    if let Ok(custom_config_dir) = std::env::var("COURIER_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            let courier_dir = PathBuf::from(custom_config_dir);
            return Ok((
                courier_dir.clone(),
                courier_dir.join("workspace"),
                ConfigResolutionSource::EnvConfigDir,
            ));
        }
    }

    if let Ok(custom_workspace) = std::env::var("COURIER_WORKSPACE") {
        let custom_workspace = custom_workspace.trim();
        if !custom_workspace.is_empty() {
            let workspace_dir = PathBuf::from(custom_workspace);
            return Ok((
                workspace_dir.clone(),
                workspace_dir,
                ConfigResolutionSource::EnvWorkspace,
            ));
        }
    }

    let courier_dir = default_config_dir()?;
    Ok((
        courier_dir.clone(),
        courier_dir.join("workspace"),
        ConfigResolutionSource::DefaultConfigDir,
    ))
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let (courier_dir, workspace_dir, resolution_source) = resolve_runtime_config_dirs()?;
        let config = Self::load_or_init_at(&courier_dir, &workspace_dir).await?;
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source = resolution_source.as_str(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Load `config.toml` from `courier_dir`, writing defaults first when it does not exist.
    pub async fn load_or_init_at(courier_dir: &Path, workspace_dir: &Path) -> Result<Self> {
        let config_path = courier_dir.join("config.toml");

        fs::create_dir_all(courier_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                courier_dir.display()
            )
        })?;
        fs::create_dir_all(workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let mut config = if config_path.exists() {
            // Warn if config file is world-readable (may contain bot tokens)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            config.workspace_dir = workspace_dir.to_path_buf();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir.to_path_buf();
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    ///
    /// Called after TOML deserialization and env-override application to catch
    /// obviously invalid values early instead of failing mid-delivery.
    pub fn validate(&self) -> Result<()> {
        // Outbound
        if self.outbound.default_text_chunk_limit == 0 {
            anyhow::bail!("outbound.default_text_chunk_limit must be greater than 0");
        }
        for (channel, section) in &self.outbound.channels {
            if section.text_chunk_limit == Some(0) {
                anyhow::bail!("outbound.channels.{channel}.text_chunk_limit must be greater than 0");
            }
            for (account, account_section) in &section.accounts {
                if account_section.text_chunk_limit == Some(0) {
                    anyhow::bail!(
                        "outbound.channels.{channel}.accounts.{account}.text_chunk_limit must be greater than 0"
                    );
                }
            }
        }

        // Queue
        if self.queue.max_retries == 0 {
            anyhow::bail!("queue.max_retries must be greater than 0");
        }
        if self.queue.backoff_secs.is_empty() {
            anyhow::bail!("queue.backoff_secs must not be empty");
        }
        if self.queue.db_path.trim().is_empty() {
            anyhow::bail!("queue.db_path must not be empty");
        }

        // Metadata cache
        if self.metadata_cache.max_entries == 0 {
            anyhow::bail!("metadata_cache.max_entries must be greater than 0");
        }

        // Channels
        if let Some(webhook) = &self.channels_config.webhook {
            if webhook.url.trim().is_empty() {
                anyhow::bail!("channels_config.webhook.url must not be empty");
            }
            if webhook.text_chunk_limit == Some(0) {
                anyhow::bail!("channels_config.webhook.text_chunk_limit must be greater than 0");
            }
        }
        if let Some(telegram) = &self.channels_config.telegram {
            if telegram.bot_token.trim().is_empty() {
                anyhow::bail!("channels_config.telegram.bot_token must not be empty");
            }
        }
        if let Some(signal) = &self.channels_config.signal {
            if signal.http_url.trim().is_empty() {
                anyhow::bail!("channels_config.signal.http_url must not be empty");
            }
            if signal.account.trim().is_empty() {
                anyhow::bail!("channels_config.signal.account must not be empty");
            }
            if signal.media_max_mb == 0 {
                anyhow::bail!("channels_config.signal.media_max_mb must be greater than 0");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = non_empty_env("COURIER_TELEGRAM_BOT_TOKEN") {
            match self.channels_config.telegram.as_mut() {
                Some(telegram) => telegram.bot_token = token,
                None => {
                    self.channels_config.telegram = Some(TelegramConfig {
                        bot_token: token,
                        api_base: default_telegram_api_base(),
                    });
                }
            }
        }

        if let Some(url) = non_empty_env("COURIER_WEBHOOK_URL") {
            match self.channels_config.webhook.as_mut() {
                Some(webhook) => webhook.url = url,
                None => {
                    self.channels_config.webhook = Some(WebhookConfig {
                        url,
                        bearer_token: None,
                        text_chunk_limit: None,
                    });
                }
            }
        }
        if let Some(token) = non_empty_env("COURIER_WEBHOOK_TOKEN") {
            if let Some(webhook) = self.channels_config.webhook.as_mut() {
                webhook.bearer_token = Some(token);
            }
        }

        let signal_url = non_empty_env("COURIER_SIGNAL_HTTP_URL");
        let signal_account = non_empty_env("COURIER_SIGNAL_ACCOUNT");
        match self.channels_config.signal.as_mut() {
            Some(signal) => {
                if let Some(url) = signal_url {
                    signal.http_url = url;
                }
                if let Some(account) = signal_account {
                    signal.account = account;
                }
            }
            None => {
                if let (Some(http_url), Some(account)) = (signal_url, signal_account) {
                    self.channels_config.signal = Some(SignalConfig::new(http_url, account));
                }
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_default_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.outbound.default_text_chunk_limit, 4000);
        assert!(config.queue.enabled);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.backoff_secs, vec![5, 25, 120, 600]);
        assert_eq!(config.queue.in_flight_grace_secs, 300);
        assert!(config.hooks.enabled);
        assert!(!config.hooks.builtin.delivery_logger);
        assert!(config.channels_config.cli);
        assert!(config.channels_config.telegram.is_none());
    }

    #[test]
    fn empty_toml_uses_section_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.outbound.default_text_chunk_limit, 4000);
        assert_eq!(parsed.queue.db_path, "state/delivery-queue.db");
        assert_eq!(parsed.mirror.dir, "transcripts");
        assert!(parsed.channels_config.cli);
    }

    #[test]
    fn outbound_overrides_parse_from_toml() {
        let raw = r#"
[outbound]
default_text_chunk_limit = 2000

[outbound.channels.telegram]
text_chunk_limit = 1600
chunk_mode = "newline"

[outbound.channels.telegram.accounts.ops]
text_chunk_limit = 800
"#;
        let parsed: Config = toml::from_str(raw).unwrap();
        let telegram = parsed.outbound.channel("telegram").unwrap();
        assert_eq!(telegram.text_chunk_limit, Some(1600));
        assert_eq!(telegram.chunk_mode, Some(ChunkMode::Newline));
        let ops = parsed.outbound.account("telegram", Some("ops")).unwrap();
        assert_eq!(ops.text_chunk_limit, Some(800));
        assert!(ops.chunk_mode.is_none());
        assert!(parsed.outbound.account("telegram", Some("  ")).is_none());
    }

    #[test]
    fn outbound_channel_lookup_is_case_insensitive() {
        let mut config = Config::default();
        config.outbound.channels.insert(
            "Telegram".into(),
            ChannelOutboundConfig {
                text_chunk_limit: Some(10),
                ..ChannelOutboundConfig::default()
            },
        );
        assert_eq!(
            config
                .outbound
                .channel("telegram")
                .and_then(|c| c.text_chunk_limit),
            Some(10)
        );
    }

    #[test]
    fn validate_rejects_zero_chunk_limit() {
        let mut config = Config::default();
        config.outbound.default_text_chunk_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_text_chunk_limit"));
    }

    #[test]
    fn validate_rejects_empty_backoff() {
        let mut config = Config::default();
        config.queue.backoff_secs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_signal_account() {
        let mut config = Config::default();
        config.channels_config.signal = Some(SignalConfig::new("http://127.0.0.1:8686", " "));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signal.account"));
    }

    #[test]
    fn signal_media_cap_prefers_account_override() {
        let raw = r#"
http_url = "http://127.0.0.1:8686"
account = "+1234567890"
media_max_mb = 10

[accounts.work]
media_max_mb = 2
"#;
        let signal: SignalConfig = toml::from_str(raw).unwrap();
        assert_eq!(signal.media_max_bytes(None), 10 * 1024 * 1024);
        assert_eq!(signal.media_max_bytes(Some("work")), 2 * 1024 * 1024);
        assert_eq!(signal.media_max_bytes(Some("home")), 10 * 1024 * 1024);

        let defaults = SignalConfig::new("http://127.0.0.1:8686", "+1");
        assert_eq!(defaults.media_max_bytes(None), 50 * 1024 * 1024);
    }

    #[test]
    fn queue_db_path_resolves_relative_to_workspace() {
        let queue = QueueConfig::default();
        let workspace = Path::new("/srv/courier/workspace");
        assert_eq!(
            queue.resolve_db_path(workspace),
            PathBuf::from("/srv/courier/workspace/state/delivery-queue.db")
        );

        let absolute = QueueConfig {
            db_path: "/var/lib/courier/queue.db".into(),
            ..QueueConfig::default()
        };
        assert_eq!(
            absolute.resolve_db_path(workspace),
            PathBuf::from("/var/lib/courier/queue.db")
        );
    }

    #[tokio::test]
    async fn sync_directory_handles_existing_directory() {
        let tmp = TempDir::new().unwrap();
        sync_directory(tmp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn load_or_init_at_writes_defaults_then_reloads() {
        let tmp = TempDir::new().unwrap();
        let courier_dir = tmp.path().join("courier");
        let workspace_dir = courier_dir.join("workspace");

        let first = Config::load_or_init_at(&courier_dir, &workspace_dir)
            .await
            .unwrap();
        assert!(first.config_path.exists());
        assert_eq!(first.workspace_dir, workspace_dir);

        let second = Config::load_or_init_at(&courier_dir, &workspace_dir)
            .await
            .unwrap();
        assert_eq!(
            second.outbound.default_text_chunk_limit,
            first.outbound.default_text_chunk_limit
        );
    }

    #[tokio::test]
    async fn save_replaces_existing_config_atomically() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.config_path = tmp.path().join("config.toml");
        config.workspace_dir = tmp.path().join("workspace");
        config.save().await.unwrap();

        config.queue.max_retries = 9;
        config.save().await.unwrap();

        let contents = tokio::fs::read_to_string(&config.config_path)
            .await
            .unwrap();
        let parsed: Config = toml::from_str(&contents).unwrap();
        assert_eq!(parsed.queue.max_retries, 9);
        assert!(!tmp.path().join("config.toml.bak").exists());
    }
}
