#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier::channels::OutboundIdentity;
use courier::config::Config;
use courier::outbound::{
    DeliveryRequest, DeliveryService, MirrorSpec, NormalizedOutboundPayload, QueueId,
    ReplyPayload,
};
use courier::{ChannelCommands, ConfigCommands, QueueCommands};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// `courier` - multi-channel outbound message delivery.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Deliver replies to chat channels with a crash-safe write-ahead queue.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver one or more payloads to a conversation
    #[command(long_about = "\
Deliver one or more payloads to a conversation.

Text is split to the channel's chunk limit, offered to message hooks, \
and sent in order. The delivery is written to the queue before the \
first send. Press Ctrl-C to stop before the next unit.

Examples:
  courier deliver --channel telegram --to -1001234 --text 'Deploy finished'
  courier deliver --channel signal --to +15550001111 --media https://x/cat.png --text 'cat'
  courier deliver --channel webhook --to ops --payloads replies.json --best-effort")]
    Deliver {
        /// Channel id (cli, webhook, telegram, signal)
        #[arg(long)]
        channel: String,

        /// Destination (chat id, phone number, group:<id>, ...)
        #[arg(long)]
        to: String,

        /// Account to send from, for per-account chunk settings
        #[arg(long)]
        account: Option<String>,

        /// Thread or topic id
        #[arg(long)]
        thread: Option<String>,

        /// Message id to reply to
        #[arg(long)]
        reply_to: Option<String>,

        /// Text body; repeat for one payload per value
        #[arg(long)]
        text: Vec<String>,

        /// Media URL or local path, attached to the last text payload
        #[arg(long)]
        media: Vec<String>,

        /// JSON file with an array of reply payloads
        #[arg(long)]
        payloads: Option<PathBuf>,

        /// Sender display name override
        #[arg(long)]
        identity_name: Option<String>,

        /// Continue past failed payloads
        #[arg(long)]
        best_effort: bool,

        /// Send without notification where supported
        #[arg(long)]
        silent: bool,

        /// Do not write the delivery to the queue
        #[arg(long)]
        no_queue: bool,

        /// Mirror delivered content into this session's transcript
        #[arg(long)]
        mirror_session: Option<String>,
    },

    /// Inspect and replay the write-ahead delivery queue
    Queue {
        #[command(subcommand)]
        queue_command: QueueCommands,
    },

    /// Manage channels
    Channel {
        #[command(subcommand)]
        channel_command: ChannelCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

/// Cancellation token fired by Ctrl-C.
fn abort_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping before the next unit");
            child.cancel();
        }
    });
    token
}

async fn read_payloads(path: &PathBuf) -> Result<Vec<ReplyPayload>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read payloads file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid payloads JSON in {}", path.display()))
}

fn text_payloads(text: Vec<String>, media: Vec<String>) -> Vec<ReplyPayload> {
    let mut payloads: Vec<ReplyPayload> = text.into_iter().map(ReplyPayload::text).collect();
    if !media.is_empty() {
        match payloads.last_mut() {
            Some(last) => last.media_urls.extend(media),
            None => payloads.push(ReplyPayload {
                media_urls: media,
                ..ReplyPayload::default()
            }),
        }
    }
    payloads
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("COURIER_CONFIG_DIR", config_dir);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    if let Commands::Config { config_command } = &cli.command {
        return match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        };
    }

    let config = Config::load_or_init().await?;
    config.validate()?;

    match cli.command {
        Commands::Deliver {
            channel,
            to,
            account,
            thread,
            reply_to,
            text,
            media,
            payloads,
            identity_name,
            best_effort,
            silent,
            no_queue,
            mirror_session,
        } => {
            let mut all = match &payloads {
                Some(path) => read_payloads(path).await?,
                None => Vec::new(),
            };
            all.extend(text_payloads(text, media));
            if all.is_empty() {
                bail!("Nothing to deliver: pass --text, --media, or --payloads");
            }

            let mirror = mirror_session.map(|session_key| MirrorSpec {
                session_key,
                text: Some(
                    all.iter()
                        .filter_map(|payload| payload.text.as_deref())
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                ),
                media_urls: all
                    .iter()
                    .flat_map(|payload| {
                        payload.media_urls.iter().chain(payload.media_url.iter()).cloned()
                    })
                    .collect(),
                ..MirrorSpec::default()
            });

            let mut request = DeliveryRequest::new(channel, to, all);
            request.account_id = account;
            request.thread_id = thread;
            request.reply_to_id = reply_to;
            request.identity = identity_name.map(|name| OutboundIdentity {
                name: Some(name),
                ..OutboundIdentity::default()
            });
            request.best_effort = best_effort;
            request.silent = silent;
            request.skip_queue = no_queue;
            request.mirror = mirror;
            request.abort = Some(abort_on_ctrl_c());
            request.on_error = Some(Arc::new(
                |err: &anyhow::Error, payload: &NormalizedOutboundPayload| {
                    eprintln!(
                        "payload failed ({} chars): {err:#}",
                        payload.text.chars().count()
                    );
                },
            ));

            let service = DeliveryService::from_config(&config)?;
            let results = service.delivery().deliver(request).await?;
            info!(sent = results.len(), "delivery complete");
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }

        Commands::Queue { queue_command } => {
            let service = DeliveryService::from_config(&config)?;
            match queue_command {
                QueueCommands::List => {
                    let entries = service.queue()?.list().await?;
                    if entries.is_empty() {
                        println!("Delivery queue is empty.");
                        return Ok(());
                    }
                    println!("Queued deliveries ({}):", entries.len());
                    for entry in entries {
                        println!(
                            "- {} [{}] {} -> {} | payloads={} retries={} enqueued={}{}",
                            entry.id,
                            entry.status,
                            entry.delivery.channel,
                            entry.delivery.to,
                            entry.delivery.payloads.len(),
                            entry.retry_count,
                            entry.enqueued_at.to_rfc3339(),
                            entry
                                .last_error
                                .as_deref()
                                .map(|err| format!(" error={err}"))
                                .unwrap_or_default()
                        );
                    }
                    Ok(())
                }
                QueueCommands::Recover => {
                    let summary = service.recover(Some(abort_on_ctrl_c())).await?;
                    println!(
                        "Recovered {}, failed {}, deferred {}, dead {}",
                        summary.recovered, summary.failed, summary.deferred, summary.dead
                    );
                    Ok(())
                }
                QueueCommands::Drop { id } => {
                    if service.queue()?.remove(&QueueId::from(id.as_str())).await? {
                        println!("Removed queued delivery {id}");
                        Ok(())
                    } else {
                        bail!("No queued delivery with id {id}")
                    }
                }
            }
        }

        Commands::Channel { channel_command } => match channel_command {
            ChannelCommands::List => {
                println!("Channels:");
                for (name, desc, configured) in config.channels_config.channels() {
                    let mark = if configured { "✅" } else { "❌" };
                    println!("  {mark} {name:<10} {desc}");
                }
                Ok(())
            }
        },

        Commands::Config { .. } => Ok(()),
    }
}
