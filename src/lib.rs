#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unused_self,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod channels;
pub mod config;
pub mod hooks;
pub mod outbound;
pub(crate) mod util;

pub use config::Config;
pub use outbound::{DeliveryError, DeliveryRequest, DeliveryService, OutboundDelivery};

/// Write-ahead queue subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueCommands {
    /// List queued deliveries (pending, failed, and dead)
    List,
    /// Replay pending and failed deliveries
    #[command(long_about = "\
Replay pending and failed deliveries.

Records are replayed oldest first without re-enqueueing. Records that \
are out of retries move to the dead state; records still inside their \
backoff window are skipped until a later run.

Examples:
  courier queue recover")]
    Recover,
    /// Delete a queued delivery by ID
    Drop {
        /// Queue record ID
        id: String,
    },
}

/// Channel subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelCommands {
    /// List known channels and whether each is configured
    List,
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the JSON schema of config.toml
    Schema,
}
