//! Outbound delivery pipeline.
//!
//! Raw reply payloads are normalized ([`payloads`]), split into channel-sized
//! units ([`chunk`], [`rich_text`]), offered to hooks ([`interception`]), and
//! dispatched through a per-call [`handler::ChannelHandler`]. [`deliver`]
//! ties these together around the write-ahead [`queue`]; [`recovery`] replays
//! records left behind by a crash.

pub mod chunk;
pub mod deliver;
pub mod error;
pub mod handler;
pub mod interception;
pub mod mirror;
pub mod payloads;
pub mod queue;
pub mod recovery;
pub mod rich_text;
pub mod service;

pub use chunk::{ChunkPlan, ChunkUnit, ChunkerMode, TextChunking};
pub use deliver::{
    DeliveryRequest, ErrorObserver, OutboundDelivery, PayloadObserver, PARTIAL_FAILURE_REASON,
};
pub use error::DeliveryError;
pub use interception::Recovered;
pub use mirror::{JsonlTranscriptStore, MirrorSpec, TranscriptMirror};
pub use payloads::{normalize_outbound_payloads, NormalizedOutboundPayload, ReplyPayload};
pub use queue::{
    DeliveryQueue, InMemoryDeliveryQueue, QueueEntry, QueueId, QueueStatus, QueuedDelivery,
    SqliteDeliveryQueue,
};
pub use recovery::{recover_pending_deliveries, RecoverySummary};
pub use service::DeliveryService;
