//! Performance benchmarks for courier hot paths.
//!
//! Benchmarks cover:
//!   - Plain and markdown text chunking
//!   - Rich-text (styled) splitting
//!   - Full delivery call against a no-op channel, with and without the SQLite queue
//!
//! Run: `cargo bench`

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use courier::channels::{
    ChannelOutbound, ChannelRegistry, OutboundDeliveryResult, OutboundSendContext,
};
use courier::config::{ChunkMode, OutboundConfig};
use courier::outbound::chunk::{chunk_markdown_text, chunk_markdown_text_with_mode, chunk_text};
use courier::outbound::rich_text::markdown_to_styled_chunks;
use courier::outbound::{
    ChunkUnit, ChunkerMode, DeliveryRequest, OutboundDelivery, ReplyPayload, SqliteDeliveryQueue,
    TextChunking,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

struct NoopChannel;

#[async_trait]
impl ChannelOutbound for NoopChannel {
    fn id(&self) -> &str {
        "noop"
    }

    fn text_chunking(&self) -> Option<TextChunking> {
        Some(TextChunking::Plain {
            chunker: chunk_markdown_text,
            mode: ChunkerMode::Markdown,
        })
    }

    fn text_chunk_limit(&self) -> Option<usize> {
        Some(1600)
    }

    async fn send_text(
        &self,
        _ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> Result<OutboundDeliveryResult> {
        Ok(OutboundDeliveryResult::new("noop", unit.text.len().to_string()))
    }

    async fn send_media(
        &self,
        _ctx: &OutboundSendContext,
        _caption: &ChunkUnit,
        media_url: &str,
    ) -> Result<OutboundDeliveryResult> {
        Ok(OutboundDeliveryResult::new("noop", media_url))
    }
}

fn prose(paragraphs: usize) -> String {
    let paragraph = "The deploy finished in **42s** with _no_ regressions. \
        See `release-notes.md` for the full list of changes, including the \
        queue migration and the new retry schedule.";
    vec![paragraph; paragraphs].join("\n\n")
}

fn markdown_with_fence() -> String {
    let code: String = (0..200).map(|i| format!("let value_{i} = {i};\n")).collect();
    format!("{}\n\n```rust\n{code}```\n\n{}", prose(4), prose(4))
}

fn noop_delivery() -> OutboundDelivery {
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(NoopChannel));
    OutboundDelivery::new(Arc::new(registry), OutboundConfig::default())
}

// ─────────────────────────────────────────────────────────────────────────────
// Benchmark: chunking
// ─────────────────────────────────────────────────────────────────────────────

fn bench_chunking(c: &mut Criterion) {
    let long_prose = prose(60);
    let fenced = markdown_with_fence();

    c.bench_function("chunk_text_length_1600", |b| {
        b.iter(|| chunk_text(black_box(&long_prose), 1600));
    });

    c.bench_function("chunk_markdown_fenced_1600", |b| {
        b.iter(|| chunk_markdown_text(black_box(&fenced), 1600));
    });

    c.bench_function("chunk_markdown_newline_mode", |b| {
        b.iter(|| chunk_markdown_text_with_mode(black_box(&fenced), 1600, ChunkMode::Newline));
    });

    c.bench_function("rich_text_styled_chunks_2000", |b| {
        b.iter(|| markdown_to_styled_chunks(black_box(&long_prose), 2000));
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Benchmark: delivery call
// ─────────────────────────────────────────────────────────────────────────────

fn bench_delivery(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let body = prose(30);

    let plain = noop_delivery();
    c.bench_function("deliver_long_text_no_queue", |b| {
        b.iter(|| {
            rt.block_on(async {
                plain
                    .deliver(DeliveryRequest::new(
                        "noop",
                        "bench",
                        vec![ReplyPayload::text(black_box(body.clone()))],
                    ))
                    .await
                    .unwrap()
            })
        });
    });

    let tmp = tempfile::TempDir::new().unwrap();
    let queue = SqliteDeliveryQueue::open(&tmp.path().join("queue.db")).unwrap();
    let queued = noop_delivery().with_queue(Arc::new(queue));
    c.bench_function("deliver_long_text_sqlite_queue", |b| {
        b.iter(|| {
            rt.block_on(async {
                queued
                    .deliver(DeliveryRequest::new(
                        "noop",
                        "bench",
                        vec![ReplyPayload::text(black_box(body.clone()))],
                    ))
                    .await
                    .unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_chunking, bench_delivery);
criterion_main!(benches);
