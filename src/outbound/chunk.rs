//! Text chunking for outbound delivery.
//!
//! A channel declares how its text is split ([`TextChunking`]); the
//! orchestrator resolves a limit and a [`ChunkMode`] from config and asks a
//! [`ChunkPlan`] for the ordered units to send. All limits count characters.

use crate::config::{ChunkMode, OutboundConfig};
use crate::outbound::rich_text::StyleRange;
use serde::{Deserialize, Serialize};

/// Plain-text chunker: `(text, limit) -> chunks`.
pub type PlainChunker = fn(&str, usize) -> Vec<String>;

/// Rich-text splitter: `(markdown, limit) -> styled units`.
pub type RichTextSplitter = fn(&str, usize) -> Vec<ChunkUnit>;

/// Whether a plain chunker understands markdown structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerMode {
    Text,
    Markdown,
}

/// Chunking capability a channel declares.
#[derive(Debug, Clone, Copy)]
pub enum TextChunking {
    Plain {
        chunker: PlainChunker,
        mode: ChunkerMode,
    },
    /// Units carry inline style ranges that must survive the split.
    RichText { splitter: RichTextSplitter },
}

/// One send-sized piece of text, with style ranges for rich-text channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUnit {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<StyleRange>,
}

impl ChunkUnit {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            styles: Vec::new(),
        }
    }
}

/// Resolved chunking settings for one delivery call.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    pub chunking: Option<TextChunking>,
    pub limit: Option<usize>,
    pub mode: ChunkMode,
}

impl ChunkPlan {
    /// A plan that never splits.
    pub fn unbounded() -> Self {
        Self {
            chunking: None,
            limit: None,
            mode: ChunkMode::Length,
        }
    }

    /// Split `text` into ordered units. Blank text yields no units.
    pub fn units(&self, text: &str) -> Vec<ChunkUnit> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        match self.chunking {
            None => vec![ChunkUnit::plain(text)],
            Some(TextChunking::RichText { splitter }) => {
                let units = splitter(text, self.limit.unwrap_or(usize::MAX));
                if units.is_empty() {
                    vec![ChunkUnit::plain(text)]
                } else {
                    units
                }
            }
            Some(TextChunking::Plain { chunker, mode }) => {
                let Some(limit) = self.limit else {
                    return vec![ChunkUnit::plain(text)];
                };
                let pieces = match self.mode {
                    ChunkMode::Length => chunker(text, limit),
                    ChunkMode::Newline => newline_units(text, limit, chunker, mode),
                };
                if pieces.is_empty() {
                    vec![ChunkUnit::plain(text)]
                } else {
                    pieces.into_iter().map(ChunkUnit::plain).collect()
                }
            }
        }
    }
}

fn newline_units(text: &str, limit: usize, chunker: PlainChunker, mode: ChunkerMode) -> Vec<String> {
    let mut blocks = match mode {
        ChunkerMode::Markdown => chunk_markdown_text_with_mode(text, limit, ChunkMode::Newline),
        ChunkerMode::Text => chunk_by_paragraph(text, limit),
    };
    if blocks.is_empty() && !text.is_empty() {
        blocks.push(text.to_string());
    }

    let mut units = Vec::with_capacity(blocks.len());
    for block in blocks {
        let pieces = chunker(&block, limit);
        if pieces.is_empty() {
            if !block.is_empty() {
                units.push(block);
            }
        } else {
            units.extend(pieces);
        }
    }
    units
}

// ── Limit / mode resolution ──────────────────────────────────────

/// Chunk limit for `channel`: account override, channel override, adapter
/// fallback, then `outbound.default_text_chunk_limit`.
pub fn resolve_text_chunk_limit(
    config: &OutboundConfig,
    channel: &str,
    account_id: Option<&str>,
    fallback: Option<usize>,
) -> usize {
    config
        .account(channel, account_id)
        .and_then(|account| account.text_chunk_limit)
        .or_else(|| {
            config
                .channel(channel)
                .and_then(|section| section.text_chunk_limit)
        })
        .or(fallback)
        .filter(|limit| *limit > 0)
        .unwrap_or(config.default_text_chunk_limit)
}

/// Chunk mode for `channel`: account override, channel override, then length.
pub fn resolve_chunk_mode(config: &OutboundConfig, channel: &str, account_id: Option<&str>) -> ChunkMode {
    config
        .account(channel, account_id)
        .and_then(|account| account.chunk_mode)
        .or_else(|| config.channel(channel).and_then(|section| section.chunk_mode))
        .unwrap_or_default()
}

// ── Break finding ────────────────────────────────────────────────

/// Break offset (in chars) for a window of `limit` chars at the start of `chars`.
///
/// Prefers the last newline, then the last whitespace outside parentheses,
/// and hard-splits at `limit` otherwise. Always returns at least 1.
pub(crate) fn find_break(chars: &[char], limit: usize) -> usize {
    let limit = limit.max(1);
    if chars.len() <= limit {
        return chars.len();
    }

    let window = &chars[..limit];
    let mut depth = 0usize;
    let mut last_newline = None;
    let mut last_whitespace = None;
    for (idx, ch) in window.iter().enumerate() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '\n' => last_newline = Some(idx),
            c if c.is_whitespace() && depth == 0 => last_whitespace = Some(idx),
            _ => {}
        }
    }
    // A whitespace right after the window is a clean boundary too.
    if chars[limit].is_whitespace() && last_newline.is_none() {
        return limit;
    }

    match (last_newline, last_whitespace) {
        (Some(idx), _) if idx > 0 => idx,
        (_, Some(idx)) if idx > 0 => idx,
        _ => limit,
    }
}

/// Ordered `(start, end)` char spans covering `chars`, each at most `limit`
/// long, with whitespace at the boundaries excluded.
pub(crate) fn split_spans(chars: &[char], limit: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }

        let brk = find_break(&chars[start..], limit);
        let mut end = start + brk;
        while end > start && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        if end > start {
            spans.push((start, end));
        }
        start += brk;
    }
    spans
}

// ── Chunkers ─────────────────────────────────────────────────────

/// Length-mode chunker. Text that fits is returned unchanged.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if limit == 0 || chars.len() <= limit {
        return vec![text.to_string()];
    }

    split_spans(&chars, limit)
        .into_iter()
        .map(|(start, end)| chars[start..end].iter().collect())
        .collect()
}

/// Split on blank-line paragraph boundaries; paragraphs longer than `limit`
/// are further split with [`chunk_text`].
pub fn chunk_by_paragraph(text: &str, limit: usize) -> Vec<String> {
    paragraphs(text, false)
        .into_iter()
        .flat_map(|paragraph| chunk_text(&paragraph, limit))
        .collect()
}

/// Markdown-aware chunker: `length` mode splits like [`chunk_text`] but closes
/// and reopens fenced code blocks across a split; `newline` mode first splits
/// on paragraphs, keeping fenced blocks whole.
pub fn chunk_markdown_text_with_mode(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    match mode {
        ChunkMode::Length => chunk_markdown_text(text, limit),
        ChunkMode::Newline => paragraphs(text, true)
            .into_iter()
            .flat_map(|paragraph| chunk_markdown_text(&paragraph, limit))
            .collect(),
    }
}

/// Length-mode markdown chunker. A split inside a fenced code block closes
/// the fence in the emitted unit and reopens it in the next one.
pub fn chunk_markdown_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if limit == 0 || chars.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut open_fence: Option<Fence> = None;
    let mut pos = 0;

    while pos < chars.len() {
        if open_fence.is_none() {
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            if pos >= chars.len() {
                break;
            }
        }

        let prefix = open_fence
            .as_ref()
            .map(|fence| format!("{}\n", fence.opener))
            .unwrap_or_default();
        let prefix_len = prefix.chars().count();
        let rest = &chars[pos..];

        let budget = limit.saturating_sub(prefix_len);
        let reserve = open_fence.as_ref().map_or(MIN_FENCE_CLOSE_LEN, Fence::close_len);
        if budget <= reserve {
            // Opener alone nearly fills the limit; fall back to plain splitting.
            let tail: String = rest.iter().collect();
            chunks.extend(chunk_text(&tail, limit));
            break;
        }

        if prefix_len + rest.len() <= limit {
            let body: String = rest.iter().collect();
            let unit = format!("{prefix}{}", body.trim_end());
            if !unit.trim().is_empty() {
                chunks.push(unit);
            }
            break;
        }

        let mut brk = find_break(rest, budget);
        let mut fence_after = scan_fences(open_fence.clone(), &rest[..brk]);
        // Shrink until the closing marker of whichever fence is left open fits.
        let mut overflow = false;
        while let Some(close_len) = fence_after.as_ref().map(Fence::close_len) {
            if prefix_len + brk + close_len <= limit {
                break;
            }
            if budget <= close_len {
                overflow = true;
                break;
            }
            brk = find_break(rest, budget - close_len);
            fence_after = scan_fences(open_fence.clone(), &rest[..brk]);
        }
        if overflow {
            let tail: String = rest.iter().collect();
            chunks.extend(chunk_text(&tail, limit));
            break;
        }

        let body: String = rest[..brk].iter().collect();
        let mut unit = format!("{prefix}{}", body.trim_end());
        if let Some(fence) = &fence_after {
            unit.push('\n');
            unit.push_str(&fence.marker);
        }
        if !unit.trim().is_empty() {
            chunks.push(unit);
        }

        pos += brk;
        if fence_after.is_some() && chars.get(pos) == Some(&'\n') {
            pos += 1;
        }
        open_fence = fence_after;
    }

    chunks
}

/// `\n` plus the shortest (three-char) closing marker.
const MIN_FENCE_CLOSE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fence {
    opener: String,
    marker: String,
}

impl Fence {
    /// Chars appended to close this fence in an emitted unit.
    fn close_len(&self) -> usize {
        1 + self.marker.chars().count()
    }
}

fn fence_marker(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let run = trimmed.chars().take_while(|c| *c == ch).count();
    (run >= 3).then(|| ch.to_string().repeat(run))
}

/// Fence left open after `segment`, starting from `open`.
fn scan_fences(mut open: Option<Fence>, segment: &[char]) -> Option<Fence> {
    let text: String = segment.iter().collect();
    for line in text.split('\n') {
        let Some(marker) = fence_marker(line) else {
            continue;
        };
        match &open {
            Some(fence) if marker.starts_with(&fence.marker) && line.trim().len() == marker.len() => {
                open = None;
            }
            Some(_) => {}
            None => {
                open = Some(Fence {
                    opener: line.trim().to_string(),
                    marker,
                });
            }
        }
    }
    open
}

/// Paragraphs separated by blank lines. With `respect_fences`, blank lines
/// inside fenced code blocks do not end a paragraph.
fn paragraphs(text: &str, respect_fences: bool) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut fence: Option<String> = None;

    for line in text.lines() {
        if respect_fences {
            if let Some(marker) = fence_marker(line) {
                fence = match fence.take() {
                    Some(open) if marker.starts_with(&open) => None,
                    Some(open) => Some(open),
                    None => Some(marker),
                };
                current.push(line);
                continue;
            }
        }

        if line.trim().is_empty() && fence.is_none() {
            flush_paragraph(&mut current, &mut out);
        } else {
            current.push(line);
        }
    }
    flush_paragraph(&mut current, &mut out);
    out
}

fn flush_paragraph(current: &mut Vec<&str>, out: &mut Vec<String>) {
    if current.is_empty() {
        return;
    }
    let paragraph = current.join("\n");
    let paragraph = paragraph.trim_end();
    if !paragraph.trim().is_empty() {
        out.push(paragraph.to_string());
    }
    current.clear();
}
