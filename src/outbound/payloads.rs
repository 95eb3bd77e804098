//! Reply payload normalization.
//!
//! Raw replies carry optional text, one or more media URLs, `MEDIA:` directive
//! lines embedded in the text, and opaque channel data. Normalization collapses
//! them into [`NormalizedOutboundPayload`] records, in input order, and applies
//! per-channel payload policy. Normalizing an already normalized list is a no-op.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Reply text that means "send nothing".
pub const SILENT_REPLY_TOKEN: &str = "NO_REPLY";

/// `MEDIA: <url>` on a line of its own.
static MEDIA_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*MEDIA:\s*`?([^`\s]+)`?\s*$").unwrap());

/// Leading whitespace-only lines.
static LEADING_BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[ \t]*\r?\n)+").unwrap());

/// A reply as produced upstream, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<serde_json::Value>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_urls.push(url.into());
        self
    }
}

/// Canonical payload the orchestrator iterates over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOutboundPayload {
    pub text: String,
    pub media_urls: Vec<String>,
    pub channel_data: Option<serde_json::Value>,
}

impl From<NormalizedOutboundPayload> for ReplyPayload {
    fn from(payload: NormalizedOutboundPayload) -> Self {
        Self {
            text: Some(payload.text).filter(|text| !text.is_empty()),
            media_url: None,
            media_urls: payload.media_urls,
            channel_data: payload.channel_data,
        }
    }
}

/// Channel-specific payload rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPolicy {
    Generic,
    /// No leading blank lines; payloads left without text or media are dropped.
    NoLeadingBlankLines,
}

impl PayloadPolicy {
    pub fn for_channel(channel: &str) -> Self {
        if channel.eq_ignore_ascii_case("whatsapp") {
            Self::NoLeadingBlankLines
        } else {
            Self::Generic
        }
    }
}

/// Normalize `payloads` for delivery on `channel`. Pure; order is preserved.
pub fn normalize_outbound_payloads(
    payloads: &[ReplyPayload],
    channel: &str,
) -> Vec<NormalizedOutboundPayload> {
    let policy = PayloadPolicy::for_channel(channel);
    payloads
        .iter()
        .filter_map(|payload| normalize_payload(payload, policy))
        .collect()
}

fn normalize_payload(
    payload: &ReplyPayload,
    policy: PayloadPolicy,
) -> Option<NormalizedOutboundPayload> {
    let raw_text = payload.text.as_deref().unwrap_or_default();
    let (mut text, directive_media) = extract_media_directives(raw_text);

    let mut media_urls: Vec<String> = Vec::new();
    let explicit = payload
        .media_urls
        .iter()
        .chain(payload.media_url.iter())
        .chain(directive_media.iter());
    for url in explicit {
        let url = url.trim();
        if !url.is_empty() && !media_urls.iter().any(|seen| seen == url) {
            media_urls.push(url.to_string());
        }
    }

    if text.trim() == SILENT_REPLY_TOKEN && media_urls.is_empty() {
        return None;
    }

    if policy == PayloadPolicy::NoLeadingBlankLines {
        text = LEADING_BLANK_LINES_RE.replace(&text, "").into_owned();
        if text.trim().is_empty() {
            text.clear();
        }
    }

    let has_text = !text.trim().is_empty();
    if !has_text && media_urls.is_empty() && payload.channel_data.is_none() {
        return None;
    }

    Some(NormalizedOutboundPayload {
        text,
        media_urls,
        channel_data: payload.channel_data.clone(),
    })
}

/// Split `MEDIA:` directive lines out of `text`, returning the remaining text
/// and the directive URLs in order.
fn extract_media_directives(text: &str) -> (String, Vec<String>) {
    if !text.contains("MEDIA:") {
        return (text.to_string(), Vec::new());
    }

    let mut urls = Vec::new();
    let mut kept = Vec::new();
    for line in text.lines() {
        match MEDIA_DIRECTIVE_RE.captures(line) {
            Some(caps) => urls.push(caps[1].to_string()),
            None => kept.push(line),
        }
    }
    if urls.is_empty() {
        return (text.to_string(), Vec::new());
    }
    (kept.join("\n").trim().to_string(), urls)
}
