//! Markdown subset → plain text with inline style ranges.
//!
//! Channels such as Signal render styles from `(start, length, style)` ranges
//! over plain text instead of markup. Splitting keeps every range on the unit
//! it belongs to, clipped and rebased to that unit's start.

use crate::outbound::chunk::{split_spans, ChunkUnit};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextStyle {
    Bold,
    Italic,
    Strikethrough,
    Monospace,
    Spoiler,
}

impl TextStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bold => "BOLD",
            Self::Italic => "ITALIC",
            Self::Strikethrough => "STRIKETHROUGH",
            Self::Monospace => "MONOSPACE",
            Self::Spoiler => "SPOILER",
        }
    }
}

/// A styled span, in characters, relative to the start of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRange {
    pub start: usize,
    pub length: usize,
    pub style: TextStyle,
}

impl StyleRange {
    fn end(&self) -> usize {
        self.start + self.length
    }
}

/// Plain text plus its style ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledText {
    pub text: String,
    pub styles: Vec<StyleRange>,
}

const MARKERS: &[(&str, TextStyle)] = &[
    ("**", TextStyle::Bold),
    ("__", TextStyle::Bold),
    ("~~", TextStyle::Strikethrough),
    ("||", TextStyle::Spoiler),
    ("*", TextStyle::Italic),
    ("_", TextStyle::Italic),
];

/// Parse the supported markdown subset into plain text and style ranges.
pub fn parse_markdown(input: &str) -> StyledText {
    let chars: Vec<char> = input.chars().collect();
    let mut out: Vec<char> = Vec::with_capacity(chars.len());
    let mut styles: Vec<StyleRange> = Vec::new();
    let mut open: Vec<(&'static str, TextStyle, usize)> = Vec::new();
    let mut i = 0;

    'scan: while i < chars.len() {
        let at_line_start = i == 0 || chars[i - 1] == '\n';

        if at_line_start && starts_with(&chars, i, "```") {
            if let Some((body_start, body_end, next)) = fenced_block(&chars, i) {
                push_styled(&mut out, &mut styles, &chars[body_start..body_end], TextStyle::Monospace);
                i = next;
                continue;
            }
        }

        if chars[i] == '`' {
            if let Some(end) = find_inline(&chars, i + 1, '`') {
                push_styled(&mut out, &mut styles, &chars[i + 1..end], TextStyle::Monospace);
                i = end + 1;
                continue;
            }
        }

        if chars[i] == '[' {
            if let Some((label, url, next)) = parse_link(&chars, i) {
                out.extend(label.chars());
                if !url.is_empty() && url != label {
                    out.extend(format!(" ({url})").chars());
                }
                i = next;
                continue;
            }
        }

        for &(token, style) in MARKERS {
            if !starts_with(&chars, i, token) {
                continue;
            }
            let len = token.chars().count();
            if let Some(pos) = open.iter().rposition(|(t, _, _)| *t == token) {
                if can_close(&chars, i, len, token) {
                    let (_, style, start) = open.remove(pos);
                    if out.len() > start {
                        styles.push(StyleRange {
                            start,
                            length: out.len() - start,
                            style,
                        });
                    }
                    i += len;
                    continue 'scan;
                }
            } else if can_open(&chars, i, len, token) && has_closer(&chars, i + len, token) {
                open.push((token, style, out.len()));
                i += len;
                continue 'scan;
            }
        }

        out.push(chars[i]);
        i += 1;
    }

    // Markers that never closed are restored as literal text.
    for (token, _, pos) in open.into_iter().rev() {
        let len = token.chars().count();
        for (offset, ch) in token.chars().enumerate() {
            out.insert(pos + offset, ch);
        }
        for range in &mut styles {
            if range.start >= pos {
                range.start += len;
            } else if range.end() > pos {
                range.length += len;
            }
        }
    }

    styles.sort_by_key(|range| (range.start, range.length));
    StyledText {
        text: out.into_iter().collect(),
        styles,
    }
}

/// Rich-text splitter: parse `markdown` and split the plain text into units of
/// at most `limit` characters, carrying the style ranges of each unit.
pub fn markdown_to_styled_chunks(markdown: &str, limit: usize) -> Vec<ChunkUnit> {
    let parsed = parse_markdown(markdown);
    let chars: Vec<char> = parsed.text.chars().collect();

    split_spans(&chars, limit)
        .into_iter()
        .map(|(start, end)| ChunkUnit {
            text: chars[start..end].iter().collect(),
            styles: clip_styles(&parsed.styles, start, end),
        })
        .collect()
}

/// Ranges overlapping `[start, end)`, clipped to it and rebased to `start`.
pub fn clip_styles(styles: &[StyleRange], start: usize, end: usize) -> Vec<StyleRange> {
    styles
        .iter()
        .filter_map(|range| {
            let clipped_start = range.start.max(start);
            let clipped_end = range.end().min(end);
            (clipped_start < clipped_end).then(|| StyleRange {
                start: clipped_start - start,
                length: clipped_end - clipped_start,
                style: range.style,
            })
        })
        .collect()
}

fn push_styled(out: &mut Vec<char>, styles: &mut Vec<StyleRange>, body: &[char], style: TextStyle) {
    let start = out.len();
    out.extend_from_slice(body);
    if !body.is_empty() {
        styles.push(StyleRange {
            start,
            length: body.len(),
            style,
        });
    }
}

fn starts_with(chars: &[char], at: usize, token: &str) -> bool {
    let mut idx = at;
    for ch in token.chars() {
        if chars.get(idx) != Some(&ch) {
            return false;
        }
        idx += 1;
    }
    true
}

/// `(body_start, body_end, next)` for a fenced block opening at `at`.
fn fenced_block(chars: &[char], at: usize) -> Option<(usize, usize, usize)> {
    let opener_end = chars[at..].iter().position(|c| *c == '\n')? + at;
    let body_start = opener_end + 1;
    let mut line_start = body_start;
    while line_start <= chars.len() {
        if starts_with(chars, line_start, "```") {
            let body_end = if line_start > body_start {
                line_start - 1
            } else {
                body_start
            };
            let after_marker = line_start + 3;
            let next = chars[after_marker..]
                .iter()
                .position(|c| *c == '\n')
                .map_or(chars.len(), |p| after_marker + p);
            return Some((body_start, body_end, next));
        }
        let line_end = chars[line_start..].iter().position(|c| *c == '\n')?;
        line_start += line_end + 1;
    }
    None
}

fn find_inline(chars: &[char], from: usize, close: char) -> Option<usize> {
    chars[from..]
        .iter()
        .take_while(|c| **c != '\n')
        .position(|c| *c == close)
        .map(|p| from + p)
        .filter(|end| *end > from)
}

/// `[label](url)` → `(label, url, next)`.
fn parse_link(chars: &[char], at: usize) -> Option<(String, String, usize)> {
    let label_end = find_inline(chars, at + 1, ']')?;
    if chars.get(label_end + 1) != Some(&'(') {
        return None;
    }
    let url_end = find_inline(chars, label_end + 2, ')')?;
    let label: String = chars[at + 1..label_end].iter().collect();
    let url: String = chars[label_end + 2..url_end].iter().collect();
    Some((label, url.trim().to_string(), url_end + 1))
}

fn is_word_char(ch: Option<&char>) -> bool {
    ch.is_some_and(|c| c.is_alphanumeric())
}

fn can_open(chars: &[char], at: usize, len: usize, token: &str) -> bool {
    let next = chars.get(at + len);
    if next.is_none_or(|c| c.is_whitespace()) {
        return false;
    }
    // `**` read as a doubled `*` never opens italics.
    if len == 1 && next.is_some_and(|c| token.starts_with(*c)) {
        return false;
    }
    !(token.starts_with('_') && at > 0 && is_word_char(chars.get(at - 1)))
}

fn can_close(chars: &[char], at: usize, len: usize, token: &str) -> bool {
    if at == 0 || chars[at - 1].is_whitespace() {
        return false;
    }
    !(token.starts_with('_') && is_word_char(chars.get(at + len)))
}

fn has_closer(chars: &[char], from: usize, token: &str) -> bool {
    let len = token.chars().count();
    (from..chars.len()).any(|idx| starts_with(chars, idx, token) && can_close(chars, idx, len, token))
}
