//! Utility functions for `courier`.
//!
//! Character-aware string helpers shared by the hooks, the transcript mirror,
//! and the channel adapters.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// This function safely handles multi-byte UTF-8 characters (emoji, CJK, accented characters)
/// by using character boundaries instead of byte indices.
///
/// # Examples
/// ```ignore
/// use courier::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("Hello 🦀 World", 8), "Hello 🦀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            // Trim trailing whitespace for cleaner output
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Number of UTF-16 code units needed to encode the first `chars` characters of `s`.
///
/// Platforms such as Signal express style offsets in UTF-16 units.
pub fn utf16_len_of_prefix(s: &str, chars: usize) -> usize {
    s.chars().take(chars).map(char::len_utf16).sum()
}

/// Last path segment of a URL or file path, without query string or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if parsed.scheme() != "file" && !parsed.cannot_be_a_base() {
            return parsed
                .path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(str::to_string);
        }
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    path.split(['?', '#'])
        .next()
        .unwrap_or(path)
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
