//! Text and timestamp normalization for feed entries.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Longest summary, in characters, that survives normalization.
pub const MAX_SUMMARY_CHARS: usize = 400;

const ELLIPSIS: &str = "...";

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Decode HTML entities, strip markup tags and collapse whitespace.
///
/// Entities are decoded first so entity-escaped markup is stripped as well.
/// Tags are replaced by a space so adjacent words in separate elements stay apart.
pub fn strip_markup(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    let without_tags = RE_TAGS.replace_all(&decoded, " ");
    RE_WS.replace_all(&without_tags, " ").trim().to_string()
}

/// Normalize a summary: markup-free, single-spaced, and at most
/// [`MAX_SUMMARY_CHARS`] characters long.
///
/// Longer text is cut to `MAX_SUMMARY_CHARS - 3` characters followed by `...`.
pub fn normalize_text(raw: &str) -> String {
    let text = strip_markup(raw);
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text;
    }

    let mut truncated: String = text
        .chars()
        .take(MAX_SUMMARY_CHARS - ELLIPSIS.len())
        .collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Pick the publication instant of an entry and render it canonically.
///
/// The published time wins, then the updated time, then `now`. Instants that
/// cannot be rendered as a four-digit-year timestamp count as absent.
pub fn canonical_timestamp(
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    published
        .filter(is_valid_instant)
        .or_else(|| updated.filter(is_valid_instant))
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn is_valid_instant(instant: &DateTime<Utc>) -> bool {
    (1..=9999).contains(&instant.year())
}
