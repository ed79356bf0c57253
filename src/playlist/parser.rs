//! Extended-M3U playlist parser.
//!
//! Accepts the `#EXTM3U` dialect: each entry carries one or more metadata
//! lines (`#EXTINF`, optionally `#EXTGRP` and others) followed by a stream
//! URL. Attribute extraction is case-insensitive.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::classify::{classify, ContentKind};

static TVG_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)tvg-id\s*=\s*"([^"]*)""#).expect("valid regex"));
static TVG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)tvg-name\s*=\s*"([^"]*)""#).expect("valid regex"));
static TVG_LOGO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)tvg-logo\s*=\s*"([^"]*)""#).expect("valid regex"));
static GROUP_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)group-title\s*=\s*"([^"]*)""#).expect("valid regex"));

/// Fallback display name for entries with neither a label nor a `tvg-name`.
pub const UNNAMED_CHANNEL: &str = "Unnamed Channel";

/// Errors raised by playlist parsing. Fetch transport errors live in `fetch`.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not an extended-M3U playlist: missing #EXTM3U header and entries")]
    NotAPlaylist,
}

/// One parsed playlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub display_name: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub logo_url: Option<String>,
    /// Resolved group title; empty when the entry carries none.
    pub group_title: String,
    pub stream_url: String,
    pub kind: ContentKind,
}

/// In-flight entry state while scanning metadata lines.
#[derive(Debug, Default)]
struct PendingEntry {
    label: Option<String>,
    tvg_id: Option<String>,
    tvg_name: Option<String>,
    logo_url: Option<String>,
    group_title: Option<String>,
    /// `#EXTGRP` marker; takes precedence over the `group-title` attribute.
    group_marker: Option<String>,
}

/// Parse playlist text into entries.
///
/// Lenient about unknown `#` directives and stray blank lines; an input with
/// neither a `#EXTM3U` header nor any `#EXTINF` entry is rejected as
/// malformed.
pub fn parse_playlist(text: &str) -> Result<Vec<ParsedEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut pending: Option<PendingEntry> = None;
    let mut saw_header = false;
    let mut saw_extinf = false;

    for (index, raw_line) in text.lines().enumerate() {
        let mut line = raw_line.trim();
        if index == 0 {
            line = line.trim_start_matches('\u{FEFF}');
        }
        if line.is_empty() {
            continue;
        }

        if strip_prefix_ci(line, "#EXTM3U").is_some() {
            saw_header = true;
            continue;
        }
        if let Some(rest) = strip_prefix_ci(line, "#EXTINF:") {
            saw_extinf = true;
            pending = Some(parse_extinf(rest));
            continue;
        }
        if let Some(rest) = strip_prefix_ci(line, "#EXTGRP:") {
            if let Some(entry) = pending.as_mut() {
                let group = rest.trim();
                if !group.is_empty() {
                    entry.group_marker = Some(group.to_string());
                }
            }
            continue;
        }
        if line.starts_with('#') {
            // Unknown metadata directive; part of the current entry, ignored.
            continue;
        }

        // A non-directive line is the stream URL terminating the entry.
        if let Some(entry) = pending.take() {
            entries.push(finish_entry(entry, line));
        }
    }

    if !saw_header && !saw_extinf {
        return Err(ParseError::NotAPlaylist);
    }
    Ok(entries)
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Parse the body of an `#EXTINF:` line (duration, attributes, label).
fn parse_extinf(body: &str) -> PendingEntry {
    let mut entry = PendingEntry {
        tvg_id: capture(&TVG_ID_RE, body),
        tvg_name: capture(&TVG_NAME_RE, body),
        logo_url: capture(&TVG_LOGO_RE, body),
        group_title: capture(&GROUP_TITLE_RE, body),
        ..PendingEntry::default()
    };
    entry.label = extract_label(body);
    entry
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract the trailing comma-delimited display label.
///
/// Quoted attribute values may themselves contain commas, so the label is
/// taken after the first comma that follows the last quote (or the first
/// comma at all when the line carries no quoted attributes).
fn extract_label(body: &str) -> Option<String> {
    let search_from = body.rfind('"').map(|i| i + 1).unwrap_or(0);
    let comma = body[search_from..].find(',')?;
    let label = body[search_from + comma + 1..].trim();
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

fn finish_entry(pending: PendingEntry, stream_url: &str) -> ParsedEntry {
    // Display name fallback chain: label, then tvg-name, then the literal.
    let display_name = pending
        .label
        .clone()
        .or_else(|| pending.tvg_name.clone())
        .unwrap_or_else(|| UNNAMED_CHANNEL.to_string());
    let group_title = pending
        .group_marker
        .or(pending.group_title)
        .unwrap_or_default();
    ParsedEntry {
        display_name,
        tvg_id: pending.tvg_id,
        tvg_name: pending.tvg_name,
        logo_url: pending.logo_url,
        group_title,
        kind: classify(stream_url),
        stream_url: stream_url.to_string(),
    }
}
