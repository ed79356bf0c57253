//! Content classification from stream URLs.

use serde::{Deserialize, Serialize};
use url::Url;

/// Content-type partition of a single stream.
///
/// Live channels are subject to group-decision filtering; vod and series
/// entries are gated by provider-level flags instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Live,
    Vod,
    Series,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Live => "live",
            ContentKind::Vod => "vod",
            ContentKind::Series => "series",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live" => Some(ContentKind::Live),
            "vod" => Some(ContentKind::Vod),
            "series" => Some(ContentKind::Series),
            _ => None,
        }
    }
}

const VOD_EXTENSIONS: [&str; 11] = [
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp",
];
const LIVE_EXTENSIONS: [&str; 4] = ["ts", "m3u8", "m2ts", "mts"];

/// Classify a stream URL.
///
/// Pure function: path segments first, then a `type`/`kind` query parameter,
/// then the final path extension, defaulting to live. URLs that do not parse
/// as absolute URIs fall back to a substring scan over the raw string.
pub fn classify(stream_url: &str) -> ContentKind {
    match Url::parse(stream_url) {
        Ok(url) => {
            let segments: Vec<String> = url
                .path_segments()
                .map(|s| s.map(|p| p.to_ascii_lowercase()).collect())
                .unwrap_or_default();
            if let Some(kind) = classify_segments(&segments) {
                return kind;
            }
            let params: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
                .collect();
            if let Some(kind) = classify_query(&params) {
                return kind;
            }
            classify_extension(segments.last().map(String::as_str).unwrap_or(""))
        }
        Err(_) => classify_raw(stream_url),
    }
}

fn classify_segments(segments: &[String]) -> Option<ContentKind> {
    for segment in segments {
        match segment.as_str() {
            "live" => return Some(ContentKind::Live),
            "series" => return Some(ContentKind::Series),
            "movie" | "movies" | "vod" => return Some(ContentKind::Vod),
            _ => {}
        }
    }
    None
}

fn classify_query(params: &[(String, String)]) -> Option<ContentKind> {
    for (key, value) in params {
        if key != "type" && key != "kind" {
            continue;
        }
        match value.as_str() {
            "live" => return Some(ContentKind::Live),
            "series" => return Some(ContentKind::Series),
            "vod" | "movie" => return Some(ContentKind::Vod),
            _ => {}
        }
    }
    None
}

fn classify_extension(last_segment: &str) -> ContentKind {
    let extension = match last_segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return ContentKind::Live,
    };
    if LIVE_EXTENSIONS.contains(&extension.as_str()) {
        ContentKind::Live
    } else if VOD_EXTENSIONS.contains(&extension.as_str()) {
        ContentKind::Vod
    } else {
        ContentKind::Live
    }
}

/// Fallback scan for strings that are not parseable as absolute URIs.
fn classify_raw(raw: &str) -> ContentKind {
    let (path, query) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect();
    if let Some(kind) = classify_segments(&segments) {
        return kind;
    }
    if let Some(query) = query {
        let params: Vec<(String, String)> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
            .collect();
        if let Some(kind) = classify_query(&params) {
            return kind;
        }
    }
    classify_extension(segments.last().map(String::as_str).unwrap_or(""))
}
