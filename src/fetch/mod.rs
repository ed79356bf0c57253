//! Upstream fetching for playlists and guide documents.
//!
//! Supports http(s) and `file://` locations, per-provider header and
//! user-agent injection, a hard per-request deadline, and `${VAR}`
//! substitution against a process-wide environment lookup. Guide payloads
//! are gzip auto-detected and decompressed.

use std::sync::LazyLock;
use std::time::Duration;

use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use thiserror::Error;
use url::Url;

use crate::db::models::Provider;
use crate::playlist::{parse_playlist, ParseError, ParsedEntry};

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Minimal guide document substituted when the guide fetch fails.
pub const EMPTY_GUIDE: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<tv></tv>\n";

/// Fetch errors, split into transport failures and malformed payloads.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("local file error: {0}")]
    File(String),

    #[error("unresolved environment variable ${{{0}}}")]
    EnvVar(String),

    #[error("unsupported location: {0}")]
    InvalidUrl(String),

    #[error("malformed playlist: {0}")]
    Parse(#[from] ParseError),
}

impl FetchError {
    /// Whether the bytes were retrieved but could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self, FetchError::Parse(_))
    }
}

/// Parsed playlist plus the raw byte total of the document.
#[derive(Debug)]
pub struct FetchedPlaylist {
    pub entries: Vec<ParsedEntry>,
    pub bytes: u64,
}

/// Guide document bytes, decompressed when gzipped.
#[derive(Debug)]
pub struct FetchedGuide {
    pub bytes: Vec<u8>,
}

/// Resolve `${VAR}` placeholders against a lookup. Missing variables are a
/// fetch error.
pub fn substitute_env(
    location: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, FetchError> {
    let mut out = String::with_capacity(location.len());
    let mut last = 0;
    for caps in ENV_VAR_RE.captures_iter(location) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&location[last..whole.start()]);
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => return Err(FetchError::EnvVar(name.to_string())),
        }
        last = whole.end();
    }
    out.push_str(&location[last..]);
    Ok(out)
}

/// Resolve `${VAR}` placeholders against the process environment.
pub fn substitute_process_env(location: &str) -> Result<String, FetchError> {
    substitute_env(location, |name| std::env::var(name).ok())
}

/// Rewrite `https://` on an explicit port 80 to `http://`.
///
/// Some upstreams mislabel plain HTTP as HTTPS on port 80 and fail TLS
/// immediately. Everything else passes through unchanged.
pub fn normalize_stream_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    if url.scheme() == "https" && url.port() == Some(80) && url.set_scheme("http").is_ok() {
        return url.to_string();
    }
    raw.to_string()
}

/// Fetch and parse the provider's playlist.
pub async fn fetch_playlist(provider: &Provider) -> Result<FetchedPlaylist, FetchError> {
    let location = substitute_process_env(&provider.playlist_url)?;
    let location = normalize_stream_url(&location);
    let raw = fetch_bytes(provider, &location).await?;
    let bytes = raw.len() as u64;
    let text = String::from_utf8_lossy(&raw);
    let mut entries = parse_playlist(&text)?;
    for entry in &mut entries {
        entry.stream_url = normalize_stream_url(&entry.stream_url);
    }
    Ok(FetchedPlaylist { entries, bytes })
}

/// Fetch the provider's guide document, if one is configured.
pub async fn fetch_guide(provider: &Provider) -> Result<Option<FetchedGuide>, FetchError> {
    let Some(guide_url) = provider.guide_url.as_deref().filter(|u| !u.trim().is_empty())
    else {
        return Ok(None);
    };
    let location = substitute_process_env(guide_url)?;
    let location = normalize_stream_url(&location);
    let raw = fetch_bytes(provider, &location).await?;
    let bytes = if looks_gzipped(&raw) {
        decompress_gzip(&raw)?
    } else {
        raw
    };
    Ok(Some(FetchedGuide { bytes }))
}

/// Retrieve raw bytes from an http(s) or `file://` location.
async fn fetch_bytes(provider: &Provider, location: &str) -> Result<Vec<u8>, FetchError> {
    if let Some(path) = file_path(location) {
        return tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::File(format!("{}: {}", path, e)));
    }
    if !location.starts_with("http://") && !location.starts_with("https://") {
        return Err(FetchError::InvalidUrl(location.to_string()));
    }

    let timeout = Duration::from_secs(provider.timeout_seconds.clamp(1, 300) as u64);
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(user_agent) = provider.user_agent.as_deref().filter(|s| !s.is_empty()) {
        builder = builder.user_agent(user_agent.to_string());
    }
    let client = builder
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))?;

    let mut request = client.get(location);
    for (name, value) in provider.headers() {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout(timeout)
        } else {
            FetchError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(FetchError::Status(status.as_u16()));
    }

    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout(timeout)
        } else {
            FetchError::Network(e.to_string())
        }
    })?;
    Ok(body.to_vec())
}

fn file_path(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path()
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

fn looks_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| FetchError::Network(format!("gzip decompression failed: {}", e)))?;
    Ok(decompressed)
}
