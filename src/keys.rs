//! Stable identity hashing for channels and client-facing stream keys.
//!
//! Both key kinds are SHA-256 truncated to 128 bits and rendered as 16
//! characters of unpadded base64url. The collision space is large enough at
//! catalog scale that the hash is not keyed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Unit separator used between identity components.
pub const US: char = '\u{1F}';

/// Hash an identity string down to a 16-character base64url token.
pub fn hash16(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(16);
    encoded
}

/// Build the stable identity string for a parsed playlist entry.
///
/// The base is the `tvg-id` when present, otherwise `displayName US streamUrl`.
/// The stream URL, group title and display name are appended so that entries
/// sharing a `tvg-id` across groups stay distinct. `occurrence` is the 1-based
/// count of this exact identity within one fetch; the Nth (N >= 2) occurrence
/// gets a `dup:N` suffix so exact-duplicate playlist lines survive.
pub fn stable_identity(
    tvg_id: Option<&str>,
    display_name: &str,
    stream_url: &str,
    group_title: &str,
    occurrence: u32,
) -> String {
    let mut identity = match tvg_id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => format!("{display_name}{US}{stream_url}"),
    };
    identity.push(US);
    identity.push_str(stream_url);
    identity.push(US);
    identity.push_str(group_title);
    identity.push(US);
    identity.push_str(display_name);
    if occurrence >= 2 {
        identity.push(US);
        identity.push_str(&format!("dup:{occurrence}"));
    }
    identity
}

/// Derive the catalog stable key for a channel identity.
pub fn stable_key(identity: &str) -> String {
    hash16(identity)
}

/// Derive the opaque client-facing stream key for an emitted channel.
///
/// `channel_key` is the channel's `tvg-id` when present. The key is a pure
/// function of (identity fields, profile id) and therefore survives
/// refreshes, snapshot archival and provider reactivation.
pub fn stream_key(
    channel_key: Option<&str>,
    display_name: &str,
    stream_url: &str,
    output_group: &str,
    profile_id: &str,
) -> String {
    let identity = match channel_key {
        Some(key) if !key.trim().is_empty() => {
            format!("{key}{US}{stream_url}{US}{output_group}{US}{display_name}")
        }
        _ => format!("{display_name}{US}{stream_url}{US}{output_group}"),
    };
    hash16(&format!("{identity}:{profile_id}"))
}
