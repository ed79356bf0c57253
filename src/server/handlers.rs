use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::db::catalog;
use crate::db::models::{Profile, Provider, RunStatus, Snapshot};
use crate::snapshot::ChannelIndexEntry;

use super::state::AppState;

/// Health check response structure.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Health check endpoint handler.
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
        }),
    )
}

/// Fallback handler for 404 responses.
pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Lineup file endpoint: `/{output}.m3u` renders the playlist and
/// `/{output}.xml` serves the guide verbatim.
pub async fn lineup_file(
    Path(filename): Path<String>,
    State(state): State<AppState>,
) -> axum::response::Response {
    if let Some(output_name) = filename.strip_suffix(".m3u") {
        return playlist_m3u(&state, output_name).await.into_response();
    }
    if let Some(output_name) = filename.strip_suffix(".xml") {
        return guide_xml(&state, output_name).await.into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

type HandlerError = (StatusCode, HeaderMap, String);

fn service_unavailable(message: &str) -> HandlerError {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    (
        StatusCode::SERVICE_UNAVAILABLE,
        headers,
        message.to_string(),
    )
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> HandlerError {
    tracing::error!("{}: {}", context, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        HeaderMap::new(),
        "internal error".to_string(),
    )
}

/// Resolve a profile's active snapshot, or the 404/503 that explains why
/// there is none.
fn resolve_active_snapshot(
    state: &AppState,
    output_name: &str,
) -> Result<(Profile, Snapshot), HandlerError> {
    let mut conn = state
        .get_connection()
        .map_err(|e| internal_error("lineup database connection failed", e))?;
    let profile = catalog::profile_by_output_name(&mut conn, output_name)
        .map_err(|e| internal_error("lineup profile query failed", e))?
        .ok_or((
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            "unknown lineup".to_string(),
        ))?;
    let snapshot = catalog::active_snapshot(&mut conn, &profile.id)
        .map_err(|e| internal_error("lineup snapshot query failed", e))?
        .ok_or_else(|| service_unavailable("no active snapshot"))?;
    Ok((profile, snapshot))
}

/// Playlist render endpoint.
///
/// Streams the lineup as extended M3U with an ETag derived from the content
/// hash, so idempotent clients can skip unchanged playlists.
async fn playlist_m3u(
    state: &AppState,
    output_name: &str,
) -> Result<(HeaderMap, String), HandlerError> {
    let (profile, snapshot) = resolve_active_snapshot(state, output_name)?;
    let entries = state
        .channel_index(&snapshot.id, &snapshot.channel_index_path)
        .map_err(|e| {
            tracing::error!(snapshot = %snapshot.id, "active channel index unreadable: {}", e);
            service_unavailable("lineup temporarily unavailable")
        })?;

    let body = render_playlist(&entries, &state.config().base_url, &profile.output_name);
    let etag = format!("\"{}\"", generate_etag(&body));

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-mpegurl; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok((headers, body))
}

/// Guide passthrough endpoint: the active snapshot's guide file verbatim.
async fn guide_xml(
    state: &AppState,
    output_name: &str,
) -> Result<(HeaderMap, Vec<u8>), HandlerError> {
    let (_, snapshot) = resolve_active_snapshot(state, output_name)?;
    let bytes = tokio::fs::read(&snapshot.guide_path).await.map_err(|e| {
        tracing::error!(snapshot = %snapshot.id, "active guide unreadable: {}", e);
        service_unavailable("guide temporarily unavailable")
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    Ok((headers, bytes))
}

/// Render the extended-M3U playlist body. UTF-8, LF line endings.
pub fn render_playlist(
    entries: &[ChannelIndexEntry],
    base_url: &str,
    output_name: &str,
) -> String {
    let guide_url = format!("{base_url}/{output_name}.xml");
    let estimated_size = 100 + entries.len() * 220;
    let mut out = String::with_capacity(estimated_size);

    out.push_str(&format!(
        "#EXTM3U url-tvg=\"{guide}\" x-tvg-url=\"{guide}\"\n",
        guide = escape_m3u_attribute(&guide_url)
    ));

    for entry in entries {
        out.push_str("#EXTINF:-1");
        if let Some(tvg_id) = &entry.tvg_id {
            out.push_str(&format!(" tvg-id=\"{}\"", escape_m3u_attribute(tvg_id)));
        }
        let tvg_name = entry.tvg_name.as_deref().unwrap_or(&entry.display_name);
        out.push_str(&format!(" tvg-name=\"{}\"", escape_m3u_attribute(tvg_name)));
        if let Some(logo) = &entry.logo_url {
            out.push_str(&format!(" tvg-logo=\"{}\"", escape_m3u_attribute(logo)));
        }
        if let Some(group) = &entry.group_title {
            out.push_str(&format!(
                " group-title=\"{}\"",
                escape_m3u_attribute(group)
            ));
        }
        if let Some(number) = entry.tvg_chno {
            out.push_str(&format!(" tvg-chno=\"{number}\""));
        }
        out.push_str(&format!(",{}\n", entry.display_name));
        out.push_str(&format!("{base_url}/stream/{}\n", entry.stream_key));
    }
    out
}

/// Escape special characters in M3U attribute values.
fn escape_m3u_attribute(value: &str) -> String {
    value
        .replace('\"', "&quot;")
        .replace('\n', " ")
        .replace('\r', "")
}

/// Generate ETag from content hash. Fast non-cryptographic hash; this is
/// cache validation, not security.
fn generate_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

// =============================================================================
// Status endpoint
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub lineups: Vec<LineupStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineupStatus {
    pub name: String,
    pub status: &'static str,
    pub active_provider: Option<ProviderRef>,
    pub active_snapshot: Option<SnapshotRef>,
    pub last_refresh: Option<RefreshRef>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    pub id: String,
    pub name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub id: String,
    pub profile_id: String,
    pub created_utc: String,
    pub channel_count_published: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRef {
    pub status: String,
    pub started_utc: String,
    pub finished_utc: Option<String>,
    pub channel_count_seen: Option<i32>,
    pub error_summary: Option<String>,
}

const STATUS_OK: &str = "ok";
const STATUS_DEGRADED: &str = "degraded";
const STATUS_NO_SNAPSHOT: &str = "no_active_snapshot";

fn severity(status: &str) -> u8 {
    match status {
        STATUS_NO_SNAPSHOT => 2,
        STATUS_DEGRADED => 1,
        _ => 0,
    }
}

/// Status endpoint handler: one entry per enabled profile, plus a worst-of
/// aggregate.
pub async fn status_json(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, HandlerError> {
    let mut conn = state
        .get_connection()
        .map_err(|e| internal_error("status database connection failed", e))?;

    let active_provider = catalog::active_provider(&mut conn)
        .map_err(|e| internal_error("status provider query failed", e))?;
    let profiles = catalog::enabled_profiles(&mut conn)
        .map_err(|e| internal_error("status profile query failed", e))?;

    let mut lineups = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let snapshot = catalog::active_snapshot(&mut conn, &profile.id)
            .map_err(|e| internal_error("status snapshot query failed", e))?;

        // The global active provider belongs to this lineup when this
        // profile is the one serving it.
        let provider: Option<&Provider> = match &active_provider {
            Some(provider) => {
                let serving = catalog::profile_for_provider(&mut conn, &provider.id)
                    .map_err(|e| internal_error("status association query failed", e))?;
                serving
                    .filter(|serving| serving.id == profile.id)
                    .map(|_| provider)
            }
            None => None,
        };

        let last_refresh = match provider {
            Some(provider) => catalog::latest_snapshot_run(&mut conn, &provider.id)
                .map_err(|e| internal_error("status fetch-run query failed", e))?,
            None => None,
        };

        let status = match (&snapshot, &last_refresh) {
            (None, _) => STATUS_NO_SNAPSHOT,
            (Some(_), Some(run)) if run.status == RunStatus::Fail.as_str() => STATUS_DEGRADED,
            _ => STATUS_OK,
        };

        lineups.push(LineupStatus {
            name: profile.output_name.clone(),
            status,
            active_provider: provider.map(|p| ProviderRef {
                id: p.id.clone(),
                name: p.name.clone(),
            }),
            active_snapshot: snapshot.map(|s| SnapshotRef {
                id: s.id,
                profile_id: s.profile_id,
                created_utc: s.created_at,
                channel_count_published: s.channel_count_published,
            }),
            last_refresh: last_refresh.map(|run| RefreshRef {
                status: run.status,
                started_utc: run.started_at,
                finished_utc: run.finished_at,
                channel_count_seen: run.channel_count_seen,
                error_summary: run.error_summary,
            }),
        });
    }

    let status = lineups
        .iter()
        .map(|l| l.status)
        .max_by_key(|s| severity(s))
        .unwrap_or(STATUS_NO_SNAPSHOT);

    Ok(Json(StatusResponse { status, lineups }))
}
