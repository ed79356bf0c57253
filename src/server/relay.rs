//! Stream relay: resolves an opaque stream key against the active snapshot
//! and proxies the upstream response to the client.
//!
//! The relay never redirects. Upstream URLs frequently embed credentials in
//! the path; a 302 with a Location header would leak them. Upstream
//! redirects are followed server-side instead, and any 3xx that still
//! surfaces is treated as an upstream failure.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::catalog;
use crate::snapshot::ChannelIndexEntry;

use super::state::AppState;

/// Connect timeout for the upstream GET. The body itself has no timeout;
/// live streams stay open for hours.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One active tune-in.
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub stream_key: String,
    pub client: String,
    pub started_at: Instant,
}

/// Tracks active relay sessions, purely for observability.
#[derive(Debug, Default)]
pub struct RelaySessions {
    active: DashMap<String, RelaySession>,
}

impl RelaySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, session: RelaySession) -> String {
        let id = Uuid::new_v4().to_string();
        self.active.insert(id.clone(), session);
        id
    }

    pub fn end(&self, session_id: &str) {
        if let Some((_, session)) = self.active.remove(session_id) {
            tracing::info!(
                stream_key = %session.stream_key,
                client = %session.client,
                elapsed_secs = session.started_at.elapsed().as_secs(),
                "relay session ended"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Stream relay endpoint handler.
///
/// Mirrors upstream status, `Content-Type` and `Content-Length`, forwards
/// the client's `Range` header, and copies the body until either side
/// closes. Client disconnect during the copy is a normal termination.
pub async fn stream_relay(
    Path(stream_key): Path<String>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    request_headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, [(header::HeaderName, HeaderValue); 1], String)> {
    let retry_after = [(header::RETRY_AFTER, HeaderValue::from_static("60"))];
    let no_retry = [(header::RETRY_AFTER, HeaderValue::from_static("0"))];

    let (entry, provider) = {
        let mut conn = state.get_connection().map_err(|e| {
            tracing::error!("relay database connection failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                no_retry.clone(),
                "internal error".to_string(),
            )
        })?;

        let actives = catalog::active_snapshots(&mut conn).map_err(|e| {
            tracing::error!("relay snapshot query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                no_retry.clone(),
                "internal error".to_string(),
            )
        })?;
        if actives.is_empty() {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                retry_after,
                "no active snapshot".to_string(),
            ));
        }

        let mut found: Option<ChannelIndexEntry> = None;
        for snapshot in &actives {
            match state.channel_index(&snapshot.id, &snapshot.channel_index_path) {
                Ok(entries) => {
                    if let Some(entry) = entries.iter().find(|e| e.stream_key == stream_key) {
                        found = Some(entry.clone());
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        snapshot = %snapshot.id,
                        "active channel index unreadable: {}",
                        err
                    );
                }
            }
        }
        let Some(entry) = found else {
            tracing::warn!(client = %client_addr, key = %stream_key, "stream key lookup failed");
            return Err((
                StatusCode::NOT_FOUND,
                no_retry,
                "unknown stream".to_string(),
            ));
        };

        let provider = catalog::active_provider(&mut conn).map_err(|e| {
            tracing::error!("relay provider query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                no_retry.clone(),
                "internal error".to_string(),
            )
        })?;
        (entry, provider)
    };

    // Upstream request: provider headers and user-agent forwarded, client
    // Range forwarded, redirects resolved server-side, unbounded body.
    let mut builder = reqwest::Client::builder()
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(5));
    if let Some(ua) = provider
        .as_ref()
        .and_then(|p| p.user_agent.clone())
        .filter(|s| !s.is_empty())
    {
        builder = builder.user_agent(ua);
    }
    let client = builder.build().map_err(|e| {
        tracing::error!("relay client build failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            no_retry.clone(),
            "internal error".to_string(),
        )
    })?;

    let mut request = client.get(&entry.stream_url);
    if let Some(provider) = &provider {
        for (name, value) in provider.headers() {
            request = request.header(name, value);
        }
    }
    if let Some(range) = request_headers.get(header::RANGE) {
        request = request.header(header::RANGE, range.clone());
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(key = %stream_key, "upstream connect failed: {}", err);
            return Err((
                StatusCode::BAD_GATEWAY,
                no_retry,
                "upstream unavailable".to_string(),
            ));
        }
    };

    let status = upstream.status();
    if status.is_redirection() {
        tracing::warn!(key = %stream_key, %status, "upstream still redirecting, refusing to mirror");
        return Err((
            StatusCode::BAD_GATEWAY,
            no_retry,
            "upstream unavailable".to_string(),
        ));
    }

    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let content_length = upstream.headers().get(header::CONTENT_LENGTH).cloned();

    let session_id = state.sessions().start(RelaySession {
        stream_key: stream_key.clone(),
        client: client_addr.to_string(),
        started_at: Instant::now(),
    });
    tracing::info!(
        key = %stream_key,
        client = %client_addr,
        active = state.sessions().active_count(),
        "relay session started"
    );

    let bytes_stream = upstream.bytes_stream().map(move |chunk| {
        chunk.map_err(|err| {
            // Mid-body upstream errors end the copy like a disconnect.
            tracing::info!("relay body ended: {}", err);
            std::io::Error::other(err)
        })
    });
    let body = Body::from_stream(SessionCleanupStream {
        inner: Box::pin(bytes_stream),
        session_id,
        sessions: state.sessions().clone(),
    });

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    if let Some(content_length) = content_length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, content_length);
    }
    Ok(response)
}

/// Stream wrapper that ends the relay session when dropped: client
/// disconnect, natural end of stream, or any error.
struct SessionCleanupStream<S> {
    inner: Pin<Box<S>>,
    session_id: String,
    sessions: Arc<RelaySessions>,
}

impl<S, T, E> Stream for SessionCleanupStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for SessionCleanupStream<S> {
    fn drop(&mut self) {
        self.sessions.end(&self.session_id);
    }
}
