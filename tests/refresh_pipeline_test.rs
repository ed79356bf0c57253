//! End-to-end pipeline tests against a mock upstream: first refresh,
//! last-known-good on upstream failure, channel disappearance, the
//! credential-hiding relay, group decision flips and concurrent triggers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use m3undle::config::Config;
use m3undle::db::models::{NewProfile, NewProfileProvider, NewProvider, Profile, Provider};
use m3undle::db::schema::{fetch_runs, snapshots};
use m3undle::db::{catalog, create_test_pool, DbPool};
use m3undle::keys;
use m3undle::refresh::{EventBus, RefreshCoordinator, RefreshEvent, TriggerOutcome};
use m3undle::server::{routes::create_router, AppState};
use m3undle::snapshot::{self, load_channel_index, RefreshOutcome, RunHandle};

// =============================================================================
// Mock upstream
// =============================================================================

#[derive(Clone)]
struct Upstream {
    playlist: Arc<Mutex<String>>,
    fail: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    last_range: Arc<Mutex<Option<String>>>,
}

impl Upstream {
    fn new() -> Self {
        Self {
            playlist: Arc::new(Mutex::new(String::new())),
            fail: Arc::new(AtomicBool::new(false)),
            delay_ms: Arc::new(AtomicU64::new(0)),
            last_range: Arc::new(Mutex::new(None)),
        }
    }

    fn set_playlist(&self, body: &str) {
        *self.playlist.lock().unwrap() = body.to_string();
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn set_delay(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }
}

async fn upstream_playlist(State(upstream): State<Upstream>) -> impl IntoResponse {
    let delay = upstream.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if upstream.fail.load(Ordering::SeqCst) {
        return (StatusCode::BAD_GATEWAY, String::new()).into_response();
    }
    let body = upstream.playlist.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "application/x-mpegurl")], body).into_response()
}

async fn upstream_stream(
    Path(id): Path<String>,
    State(upstream): State<Upstream>,
    headers: HeaderMap,
) -> impl IntoResponse {
    *upstream.last_range.lock().unwrap() = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    (
        [(header::CONTENT_TYPE, "video/mp2t")],
        format!("TSBYTES-{id}"),
    )
        .into_response()
}

async fn spawn_upstream(upstream: Upstream) -> SocketAddr {
    let app = Router::new()
        .route("/playlist.m3u", get(upstream_playlist))
        .route("/s/{id}", get(upstream_stream))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// =============================================================================
// Fixture
// =============================================================================

struct Pipeline {
    pool: DbPool,
    config: Config,
    provider: Provider,
    profile: Profile,
    upstream: Upstream,
    upstream_addr: SocketAddr,
    app_addr: SocketAddr,
    _dir: tempfile::TempDir,
}

impl Pipeline {
    fn playlist_two_channels(&self) -> String {
        format!(
            "#EXTM3U\n\
             #EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://{addr}/s/1\n\
             #EXTINF:-1,Other\nhttp://{addr}/s/2\n",
            addr = self.upstream_addr
        )
    }

    async fn refresh(&self) -> RefreshOutcome {
        snapshot::full_refresh(&self.pool, &self.config, &RunHandle::new())
            .await
            .unwrap()
            .outcome
    }

    fn active_snapshot(&self) -> Option<m3undle::db::models::Snapshot> {
        let mut conn = self.pool.get().unwrap();
        catalog::active_snapshot(&mut conn, &self.profile.id).unwrap()
    }

    fn cnn_stream_key(&self) -> String {
        keys::stream_key(
            Some("cnn.us"),
            "CNN",
            &format!("http://{}/s/1", self.upstream_addr),
            "News",
            &self.profile.id,
        )
    }
}

async fn pipeline() -> Pipeline {
    let upstream = Upstream::new();
    let upstream_addr = spawn_upstream(upstream.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        snapshot_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    let pool = create_test_pool();
    let now = Utc::now();
    let (provider, profile) = {
        let mut conn = pool.get().unwrap();
        let provider = catalog::create_provider(
            &mut conn,
            NewProvider::new("p1", format!("http://{upstream_addr}/playlist.m3u"), now)
                .with_timeout_seconds(5),
        )
        .unwrap();
        let profile =
            catalog::create_profile(&mut conn, NewProfile::new("p1", "m3undle", now)).unwrap();
        catalog::link_profile_provider(
            &mut conn,
            NewProfileProvider::new(&profile.id, &provider.id, 0, now),
        )
        .unwrap();
        catalog::set_active_provider(&mut conn, &provider.id, now).unwrap();
        (provider, profile)
    };

    let state = AppState::new(pool.clone(), config.clone());
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let fixture = Pipeline {
        pool,
        config,
        provider,
        profile,
        upstream,
        upstream_addr,
        app_addr,
        _dir: dir,
    };
    fixture
        .upstream
        .set_playlist(&fixture.playlist_two_channels());
    fixture
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_first_refresh_publishes_two_channels() {
    let pipeline = pipeline().await;

    let outcome = pipeline.refresh().await;
    let RefreshOutcome::Completed {
        channels_published, ..
    } = outcome
    else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(channels_published, 2);

    let mut conn = pipeline.pool.get().unwrap();
    let run = catalog::latest_snapshot_run(&mut conn, &pipeline.provider.id)
        .unwrap()
        .unwrap();
    assert_eq!(run.status, "ok");
    assert_eq!(run.channel_count_seen, Some(2));
    assert!(run.playlist_bytes.unwrap() > 0);
    drop(conn);

    let snapshot = pipeline.active_snapshot().unwrap();
    assert_eq!(snapshot.channel_count_published, 2);

    let entries = load_channel_index(&snapshot.channel_index_path).unwrap();
    assert_eq!(entries.len(), 2);
    let cnn = entries.iter().find(|e| e.display_name == "CNN").unwrap();
    assert_eq!(cnn.stream_key, pipeline.cnn_stream_key());
    assert_eq!(cnn.group_title.as_deref(), Some("News"));
}

#[tokio::test]
async fn test_playlist_and_guide_endpoints_serve_the_lineup() {
    let pipeline = pipeline().await;
    pipeline.refresh().await;

    let addr = pipeline.app_addr;
    let response = reqwest::get(format!("http://{addr}/m3undle.m3u")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/x-mpegurl"));
    let body = response.text().await.unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains(",CNN\n"));
    assert!(body.contains(",Other\n"));
    assert!(body.contains(&format!("/stream/{}", pipeline.cnn_stream_key())));
    // The upstream URL never appears in the rendered playlist.
    assert!(!body.contains(&format!("http://{}/s/", pipeline.upstream_addr)));

    let guide = reqwest::get(format!("http://{addr}/m3undle.xml")).await.unwrap();
    assert_eq!(guide.status(), 200);
    assert!(guide
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/xml"));
    // No guide configured: the substituted empty document is served.
    assert!(guide.text().await.unwrap().contains("<tv>"));

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["lineups"][0]["activeProvider"]["name"], "p1");
    assert_eq!(
        status["lineups"][0]["activeSnapshot"]["channelCountPublished"],
        2
    );
    assert_eq!(status["lineups"][0]["lastRefresh"]["status"], "ok");
}

#[tokio::test]
async fn test_upstream_failure_preserves_last_known_good() {
    let pipeline = pipeline().await;
    pipeline.refresh().await;
    let first = pipeline.active_snapshot().unwrap();

    pipeline.upstream.set_fail(true);
    let outcome = pipeline.refresh().await;
    assert!(matches!(outcome, RefreshOutcome::Failed { .. }));

    // The failed run is recorded; the previous active snapshot still serves.
    let mut conn = pipeline.pool.get().unwrap();
    let run = catalog::latest_snapshot_run(&mut conn, &pipeline.provider.id)
        .unwrap()
        .unwrap();
    assert_eq!(run.status, "fail");
    assert!(run.error_summary.unwrap().contains("502"));
    drop(conn);

    let current = pipeline.active_snapshot().unwrap();
    assert_eq!(current.id, first.id);

    let addr = pipeline.app_addr;
    let body = reqwest::get(format!("http://{addr}/m3undle.m3u"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains(",CNN\n"));
    assert!(body.contains(",Other\n"));

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "degraded");
    assert_eq!(status["lineups"][0]["lastRefresh"]["status"], "fail");
}

#[tokio::test]
async fn test_channel_disappearance_and_reappearance_keeps_key() {
    let pipeline = pipeline().await;
    pipeline.refresh().await;
    let key = pipeline.cnn_stream_key();

    pipeline.upstream.set_playlist(&format!(
        "#EXTM3U\n#EXTINF:-1,Other\nhttp://{}/s/2\n",
        pipeline.upstream_addr
    ));
    let outcome = pipeline.refresh().await;
    let RefreshOutcome::Completed {
        channels_published, ..
    } = outcome
    else {
        panic!("expected completion");
    };
    assert_eq!(channels_published, 1);
    let snapshot = pipeline.active_snapshot().unwrap();
    let entries = load_channel_index(&snapshot.channel_index_path).unwrap();
    assert!(entries.iter().all(|e| e.stream_key != key));

    // Reappearance re-derives the same stream key.
    pipeline
        .upstream
        .set_playlist(&pipeline.playlist_two_channels());
    pipeline.refresh().await;
    let snapshot = pipeline.active_snapshot().unwrap();
    let entries = load_channel_index(&snapshot.channel_index_path).unwrap();
    assert!(entries.iter().any(|e| e.stream_key == key));
}

#[tokio::test]
async fn test_relay_proxies_upstream_without_redirect() {
    let pipeline = pipeline().await;
    pipeline.refresh().await;
    let key = pipeline.cnn_stream_key();
    let addr = pipeline.app_addr;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{addr}/stream/{key}"))
        .header("Range", "bytes=0-3")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(!response.status().is_redirection());
    assert_eq!(
        response.headers().get("content-type").unwrap().to_str().unwrap(),
        "video/mp2t"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"TSBYTES-1");

    // The client's Range header reached the upstream.
    assert_eq!(
        pipeline.upstream.last_range.lock().unwrap().as_deref(),
        Some("bytes=0-3")
    );

    let missing = client
        .get(format!("http://{addr}/stream/0000000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_include_flip_switches_to_strict_opt_in() {
    let pipeline = pipeline().await;
    pipeline.refresh().await;
    assert_eq!(pipeline.active_snapshot().unwrap().channel_count_published, 2);

    {
        let mut conn = pipeline.pool.get().unwrap();
        let news = catalog::group_by_name(&mut conn, &pipeline.provider.id, "News")
            .unwrap()
            .unwrap();
        catalog::set_group_decision(
            &mut conn,
            &pipeline.profile.id,
            &news.id,
            m3undle::db::models::FilterDecision::Include,
            Utc::now(),
        )
        .unwrap();
    }

    pipeline.refresh().await;
    let snapshot = pipeline.active_snapshot().unwrap();
    // With an explicit include in place, only the included group is emitted.
    assert_eq!(snapshot.channel_count_published, 1);
    let entries = load_channel_index(&snapshot.channel_index_path).unwrap();
    assert_eq!(entries[0].display_name, "CNN");
}

#[tokio::test]
async fn test_concurrent_triggers_run_exactly_once() {
    let pipeline = pipeline().await;
    pipeline.upstream.set_delay(500);

    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let coordinator = RefreshCoordinator::new(
        pipeline.pool.clone(),
        pipeline.config.clone(),
        bus,
        CancellationToken::new(),
    );
    coordinator.start();

    assert_eq!(coordinator.trigger_full(), TriggerOutcome::Accepted);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.trigger_full(), TriggerOutcome::Busy);
    assert!(coordinator.is_busy());

    // Wait for the single run to complete.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event before timeout")
            .unwrap();
        if let RefreshEvent::RefreshCompleted { succeeded, .. } = event {
            assert!(succeeded);
            break;
        }
    }

    let mut conn = pipeline.pool.get().unwrap();
    let runs: i64 = fetch_runs::table.count().get_result(&mut conn).unwrap();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn test_snapshot_rows_stay_bounded_by_retention() {
    let mut pipeline = pipeline().await;
    pipeline.config.snapshot_retention = 2;

    for _ in 0..4 {
        pipeline.refresh().await;
    }

    let mut conn = pipeline.pool.get().unwrap();
    let count: i64 = snapshots::table.count().get_result(&mut conn).unwrap();
    assert_eq!(count, 2);
    let active: i64 = snapshots::table
        .filter(snapshots::status.eq("active"))
        .count()
        .get_result(&mut conn)
        .unwrap();
    assert_eq!(active, 1);
}
