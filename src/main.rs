use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use m3undle::config::Config;
use m3undle::db::{self, catalog, DbPool};
use m3undle::db::models::{NewProfile, NewProfileProvider, NewProvider};
use m3undle::refresh::{EventBus, RefreshCoordinator, RefreshEvent};
use m3undle::server::{self, AppState};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("m3undle=info,tower_http=warn")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.database_path.display(),
        snapshots = %config.snapshot_dir.display(),
        bind = %config.bind_addr,
        "starting m3undle"
    );

    // Database unreachable at startup is fatal.
    let database_url = match db::database_url_from_path(&config.database_path) {
        Ok(url) => url,
        Err(err) => {
            eprintln!("Cannot prepare database directory: {err}");
            std::process::exit(1);
        }
    };
    let pool = match db::create_pool(&database_url) {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("Failed to create database pool: {err}");
            std::process::exit(1);
        }
    };
    {
        let mut conn = match pool.get() {
            Ok(conn) => conn,
            Err(err) => {
                eprintln!("Failed to connect to database: {err}");
                std::process::exit(1);
            }
        };
        if let Err(err) = db::run_migrations(&mut conn) {
            eprintln!("Failed to run migrations: {err}");
            std::process::exit(1);
        }
    }

    if let Err(err) = bootstrap_from_env(&pool) {
        tracing::error!("bootstrap failed: {}", err);
    }

    let cancel = CancellationToken::new();
    let events = EventBus::new();
    spawn_event_logger(&events);

    let coordinator =
        RefreshCoordinator::new(pool.clone(), config.clone(), events, cancel.clone());
    coordinator.start();

    let state = AppState::new(pool, config);
    let server = tokio::spawn(server::start_server(state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = server => {
            match result {
                Ok(Ok(())) => tracing::info!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!("HTTP server error: {}", err),
                Err(err) => tracing::error!("HTTP server task panicked: {}", err),
            }
        }
    }
    cancel.cancel();
}

/// Log refresh lifecycle events from the process-local bus.
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(RefreshEvent::RefreshStarted { kind }) => {
                    tracing::info!(?kind, "refresh started");
                }
                Ok(RefreshEvent::RefreshCompleted {
                    succeeded,
                    error_summary,
                }) => {
                    if succeeded {
                        tracing::info!("refresh completed");
                    } else {
                        tracing::warn!(error = ?error_summary, "refresh failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Seed a first provider and profile from the environment on an empty
/// catalog, so a fresh install converges to a served lineup without an
/// admin round-trip.
fn bootstrap_from_env(pool: &DbPool) -> Result<(), catalog::DbError> {
    use diesel::prelude::*;

    use m3undle::db::schema::providers;

    let (Ok(name), Ok(playlist_url)) = (
        std::env::var("M3UNDLE_BOOTSTRAP_NAME"),
        std::env::var("M3UNDLE_BOOTSTRAP_PLAYLIST_URL"),
    ) else {
        return Ok(());
    };
    if name.trim().is_empty() || playlist_url.trim().is_empty() {
        return Ok(());
    }

    let mut conn = pool.get()?;
    let existing: i64 = providers::table
        .count()
        .get_result(&mut conn)
        .map_err(catalog::DbError::from)?;
    if existing > 0 {
        return Ok(());
    }

    let now = Utc::now();
    let mut new_provider = NewProvider::new(&name, &playlist_url, now);
    if let Ok(guide_url) = std::env::var("M3UNDLE_BOOTSTRAP_GUIDE_URL") {
        if !guide_url.trim().is_empty() {
            new_provider = new_provider.with_guide_url(guide_url);
        }
    }
    let provider = catalog::create_provider(&mut conn, new_provider)?;

    let output_name = std::env::var("M3UNDLE_BOOTSTRAP_OUTPUT")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| name.clone());
    let profile = catalog::create_profile(&mut conn, NewProfile::new(&name, &output_name, now))?;
    catalog::link_profile_provider(
        &mut conn,
        NewProfileProvider::new(&profile.id, &provider.id, 0, now),
    )?;
    catalog::set_active_provider(&mut conn, &provider.id, now)?;

    tracing::info!(provider = %name, output = %output_name, "bootstrapped initial catalog");
    Ok(())
}
