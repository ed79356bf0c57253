//! Refresh coordinator: the single background worker that owns the
//! fetch+reconcile+build cycle.
//!
//! At most one run is in flight at any time (a single-permit gate); triggers
//! collapse into a length-1 queue slot. External triggers are rejected while
//! the worker is busy; the internal schedule enqueues, and skips when a run
//! is already active. Each accepted run executes under the configured
//! per-run deadline and publishes start/completion events.

pub mod events;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub use events::{EventBus, RefreshEvent};

use crate::config::Config;
use crate::db::catalog::{self, DbError};
use crate::db::models::{NewFetchRun, RunType};
use crate::db::DbPool;
use crate::fetch::{self, FetchError};
use crate::snapshot::{self, RefreshOutcome, RunHandle, SnapshotError};

/// Which cycle a trigger requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    BuildOnly,
}

/// Result of an external trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    /// A run is in flight or queued; the caller should signal conflict.
    Busy,
}

#[derive(Debug)]
struct Inner {
    pool: DbPool,
    config: Config,
    /// Binary execution gate: one permit, one in-flight run.
    gate: Semaphore,
    /// Length-1 trigger queue with drop-oldest overflow.
    slot: Mutex<Option<RunKind>>,
    notify: Notify,
    events: EventBus,
    cancel: CancellationToken,
}

/// The background refresh worker. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(pool: DbPool, config: Config, events: EventBus, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                config,
                gate: Semaphore::new(1),
                slot: Mutex::new(None),
                notify: Notify::new(),
                events,
                cancel,
            }),
        }
    }

    /// Request a full refresh. Rejected while a run is in flight or queued.
    pub fn trigger_full(&self) -> TriggerOutcome {
        self.trigger(RunKind::Full)
    }

    /// Request a build-only cycle. Rejected while busy, like `trigger_full`.
    pub fn trigger_build_only(&self) -> TriggerOutcome {
        self.trigger(RunKind::BuildOnly)
    }

    fn trigger(&self, kind: RunKind) -> TriggerOutcome {
        let mut slot = self.inner.slot.lock().expect("slot lock");
        if self.inner.gate.available_permits() == 0 || slot.is_some() {
            return TriggerOutcome::Busy;
        }
        *slot = Some(kind);
        drop(slot);
        self.inner.notify.notify_one();
        TriggerOutcome::Accepted
    }

    /// Whether a run is in flight or queued.
    pub fn is_busy(&self) -> bool {
        self.inner.gate.available_permits() == 0
            || self.inner.slot.lock().expect("slot lock").is_some()
    }

    /// Internal enqueue: replaces any queued run (drop-oldest).
    fn enqueue(&self, kind: RunKind) {
        let mut slot = self.inner.slot.lock().expect("slot lock");
        if slot.replace(kind).is_some() {
            tracing::debug!("queued refresh replaced by a newer trigger");
        }
        drop(slot);
        self.inner.notify.notify_one();
    }

    fn take_queued(&self) -> Option<RunKind> {
        self.inner.slot.lock().expect("slot lock").take()
    }

    /// Spawn the runner loop and the schedule loop.
    pub fn start(&self) {
        let runner = self.clone();
        tokio::spawn(async move { runner.runner_loop().await });
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.schedule_loop().await });
    }

    async fn runner_loop(&self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = self.inner.notify.notified() => {}
            }
            while let Some(kind) = self.take_queued() {
                let Ok(permit) = self.inner.gate.acquire().await else {
                    return;
                };
                self.run_once(kind).await;
                drop(permit);
            }
        }
        tracing::info!("refresh runner stopped");
    }

    /// Sleep the startup delay, enqueue the initial refresh, then enqueue on
    /// the configured interval, skipping while a run is active.
    async fn schedule_loop(&self) {
        let cancel = &self.inner.cancel;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.inner.config.startup_delay) => {}
        }
        self.enqueue(RunKind::Full);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.refresh_interval) => {}
            }
            if self.inner.gate.available_permits() == 0 {
                tracing::info!("scheduled refresh skipped: a run is already active");
                continue;
            }
            self.enqueue(RunKind::Full);
        }
        tracing::info!("refresh schedule stopped");
    }

    async fn run_once(&self, kind: RunKind) {
        let inner = &self.inner;
        inner.events.publish(RefreshEvent::RefreshStarted { kind });

        let handle = RunHandle::new();
        let deadline = inner.config.refresh_timeout;
        let run = async {
            match kind {
                RunKind::Full => snapshot::full_refresh(&inner.pool, &inner.config, &handle).await,
                RunKind::BuildOnly => snapshot::build_only(&inner.pool, &inner.config).await,
            }
        };

        enum RunEnd {
            Finished(Result<snapshot::RefreshReport, SnapshotError>),
            TimedOut,
            Cancelled,
        }

        let end = tokio::select! {
            _ = inner.cancel.cancelled() => RunEnd::Cancelled,
            finished = tokio::time::timeout(deadline, run) => match finished {
                Ok(result) => RunEnd::Finished(result),
                Err(_) => RunEnd::TimedOut,
            },
        };

        let (succeeded, error_summary) = match end {
            RunEnd::Finished(Ok(report)) => match report.outcome {
                RefreshOutcome::Completed {
                    snapshot_id,
                    channels_published,
                } => {
                    tracing::info!(%snapshot_id, channels_published, "refresh completed");
                    (true, None)
                }
                RefreshOutcome::NoOp { reason } => {
                    tracing::info!("refresh skipped: {}", reason);
                    (true, None)
                }
                RefreshOutcome::Failed { error } => (false, Some(error)),
            },
            RunEnd::Finished(Err(err)) => {
                tracing::error!("refresh failed: {}", err);
                (false, Some(err.to_string()))
            }
            RunEnd::TimedOut => {
                let summary = format!("refresh timed out after {:?}", deadline);
                tracing::error!("{}", summary);
                self.persist_abandoned_run(&handle, &summary);
                (false, Some(summary))
            }
            RunEnd::Cancelled => {
                let summary = "refresh cancelled by shutdown".to_string();
                tracing::info!("{}", summary);
                self.persist_abandoned_run(&handle, &summary);
                (false, Some(summary))
            }
        };

        inner.events.publish(RefreshEvent::RefreshCompleted {
            succeeded,
            error_summary,
        });
    }

    /// A cancelled or timed-out run still persists its fetch run as failed,
    /// on a fresh, non-cancelled context.
    fn persist_abandoned_run(&self, handle: &RunHandle, summary: &str) {
        let Some(run_id) = handle.fetch_run_id() else {
            return;
        };
        match self.inner.pool.get() {
            Ok(mut conn) => {
                if let Err(err) =
                    catalog::mark_fetch_run_failed(&mut conn, run_id, summary, Utc::now())
                {
                    tracing::error!("failed to persist abandoned fetch run {}: {}", run_id, err);
                }
            }
            Err(err) => {
                tracing::error!("no connection to persist abandoned fetch run {}: {}", run_id, err)
            }
        }
    }
}

// =============================================================================
// Preview runs
// =============================================================================

/// Summary of a preview fetch: parsed and classified, never reconciled.
#[derive(Debug, Clone)]
pub struct PreviewSummary {
    pub fetch_run_id: String,
    pub channel_count: usize,
    pub group_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("provider {0} not found")]
    UnknownProvider(String),
}

/// Fetch and parse a provider's playlist without touching the catalog, for
/// the admin boundary to show an operator what it contains. Recorded as a
/// `preview` fetch run.
pub async fn preview_provider(
    pool: &DbPool,
    provider_id: &str,
) -> Result<PreviewSummary, PreviewError> {
    use diesel::prelude::*;

    use crate::db::schema::{fetch_runs, providers};

    let provider = {
        let mut conn = pool.get().map_err(DbError::from)?;
        providers::table
            .find(provider_id)
            .first::<crate::db::models::Provider>(&mut conn)
            .optional()
            .map_err(DbError::from)?
            .ok_or_else(|| PreviewError::UnknownProvider(provider_id.to_string()))?
    };

    let run = NewFetchRun::running(&provider.id, RunType::Preview, Utc::now());
    {
        let mut conn = pool.get().map_err(DbError::from)?;
        diesel::insert_into(fetch_runs::table)
            .values(&run)
            .execute(&mut conn)
            .map_err(DbError::from)?;
    }

    match fetch::fetch_playlist(&provider).await {
        Ok(playlist) => {
            let mut groups: Vec<&str> = playlist
                .entries
                .iter()
                .map(|e| e.group_title.trim())
                .filter(|g| !g.is_empty())
                .collect();
            groups.sort_unstable();
            groups.dedup();

            let mut conn = pool.get().map_err(DbError::from)?;
            catalog::mark_fetch_run_ok(
                &mut conn,
                &run.id,
                playlist.bytes as i64,
                0,
                playlist.entries.len() as i32,
                Utc::now(),
            )?;
            Ok(PreviewSummary {
                fetch_run_id: run.id,
                channel_count: playlist.entries.len(),
                group_count: groups.len(),
            })
        }
        Err(err) => {
            let mut conn = pool.get().map_err(DbError::from)?;
            catalog::mark_fetch_run_failed(&mut conn, &run.id, &err.to_string(), Utc::now())?;
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog::create_provider;
    use crate::db::connection::create_test_pool;
    use crate::db::models::NewProvider;
    use diesel::prelude::*;

    fn coordinator(pool: DbPool) -> RefreshCoordinator {
        RefreshCoordinator::new(
            pool,
            Config::default(),
            EventBus::new(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_trigger_collapses_to_one_queued_run() {
        let coordinator = coordinator(create_test_pool());
        // No runner started: the first trigger occupies the queue slot.
        assert_eq!(coordinator.trigger_full(), TriggerOutcome::Accepted);
        assert_eq!(coordinator.trigger_full(), TriggerOutcome::Busy);
        assert_eq!(coordinator.trigger_build_only(), TriggerOutcome::Busy);
        assert!(coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_internal_enqueue_replaces_queued_run() {
        let coordinator = coordinator(create_test_pool());
        coordinator.enqueue(RunKind::Full);
        coordinator.enqueue(RunKind::BuildOnly);
        assert_eq!(coordinator.take_queued(), Some(RunKind::BuildOnly));
        assert_eq!(coordinator.take_queued(), None);
    }

    #[tokio::test]
    async fn test_started_runner_drains_trigger_and_publishes_events() {
        let pool = create_test_pool();
        let bus = EventBus::new();
        let coordinator = RefreshCoordinator::new(
            pool,
            Config::default(),
            bus.clone(),
            CancellationToken::new(),
        );
        let mut rx = bus.subscribe();
        coordinator.start();

        assert_eq!(coordinator.trigger_full(), TriggerOutcome::Accepted);

        // Empty catalog: the run no-ops, which still counts as a success.
        let started = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("started event")
            .unwrap();
        assert!(matches!(started, RefreshEvent::RefreshStarted { .. }));
        let completed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completed event")
            .unwrap();
        match completed {
            RefreshEvent::RefreshCompleted { succeeded, .. } => assert!(succeeded),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_coordinator_stops_runner() {
        let cancel = CancellationToken::new();
        let coordinator = RefreshCoordinator::new(
            create_test_pool(),
            Config::default(),
            EventBus::new(),
            cancel.clone(),
        );
        coordinator.start();
        cancel.cancel();
        // Triggers still collapse; nothing panics after cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = coordinator.trigger_full();
    }

    #[tokio::test]
    async fn test_preview_records_run_without_touching_catalog() {
        let pool = create_test_pool();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.m3u");
        std::fs::write(
            &path,
            "#EXTM3U\n#EXTINF:-1 group-title=\"News\",CNN\nhttp://x/s/1\n",
        )
        .unwrap();
        let url = url::Url::from_file_path(&path).unwrap();

        let provider = {
            let mut conn = pool.get().unwrap();
            create_provider(&mut conn, NewProvider::new("p1", url.as_str(), Utc::now())).unwrap()
        };

        let summary = preview_provider(&pool, &provider.id).await.unwrap();
        assert_eq!(summary.channel_count, 1);
        assert_eq!(summary.group_count, 1);

        let mut conn = pool.get().unwrap();
        let (run_type, status): (String, String) = crate::db::schema::fetch_runs::table
            .find(&summary.fetch_run_id)
            .select((
                crate::db::schema::fetch_runs::run_type,
                crate::db::schema::fetch_runs::status,
            ))
            .first(&mut conn)
            .unwrap();
        assert_eq!(run_type, "preview");
        assert_eq!(status, "ok");

        let channels: i64 = crate::db::schema::provider_channels::table
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(channels, 0);
    }

    #[tokio::test]
    async fn test_preview_unknown_provider() {
        let pool = create_test_pool();
        let err = preview_provider(&pool, "missing").await.unwrap_err();
        assert!(matches!(err, PreviewError::UnknownProvider(_)));
    }
}
