//! Snapshot builder: assembles the published lineup, writes immutable
//! artifact files, promotes the staged snapshot to active and sweeps old
//! snapshots past the retention count.
//!
//! Two entry points: [`full_refresh`] (fetch, reconcile, build) and
//! [`build_only`] (rebuild from the current catalog, reusing the previous
//! active snapshot's guide). A failed fetch never touches the previous
//! active snapshot; that is the last-known-good contract.

pub mod assemble;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use thiserror::Error;

pub use assemble::{assemble, ChannelIndexEntry, GroupFilterRow};

use crate::config::Config;
use crate::db::catalog::{
    self, active_snapshot, mark_fetch_run_failed, mark_fetch_run_ok, DbError,
};
use crate::db::models::{
    new_id, format_ts, NewFetchRun, NewSnapshot, Profile, ProfileGroupChannelFilter, Provider,
    ProviderChannel, RunType, Snapshot, SnapshotStatus,
};
use crate::db::schema::{
    profile_group_channel_filters, profile_group_filters, provider_channels, provider_groups,
    snapshots,
};
use crate::db::{DbPool, DbPooledConnection};
use crate::fetch::{self, EMPTY_GUIDE};
use crate::playlist::ContentKind;
use crate::reconcile::reconcile;

/// Builder errors. Fetch and parse failures are reported through
/// [`RefreshOutcome::Failed`] instead; these are internal faults.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How one refresh cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed {
        snapshot_id: String,
        channels_published: usize,
    },
    Failed {
        error: String,
    },
    /// Nothing to do: no active provider or no serving profile.
    NoOp {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub outcome: RefreshOutcome,
    pub fetch_run_id: Option<String>,
}

/// Shares the in-flight fetch-run id with the caller, so a cancelled run can
/// still be persisted as failed from a fresh context.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    fetch_run_id: Arc<OnceLock<String>>,
}

impl RunHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: &str) {
        let _ = self.fetch_run_id.set(id.to_string());
    }

    pub fn fetch_run_id(&self) -> Option<&str> {
        self.fetch_run_id.get().map(String::as_str)
    }
}

/// Full refresh: fetch, reconcile, build, promote.
pub async fn full_refresh(
    pool: &DbPool,
    config: &Config,
    handle: &RunHandle,
) -> Result<RefreshReport, SnapshotError> {
    let Some((provider, profile)) = select_inputs(pool)? else {
        return Ok(RefreshReport {
            outcome: RefreshOutcome::NoOp {
                reason: "no active provider with a serving profile".to_string(),
            },
            fetch_run_id: None,
        });
    };

    let run_id = {
        let mut conn = pool.get().map_err(DbError::from)?;
        let run = NewFetchRun::running(&provider.id, RunType::Snapshot, Utc::now());
        diesel::insert_into(crate::db::schema::fetch_runs::table)
            .values(&run)
            .execute(&mut conn)
            .map_err(DbError::from)?;
        run.id
    };
    handle.record(&run_id);

    // Playlist fetch failure is fatal for this run; the previous active
    // snapshot keeps serving.
    let playlist = match fetch::fetch_playlist(&provider).await {
        Ok(playlist) => playlist,
        Err(err) => {
            let summary = err.to_string();
            tracing::error!(provider = %provider.name, "playlist fetch failed: {}", summary);
            let mut conn = pool.get().map_err(DbError::from)?;
            mark_fetch_run_failed(&mut conn, &run_id, &summary, Utc::now())?;
            return Ok(RefreshReport {
                outcome: RefreshOutcome::Failed { error: summary },
                fetch_run_id: Some(run_id),
            });
        }
    };

    // Guide failure is recovered locally with an empty document.
    let guide_bytes = match fetch::fetch_guide(&provider).await {
        Ok(Some(guide)) => guide.bytes,
        Ok(None) => EMPTY_GUIDE.as_bytes().to_vec(),
        Err(err) => {
            tracing::warn!(
                provider = %provider.name,
                "guide fetch failed, substituting empty guide: {}",
                err
            );
            EMPTY_GUIDE.as_bytes().to_vec()
        }
    };

    let channel_count_seen = playlist.entries.len();
    let built = {
        let mut conn = pool.get().map_err(DbError::from)?;
        reconcile(
            &mut conn,
            &provider.id,
            &profile.id,
            &run_id,
            &playlist.entries,
            Utc::now(),
        )?;
        build_and_promote(&mut conn, config, &provider, &profile, &guide_bytes)
    };

    match built {
        Ok(snapshot) => {
            let mut conn = pool.get().map_err(DbError::from)?;
            mark_fetch_run_ok(
                &mut conn,
                &run_id,
                playlist.bytes as i64,
                guide_bytes.len() as i64,
                channel_count_seen as i32,
                Utc::now(),
            )?;
            Ok(RefreshReport {
                outcome: RefreshOutcome::Completed {
                    channels_published: snapshot.channel_count_published as usize,
                    snapshot_id: snapshot.id,
                },
                fetch_run_id: Some(run_id),
            })
        }
        Err(err) => {
            let summary = err.to_string();
            if let Ok(mut conn) = pool.get() {
                let _ = mark_fetch_run_failed(&mut conn, &run_id, &summary, Utc::now());
            }
            Err(err)
        }
    }
}

/// Build-only: rebuild from the current catalog, reusing the previous active
/// snapshot's guide document.
pub async fn build_only(pool: &DbPool, config: &Config) -> Result<RefreshReport, SnapshotError> {
    let Some((provider, profile)) = select_inputs(pool)? else {
        return Ok(RefreshReport {
            outcome: RefreshOutcome::NoOp {
                reason: "no active provider with a serving profile".to_string(),
            },
            fetch_run_id: None,
        });
    };

    let mut conn = pool.get().map_err(DbError::from)?;
    let guide_bytes = match active_snapshot(&mut conn, &profile.id)? {
        Some(prior) => std::fs::read(&prior.guide_path).unwrap_or_else(|err| {
            tracing::warn!(
                "previous guide at {} unreadable ({}), substituting empty guide",
                prior.guide_path,
                err
            );
            EMPTY_GUIDE.as_bytes().to_vec()
        }),
        None => EMPTY_GUIDE.as_bytes().to_vec(),
    };

    let snapshot = build_and_promote(&mut conn, config, &provider, &profile, &guide_bytes)?;
    Ok(RefreshReport {
        outcome: RefreshOutcome::Completed {
            channels_published: snapshot.channel_count_published as usize,
            snapshot_id: snapshot.id,
        },
        fetch_run_id: None,
    })
}

/// Pick the unique active+enabled provider and its serving profile.
fn select_inputs(pool: &DbPool) -> Result<Option<(Provider, Profile)>, SnapshotError> {
    let mut conn = pool.get().map_err(DbError::from)?;
    let Some(provider) = catalog::active_provider(&mut conn)? else {
        return Ok(None);
    };
    if !provider.is_enabled() {
        return Ok(None);
    }
    let Some(profile) = catalog::profile_for_provider(&mut conn, &provider.id)? else {
        return Ok(None);
    };
    Ok(Some((provider, profile)))
}

/// Assemble from the catalog, write artifacts, stage, promote, sweep.
pub fn build_and_promote(
    conn: &mut DbPooledConnection,
    config: &Config,
    provider: &Provider,
    profile: &Profile,
    guide_bytes: &[u8],
) -> Result<Snapshot, SnapshotError> {
    let (channels, filters, overrides) = load_assembly_inputs(conn, provider, profile)?;
    let entries = assemble(&channels, &filters, &overrides, &profile.id);

    let snapshot_id = new_id();
    let dir = config
        .snapshot_dir
        .join(&profile.output_name)
        .join(&snapshot_id);
    std::fs::create_dir_all(&dir)?;

    let index_path = dir.join("channel_index.json");
    let guide_path = dir.join("guide.xml");
    let mut index_json = serde_json::to_string_pretty(&entries)?;
    index_json.push('\n');
    // Files land on disk before the row can ever transition to active.
    std::fs::write(&index_path, index_json)?;
    std::fs::write(&guide_path, guide_bytes)?;

    let row = NewSnapshot {
        id: snapshot_id.clone(),
        profile_id: profile.id.clone(),
        status: SnapshotStatus::Staged.as_str().to_string(),
        created_at: format_ts(Utc::now()),
        channel_index_path: index_path.to_string_lossy().to_string(),
        guide_path: guide_path.to_string_lossy().to_string(),
        channel_count_published: entries.len() as i32,
        error_summary: None,
    };
    diesel::insert_into(snapshots::table)
        .values(&row)
        .execute(conn)
        .map_err(DbError::from)?;

    promote(conn, &profile.id, &snapshot_id)?;
    sweep_retention(conn, &profile.id, config.snapshot_retention)?;

    tracing::info!(
        profile = %profile.output_name,
        snapshot = %snapshot_id,
        channels = entries.len(),
        "snapshot promoted"
    );

    Ok(snapshots::table
        .find(&snapshot_id)
        .first(conn)
        .map_err(DbError::from)?)
}

/// Atomic promotion: archive any prior active snapshot of the profile and
/// activate the staged one in a single transaction. No reader ever observes
/// zero or two active snapshots.
fn promote(
    conn: &mut DbPooledConnection,
    profile_id: &str,
    snapshot_id: &str,
) -> Result<(), DbError> {
    conn.transaction::<_, DieselError, _>(|conn| {
        diesel::update(
            snapshots::table
                .filter(snapshots::profile_id.eq(profile_id))
                .filter(snapshots::status.eq(SnapshotStatus::Active.as_str())),
        )
        .set(snapshots::status.eq(SnapshotStatus::Archived.as_str()))
        .execute(conn)?;
        diesel::update(snapshots::table.find(snapshot_id))
            .set(snapshots::status.eq(SnapshotStatus::Active.as_str()))
            .execute(conn)?;
        Ok(())
    })
    .map_err(DbError::from)
}

/// Delete snapshots beyond the retention count, newest first retained.
///
/// The active snapshot is never deleted. Directory removal is best-effort;
/// the row goes away regardless.
fn sweep_retention(
    conn: &mut DbPooledConnection,
    profile_id: &str,
    retain: usize,
) -> Result<(), DbError> {
    let all: Vec<Snapshot> = snapshots::table
        .filter(snapshots::profile_id.eq(profile_id))
        .order((snapshots::created_at.desc(), snapshots::id.desc()))
        .load(conn)?;

    for snapshot in all.into_iter().skip(retain) {
        if snapshot.status == SnapshotStatus::Active.as_str() {
            continue;
        }
        if let Some(dir) = snapshot_dir(&snapshot) {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "failed to remove snapshot directory {}: {}",
                        dir.display(),
                        err
                    );
                }
            }
        }
        diesel::delete(snapshots::table.find(&snapshot.id)).execute(conn)?;
        tracing::debug!(snapshot = %snapshot.id, "snapshot swept by retention");
    }
    Ok(())
}

fn snapshot_dir(snapshot: &Snapshot) -> Option<PathBuf> {
    Path::new(&snapshot.channel_index_path)
        .parent()
        .map(Path::to_path_buf)
}

/// Read and parse a snapshot's channel index file.
pub fn load_channel_index(path: &str) -> Result<Vec<ChannelIndexEntry>, SnapshotError> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Load the assembly inputs for one provider/profile pair: active channels
/// passing the provider content gates, group filters joined to raw names,
/// and select-mode channel overrides.
fn load_assembly_inputs(
    conn: &mut DbPooledConnection,
    provider: &Provider,
    profile: &Profile,
) -> Result<(Vec<ProviderChannel>, Vec<GroupFilterRow>, HashMap<String, ProfileGroupChannelFilter>), DbError> {
    let all: Vec<ProviderChannel> = provider_channels::table
        .filter(provider_channels::provider_id.eq(&provider.id))
        .filter(provider_channels::active.eq(1))
        .order(provider_channels::id.asc())
        .load(conn)?;
    let channels: Vec<ProviderChannel> = all
        .into_iter()
        .filter(|c| match ContentKind::parse(&c.content_type) {
            Some(ContentKind::Vod) => provider.includes_vod(),
            Some(ContentKind::Series) => provider.includes_series(),
            _ => true,
        })
        .collect();

    let filters: Vec<GroupFilterRow> = profile_group_filters::table
        .inner_join(provider_groups::table)
        .filter(profile_group_filters::profile_id.eq(&profile.id))
        .filter(provider_groups::provider_id.eq(&provider.id))
        .select((
            crate::db::models::ProfileGroupFilter::as_select(),
            provider_groups::name,
        ))
        .load::<(crate::db::models::ProfileGroupFilter, String)>(conn)?
        .into_iter()
        .map(|(filter, group_name)| GroupFilterRow { filter, group_name })
        .collect();

    let filter_ids: Vec<&str> = filters.iter().map(|row| row.filter.id.as_str()).collect();
    let overrides: HashMap<String, ProfileGroupChannelFilter> = profile_group_channel_filters::table
        .filter(profile_group_channel_filters::filter_id.eq_any(filter_ids))
        .load::<ProfileGroupChannelFilter>(conn)?
        .into_iter()
        .map(|row| (row.provider_channel_id.clone(), row))
        .collect();

    Ok((channels, filters, overrides))
}
