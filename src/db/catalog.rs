//! Catalog access helpers.
//!
//! The write helpers here are the interface the external admin boundary
//! consumes (create providers and profiles, set filter decisions, activate a
//! provider); the read helpers are shared by the refresh pipeline and the
//! client endpoints. Refresh-scoped tables (groups, channels, fetch runs,
//! snapshots) are written only by the reconciler and snapshot builder.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use crate::db::models::{
    format_ts, ChannelMode, FetchRun, FilterDecision, NewProfile, NewProfileGroupChannelFilter,
    NewProfileProvider, NewProvider, Profile, ProfileGroupFilter, Provider, ProviderChannel,
    ProviderGroup, RunStatus, Snapshot, SnapshotStatus,
};
use crate::db::schema::{
    fetch_runs, profile_group_channel_filters, profile_group_filters, profile_providers,
    profiles, provider_channels, provider_groups, providers, snapshots,
};
use crate::db::DbPooledConnection;

/// Catalog access errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Unique-constraint violation, surfaced to the admin boundary as 409.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Query(diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl From<DieselError> for DbError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DbError::Conflict(info.message().to_string())
            }
            DieselError::NotFound => DbError::NotFound("row not found".to_string()),
            other => DbError::Query(other),
        }
    }
}

fn is_transient(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
            if info.message().contains("locked") || info.message().contains("busy")
    )
}

/// Run a write closure, retrying once on transient SQLite contention.
pub fn with_retry<T>(
    conn: &mut DbPooledConnection,
    mut op: impl FnMut(&mut DbPooledConnection) -> Result<T, DieselError>,
) -> Result<T, DbError> {
    match op(conn) {
        Ok(value) => Ok(value),
        Err(err) if is_transient(&err) => {
            tracing::warn!("retrying catalog write after transient contention: {}", err);
            op(conn).map_err(DbError::from)
        }
        Err(err) => Err(err.into()),
    }
}

// =============================================================================
// Providers and profiles
// =============================================================================

pub fn create_provider(
    conn: &mut DbPooledConnection,
    new: NewProvider,
) -> Result<Provider, DbError> {
    diesel::insert_into(providers::table)
        .values(&new)
        .execute(conn)?;
    Ok(providers::table.find(new.id).first(conn)?)
}

pub fn create_profile(conn: &mut DbPooledConnection, new: NewProfile) -> Result<Profile, DbError> {
    diesel::insert_into(profiles::table)
        .values(&new)
        .execute(conn)?;
    Ok(profiles::table.find(new.id).first(conn)?)
}

pub fn link_profile_provider(
    conn: &mut DbPooledConnection,
    new: NewProfileProvider,
) -> Result<(), DbError> {
    diesel::insert_into(profile_providers::table)
        .values(&new)
        .execute(conn)?;
    Ok(())
}

/// Make `provider_id` the single active provider.
///
/// The partial unique index on `is_active = 1` is evaluated per statement,
/// so this is an intentional two-write sequence: clear any other active row
/// first, then set the target. Retries once on transient contention.
pub fn set_active_provider(
    conn: &mut DbPooledConnection,
    provider_id: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let ts = format_ts(now);
    with_retry(conn, |conn| {
        diesel::update(providers::table.filter(providers::is_active.eq(1)))
            .set((providers::is_active.eq(0), providers::updated_at.eq(&ts)))
            .execute(conn)
    })?;
    let updated = with_retry(conn, |conn| {
        diesel::update(providers::table.find(provider_id))
            .set((providers::is_active.eq(1), providers::updated_at.eq(&ts)))
            .execute(conn)
    })?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("provider {provider_id}")));
    }
    Ok(())
}

/// The active provider, if any.
pub fn active_provider(conn: &mut DbPooledConnection) -> Result<Option<Provider>, DbError> {
    Ok(providers::table
        .filter(providers::is_active.eq(1))
        .first(conn)
        .optional()?)
}

/// Pick the profile serving a provider: enabled association with the lowest
/// priority, joined to an enabled profile.
pub fn profile_for_provider(
    conn: &mut DbPooledConnection,
    provider_id: &str,
) -> Result<Option<Profile>, DbError> {
    Ok(profile_providers::table
        .inner_join(profiles::table)
        .filter(profile_providers::provider_id.eq(provider_id))
        .filter(profile_providers::enabled.eq(1))
        .filter(profiles::enabled.eq(1))
        .order(profile_providers::priority.asc())
        .select(Profile::as_select())
        .first(conn)
        .optional()?)
}

pub fn enabled_profiles(conn: &mut DbPooledConnection) -> Result<Vec<Profile>, DbError> {
    Ok(profiles::table
        .filter(profiles::enabled.eq(1))
        .order(profiles::name.asc())
        .load(conn)?)
}

pub fn profile_by_output_name(
    conn: &mut DbPooledConnection,
    output_name: &str,
) -> Result<Option<Profile>, DbError> {
    Ok(profiles::table
        .filter(profiles::output_name.eq(output_name))
        .filter(profiles::enabled.eq(1))
        .first(conn)
        .optional()?)
}

// =============================================================================
// Filters
// =============================================================================

pub fn group_by_name(
    conn: &mut DbPooledConnection,
    provider_id: &str,
    name: &str,
) -> Result<Option<ProviderGroup>, DbError> {
    Ok(provider_groups::table
        .filter(provider_groups::provider_id.eq(provider_id))
        .filter(provider_groups::name.eq(name))
        .first(conn)
        .optional()?)
}

/// Set the operator decision on a group filter.
pub fn set_group_decision(
    conn: &mut DbPooledConnection,
    profile_id: &str,
    provider_group_id: &str,
    decision: FilterDecision,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let updated = diesel::update(
        profile_group_filters::table
            .filter(profile_group_filters::profile_id.eq(profile_id))
            .filter(profile_group_filters::provider_group_id.eq(provider_group_id)),
    )
    .set((
        profile_group_filters::decision.eq(decision.as_str()),
        profile_group_filters::updated_at.eq(format_ts(now)),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(DbError::NotFound(format!(
            "filter for group {provider_group_id} under profile {profile_id}"
        )));
    }
    Ok(())
}

/// Update a filter's output shaping (mode, rename, auto numbering).
pub fn set_filter_output(
    conn: &mut DbPooledConnection,
    filter_id: &str,
    channel_mode: ChannelMode,
    output_name: Option<&str>,
    auto_num: Option<(i32, i32)>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let updated = diesel::update(profile_group_filters::table.find(filter_id))
        .set((
            profile_group_filters::channel_mode.eq(channel_mode.as_str()),
            profile_group_filters::output_name.eq(output_name),
            profile_group_filters::auto_num_start.eq(auto_num.map(|(s, _)| s)),
            profile_group_filters::auto_num_end.eq(auto_num.map(|(_, e)| e)),
            profile_group_filters::updated_at.eq(format_ts(now)),
        ))
        .execute(conn)?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("filter {filter_id}")));
    }
    Ok(())
}

pub fn filter_for_group(
    conn: &mut DbPooledConnection,
    profile_id: &str,
    provider_group_id: &str,
) -> Result<Option<ProfileGroupFilter>, DbError> {
    Ok(profile_group_filters::table
        .filter(profile_group_filters::profile_id.eq(profile_id))
        .filter(profile_group_filters::provider_group_id.eq(provider_group_id))
        .first(conn)
        .optional()?)
}

/// Add a per-channel override row to a select-mode filter.
pub fn add_channel_override(
    conn: &mut DbPooledConnection,
    new: NewProfileGroupChannelFilter,
) -> Result<(), DbError> {
    diesel::insert_into(profile_group_channel_filters::table)
        .values(&new)
        .execute(conn)?;
    Ok(())
}

pub fn channel_by_stable_key(
    conn: &mut DbPooledConnection,
    provider_id: &str,
    stable_key: &str,
) -> Result<Option<ProviderChannel>, DbError> {
    Ok(provider_channels::table
        .filter(provider_channels::provider_id.eq(provider_id))
        .filter(provider_channels::stable_key.eq(stable_key))
        .first(conn)
        .optional()?)
}

// =============================================================================
// Fetch runs and snapshots
// =============================================================================

/// The most recent snapshot-type fetch run for a provider.
pub fn latest_snapshot_run(
    conn: &mut DbPooledConnection,
    provider_id: &str,
) -> Result<Option<FetchRun>, DbError> {
    Ok(fetch_runs::table
        .filter(fetch_runs::provider_id.eq(provider_id))
        .filter(fetch_runs::run_type.eq("snapshot"))
        .order(fetch_runs::started_at.desc())
        .first(conn)
        .optional()?)
}

pub fn mark_fetch_run_ok(
    conn: &mut DbPooledConnection,
    run_id: &str,
    playlist_bytes: i64,
    guide_bytes: i64,
    channel_count_seen: i32,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    diesel::update(fetch_runs::table.find(run_id))
        .set((
            fetch_runs::status.eq(RunStatus::Ok.as_str()),
            fetch_runs::finished_at.eq(format_ts(now)),
            fetch_runs::playlist_bytes.eq(playlist_bytes),
            fetch_runs::guide_bytes.eq(guide_bytes),
            fetch_runs::channel_count_seen.eq(channel_count_seen),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_fetch_run_failed(
    conn: &mut DbPooledConnection,
    run_id: &str,
    error_summary: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    diesel::update(fetch_runs::table.find(run_id))
        .set((
            fetch_runs::status.eq(RunStatus::Fail.as_str()),
            fetch_runs::finished_at.eq(format_ts(now)),
            fetch_runs::error_summary.eq(error_summary),
        ))
        .execute(conn)?;
    Ok(())
}

/// The active snapshot for a profile, if any.
pub fn active_snapshot(
    conn: &mut DbPooledConnection,
    profile_id: &str,
) -> Result<Option<Snapshot>, DbError> {
    Ok(snapshots::table
        .filter(snapshots::profile_id.eq(profile_id))
        .filter(snapshots::status.eq(SnapshotStatus::Active.as_str()))
        .first(conn)
        .optional()?)
}

/// All active snapshots across profiles (relay key lookup).
pub fn active_snapshots(conn: &mut DbPooledConnection) -> Result<Vec<Snapshot>, DbError> {
    Ok(snapshots::table
        .filter(snapshots::status.eq(SnapshotStatus::Active.as_str()))
        .load(conn)?)
}
