use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::schema::{
    fetch_runs, profile_group_channel_filters, profile_group_filters, profile_providers,
    profiles, provider_channels, provider_groups, providers, snapshots,
};

/// Render a timestamp as fixed-width RFC 3339 UTC.
///
/// Fixed precision keeps lexicographic ordering equal to chronological
/// ordering for stored text timestamps.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh opaque row id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Row-state enums (stored as text)
// =============================================================================

/// Operator decision for a group filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Pending,
    Include,
    Exclude,
}

impl FilterDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterDecision::Pending => "pending",
            FilterDecision::Include => "include",
            FilterDecision::Exclude => "exclude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(FilterDecision::Pending),
            "include" => Some(FilterDecision::Include),
            "exclude" => Some(FilterDecision::Exclude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    All,
    Select,
}

impl ChannelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelMode::All => "all",
            ChannelMode::Select => "select",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(ChannelMode::All),
            "select" => Some(ChannelMode::Select),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Ok,
    Fail,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Snapshot,
    Preview,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Snapshot => "snapshot",
            RunType::Preview => "preview",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Staged,
    Active,
    Archived,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Staged => "staged",
            SnapshotStatus::Active => "active",
            SnapshotStatus::Archived => "archived",
        }
    }
}

// =============================================================================
// Providers
// =============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = providers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub playlist_url: String,
    pub guide_url: Option<String>,
    pub headers_json: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_seconds: i32,
    pub enabled: i32,
    pub is_active: i32,
    pub include_vod: i32,
    pub include_series: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl Provider {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn includes_vod(&self) -> bool {
        self.include_vod != 0
    }

    pub fn includes_series(&self) -> bool {
        self.include_series != 0
    }

    /// Parsed request header map; empty when unset or unparseable.
    pub fn headers(&self) -> HashMap<String, String> {
        self.headers_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = providers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProvider {
    pub id: String,
    pub name: String,
    pub playlist_url: String,
    pub guide_url: Option<String>,
    pub headers_json: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_seconds: i32,
    pub enabled: i32,
    pub is_active: i32,
    pub include_vod: i32,
    pub include_series: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl NewProvider {
    pub fn new(name: impl Into<String>, playlist_url: impl Into<String>, now: DateTime<Utc>) -> Self {
        let ts = format_ts(now);
        Self {
            id: new_id(),
            name: name.into(),
            playlist_url: playlist_url.into(),
            guide_url: None,
            headers_json: None,
            user_agent: None,
            timeout_seconds: 30,
            enabled: 1,
            is_active: 0,
            include_vod: 0,
            include_series: 0,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }

    pub fn with_guide_url(mut self, guide_url: impl Into<String>) -> Self {
        self.guide_url = Some(guide_url.into());
        self
    }

    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        self.headers_json = serde_json::to_string(headers).ok();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Per-request timeout, clamped to the allowed 1-300s range.
    pub fn with_timeout_seconds(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds.clamp(1, 300);
        self
    }

    pub fn with_vod(mut self, include: bool) -> Self {
        self.include_vod = include as i32;
        self
    }

    pub fn with_series(mut self, include: bool) -> Self {
        self.include_series = include as i32;
        self
    }
}

// =============================================================================
// Profiles and associations
// =============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub output_name: String,
    pub enabled: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProfile {
    pub id: String,
    pub name: String,
    pub output_name: String,
    pub enabled: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl NewProfile {
    pub fn new(
        name: impl Into<String>,
        output_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let ts = format_ts(now);
        Self {
            id: new_id(),
            name: name.into(),
            output_name: output_name.into(),
            enabled: 1,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = profile_providers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProfileProvider {
    pub id: String,
    pub profile_id: String,
    pub provider_id: String,
    pub priority: i32,
    pub enabled: i32,
    pub created_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = profile_providers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProfileProvider {
    pub id: String,
    pub profile_id: String,
    pub provider_id: String,
    pub priority: i32,
    pub enabled: i32,
    pub created_at: String,
}

impl NewProfileProvider {
    pub fn new(profile_id: &str, provider_id: &str, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            profile_id: profile_id.to_string(),
            provider_id: provider_id.to_string(),
            priority,
            enabled: 1,
            created_at: format_ts(now),
        }
    }
}

// =============================================================================
// Groups and channels
// =============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = provider_groups)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProviderGroup {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub content_type: String,
    pub channel_count: i32,
    pub active: i32,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = provider_groups)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProviderGroup {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub content_type: String,
    pub channel_count: i32,
    pub active: i32,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = provider_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProviderChannel {
    pub id: String,
    pub provider_id: String,
    pub stable_key: Option<String>,
    pub display_name: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub logo_url: Option<String>,
    pub stream_url: String,
    pub group_name: String,
    pub group_id: Option<String>,
    pub content_type: String,
    pub active: i32,
    pub first_seen: String,
    pub last_seen: String,
    pub last_fetch_run_id: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = provider_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProviderChannel {
    pub id: String,
    pub provider_id: String,
    pub stable_key: Option<String>,
    pub display_name: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub logo_url: Option<String>,
    pub stream_url: String,
    pub group_name: String,
    pub group_id: Option<String>,
    pub content_type: String,
    pub active: i32,
    pub first_seen: String,
    pub last_seen: String,
    pub last_fetch_run_id: Option<String>,
}

// =============================================================================
// Filters
// =============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = profile_group_filters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProfileGroupFilter {
    pub id: String,
    pub profile_id: String,
    pub provider_group_id: String,
    pub decision: String,
    pub channel_mode: String,
    pub output_name: Option<String>,
    pub auto_num_start: Option<i32>,
    pub auto_num_end: Option<i32>,
    pub track_new_channels: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileGroupFilter {
    pub fn decision_parsed(&self) -> FilterDecision {
        FilterDecision::parse(&self.decision).unwrap_or(FilterDecision::Pending)
    }

    pub fn mode_parsed(&self) -> ChannelMode {
        ChannelMode::parse(&self.channel_mode).unwrap_or(ChannelMode::All)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = profile_group_filters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProfileGroupFilter {
    pub id: String,
    pub profile_id: String,
    pub provider_group_id: String,
    pub decision: String,
    pub channel_mode: String,
    pub output_name: Option<String>,
    pub auto_num_start: Option<i32>,
    pub auto_num_end: Option<i32>,
    pub track_new_channels: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl NewProfileGroupFilter {
    /// Backfilled filter for a newly seen group: pending, all-mode.
    pub fn pending(profile_id: &str, provider_group_id: &str, now: DateTime<Utc>) -> Self {
        let ts = format_ts(now);
        Self {
            id: new_id(),
            profile_id: profile_id.to_string(),
            provider_group_id: provider_group_id.to_string(),
            decision: FilterDecision::Pending.as_str().to_string(),
            channel_mode: ChannelMode::All.as_str().to_string(),
            output_name: None,
            auto_num_start: None,
            auto_num_end: None,
            track_new_channels: 0,
            created_at: ts.clone(),
            updated_at: ts,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = profile_group_channel_filters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProfileGroupChannelFilter {
    pub id: String,
    pub filter_id: String,
    pub provider_channel_id: String,
    pub output_group_name: Option<String>,
    pub channel_number: Option<i32>,
    pub created_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = profile_group_channel_filters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewProfileGroupChannelFilter {
    pub id: String,
    pub filter_id: String,
    pub provider_channel_id: String,
    pub output_group_name: Option<String>,
    pub channel_number: Option<i32>,
    pub created_at: String,
}

impl NewProfileGroupChannelFilter {
    pub fn new(filter_id: &str, provider_channel_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            filter_id: filter_id.to_string(),
            provider_channel_id: provider_channel_id.to_string(),
            output_group_name: None,
            channel_number: None,
            created_at: format_ts(now),
        }
    }

    pub fn with_output_group(mut self, name: impl Into<String>) -> Self {
        self.output_group_name = Some(name.into());
        self
    }

    pub fn with_channel_number(mut self, number: i32) -> Self {
        self.channel_number = Some(number);
        self
    }
}

// =============================================================================
// Fetch runs and snapshots
// =============================================================================

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = fetch_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FetchRun {
    pub id: String,
    pub provider_id: String,
    pub run_type: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub playlist_bytes: Option<i64>,
    pub guide_bytes: Option<i64>,
    pub channel_count_seen: Option<i32>,
    pub error_summary: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = fetch_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewFetchRun {
    pub id: String,
    pub provider_id: String,
    pub run_type: String,
    pub status: String,
    pub started_at: String,
}

impl NewFetchRun {
    pub fn running(provider_id: &str, run_type: RunType, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            provider_id: provider_id.to_string(),
            run_type: run_type.as_str().to_string(),
            status: RunStatus::Running.as_str().to_string(),
            started_at: format_ts(now),
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Snapshot {
    pub id: String,
    pub profile_id: String,
    pub status: String,
    pub created_at: String,
    pub channel_index_path: String,
    pub guide_path: String,
    pub channel_count_published: i32,
    pub error_summary: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewSnapshot {
    pub id: String,
    pub profile_id: String,
    pub status: String,
    pub created_at: String,
    pub channel_index_path: String,
    pub guide_path: String,
    pub channel_count_published: i32,
    pub error_summary: Option<String>,
}
