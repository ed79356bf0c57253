//! Reconciler: merges parsed playlist entries into the catalog.
//!
//! Runs as one logical write transaction with strictly ordered steps: group
//! upsert, group deactivation, filter backfill, channel upsert, channel
//! deactivation. Rows are never deleted; absence is expressed through
//! `active = false`. A fetch yielding identical entries produces no state
//! change beyond `last_seen` timestamps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::Error as DieselError;

use crate::db::catalog::DbError;
use crate::db::models::{
    format_ts, new_id, FilterDecision, NewProfileGroupFilter, NewProviderChannel,
    NewProviderGroup,
};
use crate::db::schema::{
    profile_group_filters, provider_channels, provider_groups,
};
use crate::db::DbPooledConnection;
use crate::keys;
use crate::playlist::{ContentKind, ParsedEntry};

/// Counters reported from one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub groups_seen: usize,
    pub groups_deactivated: usize,
    pub filters_created: usize,
    pub channels_seen: usize,
    pub channels_deactivated: usize,
}

#[derive(Debug, Default)]
struct GroupCounts {
    live: usize,
    vod: usize,
    series: usize,
    total: usize,
}

impl GroupCounts {
    fn record(&mut self, kind: ContentKind) {
        self.total += 1;
        match kind {
            ContentKind::Live => self.live += 1,
            ContentKind::Vod => self.vod += 1,
            ContentKind::Series => self.series += 1,
        }
    }

    /// Homogeneous kinds keep their label; combinations are `mixed`; an
    /// empty group defaults to `live`.
    fn content_label(&self) -> &'static str {
        let kinds_present =
            (self.live > 0) as u8 + (self.vod > 0) as u8 + (self.series > 0) as u8;
        match kinds_present {
            0 => "live",
            1 if self.live > 0 => "live",
            1 if self.vod > 0 => "vod",
            1 => "series",
            _ => "mixed",
        }
    }
}

/// Merge one fetch's parsed entries into the catalog.
pub fn reconcile(
    conn: &mut DbPooledConnection,
    provider_id: &str,
    profile_id: &str,
    fetch_run_id: &str,
    entries: &[ParsedEntry],
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, DbError> {
    conn.transaction::<_, DieselError, _>(|conn| {
        let ts = format_ts(now);
        let mut summary = ReconcileSummary::default();

        // Step 1: group upsert.
        let mut group_counts: HashMap<&str, GroupCounts> = HashMap::new();
        for entry in entries {
            let group = entry.group_title.trim();
            if group.is_empty() {
                continue;
            }
            group_counts.entry(group).or_default().record(entry.kind);
        }
        summary.groups_seen = group_counts.len();

        let mut group_ids: HashMap<String, String> = HashMap::new();
        for (&name, counts) in &group_counts {
            let existing: Option<String> = provider_groups::table
                .filter(provider_groups::provider_id.eq(provider_id))
                .filter(provider_groups::name.eq(name))
                .select(provider_groups::id)
                .first(conn)
                .optional()?;
            let group_id = match existing {
                Some(id) => {
                    diesel::update(provider_groups::table.find(&id))
                        .set((
                            provider_groups::active.eq(1),
                            provider_groups::channel_count.eq(counts.total as i32),
                            provider_groups::content_type.eq(counts.content_label()),
                            provider_groups::last_seen.eq(&ts),
                        ))
                        .execute(conn)?;
                    id
                }
                None => {
                    let row = NewProviderGroup {
                        id: new_id(),
                        provider_id: provider_id.to_string(),
                        name: name.to_string(),
                        content_type: counts.content_label().to_string(),
                        channel_count: counts.total as i32,
                        active: 1,
                        first_seen: ts.clone(),
                        last_seen: ts.clone(),
                    };
                    diesel::insert_into(provider_groups::table)
                        .values(&row)
                        .execute(conn)?;
                    row.id
                }
            };
            group_ids.insert(name.to_string(), group_id);
        }

        // Step 2: deactivate groups absent from this fetch.
        let seen_names: Vec<&str> = group_counts.keys().copied().collect();
        summary.groups_deactivated = diesel::update(
            provider_groups::table
                .filter(provider_groups::provider_id.eq(provider_id))
                .filter(provider_groups::active.eq(1))
                .filter(provider_groups::name.ne_all(seen_names)),
        )
        .set((
            provider_groups::active.eq(0),
            provider_groups::channel_count.eq(0),
        ))
        .execute(conn)?;

        // Step 3: backfill pending filters for groups the profile has not
        // decided on yet. This is how new groups surface to the operator.
        let decided: Vec<String> = profile_group_filters::table
            .filter(profile_group_filters::profile_id.eq(profile_id))
            .select(profile_group_filters::provider_group_id)
            .load(conn)?;
        let undecided: Vec<String> = provider_groups::table
            .filter(provider_groups::provider_id.eq(provider_id))
            .filter(provider_groups::id.ne_all(decided))
            .select(provider_groups::id)
            .load(conn)?;
        for group_id in &undecided {
            let filter = NewProfileGroupFilter::pending(profile_id, group_id, now);
            diesel::insert_into(profile_group_filters::table)
                .values(&filter)
                .execute(conn)?;
        }
        summary.filters_created = undecided.len();

        // Group name -> decision, for the excluded-group skip below.
        let decisions: Vec<(String, String)> = profile_group_filters::table
            .inner_join(provider_groups::table)
            .filter(profile_group_filters::profile_id.eq(profile_id))
            .filter(provider_groups::provider_id.eq(provider_id))
            .select((provider_groups::name, profile_group_filters::decision))
            .load(conn)?;
        let decisions: HashMap<String, FilterDecision> = decisions
            .into_iter()
            .filter_map(|(name, d)| FilterDecision::parse(&d).map(|d| (name, d)))
            .collect();

        // Step 4: channel upsert under stable identities.
        let mut occurrences: HashMap<String, u32> = HashMap::new();
        for entry in entries {
            if entry.display_name.trim().is_empty() || entry.stream_url.trim().is_empty() {
                continue;
            }
            summary.channels_seen += 1;

            let base = keys::stable_identity(
                entry.tvg_id.as_deref(),
                &entry.display_name,
                &entry.stream_url,
                &entry.group_title,
                1,
            );
            let occurrence = occurrences
                .entry(base.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            let identity = if *occurrence >= 2 {
                keys::stable_identity(
                    entry.tvg_id.as_deref(),
                    &entry.display_name,
                    &entry.stream_url,
                    &entry.group_title,
                    *occurrence,
                )
            } else {
                base
            };
            let stable_key = keys::stable_key(&identity);

            // Channels in excluded groups are skipped here and caught by the
            // deactivation sweep.
            if decisions.get(entry.group_title.trim()) == Some(&FilterDecision::Exclude) {
                continue;
            }

            let group_id = group_ids.get(entry.group_title.trim()).cloned();
            let existing: Option<String> = provider_channels::table
                .filter(provider_channels::provider_id.eq(provider_id))
                .filter(provider_channels::stable_key.eq(&stable_key))
                .select(provider_channels::id)
                .first(conn)
                .optional()?;
            match existing {
                Some(id) => {
                    diesel::update(provider_channels::table.find(&id))
                        .set((
                            provider_channels::display_name.eq(&entry.display_name),
                            provider_channels::tvg_id.eq(entry.tvg_id.as_deref()),
                            provider_channels::tvg_name.eq(entry.tvg_name.as_deref()),
                            provider_channels::logo_url.eq(entry.logo_url.as_deref()),
                            provider_channels::stream_url.eq(&entry.stream_url),
                            provider_channels::group_name.eq(&entry.group_title),
                            provider_channels::group_id.eq(group_id.as_deref()),
                            provider_channels::content_type.eq(entry.kind.as_str()),
                            provider_channels::active.eq(1),
                            provider_channels::last_seen.eq(&ts),
                            provider_channels::last_fetch_run_id.eq(fetch_run_id),
                        ))
                        .execute(conn)?;
                }
                None => {
                    let row = NewProviderChannel {
                        id: new_id(),
                        provider_id: provider_id.to_string(),
                        stable_key: Some(stable_key),
                        display_name: entry.display_name.clone(),
                        tvg_id: entry.tvg_id.clone(),
                        tvg_name: entry.tvg_name.clone(),
                        logo_url: entry.logo_url.clone(),
                        stream_url: entry.stream_url.clone(),
                        group_name: entry.group_title.clone(),
                        group_id,
                        content_type: entry.kind.as_str().to_string(),
                        active: 1,
                        first_seen: ts.clone(),
                        last_seen: ts.clone(),
                        last_fetch_run_id: Some(fetch_run_id.to_string()),
                    };
                    diesel::insert_into(provider_channels::table)
                        .values(&row)
                        .execute(conn)?;
                }
            }
        }

        // Step 5: deactivate channels not observed in this fetch.
        summary.channels_deactivated = diesel::update(
            provider_channels::table
                .filter(provider_channels::provider_id.eq(provider_id))
                .filter(provider_channels::active.eq(1))
                .filter(
                    provider_channels::last_fetch_run_id
                        .ne(fetch_run_id)
                        .or(provider_channels::last_fetch_run_id.is_null()),
                ),
        )
        .set(provider_channels::active.eq(0))
        .execute(conn)?;

        Ok(summary)
    })
    .map_err(DbError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog::{
        create_profile, create_provider, filter_for_group, group_by_name, set_group_decision,
    };
    use crate::db::connection::create_test_pool;
    use crate::db::models::{NewProfile, NewProvider};
    use crate::playlist::parse_playlist;

    const PLAYLIST: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://x/s/1\n\
        #EXTINF:-1 tvg-id=\"bbc.uk\" group-title=\"News\",BBC\nhttp://x/s/2\n\
        #EXTINF:-1 group-title=\"Cinema\",Heat\nhttp://x/movie/3.mp4\n\
        #EXTINF:-1,Other\nhttp://x/s/4\n";

    struct Fixture {
        pool: crate::db::DbPool,
        provider_id: String,
        profile_id: String,
    }

    fn fixture() -> Fixture {
        let pool = create_test_pool();
        let mut conn = pool.get().unwrap();
        let now = Utc::now();
        let provider =
            create_provider(&mut conn, NewProvider::new("p1", "http://x/p.m3u", now)).unwrap();
        let profile = create_profile(&mut conn, NewProfile::new("p1", "m3undle", now)).unwrap();
        Fixture {
            pool,
            provider_id: provider.id,
            profile_id: profile.id,
        }
    }

    fn run(fix: &Fixture, run_id: &str, playlist: &str) -> ReconcileSummary {
        let mut conn = fix.pool.get().unwrap();
        let entries = parse_playlist(playlist).unwrap();
        reconcile(
            &mut conn,
            &fix.provider_id,
            &fix.profile_id,
            run_id,
            &entries,
            Utc::now(),
        )
        .unwrap()
    }

    fn active_channel_names(fix: &Fixture) -> Vec<String> {
        let mut conn = fix.pool.get().unwrap();
        provider_channels::table
            .filter(provider_channels::provider_id.eq(&fix.provider_id))
            .filter(provider_channels::active.eq(1))
            .order(provider_channels::display_name.asc())
            .select(provider_channels::display_name)
            .load(&mut conn)
            .unwrap()
    }

    #[test]
    fn test_first_reconcile_creates_groups_channels_and_pending_filters() {
        let fix = fixture();
        let summary = run(&fix, "run-1", PLAYLIST);
        assert_eq!(summary.groups_seen, 2);
        assert_eq!(summary.filters_created, 2);
        assert_eq!(summary.channels_seen, 4);
        assert_eq!(summary.channels_deactivated, 0);

        let mut conn = fix.pool.get().unwrap();
        let news = group_by_name(&mut conn, &fix.provider_id, "News")
            .unwrap()
            .unwrap();
        assert_eq!(news.content_type, "live");
        assert_eq!(news.channel_count, 2);
        let cinema = group_by_name(&mut conn, &fix.provider_id, "Cinema")
            .unwrap()
            .unwrap();
        assert_eq!(cinema.content_type, "vod");

        let filter = filter_for_group(&mut conn, &fix.profile_id, &news.id)
            .unwrap()
            .unwrap();
        assert_eq!(filter.decision, "pending");
        assert_eq!(filter.channel_mode, "all");
        drop(conn);

        assert_eq!(active_channel_names(&fix), ["BBC", "CNN", "Heat", "Other"]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let fix = fixture();
        run(&fix, "run-1", PLAYLIST);
        let mut conn = fix.pool.get().unwrap();
        let ids_before: Vec<(String, Option<String>)> = provider_channels::table
            .order(provider_channels::display_name.asc())
            .select((provider_channels::id, provider_channels::stable_key))
            .load(&mut conn)
            .unwrap();
        drop(conn);

        let summary = run(&fix, "run-2", PLAYLIST);
        assert_eq!(summary.channels_deactivated, 0);
        assert_eq!(summary.filters_created, 0);

        let mut conn = fix.pool.get().unwrap();
        let ids_after: Vec<(String, Option<String>)> = provider_channels::table
            .order(provider_channels::display_name.asc())
            .select((provider_channels::id, provider_channels::stable_key))
            .load(&mut conn)
            .unwrap();
        assert_eq!(ids_before, ids_after);
    }

    #[test]
    fn test_disappeared_channel_is_deactivated_not_deleted() {
        let fix = fixture();
        run(&fix, "run-1", PLAYLIST);

        let without_cnn = PLAYLIST.replace(
            "#EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://x/s/1\n",
            "",
        );
        let summary = run(&fix, "run-2", &without_cnn);
        assert_eq!(summary.channels_deactivated, 1);
        assert_eq!(active_channel_names(&fix), ["BBC", "Heat", "Other"]);

        // The row survives with its stable key; reappearance reactivates it.
        let summary = run(&fix, "run-3", PLAYLIST);
        assert_eq!(summary.channels_deactivated, 0);
        assert_eq!(active_channel_names(&fix), ["BBC", "CNN", "Heat", "Other"]);

        let mut conn = fix.pool.get().unwrap();
        let count: i64 = provider_channels::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_disappeared_group_is_deactivated() {
        let fix = fixture();
        run(&fix, "run-1", PLAYLIST);
        let only_news = "#EXTM3U\n#EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://x/s/1\n";
        let summary = run(&fix, "run-2", only_news);
        assert_eq!(summary.groups_deactivated, 1);

        let mut conn = fix.pool.get().unwrap();
        let cinema = group_by_name(&mut conn, &fix.provider_id, "Cinema")
            .unwrap()
            .unwrap();
        assert_eq!(cinema.active, 0);
        assert_eq!(cinema.channel_count, 0);
    }

    #[test]
    fn test_duplicate_lines_get_distinct_keys() {
        let fix = fixture();
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://x/s/1\n\
            #EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\nhttp://x/s/1\n";
        let summary = run(&fix, "run-1", playlist);
        assert_eq!(summary.channels_seen, 2);

        let mut conn = fix.pool.get().unwrap();
        let keys: Vec<Option<String>> = provider_channels::table
            .select(provider_channels::stable_key)
            .load(&mut conn)
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_excluded_group_channels_are_skipped_and_swept() {
        let fix = fixture();
        run(&fix, "run-1", PLAYLIST);

        let mut conn = fix.pool.get().unwrap();
        let news = group_by_name(&mut conn, &fix.provider_id, "News")
            .unwrap()
            .unwrap();
        set_group_decision(
            &mut conn,
            &fix.profile_id,
            &news.id,
            FilterDecision::Exclude,
            Utc::now(),
        )
        .unwrap();
        drop(conn);

        let summary = run(&fix, "run-2", PLAYLIST);
        // CNN and BBC skipped by the exclude, then deactivated by the sweep.
        assert_eq!(summary.channels_deactivated, 2);
        assert_eq!(active_channel_names(&fix), ["Heat", "Other"]);
    }

    #[test]
    fn test_mixed_group_content_label() {
        let fix = fixture();
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Stuff\",A\nhttp://x/s/1.ts\n\
            #EXTINF:-1 group-title=\"Stuff\",B\nhttp://x/movie/2.mp4\n";
        run(&fix, "run-1", playlist);
        let mut conn = fix.pool.get().unwrap();
        let group = group_by_name(&mut conn, &fix.provider_id, "Stuff")
            .unwrap()
            .unwrap();
        assert_eq!(group.content_type, "mixed");
    }
}
