//! In-memory lineup assembly: which channels are emitted, under which output
//! group, in which order, with which numbers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::models::{
    ChannelMode, FilterDecision, ProfileGroupChannelFilter, ProfileGroupFilter, ProviderChannel,
};
use crate::keys;
use crate::playlist::ContentKind;

/// Bucket names for vod/series entries that carry no raw group.
pub const MOVIES_BUCKET: &str = "Movies";
pub const SERIES_BUCKET: &str = "Series";

/// One published channel, as serialized into `channel_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelIndexEntry {
    pub stream_key: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvg_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvg_chno: Option<i32>,
    pub stream_url: String,
}

/// A group filter joined to its group's raw name.
#[derive(Debug, Clone)]
pub struct GroupFilterRow {
    pub filter: ProfileGroupFilter,
    pub group_name: String,
}

/// Candidate emitted channel, before ordering and numbering.
struct Emitted<'a> {
    channel: &'a ProviderChannel,
    output_group: String,
    number: Option<i32>,
    /// Filter owning auto numbering for this channel, when any.
    filter_id: Option<String>,
}

/// Assemble the published lineup from active catalog channels and the
/// profile's filter state.
///
/// VOD and series channels bypass group decisions and are gated upstream by
/// the provider-level flags; live channels are opt-in per group. Until the
/// operator has included at least one group, the lineup passes live channels
/// through unchanged (minus explicit excludes) so a fresh install serves
/// something before any decision is made.
pub fn assemble(
    channels: &[ProviderChannel],
    filters: &[GroupFilterRow],
    overrides: &HashMap<String, ProfileGroupChannelFilter>,
    profile_id: &str,
) -> Vec<ChannelIndexEntry> {
    let filters_by_group: HashMap<&str, &GroupFilterRow> = filters
        .iter()
        .map(|row| (row.group_name.as_str(), row))
        .collect();
    let pass_through = !filters
        .iter()
        .any(|row| row.filter.decision_parsed() == FilterDecision::Include);

    let mut emitted: Vec<Emitted> = Vec::new();
    for channel in channels {
        let kind = ContentKind::parse(&channel.content_type).unwrap_or(ContentKind::Live);
        let raw_group = channel.group_name.trim();
        let filter_row = filters_by_group.get(raw_group).copied();

        match kind {
            ContentKind::Vod | ContentKind::Series => {
                let output_group = if raw_group.is_empty() {
                    match kind {
                        ContentKind::Vod => MOVIES_BUCKET.to_string(),
                        _ => SERIES_BUCKET.to_string(),
                    }
                } else {
                    output_name_for(filter_row, raw_group)
                };
                emitted.push(Emitted {
                    channel,
                    output_group,
                    number: None,
                    filter_id: None,
                });
            }
            ContentKind::Live => {
                let Some(row) = filter_row else {
                    // No filter means no group (or a group reconciled away);
                    // only pass-through mode emits these.
                    if pass_through {
                        emitted.push(Emitted {
                            channel,
                            output_group: raw_group.to_string(),
                            number: None,
                            filter_id: None,
                        });
                    }
                    continue;
                };
                let decision = row.filter.decision_parsed();
                if decision == FilterDecision::Exclude {
                    continue;
                }
                if decision != FilterDecision::Include {
                    if pass_through {
                        emitted.push(Emitted {
                            channel,
                            output_group: output_name_for(Some(row), raw_group),
                            number: None,
                            filter_id: None,
                        });
                    }
                    continue;
                }
                match row.filter.mode_parsed() {
                    ChannelMode::All => emitted.push(Emitted {
                        channel,
                        output_group: output_name_for(Some(row), raw_group),
                        number: None,
                        filter_id: Some(row.filter.id.clone()),
                    }),
                    ChannelMode::Select => {
                        let Some(override_row) = overrides.get(&channel.id) else {
                            continue;
                        };
                        let output_group = override_row
                            .output_group_name
                            .clone()
                            .filter(|s| !s.trim().is_empty())
                            .unwrap_or_else(|| output_name_for(Some(row), raw_group));
                        emitted.push(Emitted {
                            channel,
                            output_group,
                            number: override_row.channel_number,
                            filter_id: Some(row.filter.id.clone()),
                        });
                    }
                }
            }
        }
    }

    order_and_number(emitted, filters, profile_id)
}

fn output_name_for(row: Option<&GroupFilterRow>, raw_group: &str) -> String {
    row.and_then(|r| r.filter.output_name.clone())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| raw_group.to_string())
}

/// Deterministic ordering and auto numbering, then stream-key derivation.
///
/// Output groups are emitted in byte order. Within a group: channels with an
/// explicit number first (ascending), then unnumbered channels by display
/// name and stream URL. Unnumbered channels of a filter with
/// `auto_num_start` receive consecutive numbers until `auto_num_end` would
/// be exceeded.
fn order_and_number(
    emitted: Vec<Emitted>,
    filters: &[GroupFilterRow],
    profile_id: &str,
) -> Vec<ChannelIndexEntry> {
    let mut by_group: HashMap<String, Vec<Emitted>> = HashMap::new();
    for item in emitted {
        by_group.entry(item.output_group.clone()).or_default().push(item);
    }

    let mut auto_counters: HashMap<String, (i32, Option<i32>)> = filters
        .iter()
        .filter_map(|row| {
            row.filter
                .auto_num_start
                .map(|start| (row.filter.id.clone(), (start, row.filter.auto_num_end)))
        })
        .collect();

    let mut group_names: Vec<String> = by_group.keys().cloned().collect();
    group_names.sort();

    let mut out = Vec::new();
    for group_name in group_names {
        let mut items = by_group.remove(&group_name).unwrap_or_default();
        items.sort_by(|a, b| match (a.number, b.number) {
            (Some(x), Some(y)) => x
                .cmp(&y)
                .then_with(|| a.channel.display_name.cmp(&b.channel.display_name))
                .then_with(|| a.channel.stream_url.cmp(&b.channel.stream_url)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a
                .channel
                .display_name
                .cmp(&b.channel.display_name)
                .then_with(|| a.channel.stream_url.cmp(&b.channel.stream_url)),
        });

        for mut item in items {
            if item.number.is_none() {
                if let Some(filter_id) = item.filter_id.as_deref() {
                    if let Some((next, end)) = auto_counters.get_mut(filter_id) {
                        if end.map_or(true, |e| *next <= e) {
                            item.number = Some(*next);
                            *next += 1;
                        }
                    }
                }
            }
            out.push(to_index_entry(&item, profile_id));
        }
    }
    out
}

fn to_index_entry(item: &Emitted, profile_id: &str) -> ChannelIndexEntry {
    let channel = item.channel;
    let group_title = if item.output_group.is_empty() {
        None
    } else {
        Some(item.output_group.clone())
    };
    let stream_key = keys::stream_key(
        channel.tvg_id.as_deref(),
        &channel.display_name,
        &channel.stream_url,
        item.output_group.as_str(),
        profile_id,
    );
    ChannelIndexEntry {
        stream_key,
        display_name: channel.display_name.clone(),
        tvg_id: channel.tvg_id.clone(),
        tvg_name: channel.tvg_name.clone(),
        logo_url: channel.logo_url.clone(),
        group_title,
        tvg_chno: item.number,
        stream_url: channel.stream_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{format_ts, new_id};
    use chrono::Utc;

    const PROFILE_ID: &str = "11111111-2222-3333-4444-555555555555";

    fn channel(name: &str, tvg_id: Option<&str>, url: &str, group: &str, kind: &str) -> ProviderChannel {
        let ts = format_ts(Utc::now());
        ProviderChannel {
            id: new_id(),
            provider_id: "prov".to_string(),
            stable_key: Some(new_id()),
            display_name: name.to_string(),
            tvg_id: tvg_id.map(|s| s.to_string()),
            tvg_name: None,
            logo_url: None,
            stream_url: url.to_string(),
            group_name: group.to_string(),
            group_id: None,
            content_type: kind.to_string(),
            active: 1,
            first_seen: ts.clone(),
            last_seen: ts,
            last_fetch_run_id: Some("run".to_string()),
        }
    }

    fn filter(group: &str, decision: &str) -> GroupFilterRow {
        let ts = format_ts(Utc::now());
        GroupFilterRow {
            group_name: group.to_string(),
            filter: ProfileGroupFilter {
                id: new_id(),
                profile_id: PROFILE_ID.to_string(),
                provider_group_id: new_id(),
                decision: decision.to_string(),
                channel_mode: "all".to_string(),
                output_name: None,
                auto_num_start: None,
                auto_num_end: None,
                track_new_channels: 0,
                created_at: ts.clone(),
                updated_at: ts,
            },
        }
    }

    fn names(entries: &[ChannelIndexEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.display_name.as_str()).collect()
    }

    #[test]
    fn test_pass_through_before_any_include_decision() {
        let channels = vec![
            channel("CNN", Some("cnn.us"), "http://x/s/1", "News", "live"),
            channel("Other", None, "http://x/s/2", "", "live"),
        ];
        let filters = vec![filter("News", "pending")];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_strict_opt_in_once_a_group_is_included() {
        let channels = vec![
            channel("CNN", Some("cnn.us"), "http://x/s/1", "News", "live"),
            channel("Other", None, "http://x/s/2", "", "live"),
            channel("ESPN", None, "http://x/s/3", "Sports", "live"),
        ];
        let filters = vec![
            filter("News", "include"),
            filter("Sports", "pending"),
        ];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(names(&entries), ["CNN"]);
    }

    #[test]
    fn test_excluded_group_never_emits() {
        let channels = vec![channel("CNN", None, "http://x/s/1", "News", "live")];
        let filters = vec![filter("News", "exclude")];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_vod_and_series_bypass_group_decisions() {
        let channels = vec![
            channel("Heat", None, "http://x/movie/1.mp4", "Cinema", "vod"),
            channel("Show", None, "http://x/series/2.mkv", "", "series"),
            channel("Loose", None, "http://x/movie/3.mp4", "", "vod"),
        ];
        // Cinema has no include decision; an unrelated include forces strict
        // mode for live channels, but vod/series are unaffected.
        let filters = vec![filter("Cinema", "pending"), filter("News", "include")];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(entries.len(), 3);

        let by_name: HashMap<&str, &ChannelIndexEntry> =
            entries.iter().map(|e| (e.display_name.as_str(), e)).collect();
        assert_eq!(by_name["Heat"].group_title.as_deref(), Some("Cinema"));
        assert_eq!(by_name["Loose"].group_title.as_deref(), Some(MOVIES_BUCKET));
        assert_eq!(by_name["Show"].group_title.as_deref(), Some(SERIES_BUCKET));
    }

    #[test]
    fn test_output_name_renames_group() {
        let channels = vec![channel("CNN", None, "http://x/s/1", "News", "live")];
        let mut row = filter("News", "include");
        row.filter.output_name = Some("World News".to_string());
        let entries = assemble(&channels, &[row], &HashMap::new(), PROFILE_ID);
        assert_eq!(entries[0].group_title.as_deref(), Some("World News"));
    }

    #[test]
    fn test_select_mode_emits_only_overridden_channels() {
        let channels = vec![
            channel("CNN", None, "http://x/s/1", "News", "live"),
            channel("BBC", None, "http://x/s/2", "News", "live"),
        ];
        let mut row = filter("News", "include");
        row.filter.channel_mode = "select".to_string();
        let ts = format_ts(Utc::now());
        let mut overrides = HashMap::new();
        overrides.insert(
            channels[1].id.clone(),
            ProfileGroupChannelFilter {
                id: new_id(),
                filter_id: row.filter.id.clone(),
                provider_channel_id: channels[1].id.clone(),
                output_group_name: Some("Picked".to_string()),
                channel_number: Some(7),
                created_at: ts,
            },
        );
        let entries = assemble(&channels, &[row], &overrides, PROFILE_ID);
        assert_eq!(names(&entries), ["BBC"]);
        assert_eq!(entries[0].group_title.as_deref(), Some("Picked"));
        assert_eq!(entries[0].tvg_chno, Some(7));
    }

    #[test]
    fn test_ordering_numbered_first_then_by_name_and_url() {
        let channels = vec![
            channel("Zeta", None, "http://x/s/z", "News", "live"),
            channel("Alpha", None, "http://x/s/a2", "News", "live"),
            channel("Alpha", None, "http://x/s/a1", "News", "live"),
            channel("Mid", None, "http://x/s/m", "News", "live"),
        ];
        let mut row = filter("News", "include");
        row.filter.channel_mode = "select".to_string();
        let ts = format_ts(Utc::now());
        let mut overrides = HashMap::new();
        for (channel, number) in [(&channels[0], Some(5)), (&channels[3], Some(2))] {
            overrides.insert(
                channel.id.clone(),
                ProfileGroupChannelFilter {
                    id: new_id(),
                    filter_id: row.filter.id.clone(),
                    provider_channel_id: channel.id.clone(),
                    output_group_name: None,
                    channel_number: number,
                    created_at: ts.clone(),
                },
            );
        }
        for channel in [&channels[1], &channels[2]] {
            overrides.insert(
                channel.id.clone(),
                ProfileGroupChannelFilter {
                    id: new_id(),
                    filter_id: row.filter.id.clone(),
                    provider_channel_id: channel.id.clone(),
                    output_group_name: None,
                    channel_number: None,
                    created_at: ts.clone(),
                },
            );
        }
        let entries = assemble(&channels, &[row], &overrides, PROFILE_ID);
        // Numbered ascending first, then unnumbered by name, URL tie-break.
        assert_eq!(names(&entries), ["Mid", "Zeta", "Alpha", "Alpha"]);
        assert_eq!(entries[2].stream_url, "http://x/s/a1");
        assert_eq!(entries[3].stream_url, "http://x/s/a2");
    }

    #[test]
    fn test_auto_numbering_respects_range_end() {
        let channels = vec![
            channel("A", None, "http://x/s/1", "News", "live"),
            channel("B", None, "http://x/s/2", "News", "live"),
            channel("C", None, "http://x/s/3", "News", "live"),
        ];
        let mut row = filter("News", "include");
        row.filter.auto_num_start = Some(100);
        row.filter.auto_num_end = Some(101);
        let entries = assemble(&channels, &[row], &HashMap::new(), PROFILE_ID);
        assert_eq!(entries[0].tvg_chno, Some(100));
        assert_eq!(entries[1].tvg_chno, Some(101));
        // Range exhausted; the rest stay unnumbered.
        assert_eq!(entries[2].tvg_chno, None);
    }

    #[test]
    fn test_auto_numbering_without_end_is_unbounded() {
        let channels = vec![
            channel("A", None, "http://x/s/1", "News", "live"),
            channel("B", None, "http://x/s/2", "News", "live"),
        ];
        let mut row = filter("News", "include");
        row.filter.auto_num_start = Some(1);
        let entries = assemble(&channels, &[row], &HashMap::new(), PROFILE_ID);
        assert_eq!(entries[0].tvg_chno, Some(1));
        assert_eq!(entries[1].tvg_chno, Some(2));
    }

    #[test]
    fn test_groups_are_emitted_in_byte_order() {
        let channels = vec![
            channel("S1", None, "http://x/s/1", "Sports", "live"),
            channel("N1", None, "http://x/s/2", "News", "live"),
        ];
        let filters = vec![filter("Sports", "include"), filter("News", "include")];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(names(&entries), ["N1", "S1"]);
    }

    #[test]
    fn test_stream_key_uses_output_group() {
        let channels = vec![channel("CNN", Some("cnn.us"), "http://x/s/1", "News", "live")];
        let filters = vec![filter("News", "include")];
        let entries = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(entries[0].stream_key, "T5HSHhY8p9EyZAyK");
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let channels = vec![
            channel("CNN", Some("cnn.us"), "http://x/s/1", "News", "live"),
            channel("BBC", None, "http://x/s/2", "News", "live"),
        ];
        let filters = vec![filter("News", "include")];
        let a = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        let b = assemble(&channels, &filters, &HashMap::new(), PROFILE_ID);
        assert_eq!(a, b);
    }
}
