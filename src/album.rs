//! Album aggregation and the bulk-add policy.
//!
//! Rows are grouped by `search_album`. Each group carries what the policy
//! and the album key need: local track count, distinct artist count, the
//! group's main artist, and the remote total track count learned during
//! track linking. Aggregation therefore runs after track linking.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::LinkerConfig;
use crate::models::{Catalog, RowId, SearchKey};
use crate::search_key::build_album_key_with_threshold;

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AlbumAggregate {
    pub search_album: String,
    /// Most frequent search_artist in the group; first seen wins ties.
    pub artist: String,
    pub local_track_count: u32,
    pub distinct_artist_count: u32,
    /// Most common non-zero remote total among the group's linked rows, or
    /// 0 when no row was linked.
    pub remote_total_tracks: u32,
    pub rows: Vec<RowId>,
}

impl AlbumAggregate {
    pub fn search_key(&self, dominance_threshold: f64) -> SearchKey {
        build_album_key_with_threshold(
            &self.artist,
            &self.search_album,
            self.local_track_count,
            self.distinct_artist_count,
            dominance_threshold,
        )
    }
}

/// Most frequent value, ties going to the value seen first.
fn mode_first_seen<T, I>(values: I) -> Option<T>
where
    T: Eq + std::hash::Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut counts: FxHashMap<T, (usize, usize)> = FxHashMap::default();
    for (position, value) in values.into_iter().enumerate() {
        counts.entry(value).or_insert((0, position)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(value, _)| value)
}

/// Group rows by search_album in order of first appearance. Rows without an
/// album belong to no group.
pub fn group_albums(catalog: &Catalog) -> Vec<AlbumAggregate> {
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut members: Vec<(&str, Vec<RowId>)> = Vec::new();

    for (id, row) in catalog.iter() {
        let Some(album) = row.search_album.as_deref().filter(|a| !a.trim().is_empty()) else {
            continue;
        };
        let slot = *index.entry(album).or_insert_with(|| {
            members.push((album, Vec::new()));
            members.len() - 1
        });
        members[slot].1.push(id);
    }

    members
        .into_iter()
        .map(|(album, ids)| {
            let rows: Vec<_> = ids.iter().filter_map(|&id| catalog.get(id)).collect();
            let artists: FxHashSet<&str> = rows.iter().map(|r| r.search_artist.as_str()).collect();
            AlbumAggregate {
                search_album: album.to_string(),
                artist: mode_first_seen(rows.iter().map(|r| r.search_artist.as_str()))
                    .unwrap_or_default()
                    .to_string(),
                local_track_count: ids.len() as u32,
                distinct_artist_count: artists.len() as u32,
                remote_total_tracks: mode_first_seen(
                    rows.iter()
                        .map(|r| r.remote_total_tracks)
                        .filter(|&total| total > 0),
                )
                .unwrap_or(0),
                rows: ids,
            }
        })
        .collect()
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AlbumPolicy {
    pub bulk_threshold: u32,
    pub ignored: FxHashSet<String>,
}

impl Default for AlbumPolicy {
    fn default() -> Self {
        Self::from_config(&LinkerConfig::default())
    }
}

impl AlbumPolicy {
    pub fn from_config(config: &LinkerConfig) -> Self {
        Self {
            bulk_threshold: config.album_bulk_threshold,
            ignored: config.ignored_albums.iter().cloned().collect(),
        }
    }

    /// Add when the local copy is complete (and more than a single), or when
    /// enough tracks are held locally that the album is worth saving anyway.
    /// Ignored albums are never added.
    pub fn should_add_album(&self, group: &AlbumAggregate) -> bool {
        if self.ignored.contains(&group.search_album) {
            return false;
        }
        let complete = group.remote_total_tracks == group.local_track_count
            && group.remote_total_tracks > 1;
        complete || group.local_track_count >= self.bulk_threshold
    }

    /// Compute the groups and write `library_total_tracks` and `add_album`
    /// to every member row. Returns the groups for album resolution.
    pub fn mark_albums(&self, catalog: &mut Catalog) -> Vec<AlbumAggregate> {
        let groups = group_albums(catalog);
        let mut flagged = 0usize;
        for group in &groups {
            let add = self.should_add_album(group);
            flagged += add as usize;
            for &id in &group.rows {
                if let Some(row) = catalog.get_mut(id) {
                    row.library_total_tracks = group.local_track_count;
                    row.add_album = add;
                }
            }
        }
        tracing::info!(
            "Album aggregation: {} albums, {} flagged for add",
            groups.len(),
            flagged
        );
        groups
    }
}
