//! Core data models for the library migration.
//!
//! This module contains the catalog row shape shared by every stage, the
//! search key and history type aliases, and the statistics collected while
//! linking.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type Aliases
// ============================================================================

/// Search keys known to return nothing (or nothing decodable).
pub type FailureSet = FxHashSet<SearchKey>;

/// Search keys mapped to the raw successful response, replayed on cache hit.
pub type SuccessMap = FxHashMap<SearchKey, serde_json::Value>;

// ============================================================================
// Search Keys
// ============================================================================

/// Canonical query string, e.g. `artist:Skin track:Til Morning year:2003`.
/// Used both as the remote query text and as the history cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchKey(String);

impl SearchKey {
    pub(crate) fn new(query: String) -> Self {
        Self(query)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SearchKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What kind of remote entity a lookup is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Track,
    Album,
}

impl SearchTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchTarget::Track => "track",
            SearchTarget::Album => "album",
        }
    }
}

// ============================================================================
// Input Models
// ============================================================================

/// One track as exported from the local library, before cleaning.
/// Every field is optional because tag coverage differs between store
/// purchases and ripped files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTrack {
    pub track_name: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    /// Either `YYYY` or `YYYY-MM-DDTHH:MM:SSZ`.
    pub release_date: Option<String>,
    pub track_number: Option<String>,
    /// Store identifier, `<label>:isrc:<code>`. Only purchased tracks have it.
    pub xid: Option<String>,
    pub content_id: Option<String>,
}

/// One playlist as exported from the local library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPlaylist {
    pub name: String,
    pub items: Vec<RawPlaylistItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPlaylistItem {
    pub track_name: String,
    pub artist: String,
    pub album: Option<String>,
}

/// One track on one playlist. `track_uri` is filled from the linked catalog
/// row with the same original album, artist and track name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub playlist_name: String,
    pub track_name: String,
    pub artist: String,
    pub album: Option<String>,
    pub track_uri: Option<String>,
}

impl PlaylistEntry {
    pub fn new(playlist_name: impl Into<String>, item: RawPlaylistItem) -> Self {
        Self {
            playlist_name: playlist_name.into(),
            track_name: item.track_name,
            artist: item.artist,
            album: item.album,
            track_uri: None,
        }
    }
}

// ============================================================================
// Catalog Models
// ============================================================================

/// Natural key of a catalog row. Uniqueness is enforced by the cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub track_name: String,
    pub artist: String,
    pub release_date: Option<String>,
    pub album: Option<String>,
}

/// One physical track in the local library after cleaning.
///
/// ## Field groups
///
/// - `track_name`, `artist`, `release_date`, `album`: original metadata,
///   never changed after cleaning (natural key).
/// - `search_*`: cleaned values used to build search keys. Mutated by the
///   cleaner and by corrections.
/// - `isrc`, `track_uri`, `artist_uri`, `remote_total_tracks`: track linkage.
///   Either all unset or all taken from one successful track lookup.
/// - `album_uri`: album linkage, set only for albums flagged for bulk add.
/// - `library_total_tracks`, `add_album`: album aggregation outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub track_name: String,
    pub artist: String,
    pub release_date: Option<String>,
    pub album: Option<String>,
    pub content_id: Option<String>,

    pub search_artist: String,
    pub search_track_name: String,
    pub search_album: Option<String>,
    pub search_release_year: Option<String>,

    pub isrc: Option<String>,
    pub track_uri: Option<String>,
    pub artist_uri: Option<String>,
    pub remote_total_tracks: u32,

    pub album_uri: Option<String>,
    pub library_total_tracks: u32,
    pub add_album: bool,
}

impl CatalogRow {
    /// Build a row whose search fields start as copies of the originals.
    pub fn new(
        track_name: impl Into<String>,
        artist: impl Into<String>,
        release_date: Option<String>,
        album: Option<String>,
    ) -> Self {
        let track_name = track_name.into();
        let artist = artist.into();
        Self {
            search_artist: artist.clone(),
            search_track_name: track_name.clone(),
            search_album: album.clone(),
            search_release_year: release_date.clone(),
            track_name,
            artist,
            release_date,
            album,
            ..Self::default()
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            track_name: self.track_name.clone(),
            artist: self.artist.clone(),
            release_date: self.release_date.clone(),
            album: self.album.clone(),
        }
    }

    /// Track lookups are triggered by a missing ISRC only.
    pub fn needs_track_link(&self) -> bool {
        self.isrc.is_none()
    }

    /// Copy every track linkage field from one lookup result.
    pub fn apply_track_match(&mut self, found: &TrackMatch) {
        self.isrc = Some(found.isrc.clone());
        self.track_uri = Some(found.track_uri.clone());
        self.artist_uri = Some(found.artist_uri.clone());
        self.remote_total_tracks = found.total_tracks;
    }
}

/// Fields taken from the first item of a successful track search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMatch {
    pub isrc: String,
    pub track_uri: String,
    pub artist_uri: String,
    pub total_tracks: u32,
}

/// Fields taken from the first item of a successful album search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumMatch {
    pub album_uri: String,
}

/// Position of a row inside a [`Catalog`]. Stable for the life of a run:
/// rows are never removed once linking starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub usize);

/// Owned, ordered row set that every stage mutates by index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    rows: Vec<CatalogRow>,
}

impl Catalog {
    pub fn new(rows: Vec<CatalogRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [CatalogRow] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<CatalogRow> {
        self.rows
    }

    pub fn get(&self, id: RowId) -> Option<&CatalogRow> {
        self.rows.get(id.0)
    }

    pub fn get_mut(&mut self, id: RowId) -> Option<&mut CatalogRow> {
        self.rows.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, &CatalogRow)> {
        self.rows.iter().enumerate().map(|(i, row)| (RowId(i), row))
    }

    /// Select candidate rows; callers then transform and write back by id.
    pub fn ids_where<F>(&self, mut predicate: F) -> Vec<RowId>
    where
        F: FnMut(&CatalogRow) -> bool,
    {
        self.iter()
            .filter(|(_, row)| predicate(row))
            .map(|(id, _)| id)
            .collect()
    }
}

impl From<Vec<CatalogRow>> for Catalog {
    fn from(rows: Vec<CatalogRow>) -> Self {
        Self::new(rows)
    }
}

// ============================================================================
// Statistics (Instrumentation)
// ============================================================================

/// Counters for one linker's lifetime. Cache hits never touch the network
/// or the rate governor.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub rows_considered: usize,
    pub skipped_rows: usize,

    pub cache_hits_success: usize,
    pub cache_hits_failure: usize,

    pub lookups_issued: usize,
    pub matches: usize,
    pub no_matches: usize,
    pub malformed_responses: usize,

    pub rows_linked: usize,
    pub albums_resolved: usize,

    pub history_flushes: usize,
    pub cooldowns: u64,
}

impl LinkStats {
    /// Share of considered rows that ended with linkage populated.
    pub fn link_rate(&self) -> f64 {
        if self.rows_considered == 0 {
            0.0
        } else {
            100.0 * self.rows_linked as f64 / self.rows_considered as f64
        }
    }

    /// Log stats in JSON format
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            tracing::info!("[STATS:{}]\n{}", phase, json);
        }
    }

    /// Persist the counters next to the run's report, with the link rate
    /// alongside so the file reads on its own.
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let mut value = serde_json::to_value(self)?;
        if let Some(fields) = value.as_object_mut() {
            fields.insert("link_rate".to_string(), serde_json::json!(self.link_rate()));
        }
        let json = serde_json::to_string_pretty(&value)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write link stats {}", path.display()))?;
        tracing::info!("Link stats written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_row_copies_search_fields() {
        let row = CatalogRow::new("Til Morning", "Skin", Some("2003".into()), Some("Fleshwounds".into()));
        assert_eq!(row.search_track_name, "Til Morning");
        assert_eq!(row.search_artist, "Skin");
        assert_eq!(row.search_album.as_deref(), Some("Fleshwounds"));
        assert_eq!(row.search_release_year.as_deref(), Some("2003"));
        assert!(row.needs_track_link());
        assert!(row.track_uri.is_none());
    }

    #[test]
    fn test_apply_track_match_sets_all_linkage() {
        let mut row = CatalogRow::new("Til Morning", "Skin", None, None);
        row.apply_track_match(&TrackMatch {
            isrc: "GBAAA0300001".into(),
            track_uri: "spotify:track:1".into(),
            artist_uri: "spotify:artist:1".into(),
            total_tracks: 12,
        });
        assert!(!row.needs_track_link());
        assert_eq!(row.track_uri.as_deref(), Some("spotify:track:1"));
        assert_eq!(row.artist_uri.as_deref(), Some("spotify:artist:1"));
        assert_eq!(row.remote_total_tracks, 12);
    }

    #[test]
    fn test_ids_where_selects_by_predicate() {
        let mut linked = CatalogRow::new("B", "Y", None, None);
        linked.isrc = Some("X".into());
        let catalog = Catalog::new(vec![
            CatalogRow::new("A", "X", None, None),
            linked,
            CatalogRow::new("C", "Z", None, None),
        ]);
        let ids = catalog.ids_where(CatalogRow::needs_track_link);
        assert_eq!(ids, vec![RowId(0), RowId(2)]);
    }

    #[test]
    fn test_link_rate() {
        let stats = LinkStats {
            rows_considered: 4,
            rows_linked: 3,
            ..LinkStats::default()
        };
        assert_eq!(stats.link_rate(), 75.0);
        assert_eq!(LinkStats::default().link_rate(), 0.0);
    }

    #[test]
    fn test_stats_file_includes_link_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = LinkStats {
            rows_considered: 2,
            rows_linked: 1,
            no_matches: 1,
            ..LinkStats::default()
        };

        stats.write_to_file(&path).unwrap();
        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["rows_linked"], 1);
        assert_eq!(written["no_matches"], 1);
        assert_eq!(written["link_rate"], 50.0);

        assert!(stats.write_to_file(&dir.path().join("missing").join("stats.json")).is_err());
    }
}
