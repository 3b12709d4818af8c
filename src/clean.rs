//! Library clean-up ahead of linking.
//!
//! Turns raw exported tracks into catalog rows whose search fields are in a
//! shape the remote search matches well. All rules are deterministic string
//! transforms; none of them touch the original metadata, which stays the
//! natural key of the row.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;

use crate::config::{CleanerConfig, Corrections};
use crate::models::{Catalog, CatalogRow, PlaylistEntry, RawPlaylist, RawTrack};
use crate::progress::create_spinner;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Square or round bracketed content with one optional leading space:
/// "Suede [Disc 1]" → "Suede", "Pink (track )" → "Pink". Greedy, so
/// everything from the first opening bracket to the last closing one goes.
pub static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s?\[.+\]|\s?\(.+\)").unwrap());

// ============================================================================
// FIELD RULES
// ============================================================================

/// ISRC declared by the store, from an xid of the form
/// `<label>:isrc:<code>`.
pub fn isrc_from_xid(xid: &str) -> Option<String> {
    xid.rsplit(':')
        .next()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
}

/// `YYYY-MM-DDTHH:MM:SSZ` → `YYYY`; a bare `YYYY` is kept as is.
pub fn release_year(release_date: &str) -> String {
    if release_date.len() > 4 {
        release_date
            .split('-')
            .next()
            .unwrap_or(release_date)
            .to_string()
    } else {
        release_date.to_string()
    }
}

pub fn strip_bracketed(value: &str) -> String {
    BRACKETED.replace_all(value, "").into_owned()
}

pub fn remove_characters(value: &str, characters: &str) -> String {
    value.chars().filter(|c| !characters.contains(*c)).collect()
}

/// Cut a multi-artist credit down to its first artist. Delimiters are
/// applied in order, so "A With B & C" loses both collaborators.
pub fn first_artist(value: &str, delimiters: &[String]) -> String {
    delimiters
        .iter()
        .fold(value, |artist, delimiter| {
            artist.split(delimiter.as_str()).next().unwrap_or(artist)
        })
        .to_string()
}

/// Read an exported library manifest: a JSON array of track objects.
pub fn read_manifest(path: &Path) -> Result<Vec<RawTrack>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library manifest {}", path.display()))?;
    let tracks: Vec<RawTrack> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse library manifest {}", path.display()))?;
    tracing::info!("Read {} tracks from {}", tracks.len(), path.display());
    Ok(tracks)
}

// ============================================================================
// CLEANER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DataCleaner {
    config: CleanerConfig,
}

impl DataCleaner {
    pub fn new(config: CleanerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Full first-round clean: filter, build rows, normalize search fields,
    /// dedupe, split artists, apply artist and track corrections.
    pub fn clean(&self, raw: Vec<RawTrack>) -> Catalog {
        let spinner = create_spinner("Cleaning library");
        let total = raw.len();

        let kept: Vec<RawTrack> = raw
            .into_iter()
            .filter(|track| track.track_number.as_deref().is_some_and(|n| !n.trim().is_empty()))
            .filter(|track| {
                let has_tag_isrc = track.xid.as_deref().and_then(isrc_from_xid).is_some();
                track.track_name.is_some() || has_tag_isrc
            })
            .collect();
        let dropped = total - kept.len();

        let mut rows: Vec<CatalogRow> = kept.into_iter().map(Self::to_row).collect();

        let remove = self.config.remove_characters.as_str();
        rows.par_iter_mut().for_each(|row| {
            if let Some(date) = row.release_date.as_deref() {
                row.search_release_year = Some(release_year(date));
            }
            row.search_track_name = strip_bracketed(&row.search_track_name);
            row.search_album = row.search_album.as_deref().map(strip_bracketed);

            row.search_artist = remove_characters(&row.search_artist, remove);
            row.search_track_name = remove_characters(&row.search_track_name, remove);
            row.search_album = row
                .search_album
                .as_deref()
                .map(|album| remove_characters(album, remove));
        });

        let before_dedupe = rows.len();
        let mut seen = FxHashSet::default();
        rows.retain(|row| seen.insert(row.natural_key()));
        let duplicates = before_dedupe - rows.len();

        let delimiters = &self.config.artist_delimiters;
        rows.par_iter_mut().for_each(|row| {
            row.search_artist = first_artist(&row.search_artist, delimiters);
        });

        let mut catalog = Catalog::new(rows);
        self.apply_corrections(&mut catalog);

        spinner.finish_with_message(format!("Cleaned library: {} rows", catalog.len()));
        tracing::info!(
            "Cleaned {} tracks: {} kept, {} dropped (no track number or no name), {} duplicates removed",
            total,
            catalog.len(),
            dropped,
            duplicates
        );
        catalog
    }

    fn to_row(track: RawTrack) -> CatalogRow {
        let artist = track.artist.or(track.album_artist).unwrap_or_default();
        let mut row = CatalogRow::new(
            track.track_name.unwrap_or_default(),
            artist,
            track.release_date,
            track.album,
        );
        row.content_id = track.content_id;
        row
    }

    /// Apply artist, track and content-id corrections to the search fields.
    /// Track corrections match on the original artist, since the search
    /// artist may itself have been corrected.
    pub fn apply_corrections(&self, catalog: &mut Catalog) {
        let corrections = &self.config.corrections;
        if corrections.is_empty() {
            return;
        }
        let artists: FxHashMap<&str, &str> = corrections
            .artists
            .iter()
            .map(|c| (c.from.as_str(), c.to.as_str()))
            .collect();
        let tracks: FxHashMap<(&str, &str), &str> = corrections
            .tracks
            .iter()
            .map(|c| ((c.artist.as_str(), c.from.as_str()), c.to.as_str()))
            .collect();
        let by_content_id: FxHashMap<&str, &str> = corrections
            .tracks_by_content_id
            .iter()
            .map(|c| (c.content_id.as_str(), c.to.as_str()))
            .collect();

        catalog.rows_mut().par_iter_mut().for_each(|row| {
            if let Some(to) = artists.get(row.search_artist.as_str()) {
                row.search_artist = to.to_string();
            }
            if let Some(to) = tracks.get(&(row.artist.as_str(), row.search_track_name.as_str())) {
                row.search_track_name = to.to_string();
            }
            if let Some(to) = row
                .content_id
                .as_deref()
                .and_then(|id| by_content_id.get(id))
            {
                row.search_track_name = to.to_string();
            }
        });
        log_corrections("artist/track", corrections);
    }

    /// Album corrections run separately, right before album aggregation, so
    /// that they see the final search_album values.
    pub fn apply_album_corrections(&self, catalog: &mut Catalog) {
        let corrections = &self.config.corrections;
        if corrections.albums.is_empty() {
            return;
        }
        let albums: FxHashMap<&str, &str> = corrections
            .albums
            .iter()
            .map(|c| (c.from.as_str(), c.to.as_str()))
            .collect();

        catalog.rows_mut().par_iter_mut().for_each(|row| {
            if let Some(to) = row.search_album.as_deref().and_then(|a| albums.get(a)) {
                row.search_album = Some(to.to_string());
            }
        });
        log_corrections("album", corrections);
    }
}

// ============================================================================
// PLAYLISTS
// ============================================================================

/// Read an exported playlist manifest (a JSON array of `{name, items}`
/// objects) into one entry per playlist track, skipping the playlists named
/// in `exclude`.
pub fn read_playlists(path: &Path, exclude: &[String]) -> Result<Vec<PlaylistEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read playlist manifest {}", path.display()))?;
    let playlists: Vec<RawPlaylist> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse playlist manifest {}", path.display()))?;

    let total = playlists.len();
    let kept: Vec<RawPlaylist> = playlists
        .into_iter()
        .filter(|playlist| !exclude.contains(&playlist.name))
        .collect();
    let excluded = total - kept.len();
    let entries: Vec<PlaylistEntry> = kept
        .into_iter()
        .flat_map(|playlist| {
            let name = playlist.name;
            playlist
                .items
                .into_iter()
                .map(move |item| PlaylistEntry::new(name.clone(), item))
        })
        .collect();
    tracing::info!(
        "Read {} playlist entries from {} ({} playlists, {} excluded)",
        entries.len(),
        path.display(),
        total,
        excluded
    );
    Ok(entries)
}

/// Copy `track_uri` onto playlist entries from the catalog row with the same
/// original album, artist and track name. When several rows share those
/// fields (different release dates), the first linked one wins. Entries
/// with no linked row are left without a uri. Returns the number linked.
pub fn attach_track_uris(entries: &mut [PlaylistEntry], catalog: &Catalog) -> usize {
    let mut uris: FxHashMap<(&str, &str, Option<&str>), &str> = FxHashMap::default();
    for row in catalog.rows() {
        if let Some(uri) = row.track_uri.as_deref() {
            uris.entry((row.track_name.as_str(), row.artist.as_str(), row.album.as_deref()))
                .or_insert(uri);
        }
    }

    let mut linked = 0;
    for entry in entries.iter_mut() {
        let key = (entry.track_name.as_str(), entry.artist.as_str(), entry.album.as_deref());
        entry.track_uri = uris.get(&key).map(|uri| uri.to_string());
        if entry.track_uri.is_some() {
            linked += 1;
        }
    }
    tracing::info!("Playlist entries linked: {}/{}", linked, entries.len());
    linked
}

fn log_corrections(kind: &str, corrections: &Corrections) {
    tracing::debug!(
        "Applied {} corrections ({} artist, {} track, {} content id, {} album rules loaded)",
        kind,
        corrections.artists.len(),
        corrections.tracks.len(),
        corrections.tracks_by_content_id.len(),
        corrections.albums.len()
    );
}
