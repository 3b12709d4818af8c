//! End-of-run report: which albums, tracks and playlist entries could not be
//! linked.

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::path::Path;

use crate::models::{Catalog, CatalogRow, PlaylistEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAlbum {
    pub search_album: String,
    /// Local rows waiting on this album.
    pub rows: usize,
    pub tracks: Vec<FailedTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTrack {
    pub track_name: String,
    pub artist: String,
    pub album: Option<String>,
    pub search_artist: String,
    pub search_track_name: String,
    pub search_release_year: Option<String>,
}

impl From<&CatalogRow> for FailedTrack {
    fn from(row: &CatalogRow) -> Self {
        Self {
            track_name: row.track_name.clone(),
            artist: row.artist.clone(),
            album: row.album.clone(),
            search_artist: row.search_artist.clone(),
            search_track_name: row.search_track_name.clone(),
            search_release_year: row.search_release_year.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub rows_total: usize,
    pub rows_linked: usize,
    /// Distinct albums flagged for add that got an identifier.
    pub albums_requested: usize,
    /// Distinct albums flagged for add that did not.
    pub albums_failed: usize,
    pub failed_albums: Vec<FailedAlbum>,
    /// Unlinked rows that are not covered by a requested album.
    pub failed_tracks: Vec<FailedTrack>,
    pub playlist_entries_total: usize,
    /// Playlist entries still without a track uri after the join.
    pub failed_playlist_entries: Vec<PlaylistEntry>,
}

impl LinkReport {
    pub fn build(catalog: &Catalog) -> Self {
        let mut requested: FxHashSet<&str> = FxHashSet::default();
        let mut failed_index: FxHashMap<&str, usize> = FxHashMap::default();
        let mut failed_albums: Vec<FailedAlbum> = Vec::new();

        for row in catalog.rows().iter().filter(|row| row.add_album) {
            let album = row.search_album.as_deref().unwrap_or_default();
            if row.album_uri.is_some() {
                requested.insert(album);
            } else {
                let slot = *failed_index.entry(album).or_insert_with(|| {
                    failed_albums.push(FailedAlbum {
                        search_album: album.to_string(),
                        rows: 0,
                        tracks: Vec::new(),
                    });
                    failed_albums.len() - 1
                });
                failed_albums[slot].rows += 1;
                failed_albums[slot].tracks.push(FailedTrack::from(row));
            }
        }

        let failed_tracks = catalog
            .rows()
            .iter()
            .filter(|row| !(row.add_album && row.album_uri.is_some()))
            .filter(|row| row.track_uri.is_none())
            .map(FailedTrack::from)
            .collect();

        Self {
            rows_total: catalog.len(),
            rows_linked: catalog.rows().iter().filter(|row| row.track_uri.is_some()).count(),
            albums_requested: requested.len(),
            albums_failed: failed_albums.len(),
            failed_albums,
            failed_tracks,
            playlist_entries_total: 0,
            failed_playlist_entries: Vec::new(),
        }
    }

    /// Add the playlist section from entries that went through
    /// [`crate::clean::attach_track_uris`].
    pub fn with_playlists(mut self, entries: &[PlaylistEntry]) -> Self {
        self.playlist_entries_total = entries.len();
        self.failed_playlist_entries = entries
            .iter()
            .filter(|entry| entry.track_uri.is_none())
            .cloned()
            .collect();
        self
    }

    pub fn log_summary(&self) {
        tracing::info!("Tracks linked: {}/{}", self.rows_linked, self.rows_total);
        tracing::info!("Albums successfully requested: {}", self.albums_requested);
        tracing::info!("Albums failed: {}", self.albums_failed);
        tracing::info!("Tracks failed: {}", self.failed_tracks.len());
        if self.playlist_entries_total > 0 {
            tracing::info!(
                "Playlist entries failed: {}/{}",
                self.failed_playlist_entries.len(),
                self.playlist_entries_total
            );
        }
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        tracing::info!("Report written to {}", path.display());
        Ok(())
    }
}
