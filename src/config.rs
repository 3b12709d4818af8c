//! Runtime configuration for the cleaning and linking stages.
//!
//! Every field has a default matching the values the migration has been run
//! with, so an empty JSON object (`{}`) is a valid config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::LinkError;
use crate::search_key::ALBUM_ARTIST_DOMINANCE_THRESHOLD;

/// Largest page size the remote search endpoint accepts.
pub const MAX_RESULT_LIMIT: u32 = 50;

// ============================================================================
// Linker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Market code sent with every search. "GB" resolves far more of a UK
    /// library than "ES" did.
    pub market: String,
    pub result_limit: u32,
    pub result_offset: u32,
    /// Network lookups allowed before the governor pauses.
    pub requests_before_cooldown: u32,
    pub cooldown_ms: u64,
    /// Save the history after this many new entries. 0 saves only at the end
    /// of each batch.
    pub history_flush_every: usize,
    /// Fraction of an album's tracks that must belong to one artist before
    /// the album search is qualified with that artist.
    pub album_artist_dominance: f64,
    /// Local track count at which an album is bulk-added regardless of the
    /// remote track count.
    pub album_bulk_threshold: u32,
    /// search_album values that are never bulk-added (soundtracks and
    /// compilations whose remote track lists never line up).
    pub ignored_albums: Vec<String>,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            market: "GB".to_string(),
            result_limit: 10,
            result_offset: 0,
            requests_before_cooldown: 100,
            cooldown_ms: 2_000,
            history_flush_every: 50,
            album_artist_dominance: ALBUM_ARTIST_DOMINANCE_THRESHOLD,
            album_bulk_threshold: 6,
            ignored_albums: Vec::new(),
        }
    }
}

impl LinkerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read linker config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse linker config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), LinkError> {
        if self.market.trim().is_empty() {
            return Err(LinkError::Config("market must not be empty".to_string()));
        }
        if self.result_limit == 0 || self.result_limit > MAX_RESULT_LIMIT {
            return Err(LinkError::Config(format!(
                "result_limit must be within 1..={}, got {}",
                MAX_RESULT_LIMIT, self.result_limit
            )));
        }
        if !(self.album_artist_dominance > 0.0 && self.album_artist_dominance <= 1.0) {
            return Err(LinkError::Config(format!(
                "album_artist_dominance must be within (0, 1], got {}",
                self.album_artist_dominance
            )));
        }
        if self.album_bulk_threshold == 0 {
            return Err(LinkError::Config(
                "album_bulk_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ============================================================================
// Cleaner
// ============================================================================

/// Replace `from` with `to` in search_artist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCorrection {
    pub from: String,
    pub to: String,
}

/// Replace search_track_name `from` with `to` for one artist. Track names
/// are shared between artists, so the original (uncorrected) artist is part
/// of the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackCorrection {
    pub artist: String,
    pub from: String,
    pub to: String,
}

/// Set search_track_name for a track identified by its store content id.
/// Covers tracks whose tags carry no usable name at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIdCorrection {
    pub content_id: String,
    pub to: String,
}

/// Replace `from` with `to` in search_album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumCorrection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corrections {
    pub artists: Vec<ArtistCorrection>,
    pub tracks: Vec<TrackCorrection>,
    pub tracks_by_content_id: Vec<ContentIdCorrection>,
    pub albums: Vec<AlbumCorrection>,
}

impl Corrections {
    pub fn is_empty(&self) -> bool {
        self.artists.is_empty()
            && self.tracks.is_empty()
            && self.tracks_by_content_id.is_empty()
            && self.albums.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Characters deleted from every search field. Single quotes break the
    /// remote search, so all quote-like characters go.
    pub remove_characters: String,
    /// Multi-artist credits are cut at the first of these delimiters.
    pub artist_delimiters: Vec<String>,
    pub corrections: Corrections,
    /// Playlists left out when reading the playlist manifest (smart lists
    /// such as "Recently Added" that only mirror the library).
    pub playlists_exclude: Vec<String>,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            remove_characters: "'`´’".to_string(),
            artist_delimiters: vec![
                " Feat.".to_string(),
                " &".to_string(),
                " With".to_string(),
            ],
            corrections: Corrections::default(),
            playlists_exclude: Vec::new(),
        }
    }
}

impl CleanerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cleaner config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse cleaner config {}", path.display()))
    }
}
