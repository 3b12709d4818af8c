//! Search key construction.
//!
//! Keys double as the remote query text and as the history cache key, so
//! two rows with identical search fields must always produce the same key.
//! Components are trimmed and NFC-composed before formatting: tags written
//! by different tools spell "é" as one code point or as "e" plus a combining
//! accent, and those must not become two cache entries.

use unicode_normalization::UnicodeNormalization;

use crate::models::SearchKey;

/// Default dominance threshold for qualifying an album search with an
/// artist. Past migrations ran with both 0.5 and 0.75. Override through
/// `LinkerConfig::album_artist_dominance`.
pub const ALBUM_ARTIST_DOMINANCE_THRESHOLD: f64 = 0.5;

fn clean_component(value: &str) -> String {
    value.trim().nfc().collect()
}

/// `artist:<artist> track:<track>`, plus ` year:<year>` when a release year
/// is known. A row that gains a year gets a new key and is looked up again.
pub fn build_track_key(artist: &str, track: &str, release_year: Option<&str>) -> SearchKey {
    let mut query = format!(
        "artist:{} track:{}",
        clean_component(artist),
        clean_component(track)
    );
    if let Some(year) = release_year.map(clean_component).filter(|y| !y.is_empty()) {
        query.push_str(" year:");
        query.push_str(&year);
    }
    SearchKey::new(query)
}

/// Share of an album's local tracks attributable to a single artist,
/// estimated from the track and distinct-artist counts: every artist beyond
/// the first is assumed to account for one track.
pub fn dominant_artist_fraction(local_track_count: u32, distinct_artist_count: u32) -> f64 {
    if local_track_count == 0 {
        return 0.0;
    }
    let dominant = local_track_count.saturating_sub(distinct_artist_count);
    dominant as f64 / local_track_count as f64
}

/// Album key using [`ALBUM_ARTIST_DOMINANCE_THRESHOLD`].
pub fn build_album_key(
    artist: &str,
    album: &str,
    local_track_count: u32,
    distinct_artist_count: u32,
) -> SearchKey {
    build_album_key_with_threshold(
        artist,
        album,
        local_track_count,
        distinct_artist_count,
        ALBUM_ARTIST_DOMINANCE_THRESHOLD,
    )
}

/// `album:<album> artist:<artist>` when one artist dominates the album
/// (fraction strictly above `threshold`), otherwise `album:<album>` so that
/// multi-artist compilations are not filtered out by the wrong artist. A
/// blank artist never qualifies.
pub fn build_album_key_with_threshold(
    artist: &str,
    album: &str,
    local_track_count: u32,
    distinct_artist_count: u32,
    threshold: f64,
) -> SearchKey {
    let album = clean_component(album);
    let artist = clean_component(artist);
    if !artist.is_empty()
        && dominant_artist_fraction(local_track_count, distinct_artist_count) > threshold
    {
        SearchKey::new(format!("album:{} artist:{}", album, artist))
    } else {
        SearchKey::new(format!("album:{}", album))
    }
}
