//! External search capability and response interpretation.
//!
//! The linker never talks HTTP itself. It is handed a [`CatalogSearch`]
//! implementation at construction and only sees raw JSON payloads, which are
//! interpreted here into a match, a no-match, or a malformed response.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::RefCell;

use crate::config::LinkerConfig;
use crate::error::SearchError;
use crate::models::{AlbumMatch, SearchKey, SearchTarget, TrackMatch};

// ============================================================================
// Capability
// ============================================================================

/// One search call, as sent to the remote catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub target: SearchTarget,
    pub market: &'a str,
    pub offset: u32,
    pub limit: u32,
}

impl<'a> SearchRequest<'a> {
    pub fn for_key(key: &'a SearchKey, target: SearchTarget, config: &'a LinkerConfig) -> Self {
        Self {
            query: key.as_str(),
            target,
            market: &config.market,
            offset: config.result_offset,
            limit: config.result_limit,
        }
    }
}

/// Remote catalog search.
///
/// Implementations return the raw response body. "No results" must come
/// back as a payload with an empty item list, not as an error: errors are
/// reserved for transport and auth failures and abort the batch.
pub trait CatalogSearch {
    fn search(&self, request: &SearchRequest<'_>) -> Result<Value, SearchError>;
}

impl<T: CatalogSearch + ?Sized> CatalogSearch for &T {
    fn search(&self, request: &SearchRequest<'_>) -> Result<Value, SearchError> {
        (**self).search(request)
    }
}

impl<T: CatalogSearch + ?Sized> CatalogSearch for Box<T> {
    fn search(&self, request: &SearchRequest<'_>) -> Result<Value, SearchError> {
        (**self).search(request)
    }
}

/// Payload for a search that found nothing.
pub fn empty_response(target: SearchTarget) -> Value {
    match target {
        SearchTarget::Track => json!({"tracks": {"items": []}}),
        SearchTarget::Album => json!({"albums": {"items": []}}),
    }
}

/// Answers from a fixed table of captured responses; unknown queries get an
/// empty result. Every query is recorded, which makes it usable both for
/// offline dry runs and as a call-count spy.
#[derive(Debug, Default)]
pub struct ReplaySearch {
    responses: FxHashMap<(SearchTarget, String), Value>,
    transport_failures: FxHashSet<String>,
    calls: RefCell<Vec<String>>,
}

impl ReplaySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, target: SearchTarget, query: &str, payload: Value) -> Self {
        self.responses.insert((target, query.to_string()), payload);
        self
    }

    /// Make `query` fail the way a dropped connection would.
    pub fn with_transport_failure(mut self, query: &str) -> Self {
        self.transport_failures.insert(query.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl CatalogSearch for ReplaySearch {
    fn search(&self, request: &SearchRequest<'_>) -> Result<Value, SearchError> {
        self.calls.borrow_mut().push(request.query.to_string());
        if self.transport_failures.contains(request.query) {
            return Err(format!("connection reset while searching '{}'", request.query).into());
        }
        Ok(self
            .responses
            .get(&(request.target, request.query.to_string()))
            .cloned()
            .unwrap_or_else(|| empty_response(request.target)))
    }
}

// ============================================================================
// Interpretation
// ============================================================================

/// What a raw payload means for the row that asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation<T> {
    Matched(T),
    /// The service answered with an empty item list.
    NoMatch,
    /// The payload could not be decoded; carries the reason for the log.
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    uri: String,
    #[serde(default)]
    external_ids: ExternalIds,
    #[serde(default)]
    artists: Vec<UriRef>,
    album: TrackAlbum,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalIds {
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UriRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct TrackAlbum {
    total_tracks: u32,
}

/// Top-level `items` list under `section`, or why it is missing.
fn result_items<'a>(payload: &'a Value, section: &str) -> Result<&'a [Value], String> {
    match payload.get(section).and_then(|s| s.get("items")) {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(format!("{}.items is not a list", section)),
        None => Err(format!("missing {}.items", section)),
    }
}

/// Read `tracks.items[0]` of a track search.
pub fn interpret_track_response(payload: &Value) -> Interpretation<TrackMatch> {
    let items = match result_items(payload, "tracks") {
        Ok(items) => items,
        Err(reason) => return Interpretation::Malformed(reason),
    };
    let Some(first) = items.first() else {
        return Interpretation::NoMatch;
    };

    let item = match TrackItem::deserialize(first) {
        Ok(item) => item,
        Err(e) => return Interpretation::Malformed(format!("tracks.items[0]: {}", e)),
    };
    let Some(isrc) = item.external_ids.isrc else {
        return Interpretation::Malformed("tracks.items[0] has no external_ids.isrc".to_string());
    };
    let Some(artist) = item.artists.into_iter().next() else {
        return Interpretation::Malformed("tracks.items[0] has no artists".to_string());
    };

    Interpretation::Matched(TrackMatch {
        isrc,
        track_uri: item.uri,
        artist_uri: artist.uri,
        total_tracks: item.album.total_tracks,
    })
}

/// Read `albums.items[0].uri` of an album search.
pub fn interpret_album_response(payload: &Value) -> Interpretation<AlbumMatch> {
    let items = match result_items(payload, "albums") {
        Ok(items) => items,
        Err(reason) => return Interpretation::Malformed(reason),
    };
    let Some(first) = items.first() else {
        return Interpretation::NoMatch;
    };

    match UriRef::deserialize(first) {
        Ok(album) => Interpretation::Matched(AlbumMatch {
            album_uri: album.uri,
        }),
        Err(e) => Interpretation::Malformed(format!("albums.items[0]: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_payload() -> Value {
        json!({
            "tracks": {
                "items": [{
                    "uri": "spotify:track:5Wsz1OkQ6Zx2xJjOOpvmqT",
                    "external_ids": {"isrc": "GBAAA0300001"},
                    "artists": [{"uri": "spotify:artist:3WbKKXxTMuRCeOdaVCCYsA"}],
                    "album": {"total_tracks": 12}
                }]
            }
        })
    }

    #[test]
    fn test_track_match() {
        let found = interpret_track_response(&track_payload());
        assert_eq!(
            found,
            Interpretation::Matched(TrackMatch {
                isrc: "GBAAA0300001".to_string(),
                track_uri: "spotify:track:5Wsz1OkQ6Zx2xJjOOpvmqT".to_string(),
                artist_uri: "spotify:artist:3WbKKXxTMuRCeOdaVCCYsA".to_string(),
                total_tracks: 12,
            })
        );
    }

    #[test]
    fn test_empty_items_is_no_match() {
        assert_eq!(
            interpret_track_response(&empty_response(SearchTarget::Track)),
            Interpretation::NoMatch
        );
        assert_eq!(
            interpret_album_response(&empty_response(SearchTarget::Album)),
            Interpretation::NoMatch
        );
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        assert!(matches!(
            interpret_track_response(&json!({"error": "nope"})),
            Interpretation::Malformed(_)
        ));
        assert!(matches!(
            interpret_track_response(&json!({"tracks": {"items": {}}})),
            Interpretation::Malformed(_)
        ));
        assert!(matches!(
            interpret_track_response(&json!({"tracks": {"items": [{"uri": 7}]}})),
            Interpretation::Malformed(_)
        ));
        // a track payload is not an album payload
        assert!(matches!(
            interpret_album_response(&track_payload()),
            Interpretation::Malformed(_)
        ));
    }

    #[test]
    fn test_track_without_isrc_is_malformed() {
        let mut payload = track_payload();
        payload["tracks"]["items"][0]["external_ids"] = json!({});
        assert_eq!(
            interpret_track_response(&payload),
            Interpretation::Malformed("tracks.items[0] has no external_ids.isrc".to_string())
        );

        let mut payload = track_payload();
        payload["tracks"]["items"][0]["artists"] = json!([]);
        assert!(matches!(
            interpret_track_response(&payload),
            Interpretation::Malformed(_)
        ));
    }

    #[test]
    fn test_album_match() {
        let payload = json!({"albums": {"items": [{"uri": "spotify:album:63SYDOduS7UPFCbRo7g9cy"}]}});
        assert_eq!(
            interpret_album_response(&payload),
            Interpretation::Matched(AlbumMatch {
                album_uri: "spotify:album:63SYDOduS7UPFCbRo7g9cy".to_string()
            })
        );
    }

    #[test]
    fn test_replay_search_records_calls() {
        let search = ReplaySearch::new()
            .with_response(SearchTarget::Track, "artist:Skin track:Til Morning", track_payload())
            .with_transport_failure("artist:Gene track:Olympian");
        let config = LinkerConfig::default();

        let hit = SearchKey::from("artist:Skin track:Til Morning");
        let miss = SearchKey::from("artist:Suede track:Pantomime Horse");
        let broken = SearchKey::from("artist:Gene track:Olympian");

        let via_ref: &dyn CatalogSearch = &search;
        assert_eq!(
            via_ref
                .search(&SearchRequest::for_key(&hit, SearchTarget::Track, &config))
                .unwrap(),
            track_payload()
        );
        assert_eq!(
            search
                .search(&SearchRequest::for_key(&miss, SearchTarget::Track, &config))
                .unwrap(),
            empty_response(SearchTarget::Track)
        );
        assert!(search
            .search(&SearchRequest::for_key(&broken, SearchTarget::Track, &config))
            .is_err());
        assert_eq!(search.call_count(), 3);
    }

    #[test]
    fn test_request_carries_config() {
        let config = LinkerConfig {
            market: "US".to_string(),
            result_limit: 5,
            ..LinkerConfig::default()
        };
        let key = SearchKey::from("album:Coming Up");
        let request = SearchRequest::for_key(&key, SearchTarget::Album, &config);
        assert_eq!(request.market, "US");
        assert_eq!(request.limit, 5);
        assert_eq!(request.offset, 0);
        assert_eq!(request.target, SearchTarget::Album);
    }
}
