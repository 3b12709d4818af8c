//! Record linker: resolves catalog rows against the remote search.
//!
//! Every lookup follows the same protocol, whatever the target:
//!
//! 1. Build the search key from the row's search fields.
//! 2. Known failure: stop, the row stays unlinked.
//! 3. Stored success: replay the payload into the row, no network call.
//! 4. Otherwise pass the rate governor and call the search capability.
//! 5. Interpret the payload. A match is recorded as a success and applied;
//!    an empty result or an undecodable one is recorded as a failure.
//!
//! History is saved every `history_flush_every` new entries and at the end
//! of each batch. A transport error from the search capability saves what
//! has been gathered so far and then aborts the batch.

use serde_json::Value;
use std::time::Instant;

use crate::album::{AlbumAggregate, AlbumPolicy};
use crate::config::LinkerConfig;
use crate::error::{LinkError, Result};
use crate::history::{HistoryLookup, HistoryStore, RequestHistory};
use crate::governor::RateGovernor;
use crate::models::{Catalog, CatalogRow, LinkStats, RowId, SearchKey, SearchTarget};
use crate::progress::{create_progress_bar, format_duration, log_progress};
use crate::search::{
    interpret_album_response, interpret_track_response, CatalogSearch, Interpretation,
    SearchRequest,
};
use crate::search_key::build_track_key;

const PROGRESS_LOG_INTERVAL: u64 = 100;

pub struct RecordLinker<S: CatalogSearch> {
    search: S,
    store: HistoryStore,
    history: RequestHistory,
    governor: RateGovernor,
    policy: AlbumPolicy,
    config: LinkerConfig,
    stats: LinkStats,
    /// History entries changed since the last save.
    unsaved: usize,
}

impl<S: CatalogSearch> RecordLinker<S> {
    /// Validate the config and load the persisted history from `store`.
    pub fn new(search: S, store: HistoryStore, config: LinkerConfig) -> Result<Self> {
        config.validate()?;
        let history = store.load()?;
        Self::with_history(search, store, history, config)
    }

    /// Start from an already loaded (or hand-built) history.
    pub fn with_history(
        search: S,
        store: HistoryStore,
        history: RequestHistory,
        config: LinkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            search,
            store,
            history,
            governor: RateGovernor::from_config(&config),
            policy: AlbumPolicy::from_config(&config),
            config,
            stats: LinkStats::default(),
            unsaved: 0,
        })
    }

    pub fn search(&self) -> &S {
        &self.search
    }

    pub fn history(&self) -> &RequestHistory {
        &self.history
    }

    pub fn into_history(self) -> RequestHistory {
        self.history
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    pub fn policy(&self) -> &AlbumPolicy {
        &self.policy
    }

    // ========================================================================
    // Track linking
    // ========================================================================

    /// Look up every row that has no ISRC yet. Rows without a match keep
    /// their linkage unset. Returns the number of rows linked.
    pub fn link_missing_identifiers(&mut self, catalog: &mut Catalog) -> Result<usize> {
        let ids = catalog.ids_where(CatalogRow::needs_track_link);
        tracing::info!(
            "Linking {} of {} rows with no ISRC",
            ids.len(),
            catalog.len()
        );
        self.link_rows(catalog, &ids, "Linking tracks")
    }

    /// Look up only the rows whose search artist and track equal the given
    /// pair, linked or not. Used to re-resolve a row after a correction.
    pub fn link_one(&mut self, catalog: &mut Catalog, artist: &str, track: &str) -> Result<usize> {
        let ids = catalog.ids_where(|row| row.search_artist == artist && row.search_track_name == track);
        if ids.is_empty() {
            tracing::warn!("No rows with search artist '{}' and track '{}'", artist, track);
        }
        self.link_rows(catalog, &ids, "Linking single track")
    }

    fn link_rows(&mut self, catalog: &mut Catalog, ids: &[RowId], phase: &str) -> Result<usize> {
        let start = Instant::now();
        let total = ids.len() as u64;
        let pb = create_progress_bar(total, phase);
        let mut linked = 0usize;

        for (done, &id) in ids.iter().enumerate() {
            if let Some(key) = catalog.get(id).and_then(|row| self.track_key(row)) {
                if let Some(found) = self.resolve(&key, SearchTarget::Track, interpret_track_response)? {
                    if let Some(row) = catalog.get_mut(id) {
                        row.apply_track_match(&found);
                        linked += 1;
                        self.stats.rows_linked += 1;
                    }
                }
            }
            pb.inc(1);
            log_progress(phase, done as u64 + 1, total, PROGRESS_LOG_INTERVAL);
        }

        pb.finish_with_message(format!("{}: linked {}/{}", phase, linked, total));
        self.finish_batch(phase)?;
        tracing::info!(
            "{}: linked {}/{} rows in {}",
            phase,
            linked,
            total,
            format_duration(start.elapsed())
        );
        Ok(linked)
    }

    /// Key for a track lookup, or `None` (counted and logged) when the row
    /// lacks the fields a key needs.
    fn track_key(&mut self, row: &CatalogRow) -> Option<SearchKey> {
        self.stats.rows_considered += 1;
        if row.search_artist.trim().is_empty() || row.search_track_name.trim().is_empty() {
            tracing::warn!(
                "Skipping '{}' by '{}': empty search artist or track name",
                row.track_name,
                row.artist
            );
            self.stats.skipped_rows += 1;
            return None;
        }
        Some(build_track_key(
            &row.search_artist,
            &row.search_track_name,
            row.search_release_year.as_deref(),
        ))
    }

    // ========================================================================
    // Album linking
    // ========================================================================

    /// Flag albums for bulk add, then resolve one album identifier per
    /// flagged album and copy it to every row of that album. Albums whose
    /// rows all carry an identifier already are not looked up again.
    /// Returns the number of albums resolved.
    pub fn resolve_album_identifiers(&mut self, catalog: &mut Catalog) -> Result<usize> {
        let start = Instant::now();
        let groups: Vec<AlbumAggregate> = self
            .policy
            .mark_albums(catalog)
            .into_iter()
            .filter(|group| self.policy.should_add_album(group))
            .filter(|group| {
                group
                    .rows
                    .iter()
                    .any(|&id| catalog.get(id).is_some_and(|row| row.album_uri.is_none()))
            })
            .collect();

        let phase = "Resolving albums";
        let total = groups.len() as u64;
        let pb = create_progress_bar(total, phase);
        let mut resolved = 0usize;

        for (done, group) in groups.iter().enumerate() {
            let key = group.search_key(self.config.album_artist_dominance);
            if let Some(found) = self.resolve(&key, SearchTarget::Album, interpret_album_response)? {
                for &id in &group.rows {
                    if let Some(row) = catalog.get_mut(id) {
                        if row.album_uri.is_none() {
                            row.album_uri = Some(found.album_uri.clone());
                        }
                    }
                }
                resolved += 1;
                self.stats.albums_resolved += 1;
            }
            pb.inc(1);
            log_progress(phase, done as u64 + 1, total, PROGRESS_LOG_INTERVAL);
        }

        pb.finish_with_message(format!("{}: resolved {}/{}", phase, resolved, total));
        self.finish_batch(phase)?;
        tracing::info!(
            "{}: resolved {}/{} albums in {}",
            phase,
            resolved,
            total,
            format_duration(start.elapsed())
        );
        Ok(resolved)
    }

    // ========================================================================
    // Resolution protocol
    // ========================================================================

    fn resolve<T>(
        &mut self,
        key: &SearchKey,
        target: SearchTarget,
        interpret: fn(&Value) -> Interpretation<T>,
    ) -> Result<Option<T>> {
        match self.history.lookup(key) {
            HistoryLookup::Failure => {
                self.stats.cache_hits_failure += 1;
                tracing::debug!("Cached failure for '{}'", key);
                return Ok(None);
            }
            HistoryLookup::Success(payload) => {
                self.stats.cache_hits_success += 1;
                tracing::debug!("Cached success for '{}'", key);
                return Ok(match interpret(payload) {
                    Interpretation::Matched(found) => Some(found),
                    Interpretation::NoMatch | Interpretation::Malformed(_) => {
                        tracing::warn!(
                            "Stored {} payload for '{}' no longer decodes; leaving row unlinked",
                            target.as_str(),
                            key
                        );
                        None
                    }
                });
            }
            HistoryLookup::Miss => {}
        }

        self.governor.before_call();
        self.stats.cooldowns = self.governor.cooldowns();
        self.stats.lookups_issued += 1;

        let request = SearchRequest::for_key(key, target, &self.config);
        let payload = match self.search.search(&request) {
            Ok(payload) => payload,
            Err(source) => {
                tracing::error!("Search for '{}' failed: {}", key, source);
                self.flush_best_effort();
                return Err(LinkError::Search {
                    query: key.to_string(),
                    source,
                });
            }
        };

        match interpret(&payload) {
            Interpretation::Matched(found) => {
                self.stats.matches += 1;
                tracing::info!("Matched {} '{}'", target.as_str(), key);
                let changed = self.history.record_success(key.clone(), payload);
                self.note_change(changed)?;
                Ok(Some(found))
            }
            Interpretation::NoMatch => {
                self.stats.no_matches += 1;
                tracing::warn!("No match for {} '{}'", target.as_str(), key);
                let changed = self.history.record_failure(key.clone());
                self.note_change(changed)?;
                Ok(None)
            }
            Interpretation::Malformed(reason) => {
                self.stats.malformed_responses += 1;
                tracing::warn!(
                    "Unparseable response for {} '{}': {}",
                    target.as_str(),
                    key,
                    reason
                );
                let changed = self.history.record_failure(key.clone());
                self.note_change(changed)?;
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn note_change(&mut self, changed: bool) -> Result<()> {
        if !changed {
            return Ok(());
        }
        self.unsaved += 1;
        let every = self.config.history_flush_every;
        if every > 0 && self.unsaved >= every {
            self.flush()?;
        }
        Ok(())
    }

    /// Save the history now.
    pub fn flush(&mut self) -> Result<()> {
        self.store.save(&self.history)?;
        self.unsaved = 0;
        self.stats.history_flushes += 1;
        Ok(())
    }

    fn flush_best_effort(&mut self) {
        if self.unsaved == 0 {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::warn!(
                "Could not save request history to {}: {}",
                self.store.path().display(),
                e
            );
        }
    }

    fn finish_batch(&mut self, phase: &str) -> Result<()> {
        if self.unsaved > 0 {
            self.flush()?;
        }
        self.stats.log_phase(phase);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ReplaySearch;
    use serde_json::json;
    use tempfile::TempDir;

    const SKIN_KEY: &str = "artist:Skin track:Til Morning";
    const SUEDE_KEY: &str = "artist:Suede track:Pantomime Horse";

    fn skin_payload() -> Value {
        json!({
            "tracks": {"items": [{
                "uri": "spotify:track:skin",
                "external_ids": {"isrc": "GBUM70300001"},
                "artists": [{"uri": "spotify:artist:skin"}],
                "album": {"total_tracks": 12}
            }]}
        })
    }

    fn album_payload() -> Value {
        json!({"albums": {"items": [{"uri": "spotify:album:63SYDOduS7UPFCbRo7g9cy"}]}})
    }

    fn two_rows() -> Catalog {
        Catalog::new(vec![
            CatalogRow::new("Til Morning", "Skin", None, None),
            CatalogRow::new("Pantomime Horse", "Suede", None, None),
        ])
    }

    fn store(dir: &TempDir) -> HistoryStore {
        HistoryStore::new(dir.path().join("history.db"))
    }

    fn quiet_config() -> LinkerConfig {
        LinkerConfig {
            cooldown_ms: 0,
            ..LinkerConfig::default()
        }
    }

    #[test]
    fn test_cached_success_skips_search() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new();
        let mut history = RequestHistory::new();
        history.record_success(SearchKey::from(SKIN_KEY), skin_payload());

        let mut linker =
            RecordLinker::with_history(&search, store(&dir), history, quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![CatalogRow::new("Til Morning", "Skin", None, None)]);
        let linked = linker.link_missing_identifiers(&mut catalog).unwrap();

        assert_eq!(linked, 1);
        assert_eq!(search.call_count(), 0);
        let row = &catalog.rows()[0];
        assert_eq!(row.isrc.as_deref(), Some("GBUM70300001"));
        assert_eq!(row.track_uri.as_deref(), Some("spotify:track:skin"));
        assert_eq!(row.artist_uri.as_deref(), Some("spotify:artist:skin"));
        assert_eq!(row.remote_total_tracks, 12);
        assert_eq!(linker.stats().cache_hits_success, 1);
    }

    #[test]
    fn test_cached_failure_skips_search() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(SearchTarget::Track, SKIN_KEY, skin_payload());
        let mut history = RequestHistory::new();
        history.record_failure(SearchKey::from(SKIN_KEY));

        let mut linker =
            RecordLinker::with_history(&search, store(&dir), history, quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![CatalogRow::new("Til Morning", "Skin", None, None)]);
        linker.link_missing_identifiers(&mut catalog).unwrap();

        assert_eq!(search.call_count(), 0);
        let row = &catalog.rows()[0];
        assert!(row.isrc.is_none() && row.track_uri.is_none() && row.artist_uri.is_none());
        assert_eq!(linker.stats().cache_hits_failure, 1);
    }

    #[test]
    fn test_outcomes_recorded_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(SearchTarget::Track, SKIN_KEY, skin_payload());
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();
        let mut catalog = two_rows();

        assert_eq!(linker.link_missing_identifiers(&mut catalog).unwrap(), 1);

        let history = linker.history();
        assert!(history.is_disjoint());
        assert!(history.successes().contains_key(&SearchKey::from(SKIN_KEY)));
        assert!(history.failures().contains(&SearchKey::from(SUEDE_KEY)));
        assert_eq!(&store(&dir).load().unwrap(), history);
        assert!(catalog.rows()[1].isrc.is_none());
    }

    #[test]
    fn test_repeated_key_queries_once() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(SearchTarget::Track, SKIN_KEY, skin_payload());
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![
            CatalogRow::new("Til Morning", "Skin", None, Some("Fleshwounds".into())),
            CatalogRow::new("Til Morning", "Skin", None, Some("Best Of".into())),
        ]);

        assert_eq!(linker.link_missing_identifiers(&mut catalog).unwrap(), 2);
        assert_eq!(search.call_count(), 1);
        assert_eq!(linker.stats().cache_hits_success, 1);
    }

    #[test]
    fn test_malformed_response_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(
            SearchTarget::Track,
            SKIN_KEY,
            json!({"tracks": {"items": [{"uri": "spotify:track:skin"}]}}),
        );
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![CatalogRow::new("Til Morning", "Skin", None, None)]);

        assert_eq!(linker.link_missing_identifiers(&mut catalog).unwrap(), 0);
        assert!(linker.history().failures().contains(&SearchKey::from(SKIN_KEY)));
        assert_eq!(linker.stats().malformed_responses, 1);
        assert_eq!(linker.stats().no_matches, 0);
        assert!(catalog.rows()[0].isrc.is_none());
    }

    #[test]
    fn test_undecodable_cached_payload_is_not_requeried() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(SearchTarget::Track, SKIN_KEY, skin_payload());
        let mut history = RequestHistory::new();
        history.record_success(SearchKey::from(SKIN_KEY), json!({"unexpected": true}));

        let mut linker =
            RecordLinker::with_history(&search, store(&dir), history, quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![CatalogRow::new("Til Morning", "Skin", None, None)]);

        assert_eq!(linker.link_missing_identifiers(&mut catalog).unwrap(), 0);
        assert_eq!(search.call_count(), 0);
    }

    #[test]
    fn test_link_one_targets_matching_rows() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new().with_response(SearchTarget::Track, SKIN_KEY, skin_payload());
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();
        let mut catalog = two_rows();

        assert_eq!(linker.link_one(&mut catalog, "Skin", "Til Morning").unwrap(), 1);
        assert_eq!(search.calls(), vec![SKIN_KEY.to_string()]);
        assert!(catalog.rows()[0].isrc.is_some());
        assert!(catalog.rows()[1].isrc.is_none());

        assert_eq!(linker.link_one(&mut catalog, "Nobody", "Nothing").unwrap(), 0);
        assert_eq!(search.call_count(), 1);
    }

    #[test]
    fn test_rows_without_search_fields_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new();
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();
        let mut catalog = Catalog::new(vec![CatalogRow::new("Untitled", "", None, None)]);

        assert_eq!(linker.link_missing_identifiers(&mut catalog).unwrap(), 0);
        assert_eq!(search.call_count(), 0);
        assert_eq!(linker.stats().skipped_rows, 1);
    }

    #[test]
    fn test_transport_error_aborts_and_keeps_progress() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new()
            .with_response(SearchTarget::Track, SKIN_KEY, skin_payload())
            .with_transport_failure(SUEDE_KEY);
        let config = LinkerConfig {
            history_flush_every: 0,
            ..quiet_config()
        };
        let mut linker = RecordLinker::new(&search, store(&dir), config).unwrap();
        let mut catalog = two_rows();

        let err = linker.link_missing_identifiers(&mut catalog).unwrap_err();
        match err {
            LinkError::Search { query, .. } => assert_eq!(query, SUEDE_KEY),
            other => panic!("unexpected error: {other}"),
        }

        let saved = store(&dir).load().unwrap();
        assert!(saved.successes().contains_key(&SearchKey::from(SKIN_KEY)));
        assert!(!saved.failures().contains(&SearchKey::from(SUEDE_KEY)));
    }

    #[test]
    fn test_history_flushed_every_k_entries() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new();
        let config = LinkerConfig {
            history_flush_every: 1,
            ..quiet_config()
        };
        let mut linker = RecordLinker::new(&search, store(&dir), config).unwrap();
        let mut catalog = two_rows();

        linker.link_missing_identifiers(&mut catalog).unwrap();
        assert_eq!(linker.stats().history_flushes, 2);
        assert_eq!(store(&dir).load().unwrap().failures().len(), 2);
    }

    #[test]
    fn test_governor_counts_network_calls_only() {
        let dir = tempfile::tempdir().unwrap();
        let search = ReplaySearch::new();
        let config = LinkerConfig {
            requests_before_cooldown: 1,
            ..quiet_config()
        };
        let mut linker = RecordLinker::new(&search, store(&dir), config).unwrap();
        let mut catalog = Catalog::new(vec![
            CatalogRow::new("A", "X", None, None),
            CatalogRow::new("B", "X", None, None),
            CatalogRow::new("C", "X", None, None),
            CatalogRow::new("A", "X", None, None),
        ]);

        linker.link_missing_identifiers(&mut catalog).unwrap();
        assert_eq!(search.call_count(), 3);
        assert_eq!(linker.stats().lookups_issued, 3);
        assert_eq!(linker.stats().cooldowns, 1);
    }

    #[test]
    fn test_album_identifier_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let album_key = "album:Platinum Collection artist:Queen";
        let search = ReplaySearch::new().with_response(SearchTarget::Album, album_key, album_payload());
        let mut linker = RecordLinker::new(&search, store(&dir), quiet_config()).unwrap();

        let mut rows = Vec::new();
        for artist in ["Queen", "Queen", "Freddie Mercury", "Queen", "Queen", "Queen", "Queen"] {
            let mut row = CatalogRow::new("Track", artist, None, Some("Platinum Collection".into()));
            row.remote_total_tracks = 7;
            rows.push(row);
        }
        rows.push(CatalogRow::new("Loner", "Skin", None, Some("Single".into())));
        let mut catalog = Catalog::new(rows);

        assert_eq!(linker.resolve_album_identifiers(&mut catalog).unwrap(), 1);
        assert_eq!(search.calls(), vec![album_key.to_string()]);
        for row in &catalog.rows()[..7] {
            assert!(row.add_album);
            assert_eq!(row.album_uri.as_deref(), Some("spotify:album:63SYDOduS7UPFCbRo7g9cy"));
        }
        assert!(!catalog.rows()[7].add_album);
        assert!(catalog.rows()[7].album_uri.is_none());

        // every flagged album already resolved: nothing to look up
        assert_eq!(linker.resolve_album_identifiers(&mut catalog).unwrap(), 0);
        assert_eq!(search.call_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkerConfig {
            result_limit: 0,
            ..LinkerConfig::default()
        };
        let result = RecordLinker::new(ReplaySearch::new(), store(&dir), config);
        assert!(matches!(result, Err(LinkError::Config(_))));
    }
}
