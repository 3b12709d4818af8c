//! Request history: the cache of search outcomes.
//!
//! `RequestHistory` is the in-memory view used during a batch. It owns both
//! collections privately so that every mutation goes through methods that
//! keep them disjoint: a key is either a known failure or a stored success,
//! never both. `HistoryStore` persists a history to a SQLite file.
//!
//! Storage layout:
//!
//! ```text
//! history_failures(search_key TEXT PRIMARY KEY)
//! history_successes(search_key TEXT PRIMARY KEY, payload TEXT NOT NULL)
//! ```
//!
//! A save replaces both tables inside one transaction, so a crash mid-save
//! leaves the previous contents in place.

use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};

use crate::error::{LinkError, Result};
use crate::models::{FailureSet, SearchKey, SuccessMap};

const FAILURES_TABLE: &str = "history_failures";
const SUCCESSES_TABLE: &str = "history_successes";

// ============================================================================
// In-memory history
// ============================================================================

/// Outcome of a history lookup for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryLookup<'a> {
    /// Known to return nothing usable; do not query again.
    Failure,
    /// Previously matched; replay this payload.
    Success(&'a serde_json::Value),
    /// Never resolved.
    Miss,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestHistory {
    failures: FailureSet,
    successes: SuccessMap,
}

impl RequestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw collections. A key present in both is kept as a
    /// success: the payload is evidence of a real match.
    pub fn from_parts(mut failures: FailureSet, successes: SuccessMap) -> Self {
        let before = failures.len();
        failures.retain(|key| !successes.contains_key(key));
        let overlap = before - failures.len();
        if overlap > 0 {
            tracing::warn!(
                "History had {} key(s) recorded as both failure and success; keeping the successes",
                overlap
            );
        }
        Self {
            failures,
            successes,
        }
    }

    pub fn into_parts(self) -> (FailureSet, SuccessMap) {
        (self.failures, self.successes)
    }

    pub fn lookup(&self, key: &SearchKey) -> HistoryLookup<'_> {
        if let Some(payload) = self.successes.get(key) {
            HistoryLookup::Success(payload)
        } else if self.failures.contains(key) {
            HistoryLookup::Failure
        } else {
            HistoryLookup::Miss
        }
    }

    /// Record a key as failed, dropping any stored success for it. Returns
    /// whether the history changed.
    pub fn record_failure(&mut self, key: SearchKey) -> bool {
        let dropped_success = self.successes.remove(&key).is_some();
        let inserted = self.failures.insert(key);
        inserted || dropped_success
    }

    /// Record (or overwrite) a successful payload, dropping any failure for
    /// the key. Returns whether the history changed.
    pub fn record_success(&mut self, key: SearchKey, payload: serde_json::Value) -> bool {
        let dropped_failure = self.failures.remove(&key);
        let unchanged = self.successes.get(&key) == Some(&payload);
        self.successes.insert(key, payload);
        dropped_failure || !unchanged
    }

    pub fn failures(&self) -> &FailureSet {
        &self.failures
    }

    pub fn successes(&self) -> &SuccessMap {
        &self.successes
    }

    pub fn len(&self) -> usize {
        self.failures.len() + self.successes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.successes.is_empty()
    }

    pub fn is_disjoint(&self) -> bool {
        self.failures
            .iter()
            .all(|key| !self.successes.contains_key(key))
    }
}

// ============================================================================
// Durable store
// ============================================================================

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted history. A missing file is a cold start and yields
    /// an empty history; the file is not created. A save that was cut short
    /// is rolled back on open, so the previous contents load. A file that is
    /// not a SQLite database, or holds a payload that is not JSON, is
    /// rejected with [`LinkError::CorruptHistory`].
    pub fn load(&self) -> Result<RequestHistory> {
        if !self.path.exists() {
            tracing::info!(
                "No request history at {}, starting cold",
                self.path.display()
            );
            return Ok(RequestHistory::new());
        }

        // Read-write without CREATE: an interrupted save leaves a hot
        // journal that only a writable connection can roll back.
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| self.classify(e))?;

        let (has_failures, has_successes) = self.existing_tables(&conn)?;

        let mut failures = FailureSet::default();
        if has_failures {
            let mut stmt = conn
                .prepare(&format!("SELECT search_key FROM {}", FAILURES_TABLE))
                .map_err(|e| self.classify(e))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| self.classify(e))?;
            for key in keys {
                let key = key.map_err(|e| self.classify(e))?;
                failures.insert(SearchKey::new(key));
            }
        }

        let mut successes = SuccessMap::default();
        if has_successes {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT search_key, payload FROM {}",
                    SUCCESSES_TABLE
                ))
                .map_err(|e| self.classify(e))?;
            let mut rows = stmt.query([]).map_err(|e| self.classify(e))?;
            while let Some(row) = rows.next().map_err(|e| self.classify(e))? {
                let key: String = row.get(0)?;
                let payload: String = row.get(1)?;
                let value = serde_json::from_str(&payload).map_err(|e| {
                    LinkError::CorruptHistory {
                        path: self.path.clone(),
                        reason: format!("payload for '{}' is not valid JSON: {}", key, e),
                    }
                })?;
                successes.insert(SearchKey::new(key), value);
            }
        }

        let history = RequestHistory::from_parts(failures, successes);
        tracing::info!(
            "Loaded request history from {}: {} failures, {} successes",
            self.path.display(),
            history.failures().len(),
            history.successes().len()
        );
        Ok(history)
    }

    /// Replace the persisted history with `history` in a single transaction.
    pub fn save(&self, history: &RequestHistory) -> Result<()> {
        debug_assert!(history.is_disjoint());

        let mut conn = Connection::open(&self.path)?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS {} (
                search_key TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS {} (
                search_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );",
            FAILURES_TABLE, SUCCESSES_TABLE
        ))?;

        let tx = conn.transaction()?;
        {
            tx.execute(&format!("DELETE FROM {}", FAILURES_TABLE), [])?;
            tx.execute(&format!("DELETE FROM {}", SUCCESSES_TABLE), [])?;

            let mut insert_failure = tx.prepare_cached(&format!(
                "INSERT INTO {} (search_key) VALUES (?1)",
                FAILURES_TABLE
            ))?;
            for key in history.failures() {
                insert_failure.execute(params![key.as_str()])?;
            }

            let mut insert_success = tx.prepare_cached(&format!(
                "INSERT INTO {} (search_key, payload) VALUES (?1, ?2)",
                SUCCESSES_TABLE
            ))?;
            for (key, payload) in history.successes() {
                let payload = serde_json::to_string(payload)?;
                insert_success.execute(params![key.as_str(), payload])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            "Saved request history to {}: {} failures, {} successes",
            self.path.display(),
            history.failures().len(),
            history.successes().len()
        );
        Ok(())
    }

    fn existing_tables(&self, conn: &Connection) -> Result<(bool, bool)> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name IN (?1, ?2)")
            .map_err(|e| self.classify(e))?;
        let names = stmt
            .query_map(params![FAILURES_TABLE, SUCCESSES_TABLE], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| self.classify(e))?;

        let (mut has_failures, mut has_successes) = (false, false);
        for name in names {
            match name.map_err(|e| self.classify(e))?.as_str() {
                FAILURES_TABLE => has_failures = true,
                SUCCESSES_TABLE => has_successes = true,
                _ => {}
            }
        }
        Ok((has_failures, has_successes))
    }

    fn classify(&self, err: rusqlite::Error) -> LinkError {
        let corrupt = matches!(
            &err,
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(inner.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        );
        if corrupt {
            LinkError::CorruptHistory {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        } else {
            LinkError::Store(err)
        }
    }
}
