//! Named catalog snapshots.
//!
//! The pipeline saves the catalog after each stage (cleaned, tracks linked,
//! albums resolved) so a later stage can be rerun without repeating the
//! earlier ones. Each snapshot is stored column-per-field in a SQLite file,
//! which keeps it queryable with the sqlite3 shell.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::models::{Catalog, CatalogRow};
use crate::progress::create_spinner;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        name TEXT PRIMARY KEY,
        row_count INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS checkpoint_rows (
        checkpoint TEXT NOT NULL,
        position INTEGER NOT NULL,
        track_name TEXT NOT NULL,
        artist TEXT NOT NULL,
        release_date TEXT,
        album TEXT,
        content_id TEXT,
        search_artist TEXT NOT NULL,
        search_track_name TEXT NOT NULL,
        search_album TEXT,
        search_release_year TEXT,
        isrc TEXT,
        track_uri TEXT,
        artist_uri TEXT,
        remote_total_tracks INTEGER NOT NULL,
        album_uri TEXT,
        library_total_tracks INTEGER NOT NULL,
        add_album INTEGER NOT NULL,
        PRIMARY KEY (checkpoint, position)
    );";

pub struct CheckpointStore {
    conn: Connection,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open checkpoint store {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create checkpoint tables")?;
        Ok(Self { conn })
    }

    /// Replace the snapshot stored under `name`.
    pub fn write(&mut self, name: &str, catalog: &Catalog) -> Result<()> {
        let spinner = create_spinner(&format!("Writing checkpoint '{}'", name));

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM checkpoint_rows WHERE checkpoint = ?1", [name])?;
        tx.execute(
            "INSERT OR REPLACE INTO checkpoints (name, row_count) VALUES (?1, ?2)",
            params![name, catalog.len() as i64],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO checkpoint_rows (
                    checkpoint, position, track_name, artist, release_date, album, content_id,
                    search_artist, search_track_name, search_album, search_release_year,
                    isrc, track_uri, artist_uri, remote_total_tracks,
                    album_uri, library_total_tracks, add_album
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            for (id, row) in catalog.iter() {
                stmt.execute(params![
                    name,
                    id.0 as i64,
                    row.track_name,
                    row.artist,
                    row.release_date,
                    row.album,
                    row.content_id,
                    row.search_artist,
                    row.search_track_name,
                    row.search_album,
                    row.search_release_year,
                    row.isrc,
                    row.track_uri,
                    row.artist_uri,
                    row.remote_total_tracks,
                    row.album_uri,
                    row.library_total_tracks,
                    row.add_album,
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("Failed to commit checkpoint '{}'", name))?;

        spinner.finish_with_message(format!("Checkpoint '{}': {} rows", name, catalog.len()));
        tracing::info!("Wrote checkpoint '{}' ({} rows)", name, catalog.len());
        Ok(())
    }

    /// Last snapshot written under `name`, or `None` if there is none.
    pub fn read(&self, name: &str) -> Result<Option<Catalog>> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT row_count FROM checkpoints WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT track_name, artist, release_date, album, content_id,
                    search_artist, search_track_name, search_album, search_release_year,
                    isrc, track_uri, artist_uri, remote_total_tracks,
                    album_uri, library_total_tracks, add_album
             FROM checkpoint_rows
             WHERE checkpoint = ?1
             ORDER BY position",
        )?;
        let rows = stmt
            .query_map([name], |row| {
                Ok(CatalogRow {
                    track_name: row.get(0)?,
                    artist: row.get(1)?,
                    release_date: row.get(2)?,
                    album: row.get(3)?,
                    content_id: row.get(4)?,
                    search_artist: row.get(5)?,
                    search_track_name: row.get(6)?,
                    search_album: row.get(7)?,
                    search_release_year: row.get(8)?,
                    isrc: row.get(9)?,
                    track_uri: row.get(10)?,
                    artist_uri: row.get(11)?,
                    remote_total_tracks: row.get(12)?,
                    album_uri: row.get(13)?,
                    library_total_tracks: row.get(14)?,
                    add_album: row.get(15)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read checkpoint '{}'", name))?;

        Ok(Some(Catalog::new(rows)))
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM checkpoints ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackMatch;

    fn linked_row() -> CatalogRow {
        let mut row = CatalogRow::new(
            "Til Morning",
            "Skin",
            Some("2003-05-12T12:00:00Z".into()),
            Some("Fleshwounds".into()),
        );
        row.search_release_year = Some("2003".into());
        row.apply_track_match(&TrackMatch {
            isrc: "GBUM70300001".into(),
            track_uri: "spotify:track:skin".into(),
            artist_uri: "spotify:artist:skin".into(),
            total_tracks: 12,
        });
        row.library_total_tracks = 7;
        row.add_album = true;
        row
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        let catalog = Catalog::new(vec![
            linked_row(),
            CatalogRow::new("Pantomime Horse", "Suede", None, None),
        ]);

        store.write("tracks_linked", &catalog).unwrap();
        assert_eq!(store.read("tracks_linked").unwrap(), Some(catalog));
    }

    #[test]
    fn test_unknown_name_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        assert_eq!(store.read("cleaned").unwrap(), None);
    }

    #[test]
    fn test_empty_snapshot_is_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        store.write("cleaned", &Catalog::default()).unwrap();
        assert_eq!(store.read("cleaned").unwrap(), Some(Catalog::default()));
    }

    #[test]
    fn test_rewrite_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let mut store = CheckpointStore::open(&path).unwrap();
        store
            .write("cleaned", &Catalog::new(vec![linked_row(), linked_row()]))
            .unwrap();
        store.write("albums", &Catalog::new(vec![linked_row()])).unwrap();

        let smaller = Catalog::new(vec![CatalogRow::new("Trash", "Suede", None, None)]);
        store.write("cleaned", &smaller).unwrap();
        drop(store);

        let reopened = CheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.read("cleaned").unwrap(), Some(smaller));
        assert_eq!(reopened.read("albums").unwrap().map(|c| c.len()), Some(1));
        assert_eq!(reopened.names().unwrap(), vec!["albums".to_string(), "cleaned".to_string()]);
    }
}
