//! Library migration core: clean a local music library, link its tracks and
//! albums to the remote catalog, and report what could not be linked.
//!
//! The stages, in pipeline order:
//!
//! 1. [`clean::DataCleaner`] turns exported tracks into a [`models::Catalog`].
//! 2. [`linker::RecordLinker::link_missing_identifiers`] resolves tracks.
//! 3. [`clean::DataCleaner::apply_album_corrections`], then
//!    [`linker::RecordLinker::resolve_album_identifiers`] flags and resolves
//!    albums.
//! 4. [`clean::attach_track_uris`] carries track identifiers onto the
//!    entries read by [`clean::read_playlists`].
//! 5. [`report::LinkReport`] summarizes the leftovers.
//!
//! [`checkpoint::CheckpointStore`] snapshots the catalog between stages.

pub mod album;
pub mod checkpoint;
pub mod clean;
pub mod config;
pub mod error;
pub mod governor;
pub mod history;
pub mod linker;
pub mod models;
pub mod progress;
pub mod report;
pub mod search;
pub mod search_key;

pub use config::{CleanerConfig, LinkerConfig};
pub use error::{LinkError, Result};
pub use history::{HistoryStore, RequestHistory};
pub use linker::RecordLinker;
pub use models::{Catalog, CatalogRow, PlaylistEntry, SearchKey, SearchTarget};
pub use search::{CatalogSearch, SearchRequest};
