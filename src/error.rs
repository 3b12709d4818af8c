//! Error type for the linking core.
//!
//! No-match and unparseable search responses are not errors: they are
//! recorded in the request history and leave the row unlinked. Only storage
//! failures and transport/auth failures from the search capability surface
//! here.

use std::path::PathBuf;
use thiserror::Error;

/// Error raised by a search capability (network, auth, rate-limit rejection).
pub type SearchError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("History store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("History store at {} is corrupt: {reason}", path.display())]
    CorruptHistory { path: PathBuf, reason: String },

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Search failed for '{query}': {source}")]
    Search {
        query: String,
        #[source]
        source: SearchError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
