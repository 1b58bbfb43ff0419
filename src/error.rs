//! Error types shared across the crate
//!
//! Only failures that leave the player are modelled here. Seek inaccuracy
//! and stale timer callbacks are recovered inside the audio engine and never
//! surface as errors.

use std::path::PathBuf;

use thiserror::Error;

/// A transcript or audio resource could not be retrieved.
///
/// Surfaced to the user as a lesson-load failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not valid UTF-8")]
    Encoding(String),
    #[error("{url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no resource registered for {0}")]
    NotFound(String),
}

/// Starting playback was refused by the media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlayError {
    /// Platform policy requires a user gesture before audio may start
    #[error("playback blocked until the user interacts with the page")]
    AutoplayBlocked,
    #[error("no media source attached")]
    NoSource,
}

/// A write to the key-value store failed.
///
/// Callers log and drop these: the feature degrades, playback goes on.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no writable storage location available")]
    Unavailable,
}

/// A backup bundle was rejected during import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("backup file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("backup file is not a JSON object")]
    NotAnObject,
    #[error("backup was produced by {0:?}, not this application")]
    ForeignApp(String),
    #[error("backup format {0} is newer than this version supports")]
    UnsupportedFormat(u64),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
