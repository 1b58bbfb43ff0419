//! Transcript module - parsing and intro detection
//!
//! - `lrc`: bilingual LRC parsing
//! - `classifier`: first-content detection
//! - `types`: `TimedLine`, `LessonMeta`, `Transcript`

pub mod classifier;
pub mod lrc;
pub mod types;

pub use classifier::{ClassifierPolicy, ContentOffsets, find_first_content_index, should_skip_line};
pub use lrc::{parse_transcript, stringify};
pub use types::{LessonMeta, TimedLine, Transcript};

use crate::api::Fetcher;
use crate::error::FetchError;

/// Fetch and parse a transcript
///
/// Only retrieval can fail; malformed rows are dropped by the parser.
pub async fn load_transcript(fetcher: &dyn Fetcher, url: &str) -> Result<Transcript, FetchError> {
    let text = fetcher.fetch_text(url).await?;
    let transcript = parse_transcript(&text);
    tracing::info!(
        "Loaded transcript {} ({} lines, title {:?})",
        url,
        transcript.len(),
        transcript.meta.title
    );
    Ok(transcript)
}
