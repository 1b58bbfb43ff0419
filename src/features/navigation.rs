//! Lesson identity, neighbours and cross-lesson handoff
//!
//! Lessons are addressed as `book/filename` (`NCE2/07-Too late`). The site
//! publishes a per-book lesson list which determines what "next lesson"
//! means. Moving to another lesson leaves a resume marker in the session
//! store that the next player instance consumes at load.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::progress::{LastPosition, save_position};
use super::store::{KeyValueStore, ignore_failure};
use crate::api::{Fetcher, fetch_json};
use crate::error::FetchError;

pub const RESUME_KEY: &str = "nce_resume";
pub const RESUME_PLAY_KEY: &str = "nce_resume_play";
pub const AUTO_NEXT_PLAYED_KEY: &str = "nce_auto_next_played_lessons";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LessonId {
    pub book: String,
    pub filename: String,
}

impl LessonId {
    pub fn new(book: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            book: book.into(),
            filename: filename.into(),
        }
    }

    /// Parse `book/filename`
    pub fn parse(value: &str) -> Option<Self> {
        let (book, filename) = value.trim().split_once('/')?;
        if book.is_empty() || filename.is_empty() {
            return None;
        }
        Some(Self::new(book, filename))
    }

    /// `NCE3` -> 3; unknown books count as book 1
    pub fn book_number(&self) -> u32 {
        self.book
            .strip_prefix("NCE")
            .and_then(|n| n.parse().ok())
            .unwrap_or(1)
    }
}

impl fmt::Display for LessonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.book, self.filename)
    }
}

/// A lesson link with an optional line to jump to
///
/// Rendered as `lesson.html#NCE2/07?line=3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonLink {
    pub lesson: LessonId,
    pub line: Option<usize>,
}

impl LessonLink {
    pub fn new(lesson: LessonId, line: Option<usize>) -> Self {
        Self { lesson, line }
    }

    /// Parse the fragment part (`NCE2/07?line=3`, leading `#` optional)
    pub fn parse(fragment: &str) -> Option<Self> {
        let fragment = fragment.trim().trim_start_matches('#');
        let (path, query) = match fragment.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (fragment, None),
        };
        let lesson = LessonId::parse(path)?;
        let line = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| *k == "line")
                .and_then(|(_, v)| v.parse().ok())
        });
        Some(Self { lesson, line })
    }

    pub fn href(&self) -> String {
        match self.line {
            Some(line) => format!("lesson.html#{}?line={}", self.lesson, line),
            None => format!("lesson.html#{}", self.lesson),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonEntry {
    pub filename: String,
    #[serde(default)]
    pub title: String,
}

/// Lessons of every book in course order
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LessonIndex {
    books: BTreeMap<String, Vec<LessonEntry>>,
}

impl LessonIndex {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub async fn load(fetcher: &dyn Fetcher, url: &str) -> Result<Self, FetchError> {
        let index: Self = fetch_json(fetcher, url).await?;
        tracing::debug!("Loaded lesson index with {} books", index.books.len());
        Ok(index)
    }

    pub fn lessons(&self, book_number: u32) -> &[LessonEntry] {
        self.books
            .get(&book_number.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Previous and next lesson within the same book
    pub fn neighbors(&self, id: &LessonId) -> (Option<LessonId>, Option<LessonId>) {
        let lessons = self.lessons(id.book_number());
        let Some(pos) = lessons.iter().position(|l| l.filename == id.filename) else {
            return (None, None);
        };
        let at = |i: usize| lessons.get(i).map(|l| LessonId::new(id.book.clone(), l.filename.clone()));
        let prev = pos.checked_sub(1).and_then(at);
        (prev, at(pos + 1))
    }

    pub fn next(&self, id: &LessonId) -> Option<LessonId> {
        self.neighbors(id).1
    }
}

/// Handoff left for the next lesson's player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeMarker {
    pub lesson: LessonId,
    pub autoplay: bool,
}

impl ResumeMarker {
    pub fn write(&self, session: &dyn KeyValueStore) {
        ignore_failure(RESUME_KEY, session.set(RESUME_KEY, &self.lesson.to_string()));
        if self.autoplay {
            ignore_failure(RESUME_PLAY_KEY, session.set(RESUME_PLAY_KEY, "1"));
        } else {
            ignore_failure(RESUME_PLAY_KEY, session.remove(RESUME_PLAY_KEY));
        }
    }
}

/// Read and clear the resume marker
pub fn take_resume_marker(session: &dyn KeyValueStore) -> Option<ResumeMarker> {
    let lesson = session.get(RESUME_KEY);
    let autoplay = session.get(RESUME_PLAY_KEY).as_deref() == Some("1");
    ignore_failure(RESUME_KEY, session.remove(RESUME_KEY));
    ignore_failure(RESUME_PLAY_KEY, session.remove(RESUME_PLAY_KEY));
    let lesson = LessonId::parse(&lesson?)?;
    Some(ResumeMarker { lesson, autoplay })
}

/// Prepare `next` to start from the top and autoplay once opened
pub fn hand_off_to(next: &LessonId, store: &dyn KeyValueStore, session: &dyn KeyValueStore) {
    ResumeMarker {
        lesson: next.clone(),
        autoplay: true,
    }
    .write(session);
    ignore_failure(
        super::progress::LAST_POSITIONS_KEY,
        save_position(store, &next.to_string(), LastPosition::new(0.0, 0)),
    );
}

/// Whether to continue into the next lesson after this one finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStopDecision {
    Continue,
    /// The configured number of lessons was played back to back
    Stop { played: u32 },
}

/// Count a lesson finished under next-lesson policy
///
/// The counter lives in the session store and resets when it stops playback.
pub fn register_finished_lesson(session: &dyn KeyValueStore, enabled: bool, limit: u32) -> AutoStopDecision {
    if !enabled {
        return AutoStopDecision::Continue;
    }
    let played = session
        .get(AUTO_NEXT_PLAYED_KEY)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
    if played >= limit {
        ignore_failure(AUTO_NEXT_PLAYED_KEY, session.remove(AUTO_NEXT_PLAYED_KEY));
        return AutoStopDecision::Stop { played };
    }
    ignore_failure(
        AUTO_NEXT_PLAYED_KEY,
        session.set(AUTO_NEXT_PLAYED_KEY, &played.to_string()),
    );
    AutoStopDecision::Continue
}

/// Forget the auto-stop count, e.g. when the policy changes
pub fn reset_auto_stop(session: &dyn KeyValueStore) {
    ignore_failure(AUTO_NEXT_PLAYED_KEY, session.remove(AUTO_NEXT_PLAYED_KEY));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryFetcher;
    use crate::features::progress::load_position;
    use crate::features::store::MemoryStore;

    const INDEX: &str = r#"{
        "1": [{"filename": "001&002-Excuse Me", "title": "Excuse me!"}],
        "2": [
            {"filename": "01-A Private Conversation", "title": "A private conversation"},
            {"filename": "02-Breakfast or Lunch", "title": "Breakfast or lunch?"},
            {"filename": "03-Please Send Me a Card", "title": "Please send me a card"}
        ]
    }"#;

    #[test]
    fn test_lesson_id_parse() {
        let id = LessonId::parse("NCE2/07-Too late").unwrap();
        assert_eq!(id.book, "NCE2");
        assert_eq!(id.filename, "07-Too late");
        assert_eq!(id.book_number(), 2);
        assert_eq!(id.to_string(), "NCE2/07-Too late");
        assert!(LessonId::parse("nobook").is_none());
        assert_eq!(LessonId::new("misc", "x").book_number(), 1);
    }

    #[test]
    fn test_lesson_link() {
        let link = LessonLink::parse("#NCE2/01-A Private Conversation?line=4").unwrap();
        assert_eq!(link.line, Some(4));
        assert_eq!(link.href(), "lesson.html#NCE2/01-A Private Conversation?line=4");
        let plain = LessonLink::parse("NCE1/001&002-Excuse Me").unwrap();
        assert_eq!(plain.line, None);
        assert_eq!(plain.lesson.filename, "001&002-Excuse Me");
    }

    #[test]
    fn test_neighbors() {
        let index = LessonIndex::from_json(INDEX).unwrap();
        let mid = LessonId::parse("NCE2/02-Breakfast or Lunch").unwrap();
        let (prev, next) = index.neighbors(&mid);
        assert_eq!(prev.unwrap().filename, "01-A Private Conversation");
        assert_eq!(next.unwrap().filename, "03-Please Send Me a Card");

        let last = LessonId::parse("NCE2/03-Please Send Me a Card").unwrap();
        assert!(index.next(&last).is_none());
        let unknown = LessonId::parse("NCE4/99-Nothing").unwrap();
        assert_eq!(index.neighbors(&unknown), (None, None));
    }

    #[tokio::test]
    async fn test_load_index() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("static/data.json", INDEX);
        fetcher.insert("broken.json", "{");
        let index = LessonIndex::load(&fetcher, "static/data.json").await.unwrap();
        assert_eq!(index.lessons(2).len(), 3);
        assert!(matches!(
            LessonIndex::load(&fetcher, "broken.json").await,
            Err(FetchError::Decode { .. })
        ));
    }

    #[test]
    fn test_hand_off_and_take_marker() {
        let store = MemoryStore::new();
        let session = MemoryStore::new();
        let next = LessonId::parse("NCE2/02-Breakfast or Lunch").unwrap();
        hand_off_to(&next, &store, &session);

        let pos = load_position(&store, &next.to_string()).unwrap();
        assert_eq!(pos.idx, 0);
        assert_eq!(pos.t, 0.0);

        let marker = take_resume_marker(&session).unwrap();
        assert_eq!(marker.lesson, next);
        assert!(marker.autoplay);
        assert!(take_resume_marker(&session).is_none());
    }

    #[test]
    fn test_auto_stop_counter() {
        let session = MemoryStore::new();
        assert_eq!(register_finished_lesson(&session, false, 1), AutoStopDecision::Continue);
        assert_eq!(register_finished_lesson(&session, true, 3), AutoStopDecision::Continue);
        assert_eq!(register_finished_lesson(&session, true, 3), AutoStopDecision::Continue);
        assert_eq!(
            register_finished_lesson(&session, true, 3),
            AutoStopDecision::Stop { played: 3 }
        );
        assert!(session.get(AUTO_NEXT_PLAYED_KEY).is_none());
    }
}
