//! Sentence favorites
//!
//! Learners collect single sentences from any lesson into one review list.
//! Entries carry enough context to be reviewed offline and to jump back to
//! the source line.

use serde::{Deserialize, Serialize};

use super::navigation::{LessonId, ResumeMarker};
use super::progress::{LAST_POSITIONS_KEY, LastPosition, save_position};
use super::store::{KeyValueStore, get_json, ignore_failure, set_json};
use crate::error::PersistenceError;
use crate::features::transcript::{LessonMeta, TimedLine};
use crate::utils::now_millis;

pub const SENTENCE_FAVORITES_KEY: &str = "nce_sentence_favs_v1";
/// Whole-lesson favorites, only carried through backups
pub const LESSON_FAVORITES_KEY: &str = "nce_favs";

/// Title and subtitle shown for a lesson
pub fn lesson_heading(meta: &LessonMeta, lesson: &LessonId) -> (String, String) {
    let title = if meta.title.is_empty() {
        lesson.filename.clone()
    } else {
        meta.title.clone()
    };
    let album = if meta.album.is_empty() {
        lesson.book.as_str()
    } else {
        meta.album.as_str()
    };
    let sub = format!("{} · {}", album, meta.artist).trim().to_string();
    (title, sub)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentenceFavorite {
    /// `book/base::idx`
    pub id: String,
    #[serde(default)]
    pub lesson_id: String,
    #[serde(default)]
    pub book: String,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub idx: usize,
    #[serde(default)]
    pub start: f64,
    pub en: String,
    #[serde(default)]
    pub cn: String,
    #[serde(default)]
    pub ts: i64,
}

impl SentenceFavorite {
    pub fn id_for(lesson: &LessonId, index: usize) -> String {
        format!("{}::{}", lesson, index)
    }

    pub fn from_line(lesson: &LessonId, meta: &LessonMeta, index: usize, line: &TimedLine) -> Self {
        let (title, sub) = lesson_heading(meta, lesson);
        Self {
            id: Self::id_for(lesson, index),
            lesson_id: lesson.to_string(),
            book: lesson.book.clone(),
            base: lesson.filename.clone(),
            title,
            sub,
            idx: index,
            start: if line.start.is_finite() { line.start } else { 0.0 },
            en: line.en.clone(),
            cn: line.cn.clone(),
            ts: now_millis(),
        }
    }

    /// The source lesson, from `lessonId` or `book`/`base`
    pub fn lesson(&self) -> Option<LessonId> {
        LessonId::parse(&self.lesson_id).or_else(|| {
            (!self.book.is_empty() && !self.base.is_empty())
                .then(|| LessonId::new(self.book.clone(), self.base.clone()))
        })
    }

    /// Point the source lesson at this sentence and return it for opening
    pub fn jump_to_source(
        &self,
        store: &dyn KeyValueStore,
        session: &dyn KeyValueStore,
    ) -> Option<LessonId> {
        let lesson = self.lesson()?;
        ignore_failure(
            LAST_POSITIONS_KEY,
            save_position(store, &lesson.to_string(), LastPosition::new(self.start, self.idx)),
        );
        ResumeMarker {
            lesson: lesson.clone(),
            autoplay: false,
        }
        .write(session);
        Some(lesson)
    }
}

/// The favorites list in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentenceFavorites {
    items: Vec<SentenceFavorite>,
}

impl SentenceFavorites {
    /// Load, dropping entries without an id or English text
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let raw: Vec<serde_json::Value> = get_json(store, SENTENCE_FAVORITES_KEY).unwrap_or_default();
        let items = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        Self { items }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), PersistenceError> {
        set_json(store, SENTENCE_FAVORITES_KEY, &self.items)
    }

    pub fn items(&self) -> &[SentenceFavorite] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SentenceFavorite> {
        self.items.get(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|f| f.id == id)
    }

    /// Add the favorite, or remove it when already present; returns whether
    /// it is now a favorite
    pub fn toggle(&mut self, favorite: SentenceFavorite) -> bool {
        if self.remove(&favorite.id) {
            return false;
        }
        self.items.push(favorite);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|f| f.id != id);
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::navigation::take_resume_marker;
    use crate::features::progress::load_position;
    use crate::features::store::MemoryStore;

    fn lesson() -> LessonId {
        LessonId::parse("NCE2/01-A Private Conversation").unwrap()
    }

    fn meta() -> LessonMeta {
        LessonMeta {
            album: "New Concept English 2".to_string(),
            artist: "Longman".to_string(),
            title: "A private conversation".to_string(),
            author: String::new(),
        }
    }

    #[test]
    fn test_heading_falls_back_to_lesson() {
        let (title, sub) = lesson_heading(&LessonMeta::default(), &lesson());
        assert_eq!(title, "01-A Private Conversation");
        assert_eq!(sub, "NCE2 ·");
        let (title, sub) = lesson_heading(&meta(), &lesson());
        assert_eq!(title, "A private conversation");
        assert_eq!(sub, "New Concept English 2 · Longman");
    }

    #[test]
    fn test_toggle_and_persist() {
        let store = MemoryStore::new();
        let line = TimedLine::new(4.2, "I had a very good seat.", "我的座位很好。");
        let mut favs = SentenceFavorites::load(&store);
        let fav = SentenceFavorite::from_line(&lesson(), &meta(), 3, &line);
        assert_eq!(fav.id, "NCE2/01-A Private Conversation::3");

        assert!(favs.toggle(fav.clone()));
        favs.save(&store).unwrap();
        let loaded = SentenceFavorites::load(&store);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains(&fav.id));
        assert_eq!(loaded.get(0).unwrap().lesson_id, "NCE2/01-A Private Conversation");

        assert!(!favs.toggle(fav));
        assert!(favs.is_empty());
    }

    #[test]
    fn test_load_filters_invalid_entries() {
        let store = MemoryStore::new();
        store
            .set(
                SENTENCE_FAVORITES_KEY,
                r#"[{"id":"NCE1/001::0","en":"Excuse me!"},{"id":5,"en":"bad"},{"en":"no id"},null]"#,
            )
            .unwrap();
        let favs = SentenceFavorites::load(&store);
        assert_eq!(favs.len(), 1);
        assert_eq!(favs.items()[0].en, "Excuse me!");
    }

    #[test]
    fn test_jump_to_source() {
        let store = MemoryStore::new();
        let session = MemoryStore::new();
        let mut fav = SentenceFavorite::from_line(
            &lesson(),
            &meta(),
            5,
            &TimedLine::new(18.5, "Nobody", ""),
        );
        fav.lesson_id.clear();
        let target = fav.jump_to_source(&store, &session).unwrap();
        assert_eq!(target, lesson());
        let pos = load_position(&store, &target.to_string()).unwrap();
        assert_eq!(pos.idx, 5);
        assert!((pos.t - 18.5).abs() < 1e-9);
        let marker = take_resume_marker(&session).unwrap();
        assert!(!marker.autoplay);
    }
}
