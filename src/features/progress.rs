//! Per-lesson progress: last positions, recently played lessons and the
//! sentences revealed in listen mode.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::store::{KeyValueStore, get_json, set_json};
use crate::error::PersistenceError;
use crate::utils::now_millis;

pub const LAST_POSITIONS_KEY: &str = "nce_lastpos";
pub const RECENTS_KEY: &str = "nce_recents";
pub const REVEALED_KEY: &str = "nce_revealed_sentences";

/// Maximum number of recently played lessons kept
pub const RECENTS_CAP: usize = 60;

/// Where a lesson was left off
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastPosition {
    #[serde(default)]
    pub t: f64,
    #[serde(default)]
    pub idx: usize,
    #[serde(default)]
    pub ts: i64,
}

impl LastPosition {
    pub fn new(t: f64, idx: usize) -> Self {
        Self {
            t: if t.is_finite() { t.max(0.0) } else { 0.0 },
            idx,
            ts: now_millis(),
        }
    }
}

pub fn last_positions(store: &dyn KeyValueStore) -> BTreeMap<String, LastPosition> {
    get_json(store, LAST_POSITIONS_KEY).unwrap_or_default()
}

pub fn load_position(store: &dyn KeyValueStore, lesson_id: &str) -> Option<LastPosition> {
    last_positions(store).remove(lesson_id)
}

pub fn save_position(
    store: &dyn KeyValueStore,
    lesson_id: &str,
    position: LastPosition,
) -> Result<(), PersistenceError> {
    let mut map = last_positions(store);
    map.insert(lesson_id.to_string(), position);
    set_json(store, LAST_POSITIONS_KEY, &map)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntry {
    pub id: String,
    #[serde(default)]
    pub ts: i64,
}

/// Recently played lessons, newest first
pub fn recents(store: &dyn KeyValueStore) -> Vec<RecentEntry> {
    get_json(store, RECENTS_KEY).unwrap_or_default()
}

/// Move `lesson_id` to the front of the recents list
pub fn touch_recent(store: &dyn KeyValueStore, lesson_id: &str) -> Result<(), PersistenceError> {
    let rest = recents(store).into_iter().filter(|e| e.id != lesson_id);
    let next: Vec<RecentEntry> = std::iter::once(RecentEntry {
        id: lesson_id.to_string(),
        ts: now_millis(),
    })
    .chain(rest)
    .take(RECENTS_CAP)
    .collect();
    set_json(store, RECENTS_KEY, &next)
}

/// Sentences the learner uncovered in listen mode, for one lesson
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevealedSentences {
    lesson_id: String,
    indices: BTreeSet<usize>,
}

impl RevealedSentences {
    pub fn load(store: &dyn KeyValueStore, lesson_id: &str) -> Self {
        let mut all: BTreeMap<String, Vec<usize>> = get_json(store, REVEALED_KEY).unwrap_or_default();
        Self {
            lesson_id: lesson_id.to_string(),
            indices: all.remove(lesson_id).unwrap_or_default().into_iter().collect(),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Flip the revealed state of a line; returns the new state
    pub fn toggle(&mut self, index: usize) -> bool {
        if self.indices.remove(&index) {
            false
        } else {
            self.indices.insert(index);
            true
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), PersistenceError> {
        let mut all: BTreeMap<String, Vec<usize>> = get_json(store, REVEALED_KEY).unwrap_or_default();
        all.insert(self.lesson_id.clone(), self.indices.iter().copied().collect());
        set_json(store, REVEALED_KEY, &all)
    }
}
