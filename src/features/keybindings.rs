//! Customizable keyboard shortcuts
//!
//! Each action is bound to one key, identified by its DOM-style key string
//! (`" "`, `"r"`, `"ArrowRight"`). Only bindings that differ from the
//! defaults are persisted.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::{KeyValueStore, get_json, set_json};
use crate::error::PersistenceError;

pub const SHORTCUTS_KEY: &str = "nce_shortcuts";

/// All bindable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    PlayPause,
    Replay,
    NextSentence,
    PrevSentence,
    VolumeUp,
    VolumeDown,
    ToggleReveal,
}

impl Action {
    pub fn all() -> &'static [Action] {
        &[
            Action::PlayPause,
            Action::Replay,
            Action::NextSentence,
            Action::PrevSentence,
            Action::VolumeUp,
            Action::VolumeDown,
            Action::ToggleReveal,
        ]
    }

    /// Get human-readable name for the action
    pub fn display_name(&self) -> &'static str {
        match self {
            Action::PlayPause => "播放 / 暂停",
            Action::Replay => "重播当前句",
            Action::NextSentence => "下一句",
            Action::PrevSentence => "上一句",
            Action::VolumeUp => "增加音量",
            Action::VolumeDown => "减少音量",
            Action::ToggleReveal => "显示/隐藏当前句",
        }
    }

    /// Settings panel group
    pub fn group(&self) -> &'static str {
        match self {
            Action::PlayPause | Action::Replay => "播放控制",
            Action::NextSentence | Action::PrevSentence => "句子导航",
            Action::VolumeUp | Action::VolumeDown => "音量控制",
            Action::ToggleReveal => "听读模式",
        }
    }

    pub fn default_key(&self) -> &'static str {
        match self {
            Action::PlayPause => " ",
            Action::Replay => "r",
            Action::NextSentence => "ArrowRight",
            Action::PrevSentence => "ArrowLeft",
            Action::VolumeUp => "ArrowUp",
            Action::VolumeDown => "ArrowDown",
            Action::ToggleReveal => "v",
        }
    }
}

/// Short display label for a key string
pub fn key_display_name(key: &str) -> String {
    match key {
        "" => "?".to_string(),
        " " | "Spacebar" => "Space".to_string(),
        "ArrowUp" => "↑".to_string(),
        "ArrowDown" => "↓".to_string(),
        "ArrowLeft" => "←".to_string(),
        "ArrowRight" => "→".to_string(),
        "Enter" => "↵".to_string(),
        "Escape" => "Esc".to_string(),
        "Backspace" => "⌫".to_string(),
        "Delete" => "Del".to_string(),
        other if other.chars().count() == 1 => other.to_uppercase(),
        other => other.to_string(),
    }
}

/// Errors that can occur when rebinding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyBindingsError {
    #[error("key {key:?} is already bound to {action:?}")]
    Conflict { key: String, action: Action },
    #[error("empty key")]
    EmptyKey,
}

/// The keybindings configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBindings {
    bindings: HashMap<Action, String>,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            bindings: Action::all()
                .iter()
                .map(|a| (*a, a.default_key().to_string()))
                .collect(),
        }
    }
}

impl KeyBindings {
    /// Load customised bindings over the defaults
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let mut bindings = Self::default();
        if let Some(saved) = get_json::<HashMap<String, String>>(store, SHORTCUTS_KEY) {
            for action in Action::all() {
                let name = serde_json::to_value(action)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string));
                if let Some(key) = name.and_then(|n| saved.get(&n)) {
                    if !key.is_empty() {
                        bindings.bindings.insert(*action, key.clone());
                    }
                }
            }
        }
        bindings
    }

    /// Persist only bindings that differ from the defaults
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), PersistenceError> {
        let custom: BTreeMap<Action, &str> = self
            .bindings
            .iter()
            .filter(|(action, key)| key.as_str() != action.default_key())
            .map(|(action, key)| (*action, key.as_str()))
            .collect();
        if custom.is_empty() {
            store.remove(SHORTCUTS_KEY)
        } else {
            set_json(store, SHORTCUTS_KEY, &custom)
        }
    }

    pub fn get(&self, action: Action) -> &str {
        self.bindings
            .get(&action)
            .map(String::as_str)
            .unwrap_or_else(|| action.default_key())
    }

    pub fn is_custom(&self, action: Action) -> bool {
        self.get(action) != action.default_key()
    }

    /// Another action already using `key` (case-insensitive)
    pub fn find_conflict(&self, action: Action, key: &str) -> Option<Action> {
        let wanted = key.to_lowercase();
        Action::all()
            .iter()
            .copied()
            .find(|other| *other != action && self.get(*other).to_lowercase() == wanted)
    }

    /// Rebind an action, refusing keys used elsewhere
    pub fn set(&mut self, action: Action, key: &str) -> Result<(), KeyBindingsError> {
        if key.is_empty() {
            return Err(KeyBindingsError::EmptyKey);
        }
        if let Some(other) = self.find_conflict(action, key) {
            return Err(KeyBindingsError::Conflict {
                key: key.to_string(),
                action: other,
            });
        }
        self.bindings.insert(action, key.to_string());
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Find the action bound to a pressed key
    pub fn find_action(&self, key: &str) -> Option<Action> {
        let pressed = key.to_lowercase();
        Action::all()
            .iter()
            .copied()
            .find(|action| self.get(*action).to_lowercase() == pressed)
    }

    /// Get display string for an action's keybinding
    pub fn display_for_action(&self, action: Action) -> String {
        key_display_name(self.get(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::store::MemoryStore;

    #[test]
    fn test_default_bindings() {
        let bindings = KeyBindings::default();
        assert_eq!(bindings.find_action(" "), Some(Action::PlayPause));
        assert_eq!(bindings.find_action("R"), Some(Action::Replay));
        assert_eq!(bindings.find_action("x"), None);
        assert_eq!(bindings.display_for_action(Action::NextSentence), "→");
        assert_eq!(bindings.display_for_action(Action::PlayPause), "Space");
        assert_eq!(bindings.display_for_action(Action::ToggleReveal), "V");
    }

    #[test]
    fn test_conflict_detection() {
        let mut bindings = KeyBindings::default();
        assert_eq!(
            bindings.set(Action::Replay, "V"),
            Err(KeyBindingsError::Conflict {
                key: "V".to_string(),
                action: Action::ToggleReveal
            })
        );
        // Rebinding to its own key is fine
        assert!(bindings.set(Action::Replay, "R").is_ok());
        assert_eq!(bindings.set(Action::Replay, ""), Err(KeyBindingsError::EmptyKey));
    }

    #[test]
    fn test_only_custom_bindings_are_saved() {
        let store = MemoryStore::new();
        let mut bindings = KeyBindings::default();
        bindings.save(&store).unwrap();
        assert!(store.get(SHORTCUTS_KEY).is_none());

        bindings.set(Action::Replay, "e").unwrap();
        bindings.save(&store).unwrap();
        assert_eq!(store.get(SHORTCUTS_KEY).as_deref(), Some(r#"{"replay":"e"}"#));

        let loaded = KeyBindings::load(&store);
        assert_eq!(loaded.get(Action::Replay), "e");
        assert!(loaded.is_custom(Action::Replay));
        assert!(!loaded.is_custom(Action::PlayPause));

        bindings.reset();
        bindings.save(&store).unwrap();
        assert!(store.get(SHORTCUTS_KEY).is_none());
    }

    #[test]
    fn test_load_ignores_garbage() {
        let store = MemoryStore::new();
        store.set(SHORTCUTS_KEY, "[1,2]").unwrap();
        assert_eq!(KeyBindings::load(&store), KeyBindings::default());
    }
}
