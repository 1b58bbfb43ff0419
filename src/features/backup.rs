//! Export and import of all locally stored data
//!
//! A backup is one JSON document with three sections. Values stored as
//! JSON are embedded as JSON, everything else as strings, so a backup is
//! readable and can be edited by hand.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::favorites::{LESSON_FAVORITES_KEY, SENTENCE_FAVORITES_KEY};
use super::keybindings::SHORTCUTS_KEY;
use super::progress::{LAST_POSITIONS_KEY, RECENTS_KEY, REVEALED_KEY};
use super::settings::SettingKey;
use super::store::KeyValueStore;
use super::tts::{TTS_LOOP_KEY, TTS_RATE_KEY, TTS_VOICE_KEY};
use crate::error::ImportError;

pub const BACKUP_APP: &str = "NCE-Flow";
pub const BACKUP_FORMAT: u64 = 1;

pub const USER_DATA_KEYS: [&str; 5] = [
    SENTENCE_FAVORITES_KEY,
    LESSON_FAVORITES_KEY,
    RECENTS_KEY,
    LAST_POSITIONS_KEY,
    REVEALED_KEY,
];

pub const TTS_KEYS: [&str; 3] = [TTS_RATE_KEY, TTS_LOOP_KEY, TTS_VOICE_KEY];

/// Keys kept by the page shell rather than the player
const SHELL_SETTING_KEYS: [&str; 2] = ["nce_lang_mode", "nce_theme"];

/// Every settings key carried in a backup
pub fn settings_keys() -> Vec<&'static str> {
    SettingKey::all()
        .iter()
        .map(|k| k.key())
        .chain(std::iter::once(SHORTCUTS_KEY))
        .chain(SHELL_SETTING_KEYS)
        .collect()
}

fn is_json_key(key: &str) -> bool {
    USER_DATA_KEYS.contains(&key) || key == SHORTCUTS_KEY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub exported_at: String,
    #[serde(default)]
    pub format: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupBundle {
    pub meta: BackupMeta,
    #[serde(default)]
    pub user_data: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub tts_settings: Map<String, Value>,
}

fn collect(store: &dyn KeyValueStore, keys: &[&str]) -> Map<String, Value> {
    let mut section = Map::new();
    for key in keys {
        let Some(raw) = store.get(key) else { continue };
        let value = if is_json_key(key) {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        } else {
            Value::String(raw)
        };
        section.insert(key.to_string(), value);
    }
    section
}

fn section_of(root: &Map<String, Value>, name: &str) -> Map<String, Value> {
    match root.get(name) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

impl BackupBundle {
    /// Snapshot the store
    pub fn export(store: &dyn KeyValueStore) -> Self {
        let settings_keys = settings_keys();
        Self {
            meta: BackupMeta {
                app: BACKUP_APP.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                format: BACKUP_FORMAT,
            },
            user_data: collect(store, &USER_DATA_KEYS),
            settings: collect(store, &settings_keys),
            tts_settings: collect(store, &TTS_KEYS),
        }
    }

    /// Suggested download name, `NCE-Flow-backup-2024-05-01.json`
    pub fn file_name() -> String {
        format!("NCE-Flow-backup-{}.json", chrono::Local::now().format("%Y-%m-%d"))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse and validate a backup document
    pub fn parse(json: &str) -> Result<Self, ImportError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(root) = value else {
            return Err(ImportError::NotAnObject);
        };
        let meta = match root.get("meta") {
            Some(meta @ Value::Object(_)) => serde_json::from_value::<BackupMeta>(meta.clone())
                .map_err(|_| ImportError::ForeignApp(String::new()))?,
            _ => return Err(ImportError::ForeignApp(String::new())),
        };
        if meta.app != BACKUP_APP {
            return Err(ImportError::ForeignApp(meta.app));
        }
        if meta.format > BACKUP_FORMAT {
            return Err(ImportError::UnsupportedFormat(meta.format));
        }
        Ok(Self {
            meta,
            user_data: section_of(&root, "userData"),
            settings: section_of(&root, "settings"),
            tts_settings: section_of(&root, "ttsSettings"),
        })
    }

    pub fn summary(&self) -> ImportSummary {
        let array_len = |key: &str| match self.user_data.get(key) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };
        let settings_keys = settings_keys();
        ImportSummary {
            sentence_favorites: array_len(SENTENCE_FAVORITES_KEY),
            lesson_favorites: array_len(LESSON_FAVORITES_KEY),
            recents: array_len(RECENTS_KEY),
            positions: match self.user_data.get(LAST_POSITIONS_KEY) {
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            },
            settings: self
                .settings
                .keys()
                .filter(|k| settings_keys.contains(&k.as_str()))
                .count(),
            tts_settings: self
                .tts_settings
                .keys()
                .filter(|k| TTS_KEYS.contains(&k.as_str()))
                .count(),
        }
    }

    /// Overwrite the store with every known key present in the bundle
    pub fn apply(&self, store: &dyn KeyValueStore) -> Result<usize, ImportError> {
        let settings_keys = settings_keys();
        let mut written = 0;
        for (keys, section) in [
            (&USER_DATA_KEYS[..], &self.user_data),
            (&settings_keys[..], &self.settings),
            (&TTS_KEYS[..], &self.tts_settings),
        ] {
            for key in keys {
                let Some(value) = section.get(*key) else { continue };
                let raw = match value {
                    Value::String(s) if !is_json_key(key) => s.clone(),
                    other => other.to_string(),
                };
                store.set(key, &raw)?;
                written += 1;
            }
        }
        tracing::info!("Imported {} stored values from backup", written);
        Ok(written)
    }
}

/// Counts shown before an import is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub sentence_favorites: usize,
    pub lesson_favorites: usize,
    pub recents: usize,
    pub positions: usize,
    pub settings: usize,
    pub tts_settings: usize,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            (self.sentence_favorites, "条句子收藏"),
            (self.lesson_favorites, "课课文收藏"),
            (self.recents, "条最近播放"),
            (self.positions, "课播放进度"),
            (self.settings, "项设置"),
            (self.tts_settings, "项朗读配置"),
        ]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{} {}", n, label))
        .collect();
        if parts.is_empty() {
            write!(f, "空备份（无数据）")
        } else {
            write!(f, "{}", parts.join("，"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::store::MemoryStore;

    fn populated() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .set(SENTENCE_FAVORITES_KEY, r#"[{"id":"NCE1/001::0","en":"Excuse me!"}]"#)
            .unwrap();
        store
            .set(LAST_POSITIONS_KEY, r#"{"NCE1/001":{"t":1.5,"idx":1,"ts":0},"NCE1/003":{"t":0,"idx":0,"ts":0}}"#)
            .unwrap();
        store.set("readMode", "shadow").unwrap();
        store.set(SHORTCUTS_KEY, r#"{"replay":"e"}"#).unwrap();
        store.set(TTS_LOOP_KEY, "all").unwrap();
        store.set("unrelated", "x").unwrap();
        store
    }

    #[test]
    fn test_export_embeds_json_values() {
        let bundle = BackupBundle::export(&populated());
        assert_eq!(bundle.meta.app, BACKUP_APP);
        assert_eq!(bundle.meta.format, BACKUP_FORMAT);
        assert!(bundle.user_data[SENTENCE_FAVORITES_KEY].is_array());
        assert_eq!(bundle.settings["readMode"], Value::String("shadow".into()));
        assert!(bundle.settings[SHORTCUTS_KEY].is_object());
        assert!(!bundle.settings.contains_key("unrelated"));
        assert!(BackupBundle::file_name().starts_with("NCE-Flow-backup-"));
    }

    #[test]
    fn test_summary() {
        let bundle = BackupBundle::export(&populated());
        let summary = bundle.summary();
        assert_eq!(summary.sentence_favorites, 1);
        assert_eq!(summary.positions, 2);
        assert_eq!(summary.settings, 2);
        assert_eq!(summary.tts_settings, 1);
        assert_eq!(
            summary.to_string(),
            "1 条句子收藏，2 课播放进度，2 项设置，1 项朗读配置"
        );
        assert_eq!(ImportSummary::default().to_string(), "空备份（无数据）");
    }

    #[test]
    fn test_export_then_import_restores_store() {
        let json = BackupBundle::export(&populated()).to_json().unwrap();
        let target = MemoryStore::new();
        let bundle = BackupBundle::parse(&json).unwrap();
        assert_eq!(bundle.apply(&target).unwrap(), 5);
        assert_eq!(target.get("readMode").as_deref(), Some("shadow"));
        assert_eq!(target.get(TTS_LOOP_KEY).as_deref(), Some("all"));
        assert_eq!(target.get(SHORTCUTS_KEY).as_deref(), Some(r#"{"replay":"e"}"#));
        assert!(target.get("unrelated").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_bundles() {
        assert!(matches!(BackupBundle::parse("not json"), Err(ImportError::Parse(_))));
        assert!(matches!(BackupBundle::parse("[1]"), Err(ImportError::NotAnObject)));
        assert!(matches!(
            BackupBundle::parse(r#"{"meta":{"app":"Other"}}"#),
            Err(ImportError::ForeignApp(app)) if app == "Other"
        ));
        assert!(matches!(BackupBundle::parse(r#"{"userData":{}}"#), Err(ImportError::ForeignApp(_))));
        assert!(matches!(
            BackupBundle::parse(r#"{"meta":{"app":"NCE-Flow","format":2}}"#),
            Err(ImportError::UnsupportedFormat(2))
        ));
        let empty = BackupBundle::parse(r#"{"meta":{"app":"NCE-Flow","format":1},"settings":"junk"}"#).unwrap();
        assert!(empty.settings.is_empty());
    }

    #[test]
    fn test_import_into_read_only_store_fails() {
        let bundle = BackupBundle::export(&populated());
        let store = MemoryStore::read_only();
        assert!(matches!(bundle.apply(&store), Err(ImportError::Persistence(_))));
    }
}
