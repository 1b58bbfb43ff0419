//! Player settings persistence
//!
//! Each setting lives under its own key in the `KeyValueStore`. Stored values
//! are parsed leniently and normalised; anything unreadable falls back to its
//! default.

use serde::{Deserialize, Serialize};

use super::store::{KeyValueStore, ignore_failure};
use crate::audio::mode::{AfterFinish, ModeState, ReadMode};
use crate::audio::shadow::{DEFAULT_REPEATS, GapMode, normalize_repeats};
use crate::error::PersistenceError;
use crate::utils::round2;

pub const MIN_RATE: f64 = 0.5;
pub const MAX_RATE: f64 = 2.5;
pub const DEFAULT_RATE: f64 = 1.0;
pub const DEFAULT_AUTO_STOP_COUNT: u32 = 3;
pub const MAX_AUTO_STOP_COUNT: u32 = 50;

/// Storage keys for individual settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    PlaybackRate,
    ReadMode,
    AutoFollow,
    AfterFinish,
    SkipIntro,
    ShadowRepeats,
    ShadowGap,
    AutoStopEnabled,
    AutoStopCount,
    Volume,
}

impl SettingKey {
    pub fn all() -> &'static [SettingKey] {
        &[
            Self::PlaybackRate,
            Self::ReadMode,
            Self::AutoFollow,
            Self::AfterFinish,
            Self::SkipIntro,
            Self::ShadowRepeats,
            Self::ShadowGap,
            Self::AutoStopEnabled,
            Self::AutoStopCount,
            Self::Volume,
        ]
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::PlaybackRate => "audioPlaybackRate",
            Self::ReadMode => "readMode",
            Self::AutoFollow => "autoFollow",
            Self::AfterFinish => "afterPlay",
            Self::SkipIntro => "skipIntro",
            Self::ShadowRepeats => "shadowRepeatCount",
            Self::ShadowGap => "shadowGapMode",
            Self::AutoStopEnabled => "autoStopEnabled",
            Self::AutoStopCount => "autoStopCount",
            Self::Volume => "nce_volume",
        }
    }
}

const LEGACY_LOOP_MODE: &str = "loopMode";
const LEGACY_AUTO_CONTINUE: &str = "autoContinue";

/// Parse a rate typed by a user: `,` and `，` are accepted as decimal points
pub fn parse_rate_value(value: &str) -> Option<f64> {
    let text = value.trim().replace(['，', ','], ".");
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Clamp to the supported range and round to two decimals
pub fn normalize_playback_rate(rate: f64) -> f64 {
    if !rate.is_finite() {
        return DEFAULT_RATE;
    }
    round2(rate.clamp(MIN_RATE, MAX_RATE))
}

/// Display form: one decimal when exact, two otherwise (`1.0`, `1.25`)
pub fn format_rate(rate: f64) -> String {
    let n = round2(rate);
    if !n.is_finite() {
        return format!("{:.1}", DEFAULT_RATE);
    }
    let one = (n * 10.0).round() / 10.0;
    if (n - one).abs() < 0.001 {
        format!("{:.1}", one)
    } else {
        format!("{:.2}", n)
    }
}

/// Leading integer of a string, ignoring any trailing text
pub fn parse_leading_int(value: &str) -> Option<i64> {
    let text = value.trim();
    let end = text
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

pub fn normalize_auto_stop_count(value: i64) -> u32 {
    value.clamp(1, MAX_AUTO_STOP_COUNT as i64) as u32
}

/// Player settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub playback_rate: f64,
    pub read_mode: ReadMode,
    pub auto_follow: bool,
    pub after_finish: AfterFinish,
    pub skip_intro: bool,
    pub shadow_repeats: u8,
    pub shadow_gap: GapMode,
    /// Stop auto-advancing after `auto_stop_count` lessons
    pub auto_stop_enabled: bool,
    pub auto_stop_count: u32,
    /// Volume level (0.0 to 1.0)
    pub volume: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playback_rate: DEFAULT_RATE,
            read_mode: ReadMode::Continuous,
            auto_follow: true,
            after_finish: AfterFinish::None,
            skip_intro: false,
            shadow_repeats: DEFAULT_REPEATS,
            shadow_gap: GapMode::Medium,
            auto_stop_enabled: false,
            auto_stop_count: DEFAULT_AUTO_STOP_COUNT,
            volume: 1.0,
        }
    }
}

impl Settings {
    /// Load settings, migrating legacy loop keys when needed
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let defaults = Self::default();
        let get = |key: SettingKey| store.get(key.key());

        let playback_rate = get(SettingKey::PlaybackRate)
            .and_then(|v| parse_rate_value(&v))
            .map(normalize_playback_rate)
            .unwrap_or(defaults.playback_rate);
        let read_mode = get(SettingKey::ReadMode)
            .and_then(|v| ReadMode::parse(&v))
            .unwrap_or(defaults.read_mode);
        let mut auto_follow = get(SettingKey::AutoFollow)
            .map(|v| v == "true")
            .unwrap_or(defaults.auto_follow);

        let after_finish = match get(SettingKey::AfterFinish) {
            Some(v) => AfterFinish::parse(&v).unwrap_or(AfterFinish::None),
            None => {
                let migrated = Self::migrate_legacy(store);
                ignore_failure(
                    SettingKey::AfterFinish.key(),
                    store.set(SettingKey::AfterFinish.key(), migrated.as_str()),
                );
                migrated
            }
        };
        if after_finish == AfterFinish::NextLesson && !auto_follow {
            auto_follow = true;
            ignore_failure(
                SettingKey::AutoFollow.key(),
                store.set(SettingKey::AutoFollow.key(), "true"),
            );
        }

        let skip_intro = get(SettingKey::SkipIntro).is_some_and(|v| v == "true");
        let shadow_repeats = get(SettingKey::ShadowRepeats)
            .and_then(|v| parse_leading_int(&v))
            .map(normalize_repeats)
            .unwrap_or(defaults.shadow_repeats);
        let shadow_gap = get(SettingKey::ShadowGap)
            .and_then(|v| GapMode::parse(&v))
            .unwrap_or(defaults.shadow_gap);
        let auto_stop_enabled = get(SettingKey::AutoStopEnabled).is_some_and(|v| v == "true");
        let auto_stop_count = get(SettingKey::AutoStopCount)
            .and_then(|v| parse_leading_int(&v))
            .map(normalize_auto_stop_count)
            .unwrap_or(defaults.auto_stop_count);
        let volume = get(SettingKey::Volume)
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.volume);

        Self {
            playback_rate,
            read_mode,
            auto_follow,
            after_finish,
            skip_intro,
            shadow_repeats,
            shadow_gap,
            auto_stop_enabled,
            auto_stop_count,
            volume,
        }
    }

    /// Derive the after-finish policy from the old `loopMode`/`autoContinue` keys
    fn migrate_legacy(store: &dyn KeyValueStore) -> AfterFinish {
        let loop_mode = store.get(LEGACY_LOOP_MODE);
        let auto_continue = store.get(LEGACY_AUTO_CONTINUE);
        let migrated = if auto_continue.as_deref() == Some("auto") {
            AfterFinish::NextLesson
        } else {
            match loop_mode.as_deref() {
                Some("single") => AfterFinish::SingleLoop,
                Some("all") => AfterFinish::AllLoop,
                _ => AfterFinish::None,
            }
        };
        if loop_mode.is_some() || auto_continue.is_some() {
            tracing::info!("Migrated legacy loop settings to afterPlay={}", migrated);
        }
        migrated
    }

    /// Stored string form of one setting
    pub fn value_of(&self, key: SettingKey) -> String {
        match key {
            SettingKey::PlaybackRate => self.playback_rate.to_string(),
            SettingKey::ReadMode => self.read_mode.as_str().to_string(),
            SettingKey::AutoFollow => self.auto_follow.to_string(),
            SettingKey::AfterFinish => self.after_finish.as_str().to_string(),
            SettingKey::SkipIntro => self.skip_intro.to_string(),
            SettingKey::ShadowRepeats => self.shadow_repeats.to_string(),
            SettingKey::ShadowGap => self.shadow_gap.as_str().to_string(),
            SettingKey::AutoStopEnabled => self.auto_stop_enabled.to_string(),
            SettingKey::AutoStopCount => self.auto_stop_count.to_string(),
            SettingKey::Volume => self.volume.to_string(),
        }
    }

    /// Write one setting
    pub fn save_one(&self, store: &dyn KeyValueStore, key: SettingKey) -> Result<(), PersistenceError> {
        store.set(key.key(), &self.value_of(key))
    }

    /// Write every setting
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), PersistenceError> {
        for key in SettingKey::all() {
            self.save_one(store, *key)?;
        }
        Ok(())
    }

    /// Mode state with invalid combinations corrected
    pub fn mode_state(&self) -> ModeState {
        ModeState::new(self.read_mode, self.after_finish, self.auto_follow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::store::MemoryStore;

    #[test]
    fn test_default_settings() {
        let store = MemoryStore::new();
        let s = Settings::load(&store);
        assert_eq!(s.playback_rate, 1.0);
        assert_eq!(s.read_mode, ReadMode::Continuous);
        assert!(s.auto_follow);
        assert_eq!(s.shadow_repeats, 2);
        assert_eq!(s.auto_stop_count, 3);
        // Migration writes the resolved policy
        assert_eq!(store.get("afterPlay").as_deref(), Some("none"));
    }

    #[test]
    fn test_rate_normalisation() {
        assert_eq!(parse_rate_value("1,25"), Some(1.25));
        assert_eq!(parse_rate_value(" 0，8 "), Some(0.8));
        assert_eq!(parse_rate_value("fast"), None);
        assert_eq!(normalize_playback_rate(3.0), 2.5);
        assert_eq!(normalize_playback_rate(0.1), 0.5);
        assert_eq!(normalize_playback_rate(1.234), 1.23);
        assert_eq!(format_rate(1.0), "1.0");
        assert_eq!(format_rate(1.25), "1.25");
    }

    #[test]
    fn test_lenient_integers() {
        assert_eq!(parse_leading_int("4"), Some(4));
        assert_eq!(parse_leading_int("7.9"), Some(7));
        assert_eq!(parse_leading_int("12abc"), Some(12));
        assert_eq!(parse_leading_int("abc"), None);

        let store = MemoryStore::new();
        store.set("shadowRepeatCount", "42").unwrap();
        store.set("autoStopCount", "0").unwrap();
        let s = Settings::load(&store);
        assert_eq!(s.shadow_repeats, 9);
        assert_eq!(s.auto_stop_count, 1);
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let store = MemoryStore::new();
        store.set("readMode", "karaoke").unwrap();
        store.set("afterPlay", "forever").unwrap();
        store.set("shadowGapMode", "huge").unwrap();
        store.set("nce_volume", "1.7").unwrap();
        let s = Settings::load(&store);
        assert_eq!(s.read_mode, ReadMode::Continuous);
        assert_eq!(s.after_finish, AfterFinish::None);
        assert_eq!(s.shadow_gap, GapMode::Medium);
        assert_eq!(s.volume, 1.0);
    }

    #[test]
    fn test_legacy_migration() {
        let store = MemoryStore::new();
        store.set("loopMode", "all").unwrap();
        assert_eq!(Settings::load(&store).after_finish, AfterFinish::AllLoop);

        let store = MemoryStore::new();
        store.set("loopMode", "single").unwrap();
        store.set("autoContinue", "auto").unwrap();
        store.set("autoFollow", "false").unwrap();
        let s = Settings::load(&store);
        assert_eq!(s.after_finish, AfterFinish::NextLesson);
        assert!(s.auto_follow);
        assert_eq!(store.get("afterPlay").as_deref(), Some("next"));
        assert_eq!(store.get("autoFollow").as_deref(), Some("true"));
    }

    #[test]
    fn test_save_and_reload() {
        let store = MemoryStore::new();
        let s = Settings {
            playback_rate: 1.5,
            read_mode: ReadMode::Shadow,
            auto_follow: false,
            after_finish: AfterFinish::AllLoop,
            skip_intro: true,
            shadow_repeats: 4,
            shadow_gap: GapMode::Long,
            auto_stop_enabled: true,
            auto_stop_count: 5,
            volume: 0.5,
        };
        s.save(&store).unwrap();
        assert_eq!(Settings::load(&store), s);
    }

    #[test]
    fn test_read_only_store_still_loads() {
        let store = MemoryStore::read_only();
        let s = Settings::load(&store);
        assert_eq!(s, Settings::default());
        assert!(s.save(&store).is_err());
    }

    #[test]
    fn test_mode_state_corrects_stored_combination() {
        let s = Settings {
            read_mode: ReadMode::Single,
            after_finish: AfterFinish::NextLesson,
            ..Settings::default()
        };
        assert_eq!(s.mode_state().after_finish(), AfterFinish::None);
    }
}
