//! Spoken review of favorite sentences
//!
//! Speech itself is delegated to a platform `SpeechSynth`. This module owns
//! the settings, the voice ranking and the queue policy. A sequence number
//! guards every utterance so that a stop or a jump invalidates callbacks of
//! the one still finishing.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::{KeyValueStore, ignore_failure};

pub const TTS_RATE_KEY: &str = "nce_tts_rate";
pub const TTS_LOOP_KEY: &str = "nce_tts_loop";
pub const TTS_VOICE_KEY: &str = "nce_tts_voice";

pub const TTS_MIN_RATE: f64 = 0.5;
pub const TTS_MAX_RATE: f64 = 2.5;

/// Rates offered in the settings panel
pub const RATE_OPTIONS: [f64; 11] = [0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 1.25, 1.4, 1.5, 1.75, 2.0];

const PREFERRED_VOICE_NAMES: [&str; 12] = [
    "Siri", "Samantha", "Alex", "Daniel", "Karen", "Tessa", "Moira", "Oliver", "Arthur", "Aaron",
    "Allison", "Ava",
];

static NOVELTY_VOICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bad news|good news|bahh|bells|boing|bubbles|cellos|jester|junior|whisper|trinoids?)\b")
        .expect("static regex")
});

/// Clamp a speech rate; non-numbers become 1.0
pub fn clamp_tts_rate(value: Option<&str>) -> f64 {
    match value.and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(rate) if rate.is_finite() => rate.clamp(TTS_MIN_RATE, TTS_MAX_RATE),
        _ => 1.0,
    }
}

/// `1x`, `1.5x`, `1.10x`
pub fn rate_label(rate: f64) -> String {
    let hundredths = (rate * 100.0).round() as i64;
    if hundredths % 25 == 0 {
        format!("{}x", rate)
    } else {
        format!("{:.2}x", rate)
    }
}

/// What happens after a sentence was spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsLoop {
    /// Speak the current sentence once
    #[default]
    Off,
    /// Repeat the current sentence
    One,
    /// Walk the whole list, wrapping at the end
    All,
}

impl TtsLoop {
    pub fn parse(value: &str) -> Self {
        match value {
            "one" => Self::One,
            "all" => Self::All,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::One => "one",
            Self::All => "all",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "循环：关",
            Self::One => "循环：单句",
            Self::All => "循环：全清单",
        }
    }

    /// Index to speak after `current` finished, if any
    pub fn next_index(self, current: usize, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self {
            Self::Off => None,
            Self::One => Some(current.min(len - 1)),
            Self::All if current + 1 >= len => Some(0),
            Self::All => Some(current + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    pub rate: f64,
    pub loop_mode: TtsLoop,
    /// Saved voice name, empty for automatic choice
    pub voice: String,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            loop_mode: TtsLoop::Off,
            voice: String::new(),
        }
    }
}

impl TtsSettings {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            rate: clamp_tts_rate(store.get(TTS_RATE_KEY).as_deref()),
            loop_mode: store
                .get(TTS_LOOP_KEY)
                .map(|v| TtsLoop::parse(&v))
                .unwrap_or_default(),
            voice: store.get(TTS_VOICE_KEY).unwrap_or_default(),
        }
    }

    pub fn set_rate(&mut self, store: &dyn KeyValueStore, rate: f64) {
        self.rate = clamp_tts_rate(Some(&rate.to_string()));
        ignore_failure(TTS_RATE_KEY, store.set(TTS_RATE_KEY, &self.rate.to_string()));
    }

    pub fn set_loop(&mut self, store: &dyn KeyValueStore, loop_mode: TtsLoop) {
        self.loop_mode = loop_mode;
        ignore_failure(TTS_LOOP_KEY, store.set(TTS_LOOP_KEY, loop_mode.as_str()));
    }

    pub fn set_voice(&mut self, store: &dyn KeyValueStore, name: &str) {
        self.voice = name.to_string();
        ignore_failure(TTS_VOICE_KEY, store.set(TTS_VOICE_KEY, name));
    }

    /// Drop a saved novelty voice so the ranking picks a sensible one
    pub fn discard_novelty_voice(&mut self, store: &dyn KeyValueStore) {
        if is_novelty_voice(&self.voice) {
            self.voice.clear();
            ignore_failure(TTS_VOICE_KEY, store.remove(TTS_VOICE_KEY));
        }
    }
}

/// A voice offered by the speech engine
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Voice {
    pub name: String,
    pub lang: String,
    pub local_service: bool,
    pub default: bool,
}

pub fn is_novelty_voice(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty() && NOVELTY_VOICE_RE.is_match(name)
}

pub fn preferred_voice_bonus(name: &str) -> i32 {
    PREFERRED_VOICE_NAMES
        .iter()
        .position(|k| name == *k || name.starts_with(&format!("{} ", k)))
        .map(|rank| 220 - rank as i32 * 10)
        .unwrap_or(0)
}

/// Rank a voice for reading text in `lang_prefix`
pub fn voice_score(voice: &Voice, lang_prefix: &str) -> i32 {
    let mut score = 0;
    if voice.lang.to_lowercase().starts_with(lang_prefix) {
        score += 120;
    }
    if voice.local_service {
        score += 30;
    }
    if voice.default {
        score += 20;
    }
    score += preferred_voice_bonus(&voice.name);
    if is_novelty_voice(&voice.name) {
        score -= 1000;
    }
    score
}

/// Voices best first, ties by name
pub fn rank_voices(voices: &[Voice], lang_prefix: &str) -> Vec<Voice> {
    let mut sorted = voices.to_vec();
    sorted.sort_by(|a, b| {
        voice_score(b, lang_prefix)
            .cmp(&voice_score(a, lang_prefix))
            .then_with(|| a.name.cmp(&b.name))
    });
    sorted
}

/// The saved voice if still offered, otherwise the best ranked one
pub fn pick_voice<'a>(voices: &'a [Voice], saved: &str, lang_prefix: &str) -> Option<&'a Voice> {
    if !saved.is_empty() {
        if let Some(found) = voices.iter().find(|v| v.name == saved) {
            return Some(found);
        }
    }
    voices
        .iter()
        .max_by(|a, b| {
            voice_score(a, lang_prefix)
                .cmp(&voice_score(b, lang_prefix))
                // keep the earliest of equal scores
                .then(std::cmp::Ordering::Greater)
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeechError {
    #[error("speech synthesis is not supported on this platform")]
    Unsupported,
    #[error("speech synthesis failed: {0}")]
    Failed(String),
    #[error("utterance was cancelled")]
    Cancelled,
}

/// Platform text-to-speech
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Speak `text`, resolving when the utterance ends
    async fn speak(&self, text: &str, rate: f64, voice: Option<&Voice>) -> Result<(), SpeechError>;
    fn cancel(&self);
    fn pause(&self);
    fn resume(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    Stopped,
    Playing,
    Paused,
}

/// One sentence to speak
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub seq: u64,
    pub index: usize,
    pub text: String,
}

/// Queue position and sequencing over a list of sentences
#[derive(Debug)]
pub struct ReviewQueue {
    texts: Vec<String>,
    current: Option<usize>,
    seq: u64,
    state: TtsState,
}

impl ReviewQueue {
    pub fn new(texts: Vec<String>) -> Self {
        let current = if texts.is_empty() { None } else { Some(0) };
        Self {
            texts,
            current,
            seq: 0,
            state: TtsState::Stopped,
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn state(&self) -> TtsState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Begin speaking item `index` (clamped); `None` for an empty list or text
    pub fn start(&mut self, index: usize) -> Option<Utterance> {
        if self.texts.is_empty() {
            return None;
        }
        let index = index.min(self.texts.len() - 1);
        self.current = Some(index);
        let text = self.texts[index].trim().to_string();
        if text.is_empty() {
            return None;
        }
        self.seq += 1;
        self.state = TtsState::Playing;
        Some(Utterance {
            seq: self.seq,
            index,
            text,
        })
    }

    /// The utterance `seq` ended; decide what comes next
    pub fn on_end(&mut self, seq: u64, loop_mode: TtsLoop) -> Option<Utterance> {
        if seq != self.seq {
            return None;
        }
        let next = self
            .current
            .and_then(|i| loop_mode.next_index(i, self.texts.len()));
        match next {
            Some(i) => self.start(i),
            None => {
                self.state = TtsState::Stopped;
                None
            }
        }
    }

    /// The utterance `seq` failed
    pub fn on_error(&mut self, seq: u64) {
        if seq == self.seq {
            self.state = TtsState::Stopped;
        }
    }

    pub fn stop(&mut self) {
        self.seq += 1;
        self.state = TtsState::Stopped;
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.state != TtsState::Stopped {
            self.state = if paused { TtsState::Paused } else { TtsState::Playing };
        }
    }

    pub fn prev_index(&self) -> usize {
        self.current.map(|i| i.saturating_sub(1)).unwrap_or(0)
    }

    pub fn next_index(&self) -> usize {
        let last = self.texts.len().saturating_sub(1);
        self.current.map(|i| (i + 1).min(last)).unwrap_or(0)
    }
}

/// Drives a `SpeechSynth` through a `ReviewQueue`
pub struct ReviewPlayer<S: SpeechSynth> {
    synth: Arc<S>,
    queue: Arc<Mutex<ReviewQueue>>,
    settings: TtsSettings,
    voice: Option<Voice>,
}

impl<S: SpeechSynth> ReviewPlayer<S> {
    pub fn new(synth: Arc<S>, texts: Vec<String>, settings: TtsSettings, voice: Option<Voice>) -> Self {
        Self {
            synth,
            queue: Arc::new(Mutex::new(ReviewQueue::new(texts))),
            settings,
            voice,
        }
    }

    pub fn queue(&self) -> Arc<Mutex<ReviewQueue>> {
        self.queue.clone()
    }

    /// Speak from `index` following the loop policy until the queue stops
    /// or another call supersedes this one
    pub async fn play_from(&self, index: usize) {
        self.synth.cancel();
        let mut next = self.queue.lock().start(index);
        while let Some(utterance) = next {
            let result = self
                .synth
                .speak(&utterance.text, self.settings.rate, self.voice.as_ref())
                .await;
            next = match result {
                Ok(()) => self.queue.lock().on_end(utterance.seq, self.settings.loop_mode),
                Err(e) => {
                    tracing::debug!("Utterance {} ended with {}", utterance.seq, e);
                    self.queue.lock().on_error(utterance.seq);
                    None
                }
            };
        }
    }

    pub fn stop(&self) {
        self.queue.lock().stop();
        self.synth.cancel();
    }

    pub fn toggle_pause(&self) {
        let mut queue = self.queue.lock();
        match queue.state() {
            TtsState::Playing => {
                self.synth.pause();
                queue.set_paused(true);
            }
            TtsState::Paused => {
                self.synth.resume();
                queue.set_paused(false);
            }
            TtsState::Stopped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::store::MemoryStore;

    fn voice(name: &str, lang: &str, local: bool, default: bool) -> Voice {
        Voice {
            name: name.to_string(),
            lang: lang.to_string(),
            local_service: local,
            default,
        }
    }

    #[test]
    fn test_rate_handling() {
        assert_eq!(clamp_tts_rate(None), 1.0);
        assert_eq!(clamp_tts_rate(Some("abc")), 1.0);
        assert_eq!(clamp_tts_rate(Some("4")), 2.5);
        assert_eq!(clamp_tts_rate(Some("0.1")), 0.5);
        assert_eq!(rate_label(1.0), "1x");
        assert_eq!(rate_label(1.25), "1.25x");
        assert_eq!(rate_label(1.1), "1.10x");
    }

    #[test]
    fn test_loop_policy() {
        assert_eq!(TtsLoop::Off.next_index(2, 5), None);
        assert_eq!(TtsLoop::One.next_index(2, 5), Some(2));
        assert_eq!(TtsLoop::All.next_index(2, 5), Some(3));
        assert_eq!(TtsLoop::All.next_index(4, 5), Some(0));
        assert_eq!(TtsLoop::All.next_index(0, 0), None);
        assert_eq!(TtsLoop::parse("bogus"), TtsLoop::Off);
    }

    #[test]
    fn test_voice_score() {
        assert_eq!(voice_score(&voice("Samantha", "en-US", true, true), "en"), 120 + 30 + 20 + 210);
        assert_eq!(voice_score(&voice("Siri Voice 2", "en-GB", false, false), "en"), 120 + 220);
        assert_eq!(voice_score(&voice("Bubbles", "en-US", true, false), "en"), 120 + 30 - 1000);
        assert_eq!(voice_score(&voice("Ting-Ting", "zh-CN", true, false), "en"), 30);
    }

    #[test]
    fn test_pick_voice() {
        let voices = vec![
            voice("Bells", "en-US", true, true),
            voice("Google UK English Female", "en-GB", false, false),
            voice("Daniel", "en-GB", true, false),
        ];
        assert_eq!(pick_voice(&voices, "", "en").unwrap().name, "Daniel");
        assert_eq!(
            pick_voice(&voices, "Google UK English Female", "en").unwrap().name,
            "Google UK English Female"
        );
        assert_eq!(pick_voice(&voices, "Gone", "en").unwrap().name, "Daniel");
        assert!(pick_voice(&[], "", "en").is_none());
        let ranked = rank_voices(&voices, "en");
        assert_eq!(ranked.last().unwrap().name, "Bells");
    }

    #[test]
    fn test_settings_persist() {
        let store = MemoryStore::new();
        let mut settings = TtsSettings::load(&store);
        assert_eq!(settings, TtsSettings::default());
        settings.set_rate(&store, 3.0);
        settings.set_loop(&store, TtsLoop::All);
        settings.set_voice(&store, "Whisper");
        let mut loaded = TtsSettings::load(&store);
        assert_eq!(loaded.rate, 2.5);
        assert_eq!(loaded.loop_mode, TtsLoop::All);
        loaded.discard_novelty_voice(&store);
        assert!(loaded.voice.is_empty());
        assert!(store.get(TTS_VOICE_KEY).is_none());
    }

    #[test]
    fn test_queue_sequencing() {
        let mut q = ReviewQueue::new(vec!["One.".into(), "  ".into(), "Three.".into()]);
        let first = q.start(0).unwrap();
        assert_eq!(q.state(), TtsState::Playing);
        let second = q.on_end(first.seq, TtsLoop::One).unwrap();
        assert_eq!(second.index, 0);
        // a superseded utterance is ignored
        assert!(q.on_end(first.seq, TtsLoop::All).is_none());
        assert_eq!(q.state(), TtsState::Playing);

        q.stop();
        assert!(q.on_end(second.seq, TtsLoop::All).is_none());
        assert_eq!(q.state(), TtsState::Stopped);

        assert!(q.start(1).is_none());
        assert_eq!(q.current(), Some(1));
        let last = q.start(9).unwrap();
        assert_eq!(last.index, 2);
        assert_eq!(q.on_end(last.seq, TtsLoop::All).unwrap().index, 0);
        assert_eq!(q.next_index(), 1);
        assert_eq!(q.prev_index(), 0);
    }

    struct CountingSynth {
        spoken: Mutex<Vec<String>>,
        limit: usize,
    }

    #[async_trait]
    impl SpeechSynth for CountingSynth {
        async fn speak(&self, text: &str, _rate: f64, _voice: Option<&Voice>) -> Result<(), SpeechError> {
            let mut spoken = self.spoken.lock();
            if spoken.len() >= self.limit {
                return Err(SpeechError::Cancelled);
            }
            spoken.push(text.to_string());
            Ok(())
        }
        fn cancel(&self) {}
        fn pause(&self) {}
        fn resume(&self) {}
    }

    #[tokio::test]
    async fn test_review_player_walks_list() {
        let synth = Arc::new(CountingSynth {
            spoken: Mutex::new(Vec::new()),
            limit: 5,
        });
        let settings = TtsSettings {
            loop_mode: TtsLoop::All,
            ..TtsSettings::default()
        };
        let player = ReviewPlayer::new(
            synth.clone(),
            vec!["A".into(), "B".into(), "C".into()],
            settings,
            None,
        );
        player.play_from(1).await;
        assert_eq!(*synth.spoken.lock(), vec!["B", "C", "A", "B", "C"]);
        assert_eq!(player.queue().lock().state(), TtsState::Stopped);
    }
}
