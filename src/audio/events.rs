//! Player task communication types
//!
//! - `PlayerCommand` - Requests sent from the UI to the player task
//! - `PlayerEvent` - Notifications sent from the player task to the UI
//! - `SharedPlaybackState` - Snapshot for non-blocking reads from the UI
//!
//! ## Architecture
//! ```text
//! UI (PlayerHandle) --[PlayerCommand]--> Player task (LessonPlayer)
//! UI                <--[PlayerEvent]---- Player task
//! UI                <--[SharedState]---- Player task (non-blocking reads)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::mode::{AfterFinish, ReadMode};
use super::shadow::GapMode;
use crate::features::navigation::LessonId;
use crate::features::transcript::LessonMeta;

// ============ Commands (UI -> Player task) ============

/// Commands sent from the UI to the player task
///
/// Commands are processed in order; results come back as `PlayerEvent`s.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    /// Play a line picked by the learner
    PlayLine { index: usize },
    /// Play/pause key or button
    TogglePlay,
    /// Explicit pause, cancels everything pending
    Pause,
    NextLine,
    PrevLine,
    /// Replay the current line
    Replay,
    /// Retry playback inside a user gesture after `AutoplayBlocked`
    ResumeAfterGesture,
    SetMode { mode: ReadMode },
    SetAfterFinish { after_finish: AfterFinish },
    SetAutoFollow { enabled: bool },
    /// Playback rate, normalised before use
    SetRate { rate: f64 },
    /// Volume (0.0 - 1.0)
    SetVolume { volume: f32 },
    /// Relative volume step, e.g. from the keyboard
    AdjustVolume { delta: f32 },
    SetShadowRepeat { count: u8 },
    SetShadowGap { gap: GapMode },
    SetSkipIntro { enabled: bool },
    /// Show or hide the translation of the current line (listen mode)
    ToggleReveal,
    /// Stop auto-advancing after `count` lessons in a row
    SetAutoStop { enabled: bool, count: u32 },
    /// Persist the position and stop the task
    Shutdown,
}

// ============ Events (Player task -> UI) ============

/// Messages shown to the learner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The audio server ignores range requests; the whole file is loaded
    RangeUnsupported,
    /// The sleep timer stopped automatic lesson advance
    AutoStopped { lessons: u32 },
    /// The last lesson of the course finished
    CourseFinished,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Self::RangeUnsupported => {
                "当前服务器不支持音频跳转，已切换为完整音频加载以启用点读".to_string()
            }
            Self::AutoStopped { lessons } => format!("已自动停止（连续播放 {} 课）", lessons),
            Self::CourseFinished => "已经是最后一课".to_string(),
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Events emitted by the player task
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Transcript ready, offsets computed
    LessonLoaded {
        meta: LessonMeta,
        line_count: usize,
        first_content: usize,
        shadow_start: usize,
    },
    /// The highlighted line changed
    ActiveLineChanged {
        index: usize,
        /// Caused by a learner action
        manual: bool,
        /// The UI should scroll the line into view
        follow: bool,
    },
    /// Playback stopped at a segment boundary
    SegmentEnded { index: usize },
    /// Holding after a shadow pass
    ShadowGap {
        index: usize,
        gap: Duration,
        repeats_remaining: u8,
    },
    StateChanged { playing: bool },
    ModeChanged {
        mode: ReadMode,
        after_finish: AfterFinish,
        auto_follow: bool,
    },
    RateChanged { rate: f64 },
    VolumeChanged { volume: f32 },
    RevealChanged { index: usize, revealed: bool },
    Notice(Notice),
    /// Playback needs a user gesture; show a resume prompt
    AutoplayBlocked,
    /// Open this lesson next; its resume marker has been written
    NextLesson { lesson: LessonId },
}

// ============ Shared State ============

/// Everything the UI may read without asking the task
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub current_index: Option<usize>,
    /// Armed segment end, 0.0 when none
    pub segment_end: f64,
    pub position: f64,
    /// `None` until metadata is loaded
    pub duration: Option<f64>,
    pub playing: bool,
    pub mode: ReadMode,
    pub after_finish: AfterFinish,
    pub auto_follow: bool,
    pub rate: f64,
    pub volume: f32,
    pub shadow_repeats_remaining: u8,
    /// The whole file is playing from memory after a seek fallback
    pub buffered_source: bool,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            current_index: None,
            segment_end: 0.0,
            position: 0.0,
            duration: None,
            playing: false,
            mode: ReadMode::default(),
            after_finish: AfterFinish::default(),
            auto_follow: true,
            rate: 1.0,
            volume: 1.0,
            shadow_repeats_remaining: 0,
            buffered_source: false,
        }
    }
}

/// Thread-safe shared playback state
///
/// The UI reads this without blocking; the player task rewrites it after
/// every command and media event.
#[derive(Clone, Default)]
pub struct SharedPlaybackState {
    inner: Arc<RwLock<PlaybackSnapshot>>,
}

impl std::fmt::Debug for SharedPlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SharedPlaybackState")
            .field("current_index", &inner.current_index)
            .field("position", &inner.position)
            .field("playing", &inner.playing)
            .field("mode", &inner.mode)
            .finish()
    }
}

impl SharedPlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.read().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.read().playing
    }

    pub fn current_index(&self) -> Option<usize> {
        self.inner.read().current_index
    }

    pub fn position(&self) -> f64 {
        self.inner.read().position
    }

    pub fn mode(&self) -> ReadMode {
        self.inner.read().mode
    }

    // ---- Update methods (called by the player task) ----

    pub(crate) fn store(&self, snapshot: PlaybackSnapshot) {
        *self.inner.write() = snapshot;
    }
}

// ============ Channel Types ============

/// Sender for player commands (held by PlayerHandle)
pub type PlayerCommandSender = tokio::sync::mpsc::UnboundedSender<PlayerCommand>;
/// Receiver for player commands (held by the player task)
pub type PlayerCommandReceiver = tokio::sync::mpsc::UnboundedReceiver<PlayerCommand>;
/// Sender for player events (held by the player task)
pub type PlayerEventSender = tokio::sync::mpsc::UnboundedSender<PlayerEvent>;
/// Receiver for player events (held by the UI)
pub type PlayerEventReceiver = tokio::sync::mpsc::UnboundedReceiver<PlayerEvent>;

/// Create a new player command channel
pub fn player_command_channel() -> (PlayerCommandSender, PlayerCommandReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Create a new player event channel
pub fn player_event_channel() -> (PlayerEventSender, PlayerEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_roundtrip() {
        let state = SharedPlaybackState::new();
        assert!(!state.is_playing());
        assert_eq!(state.current_index(), None);
        let reader = state.clone();
        state.store(PlaybackSnapshot {
            current_index: Some(3),
            playing: true,
            mode: ReadMode::Shadow,
            ..PlaybackSnapshot::default()
        });
        assert!(reader.is_playing());
        assert_eq!(reader.current_index(), Some(3));
        assert_eq!(reader.mode(), ReadMode::Shadow);
    }

    #[test]
    fn test_notice_messages() {
        assert_eq!(
            Notice::AutoStopped { lessons: 3 }.to_string(),
            "已自动停止（连续播放 3 课）"
        );
        assert!(Notice::RangeUnsupported.message().contains("完整音频"));
    }
}
