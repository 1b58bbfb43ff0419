//! Lesson playback engine
//!
//! - `LessonPlayer`: Segment playback, reading modes and lesson-end policies
//! - `task`: Runs a player on a tokio task behind a `PlayerHandle`
//! - `scheduler`, `seek`, `shadow`, `mode`: The state machines the player drives
//! - `media`: The `MediaElement` abstraction; `virtual_media` simulates one
//! - `events`: Commands in, events out, shared snapshot for the UI

pub mod boundary;
pub mod events;
pub mod handle;
pub mod media;
pub mod mode;
mod player;
pub mod scheduler;
pub mod seek;
pub mod session;
pub mod shadow;
mod task;
pub mod timer;
pub mod virtual_media;

pub use boundary::{compute_end, end_for, line_at};
pub use events::{
    Notice, PlaybackSnapshot, PlayerCommand, PlayerEvent, PlayerEventReceiver, SharedPlaybackState,
};
pub use handle::PlayerHandle;
pub use media::{MediaElement, MediaEvent, MediaSource, PlatformProfile};
pub use mode::{AfterFinish, ReadMode};
pub use player::{LessonPlayer, LessonSource, PlayerConfig, nudge_start};
pub use shadow::GapMode;
pub use task::{PlayerTaskHandle, spawn_lesson_player};
pub use virtual_media::{PlayPolicy, SeekBehavior, VirtualMedia, VirtualMediaOptions};
