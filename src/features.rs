//! Feature modules - lesson content and learner data
//!
//! Each feature module contains the logic for one concern. Features do not
//! depend on the playback engine, except for the shared mode types.

pub mod backup;
pub mod favorites;
pub mod keybindings;
pub mod navigation;
pub mod progress;
pub mod search;
pub mod settings;
pub mod store;
pub mod transcript;
pub mod tts;

pub use backup::{BackupBundle, ImportSummary};
pub use favorites::{SentenceFavorite, SentenceFavorites};
pub use keybindings::{Action, KeyBindings};
pub use navigation::{LessonId, LessonIndex, LessonLink, ResumeMarker};
pub use progress::{LastPosition, RevealedSentences};
pub use search::{SearchHit, SearchIndex};
pub use settings::Settings;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use transcript::{LessonMeta, TimedLine, Transcript};
pub use tts::{ReviewPlayer, SpeechSynth, TtsLoop, TtsSettings};
