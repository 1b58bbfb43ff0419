//! nce-flow - lesson audio player core
//!
//! Timed bilingual transcripts, segment-accurate playback with several
//! reading modes, shadowing with automatic pauses, and the learner data
//! around it (progress, favorites, settings, backups).

pub mod api;
pub mod audio;
pub mod error;
pub mod features;
pub mod utils;
