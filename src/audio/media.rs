//! Media element abstraction
//!
//! The engine drives an HTML-audio-like element: settable position and
//! rate, play/pause, and an asynchronous event stream. Seeks complete
//! asynchronously and are reported with `MediaEvent::Seeked`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PlayError;

/// Where the element reads its audio from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Streamed from a URL; seek precision depends on server range support
    Url(String),
    /// Entire file held in memory; seeks are always precise
    Buffered(Arc<[u8]>),
}

impl MediaSource {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            Self::Buffered(_) => None,
        }
    }
}

/// Events emitted by a media element
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Playback started
    Play,
    /// Playback paused (including the implicit pause at end of media)
    Pause,
    /// A seek finished
    Seeked,
    /// Enough data to continue after a seek or load
    CanPlay,
    /// Duration became known
    LoadedMetadata { duration: f64 },
    /// Periodic position progress
    TimeUpdate,
    /// Reached end of media
    Ended,
    /// Playback rate changed
    RateChange,
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;
pub type MediaEventReceiver = mpsc::UnboundedReceiver<MediaEvent>;

pub fn media_event_channel() -> (MediaEventSender, MediaEventReceiver) {
    mpsc::unbounded_channel()
}

/// Contract the engine consumes from an audio element
pub trait MediaElement: Send + 'static {
    fn current_time(&self) -> f64;
    /// Request a seek; completion arrives as `MediaEvent::Seeked`
    fn set_current_time(&mut self, seconds: f64);
    /// Total duration, `None` until metadata is loaded
    fn duration(&self) -> Option<f64>;
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&mut self, rate: f64);
    fn volume(&self) -> f32;
    fn set_volume(&mut self, volume: f32);
    fn muted(&self) -> bool;
    fn set_muted(&mut self, muted: bool);
    fn paused(&self) -> bool;
    fn play(&mut self) -> Result<(), PlayError>;
    fn pause(&mut self);
    fn source(&self) -> &MediaSource;
    /// Replace the source; duration resets until the next `LoadedMetadata`
    fn set_source(&mut self, source: MediaSource);
}

/// Platform class, which tunes timing margins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformProfile {
    #[default]
    Desktop,
    /// iOS-like touch platforms with coarser audio scheduling
    Touch,
}

impl PlatformProfile {
    /// Remaining time below which the detector polls per frame
    pub fn near_window(self) -> Duration {
        match self {
            Self::Desktop => Duration::from_millis(120),
            Self::Touch => Duration::from_millis(160),
        }
    }

    /// Early-fire guard at 1x playback, in seconds
    pub fn guard_base(self) -> f64 {
        match self {
            Self::Desktop => 0.06,
            Self::Touch => 0.08,
        }
    }

    /// Extra guard per unit of playback rate above 1x, in seconds
    pub fn guard_slope(self) -> f64 {
        match self {
            Self::Desktop => 0.02,
            Self::Touch => 0.03,
        }
    }

    /// How long to wait for a seek to report completion
    pub fn seek_timeout(self) -> Duration {
        match self {
            Self::Desktop => Duration::from_millis(1200),
            Self::Touch => Duration::from_millis(2500),
        }
    }

    /// Boundary guard for a playback rate (rate clamped to 0.5..=3)
    pub fn guard_ahead(self, rate: f64) -> f64 {
        let r = if rate.is_finite() { rate.clamp(0.5, 3.0) } else { 1.0 };
        self.guard_base() + (r - 1.0) * self.guard_slope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_grows_with_rate() {
        let p = PlatformProfile::Desktop;
        assert!((p.guard_ahead(1.0) - 0.06).abs() < 1e-9);
        assert!((p.guard_ahead(2.0) - 0.08).abs() < 1e-9);
        assert!((p.guard_ahead(10.0) - 0.10).abs() < 1e-9);
        assert!((p.guard_ahead(0.1) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_touch_is_more_conservative() {
        let d = PlatformProfile::Desktop;
        let t = PlatformProfile::Touch;
        assert!(t.guard_ahead(1.5) > d.guard_ahead(1.5));
        assert!(t.near_window() > d.near_window());
        assert!(t.seek_timeout() > d.seek_timeout());
    }
}
