//! Simulated media element on the tokio clock
//!
//! `VirtualMedia` behaves like an HTML audio element without decoding any
//! audio: position advances with `tokio::time`, seeks complete after a short
//! latency, and progress, end-of-media and metadata events are produced by a
//! driver task. With a paused tokio clock every run is deterministic, which
//! is what the engine tests and the `simulate` command rely on.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::media::{
    MediaElement, MediaEvent, MediaEventReceiver, MediaEventSender, MediaSource,
    media_event_channel,
};
use super::timer::{earliest, sleep_until_opt};
use crate::error::PlayError;

/// How the simulated server treats seeks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekBehavior {
    /// Seeks land exactly
    #[default]
    Accurate,
    /// Streamed sources restart from zero on every seek; buffered sources
    /// seek exactly
    RangeUnsupported,
    /// Seeks land exactly but never report completion
    Silent,
}

/// How the simulated platform treats `play()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayPolicy {
    #[default]
    Allowed,
    /// `play()` is rejected
    Blocked,
    /// `play()` is accepted but playback never starts
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualMediaOptions {
    pub duration: f64,
    pub seek_behavior: SeekBehavior,
    pub play_policy: PlayPolicy,
    /// Delay before `LoadedMetadata` after a source is attached
    pub metadata_delay: Duration,
    pub seek_latency: Duration,
    /// Interval between `TimeUpdate` events while playing
    pub tick: Duration,
}

impl Default for VirtualMediaOptions {
    fn default() -> Self {
        Self {
            duration: 60.0,
            seek_behavior: SeekBehavior::Accurate,
            play_policy: PlayPolicy::Allowed,
            metadata_delay: Duration::from_millis(20),
            seek_latency: Duration::from_millis(30),
            tick: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
struct VirtualState {
    options: VirtualMediaOptions,
    metadata_loaded: bool,
    buffered: bool,
    playing: bool,
    anchor_pos: f64,
    anchor_at: Instant,
    rate: f64,
    volume: f32,
    muted: bool,
    pending_seek: Option<Instant>,
    pending_metadata: Option<Instant>,
    next_tick: Option<Instant>,
    seeks: Vec<f64>,
    plays: usize,
    closed: bool,
    events: MediaEventSender,
}

impl VirtualState {
    fn position(&self, now: Instant) -> f64 {
        if !self.playing {
            return self.anchor_pos;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at).as_secs_f64();
        (self.anchor_pos + elapsed * self.rate).min(self.options.duration)
    }

    fn reanchor(&mut self, now: Instant) {
        self.anchor_pos = self.position(now);
        self.anchor_at = now;
    }

    fn end_at(&self) -> Option<Instant> {
        if !self.playing || self.rate <= 0.0 {
            return None;
        }
        let remaining = ((self.options.duration - self.anchor_pos) / self.rate).max(0.0);
        Some(self.anchor_at + Duration::from_secs_f64(remaining))
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.pending_seek,
            self.pending_metadata,
            self.next_tick,
            self.end_at(),
        ])
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    /// Produce every event that is due at `now`
    fn advance(&mut self, now: Instant) {
        if self.pending_metadata.is_some_and(|at| at <= now) {
            self.pending_metadata = None;
            self.metadata_loaded = true;
            self.emit(MediaEvent::LoadedMetadata {
                duration: self.options.duration,
            });
            self.emit(MediaEvent::CanPlay);
        }
        if self.pending_seek.is_some_and(|at| at <= now) {
            self.pending_seek = None;
            self.emit(MediaEvent::Seeked);
            self.emit(MediaEvent::CanPlay);
        }
        if self.end_at().is_some_and(|at| at <= now) {
            self.anchor_pos = self.options.duration;
            self.anchor_at = now;
            self.playing = false;
            self.next_tick = None;
            self.emit(MediaEvent::TimeUpdate);
            self.emit(MediaEvent::Pause);
            self.emit(MediaEvent::Ended);
            return;
        }
        if let Some(at) = self.next_tick {
            if at <= now {
                self.next_tick = Some(now + self.options.tick);
                self.emit(MediaEvent::TimeUpdate);
            }
        }
    }
}

/// Shared view of a `VirtualMedia` for tests and tooling
#[derive(Debug, Clone)]
pub struct VirtualMediaControl {
    state: Arc<Mutex<VirtualState>>,
    wake: Arc<Notify>,
}

impl VirtualMediaControl {
    pub fn position(&self) -> f64 {
        self.state.lock().position(Instant::now())
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn is_buffered(&self) -> bool {
        self.state.lock().buffered
    }

    /// Every seek target requested so far
    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }

    /// Number of accepted `play()` calls
    pub fn plays(&self) -> usize {
        self.state.lock().plays
    }

    pub fn set_play_policy(&self, policy: PlayPolicy) {
        self.state.lock().options.play_policy = policy;
    }

    pub fn set_seek_behavior(&self, behavior: SeekBehavior) {
        self.state.lock().options.seek_behavior = behavior;
        self.wake.notify_one();
    }
}

/// Simulated `MediaElement`
#[derive(Debug)]
pub struct VirtualMedia {
    source: MediaSource,
    state: Arc<Mutex<VirtualState>>,
    wake: Arc<Notify>,
}

impl VirtualMedia {
    /// Create the element and start its driver task
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(source: MediaSource, options: VirtualMediaOptions) -> (Self, MediaEventReceiver) {
        let (events, rx) = media_event_channel();
        let now = Instant::now();
        let state = Arc::new(Mutex::new(VirtualState {
            options,
            metadata_loaded: false,
            buffered: source.is_buffered(),
            playing: false,
            anchor_pos: 0.0,
            anchor_at: now,
            rate: 1.0,
            volume: 1.0,
            muted: false,
            pending_seek: None,
            pending_metadata: Some(now + options.metadata_delay),
            next_tick: None,
            seeks: Vec::new(),
            plays: 0,
            closed: false,
            events,
        }));
        let wake = Arc::new(Notify::new());
        tokio::spawn(drive(state.clone(), wake.clone()));
        (
            Self {
                source,
                state,
                wake,
            },
            rx,
        )
    }

    pub fn control(&self) -> VirtualMediaControl {
        VirtualMediaControl {
            state: self.state.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl Drop for VirtualMedia {
    fn drop(&mut self) {
        self.state.lock().closed = true;
        self.wake.notify_one();
    }
}

async fn drive(state: Arc<Mutex<VirtualState>>, wake: Arc<Notify>) {
    loop {
        let deadline = {
            let s = state.lock();
            if s.closed || s.events.is_closed() {
                break;
            }
            s.next_deadline()
        };
        tokio::select! {
            _ = wake.notified() => {}
            _ = sleep_until_opt(deadline) => {
                state.lock().advance(Instant::now());
            }
        }
    }
    tracing::debug!("Virtual media driver stopped");
}

impl MediaElement for VirtualMedia {
    fn current_time(&self) -> f64 {
        self.state.lock().position(Instant::now())
    }

    fn set_current_time(&mut self, seconds: f64) {
        let now = Instant::now();
        {
            let mut s = self.state.lock();
            let target = seconds.clamp(0.0, s.options.duration);
            let landed = match s.options.seek_behavior {
                SeekBehavior::RangeUnsupported if !s.buffered => 0.0,
                _ => target,
            };
            s.seeks.push(target);
            s.anchor_pos = landed;
            s.anchor_at = now;
            s.pending_seek = match s.options.seek_behavior {
                SeekBehavior::Silent => None,
                _ => Some(now + s.options.seek_latency),
            };
        }
        self.wake.notify_one();
    }

    fn duration(&self) -> Option<f64> {
        let s = self.state.lock();
        s.metadata_loaded.then_some(s.options.duration)
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn set_playback_rate(&mut self, rate: f64) {
        {
            let mut s = self.state.lock();
            if (s.rate - rate).abs() < f64::EPSILON {
                return;
            }
            s.reanchor(Instant::now());
            s.rate = rate;
            s.emit(MediaEvent::RateChange);
        }
        self.wake.notify_one();
    }

    fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn muted(&self) -> bool {
        self.state.lock().muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn paused(&self) -> bool {
        !self.state.lock().playing
    }

    fn play(&mut self) -> Result<(), PlayError> {
        {
            let mut s = self.state.lock();
            match s.options.play_policy {
                PlayPolicy::Blocked => return Err(PlayError::AutoplayBlocked),
                PlayPolicy::Stalled => return Ok(()),
                PlayPolicy::Allowed => {}
            }
            s.plays += 1;
            if s.playing {
                return Ok(());
            }
            let now = Instant::now();
            if s.anchor_pos >= s.options.duration {
                s.anchor_pos = 0.0;
            }
            s.anchor_at = now;
            s.playing = true;
            s.next_tick = Some(now + s.options.tick);
            s.emit(MediaEvent::Play);
        }
        self.wake.notify_one();
        Ok(())
    }

    fn pause(&mut self) {
        {
            let mut s = self.state.lock();
            if !s.playing {
                return;
            }
            s.reanchor(Instant::now());
            s.playing = false;
            s.next_tick = None;
            s.emit(MediaEvent::Pause);
        }
        self.wake.notify_one();
    }

    fn source(&self) -> &MediaSource {
        &self.source
    }

    fn set_source(&mut self, source: MediaSource) {
        {
            let mut s = self.state.lock();
            let now = Instant::now();
            s.buffered = source.is_buffered();
            s.metadata_loaded = false;
            s.playing = false;
            s.next_tick = None;
            s.pending_seek = None;
            s.anchor_pos = 0.0;
            s.anchor_at = now;
            s.rate = 1.0;
            s.volume = 1.0;
            s.muted = false;
            s.pending_metadata = Some(now + s.options.metadata_delay);
        }
        self.source = source;
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(options: VirtualMediaOptions) -> (VirtualMedia, MediaEventReceiver) {
        VirtualMedia::new(MediaSource::Url("lesson.mp3".into()), options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_then_progress() {
        let (mut m, mut rx) = media(VirtualMediaOptions {
            duration: 1.0,
            ..Default::default()
        });
        assert_eq!(m.duration(), None);
        assert_eq!(rx.recv().await, Some(MediaEvent::LoadedMetadata { duration: 1.0 }));
        assert_eq!(rx.recv().await, Some(MediaEvent::CanPlay));
        assert_eq!(m.duration(), Some(1.0));

        m.play().unwrap();
        assert_eq!(rx.recv().await, Some(MediaEvent::Play));
        assert_eq!(rx.recv().await, Some(MediaEvent::TimeUpdate));
        assert!((m.current_time() - 0.25).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_media() {
        let (mut m, mut rx) = media(VirtualMediaOptions {
            duration: 0.3,
            tick: Duration::from_secs(10),
            ..Default::default()
        });
        m.play().unwrap();
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = ev == MediaEvent::Ended;
            seen.push(ev);
            if done {
                break;
            }
        }
        assert!(seen.ends_with(&[MediaEvent::TimeUpdate, MediaEvent::Pause, MediaEvent::Ended]));
        assert!(m.paused());
        assert!((m.current_time() - 0.3).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_unsupported_until_buffered() {
        let (mut m, mut rx) = media(VirtualMediaOptions {
            seek_behavior: SeekBehavior::RangeUnsupported,
            ..Default::default()
        });
        m.set_current_time(12.0);
        assert_eq!(m.current_time(), 0.0);
        m.set_source(MediaSource::Buffered(Arc::from(vec![0u8; 4])));
        m.set_current_time(12.0);
        assert_eq!(m.current_time(), 12.0);
        assert!(m.control().is_buffered());
        assert_eq!(m.control().seeks(), vec![12.0, 12.0]);
        // metadata for the new source, then one completion for the last seek
        let mut seeked = 0;
        for _ in 0..4 {
            if rx.recv().await == Some(MediaEvent::Seeked) {
                seeked += 1;
            }
        }
        assert!(seeked >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_policies() {
        let (mut m, _rx) = media(VirtualMediaOptions {
            play_policy: PlayPolicy::Blocked,
            ..Default::default()
        });
        assert_eq!(m.play(), Err(PlayError::AutoplayBlocked));
        m.control().set_play_policy(PlayPolicy::Stalled);
        assert_eq!(m.play(), Ok(()));
        assert!(m.paused());
        m.control().set_play_policy(PlayPolicy::Allowed);
        m.play().unwrap();
        assert!(!m.paused());
        assert_eq!(m.control().plays(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_scales_progress() {
        let (mut m, _rx) = media(VirtualMediaOptions::default());
        m.set_playback_rate(2.0);
        m.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((m.current_time() - 1.0).abs() < 1e-6);
        m.pause();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((m.current_time() - 1.0).abs() < 1e-6);
    }
}
