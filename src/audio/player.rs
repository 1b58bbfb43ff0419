//! Lesson playback engine
//!
//! `LessonPlayer` owns one lesson: the transcript, the media element, the
//! session state machines and every pending deadline. The task loop in
//! `task.rs` feeds it commands, media events and internal messages, and
//! calls `on_timers` once `next_deadline` has passed. Nothing here blocks
//! and nothing is shared, so staleness is handled with sequence numbers and
//! tokens rather than locks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::boundary::line_at;
use super::events::{
    Notice, PlaybackSnapshot, PlayerCommand, PlayerEvent, PlayerEventSender, SharedPlaybackState,
};
use super::media::{MediaElement, MediaEvent, MediaSource, PlatformProfile};
use super::mode::{AfterFinish, ModeChange, ReadMode};
use super::scheduler::{AdvanceScheduler, Check, FRAME_INTERVAL, Observation, ScheduleHandle, SegmentEnd};
use super::seek::{RetryPolicy, SeekAttempt, SeekReconciler, SeekVerdict};
use super::session::PlaybackSession;
use super::shadow::{GapToken, ShadowStep};
use super::timer::{Timer, earliest};
use crate::api::Fetcher;
use crate::error::{FetchError, PlayError};
use crate::features::navigation::{
    AutoStopDecision, LessonId, LessonIndex, hand_off_to, register_finished_lesson, reset_auto_stop,
    take_resume_marker,
};
use crate::features::progress::{
    LAST_POSITIONS_KEY, LastPosition, RECENTS_KEY, REVEALED_KEY, RevealedSentences, load_position,
    save_position, touch_recent,
};
use crate::features::settings::{SettingKey, Settings, normalize_auto_stop_count, normalize_playback_rate};
use crate::features::store::{KeyValueStore, ignore_failure};
use crate::features::transcript::{ClassifierPolicy, ContentOffsets, Transcript};

/// Longest wait for metadata before a play request proceeds anyway
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
/// Debounce before a single-loop replay
pub const LOOP_REPLAY_DELAY: Duration = Duration::from_millis(300);
/// Delay before restarting the lesson under all-loop
pub const RESTART_DELAY: Duration = Duration::from_millis(100);
/// Re-arm delay after the media reports it started playing
pub const PLAY_REARM_DELAY: Duration = Duration::from_millis(50);
/// How long an autoplay attempt may stay silent before asking for a gesture
pub const AUTOPLAY_WATCH: Duration = Duration::from_millis(600);
pub const DEEP_LINK_DELAY: Duration = Duration::from_millis(150);
pub const GESTURE_SEEK_TIMEOUT: Duration = Duration::from_millis(900);
/// Longest wait for the whole-file fetch before playing from where the seek landed
pub const BUFFER_TIMEOUT: Duration = Duration::from_secs(15);
/// Minimum spacing of the progress safety net
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);
/// The safety net leaves a freshly started segment alone for this long
pub const SEGMENT_SETTLE: Duration = Duration::from_millis(350);
pub const SAVE_INTERVAL: Duration = Duration::from_secs(2);

/// Two frames, the settle time after a seek before unmuting or arming
const SETTLE: Duration = Duration::from_millis(2 * FRAME_INTERVAL.as_millis() as u64);
/// Distance from the segment end that counts as "stopped at the end"
const END_TOLERANCE: f64 = 0.1;
const NUDGE: f64 = 0.005;
/// Gesture resume skips the seek when already this close
const ALIGN_TOLERANCE: f64 = 0.15;
/// Gesture resume mutes the jump from zero when the target is past this
const MUTE_THRESHOLD: f64 = 0.05;

/// Messages the player sends to itself from spawned work
#[derive(Debug)]
pub(crate) enum PlayerMessage {
    /// The whole audio file for the seek fallback
    BufferedSource {
        seq: u64,
        result: Result<Vec<u8>, FetchError>,
    },
}

pub(crate) type PlayerMessageSender = mpsc::UnboundedSender<PlayerMessage>;
pub(crate) type PlayerMessageReceiver = mpsc::UnboundedReceiver<PlayerMessage>;

pub(crate) fn player_message_channel() -> (PlayerMessageSender, PlayerMessageReceiver) {
    mpsc::unbounded_channel()
}

/// Everything a player needs besides the lesson itself
#[derive(Clone)]
pub struct PlayerConfig {
    pub profile: PlatformProfile,
    pub classifier: ClassifierPolicy,
    /// Durable learner data and settings
    pub store: Arc<dyn KeyValueStore>,
    /// Per-session data (resume marker, auto-stop counter)
    pub session_store: Arc<dyn KeyValueStore>,
    pub fetcher: Arc<dyn Fetcher>,
    /// Needed to resolve the next lesson
    pub lesson_index: Option<LessonIndex>,
}

impl PlayerConfig {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        session_store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            profile: PlatformProfile::default(),
            classifier: ClassifierPolicy::default(),
            store,
            session_store,
            fetcher,
            lesson_index: None,
        }
    }

    pub fn with_profile(mut self, profile: PlatformProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierPolicy) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_lesson_index(mut self, index: LessonIndex) -> Self {
        self.lesson_index = Some(index);
        self
    }
}

impl std::fmt::Debug for PlayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerConfig")
            .field("profile", &self.profile)
            .field("classifier", &self.classifier)
            .field("lesson_index", &self.lesson_index.is_some())
            .finish()
    }
}

/// The lesson to play
#[derive(Debug, Clone)]
pub struct LessonSource {
    pub lesson: LessonId,
    pub transcript: Transcript,
    /// Streamed source, also fetched whole when seeking proves unreliable
    pub audio_url: String,
    /// Line requested by a `?line=N` link
    pub deep_link: Option<usize>,
}

impl LessonSource {
    pub fn new(lesson: LessonId, transcript: Transcript, audio_url: impl Into<String>) -> Self {
        Self {
            lesson,
            transcript,
            audio_url: audio_url.into(),
            deep_link: None,
        }
    }

    pub fn with_deep_link(mut self, line: usize) -> Self {
        self.deep_link = Some(line);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlayRequest {
    index: usize,
    manual: bool,
    shadow_repeat: bool,
}

/// The one asynchronous step the player is waiting on
#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    /// Play request issued before the duration was known
    Metadata(PlayRequest),
    /// Verified seek waiting for completion
    Seek(SeekAttempt),
    /// Fetching the whole file
    Buffering(SeekAttempt),
    /// Buffered source attached, waiting for its metadata
    BufferMetadata(SeekAttempt),
    GestureMetadata { desired: f64 },
    GestureSeek,
}

/// Levels and position carried across a source switch
#[derive(Debug, Clone, Copy, PartialEq)]
struct SourceRestore {
    rate: f64,
    volume: f32,
    muted: bool,
    position: f64,
    playing: bool,
}

#[derive(Debug, Default)]
struct Timers {
    detector: Timer<ScheduleHandle>,
    rearm: Timer<()>,
    unmute: Timer<()>,
    /// Timeout of `LessonPlayer::pending`
    pending: Timer<()>,
    loop_replay: Timer<()>,
    shadow_gap: Timer<GapToken>,
    restart: Timer<usize>,
    autoplay_watch: Timer<()>,
    deep_link: Timer<usize>,
}

impl Timers {
    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.detector.deadline(),
            self.rearm.deadline(),
            self.unmute.deadline(),
            self.pending.deadline(),
            self.loop_replay.deadline(),
            self.shadow_gap.deadline(),
            self.restart.deadline(),
            self.autoplay_watch.deadline(),
            self.deep_link.deadline(),
        ])
    }

    fn cancel_all(&mut self) {
        *self = Self::default();
    }
}

/// Start position for an automatic move to a line starting at `start`
///
/// When the media already sits on that start, a seek to the same spot can
/// stutter; the target moves 5ms forward instead, never past 50ms before
/// the end of the media.
pub fn nudge_start(start: f64, current: f64, duration: Option<f64>) -> f64 {
    if (start - current).abs() > NUDGE {
        return start;
    }
    let bound = match duration {
        Some(d) if d.is_finite() && d > 0.0 => (d - 0.05).max(0.0),
        _ => start + NUDGE,
    };
    bound.min(current + NUDGE)
}

/// Plays one lesson on a `MediaElement`
pub struct LessonPlayer<M: MediaElement> {
    media: M,
    lesson: LessonId,
    transcript: Transcript,
    audio_url: String,
    deep_link: Option<usize>,
    offsets: ContentOffsets,
    settings: Settings,
    session: PlaybackSession,
    scheduler: AdvanceScheduler,
    reconciler: SeekReconciler,
    store: Arc<dyn KeyValueStore>,
    session_store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn Fetcher>,
    lesson_index: Option<LessonIndex>,
    revealed: RevealedSentences,
    events: PlayerEventSender,
    state: SharedPlaybackState,
    internal_tx: PlayerMessageSender,

    /// Play request sequence; a seek completes only for the latest request
    seq: u64,
    pending: Option<Pending>,
    timers: Timers,
    /// The next pause comes from the player itself, not the learner
    internal_pause: bool,
    /// The next pause starts a shadow gap that must survive it
    shadow_auto_pause: bool,
    /// The player muted the media and must unmute it
    auto_muted: bool,
    source_restore: Option<SourceRestore>,
    segment_started_at: Option<Instant>,
    last_progress: Option<Instant>,
    last_saved: Option<Instant>,
}

impl<M: MediaElement> LessonPlayer<M> {
    pub(crate) fn new(
        config: PlayerConfig,
        source: LessonSource,
        media: M,
        events: PlayerEventSender,
        state: SharedPlaybackState,
        internal_tx: PlayerMessageSender,
    ) -> Self {
        let settings = Settings::load(config.store.as_ref());
        let offsets = ContentOffsets::compute(&source.transcript.lines, &config.classifier);
        let session = PlaybackSession::new(
            settings.mode_state(),
            settings.shadow_repeats,
            settings.shadow_gap,
        );
        let revealed = RevealedSentences::load(config.store.as_ref(), &source.lesson.to_string());
        Self {
            media,
            lesson: source.lesson,
            transcript: source.transcript,
            audio_url: source.audio_url,
            deep_link: source.deep_link,
            offsets,
            settings,
            session,
            scheduler: AdvanceScheduler::new(config.profile),
            reconciler: SeekReconciler::new(RetryPolicy::for_profile(config.profile)),
            store: config.store,
            session_store: config.session_store,
            fetcher: config.fetcher,
            lesson_index: config.lesson_index,
            revealed,
            events,
            state,
            internal_tx,
            seq: 0,
            pending: None,
            timers: Timers::default(),
            internal_pause: false,
            shadow_auto_pause: false,
            auto_muted: false,
            source_restore: None,
            segment_started_at: None,
            last_progress: None,
            last_saved: None,
        }
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn offsets(&self) -> ContentOffsets {
        self.offsets
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn lesson_key(&self) -> String {
        self.lesson.to_string()
    }

    // ============ Load ============

    /// Announce the lesson and apply deep links or a resume marker
    pub fn start(&mut self) {
        tracing::info!(
            "Loading lesson {} ({} lines, content from {}, shadow from {})",
            self.lesson,
            self.transcript.len(),
            self.offsets.first_content,
            self.offsets.shadow_start
        );
        ignore_failure(RECENTS_KEY, touch_recent(self.store.as_ref(), &self.lesson_key()));

        self.media.set_playback_rate(self.settings.playback_rate);
        self.media.set_volume(self.settings.volume);
        if let Some(duration) = self.media.duration() {
            self.apply_duration(duration);
        }

        self.emit(PlayerEvent::LessonLoaded {
            meta: self.transcript.meta.clone(),
            line_count: self.transcript.len(),
            first_content: self.offsets.first_content,
            shadow_start: self.offsets.shadow_start,
        });
        self.emit_mode();

        // The marker is consumed even when a deep link wins
        let marker = take_resume_marker(self.session_store.as_ref());
        let deep_link = self.deep_link.filter(|line| *line < self.transcript.len());
        if let Some(line) = deep_link {
            tracing::debug!("Deep link to line {}", line);
            self.session.select(&self.transcript.lines, line);
            self.timers
                .deep_link
                .set(Instant::now() + DEEP_LINK_DELAY, line);
        } else if let Some(marker) = marker {
            if marker.lesson == self.lesson {
                self.restore_position(marker.autoplay);
            } else {
                tracing::debug!("Ignoring resume marker for {}", marker.lesson);
            }
        }
        self.publish();
    }

    fn restore_position(&mut self, autoplay: bool) {
        let len = self.transcript.len();
        if len == 0 {
            return;
        }
        let Some(saved) = load_position(self.store.as_ref(), &self.lesson_key()) else {
            return;
        };
        let mut index = if saved.idx < len { saved.idx } else { 0 };
        let mut t = saved.t.max(0.0);
        if self.settings.skip_intro && index < self.offsets.first_content {
            index = self.offsets.first_content;
            t = self.transcript.lines[index].start;
        }
        if self.session.mode() == ReadMode::Shadow && index < self.offsets.shadow_start {
            index = self.offsets.shadow_start;
            t = self.transcript.lines[index].start;
        }
        tracing::info!("Resuming {} at line {} ({:.2}s)", self.lesson, index, t);

        self.media.set_current_time(t);
        self.session.select(&self.transcript.lines, index);
        if self.session.mode() == ReadMode::Shadow {
            self.session.shadow_mut().reset_repeats();
        }
        self.emit(PlayerEvent::ActiveLineChanged {
            index,
            manual: false,
            follow: self.session.auto_follow(),
        });
        if autoplay {
            self.attempt_autoplay();
        }
    }

    fn attempt_autoplay(&mut self) {
        match self.media.play() {
            Ok(()) => {
                self.timers
                    .autoplay_watch
                    .set(Instant::now() + AUTOPLAY_WATCH, ());
            }
            Err(err) => self.on_play_rejected(err),
        }
    }

    fn apply_duration(&mut self, duration: f64) {
        if self.transcript.resolve_duration(duration) {
            tracing::debug!("Last line now ends at {:.2}s", duration);
            self.session.refresh_end(&self.transcript.lines);
        }
    }

    // ============ Commands ============

    pub fn handle_command(&mut self, command: PlayerCommand) {
        tracing::debug!("Command {:?}", command);
        match command {
            PlayerCommand::PlayLine { index } => self.play_segment(index, true, false),
            PlayerCommand::TogglePlay => self.toggle_play(),
            PlayerCommand::Pause => self.explicit_pause(),
            PlayerCommand::NextLine => self.step_line(1),
            PlayerCommand::PrevLine => self.step_line(-1),
            PlayerCommand::Replay => {
                if let Some(index) = self.session.current().or_else(|| self.start_line()) {
                    self.play_segment(index, true, false);
                }
            }
            PlayerCommand::ResumeAfterGesture => self.resume_after_gesture(),
            PlayerCommand::SetMode { mode } => self.set_mode(mode),
            PlayerCommand::SetAfterFinish { after_finish } => self.set_after_finish(after_finish),
            PlayerCommand::SetAutoFollow { enabled } => {
                self.session.set_auto_follow(enabled);
                self.persist_modes();
                self.emit_mode();
            }
            PlayerCommand::SetRate { rate } => self.set_rate(rate),
            PlayerCommand::SetVolume { volume } => self.set_volume(volume),
            PlayerCommand::AdjustVolume { delta } => self.set_volume(self.settings.volume + delta),
            PlayerCommand::SetShadowRepeat { count } => {
                self.session.shadow_mut().set_total(count);
                self.settings.shadow_repeats = self.session.shadow().total();
                self.persist(SettingKey::ShadowRepeats);
            }
            PlayerCommand::SetShadowGap { gap } => {
                self.session.shadow_mut().set_gap_mode(gap);
                self.settings.shadow_gap = gap;
                self.persist(SettingKey::ShadowGap);
            }
            PlayerCommand::SetSkipIntro { enabled } => {
                self.settings.skip_intro = enabled;
                self.persist(SettingKey::SkipIntro);
            }
            PlayerCommand::ToggleReveal => self.toggle_reveal(),
            PlayerCommand::SetAutoStop { enabled, count } => {
                self.settings.auto_stop_enabled = enabled;
                self.settings.auto_stop_count = normalize_auto_stop_count(count as i64);
                self.persist(SettingKey::AutoStopEnabled);
                self.persist(SettingKey::AutoStopCount);
                if !enabled {
                    reset_auto_stop(self.session_store.as_ref());
                }
            }
            // Handled by the task loop
            PlayerCommand::Shutdown => {}
        }
        self.publish();
    }

    /// Line where playback starts when nothing is selected
    fn start_line(&self) -> Option<usize> {
        if self.transcript.is_empty() {
            return None;
        }
        let index = if self.session.mode() == ReadMode::Shadow {
            self.offsets.shadow_start
        } else {
            self.offsets.start_index(self.settings.skip_intro)
        };
        Some(index.min(self.transcript.len() - 1))
    }

    fn toggle_play(&mut self) {
        if !self.media.paused() {
            self.explicit_pause();
            return;
        }
        let len = self.transcript.len();
        if len == 0 {
            self.resume();
            return;
        }
        let current = self.session.current();
        let end = self.session.segment_end();
        let at_end = current.is_some()
            && end > 0.0
            && (self.media.current_time() - end).abs() < END_TOLERANCE;

        match (self.session.mode(), current) {
            (ReadMode::Shadow, Some(index)) if at_end => self.play_segment(index, true, false),
            (ReadMode::Single, Some(index)) if at_end => {
                self.play_segment((index + 1).min(len - 1), true, false)
            }
            (_, None) => {
                if let Some(index) = self.start_line() {
                    self.play_segment(index, true, false);
                }
            }
            _ => self.resume(),
        }
    }

    fn resume(&mut self) {
        if let Err(err) = self.media.play() {
            self.on_play_rejected(err);
        }
    }

    fn step_line(&mut self, delta: isize) {
        let len = self.transcript.len();
        if len == 0 {
            return;
        }
        let target = match self.session.current() {
            Some(index) => (index as isize + delta).clamp(0, len as isize - 1) as usize,
            None => match self.start_line() {
                Some(index) => index,
                None => return,
            },
        };
        self.play_segment(target, true, false);
    }

    /// Learner-initiated pause: everything pending is dropped
    fn explicit_pause(&mut self) {
        self.seq += 1;
        self.pending = None;
        self.timers.cancel_all();
        self.scheduler.cancel();
        self.session.shadow_mut().cancel_gap();
        self.unmute_now();
        if self.media.paused() {
            self.save_position();
        } else {
            self.media.pause();
        }
    }

    fn resume_after_gesture(&mut self) {
        self.timers.autoplay_watch.cancel();
        let Some(mut target) = self
            .session
            .current()
            .or_else(|| Some(self.offsets.start_index(self.settings.skip_intro)))
            .filter(|i| *i < self.transcript.len())
        else {
            self.resume();
            return;
        };
        if self.session.mode() == ReadMode::Shadow && target < self.offsets.shadow_start {
            target = self.offsets.shadow_start;
        }
        if self.settings.skip_intro && target < self.offsets.first_content {
            target = self.offsets.first_content;
        }
        let desired = self.transcript.lines[target].start;

        self.session.select(&self.transcript.lines, target);
        self.emit(PlayerEvent::ActiveLineChanged {
            index: target,
            manual: false,
            follow: self.session.auto_follow(),
        });

        if desired > MUTE_THRESHOLD && !self.media.muted() {
            self.media.set_muted(true);
            self.auto_muted = true;
        }
        if let Err(err) = self.media.play() {
            self.unmute_now();
            self.on_play_rejected(err);
            return;
        }
        if desired <= 0.01 {
            self.timers.unmute.set(Instant::now() + SETTLE, ());
            return;
        }
        if self.media.duration().is_none() {
            self.set_pending(Pending::GestureMetadata { desired }, METADATA_TIMEOUT);
            return;
        }
        self.gesture_align(desired);
    }

    fn gesture_align(&mut self, desired: f64) {
        if (self.media.current_time() - desired).abs() < ALIGN_TOLERANCE {
            self.timers.unmute.set(Instant::now() + SETTLE, ());
            return;
        }
        self.media.set_current_time(desired);
        self.set_pending(Pending::GestureSeek, GESTURE_SEEK_TIMEOUT);
    }

    fn set_mode(&mut self, mode: ReadMode) {
        let change = self.session.set_mode(&self.transcript.lines, mode);
        self.timers.shadow_gap.cancel();
        self.apply_mode_change(change);
        self.arm();
    }

    fn set_after_finish(&mut self, after_finish: AfterFinish) {
        let change = self.session.set_after_finish(after_finish);
        reset_auto_stop(self.session_store.as_ref());
        if change.after_finish != AfterFinish::SingleLoop {
            self.timers.loop_replay.cancel();
        }
        self.apply_mode_change(change);
        self.arm();
    }

    fn apply_mode_change(&mut self, change: ModeChange) {
        if change.corrected {
            tracing::info!(
                "Reading mode {} does not allow that after-finish policy, using {}",
                change.mode,
                change.after_finish
            );
        }
        if change.follow_forced {
            tracing::debug!("Auto-follow enabled for next-lesson playback");
        }
        self.persist_modes();
        self.emit_mode();
    }

    fn persist_modes(&mut self) {
        self.settings.read_mode = self.session.mode();
        self.settings.after_finish = self.session.after_finish();
        self.settings.auto_follow = self.session.auto_follow();
        self.persist(SettingKey::ReadMode);
        self.persist(SettingKey::AfterFinish);
        self.persist(SettingKey::AutoFollow);
    }

    fn emit_mode(&self) {
        self.emit(PlayerEvent::ModeChanged {
            mode: self.session.mode(),
            after_finish: self.session.after_finish(),
            auto_follow: self.session.auto_follow(),
        });
    }

    fn set_rate(&mut self, rate: f64) {
        let rate = normalize_playback_rate(rate);
        self.settings.playback_rate = rate;
        self.persist(SettingKey::PlaybackRate);
        self.media.set_playback_rate(rate);
        self.emit(PlayerEvent::RateChanged { rate });
        self.arm();
    }

    fn set_volume(&mut self, volume: f32) {
        if !volume.is_finite() {
            return;
        }
        let volume = (volume.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        self.settings.volume = volume;
        self.media.set_volume(volume);
        self.persist(SettingKey::Volume);
        self.emit(PlayerEvent::VolumeChanged { volume });
    }

    fn toggle_reveal(&mut self) {
        if self.session.mode() != ReadMode::Listen {
            return;
        }
        let Some(index) = self.session.current() else {
            return;
        };
        let revealed = self.revealed.toggle(index);
        ignore_failure(REVEALED_KEY, self.revealed.save(self.store.as_ref()));
        self.emit(PlayerEvent::RevealChanged { index, revealed });
    }

    fn persist(&self, key: SettingKey) {
        ignore_failure(key.key(), self.settings.save_one(self.store.as_ref(), key));
    }

    // ============ Segment playback ============

    fn play_segment(&mut self, index: usize, manual: bool, shadow_repeat: bool) {
        if index >= self.transcript.len() {
            return;
        }
        self.seq += 1;
        if manual {
            self.timers.loop_replay.cancel();
        }
        if !manual && self.session.current() == Some(index) && !self.media.paused() {
            return;
        }
        let request = PlayRequest {
            index,
            manual,
            shadow_repeat,
        };
        if self.media.duration().is_none() {
            tracing::debug!("Line {} waits for metadata", index);
            self.set_pending(Pending::Metadata(request), METADATA_TIMEOUT);
            return;
        }
        self.begin_segment(request);
    }

    fn begin_segment(&mut self, request: PlayRequest) {
        let now = Instant::now();
        let index = request.index;
        let previous = self.session.current();

        self.timers.shadow_gap.cancel();
        self.session.shadow_mut().cancel_gap();
        self.shadow_auto_pause = false;
        if self.session.mode() == ReadMode::Shadow {
            self.session.shadow_mut().on_line_start(
                request.manual,
                previous == Some(index),
                request.shadow_repeat,
            );
        }
        self.cancel_detection();
        self.clear_pending();

        let end = self.session.select(&self.transcript.lines, index);
        self.segment_started_at = Some(now);
        self.emit(PlayerEvent::ActiveLineChanged {
            index,
            manual: request.manual,
            follow: request.manual || self.session.auto_follow(),
        });

        let start = self.transcript.lines[index].start.max(0.0);
        let target = if !request.manual && previous != Some(index) {
            nudge_start(start, self.media.current_time().max(0.0), self.media.duration())
        } else {
            start
        };
        tracing::debug!(
            "Line {} [{:.2}s, {:.2}s) from {:.3}s ({})",
            index,
            start,
            end,
            target,
            if request.manual { "manual" } else { "auto" }
        );

        if !self.media.paused() {
            self.internal_pause = true;
            self.media.pause();
        }
        let attempt = self.reconciler.begin(self.seq, target);
        self.issue_seek(attempt);
    }

    fn issue_seek(&mut self, attempt: SeekAttempt) {
        self.media.set_current_time(attempt.target);
        self.set_pending(Pending::Seek(attempt), self.reconciler.policy().timeout);
    }

    /// Verify a finished seek and act on the verdict
    fn settle_seek(&mut self, mut attempt: SeekAttempt) {
        self.clear_pending();
        if attempt.seq != self.seq {
            tracing::debug!("Dropping stale seek to {:.2}s", attempt.target);
            return;
        }
        let actual = self.media.current_time();
        match self.reconciler.verify(&mut attempt, actual) {
            SeekVerdict::Accurate => self.play_and_arm(),
            SeekVerdict::BestEffort => {
                tracing::debug!("Playing from {:.2}s instead of {:.2}s", actual, attempt.target);
                self.play_and_arm();
            }
            SeekVerdict::Retry => self.issue_seek(attempt),
            SeekVerdict::FallbackToBuffer { warn } => {
                tracing::warn!(
                    "Seek to {:.2}s landed at {:.2}s, loading the whole audio file",
                    attempt.target,
                    actual
                );
                if warn {
                    self.emit(PlayerEvent::Notice(Notice::RangeUnsupported));
                }
                self.set_pending(Pending::Buffering(attempt), BUFFER_TIMEOUT);
                self.fetch_buffered_source(attempt.seq);
            }
        }
    }

    fn fetch_buffered_source(&self, seq: u64) {
        let fetcher = self.fetcher.clone();
        let url = self.audio_url.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch_bytes(&url).await;
            let _ = tx.send(PlayerMessage::BufferedSource { seq, result });
        });
    }

    pub(crate) fn handle_message(&mut self, message: PlayerMessage) {
        match message {
            PlayerMessage::BufferedSource { seq, result } => self.on_buffered_source(seq, result),
        }
        self.publish();
    }

    fn on_buffered_source(&mut self, seq: u64, result: Result<Vec<u8>, FetchError>) {
        let attempt = match self.pending {
            Some(Pending::Buffering(attempt)) if attempt.seq == seq => Some(attempt),
            _ => None,
        };
        match result {
            Ok(bytes) => {
                tracing::info!("Audio for {} buffered ({} bytes)", self.lesson, bytes.len());
                self.source_restore = Some(SourceRestore {
                    rate: self.media.playback_rate(),
                    volume: self.media.volume(),
                    muted: self.media.muted(),
                    position: self.media.current_time(),
                    playing: !self.media.paused(),
                });
                self.media.set_source(MediaSource::Buffered(Arc::from(bytes)));
                match attempt {
                    Some(mut attempt) => {
                        self.reconciler.buffered_ready(&mut attempt);
                        self.set_pending(Pending::BufferMetadata(attempt), METADATA_TIMEOUT);
                    }
                    None => self.reconciler.mark_buffered(),
                }
            }
            Err(err) => {
                tracing::warn!("Could not buffer audio for {}: {}", self.lesson, err);
                if attempt.is_some() {
                    self.clear_pending();
                    self.play_and_arm();
                }
            }
        }
    }

    fn play_and_arm(&mut self) {
        match self.media.play() {
            Ok(()) => {
                let settle = Instant::now() + SETTLE;
                self.timers.rearm.set_earliest(settle);
                if self.auto_muted {
                    self.timers.unmute.set(settle, ());
                }
            }
            Err(err) => {
                self.unmute_now();
                self.on_play_rejected(err);
            }
        }
    }

    fn on_play_rejected(&mut self, err: PlayError) {
        match err {
            PlayError::AutoplayBlocked => {
                tracing::info!("Playback needs a user gesture");
                self.timers.autoplay_watch.cancel();
                self.emit(PlayerEvent::AutoplayBlocked);
            }
            PlayError::NoSource => tracing::warn!("Play failed: {}", err),
        }
    }

    fn set_pending(&mut self, pending: Pending, timeout: Duration) {
        self.pending = Some(pending);
        self.timers.pending.set(Instant::now() + timeout, ());
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.timers.pending.cancel();
    }

    /// A muted or gesture seek is done; unmute and arm once it settled
    fn finish_quiet_seek(&mut self) {
        self.clear_pending();
        self.timers.unmute.set(Instant::now() + SETTLE, ());
    }

    fn unmute_now(&mut self) {
        if self.auto_muted {
            self.media.set_muted(false);
            self.auto_muted = false;
        }
    }

    // ============ Detection ============

    fn observe(&self) -> Observation {
        self.session.observe(
            self.media.current_time(),
            self.media.playback_rate(),
            self.media.paused(),
        )
    }

    /// (Re)arm segment-end detection for the current line
    fn arm(&mut self) {
        self.timers.detector.cancel();
        let obs = self.observe();
        if let Some((handle, wakeup)) = self.scheduler.arm(&obs) {
            self.timers
                .detector
                .set(Instant::now() + wakeup.delay(), handle);
        }
    }

    fn cancel_detection(&mut self) {
        self.scheduler.cancel();
        self.timers.detector.cancel();
        self.timers.rearm.cancel();
    }

    fn check_detector(&mut self, handle: ScheduleHandle, now: Instant) {
        let obs = self.observe();
        match self.scheduler.check(handle, &obs) {
            Check::Pending(wakeup) => self.timers.detector.set(now + wakeup.delay(), handle),
            Check::Fire(end) => self.on_segment_fired(end),
            Check::Stale => {}
        }
    }

    fn on_segment_fired(&mut self, end: SegmentEnd) {
        tracing::debug!("Line {} reached {:.2}s", end.index, end.end);
        if end.mode == ReadMode::Shadow {
            self.shadow_segment_end(end.end);
        } else {
            self.finish_segment(end.end);
        }
    }

    /// Pause and snap to the segment end, then loop if asked to
    fn finish_segment(&mut self, end: f64) {
        let Some(index) = self.session.current() else {
            return;
        };
        self.cancel_detection();
        if !self.media.paused() {
            self.media.pause();
        }
        self.media.set_current_time(end);
        self.emit(PlayerEvent::SegmentEnded { index });
        if self.session.after_finish() == AfterFinish::SingleLoop && !self.timers.loop_replay.is_set()
        {
            self.timers
                .loop_replay
                .set(Instant::now() + LOOP_REPLAY_DELAY, ());
        }
    }

    fn shadow_segment_end(&mut self, end_snap: f64) {
        if self.session.mode() != ReadMode::Shadow {
            return;
        }
        let Some(index) = self.session.current() else {
            return;
        };
        let Some(line) = self.transcript.lines.get(index) else {
            return;
        };
        let Some(gap) = self
            .session
            .shadow_mut()
            .on_segment_end(index, line, end_snap)
        else {
            return;
        };
        self.cancel_detection();
        if !self.media.paused() {
            self.shadow_auto_pause = true;
            self.media.pause();
        }
        self.media.set_current_time(end_snap);
        self.timers
            .shadow_gap
            .set(Instant::now() + gap.gap, gap.token);
        self.emit(PlayerEvent::SegmentEnded { index });
        self.emit(PlayerEvent::ShadowGap {
            index,
            gap: gap.gap,
            repeats_remaining: gap.repeats_remaining,
        });
    }

    fn on_shadow_gap(&mut self, token: GapToken) {
        let mode = self.session.mode();
        let current = self.session.current();
        let after_finish = self.session.after_finish();
        let line_count = self.transcript.len();
        let step = self.session.shadow_mut().on_gap_elapsed(
            token,
            mode,
            current,
            line_count,
            after_finish,
        );
        match step {
            ShadowStep::Replay(index) => self.play_segment(index, false, true),
            ShadowStep::Advance(index) => self.play_segment(index, false, false),
            ShadowStep::Restart => self.play_segment(self.offsets.shadow_start, false, false),
            ShadowStep::NextLesson => self.finish_lesson(),
            ShadowStep::Finished => tracing::debug!("Shadow reading finished the lesson"),
            ShadowStep::Stale => tracing::debug!("Dropping stale shadow gap"),
        }
    }

    // ============ Lesson end ============

    fn finish_lesson(&mut self) {
        let decision = register_finished_lesson(
            self.session_store.as_ref(),
            self.settings.auto_stop_enabled,
            self.settings.auto_stop_count,
        );
        match decision {
            AutoStopDecision::Stop { played } => {
                tracing::info!("Auto-stop after {} lessons", played);
                self.emit(PlayerEvent::Notice(Notice::AutoStopped { lessons: played }));
            }
            AutoStopDecision::Continue => self.auto_next_lesson(),
        }
    }

    fn auto_next_lesson(&mut self) {
        self.save_position();
        let next = self
            .lesson_index
            .as_ref()
            .and_then(|index| index.next(&self.lesson));
        match next {
            Some(next) => {
                tracing::info!("Continuing with {}", next);
                hand_off_to(&next, self.store.as_ref(), self.session_store.as_ref());
                self.emit(PlayerEvent::NextLesson { lesson: next });
            }
            None => {
                tracing::info!("{} is the last lesson", self.lesson);
                self.emit(PlayerEvent::Notice(Notice::CourseFinished));
            }
        }
    }

    // ============ Media events ============

    pub fn handle_media_event(&mut self, event: MediaEvent) {
        let now = Instant::now();
        match event {
            MediaEvent::Play => {
                self.internal_pause = false;
                self.timers.autoplay_watch.cancel();
                self.timers.rearm.set_earliest(now + PLAY_REARM_DELAY);
                ignore_failure(RECENTS_KEY, touch_recent(self.store.as_ref(), &self.lesson_key()));
                self.emit(PlayerEvent::StateChanged { playing: true });
            }
            MediaEvent::Pause => {
                self.cancel_detection();
                if !self.shadow_auto_pause {
                    self.timers.shadow_gap.cancel();
                    self.session.shadow_mut().cancel_gap();
                }
                if !self.internal_pause {
                    self.save_position();
                }
                self.internal_pause = false;
                self.shadow_auto_pause = false;
                self.emit(PlayerEvent::StateChanged { playing: false });
            }
            MediaEvent::Seeked => {
                match self.pending {
                    Some(Pending::GestureSeek) => self.finish_quiet_seek(),
                    Some(Pending::Seek(attempt)) => self.settle_seek(attempt),
                    _ => {}
                }
                self.arm();
            }
            MediaEvent::CanPlay => {
                if self.pending == Some(Pending::GestureSeek) {
                    self.finish_quiet_seek();
                }
            }
            MediaEvent::LoadedMetadata { duration } => self.on_loaded_metadata(duration),
            MediaEvent::TimeUpdate => self.on_progress(now),
            MediaEvent::Ended => self.on_ended(now),
            MediaEvent::RateChange => {
                let rate = self.media.playback_rate();
                let normalized = normalize_playback_rate(rate);
                if (rate - normalized).abs() > 0.001 {
                    self.media.set_playback_rate(normalized);
                    return;
                }
                if (self.settings.playback_rate - normalized).abs() > 1e-9 {
                    self.settings.playback_rate = normalized;
                    self.persist(SettingKey::PlaybackRate);
                    self.emit(PlayerEvent::RateChanged { rate: normalized });
                }
                self.arm();
            }
        }
        self.publish();
    }

    fn on_loaded_metadata(&mut self, duration: f64) {
        tracing::debug!("Metadata loaded, duration {:.2}s", duration);
        self.apply_duration(duration);

        if let Some(restore) = self.source_restore.take() {
            self.media.set_playback_rate(restore.rate);
            self.media.set_volume(restore.volume);
            self.media.set_muted(restore.muted);
            match self.pending {
                Some(Pending::BufferMetadata(attempt)) | Some(Pending::Seek(attempt)) => {
                    self.issue_seek(attempt);
                }
                Some(_) => {}
                None => {
                    if restore.position > 0.0 {
                        self.media.set_current_time(restore.position);
                    }
                    if restore.playing {
                        self.play_and_arm();
                    }
                }
            }
        } else if (self.media.playback_rate() - self.settings.playback_rate).abs() > 1e-9 {
            self.media.set_playback_rate(self.settings.playback_rate);
        }

        match self.pending {
            Some(Pending::Metadata(request)) => {
                self.clear_pending();
                self.begin_segment(request);
            }
            Some(Pending::GestureMetadata { desired }) => {
                self.clear_pending();
                self.gesture_align(desired);
            }
            _ => {}
        }
    }

    /// Safety net behind the detector, plus active-line sync and saves
    fn on_progress(&mut self, now: Instant) {
        let t = self.media.current_time();
        let end = self.session.segment_end();
        if !self.media.paused() && end > 0.0 && t >= end {
            match (self.session.mode(), self.session.after_finish()) {
                (ReadMode::Shadow, _) => {
                    self.shadow_segment_end(end);
                    return;
                }
                (ReadMode::Single, _) | (ReadMode::Listen, AfterFinish::SingleLoop) => {
                    self.finish_segment(end);
                    return;
                }
                _ => {}
            }
        }

        if self
            .last_progress
            .is_some_and(|last| now.duration_since(last) < PROGRESS_THROTTLE)
        {
            return;
        }
        self.last_progress = Some(now);
        if self
            .segment_started_at
            .is_some_and(|started| now.duration_since(started) < SEGMENT_SETTLE)
        {
            return;
        }

        if let Some(index) = line_at(&self.transcript.lines, t, self.session.mode()) {
            if self.session.current() != Some(index) {
                self.session.select(&self.transcript.lines, index);
                self.emit(PlayerEvent::ActiveLineChanged {
                    index,
                    manual: false,
                    follow: self.session.auto_follow(),
                });
                self.arm();
            }
        }

        if self
            .last_saved
            .is_none_or(|saved| now.duration_since(saved) >= SAVE_INTERVAL)
        {
            self.last_saved = Some(now);
            self.save_position();
        }
    }

    fn on_ended(&mut self, now: Instant) {
        if self.session.mode() == ReadMode::Single {
            return;
        }
        match self.session.after_finish() {
            AfterFinish::AllLoop => {
                if let Some(index) = self.start_line() {
                    tracing::debug!("Lesson ended, restarting at line {}", index);
                    self.timers.restart.set(now + RESTART_DELAY, index);
                }
            }
            AfterFinish::NextLesson => self.finish_lesson(),
            AfterFinish::None | AfterFinish::SingleLoop => {}
        }
    }

    // ============ Timers ============

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer that is due at `now`
    pub fn on_timers(&mut self, now: Instant) {
        if let Some(handle) = self.timers.detector.take_due(now) {
            self.check_detector(handle, now);
        }
        if self.timers.pending.take_due(now).is_some() {
            self.on_pending_timeout();
        }
        if self.timers.unmute.take_due(now).is_some() {
            if self.pending != Some(Pending::GestureSeek) {
                self.unmute_now();
                self.arm();
            }
        }
        if self.timers.rearm.take_due(now).is_some() {
            self.arm();
        }
        if let Some(token) = self.timers.shadow_gap.take_due(now) {
            self.on_shadow_gap(token);
        }
        if self.timers.loop_replay.take_due(now).is_some()
            && self.session.after_finish() == AfterFinish::SingleLoop
        {
            if let Some(index) = self.session.current() {
                self.play_segment(index, false, false);
            }
        }
        if let Some(index) = self.timers.restart.take_due(now) {
            self.play_segment(index, true, false);
        }
        if self.timers.autoplay_watch.take_due(now).is_some() && self.media.paused() {
            tracing::info!("Autoplay did not start");
            self.emit(PlayerEvent::AutoplayBlocked);
        }
        if let Some(line) = self.timers.deep_link.take_due(now) {
            self.play_segment(line, true, false);
        }
        self.publish();
    }

    fn on_pending_timeout(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match pending {
            Pending::Metadata(request) => {
                tracing::warn!("No metadata after {:?}, playing line {} anyway", METADATA_TIMEOUT, request.index);
                self.begin_segment(request);
            }
            Pending::GestureSeek => self.finish_quiet_seek(),
            Pending::Seek(attempt) => {
                tracing::debug!("Seek to {:.2}s did not report completion", attempt.target);
                self.settle_seek(attempt);
            }
            Pending::BufferMetadata(attempt) => self.issue_seek(attempt),
            Pending::GestureMetadata { desired } => self.gesture_align(desired),
            Pending::Buffering(_) => {
                tracing::warn!(
                    "Audio for {} not buffered after {:?}, playing from {:.2}s",
                    self.lesson,
                    BUFFER_TIMEOUT,
                    self.media.current_time()
                );
                self.play_and_arm();
            }
        }
    }

    // ============ Persistence & state ============

    fn save_position(&self) {
        if self.transcript.is_empty() {
            return;
        }
        let position = LastPosition::new(
            self.media.current_time(),
            self.session.current().unwrap_or(0),
        );
        ignore_failure(
            LAST_POSITIONS_KEY,
            save_position(self.store.as_ref(), &self.lesson_key(), position),
        );
    }

    /// Persist the position and stop everything pending
    pub fn shutdown(&mut self) {
        tracing::debug!("Shutting down player for {}", self.lesson);
        self.save_position();
        self.seq += 1;
        self.pending = None;
        self.timers.cancel_all();
        self.scheduler.cancel();
        if !self.media.paused() {
            self.internal_pause = true;
            self.media.pause();
        }
        self.publish();
    }

    fn publish(&self) {
        self.state.store(PlaybackSnapshot {
            current_index: self.session.current(),
            segment_end: self.session.segment_end(),
            position: self.media.current_time(),
            duration: self.media.duration(),
            playing: !self.media.paused(),
            mode: self.session.mode(),
            after_finish: self.session.after_finish(),
            auto_follow: self.session.auto_follow(),
            rate: self.settings.playback_rate,
            volume: self.settings.volume,
            shadow_repeats_remaining: self.session.shadow_repeats_remaining(),
            buffered_source: self.reconciler.is_buffered(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryFetcher;
    use crate::audio::events::{PlayerEventReceiver, player_event_channel};
    use crate::audio::media::MediaEventReceiver;
    use crate::audio::virtual_media::{VirtualMedia, VirtualMediaControl, VirtualMediaOptions};
    use crate::audio::timer::sleep_until_opt;
    use crate::features::store::MemoryStore;
    use crate::features::transcript::parse_transcript;

    const LRC: &str = "[ti:Test]\n\
        [00:01.00]Hello there.|你好。\n\
        [00:03.00]How are you?|你好吗？\n\
        [00:05.00]Fine, thanks.|很好，谢谢。\n";

    struct Rig {
        player: LessonPlayer<VirtualMedia>,
        control: VirtualMediaControl,
        media_rx: MediaEventReceiver,
        internal_rx: PlayerMessageReceiver,
        events: PlayerEventReceiver,
    }

    fn rig(store: MemoryStore) -> Rig {
        let config = PlayerConfig::new(
            Arc::new(store),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryFetcher::new()),
        );
        let source = LessonSource::new(
            LessonId::new("NCE2", "01-Test"),
            parse_transcript(LRC),
            "lesson.mp3",
        );
        let (media, media_rx) = VirtualMedia::new(
            MediaSource::Url("lesson.mp3".into()),
            VirtualMediaOptions {
                duration: 7.0,
                ..Default::default()
            },
        );
        let control = media.control();
        let (event_tx, events) = player_event_channel();
        let (internal_tx, internal_rx) = player_message_channel();
        let player = LessonPlayer::new(
            config,
            source,
            media,
            event_tx,
            SharedPlaybackState::new(),
            internal_tx,
        );
        Rig {
            player,
            control,
            media_rx,
            internal_rx,
            events,
        }
    }

    impl Rig {
        /// Drive the player until `until` on the paused clock
        async fn pump(&mut self, until: Duration) {
            let stop = Instant::now() + until;
            loop {
                let deadline = earliest([self.player.next_deadline(), Some(stop)]);
                tokio::select! {
                    biased;
                    Some(event) = self.media_rx.recv() => self.player.handle_media_event(event),
                    Some(message) = self.internal_rx.recv() => self.player.handle_message(message),
                    _ = sleep_until_opt(deadline) => {
                        let now = Instant::now();
                        self.player.on_timers(now);
                        if now >= stop {
                            break;
                        }
                    }
                }
            }
        }

        fn drain(&mut self) -> Vec<PlayerEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[test]
    fn test_nudge_start() {
        // Far from the current position: untouched
        assert_eq!(nudge_start(3.0, 1.0, Some(7.0)), 3.0);
        assert_eq!(nudge_start(1.0, 3.0, Some(7.0)), 1.0);
        // Sitting on the start: 5ms forward
        assert!((nudge_start(3.0, 3.0, Some(7.0)) - 3.005).abs() < 1e-9);
        // Never past duration - 0.05
        assert!((nudge_start(6.98, 6.98, Some(7.0)) - 6.95).abs() < 1e-9);
        // Unknown duration bounds at start + 5ms
        assert!((nudge_start(3.0, 3.002, None) - 3.005).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_before_metadata_waits() {
        let mut rig = rig(MemoryStore::new());
        rig.player.start();
        // Metadata arrives after 20ms; the request waits for it
        rig.player.handle_command(PlayerCommand::PlayLine { index: 1 });
        assert!(rig.control.seeks().is_empty());
        rig.pump(Duration::from_millis(200)).await;
        assert_eq!(rig.control.seeks(), vec![3.0]);
        assert!(rig.control.is_playing());
        // The last line's end is resolved from the duration
        assert_eq!(rig.player.transcript().lines[2].end, 7.0);
        let events = rig.drain();
        assert!(events.contains(&PlayerEvent::ActiveLineChanged {
            index: 1,
            manual: true,
            follow: true,
        }));
    }
}
