//! Per-lesson playback session state
//!
//! Owned by the player task and mutated only through the transition methods
//! below.

use super::boundary::end_for;
use super::mode::{AfterFinish, ModeChange, ModeState, ReadMode};
use super::scheduler::Observation;
use super::shadow::{GapMode, ShadowRepeatController};
use crate::features::transcript::TimedLine;

#[derive(Debug)]
pub struct PlaybackSession {
    current: Option<usize>,
    segment_end: f64,
    modes: ModeState,
    shadow: ShadowRepeatController,
}

impl PlaybackSession {
    pub fn new(modes: ModeState, shadow_repeats: u8, gap_mode: GapMode) -> Self {
        Self {
            current: None,
            segment_end: 0.0,
            modes,
            shadow: ShadowRepeatController::new(shadow_repeats, gap_mode),
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Armed segment end, 0.0 when nothing is selected
    pub fn segment_end(&self) -> f64 {
        self.segment_end
    }

    pub fn mode(&self) -> ReadMode {
        self.modes.mode()
    }

    pub fn after_finish(&self) -> AfterFinish {
        self.modes.after_finish()
    }

    pub fn auto_follow(&self) -> bool {
        self.modes.auto_follow()
    }

    pub fn plays_through(&self) -> bool {
        self.modes.plays_through()
    }

    pub fn shadow_repeats_remaining(&self) -> u8 {
        self.shadow.remaining()
    }

    pub fn shadow(&self) -> &ShadowRepeatController {
        &self.shadow
    }

    pub fn shadow_mut(&mut self) -> &mut ShadowRepeatController {
        &mut self.shadow
    }

    /// Make line `index` current and compute its end under the current mode
    pub fn select(&mut self, lines: &[TimedLine], index: usize) -> f64 {
        self.current = Some(index);
        self.segment_end = end_for(lines, index, self.modes.mode());
        self.segment_end
    }

    /// Recompute the armed end, e.g. after the last line's end resolved
    pub fn refresh_end(&mut self, lines: &[TimedLine]) {
        if let Some(index) = self.current {
            self.segment_end = end_for(lines, index, self.modes.mode());
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.segment_end = 0.0;
    }

    /// Switch reading mode and recompute the current boundary
    pub fn set_mode(&mut self, lines: &[TimedLine], mode: ReadMode) -> ModeChange {
        let change = self.modes.set_mode(mode);
        self.refresh_end(lines);
        self.shadow.cancel_gap();
        if mode == ReadMode::Shadow {
            self.shadow.reset_repeats();
        }
        change
    }

    pub fn set_after_finish(&mut self, after_finish: AfterFinish) -> ModeChange {
        self.modes.set_after_finish(after_finish)
    }

    pub fn set_auto_follow(&mut self, enabled: bool) {
        self.modes.set_auto_follow(enabled);
    }

    /// Snapshot for the advance detector
    pub fn observe(&self, position: f64, rate: f64, paused: bool) -> Observation {
        Observation {
            position,
            rate,
            paused,
            mode: self.modes.mode(),
            after_finish: self.modes.after_finish(),
            index: self.current,
            segment_end: self.segment_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::transcript::{LessonMeta, Transcript};

    fn transcript() -> Transcript {
        Transcript::new(
            LessonMeta::default(),
            vec![
                TimedLine::new(1.0, "Hello there", "你好"),
                TimedLine::new(3.5, "Goodbye", "再见"),
            ],
        )
    }

    #[test]
    fn test_select_uses_mode_boundary() {
        let t = transcript();
        let mut s = PlaybackSession::new(
            ModeState::new(ReadMode::Single, AfterFinish::None, true),
            2,
            GapMode::Medium,
        );
        assert_eq!(s.current(), None);
        assert_eq!(s.segment_end(), 0.0);
        let end = s.select(&t.lines, 0);
        assert!((end - 3.0).abs() < 1e-9);
        assert_eq!(s.current(), Some(0));
    }

    #[test]
    fn test_mode_switch_recomputes_boundary() {
        let t = transcript();
        let mut s = PlaybackSession::new(
            ModeState::new(ReadMode::Single, AfterFinish::SingleLoop, true),
            2,
            GapMode::Medium,
        );
        s.select(&t.lines, 0);
        let change = s.set_mode(&t.lines, ReadMode::Continuous);
        assert!(change.corrected);
        assert_eq!(s.after_finish(), AfterFinish::None);
        assert!((s.segment_end() - 3.5).abs() < 1e-9);
        assert!(s.plays_through());
    }

    #[test]
    fn test_refresh_after_duration() {
        let mut t = transcript();
        let mut s = PlaybackSession::new(ModeState::default(), 2, GapMode::Medium);
        s.select(&t.lines, 1);
        assert!((s.segment_end() - 3.7).abs() < 1e-9);
        t.resolve_duration(6.0);
        s.refresh_end(&t.lines);
        assert!((s.segment_end() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_observation_snapshot() {
        let t = transcript();
        let mut s = PlaybackSession::new(
            ModeState::new(ReadMode::Shadow, AfterFinish::AllLoop, true),
            3,
            GapMode::Long,
        );
        s.select(&t.lines, 0);
        let obs = s.observe(2.0, 1.5, false);
        assert_eq!(obs.index, Some(0));
        assert_eq!(obs.mode, ReadMode::Shadow);
        assert_eq!(obs.after_finish, AfterFinish::AllLoop);
        assert_eq!(s.shadow_repeats_remaining(), 3);
    }
}
