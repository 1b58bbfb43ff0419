//! Shadow-reading repeat and gap control
//!
//! In shadow mode each line plays a configured number of times. After every
//! pass playback holds at the boundary for a gap sized to the sentence so
//! the learner can repeat it aloud.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::boundary::compute_end;
use super::mode::{AfterFinish, ReadMode};
use crate::features::transcript::TimedLine;
use crate::utils::count_words;

pub const MIN_REPEATS: u8 = 1;
pub const MAX_REPEATS: u8 = 9;
pub const DEFAULT_REPEATS: u8 = 2;

/// User-selected gap length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapMode {
    Short,
    #[default]
    Medium,
    Long,
}

impl GapMode {
    pub fn ratio(self) -> f64 {
        match self {
            Self::Short => 0.8,
            Self::Medium => 1.0,
            Self::Long => 1.3,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "short" => Some(Self::Short),
            "medium" => Some(Self::Medium),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }
}

/// Clamp a repeat count into the supported range
pub fn normalize_repeats(value: i64) -> u8 {
    value.clamp(MIN_REPEATS as i64, MAX_REPEATS as i64) as u8
}

/// Pause length after one pass of `line`
///
/// `end_snap` is the boundary the pass stopped at; when it is not after the
/// line start the play-through end is used instead.
pub fn estimate_gap(line: &TimedLine, end_snap: f64, mode: GapMode) -> Duration {
    let base_end = if end_snap.is_finite() && end_snap > line.start {
        end_snap
    } else {
        compute_end(line)
    };
    let duration = (base_end - line.start).max(0.4);
    let words = count_words(&line.en).min(12) as f64;
    let base = (duration * 0.6 + words * 0.08).clamp(1.2, 4.8);
    let secs = (base * mode.ratio()).clamp(0.8, 6.0);
    Duration::from_millis((secs * 1000.0).round() as u64)
}

/// Identifies one scheduled gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GapToken(u64);

/// A gap the player should wait out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowGap {
    pub token: GapToken,
    pub index: usize,
    pub gap: Duration,
    pub repeats_remaining: u8,
}

/// What to play when a gap elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowStep {
    /// Play the same line again as a repeat
    Replay(usize),
    /// Move on to this line
    Advance(usize),
    /// Lesson finished under all-loop: restart at the shadow start line
    Restart,
    /// Lesson finished under next-lesson
    NextLesson,
    /// Lesson finished, nothing else to do
    Finished,
    /// The gap no longer applies
    Stale,
}

#[derive(Debug)]
pub struct ShadowRepeatController {
    total: u8,
    remaining: u8,
    gap_mode: GapMode,
    issued: u64,
    pending: Option<(GapToken, usize)>,
}

impl ShadowRepeatController {
    pub fn new(total: u8, gap_mode: GapMode) -> Self {
        let total = normalize_repeats(total as i64);
        Self {
            total,
            remaining: total,
            gap_mode,
            issued: 0,
            pending: None,
        }
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    pub fn remaining(&self) -> u8 {
        self.remaining
    }

    pub fn gap_mode(&self) -> GapMode {
        self.gap_mode
    }

    pub fn set_total(&mut self, total: u8) {
        self.total = normalize_repeats(total as i64);
        self.remaining = self.total;
    }

    pub fn set_gap_mode(&mut self, mode: GapMode) {
        self.gap_mode = mode;
    }

    pub fn reset_repeats(&mut self) {
        self.remaining = self.total;
    }

    pub fn gap_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel_gap(&mut self) {
        self.pending = None;
    }

    /// A line is about to start playing in shadow mode
    ///
    /// The count restarts unless this is an automatic repeat of the same line.
    pub fn on_line_start(&mut self, manual: bool, same_line: bool, repeat: bool) {
        if manual || !same_line || !repeat {
            self.remaining = self.total;
        }
    }

    /// A pass of line `index` reached its boundary
    ///
    /// Returns `None` when a gap is already running, which de-duplicates the
    /// detector and the progress safety net.
    pub fn on_segment_end(
        &mut self,
        index: usize,
        line: &TimedLine,
        end_snap: f64,
    ) -> Option<ShadowGap> {
        if self.pending.is_some() {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        self.issued += 1;
        let token = GapToken(self.issued);
        self.pending = Some((token, index));
        Some(ShadowGap {
            token,
            index,
            gap: estimate_gap(line, end_snap, self.gap_mode),
            repeats_remaining: self.remaining,
        })
    }

    /// The gap for `token` elapsed
    pub fn on_gap_elapsed(
        &mut self,
        token: GapToken,
        mode: ReadMode,
        current: Option<usize>,
        line_count: usize,
        after_finish: AfterFinish,
    ) -> ShadowStep {
        let Some((pending, index)) = self.pending else {
            return ShadowStep::Stale;
        };
        if pending != token {
            return ShadowStep::Stale;
        }
        self.pending = None;
        if mode != ReadMode::Shadow {
            return ShadowStep::Stale;
        }
        if current != Some(index) && self.remaining > 0 {
            return ShadowStep::Stale;
        }
        if self.remaining > 0 {
            return ShadowStep::Replay(index);
        }
        if index + 1 < line_count {
            return ShadowStep::Advance(index + 1);
        }
        match after_finish {
            AfterFinish::AllLoop => ShadowStep::Restart,
            AfterFinish::NextLesson => ShadowStep::NextLesson,
            AfterFinish::None | AfterFinish::SingleLoop => ShadowStep::Finished,
        }
    }
}
