//! Reading modes and after-finish policy
//!
//! The reading mode decides how a single line ends; the after-finish policy
//! decides what happens when a line (single loop) or the lesson (all loop,
//! next lesson) runs out. Some pairs make no sense and are corrected here.

use serde::{Deserialize, Serialize};

/// How lines are played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Plays straight through
    #[default]
    Continuous,
    /// Stops at the end of each line
    Single,
    /// Plays through with translations hidden until revealed
    Listen,
    /// Repeats each line with a pause for the learner to speak
    Shadow,
}

impl ReadMode {
    pub fn all() -> &'static [ReadMode] {
        &[Self::Continuous, Self::Single, Self::Listen, Self::Shadow]
    }

    /// Parse a stored value, unknown strings give `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "continuous" => Some(Self::Continuous),
            "single" => Some(Self::Single),
            "listen" => Some(Self::Listen),
            "shadow" => Some(Self::Shadow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Single => "single",
            Self::Listen => "listen",
            Self::Shadow => "shadow",
        }
    }

    /// Whether segment ends are pulled in ahead of the next line
    pub fn uses_cutoff(self) -> bool {
        matches!(self, Self::Single | Self::Shadow)
    }

    /// Whether playback runs through line boundaries without stopping
    pub fn plays_through(self, after: AfterFinish) -> bool {
        match self {
            Self::Continuous => true,
            Self::Listen => after != AfterFinish::SingleLoop,
            Self::Single | Self::Shadow => false,
        }
    }

    /// Whether the lesson-level policies (all loop, next lesson) apply
    pub fn honors_lesson_end(self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a line or the lesson finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AfterFinish {
    #[default]
    #[serde(rename = "none")]
    None,
    /// Replay the current line
    #[serde(rename = "single")]
    SingleLoop,
    /// Restart the lesson from its start line
    #[serde(rename = "all")]
    AllLoop,
    /// Continue with the next lesson
    #[serde(rename = "next")]
    NextLesson,
}

impl AfterFinish {
    pub fn all() -> &'static [AfterFinish] {
        &[Self::None, Self::SingleLoop, Self::AllLoop, Self::NextLesson]
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "none" => Some(Self::None),
            "single" => Some(Self::SingleLoop),
            "all" => Some(Self::AllLoop),
            "next" => Some(Self::NextLesson),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SingleLoop => "single",
            Self::AllLoop => "all",
            Self::NextLesson => "next",
        }
    }

    /// Whether this policy is meaningful under `mode`
    pub fn allowed_in(self, mode: ReadMode) -> bool {
        match (mode, self) {
            (ReadMode::Continuous | ReadMode::Shadow, Self::SingleLoop) => false,
            (ReadMode::Single, Self::AllLoop | Self::NextLesson) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for AfterFinish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a mode transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub mode: ReadMode,
    pub after_finish: AfterFinish,
    /// The after-finish policy was forced to `None`
    pub corrected: bool,
    /// Auto-follow was switched on by the transition
    pub follow_forced: bool,
}

/// Mode / after-finish state with its reconciliation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeState {
    mode: ReadMode,
    after_finish: AfterFinish,
    auto_follow: bool,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            mode: ReadMode::Continuous,
            after_finish: AfterFinish::None,
            auto_follow: true,
        }
    }
}

impl ModeState {
    /// Build from stored values, correcting invalid combinations
    pub fn new(mode: ReadMode, after_finish: AfterFinish, auto_follow: bool) -> Self {
        let mut state = Self {
            mode,
            after_finish: AfterFinish::None,
            auto_follow,
        };
        state.set_after_finish(after_finish);
        state
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn after_finish(&self) -> AfterFinish {
        self.after_finish
    }

    pub fn auto_follow(&self) -> bool {
        self.auto_follow
    }

    pub fn plays_through(&self) -> bool {
        self.mode.plays_through(self.after_finish)
    }

    pub fn set_mode(&mut self, mode: ReadMode) -> ModeChange {
        self.mode = mode;
        let corrected = !self.after_finish.allowed_in(mode);
        if corrected {
            tracing::debug!(
                "After-finish {} not allowed in {} mode, reset to none",
                self.after_finish,
                mode
            );
            self.after_finish = AfterFinish::None;
        }
        ModeChange {
            mode,
            after_finish: self.after_finish,
            corrected,
            follow_forced: false,
        }
    }

    pub fn set_after_finish(&mut self, after_finish: AfterFinish) -> ModeChange {
        let corrected = !after_finish.allowed_in(self.mode);
        self.after_finish = if corrected {
            AfterFinish::None
        } else {
            after_finish
        };
        let follow_forced = self.after_finish == AfterFinish::NextLesson && !self.auto_follow;
        if self.after_finish == AfterFinish::NextLesson {
            self.auto_follow = true;
        }
        ModeChange {
            mode: self.mode,
            after_finish: self.after_finish,
            corrected,
            follow_forced,
        }
    }

    pub fn set_auto_follow(&mut self, enabled: bool) {
        self.auto_follow = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuous_drops_single_loop() {
        let mut state = ModeState::new(ReadMode::Listen, AfterFinish::SingleLoop, true);
        assert_eq!(state.after_finish(), AfterFinish::SingleLoop);
        let change = state.set_mode(ReadMode::Continuous);
        assert!(change.corrected);
        assert_eq!(state.after_finish(), AfterFinish::None);
    }

    #[test]
    fn test_shadow_drops_single_loop() {
        let mut state = ModeState::new(ReadMode::Single, AfterFinish::SingleLoop, true);
        state.set_mode(ReadMode::Shadow);
        assert_eq!(state.after_finish(), AfterFinish::None);
    }

    #[test]
    fn test_single_drops_lesson_policies() {
        for policy in [AfterFinish::AllLoop, AfterFinish::NextLesson] {
            let mut state = ModeState::new(ReadMode::Continuous, policy, true);
            let change = state.set_mode(ReadMode::Single);
            assert!(change.corrected);
            assert_eq!(state.after_finish(), AfterFinish::None);
        }
    }

    #[test]
    fn test_valid_combination_is_kept() {
        let mut state = ModeState::new(ReadMode::Continuous, AfterFinish::AllLoop, true);
        let change = state.set_mode(ReadMode::Shadow);
        assert!(!change.corrected);
        assert_eq!(state.after_finish(), AfterFinish::AllLoop);
    }

    #[test]
    fn test_next_lesson_forces_follow() {
        let mut state = ModeState::new(ReadMode::Continuous, AfterFinish::None, false);
        let change = state.set_after_finish(AfterFinish::NextLesson);
        assert!(change.follow_forced);
        assert!(state.auto_follow());
    }

    #[test]
    fn test_invalid_policy_request_is_coerced() {
        let mut state = ModeState::new(ReadMode::Single, AfterFinish::None, true);
        let change = state.set_after_finish(AfterFinish::AllLoop);
        assert!(change.corrected);
        assert_eq!(state.after_finish(), AfterFinish::None);
    }

    #[test]
    fn test_plays_through() {
        assert!(ReadMode::Continuous.plays_through(AfterFinish::None));
        assert!(ReadMode::Listen.plays_through(AfterFinish::AllLoop));
        assert!(!ReadMode::Listen.plays_through(AfterFinish::SingleLoop));
        assert!(!ReadMode::Single.plays_through(AfterFinish::None));
        assert!(!ReadMode::Shadow.plays_through(AfterFinish::NextLesson));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&ReadMode::Shadow).unwrap(), "\"shadow\"");
        assert_eq!(
            serde_json::to_string(&AfterFinish::SingleLoop).unwrap(),
            "\"single\""
        );
        assert_eq!(AfterFinish::parse("next"), Some(AfterFinish::NextLesson));
        assert_eq!(ReadMode::parse("bogus"), None);
    }
}
