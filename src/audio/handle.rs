//! Player handle for non-blocking control from the UI
//!
//! `PlayerHandle` sends commands to the player task and returns
//! immediately. State is read from `SharedPlaybackState` without blocking.

use super::events::{PlaybackSnapshot, PlayerCommand, PlayerCommandSender, SharedPlaybackState};
use super::mode::{AfterFinish, ReadMode};
use super::shadow::GapMode;
use crate::features::keybindings::Action;

/// Volume change per key press
pub const VOLUME_STEP: f32 = 0.1;

/// Handle for controlling a lesson player
///
/// Cloning is cheap; every clone talks to the same task. Sends to a task
/// that has already exited are dropped silently.
#[derive(Clone)]
pub struct PlayerHandle {
    command_tx: PlayerCommandSender,
    state: SharedPlaybackState,
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("state", &self.state)
            .finish()
    }
}

impl PlayerHandle {
    pub fn new(command_tx: PlayerCommandSender, state: SharedPlaybackState) -> Self {
        Self { command_tx, state }
    }

    fn send(&self, command: PlayerCommand) {
        let _ = self.command_tx.send(command);
    }

    // ============ Playback Control ============

    /// Play a line as a learner action
    pub fn play_line(&self, index: usize) {
        self.send(PlayerCommand::PlayLine { index });
    }

    pub fn toggle_play(&self) {
        self.send(PlayerCommand::TogglePlay);
    }

    pub fn pause(&self) {
        self.send(PlayerCommand::Pause);
    }

    pub fn next_line(&self) {
        self.send(PlayerCommand::NextLine);
    }

    pub fn prev_line(&self) {
        self.send(PlayerCommand::PrevLine);
    }

    pub fn replay(&self) {
        self.send(PlayerCommand::Replay);
    }

    /// Call from inside a user gesture after `PlayerEvent::AutoplayBlocked`
    pub fn resume_after_gesture(&self) {
        self.send(PlayerCommand::ResumeAfterGesture);
    }

    // ============ Modes ============

    pub fn set_mode(&self, mode: ReadMode) {
        self.send(PlayerCommand::SetMode { mode });
    }

    pub fn set_after_finish(&self, after_finish: AfterFinish) {
        self.send(PlayerCommand::SetAfterFinish { after_finish });
    }

    pub fn set_auto_follow(&self, enabled: bool) {
        self.send(PlayerCommand::SetAutoFollow { enabled });
    }

    pub fn set_shadow_repeat(&self, count: u8) {
        self.send(PlayerCommand::SetShadowRepeat { count });
    }

    pub fn set_shadow_gap(&self, gap: GapMode) {
        self.send(PlayerCommand::SetShadowGap { gap });
    }

    pub fn set_skip_intro(&self, enabled: bool) {
        self.send(PlayerCommand::SetSkipIntro { enabled });
    }

    pub fn set_auto_stop(&self, enabled: bool, count: u32) {
        self.send(PlayerCommand::SetAutoStop { enabled, count });
    }

    // ============ Output ============

    pub fn set_rate(&self, rate: f64) {
        self.send(PlayerCommand::SetRate { rate });
    }

    /// Set volume (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        self.send(PlayerCommand::SetVolume { volume });
    }

    pub fn adjust_volume(&self, delta: f32) {
        self.send(PlayerCommand::AdjustVolume { delta });
    }

    pub fn toggle_reveal(&self) {
        self.send(PlayerCommand::ToggleReveal);
    }

    /// Stop the task after persisting the position
    pub fn shutdown(&self) {
        self.send(PlayerCommand::Shutdown);
    }

    /// Run the command bound to a keyboard action
    pub fn dispatch(&self, action: Action) {
        let command = match action {
            Action::PlayPause => PlayerCommand::TogglePlay,
            Action::Replay => PlayerCommand::Replay,
            Action::NextSentence => PlayerCommand::NextLine,
            Action::PrevSentence => PlayerCommand::PrevLine,
            Action::VolumeUp => PlayerCommand::AdjustVolume { delta: VOLUME_STEP },
            Action::VolumeDown => PlayerCommand::AdjustVolume {
                delta: -VOLUME_STEP,
            },
            Action::ToggleReveal => PlayerCommand::ToggleReveal,
        };
        tracing::debug!("Key action {:?} -> {:?}", action, command);
        self.send(command);
    }

    // ============ State Queries ============

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.state.snapshot()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.state.current_index()
    }

    pub fn position(&self) -> f64 {
        self.state.position()
    }

    /// Whether the player task is still receiving commands
    pub fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::player_command_channel;

    #[test]
    fn test_dispatch_maps_actions() {
        let (tx, mut rx) = player_command_channel();
        let handle = PlayerHandle::new(tx, SharedPlaybackState::new());
        handle.dispatch(Action::PlayPause);
        handle.dispatch(Action::VolumeDown);
        handle.dispatch(Action::PrevSentence);
        assert_eq!(rx.try_recv().unwrap(), PlayerCommand::TogglePlay);
        assert_eq!(
            rx.try_recv().unwrap(),
            PlayerCommand::AdjustVolume { delta: -VOLUME_STEP }
        );
        assert_eq!(rx.try_recv().unwrap(), PlayerCommand::PrevLine);
    }

    #[test]
    fn test_send_after_close_is_ignored() {
        let (tx, rx) = player_command_channel();
        let handle = PlayerHandle::new(tx, SharedPlaybackState::new());
        drop(rx);
        assert!(!handle.is_alive());
        handle.replay();
    }
}
