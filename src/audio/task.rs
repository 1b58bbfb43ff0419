//! Player task
//!
//! Runs a `LessonPlayer` on a tokio task, processing commands from the UI,
//! events from the media element, results of spawned fetches and due
//! timers, one at a time.

use tokio::task::JoinHandle;

use super::events::{
    PlayerCommand, PlayerCommandReceiver, PlayerEventReceiver, SharedPlaybackState,
    player_command_channel, player_event_channel,
};
use super::handle::PlayerHandle;
use super::media::{MediaElement, MediaEventReceiver};
use super::player::{
    LessonPlayer, LessonSource, PlayerConfig, PlayerMessageReceiver, player_message_channel,
};
use super::timer::sleep_until_opt;

pub struct PlayerTaskHandle {
    pub handle: PlayerHandle,
    pub event_rx: Option<PlayerEventReceiver>,
    task: Option<JoinHandle<()>>,
}

impl PlayerTaskHandle {
    pub fn take_event_rx(&mut self) -> Option<PlayerEventReceiver> {
        self.event_rx.take()
    }

    /// Ask the task to save and stop, then wait for it
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            self.handle.shutdown();
            if let Err(e) = task.await {
                tracing::error!("Lesson player task failed: {}", e);
            }
        }
    }
}

impl Drop for PlayerTaskHandle {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// Spawn the player task for one lesson
///
/// Must be called from within a tokio runtime. `media_rx` is the event
/// stream of `media`.
pub fn spawn_lesson_player<M: MediaElement>(
    config: PlayerConfig,
    source: LessonSource,
    media: M,
    media_rx: MediaEventReceiver,
) -> PlayerTaskHandle {
    let (command_tx, command_rx) = player_command_channel();
    let (event_tx, event_rx) = player_event_channel();
    let (internal_tx, internal_rx) = player_message_channel();

    let state = SharedPlaybackState::new();
    let handle = PlayerHandle::new(command_tx, state.clone());

    let player = LessonPlayer::new(config, source, media, event_tx, state, internal_tx);
    let task = tokio::spawn(player_task_main(player, command_rx, media_rx, internal_rx));

    PlayerTaskHandle {
        handle,
        event_rx: Some(event_rx),
        task: Some(task),
    }
}

/// Main loop of the player task
///
/// Exits on `Shutdown` or when every `PlayerHandle` is gone.
async fn player_task_main<M: MediaElement>(
    mut player: LessonPlayer<M>,
    mut command_rx: PlayerCommandReceiver,
    mut media_rx: MediaEventReceiver,
    mut internal_rx: PlayerMessageReceiver,
) {
    tracing::info!("Lesson player started");
    player.start();

    loop {
        let deadline = player.next_deadline();
        tokio::select! {
            biased;

            command = command_rx.recv() => match command {
                Some(PlayerCommand::Shutdown) => {
                    tracing::info!("Lesson player exiting (shutdown requested)");
                    break;
                }
                Some(command) => player.handle_command(command),
                None => {
                    tracing::info!("Lesson player exiting (command channel closed)");
                    break;
                }
            },

            Some(event) = media_rx.recv() => player.handle_media_event(event),

            Some(message) = internal_rx.recv() => player.handle_message(message),

            _ = sleep_until_opt(deadline) => player.on_timers(tokio::time::Instant::now()),
        }
    }

    player.shutdown();
}
