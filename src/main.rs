use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use nce_flow::api::MemoryFetcher;
use nce_flow::audio::{
    AfterFinish, LessonSource, MediaSource, PlayerConfig, PlayerEvent, ReadMode, VirtualMedia,
    VirtualMediaOptions, end_for, spawn_lesson_player,
};
use nce_flow::features::navigation::LessonId;
use nce_flow::features::settings::SettingKey;
use nce_flow::features::store::{KeyValueStore, MemoryStore};
use nce_flow::features::transcript::{ClassifierPolicy, ContentOffsets, Transcript, parse_transcript};
use nce_flow::utils::{format_lrc_time, format_time};

const SIMULATED_AUDIO_URL: &str = "simulate.mp3";

/// CLI wrapper for ReadMode (needed for clap ValueEnum)
#[derive(Clone, Copy, Default, ValueEnum)]
enum CliMode {
    #[default]
    Continuous,
    Single,
    Listen,
    Shadow,
}

impl From<CliMode> for ReadMode {
    fn from(cli: CliMode) -> Self {
        match cli {
            CliMode::Continuous => ReadMode::Continuous,
            CliMode::Single => ReadMode::Single,
            CliMode::Listen => ReadMode::Listen,
            CliMode::Shadow => ReadMode::Shadow,
        }
    }
}

/// CLI wrapper for AfterFinish
#[derive(Clone, Copy, Default, ValueEnum)]
enum CliAfter {
    #[default]
    None,
    Single,
    All,
    Next,
}

impl From<CliAfter> for AfterFinish {
    fn from(cli: CliAfter) -> Self {
        match cli {
            CliAfter::None => AfterFinish::None,
            CliAfter::Single => AfterFinish::SingleLoop,
            CliAfter::All => AfterFinish::AllLoop,
            CliAfter::Next => AfterFinish::NextLesson,
        }
    }
}

#[derive(Parser)]
#[command(name = "nce-flow")]
#[command(about = "Inspect bilingual LRC transcripts and simulate guided lesson playback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print header, lines, content offsets and segment ends of a transcript
    Inspect {
        /// Path to an .lrc file
        lrc: PathBuf,
    },
    /// Play a transcript on a simulated media element and print the events
    Simulate {
        /// Path to an .lrc file
        lrc: PathBuf,

        /// Reading mode
        #[arg(short, long, default_value = "continuous")]
        mode: CliMode,

        /// What happens when a line or the lesson finishes
        #[arg(short, long, default_value = "none")]
        after: CliAfter,

        /// Playback rate (0.5 - 2.5)
        #[arg(short, long, default_value_t = 1.0)]
        rate: f64,

        /// Audio duration in seconds; defaults to 3s after the last line starts
        #[arg(short, long)]
        duration: Option<f64>,

        /// Start at the first content line
        #[arg(long)]
        skip_intro: bool,

        /// Stop after this many simulated seconds
        #[arg(long, default_value_t = 600.0)]
        limit: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { lrc } => inspect(&lrc),
        Command::Simulate {
            lrc,
            mode,
            after,
            rate,
            duration,
            skip_intro,
            limit,
        } => {
            let options = SimulateOptions {
                mode: mode.into(),
                after: after.into(),
                rate,
                duration,
                skip_intro,
                limit,
            };
            // Paused clock: simulated time advances as fast as the events allow
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(simulate(&lrc, options))
        }
    }
}

fn load_lrc(path: &Path) -> Result<Transcript> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let transcript = parse_transcript(&text);
    if transcript.is_empty() {
        bail!("{} contains no timed lines", path.display());
    }
    Ok(transcript)
}

fn inspect(path: &Path) -> Result<()> {
    let transcript = load_lrc(path)?;
    let offsets = ContentOffsets::compute(&transcript.lines, &ClassifierPolicy::default());
    let meta = &transcript.meta;

    println!("title:   {}", meta.title);
    println!("album:   {}", meta.album);
    println!("artist:  {}", meta.artist);
    println!("author:  {}", meta.author);
    println!(
        "lines:   {} (first content {}, shadow start {})",
        transcript.len(),
        offsets.first_content,
        offsets.shadow_start
    );
    println!();
    println!(
        "{:>4}  {:>9}  {:>9}  {:>9}  {:>9}  text",
        "#", "start", "listen", "single", "shadow"
    );
    for (i, line) in transcript.lines.iter().enumerate() {
        let marker = match (i == offsets.first_content, i == offsets.shadow_start) {
            (true, true) => "*",
            (true, false) => "c",
            (false, true) => "s",
            (false, false) => " ",
        };
        println!(
            "{:>3}{} {:>9}  {:>9}  {:>9}  {:>9}  {} | {}",
            i,
            marker,
            format_lrc_time(line.start),
            format_lrc_time(end_for(&transcript.lines, i, ReadMode::Listen)),
            format_lrc_time(end_for(&transcript.lines, i, ReadMode::Single)),
            format_lrc_time(end_for(&transcript.lines, i, ReadMode::Shadow)),
            line.en,
            line.cn
        );
    }
    Ok(())
}

struct SimulateOptions {
    mode: ReadMode,
    after: AfterFinish,
    rate: f64,
    duration: Option<f64>,
    skip_intro: bool,
    limit: f64,
}

async fn simulate(path: &Path, options: SimulateOptions) -> Result<()> {
    let transcript = load_lrc(path)?;
    let line_count = transcript.len();
    let duration = options.duration.unwrap_or_else(|| {
        transcript
            .lines
            .last()
            .map(|line| line.start + 3.0)
            .unwrap_or(3.0)
    });

    let store = MemoryStore::new();
    store.set(SettingKey::ReadMode.key(), options.mode.as_str())?;
    store.set(SettingKey::AfterFinish.key(), options.after.as_str())?;
    store.set(SettingKey::PlaybackRate.key(), &options.rate.to_string())?;
    store.set(SettingKey::SkipIntro.key(), &options.skip_intro.to_string())?;

    let fetcher = MemoryFetcher::new();
    fetcher.insert(SIMULATED_AUDIO_URL, Vec::<u8>::new());
    let config = PlayerConfig::new(
        Arc::new(store),
        Arc::new(MemoryStore::new()),
        Arc::new(fetcher),
    );

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lesson".to_string());
    let source = LessonSource::new(LessonId::new("LOCAL", stem), transcript, SIMULATED_AUDIO_URL);
    let (media, media_rx) = VirtualMedia::new(
        MediaSource::Url(SIMULATED_AUDIO_URL.into()),
        VirtualMediaOptions {
            duration,
            ..Default::default()
        },
    );

    let mut task = spawn_lesson_player(config, source, media, media_rx);
    let mut events = task
        .take_event_rx()
        .context("Player event channel already taken")?;
    let handle = task.handle.clone();

    let started = tokio::time::Instant::now();
    let deadline = started + Duration::from_secs_f64(options.limit.max(1.0));
    tracing::info!(
        "Simulating {} lines over {:.1}s of audio in {} mode",
        line_count,
        duration,
        options.mode
    );
    handle.toggle_play();

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        let elapsed = started.elapsed().as_secs_f64();
        println!("[{:>8.3}s] pos {:>7.3}  {:?}", elapsed, handle.position(), event);

        match event {
            // A learner in single mode taps play to move on
            PlayerEvent::SegmentEnded { index }
                if options.mode == ReadMode::Single && index + 1 < line_count =>
            {
                handle.toggle_play();
            }
            PlayerEvent::Notice(notice) => tracing::info!("Notice: {}", notice),
            PlayerEvent::AutoplayBlocked => handle.resume_after_gesture(),
            _ => {}
        }
    }

    let snapshot = handle.snapshot();
    tracing::info!(
        "Simulation finished at {} (line {:?}, playing {})",
        format_time(snapshot.position),
        snapshot.current_index,
        snapshot.playing
    );
    task.join().await;
    Ok(())
}
