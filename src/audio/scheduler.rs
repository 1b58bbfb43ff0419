//! Segment-end detection
//!
//! The detector moves through `Idle -> FarWait -> NearWait -> Fired`. While
//! the boundary is far away it sleeps in coarse chunks aimed at the start of
//! the near window; once the remaining real time drops under that window it
//! polls every frame and fires a little early (the guard) to absorb audio
//! scheduling jitter.
//!
//! The scheduler does no I/O. The player owns the timer and calls `check`
//! with a fresh `Observation` whenever the returned `Wakeup` elapses.

use std::time::Duration;

use super::media::PlatformProfile;
use super::mode::{AfterFinish, ReadMode};

/// Poll interval while in the near window
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);
/// Shortest coarse sleep
pub const MIN_COARSE_DELAY: Duration = Duration::from_millis(10);
/// Longest coarse sleep before re-evaluating
pub const MAX_CHUNK: Duration = Duration::from_millis(10_000);

/// Token for one armed detector
///
/// Only the most recently issued handle is live; checks made with any
/// earlier handle report `Check::Stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorState {
    #[default]
    Idle,
    FarWait,
    NearWait,
    Fired,
}

/// Snapshot of everything the detector validates against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub position: f64,
    pub rate: f64,
    pub paused: bool,
    pub mode: ReadMode,
    pub after_finish: AfterFinish,
    pub index: Option<usize>,
    pub segment_end: f64,
}

/// When to call `check` next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    After(Duration),
    NextFrame,
}

impl Wakeup {
    pub fn delay(self) -> Duration {
        match self {
            Self::After(d) => d,
            Self::NextFrame => FRAME_INTERVAL,
        }
    }
}

/// A crossed boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentEnd {
    pub index: usize,
    pub end: f64,
    pub mode: ReadMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check {
    Pending(Wakeup),
    Fire(SegmentEnd),
    /// The handle was superseded or the session moved on
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    handle: ScheduleHandle,
    mode: ReadMode,
    index: usize,
    end: f64,
    guard: f64,
}

#[derive(Debug)]
pub struct AdvanceScheduler {
    profile: PlatformProfile,
    issued: u64,
    armed: Option<Armed>,
    state: DetectorState,
}

fn remaining_real(end: f64, position: f64, rate: f64) -> Duration {
    let rate = if rate.is_finite() { rate.max(0.0001) } else { 1.0 };
    let secs = ((end - position) / rate).max(0.0);
    Duration::from_secs_f64(secs.min(3600.0))
}

impl AdvanceScheduler {
    pub fn new(profile: PlatformProfile) -> Self {
        Self {
            profile,
            issued: 0,
            armed: None,
            state: DetectorState::Idle,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// The live handle, if any
    pub fn handle(&self) -> Option<ScheduleHandle> {
        self.armed.map(|a| a.handle)
    }

    /// Drop any armed detector
    pub fn cancel(&mut self) {
        self.armed = None;
        self.state = DetectorState::Idle;
    }

    /// Arm detection of the current segment end
    ///
    /// Always cancels first. Returns `None` (staying idle) when playback is
    /// paused, the mode plays through, or no segment is selected.
    pub fn arm(&mut self, obs: &Observation) -> Option<(ScheduleHandle, Wakeup)> {
        self.cancel();
        if obs.paused || obs.mode.plays_through(obs.after_finish) {
            return None;
        }
        let index = obs.index?;
        if obs.segment_end <= 0.0 {
            return None;
        }

        self.issued += 1;
        let handle = ScheduleHandle(self.issued);
        self.armed = Some(Armed {
            handle,
            mode: obs.mode,
            index,
            end: obs.segment_end,
            guard: self.profile.guard_ahead(obs.rate),
        });

        let remaining = remaining_real(obs.segment_end, obs.position, obs.rate);
        let wakeup = self.wakeup_for(remaining);
        tracing::trace!(
            "Armed segment {} end {:.3}s, {:?} remaining, {:?}",
            index,
            obs.segment_end,
            remaining,
            self.state
        );
        Some((handle, wakeup))
    }

    fn wakeup_for(&mut self, remaining: Duration) -> Wakeup {
        if remaining <= self.profile.near_window() {
            self.state = DetectorState::NearWait;
            Wakeup::NextFrame
        } else {
            self.state = DetectorState::FarWait;
            let until_near = remaining.saturating_sub(self.profile.near_window());
            Wakeup::After(until_near.clamp(MIN_COARSE_DELAY, MAX_CHUNK))
        }
    }

    /// Evaluate the detector for `handle`
    pub fn check(&mut self, handle: ScheduleHandle, obs: &Observation) -> Check {
        let Some(armed) = self.armed else {
            return Check::Stale;
        };
        if armed.handle != handle {
            return Check::Stale;
        }
        let same_segment =
            obs.index == Some(armed.index) && (obs.segment_end - armed.end).abs() < 1e-9;
        if obs.mode != armed.mode || obs.paused || !same_segment {
            tracing::debug!("Dropping stale segment detector for line {}", armed.index);
            self.cancel();
            return Check::Stale;
        }

        match self.state {
            DetectorState::NearWait => {
                if obs.position >= armed.end - armed.guard {
                    self.armed = None;
                    self.state = DetectorState::Fired;
                    Check::Fire(SegmentEnd {
                        index: armed.index,
                        end: armed.end,
                        mode: armed.mode,
                    })
                } else {
                    Check::Pending(Wakeup::NextFrame)
                }
            }
            DetectorState::FarWait => {
                let remaining = remaining_real(armed.end, obs.position, obs.rate);
                if remaining <= self.profile.near_window() {
                    if let Some(a) = self.armed.as_mut() {
                        a.guard = self.profile.guard_ahead(obs.rate);
                    }
                }
                Check::Pending(self.wakeup_for(remaining))
            }
            DetectorState::Idle | DetectorState::Fired => Check::Stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(position: f64, end: f64) -> Observation {
        Observation {
            position,
            rate: 1.0,
            paused: false,
            mode: ReadMode::Single,
            after_finish: AfterFinish::None,
            index: Some(2),
            segment_end: end,
        }
    }

    #[test]
    fn test_no_arm_when_playing_through_or_paused() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let mut o = obs(1.0, 5.0);
        o.mode = ReadMode::Continuous;
        assert!(s.arm(&o).is_none());
        o.mode = ReadMode::Listen;
        assert!(s.arm(&o).is_none());
        o.after_finish = AfterFinish::SingleLoop;
        assert!(s.arm(&o).is_some());

        let mut o = obs(1.0, 5.0);
        o.paused = true;
        assert!(s.arm(&o).is_none());
        assert_eq!(s.state(), DetectorState::Idle);

        let mut o = obs(1.0, 5.0);
        o.index = None;
        assert!(s.arm(&o).is_none());
    }

    #[test]
    fn test_far_wait_uses_remaining_time_scaled_by_rate() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (_, wake) = s.arm(&obs(1.0, 3.0)).unwrap();
        assert_eq!(s.state(), DetectorState::FarWait);
        // 2000ms remaining, woken when the 120ms near window begins
        assert_eq!(wake, Wakeup::After(Duration::from_millis(1880)));

        let mut fast = obs(1.0, 3.0);
        fast.rate = 2.0;
        let (_, wake) = s.arm(&fast).unwrap();
        assert_eq!(wake, Wakeup::After(Duration::from_millis(880)));
    }

    #[test]
    fn test_far_wait_is_chunked() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (_, wake) = s.arm(&obs(0.0, 60.0)).unwrap();
        assert_eq!(wake, Wakeup::After(MAX_CHUNK));
    }

    #[test]
    fn test_near_window_polls_per_frame() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (_, wake) = s.arm(&obs(4.9, 5.0)).unwrap();
        assert_eq!(wake, Wakeup::NextFrame);
        assert_eq!(s.state(), DetectorState::NearWait);

        // 5.0 - 0.06 guard
        let mut s = AdvanceScheduler::new(PlatformProfile::Touch);
        let (_, wake) = s.arm(&obs(4.85, 5.0)).unwrap();
        assert_eq!(wake, Wakeup::NextFrame);
    }

    #[test]
    fn test_fires_at_guarded_boundary() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (h, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        assert_eq!(s.check(h, &obs(4.93, 5.0)), Check::Pending(Wakeup::NextFrame));
        match s.check(h, &obs(4.95, 5.0)) {
            Check::Fire(end) => {
                assert_eq!(end.index, 2);
                assert_eq!(end.end, 5.0);
            }
            other => panic!("expected fire, got {:?}", other),
        }
        assert_eq!(s.state(), DetectorState::Fired);
        assert_eq!(s.check(h, &obs(4.96, 5.0)), Check::Stale);
    }

    #[test]
    fn test_far_transitions_to_near() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (h, _) = s.arm(&obs(1.0, 3.0)).unwrap();
        assert_eq!(
            s.check(h, &obs(2.0, 3.0)),
            Check::Pending(Wakeup::After(Duration::from_millis(880)))
        );
        assert_eq!(s.check(h, &obs(2.95, 3.0)), Check::Pending(Wakeup::NextFrame));
        assert_eq!(s.state(), DetectorState::NearWait);
        assert!(matches!(s.check(h, &obs(2.95, 3.0)), Check::Fire(_)));
    }

    #[test]
    fn test_rearm_leaves_single_live_handle() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (first, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        let (second, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        assert_ne!(first, second);
        assert_eq!(s.handle(), Some(second));
        assert_eq!(s.check(first, &obs(5.0, 5.0)), Check::Stale);
        assert!(matches!(s.check(second, &obs(5.0, 5.0)), Check::Fire(_)));
        assert_eq!(s.check(first, &obs(5.0, 5.0)), Check::Stale);
    }

    #[test]
    fn test_mode_change_self_cancels() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (h, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        let mut changed = obs(5.0, 5.0);
        changed.mode = ReadMode::Shadow;
        assert_eq!(s.check(h, &changed), Check::Stale);
        assert!(!s.is_armed());
        assert_eq!(s.state(), DetectorState::Idle);
    }

    #[test]
    fn test_segment_change_self_cancels() {
        let mut s = AdvanceScheduler::new(PlatformProfile::Desktop);
        let (h, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        let mut moved = obs(5.0, 5.0);
        moved.index = Some(3);
        assert_eq!(s.check(h, &moved), Check::Stale);

        let (h, _) = s.arm(&obs(4.9, 5.0)).unwrap();
        let mut paused = obs(5.0, 5.0);
        paused.paused = true;
        assert_eq!(s.check(h, &paused), Check::Stale);
    }
}
