//! One-shot deadlines owned by the player task
//!
//! The player never spawns timer tasks. Each pending callback is a `Timer`
//! slot holding a deadline and a payload; the task loop sleeps until the
//! earliest slot and then drains every slot that is due.

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Timer<T> {
    slot: Option<(Instant, T)>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> Timer<T> {
    /// Replace any pending deadline
    pub fn set(&mut self, at: Instant, value: T) {
        self.slot = Some((at, value));
    }

    pub fn cancel(&mut self) {
        self.slot = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.slot.as_ref().map(|(at, _)| *at)
    }

    pub fn value(&self) -> Option<&T> {
        self.slot.as_ref().map(|(_, v)| v)
    }

    /// Take the payload if the deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.slot {
            Some((at, _)) if *at <= now => self.slot.take().map(|(_, v)| v),
            _ => None,
        }
    }
}

impl Timer<()> {
    /// Keep the earlier of the pending and the requested deadline
    pub fn set_earliest(&mut self, at: Instant) {
        match self.deadline() {
            Some(current) if current <= at => {}
            _ => self.set(at, ()),
        }
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

/// Sleep until `deadline`, or forever when there is none
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_take_due() {
        let now = Instant::now();
        let mut t = Timer::default();
        t.set(now + Duration::from_millis(100), 7u64);
        assert_eq!(t.take_due(now), None);
        assert!(t.is_set());
        assert_eq!(t.take_due(now + Duration::from_millis(100)), Some(7));
        assert!(!t.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_earliest_keeps_sooner_deadline() {
        let now = Instant::now();
        let mut t = Timer::default();
        t.set_earliest(now + Duration::from_millis(50));
        t.set_earliest(now + Duration::from_millis(80));
        assert_eq!(t.deadline(), Some(now + Duration::from_millis(50)));
        t.set_earliest(now + Duration::from_millis(20));
        assert_eq!(t.deadline(), Some(now + Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_earliest() {
        let start = Instant::now();
        let a = Some(start + Duration::from_millis(30));
        let b = Some(start + Duration::from_millis(10));
        let at = earliest([a, None, b]);
        assert_eq!(at, b);
        sleep_until_opt(at).await;
        assert_eq!(Instant::now(), start + Duration::from_millis(10));
        assert_eq!(earliest([None, None]), None);
    }
}
