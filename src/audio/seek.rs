//! Seek verification with retry and buffered-source fallback
//!
//! Some servers ignore HTTP range requests, so a seek on a streamed source
//! silently lands somewhere else. Every segment seek is verified; after the
//! retries run out the whole file is loaded into memory once per lesson and
//! the seek is tried again against that source.

use std::time::Duration;

use super::media::PlatformProfile;

/// Accepted distance between requested and actual position, in seconds
pub const SEEK_EPSILON: f64 = 0.25;
/// Targets at or below this are never verified
pub const NEAR_ZERO_TARGET: f64 = 0.5;

/// Whether a seek to `target` that landed on `actual` is close enough
pub fn seek_looks_ok(target: f64, actual: f64, epsilon: f64) -> bool {
    if !target.is_finite() || target <= NEAR_ZERO_TARGET {
        return true;
    }
    let actual = if actual.is_finite() { actual } else { 0.0 };
    (actual - target).abs() <= epsilon
}

/// Limits for one verified seek
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Re-seeks after the first failed verification
    pub max_retries: u32,
    pub epsilon: f64,
    /// Wait for a seek-completed signal before verifying anyway
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn for_profile(profile: PlatformProfile) -> Self {
        Self {
            max_retries: 2,
            epsilon: SEEK_EPSILON,
            timeout: profile.seek_timeout(),
        }
    }
}

/// One in-flight verified seek, tied to a play request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekAttempt {
    pub seq: u64,
    pub target: f64,
    failures: u32,
}

impl SeekAttempt {
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// What to do after verifying a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekVerdict {
    /// Landed within epsilon
    Accurate,
    /// Re-issue the same seek
    Retry,
    /// Switch to a fully buffered source, then seek again
    FallbackToBuffer {
        /// First fallback of the lesson, tell the user
        warn: bool,
    },
    /// Give up and play from wherever the seek landed
    BestEffort,
}

#[derive(Debug)]
pub struct SeekReconciler {
    policy: RetryPolicy,
    buffered: bool,
    fallback_attempted: bool,
    warned: bool,
}

impl SeekReconciler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            buffered: false,
            fallback_attempted: false,
            warned: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub fn begin(&self, seq: u64, target: f64) -> SeekAttempt {
        SeekAttempt {
            seq,
            target: target.max(0.0),
            failures: 0,
        }
    }

    /// Check where a seek landed and decide the next step
    pub fn verify(&mut self, attempt: &mut SeekAttempt, actual: f64) -> SeekVerdict {
        if seek_looks_ok(attempt.target, actual, self.policy.epsilon) {
            return SeekVerdict::Accurate;
        }
        attempt.failures += 1;
        tracing::debug!(
            "Seek to {:.2}s landed at {:.2}s (failure {})",
            attempt.target,
            actual,
            attempt.failures
        );
        if attempt.failures <= self.policy.max_retries {
            return SeekVerdict::Retry;
        }
        if !self.buffered && !self.fallback_attempted {
            self.fallback_attempted = true;
            let warn = !self.warned;
            self.warned = true;
            return SeekVerdict::FallbackToBuffer { warn };
        }
        SeekVerdict::BestEffort
    }

    /// The buffered source is attached
    pub fn mark_buffered(&mut self) {
        self.buffered = true;
        self.fallback_attempted = true;
    }

    /// The buffered source is attached for `attempt`; restart its retry budget
    pub fn buffered_ready(&mut self, attempt: &mut SeekAttempt) {
        self.mark_buffered();
        attempt.failures = 0;
    }

    /// Forget everything for a newly loaded lesson
    pub fn reset(&mut self) {
        self.buffered = false;
        self.fallback_attempted = false;
        self.warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> SeekReconciler {
        SeekReconciler::new(RetryPolicy::for_profile(PlatformProfile::Desktop))
    }

    #[test]
    fn test_seek_looks_ok() {
        assert!(seek_looks_ok(10.0, 10.2, SEEK_EPSILON));
        assert!(!seek_looks_ok(10.0, 10.3, SEEK_EPSILON));
        assert!(seek_looks_ok(0.4, 7.0, SEEK_EPSILON));
        assert!(seek_looks_ok(f64::NAN, 7.0, SEEK_EPSILON));
        assert!(!seek_looks_ok(3.0, f64::NAN, SEEK_EPSILON));
    }

    #[test]
    fn test_accurate_seek() {
        let mut r = reconciler();
        let mut a = r.begin(1, 12.0);
        assert_eq!(r.verify(&mut a, 12.1), SeekVerdict::Accurate);
        assert_eq!(a.failures(), 0);
    }

    #[test]
    fn test_three_failures_fall_back_once() {
        let mut r = reconciler();
        let mut a = r.begin(1, 12.0);
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::Retry);
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::Retry);
        assert_eq!(
            r.verify(&mut a, 0.0),
            SeekVerdict::FallbackToBuffer { warn: true }
        );
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::BestEffort);

        // A later request in the same lesson never refetches
        let mut b = r.begin(2, 20.0);
        r.verify(&mut b, 0.0);
        r.verify(&mut b, 0.0);
        assert_eq!(r.verify(&mut b, 0.0), SeekVerdict::BestEffort);
    }

    #[test]
    fn test_buffered_source_restarts_retries() {
        let mut r = reconciler();
        let mut a = r.begin(1, 12.0);
        for _ in 0..3 {
            r.verify(&mut a, 0.0);
        }
        r.buffered_ready(&mut a);
        assert!(r.is_buffered());
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::Retry);
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::Retry);
        assert_eq!(r.verify(&mut a, 0.0), SeekVerdict::BestEffort);
        assert_eq!(r.verify(&mut a, 12.0), SeekVerdict::Accurate);
    }

    #[test]
    fn test_reset_allows_fallback_for_new_lesson() {
        let mut r = reconciler();
        let mut a = r.begin(1, 12.0);
        for _ in 0..3 {
            r.verify(&mut a, 0.0);
        }
        r.reset();
        let mut b = r.begin(2, 12.0);
        r.verify(&mut b, 0.0);
        r.verify(&mut b, 0.0);
        assert_eq!(
            r.verify(&mut b, 0.0),
            SeekVerdict::FallbackToBuffer { warn: true }
        );
    }
}
