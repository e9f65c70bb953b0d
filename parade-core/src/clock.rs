//! Clocks and round-trip offset estimation
//!
//! The coordinator owns the reference clock. Each device estimates the
//! offset between its own clock and the reference by firing a burst of
//! probes and keeping the lowest-RTT half of the replies.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Number of probes per sync run
pub const DEFAULT_SAMPLE_COUNT: usize = 10;

/// Default upper bound for a sync run to converge
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// A source of milliseconds on some timeline.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Milliseconds since the UNIX epoch according to the wall clock
pub fn unix_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Wall-clock-anchored monotonic clock.
///
/// Reads the wall clock once and advances with the tokio monotonic clock
/// afterwards, so it never jumps when the OS adjusts the time and follows
/// paused time in tests.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch_ms: i64,
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(unix_time_ms())
    }

    /// A clock that reads `epoch_ms` right now
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        self.epoch_ms + self.started.elapsed().as_millis() as i64
    }
}

/// A clock running a fixed distance ahead of (or behind) another one.
/// Used to simulate drifted devices.
#[derive(Debug, Clone)]
pub struct SkewedClock<C> {
    inner: C,
    skew_ms: i64,
}

impl<C: Clock> SkewedClock<C> {
    pub fn new(inner: C, skew_ms: i64) -> Self {
        Self { inner, skew_ms }
    }
}

impl<C: Clock> Clock for SkewedClock<C> {
    fn now_ms(&self) -> i64 {
        self.inner.now_ms() + self.skew_ms
    }
}

/// Errors surfaced by a sync run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync run did not converge within {0:?}")]
    Timeout(Duration),

    #[error("session closed before the sync run converged")]
    SessionClosed,

    #[error("a sync run needs at least one probe")]
    NoProbes,
}

/// One completed probe round trip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSample {
    pub round_trip_ms: i64,
    pub offset_ms: f64,
}

/// What happened to a probe reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyOutcome {
    /// No outstanding probe carries this send time
    Rejected,
    /// Sample recorded, more replies needed
    Recorded { remaining: usize },
    /// The run finished with this offset
    Converged(f64),
}

/// Estimates `reference - local` from probe/reply pairs.
#[derive(Debug, Default)]
pub struct OffsetEstimator {
    /// Outstanding probes keyed by send time (probes sent in the same
    /// millisecond share a key)
    outstanding: HashMap<i64, usize>,
    samples: Vec<OffsetSample>,
    /// Samples needed by the current run, 0 when idle
    target: usize,
    offset_ms: Option<f64>,
}

impl OffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run expecting `sample_count` replies.
    ///
    /// Drops anything still in flight from a previous run. The last
    /// converged offset stays usable until the new run converges.
    pub fn begin_run(&mut self, sample_count: usize) -> Result<(), SyncError> {
        if sample_count == 0 {
            return Err(SyncError::NoProbes);
        }
        self.outstanding.clear();
        self.samples.clear();
        self.target = sample_count;
        Ok(())
    }

    /// Register a probe sent at `local_now`. Returns the timestamp to put
    /// on the wire.
    pub fn create_probe(&mut self, local_now: i64) -> i64 {
        *self.outstanding.entry(local_now).or_insert(0) += 1;
        local_now
    }

    /// Handle a probe reply received at `local_receive`.
    pub fn handle_reply(
        &mut self,
        send_time: i64,
        reference_time: i64,
        local_receive: i64,
    ) -> ReplyOutcome {
        if self.target == 0 {
            return ReplyOutcome::Rejected;
        }

        match self.outstanding.get_mut(&send_time) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.outstanding.remove(&send_time);
            }
            None => return ReplyOutcome::Rejected,
        }

        let round_trip_ms = local_receive - send_time;
        let midpoint = send_time as f64 + round_trip_ms as f64 / 2.0;
        self.samples.push(OffsetSample {
            round_trip_ms,
            offset_ms: reference_time as f64 - midpoint,
        });

        if self.samples.len() < self.target {
            return ReplyOutcome::Recorded {
                remaining: self.target - self.samples.len(),
            };
        }

        let offset = best_half_average(&mut self.samples);
        tracing::debug!(
            "Clock sync converged: offset={:.1}ms from {} samples",
            offset,
            self.samples.len()
        );

        self.offset_ms = Some(offset);
        self.abandon_run();
        ReplyOutcome::Converged(offset)
    }

    /// Give up on the current run (timeout). Late replies are rejected.
    pub fn abandon_run(&mut self) {
        self.outstanding.clear();
        self.samples.clear();
        self.target = 0;
    }

    pub fn is_running(&self) -> bool {
        self.target > 0
    }

    pub fn is_synced(&self) -> bool {
        self.offset_ms.is_some()
    }

    /// Last converged offset (reference minus local)
    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    /// Reference time corresponding to `local_now`. None until the first
    /// run converges.
    pub fn now(&self, local_now: i64) -> Option<i64> {
        self.offset_ms
            .map(|offset| local_now + offset.round() as i64)
    }

    /// Local time corresponding to a reference timestamp
    pub fn to_local(&self, reference_time: i64) -> Option<i64> {
        self.offset_ms
            .map(|offset| reference_time - offset.round() as i64)
    }
}

/// Average the offsets of the lowest-RTT half of the samples
fn best_half_average(samples: &mut [OffsetSample]) -> f64 {
    samples.sort_by_key(|s| s.round_trip_ms);
    let keep = (samples.len() / 2).max(1);
    let sum: f64 = samples[..keep].iter().map(|s| s.offset_ms).sum();
    sum / keep as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a full run against a reference clock `skew` ahead, with the
    /// given per-probe one-way latencies.
    fn run_with_latencies(estimator: &mut OffsetEstimator, skew: i64, latencies: &[i64]) -> ReplyOutcome {
        estimator.begin_run(latencies.len()).unwrap();
        let mut outcome = ReplyOutcome::Rejected;
        for (i, latency) in latencies.iter().enumerate() {
            let sent = 10_000 + i as i64 * 3;
            estimator.create_probe(sent);
            let reference = sent + latency + skew;
            outcome = estimator.handle_reply(sent, reference, sent + 2 * latency);
        }
        outcome
    }

    #[test]
    fn test_converges_to_constant_offset() {
        let mut estimator = OffsetEstimator::new();
        for skew in [-4_000, 0, 2_500, 86_400_000] {
            let outcome = run_with_latencies(&mut estimator, skew, &[20; 10]);
            assert_eq!(outcome, ReplyOutcome::Converged(skew as f64));
            assert_eq!(estimator.now(1_000), Some(1_000 + skew));
        }
    }

    #[test]
    fn test_slow_samples_are_trimmed() {
        let mut estimator = OffsetEstimator::new();
        // Asymmetric queueing on the slow probes skews their midpoint
        estimator.begin_run(4).unwrap();
        let skew = 700;
        estimator.create_probe(0);
        estimator.create_probe(1);
        estimator.create_probe(2);
        estimator.create_probe(3);
        // Fast, symmetric 10ms legs
        estimator.handle_reply(0, 10 + skew, 20);
        estimator.handle_reply(1, 11 + skew, 21);
        // Slow: 300ms out, 10ms back
        estimator.handle_reply(2, 302 + skew, 312);
        let outcome = estimator.handle_reply(3, 303 + skew, 313);

        assert_eq!(outcome, ReplyOutcome::Converged(skew as f64));
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_replies() {
        let mut estimator = OffsetEstimator::new();
        estimator.begin_run(2).unwrap();
        estimator.create_probe(100);

        assert_eq!(estimator.handle_reply(99, 500, 120), ReplyOutcome::Rejected);
        assert_eq!(
            estimator.handle_reply(100, 500, 120),
            ReplyOutcome::Recorded { remaining: 1 }
        );
        // Same send time again - already consumed
        assert_eq!(estimator.handle_reply(100, 500, 121), ReplyOutcome::Rejected);
        assert!(!estimator.is_synced());
    }

    #[test]
    fn test_probes_in_same_millisecond_match_one_for_one() {
        let mut estimator = OffsetEstimator::new();
        estimator.begin_run(2).unwrap();
        estimator.create_probe(50);
        estimator.create_probe(50);

        assert!(matches!(
            estimator.handle_reply(50, 60, 70),
            ReplyOutcome::Recorded { remaining: 1 }
        ));
        assert!(matches!(estimator.handle_reply(50, 60, 70), ReplyOutcome::Converged(_)));
        assert_eq!(estimator.handle_reply(50, 60, 70), ReplyOutcome::Rejected);
    }

    #[test]
    fn test_partial_run_never_converges() {
        let mut estimator = OffsetEstimator::new();
        estimator.begin_run(10).unwrap();
        for t in 0..10 {
            estimator.create_probe(t);
        }
        for t in 0..9 {
            assert!(matches!(
                estimator.handle_reply(t, t + 5, t + 10),
                ReplyOutcome::Recorded { .. }
            ));
        }
        assert!(estimator.is_running());
        assert_eq!(estimator.offset_ms(), None);
        assert_eq!(estimator.now(123), None);

        estimator.abandon_run();
        assert_eq!(estimator.handle_reply(9, 14, 19), ReplyOutcome::Rejected);
    }

    #[test]
    fn test_resync_keeps_previous_offset_until_converged() {
        let mut estimator = OffsetEstimator::new();
        run_with_latencies(&mut estimator, 300, &[5; 4]);
        assert_eq!(estimator.offset_ms(), Some(300.0));

        estimator.begin_run(4).unwrap();
        estimator.create_probe(40_000);
        estimator.handle_reply(40_000, 40_410, 40_020);
        assert_eq!(estimator.offset_ms(), Some(300.0));
    }

    #[test]
    fn test_zero_probe_run_is_refused() {
        let mut estimator = OffsetEstimator::new();
        assert_eq!(estimator.begin_run(0), Err(SyncError::NoProbes));
    }

    #[test]
    fn test_to_local_inverts_now() {
        let mut estimator = OffsetEstimator::new();
        run_with_latencies(&mut estimator, -1_250, &[8; 6]);
        let reference = estimator.now(5_000).unwrap();
        assert_eq!(estimator.to_local(reference), Some(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);

        let skewed = SkewedClock::new(clock, -200);
        assert_eq!(skewed.now_ms(), 1_050);
    }
}
