use std::time::Duration;

use rand::Rng;

/// First reconnect delay
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// The delay stops doubling after this many attempts (16s)
const MAX_BACKOFF_EXPONENT: u32 = 4;

/// Exponential reconnect backoff with up to 25% random jitter
pub(super) struct Backoff {
    attempt: u32,
    base_ms: u64,
}

impl Backoff {
    pub(super) fn new() -> Self {
        Self::with_base(BACKOFF_BASE_MS)
    }

    pub(super) fn with_base(base_ms: u64) -> Self {
        Self { attempt: 0, base_ms }
    }

    pub(super) fn next(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.base_ms * 2u64.pow((self.attempt - 1).min(MAX_BACKOFF_EXPONENT));
        let jitter = rand::thread_rng().gen_range(0..=delay / 4);
        Duration::from_millis(delay + jitter)
    }

    pub(super) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(super) fn reset(&mut self) {
        self.attempt = 0;
    }
}
