//! Auto-advance countdown
//!
//! At most one countdown is outstanding. Each arm bumps a generation
//! counter; the coordinator only honours a fire whose generation is still
//! the pending one, so a countdown cancelled while its timer task was
//! already waking up can never apply.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Countdown {
    generation: u64,
    task: JoinHandle<()>,
}

/// Single-slot timer owned by the coordinator
#[derive(Default)]
pub struct Scheduler {
    generation: u64,
    pending: Option<Countdown>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any pending countdown with one that calls `on_expiry` with
    /// its generation after `delay`. Returns that generation.
    pub fn arm<F>(&mut self, delay: Duration, on_expiry: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_expiry(generation);
        });

        debug!("Countdown {} armed for {:?}", generation, delay);
        self.pending = Some(Countdown { generation, task });
        generation
    }

    /// Drop the pending countdown. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(countdown) => {
                countdown.task.abort();
                debug!("Countdown {} cancelled", countdown.generation);
                true
            }
            None => false,
        }
    }

    /// Claim the expiry of `generation`. Returns false for stale fires.
    pub fn fire(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(countdown) if countdown.generation == generation => {
                self.pending = None;
                true
            }
            _ => {
                debug!("Ignoring stale countdown {}", generation);
                false
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Generation of the pending countdown, if any
    pub fn pending_generation(&self) -> Option<u64> {
        self.pending.as_ref().map(|c| c.generation)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
