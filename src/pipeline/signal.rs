//! One-shot signal shared between threads

use crate::util::lock;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Set once, observed by any number of waiters
///
/// The daemon uses one as its shutdown flag: backoff sleeps and scheduler
/// ticks wait on it, so `complete()` wakes them immediately instead of
/// letting them run out their timeouts.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    done: Mutex<bool>,
    cvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        *lock(&self.done) = true;
        self.cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *lock(&self.done)
    }

    /// Block until completed or `timeout` elapses; true if completed
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = lock(&self.done);
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            done = match self.cvar.wait_timeout(done, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
