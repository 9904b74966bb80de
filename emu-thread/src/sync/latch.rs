//! One-shot latch with a timed wait.
//!
//! `std::thread::JoinHandle` has no timed join. The computation thread sets
//! a latch on its way out (from a drop guard, so panics count too) and the
//! controller waits on the latch with a deadline before calling `join`.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use minstant::Instant;

#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the latch and wakes every waiter. Idempotent.
    pub fn set(&self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the latch is open or `timeout` elapses.
    ///
    /// Returns `true` if the latch was opened in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(set, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            set = guard;
        }
        true
    }
}

/// Sets the latch when dropped.
pub(crate) struct SetOnDrop<'a>(pub(crate) &'a Latch);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set();
    }
}
