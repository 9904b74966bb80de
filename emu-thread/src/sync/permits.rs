//! Counting permits (a semaphore) with a lock-free fast path.
//!
//! `try_acquire` and `release` are a CAS loop and a `fetch_add`. The mutex
//! and condition variable are only touched when a caller actually has to
//! sleep, or when `release` sees that somebody is sleeping.
//!
//! Data written before `release(n)` is visible to whoever acquires those
//! permits. The console ring relies on this to hand bytes between threads
//! without any other synchronization.
//!
//! `release` bumps the count and then looks for sleepers; a sleeper
//! registers and then re-checks the count. Both sides are `SeqCst` so at
//! least one of them sees the other and no wakeup is lost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use minstant::Instant;

use super::{StopSignal, WAIT_SLICE};

/// Returned when a blocking acquire is abandoned because of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug)]
pub struct Permits {
    count: AtomicUsize,
    sleepers: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Permits {
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
            sleepers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Snapshot of the free permit count.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Takes `n` permits if that many are free right now.
    #[must_use]
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            if current < n {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Blocks until `n` permits are taken or `stop` asks the caller to exit.
    ///
    /// Callers must never ask for more permits than can ever exist.
    pub fn acquire(&self, n: usize, stop: &StopSignal) -> Result<(), Cancelled> {
        self.acquire_until(n, None, || stop.is_exit_requested())
            .then_some(())
            .ok_or(Cancelled)
    }

    /// Blocks until `n` permits are taken or `timeout` elapses.
    pub fn acquire_timeout(&self, n: usize, timeout: Duration) -> bool {
        self.acquire_until(n, Some(Instant::now() + timeout), || false)
    }

    /// Waits until at least `n` permits are free without taking them.
    pub fn wait_available(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.sleep_until(Some(deadline), || false, || self.available() >= n)
    }

    /// Returns `n` permits and wakes sleepers if there are any.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.count.fetch_add(n, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            // Taking the lock orders this notify after the sleeper's re-check.
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
        }
    }

    /// Wakes every sleeper so it re-checks its stop condition.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    fn acquire_until(
        &self,
        n: usize,
        deadline: Option<Instant>,
        cancelled: impl Fn() -> bool,
    ) -> bool {
        if self.try_acquire(n) {
            return true;
        }
        let mut acquired = false;
        self.sleep_until(deadline, cancelled, || {
            acquired = self.try_acquire(n);
            acquired
        });
        acquired
    }

    /// Sleeps on the condition variable until `ready` holds, `cancelled`
    /// holds, or `deadline` passes. Returns the last value of `ready`.
    fn sleep_until(
        &self,
        deadline: Option<Instant>,
        cancelled: impl Fn() -> bool,
        mut ready: impl FnMut() -> bool,
    ) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let outcome = loop {
            if ready() {
                break true;
            }
            if cancelled() {
                break false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            guard = self
                .cond
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        outcome
    }
}
