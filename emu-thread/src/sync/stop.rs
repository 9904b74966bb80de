//! Stop flags shared between the controller and the computation thread.

use std::sync::atomic::{AtomicBool, Ordering};

/// Two-stage stop request.
///
/// The first stage (`request_exit`) is cooperative: the machine is expected
/// to notice [`is_exit_requested`](Self::is_exit_requested) at its next loop
/// check and return. The second stage (`terminate`) makes every core call on
/// the computation thread unwind out of the machine.
#[derive(Debug, Default)]
pub struct StopSignal {
    exit_requested: AtomicBool,
    terminated: AtomicBool,
}

impl StopSignal {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exit_requested: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Escalates to forced termination. Implies an exit request.
    pub fn terminate(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.terminated.store(true, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Clears both stages before a new run.
    pub fn reset(&self) {
        self.terminated.store(false, Ordering::Release);
        self.exit_requested.store(false, Ordering::Release);
    }
}
