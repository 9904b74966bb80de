//! One-shot rendezvous for the receive flow.
//!
//! The controller arms the gate when it asks for a receive. At its next
//! checkpoint the computation thread announces `ReceiveReady` and parks in
//! [`ReceiveGate::wait`]. The controller prepares the data and calls
//! [`ReceiveGate::signal`], which wakes it.
//!
//! The state lives under the same mutex as the condition variable, so a
//! signal that lands before the computation thread starts waiting is kept
//! and consumed by the next wait. Signalling a gate that is not armed does
//! nothing.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::sync::{StopSignal, WAIT_SLICE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Armed,
    Signaled,
}

/// How a [`ReceiveGate::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The controller signalled; the cycle is complete.
    Signaled,
    /// A stop request arrived first; the cycle was abandoned.
    Cancelled,
    /// Nothing was armed, so there was nothing to wait for.
    NotArmed,
}

#[derive(Debug)]
pub struct ReceiveGate {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for ReceiveGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a receive cycle. Returns `false` if one is already in progress.
    pub fn arm(&self) -> bool {
        let mut state = self.lock();
        if *state == State::Idle {
            *state = State::Armed;
            true
        } else {
            false
        }
    }

    /// Releases the computation thread. Returns `false` (and does nothing)
    /// if no cycle is armed or it was already signalled.
    pub fn signal(&self) -> bool {
        let mut state = self.lock();
        if *state != State::Armed {
            return false;
        }
        *state = State::Signaled;
        self.cond.notify_all();
        true
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        *self.lock() != State::Idle
    }

    /// Parks until the armed cycle is signalled or `stop` requests an exit.
    pub fn wait(&self, stop: &StopSignal) -> GateOutcome {
        let mut state = self.lock();
        loop {
            match *state {
                State::Idle => return GateOutcome::NotArmed,
                State::Signaled => {
                    *state = State::Idle;
                    return GateOutcome::Signaled;
                }
                State::Armed if stop.is_exit_requested() => {
                    *state = State::Idle;
                    return GateOutcome::Cancelled;
                }
                State::Armed => {
                    state = self
                        .cond
                        .wait_timeout(state, WAIT_SLICE)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Wakes a parked waiter so it re-checks its stop condition.
    pub fn interrupt(&self) {
        let _state = self.lock();
        self.cond.notify_all();
    }

    /// Drops any armed or signalled cycle.
    pub fn reset(&self) {
        *self.lock() = State::Idle;
        self.cond.notify_all();
    }
}
