//! Configuration for the computation thread and its coordination layer.
//!
//! # Tuning Guidelines
//!
//! - **Chatty machines** (tracing to the console every instruction): raise
//!   `console_capacity` so the controller can drain in larger batches
//!   before backpressure stalls emulation.
//! - **Slow collaborators** (save to network storage): raise
//!   `stop_timeout`, since a stop waits for the current checkpoint to end.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::COMMAND_QUEUE_CAPACITY;
use crate::console::DEFAULT_CONSOLE_CAPACITY;
use crate::throttle::ThrottleConfig;

/// What to do when a computation thread survives forced termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcedStopPolicy {
    /// Detach the thread and report failure. The machine and anything it
    /// holds are leaked.
    Abandon,
    /// Abort the process.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmuThreadConfig {
    /// Size of the console byte ring.
    ///
    /// **Default**: 4096 bytes
    pub console_capacity: usize,

    /// Depth of the controller → computation command queue.
    ///
    /// **Default**: 64 commands
    pub command_capacity: usize,

    /// How long `stop` waits for a cooperative exit before forcing.
    ///
    /// **Default**: 200ms
    pub stop_timeout: Duration,

    /// How long `stop` waits after forcing before giving up.
    ///
    /// **Default**: 200ms
    pub terminate_timeout: Duration,

    /// **Default**: [`ForcedStopPolicy::Abandon`]
    pub forced_stop: ForcedStopPolicy,

    /// Name of the computation thread.
    ///
    /// **Default**: `"emu"`
    pub thread_name: String,

    /// Core to pin the computation thread to, if any.
    ///
    /// **Default**: `None`
    pub core: Option<usize>,

    pub throttle: ThrottleConfig,
}

impl Default for EmuThreadConfig {
    fn default() -> Self {
        Self::new_validated(
            DEFAULT_CONSOLE_CAPACITY,
            COMMAND_QUEUE_CAPACITY,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }
}

impl EmuThreadConfig {
    /// # Panics
    ///
    /// Panics if either capacity is zero.
    fn new_validated(
        console_capacity: usize,
        command_capacity: usize,
        stop_timeout: Duration,
        terminate_timeout: Duration,
    ) -> Self {
        assert!(console_capacity > 0, "console_capacity must be > 0");
        assert!(command_capacity > 0, "command_capacity must be > 0");
        Self {
            console_capacity,
            command_capacity,
            stop_timeout,
            terminate_timeout,
            forced_stop: ForcedStopPolicy::Abandon,
            thread_name: "emu".into(),
            core: None,
            throttle: ThrottleConfig::default(),
        }
    }

    /// # Panics
    ///
    /// Panics if `bytes` is zero.
    #[must_use]
    pub fn with_console_capacity(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "console_capacity must be > 0");
        self.console_capacity = bytes;
        self
    }

    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_forced_stop(mut self, policy: ForcedStopPolicy) -> Self {
        self.forced_stop = policy;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }
}
