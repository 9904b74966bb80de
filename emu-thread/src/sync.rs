//! Synchronization primitives shared by the computation and controller threads.
//!
//! - [`permits`]: counting permits backing the console ring
//! - [`latch`]: one-shot completion latch used for bounded joins
//! - [`spsc`]: bounded lock-free queue carrying controller commands
//! - [`stop`]: cooperative and forced stop flags

pub mod latch;
pub mod permits;
pub mod spsc;
pub mod stop;

pub use latch::Latch;
pub use permits::Permits;
pub use stop::StopSignal;

use std::time::Duration;

/// Upper bound on a single condition-variable sleep inside the blocking
/// primitives. Stop flags are re-checked at least this often.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(5);
