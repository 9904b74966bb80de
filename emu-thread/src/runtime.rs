//! Controller-side runtime: configuration, thread placement and the
//! lifecycle of the computation thread.
//!
//! - `config`: [`EmuThreadConfig`] and the forced-stop policy
//! - `topology`: optional CPU pinning of the computation thread
//! - `thread`: the [`EmuThread`] controller handle

pub mod config;
pub mod thread;
pub mod topology;

pub use config::{EmuThreadConfig, ForcedStopPolicy};
pub use thread::{EmuThread, ThreadState};
