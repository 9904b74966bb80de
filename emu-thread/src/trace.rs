//! Logging for the coordination layer.
//!
//! Built on `tracing` when the `tracing` feature is enabled. Without it every
//! macro below expands to nothing, so the computation thread pays nothing for
//! log statements in its hot loop.

/// Installs a global subscriber that prints thread names and uptime.
///
/// The filter is read from `RUST_LOG` and falls back to `emu_thread=trace`.
/// Calling it twice panics inside `tracing-subscriber`, so tests go through
/// a `std::sync::Once`.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("emu_thread=trace"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
