//! Speed regulation for the computation thread.
//!
//! The machine calls [`Throttle::wait`] once per unit of emulated work (one
//! emulated frame, nominally 1/60 s). The throttle either sleeps until the
//! next deadline, or, when the machine is already late, measures how fast
//! it actually ran. Both branches share one reference point, `last_time`.
//!
//! ```text
//! interval      = base_unit * 100 / speed
//! next_deadline = last_time + interval
//!
//! throttled && now < next_deadline:
//!     report speed, last_time = next_deadline, sleep until next_deadline
//! otherwise:
//!     report base_unit * 100 / (now - last_time), last_time = now, yield
//! ```
//!
//! Sleeping to an absolute deadline keeps oversleep from accumulating.
//! A requested speed of zero pauses pacing: the throttle reports 0 once and
//! polls until the speed changes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};

use crate::sync::StopSignal;

/// Pacing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Units of work per second at 100% speed.
    ///
    /// **Default**: 60
    pub ticks_per_second: u32,

    /// How often a paused throttle (speed 0) re-checks the requested speed,
    /// and the longest single sleep before a stop request is noticed.
    ///
    /// **Default**: 10ms
    pub pause_poll: Duration,

    /// Requested speed in percent when the thread is created.
    ///
    /// **Default**: 100
    pub initial_speed: u32,

    /// Whether pacing starts enabled. When disabled the throttle only
    /// measures.
    ///
    /// **Default**: true
    pub enabled: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::new_validated(60, Duration::from_millis(10), 100, true)
    }
}

impl ThrottleConfig {
    /// # Panics
    ///
    /// Panics if `ticks_per_second == 0` or `pause_poll` is zero.
    fn new_validated(
        ticks_per_second: u32,
        pause_poll: Duration,
        initial_speed: u32,
        enabled: bool,
    ) -> Self {
        assert!(ticks_per_second > 0, "ticks_per_second must be > 0");
        assert!(!pause_poll.is_zero(), "pause_poll must be non-zero");
        Self {
            ticks_per_second,
            pause_poll,
            initial_speed,
            enabled,
        }
    }

    /// Real-time pacing at 60 ticks per second.
    #[must_use]
    pub fn realtime() -> Self {
        Self::default()
    }

    /// Runs as fast as possible and only measures.
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::new_validated(60, Duration::from_millis(10), 100, false)
    }

    /// Starts paused at speed 0.
    #[must_use]
    pub fn paused() -> Self {
        Self::new_validated(60, Duration::from_millis(10), 0, true)
    }

    #[must_use]
    pub const fn with_initial_speed(mut self, percent: u32) -> Self {
        self.initial_speed = percent;
        self
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// # Panics
    ///
    /// Panics if `ticks` is zero.
    #[must_use]
    pub fn with_ticks_per_second(mut self, ticks: u32) -> Self {
        assert!(ticks > 0, "ticks_per_second must be > 0");
        self.ticks_per_second = ticks;
        self
    }

    /// Real time taken by one unit of work at 100% speed.
    #[must_use]
    pub fn base_unit(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.ticks_per_second.max(1)))
    }
}

/// Speed settings written by the controller and read by the computation
/// thread, plus the last speed published back.
#[derive(Debug)]
pub struct SpeedControl {
    requested: AtomicU32,
    throttled: AtomicBool,
    actual: AtomicU32,
}

impl SpeedControl {
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            requested: AtomicU32::new(config.initial_speed),
            throttled: AtomicBool::new(config.enabled),
            actual: AtomicU32::new(config.initial_speed),
        }
    }

    pub fn set_requested(&self, percent: u32) {
        self.requested.store(percent, Ordering::Release);
    }

    #[must_use]
    pub fn requested(&self) -> u32 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn set_throttled(&self, enabled: bool) {
        self.throttled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn actual(&self) -> u32 {
        self.actual.load(Ordering::Acquire)
    }

    /// Records a measured speed. Returns `true` if it differs from the last
    /// one recorded.
    pub fn publish_actual(&self, percent: u32) -> bool {
        self.actual.swap(percent, Ordering::AcqRel) != percent
    }
}

/// What one throttle step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Requested speed is zero.
    Paused,
    /// Ahead of schedule: sleep until `until`, running at the requested speed.
    Sleep { until: Instant, speed: u32 },
    /// Behind schedule or unthrottled. `measured` is `None` when no time has
    /// passed since the reference point.
    Behind { measured: Option<u32> },
}

/// Pacing state, owned by the computation thread.
#[derive(Debug)]
pub struct Throttle {
    base_unit: Duration,
    pause_poll: Duration,
    last_time: Instant,
}

impl Throttle {
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            base_unit: config.base_unit(),
            pause_poll: config.pause_poll,
            last_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn base_unit(&self) -> Duration {
        self.base_unit
    }

    /// Real time one unit of work should take at `speed` percent.
    ///
    /// `speed` must be non-zero.
    #[must_use]
    pub fn interval(&self, speed: u32) -> Duration {
        let nanos = self.base_unit.as_nanos() * 100 / u128::from(speed.max(1));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Speed in percent implied by one unit of work taking `elapsed`.
    #[must_use]
    pub fn percent_for(&self, elapsed: Duration) -> u32 {
        let unit = self.base_unit.as_nanos() * 100;
        u32::try_from(unit / elapsed.as_nanos().max(1)).unwrap_or(u32::MAX)
    }

    /// Moves the reference point to `now`.
    pub fn rebase(&mut self, now: Instant) {
        self.last_time = now;
    }

    /// Moves the reference point forward so that `by` is not counted as
    /// emulation time.
    pub fn shift(&mut self, by: Duration) {
        self.last_time = self.last_time + by;
    }

    /// Decides the next pacing action at time `now` and updates the
    /// reference point.
    pub fn step(&mut self, now: Instant, speed: u32, throttled: bool) -> Pace {
        if speed == 0 {
            return Pace::Paused;
        }
        let next = self.last_time + self.interval(speed);
        if throttled && now < next {
            self.last_time = next;
            return Pace::Sleep { until: next, speed };
        }
        if now <= self.last_time {
            return Pace::Behind { measured: None };
        }
        let measured = self.percent_for(now - self.last_time);
        self.last_time = now;
        Pace::Behind {
            measured: Some(measured),
        }
    }

    /// Paces one unit of work.
    ///
    /// `report` receives every speed observation; the caller filters
    /// duplicates. Returns early, without sleeping the full interval, once
    /// `stop` requests an exit.
    pub fn wait(&mut self, control: &SpeedControl, stop: &StopSignal, mut report: impl FnMut(u32)) {
        let speed = control.requested();
        match self.step(Instant::now(), speed, control.is_throttled()) {
            Pace::Paused => {
                report(0);
                while control.requested() == 0 && !stop.is_exit_requested() {
                    thread::sleep(self.pause_poll);
                }
                self.rebase(Instant::now());
            }
            Pace::Sleep { until, speed } => {
                report(speed);
                self.sleep_until(until, stop);
            }
            Pace::Behind { measured } => {
                if let Some(measured) = measured {
                    report(measured);
                }
                thread::yield_now();
            }
        }
    }

    fn sleep_until(&self, until: Instant, stop: &StopSignal) {
        loop {
            let now = Instant::now();
            if now >= until || stop.is_exit_requested() {
                return;
            }
            thread::sleep((until - now).min(self.pause_poll));
        }
    }
}
