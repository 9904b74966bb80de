//! Scripted machine shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use emu_thread::{
    CollaboratorError, DebugReason, EmuContext, LoadSource, LoadStatus, Machine, SaveKind,
    SendLocation, TransferStatus,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        emu_thread::init_tracing();
    });
}

/// How the run loop behaves.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Checkpoints and paces until asked to exit.
    Cooperative,
    /// Like `Cooperative` but never looks at `should_exit`.
    IgnoresStop,
    /// Spins without touching the context until the flag is set.
    Stuck(Arc<AtomicBool>),
    /// Returns straight away.
    ReturnsImmediately,
    /// Reports power off, then behaves like `Cooperative`.
    PoweredOff,
    /// Runs a few iterations, then panics.
    Panics,
}

/// Handles the test keeps after the machine moves into the thread.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub iterations: Arc<AtomicU64>,
}

impl Tally {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Polls until `name` was called or `timeout` passes.
    pub fn wait_for_call(&self, name: &str, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.calls().iter().any(|c| c == name) {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Polls until the run loop completed at least `n` more iterations.
    pub fn wait_for_progress(&self, n: u64, timeout: Duration) -> bool {
        let target = self.iterations() + n;
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.iterations() >= target {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

pub struct TestMachine {
    mode: Mode,
    tally: Tally,
    debugging: bool,
    load_status: LoadStatus,
}

impl TestMachine {
    pub fn new(mode: Mode) -> (Self, Tally) {
        let tally = Tally::default();
        let machine = Self {
            mode,
            tally: tally.clone(),
            debugging: false,
            load_status: LoadStatus::Okay,
        };
        (machine, tally)
    }

    pub fn with_load_status(mut self, status: LoadStatus) -> Self {
        self.load_status = status;
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.tally.calls.lock().unwrap().push(call.into());
    }

    fn tick(&mut self, ctx: &EmuContext) {
        ctx.checkpoint(self);
        ctx.throttle_wait();
        self.tally.iterations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Machine for TestMachine {
    fn run(&mut self, ctx: &EmuContext) {
        match self.mode.clone() {
            Mode::Cooperative => {
                while !ctx.should_exit() {
                    self.tick(ctx);
                }
            }
            Mode::IgnoresStop => loop {
                self.tick(ctx);
            },
            Mode::Stuck(release) => {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Mode::ReturnsImmediately => {}
            Mode::PoweredOff => {
                ctx.set_powered(false);
                while !ctx.should_exit() {
                    self.tick(ctx);
                }
            }
            Mode::Panics => {
                for _ in 0..3 {
                    self.tick(ctx);
                }
                panic!("illegal opcode");
            }
        }
    }

    fn reset(&mut self) {
        self.record("reset");
    }

    fn save(&mut self, kind: SaveKind, path: &Path) -> Result<(), CollaboratorError> {
        self.record(format!("save {kind:?} {}", path.display()));
        if path.to_string_lossy().contains("fail") {
            return Err(CollaboratorError::Failed("disk full".into()));
        }
        Ok(())
    }

    fn load(&mut self, source: &LoadSource) -> LoadStatus {
        self.record(format!("load {}", source.path().display()));
        self.load_status
    }

    fn send_variable(&mut self, name: &str, location: SendLocation) -> TransferStatus {
        self.record(format!("send {name} {location:?}"));
        if name.starts_with("bad") {
            TransferStatus::Error
        } else if name.starts_with("odd") {
            TransferStatus::Warn
        } else {
            TransferStatus::Good
        }
    }

    fn open_debugger(&mut self, ctx: &EmuContext, reason: DebugReason, addr: u32) {
        self.record(format!("open_debugger {reason:?} {addr}"));
        self.debugging = true;
        ctx.debugger_entered(true);
        while self.debugging && !ctx.should_exit() {
            ctx.checkpoint(self);
            ctx.sleep(Duration::from_millis(1));
        }
        ctx.debugger_entered(false);
    }

    fn close_debugger(&mut self) {
        self.record("close_debugger");
        self.debugging = false;
    }

    fn clear_temp_breakpoints(&mut self) {
        self.record("clear_temp_breakpoints");
    }
}
