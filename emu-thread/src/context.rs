//! The computation thread's view of the core.
//!
//! An [`EmuContext`] is created on the computation thread when it starts and
//! handed to [`Machine::run`] by reference. It is not `Sync`, so every call
//! below is confined to that thread.
//!
//! Once the controller escalates a stop to forced termination, every call
//! on the context unwinds out of the machine's run loop. The unwind is
//! caught at the top of the thread; whatever the machine was holding is
//! abandoned.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::command::Dispatcher;
use crate::console::{ConsoleStream, ConsoleWriter};
use crate::error::ConsoleError;
use crate::event::{EmuEvent, EventSender};
use crate::gate::ReceiveGate;
use crate::machine::{DebugReason, Machine};
use crate::sync::StopSignal;
use crate::throttle::{SpeedControl, Throttle};
use crate::trace::{debug, trace};

/// State shared between the controller handle and the computation thread.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) stop: Arc<StopSignal>,
    pub(crate) speed: SpeedControl,
    pub(crate) gate: Arc<ReceiveGate>,
    pub(crate) in_debugger: AtomicBool,
}

/// Unwind payload used to pull a terminated thread out of its machine.
pub(crate) struct Terminated;

/// Thread-confined pieces that travel back to the controller when the
/// thread exits, so a later run continues where this one stopped.
pub(crate) struct Parts {
    pub(crate) console: ConsoleWriter,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) throttle: Throttle,
}

pub struct EmuContext {
    shared: Arc<Shared>,
    events: EventSender,
    console: RefCell<ConsoleWriter>,
    dispatcher: RefCell<Dispatcher>,
    throttle: RefCell<Throttle>,
    powered: Cell<bool>,
    /// Checkpoint nesting (the debugger checkpoints from inside one).
    depth: Cell<u32>,
}

impl EmuContext {
    pub(crate) fn new(shared: Arc<Shared>, events: EventSender, parts: Parts) -> Self {
        Self {
            shared,
            events,
            console: RefCell::new(parts.console),
            dispatcher: RefCell::new(parts.dispatcher),
            throttle: RefCell::new(parts.throttle),
            powered: Cell::new(true),
            depth: Cell::new(0),
        }
    }

    pub(crate) fn into_parts(self) -> Parts {
        Parts {
            console: self.console.into_inner(),
            dispatcher: self.dispatcher.into_inner(),
            throttle: self.throttle.into_inner(),
        }
    }

    /// `true` once the controller asked the thread to stop. The machine's
    /// run loop must return promptly after this turns true.
    #[inline]
    #[must_use]
    pub fn should_exit(&self) -> bool {
        self.shared.stop.is_exit_requested()
    }

    #[inline]
    fn bail_if_terminated(&self) {
        if self.shared.stop.is_terminated() {
            trace!("unwinding terminated computation thread");
            panic::resume_unwind(Box::new(Terminated));
        }
    }

    /// Sleeps the computation thread.
    pub fn sleep(&self, duration: Duration) {
        self.bail_if_terminated();
        thread::sleep(duration);
    }

    /// Applies every pending controller request.
    ///
    /// Call it where the machine's state is consistent for outside mutation.
    /// It may block in the receive rendezvous and may re-enter the machine
    /// (`open_debugger`), which in turn may call `checkpoint` again.
    ///
    /// Time spent here is not counted against the throttle.
    pub fn checkpoint<M: Machine + ?Sized>(&self, machine: &mut M) {
        self.bail_if_terminated();
        let started = Instant::now();

        // Collect first so the dispatcher is not borrowed while the machine
        // runs; `open_debugger` re-enters here.
        let pending = self.dispatcher.borrow_mut().collect();
        if pending.is_empty() {
            return;
        }
        self.depth.set(self.depth.get() + 1);
        pending.apply(machine, self);
        self.depth.set(self.depth.get() - 1);

        if self.depth.get() == 0 {
            self.throttle.borrow_mut().shift(started.elapsed());
        }
        self.bail_if_terminated();
    }

    /// Formats and enqueues console text. Blocks while the console ring is
    /// full.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWriter::write`]. Also [`ConsoleError::Reentrant`] when
    /// called from inside a `Display` impl that is being formatted for the
    /// console.
    pub fn console(
        &self,
        stream: ConsoleStream,
        args: fmt::Arguments<'_>,
    ) -> Result<usize, ConsoleError> {
        self.bail_if_terminated();
        let mut console = self
            .console
            .try_borrow_mut()
            .map_err(|_| ConsoleError::Reentrant)?;
        let result = console.write(stream, args);
        drop(console);
        self.bail_if_terminated();
        result
    }

    /// Paces one unit of emulated work and publishes speed changes.
    pub fn throttle_wait(&self) {
        self.bail_if_terminated();
        let mut throttle = self.throttle.borrow_mut();
        throttle.wait(&self.shared.speed, &self.shared.stop, |percent| {
            self.publish_speed(percent);
        });
        drop(throttle);
        self.bail_if_terminated();
    }

    fn publish_speed(&self, percent: u32) {
        if self.powered.get() && self.shared.speed.publish_actual(percent) {
            self.emit(EmuEvent::ActualSpeedChanged(percent));
        }
    }

    /// While the machine is powered off, speed changes are not published.
    pub fn set_powered(&self, on: bool) {
        self.powered.set(on);
    }

    /// Asks the controller to act on a debugger event.
    pub fn debug_command(&self, reason: DebugReason, addr: u32) {
        self.bail_if_terminated();
        self.emit(EmuEvent::DebugCommand { reason, addr });
    }

    /// Reports that the machine's debugger was entered (`true`) or left.
    pub fn debugger_entered(&self, entered: bool) {
        self.bail_if_terminated();
        let was = self.shared.in_debugger.swap(entered, Ordering::AcqRel);
        if was == entered {
            return;
        }
        debug!(entered, "debugger state changed");
        self.emit(if entered {
            EmuEvent::DebuggerRaised
        } else {
            EmuEvent::DebuggerDisabled
        });
    }

    #[must_use]
    pub fn in_debugger(&self) -> bool {
        self.shared.in_debugger.load(Ordering::Acquire)
    }

    /// Requested speed in percent.
    #[must_use]
    pub fn speed(&self) -> u32 {
        self.shared.speed.requested()
    }

    pub(crate) fn emit(&self, event: EmuEvent) {
        self.events.emit(event);
    }

    pub(crate) fn receive_gate(&self) -> &ReceiveGate {
        &self.shared.gate
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.shared.stop
    }
}

/// Writes formatted text to the normal console.
///
/// ```ignore
/// console_print!(ctx, "PC={:06X}\n", pc)?;
/// ```
#[macro_export]
macro_rules! console_print {
    ($ctx:expr, $($arg:tt)*) => {
        $ctx.console($crate::ConsoleStream::Normal, format_args!($($arg)*))
    };
}

/// Writes formatted text to the error console.
#[macro_export]
macro_rules! console_eprint {
    ($ctx:expr, $($arg:tt)*) => {
        $ctx.console($crate::ConsoleStream::Error, format_args!($($arg)*))
    };
}
