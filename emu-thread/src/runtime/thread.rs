//! The controller's handle on the computation thread.
//!
//! # Lifecycle
//!
//! ```text
//!            start                 stop (cooperative, ≤ stop_timeout)
//!   Idle ───────────> Running ───────────> Stopping ─────────────> Stopped
//!    ^                                        │                       │
//!    │ load ok                                │ forced (≤ terminate_timeout)
//!    │                                        v                       │
//!    └──────────────────────────── ForciblyTerminated                 │
//!                                                                     │
//!   Stopped ── start ──> Running   <──────────────────────────────────┘
//! ```
//!
//! A stop first asks the machine to leave its run loop
//! ([`EmuContext::should_exit`](crate::EmuContext::should_exit)) and wakes
//! every wait inside the core. If the thread has not exited after
//! `stop_timeout`, the stop escalates: every later core call unwinds out of
//! the machine. If even that does not end the thread within
//! `terminate_timeout`, the [`ForcedStopPolicy`] decides between abandoning
//! the thread (and the machine with it) and aborting the process.
//!
//! The machine travels into the thread on start and back out on a
//! successful join, so `load` always runs on the controller thread against
//! a machine nobody else is touching.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use minstant::Instant;
use serde::{Deserialize, Serialize};

use crate::command::{self, Command, CommandSender, SaveKind, SendLocation};
use crate::console::{self, ConsoleReader};
use crate::context::{EmuContext, Parts, Shared, Terminated};
use crate::error::{CommandError, LifecycleError};
use crate::event::{self, EmuEvent, EventReceiver, EventSender};
use crate::gate::ReceiveGate;
use crate::machine::{LoadSource, LoadStatus, Machine};
use crate::sync::latch::{Latch, SetOnDrop};
use crate::sync::StopSignal;
use crate::throttle::{SpeedControl, Throttle};
use crate::trace::{debug, error, info, warn};

use super::config::{EmuThreadConfig, ForcedStopPolicy};
use super::topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Created or freshly loaded; never started since.
    Idle,
    Running,
    /// A stop is in progress.
    Stopping,
    Stopped,
    /// The last run was ended by force. Load a new session before starting.
    ForciblyTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    Returned,
    Terminated,
    Panicked,
}

struct Exit<M> {
    machine: M,
    parts: Parts,
    kind: ExitKind,
}

struct Worker<M> {
    handle: JoinHandle<Option<Exit<M>>>,
    exited: Arc<Latch>,
}

/// Controller handle. Lives on the controller thread.
pub struct EmuThread<M: Machine> {
    config: EmuThreadConfig,
    shared: Arc<Shared>,
    events: EventSender,
    commands: CommandSender,
    state: ThreadState,
    machine: Option<M>,
    parts: Option<Parts>,
    worker: Option<Worker<M>>,
}

impl<M: Machine> EmuThread<M> {
    /// Wraps `machine` without starting it.
    ///
    /// Returns the handle, the receiving end of the event stream, and the
    /// consumer half of the console ring.
    #[must_use]
    pub fn new(machine: M, config: EmuThreadConfig) -> (Self, EventReceiver, ConsoleReader) {
        let (events, receiver) = event::channel();
        let stop = Arc::new(StopSignal::new());
        let gate = Arc::new(ReceiveGate::new());

        let (writer, reader) =
            console::channel(config.console_capacity, events.clone(), Arc::clone(&stop));
        let (commands, dispatcher) = command::channel(config.command_capacity, Arc::clone(&gate));

        let shared = Arc::new(Shared {
            stop,
            speed: SpeedControl::new(&config.throttle),
            gate,
            in_debugger: AtomicBool::new(false),
        });
        let parts = Parts {
            console: writer,
            dispatcher,
            throttle: Throttle::new(&config.throttle),
        };

        let handle = Self {
            config,
            shared,
            events,
            commands,
            state: ThreadState::Idle,
            machine: Some(machine),
            parts: Some(parts),
            worker: None,
        };
        (handle, receiver, reader)
    }

    /// Current lifecycle state. A thread whose run loop returned on its own
    /// reads as `Stopped` before it is joined.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        match (&self.worker, self.state) {
            (Some(worker), ThreadState::Running) if worker.exited.is_set() => ThreadState::Stopped,
            (_, state) => state,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    #[must_use]
    pub fn config(&self) -> &EmuThreadConfig {
        &self.config
    }

    /// Spawns the computation thread and runs the machine on it.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::AlreadyRunning`] unless the state is `Idle` or
    ///   `Stopped`
    /// - [`LifecycleError::Terminated`] after a forced stop, until a
    ///   successful `load`
    /// - [`LifecycleError::MachineLost`] if the machine was abandoned
    /// - [`LifecycleError::Spawn`] if the OS refused the thread; the machine
    ///   is kept and `start` may be retried
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.worker.as_ref().is_some_and(|w| w.exited.is_set()) {
            self.stop();
        }
        match self.state {
            ThreadState::Idle | ThreadState::Stopped => {}
            ThreadState::Running | ThreadState::Stopping => {
                return Err(LifecycleError::AlreadyRunning);
            }
            ThreadState::ForciblyTerminated => return Err(LifecycleError::Terminated),
        }
        let (Some(machine), Some(parts)) = (self.machine.take(), self.parts.take()) else {
            return Err(LifecycleError::MachineLost);
        };

        self.shared.stop.reset();
        self.shared.in_debugger.store(false, Ordering::Release);

        let exited = Arc::new(Latch::new());
        let slot = Arc::new(Mutex::new(Some((machine, parts))));
        let body = {
            let slot = Arc::clone(&slot);
            let exited = Arc::clone(&exited);
            let shared = Arc::clone(&self.shared);
            let events = self.events.clone();
            let core = self.config.core;
            move || {
                let _exited = SetOnDrop(&exited);
                let (machine, parts) = slot.lock().unwrap_or_else(PoisonError::into_inner).take()?;
                Some(run_machine(machine, parts, shared, events, core))
            }
        };

        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(body);
        match spawned {
            Ok(handle) => {
                info!(thread = %self.config.thread_name, "computation thread spawned");
                self.worker = Some(Worker { handle, exited });
                self.state = ThreadState::Running;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to spawn computation thread");
                if let Some((machine, parts)) =
                    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
                {
                    self.machine = Some(machine);
                    self.parts = Some(parts);
                }
                Err(LifecycleError::Spawn(e))
            }
        }
    }

    /// Stops the computation thread, escalating as described in the module
    /// docs.
    ///
    /// Returns `true` if no thread is running afterwards. `false` means the
    /// thread survived forced termination and was abandoned.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        debug!("stopping computation thread");
        self.state = ThreadState::Stopping;
        self.shared.stop.request_exit();
        self.shared.gate.interrupt();

        let started = Instant::now();
        if !worker.exited.wait_timeout(self.config.stop_timeout) {
            warn!(
                timeout_ms = self.config.stop_timeout.as_millis() as u64,
                "cooperative stop timed out, forcing termination"
            );
            self.shared.stop.terminate();
            self.shared.gate.interrupt();

            if !worker.exited.wait_timeout(self.config.terminate_timeout) {
                return self.abandon(worker);
            }
        }

        self.reap(worker);
        info!(
            elapsed_us = started.elapsed().as_micros() as u64,
            state = ?self.state,
            "computation thread stopped"
        );
        true
    }

    fn abandon(&mut self, worker: Worker<M>) -> bool {
        match self.config.forced_stop {
            ForcedStopPolicy::Abort => {
                error!("computation thread survived forced termination, aborting");
                std::process::abort();
            }
            ForcedStopPolicy::Abandon => {
                error!("computation thread survived forced termination, abandoning it");
                // Dropping the handle detaches the thread; its machine is leaked.
                drop(worker);
                self.state = ThreadState::ForciblyTerminated;
                false
            }
        }
    }

    fn reap(&mut self, worker: Worker<M>) {
        self.shared.in_debugger.store(false, Ordering::Release);
        match worker.handle.join() {
            Ok(Some(exit)) => {
                self.machine = Some(exit.machine);
                self.parts = Some(exit.parts);
                self.state = match exit.kind {
                    ExitKind::Terminated => ThreadState::ForciblyTerminated,
                    ExitKind::Returned | ExitKind::Panicked => ThreadState::Stopped,
                };
            }
            Ok(None) | Err(_) => {
                error!("computation thread ended without handing back its machine");
                self.state = ThreadState::Stopped;
            }
        }
    }

    /// Stops any running thread, then loads a ROM or restores an image on
    /// the controller thread.
    ///
    /// A successful load returns the handle to `Idle`, including after a
    /// forced stop.
    pub fn load(&mut self, source: &LoadSource) -> LoadStatus {
        if !self.stop() {
            warn!("load refused: computation thread could not be stopped");
            return LoadStatus::Fail;
        }
        let Some(machine) = self.machine.as_mut() else {
            warn!("load refused: machine was lost");
            return LoadStatus::Fail;
        };
        let status = machine.load(source);
        info!(path = %source.path().display(), ?status, "load finished");
        if status == LoadStatus::Okay && self.parts.is_some() {
            self.state = ThreadState::Idle;
        }
        status
    }

    /// The machine, while no thread is running it.
    #[must_use]
    pub fn machine(&self) -> Option<&M> {
        self.machine.as_ref()
    }

    pub fn machine_mut(&mut self) -> Option<&mut M> {
        self.machine.as_mut()
    }

    /// # Errors
    ///
    /// [`CommandError::QueueFull`].
    pub fn request_reset(&self) -> Result<(), CommandError> {
        self.commands.send(Command::Reset)
    }

    /// Sets the target speed in percent of real time. Zero pauses pacing.
    pub fn set_speed(&self, percent: u32) {
        debug!(percent, "speed requested");
        self.shared.speed.set_requested(percent);
    }

    #[must_use]
    pub fn speed(&self) -> u32 {
        self.shared.speed.requested()
    }

    pub fn set_throttle_enabled(&self, enabled: bool) {
        self.shared.speed.set_throttled(enabled);
    }

    #[must_use]
    pub fn throttle_enabled(&self) -> bool {
        self.shared.speed.is_throttled()
    }

    /// Last speed published by the throttle.
    #[must_use]
    pub fn actual_speed(&self) -> u32 {
        self.shared.speed.actual()
    }

    /// Asks to enter (`true`) or leave the debugger.
    ///
    /// Leaving also cancels an enter request that has not been applied yet.
    /// Either is a no-op if the machine is already in the requested state.
    ///
    /// # Errors
    ///
    /// [`CommandError::QueueFull`].
    pub fn request_debug(&self, entering: bool) -> Result<(), CommandError> {
        self.commands.send(if entering {
            Command::EnterDebugger
        } else {
            Command::LeaveDebugger
        })
    }

    #[must_use]
    pub fn in_debugger(&self) -> bool {
        self.shared.in_debugger.load(Ordering::Acquire)
    }

    /// Queues a batch of files for transfer, sent in the given order.
    ///
    /// # Errors
    ///
    /// [`CommandError::QueueFull`].
    pub fn request_send<I, S>(&self, items: I, location: SendLocation) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.commands.send(Command::Send { items, location })
    }

    /// Asks the computation thread to park at the receive gate at its next
    /// checkpoint. Wait for [`EmuEvent::ReceiveReady`], prepare, then call
    /// [`signal_receive_ready`](Self::signal_receive_ready).
    ///
    /// # Errors
    ///
    /// [`CommandError::QueueFull`].
    pub fn request_receive(&self) -> Result<(), CommandError> {
        self.commands.request_receive()
    }

    /// Releases the computation thread from the receive gate. Returns
    /// `false`, doing nothing, if no receive is in progress.
    pub fn signal_receive_ready(&self) -> bool {
        self.shared.gate.signal()
    }

    /// # Errors
    ///
    /// [`CommandError::QueueFull`].
    pub fn request_save(
        &self,
        kind: SaveKind,
        path: impl Into<PathBuf>,
    ) -> Result<(), CommandError> {
        self.commands.send(Command::Save {
            kind,
            path: path.into(),
        })
    }
}

impl<M: Machine> Drop for EmuThread<M> {
    fn drop(&mut self) {
        // Ask the thread to leave but don't wait for it; `stop` is the
        // bounded, joining shutdown.
        if self.worker.is_some() {
            self.shared.stop.request_exit();
            self.shared.gate.interrupt();
        }
    }
}

/// Body of the computation thread.
fn run_machine<M: Machine>(
    mut machine: M,
    mut parts: Parts,
    shared: Arc<Shared>,
    events: EventSender,
    core: Option<usize>,
) -> Exit<M> {
    if let Some(core) = core {
        topology::pin_to_core(core);
    }
    parts.throttle.rebase(Instant::now());
    info!("computation thread started");

    let ctx = EmuContext::new(shared, events.clone(), parts);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| machine.run(&ctx)));
    let parts = ctx.into_parts();

    let kind = match outcome {
        Ok(()) => {
            events.emit(EmuEvent::Stopped);
            ExitKind::Returned
        }
        Err(payload) if payload.is::<Terminated>() => {
            warn!("computation thread terminated by force");
            ExitKind::Terminated
        }
        Err(_) => {
            error!("machine panicked");
            events.emit(EmuEvent::Stopped);
            ExitKind::Panicked
        }
    };
    info!(?kind, "computation thread exiting");
    Exit { machine, parts, kind }
}
