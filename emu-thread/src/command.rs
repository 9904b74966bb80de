//! Controller requests and the checkpoint that applies them.
//!
//! The controller pushes [`Command`]s into a bounded SPSC queue. Pushing a
//! command publishes its payload (file list, save path) before the
//! computation thread can observe it, and the payload is never touched by
//! the controller again.
//!
//! At each checkpoint the computation thread drains the queue into a set of
//! sticky flags ([`Pending`]) and then acts on them in a fixed order:
//!
//! 1. reset
//! 2. saves, in request order
//! 3. send batches, in request order
//! 4. receive rendezvous
//! 5. leave debugger (only when inside it)
//! 6. enter debugger (only when outside it)

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::EmuContext;
use crate::error::CommandError;
use crate::event::EmuEvent;
use crate::gate::{GateOutcome, ReceiveGate};
use crate::machine::{DebugReason, Machine, TransferStatus};
use crate::sync::spsc::{self, Consumer, Producer};
use crate::trace::{debug, trace, warn};

/// Default depth of the command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// What a save writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveKind {
    /// Full machine state, restorable with `LoadSource::Image`.
    Image,
    /// The ROM contents only.
    Rom,
}

/// Where transferred files end up on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendLocation {
    Ram,
    Archive,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Reset,
    Save { kind: SaveKind, path: PathBuf },
    Send { items: Vec<String>, location: SendLocation },
    Receive,
    EnterDebugger,
    LeaveDebugger,
}

/// Creates the controller and computation ends of the command path.
#[must_use]
pub fn channel(capacity: usize, gate: Arc<ReceiveGate>) -> (CommandSender, Dispatcher) {
    let (queue, commands) = spsc::channel(capacity);
    (CommandSender { queue, gate }, Dispatcher { commands })
}

/// Controller end.
pub struct CommandSender {
    queue: Producer<Command>,
    gate: Arc<ReceiveGate>,
}

impl CommandSender {
    /// # Errors
    ///
    /// [`CommandError::QueueFull`] if the computation thread has fallen
    /// that far behind on checkpoints.
    pub fn send(&self, command: Command) -> Result<(), CommandError> {
        trace!(?command, "command queued");
        self.queue.push(command).map_err(|_rejected| {
            warn!("command queue full");
            CommandError::QueueFull
        })
    }

    /// Arms the receive gate and queues the receive request. Asking again
    /// while a cycle is in progress does nothing.
    ///
    /// # Errors
    ///
    /// [`CommandError::QueueFull`]; the gate is left unarmed.
    pub fn request_receive(&self) -> Result<(), CommandError> {
        if !self.gate.arm() {
            debug!("receive already in progress");
            return Ok(());
        }
        self.send(Command::Receive).inspect_err(|_| self.gate.reset())
    }
}

/// Computation end. Owned by the computation thread between checkpoints.
pub struct Dispatcher {
    commands: Consumer<Command>,
}

impl Dispatcher {
    /// Moves every queued command into a fresh set of flags.
    pub fn collect(&mut self) -> Pending {
        let mut pending = Pending::default();
        for command in self.commands.drain() {
            pending.absorb(command);
        }
        pending
    }
}

/// Sticky request flags gathered at one checkpoint.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Pending {
    pub reset: bool,
    pub saves: Vec<(SaveKind, PathBuf)>,
    pub sends: Vec<(Vec<String>, SendLocation)>,
    pub receive: bool,
    pub enter_debugger: bool,
    pub leave_debugger: bool,
}

impl Pending {
    fn absorb(&mut self, command: Command) {
        match command {
            Command::Reset => self.reset = true,
            Command::Save { kind, path } => self.saves.push((kind, path)),
            Command::Send { items, location } => self.sends.push((items, location)),
            Command::Receive => self.receive = true,
            Command::EnterDebugger => self.enter_debugger = true,
            Command::LeaveDebugger => {
                self.enter_debugger = false;
                self.leave_debugger = true;
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Acts on the flags. Runs on the computation thread.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub(crate) fn apply<M: Machine + ?Sized>(self, machine: &mut M, ctx: &EmuContext) {
        if self.reset {
            debug!("reset");
            machine.reset();
        }

        for (kind, path) in self.saves {
            let success = match machine.save(kind, &path) {
                Ok(()) => true,
                Err(e) => {
                    warn!(?kind, path = %path.display(), error = %e, "save failed");
                    false
                }
            };
            ctx.emit(EmuEvent::SaveCompleted { success });
        }

        for (items, location) in self.sends {
            send_batch(machine, ctx, items, location);
        }

        if self.receive {
            receive(ctx);
        }

        if self.leave_debugger && ctx.in_debugger() {
            debug!("leaving debugger");
            machine.clear_temp_breakpoints();
            machine.close_debugger();
        }

        if self.enter_debugger && !ctx.in_debugger() {
            debug!("entering debugger");
            machine.open_debugger(ctx, DebugReason::User, 0);
        }
    }
}

fn send_batch<M: Machine + ?Sized>(
    machine: &mut M,
    ctx: &EmuContext,
    items: Vec<String>,
    location: SendLocation,
) {
    debug!(count = items.len(), ?location, "send batch");
    for name in items {
        let status = machine.send_variable(&name, location);
        if status != TransferStatus::Good {
            warn!(name = %name, ?status, "transfer did not complete cleanly");
        }
        ctx.emit(EmuEvent::FileTransferCompleted { name, status });
    }
    ctx.emit(EmuEvent::FileTransferCompleted {
        name: String::new(),
        status: TransferStatus::Good,
    });
}

fn receive(ctx: &EmuContext) {
    let gate = ctx.receive_gate();
    if !gate.is_armed() {
        return;
    }
    ctx.emit(EmuEvent::ReceiveReady);
    match gate.wait(ctx.stop_signal()) {
        GateOutcome::Signaled => {
            debug!("receive gate released");
        }
        GateOutcome::Cancelled => {
            debug!("receive abandoned by stop");
        }
        GateOutcome::NotArmed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CommandSender, Dispatcher, Arc<ReceiveGate>) {
        let gate = Arc::new(ReceiveGate::new());
        let (sender, dispatcher) = channel(4, Arc::clone(&gate));
        (sender, dispatcher, gate)
    }

    #[test]
    fn repeated_flags_coalesce() {
        let (sender, mut dispatcher, _gate) = pair();
        sender.send(Command::Reset).unwrap();
        sender.send(Command::Reset).unwrap();

        let pending = dispatcher.collect();
        assert!(pending.reset);
        assert!(dispatcher.collect().is_empty());
    }

    #[test]
    fn payload_commands_keep_request_order() {
        let (sender, mut dispatcher, _gate) = pair();
        sender
            .send(Command::Send { items: vec!["A".into()], location: SendLocation::Ram })
            .unwrap();
        sender
            .send(Command::Save { kind: SaveKind::Image, path: "one.img".into() })
            .unwrap();
        sender
            .send(Command::Send {
                items: vec!["B".into(), "C".into()],
                location: SendLocation::Archive,
            })
            .unwrap();

        let pending = dispatcher.collect();
        assert_eq!(
            pending.sends,
            vec![
                (vec!["A".to_string()], SendLocation::Ram),
                (vec!["B".to_string(), "C".to_string()], SendLocation::Archive),
            ]
        );
        assert_eq!(pending.saves, vec![(SaveKind::Image, PathBuf::from("one.img"))]);
    }

    #[test]
    fn leave_cancels_pending_enter() {
        let (sender, mut dispatcher, _gate) = pair();
        sender.send(Command::EnterDebugger).unwrap();
        sender.send(Command::LeaveDebugger).unwrap();

        let pending = dispatcher.collect();
        assert!(!pending.enter_debugger);
        assert!(pending.leave_debugger);
    }

    #[test]
    fn full_queue_is_reported() {
        let (sender, _dispatcher, _gate) = pair();
        for _ in 0..4 {
            sender.send(Command::Reset).unwrap();
        }
        assert_eq!(sender.send(Command::Reset), Err(CommandError::QueueFull));
    }

    #[test]
    fn receive_arms_gate_once() {
        let (sender, mut dispatcher, gate) = pair();
        sender.request_receive().unwrap();
        sender.request_receive().unwrap();

        assert!(gate.is_armed());
        let pending = dispatcher.collect();
        assert!(pending.receive);
        assert!(dispatcher.collect().is_empty());
    }

    #[test]
    fn receive_on_full_queue_leaves_gate_unarmed() {
        let (sender, _dispatcher, gate) = pair();
        for _ in 0..4 {
            sender.send(Command::Reset).unwrap();
        }
        assert_eq!(sender.request_receive(), Err(CommandError::QueueFull));
        assert!(!gate.is_armed());
    }
}
