//! Notifications from the computation thread to the controller.
//!
//! Emitting is fire-and-forget: the queue is unbounded and a controller that
//! went away is silently ignored, so the computation thread never waits here.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryIter};
use serde::{Deserialize, Serialize};

use crate::console::ConsoleStream;
use crate::machine::{DebugReason, TransferStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmuEvent {
    /// A chunk of text for `stream` was committed to the console ring.
    ConsoleDataReady(ConsoleStream),
    /// One item of a send batch finished. The batch ends with an event whose
    /// `name` is empty.
    FileTransferCompleted { name: String, status: TransferStatus },
    /// The computation thread is parked at the receive gate.
    ReceiveReady,
    SaveCompleted { success: bool },
    /// The machine's run loop returned on its own.
    Stopped,
    ActualSpeedChanged(u32),
    /// The debugger wants the controller to act on `reason` at `addr`.
    DebugCommand { reason: DebugReason, addr: u32 },
    DebuggerRaised,
    DebuggerDisabled,
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender(tx), EventReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct EventSender(Sender<EmuEvent>);

impl EventSender {
    pub fn emit(&self, event: EmuEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.0.send(event);
    }
}

#[derive(Debug)]
pub struct EventReceiver(Receiver<EmuEvent>);

impl EventReceiver {
    #[must_use]
    pub fn try_recv(&self) -> Option<EmuEvent> {
        self.0.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EmuEvent> {
        self.0.recv_timeout(timeout).ok()
    }

    /// The underlying channel, for hosts that `select!` over events and
    /// their own sources.
    #[must_use]
    pub fn as_receiver(&self) -> &Receiver<EmuEvent> {
        &self.0
    }

    /// Iterates over the events already queued.
    pub fn try_iter(&self) -> TryIter<'_, EmuEvent> {
        self.0.try_iter()
    }

    /// Waits until `pred` matches an event, discarding the ones before it.
    #[must_use]
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&EmuEvent) -> bool,
    ) -> Option<EmuEvent> {
        let deadline = minstant::Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(minstant::Instant::now())?;
            let event = self.recv_timeout(left)?;
            if pred(&event) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_after_receiver_dropped_is_ignored() {
        let (tx, rx) = channel();
        drop(rx);
        tx.emit(EmuEvent::Stopped);
    }

    #[test]
    fn wait_for_skips_unrelated_events() {
        let (tx, rx) = channel();
        tx.emit(EmuEvent::ActualSpeedChanged(50));
        tx.emit(EmuEvent::ReceiveReady);

        let found = rx.wait_for(Duration::from_millis(50), |e| *e == EmuEvent::ReceiveReady);
        assert_eq!(found, Some(EmuEvent::ReceiveReady));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn host_can_select_over_events() {
        let (tx, rx) = channel();
        let (_other_tx, other_rx) = crossbeam_channel::unbounded::<()>();
        tx.emit(EmuEvent::SaveCompleted { success: true });

        crossbeam_channel::select! {
            recv(rx.as_receiver()) -> event => {
                assert_eq!(event, Ok(EmuEvent::SaveCompleted { success: true }));
            }
            recv(other_rx) -> _ => panic!("no host message was sent"),
            default(Duration::from_millis(100)) => panic!("event not delivered"),
        }
    }

    #[test]
    fn events_serialize_for_host_logs() {
        let json = serde_json::to_string(&EmuEvent::FileTransferCompleted {
            name: "PRGM.8xp".into(),
            status: TransferStatus::Good,
        })
        .unwrap();
        assert_eq!(json, r#"{"FileTransferCompleted":{"name":"PRGM.8xp","status":"Good"}}"#);
    }
}
