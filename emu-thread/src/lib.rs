//! Cross-thread coordination between an emulator execution loop and the
//! controller (usually a UI) that drives it.
//!
//! The computation thread owns the [`Machine`] and talks to the core only
//! through [`EmuContext`]. The controller owns an [`EmuThread`] handle, an
//! [`EventReceiver`] and a [`ConsoleReader`].
//!
//! ```text
//! computation thread ── ConsoleWriter ──> byte ring ──> ConsoleReader ── controller
//!        ^                                                                  │
//!        └──────── Checkpoint <── command queue <── CommandSender <────────┘
//!        └──────── ReceiveGate <──────────────────── signal_receive_ready ──┘
//!        └──────── Throttle ── EmuEvent::ActualSpeedChanged ──────────────> controller
//! ```

pub mod command;
pub mod console;
pub mod context;
pub mod error;
pub mod event;
pub mod gate;
pub mod machine;
pub mod runtime;
pub mod sync;
pub mod throttle;
pub mod trace;

pub use command::{Command, CommandSender, SaveKind, SendLocation};
pub use console::{ConsoleReader, ConsoleStream, ConsoleWriter};
pub use context::EmuContext;
pub use error::{CollaboratorError, CommandError, ConsoleError, LifecycleError};
pub use event::{EmuEvent, EventReceiver, EventSender};
pub use gate::ReceiveGate;
pub use machine::{DebugReason, LoadSource, LoadStatus, Machine, TransferStatus};
pub use runtime::{EmuThread, EmuThreadConfig, ForcedStopPolicy, ThreadState};
pub use throttle::{Throttle, ThrottleConfig};
pub use trace::init_tracing;
