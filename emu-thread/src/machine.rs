//! The emulated machine as seen by the coordination layer.
//!
//! Everything behind this trait (instruction execution, persistence, the
//! link protocol, the debugger) is opaque. Calls may block or fail; failures
//! come back as values and are turned into event status fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::{SaveKind, SendLocation};
use crate::context::EmuContext;
use crate::error::CollaboratorError;

/// Outcome of one link transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Good,
    /// Transferred, but the receiving side complained.
    Warn,
    Error,
}

/// Why the debugger was entered or what it asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DebugReason {
    /// Requested from the controller.
    User,
    Breakpoint,
    ReadWatchpoint,
    WriteWatchpoint,
    Step,
    /// Machine-specific code.
    Other(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadSource {
    /// Cold boot from a ROM image.
    Rom(PathBuf),
    /// Restore a saved machine image.
    Image(PathBuf),
}

impl LoadSource {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Rom(path) | Self::Image(path) => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStatus {
    Okay,
    Fail,
    /// The file loaded but is not for this machine.
    Unsupported,
}

/// The machine driven by the computation thread.
///
/// All methods except [`load`](Self::load) run on the computation thread.
/// `load` runs on the controller thread while the computation thread is
/// stopped.
pub trait Machine: Send + 'static {
    /// The execution loop.
    ///
    /// Must return promptly once [`EmuContext::should_exit`] is true, and
    /// should call [`EmuContext::checkpoint`] whenever its state is
    /// consistent enough for external mutation.
    fn run(&mut self, ctx: &EmuContext);

    /// Raises a machine-level reset, taking effect at the machine's leisure.
    fn reset(&mut self);

    fn save(&mut self, kind: SaveKind, path: &Path) -> Result<(), CollaboratorError>;

    fn load(&mut self, source: &LoadSource) -> LoadStatus;

    /// Sends one file over the link.
    fn send_variable(&mut self, name: &str, location: SendLocation) -> TransferStatus;

    /// Enters the debugger. Typically does not return until the debugger is
    /// left, and keeps calling [`EmuContext::checkpoint`] meanwhile.
    fn open_debugger(&mut self, ctx: &EmuContext, reason: DebugReason, addr: u32) {
        let _ = (ctx, reason, addr);
    }

    fn close_debugger(&mut self) {}

    fn clear_temp_breakpoints(&mut self) {}
}
