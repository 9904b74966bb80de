//! Error types for every concern of the coordination layer.
//!
//! None of these ever unwind across the thread boundary. Errors raised on the
//! computation thread are either returned to the machine that made the call
//! or folded into an [`EmuEvent`](crate::EmuEvent) status field.

use std::io;

use thiserror::Error;

/// A console write that could not be (fully) enqueued.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The message did not fit in the free space and the spill buffer could
    /// not grow to hold it. Nothing was enqueued.
    #[error("console message of {size} bytes dropped: spill buffer allocation failed")]
    OutOfMemory { size: usize },

    /// A `Display` implementation inside the format arguments failed.
    #[error("console message formatting failed")]
    Format,

    /// The producer was waiting for the consumer to drain and the thread was
    /// asked to stop. `delivered` bytes of the message made it into the ring.
    #[error("console write interrupted by stop after {delivered} bytes")]
    Interrupted { delivered: usize },

    /// A `Display` implementation tried to write to the console while a
    /// write was already formatting.
    #[error("console written from inside a console write")]
    Reentrant,
}

/// A controller request that could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command queue is full; the computation thread has not reached a
    /// checkpoint for a while.
    #[error("command queue is full")]
    QueueFull,
}

/// Thread lifecycle misuse or failure.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("computation thread is already running")]
    AlreadyRunning,

    /// The last run was ended by force; load a new session first.
    #[error("computation thread was forcibly terminated; load before starting again")]
    Terminated,

    /// The machine was abandoned inside a thread that refused to stop, or
    /// was dropped by a panic.
    #[error("machine is no longer available")]
    MachineLost,

    #[error("failed to spawn computation thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Failure reported by an external collaborator (persistence, transfer).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}
