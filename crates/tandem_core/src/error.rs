//! # Core Error Types
//!
//! Errors produced by commands, completion notifications and frame payloads.

use thiserror::Error;

use crate::sync::NotificationId;

/// Errors carried by an [`AsyncOp`](crate::sync::AsyncOp) result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command was dropped without running (shutdown or a core thread panic).
    #[error("command was dropped before it ran")]
    Abandoned,

    /// The result was already moved out of the operation by another holder.
    #[error("command result was already taken")]
    ResultTaken,

    /// The command ran and reported a failure.
    #[error("command failed: {0}")]
    Failed(String),
}

/// Errors from waiting on a notification id.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationError {
    /// The id was never issued or was already consumed by another wait.
    #[error("unknown notification id {0}")]
    Unknown(NotificationId),

    /// The registry was cancelled before the id completed.
    #[error("notification {0} cancelled before completion")]
    Cancelled(NotificationId),
}

/// Errors from reading a payload staged in a frame allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The arena holding the payload was cleared after the payload was staged.
    #[error("stale frame payload: arena {index} is at generation {found}, payload was staged at {expected}")]
    Stale {
        /// Arena index the payload was staged in.
        index: usize,
        /// Generation recorded when the payload was staged.
        expected: u64,
        /// Generation the arena is at now.
        found: u64,
    },
}

/// Result type for command execution.
pub type CommandResult<T> = Result<T, CommandError>;
