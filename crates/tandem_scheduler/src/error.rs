//! # Scheduler Error Types
//!
//! All errors that can occur when talking to the core thread.

use tandem_core::{CommandError, NotificationError};
use thiserror::Error;

/// Errors that can occur in the core-thread scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A command was queued from the core thread onto the core thread.
    #[error("cannot queue commands on the core thread for the core thread")]
    QueuedFromCoreThread,

    /// The core thread tried to block on its own queue.
    #[error("the core thread cannot wait for its own commands")]
    WaitOnCoreThread,

    /// An operation reserved for the core thread was called elsewhere.
    #[error("this operation may only be called from the core thread")]
    NotCoreThread,

    /// An operation that must not run on the core thread was called there.
    #[error("this operation may not be called from the core thread")]
    OnCoreThread,

    /// An operation reserved for the simulation thread was called elsewhere.
    #[error("this operation may only be called from the simulation thread")]
    NotSimThread,

    /// The scheduler is shutting down or has stopped.
    #[error("core thread is shut down")]
    ShutDown,

    /// The core thread could not be spawned.
    #[error("failed to spawn core thread: {0}")]
    Spawn(String),

    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A completion wait failed.
    #[error(transparent)]
    Notification(#[from] NotificationError),

    /// A return command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Errors from loading a [`SchedulerConfig`](crate::SchedulerConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {reason}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        reason: String,
    },

    /// The config text is not valid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
