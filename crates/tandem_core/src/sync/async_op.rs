//! # Async Operations
//!
//! Result handles for commands that produce a value on the core thread.
//!
//! ```text
//!   Caller thread                       Core thread
//!   ─────────────                       ───────────
//!   (op, completer) = async_op()
//!   queue(move || completer.complete(..))  ──>  runs command
//!   op.wait()  ...blocks...                     completer.complete(Ok(v))
//!            <──────────── notify_all ──────────┘
//! ```
//!
//! If the completer is dropped without completing (the command was discarded
//! at shutdown, or the core thread unwound), the operation resolves to
//! [`CommandError::Abandoned`] so no caller waits forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{CommandError, CommandResult};

/// Shared state between an [`AsyncOp`] and its [`AsyncOpCompleter`].
struct OpState<T> {
    done: AtomicBool,
    result: Mutex<Option<CommandResult<T>>>,
    condvar: Condvar,
}

impl<T> OpState<T> {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    fn resolve(&self, result: CommandResult<T>) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.done.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

/// Creates a linked operation handle and completer.
#[must_use]
pub fn async_op<T>() -> (AsyncOp<T>, AsyncOpCompleter<T>) {
    let state = Arc::new(OpState::new());
    (
        AsyncOp {
            state: Arc::clone(&state),
        },
        AsyncOpCompleter { state: Some(state) },
    )
}

/// Handle to the eventual result of a return command.
///
/// Cloning the handle shares the same result; the first holder to
/// [`take`](AsyncOp::take) it moves it out.
pub struct AsyncOp<T> {
    state: Arc<OpState<T>>,
}

impl<T> AsyncOp<T> {
    /// Returns true once the command has run (or been abandoned).
    #[inline]
    #[must_use]
    pub fn has_completed(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the operation completes.
    ///
    /// Never call this from the core thread for a command queued to it.
    pub fn block_until_complete(&self) {
        if self.has_completed() {
            return;
        }
        let mut slot = self.state.result.lock();
        while !self.state.done.load(Ordering::Acquire) {
            self.state.condvar.wait(&mut slot);
        }
    }

    /// Waits with timeout. Returns true if completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.has_completed() {
            return true;
        }
        let mut slot = self.state.result.lock();
        if !self.state.done.load(Ordering::Acquire) {
            self.state.condvar.wait_for(&mut slot, timeout);
        }
        self.state.done.load(Ordering::Acquire)
    }

    /// Moves the result out, or returns `None` if still pending.
    ///
    /// Returns `Some(Err(CommandError::ResultTaken))` if another holder
    /// already took it.
    pub fn take(&self) -> Option<CommandResult<T>> {
        if !self.has_completed() {
            return None;
        }
        let mut slot = self.state.result.lock();
        Some(slot.take().unwrap_or(Err(CommandError::ResultTaken)))
    }

    /// Blocks until the operation completes, then moves the result out.
    ///
    /// # Errors
    ///
    /// Returns the command's own error, [`CommandError::Abandoned`] if it
    /// never ran, or [`CommandError::ResultTaken`] if another holder took it.
    pub fn wait(&self) -> CommandResult<T> {
        self.block_until_complete();
        self.take().unwrap_or(Err(CommandError::ResultTaken))
    }
}

impl<T: Clone> AsyncOp<T> {
    /// Returns a copy of the result without consuming it.
    #[must_use]
    pub fn return_value(&self) -> Option<CommandResult<T>> {
        if !self.has_completed() {
            return None;
        }
        self.state.result.lock().clone()
    }
}

impl<T> Clone for AsyncOp<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for AsyncOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOp")
            .field("completed", &self.has_completed())
            .finish()
    }
}

/// Write side of an [`AsyncOp`], owned by the queued command.
pub struct AsyncOpCompleter<T> {
    state: Option<Arc<OpState<T>>>,
}

impl<T> AsyncOpCompleter<T> {
    /// Publishes the result and wakes every waiter.
    pub fn complete(mut self, result: CommandResult<T>) {
        if let Some(state) = self.state.take() {
            state.resolve(result);
        }
    }
}

impl<T> Drop for AsyncOpCompleter<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.resolve(Err(CommandError::Abandoned));
        }
    }
}
