//! # Per-Thread Command Queues
//!
//! A [`CommandQueue`] collects deferred commands from exactly one thread.
//! Nothing is shared while queueing: the queue is only handed over (flushed)
//! at a submission point.
//!
//! ```text
//!   producer thread           submission point            core thread
//!   ───────────────           ────────────────            ───────────
//!   queue(a) queue(b)  ──>  flush_into(shared)  ──>  playback: a, b
//! ```

use std::fmt;
use std::thread::ThreadId;

use tandem_core::{async_op, AsyncOp, CommandResult, NotificationId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A deferred callable, optionally tagged for completion reporting.
pub struct Command {
    job: Job,
    notify: Option<NotificationId>,
}

impl Command {
    /// Wraps a callable.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Box::new(f),
            notify: None,
        }
    }

    /// Wraps a value-producing callable and returns the handle to its result.
    ///
    /// If the command is dropped without running, the handle resolves to
    /// [`CommandError::Abandoned`](tandem_core::CommandError::Abandoned).
    pub fn returning<T, F>(f: F) -> (Self, AsyncOp<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> CommandResult<T> + Send + 'static,
    {
        let (op, completer) = async_op();
        (Self::new(move || completer.complete(f())), op)
    }

    /// A no-op whose only purpose is to report `id` once everything queued
    /// before it has run.
    #[must_use]
    pub fn sentinel(id: NotificationId) -> Self {
        Self::new(|| {}).with_notify(Some(id))
    }

    /// Tags the command with a notification id.
    #[must_use]
    pub fn with_notify(mut self, notify: Option<NotificationId>) -> Self {
        self.notify = notify;
        self
    }

    /// Notification id reported after this command runs, if any.
    #[inline]
    #[must_use]
    pub fn notify_id(&self) -> Option<NotificationId> {
        self.notify
    }

    /// Runs the command and returns its notification id.
    pub fn run(self) -> Option<NotificationId> {
        (self.job)();
        self.notify
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("notify", &self.notify)
            .finish_non_exhaustive()
    }
}

/// An ordered run of commands detached from a queue.
#[derive(Debug, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    /// Creates an empty batch with room for `capacity` commands.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Number of commands in the batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if the batch holds no commands.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Appends one command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Moves every command of `other` to the end of this batch.
    pub fn append(&mut self, other: &mut CommandBatch) {
        self.commands.append(&mut other.commands);
    }

    /// Swaps contents with `other`. Both keep the other's capacity.
    pub fn swap(&mut self, other: &mut CommandBatch) {
        std::mem::swap(&mut self.commands, &mut other.commands);
    }

    /// Runs every command in order and leaves the batch empty.
    ///
    /// Notification ids are ignored. Returns the number of commands run.
    pub fn playback(&mut self) -> usize {
        self.playback_with_notify(|_| {})
    }

    /// Runs every command in order, reporting each notification id to
    /// `notify` right after its command returns.
    ///
    /// Capacity is kept for the next batch. If a command panics, the
    /// commands after it are dropped without running.
    pub fn playback_with_notify(&mut self, mut notify: impl FnMut(NotificationId)) -> usize {
        let mut executed = 0;
        for command in self.commands.drain(..) {
            if let Some(id) = command.run() {
                notify(id);
            }
            executed += 1;
        }
        executed
    }

    /// Drops every command without running it.
    pub fn clear(&mut self) -> usize {
        let dropped = self.commands.len();
        self.commands.clear();
        dropped
    }
}

/// FIFO of deferred commands owned by one producer thread.
///
/// ## Usage
///
/// ```rust
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use tandem_scheduler::command::CommandQueue;
///
/// let hits = Arc::new(AtomicU32::new(0));
/// let mut queue = CommandQueue::new(std::thread::current().id(), true, 4);
///
/// let counter = Arc::clone(&hits);
/// queue.queue(move || { counter.fetch_add(1, Ordering::Relaxed); }, None);
/// let op = queue.queue_return(|| Ok(2 + 2));
///
/// let mut batch = queue.flush();
/// assert!(queue.is_empty());
/// assert_eq!(batch.playback(), 2);
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
/// assert_eq!(op.wait(), Ok(4));
/// ```
pub struct CommandQueue {
    commands: Vec<Command>,
    thread_id: ThreadId,
    is_main: bool,
}

impl CommandQueue {
    /// Creates an empty queue for `thread_id`.
    ///
    /// `is_main` marks the simulation thread's queue, which is flushed last
    /// when every queue is submitted together.
    #[must_use]
    pub fn new(thread_id: ThreadId, is_main: bool, capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
            thread_id,
            is_main,
        }
    }

    /// Appends a fire-and-forget command. When `notify` is set, the id is
    /// reported once the command has run on the core thread.
    pub fn queue<F>(&mut self, f: F, notify: Option<NotificationId>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Command::new(f).with_notify(notify));
    }

    /// Appends a command that produces a value. The returned op stays
    /// pending until the command is executed.
    pub fn queue_return<T, F>(&mut self, f: F) -> AsyncOp<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CommandResult<T> + Send + 'static,
    {
        let (command, op) = Command::returning(f);
        self.push(command);
        op
    }

    /// Appends an already built command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Detaches every pending command into a new batch.
    pub fn flush(&mut self) -> CommandBatch {
        let mut batch = CommandBatch::with_capacity(self.commands.len());
        self.flush_into(&mut batch);
        batch
    }

    /// Moves every pending command to the end of `batch`.
    ///
    /// The queue keeps its capacity. Returns the number of commands moved.
    pub fn flush_into(&mut self, batch: &mut CommandBatch) -> usize {
        let moved = self.commands.len();
        batch.commands.append(&mut self.commands);
        moved
    }

    /// Drops every pending command without running it.
    ///
    /// Return commands resolve to `Abandoned`. Returns the number dropped.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.commands.len();
        self.commands.clear();
        dropped
    }

    /// Number of pending commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Thread that owns this queue.
    #[inline]
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Returns true for the simulation thread's queue.
    #[inline]
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.is_main
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("thread_id", &self.thread_id)
            .field("is_main", &self.is_main)
            .field("pending", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tandem_core::{CommandError, NotificationRegistry};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |n: u32| -> Box<dyn FnOnce() + Send> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(n))
        };
        (log, make)
    }

    #[test]
    fn test_fifo_playback() {
        let (log, make) = recorder();
        let mut queue = CommandQueue::new(std::thread::current().id(), false, 0);
        for n in 0..5 {
            queue.queue(make(n), None);
        }
        assert_eq!(queue.len(), 5);

        let mut batch = queue.flush();
        assert!(queue.is_empty());
        assert_eq!(batch.playback(), 5);
        assert!(batch.is_empty());
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_flush_keeps_queue_capacity() {
        let mut queue = CommandQueue::new(std::thread::current().id(), false, 16);
        queue.queue(|| {}, None);
        let mut batch = CommandBatch::default();
        assert_eq!(queue.flush_into(&mut batch), 1);
        assert!(queue.commands.capacity() >= 16);
    }

    #[test]
    fn test_notify_reported_after_command() {
        let (log, make) = recorder();
        let registry = NotificationRegistry::new();
        let id = registry.allocate_id();

        let mut queue = CommandQueue::new(std::thread::current().id(), true, 0);
        queue.queue(make(1), None);
        queue.queue(make(2), Some(id));

        let mut reported = Vec::new();
        queue.flush().playback_with_notify(|id| {
            // Command 2 has already run when its id is reported.
            assert_eq!(log.lock().len(), 2);
            reported.push(id);
        });
        assert_eq!(reported, vec![id]);
    }

    #[test]
    fn test_return_command_pending_until_played() {
        let mut queue = CommandQueue::new(std::thread::current().id(), false, 0);
        let op = queue.queue_return(|| Ok::<_, CommandError>("texture".to_string()));
        assert!(!op.has_completed());

        queue.flush().playback();
        assert_eq!(op.wait(), Ok("texture".to_string()));
    }

    #[test]
    fn test_return_command_error_propagates() {
        let mut queue = CommandQueue::new(std::thread::current().id(), false, 0);
        let op = queue.queue_return::<u32, _>(|| Err(CommandError::Failed("no device".into())));
        queue.flush().playback();
        assert_eq!(op.wait(), Err(CommandError::Failed("no device".into())));
    }

    #[test]
    fn test_cancel_all_abandons_returns() {
        let (log, make) = recorder();
        let mut queue = CommandQueue::new(std::thread::current().id(), false, 0);
        queue.queue(make(1), None);
        let op = queue.queue_return(|| Ok(1u8));

        assert_eq!(queue.cancel_all(), 2);
        assert!(queue.is_empty());
        assert!(log.lock().is_empty());
        assert_eq!(op.wait(), Err(CommandError::Abandoned));
    }

    #[test]
    fn test_sentinel_only_reports() {
        let registry = NotificationRegistry::new();
        let id = registry.allocate_id();
        let mut batch = CommandBatch::default();
        batch.push(Command::sentinel(id));
        batch.playback_with_notify(|id| {
            registry.notify_completed(id);
        });
        assert_eq!(registry.block_until_completed(id), Ok(()));
    }

    #[test]
    fn test_append_preserves_order() {
        let (log, make) = recorder();
        let mut first = CommandBatch::default();
        first.push(Command::new(make(1)));
        let mut second = CommandBatch::default();
        second.push(Command::new(make(2)));
        second.push(Command::new(make(3)));

        first.append(&mut second);
        assert!(second.is_empty());
        assert_eq!(first.playback(), 3);
        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }
}
