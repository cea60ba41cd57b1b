//! # Queue Registry
//!
//! Owns one [`CommandQueue`] per producer thread, keyed by [`ThreadId`].
//! Queues are created on a thread's first use and live until the scheduler
//! that owns the registry is torn down.
//!
//! The map itself is behind an `RwLock` so lookups from different threads
//! don't contend; each queue has its own `Mutex`, which is uncontended in
//! practice because only its owner thread queues into it.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

use crate::command::{CommandBatch, CommandQueue};

/// Registry of per-thread command queues.
pub struct QueueRegistry {
    queues: RwLock<HashMap<ThreadId, Mutex<CommandQueue>>>,
    main_thread: ThreadId,
    capacity: usize,
}

impl QueueRegistry {
    /// Creates an empty registry. `main_thread` is the simulation thread.
    #[must_use]
    pub fn new(main_thread: ThreadId, capacity: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            main_thread,
            capacity,
        }
    }

    /// Runs `f` on the calling thread's queue, creating it if needed.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut CommandQueue) -> R) -> R {
        self.with_queue(thread::current().id(), f)
    }

    /// Runs `f` on the queue of `thread_id`, creating it if needed.
    pub fn with_queue<R>(&self, thread_id: ThreadId, f: impl FnOnce(&mut CommandQueue) -> R) -> R {
        {
            let queues = self.queues.read();
            if let Some(queue) = queues.get(&thread_id) {
                return f(&mut *queue.lock());
            }
        }

        let mut queues = self.queues.write();
        let queue = queues.entry(thread_id).or_insert_with(|| {
            tracing::debug!(?thread_id, "registered command queue");
            Mutex::new(CommandQueue::new(
                thread_id,
                thread_id == self.main_thread,
                self.capacity,
            ))
        });
        f(queue.get_mut())
    }

    /// Moves the calling thread's pending commands to the end of `batch`.
    ///
    /// Returns the number of commands moved.
    pub fn flush_current_into(&self, batch: &mut CommandBatch) -> usize {
        let thread_id = thread::current().id();
        let queues = self.queues.read();
        queues
            .get(&thread_id)
            .map_or(0, |queue| queue.lock().flush_into(batch))
    }

    /// Moves every thread's pending commands to the end of `batch`.
    ///
    /// Worker queues come first; the main queue is appended last so the
    /// simulation thread's commands observe everything workers queued.
    pub fn flush_all_into(&self, batch: &mut CommandBatch) -> usize {
        let queues = self.queues.read();
        let mut moved = 0;
        for queue in queues.values() {
            let mut queue = queue.lock();
            if !queue.is_main() {
                moved += queue.flush_into(batch);
            }
        }
        if let Some(main) = queues.get(&self.main_thread) {
            moved += main.lock().flush_into(batch);
        }
        moved
    }

    /// Pending commands in the calling thread's queue.
    #[must_use]
    pub fn pending_current(&self) -> usize {
        let thread_id = thread::current().id();
        self.queues
            .read()
            .get(&thread_id)
            .map_or(0, |queue| queue.lock().len())
    }

    /// Pending commands across every queue.
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.queues
            .read()
            .values()
            .map(|queue| queue.lock().len())
            .sum()
    }

    /// Drops every queue and its pending commands without running them.
    ///
    /// Returns the number of commands dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.queues.write().drain().collect();
        // Dropped outside the map lock: abandoned return commands wake
        // their waiters, which may call back into the registry.
        drained
            .into_iter()
            .map(|(_, queue)| queue.into_inner().cancel_all())
            .sum()
    }

    /// Number of registered queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Returns true if no thread has queued anything yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }

    /// The simulation thread whose queue is flushed last.
    #[must_use]
    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("main_thread", &self.main_thread)
            .field("queues", &self.len())
            .finish()
    }
}
