//! # The Core Thread
//!
//! One dedicated thread executes every command; any thread may queue them.
//!
//! ```text
//!  sim thread ─┐   queue_command        ┌───────────────┐
//!  worker 1 ───┼──> per-thread queue ──>│ shared queue  │──> core loop
//!  worker 2 ───┘        submit()        │ (Mutex+Condvar)│    playback
//!                                        └───────────────┘
//! ```
//!
//! ## Ordering
//!
//! Commands from one thread run in the order that thread queued them.
//! [`CoreThread::submit_all`] moves worker queues before the main queue.
//!
//! ## Blocking
//!
//! A blocking submit appends a sentinel command tagged with a fresh
//! [`NotificationId`] right after the batch, then waits on that id. The
//! core thread itself is never allowed to block on its own queue.
//!
//! ## Shutdown
//!
//! Commands already in the shared queue still run; the loop exits once the
//! queue is empty. Commands left in per-thread queues are dropped, and
//! return commands among them resolve to
//! [`CommandError::Abandoned`](tandem_core::CommandError::Abandoned).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use tandem_core::{
    AsyncOp, CommandResult, FrameAllocHandle, FrameAllocs, NotificationError, NotificationId,
    NotificationRegistry,
};

use crate::command::{Command, CommandBatch, QueueFlags};
use crate::config::{ExecutionMode, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::QueueRegistry;
use crate::worker::{NoWorkerBudget, WorkerBudget};

/// Lifecycle of the core thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunState {
    /// Spawned, id not yet published.
    Starting = 0,
    /// Accepting and executing commands.
    Running = 1,
    /// Shutdown requested; draining the shared queue.
    ShuttingDown = 2,
    /// Thread joined. No further commands run.
    Stopped = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreThreadStats {
    /// Commands run, sentinels included.
    pub commands_executed: u64,
    /// Batches taken from the shared queue (or played back inline).
    pub batches_executed: u64,
    /// Sentinels appended by blocking submissions.
    pub sentinels_queued: u64,
    /// Commands dropped without running because of shutdown.
    pub commands_dropped: u64,
}

#[derive(Default)]
struct StatCounters {
    commands_executed: AtomicU64,
    batches_executed: AtomicU64,
    sentinels_queued: AtomicU64,
    commands_dropped: AtomicU64,
}

impl StatCounters {
    fn add_dropped(&self, count: usize) {
        self.commands_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoreThreadStats {
        CoreThreadStats {
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            sentinels_queued: self.sentinels_queued.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
        }
    }
}

struct SharedQueue {
    commands: CommandBatch,
    shutdown: bool,
}

/// State shared with the core loop.
struct Shared {
    /// Also guards notification id issuance and the shutdown flag.
    queue: Mutex<SharedQueue>,
    command_ready: Condvar,
    notifications: NotificationRegistry,
    worker_budget: Arc<dyn WorkerBudget>,
    state: AtomicU8,
    stats: StatCounters,
}

impl Shared {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Plays a batch back on the calling thread, reporting notification ids.
    fn execute(&self, batch: &mut CommandBatch) {
        let executed = batch.playback_with_notify(|id| {
            self.notifications.notify_completed(id);
        });
        self.stats
            .commands_executed
            .fetch_add(executed as u64, Ordering::Relaxed);
        self.stats.batches_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(executed, "executed command batch");
    }

    fn run_loop(&self) {
        self.worker_budget.reserve_worker();
        let mut batch = CommandBatch::default();

        loop {
            {
                let mut queue = self.queue.lock();
                while queue.commands.is_empty() && !queue.shutdown {
                    self.worker_budget.release_worker();
                    self.command_ready.wait(&mut queue);
                    self.worker_budget.reserve_worker();
                }
                if queue.commands.is_empty() {
                    break;
                }
                queue.commands.swap(&mut batch);
            }
            self.execute(&mut batch);
        }
    }
}

/// Runs when the core loop exits, normally or by unwinding.
struct LoopExit<'a> {
    shared: &'a Shared,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        self.shared.worker_budget.release_worker();
        if !thread::panicking() {
            if self.shared.queue.lock().shutdown {
                self.shared.set_state(RunState::Stopped);
            }
            return;
        }

        tracing::error!("a command panicked on the core thread; no further commands will run");
        let mut leftover = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            std::mem::take(&mut queue.commands)
        };
        self.shared.set_state(RunState::ShuttingDown);
        self.shared.stats.add_dropped(leftover.clear());
        self.shared.notifications.cancel_all();
    }
}

/// Scheduler owning the core thread and every command queue feeding it.
///
/// The thread that constructs the scheduler is the simulation thread.
///
/// ## Usage
///
/// ```rust
/// use tandem_scheduler::{CoreThread, QueueFlags, SchedulerConfig};
///
/// let core = CoreThread::start(SchedulerConfig::threaded()).unwrap();
///
/// let op = core
///     .queue_return_command(|| Ok(40 + 2), QueueFlags::empty())
///     .unwrap();
/// core.submit(true).unwrap();
/// assert_eq!(op.wait(), Ok(42));
///
/// core.shutdown();
/// ```
pub struct CoreThread {
    shared: Arc<Shared>,
    registry: QueueRegistry,
    frames: Arc<FrameAllocs>,
    /// Submission lock. The batch is scratch space reused across submits.
    submit_lock: Mutex<CommandBatch>,
    /// Serializes shutdown.
    handle: Mutex<Option<JoinHandle<()>>>,
    sim_thread: ThreadId,
    core_thread: ThreadId,
    config: SchedulerConfig,
}

impl CoreThread {
    /// Starts the scheduler with no worker budget.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] for an invalid configuration or
    /// [`SchedulerError::Spawn`] if the core thread cannot be started.
    pub fn start(config: SchedulerConfig) -> SchedulerResult<Self> {
        Self::with_worker_budget(config, Arc::new(NoWorkerBudget))
    }

    /// Starts the scheduler. The core loop releases its slot in `worker_budget`
    /// while idle.
    ///
    /// In threaded mode this blocks until the core thread has published its
    /// id.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub fn with_worker_budget(
        config: SchedulerConfig,
        worker_budget: Arc<dyn WorkerBudget>,
    ) -> SchedulerResult<Self> {
        config.validate()?;

        let sim_thread = thread::current().id();
        let shared = Arc::new(Shared {
            queue: Mutex::new(SharedQueue {
                commands: CommandBatch::with_capacity(config.initial_queue_capacity),
                shutdown: false,
            }),
            command_ready: Condvar::new(),
            notifications: NotificationRegistry::new(),
            worker_budget,
            state: AtomicU8::new(RunState::Starting as u8),
            stats: StatCounters::default(),
        });

        let (core_thread, handle) = match config.mode {
            ExecutionMode::Threaded => {
                let (handle, core_thread) = Self::spawn_core(&shared, &config.thread_name)?;
                (core_thread, Some(handle))
            }
            ExecutionMode::Inline => {
                shared.set_state(RunState::Running);
                (sim_thread, None)
            }
        };

        tracing::info!(
            mode = ?config.mode,
            thread = %config.thread_name,
            "core thread started"
        );

        Ok(Self {
            registry: QueueRegistry::new(sim_thread, config.initial_queue_capacity),
            frames: Arc::new(FrameAllocs::new(config.frame_alloc_block_size, sim_thread)),
            submit_lock: Mutex::new(CommandBatch::with_capacity(config.initial_queue_capacity)),
            handle: Mutex::new(handle),
            shared,
            sim_thread,
            core_thread,
            config,
        })
    }

    fn spawn_core(
        shared: &Arc<Shared>,
        name: &str,
    ) -> SchedulerResult<(JoinHandle<()>, ThreadId)> {
        let (started_tx, started_rx) = bounded(1);
        let loop_shared = Arc::clone(shared);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let shared = loop_shared;
                let _exit = LoopExit { shared: &shared };
                shared.set_state(RunState::Running);
                if started_tx.send(thread::current().id()).is_err() {
                    return;
                }
                shared.run_loop();
            })
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        match started_rx.recv() {
            Ok(core_thread) => Ok((handle, core_thread)),
            Err(_) => {
                let _ = handle.join();
                Err(SchedulerError::Spawn(
                    "core thread exited during startup".to_string(),
                ))
            }
        }
    }

    // -------------------------------------------------------------------
    // Queueing
    // -------------------------------------------------------------------

    /// Queues a command for the core thread.
    ///
    /// By default the command waits in the calling thread's queue until
    /// [`submit`](Self::submit). With [`QueueFlags::INTERNAL_QUEUE`] it goes
    /// straight to the core thread; adding
    /// [`QueueFlags::BLOCK_UNTIL_COMPLETE`] makes the call return only after
    /// it has run. `BLOCK_UNTIL_COMPLETE` alone submits the caller's queue
    /// and waits for all of it.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::QueuedFromCoreThread`] when called on the core
    ///   thread in threaded mode.
    /// - [`SchedulerError::ShutDown`] if the command can no longer run.
    pub fn queue_command<F>(&self, f: F, flags: QueueFlags) -> SchedulerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_reentry()?;
        if flags.is_internal() {
            return self.queue_internal(Command::new(f), flags.is_blocking());
        }
        self.registry.with_current(|queue| queue.queue(f, None));
        if flags.is_blocking() {
            self.submit(true)?;
        }
        Ok(())
    }

    /// Queues a command producing a value; the op resolves once it has run.
    ///
    /// Flags behave as in [`queue_command`](Self::queue_command).
    ///
    /// # Errors
    ///
    /// As [`queue_command`](Self::queue_command).
    pub fn queue_return_command<T, F>(&self, f: F, flags: QueueFlags) -> SchedulerResult<AsyncOp<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> CommandResult<T> + Send + 'static,
    {
        self.check_reentry()?;
        let (command, op) = Command::returning(f);
        if flags.is_internal() {
            self.queue_internal(command, flags.is_blocking())?;
            return Ok(op);
        }
        self.registry.with_current(|queue| queue.push(command));
        if flags.is_blocking() {
            self.submit(true)?;
        }
        Ok(op)
    }

    fn queue_internal(&self, command: Command, block: bool) -> SchedulerResult<()> {
        if self.mode() == ExecutionMode::Inline {
            if self.is_stopped() {
                self.shared.stats.add_dropped(1);
                return Err(SchedulerError::ShutDown);
            }
            let mut batch = CommandBatch::with_capacity(1);
            batch.push(command);
            self.shared.execute(&mut batch);
            return Ok(());
        }

        let notify = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                drop(queue);
                drop(command);
                self.shared.stats.add_dropped(1);
                return Err(SchedulerError::ShutDown);
            }
            let notify = block.then(|| self.shared.notifications.allocate_id());
            queue.commands.push(command.with_notify(notify));
            notify
        };
        self.shared.command_ready.notify_one();
        self.wait_for(notify)
    }

    fn check_reentry(&self) -> SchedulerResult<()> {
        if self.mode() == ExecutionMode::Threaded && self.is_core_thread() {
            tracing::error!("command queued from the core thread onto the core thread");
            return Err(SchedulerError::QueuedFromCoreThread);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------

    /// Hands the calling thread's queued commands to the core thread.
    ///
    /// With `block_until_complete`, returns after every one of them has run.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::WaitOnCoreThread`] for a blocking submit from the
    ///   core thread.
    /// - [`SchedulerError::ShutDown`] if the scheduler stopped before the
    ///   commands could run; they are dropped.
    pub fn submit(&self, block_until_complete: bool) -> SchedulerResult<()> {
        self.submit_with(block_until_complete, |registry, batch| {
            registry.flush_current_into(batch)
        })
    }

    /// Hands every thread's queued commands to the core thread.
    ///
    /// Worker queues are moved first and the simulation thread's queue last.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit).
    pub fn submit_all(&self, block_until_complete: bool) -> SchedulerResult<()> {
        self.submit_with(block_until_complete, QueueRegistry::flush_all_into)
    }

    fn submit_with(
        &self,
        block: bool,
        flush: impl FnOnce(&QueueRegistry, &mut CommandBatch) -> usize,
    ) -> SchedulerResult<()> {
        if self.mode() == ExecutionMode::Inline {
            let mut batch = CommandBatch::default();
            {
                let mut scratch = self.submit_lock.lock();
                flush(&self.registry, &mut *scratch);
                scratch.swap(&mut batch);
            }
            if self.is_stopped() {
                self.shared.stats.add_dropped(batch.clear());
                return Err(SchedulerError::ShutDown);
            }
            tracing::debug!(commands = batch.len(), "playing back command queue inline");
            self.shared.execute(&mut batch);
            return Ok(());
        }

        if block && self.is_core_thread() {
            tracing::error!("the core thread tried to block on its own queue");
            return Err(SchedulerError::WaitOnCoreThread);
        }

        let notify = {
            let mut scratch = self.submit_lock.lock();
            let moved = flush(&self.registry, &mut *scratch);
            tracing::debug!(commands = moved, block, "submitting command queue");
            self.push_batch(&mut *scratch, block)?
        };
        self.wait_for(notify)
    }

    /// Moves `batch` into the shared queue, followed by a sentinel when
    /// blocking. Returns the sentinel's id.
    fn push_batch(
        &self,
        batch: &mut CommandBatch,
        block: bool,
    ) -> SchedulerResult<Option<NotificationId>> {
        if batch.is_empty() && !block {
            return Ok(None);
        }

        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            let dropped = batch.clear();
            self.shared.stats.add_dropped(dropped);
            tracing::warn!(dropped, "submission after shutdown; commands dropped");
            return Err(SchedulerError::ShutDown);
        }

        queue.commands.append(batch);
        let notify = block.then(|| {
            let id = self.shared.notifications.allocate_id();
            queue.commands.push(Command::sentinel(id));
            self.shared
                .stats
                .sentinels_queued
                .fetch_add(1, Ordering::Relaxed);
            id
        });
        drop(queue);

        self.shared.command_ready.notify_one();
        Ok(notify)
    }

    fn wait_for(&self, notify: Option<NotificationId>) -> SchedulerResult<()> {
        let Some(id) = notify else {
            return Ok(());
        };
        match self.shared.notifications.block_until_completed(id) {
            Ok(()) => Ok(()),
            Err(NotificationError::Cancelled(_)) => Err(SchedulerError::ShutDown),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------

    /// Starts a new simulation frame by rotating the frame allocators.
    ///
    /// The arena filled during the previous frame passes to the core thread;
    /// the other one is cleared for this frame's writes.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotSimThread`] off the simulation thread.
    ///
    /// # Panics
    ///
    /// Panics if a [`frame_alloc`](Self::frame_alloc) handle is still alive.
    pub fn update(&self) -> SchedulerResult<()> {
        if !self.is_sim_thread() {
            tracing::error!("update called off the simulation thread");
            return Err(SchedulerError::NotSimThread);
        }
        let active = self.frames.rotate(self.sim_thread, self.core_thread);
        tracing::debug!(active, frame = self.frames.frame_count(), "frame update");
        Ok(())
    }

    /// Allocation handle for this frame's arena.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotSimThread`] off the simulation thread.
    ///
    /// # Panics
    ///
    /// Panics if another handle is still alive.
    pub fn frame_alloc(&self) -> SchedulerResult<FrameAllocHandle<'_>> {
        if !self.is_sim_thread() {
            return Err(SchedulerError::NotSimThread);
        }
        Ok(self.frames.handle())
    }

    /// The frame allocators, for commands that read staged payloads.
    #[must_use]
    pub fn frames(&self) -> &Arc<FrameAllocs> {
        &self.frames
    }

    // -------------------------------------------------------------------
    // Threads
    // -------------------------------------------------------------------

    /// Id of the thread executing commands. Equals the simulation thread
    /// in inline mode.
    #[inline]
    #[must_use]
    pub fn core_thread_id(&self) -> ThreadId {
        self.core_thread
    }

    /// Id of the thread that started the scheduler.
    #[inline]
    #[must_use]
    pub fn sim_thread_id(&self) -> ThreadId {
        self.sim_thread
    }

    /// Returns true on the core thread.
    #[inline]
    #[must_use]
    pub fn is_core_thread(&self) -> bool {
        thread::current().id() == self.core_thread
    }

    /// Returns true on the simulation thread.
    #[inline]
    #[must_use]
    pub fn is_sim_thread(&self) -> bool {
        thread::current().id() == self.sim_thread
    }

    /// Fails unless called on the core thread.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotCoreThread`].
    pub fn assert_core_thread(&self) -> SchedulerResult<()> {
        if self.is_core_thread() {
            Ok(())
        } else {
            tracing::error!("core-thread-only operation called from another thread");
            Err(SchedulerError::NotCoreThread)
        }
    }

    /// Fails when called on the core thread. Always passes in inline mode.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::OnCoreThread`].
    pub fn assert_not_core_thread(&self) -> SchedulerResult<()> {
        if self.mode() == ExecutionMode::Threaded && self.is_core_thread() {
            tracing::error!("operation not allowed on the core thread");
            Err(SchedulerError::OnCoreThread)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    /// Commands waiting in the calling thread's queue.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.registry.pending_current()
    }

    /// Snapshot of the execution counters.
    #[must_use]
    pub fn stats(&self) -> CoreThreadStats {
        self.shared.stats.snapshot()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Execution mode this scheduler was started with.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Configuration this scheduler was started with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn is_stopped(&self) -> bool {
        matches!(self.state(), RunState::ShuttingDown | RunState::Stopped)
    }

    // -------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------

    /// Stops the core thread and drops every unsubmitted command.
    ///
    /// Commands already submitted still run. Idempotent; called on drop.
    ///
    /// The core thread cannot join itself. Called from a command (typically
    /// because the command dropped the last reference to the scheduler), it
    /// tells the loop to exit once the submitted commands drain and detaches
    /// the thread instead of waiting for it.
    pub fn shutdown(&self) {
        if self.mode() == ExecutionMode::Threaded && self.is_core_thread() {
            self.detach_from_core();
            return;
        }

        let mut handle = self.handle.lock();
        if self.state() == RunState::Stopped {
            return;
        }

        self.shared.queue.lock().shutdown = true;
        self.shared.set_state(RunState::ShuttingDown);
        self.shared.command_ready.notify_all();

        if let Some(handle) = handle.take() {
            if handle.join().is_err() {
                tracing::error!("core thread terminated by a panic");
            }
        }

        // Only non-empty if the loop died early or never ran.
        let mut leftover = std::mem::take(&mut self.shared.queue.lock().commands);
        let mut dropped = leftover.clear();
        dropped += self.registry.clear();
        self.shared.stats.add_dropped(dropped);
        let cancelled = self.shared.notifications.cancel_all();

        if dropped > 0 || cancelled > 0 {
            tracing::warn!(dropped, cancelled, "unsubmitted commands dropped at shutdown");
        }

        self.shared.set_state(RunState::Stopped);
        tracing::info!("core thread stopped");
    }

    fn detach_from_core(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        self.shared.queue.lock().shutdown = true;
        self.shared.set_state(RunState::ShuttingDown);
        self.shared.command_ready.notify_all();
        drop(handle);

        let dropped = self.registry.clear();
        self.shared.stats.add_dropped(dropped);
        tracing::warn!(dropped, "shutdown requested from the core thread; detaching it");
    }
}

impl Drop for CoreThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CoreThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreThread")
            .field("mode", &self.config.mode)
            .field("state", &self.state())
            .field("sim_thread", &self.sim_thread)
            .field("core_thread", &self.core_thread)
            .finish_non_exhaustive()
    }
}
