//! # TANDEM Scheduler
//!
//! The core-thread command queue: any thread queues work, one dedicated
//! thread runs it.
//!
//! - [`CoreThread`] owns the core thread and the shared queue
//! - [`command::CommandQueue`] holds one thread's commands until submission
//! - [`registry::QueueRegistry`] finds every thread's queue at submission time
//! - [`worker::WorkerBudget`] lets the idle core thread lend its CPU slot
//!
//! ## Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use tandem_scheduler::{CoreThread, QueueFlags, SchedulerConfig};
//!
//! let core = CoreThread::start(SchedulerConfig::threaded()).unwrap();
//! let draws = Arc::new(AtomicU32::new(0));
//!
//! for _ in 0..3 {
//!     let draws = Arc::clone(&draws);
//!     core.queue_command(
//!         move || { draws.fetch_add(1, Ordering::Relaxed); },
//!         QueueFlags::empty(),
//!     )
//!     .unwrap();
//! }
//!
//! core.submit(true).unwrap();
//! assert_eq!(draws.load(Ordering::Relaxed), 3);
//! ```
//!
//! ## Features
//!
//! - `single-threaded`: default to [`ExecutionMode::Inline`]. No thread is
//!   spawned and submitted commands run on the submitting thread.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod command;
pub mod config;
pub mod core_thread;
pub mod error;
pub mod registry;
pub mod worker;

pub use command::{Command, CommandBatch, CommandQueue, QueueFlags};
pub use config::{ExecutionMode, SchedulerConfig};
pub use core_thread::{CoreThread, CoreThreadStats, RunState};
pub use error::{ConfigError, SchedulerError, SchedulerResult};
pub use registry::QueueRegistry;
pub use worker::{NoWorkerBudget, WorkerBudget, WorkerSlots};

pub use tandem_core::{AsyncOp, CommandError, CommandResult, FramePtr, FrameSlicePtr};
