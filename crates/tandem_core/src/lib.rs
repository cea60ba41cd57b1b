//! # TANDEM Core
//!
//! Building blocks for handing work from the simulation thread to the core
//! (render) thread:
//! - Frame allocators for transient per-frame payloads
//! - Completion notifications for blocking submission
//! - Async operation handles for commands that return a value
//!
//! ## Architecture Rules
//!
//! 1. **No per-payload heap traffic** - payloads are bumped into frame arenas
//! 2. **Single owner per arena** - ownership moves with the frame rotation
//! 3. **Nobody waits forever** - abandoned work resolves with an error
//!
//! ## Example
//!
//! ```rust
//! use tandem_core::{async_op, NotificationRegistry};
//!
//! let registry = NotificationRegistry::new();
//! let id = registry.allocate_id();
//! registry.notify_completed(id);
//! assert!(registry.block_until_completed(id).is_ok());
//!
//! let (op, completer) = async_op::<u32>();
//! completer.complete(Ok(5));
//! assert_eq!(op.wait(), Ok(5));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod memory;
pub mod sync;

pub use error::{CommandError, CommandResult, FrameError, NotificationError};
pub use memory::{FrameAlloc, DEFAULT_ALIGN, DEFAULT_BLOCK_SIZE};
pub use sync::{
    async_op, AsyncOp, AsyncOpCompleter, FrameAllocHandle, FrameAllocs, FramePtr, FrameSlicePtr,
    NotificationId, NotificationRegistry,
};
