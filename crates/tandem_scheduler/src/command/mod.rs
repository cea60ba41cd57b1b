//! Deferred commands and the queues that hold them.

mod flags;
mod queue;

pub use flags::QueueFlags;
pub use queue::{Command, CommandBatch, CommandQueue};
