//! # Cross-Thread Synchronization Primitives
//!
//! ## The Problem
//!
//! ```text
//! Sim thread:   queue commands, stage per-frame payloads, sometimes WAIT
//! Core thread:  run commands, read staged payloads, report completion
//! ```
//!
//! ## The Pieces
//!
//! - [`NotificationRegistry`]: one-shot completion slot per blocking submit
//! - [`AsyncOp`]: result handle for commands that return a value
//! - [`FrameAllocs`]: two frame arenas swapped by index every frame

mod async_op;
mod frame_buffers;
mod notification;

pub use async_op::{async_op, AsyncOp, AsyncOpCompleter};
pub use frame_buffers::{FrameAllocHandle, FrameAllocs, FramePtr, FrameSlicePtr};
pub use notification::{NotificationId, NotificationRegistry};
