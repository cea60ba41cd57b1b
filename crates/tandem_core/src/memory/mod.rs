//! # Memory Management
//!
//! Frame arenas for payloads that cross from the simulation thread to the
//! core thread.
//!
//! ## Design Philosophy
//!
//! Memory is reserved in large blocks and reused every frame:
//! - No per-payload heap allocations
//! - No per-payload frees
//! - Capacity settles after the first few frames

mod frame_alloc;

pub use frame_alloc::{FrameAlloc, DEFAULT_ALIGN, DEFAULT_BLOCK_SIZE};
