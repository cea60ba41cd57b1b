//! # Double-Buffered Frame Allocators
//!
//! Two frame arenas, swapped by index once per simulation frame.
//!
//! ## Safety Note
//!
//! This module requires unsafe code to share arenas between the simulation
//! thread (allocating) and the core thread (reading staged payloads). The
//! rules each unsafe block relies on are listed below.

#![allow(unsafe_code)]
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────┐
//!                    │         FrameAllocs         │
//!                    │                             │
//!                    │  ┌─────────┐  ┌─────────┐   │
//!                    │  │ Arena 0 │  │ Arena 1 │   │
//!                    │  │ gen: N  │  │ gen: M  │   │
//!                    │  └────┬────┘  └────┬────┘   │
//!                    │  ┌────┴────────────┴────┐   │
//!                    │  │ Atomic Index (0/1)   │   │
//!                    │  └──────────────────────┘   │
//!                    └─────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!      ┌──────────────┐ ┌────────────┐ ┌────────────┐
//!      │ AllocHandle  │ │  FramePtr  │ │   rotate   │
//!      │ (Sim thread) │ │(Core reads)│ │ (Sim, 1/f) │
//!      └──────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Rules
//!
//! - Only the owner of the active arena allocates, through a
//!   [`FrameAllocHandle`]. One handle at a time; the handle is `!Send`.
//! - Staged payloads are addressed by [`FramePtr`], which records the arena
//!   generation. A read checks it after registering on the arena.
//! - [`FrameAllocs::rotate`] flips the index and clears the arena that becomes
//!   active, i.e. the one filled two frames ago. Its payloads must have been
//!   consumed by then; a late read reports [`FrameError::Stale`].
//! - Every read registers itself on its arena for as long as it touches
//!   payload bytes. Rotating onto an arena with a read in progress panics.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use bytemuck::Pod;

use crate::error::FrameError;
use crate::memory::FrameAlloc;

/// One arena plus its generation counter and active reader count.
struct ArenaSlot {
    arena: std::cell::UnsafeCell<FrameAlloc>,
    generation: AtomicU64,
    readers: AtomicUsize,
}

impl ArenaSlot {
    fn new(block_size: usize, owner: Option<ThreadId>) -> Self {
        let mut arena = FrameAlloc::new(block_size);
        if let Some(owner) = owner {
            arena.set_owner_thread(owner);
        }
        Self {
            arena: std::cell::UnsafeCell::new(arena),
            generation: AtomicU64::new(0),
            readers: AtomicUsize::new(0),
        }
    }
}

/// Registration of one in-progress read on an arena.
struct ReadGuard<'a> {
    slot: &'a ArenaSlot,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.slot.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pair of frame arenas rotated once per simulation frame.
///
/// ## Usage
///
/// ```rust
/// use std::thread;
/// use tandem_core::FrameAllocs;
///
/// let sim = thread::current().id();
/// let frames = FrameAllocs::new(64 * 1024, sim);
///
/// // Simulation thread stages this frame's payloads.
/// let ptr = frames.handle().stage([1.0f32, 2.0, 3.0]);
///
/// // Any thread holding the payload handle can read it back.
/// assert_eq!(frames.read(&ptr), Ok([1.0, 2.0, 3.0]));
///
/// // Next frame: the other arena becomes active.
/// frames.rotate(sim, sim);
/// ```
pub struct FrameAllocs {
    slots: [ArenaSlot; 2],
    active: AtomicUsize,
    handle_held: AtomicBool,
    frame_count: AtomicU64,
}

impl FrameAllocs {
    /// Creates both arenas; arena 0 starts active and owned by `sim_thread`.
    #[must_use]
    pub fn new(block_size: usize, sim_thread: ThreadId) -> Self {
        Self {
            slots: [
                ArenaSlot::new(block_size, Some(sim_thread)),
                ArenaSlot::new(block_size, None),
            ],
            active: AtomicUsize::new(0),
            handle_held: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
        }
    }

    /// Returns the index of the arena receiving this frame's writes.
    #[inline]
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns the number of completed rotations.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Returns the generation of arena `index` (bumped on every clear).
    ///
    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1.
    #[inline]
    #[must_use]
    pub fn generation(&self, index: usize) -> u64 {
        self.slots[index].generation.load(Ordering::Acquire)
    }

    /// Returns whether an allocation handle is currently active.
    #[inline]
    #[must_use]
    pub fn is_handle_held(&self) -> bool {
        self.handle_held.load(Ordering::Acquire)
    }

    /// Gets the allocation handle for the active arena.
    ///
    /// # Panics
    ///
    /// Panics if a handle is already held (only one allowed).
    #[must_use]
    pub fn handle(&self) -> FrameAllocHandle<'_> {
        let was_held = self.handle_held.swap(true, Ordering::AcqRel);
        assert!(
            !was_held,
            "Double frame allocator handle! Only one handle allowed at a time."
        );

        FrameAllocHandle {
            allocs: self,
            index: self.active.load(Ordering::Acquire),
            _not_send: PhantomData,
        }
    }

    /// Copies a staged payload out of its arena.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Stale`] if the arena was cleared since the
    /// payload was staged.
    pub fn read<T: Pod>(&self, ptr: &FramePtr<T>) -> Result<T, FrameError> {
        let _guard = self.begin_read(ptr.index, ptr.generation)?;
        // SAFETY: the guard was registered before the generation matched, so
        // `rotate` cannot clear this arena until the guard drops (see
        // `begin_read`). Payload bytes are written once by `stage` before the
        // pointer is handed out and never mutated afterwards.
        Ok(unsafe { ptr.ptr.as_ptr().read() })
    }

    /// Runs `f` over a staged slice without copying it.
    ///
    /// The arena counts as being read until `f` returns.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Stale`] if the arena was cleared since the
    /// slice was staged, or its generation moved while `f` ran.
    ///
    /// # Panics
    ///
    /// `f` must not rotate onto the arena it is reading; doing so panics.
    pub fn with_slice<T: Pod, R>(
        &self,
        ptr: &FrameSlicePtr<T>,
        f: impl FnOnce(&[T]) -> R,
    ) -> Result<R, FrameError> {
        let _guard = self.begin_read(ptr.index, ptr.generation)?;
        // SAFETY: as in `read`; the slice was fully written by `stage_slice`.
        let slice = unsafe { std::slice::from_raw_parts(ptr.ptr.as_ptr(), ptr.len) };
        let result = f(slice);
        self.check_generation(ptr.index, ptr.generation)?;
        Ok(result)
    }

    /// Returns the number of reads in progress on arena `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1.
    #[must_use]
    pub fn active_readers(&self, index: usize) -> usize {
        self.slots[index].readers.load(Ordering::SeqCst)
    }

    /// Registers a read on arena `index`, then checks its generation.
    ///
    /// Pairs with `rotate`, which bumps the generation before it looks at
    /// the reader count. With both sides `SeqCst`, either `rotate` sees this
    /// reader and refuses to clear, or this reader sees the new generation
    /// and backs off.
    fn begin_read(&self, index: usize, expected: u64) -> Result<ReadGuard<'_>, FrameError> {
        let slot = &self.slots[index];
        slot.readers.fetch_add(1, Ordering::SeqCst);
        let guard = ReadGuard { slot };
        self.check_generation(index, expected)?;
        Ok(guard)
    }

    /// Swaps arenas for the next frame.
    ///
    /// The newly active arena is handed to `sim_thread` and cleared; the arena
    /// that was just filled is tagged as owned by `core_thread`, which reads
    /// its payloads during the coming frame. Returns the new active index.
    ///
    /// # Panics
    ///
    /// Panics if an allocation handle is still active, or if a read of the
    /// arena about to be cleared is in progress. In the second case that
    /// arena's payloads already count as stale.
    pub fn rotate(&self, sim_thread: ThreadId, core_thread: ThreadId) -> usize {
        assert!(
            !self.handle_held.load(Ordering::Acquire),
            "Cannot rotate frame allocators while a handle is active!"
        );

        let old_active = self.active.load(Ordering::Acquire);
        let new_active = old_active ^ 1;

        let filled = &self.slots[old_active];
        let fresh = &self.slots[new_active];
        fresh.generation.fetch_add(1, Ordering::SeqCst);
        assert!(
            fresh.readers.load(Ordering::SeqCst) == 0,
            "Cannot rotate frame allocators while a payload of the recycled arena is being read!"
        );

        // SAFETY: no handle exists (checked above) and only the simulation
        // thread rotates, so nothing else holds a reference to either arena.
        // Readers never reference the arena itself, only payload bytes inside
        // its blocks. `set_owner_thread` does not touch those bytes, and no
        // reader of the fresh arena is active or can start (see `begin_read`)
        // before `clear` releases them.
        unsafe {
            (*filled.arena.get()).set_owner_thread(core_thread);
            let arena = &mut *fresh.arena.get();
            arena.set_owner_thread(sim_thread);
            arena.clear();
        }

        self.active.store(new_active, Ordering::Release);
        self.frame_count.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            active = new_active,
            frame = self.frame_count(),
            "frame allocators rotated"
        );

        new_active
    }

    fn check_generation(&self, index: usize, expected: u64) -> Result<(), FrameError> {
        let found = self.slots[index].generation.load(Ordering::SeqCst);
        if found == expected {
            Ok(())
        } else {
            Err(FrameError::Stale {
                index,
                expected,
                found,
            })
        }
    }
}

// SAFETY: arena access is partitioned by the rules in the module docs: one
// `!Send` allocation handle at a time, rotation only from the simulation
// thread, and cross-thread reads only through generation-checked pointers
// that hold a reader registration while they touch payload bytes.
unsafe impl Send for FrameAllocs {}
// SAFETY: see above.
unsafe impl Sync for FrameAllocs {}

impl std::fmt::Debug for FrameAllocs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAllocs")
            .field("active", &self.active_index())
            .field("frame_count", &self.frame_count())
            .field("handle_held", &self.is_handle_held())
            .finish()
    }
}

/// Exclusive allocation access to the active arena.
///
/// Derefs to [`FrameAlloc`]. Dropping the handle releases it so the arenas
/// can be rotated.
pub struct FrameAllocHandle<'a> {
    allocs: &'a FrameAllocs,
    index: usize,
    _not_send: PhantomData<*const ()>,
}

impl FrameAllocHandle<'_> {
    /// Returns the arena index this handle writes to.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copies `value` into the arena and returns a pointer other threads can read.
    #[must_use]
    pub fn stage<T: Pod>(&self, value: T) -> FramePtr<T> {
        let slot = self.alloc_value(value);
        FramePtr {
            ptr: NonNull::from(slot),
            index: self.index,
            generation: self.allocs.generation(self.index),
        }
    }

    /// Copies `src` into the arena and returns a pointer other threads can read.
    #[must_use]
    pub fn stage_slice<T: Pod>(&self, src: &[T]) -> FrameSlicePtr<T> {
        let slice = self.alloc_slice(src);
        let len = slice.len();
        FrameSlicePtr {
            ptr: NonNull::from(slice).cast::<T>(),
            len,
            index: self.index,
            generation: self.allocs.generation(self.index),
        }
    }
}

impl Deref for FrameAllocHandle<'_> {
    type Target = FrameAlloc;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: we hold the only handle (guaranteed by `handle_held`) and
        // rotation is blocked while it exists.
        unsafe { &*self.allocs.slots[self.index].arena.get() }
    }
}

impl Drop for FrameAllocHandle<'_> {
    fn drop(&mut self) {
        self.allocs.handle_held.store(false, Ordering::Release);
    }
}

/// A single staged payload, readable through [`FrameAllocs::read`].
pub struct FramePtr<T> {
    ptr: NonNull<T>,
    index: usize,
    generation: u64,
}

impl<T> FramePtr<T> {
    /// Returns the arena index the payload lives in.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the arena generation the payload was staged at.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Clone for FramePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FramePtr<T> {}

impl<T> std::fmt::Debug for FramePtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePtr")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

// SAFETY: `T: Pod` is plain data with no interior pointers or shared state;
// the pointer is only dereferenced through `FrameAllocs::read`.
unsafe impl<T: Pod> Send for FramePtr<T> {}
// SAFETY: see above.
unsafe impl<T: Pod> Sync for FramePtr<T> {}

/// A staged slice, readable through [`FrameAllocs::with_slice`].
pub struct FrameSlicePtr<T> {
    ptr: NonNull<T>,
    len: usize,
    index: usize,
    generation: u64,
}

impl<T> FrameSlicePtr<T> {
    /// Returns the number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the slice is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for FrameSlicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FrameSlicePtr<T> {}

impl<T> std::fmt::Debug for FrameSlicePtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlicePtr")
            .field("len", &self.len)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

// SAFETY: as for `FramePtr`.
unsafe impl<T: Pod> Send for FrameSlicePtr<T> {}
// SAFETY: see above.
unsafe impl<T: Pod> Sync for FrameSlicePtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frames() -> FrameAllocs {
        FrameAllocs::new(1024, thread::current().id())
    }

    #[test]
    fn test_frame_allocs_creation() {
        let frames = frames();
        assert_eq!(frames.active_index(), 0);
        assert_eq!(frames.frame_count(), 0);
        assert!(!frames.is_handle_held());
    }

    #[test]
    fn test_handle_released_on_drop() {
        let frames = frames();
        {
            let handle = frames.handle();
            assert!(frames.is_handle_held());
            assert_eq!(handle.index(), 0);
            let _ = handle.alloc(16);
        }
        assert!(!frames.is_handle_held());
    }

    #[test]
    fn test_stage_and_read() {
        let frames = frames();
        let ptr = frames.handle().stage(42u64);
        assert_eq!(frames.read(&ptr), Ok(42));
    }

    #[test]
    fn test_stage_slice() {
        let frames = frames();
        let ptr = frames.handle().stage_slice(&[1u32, 2, 3, 4]);
        assert_eq!(ptr.len(), 4);
        let sum = frames.with_slice(&ptr, |s| s.iter().sum::<u32>());
        assert_eq!(sum, Ok(10));
    }

    #[test]
    fn test_rotation_alternates() {
        let frames = frames();
        let me = thread::current().id();
        assert_eq!(frames.rotate(me, me), 1);
        assert_eq!(frames.rotate(me, me), 0);
        assert_eq!(frames.frame_count(), 2);
    }

    #[test]
    fn test_payload_survives_one_rotation() {
        let frames = frames();
        let me = thread::current().id();
        let ptr = frames.handle().stage(7u32);

        frames.rotate(me, me);
        assert_eq!(frames.read(&ptr), Ok(7));
    }

    #[test]
    fn test_payload_stale_after_two_rotations() {
        let frames = frames();
        let me = thread::current().id();
        let ptr = frames.handle().stage(7u32);

        frames.rotate(me, me);
        frames.rotate(me, me);
        assert_eq!(
            frames.read(&ptr),
            Err(FrameError::Stale {
                index: 0,
                expected: 0,
                found: 1,
            })
        );
    }

    #[test]
    fn test_read_from_other_thread() {
        let frames = Arc::new(frames());
        let ptr = frames.handle().stage([3i32, 1, 4, 1]);

        let reader = {
            let frames = Arc::clone(&frames);
            thread::spawn(move || frames.read(&ptr))
        };
        assert_eq!(reader.join().unwrap(), Ok([3, 1, 4, 1]));
    }

    #[test]
    #[should_panic(expected = "Double frame allocator handle")]
    fn test_double_handle_panics() {
        let frames = frames();
        let _first = frames.handle();
        let _second = frames.handle();
    }

    #[test]
    #[should_panic(expected = "Cannot rotate frame allocators while a handle is active")]
    fn test_rotate_during_handle_panics() {
        let frames = frames();
        let me = thread::current().id();
        let _handle = frames.handle();
        frames.rotate(me, me);
    }

    #[test]
    fn test_read_of_filled_arena_during_rotate() {
        let frames = frames();
        let me = thread::current().id();
        let ptr = frames.handle().stage_slice(&[5u8; 64]);

        // This flip recycles arena 1, so arena 0 may be read across it.
        let sum = frames.with_slice(&ptr, |s| {
            assert_eq!(frames.active_readers(0), 1);
            frames.rotate(me, me);
            s.iter().map(|&b| u32::from(b)).sum::<u32>()
        });
        assert_eq!(sum, Ok(320));
        assert_eq!(frames.active_readers(0), 0);
    }

    #[test]
    #[should_panic(expected = "payload of the recycled arena is being read")]
    fn test_recycling_arena_under_slice_read_panics() {
        let frames = FrameAllocs::new(64, thread::current().id());
        let me = thread::current().id();
        let ptr = {
            let handle = frames.handle();
            let _ = handle.alloc(48);
            // Does not fit the first block, so it lands in a chained block
            // that clearing the arena would free.
            handle.stage_slice(&[9u64; 16])
        };
        assert!(frames.handle().block_count() > 1);

        let _ = frames.with_slice(&ptr, |s| {
            frames.rotate(me, me);
            frames.rotate(me, me);
            s.iter().sum::<u64>()
        });
    }

    #[test]
    fn test_reader_released_after_stale_read() {
        let frames = frames();
        let me = thread::current().id();
        let ptr = frames.handle().stage(1u16);
        frames.rotate(me, me);
        frames.rotate(me, me);

        assert!(frames.read(&ptr).is_err());
        assert_eq!(frames.active_readers(0), 0);
        assert_eq!(frames.active_readers(1), 0);
    }
}
