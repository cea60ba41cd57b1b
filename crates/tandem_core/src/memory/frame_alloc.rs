//! # Frame Allocator
//!
//! A bump allocator for transient per-frame payloads that are freed all at once.
//!
//! ## Safety Note
//!
//! Allocation hands out `&mut` slices from `&self`, which needs raw block
//! memory. Every block is allocated zeroed and never moves or shrinks until
//! [`FrameAlloc::clear`] or drop, both of which take `&mut self`.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::thread::{self, ThreadId};

use bytemuck::Pod;

/// Default size of a single block (1 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Alignment used by [`FrameAlloc::alloc`].
pub const DEFAULT_ALIGN: usize = 16;

/// Alignment of every block's base address.
const BLOCK_ALIGN: usize = 64;

/// One contiguous chunk of arena memory.
struct MemBlock {
    data: NonNull<u8>,
    size: usize,
    free_ptr: usize,
}

impl MemBlock {
    fn new(size: usize) -> Self {
        let size = size.max(BLOCK_ALIGN);
        let layout = Self::layout(size);
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(data) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        Self {
            data,
            size,
            free_ptr: 0,
        }
    }

    fn layout(size: usize) -> Layout {
        let Ok(layout) = Layout::from_size_align(size, BLOCK_ALIGN) else {
            panic!("frame block of {size} bytes exceeds the address space");
        };
        layout
    }

    /// Reserves `size` bytes aligned to `align`, or `None` if they don't fit.
    fn try_bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.data.as_ptr() as usize;
        let start = base.checked_add(self.free_ptr)?.checked_add(align - 1)? & !(align - 1);
        let offset = start - base;
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.free_ptr = end;
        // SAFETY: `offset <= end <= self.size`, so the pointer stays inside the block.
        Some(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset)) })
    }
}

/// Position saved by [`FrameAlloc::mark_frame`].
#[derive(Clone, Copy, Debug)]
struct FrameMark {
    blocks: usize,
    free_ptr: usize,
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        // SAFETY: `data` came from `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.data.as_ptr(), Self::layout(self.size)) };
    }
}

// SAFETY: a block exclusively owns its heap memory.
unsafe impl Send for MemBlock {}

/// A bump-pointer frame allocator.
///
/// Allocations are a pointer bump inside the current block; when a block is
/// exhausted a new one is chained on. Nothing is freed individually: `clear`
/// releases everything at once and coalesces the chain into a single block so
/// the next frame of the same size needs no growth.
///
/// # Thread Safety
///
/// `FrameAlloc` is `Send` but not `Sync`. It carries an owner-thread tag;
/// in debug builds, allocating or clearing from any other thread panics.
///
/// # Example
///
/// ```rust
/// use tandem_core::FrameAlloc;
///
/// let mut arena = FrameAlloc::new(4096);
///
/// let bytes = arena.alloc(64);
/// bytes[0] = 7;
/// let value = arena.alloc_value(42u32);
/// assert_eq!(*value, 42);
///
/// arena.clear();
/// assert_eq!(arena.used(), 0);
/// ```
pub struct FrameAlloc {
    blocks: UnsafeCell<Vec<MemBlock>>,
    marks: Vec<FrameMark>,
    block_size: usize,
    owner: Option<ThreadId>,
}

impl FrameAlloc {
    /// Creates an empty allocator whose blocks are at least `block_size` bytes.
    ///
    /// No memory is reserved until the first allocation.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: UnsafeCell::new(Vec::new()),
            marks: Vec::new(),
            block_size: block_size.max(BLOCK_ALIGN),
            owner: None,
        }
    }

    /// Returns the minimum size of a newly chained block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Records the thread that is expected to be the sole user of this arena.
    pub fn set_owner_thread(&mut self, owner: ThreadId) {
        self.owner = Some(owner);
    }

    /// Returns the current owner tag, if any.
    #[inline]
    #[must_use]
    pub const fn owner_thread(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Allocates `size` bytes aligned to [`DEFAULT_ALIGN`].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, size: usize) -> &mut [u8] {
        self.alloc_aligned(size, DEFAULT_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// The bytes are initialized but their contents are unspecified (zero for
    /// a fresh block, leftovers from a previous frame otherwise).
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two, or in debug builds if called
    /// from a thread other than the owner. Aborts if the system is out of memory.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_aligned(&self, size: usize, align: usize) -> &mut [u8] {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.check_owner();

        // SAFETY: the arena is `!Sync` and this is the only `&self` method
        // that touches the block list, so no other reference to it exists.
        let blocks = unsafe { &mut *self.blocks.get() };

        let ptr = match blocks.last_mut().and_then(|b| b.try_bump(size, align)) {
            Some(ptr) => ptr,
            None => {
                let Some(needed) = size.checked_add(align) else {
                    panic!("frame allocation of {size} bytes exceeds the address space");
                };
                let mut block = MemBlock::new(self.block_size.max(needed));
                let Some(ptr) = block.try_bump(size, align) else {
                    unreachable!("fresh block is sized for the request");
                };
                blocks.push(block);
                ptr
            }
        };

        // SAFETY: `ptr` covers `size` initialized bytes that no other
        // allocation overlaps. They stay valid until `clear` or drop, which
        // both need `&mut self` and so end this borrow first.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) }
    }

    /// Copies `value` into the arena and returns a reference to it.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T: Pod>(&self, value: T) -> &mut T {
        let bytes = self.alloc_aligned(std::mem::size_of::<T>(), std::mem::align_of::<T>());
        let slot: &mut T = bytemuck::from_bytes_mut(bytes);
        *slot = value;
        slot
    }

    /// Copies `src` into the arena and returns the copy.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice<T: Pod>(&self, src: &[T]) -> &mut [T] {
        let bytes = self.alloc_aligned(std::mem::size_of_val(src), std::mem::align_of::<T>());
        let dst: &mut [T] = bytemuck::cast_slice_mut(bytes);
        dst.copy_from_slice(src);
        dst
    }

    /// Opens a nested frame.
    ///
    /// The next [`clear`](Self::clear) only releases what was allocated after
    /// this call, leaving earlier allocations intact.
    pub fn mark_frame(&mut self) {
        self.check_owner();
        let blocks = self.blocks.get_mut();
        let free_ptr = blocks.last().map_or(0, |b| b.free_ptr);
        self.marks.push(FrameMark {
            blocks: blocks.len(),
            free_ptr,
        });
    }

    /// Returns the number of open nested frames.
    #[inline]
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.marks.len()
    }

    /// Closes the innermost nested frame, or resets the whole arena if none
    /// is open. Either way the released allocations become invalid.
    ///
    /// On a full reset, if the last frame needed more than one block, the
    /// chain is replaced by a single block of the combined size.
    pub fn clear(&mut self) {
        self.check_owner();
        let blocks = self.blocks.get_mut();
        if let Some(mark) = self.marks.pop() {
            blocks.truncate(mark.blocks);
            if let Some(last) = blocks.last_mut() {
                last.free_ptr = mark.free_ptr;
            }
            return;
        }
        match blocks.len() {
            0 => {}
            1 => blocks[0].free_ptr = 0,
            _ => {
                let total: usize = blocks.iter().map(|b| b.size).sum();
                blocks.clear();
                blocks.push(MemBlock::new(total));
            }
        }
    }

    /// Returns the number of bytes handed out since the last clear, including padding.
    #[must_use]
    pub fn used(&self) -> usize {
        self.with_blocks(|blocks| blocks.iter().map(|b| b.free_ptr).sum())
    }

    /// Returns the total reserved capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.with_blocks(|blocks| blocks.iter().map(|b| b.size).sum())
    }

    /// Returns the number of chained blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.with_blocks(Vec::len)
    }

    fn with_blocks<R>(&self, f: impl FnOnce(&Vec<MemBlock>) -> R) -> R {
        // SAFETY: the arena is `!Sync` and no `&mut` to the block list
        // outlives a call to `alloc_aligned`.
        f(unsafe { &*self.blocks.get() })
    }

    #[inline]
    fn check_owner(&self) {
        if cfg!(debug_assertions) {
            if let Some(owner) = self.owner {
                assert_eq!(
                    owner,
                    thread::current().id(),
                    "frame allocator used from a thread that does not own it"
                );
            }
        }
    }
}

impl Default for FrameAlloc {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl std::fmt::Debug for FrameAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAlloc")
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("blocks", &self.block_count())
            .field("depth", &self.marks.len())
            .field("owner", &self.owner)
            .finish()
    }
}
