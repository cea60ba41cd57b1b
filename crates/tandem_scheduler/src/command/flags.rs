//! Queue flags for [`CoreThread::queue_command`](crate::CoreThread::queue_command).

use bitflags::bitflags;

bitflags! {
    /// Controls where a command is queued and whether the caller waits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueFlags: u8 {
        /// Skip the caller's per-thread queue and hand the command straight
        /// to the core thread.
        const INTERNAL_QUEUE = 1 << 0;
        /// Return only after the command has run on the core thread.
        const BLOCK_UNTIL_COMPLETE = 1 << 1;
    }
}

impl QueueFlags {
    /// Internal queue, blocking.
    pub const INTERNAL_BLOCKING: Self =
        Self::INTERNAL_QUEUE.union(Self::BLOCK_UNTIL_COMPLETE);

    /// Returns true if the command bypasses the per-thread queue.
    #[inline]
    #[must_use]
    pub const fn is_internal(self) -> bool {
        self.contains(Self::INTERNAL_QUEUE)
    }

    /// Returns true if the caller waits for completion.
    #[inline]
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        self.contains(Self::BLOCK_UNTIL_COMPLETE)
    }
}
