//! # Worker Budget
//!
//! The core thread is one more thread competing for CPU with the engine's
//! task pool. A [`WorkerBudget`] lets it give its slot back while it sleeps
//! on an empty queue and take it again when it wakes, so the pool can run
//! one extra task in the meantime.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Seam to a cooperative task scheduler's worker accounting.
pub trait WorkerBudget: Send + Sync {
    /// Claims a worker slot for the calling thread.
    fn reserve_worker(&self);

    /// Returns the calling thread's worker slot to the pool.
    fn release_worker(&self);
}

/// Budget for engines without a task pool. Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWorkerBudget;

impl WorkerBudget for NoWorkerBudget {
    #[inline]
    fn reserve_worker(&self) {}

    #[inline]
    fn release_worker(&self) {}
}

/// Counting budget: a fixed number of slots shared by every worker.
///
/// `available` can go negative when more threads reserve than there are
/// slots; a pool would treat that as oversubscription, not an error.
#[derive(Debug)]
pub struct WorkerSlots {
    available: AtomicIsize,
    total: isize,
}

impl WorkerSlots {
    /// Creates a budget with `total` free slots.
    #[must_use]
    pub fn new(total: usize) -> Self {
        let total = isize::try_from(total).unwrap_or(isize::MAX);
        Self {
            available: AtomicIsize::new(total),
            total,
        }
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> isize {
        self.available.load(Ordering::Acquire)
    }

    /// Slots this budget was created with.
    #[must_use]
    pub fn total(&self) -> isize {
        self.total
    }
}

impl WorkerBudget for WorkerSlots {
    fn reserve_worker(&self) {
        self.available.fetch_sub(1, Ordering::AcqRel);
    }

    fn release_worker(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}
