//! # Completion Notifications
//!
//! Lets a blocking caller wait for one specific command to finish.
//!
//! Every issued id owns a one-shot completion slot: a bounded channel of
//! capacity one. The core thread sends on it when the tagged command has
//! run; the waiter receives from it. Because the message is buffered, it
//! makes no difference whether completion is reported before or after the
//! wait begins.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::NotificationError;

/// Token correlating a blocking submission with its completion signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(u32);

impl NotificationId {
    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-shot completion slot. Each half is taken exactly once.
struct Slot {
    sender: Option<Sender<()>>,
    receiver: Option<Receiver<()>>,
}

impl Slot {
    fn is_spent(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

/// Registry of in-flight notification ids.
///
/// ## Usage
///
/// ```rust
/// use tandem_core::NotificationRegistry;
///
/// let registry = NotificationRegistry::new();
/// let id = registry.allocate_id();
///
/// // Completion may arrive before anyone waits.
/// registry.notify_completed(id);
/// registry.block_until_completed(id).unwrap();
/// ```
pub struct NotificationRegistry {
    next_id: AtomicU32,
    slots: Mutex<HashMap<NotificationId, Slot>>,
}

impl NotificationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh id and its completion slot.
    ///
    /// Ids increase monotonically (wrapping at `u32::MAX`).
    pub fn allocate_id(&self) -> NotificationId {
        let id = NotificationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = bounded(1);
        self.slots.lock().insert(
            id,
            Slot {
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
        id
    }

    /// Reports that the command tagged with `id` has run.
    ///
    /// Returns false if the id is unknown or was already reported.
    pub fn notify_completed(&self, id: NotificationId) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return false;
        };
        let Some(sender) = slot.sender.take() else {
            return false;
        };
        // Capacity one and a single sender: this never blocks.
        let _ = sender.try_send(());
        if slot.is_spent() {
            slots.remove(&id);
        }
        true
    }

    /// Blocks until the command tagged with `id` has run.
    ///
    /// Each id can be waited on once; the slot is released afterwards.
    ///
    /// # Errors
    ///
    /// - [`NotificationError::Unknown`] if the id was never issued or has
    ///   already been consumed.
    /// - [`NotificationError::Cancelled`] if [`cancel_all`](Self::cancel_all)
    ///   ran before the id completed.
    pub fn block_until_completed(&self, id: NotificationId) -> Result<(), NotificationError> {
        let receiver = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(&id).ok_or(NotificationError::Unknown(id))?;
            let receiver = slot.receiver.take().ok_or(NotificationError::Unknown(id))?;
            if slot.is_spent() {
                slots.remove(&id);
            }
            receiver
        };

        receiver
            .recv()
            .map_err(|_| NotificationError::Cancelled(id))
    }

    /// Drops every outstanding completion sender.
    ///
    /// Current and future waiters on ids that have not completed get
    /// [`NotificationError::Cancelled`]; ids that already completed still
    /// report success.
    pub fn cancel_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut cancelled = 0;
        for slot in slots.values_mut() {
            if slot.sender.take().is_some() {
                cancelled += 1;
            }
        }
        slots.retain(|_, slot| !slot.is_spent());
        cancelled
    }

    /// Returns the number of ids not yet fully consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}
