//! Transactions waiting for their scheduled frame

use alloc::vec::Vec;

use super::arena::HandleList;
use crate::{
    arch::ExecutionLevel,
    device::DeviceId,
    error::HcdResult,
    frame::frame_number_greater,
    sync::IrqSpinLock,
};

struct Entry<T> {
    item: T,
    owner: DeviceId,
    frame: u16,
}

/// Pending transactions ordered by the frame they are due in
///
/// Entries due in the same frame keep their insertion order.
pub struct TransactionQueue<T> {
    entries: IrqSpinLock<HandleList<Entry<T>>>,
}

impl<T> TransactionQueue<T> {
    pub fn new(capacity: usize, level: ExecutionLevel) -> HcdResult<Self> {
        Ok(Self {
            entries: IrqSpinLock::new(level, HandleList::with_capacity(capacity)?),
        })
    }

    /// Schedule `item` for `frame`; hands it back if the queue is full
    pub fn enqueue(&self, item: T, owner: DeviceId, frame: u16) -> Result<(), T> {
        let entry = Entry { item, owner, frame };
        self.entries
            .lock()
            .insert_before(entry, |queued| frame_number_greater(queued.frame, frame))
            .map_err(|entry| entry.item)
    }

    /// Earliest transaction that is due at `current_frame`
    pub fn dequeue(&self, current_frame: u16) -> Option<T> {
        let mut entries = self.entries.lock();
        let due = entries
            .front()
            .is_some_and(|head| !frame_number_greater(head.frame, current_frame));
        if !due {
            return None;
        }
        entries.pop_front().map(|entry| entry.item)
    }

    /// Frame the head entry is scheduled for
    pub fn next_frame(&self) -> Option<u16> {
        self.entries.lock().front().map(|entry| entry.frame)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every queued transaction; returns how many were dropped
    pub fn flush(&self) -> usize {
        self.drop_matching(|_| true)
    }

    /// Drop the transactions of a detaching device
    pub fn flush_owner(&self, owner: DeviceId) -> usize {
        self.drop_matching(|entry| entry.owner == owner)
    }

    fn drop_matching(&self, matches: impl FnMut(&Entry<T>) -> bool) -> usize {
        let removed: Vec<Entry<T>> = self.entries.lock().drain_matching(matches);
        // Items are dropped after the lock is released
        removed.len()
    }
}
