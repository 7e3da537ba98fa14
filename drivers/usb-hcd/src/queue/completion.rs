//! Finished requests waiting for task-level dispatch

use alloc::vec::Vec;

use super::arena::HandleList;
use crate::{arch::ExecutionLevel, device::DeviceId, error::HcdResult, sync::IrqSpinLock};

struct Entry<T> {
    item: T,
    owner: DeviceId,
}

/// FIFO filled from interrupt context and drained at task level
pub struct CompletionQueue<T> {
    entries: IrqSpinLock<HandleList<Entry<T>>>,
}

impl<T> CompletionQueue<T> {
    pub fn new(capacity: usize, level: ExecutionLevel) -> HcdResult<Self> {
        Ok(Self {
            entries: IrqSpinLock::new(level, HandleList::with_capacity(capacity)?),
        })
    }

    pub fn enqueue(&self, item: T, owner: DeviceId) -> Result<(), T> {
        self.entries
            .lock()
            .push_back(Entry { item, owner })
            .map_err(|entry| entry.item)
    }

    pub fn dequeue(&self) -> Option<T> {
        self.entries.lock().pop_front().map(|entry| entry.item)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn flush(&self) -> usize {
        let removed: Vec<Entry<T>> = self.entries.lock().drain_matching(|_| true);
        removed.len()
    }

    /// Drop the completions of a detaching device without dispatching them
    pub fn flush_owner(&self, owner: DeviceId) -> usize {
        let removed: Vec<Entry<T>> = self
            .entries
            .lock()
            .drain_matching(|entry| entry.owner == owner);
        removed.len()
    }
}
