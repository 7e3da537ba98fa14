//! Host-side platform double for unit tests

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::platform::HostPlatform;

type Hook = Box<dyn Fn() + Send + Sync>;

/// Virtual clock that advances one millisecond per yield
pub struct TestPlatform {
    clock: AtomicU64,
    pub doorbells: Mutex<Vec<(u8, u32)>>,
    pub event_dequeues: Mutex<Vec<u64>>,
    pub command_ring: Mutex<Option<(u64, bool)>>,
    pub event_ring: Mutex<Option<(u64, u32, u64)>>,
    pub dcbaa: Mutex<Option<(u64, u8)>>,
    yield_hook: Mutex<Option<Hook>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            doorbells: Mutex::new(Vec::new()),
            event_dequeues: Mutex::new(Vec::new()),
            command_ring: Mutex::new(None),
            event_ring: Mutex::new(None),
            dcbaa: Mutex::new(None),
            yield_hook: Mutex::new(None),
        }
    }

    /// Run `hook` on every yield, standing in for an interrupt
    pub fn set_yield_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.yield_hook.lock() = Some(Box::new(hook));
    }

    pub fn doorbell_count(&self) -> usize {
        self.doorbells.lock().len()
    }
}

impl HostPlatform for TestPlatform {
    fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn yield_now(&self) {
        self.clock.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.yield_hook.lock().as_ref() {
            hook();
        }
    }

    fn ring_doorbell(&self, slot_id: u8, target: u32) {
        self.doorbells.lock().push((slot_id, target));
    }

    fn set_command_ring(&self, dequeue: u64, cycle_state: bool) {
        *self.command_ring.lock() = Some((dequeue, cycle_state));
    }

    fn set_event_ring(&self, segment_table: u64, segment_count: u32, dequeue: u64) {
        *self.event_ring.lock() = Some((segment_table, segment_count, dequeue));
    }

    fn write_event_dequeue(&self, dequeue: u64) {
        self.event_dequeues.lock().push(dequeue);
    }

    fn set_device_context_base(&self, dcbaa: u64, max_slots: u8) {
        *self.dcbaa.lock() = Some((dcbaa, max_slots));
    }
}
