//! Platform services the host controller core depends on
//!
//! Implementations wrap the controller's MMIO registers and the kernel's
//! timer and scheduler. One instance is shared by all managers of a
//! controller via `Arc<dyn HostPlatform>`, so interrupt stubs reach the
//! controller through their registration context instead of a static.

/// Register-level and scheduler services used by the xHCI managers
pub trait HostPlatform: Send + Sync {
    /// Monotonic time in milliseconds
    fn now_ms(&self) -> u64;

    /// Give up the CPU until the scheduler resumes this task
    ///
    /// Called by tasks waiting for a completion signalled from interrupt
    /// context. On a single-core system without a scheduler this may wait
    /// for the next interrupt.
    fn yield_now(&self);

    /// Write a doorbell register
    ///
    /// Slot 0 is the host controller doorbell (command ring, target 0).
    /// Device slots use the endpoint ID (DCI) as target.
    fn ring_doorbell(&self, slot_id: u8, target: u32);

    /// Program the command ring control register with the ring base and
    /// initial cycle state
    fn set_command_ring(&self, dequeue: u64, cycle_state: bool);

    /// Program interrupter 0: segment table size and base, initial dequeue
    /// pointer, and enable interrupts
    fn set_event_ring(&self, segment_table: u64, segment_count: u32, dequeue: u64);

    /// Write the event ring dequeue pointer and clear the handler busy flag
    fn write_event_dequeue(&self, dequeue: u64);

    /// Program the device context base address array pointer and the number
    /// of enabled slots
    fn set_device_context_base(&self, dcbaa: u64, max_slots: u8);

    /// Translate a CPU address of DMA memory to the bus address the
    /// controller uses
    fn dma_address(&self, cpu_address: usize) -> u64 {
        cpu_address as u64
    }
}
