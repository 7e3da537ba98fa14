//! TRB rings shared with the controller
//!
//! Transfer and command rings are produced by software and consumed by the
//! controller. Their last TRB is a Link TRB pointing back to the base with
//! toggle-cycle set, so the producer cycle state flips on every traversal.
//!
//! The event ring is produced by the controller. Software detects new entries
//! by comparing each TRB's cycle bit with the ring's consumer cycle state,
//! which flips whenever the dequeue index wraps.
//!
//! Producer rings track the consumer position by index: the owner calls
//! [`Ring::increment_dequeue`] once per TRB the controller has reported as
//! consumed. One TRB is always kept free so that a full ring can be told
//! apart from an empty one.

use crate::{
    arch,
    config::validate_ring_size,
    dma::{DmaBuffer, DMA_ALIGN, DMA_BOUNDARY},
    error::{HcdError, HcdResult},
    platform::HostPlatform,
    trb::{Trb, TrbControl, TRB_SIZE},
};

/// Who produces and who consumes the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingType {
    Transfer,
    Command,
    Event,
}

impl RingType {
    /// Software writes TRBs, the controller reads them
    pub fn is_producer(self) -> bool {
        !matches!(self, RingType::Event)
    }
}

pub struct Ring {
    ring_type: RingType,
    memory: DmaBuffer,
    /// Bus address of TRB 0
    base: u64,
    trb_count: usize,
    enqueue: usize,
    dequeue: usize,
    cycle_state: bool,
}

impl Ring {
    /// Allocate a ring of `trb_count` TRBs, including the Link TRB of
    /// producer rings
    pub fn new(ring_type: RingType, trb_count: usize, platform: &dyn HostPlatform) -> HcdResult<Self> {
        validate_ring_size("trb_count", trb_count)?;
        let size = trb_count * TRB_SIZE;
        if size > DMA_BOUNDARY {
            return Err(HcdError::InvalidArgument {
                name: "trb_count",
                value: "ring does not fit in one 64 KiB segment",
            });
        }

        let memory = DmaBuffer::new(size, DMA_ALIGN, DMA_BOUNDARY)?;
        let base = platform.dma_address(memory.addr());

        let ring = Self {
            ring_type,
            memory,
            base,
            trb_count,
            enqueue: 0,
            dequeue: 0,
            cycle_state: true,
        };

        if ring_type.is_producer() {
            ring.write(trb_count - 1, Trb::link(base));
        }

        Ok(ring)
    }

    pub fn ring_type(&self) -> RingType {
        self.ring_type
    }

    pub fn trb_count(&self) -> usize {
        self.trb_count
    }

    /// Usable TRB positions (the Link TRB is not one of them)
    pub fn capacity(&self) -> usize {
        if self.ring_type.is_producer() {
            self.trb_count - 1
        } else {
            self.trb_count
        }
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    /// Bus address of the first TRB
    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn trb_address(&self, index: usize) -> u64 {
        self.base + (index * TRB_SIZE) as u64
    }

    pub fn enqueue_address(&self) -> u64 {
        self.trb_address(self.enqueue)
    }

    pub fn dequeue_address(&self) -> u64 {
        self.trb_address(self.dequeue)
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue
    }

    /// Index of the TRB at bus address `address`, if it lies in this ring
    pub fn index_of(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(self.base)? as usize;
        if offset % TRB_SIZE != 0 || offset / TRB_SIZE >= self.trb_count {
            return None;
        }
        Some(offset / TRB_SIZE)
    }

    /// TRBs handed to the controller and not yet released
    pub fn outstanding(&self) -> usize {
        debug_assert!(self.ring_type.is_producer());
        let capacity = self.capacity();
        (self.enqueue + capacity - self.dequeue) % capacity
    }

    /// TRBs that can still be enqueued before the ring is full
    pub fn free_slots(&self) -> usize {
        self.capacity() - 1 - self.outstanding()
    }

    pub fn is_full(&self) -> bool {
        self.next_index(self.enqueue) == self.dequeue
    }

    pub fn read(&self, index: usize) -> Trb {
        let trb = self.memory.read::<Trb>(index * TRB_SIZE);
        arch::read_barrier();
        trb
    }

    /// Store a TRB so that the control word (with the cycle bit) becomes
    /// visible last
    pub(crate) fn write(&self, index: usize, trb: Trb) {
        let offset = index * TRB_SIZE;
        self.memory.write::<u32>(offset, trb.parameter1);
        self.memory.write::<u32>(offset + 4, trb.parameter2);
        self.memory.write::<u32>(offset + 8, trb.status);
        arch::write_barrier();
        self.memory.write::<u32>(offset + 12, trb.control);
    }

    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Address of the next free TRB, or `None` if the ring is full
    pub fn get_enqueue_trb(&self) -> Option<u64> {
        assert!(self.ring_type.is_producer(), "enqueue on event ring");
        if self.is_full() {
            return None;
        }
        Some(self.enqueue_address())
    }

    /// Write `trb` with the current cycle bit and advance
    ///
    /// Returns the bus address the TRB was written to, or `None` without any
    /// change if the ring is full.
    pub fn enqueue(&mut self, trb: Trb) -> Option<u64> {
        let address = self.get_enqueue_trb()?;
        let mut trb = trb;
        trb.set_cycle(self.cycle_state);
        self.write(self.enqueue, trb);
        self.increment_enqueue();
        Some(address)
    }

    /// Advance past the TRB just written, following the Link TRB on wrap
    ///
    /// The Link TRB takes over the CHAIN bit of the TRB before it, so a TD
    /// that continues at the ring base stays one TD for the controller.
    pub fn increment_enqueue(&mut self) {
        assert!(self.ring_type.is_producer(), "enqueue on event ring");
        self.enqueue += 1;

        let link_index = self.trb_count - 1;
        if self.enqueue == link_index {
            let chained = self.read(link_index - 1).flags().contains(TrbControl::CHAIN);
            let mut link = self.read(link_index);
            link.set_chain(chained);
            link.set_cycle(self.cycle_state);
            self.write(link_index, link);

            if link.flags().contains(TrbControl::TOGGLE_CYCLE) {
                self.cycle_state = !self.cycle_state;
            }
            self.enqueue = 0;
        }
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Next TRB for the consumer
    ///
    /// Event ring: the entry at the dequeue pointer if the controller has
    /// produced it (cycle bit matches). Producer rings: the oldest TRB not
    /// yet released.
    pub fn get_dequeue_trb(&self) -> Option<Trb> {
        match self.ring_type {
            RingType::Event => {
                let trb = self.read(self.dequeue);
                (trb.cycle() == self.cycle_state).then_some(trb)
            }
            _ => (self.dequeue != self.enqueue).then(|| self.read(self.dequeue)),
        }
    }

    /// Consume one TRB and return the new dequeue address
    pub fn increment_dequeue(&mut self) -> u64 {
        match self.ring_type {
            RingType::Event => {
                self.dequeue += 1;
                if self.dequeue == self.trb_count {
                    self.dequeue = 0;
                    self.cycle_state = !self.cycle_state;
                }
            }
            _ => {
                assert!(
                    self.dequeue != self.enqueue,
                    "{:?} ring: release without outstanding TRB",
                    self.ring_type
                );
                self.dequeue = self.next_index(self.dequeue);
            }
        }
        self.dequeue_address()
    }

    /// Release `count` consumed TRBs of a producer ring
    pub fn release(&mut self, count: usize) {
        for _ in 0..count {
            self.increment_dequeue();
        }
    }

    /// Whether the TRB at `index` has been enqueued and not yet released
    pub fn is_outstanding(&self, index: usize) -> bool {
        let capacity = self.capacity();
        index < capacity && (index + capacity - self.dequeue) % capacity < self.outstanding()
    }

    /// Release every outstanding TRB up to and including the one at bus
    /// address `address`
    ///
    /// Returns the number of TRBs released; 0 if `address` is not an
    /// outstanding TRB of this ring.
    pub fn release_through(&mut self, address: u64) -> usize {
        let Some(index) = self.index_of(address) else {
            return 0;
        };
        if !self.is_outstanding(index) {
            return 0;
        }

        let mut released = 0;
        loop {
            let last = self.dequeue == index;
            self.increment_dequeue();
            released += 1;
            if last {
                return released;
            }
        }
    }
}

impl core::fmt::Debug for Ring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("type", &self.ring_type)
            .field("base", &format_args!("{:#x}", self.base))
            .field("trb_count", &self.trb_count)
            .field("enqueue", &self.enqueue)
            .field("dequeue", &self.dequeue)
            .field("cycle_state", &self.cycle_state)
            .finish()
    }
}
