//! Event ring draining
//!
//! Runs in the controller's interrupt handler. Each valid event TRB is taken
//! off the ring under the ring lock; the event itself is dispatched after the
//! lock has been released, so command and endpoint handlers never run with
//! the event ring locked.

use alloc::sync::Arc;

use log::{error, trace, warn};

use crate::{
    arch::ExecutionLevel,
    command::CommandManager,
    config::HcdConfig,
    dma::{DmaBuffer, DMA_ALIGN, DMA_BOUNDARY},
    endpoint::TransferEvent,
    error::HcdResult,
    platform::HostPlatform,
    ring::{Ring, RingType},
    slot::SlotManager,
    sync::IrqSpinLock,
    trb::{CompletionCode, Trb, TrbType},
};

/// Size of one event ring segment table entry
const ERST_ENTRY_SIZE: usize = 16;

/// Receiver of port status change events (the root hub)
pub trait PortStatusListener: Send + Sync {
    fn port_status_changed(&self, port_id: u8);
}

pub struct EventManager {
    platform: Arc<dyn HostPlatform>,
    ring: IrqSpinLock<Ring>,
    /// Single-entry event ring segment table
    segment_table: DmaBuffer,
    max_events: usize,
}

impl EventManager {
    /// Allocate the event ring and its segment table and program interrupter 0
    pub fn new(platform: Arc<dyn HostPlatform>, config: &HcdConfig) -> HcdResult<Self> {
        let ring = Ring::new(RingType::Event, config.event_ring_size, &*platform)?;
        let segment_table = DmaBuffer::new(ERST_ENTRY_SIZE, DMA_ALIGN, DMA_BOUNDARY)?;

        segment_table.write::<u64>(0, ring.base_address());
        segment_table.write::<u32>(8, ring.trb_count() as u32);
        segment_table.write::<u32>(12, 0);

        platform.set_event_ring(
            platform.dma_address(segment_table.addr()),
            1,
            ring.base_address(),
        );

        Ok(Self {
            platform,
            ring: IrqSpinLock::new(ExecutionLevel::Irq, ring),
            segment_table,
            max_events: config.max_events_per_interrupt,
        })
    }

    /// Whether the controller has produced an event not yet handled
    pub fn has_pending(&self) -> bool {
        self.ring.lock().get_dequeue_trb().is_some()
    }

    /// Bus address of the first event ring TRB
    pub fn ring_base(&self) -> u64 {
        self.ring.lock().base_address()
    }

    pub fn segment_table_addr(&self) -> usize {
        self.segment_table.addr()
    }

    /// Take the next valid event off the ring
    fn next_event(&self) -> Option<(Trb, u64)> {
        let mut ring = self.ring.lock();
        let trb = ring.get_dequeue_trb()?;
        let dequeue = ring.increment_dequeue();
        Some((trb, dequeue))
    }

    /// Handle up to the configured number of events
    ///
    /// Returns the new dequeue pointer, which has also been written to the
    /// controller, or `None` if no event was pending. Events beyond the cap
    /// stay on the ring for the next interrupt.
    pub fn handle_events(
        &self,
        commands: &CommandManager,
        slots: &SlotManager,
        root_hub: Option<&dyn PortStatusListener>,
    ) -> Option<u64> {
        let mut dequeue = None;

        for _ in 0..self.max_events {
            let Some((trb, next)) = self.next_event() else {
                break;
            };
            self.dispatch(&trb, commands, slots, root_hub);
            dequeue = Some(next);
        }

        if let Some(dequeue) = dequeue {
            self.platform.write_event_dequeue(dequeue);
        }
        dequeue
    }

    fn dispatch(
        &self,
        trb: &Trb,
        commands: &CommandManager,
        slots: &SlotManager,
        root_hub: Option<&dyn PortStatusListener>,
    ) {
        match trb.trb_type() {
            Some(TrbType::TransferEvent) => {
                slots.transfer_event(&TransferEvent::from_trb(trb));
            }
            Some(TrbType::CommandCompletion) => {
                commands.command_completed(trb.parameter(), trb.completion_code(), trb.slot_id());
            }
            Some(TrbType::PortStatusChange) => {
                let port_id = trb.port_id();
                trace!("Port {} status changed", port_id);
                match root_hub {
                    Some(listener) => listener.port_status_changed(port_id),
                    None => warn!("Port {} status change without root hub", port_id),
                }
            }
            Some(TrbType::HostController) => {
                let code = trb.completion_code();
                if code == CompletionCode::EVENT_RING_FULL {
                    error!("Event ring full");
                } else {
                    error!("Host controller event: {}", code);
                }
            }
            _ => error!("Unhandled event TRB (type {})", trb.raw_type()),
        }
    }
}
