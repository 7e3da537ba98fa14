//! Device slot table and the device context base address array (DCBAA)
//!
//! Slot IDs are handed out by the controller (Enable Slot) in the range
//! `1..=max_slots`. DCBAA entry 0 holds the scratchpad buffer array pointer,
//! entry `n` the output device context of slot `n`.

use alloc::{sync::Arc, vec::Vec};

use log::{trace, warn};

use crate::{
    arch::{self, ExecutionLevel},
    device::UsbDevice,
    dma::{DmaBuffer, DMA_ALIGN, DMA_BOUNDARY},
    endpoint::TransferEvent,
    error::{HcdError, HcdResult},
    platform::HostPlatform,
    sync::IrqSpinLock,
};

pub struct SlotManager {
    platform: Arc<dyn HostPlatform>,
    max_slots: u8,
    dcbaa: DmaBuffer,
    devices: IrqSpinLock<Vec<Option<Arc<UsbDevice>>>>,
}

impl SlotManager {
    /// Allocate the DCBAA and program it into the controller
    pub fn new(platform: Arc<dyn HostPlatform>, max_slots: u8) -> HcdResult<Self> {
        if max_slots == 0 {
            return Err(HcdError::InvalidArgument {
                name: "max_slots",
                value: "must be at least 1",
            });
        }

        let entries = max_slots as usize + 1;
        let dcbaa = DmaBuffer::new(entries * 8, DMA_ALIGN, DMA_BOUNDARY)?;

        let mut devices = Vec::new();
        devices
            .try_reserve_exact(max_slots as usize)
            .map_err(|_| HcdError::OutOfMemory {
                requested: max_slots as usize * core::mem::size_of::<Option<Arc<UsbDevice>>>(),
            })?;
        devices.resize(max_slots as usize, None);

        platform.set_device_context_base(platform.dma_address(dcbaa.addr()), max_slots);

        Ok(Self {
            platform,
            max_slots,
            dcbaa,
            devices: IrqSpinLock::new(ExecutionLevel::Irq, devices),
        })
    }

    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    fn check_slot(&self, slot_id: u8) -> HcdResult<usize> {
        if slot_id == 0 || slot_id > self.max_slots {
            return Err(HcdError::InvalidSlot { slot_id });
        }
        Ok(slot_id as usize - 1)
    }

    /// Bind `device` to `slot_id` and publish its device context
    pub fn assign_device(&self, slot_id: u8, device: Arc<UsbDevice>) -> HcdResult<()> {
        let index = self.check_slot(slot_id)?;
        let context = self.platform.dma_address(device.context_addr());

        let mut devices = self.devices.lock();
        if devices[index].is_some() {
            return Err(HcdError::SlotOccupied { slot_id });
        }
        devices[index] = Some(device);

        self.dcbaa.write::<u64>(slot_id as usize * 8, context);
        arch::dmb();
        Ok(())
    }

    /// Unbind the device of `slot_id`; returns it so the caller can shut it
    /// down outside of the slot table lock
    pub fn free_slot(&self, slot_id: u8) -> HcdResult<Option<Arc<UsbDevice>>> {
        let index = self.check_slot(slot_id)?;
        let device = self.devices.lock()[index].take();
        self.dcbaa.write::<u64>(slot_id as usize * 8, 0);
        arch::dmb();
        Ok(device)
    }

    pub fn device(&self, slot_id: u8) -> Option<Arc<UsbDevice>> {
        let index = self.check_slot(slot_id).ok()?;
        self.devices.lock()[index].clone()
    }

    /// Number of slots with a device bound
    pub fn assigned(&self) -> usize {
        self.devices.lock().iter().flatten().count()
    }

    /// Store the scratchpad buffer array pointer in DCBAA entry 0
    pub fn assign_scratchpad_array(&self, array: u64) {
        self.dcbaa.write::<u64>(0, array);
        arch::dmb();
    }

    /// DCBAA entry `index` as the controller sees it
    pub fn dcbaa_entry(&self, index: u8) -> u64 {
        self.dcbaa.read::<u64>(index as usize * 8)
    }

    /// Route a transfer event to the device bound to its slot
    ///
    /// Events for unassigned slots come from devices that have already been
    /// detached and are dropped. Returns whether the event was delivered.
    pub fn transfer_event(&self, event: &TransferEvent) -> bool {
        match self.device(event.slot_id) {
            Some(device) => {
                trace!(
                    "Transfer event slot {} endpoint {}: {}",
                    event.slot_id,
                    event.endpoint_id,
                    event.code
                );
                device.transfer_event(event);
                true
            }
            None => {
                warn!(
                    "Transfer event for unassigned slot {} dropped ({})",
                    event.slot_id, event.code
                );
                false
            }
        }
    }
}
