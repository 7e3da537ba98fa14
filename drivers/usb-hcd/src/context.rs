//! xHCI device and input contexts (32-byte context size)

use crate::{
    dma::{DmaBuffer, DMA_ALIGN, DMA_BOUNDARY},
    error::HcdResult,
    UsbSpeed,
};

/// Endpoint contexts per device, DCI 1..=31
pub const MAX_ENDPOINTS: usize = 31;

const CONTEXT_SIZE: usize = 32;

/// Endpoint type field values
pub mod ep_type {
    pub const ISOCH_OUT: u8 = 1;
    pub const BULK_OUT: u8 = 2;
    pub const INTERRUPT_OUT: u8 = 3;
    pub const CONTROL: u8 = 4;
    pub const ISOCH_IN: u8 = 5;
    pub const BULK_IN: u8 = 6;
    pub const INTERRUPT_IN: u8 = 7;
}

/// Dequeue cycle state bit of the TR dequeue pointer
pub const TR_DEQUEUE_DCS: u64 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotContext {
    pub dwords: [u32; 8],
}

impl SlotContext {
    pub fn set_route_string(&mut self, route: u32) {
        self.dwords[0] = (self.dwords[0] & !0xF_FFFF) | (route & 0xF_FFFF);
    }

    pub fn set_speed(&mut self, speed: UsbSpeed) {
        self.dwords[0] = (self.dwords[0] & !(0xF << 20)) | speed.psi() << 20;
    }

    pub fn set_context_entries(&mut self, entries: u8) {
        self.dwords[0] = (self.dwords[0] & !(0x1F << 27)) | ((entries as u32) & 0x1F) << 27;
    }

    pub fn context_entries(&self) -> u8 {
        (self.dwords[0] >> 27) as u8
    }

    pub fn set_root_hub_port(&mut self, port: u8) {
        self.dwords[1] = (self.dwords[1] & !(0xFF << 16)) | (port as u32) << 16;
    }

    pub fn root_hub_port(&self) -> u8 {
        (self.dwords[1] >> 16) as u8
    }

    /// Transaction translator of a low/full-speed device behind a
    /// high-speed hub
    pub fn set_tt(&mut self, hub_slot_id: u8, hub_port: u8, multi_tt: bool) {
        self.dwords[2] = (self.dwords[2] & !0xFFFF) | hub_slot_id as u32 | (hub_port as u32) << 8;
        if multi_tt {
            self.dwords[0] |= 1 << 25;
        } else {
            self.dwords[0] &= !(1 << 25);
        }
    }

    /// Address assigned by the controller
    pub fn device_address(&self) -> u8 {
        self.dwords[3] as u8
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointContext {
    pub dwords: [u32; 8],
}

impl EndpointContext {
    pub fn set_interval(&mut self, interval: u8) {
        self.dwords[0] = (self.dwords[0] & !(0xFF << 16)) | (interval as u32) << 16;
    }

    pub fn interval(&self) -> u8 {
        (self.dwords[0] >> 16) as u8
    }

    pub fn set_error_count(&mut self, count: u8) {
        self.dwords[1] = (self.dwords[1] & !(0x3 << 1)) | ((count as u32) & 0x3) << 1;
    }

    pub fn set_ep_type(&mut self, ty: u8) {
        self.dwords[1] = (self.dwords[1] & !(0x7 << 3)) | ((ty as u32) & 0x7) << 3;
    }

    pub fn ep_type(&self) -> u8 {
        ((self.dwords[1] >> 3) & 0x7) as u8
    }

    pub fn set_max_burst(&mut self, burst: u8) {
        self.dwords[1] = (self.dwords[1] & !(0xFF << 8)) | (burst as u32) << 8;
    }

    pub fn set_max_packet_size(&mut self, size: u16) {
        self.dwords[1] = (self.dwords[1] & 0xFFFF) | (size as u32) << 16;
    }

    pub fn max_packet_size(&self) -> u16 {
        (self.dwords[1] >> 16) as u16
    }

    pub fn set_tr_dequeue_pointer(&mut self, pointer: u64) {
        self.dwords[2] = pointer as u32;
        self.dwords[3] = (pointer >> 32) as u32;
    }

    pub fn tr_dequeue_pointer(&self) -> u64 {
        self.dwords[2] as u64 | (self.dwords[3] as u64) << 32
    }

    pub fn set_average_trb_length(&mut self, length: u16) {
        self.dwords[4] = (self.dwords[4] & !0xFFFF) | length as u32;
    }

    pub fn set_max_esit_payload(&mut self, payload: u16) {
        self.dwords[4] = (self.dwords[4] & 0xFFFF) | (payload as u32) << 16;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputControlContext {
    pub drop_flags: u32,
    pub add_flags: u32,
    pub reserved: [u32; 6],
}

/// Slot context followed by the endpoint contexts, as the controller stores
/// it in the output device context
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceContext {
    pub slot: SlotContext,
    pub endpoints: [EndpointContext; MAX_ENDPOINTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InputContext {
    pub control: InputControlContext,
    pub device: DeviceContext,
}

impl InputContext {
    /// Endpoint context for endpoint ID (DCI) `endpoint_id`
    pub fn endpoint_mut(&mut self, endpoint_id: u8) -> &mut EndpointContext {
        assert!((1..=MAX_ENDPOINTS as u8).contains(&endpoint_id));
        &mut self.device.endpoints[endpoint_id as usize - 1]
    }
}

/// A context structure placed in DMA memory
pub struct ContextBuffer {
    memory: DmaBuffer,
}

impl ContextBuffer {
    /// Output device context handed to the controller through the DCBAA
    pub fn device() -> HcdResult<Self> {
        Self::with_size(core::mem::size_of::<DeviceContext>())
    }

    /// Input context filled in by [`ContextBuffer::write_input`]
    pub fn input() -> HcdResult<Self> {
        Self::with_size(core::mem::size_of::<InputContext>())
    }

    fn with_size(size: usize) -> HcdResult<Self> {
        Ok(Self {
            memory: DmaBuffer::new(size, DMA_ALIGN, DMA_BOUNDARY)?,
        })
    }

    pub fn addr(&self) -> usize {
        self.memory.addr()
    }

    /// Copy an input context into the buffer
    pub fn write_input(&mut self, context: &InputContext) {
        assert!(self.memory.len() >= core::mem::size_of::<InputContext>());
        self.memory.write(0, *context);
    }

    /// Snapshot of the output device context written by the controller
    pub fn read_device(&self) -> DeviceContext {
        self.memory.read(0)
    }

    pub fn read_input(&self) -> InputContext {
        self.memory.read(0)
    }
}

/// Convert a descriptor `bInterval` into the endpoint context interval
/// exponent (units of 125 us, 2^n)
pub fn convert_interval(interval: u8, speed: UsbSpeed) -> u8 {
    if speed >= UsbSpeed::High {
        return interval.clamp(1, 16) - 1;
    }

    // Frames (1 ms) to the smallest 2^n microframes covering them
    let wanted = 1000 * interval as u32;
    (3..11u8).find(|&i| 125 * (1u32 << i) >= wanted).unwrap_or(11)
}
