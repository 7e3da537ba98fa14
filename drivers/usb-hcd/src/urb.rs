//! USB Request Blocks
//!
//! A [`UsbRequest`] describes one transfer and carries its outcome back to
//! the submitter. The endpoint takes ownership while the transfer is in
//! flight and hands the request back through its completion routine (or as
//! the return value of a synchronous transfer).

use alloc::boxed::Box;
use core::fmt;

use crate::{
    dma::DmaBuffer,
    error::{HcdResult, UsbError},
};

/// Upper bound of isochronous packets per request
pub const MAX_ISO_PACKETS: usize = 32;

/// Standard request codes used by the tests and the enumeration path
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;

    pub const DIR_IN: u8 = 0x80;
    pub const DESCRIPTOR_DEVICE: u16 = 1;
    pub const DESCRIPTOR_CONFIGURATION: u16 = 2;
}

/// 8-byte control request
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// GET_DESCRIPTOR for descriptor `kind` / `index`
    pub const fn get_descriptor(kind: u16, index: u8, length: u16) -> Self {
        Self::new(
            request::DIR_IN,
            request::GET_DESCRIPTOR,
            kind << 8 | index as u16,
            0,
            length,
        )
    }

    /// Data stage (if any) is device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & request::DIR_IN != 0
    }

    /// Little-endian packing used as immediate data in the setup TRB
    pub fn to_u64(&self) -> u64 {
        self.request_type as u64
            | (self.request as u64) << 8
            | (self.value as u64) << 16
            | (self.index as u64) << 32
            | (self.length as u64) << 48
    }
}

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    /// Not submitted yet or still in flight
    Pending,
    Success,
    Failed(UsbError),
}

/// Called once when the request completes, fails or is cancelled
///
/// Any caller context is captured by the closure.
pub type CompletionRoutine = Box<dyn FnOnce(Box<UsbRequest>) + Send>;

pub struct UsbRequest {
    setup: Option<SetupPacket>,
    buffer: Option<DmaBuffer>,
    iso_packets: [u16; MAX_ISO_PACKETS],
    iso_packet_count: usize,
    status: UrbStatus,
    result_length: usize,
    completion: Option<CompletionRoutine>,
    complete_on_nak: bool,
}

impl UsbRequest {
    /// Bulk or interrupt request over `buffer`
    pub fn new(buffer: Option<DmaBuffer>) -> Box<Self> {
        Box::new(Self {
            setup: None,
            buffer,
            iso_packets: [0; MAX_ISO_PACKETS],
            iso_packet_count: 0,
            status: UrbStatus::Pending,
            result_length: 0,
            completion: None,
            complete_on_nak: false,
        })
    }

    /// Control request; `buffer` is the data stage
    pub fn control(setup: SetupPacket, buffer: Option<DmaBuffer>) -> Box<Self> {
        let mut urb = Self::new(buffer);
        urb.setup = Some(setup);
        urb
    }

    /// Isochronous request with one entry per packet
    pub fn isochronous(buffer: DmaBuffer, packet_sizes: &[u16]) -> HcdResult<Box<Self>> {
        let mut urb = Self::new(Some(buffer));
        for &size in packet_sizes {
            urb.add_iso_packet(size)?;
        }
        Ok(urb)
    }

    pub fn add_iso_packet(&mut self, size: u16) -> HcdResult<()> {
        if self.iso_packet_count == MAX_ISO_PACKETS {
            return Err(crate::error::HcdError::ResourceExhausted {
                resource: "isochronous packets",
            });
        }
        self.iso_packets[self.iso_packet_count] = size;
        self.iso_packet_count += 1;
        Ok(())
    }

    pub fn set_completion_routine(&mut self, routine: impl FnOnce(Box<UsbRequest>) + Send + 'static) {
        self.completion = Some(Box::new(routine));
    }

    pub fn set_complete_on_nak(&mut self, complete_on_nak: bool) {
        self.complete_on_nak = complete_on_nak;
    }

    pub fn complete_on_nak(&self) -> bool {
        self.complete_on_nak
    }

    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    pub fn buffer(&self) -> Option<&DmaBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut DmaBuffer> {
        self.buffer.as_mut()
    }

    pub fn take_buffer(&mut self) -> Option<DmaBuffer> {
        self.buffer.take()
    }

    /// Bytes in the data buffer
    pub fn buffer_length(&self) -> usize {
        self.buffer.as_ref().map_or(0, DmaBuffer::len)
    }

    /// Received or transmitted data, valid after completion
    pub fn data(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer.as_slice()[..self.result_length.min(buffer.len())],
            None => &[],
        }
    }

    pub fn iso_packets(&self) -> &[u16] {
        &self.iso_packets[..self.iso_packet_count]
    }

    pub fn status(&self) -> UrbStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == UrbStatus::Success
    }

    pub fn usb_error(&self) -> Option<UsbError> {
        match self.status {
            UrbStatus::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn result_length(&self) -> usize {
        self.result_length
    }

    pub(crate) fn set_status(&mut self, status: UrbStatus) {
        self.status = status;
    }

    pub(crate) fn set_result_length(&mut self, length: usize) {
        self.result_length = length;
    }

    pub(crate) fn take_completion_routine(&mut self) -> Option<CompletionRoutine> {
        self.completion.take()
    }

    pub(crate) fn has_completion_routine(&self) -> bool {
        self.completion.is_some()
    }

    /// Hand the request to its completion routine; drops it if none is set
    pub fn call_completion_routine(mut self: Box<Self>) {
        if let Some(routine) = self.completion.take() {
            routine(self);
        }
    }
}

impl fmt::Debug for UsbRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbRequest")
            .field("setup", &self.setup)
            .field("buffer_length", &self.buffer_length())
            .field("iso_packets", &self.iso_packets())
            .field("status", &self.status)
            .field("result_length", &self.result_length)
            .finish()
    }
}
