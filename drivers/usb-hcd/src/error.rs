//! Error types for the host controller core
//!
//! [`HcdError`] is returned by operations that fail before or instead of
//! reaching the hardware (resource exhaustion, invalid arguments, command
//! failures, timeouts). Transfer outcomes reported by the hardware are
//! classified as [`UsbError`] and travel inside the URB.

use core::fmt;

use crate::{ring::RingType, trb::CompletionCode};

/// Host controller error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcdError {
    /// DMA or arena allocation failed
    OutOfMemory {
        requested: usize,
    },
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// No free TRB on the ring; retry after completions have been processed
    RingFull {
        ring: RingType,
    },
    /// A bounded resource (URB window, queue slot, device slot) is used up
    ResourceExhausted {
        resource: &'static str,
    },
    InvalidSlot {
        slot_id: u8,
    },
    SlotOccupied {
        slot_id: u8,
    },
    InvalidEndpoint {
        endpoint_id: u8,
    },
    /// Endpoint was not configured on the controller or has been shut down
    EndpointNotValid {
        endpoint_id: u8,
    },
    /// Command completed with a non-success completion code
    CommandFailed {
        code: CompletionCode,
    },
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    /// Host controller reported an error event
    HardwareError {
        device: &'static str,
        code: u32,
    },
}

impl HcdError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RingFull { .. } | Self::ResourceExhausted { .. } | Self::Timeout { .. }
        )
    }
}

impl fmt::Display for HcdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument {}: {}", name, value)
            }
            Self::RingFull { ring } => write!(f, "{:?} ring is full", ring),
            Self::ResourceExhausted { resource } => {
                write!(f, "Resource exhausted: {}", resource)
            }
            Self::InvalidSlot { slot_id } => write!(f, "Invalid slot ID {}", slot_id),
            Self::SlotOccupied { slot_id } => write!(f, "Slot {} is already assigned", slot_id),
            Self::InvalidEndpoint { endpoint_id } => {
                write!(f, "Invalid endpoint ID {}", endpoint_id)
            }
            Self::EndpointNotValid { endpoint_id } => {
                write!(f, "Endpoint {} is not valid", endpoint_id)
            }
            Self::CommandFailed { code } => write!(f, "Command failed: {}", code),
            Self::Timeout {
                operation,
                duration_ms,
            } => {
                write!(f, "{} timed out after {} ms", operation, duration_ms)
            }
            Self::HardwareError { device, code } => {
                write!(f, "Hardware error on {}: code {}", device, code)
            }
        }
    }
}

/// Result type for host controller operations
pub type HcdResult<T> = Result<T, HcdError>;

/// USB-level classification of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    Stall,
    /// CRC, bit stuffing or no response from the device
    Transaction,
    Babble,
    FrameOverrun,
    DataToggle,
    HostBus,
    Split,
    Timeout,
    Aborted,
    Unknown,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Stall => "endpoint stalled",
            Self::Transaction => "transaction error",
            Self::Babble => "babble detected",
            Self::FrameOverrun => "frame overrun",
            Self::DataToggle => "data toggle error",
            Self::HostBus => "host bus error",
            Self::Split => "split transaction error",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}
