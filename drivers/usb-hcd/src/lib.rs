//! USB host controller transfer and scheduling core
//!
//! This crate contains the parts of a USB host controller driver that sit
//! between URB submission and the hardware DMA engine:
//!
//! - `ring`: TRB rings shared with the controller (transfer, command, event)
//! - `frame`: DWHCI split-transaction frame schedulers
//! - `queue`: interrupt-safe transaction and completion queues
//! - `schedule`: start-of-frame dispatch of deferred DWHCI transactions
//! - `command`: synchronous command ring protocol
//! - `event`: event ring draining and dispatch
//! - `endpoint`: per-endpoint transfer rings and URB matching
//! - `slot`: device slot table and DCBAA
//! - `controller`: facade that owns the managers and the interrupt entry
//!
//! Hardware access goes through the [`platform::HostPlatform`] trait, which is
//! passed explicitly to every manager.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod command;
pub mod config;
pub mod context;
pub mod controller;
pub mod device;
pub mod dma;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod frame;
pub mod platform;
pub mod queue;
pub mod ring;
pub mod schedule;
pub mod slot;
pub mod sync;
pub mod trb;
pub mod urb;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CompletionMode, HcdConfig};
pub use controller::HostController;
pub use error::{HcdError, HcdResult, UsbError};
pub use platform::HostPlatform;
pub use urb::UsbRequest;

/// USB bus speed of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// Protocol speed ID as written into the slot context
    pub const fn psi(self) -> u32 {
        match self {
            UsbSpeed::Full => 1,
            UsbSpeed::Low => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
        }
    }

    /// Default max packet size of the control endpoint before the device
    /// descriptor has been read
    pub const fn default_ep0_max_packet(self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
            UsbSpeed::Super => 512,
        }
    }
}
