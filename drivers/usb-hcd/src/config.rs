//! Host controller configuration

use crate::error::{HcdError, HcdResult};

/// Where URB completion routines run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Called directly from the context that drains the event ring
    Immediate,
    /// Parked on the completion queue until
    /// [`HostController::process_completions`](crate::HostController::process_completions)
    /// runs at task level
    Deferred,
}

/// Tunables for one host controller instance
#[derive(Debug, Clone, Copy)]
pub struct HcdConfig {
    /// TRBs per command ring (including the link TRB)
    pub command_ring_size: usize,
    /// TRBs per endpoint transfer ring (including the link TRB)
    pub transfer_ring_size: usize,
    /// TRBs in the single event ring segment
    pub event_ring_size: usize,
    /// Device slots enabled on the controller
    pub max_slots: u8,
    /// Upper bound of events handled per interrupt
    pub max_events_per_interrupt: usize,
    pub command_timeout_ms: u64,
    /// Default timeout for synchronous transfers
    pub transfer_timeout_ms: u64,
    /// URBs allowed in flight per endpoint
    pub urb_window: usize,
    pub completion_mode: CompletionMode,
    /// Capacity of the deferred completion queue
    pub completion_queue_depth: usize,
}

/// Smallest ring the controller accepts
pub const MIN_RING_SIZE: usize = 16;

/// Largest in-flight window per endpoint
pub const MAX_URB_WINDOW: usize = 8;

impl Default for HcdConfig {
    fn default() -> Self {
        Self {
            command_ring_size: 64,
            transfer_ring_size: 64,
            event_ring_size: 64,
            max_slots: 32,
            max_events_per_interrupt: 32,
            command_timeout_ms: 3000,
            transfer_timeout_ms: 1000,
            urb_window: 2,
            completion_mode: CompletionMode::Immediate,
            completion_queue_depth: 64,
        }
    }
}

impl HcdConfig {
    /// Check all fields for values the rings and managers can work with
    pub fn validate(&self) -> HcdResult<()> {
        for (name, size) in [
            ("command_ring_size", self.command_ring_size),
            ("transfer_ring_size", self.transfer_ring_size),
            ("event_ring_size", self.event_ring_size),
        ] {
            validate_ring_size(name, size)?;
        }

        if self.max_slots == 0 {
            return Err(HcdError::InvalidArgument {
                name: "max_slots",
                value: "must be at least 1",
            });
        }
        if self.max_events_per_interrupt == 0 {
            return Err(HcdError::InvalidArgument {
                name: "max_events_per_interrupt",
                value: "must be at least 1",
            });
        }
        if self.urb_window == 0 || self.urb_window > MAX_URB_WINDOW {
            return Err(HcdError::InvalidArgument {
                name: "urb_window",
                value: "must be in 1..=8",
            });
        }
        if self.completion_mode == CompletionMode::Deferred && self.completion_queue_depth == 0 {
            return Err(HcdError::InvalidArgument {
                name: "completion_queue_depth",
                value: "deferred completion needs a queue",
            });
        }

        Ok(())
    }
}

/// Ring sizes must hold the link TRB and keep the ring a multiple of 4 TRBs
pub fn validate_ring_size(name: &'static str, size: usize) -> HcdResult<()> {
    if size < MIN_RING_SIZE {
        return Err(HcdError::InvalidArgument {
            name,
            value: "ring must have at least 16 TRBs",
        });
    }
    if size % 4 != 0 {
        return Err(HcdError::InvalidArgument {
            name,
            value: "ring size must be a multiple of 4",
        });
    }
    Ok(())
}
