//! Command ring protocol
//!
//! Every command is one TRB on the command ring followed by a write to the
//! host controller doorbell. The issuing task then waits until the event
//! ring delivers a Command Completion Event whose TRB pointer matches the
//! command. Only one command is outstanding at a time; concurrent callers
//! queue up on a task-level mutex before touching the ring.

use alloc::sync::Arc;

use log::{debug, warn};

use crate::{
    arch::{self, ExecutionLevel},
    config::HcdConfig,
    context::ContextBuffer,
    error::{HcdError, HcdResult},
    platform::HostPlatform,
    ring::{Ring, RingType},
    sync::{CompletionEvent, IrqSpinLock, TaskMutex},
    trb::{CompletionCode, Trb, TrbControl, TrbType, TRB_ENDPOINT_ID_SHIFT},
};

/// Stop Endpoint: suspend flag
const STOP_ENDPOINT_SUSPEND: u32 = 1 << 23;

/// Result delivered by the Command Completion Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompletion {
    pub code: CompletionCode,
    pub slot_id: u8,
}

impl CommandCompletion {
    /// Map a non-success completion code to an error
    pub fn check(self) -> HcdResult<Self> {
        if self.code.is_success() {
            Ok(self)
        } else {
            Err(HcdError::CommandFailed { code: self.code })
        }
    }
}

#[derive(Default)]
struct Outstanding {
    /// Bus address of the command TRB waiting for completion
    trb_address: Option<u64>,
    result: Option<CommandCompletion>,
}

pub struct CommandManager {
    platform: Arc<dyn HostPlatform>,
    ring: IrqSpinLock<Ring>,
    outstanding: IrqSpinLock<Outstanding>,
    completed: CompletionEvent,
    serial: TaskMutex<()>,
    max_slots: u8,
    timeout_ms: u64,
}

impl CommandManager {
    /// Allocate the command ring and program it into the controller
    pub fn new(platform: Arc<dyn HostPlatform>, config: &HcdConfig) -> HcdResult<Self> {
        let ring = Ring::new(RingType::Command, config.command_ring_size, &*platform)?;
        platform.set_command_ring(ring.base_address(), ring.cycle_state());

        Ok(Self {
            platform,
            ring: IrqSpinLock::new(ExecutionLevel::Irq, ring),
            outstanding: IrqSpinLock::new(ExecutionLevel::Irq, Outstanding::default()),
            completed: CompletionEvent::new(),
            serial: TaskMutex::new(()),
            max_slots: config.max_slots,
            timeout_ms: config.command_timeout_ms,
        })
    }

    /// Obtain a device slot; returns its ID
    pub fn enable_slot(&self) -> HcdResult<u8> {
        let completion = self
            .do_command(Trb::command(TrbType::EnableSlot, 0, 0, TrbControl::empty()))?
            .check()?;

        if completion.slot_id == 0 || completion.slot_id > self.max_slots {
            warn!("Enable Slot returned invalid slot {}", completion.slot_id);
            return Err(HcdError::CommandFailed {
                code: CompletionCode::NO_SLOTS_AVAILABLE,
            });
        }
        Ok(completion.slot_id)
    }

    pub fn disable_slot(&self, slot_id: u8) -> HcdResult<()> {
        self.do_command(Trb::command(TrbType::DisableSlot, 0, slot_id, TrbControl::empty()))?
            .check()
            .map(drop)
    }

    /// Address Device; with `set_address == false` the controller only
    /// initialises the slot (Block Set Address Request)
    pub fn address_device(
        &self,
        slot_id: u8,
        input_context: &ContextBuffer,
        set_address: bool,
    ) -> HcdResult<()> {
        let flags = if set_address {
            TrbControl::empty()
        } else {
            TrbControl::BSR
        };
        let pointer = self.platform.dma_address(input_context.addr());
        self.do_command(Trb::command(TrbType::AddressDevice, pointer, slot_id, flags))?
            .check()
            .map(drop)
    }

    pub fn configure_endpoint(
        &self,
        slot_id: u8,
        input_context: &ContextBuffer,
        deconfigure: bool,
    ) -> HcdResult<()> {
        let flags = if deconfigure {
            TrbControl::DECONFIGURE
        } else {
            TrbControl::empty()
        };
        let pointer = self.platform.dma_address(input_context.addr());
        self.do_command(Trb::command(TrbType::ConfigureEndpoint, pointer, slot_id, flags))?
            .check()
            .map(drop)
    }

    pub fn evaluate_context(&self, slot_id: u8, input_context: &ContextBuffer) -> HcdResult<()> {
        let pointer = self.platform.dma_address(input_context.addr());
        self.do_command(Trb::command(
            TrbType::EvaluateContext,
            pointer,
            slot_id,
            TrbControl::empty(),
        ))?
        .check()
        .map(drop)
    }

    /// Recover a halted endpoint
    pub fn reset_endpoint(&self, slot_id: u8, endpoint_id: u8) -> HcdResult<()> {
        let mut trb = Trb::command(TrbType::ResetEndpoint, 0, slot_id, TrbControl::empty());
        trb.control |= (endpoint_id as u32) << TRB_ENDPOINT_ID_SHIFT;
        self.do_command(trb)?.check().map(drop)
    }

    pub fn stop_endpoint(&self, slot_id: u8, endpoint_id: u8, suspend: bool) -> HcdResult<()> {
        let mut trb = Trb::command(TrbType::StopEndpoint, 0, slot_id, TrbControl::empty());
        trb.control |= (endpoint_id as u32) << TRB_ENDPOINT_ID_SHIFT;
        if suspend {
            trb.control |= STOP_ENDPOINT_SUSPEND;
        }
        self.do_command(trb)?.check().map(drop)
    }

    pub fn no_op(&self) -> HcdResult<()> {
        self.do_command(Trb::command(TrbType::NoOpCommand, 0, 0, TrbControl::empty()))?
            .check()
            .map(drop)
    }

    /// Issue one command TRB and wait for its completion event
    ///
    /// The cycle bit is applied by the ring. A non-success completion code is
    /// returned as part of the `Ok` value; `Err` means the command never
    /// completed (ring full or timeout).
    pub fn do_command(&self, trb: Trb) -> HcdResult<CommandCompletion> {
        let _serial = self.serial.lock(&*self.platform);

        {
            let mut ring = self.ring.lock();
            let address = ring.get_enqueue_trb().ok_or(HcdError::RingFull {
                ring: RingType::Command,
            })?;

            *self.outstanding.lock() = Outstanding {
                trb_address: Some(address),
                result: None,
            };
            self.completed.reset();
            ring.enqueue(trb);
        }

        arch::dsb();
        self.platform.ring_doorbell(0, 0);

        let signaled = self.completed.wait_timeout(&*self.platform, self.timeout_ms);

        let result = {
            let mut outstanding = self.outstanding.lock();
            outstanding.trb_address = None;
            outstanding.result.take()
        };

        match result {
            Some(completion) => {
                debug!(
                    "Command {:?} completed: {} (slot {})",
                    trb.trb_type(),
                    completion.code,
                    completion.slot_id
                );
                Ok(completion)
            }
            None => {
                warn!(
                    "Command {:?} timed out (signaled: {})",
                    trb.trb_type(),
                    signaled
                );
                Err(HcdError::Timeout {
                    operation: "xHCI command",
                    duration_ms: self.timeout_ms,
                })
            }
        }
    }

    /// Deliver a Command Completion Event; called from the event handler
    ///
    /// Completions for commands nobody waits for any more (timed out) or that
    /// do not match the outstanding TRB are dropped.
    pub fn command_completed(&self, trb_address: u64, code: CompletionCode, slot_id: u8) {
        // The controller has consumed the TRB whether or not anyone waits
        let released = self.ring.lock().release_through(trb_address);
        if released == 0 {
            warn!("Completion for unknown command TRB {:#x}", trb_address);
            return;
        }

        let matched = {
            let mut outstanding = self.outstanding.lock();
            if outstanding.trb_address == Some(trb_address) && outstanding.result.is_none() {
                outstanding.result = Some(CommandCompletion { code, slot_id });
                true
            } else {
                false
            }
        };

        if matched {
            self.completed.signal();
        } else {
            debug!("Dropping stale command completion for {:#x}", trb_address);
        }
    }

    /// A command is waiting for its completion
    pub fn is_busy(&self) -> bool {
        self.outstanding.lock().trb_address.is_some()
    }

    /// Bus address of the command ring
    pub fn ring_base(&self) -> u64 {
        self.ring.lock().base_address()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Weak;

    use super::*;
    use crate::testing::TestPlatform;

    /// Controller stand-in: completes the newest command TRB on each yield
    fn manager_with_responder(
        code: CompletionCode,
        slot_id: u8,
    ) -> (Arc<TestPlatform>, Arc<CommandManager>) {
        let platform = Arc::new(TestPlatform::new());
        let manager = Arc::new(CommandManager::new(platform.clone(), &HcdConfig::default()).unwrap());

        let weak: Weak<CommandManager> = Arc::downgrade(&manager);
        platform.set_yield_hook(move || {
            if let Some(manager) = weak.upgrade() {
                let address = manager.outstanding.lock().trb_address;
                if let Some(address) = address {
                    manager.command_completed(address, code, slot_id);
                }
            }
        });
        (platform, manager)
    }

    #[test]
    fn test_no_op_completes() {
        let (platform, manager) = manager_with_responder(CompletionCode::SUCCESS, 0);
        manager.no_op().unwrap();
        assert_eq!(platform.doorbells.lock().as_slice(), &[(0, 0)]);
        assert!(!manager.is_busy());

        let ring = manager.ring.lock();
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.read(0).trb_type(), Some(TrbType::NoOpCommand));
        assert!(ring.read(0).cycle());
    }

    #[test]
    fn test_enable_slot_returns_slot() {
        let (_platform, manager) = manager_with_responder(CompletionCode::SUCCESS, 3);
        assert_eq!(manager.enable_slot().unwrap(), 3);
    }

    #[test]
    fn test_enable_slot_rejects_invalid_slot() {
        let (_platform, manager) = manager_with_responder(CompletionCode::SUCCESS, 0);
        assert_eq!(
            manager.enable_slot(),
            Err(HcdError::CommandFailed {
                code: CompletionCode::NO_SLOTS_AVAILABLE
            })
        );
    }

    #[test]
    fn test_failure_code_is_returned() {
        let (_platform, manager) = manager_with_responder(CompletionCode::CONTEXT_STATE_ERROR, 1);
        assert_eq!(
            manager.disable_slot(1),
            Err(HcdError::CommandFailed {
                code: CompletionCode::CONTEXT_STATE_ERROR
            })
        );
        let completion = manager
            .do_command(Trb::command(TrbType::DisableSlot, 0, 1, TrbControl::empty()))
            .unwrap();
        assert_eq!(completion.code, CompletionCode::CONTEXT_STATE_ERROR);
    }

    #[test]
    fn test_address_device_sets_bsr_and_pointer() {
        let (_platform, manager) = manager_with_responder(CompletionCode::SUCCESS, 2);
        let input = ContextBuffer::input().unwrap();
        manager.address_device(2, &input, false).unwrap();
        let trb = manager.ring.lock().read(0);
        assert_eq!(trb.trb_type(), Some(TrbType::AddressDevice));
        assert_eq!(trb.parameter(), input.addr() as u64);
        assert_eq!(trb.slot_id(), 2);
        assert!(trb.flags().contains(TrbControl::BSR));
    }

    #[test]
    fn test_timeout_then_late_completion_is_dropped() {
        let platform = Arc::new(TestPlatform::new());
        let manager = CommandManager::new(platform.clone(), &HcdConfig::default()).unwrap();

        let result = manager.no_op();
        assert_eq!(
            result,
            Err(HcdError::Timeout {
                operation: "xHCI command",
                duration_ms: 3000
            })
        );
        assert!(!manager.is_busy());

        // The controller finally reports the timed-out command
        let address = manager.ring.lock().trb_address(0);
        manager.command_completed(address, CompletionCode::SUCCESS, 0);
        assert!(!manager.completed.is_signaled());
        assert_eq!(manager.ring.lock().outstanding(), 0);

        // Unknown TRB pointers are ignored
        manager.command_completed(0xdead_0000, CompletionCode::SUCCESS, 0);
    }

    #[test]
    fn test_reset_and_stop_endpoint_encoding() {
        let (_platform, manager) = manager_with_responder(CompletionCode::SUCCESS, 1);
        manager.reset_endpoint(1, 3).unwrap();
        manager.stop_endpoint(1, 4, true).unwrap();
        let ring = manager.ring.lock();
        let reset = ring.read(0);
        assert_eq!(reset.trb_type(), Some(TrbType::ResetEndpoint));
        assert_eq!(reset.endpoint_id(), 3);
        let stop = ring.read(1);
        assert_eq!(stop.trb_type(), Some(TrbType::StopEndpoint));
        assert_eq!(stop.endpoint_id(), 4);
        assert_ne!(stop.control & STOP_ENDPOINT_SUSPEND, 0);
    }
}
