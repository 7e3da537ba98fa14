//! xHCI host controller facade
//!
//! Owns the command, event and slot managers of one controller. The
//! interrupt service routine registered for the controller calls
//! [`HostController::handle_interrupt`] through its registration context;
//! there is no global controller instance.

use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};

use crate::{
    arch::ExecutionLevel,
    command::CommandManager,
    config::{CompletionMode, HcdConfig},
    context::ContextBuffer,
    device::{DeviceId, TransactionTranslator, UsbDevice},
    endpoint::{CompletionSink, Endpoint, EndpointDescriptor, EndpointOwner},
    error::{HcdError, HcdResult},
    event::{EventManager, PortStatusListener},
    platform::HostPlatform,
    queue::CompletionQueue,
    slot::SlotManager,
    sync::IrqSpinLock,
    urb::UsbRequest,
    UsbSpeed,
};

/// Position of a device behind a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubRoute {
    pub route_string: u32,
    pub tt: Option<TransactionTranslator>,
}

pub struct HostController {
    config: HcdConfig,
    platform: Arc<dyn HostPlatform>,
    slots: SlotManager,
    commands: CommandManager,
    events: EventManager,
    completions: Option<Arc<CompletionQueue<Box<UsbRequest>>>>,
    root_hub: IrqSpinLock<Option<Arc<dyn PortStatusListener>>>,
    next_device: AtomicU32,
}

impl HostController {
    /// Allocate all controller data structures and program their addresses
    ///
    /// The controller must be halted; it is started by the platform once
    /// this returns.
    pub fn new(platform: Arc<dyn HostPlatform>, config: HcdConfig) -> HcdResult<Self> {
        config.validate()?;

        let slots = SlotManager::new(platform.clone(), config.max_slots)?;
        let commands = CommandManager::new(platform.clone(), &config)?;
        let events = EventManager::new(platform.clone(), &config)?;

        let completions = match config.completion_mode {
            CompletionMode::Immediate => None,
            CompletionMode::Deferred => Some(Arc::new(CompletionQueue::new(
                config.completion_queue_depth,
                ExecutionLevel::Irq,
            )?)),
        };

        Ok(Self {
            config,
            platform,
            slots,
            commands,
            events,
            completions,
            root_hub: IrqSpinLock::new(ExecutionLevel::Irq, None),
            next_device: AtomicU32::new(1),
        })
    }

    /// Check that the running controller processes commands
    pub fn initialize(&self) -> HcdResult<()> {
        self.commands.no_op().map_err(|error| {
            warn!("Command ring not operational: {}", error);
            error
        })?;
        info!("xHCI: command ring operational, {} slots", self.config.max_slots);
        Ok(())
    }

    pub fn config(&self) -> &HcdConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandManager {
        &self.commands
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn set_root_hub(&self, root_hub: Arc<dyn PortStatusListener>) {
        *self.root_hub.lock() = Some(root_hub);
    }

    /// Interrupt entry point: drain the event ring
    ///
    /// Returns the new event ring dequeue pointer, or `None` if there was
    /// nothing to do.
    pub fn handle_interrupt(&self) -> Option<u64> {
        let root_hub = self.root_hub.lock().clone();
        self.events
            .handle_events(&self.commands, &self.slots, root_hub.as_deref())
    }

    /// Events left on the ring after the per-interrupt cap
    pub fn events_pending(&self) -> bool {
        self.events.has_pending()
    }

    fn completion_sink(&self) -> CompletionSink {
        match &self.completions {
            Some(queue) => CompletionSink::Deferred(queue.clone()),
            None => CompletionSink::Immediate,
        }
    }

    /// Enable a slot for a device on `root_port` and address it
    pub fn attach_device(&self, root_port: u8, speed: UsbSpeed) -> HcdResult<Arc<UsbDevice>> {
        self.attach(root_port, speed, None)
    }

    /// Like [`HostController::attach_device`] for a device behind a hub
    pub fn attach_hub_device(
        &self,
        root_port: u8,
        speed: UsbSpeed,
        route: HubRoute,
    ) -> HcdResult<Arc<UsbDevice>> {
        self.attach(root_port, speed, Some(route))
    }

    fn attach(
        &self,
        root_port: u8,
        speed: UsbSpeed,
        route: Option<HubRoute>,
    ) -> HcdResult<Arc<UsbDevice>> {
        let slot_id = self.commands.enable_slot()?;
        let id = DeviceId(self.next_device.fetch_add(1, Ordering::Relaxed));

        let owner = EndpointOwner {
            platform: self.platform.clone(),
            device: id,
            slot_id,
            speed,
            sink: self.completion_sink(),
        };

        let device = match UsbDevice::new(owner, root_port, &self.config) {
            Ok(mut device) => {
                if let Some(route) = route {
                    device.set_hub_route(route.route_string, route.tt);
                }
                Arc::new(device)
            }
            Err(error) => {
                self.release_slot(slot_id);
                return Err(error);
            }
        };

        let addressed = self
            .slots
            .assign_device(slot_id, device.clone())
            .and_then(|()| device.address_input_context())
            .and_then(|input| self.commands.address_device(slot_id, &input, true));

        if let Err(error) = addressed {
            warn!("Cannot address device on port {}: {}", root_port, error);
            if let Ok(Some(device)) = self.slots.free_slot(slot_id) {
                device.shutdown();
            }
            self.release_slot(slot_id);
            return Err(error);
        }

        debug!(
            "{} attached on port {} ({:?}), slot {}",
            id, root_port, speed, slot_id
        );
        Ok(device)
    }

    fn release_slot(&self, slot_id: u8) {
        if let Err(error) = self.commands.disable_slot(slot_id) {
            warn!("Cannot disable slot {}: {}", slot_id, error);
        }
    }

    /// Remove a device
    ///
    /// Its slot stops routing events first, then in-flight and parked
    /// completions are dropped without calling their completion routines,
    /// and finally the slot is disabled on the controller.
    pub fn detach_device(&self, device: &UsbDevice) -> HcdResult<()> {
        let slot_id = device.slot_id();
        self.slots.free_slot(slot_id)?;

        let dropped = device.shutdown();
        let flushed = self
            .completions
            .as_ref()
            .map_or(0, |queue| queue.flush_owner(device.id()));
        debug!(
            "{} detached: {} in flight, {} parked completions dropped",
            device.id(),
            dropped,
            flushed
        );

        self.commands.disable_slot(slot_id)
    }

    /// Create an endpoint from its descriptor and configure it on the
    /// controller
    pub fn configure_endpoint(
        &self,
        device: &UsbDevice,
        descriptor: &EndpointDescriptor,
    ) -> HcdResult<Arc<Endpoint>> {
        let endpoint = Endpoint::from_descriptor(device.endpoint_owner(), &self.config, descriptor)?;
        let input = device.configure_input_context(&endpoint)?;
        self.commands
            .configure_endpoint(device.slot_id(), &input, false)?;

        let endpoint = Arc::new(endpoint);
        device.register_endpoint(endpoint.clone())?;
        Ok(endpoint)
    }

    /// Update the EP0 max packet size from the device descriptor
    pub fn set_max_packet_size(&self, device: &UsbDevice, max_packet_size: u16) -> HcdResult<()> {
        let ep0 = device.ep0().ok_or(HcdError::EndpointNotValid { endpoint_id: 1 })?;
        if !ep0.set_max_packet_size(max_packet_size)? {
            return Ok(());
        }

        let mut input = ContextBuffer::input()?;
        input.write_input(&ep0.max_packet_input_context(&device.device_context()));
        self.commands.evaluate_context(device.slot_id(), &input)
    }

    /// Recover a halted endpoint
    pub fn reset_endpoint(&self, endpoint: &Endpoint) -> HcdResult<()> {
        self.commands
            .reset_endpoint(endpoint.slot_id(), endpoint.endpoint_id())
    }

    /// Run parked completion routines at task level
    ///
    /// Returns the number of routines run; always 0 in immediate mode.
    pub fn process_completions(&self) -> usize {
        let Some(queue) = &self.completions else {
            return 0;
        };

        let mut count = 0;
        while let Some(urb) = queue.dequeue() {
            urb.call_completion_routine();
            count += 1;
        }
        count
    }

    /// Fail asynchronous requests whose timeout has expired
    pub fn poll_timeouts(&self) -> usize {
        let now = self.platform.now_ms();
        (1..=self.slots.max_slots())
            .filter_map(|slot_id| self.slots.device(slot_id))
            .flat_map(|device| device.endpoints())
            .map(|endpoint| endpoint.poll_timeouts(now))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;

    #[test]
    fn test_rejects_invalid_config() {
        let platform = Arc::new(TestPlatform::new());
        let config = HcdConfig {
            urb_window: 0,
            ..HcdConfig::default()
        };
        assert!(HostController::new(platform, config).is_err());
    }

    #[test]
    fn test_new_programs_controller() {
        let platform = Arc::new(TestPlatform::new());
        let controller = HostController::new(platform.clone(), HcdConfig::default()).unwrap();

        assert_eq!(
            *platform.command_ring.lock(),
            Some((controller.commands().ring_base(), true))
        );
        assert_eq!(platform.dcbaa.lock().map(|(_, slots)| slots), Some(32));
        assert!(platform.event_ring.lock().is_some());
        assert_eq!(controller.handle_interrupt(), None);
        assert!(!controller.events_pending());
    }

    #[test]
    fn test_initialize_times_out_without_hardware() {
        let platform = Arc::new(TestPlatform::new());
        let config = HcdConfig {
            command_timeout_ms: 10,
            ..HcdConfig::default()
        };
        let controller = HostController::new(platform, config).unwrap();
        assert!(matches!(
            controller.initialize(),
            Err(HcdError::Timeout { .. })
        ));
    }

    #[test]
    fn test_immediate_mode_has_no_queue() {
        let platform = Arc::new(TestPlatform::new());
        let controller = HostController::new(platform, HcdConfig::default()).unwrap();
        assert_eq!(controller.process_completions(), 0);
        assert_eq!(controller.poll_timeouts(), 0);
    }
}
