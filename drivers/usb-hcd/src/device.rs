//! Devices attached to the controller

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use log::{trace, warn};

use crate::{
    arch::ExecutionLevel,
    config::HcdConfig,
    context::{ep_type, ContextBuffer, DeviceContext, InputContext, MAX_ENDPOINTS, TR_DEQUEUE_DCS},
    endpoint::{Endpoint, EndpointOwner, TransferEvent, EP0_ID},
    error::{HcdError, HcdResult},
    sync::IrqSpinLock,
    UsbSpeed,
};

/// Identity of an attached device
///
/// Unlike slot IDs, device IDs are never reused, so queue entries of a
/// detached device cannot be mistaken for those of its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Transaction translator of a low/full-speed device behind a high-speed hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTranslator {
    pub hub_slot_id: u8,
    pub hub_port: u8,
    pub multi_tt: bool,
}

type EndpointTable = [Option<Arc<Endpoint>>; MAX_ENDPOINTS];

/// A device occupying one slot
pub struct UsbDevice {
    owner: EndpointOwner,
    root_port: u8,
    route_string: u32,
    tt: Option<TransactionTranslator>,
    /// Output device context; its address goes into the DCBAA
    context: ContextBuffer,
    endpoints: IrqSpinLock<EndpointTable>,
}

impl UsbDevice {
    /// Create the device and its default control endpoint
    pub fn new(owner: EndpointOwner, root_port: u8, config: &HcdConfig) -> HcdResult<Self> {
        let ep0 = Arc::new(Endpoint::new_control(owner.clone(), config)?);
        let device = Self {
            owner,
            root_port,
            route_string: 0,
            tt: None,
            context: ContextBuffer::device()?,
            endpoints: IrqSpinLock::new(ExecutionLevel::Irq, core::array::from_fn(|_| None)),
        };
        device.register_endpoint(ep0)?;
        Ok(device)
    }

    /// Place the device behind a hub; must be called before Address Device
    pub fn set_hub_route(&mut self, route_string: u32, tt: Option<TransactionTranslator>) {
        self.route_string = route_string;
        self.tt = tt;
    }

    pub fn id(&self) -> DeviceId {
        self.owner.device
    }

    pub fn slot_id(&self) -> u8 {
        self.owner.slot_id
    }

    pub fn speed(&self) -> UsbSpeed {
        self.owner.speed
    }

    pub fn root_port(&self) -> u8 {
        self.root_port
    }

    /// Settings new endpoints of this device are created with
    pub fn endpoint_owner(&self) -> EndpointOwner {
        self.owner.clone()
    }

    /// CPU address of the output device context
    pub fn context_addr(&self) -> usize {
        self.context.addr()
    }

    /// Snapshot of the output device context
    pub fn device_context(&self) -> DeviceContext {
        self.context.read_device()
    }

    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) -> HcdResult<()> {
        let endpoint_id = endpoint.endpoint_id();
        if !(1..=MAX_ENDPOINTS as u8).contains(&endpoint_id) {
            return Err(HcdError::InvalidEndpoint { endpoint_id });
        }
        self.endpoints.lock()[endpoint_id as usize - 1] = Some(endpoint);
        Ok(())
    }

    pub fn endpoint(&self, endpoint_id: u8) -> Option<Arc<Endpoint>> {
        if !(1..=MAX_ENDPOINTS as u8).contains(&endpoint_id) {
            return None;
        }
        self.endpoints.lock()[endpoint_id as usize - 1].clone()
    }

    /// All registered endpoints, EP0 first
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.lock().iter().flatten().cloned().collect()
    }

    /// Default control endpoint
    pub fn ep0(&self) -> Option<Arc<Endpoint>> {
        self.endpoint(EP0_ID)
    }

    /// Route a transfer event to the endpoint it belongs to
    pub fn transfer_event(&self, event: &TransferEvent) {
        match self.endpoint(event.endpoint_id) {
            Some(endpoint) => endpoint.transfer_event(event),
            None => warn!(
                "Transfer event for unknown endpoint {} on slot {}",
                event.endpoint_id,
                self.slot_id()
            ),
        }
    }

    /// Input context for Address Device: slot context plus EP0
    pub fn address_input_context(&self) -> HcdResult<ContextBuffer> {
        let ep0 = self.ep0().ok_or(HcdError::InvalidEndpoint {
            endpoint_id: EP0_ID,
        })?;

        let mut input = InputContext::default();
        input.control.add_flags = 0b11;

        let slot = &mut input.device.slot;
        slot.set_root_hub_port(self.root_port);
        slot.set_route_string(self.route_string);
        slot.set_speed(self.speed());
        slot.set_context_entries(1);
        if let Some(tt) = self.tt {
            slot.set_tt(tt.hub_slot_id, tt.hub_port, tt.multi_tt);
        }

        let context = input.endpoint_mut(EP0_ID);
        context.set_tr_dequeue_pointer(ep0.ring_base() | TR_DEQUEUE_DCS);
        context.set_interval(0);
        context.set_error_count(3);
        context.set_ep_type(ep_type::CONTROL);
        context.set_max_burst(0);
        context.set_average_trb_length(8);
        context.set_max_packet_size(self.speed().default_ep0_max_packet());

        let mut buffer = ContextBuffer::input()?;
        buffer.write_input(&input);
        Ok(buffer)
    }

    /// Input context for Configure Endpoint adding `endpoint`
    pub fn configure_input_context(&self, endpoint: &Endpoint) -> HcdResult<ContextBuffer> {
        let current = self.device_context();
        let mut input = InputContext::default();

        input.control.add_flags = 1;
        input.device.slot = current.slot;
        let entries = current.slot.context_entries().max(endpoint.endpoint_id());
        input.device.slot.set_context_entries(entries);
        endpoint.configure_input_context(&mut input);

        let mut buffer = ContextBuffer::input()?;
        buffer.write_input(&input);
        Ok(buffer)
    }

    /// Invalidate every endpoint and drop their in-flight requests
    ///
    /// Returns the number of requests dropped.
    pub fn shutdown(&self) -> usize {
        let endpoints: EndpointTable = {
            let mut table = self.endpoints.lock();
            core::mem::replace(&mut *table, core::array::from_fn(|_| None))
        };

        let dropped: usize = endpoints
            .iter()
            .flatten()
            .map(|endpoint| endpoint.invalidate())
            .sum();
        trace!("{}: shut down, {} requests dropped", self.id(), dropped);
        dropped
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("id", &self.id())
            .field("slot_id", &self.slot_id())
            .field("speed", &self.speed())
            .field("root_port", &self.root_port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::{CompletionSink, EndpointDescriptor},
        testing::TestPlatform,
        trb::CompletionCode,
    };

    fn device(speed: UsbSpeed) -> UsbDevice {
        let owner = EndpointOwner {
            platform: Arc::new(TestPlatform::new()),
            device: DeviceId(9),
            slot_id: 4,
            speed,
            sink: CompletionSink::Immediate,
        };
        UsbDevice::new(owner, 2, &HcdConfig::default()).unwrap()
    }

    #[test]
    fn test_new_device_has_ep0() {
        let device = device(UsbSpeed::High);
        let ep0 = device.ep0().unwrap();
        assert_eq!(ep0.endpoint_id(), EP0_ID);
        assert_eq!(ep0.slot_id(), 4);
        assert!(device.endpoint(2).is_none());
        assert!(device.endpoint(0).is_none());
        assert!(device.endpoint(32).is_none());
    }

    #[test]
    fn test_address_input_context() {
        let device = device(UsbSpeed::Full);
        let input = device.address_input_context().unwrap().read_input();
        assert_eq!(input.control.add_flags, 3);
        assert_eq!(input.device.slot.root_hub_port(), 2);
        assert_eq!(input.device.slot.context_entries(), 1);

        let ep0 = &input.device.endpoints[0];
        assert_eq!(ep0.ep_type(), ep_type::CONTROL);
        assert_eq!(ep0.max_packet_size(), 8);
        assert_eq!(
            ep0.tr_dequeue_pointer(),
            device.ep0().unwrap().ring_base() | TR_DEQUEUE_DCS
        );
    }

    #[test]
    fn test_hub_route_and_tt() {
        let mut device = device(UsbSpeed::Low);
        device.set_hub_route(
            0x21,
            Some(TransactionTranslator {
                hub_slot_id: 3,
                hub_port: 1,
                multi_tt: true,
            }),
        );
        let slot = device.address_input_context().unwrap().read_input().device.slot;
        assert_eq!(slot.dwords[0] & 0xF_FFFF, 0x21);
        assert_eq!(slot.dwords[2] & 0xFFFF, 3 | 1 << 8);
        assert_ne!(slot.dwords[0] & 1 << 25, 0);
    }

    #[test]
    fn test_configure_input_context_raises_entries() {
        let device = device(UsbSpeed::High);
        let endpoint = Endpoint::from_descriptor(
            device.endpoint_owner(),
            &HcdConfig::default(),
            &EndpointDescriptor {
                address: 0x82,
                attributes: 3,
                max_packet_size: 8,
                interval: 4,
            },
        )
        .unwrap();
        let input = device.configure_input_context(&endpoint).unwrap().read_input();
        assert_eq!(input.control.add_flags, 1 | 1 << 5);
        assert_eq!(input.device.slot.context_entries(), 5);
        assert_eq!(input.device.endpoints[4].ep_type(), ep_type::INTERRUPT_IN);
    }

    #[test]
    fn test_unknown_endpoint_event_is_dropped() {
        let device = device(UsbSpeed::High);
        device.transfer_event(&TransferEvent {
            code: CompletionCode::SUCCESS,
            residual: 0,
            slot_id: 4,
            endpoint_id: 7,
            trb_address: 0,
        });
        assert_eq!(device.ep0().unwrap().in_flight(), 0);
    }

    #[test]
    fn test_shutdown_invalidates_endpoints() {
        let device = device(UsbSpeed::High);
        let ep0 = device.ep0().unwrap();
        assert_eq!(device.shutdown(), 0);
        assert!(!ep0.is_valid());
        assert!(device.ep0().is_none());
    }
}
