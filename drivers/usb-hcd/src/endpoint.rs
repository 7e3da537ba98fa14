//! Endpoints and their transfer rings
//!
//! Each endpoint owns one transfer ring. A submitted URB becomes one Transfer
//! Descriptor (TD) on that ring:
//!
//! - control: Setup, optional Data, Status stage, each with IOC so every
//!   stage reports its own event
//! - bulk and interrupt: Normal TRBs of at most 64 KiB, chained, IOC on the
//!   last one
//! - isochronous: one Isoch TRB per packet, IOC on the last one
//!
//! The controller executes TDs in ring order, so a transfer event always
//! belongs to the oldest in-flight request. Events are matched by the TRB
//! address they report; anything that does not fall inside the oldest TD is
//! stale and dropped.
//!
//! A request that times out or is cancelled leaves a tombstone in the
//! in-flight list. The tombstone keeps the data buffer alive until the
//! controller reports the TD, then disappears without notifying anybody.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, trace, warn};

use crate::{
    arch::{self, ExecutionLevel},
    config::HcdConfig,
    context::{convert_interval, ep_type, DeviceContext, InputContext, TR_DEQUEUE_DCS},
    device::DeviceId,
    dma::DmaBuffer,
    error::{HcdError, HcdResult, UsbError},
    platform::HostPlatform,
    queue::CompletionQueue,
    ring::{Ring, RingType},
    sync::{CompletionEvent, IrqSpinLock},
    trb::{
        CompletionCode, Trb, TrbControl, MAX_TRB_TRANSFER, TRT_IN_DATA, TRT_NO_DATA, TRT_OUT_DATA,
    },
    urb::{UrbStatus, UsbRequest},
    UsbSpeed,
};

/// Endpoint ID (device context index) of the default control endpoint
pub const EP0_ID: u8 = 1;

/// Transfer event as reported on the event ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub code: CompletionCode,
    /// Bytes of the reported TRB that were not transferred
    pub residual: u32,
    pub slot_id: u8,
    pub endpoint_id: u8,
    /// Bus address of the TRB that generated the event
    pub trb_address: u64,
}

impl TransferEvent {
    pub fn from_trb(trb: &Trb) -> Self {
        Self {
            code: trb.completion_code(),
            residual: trb.transfer_length(),
            slot_id: trb.slot_id(),
            endpoint_id: trb.endpoint_id(),
            trb_address: trb.parameter(),
        }
    }
}

/// Phase of the control transfer at the head of the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStage {
    Idle,
    Setup,
    Data,
    Status,
}

/// Identifies one submitted request on its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decode `bmAttributes` bits 1:0
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 3 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Fields of a standard endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress`: number in bits 3:0, IN in bit 7
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// Device context index: endpoint number times two, plus one for IN
    pub fn endpoint_id(&self) -> u8 {
        self.number() * 2 + self.is_in() as u8
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }
}

/// Where finished asynchronous requests go
#[derive(Clone)]
pub enum CompletionSink {
    /// Call the completion routine in the context that handled the event
    Immediate,
    /// Park the request until task level drains the queue
    Deferred(Arc<CompletionQueue<Box<UsbRequest>>>),
}

/// A request the endpoint refused to take; ownership goes back to the caller
pub struct Rejected {
    pub error: HcdError,
    pub urb: Box<UsbRequest>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request rejected: {}", self.error)
    }
}

/// Failure of a synchronous transfer
#[derive(Debug)]
pub enum TransferError {
    /// Never reached the controller
    Rejected(Rejected),
    /// Completed with a USB error; the request carries the status and the
    /// length transferred before the error
    Failed(Box<UsbRequest>),
    /// No completion within the timeout; the data buffer stays with the
    /// endpoint until the controller is done with it
    Timeout(Box<UsbRequest>),
}

impl TransferError {
    pub fn into_request(self) -> Box<UsbRequest> {
        match self {
            TransferError::Rejected(rejected) => rejected.urb,
            TransferError::Failed(urb) | TransferError::Timeout(urb) => urb,
        }
    }

    pub fn usb_error(&self) -> Option<UsbError> {
        match self {
            TransferError::Rejected(_) => None,
            TransferError::Failed(urb) | TransferError::Timeout(urb) => urb.usb_error(),
        }
    }
}

/// Device-level settings shared by all endpoints of one device
#[derive(Clone)]
pub struct EndpointOwner {
    pub platform: Arc<dyn HostPlatform>,
    pub device: DeviceId,
    pub slot_id: u8,
    pub speed: UsbSpeed,
    pub sink: CompletionSink,
}

/// Hand-off point between the event handler and a task blocked in
/// [`Endpoint::transfer`]
struct Waiter {
    done: CompletionEvent,
    urb: IrqSpinLock<Option<Box<UsbRequest>>>,
}

impl Waiter {
    fn new() -> Self {
        Self {
            done: CompletionEvent::new(),
            urb: IrqSpinLock::new(ExecutionLevel::Irq, None),
        }
    }

    fn complete(&self, urb: Box<UsbRequest>) {
        *self.urb.lock() = Some(urb);
        self.done.signal();
    }

    fn take(&self) -> Option<Box<UsbRequest>> {
        self.urb.lock().take()
    }
}

enum Notify {
    /// Run the URB's completion routine through the endpoint's sink
    Routine,
    /// Wake the task blocked in a synchronous transfer
    Waiter(Arc<Waiter>),
}

struct InFlight {
    id: RequestId,
    /// `None` once the request has timed out or been cancelled
    urb: Option<Box<UsbRequest>>,
    /// Buffer of a tombstone, kept until the controller is done with it
    retained: Option<DmaBuffer>,
    notify: Notify,
    first_index: usize,
    trb_count: usize,
    last_trb: u64,
    stage: ControlStage,
    has_data: bool,
    data_len: usize,
    transferred: usize,
    deadline: Option<u64>,
}

impl InFlight {
    fn is_tombstone(&self) -> bool {
        self.urb.is_none()
    }

    /// Position of the TRB at `address` within this TD
    fn position(&self, ring: &Ring, address: u64) -> Option<usize> {
        let index = ring.index_of(address)?;
        let capacity = ring.capacity();
        if index >= capacity {
            return None;
        }
        let position = (index + capacity - self.first_index) % capacity;
        (position < self.trb_count).then_some(position)
    }

    /// Turn the record into a tombstone; returns the request with `error` set
    fn bury(&mut self, error: UsbError) -> Option<(Notify, Box<UsbRequest>)> {
        let mut urb = self.urb.take()?;
        self.retained = urb.take_buffer();
        urb.set_status(UrbStatus::Failed(error));
        urb.set_result_length(0);
        let notify = core::mem::replace(&mut self.notify, Notify::Routine);
        Some((notify, urb))
    }
}

struct EndpointState {
    ring: Ring,
    in_flight: VecDeque<InFlight>,
    valid: bool,
    max_packet_size: u16,
}

/// TRBs for one request, built before the ring lock is taken
struct TdPlan {
    trbs: Vec<Trb>,
    has_data: bool,
    data_len: usize,
}

pub struct Endpoint {
    owner: EndpointOwner,
    endpoint_id: u8,
    transfer_type: TransferType,
    /// xHCI endpoint context type
    context_type: u8,
    direction_in: bool,
    /// Endpoint context interval exponent
    interval: u8,
    window: usize,
    default_timeout_ms: u64,
    next_request: AtomicU64,
    state: IrqSpinLock<EndpointState>,
}

impl Endpoint {
    /// Default control endpoint (endpoint ID 1)
    pub fn new_control(owner: EndpointOwner, config: &HcdConfig) -> HcdResult<Self> {
        let max_packet_size = owner.speed.default_ep0_max_packet();
        Self::new(
            owner,
            config,
            EP0_ID,
            TransferType::Control,
            ep_type::CONTROL,
            false,
            0,
            max_packet_size,
        )
    }

    /// Endpoint described by an endpoint descriptor of the device
    ///
    /// The endpoint still has to be configured on the controller with the
    /// input context from [`Endpoint::configure_input_context`].
    pub fn from_descriptor(
        owner: EndpointOwner,
        config: &HcdConfig,
        descriptor: &EndpointDescriptor,
    ) -> HcdResult<Self> {
        if descriptor.number() == 0 {
            return Err(HcdError::InvalidEndpoint { endpoint_id: 0 });
        }

        let mut attributes = descriptor.attributes & 3;
        let mut max_packet_size = descriptor.max_packet_size & 0x7FF;
        let mut interval = if attributes & 1 == 1 {
            convert_interval(descriptor.interval, owner.speed)
        } else {
            0
        };

        // Low-speed devices with bulk endpoints exist; drive them as
        // interrupt endpoints
        if owner.speed == UsbSpeed::Low && attributes == 2 {
            attributes = 3;
            max_packet_size = max_packet_size.min(8);
            interval = convert_interval(1, UsbSpeed::Low);
        }

        let mut context_type = attributes;
        if attributes == 0 || descriptor.is_in() {
            context_type += 4;
        }

        Self::new(
            owner,
            config,
            descriptor.endpoint_id(),
            TransferType::from_attributes(attributes),
            context_type,
            descriptor.is_in(),
            interval,
            max_packet_size,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        owner: EndpointOwner,
        config: &HcdConfig,
        endpoint_id: u8,
        transfer_type: TransferType,
        context_type: u8,
        direction_in: bool,
        interval: u8,
        max_packet_size: u16,
    ) -> HcdResult<Self> {
        let ring = Ring::new(RingType::Transfer, config.transfer_ring_size, &*owner.platform)?;

        let mut in_flight = VecDeque::new();
        in_flight
            .try_reserve_exact(config.urb_window)
            .map_err(|_| HcdError::OutOfMemory {
                requested: config.urb_window * core::mem::size_of::<InFlight>(),
            })?;

        Ok(Self {
            owner,
            endpoint_id,
            transfer_type,
            context_type,
            direction_in,
            interval,
            window: config.urb_window,
            default_timeout_ms: config.transfer_timeout_ms,
            next_request: AtomicU64::new(1),
            state: IrqSpinLock::new(
                ExecutionLevel::Irq,
                EndpointState {
                    ring,
                    in_flight,
                    valid: true,
                    max_packet_size,
                },
            ),
        })
    }

    pub fn endpoint_id(&self) -> u8 {
        self.endpoint_id
    }

    pub fn slot_id(&self) -> u8 {
        self.owner.slot_id
    }

    pub fn device(&self) -> DeviceId {
        self.owner.device
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn is_in(&self) -> bool {
        self.direction_in
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn max_packet_size(&self) -> u16 {
        self.state.lock().max_packet_size
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Requests submitted and not yet completed, tombstones included
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Stage of the control transfer at the head of the endpoint
    pub fn control_stage(&self) -> ControlStage {
        self.state
            .lock()
            .in_flight
            .front()
            .map_or(ControlStage::Idle, |record| record.stage)
    }

    /// Bus address of the transfer ring
    pub fn ring_base(&self) -> u64 {
        self.state.lock().ring.base_address()
    }

    /// Fill the endpoint context of `input` for Configure Endpoint
    pub fn configure_input_context(&self, input: &mut InputContext) {
        let (dequeue, max_packet_size) = {
            let state = self.state.lock();
            (state.ring.base_address(), state.max_packet_size)
        };

        input.control.add_flags |= 1 << self.endpoint_id;
        input.control.drop_flags |= 1 << self.endpoint_id;

        let interval = self.interval;
        let context = input.endpoint_mut(self.endpoint_id);
        context.set_tr_dequeue_pointer(dequeue | TR_DEQUEUE_DCS);
        context.set_ep_type(self.context_type);
        context.set_max_packet_size(max_packet_size);
        context.set_max_burst(0);
        context.set_error_count(3);

        match self.transfer_type {
            TransferType::Control => context.set_average_trb_length(8),
            TransferType::Bulk => context.set_average_trb_length(256),
            TransferType::Interrupt => {
                context.set_interval(interval);
                context.set_average_trb_length(16);
                context.set_max_esit_payload(max_packet_size);
            }
            TransferType::Isochronous => {
                context.set_interval(interval);
                context.set_average_trb_length(max_packet_size);
                context.set_max_esit_payload(max_packet_size);
            }
        }
    }

    /// Record the EP0 max packet size read from the device descriptor
    ///
    /// Returns `true` if the controller must be told with Evaluate Context
    /// (full-speed devices, where the default of 8 may be wrong).
    pub fn set_max_packet_size(&self, max_packet_size: u16) -> HcdResult<bool> {
        assert_eq!(self.endpoint_id, EP0_ID, "max packet update on non-control endpoint");
        if self.owner.speed != UsbSpeed::Full {
            return Ok(false);
        }
        if !(8..=64).contains(&max_packet_size) {
            return Err(HcdError::InvalidArgument {
                name: "max_packet_size",
                value: "EP0 max packet size must be 8..=64",
            });
        }
        self.state.lock().max_packet_size = max_packet_size;
        Ok(true)
    }

    /// Input context for Evaluate Context after a max packet size update
    pub fn max_packet_input_context(&self, current: &DeviceContext) -> InputContext {
        let mut input = InputContext {
            device: *current,
            ..InputContext::default()
        };
        input.control.add_flags = 1 << EP0_ID;
        input.control.drop_flags = 1 << EP0_ID;
        input
            .endpoint_mut(EP0_ID)
            .set_max_packet_size(self.max_packet_size());
        input
    }

    /// Submit `urb` and return without waiting
    ///
    /// The completion routine of the request runs once the controller
    /// reports the TD, or when the request is cancelled or times out.
    /// `timeout_ms == 0` disables the timeout; expired requests are found by
    /// [`Endpoint::poll_timeouts`].
    pub fn transfer_async(
        &self,
        urb: Box<UsbRequest>,
        timeout_ms: u64,
    ) -> Result<RequestId, Rejected> {
        let deadline = (timeout_ms != 0).then(|| self.owner.platform.now_ms() + timeout_ms);
        self.submit(urb, Notify::Routine, deadline)
    }

    /// Submit `urb` and block the calling task until it completes
    ///
    /// `timeout_ms == 0` uses the configured default. A completion routine set
    /// on the request is not called.
    pub fn transfer(
        &self,
        mut urb: Box<UsbRequest>,
        timeout_ms: u64,
    ) -> Result<Box<UsbRequest>, TransferError> {
        let timeout_ms = if timeout_ms == 0 {
            self.default_timeout_ms
        } else {
            timeout_ms
        };

        let routine = urb.take_completion_routine();
        let waiter = Arc::new(Waiter::new());
        let id = match self.submit(urb, Notify::Waiter(waiter.clone()), None) {
            Ok(id) => id,
            Err(mut rejected) => {
                if let Some(routine) = routine {
                    rejected.urb.set_completion_routine(routine);
                }
                return Err(TransferError::Rejected(rejected));
            }
        };

        let platform = &*self.owner.platform;
        if !waiter.done.wait_timeout(platform, timeout_ms) {
            let buried = {
                let mut state = self.state.lock();
                state
                    .in_flight
                    .iter_mut()
                    .find(|record| record.id == id)
                    .and_then(|record| record.bury(UsbError::Timeout))
            };
            if let Some((_, mut urb)) = buried {
                debug!(
                    "Transfer on slot {} endpoint {} timed out after {} ms",
                    self.owner.slot_id, self.endpoint_id, timeout_ms
                );
                if let Some(routine) = routine {
                    urb.set_completion_routine(routine);
                }
                return Err(TransferError::Timeout(urb));
            }
            // Completed while the timeout was being handled; the event
            // handler is about to hand the request over
            while !waiter.done.is_signaled() {
                platform.yield_now();
            }
        }

        let mut urb = loop {
            if let Some(urb) = waiter.take() {
                break urb;
            }
            platform.yield_now();
        };
        if let Some(routine) = routine {
            urb.set_completion_routine(routine);
        }

        if urb.is_success() {
            Ok(urb)
        } else {
            Err(TransferError::Failed(urb))
        }
    }

    fn submit(
        &self,
        urb: Box<UsbRequest>,
        notify: Notify,
        deadline: Option<u64>,
    ) -> Result<RequestId, Rejected> {
        let plan = match self.plan(&urb) {
            Ok(plan) => plan,
            Err(error) => return Err(Rejected { error, urb }),
        };
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));

        {
            let mut state = self.state.lock();
            let state = &mut *state;

            let refused = if !state.valid {
                Some(HcdError::EndpointNotValid {
                    endpoint_id: self.endpoint_id,
                })
            } else if state.in_flight.len() >= self.window {
                Some(HcdError::ResourceExhausted {
                    resource: "URB window",
                })
            } else if plan.trbs.len() > state.ring.capacity() - 1 {
                Some(HcdError::InvalidArgument {
                    name: "urb",
                    value: "transfer does not fit in the transfer ring",
                })
            } else if state.ring.free_slots() < plan.trbs.len() {
                Some(HcdError::RingFull {
                    ring: RingType::Transfer,
                })
            } else {
                None
            };
            if let Some(error) = refused {
                return Err(Rejected { error, urb });
            }

            let first_index = state.ring.enqueue_index();
            let mut last_trb = 0;
            for trb in &plan.trbs {
                // Space was checked above
                if let Some(address) = state.ring.enqueue(*trb) {
                    last_trb = address;
                }
            }

            state.in_flight.push_back(InFlight {
                id,
                urb: Some(urb),
                retained: None,
                notify,
                first_index,
                trb_count: plan.trbs.len(),
                last_trb,
                stage: match self.transfer_type {
                    TransferType::Control => ControlStage::Setup,
                    _ => ControlStage::Idle,
                },
                has_data: plan.has_data,
                data_len: plan.data_len,
                transferred: 0,
                deadline,
            });
        }

        arch::dsb();
        self.owner
            .platform
            .ring_doorbell(self.owner.slot_id, self.endpoint_id as u32);

        trace!(
            "Slot {} endpoint {}: {} TRBs queued",
            self.owner.slot_id,
            self.endpoint_id,
            plan.trbs.len()
        );
        Ok(id)
    }

    /// Translate a request into TRBs
    fn plan(&self, urb: &UsbRequest) -> HcdResult<TdPlan> {
        let data_len = urb.buffer_length();
        let data = urb
            .buffer()
            .map_or(0, |buffer| self.owner.platform.dma_address(buffer.addr()));
        let mut trbs = Vec::new();

        match self.transfer_type {
            TransferType::Control => {
                let setup = urb.setup().ok_or(HcdError::InvalidArgument {
                    name: "urb",
                    value: "control request without setup packet",
                })?;
                if data_len > MAX_TRB_TRANSFER {
                    return Err(HcdError::InvalidArgument {
                        name: "urb",
                        value: "control data stage larger than 64 KiB",
                    });
                }
                if setup.is_in() && data_len == 0 {
                    return Err(HcdError::InvalidArgument {
                        name: "urb",
                        value: "IN control request without data buffer",
                    });
                }

                let (transfer_type, status_in) = if data_len == 0 {
                    (TRT_NO_DATA, true)
                } else if setup.is_in() {
                    (TRT_IN_DATA, false)
                } else {
                    (TRT_OUT_DATA, true)
                };

                trbs.push(Trb::setup_stage(setup, transfer_type, TrbControl::IOC));
                if data_len > 0 {
                    trbs.push(Trb::data_stage(
                        data,
                        data_len as u32,
                        setup.is_in(),
                        TrbControl::IOC,
                    ));
                }
                trbs.push(Trb::status_stage(status_in, TrbControl::IOC));
            }

            TransferType::Bulk | TransferType::Interrupt => {
                if data_len == 0 {
                    return Err(HcdError::InvalidArgument {
                        name: "urb",
                        value: "transfer without data buffer",
                    });
                }
                let chunks = data_len.div_ceil(MAX_TRB_TRANSFER);
                for chunk in 0..chunks {
                    let offset = chunk * MAX_TRB_TRANSFER;
                    let length = (data_len - offset).min(MAX_TRB_TRANSFER);
                    let flags = if chunk + 1 == chunks {
                        TrbControl::IOC
                    } else {
                        TrbControl::CHAIN | TrbControl::ISP
                    };
                    trbs.push(Trb::normal(
                        data + offset as u64,
                        length as u32,
                        (chunks - chunk - 1) as u32,
                        flags,
                    ));
                }
            }

            TransferType::Isochronous => {
                let packets = urb.iso_packets();
                if packets.is_empty() {
                    return Err(HcdError::InvalidArgument {
                        name: "urb",
                        value: "isochronous request without packets",
                    });
                }
                let total: usize = packets.iter().map(|&size| size as usize).sum();
                if total > data_len {
                    return Err(HcdError::InvalidArgument {
                        name: "urb",
                        value: "isochronous packets exceed the buffer",
                    });
                }

                let mut offset = 0u64;
                for (i, &size) in packets.iter().enumerate() {
                    let mut flags = TrbControl::SIA;
                    if i + 1 == packets.len() {
                        flags |= TrbControl::IOC;
                    }
                    trbs.push(Trb::isoch(
                        data + offset,
                        size as u32,
                        (packets.len() - i - 1) as u32,
                        flags,
                    ));
                    offset += size as u64;
                }
                return Ok(TdPlan {
                    trbs,
                    has_data: true,
                    data_len: total,
                });
            }
        }

        Ok(TdPlan {
            trbs,
            has_data: data_len > 0,
            data_len,
        })
    }

    /// Handle a transfer event for this endpoint
    pub fn transfer_event(&self, event: &TransferEvent) {
        if matches!(
            event.code,
            CompletionCode::RING_UNDERRUN | CompletionCode::RING_OVERRUN
        ) {
            // Isochronous ring ran empty or full; no request involved
            trace!("Endpoint {}: {}", self.endpoint_id, event.code);
            return;
        }

        let finished = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let position = state
                .in_flight
                .front()
                .and_then(|record| record.position(&state.ring, event.trb_address));

            match position {
                None => None,
                Some(position) => {
                    let outcome = state
                        .in_flight
                        .front_mut()
                        .and_then(|record| self.advance(record, position, event));
                    match outcome {
                        None => return,
                        Some(outcome) => {
                            let record = state.in_flight.pop_front();
                            if let Some(record) = &record {
                                state.ring.release_through(record.last_trb);
                            }
                            record.map(|record| (record, outcome))
                        }
                    }
                }
            }
        };

        let Some((mut record, (status, length))) = finished else {
            warn!(
                "Stale transfer event for slot {} endpoint {} (TRB {:#x}, {})",
                self.owner.slot_id, self.endpoint_id, event.trb_address, event.code
            );
            return;
        };

        let Some(mut urb) = record.urb.take() else {
            trace!(
                "Endpoint {}: late completion of cancelled request dropped",
                self.endpoint_id
            );
            return;
        };

        if let UrbStatus::Failed(error) = status {
            if self.transfer_type != TransferType::Isochronous {
                warn!(
                    "Transfer error {} on slot {} endpoint {} ({})",
                    event.code, self.owner.slot_id, self.endpoint_id, error
                );
            }
        }

        urb.set_status(status);
        urb.set_result_length(length);
        self.dispatch(record.notify, urb);
    }

    /// Apply an event at TRB `position` of the head TD; returns the final
    /// status and length once the TD is done
    fn advance(
        &self,
        record: &mut InFlight,
        position: usize,
        event: &TransferEvent,
    ) -> Option<(UrbStatus, usize)> {
        let ok = event.code.is_transfer_ok();
        let residual = event.residual as usize;
        let failed = |transferred| Some((UrbStatus::Failed(event.code.usb_error()), transferred));

        match self.transfer_type {
            TransferType::Control => {
                let stage = if position == 0 {
                    ControlStage::Setup
                } else if record.has_data && position == 1 {
                    ControlStage::Data
                } else {
                    ControlStage::Status
                };
                record.stage = stage;
                if !ok {
                    return failed(record.transferred);
                }

                match stage {
                    ControlStage::Setup => {
                        record.stage = if record.has_data {
                            ControlStage::Data
                        } else {
                            ControlStage::Status
                        };
                        None
                    }
                    ControlStage::Data => {
                        record.transferred = record.data_len.saturating_sub(residual);
                        record.stage = ControlStage::Status;
                        None
                    }
                    _ => {
                        record.stage = ControlStage::Idle;
                        Some((UrbStatus::Success, record.transferred))
                    }
                }
            }

            TransferType::Bulk | TransferType::Interrupt => {
                let offset = position * MAX_TRB_TRANSFER;
                let length = (record.data_len - offset).min(MAX_TRB_TRANSFER);
                let transferred = offset + length.saturating_sub(residual);
                let last = position + 1 == record.trb_count;

                if !ok {
                    failed(transferred)
                } else if last || event.code == CompletionCode::SHORT_PACKET {
                    Some((UrbStatus::Success, transferred))
                } else {
                    None
                }
            }

            TransferType::Isochronous => {
                if position + 1 < record.trb_count {
                    // Packet errors are reported per TRB; the TD goes on
                    return None;
                }
                let transferred = record.data_len.saturating_sub(residual);
                if ok {
                    Some((UrbStatus::Success, transferred))
                } else {
                    failed(transferred)
                }
            }
        }
    }

    fn dispatch(&self, notify: Notify, urb: Box<UsbRequest>) {
        match notify {
            Notify::Waiter(waiter) => waiter.complete(urb),
            Notify::Routine => match &self.owner.sink {
                CompletionSink::Immediate => urb.call_completion_routine(),
                CompletionSink::Deferred(queue) => {
                    if let Err(urb) = queue.enqueue(urb, self.owner.device) {
                        warn!("Completion queue full, completing request directly");
                        urb.call_completion_routine();
                    }
                }
            },
        }
    }

    /// Cancel a request submitted with [`Endpoint::transfer_async`]
    ///
    /// The completion routine runs once with [`UsbError::Aborted`]; a late
    /// completion from the controller is dropped. Returns `false` if the
    /// request has already completed.
    pub fn cancel(&self, id: RequestId) -> bool {
        let buried = {
            let mut state = self.state.lock();
            state
                .in_flight
                .iter_mut()
                .find(|record| record.id == id)
                .and_then(|record| record.bury(UsbError::Aborted))
        };

        match buried {
            Some((notify, urb)) => {
                debug!("Endpoint {}: request {:?} cancelled", self.endpoint_id, id);
                self.dispatch(notify, urb);
                true
            }
            None => false,
        }
    }

    /// Fail asynchronous requests whose deadline has passed
    ///
    /// Returns the number of requests that timed out.
    pub fn poll_timeouts(&self, now_ms: u64) -> usize {
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            for record in state.in_flight.iter_mut() {
                if record.deadline.is_some_and(|deadline| now_ms >= deadline) {
                    record.deadline = None;
                    if let Some(buried) = record.bury(UsbError::Timeout) {
                        expired.push(buried);
                    }
                }
            }
        }

        let count = expired.len();
        for (notify, urb) in expired {
            debug!("Endpoint {}: request timed out", self.endpoint_id);
            self.dispatch(notify, urb);
        }
        count
    }

    /// Shut the endpoint down
    ///
    /// New submissions are refused. In-flight requests are dropped without
    /// running their completion routines; tasks blocked in
    /// [`Endpoint::transfer`] are woken with [`UsbError::Aborted`]. Returns
    /// the number of requests dropped.
    pub fn invalidate(&self) -> usize {
        let drained: Vec<InFlight> = {
            let mut state = self.state.lock();
            state.valid = false;
            state.in_flight.drain(..).collect()
        };

        let count = drained.len();
        for mut record in drained {
            if let Some((Notify::Waiter(waiter), urb)) = record.bury(UsbError::Aborted) {
                waiter.complete(urb);
            }
        }
        count
    }

    /// Whether the head of the in-flight list is a tombstone
    pub fn head_is_tombstone(&self) -> bool {
        self.state
            .lock()
            .in_flight
            .front()
            .is_some_and(InFlight::is_tombstone)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("slot_id", &self.owner.slot_id)
            .field("endpoint_id", &self.endpoint_id)
            .field("type", &self.transfer_type)
            .field("in", &self.direction_in)
            .finish_non_exhaustive()
    }
}
