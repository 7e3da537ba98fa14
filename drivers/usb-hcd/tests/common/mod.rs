//! Simulated xHCI controller for integration tests
//!
//! [`MockXhc`] implements [`HostPlatform`] and plays the hardware side of the
//! rings: it consumes command and transfer TRBs from memory using its own
//! cycle state, follows link TRBs, and writes event TRBs into the event ring
//! segment the driver programmed. Doorbells are processed whenever a task
//! yields, and every batch of events is followed by a call to
//! [`HostController::handle_interrupt`], standing in for the interrupt line.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    ptr,
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use usb_hcd::{
    trb::{
        CompletionCode, Trb, TrbControl, TrbType, TRB_COMPLETION_CODE_SHIFT,
        TRB_ENDPOINT_ID_SHIFT, TRB_PORT_ID_SHIFT, TRB_SIZE, TRB_SLOT_ID_SHIFT,
    },
    HcdConfig, HostController, HostPlatform,
};

const CONTEXT_SIZE: u64 = 32;
const TRANSFER_LENGTH_MASK: u32 = 0x1_FFFF;

/// Consumer position on a producer ring
#[derive(Debug, Default)]
struct Cursor {
    dequeue: u64,
    cycle: bool,
    /// Inside a TD whose first TRB has been processed
    in_td: bool,
    /// Skipping the rest of a TD after an error or short packet
    skipping: bool,
    /// The last TRB processed had CHAIN set
    chained: bool,
    /// Bytes moved so far in the current TD
    td_offset: usize,
}

impl Cursor {
    fn new(pointer: u64) -> Self {
        Self {
            dequeue: pointer & !0xF,
            cycle: pointer & 1 != 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct EventProducer {
    base: u64,
    size: u64,
    index: u64,
    cycle: bool,
}

#[derive(Default)]
struct XhcState {
    commands: Option<Cursor>,
    events: EventProducer,
    dcbaa: u64,
    transfer: HashMap<(u8, u8), Cursor>,
    pending: Vec<(u8, u32)>,
    next_slot: u8,
    /// Data returned by IN TRBs per (slot, endpoint ID)
    in_data: HashMap<(u8, u8), Vec<u8>>,
    /// Data received by OUT TRBs per (slot, endpoint ID)
    out_data: HashMap<(u8, u8), Vec<u8>>,
    transfer_failures: HashMap<(u8, u8), VecDeque<CompletionCode>>,
    /// Overrides for the next command of a type, or of any type
    command_failures: Vec<(Option<TrbType>, CompletionCode)>,
    executed: Vec<TrbType>,
    /// Most valid command TRBs found behind a single doorbell
    max_command_batch: usize,
    posted: usize,
}

pub struct MockXhc {
    clock: AtomicU64,
    paused: AtomicBool,
    state: Mutex<XhcState>,
    controller: Mutex<Weak<HostController>>,
    doorbells: Mutex<Vec<(u8, u32)>>,
    event_dequeues: Mutex<Vec<u64>>,
}

/// Controller wired to a fresh simulated xHC
pub fn setup(config: HcdConfig) -> (Arc<MockXhc>, Arc<HostController>) {
    let xhc = Arc::new(MockXhc::new());
    let controller = Arc::new(
        HostController::new(xhc.clone(), config).expect("controller allocation failed"),
    );
    xhc.connect(&controller);
    controller.initialize().expect("controller did not come up");
    (xhc, controller)
}

impl MockXhc {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            state: Mutex::new(XhcState {
                next_slot: 1,
                ..XhcState::default()
            }),
            controller: Mutex::new(Weak::new()),
            doorbells: Mutex::new(Vec::new()),
            event_dequeues: Mutex::new(Vec::new()),
        }
    }

    /// Deliver interrupts to `controller`
    pub fn connect(&self, controller: &Arc<HostController>) {
        *self.controller.lock().unwrap() = Arc::downgrade(controller);
    }

    /// Stop consuming rings; doorbells stay pending until [`MockXhc::resume`]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.run();
    }

    pub fn advance_clock(&self, ms: u64) {
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_in_data(&self, slot_id: u8, endpoint_id: u8, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .in_data
            .insert((slot_id, endpoint_id), data.to_vec());
    }

    pub fn out_data(&self, slot_id: u8, endpoint_id: u8) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .out_data
            .get(&(slot_id, endpoint_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Complete the next TD on the endpoint with `code`
    pub fn fail_next_transfer(&self, slot_id: u8, endpoint_id: u8, code: CompletionCode) {
        self.state
            .lock()
            .unwrap()
            .transfer_failures
            .entry((slot_id, endpoint_id))
            .or_default()
            .push_back(code);
    }

    /// Complete the next command with `code`
    pub fn fail_next_command(&self, code: CompletionCode) {
        self.state.lock().unwrap().command_failures.push((None, code));
    }

    /// Complete the next command of type `ty` with `code`
    pub fn fail_command(&self, ty: TrbType, code: CompletionCode) {
        self.state
            .lock()
            .unwrap()
            .command_failures
            .push((Some(ty), code));
    }

    /// Commands executed so far, in order
    pub fn executed(&self) -> Vec<TrbType> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn count_executed(&self, ty: TrbType) -> usize {
        self.executed().iter().filter(|&&executed| executed == ty).count()
    }

    /// Largest number of commands the controller found queued at once
    pub fn max_commands_per_doorbell(&self) -> usize {
        self.state.lock().unwrap().max_command_batch
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn event_dequeues(&self) -> Vec<u64> {
        self.event_dequeues.lock().unwrap().clone()
    }

    /// Whether the endpoint has a transfer ring the simulation knows about
    pub fn endpoint_enabled(&self, slot_id: u8, endpoint_id: u8) -> bool {
        self.state
            .lock()
            .unwrap()
            .transfer
            .contains_key(&(slot_id, endpoint_id))
    }

    /// Post a port status change event without raising the interrupt
    pub fn post_port_change(&self, port_id: u8) {
        let trb = Trb::new(
            (port_id as u64) << TRB_PORT_ID_SHIFT,
            (CompletionCode::SUCCESS.0 as u32) << TRB_COMPLETION_CODE_SHIFT,
            TrbType::PortStatusChange.control_bits(),
        );
        self.state.lock().unwrap().post_event(trb);
    }

    /// Process pending doorbells and raise the interrupt for new events
    ///
    /// Returns the number of events posted.
    pub fn run(&self) -> usize {
        if self.paused.load(Ordering::SeqCst) {
            return 0;
        }

        let posted = {
            let mut state = self.state.lock().unwrap();
            let doorbells = std::mem::take(&mut state.pending);
            for (slot_id, target) in doorbells {
                if slot_id == 0 {
                    state.process_commands();
                } else {
                    state.process_transfers(slot_id, target as u8);
                }
            }
            std::mem::take(&mut state.posted)
        };

        if posted > 0 {
            self.interrupt();
        }
        posted
    }

    /// Drain the event ring the way the interrupt handler would
    pub fn interrupt(&self) {
        let controller = self.controller.lock().unwrap().upgrade();
        if let Some(controller) = controller {
            while controller.handle_interrupt().is_some() {}
        }
    }
}

impl HostPlatform for MockXhc {
    fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn yield_now(&self) {
        self.clock.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        self.run();
    }

    fn ring_doorbell(&self, slot_id: u8, target: u32) {
        self.doorbells.lock().unwrap().push((slot_id, target));
        self.state.lock().unwrap().pending.push((slot_id, target));
    }

    fn set_command_ring(&self, dequeue: u64, cycle_state: bool) {
        self.state.lock().unwrap().commands = Some(Cursor::new(dequeue | cycle_state as u64));
    }

    fn set_event_ring(&self, segment_table: u64, segment_count: u32, _dequeue: u64) {
        assert_eq!(segment_count, 1);
        let base = read_u64(segment_table);
        let size = read_u32(segment_table + 8) as u64;
        self.state.lock().unwrap().events = EventProducer {
            base,
            size,
            index: 0,
            cycle: true,
        };
    }

    fn write_event_dequeue(&self, dequeue: u64) {
        self.event_dequeues.lock().unwrap().push(dequeue);
    }

    fn set_device_context_base(&self, dcbaa: u64, _max_slots: u8) {
        self.state.lock().unwrap().dcbaa = dcbaa;
    }
}

impl XhcState {
    fn post_event(&mut self, mut trb: Trb) {
        let events = &mut self.events;
        let address = events.base + events.index * TRB_SIZE as u64;

        // Body first with the stale cycle bit, then hand the TRB over
        trb.set_cycle(!events.cycle);
        write_trb(address, trb);
        fence(Ordering::Release);
        trb.set_cycle(events.cycle);
        write_u32(address + 12, trb.control);

        events.index += 1;
        if events.index == events.size {
            events.index = 0;
            events.cycle = !events.cycle;
        }
        self.posted += 1;
    }

    fn process_commands(&mut self) {
        let mut batch = 0;
        loop {
            let Some(cursor) = self.commands.as_mut() else {
                break;
            };
            let address = cursor.dequeue;
            let trb = read_trb(address);
            if trb.cycle() != cursor.cycle {
                break;
            }

            match trb.trb_type() {
                Some(TrbType::Link) => {
                    cursor.dequeue = trb.parameter();
                    if trb.flags().contains(TrbControl::TOGGLE_CYCLE) {
                        cursor.cycle = !cursor.cycle;
                    }
                    continue;
                }
                _ => cursor.dequeue += TRB_SIZE as u64,
            }

            batch += 1;
            let (code, slot_id) = self.execute(&trb);
            self.post_event(Trb::new(
                address,
                (code.0 as u32) << TRB_COMPLETION_CODE_SHIFT,
                TrbType::CommandCompletion.control_bits() | (slot_id as u32) << TRB_SLOT_ID_SHIFT,
            ));
        }
        self.max_command_batch = self.max_command_batch.max(batch);
    }

    fn execute(&mut self, trb: &Trb) -> (CompletionCode, u8) {
        let ty = trb.trb_type().expect("unknown command TRB");
        self.executed.push(ty);
        let slot_id = trb.slot_id();

        let failure = self
            .command_failures
            .iter()
            .position(|&(target, _)| target.map_or(true, |target| target == ty));
        if let Some(index) = failure {
            let (_, code) = self.command_failures.remove(index);
            return (code, slot_id);
        }

        match ty {
            TrbType::EnableSlot => {
                let slot_id = self.next_slot;
                self.next_slot += 1;
                return (CompletionCode::SUCCESS, slot_id);
            }
            TrbType::DisableSlot => {
                self.transfer.retain(|&(slot, _), _| slot != slot_id);
            }
            TrbType::AddressDevice | TrbType::ConfigureEndpoint | TrbType::EvaluateContext => {
                self.apply_input_context(slot_id, trb.parameter(), ty);
            }
            _ => {}
        }
        (CompletionCode::SUCCESS, slot_id)
    }

    /// Copy added contexts to the output device context and pick up new
    /// transfer rings
    fn apply_input_context(&mut self, slot_id: u8, input: u64, ty: TrbType) {
        let add_flags = read_u32(input + 4);
        let output = read_u64(self.dcbaa + slot_id as u64 * 8);

        for index in 0..32u64 {
            if add_flags & 1 << index == 0 {
                continue;
            }
            let source = input + CONTEXT_SIZE * (index + 1);
            if output != 0 {
                copy_bytes(source, output + CONTEXT_SIZE * index, CONTEXT_SIZE as usize);
            }
            if index >= 1 && ty != TrbType::EvaluateContext {
                let dequeue = read_u64(source + 8);
                self.transfer
                    .insert((slot_id, index as u8), Cursor::new(dequeue));
            }
        }
    }

    fn process_transfers(&mut self, slot_id: u8, endpoint_id: u8) {
        let key = (slot_id, endpoint_id);
        let mut failures = self.transfer_failures.remove(&key).unwrap_or_default();
        let in_data = self.in_data.get(&key).cloned().unwrap_or_default();
        let mut out_data = Vec::new();
        let mut events = Vec::new();

        if let Some(cursor) = self.transfer.get_mut(&key) {
            loop {
                let address = cursor.dequeue;
                let trb = read_trb(address);
                if trb.cycle() != cursor.cycle {
                    break;
                }
                let ty = trb.trb_type();
                if ty == Some(TrbType::Link) {
                    assert!(
                        !cursor.chained || trb.flags().contains(TrbControl::CHAIN),
                        "Link TRB inside a chained TD lacks CHAIN"
                    );
                    cursor.dequeue = trb.parameter();
                    if trb.flags().contains(TrbControl::TOGGLE_CYCLE) {
                        cursor.cycle = !cursor.cycle;
                    }
                    continue;
                }
                cursor.dequeue += TRB_SIZE as u64;
                cursor.chained = trb.flags().contains(TrbControl::CHAIN);

                let ends_td = match ty {
                    Some(TrbType::SetupStage | TrbType::DataStage) => false,
                    Some(TrbType::StatusStage) => true,
                    _ => !trb.flags().contains(TrbControl::CHAIN),
                };
                let starts_td = !cursor.in_td;
                cursor.in_td = !ends_td;

                if cursor.skipping {
                    cursor.skipping = !ends_td;
                    continue;
                }
                if starts_td {
                    cursor.td_offset = 0;
                    if let Some(code) = failures.pop_front() {
                        events.push((address, code, trb.status & TRANSFER_LENGTH_MASK));
                        cursor.skipping = !ends_td;
                        continue;
                    }
                }

                let length = (trb.status & TRANSFER_LENGTH_MASK) as usize;
                let direction_in = match ty {
                    Some(TrbType::DataStage) => trb.flags().contains(TrbControl::DIR_IN),
                    // Odd endpoint IDs above EP0 are IN endpoints
                    Some(TrbType::Normal | TrbType::Isoch) => endpoint_id % 2 == 1,
                    _ => false,
                };
                let moves_data = matches!(
                    ty,
                    Some(TrbType::DataStage | TrbType::Normal | TrbType::Isoch)
                );

                let mut residual = 0;
                if moves_data && direction_in {
                    let available = in_data.len().saturating_sub(cursor.td_offset);
                    let count = available.min(length);
                    write_bytes(
                        trb.parameter(),
                        &in_data[cursor.td_offset..cursor.td_offset + count],
                    );
                    cursor.td_offset += count;
                    residual = length - count;
                } else if moves_data {
                    out_data.extend_from_slice(&read_bytes(trb.parameter(), length));
                }

                let short = residual > 0;
                let code = if short {
                    CompletionCode::SHORT_PACKET
                } else {
                    CompletionCode::SUCCESS
                };
                let flags = trb.flags();
                if flags.contains(TrbControl::IOC) || (short && flags.contains(TrbControl::ISP)) {
                    events.push((address, code, residual as u32));
                }
                if short && !ends_td && ty != Some(TrbType::DataStage) {
                    cursor.skipping = true;
                }
            }
        }

        if !failures.is_empty() {
            self.transfer_failures.insert(key, failures);
        }
        if !out_data.is_empty() {
            self.out_data.entry(key).or_default().extend(out_data);
        }
        for (address, code, residual) in events {
            self.post_event(Trb::new(
                address,
                (code.0 as u32) << TRB_COMPLETION_CODE_SHIFT | residual,
                TrbType::TransferEvent.control_bits()
                    | (slot_id as u32) << TRB_SLOT_ID_SHIFT
                    | (endpoint_id as u32) << TRB_ENDPOINT_ID_SHIFT,
            ));
        }
    }
}

// The driver hands out CPU addresses of its DMA memory unchanged (the default
// `HostPlatform::dma_address`), so the simulation can dereference them.

fn read_trb(address: u64) -> Trb {
    // SAFETY: address points into a live ring allocated by the driver
    unsafe { ptr::read_volatile(address as *const Trb) }
}

fn write_trb(address: u64, trb: Trb) {
    // SAFETY: address points into the event ring allocated by the driver
    unsafe { ptr::write_volatile(address as *mut Trb, trb) }
}

fn read_u32(address: u64) -> u32 {
    // SAFETY: address points into driver DMA memory
    unsafe { ptr::read_volatile(address as *const u32) }
}

fn write_u32(address: u64, value: u32) {
    // SAFETY: address points into driver DMA memory
    unsafe { ptr::write_volatile(address as *mut u32, value) }
}

fn read_u64(address: u64) -> u64 {
    // SAFETY: address points into driver DMA memory, 8-byte aligned
    unsafe { ptr::read_volatile(address as *const u64) }
}

fn copy_bytes(source: u64, destination: u64, count: usize) {
    // SAFETY: both ranges are driver context buffers of at least `count` bytes
    unsafe { ptr::copy_nonoverlapping(source as *const u8, destination as *mut u8, count) }
}

fn write_bytes(address: u64, data: &[u8]) {
    // SAFETY: address is a data buffer at least as long as the TRB length
    unsafe { ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) }
}

fn read_bytes(address: u64, count: usize) -> Vec<u8> {
    let mut data = vec![0; count];
    // SAFETY: address is a data buffer of `count` bytes
    unsafe { ptr::copy_nonoverlapping(address as *const u8, data.as_mut_ptr(), count) }
    data
}
