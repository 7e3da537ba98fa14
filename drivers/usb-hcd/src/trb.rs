//! Transfer Request Blocks
//!
//! A TRB is the 16-byte descriptor shared by all xHCI rings: two parameter
//! words, a status word and a control word whose bit 0 is the cycle bit.

use core::fmt;

use bitflags::bitflags;

use crate::{error::UsbError, urb::SetupPacket};

/// Size of one TRB in bytes
pub const TRB_SIZE: usize = 16;

/// Largest data length one Normal/Data/Isoch TRB carries here
pub const MAX_TRB_TRANSFER: usize = 0x10000;

pub const TRB_TYPE_SHIFT: u32 = 10;
pub const TRB_TYPE_MASK: u32 = 0x3F << TRB_TYPE_SHIFT;
pub const TRB_SLOT_ID_SHIFT: u32 = 24;
pub const TRB_ENDPOINT_ID_SHIFT: u32 = 16;
pub const TRB_TRANSFER_TYPE_SHIFT: u32 = 16;
pub const TRB_TD_SIZE_SHIFT: u32 = 17;
pub const TRB_TD_SIZE_MAX: u32 = 31;
pub const TRB_COMPLETION_CODE_SHIFT: u32 = 24;
pub const TRB_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;
pub const TRB_PORT_ID_SHIFT: u32 = 24;

/// Setup stage transfer types
pub const TRT_NO_DATA: u32 = 0;
pub const TRT_OUT_DATA: u32 = 2;
pub const TRT_IN_DATA: u32 = 3;

bitflags! {
    /// Control word flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrbControl: u32 {
        const CYCLE = 1 << 0;
        /// Link TRB: toggle cycle on wrap
        const TOGGLE_CYCLE = 1 << 1;
        /// Evaluate next TRB
        const ENT = 1 << 1;
        /// Interrupt on short packet
        const ISP = 1 << 2;
        const NO_SNOOP = 1 << 3;
        const CHAIN = 1 << 4;
        /// Interrupt on completion
        const IOC = 1 << 5;
        /// Immediate data (setup stage)
        const IDT = 1 << 6;
        /// Address Device: block set address request
        const BSR = 1 << 9;
        /// Configure Endpoint: deconfigure
        const DECONFIGURE = 1 << 9;
        const DIR_IN = 1 << 16;
        /// Isoch: start isoch ASAP
        const SIA = 1 << 31;
    }
}

/// TRB type field values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeue = 16,
    ResetDevice = 17,
    NoOpCommand = 23,
    TransferEvent = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    BandwidthRequest = 35,
    Doorbell = 36,
    HostController = 37,
    DeviceNotification = 38,
    MfindexWrap = 39,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use TrbType::*;
        let ty = match raw {
            1 => Normal,
            2 => SetupStage,
            3 => DataStage,
            4 => StatusStage,
            5 => Isoch,
            6 => Link,
            7 => EventData,
            8 => NoOp,
            9 => EnableSlot,
            10 => DisableSlot,
            11 => AddressDevice,
            12 => ConfigureEndpoint,
            13 => EvaluateContext,
            14 => ResetEndpoint,
            15 => StopEndpoint,
            16 => SetTrDequeue,
            17 => ResetDevice,
            23 => NoOpCommand,
            32 => TransferEvent,
            33 => CommandCompletion,
            34 => PortStatusChange,
            35 => BandwidthRequest,
            36 => Doorbell,
            37 => HostController,
            38 => DeviceNotification,
            39 => MfindexWrap,
            _ => return None,
        };
        Some(ty)
    }

    /// Type bits positioned for the control word
    pub const fn control_bits(self) -> u32 {
        (self as u32) << TRB_TYPE_SHIFT
    }
}

/// Completion code reported in event TRBs
///
/// Kept as a raw code so that reserved and vendor values survive decoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const INVALID: Self = Self(0);
    pub const SUCCESS: Self = Self(1);
    pub const DATA_BUFFER_ERROR: Self = Self(2);
    pub const BABBLE_DETECTED: Self = Self(3);
    pub const USB_TRANSACTION_ERROR: Self = Self(4);
    pub const TRB_ERROR: Self = Self(5);
    pub const STALL_ERROR: Self = Self(6);
    pub const RESOURCE_ERROR: Self = Self(7);
    pub const BANDWIDTH_ERROR: Self = Self(8);
    pub const NO_SLOTS_AVAILABLE: Self = Self(9);
    pub const INVALID_STREAM_TYPE: Self = Self(10);
    pub const SLOT_NOT_ENABLED: Self = Self(11);
    pub const ENDPOINT_NOT_ENABLED: Self = Self(12);
    pub const SHORT_PACKET: Self = Self(13);
    pub const RING_UNDERRUN: Self = Self(14);
    pub const RING_OVERRUN: Self = Self(15);
    pub const VF_EVENT_RING_FULL: Self = Self(16);
    pub const PARAMETER_ERROR: Self = Self(17);
    pub const BANDWIDTH_OVERRUN: Self = Self(18);
    pub const CONTEXT_STATE_ERROR: Self = Self(19);
    pub const NO_PING_RESPONSE: Self = Self(20);
    pub const EVENT_RING_FULL: Self = Self(21);
    pub const INCOMPATIBLE_DEVICE: Self = Self(22);
    pub const MISSED_SERVICE: Self = Self(23);
    pub const COMMAND_RING_STOPPED: Self = Self(24);
    pub const COMMAND_ABORTED: Self = Self(25);
    pub const STOPPED: Self = Self(26);
    pub const STOPPED_LENGTH_INVALID: Self = Self(27);
    pub const MAX_EXIT_LATENCY_TOO_LARGE: Self = Self(29);
    pub const ISOCH_BUFFER_OVERRUN: Self = Self(31);
    pub const EVENT_LOST: Self = Self(32);
    pub const UNDEFINED_ERROR: Self = Self(33);
    pub const INVALID_STREAM_ID: Self = Self(34);
    pub const SECONDARY_BANDWIDTH_ERROR: Self = Self(35);
    pub const SPLIT_TRANSACTION_ERROR: Self = Self(36);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Success or a short packet: the transfer finished and data is valid
    pub fn is_transfer_ok(self) -> bool {
        self == Self::SUCCESS || self == Self::SHORT_PACKET
    }

    /// Classify a failed transfer for the URB
    pub fn usb_error(self) -> UsbError {
        match self {
            Self::STALL_ERROR => UsbError::Stall,
            Self::USB_TRANSACTION_ERROR | Self::NO_PING_RESPONSE => UsbError::Transaction,
            Self::BABBLE_DETECTED => UsbError::Babble,
            Self::MISSED_SERVICE | Self::ISOCH_BUFFER_OVERRUN | Self::BANDWIDTH_OVERRUN => {
                UsbError::FrameOverrun
            }
            Self::DATA_BUFFER_ERROR => UsbError::HostBus,
            Self::SPLIT_TRANSACTION_ERROR => UsbError::Split,
            Self::STOPPED | Self::STOPPED_LENGTH_INVALID | Self::COMMAND_ABORTED => {
                UsbError::Aborted
            }
            _ => UsbError::Unknown,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::INVALID => "invalid",
            Self::SUCCESS => "success",
            Self::DATA_BUFFER_ERROR => "data buffer error",
            Self::BABBLE_DETECTED => "babble detected",
            Self::USB_TRANSACTION_ERROR => "USB transaction error",
            Self::TRB_ERROR => "TRB error",
            Self::STALL_ERROR => "stall",
            Self::RESOURCE_ERROR => "resource error",
            Self::BANDWIDTH_ERROR => "bandwidth error",
            Self::NO_SLOTS_AVAILABLE => "no slots available",
            Self::SLOT_NOT_ENABLED => "slot not enabled",
            Self::ENDPOINT_NOT_ENABLED => "endpoint not enabled",
            Self::SHORT_PACKET => "short packet",
            Self::RING_UNDERRUN => "ring underrun",
            Self::RING_OVERRUN => "ring overrun",
            Self::PARAMETER_ERROR => "parameter error",
            Self::CONTEXT_STATE_ERROR => "context state error",
            Self::EVENT_RING_FULL => "event ring full",
            Self::MISSED_SERVICE => "missed service",
            Self::STOPPED => "stopped",
            Self::SPLIT_TRANSACTION_ERROR => "split transaction error",
            _ => "completion code",
        }
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl fmt::Debug for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompletionCode({}: {})", self.0, self.name())
    }
}

/// Transfer Request Block
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter1: u32,
    pub parameter2: u32,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter1: parameter as u32,
            parameter2: (parameter >> 32) as u32,
            status,
            control,
        }
    }

    /// 64-bit parameter (data pointer, context pointer, TRB pointer)
    pub fn parameter(&self) -> u64 {
        self.parameter1 as u64 | (self.parameter2 as u64) << 32
    }

    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_raw(((self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT) as u8)
    }

    pub fn raw_type(&self) -> u8 {
        ((self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT) as u8
    }

    pub fn cycle(&self) -> bool {
        self.control & TrbControl::CYCLE.bits() != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= TrbControl::CYCLE.bits();
        } else {
            self.control &= !TrbControl::CYCLE.bits();
        }
    }

    pub fn set_chain(&mut self, chain: bool) {
        if chain {
            self.control |= TrbControl::CHAIN.bits();
        } else {
            self.control &= !TrbControl::CHAIN.bits();
        }
    }

    pub fn flags(&self) -> TrbControl {
        TrbControl::from_bits_truncate(self.control)
    }

    // -----------------------------------------------------------------------
    // Event fields
    // -----------------------------------------------------------------------

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode((self.status >> TRB_COMPLETION_CODE_SHIFT) as u8)
    }

    /// Residual length for transfer events
    pub fn transfer_length(&self) -> u32 {
        self.status & TRB_TRANSFER_LENGTH_MASK
    }

    pub fn slot_id(&self) -> u8 {
        (self.control >> TRB_SLOT_ID_SHIFT) as u8
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> TRB_ENDPOINT_ID_SHIFT) & 0x1F) as u8
    }

    /// Port number of a port status change event
    pub fn port_id(&self) -> u8 {
        (self.parameter1 >> TRB_PORT_ID_SHIFT) as u8
    }

    // -----------------------------------------------------------------------
    // Transfer TRB builders (cycle bit is applied by the ring)
    // -----------------------------------------------------------------------

    /// Normal TRB for bulk and interrupt data
    pub fn normal(buffer: u64, length: u32, td_size: u32, flags: TrbControl) -> Self {
        Self::new(
            buffer,
            length | td_size.min(TRB_TD_SIZE_MAX) << TRB_TD_SIZE_SHIFT,
            TrbType::Normal.control_bits() | flags.bits(),
        )
    }

    /// Setup stage carrying the 8-byte request as immediate data
    pub fn setup_stage(setup: &SetupPacket, transfer_type: u32, flags: TrbControl) -> Self {
        Self::new(
            setup.to_u64(),
            SetupPacket::SIZE as u32,
            TrbType::SetupStage.control_bits()
                | (TrbControl::IDT | flags).bits()
                | transfer_type << TRB_TRANSFER_TYPE_SHIFT,
        )
    }

    pub fn data_stage(buffer: u64, length: u32, dir_in: bool, flags: TrbControl) -> Self {
        let mut flags = flags;
        flags.set(TrbControl::DIR_IN, dir_in);
        Self::new(buffer, length, TrbType::DataStage.control_bits() | flags.bits())
    }

    pub fn status_stage(dir_in: bool, flags: TrbControl) -> Self {
        let mut flags = flags;
        flags.set(TrbControl::DIR_IN, dir_in);
        Self::new(0, 0, TrbType::StatusStage.control_bits() | flags.bits())
    }

    pub fn isoch(buffer: u64, length: u32, td_size: u32, flags: TrbControl) -> Self {
        Self::new(
            buffer,
            length | td_size.min(TRB_TD_SIZE_MAX) << TRB_TD_SIZE_SHIFT,
            TrbType::Isoch.control_bits() | flags.bits(),
        )
    }

    /// Link TRB back to the ring base with toggle cycle set
    pub fn link(target: u64) -> Self {
        Self::new(
            target,
            0,
            TrbType::Link.control_bits() | TrbControl::TOGGLE_CYCLE.bits(),
        )
    }

    /// Command TRB of `ty` for `slot_id`
    pub fn command(ty: TrbType, parameter: u64, slot_id: u8, flags: TrbControl) -> Self {
        Self::new(
            parameter,
            0,
            ty.control_bits() | flags.bits() | (slot_id as u32) << TRB_SLOT_ID_SHIFT,
        )
    }
}
