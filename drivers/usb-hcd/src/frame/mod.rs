//! Split transaction frame scheduling for the DWHCI host channel backend
//!
//! Low- and full-speed traffic behind a high-speed hub is split into a
//! start-split and one or more complete-split transactions that the hub's
//! transaction translator expects in specific microframes. One scheduler
//! instance follows one transaction stage through these phases.
//!
//! Schedulers are driven from the start-of-frame interrupt: instead of
//! waiting for a frame they compute the frame number at which the next
//! transaction may be issued, and the [`TransactionQueue`] holds the stage
//! until that frame arrives.
//!
//! [`TransactionQueue`]: crate::queue::TransactionQueue

mod isochronous;
mod no_split;
mod non_periodic;
mod periodic;

use bitflags::bitflags;

pub use isochronous::IsochronousScheduler;
pub use no_split::NoSplitScheduler;
pub use non_periodic::NonPeriodicScheduler;
pub use periodic::PeriodicScheduler;

/// Highest value of the host frame number register; frame numbers wrap to 0
pub const MAX_FRAME_NUMBER: u16 = 0x3FFF;

/// Microframes per frame
pub const MICROFRAMES_PER_FRAME: u16 = 8;

/// Source of the current host frame number
pub trait FrameCounter: Send + Sync {
    fn frame_number(&self) -> u16;
}

/// `a` is later than `b`, taking wraparound into account
pub fn frame_number_greater(a: u16, b: u16) -> bool {
    if a == b {
        return false;
    }
    a.wrapping_sub(b) & MAX_FRAME_NUMBER < (MAX_FRAME_NUMBER >> 1)
}

/// `frame + offset` modulo the frame number range
pub fn frame_add(frame: u16, offset: u16) -> u16 {
    frame.wrapping_add(offset) & MAX_FRAME_NUMBER
}

bitflags! {
    /// Host channel interrupt status reported for a finished transaction
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        const XFER_COMPLETE = 1 << 0;
        const HALTED = 1 << 1;
        const AHB_ERROR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const NYET = 1 << 6;
        const XACT_ERROR = 1 << 7;
        const BABBLE_ERROR = 1 << 8;
        const FRAME_OVERRUN = 1 << 9;
        const DATA_TOGGLE_ERROR = 1 << 10;
    }
}

/// Phase of a scheduled transaction
///
/// Each scheduler uses the subset of states that applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    /// No split issued yet
    Start,
    StartSplit,
    /// Start split acknowledged by the hub
    StartSplitComplete,
    /// Further start split of a multi-packet isochronous OUT
    StartSplitContinued,
    CompleteSplit,
    CompleteSplitRetry,
    CompleteSplitComplete,
    CompleteSplitFailed,
    /// Waiting for the next periodic interval
    PeriodicDelay,
}

/// Operations shared by all frame scheduler variants
pub trait SplitScheduler {
    /// Begin a split transaction
    ///
    /// # Panics
    ///
    /// If a split is already in progress.
    fn start_split(&mut self);

    /// Advance to the next complete split
    ///
    /// Returns `false` once the split is finished (successfully or not).
    ///
    /// # Panics
    ///
    /// If no start split has been acknowledged.
    fn complete_split(&mut self) -> bool;

    /// Feed the channel status of the transaction just finished
    fn transaction_complete(&mut self, status: ChannelStatus);

    /// Frame number at which the next transaction may be issued, given the
    /// current host frame number
    fn frame_number(&mut self, current: u16) -> u16;

    /// Defer the next transaction by `frame_offset` frames
    fn periodic_delay(&mut self, frame_offset: u16);

    /// Whether the next transaction goes out in an odd (micro)frame
    fn is_odd_frame(&self, current: u16) -> bool;

    fn state(&self) -> SplitState;

    /// Retries were exhausted and the split must be reported as failed
    fn split_failed(&self) -> bool {
        self.state() == SplitState::CompleteSplitFailed
    }
}

/// Shape of a transaction stage, used to pick a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferKind {
    /// Low/full-speed device behind a high-speed hub
    pub split: bool,
    /// Interrupt or isochronous endpoint
    pub periodic: bool,
    pub isochronous: bool,
    pub direction_in: bool,
    /// Low/full-speed device attached directly to the root port
    pub full_speed_root: bool,
}

/// Scheduler for one transaction stage
#[derive(Debug, Clone)]
pub enum FrameScheduler {
    Isochronous(IsochronousScheduler),
    Periodic(PeriodicScheduler),
    NonPeriodic(NonPeriodicScheduler),
    NoSplit(NoSplitScheduler),
}

impl FrameScheduler {
    /// Pick the scheduler for a stage, or `None` when the stage needs no
    /// frame scheduling (high-speed traffic without split)
    pub fn select(kind: TransferKind) -> Option<Self> {
        if kind.split {
            let scheduler = if kind.isochronous {
                Self::Isochronous(IsochronousScheduler::new(kind.direction_in))
            } else if kind.periodic {
                Self::Periodic(PeriodicScheduler::new())
            } else {
                Self::NonPeriodic(NonPeriodicScheduler::new())
            };
            Some(scheduler)
        } else if kind.full_speed_root {
            Some(Self::NoSplit(NoSplitScheduler::new(kind.periodic)))
        } else {
            None
        }
    }

    fn inner(&self) -> &dyn SplitScheduler {
        match self {
            Self::Isochronous(s) => s,
            Self::Periodic(s) => s,
            Self::NonPeriodic(s) => s,
            Self::NoSplit(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SplitScheduler {
        match self {
            Self::Isochronous(s) => s,
            Self::Periodic(s) => s,
            Self::NonPeriodic(s) => s,
            Self::NoSplit(s) => s,
        }
    }
}

impl SplitScheduler for FrameScheduler {
    fn start_split(&mut self) {
        self.inner_mut().start_split()
    }

    fn complete_split(&mut self) -> bool {
        self.inner_mut().complete_split()
    }

    fn transaction_complete(&mut self, status: ChannelStatus) {
        self.inner_mut().transaction_complete(status)
    }

    fn frame_number(&mut self, current: u16) -> u16 {
        self.inner_mut().frame_number(current)
    }

    fn periodic_delay(&mut self, frame_offset: u16) {
        self.inner_mut().periodic_delay(frame_offset)
    }

    fn is_odd_frame(&self, current: u16) -> bool {
        self.inner().is_odd_frame(current)
    }

    fn state(&self) -> SplitState {
        self.inner().state()
    }

    fn split_failed(&self) -> bool {
        self.inner().split_failed()
    }
}
