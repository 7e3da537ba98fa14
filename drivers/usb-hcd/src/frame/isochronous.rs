//! Scheduler for isochronous split transactions

use log::debug;

use super::{frame_add, ChannelStatus, SplitScheduler, SplitState, MAX_FRAME_NUMBER};

/// Isochronous splits start on an 8-microframe boundary; IN splits are
/// placed in the middle of the frame so the complete splits fit behind them.
#[derive(Debug, Clone)]
pub struct IsochronousScheduler {
    state: SplitState,
    direction_in: bool,
    frame_offset: u16,
    align: bool,
    next_frame: u16,
}

impl IsochronousScheduler {
    pub fn new(direction_in: bool) -> Self {
        Self {
            state: SplitState::Start,
            direction_in,
            frame_offset: 0,
            align: false,
            next_frame: 0,
        }
    }

    /// Frame returned by the last [`SplitScheduler::frame_number`] call
    pub fn next_frame(&self) -> u16 {
        self.next_frame
    }
}

impl SplitScheduler for IsochronousScheduler {
    fn start_split(&mut self) {
        match self.state {
            SplitState::Start | SplitState::CompleteSplitComplete => {
                self.state = SplitState::StartSplit;
                self.frame_offset = 8;
                self.align = true;
            }
            SplitState::StartSplitComplete => {
                self.state = SplitState::StartSplitContinued;
                self.frame_offset = 1;
                self.align = false;
            }
            // Offset and alignment were set by periodic_delay()
            SplitState::PeriodicDelay => self.state = SplitState::StartSplit,
            state => panic!("isochronous start split in state {:?}", state),
        }
    }

    fn complete_split(&mut self) -> bool {
        match self.state {
            SplitState::StartSplitComplete => {
                self.state = SplitState::CompleteSplit;
                self.frame_offset = 2;
                self.align = false;
                true
            }
            SplitState::CompleteSplitComplete | SplitState::PeriodicDelay => false,
            state => panic!("isochronous complete split in state {:?}", state),
        }
    }

    fn transaction_complete(&mut self, status: ChannelStatus) {
        match self.state {
            SplitState::StartSplit | SplitState::StartSplitContinued => {
                if status.contains(ChannelStatus::ACK) {
                    self.state = SplitState::StartSplitComplete;
                } else {
                    debug!("iso start split not acknowledged ({:?})", status);
                    self.state = SplitState::PeriodicDelay;
                }
            }
            SplitState::CompleteSplit => {
                if status.contains(ChannelStatus::XFER_COMPLETE) {
                    self.state = SplitState::CompleteSplitComplete;
                } else {
                    // A single complete split per start split; NYET waits
                    // for the next service interval
                    debug!("iso complete split not finished ({:?})", status);
                    self.state = SplitState::PeriodicDelay;
                }
            }
            state => panic!("isochronous transaction complete in state {:?}", state),
        }
    }

    fn frame_number(&mut self, current: u16) -> u16 {
        let mut next = frame_add(current, self.frame_offset);
        if self.align {
            next &= !7 & MAX_FRAME_NUMBER;
            if self.direction_in {
                next += 4;
            }
        }
        self.next_frame = next;
        next
    }

    fn periodic_delay(&mut self, frame_offset: u16) {
        assert_eq!(
            self.state,
            SplitState::PeriodicDelay,
            "periodic delay outside of delay state"
        );
        self.frame_offset = frame_offset;
        self.align = true;
    }

    fn is_odd_frame(&self, current: u16) -> bool {
        current & 1 != 0
    }

    fn state(&self) -> SplitState {
        self.state
    }
}
