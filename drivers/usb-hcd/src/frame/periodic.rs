//! Scheduler for interrupt split transactions
//!
//! Frame numbers here count microframes; the low three bits select the
//! microframe within a frame. The start split goes out in the next
//! microframe (never microframe 6, whose complete splits would spill into
//! the next frame), the first complete split two microframes later.

use super::{frame_add, ChannelStatus, SplitScheduler, SplitState};

const FRAME_UNSET: u16 = 8;

/// Microframes to wait after the hub NAKed the complete split
const NAK_DELAY: u16 = 5;

/// Microframes to wait after all complete splits came back NYET
const RETRY_DELAY: u16 = 8;

#[derive(Debug, Clone)]
pub struct PeriodicScheduler {
    state: SplitState,
    tries: u8,
    next_microframe: u16,
    delay: u16,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self {
            state: SplitState::Start,
            tries: 0,
            next_microframe: FRAME_UNSET,
            delay: 0,
        }
    }

    fn fail(&mut self, delay: u16) {
        self.state = SplitState::CompleteSplitFailed;
        self.delay = delay;
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitScheduler for PeriodicScheduler {
    fn start_split(&mut self) {
        match self.state {
            SplitState::Start
            | SplitState::CompleteSplitComplete
            | SplitState::CompleteSplitFailed => {
                self.state = SplitState::StartSplit;
                self.next_microframe = FRAME_UNSET;
            }
            state => panic!("periodic start split in state {:?}", state),
        }
    }

    fn complete_split(&mut self) -> bool {
        match self.state {
            SplitState::StartSplitComplete => {
                self.state = SplitState::CompleteSplit;
                self.tries = if self.next_microframe != 5 { 3 } else { 2 };
                self.next_microframe = (self.next_microframe + 2) & 7;
                true
            }
            SplitState::CompleteSplitRetry => {
                self.next_microframe = (self.next_microframe + 1) & 7;
                true
            }
            SplitState::CompleteSplitComplete | SplitState::CompleteSplitFailed => false,
            state => panic!("periodic complete split in state {:?}", state),
        }
    }

    fn transaction_complete(&mut self, status: ChannelStatus) {
        match self.state {
            SplitState::StartSplit => {
                if status.contains(ChannelStatus::ACK) {
                    self.state = SplitState::StartSplitComplete;
                } else {
                    self.fail(NAK_DELAY);
                }
            }
            SplitState::CompleteSplit | SplitState::CompleteSplitRetry => {
                if status.contains(ChannelStatus::XFER_COMPLETE) {
                    self.state = SplitState::CompleteSplitComplete;
                } else if status.intersects(ChannelStatus::NYET | ChannelStatus::ACK) {
                    if self.tries == 0 {
                        self.fail(RETRY_DELAY);
                    } else {
                        self.tries -= 1;
                        self.state = SplitState::CompleteSplitRetry;
                    }
                } else if status.contains(ChannelStatus::NAK) {
                    self.fail(NAK_DELAY);
                } else {
                    self.fail(0);
                }
            }
            state => panic!("periodic transaction complete in state {:?}", state),
        }
    }

    fn frame_number(&mut self, current: u16) -> u16 {
        if self.next_microframe == FRAME_UNSET {
            self.next_microframe = (current + 1) & 7;
            if self.next_microframe == 6 {
                self.next_microframe = 7;
            }
        }

        let base = frame_add(current, self.delay);
        self.delay = 0;
        let first = frame_add(base, 1);
        let wait = self.next_microframe.wrapping_sub(first) & 7;
        frame_add(first, wait)
    }

    fn periodic_delay(&mut self, frame_offset: u16) {
        self.delay = frame_offset;
    }

    fn is_odd_frame(&self, _current: u16) -> bool {
        self.next_microframe & 1 != 0
    }

    fn state(&self) -> SplitState {
        self.state
    }
}
