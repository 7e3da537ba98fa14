//! Scheduler for control and bulk split transactions

use super::{frame_add, ChannelStatus, SplitScheduler, SplitState};

/// Complete splits allowed per start split
const COMPLETE_SPLIT_TRIES: u8 = 3;

/// Microframes to back off after the hub NAKed
const NAK_DELAY: u16 = 5;

/// Microframes to back off after the complete splits came back NYET
const RETRY_DELAY: u16 = 3;

/// Non-periodic splits are not bound to microframe positions; each phase
/// goes out as soon as possible, backing off after NAK and NYET.
#[derive(Debug, Clone)]
pub struct NonPeriodicScheduler {
    state: SplitState,
    tries: u8,
    delay: u16,
    next_frame: Option<u16>,
}

impl NonPeriodicScheduler {
    pub fn new() -> Self {
        Self {
            state: SplitState::Start,
            tries: 0,
            delay: 0,
            next_frame: None,
        }
    }

    fn fail(&mut self, delay: u16) {
        self.state = SplitState::CompleteSplitFailed;
        self.delay = delay;
    }
}

impl Default for NonPeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitScheduler for NonPeriodicScheduler {
    fn start_split(&mut self) {
        match self.state {
            SplitState::Start
            | SplitState::CompleteSplitComplete
            | SplitState::CompleteSplitFailed => self.state = SplitState::StartSplit,
            state => panic!("non-periodic start split in state {:?}", state),
        }
    }

    fn complete_split(&mut self) -> bool {
        match self.state {
            SplitState::StartSplitComplete => {
                self.state = SplitState::CompleteSplit;
                self.tries = COMPLETE_SPLIT_TRIES;
                true
            }
            SplitState::CompleteSplitRetry => true,
            SplitState::CompleteSplitComplete | SplitState::CompleteSplitFailed => false,
            state => panic!("non-periodic complete split in state {:?}", state),
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
                } else if status.contains(ChannelStatus::NYET) {
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
            state => panic!("non-periodic transaction complete in state {:?}", state),
        }
    }

    fn frame_number(&mut self, current: u16) -> u16 {
        let next = frame_add(current, 1 + self.delay);
        self.delay = 0;
        self.next_frame = Some(next);
        next
    }

    fn periodic_delay(&mut self, frame_offset: u16) {
        self.delay = frame_offset;
    }

    fn is_odd_frame(&self, current: u16) -> bool {
        self.next_frame.unwrap_or(frame_add(current, 1)) & 1 != 0
    }

    fn state(&self) -> SplitState {
        self.state
    }
}
