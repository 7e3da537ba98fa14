//! Scheduler for low/full-speed devices on a root port
//!
//! There is no transaction translator involved, so only frame timing is
//! scheduled. The split operations must never be called.

use super::{frame_add, ChannelStatus, SplitScheduler, SplitState};

#[derive(Debug, Clone)]
pub struct NoSplitScheduler {
    periodic: bool,
    delay: u16,
    next_frame: Option<u16>,
}

impl NoSplitScheduler {
    pub fn new(periodic: bool) -> Self {
        Self {
            periodic,
            delay: 0,
            next_frame: None,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }
}

impl SplitScheduler for NoSplitScheduler {
    fn start_split(&mut self) {
        panic!("start split on a transfer without split");
    }

    fn complete_split(&mut self) -> bool {
        panic!("complete split on a transfer without split");
    }

    fn transaction_complete(&mut self, status: ChannelStatus) {
        panic!("split transaction complete ({:?}) on a transfer without split", status);
    }

    fn frame_number(&mut self, current: u16) -> u16 {
        let next = frame_add(current, 1 + self.delay);
        self.delay = 0;
        self.next_frame = Some(next);
        next
    }

    fn periodic_delay(&mut self, frame_offset: u16) {
        assert!(self.periodic, "periodic delay on a non-periodic transfer");
        // frame_number() adds the first frame itself
        self.delay = frame_offset.saturating_sub(1);
    }

    fn is_odd_frame(&self, current: u16) -> bool {
        self.next_frame.unwrap_or(frame_add(current, 1)) & 1 != 0
    }

    fn state(&self) -> SplitState {
        SplitState::Start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_FRAME_NUMBER;

    #[test]
    fn test_next_frame() {
        let mut scheduler = NoSplitScheduler::new(false);
        assert_eq!(scheduler.frame_number(MAX_FRAME_NUMBER), 0);
        assert!(!scheduler.is_odd_frame(MAX_FRAME_NUMBER));
        assert!(!scheduler.split_failed());
    }

    #[test]
    fn test_periodic_interval() {
        let mut scheduler = NoSplitScheduler::new(true);
        scheduler.periodic_delay(8);
        assert_eq!(scheduler.frame_number(100), 108);
        assert_eq!(scheduler.frame_number(108), 109);
    }

    #[test]
    #[should_panic(expected = "without split")]
    fn test_split_calls_are_rejected() {
        NoSplitScheduler::new(true).start_split();
    }

    #[test]
    #[should_panic(expected = "without split")]
    fn test_complete_split_is_rejected() {
        NoSplitScheduler::new(false).complete_split();
    }
}
