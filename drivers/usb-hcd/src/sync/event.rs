//! One-shot completion signal

use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform::HostPlatform;

/// Signal set by an interrupt handler and consumed by one waiting task
///
/// `signal` never blocks and may be called from any execution level. The
/// waiter yields to the scheduler between checks instead of spinning.
pub struct CompletionEvent {
    signaled: AtomicBool,
}

impl CompletionEvent {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Consume the signal if it is set
    pub fn try_take(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }

    /// Wait until signalled or until `timeout_ms` has elapsed
    ///
    /// Returns `true` if the signal was consumed, `false` on timeout.
    pub fn wait_timeout(&self, platform: &dyn HostPlatform, timeout_ms: u64) -> bool {
        let start = platform.now_ms();
        loop {
            if self.try_take() {
                return true;
            }
            if platform.now_ms().saturating_sub(start) >= timeout_ms {
                // A signal racing with the deadline still counts
                return self.try_take();
            }
            platform.yield_now();
        }
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;

    #[test]
    fn test_signal_before_wait() {
        let platform = TestPlatform::new();
        let event = CompletionEvent::new();
        event.signal();
        assert!(event.is_signaled());
        assert!(event.wait_timeout(&platform, 10));
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_wait_times_out() {
        let platform = TestPlatform::new();
        let event = CompletionEvent::new();
        assert!(!event.wait_timeout(&platform, 5));
        assert!(platform.now_ms() >= 5);
    }

    #[test]
    fn test_reset_discards_signal() {
        let event = CompletionEvent::new();
        event.signal();
        event.reset();
        assert!(!event.try_take());
    }
}
