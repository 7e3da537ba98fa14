//! Start-of-frame dispatch of DWHCI transaction stages
//!
//! A DWHCI host channel must not be started before the frame its scheduler
//! has chosen. Stages waiting for their frame are parked in a
//! [`TransactionQueue`] and handed back to the channel code from the
//! start-of-frame interrupt once they are due.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{trace, warn};

use crate::{
    arch::ExecutionLevel,
    device::DeviceId,
    error::{HcdError, HcdResult},
    frame::{
        frame_add, FrameCounter, FrameScheduler, SplitScheduler, TransferKind, MAX_FRAME_NUMBER,
        MICROFRAMES_PER_FRAME,
    },
    queue::TransactionQueue,
};

/// One transaction stage waiting for a host channel
#[derive(Debug)]
pub struct StageData<T> {
    pub request: T,
    pub owner: DeviceId,
    pub scheduler: Option<FrameScheduler>,
    /// Endpoint polling interval in frames, for periodic stages
    pub interval: u16,
}

impl<T> StageData<T> {
    pub fn new(request: T, owner: DeviceId, kind: TransferKind, interval: u16) -> Self {
        Self {
            request,
            owner,
            scheduler: FrameScheduler::select(kind),
            interval,
        }
    }

    /// Whether the stage runs as split transactions through a hub
    pub fn is_split(&self) -> bool {
        !matches!(self.scheduler, None | Some(FrameScheduler::NoSplit(_)))
    }
}

/// Parks stages until their frame and releases them at start of frame
pub struct FrameDispatcher<T> {
    frames: Arc<dyn FrameCounter>,
    queue: TransactionQueue<StageData<T>>,
    shutdown: AtomicBool,
}

impl<T> FrameDispatcher<T> {
    /// `capacity` is normally the number of host channels
    pub fn new(frames: Arc<dyn FrameCounter>, capacity: usize) -> HcdResult<Self> {
        Ok(Self {
            frames,
            // Channel interrupts may run as FIQ
            queue: TransactionQueue::new(capacity, ExecutionLevel::Fiq)?,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Frame the earliest parked stage is due in
    pub fn next_frame(&self) -> Option<u16> {
        self.queue.next_frame()
    }

    /// Park `stage` until the frame its scheduler asks for, or the next
    /// frame if it has no scheduler
    ///
    /// Returns the frame the stage was queued for.
    pub fn queue_transaction(&self, mut stage: StageData<T>) -> Result<u16, StageData<T>> {
        let current = self.frames.frame_number();
        let frame = match stage.scheduler.as_mut() {
            Some(scheduler) => scheduler.frame_number(current),
            None => frame_add(current, 1),
        };
        self.enqueue(stage, frame)
    }

    /// Park a periodic stage that was NAKed until its next polling interval
    ///
    /// A split stage restarts with a new start split.
    pub fn queue_delayed_transaction(
        &self,
        mut stage: StageData<T>,
        high_speed: bool,
    ) -> Result<u16, StageData<T>> {
        let offset = match delay_frames(stage.interval, high_speed) {
            Ok(offset) => offset,
            Err(error) => {
                warn!("Cannot delay transaction of {}: {}", stage.owner, error);
                return Err(stage);
            }
        };

        let current = self.frames.frame_number();
        let split = stage.is_split();
        let frame = match stage.scheduler.as_mut() {
            Some(scheduler) if split => {
                scheduler.periodic_delay(offset);
                let frame = scheduler.frame_number(current);
                scheduler.start_split();
                frame
            }
            _ => frame_add(current, offset),
        };
        self.enqueue(stage, frame)
    }

    fn enqueue(&self, stage: StageData<T>, frame: u16) -> Result<u16, StageData<T>> {
        let owner = stage.owner;
        self.queue.enqueue(stage, owner, frame).map_err(|stage| {
            warn!("Transaction queue full, {} stage not scheduled", owner);
            stage
        })?;
        trace!("{}: stage queued for frame {}", owner, frame);
        Ok(frame)
    }

    /// Start-of-frame interrupt: hand every due stage to `start`
    ///
    /// `start` gives the stage back when no host channel is free; it is then
    /// requeued for the next frame and dispatching stops. Returns the number
    /// of stages started.
    pub fn start_of_frame(
        &self,
        mut start: impl FnMut(StageData<T>) -> Result<(), StageData<T>>,
    ) -> usize {
        if self.shutdown.load(Ordering::Acquire) {
            return 0;
        }

        let current = self.frames.frame_number();
        let mut started = 0;
        while let Some(stage) = self.queue.dequeue(current) {
            match start(stage) {
                Ok(()) => started += 1,
                Err(stage) => {
                    let owner = stage.owner;
                    if self.enqueue(stage, frame_add(current, 1)).is_err() {
                        warn!("{}: stage dropped, no channel available", owner);
                    }
                    break;
                }
            }
        }
        started
    }

    /// Drop the parked stages of a detaching device
    pub fn flush_device(&self, owner: DeviceId) -> usize {
        self.queue.flush_owner(owner)
    }

    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    /// Stop dispatching and drop everything parked
    pub fn shutdown(&self) -> usize {
        self.shutdown.store(true, Ordering::Release);
        self.queue.flush()
    }
}

/// Frame offset for an endpoint interval; high-speed intervals count
/// microframes
fn delay_frames(interval: u16, high_speed: bool) -> HcdResult<u16> {
    let offset = if high_speed {
        interval.checked_mul(MICROFRAMES_PER_FRAME)
    } else {
        Some(interval)
    };
    match offset {
        Some(offset) if offset < MAX_FRAME_NUMBER / 2 => Ok(offset),
        _ => Err(HcdError::InvalidArgument {
            name: "interval",
            value: "exceeds half the frame number range",
        }),
    }
}
