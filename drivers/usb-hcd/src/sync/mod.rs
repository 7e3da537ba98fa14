//! Synchronization primitives shared between task and interrupt context
//!
//! - [`IrqSpinLock`]: spinlock that raises the execution level while held
//! - [`CompletionEvent`]: one-shot signal set from interrupt context
//! - [`TaskMutex`]: task-level mutual exclusion that yields while contended

mod event;
mod mutex;
mod spinlock;

pub use event::CompletionEvent;
pub use mutex::{TaskMutex, TaskMutexGuard};
pub use spinlock::{IrqSpinLock, IrqSpinLockGuard};
