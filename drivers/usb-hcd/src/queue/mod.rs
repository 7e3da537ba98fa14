//! Queues shared between interrupt and task context
//!
//! Both queues keep their entries in a preallocated [`HandleList`], guarded
//! by an [`IrqSpinLock`](crate::sync::IrqSpinLock) created for the highest
//! execution level that touches the queue. Each entry is tagged with the
//! device that owns it so a detaching device can drop its entries before any
//! of them is dispatched.

pub mod arena;
mod completion;
mod transaction;

pub use arena::{Handle, HandleList, SlotArena};
pub use completion::CompletionQueue;
pub use transaction::TransactionQueue;
