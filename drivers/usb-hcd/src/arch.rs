//! Memory barriers and execution level control
//!
//! The rings are shared with a bus-mastering controller, so TRB stores must be
//! visible before the doorbell write and event TRB loads must not be hoisted
//! above the cycle bit check. On aarch64 the barriers map to `dsb`/`dmb`; on
//! other targets they fall back to atomic fences, which is enough for the
//! hosted simulation used by the tests.
//!
//! Raising the execution level masks the interrupt classes that could
//! re-enter code holding an [`IrqSpinLock`](crate::sync::IrqSpinLock).

use core::sync::atomic::{fence, Ordering};

/// Read barrier: loads after this see DMA writes observed before it
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier: stores before this are ordered before later stores
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Data Synchronisation Barrier, used before ringing a doorbell
#[inline]
pub fn dsb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB only orders memory accesses and has no other side effects
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}

/// Data Memory Barrier
#[inline]
pub fn dmb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DMB only orders memory accesses and has no other side effects
    unsafe {
        core::arch::asm!("dmb sy", options(nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}

/// Execution context a piece of code may run in, ordered by priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionLevel {
    /// Task level, interrupts enabled
    Task,
    /// IRQ handler, or task code with IRQs masked
    Irq,
    /// FIQ handler, or code with both IRQs and FIQs masked
    Fiq,
}

/// Restores the previous interrupt mask when dropped
pub struct LevelGuard {
    #[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
    saved: u64,
}

impl LevelGuard {
    /// Mask every interrupt class at or below `level`
    #[inline]
    pub fn raise(level: ExecutionLevel) -> Self {
        Self {
            saved: raise_level(level),
        }
    }
}

impl Drop for LevelGuard {
    #[inline]
    fn drop(&mut self) {
        restore_level(self.saved);
    }
}

#[cfg(target_arch = "aarch64")]
fn raise_level(level: ExecutionLevel) -> u64 {
    let daif: u64;
    // SAFETY: reading DAIF has no side effects
    unsafe {
        core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
    }
    match level {
        ExecutionLevel::Task => {}
        // SAFETY: DAIFSET only sets mask bits; the saved value restores them
        ExecutionLevel::Irq => unsafe {
            core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags));
        },
        // SAFETY: as above, masks IRQ and FIQ
        ExecutionLevel::Fiq => unsafe {
            core::arch::asm!("msr daifset, #3", options(nomem, nostack, preserves_flags));
        },
    }
    daif
}

#[cfg(target_arch = "aarch64")]
fn restore_level(saved: u64) {
    // SAFETY: writes back a DAIF value previously read on this core
    unsafe {
        core::arch::asm!("msr daif, {}", in(reg) saved, options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn raise_level(_level: ExecutionLevel) -> u64 {
    0
}

#[cfg(not(target_arch = "aarch64"))]
fn restore_level(_saved: u64) {}
