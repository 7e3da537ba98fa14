//! Spinlock that masks interrupts up to a fixed execution level

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch::{ExecutionLevel, LevelGuard};

/// Spinlock created for the highest execution level it is taken from
///
/// Acquiring the lock first raises the local execution level, so an interrupt
/// handler that takes the same lock can never preempt the holder on this
/// core. A lock created for [`ExecutionLevel::Fiq`] may be used from task, IRQ
/// and FIQ context.
pub struct IrqSpinLock<T> {
    level: ExecutionLevel,
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(level: ExecutionLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn level(&self) -> ExecutionLevel {
        self.level
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let level = LevelGuard::raise(self.level);
        IrqSpinLockGuard {
            inner: self.inner.lock(),
            _level: level,
        }
    }

    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let level = LevelGuard::raise(self.level);
        self.inner.try_lock().map(|inner| IrqSpinLockGuard {
            inner,
            _level: level,
        })
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Guard for [`IrqSpinLock`]; unlocks before the execution level drops
pub struct IrqSpinLockGuard<'a, T> {
    // Field order matters: the mutex guard is dropped before the level guard.
    inner: MutexGuard<'a, T>,
    _level: LevelGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_mutate() {
        let lock = IrqSpinLock::new(ExecutionLevel::Fiq, 5u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 6);
        assert_eq!(lock.level(), ExecutionLevel::Fiq);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = IrqSpinLock::new(ExecutionLevel::Irq, ());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }
}
