//! Task-level mutex that yields instead of spinning

use crate::platform::HostPlatform;

pub type TaskMutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Mutual exclusion between tasks that may hold the lock across a blocking
/// wait
///
/// Must not be taken from interrupt context.
pub struct TaskMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> TaskMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn try_lock(&self) -> Option<TaskMutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Acquire the lock, yielding to other tasks while it is held elsewhere
    pub fn lock(&self, platform: &dyn HostPlatform) -> TaskMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            platform.yield_now();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;

    #[test]
    fn test_exclusive() {
        let platform = TestPlatform::new();
        let mutex = TaskMutex::new(0u32);
        {
            let mut guard = mutex.lock(&platform);
            *guard = 7;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(&platform), 7);
    }

    #[test]
    fn test_contended_lock_yields() {
        use alloc::sync::Arc;

        let platform = Arc::new(TestPlatform::new());
        let mutex = Arc::new(TaskMutex::new(0u32));
        let workers: alloc::vec::Vec<_> = (0..4)
            .map(|_| {
                let platform = platform.clone();
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        *mutex.lock(&*platform) += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*mutex.lock(&*platform), 2000);
        assert!(!mutex.is_locked());
    }
}
