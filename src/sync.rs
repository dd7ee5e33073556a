//! Synchronization for the central lists and the page heap.
//!
//! `std::sync::Mutex` may allocate and is unavailable without `std`, so every
//! lock in the allocator is a [`SpinMutex`]. Critical sections are kept to
//! list surgery; sweeping and OS calls happen with locks released.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A value behind a test-and-test-and-set spinlock.
///
/// Usable in a `static` and never allocates.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        if !self.acquire(true) {
            self.lock_contended();
        }
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.acquire(false).then(|| SpinMutexGuard { mutex: self })
    }

    /// Whether some thread holds the lock. Racy; for assertions only.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    fn acquire(&self, weak: bool) -> bool {
        let res = if weak {
            self.locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        } else {
            self.locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        };
        res.is_ok()
    }

    #[cold]
    fn lock_contended(&self) {
        loop {
            // Spin on a plain load so waiters share the cache line.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self.acquire(true) {
                return;
            }
        }
    }
}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}
