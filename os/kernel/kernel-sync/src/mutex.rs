use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// Data guarded by a raw lock `R`; the guard releases it on drop, including
/// during unwinding.
pub struct Mutex<T, R> {
    raw: R,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a guard, which holds `raw`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Guard `value` with an explicitly configured raw lock.
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(value),
        }
    }
}

impl<T, R: Default> Mutex<T, R> {
    pub fn new(value: T) -> Self {
        Self::from_raw(R::default(), value)
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquire, with whatever waiting (or panicking) `R` implements.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw
            .raw_try_lock()
            .then(|| MutexGuard { mutex: self })
    }
}

pub struct MutexGuard<'a, T, R: RawUnlock> {
    mutex: &'a Mutex<T, R>,
}

impl<T, R: RawUnlock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, R: RawUnlock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, R: RawUnlock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: a guard exists only while its lock is held.
        unsafe { self.mutex.raw.raw_unlock() }
    }
}
