use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Number of failed polls after which a spinning CPU gives up.
pub const DEFAULT_SPIN_LIMIT: u32 = 10_000_000;

pub struct RawSpin {
    held: AtomicBool,
    limit: u32,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(DEFAULT_SPIN_LIMIT)
    }

    /// A spinlock that panics after `limit` failed polls.
    #[must_use]
    pub const fn with_limit(limit: u32) -> Self {
        Self {
            held: AtomicBool::new(false),
            limit,
        }
    }

    /// Spin until acquired (TATAS).
    ///
    /// # Panics
    /// When the lock is still held after `limit` polls; a holder that long is
    /// a deadlock or a lost unlock.
    #[inline]
    pub fn lock(&self) {
        let mut polls = 0u32;
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                polls += 1;
                assert!(
                    polls < self.limit,
                    "spinlock not acquired after {} polls",
                    self.limit
                );
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// The caller must currently hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        self.lock();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}
