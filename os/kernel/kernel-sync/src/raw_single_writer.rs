use crate::{RawLock, RawUnlock};
use core::sync::atomic::{AtomicBool, Ordering};

/// Raw lock for state with a single writer at any time.
///
/// Acquisition is a single atomic swap. Observing the flag already set means
/// two contexts entered the structure concurrently, which panics.
pub struct RawSingleWriter {
    busy: AtomicBool,
}

impl Default for RawSingleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSingleWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSingleWriter {
    fn raw_lock(&self) {
        assert!(
            self.raw_try_lock(),
            "concurrent entry into single-writer state"
        );
    }

    fn raw_try_lock(&self) -> bool {
        !self.busy.swap(true, Ordering::Acquire)
    }
}

impl RawUnlock for RawSingleWriter {
    unsafe fn raw_unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }
}
