use crate::DEFAULT_SPIN_LIMIT;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;
const POISONED: u8 = 3;

/// A value written exactly once and read lock-free afterwards.
///
/// Contexts that lose the initialization race wait for the winner with a
/// bounded spin, like [`RawSpin`](crate::RawSpin): an initializer that never
/// finishes (or re-enters its own cell) panics the waiter instead of hanging
/// it. An initializer that unwinds poisons the cell.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    limit: u32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(DEFAULT_SPIN_LIMIT)
    }

    /// A cell whose waiters give up after `limit` polls.
    #[must_use]
    pub const fn with_limit(limit: u32) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            limit,
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is published after the value is written and never left.
            Some(unsafe { self.value_unchecked() })
        } else {
            None
        }
    }

    /// Initialize at most once and return `&T`.
    ///
    /// # Panics
    /// If the cell was poisoned by a panicking initializer, or another
    /// context is still initializing after `limit` polls.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(value) = self.get() {
            return value;
        }

        if self
            .state
            .compare_exchange(EMPTY, RUNNING, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return self.wait();
        }

        let poison = Poison(&self.state);
        let value = init();
        // SAFETY: RUNNING grants exclusive write access.
        unsafe { (*self.value.get()).write(value) };
        mem::forget(poison);
        self.state.store(READY, Ordering::Release);
        // SAFETY: written above.
        unsafe { self.value_unchecked() }
    }

    fn wait(&self) -> &T {
        let mut polls = 0u32;
        loop {
            match self.state.load(Ordering::Acquire) {
                // SAFETY: see `get`.
                READY => return unsafe { self.value_unchecked() },
                POISONED => panic!("once cell poisoned: its initializer panicked"),
                _ => {}
            }
            polls += 1;
            assert!(
                polls < self.limit,
                "once cell still initializing after {} polls",
                self.limit
            );
            spin_loop();
        }
    }

    /// # Safety
    /// The state must be READY.
    unsafe fn value_unchecked(&self) -> &T {
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means initialized; `&mut self` means no readers.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// Marks the cell poisoned unless the initializer returns.
struct Poison<'a>(&'a AtomicU8);

impl Drop for Poison<'_> {
    fn drop(&mut self) {
        self.0.store(POISONED, Ordering::Release);
    }
}

// SAFETY: readers only see the value after READY; one writer initializes it.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
