//! # Kernel synchronization primitives
//!
//! A [`Mutex`] is generic over its raw lock, which makes the locking
//! discipline of a data structure a type-level choice:
//!
//! * [`RawSpin`] — test-and-test-and-set spinlock with a bounded retry count.
//!   A lock that cannot be taken within the bound is treated as a deadlock and
//!   panics instead of hanging the CPU.
//! * [`RawSingleWriter`] — for state that is only ever touched by one context
//!   at a time. Taking it never waits; finding it held is a bug and panics.
//!
//! Code that wants to stay agnostic accepts any `R:` [`LockPolicy`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_single_writer;
mod raw_spin;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_single_writer::RawSingleWriter;
pub use raw_spin::{DEFAULT_SPIN_LIMIT, RawSpin};
pub use sync_once_cell::SyncOnceCell;

/// A mutex guarded by a bounded spinlock.
pub type SpinLock<T> = Mutex<T, RawSpin>;

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}

/// A raw lock usable as the locking discipline of a shared structure.
pub trait LockPolicy: RawLock + RawUnlock + Default + Send + Sync {}

impl<R> LockPolicy for R where R: RawLock + RawUnlock + Default + Send + Sync {}
