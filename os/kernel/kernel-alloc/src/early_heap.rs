//! # Bootstrap Heap
//!
//! A buddy allocator over a static 128 KiB arena that serves `kmalloc` until
//! the slab caches are ready. Blocks are powers of two from 32 bytes up to
//! the whole arena; their state lives in a side table with one entry per
//! 32-byte unit, so the arena itself holds nothing but payload.

use crate::buddy::{BuddyBlock, BuddyLists};
use crate::list::Link;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use kernel_info::memory::{EARLY_ARENA_SIZE, EARLY_MAX_ORDER, EARLY_MIN_BLOCK_SHIFT};
use log::{debug, error};

const UNITS: usize = EARLY_ARENA_SIZE >> EARLY_MIN_BLOCK_SHIFT;
const ORDERS: usize = EARLY_MAX_ORDER as usize + 1;

/// Backing storage of the bootstrap heap.
#[repr(C, align(4096))]
pub struct EarlyArena([u8; EARLY_ARENA_SIZE]);

impl EarlyArena {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; EARLY_ARENA_SIZE])
    }
}

impl Default for EarlyArena {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UnitState {
    Free(u8),
    Busy(u8),
    Tail,
}

#[derive(Copy, Clone, Debug)]
struct EarlyBlock {
    state: UnitState,
    link: Link,
}

impl BuddyBlock for EarlyBlock {
    fn free_order(&self) -> Option<u8> {
        match self.state {
            UnitState::Free(order) => Some(order),
            _ => None,
        }
    }

    fn mark_free(&mut self, order: u8) {
        self.state = UnitState::Free(order);
    }

    fn mark_tail(&mut self) {
        self.state = UnitState::Tail;
    }

    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Buddy allocator over an [`EarlyArena`].
pub struct EarlyHeap<'a> {
    base: NonNull<u8>,
    blocks: [EarlyBlock; UNITS],
    lists: BuddyLists<EarlyBlock, ORDERS>,
    _arena: PhantomData<&'a mut EarlyArena>,
}

// SAFETY: the heap holds the only reference to its arena.
unsafe impl Send for EarlyHeap<'_> {}

/// Order of the smallest block holding `size` bytes, if any.
fn order_for(size: usize) -> Option<u8> {
    let units = size.checked_next_power_of_two()? >> EARLY_MIN_BLOCK_SHIFT;
    #[allow(clippy::cast_possible_truncation)]
    let order = units.max(1).trailing_zeros() as u8;
    (order <= EARLY_MAX_ORDER).then_some(order)
}

impl<'a> EarlyHeap<'a> {
    /// Take over `arena`; the whole arena starts as one free block.
    pub fn new(arena: &'a mut EarlyArena) -> Self {
        let base = NonNull::from(&mut arena.0).cast::<u8>();
        let mut heap = Self {
            base,
            blocks: [EarlyBlock {
                state: UnitState::Tail,
                link: Link::UNLINKED,
            }; UNITS],
            lists: BuddyLists::new(),
            _arena: PhantomData,
        };
        heap.lists.insert(&mut heap.blocks, 0, EARLY_MAX_ORDER);
        heap
    }

    /// Allocate `size` bytes, rounded up to a power of two of at least 32.
    ///
    /// Returns `None` if the request exceeds the arena or no block is free.
    ///
    /// # Panics
    /// If `size` is zero.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "zero-sized bootstrap allocation");
        let Some(order) = order_for(size) else {
            error!("bootstrap heap: {size} bytes exceed the arena");
            return None;
        };
        let Some(unit) = self.lists.take(&mut self.blocks, order) else {
            error!("bootstrap heap exhausted ({size} bytes requested)");
            return None;
        };
        self.blocks[unit].state = UnitState::Busy(order);
        // SAFETY: `unit` indexes a block inside the arena.
        Some(unsafe { self.base.add(unit << EARLY_MIN_BLOCK_SHIFT) })
    }

    /// Whether `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        ptr.addr().get()
            .checked_sub(self.base.addr().get())
            .is_some_and(|off| off < EARLY_ARENA_SIZE)
    }

    /// Usable size of the block at `ptr`.
    ///
    /// # Panics
    /// If `ptr` does not start an allocated block.
    #[must_use]
    pub fn block_size(&self, ptr: NonNull<u8>) -> usize {
        let (_, order) = self.busy_block(ptr);
        1 << (u32::from(order) + EARLY_MIN_BLOCK_SHIFT)
    }

    fn busy_block(&self, ptr: NonNull<u8>) -> (usize, u8) {
        assert!(self.contains(ptr), "{ptr:p} is outside the bootstrap heap");
        let off = ptr.addr().get() - self.base.addr().get();
        assert!(
            off.trailing_zeros() >= EARLY_MIN_BLOCK_SHIFT,
            "{ptr:p} is not at a block boundary"
        );
        let unit = off >> EARLY_MIN_BLOCK_SHIFT;
        match self.blocks[unit].state {
            UnitState::Busy(order) => (unit, order),
            state => panic!("bootstrap heap: freeing {ptr:p} in state {state:?}"),
        }
    }

    /// Release the block at `ptr`.
    ///
    /// # Panics
    /// If `ptr` is not the start of an allocated block (double free, interior
    /// pointer, foreign pointer).
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let (unit, order) = self.busy_block(ptr);
        self.lists.release(&mut self.blocks, unit, order, |_, _| true);
    }

    /// Bytes currently free.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.lists.free_units() << EARLY_MIN_BLOCK_SHIFT
    }

    /// Free blocks per size.
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        writeln!(
            w,
            "bootstrap heap: {} of {} bytes free",
            self.free_bytes(),
            EARLY_ARENA_SIZE
        )?;
        for order in 0..=EARLY_MAX_ORDER {
            let count = self.lists.count(order);
            if count > 0 {
                writeln!(
                    w,
                    "  {:6} bytes: {count} free",
                    1usize << (u32::from(order) + EARLY_MIN_BLOCK_SHIFT)
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for EarlyHeap<'_> {
    fn drop(&mut self) {
        debug!(
            "bootstrap heap retired with {} bytes free",
            self.free_bytes()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Box<EarlyArena> {
        Box::new(EarlyArena::new())
    }

    #[test]
    fn order_rounding() {
        assert_eq!(order_for(1), Some(0));
        assert_eq!(order_for(32), Some(0));
        assert_eq!(order_for(33), Some(1));
        assert_eq!(order_for(4096), Some(7));
        assert_eq!(order_for(EARLY_ARENA_SIZE), Some(EARLY_MAX_ORDER));
        assert_eq!(order_for(EARLY_ARENA_SIZE + 1), None);
        assert_eq!(order_for(usize::MAX), None);
    }

    #[test]
    fn blocks_are_size_aligned_and_disjoint() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        let a = heap.alloc(24).unwrap();
        let b = heap.alloc(100).unwrap();
        let c = heap.alloc(4000).unwrap();
        assert_eq!(heap.block_size(a), 32);
        assert_eq!(heap.block_size(b), 128);
        assert_eq!(heap.block_size(c), 4096);
        assert_eq!(c.addr().get() % 4096, 0);
        assert_eq!(b.addr().get() % 128, 0);
        assert_eq!(heap.free_bytes(), EARLY_ARENA_SIZE - 32 - 128 - 4096);

        unsafe {
            a.as_ptr().write_bytes(0xAA, 32);
            b.as_ptr().write_bytes(0xBB, 128);
            assert_eq!(*a.as_ptr().add(31), 0xAA);
        }
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        let ptrs: Vec<_> = (0..10).map(|i| heap.alloc(32 << (i % 4)).unwrap()).collect();
        for p in ptrs.into_iter().rev() {
            heap.free(p);
        }
        assert_eq!(heap.free_bytes(), EARLY_ARENA_SIZE);
        assert_eq!(heap.lists.count(EARLY_MAX_ORDER), 1);
    }

    #[test]
    fn oversized_and_exhausted_requests_fail_cleanly() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        assert_eq!(heap.alloc(EARLY_ARENA_SIZE + 1), None);
        let all = heap.alloc(EARLY_ARENA_SIZE).unwrap();
        assert_eq!(heap.alloc(1), None);
        heap.free(all);
        assert!(heap.alloc(1).is_some());
    }

    #[test]
    fn contains_checks_the_arena_bounds() {
        let mut arena = arena();
        let heap = EarlyHeap::new(&mut arena);
        let outside = NonNull::from(&0u8);
        assert!(!heap.contains(outside));
        assert!(heap.contains(heap.base));
    }

    #[test]
    #[should_panic(expected = "freeing")]
    fn double_free_panics() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        let p = heap.alloc(64).unwrap();
        heap.free(p);
        heap.free(p);
    }

    #[test]
    #[should_panic(expected = "block boundary")]
    fn interior_pointer_panics() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        let p = heap.alloc(64).unwrap();
        heap.free(unsafe { p.add(8) });
    }

    #[test]
    fn dump_lists_free_sizes() {
        let mut arena = arena();
        let mut heap = EarlyHeap::new(&mut arena);
        heap.alloc(65536).unwrap();
        let mut out = String::new();
        heap.dump(&mut out).unwrap();
        assert_eq!(
            out.lines().collect::<Vec<_>>(),
            vec!["bootstrap heap: 65536 of 131072 bytes free", "   65536 bytes: 1 free"]
        );
    }
}
