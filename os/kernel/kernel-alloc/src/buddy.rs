//! # Buddy Free Lists
//!
//! The split/merge core shared by the frame allocator and the bootstrap heap.
//! Blocks are addressed by the index of their first minimum-size unit; a
//! block of order `k` spans `2^k` units and starts at a multiple of `2^k`.
//! Its buddy at order `k` is `index ^ (1 << k)`.

use crate::list::{Adapter, IndexList, Link};
use core::marker::PhantomData;

/// Per-unit bookkeeping the buddy algorithm needs.
pub trait BuddyBlock {
    /// `Some(order)` if this unit heads a free block of that order.
    fn free_order(&self) -> Option<u8>;

    /// Make this unit the head of a free block.
    fn mark_free(&mut self, order: u8);

    /// Make this unit an interior unit of a larger block.
    fn mark_tail(&mut self);

    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// [`Adapter`] threading free lists through [`BuddyBlock::link`].
pub struct ViaBuddy<B>(PhantomData<B>);

impl<B: BuddyBlock> Adapter for ViaBuddy<B> {
    type Item = B;

    #[inline]
    fn link(item: &B) -> &Link {
        item.link()
    }

    #[inline]
    fn link_mut(item: &mut B) -> &mut Link {
        item.link_mut()
    }
}

/// One free list per order `0..ORDERS`.
pub struct BuddyLists<B, const ORDERS: usize> {
    lists: [IndexList<ViaBuddy<B>>; ORDERS],
}

impl<B: BuddyBlock, const ORDERS: usize> Default for BuddyLists<B, ORDERS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BuddyBlock, const ORDERS: usize> BuddyLists<B, ORDERS> {
    /// Highest order a block may reach.
    #[allow(clippy::cast_possible_truncation)]
    pub const MAX_ORDER: u8 = (ORDERS - 1) as u8;

    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: core::array::from_fn(|_| IndexList::new()),
        }
    }

    /// List `idx` as a free block of `order` without attempting to merge.
    pub fn insert(&mut self, blocks: &mut [B], idx: usize, order: u8) {
        debug_assert!(order <= Self::MAX_ORDER, "order {order} out of range");
        debug_assert_eq!(idx & ((1 << order) - 1), 0, "block {idx} misaligned for order {order}");
        blocks[idx].mark_free(order);
        self.lists[order as usize].push_front(blocks, idx);
    }

    /// Remove the block at `idx` of `order` from its list.
    pub fn unlink(&mut self, blocks: &mut [B], idx: usize, order: u8) {
        self.lists[order as usize].remove(blocks, idx);
    }

    /// Take a block of exactly `order`, splitting a larger one if needed.
    ///
    /// The returned head is unlinked; its role is left for the caller to set.
    /// The upper halves split off on the way are marked free and listed.
    pub fn take(&mut self, blocks: &mut [B], order: u8) -> Option<usize> {
        if order > Self::MAX_ORDER {
            return None;
        }
        let mut k = (order..=Self::MAX_ORDER).find(|&k| !self.lists[k as usize].is_empty())?;
        let idx = self.lists[k as usize].pop_front(blocks)?;
        while k > order {
            k -= 1;
            let buddy = idx ^ (1 << k);
            self.insert(blocks, buddy, k);
        }
        Some(idx)
    }

    /// Return the block at `idx` of `order` and merge it with free buddies.
    ///
    /// Merging stops at [`Self::MAX_ORDER`], at the end of `blocks`, when
    /// `mergeable(block, buddy)` rejects the pair, or when the buddy is not
    /// free at the same order. The absorbed half is marked as a tail. Returns
    /// the head and order of the block that ends up on a list.
    ///
    /// # Panics
    /// If the buddy is free at a larger order; such a block would overlap the
    /// one being released.
    pub fn release(
        &mut self,
        blocks: &mut [B],
        mut idx: usize,
        mut order: u8,
        mergeable: impl Fn(&B, &B) -> bool,
    ) -> (usize, u8) {
        while order < Self::MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if buddy >= blocks.len() || !mergeable(&blocks[idx], &blocks[buddy]) {
                break;
            }
            match blocks[buddy].free_order() {
                Some(o) if o == order => {}
                Some(o) if o > order => {
                    panic!("buddy {buddy} of block {idx} (order {order}) is free at order {o}")
                }
                _ => break,
            }
            self.unlink(blocks, buddy, order);
            let (low, high) = if buddy < idx { (buddy, idx) } else { (idx, buddy) };
            blocks[high].mark_tail();
            idx = low;
            order += 1;
        }
        self.insert(blocks, idx, order);
        (idx, order)
    }

    /// Number of free blocks of `order`.
    #[inline]
    #[must_use]
    pub fn count(&self, order: u8) -> usize {
        self.lists[order as usize].len()
    }

    /// Heads of the free blocks of `order`, most recently freed first.
    pub fn iter<'a>(&self, blocks: &'a [B], order: u8) -> impl Iterator<Item = usize> + 'a {
        self.lists[order as usize].iter(blocks)
    }

    /// Total number of free units across all orders.
    #[must_use]
    pub fn free_units(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Unit {
        free: Option<u8>,
        tail: bool,
        link: Link,
    }

    impl BuddyBlock for Unit {
        fn free_order(&self) -> Option<u8> {
            self.free
        }

        fn mark_free(&mut self, order: u8) {
            self.free = Some(order);
            self.tail = false;
        }

        fn mark_tail(&mut self) {
            self.free = None;
            self.tail = true;
        }

        fn link(&self) -> &Link {
            &self.link
        }

        fn link_mut(&mut self) -> &mut Link {
            &mut self.link
        }
    }

    fn busy(blocks: &mut [Unit], idx: usize) {
        blocks[idx].free = None;
        blocks[idx].tail = false;
    }

    #[test]
    fn take_splits_down_to_the_request() {
        let mut blocks = vec![Unit::default(); 16];
        let mut lists = BuddyLists::<Unit, 5>::new();
        lists.insert(&mut blocks, 0, 4);

        let idx = lists.take(&mut blocks, 1).unwrap();
        busy(&mut blocks, idx);
        assert_eq!(idx, 0);
        assert_eq!(lists.count(4), 0);
        assert_eq!(lists.iter(&blocks, 3).collect::<Vec<_>>(), vec![8]);
        assert_eq!(lists.iter(&blocks, 2).collect::<Vec<_>>(), vec![4]);
        assert_eq!(lists.iter(&blocks, 1).collect::<Vec<_>>(), vec![2]);
        assert_eq!(lists.free_units(), 14);
    }

    #[test]
    fn release_restores_the_original_block() {
        let mut blocks = vec![Unit::default(); 16];
        let mut lists = BuddyLists::<Unit, 5>::new();
        lists.insert(&mut blocks, 0, 4);

        let a = lists.take(&mut blocks, 0).unwrap();
        busy(&mut blocks, a);
        let b = lists.take(&mut blocks, 0).unwrap();
        busy(&mut blocks, b);
        assert_eq!((a, b), (0, 1));

        assert_eq!(lists.release(&mut blocks, a, 0, |_, _| true), (0, 0));
        assert_eq!(lists.release(&mut blocks, b, 0, |_, _| true), (0, 4));
        assert_eq!(lists.count(4), 1);
        assert_eq!(lists.free_units(), 16);
        assert!(blocks[8].tail);
    }

    #[test]
    fn release_respects_the_merge_predicate() {
        let mut blocks = vec![Unit::default(); 4];
        let mut lists = BuddyLists::<Unit, 3>::new();
        lists.insert(&mut blocks, 1, 0);
        // Unit 0 may never merge with anything.
        assert_eq!(lists.release(&mut blocks, 0, 0, |a, b| a.free.is_none() && b.free.is_none()), (0, 0));
        assert_eq!(lists.count(0), 2);
    }

    #[test]
    fn release_stops_at_the_end_of_the_table() {
        let mut blocks = vec![Unit::default(); 6];
        let mut lists = BuddyLists::<Unit, 4>::new();
        lists.insert(&mut blocks, 0, 2);
        // Buddy of [4, 6) at order 1 is 6, which does not exist.
        assert_eq!(lists.release(&mut blocks, 4, 1, |_, _| true), (4, 1));
    }

    #[test]
    fn take_beyond_max_order_fails() {
        let mut blocks = vec![Unit::default(); 8];
        let mut lists = BuddyLists::<Unit, 4>::new();
        lists.insert(&mut blocks, 0, 3);
        assert_eq!(lists.take(&mut blocks, 4), None);
        assert_eq!(lists.count(3), 1);
    }

    #[test]
    #[should_panic(expected = "is free at order")]
    fn overlapping_free_block_panics() {
        let mut blocks = vec![Unit::default(); 8];
        let mut lists = BuddyLists::<Unit, 4>::new();
        // Corrupt: unit 1 claims to head a free order-2 block.
        blocks[1].free = Some(2);
        lists.release(&mut blocks, 0, 0, |_, _| true);
    }
}
