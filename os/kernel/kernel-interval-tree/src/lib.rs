//! # Interval Tree
//!
//! A red-black tree keyed by pairwise disjoint closed intervals `[start, end]`.
//! Looking up any key inside a stored interval returns that interval and its
//! payload in `O(log n)`, which is what the VMA allocator needs to map an
//! arbitrary virtual address back to the area owning it.
//!
//! ## Example
//!
//! ```rust
//! use kernel_interval_tree::{Interval, IntervalTree, IntervalTreeError};
//!
//! let mut tree = IntervalTree::new();
//! tree.insert(0x1000, 0x1fff, "text").unwrap();
//! tree.insert(0x4000, 0x7fff, "heap").unwrap();
//!
//! assert_eq!(tree.search(0x5123), Some((Interval::new(0x4000, 0x7fff), &"heap")));
//! assert!(tree.search(0x2000).is_none());
//! assert!(matches!(
//!     tree.insert(0x1800, 0x27ff, "overlap"),
//!     Err(IntervalTreeError::Overlap { .. })
//! ));
//!
//! let (range, value) = tree.remove(0x1000).unwrap();
//! assert_eq!((range.start, value), (0x1000, "text"));
//! ```
//!
//! ## Invariants
//!
//! * the root is black, no red node has a red child, and every root-to-leaf
//!   path carries the same number of black nodes;
//! * an in-order walk yields strictly increasing, non-overlapping intervals;
//! * child and parent links agree.
//!
//! [`IntervalTree::validate`] reports the first broken invariant. Debug
//! builds run it after every insert and remove and panic with a tree dump on
//! failure; corruption is never repaired silently.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod check;
mod error;
mod interval;
mod iter;
mod tree;

pub use error::{IntervalTreeError, Violation};
pub use interval::Interval;
pub use iter::Iter;
pub use tree::IntervalTree;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Color;

    /// Deterministic xorshift so the shuffles are reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn shuffle<T>(&mut self, items: &mut [T]) {
            for i in (1..items.len()).rev() {
                let j = (self.next() % (i as u64 + 1)) as usize;
                items.swap(i, j);
            }
        }
    }

    fn page_range(i: u64) -> (u64, u64) {
        (i * 0x1000, i * 0x1000 + 0xfff)
    }

    #[test]
    fn empty_tree() {
        let tree: IntervalTree<u32> = IntervalTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.search(0), None);
        assert_eq!(tree.validate(), Ok(0));
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn search_hits_bounds_and_misses_gaps() {
        let mut tree = IntervalTree::new();
        tree.insert(10, 19, 'a').unwrap();
        tree.insert(30, 39, 'b').unwrap();

        assert_eq!(tree.search(10).map(|(_, v)| *v), Some('a'));
        assert_eq!(tree.search(19).map(|(_, v)| *v), Some('a'));
        assert_eq!(tree.search(39).map(|(_, v)| *v), Some('b'));
        assert_eq!(tree.search(20), None);
        assert_eq!(tree.search(9), None);
        assert_eq!(tree.search(40), None);
    }

    #[test]
    fn adjacent_intervals_are_not_overlapping() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 9, ()).unwrap();
        tree.insert(10, 19, ()).unwrap();
        tree.insert(20, 20, ()).unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn rejects_overlaps_and_inverted_ranges() {
        let mut tree = IntervalTree::new();
        tree.insert(100, 199, 1).unwrap();

        for (s, e) in [(150, 160), (50, 100), (199, 300), (0, 1000)] {
            assert_eq!(
                tree.insert(s, e, 2),
                Err(IntervalTreeError::Overlap {
                    new: Interval::new(s, e),
                    existing: Interval::new(100, 199)
                })
            );
        }
        assert_eq!(
            tree.insert(5, 4, 3),
            Err(IntervalTreeError::InvalidRange { start: 5, end: 4 })
        );
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn remove_unknown_key_fails() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 9, ()).unwrap();
        assert_eq!(
            tree.remove(10),
            Err(IntervalTreeError::NotFound { key: 10 })
        );
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn remove_by_any_contained_key() {
        let mut tree = IntervalTree::new();
        tree.insert(0x1000, 0x3fff, "a").unwrap();
        let (range, value) = tree.remove(0x2abc).unwrap();
        assert_eq!(range, Interval::new(0x1000, 0x3fff));
        assert_eq!(value, "a");
        assert!(tree.is_empty());
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = IntervalTree::new();
        for i in 0..1024 {
            let (s, e) = page_range(i);
            tree.insert(s, e, i).unwrap();
        }
        let height = tree.validate().unwrap();
        // A red-black tree of n nodes has black height <= log2(n + 1).
        assert!(height <= 11, "black height {height}");
        assert_eq!(tree.search(0x3ff_123).map(|(_, v)| *v), Some(0x3ff));
    }

    #[test]
    fn shuffled_inserts_and_removes_keep_invariants() {
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        let mut keys: Vec<u64> = (0..512).collect();
        rng.shuffle(&mut keys);

        let mut tree = IntervalTree::new();
        for &k in &keys {
            let (s, e) = page_range(k);
            tree.insert(s, e, k).unwrap();
            tree.validate().unwrap();
        }
        assert_eq!(tree.len(), 512);

        rng.shuffle(&mut keys);
        for (n, &k) in keys.iter().enumerate() {
            let (s, _) = page_range(k);
            let (_, v) = tree.remove(s + 7).unwrap();
            assert_eq!(v, k);
            tree.validate().unwrap();
            assert_eq!(tree.len(), 511 - n);
            assert!(tree.search(s).is_none());
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn iteration_is_in_order_and_can_stop_early() {
        let mut tree = IntervalTree::new();
        for k in [5u64, 1, 9, 3, 7] {
            tree.insert(k * 10, k * 10 + 5, k).unwrap();
        }
        let values: Vec<u64> = tree.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3, 5, 7, 9]);
        assert_eq!(tree.iter().len(), 5);

        let first_above_40 = tree.iter().find(|(r, _)| r.start > 40).map(|(_, v)| *v);
        assert_eq!(first_above_40, Some(5));
        assert_eq!(tree.first().map(|(r, _)| r.start), Some(10));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut tree = IntervalTree::new();
        for i in 0..8 {
            let (s, e) = page_range(i);
            tree.insert(s, e, i).unwrap();
        }
        for i in 0..8 {
            tree.remove(i * 0x1000).unwrap();
        }
        for i in 0..8 {
            let (s, e) = page_range(i + 100);
            tree.insert(s, e, i).unwrap();
        }
        assert_eq!(tree.slot_count(), 8);
    }

    #[test]
    fn search_mut_updates_payload() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 99, 1).unwrap();
        if let Some((_, v)) = tree.search_mut(50) {
            *v = 2;
        }
        assert_eq!(tree.search(0).map(|(_, v)| *v), Some(2));
    }

    #[test]
    fn clear_drops_everything() {
        let mut tree = IntervalTree::new();
        for i in 0..100 {
            let (s, e) = page_range(i);
            tree.insert(s, e, i).unwrap();
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.validate(), Ok(0));
        tree.insert(0, 1, 0).unwrap();
    }

    #[test]
    fn dump_lists_every_node_right_first() {
        let mut tree = IntervalTree::new();
        tree.insert(0x1000, 0x1fff, ()).unwrap();
        tree.insert(0x2000, 0x2fff, ()).unwrap();
        tree.insert(0x3000, 0x3fff, ()).unwrap();

        let mut out = String::new();
        tree.dump(&mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "    [0x3000, 0x3fff] R",
                "[0x2000, 0x2fff] B",
                "    [0x1000, 0x1fff] R",
            ]
        );
    }

    #[test]
    fn validate_reports_a_red_root() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 1, ()).unwrap();
        let root = tree.root.unwrap();
        tree.paint(root, Color::Red);
        assert_eq!(tree.validate(), Err(Violation::RedRoot));
    }

    #[test]
    fn validate_reports_black_height_mismatch() {
        let mut tree = IntervalTree::new();
        tree.insert(10, 19, ()).unwrap();
        tree.insert(0, 9, ()).unwrap();
        tree.insert(20, 29, ()).unwrap();
        // Blacken one child only: left path now has one more black node.
        let left = tree.left(tree.root.unwrap()).unwrap();
        tree.paint(left, Color::Black);
        assert!(matches!(
            tree.validate(),
            Err(Violation::BlackHeight { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "interval tree")]
    fn assert_valid_panics_on_corruption() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 1, ()).unwrap();
        let root = tree.root.unwrap();
        tree.paint(root, Color::Red);
        tree.assert_valid();
    }
}
