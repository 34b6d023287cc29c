//! # Index-Linked Lists
//!
//! Doubly linked lists whose nodes live in a caller-owned slice and refer to
//! each other by index. Frame descriptors, bootstrap heap blocks and VMA
//! nodes all embed a [`Link`] and are threaded onto one of these lists
//! without any allocation.
//!
//! A node must be on at most one list per [`Link`] at a time; nothing here
//! can check that, so callers keep it as an invariant of their own state.

use core::marker::PhantomData;

/// Marks the absence of a neighbor.
const NIL: u32 = u32::MAX;

/// Intrusive list link stored inside each node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Link {
    prev: u32,
    next: u32,
}

impl Link {
    /// A link that is not on any list.
    pub const UNLINKED: Self = Self {
        prev: NIL,
        next: NIL,
    };
}

impl Default for Link {
    fn default() -> Self {
        Self::UNLINKED
    }
}

/// Tells an [`IndexList`] where the link of an item lives.
pub trait Adapter {
    type Item;

    fn link(item: &Self::Item) -> &Link;
    fn link_mut(item: &mut Self::Item) -> &mut Link;
}

#[inline]
const fn to_opt(i: u32) -> Option<usize> {
    if i == NIL { None } else { Some(i as usize) }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn to_raw(i: usize) -> u32 {
    debug_assert!(i < NIL as usize, "list index {i} out of range");
    i as u32
}

/// Head of a list threaded through `[A::Item]`.
pub struct IndexList<A> {
    head: u32,
    tail: u32,
    len: usize,
    _adapter: PhantomData<fn() -> A>,
}

impl<A> Default for IndexList<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> IndexList<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            _adapter: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn front(&self) -> Option<usize> {
        to_opt(self.head)
    }

    #[inline]
    #[must_use]
    pub const fn back(&self) -> Option<usize> {
        to_opt(self.tail)
    }
}

impl<A: Adapter> IndexList<A> {
    pub fn push_front(&mut self, items: &mut [A::Item], idx: usize) {
        let raw = to_raw(idx);
        *A::link_mut(&mut items[idx]) = Link {
            prev: NIL,
            next: self.head,
        };
        match to_opt(self.head) {
            Some(h) => A::link_mut(&mut items[h]).prev = raw,
            None => self.tail = raw,
        }
        self.head = raw;
        self.len += 1;
    }

    pub fn push_back(&mut self, items: &mut [A::Item], idx: usize) {
        match to_opt(self.tail) {
            Some(t) => self.insert_after(items, t, idx),
            None => self.push_front(items, idx),
        }
    }

    /// Link `idx` directly behind `at`, which must be on this list.
    pub fn insert_after(&mut self, items: &mut [A::Item], at: usize, idx: usize) {
        let raw = to_raw(idx);
        let next = A::link(&items[at]).next;
        *A::link_mut(&mut items[idx]) = Link {
            prev: to_raw(at),
            next,
        };
        A::link_mut(&mut items[at]).next = raw;
        match to_opt(next) {
            Some(n) => A::link_mut(&mut items[n]).prev = raw,
            None => self.tail = raw,
        }
        self.len += 1;
    }

    /// Link `idx` directly in front of `at`, which must be on this list.
    pub fn insert_before(&mut self, items: &mut [A::Item], at: usize, idx: usize) {
        match to_opt(A::link(&items[at]).prev) {
            Some(p) => self.insert_after(items, p, idx),
            None => self.push_front(items, idx),
        }
    }

    /// Unlink `idx`, which must be on this list.
    pub fn remove(&mut self, items: &mut [A::Item], idx: usize) {
        debug_assert!(self.len > 0, "remove from an empty list");
        let Link { prev, next } = *A::link(&items[idx]);
        match to_opt(prev) {
            Some(p) => A::link_mut(&mut items[p]).next = next,
            None => {
                debug_assert_eq!(self.head as usize, idx, "node {idx} is not on this list");
                self.head = next;
            }
        }
        match to_opt(next) {
            Some(n) => A::link_mut(&mut items[n]).prev = prev,
            None => self.tail = prev,
        }
        *A::link_mut(&mut items[idx]) = Link::UNLINKED;
        self.len -= 1;
    }

    pub fn pop_front(&mut self, items: &mut [A::Item]) -> Option<usize> {
        let head = self.front()?;
        self.remove(items, head);
        Some(head)
    }

    #[inline]
    #[must_use]
    pub fn next(&self, items: &[A::Item], idx: usize) -> Option<usize> {
        to_opt(A::link(&items[idx]).next)
    }

    #[inline]
    #[must_use]
    pub fn prev(&self, items: &[A::Item], idx: usize) -> Option<usize> {
        to_opt(A::link(&items[idx]).prev)
    }

    /// Indices from front to back.
    pub fn iter<'a>(&self, items: &'a [A::Item]) -> Iter<'a, A> {
        Iter {
            items,
            cursor: self.head,
            remaining: self.len,
        }
    }
}

pub struct Iter<'a, A: Adapter> {
    items: &'a [A::Item],
    cursor: u32,
    remaining: usize,
}

impl<A: Adapter> Iterator for Iter<'_, A> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = to_opt(self.cursor)?;
        self.cursor = A::link(&self.items[idx]).next;
        self.remaining = self.remaining.saturating_sub(1);
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<A: Adapter> ExactSizeIterator for Iter<'_, A> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        link: Link,
    }

    struct ByLink;

    impl Adapter for ByLink {
        type Item = Node;

        fn link(item: &Node) -> &Link {
            &item.link
        }

        fn link_mut(item: &mut Node) -> &mut Link {
            &mut item.link
        }
    }

    fn nodes(n: usize) -> Vec<Node> {
        (0..n).map(|_| Node::default()).collect()
    }

    fn collect(list: &IndexList<ByLink>, items: &[Node]) -> Vec<usize> {
        list.iter(items).collect()
    }

    #[test]
    fn push_and_pop() {
        let mut items = nodes(4);
        let mut list = IndexList::<ByLink>::new();
        list.push_front(&mut items, 1);
        list.push_front(&mut items, 3);
        list.push_back(&mut items, 0);
        assert_eq!(collect(&list, &items), vec![3, 1, 0]);
        assert_eq!(list.back(), Some(0));

        assert_eq!(list.pop_front(&mut items), Some(3));
        assert_eq!(list.pop_front(&mut items), Some(1));
        assert_eq!(list.pop_front(&mut items), Some(0));
        assert_eq!(list.pop_front(&mut items), None);
        assert!(list.is_empty());
        assert_eq!(list.back(), None);
    }

    #[test]
    fn remove_middle_head_and_tail() {
        let mut items = nodes(5);
        let mut list = IndexList::<ByLink>::new();
        for i in 0..5 {
            list.push_back(&mut items, i);
        }
        list.remove(&mut items, 2);
        assert_eq!(collect(&list, &items), vec![0, 1, 3, 4]);
        list.remove(&mut items, 0);
        list.remove(&mut items, 4);
        assert_eq!(collect(&list, &items), vec![1, 3]);
        assert_eq!(list.len(), 2);
        assert_eq!(items[2].link, Link::UNLINKED);
    }

    #[test]
    fn insert_relative_to_existing_nodes() {
        let mut items = nodes(4);
        let mut list = IndexList::<ByLink>::new();
        list.push_back(&mut items, 0);
        list.insert_after(&mut items, 0, 2);
        list.insert_before(&mut items, 2, 1);
        list.insert_after(&mut items, 2, 3);
        assert_eq!(collect(&list, &items), vec![0, 1, 2, 3]);
        assert_eq!(list.next(&items, 1), Some(2));
        assert_eq!(list.prev(&items, 1), Some(0));
        assert_eq!(list.prev(&items, 0), None);
        assert_eq!(list.iter(&items).len(), 4);
    }
}
