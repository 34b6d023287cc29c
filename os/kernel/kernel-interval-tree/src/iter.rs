use crate::tree::NodeId;
use crate::{Interval, IntervalTree};

/// In-order iterator over an [`IntervalTree`], lowest keys first.
pub struct Iter<'a, V> {
    tree: &'a IntervalTree<V>,
    next: Option<NodeId>,
    remaining: usize,
}

impl<V> IntervalTree<V> {
    /// Visit all intervals in ascending order.
    ///
    /// Stop early with the usual adaptors (`find`, `take_while`,
    /// `try_for_each`).
    #[must_use]
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            tree: self,
            next: self.root.map(|r| self.minimum(r)),
            remaining: self.len(),
        }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Interval, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = self.tree.node(id);
        self.next = self.tree.successor(id);
        self.remaining -= 1;
        Some((node.interval, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V> ExactSizeIterator for Iter<'_, V> {}

impl<'a, V> IntoIterator for &'a IntervalTree<V> {
    type Item = (Interval, &'a V);
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
