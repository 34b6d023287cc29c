use crate::{Interval, IntervalTreeError};
use alloc::vec::Vec;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// Slot index of a node in the tree's arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct NodeId(u32);

impl NodeId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct Node<V> {
    pub(crate) interval: Interval,
    pub(crate) value: V,
    pub(crate) color: Color,
    pub(crate) parent: Option<NodeId>,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
}

enum Slot<V> {
    Occupied(Node<V>),
    /// Free slot, chained to the next free one.
    Vacant(Option<NodeId>),
}

/// Red-black tree of pairwise disjoint closed intervals.
///
/// Nodes live in an arena that grows through the global allocator; freed
/// slots are recycled before the arena grows again. Every operation is
/// iterative, so stack usage is constant regardless of the tree's size.
///
/// In debug builds the full set of invariants is re-checked after each
/// mutation; a violation dumps the tree to the log and panics.
pub struct IntervalTree<V> {
    slots: Vec<Slot<V>>,
    vacant: Option<NodeId>,
    pub(crate) root: Option<NodeId>,
    len: usize,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntervalTree<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: None,
            root: None,
            len: 0,
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

    /// Find the interval containing `key`.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<(Interval, &V)> {
        self.find(key).map(|id| {
            let n = self.node(id);
            (n.interval, &n.value)
        })
    }

    /// Find the interval containing `key`, with mutable access to its value.
    pub fn search_mut(&mut self, key: u64) -> Option<(Interval, &mut V)> {
        let id = self.find(key)?;
        let n = self.node_mut(id);
        Some((n.interval, &mut n.value))
    }

    /// Insert `[start, end]` carrying `value`.
    ///
    /// # Errors
    /// * [`IntervalTreeError::InvalidRange`] if `start > end`.
    /// * [`IntervalTreeError::Overlap`] if any stored interval shares a key
    ///   with the new one.
    /// * [`IntervalTreeError::OutOfMemory`] if the node arena cannot grow.
    ///
    /// The tree is unchanged on error.
    pub fn insert(&mut self, start: u64, end: u64, value: V) -> Result<(), IntervalTreeError> {
        if start > end {
            return Err(IntervalTreeError::InvalidRange { start, end });
        }
        let interval = Interval::new(start, end);

        let mut parent = None;
        let mut go_left = false;
        let mut cur = self.root;
        while let Some(id) = cur {
            let n = self.node(id);
            parent = Some(id);
            if end < n.interval.start {
                go_left = true;
                cur = n.left;
            } else if start > n.interval.end {
                go_left = false;
                cur = n.right;
            } else {
                log::error!("interval {interval} overlaps {}", n.interval);
                return Err(IntervalTreeError::Overlap {
                    new: interval,
                    existing: n.interval,
                });
            }
        }

        let id = self.allocate(Node {
            interval,
            value,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        })?;

        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.len += 1;

        self.insert_fixup(id);
        self.debug_validate();
        Ok(())
    }

    /// Remove the interval containing `key` and return it with its value.
    ///
    /// # Errors
    /// [`IntervalTreeError::NotFound`] if no interval contains `key`.
    pub fn remove(&mut self, key: u64) -> Result<(Interval, V), IntervalTreeError> {
        let z = self
            .find(key)
            .ok_or(IntervalTreeError::NotFound { key })?;

        // y is the node physically unlinked: z itself, or its in-order successor.
        let y = match (self.left(z), self.right(z)) {
            (Some(_), Some(r)) => self.minimum(r),
            _ => z,
        };
        let x = self.left(y).or(self.right(y));
        let mut x_parent = self.parent(y);

        if let Some(x) = x {
            self.node_mut(x).parent = x_parent;
        }
        self.replace_child(x_parent, y, x);
        let removed_black = self.color(y) == Color::Black;

        if y != z {
            let zp = self.parent(z);
            let zl = self.left(z);
            let zr = self.right(z);
            let zc = self.color(z);

            self.replace_child(zp, z, Some(y));
            let yn = self.node_mut(y);
            yn.parent = zp;
            yn.left = zl;
            yn.right = zr;
            yn.color = zc;
            if let Some(l) = zl {
                self.node_mut(l).parent = Some(y);
            }
            if let Some(r) = zr {
                self.node_mut(r).parent = Some(y);
            }
            if x_parent == Some(z) {
                x_parent = Some(y);
            }
        }

        if removed_black {
            self.delete_fixup(x, x_parent);
        }

        self.len -= 1;
        let node = self.release(z);
        self.debug_validate();
        Ok((node.interval, node.value))
    }

    /// Drop every node. Runs in constant stack space.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant = None;
        self.root = None;
        self.len = 0;
    }

    /// The interval with the lowest keys.
    #[must_use]
    pub fn first(&self) -> Option<(Interval, &V)> {
        self.root.map(|r| {
            let n = self.node(self.minimum(r));
            (n.interval, &n.value)
        })
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn find(&self, key: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let n = self.node(id);
            if key < n.interval.start {
                cur = n.left;
            } else if key > n.interval.end {
                cur = n.right;
            } else {
                return Some(id);
            }
        }
        None
    }

    fn allocate(&mut self, node: Node<V>) -> Result<NodeId, IntervalTreeError> {
        if let Some(id) = self.vacant {
            let slot = &mut self.slots[id.index()];
            let Slot::Vacant(next) = *slot else {
                unreachable!("vacant chain points at an occupied slot");
            };
            self.vacant = next;
            *slot = Slot::Occupied(node);
            return Ok(id);
        }

        let id = u32::try_from(self.slots.len()).map_err(|_| IntervalTreeError::OutOfMemory)?;
        self.slots
            .try_reserve(1)
            .map_err(|_| IntervalTreeError::OutOfMemory)?;
        self.slots.push(Slot::Occupied(node));
        Ok(NodeId(id))
    }

    fn release(&mut self, id: NodeId) -> Node<V> {
        let slot = core::mem::replace(&mut self.slots[id.index()], Slot::Vacant(self.vacant));
        self.vacant = Some(id);
        match slot {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => unreachable!("released a vacant slot"),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<V> {
        match &self.slots[id.index()] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => unreachable!("dangling node {id:?}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        match &mut self.slots[id.index()] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => unreachable!("dangling node {id:?}"),
        }
    }

    #[inline]
    pub(crate) fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    #[inline]
    pub(crate) fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    #[inline]
    pub(crate) fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    #[inline]
    pub(crate) fn color(&self, id: NodeId) -> Color {
        self.node(id).color
    }

    /// Absent children count as black leaves.
    #[inline]
    pub(crate) fn is_red(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|id| self.color(id) == Color::Red)
    }

    #[inline]
    pub(crate) fn paint(&mut self, id: NodeId, color: Color) {
        self.node_mut(id).color = color;
    }

    pub(crate) fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.left(id) {
            id = l;
        }
        id
    }

    pub(crate) fn maximum(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.right(id) {
            id = r;
        }
        id
    }

    pub(crate) fn successor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(r) = self.right(id) {
            return Some(self.minimum(r));
        }
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            if self.left(p) == Some(cur) {
                return Some(p);
            }
            cur = p;
        }
        None
    }

    pub(crate) fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        if let Some(l) = self.left(id) {
            return Some(self.maximum(l));
        }
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            if self.right(p) == Some(cur) {
                return Some(p);
            }
            cur = p;
        }
        None
    }

    /// Point `parent`'s link to `old` (or the root) at `new`.
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let pn = self.node_mut(p);
                if pn.left == Some(old) {
                    pn.left = new;
                } else {
                    debug_assert_eq!(pn.right, Some(old), "parent does not own child");
                    pn.right = new;
                }
            }
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.right(x) else {
            unreachable!("left rotation needs a right child");
        };
        let beta = self.left(y);
        self.node_mut(x).right = beta;
        if let Some(b) = beta {
            self.node_mut(b).parent = Some(x);
        }
        let xp = self.parent(x);
        self.node_mut(y).parent = xp;
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.left(x) else {
            unreachable!("right rotation needs a left child");
        };
        let beta = self.right(y);
        self.node_mut(x).left = beta;
        if let Some(b) = beta {
            self.node_mut(b).parent = Some(x);
        }
        let xp = self.parent(x);
        self.node_mut(y).parent = xp;
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.parent(z) {
            if self.color(p) == Color::Black {
                break;
            }
            // A red node is never the root.
            let Some(g) = self.parent(p) else { break };

            if self.left(g) == Some(p) {
                match self.right(g) {
                    Some(u) if self.color(u) == Color::Red => {
                        self.paint(p, Color::Black);
                        self.paint(u, Color::Black);
                        self.paint(g, Color::Red);
                        z = g;
                    }
                    _ => {
                        if self.right(p) == Some(z) {
                            z = p;
                            self.rotate_left(z);
                        }
                        let Some(p) = self.parent(z) else { break };
                        self.paint(p, Color::Black);
                        self.paint(g, Color::Red);
                        self.rotate_right(g);
                    }
                }
            } else {
                match self.left(g) {
                    Some(u) if self.color(u) == Color::Red => {
                        self.paint(p, Color::Black);
                        self.paint(u, Color::Black);
                        self.paint(g, Color::Red);
                        z = g;
                    }
                    _ => {
                        if self.left(p) == Some(z) {
                            z = p;
                            self.rotate_right(z);
                        }
                        let Some(p) = self.parent(z) else { break };
                        self.paint(p, Color::Black);
                        self.paint(g, Color::Red);
                        self.rotate_left(g);
                    }
                }
            }
        }

        if let Some(r) = self.root {
            self.paint(r, Color::Black);
        }
    }

    /// Restore balance after a black node was unlinked above `x`.
    ///
    /// `x` may be an absent leaf, hence its parent is tracked separately.
    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else { break };

            if self.left(p) == x {
                let mut w = self.sibling_right(p);
                if self.color(w) == Color::Red {
                    self.paint(w, Color::Black);
                    self.paint(p, Color::Red);
                    self.rotate_left(p);
                    w = self.sibling_right(p);
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.paint(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.right(w)) {
                        if let Some(wl) = self.left(w) {
                            self.paint(wl, Color::Black);
                        }
                        self.paint(w, Color::Red);
                        self.rotate_right(w);
                        w = self.sibling_right(p);
                    }
                    let pc = self.color(p);
                    self.paint(w, pc);
                    self.paint(p, Color::Black);
                    if let Some(wr) = self.right(w) {
                        self.paint(wr, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self.sibling_left(p);
                if self.color(w) == Color::Red {
                    self.paint(w, Color::Black);
                    self.paint(p, Color::Red);
                    self.rotate_right(p);
                    w = self.sibling_left(p);
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.paint(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.left(w)) {
                        if let Some(wr) = self.right(w) {
                            self.paint(wr, Color::Black);
                        }
                        self.paint(w, Color::Red);
                        self.rotate_left(w);
                        w = self.sibling_left(p);
                    }
                    let pc = self.color(p);
                    self.paint(w, pc);
                    self.paint(p, Color::Black);
                    if let Some(wl) = self.left(w) {
                        self.paint(wl, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.paint(x, Color::Black);
        }
    }

    /// Right child of `p` where black heights guarantee it exists.
    fn sibling_right(&self, p: NodeId) -> NodeId {
        match self.right(p) {
            Some(w) => w,
            None => self.corrupted("missing right sibling during rebalance"),
        }
    }

    /// Left child of `p` where black heights guarantee it exists.
    fn sibling_left(&self, p: NodeId) -> NodeId {
        match self.left(p) {
            Some(w) => w,
            None => self.corrupted("missing left sibling during rebalance"),
        }
    }

    #[inline]
    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        self.assert_valid();
    }
}
