//! Invariant checking and diagnostic output.

use crate::tree::{Color, NodeId};
use crate::{Interval, IntervalTree, Violation};
use core::fmt;

impl<V> IntervalTree<V> {
    /// Check every structural invariant and return the tree's black height.
    ///
    /// Walks the tree in order through parent links; no recursion, no
    /// allocation. Cost is `O(n log n)`.
    ///
    /// # Errors
    /// The first [`Violation`] found.
    pub fn validate(&self) -> Result<usize, Violation> {
        let Some(root) = self.root else {
            return if self.len() == 0 {
                Ok(0)
            } else {
                Err(Violation::Length {
                    counted: 0,
                    expected: self.len(),
                })
            };
        };
        if self.color(root) == Color::Red {
            return Err(Violation::RedRoot);
        }
        if self.parent(root).is_some() {
            return Err(Violation::RootHasParent);
        }

        let mut expected_height = None;
        let mut previous: Option<Interval> = None;
        let mut counted = 0usize;
        let mut cur = Some(self.minimum(root));

        while let Some(id) = cur {
            let node = self.node(id);
            counted += 1;

            if let Some(prev) = previous
                && prev.end >= node.interval.start
            {
                return Err(Violation::Unordered {
                    left: prev,
                    right: node.interval,
                });
            }
            previous = Some(node.interval);

            for child in [node.left, node.right].into_iter().flatten() {
                if self.parent(child) != Some(id) {
                    return Err(Violation::BrokenParentLink {
                        node: node.interval,
                    });
                }
                if node.color == Color::Red && self.color(child) == Color::Red {
                    return Err(Violation::RedRedEdge {
                        node: node.interval,
                    });
                }
            }

            // Every missing child terminates a root-to-leaf path.
            if node.left.is_none() || node.right.is_none() {
                let found = self.black_depth(id);
                match expected_height {
                    None => expected_height = Some(found),
                    Some(expected) if expected != found => {
                        return Err(Violation::BlackHeight {
                            node: node.interval,
                            found,
                            expected,
                        });
                    }
                    Some(_) => {}
                }
            }

            cur = self.successor(id);
        }

        if counted != self.len() {
            return Err(Violation::Length {
                counted,
                expected: self.len(),
            });
        }
        Ok(expected_height.unwrap_or(0))
    }

    /// Validate, and on failure log a dump of the tree and panic.
    ///
    /// # Panics
    /// If any invariant is broken.
    pub fn assert_valid(&self) {
        if let Err(violation) = self.validate() {
            log::error!("interval tree corrupted: {violation}");
            self.corrupted("invariant violated");
        }
    }

    /// Write the tree sideways: right subtree on top, one node per line,
    /// indented by depth.
    ///
    /// ```text
    ///     [0x3000, 0x3fff] R
    /// [0x2000, 0x2fff] B
    ///     [0x1000, 0x1fff] R
    /// ```
    ///
    /// # Errors
    /// Propagates errors of the sink.
    pub fn dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        for line in self.dump_lines() {
            writeln!(w, "{line}")?;
        }
        Ok(())
    }

    pub(crate) fn corrupted(&self, what: &str) -> ! {
        for line in self.dump_lines() {
            log::error!("{line}");
        }
        panic!("interval tree: {what}");
    }

    fn dump_lines(&self) -> impl Iterator<Item = DumpLine> + '_ {
        let mut cur = self.root.map(|r| self.maximum(r));
        core::iter::from_fn(move || {
            let id = cur?;
            cur = self.predecessor(id);
            let node = self.node(id);
            Some(DumpLine {
                depth: self.depth(id),
                interval: node.interval,
                color: node.color,
            })
        })
    }

    /// Black nodes on the path from `id` up to and including the root.
    fn black_depth(&self, id: NodeId) -> usize {
        let mut count = 0;
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.color(n) == Color::Black {
                count += 1;
            }
            cur = self.parent(n);
        }
        count
    }

    fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            depth += 1;
            cur = self.parent(p);
        }
        depth
    }
}

struct DumpLine {
    depth: usize,
    interval: Interval,
    color: Color,
}

impl fmt::Display for DumpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.color {
            Color::Red => 'R',
            Color::Black => 'B',
        };
        write!(
            f,
            "{:indent$}{} {color}",
            "",
            self.interval,
            indent = self.depth * 4
        )
    }
}
