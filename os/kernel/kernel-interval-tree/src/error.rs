use crate::Interval;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IntervalTreeError {
    #[error("invalid interval: start {start:#x} lies past end {end:#x}")]
    InvalidRange { start: u64, end: u64 },
    #[error("interval {new} overlaps existing interval {existing}")]
    Overlap { new: Interval, existing: Interval },
    #[error("no interval contains key {key:#x}")]
    NotFound { key: u64 },
    #[error("out of memory for tree nodes")]
    OutOfMemory,
}

/// A broken red-black or ordering invariant, reported by
/// [`IntervalTree::validate`](crate::IntervalTree::validate).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("root is red")]
    RedRoot,
    #[error("root has a parent")]
    RootHasParent,
    #[error("red node {node} has a red child")]
    RedRedEdge { node: Interval },
    #[error("child of {node} does not point back to it")]
    BrokenParentLink { node: Interval },
    #[error("{left} is not strictly before {right}")]
    Unordered { left: Interval, right: Interval },
    #[error("path through {node} has black height {found}, expected {expected}")]
    BlackHeight {
        node: Interval,
        found: usize,
        expected: usize,
    },
    #[error("reachable node count {counted} differs from length {expected}")]
    Length { counted: usize, expected: usize },
}
