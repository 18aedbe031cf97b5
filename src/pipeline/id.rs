//! Identity types for the pipeline system.
//!
//! `NodeId` and `EdgeId` are newtypes over `u32` that serve as direct array
//! indices into a compiled plan, providing O(1) lookup. Graph definitions use
//! string ids; the compiler assigns the numeric ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into `CompiledPlan::nodes`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeId(INVALID)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Compact copy identifier. High 20 bits = node index, low 12 bits = copy number.
/// Supports up to ~1M nodes with 4096 copies each.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CopyId(pub u32);

impl CopyId {
    const COPY_BITS: u32 = 12;
    const COPY_MASK: u32 = (1 << Self::COPY_BITS) - 1;

    /// Largest copy count a node may be configured with.
    pub const MAX_COPIES: usize = 1 << Self::COPY_BITS;

    pub fn new(node: NodeId, copy: u16) -> Self {
        debug_assert!((copy as usize) < Self::MAX_COPIES);
        Self((node.0 << Self::COPY_BITS) | (copy as u32 & Self::COPY_MASK))
    }

    #[inline]
    pub fn node(self) -> NodeId {
        NodeId(self.0 >> Self::COPY_BITS)
    }

    #[inline]
    pub fn copy(self) -> usize {
        (self.0 & Self::COPY_MASK) as usize
    }
}

impl fmt::Debug for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CopyId(node={}, copy={})", self.node().0, self.copy())
    }
}

/// Index into `CompiledPlan::edges`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub const INVALID: EdgeId = EdgeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "EdgeId(INVALID)")
        } else {
            write!(f, "EdgeId({})", self.0)
        }
    }
}

/// Identifier handed out by an execution host for a submitted run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!NodeId::INVALID.is_valid());
    }

    #[test]
    fn test_copy_id_round_trip() {
        let node = NodeId(100);
        let copy = CopyId::new(node, 7);
        assert_eq!(copy.node(), node);
        assert_eq!(copy.copy(), 7);
    }

    #[test]
    fn test_copy_id_limits() {
        let node = NodeId((1 << 20) - 1);
        let copy = CopyId::new(node, (CopyId::MAX_COPIES - 1) as u16);
        assert_eq!(copy.node(), node);
        assert_eq!(copy.copy(), 4095);
    }

    #[test]
    fn test_edge_id() {
        let id = EdgeId(5);
        assert!(id.is_valid());
        assert!(!EdgeId::INVALID.is_valid());
    }

    #[test]
    fn test_run_id_display() {
        assert_eq!(RunId(9).to_string(), "run-9");
    }
}
