//! IR entity references.
//!
//! Nodes and blocks are referenced by compact `u32` index types rather than
//! Rust references; the graph mutates heavily during allocation and 32-bit
//! handles keep every side table dense.

use crate::entity::entity_impl;

/// An opaque reference to a machine node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "n");

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");
