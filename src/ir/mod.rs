//! Intermediate representation consumed by the allocator.
//!
//! This is a late-stage CFG of machine nodes: instruction selection has
//! already happened, every node carries the register masks its target
//! encoding requires, and blocks are laid out in reverse post-order. The
//! allocator reads this IR, inserts and removes copy nodes, and finally
//! assigns a [`ValueLoc`] to every allocatable node.

pub mod block;
pub mod entities;
pub mod function;
pub mod node;

pub use self::block::BlockData;
pub use self::entities::{Block, Node};
pub use self::function::Function;
pub use self::node::{ConstData, NodeData, NodeKind, SpillKind, ValueLoc, ValueType};
