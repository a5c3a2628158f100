//! Basic blocks.

use smallvec::SmallVec;

use crate::ir::entities::{Block, Node};
use crate::packed_option::PackedOption;

/// A basic block: an ordered run of nodes plus CFG edges and the summaries
/// the allocator computes per block.
///
/// φ-nodes come first in the node sequence. Input `j` (1-based) of a φ flows
/// in from `preds[j-1]`.
#[derive(Clone, Default)]
pub struct BlockData {
    /// Nodes in schedule order.
    pub nodes: Vec<Node>,
    /// Predecessor blocks, in φ-input order.
    pub preds: SmallVec<[Block; 2]>,
    /// Successor blocks.
    pub succs: SmallVec<[Block; 2]>,
    /// Execution frequency estimate.
    pub freq: f64,
    /// Depth in the dominator tree.
    pub dom_depth: u32,
    /// Immediate dominator.
    pub idom: PackedOption<Block>,
    /// Peak integer register pressure, set by interference construction.
    pub reg_pressure: u32,
    /// Peak float register pressure, set by interference construction.
    pub freg_pressure: u32,
    /// Integer high-pressure index: topmost instruction position where
    /// pressure crosses the limit, walking backward. 0 means the whole block
    /// is high pressure; one past the last instruction means it never is.
    pub ihrp_index: u32,
    /// Float high-pressure index.
    pub fhrp_index: u32,
}

impl BlockData {
    /// An empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// One past the last instruction position. High-pressure indices use
    /// this as their "never high" value.
    pub fn end_idx(&self) -> usize {
        self.nodes.len()
    }
}
