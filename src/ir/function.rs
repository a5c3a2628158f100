//! The function under allocation: node and block tables plus def-use edges.
//!
//! The allocator edits the graph heavily — copies appear and disappear,
//! rematerialized constants are cloned, safepoints grow extra inputs — so the
//! function maintains use lists alongside the input edges. All edge mutation
//! goes through [`Function::set_input`] and friends to keep the two in sync.

use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::ir::block::BlockData;
use crate::ir::entities::{Block, Node};
use crate::ir::node::{NodeData, NodeKind};
use crate::packed_option::PackedOption;

/// A function in late machine form.
pub struct Function {
    nodes: PrimaryMap<Node, NodeData>,
    uses: SecondaryMap<Node, Vec<Node>>,
    /// Basic blocks.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Block layout in reverse post-order.
    pub layout: Vec<Block>,
    node_block: SecondaryMap<Node, PackedOption<Block>>,
    /// The node producing the frame pointer, if the function has one.
    pub frame_ptr: PackedOption<Node>,
    /// Shared hoisted null-pointer constant, created on demand by
    /// base-pointer stretching.
    pub mach_null: PackedOption<Node>,
}

impl Function {
    /// Create an empty function.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            uses: SecondaryMap::new(),
            blocks: PrimaryMap::new(),
            layout: Vec::new(),
            node_block: SecondaryMap::new(),
            frame_ptr: PackedOption::default(),
            mach_null: PackedOption::default(),
        }
    }

    /// Number of nodes ever created.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Create a block and append it to the layout.
    pub fn create_block(&mut self, freq: f64) -> Block {
        let block = self.blocks.push(BlockData {
            freq,
            ..BlockData::new()
        });
        self.layout.push(block);
        block
    }

    /// Add a CFG edge. The `to` block's predecessor order is φ-input order.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Create a node from `data`, wiring use lists for its inputs.
    pub fn create_node(&mut self, data: NodeData) -> Node {
        let node = self.nodes.push(data);
        for i in 0..self.nodes[node].inputs.len() {
            if let Some(input) = self.nodes[node].inputs[i].expand() {
                self.uses[input].push(node);
            }
        }
        node
    }

    /// Clone `orig` into a fresh node with the same inputs and constraints.
    pub fn clone_node(&mut self, orig: Node) -> Node {
        let data = self.nodes[orig].clone();
        self.create_node(data)
    }

    /// Immutable node data.
    pub fn node(&self, node: Node) -> &NodeData {
        &self.nodes[node]
    }

    /// Mutable node data. Input edges must not be edited through this
    /// handle; use [`Function::set_input`].
    pub fn node_mut(&mut self, node: Node) -> &mut NodeData {
        &mut self.nodes[node]
    }

    /// Input `i` of `node`, if connected.
    pub fn input(&self, node: Node, i: usize) -> Option<Node> {
        self.nodes[node].input(i)
    }

    /// Number of input edges of `node`.
    pub fn num_inputs(&self, node: Node) -> usize {
        self.nodes[node].req()
    }

    /// Point input `i` of `node` at `new`, updating use lists.
    pub fn set_input(&mut self, node: Node, i: usize, new: Option<Node>) {
        if i >= self.nodes[node].inputs.len() {
            self.nodes[node]
                .inputs
                .resize(i + 1, PackedOption::default());
        }
        if let Some(old) = self.nodes[node].inputs[i].expand() {
            self.remove_use(old, node);
        }
        self.nodes[node].inputs[i] = new.into();
        if let Some(new) = new {
            self.uses[new].push(node);
        }
    }

    /// Append a new input edge to `node`.
    pub fn add_input(&mut self, node: Node, value: Node) {
        self.nodes[node].inputs.push(Some(value).into());
        self.uses[value].push(node);
    }

    /// Disconnect every input of `node`.
    pub fn disconnect_inputs(&mut self, node: Node) {
        for i in 0..self.nodes[node].inputs.len() {
            if let Some(old) = self.nodes[node].inputs[i].expand() {
                self.remove_use(old, node);
                self.nodes[node].inputs[i] = PackedOption::default();
            }
        }
    }

    fn remove_use(&mut self, def: Node, user: Node) {
        let uses = &mut self.uses[def];
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.swap_remove(pos);
        }
    }

    /// Number of input edges pointing at `node`.
    pub fn out_count(&self, node: Node) -> usize {
        self.uses[node].len()
    }

    /// The nodes using `node`, one entry per edge, in no particular order.
    pub fn users(&self, node: Node) -> &[Node] {
        &self.uses[node]
    }

    /// The unique user of `node`. Panics unless `out_count` is 1.
    pub fn unique_user(&self, node: Node) -> Node {
        debug_assert_eq!(self.uses[node].len(), 1);
        self.uses[node][0]
    }

    /// Rewrite every use of `old` to use `new` instead.
    pub fn replace_uses(&mut self, old: Node, new: Node) {
        let users = core::mem::take(&mut self.uses[old]);
        for &user in &users {
            for i in 0..self.nodes[user].inputs.len() {
                if self.nodes[user].inputs[i].expand() == Some(old) {
                    self.nodes[user].inputs[i] = Some(new).into();
                    self.uses[new].push(user);
                }
            }
        }
    }

    /// Kill projections hanging off `node`.
    pub fn kill_projections(&self, node: Node) -> Vec<Node> {
        self.uses[node]
            .iter()
            .copied()
            .filter(|&u| self.nodes[u].is_mach_proj() && self.nodes[u].input(0) == Some(node))
            .collect()
    }

    /// Does `node` have a projection carrying a memory effect?
    pub fn has_mem_projection(&self, node: Node) -> bool {
        self.uses[node].iter().any(|&u| {
            matches!(self.nodes[u].kind, NodeKind::Proj { mem: true })
                && self.nodes[u].input(0) == Some(node)
        })
    }

    /// The block containing `node`, if placed.
    pub fn block_of(&self, node: Node) -> Option<Block> {
        self.node_block[node].expand()
    }

    /// Record that `node` lives in `block` without touching the node list.
    pub fn map_node_to_block(&mut self, node: Node, block: Block) {
        self.node_block[node] = Some(block).into();
    }

    /// Forget the block of `node`.
    pub fn unmap_node_from_block(&mut self, node: Node) {
        self.node_block[node] = PackedOption::default();
    }

    /// Append `node` at the end of `block`.
    pub fn append_node(&mut self, block: Block, node: Node) {
        self.blocks[block].nodes.push(node);
        self.map_node_to_block(node, block);
    }

    /// Insert `node` at position `pos` in `block`.
    pub fn insert_node(&mut self, block: Block, pos: usize, node: Node) {
        self.blocks[block].nodes.insert(pos, node);
        self.map_node_to_block(node, block);
    }

    /// Remove the node at position `pos` in `block`.
    pub fn remove_node_at(&mut self, block: Block, pos: usize) -> Node {
        let node = self.blocks[block].nodes.remove(pos);
        self.unmap_node_from_block(node);
        node
    }

    /// Find and remove `node` from the block containing it.
    pub fn find_remove(&mut self, node: Node) {
        if let Some(block) = self.block_of(node) {
            if let Some(pos) = self.find_node(block, node) {
                self.remove_node_at(block, pos);
            }
        }
    }

    /// Position of `node` within `block`.
    pub fn find_node(&self, block: Block, node: Node) -> Option<usize> {
        self.blocks[block].nodes.iter().position(|&n| n == node)
    }

    /// Index of the first non-φ node in `block`.
    pub fn first_non_phi(&self, block: Block) -> usize {
        let nodes = &self.blocks[block].nodes;
        nodes
            .iter()
            .position(|&n| !self.nodes[n].is_phi())
            .unwrap_or(nodes.len())
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::{NodeData, NodeKind};

    fn mach() -> NodeData {
        NodeData::new(NodeKind::Mach)
    }

    #[test]
    fn use_lists_follow_edges() {
        let mut func = Function::new();
        let a = func.create_node(mach());
        let b = func.create_node(mach());
        let mut use_ab = mach();
        use_ab.inputs.push(None.into());
        use_ab.inputs.push(Some(a).into());
        use_ab.inputs.push(Some(b).into());
        let u = func.create_node(use_ab);

        assert_eq!(func.out_count(a), 1);
        assert_eq!(func.out_count(b), 1);

        func.set_input(u, 2, Some(a));
        assert_eq!(func.out_count(a), 2);
        assert_eq!(func.out_count(b), 0);

        let c = func.create_node(mach());
        func.replace_uses(a, c);
        assert_eq!(func.out_count(a), 0);
        assert_eq!(func.out_count(c), 2);
        assert_eq!(func.input(u, 1), Some(c));
        assert_eq!(func.input(u, 2), Some(c));

        func.disconnect_inputs(u);
        assert_eq!(func.out_count(c), 0);
    }

    #[test]
    fn block_layout() {
        let mut func = Function::new();
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(0.5);
        func.add_edge(b0, b1);
        assert_eq!(func.blocks[b1].preds.as_slice(), [b0]);
        assert_eq!(func.blocks[b0].succs.as_slice(), [b1]);

        let n = func.create_node(mach());
        func.append_node(b0, n);
        assert_eq!(func.block_of(n), Some(b0));
        assert_eq!(func.find_node(b0, n), Some(0));
        func.find_remove(n);
        assert_eq!(func.block_of(n), None);
    }
}
