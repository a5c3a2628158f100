//! Liveness analysis over live-range ids.
//!
//! A totally incremental backward solver. The LIVE problem is monotonic: pull
//! a block from the worklist, push its delta (newly live-in values) into the
//! live-out sets of all predecessors, keep whatever was not locally defined
//! as the predecessor's new delta, and re-queue it. The block-local live-in
//! sets are computed once in the outer loop; the inner worklist loop only
//! moves deltas around. φ-node inputs count as live at the corresponding
//! predecessor, never at the φ's own block head.
//!
//! Scratch delta sets are recycled through a free list; with the chunk pool
//! inside [`IndexSet`] this keeps the hot loop free of allocation.

use cranelift_entity::{EntitySet, SecondaryMap};

use crate::indexset::IndexSet;
use crate::ir::{Block, Function};
use crate::regalloc::liverange::LiveRangeMap;

/// Liveness results: per-block live-out (and optionally live-in) sets of
/// live-range ids.
pub struct Liveness {
    live: SecondaryMap<Block, IndexSet>,
    livein: SecondaryMap<Block, IndexSet>,
    defs: SecondaryMap<Block, IndexSet>,
    deltas: SecondaryMap<Block, Option<IndexSet>>,
    free: Vec<IndexSet>,
    worklist: Vec<Block>,
    keep_deltas: bool,
}

impl Liveness {
    /// New, empty liveness state.
    pub fn new() -> Self {
        Self {
            live: SecondaryMap::new(),
            livein: SecondaryMap::new(),
            defs: SecondaryMap::new(),
            deltas: SecondaryMap::new(),
            free: Vec::new(),
            worklist: Vec::new(),
            keep_deltas: false,
        }
    }

    /// Live-out set of `block`.
    pub fn live_out(&self, block: Block) -> &IndexSet {
        &self.live[block]
    }

    /// Mutable live-out set, for phases that patch liveness in place
    /// (coalescing renames, live-range stretching).
    pub fn live_out_mut(&mut self, block: Block) -> &mut IndexSet {
        &mut self.live[block]
    }

    /// Live-in set of `block`. Only populated when `compute` ran with
    /// `keep_deltas`.
    pub fn live_in(&self, block: Block) -> &IndexSet {
        &self.livein[block]
    }

    fn get_free_set(&mut self) -> IndexSet {
        self.free.pop().unwrap_or_default()
    }

    fn recycle(&mut self, mut set: IndexSet) {
        set.clear();
        self.free.push(set);
    }

    /// Add `r` to `p`'s live-out set; if it is new and not locally defined,
    /// extend `p`'s delta and queue `p` once it has had its first pass.
    fn add_liveout(&mut self, p: Block, r: u32, first_pass: &EntitySet<Block>) {
        if self.live[p].insert(r as usize) && !self.defs[p].contains(r as usize) {
            let on_worklist = self.deltas[p].is_some();
            let mut delta = match self.deltas[p].take() {
                Some(d) => d,
                None => self.get_free_set(),
            };
            delta.insert(r as usize);
            self.deltas[p] = Some(delta);
            if !on_worklist && first_pass.contains(p) {
                self.worklist.push(p);
            }
        }
    }

    /// Add a whole set of values to `p`'s live-out set.
    fn add_liveout_set(&mut self, p: Block, lo: &IndexSet, first_pass: &EntitySet<Block>) {
        let on_worklist = self.deltas[p].is_some();
        let mut delta = match self.deltas[p].take() {
            Some(d) => d,
            None => self.get_free_set(),
        };
        for r in lo.iter() {
            if self.live[p].insert(r) && !self.defs[p].contains(r) {
                delta.insert(r);
            }
        }
        if delta.count() > 0 {
            self.deltas[p] = Some(delta);
            if !on_worklist && first_pass.contains(p) {
                self.worklist.push(p);
            }
        } else {
            self.recycle(delta);
        }
    }

    /// Retire `block`'s delta: fold it into the live-in set when requested,
    /// then recycle its storage.
    fn retire_delta(&mut self, block: Block, delta: IndexSet) {
        if self.keep_deltas {
            for r in delta.iter() {
                self.livein[block].insert(r);
            }
        }
        self.recycle(delta);
    }

    /// Solve liveness for `func` under the current `names` mapping.
    ///
    /// `keep_deltas` additionally records per-block live-in sets, which the
    /// safepoint-record builder wants. Never fails; the sets grow
    /// monotonically and are bounded by `max_lrg_id`.
    pub fn compute(
        &mut self,
        func: &Function,
        names: &LiveRangeMap,
        keep_deltas: bool,
    ) {
        self.keep_deltas = keep_deltas;
        self.worklist.clear();
        for &block in &func.layout {
            self.live[block].clear();
            self.livein[block].clear();
            self.defs[block].clear();
            if let Some(d) = self.deltas[block].take() {
                self.recycle(d);
            }
        }

        // Blocks that have been through pass one; only those may enter the
        // worklist.
        let mut first_pass = EntitySet::<Block>::new();

        // Outer loop: compute local live-in sets and push them into
        // predecessors, starting from the layout tail.
        for &block in func.layout.iter().rev() {
            let mut usedef = self.get_free_set();

            // Walk the block bottom-up, stopping at the φs.
            let nodes = &func.blocks[block].nodes;
            let mut phi_end = nodes.len();
            while phi_end > 0 {
                let node = nodes[phi_end - 1];
                if func.node(node).is_phi() {
                    break;
                }
                let r = names.live_range_id(node);
                if r != 0 {
                    self.defs[block].insert(r as usize);
                    usedef.remove(r as usize);
                }
                for k in 1..func.num_inputs(node) {
                    if let Some(input) = func.input(node, k) {
                        if func.block_of(input) != Some(block) {
                            let u = names.live_range_id(input);
                            if u != 0 {
                                usedef.insert(u as usize);
                            }
                        }
                    }
                }
                phi_end -= 1;
            }

            // Anything defined by the φ head does not flow in from above.
            for &phi in &nodes[..phi_end] {
                let r = names.live_range_id(phi);
                if r != 0 {
                    self.defs[block].insert(r as usize);
                    usedef.remove(r as usize);
                }
            }

            // Push the local live-in set to all predecessors; φ uses go to
            // the predecessor matching their input position.
            let preds: Vec<Block> = func.blocks[block].preds.iter().copied().collect();
            for (j, &p) in preds.iter().enumerate() {
                self.add_liveout_set(p, &usedef, &first_pass);
                for &phi in &nodes[..phi_end] {
                    if let Some(input) = func.input(phi, j + 1) {
                        let u = names.live_range_id(input);
                        if u != 0 {
                            self.add_liveout(p, u, &first_pass);
                        }
                    }
                }
            }
            self.retire_delta(block, usedef);
            first_pass.insert(block);
            // A self-loop may have parked a delta on this block before it
            // was eligible for the worklist; queue it now.
            if self.deltas[block].is_some() {
                self.worklist.push(block);
            }

            // Inner loop: propagate deltas until quiescent.
            while let Some(b) = self.worklist.pop() {
                let delta = match self.deltas[b].take() {
                    Some(d) => d,
                    None => continue,
                };
                debug_assert!(delta.count() > 0, "missing delta set");
                let preds: Vec<Block> = func.blocks[b].preds.iter().copied().collect();
                for &p in &preds {
                    self.add_liveout_set(p, &delta, &first_pass);
                }
                self.retire_delta(b, delta);
            }
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, NodeData, NodeKind};
    use cranelift_entity::EntityRef;

    // names[i] = i + 1 so every node allocates.
    fn name_all(func: &Function, map: &mut LiveRangeMap) {
        for i in 0..func.num_nodes() {
            map.extend(crate::ir::Node::new(i), i as u32 + 1);
        }
        map.set_max_lrg_id(func.num_nodes() as u32 + 1);
        map.reset_uf_map(func.num_nodes() as u32 + 1);
    }

    #[test]
    fn straight_line() {
        let mut func = Function::new();
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        func.add_edge(b0, b1);

        let def = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b0, def);
        let mut use_data = NodeData::new(NodeKind::Mach);
        use_data.inputs.push(None.into());
        use_data.inputs.push(Some(def).into());
        let user = func.create_node(use_data);
        func.append_node(b1, user);

        let mut map = LiveRangeMap::new();
        name_all(&func, &mut map);

        let mut live = Liveness::new();
        live.compute(&func, &map, false);

        let def_lrg = map.live_range_id(def) as usize;
        assert!(live.live_out(b0).contains(def_lrg));
        assert!(!live.live_out(b1).contains(def_lrg));
    }

    #[test]
    fn phi_inputs_live_at_pred() {
        // diamond: b0 -> b1, b0 -> b2, b1 -> b3, b2 -> b3, phi in b3
        let mut func = Function::new();
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(0.5);
        let b2 = func.create_block(0.5);
        let b3 = func.create_block(1.0);
        func.add_edge(b0, b1);
        func.add_edge(b0, b2);
        func.add_edge(b1, b3);
        func.add_edge(b2, b3);

        let a1 = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b1, a1);
        let a2 = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b2, a2);
        let mut phi_data = NodeData::new(NodeKind::Phi);
        phi_data.inputs.push(None.into());
        phi_data.inputs.push(Some(a1).into());
        phi_data.inputs.push(Some(a2).into());
        let phi = func.create_node(phi_data);
        func.append_node(b3, phi);

        let mut map = LiveRangeMap::new();
        name_all(&func, &mut map);
        let mut live = Liveness::new();
        live.compute(&func, &map, false);

        let l1 = map.live_range_id(a1) as usize;
        let l2 = map.live_range_id(a2) as usize;
        // Each φ input is live out of its own arm only.
        assert!(live.live_out(b1).contains(l1));
        assert!(!live.live_out(b1).contains(l2));
        assert!(live.live_out(b2).contains(l2));
        assert!(!live.live_out(b2).contains(l1));
        // Nothing is live out of b0.
        assert!(live.live_out(b0).is_empty());
    }

    #[test]
    fn loop_carried_value() {
        // b0 -> b1, b1 -> b1 (self loop), b1 -> b2; value defined in b0 and
        // used in b2 is live around the loop.
        let mut func = Function::new();
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(10.0);
        let b2 = func.create_block(1.0);
        func.add_edge(b0, b1);
        func.add_edge(b1, b1);
        func.add_edge(b1, b2);

        let def = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b0, def);
        let body = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b1, body);
        let mut use_data = NodeData::new(NodeKind::Mach);
        use_data.inputs.push(None.into());
        use_data.inputs.push(Some(def).into());
        let user = func.create_node(use_data);
        func.append_node(b2, user);

        let mut map = LiveRangeMap::new();
        name_all(&func, &mut map);
        let mut live = Liveness::new();
        live.compute(&func, &map, false);

        let l = map.live_range_id(def) as usize;
        assert!(live.live_out(b0).contains(l));
        assert!(live.live_out(b1).contains(l));
    }

    #[test]
    fn recompute_is_deterministic() {
        let mut func = Function::new();
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        func.add_edge(b0, b1);
        func.add_edge(b1, b0);
        let def = func.create_node(NodeData::new(NodeKind::Mach));
        func.append_node(b0, def);
        let mut use_data = NodeData::new(NodeKind::Mach);
        use_data.inputs.push(None.into());
        use_data.inputs.push(Some(def).into());
        let user = func.create_node(use_data);
        func.append_node(b1, user);

        let mut map = LiveRangeMap::new();
        name_all(&func, &mut map);
        let mut live = Liveness::new();
        live.compute(&func, &map, false);
        let first: Vec<Vec<usize>> = func
            .layout
            .iter()
            .map(|&b| live.live_out(b).iter().collect())
            .collect();
        live.compute(&func, &map, false);
        let second: Vec<Vec<usize>> = func
            .layout
            .iter()
            .map(|&b| live.live_out(b).iter().collect())
            .collect();
        assert_eq!(first, second);
    }
}
