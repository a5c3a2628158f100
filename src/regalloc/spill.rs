//! Live-range splitting.
//!
//! When Select fails to color, every failed live range is broken up so that
//! the next round sees only short, easily colored pieces: each definition
//! gets a spill store into a stack-class live range directly below it, each
//! use gets a reload immediately above it, and φs of the spilled value carry
//! the stack live range so every block observes one uniform name. Safepoint
//! debug uses read the stack value directly instead of reloading, and
//! rematerializable definitions are recomputed at their uses rather than
//! loaded back.
//!
//! All stores of one spilled live range share a single stack-class live
//! range; the stack is unbounded, so that live range is trivially colorable
//! no matter how long it stretches.

use cranelift_entity::{EntityRef, SecondaryMap};

use crate::ir::{Node, NodeData, NodeKind, SpillKind};
use crate::isa::{RegClass, RegMask};
use crate::packed_option::PackedOption;
use crate::regalloc::Chaitin;
use crate::result::{CodegenError, CodegenResult};

/// Hard ceiling on graph growth; splitting past this fails the compile.
const MAX_NODE_LIMIT: usize = 80_000;

impl Chaitin<'_> {
    /// The stack-only part of the spill mask for `class`.
    fn stack_only_mask(&self, class: RegClass) -> RegMask {
        let mut mask = *self.isa.spill_mask(class);
        mask.subtract(self.isa.reg_mask(class));
        mask
    }

    /// Split every live range carrying a spill sentinel. Returns the new
    /// live-range id bound.
    pub fn split(&mut self) -> CodegenResult<u32> {
        let mut maxlrg = self.lrg_map.max_lrg_id();

        // Which live ranges failed to color?
        let mut spilled = vec![false; maxlrg as usize];
        let mut any = false;
        for i in 1..maxlrg {
            if self.lrgs[i as usize].is_spilled() {
                spilled[i as usize] = true;
                any = true;
            }
        }
        if !any {
            return Ok(maxlrg);
        }

        // One stack-class live range per spilled id, shared by all of its
        // stores.
        let mut stack_lrg = vec![0u32; spilled.len()];
        for (i, &is_spilled) in spilled.iter().enumerate() {
            if is_spilled {
                stack_lrg[i] = maxlrg;
                self.lrg_map.uf_extend(maxlrg, maxlrg);
                maxlrg += 1;
            }
        }

        // Spill stores per definition; φs of a spilled live range are their
        // own stack definition.
        let mut store_of: SecondaryMap<Node, PackedOption<Node>> = SecondaryMap::new();

        // Nodes below this index are the original graph.
        let unique = self.func.num_nodes();

        // Pass one: place a store below every definition and move φs onto
        // the stack live range.
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut j = 0;
            while j < self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                j += 1;
                if n.index() >= unique {
                    continue;
                }
                let lidx = self.lrg_map.live_range_id(n);
                if lidx == 0 || !spilled[lidx as usize] {
                    continue;
                }
                let class = match self.func.node(n).ideal {
                    None | Some(RegClass::Flags) => return Err(CodegenError::NotSpillable),
                    Some(c) => c,
                };
                if self.isa.spill_mask(class).is_empty() {
                    return Err(CodegenError::NotSpillable);
                }
                self.set_was_spilled(n);

                if self.func.node(n).is_phi() {
                    // The φ itself now merges the stack value; its operands
                    // become stack values too, so drop any register
                    // constraints it carried.
                    self.lrg_map.map(n, stack_lrg[lidx as usize]);
                    let mask = self.stack_only_mask(class);
                    let data = self.func.node_mut(n);
                    data.out_mask = mask;
                    data.in_masks.clear();
                    store_of[n] = Some(n).into();
                    continue;
                }

                // Insert the store below `n`, past any of its projections.
                let mut at = j;
                let nodes = &self.func.blocks[block].nodes;
                while at < nodes.len()
                    && self.func.node(nodes[at]).is_proj()
                    && self.func.input(nodes[at], 0) == Some(n)
                {
                    at += 1;
                }
                let mut data = NodeData::new(NodeKind::SpillCopy(SpillKind::Def));
                data.ty = self.func.node(n).ty;
                data.ideal = Some(class);
                data.out_mask = self.stack_only_mask(class);
                data.in_masks = vec![RegMask::empty(), *self.isa.spill_mask(class)];
                let store = self.func.create_node(data);
                self.func.set_input(store, 1, Some(n));
                self.func.insert_node(block, at, store);
                self.lrg_map.extend(store, stack_lrg[lidx as usize]);
                store_of[n] = Some(store).into();

                if self.func.num_nodes() > MAX_NODE_LIMIT {
                    return Err(CodegenError::ImplLimitExceeded);
                }
            }
        }

        // Pass two: repair the uses.
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut j = 0;
            while j < self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                j += 1;
                if n.index() >= unique {
                    continue;
                }
                let debug_start = self.func.node(n).debug_start();
                let is_phi = self.func.node(n).is_phi();

                for k in 1..self.func.num_inputs(n) {
                    let d = match self.func.input(n, k) {
                        Some(d) => d,
                        None => continue,
                    };
                    let store = match store_of[d].expand() {
                        Some(s) => s,
                        None => continue,
                    };

                    if is_phi || k >= debug_start {
                        // φs and debug uses read the stack value directly.
                        if d != store {
                            self.func.set_input(n, k, Some(store));
                        }
                        continue;
                    }

                    if self.func.node(d).rematerialize {
                        // Recompute the value here instead of reloading it.
                        let pos = self
                            .func
                            .find_node(block, n)
                            .expect("use not in its own block");
                        let copy = self.func.clone_node(d);
                        self.func.insert_node(block, pos, copy);
                        self.new_lrg(copy, maxlrg);
                        maxlrg += 1;
                        self.clone_projs(block, pos + 1, d, copy);
                        self.func.set_input(n, k, Some(copy));
                        continue;
                    }

                    // Reload above the use into a fresh register-class live
                    // range.
                    let class = self.func.node(d).ideal.expect("spilled def with no class");
                    let mut data = NodeData::new(NodeKind::SpillCopy(SpillKind::Use));
                    data.ty = self.func.node(d).ty;
                    data.ideal = Some(class);
                    data.out_mask = *self.isa.spill_mask(class);
                    data.in_masks = vec![RegMask::empty(), self.stack_only_mask(class)];
                    let reload = self.func.create_node(data);
                    self.func.set_input(reload, 1, Some(store));
                    let pos = self
                        .func
                        .find_node(block, n)
                        .expect("use not in its own block");
                    self.func.insert_node(block, pos, reload);
                    if self.func.node(n).two_addr == Some(k as u32) {
                        // A two-address operand must share the result's
                        // register; keep the reload in the result's live
                        // range so the pairing survives the split.
                        let name = self.lrg_map.live_range_id(n);
                        self.lrg_map.extend(reload, name);
                        self.lrg_map.uf_extend(name, name);
                    } else {
                        self.new_lrg(reload, maxlrg);
                        maxlrg += 1;
                    }
                    self.func.set_input(n, k, Some(reload));

                    if self.func.num_nodes() > MAX_NODE_LIMIT {
                        return Err(CodegenError::ImplLimitExceeded);
                    }
                }
            }
        }

        log::debug!(
            "split: {} spilled live ranges, {} live ranges now",
            spilled.iter().filter(|&&s| s).count(),
            maxlrg
        );
        Ok(maxlrg)
    }
}
