//! Copy coalescing.
//!
//! Two rounds. The *aggressive* round runs on virtual copies (mismatched
//! φ inputs and two-address operands) and merges live ranges with no regard
//! for colorability; whatever refuses to merge is then manifested as a real
//! copy, with parallel-copy ordering handled explicitly. The *conservative*
//! round runs after spilling on actual spill copies and merges only when the
//! combined live range provably stays colorable under Briggs's criterion.

use cranelift_entity::EntityRef;

use crate::indexset::IndexSet;
use crate::ir::{Block, Node, NodeData, NodeKind, SpillKind};
use crate::isa::{RegClass, RegMask};
use crate::regalloc::liverange::{DefState, ALL_STACK_SIZE};
use crate::regalloc::Chaitin;
use crate::result::{CodegenError, CodegenResult};

/// Blocks below this frequency get their safepoint debug uses pre-split.
const DEBUG_SPLIT_FREQ: f64 = 0.001;

/// Live ranges touched at or above this frequency are worth pre-splitting at
/// cold debug uses.
const HIGH_FREQUENCY_LRG: f64 = 0.25;

/// Conservative coalescing skips blocks below this frequency; the spill
/// mechanism already handles them well.
const UNCOMMON_FREQ: f64 = 1e-6;

impl Chaitin<'_> {
    /// Combine the live ranges def'd by these two nodes, `n2` being an input
    /// to `n1`. Refuses interfering pairs, register-disjoint pairs, and
    /// int-into-oop merges; oop-ness of the merged live range is preserved.
    pub fn combine_these_two(&mut self, n1: Node, n2: Node) {
        let lr1 = self.lrg_map.find_node(n1);
        let lr2 = self.lrg_map.find_node(n2);
        if lr1 == lr2 || lr1 == 0 || lr2 == 0 || self.ifg.test_edge_sq(lr1, lr2) {
            return;
        }
        // oop->oop, int->int and oop->int are fine: the merged live range
        // keeps its oop-ness, below. An int value flowing into an oop-named
        // destination would claim GC provenance it does not have, so
        // int->oop is refused.
        let ok_direction = !self.lrgs[lr1 as usize].is_oop || self.lrgs[lr2 as usize].is_oop;
        if !ok_direction {
            return;
        }
        if !self.lrgs[lr1 as usize]
            .mask
            .overlaps(&self.lrgs[lr2 as usize].mask)
        {
            return;
        }
        // Merge larger id into smaller.
        let (lo, hi, n_lo, n_hi) = if lr1 > lr2 {
            (lr2, lr1, n2, n1)
        } else {
            (lr1, lr2, n1, n2)
        };
        self.union(n_lo, n_hi);
        let hi_freq = self.lrgs[hi as usize].max_freq;
        if self.lrgs[lo as usize].max_freq < hi_freq {
            self.lrgs[lo as usize].max_freq = hi_freq;
        }
        // Oop-ness is conservatively preserved across the merge.
        let hi_oop = self.lrgs[hi as usize].is_oop;
        self.lrgs[lo as usize].is_oop |= hi_oop;
        self.ifg.union_adjacency(lo, hi);
        let hi_mask = self.lrgs[hi as usize].mask;
        self.lrgs[lo as usize].mask.intersect(&hi_mask);
    }

    /// One round of aggressive coalescing: visit every block from most to
    /// least frequent and merge φ-input and two-address pairings.
    pub fn aggressive_coalesce_driver(&mut self) {
        for bi in 0..self.blks.len() {
            let block = self.blks[bi];
            self.aggressive_coalesce_block(block);
        }
    }

    fn aggressive_coalesce_block(&mut self, b: Block) {
        // Copies are still virtual: φs of successor blocks just have
        // mismatched live ranges. Try to line them up.
        let succs: Vec<Block> = self.func.blocks[b].succs.iter().copied().collect();
        for bs in succs {
            // Index of 'b' among the successor's predecessors.
            let j = self.func.blocks[bs]
                .preds
                .iter()
                .position(|&p| p == b)
                .expect("successor lists and predecessor lists disagree");
            let phis: Vec<Node> = self.func.blocks[bs]
                .nodes
                .iter()
                .copied()
                .take_while(|&n| self.func.node(n).is_phi())
                .collect();
            for phi in phis {
                if let Some(input) = self.func.input(phi, j + 1) {
                    self.combine_these_two(phi, input);
                }
            }
        }

        // Two-address instructions carry a virtual copy from their shared
        // input to their output.
        let nodes: Vec<Node> = self.func.blocks[b].nodes.clone();
        for n in nodes {
            if let Some(idx) = self.func.node(n).two_addr {
                if let Some(input) = self.func.input(n, idx as usize) {
                    self.combine_these_two(n, input);
                }
            }
        }
    }

    /// Manifest every virtual copy that did not coalesce as a real machine
    /// copy, cloning rematerializable constants instead of copying them.
    pub fn insert_copies(&mut self) -> CodegenResult<()> {
        // Compress the union-find now and retarget the liveout sets to the
        // compressed names.
        self.lrg_map.compress_uf_map_for_nodes(self.func.num_nodes());
        for lrg in 1..self.lrg_map.max_lrg_id() {
            let compressed = self.lrg_map.find(lrg);
            if lrg != compressed {
                for bi in 0..self.func.layout.len() {
                    let block = self.func.layout[bi];
                    let liveout = self.live.live_out_mut(block);
                    if liveout.remove(lrg as usize) {
                        liveout.insert(compressed as usize);
                    }
                }
            }
        }

        // Nodes below this index are original; anything at or above it is a
        // copy created during this parallel-renaming pass.
        let unique = self.func.num_nodes();

        for bi in 0..self.func.layout.len() {
            let b = self.func.layout[bi];
            let mut l = 0;
            while l < self.func.blocks[b].nodes.len() {
                let n = self.func.blocks[b].nodes[l];

                // Do not use removed copies; use the copied value instead.
                for k in 1..self.func.num_inputs(n) {
                    if let Some(copy) = self.func.input(n, k) {
                        if let Some(cidx) = self.func.node(copy).is_copy() {
                            if let Some(def) = self.func.input(copy, cidx) {
                                if self.lrg_map.find_node(copy) == self.lrg_map.find_node(def) {
                                    self.func.set_input(n, k, Some(def));
                                }
                            }
                        }
                    }
                }

                // Remove explicit copies that got coalesced away.
                if let Some(cidx) = self.func.node(n).is_copy() {
                    if let Some(def) = self.func.input(n, cidx) {
                        if self.lrg_map.find_node(n) == self.lrg_map.find_node(def) {
                            self.func.replace_uses(n, def);
                            self.func.set_input(n, cidx, None);
                            self.func.remove_node_at(b, l);
                            continue;
                        }
                    }
                }

                if self.func.node(n).is_phi() {
                    let phi_name = self.lrg_map.find_node(n);
                    if phi_name == 0 {
                        l += 1;
                        continue;
                    }
                    let preds: Vec<Block> = self.func.blocks[b].preds.iter().copied().collect();
                    for (j, &pred) in preds.iter().enumerate() {
                        let m = match self.func.input(n, j + 1) {
                            Some(m) => m,
                            None => continue,
                        };
                        let src_name = self.lrg_map.find_node(m);
                        if src_name == phi_name {
                            continue;
                        }
                        let copy = if self.func.node(m).is_con() && self.func.node(m).rematerialize
                        {
                            // Rematerialize immediate constants rather than
                            // copy them.
                            let copy = self.func.clone_node(m);
                            self.func.append_node(pred, copy);
                            let at = self.func.blocks[pred].nodes.len();
                            self.clone_projs(pred, at, m, copy);
                            copy
                        } else {
                            let copy = self.make_spill_copy(SpillKind::PhiInput, m)?;
                            self.insert_copy_with_overlap(pred, copy, phi_name, src_name, unique);
                            copy
                        };
                        self.func.set_input(n, j + 1, Some(copy));
                        self.func.map_node_to_block(copy, pred);
                        self.lrg_map.extend(copy, phi_name);
                    }
                } else if let Some(idx) = self.func.node(n).two_addr {
                    let name = self.lrg_map.find_node(n);
                    debug_assert!(name != 0, "no two-address specials");
                    let m = self.func.input(n, idx as usize);
                    if let Some(m) = m {
                        if self.lrg_map.find_node(m) != name {
                            let copy =
                                if self.func.node(m).is_con() && self.func.node(m).rematerialize {
                                    let copy = self.func.clone_node(m);
                                    self.func.insert_node(b, l, copy);
                                    l += 1;
                                    l += self.clone_projs(b, l, m, copy);
                                    copy
                                } else {
                                    let copy = self.make_spill_copy(SpillKind::TwoAddress, m)?;
                                    self.func.insert_node(b, l, copy);
                                    l += 1;
                                    copy
                                };
                            self.func.set_input(n, idx as usize, Some(copy));
                            self.lrg_map.extend(copy, name);
                            self.func.map_node_to_block(copy, b);
                        }
                    }
                    l = self.split_cold_debug_uses(b, l, n)?;
                } else {
                    l = self.split_cold_debug_uses(b, l, n)?;
                }

                l += 1;
            }
        }
        Ok(())
    }

    /// Build a spill copy of `src` constrained by the spill mask of its
    /// ideal register class. Fails for classes with no spill mask.
    fn make_spill_copy(&mut self, kind: SpillKind, src: Node) -> CodegenResult<Node> {
        let ireg = self.func.node(src).ideal;
        let ireg = match ireg {
            None | Some(RegClass::Flags) => {
                log::debug!("cannot spill {:?}", ireg);
                return Err(CodegenError::NotSpillable);
            }
            Some(c) => c,
        };
        let rm = *self.isa.spill_mask(ireg);
        if rm.is_empty() {
            return Err(CodegenError::NotSpillable);
        }
        let mut data = NodeData::new(NodeKind::SpillCopy(kind));
        data.ty = self.func.node(src).ty;
        data.ideal = Some(ireg);
        data.out_mask = rm;
        data.in_masks = vec![RegMask::empty(), rm];
        let copy = self.func.create_node(data);
        self.func.set_input(copy, 1, Some(src));
        Ok(copy)
    }

    /// Pre-split high-frequency live ranges at safepoint debug uses in cold
    /// blocks: if the value is not live out of this block, a private copy
    /// here gives the hot part of the live range a clean shot at a register.
    fn split_cold_debug_uses(&mut self, b: Block, l: usize, n: Node) -> CodegenResult<usize> {
        if self.func.blocks[b].freq >= DEBUG_SPLIT_FREQ {
            return Ok(l);
        }
        let debug_start = self.func.node(n).debug_start();
        if debug_start == usize::MAX {
            return Ok(l);
        }
        let mut l = l;
        for inpidx in debug_start..self.func.num_inputs(n) {
            let inp = match self.func.input(n, inpidx) {
                Some(inp) => inp,
                None => continue,
            };
            let nidx = self.lrg_map.live_range_id(inp);
            if nidx == 0 || self.lrgs[nidx as usize].max_freq < HIGH_FREQUENCY_LRG {
                continue;
            }
            // Live into some successor? Then the normal spill mechanism
            // does an excellent job; do not pre-split.
            let live_out = self.func.blocks[b]
                .succs
                .iter()
                .any(|&s| self.live.live_out(s).contains(nidx as usize));
            if live_out {
                continue;
            }
            let copy = self.make_spill_copy(SpillKind::DebugUse, inp)?;
            self.func.set_input(n, inpidx, Some(copy));
            self.func.insert_node(b, l, copy);
            l += 1;
            let max = self.lrg_map.max_lrg_id();
            self.new_lrg(copy, max);
            self.lrg_map.set_max_lrg_id(max + 1);
        }
        Ok(l)
    }

    /// Place `copy` (dst_name ← src_name) in `b` respecting parallel-copy
    /// order: after the last use of the destination name, before any kill of
    /// the source name that exits the block. Overlapping constraints mean a
    /// cycle; break it with a temporary.
    fn insert_copy_with_overlap(
        &mut self,
        b: Block,
        copy: Node,
        dst_name: u32,
        src_name: u32,
        unique: usize,
    ) {
        // Last use of dst_name among the copies already placed: scanning
        // backward, the first copy reading dst_name.
        let mut insert_pos = 0;
        let mut i = self.func.blocks[b].nodes.len();
        while i > 0 {
            let n = self.func.blocks[b].nodes[i - 1];
            // Original nodes end the parallel-renaming region.
            if n.index() < unique {
                insert_pos = i;
                break;
            }
            debug_assert!(
                self.func.node(n).is_copy().is_some()
                    || self.func.node(n).is_con()
                    || self.func.node(n).is_mach_proj(),
                "only copies during parallel renaming"
            );
            let reads_dst = match self.func.node(n).is_copy() {
                Some(idx) => match self.func.input(n, idx) {
                    Some(src) => self.lrg_map.find_node(src) == dst_name,
                    None => false,
                },
                None => false,
            };
            if reads_dst {
                insert_pos = i;
                break;
            }
            i -= 1;
        }

        // First kill of src_name that exits the block, scanning backward.
        let mut kill_src_pos = self.func.blocks[b].nodes.len();
        let mut i = self.func.blocks[b].nodes.len();
        while i > 0 {
            let n = self.func.blocks[b].nodes[i - 1];
            if n.index() < unique {
                break;
            }
            if self.lrg_map.find_node(n) == src_name {
                kill_src_pos = i - 1;
                break;
            }
            i -= 1;
        }

        // Cycle: the copy must go after a point where its source is already
        // clobbered. Save the source in a temp first.
        if insert_pos > kill_src_pos {
            let idx = self.func.node(copy).is_copy().expect("inserting a non-copy");
            let tmp_src = self.func.input(copy, idx);
            let tmp = self.func.clone_node(copy);
            self.func.node_mut(tmp).kind = NodeKind::SpillCopy(SpillKind::Temp);
            let max = self.lrg_map.max_lrg_id();
            self.new_lrg(tmp, max);
            self.lrg_map.set_max_lrg_id(max + 1);
            self.func.set_input(tmp, idx, tmp_src);
            self.func.set_input(copy, idx, Some(tmp));
            self.func.insert_node(b, kill_src_pos, tmp);
            insert_pos += 1;
        }

        self.func.insert_node(b, insert_pos, copy);
    }

    /// One round of conservative coalescing over every block.
    pub fn conservative_coalesce_driver(&mut self) {
        let mut ulr = IndexSet::with_capacity(self.lrg_map.max_lrg_id() as usize);
        for bi in 0..self.blks.len() {
            let block = self.blks[bi];
            self.conservative_coalesce_block(block, &mut ulr);
        }
    }

    fn conservative_coalesce_block(&mut self, b: Block, ulr: &mut IndexSet) {
        // Bail out on infrequent blocks.
        if self.func.blocks[b].freq < UNCOMMON_FREQ {
            return;
        }
        let mut i = 0;
        while i < self.func.blocks[b].nodes.len() {
            let copy1 = self.func.blocks[b].nodes[i];
            let idx1 = match self.func.node(copy1).is_copy() {
                Some(idx) => idx,
                None => {
                    i += 1;
                    continue;
                }
            };

            if self.copy_copy(copy1, copy1, b, i, ulr) {
                // Coalesced away; retry the same position.
                continue;
            }
            // Walk a short chain of copies, trying to take out several moves
            // at once.
            if let Some(copy2) = self.func.input(copy1, idx1) {
                if let Some(idx2) = self.func.node(copy2).is_copy() {
                    if self.copy_copy(copy1, copy2, b, i, ulr) {
                        continue;
                    }
                    if let Some(copy3) = self.func.input(copy2, idx2) {
                        if self.func.node(copy3).is_copy().is_some()
                            && self.copy_copy(copy1, copy3, b, i, ulr)
                        {
                            continue;
                        }
                    }
                }
            }
            i += 1;
        }
    }

    /// Union the neighbor sets of `lr1` and `lr2` into `ulr`, computing the
    /// effective degree of the combination under the combined mask `rm`.
    /// Stack-capable and already-low-degree neighbors cannot constrain the
    /// merged live range and contribute nothing.
    fn lrg_union(&mut self, lr1: u32, lr2: u32, rm: &RegMask, ulr: &mut IndexSet) -> u32 {
        ulr.clear();
        let mut reg_degree = 0u32;
        let num_regs = self.lrgs[lr1 as usize]
            .num_regs
            .max(self.lrgs[lr2 as usize].num_regs);
        let fat = self.lrgs[lr1 as usize].fat_proj || self.lrgs[lr2 as usize].fat_proj;
        for which in [lr1, lr2] {
            let neighbors: Vec<usize> = self.ifg.neighbors(which).iter().collect();
            for lidx in neighbors {
                let lrg = &self.lrgs[lidx];
                if !rm.overlaps(&lrg.mask) {
                    continue;
                }
                if !ulr.insert(lidx) {
                    continue;
                }
                if lrg.mask.is_all_stack() {
                    // Infinite stack supply; can always color elsewhere.
                    continue;
                }
                if lrg.lo_degree() {
                    // A trivially colorable neighbor cannot constrain us.
                    continue;
                }
                reg_degree += if fat || lrg.fat_proj {
                    u32::from(num_regs) * u32::from(lrg.num_regs)
                } else {
                    u32::from(num_regs.max(lrg.num_regs))
                };
            }
        }
        ulr.remove(lr1 as usize);
        ulr.remove(lr2 as usize);
        reg_degree
    }

    /// Record that these two live ranges would like to share a color even
    /// though coalescing them was not safe.
    fn record_bias(&mut self, lr1: u32, lr2: u32) {
        if self.lrgs[lr1 as usize].copy_bias == 0 {
            self.lrgs[lr1 as usize].copy_bias = lr2;
        }
        if self.lrgs[lr2 as usize].copy_bias == 0 {
            self.lrgs[lr2 as usize].copy_bias = lr1;
        }
    }

    /// Walk the instructions between `dst_copy` and `src_copy` (through
    /// straight-line predecessors only), collecting everything that will
    /// interfere with the stretched live range. Returns `None` on any of the
    /// bail-outs: a merge point, a redefinition of either live range, or a
    /// bound def that starves the combined mask.
    #[allow(clippy::too_many_arguments)]
    fn compute_separating_interferences(
        &mut self,
        dst_copy: Node,
        src_copy: Node,
        b: Block,
        bindex: usize,
        rm: &mut RegMask,
        mut rm_size: u32,
        mut reg_degree: u32,
        lr1: u32,
        lr2: u32,
        ulr: &mut IndexSet,
    ) -> Option<u32> {
        debug_assert!(!self.lrgs[lr1 as usize].fat_proj);
        debug_assert!(!self.lrgs[lr2 as usize].fat_proj);
        let mut prev_copy = self
            .func
            .input(dst_copy, self.func.node(dst_copy).is_copy()?)?;
        let mut b2 = b;
        let mut bindex2 = bindex;
        loop {
            // Chain backwards one instruction, hopping to the (single)
            // predecessor at block starts.
            loop {
                if bindex2 > 0 {
                    bindex2 -= 1;
                    break;
                }
                if self.func.blocks[b2].preds.len() != 1 {
                    // Cannot double-coalesce across control flow.
                    return None;
                }
                b2 = self.func.blocks[b2].preds[0];
                bindex2 = self.func.blocks[b2].nodes.len();
                if bindex2 == 0 {
                    continue;
                }
            }
            if bindex2 >= self.func.blocks[b2].nodes.len() {
                continue;
            }
            let x = self.func.blocks[b2].nodes[bindex2];
            if x == prev_copy {
                if prev_copy == src_copy {
                    // Found the end of the chain; all interferences seen.
                    break;
                }
                prev_copy = self
                    .func
                    .input(prev_copy, self.func.node(prev_copy).is_copy()?)?;
                continue;
            }
            let lidx = self.lrg_map.find_node(x);
            // A redefinition of either live range would need re-renaming.
            if lidx == lr1 || lidx == lr2 {
                return None;
            }
            if self.lrgs[lidx as usize].is_bound {
                // Do not let the combined live range expect a bound color.
                let bound_mask = self.lrgs[lidx as usize].mask;
                rm.subtract(&bound_mask);
                rm_size = rm.size();
                if reg_degree >= rm_size {
                    return None;
                }
            }
            if rm.overlaps(&self.lrgs[lidx as usize].mask) && ulr.insert(lidx as usize) {
                if self.lrgs[lidx as usize].mask.is_all_stack() {
                    continue;
                }
                if self.lrgs[lidx as usize].just_lo_degree() {
                    return None;
                }
                reg_degree += 1;
                if reg_degree >= rm_size {
                    return None;
                }
            }
        }
        Some(reg_degree)
    }

    /// Repair the interference graph after deciding to merge `lr2` into
    /// `lr1` with combined neighbor set `ulr`.
    fn update_ifg(&mut self, lr1: u32, lr2: u32, ulr: &IndexSet) {
        // Neighbors the constrained mask pushed out no longer see lr1.
        let n_lr1: Vec<usize> = self.ifg.neighbors(lr1).iter().collect();
        for neighbor in n_lr1 {
            if !ulr.contains(neighbor) && self.ifg.neighbors_mut(neighbor as u32).remove(lr1 as usize)
            {
                let delta = self.lrgs[lr1 as usize].compute_degree(&self.lrgs[neighbor]);
                self.lrgs[neighbor].inc_degree(-(delta as i32));
            }
        }
        // lr2 is gone from the graph.
        let n_lr2: Vec<usize> = self.ifg.neighbors(lr2).iter().collect();
        for neighbor in n_lr2 {
            if self.ifg.neighbors_mut(neighbor as u32).remove(lr2 as usize) {
                let delta = self.lrgs[lr2 as usize].compute_degree(&self.lrgs[neighbor]);
                self.lrgs[neighbor].inc_degree(-(delta as i32));
            }
        }
        // Everything in the union now interferes with lr1.
        for neighbor in ulr.iter() {
            if self.ifg.neighbors_mut(neighbor as u32).insert(lr1 as usize) {
                let delta = self.lrgs[lr1 as usize].compute_degree(&self.lrgs[neighbor]);
                self.lrgs[neighbor].inc_degree(delta as i32);
            }
        }
    }

    /// Merge the union-find entries and rewire the graph around a
    /// successful conservative coalesce.
    #[allow(clippy::too_many_arguments)]
    fn union_helper(
        &mut self,
        lr1_node: Node,
        lr2_node: Node,
        lr1: u32,
        lr2: u32,
        src_def: Node,
        dst_copy: Node,
        src_copy: Node,
        b: Block,
        bindex: usize,
    ) {
        self.union(lr1_node, lr2_node);

        // Single-def only if both sides were single-def; the surviving def
        // is the original source.
        let any_multidef =
            self.lrgs[lr1 as usize].is_multidef() || self.lrgs[lr2 as usize].is_multidef();
        self.lrgs[lr1 as usize].def = if any_multidef {
            DefState::Many
        } else {
            DefState::One(src_def)
        };
        self.lrgs[lr2 as usize].def = DefState::None;
        self.lrgs[lr2 as usize].mask = RegMask::empty();
        let oop2 = self.lrgs[lr2 as usize].is_oop;
        self.lrgs[lr1 as usize].is_oop |= oop2;
        self.lrgs[lr2 as usize].is_oop = false;
        let freq2 = self.lrgs[lr2 as usize].max_freq;
        if self.lrgs[lr1 as usize].max_freq < freq2 {
            self.lrgs[lr1 as usize].max_freq = freq2;
        }

        // Intermediate copies go dead; everyone reads the original value.
        let didx = self.func.node(dst_copy).is_copy().expect("coalescing a non-copy");
        let src_block = self.func.block_of(src_copy).expect("copy not placed");
        self.func.set_input(dst_copy, didx, Some(src_def));
        debug_assert_eq!(self.func.blocks[b].nodes[bindex], dst_copy);
        self.func.replace_uses(dst_copy, src_def);
        self.func.set_input(dst_copy, didx, None);
        self.func.remove_node_at(b, bindex);
        let data = &mut self.func.blocks[b];
        if (bindex as u32) < data.ihrp_index {
            data.ihrp_index -= 1;
        }
        if (bindex as u32) < data.fhrp_index {
            data.fhrp_index -= 1;
        }

        // The stretched live range is now live through the intermediate
        // blocks.
        let mut b = b;
        while b != src_block {
            b = self.func.blocks[b].preds[0];
            self.live.live_out_mut(b).insert(lr1 as usize);
        }
    }

    /// Try to coalesce a (possibly multi-step) chain of copies from
    /// `src_copy` to `dst_copy`. Returns true if the chain was merged.
    fn copy_copy(
        &mut self,
        dst_copy: Node,
        src_copy: Node,
        b: Block,
        bindex: usize,
        ulr: &mut IndexSet,
    ) -> bool {
        if !self.func.node(dst_copy).is_spill_copy() || !self.func.node(src_copy).is_spill_copy() {
            return false;
        }
        let sidx = match self.func.node(src_copy).is_copy() {
            Some(idx) => idx,
            None => return false,
        };
        let src_def = match self.func.input(src_copy, sidx) {
            Some(d) => d,
            None => return false,
        };
        let mut lr1 = self.lrg_map.find_node(dst_copy);
        let mut lr2 = self.lrg_map.find_node(src_def);

        if lr1 == lr2 || lr1 == 0 || lr2 == 0 {
            return false;
        }
        if self.ifg.test_edge_sq(lr1, lr2) {
            return false;
        }
        // An int value flowing into an oop-named destination would claim GC
        // provenance it does not have; oop->int is fine because the merged
        // live range keeps its oop-ness.
        if self.lrgs[lr1 as usize].is_oop && !self.lrgs[lr2 as usize].is_oop {
            return false;
        }
        // Alignment changes how degree is counted; never mix.
        if self.lrgs[lr1 as usize].fat_proj != self.lrgs[lr2 as usize].fat_proj {
            return false;
        }

        let mut lr1_node = dst_copy;
        let mut lr2_node = src_def;
        if lr1 > lr2 {
            core::mem::swap(&mut lr1, &mut lr2);
            lr1_node = src_def;
            lr2_node = dst_copy;
        }

        // Compatible register sets?
        let mut rm = self.lrgs[lr1 as usize].mask;
        rm.intersect(&self.lrgs[lr2 as usize].mask);
        let mut rm_size = rm.size();
        if rm.is_all_stack() {
            rm_size += ALL_STACK_SIZE;
        }
        if rm_size == 0 {
            return false;
        }

        let reg_degree = self.lrg_union(lr1, lr2, &rm, ulr);
        if reg_degree >= rm_size {
            self.record_bias(lr1, lr2);
            return false;
        }

        if dst_copy != src_copy
            && self
                .compute_separating_interferences(
                    dst_copy, src_copy, b, bindex, &mut rm, rm_size, reg_degree, lr1, lr2, ulr,
                )
                .is_none()
        {
            self.record_bias(lr1, lr2);
            return false;
        }

        // The combined live range is colorable. Merge.
        debug_assert_eq!(
            self.lrgs[lr1 as usize].num_regs,
            self.lrgs[lr2 as usize].num_regs
        );
        self.update_ifg(lr1, lr2, ulr);
        ulr.remove(lr1 as usize);

        // lr1's neighbor set becomes the union.
        let combined: Vec<usize> = ulr.iter().collect();
        let n_lr1 = self.ifg.neighbors_mut(lr1);
        n_lr1.clear();
        for x in combined {
            n_lr1.insert(x);
        }
        self.ifg.neighbors_mut(lr2).clear();

        let d = self.ifg.effective_degree(lr1, &self.lrgs);
        self.lrgs[lr1 as usize].set_degree(d);
        self.lrgs[lr2 as usize].set_degree(0);

        self.union_helper(lr1_node, lr2_node, lr1, lr2, src_def, dst_copy, src_copy, b, bindex);

        // Combine register restrictions.
        self.lrgs[lr1 as usize].mask = rm;
        let cost2 = self.lrgs[lr2 as usize].cost;
        let area2 = self.lrgs[lr2 as usize].area;
        self.lrgs[lr1 as usize].cost += cost2;
        self.lrgs[lr1 as usize].area += area2;
        // The merged live range had better simplify nicely.
        self.lrgs[lr1 as usize].was_lo = true;

        log::trace!("conservative coalesce: L{} absorbs L{}", lr1, lr2);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{Function, NodeData, NodeKind, SpillKind, ValueType};
    use crate::isa::test_utils::TestIsa;
    use crate::isa::{RegClass, TargetIsa};
    use crate::regalloc::Chaitin;
    use cranelift_entity::EntityRef;

    // x = ...; c = copy(x); use(c) -- the copy is conservatively
    // coalesceable.
    fn copy_function(isa: &TestIsa) -> Function {
        let mut func = Function::new();
        let b0 = func.create_block(1.0);

        let mut x_data = NodeData::new(NodeKind::Mach);
        x_data.ty = ValueType::Int;
        x_data.ideal = Some(RegClass::Int);
        x_data.out_mask = *isa.reg_mask(RegClass::Int);
        let x = func.create_node(x_data);
        func.append_node(b0, x);

        let mut c_data = NodeData::new(NodeKind::SpillCopy(SpillKind::Def));
        c_data.ty = ValueType::Int;
        c_data.ideal = Some(RegClass::Int);
        c_data.out_mask = *isa.spill_mask(RegClass::Int);
        let c = func.create_node(c_data);
        func.set_input(c, 1, Some(x));
        func.node_mut(c).set_in_mask(1, *isa.spill_mask(RegClass::Int));
        func.append_node(b0, c);

        let use_c = func.create_node(NodeData::new(NodeKind::Mach));
        func.set_input(use_c, 1, Some(c));
        func.node_mut(use_c).set_in_mask(1, *isa.reg_mask(RegClass::Int));
        func.append_node(b0, use_c);

        func
    }

    fn partition(c: &Chaitin) -> Vec<u32> {
        (0..c.func.num_nodes())
            .map(|i| c.lrg_map.find_const_node(crate::ir::Node::new(i)))
            .collect()
    }

    #[test]
    fn conservative_coalesce_is_idempotent() {
        let isa = TestIsa::new();
        let mut func = copy_function(&isa);
        let mut c = Chaitin::new(&mut func, &isa);
        c.de_ssa();
        let max = c.lrg_map.max_lrg_id();
        c.ifg.init(max);
        c.gather_lrg_masks(true);
        c.compute_live(false);
        c.build_ifg_physical();
        c.ifg.square_up();
        c.compute_effective_degrees();

        c.conservative_coalesce_driver();
        let first = partition(&c);
        // The copy really did merge into its source.
        assert_eq!(first[0], first[1]);

        // A second round with no intervening mutations changes nothing.
        c.conservative_coalesce_driver();
        let second = partition(&c);
        assert_eq!(first, second);
    }
}
