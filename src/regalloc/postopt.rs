//! Post-allocation peephole copy removal.
//!
//! One forward pass over the blocks, maintaining for every physical register
//! the *abstract value* it holds (`value[]`: the producer reached by chasing
//! copies) and the node that most recently put it there (`regnd[]`). A copy
//! that does not change the value already sitting in its register is elided
//! and yanked once dead. Equivalent machine constants merge the same way.
//! Block entry state merges predecessor maps register-by-register, nulling
//! conflicts; a block with an unvisited (loop-back) predecessor starts from
//! nothing, which is what keeps irreducible loops honest.
//!
//! A companion pass, [`Chaitin::merge_multidefs`], fuses repeated same-
//! register definitions of one multidef live range behind a merge node so a
//! single location represents the live range uniformly within a block.

use cranelift_entity::EntityRef;

use crate::ir::{Block, Node, NodeData, NodeKind};
use crate::isa::{RegMask, RegUnit};
use crate::regalloc::Chaitin;

type RegMap = Vec<Option<Node>>;

/// Do `n_regs` adjacent registers ending at `reg` all hold `val`?
fn register_contains_value(val: Option<Node>, reg: RegUnit, n_regs: u32, value: &RegMap) -> bool {
    if val.is_none() {
        return false;
    }
    (0..n_regs).all(|i| value[(reg - i) as usize] == val)
}

/// Tracks the reaching def (and its first use) per register for the
/// multidef merge pass.
#[derive(Clone, Default)]
struct RegDefUse {
    def: Option<Node>,
    first_use: Option<Node>,
}

impl RegDefUse {
    fn update(&mut self, def: Node, use_node: Node) {
        if self.def != Some(def) {
            self.def = Some(def);
            self.first_use = Some(use_node);
        }
    }

    fn clear(&mut self) {
        self.def = None;
        self.first_use = None;
    }
}

impl Chaitin<'_> {
    /// The register assigned to `n`'s live range, if any.
    fn reg_of(&self, n: Node) -> Option<RegUnit> {
        let lidx = self.lrg_map.live_range_id(n);
        if lidx == 0 {
            None
        } else {
            self.lrgs[lidx as usize].reg
        }
    }

    /// Physical slot count of live range `lidx` at its chosen location;
    /// scalable vectors differ between register and stack residence.
    fn phys_slots(&self, lidx: u32) -> u32 {
        let lrg = &self.lrgs[lidx as usize];
        match lrg.reg {
            Some(reg) if lrg.is_scalable && self.isa.is_stack(reg) => lrg.scalable_slots,
            _ => u32::from(lrg.num_regs.max(1)),
        }
    }

    /// Skip through any number of copies that don't change oop-ness.
    pub fn skip_copies(&self, mut c: Node) -> Node {
        let is_oop = {
            let l = self.lrg_map.live_range_id(c);
            l != 0 && self.lrgs[l as usize].is_oop
        };
        while let Some(idx) = self.func.node(c).is_copy() {
            let src = match self.func.input(c, idx) {
                Some(src) => src,
                None => break,
            };
            let src_oop = {
                let l = self.lrg_map.live_range_id(src);
                l != 0 && self.lrgs[l as usize].is_oop
            };
            if src_oop != is_oop {
                // Casting copy; not the same value.
                break;
            }
            c = src;
        }
        c
    }

    /// Could `def` carry a callee-save value? Conservative: when the chain
    /// is too deep to tell, answer yes.
    fn may_be_copy_of_callee(&self, mut def: Node) -> bool {
        if self.isa.number_of_saved_registers() == 0 {
            return false;
        }
        // Expect only a spill-down and reload on exit for callee-save
        // spills, but splitting can make the chains long.
        const LIMIT: usize = 60;
        for _ in 0..LIMIT {
            let data = self.func.node(def);
            if data.is_proj()
                && matches!(data.input(0), Some(p) if self.func.node(p).kind == NodeKind::Start)
            {
                if let Some(reg) = self.reg_of(def) {
                    if self.isa.is_save_on_entry(reg) {
                        return true;
                    }
                }
            }
            if let Some(idx) = data.is_copy() {
                def = match self.func.input(def, idx) {
                    Some(d) => d,
                    None => return false,
                };
            } else if data.is_phi() {
                def = match self.func.input(def, 1) {
                    Some(d) => d,
                    None => return false,
                };
            } else {
                return false;
            }
        }
        true
    }

    /// Remove `old` from its block and forget any map entry pointing at it.
    /// Returns 1 if an instruction left the current block.
    fn yank(
        &mut self,
        old: Node,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
    ) -> usize {
        let mut blk_adjust = 0;
        if self.func.block_of(old) == Some(current_block) {
            blk_adjust += 1;
        }
        self.func.find_remove(old);
        if let Some(old_reg) = self.reg_of(old) {
            let r = old_reg as usize;
            if r < regnd.len() && regnd[r] == Some(old) {
                value[r] = None;
                regnd[r] = None;
            }
        }
        blk_adjust
    }

    #[cfg(debug_assertions)]
    fn expected_yanked_node(&self, old: Node, orig_old: Node) -> bool {
        let data = self.func.node(old);
        if data.is_spill_copy() || data.is_con() || data.is_phi() {
            return true;
        }
        if data.is_mach_proj() || data.is_copy().is_some() {
            return old == orig_old;
        }
        data.kind == NodeKind::Merge
    }

    /// `old` lost an edge; if it is now dead, yank it and anything it was
    /// keeping alive.
    fn yank_if_dead(
        &mut self,
        old: Node,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
    ) -> usize {
        self.yank_if_dead_recurse(old, old, current_block, value, regnd)
    }

    fn yank_if_dead_recurse(
        &mut self,
        old: Node,
        orig_old: Node,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
    ) -> usize {
        let mut blk_adjust = 0;
        if self.func.out_count(old) == 0 {
            #[cfg(debug_assertions)]
            debug_assert!(
                self.expected_yanked_node(old, orig_old),
                "unexpected yanked node"
            );
            let _ = orig_old;
            blk_adjust += self.yank(old, current_block, value, regnd);

            for i in 1..self.func.num_inputs(old) {
                if let Some(n) = self.func.input(old, i) {
                    self.func.set_input(old, i, None);
                    blk_adjust += self.yank_if_dead_recurse(n, orig_old, current_block, value, regnd);
                }
            }
            self.func.disconnect_inputs(old);
        }
        blk_adjust
    }

    /// Use `def` for input `idx` of `n` instead of the current (copy) value,
    /// in the hope the copy goes dead.
    fn use_prior_register(
        &mut self,
        n: Node,
        idx: usize,
        def: Node,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
    ) -> usize {
        // No effect?
        if self.func.input(n, idx) == Some(def) {
            return 0;
        }
        // Do not resurrect dead defs.
        if self.func.out_count(def) == 0 {
            return 0;
        }

        // Not every pair of locations is assignment compatible.
        let def_lidx = self.lrg_map.live_range_id(def);
        let def_lrg = &self.lrgs[def_lidx as usize];
        let def_reg = match def_lrg.reg {
            Some(r) => r,
            None => return 0,
        };
        let use_mask = self.func.node(n).in_mask(idx);
        let mut can_use = if RegMask::can_represent(def_reg) {
            use_mask.contains(def_reg)
        } else {
            use_mask.is_all_stack()
        };
        if !matches!(self.func.node(def).ideal, Some(c) if c.is_vector()) {
            // A copy to or from a misaligned pair cannot be bypassed.
            can_use = can_use
                && !use_mask.is_misaligned_pair()
                && !def_lrg.mask.is_misaligned_pair();
        }
        if !can_use {
            return 0;
        }

        // Capture the old def in case it goes dead.
        let old = match self.func.input(n, idx) {
            Some(old) => old,
            None => return 0,
        };

        // Save-on-call copies can only be elided if the whole chain dies,
        // lest the same callee-save value end up live in two places at once.
        // Only the trivial two-copy chain is recognized here.
        if self.may_be_copy_of_callee(def) {
            if self.func.out_count(old) > 1 {
                return 0;
            }
            let idx2 = match self.func.node(old).is_copy() {
                Some(i) => i,
                None => return 0,
            };
            let old2 = match self.func.input(old, idx2) {
                Some(o) => o,
                None => return 0,
            };
            if self.func.out_count(old2) > 1 {
                return 0;
            }
            let idx3 = match self.func.node(old2).is_copy() {
                Some(i) => i,
                None => return 0,
            };
            if self.func.input(old2, idx3) != Some(def) {
                return 0;
            }
        }

        self.func.set_input(n, idx, Some(def));
        self.yank_if_dead(old, current_block, value, regnd)
    }

    /// Bypass copies feeding input `k` of `n`. When `can_change_regs` is
    /// false (two-address inputs, φ edges) only same-register copies may be
    /// skipped.
    fn elide_copy(
        &mut self,
        n: Node,
        k: usize,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
        can_change_regs: bool,
    ) -> usize {
        let mut blk_adjust = 0;

        let nk = match self.func.input(n, k) {
            Some(nk) => nk,
            None => return 0,
        };
        let nk_reg = match self.reg_of(nk) {
            Some(r) => r,
            None => return 0,
        };

        // Remove obvious same-register copies.
        let mut x = nk;
        while let Some(idx) = self.func.node(x).is_copy() {
            let copy = match self.func.input(x, idx) {
                Some(c) => c,
                None => break,
            };
            if self.reg_of(copy) != Some(nk_reg) {
                break;
            }
            blk_adjust += self.use_prior_register(n, k, copy, current_block, value, regnd);
            if self.func.input(n, k) != Some(copy) {
                break;
            }
            x = copy;
        }

        // φs and two-address inputs cannot change registers so easily:
        // their location must match the output.
        if !can_change_regs {
            return blk_adjust;
        }

        // Chase all the way to the value, jumping over copies whose
        // intermediate register differs; the value may survive in some
        // register the whole way even if it also took a trip to the stack.
        let val = self.skip_copies(self.func.input(n, k).unwrap_or(nk));
        if val == x {
            return blk_adjust;
        }
        let val_idx = self.lrg_map.live_range_id(val);
        if val_idx == 0 {
            return blk_adjust;
        }
        let val_reg = match self.lrgs[val_idx as usize].reg {
            Some(r) => r,
            None => return blk_adjust,
        };
        let mut n_regs = self.phys_slots(val_idx);

        // Already sitting in the right register?
        if (val_reg as usize) < value.len()
            && register_contains_value(Some(val), val_reg, n_regs, value)
        {
            if let Some(prior) = regnd[val_reg as usize] {
                blk_adjust += self.use_prior_register(n, k, prior, current_block, value, regnd);
                if self.func.input(n, k) == regnd[val_reg as usize] {
                    return blk_adjust;
                }
            }
        }

        // Scan every register for the value (also catches duplicate
        // constants). Don't trade a register use for a stack use unless a
        // copy-load dies in the bargain.
        let t = if self.func.node(val).is_con() {
            self.func.node(val).con.map(|c| (c, self.func.node(val).ty))
        } else {
            None
        };

        for reg in 0..value.len() as u32 {
            if reg == nk_reg {
                // Found ourselves; keep searching only if this copy has a
                // single distinct user.
                let x_now = match self.func.input(n, k) {
                    Some(x) => x,
                    None => return blk_adjust,
                };
                let users = self.func.users(x_now);
                let ignore_self = users.windows(2).all(|w| w[0] == w[1]);
                if ignore_self {
                    continue;
                }
            }

            let vv = value[reg as usize];
            if self.lrgs[val_idx as usize].is_scalable {
                n_regs = if self.isa.is_stack(reg) {
                    self.lrgs[val_idx as usize].scalable_slots
                } else {
                    u32::from(self.lrgs[val_idx as usize].num_regs)
                };
            }
            if n_regs > 1 {
                // Doubles and vectors check for an aligned-adjacent set.
                let last = n_regs - 1;
                if (reg & last) != last {
                    continue;
                }
                if !register_contains_value(vv, reg, n_regs, value) {
                    continue;
                }
            }
            let hit = vv == Some(val)
                || match (t, vv) {
                    (Some((con, ty)), Some(vv)) => {
                        self.func.node(vv).is_con()
                            && self.func.node(vv).ty == ty
                            && self.func.node(vv).con.map(|c| c.rule) == Some(con.rule)
                            && self.func.node(vv).con.map(|c| c.bits) == Some(con.bits)
                    }
                    _ => false,
                };
            if hit {
                debug_assert!(!self.func.node(n).is_phi(), "cannot change registers at a φ");
                let prior = match regnd[reg as usize] {
                    Some(p) => p,
                    None => continue,
                };
                if self.isa.is_stack(nk_reg)
                    || !self.isa.is_stack(reg)
                    || self.func.out_count(prior) == 1
                {
                    blk_adjust += self.use_prior_register(n, k, prior, current_block, value, regnd);
                    if self.func.input(n, k) == regnd[reg as usize] {
                        return blk_adjust;
                    }
                }
            }
        }
        blk_adjust
    }

    /// Two machine constants with the same rule, bits and type put the same
    /// value in a register; if `nreg` already holds such a constant, `n` is
    /// redundant.
    fn eliminate_copy_of_constant(
        &mut self,
        val: Node,
        n: Node,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
        nreg: RegUnit,
        nreg2: Option<RegUnit>,
    ) -> bool {
        let existing = value[nreg as usize];
        let same = match existing {
            Some(e) if e != val => {
                self.func.node(val).is_con()
                    && self.func.node(e).is_con()
                    && nreg2.map_or(true, |r2| value[nreg as usize] == value[r2 as usize])
                    && self.func.node(e).ty == self.func.node(val).ty
                    && self.func.node(e).con.map(|c| c.rule)
                        == self.func.node(val).con.map(|c| c.rule)
                    && self.func.node(e).con.map(|c| c.bits)
                        == self.func.node(val).con.map(|c| c.bits)
            }
            _ => false,
        };
        if !same {
            return false;
        }
        // Strip n's kill projections now so the yank below can take it.
        for proj in self.func.kill_projections(n) {
            if self.func.out_count(proj) == 0 {
                self.func.set_input(proj, 0, None);
                self.yank_if_dead(proj, current_block, value, regnd);
            }
        }
        true
    }

    /// Replace `old` with the node currently reaching its register and yank
    /// it if that killed it.
    fn replace_and_yank_if_dead(
        &mut self,
        old: Node,
        nreg: RegUnit,
        current_block: Block,
        value: &mut RegMap,
        regnd: &mut RegMap,
    ) -> usize {
        let v = regnd[nreg as usize].expect("no reaching def to replace with");
        debug_assert!(self.func.out_count(v) != 0, "no dead values");
        self.func.replace_uses(old, v);
        self.yank_if_dead(old, current_block, value, regnd)
    }

    /// The peephole pass itself.
    pub fn post_allocate_copy_removal(&mut self) {
        let max_reg = self.max_reg as usize;
        let nblocks = self.func.blocks.len();
        let mut blk2maps: Vec<Option<(RegMap, RegMap)>> = vec![None; nblocks];
        let mut free_list: Vec<(RegMap, RegMap)> = Vec::new();

        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut phi_dex = self.func.first_non_phi(block);

            // Merge predecessor maps and elide copies along φ edges. A
            // predecessor whose successors have now all been visited will
            // never be read again; its maps can be recycled once this
            // block's entry state is built.
            let mut missing_some_inputs = false;
            let mut freeable: Vec<Block> = Vec::new();
            let preds: Vec<Block> = self.func.blocks[block].preds.iter().copied().collect();
            for (j, &pb) in preds.iter().enumerate() {
                if blk2maps[pb.index()].is_some() {
                    // Remove copies along φ input edges.
                    let (mut pvalue, mut pregnd) = blk2maps[pb.index()].take().unwrap();
                    for k in 0..phi_dex {
                        let phi = self.func.blocks[block].nodes[k];
                        self.elide_copy(phi, j + 1, block, &mut pvalue, &mut pregnd, false);
                    }
                    blk2maps[pb.index()] = Some((pvalue, pregnd));

                    let all_served = self.func.blocks[pb]
                        .succs
                        .iter()
                        .all(|&s| blk2maps[s.index()].is_some() || s == block);
                    if all_served && !freeable.contains(&pb) {
                        freeable.push(pb);
                    }
                } else {
                    // Unvisited (loop-back) predecessor.
                    missing_some_inputs = true;
                }
            }

            // Inherit a finished predecessor's maps when possible; the
            // merge below then skips that predecessor.
            let inherited = if missing_some_inputs {
                None
            } else {
                freeable.last().copied()
            };
            let (mut value, mut regnd) = match inherited {
                Some(pb) => blk2maps[pb.index()].take().unwrap(),
                None => free_list
                    .pop()
                    .unwrap_or_else(|| (vec![None; max_reg], vec![None; max_reg])),
            };
            value.resize(max_reg, None);
            regnd.resize(max_reg, None);

            if missing_some_inputs {
                // Some predecessor has not been visited; assume nothing.
                value.fill(None);
                regnd.fill(None);
            } else {
                if inherited.is_none() {
                    // Didn't inherit; clone the first predecessor's maps.
                    match preds.first().and_then(|&p0| blk2maps[p0.index()].as_ref()) {
                        Some((pvalue, pregnd)) => {
                            value.clone_from(pvalue);
                            regnd.clone_from(pregnd);
                        }
                        None => {
                            value.fill(None);
                            regnd.fill(None);
                        }
                    }
                }
                // Merge the remaining inputs, nulling conflicts.
                for &pb in &preds {
                    if Some(pb) == inherited {
                        continue;
                    }
                    if let Some((_, pregnd)) = &blk2maps[pb.index()] {
                        for k in 0..max_reg {
                            if regnd[k] != pregnd[k] {
                                value[k] = None;
                                regnd[k] = None;
                            }
                        }
                    }
                }
            }

            // Now that the entry state is built, recycle what nobody will
            // read again.
            for pb in freeable {
                if Some(pb) != inherited {
                    if let Some(maps) = blk2maps[pb.index()].take() {
                        free_list.push(maps);
                    }
                }
            }

            // Process the φs: junk φs vanish, real ones define their
            // register.
            let mut j = 0;
            while j < phi_dex {
                let phi = self.func.blocks[block].nodes[j];
                // A φ whose inputs all agree merges nothing.
                let mut unique: Option<Node> = None;
                let mut junk = true;
                for k in 1..self.func.num_inputs(phi) {
                    if let Some(x) = self.func.input(phi, k) {
                        if x != phi && unique != Some(x) {
                            if unique.is_some() {
                                junk = false;
                                break;
                            }
                            unique = Some(x);
                        }
                    }
                }
                if junk {
                    if let Some(u) = unique {
                        self.func.replace_uses(phi, u);
                        let adj = self.yank_if_dead(phi, block, &mut value, &mut regnd);
                        j = j.saturating_sub(adj.saturating_sub(1));
                        phi_dex -= 1;
                        continue;
                    }
                }
                let pidx = self.lrg_map.live_range_id(phi);
                if pidx != 0 {
                    if let Some(preg) = self.lrgs[pidx as usize].reg {
                        // Define the φ's register; if something was already
                        // known here the φ is locally redundant, but keeping
                        // the φ is what downstream phases expect.
                        value[preg as usize] = Some(phi);
                        regnd[preg as usize] = Some(phi);
                        let n_regs = self.phys_slots(pidx);
                        for l in 1..n_regs {
                            let lo = (preg - l) as usize;
                            value[lo] = Some(phi);
                            regnd[lo] = Some(phi);
                        }
                    }
                }
                j += 1;
            }

            // The remaining instructions.
            let mut j = phi_dex;
            while j < self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];

                // Dead already? Nodes outside register allocation (stores,
                // branches, returns) have no modeled users and are never
                // dead.
                if self.func.out_count(n) == 0
                    && !self.func.node(n).is_proj()
                    && self.lrg_map.live_range_id(n) != 0
                {
                    let adj = self.yank_if_dead(n, block, &mut value, &mut regnd);
                    j = (j + 1).saturating_sub(adj);
                    continue;
                }

                // A live use asserts its def reaches here; improve the
                // reaching-def info the merge logic gave up on (loop
                // back-edges).
                for k in 1..self.func.num_inputs(n) {
                    let mut def = match self.func.input(n, k) {
                        Some(d) => d,
                        None => continue,
                    };
                    let useidx = self.lrg_map.live_range_id(def);
                    if useidx == 0 {
                        continue;
                    }
                    let ureg = match self.lrgs[useidx as usize].reg {
                        Some(r) => r,
                        None => continue,
                    };
                    if (ureg as usize) >= value.len() || value[ureg as usize].is_some() {
                        continue;
                    }
                    // Skip the occasional useless copy.
                    while let Some(idx) = self.func.node(def).is_copy() {
                        match self.func.input(def, idx) {
                            Some(src) if self.reg_of(src) == Some(ureg) => def = src,
                            _ => break,
                        }
                    }
                    let valdef = self.skip_copies(def);
                    value[ureg as usize] = Some(valdef);
                    regnd[ureg as usize] = Some(def);
                    // Record the other half of pairs and vector lanes.
                    let def_lidx = self.lrg_map.live_range_id(def);
                    let n_regs = self.phys_slots(def_lidx);
                    for l in 1..n_regs {
                        let lo = ureg - l;
                        if value[lo as usize].is_none()
                            && (!RegMask::can_represent(lo)
                                || self.lrgs[useidx as usize].mask.contains(lo))
                        {
                            value[lo as usize] = Some(valdef);
                            regnd[lo as usize] = Some(def);
                        }
                    }
                }

                let two_adr = self.func.node(n).two_addr.unwrap_or(0) as usize;

                // Remove copies along the input edges.
                let mut adj = 0;
                for k in 1..self.func.num_inputs(n) {
                    adj += self.elide_copy(n, k, block, &mut value, &mut regnd, k != two_adr);
                }
                j = j.saturating_sub(adj);

                // Unallocated nodes define no registers.
                let lidx = self.lrg_map.live_range_id(n);
                if lidx == 0 {
                    j += 1;
                    continue;
                }
                let nreg = match self.lrgs[lidx as usize].reg {
                    Some(r) => r,
                    None => {
                        j += 1;
                        continue;
                    }
                };

                // Skip through copies to the value being defined.
                let val = self.skip_copies(n);

                // Clear a dead definition out of the way first; kill
                // projections with no users count as dead too.
                if let Some(prior) = regnd[nreg as usize] {
                    if self.func.out_count(prior) == 0 {
                        regnd[nreg as usize] = None;
                        value[nreg as usize] = None;
                    }
                }

                let n_regs = self.phys_slots(lidx);
                let is_vector = matches!(self.func.node(n).ideal, Some(c) if c.is_vector());
                let mut adj = 0;
                if n_regs == 1 {
                    if value[nreg as usize] != Some(val) {
                        if self.eliminate_copy_of_constant(
                            val, n, block, &mut value, &mut regnd, nreg, None,
                        ) {
                            adj += self.replace_and_yank_if_dead(
                                n, nreg, block, &mut value, &mut regnd,
                            );
                        } else {
                            regnd[nreg as usize] = Some(n);
                            value[nreg as usize] = Some(val);
                        }
                    } else if !self.may_be_copy_of_callee(n) {
                        // 'n' rewrites its register with the value already
                        // there: a useless copy.
                        debug_assert!(self.func.node(n).is_copy().is_some());
                        adj +=
                            self.replace_and_yank_if_dead(n, nreg, block, &mut value, &mut regnd);
                    }
                } else if is_vector {
                    if !register_contains_value(Some(val), nreg, n_regs, &value) {
                        regnd[nreg as usize] = Some(n);
                        value[nreg as usize] = Some(val);
                        for l in 1..n_regs {
                            regnd[(nreg - l) as usize] = Some(n);
                            value[(nreg - l) as usize] = Some(val);
                        }
                    } else if self.func.node(n).is_copy().is_some() {
                        // Vectors can't be constants or callee-save copies.
                        adj +=
                            self.replace_and_yank_if_dead(n, nreg, block, &mut value, &mut regnd);
                    }
                } else {
                    // Pairs record the same info in both halves. The low
                    // half is nearly always adjacent, but a register pair
                    // that straddles a mask boundary records its actual
                    // second register.
                    let mut nreg_lo = nreg.wrapping_sub(1);
                    if RegMask::can_represent(nreg_lo)
                        && !self.lrgs[lidx as usize].mask.contains(nreg_lo)
                    {
                        let mut tmp = self.lrgs[lidx as usize].mask;
                        tmp.remove(nreg);
                        if let Some(lo) = tmp.find_first_elem() {
                            nreg_lo = lo;
                        }
                    }
                    if value[nreg as usize] != Some(val) || value[nreg_lo as usize] != Some(val) {
                        if self.eliminate_copy_of_constant(
                            val,
                            n,
                            block,
                            &mut value,
                            &mut regnd,
                            nreg,
                            Some(nreg_lo),
                        ) {
                            adj += self.replace_and_yank_if_dead(
                                n, nreg, block, &mut value, &mut regnd,
                            );
                        } else {
                            regnd[nreg as usize] = Some(n);
                            value[nreg as usize] = Some(val);
                            regnd[nreg_lo as usize] = Some(n);
                            value[nreg_lo as usize] = Some(val);
                        }
                    } else if !self.may_be_copy_of_callee(n) {
                        debug_assert!(self.func.node(n).is_copy().is_some());
                        adj +=
                            self.replace_and_yank_if_dead(n, nreg, block, &mut value, &mut regnd);
                    }
                }
                j = (j + 1).saturating_sub(adj);
            }

            blk2maps[block.index()] = Some((value, regnd));
        }
    }

    /// Merge repeated same-register definitions of multidef live ranges so
    /// each register holds one representative node per block.
    pub fn merge_multidefs(&mut self) {
        let max_reg = self.max_reg as usize;
        let mut reg2defuse: Vec<RegDefUse> = vec![RegDefUse::default(); max_reg];
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut j = 0;
            while j < self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                j += 1;
                if self.func.node(n).is_phi() {
                    continue;
                }
                for k in 1..self.func.num_inputs(n) {
                    j += self.possibly_merge_multidef(n, k, block, &mut reg2defuse);
                }
                // Only defs implicitly carried by uses matter; once the
                // instruction itself redefines the register, any multidef
                // tracking for it is stale.
                let lrg = self.lrg_map.live_range_id(n);
                if lrg > 0 && self.lrgs[lrg as usize].is_multidef() {
                    if let Some(reg) = self.lrgs[lrg as usize].reg {
                        if (reg as usize) < max_reg {
                            reg2defuse[reg as usize].clear();
                        }
                    }
                }
            }
            for entry in reg2defuse.iter_mut() {
                entry.clear();
            }
        }
    }

    fn possibly_merge_multidef(
        &mut self,
        n: Node,
        k: usize,
        block: Block,
        reg2defuse: &mut [RegDefUse],
    ) -> usize {
        let mut blk_adjust = 0;

        let input = match self.func.input(n, k) {
            Some(i) => i,
            None => return 0,
        };
        let lrg = self.lrg_map.live_range_id(input);
        if lrg == 0 || !self.lrgs[lrg as usize].is_multidef() {
            return 0;
        }
        let reg = match self.lrgs[lrg as usize].reg {
            Some(r) => r as usize,
            None => return 0,
        };
        if reg >= reg2defuse.len() {
            return 0;
        }

        if let Some(def) = reg2defuse[reg].def {
            if self.lrg_map.live_range_id(def) == lrg && def != input {
                // Same live range but a different node; merge.
                let merge = if self.func.node(def).kind == NodeKind::Merge {
                    def
                } else {
                    let mut data = NodeData::new(NodeKind::Merge);
                    data.ty = self.func.node(def).ty;
                    data.ideal = self.func.node(def).ideal;
                    data.out_mask = self.func.node(def).out_mask;
                    data.inputs.push(None.into());
                    let merge = self.func.create_node(data);
                    self.func.set_input(merge, 1, Some(def));

                    // Insert before the first use and retarget every use
                    // seen between it and here.
                    let first_use = reg2defuse[reg].first_use.expect("def with no use");
                    let mut use_index = self
                        .func
                        .find_node(block, first_use)
                        .expect("first use left the block");
                    self.func.insert_node(block, use_index, merge);
                    use_index += 1;
                    self.lrg_map.extend(merge, lrg);
                    blk_adjust += 1;

                    while use_index < self.func.blocks[block].nodes.len() {
                        let user = self.func.blocks[block].nodes[use_index];
                        if user == n {
                            break;
                        }
                        for i in 1..self.func.num_inputs(user) {
                            if self.func.input(user, i) == Some(def) {
                                self.func.set_input(user, i, Some(merge));
                            }
                        }
                        use_index += 1;
                    }
                    merge
                };
                let already = (1..self.func.num_inputs(merge))
                    .any(|i| self.func.input(merge, i) == Some(input));
                if !already {
                    self.func.add_input(merge, input);
                }
                self.func.set_input(n, k, Some(merge));
            }
        }

        // Track this def and its first use.
        let input_now = self.func.input(n, k).expect("input vanished");
        reg2defuse[reg].update(input_now, n);
        blk_adjust
    }
}
