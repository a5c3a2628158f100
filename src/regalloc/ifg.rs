//! The interference graph, and the passes that build it.
//!
//! An undirected graph on live-range ids. Created with a fixed number of
//! vertices; edges can be added and tested, vertices can be yanked and later
//! re-inserted with all edges intact. Construction fills a *triangular*
//! adjacency list (each edge stored only at its higher-numbered endpoint),
//! which is then squared up to a symmetric one because `union` and
//! per-neighbor iteration need the full adjacency. Mode misuse trips debug
//! assertions.
//!
//! Two builders share the reverse-walk skeleton: the *virtual* build adds an
//! edge for any simultaneous liveness (used before aggressive coalescing),
//! while the *physical* build adds an edge only when the register masks
//! overlap, and additionally computes per-block register pressure.

use cranelift_entity::EntityRef;

use crate::indexset::IndexSet;
use crate::ir::{Block, Node};
use crate::isa::RegClass;
use crate::regalloc::liverange::LiveRange;
use crate::regalloc::pressure::Pressure;
use crate::regalloc::Chaitin;

/// The interference graph.
pub struct InterferenceGraph {
    /// Adjacency lists indexed by live-range id.
    adjs: Vec<IndexSet>,
    /// Yanked vertices.
    yanked: IndexSet,
    /// Are we square yet?
    is_square: bool,
    /// Number of vertices.
    maxlrg: u32,
}

impl InterferenceGraph {
    /// An empty graph; call [`InterferenceGraph::init`] before use.
    pub fn new() -> Self {
        Self {
            adjs: Vec::new(),
            yanked: IndexSet::new(),
            is_square: false,
            maxlrg: 0,
        }
    }

    /// Reset to `maxlrg` unconnected vertices in triangular mode.
    pub fn init(&mut self, maxlrg: u32) {
        self.maxlrg = maxlrg;
        for adj in &mut self.adjs {
            adj.clear();
        }
        self.adjs.resize_with(maxlrg as usize, IndexSet::new);
        self.yanked.clear();
        self.is_square = false;
    }

    /// Number of vertices.
    pub fn max_lrg(&self) -> u32 {
        self.maxlrg
    }

    /// Is `a` currently yanked out of the graph?
    pub fn is_yanked(&self, a: u32) -> bool {
        self.yanked.contains(a as usize)
    }

    /// Add an edge between `a` and `b`. Triangular mode only. Returns true
    /// if the edge is new.
    pub fn add_edge(&mut self, a: u32, b: u32) -> bool {
        debug_assert!(!self.is_square, "only on triangular");
        // The smaller endpoint is stored in the larger one's list.
        let (hi, lo) = if a < b { (b, a) } else { (a, b) };
        self.adjs[hi as usize].insert(lo as usize)
    }

    /// Is there an edge between `a` and `b`? Triangular mode only.
    pub fn test_edge(&self, a: u32, b: u32) -> bool {
        debug_assert!(!self.is_square, "only on triangular");
        let (hi, lo) = if a < b { (b, a) } else { (a, b) };
        self.adjs[hi as usize].contains(lo as usize)
    }

    /// Transpose the triangular matrix into full symmetric adjacency.
    pub fn square_up(&mut self) {
        debug_assert!(!self.is_square, "only on triangular");
        for i in 0..self.adjs.len() {
            let neighbors: Vec<usize> = self.adjs[i].iter().collect();
            for n in neighbors {
                self.adjs[n].insert(i);
            }
        }
        self.is_square = true;
    }

    /// Is there an edge between `a` and `b`? Square mode only.
    pub fn test_edge_sq(&self, a: u32, b: u32) -> bool {
        debug_assert!(self.is_square, "only on square");
        // Probe the smaller list.
        let (a, b) = if self.neighbor_cnt(a) > self.neighbor_cnt(b) {
            (b, a)
        } else {
            (a, b)
        };
        self.adjs[a as usize].contains(b as usize)
    }

    /// Number of neighbors of `a`.
    pub fn neighbor_cnt(&self, a: u32) -> usize {
        self.adjs[a as usize].count()
    }

    /// Neighbors of `a`.
    pub fn neighbors(&self, a: u32) -> &IndexSet {
        &self.adjs[a as usize]
    }

    /// Mutable neighbors of `a`, for the conservative-coalesce surgery.
    pub fn neighbors_mut(&mut self, a: u32) -> &mut IndexSet {
        &mut self.adjs[a as usize]
    }

    /// Union the edges of `b` into `a`. Square mode only.
    pub fn union_adjacency(&mut self, a: u32, b: u32) {
        debug_assert!(self.is_square, "only on square");
        let b_neighbors: Vec<usize> = self.adjs[b as usize].iter().collect();
        for datum in b_neighbors {
            if self.adjs[a as usize].insert(datum) {
                self.adjs[datum].insert(a as usize);
            }
        }
    }

    /// Yank `a` and all its edges out of the graph, adjusting the cached
    /// degrees of its neighbors. The neighbor list is retained so `a` can be
    /// re-inserted in reverse order of yanking.
    pub fn remove_node(&mut self, a: u32, lrgs: &mut [LiveRange]) {
        debug_assert!(self.is_square, "only on square");
        debug_assert!(!self.yanked.contains(a as usize));
        self.yanked.insert(a as usize);
        let neighbors: Vec<usize> = self.adjs[a as usize].iter().collect();
        for datum in neighbors {
            self.adjs[datum].remove(a as usize);
            let delta = lrgs[a as usize].compute_degree(&lrgs[datum]);
            lrgs[datum].inc_degree(-(delta as i32));
        }
    }

    /// Re-insert a yanked vertex, restoring its edges to every neighbor
    /// still present.
    pub fn re_insert(&mut self, a: u32, lrgs: &mut [LiveRange]) {
        debug_assert!(self.is_square, "only on square");
        debug_assert!(self.yanked.contains(a as usize));
        self.yanked.remove(a as usize);
        let neighbors: Vec<usize> = self.adjs[a as usize].iter().collect();
        for datum in neighbors {
            self.adjs[datum].insert(a as usize);
            let delta = lrgs[a as usize].compute_degree(&lrgs[datum]);
            lrgs[datum].inc_degree(delta as i32);
        }
    }

    /// Effective degree of `a`: the sum over neighbors of the pairwise
    /// degree contribution.
    pub fn effective_degree(&self, a: u32, lrgs: &[LiveRange]) -> u32 {
        self.adjs[a as usize]
            .iter()
            .map(|n| lrgs[a as usize].compute_degree(&lrgs[n]))
            .sum()
    }

    /// Set every live range's cached degree from the graph.
    pub fn compute_effective_degree(&self, lrgs: &mut [LiveRange]) {
        debug_assert!(self.is_square, "only on square");
        for i in 0..self.maxlrg {
            let d = self.effective_degree(i, lrgs);
            lrgs[i as usize].set_degree(d);
        }
    }
}

impl Default for InterferenceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Chaitin<'_> {
    /// Does this live range compete for integer-like registers?
    fn counts_toward_int_pressure(&self, lrg: &LiveRange) -> bool {
        if lrg.is_float || lrg.is_vector {
            return false;
        }
        // Stack, flags and special registers do not count.
        lrg.mask.overlaps(self.isa.reg_mask(RegClass::Int))
            || (self.isa.has_predicated_vectors()
                && lrg.mask.overlaps(self.isa.reg_mask(RegClass::PredMask)))
    }

    /// Does this live range compete for float/vector registers?
    fn counts_toward_float_pressure(&self, lrg: &LiveRange) -> bool {
        (lrg.is_float || lrg.is_vector) && lrg.mask.is_not_empty()
    }

    /// Raise pressure in the bank `lrg` competes in.
    fn raise_pressure(&self, lrg: &LiveRange, int_p: &mut Pressure, float_p: &mut Pressure) {
        if lrg.mask.is_not_empty() {
            if self.counts_toward_float_pressure(lrg) {
                float_p.raise(lrg);
            } else if self.counts_toward_int_pressure(lrg) {
                int_p.raise(lrg);
            }
        }
    }

    /// Lower pressure in the bank `lrg` competes in, capturing a transition
    /// at `location`.
    fn lower_pressure(
        &self,
        location: u32,
        lrg: &LiveRange,
        int_p: &mut Pressure,
        float_p: &mut Pressure,
    ) {
        if lrg.mask.is_not_empty() {
            if self.counts_toward_float_pressure(lrg) {
                float_p.lower(lrg, location);
            } else if self.counts_toward_int_pressure(lrg) {
                int_p.lower(lrg, location);
            }
        }
    }

    /// Add an interference edge between `lid` and every live range in
    /// `liveout` whose register mask overlaps `lid`'s.
    pub fn interfere_with_live(&mut self, lid: u32, liveout: &IndexSet) {
        if liveout.is_empty() {
            return;
        }
        let rm = self.lrgs[lid as usize].mask;
        for other in liveout.iter() {
            if rm.overlaps(&self.lrgs[other].mask) {
                self.ifg.add_edge(lid, other as u32);
            }
        }
    }

    /// Build the interference graph on virtual registers only: any
    /// simultaneous liveness is an edge, regardless of register masks. Used
    /// before aggressive coalescing, which wants to see every conflict a
    /// merge could ever create.
    pub fn build_ifg_virtual(&mut self) {
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            // Edits the real live-out set in place; the aggressive pass
            // wants the live-in flavored result this walk leaves behind.
            let mut liveout = core::mem::take(self.live.live_out_mut(block));

            for location in (0..self.func.blocks[block].nodes.len()).rev() {
                let n = self.func.blocks[block].nodes[location];
                let r = self.lrg_map.live_range_id(n);

                if r != 0 {
                    liveout.remove(r as usize);

                    // Copies do not define a new value and so do not
                    // interfere with their source.
                    if let Some(idx) = self.func.node(n).is_copy() {
                        if let Some(src) = self.func.input(n, idx) {
                            let src_lrg = self.lrg_map.live_range_id(src);
                            liveout.remove(src_lrg as usize);
                        }
                    }

                    // Interfere with everything live.
                    for other in liveout.iter() {
                        self.ifg.add_edge(r, other as u32);
                    }
                }

                // Make all inputs live; φ uses come from the prior block.
                if !self.func.node(n).is_phi() {
                    for k in 1..self.func.num_inputs(n) {
                        if let Some(input) = self.func.input(n, k) {
                            let u = self.lrg_map.live_range_id(input);
                            if u != 0 {
                                liveout.insert(u as usize);
                            }
                        }
                    }
                }

                // A two-address instruction keeps its defined value live on
                // entry: pretend a virtual copy just above kills the shared
                // input, so the def interferes with all the other inputs.
                if r != 0 {
                    if let Some(two_adr) = self.func.node(n).two_addr {
                        let shared = self
                            .func
                            .input(n, two_adr as usize)
                            .map(|m| self.lrg_map.live_range_id(m))
                            .unwrap_or(0);
                        for k in 1..self.func.num_inputs(n) {
                            if let Some(input) = self.func.input(n, k) {
                                let kidx = self.lrg_map.live_range_id(input);
                                if kidx != 0 && kidx != shared && kidx != r {
                                    self.ifg.add_edge(r, kidx);
                                }
                            }
                        }
                    }
                }
            }

            *self.live.live_out_mut(block) = liveout;
        }
    }

    /// Remove a dead definition encountered during the physical build.
    /// Projections only go when their parent is dead too, and kill
    /// projections guarding a memory effect stay.
    fn remove_node_if_not_used(
        &mut self,
        block: Block,
        location: usize,
        n: Node,
        lid: u32,
        liveout: &IndexSet,
    ) -> bool {
        let data = self.func.node(n);
        let removable = if data.is_proj() {
            match data.input(0) {
                Some(def) => {
                    let def_lrg = self.lrg_map.live_range_id(def);
                    def_lrg != 0 && !liveout.contains(def_lrg as usize)
                }
                None => false,
            }
        } else {
            true
        };
        if !removable {
            return false;
        }
        if data.is_mach_proj() {
            // Don't remove a kill projection whose parent has a memory
            // effect; the kill is what keeps the parent scheduled.
            if let Some(def) = data.input(0) {
                if self.func.has_mem_projection(def) {
                    return false;
                }
            }
        }
        if self.func.out_count(n) != 0 {
            return false;
        }
        self.func.remove_node_at(block, location);
        if self.lrgs[lid as usize].single_def() == Some(n) {
            self.lrgs[lid as usize].def = crate::regalloc::liverange::DefState::None;
        }
        self.func.disconnect_inputs(n);
        true
    }

    /// Give zero area (and hence a huge score) to single-use spill copies
    /// that immediately precede their use: if a longer live range steals
    /// their color they split again, and again, without ever converging.
    fn assign_high_score_to_immediate_copies(
        &mut self,
        block: Block,
        n: Node,
        lid: u32,
        next_inst: usize,
    ) {
        let data = self.func.node(n);
        if !data.is_spill_copy()
            || !self.lrgs[lid as usize].is_singledef()
            || self.func.out_count(n) != 1
        {
            return;
        }
        let single_use = self.func.unique_user(n);
        if self.func.block_of(single_use) != Some(block) {
            return;
        }
        // Find the first non-spill-copy at or below us.
        let nodes = &self.func.blocks[block].nodes;
        let mut m = n;
        let mut i = next_inst;
        while i < nodes.len() && self.func.node(m).is_spill_copy() {
            m = nodes[i];
            i += 1;
        }
        if m == single_use {
            self.lrgs[lid as usize].area = 0.0;
        }
    }

    /// The copy's source shares a register with the definition; take it out
    /// of the live set before computing interference.
    fn remove_interference_from_copy(
        &mut self,
        location: u32,
        lid_copy: u32,
        liveout: &mut IndexSet,
        cost: f64,
        int_p: &mut Pressure,
        float_p: &mut Pressure,
    ) {
        if liveout.remove(lid_copy as usize) {
            self.lrgs[lid_copy as usize].area -= cost;
            let lrg_copy = self.lrgs[lid_copy as usize].clone();
            // The copy and its definition can share a register.
            self.lower_pressure(location, &lrg_copy, int_p, float_p);
        }
    }

    /// The defined value is bound to particular registers; remove them from
    /// every interfering live range so the bound value never competes for
    /// its own color. Live ranges that go dry are flagged `must_spill`.
    fn remove_bound_register_from_interfering_live_ranges(
        &mut self,
        lid: u32,
        liveout: &IndexSet,
        must_spill: &mut u32,
    ) {
        if liveout.is_empty() {
            return;
        }
        let rm = self.lrgs[lid as usize].mask;
        let r_size = self.lrgs[lid as usize].num_regs;
        for l in liveout.iter() {
            let interfering = &mut self.lrgs[l];
            // If it must spill already, leave its bits alone; it will pick
            // up interferences and spill later.
            if interfering.must_spill {
                continue;
            }
            let old = interfering.mask;
            if interfering.num_regs > 1 && !interfering.fat_proj {
                let mut r2mask = rm;
                // Subtract whole aligned sets so the remainder stays usable.
                r2mask.smear_to_sets(interfering.num_regs);
                interfering.mask.subtract(&r2mask);
            } else if r_size != 1 {
                interfering.mask.subtract(&rm);
            } else if let Some(r_reg) = rm.find_first_elem() {
                if interfering.mask.contains(r_reg) {
                    interfering.mask.remove(r_reg);
                }
            }

            if interfering.not_free() {
                // Restore a reasonable mask so it picks up interferences,
                // then force the split.
                interfering.mask = old;
                *must_spill += 1;
                interfering.must_spill = true;
                interfering.reg = Some(crate::isa::SPILL_REG);
            }
        }
    }

    /// Kill sets live only at their own instruction; account for the spike.
    fn check_fatproj_pressure(
        &self,
        location: u32,
        lid: u32,
        pressure: &mut Pressure,
        class: RegClass,
    ) {
        let mut mask_tmp = self.lrgs[lid as usize].mask;
        mask_tmp.intersect(self.isa.reg_mask(class));
        pressure.check_pressure_at_fatproj(location, &mask_tmp);
    }

    /// If we ran off the top of the block still at high pressure, the whole
    /// block is high pressure.
    fn check_for_high_pressure_block(pressure: &mut Pressure) {
        if pressure.current_pressure() > pressure.high_pressure_limit() {
            pressure.set_high_pressure_index_to_block_start();
        }
    }

    /// Keep the high-pressure index from landing in the middle of a
    /// projection cluster.
    fn adjust_high_pressure_index(&self, block: Block, pressure: &Pressure) -> u32 {
        let mut i = pressure.high_pressure_index();
        let nodes = &self.func.blocks[block].nodes;
        while (i as usize) < nodes.len()
            && i > 0
            && self.func.node(nodes[i as usize]).is_proj()
        {
            i -= 1;
        }
        i
    }

    /// Make all of `n`'s inputs live, charging use costs and raising
    /// pressure for values that just became live. Debug uses (safepoint
    /// inputs past `debug_start`) carry no use-side cost.
    fn add_input_to_liveout(
        &mut self,
        block: Block,
        n: Node,
        liveout: &mut IndexSet,
        cost: f64,
        int_p: &mut Pressure,
        float_p: &mut Pressure,
    ) {
        let debug_start = self.func.node(n).debug_start();
        let freq = self.func.blocks[block].freq;
        for k in 1..self.func.num_inputs(n) {
            let def = match self.func.input(n, k) {
                Some(d) => d,
                None => continue,
            };
            let lid = self.lrg_map.live_range_id(def);
            if lid == 0 {
                continue;
            }
            if k < debug_start {
                // A use costs twice block frequency (load plus load delay);
                // rematerialized uses cost once.
                let use_cost = if self.func.node(def).rematerialize {
                    freq
                } else {
                    freq * 2.0
                };
                self.lrgs[lid as usize].cost += use_cost;
            }
            if liveout.insert(lid as usize) {
                // Newly live things are assumed live from here to the top
                // of the block.
                self.lrgs[lid as usize].area += cost;
                let lrg = self.lrgs[lid as usize].clone();
                self.raise_pressure(&lrg, int_p, float_p);
            }
            debug_assert!(self.lrgs[lid as usize].area >= 0.0, "negative spill area");
        }
    }

    /// Build the physical interference graph: two simultaneously live
    /// ranges interfere only if their allowed register sets overlap. Also
    /// computes per-block register pressure and high-pressure indices, and
    /// counts live ranges that lost every register to bound interference.
    ///
    /// Returns the number of live ranges that must spill no matter what.
    pub fn build_ifg_physical(&mut self) -> u32 {
        let mut must_spill = 0;
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];

            // Clone rather than smash in place: the safepoint-record pass
            // later wants the original live-out info.
            let mut liveout = self.live.live_out(block).clone();

            let first_inst = self.func.first_non_phi(block);
            let last_inst = self.func.blocks[block].nodes.len();

            let mut int_pressure =
                Pressure::new(last_inst as u32, self.isa.int_pressure_limit());
            let mut float_pressure =
                Pressure::new(last_inst as u32, self.isa.float_pressure_limit());
            self.func.blocks[block].reg_pressure = 0;
            self.func.blocks[block].freg_pressure = 0;

            let freq = self.func.blocks[block].freq;
            let mut inst_count = last_inst as i64 - first_inst as i64;
            let mut cost = if inst_count <= 0 {
                0.0
            } else {
                freq * inst_count as f64
            };
            debug_assert!(cost >= 0.0, "negative spill cost");

            // Live-out values are presumed live for the whole block; the
            // area they don't use gets subtracted when they die.
            for lid in liveout.iter() {
                self.lrgs[lid].area += cost;
                let lrg = self.lrgs[lid].clone();
                self.raise_pressure(&lrg, &mut int_pressure, &mut float_pressure);
            }

            let mut location = last_inst;
            while location > 0 {
                location -= 1;
                let n = self.func.blocks[block].nodes[location];
                let lid = self.lrg_map.live_range_id(n);

                if lid != 0 {
                    // A def normally costs block frequency; rematerialized
                    // values are recreated at uses, so the def is free.
                    if !self.func.node(n).rematerialize {
                        self.lrgs[lid as usize].cost += freq;
                    }

                    if !liveout.contains(lid as usize) && !self.func.node(n).is_safepoint() {
                        if self.remove_node_if_not_used(block, location, n, lid, &liveout) {
                            int_pressure.lower_high_pressure_index();
                            float_pressure.lower_high_pressure_index();
                            continue;
                        }
                        if self.lrgs[lid as usize].fat_proj {
                            self.check_fatproj_pressure(
                                location as u32,
                                lid,
                                &mut int_pressure,
                                RegClass::Int,
                            );
                            self.check_fatproj_pressure(
                                location as u32,
                                lid,
                                &mut float_pressure,
                                RegClass::Double,
                            );
                        }
                    } else {
                        // The live range ends at its definition; give back
                        // the area above this point.
                        if cost.is_finite() {
                            self.lrgs[lid as usize].area -= cost;
                            if self.lrgs[lid as usize].area < 0.0 {
                                self.lrgs[lid as usize].area = 0.0;
                            }
                        }

                        self.assign_high_score_to_immediate_copies(block, n, lid, location + 1);

                        if liveout.remove(lid as usize) {
                            let lrg = self.lrgs[lid as usize].clone();
                            self.lower_pressure(
                                location as u32,
                                &lrg,
                                &mut int_pressure,
                                &mut float_pressure,
                            );
                        }
                        if let Some(copy_idx) = self.func.node(n).is_copy() {
                            if let Some(src) = self.func.input(n, copy_idx) {
                                let lid_copy = self.lrg_map.live_range_id(src);
                                self.remove_interference_from_copy(
                                    location as u32,
                                    lid_copy,
                                    &mut liveout,
                                    cost,
                                    &mut int_pressure,
                                    &mut float_pressure,
                                );
                            }
                        }
                    }

                    // Rematerializable defs are not bound, but their uses may
                    // be; bound values never compete for their own color.
                    if self.lrgs[lid as usize].is_bound
                        && !self.func.node(n).rematerialize
                        && self.lrgs[lid as usize].mask.is_not_empty()
                    {
                        self.remove_bound_register_from_interfering_live_ranges(
                            lid,
                            &liveout,
                            &mut must_spill,
                        );
                    }
                    self.interfere_with_live(lid, &liveout);
                }

                // Area remaining in the block.
                inst_count -= 1;
                cost = if inst_count <= 0 {
                    0.0
                } else {
                    freq * inst_count as f64
                };

                if !self.func.node(n).is_phi() {
                    self.add_input_to_liveout(
                        block,
                        n,
                        &mut liveout,
                        cost,
                        &mut int_pressure,
                        &mut float_pressure,
                    );
                }

                // The defined value of a two-address instruction clobbers
                // its shared input in mid-instruction; it must not land on
                // any of the other inputs.
                if lid != 0 {
                    if let Some(two_adr) = self.func.node(n).two_addr {
                        let shared = self
                            .func
                            .input(n, two_adr as usize)
                            .map(|m| self.lrg_map.live_range_id(m))
                            .unwrap_or(0);
                        for k in 1..self.func.num_inputs(n) {
                            if let Some(input) = self.func.input(n, k) {
                                let kidx = self.lrg_map.live_range_id(input);
                                if kidx != 0
                                    && kidx != shared
                                    && kidx != lid
                                    && self.lrgs[lid as usize]
                                        .mask
                                        .overlaps(&self.lrgs[kidx as usize].mask)
                                {
                                    self.ifg.add_edge(lid, kidx);
                                }
                            }
                        }
                    }
                }
            }

            Self::check_for_high_pressure_block(&mut int_pressure);
            Self::check_for_high_pressure_block(&mut float_pressure);
            let ihrp = self.adjust_high_pressure_index(block, &int_pressure);
            let fhrp = self.adjust_high_pressure_index(block, &float_pressure);
            let data = &mut self.func.blocks[block];
            data.ihrp_index = ihrp;
            data.fhrp_index = fhrp;
            data.reg_pressure = int_pressure.final_pressure();
            data.freg_pressure = float_pressure.final_pressure();
            log::trace!(
                "block{}: int pressure {} (hrp {}), float pressure {} (hrp {})",
                block.index(),
                data.reg_pressure,
                data.ihrp_index,
                data.freg_pressure,
                data.fhrp_index,
            );
        }

        must_spill
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lrgs(n: usize) -> Vec<LiveRange> {
        let mut v = vec![LiveRange::new(); n];
        for l in &mut v {
            l.num_regs = 1;
        }
        v
    }

    #[test]
    fn triangular_then_square() {
        let mut ifg = InterferenceGraph::new();
        ifg.init(5);
        assert!(ifg.add_edge(1, 3));
        assert!(!ifg.add_edge(3, 1));
        assert!(ifg.add_edge(2, 3));
        assert!(ifg.test_edge(3, 1));
        assert!(!ifg.test_edge(1, 2));

        ifg.square_up();
        assert!(ifg.test_edge_sq(1, 3));
        assert!(ifg.test_edge_sq(3, 1));
        assert!(!ifg.test_edge_sq(1, 2));
        assert_eq!(ifg.neighbor_cnt(3), 2);
        assert_eq!(ifg.neighbor_cnt(1), 1);
    }

    #[test]
    fn yank_and_reinsert() {
        let mut ifg = InterferenceGraph::new();
        ifg.init(4);
        ifg.add_edge(1, 2);
        ifg.add_edge(1, 3);
        ifg.add_edge(2, 3);
        ifg.square_up();
        let mut table = lrgs(4);
        ifg.compute_effective_degree(&mut table);
        assert_eq!(table[1].degree(), 2);

        ifg.remove_node(1, &mut table);
        assert!(ifg.is_yanked(1));
        assert_eq!(table[2].degree(), 1);
        assert_eq!(table[3].degree(), 1);
        // The yanked vertex keeps its own list.
        assert_eq!(ifg.neighbor_cnt(1), 2);

        ifg.re_insert(1, &mut table);
        assert!(!ifg.is_yanked(1));
        assert_eq!(table[2].degree(), 2);
        assert_eq!(table[3].degree(), 2);
    }

    #[test]
    fn union_adjacency_symmetric() {
        let mut ifg = InterferenceGraph::new();
        ifg.init(5);
        ifg.add_edge(1, 4);
        ifg.add_edge(2, 3);
        ifg.square_up();
        ifg.union_adjacency(1, 2);
        assert!(ifg.test_edge_sq(1, 3));
        assert!(ifg.test_edge_sq(3, 1));
        assert!(ifg.test_edge_sq(1, 4));
    }

    #[test]
    fn effective_degree_uses_pair_rule() {
        let mut ifg = InterferenceGraph::new();
        ifg.init(3);
        ifg.add_edge(1, 2);
        ifg.square_up();
        let mut table = lrgs(3);
        table[2].num_regs = 2;
        assert_eq!(ifg.effective_degree(1, &table), 2);
        table[2].fat_proj = true;
        table[1].num_regs = 2;
        assert_eq!(ifg.effective_degree(1, &table), 4);
    }
}
