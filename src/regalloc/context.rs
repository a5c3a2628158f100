//! Register allocator context and driver.
//!
//! [`Context`] owns the persistent state and sequences the phases: liveness,
//! interference construction, the two coalescing rounds, base-pointer
//! stretching, simplify/select, and — when coloring fails — the
//! split-and-recycle loop that re-runs everything on the narrowed live
//! ranges. The loop has a hard trip budget; exhausting it fails the
//! compilation rather than looping forever.

use cranelift_entity::{EntityRef, EntitySet, SecondaryMap};

use crate::ir::{Function, Node, ValueLoc};
use crate::isa::{RegClass, RegMask, TargetIsa};
use crate::regalloc::liverange::LiveRange;
use crate::regalloc::stackmap::StackmapSink;
use crate::regalloc::Chaitin;
use crate::result::{CodegenError, CodegenResult};

/// Retry budget for the spill-split-recycle loop.
const MAX_SPILL_TRIPS: u32 = 24;

/// Don't trim register masks from uses this much colder than the def before
/// aggressive coalescing; it pre-splits around uncommon uses of common defs.
const UNCOMMON_USE_RATIO: f64 = 1000.0;

/// The result of register allocation.
pub struct Allocation {
    /// Final location of every node's value.
    pub locations: SecondaryMap<Node, ValueLoc>,
    /// Nodes holding heap references, for the embedder's GC tables.
    pub node_oops: EntitySet<Node>,
    /// Frame size in stack slots.
    pub frame_slots: u32,
    /// One past the highest register number used.
    pub max_reg: u32,
    /// Number of split rounds it took to color.
    pub spill_trips: u32,
}

/// Persistent memory for register allocation.
///
/// Reuse one of these across functions to avoid re-allocating the side
/// tables for every compilation.
pub struct Context {
    _private: (),
}

impl Context {
    /// Create a new context.
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Allocate registers in `func`.
    ///
    /// After this returns successfully, every allocatable node has a
    /// register or stack location consistent with its operand constraints,
    /// and `sink` (when supplied) has received a record per safepoint.
    pub fn run(
        &mut self,
        func: &mut Function,
        isa: &dyn TargetIsa,
        mut sink: Option<&mut dyn StackmapSink>,
    ) -> CodegenResult<Allocation> {
        let mut c = Chaitin::new(func, isa);
        log::debug!("regalloc: {} nodes, {} blocks", c.func.num_nodes(), c.func.layout.len());

        // Out of SSA: assign a virtual register to every value-producing
        // node. φ inputs become virtual copies we try to coalesce before
        // manifesting them.
        c.de_ssa();

        let max = c.lrg_map.max_lrg_id();
        c.ifg.init(max);
        c.gather_lrg_masks(false);
        c.compute_live(false);

        // Base pointers need to be live wherever a derived pointer crosses a
        // safepoint, not just up to where the derived value is made.
        if c.stretch_base_pointer_live_ranges()? {
            let max = c.lrg_map.max_lrg_id();
            c.ifg.init(max);
            c.gather_lrg_masks(false);
            c.compute_live(false);
        }

        // Interference on virtual copies, then squared for the union-heavy
        // coalescing passes.
        c.build_ifg_virtual();
        c.ifg.square_up();

        // Aggressive (but pessimistic) coalescing; leftovers become real
        // copies.
        c.aggressive_coalesce_driver();
        c.insert_copies()?;

        // First shot at coloring needs the physical interference graph.
        let max = c.lrg_map.max_lrg_id();
        c.ifg.init(max);
        c.gather_lrg_masks(true);
        c.compute_live(false);

        let must_spill = c.build_ifg_physical();
        if must_spill > 0 {
            // A guaranteed spill; might as well split now.
            log::debug!("regalloc: {} live ranges must spill before coloring", must_spill);
            let new_max = c.split()?;
            c.lrg_map.set_max_lrg_id(new_max);
            c.compact();

            let max = c.lrg_map.max_lrg_id();
            c.ifg.init(max);
            c.gather_lrg_masks(true);
            c.compute_live(false);
            c.build_ifg_physical();
            c.ifg.square_up();
            c.compute_effective_degrees();

            c.conservative_coalesce_driver();
            c.lrg_map.compress_uf_map_for_nodes(c.func.num_nodes());
        } else {
            c.ifg.square_up();
            c.compute_effective_degrees();
        }

        c.cache_lrg_info();
        c.simplify();
        let mut spills = c.select();

        // If something spilled, split it everywhere and recycle the whole
        // coloring.
        let mut trip_cnt = 0u32;
        while spills > 0 {
            trip_cnt += 1;
            if trip_cnt > MAX_SPILL_TRIPS {
                return Err(CodegenError::SpillLimitExceeded);
            }
            log::debug!("regalloc: {} spills, split trip {}", spills, trip_cnt);

            let new_max = c.split()?;
            c.lrg_map.set_max_lrg_id(new_max);
            c.compact();

            let max = c.lrg_map.max_lrg_id();
            c.ifg.init(max);
            c.gather_lrg_masks(true);
            c.compute_live(false);
            c.build_ifg_physical();
            c.ifg.square_up();
            c.compute_effective_degrees();

            c.conservative_coalesce_driver();
            c.lrg_map.compress_uf_map_for_nodes(c.func.num_nodes());

            c.cache_lrg_info();
            c.simplify();
            spills = c.select();
        }

        // Peephole remove copies, then merge multidefs that landed in one
        // register.
        c.post_allocate_copy_removal();
        c.merge_multidefs();

        // Highest register used, as a frame size.
        let stack_base = isa.stack_base();
        let mut frame_slots = if c.max_reg <= stack_base {
            0
        } else {
            c.max_reg - stack_base
        };
        let align = isa.stack_alignment_slots();
        frame_slots = frame_slots.div_ceil(align) * align;

        // Convert CISC spills.
        c.fixup_spills()?;

        // Safepoint records for the collector. The peephole passes above
        // rewired the graph, so liveness is recomputed first, keeping the
        // live-in deltas the record builder wants.
        if let Some(sink) = sink.as_deref_mut() {
            c.compute_live(true);
            c.emit_stackmaps(sink, frame_slots)?;
        }

        // Export the node-to-location map.
        let mut locations: SecondaryMap<Node, ValueLoc> = SecondaryMap::new();
        let mut node_oops = EntitySet::new();
        for i in 0..c.func.num_nodes() {
            let node = Node::new(i);
            let lrg_id = c.lrg_map.live_range_id(node);
            if lrg_id == 0 {
                continue;
            }
            let lrg = &c.lrgs[lrg_id as usize];
            if !lrg.alive() {
                continue;
            }
            let reg = match lrg.reg {
                Some(reg) => reg,
                None => continue,
            };
            locations[node] = if lrg.num_regs <= 1 {
                ValueLoc::Reg(reg)
            } else if !lrg.fat_proj {
                // Live ranges record the highest register of their set;
                // emission wants the low one too.
                let mut n_regs = u32::from(lrg.num_regs);
                if lrg.is_scalable && isa.is_stack(reg) {
                    n_regs = lrg.scalable_slots;
                }
                ValueLoc::Pair {
                    hi: reg,
                    lo: reg + 1 - n_regs,
                }
            } else {
                // Misaligned pair: the two registers are wherever the mask
                // says they are.
                let mut mask = lrg.mask;
                if RegMask::can_represent(reg) {
                    mask.remove(reg);
                }
                match mask.find_first_elem() {
                    Some(lo) => ValueLoc::Pair { hi: reg, lo },
                    None => ValueLoc::Reg(reg),
                }
            };
            if lrg.is_oop {
                node_oops.insert(node);
            }
        }

        log::debug!(
            "regalloc done: frame {} slots, max reg {}, {} trips",
            frame_slots,
            c.max_reg,
            trip_cnt
        );
        Ok(Allocation {
            locations,
            node_oops,
            frame_slots,
            max_reg: c.max_reg,
            spill_trips: trip_cnt,
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Chaitin<'_> {
    /// Set initial names for all nodes: a fresh virtual register for every
    /// node with a non-empty output mask, the zero live range for the rest.
    pub fn de_ssa(&mut self) {
        let mut lr_counter = 1u32;
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            for j in 0..self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                let allocatable = self.func.node(n).out_mask.is_not_empty();
                let name = if allocatable {
                    let id = lr_counter;
                    lr_counter += 1;
                    id
                } else {
                    0
                };
                self.lrg_map.map(n, name);
            }
        }
        self.lrg_map.reset_uf_map(lr_counter);
    }

    /// Recompute liveness under the current names.
    pub fn compute_live(&mut self, keep_deltas: bool) {
        self.live.compute(&*self.func, &self.lrg_map, keep_deltas);
    }

    /// Refresh every live range's cached effective degree from the graph.
    pub fn compute_effective_degrees(&mut self) {
        let Chaitin { ref ifg, ref mut lrgs, .. } = *self;
        ifg.compute_effective_degree(lrgs);
    }

    /// Renumber live ranges densely, shrinking the next interference graph.
    pub fn compact(&mut self) {
        self.lrg_map.compact(self.func.num_nodes());
    }

    /// Rebuild the live-range table: intersect the register masks of every
    /// def and use, classify sizes and pressure contributions, and flag
    /// bound, kill-set and previously-spilled live ranges.
    ///
    /// Before aggressive coalescing (`after_aggressive` false), masks from
    /// very uncommon uses are left untrimmed; that effectively pre-splits
    /// around slow-path uses of common values. CISC operand masks are only
    /// widened afterwards, for the same reason.
    pub fn gather_lrg_masks(&mut self, after_aggressive: bool) {
        let maxlrg = self.lrg_map.max_lrg_id();
        self.lrgs = vec![LiveRange::new(); maxlrg as usize];

        // Nail down the frame pointer: never a spill candidate.
        if let Some(fp) = self.func.frame_ptr.expand() {
            let fp_lrg = self.lrg_map.live_range_id(fp);
            if fp_lrg != 0 {
                self.lrgs[fp_lrg as usize].cost += 1e12;
            }
        }

        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let freq = self.func.blocks[block].freq;
            for j in 0..self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                let vreg = self.lrg_map.live_range_id(n);

                if vreg != 0 {
                    let data = self.func.node(n);
                    let out_mask = data.out_mask;
                    let ideal = data.ideal;
                    let ty = data.ty;
                    let is_copy = data.is_copy();
                    let lrg = &mut self.lrgs[vreg as usize];

                    // Float-vs-int classification for pressure.
                    if ty.is_floating() {
                        lrg.is_float = true;
                    }

                    // Prior spill rounds make a live range a worse spill
                    // candidate; twice prior makes it nearly untouchable.
                    if self.spilled_once.contains(n.index()) {
                        lrg.was_spilled1 = true;
                        if self.spilled_twice.contains(n.index()) {
                            lrg.was_spilled2 = true;
                        }
                    }

                    // Single def spills nicely via rematerialization; track
                    // the transition to multidef.
                    lrg.record_def(n);

                    // Limit to acceptable result registers.
                    lrg.mask.intersect(&out_mask);

                    if lrg.max_freq < freq {
                        lrg.max_freq = freq;
                    }

                    match ideal {
                        Some(RegClass::KillSet) => {
                            // Kill sets are sized by the registers killed.
                            lrg.num_regs = out_mask.size() as u16;
                            lrg.reg_pressure = out_mask.size();
                            lrg.fat_proj = true;
                            lrg.is_bound = true;
                        }
                        Some(class) => {
                            let n_regs = self.isa.num_regs(class);
                            debug_assert!(
                                lrg.num_regs == 0 || lrg.num_regs == n_regs,
                                "conflicting sizes in one live range"
                            );
                            lrg.num_regs = n_regs;
                            lrg.reg_pressure = 1;
                            if class.is_vector() {
                                lrg.is_vector = true;
                                if class == RegClass::VecA {
                                    debug_assert!(self.isa.supports_scalable_vector());
                                    lrg.is_scalable = true;
                                    lrg.scalable_slots = self.isa.scalable_vector_slots();
                                }
                            }
                            if class == RegClass::Ptr && ty.is_oop() {
                                lrg.is_oop = true;
                            }
                            // A pair whose required mask is a misaligned
                            // pair can interfere with two aligned pairs at
                            // once: count it like a kill set.
                            if n_regs == 2 && !class.is_vector() && out_mask.is_misaligned_pair()
                            {
                                lrg.fat_proj = true;
                                lrg.is_bound = true;
                            }
                            if lrg.mask.is_bound(n_regs) {
                                lrg.is_bound = true;
                            }
                        }
                        None => {
                            lrg.num_regs = 1;
                            lrg.reg_pressure = 1;
                        }
                    }

                    // Copy-relatedness, for diagnostics and bias seeding.
                    if let Some(cidx) = is_copy {
                        lrg.has_copy = true;
                        if let Some(src) = self.func.input(n, cidx) {
                            let clidx = self.lrg_map.live_range_id(src);
                            if clidx != 0 {
                                self.lrgs[clidx as usize].has_copy = true;
                            }
                        }
                    }
                }

                // Now the inputs.
                for k in 1..self.func.num_inputs(n) {
                    let input = match self.func.input(n, k) {
                        Some(input) => input,
                        None => continue,
                    };
                    let vreg = self.lrg_map.live_range_id(input);
                    if vreg == 0 {
                        continue;
                    }

                    // CISC-spillable operands accept the stack too, but
                    // only once coalescing is done.
                    let mut rm = self.func.node(n).in_mask(k);
                    if after_aggressive
                        && self.isa.use_cisc_spill()
                        && self.func.node(n).cisc_operand == Some(k as u32)
                    {
                        if let Some(class) = self.func.node(input).ideal {
                            rm = *self.isa.spill_mask(class);
                        }
                    }

                    // Leave masks from very uncommon uses untrimmed before
                    // aggressive coalescing; the spiller handles slow paths
                    // nicely.
                    let uncommon = !after_aggressive
                        && self
                            .func
                            .block_of(input)
                            .map(|db| self.func.blocks[db].freq > UNCOMMON_USE_RATIO * freq)
                            .unwrap_or(false);
                    if !uncommon {
                        self.lrgs[vreg as usize].mask.intersect(&rm);
                    }

                    let kclass = self.func.node(input).ideal;
                    let lrg = &mut self.lrgs[vreg as usize];
                    if let Some(kclass) = kclass {
                        let n_regs = self.isa.num_regs(kclass);
                        if lrg.mask.is_bound(n_regs) {
                            lrg.is_bound = true;
                        }
                        let is_vect = kclass.is_vector();
                        if !is_vect && lrg.num_regs == 2 && !lrg.fat_proj && rm.is_misaligned_pair()
                        {
                            lrg.fat_proj = true;
                            lrg.is_bound = true;
                        }
                        // An unaligned pair will have to spill; clear the
                        // mask now unless it is already spill plumbing.
                        let spill_related = self.func.node(n).is_spill_copy()
                            || matches!(lrg.single_def(),
                                Some(d) if self.func.node(d).is_spill_copy());
                        if !is_vect
                            && !spill_related
                            && !lrg.is_multidef()
                            && lrg.mask.is_misaligned_pair()
                        {
                            lrg.mask = RegMask::empty();
                        }
                    }

                    if lrg.max_freq < freq {
                        lrg.max_freq = freq;
                    }
                }
            }
        }

        // Final per-live-range setup.
        for i in 1..maxlrg {
            let lrg = &mut self.lrgs[i as usize];
            debug_assert!(!lrg.is_vector || !lrg.fat_proj);
            if lrg.num_regs > 1 && !lrg.fat_proj {
                lrg.mask.clear_to_sets(lrg.num_regs);
            }
            if lrg.not_free() {
                // Lost from the start: def and use constraints conflict.
                lrg.reg = Some(crate::isa::SPILL_REG);
                lrg.direct_conflict = true;
            }
            lrg.set_degree(0); // no neighbors in the graph yet
        }
    }
}
