//! Register allocation.
//!
//! This module contains the graph-coloring register allocator: liveness,
//! interference-graph construction with pressure tracking, copy coalescing,
//! base-pointer stretching, simplify/select coloring, live-range splitting,
//! spill fixup, and post-allocation copy removal. [`Context`] owns the
//! persistent state and drives the phases.

pub mod coalesce;
pub mod coloring;
pub mod context;
pub mod derived;
pub mod ifg;
pub mod liveness;
pub mod liverange;
pub mod postopt;
pub mod pressure;
pub mod reload;
pub mod spill;
pub mod stackmap;

pub use self::context::{Allocation, Context};
pub use self::stackmap::StackmapSink;

use cranelift_entity::EntityRef;

use crate::indexset::IndexSet;
use crate::ir::{Block, Function};
use crate::isa::{RegUnit, TargetIsa};
use self::ifg::InterferenceGraph;
use self::liveness::Liveness;
use self::liverange::{LiveRange, LiveRangeMap};

/// Shared allocator state threaded through every phase.
///
/// One of these exists per `run()`; the phase implementations hang off it as
/// `impl` blocks in their own modules.
pub(crate) struct Chaitin<'a> {
    pub func: &'a mut Function,
    pub isa: &'a dyn TargetIsa,
    /// Node-to-live-range names and the coalescing union-find.
    pub lrg_map: LiveRangeMap,
    /// Live-range table, indexed by live-range id. Entry 0 is unused.
    pub lrgs: Vec<LiveRange>,
    pub ifg: InterferenceGraph,
    pub live: Liveness,
    /// Blocks sorted by descending frequency, for coalescing.
    pub blks: Vec<Block>,
    /// Nodes spilled in an earlier split round.
    pub spilled_once: IndexSet,
    /// Nodes spilled in two or more earlier split rounds.
    pub spilled_twice: IndexSet,
    /// Select's first/second color alternation counter.
    pub alternate: u32,
    /// One past the highest register number handed out.
    pub max_reg: RegUnit,
    /// Simplify worklist heads and tails (live-range ids; 0 terminates).
    pub lo_degree: u32,
    pub lo_degree_tail: u32,
    pub lo_stk_degree: u32,
    pub lo_stk_degree_tail: u32,
    pub hi_degree: u32,
    pub simplified: u32,
}

impl<'a> Chaitin<'a> {
    pub fn new(func: &'a mut Function, isa: &'a dyn TargetIsa) -> Self {
        // Sort a copy of the layout by descending frequency. Stable sort so
        // equal-frequency blocks keep layout order and the result is
        // deterministic.
        let mut blks = func.layout.clone();
        blks.sort_by(|&a, &b| {
            func.blocks[b]
                .freq
                .partial_cmp(&func.blocks[a].freq)
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        Self {
            func,
            isa,
            lrg_map: LiveRangeMap::new(),
            lrgs: Vec::new(),
            ifg: InterferenceGraph::new(),
            live: Liveness::new(),
            blks,
            spilled_once: IndexSet::new(),
            spilled_twice: IndexSet::new(),
            alternate: 0,
            max_reg: 0,
            lo_degree: 0,
            lo_degree_tail: 0,
            lo_stk_degree: 0,
            lo_stk_degree_tail: 0,
            hi_degree: 0,
            simplified: 0,
        }
    }

    /// Combine the live ranges of these two nodes. Future `find` calls on
    /// either return the combined (smaller) id.
    pub fn union(&mut self, src: crate::ir::Node, dst: crate::ir::Node) {
        let src = self.lrg_map.find_node(src);
        let dst = self.lrg_map.find_node(dst);
        debug_assert!(src != 0 && dst != 0);
        debug_assert!(src < dst, "always union smaller");
        self.lrg_map.uf_map(dst, src);
    }

    /// Give `node` a fresh live-range id.
    pub fn new_lrg(&mut self, node: crate::ir::Node, lrg: u32) {
        self.lrg_map.extend(node, lrg);
        self.lrg_map.uf_extend(lrg, lrg);
    }

    /// Mark `node` as having been through a split round.
    pub fn set_was_spilled(&mut self, node: crate::ir::Node) {
        if !self.spilled_once.insert(node.index()) {
            self.spilled_twice.insert(node.index());
        }
    }

    /// After cloning a rematerialized instruction, clone any kill
    /// projections that follow it. Returns the number of projections cloned.
    pub fn clone_projs(
        &mut self,
        block: Block,
        mut at: usize,
        orig: crate::ir::Node,
        copy: crate::ir::Node,
    ) -> usize {
        let mut found = 0;
        for proj in self.func.kill_projections(orig) {
            found += 1;
            let kill = self.func.clone_node(proj);
            self.func.set_input(kill, 0, Some(copy));
            self.func.insert_node(block, at, kill);
            at += 1;
            let max = self.lrg_map.max_lrg_id();
            self.new_lrg(kill, max);
            self.lrg_map.set_max_lrg_id(max + 1);
        }
        found
    }
}
