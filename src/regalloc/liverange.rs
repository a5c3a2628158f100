//! Live-range descriptors and the node-to-live-range map.
//!
//! A live range (LRG) is the equivalence class of values that will share one
//! register assignment decision. Nodes are mapped to live-range ids through
//! [`LiveRangeMap`]; coalescing merges ids through a union-find that always
//! redirects the larger id to the smaller, which keeps ids monotonically
//! decreasing along chains and makes path compression trivially correct.

use cranelift_entity::{EntityRef, SecondaryMap};

use crate::ir::Node;
use crate::isa::{RegMask, RegUnit};

/// Mask size used for live ranges whose mask reaches the unbounded stack.
pub const ALL_STACK_SIZE: u32 = 0xFFFFF;

/// Ratio balancing spill cost against covered area when ranking spill
/// candidates.
const REGISTER_COST_AREA_RATIO: f64 = 16_000.0;

fn raw_score(cost: f64, area: f64) -> f64 {
    cost - (area * REGISTER_COST_AREA_RATIO) * 1.52588e-5
}

/// Definition summary of a live range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DefState {
    /// Dead: no definition seen.
    #[default]
    None,
    /// Exactly one defining node.
    One(Node),
    /// More than one definition.
    Many,
}

/// One live range.
#[derive(Clone)]
pub struct LiveRange {
    /// Registers this live range may occupy.
    pub mask: RegMask,
    /// Adjacent registers used when it colors; kill count for kill sets.
    pub num_regs: u16,
    /// Physical slot count of a scalable vector when stack-resident.
    pub scalable_slots: u32,
    /// Contribution to register pressure per simultaneous instance.
    pub reg_pressure: u32,
    /// Unique def, multi-def, or dead.
    pub def: DefState,
    /// Spill cost: block frequency per def, twice per use.
    pub cost: f64,
    /// Sum of frequency-weighted simultaneous liveness.
    pub area: f64,
    /// Maximum frequency of any def or use.
    pub max_freq: f64,
    /// Chosen register, or the spill sentinel. `None` until Select.
    pub reg: Option<RegUnit>,
    /// Cached effective degree: sum over neighbors of pairwise degree.
    eff_degree: u32,
    /// Live range whose color we should avoid (its coloring is at risk).
    pub risk_bias: u32,
    /// Live range whose color we would like to share.
    pub copy_bias: u32,
    /// Next link for the simplify worklists.
    pub next: u32,
    /// Prev link for the hi-degree worklist.
    pub prev: u32,

    /// Holds a heap reference.
    pub is_oop: bool,
    /// Lives in float registers.
    pub is_float: bool,
    /// Lives in vector registers.
    pub is_vector: bool,
    /// Scalable vector register.
    pub is_scalable: bool,
    /// Spilled in a prior round.
    pub was_spilled1: bool,
    /// Spilled in two or more prior rounds.
    pub was_spilled2: bool,
    /// Mask leaves no freedom of choice.
    pub is_bound: bool,
    /// Def and use registers directly conflict.
    pub direct_conflict: bool,
    /// Lost all degrees of freedom; must be split.
    pub must_spill: bool,
    /// Kill set or misaligned pair: no adjacency or alignment requirement,
    /// and degree is counted multiplicatively.
    pub fat_proj: bool,
    /// Was of low degree before conservative coalescing.
    pub was_lo: bool,
    /// Adjacent to some copy instruction.
    pub has_copy: bool,
    /// Simplify pushed this despite high degree; Select may spill it.
    pub at_risk: bool,
}

impl LiveRange {
    /// A fresh live range with an all-permissive mask.
    pub fn new() -> Self {
        Self {
            mask: RegMask::all(),
            num_regs: 0,
            scalable_slots: 0,
            reg_pressure: 1,
            def: DefState::None,
            cost: 0.0,
            area: 0.0,
            max_freq: 0.0,
            reg: None,
            eff_degree: 0,
            risk_bias: 0,
            copy_bias: 0,
            next: 0,
            prev: 0,
            is_oop: false,
            is_float: false,
            is_vector: false,
            is_scalable: false,
            was_spilled1: false,
            was_spilled2: false,
            is_bound: false,
            direct_conflict: false,
            must_spill: false,
            fat_proj: false,
            was_lo: false,
            has_copy: false,
            at_risk: false,
        }
    }

    /// Is there any definition?
    pub fn alive(&self) -> bool {
        self.def != DefState::None
    }

    /// More than one def?
    pub fn is_multidef(&self) -> bool {
        self.def == DefState::Many
    }

    /// At most one def?
    pub fn is_singledef(&self) -> bool {
        self.def != DefState::Many
    }

    /// The single defining node, if there is exactly one.
    pub fn single_def(&self) -> Option<Node> {
        match self.def {
            DefState::One(node) => Some(node),
            _ => None,
        }
    }

    /// Record one more definition.
    pub fn record_def(&mut self, node: Node) {
        self.def = match self.def {
            DefState::None => DefState::One(node),
            _ => DefState::Many,
        };
    }

    /// Number of register choices in the mask, treating stack-capable masks
    /// as effectively infinite.
    pub fn mask_size(&self) -> u32 {
        if self.mask.is_all_stack() {
            ALL_STACK_SIZE
        } else {
            self.mask.size()
        }
    }

    /// How many color choices can this live range still make?
    pub fn degrees_of_freedom(&self) -> i64 {
        i64::from(self.mask_size()) - i64::from(self.num_regs)
    }

    /// Even with no neighbors this live range cannot color.
    pub fn not_free(&self) -> bool {
        self.degrees_of_freedom() < 0
    }

    /// Trivially colorable?
    pub fn lo_degree(&self) -> bool {
        i64::from(self.degree()) <= self.degrees_of_freedom()
    }

    /// Just barely trivially colorable?
    pub fn just_lo_degree(&self) -> bool {
        i64::from(self.degree()) == self.degrees_of_freedom()
    }

    /// Cached effective degree.
    pub fn degree(&self) -> u32 {
        self.eff_degree
    }

    /// Overwrite the cached degree.
    pub fn set_degree(&mut self, degree: u32) {
        self.eff_degree = degree;
    }

    /// Incrementally adjust the cached degree.
    pub fn inc_degree(&mut self, delta: i32) {
        self.eff_degree = self.eff_degree.saturating_add_signed(delta);
    }

    /// Degree contribution between this live range and `other`: the max of
    /// the two sizes for aligned sets, their product when either side is a
    /// kill set or misaligned pair.
    pub fn compute_degree(&self, other: &LiveRange) -> u32 {
        let a = u32::from(self.num_regs);
        let b = u32::from(other.num_regs);
        if self.fat_proj || other.fat_proj {
            a * b
        } else {
            a.max(b)
        }
    }

    /// Is the chosen register (after Select) known, i.e. not the spill
    /// sentinel?
    pub fn is_spilled(&self) -> bool {
        matches!(self.reg, Some(r) if r >= crate::isa::SPILL_REG)
    }

    /// Spill ranking; lower scores spill first.
    pub fn score(&self) -> f64 {
        // Scale area down then subtract from cost: covering a large area
        // cheaply makes a live range a good spill candidate.
        let score = raw_score(self.cost, self.area);

        if self.area == 0.0 {
            // No area means no progress from spilling.
            return 1e35;
        }

        if self.was_spilled2 {
            // Spilled twice before; further spilling is unlikely to help.
            return score + 1e30;
        }

        if self.cost >= self.area * 3.0 {
            // Tiny area relative to cost.
            return score + 1e17;
        }

        if self.cost + self.cost >= self.area * 3.0 {
            // Small area relative to cost.
            return score + 1e10;
        }

        score
    }
}

impl Default for LiveRange {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps nodes to live-range ids and live-range ids to their coalesced
/// representative.
///
/// `names[node]` is the node's current live-range id; id 0 marks nodes that
/// do not allocate. `uf[lrg]` is a union-find forest: roots map to
/// themselves, and unions always redirect the larger id to the smaller, so
/// `uf[i] <= i` everywhere.
pub struct LiveRangeMap {
    names: SecondaryMap<Node, u32>,
    uf: Vec<u32>,
    max_lrg_id: u32,
}

impl LiveRangeMap {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            names: SecondaryMap::new(),
            uf: Vec::new(),
            max_lrg_id: 0,
        }
    }

    /// One past the largest live-range id.
    pub fn max_lrg_id(&self) -> u32 {
        self.max_lrg_id
    }

    /// Update the largest live-range id.
    pub fn set_max_lrg_id(&mut self, max: u32) {
        self.max_lrg_id = max;
    }

    /// The raw (un-unioned) live-range id of `node`.
    pub fn live_range_id(&self, node: Node) -> u32 {
        self.names[node]
    }

    /// Set the live-range id of `node`.
    pub fn map(&mut self, node: Node, lrg: u32) {
        self.names[node] = lrg;
    }

    /// Set the live-range id of `node`, growing the map as needed.
    pub fn extend(&mut self, node: Node, lrg: u32) {
        self.names[node] = lrg;
    }

    /// Redirect `dst` to `src` in the union-find.
    pub fn uf_map(&mut self, dst: u32, src: u32) {
        self.uf[dst as usize] = src;
    }

    /// Redirect `dst` to `src`, growing the union-find as needed.
    pub fn uf_extend(&mut self, dst: u32, src: u32) {
        if dst as usize >= self.uf.len() {
            self.uf.resize(dst as usize + 1, 0);
        }
        self.uf[dst as usize] = src;
    }

    /// Path-compressing find.
    pub fn find(&mut self, mut lrg: u32) -> u32 {
        let mut root = lrg;
        let mut next = self.uf[root as usize];
        while next != root {
            debug_assert!(next < root, "always union smaller");
            root = next;
            next = self.uf[root as usize];
        }
        // Compress the chain of equivalences down to the root.
        while lrg != root {
            let tmp = self.uf[lrg as usize];
            self.uf[lrg as usize] = root;
            lrg = tmp;
        }
        root
    }

    /// Path-compressing find for a node's live range.
    pub fn find_node(&mut self, node: Node) -> u32 {
        let lrg = self.names[node];
        let root = self.find(lrg);
        if root != lrg {
            self.names[node] = root;
        }
        root
    }

    /// Find without path compression; usable on a shared map.
    pub fn find_const(&self, mut lrg: u32) -> u32 {
        if lrg == 0 {
            return 0;
        }
        if lrg >= self.max_lrg_id {
            // Brand-new live range not yet unioned.
            return lrg;
        }
        let mut next = self.uf[lrg as usize];
        while next != lrg {
            debug_assert!(next < lrg, "always union smaller");
            lrg = next;
            next = self.uf[lrg as usize];
        }
        next
    }

    /// Find without path compression for a node.
    pub fn find_const_node(&self, node: Node) -> u32 {
        self.find_const(self.names[node])
    }

    /// Reset the union-find to the identity on `0..max`.
    pub fn reset_uf_map(&mut self, max: u32) {
        self.max_lrg_id = max;
        self.uf.clear();
        self.uf.extend(0..max);
    }

    /// Point every node directly at its final live range; `find` is no
    /// longer needed after this.
    pub fn compress_uf_map_for_nodes(&mut self, num_nodes: usize) {
        for i in 0..num_nodes {
            let node = Node::new(i);
            let lrg = self.names[node];
            if lrg != 0 {
                let compressed = self.find(lrg);
                if compressed != lrg {
                    self.names[node] = compressed;
                }
            }
        }
    }

    /// Renumber the surviving live ranges to `1..k`, making the interference
    /// graph for the next round smaller. Returns the new id bound `k`.
    pub fn compact(&mut self, num_nodes: usize) -> u32 {
        // Chains run from big ids to small ids and terminate in a
        // self-cycle. Walk ids upward: roots take the next compact number,
        // non-roots copy their (already compacted) root's number.
        let mut j = 1;
        for i in 1..self.max_lrg_id {
            let lr = self.uf[i as usize];
            if lr == 0 {
                continue;
            }
            debug_assert!(lr <= i);
            let compacted = if lr == i {
                let id = j;
                j += 1;
                id
            } else {
                self.uf[lr as usize]
            };
            self.uf[i as usize] = compacted;
        }
        // Rewrite node names through the compacted table.
        for i in 0..num_nodes {
            let node = Node::new(i);
            let lrg = self.names[node];
            if lrg != 0 {
                self.names[node] = self.uf[lrg as usize];
            }
        }
        self.reset_uf_map(j);
        j
    }
}

impl Default for LiveRangeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_find_basics() {
        let mut map = LiveRangeMap::new();
        map.reset_uf_map(6);
        // Union 5 into 3, then 3 into 1.
        map.uf_map(5, 3);
        map.uf_map(3, 1);
        assert_eq!(map.find(5), 1);
        // Path compression rewired 5 directly to 1.
        assert_eq!(map.find_const(5), 1);
        assert_eq!(map.find(4), 4);
        for i in 0..6u32 {
            assert!(map.find_const(i) <= i);
        }
    }

    #[test]
    fn compact_renumbers_densely() {
        let mut map = LiveRangeMap::new();
        let n0 = Node::new(0);
        let n1 = Node::new(1);
        let n2 = Node::new(2);
        map.extend(n0, 1);
        map.extend(n1, 3);
        map.extend(n2, 5);
        map.reset_uf_map(6);
        map.uf_map(3, 1); // 3 joins 1
        let k = map.compact(3);
        // Survivors: {1,3} -> 1, 2 -> 2, 4 -> 3, 5 -> 4.
        assert_eq!(k, 5);
        assert_eq!(map.live_range_id(n0), 1);
        assert_eq!(map.live_range_id(n1), 1);
        assert_eq!(map.live_range_id(n2), 4);
        // Union-find is identity again.
        assert_eq!(map.find(4), 4);
    }

    #[test]
    fn score_ordering() {
        let mut cheap = LiveRange::new();
        cheap.cost = 1.0;
        cheap.area = 100.0;
        let mut precious = LiveRange::new();
        precious.cost = 1000.0;
        precious.area = 100.0;
        assert!(cheap.score() < precious.score());

        let mut no_area = LiveRange::new();
        no_area.cost = 1.0;
        no_area.area = 0.0;
        assert!(no_area.score() >= 1e35);

        let mut respilled = LiveRange::new();
        respilled.cost = 1.0;
        respilled.area = 100.0;
        respilled.was_spilled2 = true;
        assert!(respilled.score() > cheap.score());
    }

    #[test]
    fn degree_rules() {
        let mut pair = LiveRange::new();
        pair.num_regs = 2;
        let mut single = LiveRange::new();
        single.num_regs = 1;
        assert_eq!(pair.compute_degree(&single), 2);
        let mut fat = LiveRange::new();
        fat.num_regs = 3;
        fat.fat_proj = true;
        assert_eq!(fat.compute_degree(&pair), 6);
    }
}
