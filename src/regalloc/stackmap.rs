//! Safepoint records.
//!
//! After coloring, every heap reference live across a safepoint must be
//! reported to the collector: plain oops by their location, derived pointers
//! together with the location of their base, callee-save registers by where
//! their entry value is currently parked. The allocator computes the
//! locations; a [`StackmapSink`] supplied by the embedder receives them.

use cranelift_entity::EntityRef;

use crate::ir::{Node, NodeKind, ValueType};
use crate::isa::RegUnit;
use crate::regalloc::Chaitin;
use crate::result::{CodegenError, CodegenResult};

/// Receiver for per-safepoint location records.
pub trait StackmapSink {
    /// Total frame size in stack slots. Reported once, first.
    fn frame_size(&mut self, _slots: u32) {}

    /// A record for `safepoint` begins.
    fn begin_safepoint(&mut self, _safepoint: Node) {}

    /// An ordinary heap reference lives at `reg`.
    fn set_oop(&mut self, reg: RegUnit);

    /// A compressed heap reference lives at `reg`.
    fn set_narrow_oop(&mut self, reg: RegUnit);

    /// A derived pointer lives at `derived`; its base lives at `base`.
    fn set_derived_oop(&mut self, derived: RegUnit, base: RegUnit);

    /// Callee-save register `reg`'s entry value is currently in `saved_in`.
    fn set_callee_saved(&mut self, reg: RegUnit, saved_in: RegUnit);

    /// The record for `safepoint` is complete.
    fn end_safepoint(&mut self, _safepoint: Node) {}
}

impl Chaitin<'_> {
    fn checked_reg(&self, node: Node) -> CodegenResult<RegUnit> {
        let lidx = self.lrg_map.live_range_id(node);
        let reg = if lidx == 0 {
            None
        } else {
            self.lrgs[lidx as usize].reg
        };
        match reg {
            Some(reg) if reg <= self.isa.max_stackmap_reg() => Ok(reg),
            _ => Err(CodegenError::IllegalStackmapRegister),
        }
    }

    /// Walk every safepoint and hand its oop locations to `sink`.
    pub fn emit_stackmaps(
        &mut self,
        sink: &mut dyn StackmapSink,
        frame_slots: u32,
    ) -> CodegenResult<()> {
        sink.frame_size(frame_slots);

        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut live = self.live.live_out(block).clone();

            for j in (0..self.func.blocks[block].nodes.len()).rev() {
                let n = self.func.blocks[block].nodes[j];
                let lid = self.lrg_map.live_range_id(n);
                if lid != 0 {
                    live.remove(lid as usize);
                    if let Some(idx) = self.func.node(n).is_copy() {
                        if let Some(src) = self.func.input(n, idx) {
                            live.remove(self.lrg_map.live_range_id(src) as usize);
                        }
                    }
                }

                // Inputs are live above this instruction; for a safepoint
                // that includes its own debug state, which must be in the
                // reported set.
                if !self.func.node(n).is_phi() {
                    for k in 1..self.func.num_inputs(n) {
                        if let Some(input) = self.func.input(n, k) {
                            let l = self.lrg_map.live_range_id(input);
                            if l != 0 {
                                live.insert(l as usize);
                            }
                        }
                    }
                }

                if self.func.node(n).is_safepoint() {
                    sink.begin_safepoint(n);

                    // Derived pointers and their bases were appended as
                    // input pairs by base-pointer stretching.
                    let mut derived_lrgs = Vec::new();
                    if let Some(oopoff) = self.func.node(n).oopoff {
                        let mut k = oopoff as usize;
                        while k + 1 < self.func.num_inputs(n) {
                            let derived = self.func.input(n, k);
                            let base = self.func.input(n, k + 1);
                            let (derived, base) = match (derived, base) {
                                (Some(d), Some(b)) => (d, b),
                                _ => break,
                            };
                            let dreg = self.checked_reg(derived)?;
                            let breg = self.checked_reg(base)?;
                            sink.set_derived_oop(dreg, breg);
                            derived_lrgs.push(self.lrg_map.live_range_id(derived));
                            k += 2;
                        }
                    }

                    // Every other oop live across the safepoint.
                    for lrg_id in live.iter() {
                        let lrg = &self.lrgs[lrg_id];
                        if !lrg.is_oop || derived_lrgs.contains(&(lrg_id as u32)) {
                            continue;
                        }
                        let reg = match lrg.reg {
                            Some(reg) => reg,
                            None => continue,
                        };
                        if reg > self.isa.max_stackmap_reg() {
                            return Err(CodegenError::IllegalStackmapRegister);
                        }
                        let narrow = matches!(lrg.single_def(),
                            Some(def) if self.func.node(def).ty == ValueType::NarrowOop);
                        if narrow {
                            sink.set_narrow_oop(reg);
                        } else {
                            sink.set_oop(reg);
                        }
                    }

                    // Callee-save registers: report where each entry value
                    // lives now.
                    for i in 0..self.func.num_nodes() {
                        let node = Node::new(i);
                        let data = self.func.node(node);
                        if !data.is_proj()
                            || !matches!(data.input(0),
                                Some(p) if self.func.node(p).kind == NodeKind::Start)
                        {
                            continue;
                        }
                        let home = match data.out_mask.find_first_elem() {
                            Some(r) => r,
                            None => continue,
                        };
                        if !self.isa.is_save_on_entry(home) {
                            continue;
                        }
                        let lidx = self.lrg_map.live_range_id(node);
                        if lidx == 0 {
                            continue;
                        }
                        if let Some(saved_in) = self.lrgs[lidx as usize].reg {
                            sink.set_callee_saved(home, saved_in);
                        }
                    }

                    sink.end_safepoint(n);
                }
            }
        }
        Ok(())
    }
}
