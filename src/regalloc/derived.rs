//! Base-pointer stretching across safepoints.
//!
//! A derived pointer (a heap reference at a non-zero offset into its object)
//! is only usable by the collector together with its base. Base pointers are
//! naturally live up to where the derived value is *made*, not to where it is
//! *used*; this pass visits every safepoint, finds each live derived pointer,
//! discovers its base (recursively through φs, synthesizing base-φs where the
//! arms disagree), and appends the (derived, base) pair to the safepoint's
//! inputs. If that stretched a base across a block boundary, liveness is
//! stale and the driver must recompute it.

use cranelift_entity::SecondaryMap;

use crate::ir::{Node, NodeData, NodeKind, ValueType};
use crate::isa::RegClass;
use crate::packed_option::PackedOption;
use crate::regalloc::Chaitin;
use crate::result::{CodegenError, CodegenResult};

impl Chaitin<'_> {
    /// Recursively discover the base for a derived value. Easy for
    /// machine add-pointer nodes, which carry their base input; φs need
    /// recursion and sometimes a synthesized base-φ.
    fn find_base_for_derived(
        &mut self,
        derived_base_map: &mut SecondaryMap<Node, PackedOption<Node>>,
        derived: Node,
        maxlrg: &mut u32,
    ) -> CodegenResult<Node> {
        if let Some(base) = derived_base_map[derived].expand() {
            return Ok(base);
        }

        // Values at offset zero (and non-oops) are their own base. Pointers
        // derived from null exist along statically dead paths the optimizer
        // could not prove dead; they get the shared null base below.
        let ty = self.func.node(derived).ty;
        if !ty.is_derived_oop() {
            derived_base_map[derived] = Some(derived).into();
            return Ok(derived);
        }

        // Derived is null+offset? The base is null, shared across the whole
        // function so constants don't multiply live ranges.
        if self.func.node(derived).is_con() {
            let base = match self.func.mach_null.expand() {
                Some(base) => base,
                None => {
                    let mut data = NodeData::new(NodeKind::Con);
                    data.ty = ValueType::OopPtr { offset: 0 };
                    data.ideal = Some(RegClass::Ptr);
                    data.rematerialize = true;
                    data.out_mask = *self.isa.reg_mask(RegClass::Ptr);
                    data.con = Some(crate::ir::ConstData { rule: 0, bits: 0 });
                    let base = self.func.create_node(data);
                    let start = self.func.layout[0];
                    self.func.insert_node(start, 0, base);
                    self.func.mach_null = Some(base).into();
                    base
                }
            };
            if self.lrg_map.live_range_id(base) == 0 {
                self.new_lrg(base, *maxlrg);
                *maxlrg += 1;
            }
            derived_base_map[derived] = Some(base).into();
            return Ok(base);
        }

        // Machine nodes carry their base input directly.
        if !self.func.node(derived).is_phi() {
            let base_input = self
                .func
                .node(derived)
                .base_input
                .ok_or(CodegenError::DerivedWithoutBase)?;
            let base = self
                .func
                .input(derived, base_input as usize)
                .ok_or(CodegenError::DerivedWithoutBase)?;
            derived_base_map[derived] = Some(base).into();
            return Ok(base);
        }

        // Recursively find bases for the φ inputs; a φ is only needed when
        // they disagree.
        let req = self.func.num_inputs(derived);
        let first = self
            .func
            .input(derived, 1)
            .ok_or(CodegenError::DerivedWithoutBase)?;
        let mut base = self.find_base_for_derived(derived_base_map, first, maxlrg)?;
        let mut all_same = true;
        for i in 2..req {
            let input = self
                .func
                .input(derived, i)
                .ok_or(CodegenError::DerivedWithoutBase)?;
            if base != self.find_base_for_derived(derived_base_map, input, maxlrg)? {
                all_same = false;
                break;
            }
        }
        if all_same {
            derived_base_map[derived] = Some(base).into();
            return Ok(base);
        }

        // Merge the bases with a φ of their own.
        let mut phi_data = NodeData::new(NodeKind::Phi);
        phi_data.ty = ValueType::OopPtr { offset: 0 };
        phi_data.ideal = Some(RegClass::Ptr);
        phi_data.out_mask = *self.isa.spill_mask(RegClass::Ptr);
        phi_data.inputs.push(PackedOption::default());
        let base_phi = self.func.create_node(phi_data);
        for i in 1..req {
            let input = self
                .func
                .input(derived, i)
                .ok_or(CodegenError::DerivedWithoutBase)?;
            let b = self.find_base_for_derived(derived_base_map, input, maxlrg)?;
            self.func.set_input(base_phi, i, Some(b));
        }

        // Reuse an existing φ in the block if one already merges exactly
        // these bases (different nulls are still the same base).
        let block = self
            .func
            .block_of(derived)
            .expect("derived value not placed in a block");
        let mut chosen = base_phi;
        let phi_end = self.func.first_non_phi(block);
        'search: for i in 0..phi_end {
            let phi = self.func.blocks[block].nodes[i];
            for j in 1..req {
                let a = self.func.input(phi, j);
                let b = self.func.input(base_phi, j);
                let both_con = match (a, b) {
                    (Some(a), Some(b)) => self.func.node(a).is_con() && self.func.node(b).is_con(),
                    _ => false,
                };
                if a != b && !both_con {
                    continue 'search;
                }
            }
            chosen = phi;
            break;
        }
        if chosen == base_phi {
            self.func.insert_node(block, phi_end, base_phi);
            self.new_lrg(base_phi, *maxlrg);
            *maxlrg += 1;
        } else {
            self.func.disconnect_inputs(base_phi);
        }
        base = chosen;

        derived_base_map[derived] = Some(base).into();
        Ok(base)
    }

    /// At each safepoint, append (derived, base) input pairs for every
    /// derived pointer live across it, so the records built later can tell
    /// the collector where both halves live. Returns whether liveness went
    /// stale.
    pub fn stretch_base_pointer_live_ranges(&mut self) -> CodegenResult<bool> {
        let mut must_recompute = false;
        let mut maxlrg = self.lrg_map.max_lrg_id();
        let mut derived_base_map: SecondaryMap<Node, PackedOption<Node>> = SecondaryMap::new();

        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            // Deep copy: the coalescing pass right after this still needs
            // the original live-out bits.
            let mut liveout = self.live.live_out(block).clone();

            for j in (0..self.func.blocks[block].nodes.len()).rev() {
                let n = self.func.blocks[block].nodes[j];

                let lidx = self.lrg_map.live_range_id(n);
                // Ignore the occasional brand-new live range.
                if lidx != 0 && lidx < self.lrg_map.max_lrg_id() {
                    liveout.remove(lidx as usize);
                    // Copies do not define a new value.
                    if let Some(idx) = self.func.node(n).is_copy() {
                        if let Some(src) = self.func.input(n, idx) {
                            let src_lrg = self.lrg_map.live_range_id(src);
                            liveout.remove(src_lrg as usize);
                        }
                    }
                }

                if self.func.node(n).is_safepoint() && !liveout.is_empty() {
                    // Scan for live derived pointers. We are still in SSA
                    // here, so a live range's unique def is its reaching
                    // def.
                    let live_now: Vec<usize> = liveout.iter().collect();
                    for neighbor in live_now {
                        let derived = match self.lrgs[neighbor].single_def() {
                            Some(d) => d,
                            None => continue,
                        };
                        if !self.func.node(derived).ty.is_derived_oop() {
                            continue;
                        }
                        let base =
                            self.find_base_for_derived(&mut derived_base_map, derived, &mut maxlrg)?;

                        // Append the pair of reaching defs.
                        if self.func.node(n).oopoff.is_none() {
                            let off = self.func.num_inputs(n) as u32;
                            self.func.node_mut(n).oopoff = Some(off);
                        }
                        self.func.add_input(n, derived);
                        self.func.add_input(n, base);

                        // If the base was not already live here, we just
                        // stretched it across a block boundary and the
                        // global live info is wrong.
                        let base_lrg = self.lrg_map.live_range_id(base);
                        if (base_lrg >= self.lrg_map.max_lrg_id()
                            || !liveout.contains(base_lrg as usize))
                            && base_lrg > 0
                            && self.func.block_of(base) != Some(block)
                        {
                            must_recompute = true;
                        }
                    }
                }

                // Make all inputs live; φ uses come from the prior block.
                if !self.func.node(n).is_phi() {
                    for k in 1..self.func.num_inputs(n) {
                        if let Some(input) = self.func.input(n, k) {
                            let l = self.lrg_map.live_range_id(input);
                            if l != 0 && l < self.lrg_map.max_lrg_id() {
                                liveout.insert(l as usize);
                            }
                        }
                    }
                }
            }
        }

        // New live ranges mean new liveness.
        if maxlrg != self.ifg.max_lrg() {
            must_recompute = true;
        }
        self.lrg_map.set_max_lrg_id(maxlrg);

        Ok(must_recompute)
    }
}
