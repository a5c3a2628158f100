//! Spill fixup: fold stack-resident operands into CISC-capable consumers.
//!
//! After Select, a spill copy whose value landed on the stack would normally
//! be emitted as a load. Targets with memory-operand instruction forms can do
//! better: the consumer reads `[frame_ptr + offset]` directly and the spill
//! copy goes dead. Node-to-register maps are preserved; use-def chains are
//! rewritten.

use crate::regalloc::Chaitin;
use crate::result::CodegenResult;

impl Chaitin<'_> {
    /// Rewrite CISC-capable operands whose input lives on the stack into
    /// frame-pointer-relative memory forms.
    pub fn fixup_spills(&mut self) -> CodegenResult<()> {
        // This function only does CISC spill work.
        if !self.isa.use_cisc_spill() {
            return Ok(());
        }
        let fp = match self.func.frame_ptr.expand() {
            Some(fp) => fp,
            None => return Ok(()),
        };

        let mut used_cisc = 0u32;
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            let mut j = 0;
            while j < self.func.blocks[block].nodes.len() {
                let n = self.func.blocks[block].nodes[j];
                j += 1;
                let inp = match self.func.node(n).cisc_operand {
                    Some(inp) => inp as usize,
                    None => continue,
                };
                let src = match self.func.input(n, inp) {
                    Some(src) => src,
                    None => continue,
                };
                let lidx = self.lrg_map.find_const_node(src);
                if lidx == 0 {
                    continue;
                }
                let lrg = &self.lrgs[lidx as usize];
                let hi = match lrg.reg {
                    Some(r) => r,
                    None => continue,
                };
                // Multi-slot values record the high register of the set.
                let lo = hi + 1 - u32::from(lrg.num_regs.max(1));
                if !self.isa.is_stack(lo) {
                    continue;
                }

                // Fold the stack slot into the instruction.
                let offset = self.isa.reg2offset(lo);
                self.func.node_mut(n).cisc_offset = Some(offset);
                self.func.set_input(n, inp, Some(fp));
                used_cisc += 1;

                // The spill copy feeding us may now be dead.
                if self.func.node(src).is_spill_copy() && self.func.out_count(src) == 0 {
                    if self.func.block_of(src) == Some(block) {
                        if let Some(pos) = self.func.find_node(block, src) {
                            if pos < j {
                                j -= 1;
                            }
                        }
                    }
                    self.func.find_remove(src);
                    self.func.disconnect_inputs(src);
                }
            }
        }
        log::debug!("fixup_spills: folded {} stack operands", used_cisc);
        Ok(())
    }
}
