//! Simplify and Select: the coloring half of the allocator.
//!
//! Simplify peels trivially-colorable live ranges off the interference graph
//! onto a stack; when only constrained ones remain it picks the cheapest
//! spill candidate and peels it anyway, flagged *at risk*. Select re-inserts
//! in reverse order, choosing a color per live range; at-risk live ranges may
//! find no color left and get a spill sentinel instead, which sends the
//! driver around the split loop again.
//!
//! The lo-degree worklists are FIFO (tail-insert, head-pop) so that freshly
//! exposed trivially-colorable live ranges color last; that ordering reuses
//! colors better than LIFO. The simplified stack itself is LIFO.

use crate::isa::{RegMask, RegUnit, SPILL_REG};
use crate::regalloc::liverange::LiveRange;
use crate::regalloc::Chaitin;

/// Is `reg` (an absolute register number) legal for `lrg` in `chunk`?
fn is_legal_reg(lrg: &LiveRange, reg: RegUnit, chunk: u32) -> bool {
    if reg >= chunk && reg < chunk + RegMask::CHUNK_SIZE && lrg.mask.contains(reg - chunk) {
        // Masks are cleared to aligned sets before color choice, so mask
        // membership proves the set below `reg` exists; only alignment of
        // the high register remains to be checked.
        if lrg.num_regs == 1 {
            return true;
        }
        let align = u32::from(lrg.num_regs) - 1;
        if (reg & align) == align {
            return true;
        }
    }
    false
}

impl Chaitin<'_> {
    fn lo_push_tail(&mut self, i: u32) {
        self.lrgs[i as usize].next = 0;
        if self.lo_degree == 0 {
            self.lo_degree = i;
        } else {
            self.lrgs[self.lo_degree_tail as usize].next = i;
        }
        self.lo_degree_tail = i;
    }

    fn lo_stk_push_tail(&mut self, i: u32) {
        self.lrgs[i as usize].next = 0;
        if self.lo_stk_degree == 0 {
            self.lo_stk_degree = i;
        } else {
            self.lrgs[self.lo_stk_degree_tail as usize].next = i;
        }
        self.lo_stk_degree_tail = i;
    }

    /// Build the three worklists: trivially colorable register-only live
    /// ranges, trivially colorable stack-capable ones, and everything else.
    pub fn cache_lrg_info(&mut self) {
        self.lo_degree = 0;
        self.lo_degree_tail = 0;
        self.lo_stk_degree = 0;
        self.lo_stk_degree_tail = 0;
        self.hi_degree = 0;
        self.simplified = 0;
        for i in 1..self.lrg_map.max_lrg_id() {
            let lrg = &self.lrgs[i as usize];
            // Low degree, dead, and must-spill live ranges simplify right
            // away.
            if lrg.lo_degree() || !lrg.alive() || lrg.must_spill {
                // Register-only lo-degree live ranges always get a
                // register, so let the ones that could also go to stack
                // color first, while their chances are good.
                let stackable = lrg.mask.is_all_stack()
                    || matches!(lrg.mask.find_last_elem(),
                                Some(hi) if self.isa.is_stack(hi));
                if stackable {
                    self.lo_stk_push_tail(i);
                } else {
                    self.lo_push_tail(i);
                }
            } else {
                // Hi-degree list is doubly linked for mid-list removal.
                let old_head = self.hi_degree;
                if old_head != 0 {
                    self.lrgs[old_head as usize].prev = i;
                }
                self.lrgs[i as usize].next = old_head;
                self.lrgs[i as usize].prev = 0;
                self.hi_degree = i;
            }
        }
    }

    /// Peel the graph down to nothing, recording the removal order.
    pub fn simplify(&mut self) {
        loop {
            // Pull from the trivially colorable lists while they last,
            // preferring live ranges that cannot fall back to stack.
            while self.lo_degree != 0 || self.lo_stk_degree != 0 {
                let lo;
                if self.lo_degree != 0 {
                    lo = self.lo_degree;
                    self.lo_degree = self.lrgs[lo as usize].next;
                    if self.lo_degree == 0 {
                        self.lo_degree_tail = 0;
                    }
                } else {
                    lo = self.lo_stk_degree;
                    self.lo_stk_degree = self.lrgs[lo as usize].next;
                    if self.lo_stk_degree == 0 {
                        self.lo_stk_degree_tail = 0;
                    }
                }

                // Onto the simplified stack.
                self.lrgs[lo as usize].next = self.simplified;
                self.simplified = lo;

                // If this one is at risk, bias its still-present neighbors
                // toward reusing whatever color it manages to get.
                if self.lrgs[lo as usize].at_risk {
                    let neighbors: Vec<usize> = self.ifg.neighbors(lo).iter().collect();
                    for datum in neighbors {
                        self.lrgs[datum].risk_bias = lo;
                    }
                }

                // Yank from the graph.
                let crate::regalloc::Chaitin { ref mut ifg, ref mut lrgs, .. } = *self;
                ifg.remove_node(lo, lrgs);
                let neighbors: Vec<usize> = self.ifg.neighbors(lo).iter().collect();
                for neighbor in neighbors {
                    // Degree only falls here and num_regs never changes, so
                    // each neighbor crosses the threshold at most once.
                    let n = &self.lrgs[neighbor];
                    if n.just_lo_degree() && !n.must_spill {
                        debug_assert!(
                            !self.ifg.is_yanked(neighbor as u32),
                            "cannot move to lo degree twice"
                        );
                        // Pull from the hi-degree list.
                        let prev = self.lrgs[neighbor].prev;
                        let next = self.lrgs[neighbor].next;
                        if prev != 0 {
                            self.lrgs[prev as usize].next = next;
                        } else {
                            self.hi_degree = next;
                        }
                        self.lrgs[next as usize].prev = prev;
                        self.lo_push_tail(neighbor as u32);
                    }
                }
            }

            if self.hi_degree == 0 {
                break;
            }

            // Nothing trivially colorable is left; choose a potential spill
            // victim, cheapest score first.
            let mut lo_score = self.hi_degree;
            let mut score = self.lrgs[lo_score as usize].score();
            let mut area = self.lrgs[lo_score as usize].area;
            let mut cost = self.lrgs[lo_score as usize].cost;
            let mut bound = self.lrgs[lo_score as usize].is_bound;

            let mut i = self.hi_degree;
            while i != 0 {
                debug_assert!(!self.ifg.is_yanked(i));
                // Removing a pair from a float live range can drop its
                // degree by 2, skipping the just-lo-degree stage; simplify
                // such a live range immediately.
                if self.lrgs[i as usize].lo_degree() {
                    lo_score = i;
                    break;
                }
                let iscore = self.lrgs[i as usize].score();
                let iarea = self.lrgs[i as usize].area;
                let icost = self.lrgs[i as usize].cost;
                let ibound = self.lrgs[i as usize].is_bound;

                // Lower score wins. Ties happen when everything in sight
                // has spilled before and the spill penalty swamps the low
                // bits, or when the area is zero; break them toward larger
                // area, then bound over unbound, then cheaper cost.
                if iscore < score
                    || (iscore == score
                        && iarea > area
                        && self.lrgs[lo_score as usize].was_spilled2)
                    || (iscore == score
                        && iarea == area
                        && ((ibound && !bound) || (ibound == bound && icost < cost)))
                {
                    lo_score = i;
                    score = iscore;
                    area = iarea;
                    cost = icost;
                    bound = ibound;
                }
                i = self.lrgs[i as usize].next;
            }

            // Pull the victim from the hi list and jam it on the lo list;
            // maybe it colors, maybe it spills. Only Select knows.
            let prev = self.lrgs[lo_score as usize].prev;
            let next = self.lrgs[lo_score as usize].next;
            if prev != 0 {
                self.lrgs[prev as usize].next = next;
            } else {
                self.hi_degree = next;
            }
            self.lrgs[next as usize].prev = prev;
            self.lrgs[lo_score as usize].at_risk = true;
            self.lrgs[lo_score as usize].next = 0;
            self.lo_degree = lo_score;
            self.lo_degree_tail = lo_score;
            log::trace!(
                "simplify: spill candidate L{} score {:e} area {:e}",
                lo_score,
                score,
                area
            );
        }
    }

    /// Find the first aligned register set in `mask` for `lrg`, handling the
    /// scalable-vector case where the stack-resident size differs from the
    /// nominal register size.
    fn find_first_set(&self, lrg: &LiveRange, mask: RegMask, chunk: u32) -> Option<RegUnit> {
        let assigned = mask.find_first_set(lrg.num_regs);
        if lrg.is_scalable
            && self.isa.supports_scalable_vector()
            && lrg.is_vector
        {
            // A hardware register is fine as-is.
            if chunk == 0 {
                if let Some(reg) = assigned {
                    if !self.isa.is_stack(reg) {
                        return Some(reg);
                    }
                }
            }
            let num_regs = lrg.scalable_slots;
            if num_regs == u32::from(lrg.num_regs) {
                return assigned;
            }
            // The mask was cleared to nominal-size sets; find an adjacent
            // run of the actual physical size instead.
            let mut mask = mask;
            let mut assigned = mask.find_first_set(lrg.num_regs);
            while let Some(reg) = assigned {
                if !RegMask::can_represent(reg) {
                    break;
                }
                if mask.contains_set(reg, num_regs as u16) {
                    return Some(reg);
                }
                mask.remove(reg + 1 - num_regs.min(reg + 1));
                mask.clear_to_sets(lrg.num_regs);
                assigned = mask.find_first_set(lrg.num_regs);
            }
            return None;
        }
        assigned
    }

    /// Choose a color using the biasing heuristics.
    fn bias_color(&mut self, lidx: u32, chunk: u32) -> Option<RegUnit> {
        // First preference: a color already taken by a neighbor of the
        // at-risk live range we were biased toward; overlapping with it
        // costs nothing and leaves its other choices open.
        let risk_bias = self.lrgs[lidx as usize].risk_bias;
        let risk_lrg = if risk_bias != 0 {
            self.lrg_map.find(risk_bias)
        } else {
            0
        };
        if risk_lrg != 0 {
            let neighbors: Vec<usize> = self.ifg.neighbors(risk_lrg).iter().collect();
            for datum in neighbors {
                if let Some(reg) = self.lrgs[datum].reg {
                    if is_legal_reg(&self.lrgs[lidx as usize], reg, chunk) {
                        return Some(reg);
                    }
                }
            }
        }

        // Second preference: share a color with a copy-related live range.
        let copy_bias = self.lrgs[lidx as usize].copy_bias;
        let copy_lrg = if copy_bias != 0 {
            self.lrg_map.find(copy_bias)
        } else {
            0
        };
        if copy_lrg != 0 {
            if !self.ifg.is_yanked(copy_lrg) {
                // It has a color; take it if we may.
                if let Some(reg) = self.lrgs[copy_lrg as usize].reg {
                    if is_legal_reg(&self.lrgs[lidx as usize], reg, chunk) {
                        return Some(reg);
                    }
                }
            } else if chunk == 0 {
                // Not yet colored; choose something legal for both.
                let mut tempmask = self.lrgs[lidx as usize].mask;
                tempmask.intersect(&self.lrgs[copy_lrg as usize].mask);
                tempmask.clear_to_sets(self.lrgs[lidx as usize].num_regs);
                if let Some(reg) =
                    self.find_first_set(&self.lrgs[lidx as usize].clone(), tempmask, chunk)
                {
                    return Some(reg);
                }
            }
        }

        let lrg = &self.lrgs[lidx as usize];
        if lrg.is_vector || lrg.num_regs == 2 {
            return self
                .find_first_set(&lrg.clone(), lrg.mask, chunk)
                .map(|reg| reg + chunk);
        }

        // Alternate between the first and second legal register, which
        // keeps a just-freed register from being grabbed again immediately
        // and lets post-allocation copy removal elide far more moves.
        let reg = self.lrgs[lidx as usize].mask.find_first_elem();
        self.alternate += 1;
        if self.alternate & 1 == 1 {
            if let Some(first) = reg {
                let mut mask = self.lrgs[lidx as usize].mask;
                mask.remove(first);
                if let Some(second) = mask.find_first_elem() {
                    if !self.isa.is_stack(second) {
                        return Some(second + chunk);
                    }
                }
            }
        }
        reg.map(|r| r + chunk)
    }

    /// Choose a color in the current chunk, or `None` when the mask offers
    /// nothing.
    fn choose_color(&mut self, lidx: u32, chunk: u32) -> Option<RegUnit> {
        let lrg = &self.lrgs[lidx as usize];
        if lrg.num_regs == 1 || !lrg.fat_proj {
            // Aligned, adjacent sets can be biased.
            return self.bias_color(lidx, chunk);
        }
        debug_assert!(!lrg.is_vector, "vectors are never kill sets");
        debug_assert!(lrg.num_regs >= 2, "dead live ranges do not color");
        debug_assert!(chunk == 0, "kill sets color in the first chunk");
        // Kill sets take exactly their mask; report the highest element.
        lrg.mask.find_last_elem()
    }

    /// Color the graph by re-inserting live ranges in reverse simplify
    /// order. Returns the number of live ranges that found no color.
    pub fn select(&mut self) -> u32 {
        let mut spill_count = 0u32;
        self.max_reg = 0;
        while self.simplified != 0 {
            let lidx = self.simplified;
            self.simplified = self.lrgs[lidx as usize].next;

            {
                let crate::regalloc::Chaitin { ref mut ifg, ref mut lrgs, .. } = *self;
                ifg.re_insert(lidx, lrgs);
            }
            if !self.lrgs[lidx as usize].alive() {
                continue;
            }
            // Capture stack-capability before the mask gets hacked.
            let is_allstack = self.lrgs[lidx as usize].mask.is_all_stack();

            let mut chunk = 0u32;
            loop {
                // Remove the colors of already-colored neighbors in this
                // chunk. Neighbors in other chunks (including the spill
                // sentinels) can't conflict here.
                let neighbors: Vec<usize> = self.ifg.neighbors(lidx).iter().collect();
                for neighbor in neighbors {
                    if let Some(nreg) = self.lrgs[neighbor].reg {
                        if nreg >= chunk && nreg < chunk + RegMask::CHUNK_SIZE {
                            let nmask = self.lrgs[neighbor].mask;
                            self.lrgs[lidx as usize].mask.subtract(&nmask);
                        }
                    }
                }

                // Aligned sets need aligned masks.
                let (num_regs, fat_proj) = {
                    let l = &self.lrgs[lidx as usize];
                    (l.num_regs, l.fat_proj)
                };
                if num_regs > 1 && !fat_proj {
                    self.lrgs[lidx as usize].mask.clear_to_sets(num_regs);
                }

                let reg = self.choose_color(lidx, chunk);

                match reg {
                    None if is_allstack => {
                        // Out of colors here, but any stack slot will do:
                        // roll over into the next stack chunk and retry.
                        chunk += RegMask::CHUNK_SIZE;
                        self.lrgs[lidx as usize].mask = RegMask::all();
                        continue;
                    }
                    Some(reg) => {
                        self.lrgs[lidx as usize].reg = Some(reg);
                        if reg >= self.max_reg {
                            self.max_reg = reg + 1;
                        }
                        // Fold back into chunk-relative space and restrict
                        // the mask to exactly the chosen set, so neighbors
                        // subtract just what we took.
                        let rel = reg - chunk;
                        let lrg = &mut self.lrgs[lidx as usize];
                        if lrg.num_regs == 1 || !lrg.fat_proj {
                            let mut n_regs = u32::from(lrg.num_regs);
                            if lrg.is_scalable && reg >= self.isa.stack_base() {
                                n_regs = lrg.scalable_slots;
                            }
                            lrg.mask = RegMask::empty();
                            // High register plus the rest of the set below.
                            for i in 0..n_regs {
                                lrg.mask.insert(rel - i);
                            }
                        }
                        // Kill sets keep their mask; it is the color.
                        log::trace!("select: L{} gets reg {}", lidx, reg);
                    }
                    None => {
                        debug_assert!(self.lrgs[lidx as usize].alive());
                        // No color and no stack fallback: hand out a spill
                        // sentinel. Keep the mask info for the splitter.
                        self.lrgs[lidx as usize].reg = Some(SPILL_REG + spill_count);
                        spill_count += 1;
                        log::trace!("select: L{} spills", lidx);
                    }
                }
                break;
            }
        }
        spill_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_reg_alignment() {
        let mut lrg = LiveRange::new();
        lrg.num_regs = 2;
        lrg.mask = RegMask::empty();
        lrg.mask.insert(0);
        lrg.mask.insert(1);
        // Pairs are identified by their (odd-aligned) high register.
        assert!(is_legal_reg(&lrg, 1, 0));
        assert!(!is_legal_reg(&lrg, 0, 0));
        // Wrong chunk.
        assert!(!is_legal_reg(&lrg, 1, RegMask::CHUNK_SIZE));
    }
}
