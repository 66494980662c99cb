//! Assign registers by walking reference positions in location order.

use super::{
    Lsra, varloc_of,
    interval::{IntervalIdx, IntervalKind, RefIdx, RefOwner, RefType},
};
use crate::{
    CompilationError,
    config::BlockBoundary,
    ir::{BlockIdx, VarLoc},
    log::stats::Stat,
    nodeinfo::{Fixup, SpillLoc},
    target::{Reg, RegMask},
};
use smallvec::SmallVec;
use std::cmp::Reverse;

// Register selection heuristics, in decreasing order of importance.
/// The register the interval was last in.
const THIS_ASSIGNED: u32 = 0x40;
/// No other interval requires the register before the interval's next reference.
const COVERS: u32 = 0x20;
const OWN_PREF: u32 = 0x10;
const RELATED_PREF: u32 = 0x08;
/// Callee saved for intervals live across a kill, caller saved otherwise.
const CALLER_CALLEE: u32 = 0x04;
/// Not yet used in the current block.
const UNASSIGNED: u32 = 0x02;

impl Lsra<'_> {
    pub(super) fn allocate_regs(&mut self) -> Result<(), CompilationError> {
        for (bidx, range) in self.block_refs.clone() {
            self.start_block(bidx);
            for ridx in range.map(RefIdx::new) {
                self.allocate_ref(ridx)?;
            }
            self.end_block(bidx);
        }
        Ok(())
    }

    fn start_block(&mut self, bidx: BlockIdx) {
        for r in self.regs.iter_mut() {
            debug_assert!(r.assigned.is_none());
            r.busy_until = None;
            r.used_in_block = false;
        }
        // Temporaries don't live across blocks, so neither do their spill temps.
        for slots in &mut self.slots {
            slots.iter_mut().for_each(|x| *x = Some(0));
        }
        let preds = self.m.blocks[bidx]
            .preds
            .iter()
            .copied()
            .filter(|x| self.allocated[x.index()])
            .collect::<SmallVec<[BlockIdx; 4]>>();
        self.cur_pred = match self.config.stress.block_boundary {
            BlockBoundary::Pred => self.heaviest(&preds),
            BlockBoundary::Layout => match bidx.index().checked_sub(1).map(BlockIdx::new) {
                Some(prev) if preds.contains(&prev) => Some(prev),
                _ => self.heaviest(&preds),
            },
            BlockBoundary::Rotate => {
                if preds.is_empty() {
                    None
                } else {
                    self.rotate += 1;
                    Some(preds[self.rotate % preds.len()])
                }
            }
        };
    }

    /// The predecessor with the highest weight, preferring earlier predecessors.
    fn heaviest(&self, preds: &[BlockIdx]) -> Option<BlockIdx> {
        preds.iter().copied().fold(None, |best, p| match best {
            Some(b) if self.m.blocks[b].weight >= self.m.blocks[p].weight => Some(b),
            _ => Some(p),
        })
    }

    fn end_block(&mut self, bidx: BlockIdx) {
        for reg in self.regs.indices() {
            if let Some(iidx) = self.regs[reg].assigned {
                assert!(
                    self.intervals[iidx].local().is_some(),
                    "{:?} is live at the end of bb{}",
                    self.intervals[iidx].kind,
                    bidx.index()
                );
                self.unassign(reg);
            }
        }
        self.allocated.set(bidx.index(), true);
    }

    fn allocate_ref(&mut self, ridx: RefIdx) -> Result<(), CompilationError> {
        let ty = self.refs[ridx].ty;
        match self.refs[ridx].owner {
            RefOwner::Block(_) => (),
            RefOwner::Reg(reg) => match ty {
                RefType::FixedReg => {
                    // The register must be vacated for the interval that requires it.
                    if let Some(occ) = self.regs[reg].assigned {
                        if Some(occ) != self.refs[ridx].fixed_for {
                            self.evict(occ)?;
                        }
                    }
                }
                RefType::Kill => {
                    if let Some(occ) = self.regs[reg].assigned {
                        // A node's internal registers are dead once it has executed.
                        if !matches!(self.intervals[occ].kind, IntervalKind::Internal(_)) {
                            self.evict(occ)?;
                        }
                    }
                }
                _ => panic!("{ty} reference position for a register"),
            },
            RefOwner::Interval(iidx) => {
                match ty {
                    RefType::Use => self.alloc_use(ridx, iidx)?,
                    RefType::Def => self.alloc_def(ridx, iidx)?,
                    RefType::LiveOut => {
                        let Some(lidx) = self.intervals[iidx].local() else {
                            panic!()
                        };
                        let loc = self.intervals[iidx].reg.map_or(VarLoc::Stack, VarLoc::Reg);
                        let bidx = self.refs[ridx].block;
                        self.var_out[bidx].push((lidx, loc));
                    }
                    _ if ty.is_block_start() => self.place_at_block_start(ridx, iidx),
                    _ => panic!("{ty} reference position for an interval"),
                }
                self.intervals[iidx].cursor += 1;
            }
        }
        Ok(())
    }

    fn place_at_block_start(&mut self, ridx: RefIdx, iidx: IntervalIdx) {
        let Some(lidx) = self.intervals[iidx].local() else {
            panic!()
        };
        let rp = &self.refs[ridx];
        let loc = match rp.ty {
            RefType::ParamDef => match self.param_regs[lidx] {
                Some(reg) if rp.candidates.contains(reg) && self.is_free(reg, rp.loc) => {
                    VarLoc::Reg(reg)
                }
                // The parameter is stored to its home on entry.
                _ => VarLoc::Stack,
            },
            RefType::LiveIn => self
                .cur_pred
                .and_then(|p| varloc_of(&self.var_out[p], lidx))
                .unwrap_or(VarLoc::Stack),
            _ => VarLoc::Stack,
        };
        let bidx = rp.block;
        if let VarLoc::Reg(reg) = loc {
            self.assign(reg, iidx);
            self.refs[ridx].reg = Some(reg);
            self.intervals[iidx].last_in_reg = Some(ridx);
        }
        self.intervals[iidx].stack_valid = loc == VarLoc::Stack;
        self.var_in[bidx].push((lidx, loc));
    }

    fn alloc_use(&mut self, ridx: RefIdx, iidx: IntervalIdx) -> Result<(), CompilationError> {
        if let IntervalKind::Internal(_) = self.intervals[iidx].kind {
            // The last use of an internal register, once its node has executed.
            let reg = self.intervals[iidx].reg;
            self.refs[ridx].reg = reg;
            if let Some(reg) = reg {
                self.unassign(reg);
            }
            return Ok(());
        }
        let rp = &self.refs[ridx];
        let (loc, last_use, delay_free, reg_optional) =
            (rp.loc, rp.last_use, rp.delay_free, rp.reg_optional);
        let mut cands = self.usable(iidx, rp.candidates, loc);
        if delay_free {
            cands = self.usable(iidx, cands, loc + 1);
        }
        let stress = self.config.stress;
        if stress.always_insert_reload && self.intervals[iidx].stack_valid {
            if let Some(reg) = self.intervals[iidx].reg {
                self.unassign(reg);
            }
        }

        let interval = &self.intervals[iidx];
        let (cur, kind, stack_loc, is_constant) = (
            interval.reg,
            interval.kind,
            interval.stack_loc(),
            interval.is_constant,
        );
        let (reg, fixup) = match cur {
            Some(reg) if cands.contains(reg) => (Some(reg), Fixup::None),
            Some(reg) => {
                let to = self.choose_or_evict(iidx, cands, loc)?;
                if last_use && self.regs[reg].busy_until.is_none_or(|b| b < loc) {
                    self.stats.inc(Stat::Move);
                    self.unassign(reg);
                    self.assign(to, iidx);
                    (Some(to), Fixup::Move(reg))
                } else {
                    // The value stays in `reg` and is also copied to `to` for this use.
                    self.stats.inc(Stat::Copy);
                    (Some(to), Fixup::Copy(reg))
                }
            }
            None => {
                let use_mem = reg_optional
                    && !is_constant
                    && !stress.always_insert_reload
                    && stack_loc.is_some()
                    && (stress.reg_optional_no_alloc
                        || !cands.iter().any(|r| self.is_free(r, loc)));
                if use_mem {
                    self.stats.inc(Stat::MemUse);
                    self.refs[ridx].mem = stack_loc;
                    (None, Fixup::None)
                } else {
                    let fixup = if is_constant {
                        self.stats.inc(Stat::Remat);
                        Fixup::Remat
                    } else {
                        let Some(stack_loc) = stack_loc else {
                            panic!("{kind:?} is neither in a register nor spilled")
                        };
                        self.stats.inc(Stat::Reload);
                        Fixup::Reload(stack_loc)
                    };
                    let to = self.choose_or_evict(iidx, cands, loc)?;
                    self.assign(to, iidx);
                    (Some(to), fixup)
                }
            }
        };

        self.refs[ridx].reg = reg;
        self.refs[ridx].fixup = fixup;
        if let Some(reg) = reg {
            self.busy(reg, if delay_free { loc + 1 } else { loc });
            self.intervals[iidx].last_in_reg = Some(ridx);
        }
        if last_use {
            if let Some(reg) = self.intervals[iidx].reg {
                self.unassign(reg);
            }
            if let (IntervalKind::Temp { .. }, Some(SpillLoc::Temp { kind, slot })) =
                (self.intervals[iidx].kind, self.intervals[iidx].slot)
            {
                self.slots[kind as usize][slot as usize] = Some(loc);
            }
        }
        Ok(())
    }

    fn alloc_def(&mut self, ridx: RefIdx, iidx: IntervalIdx) -> Result<(), CompilationError> {
        let loc = self.refs[ridx].loc;
        if let Some(reg) = self.intervals[iidx].reg {
            self.unassign(reg);
        }
        self.intervals[iidx].stack_valid = false;
        let internal = matches!(self.intervals[iidx].kind, IntervalKind::Internal(_));
        let mut cands = self.usable(iidx, self.refs[ridx].candidates, loc);
        if internal {
            cands = self.usable(iidx, cands, loc + 1);
        }
        let reg = self.choose_or_evict(iidx, cands, loc)?;
        self.assign(reg, iidx);
        self.refs[ridx].reg = Some(reg);
        self.intervals[iidx].last_in_reg = Some(ridx);
        // Internal registers are live until their node has defined its values.
        self.busy(reg, if internal { loc + 1 } else { loc });

        if self.next_ref_loc(iidx, loc + 1).is_none() {
            // Never used.
            self.unassign(reg);
        } else if self.config.stress.spill_always && !internal && !self.intervals[iidx].is_constant
        {
            self.spill(iidx)?;
            self.unassign(reg);
        }
        Ok(())
    }

    /// Remove from `cands` the registers another interval requires at `loc`, unless that would
    /// leave no registers.
    fn usable(&self, iidx: IntervalIdx, cands: RegMask, loc: u32) -> RegMask {
        let usable = cands
            .iter()
            .filter(|r| !self.reserved(*r, loc, iidx))
            .fold(RegMask::EMPTY, |m, r| m.with(r));
        if usable.is_empty() { cands } else { usable }
    }

    /// Does an interval other than `iidx` require `reg` at `loc`?
    fn reserved(&self, reg: Reg, loc: u32, iidx: IntervalIdx) -> bool {
        let fixed = &self.fixed_locs[reg];
        let start = fixed.partition_point(|x| x.0 < loc);
        fixed[start..]
            .iter()
            .take_while(|x| x.0 == loc)
            .any(|x| x.1.is_some_and(|y| y != iidx))
    }

    fn is_free(&self, reg: Reg, loc: u32) -> bool {
        let r = &self.regs[reg];
        r.assigned.is_none() && r.busy_until.is_none_or(|b| b < loc)
    }

    fn busy(&mut self, reg: Reg, until: u32) {
        let r = &mut self.regs[reg];
        r.busy_until = Some(r.busy_until.map_or(until, |b| b.max(until)));
        r.used_in_block = true;
    }

    /// The location of `iidx`'s next use, definition, or live-out reference at or after `from`.
    fn next_ref_loc(&self, iidx: IntervalIdx, from: u32) -> Option<u32> {
        let interval = &self.intervals[iidx];
        interval.refs[interval.cursor..]
            .iter()
            .map(|x| &self.refs[*x])
            .find(|x| {
                x.loc >= from && matches!(x.ty, RefType::Use | RefType::Def | RefType::LiveOut)
            })
            .map(|x| x.loc)
    }

    /// Choose the best free register in `cands` for `iidx` at `loc`.
    fn choose_reg(&self, iidx: IntervalIdx, cands: RegMask, loc: u32) -> Option<Reg> {
        let stress = self.config.stress;
        let interval = &self.intervals[iidx];
        let end = self.next_ref_loc(iidx, loc + 1).unwrap_or(loc + 1);
        let related = interval.related.map(|x| &self.intervals[x]);
        let mut best: Option<(u32, Reg)> = None;
        for reg in cands.iter().filter(|x| self.is_free(*x, loc)) {
            let mut score = 0;
            if interval.prev_reg == Some(reg) {
                score |= THIS_ASSIGNED;
            }
            let fixed = &self.fixed_locs[reg];
            let start = fixed.partition_point(|x| x.0 <= loc);
            let covers = !fixed[start..]
                .iter()
                .take_while(|x| x.0 <= end)
                .any(|x| x.1 != Some(iidx));
            if covers != stress.select_nearest {
                score |= COVERS;
            }
            if interval.pref.contains(reg) {
                score |= OWN_PREF;
            }
            if related.is_some_and(|x| {
                x.reg.or(x.prev_reg) == Some(reg) || x.pref.contains(reg)
            }) {
                score |= RELATED_PREF;
            }
            let callee = self.target.callee_saved.contains(reg);
            if (callee == interval.crosses_kill) != stress.reverse_caller_callee {
                score |= CALLER_CALLEE;
            }
            if !self.regs[reg].used_in_block {
                score |= UNASSIGNED;
            }
            let better = match best {
                None => true,
                Some((b, _)) if stress.reverse_heuristics => score < b,
                Some((b, _)) => score > b,
            };
            if better {
                best = Some((score, reg));
            }
        }
        best.map(|(_, reg)| reg)
    }

    /// Find a register in `cands` occupied by an interval that could be evicted at `loc`,
    /// preferring intervals whose value is already in memory, then those referenced furthest in
    /// the future.
    fn find_victim(&self, iidx: IntervalIdx, cands: RegMask, loc: u32) -> Option<(Reg, IntervalIdx)> {
        cands
            .iter()
            .filter_map(|r| {
                let state = &self.regs[r];
                match state.assigned {
                    Some(occ) if occ != iidx && state.busy_until.is_none_or(|b| b < loc) => {
                        Some((r, occ))
                    }
                    _ => None,
                }
            })
            .min_by_key(|(_, occ)| {
                let i = &self.intervals[*occ];
                (
                    u8::from(!(i.stack_valid || i.is_constant)),
                    Reverse(self.next_ref_loc(*occ, loc).unwrap_or(u32::MAX)),
                )
            })
    }

    /// Choose a register in `cands` for `iidx` at `loc`, evicting another interval if none is
    /// free. If no candidate can be had, any allocatable register of the right class is used.
    fn choose_or_evict(
        &mut self,
        iidx: IntervalIdx,
        cands: RegMask,
        loc: u32,
    ) -> Result<Reg, CompilationError> {
        let class = self.intervals[iidx].class;
        let all = self.usable(iidx, self.target.allocatable(class), loc);
        for cands in [cands, all] {
            if let Some(reg) = self.choose_reg(iidx, cands, loc) {
                return Ok(reg);
            }
            if let Some((reg, occ)) = self.find_victim(iidx, cands, loc) {
                self.evict(occ)?;
                return Ok(reg);
            }
        }
        Err(CompilationError::InternalError(format!(
            "no {class} register available for {:?} at {loc}",
            self.intervals[iidx].kind
        )))
    }

    fn assign(&mut self, reg: Reg, iidx: IntervalIdx) {
        debug_assert!(self.regs[reg].assigned.is_none());
        self.regs[reg].assigned = Some(iidx);
        self.regs[reg].used_in_block = true;
        self.intervals[iidx].reg = Some(reg);
    }

    fn unassign(&mut self, reg: Reg) {
        if let Some(iidx) = self.regs[reg].assigned.take() {
            let interval = &mut self.intervals[iidx];
            interval.reg = None;
            interval.prev_reg = Some(reg);
        }
    }

    fn evict(&mut self, iidx: IntervalIdx) -> Result<(), CompilationError> {
        self.spill(iidx)?;
        if let Some(reg) = self.intervals[iidx].reg {
            self.unassign(reg);
        }
        Ok(())
    }

    /// Ensure that `iidx`'s value is in its stack location, storing it from the register it was
    /// last in if necessary. Constants are never stored.
    fn spill(&mut self, iidx: IntervalIdx) -> Result<(), CompilationError> {
        let interval = &self.intervals[iidx];
        if interval.is_constant || interval.stack_valid {
            return Ok(());
        }
        let Some(at) = interval.last_in_reg else {
            panic!("{:?} was never in a register", interval.kind)
        };
        let store_loc = self.refs[at].loc;
        let loc = match interval.kind {
            IntervalKind::Local(lidx) => SpillLoc::Home(lidx),
            IntervalKind::Temp { .. } => {
                let kind = interval.slot_kind;
                let slots = &mut self.slots[kind as usize];
                let slot = match slots
                    .iter()
                    .position(|x| x.is_some_and(|freed| freed < store_loc))
                {
                    Some(i) => i,
                    None => {
                        slots.push(None);
                        slots.len() - 1
                    }
                };
                slots[slot] = None;
                let n = u32::try_from(slots.len()).unwrap();
                if n > self.spill_slots[kind as usize] {
                    self.spill_slots[kind as usize] = n;
                    if usize::try_from(n).unwrap() > self.config.max_spill_slots {
                        return Err(CompilationError::ResourceExhausted(
                            format!(
                                "'{}' needs more than {} {kind} spill temps",
                                self.m.name, self.config.max_spill_slots
                            )
                            .into(),
                        ));
                    }
                }
                let loc = SpillLoc::Temp {
                    kind,
                    slot: u32::try_from(slot).unwrap(),
                };
                self.intervals[iidx].slot = Some(loc);
                loc
            }
            IntervalKind::Internal(_) => panic!("internal registers can't be spilled"),
        };
        let rp = &mut self.refs[at];
        if rp.ty.is_block_start() {
            // No node has touched the local yet in this block: it is stored on entry.
            let (Some(lidx), Some(reg)) = (self.intervals[iidx].local(), rp.reg) else {
                panic!()
            };
            self.entry_spills.push((rp.block, lidx, reg));
        } else {
            rp.spill_after = Some(loc);
        }
        self.intervals[iidx].stack_valid = true;
        self.stats.inc(Stat::Spill);
        Ok(())
    }
}
