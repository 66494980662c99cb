//! Build the intervals and reference positions of a lowered method.

use super::{
    Lsra,
    interval::{Interval, IntervalIdx, IntervalKind, RefIdx, RefOwner, RefPosition, RefType},
};
use crate::{
    config::Traversal,
    ir::{BlockIdx, LclIdx, NodeIdx, NodeKind, Ty},
    target::{Reg, RegClass, RegMask},
};
use index_vec::IndexVec;
use smallvec::{SmallVec, smallvec};
use std::ops::Range;
use strum::EnumCount;
use vob::Vob;

/// A register read by a node.
struct Use {
    iidx: IntervalIdx,
    /// The node whose value is read.
    src: NodeIdx,
    candidates: RegMask,
    delay_free: bool,
    reg_optional: bool,
    tgt_pref: bool,
}

impl Lsra<'_> {
    pub(super) fn build_refs(&mut self) {
        self.order = self.block_order();
        let mut order_pos = IndexVec::from_vec(vec![usize::MAX; self.m.blocks.len()]);
        for (i, bidx) in self.order.iter().enumerate() {
            order_pos[*bidx] = i;
        }
        for (lidx, l) in self.m.locals.iter_enumerated() {
            if l.is_reg_candidate() {
                let iidx = self
                    .intervals
                    .push(Interval::new(IntervalKind::Local(lidx), l.ty));
                self.lcl_intervals[lidx] = Some(iidx);
            }
        }
        self.assign_param_regs();
        let mut loc = 0;
        for bidx in self.order.clone() {
            let start = self.refs.len();
            self.build_block(bidx, &order_pos, &mut loc);
            let range = start..self.refs.len();
            self.mark_last_uses(bidx, range.clone());
            self.block_refs.push((bidx, range));
        }
    }

    /// The order blocks are allocated in. With [Traversal::PredFirst], every block other than the
    /// entry (and any unreachable blocks) follows at least one of its predecessors.
    fn block_order(&self) -> Vec<BlockIdx> {
        match self.config.stress.traversal {
            Traversal::Layout => self.m.blocks.indices().collect(),
            Traversal::PredFirst => {
                // Reverse post order, followed by any unreachable blocks.
                let entry = self.m.entry();
                let mut seen = Vob::from_elem(false, self.m.blocks.len());
                seen.set(entry.index(), true);
                let mut post = Vec::with_capacity(self.m.blocks.len());
                let mut stack = vec![(entry, 0)];
                while let Some(top) = stack.last_mut() {
                    let (bidx, i) = *top;
                    match self.m.blocks[bidx].succs.get(i) {
                        Some(succ) => {
                            top.1 += 1;
                            if !seen[succ.index()] {
                                seen.set(succ.index(), true);
                                stack.push((*succ, 0));
                            }
                        }
                        None => {
                            post.push(bidx);
                            stack.pop();
                        }
                    }
                }
                post.reverse();
                post.extend(self.m.blocks.indices().filter(|x| !seen[x.index()]));
                post
            }
        }
    }

    /// Parameters are passed in the argument registers of their class, in parameter order, until
    /// those run out.
    fn assign_param_regs(&mut self) {
        let mut params = self
            .m
            .locals
            .iter_enumerated()
            .filter_map(|(lidx, l)| l.param.map(|p| (p, lidx)))
            .collect::<Vec<_>>();
        params.sort();
        let mut next = [0; RegClass::COUNT];
        for (_, lidx) in params {
            let Some(class) = self.m.locals[lidx].ty.reg_class() else {
                continue;
            };
            self.param_regs[lidx] = self
                .target
                .arg_regs(class)
                .get(next[class as usize])
                .copied();
            next[class as usize] += 1;
        }
    }

    fn push_ref(&mut self, rp: RefPosition) -> RefIdx {
        let iidx = rp.interval();
        let ridx = self.refs.push(rp);
        if let Some(iidx) = iidx {
            self.intervals[iidx].refs.push(ridx);
        }
        ridx
    }

    fn push_fixed(
        &mut self,
        reg: Reg,
        loc: u32,
        iidx: IntervalIdx,
        bidx: BlockIdx,
        nidx: NodeIdx,
    ) {
        self.fixed_locs[reg].push((loc, Some(iidx)));
        let mut rp = RefPosition::new(RefOwner::Reg(reg), RefType::FixedReg, loc, bidx);
        rp.node = Some(nidx);
        rp.fixed_for = Some(iidx);
        self.push_ref(rp);
    }

    fn build_block(&mut self, bidx: BlockIdx, order_pos: &IndexVec<BlockIdx, usize>, loc: &mut u32) {
        let bb_loc = *loc;
        self.push_ref(RefPosition::new(
            RefOwner::Block(bidx),
            RefType::BB,
            bb_loc,
            bidx,
        ));
        let is_entry = bidx == self.m.entry();
        let has_earlier_pred = self.m.blocks[bidx]
            .preds
            .iter()
            .any(|p| order_pos[*p] < order_pos[bidx]);
        let live_in = self.liveness.live_in[bidx]
            .iter_set_bits(..)
            .map(LclIdx::new)
            .collect::<Vec<_>>();
        for lidx in live_in {
            let iidx = self.lcl_interval(lidx);
            let ty = if is_entry {
                if self.m.locals[lidx].param.is_some() {
                    RefType::ParamDef
                } else {
                    RefType::ZeroInit
                }
            } else if has_earlier_pred {
                RefType::LiveIn
            } else {
                RefType::DummyDef
            };
            let mut rp = RefPosition::new(RefOwner::Interval(iidx), ty, bb_loc, bidx);
            rp.candidates = self.default_candidates(self.intervals[iidx].class);
            self.push_ref(rp);
        }
        *loc += 2;

        for nidx in self.m.blocks[bidx].nodes.clone() {
            if self.infos[nidx].contained {
                continue;
            }
            self.build_node(bidx, nidx, *loc);
            *loc += 2;
        }

        let live_out = self.liveness.live_out[bidx]
            .iter_set_bits(..)
            .map(LclIdx::new)
            .collect::<Vec<_>>();
        for lidx in live_out {
            let iidx = self.lcl_interval(lidx);
            self.push_ref(RefPosition::new(
                RefOwner::Interval(iidx),
                RefType::LiveOut,
                *loc,
                bidx,
            ));
        }
        *loc += 2;
    }

    /// The registers `cur` reads, either itself or through its contained operands. `path` is the
    /// chain of nodes from the consumer that owns the location down to `cur`: a value's use-side
    /// requirements apply only if they were placed by one of those nodes.
    fn collect_uses(
        &self,
        cur: NodeIdx,
        path: &mut SmallVec<[NodeIdx; 4]>,
        uses: &mut SmallVec<[Use; 4]>,
    ) {
        for op in self.m.nodes[cur].kind.operands() {
            let info = &self.infos[op];
            if info.contained {
                path.push(op);
                self.collect_uses(op, path, uses);
                path.pop();
                continue;
            }
            let applies = info.use_consumer.is_some_and(|x| path.contains(&x));
            for i in 0..info.dst_count {
                let iidx = match info.lcl_var {
                    Some(lidx) => self.lcl_interval(lidx),
                    None => self.node_defs[op][usize::from(i)],
                };
                let class = self.intervals[iidx].class;
                let candidates = if applies && !info.src_candidates.is_empty() {
                    self.limit(info.src_candidates, class)
                } else {
                    self.default_candidates(class)
                };
                uses.push(Use {
                    iidx,
                    src: op,
                    candidates,
                    delay_free: applies && info.is_delay_free,
                    reg_optional: applies && info.reg_optional,
                    tgt_pref: applies && info.is_tgt_pref,
                });
            }
        }
    }

    fn build_node(&mut self, bidx: BlockIdx, nidx: NodeIdx, loc: u32) {
        self.node_locs[nidx] = Some(loc);
        let info = self.infos[nidx].clone();
        let node = self.m.nodes[nidx].clone();

        let mut uses = SmallVec::<[Use; 4]>::new();
        match node.kind {
            NodeKind::Lcl(lidx)
                if info.lcl_var.is_none() && self.m.locals[lidx].is_reg_candidate() =>
            {
                // A read of a local that is redefined before the read is consumed: the local is
                // copied to a temporary.
                let iidx = self.lcl_interval(lidx);
                uses.push(Use {
                    iidx,
                    src: nidx,
                    candidates: self.default_candidates(self.intervals[iidx].class),
                    delay_free: false,
                    reg_optional: false,
                    tgt_pref: true,
                });
            }
            _ => {
                let mut path = smallvec![nidx];
                self.collect_uses(nidx, &mut path, &mut uses);
            }
        }

        let mut internals = SmallVec::<[(IntervalIdx, RegMask); 2]>::new();
        for (class, count) in [
            (RegClass::Int, info.internal_int_count),
            (RegClass::Float, info.internal_float_count),
        ] {
            let ty = match class {
                RegClass::Int => Ty::Int(64),
                RegClass::Float => Ty::Double,
            };
            let cands = info.internal_candidates & self.target.class_regs(class);
            let cands = if cands.is_empty() {
                self.default_candidates(class)
            } else {
                self.limit(cands, class)
            };
            for _ in 0..count {
                let iidx = self
                    .intervals
                    .push(Interval::new(IntervalKind::Internal(nidx), ty));
                internals.push((iidx, cands));
            }
        }

        // Location `loc`: fixed requirements first, so that no other value is placed in a
        // register that this node requires.
        for u in &uses {
            if let Some(reg) = u.candidates.single() {
                self.push_fixed(reg, loc, u.iidx, bidx, nidx);
                self.intervals[u.iidx].pref = self.intervals[u.iidx].pref.with(reg);
            }
        }
        for (iidx, cands) in &internals {
            if let Some(reg) = cands.single() {
                self.push_fixed(reg, loc, *iidx, bidx, nidx);
            }
        }
        for u in &uses {
            let mut rp = RefPosition::new(RefOwner::Interval(u.iidx), RefType::Use, loc, bidx);
            rp.node = Some(nidx);
            rp.src = Some(u.src);
            rp.candidates = u.candidates;
            rp.delay_free = u.delay_free;
            rp.reg_optional = u.reg_optional;
            self.push_ref(rp);
        }
        for (iidx, cands) in &internals {
            let mut rp = RefPosition::new(RefOwner::Interval(*iidx), RefType::Def, loc, bidx);
            rp.node = Some(nidx);
            rp.candidates = *cands;
            self.push_ref(rp);
        }

        // Location `loc + 1`.
        for reg in info.kill_mask.iter() {
            self.fixed_locs[reg].push((loc + 1, None));
            let mut rp = RefPosition::new(RefOwner::Reg(reg), RefType::Kill, loc + 1, bidx);
            rp.node = Some(nidx);
            self.push_ref(rp);
        }
        for (iidx, cands) in &internals {
            let mut rp = RefPosition::new(RefOwner::Interval(*iidx), RefType::Use, loc + 1, bidx);
            rp.node = Some(nidx);
            rp.candidates = *cands;
            rp.last_use = true;
            self.push_ref(rp);
        }

        let mut defs = SmallVec::<[(IntervalIdx, RegMask); 2]>::new();
        match node.kind {
            NodeKind::StoreLcl { lcl, .. } if self.m.locals[lcl].is_reg_candidate() => {
                let iidx = self.lcl_interval(lcl);
                defs.push((iidx, self.default_candidates(self.intervals[iidx].class)));
            }
            NodeKind::Lcl(_) if info.lcl_var.is_some() => (),
            _ => {
                for i in 0..info.dst_count {
                    let iidx = self.intervals.push(Interval::new(
                        IntervalKind::Temp { node: nidx, def: i },
                        node.ty,
                    ));
                    let interval = &mut self.intervals[iidx];
                    interval.pref = info.dst_candidates;
                    interval.is_constant = match node.kind {
                        NodeKind::Const(_) => true,
                        NodeKind::ConstDbl(_) => internals.is_empty(),
                        _ => false,
                    };
                    let class = interval.class;
                    let cands = if info.dst_count > 1
                        && info.dst_candidates.len() == usize::from(info.dst_count)
                    {
                        let reg = info.dst_candidates.iter().nth(usize::from(i)).unwrap();
                        RegMask::from(reg)
                    } else if info.dst_candidates.is_empty() {
                        self.default_candidates(class)
                    } else {
                        self.limit(info.dst_candidates, class)
                    };
                    self.node_defs[nidx].push(iidx);
                    defs.push((iidx, cands));
                }
            }
        }
        if let Some((def, _)) = defs.first() {
            for u in uses.iter().filter(|x| x.tgt_pref) {
                self.intervals[*def].related = Some(u.iidx);
                if self.intervals[u.iidx].related.is_none() {
                    self.intervals[u.iidx].related = Some(*def);
                }
            }
        }
        for (iidx, cands) in &defs {
            if let Some(reg) = cands.single() {
                self.push_fixed(reg, loc + 1, *iidx, bidx, nidx);
            }
        }
        for (iidx, cands) in defs {
            let mut rp = RefPosition::new(RefOwner::Interval(iidx), RefType::Def, loc + 1, bidx);
            rp.node = Some(nidx);
            rp.candidates = cands;
            self.push_ref(rp);
        }
    }

    /// Mark the last use of each interval in the block whose reference positions are `range`,
    /// and note the intervals live across kills.
    fn mark_last_uses(&mut self, bidx: BlockIdx, range: Range<usize>) {
        let extend = self.config.stress.extend_lifetimes;
        let mut live = Vob::from_elem(false, self.intervals.len());
        for l in self.liveness.live_out[bidx].iter_set_bits(..) {
            live.set(self.lcl_interval(LclIdx::new(l)).index(), true);
        }
        for ridx in range.rev().map(RefIdx::new) {
            let (ty, iidx) = (self.refs[ridx].ty, self.refs[ridx].interval());
            match (ty, iidx) {
                (RefType::Use, Some(iidx)) => {
                    if !live[iidx.index()] {
                        live.set(iidx.index(), true);
                        let is_local = self.intervals[iidx].local().is_some();
                        self.refs[ridx].last_use = !(extend && is_local);
                    }
                }
                (RefType::Def, Some(iidx)) => {
                    live.set(iidx.index(), false);
                }
                (RefType::Kill, _) => {
                    for i in live.iter_set_bits(..) {
                        let interval = &mut self.intervals[IntervalIdx::new(i)];
                        if !matches!(interval.kind, IntervalKind::Internal(_)) {
                            interval.crosses_kill = true;
                        }
                    }
                }
                _ => (),
            }
        }
    }
}
