//! Lowering: rewrite each node into a shape the target can realise directly, and describe its
//! register requirements in a [NodeInfo].
//!
//! Each target provides a table of [LowerRule]s indexed by [OpKind]. Lowering walks each block
//! twice:
//!
//! 1. In execution order, each node's `lower` function rewrites the node (e.g. splitting casts the
//!    target can't perform in one step) and decides which of its operands are contained (folded
//!    into the node's encoding as an immediate, memory operand, or address mode) or reg-optional.
//!    A `lower` function may insert new nodes before the node it is lowering: it then returns the
//!    first inserted node, and lowering resumes from there, revisiting the original node
//!    afterwards. `lower` functions must therefore be idempotent.
//! 2. In execution order, each non-contained node's `build` function populates its [NodeInfo].
//!    A node's operands have always been built before the node itself.
//!
//! A contained operand must be single use, legal for its consumer's encoding, and not invalidated
//! by a node between its definition and its consumer: see [Lowering::is_mem_safe_to_contain].

use crate::{
    CompilationError,
    ir::{
        BinOp, BlockIdx, CallTarget, LclIdx, Method, NodeIdx, NodeKind, OpKind, Ty, UnOp,
    },
    nodeinfo::{NodeInfo, NodeInfos, reg_srcs},
    target::{Arch, RegClass, RegMask, Target},
};
use index_vec::IndexVec;
use smallvec::SmallVec;

mod aarch64;
mod x64;

/// Rewrite a node and decide on the containment of its operands. Returns the node lowering
/// should resume from if new nodes were inserted.
pub(crate) type LowerFn =
    fn(&mut Lowering, BlockIdx, NodeIdx) -> Result<Option<NodeIdx>, CompilationError>;
/// Populate a node's [NodeInfo].
pub(crate) type BuildFn = fn(&mut Lowering, BlockIdx, NodeIdx) -> Result<(), CompilationError>;

pub(crate) struct LowerRule {
    pub(crate) kind: OpKind,
    pub(crate) lower: LowerFn,
    pub(crate) build: BuildFn,
}

/// Lower `m` for `target`, returning the register requirements of each node.
pub(crate) fn lower(m: &mut Method, target: &'static Target) -> Result<NodeInfos, CompilationError> {
    let rules: &[LowerRule] = match target.arch {
        Arch::X64 => &x64::RULES,
        Arch::Arm64 => &aarch64::RULES,
    };
    let use_counts = m.use_counts();
    let mut l = Lowering {
        infos: IndexVec::from_vec(vec![NodeInfo::default(); m.nodes.len()]),
        cur_block: m.entry(),
        m,
        target,
        use_counts,
    };
    for bidx in l.m.blocks.indices() {
        l.lower_block(rules, bidx)?;
    }
    for bidx in l.m.blocks.indices() {
        l.build_block(rules, bidx)?;
    }
    Ok(l.infos)
}

pub(crate) struct Lowering<'a> {
    pub(crate) m: &'a mut Method,
    pub(crate) target: &'static Target,
    pub(crate) infos: NodeInfos,
    /// The number of uses of each node by nodes in blocks.
    use_counts: IndexVec<NodeIdx, u32>,
    /// The block currently being lowered.
    cur_block: BlockIdx,
}

impl Lowering<'_> {
    fn lower_block(&mut self, rules: &[LowerRule], bidx: BlockIdx) -> Result<(), CompilationError> {
        self.cur_block = bidx;
        let mut i = 0;
        while i < self.m.blocks[bidx].nodes.len() {
            let nidx = self.m.blocks[bidx].nodes[i];
            let rule = &rules[self.m.nodes[nidx].kind.op_kind() as usize];
            i = match (rule.lower)(self, bidx, nidx)? {
                Some(next) => self.pos(bidx, next),
                None => self.pos(bidx, nidx) + 1,
            };
        }
        Ok(())
    }

    fn build_block(&mut self, rules: &[LowerRule], bidx: BlockIdx) -> Result<(), CompilationError> {
        self.cur_block = bidx;
        self.find_lcl_vars(bidx);
        // Building a node can insert copies before it, so positions are recomputed as we go.
        let mut i = 0;
        while i < self.m.blocks[bidx].nodes.len() {
            let nidx = self.m.blocks[bidx].nodes[i];
            i += 1;
            if self.infos[nidx].contained {
                continue;
            }
            let rule = &rules[self.m.nodes[nidx].kind.op_kind() as usize];
            (rule.build)(self, bidx, nidx)?;
            let info = &mut self.infos[nidx];
            assert!(
                info.is_populated(),
                "Building %{} did not populate its register requirements",
                nidx.index()
            );
            if info.dst_count > 0
                && info.lcl_var.is_none()
                && self.use_counts[nidx] == 0
                && !matches!(self.m.nodes[nidx].kind, NodeKind::StoreLcl { .. })
            {
                info.is_local_def_use = true;
            }
            i = self.pos(bidx, nidx) + 1;
        }
        Ok(())
    }

    /// Decide which reads of register candidate locals can be read by their consumers directly
    /// from the local's register. This is the case unless the local is redefined between the
    /// read and one of its consumers.
    fn find_lcl_vars(&mut self, bidx: BlockIdx) {
        let nodes = &self.m.blocks[bidx].nodes;
        let mut last_use = vec![None; nodes.len()];
        let pos_of = nodes
            .iter()
            .enumerate()
            .map(|(i, x)| (*x, i))
            .collect::<std::collections::HashMap<_, _>>();
        for (i, nidx) in nodes.iter().enumerate() {
            if self.infos[*nidx].contained {
                continue;
            }
            // The operands of contained nodes are read by their consumer.
            let mut todo = self.m.nodes[*nidx].kind.operands();
            while let Some(op) = todo.pop() {
                if self.infos[op].contained {
                    todo.extend(self.m.nodes[op].kind.operands());
                } else {
                    last_use[pos_of[&op]] = Some(i);
                }
            }
        }
        for (i, nidx) in nodes.iter().enumerate() {
            let NodeKind::Lcl(lidx) = self.m.nodes[*nidx].kind else {
                continue;
            };
            if !self.m.locals[lidx].is_reg_candidate() {
                continue;
            }
            let redefined = match last_use[i] {
                Some(end) => nodes[i + 1..end].iter().any(|x| {
                    matches!(self.m.nodes[*x].kind, NodeKind::StoreLcl { lcl, .. } if lcl == lidx)
                }),
                None => false,
            };
            if !redefined {
                self.infos[*nidx].lcl_var = Some(lidx);
            }
        }
    }

    /// The position of `nidx` in block `bidx`.
    pub(crate) fn pos(&self, bidx: BlockIdx, nidx: NodeIdx) -> usize {
        self.m.blocks[bidx]
            .nodes
            .iter()
            .position(|x| *x == nidx)
            .unwrap_or_else(|| panic!("%{} is not in bb{}", nidx.index(), bidx.index()))
    }

    pub(crate) fn ty(&self, nidx: NodeIdx) -> Ty {
        self.m.nodes[nidx].ty
    }

    pub(crate) fn kind(&self, nidx: NodeIdx) -> &NodeKind {
        &self.m.nodes[nidx].kind
    }

    pub(crate) fn is_single_use(&self, nidx: NodeIdx) -> bool {
        self.use_counts[nidx] == 1
    }

    /// If `nidx` is an integer constant, return its value.
    pub(crate) fn int_const(&self, nidx: NodeIdx) -> Option<i64> {
        match self.m.nodes[nidx].kind {
            NodeKind::Const(x) if !self.m.nodes[nidx].ty.is_float() => Some(x),
            _ => None,
        }
    }

    /// Insert a new node before `before` in block `bidx`.
    pub(crate) fn insert_before(
        &mut self,
        bidx: BlockIdx,
        before: NodeIdx,
        ty: Ty,
        kind: NodeKind,
    ) -> NodeIdx {
        for op in kind.operands() {
            self.use_counts[op] += 1;
        }
        let pos = self.pos(bidx, before);
        let nidx = self.m.insert_node(bidx, pos, ty, kind);
        self.infos.push(NodeInfo::default());
        self.use_counts.push(0);
        debug_assert_eq!(self.infos.len(), self.m.nodes.len());
        nidx
    }

    /// Replace `nidx`'s kind, keeping use counts up to date.
    pub(crate) fn set_kind(&mut self, nidx: NodeIdx, kind: NodeKind) {
        for op in self.m.nodes[nidx].kind.operands() {
            self.use_counts[op] -= 1;
        }
        for op in kind.operands() {
            self.use_counts[op] += 1;
        }
        self.m.nodes[nidx].kind = kind;
    }

    /// Remove the unused node `nidx` from block `bidx`.
    pub(crate) fn remove(&mut self, bidx: BlockIdx, nidx: NodeIdx) {
        assert_eq!(self.use_counts[nidx], 0);
        let pos = self.pos(bidx, nidx);
        self.m.blocks[bidx].nodes.remove(pos);
        for op in self.m.nodes[nidx].kind.operands() {
            self.use_counts[op] -= 1;
        }
    }

    /// Mark `nidx` as contained in `parent`. Use-side requirements `nidx` placed on its own
    /// operands now apply to `parent`.
    pub(crate) fn contain(&mut self, nidx: NodeIdx, parent: NodeIdx) {
        self.infos[nidx].contain();
        for op in self.m.nodes[nidx].kind.operands() {
            if self.infos[op].use_consumer == Some(nidx) {
                self.infos[op].use_consumer = Some(parent);
            }
        }
    }

    /// Apply the use-side requirement `f` to `consumer`'s use of `op`, which is referenced
    /// directly by `user` (either `consumer` itself or one of its contained operands). If `op` is
    /// contained, the requirement applies to the registers `op` reads. `f` returns false if the
    /// requirement conflicts with those already present.
    ///
    /// If another consumer has already placed requirements on `op`, or the requirement conflicts,
    /// `consumer` reads a copy of `op` instead. Returns the node the requirement was placed on.
    fn constrain_use(
        &mut self,
        op: NodeIdx,
        user: NodeIdx,
        consumer: NodeIdx,
        f: &dyn Fn(&mut NodeInfo) -> bool,
    ) -> NodeIdx {
        if self.infos[op].contained {
            for x in self.m.nodes[op].kind.operands() {
                self.constrain_use(x, op, consumer, f);
            }
            return op;
        }
        let info = &mut self.infos[op];
        if info.use_consumer.is_none() || info.use_consumer == Some(consumer) {
            info.use_consumer = Some(consumer);
            if f(info) {
                return op;
            }
        }
        let copy = self.copy_use(op, user);
        let info = &mut self.infos[copy];
        info.use_consumer = Some(consumer);
        assert!(f(info));
        copy
    }

    /// Make `user` read a copy of `op`, inserted immediately before `user`, instead of `op`
    /// itself. If `user` reads `op` more than once, only the last read is replaced.
    fn copy_use(&mut self, op: NodeIdx, user: NodeIdx) -> NodeIdx {
        let copy = self.insert_before(
            self.cur_block,
            user,
            self.ty(op),
            NodeKind::Cast {
                val: op,
                unsigned: false,
                ovf: false,
            },
        );
        let mut kind = self.m.nodes[user].kind.clone();
        let n = kind.operands().iter().filter(|x| **x == op).count();
        let mut seen = 0;
        kind.map_operands(|x| {
            if *x == op {
                seen += 1;
                if seen == n {
                    *x = copy;
                }
            }
        });
        self.set_kind(user, kind);
        self.populate(copy, 1);
        copy
    }

    /// Require that `consumer` reads `op` from one of `mask`, returning the node the requirement
    /// was placed on.
    pub(crate) fn set_src_candidates(
        &mut self,
        op: NodeIdx,
        consumer: NodeIdx,
        mask: RegMask,
    ) -> NodeIdx {
        self.constrain_use(op, consumer, consumer, &|info| {
            if info.src_candidates.is_empty() {
                info.src_candidates = mask;
                true
            } else if (info.src_candidates & mask).is_empty() {
                false
            } else {
                info.src_candidates = info.src_candidates & mask;
                true
            }
        })
    }

    /// Mark `consumer`'s use of `op` as delay free.
    pub(crate) fn set_delay_free(&mut self, op: NodeIdx, consumer: NodeIdx) -> NodeIdx {
        let x = self.constrain_use(op, consumer, consumer, &|info| {
            info.is_delay_free = true;
            true
        });
        self.infos[consumer].has_delay_free_src = true;
        x
    }

    /// If no other consumer has placed requirements on `op`, return its use-side requirements.
    fn use_pref(&mut self, op: NodeIdx, consumer: NodeIdx) -> Option<&mut NodeInfo> {
        let info = &mut self.infos[op];
        if info.contained || info.use_consumer.is_some_and(|x| x != consumer) {
            return None;
        }
        info.use_consumer = Some(consumer);
        Some(info)
    }

    /// Note that `consumer` would like to define its value in the same register as `op`.
    pub(crate) fn set_tgt_pref(&mut self, op: NodeIdx, consumer: NodeIdx) {
        if let Some(info) = self.use_pref(op, consumer) {
            info.is_tgt_pref = true;
        }
    }

    /// Allow `consumer` to read `op` directly from memory.
    pub(crate) fn set_reg_optional(&mut self, op: NodeIdx, consumer: NodeIdx) {
        if let Some(info) = self.use_pref(op, consumer) {
            info.reg_optional = true;
        }
    }

    /// Forget any use-side requirements on `op`, which is about to gain a new consumer.
    fn clear_use_reqs(&mut self, op: NodeIdx) {
        let info = &mut self.infos[op];
        info.use_consumer = None;
        info.src_candidates = RegMask::EMPTY;
        info.is_delay_free = false;
        info.is_tgt_pref = false;
        info.reg_optional = false;
    }

    /// Populate `nidx`'s [NodeInfo] with `dst_count` destinations and a source count derived from
    /// its operands.
    pub(crate) fn populate(&mut self, nidx: NodeIdx, dst_count: u8) -> &mut NodeInfo {
        let src_count = u8::try_from(reg_srcs(self.m, &self.infos, nidx).len()).unwrap();
        self.infos[nidx].populate(self.target, src_count, dst_count);
        &mut self.infos[nidx]
    }

    /// Can the memory read `child` be folded into `parent` without any node between the two
    /// invalidating the value read?
    pub(crate) fn is_mem_safe_to_contain(
        &self,
        bidx: BlockIdx,
        child: NodeIdx,
        parent: NodeIdx,
    ) -> bool {
        let (cpos, ppos) = (self.pos(bidx, child), self.pos(bidx, parent));
        assert!(cpos < ppos);
        self.m.blocks[bidx].nodes[cpos + 1..ppos]
            .iter()
            .all(|x| !self.interferes_with_mem(*x))
    }

    /// Could `nidx` change the contents of memory that a contained load or non-candidate local
    /// read depends on?
    fn interferes_with_mem(&self, nidx: NodeIdx) -> bool {
        match &self.m.nodes[nidx].kind {
            NodeKind::StoreLcl { lcl, .. } => !self.m.locals[*lcl].is_reg_candidate(),
            k => k.has_mem_side_effect(),
        }
    }

    /// If `child` is a single use integer constant for which `fits` holds, contain it in
    /// `parent` and return true.
    pub(crate) fn try_contain_imm<F>(&mut self, child: NodeIdx, parent: NodeIdx, fits: F) -> bool
    where
        F: Fn(i64) -> bool,
    {
        match self.int_const(child) {
            Some(c) if self.is_single_use(child) && !self.infos[child].contained && fits(c) => {
                self.contain(child, parent);
                true
            }
            _ => false,
        }
    }

    /// Swap the operands of the binary operation or comparison `nidx`. Comparisons have their
    /// predicate swapped to match.
    pub(crate) fn swap_operands(&mut self, nidx: NodeIdx) {
        let kind = match *self.kind(nidx) {
            NodeKind::BinOp { op, lhs, rhs } => {
                assert!(op.is_commutative());
                NodeKind::BinOp {
                    op,
                    lhs: rhs,
                    rhs: lhs,
                }
            }
            NodeKind::Cmp { pred, lhs, rhs } => NodeKind::Cmp {
                pred: pred.swapped(),
                lhs: rhs,
                rhs: lhs,
            },
            _ => panic!(),
        };
        self.set_kind(nidx, kind);
    }

    /// If `child` is a single use memory read (a load or a read of a local that lives in memory)
    /// of the same size as `size`, which can safely be folded into `parent`, contain it and return
    /// true.
    pub(crate) fn try_contain_mem(
        &mut self,
        bidx: BlockIdx,
        child: NodeIdx,
        parent: NodeIdx,
        size: u32,
    ) -> bool {
        if !self.is_single_use(child) || self.infos[child].contained {
            return false;
        }
        let is_mem = match self.m.nodes[child].kind {
            NodeKind::Lcl(lidx) => !self.m.locals[lidx].is_reg_candidate(),
            NodeKind::Load(_) => true,
            _ => false,
        };
        let ty = self.ty(child);
        if is_mem
            && ty.reg_class().is_some()
            && ty.size() == size
            && self.is_mem_safe_to_contain(bidx, child, parent)
        {
            self.contain(child, parent);
            true
        } else {
            false
        }
    }

    /// Try to fold the single use address computation `addr` of the memory access `parent` into
    /// an address mode. `legal(has_base, has_index, scale, offset)` says whether the target can
    /// encode an address mode. Returns true if `addr` is now contained.
    pub(crate) fn try_contain_addr<F>(
        &mut self,
        bidx: BlockIdx,
        addr: NodeIdx,
        parent: NodeIdx,
        legal: F,
    ) -> bool
    where
        F: Fn(bool, bool, u8, i32) -> bool,
    {
        if !self.is_single_use(addr) || self.infos[addr].contained {
            return false;
        }
        match self.m.nodes[addr].kind {
            NodeKind::LclAddr(_) => {
                self.contain(addr, parent);
                return true;
            }
            NodeKind::Lea {
                base,
                index,
                scale,
                offset,
            } => {
                if legal(base.is_some(), index.is_some(), scale, offset) {
                    self.contain(addr, parent);
                    return true;
                }
                return false;
            }
            NodeKind::BinOp {
                op: BinOp::Add, ..
            } if self.ty(addr).is_int() => (),
            _ => return false,
        }
        let Some(am) = self.decompose_addr(addr) else {
            return false;
        };
        if !legal(true, am.index.is_some(), am.scale, am.offset) {
            return false;
        }
        self.set_kind(
            addr,
            NodeKind::Lea {
                base: Some(am.base),
                index: am.index,
                scale: am.scale,
                offset: am.offset,
            },
        );
        // Consumed nodes are ordered consumers first.
        for x in am.consumed {
            if self.use_counts[x] == 0 {
                self.remove(bidx, x);
            }
        }
        self.clear_use_reqs(am.base);
        if let Some(x) = am.index {
            self.clear_use_reqs(x);
        }
        self.contain(addr, parent);
        true
    }

    /// Decompose the address computation `addr` (an `add`) into `base + index * scale + offset`.
    fn decompose_addr(&self, addr: NodeIdx) -> Option<AddrMode> {
        let NodeKind::BinOp {
            op: BinOp::Add,
            lhs,
            rhs,
        } = self.m.nodes[addr].kind
        else {
            return None;
        };
        let mut am = AddrMode {
            base: lhs,
            index: None,
            scale: 1,
            offset: 0,
            consumed: SmallVec::new(),
        };
        let mut rest = rhs;
        if let Some(c) = self.int_const(rhs) {
            am.offset = i32::try_from(c).ok()?;
            am.consumed.push(rhs);
            // `(x + y) + c`
            match self.m.nodes[lhs].kind {
                NodeKind::BinOp {
                    op: BinOp::Add,
                    lhs: inner_lhs,
                    rhs: inner_rhs,
                } if self.is_single_use(lhs)
                    && self.ty(lhs).is_int()
                    && self.int_const(inner_rhs).is_none() =>
                {
                    am.consumed.push(lhs);
                    am.base = inner_lhs;
                    rest = inner_rhs;
                }
                _ => return Some(am),
            }
        } else if let Some(c) = self.int_const(lhs) {
            am.offset = i32::try_from(c).ok()?;
            am.consumed.push(lhs);
            am.base = rhs;
            return Some(am);
        } else if self.scaled_index(lhs).is_some() && self.scaled_index(rhs).is_none() {
            am.base = rhs;
            rest = lhs;
        }
        match self.scaled_index(rest) {
            Some((index, scale, consumed)) => {
                am.index = Some(index);
                am.scale = scale;
                am.consumed.extend(consumed);
            }
            None => am.index = Some(rest),
        }
        Some(am)
    }

    /// If `nidx` is a single use `x << c` or `x * 2^c` with `0 <= c <= 3`, return `x`, `2^c`, and
    /// the nodes that would be consumed by folding it into an address mode.
    fn scaled_index(&self, nidx: NodeIdx) -> Option<(NodeIdx, u8, SmallVec<[NodeIdx; 2]>)> {
        if !self.is_single_use(nidx) {
            return None;
        }
        let NodeKind::BinOp { op, lhs, rhs } = self.m.nodes[nidx].kind else {
            return None;
        };
        let c = self.int_const(rhs)?;
        if !self.is_single_use(rhs) {
            return None;
        }
        let scale = match (op, c) {
            (BinOp::Shl, 0..=3) => 1u8 << c,
            (BinOp::Mul, 1 | 2 | 4 | 8) => u8::try_from(c).unwrap(),
            _ => return None,
        };
        let mut consumed = SmallVec::new();
        consumed.push(nidx);
        consumed.push(rhs);
        Some((lhs, scale, consumed))
    }

    /// Split casts the hardware can't perform directly (between small integers and floating
    /// point values) into two casts through `i32`.
    pub(crate) fn lower_cast(
        &mut self,
        bidx: BlockIdx,
        nidx: NodeIdx,
    ) -> Result<Option<NodeIdx>, CompilationError> {
        let NodeKind::Cast { val, unsigned, ovf } = self.m.nodes[nidx].kind else {
            panic!()
        };
        let (from, to) = (self.ty(val), self.ty(nidx));
        if from.reg_class().is_none() || to.reg_class().is_none() {
            return Err(CompilationError::Unsupported(format!(
                "cast from {from} to {to}"
            )));
        }
        if from.is_small_int() && to.is_float() {
            let inner = self.insert_before(
                bidx,
                nidx,
                Ty::Int(32),
                NodeKind::Cast {
                    val,
                    unsigned,
                    ovf: false,
                },
            );
            self.set_kind(
                nidx,
                NodeKind::Cast {
                    val: inner,
                    unsigned: false,
                    ovf,
                },
            );
            return Ok(Some(inner));
        }
        if from.is_float() && to.is_small_int() {
            let inner = self.insert_before(
                bidx,
                nidx,
                Ty::Int(32),
                NodeKind::Cast {
                    val,
                    unsigned: false,
                    ovf,
                },
            );
            self.set_kind(
                nidx,
                NodeKind::Cast {
                    val: inner,
                    unsigned,
                    ovf,
                },
            );
            return Ok(Some(inner));
        }
        Ok(None)
    }

    /// Insert the argument staging nodes for a call.
    pub(crate) fn lower_call(
        &mut self,
        bidx: BlockIdx,
        nidx: NodeIdx,
    ) -> Result<Option<NodeIdx>, CompilationError> {
        let NodeKind::Call { target, args, tail } = self.m.nodes[nidx].kind.clone() else {
            panic!()
        };
        if let Ty::Struct { size, .. } = self.ty(nidx) {
            if size > 16 {
                return Err(CompilationError::LimitExceeded(format!(
                    "calls returning {size} byte structs"
                )));
            }
        }
        if args
            .iter()
            .all(|x| matches!(self.kind(*x), NodeKind::PutArgReg { .. }))
        {
            return Ok(None);
        }
        let mut next_reg = [0, 0];
        let mut next_slot = 0;
        let mut regargs = SmallVec::<[NodeIdx; 4]>::new();
        let mut first = None;
        for arg in args {
            let ty = self.ty(arg);
            let Some(class) = ty.reg_class() else {
                return Err(CompilationError::Unsupported(format!(
                    "passing {ty} arguments"
                )));
            };
            let regs = self.target.arg_regs(class);
            let put = match regs.get(next_reg[class as usize]) {
                Some(reg) => {
                    next_reg[class as usize] += 1;
                    let x = self.insert_before(bidx, nidx, ty, NodeKind::PutArgReg { val: arg, reg: *reg });
                    regargs.push(x);
                    x
                }
                None => {
                    next_slot += 1;
                    self.insert_before(
                        bidx,
                        nidx,
                        Ty::Void,
                        NodeKind::PutArgStk {
                            val: arg,
                            slot: next_slot - 1,
                        },
                    )
                }
            };
            first.get_or_insert(put);
        }
        self.set_kind(
            nidx,
            NodeKind::Call {
                target,
                args: regargs,
                tail,
            },
        );
        Ok(first)
    }

    /// Does the `jtrue` `nidx` consume a comparison immediately preceding it that can set flags
    /// for the branch, rather than producing a value? If so, contain it.
    fn lower_jtrue(&mut self, bidx: BlockIdx, nidx: NodeIdx) {
        let NodeKind::JTrue(cond) = self.m.nodes[nidx].kind else {
            panic!()
        };
        let pos = self.pos(bidx, nidx);
        if matches!(self.kind(cond), NodeKind::Cmp { .. })
            && self.is_single_use(cond)
            && pos > 0
            && self.m.blocks[bidx].nodes[pos - 1] == cond
        {
            self.contain(cond, nidx);
        }
    }

    /// The register class of `nidx`'s value.
    pub(crate) fn class(&self, nidx: NodeIdx) -> RegClass {
        self.ty(nidx).reg_class().unwrap()
    }

    /// The return registers for a value of type `ty`.
    pub(crate) fn ret_regs(&self, ty: Ty) -> RegMask {
        match ty {
            Ty::Void => RegMask::EMPTY,
            Ty::Struct { size, .. } => RegMask::from_regs(
                &self.target.int_ret_regs[..usize::try_from(size.div_ceil(8)).unwrap()],
            ),
            _ => RegMask::from(self.target.ret_regs(ty.reg_class().unwrap())[0]),
        }
    }

    pub(crate) fn local_of(&self, lidx: LclIdx) -> &crate::ir::Local {
        &self.m.locals[lidx]
    }
}

struct AddrMode {
    base: NodeIdx,
    index: Option<NodeIdx>,
    scale: u8,
    offset: i32,
    /// The nodes folded into the address mode, which are removed once it is formed.
    consumed: SmallVec<[NodeIdx; 4]>,
}

// Lower and build functions common to all targets.

pub(crate) fn lower_nothing(
    _: &mut Lowering,
    _: BlockIdx,
    _: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    Ok(None)
}

pub(crate) fn lower_unsupported(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    Err(CompilationError::Unsupported(format!(
        "lowering {} nodes on {}",
        l.kind(nidx).op_kind(),
        l.target.arch
    )))
}

pub(crate) fn lower_cast(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    l.lower_cast(bidx, nidx)
}

pub(crate) fn lower_call(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    l.lower_call(bidx, nidx)
}

pub(crate) fn lower_jtrue(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    l.lower_jtrue(bidx, nidx);
    Ok(None)
}

pub(crate) fn build_unsupported(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    Err(CompilationError::Unsupported(format!(
        "building {} nodes on {}",
        l.kind(nidx).op_kind(),
        l.target.arch
    )))
}

/// A node that defines one register from its (possibly contained) operands.
pub(crate) fn build_simple(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    let dst = u8::from(l.ty(nidx) != Ty::Void);
    l.populate(nidx, dst);
    Ok(())
}

pub(crate) fn build_lcl(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    let NodeKind::Lcl(lidx) = *l.kind(nidx) else {
        panic!()
    };
    if let Ty::Struct { .. } = l.ty(nidx) {
        return Err(CompilationError::Unsupported(
            "struct values outside of returns".to_owned(),
        ));
    }
    let candidate = l.local_of(lidx).is_reg_candidate();
    if candidate && l.infos[nidx].lcl_var.is_none() {
        // The local is redefined before this read is consumed: copy it to a temporary.
        l.infos[nidx].populate(l.target, 1, 1);
    } else {
        l.populate(nidx, 1);
    }
    Ok(())
}

/// Store to a local. A store to a register candidate defines the local's register.
pub(crate) fn build_store_lcl(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    let NodeKind::StoreLcl { lcl, val } = *l.kind(nidx) else {
        panic!()
    };
    if l.local_of(lcl).is_reg_candidate() {
        l.populate(nidx, 1);
        l.set_tgt_pref(val, nidx);
    } else {
        l.populate(nidx, 0);
    }
    Ok(())
}

pub(crate) fn build_void(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    l.populate(nidx, 0);
    Ok(())
}

pub(crate) fn build_return(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    if let NodeKind::Return(Some(val)) = *l.kind(nidx) {
        let ty = l.ty(val);
        if let Ty::Struct { .. } = ty {
            // Struct returns are loaded into the return registers from the local's home.
            if !matches!(l.kind(val), NodeKind::Lcl(_)) {
                return Err(CompilationError::Unsupported(format!("returning {ty} values")));
            }
            if ty.size() > 16 {
                return Err(CompilationError::LimitExceeded(format!("returning {ty} values")));
            }
        } else {
            let mask = l.ret_regs(ty);
            l.set_src_candidates(val, nidx, mask);
        }
    }
    l.populate(nidx, 0);
    Ok(())
}

/// Lower a return of a struct local: the local is read from memory by the return itself.
pub(crate) fn lower_return(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    if let NodeKind::Return(Some(val)) = *l.kind(nidx) {
        if let (Ty::Struct { .. }, NodeKind::Lcl(_)) = (l.ty(val), l.kind(val)) {
            if l.is_single_use(val) {
                l.contain(val, nidx);
            }
        }
    }
    Ok(None)
}

pub(crate) fn build_call(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    let NodeKind::Call { target, args, tail } = l.kind(nidx).clone() else {
        panic!()
    };
    for arg in &args {
        let NodeKind::PutArgReg { reg, .. } = *l.kind(*arg) else {
            panic!()
        };
        l.set_src_candidates(*arg, nidx, RegMask::from(reg));
    }
    let arg_regs = args
        .iter()
        .map(|x| match l.kind(*x) {
            NodeKind::PutArgReg { reg, .. } => RegMask::from(*reg),
            _ => unreachable!(),
        })
        .fold(RegMask::EMPTY, |acc, x| acc | x);
    match target {
        CallTarget::Direct(_) | CallTarget::Helper(_) => (),
        CallTarget::Indirect(x) if tail => {
            l.set_src_candidates(x, nidx, RegMask::from(l.target.tailcall_target_reg));
        }
        CallTarget::Indirect(x) => {
            l.set_src_candidates(x, nidx, l.target.allocatable_int - arg_regs);
        }
        CallTarget::VirtualStub(x) => {
            l.set_src_candidates(x, nidx, RegMask::from(l.target.vsd_param_reg));
        }
    }
    let ty = l.ty(nidx);
    let ret = l.ret_regs(ty);
    let kill_mask = l.target.callee_trash;
    let info = l.populate(nidx, u8::try_from(ret.len()).unwrap());
    info.dst_candidates = ret;
    info.kill_mask = kill_mask;
    Ok(())
}

/// Move a value into an argument register: the consumer (the call) reads it from there.
pub(crate) fn build_putarg_reg(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<(), CompilationError> {
    let NodeKind::PutArgReg { val, reg } = *l.kind(nidx) else {
        panic!()
    };
    l.set_tgt_pref(val, nidx);
    let info = l.populate(nidx, 1);
    info.dst_candidates = RegMask::from(reg);
    Ok(())
}

/// The register requirements of the operation `op` when it is performed by calling a helper
/// with its operands in the first argument registers.
pub(crate) fn build_helper_args(l: &mut Lowering, nidx: NodeIdx, ops: &[NodeIdx]) {
    for (op, reg) in ops.iter().zip(l.target.int_arg_regs) {
        l.set_src_candidates(*op, nidx, RegMask::from(*reg));
    }
}

/// Rewrite a left rotate into a right rotate, for targets that only have the latter.
pub(crate) fn rol_to_ror(l: &mut Lowering, bidx: BlockIdx, nidx: NodeIdx) -> Option<NodeIdx> {
    let NodeKind::BinOp {
        op: BinOp::Rol,
        lhs,
        rhs,
    } = *l.kind(nidx)
    else {
        return None;
    };
    let bitw = i64::from(l.ty(nidx).bitw());
    if let Some(c) = l.int_const(rhs) {
        let amount = (bitw - c) & (bitw - 1);
        if l.is_single_use(rhs) {
            l.set_kind(rhs, NodeKind::Const(amount));
            l.set_kind(
                nidx,
                NodeKind::BinOp {
                    op: BinOp::Ror,
                    lhs,
                    rhs,
                },
            );
            None
        } else {
            let c = l.insert_before(bidx, nidx, l.ty(rhs), NodeKind::Const(amount));
            l.set_kind(
                nidx,
                NodeKind::BinOp {
                    op: BinOp::Ror,
                    lhs,
                    rhs: c,
                },
            );
            Some(c)
        }
    } else {
        let neg = l.insert_before(
            bidx,
            nidx,
            l.ty(rhs),
            NodeKind::UnOp {
                op: UnOp::Neg,
                val: rhs,
            },
        );
        l.set_kind(
            nidx,
            NodeKind::BinOp {
                op: BinOp::Ror,
                lhs,
                rhs: neg,
            },
        );
        Some(neg)
    }
}
