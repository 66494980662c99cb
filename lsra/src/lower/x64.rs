//! x64 lowering.
//!
//! Most x64 instructions are two-address (`dst = dst op src`), so the first operand of a binary
//! operation is marked as a target preference and, for non-commutative operations, the second is
//! delay free. The second operand of most instructions can be an immediate or a memory operand.

use super::{
    LowerRule, Lowering, build_call, build_helper_args, build_lcl, build_putarg_reg, build_return,
    build_simple, build_store_lcl, build_unsupported, build_void, lower_call, lower_cast,
    lower_jtrue, lower_nothing, lower_return, lower_unsupported,
};
use crate::{
    CompilationError,
    ir::{BinOp, BlkOp, BlkSize, BlockIdx, NodeIdx, NodeKind, OpKind, Pred, UnOp},
    nodeinfo::BlkKind,
    target::{
        RegMask,
        x64::{RAX, RCX, RDX},
    },
};
use strum::EnumCount;

pub(crate) static RULES: [LowerRule; OpKind::COUNT] = [
    LowerRule {
        kind: OpKind::Const,
        lower: lower_nothing,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::ConstDbl,
        lower: lower_nothing,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::Lcl,
        lower: lower_nothing,
        build: build_lcl,
    },
    LowerRule {
        kind: OpKind::LclAddr,
        lower: lower_nothing,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::StoreLcl,
        lower: lower_store_lcl,
        build: build_store_lcl,
    },
    LowerRule {
        kind: OpKind::BinOp,
        lower: lower_binop,
        build: build_binop,
    },
    LowerRule {
        kind: OpKind::UnOp,
        lower: lower_nothing,
        build: build_unop,
    },
    LowerRule {
        kind: OpKind::Cmp,
        lower: lower_cmp,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::JTrue,
        lower: lower_jtrue,
        build: build_void,
    },
    LowerRule {
        kind: OpKind::Load,
        lower: lower_load,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::Store,
        lower: lower_store,
        build: build_void,
    },
    LowerRule {
        kind: OpKind::Lea,
        lower: lower_nothing,
        build: build_simple,
    },
    LowerRule {
        kind: OpKind::Cast,
        lower: lower_cast,
        build: build_cast,
    },
    LowerRule {
        kind: OpKind::Call,
        lower: lower_call,
        build: build_call,
    },
    LowerRule {
        kind: OpKind::PutArgReg,
        lower: lower_nothing,
        build: build_putarg_reg,
    },
    LowerRule {
        kind: OpKind::PutArgStk,
        lower: lower_putarg_stk,
        build: build_void,
    },
    LowerRule {
        kind: OpKind::Blk,
        lower: lower_blk,
        build: build_blk,
    },
    LowerRule {
        kind: OpKind::Return,
        lower: lower_return,
        build: build_return,
    },
    LowerRule {
        kind: OpKind::Nop,
        lower: lower_nothing,
        build: build_void,
    },
    LowerRule {
        kind: OpKind::Move,
        lower: lower_unsupported,
        build: build_unsupported,
    },
    LowerRule {
        kind: OpKind::Swap,
        lower: lower_unsupported,
        build: build_unsupported,
    },
];

/// Can `c` be encoded as a sign-extended 32-bit immediate?
fn fits_imm32(c: i64) -> bool {
    i32::try_from(c).is_ok()
}

/// x64 can encode `base + index * {1, 2, 4, 8} + disp32` with either or both registers.
fn addr_mode_legal(_has_base: bool, _has_index: bool, scale: u8, _offset: i32) -> bool {
    matches!(scale, 1 | 2 | 4 | 8)
}

fn lower_store_lcl(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::StoreLcl { lcl, val } = *l.kind(nidx) else {
        panic!()
    };
    if l.local_of(lcl).is_reg_candidate() {
        l.try_contain_imm(val, nidx, |_| true);
    } else {
        l.try_contain_imm(val, nidx, fits_imm32);
    }
    Ok(None)
}

fn lower_binop(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::BinOp { op, lhs, rhs } = *l.kind(nidx) else {
        panic!()
    };
    let ty = l.ty(nidx);
    let size = ty.size();
    if ty.is_float() {
        if !matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div) {
            return Err(CompilationError::Unsupported(format!("{op} on {ty}")));
        }
        if !l.try_contain_mem(bidx, rhs, nidx, size) {
            l.set_reg_optional(rhs, nidx);
        }
        return Ok(None);
    }
    if op.is_shift_or_rotate() {
        l.try_contain_imm(rhs, nidx, |_| true);
        return Ok(None);
    }
    if op.is_div_or_mod() {
        // There are no immediate forms of `div`.
        if l.int_const(rhs).is_none() && !l.try_contain_mem(bidx, rhs, nidx, size) {
            l.set_reg_optional(rhs, nidx);
        }
        return Ok(None);
    }
    let (lhs, rhs) = if op.is_commutative()
        && l.int_const(lhs).is_some_and(fits_imm32)
        && l.int_const(rhs).is_none()
    {
        l.swap_operands(nidx);
        (rhs, lhs)
    } else {
        (lhs, rhs)
    };
    if l.try_contain_imm(rhs, nidx, fits_imm32) || l.try_contain_mem(bidx, rhs, nidx, size) {
        return Ok(None);
    }
    if op.is_commutative() && l.try_contain_mem(bidx, lhs, nidx, size) {
        l.swap_operands(nidx);
        return Ok(None);
    }
    l.set_reg_optional(rhs, nidx);
    Ok(None)
}

fn build_binop(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::BinOp { op, lhs, rhs } = *l.kind(nidx) else {
        panic!()
    };
    let ty = l.ty(nidx);
    if ty.is_int() && op.is_div_or_mod() {
        // `div` takes its dividend in `rdx:rax`, leaving the quotient in `rax` and the remainder in
        // `rdx`.
        l.set_src_candidates(lhs, nidx, RegMask::from(RAX));
        l.set_src_candidates(
            rhs,
            nidx,
            l.target.allocatable_int - RegMask::from_regs(&[RAX, RDX]),
        );
        let info = l.populate(nidx, 1);
        info.dst_candidates = RegMask::from(match op {
            BinOp::Div | BinOp::UDiv => RAX,
            _ => RDX,
        });
        info.kill_mask = RegMask::from_regs(&[RAX, RDX]);
        return Ok(());
    }
    if ty.is_int() && op.is_shift_or_rotate() && !l.infos[rhs].contained {
        // Variable shift amounts live in `cl`.
        let not_rcx = l.target.allocatable_int - RegMask::from(RCX);
        l.set_src_candidates(rhs, nidx, RegMask::from(RCX));
        if lhs != rhs {
            let lhs = l.set_src_candidates(lhs, nidx, not_rcx);
            l.set_tgt_pref(lhs, nidx);
        }
        let info = l.populate(nidx, 1);
        info.dst_candidates = not_rcx;
        return Ok(());
    }
    l.set_tgt_pref(lhs, nidx);
    if !op.is_commutative() {
        l.set_delay_free(rhs, nidx);
    }
    l.populate(nidx, 1);
    Ok(())
}

fn build_unop(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::UnOp { op, val } = *l.kind(nidx) else {
        panic!()
    };
    let ty = l.ty(nidx);
    if ty.is_float() && op == UnOp::Not {
        return Err(CompilationError::Unsupported(format!("{op} on {ty}")));
    }
    // Float negation flips the sign bit with a memory operand mask.
    l.set_tgt_pref(val, nidx);
    l.populate(nidx, 1);
    Ok(())
}

fn lower_cmp(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::Cmp { pred, lhs, rhs } = *l.kind(nidx) else {
        panic!()
    };
    let size = l.ty(lhs).size();
    if l.ty(lhs).is_float() {
        // `ucomisd` only sets the flags `ja` / `jae` test directly.
        let rhs = if matches!(pred, Pred::Lt | Pred::Le | Pred::ULt | Pred::ULe) {
            l.swap_operands(nidx);
            lhs
        } else {
            rhs
        };
        if !l.try_contain_mem(bidx, rhs, nidx, size) {
            l.set_reg_optional(rhs, nidx);
        }
        return Ok(None);
    }
    let rhs = if l.int_const(lhs).is_some_and(fits_imm32) && l.int_const(rhs).is_none() {
        l.swap_operands(nidx);
        lhs
    } else {
        rhs
    };
    if !l.try_contain_imm(rhs, nidx, fits_imm32) && !l.try_contain_mem(bidx, rhs, nidx, size) {
        l.set_reg_optional(rhs, nidx);
    }
    Ok(None)
}

fn lower_load(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::Load(addr) = *l.kind(nidx) else {
        panic!()
    };
    l.try_contain_addr(bidx, addr, nidx, addr_mode_legal);
    Ok(None)
}

fn lower_store(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::Store { addr, val } = *l.kind(nidx) else {
        panic!()
    };
    l.try_contain_addr(bidx, addr, nidx, addr_mode_legal);
    if addr != val {
        l.try_contain_imm(val, nidx, fits_imm32);
    }
    Ok(None)
}

fn build_cast(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::Cast { val, unsigned, ovf } = *l.kind(nidx) else {
        panic!()
    };
    let (from, to) = (l.ty(val), l.ty(nidx));
    let info = l.populate(nidx, 1);
    if from.is_int() && to.is_float() && unsigned && from.size() == 8 {
        // Unsigned 64-bit values with the top bit set are halved, converted, then doubled.
        info.internal_int_count = 1;
    } else if from.is_float() && to.is_int() && ovf {
        // The range check compares against the limits of `to` held in a register.
        info.internal_float_count = 1;
    }
    Ok(())
}

fn lower_putarg_stk(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::PutArgStk { val, .. } = *l.kind(nidx) else {
        panic!()
    };
    l.try_contain_imm(val, nidx, fits_imm32);
    Ok(None)
}

/// Choose how to perform a block operation and contain what that strategy can encode directly.
fn lower_blk(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::Blk {
        op,
        dst,
        src,
        size,
        gc,
    } = *l.kind(nidx)
    else {
        panic!()
    };
    let (rep_limit, unroll_limit) = match (&l.target.rep, op) {
        (Some((_, rep_limit)), BlkOp::Copy) => (*rep_limit, l.target.cpblk_unroll_limit),
        (Some((_, rep_limit)), BlkOp::Init) => (*rep_limit, l.target.initblk_unroll_limit),
        (None, _) => unreachable!(),
    };
    let kind = match size {
        // Copies of GC references need write barriers.
        _ if gc && op == BlkOp::Copy => BlkKind::Helper,
        BlkSize::Const(x) if x <= unroll_limit => BlkKind::Unroll,
        BlkSize::Const(x) if x <= rep_limit => BlkKind::RepInstr,
        BlkSize::Const(_) => BlkKind::Helper,
        BlkSize::Dyn(_) => BlkKind::RepInstr,
    };
    l.infos[nidx].blk_kind = Some(kind);
    if kind == BlkKind::Unroll {
        if matches!(l.kind(dst), NodeKind::LclAddr(_)) && l.is_single_use(dst) {
            l.contain(dst, nidx);
        }
        match op {
            BlkOp::Copy => {
                if matches!(l.kind(src), NodeKind::LclAddr(_)) && l.is_single_use(src) {
                    l.contain(src, nidx);
                }
            }
            BlkOp::Init => {
                l.try_contain_imm(src, nidx, |_| true);
            }
        }
    }
    Ok(None)
}

fn build_blk(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::Blk {
        op, dst, src, size, ..
    } = *l.kind(nidx)
    else {
        panic!()
    };
    let kind = l.infos[nidx].blk_kind.unwrap();
    match kind {
        BlkKind::Unroll => {
            let BlkSize::Const(n) = size else { panic!() };
            let needs_int = match op {
                BlkOp::Copy => true,
                BlkOp::Init => l.int_const(src).is_some_and(|x| x != 0),
            };
            let info = l.populate(nidx, 0);
            // Moves of 16 bytes or more go through SSE registers.
            if n >= 16 {
                info.internal_float_count = 1;
            }
            if needs_int {
                info.internal_int_count = 1;
            }
        }
        BlkKind::RepInstr => {
            let Some((regs, _)) = &l.target.rep else {
                unreachable!()
            };
            l.set_src_candidates(dst, nidx, RegMask::from(regs.dst));
            let src_reg = match op {
                BlkOp::Copy => regs.src,
                BlkOp::Init => regs.init_val,
            };
            l.set_src_candidates(src, nidx, RegMask::from(src_reg));
            let count = RegMask::from(regs.count);
            if let BlkSize::Dyn(x) = size {
                l.set_src_candidates(x, nidx, count);
            }
            let mut kill = RegMask::from(regs.dst) | count;
            if op == BlkOp::Copy {
                kill = kill | RegMask::from(regs.src);
            }
            let info = l.populate(nidx, 0);
            if let BlkSize::Const(_) = size {
                info.internal_int_count = 1;
                info.internal_candidates = count;
            }
            info.kill_mask = kill;
        }
        BlkKind::Helper => {
            let mut ops = vec![dst, src];
            if let BlkSize::Dyn(x) = size {
                ops.push(x);
            }
            build_helper_args(l, nidx, &ops);
            let size_reg = l.target.int_arg_regs[2];
            let kill_mask = l.target.callee_trash;
            let info = l.populate(nidx, 0);
            if let BlkSize::Const(_) = size {
                info.internal_int_count = 1;
                info.internal_candidates = RegMask::from(size_reg);
            }
            info.kill_mask = kill_mask;
        }
    }
    Ok(())
}
