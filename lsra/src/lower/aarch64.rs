//! arm64 lowering.
//!
//! arm64 instructions are three-address and never read memory operands, so there are no target
//! preferences, delay free uses, or reg-optional uses here. Immediates are narrow and come in
//! several encodings, one per instruction family.

use super::{
    LowerRule, Lowering, build_call, build_helper_args, build_lcl, build_putarg_reg, build_return,
    build_simple, build_store_lcl, build_unsupported, build_void, lower_call, lower_cast,
    lower_jtrue, lower_nothing, lower_return, lower_unsupported, rol_to_ror,
};
use crate::{
    CompilationError,
    ir::{BinOp, BlkOp, BlkSize, BlockIdx, NodeIdx, NodeKind, OpKind, Ty, UnOp},
    nodeinfo::BlkKind,
    target::RegMask,
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
        build: build_const_dbl,
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

/// Can `c` be encoded as the immediate of an `add`/`sub`/`cmp`/`cmn`? These take a 12-bit
/// unsigned immediate, optionally shifted left by 12. Negative values flip the operation.
fn is_add_imm(c: i64) -> bool {
    let c = c.unsigned_abs();
    c < (1 << 12) || (c & 0xfff == 0 && c < (1 << 24))
}

/// Can `c` be encoded as the immediate of a `bitw`-bit `and`/`orr`/`eor`? These take a
/// replicated, rotated, run of contiguous ones.
fn is_bitmask_imm(c: i64, bitw: u32) -> bool {
    let mut v = u64::from_ne_bytes(c.to_ne_bytes());
    if bitw < 64 {
        v &= (1 << bitw) - 1;
        let mut w = bitw;
        while w < 64 {
            v |= v << w;
            w *= 2;
        }
    }
    if v == 0 || v == u64::MAX {
        return false;
    }
    // Find the smallest element the value is a replication of.
    let mut size = 64;
    while size > 2 {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if v & mask != (v >> half) & mask {
            break;
        }
        size = half;
    }
    let mask = if size == 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    };
    let elem = v & mask;
    let ones = (1u64 << elem.count_ones()) - 1;
    (0..size).any(|r| {
        let rot = if r == 0 {
            elem
        } else {
            ((elem >> r) | (elem << (size - r))) & mask
        };
        rot == ones
    })
}

/// Can `d` be materialised directly by `fmov`? Zero is materialised with `movi`.
fn is_fmov_imm(d: f64) -> bool {
    if d.to_bits() == 0 {
        return true;
    }
    let bits = d.to_bits();
    let exp = i64::try_from((bits >> 52) & 0x7ff).unwrap() - 1023;
    bits & ((1 << 48) - 1) == 0 && (-3..=4).contains(&exp)
}

/// arm64 can encode `[base, #imm]` or `[base, index, lsl #log2(size)]`, but not both.
fn addr_mode_legal(size: u32) -> impl Fn(bool, bool, u8, i32) -> bool {
    move |has_base, has_index, scale, offset| {
        if !has_base {
            return false;
        }
        if has_index {
            offset == 0 && (scale == 1 || u32::from(scale) == size)
        } else {
            (-256..4096).contains(&offset)
        }
    }
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
        // Stores of zero use the zero register.
        l.try_contain_imm(val, nidx, |c| c == 0);
    }
    Ok(None)
}

fn lower_binop(
    l: &mut Lowering,
    bidx: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    if let Some(x) = rol_to_ror(l, bidx, nidx) {
        return Ok(Some(x));
    }
    let NodeKind::BinOp { op, lhs, rhs } = *l.kind(nidx) else {
        panic!()
    };
    let ty = l.ty(nidx);
    if ty.is_float() {
        if !matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div) {
            return Err(CompilationError::Unsupported(format!("{op} on {ty}")));
        }
        return Ok(None);
    }
    let bitw = ty.bitw();
    let fits = |op: BinOp, c: i64| match op {
        BinOp::Add | BinOp::Sub => is_add_imm(c),
        BinOp::And | BinOp::Or | BinOp::Xor => is_bitmask_imm(c, bitw),
        BinOp::Shl | BinOp::Shr | BinOp::Sar | BinOp::Ror => true,
        _ => false,
    };
    if op.is_commutative()
        && l.int_const(lhs).is_some_and(|c| fits(op, c))
        && l.int_const(rhs).is_none()
    {
        l.swap_operands(nidx);
        l.try_contain_imm(lhs, nidx, |c| fits(op, c));
    } else {
        l.try_contain_imm(rhs, nidx, |c| fits(op, c));
    }
    Ok(None)
}

fn build_binop(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::BinOp { op, .. } = *l.kind(nidx) else {
        panic!()
    };
    let is_int = l.ty(nidx).is_int();
    let info = l.populate(nidx, 1);
    if is_int && matches!(op, BinOp::Mod | BinOp::UMod) {
        // The quotient is computed into a temporary, then `msub` forms the remainder.
        info.internal_int_count = 1;
    }
    Ok(())
}

fn build_unop(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::UnOp { op, .. } = *l.kind(nidx) else {
        panic!()
    };
    let ty = l.ty(nidx);
    if ty.is_float() && op == UnOp::Not {
        return Err(CompilationError::Unsupported(format!("{op} on {ty}")));
    }
    l.populate(nidx, 1);
    Ok(())
}

fn build_const_dbl(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::ConstDbl(d) = *l.kind(nidx) else {
        panic!()
    };
    let d = match l.ty(nidx) {
        Ty::Float => f64::from(d as f32),
        _ => d,
    };
    let info = l.populate(nidx, 1);
    if !is_fmov_imm(d) {
        // The bit pattern is built in an integer register and moved across.
        info.internal_int_count = 1;
    }
    Ok(())
}

fn lower_cmp(
    l: &mut Lowering,
    _: BlockIdx,
    nidx: NodeIdx,
) -> Result<Option<NodeIdx>, CompilationError> {
    let NodeKind::Cmp { lhs, rhs, .. } = *l.kind(nidx) else {
        panic!()
    };
    if l.ty(lhs).is_float() {
        return Ok(None);
    }
    if l.int_const(lhs).is_some_and(is_add_imm) && l.int_const(rhs).is_none() {
        l.swap_operands(nidx);
        l.try_contain_imm(lhs, nidx, is_add_imm);
    } else {
        l.try_contain_imm(rhs, nidx, is_add_imm);
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
    let size = l.ty(nidx).size();
    l.try_contain_addr(bidx, addr, nidx, addr_mode_legal(size));
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
    let size = l.ty(val).size();
    l.try_contain_addr(bidx, addr, nidx, addr_mode_legal(size));
    if addr != val {
        l.try_contain_imm(val, nidx, |c| c == 0);
    }
    Ok(None)
}

fn build_cast(l: &mut Lowering, _: BlockIdx, nidx: NodeIdx) -> Result<(), CompilationError> {
    let NodeKind::Cast { val, ovf, .. } = *l.kind(nidx) else {
        panic!()
    };
    let (from, to) = (l.ty(val), l.ty(nidx));
    let info = l.populate(nidx, 1);
    if from.is_float() && to.is_int() && ovf {
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
    l.try_contain_imm(val, nidx, |c| c == 0);
    Ok(None)
}

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
    let limit = match op {
        BlkOp::Copy => l.target.cpblk_unroll_limit,
        BlkOp::Init => l.target.initblk_unroll_limit,
    };
    let kind = match size {
        _ if gc && op == BlkOp::Copy => BlkKind::Helper,
        BlkSize::Const(x) if x <= limit => BlkKind::Unroll,
        _ => BlkKind::Helper,
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
    match l.infos[nidx].blk_kind.unwrap() {
        BlkKind::Unroll => {
            let BlkSize::Const(n) = size else { panic!() };
            let ints = match op {
                // `ldp`/`stp` move 16 bytes through a pair of registers.
                BlkOp::Copy if n >= 16 => 2,
                BlkOp::Copy => 1,
                BlkOp::Init => u8::from(l.int_const(src).is_some_and(|x| x != 0)),
            };
            l.populate(nidx, 0).internal_int_count = ints;
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
        BlkKind::RepInstr => unreachable!(),
    }
    Ok(())
}
