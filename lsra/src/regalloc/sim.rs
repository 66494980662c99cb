//! An interpreter that runs an allocated method using only the registers and memory locations its
//! allocation names. Registers are poisoned when they are clobbered, so reading a value the
//! allocation failed to preserve fails loudly.

use super::{Allocation, varloc_of};
use crate::{
    ir::{BinOp, BlkOp, BlkSize, LclIdx, Method, NodeIdx, NodeKind, Pred, Ty, UnOp, VarLoc},
    nodeinfo::{Fixup, NodeInfos, SpillLoc},
    target::{Reg, Target},
};
use std::collections::HashMap;

/// The address of the first local's frame home.
const HOMES: u64 = 0x1000;
const HOME_SIZE: u64 = 64;
const OUT_ARGS: u64 = 0x10_0000;
/// The value every call returns is this plus the sum of its arguments.
const CALL_BIAS: u64 = 1000;
const MAX_STEPS: usize = 100_000;

enum Outcome {
    Values(Vec<u64>),
    Branch(bool),
    Return(u64),
}

pub(crate) struct Sim<'a> {
    m: &'a Method,
    infos: &'a NodeInfos,
    alloc: &'a Allocation,
    target: &'static Target,
    regs: Vec<Option<u64>>,
    mem: HashMap<u64, u64>,
    temps: HashMap<SpillLoc, u64>,
}

impl<'a> Sim<'a> {
    pub(crate) fn new(
        m: &'a Method,
        infos: &'a NodeInfos,
        alloc: &'a Allocation,
        target: &'static Target,
    ) -> Self {
        Self {
            m,
            infos,
            alloc,
            target,
            regs: vec![None; target.reg_names.len()],
            mem: HashMap::new(),
            temps: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self, args: &[u64]) -> u64 {
        let m = self.m;
        let entry = m.entry();
        for (lidx, l) in m.locals.iter_enumerated() {
            let Some(p) = l.param else {
                continue;
            };
            let v = args[p as usize];
            match varloc_of(&self.alloc.var_in[entry], lidx) {
                Some(VarLoc::Reg(reg)) => self.set(reg, Some(v)),
                _ => self.write_home(lidx, v),
            }
        }

        let mut bidx = entry;
        let mut steps = 0;
        loop {
            let mut taken = None;
            for nidx in &m.blocks[bidx].nodes {
                steps += 1;
                assert!(steps < MAX_STEPS, "step limit exceeded");
                match self.step(*nidx) {
                    Outcome::Values(_) => (),
                    Outcome::Branch(x) => taken = Some(x),
                    Outcome::Return(v) => return v,
                }
            }
            let succs = &m.blocks[bidx].succs;
            bidx = match taken {
                Some(true) => succs[0],
                Some(false) => succs[1],
                None => {
                    assert_eq!(succs.len(), 1, "bb{} falls off its end", bidx.index());
                    succs[0]
                }
            };
        }
    }

    fn get(&self, reg: Reg) -> u64 {
        self.regs[usize::from(reg.raw())]
            .unwrap_or_else(|| panic!("{} read after being clobbered", self.target.reg_name(reg)))
    }

    fn set(&mut self, reg: Reg, v: Option<u64>) {
        self.regs[usize::from(reg.raw())] = v;
    }

    fn home_addr(lidx: LclIdx) -> u64 {
        HOMES + u64::try_from(lidx.index()).unwrap() * HOME_SIZE
    }

    fn read_home(&self, lidx: LclIdx) -> u64 {
        // Homes start zeroed.
        self.mem.get(&Self::home_addr(lidx)).copied().unwrap_or(0)
    }

    fn write_home(&mut self, lidx: LclIdx, v: u64) {
        self.mem.insert(Self::home_addr(lidx), v);
    }

    fn read_loc(&self, loc: SpillLoc) -> u64 {
        match loc {
            SpillLoc::Home(lidx) => self.read_home(lidx),
            SpillLoc::Temp { .. } => *self
                .temps
                .get(&loc)
                .unwrap_or_else(|| panic!("{loc} read before being written")),
        }
    }

    fn write_loc(&mut self, loc: SpillLoc, v: u64) {
        match loc {
            SpillLoc::Home(lidx) => self.write_home(lidx, v),
            SpillLoc::Temp { .. } => {
                self.temps.insert(loc, v);
            }
        }
    }

    fn step(&mut self, nidx: NodeIdx) -> Outcome {
        let (m, infos) = (self.m, self.infos);
        let info = &infos[nidx];
        if info.contained {
            return Outcome::Values(Vec::new());
        }
        match m.nodes[nidx].kind {
            NodeKind::Move { lcl, from, to } => {
                let v = match from {
                    VarLoc::Reg(reg) => self.get(reg),
                    VarLoc::Stack => self.read_home(lcl),
                };
                match to {
                    VarLoc::Reg(reg) => self.set(reg, Some(v)),
                    VarLoc::Stack => self.write_home(lcl, v),
                }
                return Outcome::Values(Vec::new());
            }
            NodeKind::Swap { regs: [a, b], .. } => {
                self.regs.swap(usize::from(a.raw()), usize::from(b.raw()));
                return Outcome::Values(Vec::new());
            }
            _ => (),
        }
        assert!(info.allocated, "%{} was not allocated", nidx.index());

        for src in &info.srcs {
            let Some(reg) = src.reg else {
                continue;
            };
            match src.fixup {
                Fixup::None => (),
                Fixup::Reload(loc) => {
                    let v = self.read_loc(loc);
                    self.set(reg, Some(v));
                }
                Fixup::Remat => {
                    let v = self.eval(src.node, &[]);
                    self.set(reg, Some(v));
                }
                Fixup::Copy(from) => {
                    let v = self.get(from);
                    self.set(reg, Some(v));
                }
                Fixup::Move(from) => {
                    let v = self.get(from);
                    self.set(from, None);
                    self.set(reg, Some(v));
                }
            }
        }
        for src in &info.srcs {
            if let (Some(loc), Some(reg)) = (src.spill_after, src.reg) {
                let v = self.get(reg);
                self.write_loc(loc, v);
            }
        }
        let vals = info
            .srcs
            .iter()
            .map(|src| {
                let v = match (src.reg, src.mem) {
                    (Some(reg), _) => self.get(reg),
                    (None, Some(loc)) => self.read_loc(loc),
                    (None, None) => panic!("%{} has a source with no location", nidx.index()),
                };
                (src.node, v)
            })
            .collect::<Vec<_>>();

        let outcome = self.exec(nidx, &vals);
        for reg in info.internal_regs.iter().copied().chain(info.kill_mask.iter()) {
            if !info.dst_regs.contains(&reg) {
                self.set(reg, None);
            }
        }
        if let Outcome::Values(vs) = &outcome {
            assert_eq!(vs.len(), info.dst_regs.len(), "%{}", nidx.index());
            for ((reg, spill), v) in info.dst_regs.iter().zip(&info.dst_spills).zip(vs) {
                self.set(*reg, Some(*v));
                if let Some(loc) = spill {
                    self.write_loc(*loc, *v);
                }
            }
        }
        outcome
    }

    /// Execute the non-contained node `nidx` whose sources have the values `vals`.
    fn exec(&mut self, nidx: NodeIdx, vals: &[(NodeIdx, u64)]) -> Outcome {
        let (m, infos) = (self.m, self.infos);
        let info = &infos[nidx];
        match &m.nodes[nidx].kind {
            NodeKind::Lcl(_) if info.lcl_var.is_some() => Outcome::Values(Vec::new()),
            NodeKind::JTrue(cond) => Outcome::Branch(self.value(*cond, vals) != 0),
            NodeKind::Return(x) => Outcome::Return(x.map_or(0, |x| self.value(x, vals))),
            NodeKind::Nop => Outcome::Values(Vec::new()),
            NodeKind::StoreLcl { lcl, val } => {
                let v = self.value(*val, vals);
                if m.locals[*lcl].is_reg_candidate() {
                    Outcome::Values(vec![v])
                } else {
                    self.write_home(*lcl, v);
                    Outcome::Values(Vec::new())
                }
            }
            NodeKind::Store { addr, val } => {
                let (addr, v) = (self.value(*addr, vals), self.value(*val, vals));
                self.mem.insert(addr, v);
                Outcome::Values(Vec::new())
            }
            NodeKind::PutArgStk { val, slot } => {
                let v = self.value(*val, vals);
                self.mem.insert(OUT_ARGS + u64::from(*slot) * 8, v);
                Outcome::Values(Vec::new())
            }
            NodeKind::Blk {
                op, dst, src, size, ..
            } => {
                let dst = self.value(*dst, vals);
                let src = self.value(*src, vals);
                let size = match size {
                    BlkSize::Const(x) => u64::from(*x),
                    BlkSize::Dyn(x) => self.value(*x, vals),
                };
                for i in (0..size).step_by(8) {
                    let v = match op {
                        BlkOp::Copy => self.mem.get(&(src + i)).copied().unwrap_or(0),
                        BlkOp::Init => u64::from_ne_bytes([src as u8; 8]),
                    };
                    self.mem.insert(dst + i, v);
                }
                Outcome::Values(Vec::new())
            }
            NodeKind::Call { args, .. } => {
                let sum = args
                    .iter()
                    .map(|x| self.value(*x, vals))
                    .fold(CALL_BIAS, u64::wrapping_add);
                let mut vs = vec![0; info.dst_regs.len()];
                if let Some(v) = vs.first_mut() {
                    *v = sum;
                }
                Outcome::Values(vs)
            }
            _ => Outcome::Values(vec![self.eval(nidx, vals)]),
        }
    }

    /// The value of operand `op`: computed from its own operands if it is contained, or one of
    /// the consumer's source values otherwise.
    fn value(&self, op: NodeIdx, vals: &[(NodeIdx, u64)]) -> u64 {
        if self.infos[op].contained {
            self.eval(op, vals)
        } else {
            vals.iter()
                .find(|(x, _)| *x == op)
                .map(|(_, v)| *v)
                .unwrap_or_else(|| panic!("no source value for %{}", op.index()))
        }
    }

    fn eval(&self, nidx: NodeIdx, vals: &[(NodeIdx, u64)]) -> u64 {
        let node = &self.m.nodes[nidx];
        let ty = node.ty;
        let v = match node.kind {
            NodeKind::Const(x) => x as u64,
            NodeKind::ConstDbl(x) => x.to_bits(),
            NodeKind::Lcl(lidx) => {
                if self.m.locals[lidx].is_reg_candidate() {
                    self.value(nidx, vals)
                } else {
                    self.read_home(lidx)
                }
            }
            NodeKind::LclAddr(lidx) => Self::home_addr(lidx),
            NodeKind::BinOp { op, lhs, rhs } => {
                binop(op, ty, self.value(lhs, vals), self.value(rhs, vals))
            }
            NodeKind::UnOp { op, val } => {
                let v = self.value(val, vals);
                match (op, ty.is_float()) {
                    (UnOp::Neg, true) => (-f64::from_bits(v)).to_bits(),
                    (UnOp::Neg, false) => v.wrapping_neg(),
                    (UnOp::Not, _) => !v,
                }
            }
            NodeKind::Cmp { pred, lhs, rhs } => {
                let is_float = self.m.nodes[lhs].ty.is_float();
                u64::from(cmp(pred, is_float, self.value(lhs, vals), self.value(rhs, vals)))
            }
            NodeKind::Load(addr) => {
                let addr = self.value(addr, vals);
                self.mem.get(&addr).copied().unwrap_or(0)
            }
            NodeKind::Lea {
                base,
                index,
                scale,
                offset,
            } => {
                let base = base.map_or(0, |x| self.value(x, vals));
                let index = index.map_or(0, |x| self.value(x, vals));
                base.wrapping_add(index.wrapping_mul(u64::from(scale)))
                    .wrapping_add(offset as u64)
            }
            NodeKind::Cast { val, unsigned, .. } => {
                let v = self.value(val, vals);
                let from = self.m.nodes[val].ty;
                match (from.is_float(), ty.is_float()) {
                    (true, false) => f64::from_bits(v) as i64 as u64,
                    (false, true) if unsigned => (v as f64).to_bits(),
                    (false, true) => (v as i64 as f64).to_bits(),
                    _ => v,
                }
            }
            NodeKind::PutArgReg { val, .. } => self.value(val, vals),
            ref x => panic!("%{} ({x:?}) has no value", nidx.index()),
        };
        truncate(ty, v)
    }
}

fn truncate(ty: Ty, v: u64) -> u64 {
    match ty {
        Ty::Int(bitw) if bitw < 64 => v & ((1 << bitw) - 1),
        _ => v,
    }
}

fn binop(op: BinOp, ty: Ty, a: u64, b: u64) -> u64 {
    if ty.is_float() {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            _ => panic!("{op} on {ty}"),
        };
        return v.to_bits();
    }
    let sh = u32::try_from(b & 63).unwrap();
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a << sh,
        BinOp::Shr => a >> sh,
        BinOp::Sar => ((a as i64) >> sh) as u64,
        BinOp::Rol => a.rotate_left(sh),
        BinOp::Ror => a.rotate_right(sh),
        BinOp::Div => (a as i64).wrapping_div(b as i64) as u64,
        BinOp::UDiv => a / b,
        BinOp::Mod => (a as i64).wrapping_rem(b as i64) as u64,
        BinOp::UMod => a % b,
    }
}

fn cmp(pred: Pred, is_float: bool, a: u64, b: u64) -> bool {
    if is_float {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        return match pred {
            Pred::Eq => a == b,
            Pred::Ne => a != b,
            Pred::Lt | Pred::ULt => a < b,
            Pred::Le | Pred::ULe => a <= b,
            Pred::Gt | Pred::UGt => a > b,
            Pred::Ge | Pred::UGe => a >= b,
        };
    }
    let (sa, sb) = (a as i64, b as i64);
    match pred {
        Pred::Eq => a == b,
        Pred::Ne => a != b,
        Pred::Lt => sa < sb,
        Pred::Le => sa <= sb,
        Pred::Gt => sa > sb,
        Pred::Ge => sa >= sb,
        Pred::ULt => a < b,
        Pred::ULe => a <= b,
        Pred::UGt => a > b,
        Pred::UGe => a >= b,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arithmetic() {
        assert_eq!(binop(BinOp::Div, Ty::Int(64), (-7i64) as u64, 2), (-3i64) as u64);
        assert_eq!(binop(BinOp::Sar, Ty::Int(64), (-8i64) as u64, 1), (-4i64) as u64);
        assert_eq!(binop(BinOp::Shr, Ty::Int(64), 1 << 63, 63), 1);
        assert!(cmp(Pred::Lt, false, (-1i64) as u64, 0));
        assert!(!cmp(Pred::ULt, false, (-1i64) as u64, 0));
        assert_eq!(truncate(Ty::Int(8), 0x1ff), 0xff);
    }
}
