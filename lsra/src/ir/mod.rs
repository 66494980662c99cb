//! The low-level IR consumed by the allocator.
//!
//! A [Method] is a graph of [Block]s. Each block holds its nodes in execution (linear) order:
//! every node's operands appear earlier in the same block, so a walk over a block's nodes is a
//! valid evaluation order and a post-order walk of each expression tree. Values produced by nodes
//! ("temporaries") never cross block boundaries: only locals ([Local]) do.
//!
//! Nodes live in a single arena ([Method::nodes]) and are referenced by [NodeIdx]. A node may be
//! present in the arena but not in any block: lowering removes nodes it folds into others, and
//! such nodes are simply never visited again.
//!
//! ## Textual form
//!
//! Methods print (and, in tests, parse) as:
//!
//! ```text
//! local $a: i64 param 0
//! local $t: i64
//! bb0 -> bb1 bb2:
//!   %0: i64 = lcl $a
//!   %1: i64 = const 5
//!   %2: i32 = lt %0, %1
//!   jtrue %2
//! bb1 weight 10 -> bb2:
//!   ...
//! ```
//!
//! A `jtrue` block's successors are `[taken, fallthrough]`.

use crate::{
    nodeinfo::NodeInfos,
    target::{Reg, RegClass, Target},
};
use index_vec::IndexVec;
use smallvec::{SmallVec, smallvec};
use std::fmt;
use strum::{Display, EnumCount, EnumDiscriminants, EnumIter};

pub(crate) mod liveness;
#[cfg(test)]
pub(crate) mod parser;
mod well_formed;

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    pub struct LclIdx = u32;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Ty {
    Void,
    /// An integer of the given bit width (8, 16, 32, or 64).
    Int(u32),
    Ptr,
    /// A pointer to a garbage collected object.
    Ref,
    Float,
    Double,
    Struct {
        size: u32,
        /// Does this struct contain garbage collected references?
        gc: bool,
    },
}

impl Ty {
    /// The register class values of this type live in, or `None` if values of this type can't
    /// live in a single register.
    pub fn reg_class(&self) -> Option<RegClass> {
        match self {
            Ty::Int(_) | Ty::Ptr | Ty::Ref => Some(RegClass::Int),
            Ty::Float | Ty::Double => Some(RegClass::Float),
            Ty::Void | Ty::Struct { .. } => None,
        }
    }

    /// The size of this type in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Ty::Void => 0,
            Ty::Int(bitw) => bitw / 8,
            Ty::Ptr | Ty::Ref | Ty::Double => 8,
            Ty::Float => 4,
            Ty::Struct { size, .. } => *size,
        }
    }

    /// The bit width of a value of this type held in a register.
    pub fn bitw(&self) -> u32 {
        self.size() * 8
    }

    pub fn is_small_int(&self) -> bool {
        matches!(self, Ty::Int(8) | Ty::Int(16))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Ty::Int(_) | Ty::Ptr | Ty::Ref)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Float | Ty::Double)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int(bitw) => write!(f, "i{bitw}"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Ref => write!(f, "ref"),
            Ty::Float => write!(f, "f32"),
            Ty::Double => write!(f, "f64"),
            Ty::Struct { size, gc: false } => write!(f, "struct<{size}>"),
            Ty::Struct { size, gc: true } => write!(f, "struct<{size}, gc>"),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    Rol,
    Ror,
    Div,
    UDiv,
    Mod,
    UMod,
}

impl BinOp {
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor
        )
    }

    pub fn is_shift_or_rotate(&self) -> bool {
        matches!(
            self,
            BinOp::Shl | BinOp::Shr | BinOp::Sar | BinOp::Rol | BinOp::Ror
        )
    }

    pub fn is_div_or_mod(&self) -> bool {
        matches!(self, BinOp::Div | BinOp::UDiv | BinOp::Mod | BinOp::UMod)
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or | BinOp::Xor)
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum UnOp {
    Neg,
    Not,
}

/// A comparison predicate. The `U` variants compare integers as unsigned.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Pred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl Pred {
    /// The predicate `p'` such that `a p b == b p' a`.
    pub fn swapped(&self) -> Pred {
        match self {
            Pred::Eq => Pred::Eq,
            Pred::Ne => Pred::Ne,
            Pred::Lt => Pred::Gt,
            Pred::Le => Pred::Ge,
            Pred::Gt => Pred::Lt,
            Pred::Ge => Pred::Le,
            Pred::ULt => Pred::UGt,
            Pred::ULe => Pred::UGe,
            Pred::UGt => Pred::ULt,
            Pred::UGe => Pred::ULe,
        }
    }
}

/// Runtime helpers the allocator's clients may call.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Helper {
    MemCpy,
    MemSet,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CallTarget {
    Direct(String),
    Helper(Helper),
    Indirect(NodeIdx),
    /// A virtual stub dispatch call through the indirection cell computed by the operand.
    VirtualStub(NodeIdx),
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BlkOp {
    Copy,
    Init,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlkSize {
    Const(u32),
    Dyn(NodeIdx),
}

/// Where a local's value lives at a block boundary.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VarLoc {
    Reg(Reg),
    /// The local's frame home.
    Stack,
}

#[derive(Clone, Debug, EnumDiscriminants, PartialEq)]
#[strum_discriminants(name(OpKind), derive(Display, EnumCount, EnumIter, Hash))]
pub enum NodeKind {
    Const(i64),
    ConstDbl(f64),
    /// Read a local.
    Lcl(LclIdx),
    /// The address of a local's frame home.
    LclAddr(LclIdx),
    StoreLcl {
        lcl: LclIdx,
        val: NodeIdx,
    },
    BinOp {
        op: BinOp,
        lhs: NodeIdx,
        rhs: NodeIdx,
    },
    UnOp {
        op: UnOp,
        val: NodeIdx,
    },
    Cmp {
        pred: Pred,
        lhs: NodeIdx,
        rhs: NodeIdx,
    },
    /// Branch to the first successor if the operand is non-zero, otherwise to the second.
    JTrue(NodeIdx),
    Load(NodeIdx),
    Store {
        addr: NodeIdx,
        val: NodeIdx,
    },
    /// `base + index * scale + offset`. Only created by lowering.
    Lea {
        base: Option<NodeIdx>,
        index: Option<NodeIdx>,
        scale: u8,
        offset: i32,
    },
    /// Convert `val` to the node's type. `unsigned` treats the source as unsigned; `ovf` checks
    /// that the value is representable in the destination type.
    Cast {
        val: NodeIdx,
        unsigned: bool,
        ovf: bool,
    },
    Call {
        target: CallTarget,
        args: SmallVec<[NodeIdx; 4]>,
        tail: bool,
    },
    /// Move an argument into its calling convention register. Only created by lowering.
    PutArgReg {
        val: NodeIdx,
        reg: Reg,
    },
    /// Store an argument into outgoing argument slot `slot`. Only created by lowering.
    PutArgStk {
        val: NodeIdx,
        slot: u32,
    },
    /// A block copy (`src` is an address) or initialisation (`src` is the fill byte).
    Blk {
        op: BlkOp,
        dst: NodeIdx,
        src: NodeIdx,
        size: BlkSize,
        gc: bool,
    },
    Return(Option<NodeIdx>),
    Nop,
    /// A resolution move of a local between locations. Only created by the allocator.
    Move {
        lcl: LclIdx,
        from: VarLoc,
        to: VarLoc,
    },
    /// Exchange the contents of two registers holding two locals. Only created by the allocator.
    Swap {
        lcls: [LclIdx; 2],
        regs: [Reg; 2],
    },
}

impl NodeKind {
    pub fn op_kind(&self) -> OpKind {
        OpKind::from(self)
    }

    /// This node's operands, in source order.
    pub fn operands(&self) -> SmallVec<[NodeIdx; 4]> {
        match self {
            NodeKind::Const(_)
            | NodeKind::ConstDbl(_)
            | NodeKind::Lcl(_)
            | NodeKind::LclAddr(_)
            | NodeKind::Nop
            | NodeKind::Move { .. }
            | NodeKind::Swap { .. }
            | NodeKind::Return(None) => SmallVec::new(),
            NodeKind::StoreLcl { val, .. }
            | NodeKind::UnOp { val, .. }
            | NodeKind::Cast { val, .. }
            | NodeKind::PutArgReg { val, .. }
            | NodeKind::PutArgStk { val, .. }
            | NodeKind::JTrue(val)
            | NodeKind::Load(val)
            | NodeKind::Return(Some(val)) => smallvec![*val],
            NodeKind::BinOp { lhs, rhs, .. } | NodeKind::Cmp { lhs, rhs, .. } => {
                smallvec![*lhs, *rhs]
            }
            NodeKind::Store { addr, val } => smallvec![*addr, *val],
            NodeKind::Lea { base, index, .. } => base.iter().chain(index.iter()).cloned().collect(),
            NodeKind::Call { target, args, .. } => {
                let mut ops = args.clone();
                match target {
                    CallTarget::Indirect(x) | CallTarget::VirtualStub(x) => ops.push(*x),
                    CallTarget::Direct(_) | CallTarget::Helper(_) => (),
                }
                ops
            }
            NodeKind::Blk { dst, src, size, .. } => {
                let mut ops = smallvec![*dst, *src];
                if let BlkSize::Dyn(x) = size {
                    ops.push(*x);
                }
                ops
            }
        }
    }

    /// Call `f` on each of this node's operands, in the same order as [Self::operands].
    pub fn map_operands<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut NodeIdx),
    {
        match self {
            NodeKind::Const(_)
            | NodeKind::ConstDbl(_)
            | NodeKind::Lcl(_)
            | NodeKind::LclAddr(_)
            | NodeKind::Nop
            | NodeKind::Move { .. }
            | NodeKind::Swap { .. }
            | NodeKind::Return(None) => (),
            NodeKind::StoreLcl { val, .. }
            | NodeKind::UnOp { val, .. }
            | NodeKind::Cast { val, .. }
            | NodeKind::PutArgReg { val, .. }
            | NodeKind::PutArgStk { val, .. }
            | NodeKind::JTrue(val)
            | NodeKind::Load(val)
            | NodeKind::Return(Some(val)) => f(val),
            NodeKind::BinOp { lhs, rhs, .. } | NodeKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            NodeKind::Store { addr, val } => {
                f(addr);
                f(val);
            }
            NodeKind::Lea { base, index, .. } => {
                if let Some(x) = base {
                    f(x);
                }
                if let Some(x) = index {
                    f(x);
                }
            }
            NodeKind::Call { target, args, .. } => {
                for x in args.iter_mut() {
                    f(x);
                }
                match target {
                    CallTarget::Indirect(x) | CallTarget::VirtualStub(x) => f(x),
                    CallTarget::Direct(_) | CallTarget::Helper(_) => (),
                }
            }
            NodeKind::Blk { dst, src, size, .. } => {
                f(dst);
                f(src);
                if let BlkSize::Dyn(x) = size {
                    f(x);
                }
            }
        }
    }

    /// Does this node end a block?
    pub fn is_terminator(&self) -> bool {
        matches!(self, NodeKind::JTrue(_) | NodeKind::Return(_))
    }

    /// Does this node write memory or otherwise have an effect a contained load must not be moved
    /// past?
    pub fn has_mem_side_effect(&self) -> bool {
        matches!(
            self,
            NodeKind::Store { .. }
                | NodeKind::Call { .. }
                | NodeKind::Blk { .. }
                | NodeKind::PutArgStk { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// The type of the value this node produces. [Ty::Void] if it produces none.
    pub ty: Ty,
}

#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    pub ty: Ty,
    /// If this local is a parameter, its position in the argument list.
    pub param: Option<u32>,
    /// Is this local's address taken? Exposed locals always live in their frame home.
    pub exposed: bool,
}

impl Local {
    /// Can this local live in a register?
    pub fn is_reg_candidate(&self) -> bool {
        !self.exposed && self.ty.reg_class().is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    /// This block's nodes in execution order.
    pub nodes: Vec<NodeIdx>,
    pub succs: SmallVec<[BlockIdx; 2]>,
    pub preds: SmallVec<[BlockIdx; 2]>,
    /// The relative execution frequency of this block.
    pub weight: u32,
}

#[derive(Clone, Debug)]
pub struct Method {
    pub name: String,
    pub locals: IndexVec<LclIdx, Local>,
    pub nodes: IndexVec<NodeIdx, Node>,
    pub blocks: IndexVec<BlockIdx, Block>,
}

impl Method {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            locals: IndexVec::new(),
            nodes: IndexVec::new(),
            blocks: IndexVec::new(),
        }
    }

    pub fn entry(&self) -> BlockIdx {
        BlockIdx::new(0)
    }

    pub fn push_local(&mut self, local: Local) -> LclIdx {
        self.locals.push(local)
    }

    pub fn push_block(&mut self, weight: u32) -> BlockIdx {
        self.blocks.push(Block {
            nodes: Vec::new(),
            succs: SmallVec::new(),
            preds: SmallVec::new(),
            weight,
        })
    }

    pub fn add_edge(&mut self, from: BlockIdx, to: BlockIdx) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Create a node and append it to block `bidx`.
    pub fn push_node(&mut self, bidx: BlockIdx, ty: Ty, kind: NodeKind) -> NodeIdx {
        let nidx = self.nodes.push(Node { kind, ty });
        self.blocks[bidx].nodes.push(nidx);
        nidx
    }

    /// Create a node and insert it at position `pos` of block `bidx`.
    pub fn insert_node(&mut self, bidx: BlockIdx, pos: usize, ty: Ty, kind: NodeKind) -> NodeIdx {
        let nidx = self.nodes.push(Node { kind, ty });
        self.blocks[bidx].nodes.insert(pos, nidx);
        nidx
    }

    pub fn node(&self, nidx: NodeIdx) -> &Node {
        &self.nodes[nidx]
    }

    pub fn local(&self, lidx: LclIdx) -> &Local {
        &self.locals[lidx]
    }

    /// If `nidx` reads a register candidate local, return that local.
    pub fn candidate_lcl(&self, nidx: NodeIdx) -> Option<LclIdx> {
        match self.nodes[nidx].kind {
            NodeKind::Lcl(lidx) if self.locals[lidx].is_reg_candidate() => Some(lidx),
            _ => None,
        }
    }

    /// How many times is each node used as an operand by a node that is in a block?
    pub fn use_counts(&self) -> IndexVec<NodeIdx, u32> {
        let mut counts = IndexVec::from_vec(vec![0; self.nodes.len()]);
        for b in &self.blocks {
            for nidx in &b.nodes {
                for op in self.nodes[*nidx].kind.operands() {
                    counts[op] += 1;
                }
            }
        }
        counts
    }

    /// Is `from -> to` a critical edge?
    pub fn is_critical_edge(&self, from: BlockIdx, to: BlockIdx) -> bool {
        self.blocks[from].succs.len() > 1 && self.blocks[to].preds.len() > 1
    }

    /// Insert a new, empty, block on the edge `from -> to`, returning the new block.
    ///
    /// # Panics
    ///
    /// If there is no edge `from -> to`.
    pub fn split_edge(&mut self, from: BlockIdx, to: BlockIdx) -> BlockIdx {
        let weight = std::cmp::min(self.blocks[from].weight, self.blocks[to].weight);
        let new = self.blocks.push(Block {
            nodes: Vec::new(),
            succs: smallvec![to],
            preds: smallvec![from],
            weight,
        });
        let succ = self.blocks[from]
            .succs
            .iter_mut()
            .find(|x| **x == to)
            .unwrap_or_else(|| panic!("No edge bb{} -> bb{}", from.index(), to.index()));
        *succ = new;
        let pred = self.blocks[to]
            .preds
            .iter_mut()
            .find(|x| **x == from)
            .unwrap();
        *pred = new;
        new
    }

    /// Return a printer for this method. If `target` is specified, registers are printed with
    /// their names; if `infos` is specified, each node is annotated with its register
    /// requirements and allocation.
    pub fn display<'a>(
        &'a self,
        target: Option<&'a Target>,
        infos: Option<&'a NodeInfos>,
    ) -> DisplayableMethod<'a> {
        DisplayableMethod {
            m: self,
            target,
            infos,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(None, None))
    }
}

pub struct DisplayableMethod<'a> {
    m: &'a Method,
    target: Option<&'a Target>,
    infos: Option<&'a NodeInfos>,
}

impl DisplayableMethod<'_> {
    fn reg(&self, reg: Reg) -> String {
        match self.target {
            Some(t) => t.reg_name(reg).to_owned(),
            None => format!("r{}", reg.raw()),
        }
    }

    fn lcl(&self, lidx: LclIdx) -> String {
        format!("${}", self.m.locals[lidx].name)
    }

    fn varloc(&self, vloc: VarLoc) -> String {
        match vloc {
            VarLoc::Reg(reg) => self.reg(reg),
            VarLoc::Stack => "stack".to_owned(),
        }
    }

    fn fmt_node(&self, nidx: NodeIdx) -> String {
        let node = &self.m.nodes[nidx];
        let ops = |xs: &[NodeIdx]| {
            xs.iter()
                .map(|x| format!("%{}", x.index()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let rhs = match &node.kind {
            NodeKind::Const(v) => format!("const {v}"),
            NodeKind::ConstDbl(v) => format!("const {v:?}"),
            NodeKind::Lcl(lidx) => format!("lcl {}", self.lcl(*lidx)),
            NodeKind::LclAddr(lidx) => format!("lcladdr {}", self.lcl(*lidx)),
            NodeKind::StoreLcl { lcl, val } => {
                format!("stlcl {}, %{}", self.lcl(*lcl), val.index())
            }
            NodeKind::BinOp { op, lhs, rhs } => format!("{op} {}", ops(&[*lhs, *rhs])),
            NodeKind::UnOp { op, val } => format!("{op} %{}", val.index()),
            NodeKind::Cmp { pred, lhs, rhs } => format!("{pred} {}", ops(&[*lhs, *rhs])),
            NodeKind::JTrue(x) => format!("jtrue %{}", x.index()),
            NodeKind::Load(x) => format!("load %{}", x.index()),
            NodeKind::Store { addr, val } => format!("store {}", ops(&[*addr, *val])),
            NodeKind::Lea {
                base,
                index,
                scale,
                offset,
            } => {
                let opt = |x: &Option<NodeIdx>| match x {
                    Some(x) => format!("%{}", x.index()),
                    None => "_".to_owned(),
                };
                format!("lea {}, {}, {scale}, {offset}", opt(base), opt(index))
            }
            NodeKind::Cast { val, unsigned, ovf } => {
                let mut s = "cast".to_owned();
                if *unsigned {
                    s.push_str(".u");
                }
                if *ovf {
                    s.push_str(".ovf");
                }
                format!("{s} %{}", val.index())
            }
            NodeKind::Call { target, args, tail } => {
                let name = if *tail { "call.tail" } else { "call" };
                match target {
                    CallTarget::Direct(x) => format!("{name} @{x}({})", ops(args)),
                    CallTarget::Helper(x) => format!("{name} @{x}({})", ops(args)),
                    CallTarget::Indirect(x) => {
                        format!("{name} [%{}]({})", x.index(), ops(args))
                    }
                    CallTarget::VirtualStub(x) => format!("vcall [%{}]({})", x.index(), ops(args)),
                }
            }
            NodeKind::PutArgReg { val, reg } => {
                format!("putarg_reg %{}, {}", val.index(), self.reg(*reg))
            }
            NodeKind::PutArgStk { val, slot } => format!("putarg_stk %{}, {slot}", val.index()),
            NodeKind::Blk {
                op,
                dst,
                src,
                size,
                gc,
            } => {
                let gc = if *gc { ".gc" } else { "" };
                let size = match size {
                    BlkSize::Const(x) => x.to_string(),
                    BlkSize::Dyn(x) => format!("%{}", x.index()),
                };
                format!("{op}blk{gc} %{}, %{}, {size}", dst.index(), src.index())
            }
            NodeKind::Return(None) => "ret".to_owned(),
            NodeKind::Return(Some(x)) => format!("ret %{}", x.index()),
            NodeKind::Nop => "nop".to_owned(),
            NodeKind::Move { lcl, from, to } => format!(
                "move {}, {} -> {}",
                self.lcl(*lcl),
                self.varloc(*from),
                self.varloc(*to)
            ),
            NodeKind::Swap { lcls, regs } => format!(
                "swap {} {}, {} {}",
                self.lcl(lcls[0]),
                self.reg(regs[0]),
                self.lcl(lcls[1]),
                self.reg(regs[1])
            ),
        };
        let s = if node.ty == Ty::Void {
            rhs
        } else {
            format!("%{}: {} = {rhs}", nidx.index(), node.ty)
        };
        match (self.infos, self.target) {
            (Some(infos), Some(target)) => {
                let ann = infos[nidx].annotation(target);
                if ann.is_empty() {
                    s
                } else {
                    format!("{s} ; {ann}")
                }
            }
            _ => s,
        }
    }
}

impl fmt::Display for DisplayableMethod<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for l in &self.m.locals {
            write!(f, "local ${}: {}", l.name, l.ty)?;
            if let Some(x) = l.param {
                write!(f, " param {x}")?;
            }
            if l.exposed {
                write!(f, " exposed")?;
            }
            writeln!(f)?;
        }
        for (bidx, b) in self.m.blocks.iter_enumerated() {
            write!(f, "bb{}", bidx.index())?;
            if b.weight != 1 {
                write!(f, " weight {}", b.weight)?;
            }
            if !b.succs.is_empty() {
                write!(
                    f,
                    " -> {}",
                    b.succs
                        .iter()
                        .map(|x| format!("bb{}", x.index()))
                        .collect::<Vec<_>>()
                        .join(" ")
                )?;
            }
            writeln!(f, ":")?;
            for nidx in &b.nodes {
                writeln!(f, "  {}", self.fmt_node(*nidx))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{parser::str_to_method, *};

    #[test]
    fn print_parse() {
        let s = "local $a: i64 param 0
local $b: f64
local $s: struct<24, gc> exposed
bb0 -> bb1 bb2:
  %0: i64 = lcl $a
  %1: i64 = const 5
  %2: i64 = add %0, %1
  %3: i32 = ult %2, %1
  jtrue %3
bb1 weight 10 -> bb2:
  %5: f64 = const 1.5
  stlcl $b, %5
  %7: ptr = lcladdr $s
  %8: ptr = lcladdr $s
  copyblk.gc %7, %8, 24
bb2:
  %10: i64 = lcl $a
  %11: i64 = cast.u.ovf %10
  %12: i64 = call @f(%11, %11)
  ret %12
";
        let m = str_to_method(s);
        assert_eq!(m.blocks.len(), 3);
        assert_eq!(
            m.blocks[BlockIdx::new(0)].succs.as_slice(),
            &[BlockIdx::new(1), BlockIdx::new(2)]
        );
        assert_eq!(
            m.blocks[BlockIdx::new(2)].preds.as_slice(),
            &[BlockIdx::new(0), BlockIdx::new(1)]
        );
        assert_eq!(m.blocks[BlockIdx::new(1)].weight, 10);
        assert_eq!(m.locals[LclIdx::new(2)].ty, Ty::Struct { size: 24, gc: true });
        assert!(!m.locals[LclIdx::new(2)].is_reg_candidate());
        assert!(m.locals[LclIdx::new(1)].is_reg_candidate());
        assert_eq!(m.to_string(), s);
    }

    #[test]
    fn operands_in_order() {
        let k = NodeKind::Call {
            target: CallTarget::VirtualStub(NodeIdx::new(9)),
            args: smallvec![NodeIdx::new(1), NodeIdx::new(2)],
            tail: false,
        };
        assert_eq!(
            k.operands().as_slice(),
            &[NodeIdx::new(1), NodeIdx::new(2), NodeIdx::new(9)]
        );
        let mut k2 = k.clone();
        let mut seen = Vec::new();
        k2.map_operands(|x| {
            seen.push(*x);
            *x = NodeIdx::new(x.index() + 1);
        });
        assert_eq!(seen.as_slice(), k.operands().as_slice());
        assert_eq!(
            k2.operands().as_slice(),
            &[NodeIdx::new(2), NodeIdx::new(3), NodeIdx::new(10)]
        );
        assert_eq!(k.op_kind(), OpKind::Call);
    }

    #[test]
    fn split_critical_edge() {
        let mut m = str_to_method(
            "
          bb0 -> bb1 bb2:
            %0: i64 = const 1
            jtrue %0
          bb1 -> bb2:
          bb2:
            ret
        ",
        );
        let (b0, b1, b2) = (BlockIdx::new(0), BlockIdx::new(1), BlockIdx::new(2));
        assert!(m.is_critical_edge(b0, b2));
        assert!(!m.is_critical_edge(b0, b1));
        assert!(!m.is_critical_edge(b1, b2));
        let new = m.split_edge(b0, b2);
        assert_eq!(m.blocks[b0].succs.as_slice(), &[b1, new]);
        assert_eq!(m.blocks[b2].preds.as_slice(), &[new, b1]);
        assert_eq!(m.blocks[new].preds.as_slice(), &[b0]);
        assert_eq!(m.blocks[new].succs.as_slice(), &[b2]);
        assert!(!m.is_critical_edge(b0, new));
        assert!(!m.is_critical_edge(new, b2));
        m.assert_well_formed();
    }
}
