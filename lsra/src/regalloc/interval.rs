//! Intervals and reference positions.
//!
//! An [Interval] is the set of places a single value lives in a register: a register candidate
//! local (over the whole method), a temporary defined by a node (within one block), or a scratch
//! register a node needs while it executes. Each interval is referenced at a number of
//! [RefPosition]s, which are totally ordered by their location.
//!
//! Each non-contained node is given two locations `L` (even) and `L + 1`: a node's uses and
//! internal definitions happen at `L`; its kills, the last uses of its internal registers, and its
//! definitions happen at `L + 1`.

use crate::{
    ir::{BlockIdx, LclIdx, Method, NodeIdx, Ty},
    nodeinfo::{Fixup, SlotKind, SpillLoc},
    target::{Reg, RegClass, RegMask, Target},
};
use index_vec::{IndexVec, define_index_type};
use std::fmt;
use strum::Display;

define_index_type! {
    pub(crate) struct IntervalIdx = u32;
}

define_index_type! {
    pub(crate) struct RefIdx = u32;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IntervalKind {
    Local(LclIdx),
    /// Definition `def` of `node`.
    Temp { node: NodeIdx, def: u8 },
    /// A scratch register of `node`.
    Internal(NodeIdx),
}

#[derive(Debug)]
pub(crate) struct Interval {
    pub(crate) kind: IntervalKind,
    pub(crate) class: RegClass,
    pub(crate) slot_kind: SlotKind,
    /// This interval's reference positions, in location order.
    pub(crate) refs: Vec<RefIdx>,
    /// Registers this interval would like to live in.
    pub(crate) pref: RegMask,
    /// An interval whose register this interval would like to share.
    pub(crate) related: Option<IntervalIdx>,
    /// The value is a constant that can be rematerialised rather than reloaded.
    pub(crate) is_constant: bool,
    /// Is this interval live across a node that kills registers?
    pub(crate) crosses_kill: bool,

    // Allocation state.
    /// The register this interval currently occupies.
    pub(crate) reg: Option<Reg>,
    /// The most recent register this interval occupied.
    pub(crate) prev_reg: Option<Reg>,
    /// Does the interval's stack location hold its current value?
    pub(crate) stack_valid: bool,
    /// The spill temp of a temporary interval, once it has been spilled.
    pub(crate) slot: Option<SpillLoc>,
    /// The most recent reference position at which the value was in a register.
    pub(crate) last_in_reg: Option<RefIdx>,
    /// The number of this interval's reference positions allocated so far.
    pub(crate) cursor: usize,
}

impl Interval {
    pub(crate) fn new(kind: IntervalKind, ty: Ty) -> Self {
        let class = ty.reg_class().unwrap_or(RegClass::Int);
        let slot_kind = match ty {
            Ty::Ref => SlotKind::Ref,
            Ty::Float => SlotKind::Float,
            Ty::Double => SlotKind::Double,
            _ => SlotKind::Int,
        };
        Self {
            kind,
            class,
            slot_kind,
            refs: Vec::new(),
            pref: RegMask::EMPTY,
            related: None,
            is_constant: false,
            crosses_kill: false,
            reg: None,
            prev_reg: None,
            stack_valid: false,
            slot: None,
            last_in_reg: None,
            cursor: 0,
        }
    }

    pub(crate) fn local(&self) -> Option<LclIdx> {
        match self.kind {
            IntervalKind::Local(lidx) => Some(lidx),
            _ => None,
        }
    }

    /// Where this interval's value lives when it is not in a register, if anywhere yet.
    pub(crate) fn stack_loc(&self) -> Option<SpillLoc> {
        match self.kind {
            IntervalKind::Local(lidx) => Some(SpillLoc::Home(lidx)),
            _ => self.slot,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum RefType {
    Def,
    Use,
    /// The register is clobbered.
    Kill,
    /// The start of a block.
    BB,
    /// The register is required by a use or definition at this location.
    FixedReg,
    /// A parameter arrives in its register or frame home.
    ParamDef,
    /// A local that is live into the entry block without being a parameter starts zeroed in its
    /// frame home.
    ZeroInit,
    /// A local that is live into a block with no allocated predecessor starts in its frame home.
    DummyDef,
    /// A local that is live into a block takes the location it had at the end of a predecessor.
    LiveIn,
    /// A local that is live out of a block: records its location.
    LiveOut,
}

impl RefType {
    /// Does this reference position place a local at the start of a block?
    pub(crate) fn is_block_start(&self) -> bool {
        matches!(
            self,
            RefType::ParamDef | RefType::ZeroInit | RefType::DummyDef | RefType::LiveIn
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RefOwner {
    Interval(IntervalIdx),
    Reg(Reg),
    Block(BlockIdx),
}

#[derive(Debug)]
pub(crate) struct RefPosition {
    pub(crate) owner: RefOwner,
    pub(crate) ty: RefType,
    pub(crate) loc: u32,
    pub(crate) block: BlockIdx,
    /// The node this reference position belongs to, if any.
    pub(crate) node: Option<NodeIdx>,
    /// For uses, the node whose value is read.
    pub(crate) src: Option<NodeIdx>,
    /// For fixed register references, the interval that requires the register.
    pub(crate) fixed_for: Option<IntervalIdx>,
    pub(crate) candidates: RegMask,
    pub(crate) last_use: bool,
    pub(crate) delay_free: bool,
    pub(crate) reg_optional: bool,

    // The outcome of allocation.
    pub(crate) reg: Option<Reg>,
    pub(crate) fixup: Fixup,
    /// The value is used directly from this location.
    pub(crate) mem: Option<SpillLoc>,
    pub(crate) spill_after: Option<SpillLoc>,
}

impl RefPosition {
    pub(crate) fn new(owner: RefOwner, ty: RefType, loc: u32, block: BlockIdx) -> Self {
        Self {
            owner,
            ty,
            loc,
            block,
            node: None,
            src: None,
            fixed_for: None,
            candidates: RegMask::EMPTY,
            last_use: false,
            delay_free: false,
            reg_optional: false,
            reg: None,
            fixup: Fixup::None,
            mem: None,
            spill_after: None,
        }
    }

    pub(crate) fn interval(&self) -> Option<IntervalIdx> {
        match self.owner {
            RefOwner::Interval(iidx) => Some(iidx),
            _ => None,
        }
    }
}

/// Print reference positions and their intervals, one per line.
pub(crate) struct DisplayRefs<'a> {
    pub(crate) m: &'a Method,
    pub(crate) target: &'a Target,
    pub(crate) intervals: &'a IndexVec<IntervalIdx, Interval>,
    pub(crate) refs: &'a IndexVec<RefIdx, RefPosition>,
}

impl DisplayRefs<'_> {
    fn interval(&self, iidx: IntervalIdx) -> String {
        match self.intervals[iidx].kind {
            IntervalKind::Local(lidx) => format!("i{}(${})", iidx.index(), self.m.locals[lidx].name),
            IntervalKind::Temp { node, def: 0 } => format!("i{}(%{})", iidx.index(), node.index()),
            IntervalKind::Temp { node, def } => {
                format!("i{}(%{}.{def})", iidx.index(), node.index())
            }
            IntervalKind::Internal(node) => format!("i{}(tmp %{})", iidx.index(), node.index()),
        }
    }
}

impl fmt::Display for DisplayRefs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rp in self.refs {
            let owner = match rp.owner {
                RefOwner::Interval(iidx) => self.interval(iidx),
                RefOwner::Reg(reg) => self.target.reg_name(reg).to_owned(),
                RefOwner::Block(bidx) => format!("bb{}", bidx.index()),
            };
            write!(f, "{:>5} {:<8} {owner}", rp.loc, rp.ty.to_string())?;
            if let Some(n) = rp.node {
                write!(f, " @%{}", n.index())?;
            }
            if !rp.candidates.is_empty() {
                write!(f, " {}", self.target.fmt_mask(rp.candidates))?;
            }
            for (name, set) in [
                ("last", rp.last_use),
                ("delayfree", rp.delay_free),
                ("regopt", rp.reg_optional),
            ] {
                if set {
                    write!(f, " {name}")?;
                }
            }
            writeln!(f)?;
        }
        for (iidx, i) in self.intervals.iter_enumerated() {
            write!(f, "{} {}", self.interval(iidx), i.class)?;
            if !i.pref.is_empty() {
                write!(f, " pref {}", self.target.fmt_mask(i.pref))?;
            }
            if let Some(r) = i.related {
                write!(f, " related i{}", r.index())?;
            }
            if i.is_constant {
                write!(f, " const")?;
            }
            if i.crosses_kill {
                write!(f, " crosseskill")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
