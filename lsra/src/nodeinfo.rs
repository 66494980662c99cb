//! Per-node register requirements and allocation results.
//!
//! Lowering populates one [NodeInfo] per node with the node's register requirements. The
//! allocator then treats requirements as read-only, and write-back records the final
//! [allocation](NodeInfo::dst_regs) on the same descriptors for consumption by code emission.
//!
//! Some fields describe how a node's value is *consumed* rather than how it is produced
//! ([NodeInfo::src_candidates], [NodeInfo::is_delay_free], [NodeInfo::is_tgt_pref],
//! [NodeInfo::reg_optional]). These are set by, and apply only to, the consumer recorded in
//! [NodeInfo::use_consumer]: other consumers of the same value use it without constraints.

use crate::{
    ir::{LclIdx, Method, NodeIdx},
    target::{Reg, RegMask, Target},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use strum::{Display, EnumCount, EnumIter};

pub type NodeInfos = IndexVec<NodeIdx, NodeInfo>;

/// How a block copy / init is performed.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BlkKind {
    /// Straight-line loads and stores.
    Unroll,
    /// A repeat-prefixed string instruction.
    RepInstr,
    /// A call to a runtime helper.
    Helper,
}

/// The kinds of spill temps. Each kind has its own pool of slots.
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum SlotKind {
    Int,
    Ref,
    Float,
    Double,
}

/// Where a value lives when it is not in a register.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SpillLoc {
    /// A local's frame home.
    Home(LclIdx),
    /// A spill temp.
    Temp { kind: SlotKind, slot: u32 },
}

impl std::fmt::Display for SpillLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpillLoc::Home(lidx) => write!(f, "home{}", lidx.index()),
            SpillLoc::Temp { kind, slot } => write!(f, "{kind}tmp{slot}"),
        }
    }
}

/// What must happen before a node executes for an operand's value to be in the register the node
/// reads it from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fixup {
    None,
    /// Load the value from memory.
    Reload(SpillLoc),
    /// The value is a constant: materialise it again.
    Remat,
    /// Copy the value from another register, which remains valid.
    Copy(Reg),
    /// Move the value from another register, which is no longer valid afterwards.
    Move(Reg),
}

/// The allocation of one source of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SrcAlloc {
    /// The node whose value is used.
    pub node: NodeIdx,
    /// The register the value is read from, or `None` if it is used directly from memory.
    pub reg: Option<Reg>,
    pub fixup: Fixup,
    /// If the value is used from memory, where it lives.
    pub mem: Option<SpillLoc>,
    /// After any fixup, and before the node executes, store the value to this location.
    pub spill_after: Option<SpillLoc>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    populated: bool,
    /// The number of register sources this node reads, including those of contained operands.
    pub src_count: u8,
    pub dst_count: u8,
    pub internal_int_count: u8,
    pub internal_float_count: u8,
    /// The registers the consumer of this node may read it from. Empty means any register of the
    /// right class.
    pub src_candidates: RegMask,
    /// The registers this node may define its value(s) in. Empty means any register of the right
    /// class.
    pub dst_candidates: RegMask,
    pub internal_candidates: RegMask,
    /// The registers this node clobbers.
    pub kill_mask: RegMask,
    /// This node's value is never consumed.
    pub is_local_def_use: bool,
    /// The consumer's register for this value must not be reused until after the consumer has
    /// defined its own value.
    pub is_delay_free: bool,
    pub has_delay_free_src: bool,
    /// The consumer would like to define its value in the same register as this value.
    pub is_tgt_pref: bool,
    /// The consumer can read this value directly from memory.
    pub reg_optional: bool,
    /// The consumer the use-side fields apply to.
    pub use_consumer: Option<NodeIdx>,
    /// This node is folded into its consumer and needs no registers of its own.
    pub contained: bool,
    /// If this node reads a register candidate local, and its consumers can read the local's
    /// register directly, the local.
    pub lcl_var: Option<LclIdx>,
    pub blk_kind: Option<BlkKind>,

    /// Has write-back recorded an allocation?
    pub allocated: bool,
    /// This node's location in the allocator's linear order.
    pub location: u32,
    pub dst_regs: SmallVec<[Reg; 2]>,
    /// For each of [Self::dst_regs], a location to store the defined value to after the node
    /// executes.
    pub dst_spills: SmallVec<[Option<SpillLoc>; 2]>,
    pub srcs: SmallVec<[SrcAlloc; 4]>,
    pub internal_regs: SmallVec<[Reg; 2]>,
}

impl NodeInfo {
    /// Set this node's register counts. This must be called exactly once per node.
    ///
    /// # Panics
    ///
    /// If this node has already been populated, or if `dst_count` exceeds the number of registers
    /// `target` can return.
    pub fn populate(&mut self, target: &Target, src_count: u8, dst_count: u8) {
        assert!(!self.populated, "Node register requirements populated twice");
        assert!(
            usize::from(dst_count) <= target.max_ret_regs,
            "dst_count {dst_count} exceeds the maximum of {}",
            target.max_ret_regs
        );
        self.populated = true;
        self.src_count = src_count;
        self.dst_count = dst_count;
    }

    /// Mark this node as contained in its consumer.
    pub fn contain(&mut self) {
        assert!(!self.populated);
        self.populated = true;
        self.contained = true;
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn defines_any_registers(&self) -> bool {
        self.dst_count > 0 || self.internal_int_count > 0 || self.internal_float_count > 0
    }

    /// Annotate this node with its allocation if write-back has run, or with its requirements
    /// otherwise.
    pub fn annotation(&self, target: &Target) -> String {
        if self.contained {
            return "contained".to_owned();
        }
        if self.allocated {
            self.fmt_alloc(target)
        } else {
            self.fmt_reqs(target)
        }
    }

    fn fmt_reqs(&self, target: &Target) -> String {
        if !self.populated {
            return String::new();
        }
        let mut parts = vec![format!("src {}", self.src_count)];
        if self.dst_count > 0 {
            parts.push(format!("dst {}", self.dst_count));
        }
        let masks = [
            ("dstcand", self.dst_candidates),
            ("srccand", self.src_candidates),
            ("intcand", self.internal_candidates),
            ("kill", self.kill_mask),
        ];
        if self.internal_int_count > 0 {
            parts.push(format!("int {}", self.internal_int_count));
        }
        if self.internal_float_count > 0 {
            parts.push(format!("float {}", self.internal_float_count));
        }
        for (name, mask) in masks {
            if !mask.is_empty() {
                parts.push(format!("{name} {}", target.fmt_mask(mask)));
            }
        }
        let flags = [
            ("localdefuse", self.is_local_def_use),
            ("delayfree", self.is_delay_free),
            ("hasdelayfreesrc", self.has_delay_free_src),
            ("tgtpref", self.is_tgt_pref),
            ("regopt", self.reg_optional),
        ];
        for (name, set) in flags {
            if set {
                parts.push(name.to_owned());
            }
        }
        if let Some(k) = self.blk_kind {
            parts.push(format!("blk {k}"));
        }
        parts.join(", ")
    }

    fn fmt_alloc(&self, target: &Target) -> String {
        let mut parts = Vec::new();
        if !self.dst_regs.is_empty() {
            let dsts = self
                .dst_regs
                .iter()
                .zip(&self.dst_spills)
                .map(|(reg, spill)| match spill {
                    Some(loc) => format!("{} spill {loc}", target.reg_name(*reg)),
                    None => target.reg_name(*reg).to_owned(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("def {dsts}"));
        }
        if !self.srcs.is_empty() {
            let srcs = self
                .srcs
                .iter()
                .map(|x| {
                    let mut s = match (x.reg, x.fixup) {
                        (None, _) => format!("mem {}", x.mem.unwrap()),
                        (Some(reg), Fixup::None) => target.reg_name(reg).to_owned(),
                        (Some(reg), Fixup::Reload(loc)) => {
                            format!("reload {loc} {}", target.reg_name(reg))
                        }
                        (Some(reg), Fixup::Remat) => format!("remat {}", target.reg_name(reg)),
                        (Some(reg), Fixup::Copy(from)) => format!(
                            "copy {}->{}",
                            target.reg_name(from),
                            target.reg_name(reg)
                        ),
                        (Some(reg), Fixup::Move(from)) => format!(
                            "move {}->{}",
                            target.reg_name(from),
                            target.reg_name(reg)
                        ),
                    };
                    if let Some(loc) = x.spill_after {
                        s.push_str(&format!(" spill {loc}"));
                    }
                    s
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("use {srcs}"));
        }
        if !self.internal_regs.is_empty() {
            parts.push(format!(
                "tmp {}",
                self.internal_regs
                    .iter()
                    .map(|x| target.reg_name(*x))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        parts.join("; ")
    }
}

/// The values `nidx` reads from registers, in order. Each is a node and which of that node's
/// definitions is read. The operands of contained operands are read by `nidx` itself.
pub(crate) fn reg_srcs(
    m: &Method,
    infos: &NodeInfos,
    nidx: NodeIdx,
) -> SmallVec<[(NodeIdx, u8); 4]> {
    let mut srcs = SmallVec::new();
    for op in m.nodes[nidx].kind.operands() {
        if infos[op].contained {
            srcs.extend(reg_srcs(m, infos, op));
        } else {
            assert!(infos[op].dst_count > 0, "%{} produces no register", op.index());
            for i in 0..infos[op].dst_count {
                srcs.push((op, i));
            }
        }
    }
    srcs
}
