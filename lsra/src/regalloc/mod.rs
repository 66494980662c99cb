//! Linear scan register allocation.
//!
//! Allocation of a lowered method happens in stages, each in its own module:
//!
//! 1. [build]: order the blocks, number each node's locations, and create the [Interval]s and
//!    [RefPosition]s that describe every value's register requirements.
//! 2. [alloc]: walk the reference positions in order, assigning registers and spilling values
//!    when registers run out.
//! 3. [resolve]: at each control flow edge, insert moves to reconcile the locations locals have at
//!    the end of the predecessor with those the successor expects.
//! 4. [verify] (optional): check that resolution is consistent.
//! 5. [writeback]: record the allocation on each node's [crate::nodeinfo::NodeInfo].

use crate::{
    CompilationError,
    config::Config,
    ir::{BlockIdx, LclIdx, Method, NodeIdx, VarLoc, liveness::Liveness},
    log::{
        IRPhase, Verbosity, log, log_ir, should_log_ir,
        stats::{AllocStats, Stat},
    },
    nodeinfo::{NodeInfos, SlotKind},
    target::{Reg, RegClass, RegMask, Target},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::ops::Range;
use strum::{EnumCount, IntoEnumIterator};
use vob::Vob;

mod alloc;
mod build;
mod interval;
mod resolve;
#[cfg(test)]
mod sim;
mod verify;
mod writeback;

use interval::{DisplayRefs, Interval, IntervalIdx, RefIdx, RefPosition};

/// The method-level results of allocation. Per-node results live in each node's
/// [crate::nodeinfo::NodeInfo].
#[derive(Debug)]
pub struct Allocation {
    /// The number of spill temps of each [SlotKind] the frame needs.
    pub spill_slots: [u32; SlotKind::COUNT],
    pub stats: AllocStats,
    /// The location of each live-in local at the start of each block.
    pub var_in: IndexVec<BlockIdx, Vec<(LclIdx, VarLoc)>>,
    /// The location of each live-out local at the end of each block.
    pub var_out: IndexVec<BlockIdx, Vec<(LclIdx, VarLoc)>>,
}

impl Allocation {
    /// The total number of spill temps the frame needs.
    pub fn total_spill_slots(&self) -> u32 {
        self.spill_slots.iter().sum()
    }
}

/// Assign registers to every value in the lowered method `m`, whose register requirements are
/// described by `infos`. `m` gains resolution moves and may have critical edges split; `infos`
/// gains each node's allocation.
pub(crate) fn allocate(
    m: &mut Method,
    infos: &mut NodeInfos,
    target: &'static Target,
    config: &Config,
) -> Result<Allocation, CompilationError> {
    let mut lsra = Lsra::new(m, infos, target, config);
    lsra.build_refs();
    if should_log_ir(IRPhase::RefPositions) {
        log_ir(&format!(
            "--- Begin refpositions: {} ---\n{}--- End refpositions ---\n",
            lsra.m.name,
            lsra.display_refs()
        ));
    }
    lsra.allocate_regs()?;
    lsra.resolve();
    if config.verify {
        lsra.verify()?;
    }
    lsra.write_back();
    let alloc = lsra.into_allocation();
    if log().enabled(Verbosity::AllocEvent) {
        log().log(
            Verbosity::AllocEvent,
            &format!(
                "allocated '{}': {}",
                m.name,
                Stat::iter()
                    .map(|x| format!("{x} {}", alloc.stats[x]))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );
    }
    Ok(alloc)
}

/// The state of a physical register during allocation.
#[derive(Clone, Copy, Debug, Default)]
struct RegState {
    /// The interval currently living in this register.
    assigned: Option<IntervalIdx>,
    /// The register is read or written up to and including this location.
    busy_until: Option<u32>,
    /// Has any interval been given this register in the current block?
    used_in_block: bool,
}

pub(crate) struct Lsra<'a> {
    m: &'a mut Method,
    infos: &'a mut NodeInfos,
    target: &'static Target,
    config: &'a Config,
    liveness: Liveness,

    /// The order blocks are allocated in.
    order: Vec<BlockIdx>,
    intervals: IndexVec<IntervalIdx, Interval>,
    refs: IndexVec<RefIdx, RefPosition>,
    lcl_intervals: IndexVec<LclIdx, Option<IntervalIdx>>,
    /// The temporary intervals each node defines.
    node_defs: IndexVec<NodeIdx, SmallVec<[IntervalIdx; 2]>>,
    node_locs: IndexVec<NodeIdx, Option<u32>>,
    /// The reference positions of each block, in allocation order.
    block_refs: Vec<(BlockIdx, Range<usize>)>,
    /// For each register, the locations at which it is required by a fixed reference (and the
    /// interval requiring it) or killed.
    fixed_locs: IndexVec<Reg, Vec<(u32, Option<IntervalIdx>)>>,

    regs: IndexVec<Reg, RegState>,
    /// For each kind of spill temp, whether each slot is free and, if so, the location it became
    /// free at.
    slots: [Vec<Option<u32>>; SlotKind::COUNT],
    spill_slots: [u32; SlotKind::COUNT],
    /// The register each parameter arrives in, if any.
    param_regs: IndexVec<LclIdx, Option<Reg>>,
    /// The blocks allocated so far.
    allocated: Vob,
    /// The predecessor whose live-out locations the current block starts with.
    cur_pred: Option<BlockIdx>,
    rotate: usize,
    /// Locals evicted from registers before any node of a block referenced them: each must be
    /// stored to its home at the start of the block.
    entry_spills: Vec<(BlockIdx, LclIdx, Reg)>,
    var_in: IndexVec<BlockIdx, Vec<(LclIdx, VarLoc)>>,
    var_out: IndexVec<BlockIdx, Vec<(LclIdx, VarLoc)>>,
    /// Nodes from this index onwards were inserted by resolution.
    first_resolution_node: NodeIdx,
    stats: AllocStats,
}

impl<'a> Lsra<'a> {
    fn new(
        m: &'a mut Method,
        infos: &'a mut NodeInfos,
        target: &'static Target,
        config: &'a Config,
    ) -> Self {
        let liveness = Liveness::new(m);
        let nregs = target.reg_names.len();
        let nblocks = m.blocks.len();
        let nnodes = m.nodes.len();
        let nlcls = m.locals.len();
        Self {
            liveness,
            order: Vec::new(),
            intervals: IndexVec::new(),
            refs: IndexVec::new(),
            lcl_intervals: IndexVec::from_vec(vec![None; nlcls]),
            node_defs: IndexVec::from_vec(vec![SmallVec::new(); nnodes]),
            node_locs: IndexVec::from_vec(vec![None; nnodes]),
            block_refs: Vec::new(),
            fixed_locs: IndexVec::from_vec(vec![Vec::new(); nregs]),
            regs: IndexVec::from_vec(vec![RegState::default(); nregs]),
            slots: std::array::from_fn(|_| Vec::new()),
            spill_slots: [0; SlotKind::COUNT],
            param_regs: IndexVec::from_vec(vec![None; nlcls]),
            allocated: Vob::from_elem(false, nblocks),
            cur_pred: None,
            rotate: 0,
            entry_spills: Vec::new(),
            var_in: IndexVec::from_vec(vec![Vec::new(); nblocks]),
            var_out: IndexVec::from_vec(vec![Vec::new(); nblocks]),
            first_resolution_node: NodeIdx::new(nnodes),
            stats: AllocStats::default(),
            m,
            infos,
            target,
            config,
        }
    }

    fn display_refs(&self) -> DisplayRefs<'_> {
        DisplayRefs {
            m: &*self.m,
            target: self.target,
            intervals: &self.intervals,
            refs: &self.refs,
        }
    }

    /// Restrict the multi-register candidate set `mask` of `class` according to the stress mode
    /// and register limit. Single register requirements are never restricted, and a restriction
    /// that would leave no registers is ignored.
    fn limit(&self, mask: RegMask, class: RegClass) -> RegMask {
        use crate::config::LimitRegs;
        if mask.len() <= 1 {
            return mask;
        }
        let stress = match self.config.stress.limit {
            LimitRegs::None => None,
            LimitRegs::Callee => Some(self.target.callee_saved),
            LimitRegs::Caller => Some(self.target.callee_trash),
            LimitRegs::SmallSet => Some(self.target.small_set(class)),
        };
        let mut mask = mask;
        for restrict in [stress, self.config.reg_limit].into_iter().flatten() {
            if !(mask & restrict).is_empty() {
                mask = mask & restrict;
            }
        }
        mask
    }

    /// The registers a value of `class` with no particular requirements may live in.
    fn default_candidates(&self, class: RegClass) -> RegMask {
        self.limit(self.target.allocatable(class), class)
    }

    fn lcl_interval(&self, lidx: LclIdx) -> IntervalIdx {
        self.lcl_intervals[lidx]
            .unwrap_or_else(|| panic!("${} has no interval", self.m.locals[lidx].name))
    }

    fn into_allocation(self) -> Allocation {
        Allocation {
            spill_slots: self.spill_slots,
            stats: self.stats,
            var_in: self.var_in,
            var_out: self.var_out,
        }
    }
}

/// Look up `lidx`'s location in a block boundary location list.
fn varloc_of(locs: &[(LclIdx, VarLoc)], lidx: LclIdx) -> Option<VarLoc> {
    locs.iter().find(|(x, _)| *x == lidx).map(|(_, loc)| *loc)
}

#[cfg(test)]
mod test {
    use super::sim::Sim;
    use crate::{
        CompilationError, CompiledMethod, compile_method,
        config::{Config, LimitRegs, Stress},
        ir::{BlockIdx, Method, NodeKind, VarLoc, parser::str_to_method},
        log::stats::Stat,
        nodeinfo::SlotKind,
        target::{Arch, RegMask, Target, aarch64, x64},
    };

    fn compile(ir: &str, config: &Config) -> (Method, CompiledMethod) {
        let mut m = str_to_method(ir);
        let cm = compile_method(&mut m, config).unwrap();
        (m, cm)
    }

    fn run(m: &Method, cm: &CompiledMethod, arch: Arch, args: &[u64]) -> u64 {
        Sim::new(m, &cm.infos, &cm.alloc, Target::for_arch(arch)).run(args)
    }

    fn count_moves(m: &Method, bidx: BlockIdx) -> usize {
        m.blocks[bidx]
            .nodes
            .iter()
            .filter(|x| matches!(m.nodes[**x].kind, NodeKind::Move { .. } | NodeKind::Swap { .. }))
            .count()
    }

    const ABC: &str = "
      local $a: i64
      local $b: i64
      local $c: i64
      local $t: i64
      bb0:
        %0: i64 = const 4
        stlcl $c, %0
        %2: i64 = const 2
        stlcl $a, %2
        %4: i64 = const 3
        stlcl $b, %4
        %6: i64 = lcl $a
        %7: i64 = lcl $b
        %8: i64 = add %6, %7
        %9: i64 = lcl $c
        %10: i64 = mul %8, %9
        stlcl $t, %10
        %12: i64 = lcl $t
        ret %12
    ";

    #[test]
    fn two_regs_one_spill() {
        for (arch, regs) in [
            (Arch::Arm64, [aarch64::X0, aarch64::X1]),
            (Arch::X64, [x64::RAX, x64::RCX]),
        ] {
            let config = Config::new(arch)
                .with_reg_limit(RegMask::from_regs(&regs))
                .with_verify(true);
            let (m, cm) = compile(ABC, &config);
            assert_eq!(cm.alloc.stats[Stat::Spill], 1, "{arch}");
            assert_eq!(cm.alloc.stats[Stat::Reload], 1, "{arch}");
            assert_eq!(cm.alloc.stats[Stat::MemUse], 0, "{arch}");
            assert_eq!(cm.alloc.total_spill_slots(), 0);
            assert_eq!(run(&m, &cm, arch, &[]), 20);
        }
    }

    #[test]
    fn no_pressure_no_spills() {
        for arch in [Arch::X64, Arch::Arm64] {
            let (m, cm) = compile(ABC, &Config::new(arch).with_verify(true));
            assert_eq!(cm.alloc.stats[Stat::Spill], 0);
            assert_eq!(cm.alloc.stats[Stat::Reload], 0);
            assert_eq!(run(&m, &cm, arch, &[]), 20);
        }
    }

    /// With only the two parameter registers available, `$x` is defined while `$p` occupies one
    /// of them in bb1 and while `$q` occupies the other in bb2.
    const DIAMOND: &str = "
      local $p: i64 param 0
      local $q: i64 param 1
      local $x: i64
      local $e: i64 exposed
      bb0 -> bb1 bb2:
        %0: i64 = lcl $p
        jtrue %0
      bb1 -> bb3:
        %2: i64 = const 10
        stlcl $x, %2
        %4: i64 = lcl $p
        stlcl $e, %4
      bb2 -> bb3:
        %6: i64 = const 7
        stlcl $x, %6
        %8: i64 = lcl $q
        stlcl $e, %8
      bb3:
        %10: i64 = lcl $x
        ret %10
    ";

    fn diamond_config(arch: Arch) -> Config {
        let regs = match arch {
            Arch::X64 => [x64::RDI, x64::RSI],
            Arch::Arm64 => [aarch64::X0, aarch64::X1],
        };
        Config::new(arch)
            .with_reg_limit(RegMask::from_regs(&regs))
            .with_verify(true)
    }

    #[test]
    fn diamond_resolution() {
        for arch in [Arch::X64, Arch::Arm64] {
            let (m, cm) = compile(DIAMOND, &diamond_config(arch));
            let (b0, b1, b2, b3) = (
                BlockIdx::new(0),
                BlockIdx::new(1),
                BlockIdx::new(2),
                BlockIdx::new(3),
            );
            // No edge was critical, so no blocks were added.
            assert_eq!(m.blocks.len(), 4);
            assert_eq!(count_moves(&m, b0), 0);
            assert!(count_moves(&m, b1) + count_moves(&m, b2) > 0);
            assert!(cm.alloc.stats[Stat::ResolutionMove] > 0);
            for (bidx, b) in m.blocks.iter_enumerated() {
                if b.succs.len() > 1 {
                    assert_eq!(count_moves(&m, bidx), 0);
                }
            }
            let x = m.locals.iter().position(|l| l.name == "x").unwrap();
            let x = crate::ir::LclIdx::new(x);
            let (Some(VarLoc::Reg(left)), Some(VarLoc::Reg(right))) = (
                super::varloc_of(&cm.alloc.var_out[b1], x),
                super::varloc_of(&cm.alloc.var_out[b2], x),
            ) else {
                panic!("{arch}: $x is not in a register at the end of both paths")
            };
            assert_ne!(left, right, "{arch}");
            assert!(matches!(
                super::varloc_of(&cm.alloc.var_in[b3], x),
                Some(VarLoc::Reg(_))
            ));
            // The move is on the edge out of whichever path doesn't match bb3.
            for (bidx, reg) in [(b1, left), (b2, right)] {
                let expected = usize::from(super::varloc_of(&cm.alloc.var_in[b3], x) != Some(VarLoc::Reg(reg)));
                assert_eq!(count_moves(&m, bidx), expected, "{arch}");
                assert_eq!(m.blocks[bidx].succs.len(), 1);
            }
            assert_eq!(run(&m, &cm, arch, &[1, 0]), 10);
            assert_eq!(run(&m, &cm, arch, &[0, 5]), 7);
        }
    }

    #[test]
    fn critical_edge_split() {
        // `$x` lives in a caller saved register, so the call in bb1 evicts it, while on the edge
        // bb0 -> bb2 it is still in its register.
        let ir = "
          local $p: i64 param 0
          local $x: i64
          bb0 -> bb1 bb2:
            %0: i64 = lcl $p
            %1: i64 = const 5
            %2: i64 = add %0, %1
            stlcl $x, %2
            %4: i64 = lcl $p
            jtrue %4
          bb1 weight 10 -> bb2:
            %6: i64 = call @g()
          bb2:
            %7: i64 = lcl $x
            ret %7
        ";
        for arch in [Arch::X64, Arch::Arm64] {
            let stress = Stress {
                limit: LimitRegs::Caller,
                ..Stress::default()
            };
            let config = Config::new(arch).with_stress(stress).with_verify(true);
            let (m, cm) = compile(ir, &config);
            assert_eq!(cm.alloc.stats[Stat::SplitEdge], 1, "{arch}");
            assert_eq!(m.blocks.len(), 4);
            let new = BlockIdx::new(3);
            assert_eq!(m.blocks[new].preds.as_slice(), &[BlockIdx::new(0)]);
            assert_eq!(m.blocks[new].succs.as_slice(), &[BlockIdx::new(2)]);
            assert!(m.blocks[new].nodes.iter().any(|x| matches!(
                m.nodes[*x].kind,
                NodeKind::Move {
                    from: VarLoc::Reg(_),
                    to: VarLoc::Stack,
                    ..
                }
            )));
            assert_eq!(count_moves(&m, BlockIdx::new(0)), 0);
            assert_eq!(run(&m, &cm, arch, &[0]), 5);
            assert_eq!(run(&m, &cm, arch, &[1]), 6);
        }
    }

    #[test]
    fn spill_slots_exhausted() {
        // `%1` is live across the call and there are no callee saved registers to keep it in.
        let ir = "
          local $p: i64 param 0
          bb0:
            %0: i64 = lcl $p
            %1: i64 = add %0, %0
            %2: i64 = call @g()
            %3: i64 = add %1, %2
            ret %3
        ";
        for arch in [Arch::X64, Arch::Arm64] {
            let stress = Stress {
                limit: LimitRegs::Caller,
                ..Stress::default()
            };
            let mut config = Config::new(arch).with_stress(stress).with_verify(true);
            let (m, cm) = compile(ir, &config);
            assert_eq!(cm.alloc.total_spill_slots(), 1);
            assert_eq!(cm.alloc.stats[Stat::Spill], 1);
            assert_eq!(run(&m, &cm, arch, &[21]), 1042);

            config.max_spill_slots = 0;
            let mut m = str_to_method(ir);
            match compile_method(&mut m, &config) {
                Err(CompilationError::ResourceExhausted(_)) => (),
                x => panic!("{x:?}"),
            }
        }
    }

    #[test]
    fn spill_slots_per_kind() {
        // An int and a double temp are both live across the call: each kind needs one slot.
        let ir = "
          local $p: i64 param 0
          bb0:
            %0: i64 = lcl $p
            %1: i64 = add %0, %0
            %2: f64 = cast %0
            %3: i64 = call @g()
            %4: i64 = cast %2
            %5: i64 = add %1, %4
            %6: i64 = add %5, %3
            ret %6
        ";
        for arch in [Arch::X64, Arch::Arm64] {
            let stress = Stress {
                limit: LimitRegs::Caller,
                ..Stress::default()
            };
            let mut config = Config::new(arch).with_stress(stress).with_verify(true);
            config.max_spill_slots = 1;
            let (m, cm) = compile(ir, &config);
            assert_eq!(cm.alloc.spill_slots[SlotKind::Int as usize], 1, "{arch}");
            assert_eq!(cm.alloc.spill_slots[SlotKind::Double as usize], 1, "{arch}");
            assert_eq!(cm.alloc.total_spill_slots(), 2);
            assert_eq!(run(&m, &cm, arch, &[3]), 1009);
        }
    }

    #[test]
    fn arm64_full_register_file() {
        let config = Config::new(Arch::Arm64).with_verify(true);
        let (m, cm) = compile(
            "
              bb0:
                %0: i64 = const 1
                ret %0
            ",
            &config,
        );
        assert_eq!(Target::for_arch(Arch::Arm64).reg_names.len(), 64);
        let ret = *m.blocks[m.entry()].nodes.last().unwrap();
        assert_eq!(cm.infos[ret].srcs[0].reg, Some(aarch64::X0));
        assert_eq!(run(&m, &cm, Arch::Arm64, &[]), 1);
    }

    #[test]
    fn write_back_is_idempotent() {
        let mut m = str_to_method(DIAMOND);
        let config = Config::new(Arch::X64);
        let target = Target::for_arch(Arch::X64);
        let mut infos = crate::lower::lower(&mut m, target).unwrap();
        let mut lsra = super::Lsra::new(&mut m, &mut infos, target, &config);
        lsra.build_refs();
        lsra.allocate_regs().unwrap();
        lsra.resolve();
        lsra.write_back();
        let first = lsra
            .infos
            .iter()
            .map(|x| x.annotation(target))
            .collect::<Vec<_>>();
        lsra.write_back();
        let second = lsra
            .infos
            .iter()
            .map(|x| x.annotation(target))
            .collect::<Vec<_>>();
        assert_eq!(first, second);
        assert!(first.iter().any(|x| x.starts_with("def ")));
    }

    /// Programs exercising loops, calls, fixed registers, and block boundaries, with their
    /// arguments and expected results.
    const PROGRAMS: [(&str, &[(&[u64], u64)]); 5] = [
        (
            // Sum 1..=n.
            "
              local $n: i64 param 0
              local $i: i64
              local $s: i64
              bb0 -> bb1:
                %0: i64 = const 0
                stlcl $s, %0
                %2: i64 = const 1
                stlcl $i, %2
              bb1 -> bb2 bb3:
                %4: i64 = lcl $i
                %5: i64 = lcl $n
                %6: i64 = gt %4, %5
                jtrue %6
              bb2:
                %8: i64 = lcl $s
                ret %8
              bb3 weight 8 -> bb1:
                %10: i64 = lcl $s
                %11: i64 = lcl $i
                %12: i64 = add %10, %11
                stlcl $s, %12
                %14: i64 = lcl $i
                %15: i64 = const 1
                %16: i64 = add %14, %15
                stlcl $i, %16
            ",
            &[(&[0], 0), (&[1], 1), (&[10], 55)],
        ),
        (DIAMOND, &[(&[1, 0], 10), (&[0, 5], 7)]),
        (
            // Values live across calls, and call arguments.
            "
              local $a: i64 param 0
              local $b: i64 param 1
              bb0:
                %0: i64 = lcl $a
                %1: i64 = lcl $b
                %2: i64 = sub %0, %1
                %3: i64 = lcl $a
                %4: i64 = lcl $b
                %5: i64 = call @f(%3, %4)
                %6: i64 = mul %2, %5
                %7: i64 = lcl $b
                %8: i64 = call @f(%6, %7)
                %9: i64 = add %8, %2
                ret %9
            ",
            &[(&[5, 3], 3021), (&[9, 2], 8086)],
        ),
        (
            // Division and variable shifts use fixed registers on x64.
            "
              local $a: i64 param 0
              local $b: i64 param 1
              local $c: i64 param 2
              bb0:
                %0: i64 = lcl $a
                %1: i64 = lcl $b
                %2: i64 = div %0, %1
                %3: i64 = lcl $a
                %4: i64 = lcl $b
                %5: i64 = mod %3, %4
                %6: i64 = lcl $c
                %7: i64 = shl %5, %6
                %8: i64 = lcl $c
                %9: i64 = shl %2, %8
                %10: i64 = add %7, %9
                %11: i64 = lcl $a
                %12: i64 = add %10, %11
                ret %12
            ",
            &[(&[17, 5, 2], (2 << 2) + (3 << 2) + 17), (&[100, 7, 1], (2 << 1) + (14 << 1) + 100)],
        ),
        (
            // Locals swapped around a loop: their registers form a cycle at the back edge.
            "
              local $n: i64 param 0
              local $x: i64
              local $y: i64
              bb0 -> bb1:
                %0: i64 = const 1
                stlcl $x, %0
                %2: i64 = const 2
                stlcl $y, %2
              bb1 -> bb2 bb3:
                %4: i64 = lcl $n
                %5: i64 = const 0
                %6: i64 = eq %4, %5
                jtrue %6
              bb2:
                %8: i64 = lcl $x
                %9: i64 = const 10
                %10: i64 = mul %8, %9
                %11: i64 = lcl $y
                %12: i64 = add %10, %11
                ret %12
              bb3 -> bb1:
                %14: i64 = lcl $x
                %15: i64 = lcl $y
                stlcl $x, %15
                stlcl $y, %14
                %18: i64 = lcl $n
                %19: i64 = const 1
                %20: i64 = sub %18, %19
                stlcl $n, %20
            ",
            &[(&[0], 12), (&[1], 21), (&[4], 12), (&[5], 21)],
        ),
    ];

    #[test]
    fn stress_modes() {
        // Each of the stress features on its own, and some combinations.
        let masks = [
            0x0, 0x1, 0x2, 0x3, 0x4, 0x8, 0x10, 0x20, 0x80, 0x100, 0x200, 0x400, 0x800, 0x1000,
            0x1 | 0x4 | 0x20, 0x2 | 0x8 | 0x200, 0x3 | 0x10 | 0x100 | 0x1000, 0x3 | 0x400 | 0x800,
            0x2 | 0x20 | 0x80 | 0x800, 0x1fff & !0x60 & !0x300,
        ];
        for arch in [Arch::X64, Arch::Arm64] {
            for bits in masks {
                let stress = Stress::from_bits(bits).unwrap();
                let config = Config::new(arch).with_stress(stress).with_verify(true);
                for (i, (ir, cases)) in PROGRAMS.iter().enumerate() {
                    let (m, cm) = compile(ir, &config);
                    for (args, expected) in cases.iter() {
                        assert_eq!(
                            run(&m, &cm, arch, args),
                            *expected,
                            "{arch} stress {bits:#x} program {i} args {args:?}"
                        );
                    }
                }
            }
        }
    }
}
