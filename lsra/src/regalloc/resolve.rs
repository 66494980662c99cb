//! Reconcile the locations of locals at block boundaries.
//!
//! Each block starts with its live-in locals wherever one of its predecessors left them. On every
//! other edge into the block, locals that are somewhere else must be moved. Moves for the edge
//! `P -> S` are placed at the end of `P` if `S` is its only successor, at the start of `S` if `P`
//! is its only predecessor, and otherwise in a new block that splits the edge.

use super::{Lsra, varloc_of};
use crate::{
    ir::{BlockIdx, LclIdx, NodeIdx, NodeKind, Ty, VarLoc},
    log::stats::Stat,
    nodeinfo::NodeInfo,
    target::{Reg, RegMask},
};
use index_vec::IndexVec;

impl Lsra<'_> {
    pub(super) fn resolve(&mut self) {
        self.insert_entry_spills();
        self.first_resolution_node = NodeIdx::new(self.m.nodes.len());
        let nblocks = self.liveness.live_in.len();
        for s in (0..nblocks).map(BlockIdx::new) {
            for p in self.m.blocks[s].preds.clone() {
                self.resolve_edge(p, s);
            }
        }
        while self.infos.len() < self.m.nodes.len() {
            self.infos.push(NodeInfo::default());
        }
    }

    /// Store locals that were evicted before any node of their block referenced them to their
    /// homes at the start of the block.
    fn insert_entry_spills(&mut self) {
        let mut pos = IndexVec::<BlockIdx, usize>::from_vec(vec![0; self.m.blocks.len()]);
        for (bidx, lidx, reg) in std::mem::take(&mut self.entry_spills) {
            self.m.insert_node(
                bidx,
                pos[bidx],
                Ty::Void,
                NodeKind::Move {
                    lcl: lidx,
                    from: VarLoc::Reg(reg),
                    to: VarLoc::Stack,
                },
            );
            pos[bidx] += 1;
        }
    }

    fn resolve_edge(&mut self, p: BlockIdx, s: BlockIdx) {
        let mut moves = Vec::new();
        let mut busy = RegMask::EMPTY;
        for lidx in self.liveness.live_in[s].iter_set_bits(..).map(LclIdx::new) {
            let Some(from) = varloc_of(&self.var_out[p], lidx) else {
                panic!("${} is live into bb{} but not out of bb{}", self.m.locals[lidx].name, s.index(), p.index())
            };
            let Some(to) = varloc_of(&self.var_in[s], lidx) else {
                panic!("${} has no location at the start of bb{}", self.m.locals[lidx].name, s.index())
            };
            for loc in [from, to] {
                if let VarLoc::Reg(reg) = loc {
                    busy = busy.with(reg);
                }
            }
            if from != to {
                moves.push((lidx, from, to));
            }
        }
        if moves.is_empty() {
            return;
        }

        let nodes = order_moves(
            moves,
            |lidx| self.target.has_swap && self.m.locals[lidx].ty.is_int(),
            |lidx, pending| {
                let Some(class) = self.m.locals[lidx].ty.reg_class() else {
                    return None;
                };
                (self.default_candidates(class) - busy - pending).first()
            },
        );
        self.stats[Stat::ResolutionMove] += u64::try_from(nodes.len()).unwrap();

        let (bidx, mut pos) = if self.m.blocks[p].succs.len() == 1 {
            (p, self.m.blocks[p].nodes.len())
        } else if self.m.blocks[s].preds.len() == 1 {
            (s, 0)
        } else {
            let new = self.m.split_edge(p, s);
            self.stats.inc(Stat::SplitEdge);
            let out = self.var_out[p].clone();
            let inn = self.var_in[s].clone();
            self.var_in.push(out);
            self.var_out.push(inn);
            (new, 0)
        };
        for kind in nodes {
            self.m.insert_node(bidx, pos, Ty::Void, kind);
            pos += 1;
        }
    }
}

/// Order the moves `(local, from, to)` of one edge so that no location is overwritten before it
/// has been read. Registers are exchanged when `can_swap(local)`; otherwise cycles are broken with
/// a scratch register from `scratch(local, in_use)` or, failing that, through the local's home.
fn order_moves(
    moves: Vec<(LclIdx, VarLoc, VarLoc)>,
    can_swap: impl Fn(LclIdx) -> bool,
    scratch: impl Fn(LclIdx, RegMask) -> Option<Reg>,
) -> Vec<NodeKind> {
    let mut out = Vec::with_capacity(moves.len());
    let mut pending = Vec::new();
    let mut loads = Vec::new();
    for (lcl, from, to) in moves {
        match (from, to) {
            (VarLoc::Reg(from), VarLoc::Reg(to)) => pending.push((lcl, from, to)),
            // Stores only read registers, so they can all happen first.
            (VarLoc::Reg(_), VarLoc::Stack) => out.push(NodeKind::Move { lcl, from, to }),
            // Loads only write registers, so they can all happen last.
            (VarLoc::Stack, _) => loads.push((lcl, to)),
        }
    }

    while !pending.is_empty() {
        if let Some(i) = pending
            .iter()
            .position(|(_, _, to)| !pending.iter().any(|(_, from, _)| from == to))
        {
            let (lcl, from, to) = pending.remove(i);
            out.push(NodeKind::Move {
                lcl,
                from: VarLoc::Reg(from),
                to: VarLoc::Reg(to),
            });
            continue;
        }
        // Every remaining move is part of a cycle. Break the cycle at the first move: its target
        // is read by the move at `j`.
        let (lcl, from, to) = pending[0];
        let j = pending.iter().position(|x| x.1 == to).unwrap();
        let other = pending[j].0;
        if can_swap(lcl) {
            out.push(NodeKind::Swap {
                lcls: [lcl, other],
                regs: [from, to],
            });
            pending.remove(0);
            let j = j - 1;
            pending[j].1 = from;
            if pending[j].1 == pending[j].2 {
                pending.remove(j);
            }
        } else {
            let in_use = pending
                .iter()
                .fold(RegMask::EMPTY, |m, (_, from, to)| m.with(*from).with(*to));
            match scratch(lcl, in_use) {
                Some(tmp) => {
                    out.push(NodeKind::Move {
                        lcl: other,
                        from: VarLoc::Reg(to),
                        to: VarLoc::Reg(tmp),
                    });
                    pending[j].1 = tmp;
                }
                None => {
                    out.push(NodeKind::Move {
                        lcl: other,
                        from: VarLoc::Reg(to),
                        to: VarLoc::Stack,
                    });
                    let (_, _, other_to) = pending.remove(j);
                    loads.push((other, VarLoc::Reg(other_to)));
                }
            }
        }
    }

    for (lcl, to) in loads {
        out.push(NodeKind::Move {
            lcl,
            from: VarLoc::Stack,
            to,
        });
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::target::x64::{RAX, RBX, RCX, RDX, RSI};

    fn l(n: usize) -> LclIdx {
        LclIdx::new(n)
    }

    fn mv(lcl: usize, from: VarLoc, to: VarLoc) -> NodeKind {
        NodeKind::Move {
            lcl: l(lcl),
            from,
            to,
        }
    }

    use VarLoc::{Reg as R, Stack};

    #[test]
    fn chain() {
        // $0: rax -> rcx, $1: rcx -> rdx: $1 must move out of rcx first.
        let moves = vec![(l(0), R(RAX), R(RCX)), (l(1), R(RCX), R(RDX))];
        assert_eq!(
            order_moves(moves, |_| true, |_, _| None),
            vec![mv(1, R(RCX), R(RDX)), mv(0, R(RAX), R(RCX))]
        );
    }

    #[test]
    fn stores_first_loads_last() {
        let moves = vec![
            (l(0), Stack, R(RAX)),
            (l(1), R(RCX), R(RBX)),
            (l(2), R(RAX), Stack),
        ];
        assert_eq!(
            order_moves(moves, |_| true, |_, _| None),
            vec![
                mv(2, R(RAX), Stack),
                mv(1, R(RCX), R(RBX)),
                mv(0, Stack, R(RAX))
            ]
        );
    }

    #[test]
    fn swap_cycle() {
        let moves = vec![(l(0), R(RAX), R(RCX)), (l(1), R(RCX), R(RAX))];
        assert_eq!(
            order_moves(moves, |_| true, |_, _| None),
            vec![NodeKind::Swap {
                lcls: [l(0), l(1)],
                regs: [RAX, RCX]
            }]
        );

        // A three register rotation needs two swaps.
        let moves = vec![
            (l(0), R(RAX), R(RCX)),
            (l(1), R(RCX), R(RDX)),
            (l(2), R(RDX), R(RAX)),
        ];
        assert_eq!(
            order_moves(moves, |_| true, |_, _| None),
            vec![
                NodeKind::Swap {
                    lcls: [l(0), l(1)],
                    regs: [RAX, RCX]
                },
                NodeKind::Swap {
                    lcls: [l(1), l(2)],
                    regs: [RAX, RDX]
                },
            ]
        );
    }

    #[test]
    fn scratch_cycle() {
        let moves = vec![(l(0), R(RAX), R(RCX)), (l(1), R(RCX), R(RAX))];
        let nodes = order_moves(
            moves,
            |_| false,
            |_, in_use| {
                assert!(in_use.contains(RAX) && in_use.contains(RCX));
                Some(RSI)
            },
        );
        assert_eq!(
            nodes,
            vec![
                mv(1, R(RCX), R(RSI)),
                mv(0, R(RAX), R(RCX)),
                mv(1, R(RSI), R(RAX)),
            ]
        );
    }

    #[test]
    fn home_cycle() {
        let moves = vec![(l(0), R(RAX), R(RCX)), (l(1), R(RCX), R(RAX))];
        assert_eq!(
            order_moves(moves, |_| false, |_, _| None),
            vec![
                mv(1, R(RCX), Stack),
                mv(0, R(RAX), R(RCX)),
                mv(1, Stack, R(RAX)),
            ]
        );
    }
}
