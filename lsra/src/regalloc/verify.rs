//! Check that resolution leaves every local where its successor block expects it.

use super::{Lsra, varloc_of};
use crate::{
    CompilationError,
    ir::{BlockIdx, LclIdx, NodeIdx, NodeKind, VarLoc},
    nodeinfo::SlotKind,
    target::Reg,
};
use index_vec::IndexVec;
use strum::IntoEnumIterator;
use vob::Vob;

impl Lsra<'_> {
    pub(super) fn verify(&self) -> Result<(), CompilationError> {
        let nblocks = self.liveness.live_in.len();
        let is_resolution = |n: &&NodeIdx| **n >= self.first_resolution_node;
        for p in (0..nblocks).map(BlockIdx::new) {
            for x in self.m.blocks[p].succs.iter().copied() {
                let (s, moves) = if x.index() >= nblocks {
                    // A block inserted on a critical edge.
                    (self.m.blocks[x].succs[0], self.m.blocks[x].nodes.clone())
                } else if self.m.blocks[p].succs.len() == 1 {
                    let mut moves = self.m.blocks[p]
                        .nodes
                        .iter()
                        .rev()
                        .take_while(is_resolution)
                        .copied()
                        .collect::<Vec<_>>();
                    moves.reverse();
                    (x, moves)
                } else {
                    let moves = self.m.blocks[x]
                        .nodes
                        .iter()
                        .take_while(is_resolution)
                        .copied()
                        .collect::<Vec<_>>();
                    (x, moves)
                };
                self.verify_edge(p, s, &moves)?;
            }
        }

        for (bidx, b) in self.m.blocks.iter_enumerated() {
            if b.succs.len() > 1 && b.nodes.iter().any(|x| is_resolution(&x)) {
                return Err(CompilationError::InternalError(format!(
                    "resolution moves in bb{}, which has multiple successors",
                    bidx.index()
                )));
            }
        }

        for (kind, n) in SlotKind::iter().zip(self.spill_slots) {
            if usize::try_from(n).unwrap() > self.config.max_spill_slots {
                return Err(CompilationError::InternalError(format!(
                    "{n} {kind} spill temps exceeds the maximum of {}",
                    self.config.max_spill_slots
                )));
            }
        }
        Ok(())
    }

    /// Replay the resolution `moves` on the edge `p -> s`, starting from `p`'s live-out
    /// locations, and check the result against `s`'s live-in locations.
    fn verify_edge(&self, p: BlockIdx, s: BlockIdx, moves: &[NodeIdx]) -> Result<(), CompilationError> {
        let err = |msg: String| {
            Err(CompilationError::InternalError(format!(
                "bb{} -> bb{}: {msg}",
                p.index(),
                s.index()
            )))
        };
        let mut regs = IndexVec::<Reg, Option<LclIdx>>::from_vec(vec![None; self.target.reg_names.len()]);
        let mut home_valid = Vob::from_elem(false, self.m.locals.len());
        let live = self.liveness.live_in[s]
            .iter_set_bits(..)
            .map(LclIdx::new)
            .collect::<Vec<_>>();
        for lidx in &live {
            match varloc_of(&self.var_out[p], *lidx) {
                Some(VarLoc::Reg(reg)) => regs[reg] = Some(*lidx),
                Some(VarLoc::Stack) => {
                    home_valid.set(lidx.index(), true);
                }
                None => return err(format!("${} has no live-out location", self.m.locals[*lidx].name)),
            }
        }

        for nidx in moves {
            match self.m.nodes[*nidx].kind {
                NodeKind::Move { lcl, from, to } => {
                    let holds = match from {
                        VarLoc::Reg(reg) => regs[reg] == Some(lcl),
                        VarLoc::Stack => home_valid[lcl.index()],
                    };
                    if !holds {
                        return err(format!("%{} moves a stale ${}", nidx.index(), self.m.locals[lcl].name));
                    }
                    match to {
                        VarLoc::Reg(reg) => regs[reg] = Some(lcl),
                        VarLoc::Stack => {
                            home_valid.set(lcl.index(), true);
                        }
                    }
                }
                NodeKind::Swap { lcls, regs: [a, b] } => {
                    if regs[a] != Some(lcls[0]) || regs[b] != Some(lcls[1]) {
                        return err(format!("%{} swaps stale locals", nidx.index()));
                    }
                    regs.swap(a, b);
                }
                _ => return err(format!("%{} is not a resolution move", nidx.index())),
            }
        }

        for lidx in live {
            let ok = match varloc_of(&self.var_in[s], lidx) {
                Some(VarLoc::Reg(reg)) => regs[reg] == Some(lidx),
                Some(VarLoc::Stack) => home_valid[lidx.index()],
                None => false,
            };
            if !ok {
                return err(format!("${} is not where bb{} expects it", self.m.locals[lidx].name, s.index()));
            }
        }
        Ok(())
    }
}
