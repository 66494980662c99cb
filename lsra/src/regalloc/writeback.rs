//! Record the allocation on each node's descriptor.

use super::{
    Lsra,
    interval::{IntervalKind, RefType},
};
use crate::nodeinfo::SrcAlloc;

impl Lsra<'_> {
    /// Write each node's allocation to its [crate::nodeinfo::NodeInfo]. Any previous allocation is
    /// replaced.
    pub(super) fn write_back(&mut self) {
        for (nidx, loc) in self.node_locs.iter_enumerated() {
            let Some(loc) = loc else {
                continue;
            };
            let info = &mut self.infos[nidx];
            info.allocated = true;
            info.location = *loc;
            info.dst_regs.clear();
            info.dst_spills.clear();
            info.srcs.clear();
            info.internal_regs.clear();
        }

        for rp in &self.refs {
            let (Some(nidx), Some(iidx)) = (rp.node, rp.interval()) else {
                continue;
            };
            let internal = matches!(self.intervals[iidx].kind, IntervalKind::Internal(_));
            let info = &mut self.infos[nidx];
            match rp.ty {
                RefType::Use if !internal => {
                    let Some(src) = rp.src else {
                        panic!("use at {} has no source", rp.loc)
                    };
                    info.srcs.push(SrcAlloc {
                        node: src,
                        reg: rp.reg,
                        fixup: rp.fixup,
                        mem: rp.mem,
                        spill_after: rp.spill_after,
                    });
                }
                RefType::Def => {
                    let Some(reg) = rp.reg else {
                        panic!("def at {} has no register", rp.loc)
                    };
                    if internal {
                        info.internal_regs.push(reg);
                    } else {
                        info.dst_regs.push(reg);
                        info.dst_spills.push(rp.spill_after);
                    }
                }
                _ => (),
            }
        }
    }
}
