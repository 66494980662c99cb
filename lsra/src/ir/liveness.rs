//! Block level liveness of register candidate locals.

use super::{BlockIdx, Method, NodeKind};
use index_vec::IndexVec;
use vob::Vob;

/// The live-in and live-out sets of each block, as bitsets over [super::LclIdx]s. Only register
/// candidate locals are ever live: other locals always live in their frame home and need no
/// tracking.
pub(crate) struct Liveness {
    pub(crate) live_in: IndexVec<BlockIdx, Vob>,
    pub(crate) live_out: IndexVec<BlockIdx, Vob>,
}

impl Liveness {
    pub(crate) fn new(m: &Method) -> Self {
        let nlcls = m.locals.len();
        // Per block "used before defined" and "defined" sets.
        let mut uses = IndexVec::with_capacity(m.blocks.len());
        let mut defs = IndexVec::with_capacity(m.blocks.len());
        for b in &m.blocks {
            let mut u = Vob::from_elem(false, nlcls);
            let mut d = Vob::from_elem(false, nlcls);
            for nidx in &b.nodes {
                match m.nodes[*nidx].kind {
                    NodeKind::Lcl(lidx) if m.locals[lidx].is_reg_candidate() => {
                        if d.get(lidx.index()) != Some(true) {
                            u.set(lidx.index(), true);
                        }
                    }
                    NodeKind::StoreLcl { lcl, .. } if m.locals[lcl].is_reg_candidate() => {
                        d.set(lcl.index(), true);
                    }
                    _ => (),
                }
            }
            uses.push(u);
            defs.push(d);
        }

        let mut live_in =
            IndexVec::<BlockIdx, Vob>::from_vec(vec![Vob::from_elem(false, nlcls); m.blocks.len()]);
        let mut live_out = live_in.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for bidx in m.blocks.indices().rev() {
                let mut out = Vob::from_elem(false, nlcls);
                for succ in &m.blocks[bidx].succs {
                    for i in live_in[*succ].iter_set_bits(..) {
                        out.set(i, true);
                    }
                }
                let mut inn = uses[bidx].clone();
                for i in out.iter_set_bits(..) {
                    if defs[bidx].get(i) != Some(true) {
                        inn.set(i, true);
                    }
                }
                if inn != live_in[bidx] || out != live_out[bidx] {
                    changed = true;
                    live_in[bidx] = inn;
                    live_out[bidx] = out;
                }
            }
        }
        Self { live_in, live_out }
    }
}
