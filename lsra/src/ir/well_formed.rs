//! Check that a [Method] is well formed, panicking if it is not.
//!
//! A well formed method has:
//!
//! 1. An entry block with no predecessors.
//! 2. Symmetric successor and predecessor lists, with no duplicate successors.
//! 3. Each node in at most one block, and at most once in that block.
//! 4. Every operand defined earlier in the same block as its user, and producing a value.
//! 5. Terminators only at the end of blocks: a `jtrue` block has exactly two successors, a `ret`
//!    block none, and any other non-empty block exactly one.
//! 6. Local references that refer to existing locals, with stores of the same register class as
//!    the local.

use super::{BlockIdx, Method, NodeIdx, NodeKind, Ty};
use index_vec::IndexVec;

impl Method {
    pub fn assert_well_formed(&self) {
        if self.blocks.is_empty() {
            panic!("Method '{}' has no blocks", self.name);
        }
        if !self.blocks[self.entry()].preds.is_empty() {
            panic!("The entry block of '{}' has predecessors", self.name);
        }

        let mut owner = IndexVec::<NodeIdx, Option<(BlockIdx, usize)>>::from_vec(vec![
            None;
            self.nodes.len()
        ]);
        for (bidx, b) in self.blocks.iter_enumerated() {
            for (i, succ) in b.succs.iter().enumerate() {
                if succ.index() >= self.blocks.len() {
                    panic!("bb{} has a non-existent successor", bidx.index());
                }
                if b.succs[..i].contains(succ) {
                    panic!("bb{} has duplicate successor bb{}", bidx.index(), succ.index());
                }
                if !self.blocks[*succ].preds.contains(&bidx) {
                    panic!(
                        "bb{} -> bb{} is not recorded as a predecessor edge",
                        bidx.index(),
                        succ.index()
                    );
                }
            }
            for pred in &b.preds {
                if !self.blocks[*pred].succs.contains(&bidx) {
                    panic!(
                        "bb{} <- bb{} is not recorded as a successor edge",
                        bidx.index(),
                        pred.index()
                    );
                }
            }

            for (i, nidx) in b.nodes.iter().enumerate() {
                if let Some((obidx, _)) = owner[*nidx] {
                    panic!(
                        "%{} appears in both bb{} and bb{}",
                        nidx.index(),
                        obidx.index(),
                        bidx.index()
                    );
                }
                owner[*nidx] = Some((bidx, i));
            }

            for (i, nidx) in b.nodes.iter().enumerate() {
                let node = &self.nodes[*nidx];
                for op in node.kind.operands() {
                    match owner[op] {
                        Some((obidx, j)) if obidx == bidx && j < i => (),
                        _ => panic!(
                            "%{} in bb{} uses %{}, which is not defined earlier in the same block",
                            nidx.index(),
                            bidx.index(),
                            op.index()
                        ),
                    }
                    if self.nodes[op].ty == Ty::Void {
                        panic!(
                            "%{} uses %{}, which does not produce a value",
                            nidx.index(),
                            op.index()
                        );
                    }
                }
                match &node.kind {
                    NodeKind::Lcl(lidx)
                    | NodeKind::LclAddr(lidx)
                    | NodeKind::StoreLcl { lcl: lidx, .. }
                    | NodeKind::Move { lcl: lidx, .. } => {
                        if lidx.index() >= self.locals.len() {
                            panic!("%{} refers to a non-existent local", nidx.index());
                        }
                    }
                    _ => (),
                }
                if let NodeKind::StoreLcl { lcl, val } = &node.kind {
                    let lty = self.locals[*lcl].ty;
                    let vty = self.nodes[*val].ty;
                    if lty.reg_class() != vty.reg_class() {
                        panic!(
                            "%{} stores a {vty} to ${}, which is a {lty}",
                            nidx.index(),
                            self.locals[*lcl].name
                        );
                    }
                }
                if node.kind.is_terminator() && i + 1 != b.nodes.len() {
                    panic!(
                        "%{} terminates bb{} but is not its last node",
                        nidx.index(),
                        bidx.index()
                    );
                }
            }

            let nsuccs = match b.nodes.last().map(|x| &self.nodes[*x].kind) {
                Some(NodeKind::JTrue(_)) => 2,
                Some(NodeKind::Return(_)) => 0,
                Some(NodeKind::Call { tail: true, .. }) => 0,
                _ => 1,
            };
            if b.succs.len() != nsuccs {
                panic!(
                    "bb{} has {} successors but its terminator requires {nsuccs}",
                    bidx.index(),
                    b.succs.len()
                );
            }
        }
    }
}
