//! Control flow over IL functions.
//!
//! A thin graph derived from the block terminators: successor and
//! predecessor lists plus reachability. Recomputed on demand after the
//! optimizer edits terminators; nothing here is incremental.

use crate::ir::{Block, Function};
use blend65_entity::SecondaryMap;
use smallvec::SmallVec;

type EdgeList = SmallVec<[Block; 4]>;

/// Successors, predecessors and reachability of one function's blocks.
pub struct ControlFlowGraph {
    succs: SecondaryMap<Block, EdgeList>,
    preds: SecondaryMap<Block, EdgeList>,
    reachable: SecondaryMap<Block, bool>,
    rpo: Vec<Block>,
}

impl ControlFlowGraph {
    /// Compute the graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut succs: SecondaryMap<Block, EdgeList> = SecondaryMap::new();
        let mut preds: SecondaryMap<Block, EdgeList> = SecondaryMap::new();
        for &block in &func.layout {
            let s = func.blocks[block].term.successors();
            for &succ in &s {
                preds[succ].push(block);
            }
            succs[block] = s;
        }

        // DFS from the entry for reachability and postorder.
        let mut reachable: SecondaryMap<Block, bool> = SecondaryMap::new();
        let mut postorder = Vec::new();
        if !func.layout.is_empty() {
            let entry = func.entry();
            let mut stack = vec![(entry, 0usize)];
            reachable[entry] = true;
            while let Some((block, next)) = stack.last().copied() {
                let s = &succs[block];
                if next < s.len() {
                    stack.last_mut().unwrap().1 += 1;
                    let succ = s[next];
                    if !reachable[succ] {
                        reachable[succ] = true;
                        stack.push((succ, 0));
                    }
                } else {
                    postorder.push(block);
                    stack.pop();
                }
            }
        }
        let rpo: Vec<Block> = postorder.into_iter().rev().collect();

        Self {
            succs,
            preds,
            reachable,
            rpo,
        }
    }

    /// Successor blocks of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.succs[block]
    }

    /// Predecessor blocks of `block`.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.preds[block]
    }

    /// Whether a path from the entry reaches `block`.
    pub fn is_reachable(&self, block: Block) -> bool {
        self.reachable.get(block).copied().unwrap_or(false)
    }

    /// Reverse postorder over reachable blocks.
    pub fn rpo(&self) -> &[Block] {
        &self.rpo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncRef, Function, FunctionBuilder, Term, Width};

    #[test]
    fn diamond_edges() {
        let mut func = Function::new(FuncRef::from_u32(0));
        let mut b = FunctionBuilder::new(&mut func);
        let cond = b.iconst(0, Width::Byte);
        let t = b.create_block();
        let e = b.create_block();
        let j = b.create_block();
        b.terminate(Term::Branch {
            cond,
            then_block: t,
            else_block: e,
        });
        b.switch_to_block(t);
        b.terminate(Term::Jump(j));
        b.switch_to_block(e);
        b.terminate(Term::Jump(j));
        b.switch_to_block(j);
        b.terminate(Term::Return(None));

        let cfg = ControlFlowGraph::with_function(&func);
        let entry = func.entry();
        assert_eq!(cfg.succs(entry), &[t, e]);
        assert_eq!(cfg.preds(j), &[t, e]);
        assert!(cfg.is_reachable(j));
        assert_eq!(cfg.rpo()[0], entry);
        assert_eq!(cfg.rpo().len(), 4);
    }

    #[test]
    fn orphan_block_is_unreachable() {
        let mut func = Function::new(FuncRef::from_u32(0));
        let mut b = FunctionBuilder::new(&mut func);
        let orphan = b.create_block();
        b.terminate(Term::Return(None));
        b.switch_to_block(orphan);
        b.terminate(Term::Return(None));

        let cfg = ControlFlowGraph::with_function(&func);
        assert!(!cfg.is_reachable(orphan));
    }
}
