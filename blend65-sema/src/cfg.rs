//! Per-function control flow graphs over statements.
//!
//! Statements lower to straight-line runs; `if`, the loops, `switch`,
//! `break`, `continue` and `return` split and merge blocks. Block 0 is the
//! entry; a synthetic exit block collects every return. Code after an
//! unconditional terminator lands in a block with no predecessors and is
//! kept, marked unreachable, for the dead-code analysis to warn about.
//!
//! Loops are found the classical way: a simple dominator computation over
//! the reverse postorder, then every edge whose target dominates its
//! source is a back edge and its natural loop is flooded backwards.

use blend65_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};
use blend65_frontend::ast::{ExprId, Module, Stmt, StmtId, StmtKind};

/// An opaque reference to a CFG basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// One entry in a basic block's straight-line run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CfgOp {
    /// A non-branching statement.
    Stmt(StmtId),
    /// Evaluation of a branch or switch condition.
    Cond(ExprId),
    /// The `var = from` part of a `for` statement.
    ForInit(StmtId),
    /// The `var <= to` (or `>=` for `downto`) test of a `for` statement.
    ForCond(StmtId),
    /// The `var += step` part of a `for` statement.
    ForStep(StmtId),
}

/// A basic block: a straight-line op run plus its edges.
#[derive(Clone, Default)]
pub struct BlockData {
    /// Straight-line contents in execution order.
    pub ops: Vec<CfgOp>,
    /// Successor blocks. 0 for the exit, 1 for a jump, 2 for a branch,
    /// more for a switch.
    pub succs: Vec<BlockId>,
    /// Predecessor blocks, derived from the successor lists.
    pub preds: Vec<BlockId>,
    /// False when no path from entry reaches this block.
    pub reachable: bool,
}

/// The control flow graph of one function body.
pub struct Cfg {
    blocks: PrimaryMap<BlockId, BlockData>,
    entry: BlockId,
    exit: BlockId,
    /// `(from, header)` pairs where `header` dominates `from`.
    back_edges: Vec<(BlockId, BlockId)>,
    /// Number of natural loops containing each block.
    loop_depth: SecondaryMap<BlockId, u32>,
    /// Reverse postorder over reachable blocks.
    rpo: Vec<BlockId>,
}

impl Cfg {
    /// Build the CFG for `body`.
    pub fn build(module: &Module, body: &[StmtId]) -> Cfg {
        let mut builder = Builder::new();
        builder.lower_block(module, body);
        // Falling off the end of the body reaches the exit.
        builder.seal_to(builder.exit);
        builder.finish()
    }

    /// The entry block. Always block 0.
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// The synthetic exit block collecting all returns.
    pub fn exit(&self) -> BlockId {
        self.exit
    }

    /// Shared access to a block.
    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id]
    }

    /// Number of blocks, including unreachable ones.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// All block ids in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> {
        self.blocks.keys()
    }

    /// Reverse postorder over reachable blocks; entry first.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Back edges `(from, header)` of natural loops.
    pub fn back_edges(&self) -> &[(BlockId, BlockId)] {
        &self.back_edges
    }

    /// How many nested loops contain `block`.
    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.loop_depth[block]
    }
}

struct Builder {
    blocks: PrimaryMap<BlockId, BlockData>,
    exit: BlockId,
    current: BlockId,
    /// Whether `current` already has a terminator; appending then starts a
    /// fresh (unreachable) block.
    terminated: bool,
    /// Stack of `(continue_target, break_target)` for enclosing loops.
    loops: Vec<(BlockId, BlockId)>,
}

impl Builder {
    fn new() -> Self {
        let mut blocks: PrimaryMap<BlockId, BlockData> = PrimaryMap::new();
        let entry = blocks.push(BlockData::default());
        let exit = blocks.push(BlockData::default());
        debug_assert_eq!(entry.index(), 0);
        Self {
            blocks,
            exit,
            current: entry,
            terminated: false,
            loops: Vec::new(),
        }
    }

    fn new_block(&mut self) -> BlockId {
        self.blocks.push(BlockData::default())
    }

    fn edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].succs.push(to);
    }

    /// Switch to `block` as the current insertion point.
    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
        self.terminated = false;
    }

    /// Terminate the current block with an edge to `to`.
    fn seal_to(&mut self, to: BlockId) {
        if !self.terminated {
            self.edge(self.current, to);
            self.terminated = true;
        }
    }

    fn append(&mut self, op: CfgOp) {
        if self.terminated {
            // Code after return/break/continue: record it in a fresh block
            // with no predecessors so reachability analysis can warn.
            let dead = self.new_block();
            self.switch_to(dead);
        }
        self.blocks[self.current].ops.push(op);
    }

    fn lower_block(&mut self, module: &Module, stmts: &[StmtId]) {
        for &stmt in stmts {
            self.lower_stmt(module, stmt);
        }
    }

    fn lower_stmt(&mut self, module: &Module, id: StmtId) {
        let stmt: &Stmt = module.stmt(id);
        match &stmt.kind {
            StmtKind::Expr(_)
            | StmtKind::Assign { .. }
            | StmtKind::Var(_)
            | StmtKind::InlineAsm(_) => self.append(CfgOp::Stmt(id)),

            StmtKind::Block(body) => self.lower_block(module, body),

            StmtKind::Return(_) => {
                self.append(CfgOp::Stmt(id));
                self.seal_to(self.exit);
            }

            StmtKind::Break => {
                self.append(CfgOp::Stmt(id));
                if let Some(&(_, break_to)) = self.loops.last() {
                    self.seal_to(break_to);
                } else {
                    // `break` outside a loop; diagnosed by the checker.
                    self.terminated = true;
                }
            }

            StmtKind::Continue => {
                self.append(CfgOp::Stmt(id));
                if let Some(&(continue_to, _)) = self.loops.last() {
                    self.seal_to(continue_to);
                } else {
                    self.terminated = true;
                }
            }

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.append(CfgOp::Cond(*cond));
                let then_b = self.new_block();
                let join = self.new_block();
                let else_b = if else_block.is_some() {
                    self.new_block()
                } else {
                    join
                };
                let cur = self.current;
                self.edge(cur, then_b);
                self.edge(cur, else_b);
                self.terminated = true;

                self.switch_to(then_b);
                self.lower_block(module, then_block);
                self.seal_to(join);

                if let Some(else_stmts) = else_block {
                    self.switch_to(else_b);
                    self.lower_block(module, else_stmts);
                    self.seal_to(join);
                }
                self.switch_to(join);
            }

            StmtKind::While { cond, body } => {
                let header = self.new_block();
                let body_b = self.new_block();
                let join = self.new_block();
                self.seal_to(header);

                self.switch_to(header);
                self.append(CfgOp::Cond(*cond));
                self.edge(header, body_b);
                self.edge(header, join);
                self.terminated = true;

                self.loops.push((header, join));
                self.switch_to(body_b);
                self.lower_block(module, body);
                self.seal_to(header);
                self.loops.pop();

                self.switch_to(join);
            }

            StmtKind::DoWhile { body, cond } => {
                let body_b = self.new_block();
                let cond_b = self.new_block();
                let join = self.new_block();
                self.seal_to(body_b);

                self.loops.push((cond_b, join));
                self.switch_to(body_b);
                self.lower_block(module, body);
                self.seal_to(cond_b);
                self.loops.pop();

                // The body block precedes the back-edge condition.
                self.switch_to(cond_b);
                self.append(CfgOp::Cond(*cond));
                self.edge(cond_b, body_b);
                self.edge(cond_b, join);
                self.terminated = true;

                self.switch_to(join);
            }

            StmtKind::For { body, .. } => {
                self.append(CfgOp::ForInit(id));
                let header = self.new_block();
                let body_b = self.new_block();
                let step_b = self.new_block();
                let join = self.new_block();
                self.seal_to(header);

                self.switch_to(header);
                self.append(CfgOp::ForCond(id));
                self.edge(header, body_b);
                self.edge(header, join);
                self.terminated = true;

                self.loops.push((step_b, join));
                self.switch_to(body_b);
                self.lower_block(module, body);
                self.seal_to(step_b);
                self.loops.pop();

                self.switch_to(step_b);
                self.append(CfgOp::ForStep(id));
                self.seal_to(header);

                self.switch_to(join);
            }

            StmtKind::Switch {
                value,
                cases,
                default,
            } => {
                self.append(CfgOp::Cond(*value));
                let join = self.new_block();
                let case_blocks: Vec<BlockId> =
                    (0..cases.len()).map(|_| self.new_block()).collect();
                let default_b = if default.is_some() {
                    self.new_block()
                } else {
                    join
                };
                let cur = self.current;
                for &b in &case_blocks {
                    self.edge(cur, b);
                }
                // `default` is the fallthrough target when no case matches.
                self.edge(cur, default_b);
                self.terminated = true;

                for (b, case) in case_blocks.iter().zip(cases) {
                    self.switch_to(*b);
                    self.lower_block(module, &case.body);
                    self.seal_to(join);
                }
                if let Some(default_stmts) = default {
                    self.switch_to(default_b);
                    self.lower_block(module, default_stmts);
                    self.seal_to(join);
                }
                self.switch_to(join);
            }
        }
    }

    fn finish(mut self) -> Cfg {
        // Derive predecessor lists.
        let ids: Vec<BlockId> = self.blocks.keys().collect();
        for &b in &ids {
            let succs = self.blocks[b].succs.clone();
            for s in succs {
                self.blocks[s].preds.push(b);
            }
        }

        let entry = BlockId::new(0);

        // Reachability and postorder in one DFS.
        let mut postorder = Vec::new();
        let mut visited = vec![false; self.blocks.len()];
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited[entry.index()] = true;
        while let Some((block, next)) = stack.last().copied() {
            let succs = &self.blocks[block].succs;
            if next < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        for &b in &ids {
            self.blocks[b].reachable = visited[b.index()];
        }
        let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();

        // Simple iterative dominator computation over the RPO.
        let mut rpo_index: SecondaryMap<BlockId, u32> = SecondaryMap::with_default(u32::MAX);
        for (i, &b) in rpo.iter().enumerate() {
            rpo_index[b] = i as u32;
        }
        let undef = u32::MAX as usize;
        let mut idom = vec![undef; self.blocks.len()];
        idom[entry.index()] = entry.index();
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = undef;
                for &p in &self.blocks[b].preds {
                    if idom[p.index()] == undef {
                        continue;
                    }
                    new_idom = if new_idom == undef {
                        p.index()
                    } else {
                        intersect(&idom, &rpo_index, new_idom, p.index())
                    };
                }
                if new_idom != undef && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }

        // Back edges: successor dominates the source.
        let dominates = |a: BlockId, mut b: BlockId| -> bool {
            if idom[b.index()] == undef {
                return false;
            }
            loop {
                if a == b {
                    return true;
                }
                let next = idom[b.index()];
                if next == b.index() {
                    return false;
                }
                b = BlockId::new(next);
            }
        };
        let mut back_edges = Vec::new();
        for &b in &rpo {
            for &s in &self.blocks[b].succs {
                if self.blocks[s].reachable && dominates(s, b) {
                    back_edges.push((b, s));
                }
            }
        }

        // Natural loop membership: flood backwards from the latch.
        let mut loop_depth: SecondaryMap<BlockId, u32> = SecondaryMap::new();
        for &(latch, header) in &back_edges {
            let mut in_loop = vec![false; self.blocks.len()];
            in_loop[header.index()] = true;
            let mut work = vec![latch];
            while let Some(b) = work.pop() {
                if in_loop[b.index()] {
                    continue;
                }
                in_loop[b.index()] = true;
                for &p in &self.blocks[b].preds {
                    work.push(p);
                }
            }
            for &b in &ids {
                if in_loop[b.index()] {
                    loop_depth[b] += 1;
                }
            }
        }

        Cfg {
            blocks: self.blocks,
            entry,
            exit: self.exit,
            back_edges,
            loop_depth,
            rpo,
        }
    }
}

fn intersect(
    idom: &[usize],
    rpo_index: &SecondaryMap<BlockId, u32>,
    a: usize,
    b: usize,
) -> usize {
    let (mut a, mut b) = (a, b);
    while a != b {
        while rpo_index[BlockId::new(a)] > rpo_index[BlockId::new(b)] {
            a = idom[a];
        }
        while rpo_index[BlockId::new(b)] > rpo_index[BlockId::new(a)] {
            b = idom[b];
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_frontend::diagnostics::DiagnosticSink;
    use blend65_frontend::parser::parse_module;
    use blend65_frontend::sourcemap::SourceMap;
    use blend65_frontend::Interner;

    fn cfg_of(body: &str) -> (Module, Cfg) {
        let _ = env_logger::builder().is_test(true).try_init();
        let src = format!("module T; function t(): void {{ {body} }}");
        let mut map = SourceMap::new();
        let file = map.add_file("t.b65", src.clone());
        let mut interner = Interner::new();
        let mut sink = DiagnosticSink::new(0);
        let module = parse_module(file, &src, &mut interner, &mut sink);
        assert!(!sink.has_errors(), "parse failed");
        let f = module.functions().next().unwrap();
        let body = f.body.clone().unwrap();
        let cfg = Cfg::build(&module, &body);
        (module, cfg)
    }

    #[test]
    fn straight_line_is_two_blocks() {
        let (_, cfg) = cfg_of("let x: byte = 1; x = 2;");
        // Entry and exit.
        assert_eq!(cfg.rpo().len(), 2);
        assert_eq!(cfg.block(cfg.entry()).succs, vec![cfg.exit()]);
        assert!(cfg.back_edges().is_empty());
    }

    #[test]
    fn if_splits_and_joins() {
        let (_, cfg) = cfg_of("let x: byte = 1; if (x == 1) { x = 2; } else { x = 3; } x = 4;");
        let entry = cfg.entry();
        assert_eq!(cfg.block(entry).succs.len(), 2);
        // then, else, join, entry, exit.
        assert_eq!(cfg.rpo().len(), 5);
        // Exactly one predecessor-free block besides the dead ones: entry.
        let no_preds: Vec<_> = cfg
            .blocks()
            .filter(|&b| cfg.block(b).preds.is_empty() && cfg.block(b).reachable)
            .collect();
        assert_eq!(no_preds, vec![entry]);
    }

    #[test]
    fn while_has_back_edge_and_depth() {
        let (_, cfg) = cfg_of("let i: byte = 0; while (i < 10) { i += 1; }");
        assert_eq!(cfg.back_edges().len(), 1);
        let (_latch, header) = cfg.back_edges()[0];
        assert_eq!(cfg.loop_depth(header), 1);
        assert_eq!(cfg.loop_depth(cfg.entry()), 0);
    }

    #[test]
    fn nested_loops_stack_depth() {
        let (_, cfg) = cfg_of(
            "let i: byte = 0; let j: byte = 0;\n\
             while (i < 10) { while (j < 10) { j += 1; } i += 1; }",
        );
        assert_eq!(cfg.back_edges().len(), 2);
        let max_depth = cfg.blocks().map(|b| cfg.loop_depth(b)).max().unwrap();
        assert_eq!(max_depth, 2);
    }

    #[test]
    fn do_while_body_precedes_condition() {
        let (_, cfg) = cfg_of("let i: byte = 0; do { i += 1; } while (i < 10);");
        assert_eq!(cfg.back_edges().len(), 1);
        let (latch, header) = cfg.back_edges()[0];
        // The latch is the condition block; the header is the body, which
        // therefore runs before the first test.
        assert!(matches!(cfg.block(latch).ops.last(), Some(CfgOp::Cond(_))));
        assert!(matches!(cfg.block(header).ops.first(), Some(CfgOp::Stmt(_))));
    }

    #[test]
    fn code_after_return_is_unreachable() {
        let (_, cfg) = cfg_of("return; let x: byte = 1;");
        let unreachable: Vec<_> = cfg
            .blocks()
            .filter(|&b| !cfg.block(b).reachable && !cfg.block(b).ops.is_empty())
            .collect();
        assert_eq!(unreachable.len(), 1);
    }

    #[test]
    fn break_and_continue_target_the_loop() {
        let (_, cfg) = cfg_of(
            "let i: byte = 0;\n\
             while (i < 10) { if (i == 5) { break; } continue; }",
        );
        // Loop join is reachable through the break edge.
        assert!(cfg.rpo().len() >= 6);
        assert_eq!(cfg.back_edges().len(), 1);
    }

    #[test]
    fn switch_fans_out() {
        let (_, cfg) = cfg_of(
            "let x: byte = 1;\n\
             switch (x) { case 1: x = 2; case 2: x = 3; default: x = 4; }",
        );
        // The switch block fans out to 2 cases + default.
        let fan = cfg
            .blocks()
            .map(|b| cfg.block(b).succs.len())
            .max()
            .unwrap();
        assert_eq!(fan, 3);
    }

    #[test]
    fn every_reachable_nonentry_block_has_preds() {
        let (_, cfg) = cfg_of(
            "let i: byte = 0;\n\
             for i = 0 to 9 { if (i == 3) { continue; } }\n\
             do { i += 1; } while (i < 20);",
        );
        for b in cfg.blocks() {
            let data = cfg.block(b);
            if data.reachable && b != cfg.entry() {
                assert!(!data.preds.is_empty(), "{b} has no predecessors");
            }
        }
    }
}
