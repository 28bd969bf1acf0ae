//! Direct call graph construction and recursion detection.
//!
//! The language has no function pointers beyond `callback`, so the call
//! graph is exact for direct calls. Recursion is allowed but the hardware
//! stack is 256 bytes, so every cycle gets a warning naming its members.

use super::{funcs_in_order, op_effects, Analysis, AnalysisCtx};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};
use rustc_hash::FxHashMap;

pub struct CallGraph;

impl Analysis for CallGraph {
    fn name(&self) -> &'static str {
        "callgraph"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        let mut edges: FxHashMap<SymbolId, Vec<SymbolId>> = FxHashMap::default();

        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let mut callees: Vec<SymbolId> = Vec::new();
            for block in info.cfg.blocks() {
                for &op in &info.cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for callee in fx.calls {
                        if !callees.contains(&callee) {
                            callees.push(callee);
                        }
                    }
                }
            }
            edges.insert(info.symbol, callees);
        }

        // Cycle detection over the call graph, DFS with coloring.
        #[derive(Copy, Clone, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color: FxHashMap<SymbolId, Color> = FxHashMap::default();
        let mut cycles: Vec<Vec<SymbolId>> = Vec::new();

        // Deterministic start order: creation order of the symbols.
        let mut roots: Vec<SymbolId> = edges.keys().copied().collect();
        roots.sort();

        fn visit(
            node: SymbolId,
            edges: &FxHashMap<SymbolId, Vec<SymbolId>>,
            color: &mut FxHashMap<SymbolId, Color>,
            stack: &mut Vec<SymbolId>,
            cycles: &mut Vec<Vec<SymbolId>>,
        ) {
            color.insert(node, Color::Grey);
            stack.push(node);
            if let Some(callees) = edges.get(&node) {
                for &callee in callees {
                    match color.get(&callee).copied().unwrap_or(Color::White) {
                        Color::White => {
                            if edges.contains_key(&callee) {
                                visit(callee, edges, color, stack, cycles);
                            }
                        }
                        Color::Grey => {
                            let from = stack.iter().position(|&s| s == callee).unwrap();
                            cycles.push(stack[from..].to_vec());
                        }
                        Color::Black => {}
                    }
                }
            }
            stack.pop();
            color.insert(node, Color::Black);
        }

        let mut stack = Vec::new();
        for root in roots {
            if color.get(&root).copied().unwrap_or(Color::White) == Color::White {
                visit(root, &edges, &mut color, &mut stack, &mut cycles);
            }
        }

        for cycle in cycles {
            let names: Vec<&str> = cycle
                .iter()
                .map(|&s| ctx.interner.resolve(ctx.sema.symbols.get(s).name))
                .collect();
            let head = ctx.sema.symbols.get(cycle[0]);
            ctx.sink.report(Diagnostic::new(
                DiagCode::RecursiveCall,
                head.def_span,
                format!(
                    "recursive call cycle: {}; the 6502 stack is 256 bytes",
                    names.join(" -> ")
                ),
            ));
        }

        ctx.call_graph = edges;
    }
}
