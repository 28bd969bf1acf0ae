//! Variable usage counting and unused-symbol warnings.
//!
//! Read/write counts are weighted by loop nesting so the zero-page
//! ranking favors what actually runs hot. Unused warnings come in three
//! flavors: imports never referenced, variables never read, and functions
//! unreachable from any exported root.

use super::{funcs_in_order, op_effects, Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::{SymbolId, SymbolKind};
use blend65_entity::EntityRef;
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};
use rustc_hash::FxHashMap;

/// Weight of one access at a given loop depth.
fn weight(depth: u32) -> u32 {
    match depth {
        0 => 1,
        1 => 10,
        _ => 100,
    }
}

pub struct Usage;

impl Analysis for Usage {
    fn name(&self) -> &'static str {
        "usage"
    }

    fn deps(&self) -> &'static [&'static str] {
        &["callgraph"]
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        let mut reads: FxHashMap<SymbolId, u32> = FxHashMap::default();
        let mut writes: FxHashMap<SymbolId, u32> = FxHashMap::default();
        let mut hot: Vec<SymbolId> = Vec::new();

        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            for block in info.cfg.blocks() {
                let w = weight(info.cfg.loop_depth(block));
                for &op in &info.cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for r in fx.reads {
                        *reads.entry(r).or_insert(0) += w;
                        if w > 1 && !hot.contains(&r) {
                            hot.push(r);
                        }
                    }
                    for wr in fx.writes {
                        *writes.entry(wr).or_insert(0) += w;
                        if w > 1 && !hot.contains(&wr) {
                            hot.push(wr);
                        }
                    }
                }
            }
        }

        // Function reachability from exported roots.
        let mut reachable: Vec<SymbolId> = Vec::new();
        let mut work: Vec<SymbolId> = ctx
            .call_graph
            .keys()
            .filter(|&&f| ctx.sema.symbols.get(f).exported)
            .copied()
            .collect();
        work.sort();
        while let Some(f) = work.pop() {
            if reachable.contains(&f) {
                continue;
            }
            reachable.push(f);
            if let Some(callees) = ctx.call_graph.get(&f) {
                work.extend(callees.iter().copied());
            }
        }

        // Store counts and emit unused warnings, in symbol creation order
        // for determinism.
        let all: Vec<(SymbolId, SymbolKind, bool, bool)> = ctx
            .sema
            .symbols
            .iter()
            .map(|(id, s)| (id, s.kind, s.used, s.exported))
            .collect();
        for (id, kind, used, exported) in all {
            let r = reads.get(&id).copied().unwrap_or(0);
            let w = writes.get(&id).copied().unwrap_or(0);
            let sym_module = ctx.sema.symbols.get(id).module;
            if sym_module.index() >= ctx.sema.modules.len() {
                continue; // builtins
            }
            let metadata = &mut ctx.sema.modules[sym_module.index()].metadata;
            metadata.set_symbol(id, MetadataKey::ReadCount, MetadataValue::Count(r));
            metadata.set_symbol(id, MetadataKey::WriteCount, MetadataValue::Count(w));
            if hot.contains(&id) {
                metadata.set_symbol(id, MetadataKey::IsHotPath, MetadataValue::Flag(true));
            }

            let span = ctx.sema.symbols.get(id).def_span;
            let name = ctx.interner.resolve(ctx.sema.symbols.get(id).name);
            match kind {
                SymbolKind::Import if !used => {
                    ctx.sink.report(Diagnostic::new(
                        DiagCode::UnusedImport,
                        span,
                        format!("imported `{name}` is never used"),
                    ));
                }
                SymbolKind::Variable if !exported && r == 0 => {
                    ctx.sink.report(Diagnostic::new(
                        DiagCode::UnusedVariable,
                        span,
                        format!("`{name}` is never read"),
                    ));
                }
                SymbolKind::Function
                    if !exported && !reachable.contains(&id) && !used =>
                {
                    ctx.sink.report(Diagnostic::new(
                        DiagCode::UnusedFunction,
                        span,
                        format!("`{name}` is never called from an exported root"),
                    ));
                }
                _ => {}
            }
        }
    }
}
