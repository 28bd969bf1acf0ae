//! Purity — a fixed point over the call graph.
//!
//! A function is pure iff it writes no non-local memory and calls only
//! pure functions. Impurity seeds (memory writes, volatile intrinsics,
//! inline assembly, writes to module-level variables) propagate backwards
//! through callers until nothing changes; functions on call cycles stay
//! conservative.

use super::{funcs_in_order, op_effects, Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;
use rustc_hash::{FxHashMap, FxHashSet};

pub struct Purity;

impl Analysis for Purity {
    fn name(&self) -> &'static str {
        "purity"
    }

    fn deps(&self) -> &'static [&'static str] {
        &["callgraph"]
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        let mut impure: FxHashSet<SymbolId> = FxHashSet::default();
        let mut all_funcs: Vec<SymbolId> = Vec::new();

        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            all_funcs.push(info.symbol);

            let local = |sym: SymbolId| {
                info.locals.contains(&sym) || info.params.contains(&sym)
            };

            'blocks: for block in info.cfg.blocks() {
                for &op in &info.cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    if fx.volatile || fx.writes_memory {
                        impure.insert(info.symbol);
                        break 'blocks;
                    }
                    if fx.writes.iter().any(|&w| !local(w)) {
                        impure.insert(info.symbol);
                        break 'blocks;
                    }
                }
            }
        }

        // Reverse edges: who calls whom.
        let mut callers: FxHashMap<SymbolId, Vec<SymbolId>> = FxHashMap::default();
        for (&caller, callees) in &ctx.call_graph {
            for &callee in callees {
                callers.entry(callee).or_default().push(caller);
            }
        }

        // Calling something with no known body is conservatively impure.
        for (&caller, callees) in &ctx.call_graph {
            if callees.iter().any(|c| !ctx.call_graph.contains_key(c)) {
                impure.insert(caller);
            }
        }

        let mut work: Vec<SymbolId> = impure.iter().copied().collect();
        work.sort();
        while let Some(f) = work.pop() {
            if let Some(cs) = callers.get(&f) {
                for &caller in cs {
                    if impure.insert(caller) {
                        work.push(caller);
                    }
                }
            }
        }

        for sym in all_funcs {
            let module = ctx.sema.symbols.get(sym).module;
            let metadata = &mut ctx.sema.modules[module.index()].metadata;
            metadata.set_func(
                sym,
                MetadataKey::IsPure,
                MetadataValue::Flag(!impure.contains(&sym)),
            );
        }
    }
}
