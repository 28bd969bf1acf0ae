//! Zero-page promotion ranking.
//!
//! The zero page is the contended resource: it is both the fastest memory
//! and the only home for pointers used in indirect addressing. Variables
//! are ranked by `reads + 2*writes` (already loop-weighted by the usage
//! pass) and the best of them are suggested for zero-page storage until
//! the target budget runs out. Explicit `@zp` declarations are honored
//! first; if they alone exceed the budget that is a hard error.

use super::{Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::{Storage, SymbolId, SymbolKind};
use blend65_entity::EntityRef;
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};

pub struct ZeroPageHint;

impl Analysis for ZeroPageHint {
    fn name(&self) -> &'static str {
        "zp-hint"
    }

    fn deps(&self) -> &'static [&'static str] {
        &["usage", "liveness"]
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        // Eight bytes of the window belong to the runtime scratch area
        // the code generator reserves.
        let mut budget = ctx.sema.layout.zp_available().saturating_sub(8);

        // Candidates: every non-map variable with a type. Explicit `@zp`
        // first, charged against the budget unconditionally.
        let mut explicit: Vec<(SymbolId, u32)> = Vec::new();
        let mut candidates: Vec<(SymbolId, u32, u32)> = Vec::new();
        for (id, sym) in ctx.sema.symbols.iter() {
            if !matches!(sym.kind, SymbolKind::Variable | SymbolKind::Parameter) {
                continue;
            }
            if sym.module.index() >= ctx.sema.modules.len() {
                continue;
            }
            let size = sym.ty.map(|t| ctx.sema.types.size_of(t)).unwrap_or(1);
            if sym.storage == Storage::Zp {
                explicit.push((id, size));
                continue;
            }
            if sym.storage != Storage::Auto {
                continue;
            }
            let md = &ctx.sema.modules[sym.module.index()].metadata;
            let reads = md
                .symbol(id, MetadataKey::ReadCount)
                .and_then(MetadataValue::as_count)
                .unwrap_or(0);
            let writes = md
                .symbol(id, MetadataKey::WriteCount)
                .and_then(MetadataValue::as_count)
                .unwrap_or(0);
            let score = reads + 2 * writes;
            if score > 0 {
                candidates.push((id, score, size));
            }
        }

        for (id, size) in explicit {
            if size > budget {
                let sym = ctx.sema.symbols.get(id);
                let name = ctx.interner.resolve(sym.name);
                ctx.sink.report(Diagnostic::new(
                    DiagCode::ZeroPageOverflow,
                    sym.def_span,
                    format!(
                        "`@zp {name}` needs {size} byte{} but only {budget} zero-page bytes remain",
                        if size == 1 { "" } else { "s" }
                    ),
                ));
                continue;
            }
            budget -= size;
        }

        // Highest score first; symbol order breaks ties deterministically.
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (id, _score, size) in candidates {
            if size > budget {
                continue;
            }
            budget -= size;
            let module = ctx.sema.symbols.get(id).module;
            ctx.sema.modules[module.index()].metadata.set_symbol(
                id,
                MetadataKey::SuggestedStorage,
                MetadataValue::Storage("zp"),
            );
        }
    }
}
