//! Definite assignment.
//!
//! A forward bitvector fixed point: a local is definitely assigned at a
//! point when every path from the function entry passes a write first.
//! The meet over merging paths is intersection. Any read of a local that
//! is not definitely assigned is `E_USE_BEFORE_ASSIGN`.

use super::{funcs_in_order, op_effects, op_span, Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};

pub struct DefiniteAssignment;

impl Analysis for DefiniteAssignment {
    fn name(&self) -> &'static str {
        "definite-assignment"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let cfg = &info.cfg;

            // Bit positions: the function's locals. Parameters are always
            // assigned and stay out of the domain.
            let mut domain: Vec<SymbolId> = info.locals.clone();
            if domain.is_empty() {
                continue;
            }
            // One u128 bitvector per block; functions beyond 128 locals
            // are checked for the first 128 only.
            domain.truncate(128);
            let bit = |sym: SymbolId| domain.iter().position(|&s| s == sym);
            let n = domain.len();
            let full: u128 = if n >= 128 { u128::MAX } else { (1u128 << n) - 1 };

            // IN sets; entry starts empty, everything else optimistic-full
            // so intersection converges downwards.
            let blocks: Vec<_> = cfg.rpo().to_vec();
            let mut input = vec![full; cfg.num_blocks()];
            input[cfg.entry().index()] = 0;

            let msema = &ctx.sema.modules[mid.index()];
            let transfer = |mut set: u128, block| {
                for &op in &cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for w in fx.writes {
                        if let Some(b) = bit(w) {
                            set |= 1 << b;
                        }
                    }
                }
                set
            };

            let mut changed = true;
            while changed {
                changed = false;
                for &block in &blocks {
                    let mut in_set = if block == cfg.entry() { 0 } else { full };
                    for &pred in &cfg.block(block).preds {
                        if cfg.block(pred).reachable {
                            in_set &= transfer(input[pred.index()], pred);
                        }
                    }
                    if in_set != input[block.index()] {
                        input[block.index()] = in_set;
                        changed = true;
                    }
                }
            }

            // Reporting pass: walk each block once with its converged IN
            // set; report each symbol at most once, at its first bad use.
            let mut reported: Vec<SymbolId> = Vec::new();
            for &block in &blocks {
                let mut set = input[block.index()];
                for &op in &cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for r in fx.reads {
                        if let Some(b) = bit(r) {
                            if set & (1 << b) == 0 && !reported.contains(&r) {
                                reported.push(r);
                                let name =
                                    ctx.interner.resolve(ctx.sema.symbols.get(r).name);
                                ctx.sink.report(
                                    Diagnostic::new(
                                        DiagCode::UseBeforeAssign,
                                        op_span(module, op),
                                        format!("`{name}` may be read before it is assigned"),
                                    )
                                    .with_related(
                                        ctx.sema.symbols.get(r).def_span,
                                        format!("`{name}` declared here"),
                                    ),
                                );
                            }
                        }
                    }
                    for w in fx.writes {
                        if let Some(b) = bit(w) {
                            set |= 1 << b;
                        }
                    }
                }
            }

            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for &sym in &domain {
                metadata.set_symbol(
                    sym,
                    MetadataKey::DefinitelyAssigned,
                    MetadataValue::Flag(!reported.contains(&sym)),
                );
            }
        }
    }
}
