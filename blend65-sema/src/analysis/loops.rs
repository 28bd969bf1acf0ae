//! Loop analyses: invariant detection and unroll hints.
//!
//! An expression inside a loop is invariant when every symbol it reads is
//! unwritten anywhere in that loop and it performs no calls or volatile
//! accesses. A `for` whose bounds and step are compile-time constants with
//! a small trip count gets an unroll hint for the optimizer.

use super::{op_effects, Analysis, AnalysisCtx};
use crate::cfg::CfgOp;
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;
use blend65_frontend::ast::{stmt_exprs, StmtKind};

/// Trip counts up to this unroll.
const UNROLL_LIMIT: u32 = 8;

pub struct Loops;

impl Analysis for Loops {
    fn name(&self) -> &'static str {
        "loops"
    }

    fn deps(&self) -> &'static [&'static str] {
        &["constants"]
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in super::funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let cfg = &info.cfg;

            let mut invariant: Vec<blend65_frontend::ast::ExprId> = Vec::new();

            for &(latch, header) in cfg.back_edges() {
                // Natural loop body: backward flood from the latch.
                let mut in_loop = vec![false; cfg.num_blocks()];
                in_loop[header.index()] = true;
                let mut work = vec![latch];
                while let Some(b) = work.pop() {
                    if in_loop[b.index()] {
                        continue;
                    }
                    in_loop[b.index()] = true;
                    work.extend(cfg.block(b).preds.iter().copied());
                }

                // Everything written anywhere in the loop.
                let mut written: Vec<SymbolId> = Vec::new();
                for block in cfg.blocks() {
                    if !in_loop[block.index()] {
                        continue;
                    }
                    for &op in &cfg.block(block).ops {
                        let fx = op_effects(module, msema, ctx.sema, op);
                        written.extend(fx.writes);
                    }
                }

                for block in cfg.blocks() {
                    if !in_loop[block.index()] {
                        continue;
                    }
                    for &op in &cfg.block(block).ops {
                        let exprs = match op {
                            CfgOp::Cond(e) => vec![e],
                            CfgOp::Stmt(id) => stmt_exprs(module.stmt(id)),
                            _ => continue,
                        };
                        for root in exprs {
                            let mut fx = super::Effects::default();
                            super::expr_effects(module, msema, ctx.sema, root, &mut fx);
                            let quiet = fx.calls.is_empty() && !fx.volatile;
                            let stable = fx.reads.iter().all(|r| !written.contains(r));
                            if quiet && stable && !fx.reads.is_empty() {
                                invariant.push(root);
                            }
                        }
                    }
                }
            }

            // Unroll hints for small constant trip counts.
            let mut unroll: Vec<(blend65_frontend::ast::StmtId, u32)> = Vec::new();
            for (stmt_id, stmt) in module.stmts.iter() {
                let StmtKind::For {
                    from,
                    to,
                    downto,
                    step,
                    ..
                } = &stmt.kind
                else {
                    continue;
                };
                let metadata = &msema.metadata;
                let cval = |e| {
                    metadata.const_of(e).or_else(|| {
                        match &module.expr(e).kind {
                            blend65_frontend::ast::ExprKind::Literal(
                                blend65_frontend::ast::Literal::Int { value, .. },
                            ) => Some(*value),
                            _ => None,
                        }
                    })
                };
                let (Some(a), Some(b)) = (cval(*from), cval(*to)) else {
                    continue;
                };
                let s = match step {
                    Some(e) => match cval(*e) {
                        Some(v) if v > 0 => v,
                        _ => continue,
                    },
                    None => 1,
                };
                let span = if *downto {
                    a.checked_sub(b)
                } else {
                    b.checked_sub(a)
                };
                let Some(span) = span else { continue };
                let trips = span / s + 1;
                if trips <= UNROLL_LIMIT {
                    unroll.push((stmt_id, trips));
                }
            }

            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for e in invariant {
                metadata.set_expr(e, MetadataKey::IsLoopInvariant, MetadataValue::Flag(true));
            }
            for (stmt_id, trips) in unroll {
                metadata.set_stmt(stmt_id, MetadataKey::UnrollHint, MetadataValue::Count(trips));
            }
        }
    }
}
