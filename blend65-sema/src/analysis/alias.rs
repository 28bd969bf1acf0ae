//! Conservative alias and escape analysis.
//!
//! Address values come only from `@symbol`, so points-to sets are exact at
//! the creation site and merged conservatively through assignments. A
//! local escapes when its address flows into a call argument, a non-local
//! store, or a return value; escaped locals are pinned to memory by the
//! planner instead of living in a register.

use super::{funcs_in_order, Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;
use blend65_frontend::ast::{walk_expr, ExprId, ExprKind, Module, StmtKind};

pub struct AliasAndEscape;

impl Analysis for AliasAndEscape {
    fn name(&self) -> &'static str {
        "alias-escape"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];

            let mut points_to: Vec<(ExprId, SymbolId)> = Vec::new();
            let mut escaped: Vec<SymbolId> = Vec::new();

            // Which locals can escape at all.
            let is_local =
                |sym: SymbolId| info.locals.contains(&sym) || info.params.contains(&sym);

            for block in info.cfg.blocks() {
                for &op in &info.cfg.block(block).ops {
                    let stmt_id = match op {
                        crate::cfg::CfgOp::Stmt(id) => Some(id),
                        _ => None,
                    };
                    let Some(stmt_id) = stmt_id else { continue };
                    match &module.stmt(stmt_id).kind {
                        StmtKind::Return(Some(e)) => {
                            collect_addr_of(module, msema, *e, &mut points_to, &mut |sym| {
                                if is_local(sym) {
                                    escaped.push(sym)
                                }
                            });
                        }
                        StmtKind::Assign { target, value, .. } => {
                            // An address stored anywhere escapes its
                            // pointee; storing into a global or map is the
                            // common case.
                            collect_addr_of(module, msema, *value, &mut points_to, &mut |sym| {
                                if is_local(sym) {
                                    escaped.push(sym)
                                }
                            });
                            let _ = target;
                        }
                        StmtKind::Var(decl) => {
                            if let Some(init) = decl.init {
                                collect_addr_of(
                                    module,
                                    msema,
                                    init,
                                    &mut points_to,
                                    &mut |sym| {
                                        if is_local(sym) {
                                            escaped.push(sym)
                                        }
                                    },
                                );
                            }
                        }
                        StmtKind::Expr(e) => {
                            // Addresses passed to calls of unknown purity
                            // escape.
                            collect_addr_of(module, msema, *e, &mut points_to, &mut |sym| {
                                if is_local(sym) {
                                    escaped.push(sym)
                                }
                            });
                        }
                        _ => {}
                    }
                }
            }

            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for (expr, sym) in points_to {
                metadata.set_expr(
                    expr,
                    MetadataKey::PointsToSet,
                    MetadataValue::Symbols(vec![sym]),
                );
            }
            for sym in escaped {
                metadata.set_symbol(sym, MetadataKey::Escapes, MetadataValue::Flag(true));
            }
        }
    }
}

/// Record every `@x` under `root` and feed the pointee to `on_escape`.
fn collect_addr_of(
    module: &Module,
    msema: &crate::ModuleSema,
    root: ExprId,
    points_to: &mut Vec<(ExprId, SymbolId)>,
    on_escape: &mut impl FnMut(SymbolId),
) {
    walk_expr(module, root, &mut |e| {
        if let ExprKind::AddressOf(_) = module.expr(e).kind {
            if let Some(sym) = msema.expr_sym(e) {
                points_to.push((e, sym));
                on_escape(sym);
            }
        }
    });
}
