//! Constant propagation and folding hints.
//!
//! Every expression the constant evaluator can decide gets a
//! `ConstantValue` annotation. The IL generator folds annotated
//! expressions into immediates and the optimizer uses the same key on its
//! own results, so folding decisions are made once, here.

use super::{Analysis, AnalysisCtx};
use crate::const_eval::{self, ConstCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use blend65_entity::EntityRef;
use blend65_frontend::ast::{ExprKind, Literal};

pub struct Constants;

impl Analysis for Constants {
    fn name(&self) -> &'static str {
        "constants"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for &mid in ctx.graph.order() {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let cctx = ConstCtx {
                module,
                symbols: &ctx.sema.symbols,
                scope: msema.scope,
                types: &ctx.sema.types,
                builtins: &ctx.sema.builtins,
            };
            let mut found: Vec<(blend65_frontend::ast::ExprId, u32)> = Vec::new();
            for (id, expr) in module.exprs.iter() {
                // Bare literals don't need an annotation to fold.
                if matches!(expr.kind, ExprKind::Literal(Literal::Int { .. })) {
                    continue;
                }
                if let Some(value) = const_eval::eval(&cctx, id) {
                    found.push((id, value));
                }
            }
            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for (id, value) in found {
                metadata.set_expr(id, MetadataKey::ConstantValue, MetadataValue::Const(value));
            }
        }
    }
}
