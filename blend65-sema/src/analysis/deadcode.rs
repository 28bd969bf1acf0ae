//! Dead code warnings.
//!
//! The CFG builder already records unreachable blocks; this pass turns
//! every non-empty one into a `W_DEAD_CODE` warning at its first
//! statement.

use super::{funcs_in_order, op_span, Analysis, AnalysisCtx};
use blend65_entity::EntityRef;
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};

pub struct DeadCode;

impl Analysis for DeadCode {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            for block in info.cfg.blocks() {
                let data = info.cfg.block(block);
                if data.reachable || data.ops.is_empty() {
                    continue;
                }
                let span = op_span(module, data.ops[0]);
                ctx.sink.report(Diagnostic::new(
                    DiagCode::DeadCode,
                    span,
                    "this code can never execute".to_string(),
                ));
            }
        }
    }
}
