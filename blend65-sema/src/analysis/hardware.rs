//! Target-specific hardware checks.
//!
//! Analyzers compose through a registry keyed by target: each target
//! contributes the passes that make sense for its chips. The C64 gets SID
//! write-conflict detection and a VIC-II badline cycle budget; the other
//! targets currently contribute nothing beyond the target-independent
//! zero-page accounting.

use super::{funcs_in_order, Analysis, AnalysisCtx, TargetKind};
use crate::builtins::Builtin;
use crate::cfg::CfgOp;
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::{SymbolId, SymbolKind};
use crate::MemberRes;
use blend65_entity::EntityRef;
use blend65_frontend::ast::{stmt_exprs, walk_expr, ExprId, ExprKind, Module, StmtKind};
use blend65_frontend::diagnostics::{DiagCode, Diagnostic};
use blend65_frontend::sourcemap::Span;
use rustc_hash::FxHashMap;

/// The hardware passes registered for `target`.
pub fn hardware_passes(target: TargetKind) -> Vec<Box<dyn Analysis>> {
    match target {
        TargetKind::C64 => vec![Box::new(SidConflicts), Box::new(VicBadline)],
        TargetKind::Vic20 | TargetKind::X16 => Vec::new(),
    }
}

/// First SID register.
const SID_BASE: u32 = 0xD400;
/// Last SID register.
const SID_LAST: u32 = 0xD418;

/// Waveform/gate and filter/volume registers: concurrent writers are an
/// error. The remaining frequency/envelope registers only warn.
fn is_control_register(addr: u32) -> bool {
    matches!(addr, 0xD404 | 0xD40B | 0xD412 | 0xD417 | 0xD418)
}

/// SID voice number of a register, if it belongs to a voice.
fn voice_of(addr: u32) -> Option<u8> {
    if (SID_BASE..0xD415).contains(&addr) {
        Some(((addr - SID_BASE) / 7) as u8)
    } else {
        None
    }
}

/// Detect two functions writing the same SID register.
pub struct SidConflicts;

impl Analysis for SidConflicts {
    fn name(&self) -> &'static str {
        "sid-conflicts"
    }

    fn deps(&self) -> &'static [&'static str] {
        &["constants"]
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        // Register address -> writers (function symbol, write site).
        let mut writers: FxHashMap<u32, Vec<(SymbolId, Span)>> = FxHashMap::default();
        let mut voices: FxHashMap<SymbolId, u8> = FxHashMap::default();

        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let func_sym = info.symbol;

            let mut record = |addr: u32, span: Span| {
                if !(SID_BASE..=SID_LAST).contains(&addr) {
                    return;
                }
                let list = writers.entry(addr).or_default();
                if !list.iter().any(|&(f, _)| f == func_sym) {
                    list.push((func_sym, span));
                }
                if let Some(v) = voice_of(addr) {
                    *voices.entry(func_sym).or_insert(0) |= 1 << v;
                }
            };

            for block in info.cfg.blocks() {
                for &op in &info.cfg.block(block).ops {
                    let CfgOp::Stmt(stmt_id) = op else { continue };
                    let stmt = module.stmt(stmt_id);
                    // Stores through assignment to map symbols/fields.
                    if let StmtKind::Assign { target, .. } = &stmt.kind {
                        if let Some(addr) = store_address(module, msema, ctx.sema, *target) {
                            record(addr, module.expr(*target).span);
                        }
                    }
                    // Stores through poke/pokew/volatile_write.
                    for root in stmt_exprs(stmt) {
                        walk_expr(module, root, &mut |e| {
                            if let Some(addr) = poke_address(module, msema, ctx.sema, e) {
                                record(addr, module.expr(e).span);
                            }
                        });
                    }
                }
            }
        }

        let mut addrs: Vec<u32> = writers.keys().copied().collect();
        addrs.sort_unstable();
        for addr in addrs {
            let list = &writers[&addr];
            if list.len() < 2 {
                continue;
            }
            let code = if is_control_register(addr) {
                DiagCode::SidControlConflict
            } else {
                DiagCode::SidVoiceConflict
            };
            let names: Vec<&str> = list
                .iter()
                .map(|&(f, _)| ctx.interner.resolve(ctx.sema.symbols.get(f).name))
                .collect();
            let mut diag = Diagnostic::new(
                code,
                list[1].1,
                format!(
                    "functions {} all write SID register ${addr:04X}",
                    names.join(" and ")
                ),
            );
            for &(f, span) in &list[..1] {
                let name = ctx.interner.resolve(ctx.sema.symbols.get(f).name);
                diag = diag.with_related(span, format!("`{name}` writes it here"));
            }
            ctx.sink.report(diag);
        }

        for (func_sym, mask) in voices {
            let module = ctx.sema.symbols.get(func_sym).module;
            ctx.sema.modules[module.index()].metadata.set_func(
                func_sym,
                MetadataKey::SidVoicesUsed,
                MetadataValue::Count(u32::from(mask)),
            );
        }
    }
}

/// The compile-time address a `poke`-family call writes, if known.
fn poke_address(
    module: &Module,
    msema: &crate::ModuleSema,
    sema: &crate::Sema,
    expr: ExprId,
) -> Option<u32> {
    let ExprKind::Call { callee, args } = &module.expr(expr).kind else {
        return None;
    };
    let sym = msema.expr_sym(*callee)?;
    let builtin = sema.builtins.get(&sema.symbols.resolve_import(sym))?;
    if !matches!(
        builtin,
        Builtin::Poke | Builtin::Pokew | Builtin::VolatileWrite
    ) {
        return None;
    }
    let &addr_arg = args.first()?;
    const_of_expr(module, msema, addr_arg)
}

/// The fixed address an assignment target stores to, if it is a map.
fn store_address(
    module: &Module,
    msema: &crate::ModuleSema,
    sema: &crate::Sema,
    target: ExprId,
) -> Option<u32> {
    match &module.expr(target).kind {
        ExprKind::Ident(_) => {
            let sym = msema.expr_sym(target)?;
            let resolved = sema.symbols.resolve_import(sym);
            let s = sema.symbols.get(resolved);
            if s.kind == SymbolKind::Map {
                s.address
            } else {
                None
            }
        }
        ExprKind::Member { .. } => match msema.member_res.get(&target)? {
            MemberRes::MapField { addr, .. } => Some(*addr),
            MemberRes::EnumMember { .. } => None,
        },
        ExprKind::Index { base, index } => {
            let base_addr = store_address(module, msema, sema, *base)?;
            let offset = const_of_expr(module, msema, *index)?;
            Some(base_addr + offset)
        }
        _ => None,
    }
}

fn const_of_expr(module: &Module, msema: &crate::ModuleSema, expr: ExprId) -> Option<u32> {
    if let ExprKind::Literal(blend65_frontend::ast::Literal::Int { value, .. }) =
        &module.expr(expr).kind
    {
        return Some(*value);
    }
    msema.metadata.const_of(expr)
}

/// VIC-II badline budget: a raster-sensitive callback body that costs
/// more than the cycles a badline leaves gets flagged.
pub struct VicBadline;

/// Cycles left to the CPU on a badline.
const BADLINE_BUDGET: u32 = 63 - 40;

impl Analysis for VicBadline {
    fn name(&self) -> &'static str {
        "vic-badline"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let func_sym = info.symbol;

            let mut cycles: u32 = 0;
            for block in info.cfg.blocks() {
                if !info.cfg.block(block).reachable {
                    continue;
                }
                // Loop bodies count tenfold per nesting level: the budget
                // is per raster line and a loop rarely finishes in one.
                let mult = 10u32.saturating_pow(info.cfg.loop_depth(block).min(2));
                for &op in &info.cfg.block(block).ops {
                    cycles = cycles.saturating_add(op_cost(module, op) * mult);
                }
            }

            let is_callback = {
                let item = &module.items[info.item_index];
                matches!(
                    item,
                    blend65_frontend::ast::Item::Func(f) if f.callback
                )
            };

            let name = ctx
                .interner
                .resolve(ctx.sema.symbols.get(func_sym).name)
                .to_string();
            let span = ctx.sema.symbols.get(func_sym).def_span;
            let overrun = is_callback && cycles > BADLINE_BUDGET;
            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            metadata.set_func(
                func_sym,
                MetadataKey::EstimatedCycles,
                MetadataValue::Count(cycles),
            );
            if overrun {
                metadata.set_func(
                    func_sym,
                    MetadataKey::VicBadlineRisk,
                    MetadataValue::Flag(true),
                );
                ctx.sink.report(Diagnostic::new(
                    DiagCode::BadlineOverrun,
                    span,
                    format!(
                        "callback `{name}` is estimated at {cycles} cycles; a badline leaves {BADLINE_BUDGET}"
                    ),
                ));
            }
        }
    }
}

/// Very rough per-op 6502 cost, in cycles.
fn op_cost(module: &Module, op: CfgOp) -> u32 {
    match op {
        CfgOp::Cond(_) => 8,
        CfgOp::ForInit(_) | CfgOp::ForStep(_) => 9,
        CfgOp::ForCond(_) => 10,
        CfgOp::Stmt(id) => match &module.stmt(id).kind {
            StmtKind::Expr(_) => 20,
            StmtKind::Assign { .. } => 10,
            StmtKind::Var(_) => 8,
            StmtKind::Return(_) => 12,
            StmtKind::InlineAsm(lines) => 4 * lines.len() as u32,
            _ => 2,
        },
    }
}
