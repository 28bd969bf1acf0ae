//! The dataflow analysis suite.
//!
//! All analyses are classical fixed-point or single-walk passes over the
//! statement CFGs; none require SSA. Each pass declares the passes it
//! depends on and the orchestrator runs the registry in dependency order.
//! Results land in the per-module [`Metadata`](crate::metadata::Metadata)
//! store; a skipped pass simply leaves its keys absent, so every consumer
//! treats missing metadata as the trivial answer.
//!
//! Hardware checks are registered per target through
//! [`hardware_passes`](hardware::hardware_passes); each is a pure function
//! from module and metadata to diagnostics plus metadata.

mod alias;
mod assign;
mod callgraph;
mod constants;
mod deadcode;
pub mod hardware;
mod liveness;
mod loops;
mod purity;
mod reaching;
mod usage;
mod zphint;

use crate::cfg::CfgOp;
use crate::modgraph::ModuleGraph;
use crate::symbols::{ModuleId, SymbolId, SymbolKind};
use crate::{MemberRes, ModuleSema, Sema};
use blend65_entity::EntityRef;
use blend65_frontend::ast::{walk_expr, ExprId, ExprKind, Module, StmtKind};
use blend65_frontend::diagnostics::DiagnosticSink;
use blend65_frontend::intern::Interner;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// The compilation targets hardware analyses key on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TargetKind {
    /// Commodore 64 — the reference target.
    C64,
    /// VIC-20.
    Vic20,
    /// Commander X16.
    X16,
}

/// Shared state handed to every analysis pass.
pub struct AnalysisCtx<'a> {
    /// All parsed modules, indexed by `ModuleId`.
    pub modules: &'a [Module],
    /// The import graph and compile order.
    pub graph: &'a ModuleGraph,
    /// The interner, for names in diagnostics.
    pub interner: &'a Interner,
    /// The semantic tables; passes write metadata through this.
    pub sema: &'a mut Sema,
    /// The diagnostic sink.
    pub sink: &'a mut DiagnosticSink,
    /// The selected target.
    pub target: TargetKind,
    /// Direct call graph, filled by the `callgraph` pass.
    pub call_graph: FxHashMap<SymbolId, Vec<SymbolId>>,
}

/// One analysis pass.
pub trait Analysis {
    /// Unique pass name, referenced by dependents.
    fn name(&self) -> &'static str;
    /// Names of passes that must run first.
    fn deps(&self) -> &'static [&'static str] {
        &[]
    }
    /// Run the pass. Must be idempotent.
    fn run(&self, ctx: &mut AnalysisCtx);
}

/// Run the full suite in dependency order.
pub fn run_all(
    modules: &[Module],
    graph: &ModuleGraph,
    interner: &Interner,
    sema: &mut Sema,
    target: TargetKind,
    sink: &mut DiagnosticSink,
) {
    let mut passes: Vec<Box<dyn Analysis>> = vec![
        Box::new(callgraph::CallGraph),
        Box::new(assign::DefiniteAssignment),
        Box::new(usage::Usage),
        Box::new(deadcode::DeadCode),
        Box::new(liveness::Liveness),
        Box::new(reaching::ReachingDefs),
        Box::new(constants::Constants),
        Box::new(alias::AliasAndEscape),
        Box::new(purity::Purity),
        Box::new(loops::Loops),
        Box::new(zphint::ZeroPageHint),
    ];
    passes.extend(hardware::hardware_passes(target));

    let ordered = order_by_deps(passes);
    let mut ctx = AnalysisCtx {
        modules,
        graph,
        interner,
        sema,
        sink,
        target,
        call_graph: FxHashMap::default(),
    };
    for pass in &ordered {
        log::debug!("analysis pass: {}", pass.name());
        pass.run(&mut ctx);
    }
}

/// Topologically order passes by declared dependencies, keeping the
/// registration order among independent passes.
fn order_by_deps(mut passes: Vec<Box<dyn Analysis>>) -> Vec<Box<dyn Analysis>> {
    let mut ordered: Vec<Box<dyn Analysis>> = Vec::with_capacity(passes.len());
    let mut done: Vec<&'static str> = Vec::new();
    while !passes.is_empty() {
        let before = ordered.len();
        let mut i = 0;
        while i < passes.len() {
            let ready = passes[i].deps().iter().all(|d| done.contains(d));
            if ready {
                let pass = passes.remove(i);
                done.push(pass.name());
                ordered.push(pass);
            } else {
                i += 1;
            }
        }
        assert!(
            ordered.len() > before,
            "analysis dependency cycle among {:?}",
            passes.iter().map(|p| p.name()).collect::<Vec<_>>()
        );
    }
    ordered
}

/// What one CFG op reads, writes and calls.
///
/// The common currency of the dataflow passes; conservative by design.
#[derive(Default)]
pub struct Effects {
    /// Symbols whose values are read.
    pub reads: SmallVec<[SymbolId; 4]>,
    /// Symbols stored to.
    pub writes: SmallVec<[SymbolId; 4]>,
    /// Functions called directly.
    pub calls: SmallVec<[SymbolId; 4]>,
    /// Symbols whose address is taken.
    pub addr_of: SmallVec<[SymbolId; 4]>,
    /// The op touches memory-mapped or otherwise volatile state.
    pub volatile: bool,
    /// The op writes memory that is not a plain local.
    pub writes_memory: bool,
}

/// Compute the effects of `op` in `module`.
pub fn op_effects(
    module: &Module,
    msema: &ModuleSema,
    sema: &Sema,
    op: CfgOp,
) -> Effects {
    let mut fx = Effects::default();
    match op {
        CfgOp::Cond(e) => expr_effects(module, msema, sema, e, &mut fx),
        CfgOp::Stmt(id) => match &module.stmt(id).kind {
            StmtKind::Expr(e) => expr_effects(module, msema, sema, *e, &mut fx),
            StmtKind::Assign { target, op, value } => {
                expr_effects(module, msema, sema, *value, &mut fx);
                if op.is_some() {
                    expr_effects(module, msema, sema, *target, &mut fx);
                }
                assign_target_effects(module, msema, sema, *target, &mut fx);
            }
            StmtKind::Var(decl) => {
                if let Some(init) = decl.init {
                    expr_effects(module, msema, sema, init, &mut fx);
                    // Only an initialized declaration assigns; a bare
                    // `let x: byte;` leaves the local unwritten.
                    if let Some(&sym) = msema.stmt_syms.get(&id) {
                        fx.writes.push(sym);
                    }
                }
            }
            StmtKind::Return(Some(e)) => expr_effects(module, msema, sema, *e, &mut fx),
            StmtKind::InlineAsm(_) => {
                // Raw instructions may touch anything.
                fx.volatile = true;
                fx.writes_memory = true;
            }
            _ => {}
        },
        CfgOp::ForInit(id) => {
            if let StmtKind::For { from, .. } = &module.stmt(id).kind {
                expr_effects(module, msema, sema, *from, &mut fx);
            }
            if let Some(&sym) = msema.stmt_syms.get(&id) {
                fx.writes.push(sym);
            }
        }
        CfgOp::ForCond(id) => {
            if let StmtKind::For { to, .. } = &module.stmt(id).kind {
                expr_effects(module, msema, sema, *to, &mut fx);
            }
            if let Some(&sym) = msema.stmt_syms.get(&id) {
                fx.reads.push(sym);
            }
        }
        CfgOp::ForStep(id) => {
            if let StmtKind::For { step, .. } = &module.stmt(id).kind {
                if let Some(step) = step {
                    expr_effects(module, msema, sema, *step, &mut fx);
                }
            }
            if let Some(&sym) = msema.stmt_syms.get(&id) {
                fx.reads.push(sym);
                fx.writes.push(sym);
            }
        }
    }
    fx
}

fn assign_target_effects(
    module: &Module,
    msema: &ModuleSema,
    sema: &Sema,
    target: ExprId,
    fx: &mut Effects,
) {
    match &module.expr(target).kind {
        ExprKind::Ident(_) => {
            if let Some(sym) = msema.expr_sym(target) {
                let resolved = sema.symbols.resolve_import(sym);
                fx.writes.push(resolved);
                if sema.symbols.get(resolved).kind == SymbolKind::Map {
                    fx.volatile = true;
                    fx.writes_memory = true;
                }
            }
        }
        ExprKind::Index { base, index } => {
            expr_effects(module, msema, sema, *index, fx);
            assign_target_effects(module, msema, sema, *base, fx);
            // Array stores are memory stores for purity purposes when the
            // array is not a local.
            fx.writes_memory = true;
        }
        ExprKind::Member { .. } => {
            if let Some(MemberRes::MapField { .. }) = msema.member_res.get(&target) {
                fx.volatile = true;
            }
            fx.writes_memory = true;
        }
        _ => {}
    }
}

/// Collect the effects of evaluating `root` as a value.
pub fn expr_effects(
    module: &Module,
    msema: &ModuleSema,
    sema: &Sema,
    root: ExprId,
    fx: &mut Effects,
) {
    walk_expr(module, root, &mut |e| match &module.expr(e).kind {
        ExprKind::Ident(_) => {
            if let Some(sym) = msema.expr_sym(e) {
                let resolved = sema.symbols.resolve_import(sym);
                fx.reads.push(resolved);
                if sema.symbols.get(resolved).kind == SymbolKind::Map {
                    fx.volatile = true;
                }
            }
        }
        ExprKind::AddressOf(_) => {
            if let Some(sym) = msema.expr_sym(e) {
                fx.addr_of.push(sema.symbols.resolve_import(sym));
            }
        }
        ExprKind::Member { .. } => {
            if let Some(MemberRes::MapField { .. }) = msema.member_res.get(&e) {
                fx.volatile = true;
            }
        }
        ExprKind::Call { callee, .. } => {
            if let Some(sym) = msema.expr_sym(*callee) {
                let resolved = sema.symbols.resolve_import(sym);
                match sema.builtins.get(&resolved) {
                    Some(b) => {
                        if b.is_volatile() {
                            fx.volatile = true;
                        }
                        if matches!(
                            b,
                            crate::builtins::Builtin::Poke
                                | crate::builtins::Builtin::Pokew
                                | crate::builtins::Builtin::VolatileWrite
                        ) {
                            fx.writes_memory = true;
                        }
                    }
                    None => fx.calls.push(resolved),
                }
            }
        }
        _ => {}
    });
}

/// The source span to report for a CFG op.
pub fn op_span(module: &Module, op: CfgOp) -> blend65_frontend::sourcemap::Span {
    match op {
        CfgOp::Stmt(id) | CfgOp::ForInit(id) | CfgOp::ForCond(id) | CfgOp::ForStep(id) => {
            module.stmt(id).span
        }
        CfgOp::Cond(e) => module.expr(e).span,
    }
}

/// Iterate the checked functions of every module in compile order.
pub fn funcs_in_order<'a>(
    ctx: &'a AnalysisCtx,
) -> Vec<(ModuleId, crate::FuncId)> {
    let mut out = Vec::new();
    for &mid in ctx.graph.order() {
        for &f in &ctx.sema.modules[mid.index()].funcs {
            out.push((mid, f));
        }
    }
    out
}
