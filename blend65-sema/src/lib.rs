//! Blend65 semantic analysis.
//!
//! Everything between the parser and the IL generator lives here: symbol
//! tables and scopes, the interned type system, the type checker, the
//! per-function control flow graphs, the module import graph, and the
//! dataflow analysis suite whose results annotate the AST as metadata.
//!
//! The entry point is [`analyze`]: given parsed modules and the import
//! graph it produces a [`Sema`] value holding every table later passes
//! read. `Sema` is inert data; all mutation happens inside the passes, so
//! the caller can hand it to the IL generator by shared reference.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub mod analysis;
pub mod builtins;
pub mod cfg;
pub mod const_eval;
pub mod layout;
pub mod metadata;
pub mod modgraph;
pub mod symbols;
pub mod typeck;
pub mod types;

use crate::builtins::Builtin;
use crate::cfg::Cfg;
use crate::layout::{MemoryLayout, MemoryParams};
use crate::metadata::Metadata;
use crate::modgraph::ModuleGraph;
use crate::symbols::{ModuleId, ScopeId, SymbolId, SymbolTable};
use crate::types::{TypeId, TypeTable};
use blend65_entity::packed_option::PackedOption;
use blend65_entity::{entity_impl, PrimaryMap, SecondaryMap};
use blend65_frontend::ast::{ExprId, Module, StmtId};
use blend65_frontend::diagnostics::DiagnosticSink;
use blend65_frontend::intern::Interner;
use rustc_hash::FxHashMap;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// An opaque reference to a checked function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "fn");

/// Everything the later passes need to know about one checked function.
pub struct FuncInfo {
    /// The function's symbol.
    pub symbol: SymbolId,
    /// The declaring module.
    pub module: ModuleId,
    /// Index of the declaration in the module's item list.
    pub item_index: usize,
    /// The parameter scope.
    pub scope: ScopeId,
    /// Parameter symbols in order.
    pub params: Vec<SymbolId>,
    /// Every local declared in the body, in declaration order.
    pub locals: Vec<SymbolId>,
    /// The statement-level control flow graph.
    pub cfg: Cfg,
}

/// Resolution of a member access expression.
pub enum MemberRes {
    /// `Enum.Member` — a compile-time constant.
    EnumMember {
        /// The member's value.
        value: u8,
        /// The enum type.
        ty: TypeId,
    },
    /// `map.field` — a fixed hardware address.
    MapField {
        /// Absolute address of the field.
        addr: u32,
        /// The field type.
        ty: TypeId,
    },
}

/// Checker output for one module.
pub struct ModuleSema {
    /// The module's file scope.
    pub scope: ScopeId,
    /// Resolved type of every checked expression.
    pub expr_types: SecondaryMap<ExprId, PackedOption<TypeId>>,
    /// Resolved symbol of identifier, callee and address-of expressions.
    pub expr_syms: SecondaryMap<ExprId, PackedOption<SymbolId>>,
    /// Resolution of member accesses.
    pub member_res: FxHashMap<ExprId, MemberRes>,
    /// Symbol declared by a `Var` statement, or driven by a `For`.
    pub stmt_syms: FxHashMap<StmtId, SymbolId>,
    /// Functions declared (with bodies) in this module.
    pub funcs: Vec<FuncId>,
    /// Analysis metadata for this module's nodes.
    pub metadata: Metadata,
}

impl ModuleSema {
    fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            expr_types: SecondaryMap::new(),
            expr_syms: SecondaryMap::new(),
            member_res: FxHashMap::default(),
            stmt_syms: FxHashMap::default(),
            funcs: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// The checked type of `expr`, if the checker reached it.
    pub fn expr_ty(&self, expr: ExprId) -> Option<TypeId> {
        self.expr_types[expr].expand()
    }

    /// The resolved symbol behind `expr`, if any.
    pub fn expr_sym(&self, expr: ExprId) -> Option<SymbolId> {
        self.expr_syms[expr].expand()
    }
}

/// The complete result of semantic analysis.
pub struct Sema {
    /// The interned type table.
    pub types: TypeTable,
    /// The global symbol table.
    pub symbols: SymbolTable,
    /// `@map` reservations and zero-page accounting.
    pub layout: MemoryLayout,
    /// Symbol-to-intrinsic mapping for the reserved builtin scope.
    pub builtins: FxHashMap<SymbolId, Builtin>,
    /// Member scope of each enum symbol.
    pub enum_scopes: FxHashMap<SymbolId, ScopeId>,
    /// Per-module results, indexed by `ModuleId` position.
    pub modules: Vec<ModuleSema>,
    /// Every checked function.
    pub funcs: PrimaryMap<FuncId, FuncInfo>,
}

impl Sema {
    /// The checked function owning `symbol`, if any.
    pub fn func_by_symbol(&self, symbol: SymbolId) -> Option<FuncId> {
        self.funcs
            .iter()
            .find(|(_, info)| info.symbol == symbol)
            .map(|(id, _)| id)
    }
}

/// Run semantic analysis: symbol collection, type checking, CFG
/// construction and the dataflow suite, in module-topological order.
///
/// `modules` is indexed by `ModuleId`; modules on an import cycle are
/// skipped entirely (the graph has already diagnosed them).
pub fn analyze(
    modules: &[Module],
    graph: &ModuleGraph,
    interner: &mut Interner,
    params: MemoryParams,
    target: analysis::TargetKind,
    sink: &mut DiagnosticSink,
) -> Sema {
    let mut types = TypeTable::new();
    let mut symbols = SymbolTable::new();
    let builtins = builtins::install(&mut symbols, &mut types, interner);

    let module_semas: Vec<ModuleSema> = modules
        .iter()
        .map(|_| {
            let scope = symbols.push_scope(symbols.global_scope());
            ModuleSema::new(scope)
        })
        .collect();

    let mut sema = Sema {
        types,
        symbols,
        layout: MemoryLayout::new(params),
        builtins,
        enum_scopes: FxHashMap::default(),
        modules: module_semas,
        funcs: PrimaryMap::new(),
    };

    typeck::check_modules(modules, graph, interner, &mut sema, sink);
    analysis::run_all(modules, graph, interner, &mut sema, target, sink);
    sema
}
