//! The type checker.
//!
//! Two passes per module, run in module-topological order. The collect
//! pass declares module-level symbols, resolves declared types, registers
//! `@map` reservations and evaluates `const` and enum values, so importers
//! always see fully-typed exports. The body pass walks every function,
//! resolves identifiers, assigns a type to every expression and builds the
//! function's CFG.
//!
//! The checker recovers: a failed check reports one diagnostic, assigns a
//! plausible type and keeps going, so one run surfaces many errors.

use crate::builtins::Builtin;
use crate::cfg::Cfg;
use crate::const_eval::{self, ConstCtx};
use crate::modgraph::ModuleGraph;
use crate::symbols::{
    MapFieldInfo, ModuleId, ScopeId, Storage, Symbol, SymbolId, SymbolKind,
};
use crate::types::{Type, TypeId};
use crate::{FuncId, FuncInfo, MemberRes, Sema};
use blend65_entity::EntityRef;
use blend65_frontend::ast::{
    BinOp, CastKind, EnumDecl, ExprId, ExprKind, FuncDecl, ImportDecl, Item, Literal, MapDecl,
    MapFieldAddr, MapForm, Module, Mutability, StmtId, StmtKind, TypeAliasDecl, TypeExpr,
    TypeExprKind, UnOp, VarDecl,
};
use blend65_frontend::diagnostics::{DiagCode, Diagnostic, DiagnosticSink};
use blend65_frontend::intern::Interner;
use blend65_frontend::sourcemap::Span;
use blend65_frontend::token::{StorageMarker, WidthHint};

/// Run both checker passes over `modules` in the graph's topological
/// order, filling in `sema`.
pub fn check_modules(
    modules: &[Module],
    graph: &ModuleGraph,
    interner: &Interner,
    sema: &mut Sema,
    sink: &mut DiagnosticSink,
) {
    // Collect first so importers see exports; the order guarantees the
    // exporter was collected before any importer.
    for &mid in graph.order() {
        let mut checker = Checker::new(modules, mid, graph, interner, sema, sink);
        checker.collect();
    }
    for &mid in graph.order() {
        let mut checker = Checker::new(modules, mid, graph, interner, sema, sink);
        checker.check_bodies();
    }
}

struct Checker<'a> {
    modules: &'a [Module],
    module: &'a Module,
    module_id: ModuleId,
    graph: &'a ModuleGraph,
    interner: &'a Interner,
    sema: &'a mut Sema,
    sink: &'a mut DiagnosticSink,
    /// Innermost scope last.
    scopes: Vec<ScopeId>,
    /// Return type of the function being checked.
    current_ret: Option<TypeId>,
    /// Locals of the function being checked, in declaration order.
    locals: Vec<SymbolId>,
    loop_depth: u32,
}

impl<'a> Checker<'a> {
    fn new(
        modules: &'a [Module],
        module_id: ModuleId,
        graph: &'a ModuleGraph,
        interner: &'a Interner,
        sema: &'a mut Sema,
        sink: &'a mut DiagnosticSink,
    ) -> Self {
        let scope = sema.modules[module_id.index()].scope;
        Self {
            modules,
            module: &modules[module_id.index()],
            module_id,
            graph,
            interner,
            sema,
            sink,
            scopes: vec![scope],
            current_ret: None,
            locals: Vec::new(),
            loop_depth: 0,
        }
    }

    fn scope(&self) -> ScopeId {
        *self.scopes.last().unwrap()
    }

    fn error(&mut self, code: DiagCode, span: Span, msg: String) {
        self.sink.report(Diagnostic::new(code, span, msg));
    }

    fn name(&self, name: blend65_frontend::intern::Name) -> &str {
        self.interner.resolve(name)
    }

    fn display_ty(&self, ty: TypeId) -> String {
        self.sema.types.display(ty, self.interner)
    }

    fn const_eval(&self, expr: ExprId) -> Option<u32> {
        let ctx = ConstCtx {
            module: self.module,
            symbols: &self.sema.symbols,
            scope: self.scope(),
            types: &self.sema.types,
            builtins: &self.sema.builtins,
        };
        const_eval::eval(&ctx, expr)
    }

    // ---- pass 1: collect -------------------------------------------------

    fn collect(&mut self) {
        let module = self.module;
        for (index, item) in module.items.iter().enumerate() {
            match item {
                Item::Import(imp) => self.collect_import(imp),
                Item::Var(decl) => self.collect_var(decl),
                Item::Func(func) => self.collect_func(func, index),
                Item::TypeAlias(alias) => self.collect_alias(alias),
                Item::Enum(decl) => self.collect_enum(decl),
                Item::Map(decl) => self.collect_map(decl),
            }
        }
    }

    fn declare_or_error(&mut self, symbol: Symbol) -> Option<SymbolId> {
        let name = symbol.name;
        let span = symbol.def_span;
        match self.sema.symbols.declare(self.scope(), symbol) {
            Ok(id) => Some(id),
            Err(existing) => {
                let prev_span = self.sema.symbols.get(existing).def_span;
                self.sink.report(
                    Diagnostic::new(
                        DiagCode::DuplicateDeclaration,
                        span,
                        format!("`{}` is already declared in this scope", self.name(name)),
                    )
                    .with_related(prev_span, "previously declared here".to_string()),
                );
                None
            }
        }
    }

    fn collect_import(&mut self, imp: &ImportDecl) {
        let target_module = self.graph.resolve(imp.module);
        for &(name, span) in &imp.names {
            let resolved = target_module.and_then(|m| {
                let scope = self.sema.modules[m.index()].scope;
                self.sema.symbols.lookup_local(scope, name)
            });
            let Some(target) = resolved else {
                self.error(
                    DiagCode::UnresolvedImport,
                    span,
                    format!(
                        "module `{}` has no symbol `{}`",
                        self.name(imp.module),
                        self.name(name)
                    ),
                );
                continue;
            };
            if !self.sema.symbols.get(target).exported {
                self.error(
                    DiagCode::UnresolvedImport,
                    span,
                    format!(
                        "`{}` exists in module `{}` but is not exported",
                        self.name(name),
                        self.name(imp.module)
                    ),
                );
                continue;
            }
            let mut symbol = Symbol::new(
                name,
                self.scope(),
                self.module_id,
                SymbolKind::Import,
                span,
            );
            let t = self.sema.symbols.get(target);
            symbol.ty = t.ty;
            symbol.const_value = t.const_value;
            symbol.address = t.address;
            symbol.import_target = target.into();
            self.declare_or_error(symbol);
        }
    }

    fn collect_var(&mut self, decl: &VarDecl) {
        let is_address = decl.storage == Some(StorageMarker::Address);
        let ty = if is_address {
            self.sema.types.address()
        } else {
            self.resolve_type(&decl.ty)
        };
        let kind = match decl.mutability {
            Mutability::Let => SymbolKind::Variable,
            Mutability::Const => SymbolKind::Const,
        };
        let mut symbol = Symbol::new(
            decl.name,
            self.scope(),
            self.module_id,
            kind,
            decl.name_span,
        );
        symbol.ty = Some(ty);
        symbol.exported = decl.exported;
        symbol.storage = match decl.storage {
            Some(StorageMarker::Zp) => Storage::Zp,
            Some(StorageMarker::Ram) => Storage::Ram,
            Some(StorageMarker::Data) => Storage::Data,
            Some(StorageMarker::Address) | Some(StorageMarker::Map) | None => Storage::Auto,
        };
        if kind == SymbolKind::Const {
            if let Some(init) = decl.init {
                symbol.const_value = self.const_eval(init);
                if symbol.const_value.is_none() {
                    self.error(
                        DiagCode::TypeMismatch,
                        self.module.expr(init).span,
                        format!(
                            "initializer of `{}` is not a compile-time constant",
                            self.name(decl.name)
                        ),
                    );
                }
                if is_address {
                    symbol.address = symbol.const_value;
                }
            }
        }
        self.declare_or_error(symbol);
    }

    fn func_type(&mut self, func: &FuncDecl) -> TypeId {
        let params: Vec<TypeId> = func.params.iter().map(|p| self.resolve_type(&p.ty)).collect();
        let ret = self.resolve_type(&func.ret);
        self.sema.types.intern(Type::Func {
            params,
            ret,
            callback: func.callback,
        })
    }

    fn collect_func(&mut self, func: &FuncDecl, _index: usize) {
        let ty = self.func_type(func);
        let mut symbol = Symbol::new(
            func.name,
            self.scope(),
            self.module_id,
            SymbolKind::Function,
            func.name_span,
        );
        symbol.ty = Some(ty);
        symbol.exported = func.exported;
        symbol.is_stub = func.body.is_none();

        match self.sema.symbols.declare(self.scope(), symbol) {
            Ok(_) => {}
            Err(existing) => {
                let prev = self.sema.symbols.get(existing);
                let prev_span = prev.def_span;
                let was_stub =
                    prev.kind == SymbolKind::Function && prev.is_stub && prev.ty == Some(ty);
                if was_stub && func.body.is_some() {
                    // A forward declaration gaining its body.
                    let sym = self.sema.symbols.get_mut(existing);
                    sym.is_stub = false;
                    sym.def_span = func.name_span;
                    sym.exported |= func.exported;
                } else {
                    self.sink.report(
                        Diagnostic::new(
                            DiagCode::DuplicateDeclaration,
                            func.name_span,
                            format!("`{}` is already declared", self.name(func.name)),
                        )
                        .with_related(prev_span, "previously declared here".to_string()),
                    );
                }
            }
        }
    }

    fn collect_alias(&mut self, alias: &TypeAliasDecl) {
        let target = self.resolve_type(&alias.target);
        let ty = self.sema.types.intern(Type::Alias {
            name: alias.name,
            target,
        });
        let mut symbol = Symbol::new(
            alias.name,
            self.scope(),
            self.module_id,
            SymbolKind::TypeDef,
            alias.name_span,
        );
        symbol.ty = Some(ty);
        symbol.exported = alias.exported;
        self.declare_or_error(symbol);
    }

    fn collect_enum(&mut self, decl: &EnumDecl) {
        let mut members: Vec<(blend65_frontend::intern::Name, u8)> = Vec::new();
        let mut next: u32 = 0;
        for member in &decl.members {
            let value = match member.value {
                Some(expr) => match self.const_eval(expr) {
                    Some(v) => v,
                    None => {
                        self.error(
                            DiagCode::TypeMismatch,
                            self.module.expr(expr).span,
                            "enum member value must be a compile-time constant".to_string(),
                        );
                        next
                    }
                },
                None => next,
            };
            if value > 0xFF {
                self.error(
                    DiagCode::TypeMismatch,
                    member.span,
                    format!(
                        "enum member `{}` does not fit in a byte",
                        self.name(member.name)
                    ),
                );
            }
            members.push((member.name, value as u8));
            next = value + 1;
        }

        let ty = self.sema.types.intern(Type::Enum {
            name: decl.name,
            members: members.clone(),
        });
        let mut symbol = Symbol::new(
            decl.name,
            self.scope(),
            self.module_id,
            SymbolKind::Enum,
            decl.name_span,
        );
        symbol.ty = Some(ty);
        symbol.exported = decl.exported;
        let Some(enum_sym) = self.declare_or_error(symbol) else {
            return;
        };

        // Members live in a side scope reachable only through `Enum.Member`
        // resolution, never through plain lookup.
        let member_scope = self.sema.symbols.push_scope(self.scope());
        for &(name, value) in &members {
            let mut ms = Symbol::new(
                name,
                member_scope,
                self.module_id,
                SymbolKind::EnumMember,
                decl.name_span,
            );
            ms.ty = Some(ty);
            ms.const_value = Some(u32::from(value));
            if self.sema.symbols.declare(member_scope, ms).is_err() {
                self.error(
                    DiagCode::DuplicateDeclaration,
                    decl.name_span,
                    format!("enum member `{}` is declared twice", self.name(name)),
                );
            }
        }
        self.sema.enum_scopes.insert(enum_sym, member_scope);
    }

    fn collect_map(&mut self, decl: &MapDecl) {
        let byte = self.sema.types.byte();
        let (ty, base_addr, ranges, fields) = match &decl.form {
            MapForm::Simple { addr, ty } => {
                let Some(base) = self.eval_addr(*addr) else {
                    return;
                };
                let ty = self.resolve_type(ty);
                let size = self.sema.types.size_of(ty).max(1);
                (ty, base, vec![(base, base + size - 1)], Vec::new())
            }
            MapForm::Range { start, end } => {
                let (Some(lo), Some(hi)) = (self.eval_addr(*start), self.eval_addr(*end)) else {
                    return;
                };
                if hi < lo {
                    self.error(
                        DiagCode::InvalidAddress,
                        decl.span,
                        format!("range end ${hi:04X} is below its start ${lo:04X}"),
                    );
                    return;
                }
                let ty = self.sema.types.intern(Type::Array {
                    elem: byte,
                    len: hi - lo + 1,
                });
                (ty, lo, vec![(lo, hi)], Vec::new())
            }
            MapForm::Struct {
                addr,
                fields,
                explicit: false,
            } => {
                let Some(base) = self.eval_addr(*addr) else {
                    return;
                };
                // Sequential layout: field addresses follow declaration
                // order using the field type sizes.
                let mut cursor = base;
                let mut infos = Vec::new();
                for field in fields {
                    let fty = match &field.ty {
                        Some(te) => self.resolve_type(te),
                        None => byte,
                    };
                    infos.push(MapFieldInfo {
                        name: field.name,
                        addr: cursor,
                        ty: fty,
                    });
                    cursor += self.sema.types.size_of(fty).max(1);
                }
                let total = (cursor - base).max(1);
                let ty = self.sema.types.intern(Type::Array {
                    elem: byte,
                    len: total,
                });
                (ty, base, vec![(base, base + total - 1)], infos)
            }
            MapForm::Struct {
                addr,
                fields,
                explicit: true,
            } => {
                let Some(base) = self.eval_addr(*addr) else {
                    return;
                };
                let mut infos = Vec::new();
                let mut ranges = Vec::new();
                for field in fields {
                    match &field.addr {
                        MapFieldAddr::At(expr) => {
                            let Some(a) = self.eval_addr(*expr) else { continue };
                            let fty = match &field.ty {
                                Some(te) => self.resolve_type(te),
                                None => byte,
                            };
                            let size = self.sema.types.size_of(fty).max(1);
                            infos.push(MapFieldInfo {
                                name: field.name,
                                addr: a,
                                ty: fty,
                            });
                            ranges.push((a, a + size - 1));
                        }
                        MapFieldAddr::Range(s, e) => {
                            let (Some(lo), Some(hi)) =
                                (self.eval_addr(*s), self.eval_addr(*e))
                            else {
                                continue;
                            };
                            if hi < lo {
                                self.error(
                                    DiagCode::InvalidAddress,
                                    field.span,
                                    format!("range end ${hi:04X} is below its start ${lo:04X}"),
                                );
                                continue;
                            }
                            let fty = match &field.ty {
                                Some(te) => self.resolve_type(te),
                                None => self.sema.types.intern(Type::Array {
                                    elem: byte,
                                    len: hi - lo + 1,
                                }),
                            };
                            infos.push(MapFieldInfo {
                                name: field.name,
                                addr: lo,
                                ty: fty,
                            });
                            ranges.push((lo, hi));
                        }
                        MapFieldAddr::Auto => unreachable!("explicit layout parses addresses"),
                    }
                }
                let span_len = ranges
                    .iter()
                    .map(|&(_, hi)| hi + 1)
                    .max()
                    .unwrap_or(base + 1)
                    - base;
                let ty = self.sema.types.intern(Type::Array {
                    elem: byte,
                    len: span_len.max(1),
                });
                (ty, base, ranges, infos)
            }
        };

        let mut symbol = Symbol::new(
            decl.name,
            self.scope(),
            self.module_id,
            SymbolKind::Map,
            decl.name_span,
        );
        symbol.ty = Some(ty);
        symbol.exported = decl.exported;
        symbol.storage = Storage::Map;
        symbol.address = Some(base_addr);
        let Some(id) = self.declare_or_error(symbol) else {
            return;
        };
        if !fields.is_empty() {
            self.sema.symbols.set_map_fields(id, fields);
        }

        for (lo, hi) in ranges {
            if hi > 0xFFFF {
                self.error(
                    DiagCode::InvalidAddress,
                    decl.span,
                    format!("`{}` extends past $FFFF", self.name(decl.name)),
                );
                continue;
            }
            if let Err(existing) = self.sema.layout.reserve(id, lo, hi, decl.name_span) {
                let other = self.sema.symbols.get(existing.symbol);
                let other_name = self.name(other.name).to_string();
                let other_span = existing.span;
                self.sink.report(
                    Diagnostic::new(
                        DiagCode::MapOverlap,
                        decl.name_span,
                        format!(
                            "`{}` overlaps `{}` at ${:04X}",
                            self.interner.resolve(decl.name),
                            other_name,
                            lo.max(existing.start),
                        ),
                    )
                    .with_related(other_span, format!("`{other_name}` is declared here")),
                );
            }
        }
    }

    fn eval_addr(&mut self, expr: ExprId) -> Option<u32> {
        match self.const_eval(expr) {
            Some(v) => Some(v),
            None => {
                self.error(
                    DiagCode::InvalidAddress,
                    self.module.expr(expr).span,
                    "a map address must be a compile-time constant".to_string(),
                );
                None
            }
        }
    }

    fn resolve_type(&mut self, te: &TypeExpr) -> TypeId {
        match &te.kind {
            TypeExprKind::Byte => self.sema.types.byte(),
            TypeExprKind::Word => self.sema.types.word(),
            TypeExprKind::Void => self.sema.types.void(),
            TypeExprKind::Bool => self.sema.types.bool(),
            // The length is adopted from the initializer literal.
            TypeExprKind::String => self.sema.types.intern(Type::Str { len: 0 }),
            TypeExprKind::Named(name) => {
                match self.sema.symbols.lookup(self.scope(), *name) {
                    Some(id) => {
                        let sym = self.sema.symbols.get(self.sema.symbols.resolve_import(id));
                        match (sym.kind, sym.ty) {
                            (SymbolKind::TypeDef | SymbolKind::Enum, Some(ty)) => ty,
                            _ => {
                                let kind = sym.kind;
                                self.error(
                                    DiagCode::TypeMismatch,
                                    te.span,
                                    format!(
                                        "`{}` is {:?}, not a type",
                                        self.name(*name),
                                        kind
                                    ),
                                );
                                self.sema.types.byte()
                            }
                        }
                    }
                    None => {
                        self.error(
                            DiagCode::UndefinedIdentifier,
                            te.span,
                            format!("type `{}` is not defined", self.name(*name)),
                        );
                        self.sema.types.byte()
                    }
                }
            }
            TypeExprKind::Array { elem, size } => {
                let elem = self.resolve_type(elem);
                let len = match self.const_eval(*size) {
                    Some(n) if n > 0 => n,
                    Some(_) => {
                        self.error(
                            DiagCode::TypeMismatch,
                            te.span,
                            "array size must be at least 1".to_string(),
                        );
                        1
                    }
                    None => {
                        self.error(
                            DiagCode::TypeMismatch,
                            te.span,
                            "array size must be a compile-time constant".to_string(),
                        );
                        1
                    }
                };
                self.sema.types.intern(Type::Array { elem, len })
            }
            TypeExprKind::Callback { params, ret } => {
                let params: Vec<TypeId> = params.iter().map(|p| self.resolve_type(p)).collect();
                let ret = self.resolve_type(ret);
                self.sema.types.intern(Type::Func {
                    params,
                    ret,
                    callback: true,
                })
            }
        }
    }

    // ---- pass 2: bodies --------------------------------------------------

    fn check_bodies(&mut self) {
        let module = self.module;
        for (index, item) in module.items.iter().enumerate() {
            match item {
                Item::Func(func) if func.body.is_some() => self.check_func(func, index),
                Item::Var(decl) => self.check_global_init(decl),
                _ => {}
            }
        }
    }

    /// Module-level initializers must be compile-time constants; they
    /// become data-segment contents.
    fn check_global_init(&mut self, decl: &VarDecl) {
        let Some(init) = decl.init else { return };
        let Some(symbol) = self
            .sema
            .symbols
            .lookup_quiet(self.scope(), decl.name)
        else {
            return;
        };
        let declared = self.sema.symbols.get(symbol).ty;
        let ty = self.check_expr(init, declared);
        if let Some(declared) = declared {
            self.require_assignable(ty, declared, self.module.expr(init).span);
            self.adopt_string_length(symbol, ty, declared);
        }
    }

    /// `let s: string = "hi";` — the declared type adopts the literal's
    /// length.
    fn adopt_string_length(&mut self, symbol: SymbolId, init_ty: TypeId, declared: TypeId) {
        let is_string_decl = matches!(self.sema.types.get(declared), Type::Str { len: 0 });
        let is_literal = matches!(self.sema.types.get(init_ty), Type::Str { .. });
        if is_string_decl && is_literal {
            self.sema.symbols.get_mut(symbol).ty = Some(init_ty);
        }
    }

    fn check_func(&mut self, func: &FuncDecl, item_index: usize) {
        let Some(symbol) = self.sema.symbols.lookup_quiet(self.scope(), func.name) else {
            return;
        };
        let Some(Type::Func { params, ret, .. }) =
            self.sema.symbols.get(symbol).ty.map(|t| self.sema.types.get(t).clone())
        else {
            return;
        };

        let func_scope = self.sema.symbols.push_scope(self.scope());
        self.scopes.push(func_scope);
        self.locals.clear();

        let mut param_syms = Vec::new();
        for (param, &pty) in func.params.iter().zip(&params) {
            let mut symbol = Symbol::new(
                param.name,
                func_scope,
                self.module_id,
                SymbolKind::Parameter,
                param.span,
            );
            symbol.ty = Some(pty);
            symbol.storage = Storage::Register;
            match self.sema.symbols.declare(func_scope, symbol) {
                Ok(id) => param_syms.push(id),
                Err(_) => {
                    self.error(
                        DiagCode::DuplicateDeclaration,
                        param.span,
                        format!("duplicate parameter `{}`", self.name(param.name)),
                    );
                }
            }
        }

        self.current_ret = Some(ret);
        let body = func.body.as_ref().unwrap();
        for &stmt in body {
            self.check_stmt(stmt);
        }
        self.current_ret = None;
        self.scopes.pop();

        let cfg = Cfg::build(self.module, body);
        let func_id: FuncId = self.sema.funcs.push(FuncInfo {
            symbol,
            module: self.module_id,
            item_index,
            scope: func_scope,
            params: param_syms,
            locals: std::mem::take(&mut self.locals),
            cfg,
        });
        self.sema.modules[self.module_id.index()].funcs.push(func_id);
    }

    fn check_block(&mut self, stmts: &[StmtId]) {
        let scope = self.sema.symbols.push_scope(self.scope());
        self.scopes.push(scope);
        for &stmt in stmts {
            self.check_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn check_stmt(&mut self, id: StmtId) {
        let module = self.module;
        let stmt = module.stmt(id);
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.check_expr(*e, None);
            }

            StmtKind::Var(decl) => self.check_local_var(id, decl),

            StmtKind::Assign { target, op, value } => {
                let target_ty = self.check_expr(*target, None);
                self.check_lvalue(*target);
                let value_ty = self.check_expr(*value, Some(target_ty));
                let span = self.module.expr(*value).span;
                self.require_assignable(value_ty, target_ty, span);
                if op.is_some() && !self.is_numeric(target_ty) {
                    self.error(
                        DiagCode::TypeMismatch,
                        stmt.span,
                        "compound assignment needs a numeric target".to_string(),
                    );
                }
            }

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.check_cond(*cond);
                self.check_block(then_block);
                if let Some(else_block) = else_block {
                    self.check_block(else_block);
                }
            }

            StmtKind::While { cond, body } => {
                self.check_cond(*cond);
                self.loop_depth += 1;
                self.check_block(body);
                self.loop_depth -= 1;
            }

            StmtKind::DoWhile { body, cond } => {
                self.loop_depth += 1;
                self.check_block(body);
                self.loop_depth -= 1;
                self.check_cond(*cond);
            }

            StmtKind::For {
                var,
                var_span,
                from,
                to,
                step,
                body,
                ..
            } => {
                let var_ty = match self.sema.symbols.lookup(self.scope(), *var) {
                    Some(sym_id) => {
                        self.sema.modules[self.module_id.index()]
                            .stmt_syms
                            .insert(id, sym_id);
                        let sym = self.sema.symbols.get(sym_id);
                        match sym.kind {
                            SymbolKind::Variable | SymbolKind::Parameter => sym.ty,
                            _ => {
                                self.error(
                                    DiagCode::NotAnLvalue,
                                    *var_span,
                                    format!(
                                        "`{}` cannot be used as a loop counter",
                                        self.name(*var)
                                    ),
                                );
                                None
                            }
                        }
                    }
                    None => {
                        self.error(
                            DiagCode::UndefinedIdentifier,
                            *var_span,
                            format!("`{}` is not defined", self.name(*var)),
                        );
                        None
                    }
                };
                let expected = var_ty.or(Some(self.sema.types.byte()));
                for &bound in [from, to].iter() {
                    let ty = self.check_expr(*bound, expected);
                    if let Some(var_ty) = var_ty {
                        self.require_assignable(ty, var_ty, self.module.expr(*bound).span);
                    }
                }
                if let Some(step) = step {
                    let ty = self.check_expr(*step, expected);
                    if let Some(var_ty) = var_ty {
                        self.require_assignable(ty, var_ty, self.module.expr(*step).span);
                    }
                }
                self.loop_depth += 1;
                self.check_block(body);
                self.loop_depth -= 1;
            }

            StmtKind::Switch {
                value,
                cases,
                default,
            } => {
                let scrutinee = self.check_expr(*value, None);
                if !self.is_numeric(scrutinee) && !self.is_enum(scrutinee) {
                    self.error(
                        DiagCode::TypeMismatch,
                        self.module.expr(*value).span,
                        format!("cannot switch over `{}`", self.display_ty(scrutinee)),
                    );
                }
                let mut seen: Vec<u32> = Vec::new();
                for case in cases {
                    let ty = self.check_expr(case.value, Some(scrutinee));
                    self.require_assignable(ty, scrutinee, self.module.expr(case.value).span);
                    match self.const_eval(case.value) {
                        Some(v) => {
                            if seen.contains(&v) {
                                self.error(
                                    DiagCode::DuplicateDeclaration,
                                    self.module.expr(case.value).span,
                                    format!("duplicate case value {v}"),
                                );
                            }
                            seen.push(v);
                        }
                        None => {
                            self.error(
                                DiagCode::TypeMismatch,
                                self.module.expr(case.value).span,
                                "case value must be a compile-time constant".to_string(),
                            );
                        }
                    }
                    self.check_block(&case.body);
                }
                if let Some(default) = default {
                    self.check_block(default);
                }
            }

            StmtKind::Return(value) => {
                let ret = self.current_ret.unwrap_or(self.sema.types.void());
                match value {
                    Some(e) => {
                        let ty = self.check_expr(*e, Some(ret));
                        if self.sema.types.identical(ret, self.sema.types.void()) {
                            self.error(
                                DiagCode::TypeMismatch,
                                stmt.span,
                                "void function cannot return a value".to_string(),
                            );
                        } else {
                            self.require_assignable(ty, ret, self.module.expr(*e).span);
                        }
                    }
                    None => {
                        if !self.sema.types.identical(ret, self.sema.types.void()) {
                            self.error(
                                DiagCode::TypeMismatch,
                                stmt.span,
                                format!(
                                    "function returns `{}`; `return;` needs a value",
                                    self.display_ty(ret)
                                ),
                            );
                        }
                    }
                }
            }

            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    let what = if matches!(stmt.kind, StmtKind::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    self.error(
                        DiagCode::SyntaxError,
                        stmt.span,
                        format!("`{what}` outside of a loop"),
                    );
                }
            }

            StmtKind::Block(stmts) => self.check_block(stmts),

            StmtKind::InlineAsm(_) => {}
        }
    }

    fn check_local_var(&mut self, stmt_id: StmtId, decl: &VarDecl) {
        let declared = self.resolve_type(&decl.ty);
        let kind = match decl.mutability {
            Mutability::Let => SymbolKind::Variable,
            Mutability::Const => SymbolKind::Const,
        };
        let mut symbol = Symbol::new(
            decl.name,
            self.scope(),
            self.module_id,
            kind,
            decl.name_span,
        );
        symbol.ty = Some(declared);
        symbol.storage = match decl.storage {
            Some(StorageMarker::Zp) => Storage::Zp,
            Some(StorageMarker::Ram) => Storage::Ram,
            Some(StorageMarker::Data) => Storage::Data,
            _ => Storage::Auto,
        };

        if let Some(init) = decl.init {
            let ty = self.check_expr(init, Some(declared));
            self.require_assignable(ty, declared, self.module.expr(init).span);
            if kind == SymbolKind::Const {
                symbol.const_value = self.const_eval(init);
            }
            if matches!(self.sema.types.get(declared), Type::Str { len: 0 }) {
                if let Type::Str { .. } = self.sema.types.get(ty) {
                    symbol.ty = Some(ty);
                }
            }
        }

        match self.sema.symbols.declare(self.scope(), symbol) {
            Ok(id) => {
                self.locals.push(id);
                self.sema.modules[self.module_id.index()]
                    .stmt_syms
                    .insert(stmt_id, id);
            }
            Err(_) => {
                self.error(
                    DiagCode::DuplicateDeclaration,
                    decl.name_span,
                    format!(
                        "`{}` is already declared in this scope",
                        self.name(decl.name)
                    ),
                );
            }
        }
    }

    fn check_cond(&mut self, cond: ExprId) {
        let ty = self.check_expr(cond, Some(self.sema.types.bool()));
        if !self.sema.types.identical(ty, self.sema.types.bool()) {
            self.error(
                DiagCode::NonBoolCondition,
                self.module.expr(cond).span,
                format!("condition has type `{}`, not `bool`", self.display_ty(ty)),
            );
        }
    }

    fn is_numeric(&self, ty: TypeId) -> bool {
        let ty = self.sema.types.normalize(ty);
        matches!(self.sema.types.get(ty), Type::Byte | Type::Word)
    }

    fn is_enum(&self, ty: TypeId) -> bool {
        matches!(
            self.sema.types.get(self.sema.types.normalize(ty)),
            Type::Enum { .. }
        )
    }

    fn require_assignable(&mut self, from: TypeId, to: TypeId, span: Span) {
        if !self.sema.types.assignable(from, to) {
            let (from_s, to_s) = (self.display_ty(from), self.display_ty(to));
            let hint = if self.is_numeric(from) && self.is_numeric(to) {
                "; cast explicitly with `byte(..)` or `word(..)`"
            } else {
                ""
            };
            self.error(
                DiagCode::TypeMismatch,
                span,
                format!("expected `{to_s}`, found `{from_s}`{hint}"),
            );
        }
    }

    /// Record the resolved type of an expression and return it.
    fn finish_expr(&mut self, expr: ExprId, ty: TypeId) -> TypeId {
        self.sema.modules[self.module_id.index()].expr_types[expr] = ty.into();
        ty
    }

    fn record_sym(&mut self, expr: ExprId, sym: SymbolId) {
        self.sema.modules[self.module_id.index()].expr_syms[expr] = sym.into();
    }

    /// If `expr` is an integer literal that fits `to`, adopt that type.
    fn adopt_literal(&mut self, expr: ExprId, to: TypeId) -> bool {
        let to_norm = self.sema.types.normalize(to);
        let fits = match (&self.module.expr(expr).kind, self.sema.types.get(to_norm)) {
            (ExprKind::Literal(Literal::Int { value, .. }), Type::Byte) => *value <= 0xFF,
            (ExprKind::Literal(Literal::Int { .. }), Type::Word) => true,
            _ => false,
        };
        if fits {
            self.finish_expr(expr, to_norm);
        }
        fits
    }

    fn check_expr(&mut self, expr: ExprId, expected: Option<TypeId>) -> TypeId {
        let module = self.module;
        let node = module.expr(expr);
        let span = node.span;
        let ty = match &node.kind {
            ExprKind::Literal(Literal::Int { value, width }) => {
                let natural = match width {
                    WidthHint::Byte => self.sema.types.byte(),
                    WidthHint::Word => self.sema.types.word(),
                };
                match expected {
                    Some(want) if self.is_numeric(want) => {
                        let want_norm = self.sema.types.normalize(want);
                        let is_byte =
                            matches!(self.sema.types.get(want_norm), Type::Byte);
                        if is_byte && *value > 0xFF {
                            natural
                        } else {
                            want_norm
                        }
                    }
                    _ => natural,
                }
            }
            ExprKind::Literal(Literal::Str(s)) => {
                let len = s.chars().count() as u32;
                self.sema.types.intern(Type::Str { len })
            }
            ExprKind::Literal(Literal::Bool(_)) => self.sema.types.bool(),

            ExprKind::Ident(name) => {
                let name = *name;
                match self.sema.symbols.lookup(self.scope(), name) {
                    None => {
                        self.error(
                            DiagCode::UndefinedIdentifier,
                            span,
                            format!("`{}` is not defined", self.name(name)),
                        );
                        expected.unwrap_or(self.sema.types.byte())
                    }
                    Some(id) => {
                        self.record_sym(expr, id);
                        let resolved = self.sema.symbols.resolve_import(id);
                        let sym = self.sema.symbols.get(resolved);
                        let sym_kind = sym.kind;
                        let sym_ty = sym.ty;
                        match sym_kind {
                            SymbolKind::Variable
                            | SymbolKind::Const
                            | SymbolKind::Parameter
                            | SymbolKind::Map
                            | SymbolKind::EnumMember => {
                                sym_ty.unwrap_or(self.sema.types.byte())
                            }
                            SymbolKind::Function | SymbolKind::Builtin => {
                                self.error(
                                    DiagCode::TypeMismatch,
                                    span,
                                    format!(
                                        "`{}` is a function; call it, or take its address with `@`",
                                        self.name(name)
                                    ),
                                );
                                self.sema.types.byte()
                            }
                            SymbolKind::Enum => {
                                self.error(
                                    DiagCode::TypeMismatch,
                                    span,
                                    format!(
                                        "`{}` is a type; use `{}.MEMBER`",
                                        self.name(name),
                                        self.name(name)
                                    ),
                                );
                                sym_ty.unwrap_or(self.sema.types.byte())
                            }
                            SymbolKind::TypeDef | SymbolKind::Module | SymbolKind::Import => {
                                self.error(
                                    DiagCode::TypeMismatch,
                                    span,
                                    format!("`{}` is not a value", self.name(name)),
                                );
                                self.sema.types.byte()
                            }
                        }
                    }
                }
            }

            ExprKind::Call { callee, args } => {
                let callee = *callee;
                let args = args.clone();
                return self.check_call(expr, callee, &args, span);
            }

            ExprKind::Index { base, index } => {
                let (base, index) = (*base, *index);
                let base_ty = self.check_expr(base, None);
                let norm = self.sema.types.normalize(base_ty);
                let elem = match self.sema.types.get(norm) {
                    Type::Array { elem, .. } => *elem,
                    _ => {
                        self.error(
                            DiagCode::IndexNonArray,
                            span,
                            format!("cannot index into `{}`", self.display_ty(base_ty)),
                        );
                        self.sema.types.byte()
                    }
                };
                let idx_ty = self.check_expr(index, Some(self.sema.types.byte()));
                if !self.is_numeric(idx_ty) {
                    self.error(
                        DiagCode::TypeMismatch,
                        self.module.expr(index).span,
                        format!("array index has type `{}`", self.display_ty(idx_ty)),
                    );
                }
                elem
            }

            ExprKind::Member {
                base,
                field,
                field_span,
            } => {
                let (base, field, field_span) = (*base, *field, *field_span);
                return self.check_member(expr, base, field, field_span);
            }

            ExprKind::Unary { op, operand } => {
                let (op, operand) = (*op, *operand);
                match op {
                    UnOp::Not => {
                        let ty = self.check_expr(operand, Some(self.sema.types.bool()));
                        if !self.sema.types.identical(ty, self.sema.types.bool()) {
                            self.error(
                                DiagCode::NonBoolCondition,
                                span,
                                format!("`!` needs a `bool`, found `{}`", self.display_ty(ty)),
                            );
                        }
                        self.sema.types.bool()
                    }
                    UnOp::Neg | UnOp::BitNot => {
                        let ty = self.check_expr(operand, expected);
                        if !self.is_numeric(ty) {
                            self.error(
                                DiagCode::TypeMismatch,
                                span,
                                format!(
                                    "`{}` needs a numeric operand, found `{}`",
                                    op.as_str(),
                                    self.display_ty(ty)
                                ),
                            );
                            self.sema.types.byte()
                        } else {
                            self.sema.types.normalize(ty)
                        }
                    }
                }
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let (op, lhs, rhs) = (*op, *lhs, *rhs);
                return self.check_binary(expr, op, lhs, rhs, span, expected);
            }

            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let (cond, then_expr, else_expr) = (*cond, *then_expr, *else_expr);
                self.check_cond(cond);
                let then_ty = self.check_expr(then_expr, expected);
                let else_ty = self.check_expr(else_expr, Some(then_ty));
                if self.sema.types.identical(then_ty, else_ty)
                    || self.adopt_literal(then_expr, else_ty)
                    || self.adopt_literal(else_expr, then_ty)
                {
                    self.sema.types.normalize(then_ty)
                } else {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!(
                            "ternary arms have different types: `{}` and `{}`",
                            self.display_ty(then_ty),
                            self.display_ty(else_ty)
                        ),
                    );
                    then_ty
                }
            }

            ExprKind::ArrayLit(elems) => {
                let elems = elems.clone();
                let expected_elem = expected.and_then(|t| {
                    match self.sema.types.get(self.sema.types.normalize(t)) {
                        Type::Array { elem, .. } => Some(*elem),
                        _ => None,
                    }
                });
                let mut elem_ty = expected_elem;
                for &e in &elems {
                    let ty = self.check_expr(e, elem_ty);
                    match elem_ty {
                        None => elem_ty = Some(ty),
                        Some(want) => {
                            self.require_assignable(ty, want, self.module.expr(e).span)
                        }
                    }
                }
                let elem = elem_ty.unwrap_or(self.sema.types.byte());
                self.sema.types.intern(Type::Array {
                    elem,
                    len: elems.len() as u32,
                })
            }

            ExprKind::AddressOf(name) => {
                let name = *name;
                match self.sema.symbols.lookup(self.scope(), name) {
                    None => {
                        self.error(
                            DiagCode::UndefinedIdentifier,
                            span,
                            format!("`{}` is not defined", self.name(name)),
                        );
                    }
                    Some(id) => {
                        self.record_sym(expr, id);
                        let resolved = self.sema.symbols.resolve_import(id);
                        let sym = self.sema.symbols.get(resolved);
                        match sym.kind {
                            SymbolKind::Variable | SymbolKind::Parameter | SymbolKind::Map => {}
                            SymbolKind::Function => {
                                let callback = matches!(
                                    sym.ty.map(|t| self.sema.types.get(t)),
                                    Some(Type::Func { callback: true, .. })
                                );
                                if !callback {
                                    self.error(
                                        DiagCode::TypeMismatch,
                                        span,
                                        format!(
                                            "`{}` is not a callback; only callback functions have addresses",
                                            self.name(name)
                                        ),
                                    );
                                }
                            }
                            _ => {
                                self.error(
                                    DiagCode::TypeMismatch,
                                    span,
                                    format!("`{}` has no address", self.name(name)),
                                );
                            }
                        }
                    }
                }
                self.sema.types.address()
            }

            ExprKind::Cast { to, operand } => {
                let (to, operand) = (*to, *operand);
                let from = self.check_expr(operand, None);
                let from_norm = self.sema.types.normalize(from);
                let ok = self.is_numeric(from) || self.is_enum(from);
                if !ok {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!("cannot cast `{}`", self.display_ty(from)),
                    );
                }
                match to {
                    CastKind::Byte => {
                        let is_word = matches!(self.sema.types.get(from_norm), Type::Word);
                        let known_small =
                            matches!(self.const_eval(operand), Some(v) if v <= 0xFF);
                        if is_word && !known_small {
                            self.sink.report(Diagnostic::new(
                                DiagCode::CastTruncates,
                                span,
                                "`byte(..)` drops the high byte".to_string(),
                            ));
                        }
                        self.sema.types.byte()
                    }
                    CastKind::Word => self.sema.types.word(),
                }
            }
        };
        self.finish_expr(expr, ty)
    }

    fn check_binary(
        &mut self,
        expr: ExprId,
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        span: Span,
        expected: Option<TypeId>,
    ) -> TypeId {
        use BinOp::*;
        let ty = match op {
            And | Or => {
                for &side in [lhs, rhs].iter() {
                    let ty = self.check_expr(side, Some(self.sema.types.bool()));
                    if !self.sema.types.identical(ty, self.sema.types.bool()) {
                        self.error(
                            DiagCode::NonBoolCondition,
                            self.module.expr(side).span,
                            format!(
                                "`{}` needs `bool` operands, found `{}`",
                                op.as_str(),
                                self.display_ty(ty)
                            ),
                        );
                    }
                }
                self.sema.types.bool()
            }

            Lt | Le | Gt | Ge | Eq | Ne => {
                let lhs_ty = self.check_expr(lhs, None);
                let rhs_ty = self.check_expr(rhs, Some(lhs_ty));
                if !(self.sema.types.identical(lhs_ty, rhs_ty)
                    || self.adopt_literal(lhs, rhs_ty)
                    || self.adopt_literal(rhs, lhs_ty))
                {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!(
                            "cannot compare `{}` with `{}`",
                            self.display_ty(lhs_ty),
                            self.display_ty(rhs_ty)
                        ),
                    );
                }
                self.sema.types.bool()
            }

            Shl | Shr => {
                let lhs_ty = self.check_expr(lhs, expected);
                let rhs_ty = self.check_expr(rhs, Some(self.sema.types.byte()));
                if !self.is_numeric(lhs_ty) || !self.is_numeric(rhs_ty) {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!("`{}` needs numeric operands", op.as_str()),
                    );
                }
                self.sema.types.normalize(lhs_ty)
            }

            Add | Sub | Mul | Div | Rem | BitAnd | BitOr | BitXor => {
                let want = expected.filter(|&t| self.is_numeric(t));
                let lhs_ty = self.check_expr(lhs, want);
                let rhs_ty = self.check_expr(rhs, Some(lhs_ty));
                let result = if self.sema.types.identical(lhs_ty, rhs_ty) {
                    lhs_ty
                } else if self.adopt_literal(lhs, rhs_ty) {
                    rhs_ty
                } else if self.adopt_literal(rhs, lhs_ty) {
                    lhs_ty
                } else {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!(
                            "`{}` needs operands of the same type: `{}` vs `{}`; cast explicitly",
                            op.as_str(),
                            self.display_ty(lhs_ty),
                            self.display_ty(rhs_ty)
                        ),
                    );
                    lhs_ty
                };
                if !self.is_numeric(result) {
                    self.error(
                        DiagCode::TypeMismatch,
                        span,
                        format!(
                            "`{}` needs numeric operands, found `{}`",
                            op.as_str(),
                            self.display_ty(result)
                        ),
                    );
                    self.finish_expr(expr, self.sema.types.byte());
                    return self.sema.types.byte();
                }
                self.sema.types.normalize(result)
            }
        };
        self.finish_expr(expr, ty)
    }

    fn check_call(
        &mut self,
        expr: ExprId,
        callee: ExprId,
        args: &[ExprId],
        span: Span,
    ) -> TypeId {
        let module = self.module;
        let ExprKind::Ident(name) = &module.expr(callee).kind else {
            self.error(
                DiagCode::TypeMismatch,
                span,
                "calls must name a function directly".to_string(),
            );
            for &arg in args {
                self.check_expr(arg, None);
            }
            return self.finish_expr(expr, self.sema.types.byte());
        };
        let name = *name;

        let Some(id) = self.sema.symbols.lookup(self.scope(), name) else {
            self.error(
                DiagCode::UndefinedIdentifier,
                self.module.expr(callee).span,
                format!("`{}` is not defined", self.name(name)),
            );
            for &arg in args {
                self.check_expr(arg, None);
            }
            return self.finish_expr(expr, self.sema.types.byte());
        };
        self.record_sym(callee, id);
        let resolved = self.sema.symbols.resolve_import(id);

        // The compile-time builtins take pseudo-arguments.
        if let Some(&builtin) = self.sema.builtins.get(&resolved) {
            if matches!(builtin, Builtin::Sizeof | Builtin::Length) {
                let word = self.sema.types.word();
                if args.len() != 1 {
                    self.error(
                        DiagCode::WrongArgumentCount,
                        span,
                        format!("`{}` takes exactly one argument", builtin.name()),
                    );
                    return self.finish_expr(expr, word);
                }
                let arg = args[0];
                // Resolve the argument so usage marking happens, but do
                // not type-check it as a value: the compiler measures it
                // and never materializes it.
                if let ExprKind::Ident(n) = &module.expr(arg).kind {
                    match self.sema.symbols.lookup(self.scope(), *n) {
                        Some(id) => self.record_sym(arg, id),
                        None => {
                            self.error(
                                DiagCode::UndefinedIdentifier,
                                module.expr(arg).span,
                                format!("`{}` is not defined", self.name(*n)),
                            );
                        }
                    }
                }
                let value = match builtin {
                    Builtin::Sizeof => self.const_sizeof(arg),
                    _ => self.const_length(arg),
                };
                if value.is_none() {
                    self.error(
                        DiagCode::TypeMismatch,
                        self.module.expr(arg).span,
                        format!(
                            "`{}` needs an array or string the compiler can measure",
                            builtin.name()
                        ),
                    );
                }
                return self.finish_expr(expr, word);
            }
        }

        let sym = self.sema.symbols.get(resolved);
        let func_ty = match (sym.kind, sym.ty) {
            (SymbolKind::Function | SymbolKind::Builtin, Some(ty)) => ty,
            _ => {
                self.error(
                    DiagCode::TypeMismatch,
                    self.module.expr(callee).span,
                    format!("`{}` is not a function", self.name(name)),
                );
                for &arg in args {
                    self.check_expr(arg, None);
                }
                return self.finish_expr(expr, self.sema.types.byte());
            }
        };
        let Type::Func { params, ret, .. } = self.sema.types.get(func_ty).clone() else {
            return self.finish_expr(expr, self.sema.types.byte());
        };

        if args.len() != params.len() {
            self.error(
                DiagCode::WrongArgumentCount,
                span,
                format!(
                    "`{}` takes {} argument{}, found {}",
                    self.name(name),
                    params.len(),
                    if params.len() == 1 { "" } else { "s" },
                    args.len()
                ),
            );
        }
        for (&arg, &pty) in args.iter().zip(&params) {
            let ty = self.check_expr(arg, Some(pty));
            self.require_assignable(ty, pty, self.module.expr(arg).span);
        }
        for &arg in args.iter().skip(params.len()) {
            self.check_expr(arg, None);
        }
        self.finish_expr(expr, ret)
    }

    fn const_sizeof(&self, arg: ExprId) -> Option<u32> {
        let ctx = ConstCtx {
            module: self.module,
            symbols: &self.sema.symbols,
            scope: self.scope(),
            types: &self.sema.types,
            builtins: &self.sema.builtins,
        };
        const_eval::sizeof_arg(&ctx, arg)
    }

    fn const_length(&self, arg: ExprId) -> Option<u32> {
        let ctx = ConstCtx {
            module: self.module,
            symbols: &self.sema.symbols,
            scope: self.scope(),
            types: &self.sema.types,
            builtins: &self.sema.builtins,
        };
        const_eval::length_arg(&ctx, arg)
    }

    fn check_member(
        &mut self,
        expr: ExprId,
        base: ExprId,
        field: blend65_frontend::intern::Name,
        field_span: Span,
    ) -> TypeId {
        let module = self.module;
        let ExprKind::Ident(base_name) = &module.expr(base).kind else {
            self.check_expr(base, None);
            self.error(
                DiagCode::InvalidMemberAccess,
                field_span,
                "member access needs an enum or `@map` name on the left".to_string(),
            );
            return self.finish_expr(expr, self.sema.types.byte());
        };
        let base_name = *base_name;

        let Some(id) = self.sema.symbols.lookup(self.scope(), base_name) else {
            self.error(
                DiagCode::UndefinedIdentifier,
                self.module.expr(base).span,
                format!("`{}` is not defined", self.name(base_name)),
            );
            return self.finish_expr(expr, self.sema.types.byte());
        };
        self.record_sym(base, id);
        let resolved = self.sema.symbols.resolve_import(id);
        let sym_kind = self.sema.symbols.get(resolved).kind;
        let sym_ty = self.sema.symbols.get(resolved).ty;

        match sym_kind {
            SymbolKind::Enum => {
                let member_scope = self.sema.enum_scopes.get(&resolved).copied();
                let member = member_scope
                    .and_then(|s| self.sema.symbols.lookup_local(s, field));
                match member {
                    Some(m) => {
                        let value = self.sema.symbols.get(m).const_value.unwrap_or(0) as u8;
                        let ty = sym_ty.unwrap_or(self.sema.types.byte());
                        if let Some(ty) = sym_ty {
                            self.finish_expr(base, ty);
                        }
                        self.sema.modules[self.module_id.index()]
                            .member_res
                            .insert(expr, MemberRes::EnumMember { value, ty });
                        self.finish_expr(expr, ty)
                    }
                    None => {
                        self.error(
                            DiagCode::InvalidMemberAccess,
                            field_span,
                            format!(
                                "`{}` has no member `{}`",
                                self.name(base_name),
                                self.name(field)
                            ),
                        );
                        self.finish_expr(expr, self.sema.types.byte())
                    }
                }
            }
            SymbolKind::Map => {
                let info = self
                    .sema
                    .symbols
                    .map_fields(resolved)
                    .and_then(|fields| fields.iter().find(|f| f.name == field).cloned());
                match info {
                    Some(f) => {
                        if let Some(ty) = sym_ty {
                            self.finish_expr(base, ty);
                        }
                        self.sema.modules[self.module_id.index()]
                            .member_res
                            .insert(
                                expr,
                                MemberRes::MapField {
                                    addr: f.addr,
                                    ty: f.ty,
                                },
                            );
                        self.finish_expr(expr, f.ty)
                    }
                    None => {
                        self.error(
                            DiagCode::InvalidMemberAccess,
                            field_span,
                            format!(
                                "`{}` has no field `{}`",
                                self.name(base_name),
                                self.name(field)
                            ),
                        );
                        self.finish_expr(expr, self.sema.types.byte())
                    }
                }
            }
            _ => {
                self.error(
                    DiagCode::InvalidMemberAccess,
                    field_span,
                    format!(
                        "`{}` is not an enum or `@map` struct",
                        self.name(base_name)
                    ),
                );
                self.finish_expr(expr, self.sema.types.byte())
            }
        }
    }

    /// Validate that `target` may be assigned to.
    fn check_lvalue(&mut self, target: ExprId) {
        let module = self.module;
        let span = module.expr(target).span;
        match &module.expr(target).kind {
            ExprKind::Ident(name) => {
                let name = *name;
                let Some(id) = self.sema.symbols.lookup_quiet(self.scope(), name) else {
                    return; // already diagnosed as undefined
                };
                let resolved = self.sema.symbols.resolve_import(id);
                let sym = self.sema.symbols.get(resolved);
                match sym.kind {
                    SymbolKind::Variable | SymbolKind::Parameter | SymbolKind::Map => {}
                    SymbolKind::Const | SymbolKind::EnumMember => {
                        self.error(
                            DiagCode::NotAnLvalue,
                            span,
                            format!("cannot assign to constant `{}`", self.name(name)),
                        );
                    }
                    _ => {
                        self.error(
                            DiagCode::NotAnLvalue,
                            span,
                            format!("cannot assign to `{}`", self.name(name)),
                        );
                    }
                }
            }
            ExprKind::Index { base, .. } => self.check_lvalue(*base),
            ExprKind::Member { .. } => {
                // A map field is writable; an enum member is not.
                let is_enum = self.sema.modules[self.module_id.index()]
                    .member_res
                    .get(&target)
                    .is_some_and(|r| matches!(r, MemberRes::EnumMember { .. }));
                if is_enum {
                    self.error(
                        DiagCode::NotAnLvalue,
                        span,
                        "an enum member is not assignable".to_string(),
                    );
                }
            }
            _ => {
                self.error(
                    DiagCode::NotAnLvalue,
                    span,
                    "the left side of an assignment must be a variable, index or map field"
                        .to_string(),
                );
            }
        }
    }
}
