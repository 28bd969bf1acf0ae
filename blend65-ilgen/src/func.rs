//! Per-function lowering from the typed AST to IL.
//!
//! Expressions lower to sequences ending in one virtual register; void
//! calls produce nothing. Scalar locals live in virtual registers;
//! aggregates and escaped locals were given memory homes by the
//! program-level pass. Short-circuit operators and the ternary become
//! branch diamonds that preserve evaluation order; `for` desugars to its
//! `while` form; `switch` becomes a jump table when its byte-wide case
//! values are compact, a compare chain otherwise.

use crate::width_of;
use blend65_codegen::ir::{
    AluOp, Block, Cond, CpuOp, FuncRef, Function, FunctionBuilder, GlobalId, Inst, MemAddr, Term,
    UnaryOp, Vreg, Width,
};
use blend65_frontend::ast::{
    BinOp, CastKind, ExprId, ExprKind, Item, Literal, Module, StmtId, StmtKind, UnOp,
};
use blend65_frontend::intern::Interner;
use blend65_sema::builtins::Builtin;

use blend65_sema::symbols::{SymbolId, SymbolKind};
use blend65_sema::types::Type;
use blend65_sema::{FuncInfo, MemberRes, ModuleSema, Sema};
use rustc_hash::FxHashMap;

/// How many case values a switch may span per arm before the jump table
/// is judged too sparse.
const JUMP_TABLE_DENSITY: u32 = 2;

/// Lower one checked function body.
#[allow(clippy::too_many_arguments)]
pub(crate) fn lower_function(
    module: &Module,
    msema: &ModuleSema,
    sema: &Sema,
    interner: &Interner,
    info: &FuncInfo,
    fref: FuncRef,
    func_refs: &FxHashMap<SymbolId, FuncRef>,
    globals: &FxHashMap<SymbolId, GlobalId>,
) -> Function {
    let mut function = Function::new(fref);
    let Item::Func(decl) = &module.items[info.item_index] else {
        unreachable!("function info points at a non-function item");
    };
    let body = decl.body.as_ref().expect("stub reached lowering");

    log::trace!(
        "lowering function `{}`",
        interner.resolve(sema.symbols.get(info.symbol).name)
    );
    let ret = match sema.symbols.get(info.symbol).ty.map(|t| sema.types.get(t).clone()) {
        Some(Type::Func { ret, .. }) if !sema.types.identical(ret, sema.types.void()) => {
            Some(width_of(sema, ret))
        }
        _ => None,
    };

    let mut b = FunctionBuilder::new(&mut function);
    let mut lower = FuncLower {
        module,
        msema,
        sema,
        ret,
        func_refs,
        globals,
        locals: FxHashMap::default(),
        loops: Vec::new(),
        b: &mut b,
    };

    // Parameters become ordinary virtual registers.
    let mut params = Vec::new();
    for &param in &info.params {
        let ty = lower.sema.symbols.get(param).ty.expect("typed parameter");
        let width = width_of(lower.sema, ty);
        let vreg = lower.b.new_vreg(width);
        lower.locals.insert(param, vreg);
        params.push(vreg);
    }

    for &stmt in body {
        lower.stmt(stmt);
    }
    if !lower.b.is_terminated() {
        lower.b.terminate(Term::Return(None));
    }
    drop(b);

    function.params = params;
    function
}

struct FuncLower<'a, 'b> {
    module: &'a Module,
    msema: &'a ModuleSema,
    sema: &'a Sema,
    /// Return width of the function being lowered; `None` for void.
    ret: Option<Width>,
    func_refs: &'a FxHashMap<SymbolId, FuncRef>,
    globals: &'a FxHashMap<SymbolId, GlobalId>,
    /// Scalar locals and parameters and their registers.
    locals: FxHashMap<SymbolId, Vreg>,
    /// `(continue_target, break_target)` of enclosing loops.
    loops: Vec<(Block, Block)>,
    b: &'a mut FunctionBuilder<'b>,
}

impl FuncLower<'_, '_> {
    fn expr_width(&self, e: ExprId) -> Width {
        match self.msema.expr_ty(e) {
            Some(ty) => width_of(self.sema, ty),
            None => Width::Byte,
        }
    }

    fn resolved_sym(&self, e: ExprId) -> Option<SymbolId> {
        self.msema
            .expr_sym(e)
            .map(|s| self.sema.symbols.resolve_import(s))
    }

    /// The folded constant of an expression, if the analysis found one.
    fn const_of(&self, e: ExprId) -> Option<u16> {
        if let ExprKind::Literal(Literal::Int { value, .. }) = &self.module.expr(e).kind {
            return Some(*value as u16);
        }
        if let ExprKind::Literal(Literal::Bool(v)) = &self.module.expr(e).kind {
            return Some(u16::from(*v));
        }
        self.msema.metadata.const_of(e).map(|v| v as u16)
    }

    /// The memory home of a symbol, when it has one.
    fn sym_addr(&self, sym: SymbolId) -> Option<MemAddr> {
        let symbol = self.sema.symbols.get(sym);
        if let Some(&global) = self.globals.get(&sym) {
            return Some(MemAddr::Global(global, 0));
        }
        symbol.address.map(|a| MemAddr::Abs(a as u16))
    }

    fn is_volatile_sym(&self, sym: SymbolId) -> bool {
        self.sema.symbols.get(sym).kind == SymbolKind::Map
    }

    // ---- statements ------------------------------------------------------

    fn block(&mut self, stmts: &[StmtId]) {
        for &stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, id: StmtId) {
        if self.b.is_terminated() {
            // Unreachable code: already warned, nothing to lower.
            return;
        }
        let module = self.module;
        match &module.stmt(id).kind {
            StmtKind::Expr(e) => {
                self.expr(*e);
            }

            StmtKind::Var(decl) => {
                let Some(&sym) = self.msema.stmt_syms.get(&id) else {
                    return;
                };
                if let Some(addr) = self.sym_addr(sym) {
                    // Memory-resident local (array, string, escaped).
                    if let Some(init) = decl.init {
                        self.init_memory_local(addr, init, sym);
                    }
                    return;
                }
                let ty = self.sema.symbols.get(sym).ty.expect("typed local");
                let width = width_of(self.sema, ty);
                let vreg = self.b.new_vreg(width);
                self.locals.insert(sym, vreg);
                if let Some(init) = decl.init {
                    if let Some(value) = self.expr(init) {
                        let value = self.coerce(value, width);
                        self.b.mov(vreg, value);
                    }
                }
            }

            StmtKind::Assign { target, op, value } => self.assign(*target, *op, *value),

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.expr(*cond).expect("typed condition");
                let then_b = self.b.create_block();
                let join = self.b.create_block();
                let else_b = match else_block {
                    Some(_) => self.b.create_block(),
                    None => join,
                };
                self.b.terminate(Term::Branch {
                    cond,
                    then_block: then_b,
                    else_block: else_b,
                });
                self.b.switch_to_block(then_b);
                self.block(then_block);
                self.b.jump_if_open(join);
                if let Some(else_stmts) = else_block {
                    self.b.switch_to_block(else_b);
                    self.block(else_stmts);
                    self.b.jump_if_open(join);
                }
                self.b.switch_to_block(join);
            }

            StmtKind::While { cond, body } => {
                let header = self.b.create_block();
                let body_b = self.b.create_block();
                let join = self.b.create_block();
                self.b.terminate(Term::Jump(header));

                self.b.switch_to_block(header);
                let cond = self.expr(*cond).expect("typed condition");
                self.b.terminate(Term::Branch {
                    cond,
                    then_block: body_b,
                    else_block: join,
                });

                self.loops.push((header, join));
                self.b.switch_to_block(body_b);
                self.block(body);
                self.b.jump_if_open(header);
                self.loops.pop();

                self.b.switch_to_block(join);
            }

            StmtKind::DoWhile { body, cond } => {
                let body_b = self.b.create_block();
                let cond_b = self.b.create_block();
                let join = self.b.create_block();
                self.b.terminate(Term::Jump(body_b));

                self.loops.push((cond_b, join));
                self.b.switch_to_block(body_b);
                self.block(body);
                self.b.jump_if_open(cond_b);
                self.loops.pop();

                // The body block sits before the back-edge condition.
                self.b.switch_to_block(cond_b);
                let cond = self.expr(*cond).expect("typed condition");
                self.b.terminate(Term::Branch {
                    cond,
                    then_block: body_b,
                    else_block: join,
                });
                self.b.switch_to_block(join);
            }

            StmtKind::For {
                from,
                to,
                downto,
                step,
                body,
                ..
            } => {
                let Some(&var_sym) = self.msema.stmt_syms.get(&id) else {
                    return;
                };
                // The counter is usually a register-resident local; a
                // module-level or escaped counter goes through its memory
                // home instead.
                let reg = self.locals.get(&var_sym).copied();
                let home = if reg.is_none() {
                    match self.sym_addr(var_sym) {
                        Some(addr) => Some(addr),
                        None => return,
                    }
                } else {
                    None
                };
                let ty = self.sema.symbols.get(var_sym).ty.expect("typed counter");
                let width = width_of(self.sema, ty);
                let volatile = self.is_volatile_sym(var_sym);

                // `for i = A to B step S` is `i = A; while (i <= B) {
                // body; i += S; }`; `downto` flips the test and the sign.
                let init = self.expr(*from).expect("typed bound");
                let init = self.coerce(init, width);
                match (reg, &home) {
                    (Some(var), _) => self.b.mov(var, init),
                    (None, Some(addr)) => self.b.store(addr.clone(), init, width, volatile),
                    (None, None) => unreachable!(),
                }

                let header = self.b.create_block();
                let body_b = self.b.create_block();
                let step_b = self.b.create_block();
                let join = self.b.create_block();
                self.b.terminate(Term::Jump(header));

                self.b.switch_to_block(header);
                let current = match (reg, &home) {
                    (Some(var), _) => var,
                    (None, Some(addr)) => self.b.load(addr.clone(), width, volatile),
                    (None, None) => unreachable!(),
                };
                let bound = self.expr(*to).expect("typed bound");
                let bound = self.coerce(bound, width);
                let cc = if *downto { Cond::Ge } else { Cond::Le };
                let cond = self.b.cmp(cc, width, current, bound);
                self.b.terminate(Term::Branch {
                    cond,
                    then_block: body_b,
                    else_block: join,
                });

                self.loops.push((step_b, join));
                self.b.switch_to_block(body_b);
                self.block(body);
                self.b.jump_if_open(step_b);
                self.loops.pop();

                self.b.switch_to_block(step_b);
                let step_value = match step {
                    Some(s) => {
                        let v = self.expr(*s).expect("typed step");
                        self.coerce(v, width)
                    }
                    None => self.b.iconst(1, width),
                };
                let op = if *downto { AluOp::Sub } else { AluOp::Add };
                let current = match (reg, &home) {
                    (Some(var), _) => var,
                    (None, Some(addr)) => self.b.load(addr.clone(), width, volatile),
                    (None, None) => unreachable!(),
                };
                let next = self.b.binary(op, width, current, step_value);
                match (reg, &home) {
                    (Some(var), _) => self.b.mov(var, next),
                    (None, Some(addr)) => self.b.store(addr.clone(), next, width, volatile),
                    (None, None) => unreachable!(),
                }
                self.b.terminate(Term::Jump(header));

                self.b.switch_to_block(join);
            }

            StmtKind::Switch {
                value,
                cases,
                default,
            } => self.switch(*value, cases, default.as_deref()),

            StmtKind::Return(value) => {
                let value = match value {
                    Some(e) => {
                        let v = self.expr(*e).expect("typed return value");
                        match self.ret {
                            Some(w) => Some(self.coerce(v, w)),
                            None => Some(v),
                        }
                    }
                    None => None,
                };
                self.b.terminate(Term::Return(value));
            }

            StmtKind::Break => {
                if let Some(&(_, join)) = self.loops.last() {
                    self.b.terminate(Term::Jump(join));
                }
            }

            StmtKind::Continue => {
                if let Some(&(header, _)) = self.loops.last() {
                    self.b.terminate(Term::Jump(header));
                }
            }

            StmtKind::Block(stmts) => self.block(stmts),

            StmtKind::InlineAsm(lines) => {
                self.b.ins(Inst::InlineAsm(lines.clone()));
            }
        }
    }

    fn b_width(&self, v: Vreg) -> Width {
        self.b.width_of(v)
    }

    /// Runtime initialization of a memory-resident local.
    fn init_memory_local(&mut self, addr: MemAddr, init: ExprId, sym: SymbolId) {
        let module = self.module;
        let ty = self.sema.symbols.get(sym).ty.expect("typed local");
        match &module.expr(init).kind {
            ExprKind::ArrayLit(elems) => {
                let elem_size = match self.sema.types.get(self.sema.types.normalize(ty)) {
                    Type::Array { elem, .. } => self.sema.types.size_of(*elem),
                    _ => 1,
                };
                let width = if elem_size <= 1 { Width::Byte } else { Width::Word };
                for (i, &e) in elems.iter().enumerate() {
                    let value = self.expr(e).expect("typed element");
                    let value = self.coerce(value, width);
                    let offset = (i as u32 * elem_size) as u16;
                    let at = offset_addr(&addr, offset);
                    self.b.store(at, value, width, false);
                }
            }
            ExprKind::Literal(Literal::Str(s)) => {
                for (i, byte) in s.bytes().enumerate() {
                    let v = self.b.iconst(u16::from(byte), Width::Byte);
                    let at = offset_addr(&addr, i as u16);
                    self.b.store(at, v, Width::Byte, false);
                }
            }
            _ => {
                let width = width_of(self.sema, ty);
                if let Some(value) = self.expr(init) {
                    let value = self.coerce(value, width);
                    self.b.store(addr, value, width, false);
                }
            }
        }
    }

    fn assign(&mut self, target: ExprId, op: Option<BinOp>, value: ExprId) {
        let module = self.module;
        match &module.expr(target).kind {
            ExprKind::Ident(_) => {
                let Some(sym) = self.resolved_sym(target) else {
                    return;
                };
                let width = self.expr_width(target);
                if let Some(&vreg) = self.locals.get(&sym) {
                    let rhs = self.rhs_value(op, value, width, |_| Some(vreg));
                    if let Some(rhs) = rhs {
                        self.b.mov(vreg, rhs);
                    }
                    return;
                }
                let Some(addr) = self.sym_addr(sym) else { return };
                let volatile = self.is_volatile_sym(sym);
                let rhs = self.rhs_value(op, value, width, |this| {
                    Some(this.b.load(addr.clone(), width, volatile))
                });
                if let Some(rhs) = rhs {
                    self.b.store(addr, rhs, width, volatile);
                }
            }

            ExprKind::Index { base, index } => {
                let (base, index) = (*base, *index);
                self.assign_indexed(target, base, index, op, value);
            }

            ExprKind::Member { .. } => {
                let Some(MemberRes::MapField { addr, ty }) =
                    self.msema.member_res.get(&target)
                else {
                    return;
                };
                let (addr, ty) = (*addr, *ty);
                let width = width_of(self.sema, ty);
                let at = MemAddr::Abs(addr as u16);
                let at2 = at.clone();
                let rhs = self.rhs_value(op, value, width, move |this| {
                    Some(this.b.load(at2.clone(), width, true))
                });
                if let Some(rhs) = rhs {
                    self.b.store(at, rhs, width, true);
                }
            }

            _ => {}
        }
    }

    /// Evaluate the right side of an assignment, folding in the compound
    /// operation when there is one; `load_current` produces the target's
    /// present value only when needed.
    fn rhs_value(
        &mut self,
        op: Option<BinOp>,
        value: ExprId,
        width: Width,
        load_current: impl FnOnce(&mut Self) -> Option<Vreg>,
    ) -> Option<Vreg> {
        let rhs = self.expr(value)?;
        let rhs = self.coerce(rhs, width);
        match op {
            None => Some(rhs),
            Some(op) => {
                let current = load_current(self)?;
                let alu = alu_of(op)?;
                Some(self.b.binary(alu, width, current, rhs))
            }
        }
    }

    fn assign_indexed(
        &mut self,
        target: ExprId,
        base: ExprId,
        index: ExprId,
        op: Option<BinOp>,
        value: ExprId,
    ) {
        let Some(access) = self.indexed_access(base, index) else {
            return;
        };
        let width = self.expr_width(target);
        match access {
            IndexedAccess::Direct { base, offset, volatile } => {
                let b2 = base.clone();
                let off = offset;
                let rhs = self.rhs_value(op, value, width, move |this| {
                    Some(this.b.load_indexed(b2.clone(), off, width, volatile))
                });
                if let Some(rhs) = rhs {
                    self.b.store_indexed(base, offset, rhs, width, volatile);
                }
            }
            IndexedAccess::Pointer(ptr) => {
                let rhs = self.rhs_value(op, value, width, move |this| {
                    Some(this.b.peek(ptr, width))
                });
                if let Some(rhs) = rhs {
                    self.b.poke(ptr, rhs, width);
                }
            }
        }
    }

    fn switch(
        &mut self,
        value: ExprId,
        cases: &[blend65_frontend::ast::SwitchCase],
        default: Option<&[StmtId]>,
    ) {
        let scrutinee = self.expr(value).expect("typed scrutinee");
        let width = self.expr_width(value);

        let values: Option<Vec<u16>> =
            cases.iter().map(|c| self.const_of(c.value)).collect();

        let join = self.b.create_block();
        let case_blocks: Vec<Block> = cases.iter().map(|_| self.b.create_block()).collect();
        let default_b = match default {
            Some(_) => self.b.create_block(),
            None => join,
        };

        let compact = values.as_ref().is_some_and(|vals| {
            if vals.is_empty() || width != Width::Byte {
                return false;
            }
            let min = *vals.iter().min().unwrap();
            let max = *vals.iter().max().unwrap();
            let span = u32::from(max - min) + 1;
            vals.len() >= 3 && span <= vals.len() as u32 * JUMP_TABLE_DENSITY && span <= 128
        });

        if compact {
            let vals = values.unwrap();
            let min = *vals.iter().min().unwrap();
            let max = *vals.iter().max().unwrap();
            let targets: Vec<Block> = (min..=max)
                .map(|v| {
                    vals.iter()
                        .position(|&c| c == v)
                        .map(|i| case_blocks[i])
                        .unwrap_or(default_b)
                })
                .collect();
            self.b.terminate(Term::JumpTable {
                index: scrutinee,
                base: min,
                targets,
                default: default_b,
            });
        } else {
            // Compare-and-branch chain; `default` is the final
            // fallthrough.
            for (case, &case_block) in cases.iter().zip(&case_blocks) {
                let case_value = self.expr(case.value).expect("typed case");
                let case_value = self.coerce(case_value, width);
                let hit = self.b.cmp(Cond::Eq, width, scrutinee, case_value);
                let next = self.b.create_block();
                self.b.terminate(Term::Branch {
                    cond: hit,
                    then_block: case_block,
                    else_block: next,
                });
                self.b.switch_to_block(next);
            }
            self.b.terminate(Term::Jump(default_b));
        }

        for (case, &case_block) in cases.iter().zip(&case_blocks) {
            self.b.switch_to_block(case_block);
            self.block(&case.body);
            self.b.jump_if_open(join);
        }
        if let Some(default_stmts) = default {
            self.b.switch_to_block(default_b);
            self.block(default_stmts);
            self.b.jump_if_open(join);
        }
        self.b.switch_to_block(join);
    }

    // ---- expressions -----------------------------------------------------

    /// Match a register to the width its consumer expects.
    fn coerce(&mut self, v: Vreg, want: Width) -> Vreg {
        match (self.b_width(v), want) {
            (Width::Byte, Width::Word) => self.b.zext(v),
            (Width::Word, Width::Byte) => self.b.lo(v),
            _ => v,
        }
    }

    /// Lower an expression to a value register; `None` for void calls.
    fn expr(&mut self, e: ExprId) -> Option<Vreg> {
        // Folded expressions become immediates, except calls, which may
        // have effects the fold cannot see.
        if !matches!(self.module.expr(e).kind, ExprKind::Call { .. }) {
            if let Some(value) = self.const_of(e) {
                let width = self.expr_width(e);
                return Some(self.b.iconst(value, width));
            }
        }

        let module = self.module;
        match &module.expr(e).kind {
            ExprKind::Literal(Literal::Int { value, .. }) => {
                let width = self.expr_width(e);
                Some(self.b.iconst(*value as u16, width))
            }
            ExprKind::Literal(Literal::Bool(v)) => {
                Some(self.b.iconst(u16::from(*v), Width::Byte))
            }
            ExprKind::Literal(Literal::Str(_)) => {
                // Strings are compile-time data; a bare literal has no
                // runtime value beyond its (folded) length.
                Some(self.b.iconst(0, Width::Word))
            }

            ExprKind::Ident(_) => {
                let sym = self.resolved_sym(e)?;
                if let Some(&vreg) = self.locals.get(&sym) {
                    return Some(vreg);
                }
                let symbol = self.sema.symbols.get(sym);
                if let Some(value) = symbol.const_value {
                    let width = self.expr_width(e);
                    return Some(self.b.iconst(value as u16, width));
                }
                let addr = self.sym_addr(sym)?;
                let ty = symbol.ty?;
                if matches!(
                    self.sema.types.get(self.sema.types.normalize(ty)),
                    Type::Array { .. } | Type::Str { .. }
                ) {
                    // An aggregate as a value is its address.
                    return Some(self.b.addr_of(addr));
                }
                let width = width_of(self.sema, ty);
                Some(self.b.load(addr, width, self.is_volatile_sym(sym)))
            }

            ExprKind::Call { callee, args } => self.call(e, *callee, args),

            ExprKind::Index { base, index } => {
                let (base, index) = (*base, *index);
                let width = self.expr_width(e);
                match self.indexed_access(base, index)? {
                    IndexedAccess::Direct { base, offset, volatile } => {
                        Some(self.b.load_indexed(base, offset, width, volatile))
                    }
                    IndexedAccess::Pointer(ptr) => Some(self.b.peek(ptr, width)),
                }
            }

            ExprKind::Member { .. } => match self.msema.member_res.get(&e)? {
                MemberRes::EnumMember { value, .. } => {
                    Some(self.b.iconst(u16::from(*value), Width::Byte))
                }
                MemberRes::MapField { addr, ty } => {
                    let width = width_of(self.sema, *ty);
                    Some(self.b.load(MemAddr::Abs(*addr as u16), width, true))
                }
            },

            ExprKind::Unary { op, operand } => {
                let operand = self.expr(*operand)?;
                let width = self.expr_width(e);
                let operand = self.coerce(operand, width);
                let op = match op {
                    UnOp::Neg => UnaryOp::Neg,
                    UnOp::Not => UnaryOp::Not,
                    UnOp::BitNot => UnaryOp::BitNot,
                };
                Some(self.b.unary(op, width, operand))
            }

            ExprKind::Binary { op, lhs, rhs } => self.binary(e, *op, *lhs, *rhs),

            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let width = self.expr_width(e);
                let result = self.b.new_vreg(width);
                let cond = self.expr(*cond).expect("typed condition");
                let then_b = self.b.create_block();
                let else_b = self.b.create_block();
                let join = self.b.create_block();
                self.b.terminate(Term::Branch {
                    cond,
                    then_block: then_b,
                    else_block: else_b,
                });
                self.b.switch_to_block(then_b);
                if let Some(v) = self.expr(*then_expr) {
                    let v = self.coerce(v, width);
                    self.b.mov(result, v);
                }
                self.b.jump_if_open(join);
                self.b.switch_to_block(else_b);
                if let Some(v) = self.expr(*else_expr) {
                    let v = self.coerce(v, width);
                    self.b.mov(result, v);
                }
                self.b.jump_if_open(join);
                self.b.switch_to_block(join);
                Some(result)
            }

            ExprKind::ArrayLit(_) => {
                // Array literals are initializers; a bare one has no
                // address to hand out.
                Some(self.b.iconst(0, Width::Word))
            }

            ExprKind::AddressOf(_) => {
                let sym = self.resolved_sym(e)?;
                if self.sema.symbols.get(sym).kind == SymbolKind::Function {
                    // A callback's entry address, resolved at assembly
                    // time through its label.
                    let fref = *self.func_refs.get(&sym)?;
                    return Some(self.b.addr_of(MemAddr::Func(fref)));
                }
                let addr = self.sym_addr(sym)?;
                Some(self.b.addr_of(addr))
            }

            ExprKind::Cast { to, operand } => {
                let v = self.expr(*operand)?;
                match to {
                    CastKind::Byte => Some(self.coerce(v, Width::Byte)),
                    CastKind::Word => Some(self.coerce(v, Width::Word)),
                }
            }
        }
    }

    fn binary(&mut self, e: ExprId, op: BinOp, lhs: ExprId, rhs: ExprId) -> Option<Vreg> {
        // Short-circuit forms preserve observable side-effect order.
        if op == BinOp::And || op == BinOp::Or {
            let result = self.b.new_vreg(Width::Byte);
            let lhs = self.expr(lhs)?;
            let rhs_b = self.b.create_block();
            let short_b = self.b.create_block();
            let join = self.b.create_block();
            let (then_block, else_block) = if op == BinOp::And {
                (rhs_b, short_b)
            } else {
                (short_b, rhs_b)
            };
            self.b.terminate(Term::Branch {
                cond: lhs,
                then_block,
                else_block,
            });

            self.b.switch_to_block(rhs_b);
            if let Some(v) = self.expr(rhs) {
                self.b.mov(result, v);
            }
            self.b.jump_if_open(join);

            self.b.switch_to_block(short_b);
            let short_value = u16::from(op == BinOp::Or);
            let v = self.b.iconst(short_value, Width::Byte);
            self.b.mov(result, v);
            self.b.jump_if_open(join);

            self.b.switch_to_block(join);
            return Some(result);
        }

        let lhs_v = self.expr(lhs)?;
        let rhs_v = self.expr(rhs)?;

        if op.is_comparison() {
            let width = self.expr_width(lhs).max_width(self.expr_width(rhs));
            let lhs_v = self.coerce(lhs_v, width);
            let rhs_v = self.coerce(rhs_v, width);
            let cc = match op {
                BinOp::Eq => Cond::Eq,
                BinOp::Ne => Cond::Ne,
                BinOp::Lt => Cond::Lt,
                BinOp::Le => Cond::Le,
                BinOp::Gt => Cond::Gt,
                _ => Cond::Ge,
            };
            return Some(self.b.cmp(cc, width, lhs_v, rhs_v));
        }

        let width = self.expr_width(e);
        let lhs_v = self.coerce(lhs_v, width);
        let rhs_v = self.coerce(rhs_v, width);
        let alu = alu_of(op)?;
        Some(self.b.binary(alu, width, lhs_v, rhs_v))
    }

    fn call(&mut self, e: ExprId, callee: ExprId, args: &[ExprId]) -> Option<Vreg> {
        let sym = self.resolved_sym(callee)?;

        if let Some(&builtin) = self.sema.builtins.get(&sym) {
            return self.intrinsic(e, builtin, args);
        }

        let fref = *self.func_refs.get(&sym)?;
        let symbol = self.sema.symbols.get(sym);
        let Some(Type::Func { params, ret, .. }) =
            symbol.ty.map(|t| self.sema.types.get(t).clone())
        else {
            return None;
        };

        let mut arg_regs = Vec::with_capacity(args.len());
        for (&arg, &pty) in args.iter().zip(&params) {
            let v = self.expr(arg)?;
            let v = self.coerce(v, width_of(self.sema, pty));
            arg_regs.push(v);
        }

        // CALL or CALL_VOID strictly by the callee's resolved return
        // type, never by the call's syntactic position.
        if self.sema.types.identical(ret, self.sema.types.void()) {
            self.b.call_void(fref, arg_regs);
            None
        } else {
            let width = width_of(self.sema, ret);
            Some(self.b.call(fref, arg_regs, width))
        }
    }

    fn intrinsic(&mut self, e: ExprId, builtin: Builtin, args: &[ExprId]) -> Option<Vreg> {
        match builtin {
            Builtin::Peek | Builtin::VolatileRead | Builtin::Peekw => {
                let width = if builtin == Builtin::Peekw {
                    Width::Word
                } else {
                    Width::Byte
                };
                let addr = *args.first()?;
                match self.const_of(addr) {
                    Some(a) => Some(self.b.load(MemAddr::Abs(a), width, true)),
                    None => {
                        let ptr = self.expr(addr)?;
                        let ptr = self.coerce(ptr, Width::Word);
                        Some(self.b.peek(ptr, width))
                    }
                }
            }
            Builtin::Poke | Builtin::VolatileWrite | Builtin::Pokew => {
                let width = if builtin == Builtin::Pokew {
                    Width::Word
                } else {
                    Width::Byte
                };
                let addr = *args.first()?;
                let value = *args.get(1)?;
                let v = self.expr(value)?;
                let v = self.coerce(v, width);
                match self.const_of(addr) {
                    Some(a) => self.b.store(MemAddr::Abs(a), v, width, true),
                    None => {
                        let ptr = self.expr(addr)?;
                        let ptr = self.coerce(ptr, Width::Word);
                        self.b.poke(ptr, v, width);
                    }
                }
                None
            }
            Builtin::Lo | Builtin::Hi => {
                let v = self.expr(*args.first()?)?;
                let v = self.coerce(v, Width::Word);
                Some(if builtin == Builtin::Lo {
                    self.b.lo(v)
                } else {
                    self.b.hi(v)
                })
            }
            Builtin::Sizeof | Builtin::Length => {
                // Evaluated at compile time; the checker guaranteed it.
                let value = self.const_of(e).unwrap_or(0);
                Some(self.b.iconst(value, Width::Word))
            }
            Builtin::Sei => self.cpu(CpuOp::Sei),
            Builtin::Cli => self.cpu(CpuOp::Cli),
            Builtin::Nop => self.cpu(CpuOp::Nop),
            Builtin::Brk => self.cpu(CpuOp::Brk),
            Builtin::Pha => self.cpu(CpuOp::Pha),
            Builtin::Pla => self.cpu(CpuOp::Pla),
            Builtin::Php => self.cpu(CpuOp::Php),
            Builtin::Plp => self.cpu(CpuOp::Plp),
            Builtin::Barrier => {
                self.b.ins(Inst::Barrier);
                None
            }
        }
    }

    fn cpu(&mut self, op: CpuOp) -> Option<Vreg> {
        self.b.cpu(op);
        None
    }

    /// Resolve `base[index]` into an access strategy.
    fn indexed_access(&mut self, base: ExprId, index: ExprId) -> Option<IndexedAccess> {
        let sym = self.resolved_sym(base)?;
        let addr = self.sym_addr(sym)?;
        let volatile = self.is_volatile_sym(sym);
        let base_ty = self.msema.expr_ty(base)?;
        let (elem_size, total) = match self.sema.types.get(self.sema.types.normalize(base_ty)) {
            Type::Array { elem, .. } => {
                (self.sema.types.size_of(*elem), self.sema.types.size_of(base_ty))
            }
            _ => (1, 256),
        };

        // Small arrays use the indexed addressing modes with a byte
        // offset; anything larger goes through a pointer.
        if total <= 256 {
            let idx = self.expr(index)?;
            let idx = self.coerce(idx, Width::Byte);
            let offset = if elem_size == 2 {
                let one = self.b.iconst(1, Width::Byte);
                self.b.binary(AluOp::Shl, Width::Byte, idx, one)
            } else {
                idx
            };
            Some(IndexedAccess::Direct {
                base: addr,
                offset,
                volatile,
            })
        } else {
            let base_ptr = self.b.addr_of(addr);
            let idx = self.expr(index)?;
            let idx = self.coerce(idx, Width::Word);
            let scaled = if elem_size == 2 {
                let one = self.b.iconst(1, Width::Word);
                self.b.binary(AluOp::Shl, Width::Word, idx, one)
            } else {
                idx
            };
            let ptr = self.b.binary(AluOp::Add, Width::Word, base_ptr, scaled);
            Some(IndexedAccess::Pointer(ptr))
        }
    }
}

enum IndexedAccess {
    /// Indexed addressing with a byte offset register.
    Direct {
        base: MemAddr,
        offset: Vreg,
        volatile: bool,
    },
    /// A computed word pointer, accessed indirectly.
    Pointer(Vreg),
}

/// `addr` shifted by a constant byte offset.
fn offset_addr(addr: &MemAddr, offset: u16) -> MemAddr {
    match addr {
        MemAddr::Global(id, off) => MemAddr::Global(*id, off + offset),
        MemAddr::Abs(a) => MemAddr::Abs(a + offset),
        MemAddr::Func(f) => MemAddr::Func(*f),
    }
}

fn alu_of(op: BinOp) -> Option<AluOp> {
    Some(match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::Mul => AluOp::Mul,
        BinOp::Div => AluOp::Div,
        BinOp::Rem => AluOp::Rem,
        BinOp::BitAnd => AluOp::And,
        BinOp::BitOr => AluOp::Or,
        BinOp::BitXor => AluOp::Xor,
        BinOp::Shl => AluOp::Shl,
        BinOp::Shr => AluOp::Shr,
        _ => return None,
    })
}

trait MaxWidth {
    fn max_width(self, other: Width) -> Width;
}

impl MaxWidth for Width {
    fn max_width(self, other: Width) -> Width {
        if self == Width::Word || other == Width::Word {
            Width::Word
        } else {
            Width::Byte
        }
    }
}
