//! Abstract syntax tree for Blend65 modules.
//!
//! Nodes are tagged enums in three groups: declarations, statements and
//! expressions. Statements and expressions live in per-module arenas and
//! are referenced by `StmtId`/`ExprId`; later passes attach analysis
//! metadata to those ids in secondary maps instead of mutating the tree.
//! Every node carries the span from its first to its last consumed token.

use crate::intern::{Interner, Name};
use crate::sourcemap::{SourceId, Span};
use crate::token::{StorageMarker, WidthHint};
use blend65_entity::{entity_impl, PrimaryMap};

/// An opaque reference to an expression in a module's arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);
entity_impl!(ExprId, "expr");

/// An opaque reference to a statement in a module's arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(u32);
entity_impl!(StmtId, "stmt");

/// A sequence of statements executed in order.
pub type Block = Vec<StmtId>;

/// One parsed module: the tree plus the arenas its ids point into.
pub struct Module {
    /// The declared (or synthesized) module name.
    pub name: Name,
    /// Span of the `module` declaration, or of the first token when the
    /// module was synthesized.
    pub name_span: Span,
    /// True when no `module` declaration was present and the name
    /// `global` was synthesized.
    pub implicit: bool,
    /// The file this module was parsed from.
    pub file: SourceId,
    /// Top-level items in declaration order.
    pub items: Vec<Item>,
    /// Arena of all expressions in the module.
    pub exprs: PrimaryMap<ExprId, Expr>,
    /// Arena of all statements in the module.
    pub stmts: PrimaryMap<StmtId, Stmt>,
}

impl Module {
    /// Shorthand for the expression node behind `id`.
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id]
    }

    /// Shorthand for the statement node behind `id`.
    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id]
    }

    /// All function items, in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &FuncDecl> {
        self.items.iter().filter_map(|item| match item {
            Item::Func(f) => Some(f),
            _ => None,
        })
    }
}

/// A top-level declaration.
pub enum Item {
    /// `import a, b from M;`
    Import(ImportDecl),
    /// Module-level `let`/`const`, including `@address` constants.
    Var(VarDecl),
    /// A function declaration or stub.
    Func(FuncDecl),
    /// `type Name = target;`
    TypeAlias(TypeAliasDecl),
    /// `enum Name { ... }`
    Enum(EnumDecl),
    /// One of the four `@map` forms.
    Map(MapDecl),
}

/// `import NAME, ... from MODULE;`
pub struct ImportDecl {
    /// Imported symbol names with their spans.
    pub names: Vec<(Name, Span)>,
    /// The exporting module.
    pub module: Name,
    /// Span of the module name.
    pub module_span: Span,
    /// Span of the whole declaration.
    pub span: Span,
}

/// Whether a variable binding is mutable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mutability {
    /// `let`
    Let,
    /// `const` — requires an initializer.
    Const,
}

/// A `let`/`const` declaration, at module scope or as a statement.
pub struct VarDecl {
    /// Binding kind.
    pub mutability: Mutability,
    /// Storage-class marker, if any (`@zp x`, `@ram`, `@data`, `@address`).
    pub storage: Option<StorageMarker>,
    /// The declared name.
    pub name: Name,
    /// Span of the name.
    pub name_span: Span,
    /// The declared type.
    pub ty: TypeExpr,
    /// Initializer, mandatory for `const`.
    pub init: Option<ExprId>,
    /// True when declared with `export`.
    pub exported: bool,
    /// Span of the whole declaration.
    pub span: Span,
}

/// A function parameter.
pub struct Param {
    /// Parameter name.
    pub name: Name,
    /// Span of the name.
    pub span: Span,
    /// Declared type.
    pub ty: TypeExpr,
}

/// A function declaration.
///
/// A stub (`function f(): void;`) has no body and may be redeclared once
/// with one.
pub struct FuncDecl {
    /// Function name.
    pub name: Name,
    /// Span of the name.
    pub name_span: Span,
    /// True when declared with `export`.
    pub exported: bool,
    /// True for `callback function` — its address may be taken.
    pub callback: bool,
    /// Parameters in order.
    pub params: Vec<Param>,
    /// Declared return type.
    pub ret: TypeExpr,
    /// Body statements, or `None` for a stub.
    pub body: Option<Block>,
    /// Span of the whole declaration.
    pub span: Span,
}

/// `type Name = target;`
pub struct TypeAliasDecl {
    /// Alias name.
    pub name: Name,
    /// Span of the name.
    pub name_span: Span,
    /// Aliased type.
    pub target: TypeExpr,
    /// True when declared with `export`.
    pub exported: bool,
    /// Span of the whole declaration.
    pub span: Span,
}

/// One member of an `enum` declaration.
pub struct EnumMember {
    /// Member name.
    pub name: Name,
    /// Span of the name.
    pub span: Span,
    /// Explicit value, if given. Members without one count up from the
    /// previous member.
    pub value: Option<ExprId>,
}

/// `enum Name { A, B = 2, ... }` — underlying type is always `byte`.
pub struct EnumDecl {
    /// Enum name.
    pub name: Name,
    /// Span of the name.
    pub name_span: Span,
    /// Members in declaration order.
    pub members: Vec<EnumMember>,
    /// True when declared with `export`.
    pub exported: bool,
    /// Span of the whole declaration.
    pub span: Span,
}

/// Field address inside a struct `@map`.
pub enum MapFieldAddr {
    /// Sequential form: laid out after the previous field.
    Auto,
    /// `at ADDR`
    At(ExprId),
    /// `from ADDR to ADDR`
    Range(ExprId, ExprId),
}

/// One field of a struct `@map`.
pub struct MapField {
    /// Field name.
    pub name: Name,
    /// Span of the name.
    pub span: Span,
    /// Field type; `None` for a pure range field.
    pub ty: Option<TypeExpr>,
    /// Where the field lives.
    pub addr: MapFieldAddr,
}

/// The four syntactic forms of `@map`.
pub enum MapForm {
    /// `@map name at ADDR: type;`
    Simple {
        /// The fixed address.
        addr: ExprId,
        /// The mapped type.
        ty: TypeExpr,
    },
    /// `@map name from ADDR to ADDR;`
    Range {
        /// First byte of the range.
        start: ExprId,
        /// Last byte of the range, inclusive.
        end: ExprId,
    },
    /// `@map name at ADDR type ... end @map` — fields laid out
    /// sequentially from ADDR using their type sizes.
    Struct {
        /// Base address.
        addr: ExprId,
        /// Fields in declaration order.
        fields: Vec<MapField>,
        /// True for the `layout` form, where every field carries an
        /// explicit address.
        explicit: bool,
    },
}

/// A `@map` declaration binding a symbol to fixed memory.
pub struct MapDecl {
    /// Mapped name.
    pub name: Name,
    /// Span of the name.
    pub name_span: Span,
    /// True when declared with `export`.
    pub exported: bool,
    /// Which of the four forms was used.
    pub form: MapForm,
    /// Span of the whole declaration.
    pub span: Span,
}

/// A type as written in source. Resolution to an interned semantic type
/// happens in the type checker.
pub struct TypeExpr {
    /// What was written.
    pub kind: TypeExprKind,
    /// Where it was written.
    pub span: Span,
}

/// The syntactic type forms.
pub enum TypeExprKind {
    /// `byte`
    Byte,
    /// `word`
    Word,
    /// `void`
    Void,
    /// `bool`
    Bool,
    /// `string`
    String,
    /// A named type: alias or enum.
    Named(Name),
    /// `elem[N]`
    Array {
        /// Element type.
        elem: Box<TypeExpr>,
        /// Compile-time size expression.
        size: ExprId,
    },
    /// `callback(params): ret` — the type of a function whose address can
    /// be taken.
    Callback {
        /// Parameter types in order.
        params: Vec<TypeExpr>,
        /// Return type.
        ret: Box<TypeExpr>,
    },
}

/// A statement node.
pub struct Stmt {
    /// What kind of statement.
    pub kind: StmtKind,
    /// Source region, first to last token.
    pub span: Span,
}

/// The statement forms.
pub enum StmtKind {
    /// An expression evaluated for its effects.
    Expr(ExprId),
    /// `target op= value;`
    Assign {
        /// The lvalue being stored to.
        target: ExprId,
        /// `None` for plain `=`, the operation for compound assignment.
        op: Option<BinOp>,
        /// The value.
        value: ExprId,
    },
    /// A local `let`/`const`.
    Var(VarDecl),
    /// `if (c) { .. } else { .. }`
    If {
        /// Condition, must be `bool`.
        cond: ExprId,
        /// Then branch.
        then_block: Block,
        /// Else branch if present.
        else_block: Option<Block>,
    },
    /// `while (c) { .. }`
    While {
        /// Loop condition.
        cond: ExprId,
        /// Loop body.
        body: Block,
    },
    /// `do { .. } while (c);` — the body runs before the first test.
    DoWhile {
        /// Loop body.
        body: Block,
        /// Back-edge condition.
        cond: ExprId,
    },
    /// `for i = a to|downto b [step s] { .. }`
    For {
        /// The pre-declared loop variable.
        var: Name,
        /// Span of the variable reference.
        var_span: Span,
        /// Initial value.
        from: ExprId,
        /// Final value, inclusive.
        to: ExprId,
        /// True for `downto`.
        downto: bool,
        /// Step expression; defaults to 1.
        step: Option<ExprId>,
        /// Loop body.
        body: Block,
    },
    /// `switch (e) { case k: .. default: .. }` — no fallthrough between
    /// arms.
    Switch {
        /// The scrutinee.
        value: ExprId,
        /// Case arms in order.
        cases: Vec<SwitchCase>,
        /// Statements run when no case matches.
        default: Option<Block>,
    },
    /// `return;` or `return e;`
    Return(Option<ExprId>),
    /// `break;`
    Break,
    /// `continue;`
    Continue,
    /// A braced statement list introducing a scope.
    Block(Block),
    /// `asm("...", ...);` — raw instruction lines passed through.
    InlineAsm(Vec<String>),
}

/// One arm of a `switch`.
pub struct SwitchCase {
    /// The compile-time case value.
    pub value: ExprId,
    /// The arm body.
    pub body: Block,
}

/// An expression node.
pub struct Expr {
    /// What kind of expression.
    pub kind: ExprKind,
    /// Source region, first to last token.
    pub span: Span,
}

/// Unary operators.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
    /// `~x`
    BitNot,
}

impl UnOp {
    /// Source spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
            Self::BitNot => "~",
        }
    }
}

/// Binary operators.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum BinOp {
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&`
    BitAnd,
    /// `^`
    BitXor,
    /// `|`
    BitOr,
    /// `&&` — short-circuit.
    And,
    /// `||` — short-circuit.
    Or,
}

impl BinOp {
    /// Source spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    /// Binding power for the Pratt parser and the printer. Higher binds
    /// tighter. Ternary sits below `Or`, assignment below ternary.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div | Self::Rem => 12,
            Self::Add | Self::Sub => 11,
            Self::Shl | Self::Shr => 10,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 9,
            Self::Eq | Self::Ne => 8,
            Self::BitAnd => 7,
            Self::BitXor => 6,
            Self::BitOr => 5,
            Self::And => 4,
            Self::Or => 3,
        }
    }

    /// True for the comparison operators, whose result is `bool`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne
        )
    }

    /// True for `&&`/`||`.
    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

/// Explicit cast targets.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CastKind {
    /// `byte(x)` — narrowing, warns when it can lose data.
    Byte,
    /// `word(x)` — widening.
    Word,
}

/// Literal values.
#[derive(Clone, PartialEq, Debug)]
pub enum Literal {
    /// An integer literal with its width hint.
    Int {
        /// The value.
        value: u32,
        /// The smallest primitive it fits.
        width: WidthHint,
    },
    /// A string literal. Length is known at compile time.
    Str(String),
    /// `true` / `false`.
    Bool(bool),
}

/// The expression forms.
pub enum ExprKind {
    /// A literal value.
    Literal(Literal),
    /// A name reference.
    Ident(Name),
    /// `callee(args...)` — callee is an identifier (direct calls only).
    Call {
        /// The called expression.
        callee: ExprId,
        /// Arguments in order.
        args: Vec<ExprId>,
    },
    /// `base[index]`
    Index {
        /// The array.
        base: ExprId,
        /// The index.
        index: ExprId,
    },
    /// `base.field` — enum member or `@map` struct field.
    Member {
        /// The enum or map symbol.
        base: ExprId,
        /// The accessed member.
        field: Name,
        /// Span of the member name.
        field_span: Span,
    },
    /// A unary operation.
    Unary {
        /// The operator.
        op: UnOp,
        /// The operand.
        operand: ExprId,
    },
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinOp,
        /// Left operand.
        lhs: ExprId,
        /// Right operand.
        rhs: ExprId,
    },
    /// `c ? a : b` — both arms must have identical types.
    Ternary {
        /// The condition.
        cond: ExprId,
        /// Value when true.
        then_expr: ExprId,
        /// Value when false.
        else_expr: ExprId,
    },
    /// `[a, b, c]`
    ArrayLit(Vec<ExprId>),
    /// `@name` — the address of a variable symbol.
    AddressOf(Name),
    /// `byte(x)` / `word(x)`.
    Cast {
        /// Target width.
        to: CastKind,
        /// The value being cast.
        operand: ExprId,
    },
}

/// Visit `root` and every expression below it, preorder.
pub fn walk_expr(module: &Module, root: ExprId, visit: &mut impl FnMut(ExprId)) {
    visit(root);
    match &module.expr(root).kind {
        ExprKind::Literal(_) | ExprKind::Ident(_) | ExprKind::AddressOf(_) => {}
        ExprKind::Call { callee, args } => {
            walk_expr(module, *callee, visit);
            for &arg in args {
                walk_expr(module, arg, visit);
            }
        }
        ExprKind::Index { base, index } => {
            walk_expr(module, *base, visit);
            walk_expr(module, *index, visit);
        }
        ExprKind::Member { base, .. } => walk_expr(module, *base, visit),
        ExprKind::Unary { operand, .. } => walk_expr(module, *operand, visit),
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_expr(module, *lhs, visit);
            walk_expr(module, *rhs, visit);
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            walk_expr(module, *cond, visit);
            walk_expr(module, *then_expr, visit);
            walk_expr(module, *else_expr, visit);
        }
        ExprKind::ArrayLit(elems) => {
            for &e in elems {
                walk_expr(module, e, visit);
            }
        }
        ExprKind::Cast { operand, .. } => walk_expr(module, *operand, visit),
    }
}

/// The expressions a statement evaluates directly, not counting nested
/// statements (block bodies are walked through the CFG instead).
pub fn stmt_exprs(stmt: &Stmt) -> Vec<ExprId> {
    match &stmt.kind {
        StmtKind::Expr(e) => vec![*e],
        StmtKind::Assign { target, value, .. } => vec![*target, *value],
        StmtKind::Var(decl) => decl.init.into_iter().collect(),
        StmtKind::If { cond, .. } => vec![*cond],
        StmtKind::While { cond, .. } => vec![*cond],
        StmtKind::DoWhile { cond, .. } => vec![*cond],
        StmtKind::For { from, to, step, .. } => {
            let mut v = vec![*from, *to];
            v.extend(step.iter().copied());
            v
        }
        StmtKind::Switch { value, .. } => vec![*value],
        StmtKind::Return(value) => value.iter().copied().collect(),
        StmtKind::Break | StmtKind::Continue | StmtKind::Block(_) | StmtKind::InlineAsm(_) => {
            Vec::new()
        }
    }
}

/// Print an expression with the fewest parentheses that preserve the parse.
///
/// Reparsing the output yields an isomorphic tree; tests rely on this.
pub fn print_expr(module: &Module, interner: &Interner, id: ExprId) -> String {
    print_prec(module, interner, id, 0)
}

fn print_prec(module: &Module, interner: &Interner, id: ExprId, min_prec: u8) -> String {
    match &module.expr(id).kind {
        ExprKind::Literal(Literal::Int { value, .. }) => format!("{value}"),
        ExprKind::Literal(Literal::Str(s)) => format!("{s:?}"),
        ExprKind::Literal(Literal::Bool(b)) => format!("{b}"),
        ExprKind::Ident(name) => interner.resolve(*name).to_string(),
        ExprKind::Call { callee, args } => {
            let args: Vec<String> = args
                .iter()
                .map(|&a| print_prec(module, interner, a, 0))
                .collect();
            format!(
                "{}({})",
                print_prec(module, interner, *callee, 14),
                args.join(", ")
            )
        }
        ExprKind::Index { base, index } => format!(
            "{}[{}]",
            print_prec(module, interner, *base, 14),
            print_prec(module, interner, *index, 0)
        ),
        ExprKind::Member { base, field, .. } => format!(
            "{}.{}",
            print_prec(module, interner, *base, 14),
            interner.resolve(*field)
        ),
        ExprKind::Unary { op, operand } => {
            let text = format!("{}{}", op.as_str(), print_prec(module, interner, *operand, 13));
            parenthesize(text, 13, min_prec)
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let prec = op.precedence();
            // Left-associative: the right operand needs one level more.
            let text = format!(
                "{} {} {}",
                print_prec(module, interner, *lhs, prec),
                op.as_str(),
                print_prec(module, interner, *rhs, prec + 1)
            );
            parenthesize(text, prec, min_prec)
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            // Right-associative at precedence 2.
            let text = format!(
                "{} ? {} : {}",
                print_prec(module, interner, *cond, 3),
                print_prec(module, interner, *then_expr, 0),
                print_prec(module, interner, *else_expr, 2)
            );
            parenthesize(text, 2, min_prec)
        }
        ExprKind::ArrayLit(elems) => {
            let elems: Vec<String> = elems
                .iter()
                .map(|&e| print_prec(module, interner, e, 0))
                .collect();
            format!("[{}]", elems.join(", "))
        }
        ExprKind::AddressOf(name) => {
            parenthesize(format!("@{}", interner.resolve(*name)), 13, min_prec)
        }
        ExprKind::Cast { to, operand } => format!(
            "{}({})",
            match to {
                CastKind::Byte => "byte",
                CastKind::Word => "word",
            },
            print_prec(module, interner, *operand, 0)
        ),
    }
}

fn parenthesize(text: String, prec: u8, min_prec: u8) -> String {
    if prec < min_prec {
        format!("({text})")
    } else {
        text
    }
}
