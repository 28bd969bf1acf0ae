//! The Blend65 parser.
//!
//! Recursive descent for declarations and statements, a Pratt parser for
//! expressions. The parser owns the one-token lookahead over the pull
//! lexer and recovers from errors in panic mode: on an unexpected token it
//! drops input until a statement terminator (`;`), a block close (`}`) or
//! a safe keyword, then continues, so one run reports many errors.
//!
//! Top-level ordering is strict: the first significant token must be
//! `module NAME;`, otherwise an implicit module named `global` is
//! synthesized. Only declaration forms may follow.

use crate::ast::{
    BinOp, Block, CastKind, EnumDecl, EnumMember, Expr, ExprId, ExprKind, FuncDecl, ImportDecl,
    Item, Literal, MapDecl, MapField, MapFieldAddr, MapForm, Module, Mutability, Param, Stmt,
    StmtId, StmtKind, SwitchCase, TypeAliasDecl, TypeExpr, TypeExprKind, UnOp, VarDecl,
};
use crate::diagnostics::{DiagCode, Diagnostic, DiagnosticSink};
use crate::intern::{Interner, Name};
use crate::lexer::Lexer;
use crate::sourcemap::{SourceId, Span};
use crate::token::{Keyword, StorageMarker, Token, TokenKind};
use blend65_entity::PrimaryMap;

/// Result of one parse production. The error carries no payload; the
/// diagnostic has already been reported and the caller synchronizes.
type ParseResult<T> = Result<T, ()>;

/// Parse one source file into a module.
///
/// `src` must be the exact text registered for `file` in the source map.
/// All problems are reported to `sink`; the returned module contains
/// whatever could be recovered.
pub fn parse_module<'a>(
    file: SourceId,
    src: &'a str,
    interner: &mut Interner,
    sink: &mut DiagnosticSink,
) -> Module {
    Parser::new(file, src, interner, sink).run()
}

struct Parser<'src, 'ctx> {
    lexer: Lexer<'src>,
    interner: &'ctx mut Interner,
    sink: &'ctx mut DiagnosticSink,
    lookahead: Token<'src>,
    prev_span: Span,
    file: SourceId,
    exprs: PrimaryMap<ExprId, Expr>,
    stmts: PrimaryMap<StmtId, Stmt>,
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    fn new(
        file: SourceId,
        src: &'src str,
        interner: &'ctx mut Interner,
        sink: &'ctx mut DiagnosticSink,
    ) -> Self {
        let mut lexer = Lexer::new(file, src);
        let lookahead = lexer.next_token(sink);
        Self {
            lexer,
            interner,
            sink,
            lookahead,
            prev_span: Span::new(file, 0, 0),
            file,
            exprs: PrimaryMap::new(),
            stmts: PrimaryMap::new(),
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn peek(&self) -> &TokenKind<'src> {
        &self.lookahead.kind
    }

    fn peek_span(&self) -> Span {
        self.lookahead.span
    }

    fn advance(&mut self) -> Token<'src> {
        let next = self.lexer.next_token(self.sink);
        let tok = std::mem::replace(&mut self.lookahead, next);
        self.prev_span = tok.span;
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        self.eat(&TokenKind::Kw(kw))
    }

    /// True when the lookahead is the identifier `word` (a soft keyword).
    fn at_soft_kw(&self, word: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(s) if *s == word)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> ParseResult<Token<'src>> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            self.unexpected(what);
            Err(())
        }
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<(Name, Span)> {
        let text = match self.peek() {
            TokenKind::Ident(text) => Some(*text),
            _ => None,
        };
        match text {
            Some(text) => {
                let name = self.interner.intern(text);
                let span = self.peek_span();
                self.advance();
                Ok((name, span))
            }
            None => {
                self.unexpected(what);
                Err(())
            }
        }
    }

    fn unexpected(&mut self, what: &str) {
        let found = self.peek().describe();
        let span = self.peek_span();
        self.error(DiagCode::SyntaxError, span, format!("expected {what}, found {found}"));
    }

    fn error(&mut self, code: DiagCode, span: Span, msg: String) {
        self.sink.report(Diagnostic::new(code, span, msg));
    }

    fn add_expr(&mut self, kind: ExprKind, span: Span) -> ExprId {
        self.exprs.push(Expr { kind, span })
    }

    fn add_stmt(&mut self, kind: StmtKind, span: Span) -> StmtId {
        self.stmts.push(Stmt { kind, span })
    }

    /// Panic-mode recovery inside a function body: drop tokens until a
    /// statement terminator, a block close, or a token that can start a
    /// statement.
    fn synchronize_stmt(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Kw(
                    Keyword::If
                    | Keyword::While
                    | Keyword::Do
                    | Keyword::For
                    | Keyword::Switch
                    | Keyword::Return
                    | Keyword::Break
                    | Keyword::Continue
                    | Keyword::Let
                    | Keyword::Const,
                ) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Recovery at module scope: drop tokens until something that can
    /// start a top-level declaration.
    fn synchronize_top_level(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Kw(
                    Keyword::Module
                    | Keyword::Import
                    | Keyword::Export
                    | Keyword::Function
                    | Keyword::Callback
                    | Keyword::Let
                    | Keyword::Const
                    | Keyword::Type
                    | Keyword::Enum,
                )
                | TokenKind::Storage(_) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- module structure -----------------------------------------------

    fn run(mut self) -> Module {
        let (name, name_span, implicit) = self.parse_module_header();
        let mut items = Vec::new();

        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Kw(Keyword::Module) => {
                    let span = self.peek_span();
                    self.error(
                        DiagCode::DuplicateModule,
                        span,
                        "a file declares its module exactly once".to_string(),
                    );
                    self.advance();
                    self.synchronize_top_level();
                }
                _ => match self.parse_top_level() {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) => {}
                    Err(()) => self.synchronize_top_level(),
                },
            }
        }

        self.check_main_exports(&mut items);
        Module {
            name,
            name_span,
            implicit,
            file: self.file,
            items,
            exprs: self.exprs,
            stmts: self.stmts,
        }
    }

    fn parse_module_header(&mut self) -> (Name, Span, bool) {
        if self.check(&TokenKind::Kw(Keyword::Module)) {
            let kw_span = self.peek_span();
            self.advance();
            match self.expect_ident("a module name") {
                Ok((name, span)) => {
                    if self.expect(&TokenKind::Semicolon, "`;`").is_err() {
                        self.synchronize_top_level();
                    }
                    (name, span, false)
                }
                Err(()) => {
                    self.synchronize_top_level();
                    (self.interner.intern("global"), kw_span, true)
                }
            }
        } else {
            let span = self.peek_span();
            (self.interner.intern("global"), span, true)
        }
    }

    /// Auto-export `main`, and reject a second exported `main`.
    fn check_main_exports(&mut self, items: &mut [Item]) {
        let main = self.interner.intern("main");
        let mut first_exported: Option<Span> = None;
        for item in items {
            let Item::Func(f) = item else { continue };
            if f.name != main {
                continue;
            }
            if !f.exported {
                self.sink.report(Diagnostic::new(
                    DiagCode::ImplicitMainExport,
                    f.name_span,
                    "`main` is exported implicitly".to_string(),
                ));
                f.exported = true;
            }
            match first_exported {
                None => first_exported = Some(f.name_span),
                Some(first) => {
                    self.sink.report(
                        Diagnostic::new(
                            DiagCode::DuplicateExportedMain,
                            f.name_span,
                            "a second exported `main`".to_string(),
                        )
                        .with_related(first, "first `main` is here".to_string()),
                    );
                }
            }
        }
    }

    fn parse_top_level(&mut self) -> ParseResult<Option<Item>> {
        match self.peek().clone() {
            TokenKind::Kw(Keyword::Import) => Ok(Some(Item::Import(self.parse_import()?))),
            TokenKind::Kw(Keyword::Export) => {
                self.advance();
                self.parse_exportable(true).map(Some)
            }
            _ => self.parse_exportable(false).map(Some),
        }
    }

    fn parse_exportable(&mut self, exported: bool) -> ParseResult<Item> {
        match self.peek().clone() {
            TokenKind::Kw(Keyword::Function | Keyword::Callback) => {
                Ok(Item::Func(self.parse_function(exported)?))
            }
            TokenKind::Kw(Keyword::Let | Keyword::Const) => {
                Ok(Item::Var(self.parse_var_decl(None, exported)?))
            }
            TokenKind::Storage(
                marker @ (StorageMarker::Zp | StorageMarker::Ram | StorageMarker::Data),
            ) => {
                self.advance();
                Ok(Item::Var(self.parse_var_decl(Some(marker), exported)?))
            }
            TokenKind::Storage(StorageMarker::Map) => Ok(Item::Map(self.parse_map(exported)?)),
            TokenKind::Storage(StorageMarker::Address) => {
                Ok(Item::Var(self.parse_address_decl(exported)?))
            }
            TokenKind::Kw(Keyword::Type) => Ok(Item::TypeAlias(self.parse_type_alias(exported)?)),
            TokenKind::Kw(Keyword::Enum) => Ok(Item::Enum(self.parse_enum(exported)?)),
            _ => {
                let found = self.peek().describe();
                let span = self.peek_span();
                self.error(
                    DiagCode::UnexpectedTopLevel,
                    span,
                    format!("expected a declaration at module scope, found {found}"),
                );
                Err(())
            }
        }
    }

    fn parse_import(&mut self) -> ParseResult<ImportDecl> {
        let start = self.peek_span();
        self.advance(); // `import`
        let mut names = vec![self.expect_ident("an imported name")?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_ident("an imported name")?);
        }
        self.expect(&TokenKind::Kw(Keyword::From), "`from`")?;
        let (module, module_span) = self.expect_ident("a module name")?;
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(ImportDecl {
            names,
            module,
            module_span,
            span: start.merge(self.prev_span),
        })
    }

    fn parse_function(&mut self, exported: bool) -> ParseResult<FuncDecl> {
        let start = self.peek_span();
        let callback = self.eat_kw(Keyword::Callback);
        self.expect(&TokenKind::Kw(Keyword::Function), "`function`")?;
        let (name, name_span) = self.expect_ident("a function name")?;
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let (pname, pspan) = self.expect_ident("a parameter name")?;
                self.expect(&TokenKind::Colon, "`:`")?;
                let ty = self.parse_type()?;
                params.push(Param {
                    name: pname,
                    span: pspan,
                    ty,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::Colon, "`:` before the return type")?;
        let ret = self.parse_type()?;

        let body = if self.eat(&TokenKind::Semicolon) {
            None // forward declaration stub
        } else {
            Some(self.parse_block()?)
        };
        Ok(FuncDecl {
            name,
            name_span,
            exported,
            callback,
            params,
            ret,
            body,
            span: start.merge(self.prev_span),
        })
    }

    fn parse_var_decl(
        &mut self,
        storage: Option<StorageMarker>,
        exported: bool,
    ) -> ParseResult<VarDecl> {
        let start = self.peek_span();
        let mutability = if self.eat_kw(Keyword::Const) {
            Mutability::Const
        } else {
            self.expect(&TokenKind::Kw(Keyword::Let), "`let` or `const`")?;
            Mutability::Let
        };
        let (name, name_span) = self.expect_ident("a variable name")?;
        self.expect(&TokenKind::Colon, "`:`")?;
        let ty = self.parse_type()?;
        let init = if self.eat(&TokenKind::Eq) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        if mutability == Mutability::Const && init.is_none() {
            self.error(
                DiagCode::MissingConstInitializer,
                name_span,
                format!("`{}` is const and needs an initializer", self.interner.resolve(name)),
            );
        }
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(VarDecl {
            mutability,
            storage,
            name,
            name_span,
            ty,
            init,
            exported,
            span: start.merge(self.prev_span),
        })
    }

    /// `@address NAME at ADDR;` — a named constant address.
    fn parse_address_decl(&mut self, exported: bool) -> ParseResult<VarDecl> {
        let start = self.peek_span();
        self.advance(); // `@address`
        let (name, name_span) = self.expect_ident("a name")?;
        if !self.at_soft_kw("at") {
            self.unexpected("`at`");
            return Err(());
        }
        self.advance();
        let addr = self.parse_expr()?;
        self.expect(&TokenKind::Semicolon, "`;`")?;
        let span = start.merge(self.prev_span);
        Ok(VarDecl {
            mutability: Mutability::Const,
            storage: Some(StorageMarker::Address),
            name,
            name_span,
            ty: TypeExpr {
                kind: TypeExprKind::Word,
                span: name_span,
            },
            init: Some(addr),
            exported,
            span,
        })
    }

    fn parse_type_alias(&mut self, exported: bool) -> ParseResult<TypeAliasDecl> {
        let start = self.peek_span();
        self.advance(); // `type`
        let (name, name_span) = self.expect_ident("a type name")?;
        self.expect(&TokenKind::Eq, "`=`")?;
        let target = self.parse_type()?;
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(TypeAliasDecl {
            name,
            name_span,
            target,
            exported,
            span: start.merge(self.prev_span),
        })
    }

    fn parse_enum(&mut self, exported: bool) -> ParseResult<EnumDecl> {
        let start = self.peek_span();
        self.advance(); // `enum`
        let (name, name_span) = self.expect_ident("an enum name")?;
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut members = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            let (mname, mspan) = self.expect_ident("an enum member")?;
            let value = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            members.push(EnumMember {
                name: mname,
                span: mspan,
                value,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        self.eat(&TokenKind::Semicolon);
        Ok(EnumDecl {
            name,
            name_span,
            members,
            exported,
            span: start.merge(self.prev_span),
        })
    }

    // ---- @map forms ------------------------------------------------------

    fn parse_map(&mut self, exported: bool) -> ParseResult<MapDecl> {
        let start = self.peek_span();
        self.advance(); // `@map`
        let (name, name_span) = self.expect_ident("a name")?;

        let form = if self.eat_kw(Keyword::From) {
            // `@map name from A to B;`
            let from = self.parse_expr()?;
            self.expect(&TokenKind::Kw(Keyword::To), "`to`")?;
            let to = self.parse_expr()?;
            self.expect(&TokenKind::Semicolon, "`;`")?;
            MapForm::Range { start: from, end: to }
        } else {
            if !self.at_soft_kw("at") {
                self.unexpected("`at` or `from`");
                return Err(());
            }
            self.advance();
            let addr = self.parse_expr()?;
            if self.eat(&TokenKind::Colon) {
                // `@map name at ADDR: type;`
                let ty = self.parse_type()?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                MapForm::Simple { addr, ty }
            } else if self.eat_kw(Keyword::Type) {
                let fields = self.parse_map_fields(false)?;
                MapForm::Struct {
                    addr,
                    fields,
                    explicit: false,
                }
            } else if self.at_soft_kw("layout") {
                self.advance();
                let fields = self.parse_map_fields(true)?;
                MapForm::Struct {
                    addr,
                    fields,
                    explicit: true,
                }
            } else {
                self.unexpected("`:`, `type` or `layout`");
                return Err(());
            }
        };

        Ok(MapDecl {
            name,
            name_span,
            exported,
            form,
            span: start.merge(self.prev_span),
        })
    }

    /// Parse fields up to `end @map`. In the explicit (`layout`) form each
    /// field carries its own address clause.
    fn parse_map_fields(&mut self, explicit: bool) -> ParseResult<Vec<MapField>> {
        let mut fields = Vec::new();
        loop {
            if self.eat_kw(Keyword::End) {
                self.expect(&TokenKind::Storage(StorageMarker::Map), "`@map`")?;
                return Ok(fields);
            }
            if self.check(&TokenKind::Eof) {
                self.unexpected("`end @map`");
                return Err(());
            }
            let (fname, fspan) = self.expect_ident("a field name")?;
            let field = if explicit {
                if self.at_soft_kw("at") {
                    self.advance();
                    let addr = self.parse_expr()?;
                    self.expect(&TokenKind::Colon, "`:`")?;
                    let ty = self.parse_type()?;
                    MapField {
                        name: fname,
                        span: fspan,
                        ty: Some(ty),
                        addr: MapFieldAddr::At(addr),
                    }
                } else if self.eat_kw(Keyword::From) {
                    let from = self.parse_expr()?;
                    self.expect(&TokenKind::Kw(Keyword::To), "`to`")?;
                    let to = self.parse_expr()?;
                    let ty = if self.eat(&TokenKind::Colon) {
                        Some(self.parse_type()?)
                    } else {
                        None
                    };
                    MapField {
                        name: fname,
                        span: fspan,
                        ty,
                        addr: MapFieldAddr::Range(from, to),
                    }
                } else {
                    self.unexpected("`at` or `from`");
                    return Err(());
                }
            } else {
                self.expect(&TokenKind::Colon, "`:`")?;
                let ty = self.parse_type()?;
                MapField {
                    name: fname,
                    span: fspan,
                    ty: Some(ty),
                    addr: MapFieldAddr::Auto,
                }
            };
            fields.push(field);
            self.expect(&TokenKind::Semicolon, "`;`")?;
        }
    }

    // ---- types -----------------------------------------------------------

    fn parse_type(&mut self) -> ParseResult<TypeExpr> {
        let start = self.peek_span();
        let mut base = match self.peek().clone() {
            TokenKind::Kw(Keyword::Byte) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Byte,
                    span: start,
                }
            }
            TokenKind::Kw(Keyword::Word) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Word,
                    span: start,
                }
            }
            TokenKind::Kw(Keyword::Void) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Void,
                    span: start,
                }
            }
            TokenKind::Kw(Keyword::Bool) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Bool,
                    span: start,
                }
            }
            TokenKind::Kw(Keyword::String) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::String,
                    span: start,
                }
            }
            TokenKind::Kw(Keyword::Callback) => {
                self.advance();
                self.expect(&TokenKind::LParen, "`(`")?;
                let mut params = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        params.push(self.parse_type()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                self.expect(&TokenKind::Colon, "`:`")?;
                let ret = self.parse_type()?;
                TypeExpr {
                    kind: TypeExprKind::Callback {
                        params,
                        ret: Box::new(ret),
                    },
                    span: start.merge(self.prev_span),
                }
            }
            TokenKind::Ident(text) => {
                let name = self.interner.intern(text);
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Named(name),
                    span: start,
                }
            }
            _ => {
                self.unexpected("a type");
                return Err(());
            }
        };

        // Array suffix: `byte[16]`, `word[N][2]` nests outward.
        while self.eat(&TokenKind::LBracket) {
            let size = self.parse_expr()?;
            self.expect(&TokenKind::RBracket, "`]`")?;
            let span = start.merge(self.prev_span);
            base = TypeExpr {
                kind: TypeExprKind::Array {
                    elem: Box::new(base),
                    size,
                },
                span,
            };
        }
        Ok(base)
    }

    // ---- statements ------------------------------------------------------

    fn parse_block(&mut self) -> ParseResult<Block> {
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(()) => self.synchronize_stmt(),
            }
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> ParseResult<StmtId> {
        let start = self.peek_span();
        match self.peek().clone() {
            TokenKind::Kw(Keyword::Let | Keyword::Const) => {
                let decl = self.parse_var_decl(None, false)?;
                let span = decl.span;
                Ok(self.add_stmt(StmtKind::Var(decl), span))
            }
            TokenKind::Storage(
                marker @ (StorageMarker::Zp | StorageMarker::Ram | StorageMarker::Data),
            ) => {
                self.advance();
                let decl = self.parse_var_decl(Some(marker), false)?;
                let span = start.merge(decl.span);
                Ok(self.add_stmt(StmtKind::Var(decl), span))
            }
            TokenKind::Kw(Keyword::If) => self.parse_if(start),
            TokenKind::Kw(Keyword::While) => {
                self.advance();
                self.expect(&TokenKind::LParen, "`(`")?;
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                let body = self.parse_block()?;
                let span = start.merge(self.prev_span);
                Ok(self.add_stmt(StmtKind::While { cond, body }, span))
            }
            TokenKind::Kw(Keyword::Do) => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(&TokenKind::Kw(Keyword::While), "`while`")?;
                self.expect(&TokenKind::LParen, "`(`")?;
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                // `do-while` is the one block statement that requires `;`.
                self.expect(&TokenKind::Semicolon, "`;`")?;
                let span = start.merge(self.prev_span);
                Ok(self.add_stmt(StmtKind::DoWhile { body, cond }, span))
            }
            TokenKind::Kw(Keyword::For) => self.parse_for(start),
            TokenKind::Kw(Keyword::Switch) => self.parse_switch(start),
            TokenKind::Kw(Keyword::Return) => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&TokenKind::Semicolon, "`;`")?;
                let span = start.merge(self.prev_span);
                Ok(self.add_stmt(StmtKind::Return(value), span))
            }
            TokenKind::Kw(Keyword::Break) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(self.add_stmt(StmtKind::Break, start.merge(self.prev_span)))
            }
            TokenKind::Kw(Keyword::Continue) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(self.add_stmt(StmtKind::Continue, start.merge(self.prev_span)))
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                let span = start.merge(self.prev_span);
                Ok(self.add_stmt(StmtKind::Block(block), span))
            }
            TokenKind::Ident("asm") => self.parse_inline_asm(start),
            _ => self.parse_expr_or_assign(start),
        }
    }

    fn parse_if(&mut self, start: Span) -> ParseResult<StmtId> {
        self.advance(); // `if`
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then_block = self.parse_block()?;
        let else_block = if self.eat_kw(Keyword::Else) {
            if self.check(&TokenKind::Kw(Keyword::If)) {
                let nested_start = self.peek_span();
                let nested = self.parse_if(nested_start)?;
                Some(vec![nested])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        let span = start.merge(self.prev_span);
        Ok(self.add_stmt(
            StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            span,
        ))
    }

    fn parse_for(&mut self, start: Span) -> ParseResult<StmtId> {
        self.advance(); // `for`
        let (var, var_span) = self.expect_ident("a loop variable")?;
        self.expect(&TokenKind::Eq, "`=`")?;
        let from = self.parse_expr()?;
        let downto = if self.eat_kw(Keyword::To) {
            false
        } else if self.eat_kw(Keyword::Downto) {
            true
        } else {
            self.unexpected("`to` or `downto`");
            return Err(());
        };
        let to = self.parse_expr()?;
        let step = if self.eat_kw(Keyword::Step) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span);
        Ok(self.add_stmt(
            StmtKind::For {
                var,
                var_span,
                from,
                to,
                downto,
                step,
                body,
            },
            span,
        ))
    }

    fn parse_switch(&mut self, start: Span) -> ParseResult<StmtId> {
        self.advance(); // `switch`
        self.expect(&TokenKind::LParen, "`(`")?;
        let value = self.parse_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut cases = Vec::new();
        let mut default = None;
        loop {
            if self.eat_kw(Keyword::Case) {
                let case_value = self.parse_expr()?;
                self.expect(&TokenKind::Colon, "`:`")?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase {
                    value: case_value,
                    body,
                });
            } else if self.eat_kw(Keyword::Default) {
                self.expect(&TokenKind::Colon, "`:`")?;
                let body = self.parse_case_body()?;
                if default.is_some() {
                    let span = self.prev_span;
                    self.error(
                        DiagCode::DuplicateDeclaration,
                        span,
                        "`default` appears more than once".to_string(),
                    );
                }
                default = Some(body);
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        let span = start.merge(self.prev_span);
        Ok(self.add_stmt(
            StmtKind::Switch {
                value,
                cases,
                default,
            },
            span,
        ))
    }

    /// Statements of one arm, up to the next `case`/`default`/`}`.
    fn parse_case_body(&mut self) -> ParseResult<Block> {
        let mut body = Vec::new();
        while !matches!(
            self.peek(),
            TokenKind::Kw(Keyword::Case | Keyword::Default) | TokenKind::RBrace | TokenKind::Eof
        ) {
            match self.parse_stmt() {
                Ok(stmt) => body.push(stmt),
                Err(()) => self.synchronize_stmt(),
            }
        }
        Ok(body)
    }

    fn parse_inline_asm(&mut self, start: Span) -> ParseResult<StmtId> {
        self.advance(); // `asm`
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut lines = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                match self.peek().clone() {
                    TokenKind::Str(line) => {
                        lines.push(line);
                        self.advance();
                    }
                    _ => {
                        self.unexpected("a string literal");
                        return Err(());
                    }
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::Semicolon, "`;`")?;
        let span = start.merge(self.prev_span);
        Ok(self.add_stmt(StmtKind::InlineAsm(lines), span))
    }

    fn parse_expr_or_assign(&mut self, start: Span) -> ParseResult<StmtId> {
        let target = self.parse_expr()?;
        let assign_op = match self.peek() {
            TokenKind::Eq => Some(None),
            TokenKind::PlusEq => Some(Some(BinOp::Add)),
            TokenKind::MinusEq => Some(Some(BinOp::Sub)),
            TokenKind::StarEq => Some(Some(BinOp::Mul)),
            TokenKind::SlashEq => Some(Some(BinOp::Div)),
            TokenKind::PercentEq => Some(Some(BinOp::Rem)),
            TokenKind::AmpEq => Some(Some(BinOp::BitAnd)),
            TokenKind::PipeEq => Some(Some(BinOp::BitOr)),
            TokenKind::CaretEq => Some(Some(BinOp::BitXor)),
            TokenKind::ShlEq => Some(Some(BinOp::Shl)),
            TokenKind::ShrEq => Some(Some(BinOp::Shr)),
            _ => None,
        };
        let kind = match assign_op {
            Some(op) => {
                self.advance();
                let value = self.parse_expr()?;
                StmtKind::Assign { target, op, value }
            }
            None => StmtKind::Expr(target),
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(self.add_stmt(kind, start.merge(self.prev_span)))
    }

    // ---- expressions -----------------------------------------------------

    fn parse_expr(&mut self) -> ParseResult<ExprId> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> ParseResult<ExprId> {
        let start = self.peek_span();
        let cond = self.parse_binary(0)?;
        if self.eat(&TokenKind::Question) {
            let then_expr = self.parse_expr()?;
            self.expect(&TokenKind::Colon, "`:`")?;
            // Right-associative.
            let else_expr = self.parse_ternary()?;
            let span = start.merge(self.prev_span);
            Ok(self.add_expr(
                ExprKind::Ternary {
                    cond,
                    then_expr,
                    else_expr,
                },
                span,
            ))
        } else {
            Ok(cond)
        }
    }

    fn binop_of(kind: &TokenKind) -> Option<BinOp> {
        Some(match kind {
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::Percent => BinOp::Rem,
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Shl => BinOp::Shl,
            TokenKind::Shr => BinOp::Shr,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Ge => BinOp::Ge,
            TokenKind::EqEq => BinOp::Eq,
            TokenKind::BangEq => BinOp::Ne,
            TokenKind::Amp => BinOp::BitAnd,
            TokenKind::Caret => BinOp::BitXor,
            TokenKind::Pipe => BinOp::BitOr,
            TokenKind::AmpAmp => BinOp::And,
            TokenKind::PipePipe => BinOp::Or,
            _ => return None,
        })
    }

    /// Precedence-climbing loop. All binary operators are left-associative.
    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<ExprId> {
        let start = self.peek_span();
        let mut lhs = self.parse_unary()?;
        while let Some(op) = Self::binop_of(self.peek()) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            let span = start.merge(self.prev_span);
            lhs = self.add_expr(ExprKind::Binary { op, lhs, rhs }, span);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ParseResult<ExprId> {
        let start = self.peek_span();
        let op = match self.peek() {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Bang => Some(UnOp::Not),
            TokenKind::Tilde => Some(UnOp::BitNot),
            TokenKind::At => {
                // Address-of binds at unary precedence and takes a
                // variable name.
                self.advance();
                let (name, _) = self.expect_ident("a variable name after `@`")?;
                let span = start.merge(self.prev_span);
                return Ok(self.add_expr(ExprKind::AddressOf(name), span));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(self.prev_span);
                Ok(self.add_expr(ExprKind::Unary { op, operand }, span))
            }
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> ParseResult<ExprId> {
        let start = self.peek_span();
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::LParen) {
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                let span = start.merge(self.prev_span);
                expr = self.add_expr(ExprKind::Call { callee: expr, args }, span);
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&TokenKind::RBracket, "`]`")?;
                let span = start.merge(self.prev_span);
                expr = self.add_expr(ExprKind::Index { base: expr, index }, span);
            } else if self.eat(&TokenKind::Dot) {
                let (field, field_span) = self.expect_ident("a member name")?;
                let span = start.merge(self.prev_span);
                expr = self.add_expr(
                    ExprKind::Member {
                        base: expr,
                        field,
                        field_span,
                    },
                    span,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<ExprId> {
        let start = self.peek_span();
        match self.peek().clone() {
            TokenKind::Int { value, width } => {
                self.advance();
                Ok(self.add_expr(ExprKind::Literal(Literal::Int { value, width }), start))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(self.add_expr(ExprKind::Literal(Literal::Str(s)), start))
            }
            TokenKind::Kw(Keyword::True) => {
                self.advance();
                Ok(self.add_expr(ExprKind::Literal(Literal::Bool(true)), start))
            }
            TokenKind::Kw(Keyword::False) => {
                self.advance();
                Ok(self.add_expr(ExprKind::Literal(Literal::Bool(false)), start))
            }
            TokenKind::Kw(kw @ (Keyword::Byte | Keyword::Word)) => {
                // Cast syntax: `byte(x)` / `word(x)`.
                self.advance();
                self.expect(&TokenKind::LParen, "`(`")?;
                let operand = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                let to = if kw == Keyword::Byte {
                    CastKind::Byte
                } else {
                    CastKind::Word
                };
                let span = start.merge(self.prev_span);
                Ok(self.add_expr(ExprKind::Cast { to, operand }, span))
            }
            TokenKind::Ident(text) => {
                let name = self.interner.intern(text);
                self.advance();
                Ok(self.add_expr(ExprKind::Ident(name), start))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        elems.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "`]`")?;
                let span = start.merge(self.prev_span);
                Ok(self.add_expr(ExprKind::ArrayLit(elems), span))
            }
            _ => {
                self.unexpected("an expression");
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::print_expr;
    use crate::sourcemap::SourceMap;

    fn parse(src: &str) -> (Module, Interner, DiagnosticSink) {
        let mut map = SourceMap::new();
        let file = map.add_file("t.b65", src);
        let mut interner = Interner::new();
        let mut sink = DiagnosticSink::new(0);
        let module = parse_module(file, src, &mut interner, &mut sink);
        (module, interner, sink)
    }

    fn codes(sink: &DiagnosticSink) -> Vec<&'static str> {
        sink.iter().map(|d| d.code.code()).collect()
    }

    #[test]
    fn minimal_module() {
        let (module, interner, sink) = parse("module A; export function main(): void { }");
        assert!(!sink.has_errors());
        assert_eq!(interner.resolve(module.name), "A");
        assert!(!module.implicit);
        let f = module.functions().next().unwrap();
        assert!(f.exported);
        assert_eq!(interner.resolve(f.name), "main");
    }

    #[test]
    fn implicit_global_module() {
        let (module, interner, sink) = parse("let x: byte = 1;");
        assert!(!sink.has_errors());
        assert!(module.implicit);
        assert_eq!(interner.resolve(module.name), "global");
    }

    #[test]
    fn duplicate_module_is_reported() {
        let (_, _, sink) = parse("module A;\nmodule B;\n");
        assert_eq!(codes(&sink), vec!["E_DUPLICATE_MODULE"]);
    }

    #[test]
    fn const_without_initializer() {
        let (_, _, sink) = parse("module A; const K: byte;");
        assert_eq!(codes(&sink), vec!["E_MISSING_CONST_INITIALIZER"]);
    }

    #[test]
    fn unexported_main_gets_warning() {
        let (module, _, sink) = parse("module A; function main(): void { }");
        assert_eq!(codes(&sink), vec!["W_IMPLICIT_MAIN_EXPORT"]);
        assert!(module.functions().next().unwrap().exported);
    }

    #[test]
    fn second_exported_main_is_error() {
        let (_, _, sink) = parse(
            "module A;\nexport function main(): void { }\nexport function main(): void { }\n",
        );
        assert!(codes(&sink).contains(&"E_DUPLICATE_EXPORTED_MAIN"));
    }

    #[test]
    fn executable_statement_at_module_scope() {
        let (_, _, sink) = parse("module A; x = 1;");
        assert!(codes(&sink).contains(&"E_UNEXPECTED_TOP_LEVEL"));
    }

    #[test]
    fn parser_recovers_and_reports_multiple_errors() {
        let (module, _, sink) = parse(
            "module A;\n\
             const K: byte;\n\
             function f(): void { let x: byte = ; }\n\
             function g(): void { }\n",
        );
        assert!(sink.error_count() >= 2);
        // Recovery keeps later declarations.
        assert_eq!(module.functions().count(), 2);
    }

    #[test]
    fn imports() {
        let (module, interner, sink) = parse("module A; import f, g from B;");
        assert!(!sink.has_errors());
        let Item::Import(imp) = &module.items[0] else {
            panic!("expected import");
        };
        assert_eq!(imp.names.len(), 2);
        assert_eq!(interner.resolve(imp.module), "B");
    }

    #[test]
    fn map_forms() {
        let (module, _, sink) = parse(
            "module A;\n\
             @map border at $D020: byte;\n\
             @map screen from $0400 to $07E7;\n\
             @map sid at $D400 type\n\
               freq_lo: byte;\n\
               freq_hi: byte;\n\
             end @map\n\
             @map vic at $D000 layout\n\
               sprite0x at $D000: byte;\n\
               colors from $D020 to $D02E;\n\
             end @map\n",
        );
        assert!(!sink.has_errors(), "{:?}", codes(&sink));
        let forms: Vec<&MapForm> = module
            .items
            .iter()
            .filter_map(|i| match i {
                Item::Map(m) => Some(&m.form),
                _ => None,
            })
            .collect();
        assert_eq!(forms.len(), 4);
        assert!(matches!(forms[0], MapForm::Simple { .. }));
        assert!(matches!(forms[1], MapForm::Range { .. }));
        assert!(matches!(
            forms[2],
            MapForm::Struct {
                explicit: false,
                ..
            }
        ));
        assert!(matches!(forms[3], MapForm::Struct { explicit: true, .. }));
    }

    #[test]
    fn do_while_requires_semicolon() {
        let (_, _, sink) = parse(
            "module A; function f(): void { do { } while (true) }",
        );
        assert!(sink.has_errors());
        let (_, _, sink) = parse(
            "module A; function f(): void { do { } while (true); }",
        );
        assert!(!sink.has_errors());
    }

    #[test]
    fn for_loop_forms() {
        let (module, _, sink) = parse(
            "module A; function f(): void {\n\
               let i: byte = 0;\n\
               for i = 0 to 10 { }\n\
               for i = 10 downto 0 step 2 { }\n\
             }",
        );
        assert!(!sink.has_errors());
        let f = module.functions().next().unwrap();
        let body = f.body.as_ref().unwrap();
        assert_eq!(body.len(), 3);
    }

    fn parse_one_expr(src: &str) -> (Module, Interner, ExprId) {
        let text = format!("module T; function t(): byte {{ return {src}; }}");
        let (module, interner, sink) = parse(&text);
        assert!(!sink.has_errors(), "parse error in {src:?}: {:?}", codes(&sink));
        let f = module.functions().next().unwrap();
        let body = f.body.as_ref().unwrap();
        let StmtKind::Return(Some(expr)) = &module.stmt(body[0]).kind else {
            panic!("expected return");
        };
        let expr = *expr;
        (module, interner, expr)
    }

    #[test]
    fn precedence() {
        let (module, interner, e) = parse_one_expr("1 + 2 * 3");
        assert_eq!(print_expr(&module, &interner, e), "1 + 2 * 3");
        let (module, interner, e) = parse_one_expr("(1 + 2) * 3");
        assert_eq!(print_expr(&module, &interner, e), "(1 + 2) * 3");
        let (module, interner, e) = parse_one_expr("a | b ^ c & d == e < f << g + h * i");
        assert_eq!(
            print_expr(&module, &interner, e),
            "a | b ^ c & d == e < f << g + h * i"
        );
        let (module, interner, e) = parse_one_expr("a && b || c");
        assert_eq!(print_expr(&module, &interner, e), "a && b || c");
    }

    #[test]
    fn ternary_is_right_associative() {
        let (module, interner, e) = parse_one_expr("a ? 1 : b ? 2 : 3");
        let ExprKind::Ternary { else_expr, .. } = &module.expr(e).kind else {
            panic!("expected ternary");
        };
        assert!(matches!(
            module.expr(*else_expr).kind,
            ExprKind::Ternary { .. }
        ));
        assert_eq!(print_expr(&module, &interner, e), "a ? 1 : b ? 2 : 3");
    }

    #[test]
    fn address_of_and_casts() {
        let (module, _, e) = parse_one_expr("@counter");
        assert!(matches!(module.expr(e).kind, ExprKind::AddressOf(_)));
        let (module, _, e) = parse_one_expr("byte(w + 1)");
        assert!(matches!(
            module.expr(e).kind,
            ExprKind::Cast {
                to: CastKind::Byte,
                ..
            }
        ));
    }

    #[test]
    fn postfix_chains() {
        let (module, interner, e) = parse_one_expr("table[i + 1]");
        assert_eq!(print_expr(&module, &interner, e), "table[i + 1]");
        let (module, interner, e) = parse_one_expr("sid.freq_lo");
        assert_eq!(print_expr(&module, &interner, e), "sid.freq_lo");
        let (module, interner, e) = parse_one_expr("f(1, x)");
        assert_eq!(print_expr(&module, &interner, e), "f(1, x)");
    }

    #[test]
    fn expr_spans_cover_first_to_last_token() {
        let src = "1 + foo * 3";
        let text = format!("module T; function t(): byte {{ return {src}; }}");
        let (module, _, sink) = parse(&text);
        assert!(!sink.has_errors());
        let f = module.functions().next().unwrap();
        let body = f.body.as_ref().unwrap();
        let StmtKind::Return(Some(expr)) = &module.stmt(body[0]).kind else {
            panic!();
        };
        let span = module.expr(*expr).span;
        let offset = text.find(src).unwrap() as u32;
        assert_eq!(span.start, offset);
        assert_eq!(span.end(), offset + src.len() as u32);
    }

    // Print-then-reparse is structure-preserving (pretty-printer
    // idempotence, modulo formatting).
    #[test]
    fn print_reparse_roundtrip() {
        for src in [
            "1 + 2 * 3 - 4",
            "a ? b + 1 : c ? d : e",
            "-x * ~y + !z",
            "(a + b) * (c | d) ^ e",
            "f(a, b[i], s.t) + word(n)",
            "a << 2 | b >> 1 & 3",
        ] {
            let (m1, i1, e1) = parse_one_expr(src);
            let printed = print_expr(&m1, &i1, e1);
            let (m2, i2, e2) = parse_one_expr(&printed);
            assert_eq!(printed, print_expr(&m2, &i2, e2), "not stable: {src}");
        }
    }
}
