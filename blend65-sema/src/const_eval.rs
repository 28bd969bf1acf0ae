//! Compile-time expression evaluation.
//!
//! Used for `const` initializers, enum member values, array sizes, `@map`
//! addresses, switch case values and constant-folding hints. Arithmetic is
//! unsigned 16-bit with wrapping; booleans evaluate to 0/1. Anything the
//! evaluator cannot prove constant yields `None` and the caller decides
//! whether that is an error.

use crate::builtins::Builtin;
use crate::symbols::{ScopeId, SymbolKind, SymbolTable};
use crate::types::{Type, TypeTable};
use blend65_frontend::ast::{BinOp, CastKind, ExprId, ExprKind, Literal, Module, UnOp};
use rustc_hash::FxHashMap;

use crate::symbols::SymbolId;

/// Everything the evaluator needs to resolve names.
pub struct ConstCtx<'a> {
    /// The module owning the expressions.
    pub module: &'a Module,
    /// The symbol table.
    pub symbols: &'a SymbolTable,
    /// The scope names resolve in.
    pub scope: ScopeId,
    /// The type table, for `sizeof`.
    pub types: &'a TypeTable,
    /// Builtin recognition for `sizeof`/`length`/`lo`/`hi`.
    pub builtins: &'a FxHashMap<SymbolId, Builtin>,
}

/// Evaluate `expr` to a compile-time value, if it is one.
pub fn eval(ctx: &ConstCtx, expr: ExprId) -> Option<u32> {
    let e = ctx.module.expr(expr);
    match &e.kind {
        ExprKind::Literal(Literal::Int { value, .. }) => Some(*value),
        ExprKind::Literal(Literal::Bool(b)) => Some(u32::from(*b)),
        ExprKind::Literal(Literal::Str(_)) => None,

        ExprKind::Ident(name) => {
            let id = ctx.symbols.lookup_quiet(ctx.scope, *name)?;
            let sym = ctx.symbols.get(ctx.symbols.resolve_import(id));
            match sym.kind {
                SymbolKind::Const | SymbolKind::EnumMember => sym.const_value,
                _ => None,
            }
        }

        // `Color.Red` — an enum member.
        ExprKind::Member { base, field, .. } => {
            let ExprKind::Ident(base_name) = &ctx.module.expr(*base).kind else {
                return None;
            };
            let id = ctx.symbols.lookup_quiet(ctx.scope, *base_name)?;
            let sym = ctx.symbols.get(ctx.symbols.resolve_import(id));
            if sym.kind != SymbolKind::Enum {
                return None;
            }
            let ty = sym.ty?;
            let Type::Enum { members, .. } = ctx.types.get(ty) else {
                return None;
            };
            members
                .iter()
                .find(|(name, _)| name == field)
                .map(|&(_, value)| u32::from(value))
        }

        ExprKind::Unary { op, operand } => {
            let v = eval(ctx, *operand)?;
            Some(match op {
                UnOp::Neg => (v as u16).wrapping_neg() as u32,
                UnOp::Not => u32::from(v == 0),
                UnOp::BitNot => !v & 0xFFFF,
            })
        }

        ExprKind::Binary { op, lhs, rhs } => {
            let a = eval(ctx, *lhs)?;
            let b = eval(ctx, *rhs)?;
            let wrap = |v: u32| v & 0xFFFF;
            Some(match op {
                BinOp::Add => wrap(a.wrapping_add(b)),
                BinOp::Sub => wrap(a.wrapping_sub(b)),
                BinOp::Mul => wrap(a.wrapping_mul(b)),
                BinOp::Div => {
                    if b == 0 {
                        return None;
                    }
                    a / b
                }
                BinOp::Rem => {
                    if b == 0 {
                        return None;
                    }
                    a % b
                }
                BinOp::Shl => wrap(a << (b & 15)),
                BinOp::Shr => (a & 0xFFFF) >> (b & 15),
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                BinOp::BitXor => (a ^ b) & 0xFFFF,
                BinOp::Lt => u32::from(a < b),
                BinOp::Le => u32::from(a <= b),
                BinOp::Gt => u32::from(a > b),
                BinOp::Ge => u32::from(a >= b),
                BinOp::Eq => u32::from(a == b),
                BinOp::Ne => u32::from(a != b),
                BinOp::And => u32::from(a != 0 && b != 0),
                BinOp::Or => u32::from(a != 0 || b != 0),
            })
        }

        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            let c = eval(ctx, *cond)?;
            if c != 0 {
                eval(ctx, *then_expr)
            } else {
                eval(ctx, *else_expr)
            }
        }

        ExprKind::Cast { to, operand } => {
            let v = eval(ctx, *operand)?;
            Some(match to {
                CastKind::Byte => v & 0xFF,
                CastKind::Word => v & 0xFFFF,
            })
        }

        ExprKind::Call { callee, args } => {
            let ExprKind::Ident(name) = &ctx.module.expr(*callee).kind else {
                return None;
            };
            let id = ctx.symbols.lookup_quiet(ctx.scope, *name)?;
            let builtin = *ctx.builtins.get(&id)?;
            match builtin {
                Builtin::Sizeof => {
                    let &[arg] = args.as_slice() else { return None };
                    sizeof_arg(ctx, arg)
                }
                Builtin::Length => {
                    let &[arg] = args.as_slice() else { return None };
                    length_arg(ctx, arg)
                }
                Builtin::Lo => {
                    let &[arg] = args.as_slice() else { return None };
                    Some(eval(ctx, arg)? & 0xFF)
                }
                Builtin::Hi => {
                    let &[arg] = args.as_slice() else { return None };
                    Some((eval(ctx, arg)? >> 8) & 0xFF)
                }
                _ => None,
            }
        }

        ExprKind::AddressOf(name) => {
            // The address of a `@map` symbol is a compile-time constant.
            let id = ctx.symbols.lookup_quiet(ctx.scope, *name)?;
            let sym = ctx.symbols.get(ctx.symbols.resolve_import(id));
            sym.address
        }

        ExprKind::Index { .. } | ExprKind::ArrayLit(_) => None,
    }
}

/// `sizeof(x)`: the size in bytes of a variable's type.
pub fn sizeof_arg(ctx: &ConstCtx, arg: ExprId) -> Option<u32> {
    let ExprKind::Ident(name) = &ctx.module.expr(arg).kind else {
        return None;
    };
    let id = ctx.symbols.lookup_quiet(ctx.scope, *name)?;
    let sym = ctx.symbols.get(ctx.symbols.resolve_import(id));
    sym.ty.map(|t| ctx.types.size_of(t))
}

/// `length(x)`: element count of an array, or character count of a string
/// literal.
pub fn length_arg(ctx: &ConstCtx, arg: ExprId) -> Option<u32> {
    match &ctx.module.expr(arg).kind {
        ExprKind::Literal(Literal::Str(s)) => Some(s.chars().count() as u32),
        ExprKind::Ident(name) => {
            let id = ctx.symbols.lookup_quiet(ctx.scope, *name)?;
            let sym = ctx.symbols.get(ctx.symbols.resolve_import(id));
            let ty = ctx.types.normalize(sym.ty?);
            match ctx.types.get(ty) {
                Type::Array { len, .. } => Some(*len),
                Type::Str { len } => Some(*len),
                _ => None,
            }
        }
        _ => None,
    }
}
