//! The reserved builtin scope.
//!
//! Intrinsics are not keywords; they are ordinary identifiers resolved in
//! a reserved scope that every module scope chains to. Each builtin has a
//! fixed signature enforced by the checker; `sizeof` and `length` are
//! special-cased because they are evaluated at compile time.

use crate::symbols::{ModuleId, Symbol, SymbolId, SymbolKind, SymbolTable};
use crate::types::{Type, TypeId, TypeTable};
use blend65_entity::EntityRef;
use blend65_frontend::intern::Interner;
use blend65_frontend::sourcemap::{SourceId, Span};
use rustc_hash::FxHashMap;

/// The intrinsic operations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Builtin {
    /// `peek(addr): byte`
    Peek,
    /// `poke(addr, value): void`
    Poke,
    /// `peekw(addr): word`
    Peekw,
    /// `pokew(addr, value): void`
    Pokew,
    /// `sizeof(x): word`, compile-time.
    Sizeof,
    /// `length(x): word`, compile-time.
    Length,
    /// `lo(x): byte`
    Lo,
    /// `hi(x): byte`
    Hi,
    /// `sei()`
    Sei,
    /// `cli()`
    Cli,
    /// `nop()`
    Nop,
    /// `brk()`
    Brk,
    /// `pha()`
    Pha,
    /// `pla()`
    Pla,
    /// `php()`
    Php,
    /// `plp()`
    Plp,
    /// `barrier()` — a compiler memory fence, no code emitted.
    Barrier,
    /// `volatile_read(addr): byte`
    VolatileRead,
    /// `volatile_write(addr, value): void`
    VolatileWrite,
}

impl Builtin {
    /// The source name of the intrinsic.
    pub fn name(self) -> &'static str {
        match self {
            Self::Peek => "peek",
            Self::Poke => "poke",
            Self::Peekw => "peekw",
            Self::Pokew => "pokew",
            Self::Sizeof => "sizeof",
            Self::Length => "length",
            Self::Lo => "lo",
            Self::Hi => "hi",
            Self::Sei => "sei",
            Self::Cli => "cli",
            Self::Nop => "nop",
            Self::Brk => "brk",
            Self::Pha => "pha",
            Self::Pla => "pla",
            Self::Php => "php",
            Self::Plp => "plp",
            Self::Barrier => "barrier",
            Self::VolatileRead => "volatile_read",
            Self::VolatileWrite => "volatile_write",
        }
    }

    /// All intrinsics, in a fixed order.
    pub fn all() -> &'static [Builtin] {
        &[
            Self::Peek,
            Self::Poke,
            Self::Peekw,
            Self::Pokew,
            Self::Sizeof,
            Self::Length,
            Self::Lo,
            Self::Hi,
            Self::Sei,
            Self::Cli,
            Self::Nop,
            Self::Brk,
            Self::Pha,
            Self::Pla,
            Self::Php,
            Self::Plp,
            Self::Barrier,
            Self::VolatileRead,
            Self::VolatileWrite,
        ]
    }

    /// `(params, ret)` for ordinary signature checking; `None` for the
    /// compile-time forms (`sizeof`, `length`) whose argument is not an
    /// ordinary value.
    pub fn signature(self, types: &TypeTable) -> Option<(Vec<TypeId>, TypeId)> {
        let byte = types.byte();
        let word = types.word();
        let void = types.void();
        Some(match self {
            Self::Peek | Self::VolatileRead => (vec![word], byte),
            Self::Poke | Self::VolatileWrite => (vec![word, byte], void),
            Self::Peekw => (vec![word], word),
            Self::Pokew => (vec![word, word], void),
            Self::Lo | Self::Hi => (vec![word], byte),
            Self::Sei
            | Self::Cli
            | Self::Nop
            | Self::Brk
            | Self::Pha
            | Self::Pla
            | Self::Php
            | Self::Plp
            | Self::Barrier => (vec![], void),
            Self::Sizeof | Self::Length => return None,
        })
    }

    /// True when calling this builtin touches memory-mapped state that the
    /// optimizer must not reorder or remove.
    pub fn is_volatile(self) -> bool {
        matches!(
            self,
            Self::Peek
                | Self::Poke
                | Self::Peekw
                | Self::Pokew
                | Self::VolatileRead
                | Self::VolatileWrite
                | Self::Barrier
                | Self::Sei
                | Self::Cli
                | Self::Brk
                | Self::Pha
                | Self::Pla
                | Self::Php
                | Self::Plp
        )
    }
}

/// Install the builtins into the global scope.
///
/// Returns the symbol-to-builtin mapping the checker and the IL generator
/// use to recognize intrinsic calls.
pub fn install(
    symbols: &mut SymbolTable,
    types: &mut TypeTable,
    interner: &mut Interner,
) -> FxHashMap<SymbolId, Builtin> {
    let scope = symbols.global_scope();
    // Builtins belong to no module; use an id no real module will get.
    let module = ModuleId::new(u32::MAX as usize - 1);
    let span = Span::new(SourceId::new(u32::MAX as usize - 1), 0, 0);
    let mut map = FxHashMap::default();
    for &builtin in Builtin::all() {
        let name = interner.intern(builtin.name());
        let mut symbol = Symbol::new(name, scope, module, SymbolKind::Builtin, span);
        symbol.ty = builtin.signature(types).map(|(params, ret)| {
            types.intern(Type::Func {
                params,
                ret,
                callback: false,
            })
        });
        let id = symbols
            .declare(scope, symbol)
            .expect("builtin installed twice");
        map.insert(id, builtin);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_covers_every_intrinsic() {
        let mut symbols = SymbolTable::new();
        let mut types = TypeTable::new();
        let mut interner = Interner::new();
        let map = install(&mut symbols, &mut types, &mut interner);
        assert_eq!(map.len(), Builtin::all().len());

        let peek = interner.intern("peek");
        let id = symbols.lookup_quiet(symbols.global_scope(), peek).unwrap();
        assert_eq!(map[&id], Builtin::Peek);
        let Some(Type::Func { params, ret, .. }) =
            symbols.get(id).ty.map(|t| types.get(t).clone())
        else {
            panic!("peek has a function type");
        };
        assert_eq!(params, vec![types.word()]);
        assert_eq!(ret, types.byte());
    }

    #[test]
    fn compile_time_forms_have_no_signature() {
        let types = TypeTable::new();
        assert!(Builtin::Sizeof.signature(&types).is_none());
        assert!(Builtin::Length.signature(&types).is_none());
        assert!(Builtin::Barrier.signature(&types).is_some());
    }

    #[test]
    fn volatility() {
        assert!(Builtin::Poke.is_volatile());
        assert!(Builtin::Barrier.is_volatile());
        assert!(!Builtin::Lo.is_volatile());
        assert!(!Builtin::Sizeof.is_volatile());
    }
}
