//! The Blend65 type system.
//!
//! Types are structurally interned: after interning, identity comparison of
//! `TypeId` decides type equality, with two deliberate wrinkles from the
//! language rules. `address` is identical to `word` everywhere except
//! diagnostics, and aliases are transparent to every check but keep their
//! name for display.

use blend65_frontend::intern::{Interner, Name};
use blend65_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;

/// An opaque reference to an interned type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "type");

/// An interned type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    /// 8-bit unsigned integer.
    Byte,
    /// 16-bit unsigned integer.
    Word,
    /// The absence of a value.
    Void,
    /// Truth value; never implicitly numeric.
    Bool,
    /// A compile-time string with known length.
    Str {
        /// Character count.
        len: u32,
    },
    /// A fixed-size array.
    Array {
        /// Element type.
        elem: TypeId,
        /// Number of elements.
        len: u32,
    },
    /// A function signature.
    Func {
        /// Parameter types in order.
        params: Vec<TypeId>,
        /// Return type.
        ret: TypeId,
        /// True when the function's address may be taken.
        callback: bool,
    },
    /// An enumeration with `byte` underlying representation.
    Enum {
        /// The declared enum name; enums are nominal.
        name: Name,
        /// Members in declaration order with their values.
        members: Vec<(Name, u8)>,
    },
    /// A named alias, transparent to all checks.
    Alias {
        /// The alias name.
        name: Name,
        /// The aliased type.
        target: TypeId,
    },
    /// A 16-bit address. Identical to `word` except in diagnostics.
    Address,
}

/// The structural type interner.
///
/// Append-only; `TypeId`s remain valid for the whole compilation.
pub struct TypeTable {
    types: PrimaryMap<TypeId, Type>,
    index: FxHashMap<Type, TypeId>,
    byte: TypeId,
    word: TypeId,
    void: TypeId,
    bool_: TypeId,
    address: TypeId,
}

impl TypeTable {
    /// Create a table with the primitives pre-interned.
    pub fn new() -> Self {
        let mut types = PrimaryMap::new();
        let mut index = FxHashMap::default();
        let mut mk = |t: Type| {
            let id = types.push(t.clone());
            index.insert(t, id);
            id
        };
        let byte = mk(Type::Byte);
        let word = mk(Type::Word);
        let void = mk(Type::Void);
        let bool_ = mk(Type::Bool);
        let address = mk(Type::Address);
        Self {
            types,
            index,
            byte,
            word,
            void,
            bool_,
            address,
        }
    }

    /// Intern a type, returning the canonical id for its structure.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.index.get(&ty) {
            return id;
        }
        let id = self.types.push(ty.clone());
        self.index.insert(ty, id);
        id
    }

    /// The `byte` type.
    pub fn byte(&self) -> TypeId {
        self.byte
    }

    /// The `word` type.
    pub fn word(&self) -> TypeId {
        self.word
    }

    /// The `void` type.
    pub fn void(&self) -> TypeId {
        self.void
    }

    /// The `bool` type.
    pub fn bool(&self) -> TypeId {
        self.bool_
    }

    /// The `address` type.
    pub fn address(&self) -> TypeId {
        self.address
    }

    /// Look up the structure behind an id.
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id]
    }

    /// Strip aliases, and fold `address` into `word`.
    ///
    /// The result is the id used for identity comparison.
    pub fn normalize(&self, id: TypeId) -> TypeId {
        match self.get(id) {
            Type::Alias { target, .. } => self.normalize(*target),
            Type::Address => self.word,
            _ => id,
        }
    }

    /// Two types are identical when their normalized ids match.
    pub fn identical(&self, a: TypeId, b: TypeId) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    /// May a value of `from` be assigned to a slot of `to` without a cast?
    ///
    /// Assignability is identity plus one rule: an enum value is assignable
    /// to `byte` (its underlying representation). Widening and narrowing
    /// both require explicit cast syntax.
    pub fn assignable(&self, from: TypeId, to: TypeId) -> bool {
        let from = self.normalize(from);
        let to = self.normalize(to);
        if from == to {
            return true;
        }
        matches!(
            (self.get(from), self.get(to)),
            (Type::Enum { .. }, Type::Byte)
        )
    }

    /// Size of a value of this type in bytes.
    pub fn size_of(&self, id: TypeId) -> u32 {
        match self.get(id) {
            Type::Byte | Type::Bool | Type::Enum { .. } => 1,
            Type::Word | Type::Address => 2,
            Type::Void => 0,
            Type::Str { len } => *len,
            Type::Array { elem, len } => self.size_of(*elem) * len,
            // The address of the function.
            Type::Func { .. } => 2,
            Type::Alias { target, .. } => self.size_of(*target),
        }
    }

    /// Human-readable form for diagnostics. Aliases and `address` keep
    /// their declared names here.
    pub fn display(&self, id: TypeId, interner: &Interner) -> String {
        match self.get(id) {
            Type::Byte => "byte".to_string(),
            Type::Word => "word".to_string(),
            Type::Void => "void".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Address => "address".to_string(),
            Type::Str { len } => format!("string[{len}]"),
            Type::Array { elem, len } => format!("{}[{len}]", self.display(*elem, interner)),
            Type::Func { params, ret, callback } => {
                let params: Vec<String> =
                    params.iter().map(|&p| self.display(p, interner)).collect();
                let head = if *callback { "callback" } else { "function" };
                format!("{head}({}): {}", params.join(", "), self.display(*ret, interner))
            }
            Type::Enum { name, .. } => interner.resolve(*name).to_string(),
            Type::Alias { name, .. } => interner.resolve(*name).to_string(),
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_gives_identity() {
        let mut t = TypeTable::new();
        let a = t.intern(Type::Array {
            elem: t.byte(),
            len: 8,
        });
        let b = t.intern(Type::Array {
            elem: t.byte(),
            len: 8,
        });
        let c = t.intern(Type::Array {
            elem: t.byte(),
            len: 9,
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn address_is_word_for_identity() {
        let t = TypeTable::new();
        assert!(t.identical(t.address(), t.word()));
        assert!(t.assignable(t.address(), t.word()));
        assert!(t.assignable(t.word(), t.address()));
        assert!(!t.identical(t.byte(), t.word()));
    }

    #[test]
    fn enum_widens_to_byte_only() {
        let mut interner = Interner::new();
        let name = interner.intern("Color");
        let a = interner.intern("Red");
        let mut t = TypeTable::new();
        let e = t.intern(Type::Enum {
            name,
            members: vec![(a, 0)],
        });
        assert!(t.assignable(e, t.byte()));
        assert!(!t.assignable(t.byte(), e));
        assert!(!t.assignable(e, t.word()));
    }

    #[test]
    fn aliases_are_transparent() {
        let mut interner = Interner::new();
        let name = interner.intern("SpriteIndex");
        let mut t = TypeTable::new();
        let alias = t.intern(Type::Alias {
            name,
            target: t.byte(),
        });
        assert!(t.identical(alias, t.byte()));
        assert!(t.assignable(alias, t.byte()));
        assert_eq!(t.size_of(alias), 1);
        assert_eq!(t.display(alias, &interner), "SpriteIndex");
    }

    #[test]
    fn sizes() {
        let mut t = TypeTable::new();
        assert_eq!(t.size_of(t.byte()), 1);
        assert_eq!(t.size_of(t.word()), 2);
        let arr = t.intern(Type::Array {
            elem: t.word(),
            len: 10,
        });
        assert_eq!(t.size_of(arr), 20);
    }

    #[test]
    fn bool_is_not_numeric() {
        let t = TypeTable::new();
        assert!(!t.assignable(t.bool(), t.byte()));
        assert!(!t.assignable(t.byte(), t.bool()));
    }
}
