//! String interning.
//!
//! Identifiers are interned once and referenced by `Name` everywhere else,
//! so symbol lookup and comparison are integer operations. The interner is
//! append-only and shared by all modules of a compilation; readers always
//! see a consistent snapshot.

use blend65_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;

/// An interned string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Name(u32);
entity_impl!(Name, "name");

/// Append-only string interner keyed by content.
pub struct Interner {
    strings: PrimaryMap<Name, String>,
    index: FxHashMap<String, Name>,
}

impl Interner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self {
            strings: PrimaryMap::new(),
            index: FxHashMap::default(),
        }
    }

    /// Intern `s`, returning the existing `Name` if it was seen before.
    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&name) = self.index.get(s) {
            return name;
        }
        let name = self.strings.push(s.to_string());
        self.index.insert(s.to_string(), name);
        name
    }

    /// Resolve a `Name` back to its string.
    pub fn resolve(&self, name: Name) -> &str {
        &self.strings[name]
    }

    /// Number of distinct interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Is the interner empty?
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup() {
        let mut i = Interner::new();
        let a = i.intern("main");
        let b = i.intern("irq");
        let c = i.intern("main");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(i.resolve(a), "main");
        assert_eq!(i.resolve(b), "irq");
        assert_eq!(i.len(), 2);
    }
}
