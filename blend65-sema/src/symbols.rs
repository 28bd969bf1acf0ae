//! Symbol tables and scopes.
//!
//! Scopes form a tree: the global scope holds the builtin intrinsics, each
//! module's file scope is a child of it, and function/parameter/block
//! scopes nest below their module. Lookup walks the parent chain and marks
//! the found symbol as used.
//!
//! All modules share one `SymbolTable`; per-module passes only touch their
//! own scope subtree, so the table behaves like the global cross-module
//! table of the merge phase.

use crate::types::TypeId;
use blend65_entity::packed_option::PackedOption;
use blend65_entity::{entity_impl, PrimaryMap};
use blend65_frontend::intern::Name;
use blend65_frontend::sourcemap::Span;
use rustc_hash::FxHashMap;

/// An opaque reference to a symbol.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);
entity_impl!(SymbolId, "sym");

/// An opaque reference to a scope.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);
entity_impl!(ScopeId, "scope");

/// An opaque reference to a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);
entity_impl!(ModuleId, "mod");

/// What a symbol names.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SymbolKind {
    /// A mutable variable.
    Variable,
    /// A `const` binding.
    Const,
    /// A function parameter.
    Parameter,
    /// A function.
    Function,
    /// A type alias.
    TypeDef,
    /// An enum type.
    Enum,
    /// A member of an enum.
    EnumMember,
    /// A `@map` declaration.
    Map,
    /// A module name.
    Module,
    /// An imported symbol; `import_target` links to the exporter's symbol.
    Import,
    /// A builtin intrinsic such as `peek`.
    Builtin,
}

/// Where a symbol's value lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Storage {
    /// No explicit storage class; the planner decides.
    Auto,
    /// `@zp` — zero page.
    Zp,
    /// `@ram`.
    Ram,
    /// `@data` — initialized, ROM-able.
    Data,
    /// `@map` — a fixed hardware address; never allocated.
    Map,
    /// A stack temporary.
    Stack,
    /// Held in a CPU register.
    Register,
}

/// One symbol.
pub struct Symbol {
    /// Interned name.
    pub name: Name,
    /// Owning scope.
    pub scope: ScopeId,
    /// The module that declared the symbol.
    pub module: ModuleId,
    /// What it names.
    pub kind: SymbolKind,
    /// Resolved type. `None` until the declaration is checked.
    pub ty: Option<TypeId>,
    /// Declared storage class.
    pub storage: Storage,
    /// Where it was declared.
    pub def_span: Span,
    /// True when declared with `export`.
    pub exported: bool,
    /// Set when any lookup finds this symbol.
    pub used: bool,
    /// For `Map` symbols and `@address` constants: the fixed address.
    pub address: Option<u32>,
    /// For `Const` and `EnumMember`: the compile-time value.
    pub const_value: Option<u32>,
    /// For `Import` symbols: the exporter's symbol.
    pub import_target: PackedOption<SymbolId>,
    /// For `Function` symbols declared as stubs: no body seen yet.
    pub is_stub: bool,
}

/// A field of a struct `@map`, resolved to an absolute address.
#[derive(Clone, Debug)]
pub struct MapFieldInfo {
    /// Field name.
    pub name: Name,
    /// Absolute address of the field's first byte.
    pub addr: u32,
    /// Field type.
    pub ty: TypeId,
}

struct Scope {
    parent: PackedOption<ScopeId>,
    /// Name to symbol, plus insertion order for deterministic iteration.
    by_name: FxHashMap<Name, SymbolId>,
    in_order: Vec<SymbolId>,
}

/// The global symbol table of one compilation.
pub struct SymbolTable {
    symbols: PrimaryMap<SymbolId, Symbol>,
    scopes: PrimaryMap<ScopeId, Scope>,
    global: ScopeId,
    /// Struct-`@map` field layouts, keyed by the map symbol.
    map_fields: FxHashMap<SymbolId, Vec<MapFieldInfo>>,
}

impl SymbolTable {
    /// Create a table containing only the empty global scope.
    pub fn new() -> Self {
        let mut scopes = PrimaryMap::new();
        let global = scopes.push(Scope {
            parent: None.into(),
            by_name: FxHashMap::default(),
            in_order: Vec::new(),
        });
        Self {
            symbols: PrimaryMap::new(),
            scopes,
            global,
            map_fields: FxHashMap::default(),
        }
    }

    /// The root scope holding the builtin intrinsics.
    pub fn global_scope(&self) -> ScopeId {
        self.global
    }

    /// Create a child scope of `parent`.
    pub fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: parent.into(),
            by_name: FxHashMap::default(),
            in_order: Vec::new(),
        })
    }

    /// Declare a symbol in `scope`. Returns the previous symbol with the
    /// same name in that scope, if any, instead of inserting.
    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) = self.scopes[scope].by_name.get(&symbol.name) {
            return Err(existing);
        }
        let name = symbol.name;
        let id = self.symbols.push(symbol);
        let s = &mut self.scopes[scope];
        s.by_name.insert(name, id);
        s.in_order.push(id);
        Ok(id)
    }

    /// Replace the symbol bound to `name` in `scope`.
    ///
    /// Used when a stub function is redeclared with a body.
    pub fn rebind(&mut self, scope: ScopeId, name: Name, id: SymbolId) {
        let s = &mut self.scopes[scope];
        s.by_name.insert(name, id);
        s.in_order.push(id);
    }

    /// Look `name` up through the scope chain, marking a hit as used.
    pub fn lookup(&mut self, mut scope: ScopeId, name: Name) -> Option<SymbolId> {
        loop {
            if let Some(&id) = self.scopes[scope].by_name.get(&name) {
                self.symbols[id].used = true;
                return Some(id);
            }
            match self.scopes[scope].parent.expand() {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Look `name` up without touching use marks.
    pub fn lookup_quiet(&self, mut scope: ScopeId, name: Name) -> Option<SymbolId> {
        loop {
            if let Some(&id) = self.scopes[scope].by_name.get(&name) {
                return Some(id);
            }
            match self.scopes[scope].parent.expand() {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Find `name` in exactly `scope`, ignoring parents.
    pub fn lookup_local(&self, scope: ScopeId, name: Name) -> Option<SymbolId> {
        self.scopes[scope].by_name.get(&name).copied()
    }

    /// The symbols of `scope` in declaration order.
    pub fn scope_symbols(&self, scope: ScopeId) -> &[SymbolId] {
        &self.scopes[scope].in_order
    }

    /// Shared access to a symbol.
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    /// Mutable access to a symbol.
    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    /// Follow an import to the symbol it renames; other kinds return `id`.
    pub fn resolve_import(&self, id: SymbolId) -> SymbolId {
        match self.get(id).import_target.expand() {
            Some(target) => self.resolve_import(target),
            None => id,
        }
    }

    /// All symbols, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols.iter()
    }

    /// Record the resolved field layout of a struct `@map` symbol.
    pub fn set_map_fields(&mut self, id: SymbolId, fields: Vec<MapFieldInfo>) {
        self.map_fields.insert(id, fields);
    }

    /// The resolved field layout of a struct `@map` symbol, if any.
    pub fn map_fields(&self, id: SymbolId) -> Option<&[MapFieldInfo]> {
        self.map_fields.get(&id).map(|f| f.as_slice())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Symbol {
    /// A fresh symbol with no type resolved yet.
    pub fn new(
        name: Name,
        scope: ScopeId,
        module: ModuleId,
        kind: SymbolKind,
        def_span: Span,
    ) -> Self {
        Self {
            name,
            scope,
            module,
            kind,
            ty: None,
            storage: Storage::Auto,
            def_span,
            exported: false,
            used: false,
            address: None,
            const_value: None,
            import_target: None.into(),
            is_stub: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_entity::EntityRef;
    use blend65_frontend::intern::Interner;
    use blend65_frontend::sourcemap::{SourceId, Span};

    fn span() -> Span {
        Span::new(SourceId::new(0), 0, 0)
    }

    #[test]
    fn scoped_lookup_walks_parents() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let outer = table.push_scope(table.global_scope());
        let inner = table.push_scope(outer);

        let x = interner.intern("x");
        let id = table
            .declare(
                outer,
                Symbol::new(x, outer, ModuleId::new(0), SymbolKind::Variable, span()),
            )
            .unwrap();

        assert_eq!(table.lookup(inner, x), Some(id));
        assert!(table.get(id).used, "lookup marks the symbol used");
    }

    #[test]
    fn shadowing_resolves_to_innermost() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let outer = table.push_scope(table.global_scope());
        let inner = table.push_scope(outer);

        let x = interner.intern("x");
        let a = table
            .declare(
                outer,
                Symbol::new(x, outer, ModuleId::new(0), SymbolKind::Variable, span()),
            )
            .unwrap();
        let b = table
            .declare(
                inner,
                Symbol::new(x, inner, ModuleId::new(0), SymbolKind::Variable, span()),
            )
            .unwrap();

        assert_eq!(table.lookup(inner, x), Some(b));
        assert_eq!(table.lookup(outer, x), Some(a));
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let scope = table.push_scope(table.global_scope());
        let x = interner.intern("x");
        let first = table
            .declare(
                scope,
                Symbol::new(x, scope, ModuleId::new(0), SymbolKind::Variable, span()),
            )
            .unwrap();
        let err = table
            .declare(
                scope,
                Symbol::new(x, scope, ModuleId::new(0), SymbolKind::Variable, span()),
            )
            .unwrap_err();
        assert_eq!(err, first);
    }

    #[test]
    fn import_chain_resolution() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let scope = table.push_scope(table.global_scope());
        let f = interner.intern("f");
        let target = table
            .declare(
                scope,
                Symbol::new(f, scope, ModuleId::new(0), SymbolKind::Function, span()),
            )
            .unwrap();
        let other = table.push_scope(table.global_scope());
        let mut imp = Symbol::new(f, other, ModuleId::new(1), SymbolKind::Import, span());
        imp.import_target = target.into();
        let imp = table.declare(other, imp).unwrap();
        assert_eq!(table.resolve_import(imp), target);
    }
}
