//! Analysis metadata.
//!
//! Dataflow analyses never mutate the AST. Their results are stored under
//! enumerated keys, attached to expression ids, statement ids, symbols or
//! whole functions, and read back by later analyses, the IL generator and
//! the optimizer. Every analysis is idempotent: re-running one overwrites
//! its own keys and nothing else.

use crate::symbols::SymbolId;
use blend65_frontend::ast::{ExprId, StmtId};
use rustc_hash::FxHashMap;

/// The enumerated metadata keys.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MetadataKey {
    /// The local is assigned on every path reaching its uses.
    DefinitelyAssigned,
    /// Number of reads of a symbol, loop-weighted.
    ReadCount,
    /// Number of writes to a symbol, loop-weighted.
    WriteCount,
    /// The node or symbol sits inside a loop body.
    IsHotPath,
    /// The function writes no non-local memory and calls only pure
    /// functions.
    IsPure,
    /// The local's address escapes the function.
    Escapes,
    /// The expression's value does not change inside its loop.
    IsLoopInvariant,
    /// Symbols an address value may point to.
    PointsToSet,
    /// The storage class the zero-page ranking suggests.
    SuggestedStorage,
    /// Estimated 6502 cycles for a function body.
    EstimatedCycles,
    /// Bitmask of SID voices a function writes.
    SidVoicesUsed,
    /// The function risks overrunning a VIC-II badline budget.
    VicBadlineRisk,
    /// The expression folds to a compile-time constant.
    ConstantValue,
    /// Small compile-time trip count; unrolling candidate.
    UnrollHint,
    /// Number of CFG blocks a local is live into.
    LiveBlockCount,
    /// Number of distinct definitions that reach a use of a local.
    ReachingDefCount,
}

/// A metadata value. Which variant a key stores is fixed by convention.
#[derive(Clone, PartialEq, Debug)]
pub enum MetadataValue {
    /// A boolean fact.
    Flag(bool),
    /// A counter.
    Count(u32),
    /// A compile-time constant value.
    Const(u32),
    /// A set of symbols.
    Symbols(Vec<SymbolId>),
    /// A suggested storage class, as the marker spelling (`"zp"`).
    Storage(&'static str),
}

impl MetadataValue {
    /// Read a `Flag`, defaulting to false.
    pub fn as_flag(&self) -> bool {
        matches!(self, Self::Flag(true))
    }

    /// Read a `Count` or `Const` as a number.
    pub fn as_count(&self) -> Option<u32> {
        match self {
            Self::Count(n) | Self::Const(n) => Some(*n),
            _ => None,
        }
    }
}

/// Metadata store for one module.
///
/// Keyed maps per attachment point; all maps are append/overwrite only.
#[derive(Default)]
pub struct Metadata {
    exprs: FxHashMap<(ExprId, MetadataKey), MetadataValue>,
    stmts: FxHashMap<(StmtId, MetadataKey), MetadataValue>,
    symbols: FxHashMap<(SymbolId, MetadataKey), MetadataValue>,
    /// Function-level facts, keyed by the function's symbol.
    funcs: FxHashMap<(SymbolId, MetadataKey), MetadataValue>,
}

impl Metadata {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value to an expression.
    pub fn set_expr(&mut self, id: ExprId, key: MetadataKey, value: MetadataValue) {
        self.exprs.insert((id, key), value);
    }

    /// Read a value from an expression.
    pub fn expr(&self, id: ExprId, key: MetadataKey) -> Option<&MetadataValue> {
        self.exprs.get(&(id, key))
    }

    /// Attach a value to a statement.
    pub fn set_stmt(&mut self, id: StmtId, key: MetadataKey, value: MetadataValue) {
        self.stmts.insert((id, key), value);
    }

    /// Read a value from a statement.
    pub fn stmt(&self, id: StmtId, key: MetadataKey) -> Option<&MetadataValue> {
        self.stmts.get(&(id, key))
    }

    /// Attach a value to a symbol.
    pub fn set_symbol(&mut self, id: SymbolId, key: MetadataKey, value: MetadataValue) {
        self.symbols.insert((id, key), value);
    }

    /// Read a value from a symbol.
    pub fn symbol(&self, id: SymbolId, key: MetadataKey) -> Option<&MetadataValue> {
        self.symbols.get(&(id, key))
    }

    /// Attach a value to a function, keyed by its symbol.
    pub fn set_func(&mut self, id: SymbolId, key: MetadataKey, value: MetadataValue) {
        self.funcs.insert((id, key), value);
    }

    /// Read a value from a function.
    pub fn func(&self, id: SymbolId, key: MetadataKey) -> Option<&MetadataValue> {
        self.funcs.get(&(id, key))
    }

    /// Convenience: the folded constant of an expression, if any.
    pub fn const_of(&self, id: ExprId) -> Option<u32> {
        self.expr(id, MetadataKey::ConstantValue)
            .and_then(MetadataValue::as_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_entity::EntityRef;

    #[test]
    fn set_get_overwrite() {
        let mut md = Metadata::new();
        let e = ExprId::new(0);
        md.set_expr(e, MetadataKey::ConstantValue, MetadataValue::Const(5));
        assert_eq!(md.const_of(e), Some(5));
        md.set_expr(e, MetadataKey::ConstantValue, MetadataValue::Const(7));
        assert_eq!(md.const_of(e), Some(7));
        assert!(md.expr(e, MetadataKey::IsLoopInvariant).is_none());
    }

    #[test]
    fn attachment_points_are_separate() {
        let mut md = Metadata::new();
        let s = SymbolId::new(3);
        md.set_symbol(s, MetadataKey::ReadCount, MetadataValue::Count(2));
        assert!(md.func(s, MetadataKey::ReadCount).is_none());
        assert_eq!(
            md.symbol(s, MetadataKey::ReadCount).unwrap().as_count(),
            Some(2)
        );
    }
}
