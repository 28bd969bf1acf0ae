//! Memory reservation tracking.
//!
//! Every `@map` declaration pins a symbol to an address range. The layout
//! records those ranges per compilation, detects overlaps (a user error)
//! and answers which zero-page bytes are off-limits for allocation. Actual
//! allocation of variables happens later, in the memory planner; this
//! module only owns the contended address space bookkeeping.

use crate::symbols::SymbolId;
use blend65_frontend::sourcemap::Span;

/// The address ranges a target gives the compiler to work with.
///
/// Constructed by the embedder from the selected target; kept as plain
/// numbers here so semantic analysis stays target-agnostic.
#[derive(Copy, Clone, Debug)]
pub struct MemoryParams {
    /// First usable zero-page byte.
    pub zp_lo: u32,
    /// Last usable zero-page byte, inclusive.
    pub zp_hi: u32,
    /// Maximum zero-page bytes the compiler may allocate. Defaults to the
    /// size of the usable window; the `zero-page-budget` option overrides
    /// it.
    pub zp_budget: u32,
}

impl MemoryParams {
    /// Parameters with an explicit budget override (0 keeps the default).
    pub fn with_budget(mut self, budget: u32) -> Self {
        if budget != 0 {
            self.zp_budget = budget.min(self.zp_hi - self.zp_lo + 1);
        }
        self
    }
}

/// One pinned address range.
#[derive(Clone, Debug)]
pub struct Reservation {
    /// First byte of the range.
    pub start: u32,
    /// Last byte of the range, inclusive.
    pub end: u32,
    /// The `@map` symbol that owns the range.
    pub symbol: SymbolId,
    /// Where the declaration is, for conflict diagnostics.
    pub span: Span,
}

impl Reservation {
    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start <= end && start <= self.end
    }
}

/// The per-compilation memory reservation table.
///
/// Reservations from all modules land here; the merge phase is the only
/// writer after per-module analysis, so overlap reporting is stable across
/// runs.
pub struct MemoryLayout {
    params: MemoryParams,
    reservations: Vec<Reservation>,
}

impl MemoryLayout {
    /// An empty layout for the given target parameters.
    pub fn new(params: MemoryParams) -> Self {
        Self {
            params,
            reservations: Vec::new(),
        }
    }

    /// The target parameters this layout was created with.
    pub fn params(&self) -> MemoryParams {
        self.params
    }

    /// Reserve `[start, end]` for `symbol`.
    ///
    /// On overlap the existing reservation is returned and nothing is
    /// recorded.
    pub fn reserve(
        &mut self,
        symbol: SymbolId,
        start: u32,
        end: u32,
        span: Span,
    ) -> Result<(), Reservation> {
        debug_assert!(start <= end);
        if let Some(existing) = self.reservations.iter().find(|r| r.overlaps(start, end)) {
            return Err(existing.clone());
        }
        log::trace!("reserve ${start:04X}-${end:04X} for {symbol}");
        self.reservations.push(Reservation {
            start,
            end,
            symbol,
            span,
        });
        Ok(())
    }

    /// All reservations, in declaration order.
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Zero-page bytes inside the usable window that `@map` reservations
    /// have pinned, so the planner must not hand them out.
    pub fn reserved_zp_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for r in &self.reservations {
            if r.start <= self.params.zp_hi && r.end >= self.params.zp_lo {
                let lo = r.start.max(self.params.zp_lo);
                let hi = r.end.min(self.params.zp_hi);
                for b in lo..=hi {
                    bytes.push(b as u8);
                }
            }
        }
        bytes.sort_unstable();
        bytes.dedup();
        bytes
    }

    /// Number of zero-page bytes still available to the planner.
    pub fn zp_available(&self) -> u32 {
        let window = self.params.zp_hi - self.params.zp_lo + 1;
        let budget = self.params.zp_budget.min(window);
        budget.saturating_sub(self.reserved_zp_bytes().len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_entity::EntityRef;
    use blend65_frontend::sourcemap::SourceId;

    fn params() -> MemoryParams {
        MemoryParams {
            zp_lo: 0x02,
            zp_hi: 0x8F,
            zp_budget: 0x8E,
        }
    }

    fn span() -> Span {
        Span::new(SourceId::new(0), 0, 0)
    }

    #[test]
    fn overlap_is_rejected() {
        let mut layout = MemoryLayout::new(params());
        let a = SymbolId::new(0);
        let b = SymbolId::new(1);
        layout.reserve(a, 0xD020, 0xD020, span()).unwrap();
        let conflict = layout.reserve(b, 0xD020, 0xD020, span()).unwrap_err();
        assert_eq!(conflict.symbol, a);
        // Touching but disjoint ranges are fine.
        layout.reserve(b, 0xD021, 0xD02E, span()).unwrap();
    }

    #[test]
    fn partial_overlap_is_rejected() {
        let mut layout = MemoryLayout::new(params());
        layout
            .reserve(SymbolId::new(0), 0xC000, 0xC0FF, span())
            .unwrap();
        assert!(layout
            .reserve(SymbolId::new(1), 0xC0FF, 0xC1FF, span())
            .is_err());
    }

    #[test]
    fn zp_reservations_shrink_the_budget() {
        let mut layout = MemoryLayout::new(params());
        let before = layout.zp_available();
        layout.reserve(SymbolId::new(0), 0x10, 0x13, span()).unwrap();
        assert_eq!(layout.zp_available(), before - 4);
        assert_eq!(layout.reserved_zp_bytes(), vec![0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn budget_override() {
        let p = params().with_budget(16);
        let layout = MemoryLayout::new(p);
        assert_eq!(layout.zp_available(), 16);
    }
}
