//! Live variables — the classical backward bitvector fixed point.
//!
//! `LIVE-IN(b) = use(b) ∪ (LIVE-OUT(b) \ def(b))`, with LIVE-OUT the
//! union over successors. The summary stored here (how many blocks each
//! local is live in) feeds the zero-page ranking; the register allocator
//! recomputes exact liveness on the IL where it is needed.

use super::{funcs_in_order, op_effects, Analysis, AnalysisCtx};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use blend65_entity::EntityRef;

pub struct Liveness;

impl Analysis for Liveness {
    fn name(&self) -> &'static str {
        "liveness"
    }

    fn run(&self, ctx: &mut AnalysisCtx) {
        for (mid, func_id) in funcs_in_order(ctx) {
            let module = &ctx.modules[mid.index()];
            let msema = &ctx.sema.modules[mid.index()];
            let info = &ctx.sema.funcs[func_id];
            let cfg = &info.cfg;

            let mut domain: Vec<SymbolId> = info.params.clone();
            domain.extend(info.locals.iter().copied());
            if domain.is_empty() {
                continue;
            }
            // One u128 bitvector per block; functions beyond 128 slots keep
            // exact results for the first 128 locals only.
            domain.truncate(128);
            let bit = |sym: SymbolId| domain.iter().position(|&s| s == sym);

            // Per-block use/def sets.
            let nb = cfg.num_blocks();
            let mut use_set = vec![0u128; nb];
            let mut def_set = vec![0u128; nb];
            for block in cfg.blocks() {
                let (mut uses, mut defs) = (0u128, 0u128);
                for &op in &cfg.block(block).ops {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for r in fx.reads {
                        if let Some(b) = bit(r) {
                            if defs & (1 << b) == 0 {
                                uses |= 1 << b;
                            }
                        }
                    }
                    for w in fx.writes {
                        if let Some(b) = bit(w) {
                            defs |= 1 << b;
                        }
                    }
                }
                use_set[block.index()] = uses;
                def_set[block.index()] = defs;
            }

            let mut live_in = vec![0u128; nb];
            let mut changed = true;
            while changed {
                changed = false;
                // Backward problem: iterate postorder (reverse RPO).
                for &block in cfg.rpo().iter().rev() {
                    let mut out = 0u128;
                    for &s in &cfg.block(block).succs {
                        out |= live_in[s.index()];
                    }
                    let new_in =
                        use_set[block.index()] | (out & !def_set[block.index()]);
                    if new_in != live_in[block.index()] {
                        live_in[block.index()] = new_in;
                        changed = true;
                    }
                }
            }

            // Summary: number of blocks each symbol is live into.
            let mut live_blocks = vec![0u32; domain.len()];
            for block in cfg.blocks() {
                let set = live_in[block.index()];
                for (i, count) in live_blocks.iter_mut().enumerate() {
                    if set & (1 << i) != 0 {
                        *count += 1;
                    }
                }
            }

            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for (i, &sym) in domain.iter().enumerate() {
                metadata.set_symbol(
                    sym,
                    MetadataKey::LiveBlockCount,
                    MetadataValue::Count(live_blocks[i]),
                );
            }
        }
    }
}
