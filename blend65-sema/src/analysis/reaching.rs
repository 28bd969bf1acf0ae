//! Reaching definitions — the classical forward bitvector fixed point.
//!
//! Each write site of a local is a definition; `OUT(b) = gen(b) ∪ (IN(b)
//! \ kill(b))` with IN the union over predecessors. The summary recorded
//! per symbol is how many distinct definitions reach at least one of its
//! uses: a symbol with exactly one is effectively single-assignment,
//! which the zero-page ranking and the optimizer's propagation both like.

use super::{funcs_in_order, op_effects, Analysis, AnalysisCtx};
use crate::cfg::{BlockId, Cfg};
use crate::metadata::{MetadataKey, MetadataValue};
use crate::symbols::SymbolId;
use crate::{ModuleSema, Sema};
use blend65_entity::EntityRef;
use blend65_frontend::ast::Module;

pub struct ReachingDefs;

/// One definition site.
struct Site {
    symbol: SymbolId,
    block: BlockId,
    op: usize,
}

fn collect_sites(
    module: &Module,
    msema: &ModuleSema,
    sema: &Sema,
    cfg: &Cfg,
    domain: &[SymbolId],
) -> Vec<Site> {
    let mut sites = Vec::new();
    for block in cfg.blocks() {
        for (i, &op) in cfg.block(block).ops.iter().enumerate() {
            let fx = op_effects(module, msema, sema, op);
            for w in fx.writes {
                if domain.contains(&w) && sites.len() < 128 {
                    sites.push(Site {
                        symbol: w,
                        block,
                        op: i,
                    });
                }
            }
        }
    }
    sites
}

/// The sites of `block`'s ops up to (exclusive) or from `op`, as a mask.
fn sites_in_block(sites: &[Site], block: BlockId) -> u128 {
    let mut mask = 0u128;
    for (i, site) in sites.iter().enumerate() {
        if site.block == block {
            mask |= 1 << i;
        }
    }
    mask
}

impl Analysis for ReachingDefs {
    fn name(&self) -> &'static str {
        "reaching-defs"
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

            let sites = collect_sites(module, msema, ctx.sema, cfg, &domain);
            if sites.is_empty() {
                continue;
            }
            let nb = cfg.num_blocks();

            // gen: the last site of each symbol in the block; kill: every
            // site of a symbol the block writes.
            let mut gen_set = vec![0u128; nb];
            let mut kill_set = vec![0u128; nb];
            for block in cfg.blocks() {
                let own = sites_in_block(&sites, block);
                for (i, site) in sites.iter().enumerate() {
                    if own & (1 << i) == 0 {
                        continue;
                    }
                    let last_of_symbol = !sites.iter().enumerate().any(|(j, other)| {
                        other.symbol == site.symbol
                            && other.block == block
                            && other.op > site.op
                            && j != i
                    });
                    if last_of_symbol {
                        gen_set[block.index()] |= 1 << i;
                    }
                    for (j, other) in sites.iter().enumerate() {
                        if other.symbol == site.symbol {
                            kill_set[block.index()] |= 1 << j;
                        }
                    }
                }
                // A block never kills what it generates.
                kill_set[block.index()] &= !gen_set[block.index()];
            }

            let mut out = vec![0u128; nb];
            let mut changed = true;
            while changed {
                changed = false;
                for &block in cfg.rpo() {
                    let mut in_set = 0u128;
                    for &p in &cfg.block(block).preds {
                        in_set |= out[p.index()];
                    }
                    let new_out =
                        gen_set[block.index()] | (in_set & !kill_set[block.index()]);
                    if new_out != out[block.index()] {
                        out[block.index()] = new_out;
                        changed = true;
                    }
                }
            }

            // Which definitions reach a use: walk each block from its IN
            // set, applying kills in op order.
            let mut reaches_use = 0u128;
            for block in cfg.blocks() {
                let mut live: u128 = cfg
                    .block(block)
                    .preds
                    .iter()
                    .map(|p| out[p.index()])
                    .fold(0, |a, b| a | b);
                for (i, &op) in cfg.block(block).ops.iter().enumerate() {
                    let fx = op_effects(module, msema, ctx.sema, op);
                    for r in fx.reads {
                        for (site_ix, site) in sites.iter().enumerate() {
                            if site.symbol == r && live & (1 << site_ix) != 0 {
                                reaches_use |= 1 << site_ix;
                            }
                        }
                    }
                    for w in fx.writes {
                        for (site_ix, site) in sites.iter().enumerate() {
                            if site.symbol == w {
                                live &= !(1u128 << site_ix);
                            }
                        }
                        for (site_ix, site) in sites.iter().enumerate() {
                            if site.symbol == w && site.block == block && site.op == i {
                                live |= 1 << site_ix;
                            }
                        }
                    }
                }
            }

            let metadata = &mut ctx.sema.modules[mid.index()].metadata;
            for &sym in &domain {
                let count = sites
                    .iter()
                    .enumerate()
                    .filter(|&(i, site)| {
                        site.symbol == sym && reaches_use & (1 << i) != 0
                    })
                    .count() as u32;
                metadata.set_symbol(
                    sym,
                    MetadataKey::ReachingDefCount,
                    MetadataValue::Count(count),
                );
            }
        }
    }
}
