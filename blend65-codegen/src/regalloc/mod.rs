//! Register allocation and memory planning.
//!
//! The 6502 gives us three registers and a fast zero page; everything
//! else is ordinary memory. The plan assigns every IL virtual register a
//! home:
//!
//! - `A` for byte temporaries defined immediately before their only use,
//!   in a position the instruction selector consumes from the
//!   accumulator anyway (no store/load pair needed);
//! - `X` for index temporaries whose every appearance the selector can
//!   express with `LDX` and indexed addressing (`Y` is kept free for
//!   indirect addressing and is the selector's scratch index);
//! - a zero-page byte pair while the target's budget lasts, hottest
//!   virtual registers first;
//! - otherwise a named function-local slot the assembler places in BSS.
//!
//! Zero-page homes are handed out from one global pool across all
//! functions, so assignments are pairwise disjoint by construction; the
//! sema layer has already verified the budget, and running out here for
//! an explicit `@zp` request is a compiler bug, not a user error.

use crate::ir::{Function, GlobalId, Inst, Program, StorageClass, Term, Vreg, Width};
use crate::settings::MemoryMap;
use crate::timing;
use blend65_entity::EntityRef;
use rustc_hash::FxHashMap;

/// Where a virtual register lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Loc {
    /// The accumulator, for def-use-adjacent byte temporaries.
    A,
    /// The X index register (a simple loop counter).
    X,
    /// The Y index register (a second simple loop counter).
    Y,
    /// A zero-page byte (words take two consecutive bytes).
    Zp(u8),
    /// A named BSS slot, by index into the function's slot list.
    Slot(usize),
}

/// One BSS slot of a function frame.
pub struct SlotDef {
    /// The assembler label.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
}

/// The allocation of one function.
pub struct FunctionAlloc {
    /// Home of every virtual register that has one.
    pub locs: FxHashMap<Vreg, Loc>,
    /// BSS slots referenced by `Loc::Slot`.
    pub slots: Vec<SlotDef>,
}

/// The whole program's allocation and memory plan.
pub struct ProgramAlloc {
    /// Per-function allocations, parallel to `program.functions`.
    pub funcs: Vec<FunctionAlloc>,
    /// Zero-page homes of `@zp` (and promoted) globals.
    pub global_zp: FxHashMap<GlobalId, u8>,
    /// Every zero-page byte the plan handed out, for the disjointness
    /// check.
    pub zp_used: Vec<u8>,
    /// Eight consecutive zero-page bytes reserved for the runtime scratch
    /// area (helper arguments, word returns, indirection pointers).
    pub scratch: [u8; 8],
}

/// The zero-page pool shared by all functions.
struct ZpPool {
    free: Vec<u8>,
}

impl ZpPool {
    fn new(map: MemoryMap, budget: u32, reserved: &[u8]) -> Self {
        let mut free: Vec<u8> = (map.zp_lo..=map.zp_hi)
            .filter(|b| !reserved.contains(b))
            .collect();
        free.truncate(budget as usize);
        // Hand out low addresses first.
        free.reverse();
        Self { free }
    }

    /// Carve out eight consecutive bytes for the runtime scratch area the
    /// instruction selector and helper routines share.
    fn take_scratch(&mut self) -> [u8; 8] {
        let mut ascending: Vec<u8> = self.free.iter().rev().copied().collect();
        let mut start = None;
        for w in ascending.windows(8) {
            if w[7] == w[0] + 7 {
                start = Some(w[0]);
                break;
            }
        }
        // Fall back to the classic free bytes at $FB-$FE plus the cassette
        // area when the window is too fragmented; on the shipped targets
        // the window is contiguous and this never triggers.
        let base = start.unwrap_or(0xF8);
        ascending.retain(|&b| b < base || b > base + 7);
        self.free = ascending.into_iter().rev().collect();
        core::array::from_fn(|i| base + i as u8)
    }

    /// Take `size` consecutive... the 6502 does not need consecutive
    /// bytes except for word values, and the pool is built from a
    /// contiguous window, so popping `size` bytes and requiring
    /// adjacency for words keeps it simple.
    fn alloc(&mut self, size: u32) -> Option<u8> {
        if size == 1 {
            return self.free.pop();
        }
        // Words need two adjacent bytes.
        let len = self.free.len();
        if len >= 2 {
            let a = self.free[len - 1];
            let b = self.free[len - 2];
            if b == a + 1 {
                self.free.truncate(len - 2);
                return Some(a);
            }
        }
        None
    }

    fn remaining(&self) -> usize {
        self.free.len()
    }
}

/// Allocate every function and global of `program`.
pub fn allocate(
    program: &Program,
    map: MemoryMap,
    budget: u32,
    reserved_zp: &[u8],
) -> ProgramAlloc {
    let _tt = timing::start_pass("regalloc");
    let mut pool = ZpPool::new(map, budget, reserved_zp);
    let scratch = pool.take_scratch();
    let mut global_zp = FxHashMap::default();
    let mut zp_used = Vec::new();

    // Globals first: explicit `@zp` requests, then promoted ones.
    for round in 0..2 {
        for (id, global) in program.globals.iter() {
            let wanted = match round {
                0 => global.storage == StorageClass::Zp,
                _ => global.storage == StorageClass::Ram && global.zp_suggested,
            };
            if !wanted || global.addr.is_some() {
                continue;
            }
            if let Some(addr) = pool.alloc(global.size) {
                for b in 0..global.size {
                    zp_used.push(addr + b as u8);
                }
                global_zp.insert(id, addr);
            } else if global.storage == StorageClass::Zp {
                // The sema layer vetted the budget, so this only happens
                // when fragmentation defeats a word pairing; the global
                // falls back to BSS and stays correct, just slower.
                log::error!("zero-page pool exhausted for {}", global.name);
            }
        }
    }

    let mut funcs = Vec::with_capacity(program.functions.len());
    for func in &program.functions {
        let alloc = allocate_function(program, func, &mut pool, &mut zp_used);
        funcs.push(alloc);
    }

    log::debug!(
        "allocation done, {} zero-page bytes left",
        pool.remaining()
    );
    ProgramAlloc {
        funcs,
        global_zp,
        zp_used,
        scratch,
    }
}

/// Count definitions and uses of every vreg, in instruction order.
struct VregStats {
    defs: Vec<u32>,
    uses: Vec<u32>,
    /// `(block index in layout, inst index)` of the single def, when
    /// there is exactly one.
    single_def: Vec<Option<(usize, usize)>>,
    /// Position of the single use, when there is exactly one.
    single_use: Vec<Option<(usize, usize)>>,
}

fn collect_stats(func: &Function) -> VregStats {
    let n = func.num_vregs();
    let mut stats = VregStats {
        defs: vec![0; n],
        uses: vec![0; n],
        single_def: vec![None; n],
        single_use: vec![None; n],
    };
    for (bi, &block) in func.layout.iter().enumerate() {
        let data = &func.blocks[block];
        for (ii, inst) in data.insts.iter().enumerate() {
            if let Some(dst) = inst.def() {
                stats.defs[dst.index()] += 1;
                stats.single_def[dst.index()] = if stats.defs[dst.index()] == 1 {
                    Some((bi, ii))
                } else {
                    None
                };
            }
            for v in inst.uses() {
                stats.uses[v.index()] += 1;
                stats.single_use[v.index()] = if stats.uses[v.index()] == 1 {
                    Some((bi, ii))
                } else {
                    None
                };
            }
        }
        let term_uses: Vec<Vreg> = match &data.term {
            Term::Branch { cond, .. } => vec![*cond],
            Term::JumpTable { index, .. } => vec![*index],
            Term::Return(Some(v)) => vec![*v],
            _ => Vec::new(),
        };
        for v in term_uses {
            stats.uses[v.index()] += 1;
            stats.single_use[v.index()] = if stats.uses[v.index()] == 1 {
                // The terminator acts as one past the last instruction.
                Some((bi, data.insts.len()))
            } else {
                None
            };
        }
    }
    stats
}

/// Is `v` consumed from the accumulator by the instruction at `pos`?
///
/// The selector loads these operand positions into A first, so a value
/// already living there costs nothing.
fn consumed_from_a(func: &Function, pos: (usize, usize), v: Vreg) -> bool {
    let block = func.layout[pos.0];
    let data = &func.blocks[block];
    if pos.1 == data.insts.len() {
        // Terminator: branch conditions and return values pass through A.
        return matches!(
            &data.term,
            Term::Branch { cond, .. } if *cond == v
        ) || matches!(
            &data.term,
            Term::Return(Some(r)) if *r == v
        );
    }
    match &data.insts[pos.1] {
        Inst::Binary { op, lhs, .. } => {
            // Helper-call operations pass the left operand differently.
            use crate::ir::AluOp::*;
            *lhs == v && !matches!(op, Mul | Div | Rem)
        }
        Inst::Cmp { cc, lhs, rhs, .. } => {
            // The selector swaps operands for `>`/`<=`, so the register
            // it loads first differs by condition.
            use crate::ir::Cond;
            match cc {
                Cond::Gt | Cond::Le => *rhs == v,
                _ => *lhs == v,
            }
        }
        Inst::Move { src, .. } | Inst::Unary { src, .. } => *src == v,
        Inst::Store { src, .. } => *src == v,
        Inst::Lo { src, .. } | Inst::Hi { src, .. } => *src == v,
        _ => false,
    }
}

fn allocate_function(
    program: &Program,
    func: &Function,
    pool: &mut ZpPool,
    zp_used: &mut Vec<u8>,
) -> FunctionAlloc {
    let stats = collect_stats(func);
    let name = &program.sigs[func.func].name;
    let mut locs: FxHashMap<Vreg, Loc> = FxHashMap::default();
    let mut slots: Vec<SlotDef> = Vec::new();

    // Pass 1: accumulator forwarding. A byte temporary defined right
    // before its only use, consumed from A, never needs a home.
    for v in func.vreg_widths.keys() {
        if func.width_of(v) != Width::Byte || func.params.contains(&v) {
            continue;
        }
        let (Some(def), Some(use_)) = (
            stats.single_def[v.index()],
            stats.single_use[v.index()],
        ) else {
            continue;
        };
        if def.0 == use_.0 && use_.1 == def.1 + 1 && consumed_from_a(func, use_, v) {
            locs.insert(v, Loc::A);
        }
    }

    // Pass 1.5: X residency for index temporaries. A byte register whose
    // definition `LDX` can load directly and whose every appearance is as
    // an index of the same block's indexed accesses never leaves X; the
    // no-clobber scan keeps two such candidates from overlapping. Y stays
    // in the selector's hands for indirect addressing.
    for v in func.vreg_widths.keys() {
        if func.width_of(v) != Width::Byte
            || func.params.contains(&v)
            || locs.contains_key(&v)
        {
            continue;
        }
        let Some((def_bi, def_ii)) = stats.single_def[v.index()] else {
            continue;
        };
        let block = func.layout[def_bi];
        let data = &func.blocks[block];
        let ldx_able = matches!(
            data.insts[def_ii],
            Inst::Const { .. } | Inst::Move { .. } | Inst::Load { .. }
        );
        if !ldx_able {
            continue;
        }
        let mut last_use = None;
        let mut index_only = stats.uses[v.index()] > 0;
        for (bi, &b) in func.layout.iter().enumerate() {
            for (ii, inst) in func.blocks[b].insts.iter().enumerate() {
                let uses = inst.uses();
                if !uses.contains(&v) {
                    continue;
                }
                let as_index = match inst {
                    Inst::LoadIndexed { index, .. } => *index == v,
                    Inst::StoreIndexed { index, src, .. } => *index == v && *src != v,
                    _ => false,
                };
                if bi != def_bi || !as_index {
                    index_only = false;
                } else {
                    last_use = Some(ii);
                }
            }
            match &func.blocks[b].term {
                Term::Branch { cond, .. } if *cond == v => index_only = false,
                Term::JumpTable { index, .. } if *index == v => index_only = false,
                Term::Return(Some(r)) if *r == v => index_only = false,
                _ => {}
            }
        }
        let Some(last_use) = last_use else { continue };
        if !index_only {
            continue;
        }
        let clobbered = data.insts[def_ii + 1..=last_use].iter().any(|inst| {
            match inst {
                Inst::LoadIndexed { index, .. } | Inst::StoreIndexed { index, .. } => {
                    *index != v
                }
                Inst::Call { .. } | Inst::CallVoid { .. } | Inst::InlineAsm(_) => true,
                Inst::Binary { op, .. } => {
                    matches!(op, crate::ir::AluOp::Mul | crate::ir::AluOp::Div | crate::ir::AluOp::Rem)
                }
                _ => false,
            }
        });
        if !clobbered {
            locs.insert(v, Loc::X);
        }
    }

    // Pass 2: everything else gets memory, hottest first. Zero page while
    // the pool lasts, then a BSS slot.
    let mut order: Vec<Vreg> = func
        .vreg_widths
        .keys()
        .filter(|v| !locs.contains_key(v))
        .collect();
    order.sort_by_key(|&v| {
        let heat = stats.defs[v.index()] + stats.uses[v.index()];
        (core::cmp::Reverse(heat), v)
    });
    for v in order {
        let size = func.width_of(v).bytes();
        if stats.defs[v.index()] + stats.uses[v.index()] == 0 {
            continue;
        }
        match pool.alloc(size) {
            Some(addr) => {
                for b in 0..size {
                    zp_used.push(addr + b as u8);
                }
                locs.insert(v, Loc::Zp(addr));
            }
            None => {
                let slot = slots.len();
                slots.push(SlotDef {
                    name: format!("{}__s{}", mangle(name), slot),
                    size,
                });
                locs.insert(v, Loc::Slot(slot));
            }
        }
    }

    FunctionAlloc { locs, slots }
}

/// Turn `module::name` into a label-safe form.
pub fn mangle(name: &str) -> String {
    name.replace("::", "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, FuncSig, FunctionBuilder, MemAddr, Term};
    use crate::settings::Target;

    fn program_one_func(build: impl FnOnce(&mut FunctionBuilder)) -> Program {
        let mut program = Program::new();
        let f = program.sigs.push(FuncSig {
            name: "t::f".to_string(),
            params: vec![],
            ret: None,
            callback: false,
        });
        let mut func = Function::new(f);
        let mut b = FunctionBuilder::new(&mut func);
        build(&mut b);
        program.functions.push(func);
        program
    }

    fn alloc(program: &Program) -> ProgramAlloc {
        let map = Target::C64.memory_map();
        allocate(program, map, Target::C64.zero_page_budget(), &[])
    }

    #[test]
    fn adjacent_byte_temp_gets_accumulator() {
        let program = program_one_func(|b| {
            let x = b.iconst(1, Width::Byte);
            b.store(MemAddr::Abs(0x1000), x, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let plan = alloc(&program);
        let locs = &plan.funcs[0].locs;
        assert!(locs.values().any(|&l| l == Loc::A));
    }

    #[test]
    fn zero_page_homes_are_pairwise_disjoint() {
        let program = program_one_func(|b| {
            let x = b.iconst(1, Width::Byte);
            let y = b.iconst(2, Width::Word);
            let z = b.iconst(3, Width::Byte);
            // Several uses each so nothing is accumulator-forwarded.
            let s1 = b.binary(AluOp::Add, Width::Byte, x, z);
            let s2 = b.binary(AluOp::Add, Width::Byte, x, z);
            let s3 = b.binary(AluOp::Add, Width::Byte, s1, s2);
            b.store(MemAddr::Abs(0x1000), s3, Width::Byte, false);
            b.store(MemAddr::Abs(0x1001), s3, Width::Byte, false);
            let lo = b.lo(y);
            b.store(MemAddr::Abs(0x1002), lo, Width::Byte, false);
            b.store(MemAddr::Abs(0x1003), lo, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let plan = alloc(&program);
        let mut seen = plan.zp_used.clone();
        seen.sort_unstable();
        let len = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), len, "overlapping zero-page assignment");
        // Nothing below the usable window.
        assert!(seen.iter().all(|&b| b >= 0x02));
    }

    #[test]
    fn exhausted_pool_spills_to_slots() {
        let program = program_one_func(|b| {
            let mut prev = b.iconst(0, Width::Byte);
            for i in 0..4 {
                let c = b.iconst(i, Width::Byte);
                let sum = b.binary(AluOp::Add, Width::Byte, prev, c);
                // Extra use keeps it out of the accumulator.
                b.store(MemAddr::Abs(0x1000 + u16::from(i)), sum, Width::Byte, false);
                b.store(MemAddr::Abs(0x2000 + u16::from(i)), sum, Width::Byte, false);
                prev = sum;
            }
            b.terminate(Term::Return(None));
        });
        let map = Target::C64.memory_map();
        // A pool of two bytes forces spills.
        let plan = allocate(&program, map, 2, &[]);
        assert!(!plan.funcs[0].slots.is_empty(), "expected BSS spills");
        assert!(plan.zp_used.len() <= 2);
    }

    #[test]
    fn reserved_bytes_are_never_allocated() {
        let program = program_one_func(|b| {
            let x = b.iconst(1, Width::Byte);
            let y = b.binary(AluOp::Add, Width::Byte, x, x);
            b.store(MemAddr::Abs(0x1000), y, Width::Byte, false);
            b.store(MemAddr::Abs(0x1001), y, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let map = Target::C64.memory_map();
        let reserved: Vec<u8> = (0x02..0x10).collect();
        let plan = allocate(&program, map, 255, &reserved);
        assert!(plan.zp_used.iter().all(|b| !reserved.contains(b)));
    }

    #[test]
    fn mangled_names_are_label_safe() {
        assert_eq!(mangle("game::irq_handler"), "game_irq_handler");
    }
}
