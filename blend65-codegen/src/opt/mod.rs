//! The IL optimizer.
//!
//! Peephole and classical block-local optimizations: constant folding and
//! propagation, copy propagation, common subexpression elimination,
//! strength reduction and dead code elimination, plus unreachable block
//! removal. Passes replace and delete instructions in place and never
//! reorder them, which is what makes the volatile rules easy to honor:
//! a volatile access or barrier is never removed, never merged, and keeps
//! its position relative to everything else.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{AluOp, Cond, Function, Inst, Term, UnaryOp, Vreg, Width};
use crate::settings::OptLevel;
use crate::timing;
use blend65_entity::EntityRef;
use rustc_hash::FxHashMap;

/// Optimize `func` at the given level.
pub fn optimize(func: &mut Function, level: OptLevel) {
    let _tt = timing::start_pass("il-optimize");
    match level {
        OptLevel::Off => {}
        OptLevel::Basic => {
            constant_fold(func);
            copy_propagate(func);
            eliminate_dead_code(func);
        }
        OptLevel::Full => {
            constant_fold(func);
            copy_propagate(func);
            reduce_strength(func);
            local_cse(func);
            constant_fold(func);
            copy_propagate(func);
            eliminate_dead_code(func);
            remove_unreachable_blocks(func);
        }
    }
}

fn truncate(value: u32, width: Width) -> u16 {
    match width {
        Width::Byte => (value & 0xFF) as u16,
        Width::Word => (value & 0xFFFF) as u16,
    }
}

fn eval_binary(op: AluOp, width: Width, a: u16, b: u16) -> Option<u16> {
    let (a, b) = (u32::from(a), u32::from(b));
    let v = match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Mul => a.wrapping_mul(b),
        AluOp::Div => {
            if b == 0 {
                return None;
            }
            a / b
        }
        AluOp::Rem => {
            if b == 0 {
                return None;
            }
            a % b
        }
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        AluOp::Shl => a << (b & 15),
        AluOp::Shr => u32::from(truncate(a, width)) >> (b & 15),
    };
    Some(truncate(v, width))
}

fn eval_unary(op: UnaryOp, width: Width, a: u16) -> u16 {
    match op {
        UnaryOp::Neg => truncate((a as u32).wrapping_neg(), width),
        UnaryOp::BitNot => truncate(!(a as u32), width),
        UnaryOp::Not => u16::from(a == 0),
    }
}

fn eval_cmp(cc: Cond, a: u16, b: u16) -> u16 {
    u16::from(match cc {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Lt => a < b,
        Cond::Le => a <= b,
        Cond::Gt => a > b,
        Cond::Ge => a >= b,
    })
}

/// Fold constants within each block and through terminators.
///
/// Virtual registers are not memory, so their known values survive
/// volatile instructions; only a redefinition invalidates them.
fn constant_fold(func: &mut Function) {
    for &block in &func.layout.clone() {
        let mut known: FxHashMap<Vreg, u16> = FxHashMap::default();
        let data = &mut func.blocks[block];
        for inst in &mut data.insts {
            let folded = match &*inst {
                Inst::Const { .. } => None,
                Inst::Move { dst, src } => known
                    .get(src)
                    .copied()
                    .map(|v| (*dst, v, func.vreg_widths[*dst])),
                Inst::Unary {
                    op,
                    width,
                    dst,
                    src,
                } => known
                    .get(src)
                    .copied()
                    .map(|a| (*dst, eval_unary(*op, *width, a), *width)),
                Inst::Binary {
                    op,
                    width,
                    dst,
                    lhs,
                    rhs,
                } => match (known.get(lhs).copied(), known.get(rhs).copied()) {
                    (Some(a), Some(b)) => {
                        eval_binary(*op, *width, a, b).map(|v| (*dst, v, *width))
                    }
                    _ => None,
                },
                Inst::Cmp {
                    cc,
                    dst,
                    lhs,
                    rhs,
                    ..
                } => match (known.get(lhs).copied(), known.get(rhs).copied()) {
                    (Some(a), Some(b)) => Some((*dst, eval_cmp(*cc, a, b), Width::Byte)),
                    _ => None,
                },
                Inst::Zext { dst, src } => {
                    known.get(src).copied().map(|v| (*dst, v & 0xFF, Width::Word))
                }
                Inst::Lo { dst, src } => {
                    known.get(src).copied().map(|v| (*dst, v & 0xFF, Width::Byte))
                }
                Inst::Hi { dst, src } => {
                    known.get(src).copied().map(|v| (*dst, v >> 8, Width::Byte))
                }
                _ => None,
            };
            if let Some((dst, value, width)) = folded {
                *inst = Inst::Const { dst, value, width };
            }
            // A redefinition invalidates the old value; a constant
            // definition records the new one.
            if let Some(dst) = inst.def() {
                known.remove(&dst);
            }
            if let Inst::Const { dst, value, .. } = *inst {
                known.insert(dst, value);
            }
        }

        // Fold a constant branch into a jump.
        match &data.term {
            Term::Branch {
                cond,
                then_block,
                else_block,
            } => {
                if let Some(v) = known.get(cond) {
                    let target = if *v != 0 { *then_block } else { *else_block };
                    data.term = Term::Jump(target);
                }
            }
            Term::JumpTable {
                index,
                base,
                targets,
                default,
            } => {
                if let Some(v) = known.get(index) {
                    let target = v
                        .checked_sub(*base)
                        .and_then(|i| targets.get(i as usize).copied())
                        .unwrap_or(*default);
                    data.term = Term::Jump(target);
                }
            }
            _ => {}
        }
    }
}

/// Block-local copy propagation (move elimination).
fn copy_propagate(func: &mut Function) {
    for &block in &func.layout.clone() {
        let mut copies: FxHashMap<Vreg, Vreg> = FxHashMap::default();
        let resolve = |copies: &FxHashMap<Vreg, Vreg>, mut v: Vreg| {
            let mut hops = 0;
            while let Some(&src) = copies.get(&v) {
                v = src;
                hops += 1;
                if hops > copies.len() {
                    break;
                }
            }
            v
        };
        let data = &mut func.blocks[block];
        for inst in &mut data.insts {
            rewrite_uses(inst, |v| resolve(&copies, v));
            if let Some(dst) = inst.def() {
                // Any recorded copy that mentions the redefined register
                // is stale.
                copies.retain(|&k, &mut v| k != dst && v != dst);
            }
            if let Inst::Move { dst, src } = *inst {
                if dst != src {
                    copies.insert(dst, src);
                }
            }
        }
        rewrite_term_uses(&mut data.term, |v| resolve(&copies, v));
    }
}

fn rewrite_uses(inst: &mut Inst, mut f: impl FnMut(Vreg) -> Vreg) {
    match inst {
        Inst::Const { .. } | Inst::AddrOf { .. } | Inst::Cpu(_) | Inst::Barrier
        | Inst::InlineAsm(_) | Inst::Load { .. } => {}
        Inst::Move { src, .. }
        | Inst::Unary { src, .. }
        | Inst::Zext { src, .. }
        | Inst::Lo { src, .. }
        | Inst::Hi { src, .. }
        | Inst::Store { src, .. } => *src = f(*src),
        Inst::Binary { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
            *lhs = f(*lhs);
            *rhs = f(*rhs);
        }
        Inst::LoadIndexed { index, .. } => *index = f(*index),
        Inst::StoreIndexed { index, src, .. } => {
            *index = f(*index);
            *src = f(*src);
        }
        Inst::Call { args, .. } | Inst::CallVoid { args, .. } => {
            for a in args {
                *a = f(*a);
            }
        }
        Inst::Peek { ptr, .. } => *ptr = f(*ptr),
        Inst::Poke { ptr, src, .. } => {
            *ptr = f(*ptr);
            *src = f(*src);
        }
    }
}

fn rewrite_term_uses(term: &mut Term, mut f: impl FnMut(Vreg) -> Vreg) {
    match term {
        Term::Branch { cond, .. } => *cond = f(*cond),
        Term::JumpTable { index, .. } => *index = f(*index),
        Term::Return(Some(v)) => *v = f(*v),
        _ => {}
    }
}

/// Multiplications and divisions by powers of two become shifts.
fn reduce_strength(func: &mut Function) {
    for &block in &func.layout.clone() {
        let mut known: FxHashMap<Vreg, u16> = FxHashMap::default();
        let next_vreg_base = func.vreg_widths.len();
        let mut new_widths: Vec<Width> = Vec::new();
        let data = &mut func.blocks[block];
        let mut rewritten: Vec<Inst> = Vec::with_capacity(data.insts.len());

        for mut inst in data.insts.drain(..) {
            if let Inst::Const { dst, value, .. } = inst {
                known.insert(dst, value);
            } else if let Some(dst) = inst.def() {
                known.remove(&dst);
            }

            if let Inst::Binary {
                op: op @ (AluOp::Mul | AluOp::Div),
                width,
                dst,
                lhs,
                rhs,
            } = inst
            {
                if let Some(&k) = known.get(&rhs) {
                    if k.is_power_of_two() {
                        let amount = k.trailing_zeros() as u16;
                        // A fresh register for the shift amount.
                        let amt = Vreg::new(next_vreg_base + new_widths.len());
                        new_widths.push(Width::Byte);
                        rewritten.push(Inst::Const {
                            dst: amt,
                            value: amount,
                            width: Width::Byte,
                        });
                        let shift = if op == AluOp::Mul {
                            AluOp::Shl
                        } else {
                            AluOp::Shr
                        };
                        inst = Inst::Binary {
                            op: shift,
                            width,
                            dst,
                            lhs,
                            rhs: amt,
                        };
                    }
                }
            }
            rewritten.push(inst);
        }
        data.insts = rewritten;
        for w in new_widths {
            func.vreg_widths.push(w);
        }
    }
}

/// Block-local common subexpression elimination for pure arithmetic.
///
/// Loads are deliberately excluded: merging memory reads across stores or
/// volatile accesses is exactly what the volatile rules forbid, so only
/// register-pure expressions participate.
fn local_cse(func: &mut Function) {
    #[derive(PartialEq, Eq, Hash)]
    enum Key {
        Bin(AluOp, Width, Vreg, Vreg),
        Un(UnaryOp, Width, Vreg),
        Cmp(Cond, Width, Vreg, Vreg),
        Lo(Vreg),
        Hi(Vreg),
    }

    for &block in &func.layout.clone() {
        let mut table: FxHashMap<Key, Vreg> = FxHashMap::default();
        let data = &mut func.blocks[block];
        for inst in &mut data.insts {
            let key = match inst {
                Inst::Binary {
                    op,
                    width,
                    lhs,
                    rhs,
                    ..
                } => Some(Key::Bin(*op, *width, *lhs, *rhs)),
                Inst::Unary {
                    op, width, src, ..
                } => Some(Key::Un(*op, *width, *src)),
                Inst::Cmp {
                    cc,
                    width,
                    lhs,
                    rhs,
                    ..
                } => Some(Key::Cmp(*cc, *width, *lhs, *rhs)),
                Inst::Lo { src, .. } => Some(Key::Lo(*src)),
                Inst::Hi { src, .. } => Some(Key::Hi(*src)),
                _ => None,
            };

            if let (Some(key), Some(dst)) = (key, inst.def()) {
                match table.get(&key) {
                    Some(&prior) if prior != dst => {
                        *inst = Inst::Move { dst, src: prior };
                    }
                    _ => {
                        table.insert(key, dst);
                    }
                }
            }

            // A redefinition invalidates every expression mentioning the
            // register, including results.
            if let Some(dst) = inst.def() {
                table.retain(|key, &mut result| {
                    if result == dst {
                        return false;
                    }
                    match key {
                        Key::Bin(_, _, a, b) | Key::Cmp(_, _, a, b) => *a != dst && *b != dst,
                        Key::Un(_, _, a) | Key::Lo(a) | Key::Hi(a) => *a != dst,
                    }
                });
            }
        }
    }
}

/// Remove pure instructions whose results are never used.
fn eliminate_dead_code(func: &mut Function) {
    loop {
        // Everything read anywhere in the function.
        let mut used = vec![false; func.num_vregs()];
        for &block in &func.layout {
            let data = &func.blocks[block];
            for inst in &data.insts {
                for v in inst.uses() {
                    used[v.index()] = true;
                }
            }
            match &data.term {
                Term::Branch { cond, .. } => used[cond.index()] = true,
                Term::JumpTable { index, .. } => used[index.index()] = true,
                Term::Return(Some(v)) => used[v.index()] = true,
                _ => {}
            }
        }

        let mut removed = false;
        for &block in &func.layout.clone() {
            let data = &mut func.blocks[block];
            let before = data.insts.len();
            data.insts.retain(|inst| {
                if inst.has_side_effects() {
                    return true;
                }
                match inst.def() {
                    Some(dst) => used[dst.index()],
                    None => true,
                }
            });
            removed |= data.insts.len() != before;
        }
        if !removed {
            break;
        }
    }
}

/// Drop blocks no path from the entry reaches.
fn remove_unreachable_blocks(func: &mut Function) {
    let cfg = ControlFlowGraph::with_function(func);
    let reachable: Vec<bool> = func
        .layout
        .iter()
        .map(|&b| cfg.is_reachable(b))
        .collect();
    let mut keep = reachable.iter();
    func.layout.retain(|_| *keep.next().unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncRef, FunctionBuilder, Inst, MemAddr};

    fn new_func() -> Function {
        let _ = env_logger::builder().is_test(true).try_init();
        Function::new(FuncRef::from_u32(0))
    }

    fn insts(func: &Function) -> &[Inst] {
        &func.blocks[func.entry()].insts
    }

    #[test]
    fn folds_constants_through_arithmetic() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.iconst(6, Width::Byte);
        let y = b.iconst(7, Width::Byte);
        let product = b.binary(AluOp::Mul, Width::Byte, x, y);
        b.terminate(Term::Return(Some(product)));

        optimize(&mut func, OptLevel::Basic);

        // Only the final constant survives DCE.
        assert_eq!(insts(&func).len(), 1);
        assert!(matches!(insts(&func)[0], Inst::Const { value: 42, .. }));
    }

    #[test]
    fn byte_arithmetic_wraps() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.iconst(200, Width::Byte);
        let y = b.iconst(100, Width::Byte);
        let sum = b.binary(AluOp::Add, Width::Byte, x, y);
        b.terminate(Term::Return(Some(sum)));

        optimize(&mut func, OptLevel::Basic);
        assert!(matches!(insts(&func)[0], Inst::Const { value: 44, .. }));
    }

    #[test]
    fn constant_branch_becomes_jump() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let cond = b.iconst(1, Width::Byte);
        let then_block = b.create_block();
        let else_block = b.create_block();
        b.terminate(Term::Branch {
            cond,
            then_block,
            else_block,
        });
        b.switch_to_block(then_block);
        b.terminate(Term::Return(None));
        b.switch_to_block(else_block);
        b.terminate(Term::Return(None));

        optimize(&mut func, OptLevel::Full);
        assert!(matches!(
            func.blocks[func.entry()].term,
            Term::Jump(b) if b == then_block
        ));
        // The untaken side is gone from the layout.
        assert!(!func.layout.contains(&else_block));
    }

    #[test]
    fn copy_propagation_eliminates_moves() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.iconst(5, Width::Byte);
        let copy = b.new_vreg(Width::Byte);
        b.mov(copy, x);
        let result = b.binary(AluOp::Add, Width::Byte, copy, copy);
        b.terminate(Term::Return(Some(result)));

        optimize(&mut func, OptLevel::Basic);
        // The move is dead after propagation, and the add folds.
        assert!(matches!(insts(&func)[0], Inst::Const { value: 10, .. }));
        assert_eq!(insts(&func).len(), 1);
    }

    #[test]
    fn volatile_store_survives_every_level() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let v = b.iconst(1, Width::Byte);
        b.store(MemAddr::Abs(0xD020), v, Width::Byte, true);
        // An unused non-volatile load, which DCE may drop.
        let _unused = b.load(MemAddr::Abs(0x1000), Width::Byte, false);
        b.terminate(Term::Return(None));

        optimize(&mut func, OptLevel::Full);
        let has_store = insts(&func)
            .iter()
            .any(|i| matches!(i, Inst::Store { volatile: true, .. }));
        assert!(has_store, "volatile store was removed");
        let has_dead_load = insts(&func)
            .iter()
            .any(|i| matches!(i, Inst::Load { .. }));
        assert!(!has_dead_load, "dead non-volatile load survived");
    }

    #[test]
    fn barrier_blocks_cse() {
        let mut func = new_func();
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.load(MemAddr::Abs(0xD012), Width::Byte, true);
        let y = b.load(MemAddr::Abs(0xD012), Width::Byte, true);
        let sum = b.binary(AluOp::Add, Width::Byte, x, y);
        b.terminate(Term::Return(Some(sum)));

        optimize(&mut func, OptLevel::Full);
        // Two volatile reads of the raster register must both survive.
        let loads = insts(&func)
            .iter()
            .filter(|i| matches!(i, Inst::Load { volatile: true, .. }))
            .count();
        assert_eq!(loads, 2);
    }

    #[test]
    fn strength_reduction_rewrites_mul_by_pow2() {
        let mut func = new_func();
        let x = func.vreg_widths.push(Width::Byte);
        func.params.push(x);
        let mut b = FunctionBuilder::new(&mut func);
        let eight = b.iconst(8, Width::Byte);
        let result = b.binary(AluOp::Mul, Width::Byte, x, eight);
        b.terminate(Term::Return(Some(result)));

        optimize(&mut func, OptLevel::Full);
        let has_shift = insts(&func)
            .iter()
            .any(|i| matches!(i, Inst::Binary { op: AluOp::Shl, .. }));
        assert!(has_shift, "mul by 8 should become a shift");
        let has_mul = insts(&func)
            .iter()
            .any(|i| matches!(i, Inst::Binary { op: AluOp::Mul, .. }));
        assert!(!has_mul);
    }

    // Folding a two-constant operation agrees with direct evaluation,
    // at every width and for every operator.
    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(256))]

        #[test]
        fn prop_constant_folding_matches_evaluation(
            a in proptest::prelude::any::<u16>(),
            b in proptest::prelude::any::<u16>(),
            op_ix in 0usize..10,
            wide in proptest::prelude::any::<bool>(),
        ) {
            use AluOp::*;
            let op = [Add, Sub, Mul, Div, Rem, And, Or, Xor, Shl, Shr][op_ix];
            let width = if wide { Width::Word } else { Width::Byte };
            let (a, b) = match width {
                Width::Byte => (a & 0xFF, b & 0xFF),
                Width::Word => (a, b),
            };

            let mut func = new_func();
            let mut builder = FunctionBuilder::new(&mut func);
            let lhs = builder.iconst(a, width);
            let rhs = builder.iconst(b, width);
            let result = builder.binary(op, width, lhs, rhs);
            builder.terminate(Term::Return(Some(result)));

            optimize(&mut func, OptLevel::Basic);

            match eval_binary(op, width, a, b) {
                Some(expected) => {
                    let folded = insts(&func).iter().find_map(|i| match i {
                        Inst::Const { dst, value, .. } if *dst == result => Some(*value),
                        _ => None,
                    });
                    proptest::prop_assert_eq!(folded, Some(expected));
                }
                None => {
                    // Division by zero never folds; the operation stays.
                    let stays = insts(&func)
                        .iter()
                        .any(|i| matches!(i, Inst::Binary { .. }));
                    proptest::prop_assert!(stays);
                }
            }
        }
    }

    #[test]
    fn cse_merges_repeated_arithmetic() {
        let mut func = new_func();
        let x = func.vreg_widths.push(Width::Byte);
        let y = func.vreg_widths.push(Width::Byte);
        func.params.push(x);
        func.params.push(y);
        let mut b = FunctionBuilder::new(&mut func);
        let a = b.binary(AluOp::Add, Width::Byte, x, y);
        let c = b.binary(AluOp::Add, Width::Byte, x, y);
        let sum = b.binary(AluOp::Add, Width::Byte, a, c);
        b.terminate(Term::Return(Some(sum)));

        optimize(&mut func, OptLevel::Full);
        let adds = insts(&func)
            .iter()
            .filter(|i| matches!(i, Inst::Binary { op: AluOp::Add, .. }))
            .count();
        // x+y once, then a+a.
        assert_eq!(adds, 2);
    }
}
