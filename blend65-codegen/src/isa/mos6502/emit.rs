//! IL to 6502 instruction selection.
//!
//! The selection discipline keeps the emitted code obviously correct on a
//! three-register machine: the accumulator is the working register for
//! every byte operation, X carries indices, Y is reserved for indirect
//! addressing, and word values live in memory and are processed a byte at
//! a time. A small zero-page scratch area (reserved by the allocator)
//! carries helper arguments, word returns and indirection pointers.
//!
//! Multiplication, division and variable shifts have no hardware form;
//! they call runtime helper routines appended once per program, only when
//! used.

use super::{AsmLine, Op, Operand, Place};
use crate::ir::{
    AluOp, Cond, CpuOp, FuncRef, Function, GlobalId, Inst, MemAddr, Program, StorageClass, Term,
    UnaryOp, Vreg, Width,
};
use crate::regalloc::{mangle, FunctionAlloc, Loc, ProgramAlloc};
use crate::settings::CompileOptions;
use crate::timing;
use blend65_entity::EntityRef;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// The emitted program, split by segment.
pub struct EmitResult {
    /// Code: startup, functions, runtime helpers, jump tables.
    pub code: Vec<AsmLine>,
    /// Initialized data.
    pub data: Vec<AsmLine>,
    /// Reserved, uninitialized storage.
    pub bss: Vec<AsmLine>,
}

/// Emit the whole program.
pub fn emit_program(
    program: &Program,
    alloc: &ProgramAlloc,
    options: &CompileOptions,
) -> EmitResult {
    let _tt = timing::start_pass("codegen");
    let mut code = Vec::new();
    let mut data = Vec::new();
    let mut bss = Vec::new();
    let mut helpers: BTreeSet<&'static str> = BTreeSet::new();

    // FuncRef -> position in `program.functions`, for parameter homes.
    let mut bodies: FxHashMap<FuncRef, usize> = FxHashMap::default();
    for (i, f) in program.functions.iter().enumerate() {
        bodies.insert(f.func, i);
    }

    code.push(AsmLine::Comment(format!(
        "blend65 output, target {}",
        options.target
    )));
    if let Some(entry) = program.entry {
        code.push(AsmLine::Label("__start".to_string()));
        // Zero-page globals cannot live in the loaded image; their
        // initial values are written here, before anything runs.
        for (id, global) in program.globals.iter() {
            let (Some(&zp), Some(init)) = (alloc.global_zp.get(&id), &global.init) else {
                continue;
            };
            for (offset, &byte) in init.iter().enumerate() {
                code.push(AsmLine::Inst(Op::Lda, Operand::Imm(byte)));
                code.push(AsmLine::Inst(
                    Op::Sta,
                    Operand::Mem(Place::Addr(u16::from(zp) + offset as u16)),
                ));
            }
        }
        code.push(AsmLine::Inst(
            Op::Jsr,
            Operand::Mem(Place::Label(mangle(&program.sigs[entry].name), 0)),
        ));
        code.push(AsmLine::Inst(Op::Rts, Operand::None));
    }

    for (i, func) in program.functions.iter().enumerate() {
        let mut emitter = FuncEmitter {
            program,
            func,
            alloc: &alloc.funcs[i],
            palloc: alloc,
            bodies: &bodies,
            helpers: &mut helpers,
            lines: Vec::new(),
            labels: 0,
            name: mangle(&program.sigs[func.func].name),
        };
        emitter.emit();
        code.append(&mut emitter.lines);
    }

    runtime_helpers(&helpers, alloc.scratch, &mut code);

    // Initialized globals land in the data segment; everything else the
    // plan left in memory gets BSS space. Map globals are never emitted.
    for (id, global) in program.globals.iter() {
        if global.storage == StorageClass::Map || global.addr.is_some() {
            continue;
        }
        if alloc.global_zp.contains_key(&id) {
            continue;
        }
        let label = mangle(&global.name);
        match &global.init {
            Some(bytes) => {
                data.push(AsmLine::Label(label));
                data.push(AsmLine::Bytes(bytes.clone()));
            }
            None => {
                bss.push(AsmLine::Label(label));
                bss.push(AsmLine::Reserve(global.size));
            }
        }
    }
    for f in &alloc.funcs {
        for slot in &f.slots {
            bss.push(AsmLine::Label(slot.name.clone()));
            bss.push(AsmLine::Reserve(slot.size));
        }
    }

    EmitResult { code, data, bss }
}

struct FuncEmitter<'a> {
    program: &'a Program,
    func: &'a Function,
    alloc: &'a FunctionAlloc,
    palloc: &'a ProgramAlloc,
    bodies: &'a FxHashMap<FuncRef, usize>,
    helpers: &'a mut BTreeSet<&'static str>,
    lines: Vec<AsmLine>,
    labels: u32,
    name: String,
}

impl<'a> FuncEmitter<'a> {
    fn emit(&mut self) {
        let func = self.func;
        self.lines.push(AsmLine::Comment(format!(
            "function {}",
            self.program.sigs[func.func].name
        )));
        self.lines.push(AsmLine::Label(self.name.clone()));
        for (i, &block) in func.layout.iter().enumerate() {
            self.lines.push(AsmLine::Label(self.block_label(block)));
            let data = &func.blocks[block];
            for inst in &data.insts {
                self.emit_inst(inst);
            }
            let next = func.layout.get(i + 1).copied();
            self.emit_term(&data.term, next);
        }
    }

    fn block_label(&self, block: crate::ir::Block) -> String {
        format!("{}__b{}", self.name, block.as_u32())
    }

    fn fresh_label(&mut self) -> String {
        self.labels += 1;
        format!("{}__l{}", self.name, self.labels)
    }

    fn ins(&mut self, op: Op, operand: Operand) {
        self.lines.push(AsmLine::Inst(op, operand));
    }

    fn loc(&self, v: Vreg) -> Loc {
        match self.alloc.locs.get(&v) {
            Some(&loc) => loc,
            // A register with no home is never actually read; give it a
            // throwaway scratch byte so emission stays total.
            None => Loc::Zp(self.palloc.scratch[7]),
        }
    }

    /// Memory place of byte `offset` of `v`. Only meaningful for
    /// memory-resident registers.
    fn place(&self, v: Vreg, offset: u16) -> Place {
        match self.loc(v) {
            Loc::Zp(a) => Place::Addr(u16::from(a) + offset),
            Loc::Slot(i) => Place::Label(self.alloc.slots[i].name.clone(), i32::from(offset)),
            Loc::A | Loc::X | Loc::Y => {
                debug_assert!(false, "{v} is register-resident, not in memory");
                Place::Addr(u16::from(self.palloc.scratch[7]))
            }
        }
    }

    fn mem_place(&self, addr: &MemAddr, offset: u16) -> Place {
        match addr {
            MemAddr::Abs(a) => Place::Addr(a + offset),
            MemAddr::Global(id, off) => self.global_place(*id, off + offset),
            MemAddr::Func(f) => Place::Label(
                mangle(&self.program.sigs[*f].name),
                i32::from(offset),
            ),
        }
    }

    fn global_place(&self, id: GlobalId, offset: u16) -> Place {
        let global = &self.program.globals[id];
        if let Some(&zp) = self.palloc.global_zp.get(&id) {
            return Place::Addr(u16::from(zp) + offset);
        }
        if let Some(addr) = global.addr {
            return Place::Addr(addr + offset);
        }
        Place::Label(mangle(&global.name), i32::from(offset))
    }

    /// Bring the byte value of `v` into the accumulator.
    fn load_a(&mut self, v: Vreg) {
        match self.loc(v) {
            Loc::A => {}
            Loc::X => self.ins(Op::Txa, Operand::None),
            Loc::Y => self.ins(Op::Tya, Operand::None),
            _ => {
                let p = self.place(v, 0);
                self.ins(Op::Lda, Operand::Mem(p));
            }
        }
    }

    /// Store the accumulator into `v`'s home.
    fn store_a(&mut self, v: Vreg) {
        match self.loc(v) {
            Loc::A => {}
            Loc::X => self.ins(Op::Tax, Operand::None),
            Loc::Y => self.ins(Op::Tay, Operand::None),
            _ => {
                let p = self.place(v, 0);
                self.ins(Op::Sta, Operand::Mem(p));
            }
        }
    }

    /// Bring the byte value of `v` into X.
    fn load_x(&mut self, v: Vreg) {
        match self.loc(v) {
            Loc::X => {}
            Loc::A => self.ins(Op::Tax, Operand::None),
            Loc::Y => {
                self.ins(Op::Tya, Operand::None);
                self.ins(Op::Tax, Operand::None);
            }
            _ => {
                let p = self.place(v, 0);
                self.ins(Op::Ldx, Operand::Mem(p));
            }
        }
    }

    /// Copy a word register into a zero-page pair.
    fn word_to_scratch(&mut self, v: Vreg, lo: u8) {
        let src_lo = self.place(v, 0);
        let src_hi = self.place(v, 1);
        self.ins(Op::Lda, Operand::Mem(src_lo));
        self.ins(Op::Sta, Operand::Mem(Place::Addr(u16::from(lo))));
        self.ins(Op::Lda, Operand::Mem(src_hi));
        self.ins(Op::Sta, Operand::Mem(Place::Addr(u16::from(lo) + 1)));
    }

    /// Copy a zero-page pair into a word register.
    fn word_from_scratch(&mut self, lo: u8, v: Vreg) {
        let dst_lo = self.place(v, 0);
        let dst_hi = self.place(v, 1);
        self.ins(Op::Lda, Operand::Mem(Place::Addr(u16::from(lo))));
        self.ins(Op::Sta, Operand::Mem(dst_lo));
        self.ins(Op::Lda, Operand::Mem(Place::Addr(u16::from(lo) + 1)));
        self.ins(Op::Sta, Operand::Mem(dst_hi));
    }

    fn sc(&self, i: usize) -> u8 {
        self.palloc.scratch[i]
    }

    fn emit_inst(&mut self, inst: &Inst) {
        match inst {
            Inst::Const { dst, value, width } => match width {
                Width::Byte => match self.loc(*dst) {
                    Loc::X => self.ins(Op::Ldx, Operand::Imm(*value as u8)),
                    Loc::Y => self.ins(Op::Ldy, Operand::Imm(*value as u8)),
                    _ => {
                        self.ins(Op::Lda, Operand::Imm(*value as u8));
                        self.store_a(*dst);
                    }
                },
                Width::Word => {
                    let lo = self.place(*dst, 0);
                    let hi = self.place(*dst, 1);
                    self.ins(Op::Lda, Operand::Imm((*value & 0xFF) as u8));
                    self.ins(Op::Sta, Operand::Mem(lo));
                    self.ins(Op::Lda, Operand::Imm((*value >> 8) as u8));
                    self.ins(Op::Sta, Operand::Mem(hi));
                }
            },

            Inst::Move { dst, src } => {
                if self.loc(*dst) == self.loc(*src) {
                    return;
                }
                match self.func.width_of(*dst) {
                    Width::Byte => {
                        self.load_a(*src);
                        self.store_a(*dst);
                    }
                    Width::Word => {
                        for half in 0..2u16 {
                            let s = self.place(*src, half);
                            let d = self.place(*dst, half);
                            self.ins(Op::Lda, Operand::Mem(s));
                            self.ins(Op::Sta, Operand::Mem(d));
                        }
                    }
                }
            }

            Inst::Unary {
                op,
                width,
                dst,
                src,
            } => self.emit_unary(*op, *width, *dst, *src),

            Inst::Binary {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => self.emit_binary(*op, *width, *dst, *lhs, *rhs),

            Inst::Cmp {
                cc,
                width,
                dst,
                lhs,
                rhs,
            } => self.emit_cmp(*cc, *width, *dst, *lhs, *rhs),

            Inst::Load {
                dst, addr, width, ..
            } => match width {
                Width::Byte => {
                    let p = self.mem_place(addr, 0);
                    self.ins(Op::Lda, Operand::Mem(p));
                    self.store_a(*dst);
                }
                Width::Word => {
                    for half in 0..2u16 {
                        let s = self.mem_place(addr, half);
                        let d = self.place(*dst, half);
                        self.ins(Op::Lda, Operand::Mem(s));
                        self.ins(Op::Sta, Operand::Mem(d));
                    }
                }
            },

            Inst::Store {
                addr, src, width, ..
            } => match width {
                Width::Byte => {
                    self.load_a(*src);
                    let p = self.mem_place(addr, 0);
                    self.ins(Op::Sta, Operand::Mem(p));
                }
                Width::Word => {
                    for half in 0..2u16 {
                        let s = self.place(*src, half);
                        let d = self.mem_place(addr, half);
                        self.ins(Op::Lda, Operand::Mem(s));
                        self.ins(Op::Sta, Operand::Mem(d));
                    }
                }
            },

            Inst::LoadIndexed {
                dst,
                base,
                index,
                width,
                ..
            } => {
                self.load_x(*index);
                match width {
                    Width::Byte => {
                        let p = self.mem_place(base, 0);
                        self.ins(Op::Lda, Operand::MemX(p));
                        self.store_a(*dst);
                    }
                    Width::Word => {
                        for half in 0..2u16 {
                            let s = self.mem_place(base, half);
                            let d = self.place(*dst, half);
                            self.ins(Op::Lda, Operand::MemX(s));
                            self.ins(Op::Sta, Operand::Mem(d));
                        }
                    }
                }
            }

            Inst::StoreIndexed {
                base,
                index,
                src,
                width,
                ..
            } => {
                self.load_x(*index);
                match width {
                    Width::Byte => {
                        self.load_a(*src);
                        let p = self.mem_place(base, 0);
                        self.ins(Op::Sta, Operand::MemX(p));
                    }
                    Width::Word => {
                        for half in 0..2u16 {
                            let s = self.place(*src, half);
                            let d = self.mem_place(base, half);
                            self.ins(Op::Lda, Operand::Mem(s));
                            self.ins(Op::Sta, Operand::MemX(d));
                        }
                    }
                }
            }

            Inst::AddrOf { dst, target } => {
                let (lo, hi) = self.place_address_halves(target);
                let d_lo = self.place(*dst, 0);
                let d_hi = self.place(*dst, 1);
                self.ins(Op::Lda, lo);
                self.ins(Op::Sta, Operand::Mem(d_lo));
                self.ins(Op::Lda, hi);
                self.ins(Op::Sta, Operand::Mem(d_hi));
            }

            Inst::Call { dst, func, args } => {
                self.emit_call(*func, args);
                match self.func.width_of(*dst) {
                    Width::Byte => self.store_a(*dst),
                    Width::Word => {
                        let sc0 = self.sc(0);
                        self.word_from_scratch(sc0, *dst);
                    }
                }
            }

            Inst::CallVoid { func, args } => self.emit_call(*func, args),

            Inst::Peek { dst, ptr, width } => {
                let zp = self.pointer_to_zp(*ptr);
                self.ins(Op::Ldy, Operand::Imm(0));
                self.ins(Op::Lda, Operand::IndY(zp));
                self.store_a_byte_or_low(*dst);
                if *width == Width::Word {
                    self.ins(Op::Iny, Operand::None);
                    self.ins(Op::Lda, Operand::IndY(zp));
                    let hi = self.place(*dst, 1);
                    self.ins(Op::Sta, Operand::Mem(hi));
                }
            }

            Inst::Poke { ptr, src, width } => {
                let zp = self.pointer_to_zp(*ptr);
                self.ins(Op::Ldy, Operand::Imm(0));
                let s = self.place(*src, 0);
                self.ins(Op::Lda, Operand::Mem(s));
                self.ins(Op::Sta, Operand::IndY(zp));
                if *width == Width::Word {
                    self.ins(Op::Iny, Operand::None);
                    let s = self.place(*src, 1);
                    self.ins(Op::Lda, Operand::Mem(s));
                    self.ins(Op::Sta, Operand::IndY(zp));
                }
            }

            Inst::Zext { dst, src } => {
                self.load_a(*src);
                let lo = self.place(*dst, 0);
                self.ins(Op::Sta, Operand::Mem(lo));
                self.ins(Op::Lda, Operand::Imm(0));
                let hi = self.place(*dst, 1);
                self.ins(Op::Sta, Operand::Mem(hi));
            }

            Inst::Lo { dst, src } => {
                let s = self.place(*src, 0);
                self.ins(Op::Lda, Operand::Mem(s));
                self.store_a(*dst);
            }

            Inst::Hi { dst, src } => {
                let s = self.place(*src, 1);
                self.ins(Op::Lda, Operand::Mem(s));
                self.store_a(*dst);
            }

            Inst::Cpu(op) => {
                let op = match op {
                    CpuOp::Sei => Op::Sei,
                    CpuOp::Cli => Op::Cli,
                    CpuOp::Nop => Op::Nop,
                    CpuOp::Brk => Op::Brk,
                    CpuOp::Pha => Op::Pha,
                    CpuOp::Pla => Op::Pla,
                    CpuOp::Php => Op::Php,
                    CpuOp::Plp => Op::Plp,
                };
                self.ins(op, Operand::None);
            }

            Inst::Barrier => self.lines.push(AsmLine::Comment("barrier".to_string())),

            Inst::InlineAsm(lines) => {
                for line in lines {
                    self.lines.push(AsmLine::Raw(line.clone()));
                }
            }
        }
    }

    /// `store_a` for byte destinations, low half for word destinations.
    fn store_a_byte_or_low(&mut self, dst: Vreg) {
        match self.func.width_of(dst) {
            Width::Byte => self.store_a(dst),
            Width::Word => {
                let p = self.place(dst, 0);
                self.ins(Op::Sta, Operand::Mem(p));
            }
        }
    }

    /// Immediate operands for the low and high halves of an address.
    fn place_address_halves(&mut self, target: &MemAddr) -> (Operand, Operand) {
        match self.mem_place(target, 0) {
            Place::Addr(a) => (
                Operand::Imm((a & 0xFF) as u8),
                Operand::Imm((a >> 8) as u8),
            ),
            Place::Label(name, 0) => (Operand::ImmLo(name.clone()), Operand::ImmHi(name)),
            Place::Label(name, off) => {
                // Offsets into labeled data keep the arithmetic in the
                // assembler via lo/hi of the shifted label.
                let shifted = format!("{name}+{off}");
                (Operand::ImmLo(shifted.clone()), Operand::ImmHi(shifted))
            }
        }
    }

    /// Ensure a word pointer is in a zero-page pair; returns its address.
    fn pointer_to_zp(&mut self, ptr: Vreg) -> u8 {
        match self.loc(ptr) {
            Loc::Zp(a) => a,
            _ => {
                let sc4 = self.sc(4);
                self.word_to_scratch(ptr, sc4);
                sc4
            }
        }
    }

    fn emit_unary(&mut self, op: UnaryOp, width: Width, dst: Vreg, src: Vreg) {
        match (op, width) {
            (UnaryOp::Neg, Width::Byte) => {
                let s = self.park_byte(src);
                self.ins(Op::Lda, Operand::Imm(0));
                self.ins(Op::Sec, Operand::None);
                self.ins(Op::Sbc, Operand::Mem(s));
                self.store_a(dst);
            }
            (UnaryOp::Neg, Width::Word) => {
                self.ins(Op::Sec, Operand::None);
                for half in 0..2u16 {
                    self.ins(Op::Lda, Operand::Imm(0));
                    let s = self.place(src, half);
                    self.ins(Op::Sbc, Operand::Mem(s));
                    let d = self.place(dst, half);
                    self.ins(Op::Sta, Operand::Mem(d));
                }
            }
            (UnaryOp::BitNot, Width::Byte) => {
                self.load_a(src);
                self.ins(Op::Eor, Operand::Imm(0xFF));
                self.store_a(dst);
            }
            (UnaryOp::BitNot, Width::Word) => {
                for half in 0..2u16 {
                    let s = self.place(src, half);
                    self.ins(Op::Lda, Operand::Mem(s));
                    self.ins(Op::Eor, Operand::Imm(0xFF));
                    let d = self.place(dst, half);
                    self.ins(Op::Sta, Operand::Mem(d));
                }
            }
            (UnaryOp::Not, _) => {
                // not(0) = 1, not(x) = 0.
                self.load_a(src);
                let one = self.fresh_label();
                let done = self.fresh_label();
                self.ins(Op::Beq, Operand::Rel(one.clone()));
                self.ins(Op::Lda, Operand::Imm(0));
                self.ins(Op::Jmp, Operand::Mem(Place::Label(done.clone(), 0)));
                self.lines.push(AsmLine::Label(one));
                self.ins(Op::Lda, Operand::Imm(1));
                self.lines.push(AsmLine::Label(done));
                self.store_a(dst);
            }
        }
    }

    /// The memory place of a byte operand, parking register-resident
    /// values in scratch so the ALU form always has a memory operand.
    /// Must run before anything clobbers A.
    fn park_byte(&mut self, v: Vreg) -> Place {
        let sc = Place::Addr(u16::from(self.sc(6)));
        match self.loc(v) {
            Loc::A => {
                self.ins(Op::Sta, Operand::Mem(sc.clone()));
                sc
            }
            Loc::X => {
                self.ins(Op::Stx, Operand::Mem(sc.clone()));
                sc
            }
            Loc::Y => {
                self.ins(Op::Sty, Operand::Mem(sc.clone()));
                sc
            }
            _ => self.place(v, 0),
        }
    }

    fn emit_binary(&mut self, op: AluOp, width: Width, dst: Vreg, lhs: Vreg, rhs: Vreg) {
        use AluOp::*;
        match (op, width) {
            (Add | Sub | And | Or | Xor, Width::Byte) => {
                let alu = match op {
                    Add => Op::Adc,
                    Sub => Op::Sbc,
                    And => Op::And,
                    Or => Op::Ora,
                    _ => Op::Eor,
                };
                let rhs_place = self.park_byte(rhs);
                self.load_a(lhs);
                match op {
                    Add => self.ins(Op::Clc, Operand::None),
                    Sub => self.ins(Op::Sec, Operand::None),
                    _ => {}
                }
                self.ins(alu, Operand::Mem(rhs_place));
                self.store_a(dst);
            }
            (Add | Sub | And | Or | Xor, Width::Word) => {
                let alu = match op {
                    Add => Op::Adc,
                    Sub => Op::Sbc,
                    And => Op::And,
                    Or => Op::Ora,
                    _ => Op::Eor,
                };
                match op {
                    Add => self.ins(Op::Clc, Operand::None),
                    Sub => self.ins(Op::Sec, Operand::None),
                    _ => {}
                }
                for half in 0..2u16 {
                    let l = self.place(lhs, half);
                    let r = self.place(rhs, half);
                    let d = self.place(dst, half);
                    self.ins(Op::Lda, Operand::Mem(l));
                    self.ins(alu, Operand::Mem(r));
                    self.ins(Op::Sta, Operand::Mem(d));
                }
            }
            (Shl | Shr, Width::Byte) => {
                let helper = if op == Shl { "rt_shl8" } else { "rt_shr8" };
                self.helpers.insert(helper);
                self.load_x(rhs);
                self.load_a(lhs);
                self.ins(Op::Jsr, Operand::Mem(Place::Label(helper.to_string(), 0)));
                self.store_a(dst);
            }
            (Shl | Shr, Width::Word) => {
                let helper = if op == Shl { "rt_shl16" } else { "rt_shr16" };
                self.helpers.insert(helper);
                let sc0 = self.sc(0);
                self.word_to_scratch(lhs, sc0);
                // The shift count is the low byte of the right operand.
                let count = self.place(rhs, 0);
                self.ins(Op::Ldx, Operand::Mem(count));
                self.ins(Op::Jsr, Operand::Mem(Place::Label(helper.to_string(), 0)));
                self.word_from_scratch(sc0, dst);
            }
            (Mul, Width::Byte) => {
                self.helpers.insert("rt_mul8");
                let sc0 = self.sc(0);
                self.load_a(rhs);
                self.ins(Op::Sta, Operand::Mem(Place::Addr(u16::from(sc0))));
                self.load_a(lhs);
                self.ins(Op::Jsr, Operand::Mem(Place::Label("rt_mul8".to_string(), 0)));
                self.store_a(dst);
            }
            (Div | Rem, Width::Byte) => {
                self.helpers.insert("rt_divmod8");
                let sc0 = self.sc(0);
                self.load_a(rhs);
                self.ins(Op::Sta, Operand::Mem(Place::Addr(u16::from(sc0))));
                self.load_a(lhs);
                self.ins(
                    Op::Jsr,
                    Operand::Mem(Place::Label("rt_divmod8".to_string(), 0)),
                );
                // Quotient comes back in scratch 1, remainder in A.
                if op == Div {
                    let sc1 = self.sc(1);
                    self.ins(Op::Lda, Operand::Mem(Place::Addr(u16::from(sc1))));
                }
                self.store_a(dst);
            }
            (Mul, Width::Word) => {
                self.helpers.insert("rt_mul16");
                let (sc0, sc2) = (self.sc(0), self.sc(2));
                self.word_to_scratch(lhs, sc0);
                self.word_to_scratch(rhs, sc2);
                self.ins(Op::Jsr, Operand::Mem(Place::Label("rt_mul16".to_string(), 0)));
                self.word_from_scratch(sc0, dst);
            }
            (Div | Rem, Width::Word) => {
                self.helpers.insert("rt_divmod16");
                let (sc0, sc2) = (self.sc(0), self.sc(2));
                self.word_to_scratch(lhs, sc0);
                self.word_to_scratch(rhs, sc2);
                self.ins(
                    Op::Jsr,
                    Operand::Mem(Place::Label("rt_divmod16".to_string(), 0)),
                );
                // Quotient in scratch 0/1, remainder in scratch 4/5.
                let result = if op == Div { self.sc(0) } else { self.sc(4) };
                self.word_from_scratch(result, dst);
            }
        }
    }

    fn emit_cmp(&mut self, cc: Cond, width: Width, dst: Vreg, lhs: Vreg, rhs: Vreg) {
        // Reduce to a carry/zero test: C set means "first >= second".
        let (first, second, branch) = match cc {
            Cond::Eq => (lhs, rhs, Op::Beq),
            Cond::Ne => (lhs, rhs, Op::Bne),
            Cond::Lt => (lhs, rhs, Op::Bcc),
            Cond::Ge => (lhs, rhs, Op::Bcs),
            // a > b  <=>  b < a;  a <= b  <=>  b >= a.
            Cond::Gt => (rhs, lhs, Op::Bcc),
            Cond::Le => (rhs, lhs, Op::Bcs),
        };
        match width {
            Width::Byte => {
                let second_place = self.park_byte(second);
                self.load_a(first);
                self.ins(Op::Cmp, Operand::Mem(second_place));
            }
            Width::Word => {
                self.helpers.insert("rt_cmp16");
                let (sc0, sc2) = (self.sc(0), self.sc(2));
                self.word_to_scratch(first, sc0);
                self.word_to_scratch(second, sc2);
                self.ins(Op::Jsr, Operand::Mem(Place::Label("rt_cmp16".to_string(), 0)));
            }
        }
        let truthy = self.fresh_label();
        let done = self.fresh_label();
        self.ins(branch, Operand::Rel(truthy.clone()));
        self.ins(Op::Lda, Operand::Imm(0));
        self.ins(Op::Jmp, Operand::Mem(Place::Label(done.clone(), 0)));
        self.lines.push(AsmLine::Label(truthy));
        self.ins(Op::Lda, Operand::Imm(1));
        self.lines.push(AsmLine::Label(done));
        self.store_a(dst);
    }

    fn emit_call(&mut self, callee: FuncRef, args: &[Vreg]) {
        // Arguments go into the callee's parameter homes; the callee's
        // body reads them from there.
        if let Some(&body) = self.bodies.get(&callee) {
            let palloc = self.palloc;
            let target: Vec<Vreg> = self.program.functions[body].params.clone();
            let target_alloc = &palloc.funcs[body];
            for (&arg, &param) in args.iter().zip(&target) {
                let Some(&ploc) = target_alloc.locs.get(&param) else {
                    continue; // unused parameter
                };
                let param_place = |offset: u16| match ploc {
                    Loc::Zp(a) => Place::Addr(u16::from(a) + offset),
                    Loc::Slot(i) => Place::Label(
                        target_alloc.slots[i].name.clone(),
                        i32::from(offset),
                    ),
                    _ => Place::Addr(0),
                };
                match self.func.width_of(arg) {
                    Width::Byte => {
                        self.load_a(arg);
                        self.ins(Op::Sta, Operand::Mem(param_place(0)));
                    }
                    Width::Word => {
                        for half in 0..2u16 {
                            let s = self.place(arg, half);
                            self.ins(Op::Lda, Operand::Mem(s));
                            self.ins(Op::Sta, Operand::Mem(param_place(half)));
                        }
                    }
                }
            }
        }
        let name = mangle(&self.program.sigs[callee].name);
        self.ins(Op::Jsr, Operand::Mem(Place::Label(name, 0)));
    }

    fn emit_term(&mut self, term: &Term, next: Option<crate::ir::Block>) {
        match term {
            Term::Jump(target) => {
                if next != Some(*target) {
                    let label = self.block_label(*target);
                    self.ins(Op::Jmp, Operand::Mem(Place::Label(label, 0)));
                }
            }
            Term::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.load_a(*cond);
                // LDA/TXA set Z from the value; branch directly on it.
                let then_label = self.block_label(*then_block);
                self.ins(Op::Bne, Operand::Rel(then_label));
                if next != Some(*else_block) {
                    let else_label = self.block_label(*else_block);
                    self.ins(Op::Jmp, Operand::Mem(Place::Label(else_label, 0)));
                }
            }
            Term::JumpTable {
                index,
                base,
                targets,
                default,
            } => {
                // Bounds test, then the classic push-and-RTS dispatch.
                self.load_a(*index);
                if *base != 0 {
                    self.ins(Op::Sec, Operand::None);
                    self.ins(Op::Sbc, Operand::Imm((*base & 0xFF) as u8));
                }
                self.ins(Op::Cmp, Operand::Imm(targets.len() as u8));
                let default_label = self.block_label(*default);
                self.ins(Op::Bcs, Operand::Rel(default_label));
                self.ins(Op::Asl, Operand::None);
                self.ins(Op::Tax, Operand::None);
                let table = self.fresh_label();
                self.ins(Op::Lda, Operand::MemX(Place::Label(table.clone(), 1)));
                self.ins(Op::Pha, Operand::None);
                self.ins(Op::Lda, Operand::MemX(Place::Label(table.clone(), 0)));
                self.ins(Op::Pha, Operand::None);
                self.ins(Op::Rts, Operand::None);
                self.lines.push(AsmLine::Label(table));
                let entries: Vec<(String, i32)> = targets
                    .iter()
                    .map(|&b| (self.block_label(b), -1))
                    .collect();
                self.lines.push(AsmLine::Words(entries));
            }
            Term::Return(value) => {
                match value {
                    Some(v) => match self.func.width_of(*v) {
                        Width::Byte => self.load_a(*v),
                        Width::Word => {
                            let sc0 = self.sc(0);
                            self.word_to_scratch(*v, sc0);
                        }
                    },
                    None => {}
                }
                self.ins(Op::Rts, Operand::None);
            }
            Term::None => {
                // The verifier rejects this before emission.
                debug_assert!(false, "unterminated block reached emission");
                self.ins(Op::Rts, Operand::None);
            }
        }
    }
}

/// Append the bodies of the helpers in `used`, in name order.
fn runtime_helpers(used: &BTreeSet<&'static str>, scratch: [u8; 8], code: &mut Vec<AsmLine>) {
    let sc = |i: usize| Place::Addr(u16::from(scratch[i]));
    let label = |code: &mut Vec<AsmLine>, l: &str| code.push(AsmLine::Label(l.to_string()));
    let ins = |code: &mut Vec<AsmLine>, op: Op, operand: Operand| {
        code.push(AsmLine::Inst(op, operand))
    };

    for &helper in used {
        code.push(AsmLine::Comment(format!("runtime helper {helper}")));
        match helper {
            "rt_shl8" | "rt_shr8" => {
                let shift = if helper == "rt_shl8" { Op::Asl } else { Op::Lsr };
                let loop_l = format!("{helper}_loop");
                let done_l = format!("{helper}_done");
                label(code, helper);
                ins(code, Op::Cpx, Operand::Imm(0));
                ins(code, Op::Beq, Operand::Rel(done_l.clone()));
                label(code, &loop_l);
                ins(code, shift, Operand::None);
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel(loop_l.clone()));
                label(code, &done_l);
                ins(code, Op::Rts, Operand::None);
            }
            "rt_shl16" | "rt_shr16" => {
                let loop_l = format!("{helper}_loop");
                let done_l = format!("{helper}_done");
                label(code, helper);
                ins(code, Op::Cpx, Operand::Imm(0));
                ins(code, Op::Beq, Operand::Rel(done_l.clone()));
                label(code, &loop_l);
                if helper == "rt_shl16" {
                    ins(code, Op::Asl, Operand::Mem(sc(0)));
                    ins(code, Op::Rol, Operand::Mem(sc(1)));
                } else {
                    ins(code, Op::Lsr, Operand::Mem(sc(1)));
                    ins(code, Op::Ror, Operand::Mem(sc(0)));
                }
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel(loop_l.clone()));
                label(code, &done_l);
                ins(code, Op::Rts, Operand::None);
            }
            "rt_mul8" => {
                // a * sc0 -> a, shift-and-add over eight bits.
                label(code, "rt_mul8");
                ins(code, Op::Sta, Operand::Mem(sc(1)));
                ins(code, Op::Lda, Operand::Imm(0));
                ins(code, Op::Ldx, Operand::Imm(8));
                label(code, "rt_mul8_loop");
                ins(code, Op::Lsr, Operand::Mem(sc(0)));
                ins(code, Op::Bcc, Operand::Rel("rt_mul8_skip".to_string()));
                ins(code, Op::Clc, Operand::None);
                ins(code, Op::Adc, Operand::Mem(sc(1)));
                label(code, "rt_mul8_skip");
                ins(code, Op::Asl, Operand::Mem(sc(1)));
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel("rt_mul8_loop".to_string()));
                ins(code, Op::Rts, Operand::None);
            }
            "rt_divmod8" => {
                // a / sc0: quotient -> sc1, remainder -> a.
                label(code, "rt_divmod8");
                ins(code, Op::Sta, Operand::Mem(sc(1)));
                ins(code, Op::Lda, Operand::Imm(0));
                ins(code, Op::Ldx, Operand::Imm(8));
                label(code, "rt_divmod8_loop");
                ins(code, Op::Asl, Operand::Mem(sc(1)));
                ins(code, Op::Rol, Operand::None);
                ins(code, Op::Cmp, Operand::Mem(sc(0)));
                ins(code, Op::Bcc, Operand::Rel("rt_divmod8_skip".to_string()));
                ins(code, Op::Sbc, Operand::Mem(sc(0)));
                ins(code, Op::Inc, Operand::Mem(sc(1)));
                label(code, "rt_divmod8_skip");
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel("rt_divmod8_loop".to_string()));
                ins(code, Op::Rts, Operand::None);
            }
            "rt_mul16" => {
                // sc0/1 * sc2/3 -> sc0/1 (low 16 bits).
                label(code, "rt_mul16");
                ins(code, Op::Lda, Operand::Imm(0));
                ins(code, Op::Sta, Operand::Mem(sc(4)));
                ins(code, Op::Sta, Operand::Mem(sc(5)));
                ins(code, Op::Ldx, Operand::Imm(16));
                label(code, "rt_mul16_loop");
                ins(code, Op::Lsr, Operand::Mem(sc(3)));
                ins(code, Op::Ror, Operand::Mem(sc(2)));
                ins(code, Op::Bcc, Operand::Rel("rt_mul16_skip".to_string()));
                ins(code, Op::Clc, Operand::None);
                ins(code, Op::Lda, Operand::Mem(sc(4)));
                ins(code, Op::Adc, Operand::Mem(sc(0)));
                ins(code, Op::Sta, Operand::Mem(sc(4)));
                ins(code, Op::Lda, Operand::Mem(sc(5)));
                ins(code, Op::Adc, Operand::Mem(sc(1)));
                ins(code, Op::Sta, Operand::Mem(sc(5)));
                label(code, "rt_mul16_skip");
                ins(code, Op::Asl, Operand::Mem(sc(0)));
                ins(code, Op::Rol, Operand::Mem(sc(1)));
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel("rt_mul16_loop".to_string()));
                ins(code, Op::Lda, Operand::Mem(sc(4)));
                ins(code, Op::Sta, Operand::Mem(sc(0)));
                ins(code, Op::Lda, Operand::Mem(sc(5)));
                ins(code, Op::Sta, Operand::Mem(sc(1)));
                ins(code, Op::Rts, Operand::None);
            }
            "rt_divmod16" => {
                // sc0/1 / sc2/3: quotient -> sc0/1, remainder -> sc4/5.
                label(code, "rt_divmod16");
                ins(code, Op::Lda, Operand::Imm(0));
                ins(code, Op::Sta, Operand::Mem(sc(4)));
                ins(code, Op::Sta, Operand::Mem(sc(5)));
                ins(code, Op::Ldx, Operand::Imm(16));
                label(code, "rt_divmod16_loop");
                ins(code, Op::Asl, Operand::Mem(sc(0)));
                ins(code, Op::Rol, Operand::Mem(sc(1)));
                ins(code, Op::Rol, Operand::Mem(sc(4)));
                ins(code, Op::Rol, Operand::Mem(sc(5)));
                ins(code, Op::Lda, Operand::Mem(sc(4)));
                ins(code, Op::Sec, Operand::None);
                ins(code, Op::Sbc, Operand::Mem(sc(2)));
                ins(code, Op::Tay, Operand::None);
                ins(code, Op::Lda, Operand::Mem(sc(5)));
                ins(code, Op::Sbc, Operand::Mem(sc(3)));
                ins(code, Op::Bcc, Operand::Rel("rt_divmod16_skip".to_string()));
                ins(code, Op::Sta, Operand::Mem(sc(5)));
                ins(code, Op::Sty, Operand::Mem(sc(4)));
                ins(code, Op::Inc, Operand::Mem(sc(0)));
                label(code, "rt_divmod16_skip");
                ins(code, Op::Dex, Operand::None);
                ins(code, Op::Bne, Operand::Rel("rt_divmod16_loop".to_string()));
                ins(code, Op::Rts, Operand::None);
            }
            "rt_cmp16" => {
                // Flags of sc0/1 cmp sc2/3, as CMP leaves them.
                label(code, "rt_cmp16");
                ins(code, Op::Lda, Operand::Mem(sc(1)));
                ins(code, Op::Cmp, Operand::Mem(sc(3)));
                ins(code, Op::Bne, Operand::Rel("rt_cmp16_done".to_string()));
                ins(code, Op::Lda, Operand::Mem(sc(0)));
                ins(code, Op::Cmp, Operand::Mem(sc(2)));
                label(code, "rt_cmp16_done");
                ins(code, Op::Rts, Operand::None);
            }
            other => unreachable!("unknown helper {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncSig, FunctionBuilder};
    use crate::regalloc::allocate;
    use crate::settings::Target;

    fn emit_one(build: impl FnOnce(&mut FunctionBuilder)) -> Vec<String> {
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
        let map = Target::C64.memory_map();
        let alloc = allocate(&program, map, Target::C64.zero_page_budget(), &[]);
        let options = CompileOptions::default();
        let result = emit_program(&program, &alloc, &options);
        result.code.iter().map(|l| l.to_string()).collect()
    }

    fn text(lines: &[String]) -> String {
        lines.join("\n")
    }

    #[test]
    fn store_to_hardware_register() {
        let lines = emit_one(|b| {
            let v = b.iconst(0, Width::Byte);
            b.store(MemAddr::Abs(0xD020), v, Width::Byte, true);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        assert!(t.contains("sta $d020"), "{t}");
        assert!(t.contains("rts"));
    }

    #[test]
    fn word_store_is_little_endian_order() {
        let lines = emit_one(|b| {
            let v = b.iconst(0x1234, Width::Word);
            b.store(MemAddr::Abs(0x0400), v, Width::Word, false);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        let lo = t.find("sta $0400").expect("low byte store");
        let hi = t.find("sta $0401").expect("high byte store");
        assert!(lo < hi, "low byte must be stored first:\n{t}");
        assert!(t.contains("lda #$34"));
        assert!(t.contains("lda #$12"));
    }

    #[test]
    fn indexed_load_uses_x() {
        let lines = emit_one(|b| {
            let i = b.iconst(3, Width::Byte);
            let v = b.load_indexed(MemAddr::Abs(0x2000), i, Width::Byte, false);
            b.store(MemAddr::Abs(0xD021), v, Width::Byte, true);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        assert!(t.contains("ldx #$03"), "index should go through X:\n{t}");
        assert!(t.contains("lda $2000,x"), "{t}");
    }

    #[test]
    fn indirect_access_uses_ind_y() {
        let lines = emit_one(|b| {
            let ptr = b.iconst(0xD020, Width::Word);
            let v = b.peek(ptr, Width::Byte);
            b.store(MemAddr::Abs(0x0400), v, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        assert!(t.contains("ldy #$00"), "{t}");
        assert!(t.contains("),y"), "indirect mode expected:\n{t}");
    }

    #[test]
    fn helpers_appear_once_and_only_when_used() {
        let lines = emit_one(|b| {
            let x = b.iconst(10, Width::Byte);
            let y = b.iconst(3, Width::Byte);
            let p = b.binary(AluOp::Mul, Width::Byte, x, y);
            let q = b.binary(AluOp::Mul, Width::Byte, p, y);
            b.store(MemAddr::Abs(0x0400), q, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        assert_eq!(t.matches("rt_mul8:").count(), 1, "{t}");
        assert!(!t.contains("rt_divmod8:"));
        assert_eq!(t.matches("jsr rt_mul8").count(), 2);
    }

    #[test]
    fn cpu_intrinsics_are_single_instructions() {
        let lines = emit_one(|b| {
            b.cpu(CpuOp::Sei);
            b.cpu(CpuOp::Nop);
            b.cpu(CpuOp::Cli);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        let sei = t.find("    sei").unwrap();
        let nop = t.find("    nop").unwrap();
        let cli = t.find("    cli").unwrap();
        assert!(sei < nop && nop < cli);
    }

    #[test]
    fn zero_page_stores_render_as_zero_page() {
        let lines = emit_one(|b| {
            let v = b.iconst(1, Width::Byte);
            b.store(MemAddr::Abs(0x02), v, Width::Byte, false);
            b.terminate(Term::Return(None));
        });
        let t = text(&lines);
        assert!(t.contains("sta $02"), "{t}");
        assert!(!t.contains("sta $0002"));
    }
}
