//! A cursor-style builder for IL functions.
//!
//! The IL generator drives one of these per function: create blocks,
//! switch between them, append instructions and seal terminators. The
//! builder enforces the structural invariant at the source: appending to
//! a terminated block or re-terminating a block is a bug in the caller.

use super::{
    AluOp, Block, BlockData, Cond, CpuOp, FuncRef, Function, Inst, MemAddr, Term, UnaryOp, Vreg,
    Width,
};

/// Builder over one [`Function`].
pub struct FunctionBuilder<'a> {
    func: &'a mut Function,
    current: Block,
}

impl<'a> FunctionBuilder<'a> {
    /// Start building `func`. Creates and enters the entry block.
    pub fn new(func: &'a mut Function) -> Self {
        debug_assert!(func.layout.is_empty(), "function already built");
        let entry = func.blocks.push(BlockData::default());
        func.layout.push(entry);
        Self {
            func,
            current: entry,
        }
    }

    /// The block instructions are currently appended to.
    pub fn current_block(&self) -> Block {
        self.current
    }

    /// Allocate a fresh virtual register of the given width.
    pub fn new_vreg(&mut self, width: Width) -> Vreg {
        self.func.vreg_widths.push(width)
    }

    /// Width of an already-created register.
    pub fn width_of(&self, vreg: Vreg) -> Width {
        self.func.vreg_widths[vreg]
    }

    /// Create a new block without entering it.
    pub fn create_block(&mut self) -> Block {
        let block = self.func.blocks.push(BlockData::default());
        self.func.layout.push(block);
        block
    }

    /// Continue appending into `block`.
    pub fn switch_to_block(&mut self, block: Block) {
        self.current = block;
    }

    /// Whether the current block already has its terminator.
    pub fn is_terminated(&self) -> bool {
        !matches!(self.func.blocks[self.current].term, Term::None)
    }

    /// Append an instruction to the current block.
    pub fn ins(&mut self, inst: Inst) {
        debug_assert!(
            !self.is_terminated(),
            "appending to a terminated block {}",
            self.current
        );
        self.func.blocks[self.current].insts.push(inst);
    }

    /// Seal the current block with `term`.
    pub fn terminate(&mut self, term: Term) {
        debug_assert!(
            !self.is_terminated(),
            "block {} already has a terminator",
            self.current
        );
        self.func.blocks[self.current].term = term;
    }

    /// Seal with a jump unless the block is already terminated. Used when
    /// control falls off the end of a lowered construct.
    pub fn jump_if_open(&mut self, to: Block) {
        if !self.is_terminated() {
            self.terminate(Term::Jump(to));
        }
    }

    // ---- instruction shorthands -----------------------------------------

    /// `dst = value`, returning the new register.
    pub fn iconst(&mut self, value: u16, width: Width) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::Const { dst, value, width });
        dst
    }

    /// `dst = src`.
    pub fn mov(&mut self, dst: Vreg, src: Vreg) {
        self.ins(Inst::Move { dst, src });
    }

    /// `lhs op rhs` into a fresh register.
    pub fn binary(&mut self, op: AluOp, width: Width, lhs: Vreg, rhs: Vreg) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::Binary {
            op,
            width,
            dst,
            lhs,
            rhs,
        });
        dst
    }

    /// `op src` into a fresh register.
    pub fn unary(&mut self, op: UnaryOp, width: Width, src: Vreg) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::Unary {
            op,
            width,
            dst,
            src,
        });
        dst
    }

    /// `lhs cc rhs` into a fresh 0/1 byte register.
    pub fn cmp(&mut self, cc: Cond, width: Width, lhs: Vreg, rhs: Vreg) -> Vreg {
        let dst = self.new_vreg(Width::Byte);
        self.ins(Inst::Cmp {
            cc,
            width,
            dst,
            lhs,
            rhs,
        });
        dst
    }

    /// Load from `addr` into a fresh register.
    pub fn load(&mut self, addr: MemAddr, width: Width, volatile: bool) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::Load {
            dst,
            addr,
            width,
            volatile,
        });
        dst
    }

    /// Store `src` to `addr`.
    pub fn store(&mut self, addr: MemAddr, src: Vreg, width: Width, volatile: bool) {
        self.ins(Inst::Store {
            addr,
            src,
            width,
            volatile,
        });
    }

    /// Indexed load `base[index]` into a fresh register.
    pub fn load_indexed(
        &mut self,
        base: MemAddr,
        index: Vreg,
        width: Width,
        volatile: bool,
    ) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::LoadIndexed {
            dst,
            base,
            index,
            width,
            volatile,
        });
        dst
    }

    /// Indexed store `base[index] = src`.
    pub fn store_indexed(
        &mut self,
        base: MemAddr,
        index: Vreg,
        src: Vreg,
        width: Width,
        volatile: bool,
    ) {
        self.ins(Inst::StoreIndexed {
            base,
            index,
            src,
            width,
            volatile,
        });
    }

    /// Materialize the address of `target` into a fresh word register.
    pub fn addr_of(&mut self, target: MemAddr) -> Vreg {
        let dst = self.new_vreg(Width::Word);
        self.ins(Inst::AddrOf { dst, target });
        dst
    }

    /// Call with a result, into a fresh register of the given width.
    pub fn call(&mut self, func: FuncRef, args: Vec<Vreg>, ret: Width) -> Vreg {
        let dst = self.new_vreg(ret);
        self.ins(Inst::Call { dst, func, args });
        dst
    }

    /// Call without a result.
    pub fn call_void(&mut self, func: FuncRef, args: Vec<Vreg>) {
        self.ins(Inst::CallVoid { func, args });
    }

    /// Indirect load through a pointer register.
    pub fn peek(&mut self, ptr: Vreg, width: Width) -> Vreg {
        let dst = self.new_vreg(width);
        self.ins(Inst::Peek { dst, ptr, width });
        dst
    }

    /// Indirect store through a pointer register.
    pub fn poke(&mut self, ptr: Vreg, src: Vreg, width: Width) {
        self.ins(Inst::Poke { ptr, src, width });
    }

    /// Zero-extend a byte to a word.
    pub fn zext(&mut self, src: Vreg) -> Vreg {
        let dst = self.new_vreg(Width::Word);
        self.ins(Inst::Zext { dst, src });
        dst
    }

    /// Low byte of a word.
    pub fn lo(&mut self, src: Vreg) -> Vreg {
        let dst = self.new_vreg(Width::Byte);
        self.ins(Inst::Lo { dst, src });
        dst
    }

    /// High byte of a word.
    pub fn hi(&mut self, src: Vreg) -> Vreg {
        let dst = self.new_vreg(Width::Byte);
        self.ins(Inst::Hi { dst, src });
        dst
    }

    /// A single-instruction CPU intrinsic.
    pub fn cpu(&mut self, op: CpuOp) {
        self.ins(Inst::Cpu(op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_straight_line() {
        let mut func = Function::new(FuncRef::from_u32(0));
        let mut b = FunctionBuilder::new(&mut func);
        let one = b.iconst(1, Width::Byte);
        let two = b.iconst(2, Width::Byte);
        let sum = b.binary(AluOp::Add, Width::Byte, one, two);
        b.terminate(Term::Return(Some(sum)));

        assert_eq!(func.layout.len(), 1);
        let entry = func.entry();
        assert_eq!(func.blocks[entry].insts.len(), 3);
        assert!(matches!(func.blocks[entry].term, Term::Return(Some(_))));
        assert_eq!(func.num_vregs(), 3);
    }

    #[test]
    fn diamond() {
        let mut func = Function::new(FuncRef::from_u32(0));
        let mut b = FunctionBuilder::new(&mut func);
        let cond = b.iconst(1, Width::Byte);
        let then_block = b.create_block();
        let else_block = b.create_block();
        let join = b.create_block();
        b.terminate(Term::Branch {
            cond,
            then_block,
            else_block,
        });
        b.switch_to_block(then_block);
        b.terminate(Term::Jump(join));
        b.switch_to_block(else_block);
        b.terminate(Term::Jump(join));
        b.switch_to_block(join);
        b.terminate(Term::Return(None));

        for &block in &func.layout {
            assert!(!matches!(func.blocks[block].term, Term::None));
        }
    }

    #[test]
    fn jump_if_open_respects_existing_terminator() {
        let mut func = Function::new(FuncRef::from_u32(0));
        let mut b = FunctionBuilder::new(&mut func);
        let target = b.create_block();
        b.terminate(Term::Return(None));
        b.jump_if_open(target);
        assert!(matches!(
            func.blocks[func.entry()].term,
            Term::Return(None)
        ));
    }
}
