//! Documented 6502 opcode encodings.
//!
//! One row per (mnemonic, addressing mode) pair: opcode byte, size and
//! base cycle count. Undocumented opcodes are absent by construction;
//! `encode` returning `None` for a combination means the combination does
//! not exist on the CPU and the selector may not use it.

use super::Op;

/// Addressing modes as the encoder sees them.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    /// No operand byte (includes accumulator forms).
    Implied,
    /// `#$nn`
    Immediate,
    /// `$nn`
    ZeroPage,
    /// `$nn,x`
    ZeroPageX,
    /// `$nn,y`
    ZeroPageY,
    /// `$nnnn`
    Absolute,
    /// `$nnnn,x`
    AbsoluteX,
    /// `$nnnn,y`
    AbsoluteY,
    /// `($nnnn)` — `jmp` only.
    Indirect,
    /// `($nn,x)`
    IndirectX,
    /// `($nn),y`
    IndirectY,
    /// Branch target, one signed byte.
    Relative,
}

impl Mode {
    /// Instruction size in bytes for this mode.
    pub fn size(self) -> u16 {
        match self {
            Mode::Implied => 1,
            Mode::Immediate
            | Mode::ZeroPage
            | Mode::ZeroPageX
            | Mode::ZeroPageY
            | Mode::IndirectX
            | Mode::IndirectY
            | Mode::Relative => 2,
            Mode::Absolute | Mode::AbsoluteX | Mode::AbsoluteY | Mode::Indirect => 3,
        }
    }
}

/// The opcode byte for `(op, mode)`, if the CPU has it.
pub fn encode(op: Op, mode: Mode) -> Option<u8> {
    use Mode::*;
    use Op::*;
    Some(match (op, mode) {
        // Load/store.
        (Lda, Immediate) => 0xA9,
        (Lda, ZeroPage) => 0xA5,
        (Lda, ZeroPageX) => 0xB5,
        (Lda, Absolute) => 0xAD,
        (Lda, AbsoluteX) => 0xBD,
        (Lda, AbsoluteY) => 0xB9,
        (Lda, IndirectX) => 0xA1,
        (Lda, IndirectY) => 0xB1,
        (Ldx, Immediate) => 0xA2,
        (Ldx, ZeroPage) => 0xA6,
        (Ldx, ZeroPageY) => 0xB6,
        (Ldx, Absolute) => 0xAE,
        (Ldx, AbsoluteY) => 0xBE,
        (Ldy, Immediate) => 0xA0,
        (Ldy, ZeroPage) => 0xA4,
        (Ldy, ZeroPageX) => 0xB4,
        (Ldy, Absolute) => 0xAC,
        (Ldy, AbsoluteX) => 0xBC,
        (Sta, ZeroPage) => 0x85,
        (Sta, ZeroPageX) => 0x95,
        (Sta, Absolute) => 0x8D,
        (Sta, AbsoluteX) => 0x9D,
        (Sta, AbsoluteY) => 0x99,
        (Sta, IndirectX) => 0x81,
        (Sta, IndirectY) => 0x91,
        (Stx, ZeroPage) => 0x86,
        (Stx, ZeroPageY) => 0x96,
        (Stx, Absolute) => 0x8E,
        (Sty, ZeroPage) => 0x84,
        (Sty, ZeroPageX) => 0x94,
        (Sty, Absolute) => 0x8C,

        // Transfers.
        (Tax, Implied) => 0xAA,
        (Tay, Implied) => 0xA8,
        (Txa, Implied) => 0x8A,
        (Tya, Implied) => 0x98,
        (Tsx, Implied) => 0xBA,
        (Txs, Implied) => 0x9A,

        // Stack.
        (Pha, Implied) => 0x48,
        (Php, Implied) => 0x08,
        (Pla, Implied) => 0x68,
        (Plp, Implied) => 0x28,

        // Arithmetic.
        (Adc, Immediate) => 0x69,
        (Adc, ZeroPage) => 0x65,
        (Adc, ZeroPageX) => 0x75,
        (Adc, Absolute) => 0x6D,
        (Adc, AbsoluteX) => 0x7D,
        (Adc, AbsoluteY) => 0x79,
        (Adc, IndirectX) => 0x61,
        (Adc, IndirectY) => 0x71,
        (Sbc, Immediate) => 0xE9,
        (Sbc, ZeroPage) => 0xE5,
        (Sbc, ZeroPageX) => 0xF5,
        (Sbc, Absolute) => 0xED,
        (Sbc, AbsoluteX) => 0xFD,
        (Sbc, AbsoluteY) => 0xF9,
        (Sbc, IndirectX) => 0xE1,
        (Sbc, IndirectY) => 0xF1,

        // Logic.
        (And, Immediate) => 0x29,
        (And, ZeroPage) => 0x25,
        (And, ZeroPageX) => 0x35,
        (And, Absolute) => 0x2D,
        (And, AbsoluteX) => 0x3D,
        (And, AbsoluteY) => 0x39,
        (And, IndirectX) => 0x21,
        (And, IndirectY) => 0x31,
        (Ora, Immediate) => 0x09,
        (Ora, ZeroPage) => 0x05,
        (Ora, ZeroPageX) => 0x15,
        (Ora, Absolute) => 0x0D,
        (Ora, AbsoluteX) => 0x1D,
        (Ora, AbsoluteY) => 0x19,
        (Ora, IndirectX) => 0x01,
        (Ora, IndirectY) => 0x11,
        (Eor, Immediate) => 0x49,
        (Eor, ZeroPage) => 0x45,
        (Eor, ZeroPageX) => 0x55,
        (Eor, Absolute) => 0x4D,
        (Eor, AbsoluteX) => 0x5D,
        (Eor, AbsoluteY) => 0x59,
        (Eor, IndirectX) => 0x41,
        (Eor, IndirectY) => 0x51,
        (Bit, ZeroPage) => 0x24,
        (Bit, Absolute) => 0x2C,

        // Shifts and rotates. Implied means the accumulator form.
        (Asl, Implied) => 0x0A,
        (Asl, ZeroPage) => 0x06,
        (Asl, ZeroPageX) => 0x16,
        (Asl, Absolute) => 0x0E,
        (Asl, AbsoluteX) => 0x1E,
        (Lsr, Implied) => 0x4A,
        (Lsr, ZeroPage) => 0x46,
        (Lsr, ZeroPageX) => 0x56,
        (Lsr, Absolute) => 0x4E,
        (Lsr, AbsoluteX) => 0x5E,
        (Rol, Implied) => 0x2A,
        (Rol, ZeroPage) => 0x26,
        (Rol, ZeroPageX) => 0x36,
        (Rol, Absolute) => 0x2E,
        (Rol, AbsoluteX) => 0x3E,
        (Ror, Implied) => 0x6A,
        (Ror, ZeroPage) => 0x66,
        (Ror, ZeroPageX) => 0x76,
        (Ror, Absolute) => 0x6E,
        (Ror, AbsoluteX) => 0x7E,

        // Increments and decrements.
        (Inc, ZeroPage) => 0xE6,
        (Inc, ZeroPageX) => 0xF6,
        (Inc, Absolute) => 0xEE,
        (Inc, AbsoluteX) => 0xFE,
        (Inx, Implied) => 0xE8,
        (Iny, Implied) => 0xC8,
        (Dec, ZeroPage) => 0xC6,
        (Dec, ZeroPageX) => 0xD6,
        (Dec, Absolute) => 0xCE,
        (Dec, AbsoluteX) => 0xDE,
        (Dex, Implied) => 0xCA,
        (Dey, Implied) => 0x88,

        // Compares.
        (Cmp, Immediate) => 0xC9,
        (Cmp, ZeroPage) => 0xC5,
        (Cmp, ZeroPageX) => 0xD5,
        (Cmp, Absolute) => 0xCD,
        (Cmp, AbsoluteX) => 0xDD,
        (Cmp, AbsoluteY) => 0xD9,
        (Cmp, IndirectX) => 0xC1,
        (Cmp, IndirectY) => 0xD1,
        (Cpx, Immediate) => 0xE0,
        (Cpx, ZeroPage) => 0xE4,
        (Cpx, Absolute) => 0xEC,
        (Cpy, Immediate) => 0xC0,
        (Cpy, ZeroPage) => 0xC4,
        (Cpy, Absolute) => 0xCC,

        // Control flow.
        (Jmp, Absolute) => 0x4C,
        (Jmp, Indirect) => 0x6C,
        (Jsr, Absolute) => 0x20,
        (Rts, Implied) => 0x60,
        (Rti, Implied) => 0x40,
        (Brk, Implied) => 0x00,

        // Branches.
        (Bcc, Relative) => 0x90,
        (Bcs, Relative) => 0xB0,
        (Beq, Relative) => 0xF0,
        (Bne, Relative) => 0xD0,
        (Bmi, Relative) => 0x30,
        (Bpl, Relative) => 0x10,
        (Bvc, Relative) => 0x50,
        (Bvs, Relative) => 0x70,

        // Flags.
        (Clc, Implied) => 0x18,
        (Sec, Implied) => 0x38,
        (Cli, Implied) => 0x58,
        (Sei, Implied) => 0x78,
        (Cld, Implied) => 0xD8,
        (Sed, Implied) => 0xF8,
        (Clv, Implied) => 0xB8,

        (Nop, Implied) => 0xEA,

        _ => return None,
    })
}

/// Base cycle count of `(op, mode)`, not counting page-cross penalties.
pub fn cycles(op: Op, mode: Mode) -> u32 {
    use Mode::*;
    use Op::*;
    match (op, mode) {
        (_, Implied) => match op {
            Pha | Php => 3,
            Pla | Plp => 4,
            Rts | Rti => 6,
            Brk => 7,
            Asl | Lsr | Rol | Ror => 2,
            _ => 2,
        },
        (_, Immediate) => 2,
        (Sta | Stx | Sty, ZeroPage) => 3,
        (Asl | Lsr | Rol | Ror | Inc | Dec, ZeroPage) => 5,
        (_, ZeroPage) => 3,
        (Asl | Lsr | Rol | Ror | Inc | Dec, ZeroPageX) => 6,
        (_, ZeroPageX | ZeroPageY) => 4,
        (Jmp, Absolute) => 3,
        (Jsr, Absolute) => 6,
        (Asl | Lsr | Rol | Ror | Inc | Dec, Absolute) => 6,
        (_, Absolute) => 4,
        (Asl | Lsr | Rol | Ror | Inc | Dec, AbsoluteX) => 7,
        (Sta, AbsoluteX | AbsoluteY) => 5,
        (_, AbsoluteX | AbsoluteY) => 4,
        (Jmp, Indirect) => 5,
        (_, Indirect) => 5,
        (Sta, IndirectX | IndirectY) => 6,
        (_, IndirectX) => 6,
        (_, IndirectY) => 5,
        (_, Relative) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_encodings() {
        assert_eq!(encode(Op::Lda, Mode::Immediate), Some(0xA9));
        assert_eq!(encode(Op::Sta, Mode::Absolute), Some(0x8D));
        assert_eq!(encode(Op::Jmp, Mode::Absolute), Some(0x4C));
        assert_eq!(encode(Op::Jsr, Mode::Absolute), Some(0x20));
        assert_eq!(encode(Op::Bne, Mode::Relative), Some(0xD0));
        assert_eq!(encode(Op::Rts, Mode::Implied), Some(0x60));
        assert_eq!(encode(Op::Nop, Mode::Implied), Some(0xEA));
    }

    #[test]
    fn impossible_combinations_do_not_encode() {
        assert_eq!(encode(Op::Sta, Mode::Immediate), None);
        assert_eq!(encode(Op::Ldx, Mode::ZeroPageX), None);
        assert_eq!(encode(Op::Inc, Mode::Implied), None);
        assert_eq!(encode(Op::Jmp, Mode::ZeroPage), None);
    }

    #[test]
    fn sizes() {
        assert_eq!(Mode::Implied.size(), 1);
        assert_eq!(Mode::Immediate.size(), 2);
        assert_eq!(Mode::Absolute.size(), 3);
        assert_eq!(Mode::Relative.size(), 2);
    }

    #[test]
    fn store_has_no_page_cross_discount() {
        assert_eq!(cycles(Op::Sta, Mode::AbsoluteX), 5);
        assert_eq!(cycles(Op::Lda, Mode::AbsoluteX), 4);
        assert_eq!(cycles(Op::Jsr, Mode::Absolute), 6);
    }

    // Spot-check against the published opcode matrix: every encodable
    // pair must be unique.
    #[test]
    fn encodings_are_injective() {
        use std::collections::HashMap;
        let ops = [
            Op::Adc, Op::And, Op::Asl, Op::Bcc, Op::Bcs, Op::Beq, Op::Bit, Op::Bmi,
            Op::Bne, Op::Bpl, Op::Brk, Op::Bvc, Op::Bvs, Op::Clc, Op::Cld, Op::Cli,
            Op::Clv, Op::Cmp, Op::Cpx, Op::Cpy, Op::Dec, Op::Dex, Op::Dey, Op::Eor,
            Op::Inc, Op::Inx, Op::Iny, Op::Jmp, Op::Jsr, Op::Lda, Op::Ldx, Op::Ldy,
            Op::Lsr, Op::Nop, Op::Ora, Op::Pha, Op::Php, Op::Pla, Op::Plp, Op::Rol,
            Op::Ror, Op::Rti, Op::Rts, Op::Sbc, Op::Sec, Op::Sed, Op::Sei, Op::Sta,
            Op::Stx, Op::Sty, Op::Tax, Op::Tay, Op::Tsx, Op::Txa, Op::Txs, Op::Tya,
        ];
        let modes = [
            Mode::Implied, Mode::Immediate, Mode::ZeroPage, Mode::ZeroPageX,
            Mode::ZeroPageY, Mode::Absolute, Mode::AbsoluteX, Mode::AbsoluteY,
            Mode::Indirect, Mode::IndirectX, Mode::IndirectY, Mode::Relative,
        ];
        let mut seen: HashMap<u8, (Op, Mode)> = HashMap::new();
        for &op in &ops {
            for &mode in &modes {
                if let Some(byte) = encode(op, mode) {
                    if let Some(&prev) = seen.get(&byte) {
                        panic!("opcode ${byte:02X} assigned to {prev:?} and {:?}", (op, mode));
                    }
                    seen.insert(byte, (op, mode));
                }
            }
        }
        // The documented set we emit.
        assert!(seen.len() > 140);
    }
}
