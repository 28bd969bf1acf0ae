//! The MOS 6502 instruction model.
//!
//! Assembly is represented structurally: an [`AsmLine`] stream that both
//! renders to text (for `emit=asm`) and assembles to bytes (for
//! `emit=binary`). Operands may reference labels; the assembler resolves
//! them in its second pass. Only documented opcodes exist in the table —
//! illegal opcodes are unrepresentable, not merely avoided.

pub mod emit;
pub mod opcodes;

use core::fmt;

/// The documented 6502 mnemonics the compiler emits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[allow(missing_docs)] // the mnemonics are their own documentation
pub enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
}

impl Op {
    /// Lower-case mnemonic text.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Adc => "adc", Op::And => "and", Op::Asl => "asl", Op::Bcc => "bcc",
            Op::Bcs => "bcs", Op::Beq => "beq", Op::Bit => "bit", Op::Bmi => "bmi",
            Op::Bne => "bne", Op::Bpl => "bpl", Op::Brk => "brk", Op::Bvc => "bvc",
            Op::Bvs => "bvs", Op::Clc => "clc", Op::Cld => "cld", Op::Cli => "cli",
            Op::Clv => "clv", Op::Cmp => "cmp", Op::Cpx => "cpx", Op::Cpy => "cpy",
            Op::Dec => "dec", Op::Dex => "dex", Op::Dey => "dey", Op::Eor => "eor",
            Op::Inc => "inc", Op::Inx => "inx", Op::Iny => "iny", Op::Jmp => "jmp",
            Op::Jsr => "jsr", Op::Lda => "lda", Op::Ldx => "ldx", Op::Ldy => "ldy",
            Op::Lsr => "lsr", Op::Nop => "nop", Op::Ora => "ora", Op::Pha => "pha",
            Op::Php => "php", Op::Pla => "pla", Op::Plp => "plp", Op::Rol => "rol",
            Op::Ror => "ror", Op::Rti => "rti", Op::Rts => "rts", Op::Sbc => "sbc",
            Op::Sec => "sec", Op::Sed => "sed", Op::Sei => "sei", Op::Sta => "sta",
            Op::Stx => "stx", Op::Sty => "sty", Op::Tax => "tax", Op::Tay => "tay",
            Op::Tsx => "tsx", Op::Txa => "txa", Op::Txs => "txs", Op::Tya => "tya",
        }
    }

    /// True for the eight conditional branches.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Bcc | Op::Bcs | Op::Beq | Op::Bne | Op::Bmi | Op::Bpl | Op::Bvc | Op::Bvs
        )
    }

    /// The branch with the opposite condition, used for relaxation.
    pub fn inverted_branch(self) -> Op {
        match self {
            Op::Bcc => Op::Bcs,
            Op::Bcs => Op::Bcc,
            Op::Beq => Op::Bne,
            Op::Bne => Op::Beq,
            Op::Bmi => Op::Bpl,
            Op::Bpl => Op::Bmi,
            Op::Bvc => Op::Bvs,
            Op::Bvs => Op::Bvc,
            other => other,
        }
    }
}

/// A memory place: a fixed address or a label plus offset.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Place {
    /// A numeric address.
    Addr(u16),
    /// A label with a byte offset, resolved by the assembler.
    Label(String, i32),
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Place::Addr(a) if *a <= 0xFF => write!(f, "${a:02x}"),
            Place::Addr(a) => write!(f, "${a:04x}"),
            Place::Label(name, 0) => write!(f, "{name}"),
            Place::Label(name, off) => write!(f, "{name}{off:+}"),
        }
    }
}

/// An instruction operand, carrying the addressing mode.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    /// Implied or accumulator mode.
    None,
    /// `#$nn`
    Imm(u8),
    /// `#<label` — low byte of an address.
    ImmLo(String),
    /// `#>label` — high byte of an address.
    ImmHi(String),
    /// Zero-page or absolute, decided by the place.
    Mem(Place),
    /// `place,x`
    MemX(Place),
    /// `place,y`
    MemY(Place),
    /// `(zp),y`
    IndY(u8),
    /// A conditional branch target.
    Rel(String),
}

/// One line of the structured assembly stream.
#[derive(Clone, PartialEq, Debug)]
pub enum AsmLine {
    /// A label definition.
    Label(String),
    /// An instruction.
    Inst(Op, Operand),
    /// Raw bytes (`.byte`).
    Bytes(Vec<u8>),
    /// A 16-bit little-endian entry per element (`.word`), each a label
    /// plus addend — used by jump tables.
    Words(Vec<(String, i32)>),
    /// Reserve space without emitting bytes (`.res`), for BSS.
    Reserve(u32),
    /// A raw source line passed through from inline assembly.
    Raw(String),
    /// A comment, ignored by the assembler.
    Comment(String),
}

impl fmt::Display for AsmLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AsmLine::Label(name) => write!(f, "{name}:"),
            AsmLine::Inst(op, operand) => {
                let m = op.mnemonic();
                match operand {
                    Operand::None => write!(f, "    {m}"),
                    Operand::Imm(v) => write!(f, "    {m} #${v:02x}"),
                    Operand::ImmLo(l) => write!(f, "    {m} #<{l}"),
                    Operand::ImmHi(l) => write!(f, "    {m} #>{l}"),
                    Operand::Mem(p) => write!(f, "    {m} {p}"),
                    Operand::MemX(p) => write!(f, "    {m} {p},x"),
                    Operand::MemY(p) => write!(f, "    {m} {p},y"),
                    Operand::IndY(zp) => write!(f, "    {m} (${zp:02x}),y"),
                    Operand::Rel(l) => write!(f, "    {m} {l}"),
                }
            }
            AsmLine::Bytes(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| format!("${b:02x}")).collect();
                write!(f, "    .byte {}", parts.join(","))
            }
            AsmLine::Words(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(l, off)| {
                        if *off == 0 {
                            l.clone()
                        } else {
                            format!("{l}{off:+}")
                        }
                    })
                    .collect();
                write!(f, "    .word {}", parts.join(","))
            }
            AsmLine::Reserve(n) => write!(f, "    .res {n}"),
            AsmLine::Raw(text) => write!(f, "    {text}"),
            AsmLine::Comment(text) => write!(f, "; {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering() {
        assert_eq!(AsmLine::Label("main".into()).to_string(), "main:");
        assert_eq!(
            AsmLine::Inst(Op::Lda, Operand::Imm(5)).to_string(),
            "    lda #$05"
        );
        assert_eq!(
            AsmLine::Inst(Op::Sta, Operand::Mem(Place::Addr(0xD020))).to_string(),
            "    sta $d020"
        );
        assert_eq!(
            AsmLine::Inst(Op::Lda, Operand::Mem(Place::Addr(0x02))).to_string(),
            "    lda $02"
        );
        assert_eq!(
            AsmLine::Inst(Op::Lda, Operand::MemX(Place::Label("table".into(), 1))).to_string(),
            "    lda table+1,x"
        );
        assert_eq!(
            AsmLine::Inst(Op::Bne, Operand::Rel("loop".into())).to_string(),
            "    bne loop"
        );
    }

    #[test]
    fn branch_inversion() {
        assert_eq!(Op::Beq.inverted_branch(), Op::Bne);
        assert_eq!(Op::Bcc.inverted_branch(), Op::Bcs);
        assert!(Op::Bne.is_branch());
        assert!(!Op::Jmp.is_branch());
    }
}
