//! Binary emission: the internal two-pass assembler.
//!
//! Pass one assigns sizes and addresses; conditional branches start at
//! two bytes and are promoted to a branch-around-`JMP` pair when their
//! target ends up out of relative range, iterating until the sizes are
//! stable. Pass two encodes. Segments are laid out code, then data, then
//! BSS; BSS gets addresses but contributes no image bytes.
//!
//! The `prg_image` entry point wraps the image in the classic PRG
//! format: a two-byte load address, a BASIC `SYS` stub and the code.

use crate::isa::mos6502::opcodes::{self, Mode};
use crate::isa::mos6502::{AsmLine, Op, Operand, Place};
use crate::settings::Target;
use crate::timing;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// An assembly-time failure. These are compiler bugs or unassemblable
/// inline assembly, never ordinary user errors.
#[derive(Debug, Error, PartialEq)]
pub enum AsmError {
    /// An operand references a label no line defines.
    #[error("undefined label `{0}`")]
    UndefinedLabel(String),
    /// Two lines define the same label.
    #[error("duplicate label `{0}`")]
    DuplicateLabel(String),
    /// An (op, mode) pair the CPU does not have.
    #[error("cannot encode {0} in mode {1:?}")]
    CannotEncode(String, Mode),
    /// An inline assembly line the internal assembler cannot parse.
    #[error("cannot assemble inline line `{0}`")]
    BadInlineAsm(String),
    /// The image ran past the end of usable memory.
    #[error("image overflows usable memory at ${0:04X}")]
    ImageOverflow(u32),
}

/// A fully assembled image.
#[derive(Debug)]
pub struct Image {
    /// Address of the first byte.
    pub origin: u16,
    /// The bytes, code first, then data.
    pub bytes: Vec<u8>,
    /// Resolved addresses of all labels, sorted by name.
    pub symbols: Vec<(String, u16)>,
    /// Size of the BSS segment placed after the image.
    pub bss_size: u32,
}

/// Assemble code, data and BSS line streams at `origin`.
pub fn assemble(
    code: &[AsmLine],
    data: &[AsmLine],
    bss: &[AsmLine],
    origin: u16,
    himem: u16,
) -> Result<Image, AsmError> {
    let _tt = timing::start_pass("assemble");

    // Inline assembly becomes structured lines before anything else.
    let mut lines: Vec<AsmLine> = Vec::with_capacity(code.len() + data.len());
    for line in code.iter().chain(data) {
        match line {
            AsmLine::Raw(text) => lines.push(parse_raw_line(text)?),
            other => lines.push(other.clone()),
        }
    }

    // Iterative sizing with branch relaxation: `long` marks branches that
    // must be emitted as inverted-branch-plus-JMP.
    let mut long = vec![false; lines.len()];
    let (labels, sizes) = loop {
        let mut labels: FxHashMap<String, u32> = FxHashMap::default();
        let mut sizes = vec![0u32; lines.len()];
        let mut pc = u32::from(origin);
        for (i, line) in lines.iter().enumerate() {
            let size = match line {
                AsmLine::Label(name) => {
                    if labels.insert(name.clone(), pc).is_some() {
                        return Err(AsmError::DuplicateLabel(name.clone()));
                    }
                    0
                }
                AsmLine::Inst(op, operand) => {
                    if op.is_branch() && long[i] {
                        5 // inverted branch + jmp
                    } else {
                        u32::from(mode_of(*op, operand).size())
                    }
                }
                AsmLine::Bytes(bytes) => bytes.len() as u32,
                AsmLine::Words(entries) => entries.len() as u32 * 2,
                AsmLine::Reserve(n) => *n,
                AsmLine::Raw(_) | AsmLine::Comment(_) => 0,
            };
            sizes[i] = size;
            pc += size;
        }

        // BSS labels live after the image.
        let mut bss_pc = pc;
        for line in bss {
            match line {
                AsmLine::Label(name) => {
                    if labels.insert(name.clone(), bss_pc).is_some() {
                        return Err(AsmError::DuplicateLabel(name.clone()));
                    }
                }
                AsmLine::Reserve(n) => bss_pc += n,
                _ => {}
            }
        }
        if bss_pc > u32::from(himem) {
            return Err(AsmError::ImageOverflow(bss_pc));
        }

        // Find branches whose targets are now out of range.
        let mut changed = false;
        let mut pc = u32::from(origin);
        for (i, line) in lines.iter().enumerate() {
            if let AsmLine::Inst(op, Operand::Rel(target)) = line {
                if op.is_branch() && !long[i] {
                    let target_pc = *labels
                        .get(target)
                        .ok_or_else(|| AsmError::UndefinedLabel(target.clone()))?;
                    let delta = i64::from(target_pc) - (i64::from(pc) + 2);
                    if !(-128..=127).contains(&delta) {
                        long[i] = true;
                        changed = true;
                    }
                }
            }
            pc += sizes[i];
        }
        if !changed {
            break (labels, sizes);
        }
    };

    // Pass two: encode.
    let mut bytes = Vec::new();
    let mut pc = u32::from(origin);
    for (i, line) in lines.iter().enumerate() {
        match line {
            AsmLine::Label(_) | AsmLine::Comment(_) | AsmLine::Raw(_) => {}
            AsmLine::Bytes(b) => bytes.extend_from_slice(b),
            AsmLine::Words(entries) => {
                for (label, addend) in entries {
                    let addr = resolve(&labels, label, *addend)?;
                    bytes.push((addr & 0xFF) as u8);
                    bytes.push((addr >> 8) as u8);
                }
            }
            AsmLine::Reserve(n) => bytes.extend(std::iter::repeat(0).take(*n as usize)),
            AsmLine::Inst(op, operand) => {
                if op.is_branch() {
                    let Operand::Rel(target) = operand else {
                        return Err(AsmError::CannotEncode(
                            op.mnemonic().to_string(),
                            Mode::Relative,
                        ));
                    };
                    let target_pc = resolve(&labels, target, 0)?;
                    if long[i] {
                        // Inverted branch over a JMP to the real target.
                        let inv = op.inverted_branch();
                        bytes.push(opcode(inv, Mode::Relative)?);
                        bytes.push(3); // skip the jmp
                        bytes.push(opcode(Op::Jmp, Mode::Absolute)?);
                        bytes.push((target_pc & 0xFF) as u8);
                        bytes.push((target_pc >> 8) as u8);
                    } else {
                        let delta = i64::from(target_pc) - (i64::from(pc) + 2);
                        bytes.push(opcode(*op, Mode::Relative)?);
                        bytes.push(delta as i8 as u8);
                    }
                } else {
                    encode_inst(*op, operand, &labels, &mut bytes)?;
                }
            }
        }
        pc += sizes[i];
    }

    let mut symbols: Vec<(String, u16)> = labels
        .into_iter()
        .map(|(name, addr)| (name, addr as u16))
        .collect();
    symbols.sort();
    Ok(Image {
        origin,
        bytes,
        symbols,
        bss_size: bss_reserved(bss),
    })
}

fn bss_reserved(bss: &[AsmLine]) -> u32 {
    bss.iter()
        .map(|l| match l {
            AsmLine::Reserve(n) => *n,
            _ => 0,
        })
        .sum()
}

fn opcode(op: Op, mode: Mode) -> Result<u8, AsmError> {
    opcodes::encode(op, mode).ok_or_else(|| AsmError::CannotEncode(op.mnemonic().to_string(), mode))
}

fn resolve(labels: &FxHashMap<String, u32>, name: &str, addend: i32) -> Result<u32, AsmError> {
    // Operands may carry `name+N` / `name-N` arithmetic.
    let (base, extra) = match name.find(['+', '-']) {
        Some(pos) if pos > 0 => {
            let (head, tail) = name.split_at(pos);
            let extra: i32 = tail.parse().unwrap_or(0);
            (head, extra)
        }
        _ => (name, 0),
    };
    let addr = labels
        .get(base)
        .ok_or_else(|| AsmError::UndefinedLabel(base.to_string()))?;
    Ok((i64::from(*addr) + i64::from(addend) + i64::from(extra)) as u32)
}

/// The addressing mode an operand selects, preferring zero-page forms
/// when the address fits and the opcode has one.
fn mode_of(op: Op, operand: &Operand) -> Mode {
    match operand {
        Operand::None => Mode::Implied,
        Operand::Imm(_) | Operand::ImmLo(_) | Operand::ImmHi(_) => Mode::Immediate,
        Operand::Mem(Place::Addr(a)) if *a <= 0xFF => {
            if opcodes::encode(op, Mode::ZeroPage).is_some() {
                Mode::ZeroPage
            } else {
                Mode::Absolute
            }
        }
        Operand::Mem(_) => Mode::Absolute,
        Operand::MemX(Place::Addr(a)) if *a <= 0xFF => {
            if opcodes::encode(op, Mode::ZeroPageX).is_some() {
                Mode::ZeroPageX
            } else {
                Mode::AbsoluteX
            }
        }
        Operand::MemX(_) => Mode::AbsoluteX,
        Operand::MemY(Place::Addr(a)) if *a <= 0xFF => {
            if opcodes::encode(op, Mode::ZeroPageY).is_some() {
                Mode::ZeroPageY
            } else {
                Mode::AbsoluteY
            }
        }
        Operand::MemY(_) => Mode::AbsoluteY,
        Operand::IndY(_) => Mode::IndirectY,
        Operand::Rel(_) => Mode::Relative,
    }
}

fn encode_inst(
    op: Op,
    operand: &Operand,
    labels: &FxHashMap<String, u32>,
    bytes: &mut Vec<u8>,
) -> Result<(), AsmError> {
    let mode = mode_of(op, operand);
    bytes.push(opcode(op, mode)?);
    match operand {
        Operand::None => {}
        Operand::Imm(v) => bytes.push(*v),
        Operand::ImmLo(label) => {
            let addr = resolve(labels, label, 0)?;
            bytes.push((addr & 0xFF) as u8);
        }
        Operand::ImmHi(label) => {
            let addr = resolve(labels, label, 0)?;
            bytes.push(((addr >> 8) & 0xFF) as u8);
        }
        Operand::Mem(place) | Operand::MemX(place) | Operand::MemY(place) => {
            let addr = match place {
                Place::Addr(a) => u32::from(*a),
                Place::Label(name, off) => resolve(labels, name, *off)?,
            };
            match mode {
                Mode::ZeroPage | Mode::ZeroPageX | Mode::ZeroPageY => {
                    bytes.push((addr & 0xFF) as u8)
                }
                _ => {
                    bytes.push((addr & 0xFF) as u8);
                    bytes.push(((addr >> 8) & 0xFF) as u8);
                }
            }
        }
        Operand::IndY(zp) => bytes.push(*zp),
        Operand::Rel(_) => unreachable!("branches are encoded by the caller"),
    }
    Ok(())
}

/// Parse one inline-assembly source line into a structured line.
///
/// Accepts the subset the compiler documents for `asm(...)`: a mnemonic
/// plus an optional `#$nn`, `$nn`, `$nnnn`, `$nnnn,x`, `$nnnn,y` or
/// `($nn),y` operand. Anything else is an error.
fn parse_raw_line(text: &str) -> Result<AsmLine, AsmError> {
    let trimmed = text.trim();
    let bad = || AsmError::BadInlineAsm(trimmed.to_string());
    let (mnemonic, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (trimmed, ""),
    };
    let op = parse_mnemonic(mnemonic).ok_or_else(bad)?;
    let operand = if rest.is_empty() {
        Operand::None
    } else if let Some(imm) = rest.strip_prefix("#$") {
        Operand::Imm(u8::from_str_radix(imm, 16).map_err(|_| bad())?)
    } else if let Some(ind) = rest.strip_prefix("($") {
        let ind = ind.strip_suffix("),y").ok_or_else(bad)?;
        Operand::IndY(u8::from_str_radix(ind, 16).map_err(|_| bad())?)
    } else if let Some(hex) = rest.strip_prefix('$') {
        if let Some(hex) = hex.strip_suffix(",x") {
            Operand::MemX(Place::Addr(
                u16::from_str_radix(hex, 16).map_err(|_| bad())?,
            ))
        } else if let Some(hex) = hex.strip_suffix(",y") {
            Operand::MemY(Place::Addr(
                u16::from_str_radix(hex, 16).map_err(|_| bad())?,
            ))
        } else {
            Operand::Mem(Place::Addr(
                u16::from_str_radix(hex, 16).map_err(|_| bad())?,
            ))
        }
    } else if op.is_branch() || op == Op::Jmp || op == Op::Jsr {
        Operand::Rel(rest.to_string())
    } else {
        return Err(bad());
    };
    // Branch mnemonics keep label operands; jmp/jsr need Mem form.
    let operand = match (&operand, op) {
        (Operand::Rel(l), Op::Jmp | Op::Jsr) => Operand::Mem(Place::Label(l.clone(), 0)),
        _ => operand,
    };
    Ok(AsmLine::Inst(op, operand))
}

fn parse_mnemonic(m: &str) -> Option<Op> {
    let all = [
        Op::Adc, Op::And, Op::Asl, Op::Bcc, Op::Bcs, Op::Beq, Op::Bit, Op::Bmi,
        Op::Bne, Op::Bpl, Op::Brk, Op::Bvc, Op::Bvs, Op::Clc, Op::Cld, Op::Cli,
        Op::Clv, Op::Cmp, Op::Cpx, Op::Cpy, Op::Dec, Op::Dex, Op::Dey, Op::Eor,
        Op::Inc, Op::Inx, Op::Iny, Op::Jmp, Op::Jsr, Op::Lda, Op::Ldx, Op::Ldy,
        Op::Lsr, Op::Nop, Op::Ora, Op::Pha, Op::Php, Op::Pla, Op::Plp, Op::Rol,
        Op::Ror, Op::Rti, Op::Rts, Op::Sbc, Op::Sec, Op::Sed, Op::Sei, Op::Sta,
        Op::Stx, Op::Sty, Op::Tax, Op::Tay, Op::Tsx, Op::Txa, Op::Txs, Op::Tya,
    ];
    let lower = m.to_ascii_lowercase();
    all.into_iter().find(|op| op.mnemonic() == lower)
}

/// The BASIC `SYS` stub for `code_base`, plus the entry address the code
/// must be assembled at.
fn basic_stub(code_base: u16) -> (Vec<u8>, u16) {
    // Layout: [link][line 10][SYS][digits][0][end link]. The entry
    // address depends on the stub length, which depends on the digit
    // count; two rounds reach the fixed point.
    let mut entry = code_base + 13;
    for _ in 0..2 {
        let digits = entry.to_string();
        let len = 2 + 2 + 1 + digits.len() as u16 + 1 + 2;
        entry = code_base + len;
    }
    let digits = entry.to_string();
    let link = code_base + 2 + 2 + 1 + digits.len() as u16 + 1;
    let mut stub = Vec::new();
    stub.push((link & 0xFF) as u8);
    stub.push((link >> 8) as u8);
    stub.push(0x0A); // line 10
    stub.push(0x00);
    stub.push(0x9E); // SYS token
    stub.extend(digits.bytes());
    stub.push(0x00);
    stub.push(0x00); // end of program
    stub.push(0x00);
    (stub, entry)
}

/// Build a loadable PRG: load address, BASIC stub, code and data.
pub fn prg_image(
    code: &[AsmLine],
    data: &[AsmLine],
    bss: &[AsmLine],
    target: Target,
) -> Result<Vec<u8>, AsmError> {
    let map = target.memory_map();
    let (stub, entry) = basic_stub(map.code_base);
    let image = assemble(code, data, bss, entry, map.himem)?;
    let mut prg = Vec::with_capacity(2 + stub.len() + image.bytes.len());
    prg.push((map.code_base & 0xFF) as u8);
    prg.push((map.code_base >> 8) as u8);
    prg.extend_from_slice(&stub);
    prg.extend_from_slice(&image.bytes);
    Ok(prg)
}

/// Render the segments as one assembly text unit with a linker header.
pub fn asm_text(code: &[AsmLine], data: &[AsmLine], bss: &[AsmLine], target: Target) -> String {
    let map = target.memory_map();
    let mut out = String::new();
    out.push_str(&format!("; target: {}\n", target.name()));
    out.push_str(&format!("; code segment at ${:04x}\n", map.code_base));
    out.push_str(&format!("    * = ${:04x}\n", map.code_base));
    for line in code {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    if !data.is_empty() {
        out.push_str("\n; data segment\n");
        for line in data {
            out.push_str(&line.to_string());
            out.push('\n');
        }
    }
    if !bss.is_empty() {
        out.push_str("\n; bss segment\n");
        for line in bss {
            out.push_str(&line.to_string());
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(op: Op, operand: Operand) -> AsmLine {
        AsmLine::Inst(op, operand)
    }

    #[test]
    fn simple_encoding() {
        let code = vec![
            AsmLine::Label("start".into()),
            inst(Op::Lda, Operand::Imm(0x05)),
            inst(Op::Sta, Operand::Mem(Place::Addr(0xD020))),
            inst(Op::Rts, Operand::None),
        ];
        let image = assemble(&code, &[], &[], 0x0801, 0xA000).unwrap();
        assert_eq!(image.bytes, vec![0xA9, 0x05, 0x8D, 0x20, 0xD0, 0x60]);
        assert_eq!(image.symbols, vec![("start".to_string(), 0x0801)]);
    }

    #[test]
    fn zero_page_form_is_preferred() {
        let code = vec![
            inst(Op::Lda, Operand::Mem(Place::Addr(0x02))),
            inst(Op::Sta, Operand::Mem(Place::Addr(0x0400))),
        ];
        let image = assemble(&code, &[], &[], 0x0801, 0xA000).unwrap();
        assert_eq!(image.bytes, vec![0xA5, 0x02, 0x8D, 0x00, 0x04]);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let code = vec![
            AsmLine::Label("top".into()),
            inst(Op::Jmp, Operand::Mem(Place::Label("end".into(), 0))),
            AsmLine::Label("end".into()),
            inst(Op::Jmp, Operand::Mem(Place::Label("top".into(), 0))),
        ];
        let image = assemble(&code, &[], &[], 0x1000, 0xA000).unwrap();
        // jmp $1003 / jmp $1000
        assert_eq!(
            image.bytes,
            vec![0x4C, 0x03, 0x10, 0x4C, 0x00, 0x10]
        );
    }

    #[test]
    fn short_branch_is_two_bytes() {
        let code = vec![
            AsmLine::Label("loop".into()),
            inst(Op::Dex, Operand::None),
            inst(Op::Bne, Operand::Rel("loop".into())),
        ];
        let image = assemble(&code, &[], &[], 0x1000, 0xA000).unwrap();
        // dex / bne -3
        assert_eq!(image.bytes, vec![0xCA, 0xD0, 0xFD]);
    }

    #[test]
    fn long_branch_relaxes_to_jmp() {
        let mut code = vec![
            inst(Op::Bne, Operand::Rel("far".into())),
            AsmLine::Bytes(vec![0xEA; 200]),
            AsmLine::Label("far".into()),
            inst(Op::Rts, Operand::None),
        ];
        let image = assemble(&code, &[], &[], 0x1000, 0xA000).unwrap();
        // beq *+5 ; jmp far
        assert_eq!(image.bytes[0], 0xF0, "inverted branch");
        assert_eq!(image.bytes[1], 0x03);
        assert_eq!(image.bytes[2], 0x4C);
        let target = u16::from_le_bytes([image.bytes[3], image.bytes[4]]);
        assert_eq!(target, 0x1000 + 5 + 200);

        // The same target in range stays a plain branch.
        code[1] = AsmLine::Bytes(vec![0xEA; 10]);
        let image = assemble(&code, &[], &[], 0x1000, 0xA000).unwrap();
        assert_eq!(image.bytes[0], 0xD0);
    }

    #[test]
    fn undefined_label_is_an_error() {
        let code = vec![inst(Op::Jmp, Operand::Mem(Place::Label("nowhere".into(), 0)))];
        assert_eq!(
            assemble(&code, &[], &[], 0x1000, 0xA000).unwrap_err(),
            AsmError::UndefinedLabel("nowhere".into())
        );
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let code = vec![
            AsmLine::Label("x".into()),
            AsmLine::Label("x".into()),
        ];
        assert!(matches!(
            assemble(&code, &[], &[], 0x1000, 0xA000),
            Err(AsmError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn bss_gets_addresses_but_no_bytes() {
        let code = vec![
            inst(Op::Lda, Operand::Mem(Place::Label("buf".into(), 0))),
            inst(Op::Rts, Operand::None),
        ];
        let bss = vec![AsmLine::Label("buf".into()), AsmLine::Reserve(16)];
        let image = assemble(&code, &[], &bss, 0x1000, 0xA000).unwrap();
        assert_eq!(image.bytes.len(), 4);
        let buf = image.symbols.iter().find(|(n, _)| n == "buf").unwrap().1;
        assert_eq!(buf, 0x1004);
        assert_eq!(image.bss_size, 16);
    }

    #[test]
    fn word_table_entries_are_little_endian_minus_one() {
        let code = vec![
            AsmLine::Label("t".into()),
            AsmLine::Words(vec![("t".into(), -1)]),
        ];
        let image = assemble(&code, &[], &[], 0x2000, 0xA000).unwrap();
        assert_eq!(image.bytes, vec![0xFF, 0x1F]);
    }

    #[test]
    fn image_overflow_is_detected() {
        let code = vec![AsmLine::Bytes(vec![0; 0x1000])];
        assert!(matches!(
            assemble(&code, &[], &[], 0x9800, 0xA000),
            Err(AsmError::ImageOverflow(_))
        ));
    }

    #[test]
    fn inline_asm_subset_parses() {
        let code = vec![
            AsmLine::Raw("lda #$00".into()),
            AsmLine::Raw("sta $d020".into()),
            AsmLine::Raw("rts".into()),
        ];
        let image = assemble(&code, &[], &[], 0x1000, 0xA000).unwrap();
        assert_eq!(image.bytes, vec![0xA9, 0x00, 0x8D, 0x20, 0xD0, 0x60]);
        let bad = vec![AsmLine::Raw("xyz !!".into())];
        assert!(matches!(
            assemble(&bad, &[], &[], 0x1000, 0xA000),
            Err(AsmError::BadInlineAsm(_))
        ));
    }

    #[test]
    fn prg_image_has_load_address_and_stub() {
        let code = vec![
            AsmLine::Label("__start".into()),
            inst(Op::Rts, Operand::None),
        ];
        let prg = prg_image(&code, &[], &[], Target::C64).unwrap();
        // Load address $0801, little endian.
        assert_eq!(&prg[0..2], &[0x01, 0x08]);
        // SYS token in the stub.
        assert!(prg.contains(&0x9E));
        assert_eq!(*prg.last().unwrap(), 0x60);
    }
}
