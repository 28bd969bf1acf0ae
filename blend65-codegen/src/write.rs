//! Textual IL output.
//!
//! Deterministic: two identical programs print byte-identically, which
//! the golden tests and the determinism property lean on. The format is
//! for humans and tests; nothing parses it back.

use crate::ir::{Function, Inst, MemAddr, Program, Term};
use core::fmt::Write as _;

/// Print a whole program.
pub fn program_to_string(program: &Program) -> String {
    let mut out = String::new();
    for (id, global) in program.globals.iter() {
        let _ = write!(out, "global {id} {} : {} bytes", global.name, global.size);
        if let Some(addr) = global.addr {
            let _ = write!(out, " at ${addr:04X}");
        }
        let _ = writeln!(out, " ({:?})", global.storage);
    }
    if !program.globals.is_empty() {
        out.push('\n');
    }
    for func in &program.functions {
        out.push_str(&function_to_string(program, func));
        out.push('\n');
    }
    out
}

/// Print one function.
pub fn function_to_string(program: &Program, func: &Function) -> String {
    let sig = &program.sigs[func.func];
    let mut out = String::new();
    let params: Vec<String> = func
        .params
        .iter()
        .zip(&sig.params)
        .map(|(v, w)| format!("{v}:{w}"))
        .collect();
    let ret = match sig.ret {
        Some(w) => format!(" -> {w}"),
        None => String::new(),
    };
    let _ = writeln!(out, "function {}({}){} {{", sig.name, params.join(", "), ret);
    for &block in &func.layout {
        let _ = writeln!(out, "{block}:");
        for inst in &func.blocks[block].insts {
            let _ = writeln!(out, "    {}", inst_to_string(program, inst));
        }
        let _ = writeln!(out, "    {}", term_to_string(&func.blocks[block].term));
    }
    out.push_str("}\n");
    out
}

fn mem_to_string(program: &Program, addr: &MemAddr) -> String {
    match addr {
        MemAddr::Global(id, 0) => format!("[{}]", program.globals[*id].name),
        MemAddr::Global(id, offset) => {
            format!("[{}+{}]", program.globals[*id].name, offset)
        }
        MemAddr::Abs(a) => format!("[${a:04X}]"),
        MemAddr::Func(f) => format!("[&{}]", program.sigs[*f].name),
    }
}

fn inst_to_string(program: &Program, inst: &Inst) -> String {
    let vol = |v: bool| if v { ".v" } else { "" };
    match inst {
        Inst::Const { dst, value, width } => format!("{dst} = const.{width} {value}"),
        Inst::Move { dst, src } => format!("{dst} = {src}"),
        Inst::Unary {
            op,
            width,
            dst,
            src,
        } => format!("{dst} = {}.{width} {src}", op.mnemonic()),
        Inst::Binary {
            op,
            width,
            dst,
            lhs,
            rhs,
        } => format!("{dst} = {}.{width} {lhs}, {rhs}", op.mnemonic()),
        Inst::Cmp {
            cc,
            width,
            dst,
            lhs,
            rhs,
        } => format!("{dst} = cmp.{}.{width} {lhs}, {rhs}", cc.mnemonic()),
        Inst::Load {
            dst,
            addr,
            width,
            volatile,
        } => format!(
            "{dst} = load.{width}{} {}",
            vol(*volatile),
            mem_to_string(program, addr)
        ),
        Inst::Store {
            addr,
            src,
            width,
            volatile,
        } => format!(
            "store.{width}{} {}, {src}",
            vol(*volatile),
            mem_to_string(program, addr)
        ),
        Inst::LoadIndexed {
            dst,
            base,
            index,
            width,
            volatile,
        } => format!(
            "{dst} = load.{width}{} {}[{index}]",
            vol(*volatile),
            mem_to_string(program, base)
        ),
        Inst::StoreIndexed {
            base,
            index,
            src,
            width,
            volatile,
        } => format!(
            "store.{width}{} {}[{index}], {src}",
            vol(*volatile),
            mem_to_string(program, base)
        ),
        Inst::AddrOf { dst, target } => {
            format!("{dst} = addr {}", mem_to_string(program, target))
        }
        Inst::Call { dst, func, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            format!(
                "{dst} = call {}({})",
                program.sigs[*func].name,
                args.join(", ")
            )
        }
        Inst::CallVoid { func, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            format!("call_void {}({})", program.sigs[*func].name, args.join(", "))
        }
        Inst::Peek { dst, ptr, width } => format!("{dst} = peek.{width} ({ptr})"),
        Inst::Poke { ptr, src, width } => format!("poke.{width} ({ptr}), {src}"),
        Inst::Zext { dst, src } => format!("{dst} = zext {src}"),
        Inst::Lo { dst, src } => format!("{dst} = lo {src}"),
        Inst::Hi { dst, src } => format!("{dst} = hi {src}"),
        Inst::Cpu(op) => op.mnemonic().to_string(),
        Inst::Barrier => "barrier".to_string(),
        Inst::InlineAsm(lines) => format!("asm({} lines)", lines.len()),
    }
}

fn term_to_string(term: &Term) -> String {
    match term {
        Term::Jump(b) => format!("jump {b}"),
        Term::Branch {
            cond,
            then_block,
            else_block,
        } => format!("br {cond}, {then_block}, {else_block}"),
        Term::JumpTable {
            index,
            base,
            targets,
            default,
        } => {
            let targets: Vec<String> = targets.iter().map(|b| b.to_string()).collect();
            format!(
                "jumptable {index}, base={base}, [{}], default {default}",
                targets.join(", ")
            )
        }
        Term::Return(Some(v)) => format!("return {v}"),
        Term::Return(None) => "return".to_string(),
        Term::None => "<unterminated>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, FuncSig, Function, FunctionBuilder, Program, Term, Width};

    #[test]
    fn deterministic_output() {
        let mut program = Program::new();
        let f = program.sigs.push(FuncSig {
            name: "a::main".to_string(),
            params: vec![],
            ret: Some(Width::Byte),
            callback: false,
        });
        let mut func = Function::new(f);
        let mut b = FunctionBuilder::new(&mut func);
        let x = b.iconst(1, Width::Byte);
        let y = b.iconst(2, Width::Byte);
        let sum = b.binary(AluOp::Add, Width::Byte, x, y);
        b.terminate(Term::Return(Some(sum)));
        program.functions.push(func);

        let first = program_to_string(&program);
        let second = program_to_string(&program);
        assert_eq!(first, second);
        assert!(first.contains("a::main"));
        assert!(first.contains("v2 = add.b v0, v1"));
        assert!(first.contains("return v2"));
    }
}
