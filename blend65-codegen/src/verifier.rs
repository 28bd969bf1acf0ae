//! The IL verifier.
//!
//! Checks the structural invariants the rest of the backend relies on.
//! Verifier failures are compiler bugs, never user errors; the pipeline
//! surfaces them as internal diagnostics and aborts.

use crate::ir::{Function, Inst, Program, Term};
use blend65_entity::EntityRef;
use thiserror::Error;

/// A violated IL invariant.
#[derive(Debug, Error, PartialEq)]
pub enum VerifierError {
    /// A block has no terminator.
    #[error("{func}: {block} has no terminator")]
    MissingTerminator {
        /// Function name.
        func: String,
        /// The offending block, as text.
        block: String,
    },
    /// A register is read but never written anywhere in the function.
    #[error("{func}: {vreg} is used but never defined")]
    UndefinedVreg {
        /// Function name.
        func: String,
        /// The offending register, as text.
        vreg: String,
    },
    /// A `Call` targets a void function or a `CallVoid` a returning one.
    #[error("{func}: {call} disagrees with the callee's return type")]
    CallReturnMismatch {
        /// Function name.
        func: String,
        /// `CALL name` or `CALL_VOID name`.
        call: String,
    },
    /// A terminator references a block that does not exist in the layout.
    #[error("{func}: terminator targets unknown {block}")]
    UnknownBlock {
        /// Function name.
        func: String,
        /// The missing block, as text.
        block: String,
    },
}

/// Verify one function against `program`'s signatures.
pub fn verify_function(program: &Program, func: &Function) -> Result<(), Vec<VerifierError>> {
    let mut errors = Vec::new();
    let name = program.sigs[func.func].name.clone();

    // Every block in the layout ends in exactly one terminator; interior
    // instructions are non-branching by construction of `Inst`.
    for &block in &func.layout {
        if matches!(func.blocks[block].term, Term::None) {
            errors.push(VerifierError::MissingTerminator {
                func: name.clone(),
                block: block.to_string(),
            });
        }
        for target in func.blocks[block].term.successors() {
            if !func.blocks.is_valid(target) {
                errors.push(VerifierError::UnknownBlock {
                    func: name.clone(),
                    block: target.to_string(),
                });
            }
        }
    }

    // Defs: parameters plus every instruction destination.
    let mut defined = vec![false; func.num_vregs()];
    for &p in &func.params {
        defined[p.index()] = true;
    }
    for &block in &func.layout {
        for inst in &func.blocks[block].insts {
            if let Some(dst) = inst.def() {
                defined[dst.index()] = true;
            }
        }
    }
    for &block in &func.layout {
        for inst in &func.blocks[block].insts {
            for v in inst.uses() {
                if !defined[v.index()] {
                    errors.push(VerifierError::UndefinedVreg {
                        func: name.clone(),
                        vreg: v.to_string(),
                    });
                }
            }
            // CALL vs CALL_VOID agreement with the callee signature.
            match inst {
                Inst::Call { func: callee, .. } => {
                    if program.sigs[*callee].ret.is_none() {
                        errors.push(VerifierError::CallReturnMismatch {
                            func: name.clone(),
                            call: format!("CALL {}", program.sigs[*callee].name),
                        });
                    }
                }
                Inst::CallVoid { func: callee, .. } => {
                    if program.sigs[*callee].ret.is_some() {
                        errors.push(VerifierError::CallReturnMismatch {
                            func: name.clone(),
                            call: format!("CALL_VOID {}", program.sigs[*callee].name),
                        });
                    }
                }
                _ => {}
            }
        }
        if let Term::Branch { cond, .. } = &func.blocks[block].term {
            if !defined[cond.index()] {
                errors.push(VerifierError::UndefinedVreg {
                    func: name.clone(),
                    vreg: cond.to_string(),
                });
            }
        }
        if let Term::Return(Some(v)) = &func.blocks[block].term {
            if !defined[v.index()] {
                errors.push(VerifierError::UndefinedVreg {
                    func: name.clone(),
                    vreg: v.to_string(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Verify every function of a program.
pub fn verify_program(program: &Program) -> Result<(), Vec<VerifierError>> {
    let mut errors = Vec::new();
    for func in &program.functions {
        if let Err(mut e) = verify_function(program, func) {
            errors.append(&mut e);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncSig, Function, FunctionBuilder, Term, Width};

    fn program_with_sigs() -> Program {
        let mut program = Program::new();
        program.sigs.push(FuncSig {
            name: "t::f".to_string(),
            params: vec![],
            ret: Some(Width::Byte),
            callback: false,
        });
        program.sigs.push(FuncSig {
            name: "t::v".to_string(),
            params: vec![],
            ret: None,
            callback: false,
        });
        program
    }

    #[test]
    fn missing_terminator_is_caught() {
        let program = program_with_sigs();
        let f = program.sigs.keys().next().unwrap();
        let mut func = Function::new(f);
        let _ = FunctionBuilder::new(&mut func);
        let errors = verify_function(&program, &func).unwrap_err();
        assert!(matches!(errors[0], VerifierError::MissingTerminator { .. }));
    }

    #[test]
    fn call_void_mismatch_is_caught() {
        let program = program_with_sigs();
        let mut it = program.sigs.keys();
        let f = it.next().unwrap();
        let _v = it.next().unwrap();
        let mut func = Function::new(f);
        let mut b = FunctionBuilder::new(&mut func);
        // CALL_VOID to a byte-returning function.
        b.call_void(f, vec![]);
        let r = b.iconst(0, Width::Byte);
        b.terminate(Term::Return(Some(r)));
        let errors = verify_function(&program, &func).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, VerifierError::CallReturnMismatch { .. })));
    }

    #[test]
    fn valid_function_passes() {
        let program = program_with_sigs();
        let f = program.sigs.keys().next().unwrap();
        let mut func = Function::new(f);
        let mut b = FunctionBuilder::new(&mut func);
        let r = b.iconst(7, Width::Byte);
        b.terminate(Term::Return(Some(r)));
        assert!(verify_function(&program, &func).is_ok());
    }
}
