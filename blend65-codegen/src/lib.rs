//! Blend65 low-level code generation library.
//!
//! This crate owns everything below the typed AST: the three-address IL
//! and its builder, the IL optimizer, the register allocator and memory
//! planner, the 6502 instruction selector, and the two-pass assembler
//! that turns assembly lines into a byte image. It knows nothing about
//! the source language; the IL generator crate lowers into the types
//! defined here.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub mod binemit;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod opt;
pub mod regalloc;
pub mod settings;
pub mod timing;
pub mod verifier;
pub mod write;

pub use crate::settings::{CompileOptions, EmitKind, OptLevel, Target};
pub use crate::verifier::{verify_function, VerifierError};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
