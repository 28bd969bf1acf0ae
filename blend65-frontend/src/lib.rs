//! Blend65 compiler frontend.
//!
//! This crate turns UTF-8 source text into a typed-syntax-free AST plus
//! diagnostics. It contains the source map (byte offsets to line/column),
//! the diagnostic machinery shared by every later pass, the lexer, the AST
//! definitions and the recursive-descent/Pratt parser.
//!
//! The frontend never aborts on user mistakes: the lexer stops the current
//! file on a lexical error, while the parser recovers at statement
//! boundaries and keeps reporting. Everything user-facing is a
//! [`Diagnostic`](diagnostics::Diagnostic); Rust `Result`s are reserved for
//! API-level failure.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub mod ast;
pub mod diagnostics;
pub mod intern;
pub mod lexer;
pub mod parser;
pub mod sourcemap;
pub mod token;

pub use crate::diagnostics::{DiagCode, Diagnostic, DiagnosticSink, Severity};
pub use crate::intern::{Interner, Name};
pub use crate::parser::parse_module;
pub use crate::sourcemap::{SourceId, SourceMap, Span};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
