//! Target instruction sets.
//!
//! Every supported machine is 6502-family, so there is a single ISA
//! module; per-target differences (memory maps, BASIC stubs) live in
//! [`settings`](crate::settings) and the assembler.

pub mod mos6502;
