//! Compilation options and target descriptions.
//!
//! The option set is closed: the embedder (CLI or otherwise) maps its
//! flags onto [`CompileOptions`] and nothing else configures the core.
//! Targets carry the memory-map facts every later pass needs; everything
//! address-shaped in the compiler traces back to this table.

use core::fmt;

/// How hard the IL optimizer tries.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum OptLevel {
    /// No IL optimization at all.
    Off,
    /// Constant folding, copy propagation and dead code elimination.
    #[default]
    Basic,
    /// Everything, including CSE and strength reduction.
    Full,
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Basic => write!(f, "basic"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// What the pipeline produces.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum EmitKind {
    /// Assembly text units, one per module plus a header.
    #[default]
    Asm,
    /// A single contiguous binary image with an entry point.
    Binary,
}

/// A supported machine.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub enum Target {
    /// Commodore 64 — the reference target.
    #[default]
    C64,
    /// Commodore VIC-20 (unexpanded memory map).
    Vic20,
    /// Commander X16.
    X16,
}

impl Target {
    /// The machine's memory map.
    pub fn memory_map(self) -> MemoryMap {
        match self {
            // $02-$8F is free of KERNAL workspace; $00/$01 are the CPU
            // port and must never be touched.
            Target::C64 => MemoryMap {
                zp_lo: 0x02,
                zp_hi: 0x8F,
                code_base: 0x0801,
                himem: 0xA000,
            },
            Target::Vic20 => MemoryMap {
                zp_lo: 0xB0,
                zp_hi: 0xFF,
                code_base: 0x1001,
                himem: 0x1E00,
            },
            // The X16 reserves $00-$21 for the ABI registers.
            Target::X16 => MemoryMap {
                zp_lo: 0x22,
                zp_hi: 0x7F,
                code_base: 0x0801,
                himem: 0x9F00,
            },
        }
    }

    /// Default zero-page budget: the whole usable window.
    pub fn zero_page_budget(self) -> u32 {
        let map = self.memory_map();
        u32::from(map.zp_hi) - u32::from(map.zp_lo) + 1
    }

    /// Canonical name, as used in options and output headers.
    pub fn name(self) -> &'static str {
        match self {
            Target::C64 => "c64",
            Target::Vic20 => "vic20",
            Target::X16 => "x16",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address-space facts of one target.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMap {
    /// First usable zero-page byte.
    pub zp_lo: u8,
    /// Last usable zero-page byte, inclusive.
    pub zp_hi: u8,
    /// Where program code starts (after the BASIC stub).
    pub code_base: u16,
    /// First address past usable program RAM.
    pub himem: u16,
}

/// The closed option set of one compilation.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// The machine to compile for.
    pub target: Target,
    /// IL optimization level.
    pub optimization: OptLevel,
    /// Assembly text or binary image.
    pub emit: EmitKind,
    /// Reserved; must stay `false` in v1.
    pub allow_illegal_opcodes: bool,
    /// Keep at most this many diagnostics (0 = unlimited).
    pub max_diagnostics: usize,
    /// Promote warnings to errors at the pipeline gate.
    pub warnings_as_errors: bool,
    /// Override of the target's zero-page budget (0 = target default).
    pub zero_page_budget: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: Target::default(),
            optimization: OptLevel::default(),
            emit: EmitKind::default(),
            allow_illegal_opcodes: false,
            max_diagnostics: 0,
            warnings_as_errors: false,
            zero_page_budget: 0,
        }
    }
}

impl CompileOptions {
    /// The effective zero-page budget after the override.
    pub fn effective_zp_budget(&self) -> u32 {
        if self.zero_page_budget != 0 {
            self.zero_page_budget
                .min(self.target.zero_page_budget())
        } else {
            self.target.zero_page_budget()
        }
    }
}

impl fmt::Display for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "target = {}", self.target)?;
        writeln!(f, "optimization = {}", self.optimization)?;
        writeln!(
            f,
            "emit = {}",
            match self.emit {
                EmitKind::Asm => "asm",
                EmitKind::Binary => "binary",
            }
        )?;
        writeln!(f, "warnings_as_errors = {}", self.warnings_as_errors)?;
        writeln!(f, "zero_page_budget = {}", self.effective_zp_budget())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c64_zero_page_window() {
        let map = Target::C64.memory_map();
        assert_eq!(map.zp_lo, 0x02, "$00/$01 are the CPU port");
        assert_eq!(map.zp_hi, 0x8F);
        assert_eq!(Target::C64.zero_page_budget(), 0x8E);
    }

    #[test]
    fn budget_override_clamps_to_target() {
        let mut options = CompileOptions::default();
        options.zero_page_budget = 16;
        assert_eq!(options.effective_zp_budget(), 16);
        options.zero_page_budget = 10_000;
        assert_eq!(options.effective_zp_budget(), Target::C64.zero_page_budget());
    }

    #[test]
    fn display_is_stable() {
        let text = CompileOptions::default().to_string();
        assert!(text.contains("target = c64"));
        assert!(text.contains("optimization = basic"));
    }
}
