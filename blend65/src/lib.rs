//! Blend65: a compiler from a statically-typed, C-style language to
//! 6502-family machine code.
//!
//! This umbrella crate wires the pipeline together and exposes the one
//! embedding surface the core supports:
//! [`compile(inputs, options)`](compile) returning outputs plus
//! diagnostics. Everything else — CLI, configuration files, build
//! orchestration — belongs to embedders.
//!
//! The pipeline: lex → parse → module graph → symbol/type checking →
//! CFGs → dataflow analyses → *gate* → IL generation → IL optimization →
//! register allocation → 6502 emission → assembly. The gate is absolute:
//! when any error-severity diagnostic exists (or warnings are promoted),
//! nothing after it runs. Compilation is deterministic: identical inputs
//! produce byte-identical outputs and diagnostics.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

pub use blend65_codegen::settings::{CompileOptions, EmitKind, OptLevel, Target};
pub use blend65_frontend::diagnostics::{DiagCode, Diagnostic, Severity};

use blend65_codegen::binemit;
use blend65_codegen::isa::mos6502::emit::{emit_program, EmitResult};
use blend65_codegen::opt;
use blend65_codegen::regalloc;
use blend65_codegen::timing;
use blend65_codegen::verifier;
use blend65_frontend::ast::Module;
use blend65_frontend::diagnostics::DiagnosticSink;
use blend65_frontend::parser::parse_module;
use blend65_frontend::sourcemap::{SourceId, SourceMap, Span};
use blend65_frontend::Interner;
use blend65_sema::analysis::TargetKind;
use blend65_sema::layout::MemoryParams;
use blend65_sema::modgraph::ModuleGraph;
use blend65_entity::EntityRef;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One source file. Each file is one module.
pub struct CompileInput {
    /// Display name, used in diagnostics.
    pub name: String,
    /// UTF-8 source text.
    pub source: String,
}

impl CompileInput {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// One emitted assembly unit.
pub struct OutputUnit {
    /// Unit name: `linker` for the header unit, else the module name.
    pub name: String,
    /// Assembly text.
    pub text: String,
}

/// Everything a compilation produces.
pub struct CompileOutput {
    /// Assembly text units: the linker header first, then one per module
    /// in compile order. Empty when the gate stopped the pipeline.
    pub outputs: Vec<OutputUnit>,
    /// The binary image, when `emit = binary` and compilation succeeded.
    pub binary: Option<Vec<u8>>,
    /// All diagnostics, in module-topological then source order.
    pub diagnostics: Vec<Diagnostic>,
    /// The diagnostics pretty-rendered with source context.
    pub rendered: String,
    /// True when the pipeline ran to completion.
    pub success: bool,
}

impl CompileOutput {
    /// Diagnostics at error severity or above.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity >= Severity::Error)
    }

    /// Find diagnostics by stable code string.
    pub fn with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.code.code() == code)
    }
}

/// Compile a set of modules.
pub fn compile(inputs: &[CompileInput], options: &CompileOptions) -> CompileOutput {
    Context::new(options.clone()).compile(inputs)
}

/// Owner of all per-compilation state.
///
/// Every pass receives what it needs from here; there is no ambient
/// global state anywhere in the compiler.
pub struct Context {
    options: CompileOptions,
    sources: SourceMap,
    interner: Interner,
    sink: DiagnosticSink,
}

impl Context {
    /// A fresh compilation context.
    pub fn new(options: CompileOptions) -> Self {
        let sink = DiagnosticSink::new(options.max_diagnostics);
        Self {
            options,
            sources: SourceMap::new(),
            interner: Interner::new(),
            sink,
        }
    }

    /// Run the whole pipeline over `inputs`.
    pub fn compile(mut self, inputs: &[CompileInput]) -> CompileOutput {
        // Front end: one module per file. A lexical error halts its file;
        // the parser recovers at statement boundaries.
        let mut modules: Vec<Module> = Vec::with_capacity(inputs.len());
        {
            let _tt = timing::start_pass("parse");
            for input in inputs {
                let file = self.sources.add_file(&input.name, &input.source);
                let module =
                    parse_module(file, &input.source, &mut self.interner, &mut self.sink);
                modules.push(module);
            }
        }

        let graph = ModuleGraph::build(&modules, &self.interner, &mut self.sink);

        let params = MemoryParams {
            zp_lo: u32::from(self.options.target.memory_map().zp_lo),
            zp_hi: u32::from(self.options.target.memory_map().zp_hi),
            zp_budget: self.options.target.zero_page_budget(),
        }
        .with_budget(self.options.zero_page_budget);
        let target_kind = match self.options.target {
            Target::C64 => TargetKind::C64,
            Target::Vic20 => TargetKind::Vic20,
            Target::X16 => TargetKind::X16,
        };

        let sema = {
            let _tt = timing::start_pass("sema");
            blend65_sema::analyze(
                &modules,
                &graph,
                &mut self.interner,
                params,
                target_kind,
                &mut self.sink,
            )
        };

        // The gate: no error-severity diagnostic may exist before IL
        // generation. `warnings_as_errors` promotes here, not per pass.
        let gated = self.sink.has_errors()
            || (self.options.warnings_as_errors && self.sink.warning_count() > 0);
        if gated {
            return self.finish(&modules, &graph, Vec::new(), None, false);
        }

        let mut program = blend65_ilgen::lower_program(&modules, &self.interner, &sema);

        if let Err(errors) = verifier::verify_program(&program) {
            for error in errors {
                self.report_bug(error.to_string());
            }
            return self.finish(&modules, &graph, Vec::new(), None, false);
        }

        for func in &mut program.functions {
            opt::optimize(func, self.options.optimization);
        }

        if let Err(errors) = verifier::verify_program(&program) {
            for error in errors {
                self.report_bug(format!("after optimization: {error}"));
            }
            return self.finish(&modules, &graph, Vec::new(), None, false);
        }

        let map = self.options.target.memory_map();
        let reserved = sema.layout.reserved_zp_bytes();
        let alloc = regalloc::allocate(
            &program,
            map,
            self.options.effective_zp_budget(),
            &reserved,
        );

        // Zero-page assignments across all modules must be pairwise
        // disjoint; an overlap is a planner bug.
        let mut zp = alloc.zp_used.clone();
        zp.sort_unstable();
        let len = zp.len();
        zp.dedup();
        if zp.len() != len {
            self.report_bug("zero-page plan has overlapping assignments".to_string());
            return self.finish(&modules, &graph, Vec::new(), None, false);
        }

        let emitted = emit_program(&program, &alloc, &self.options);

        let (outputs, binary) = match self.options.emit {
            EmitKind::Asm => (self.split_units(&modules, &graph, &sema, &program, &emitted), None),
            EmitKind::Binary => {
                match binemit::prg_image(
                    &emitted.code,
                    &emitted.data,
                    &emitted.bss,
                    self.options.target,
                ) {
                    Ok(image) => (Vec::new(), Some(image)),
                    Err(error) => {
                        self.report_bug(error.to_string());
                        return self.finish(&modules, &graph, Vec::new(), None, false);
                    }
                }
            }
        };

        log::debug!("pass timing:\n{}", timing::take_summary());
        self.finish(&modules, &graph, outputs, binary, true)
    }

    fn report_bug(&mut self, message: String) {
        let span = Span::new(SourceId::new(0), 0, 0);
        self.sink
            .report(Diagnostic::new(DiagCode::Internal, span, message));
    }

    /// One assembly unit per module plus the linker header unit.
    fn split_units(
        &self,
        modules: &[Module],
        graph: &ModuleGraph,
        sema: &blend65_sema::Sema,
        program: &blend65_codegen::ir::Program,
        emitted: &EmitResult,
    ) -> Vec<OutputUnit> {
        use blend65_codegen::isa::mos6502::AsmLine;

        // Function comment lines mark where each function's code starts;
        // map them back to their modules.
        let mut func_module: Vec<(String, usize)> = Vec::new();
        for (_, info) in sema.funcs.iter() {
            let name = program
                .sigs
                .iter()
                .find(|(_, s)| {
                    s.name
                        == format!(
                            "{}::{}",
                            self.interner
                                .resolve(modules[info.module.index()].name),
                            self.interner
                                .resolve(sema.symbols.get(info.symbol).name)
                        )
                })
                .map(|(_, s)| s.name.clone());
            if let Some(name) = name {
                func_module.push((format!("function {name}"), info.module.index()));
            }
        }

        let mut header: Vec<String> = Vec::new();
        let mut per_module: Vec<Vec<String>> = vec![Vec::new(); modules.len()];
        let mut current: Option<usize> = None;
        for line in &emitted.code {
            if let AsmLine::Comment(text) = line {
                if let Some(&(_, module)) =
                    func_module.iter().find(|(marker, _)| marker == text)
                {
                    current = Some(module);
                } else if text.starts_with("runtime helper") {
                    current = None;
                }
            }
            match current {
                Some(module) => per_module[module].push(line.to_string()),
                None => header.push(line.to_string()),
            }
        }

        let map = self.options.target.memory_map();
        let mut header_text = format!(
            "; blend65 linker header\n; target: {}\n    * = ${:04x}\n",
            self.options.target, map.code_base
        );
        for line in &header {
            header_text.push_str(line);
            header_text.push('\n');
        }
        if !emitted.data.is_empty() {
            header_text.push_str("\n; data segment\n");
            for line in &emitted.data {
                header_text.push_str(&line.to_string());
                header_text.push('\n');
            }
        }
        if !emitted.bss.is_empty() {
            header_text.push_str("\n; bss segment\n");
            for line in &emitted.bss {
                header_text.push_str(&line.to_string());
                header_text.push('\n');
            }
        }

        let mut outputs = vec![OutputUnit {
            name: "linker".to_string(),
            text: header_text,
        }];
        for &mid in graph.order() {
            let index = mid.index();
            let text: String = per_module[index]
                .iter()
                .map(|l| format!("{l}\n"))
                .collect();
            outputs.push(OutputUnit {
                name: self
                    .interner
                    .resolve(modules[index].name)
                    .to_string(),
                text,
            });
        }
        outputs
    }

    /// Sort diagnostics into the stable order (module-topological, then
    /// source order within a module) and assemble the output value.
    fn finish(
        self,
        modules: &[Module],
        graph: &ModuleGraph,
        outputs: Vec<OutputUnit>,
        binary: Option<Vec<u8>>,
        success: bool,
    ) -> CompileOutput {
        // Rank each file by its module's topological position.
        let mut rank_of_file: Vec<(SourceId, usize)> = Vec::new();
        for (position, &mid) in graph.order().iter().enumerate() {
            rank_of_file.push((modules[mid.index()].file, position));
        }
        let rank = |span: Span| {
            rank_of_file
                .iter()
                .find(|(file, _)| *file == span.file)
                .map(|&(_, r)| r)
                .unwrap_or(usize::MAX)
        };

        let mut diagnostics = self.sink.into_vec();
        diagnostics.sort_by_key(|d| (rank(d.span), d.span.file, d.span.start));

        let mut rendered = String::new();
        for diag in &diagnostics {
            rendered.push_str(&blend65_frontend::diagnostics::render(diag, &self.sources));
        }

        CompileOutput {
            outputs,
            binary,
            diagnostics,
            rendered,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CompileOptions {
        CompileOptions::default()
    }

    #[test]
    fn empty_main_compiles() {
        let out = compile(
            &[CompileInput::new(
                "a.b65",
                "module A; export function main(): void { }",
            )],
            &options(),
        );
        assert!(out.success, "{}", out.rendered);
        assert!(out.diagnostics.is_empty());
        assert!(!out.outputs.is_empty());
    }

    #[test]
    fn gate_stops_on_errors() {
        let out = compile(
            &[CompileInput::new("a.b65", "module A; const K: byte;")],
            &options(),
        );
        assert!(!out.success);
        assert!(out.outputs.is_empty());
        assert!(out
            .with_code("E_MISSING_CONST_INITIALIZER")
            .next()
            .is_some());
    }

    #[test]
    fn warnings_do_not_stop_compilation() {
        let src = "module A;\nfunction main(): void { }\n";
        let out = compile(&[CompileInput::new("a.b65", src)], &options());
        assert!(out.success);
        assert!(out.with_code("W_IMPLICIT_MAIN_EXPORT").next().is_some());
    }

    #[test]
    fn warnings_as_errors_promotes_at_the_gate() {
        let src = "module A;\nfunction main(): void { }\n";
        let mut opts = options();
        opts.warnings_as_errors = true;
        let out = compile(&[CompileInput::new("a.b65", src)], &opts);
        assert!(!out.success);
        // The recorded severity stays a warning; only the gate promotes.
        let d = out.with_code("W_IMPLICIT_MAIN_EXPORT").next().unwrap();
        assert_eq!(d.severity, Severity::Warning);
    }

    #[test]
    fn diagnostics_are_in_topological_then_source_order() {
        // B imports from A; topological order is A then B even though B
        // is the first input.
        let out = compile(
            &[
                CompileInput::new(
                    "b.b65",
                    "module B; import f from A;\nlet unused_b: byte = 1;\nexport function main(): void { f(); }",
                ),
                CompileInput::new(
                    "a.b65",
                    "module A;\nlet unused_a: byte = 1;\nexport function f(): void { }",
                ),
            ],
            &options(),
        );
        assert!(out.success, "{}", out.rendered);
        let unused: Vec<&str> = out
            .diagnostics
            .iter()
            .filter(|d| d.code == DiagCode::UnusedVariable)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(unused.len(), 2);
        assert!(unused[0].contains("unused_a"), "{unused:?}");
        assert!(unused[1].contains("unused_b"), "{unused:?}");
    }

    #[test]
    fn binary_emission_produces_prg() {
        let mut opts = options();
        opts.emit = EmitKind::Binary;
        let out = compile(
            &[CompileInput::new(
                "a.b65",
                "module A; export function main(): void { poke($D020, 0); }",
            )],
            &opts,
        );
        assert!(out.success, "{}", out.rendered);
        let prg = out.binary.expect("binary image");
        assert_eq!(&prg[0..2], &[0x01, 0x08], "C64 load address");
        // The image contains the STA $D020.
        assert!(prg.windows(3).any(|w| w == [0x8D, 0x20, 0xD0]));
    }
}
