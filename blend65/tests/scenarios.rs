//! End-to-end scenario tests over the `compile` entry point.
//!
//! Each test is a literal program with a pinned expected outcome;
//! together they cover the observable contract of the pipeline from
//! source text to diagnostics and emitted assembly.

use blend65::{compile, CompileInput, CompileOptions, Severity};

fn run(sources: &[(&str, &str)]) -> blend65::CompileOutput {
    let inputs: Vec<CompileInput> = sources
        .iter()
        .map(|(name, src)| CompileInput::new(*name, *src))
        .collect();
    compile(&inputs, &CompileOptions::default())
}

fn run_one(src: &str) -> blend65::CompileOutput {
    run(&[("main.b65", src)])
}

#[test]
fn s1_minimal_module_exports_main() {
    let out = run_one("module A; export function main(): void { }");
    assert!(out.success, "{}", out.rendered);
    assert!(out.diagnostics.is_empty(), "{}", out.rendered);
    // The module unit carries the exported symbol.
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    assert!(unit.text.contains("A_main:"), "{}", unit.text);
}

#[test]
fn s2_duplicate_module_declaration() {
    let out = run_one("module A; export function main(): void { }\nmodule B;");
    assert!(!out.success);
    let d = out.with_code("E_DUPLICATE_MODULE").next().unwrap();
    assert_eq!(d.severity, Severity::Error);
}

#[test]
fn s3_const_without_initializer() {
    let out = run_one("module A; const K: byte;");
    assert!(out.with_code("E_MISSING_CONST_INITIALIZER").next().is_some());
    assert!(!out.success);
}

#[test]
fn s4_map_overlap_reports_both_spans() {
    let out = run_one(
        "module A;\n\
         @map vic at $D020: byte;\n\
         @map vic2 at $D020: byte;\n\
         export function main(): void { }\n",
    );
    assert!(!out.success);
    let d = out.with_code("E_MAP_OVERLAP").next().unwrap();
    assert!(d.message.contains("$D020"), "{}", d.message);
    assert_eq!(d.related.len(), 1, "the first declaration is related");
}

#[test]
fn s5_call_not_call_void_for_byte_returning_callee() {
    let out = run_one(
        "module A;\n\
         export function f(): byte { return 1; }\n\
         export function main(): void { let x: byte = f(); poke($0400, x); }\n",
    );
    assert!(out.success, "{}", out.rendered);
    // The call site stores the byte result from A after JSR.
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    assert!(unit.text.contains("jsr A_f"), "{}", unit.text);
}

#[test]
fn s6_loop_counter_gets_fast_storage() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let i: byte = 0;\n\
           while (i < 10) { i += 1; }\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    // The loop body is calls-free and the counter lives in the zero
    // page: every sta in the loop is a two-digit (zero page) address.
    assert!(!unit.text.contains("jsr"), "{}", unit.text);
}

#[test]
fn s7_cyclic_import_stops_both_modules() {
    let out = run(&[
        ("a.b65", "module A; import g from B; export function f(): void { }"),
        ("b.b65", "module B; import f from A; export function g(): void { }"),
    ]);
    assert!(!out.success);
    let cyclic: Vec<_> = out.with_code("E_CYCLIC_IMPORT").collect();
    assert_eq!(cyclic.len(), 2, "{}", out.rendered);
    assert!(cyclic[0].message.contains('A') && cyclic[0].message.contains('B'));
    assert!(out.outputs.is_empty(), "no IL or code for cyclic modules");
}

#[test]
fn s8_length_of_literal_and_array_folds() {
    let out = run_one(
        "module A;\n\
         let table: byte[16] = [0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0];\n\
         export function main(): void {\n\
           let n: word = length(\"hello\");\n\
           let m: word = length(table);\n\
           pokew($0400, n);\n\
           pokew($0402, m);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    // 5 and 16 materialize as immediates; no length computation at
    // runtime.
    assert!(unit.text.contains("lda #$05"), "{}", unit.text);
    assert!(unit.text.contains("lda #$10"), "{}", unit.text);
}

#[test]
fn use_before_assignment_is_an_error() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let x: byte;\n\
           let y: byte = x;\n\
           poke($0400, y);\n\
         }\n",
    );
    assert!(!out.success);
    assert!(out.with_code("E_USE_BEFORE_ASSIGN").next().is_some());
}

#[test]
fn dead_code_after_return_warns_but_compiles() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           return;\n\
           poke($D020, 0);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    assert!(out.with_code("W_DEAD_CODE").next().is_some());
}

#[test]
fn unused_import_warns() {
    let out = run(&[
        ("a.b65", "module A; export function f(): void { }"),
        (
            "b.b65",
            "module B; import f from A; export function main(): void { }",
        ),
    ]);
    assert!(out.success, "{}", out.rendered);
    assert!(out.with_code("W_UNUSED_IMPORT").next().is_some());
}

#[test]
fn unresolved_import_is_an_error() {
    let out = run_one("module A; import nothing from Nowhere; export function main(): void { }");
    assert!(!out.success);
    assert!(out.with_code("E_UNRESOLVED_IMPORT").next().is_some());
}

#[test]
fn type_mismatch_requires_explicit_cast() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let w: word = $1234;\n\
           let b: byte = w;\n\
           poke($0400, b);\n\
         }\n",
    );
    assert!(!out.success);
    let d = out.with_code("E_TYPE_MISMATCH").next().unwrap();
    assert!(d.message.contains("cast"), "{}", d.message);
}

#[test]
fn narrowing_cast_warns_about_truncation() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let w: word = $1234;\n\
           let b: byte = byte(w);\n\
           poke($0400, b);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    assert!(out.with_code("W_CAST_TRUNCATES").next().is_some());
}

#[test]
fn non_bool_condition_is_rejected() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let x: byte = 1;\n\
           if (x) { poke($0400, x); }\n\
         }\n",
    );
    assert!(!out.success);
    assert!(out.with_code("E_NON_BOOL_CONDITION").next().is_some());
}

#[test]
fn enums_members_fold_to_their_values() {
    let out = run_one(
        "module A;\n\
         enum Color { Black, White = 1, Red = 2 }\n\
         export function main(): void {\n\
           poke($D020, Color.Red);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    assert!(unit.text.contains("lda #$02"), "{}", unit.text);
}

#[test]
fn sid_control_conflict_is_an_error() {
    let out = run_one(
        "module A;\n\
         export function voice_on(): void { poke($D404, $11); }\n\
         export function voice_off(): void { poke($D404, $10); }\n\
         export function main(): void { voice_on(); voice_off(); }\n",
    );
    assert!(!out.success);
    assert!(out.with_code("E_SID_CONTROL_CONFLICT").next().is_some());
}

#[test]
fn sid_frequency_conflict_is_a_warning() {
    let out = run_one(
        "module A;\n\
         export function sweep_up(): void { poke($D400, $40); }\n\
         export function sweep_down(): void { poke($D400, $20); }\n\
         export function main(): void { sweep_up(); sweep_down(); }\n",
    );
    assert!(out.success, "{}", out.rendered);
    assert!(out.with_code("W_SID_VOICE_CONFLICT").next().is_some());
}

#[test]
fn recursion_warns_about_the_cycle() {
    let out = run_one(
        "module A;\n\
         export function ping(): void { pong(); }\n\
         export function pong(): void { ping(); }\n\
         export function main(): void { ping(); }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let d = out.with_code("W_RECURSIVE_CALL").next().unwrap();
    assert!(d.message.contains("ping") && d.message.contains("pong"));
}

#[test]
fn do_while_body_runs_before_the_test() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let i: byte = 0;\n\
           do { i += 1; } while (i < 3);\n\
           poke($0400, i);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
}

#[test]
fn switch_with_compact_cases_uses_a_jump_table() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           let x: byte = peek($0400);\n\
           switch (x) {\n\
             case 0: poke($0400, 1);\n\
             case 1: poke($0400, 2);\n\
             case 2: poke($0400, 3);\n\
             case 3: poke($0400, 4);\n\
             default: poke($0400, 5);\n\
           }\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    // The push-and-rts dispatch of the jump table.
    assert!(unit.text.contains(".word"), "{}", unit.text);
    assert!(unit.text.contains("pha"), "{}", unit.text);
}

#[test]
fn map_struct_fields_resolve_to_fixed_addresses() {
    let out = run_one(
        "module A;\n\
         @map sid at $D400 type\n\
           freq_lo: byte;\n\
           freq_hi: byte;\n\
           pw_lo: byte;\n\
         end @map\n\
         export function main(): void {\n\
           sid.pw_lo = $30;\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    // Sequential layout: pw_lo sits at $D402.
    assert!(unit.text.contains("sta $d402"), "{}", unit.text);
}

#[test]
fn multi_module_program_links_across_imports() {
    let out = run(&[
        (
            "gfx.b65",
            "module Gfx;\n\
             export function set_border(c: byte): void { poke($D020, c); }\n",
        ),
        (
            "game.b65",
            "module Game;\n\
             import set_border from Gfx;\n\
             export function main(): void { set_border(2); }\n",
        ),
    ]);
    assert!(out.success, "{}", out.rendered);
    let game = out.outputs.iter().find(|u| u.name == "Game").unwrap();
    assert!(game.text.contains("jsr Gfx_set_border"), "{}", game.text);
}

#[test]
fn max_diagnostics_truncates_but_keeps_the_gate() {
    let mut options = CompileOptions::default();
    options.max_diagnostics = 1;
    let out = compile(
        &[CompileInput::new(
            "a.b65",
            "module A; const K1: byte; const K2: byte; const K3: byte;",
        )],
        &options,
    );
    assert!(!out.success);
    assert_eq!(out.diagnostics.len(), 1);
}

#[test]
fn zero_page_budget_override_is_respected() {
    let mut options = CompileOptions::default();
    options.zero_page_budget = 9; // scratch (8) + 1 byte
    let out = compile(
        &[CompileInput::new(
            "a.b65",
            "module A;\n\
             @zp let a: byte = 0;\n\
             @zp let b: byte = 0;\n\
             export function main(): void { a = 1; b = 2; poke($0400, a); poke($0401, b); }\n",
        )],
        &options,
    );
    // Two @zp bytes cannot fit the single remaining byte.
    assert!(!out.success);
    assert!(out.with_code("E_ZERO_PAGE_OVERFLOW").next().is_some());
}

#[test]
fn inline_asm_passes_through() {
    let out = run_one(
        "module A;\n\
         export function main(): void {\n\
           asm(\"lda #$00\", \"sta $d021\");\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    assert!(unit.text.contains("lda #$00"), "{}", unit.text);
    assert!(unit.text.contains("sta $d021"), "{}", unit.text);
}

#[test]
fn callback_address_can_be_taken() {
    let out = run_one(
        "module A;\n\
         callback function irq(): void { poke($D019, 1); }\n\
         export function main(): void {\n\
           pokew($0314, @irq);\n\
         }\n",
    );
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "A").unwrap();
    assert!(unit.text.contains("#<A_irq"), "{}", unit.text);
    assert!(unit.text.contains("#>A_irq"), "{}", unit.text);
}
