//! Pipeline-level properties: determinism, diagnostic record stability,
//! and robustness of the front end against arbitrary input.

use blend65::{compile, CompileInput, CompileOptions, EmitKind, OptLevel};
use proptest::prelude::*;

fn run(src: &str, options: &CompileOptions) -> blend65::CompileOutput {
    let _ = env_logger::builder().is_test(true).try_init();
    compile(&[CompileInput::new("t.b65", src)], options)
}

const GAME_LOOP: &str = "module Game;\n\
    @map border at $D020: byte;\n\
    @map raster at $D012: byte;\n\
    @zp let frame: byte = 0;\n\
    let sprite_x: byte[8] = [10, 20, 30, 40, 50, 60, 70, 80];\n\
    \n\
    function wait_raster(line: byte): void {\n\
      while (volatile_read($D012) != line) { }\n\
    }\n\
    \n\
    export function main(): void {\n\
      let i: byte = 0;\n\
      while (true) {\n\
        wait_raster(250);\n\
        frame += 1;\n\
        for i = 0 to 7 {\n\
          poke($D000 + word(i) * 2, sprite_x[i]);\n\
        }\n\
        border = frame & 15;\n\
      }\n\
    }\n";

// Two runs on identical input produce byte-identical assembly and
// byte-identical diagnostics.
#[test]
fn p4_compilation_is_deterministic() {
    for opt in [OptLevel::Off, OptLevel::Basic, OptLevel::Full] {
        let mut options = CompileOptions::default();
        options.optimization = opt;
        let a = run(GAME_LOOP, &options);
        let b = run(GAME_LOOP, &options);
        assert!(a.success, "{}", a.rendered);
        assert_eq!(a.outputs.len(), b.outputs.len());
        for (ua, ub) in a.outputs.iter().zip(&b.outputs) {
            assert_eq!(ua.name, ub.name);
            assert_eq!(ua.text, ub.text, "non-deterministic output at {opt}");
        }
        assert_eq!(a.rendered, b.rendered);
        assert_eq!(a.diagnostics.len(), b.diagnostics.len());
    }
}

#[test]
fn binary_emission_is_deterministic() {
    let mut options = CompileOptions::default();
    options.emit = EmitKind::Binary;
    let a = run(GAME_LOOP, &options);
    let b = run(GAME_LOOP, &options);
    assert!(a.success, "{}", a.rendered);
    assert_eq!(a.binary, b.binary);
}

// The volatile raster wait must survive full optimization: the loop
// re-reads $D012 every iteration.
#[test]
fn p5_volatile_reads_survive_full_optimization() {
    let mut options = CompileOptions::default();
    options.optimization = OptLevel::Full;
    let out = run(GAME_LOOP, &options);
    assert!(out.success, "{}", out.rendered);
    let unit = out.outputs.iter().find(|u| u.name == "Game").unwrap();
    assert!(
        unit.text.contains("lda $d012"),
        "raster read vanished:\n{}",
        unit.text
    );
}

// The stable machine-parseable diagnostic record: severity, code, file,
// line, column, length, message.
#[test]
fn diagnostic_records_are_machine_parseable() {
    let out = run("module A;\nconst K: byte;\n", &CompileOptions::default());
    let d = out.with_code("E_MISSING_CONST_INITIALIZER").next().unwrap();
    let record = serde_json::json!({
        "severity": d.severity.to_string(),
        "code": d.code.code(),
        "length": d.span.len,
        "message": d.message,
        "related": d.related.len(),
    });
    assert_eq!(record["severity"], "error");
    assert_eq!(record["code"], "E_MISSING_CONST_INITIALIZER");
    assert_eq!(record["length"], 1);
    // The rendered form pins file, line and column.
    assert!(out.rendered.contains("t.b65:2:7"), "{}", out.rendered);
}

#[test]
fn optimization_levels_all_produce_working_output() {
    for opt in [OptLevel::Off, OptLevel::Basic, OptLevel::Full] {
        let mut options = CompileOptions::default();
        options.optimization = opt;
        let out = run(GAME_LOOP, &options);
        assert!(out.success, "level {opt}: {}", out.rendered);
        let unit = out.outputs.iter().find(|u| u.name == "Game").unwrap();
        assert!(unit.text.contains("Game_main:"));
        assert!(unit.text.contains("sta $d020"), "{}", unit.text);
    }
}

#[test]
fn all_targets_compile_the_same_source() {
    use blend65::Target;
    for target in [Target::C64, Target::Vic20, Target::X16] {
        let mut options = CompileOptions::default();
        options.target = target;
        let out = run(
            "module A; export function main(): void { poke($0400, 1); }",
            &options,
        );
        assert!(out.success, "{target}: {}", out.rendered);
        let header = &out.outputs[0];
        assert!(header.text.contains(target.name()), "{}", header.text);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // The front end never panics, whatever bytes arrive; it either
    // produces a module or diagnostics.
    #[test]
    fn frontend_is_total_on_arbitrary_input(src in "\\PC*") {
        let _ = run(&src, &CompileOptions::default());
    }

    // Lexically valid token soup still never panics the parser.
    #[test]
    fn parser_recovers_on_token_soup(
        tokens in proptest::collection::vec(
            prop_oneof![
                Just("let".to_string()),
                Just("if".to_string()),
                Just("(".to_string()),
                Just(")".to_string()),
                Just("{".to_string()),
                Just("}".to_string()),
                Just(";".to_string()),
                Just("+".to_string()),
                Just("x".to_string()),
                Just("1".to_string()),
                Just("byte".to_string()),
                Just(":".to_string()),
                Just("=".to_string()),
            ],
            0..40,
        )
    ) {
        let src = format!("module T;\n{}", tokens.join(" "));
        let _ = run(&src, &CompileOptions::default());
    }
}
