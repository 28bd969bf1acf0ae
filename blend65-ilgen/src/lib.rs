//! The Blend65 IL generator.
//!
//! Lowers type-checked, CFG-annotated modules into the three-address IL
//! of `blend65-codegen`. The program-level pass here assigns function
//! references and globals; the per-function lowering lives in
//! [`func`].
//!
//! Two rules from the language definition are load-bearing enough to
//! repeat: `CALL` versus `CALL_VOID` is decided by the callee symbol's
//! resolved return type and by nothing else, and every volatile access
//! (`@map` traffic, `peek`/`poke`, `volatile_*`) is lowered with its
//! volatile flag set so the optimizer keeps its hands off.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]

mod func;

use blend65_codegen::ir::{FuncRef, FuncSig, GlobalData, GlobalId, Program, StorageClass, Width};
use blend65_codegen::timing;
use blend65_entity::EntityRef;
use blend65_frontend::ast::Module;
use blend65_frontend::intern::Interner;
use blend65_sema::symbols::{Storage, SymbolId, SymbolKind};
use blend65_sema::types::{Type, TypeId};
use blend65_sema::metadata::{MetadataKey, MetadataValue};
use blend65_sema::Sema;
use rustc_hash::FxHashMap;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lower every checked function into one IL program.
///
/// Must only run when the diagnostic gate passed: the lowering trusts the
/// checker's invariants (every expression typed, every name resolved).
pub fn lower_program(modules: &[Module], interner: &Interner, sema: &Sema) -> Program {
    let _tt = timing::start_pass("ilgen");
    let mut program = Program::new();
    let mut func_refs: FxHashMap<SymbolId, FuncRef> = FxHashMap::default();
    let mut globals: FxHashMap<SymbolId, GlobalId> = FxHashMap::default();

    // Function signatures, in symbol creation order so FuncRef numbering
    // is deterministic.
    for (sym_id, symbol) in sema.symbols.iter() {
        if symbol.kind != SymbolKind::Function {
            continue;
        }
        let Some(Type::Func { params, ret, callback }) =
            symbol.ty.map(|t| sema.types.get(t).clone())
        else {
            continue;
        };
        let module_name = interner.resolve(modules[symbol.module.index()].name);
        let name = format!("{}::{}", module_name, interner.resolve(symbol.name));
        let sig = FuncSig {
            name,
            params: params.iter().map(|&p| width_of(sema, p)).collect(),
            ret: if sema.types.identical(ret, sema.types.void()) {
                None
            } else {
                Some(width_of(sema, ret))
            },
            callback,
        };
        let fref = program.sigs.push(sig);
        func_refs.insert(sym_id, fref);
    }

    // The exported entry point: the first `main` in module order.
    let main = sema
        .symbols
        .iter()
        .find(|(_, s)| {
            s.kind == SymbolKind::Function
                && s.exported
                && interner.resolve(s.name) == "main"
        })
        .map(|(id, _)| id);
    program.entry = main.and_then(|id| func_refs.get(&id).copied());

    // Globals: module-level variables and maps, plus locals that need
    // memory (arrays, strings, escaped locals).
    for (sym_id, symbol) in sema.symbols.iter() {
        if symbol.module.index() >= sema.modules.len() {
            continue; // builtins
        }
        let module_name = interner.resolve(modules[symbol.module.index()].name);
        let msema = &sema.modules[symbol.module.index()];
        match symbol.kind {
            SymbolKind::Map => {
                let size = symbol.ty.map(|t| sema.types.size_of(t)).unwrap_or(1);
                let id = program.globals.push(GlobalData {
                    name: format!("{}::{}", module_name, interner.resolve(symbol.name)),
                    size: size.max(1),
                    storage: StorageClass::Map,
                    addr: symbol.address.map(|a| a as u16),
                    init: None,
                    zp_suggested: false,
                });
                globals.insert(sym_id, id);
            }
            SymbolKind::Variable | SymbolKind::Const
                if symbol.scope == msema.scope =>
            {
                // `@address` constants and folded scalar constants never
                // materialize.
                if symbol.address.is_some() {
                    continue;
                }
                if symbol.kind == SymbolKind::Const && symbol.const_value.is_some() {
                    continue;
                }
                let Some(ty) = symbol.ty else { continue };
                let size = sema.types.size_of(ty).max(1);
                let init = global_init(modules, sema, symbol.module.index(), sym_id);
                let storage = match symbol.storage {
                    Storage::Zp => StorageClass::Zp,
                    Storage::Data => StorageClass::Data,
                    _ if init.is_some() => StorageClass::Data,
                    _ => StorageClass::Ram,
                };
                let zp_suggested = msema
                    .metadata
                    .symbol(sym_id, MetadataKey::SuggestedStorage)
                    .is_some_and(|v| *v == MetadataValue::Storage("zp"));
                let id = program.globals.push(GlobalData {
                    name: format!("{}::{}", module_name, interner.resolve(symbol.name)),
                    size,
                    storage,
                    addr: None,
                    init,
                    zp_suggested,
                });
                globals.insert(sym_id, id);
            }
            _ => {}
        }
    }

    // Locals that cannot live in virtual registers: arrays, strings and
    // anything whose address escapes.
    for (_, info) in sema.funcs.iter() {
        let fsym = sema.symbols.get(info.symbol);
        let module_name = interner.resolve(modules[fsym.module.index()].name);
        let fname = interner.resolve(fsym.name);
        let msema = &sema.modules[info.module.index()];
        for &local in &info.locals {
            let symbol = sema.symbols.get(local);
            let Some(ty) = symbol.ty else { continue };
            let needs_memory = is_aggregate(sema, ty)
                || msema
                    .metadata
                    .symbol(local, MetadataKey::Escapes)
                    .is_some_and(MetadataValue::as_flag);
            if !needs_memory {
                continue;
            }
            let size = sema.types.size_of(ty).max(1);
            let id = program.globals.push(GlobalData {
                name: format!(
                    "{}::{}::{}",
                    module_name,
                    fname,
                    interner.resolve(symbol.name)
                ),
                size,
                storage: match symbol.storage {
                    Storage::Zp => StorageClass::Zp,
                    Storage::Data => StorageClass::Data,
                    _ => StorageClass::Ram,
                },
                addr: None,
                init: None,
                zp_suggested: false,
            });
            globals.insert(local, id);
        }
    }

    // Function bodies, in checked order.
    for (_, info) in sema.funcs.iter() {
        let module = &modules[info.module.index()];
        let msema = &sema.modules[info.module.index()];
        let fref = func_refs[&info.symbol];
        let function = func::lower_function(
            module, msema, sema, interner, info, fref, &func_refs, &globals,
        );
        program.functions.push(function);
    }

    program
}

/// IL width of a semantic type.
pub(crate) fn width_of(sema: &Sema, ty: TypeId) -> Width {
    if sema.types.size_of(ty) <= 1 {
        Width::Byte
    } else {
        Width::Word
    }
}

fn is_aggregate(sema: &Sema, ty: TypeId) -> bool {
    matches!(
        sema.types.get(sema.types.normalize(ty)),
        Type::Array { .. } | Type::Str { .. }
    )
}

/// Compile-time initializer bytes of a module-level variable, if its
/// declaration has one.
fn global_init(
    modules: &[Module],
    sema: &Sema,
    module_index: usize,
    symbol: SymbolId,
) -> Option<Vec<u8>> {
    use blend65_frontend::ast::{ExprKind, Item, Literal};
    let module = &modules[module_index];
    let msema = &sema.modules[module_index];
    let sym = sema.symbols.get(symbol);

    let decl = module.items.iter().find_map(|item| match item {
        Item::Var(decl) if decl.name == sym.name => Some(decl),
        _ => None,
    })?;
    let init = decl.init?;
    let ty = sym.ty?;
    let size = sema.types.size_of(ty).max(1);

    let const_of = |e| {
        msema.metadata.const_of(e).or(match &module.expr(e).kind {
            ExprKind::Literal(Literal::Int { value, .. }) => Some(*value),
            ExprKind::Literal(Literal::Bool(b)) => Some(u32::from(*b)),
            _ => None,
        })
    };

    match &module.expr(init).kind {
        ExprKind::Literal(Literal::Str(s)) => {
            let mut bytes: Vec<u8> = s.bytes().collect();
            bytes.truncate(size as usize);
            Some(bytes)
        }
        ExprKind::ArrayLit(elems) => {
            let elem_size = match sema.types.get(sema.types.normalize(ty)) {
                Type::Array { elem, .. } => sema.types.size_of(*elem),
                _ => 1,
            };
            let mut bytes = Vec::with_capacity(size as usize);
            for &e in elems {
                let v = const_of(e)?;
                bytes.push((v & 0xFF) as u8);
                if elem_size == 2 {
                    bytes.push((v >> 8) as u8);
                }
            }
            bytes.resize(size as usize, 0);
            Some(bytes)
        }
        _ => {
            let v = const_of(init)?;
            let mut bytes = vec![(v & 0xFF) as u8];
            if size == 2 {
                bytes.push((v >> 8) as u8);
            }
            bytes.resize(size as usize, 0);
            Some(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_codegen::ir::Inst;
    use blend65_codegen::verifier::verify_program;
    use blend65_frontend::diagnostics::DiagnosticSink;
    use blend65_frontend::parser::parse_module;
    use blend65_frontend::sourcemap::SourceMap;
    use blend65_sema::analysis::TargetKind;
    use blend65_sema::layout::MemoryParams;
    use blend65_sema::modgraph::ModuleGraph;

    fn lower(src: &str) -> Program {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut map = SourceMap::new();
        let file = map.add_file("t.b65", src);
        let mut interner = Interner::new();
        let mut sink = DiagnosticSink::new(0);
        let modules = vec![parse_module(file, src, &mut interner, &mut sink)];
        let graph = ModuleGraph::build(&modules, &interner, &mut sink);
        let params = MemoryParams {
            zp_lo: 0x02,
            zp_hi: 0x8F,
            zp_budget: 0x8E,
        };
        let sema = blend65_sema::analyze(
            &modules,
            &graph,
            &mut interner,
            params,
            TargetKind::C64,
            &mut sink,
        );
        assert!(!sink.has_errors(), "unexpected errors lowering {src:?}");
        let program = lower_program(&modules, &interner, &sema);
        verify_program(&program).expect("lowered IL verifies");
        program
    }

    fn insts_of<'a>(program: &'a Program, name: &str) -> Vec<&'a Inst> {
        let func = program
            .functions
            .iter()
            .find(|f| program.sigs[f.func].name == name)
            .unwrap();
        func.layout
            .iter()
            .flat_map(|&b| func.blocks[b].insts.iter())
            .collect()
    }

    #[test]
    fn call_for_value_returning_callee_call_void_otherwise() {
        let program = lower(
            "module A;\n\
             export function f(): byte { return 1; }\n\
             export function g(): void { }\n\
             export function main(): void { let x: byte = f(); g(); poke($0400, x); }\n",
        );
        let main = insts_of(&program, "A::main");
        let has_call = main.iter().any(|i| matches!(i, Inst::Call { .. }));
        let has_call_void = main.iter().any(|i| matches!(i, Inst::CallVoid { .. }));
        assert!(has_call, "f() must lower to CALL");
        assert!(has_call_void, "g() must lower to CALL_VOID");
        // And the selection agrees with each callee's signature.
        for inst in main {
            match inst {
                Inst::Call { func, .. } => assert!(program.sigs[*func].ret.is_some()),
                Inst::CallVoid { func, .. } => assert!(program.sigs[*func].ret.is_none()),
                _ => {}
            }
        }
    }

    #[test]
    fn map_accesses_are_volatile() {
        let program = lower(
            "module A;\n\
             @map border at $D020: byte;\n\
             export function main(): void { border = border; }\n",
        );
        let main = insts_of(&program, "A::main");
        assert!(main
            .iter()
            .any(|i| matches!(i, Inst::Load { volatile: true, .. })));
        assert!(main
            .iter()
            .any(|i| matches!(i, Inst::Store { volatile: true, .. })));
    }

    #[test]
    fn compact_switch_becomes_a_jump_table() {
        use blend65_codegen::ir::Term;
        let program = lower(
            "module A;\n\
             export function main(): void {\n\
               let x: byte = peek($0400);\n\
               switch (x) {\n\
                 case 0: poke($0401, 1);\n\
                 case 1: poke($0401, 2);\n\
                 case 2: poke($0401, 3);\n\
                 default: poke($0401, 4);\n\
               }\n\
             }\n",
        );
        let func = &program.functions[0];
        let has_table = func
            .layout
            .iter()
            .any(|&b| matches!(func.blocks[b].term, Term::JumpTable { .. }));
        assert!(has_table);
    }

    #[test]
    fn sparse_switch_becomes_a_compare_chain() {
        use blend65_codegen::ir::Term;
        let program = lower(
            "module A;\n\
             export function main(): void {\n\
               let x: byte = peek($0400);\n\
               switch (x) {\n\
                 case 1: poke($0401, 1);\n\
                 case 200: poke($0401, 2);\n\
               }\n\
             }\n",
        );
        let func = &program.functions[0];
        let has_table = func
            .layout
            .iter()
            .any(|&b| matches!(func.blocks[b].term, Term::JumpTable { .. }));
        assert!(!has_table);
        let cmps = func
            .layout
            .iter()
            .flat_map(|&b| func.blocks[b].insts.iter())
            .filter(|i| matches!(i, Inst::Cmp { .. }))
            .count();
        assert_eq!(cmps, 2);
    }

    #[test]
    fn const_length_folds_to_an_immediate() {
        let program = lower(
            "module A;\n\
             let table: byte[16] = [0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0];\n\
             export function main(): void { pokew($0400, length(table)); }\n",
        );
        let main = insts_of(&program, "A::main");
        assert!(main
            .iter()
            .any(|i| matches!(i, Inst::Const { value: 16, .. })));
        assert!(!main.iter().any(|i| matches!(i, Inst::Call { .. })));
    }

    #[test]
    fn globals_get_data_and_storage_classes() {
        let program = lower(
            "module A;\n\
             @zp let counter: byte = 0;\n\
             let table: byte[3] = [1, 2, 3];\n\
             export function main(): void {\n\
               counter += 1;\n\
               poke($0400, table[counter]);\n\
             }\n",
        );
        let counter = program
            .globals
            .values()
            .find(|g| g.name == "A::counter")
            .unwrap();
        assert_eq!(counter.storage, StorageClass::Zp);
        let table = program
            .globals
            .values()
            .find(|g| g.name == "A::table")
            .unwrap();
        assert_eq!(table.init.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
