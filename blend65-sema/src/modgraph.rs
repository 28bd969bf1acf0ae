//! The module import graph.
//!
//! Modules and their import edges form a possibly-cyclic graph. It is
//! represented as an arena of nodes with adjacency lists, cycles are found
//! with a coloring DFS, and the compile order is a topological sort that
//! breaks ties by module name so diagnostics and output are deterministic.

use crate::symbols::ModuleId;
use blend65_entity::{EntityRef, SecondaryMap};
use blend65_frontend::ast::{Item, Module};
use blend65_frontend::diagnostics::{DiagCode, Diagnostic, DiagnosticSink};
use blend65_frontend::intern::{Interner, Name};
use rustc_hash::FxHashMap;

/// The import graph over a set of parsed modules.
pub struct ModuleGraph {
    /// Module name to id.
    by_name: FxHashMap<Name, ModuleId>,
    /// Imports of each module (deduplicated, in first-mention order).
    imports: SecondaryMap<ModuleId, Vec<ModuleId>>,
    /// Topological compile order: importees before importers. Empty when
    /// the graph is cyclic.
    order: Vec<ModuleId>,
    /// Module ids that participate in an import cycle.
    in_cycle: Vec<ModuleId>,
}

impl ModuleGraph {
    /// Build the graph for `modules` (indexed by position = `ModuleId`)
    /// and compute the compile order.
    ///
    /// A cycle is reported as `E_CYCLIC_IMPORT` on each participating
    /// module; those modules are excluded from the returned order so no
    /// later pass runs for them.
    pub fn build(
        modules: &[Module],
        interner: &Interner,
        sink: &mut DiagnosticSink,
    ) -> ModuleGraph {
        let mut by_name = FxHashMap::default();
        for (i, module) in modules.iter().enumerate() {
            // Duplicate module names across files are caught during import
            // resolution; first declaration wins here.
            by_name.entry(module.name).or_insert_with(|| ModuleId::new(i));
        }

        let mut imports: SecondaryMap<ModuleId, Vec<ModuleId>> = SecondaryMap::new();
        for (i, module) in modules.iter().enumerate() {
            let id = ModuleId::new(i);
            let mut edges: Vec<ModuleId> = Vec::new();
            for item in &module.items {
                let Item::Import(imp) = item else { continue };
                // Unknown modules are diagnosed during symbol resolution;
                // the graph only records edges it can resolve.
                if let Some(&target) = by_name.get(&imp.module) {
                    if target != id && !edges.contains(&target) {
                        edges.push(target);
                    }
                }
            }
            imports[id] = edges;
        }

        let mut graph = ModuleGraph {
            by_name,
            imports,
            order: Vec::new(),
            in_cycle: Vec::new(),
        };
        graph.compute_order(modules, interner, sink);
        graph
    }

    /// DFS with coloring: white (unvisited), grey (on stack), black
    /// (done). A grey-to-grey edge closes a cycle.
    fn compute_order(
        &mut self,
        modules: &[Module],
        interner: &Interner,
        sink: &mut DiagnosticSink,
    ) {
        #[derive(Copy, Clone, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let n = modules.len();
        let mut color = vec![Color::White; n];
        let mut order = Vec::with_capacity(n);
        let mut cycle: Vec<ModuleId> = Vec::new();

        // Stable starting order: by module name.
        let mut roots: Vec<ModuleId> = (0..n).map(ModuleId::new).collect();
        roots.sort_by_key(|&m| interner.resolve(modules[m.index()].name));

        fn visit(
            node: ModuleId,
            imports: &SecondaryMap<ModuleId, Vec<ModuleId>>,
            color: &mut [Color],
            order: &mut Vec<ModuleId>,
            cycle: &mut Vec<ModuleId>,
            stack: &mut Vec<ModuleId>,
        ) {
            color[node.index()] = Color::Grey;
            stack.push(node);
            for &dep in &imports[node] {
                match color[dep.index()] {
                    Color::White => visit(dep, imports, color, order, cycle, stack),
                    Color::Grey => {
                        // Everything from `dep` to the top of the stack is
                        // on the cycle.
                        let from = stack.iter().position(|&m| m == dep).unwrap();
                        for &m in &stack[from..] {
                            if !cycle.contains(&m) {
                                cycle.push(m);
                            }
                        }
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color[node.index()] = Color::Black;
            order.push(node);
        }

        let mut stack = Vec::new();
        for root in roots {
            if color[root.index()] == Color::White {
                visit(
                    root,
                    &self.imports,
                    &mut color,
                    &mut order,
                    &mut cycle,
                    &mut stack,
                );
            }
        }

        if !cycle.is_empty() {
            cycle.sort_by_key(|&m| interner.resolve(modules[m.index()].name));
            let names: Vec<&str> = cycle
                .iter()
                .map(|&m| interner.resolve(modules[m.index()].name))
                .collect();
            for &m in &cycle {
                let module = &modules[m.index()];
                sink.report(Diagnostic::new(
                    DiagCode::CyclicImport,
                    module.name_span,
                    format!("modules {{{}}} import each other", names.join(", ")),
                ));
            }
            order.retain(|m| !cycle.contains(m));
        }

        self.order = order;
        self.in_cycle = cycle;
    }

    /// The topological compile order, importees first. Modules on a cycle
    /// are absent.
    pub fn order(&self) -> &[ModuleId] {
        &self.order
    }

    /// Modules that participate in an import cycle.
    pub fn cyclic_modules(&self) -> &[ModuleId] {
        &self.in_cycle
    }

    /// Resolve a module name.
    pub fn resolve(&self, name: Name) -> Option<ModuleId> {
        self.by_name.get(&name).copied()
    }

    /// The resolved imports of `module`.
    pub fn imports_of(&self, module: ModuleId) -> &[ModuleId] {
        &self.imports[module]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blend65_frontend::diagnostics::DiagnosticSink;
    use blend65_frontend::parser::parse_module;
    use blend65_frontend::sourcemap::SourceMap;
    use blend65_frontend::Interner;

    fn build(sources: &[&str]) -> (Vec<Module>, Interner, DiagnosticSink, ModuleGraph) {
        let mut map = SourceMap::new();
        let mut interner = Interner::new();
        let mut sink = DiagnosticSink::new(0);
        let mut modules = Vec::new();
        for (i, src) in sources.iter().enumerate() {
            let file = map.add_file(format!("m{i}.b65"), *src);
            modules.push(parse_module(file, src, &mut interner, &mut sink));
        }
        let graph = ModuleGraph::build(&modules, &interner, &mut sink);
        (modules, interner, sink, graph)
    }

    #[test]
    fn linear_order_puts_importees_first() {
        let (modules, interner, sink, graph) = build(&[
            "module A; import f from B;",
            "module B; export function f(): void { }",
        ]);
        assert!(!sink.has_errors());
        let order: Vec<&str> = graph
            .order()
            .iter()
            .map(|&m| interner.resolve(modules[m.index()].name))
            .collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn cycle_is_reported_for_all_participants() {
        let (_, _, sink, graph) = build(&[
            "module A; import g from B;",
            "module B; import f from A;",
        ]);
        let cyclic: Vec<_> = sink
            .iter()
            .filter(|d| d.code == DiagCode::CyclicImport)
            .collect();
        assert_eq!(cyclic.len(), 2);
        assert!(cyclic[0].message.contains("A"));
        assert!(cyclic[0].message.contains("B"));
        assert!(graph.order().is_empty());
        assert_eq!(graph.cyclic_modules().len(), 2);
    }

    #[test]
    fn independent_modules_order_by_name() {
        let (modules, interner, _, graph) = build(&["module Z;", "module A;"]);
        let order: Vec<&str> = graph
            .order()
            .iter()
            .map(|&m| interner.resolve(modules[m.index()].name))
            .collect();
        assert_eq!(order, vec!["A", "Z"]);
    }

    #[test]
    fn self_contained_cycle_leaves_other_modules_compilable() {
        let (modules, interner, _, graph) = build(&[
            "module A; import g from B;",
            "module B; import f from A;",
            "module C;",
        ]);
        let order: Vec<&str> = graph
            .order()
            .iter()
            .map(|&m| interner.resolve(modules[m.index()].name))
            .collect();
        assert_eq!(order, vec!["C"]);
    }
}
