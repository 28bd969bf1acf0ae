//! Diagnostics: codes, severities, the per-compilation sink and rendering.
//!
//! Every user-visible problem in any pass is reported as a [`Diagnostic`]
//! carrying a stable machine-parseable code, a primary span and optional
//! related spans. Diagnostics are immutable once emitted and accumulate in
//! an append-only [`DiagnosticSink`]; the pipeline consults the sink's error
//! count at the gate before IL generation.

use crate::sourcemap::{SourceMap, Span};
use core::fmt;
use std::fmt::Write as _;

/// How bad a diagnostic is.
///
/// `Bug` is reserved for internal invariant violations; a single `Bug`
/// aborts the pipeline regardless of any option.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum Severity {
    /// Informational note attached to another diagnostic.
    Note,
    /// A problem that does not stop compilation.
    Warning,
    /// A problem that stops the pipeline at the IL gate.
    Error,
    /// An internal compiler invariant was violated.
    Bug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Note => write!(f, "note"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Bug => write!(f, "internal error"),
        }
    }
}

/// The closed set of diagnostic kinds.
///
/// The string form of each code (`DiagCode::code`) is a stable identifier;
/// tools match on it and it never changes meaning between releases.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum DiagCode {
    // Lexical.
    /// A byte that can't begin any token.
    UnexpectedCharacter,
    /// An `@` marker other than the five storage classes.
    InvalidStorageClass,
    /// A numeric prefix with no digits, or a value above 65535.
    InvalidNumericLiteral,
    /// A string literal with no closing delimiter.
    UnterminatedString,
    /// A block comment with no closing `*/`.
    UnterminatedComment,

    // Structural.
    /// A token that doesn't fit the grammar where it appears.
    SyntaxError,
    /// A second `module` declaration in one file.
    DuplicateModule,
    /// A token that can't start a top-level form.
    UnexpectedTopLevel,
    /// `const` declared without an initializer.
    MissingConstInitializer,
    /// More than one exported `main`.
    DuplicateExportedMain,
    /// The import graph contains a cycle.
    CyclicImport,
    /// `main` was not exported; it is exported implicitly.
    ImplicitMainExport,

    // Declarative.
    /// Two declarations of the same name in one scope.
    DuplicateDeclaration,
    /// An import whose source module or symbol does not exist.
    UnresolvedImport,
    /// A reference to a name that is not in scope.
    UndefinedIdentifier,
    /// Two `@map` declarations with overlapping address ranges.
    MapOverlap,
    /// An address outside the target's addressable memory.
    InvalidAddress,

    // Type.
    /// A value of one type where another was required.
    TypeMismatch,
    /// A call with the wrong number of arguments.
    WrongArgumentCount,
    /// Assignment to something that is not an lvalue.
    NotAnLvalue,
    /// A condition that is not `bool`.
    NonBoolCondition,
    /// Indexing into a non-array value.
    IndexNonArray,
    /// Member access on something without members.
    InvalidMemberAccess,
    /// A narrowing cast that can lose data.
    CastTruncates,
    /// A construct reserved for a future language version.
    UnsupportedLanguageFeature,

    // Dataflow.
    /// A local read on some path before any assignment.
    UseBeforeAssign,
    /// An import that is never referenced.
    UnusedImport,
    /// A variable that is never read.
    UnusedVariable,
    /// A function unreachable from any exported root.
    UnusedFunction,
    /// Statements that can never execute.
    DeadCode,
    /// A cycle in the call graph.
    RecursiveCall,

    // Hardware.
    /// Two functions write the same SID control register.
    SidControlConflict,
    /// Two functions write the same SID envelope/frequency register.
    SidVoiceConflict,
    /// Zero-page demand exceeds the target budget.
    ZeroPageOverflow,
    /// A function body exceeds the VIC-II badline cycle budget.
    BadlineOverrun,

    // Internal.
    /// An internal invariant does not hold. Always aborts.
    Internal,
}

impl DiagCode {
    /// The stable identifier of this code.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnexpectedCharacter => "E_UNEXPECTED_CHARACTER",
            Self::InvalidStorageClass => "E_INVALID_STORAGE_CLASS",
            Self::InvalidNumericLiteral => "E_INVALID_NUMERIC_LITERAL",
            Self::UnterminatedString => "E_UNTERMINATED_STRING",
            Self::UnterminatedComment => "E_UNTERMINATED_COMMENT",
            Self::SyntaxError => "E_SYNTAX_ERROR",
            Self::DuplicateModule => "E_DUPLICATE_MODULE",
            Self::UnexpectedTopLevel => "E_UNEXPECTED_TOP_LEVEL",
            Self::MissingConstInitializer => "E_MISSING_CONST_INITIALIZER",
            Self::DuplicateExportedMain => "E_DUPLICATE_EXPORTED_MAIN",
            Self::CyclicImport => "E_CYCLIC_IMPORT",
            Self::ImplicitMainExport => "W_IMPLICIT_MAIN_EXPORT",
            Self::DuplicateDeclaration => "E_DUPLICATE_DECLARATION",
            Self::UnresolvedImport => "E_UNRESOLVED_IMPORT",
            Self::UndefinedIdentifier => "E_UNDEFINED_IDENTIFIER",
            Self::MapOverlap => "E_MAP_OVERLAP",
            Self::InvalidAddress => "E_INVALID_ADDRESS",
            Self::TypeMismatch => "E_TYPE_MISMATCH",
            Self::WrongArgumentCount => "E_WRONG_ARGUMENT_COUNT",
            Self::NotAnLvalue => "E_NOT_AN_LVALUE",
            Self::NonBoolCondition => "E_NON_BOOL_CONDITION",
            Self::IndexNonArray => "E_INDEX_NON_ARRAY",
            Self::InvalidMemberAccess => "E_INVALID_MEMBER_ACCESS",
            Self::CastTruncates => "W_CAST_TRUNCATES",
            Self::UnsupportedLanguageFeature => "E_UNSUPPORTED_LANGUAGE_FEATURE",
            Self::UseBeforeAssign => "E_USE_BEFORE_ASSIGN",
            Self::UnusedImport => "W_UNUSED_IMPORT",
            Self::UnusedVariable => "W_UNUSED_VARIABLE",
            Self::UnusedFunction => "W_UNUSED_FUNCTION",
            Self::DeadCode => "W_DEAD_CODE",
            Self::RecursiveCall => "W_RECURSIVE_CALL",
            Self::SidControlConflict => "E_SID_CONTROL_CONFLICT",
            Self::SidVoiceConflict => "W_SID_VOICE_CONFLICT",
            Self::ZeroPageOverflow => "E_ZERO_PAGE_OVERFLOW",
            Self::BadlineOverrun => "W_BADLINE_OVERRUN",
            Self::Internal => "B_INTERNAL",
        }
    }

    /// The severity this code is always reported at.
    ///
    /// `warnings_as_errors` promotion happens at the pipeline gate, not
    /// here; the recorded severity never changes.
    pub fn severity(self) -> Severity {
        match self {
            Self::ImplicitMainExport
            | Self::CastTruncates
            | Self::UnusedImport
            | Self::UnusedVariable
            | Self::UnusedFunction
            | Self::DeadCode
            | Self::RecursiveCall
            | Self::SidVoiceConflict
            | Self::BadlineOverrun => Severity::Warning,
            Self::Internal => Severity::Bug,
            _ => Severity::Error,
        }
    }

    /// A canned remedy for this code, if one is encoded.
    pub fn remedy(self) -> Option<&'static str> {
        match self {
            Self::MissingConstInitializer => {
                Some("add an initializer: `const NAME: type = value;`")
            }
            Self::DuplicateModule => Some("a file declares its module once, on the first line"),
            Self::NonBoolCondition => Some("compare explicitly, e.g. `x != 0`"),
            Self::CastTruncates => Some("use `byte(x)` only when the high byte is known to be 0"),
            Self::UseBeforeAssign => Some("initialize the variable on every path before this use"),
            Self::UnusedImport => Some("remove the import"),
            Self::MapOverlap => Some("give each @map declaration a disjoint address range"),
            Self::UnsupportedLanguageFeature => {
                Some("this construct is reserved for a future language version")
            }
            _ => None,
        }
    }
}

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single immutable diagnostic record.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Diagnostic {
    /// Recorded severity; always `code.severity()`.
    pub severity: Severity,
    /// The stable kind.
    pub code: DiagCode,
    /// Where the problem is.
    pub span: Span,
    /// Human-readable message. Deterministic for identical inputs.
    pub message: String,
    /// Other locations that participate in the problem, each with a label.
    pub related: Vec<(Span, String)>,
}

impl Diagnostic {
    /// Create a diagnostic with the code's default severity.
    pub fn new(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self {
            severity: code.severity(),
            code,
            span,
            message: message.into(),
            related: Vec::new(),
        }
    }

    /// Attach a related span with a label.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related.push((span, label.into()));
        self
    }
}

/// Append-only collection of diagnostics for one compilation.
///
/// The sink records everything; `max_diagnostics` only limits how many
/// records are kept, never the counts, so the error gate stays correct even
/// when output is truncated.
pub struct DiagnosticSink {
    diags: Vec<Diagnostic>,
    max_diagnostics: usize,
    errors: usize,
    warnings: usize,
    suppressed: usize,
}

impl DiagnosticSink {
    /// Create a sink keeping at most `max_diagnostics` records
    /// (0 = unlimited).
    pub fn new(max_diagnostics: usize) -> Self {
        Self {
            diags: Vec::new(),
            max_diagnostics,
            errors: 0,
            warnings: 0,
            suppressed: 0,
        }
    }

    /// Append a diagnostic.
    pub fn report(&mut self, diag: Diagnostic) {
        match diag.severity {
            Severity::Error | Severity::Bug => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Note => {}
        }
        if self.max_diagnostics != 0 && self.diags.len() >= self.max_diagnostics {
            self.suppressed += 1;
            return;
        }
        log::debug!("diagnostic: {} {}", diag.code, diag.message);
        self.diags.push(diag);
    }

    /// Number of error-severity diagnostics seen (including `Bug`).
    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Number of warnings seen.
    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    /// Whether any error-severity diagnostic was seen.
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    /// Whether any internal-bug diagnostic was seen.
    pub fn has_bug(&self) -> bool {
        self.diags.iter().any(|d| d.severity == Severity::Bug)
    }

    /// Number of diagnostics dropped by the `max_diagnostics` limit.
    pub fn suppressed_count(&self) -> usize {
        self.suppressed
    }

    /// The recorded diagnostics, in emission order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diags.iter()
    }

    /// Consume the sink, returning the recorded diagnostics.
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diags
    }

    /// Move every diagnostic out of `other` into `self`, preserving order.
    ///
    /// Used by the merge phase to combine per-module sinks in topological
    /// order.
    pub fn absorb(&mut self, other: DiagnosticSink) {
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.suppressed += other.suppressed;
        for d in other.diags {
            if self.max_diagnostics != 0 && self.diags.len() >= self.max_diagnostics {
                self.suppressed += 1;
            } else {
                self.diags.push(d);
            }
        }
    }
}

/// Render one diagnostic with source context and a caret underline.
///
/// The format is stable:
/// ```text
/// file.b65:3:7: error[E_MAP_OVERLAP]: `vic2` overlaps `vic`
///   @map vic2 at $D020: byte;
///        ^^^^
///   note: remedy: give each @map declaration a disjoint address range
/// ```
pub fn render(diag: &Diagnostic, sources: &SourceMap) -> String {
    let mut out = String::new();
    render_line(&mut out, diag.severity, diag.code, diag.span, &diag.message, sources);
    for (span, label) in &diag.related {
        render_context(&mut out, *span, sources);
        let lc = sources.line_col(span.file, span.start);
        let _ = writeln!(
            out,
            "  note: {}:{}: {}",
            sources.file_name(span.file),
            lc,
            label
        );
    }
    if let Some(remedy) = diag.code.remedy() {
        let _ = writeln!(out, "  note: remedy: {remedy}");
    }
    out
}

fn render_line(
    out: &mut String,
    severity: Severity,
    code: DiagCode,
    span: Span,
    message: &str,
    sources: &SourceMap,
) {
    let lc = sources.line_col(span.file, span.start);
    let _ = writeln!(
        out,
        "{}:{}: {}[{}]: {}",
        sources.file_name(span.file),
        lc,
        severity,
        code,
        message
    );
    render_context(out, span, sources);
}

fn render_context(out: &mut String, span: Span, sources: &SourceMap) {
    let lc = sources.line_col(span.file, span.start);
    let line = sources.line_text(span.file, lc.line);
    let _ = writeln!(out, "  {line}");
    let mut underline = String::from("  ");
    for _ in 1..lc.col {
        underline.push(' ');
    }
    let width = (span.len as usize).clamp(1, line.len().saturating_sub(lc.col as usize - 1).max(1));
    for _ in 0..width {
        underline.push('^');
    }
    let _ = writeln!(out, "{underline}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sourcemap::SourceMap;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DiagCode::DuplicateModule.code(), "E_DUPLICATE_MODULE");
        assert_eq!(DiagCode::MapOverlap.code(), "E_MAP_OVERLAP");
        assert_eq!(DiagCode::UseBeforeAssign.code(), "E_USE_BEFORE_ASSIGN");
        assert_eq!(DiagCode::SidVoiceConflict.code(), "W_SID_VOICE_CONFLICT");
        assert_eq!(DiagCode::SidVoiceConflict.severity(), Severity::Warning);
        assert_eq!(DiagCode::SidControlConflict.severity(), Severity::Error);
    }

    #[test]
    fn sink_counts_and_limit() {
        let mut map = SourceMap::new();
        let f = map.add_file("t.b65", "module A;\n");
        let span = Span::new(f, 0, 6);

        let mut sink = DiagnosticSink::new(1);
        sink.report(Diagnostic::new(DiagCode::DuplicateModule, span, "one"));
        sink.report(Diagnostic::new(DiagCode::UnusedImport, span, "two"));
        assert_eq!(sink.error_count(), 1);
        assert_eq!(sink.warning_count(), 1);
        assert_eq!(sink.iter().count(), 1);
        assert_eq!(sink.suppressed_count(), 1);
        assert!(sink.has_errors());
    }

    #[test]
    fn rendering() {
        let mut map = SourceMap::new();
        let f = map.add_file("t.b65", "module A;\nmodule B;\n");
        let span = Span::new(f, 10, 6);
        let d = Diagnostic::new(DiagCode::DuplicateModule, span, "duplicate module declaration");
        let text = render(&d, &map);
        assert!(text.starts_with("t.b65:2:1: error[E_DUPLICATE_MODULE]"));
        assert!(text.contains("module B;"));
        assert!(text.contains("^^^^^^"));
    }
}
