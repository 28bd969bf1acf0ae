//! Source files, spans and line/column resolution.
//!
//! Positions are byte offsets into UTF-8 source text. A [`Span`] is the
//! compact `(file, offset, length)` triple attached to every token, AST
//! node and diagnostic; line and column numbers are derived on demand from
//! a per-file table of line start offsets, so nothing in the hot path pays
//! for them.

use blend65_entity::{entity_impl, PrimaryMap};
use core::fmt;

/// An opaque reference to a registered source file.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct SourceId(u32);
entity_impl!(SourceId, "src");

/// A contiguous byte region of one source file.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Span {
    /// The file this span points into.
    pub file: SourceId,
    /// Byte offset of the first byte.
    pub start: u32,
    /// Length in bytes.
    pub len: u32,
}

impl Span {
    /// Create a new span.
    pub fn new(file: SourceId, start: u32, len: u32) -> Self {
        Self { file, start, len }
    }

    /// Byte offset one past the last byte.
    pub fn end(self) -> u32 {
        self.start + self.len
    }

    /// The smallest span covering both `self` and `other`.
    ///
    /// Both spans must point into the same file.
    pub fn merge(self, other: Span) -> Span {
        debug_assert_eq!(self.file, other.file);
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Span::new(self.file, start, end - start)
    }
}

/// A 1-based line/column position, derived from a `Span` on demand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LineCol {
    /// Line number, starting from 1.
    pub line: u32,
    /// Column number in bytes, starting from 1.
    pub col: u32,
}

impl fmt::Display for LineCol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

struct SourceFile {
    name: String,
    text: String,
    /// Byte offset of the first byte of every line, in ascending order.
    /// Always starts with 0.
    line_starts: Vec<u32>,
}

/// Registry of all source files in one compilation.
///
/// Files are registered once, up front, and referenced by `SourceId`
/// everywhere else.
pub struct SourceMap {
    files: PrimaryMap<SourceId, SourceFile>,
}

impl SourceMap {
    /// Create an empty source map.
    pub fn new() -> Self {
        Self {
            files: PrimaryMap::new(),
        }
    }

    /// Register a file and return its id.
    pub fn add_file(&mut self, name: impl Into<String>, text: impl Into<String>) -> SourceId {
        let text = text.into();
        let mut line_starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        self.files.push(SourceFile {
            name: name.into(),
            text,
            line_starts,
        })
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All registered file ids, in registration order.
    pub fn files(&self) -> impl Iterator<Item = SourceId> {
        self.files.keys()
    }

    /// The name the file was registered under.
    pub fn file_name(&self, id: SourceId) -> &str {
        &self.files[id].name
    }

    /// The complete text of a file.
    pub fn source(&self, id: SourceId) -> &str {
        &self.files[id].text
    }

    /// The text a span points at.
    pub fn span_text(&self, span: Span) -> &str {
        let text = &self.files[span.file].text;
        &text[span.start as usize..span.end() as usize]
    }

    /// Resolve a byte offset to a 1-based line/column pair.
    pub fn line_col(&self, file: SourceId, offset: u32) -> LineCol {
        let starts = &self.files[file].line_starts;
        let line = match starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        LineCol {
            line: line as u32 + 1,
            col: offset - starts[line] + 1,
        }
    }

    /// The full text of a 1-based line, without its terminator.
    pub fn line_text(&self, file: SourceId, line: u32) -> &str {
        let f = &self.files[file];
        let i = (line - 1) as usize;
        let start = f.line_starts[i] as usize;
        let end = f
            .line_starts
            .get(i + 1)
            .map_or(f.text.len(), |&s| s as usize);
        f.text[start..end].trim_end_matches(['\n', '\r'])
    }
}

impl Default for SourceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_lookup() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.b65", "module A;\nlet x: byte = 1;\n");

        assert_eq!(map.line_col(id, 0), LineCol { line: 1, col: 1 });
        assert_eq!(map.line_col(id, 7), LineCol { line: 1, col: 8 });
        // First byte of line 2.
        assert_eq!(map.line_col(id, 10), LineCol { line: 2, col: 1 });
        assert_eq!(map.line_text(id, 2), "let x: byte = 1;");
    }

    #[test]
    fn span_text_and_merge() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.b65", "module A;");
        let a = Span::new(id, 0, 6);
        let b = Span::new(id, 7, 1);
        assert_eq!(map.span_text(a), "module");
        let m = a.merge(b);
        assert_eq!((m.start, m.len), (0, 8));
    }

    #[test]
    fn offsets_on_last_line_without_newline() {
        let mut map = SourceMap::new();
        let id = map.add_file("a.b65", "abc");
        assert_eq!(map.line_col(id, 2), LineCol { line: 1, col: 3 });
        assert_eq!(map.line_text(id, 1), "abc");
    }
}
