//! The Blend65 lexer.
//!
//! A pull-based tokenizer: the parser asks for one token at a time, with a
//! push-back slot for the single token of lookahead the grammar needs.
//! Whitespace and comments are skipped uniformly; block comments do not
//! nest.
//!
//! The lexer does not attempt recovery. On a lexical error it reports one
//! diagnostic, stops, and produces `Eof` forever, halting the file.

use crate::diagnostics::{DiagCode, Diagnostic, DiagnosticSink};
use crate::sourcemap::{SourceId, Span};
use crate::token::{Keyword, StorageMarker, Token, TokenKind, WidthHint};

/// Largest value an integer literal may hold.
const MAX_LITERAL: u32 = 0xFFFF;

/// Lexer state for one source file.
pub struct Lexer<'a> {
    src: &'a str,
    file: SourceId,
    pos: usize,
    pushed_back: Option<Token<'a>>,
    failed: bool,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `src`, which must be the text registered for
    /// `file`.
    pub fn new(file: SourceId, src: &'a str) -> Self {
        Self {
            src,
            file,
            pos: 0,
            pushed_back: None,
            failed: false,
        }
    }

    /// Return a token to the stream. At most one token can be pushed back
    /// at a time.
    pub fn push_back(&mut self, token: Token<'a>) {
        debug_assert!(self.pushed_back.is_none(), "push-back slot is occupied");
        self.pushed_back = Some(token);
    }

    /// Produce the next token, reporting lexical errors to `sink`.
    ///
    /// After an error (or the end of input) every subsequent call returns
    /// `Eof`.
    pub fn next_token(&mut self, sink: &mut DiagnosticSink) -> Token<'a> {
        if let Some(tok) = self.pushed_back.take() {
            return tok;
        }
        if self.failed {
            return self.eof();
        }
        loop {
            match self.skip_trivia(sink) {
                Ok(()) => {}
                Err(()) => return self.eof(),
            }
            let start = self.pos;
            let Some(c) = self.peek_byte() else {
                return self.eof();
            };
            return match c {
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.scan_ident(start),
                b'0'..=b'9' | b'$' => match self.scan_number(start, sink) {
                    Ok(tok) => tok,
                    Err(()) => self.eof(),
                },
                b'\'' | b'"' => match self.scan_string(start, sink) {
                    Ok(tok) => tok,
                    Err(()) => self.eof(),
                },
                b'@' => match self.scan_at(start, sink) {
                    Ok(tok) => tok,
                    Err(()) => self.eof(),
                },
                _ => match self.scan_operator(start, sink) {
                    Ok(tok) => tok,
                    Err(()) => self.eof(),
                },
            };
        }
    }

    fn eof(&self) -> Token<'a> {
        Token {
            kind: TokenKind::Eof,
            span: Span::new(self.file, self.src.len() as u32, 0),
        }
    }

    fn fail(&mut self, sink: &mut DiagnosticSink, code: DiagCode, start: usize, msg: String) {
        self.failed = true;
        let span = self.span_from(start);
        sink.report(Diagnostic::new(code, span, msg));
    }

    fn span_from(&self, start: usize) -> Span {
        Span::new(self.file, start as u32, (self.pos - start) as u32)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek_byte_at(&self, n: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek_byte() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skip whitespace and comments. `Err` means an unterminated block
    /// comment was reported.
    fn skip_trivia(&mut self, sink: &mut DiagnosticSink) -> Result<(), ()> {
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_byte_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_byte_at(1) == Some(b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match self.peek_byte() {
                            Some(b'*') if self.peek_byte_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(_) => self.pos += 1,
                            None => {
                                self.fail(
                                    sink,
                                    DiagCode::UnterminatedComment,
                                    start,
                                    "unterminated block comment".to_string(),
                                );
                                return Err(());
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_ident(&mut self, start: usize) -> Token<'a> {
        while let Some(b) = self.peek_byte() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => self.pos += 1,
                _ => break,
            }
        }
        let text = &self.src[start..self.pos];
        let kind = match Keyword::from_ident(text) {
            Some(kw) => TokenKind::Kw(kw),
            None => TokenKind::Ident(text),
        };
        Token {
            kind,
            span: self.span_from(start),
        }
    }

    fn scan_number(&mut self, start: usize, sink: &mut DiagnosticSink) -> Result<Token<'a>, ()> {
        let (radix, prefix): (u32, &str) = if self.eat(b'$') {
            (16, "$")
        } else if self.peek_byte() == Some(b'0') && self.peek_byte_at(1) == Some(b'x') {
            self.pos += 2;
            (16, "0x")
        } else if self.peek_byte() == Some(b'0') && self.peek_byte_at(1) == Some(b'b') {
            self.pos += 2;
            (2, "0b")
        } else {
            (10, "")
        };

        let digits_start = self.pos;
        let mut value: u64 = 0;
        while let Some(b) = self.peek_byte() {
            let digit = match (b as char).to_digit(radix) {
                Some(d) => d,
                None => break,
            };
            value = value * u64::from(radix) + u64::from(digit);
            // Saturate so pathological literals can't overflow u64.
            value = value.min(u64::from(u32::MAX));
            self.pos += 1;
        }

        if !prefix.is_empty() && self.pos == digits_start {
            self.fail(
                sink,
                DiagCode::InvalidNumericLiteral,
                start,
                format!("`{prefix}` must be followed by at least one digit"),
            );
            return Err(());
        }
        if value > u64::from(MAX_LITERAL) {
            self.fail(
                sink,
                DiagCode::InvalidNumericLiteral,
                start,
                format!("literal does not fit in 16 bits (maximum is {MAX_LITERAL})"),
            );
            return Err(());
        }

        let value = value as u32;
        let width = if value <= 0xFF {
            WidthHint::Byte
        } else {
            WidthHint::Word
        };
        Ok(Token {
            kind: TokenKind::Int { value, width },
            span: self.span_from(start),
        })
    }

    fn scan_string(&mut self, start: usize, sink: &mut DiagnosticSink) -> Result<Token<'a>, ()> {
        let delim = self.bump().unwrap();
        let mut decoded = String::new();
        loop {
            match self.bump() {
                None => {
                    self.fail(
                        sink,
                        DiagCode::UnterminatedString,
                        start,
                        "unterminated string literal".to_string(),
                    );
                    return Err(());
                }
                Some(b) if b == delim => break,
                Some(b'\\') => match self.bump() {
                    None => {
                        self.fail(
                            sink,
                            DiagCode::UnterminatedString,
                            start,
                            "unterminated string literal".to_string(),
                        );
                        return Err(());
                    }
                    Some(b'n') => decoded.push('\n'),
                    Some(b't') => decoded.push('\t'),
                    Some(b'r') => decoded.push('\r'),
                    Some(b'\\') => decoded.push('\\'),
                    Some(b'"') => decoded.push('"'),
                    Some(b'\'') => decoded.push('\''),
                    // Any other escape is the literal character.
                    Some(other) => decoded.push(other as char),
                },
                Some(b) => {
                    // Keep multi-byte UTF-8 sequences intact.
                    if b < 0x80 {
                        decoded.push(b as char);
                    } else {
                        let char_start = self.pos - 1;
                        let ch = self.src[char_start..].chars().next().unwrap();
                        self.pos = char_start + ch.len_utf8();
                        decoded.push(ch);
                    }
                }
            }
        }
        Ok(Token {
            kind: TokenKind::Str(decoded),
            span: self.span_from(start),
        })
    }

    /// Lex an `@` form: a storage marker, or a bare `@` (address-of) when
    /// the following word is not a marker. The parser decides whether a
    /// bare `@` is legal where it appears.
    fn scan_at(&mut self, start: usize, sink: &mut DiagnosticSink) -> Result<Token<'a>, ()> {
        self.pos += 1; // consume '@'
        match self.peek_byte() {
            Some(b'A'..=b'Z') | Some(b'a'..=b'z') | Some(b'_') => {
                let word_start = self.pos;
                while let Some(b) = self.peek_byte() {
                    match b {
                        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => self.pos += 1,
                        _ => break,
                    }
                }
                let word = &self.src[word_start..self.pos];
                match StorageMarker::from_word(word) {
                    Some(marker) => Ok(Token {
                        kind: TokenKind::Storage(marker),
                        span: self.span_from(start),
                    }),
                    None => {
                        // Address-of; leave the identifier for the next pull.
                        self.pos = word_start;
                        Ok(Token {
                            kind: TokenKind::At,
                            span: Span::new(self.file, start as u32, 1),
                        })
                    }
                }
            }
            _ => {
                self.pos = start + 1;
                self.fail(
                    sink,
                    DiagCode::InvalidStorageClass,
                    start,
                    "`@` must be followed by a storage class or an identifier".to_string(),
                );
                Err(())
            }
        }
    }

    fn scan_operator(&mut self, start: usize, sink: &mut DiagnosticSink) -> Result<Token<'a>, ()> {
        let c = self.bump().unwrap();
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b'?' => TokenKind::Question,
            b'~' => TokenKind::Tilde,
            b'+' => {
                if self.eat(b'=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat(b'=') {
                    TokenKind::MinusEq
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat(b'=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat(b'=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => {
                if self.eat(b'=') {
                    TokenKind::PercentEq
                } else {
                    TokenKind::Percent
                }
            }
            b'^' => {
                if self.eat(b'=') {
                    TokenKind::CaretEq
                } else {
                    TokenKind::Caret
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    TokenKind::AmpAmp
                } else if self.eat(b'=') {
                    TokenKind::AmpEq
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    TokenKind::PipePipe
                } else if self.eat(b'=') {
                    TokenKind::PipeEq
                } else {
                    TokenKind::Pipe
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'<' => {
                if self.eat(b'<') {
                    if self.eat(b'=') {
                        TokenKind::ShlEq
                    } else {
                        TokenKind::Shl
                    }
                } else if self.eat(b'=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    if self.eat(b'=') {
                        TokenKind::ShrEq
                    } else {
                        TokenKind::Shr
                    }
                } else if self.eat(b'=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            other => {
                self.fail(
                    sink,
                    DiagCode::UnexpectedCharacter,
                    start,
                    format!("unexpected character `{}`", other as char),
                );
                return Err(());
            }
        };
        Ok(Token {
            kind,
            span: self.span_from(start),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sourcemap::SourceMap;

    fn lex_all(src: &str) -> (Vec<Token<'_>>, DiagnosticSink) {
        let mut map = SourceMap::new();
        let file = map.add_file("t.b65", src);
        // The map owns a copy; lex the original to keep lifetimes simple.
        let mut lexer = Lexer::new(file, src);
        let mut sink = DiagnosticSink::new(0);
        let mut toks = Vec::new();
        loop {
            let tok = lexer.next_token(&mut sink);
            let done = tok.kind == TokenKind::Eof;
            toks.push(tok);
            if done {
                break;
            }
        }
        (toks, sink)
    }

    fn kinds(src: &str) -> Vec<TokenKind<'_>> {
        let (toks, sink) = lex_all(src);
        assert!(!sink.has_errors(), "unexpected lex error in {src:?}");
        toks.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            kinds("module main"),
            vec![
                TokenKind::Kw(Keyword::Module),
                TokenKind::Ident("main"),
                TokenKind::Eof
            ]
        );
        // Case-sensitivity: `Module` is an identifier.
        assert_eq!(
            kinds("Module")[0],
            TokenKind::Ident("Module"),
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            kinds("255 256 $D020 0x10 0b101")
                .into_iter()
                .filter_map(|k| match k {
                    TokenKind::Int { value, width } => Some((value, width)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            vec![
                (255, WidthHint::Byte),
                (256, WidthHint::Word),
                (0xD020, WidthHint::Word),
                (0x10, WidthHint::Byte),
                (5, WidthHint::Byte),
            ]
        );
    }

    #[test]
    fn bare_prefix_is_an_error() {
        for src in ["$", "0x", "0b;"] {
            let (toks, sink) = lex_all(src);
            assert!(sink.has_errors(), "expected error for {src:?}");
            assert_eq!(toks.last().unwrap().kind, TokenKind::Eof);
        }
    }

    #[test]
    fn oversized_literal_rejected() {
        let (_, sink) = lex_all("65536");
        assert!(sink.has_errors());
        let (_, sink) = lex_all("65535");
        assert!(!sink.has_errors());
    }

    #[test]
    fn strings_and_escapes() {
        match &kinds("\"a\\tb\\qc\"")[0] {
            TokenKind::Str(s) => assert_eq!(s, "a\tbqc"),
            other => panic!("expected string, got {other:?}"),
        }
        match &kinds("'hi\nthere'")[0] {
            TokenKind::Str(s) => assert_eq!(s, "hi\nthere"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_string() {
        let (_, sink) = lex_all("\"abc");
        assert!(sink.has_errors());
    }

    #[test]
    fn storage_markers_and_address_of() {
        assert_eq!(
            kinds("@zp @map @address @foo"),
            vec![
                TokenKind::Storage(StorageMarker::Zp),
                TokenKind::Storage(StorageMarker::Map),
                TokenKind::Storage(StorageMarker::Address),
                TokenKind::At,
                TokenKind::Ident("foo"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn at_followed_by_garbage() {
        let (_, sink) = lex_all("@1");
        assert!(sink.has_errors());
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("a // line\n/* block\n * more */ b"),
            vec![TokenKind::Ident("a"), TokenKind::Ident("b"), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_block_comment() {
        let (_, sink) = lex_all("/* never closed");
        assert!(sink.has_errors());
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("<<= >>= && || <= >= == != += <<"),
            vec![
                TokenKind::ShlEq,
                TokenKind::ShrEq,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::PlusEq,
                TokenKind::Shl,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn push_back_slot() {
        let mut map = SourceMap::new();
        let file = map.add_file("t.b65", "a b");
        let mut lexer = Lexer::new(file, "a b");
        let mut sink = DiagnosticSink::new(0);
        let a = lexer.next_token(&mut sink);
        lexer.push_back(a.clone());
        assert_eq!(lexer.next_token(&mut sink), a);
        assert_eq!(lexer.next_token(&mut sink).kind, TokenKind::Ident("b"));
    }

    // Token spans partition the non-trivia regions of any lexable input:
    // no overlaps, no gaps over significant characters.
    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(128))]

        #[test]
        fn prop_spans_partition_lexable_input(
            pieces in proptest::collection::vec(
                proptest::prelude::prop_oneof![
                    proptest::prelude::Just("module".to_string()),
                    proptest::prelude::Just("while".to_string()),
                    proptest::prelude::Just("ident_0".to_string()),
                    proptest::prelude::Just("255".to_string()),
                    proptest::prelude::Just("$d020".to_string()),
                    proptest::prelude::Just("0b101".to_string()),
                    proptest::prelude::Just("\"str\"".to_string()),
                    proptest::prelude::Just("@zp".to_string()),
                    proptest::prelude::Just("@foo".to_string()),
                    proptest::prelude::Just("<<=".to_string()),
                    proptest::prelude::Just("&&".to_string()),
                    proptest::prelude::Just(";".to_string()),
                    proptest::prelude::Just("(".to_string()),
                    proptest::prelude::Just("// comment\n".to_string()),
                    proptest::prelude::Just("/* block */".to_string()),
                ],
                0..24,
            )
        ) {
            let src = pieces.join(" ");
            let (toks, sink) = lex_all(&src);
            proptest::prop_assert!(!sink.has_errors());
            let mut last_end = 0u32;
            for tok in &toks {
                if tok.kind == TokenKind::Eof {
                    continue;
                }
                proptest::prop_assert!(tok.span.start >= last_end);
                // The gap before each token is pure trivia.
                let gap = &src[last_end as usize..tok.span.start as usize];
                proptest::prop_assert!(
                    gap.chars().all(|c| c.is_whitespace() || c == '/' || c == '*')
                        || gap.contains("//")
                        || gap.contains("/*"),
                    "unexplained gap {gap:?}"
                );
                last_end = tok.span.end();
            }
        }
    }

    // Spans of lexed tokens must be strictly increasing, non-overlapping,
    // and reproduce the token text exactly.
    #[test]
    fn spans_partition_significant_text() {
        let src = "module A;\nlet x: byte = $10 + 2; // t\n";
        let (toks, sink) = lex_all(src);
        assert!(!sink.has_errors());
        let mut last_end = 0;
        for tok in &toks {
            if tok.kind == TokenKind::Eof {
                continue;
            }
            assert!(tok.span.start >= last_end, "overlap at {tok:?}");
            last_end = tok.span.end();
            let text = &src[tok.span.start as usize..tok.span.end() as usize];
            assert!(!text.is_empty());
            assert!(!text.starts_with(' '));
        }
    }
}
