//! Lexical analyzer (design note §4.2).
//!
//! No file in `ouros` covers this directly — it delegates parsing to
//! `ruff_python_parser`, an external crate. Grounded instead on
//! `original_source/smilelib/src/parsing/lexer/{lexer.c,lexnames.c,lexnumbers.c}`
//! for exact token-family boundaries and escape/number grammar, written in
//! the idiomatic-Rust shape the rest of this crate uses (an explicit
//! `TokenKind` enum rather than a numeric opcode, `Result`-free `next()` per
//! design note's "the lexer never throws" contract).

use crate::intern::{Symbol, SymbolTable};
use crate::value::LexerPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Bar,
    Colon,
    Semicolon,
    Comma,
    Backtick,
    Dot,

    AlphaName,
    PunctName,
    UnknownAlphaName,
    UnknownPunctName,

    Byte,
    Int16,
    Int32,
    Int64,
    Real32,
    Real64,
    Real128,
    Float32,
    Float64,
    Float128,

    RawString,
    DynString,
    Char,
    Uni,

    LoanwordSyntax,
    LoanwordLoanword,
    LoanwordRegex,
    LoanwordCustom,

    EqEqEq,
    NeEqEq,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Equal,

    Eoi,
    Error,
}

#[derive(Debug, Clone)]
pub enum TokenData {
    None,
    Symbol(Symbol),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Real32Bits(u32),
    Real64Bits(u64),
    Float32(f32),
    Float64(f64),
    Char(u8),
    Uni(char),
    /// Regex source text for a `#/pattern/flags` loanword token.
    Regex { pattern: String, flags: String },
    /// A `"..."` dynamic string containing at least one unescaped `{expr}`
    /// interpolation (design note §4.2 "Strings"). Absent for plain dynamic
    /// strings, which keep using `token.text` directly as before.
    Interpolated(Vec<StringSegment>),
}

/// One piece of a `"..."` dynamic string that contains `{…}` interpolation:
/// either literal text or the raw source of an embedded expression, parsed
/// lazily by the parser rather than here (the lexer has no AST to build).
#[derive(Debug, Clone)]
pub enum StringSegment {
    Literal(String),
    Expr(String),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub data: TokenData,
    pub has_escapes: bool,
    pub is_first_content_on_line: bool,
    pub position: LexerPosition,
}

/// A 16-slot ring buffer of previously-produced tokens, supporting up to 15
/// `unget` operations, as design note §4.2 requires.
const RING_SIZE: usize = 16;

pub struct Lexer<'a> {
    input: &'a [u8],
    filename: Symbol,
    pos: usize,
    line: u32,
    line_start: usize,
    at_line_start: bool,

    ring: Vec<Option<Token>>,
    /// Index of the next slot `next()` will produce into / read from.
    ring_head: usize,
    /// Count of tokens currently ahead of `ring_head` available to replay
    /// (i.e. how many times `unget` has been called since they were produced).
    ungotten: usize,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(input: &'a [u8], filename: Symbol, start_line: u32, start_column: u32) -> Self {
        let _ = start_column;
        Self {
            input,
            filename,
            pos: 0,
            line: start_line,
            line_start: 0,
            at_line_start: true,
            ring: std::iter::repeat_n((), RING_SIZE).map(|()| None).collect(),
            ring_head: 0,
            ungotten: 0,
        }
    }

    /// Un-reads the most recently produced token, so the next `next()` call
    /// replays it. Supports up to `RING_SIZE - 1` consecutive ungets.
    pub fn unget(&mut self) {
        if self.ungotten < RING_SIZE - 1 {
            self.ring_head = (self.ring_head + RING_SIZE - 1) % RING_SIZE;
            self.ungotten += 1;
        }
    }

    /// Applies a `#loanword` rule's regex at the current input position
    /// (design note §4.3 "User loanword rules"): skips whitespace up to and
    /// including the next newline, then matches `regex` anchored at the
    /// resulting position. On a match, advances past the matched text and
    /// returns every capture group (index 0 is the whole match), paired with
    /// its name for named groups. Returns `None` without consuming anything
    /// if the regex does not match right there.
    pub fn match_loanword_regex(&mut self, regex: &regex::Regex) -> Option<Vec<(Option<String>, String)>> {
        loop {
            match self.peek_byte() {
                Some(b' ' | b'\t' | b'\r') => {
                    self.advance();
                }
                Some(b'\n') => {
                    self.advance();
                    break;
                }
                _ => break,
            }
        }
        let haystack = std::str::from_utf8(&self.input[self.pos..]).ok()?;
        let caps = regex.captures(haystack)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 {
            return None;
        }
        let names: Vec<Option<&str>> = regex.capture_names().collect();
        let result: Vec<(Option<String>, String)> = names
            .into_iter()
            .enumerate()
            .filter_map(|(i, name)| caps.get(i).map(|m| (name.map(str::to_string), m.as_str().to_owned())))
            .collect();
        for _ in 0..whole.end() {
            self.advance();
        }
        Some(result)
    }

    pub fn next(&mut self, symbols: &mut SymbolTable) -> Token {
        if self.ungotten > 0 {
            self.ungotten -= 1;
            let token = self.ring[self.ring_head].clone().expect("ring buffer slot empty on replay");
            self.ring_head = (self.ring_head + 1) % RING_SIZE;
            return token;
        }
        let token = self.produce(symbols);
        self.ring[self.ring_head] = Some(token.clone());
        self.ring_head = (self.ring_head + 1) % RING_SIZE;
        token
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
            self.at_line_start = true;
        }
        Some(b)
    }

    fn position(&self, start: usize) -> LexerPosition {
        LexerPosition {
            filename: self.filename,
            line: self.line,
            column: u32::try_from(start.saturating_sub(self.line_start) + 1).unwrap_or(u32::MAX),
            line_start_offset: u32::try_from(self.line_start).unwrap_or(u32::MAX),
            length: u32::try_from(self.pos - start).unwrap_or(u32::MAX),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn produce(&mut self, symbols: &mut SymbolTable) -> Token {
        self.skip_whitespace();
        let was_first = self.at_line_start;
        self.at_line_start = false;
        let start = self.pos;

        let Some(b) = self.peek_byte() else {
            return self.make(TokenKind::Eoi, start, String::new(), TokenData::None, false, was_first);
        };

        if let Some(kind) = delimiter_kind(b) {
            self.advance();
            let text = (b as char).to_string();
            return self.make(kind, start, text, TokenData::None, false, was_first);
        }

        if b == b'\'' {
            return self.lex_raw_string(start, was_first);
        }
        if b == b'"' {
            return self.lex_dyn_string(start, was_first);
        }
        if b == b'`' {
            self.advance();
            return self.make(TokenKind::Backtick, start, "`".to_owned(), TokenData::None, false, was_first);
        }
        if b == b'#' {
            return self.lex_loanword(start, was_first);
        }
        if b.is_ascii_digit() {
            return self.lex_number(start, was_first);
        }
        if b == b'.' {
            self.advance();
            return self.make(TokenKind::Dot, start, ".".to_owned(), TokenData::None, false, was_first);
        }
        if is_identifier_start(b) {
            return self.lex_name(start, was_first, symbols);
        }
        if is_punct_char(b) {
            return self.lex_punct(start, was_first, symbols);
        }

        self.advance();
        self.make(
            TokenKind::Error,
            start,
            format!("unexpected byte 0x{b:02X}"),
            TokenData::None,
            false,
            was_first,
        )
    }

    fn make(
        &self,
        kind: TokenKind,
        start: usize,
        text: String,
        data: TokenData,
        has_escapes: bool,
        was_first: bool,
    ) -> Token {
        Token {
            kind,
            text,
            data,
            has_escapes,
            is_first_content_on_line: was_first,
            position: self.position(start),
        }
    }

    fn lex_name(&mut self, start: usize, was_first: bool, symbols: &mut SymbolTable) -> Token {
        let mut has_escapes = false;
        let mut text = String::new();
        let mut script = IdentScript::default();
        loop {
            match self.peek_byte() {
                Some(b'\\') => {
                    has_escapes = true;
                    self.advance();
                    if let Some(c) = self.read_escape() {
                        script.note(c);
                        text.push(c);
                    }
                }
                Some(b) if b < 0x80 && is_identifier_continue(b) => {
                    script.note(b as char);
                    text.push(b as char);
                    self.advance();
                }
                Some(b) if b >= 0x80 => {
                    let Some(c) = self.advance_utf8_char() else { break };
                    script.note(c);
                    text.push(c);
                }
                Some(b'-') if self.peek_at(1).is_some_and(is_identifier_continue) => {
                    text.push('-');
                    self.advance();
                }
                _ => break,
            }
        }
        // design note §8 "Mixed-script identifiers ... produce a lex error".
        if script.mixed {
            return self.make(TokenKind::Error, start, format!("mixed-script identifier `{text}`"), TokenData::None, has_escapes, was_first);
        }
        let known = symbols.get_symbol_no_create(&text);
        let (kind, data) = match known {
            Some(sym) => (TokenKind::AlphaName, TokenData::Symbol(sym)),
            None => (TokenKind::UnknownAlphaName, TokenData::None),
        };
        self.make(kind, start, text, data, has_escapes, was_first)
    }

    /// Decodes one full UTF-8 scalar value starting at the current position,
    /// advancing past all of its bytes. `is_identifier_start`/`_continue`
    /// admit any byte `>= 0x80` without distinguishing lead from
    /// continuation bytes, so this is what turns that approximation into an
    /// actual `char` for `text` and script classification.
    fn advance_utf8_char(&mut self) -> Option<char> {
        let lead = self.peek_byte()?;
        let len = match lead {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let start = self.pos;
        for _ in 0..len {
            self.advance()?;
        }
        std::str::from_utf8(&self.input[start..self.pos]).ok()?.chars().next()
    }

    fn read_escape(&mut self) -> Option<char> {
        match self.advance()? {
            b'n' => Some('\n'),
            b't' => Some('\t'),
            b'r' => Some('\r'),
            b'x' => {
                let hi = self.advance()?;
                let lo = self.advance()?;
                let byte = (hex_digit(hi)? << 4) | hex_digit(lo)?;
                Some(byte as char)
            }
            b'u' => {
                let mut value: u32 = 0;
                for _ in 0..4 {
                    value = value * 16 + u32::from(hex_digit(self.advance()?)?);
                }
                char::from_u32(value)
            }
            other => Some(other as char),
        }
    }

    fn lex_punct(&mut self, start: usize, was_first: bool, symbols: &mut SymbolTable) -> Token {
        // Equality/comparison tokens are recognized up front (design note §4.2).
        if let Some(kind) = self.try_lex_comparison() {
            let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
            return self.make(kind, start, text, TokenData::None, false, was_first);
        }
        let mut text = String::new();
        while let Some(b) = self.peek_byte() {
            if is_punct_char(b) {
                text.push(b as char);
                self.advance();
            } else {
                break;
            }
        }
        // Greedy lookahead un-consumes a trailing `=` so e.g. `^=` stays
        // splittable into `^` and `=` for op-equal handling by the parser.
        if text.len() > 1 && text.ends_with('=') && text != "==" {
            text.pop();
            self.pos -= 1;
        }
        if text == "=" {
            return self.make(TokenKind::Equal, start, text, TokenData::None, false, was_first);
        }
        let known = symbols.get_symbol_no_create(&text);
        let (kind, data) = match known {
            Some(sym) => (TokenKind::PunctName, TokenData::Symbol(sym)),
            None => (TokenKind::UnknownPunctName, TokenData::None),
        };
        self.make(kind, start, text, data, false, was_first)
    }

    fn try_lex_comparison(&mut self) -> Option<TokenKind> {
        let rest = &self.input[self.pos..];
        let table: &[(&[u8], TokenKind)] = &[
            (b"===", TokenKind::EqEqEq),
            (b"!==", TokenKind::NeEqEq),
            (b"==", TokenKind::EqEq),
            (b"!=", TokenKind::NotEq),
            (b"<=", TokenKind::Le),
            (b">=", TokenKind::Ge),
        ];
        for (pattern, kind) in table {
            if rest.starts_with(pattern) {
                self.pos += pattern.len();
                return Some(*kind);
            }
        }
        None
    }

    fn lex_number(&mut self, start: usize, was_first: bool) -> Token {
        let mut digits = String::new();
        let mut is_real = false;
        let mut base = 10u32;

        if self.peek_byte() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.advance();
            self.advance();
            base = 16;
            self.collect_digits(&mut digits, base);
        } else if self.peek_byte() == Some(b'0') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            base = 8;
            self.advance();
            self.collect_digits(&mut digits, base);
        } else {
            self.collect_digits(&mut digits, base);
            if self.peek_byte() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
                is_real = true;
                digits.push('.');
                self.advance();
                self.collect_digits(&mut digits, base);
            }
        }

        let mut is_float = false;
        let mut width_suffix: Option<u8> = None;
        match self.peek_byte() {
            Some(b'f' | b'F') if is_real => {
                is_float = true;
                self.advance();
            }
            Some(b'b' | b'B') if base == 10 && !is_real => {
                width_suffix = Some(8);
                self.advance();
            }
            Some(b'h' | b'H') if base == 10 && !is_real => {
                width_suffix = Some(16);
                self.advance();
            }
            Some(b'L') if base == 10 && !is_real => {
                width_suffix = Some(64);
                self.advance();
            }
            _ => {}
        }
        if let Some(b) = self.peek_byte() {
            if is_identifier_continue(b) {
                while self.peek_byte().is_some_and(is_identifier_continue) {
                    self.advance();
                }
                let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                return self.make(
                    TokenKind::Error,
                    start,
                    format!("invalid trailing characters on numeric literal: {text}"),
                    TokenData::None,
                    false,
                    was_first,
                );
            }
        }

        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        let clean: String = digits.chars().filter(|c| *c != '\'' && *c != '"' && *c != '_').collect();

        if is_real {
            return if is_float {
                let value: f64 = clean.parse().unwrap_or(0.0);
                self.make(TokenKind::Float64, start, text, TokenData::Float64(value), false, was_first)
            } else {
                let value: f64 = clean.parse().unwrap_or(0.0);
                self.make(
                    TokenKind::Real64,
                    start,
                    text,
                    TokenData::Real64Bits(value.to_bits()),
                    false,
                    was_first,
                )
            };
        }

        let parsed = i64::from_str_radix(&clean, base).unwrap_or(0);
        match width_suffix {
            Some(8) => self.make(
                TokenKind::Byte,
                start,
                text,
                TokenData::Byte(parsed as u8),
                false,
                was_first,
            ),
            Some(16) => self.make(
                TokenKind::Int16,
                start,
                text,
                TokenData::Int16(parsed as i16),
                false,
                was_first,
            ),
            Some(64) => self.make(TokenKind::Int64, start, text, TokenData::Int64(parsed), false, was_first),
            _ => self.make(
                TokenKind::Int32,
                start,
                text,
                TokenData::Int32(parsed as i32),
                false,
                was_first,
            ),
        }
    }

    fn collect_digits(&mut self, out: &mut String, base: u32) {
        let mut last_was_sep = false;
        loop {
            match self.peek_byte() {
                Some(b) if (b as char).is_digit(base) => {
                    out.push(b as char);
                    last_was_sep = false;
                    self.advance();
                }
                Some(b'\'' | b'"' | b'_') if !last_was_sep && !out.is_empty() => {
                    last_was_sep = true;
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn lex_raw_string(&mut self, start: usize, was_first: bool) -> Token {
        self.advance(); // opening '
        let mut text = String::new();
        loop {
            match self.advance() {
                Some(b'\'') if self.peek_byte() == Some(b'\'') => {
                    text.push('\'');
                    self.advance();
                }
                Some(b'\'') | None => break,
                Some(b) => text.push(b as char),
            }
        }
        self.make(TokenKind::RawString, start, text, TokenData::None, false, was_first)
    }

    /// Lexes a `"..."` dynamic string (design note §4.2 "Strings": "dynamic
    /// string (with escape sequences and `{…}` interpolation)"). An
    /// unescaped `{` opens an embedded expression, read as raw source text
    /// up to its matching `}` (brace-depth tracked, so a nested `{` inside
    /// the expression doesn't close early); the parser parses that text as
    /// an expression once scopes/loanwords are in context. A string with no
    /// interpolation keeps the plain `TokenData::None` representation so
    /// the common case pays no extra allocation.
    fn lex_dyn_string(&mut self, start: usize, was_first: bool) -> Token {
        self.advance(); // opening "
        let mut text = String::new();
        let mut has_escapes = false;
        let mut segments: Vec<StringSegment> = Vec::new();
        loop {
            match self.peek_byte() {
                Some(b'"') | None => {
                    self.advance();
                    break;
                }
                Some(b'\\') => {
                    has_escapes = true;
                    self.advance();
                    if let Some(c) = self.read_escape() {
                        text.push(c);
                    }
                }
                Some(b'{') => {
                    segments.push(StringSegment::Literal(std::mem::take(&mut text)));
                    self.advance();
                    let mut depth = 1u32;
                    let mut expr_src = String::new();
                    loop {
                        match self.peek_byte() {
                            None => break,
                            Some(b'{') => {
                                depth += 1;
                                expr_src.push('{');
                                self.advance();
                            }
                            Some(b'}') => {
                                self.advance();
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                                expr_src.push('}');
                            }
                            Some(b) => {
                                expr_src.push(b as char);
                                self.advance();
                            }
                        }
                    }
                    segments.push(StringSegment::Expr(expr_src));
                }
                Some(b) => {
                    text.push(b as char);
                    self.advance();
                }
            }
        }
        if segments.is_empty() {
            return self.make(TokenKind::DynString, start, text, TokenData::None, has_escapes, was_first);
        }
        segments.push(StringSegment::Literal(text));
        self.make(TokenKind::DynString, start, String::new(), TokenData::Interpolated(segments), has_escapes, was_first)
    }

    fn lex_loanword(&mut self, start: usize, was_first: bool) -> Token {
        self.advance(); // '#'
        if self.peek_byte() == Some(b'/') {
            self.advance();
            let mut pattern = String::new();
            loop {
                match self.advance() {
                    Some(b'/') | None => break,
                    Some(b'\\') => {
                        pattern.push('\\');
                        if let Some(b) = self.advance() {
                            pattern.push(b as char);
                        }
                    }
                    Some(b) => pattern.push(b as char),
                }
            }
            let mut flags = String::new();
            while self.peek_byte().is_some_and(|b| b.is_ascii_alphabetic()) {
                flags.push(self.advance().unwrap() as char);
            }
            let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
            return self.make(
                TokenKind::LoanwordRegex,
                start,
                text,
                TokenData::Regex { pattern, flags },
                false,
                was_first,
            );
        }
        let mut name = String::new();
        while self.peek_byte().is_some_and(is_identifier_continue) {
            name.push(self.advance().unwrap() as char);
        }
        let kind = match name.as_str() {
            "syntax" => TokenKind::LoanwordSyntax,
            "loanword" => TokenKind::LoanwordLoanword,
            _ => TokenKind::LoanwordCustom,
        };
        self.make(kind, start, name, TokenData::None, false, was_first)
    }
}

fn delimiter_kind(b: u8) -> Option<TokenKind> {
    Some(match b {
        b'(' => TokenKind::LParen,
        b')' => TokenKind::RParen,
        b'[' => TokenKind::LBracket,
        b']' => TokenKind::RBracket,
        b'{' => TokenKind::LBrace,
        b'}' => TokenKind::RBrace,
        b'|' => TokenKind::Bar,
        b':' => TokenKind::Colon,
        // '.' is handled separately in `produce` so that leading decimal
        // points inside number literals don't fight with a plain Dot token.

        b';' => TokenKind::Semicolon,
        b',' => TokenKind::Comma,
        _ => return None,
    })
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// First byte of an identifier: ASCII letter, `_`, `$`, or the lead byte of
/// any non-ASCII UTF-8 scalar (`lex_name` decodes the actual `char` via
/// `advance_utf8_char` once the whole name is collected).
fn is_identifier_start(b: u8) -> bool {
    b == b'_' || b == b'$' || b.is_ascii_alphabetic() || b >= 0x80
}

/// Subsequent identifier characters additionally allow digits and the
/// Smile-specific punctuation set `! ? ' " ~`.
fn is_identifier_continue(b: u8) -> bool {
    is_identifier_start(b) || b.is_ascii_digit() || matches!(b, b'!' | b'?' | b'\'' | b'"' | b'~')
}

fn is_punct_char(b: u8) -> bool {
    matches!(b, b'~' | b'!' | b'?' | b'@' | b'%' | b'^' | b'&' | b'*' | b'=' | b'+' | b'<' | b'>' | b'/' | b'-')
}

/// Unicode script buckets coarse enough to catch the common case (an
/// identifier mixing e.g. Greek and Latin letters) without pulling in a
/// full Unicode Script Extensions table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Greek,
    Cyrillic,
    Han,
    Other,
}

fn script_of(c: char) -> Option<Script> {
    if !c.is_alphabetic() {
        return None;
    }
    Some(match c as u32 {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => Script::Latin,
        0x0370..=0x03FF | 0x1F00..=0x1FFF => Script::Greek,
        0x0400..=0x04FF => Script::Cyrillic,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF => Script::Han,
        _ => Script::Other,
    })
}

/// Tracks the script of the letters seen so far in one identifier; flags
/// `mixed` the first time a letter's script disagrees with an earlier one.
/// `$`, `_`, digits, and escapes that decode to non-letters don't count.
#[derive(Default)]
struct IdentScript {
    seen: Option<Script>,
    mixed: bool,
}

impl IdentScript {
    fn note(&mut self, c: char) {
        let Some(s) = script_of(c) else { return };
        match self.seen {
            None => self.seen = Some(s),
            Some(prev) if prev != s => self.mixed = true,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<TokenKind> {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(src.as_bytes(), filename, 1, 0);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next(&mut symbols);
            if token.kind == TokenKind::Eoi {
                break;
            }
            kinds.push(token.kind);
        }
        kinds
    }

    #[test]
    fn lexes_arithmetic_expression() {
        let kinds = lex_all("1 + 2 * 3");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Int32,
                TokenKind::PunctName,
                TokenKind::Int32,
                TokenKind::PunctName,
                TokenKind::Int32
            ]
        );
    }

    #[test]
    fn unget_replays_last_token() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(b"1 2", filename, 1, 0);
        let first = lexer.next(&mut symbols);
        lexer.unget();
        let replayed = lexer.next(&mut symbols);
        assert_eq!(first.text, replayed.text);
        let second = lexer.next(&mut symbols);
        assert_eq!(second.text, "2");
    }

    #[test]
    fn recognizes_builtin_loanwords() {
        let kinds = lex_all("#syntax #loanword #/ab+/i #custom");
        assert_eq!(
            kinds,
            vec![
                TokenKind::LoanwordSyntax,
                TokenKind::LoanwordLoanword,
                TokenKind::LoanwordRegex,
                TokenKind::LoanwordCustom,
            ]
        );
    }

    #[test]
    fn match_loanword_regex_skips_to_newline_then_matches_and_advances() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(b"#hex\n  1A2B rest", filename, 1, 0);
        let token = lexer.next(&mut symbols); // `#hex`
        assert_eq!(token.kind, TokenKind::LoanwordCustom);
        let regex = regex::Regex::new(r"[0-9A-Fa-f]+").unwrap();
        let caps = lexer.match_loanword_regex(&regex).expect("regex should match");
        assert_eq!(caps[0], (None, "1A2B".to_owned()));
        let rest = lexer.next(&mut symbols);
        assert_eq!(rest.text, "rest");
    }

    #[test]
    fn match_loanword_regex_returns_none_when_not_anchored_at_position() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(b"#hex\nxyz 1A2B", filename, 1, 0);
        lexer.next(&mut symbols); // `#hex`
        let regex = regex::Regex::new(r"[0-9A-Fa-f]+").unwrap();
        assert!(lexer.match_loanword_regex(&regex).is_none());
    }

    #[test]
    fn plain_dynstring_has_no_interpolated_data() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(br#""hello world""#, filename, 1, 0);
        let token = lexer.next(&mut symbols);
        assert_eq!(token.kind, TokenKind::DynString);
        assert_eq!(token.text, "hello world");
        assert!(matches!(token.data, TokenData::None));
    }

    #[test]
    fn dynstring_with_interpolation_splits_into_segments() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(br#""count: {n + 1} items""#, filename, 1, 0);
        let token = lexer.next(&mut symbols);
        assert_eq!(token.kind, TokenKind::DynString);
        let TokenData::Interpolated(segments) = token.data else { panic!("expected interpolated segments") };
        assert_eq!(segments.len(), 3);
        assert!(matches!(&segments[0], StringSegment::Literal(s) if s == "count: "));
        assert!(matches!(&segments[1], StringSegment::Expr(s) if s == "n + 1"));
        assert!(matches!(&segments[2], StringSegment::Literal(s) if s == " items"));
    }

    #[test]
    fn dynstring_interpolation_handles_nested_braces() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(br#""result: { { x } }""#, filename, 1, 0);
        let token = lexer.next(&mut symbols);
        let TokenData::Interpolated(segments) = token.data else { panic!("expected interpolated segments") };
        assert!(matches!(&segments[1], StringSegment::Expr(s) if s == " { x } "));
    }

    #[test]
    fn number_suffixes_select_width() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new(b"5b 5h 5L", filename, 1, 0);
        assert_eq!(lexer.next(&mut symbols).kind, TokenKind::Byte);
        assert_eq!(lexer.next(&mut symbols).kind, TokenKind::Int16);
        assert_eq!(lexer.next(&mut symbols).kind, TokenKind::Int64);
    }

    #[test]
    fn single_script_non_ascii_identifier_lexes_normally() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new("αβγ".as_bytes(), filename, 1, 0);
        let token = lexer.next(&mut symbols);
        assert_eq!(token.kind, TokenKind::UnknownAlphaName);
        assert_eq!(token.text, "αβγ");
    }

    #[test]
    fn mixed_script_identifier_is_a_lex_error() {
        let mut symbols = SymbolTable::new();
        let filename = symbols.get_symbol("test.sm");
        let mut lexer = Lexer::new("αβγabc".as_bytes(), filename, 1, 0);
        let token = lexer.next(&mut symbols);
        assert_eq!(token.kind, TokenKind::Error);
        assert!(token.text.contains("mixed-script"));
    }
}
