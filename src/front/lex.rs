//! The lexer.
//!
//! Tokenizing is regex-driven: [`Lexer`] holds a whitespace/comment skipper
//! and an ordered list of matchers, each a `(Regex, Matcher)` pair tried at
//! the current position. The first matcher whose regex matches at `\A` wins,
//! so the list is ordered most-specific first -- keywords before the general
//! identifier pattern, two-character operators before their one-character
//! prefixes.

use derive_more::Display;
use regex::Regex;

use crate::common::Id;

/// A single lexed token together with the 1-indexed source line it started on.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

/// Token classes.
#[derive(Clone, Debug, PartialEq, Display)]
pub enum TokenKind {
    #[display("'int'")]
    Int,
    #[display("'char'")]
    Char,
    #[display("'void'")]
    Void,
    #[display("'if'")]
    If,
    #[display("'else'")]
    Else,
    #[display("'while'")]
    While,
    #[display("'for'")]
    For,
    #[display("'break'")]
    Break,
    #[display("'return'")]
    Return,
    #[display("identifier '{_0}'")]
    Ident(Id),
    #[display("number {_0}")]
    Number(i64),
    #[display("string literal")]
    Str(Vec<u8>),
    #[display("char literal {_0}")]
    CharLit(i64),
    #[display("'('")]
    LParen,
    #[display("')'")]
    RParen,
    #[display("'{{'")]
    LBrace,
    #[display("'}}'")]
    RBrace,
    #[display("';'")]
    Semi,
    #[display("','")]
    Comma,
    #[display("'='")]
    Assign,
    #[display("'+'")]
    Plus,
    #[display("'-'")]
    Minus,
    #[display("'*'")]
    Star,
    #[display("'/'")]
    Slash,
    #[display("'%'")]
    Percent,
    #[display("'<'")]
    Lt,
    #[display("'>'")]
    Gt,
    #[display("'<='")]
    Le,
    #[display("'>='")]
    Ge,
    #[display("'=='")]
    EqEq,
    #[display("'!='")]
    Ne,
    #[display("'&&'")]
    AndAnd,
    #[display("'||'")]
    OrOr,
    #[display("'!'")]
    Not,
    #[display("'&'")]
    Amp,
    #[display("'...'")]
    Ellipsis,
}

#[derive(thiserror::Error, Debug)]
#[error("line {line}: unexpected character {ch:?}")]
pub struct LexError {
    pub line: usize,
    pub ch: char,
}

/// What a matched regex should be turned into. Fixed-kind matchers (keywords,
/// punctuation) carry their `TokenKind` directly; the rest decode the matched
/// text.
enum Matcher {
    Fixed(TokenKind),
    Ident,
    Number,
    Str,
    CharLit,
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, Matcher)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use Matcher::*;
        use TokenKind::*;

        let kw = |word: &str| Regex::new(&format!(r"\A{word}\b")).unwrap();
        let matchers = vec![
            (kw("int"), Fixed(Int)),
            (kw("char"), Fixed(Char)),
            (kw("void"), Fixed(Void)),
            (kw("if"), Fixed(If)),
            (kw("else"), Fixed(Else)),
            (kw("while"), Fixed(While)),
            (kw("for"), Fixed(For)),
            (kw("break"), Fixed(Break)),
            (kw("return"), Fixed(Return)),
            (Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*").unwrap(), Ident),
            (Regex::new(r"\A[0-9]+").unwrap(), Number),
            (Regex::new(r"\A\.\.\.").unwrap(), Fixed(Ellipsis)),
            (Regex::new(r#"\A"(?:[^"\\]|\\.)*""#).unwrap(), Str),
            (Regex::new(r"\A'(?:[^'\\]|\\.)'").unwrap(), CharLit),
            (Regex::new(r"\A<=").unwrap(), Fixed(Le)),
            (Regex::new(r"\A>=").unwrap(), Fixed(Ge)),
            (Regex::new(r"\A==").unwrap(), Fixed(EqEq)),
            (Regex::new(r"\A!=").unwrap(), Fixed(Ne)),
            (Regex::new(r"\A&&").unwrap(), Fixed(AndAnd)),
            (Regex::new(r"\A\|\|").unwrap(), Fixed(OrOr)),
            (Regex::new(r"\A\(").unwrap(), Fixed(LParen)),
            (Regex::new(r"\A\)").unwrap(), Fixed(RParen)),
            (Regex::new(r"\A\{").unwrap(), Fixed(LBrace)),
            (Regex::new(r"\A\}").unwrap(), Fixed(RBrace)),
            (Regex::new(r"\A;").unwrap(), Fixed(Semi)),
            (Regex::new(r"\A,").unwrap(), Fixed(Comma)),
            (Regex::new(r"\A=").unwrap(), Fixed(Assign)),
            (Regex::new(r"\A\+").unwrap(), Fixed(Plus)),
            (Regex::new(r"\A-").unwrap(), Fixed(Minus)),
            (Regex::new(r"\A\*").unwrap(), Fixed(Star)),
            (Regex::new(r"\A/").unwrap(), Fixed(Slash)),
            (Regex::new(r"\A%").unwrap(), Fixed(Percent)),
            (Regex::new(r"\A<").unwrap(), Fixed(Lt)),
            (Regex::new(r"\A>").unwrap(), Fixed(Gt)),
            (Regex::new(r"\A!").unwrap(), Fixed(Not)),
            (Regex::new(r"\A&").unwrap(), Fixed(Amp)),
        ];

        Lexer {
            input,
            pos: 0,
            line: 1,
            whitespace: Regex::new(r"\A(?:[ \t\r\n]|//[^\n]*)*").unwrap(),
            matchers,
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn advance(&mut self, n: usize) {
        self.line += self.input[self.pos..self.pos + n].matches('\n').count();
        self.pos += n;
    }

    // Skip comments and whitespace, tracking line numbers as we go.
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.advance(m.end());
        }
    }

    /// Get the next token, or `None` at end of input.
    ///
    /// The return type distinguishes between end-of-input and a lexer error.
    pub fn next(&mut self) -> Result<Option<Token>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }

        let line = self.line;
        let rest = &self.input[self.pos..];

        for (re, matcher) in &self.matchers {
            let Some(m) = re.find(rest) else { continue };
            let text = m.as_str().to_string();
            let kind = match matcher {
                Matcher::Fixed(kind) => kind.clone(),
                Matcher::Ident => TokenKind::Ident(Id::from(text.clone())),
                Matcher::Number => TokenKind::Number(text.parse().expect("regex guarantees digits")),
                Matcher::Str => TokenKind::Str(decode_escapes(&text[1..text.len() - 1])),
                Matcher::CharLit => {
                    let bytes = decode_escapes(&text[1..text.len() - 1]);
                    TokenKind::CharLit(bytes[0] as i64)
                }
            };
            self.advance(text.len());
            return Ok(Some(Token { kind, line }));
        }

        let ch = rest.chars().next().unwrap();
        Err(LexError { line, ch })
    }
}

/// Decode the backslash escapes recognized by Simple C string/char literals.
/// The payload returned is the raw runtime bytes -- the code generator
/// re-escapes them when emitting `.asciz`.
fn decode_escapes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('\'') => out.push(b'\''),
            Some('0') => out.push(0),
            Some(other) => out.push(other as u8),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        while let Some(tok) = lexer.next().unwrap() {
            out.push(tok.kind);
        }
        out
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("int ifx if"),
            vec![
                TokenKind::Int,
                TokenKind::Ident(Id::from("ifx".to_string())),
                TokenKind::If,
            ]
        );
    }

    #[test]
    fn multi_char_operators_before_prefixes() {
        assert_eq!(
            kinds("<= < == = !="),
            vec![
                TokenKind::Le,
                TokenKind::Lt,
                TokenKind::EqEq,
                TokenKind::Assign,
                TokenKind::Ne,
            ]
        );
    }

    #[test]
    fn string_escape_decoding() {
        let mut lexer = Lexer::new(r#""a\nb""#);
        let tok = lexer.next().unwrap().unwrap();
        assert_eq!(tok.kind, TokenKind::Str(vec![b'a', b'\n', b'b']));
    }

    #[test]
    fn char_literal() {
        let mut lexer = Lexer::new(r"'A'");
        let tok = lexer.next().unwrap().unwrap();
        assert_eq!(tok.kind, TokenKind::CharLit('A' as i64));
    }

    #[test]
    fn line_tracking_across_newlines_and_comments() {
        let mut lexer = Lexer::new("int\n// comment\nx");
        lexer.next().unwrap(); // int, line 1
        let tok = lexer.next().unwrap().unwrap();
        assert_eq!(tok.line, 3);
    }

    #[test]
    fn unexpected_character_reports_line() {
        let mut lexer = Lexer::new("int\n@");
        lexer.next().unwrap().unwrap();
        let err = lexer.next().unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.ch, '@');
    }
}
