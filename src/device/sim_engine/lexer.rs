use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct Span {
    pub(super) line: u32,
    pub(super) col: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(super) struct Diagnostic {
    pub(super) span: Span,
    pub(super) message: String,
}

impl Diagnostic {
    pub(super) fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Tok {
    Ident(String),
    Int { value: u64, unsigned: bool, long: bool },
    Float { value: f64, single: bool },
    Punct(&'static str),
    Eof,
}

impl Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ident(ident) => write!(f, "'{ident}'"),
            Self::Int { value, .. } => write!(f, "'{value}'"),
            Self::Float { value, .. } => write!(f, "'{value}'"),
            Self::Punct(punct) => write!(f, "'{punct}'"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Clone, Debug)]
pub(super) struct Token {
    pub(super) tok: Tok,
    pub(super) span: Span,
}

// Longest first.
const PUNCTS: &[&str] = &[
    "<<=", ">>=", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "(", ")", "{", "}", "[", "]", ";", ",", "?", ":", "+", "-",
    "*", "/", "%", "<", ">", "&", "|", "^", "~", "!", "=",
];

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }
    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }
    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }
    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }
    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }
    /// Skips whitespace, comments and `#pragma` lines.
    fn skip_trivia(&mut self, at_line_start: &mut bool) {
        loop {
            match self.peek() {
                Some('\n') => {
                    *at_line_start = true;
                    self.bump();
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('*') => {
                    let span = self.span();
                    self.bump();
                    self.bump();
                    loop {
                        if self.starts_with("*/") {
                            self.bump();
                            self.bump();
                            break;
                        }
                        if self.bump().is_none() {
                            self.diagnostics
                                .push(Diagnostic::new(span, "unterminated /* comment"));
                            return;
                        }
                    }
                }
                Some('#') if *at_line_start => {
                    if !self.starts_with("#pragma") {
                        self.diagnostics.push(Diagnostic::new(
                            self.span(),
                            "preprocessor directives are not supported",
                        ));
                    }
                    self.skip_line();
                }
                _ => return,
            }
        }
    }
    fn number(&mut self) -> Tok {
        let span = self.span();
        let mut text = String::new();
        let hex = self.starts_with("0x") || self.starts_with("0X");
        if hex {
            self.bump();
            self.bump();
            while let Some(c) = self.peek().filter(char::is_ascii_hexdigit) {
                text.push(c);
                self.bump();
            }
        } else {
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.bump();
            }
        }
        let mut float = false;
        if !hex && self.peek() == Some('.') {
            float = true;
            text.push('.');
            self.bump();
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.bump();
            }
        }
        if !hex && matches!(self.peek(), Some('e' | 'E')) {
            float = true;
            text.push('e');
            self.bump();
            if let Some(sign @ ('+' | '-')) = self.peek() {
                text.push(sign);
                self.bump();
            }
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.bump();
            }
        }
        if float {
            let single = matches!(self.peek(), Some('f' | 'F'));
            if single {
                self.bump();
            }
            return match text.parse::<f64>() {
                Ok(value) => Tok::Float { value, single },
                Err(_) => {
                    self.diagnostics
                        .push(Diagnostic::new(span, format!("invalid floating constant '{text}'")));
                    Tok::Float { value: 0., single }
                }
            };
        }
        let (mut unsigned, mut long) = (false, false);
        while let Some(c) = self.peek() {
            match c {
                'u' | 'U' if !unsigned => unsigned = true,
                'l' | 'L' if !long => long = true,
                _ => break,
            }
            self.bump();
        }
        let radix = if hex { 16 } else { 10 };
        let value = match u64::from_str_radix(&text, radix) {
            Ok(value) => value,
            Err(_) => {
                self.diagnostics.push(Diagnostic::new(
                    span,
                    "integer literal is too large to be represented in any integer type",
                ));
                0
            }
        };
        Tok::Int {
            value,
            unsigned,
            long,
        }
    }
}

pub(super) fn tokenize(source: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<Token> {
    let mut cursor = Cursor {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        diagnostics,
    };
    let mut tokens = Vec::new();
    let mut at_line_start = true;
    loop {
        cursor.skip_trivia(&mut at_line_start);
        at_line_start = false;
        let span = cursor.span();
        let c = match cursor.peek() {
            Some(c) => c,
            None => {
                tokens.push(Token {
                    tok: Tok::Eof,
                    span,
                });
                return tokens;
            }
        };
        let tok = if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(c) = cursor.peek().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
                ident.push(c);
                cursor.bump();
            }
            Tok::Ident(ident)
        } else if c.is_ascii_digit()
            || (c == '.' && cursor.peek_at(1).map_or(false, |c| c.is_ascii_digit()))
        {
            cursor.number()
        } else if let Some(&punct) = PUNCTS.iter().find(|p| cursor.starts_with(p)) {
            for _ in 0..punct.len() {
                cursor.bump();
            }
            Tok::Punct(punct)
        } else {
            cursor
                .diagnostics
                .push(Diagnostic::new(span, format!("unexpected character '{c}'")));
            cursor.bump();
            continue;
        };
        tokens.push(Token { tok, span });
    }
}
