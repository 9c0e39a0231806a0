use std::{iter::Peekable, str::Chars};

use crate::{
    error::{Error, LexError},
    opcode::{self, ValType},
    token::{Integer, Span, Token, TokenKind, KEYWORDS},
};

/// Lexes a full source string, skipping whitespace, line comments (`;; ...`)
/// and nestable block comments (`(; ... ;)`).
pub fn lex(src: &str) -> Result<Vec<Token>, Error> {
    let mut lexer = Lexer::new(src);
    while lexer.cursor < src.len() {
        lexer.scan_token()?;
    }
    Ok(lexer.tokens)
}

struct Lexer<'src> {
    src: &'src str,
    iter: Peekable<Chars<'src>>,
    cursor: usize,
    line: u32,
    column: u32,
    current_lo: usize,
    current_line: u32,
    current_column: u32,
    tokens: Vec<Token>,
}

impl Lexer<'_> {
    fn new(src: &str) -> Lexer<'_> {
        Lexer {
            src,
            iter: src.chars().peekable(),
            cursor: 0,
            line: 1,
            column: 1,
            current_lo: 0,
            current_line: 1,
            current_column: 1,
            tokens: Vec::with_capacity(1024),
        }
    }

    fn scan_token(&mut self) -> Result<(), Error> {
        match self.mark_advance() {
            c if c.is_ascii_whitespace() => Ok(()),
            '(' => {
                if self.peek() == ';' {
                    self.advance();
                    self.block_comment()
                } else {
                    self.produce(TokenKind::LParen);
                    Ok(())
                }
            }
            ')' => {
                self.produce(TokenKind::RParen);
                Ok(())
            }
            ';' => {
                if self.peek() == ';' {
                    self.line_comment();
                    Ok(())
                } else {
                    Err(self.fail("unexpected character `;`"))
                }
            }
            '"' => self.string(),
            '$' => self.id(),
            c if is_atom_char(c) => self.atom(),
            c => Err(self.fail(format!("unexpected character `{c}`"))),
        }
    }

    fn line_comment(&mut self) {
        while self.peek() != '\n' && self.peek() != '\0' {
            self.advance();
        }
    }

    /// Consumes a `(; ... ;)` comment. Both delimiters are already two
    /// characters in, so the comment starts at depth one.
    fn block_comment(&mut self) -> Result<(), Error> {
        let mut depth = 1usize;
        loop {
            match self.advance() {
                '\0' => return Err(self.fail("unterminated block comment")),
                '(' if self.peek() == ';' => {
                    self.advance();
                    depth += 1;
                }
                ';' if self.peek() == ')' => {
                    self.advance();
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn string(&mut self) -> Result<(), Error> {
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                '\0' => return Err(self.fail("unterminated string literal")),
                '"' => break,
                '\\' => match self.advance() {
                    'n' => bytes.push(b'\n'),
                    't' => bytes.push(b'\t'),
                    '"' => bytes.push(b'"'),
                    '\\' => bytes.push(b'\\'),
                    hi if hi.is_ascii_hexdigit() => {
                        let lo = self.advance();
                        if !lo.is_ascii_hexdigit() {
                            return Err(self.fail("malformed hex escape in string literal"));
                        }
                        bytes.push((hex_digit(hi) << 4) | hex_digit(lo));
                    }
                    '\0' => return Err(self.fail("unterminated string literal")),
                    c => return Err(self.fail(format!("unknown escape sequence `\\{c}`"))),
                },
                c => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        self.produce(TokenKind::String(bytes));
        Ok(())
    }

    fn id(&mut self) -> Result<(), Error> {
        while is_atom_char(self.peek()) {
            self.advance();
        }
        let text = self.substr();
        if text.len() == 1 {
            return Err(self.fail("`$` must be followed by a name"));
        }
        self.produce(TokenKind::Id(text[1..].to_string()));
        Ok(())
    }

    /// A bare run of atom characters: keyword, value type, opcode mnemonic,
    /// memory-access immediate, or numeric literal.
    fn atom(&mut self) -> Result<(), Error> {
        while is_atom_char(self.peek()) {
            self.advance();
        }
        let text = self.substr();
        let kind = if let Some(&kw) = KEYWORDS.get(text) {
            TokenKind::Keyword(kw)
        } else if let Some(vt) = ValType::from_name(text) {
            TokenKind::ValType(vt)
        } else if let Some(info) = opcode::lookup(text) {
            TokenKind::Opcode(info)
        } else if let Some(rest) = text.strip_prefix("offset=") {
            TokenKind::MemOffset(self.unsigned(rest)?)
        } else if let Some(rest) = text.strip_prefix("align=") {
            TokenKind::MemAlign(self.unsigned(rest)?)
        } else {
            self.number(text)?
        };
        self.produce(kind);
        Ok(())
    }

    fn number(&self, text: &str) -> Result<TokenKind, Error> {
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        if let Some(hex) = digits.strip_prefix("0x") {
            let value = u64::from_str_radix(hex, 16)
                .map_err(|_| self.fail(format!("malformed hex literal `{text}`")))?;
            return Ok(TokenKind::Integer(Integer { negative, value }));
        }
        if digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(self.fail(format!("unrecognized token `{text}`")));
        }
        if digits.contains(['.', 'e', 'E']) {
            let value: f64 = text
                .parse()
                .map_err(|_| self.fail(format!("malformed float literal `{text}`")))?;
            return Ok(TokenKind::Float(value));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| self.fail(format!("malformed integer literal `{text}`")))?;
        Ok(TokenKind::Integer(Integer { negative, value }))
    }

    fn unsigned(&self, digits: &str) -> Result<u64, Error> {
        let parsed = match digits.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse(),
        };
        parsed.map_err(|_| self.fail(format!("malformed immediate `{}`", self.substr())))
    }
}

impl Lexer<'_> {
    /// Starts a new token "mark" and advances the iterator.
    fn mark_advance(&mut self) -> char {
        self.current_lo = self.cursor;
        self.current_line = self.line;
        self.current_column = self.column;
        self.advance()
    }

    /// Returns the next character and advances the cursor, tracking the
    /// line/column pair.
    fn advance(&mut self) -> char {
        let Some(c) = self.iter.next() else {
            return '\0';
        };
        self.cursor += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    /// Returns the next character without advancing.
    fn peek(&mut self) -> char {
        self.iter.peek().copied().unwrap_or('\0')
    }

    /// Returns the substring of the current marked bounds.
    fn substr(&self) -> &str {
        &self.src[self.current_lo..self.cursor]
    }

    fn span(&self) -> Span {
        Span::new(self.current_lo, self.current_line, self.current_column)
    }

    /// Produces a token using the marked bounds.
    fn produce(&mut self, kind: TokenKind) {
        let token = Token::new(kind, self.substr(), self.span());
        self.tokens.push(token);
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::Lex(LexError {
            message: message.into(),
            span: self.span(),
        })
    }
}

/// The identifier character set shared by `$names` and bare atoms.
fn is_atom_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '_' | '.'
                | '+'
                | '-'
                | '*'
                | '/'
                | '\\'
                | '^'
                | '~'
                | '='
                | '<'
                | '>'
                | '!'
                | '?'
                | '@'
                | '#'
                | '$'
                | '%'
                | '&'
                | '|'
                | ':'
                | '\''
                | '`'
        )
}

fn hex_digit(c: char) -> u8 {
    match c {
        '0'..='9' => c as u8 - b'0',
        'a'..='f' => c as u8 - b'a' + 10,
        'A'..='F' => c as u8 - b'A' + 10,
        _ => 0,
    }
}
