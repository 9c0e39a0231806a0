use std::fmt;

use crate::opcode::{OpcodeInfo, ValType};

/// A source position: byte offset plus the 1-based line/column pair.
///
/// Tokens synthesized during lowering (resolved indices, block terminators)
/// reuse the span of the token they were derived from; tokens produced by
/// single-token lexing of a string tree carry the default span.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Span {
    pub lo: usize,
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(lo: usize, line: u32, column: u32) -> Span {
        Span { lo, line, column }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Span({}:{}@{})", self.line, self.column, self.lo)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// A lexical atom: its classification, the original lexeme, and where it
/// came from.
#[derive(Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, span: Span) -> Token {
        Token {
            kind,
            text: text.into(),
            span,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:?}, {})", self.kind, self.span)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    Keyword(Keyword),
    /// An instruction mnemonic, denormalized to its entry in the static
    /// opcode table (opcode byte, immediate descriptor, stack effect).
    Opcode(&'static OpcodeInfo),
    /// A value-type name (`i32`, `funcref`, ...). Distinct from opcodes.
    ValType(ValType),
    Integer(Integer),
    Float(f64),
    /// A double-quoted literal, with escapes already decoded to bytes.
    String(Vec<u8>),
    /// A `$name`, stored without the leading sigil.
    Id(String),
    /// An `offset=N` memory-access immediate.
    MemOffset(u64),
    /// An `align=N` memory-access immediate (in bytes, not log2).
    MemAlign(u64),
}

/// An integer literal. The unsigned magnitude and the sign are kept apart so
/// that both `-1` and `4294967295` can serve as an `i32` immediate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Integer {
    pub negative: bool,
    pub value: u64,
}

impl Integer {
    pub fn to_u32(self) -> Option<u32> {
        if self.negative && self.value != 0 {
            return None;
        }
        u32::try_from(self.value).ok()
    }

    pub fn to_i32(self) -> Option<i32> {
        if self.negative {
            let v = i64::try_from(self.value).ok()?;
            i32::try_from(-v).ok()
        } else {
            // Both signed and unsigned spellings are accepted; an unsigned
            // value above i32::MAX wraps to its two's complement reading.
            u32::try_from(self.value).ok().map(|v| v as i32)
        }
    }

    pub fn to_i64(self) -> Option<i64> {
        if self.negative {
            if self.value > (1 << 63) {
                return None;
            }
            Some((self.value as i64).wrapping_neg())
        } else {
            Some(self.value as i64)
        }
    }

    pub fn to_f64(self) -> f64 {
        if self.negative {
            -(self.value as f64)
        } else {
            self.value as f64
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Module,
    Func,
    Param,
    Result,
    Local,
    Export,
    Import,
    Type,
    Block,
    Loop,
    If,
    Then,
    Else,
    End,
    Table,
    Memory,
    Global,
    Data,
    Elem,
    Start,
    Mut,
    Offset,
    Item,
    Declare,
    Extern,
}

impl Keyword {
    pub fn name(self) -> &'static str {
        match self {
            Keyword::Module => "module",
            Keyword::Func => "func",
            Keyword::Param => "param",
            Keyword::Result => "result",
            Keyword::Local => "local",
            Keyword::Export => "export",
            Keyword::Import => "import",
            Keyword::Type => "type",
            Keyword::Block => "block",
            Keyword::Loop => "loop",
            Keyword::If => "if",
            Keyword::Then => "then",
            Keyword::Else => "else",
            Keyword::End => "end",
            Keyword::Table => "table",
            Keyword::Memory => "memory",
            Keyword::Global => "global",
            Keyword::Data => "data",
            Keyword::Elem => "elem",
            Keyword::Start => "start",
            Keyword::Mut => "mut",
            Keyword::Offset => "offset",
            Keyword::Item => "item",
            Keyword::Declare => "declare",
            Keyword::Extern => "extern",
        }
    }
}

pub static KEYWORDS: phf::Map<&'static str, Keyword> = phf::phf_map! {
    "module" => Keyword::Module,
    "func" => Keyword::Func,
    "param" => Keyword::Param,
    "result" => Keyword::Result,
    "local" => Keyword::Local,
    "export" => Keyword::Export,
    "import" => Keyword::Import,
    "type" => Keyword::Type,
    "block" => Keyword::Block,
    "loop" => Keyword::Loop,
    "if" => Keyword::If,
    "then" => Keyword::Then,
    "else" => Keyword::Else,
    "end" => Keyword::End,
    "table" => Keyword::Table,
    "memory" => Keyword::Memory,
    "global" => Keyword::Global,
    "data" => Keyword::Data,
    "elem" => Keyword::Elem,
    "start" => Keyword::Start,
    "mut" => Keyword::Mut,
    "offset" => Keyword::Offset,
    "item" => Keyword::Item,
    "declare" => Keyword::Declare,
    "extern" => Keyword::Extern,
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keyword_lookup() {
        assert_eq!(KEYWORDS.get("module"), Some(&Keyword::Module));
        assert_eq!(KEYWORDS.get("then"), Some(&Keyword::Then));
        assert_eq!(KEYWORDS.get("i32"), None);
        assert_eq!(KEYWORDS.get("local.get"), None);
    }

    #[test]
    fn integer_conversions() {
        let minus_one = Integer {
            negative: true,
            value: 1,
        };
        assert_eq!(minus_one.to_i32(), Some(-1));
        assert_eq!(minus_one.to_u32(), None);

        let umax = Integer {
            negative: false,
            value: u32::MAX as u64,
        };
        assert_eq!(umax.to_i32(), Some(-1));
        assert_eq!(umax.to_u32(), Some(u32::MAX));

        let i64_min = Integer {
            negative: true,
            value: 1 << 63,
        };
        assert_eq!(i64_min.to_i64(), Some(i64::MIN));
    }
}
