//! The error taxonomy shared by every pipeline stage.
//!
//! Errors are fatal to the current compilation: the first one aborts and is
//! surfaced to the caller, carrying a source position whenever one exists.

use std::fmt;

use crate::{opcode::ValType, token::Span};

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Lex(LexError),
    Parse(ParseError),
    Form(FormError),
    Name(NameError),
    Type(TypeError),
    Internal(InternalError),
}

/// A malformed token, unterminated construct, or unknown character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

/// Unbalanced parentheses, a missing top-level module, or stray tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

/// A malformed field: wrong head keyword, missing required subform,
/// conflicting names, or an out-of-range immediate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormError {
    pub message: String,
    pub span: Span,
}

/// An unresolved symbolic name (function, local, global, label, type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameError {
    /// The enclosing function, when the lookup happened inside one.
    pub function: Option<String>,
    pub name: String,
    pub span: Span,
}

/// An operand-stack mismatch found by the type checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub expected: Vec<ValType>,
    pub got: Vec<ValType>,
    pub span: Span,
}

/// An invariant violation. Always a bug in the compiler, never in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalError {
    pub message: String,
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Error {
        Error::Internal(InternalError {
            message: message.into(),
        })
    }

    /// The source position the error points at, when it has one.
    pub fn span(&self) -> Option<Span> {
        match self {
            Error::Lex(e) => Some(e.span),
            Error::Parse(e) => Some(e.span),
            Error::Form(e) => Some(e.span),
            Error::Name(e) => Some(e.span),
            Error::Type(e) => Some(e.span),
            Error::Internal(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Lex(e) => e.fmt(f),
            Error::Parse(e) => e.fmt(f),
            Error::Form(e) => e.fmt(f),
            Error::Name(e) => e.fmt(f),
            Error::Type(e) => e.fmt(f),
            Error::Internal(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${} is not defined", self.name)?;
        if let Some(func) = &self.function {
            write!(f, " in function ${func}")?;
        }
        write!(f, " at {}", self.span)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn types(f: &mut fmt::Formatter<'_>, list: &[ValType]) -> fmt::Result {
            write!(f, "[")?;
            for (i, ty) in list.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{ty}")?;
            }
            write!(f, "]")
        }

        if self.expected.is_empty() && self.got.is_empty() {
            return write!(f, "expected a value, but the stack is empty at {}", self.span);
        }
        write!(f, "expected ")?;
        types(f, &self.expected)?;
        write!(f, ", but got ")?;
        types(f, &self.got)?;
        write!(f, " at {}", self.span)
    }
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal error: {}", self.message)
    }
}

impl From<LexError> for Error {
    fn from(e: LexError) -> Error {
        Error::Lex(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Error {
        Error::Parse(e)
    }
}

impl From<FormError> for Error {
    fn from(e: FormError) -> Error {
        Error::Form(e)
    }
}

impl From<NameError> for Error {
    fn from(e: NameError) -> Error {
        Error::Name(e)
    }
}

impl From<TypeError> for Error {
    fn from(e: TypeError) -> Error {
        Error::Type(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display() {
        let err = Error::Type(TypeError {
            expected: vec![ValType::I64, ValType::I64],
            got: vec![ValType::I32],
            span: Span::new(8, 1, 9),
        });
        assert_eq!(
            err.to_string(),
            "expected [i64, i64], but got [i32] at line 1, column 9"
        );

        let err = Error::Name(NameError {
            function: Some("main".into()),
            name: "missing".into(),
            span: Span::new(0, 2, 3),
        });
        assert_eq!(
            err.to_string(),
            "$missing is not defined in function $main at line 2, column 3"
        );
    }
}
