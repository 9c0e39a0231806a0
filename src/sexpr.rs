//! The parse-tree builder.
//!
//! Turns the token sequence into a rose tree: every internal node is a
//! parenthesized group, every leaf a non-paren token. A single left-to-right
//! scan with a stack of open nodes suffices; at the end the synthetic root
//! must hold exactly one top-level form.

use std::fmt;

use crate::{
    error::{Error, ParseError},
    lexer,
    token::{Keyword, Span, Token, TokenKind},
};

#[derive(Clone, Debug, PartialEq)]
pub enum SExpr {
    Atom(Token),
    List(SExprList),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SExprList {
    pub items: Vec<SExpr>,
    /// Span of the opening paren.
    pub span: Span,
}

impl SExpr {
    pub fn span(&self) -> Span {
        match self {
            SExpr::Atom(token) => token.span,
            SExpr::List(list) => list.span,
        }
    }

    pub fn as_atom(&self) -> Option<&Token> {
        match self {
            SExpr::Atom(token) => Some(token),
            SExpr::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&SExprList> {
        match self {
            SExpr::Atom(_) => None,
            SExpr::List(list) => Some(list),
        }
    }

    /// The `$name` of an identifier atom, without the sigil.
    pub fn as_id(&self) -> Option<&str> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Id(name),
                ..
            }) => Some(name),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<Keyword> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Keyword(kw),
                ..
            }) => Some(*kw),
            _ => None,
        }
    }

    pub fn is_list_headed_by(&self, kw: Keyword) -> bool {
        self.as_list()
            .map_or(false, |list| list.head_keyword() == Some(kw))
    }
}

impl SExprList {
    pub fn get(&self, index: usize) -> Option<&SExpr> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[SExpr] {
        &self.items
    }

    pub fn head_keyword(&self) -> Option<Keyword> {
        self.items.first().and_then(SExpr::as_keyword)
    }
}

/// A parse tree. The synthetic outer group is implicit; `root` is its single
/// child, the top-level `(module ...)` form.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseTree {
    root: SExpr,
}

impl ParseTree {
    pub fn root(&self) -> &SExpr {
        &self.root
    }
}

/// Builds the tree from a token sequence.
pub fn build(tokens: Vec<Token>) -> Result<ParseTree, Error> {
    let mut stack: Vec<SExprList> = vec![SExprList {
        items: Vec::new(),
        span: Span::default(),
    }];
    let mut last_span = Span::default();

    for token in tokens {
        last_span = token.span;
        match token.kind {
            TokenKind::LParen => stack.push(SExprList {
                items: Vec::new(),
                span: token.span,
            }),
            TokenKind::RParen => {
                if stack.len() < 2 {
                    return Err(unbalanced("unmatched closing paren", token.span));
                }
                let done = match stack.pop() {
                    Some(list) => list,
                    None => return Err(Error::internal("paren stack underflow")),
                };
                match stack.last_mut() {
                    Some(top) => top.items.push(SExpr::List(done)),
                    None => return Err(Error::internal("paren stack underflow")),
                }
            }
            _ => match stack.last_mut() {
                Some(top) => top.items.push(SExpr::Atom(token)),
                None => return Err(Error::internal("paren stack underflow")),
            },
        }
    }

    if stack.len() != 1 {
        return Err(unbalanced("unclosed paren at end of input", last_span));
    }
    let root = match stack.pop() {
        Some(root) => root,
        None => return Err(Error::internal("paren stack underflow")),
    };

    let mut items = root.items;
    match items.len() {
        0 => Err(unbalanced("expected a top-level module form", last_span)),
        1 => {
            let root = match items.pop() {
                Some(root) => root,
                None => return Err(Error::internal("top-level form vanished")),
            };
            if root.as_list().is_none() {
                return Err(unbalanced(
                    "expected a parenthesized module form",
                    root.span(),
                ));
            }
            Ok(ParseTree { root })
        }
        _ => Err(unbalanced(
            "extra tokens after the top-level form",
            items[1].span(),
        )),
    }
}

fn unbalanced(message: &str, span: Span) -> Error {
    Error::Parse(ParseError {
        message: message.to_string(),
        span,
    })
}

/// A parse tree reduced to its lexemes, for debugging and for callers that
/// assemble trees out of raw strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StringTree {
    Leaf(String),
    Node(Vec<StringTree>),
}

impl From<&SExpr> for StringTree {
    fn from(sexpr: &SExpr) -> StringTree {
        match sexpr {
            SExpr::Atom(token) => StringTree::Leaf(token.text.clone()),
            SExpr::List(list) => StringTree::Node(list.items.iter().map(StringTree::from).collect()),
        }
    }
}

impl fmt::Display for StringTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl StringTree {
    /// Leaf-only nodes print on one line; nested nodes get one child per
    /// line, indented by depth.
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            StringTree::Leaf(s) => f.write_str(s),
            StringTree::Node(children) => {
                let flat = children.iter().all(|c| matches!(c, StringTree::Leaf(_)));
                write!(f, "(")?;
                if flat {
                    for (i, child) in children.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        child.write_indented(f, depth + 1)?;
                    }
                } else {
                    for (i, child) in children.iter().enumerate() {
                        if i == 0 {
                            if let StringTree::Leaf(_) = child {
                                child.write_indented(f, depth + 1)?;
                                continue;
                            }
                        }
                        writeln!(f)?;
                        write!(f, "{:width$}", "", width = (depth + 1) * 2)?;
                        child.write_indented(f, depth + 1)?;
                    }
                }
                write!(f, ")")
            }
        }
    }
}

/// Rebuilds a token-level parse tree from a string tree. Each leaf goes
/// through single-token lexing; position metadata defaults.
pub fn from_strings(tree: &StringTree) -> Result<ParseTree, Error> {
    let root = convert(tree)?;
    if root.as_list().is_none() {
        return Err(unbalanced(
            "expected a parenthesized module form",
            Span::default(),
        ));
    }
    Ok(ParseTree { root })
}

fn convert(tree: &StringTree) -> Result<SExpr, Error> {
    match tree {
        StringTree::Leaf(text) => {
            let mut tokens = lexer::lex(text)?;
            if tokens.len() != 1 {
                return Err(Error::Parse(ParseError {
                    message: format!("`{text}` is not a single token"),
                    span: Span::default(),
                }));
            }
            let mut token = match tokens.pop() {
                Some(token) => token,
                None => return Err(Error::internal("single-token lex yielded nothing")),
            };
            token.span = Span::default();
            Ok(SExpr::Atom(token))
        }
        StringTree::Node(children) => {
            let items = children.iter().map(convert).collect::<Result<_, _>>()?;
            Ok(SExpr::List(SExprList {
                items,
                span: Span::default(),
            }))
        }
    }
}
