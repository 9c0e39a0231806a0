//! A compiler from the WebAssembly text format (WAT) to the binary module
//! format.
//!
//! The pipeline is strictly linear: lexing, parse-tree construction,
//! lowering to an indexed module IR, type checking, and binary emission.
//! A compilation is a pure function from source text to bytes; the only
//! process-wide state is the read-only opcode table.
//!
//! # Modules
//!
//! - [`token`] -- token and span definitions, plus the keyword table.
//! - [`opcode`] -- the static opcode table (byte, immediates, stack effect).
//! - [`lexer`] -- source text to tokens.
//! - [`sexpr`] -- tokens to a balanced-paren parse tree.
//! - [`lower`] -- parse tree to module IR: desugars folded forms, resolves
//!   symbolic names to indices, interns signatures, synthesizes exports.
//! - [`typecheck`] -- verifies each body against an abstract operand stack.
//! - [`encode`] -- module IR to `\0asm` bytes.
//!
//! # Example
//!
//! ```
//! let bytes = watc::compile(r#"
//!     (module
//!         (func (export "add") (param i32 i32) (result i32)
//!             local.get 0
//!             local.get 1
//!             i32.add))
//! "#).unwrap();
//! assert_eq!(&bytes[0..4], b"\0asm");
//! ```

pub mod encode;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod lower;
pub mod opcode;
pub mod sexpr;
pub mod token;
pub mod typecheck;

pub use error::Error;
pub use sexpr::{ParseTree, StringTree};

/// Runs the full pipeline: source text to binary module bytes.
pub fn compile(source: &str) -> Result<Vec<u8>, Error> {
    compile_tree(&parse(source)?)
}

/// Lexes and parses only, returning the token-level parse tree.
pub fn parse(source: &str) -> Result<ParseTree, Error> {
    sexpr::build(lexer::lex(source)?)
}

/// The parse tree reduced to lexemes, for debugging.
pub fn string_parse_tree(source: &str) -> Result<StringTree, Error> {
    Ok(StringTree::from(parse(source)?.root()))
}

/// Compiles an already-built parse tree.
pub fn compile_tree(tree: &ParseTree) -> Result<Vec<u8>, Error> {
    let module = lower::lower(tree)?;
    typecheck::check(&module)?;
    encode::encode(&module)
}

/// Compiles a tree of raw strings. Each leaf is passed through
/// single-token lexing; position metadata will be absent.
pub fn compile_string_tree(tree: &StringTree) -> Result<Vec<u8>, Error> {
    compile_tree(&sexpr::from_strings(tree)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{unfold, ExportExpr, ExportKind, Instr},
        opcode::ValType,
        token::TokenKind,
    };
    use pretty_assertions::assert_eq;

    fn lowered(src: &str) -> ir::ModuleExpr {
        lower::lower(&parse(src).unwrap()).unwrap()
    }

    fn unfold_kind_names(body: &[Instr]) -> Vec<String> {
        unfold(body)
            .iter()
            .map(|t| match &t.kind {
                TokenKind::Opcode(info) => info.name.to_string(),
                TokenKind::Keyword(kw) => kw.name().to_string(),
                TokenKind::Integer(n) => n.value.to_string(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn scenario_empty_function() {
        let m = lowered("(module (func nop))");
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types.get(0), Some(&ir::Signature::default()));
        assert_eq!(m.funcs.len(), 1);
        assert_eq!(m.func_types, vec![0]);
        assert!(m.exports.is_empty());
        assert_eq!(unfold_kind_names(&m.funcs[0].body), ["nop"]);
        assert!(compile("(module (func nop))").is_ok());
    }

    #[test]
    fn scenario_comparison() {
        let src = "(module (func (result i32) i32.const 0 i32.const 0 i32.eq))";
        let m = lowered(src);
        assert_eq!(m.types.len(), 1);
        assert_eq!(
            m.types.get(0),
            Some(&ir::Signature {
                params: vec![],
                results: vec![ValType::I32],
            })
        );
        assert_eq!(
            unfold_kind_names(&m.funcs[0].body),
            ["i32.const", "0", "i32.const", "0", "i32.eq"]
        );
        assert!(compile(src).is_ok());
    }

    #[test]
    fn scenario_folded_params() {
        let src = "(module (func (param $a f64) (param $b f64) (result f64)
                     (f64.add (local.get $a) (local.get $b))))";
        let m = lowered(src);
        assert_eq!(
            unfold_kind_names(&m.funcs[0].body),
            ["local.get", "0", "local.get", "1", "f64.add"]
        );
        assert_eq!(m.types.len(), 1);
        assert_eq!(
            m.types.get(0),
            Some(&ir::Signature {
                params: vec![ValType::F64, ValType::F64],
                results: vec![ValType::F64],
            })
        );
        assert!(compile(src).is_ok());
    }

    #[test]
    fn scenario_inline_export() {
        let src = r#"(module (func (export "fn") (param) (result)))"#;
        let m = lowered(src);
        assert_eq!(m.funcs.len(), 1);
        assert_eq!(
            m.exports,
            vec![ExportExpr {
                name: "fn".into(),
                kind: ExportKind::Func,
                index: 0,
            }]
        );
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types.get(0), Some(&ir::Signature::default()));
    }

    #[test]
    fn scenario_export_by_name() {
        let m = lowered(r#"(module (func $a) (func $b) (export "x" (func $b)))"#);
        assert_eq!(m.exports[0].index, 1);
    }

    #[test]
    fn scenario_labeled_block() {
        let m = lowered("(module (func (block $L nop)))");
        match &m.funcs[0].body[0] {
            Instr::Block(b) => {
                assert_eq!(b.label.as_deref(), Some("L"));
                assert_eq!(b.sig, ir::Signature::default());
            }
            other => panic!("expected a block, got {other:?}"),
        }
        assert_eq!(
            unfold_kind_names(&m.funcs[0].body),
            ["block", "nop", "end"]
        );
        assert!(compile("(module (func (block $L nop)))").is_ok());
    }

    #[test]
    fn folded_and_flat_bodies_compile_identically() {
        let folded = compile(
            "(module (func (param i32 i32) (result i32)
               (i32.add (local.get 0) (local.get 1))))",
        )
        .unwrap();
        let flat = compile(
            "(module (func (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.add))",
        )
        .unwrap();
        assert_eq!(folded, flat);
    }

    #[test]
    fn folded_and_flat_control_compile_identically() {
        let folded = compile(
            "(module (func (param i32) (result i32)
               (if (result i32) (local.get 0)
                 (then (i32.const 1))
                 (else (i32.const 2)))))",
        )
        .unwrap();
        let flat = compile(
            "(module (func (param i32) (result i32)
               local.get 0
               if (result i32)
                 i32.const 1
               else
                 i32.const 2
               end))",
        )
        .unwrap();
        assert_eq!(folded, flat);
    }

    #[test]
    fn duplicate_signatures_share_a_type_entry() {
        let m = lowered(
            "(module
               (func (param i32) (result i32) local.get 0)
               (func (param i32) (result i32) local.get 0))",
        );
        assert_eq!(m.types.len(), 1);
    }

    #[test]
    fn unbalanced_input_is_a_parse_error() {
        assert!(matches!(compile("(module (func nop)"), Err(Error::Parse(_))));
    }

    #[test]
    fn unknown_local_is_a_name_error() {
        assert!(matches!(
            compile("(module (func local.get $missing))"),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn width_mismatch_is_a_type_error() {
        match compile("(module (func (result i32) i32.const 0 i64.eq))") {
            Err(Error::Type(e)) => {
                assert_eq!(e.expected, [ValType::I64, ValType::I64]);
                assert_eq!(e.got, [ValType::I32]);
            }
            other => panic!("expected a type error, got {other:?}"),
        }
    }

    #[test]
    fn string_tree_pipeline_matches_text_pipeline() {
        let src = r#"(module (func (export "f") (result i32) (i32.const 7)))"#;
        let tree = string_parse_tree(src).unwrap();
        assert_eq!(compile_string_tree(&tree).unwrap(), compile(src).unwrap());
    }

    #[test]
    fn compile_tree_matches_compile() {
        let src = "(module (func (param i32) (result i32) (i32.mul (local.get 0) (i32.const 3))))";
        let tree = parse(src).unwrap();
        assert_eq!(compile_tree(&tree).unwrap(), compile(src).unwrap());
    }

    #[test]
    fn larger_module_compiles() {
        let src = r#"
            (module
              (import "env" "print" (func $print (param i32)))
              (memory (export "mem") 1)
              (global $counter (mut i32) (i32.const 0))
              (table 4 funcref)
              (func $bump (result i32)
                (global.set $counter (i32.add (global.get $counter) (i32.const 1)))
                global.get $counter)
              (func $loopy (param $n i32) (result i32)
                (local $acc i32)
                block $exit
                  loop $again
                    local.get $n
                    i32.eqz
                    br_if $exit
                    (local.set $acc (i32.add (local.get $acc) (local.get $n)))
                    (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                    br $again
                  end
                end
                local.get $acc)
              (func $init (call $print (i32.const 0)))
              (elem (i32.const 0) $bump $loopy)
              (data (i32.const 16) "counters")
              (export "bump" (func $bump))
              (export "sum" (func $loopy))
              (start $init))
        "#;
        let bytes = compile(src).unwrap();
        assert_eq!(&bytes[0..8], &[0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]);
    }
}
