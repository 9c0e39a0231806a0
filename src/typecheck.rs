//! Type checking: abstract interpretation of each body over a stack of
//! value types.
//!
//! Plain instructions pop their declared consumed types (rightmost consumed
//! topmost) and push their produced types. Folded operations are checked
//! against a fresh inner stack which must end exactly equal to the
//! operator's consumed types. Blocks seed a fresh stack with their
//! parameters and must end on their results. After an unconditional branch
//! the remainder of the current block is polymorphic and goes unchecked
//! until its `end`.

use crate::{
    error::{Error, FormError, TypeError},
    ir::{BlockExpr, BlockKind, DataMode, ElemMode, Instr, ModuleExpr, OpExpr, Signature},
    opcode::{OpcodeInfo, ValType},
    token::{Span, Token, TokenKind},
};

pub fn check(module: &ModuleExpr) -> Result<(), Error> {
    for func in &module.funcs {
        let mut locals = func.sig.signature.params.clone();
        locals.extend_from_slice(&func.sig.locals);
        let checker = FuncChecker {
            module,
            locals,
            results: func.sig.signature.results.clone(),
        };
        checker.check_body(&func.body, func.span)?;
    }
    for global in &module.globals {
        let checker = FuncChecker {
            module,
            locals: Vec::new(),
            results: vec![global.ty.ty],
        };
        checker.check_body(&global.init, global.span)?;
    }
    for elem in &module.elems {
        if let ElemMode::Active { offset, .. } = &elem.mode {
            check_offset(module, offset)?;
        }
    }
    for data in &module.datas {
        if let DataMode::Active { offset, .. } = &data.mode {
            check_offset(module, offset)?;
        }
    }
    Ok(())
}

fn check_offset(module: &ModuleExpr, offset: &[Instr]) -> Result<(), Error> {
    let checker = FuncChecker {
        module,
        locals: Vec::new(),
        results: vec![ValType::I32],
    };
    checker.check_body(offset, Span::default())
}

struct FuncChecker<'m> {
    module: &'m ModuleExpr,
    /// Parameters followed by declared locals.
    locals: Vec<ValType>,
    results: Vec<ValType>,
}

/// The abstract operand stack. Once `unreachable` is set, missing operands
/// are assumed present (the polymorphic stack of WebAssembly validation).
#[derive(Default)]
struct Stack {
    types: Vec<ValType>,
    unreachable: bool,
}

impl Stack {
    fn seeded(types: Vec<ValType>) -> Stack {
        Stack {
            types,
            unreachable: false,
        }
    }

    fn push(&mut self, ty: ValType) {
        self.types.push(ty);
    }

    fn pop_any(&mut self, at: Span) -> Result<Option<ValType>, Error> {
        match self.types.pop() {
            Some(ty) => Ok(Some(ty)),
            None if self.unreachable => Ok(None),
            None => Err(Error::Type(TypeError {
                expected: Vec::new(),
                got: Vec::new(),
                span: at,
            })),
        }
    }

    fn pop_expect(&mut self, want: ValType, at: Span) -> Result<(), Error> {
        match self.types.pop() {
            Some(got) if got == want => Ok(()),
            Some(got) => Err(mismatch(&[want], &[got], at)),
            None if self.unreachable => Ok(()),
            None => Err(mismatch(&[want], &[], at)),
        }
    }

    /// Pops a whole consumed-types list (declared bottom-to-top, so the
    /// rightmost entry is the stack top).
    fn pop_expect_many(&mut self, want: &[ValType], at: Span) -> Result<(), Error> {
        let n = want.len();
        let len = self.types.len();
        if len >= n {
            let suffix = &self.types[len - n..];
            if suffix == want {
                self.types.truncate(len - n);
                return Ok(());
            }
            return Err(mismatch(want, suffix, at));
        }
        if self.unreachable {
            if self.types[..] == want[n - len..] {
                self.types.clear();
                return Ok(());
            }
        }
        Err(mismatch(want, &self.types, at))
    }

    /// Enters the polymorphic regime after an unconditional transfer.
    fn make_unreachable(&mut self) {
        self.unreachable = true;
        self.types.clear();
    }
}

fn mismatch(expected: &[ValType], got: &[ValType], at: Span) -> Error {
    Error::Type(TypeError {
        expected: expected.to_vec(),
        got: got.to_vec(),
        span: at,
    })
}

fn out_of_range(message: &str, at: Span) -> Error {
    Error::Form(FormError {
        message: message.to_string(),
        span: at,
    })
}

impl FuncChecker<'_> {
    fn check_body(&self, body: &[Instr], at: Span) -> Result<(), Error> {
        let mut stack = Stack::default();
        let mut labels = vec![self.results.clone()];
        self.check_seq(body, &mut stack, &mut labels)?;
        if !stack.unreachable && stack.types != self.results {
            return Err(mismatch(&self.results, &stack.types, at));
        }
        Ok(())
    }

    fn check_seq(
        &self,
        seq: &[Instr],
        stack: &mut Stack,
        labels: &mut Vec<Vec<ValType>>,
    ) -> Result<(), Error> {
        for instr in seq {
            match instr {
                Instr::Token(token) => {
                    let info = opcode_info(token)?;
                    self.apply_op(info, &[], stack, labels, token.span)?;
                }
                Instr::Op(op) => self.check_op(op, stack, labels)?,
                Instr::Block(block) => self.check_block(block, stack, labels)?,
            }
        }
        Ok(())
    }

    fn check_op(
        &self,
        op: &OpExpr,
        stack: &mut Stack,
        labels: &mut Vec<Vec<ValType>>,
    ) -> Result<(), Error> {
        let info = opcode_info(&op.operator)?;
        let at = op.operator.span;
        if op.operands.is_empty() {
            return self.apply_op(info, &op.immediates, stack, labels, at);
        }

        match self.op_effect(info, &op.immediates, at)? {
            Some((consumes, produces)) => {
                let mut inner = Stack::default();
                self.check_seq(&op.operands, &mut inner, labels)?;
                if !inner.unreachable && inner.types != consumes {
                    return Err(mismatch(&consumes, &inner.types, at));
                }
                for ty in produces {
                    stack.push(ty);
                }
                Ok(())
            }
            // Operators without a fixed arity (branches, parametric): their
            // folded operands feed the enclosing stack directly.
            None => {
                self.check_seq(&op.operands, stack, labels)?;
                self.apply_op(info, &op.immediates, stack, labels, at)
            }
        }
    }

    fn check_block(
        &self,
        block: &BlockExpr,
        stack: &mut Stack,
        labels: &mut Vec<Vec<ValType>>,
    ) -> Result<(), Error> {
        if block.kind == BlockKind::If {
            stack.pop_expect(ValType::I32, block.span)?;
        }
        stack.pop_expect_many(&block.sig.params, block.span)?;

        // Branching to a loop re-enters it, so a loop label provides the
        // block parameters; other labels provide the results.
        let label_types = match block.kind {
            BlockKind::Loop => block.sig.params.clone(),
            _ => block.sig.results.clone(),
        };
        labels.push(label_types);
        let outcome = self.check_arms(block, labels);
        labels.pop();
        outcome?;

        for ty in &block.sig.results {
            stack.push(*ty);
        }
        Ok(())
    }

    fn check_arms(&self, block: &BlockExpr, labels: &mut Vec<Vec<ValType>>) -> Result<(), Error> {
        let mut inner = Stack::seeded(block.sig.params.clone());
        self.check_seq(&block.body, &mut inner, labels)?;
        self.end_check(&inner, &block.sig.results, block.span)?;
        if let Some(else_body) = &block.else_body {
            let mut inner = Stack::seeded(block.sig.params.clone());
            self.check_seq(else_body, &mut inner, labels)?;
            self.end_check(&inner, &block.sig.results, block.span)?;
        }
        Ok(())
    }

    fn end_check(&self, inner: &Stack, results: &[ValType], at: Span) -> Result<(), Error> {
        if inner.unreachable || inner.types == results {
            Ok(())
        } else {
            Err(mismatch(results, &inner.types, at))
        }
    }

    /// The fixed stack effect of an operator, or `None` for operators whose
    /// arity is not expressible as a consumed/produced pair.
    fn op_effect(
        &self,
        info: &OpcodeInfo,
        imms: &[Token],
        at: Span,
    ) -> Result<Option<(Vec<ValType>, Vec<ValType>)>, Error> {
        let effect = match info.name {
            "local.get" => (vec![], vec![self.local_type(imms, at)?]),
            "local.set" => (vec![self.local_type(imms, at)?], vec![]),
            "local.tee" => {
                let ty = self.local_type(imms, at)?;
                (vec![ty], vec![ty])
            }
            "global.get" => (vec![], vec![self.global_type(imms, at)?]),
            "global.set" => (vec![self.global_type(imms, at)?], vec![]),
            "call" => {
                let sig = self.callee_signature(imms, at)?;
                (sig.params, sig.results)
            }
            "call_indirect" => {
                let sig = self.type_signature(imms)?;
                let mut consumes = sig.params;
                consumes.push(ValType::I32);
                (consumes, sig.results)
            }
            "ref.null" => (vec![], vec![ref_imm_type(imms)?]),
            "unreachable" | "br" | "br_if" | "br_table" | "return" | "drop" | "select"
            | "ref.is_null" => return Ok(None),
            _ => (info.consumes.to_vec(), info.produces.to_vec()),
        };
        Ok(Some(effect))
    }

    fn apply_op(
        &self,
        info: &OpcodeInfo,
        imms: &[Token],
        stack: &mut Stack,
        labels: &[Vec<ValType>],
        at: Span,
    ) -> Result<(), Error> {
        match info.name {
            "nop" => Ok(()),
            "unreachable" => {
                stack.make_unreachable();
                Ok(())
            }
            "br" => {
                let target = label_target(imms, 0, labels, at)?;
                stack.pop_expect_many(&target, at)?;
                stack.make_unreachable();
                Ok(())
            }
            "br_if" => {
                stack.pop_expect(ValType::I32, at)?;
                let target = label_target(imms, 0, labels, at)?;
                stack.pop_expect_many(&target, at)?;
                for ty in target {
                    stack.push(ty);
                }
                Ok(())
            }
            "br_table" => {
                if imms.is_empty() {
                    return Err(Error::internal("br_table lost its labels"));
                }
                stack.pop_expect(ValType::I32, at)?;
                for idx in 0..imms.len() {
                    label_target(imms, idx, labels, at)?;
                }
                let target = label_target(imms, imms.len() - 1, labels, at)?;
                stack.pop_expect_many(&target, at)?;
                stack.make_unreachable();
                Ok(())
            }
            "return" => {
                let results = self.results.clone();
                stack.pop_expect_many(&results, at)?;
                stack.make_unreachable();
                Ok(())
            }
            "drop" => {
                stack.pop_any(at)?;
                Ok(())
            }
            "select" => {
                stack.pop_expect(ValType::I32, at)?;
                let a = stack.pop_any(at)?;
                let b = stack.pop_any(at)?;
                match (a, b) {
                    (Some(x), Some(y)) if x != y => Err(mismatch(&[y], &[x], at)),
                    (Some(x), _) => {
                        stack.push(x);
                        Ok(())
                    }
                    (None, Some(y)) => {
                        stack.push(y);
                        Ok(())
                    }
                    (None, None) => Ok(()),
                }
            }
            "ref.is_null" => {
                if let Some(ty) = stack.pop_any(at)? {
                    if !ty.is_ref() {
                        return Err(mismatch(&[ValType::FuncRef], &[ty], at));
                    }
                }
                stack.push(ValType::I32);
                Ok(())
            }
            "local.get" => {
                let ty = self.local_type(imms, at)?;
                stack.push(ty);
                Ok(())
            }
            "local.set" => {
                let ty = self.local_type(imms, at)?;
                stack.pop_expect(ty, at)
            }
            "local.tee" => {
                let ty = self.local_type(imms, at)?;
                stack.pop_expect(ty, at)?;
                stack.push(ty);
                Ok(())
            }
            "global.get" => {
                let ty = self.global_type(imms, at)?;
                stack.push(ty);
                Ok(())
            }
            "global.set" => {
                let ty = self.global_type(imms, at)?;
                stack.pop_expect(ty, at)
            }
            "call" => {
                let sig = self.callee_signature(imms, at)?;
                stack.pop_expect_many(&sig.params, at)?;
                for ty in sig.results {
                    stack.push(ty);
                }
                Ok(())
            }
            "call_indirect" => {
                stack.pop_expect(ValType::I32, at)?;
                let sig = self.type_signature(imms)?;
                stack.pop_expect_many(&sig.params, at)?;
                for ty in sig.results {
                    stack.push(ty);
                }
                Ok(())
            }
            "ref.null" => {
                stack.push(ref_imm_type(imms)?);
                Ok(())
            }
            _ => {
                stack.pop_expect_many(info.consumes, at)?;
                for ty in info.produces {
                    stack.push(*ty);
                }
                Ok(())
            }
        }
    }

    fn local_type(&self, imms: &[Token], at: Span) -> Result<ValType, Error> {
        let index = imm_u32(imms, 0)?;
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| out_of_range("local index out of range", at))
    }

    fn global_type(&self, imms: &[Token], at: Span) -> Result<ValType, Error> {
        let index = imm_u32(imms, 0)?;
        self.module
            .global_types
            .get(index as usize)
            .map(|g| g.ty)
            .ok_or_else(|| out_of_range("global index out of range", at))
    }

    fn callee_signature(&self, imms: &[Token], at: Span) -> Result<Signature, Error> {
        let index = imm_u32(imms, 0)?;
        let type_index = self
            .module
            .func_types
            .get(index as usize)
            .ok_or_else(|| out_of_range("unknown function index", at))?;
        self.module
            .types
            .get(*type_index)
            .cloned()
            .ok_or_else(|| Error::internal("function signature was not interned"))
    }

    fn type_signature(&self, imms: &[Token]) -> Result<Signature, Error> {
        let index = imm_u32(imms, 0)?;
        self.module
            .types
            .get(index)
            .cloned()
            .ok_or_else(|| Error::internal("type index escaped lowering unchecked"))
    }
}

fn opcode_info(token: &Token) -> Result<&'static OpcodeInfo, Error> {
    match token.kind {
        TokenKind::Opcode(info) => Ok(info),
        _ => Err(Error::internal(format!(
            "`{}` is not an instruction token",
            token.text
        ))),
    }
}

fn imm_u32(imms: &[Token], idx: usize) -> Result<u32, Error> {
    let token = imms
        .get(idx)
        .ok_or_else(|| Error::internal("missing instruction immediate"))?;
    match &token.kind {
        TokenKind::Integer(n) => n
            .to_u32()
            .ok_or_else(|| Error::internal("immediate escaped lowering out of range")),
        _ => Err(Error::internal("non-numeric immediate escaped lowering")),
    }
}

fn label_target(
    imms: &[Token],
    idx: usize,
    labels: &[Vec<ValType>],
    at: Span,
) -> Result<Vec<ValType>, Error> {
    let depth = imm_u32(imms, idx)? as usize;
    if depth >= labels.len() {
        return Err(out_of_range("branch depth out of range", at));
    }
    Ok(labels[labels.len() - 1 - depth].clone())
}

fn ref_imm_type(imms: &[Token]) -> Result<ValType, Error> {
    use crate::token::Keyword;
    match imms.first().map(|t| &t.kind) {
        Some(TokenKind::Keyword(Keyword::Func)) => Ok(ValType::FuncRef),
        Some(TokenKind::Keyword(Keyword::Extern)) => Ok(ValType::ExternRef),
        _ => Err(Error::internal("ref.null lost its heap type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer, lower, sexpr};
    use pretty_assertions::assert_eq;

    fn check_src(src: &str) -> Result<(), Error> {
        let module = lower::lower(&sexpr::build(lexer::lex(src).unwrap()).unwrap()).unwrap();
        check(&module)
    }

    fn expect_mismatch(src: &str, expected: &[ValType], got: &[ValType]) {
        match check_src(src) {
            Err(Error::Type(e)) => {
                assert_eq!(e.expected, expected);
                assert_eq!(e.got, got);
            }
            other => panic!("expected a type error, got {other:?}"),
        }
    }

    #[test]
    fn comparison_chain() {
        // [] -> [i32] -> [i32, i32] -> [i32]
        assert!(check_src("(module (func (result i32) i32.const 0 i32.const 0 i32.eq))").is_ok());
    }

    #[test]
    fn operand_width_mismatch() {
        expect_mismatch(
            "(module (func (result i32) i32.const 0 i64.eq))",
            &[ValType::I64, ValType::I64],
            &[ValType::I32],
        );
    }

    #[test]
    fn result_mismatch() {
        expect_mismatch(
            "(module (func (result i64) i32.const 0))",
            &[ValType::I64],
            &[ValType::I32],
        );
    }

    #[test]
    fn leftover_value_fails() {
        expect_mismatch(
            "(module (func i32.const 0))",
            &[],
            &[ValType::I32],
        );
    }

    #[test]
    fn params_do_not_seed_the_stack() {
        assert!(check_src(
            "(module (func (param f64 f64) (result f64) local.get 0 local.get 1 f64.add))"
        )
        .is_ok());
    }

    #[test]
    fn locals_and_tee() {
        assert!(check_src(
            "(module (func (param i32) (local i64)
               local.get 0
               drop
               i64.const 1
               local.tee 1
               drop))"
        )
        .is_ok());
        expect_mismatch(
            "(module (func (local i64) i32.const 0 local.set 0))",
            &[ValType::I64],
            &[ValType::I32],
        );
    }

    #[test]
    fn block_results() {
        assert!(check_src(
            "(module (func (result i32) (block (result i32) i32.const 1)))"
        )
        .is_ok());
        expect_mismatch(
            "(module (func (block (result i32) nop)))",
            &[ValType::I32],
            &[],
        );
    }

    #[test]
    fn block_params_come_from_the_outer_stack() {
        assert!(check_src(
            "(module (func (result i32)
               i32.const 1
               (block (param i32) (result i32) i32.const 2 i32.add)))"
        )
        .is_ok());
    }

    #[test]
    fn if_pops_its_condition() {
        assert!(check_src(
            "(module (func (param i32) (result i32)
               (if (result i32) (local.get 0)
                 (then (i32.const 1))
                 (else (i32.const 0)))))"
        )
        .is_ok());
        // A value-producing `if` without an `else` can never balance.
        expect_mismatch(
            "(module (func (param i32) (result i32)
               local.get 0
               (if (result i32) (then (i32.const 1)))))",
            &[ValType::I32],
            &[],
        );
    }

    #[test]
    fn branch_checks_label_types() {
        assert!(check_src(
            "(module (func (result i32)
               (block $out (result i32)
                 i32.const 1
                 br $out)))"
        )
        .is_ok());
        assert!(check_src("(module (func (loop $l (br $l))))").is_ok());
        assert!(check_src(
            "(module (func (param i32)
               (block $b (local.get 0) (br_if $b))))"
        )
        .is_ok());
    }

    #[test]
    fn br_table_requires_i32_selector() {
        assert!(check_src(
            "(module (func (param i32)
               (block $a (block $b
                 (br_table $a $b (local.get 0))))))"
        )
        .is_ok());
    }

    #[test]
    fn code_after_branch_is_polymorphic() {
        assert!(check_src(
            "(module (func (result i32)
               (return (i32.const 1))
               f64.const 0
               drop))"
        )
        .is_ok());
        assert!(check_src("(module (func (result i32) unreachable))").is_ok());
    }

    #[test]
    fn call_applies_callee_signature() {
        assert!(check_src(
            "(module
               (func $add (param i32 i32) (result i32)
                 local.get 0 local.get 1 i32.add)
               (func (result i32) (call $add (i32.const 1) (i32.const 2))))"
        )
        .is_ok());
        expect_mismatch(
            "(module
               (func $f (param i64))
               (func i32.const 0 call $f))",
            &[ValType::I64],
            &[ValType::I32],
        );
    }

    #[test]
    fn call_indirect_pops_selector_and_args() {
        assert!(check_src(
            "(module
               (type $t (func (param i32) (result i32)))
               (table 1 funcref)
               (func (param i32) (result i32)
                 i32.const 5
                 local.get 0
                 call_indirect (type $t)))"
        )
        .is_ok());
    }

    #[test]
    fn folded_operand_arity_is_exact() {
        expect_mismatch(
            "(module (func (result i32) (i32.add (i32.const 1))))",
            &[ValType::I32, ValType::I32],
            &[ValType::I32],
        );
        expect_mismatch(
            "(module (func (result i32)
               (i32.add (i32.const 1) (i32.const 2) (i32.const 3))))",
            &[ValType::I32, ValType::I32],
            &[ValType::I32, ValType::I32, ValType::I32],
        );
    }

    #[test]
    fn select_requires_matching_arms() {
        assert!(check_src(
            "(module (func (result i32)
               i32.const 1 i32.const 2 i32.const 0 select))"
        )
        .is_ok());
        expect_mismatch(
            "(module (func (result i32)
               i32.const 1 f32.const 2 i32.const 0 select))",
            &[ValType::I32],
            &[ValType::F32],
        );
    }

    #[test]
    fn global_init_must_match_declared_type() {
        assert!(check_src("(module (global i32 (i32.const 1)))").is_ok());
        expect_mismatch(
            "(module (global i32 (f32.const 1)))",
            &[ValType::I32],
            &[ValType::F32],
        );
    }

    #[test]
    fn global_access() {
        assert!(check_src(
            "(module
               (global $g (mut i64) (i64.const 0))
               (func (global.set $g (i64.const 3))))"
        )
        .is_ok());
    }

    #[test]
    fn memory_ops() {
        assert!(check_src(
            "(module (memory 1)
               (func (param i32) (result i32)
                 (i32.load (local.get 0))))"
        )
        .is_ok());
        expect_mismatch(
            "(module (memory 1)
               (func (param i32) (i64.store (local.get 0) (i32.const 0))))",
            &[ValType::I32, ValType::I64],
            &[ValType::I32, ValType::I32],
        );
    }

    #[test]
    fn reference_ops() {
        assert!(check_src(
            "(module (func (result i32) (ref.is_null (ref.null func))))"
        )
        .is_ok());
        assert!(check_src(
            "(module (func $f) (func (result funcref) (ref.func $f)))"
        )
        .is_ok());
    }

    #[test]
    fn out_of_range_numeric_indices_fail() {
        assert!(matches!(
            check_src("(module (func local.get 0 drop))"),
            Err(Error::Form(_))
        ));
        assert!(matches!(
            check_src("(module (func call 9))"),
            Err(Error::Form(_))
        ));
        assert!(matches!(
            check_src("(module (func (br 2)))"),
            Err(Error::Form(_))
        ));
    }
}
