//! Binary emission: module IR to WebAssembly bytes.
//!
//! Sections are emitted in canonical order, each only when non-empty. By
//! the time a module reaches this stage, lowering has resolved every
//! symbolic name and the checker has verified the bodies, so immediates are
//! plain numbers; anything else is an internal error.

use crate::{
    error::Error,
    ir::{BlockExpr, BlockKind, DataMode, ElemMode, ImportDesc, Instr, Limits, ModuleExpr, OpExpr},
    opcode::{Imm, OpcodeInfo, ValType},
    token::{Token, TokenKind},
};

const MAGIC: [u8; 4] = *b"\0asm";
const VERSION: [u8; 4] = [1, 0, 0, 0];

const SECTION_TYPE: u8 = 1;
const SECTION_IMPORT: u8 = 2;
const SECTION_FUNCTION: u8 = 3;
const SECTION_TABLE: u8 = 4;
const SECTION_MEMORY: u8 = 5;
const SECTION_GLOBAL: u8 = 6;
const SECTION_EXPORT: u8 = 7;
const SECTION_START: u8 = 8;
const SECTION_ELEMENT: u8 = 9;
const SECTION_CODE: u8 = 10;
const SECTION_DATA: u8 = 11;

const OP_END: u8 = 0x0B;
const OP_ELSE: u8 = 0x05;
const BLOCKTYPE_EMPTY: u8 = 0x40;

pub fn encode(module: &ModuleExpr) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION);

    if !module.types.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.types.len() as u64);
        for sig in module.types.iter() {
            payload.push(0x60);
            uleb(&mut payload, sig.params.len() as u64);
            payload.extend(sig.params.iter().map(|t| t.byte()));
            uleb(&mut payload, sig.results.len() as u64);
            payload.extend(sig.results.iter().map(|t| t.byte()));
        }
        section(&mut out, SECTION_TYPE, payload);
    }

    if !module.imports.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.imports.len() as u64);
        for import in &module.imports {
            name(&mut payload, &import.module);
            name(&mut payload, &import.field);
            match &import.desc {
                ImportDesc::Func { type_index } => {
                    payload.push(0x00);
                    uleb(&mut payload, *type_index as u64);
                }
                ImportDesc::Table(table) => {
                    payload.push(0x01);
                    payload.push(table.ref_type.byte());
                    limits(&mut payload, table.limits);
                }
                ImportDesc::Memory(memory) => {
                    payload.push(0x02);
                    limits(&mut payload, memory.limits);
                }
                ImportDesc::Global(global) => {
                    payload.push(0x03);
                    payload.push(global.ty.byte());
                    payload.push(global.mutable as u8);
                }
            }
        }
        section(&mut out, SECTION_IMPORT, payload);
    }

    if !module.funcs.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.funcs.len() as u64);
        for func in &module.funcs {
            uleb(&mut payload, func.sig.type_index as u64);
        }
        section(&mut out, SECTION_FUNCTION, payload);
    }

    if !module.tables.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.tables.len() as u64);
        for table in &module.tables {
            payload.push(table.ref_type.byte());
            limits(&mut payload, table.limits);
        }
        section(&mut out, SECTION_TABLE, payload);
    }

    if !module.memories.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.memories.len() as u64);
        for memory in &module.memories {
            limits(&mut payload, memory.limits);
        }
        section(&mut out, SECTION_MEMORY, payload);
    }

    if !module.globals.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.globals.len() as u64);
        for global in &module.globals {
            payload.push(global.ty.ty.byte());
            payload.push(global.ty.mutable as u8);
            emit_seq(&mut payload, &global.init)?;
            payload.push(OP_END);
        }
        section(&mut out, SECTION_GLOBAL, payload);
    }

    if !module.exports.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.exports.len() as u64);
        for export in &module.exports {
            name(&mut payload, &export.name);
            payload.push(export.kind.byte());
            uleb(&mut payload, export.index as u64);
        }
        section(&mut out, SECTION_EXPORT, payload);
    }

    if let Some(start) = module.start {
        let mut payload = Vec::new();
        uleb(&mut payload, start as u64);
        section(&mut out, SECTION_START, payload);
    }

    if !module.elems.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.elems.len() as u64);
        for elem in &module.elems {
            match &elem.mode {
                ElemMode::Active { table: 0, offset } => {
                    uleb(&mut payload, 0);
                    emit_seq(&mut payload, offset)?;
                    payload.push(OP_END);
                    func_indices(&mut payload, &elem.funcs);
                }
                ElemMode::Active { table, offset } => {
                    uleb(&mut payload, 2);
                    uleb(&mut payload, *table as u64);
                    emit_seq(&mut payload, offset)?;
                    payload.push(OP_END);
                    payload.push(0x00); // elemkind: funcref
                    func_indices(&mut payload, &elem.funcs);
                }
                ElemMode::Passive => {
                    uleb(&mut payload, 1);
                    payload.push(0x00);
                    func_indices(&mut payload, &elem.funcs);
                }
                ElemMode::Declarative => {
                    uleb(&mut payload, 3);
                    payload.push(0x00);
                    func_indices(&mut payload, &elem.funcs);
                }
            }
        }
        section(&mut out, SECTION_ELEMENT, payload);
    }

    if !module.funcs.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.funcs.len() as u64);
        for func in &module.funcs {
            let mut body = Vec::new();
            let compressed = compress_locals(&func.sig.locals);
            uleb(&mut body, compressed.len() as u64);
            for (count, ty) in compressed {
                uleb(&mut body, count as u64);
                body.push(ty.byte());
            }
            emit_seq(&mut body, &func.body)?;
            body.push(OP_END);
            uleb(&mut payload, body.len() as u64);
            payload.extend_from_slice(&body);
        }
        section(&mut out, SECTION_CODE, payload);
    }

    if !module.datas.is_empty() {
        let mut payload = Vec::new();
        uleb(&mut payload, module.datas.len() as u64);
        for data in &module.datas {
            match &data.mode {
                DataMode::Active { memory: 0, offset } => {
                    uleb(&mut payload, 0);
                    emit_seq(&mut payload, offset)?;
                    payload.push(OP_END);
                }
                DataMode::Active { memory, offset } => {
                    uleb(&mut payload, 2);
                    uleb(&mut payload, *memory as u64);
                    emit_seq(&mut payload, offset)?;
                    payload.push(OP_END);
                }
                DataMode::Passive => uleb(&mut payload, 1),
            }
            uleb(&mut payload, data.bytes.len() as u64);
            payload.extend_from_slice(&data.bytes);
        }
        section(&mut out, SECTION_DATA, payload);
    }

    Ok(out)
}

fn section(out: &mut Vec<u8>, id: u8, payload: Vec<u8>) {
    out.push(id);
    uleb(out, payload.len() as u64);
    out.extend_from_slice(&payload);
}

fn name(out: &mut Vec<u8>, value: &str) {
    uleb(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn limits(out: &mut Vec<u8>, limits: Limits) {
    match limits.max {
        Some(max) => {
            out.push(0x01);
            uleb(out, limits.min as u64);
            uleb(out, max as u64);
        }
        None => {
            out.push(0x00);
            uleb(out, limits.min as u64);
        }
    }
}

fn func_indices(out: &mut Vec<u8>, funcs: &[u32]) {
    uleb(out, funcs.len() as u64);
    for func in funcs {
        uleb(out, *func as u64);
    }
}

/// Runs of identical local types collapse to (count, type) pairs.
fn compress_locals(locals: &[ValType]) -> Vec<(u32, ValType)> {
    let mut result: Vec<(u32, ValType)> = Vec::new();
    for &ty in locals {
        match result.last_mut() {
            Some((count, last)) if *last == ty => *count += 1,
            _ => result.push((1, ty)),
        }
    }
    result
}

fn emit_seq(out: &mut Vec<u8>, seq: &[Instr]) -> Result<(), Error> {
    for instr in seq {
        match instr {
            Instr::Token(token) => {
                let info = opcode_of(token)?;
                emit_op(out, info, &[])?;
            }
            Instr::Op(OpExpr {
                operator,
                immediates,
                operands,
            }) => {
                emit_seq(out, operands)?;
                let info = opcode_of(operator)?;
                emit_op(out, info, immediates)?;
            }
            Instr::Block(block) => emit_block(out, block)?,
        }
    }
    Ok(())
}

fn emit_block(out: &mut Vec<u8>, block: &BlockExpr) -> Result<(), Error> {
    out.push(match block.kind {
        BlockKind::Block => 0x02,
        BlockKind::Loop => 0x03,
        BlockKind::If => 0x04,
    });
    match block.type_index {
        // Multi-value blocks reference the type table with a signed index.
        Some(index) => sleb(out, index as i64),
        None => match block.sig.results.first() {
            Some(ty) => out.push(ty.byte()),
            None => out.push(BLOCKTYPE_EMPTY),
        },
    }
    emit_seq(out, &block.body)?;
    if let Some(else_body) = &block.else_body {
        if !else_body.is_empty() {
            out.push(OP_ELSE);
            emit_seq(out, else_body)?;
        }
    }
    out.push(OP_END);
    Ok(())
}

fn emit_op(out: &mut Vec<u8>, info: &OpcodeInfo, imms: &[Token]) -> Result<(), Error> {
    out.push(info.byte);
    match info.imm {
        Imm::None => {
            // memory.size and memory.grow carry a reserved memory index.
            if info.byte == 0x3F || info.byte == 0x40 {
                out.push(0x00);
            }
        }
        Imm::LocalIdx | Imm::GlobalIdx | Imm::FuncIdx | Imm::LabelIdx => {
            uleb(out, imm_u32(imms, 0)? as u64);
        }
        Imm::TypeIdx => {
            uleb(out, imm_u32(imms, 0)? as u64);
            out.push(0x00); // table index
        }
        Imm::LabelTable => {
            if imms.is_empty() {
                return Err(Error::internal("br_table lost its labels"));
            }
            uleb(out, (imms.len() - 1) as u64);
            for imm in imms {
                uleb(out, imm_u32_token(imm)? as u64);
            }
        }
        Imm::I32 => sleb(out, imm_i32(imms)? as i64),
        Imm::I64 => sleb(out, imm_i64(imms)?),
        Imm::F32 => out.extend_from_slice(&(imm_f64(imms)? as f32).to_le_bytes()),
        Imm::F64 => out.extend_from_slice(&imm_f64(imms)?.to_le_bytes()),
        Imm::Mem { natural_align } => {
            let mut align = natural_align;
            let mut offset = 0u64;
            for imm in imms {
                match imm.kind {
                    TokenKind::MemAlign(bytes) => align = bytes.trailing_zeros(),
                    TokenKind::MemOffset(value) => offset = value,
                    _ => return Err(Error::internal("unexpected memory immediate")),
                }
            }
            uleb(out, align as u64);
            uleb(out, offset);
        }
        Imm::RefType => {
            use crate::token::Keyword;
            match imms.first().map(|t| &t.kind) {
                Some(TokenKind::Keyword(Keyword::Func)) => out.push(ValType::FuncRef.byte()),
                Some(TokenKind::Keyword(Keyword::Extern)) => out.push(ValType::ExternRef.byte()),
                _ => return Err(Error::internal("ref.null lost its heap type")),
            }
        }
    }
    Ok(())
}

fn opcode_of(token: &Token) -> Result<&'static OpcodeInfo, Error> {
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
    imm_u32_token(token)
}

fn imm_u32_token(token: &Token) -> Result<u32, Error> {
    match &token.kind {
        TokenKind::Integer(n) => n
            .to_u32()
            .ok_or_else(|| Error::internal("index immediate out of range")),
        _ => Err(Error::internal("non-numeric index immediate")),
    }
}

fn imm_i32(imms: &[Token]) -> Result<i32, Error> {
    match imms.first().map(|t| &t.kind) {
        Some(TokenKind::Integer(n)) => n
            .to_i32()
            .ok_or_else(|| Error::internal("i32 immediate out of range")),
        _ => Err(Error::internal("missing i32 immediate")),
    }
}

fn imm_i64(imms: &[Token]) -> Result<i64, Error> {
    match imms.first().map(|t| &t.kind) {
        Some(TokenKind::Integer(n)) => n
            .to_i64()
            .ok_or_else(|| Error::internal("i64 immediate out of range")),
        _ => Err(Error::internal("missing i64 immediate")),
    }
}

fn imm_f64(imms: &[Token]) -> Result<f64, Error> {
    match imms.first().map(|t| &t.kind) {
        Some(TokenKind::Float(value)) => Ok(*value),
        Some(TokenKind::Integer(n)) => Ok(n.to_f64()),
        _ => Err(Error::internal("missing float immediate")),
    }
}

/// Unsigned LEB128.
fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Signed LEB128.
fn sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer, lower, sexpr, typecheck};
    use pretty_assertions::assert_eq;

    fn compile(src: &str) -> Vec<u8> {
        let module = lower::lower(&sexpr::build(lexer::lex(src).unwrap()).unwrap()).unwrap();
        typecheck::check(&module).unwrap();
        encode(&module).unwrap()
    }

    #[test]
    fn uleb_cases() {
        let mut buf = Vec::new();
        uleb(&mut buf, 0);
        uleb(&mut buf, 7);
        uleb(&mut buf, 127);
        uleb(&mut buf, 128);
        uleb(&mut buf, 624485);
        assert_eq!(buf, [0x00, 0x07, 0x7F, 0x80, 0x01, 0xE5, 0x8E, 0x26]);
    }

    #[test]
    fn sleb_cases() {
        let mut buf = Vec::new();
        sleb(&mut buf, 0);
        sleb(&mut buf, 42);
        sleb(&mut buf, -1);
        sleb(&mut buf, 64);
        sleb(&mut buf, -123456);
        assert_eq!(
            buf,
            [0x00, 0x2A, 0x7F, 0xC0, 0x00, 0xC0, 0xBB, 0x78]
        );
    }

    #[test]
    fn empty_module_is_header_only() {
        assert_eq!(
            compile("(module)"),
            [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn minimal_function_sections() {
        assert_eq!(
            compile("(module (func))"),
            [
                0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
                0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
                0x03, 0x02, 0x01, 0x00, // function: one func of type 0
                0x0A, 0x04, 0x01, 0x02, 0x00, 0x0B, // code: empty body
            ]
        );
    }

    #[test]
    fn const_and_export() {
        assert_eq!(
            compile(r#"(module (func (export "f") (result i32) i32.const 42))"#),
            [
                0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
                0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7F, // type: () -> (i32)
                0x03, 0x02, 0x01, 0x00, // function
                0x07, 0x05, 0x01, 0x01, 0x66, 0x00, 0x00, // export "f" func 0
                0x0A, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2A, 0x0B, // i32.const 42
            ]
        );
    }

    #[test]
    fn negative_const_uses_signed_leb() {
        let bytes = compile("(module (func (result i32) i32.const -1))");
        let code = &bytes[bytes.len() - 4..];
        assert_eq!(code, [0x00, 0x41, 0x7F, 0x0B]);
    }

    #[test]
    fn locals_are_compressed() {
        let bytes = compile("(module (func (local i32 i32) (local f64)))");
        // Two runs: 2 x i32, 1 x f64, then end.
        let code_section = &bytes[bytes.len() - 10..];
        assert_eq!(
            code_section,
            [0x0A, 0x08, 0x01, 0x06, 0x02, 0x02, 0x7F, 0x01, 0x7C, 0x0B]
        );
    }

    #[test]
    fn block_encodes_header_and_end() {
        let bytes = compile("(module (func (block nop)))");
        let tail = &bytes[bytes.len() - 7..];
        // body size, no locals, block, empty blocktype, nop, end, end
        assert_eq!(tail, [0x06, 0x00, 0x02, 0x40, 0x01, 0x0B, 0x0B]);
    }

    #[test]
    fn if_with_else_branch() {
        let bytes = compile(
            "(module (func (param i32) (result i32)
               (if (result i32) (local.get 0)
                 (then (i32.const 1))
                 (else (i32.const 2)))))",
        );
        let tail = &bytes[bytes.len() - 13..];
        assert_eq!(
            tail,
            [
                0x0C, 0x00, // body size, no locals
                0x20, 0x00, // local.get 0
                0x04, 0x7F, // if (result i32)
                0x41, 0x01, // i32.const 1
                0x05, // else
                0x41, 0x02, // i32.const 2
                0x0B, 0x0B, // end, end
            ]
        );
    }

    #[test]
    fn memory_and_data() {
        let bytes = compile(r#"(module (memory 1 2) (data (i32.const 0) "hi"))"#);
        let memory = &bytes[8..14];
        assert_eq!(memory, [0x05, 0x04, 0x01, 0x01, 0x01, 0x02]);
        let data = &bytes[14..];
        assert_eq!(data, [0x0B, 0x08, 0x01, 0x00, 0x41, 0x00, 0x0B, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn table_elem_and_start() {
        let bytes = compile(
            "(module
               (table 1 funcref)
               (func $f)
               (elem (i32.const 0) $f)
               (start $f))",
        );
        // table section: funcref, no max, min 1
        let table_at = 8 + 6 + 4; // header + type section + function section
        assert_eq!(
            &bytes[table_at..table_at + 6],
            [0x04, 0x04, 0x01, 0x70, 0x00, 0x01]
        );
        // start section follows table
        let start_at = table_at + 6;
        assert_eq!(&bytes[start_at..start_at + 3], [0x08, 0x01, 0x00]);
        // element section
        let elem_at = start_at + 3;
        assert_eq!(
            &bytes[elem_at..elem_at + 9],
            [0x09, 0x07, 0x01, 0x00, 0x41, 0x00, 0x0B, 0x01, 0x00]
        );
    }

    #[test]
    fn memarg_defaults_and_overrides() {
        let bytes = compile(
            "(module (memory 1)
               (func (param i32)
                 (i32.store offset=8 (local.get 0) (i32.const 1))
                 (i64.store (local.get 0) (i64.const 1))))",
        );
        let hay = bytes.as_slice();
        // i32.store offset=8: natural align log2 = 2
        assert!(contains(hay, &[0x36, 0x02, 0x08]));
        // i64.store: natural align log2 = 3, offset 0
        assert!(contains(hay, &[0x37, 0x03, 0x00]));
    }

    fn contains(hay: &[u8], needle: &[u8]) -> bool {
        hay.windows(needle.len()).any(|w| w == needle)
    }
}
