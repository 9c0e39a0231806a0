//! The static opcode table.
//!
//! Maps every supported mnemonic to its opcode byte, the kind of immediate
//! operands it takes, and its static stack effect. The table is immutable
//! after process start; opcode tokens hold a reference into it so the later
//! stages never perform string lookups.

use std::fmt;

/// A WebAssembly value type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

impl ValType {
    pub fn from_name(name: &str) -> Option<ValType> {
        match name {
            "i32" => Some(ValType::I32),
            "i64" => Some(ValType::I64),
            "f32" => Some(ValType::F32),
            "f64" => Some(ValType::F64),
            "funcref" => Some(ValType::FuncRef),
            "externref" => Some(ValType::ExternRef),
            _ => None,
        }
    }

    /// The binary-format type byte.
    pub fn byte(self) -> u8 {
        match self {
            ValType::I32 => 0x7F,
            ValType::I64 => 0x7E,
            ValType::F32 => 0x7D,
            ValType::F64 => 0x7C,
            ValType::FuncRef => 0x70,
            ValType::ExternRef => 0x6F,
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::FuncRef | ValType::ExternRef)
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The immediate operands an instruction carries after its opcode byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Imm {
    None,
    LocalIdx,
    GlobalIdx,
    FuncIdx,
    /// `call_indirect`: a `(type ...)` use plus the implicit table index.
    TypeIdx,
    LabelIdx,
    /// `br_table`: one or more label targets, the last being the default.
    LabelTable,
    I32,
    I64,
    F32,
    F64,
    /// Optional `offset=`/`align=` pair; `natural_align` is log2 of the
    /// access width, used when the source omits `align=`.
    Mem { natural_align: u32 },
    /// `ref.null`: a heap-type keyword (`func` or `extern`).
    RefType,
}

/// One row of the opcode table.
///
/// `consumes`/`produces` describe the stack effect for instructions whose
/// effect is fixed. Instructions whose effect depends on context (calls,
/// variable access, branches, parametric operators) carry empty lists here
/// and are special-cased by the type checker using the immediate descriptor.
#[derive(Debug, PartialEq)]
pub struct OpcodeInfo {
    pub name: &'static str,
    pub byte: u8,
    pub imm: Imm,
    pub consumes: &'static [ValType],
    pub produces: &'static [ValType],
}

pub fn lookup(name: &str) -> Option<&'static OpcodeInfo> {
    OPCODES.get(name)
}

const fn op(
    name: &'static str,
    byte: u8,
    imm: Imm,
    consumes: &'static [ValType],
    produces: &'static [ValType],
) -> OpcodeInfo {
    OpcodeInfo {
        name,
        byte,
        imm,
        consumes,
        produces,
    }
}

use ValType::{FuncRef, F32, F64, I32, I64};

const NONE: &[ValType] = &[];
const ONE_I32: &[ValType] = &[I32];
const TWO_I32: &[ValType] = &[I32, I32];
const ONE_I64: &[ValType] = &[I64];
const TWO_I64: &[ValType] = &[I64, I64];
const ONE_F32: &[ValType] = &[F32];
const TWO_F32: &[ValType] = &[F32, F32];
const ONE_F64: &[ValType] = &[F64];
const TWO_F64: &[ValType] = &[F64, F64];
const ADDR_I32: &[ValType] = &[I32, I32];
const ADDR_I64: &[ValType] = &[I32, I64];
const ADDR_F32: &[ValType] = &[I32, F32];
const ADDR_F64: &[ValType] = &[I32, F64];
const ONE_FUNCREF: &[ValType] = &[FuncRef];

pub static OPCODES: phf::Map<&'static str, OpcodeInfo> = phf::phf_map! {
    // Control.
    "unreachable" => op("unreachable", 0x00, Imm::None, NONE, NONE),
    "nop" => op("nop", 0x01, Imm::None, NONE, NONE),
    "br" => op("br", 0x0C, Imm::LabelIdx, NONE, NONE),
    "br_if" => op("br_if", 0x0D, Imm::LabelIdx, NONE, NONE),
    "br_table" => op("br_table", 0x0E, Imm::LabelTable, NONE, NONE),
    "return" => op("return", 0x0F, Imm::None, NONE, NONE),
    "call" => op("call", 0x10, Imm::FuncIdx, NONE, NONE),
    "call_indirect" => op("call_indirect", 0x11, Imm::TypeIdx, NONE, NONE),

    // Parametric.
    "drop" => op("drop", 0x1A, Imm::None, NONE, NONE),
    "select" => op("select", 0x1B, Imm::None, NONE, NONE),

    // Variable access.
    "local.get" => op("local.get", 0x20, Imm::LocalIdx, NONE, NONE),
    "local.set" => op("local.set", 0x21, Imm::LocalIdx, NONE, NONE),
    "local.tee" => op("local.tee", 0x22, Imm::LocalIdx, NONE, NONE),
    "global.get" => op("global.get", 0x23, Imm::GlobalIdx, NONE, NONE),
    "global.set" => op("global.set", 0x24, Imm::GlobalIdx, NONE, NONE),

    // Memory access.
    "i32.load" => op("i32.load", 0x28, Imm::Mem { natural_align: 2 }, ONE_I32, ONE_I32),
    "i64.load" => op("i64.load", 0x29, Imm::Mem { natural_align: 3 }, ONE_I32, ONE_I64),
    "f32.load" => op("f32.load", 0x2A, Imm::Mem { natural_align: 2 }, ONE_I32, ONE_F32),
    "f64.load" => op("f64.load", 0x2B, Imm::Mem { natural_align: 3 }, ONE_I32, ONE_F64),
    "i32.load8_s" => op("i32.load8_s", 0x2C, Imm::Mem { natural_align: 0 }, ONE_I32, ONE_I32),
    "i32.load8_u" => op("i32.load8_u", 0x2D, Imm::Mem { natural_align: 0 }, ONE_I32, ONE_I32),
    "i32.load16_s" => op("i32.load16_s", 0x2E, Imm::Mem { natural_align: 1 }, ONE_I32, ONE_I32),
    "i32.load16_u" => op("i32.load16_u", 0x2F, Imm::Mem { natural_align: 1 }, ONE_I32, ONE_I32),
    "i64.load8_s" => op("i64.load8_s", 0x30, Imm::Mem { natural_align: 0 }, ONE_I32, ONE_I64),
    "i64.load8_u" => op("i64.load8_u", 0x31, Imm::Mem { natural_align: 0 }, ONE_I32, ONE_I64),
    "i64.load16_s" => op("i64.load16_s", 0x32, Imm::Mem { natural_align: 1 }, ONE_I32, ONE_I64),
    "i64.load16_u" => op("i64.load16_u", 0x33, Imm::Mem { natural_align: 1 }, ONE_I32, ONE_I64),
    "i64.load32_s" => op("i64.load32_s", 0x34, Imm::Mem { natural_align: 2 }, ONE_I32, ONE_I64),
    "i64.load32_u" => op("i64.load32_u", 0x35, Imm::Mem { natural_align: 2 }, ONE_I32, ONE_I64),
    "i32.store" => op("i32.store", 0x36, Imm::Mem { natural_align: 2 }, ADDR_I32, NONE),
    "i64.store" => op("i64.store", 0x37, Imm::Mem { natural_align: 3 }, ADDR_I64, NONE),
    "f32.store" => op("f32.store", 0x38, Imm::Mem { natural_align: 2 }, ADDR_F32, NONE),
    "f64.store" => op("f64.store", 0x39, Imm::Mem { natural_align: 3 }, ADDR_F64, NONE),
    "i32.store8" => op("i32.store8", 0x3A, Imm::Mem { natural_align: 0 }, ADDR_I32, NONE),
    "i32.store16" => op("i32.store16", 0x3B, Imm::Mem { natural_align: 1 }, ADDR_I32, NONE),
    "i64.store8" => op("i64.store8", 0x3C, Imm::Mem { natural_align: 0 }, ADDR_I64, NONE),
    "i64.store16" => op("i64.store16", 0x3D, Imm::Mem { natural_align: 1 }, ADDR_I64, NONE),
    "i64.store32" => op("i64.store32", 0x3E, Imm::Mem { natural_align: 2 }, ADDR_I64, NONE),
    "memory.size" => op("memory.size", 0x3F, Imm::None, NONE, ONE_I32),
    "memory.grow" => op("memory.grow", 0x40, Imm::None, ONE_I32, ONE_I32),

    // Constants.
    "i32.const" => op("i32.const", 0x41, Imm::I32, NONE, ONE_I32),
    "i64.const" => op("i64.const", 0x42, Imm::I64, NONE, ONE_I64),
    "f32.const" => op("f32.const", 0x43, Imm::F32, NONE, ONE_F32),
    "f64.const" => op("f64.const", 0x44, Imm::F64, NONE, ONE_F64),

    // i32 comparisons.
    "i32.eqz" => op("i32.eqz", 0x45, Imm::None, ONE_I32, ONE_I32),
    "i32.eq" => op("i32.eq", 0x46, Imm::None, TWO_I32, ONE_I32),
    "i32.ne" => op("i32.ne", 0x47, Imm::None, TWO_I32, ONE_I32),
    "i32.lt_s" => op("i32.lt_s", 0x48, Imm::None, TWO_I32, ONE_I32),
    "i32.lt_u" => op("i32.lt_u", 0x49, Imm::None, TWO_I32, ONE_I32),
    "i32.gt_s" => op("i32.gt_s", 0x4A, Imm::None, TWO_I32, ONE_I32),
    "i32.gt_u" => op("i32.gt_u", 0x4B, Imm::None, TWO_I32, ONE_I32),
    "i32.le_s" => op("i32.le_s", 0x4C, Imm::None, TWO_I32, ONE_I32),
    "i32.le_u" => op("i32.le_u", 0x4D, Imm::None, TWO_I32, ONE_I32),
    "i32.ge_s" => op("i32.ge_s", 0x4E, Imm::None, TWO_I32, ONE_I32),
    "i32.ge_u" => op("i32.ge_u", 0x4F, Imm::None, TWO_I32, ONE_I32),

    // i64 comparisons.
    "i64.eqz" => op("i64.eqz", 0x50, Imm::None, ONE_I64, ONE_I32),
    "i64.eq" => op("i64.eq", 0x51, Imm::None, TWO_I64, ONE_I32),
    "i64.ne" => op("i64.ne", 0x52, Imm::None, TWO_I64, ONE_I32),
    "i64.lt_s" => op("i64.lt_s", 0x53, Imm::None, TWO_I64, ONE_I32),
    "i64.lt_u" => op("i64.lt_u", 0x54, Imm::None, TWO_I64, ONE_I32),
    "i64.gt_s" => op("i64.gt_s", 0x55, Imm::None, TWO_I64, ONE_I32),
    "i64.gt_u" => op("i64.gt_u", 0x56, Imm::None, TWO_I64, ONE_I32),
    "i64.le_s" => op("i64.le_s", 0x57, Imm::None, TWO_I64, ONE_I32),
    "i64.le_u" => op("i64.le_u", 0x58, Imm::None, TWO_I64, ONE_I32),
    "i64.ge_s" => op("i64.ge_s", 0x59, Imm::None, TWO_I64, ONE_I32),
    "i64.ge_u" => op("i64.ge_u", 0x5A, Imm::None, TWO_I64, ONE_I32),

    // f32 comparisons (ordered).
    "f32.eq" => op("f32.eq", 0x5B, Imm::None, TWO_F32, ONE_I32),
    "f32.ne" => op("f32.ne", 0x5C, Imm::None, TWO_F32, ONE_I32),
    "f32.lt" => op("f32.lt", 0x5D, Imm::None, TWO_F32, ONE_I32),
    "f32.gt" => op("f32.gt", 0x5E, Imm::None, TWO_F32, ONE_I32),
    "f32.le" => op("f32.le", 0x5F, Imm::None, TWO_F32, ONE_I32),
    "f32.ge" => op("f32.ge", 0x60, Imm::None, TWO_F32, ONE_I32),

    // f64 comparisons (ordered).
    "f64.eq" => op("f64.eq", 0x61, Imm::None, TWO_F64, ONE_I32),
    "f64.ne" => op("f64.ne", 0x62, Imm::None, TWO_F64, ONE_I32),
    "f64.lt" => op("f64.lt", 0x63, Imm::None, TWO_F64, ONE_I32),
    "f64.gt" => op("f64.gt", 0x64, Imm::None, TWO_F64, ONE_I32),
    "f64.le" => op("f64.le", 0x65, Imm::None, TWO_F64, ONE_I32),
    "f64.ge" => op("f64.ge", 0x66, Imm::None, TWO_F64, ONE_I32),

    // i32 arithmetic and bit operations.
    "i32.clz" => op("i32.clz", 0x67, Imm::None, ONE_I32, ONE_I32),
    "i32.ctz" => op("i32.ctz", 0x68, Imm::None, ONE_I32, ONE_I32),
    "i32.popcnt" => op("i32.popcnt", 0x69, Imm::None, ONE_I32, ONE_I32),
    "i32.add" => op("i32.add", 0x6A, Imm::None, TWO_I32, ONE_I32),
    "i32.sub" => op("i32.sub", 0x6B, Imm::None, TWO_I32, ONE_I32),
    "i32.mul" => op("i32.mul", 0x6C, Imm::None, TWO_I32, ONE_I32),
    "i32.div_s" => op("i32.div_s", 0x6D, Imm::None, TWO_I32, ONE_I32),
    "i32.div_u" => op("i32.div_u", 0x6E, Imm::None, TWO_I32, ONE_I32),
    "i32.rem_s" => op("i32.rem_s", 0x6F, Imm::None, TWO_I32, ONE_I32),
    "i32.rem_u" => op("i32.rem_u", 0x70, Imm::None, TWO_I32, ONE_I32),
    "i32.and" => op("i32.and", 0x71, Imm::None, TWO_I32, ONE_I32),
    "i32.or" => op("i32.or", 0x72, Imm::None, TWO_I32, ONE_I32),
    "i32.xor" => op("i32.xor", 0x73, Imm::None, TWO_I32, ONE_I32),
    "i32.shl" => op("i32.shl", 0x74, Imm::None, TWO_I32, ONE_I32),
    "i32.shr_s" => op("i32.shr_s", 0x75, Imm::None, TWO_I32, ONE_I32),
    "i32.shr_u" => op("i32.shr_u", 0x76, Imm::None, TWO_I32, ONE_I32),
    "i32.rotl" => op("i32.rotl", 0x77, Imm::None, TWO_I32, ONE_I32),
    "i32.rotr" => op("i32.rotr", 0x78, Imm::None, TWO_I32, ONE_I32),

    // i64 arithmetic and bit operations.
    "i64.clz" => op("i64.clz", 0x79, Imm::None, ONE_I64, ONE_I64),
    "i64.ctz" => op("i64.ctz", 0x7A, Imm::None, ONE_I64, ONE_I64),
    "i64.popcnt" => op("i64.popcnt", 0x7B, Imm::None, ONE_I64, ONE_I64),
    "i64.add" => op("i64.add", 0x7C, Imm::None, TWO_I64, ONE_I64),
    "i64.sub" => op("i64.sub", 0x7D, Imm::None, TWO_I64, ONE_I64),
    "i64.mul" => op("i64.mul", 0x7E, Imm::None, TWO_I64, ONE_I64),
    "i64.div_s" => op("i64.div_s", 0x7F, Imm::None, TWO_I64, ONE_I64),
    "i64.div_u" => op("i64.div_u", 0x80, Imm::None, TWO_I64, ONE_I64),
    "i64.rem_s" => op("i64.rem_s", 0x81, Imm::None, TWO_I64, ONE_I64),
    "i64.rem_u" => op("i64.rem_u", 0x82, Imm::None, TWO_I64, ONE_I64),
    "i64.and" => op("i64.and", 0x83, Imm::None, TWO_I64, ONE_I64),
    "i64.or" => op("i64.or", 0x84, Imm::None, TWO_I64, ONE_I64),
    "i64.xor" => op("i64.xor", 0x85, Imm::None, TWO_I64, ONE_I64),
    "i64.shl" => op("i64.shl", 0x86, Imm::None, TWO_I64, ONE_I64),
    "i64.shr_s" => op("i64.shr_s", 0x87, Imm::None, TWO_I64, ONE_I64),
    "i64.shr_u" => op("i64.shr_u", 0x88, Imm::None, TWO_I64, ONE_I64),
    "i64.rotl" => op("i64.rotl", 0x89, Imm::None, TWO_I64, ONE_I64),
    "i64.rotr" => op("i64.rotr", 0x8A, Imm::None, TWO_I64, ONE_I64),

    // f32 arithmetic.
    "f32.abs" => op("f32.abs", 0x8B, Imm::None, ONE_F32, ONE_F32),
    "f32.neg" => op("f32.neg", 0x8C, Imm::None, ONE_F32, ONE_F32),
    "f32.ceil" => op("f32.ceil", 0x8D, Imm::None, ONE_F32, ONE_F32),
    "f32.floor" => op("f32.floor", 0x8E, Imm::None, ONE_F32, ONE_F32),
    "f32.trunc" => op("f32.trunc", 0x8F, Imm::None, ONE_F32, ONE_F32),
    "f32.nearest" => op("f32.nearest", 0x90, Imm::None, ONE_F32, ONE_F32),
    "f32.sqrt" => op("f32.sqrt", 0x91, Imm::None, ONE_F32, ONE_F32),
    "f32.add" => op("f32.add", 0x92, Imm::None, TWO_F32, ONE_F32),
    "f32.sub" => op("f32.sub", 0x93, Imm::None, TWO_F32, ONE_F32),
    "f32.mul" => op("f32.mul", 0x94, Imm::None, TWO_F32, ONE_F32),
    "f32.div" => op("f32.div", 0x95, Imm::None, TWO_F32, ONE_F32),
    "f32.min" => op("f32.min", 0x96, Imm::None, TWO_F32, ONE_F32),
    "f32.max" => op("f32.max", 0x97, Imm::None, TWO_F32, ONE_F32),
    "f32.copysign" => op("f32.copysign", 0x98, Imm::None, TWO_F32, ONE_F32),

    // f64 arithmetic.
    "f64.abs" => op("f64.abs", 0x99, Imm::None, ONE_F64, ONE_F64),
    "f64.neg" => op("f64.neg", 0x9A, Imm::None, ONE_F64, ONE_F64),
    "f64.ceil" => op("f64.ceil", 0x9B, Imm::None, ONE_F64, ONE_F64),
    "f64.floor" => op("f64.floor", 0x9C, Imm::None, ONE_F64, ONE_F64),
    "f64.trunc" => op("f64.trunc", 0x9D, Imm::None, ONE_F64, ONE_F64),
    "f64.nearest" => op("f64.nearest", 0x9E, Imm::None, ONE_F64, ONE_F64),
    "f64.sqrt" => op("f64.sqrt", 0x9F, Imm::None, ONE_F64, ONE_F64),
    "f64.add" => op("f64.add", 0xA0, Imm::None, TWO_F64, ONE_F64),
    "f64.sub" => op("f64.sub", 0xA1, Imm::None, TWO_F64, ONE_F64),
    "f64.mul" => op("f64.mul", 0xA2, Imm::None, TWO_F64, ONE_F64),
    "f64.div" => op("f64.div", 0xA3, Imm::None, TWO_F64, ONE_F64),
    "f64.min" => op("f64.min", 0xA4, Imm::None, TWO_F64, ONE_F64),
    "f64.max" => op("f64.max", 0xA5, Imm::None, TWO_F64, ONE_F64),
    "f64.copysign" => op("f64.copysign", 0xA6, Imm::None, TWO_F64, ONE_F64),

    // Conversions.
    "i32.wrap_i64" => op("i32.wrap_i64", 0xA7, Imm::None, ONE_I64, ONE_I32),
    "i32.trunc_f32_s" => op("i32.trunc_f32_s", 0xA8, Imm::None, ONE_F32, ONE_I32),
    "i32.trunc_f32_u" => op("i32.trunc_f32_u", 0xA9, Imm::None, ONE_F32, ONE_I32),
    "i32.trunc_f64_s" => op("i32.trunc_f64_s", 0xAA, Imm::None, ONE_F64, ONE_I32),
    "i32.trunc_f64_u" => op("i32.trunc_f64_u", 0xAB, Imm::None, ONE_F64, ONE_I32),
    "i64.extend_i32_s" => op("i64.extend_i32_s", 0xAC, Imm::None, ONE_I32, ONE_I64),
    "i64.extend_i32_u" => op("i64.extend_i32_u", 0xAD, Imm::None, ONE_I32, ONE_I64),
    "i64.trunc_f32_s" => op("i64.trunc_f32_s", 0xAE, Imm::None, ONE_F32, ONE_I64),
    "i64.trunc_f32_u" => op("i64.trunc_f32_u", 0xAF, Imm::None, ONE_F32, ONE_I64),
    "i64.trunc_f64_s" => op("i64.trunc_f64_s", 0xB0, Imm::None, ONE_F64, ONE_I64),
    "i64.trunc_f64_u" => op("i64.trunc_f64_u", 0xB1, Imm::None, ONE_F64, ONE_I64),
    "f32.convert_i32_s" => op("f32.convert_i32_s", 0xB2, Imm::None, ONE_I32, ONE_F32),
    "f32.convert_i32_u" => op("f32.convert_i32_u", 0xB3, Imm::None, ONE_I32, ONE_F32),
    "f32.convert_i64_s" => op("f32.convert_i64_s", 0xB4, Imm::None, ONE_I64, ONE_F32),
    "f32.convert_i64_u" => op("f32.convert_i64_u", 0xB5, Imm::None, ONE_I64, ONE_F32),
    "f32.demote_f64" => op("f32.demote_f64", 0xB6, Imm::None, ONE_F64, ONE_F32),
    "f64.convert_i32_s" => op("f64.convert_i32_s", 0xB7, Imm::None, ONE_I32, ONE_F64),
    "f64.convert_i32_u" => op("f64.convert_i32_u", 0xB8, Imm::None, ONE_I32, ONE_F64),
    "f64.convert_i64_s" => op("f64.convert_i64_s", 0xB9, Imm::None, ONE_I64, ONE_F64),
    "f64.convert_i64_u" => op("f64.convert_i64_u", 0xBA, Imm::None, ONE_I64, ONE_F64),
    "f64.promote_f32" => op("f64.promote_f32", 0xBB, Imm::None, ONE_F32, ONE_F64),
    "i32.reinterpret_f32" => op("i32.reinterpret_f32", 0xBC, Imm::None, ONE_F32, ONE_I32),
    "i64.reinterpret_f64" => op("i64.reinterpret_f64", 0xBD, Imm::None, ONE_F64, ONE_I64),
    "f32.reinterpret_i32" => op("f32.reinterpret_i32", 0xBE, Imm::None, ONE_I32, ONE_F32),
    "f64.reinterpret_i64" => op("f64.reinterpret_i64", 0xBF, Imm::None, ONE_I64, ONE_F64),

    // Sign extension.
    "i32.extend8_s" => op("i32.extend8_s", 0xC0, Imm::None, ONE_I32, ONE_I32),
    "i32.extend16_s" => op("i32.extend16_s", 0xC1, Imm::None, ONE_I32, ONE_I32),
    "i64.extend8_s" => op("i64.extend8_s", 0xC2, Imm::None, ONE_I64, ONE_I64),
    "i64.extend16_s" => op("i64.extend16_s", 0xC3, Imm::None, ONE_I64, ONE_I64),
    "i64.extend32_s" => op("i64.extend32_s", 0xC4, Imm::None, ONE_I64, ONE_I64),

    // Reference instructions.
    "ref.null" => op("ref.null", 0xD0, Imm::RefType, NONE, NONE),
    "ref.is_null" => op("ref.is_null", 0xD1, Imm::None, NONE, ONE_I32),
    "ref.func" => op("ref.func", 0xD2, Imm::FuncIdx, NONE, ONE_FUNCREF),
};
