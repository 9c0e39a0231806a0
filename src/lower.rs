//! Lowering: parse tree to module IR.
//!
//! Proceeds top-down by form-head dispatch. A first pass over the module
//! fields registers every name and index-space slot (so references may point
//! forward); a second pass lowers bodies, resolves symbolic names to numeric
//! indices, interns signatures, and synthesizes export entries from the
//! inline shorthand.
//!
//! Context is threaded explicitly: module-level name tables live on the
//! `Lowerer`, per-function state (local slot names, the label stack) in a
//! `FuncCtx` passed down the body visitors.

use std::collections::HashMap;

use crate::{
    error::{Error, FormError, NameError},
    ir::{
        BlockExpr, BlockKind, DataExpr, DataMode, ElemExpr, ElemMode, ExportExpr, ExportKind,
        FuncExpr, FuncSig, GlobalExpr, GlobalType, ImportDesc, ImportExpr, Instr, Limits,
        MemoryType, ModuleExpr, OpExpr, Signature, TableType,
    },
    opcode::{Imm, OpcodeInfo, ValType},
    sexpr::{ParseTree, SExpr, SExprList},
    token::{Integer, Keyword, Span, Token, TokenKind},
};

pub fn lower(tree: &ParseTree) -> Result<ModuleExpr, Error> {
    Lowerer::default().run(tree.root())
}

#[derive(Default)]
struct Lowerer {
    module: ModuleExpr,
    type_names: HashMap<String, u32>,
    func_names: HashMap<String, u32>,
    table_names: HashMap<String, u32>,
    memory_names: HashMap<String, u32>,
    global_names: HashMap<String, u32>,
    func_count: u32,
    table_count: u32,
    memory_count: u32,
    global_count: u32,
}

/// Per-function lowering state. Slot names cover parameters then locals, in
/// declaration order; the label stack mirrors block nesting (innermost
/// last).
#[derive(Default)]
struct FuncCtx {
    func_name: Option<String>,
    slot_names: Vec<Option<String>>,
    labels: Vec<Option<String>>,
}

/// Index namespaces with sequential, import-inclusive counters.
#[derive(Copy, Clone)]
enum Ns {
    Func,
    Table,
    Memory,
    Global,
}

impl Ns {
    fn name(self) -> &'static str {
        match self {
            Ns::Func => "function",
            Ns::Table => "table",
            Ns::Memory => "memory",
            Ns::Global => "global",
        }
    }
}

struct TypeUse {
    type_index: u32,
    signature: Signature,
    param_names: Vec<Option<String>>,
    next: usize,
}

impl Lowerer {
    fn run(mut self, root: &SExpr) -> Result<ModuleExpr, Error> {
        let list = expect_list(root)?;
        if list.head_keyword() != Some(Keyword::Module) {
            return Err(form("expected a module form", root.span()));
        }

        let mut start = 1;
        if id_of(list.get(1)).is_some() {
            start = 2;
        }
        let fields = &list.items()[start..];

        for field in fields {
            self.declare_field(field)?;
        }

        // Replay the index-space registration order so each definition
        // lowers under the index it was assigned in the first pass.
        let (mut func_idx, mut table_idx, mut memory_idx, mut global_idx) = (0u32, 0u32, 0u32, 0u32);
        for field in fields {
            let fl = expect_list(field)?;
            match fl.head_keyword() {
                Some(Keyword::Type) | None => {}
                Some(Keyword::Import) => match import_kind(fl)? {
                    Keyword::Func => func_idx += 1,
                    Keyword::Table => table_idx += 1,
                    Keyword::Memory => memory_idx += 1,
                    _ => global_idx += 1,
                },
                Some(Keyword::Func) => {
                    self.lower_func(fl, func_idx)?;
                    func_idx += 1;
                }
                Some(Keyword::Table) => {
                    self.lower_table(fl, table_idx)?;
                    table_idx += 1;
                }
                Some(Keyword::Memory) => {
                    self.lower_memory(fl, memory_idx)?;
                    memory_idx += 1;
                }
                Some(Keyword::Global) => {
                    self.lower_global(fl, global_idx)?;
                    global_idx += 1;
                }
                Some(Keyword::Export) => self.lower_export(fl)?,
                Some(Keyword::Elem) => self.lower_elem(fl)?,
                Some(Keyword::Data) => self.lower_data(fl)?,
                Some(Keyword::Start) => self.lower_start(fl)?,
                Some(kw) => {
                    return Err(form(format!("unexpected `{}` field", kw.name()), fl.span))
                }
            }
        }

        Ok(self.module)
    }

    // ------------------------------------------------------------------
    // Pass 1: declarations
    // ------------------------------------------------------------------

    fn declare_field(&mut self, field: &SExpr) -> Result<(), Error> {
        let fl = expect_list(field)?;
        let Some(kw) = fl.head_keyword() else {
            return Err(form("expected a field keyword", fl.span));
        };
        match kw {
            Keyword::Type => self.declare_type(fl),
            Keyword::Import => self.declare_import(fl),
            Keyword::Func => {
                self.register(Ns::Func, id_of(fl.get(1)))?;
                // Filled in by the second pass.
                self.module.func_types.push(u32::MAX);
                Ok(())
            }
            Keyword::Table => self.register(Ns::Table, id_of(fl.get(1))).map(|_| ()),
            Keyword::Memory => self.register(Ns::Memory, id_of(fl.get(1))).map(|_| ()),
            Keyword::Global => {
                self.register(Ns::Global, id_of(fl.get(1)))?;
                self.module.global_types.push(GlobalType {
                    ty: ValType::I32,
                    mutable: false,
                });
                Ok(())
            }
            Keyword::Export | Keyword::Elem | Keyword::Data | Keyword::Start => Ok(()),
            kw => Err(form(format!("unexpected `{}` field", kw.name()), fl.span)),
        }
    }

    fn declare_type(&mut self, fl: &SExprList) -> Result<(), Error> {
        let mut idx = 1;
        let name = id_of(fl.get(idx));
        if name.is_some() {
            idx += 1;
        }
        let func_form = fl
            .get(idx)
            .ok_or_else(|| form("expected a function type", fl.span))?;
        let inner = expect_list(func_form)?;
        if inner.head_keyword() != Some(Keyword::Func) {
            return Err(form("expected a `func` type form", inner.span));
        }

        let mut params = Vec::new();
        let mut param_names = Vec::new();
        let mut results = Vec::new();
        for item in &inner.items()[1..] {
            let sub = expect_list(item)?;
            match sub.head_keyword() {
                Some(Keyword::Param) => {
                    self.collect_decls(sub, "parameter", &mut params, &mut param_names)?
                }
                Some(Keyword::Result) => collect_results(sub, &mut results)?,
                _ => return Err(form("expected `param` or `result`", sub.span)),
            }
        }

        let index = self.module.types.intern(Signature { params, results });
        if let Some((n, span)) = name {
            if self.type_names.insert(n.to_string(), index).is_some() {
                return Err(form(format!("duplicate type name ${n}"), span));
            }
        }
        Ok(())
    }

    fn declare_import(&mut self, fl: &SExprList) -> Result<(), Error> {
        let module_name = self.name_string(fl.get(1), fl.span)?;
        let field_name = self.name_string(fl.get(2), fl.span)?;
        let desc = expect_list(
            fl.get(3)
                .ok_or_else(|| form("expected an import descriptor", fl.span))?,
        )?;

        let name = id_of(desc.get(1));
        let start = if name.is_some() { 2 } else { 1 };
        let desc_ir = match desc.head_keyword() {
            Some(Keyword::Func) => {
                self.register(Ns::Func, name)?;
                let tu = self.parse_type_use(desc.items(), start)?;
                self.module.func_types.push(tu.type_index);
                ImportDesc::Func {
                    type_index: tu.type_index,
                }
            }
            Some(Keyword::Table) => {
                self.register(Ns::Table, name)?;
                let (limits, consumed) = parse_limits(desc.items(), start, desc.span)?;
                let ref_type = ref_type_of(desc.get(start + consumed), desc.span)?;
                ImportDesc::Table(TableType { limits, ref_type })
            }
            Some(Keyword::Memory) => {
                self.register(Ns::Memory, name)?;
                let (limits, _) = parse_limits(desc.items(), start, desc.span)?;
                ImportDesc::Memory(MemoryType { limits })
            }
            Some(Keyword::Global) => {
                self.register(Ns::Global, name)?;
                let ty = parse_global_type(
                    desc.get(start)
                        .ok_or_else(|| form("expected a global type", desc.span))?,
                )?;
                self.module.global_types.push(ty);
                ImportDesc::Global(ty)
            }
            _ => return Err(form("unknown import kind", desc.span)),
        };

        self.module.imports.push(ImportExpr {
            module: module_name,
            field: field_name,
            desc: desc_ir,
        });
        Ok(())
    }

    fn register(&mut self, ns: Ns, name: Option<(&str, Span)>) -> Result<u32, Error> {
        let (map, count) = match ns {
            Ns::Func => (&mut self.func_names, &mut self.func_count),
            Ns::Table => (&mut self.table_names, &mut self.table_count),
            Ns::Memory => (&mut self.memory_names, &mut self.memory_count),
            Ns::Global => (&mut self.global_names, &mut self.global_count),
        };
        let index = *count;
        *count += 1;
        if let Some((n, span)) = name {
            if map.insert(n.to_string(), index).is_some() {
                return Err(form(format!("duplicate {} name ${n}", ns.name()), span));
            }
        }
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Pass 2: definitions
    // ------------------------------------------------------------------

    fn lower_func(&mut self, fl: &SExprList, func_index: u32) -> Result<(), Error> {
        let mut idx = 1;
        let name = id_of(fl.get(idx)).map(|(n, _)| n.to_string());
        if name.is_some() {
            idx += 1;
        }

        let mut export_names = Vec::new();
        while let Some(item) = fl.get(idx) {
            if !item.is_list_headed_by(Keyword::Export) {
                break;
            }
            let el = expect_list(item)?;
            let export = self.name_string(el.get(1), el.span)?;
            export_names.push(export.clone());
            self.module.exports.push(ExportExpr {
                name: export,
                kind: ExportKind::Func,
                index: func_index,
            });
            idx += 1;
        }

        let tu = self.parse_type_use(fl.items(), idx)?;
        idx = tu.next;

        let mut locals = Vec::new();
        let mut local_names = Vec::new();
        while let Some(item) = fl.get(idx) {
            if !item.is_list_headed_by(Keyword::Local) {
                break;
            }
            let inner = expect_list(item)?;
            self.collect_decls(inner, "local", &mut locals, &mut local_names)?;
            idx += 1;
        }

        let mut ctx = FuncCtx {
            func_name: name.clone(),
            slot_names: tu
                .param_names
                .iter()
                .cloned()
                .chain(local_names.iter().cloned())
                .collect(),
            labels: Vec::new(),
        };
        let body = self.lower_body(&fl.items()[idx..], &mut ctx)?;

        if let Some(slot) = self.module.func_types.get_mut(func_index as usize) {
            *slot = tu.type_index;
        } else {
            return Err(Error::internal("function index space out of sync"));
        }
        self.module.funcs.push(FuncExpr {
            sig: FuncSig {
                type_index: tu.type_index,
                signature: tu.signature,
                name,
                export_names,
                param_names: tu.param_names,
                locals,
                local_names,
            },
            body,
            span: fl.span,
        });
        Ok(())
    }

    fn lower_table(&mut self, fl: &SExprList, index: u32) -> Result<(), Error> {
        let mut idx = 1;
        if id_of(fl.get(idx)).is_some() {
            idx += 1;
        }
        idx = self.collect_inline_exports(fl, idx, ExportKind::Table, index)?;
        let (limits, consumed) = parse_limits(fl.items(), idx, fl.span)?;
        let ref_type = ref_type_of(fl.get(idx + consumed), fl.span)?;
        self.module.tables.push(TableType { limits, ref_type });
        Ok(())
    }

    fn lower_memory(&mut self, fl: &SExprList, index: u32) -> Result<(), Error> {
        let mut idx = 1;
        if id_of(fl.get(idx)).is_some() {
            idx += 1;
        }
        idx = self.collect_inline_exports(fl, idx, ExportKind::Memory, index)?;
        let (limits, _) = parse_limits(fl.items(), idx, fl.span)?;
        self.module.memories.push(MemoryType { limits });
        Ok(())
    }

    fn lower_global(&mut self, fl: &SExprList, index: u32) -> Result<(), Error> {
        let mut idx = 1;
        if id_of(fl.get(idx)).is_some() {
            idx += 1;
        }
        idx = self.collect_inline_exports(fl, idx, ExportKind::Global, index)?;
        let ty = parse_global_type(
            fl.get(idx)
                .ok_or_else(|| form("expected a global type", fl.span))?,
        )?;
        idx += 1;
        let mut ctx = FuncCtx::default();
        let init = self.lower_body(&fl.items()[idx..], &mut ctx)?;

        if let Some(slot) = self.module.global_types.get_mut(index as usize) {
            *slot = ty;
        } else {
            return Err(Error::internal("global index space out of sync"));
        }
        self.module.globals.push(GlobalExpr {
            ty,
            init,
            span: fl.span,
        });
        Ok(())
    }

    /// Consumes inline `(export "name")` forms, registering each as an
    /// export of the given kind. Used by table, memory, and global
    /// definitions; functions inline the same loop to also record the names
    /// on their signature.
    fn collect_inline_exports(
        &mut self,
        fl: &SExprList,
        mut idx: usize,
        kind: ExportKind,
        index: u32,
    ) -> Result<usize, Error> {
        while let Some(item) = fl.get(idx) {
            if !item.is_list_headed_by(Keyword::Export) {
                break;
            }
            let el = expect_list(item)?;
            let name = self.name_string(el.get(1), el.span)?;
            self.module.exports.push(ExportExpr { name, kind, index });
            idx += 1;
        }
        Ok(idx)
    }

    fn lower_export(&mut self, fl: &SExprList) -> Result<(), Error> {
        let name = self.name_string(fl.get(1), fl.span)?;
        let desc = expect_list(
            fl.get(2)
                .ok_or_else(|| form("expected an export descriptor", fl.span))?,
        )?;
        let target = desc
            .get(1)
            .ok_or_else(|| form("expected an index or $name", desc.span))?;
        let (kind, index) = match desc.head_keyword() {
            Some(Keyword::Func) => (
                ExportKind::Func,
                self.resolve_index(&self.func_names, target, "function", None)?,
            ),
            Some(Keyword::Table) => (
                ExportKind::Table,
                self.resolve_index(&self.table_names, target, "table", None)?,
            ),
            Some(Keyword::Memory) => (
                ExportKind::Memory,
                self.resolve_index(&self.memory_names, target, "memory", None)?,
            ),
            Some(Keyword::Global) => (
                ExportKind::Global,
                self.resolve_index(&self.global_names, target, "global", None)?,
            ),
            _ => return Err(form("unknown export kind", desc.span)),
        };
        self.module.exports.push(ExportExpr { name, kind, index });
        Ok(())
    }

    fn lower_start(&mut self, fl: &SExprList) -> Result<(), Error> {
        let target = fl
            .get(1)
            .ok_or_else(|| form("expected a function index or $name", fl.span))?;
        let index = self.resolve_index(&self.func_names, target, "function", None)?;
        if self.module.start.is_some() {
            return Err(form("multiple start fields", fl.span));
        }
        self.module.start = Some(index);
        Ok(())
    }

    fn lower_elem(&mut self, fl: &SExprList) -> Result<(), Error> {
        let mut idx = 1;
        if id_of(fl.get(idx)).is_some() {
            idx += 1;
        }

        if fl.get(idx).and_then(SExpr::as_keyword) == Some(Keyword::Declare) {
            idx += 1;
            let funcs = self.elem_list(fl, idx)?;
            self.module.elems.push(ElemExpr {
                mode: ElemMode::Declarative,
                funcs,
            });
            return Ok(());
        }

        let mut table = 0u32;
        let mut has_table_use = false;
        if let Some(item) = fl.get(idx) {
            if item.is_list_headed_by(Keyword::Table) {
                let tl = expect_list(item)?;
                let target = tl
                    .get(1)
                    .ok_or_else(|| form("expected a table index or $name", tl.span))?;
                table = self.resolve_index(&self.table_names, target, "table", None)?;
                has_table_use = true;
                idx += 1;
            }
        }

        let offset = match fl.get(idx) {
            Some(item) if item.is_list_headed_by(Keyword::Offset) => {
                let ol = expect_list(item)?;
                idx += 1;
                Some(self.lower_const_expr(&ol.items()[1..])?)
            }
            Some(item) if is_offset_form(item) => {
                let offset = self.lower_const_expr(std::slice::from_ref(item))?;
                idx += 1;
                Some(offset)
            }
            _ => None,
        };

        let funcs = self.elem_list(fl, idx)?;
        let mode = match offset {
            Some(offset) => ElemMode::Active { table, offset },
            None if has_table_use => {
                return Err(form("element with a table use requires an offset", fl.span))
            }
            None => ElemMode::Passive,
        };
        self.module.elems.push(ElemExpr { mode, funcs });
        Ok(())
    }

    /// Parses the tail of an element segment into function indices. Accepts
    /// bare indices, the `func idx*` introducer, and `funcref` lists of
    /// `(ref.func ...)` / `(item (ref.func ...))` expressions.
    fn elem_list(&self, fl: &SExprList, mut idx: usize) -> Result<Vec<u32>, Error> {
        match fl.get(idx) {
            Some(item) if item.as_keyword() == Some(Keyword::Func) => idx += 1,
            Some(SExpr::Atom(t)) if t.kind == TokenKind::ValType(ValType::FuncRef) => idx += 1,
            Some(SExpr::Atom(t)) if t.kind == TokenKind::ValType(ValType::ExternRef) => {
                return Err(form("externref element segments are not supported", t.span))
            }
            _ => {}
        }

        let mut funcs = Vec::new();
        while let Some(item) = fl.get(idx) {
            match item {
                SExpr::Atom(_) => {
                    funcs.push(self.resolve_index(&self.func_names, item, "function", None)?)
                }
                SExpr::List(inner) => match inner.head_keyword() {
                    Some(Keyword::Item) => {
                        let target = inner
                            .get(1)
                            .ok_or_else(|| form("expected an element expression", inner.span))?;
                        funcs.push(self.ref_func_index(target)?);
                    }
                    _ => funcs.push(self.ref_func_index(item)?),
                },
            }
            idx += 1;
        }
        Ok(funcs)
    }

    fn ref_func_index(&self, item: &SExpr) -> Result<u32, Error> {
        let Some(inner) = item.as_list() else {
            return Err(form("unsupported element expression", item.span()));
        };
        if head_opcode(item).map(|info| info.name) != Some("ref.func") {
            return Err(form("unsupported element expression", inner.span));
        }
        let target = inner
            .get(1)
            .ok_or_else(|| form("expected a function index or $name", inner.span))?;
        self.resolve_index(&self.func_names, target, "function", None)
    }

    fn lower_data(&mut self, fl: &SExprList) -> Result<(), Error> {
        let mut idx = 1;
        if id_of(fl.get(idx)).is_some() {
            idx += 1;
        }

        let mut memory = 0u32;
        let mut has_memory_use = false;
        if let Some(item) = fl.get(idx) {
            if item.is_list_headed_by(Keyword::Memory) {
                let ml = expect_list(item)?;
                let target = ml
                    .get(1)
                    .ok_or_else(|| form("expected a memory index or $name", ml.span))?;
                memory = self.resolve_index(&self.memory_names, target, "memory", None)?;
                has_memory_use = true;
                idx += 1;
            }
        }

        let offset = match fl.get(idx) {
            Some(item) if item.is_list_headed_by(Keyword::Offset) => {
                let ol = expect_list(item)?;
                idx += 1;
                Some(self.lower_const_expr(&ol.items()[1..])?)
            }
            Some(item) if item.as_list().is_some() => {
                let offset = self.lower_const_expr(std::slice::from_ref(item))?;
                idx += 1;
                Some(offset)
            }
            _ => None,
        };

        let mut bytes = Vec::new();
        while let Some(item) = fl.get(idx) {
            match item.as_atom() {
                Some(Token {
                    kind: TokenKind::String(b),
                    ..
                }) => bytes.extend_from_slice(b),
                _ => return Err(form("expected a data string", item.span())),
            }
            idx += 1;
        }

        let mode = match offset {
            Some(offset) => DataMode::Active { memory, offset },
            None if has_memory_use => {
                return Err(form("data with a memory use requires an offset", fl.span))
            }
            None => DataMode::Passive,
        };
        self.module.datas.push(DataExpr { mode, bytes });
        Ok(())
    }

    fn lower_const_expr(&mut self, items: &[SExpr]) -> Result<Vec<Instr>, Error> {
        let mut ctx = FuncCtx::default();
        self.lower_body(items, &mut ctx)
    }

    // ------------------------------------------------------------------
    // Type uses and declarations
    // ------------------------------------------------------------------

    /// Parses a type use: any interleaving of one optional `(type ...)`
    /// reference and `(param ...)` / `(result ...)` subforms. Without an
    /// explicit reference, the inline signature is interned.
    fn parse_type_use(&mut self, items: &[SExpr], start: usize) -> Result<TypeUse, Error> {
        let mut params = Vec::new();
        let mut param_names = Vec::new();
        let mut results = Vec::new();
        let mut explicit = None;
        let mut idx = start;

        while let Some(item) = items.get(idx) {
            let Some(inner) = item.as_list() else { break };
            match inner.head_keyword() {
                Some(Keyword::Type) => {
                    let target = inner
                        .get(1)
                        .ok_or_else(|| form("expected a type index or $name", inner.span))?;
                    let index = self.resolve_index(&self.type_names, target, "type", None)?;
                    if self.module.types.get(index).is_none() {
                        return Err(form("type index out of range", target.span()));
                    }
                    explicit = Some(index);
                    idx += 1;
                }
                Some(Keyword::Param) => {
                    self.collect_decls(inner, "parameter", &mut params, &mut param_names)?;
                    idx += 1;
                }
                Some(Keyword::Result) => {
                    collect_results(inner, &mut results)?;
                    idx += 1;
                }
                _ => break,
            }
        }

        match explicit {
            Some(type_index) => {
                let signature = self
                    .module
                    .types
                    .get(type_index)
                    .cloned()
                    .ok_or_else(|| Error::internal("type table lost an interned entry"))?;
                // Inline names only apply when they line up with the
                // referenced signature.
                if param_names.len() != signature.params.len() {
                    param_names = vec![None; signature.params.len()];
                }
                Ok(TypeUse {
                    type_index,
                    signature,
                    param_names,
                    next: idx,
                })
            }
            None => {
                let signature = Signature { params, results };
                let type_index = self.module.types.intern(signature.clone());
                Ok(TypeUse {
                    type_index,
                    signature,
                    param_names,
                    next: idx,
                })
            }
        }
    }

    /// Parses one `(param ...)` / `(local ...)` subform. The named form
    /// declares exactly one slot; the anonymous form any number.
    fn collect_decls(
        &self,
        inner: &SExprList,
        what: &str,
        types: &mut Vec<ValType>,
        names: &mut Vec<Option<String>>,
    ) -> Result<(), Error> {
        if let Some((name, _)) = id_of(inner.get(1)) {
            let ty_item = inner
                .get(2)
                .ok_or_else(|| form(format!("expected a value type after the {what} name"), inner.span))?;
            if inner.get(3).is_some() {
                return Err(form(
                    format!("a named {what} takes exactly one type"),
                    inner.span,
                ));
            }
            types.push(valtype_of(ty_item)?);
            names.push(Some(name.to_string()));
        } else {
            for item in &inner.items()[1..] {
                types.push(valtype_of(item)?);
                names.push(None);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bodies
    // ------------------------------------------------------------------

    fn lower_body(&mut self, items: &[SExpr], ctx: &mut FuncCtx) -> Result<Vec<Instr>, Error> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < items.len() {
            idx = self.lower_body_item(items, idx, &mut out, ctx)?;
        }
        Ok(out)
    }

    /// Lowers one body item, which may consume trailing siblings (stack-form
    /// immediates, or a whole `block ... end` run). Returns the index after
    /// everything consumed.
    fn lower_body_item(
        &mut self,
        items: &[SExpr],
        idx: usize,
        out: &mut Vec<Instr>,
        ctx: &mut FuncCtx,
    ) -> Result<usize, Error> {
        match &items[idx] {
            SExpr::Atom(token) => match &token.kind {
                TokenKind::Keyword(Keyword::Block | Keyword::Loop | Keyword::If) => {
                    let (block, next) = self.lower_flat_block(items, idx, ctx)?;
                    out.push(Instr::Block(block));
                    Ok(next)
                }
                TokenKind::Opcode(info) => {
                    let (immediates, consumed) =
                        self.lower_immediates(info, items, idx + 1, token.span, ctx)?;
                    if immediates.is_empty() {
                        out.push(Instr::Token(token.clone()));
                    } else {
                        out.push(Instr::Op(OpExpr {
                            operator: token.clone(),
                            immediates,
                            operands: Vec::new(),
                        }));
                    }
                    Ok(idx + 1 + consumed)
                }
                _ => Err(form(
                    format!("expected an instruction, found `{}`", token.text),
                    token.span,
                )),
            },
            SExpr::List(list) => {
                match list.head_keyword() {
                    Some(Keyword::Block | Keyword::Loop) => {
                        let block = self.lower_folded_block(list, ctx)?;
                        out.push(Instr::Block(block));
                    }
                    Some(Keyword::If) => self.lower_folded_if(list, out, ctx)?,
                    _ if head_opcode(&items[idx]).is_some() => {
                        let instr = self.lower_folded_op(list, ctx)?;
                        out.push(instr);
                    }
                    _ => return Err(form("expected an instruction form", list.span)),
                }
                Ok(idx + 1)
            }
        }
    }

    fn lower_folded_op(&mut self, list: &SExprList, ctx: &mut FuncCtx) -> Result<Instr, Error> {
        let operator = match list.items().first().and_then(SExpr::as_atom) {
            Some(token) => token.clone(),
            None => return Err(Error::internal("folded operation lost its operator")),
        };
        let info = match &operator.kind {
            TokenKind::Opcode(info) => *info,
            _ => return Err(Error::internal("folded operation head is not an opcode")),
        };

        let (immediates, consumed) =
            self.lower_immediates(info, list.items(), 1, operator.span, ctx)?;

        let mut operands = Vec::new();
        for item in &list.items()[1 + consumed..] {
            if item.as_list().is_none() {
                return Err(form("expected a folded operand", item.span()));
            }
            let lowered = self.lower_body(std::slice::from_ref(item), ctx)?;
            operands.extend(lowered);
        }

        if immediates.is_empty() && operands.is_empty() {
            Ok(Instr::Token(operator))
        } else {
            Ok(Instr::Op(OpExpr {
                operator,
                immediates,
                operands,
            }))
        }
    }

    fn lower_folded_block(
        &mut self,
        list: &SExprList,
        ctx: &mut FuncCtx,
    ) -> Result<BlockExpr, Error> {
        let kind = if list.head_keyword() == Some(Keyword::Loop) {
            BlockKind::Loop
        } else {
            BlockKind::Block
        };
        let mut idx = 1;
        let label = id_of(list.get(idx)).map(|(n, _)| n.to_string());
        if label.is_some() {
            idx += 1;
        }
        let (sig, type_index, next) = self.parse_block_type(list.items(), idx)?;
        idx = next;

        ctx.labels.push(label.clone());
        let body = self.lower_body(&list.items()[idx..], ctx);
        ctx.labels.pop();

        Ok(BlockExpr {
            kind,
            label,
            sig,
            type_index,
            body: body?,
            else_body: None,
            span: list.span,
        })
    }

    /// A folded `if`: condition operands come first and are emitted before
    /// the block itself, then the `(then ...)` arm and the optional
    /// `(else ...)` arm.
    fn lower_folded_if(
        &mut self,
        list: &SExprList,
        out: &mut Vec<Instr>,
        ctx: &mut FuncCtx,
    ) -> Result<(), Error> {
        let mut idx = 1;
        let label = id_of(list.get(idx)).map(|(n, _)| n.to_string());
        if label.is_some() {
            idx += 1;
        }
        let (sig, type_index, next) = self.parse_block_type(list.items(), idx)?;
        idx = next;

        // The label is not in scope for the condition.
        while let Some(item) = list.get(idx) {
            if item.is_list_headed_by(Keyword::Then) {
                break;
            }
            idx = self.lower_body_item(list.items(), idx, out, ctx)?;
        }

        let then_list = match list.get(idx) {
            Some(item) if item.is_list_headed_by(Keyword::Then) => expect_list(item)?,
            _ => return Err(form("`if` requires a `then` form", list.span)),
        };

        ctx.labels.push(label.clone());
        let body = self.lower_body(&then_list.items()[1..], ctx);
        let else_body = match list.get(idx + 1) {
            Some(item) if item.is_list_headed_by(Keyword::Else) => {
                let el = match expect_list(item) {
                    Ok(el) => el,
                    Err(e) => {
                        ctx.labels.pop();
                        return Err(e);
                    }
                };
                idx += 1;
                self.lower_body(&el.items()[1..], ctx)
            }
            _ => Ok(Vec::new()),
        };
        ctx.labels.pop();

        if list.get(idx + 1).is_some() {
            return Err(form("unexpected item after `if`", list.span));
        }

        out.push(Instr::Block(BlockExpr {
            kind: BlockKind::If,
            label,
            sig,
            type_index,
            body: body?,
            else_body: Some(else_body?),
            span: list.span,
        }));
        Ok(())
    }

    /// Groups a bare stack-form `block`/`loop`/`if` ... `end` run from the
    /// flat instruction stream into a structured block.
    fn lower_flat_block(
        &mut self,
        items: &[SExpr],
        idx: usize,
        ctx: &mut FuncCtx,
    ) -> Result<(BlockExpr, usize), Error> {
        let header = match items[idx].as_atom() {
            Some(token) => token.clone(),
            None => return Err(Error::internal("flat block lost its header")),
        };
        let kind = match header.kind {
            TokenKind::Keyword(Keyword::Block) => BlockKind::Block,
            TokenKind::Keyword(Keyword::Loop) => BlockKind::Loop,
            TokenKind::Keyword(Keyword::If) => BlockKind::If,
            _ => return Err(Error::internal("flat block header is not a block keyword")),
        };

        let mut i = idx + 1;
        let label = id_of(items.get(i)).map(|(n, _)| n.to_string());
        if label.is_some() {
            i += 1;
        }
        let (sig, type_index, next) = self.parse_block_type(items, i)?;
        i = next;

        ctx.labels.push(label.clone());
        let mut body = Vec::new();
        let mut else_body: Option<Vec<Instr>> = None;
        let outcome = loop {
            match items.get(i) {
                None => break Err(form("unterminated block: missing `end`", header.span)),
                Some(SExpr::Atom(t)) if t.kind == TokenKind::Keyword(Keyword::End) => {
                    i += 1;
                    break Ok(());
                }
                Some(SExpr::Atom(t)) if t.kind == TokenKind::Keyword(Keyword::Else) => {
                    if kind != BlockKind::If || else_body.is_some() {
                        break Err(form("unexpected `else`", t.span));
                    }
                    else_body = Some(Vec::new());
                    i += 1;
                }
                Some(_) => {
                    let target = match else_body.as_mut() {
                        Some(arm) => arm,
                        None => &mut body,
                    };
                    match self.lower_body_item(items, i, target, ctx) {
                        Ok(n) => i = n,
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        ctx.labels.pop();
        outcome?;

        if kind == BlockKind::If && else_body.is_none() {
            else_body = Some(Vec::new());
        }
        Ok((
            BlockExpr {
                kind,
                label,
                sig,
                type_index,
                body,
                else_body,
                span: header.span,
            },
            i,
        ))
    }

    /// Parses a block's type annotation: `(param ...)* (result ...)*`.
    /// Signatures that have no shorthand encoding are interned.
    fn parse_block_type(
        &mut self,
        items: &[SExpr],
        mut idx: usize,
    ) -> Result<(Signature, Option<u32>, usize), Error> {
        let mut params = Vec::new();
        let mut names = Vec::new();
        let mut results = Vec::new();
        while let Some(item) = items.get(idx) {
            let Some(inner) = item.as_list() else { break };
            match inner.head_keyword() {
                Some(Keyword::Param) => {
                    self.collect_decls(inner, "parameter", &mut params, &mut names)?
                }
                Some(Keyword::Result) => collect_results(inner, &mut results)?,
                _ => break,
            }
            idx += 1;
        }
        let sig = Signature { params, results };
        let type_index = if sig.params.is_empty() && sig.results.len() <= 1 {
            None
        } else {
            Some(self.module.types.intern(sig.clone()))
        };
        Ok((sig, type_index, idx))
    }

    // ------------------------------------------------------------------
    // Immediates
    // ------------------------------------------------------------------

    /// Collects and resolves an instruction's immediate operands from the
    /// items following it (siblings in stack form, leading children in
    /// folded form). Returns the resolved tokens and how many items were
    /// consumed.
    fn lower_immediates(
        &self,
        info: &OpcodeInfo,
        items: &[SExpr],
        start: usize,
        at: Span,
        ctx: &FuncCtx,
    ) -> Result<(Vec<Token>, usize), Error> {
        match info.imm {
            Imm::None => Ok((Vec::new(), 0)),
            Imm::LocalIdx => {
                let item = need(items, start, "expected a local index", at)?;
                Ok((vec![self.local_index_token(item, ctx)?], 1))
            }
            Imm::GlobalIdx => {
                let item = need(items, start, "expected a global index", at)?;
                let token =
                    self.module_index_token(&self.global_names, item, "global", ctx)?;
                Ok((vec![token], 1))
            }
            Imm::FuncIdx => {
                let item = need(items, start, "expected a function index", at)?;
                let token = self.module_index_token(&self.func_names, item, "function", ctx)?;
                Ok((vec![token], 1))
            }
            Imm::LabelIdx => {
                let item = need(items, start, "expected a label", at)?;
                Ok((vec![self.label_index_token(item, ctx)?], 1))
            }
            Imm::LabelTable => {
                let mut tokens = Vec::new();
                let mut idx = start;
                while let Some(item) = items.get(idx) {
                    if !is_index_atom(item) {
                        break;
                    }
                    tokens.push(self.label_index_token(item, ctx)?);
                    idx += 1;
                }
                if tokens.is_empty() {
                    return Err(form("br_table requires at least one label", at));
                }
                Ok((tokens, idx - start))
            }
            Imm::I32 => {
                let token = integer_imm(items, start, at)?;
                if let TokenKind::Integer(n) = &token.kind {
                    if n.to_i32().is_none() {
                        return Err(form("i32 constant out of range", token.span));
                    }
                }
                Ok((vec![token], 1))
            }
            Imm::I64 => {
                let token = integer_imm(items, start, at)?;
                if let TokenKind::Integer(n) = &token.kind {
                    if n.to_i64().is_none() {
                        return Err(form("i64 constant out of range", token.span));
                    }
                }
                Ok((vec![token], 1))
            }
            Imm::F32 | Imm::F64 => {
                let item = need(items, start, "expected a float constant", at)?;
                match item.as_atom() {
                    Some(token)
                        if matches!(token.kind, TokenKind::Integer(_) | TokenKind::Float(_)) =>
                    {
                        Ok((vec![token.clone()], 1))
                    }
                    _ => Err(form("expected a float constant", item.span())),
                }
            }
            Imm::Mem { .. } => {
                let mut tokens = Vec::new();
                let mut idx = start;
                while let Some(item) = items.get(idx) {
                    match item.as_atom().map(|t| &t.kind) {
                        Some(TokenKind::MemOffset(_)) => {}
                        Some(TokenKind::MemAlign(a)) => {
                            if !a.is_power_of_two() {
                                return Err(form(
                                    "alignment must be a power of two",
                                    item.span(),
                                ));
                            }
                        }
                        _ => break,
                    }
                    if let Some(token) = item.as_atom() {
                        tokens.push(token.clone());
                    }
                    idx += 1;
                }
                Ok((tokens, idx - start))
            }
            Imm::RefType => {
                let item = need(items, start, "expected `func` or `extern`", at)?;
                match item.as_keyword() {
                    Some(Keyword::Func | Keyword::Extern) => {
                        match item.as_atom() {
                            Some(token) => Ok((vec![token.clone()], 1)),
                            None => Err(Error::internal("keyword atom vanished")),
                        }
                    }
                    _ => Err(form("expected `func` or `extern`", item.span())),
                }
            }
            Imm::TypeIdx => match items.get(start) {
                Some(item) if item.is_list_headed_by(Keyword::Type) => {
                    let tl = expect_list(item)?;
                    let target = tl
                        .get(1)
                        .ok_or_else(|| form("expected a type index or $name", tl.span))?;
                    let index = self.resolve_index(&self.type_names, target, "type", None)?;
                    if self.module.types.get(index).is_none() {
                        return Err(form("type index out of range", target.span()));
                    }
                    let base = target
                        .as_atom()
                        .cloned()
                        .unwrap_or_else(|| Token::new(TokenKind::LParen, "(", tl.span));
                    Ok((vec![index_token(&base, index)], 1))
                }
                Some(item) if is_index_atom(item) => {
                    let index = self.resolve_index(&self.type_names, item, "type", None)?;
                    if self.module.types.get(index).is_none() {
                        return Err(form("type index out of range", item.span()));
                    }
                    let base = match item.as_atom() {
                        Some(token) => token.clone(),
                        None => return Err(Error::internal("index atom vanished")),
                    };
                    Ok((vec![index_token(&base, index)], 1))
                }
                _ => Err(form("call_indirect requires a type use", at)),
            },
        }
    }

    fn local_index_token(&self, item: &SExpr, ctx: &FuncCtx) -> Result<Token, Error> {
        let token = item
            .as_atom()
            .ok_or_else(|| form("expected a local index", item.span()))?;
        match &token.kind {
            TokenKind::Integer(n) => {
                if n.to_u32().is_none() {
                    return Err(form("local index out of range", token.span));
                }
                Ok(token.clone())
            }
            TokenKind::Id(name) => {
                // Smallest slot index whose name matches.
                let position = ctx
                    .slot_names
                    .iter()
                    .position(|slot| slot.as_deref() == Some(name.as_str()));
                match position {
                    Some(index) => Ok(index_token(token, index as u32)),
                    None => Err(Error::Name(NameError {
                        function: ctx.func_name.clone(),
                        name: name.clone(),
                        span: token.span,
                    })),
                }
            }
            _ => Err(form("expected a local index", token.span)),
        }
    }

    fn label_index_token(&self, item: &SExpr, ctx: &FuncCtx) -> Result<Token, Error> {
        let token = item
            .as_atom()
            .ok_or_else(|| form("expected a label", item.span()))?;
        match &token.kind {
            TokenKind::Integer(n) => {
                if n.to_u32().is_none() {
                    return Err(form("label depth out of range", token.span));
                }
                Ok(token.clone())
            }
            TokenKind::Id(name) => {
                // Depth 0 is the innermost enclosing block.
                for (depth, label) in ctx.labels.iter().rev().enumerate() {
                    if label.as_deref() == Some(name.as_str()) {
                        return Ok(index_token(token, depth as u32));
                    }
                }
                Err(Error::Name(NameError {
                    function: ctx.func_name.clone(),
                    name: name.clone(),
                    span: token.span,
                }))
            }
            _ => Err(form("expected a label", token.span)),
        }
    }

    fn module_index_token(
        &self,
        map: &HashMap<String, u32>,
        item: &SExpr,
        what: &str,
        ctx: &FuncCtx,
    ) -> Result<Token, Error> {
        let index = self.resolve_index(map, item, what, ctx.func_name.as_deref())?;
        let token = match item.as_atom() {
            Some(token) => token,
            None => return Err(Error::internal("index atom vanished")),
        };
        Ok(index_token(token, index))
    }

    /// Resolves a numeric-or-symbolic reference. Numeric immediates bypass
    /// lookup and are used as-is.
    fn resolve_index(
        &self,
        map: &HashMap<String, u32>,
        target: &SExpr,
        what: &str,
        function: Option<&str>,
    ) -> Result<u32, Error> {
        let token = target
            .as_atom()
            .ok_or_else(|| form(format!("expected a {what} index or $name"), target.span()))?;
        match &token.kind {
            TokenKind::Integer(n) => n
                .to_u32()
                .ok_or_else(|| form(format!("{what} index out of range"), token.span)),
            TokenKind::Id(name) => map.get(name).copied().ok_or_else(|| {
                Error::Name(NameError {
                    function: function.map(str::to_string),
                    name: name.clone(),
                    span: token.span,
                })
            }),
            _ => Err(form(
                format!("expected a {what} index or $name"),
                token.span,
            )),
        }
    }

    fn name_string(&self, item: Option<&SExpr>, at: Span) -> Result<String, Error> {
        let item = item.ok_or_else(|| form("expected a name string", at))?;
        match item.as_atom() {
            Some(Token {
                kind: TokenKind::String(bytes),
                span,
                ..
            }) => String::from_utf8(bytes.clone())
                .map_err(|_| form("name must be valid UTF-8", *span)),
            _ => Err(form("expected a name string", item.span())),
        }
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

fn form(message: impl Into<String>, span: Span) -> Error {
    Error::Form(FormError {
        message: message.into(),
        span,
    })
}

fn expect_list(sexpr: &SExpr) -> Result<&SExprList, Error> {
    sexpr
        .as_list()
        .ok_or_else(|| form("expected a parenthesized form", sexpr.span()))
}

fn id_of(item: Option<&SExpr>) -> Option<(&str, Span)> {
    let item = item?;
    item.as_id().map(|name| (name, item.span()))
}

fn head_opcode(item: &SExpr) -> Option<&'static OpcodeInfo> {
    match item.as_list()?.items().first()?.as_atom()?.kind {
        TokenKind::Opcode(info) => Some(info),
        _ => None,
    }
}

fn is_index_atom(item: &SExpr) -> bool {
    matches!(
        item.as_atom().map(|t| &t.kind),
        Some(TokenKind::Integer(_) | TokenKind::Id(_))
    )
}

/// An abbreviated element offset: a folded constant expression that is not
/// itself an element expression.
fn is_offset_form(item: &SExpr) -> bool {
    match head_opcode(item) {
        Some(info) => info.name != "ref.func" && info.name != "ref.null",
        None => false,
    }
}

fn import_kind(fl: &SExprList) -> Result<Keyword, Error> {
    fl.get(3)
        .and_then(SExpr::as_list)
        .and_then(SExprList::head_keyword)
        .ok_or_else(|| form("expected an import descriptor", fl.span))
}

fn need<'a>(items: &'a [SExpr], idx: usize, message: &str, at: Span) -> Result<&'a SExpr, Error> {
    items.get(idx).ok_or_else(|| form(message, at))
}

fn integer_imm(items: &[SExpr], start: usize, at: Span) -> Result<Token, Error> {
    let item = need(items, start, "expected an integer constant", at)?;
    match item.as_atom() {
        Some(token) if matches!(token.kind, TokenKind::Integer(_)) => Ok(token.clone()),
        _ => Err(form("expected an integer constant", item.span())),
    }
}

/// A resolved index immediate: keeps the source lexeme and span, carries the
/// numeric index in its kind.
fn index_token(base: &Token, index: u32) -> Token {
    Token::new(
        TokenKind::Integer(Integer {
            negative: false,
            value: index as u64,
        }),
        base.text.clone(),
        base.span,
    )
}

fn valtype_of(item: &SExpr) -> Result<ValType, Error> {
    match item.as_atom() {
        Some(Token {
            kind: TokenKind::ValType(vt),
            ..
        }) => Ok(*vt),
        _ => Err(form("expected a value type", item.span())),
    }
}

fn ref_type_of(item: Option<&SExpr>, at: Span) -> Result<ValType, Error> {
    let item = item.ok_or_else(|| form("expected a reference type", at))?;
    let vt = valtype_of(item)?;
    if !vt.is_ref() {
        return Err(form("expected a reference type", item.span()));
    }
    Ok(vt)
}

fn collect_results(inner: &SExprList, results: &mut Vec<ValType>) -> Result<(), Error> {
    for item in &inner.items()[1..] {
        results.push(valtype_of(item)?);
    }
    Ok(())
}

fn parse_limits(items: &[SExpr], idx: usize, at: Span) -> Result<(Limits, usize), Error> {
    let min_item = need(items, idx, "expected a limits minimum", at)?;
    let min = limit_value(min_item)?;
    match items.get(idx + 1).map(limit_value) {
        Some(Ok(max)) => Ok((
            Limits {
                min,
                max: Some(max),
            },
            2,
        )),
        _ => Ok((Limits { min, max: None }, 1)),
    }
}

fn limit_value(item: &SExpr) -> Result<u32, Error> {
    match item.as_atom() {
        Some(Token {
            kind: TokenKind::Integer(n),
            span,
            ..
        }) => n
            .to_u32()
            .ok_or_else(|| form("limit out of range", *span)),
        _ => Err(form("expected a limit", item.span())),
    }
}

fn parse_global_type(item: &SExpr) -> Result<GlobalType, Error> {
    if let Some(inner) = item.as_list() {
        if inner.head_keyword() != Some(Keyword::Mut) {
            return Err(form("expected a global type", inner.span));
        }
        let ty_item = inner
            .get(1)
            .ok_or_else(|| form("expected a value type in `mut`", inner.span))?;
        Ok(GlobalType {
            ty: valtype_of(ty_item)?,
            mutable: true,
        })
    } else {
        Ok(GlobalType {
            ty: valtype_of(item)?,
            mutable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::unfold;
    use crate::{lexer, sexpr};
    use pretty_assertions::assert_eq;

    fn lower_src(src: &str) -> Result<ModuleExpr, Error> {
        lower(&sexpr::build(lexer::lex(src).unwrap()).unwrap())
    }

    fn module(src: &str) -> ModuleExpr {
        lower_src(src).unwrap()
    }

    fn sig(params: &[ValType], results: &[ValType]) -> Signature {
        Signature {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    fn unfold_texts(body: &[Instr]) -> Vec<String> {
        unfold(body).iter().map(|t| t.text.clone()).collect()
    }

    fn unfold_values(body: &[Instr]) -> Vec<Option<u64>> {
        unfold(body)
            .iter()
            .map(|t| match t.kind {
                TokenKind::Integer(n) => Some(n.value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_function() {
        let m = module("(module (func nop))");
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types.get(0), Some(&sig(&[], &[])));
        assert_eq!(m.funcs.len(), 1);
        assert_eq!(m.func_types, vec![0]);
        assert!(m.exports.is_empty());
        assert_eq!(unfold_texts(&m.funcs[0].body), ["nop"]);
    }

    #[test]
    fn signature_dedup_across_functions() {
        let m = module(
            "(module
               (func (param i32) (result i32) local.get 0)
               (func (param i32) (result i32) i32.const 1)
               (func (result f64) f64.const 0))",
        );
        assert_eq!(m.types.len(), 2);
        assert_eq!(m.func_types, vec![0, 0, 1]);
    }

    #[test]
    fn type_fields_and_type_use() {
        let m = module(
            "(module
               (type $binop (func (param i32 i32) (result i32)))
               (func (type $binop) local.get 0 local.get 1 i32.add)
               (func (param i32 i32) (result i32) local.get 0))",
        );
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.func_types, vec![0, 0]);
        assert_eq!(m.funcs[0].sig.signature, sig(&[ValType::I32, ValType::I32], &[ValType::I32]));
    }

    #[test]
    fn params_split_and_named() {
        let m = module("(module (func (param $a f64) (param $b f64) (param i32 i32)))");
        let f = &m.funcs[0].sig;
        assert_eq!(
            f.signature.params,
            [ValType::F64, ValType::F64, ValType::I32, ValType::I32]
        );
        assert_eq!(
            f.param_names,
            [Some("a".to_string()), Some("b".to_string()), None, None]
        );
    }

    #[test]
    fn named_param_with_two_types_fails() {
        assert!(matches!(
            lower_src("(module (func (param $a i32 i32)))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn locals_resolve_after_params() {
        let m = module(
            "(module (func (param $p i32) (local $a i64) (local $b f32)
               local.get $p local.get $a local.get $b))",
        );
        assert_eq!(
            unfold_values(&m.funcs[0].body),
            [None, Some(0), None, Some(1), None, Some(2)]
        );
        assert_eq!(m.funcs[0].sig.locals, [ValType::I64, ValType::F32]);
    }

    #[test]
    fn missing_local_name_fails() {
        let err = lower_src("(module (func $f local.get $missing))").unwrap_err();
        match err {
            Error::Name(e) => {
                assert_eq!(e.name, "missing");
                assert_eq!(e.function.as_deref(), Some("f"));
            }
            other => panic!("expected a name error, got {other:?}"),
        }
    }

    #[test]
    fn folded_body_unfolds_to_stack_form() {
        let m = module(
            "(module (func (param $a f64) (param $b f64) (result f64)
               (f64.add (local.get $a) (local.get $b))))",
        );
        assert_eq!(
            unfold_texts(&m.funcs[0].body),
            ["local.get", "$a", "local.get", "$b", "f64.add"]
        );
        assert_eq!(
            unfold_values(&m.funcs[0].body),
            [None, Some(0), None, Some(1), None]
        );
    }

    #[test]
    fn inline_export_synthesized() {
        let m = module(r#"(module (func (export "fn") (param) (result)))"#);
        assert_eq!(
            m.exports,
            vec![ExportExpr {
                name: "fn".into(),
                kind: ExportKind::Func,
                index: 0,
            }]
        );
        assert_eq!(m.funcs[0].sig.export_names, ["fn"]);
        assert_eq!(m.types.len(), 1);
        assert_eq!(m.types.get(0), Some(&sig(&[], &[])));
    }

    #[test]
    fn export_field_resolves_forward() {
        let m = module(
            r#"(module
                 (export "x" (func $b))
                 (func $a)
                 (func $b))"#,
        );
        assert_eq!(m.exports[0].index, 1);
    }

    #[test]
    fn export_kinds() {
        let m = module(
            r#"(module
                 (func $f)
                 (table $t 1 funcref)
                 (memory $m 1)
                 (global $g i32 (i32.const 0))
                 (export "f" (func $f))
                 (export "t" (table $t))
                 (export "m" (memory $m))
                 (export "g" (global $g)))"#,
        );
        let kinds: Vec<_> = m.exports.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                ExportKind::Func,
                ExportKind::Table,
                ExportKind::Memory,
                ExportKind::Global
            ]
        );
    }

    #[test]
    fn block_with_label() {
        let m = module("(module (func (block $L nop)))");
        let body = &m.funcs[0].body;
        assert_eq!(body.len(), 1);
        match &body[0] {
            Instr::Block(b) => {
                assert_eq!(b.kind, BlockKind::Block);
                assert_eq!(b.label.as_deref(), Some("L"));
                assert_eq!(b.sig, Signature::default());
                assert_eq!(b.type_index, None);
            }
            other => panic!("expected a block, got {other:?}"),
        }
        assert_eq!(unfold_texts(body), ["block", "nop", "end"]);
    }

    #[test]
    fn branch_resolves_to_depth() {
        let m = module(
            "(module (func
               (block $outer
                 (block $inner
                   (br $outer)
                   (br $inner)))))",
        );
        assert_eq!(
            unfold_values(&m.funcs[0].body),
            [None, None, None, Some(1), None, Some(0), None, None]
        );
    }

    #[test]
    fn flat_blocks_are_grouped() {
        let m = module(
            "(module (func (result i32)
               block $l (result i32)
                 i32.const 1
                 br 0
               end))",
        );
        let body = &m.funcs[0].body;
        assert_eq!(body.len(), 1);
        match &body[0] {
            Instr::Block(b) => {
                assert_eq!(b.label.as_deref(), Some("l"));
                assert_eq!(b.sig.results, [ValType::I32]);
                assert_eq!(b.body.len(), 2);
            }
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn flat_if_else_grouping() {
        let m = module(
            "(module (func (param i32) (result i32)
               local.get 0
               if (result i32)
                 i32.const 1
               else
                 i32.const 2
               end))",
        );
        let body = &m.funcs[0].body;
        assert_eq!(body.len(), 2);
        match &body[1] {
            Instr::Block(b) => {
                assert_eq!(b.kind, BlockKind::If);
                assert_eq!(b.body.len(), 1);
                assert_eq!(b.else_body.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected an if block, got {other:?}"),
        }
    }

    #[test]
    fn folded_if_condition_precedes_block() {
        let m = module(
            "(module (func (param i32) (result i32)
               (if (result i32) (local.get 0)
                 (then (i32.const 1))
                 (else (i32.const 0)))))",
        );
        let texts = unfold_texts(&m.funcs[0].body);
        assert_eq!(
            texts,
            ["local.get", "0", "if", "i32.const", "1", "else", "i32.const", "0", "end"]
        );
    }

    #[test]
    fn if_without_else_gets_empty_branch() {
        let m = module("(module (func (param i32) local.get 0 (if (then nop))))");
        match &m.funcs[0].body[1] {
            Instr::Block(b) => assert_eq!(b.else_body.as_ref().map(Vec::len), Some(0)),
            other => panic!("expected an if block, got {other:?}"),
        }
    }

    #[test]
    fn multi_result_block_interns_its_signature() {
        let m = module(
            "(module (func (result i32 i32)
               (block (result i32 i32) i32.const 1 i32.const 2)))",
        );
        match &m.funcs[0].body[0] {
            Instr::Block(b) => {
                let index = b.type_index.expect("multi-result block needs a type index");
                assert_eq!(
                    m.types.get(index),
                    Some(&sig(&[], &[ValType::I32, ValType::I32]))
                );
            }
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn call_and_forward_reference() {
        let m = module(
            "(module
               (func $main (result i32) (call $later))
               (func $later (result i32) i32.const 7))",
        );
        assert_eq!(unfold_values(&m.funcs[0].body), [None, Some(1)]);
    }

    #[test]
    fn imports_shift_the_index_space() {
        let m = module(
            r#"(module
                 (import "env" "log" (func $log (param i32)))
                 (func $main (call $log (i32.const 1))))"#,
        );
        assert_eq!(m.imports.len(), 1);
        assert_eq!(m.func_types.len(), 2);
        // $main is function 1; its call targets import 0.
        assert_eq!(unfold_values(&m.funcs[0].body), [None, Some(1), None, Some(0)]);
    }

    #[test]
    fn import_kinds() {
        let m = module(
            r#"(module
                 (import "e" "t" (table 1 2 funcref))
                 (import "e" "m" (memory 1))
                 (import "e" "g" (global $g (mut i32)))
                 (func (global.get $g) drop))"#,
        );
        assert_eq!(m.imports.len(), 3);
        assert!(matches!(m.imports[0].desc, ImportDesc::Table(_)));
        assert!(matches!(m.imports[1].desc, ImportDesc::Memory(_)));
        assert!(matches!(
            m.imports[2].desc,
            ImportDesc::Global(GlobalType {
                ty: ValType::I32,
                mutable: true,
            })
        ));
        assert_eq!(m.global_types.len(), 1);
    }

    #[test]
    fn global_definition_and_access() {
        let m = module(
            "(module
               (global $g (mut i32) (i32.const 42))
               (func (result i32) global.get $g))",
        );
        assert_eq!(m.globals.len(), 1);
        assert!(m.globals[0].ty.mutable);
        assert_eq!(unfold_values(&m.funcs[0].body), [None, Some(0)]);
    }

    #[test]
    fn elem_and_table() {
        let m = module(
            "(module
               (table 2 funcref)
               (func $f1)
               (func $f2)
               (elem (i32.const 0) $f1 $f2))",
        );
        assert_eq!(m.tables.len(), 1);
        assert_eq!(m.elems.len(), 1);
        assert!(matches!(
            m.elems[0].mode,
            ElemMode::Active { table: 0, .. }
        ));
        assert_eq!(m.elems[0].funcs, [0, 1]);
    }

    #[test]
    fn elem_variants() {
        let m = module(
            "(module
               (table $t 2 funcref)
               (func $f)
               (elem (table $t) (offset (i32.const 0)) func $f)
               (elem funcref (ref.func $f))
               (elem declare func $f))",
        );
        assert_eq!(m.elems.len(), 3);
        assert!(matches!(m.elems[0].mode, ElemMode::Active { .. }));
        assert!(matches!(m.elems[1].mode, ElemMode::Passive));
        assert!(matches!(m.elems[2].mode, ElemMode::Declarative));
        assert_eq!(m.elems[1].funcs, [0]);
    }

    #[test]
    fn data_segments() {
        let m = module(
            r#"(module
                 (memory 1)
                 (data (i32.const 8) "he" "llo")
                 (data "passive"))"#,
        );
        assert_eq!(m.datas.len(), 2);
        assert!(matches!(m.datas[0].mode, DataMode::Active { memory: 0, .. }));
        assert_eq!(m.datas[0].bytes, b"hello");
        assert!(matches!(m.datas[1].mode, DataMode::Passive));
        assert_eq!(m.datas[1].bytes, b"passive");
    }

    #[test]
    fn start_field() {
        let m = module("(module (func $main) (start $main))");
        assert_eq!(m.start, Some(0));
        assert!(matches!(
            lower_src("(module (func $a) (start $a) (start $a))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn memory_instructions() {
        let m = module(
            "(module
               (memory 1)
               (func (param i32) (result i32)
                 local.get 0
                 i32.load offset=4 align=2))",
        );
        let texts = unfold_texts(&m.funcs[0].body);
        assert_eq!(texts, ["local.get", "0", "i32.load", "offset=4", "align=2"]);
    }

    #[test]
    fn bad_alignment_fails() {
        assert!(matches!(
            lower_src("(module (memory 1) (func (param i32) local.get 0 i32.load align=3 drop))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn call_indirect_type_use() {
        let m = module(
            "(module
               (type $t (func (result i32)))
               (table 1 funcref)
               (func (param i32) (result i32)
                 (call_indirect (type $t) (local.get 0))))",
        );
        assert_eq!(unfold_values(&m.funcs[0].body), [None, Some(0), None, Some(0)]);
    }

    #[test]
    fn duplicate_names_fail() {
        assert!(matches!(
            lower_src("(module (func $f) (func $f))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn missing_function_name_fails() {
        assert!(matches!(
            lower_src(r#"(module (export "x" (func $nope)))"#),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn missing_label_fails() {
        assert!(matches!(
            lower_src("(module (func (block (br $nope))))"),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn stray_instruction_atom_fails() {
        assert!(matches!(
            lower_src("(module (func 42))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn unterminated_flat_block_fails() {
        assert!(matches!(
            lower_src("(module (func block nop))"),
            Err(Error::Form(_))
        ));
    }

    #[test]
    fn wrong_head_keyword_fails() {
        assert!(matches!(lower_src("(func)"), Err(Error::Form(_))));
        assert!(matches!(
            lower_src("(module (param i32))"),
            Err(Error::Form(_))
        ));
    }
}
