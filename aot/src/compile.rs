// compile.rs - Per-module compilation
//
// Builds the function table (imports first, then local functions),
// translates every local body, and compiles the lazily-decoded global,
// element, and data sections. Initializer and offset expressions go
// through the same translator as function bodies, so each becomes a tiny
// compiled function evaluated at instantiation time.

use std::sync::Arc;

use crate::decoder::decode_global_type;
use crate::emit::{CodeBuilder, CompiledFunction};
use crate::error::FormatError;
use crate::function::{decode_expression, CodeVisitor, FunctionDecoder};
use crate::leb128::ByteReader;
use crate::module::{BinaryModule, ImportKind};
use crate::opcodes as op;
use crate::translate::Translator;
use crate::types::{FunctionId, FunctionType, GlobalType, ValueType};

/// One entry in the compiled function table.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub ty: FunctionType,
    pub imported: bool,
    pub exported: bool,
}

/// A local global declaration plus its compiled initializer. `init` is
/// `None` when the initializer expression is empty; the cell then starts
/// at the zero of its type.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalPlan {
    pub ty: GlobalType,
    pub init: Option<CompiledFunction>,
}

/// An element segment: a compiled offset expression plus the function
/// indices to install from that offset upward.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSegment {
    pub table: u32,
    pub offset: CompiledFunction,
    pub functions: Vec<u32>,
}

/// A data segment: a compiled offset expression plus the bytes to copy.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub memory: u32,
    pub offset: CompiledFunction,
    pub bytes: Vec<u8>,
}

/// The linkable artifact produced by compiling one [`BinaryModule`].
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub binary: Arc<BinaryModule>,
    /// Imports first, then local functions, in index-space order.
    pub functions: Vec<FunctionInfo>,
    /// Global types over the full index space (imports first).
    pub globals: Vec<GlobalType>,
    /// Bodies of local functions; index = function id - imported count.
    pub bodies: Vec<CompiledFunction>,
    pub local_globals: Vec<GlobalPlan>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
}

impl CompiledModule {
    pub fn imported_function_count(&self) -> u32 {
        self.binary.imported_function_count()
    }

    pub fn function_info(&self, id: FunctionId) -> Option<&FunctionInfo> {
        self.functions.get(id.id as usize)
    }

    pub fn body(&self, id: FunctionId) -> Option<&CompiledFunction> {
        let local = (id.id as usize).checked_sub(self.imported_function_count() as usize)?;
        self.bodies.get(local)
    }
}

/// Compile a decoded module into a linkable artifact.
pub fn compile_module(binary: &Arc<BinaryModule>) -> Result<CompiledModule, FormatError> {
    let functions = build_function_table(binary)?;
    let (globals, local_globals) = compile_globals(binary, &functions)?;

    let imported = binary.imported_function_count() as usize;
    if binary.code_section.len() != binary.function_section.len() {
        return Err(FormatError::IndexOutOfRange {
            context: "code section",
            index: binary.code_section.len() as u32,
        });
    }

    let mut bodies = Vec::with_capacity(binary.code_section.len());
    for (i, code) in binary.code_section.iter().enumerate() {
        let id = FunctionId::local((imported + i) as u32);
        let ty = binary
            .type_for_function(id)
            .ok_or(FormatError::IndexOutOfRange {
                context: "function type",
                index: id.id,
            })?
            .clone();
        log::debug!(
            "module {}: translating function {} ({})",
            binary.name,
            id.id,
            functions[id.id as usize].name
        );
        let mut translator =
            Translator::new(binary, &functions, &globals, CodeBuilder::new(ty.clone()));
        FunctionDecoder::new(code, ty).decode(&mut translator)?;
        bodies.push(translator.into_emitter().finish());
    }

    let elements = compile_elements(binary, &functions, &globals)?;
    let data = compile_data(binary, &functions, &globals)?;

    Ok(CompiledModule {
        binary: binary.clone(),
        functions,
        globals,
        bodies,
        local_globals,
        elements,
        data,
    })
}

fn build_function_table(binary: &BinaryModule) -> Result<Vec<FunctionInfo>, FormatError> {
    let mut functions = Vec::new();

    for import in &binary.import_section {
        if let ImportKind::Function(type_id) = import.kind {
            let ty = binary
                .type_section
                .get(type_id.0 as usize)
                .ok_or(FormatError::IndexOutOfRange {
                    context: "type",
                    index: type_id.0,
                })?
                .clone();
            let id = functions.len() as u32;
            let export = binary.exported_function_name(id);
            functions.push(FunctionInfo {
                name: export
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("func_{id}")),
                ty,
                imported: true,
                exported: export.is_some(),
            });
        }
    }

    for type_id in &binary.function_section {
        let ty = binary
            .type_section
            .get(type_id.0 as usize)
            .ok_or(FormatError::IndexOutOfRange {
                context: "type",
                index: type_id.0,
            })?
            .clone();
        let id = functions.len() as u32;
        let export = binary.exported_function_name(id);
        functions.push(FunctionInfo {
            name: export
                .map(str::to_string)
                .unwrap_or_else(|| format!("func_{id}")),
            ty,
            imported: false,
            exported: export.is_some(),
        });
    }

    Ok(functions)
}

/// Compile one initializer/offset expression into a zero-argument function
/// returning `result`. The cursor is left just past the expression's END.
fn compile_expression(
    binary: &BinaryModule,
    functions: &[FunctionInfo],
    globals: &[GlobalType],
    r: &mut ByteReader<'_>,
    result: ValueType,
) -> Result<CompiledFunction, FormatError> {
    let ty = FunctionType::new(vec![], vec![result]);
    let mut translator =
        Translator::new(binary, functions, globals, CodeBuilder::new(ty.clone()));
    translator.visit_function(Some(&ty));
    translator.visit_locals(&[])?;
    decode_expression(r, &mut translator)?;
    translator.exit_function()?;
    Ok(translator.into_emitter().finish())
}

fn compile_globals(
    binary: &BinaryModule,
    functions: &[FunctionInfo],
) -> Result<(Vec<GlobalType>, Vec<GlobalPlan>), FormatError> {
    let mut globals: Vec<GlobalType> = binary
        .import_section
        .iter()
        .filter_map(|i| match i.kind {
            ImportKind::Global(g) => Some(g),
            _ => None,
        })
        .collect();
    let mut plans = Vec::new();

    if binary.global_section.is_empty() {
        return Ok((globals, plans));
    }

    let mut r = ByteReader::new(&binary.global_section);
    let count = r.decode_u32()?;
    for _ in 0..count {
        let ty = decode_global_type(&mut r)?;
        // an initializer consisting of a bare END leaves the cell zeroed
        let init = if r.peek_u8()? == op::END {
            r.read_u8()?;
            None
        } else {
            Some(compile_expression(
                binary,
                functions,
                &globals,
                &mut r,
                ty.value_type,
            )?)
        };
        globals.push(ty);
        plans.push(GlobalPlan { ty, init });
    }

    Ok((globals, plans))
}

fn compile_elements(
    binary: &BinaryModule,
    functions: &[FunctionInfo],
    globals: &[GlobalType],
) -> Result<Vec<ElementSegment>, FormatError> {
    let mut segments = Vec::new();
    if binary.element_section.is_empty() {
        return Ok(segments);
    }

    let mut r = ByteReader::new(&binary.element_section);
    let count = r.decode_u32()?;
    for _ in 0..count {
        let table = r.decode_u32()?;
        let offset = compile_expression(binary, functions, globals, &mut r, ValueType::I32)?;
        let id_count = r.decode_u32()?;
        let mut ids = Vec::with_capacity(id_count.min(1024) as usize);
        for _ in 0..id_count {
            let id = r.decode_u32()?;
            if id as usize >= functions.len() {
                return Err(FormatError::IndexOutOfRange {
                    context: "element function",
                    index: id,
                });
            }
            ids.push(id);
        }
        segments.push(ElementSegment {
            table,
            offset,
            functions: ids,
        });
    }

    Ok(segments)
}

fn compile_data(
    binary: &BinaryModule,
    functions: &[FunctionInfo],
    globals: &[GlobalType],
) -> Result<Vec<DataSegment>, FormatError> {
    let mut segments = Vec::new();
    if binary.data_section.is_empty() {
        return Ok(segments);
    }

    let mut r = ByteReader::new(&binary.data_section);
    let count = r.decode_u32()?;
    for _ in 0..count {
        let memory = r.decode_u32()?;
        let offset = compile_expression(binary, functions, globals, &mut r, ValueType::I32)?;
        let len = r.decode_u32()?;
        let bytes = r.read_bytes(len as usize)?.to_vec();
        segments.push(DataSegment {
            memory,
            offset,
            bytes,
        });
    }

    Ok(segments)
}
