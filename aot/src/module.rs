// module.rs - Decoded module representation
//
// The immutable result of decoding one wasm binary. Global, element, and
// data sections are retained as raw bytes and decoded lazily at compile
// time, when the translator's type context is available.

use crate::types::{
    FunctionId, FunctionType, GlobalType, MemoryType, TableType, TypeId,
};

/// A custom section, round-tripped opaquely.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomSection {
    pub name: String,
    pub payload: Vec<u8>,
}

/// One function body: locals declaration plus instruction stream, kept
/// undecoded until translation.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub body: Vec<u8>,
}

/// Import descriptor payload. The four variants are the only legal payload
/// kinds; the closed enum makes the invariant structural.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportKind {
    Function(TypeId),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ImportKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ImportKind::Function(_) => "function",
            ImportKind::Table(_) => "table",
            ImportKind::Memory(_) => "memory",
            ImportKind::Global(_) => "global",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExportKind {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
}

/// The decoded, read-only representation of one module. Built once by the
/// decoder; owned by the context's module registry thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryModule {
    pub name: String,
    pub custom_sections: Vec<CustomSection>,
    pub type_section: Vec<FunctionType>,
    pub import_section: Vec<Import>,
    pub function_section: Vec<TypeId>,
    pub table_section: Vec<TableType>,
    pub memory_section: Vec<MemoryType>,
    pub global_section: Vec<u8>,
    pub export_section: Vec<Export>,
    pub start: Option<FunctionId>,
    pub element_section: Vec<u8>,
    pub code_section: Vec<Code>,
    pub data_section: Vec<u8>,
}

impl BinaryModule {
    pub fn new(name: &str) -> Self {
        BinaryModule {
            name: name.to_string(),
            custom_sections: Vec::new(),
            type_section: Vec::new(),
            import_section: Vec::new(),
            function_section: Vec::new(),
            table_section: Vec::new(),
            memory_section: Vec::new(),
            global_section: Vec::new(),
            export_section: Vec::new(),
            start: None,
            element_section: Vec::new(),
            code_section: Vec::new(),
            data_section: Vec::new(),
        }
    }

    /// Count of imported functions; local function indices start here.
    pub fn imported_function_count(&self) -> u32 {
        self.import_section
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function(_)))
            .count() as u32
    }

    pub fn imported_global_count(&self) -> u32 {
        self.import_section
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count() as u32
    }

    pub fn function_count(&self) -> u32 {
        self.imported_function_count() + self.function_section.len() as u32
    }

    /// The `n`th import of function kind.
    pub fn function_import(&self, n: u32) -> Option<&Import> {
        self.import_section
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function(_)))
            .nth(n as usize)
    }

    /// Resolve a function's signature through the split index space.
    pub fn type_for_function(&self, id: FunctionId) -> Option<&FunctionType> {
        let type_id = if id.imported {
            match self.function_import(id.id)?.kind {
                ImportKind::Function(t) => t,
                _ => return None,
            }
        } else {
            let local = (id.id as usize).checked_sub(self.imported_function_count() as usize)?;
            *self.function_section.get(local)?
        };
        self.type_section.get(type_id.0 as usize)
    }

    /// The export name of a function index, if it is exported.
    pub fn exported_function_name(&self, id: u32) -> Option<&str> {
        self.export_section.iter().find_map(|e| match e.kind {
            ExportKind::Function(f) if f == id => Some(e.name.as_str()),
            _ => None,
        })
    }

    pub fn exported_global_name(&self, id: u32) -> Option<&str> {
        self.export_section.iter().find_map(|e| match e.kind {
            ExportKind::Global(g) if g == id => Some(e.name.as_str()),
            _ => None,
        })
    }
}
