// context.rs - Module linker and registries
//
// Owns decoded modules and compiled artifacts by name; compiles each
// binary at most once. Instances belong to whoever instantiated them —
// the context keeps only a weak by-name lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::compile::{compile_module, CompiledModule};
use crate::config::WasmConfig;
use crate::decoder::ModuleDecoder;
use crate::error::{FormatError, LinkError, WasmError};
use crate::global::Global;
use crate::instance::Instance;
use crate::memory::Memory;
use crate::module::{BinaryModule, ImportKind};
use crate::table::{FuncRef, Table};

enum ImportPayload {
    Function(FuncRef),
    Memory(Arc<Memory>),
    Table(Arc<Table>),
    Global(Arc<Global>),
}

impl ImportPayload {
    fn kind_name(&self) -> &'static str {
        match self {
            ImportPayload::Function(_) => "function",
            ImportPayload::Memory(_) => "memory",
            ImportPayload::Table(_) => "table",
            ImportPayload::Global(_) => "global",
        }
    }
}

struct SuppliedImport {
    module: String,
    name: String,
    payload: ImportPayload,
}

/// Caller-supplied import bindings, looked up by exact
/// `(module, name)` match. The first matching registration wins.
#[derive(Default)]
pub struct Imports {
    entries: Vec<SuppliedImport>,
}

impl Imports {
    pub fn new() -> Self {
        Imports::default()
    }

    pub fn function(mut self, module: &str, name: &str, function: FuncRef) -> Self {
        self.entries.push(SuppliedImport {
            module: module.to_string(),
            name: name.to_string(),
            payload: ImportPayload::Function(function),
        });
        self
    }

    pub fn memory(mut self, module: &str, name: &str, memory: Arc<Memory>) -> Self {
        self.entries.push(SuppliedImport {
            module: module.to_string(),
            name: name.to_string(),
            payload: ImportPayload::Memory(memory),
        });
        self
    }

    pub fn table(mut self, module: &str, name: &str, table: Arc<Table>) -> Self {
        self.entries.push(SuppliedImport {
            module: module.to_string(),
            name: name.to_string(),
            payload: ImportPayload::Table(table),
        });
        self
    }

    pub fn global(mut self, module: &str, name: &str, global: Arc<Global>) -> Self {
        self.entries.push(SuppliedImport {
            module: module.to_string(),
            name: name.to_string(),
            payload: ImportPayload::Global(global),
        });
        self
    }

    fn lookup(&self, module: &str, name: &str) -> Option<&ImportPayload> {
        self.entries
            .iter()
            .find(|e| e.module == module && e.name == name)
            .map(|e| &e.payload)
    }
}

/// The linker: loads binaries, compiles them idempotently, and
/// instantiates them against caller-supplied imports.
pub struct WasmContext {
    config: WasmConfig,
    modules: Mutex<HashMap<String, Arc<BinaryModule>>>,
    compiled: Mutex<HashMap<String, Arc<CompiledModule>>>,
    instances: Mutex<HashMap<String, Weak<Instance>>>,
}

impl WasmContext {
    pub fn new() -> Self {
        WasmContext::with_config(WasmConfig::default())
    }

    pub fn with_config(config: WasmConfig) -> Self {
        WasmContext {
            config,
            modules: Mutex::new(HashMap::new()),
            compiled: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode a binary and register it under `name`.
    pub fn load_binary(&self, name: &str, wasm: &[u8]) -> Result<(), FormatError> {
        let module = ModuleDecoder::new(wasm).decode_module(name)?;
        log::debug!(
            "loaded module {name}: {} types, {} imports, {} functions, {} exports",
            module.type_section.len(),
            module.import_section.len(),
            module.function_count(),
            module.export_section.len()
        );
        Self::lock(&self.modules).insert(name.to_string(), Arc::new(module));
        Ok(())
    }

    pub fn find_binary(&self, name: &str) -> Option<Arc<BinaryModule>> {
        Self::lock(&self.modules).get(name).cloned()
    }

    pub fn find_instance(&self, name: &str) -> Option<Arc<Instance>> {
        Self::lock(&self.instances).get(name).and_then(Weak::upgrade)
    }

    /// Translate a loaded module, at most once; repeat requests return the
    /// cached artifact. The check-or-insert runs under one lock so
    /// concurrent first-uses still compile only once.
    pub fn compile(&self, name: &str) -> Result<Arc<CompiledModule>, WasmError> {
        let mut compiled = Self::lock(&self.compiled);
        if let Some(artifact) = compiled.get(name) {
            return Ok(artifact.clone());
        }
        let binary = self
            .find_binary(name)
            .ok_or_else(|| LinkError::UnknownModule(name.to_string()))?;
        log::debug!("compiling module {name}");
        let artifact = Arc::new(compile_module(&binary)?);
        compiled.insert(name.to_string(), artifact.clone());
        Ok(artifact)
    }

    pub fn compile_all(&self) -> Result<(), WasmError> {
        let names: Vec<String> = Self::lock(&self.modules).keys().cloned().collect();
        for name in names {
            self.compile(&name)?;
        }
        Ok(())
    }

    /// Compile (if needed) and instantiate a module, resolving each of its
    /// declared imports against `imports`.
    pub fn instantiate(&self, name: &str, imports: &Imports) -> Result<Arc<Instance>, WasmError> {
        let module = self.compile(name)?;
        let instance = Arc::new(Instance::new(name, module.clone(), &self.config));

        let mut function_slot = 0u32;
        let mut global_slot = 0u32;
        for required in &module.binary.import_section {
            let supplied = imports.lookup(&required.module, &required.name);
            let mismatch = |supplied: &ImportPayload| {
                LinkError::KindMismatch {
                    module: required.module.clone(),
                    name: required.name.clone(),
                    expected: required.kind.kind_name(),
                    supplied: supplied.kind_name(),
                }
            };
            let missing = || LinkError::MissingImport {
                module: required.module.clone(),
                name: required.name.clone(),
                kind: required.kind.kind_name(),
            };
            match (&required.kind, supplied) {
                (ImportKind::Function(_), Some(ImportPayload::Function(f))) => {
                    instance.bind_function(function_slot, f.clone())?;
                }
                (ImportKind::Memory(_), Some(ImportPayload::Memory(m))) => {
                    instance.import_memory(m.clone())?;
                }
                (ImportKind::Table(_), Some(ImportPayload::Table(t))) => {
                    instance.import_table(t.clone())?;
                }
                (ImportKind::Global(_), Some(ImportPayload::Global(g))) => {
                    instance.bind_global(global_slot, g.clone())?;
                }
                (_, Some(other)) => return Err(mismatch(other).into()),
                (_, None) => return Err(missing().into()),
            }
            match &required.kind {
                ImportKind::Function(_) => function_slot += 1,
                ImportKind::Global(_) => global_slot += 1,
                _ => {}
            }
        }

        instance.initialize()?;
        log::debug!("instantiated module {name}");
        Self::lock(&self.instances).insert(name.to_string(), Arc::downgrade(&instance));
        Ok(instance)
    }

    /// Instantiate every loaded module with empty imports.
    pub fn instantiate_all(&self) -> Result<(), WasmError> {
        let names: Vec<String> = Self::lock(&self.modules).keys().cloned().collect();
        let imports = Imports::new();
        for name in names {
            self.instantiate(&name, &imports)?;
        }
        Ok(())
    }

    /// By-name lookup of an exported function on a live instance.
    pub fn get_exported_function(&self, module: &str, function: &str) -> Option<FuncRef> {
        self.find_instance(module)?.exported_function(function)
    }

    /// By-name lookup of an exported global cell on a live instance.
    pub fn get_exported_global(&self, module: &str, global: &str) -> Option<Arc<Global>> {
        self.find_instance(module)?.exported_global(global)
    }
}

impl Default for WasmContext {
    fn default() -> Self {
        WasmContext::new()
    }
}
