// instance.rs - Module instances
//
// One runtime incarnation of a compiled module. An instance is built
// "open", has its import slots bound one by one, runs its initializer
// (globals, then table elements, then data segments, then the start
// function), and is then locked: any further import binding is rejected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::compile::CompiledModule;
use crate::config::WasmConfig;
use crate::error::{LinkError, Trap, WasmError};
use crate::exec;
use crate::global::Global;
use crate::memory::Memory;
use crate::module::ExportKind;
use crate::table::{FuncRef, Table};
use crate::types::{FunctionId, Value};

pub struct Instance {
    name: String,
    module: Arc<CompiledModule>,
    memory: RwLock<Arc<Memory>>,
    table: RwLock<Arc<Table>>,
    /// Full global index space: imported slots (bound during linking)
    /// first, then local cells appended during initialization.
    globals: RwLock<Vec<Option<Arc<Global>>>>,
    /// Imported function slots, by function-import order.
    functions: RwLock<Vec<Option<FuncRef>>>,
    locked: AtomicBool,
}

impl Instance {
    pub(crate) fn new(name: &str, module: Arc<CompiledModule>, config: &WasmConfig) -> Self {
        let memory = match module.binary.memory_section.first() {
            Some(mt) => Memory::with_limits(mt.limits, config.allocation_mode, config.memory_padding),
            None => Memory::new(),
        };
        let table = match module.binary.table_section.first() {
            Some(tt) => Table::from_type(tt),
            None => Table::new(),
        };
        let imported_globals = module.binary.imported_global_count() as usize;
        let imported_functions = module.binary.imported_function_count() as usize;
        Instance {
            name: name.to_string(),
            module,
            memory: RwLock::new(Arc::new(memory)),
            table: RwLock::new(Arc::new(table)),
            globals: RwLock::new(vec![None; imported_globals]),
            functions: RwLock::new(vec![None; imported_functions]),
            locked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), LinkError> {
        if self.is_locked() {
            return Err(LinkError::AlreadyInitialized(self.name.clone()));
        }
        Ok(())
    }

    /// Replace the instance's memory with an imported one. Rejected once
    /// initialization has completed.
    pub fn import_memory(&self, memory: Arc<Memory>) -> Result<(), LinkError> {
        self.check_open()?;
        *self.memory.write().unwrap_or_else(|e| e.into_inner()) = memory;
        Ok(())
    }

    pub fn import_table(&self, table: Arc<Table>) -> Result<(), LinkError> {
        self.check_open()?;
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = table;
        Ok(())
    }

    pub(crate) fn bind_global(&self, slot: u32, global: Arc<Global>) -> Result<(), LinkError> {
        self.check_open()?;
        let mut globals = self.globals.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = globals.get_mut(slot as usize) {
            *entry = Some(global);
        }
        Ok(())
    }

    pub(crate) fn bind_function(&self, slot: u32, function: FuncRef) -> Result<(), LinkError> {
        self.check_open()?;
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = functions.get_mut(slot as usize) {
            *entry = Some(function);
        }
        Ok(())
    }

    pub fn memory(&self) -> Arc<Memory> {
        self.memory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn table(&self) -> Arc<Table> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn global(&self, id: u32) -> Option<Arc<Global>> {
        self.globals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id as usize)
            .cloned()
            .flatten()
    }

    fn imported_function(&self, slot: u32) -> Option<FuncRef> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(slot as usize)
            .cloned()
            .flatten()
    }

    /// Run global initializers, populate table elements, copy data
    /// segments, lock the instance, and invoke the start function.
    pub(crate) fn initialize(self: &Arc<Self>) -> Result<(), WasmError> {
        for plan in &self.module.local_globals {
            let value = match &plan.init {
                Some(init) => {
                    exec::run(self, init, &[])?.ok_or(Trap::StackUnderflow)?
                }
                None => plan.ty.value_type.zero(),
            };
            if value.ty() != plan.ty.value_type {
                return Err(Trap::TypeMismatch.into());
            }
            self.globals
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Some(Arc::new(Global::new(plan.ty.mutability, value))));
        }

        for segment in &self.module.elements {
            let offset = exec::run(self, &segment.offset, &[])?
                .ok_or(Trap::StackUnderflow)?
                .i32()? as u32;
            let mut targets = Vec::with_capacity(segment.functions.len());
            for &id in &segment.functions {
                targets.push(self.function_ref(id)?);
            }
            self.table().set_all(offset, &targets)?;
        }

        for segment in &self.module.data {
            let offset = exec::run(self, &segment.offset, &[])?
                .ok_or(Trap::StackUnderflow)?
                .i32()? as u32;
            self.memory().write_bulk(offset as u64, &segment.bytes)?;
        }

        self.locked.store(true, Ordering::Release);

        if let Some(start) = self.module.binary.start {
            log::debug!("module {}: running start function {}", self.name, start.id);
            self.invoke(start, &[])?;
        }

        Ok(())
    }

    /// A callable handle to a function in this instance's index space.
    /// Holds only a weak reference back to the instance, so table entries
    /// pointing at their own instance do not leak it.
    pub(crate) fn function_ref(self: &Arc<Self>, id: u32) -> Result<FuncRef, Trap> {
        let imported_count = self.module.imported_function_count();
        if id < imported_count {
            return self.imported_function(id).ok_or(Trap::UnboundImport(id));
        }
        let info = self
            .module
            .function_info(FunctionId::local(id))
            .ok_or(Trap::UnboundImport(id))?;
        let function = FunctionId::local(id);
        let weak: Weak<Instance> = Arc::downgrade(self);
        Ok(FuncRef::new(info.ty.clone(), move |args| {
            let instance = weak.upgrade().ok_or(Trap::InstanceGone)?;
            instance.invoke(function, args)
        }))
    }

    /// Invoke a function by its index-space id, checking argument arity
    /// and types against the signature.
    pub(crate) fn invoke(
        self: &Arc<Self>,
        id: FunctionId,
        args: &[Value],
    ) -> Result<Option<Value>, Trap> {
        let info = self
            .module
            .function_info(id)
            .ok_or(Trap::UnboundImport(id.id))?;
        if args.len() != info.ty.params.len()
            || args.iter().zip(&info.ty.params).any(|(a, p)| a.ty() != *p)
        {
            return Err(Trap::TypeMismatch);
        }
        if id.imported {
            let function = self.imported_function(id.id).ok_or(Trap::UnboundImport(id.id))?;
            function.call(args)
        } else {
            let body = self.module.body(id).ok_or(Trap::UnboundImport(id.id))?;
            exec::run(self, body, args)
        }
    }

    /// Resolve an exported function by name. The handle keeps the
    /// instance alive for as long as the caller holds it.
    pub fn exported_function(self: &Arc<Self>, name: &str) -> Option<FuncRef> {
        let index = self.module.binary.export_section.iter().find_map(|e| {
            match e.kind {
                ExportKind::Function(id) if e.name == name => Some(id),
                _ => None,
            }
        })?;
        let info = self.module.functions.get(index as usize)?;
        let id = FunctionId {
            id: index,
            imported: info.imported,
        };
        let strong = self.clone();
        Some(FuncRef::new(info.ty.clone(), move |args| {
            strong.invoke(id, args)
        }))
    }

    /// Resolve an exported global cell by name.
    pub fn exported_global(&self, name: &str) -> Option<Arc<Global>> {
        let index = self.module.binary.export_section.iter().find_map(|e| {
            match e.kind {
                ExportKind::Global(id) if e.name == name => Some(id),
                _ => None,
            }
        })?;
        self.global(index)
    }
}
