// table.rs - Call-target table
//
// A growable, optionally capacity-bounded array of opaque call targets
// used by indirect calls. Growth on demand extends to exactly the
// requested index; exceeding the configured maximum is a caller-visible
// error, not a trap.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::error::{LimitError, Trap};
use crate::types::{FunctionType, TableType, Value};

/// A typed callable target: a host function or a bound module function.
#[derive(Clone)]
pub struct FuncRef {
    ty: FunctionType,
    target: Arc<dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync>,
}

impl FuncRef {
    pub fn new(
        ty: FunctionType,
        f: impl Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync + 'static,
    ) -> Self {
        FuncRef {
            ty,
            target: Arc::new(f),
        }
    }

    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    pub fn call(&self, args: &[Value]) -> Result<Option<Value>, Trap> {
        (self.target)(args)
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncRef").field("ty", &self.ty).finish()
    }
}

pub struct Table {
    entries: RwLock<Vec<Option<FuncRef>>>,
    max_size: Option<u32>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: RwLock::new(Vec::new()),
            max_size: None,
        }
    }

    pub fn with_max(max_size: u32) -> Self {
        Table {
            entries: RwLock::new(Vec::new()),
            max_size: Some(max_size),
        }
    }

    pub fn from_type(ty: &TableType) -> Self {
        Table {
            entries: RwLock::new(vec![None; ty.limits.min as usize]),
            max_size: ty.limits.max,
        }
    }

    pub fn max_size(&self) -> Option<u32> {
        self.max_size
    }

    fn lock(&self) -> RwLockWriteGuard<'_, Vec<Option<FuncRef>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_size(
        entries: &mut Vec<Option<FuncRef>>,
        id: u32,
        max_size: Option<u32>,
    ) -> Result<(), LimitError> {
        if (id as usize) < entries.len() {
            return Ok(());
        }
        match max_size {
            Some(max) if id >= max => Err(LimitError {
                requested: id,
                max,
            }),
            _ => {
                entries.resize(id as usize + 1, None);
                Ok(())
            }
        }
    }

    pub fn size(&self) -> u32 {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u32
    }

    pub fn get(&self, id: u32) -> Result<Option<FuncRef>, LimitError> {
        let mut entries = self.lock();
        Self::ensure_size(&mut entries, id, self.max_size)?;
        Ok(entries[id as usize].clone())
    }

    pub fn set(&self, id: u32, target: FuncRef) -> Result<(), LimitError> {
        let mut entries = self.lock();
        Self::ensure_size(&mut entries, id, self.max_size)?;
        entries[id as usize] = Some(target);
        Ok(())
    }

    /// Bulk-assign targets starting at `start_id`, from the highest index
    /// downward so the backing array is resized at most once.
    pub fn set_all(&self, start_id: u32, targets: &[FuncRef]) -> Result<(), LimitError> {
        let mut entries = self.lock();
        for (i, target) in targets.iter().enumerate().rev() {
            let id = start_id + i as u32;
            Self::ensure_size(&mut entries, id, self.max_size)?;
            entries[id as usize] = Some(target.clone());
        }
        Ok(())
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
