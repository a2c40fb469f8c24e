// global.rs - Typed global cells
//
// A mutability-tagged storage cell for one value. Writing a const cell is
// a caller error reported as a trap, never silently ignored.

use std::sync::Mutex;

use crate::error::Trap;
use crate::types::{Mutability, Value, ValueType};

#[derive(Debug)]
pub struct Global {
    ty: ValueType,
    mutability: Mutability,
    value: Mutex<Value>,
}

impl Global {
    pub fn new(mutability: Mutability, value: Value) -> Self {
        Global {
            ty: value.ty(),
            mutability,
            value: Mutex::new(value),
        }
    }

    pub fn immutable(value: Value) -> Self {
        Global::new(Mutability::Const, value)
    }

    pub fn mutable(value: Value) -> Self {
        Global::new(Mutability::Var, value)
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub fn get(&self) -> Value {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, value: Value) -> Result<(), Trap> {
        if self.mutability == Mutability::Const {
            return Err(Trap::ImmutableGlobal);
        }
        if value.ty() != self.ty {
            return Err(Trap::TypeMismatch);
        }
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
        Ok(())
    }
}
