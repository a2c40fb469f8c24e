// exec.rs - Threaded-code evaluator
//
// Runs one compiled function body against a module instance: a value
// stack, a locals frame, and a dispatch loop over the op array. All trap
// conditions surface here — modules are decoded and translated without
// full validation, so the evaluator must fault (never panic) on anything
// a malformed module could reach.

use std::sync::Arc;

use crate::emit::{CompiledFunction, NumericOp, Op};
use crate::error::Trap;
use crate::instance::Instance;
use crate::types::{Value, ValueType};

pub(crate) fn run(
    instance: &Arc<Instance>,
    func: &CompiledFunction,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let mut locals: Vec<Value> = Vec::with_capacity(args.len() + func.locals.len());
    locals.extend_from_slice(args);
    for ty in &func.locals {
        locals.push(ty.zero());
    }

    // the buffer reference cannot change while the instance is locked, so
    // snapshot it once per frame
    let memory = instance.memory();

    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0usize;

    while let Some(op) = func.ops.get(pc) {
        pc += 1;
        match op {
            Op::Const(v) => stack.push(*v),
            Op::LocalGet(i) => {
                let v = locals
                    .get(*i as usize)
                    .copied()
                    .ok_or(Trap::StackUnderflow)?;
                stack.push(v);
            }
            Op::LocalSet(i) => {
                let v = pop(&mut stack)?;
                let slot = locals.get_mut(*i as usize).ok_or(Trap::StackUnderflow)?;
                *slot = v;
            }
            Op::Dup => {
                let v = *stack.last().ok_or(Trap::StackUnderflow)?;
                stack.push(v);
            }
            Op::Drop => {
                pop(&mut stack)?;
            }
            Op::Select => {
                let test = pop(&mut stack)?.i32()?;
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(if test != 0 { a } else { b });
            }
            Op::Numeric(num) => numeric(*num, &mut stack)?,
            Op::Load {
                ty,
                width,
                signed,
                offset,
            } => {
                let base = pop(&mut stack)?.i32()? as u32 as u64;
                let addr = base + *offset as u64;
                let value = match (*ty, *width, *signed) {
                    (ValueType::I32, 8, true) => Value::I32(memory.read_i8(addr)? as i32),
                    (ValueType::I32, 8, false) => Value::I32(memory.read_u8(addr)? as i32),
                    (ValueType::I32, 16, true) => Value::I32(memory.read_i16(addr)? as i32),
                    (ValueType::I32, 16, false) => Value::I32(memory.read_u16(addr)? as i32),
                    (ValueType::I32, _, _) => Value::I32(memory.read_i32(addr)?),
                    (ValueType::I64, 8, true) => Value::I64(memory.read_i8(addr)? as i64),
                    (ValueType::I64, 8, false) => Value::I64(memory.read_u8(addr)? as i64),
                    (ValueType::I64, 16, true) => Value::I64(memory.read_i16(addr)? as i64),
                    (ValueType::I64, 16, false) => Value::I64(memory.read_u16(addr)? as i64),
                    (ValueType::I64, 32, true) => Value::I64(memory.read_i32(addr)? as i64),
                    (ValueType::I64, 32, false) => Value::I64(memory.read_u32(addr)? as i64),
                    (ValueType::I64, _, _) => Value::I64(memory.read_i64(addr)?),
                    (ValueType::F32, _, _) => Value::F32(memory.read_f32(addr)?),
                    (ValueType::F64, _, _) => Value::F64(memory.read_f64(addr)?),
                };
                stack.push(value);
            }
            Op::Store { ty, width, offset } => {
                let value = pop(&mut stack)?;
                let base = pop(&mut stack)?.i32()? as u32 as u64;
                let addr = base + *offset as u64;
                // narrower-than-natural stores truncate, never widen
                match (*ty, *width) {
                    (ValueType::I32, 8) => memory.write_u8(addr, value.i32()? as u8)?,
                    (ValueType::I32, 16) => memory.write_u16(addr, value.i32()? as u16)?,
                    (ValueType::I32, _) => memory.write_i32(addr, value.i32()?)?,
                    (ValueType::I64, 8) => memory.write_u8(addr, value.i64()? as u8)?,
                    (ValueType::I64, 16) => memory.write_u16(addr, value.i64()? as u16)?,
                    (ValueType::I64, 32) => memory.write_i32(addr, value.i64()? as i32)?,
                    (ValueType::I64, _) => memory.write_i64(addr, value.i64()?)?,
                    (ValueType::F32, _) => memory.write_f32(addr, value.f32()?)?,
                    (ValueType::F64, _) => memory.write_f64(addr, value.f64()?)?,
                }
            }
            Op::MemorySize => stack.push(Value::I32(memory.size() as i32)),
            Op::MemoryGrow => {
                let delta = pop(&mut stack)?.i32()?;
                let previous = if delta < 0 {
                    -1
                } else {
                    memory.grow(delta as u32)
                };
                stack.push(Value::I32(previous));
            }
            Op::GlobalGet(i) => {
                let global = instance.global(*i).ok_or(Trap::UnboundImport(*i))?;
                stack.push(global.get());
            }
            Op::GlobalSet(i) => {
                let value = pop(&mut stack)?;
                let global = instance.global(*i).ok_or(Trap::UnboundImport(*i))?;
                global.set(value)?;
            }
            Op::Call(id) => {
                let ty = instance
                    .module()
                    .function_info(*id)
                    .ok_or(Trap::UnboundImport(id.id))?
                    .ty
                    .clone();
                let call_args = pop_args(&mut stack, ty.params.len())?;
                if let Some(result) = instance.invoke(*id, &call_args)? {
                    stack.push(result);
                }
            }
            Op::CallIndirect(type_id) => {
                let expected = instance
                    .module()
                    .binary
                    .type_section
                    .get(type_id.0 as usize)
                    .ok_or(Trap::TypeMismatch)?
                    .clone();
                let index = pop(&mut stack)?.i32()? as u32;
                let entry = instance
                    .table()
                    .get(index)
                    .map_err(|_| Trap::UndefinedElement(index))?
                    .ok_or(Trap::UndefinedElement(index))?;
                // table contents are only known at run time
                if *entry.ty() != expected {
                    return Err(Trap::TypeMismatch);
                }
                let call_args = pop_args(&mut stack, expected.params.len())?;
                if let Some(result) = entry.call(&call_args)? {
                    stack.push(result);
                }
            }
            Op::Jump(target) => pc = *target as usize,
            Op::JumpIf(target) => {
                if pop(&mut stack)?.i32()? != 0 {
                    pc = *target as usize;
                }
            }
            Op::JumpIfNot(target) => {
                if pop(&mut stack)?.i32()? == 0 {
                    pc = *target as usize;
                }
            }
            Op::JumpTable { targets, default } => {
                let index = pop(&mut stack)?.i32()?;
                // anything outside the table falls back to the default
                let target = usize::try_from(index)
                    .ok()
                    .and_then(|i| targets.get(i))
                    .copied()
                    .unwrap_or(*default);
                pc = target as usize;
            }
            Op::Return => return take_result(&mut stack, func.ty.return_type()),
            Op::Unreachable => return Err(Trap::Unreachable),
        }
    }

    take_result(&mut stack, func.ty.return_type())
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, Trap> {
    stack.pop().ok_or(Trap::StackUnderflow)
}

fn pop_args(stack: &mut Vec<Value>, count: usize) -> Result<Vec<Value>, Trap> {
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(pop(stack)?);
    }
    args.reverse();
    Ok(args)
}

fn take_result(
    stack: &mut Vec<Value>,
    result: Option<ValueType>,
) -> Result<Option<Value>, Trap> {
    match result {
        None => Ok(None),
        Some(ty) => {
            let value = pop(stack)?;
            if value.ty() != ty {
                return Err(Trap::TypeMismatch);
            }
            Ok(Some(value))
        }
    }
}

// wasm float min/max propagate NaN and order -0 below +0, unlike the
// std float min/max

fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else {
        a.min(b)
    }
}

fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else {
        a.max(b)
    }
}

fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else {
        a.min(b)
    }
}

fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else {
        a.max(b)
    }
}

/// Truncate a float toward zero and check it fits the destination. Out of
/// range (including NaN) traps; there is no saturating fallback.
fn trunc_to_int(
    value: f64,
    to: ValueType,
    signed: bool,
) -> Result<Value, Trap> {
    if value.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let value = value.trunc();
    match (to, signed) {
        (ValueType::I32, true) => {
            if value < -2147483648.0 || value > 2147483647.0 {
                return Err(Trap::InvalidConversion);
            }
            Ok(Value::I32(value as i32))
        }
        (ValueType::I32, false) => {
            if value < 0.0 || value > 4294967295.0 {
                return Err(Trap::InvalidConversion);
            }
            Ok(Value::I32(value as u32 as i32))
        }
        (ValueType::I64, true) => {
            if value < -9223372036854775808.0 || value >= 9223372036854775808.0 {
                return Err(Trap::InvalidConversion);
            }
            Ok(Value::I64(value as i64))
        }
        (ValueType::I64, false) => {
            if value < 0.0 || value >= 18446744073709551616.0 {
                return Err(Trap::InvalidConversion);
            }
            Ok(Value::I64(value as u64 as i64))
        }
        _ => Err(Trap::InvalidConversion),
    }
}

fn numeric(op: NumericOp, stack: &mut Vec<Value>) -> Result<(), Trap> {
    use NumericOp::*;
    use ValueType::*;

    match op {
        Eq(ty) | Ne(ty) | Lt(ty, _) | Gt(ty, _) | Le(ty, _) | Ge(ty, _) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let result = match (op, ty) {
                (Eq(_), I32) => a.i32()? == b.i32()?,
                (Eq(_), I64) => a.i64()? == b.i64()?,
                (Eq(_), F32) => a.f32()? == b.f32()?,
                (Eq(_), F64) => a.f64()? == b.f64()?,
                (Ne(_), I32) => a.i32()? != b.i32()?,
                (Ne(_), I64) => a.i64()? != b.i64()?,
                (Ne(_), F32) => a.f32()? != b.f32()?,
                (Ne(_), F64) => a.f64()? != b.f64()?,
                (Lt(_, true), I32) => a.i32()? < b.i32()?,
                (Lt(_, false), I32) => (a.i32()? as u32) < (b.i32()? as u32),
                (Lt(_, true), I64) => a.i64()? < b.i64()?,
                (Lt(_, false), I64) => (a.i64()? as u64) < (b.i64()? as u64),
                (Lt(_, _), F32) => a.f32()? < b.f32()?,
                (Lt(_, _), F64) => a.f64()? < b.f64()?,
                (Gt(_, true), I32) => a.i32()? > b.i32()?,
                (Gt(_, false), I32) => (a.i32()? as u32) > (b.i32()? as u32),
                (Gt(_, true), I64) => a.i64()? > b.i64()?,
                (Gt(_, false), I64) => (a.i64()? as u64) > (b.i64()? as u64),
                (Gt(_, _), F32) => a.f32()? > b.f32()?,
                (Gt(_, _), F64) => a.f64()? > b.f64()?,
                (Le(_, true), I32) => a.i32()? <= b.i32()?,
                (Le(_, false), I32) => (a.i32()? as u32) <= (b.i32()? as u32),
                (Le(_, true), I64) => a.i64()? <= b.i64()?,
                (Le(_, false), I64) => (a.i64()? as u64) <= (b.i64()? as u64),
                (Le(_, _), F32) => a.f32()? <= b.f32()?,
                (Le(_, _), F64) => a.f64()? <= b.f64()?,
                (Ge(_, true), I32) => a.i32()? >= b.i32()?,
                (Ge(_, false), I32) => (a.i32()? as u32) >= (b.i32()? as u32),
                (Ge(_, true), I64) => a.i64()? >= b.i64()?,
                (Ge(_, false), I64) => (a.i64()? as u64) >= (b.i64()? as u64),
                (Ge(_, _), F32) => a.f32()? >= b.f32()?,
                (Ge(_, _), F64) => a.f64()? >= b.f64()?,
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(Value::I32(result as i32));
        }

        Clz(I32) => {
            let a = pop(stack)?.i32()?;
            stack.push(Value::I32(a.leading_zeros() as i32));
        }
        Clz(_) => {
            let a = pop(stack)?.i64()?;
            stack.push(Value::I64(a.leading_zeros() as i64));
        }
        Ctz(I32) => {
            let a = pop(stack)?.i32()?;
            stack.push(Value::I32(a.trailing_zeros() as i32));
        }
        Ctz(_) => {
            let a = pop(stack)?.i64()?;
            stack.push(Value::I64(a.trailing_zeros() as i64));
        }
        Popcnt(I32) => {
            let a = pop(stack)?.i32()?;
            stack.push(Value::I32(a.count_ones() as i32));
        }
        Popcnt(_) => {
            let a = pop(stack)?.i64()?;
            stack.push(Value::I64(a.count_ones() as i64));
        }

        Add(ty) | Sub(ty) | Mul(ty) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match (op, ty) {
                (Add(_), I32) => Value::I32(a.i32()?.wrapping_add(b.i32()?)),
                (Add(_), I64) => Value::I64(a.i64()?.wrapping_add(b.i64()?)),
                (Add(_), F32) => Value::F32(a.f32()? + b.f32()?),
                (Add(_), F64) => Value::F64(a.f64()? + b.f64()?),
                (Sub(_), I32) => Value::I32(a.i32()?.wrapping_sub(b.i32()?)),
                (Sub(_), I64) => Value::I64(a.i64()?.wrapping_sub(b.i64()?)),
                (Sub(_), F32) => Value::F32(a.f32()? - b.f32()?),
                (Sub(_), F64) => Value::F64(a.f64()? - b.f64()?),
                (Mul(_), I32) => Value::I32(a.i32()?.wrapping_mul(b.i32()?)),
                (Mul(_), I64) => Value::I64(a.i64()?.wrapping_mul(b.i64()?)),
                (Mul(_), F32) => Value::F32(a.f32()? * b.f32()?),
                (Mul(_), F64) => Value::F64(a.f64()? * b.f64()?),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }

        DivInt(ty, signed) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match ty {
                I32 => {
                    let (a, b) = (a.i32()?, b.i32()?);
                    if b == 0 {
                        return Err(Trap::DivideByZero);
                    }
                    if signed {
                        if a == i32::MIN && b == -1 {
                            return Err(Trap::IntegerOverflow);
                        }
                        Value::I32(a.wrapping_div(b))
                    } else {
                        Value::I32(((a as u32) / (b as u32)) as i32)
                    }
                }
                _ => {
                    let (a, b) = (a.i64()?, b.i64()?);
                    if b == 0 {
                        return Err(Trap::DivideByZero);
                    }
                    if signed {
                        if a == i64::MIN && b == -1 {
                            return Err(Trap::IntegerOverflow);
                        }
                        Value::I64(a.wrapping_div(b))
                    } else {
                        Value::I64(((a as u64) / (b as u64)) as i64)
                    }
                }
            };
            stack.push(value);
        }

        RemInt(ty, signed) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match ty {
                I32 => {
                    let (a, b) = (a.i32()?, b.i32()?);
                    if b == 0 {
                        return Err(Trap::DivideByZero);
                    }
                    if signed {
                        // MIN % -1 is defined as 0, not an overflow
                        Value::I32(a.wrapping_rem(b))
                    } else {
                        Value::I32(((a as u32) % (b as u32)) as i32)
                    }
                }
                _ => {
                    let (a, b) = (a.i64()?, b.i64()?);
                    if b == 0 {
                        return Err(Trap::DivideByZero);
                    }
                    if signed {
                        Value::I64(a.wrapping_rem(b))
                    } else {
                        Value::I64(((a as u64) % (b as u64)) as i64)
                    }
                }
            };
            stack.push(value);
        }

        And(ty) | Or(ty) | Xor(ty) | Shl(ty) | Rotl(ty) | Rotr(ty) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match (op, ty) {
                (And(_), I32) => Value::I32(a.i32()? & b.i32()?),
                (And(_), _) => Value::I64(a.i64()? & b.i64()?),
                (Or(_), I32) => Value::I32(a.i32()? | b.i32()?),
                (Or(_), _) => Value::I64(a.i64()? | b.i64()?),
                (Xor(_), I32) => Value::I32(a.i32()? ^ b.i32()?),
                (Xor(_), _) => Value::I64(a.i64()? ^ b.i64()?),
                (Shl(_), I32) => Value::I32(a.i32()?.wrapping_shl(b.i32()? as u32)),
                (Shl(_), _) => Value::I64(a.i64()?.wrapping_shl(b.i64()? as u32)),
                (Rotl(_), I32) => Value::I32(a.i32()?.rotate_left(b.i32()? as u32 % 32)),
                (Rotl(_), _) => Value::I64(a.i64()?.rotate_left(b.i64()? as u32 % 64)),
                (Rotr(_), I32) => Value::I32(a.i32()?.rotate_right(b.i32()? as u32 % 32)),
                (Rotr(_), _) => Value::I64(a.i64()?.rotate_right(b.i64()? as u32 % 64)),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }

        Shr(ty, signed) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match (ty, signed) {
                (I32, true) => Value::I32(a.i32()?.wrapping_shr(b.i32()? as u32)),
                (I32, false) => Value::I32((a.i32()? as u32).wrapping_shr(b.i32()? as u32) as i32),
                (_, true) => Value::I64(a.i64()?.wrapping_shr(b.i64()? as u32)),
                (_, false) => Value::I64((a.i64()? as u64).wrapping_shr(b.i64()? as u32) as i64),
            };
            stack.push(value);
        }

        Abs(ty) | Neg(ty) | Ceil(ty) | Floor(ty) | TruncFloat(ty) | Nearest(ty) | Sqrt(ty) => {
            let a = pop(stack)?;
            let value = match (op, ty) {
                (Abs(_), F32) => Value::F32(a.f32()?.abs()),
                (Abs(_), _) => Value::F64(a.f64()?.abs()),
                (Neg(_), F32) => Value::F32(-a.f32()?),
                (Neg(_), _) => Value::F64(-a.f64()?),
                (Ceil(_), F32) => Value::F32(a.f32()?.ceil()),
                (Ceil(_), _) => Value::F64(a.f64()?.ceil()),
                (Floor(_), F32) => Value::F32(a.f32()?.floor()),
                (Floor(_), _) => Value::F64(a.f64()?.floor()),
                (TruncFloat(_), F32) => Value::F32(a.f32()?.trunc()),
                (TruncFloat(_), _) => Value::F64(a.f64()?.trunc()),
                (Nearest(_), F32) => Value::F32(a.f32()?.round_ties_even()),
                (Nearest(_), _) => Value::F64(a.f64()?.round_ties_even()),
                (Sqrt(_), F32) => Value::F32(a.f32()?.sqrt()),
                (Sqrt(_), _) => Value::F64(a.f64()?.sqrt()),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }

        DivFloat(ty) | Min(ty) | Max(ty) | Copysign(ty) => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let value = match (op, ty) {
                (DivFloat(_), F32) => Value::F32(a.f32()? / b.f32()?),
                (DivFloat(_), _) => Value::F64(a.f64()? / b.f64()?),
                (Min(_), F32) => Value::F32(fmin32(a.f32()?, b.f32()?)),
                (Min(_), _) => Value::F64(fmin64(a.f64()?, b.f64()?)),
                (Max(_), F32) => Value::F32(fmax32(a.f32()?, b.f32()?)),
                (Max(_), _) => Value::F64(fmax64(a.f64()?, b.f64()?)),
                (Copysign(_), F32) => Value::F32(a.f32()?.copysign(b.f32()?)),
                (Copysign(_), _) => Value::F64(a.f64()?.copysign(b.f64()?)),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }

        Wrap => {
            let a = pop(stack)?.i64()?;
            stack.push(Value::I32(a as i32));
        }

        TruncToInt { to, from, signed } => {
            let value = match from {
                F32 => pop(stack)?.f32()? as f64,
                _ => pop(stack)?.f64()?,
            };
            stack.push(trunc_to_int(value, to, signed)?);
        }

        Extend { signed } => {
            let a = pop(stack)?.i32()?;
            let extended = if signed {
                a as i64
            } else {
                a as u32 as i64
            };
            stack.push(Value::I64(extended));
        }

        Convert { to, from, signed } => {
            // the unsigned variants reinterpret the source bits as
            // unsigned magnitude before converting
            let a = pop(stack)?;
            let value = match (to, from, signed) {
                (F32, I32, true) => Value::F32(a.i32()? as f32),
                (F32, I32, false) => Value::F32(a.i32()? as u32 as f32),
                (F32, _, true) => Value::F32(a.i64()? as f32),
                (F32, _, false) => Value::F32(a.i64()? as u64 as f32),
                (F64, I32, true) => Value::F64(a.i32()? as f64),
                (F64, I32, false) => Value::F64(a.i32()? as u32 as f64),
                (F64, _, true) => Value::F64(a.i64()? as f64),
                (F64, _, false) => Value::F64(a.i64()? as u64 as f64),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }

        Demote => {
            let a = pop(stack)?.f64()?;
            stack.push(Value::F32(a as f32));
        }

        Promote => {
            let a = pop(stack)?.f32()?;
            stack.push(Value::F64(a as f64));
        }

        Reinterpret(to) => {
            let a = pop(stack)?;
            let value = match (to, a) {
                (I32, Value::F32(f)) => Value::I32(f.to_bits() as i32),
                (I64, Value::F64(f)) => Value::I64(f.to_bits() as i64),
                (F32, Value::I32(i)) => Value::F32(f32::from_bits(i as u32)),
                (F64, Value::I64(i)) => Value::F64(f64::from_bits(i as u64)),
                _ => return Err(Trap::TypeMismatch),
            };
            stack.push(value);
        }
    }

    Ok(())
}
