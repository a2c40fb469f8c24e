// translate.rs - Instruction-to-target translation
//
// Implements CodeVisitor and lowers the implicit structured-stack-machine
// semantics of the instruction stream onto an abstract emitter. State is an
// operand-type stack (types only, never values) and a block stack whose
// frames record enough to resolve relative branch labels and to unwind the
// operand stack at block exits.

use crate::compile::FunctionInfo;
use crate::emit::{Emitter, Label, NumericOp};
use crate::error::FormatError;
use crate::function::CodeVisitor;
use crate::module::BinaryModule;
use crate::opcodes as op;
use crate::types::{FunctionId, FunctionType, GlobalType, TypeId, Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Block,
    Loop,
    If,
}

struct BlockInfo {
    kind: BlockKind,
    /// Operand stack depth at block entry (after the `if` condition pop).
    stack_depth: usize,
    result: Option<ValueType>,
    /// For loops this is placed at entry (branches continue); for blocks
    /// and ifs it is placed at the END (branches break).
    label: Label,
    /// Where the false edge of an `if` lands until the else arm (or the
    /// END, when there is none) claims it.
    else_label: Option<Label>,
}

pub struct Translator<'m, E: Emitter> {
    module: &'m BinaryModule,
    functions: &'m [FunctionInfo],
    globals: &'m [GlobalType],
    emitter: E,
    signature: Option<FunctionType>,
    locals: Vec<ValueType>,
    operands: Vec<ValueType>,
    blocks: Vec<BlockInfo>,
    return_label: Option<Label>,
}

impl<'m, E: Emitter> Translator<'m, E> {
    pub fn new(
        module: &'m BinaryModule,
        functions: &'m [FunctionInfo],
        globals: &'m [GlobalType],
        emitter: E,
    ) -> Self {
        Translator {
            module,
            functions,
            globals,
            emitter,
            signature: None,
            locals: Vec::new(),
            operands: Vec::new(),
            blocks: Vec::new(),
            return_label: None,
        }
    }

    pub fn into_emitter(self) -> E {
        self.emitter
    }

    fn push(&mut self, ty: ValueType) {
        self.operands.push(ty);
    }

    /// Pops the abstract stack. Code after an unconditional branch is
    /// decoded but unreachable, so an empty stack here is stack
    /// polymorphism, not an error.
    fn pop(&mut self) -> ValueType {
        self.operands.pop().unwrap_or(ValueType::I32)
    }

    fn param_or_local(&self, id: u32) -> Result<ValueType, FormatError> {
        let params = self
            .signature
            .as_ref()
            .map(|s| s.params.as_slice())
            .unwrap_or(&[]);
        if let Some(ty) = params.get(id as usize) {
            return Ok(*ty);
        }
        self.locals
            .get(id as usize - params.len())
            .copied()
            .ok_or(FormatError::IndexOutOfRange {
                context: "local",
                index: id,
            })
    }

    /// Resolve a relative label: 0 names the innermost enclosing block,
    /// and an index equal to the block depth names the function body
    /// itself (a branch there is a return).
    fn jump_target(&mut self, label: u32) -> Result<Label, FormatError> {
        let depth = self.blocks.len();
        match (label as usize).cmp(&depth) {
            std::cmp::Ordering::Less => Ok(self.blocks[depth - 1 - label as usize].label),
            std::cmp::Ordering::Equal => Ok(match self.return_label {
                Some(l) => l,
                None => {
                    let l = self.emitter.new_label();
                    self.return_label = Some(l);
                    l
                }
            }),
            std::cmp::Ordering::Greater => Err(FormatError::IndexOutOfRange {
                context: "branch label",
                index: label,
            }),
        }
    }

    /// Discard abstract operands pushed inside a block beyond its declared
    /// result — the stack-polymorphism rule at block boundaries. This only
    /// truncates the type stack; no pops are emitted, since a block END is
    /// a merge point that branches reach with the unwound stack shape
    /// already.
    fn unwind_to(&mut self, depth: usize, result: Option<ValueType>) {
        self.operands.truncate(depth);
        if let Some(ty) = result {
            self.operands.push(ty);
        }
    }

    // Shared numeric lowering helpers.

    fn compare(&mut self, op: NumericOp) {
        self.emitter.numeric(op);
        self.pop();
        self.pop();
        self.push(ValueType::I32);
    }

    /// `eqz` is "compare with the zero of the same width", not a dedicated
    /// primitive.
    fn test_zero(&mut self, ty: ValueType) {
        self.emitter.push_const(ty.zero());
        self.push(ty);
        self.compare(NumericOp::Eq(ty));
    }

    fn binary(&mut self, op: NumericOp, ty: ValueType) {
        self.emitter.numeric(op);
        self.pop();
        self.pop();
        self.push(ty);
    }

    fn unary(&mut self, op: NumericOp, result: ValueType) {
        self.emitter.numeric(op);
        self.pop();
        self.push(result);
    }

    fn make_load(&mut self, ty: ValueType, width: u8, signed: bool, offset: u32) {
        self.pop(); // base address
        self.push(ty);
        self.emitter.load(ty, width, signed, offset);
    }

    fn make_store(&mut self, ty: ValueType, width: u8, offset: u32) {
        self.pop(); // value
        self.pop(); // base address
        self.emitter.store(ty, width, offset);
    }
}

impl<'m, E: Emitter> CodeVisitor for Translator<'m, E> {
    fn visit_function(&mut self, ty: Option<&FunctionType>) {
        self.signature = ty.cloned();
    }

    fn visit_locals(&mut self, locals: &[ValueType]) -> Result<(), FormatError> {
        self.locals = locals.to_vec();
        self.emitter.declare_locals(locals);
        Ok(())
    }

    fn visit_block(
        &mut self,
        opcode: u8,
        block_type: Option<ValueType>,
    ) -> Result<(), FormatError> {
        match opcode {
            op::BLOCK => {
                let label = self.emitter.new_label();
                self.blocks.push(BlockInfo {
                    kind: BlockKind::Block,
                    stack_depth: self.operands.len(),
                    result: block_type,
                    label,
                    else_label: None,
                });
            }
            op::LOOP => {
                let label = self.emitter.new_label();
                self.emitter.place_label(label);
                self.blocks.push(BlockInfo {
                    kind: BlockKind::Loop,
                    stack_depth: self.operands.len(),
                    result: block_type,
                    label,
                    else_label: None,
                });
            }
            op::IF => {
                self.pop(); // condition
                let label = self.emitter.new_label();
                let else_label = self.emitter.new_label();
                self.emitter.jump_if_not(else_label);
                self.blocks.push(BlockInfo {
                    kind: BlockKind::If,
                    stack_depth: self.operands.len(),
                    result: block_type,
                    label,
                    else_label: Some(else_label),
                });
            }
            op::ELSE => {
                let frame = self.blocks.last_mut().ok_or(FormatError::UnexpectedByte {
                    context: "else outside an if",
                    value: opcode,
                })?;
                let end = frame.label;
                let else_label = frame.else_label.take();
                let depth = frame.stack_depth;
                // close the then arm and land the false edge here
                self.emitter.jump(end);
                if let Some(l) = else_label {
                    self.emitter.place_label(l);
                }
                self.operands.truncate(depth);
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "block opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn exit_block(&mut self) -> Result<(), FormatError> {
        let frame = self.blocks.pop().ok_or(FormatError::UnexpectedByte {
            context: "end outside a block",
            value: op::END,
        })?;
        match frame.kind {
            BlockKind::Block | BlockKind::If => {
                // an if with no else arm parks its false edge at the end
                if let Some(l) = frame.else_label {
                    self.emitter.place_label(l);
                }
                self.emitter.place_label(frame.label);
            }
            BlockKind::Loop => {}
        }
        self.unwind_to(frame.stack_depth, frame.result);
        Ok(())
    }

    fn exit_function(&mut self) -> Result<(), FormatError> {
        if let Some(l) = self.return_label {
            self.emitter.place_label(l);
        }
        self.emitter.ret();
        Ok(())
    }

    fn visit_branch(&mut self, opcode: u8, label: u32) -> Result<(), FormatError> {
        let target = self.jump_target(label)?;
        match opcode {
            op::BR => self.emitter.jump(target),
            op::BR_IF => {
                self.pop();
                self.emitter.jump_if(target);
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "branch opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_table_branch(&mut self, labels: &[u32], default: u32) -> Result<(), FormatError> {
        let mut targets = Vec::with_capacity(labels.len());
        for &label in labels {
            targets.push(self.jump_target(label)?);
        }
        let default = self.jump_target(default)?;
        self.pop(); // dispatch index
        self.emitter.jump_table(&targets, default);
        Ok(())
    }

    fn visit_ctrl(&mut self, opcode: u8) -> Result<(), FormatError> {
        match opcode {
            op::NOP => {}
            op::UNREACHABLE => self.emitter.trap(),
            op::RETURN => self.emitter.ret(),
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "control opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_call(&mut self, opcode: u8, target: u32) -> Result<(), FormatError> {
        match opcode {
            op::CALL => {
                let info =
                    self.functions
                        .get(target as usize)
                        .ok_or(FormatError::IndexOutOfRange {
                            context: "function",
                            index: target,
                        })?;
                for _ in 0..info.ty.params.len() {
                    self.pop();
                }
                if let Some(r) = info.ty.return_type() {
                    self.push(r);
                }
                self.emitter.call(FunctionId {
                    id: target,
                    imported: info.imported,
                });
            }
            op::CALL_INDIRECT => {
                let ty = self
                    .module
                    .type_section
                    .get(target as usize)
                    .ok_or(FormatError::IndexOutOfRange {
                        context: "type",
                        index: target,
                    })?
                    .clone();
                self.pop(); // table index
                for _ in 0..ty.params.len() {
                    self.pop();
                }
                if let Some(r) = ty.return_type() {
                    self.push(r);
                }
                self.emitter.call_indirect(TypeId(target));
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "call opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_parametric(&mut self, opcode: u8) -> Result<(), FormatError> {
        match opcode {
            op::DROP => {
                self.pop();
                self.emitter.drop_top();
            }
            op::SELECT => {
                self.pop(); // condition
                self.pop();
                let ty = self.pop();
                self.push(ty);
                self.emitter.select();
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "parametric opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_var(&mut self, opcode: u8, id: u32) -> Result<(), FormatError> {
        match opcode {
            op::LOCAL_GET => {
                let ty = self.param_or_local(id)?;
                self.push(ty);
                self.emitter.local_get(id);
            }
            op::LOCAL_SET => {
                self.param_or_local(id)?;
                self.pop();
                self.emitter.local_set(id);
            }
            op::LOCAL_TEE => {
                self.param_or_local(id)?;
                self.emitter.dup();
                self.emitter.local_set(id);
            }
            op::GLOBAL_GET => {
                let ty = self
                    .globals
                    .get(id as usize)
                    .ok_or(FormatError::IndexOutOfRange {
                        context: "global",
                        index: id,
                    })?
                    .value_type;
                self.push(ty);
                self.emitter.global_get(id);
            }
            op::GLOBAL_SET => {
                if self.globals.get(id as usize).is_none() {
                    return Err(FormatError::IndexOutOfRange {
                        context: "global",
                        index: id,
                    });
                }
                self.pop();
                self.emitter.global_set(id);
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "variable opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_memory(&mut self, opcode: u8, _align: u32, offset: u32) -> Result<(), FormatError> {
        use ValueType::*;
        match opcode {
            op::I32_LOAD => self.make_load(I32, 32, true, offset),
            op::I64_LOAD => self.make_load(I64, 64, true, offset),
            op::F32_LOAD => self.make_load(F32, 32, true, offset),
            op::F64_LOAD => self.make_load(F64, 64, true, offset),
            op::I32_LOAD_8_S => self.make_load(I32, 8, true, offset),
            op::I32_LOAD_8_U => self.make_load(I32, 8, false, offset),
            op::I32_LOAD_16_S => self.make_load(I32, 16, true, offset),
            op::I32_LOAD_16_U => self.make_load(I32, 16, false, offset),
            op::I64_LOAD_8_S => self.make_load(I64, 8, true, offset),
            op::I64_LOAD_8_U => self.make_load(I64, 8, false, offset),
            op::I64_LOAD_16_S => self.make_load(I64, 16, true, offset),
            op::I64_LOAD_16_U => self.make_load(I64, 16, false, offset),
            op::I64_LOAD_32_S => self.make_load(I64, 32, true, offset),
            op::I64_LOAD_32_U => self.make_load(I64, 32, false, offset),
            op::I32_STORE => self.make_store(I32, 32, offset),
            op::I64_STORE => self.make_store(I64, 64, offset),
            op::F32_STORE => self.make_store(F32, 32, offset),
            op::F64_STORE => self.make_store(F64, 64, offset),
            op::I32_STORE_8 => self.make_store(I32, 8, offset),
            op::I32_STORE_16 => self.make_store(I32, 16, offset),
            op::I64_STORE_8 => self.make_store(I64, 8, offset),
            op::I64_STORE_16 => self.make_store(I64, 16, offset),
            op::I64_STORE_32 => self.make_store(I64, 32, offset),
            op::MEMORY_SIZE => {
                self.push(I32);
                self.emitter.memory_size();
            }
            op::MEMORY_GROW => {
                self.pop();
                self.push(I32);
                self.emitter.memory_grow();
            }
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "memory opcode",
                    value,
                })
            }
        }
        Ok(())
    }

    fn visit_const(&mut self, value: Value) -> Result<(), FormatError> {
        self.push(value.ty());
        self.emitter.push_const(value);
        Ok(())
    }

    fn visit_numeric(&mut self, opcode: u8) -> Result<(), FormatError> {
        use NumericOp::*;
        use ValueType::*;
        match opcode {
            // i32 tests & comparisons
            op::I32_EQZ => self.test_zero(I32),
            op::I32_EQ => self.compare(Eq(I32)),
            op::I32_NE => self.compare(Ne(I32)),
            op::I32_LT_S => self.compare(Lt(I32, true)),
            op::I32_LT_U => self.compare(Lt(I32, false)),
            op::I32_GT_S => self.compare(Gt(I32, true)),
            op::I32_GT_U => self.compare(Gt(I32, false)),
            op::I32_LE_S => self.compare(Le(I32, true)),
            op::I32_LE_U => self.compare(Le(I32, false)),
            op::I32_GE_S => self.compare(Ge(I32, true)),
            op::I32_GE_U => self.compare(Ge(I32, false)),

            // i64 tests & comparisons
            op::I64_EQZ => self.test_zero(I64),
            op::I64_EQ => self.compare(Eq(I64)),
            op::I64_NE => self.compare(Ne(I64)),
            op::I64_LT_S => self.compare(Lt(I64, true)),
            op::I64_LT_U => self.compare(Lt(I64, false)),
            op::I64_GT_S => self.compare(Gt(I64, true)),
            op::I64_GT_U => self.compare(Gt(I64, false)),
            op::I64_LE_S => self.compare(Le(I64, true)),
            op::I64_LE_U => self.compare(Le(I64, false)),
            op::I64_GE_S => self.compare(Ge(I64, true)),
            op::I64_GE_U => self.compare(Ge(I64, false)),

            // float comparisons
            op::F32_EQ => self.compare(Eq(F32)),
            op::F32_NE => self.compare(Ne(F32)),
            op::F32_LT => self.compare(Lt(F32, true)),
            op::F32_GT => self.compare(Gt(F32, true)),
            op::F32_LE => self.compare(Le(F32, true)),
            op::F32_GE => self.compare(Ge(F32, true)),
            op::F64_EQ => self.compare(Eq(F64)),
            op::F64_NE => self.compare(Ne(F64)),
            op::F64_LT => self.compare(Lt(F64, true)),
            op::F64_GT => self.compare(Gt(F64, true)),
            op::F64_LE => self.compare(Le(F64, true)),
            op::F64_GE => self.compare(Ge(F64, true)),

            // i32 math
            op::I32_CLZ => self.unary(Clz(I32), I32),
            op::I32_CTZ => self.unary(Ctz(I32), I32),
            op::I32_POPCNT => self.unary(Popcnt(I32), I32),
            op::I32_ADD => self.binary(Add(I32), I32),
            op::I32_SUB => self.binary(Sub(I32), I32),
            op::I32_MUL => self.binary(Mul(I32), I32),
            op::I32_DIV_S => self.binary(DivInt(I32, true), I32),
            op::I32_DIV_U => self.binary(DivInt(I32, false), I32),
            op::I32_REM_S => self.binary(RemInt(I32, true), I32),
            op::I32_REM_U => self.binary(RemInt(I32, false), I32),
            op::I32_AND => self.binary(And(I32), I32),
            op::I32_OR => self.binary(Or(I32), I32),
            op::I32_XOR => self.binary(Xor(I32), I32),
            op::I32_SHL => self.binary(Shl(I32), I32),
            op::I32_SHR_S => self.binary(Shr(I32, true), I32),
            op::I32_SHR_U => self.binary(Shr(I32, false), I32),
            op::I32_ROTL => self.binary(Rotl(I32), I32),
            op::I32_ROTR => self.binary(Rotr(I32), I32),

            // i64 math
            op::I64_CLZ => self.unary(Clz(I64), I64),
            op::I64_CTZ => self.unary(Ctz(I64), I64),
            op::I64_POPCNT => self.unary(Popcnt(I64), I64),
            op::I64_ADD => self.binary(Add(I64), I64),
            op::I64_SUB => self.binary(Sub(I64), I64),
            op::I64_MUL => self.binary(Mul(I64), I64),
            op::I64_DIV_S => self.binary(DivInt(I64, true), I64),
            op::I64_DIV_U => self.binary(DivInt(I64, false), I64),
            op::I64_REM_S => self.binary(RemInt(I64, true), I64),
            op::I64_REM_U => self.binary(RemInt(I64, false), I64),
            op::I64_AND => self.binary(And(I64), I64),
            op::I64_OR => self.binary(Or(I64), I64),
            op::I64_XOR => self.binary(Xor(I64), I64),
            op::I64_SHL => self.binary(Shl(I64), I64),
            op::I64_SHR_S => self.binary(Shr(I64, true), I64),
            op::I64_SHR_U => self.binary(Shr(I64, false), I64),
            op::I64_ROTL => self.binary(Rotl(I64), I64),
            op::I64_ROTR => self.binary(Rotr(I64), I64),

            // f32 math; unary float ops leave the stack shape unchanged
            op::F32_ABS => self.emitter.numeric(Abs(F32)),
            op::F32_NEG => self.emitter.numeric(Neg(F32)),
            op::F32_CEIL => self.emitter.numeric(Ceil(F32)),
            op::F32_FLOOR => self.emitter.numeric(Floor(F32)),
            op::F32_TRUNC => self.emitter.numeric(TruncFloat(F32)),
            op::F32_NEAREST => self.emitter.numeric(Nearest(F32)),
            op::F32_SQRT => self.emitter.numeric(Sqrt(F32)),
            op::F32_ADD => self.binary(Add(F32), F32),
            op::F32_SUB => self.binary(Sub(F32), F32),
            op::F32_MUL => self.binary(Mul(F32), F32),
            op::F32_DIV => self.binary(DivFloat(F32), F32),
            op::F32_MIN => self.binary(Min(F32), F32),
            op::F32_MAX => self.binary(Max(F32), F32),
            op::F32_COPYSIGN => self.binary(Copysign(F32), F32),

            // f64 math
            op::F64_ABS => self.emitter.numeric(Abs(F64)),
            op::F64_NEG => self.emitter.numeric(Neg(F64)),
            op::F64_CEIL => self.emitter.numeric(Ceil(F64)),
            op::F64_FLOOR => self.emitter.numeric(Floor(F64)),
            op::F64_TRUNC => self.emitter.numeric(TruncFloat(F64)),
            op::F64_NEAREST => self.emitter.numeric(Nearest(F64)),
            op::F64_SQRT => self.emitter.numeric(Sqrt(F64)),
            op::F64_ADD => self.binary(Add(F64), F64),
            op::F64_SUB => self.binary(Sub(F64), F64),
            op::F64_MUL => self.binary(Mul(F64), F64),
            op::F64_DIV => self.binary(DivFloat(F64), F64),
            op::F64_MIN => self.binary(Min(F64), F64),
            op::F64_MAX => self.binary(Max(F64), F64),
            op::F64_COPYSIGN => self.binary(Copysign(F64), F64),

            // conversions
            op::I32_WRAP_I64 => self.unary(Wrap, I32),
            op::I32_TRUNC_F32_S => self.unary(TruncToInt { to: I32, from: F32, signed: true }, I32),
            op::I32_TRUNC_F32_U => {
                self.unary(TruncToInt { to: I32, from: F32, signed: false }, I32)
            }
            op::I32_TRUNC_F64_S => self.unary(TruncToInt { to: I32, from: F64, signed: true }, I32),
            op::I32_TRUNC_F64_U => {
                self.unary(TruncToInt { to: I32, from: F64, signed: false }, I32)
            }
            op::I64_EXTEND_I32_S => self.unary(Extend { signed: true }, I64),
            op::I64_EXTEND_I32_U => self.unary(Extend { signed: false }, I64),
            op::I64_TRUNC_F32_S => self.unary(TruncToInt { to: I64, from: F32, signed: true }, I64),
            op::I64_TRUNC_F32_U => {
                self.unary(TruncToInt { to: I64, from: F32, signed: false }, I64)
            }
            op::I64_TRUNC_F64_S => self.unary(TruncToInt { to: I64, from: F64, signed: true }, I64),
            op::I64_TRUNC_F64_U => {
                self.unary(TruncToInt { to: I64, from: F64, signed: false }, I64)
            }
            op::F32_CONVERT_I32_S => self.unary(Convert { to: F32, from: I32, signed: true }, F32),
            op::F32_CONVERT_I32_U => {
                self.unary(Convert { to: F32, from: I32, signed: false }, F32)
            }
            op::F32_CONVERT_I64_S => self.unary(Convert { to: F32, from: I64, signed: true }, F32),
            op::F32_CONVERT_I64_U => {
                self.unary(Convert { to: F32, from: I64, signed: false }, F32)
            }
            op::F32_DEMOTE_F64 => self.unary(Demote, F32),
            op::F64_CONVERT_I32_S => self.unary(Convert { to: F64, from: I32, signed: true }, F64),
            op::F64_CONVERT_I32_U => {
                self.unary(Convert { to: F64, from: I32, signed: false }, F64)
            }
            op::F64_CONVERT_I64_S => self.unary(Convert { to: F64, from: I64, signed: true }, F64),
            op::F64_CONVERT_I64_U => {
                self.unary(Convert { to: F64, from: I64, signed: false }, F64)
            }
            op::F64_PROMOTE_F32 => self.unary(Promote, F64),
            op::I32_REINTERPRET_F32 => self.unary(Reinterpret(I32), I32),
            op::I64_REINTERPRET_F64 => self.unary(Reinterpret(I64), I64),
            op::F32_REINTERPRET_I32 => self.unary(Reinterpret(F32), F32),
            op::F64_REINTERPRET_I64 => self.unary(Reinterpret(F64), F64),

            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "numeric opcode",
                    value,
                })
            }
        }
        Ok(())
    }
}
