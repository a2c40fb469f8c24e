// emit.rs - Abstract target-code emitter and the threaded-code backend
//
// The translator drives an `Emitter`; any backend (native JIT, managed
// bytecode writer, threaded-code interpreter) can sit behind it. The
// backend shipped here is `CodeBuilder`: it appends resolved ops into a
// flat array, with labels back-patched to op indices when the function is
// finished. The array is executed by `exec`.

use crate::types::{FunctionId, FunctionType, TypeId, Value, ValueType};

/// An opaque jump target handed out by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Arithmetic and conversion primitives, matching the MVP numeric opcode
/// table with shared lowering grouped by operand type. `signed` selects the
/// signed/unsigned integer variant and is ignored for floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericOp {
    Eq(ValueType),
    Ne(ValueType),
    Lt(ValueType, bool),
    Gt(ValueType, bool),
    Le(ValueType, bool),
    Ge(ValueType, bool),

    Clz(ValueType),
    Ctz(ValueType),
    Popcnt(ValueType),
    Add(ValueType),
    Sub(ValueType),
    Mul(ValueType),
    DivInt(ValueType, bool),
    RemInt(ValueType, bool),
    And(ValueType),
    Or(ValueType),
    Xor(ValueType),
    Shl(ValueType),
    Shr(ValueType, bool),
    Rotl(ValueType),
    Rotr(ValueType),

    Abs(ValueType),
    Neg(ValueType),
    Ceil(ValueType),
    Floor(ValueType),
    TruncFloat(ValueType),
    Nearest(ValueType),
    Sqrt(ValueType),
    DivFloat(ValueType),
    Min(ValueType),
    Max(ValueType),
    Copysign(ValueType),

    Wrap,
    TruncToInt {
        to: ValueType,
        from: ValueType,
        signed: bool,
    },
    Extend {
        signed: bool,
    },
    Convert {
        to: ValueType,
        from: ValueType,
        signed: bool,
    },
    Demote,
    Promote,
    Reinterpret(ValueType),
}

/// The capability surface the translator needs from a backend.
pub trait Emitter {
    fn declare_locals(&mut self, locals: &[ValueType]);
    fn new_label(&mut self) -> Label;
    fn place_label(&mut self, label: Label);
    fn jump(&mut self, target: Label);
    /// Pops an i32; jumps when it is nonzero.
    fn jump_if(&mut self, target: Label);
    /// Pops an i32; jumps when it is zero.
    fn jump_if_not(&mut self, target: Label);
    /// Pops an i32 index; dispatches into `targets`, falling back to
    /// `default` for any index outside the table.
    fn jump_table(&mut self, targets: &[Label], default: Label);
    fn push_const(&mut self, value: Value);
    fn local_get(&mut self, slot: u32);
    fn local_set(&mut self, slot: u32);
    fn dup(&mut self);
    fn drop_top(&mut self);
    fn select(&mut self);
    fn numeric(&mut self, op: NumericOp);
    fn load(&mut self, ty: ValueType, width: u8, signed: bool, offset: u32);
    fn store(&mut self, ty: ValueType, width: u8, offset: u32);
    fn memory_size(&mut self);
    fn memory_grow(&mut self);
    fn global_get(&mut self, id: u32);
    fn global_set(&mut self, id: u32);
    fn call(&mut self, target: FunctionId);
    fn call_indirect(&mut self, type_id: TypeId);
    fn ret(&mut self);
    fn trap(&mut self);
}

/// One resolved target op. Jump operands are label ids while a function is
/// being built, and op indices after `CodeBuilder::finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const(Value),
    LocalGet(u32),
    LocalSet(u32),
    Dup,
    Drop,
    Select,
    Numeric(NumericOp),
    Load {
        ty: ValueType,
        width: u8,
        signed: bool,
        offset: u32,
    },
    Store {
        ty: ValueType,
        width: u8,
        offset: u32,
    },
    MemorySize,
    MemoryGrow,
    GlobalGet(u32),
    GlobalSet(u32),
    Call(FunctionId),
    CallIndirect(TypeId),
    Jump(u32),
    JumpIf(u32),
    JumpIfNot(u32),
    JumpTable {
        targets: Box<[u32]>,
        default: u32,
    },
    Return,
    Unreachable,
}

/// One translated function body, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub ty: FunctionType,
    pub locals: Vec<ValueType>,
    pub ops: Vec<Op>,
}

/// Threaded-code emitter.
pub struct CodeBuilder {
    ty: FunctionType,
    locals: Vec<ValueType>,
    ops: Vec<Op>,
    labels: Vec<Option<u32>>,
}

impl CodeBuilder {
    pub fn new(ty: FunctionType) -> Self {
        CodeBuilder {
            ty,
            locals: Vec::new(),
            ops: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Patch label ids to op indices and hand back the finished body.
    pub fn finish(self) -> CompiledFunction {
        let CodeBuilder {
            ty,
            locals,
            ops,
            labels,
        } = self;
        let end = ops.len() as u32;
        let resolve = |label: u32| labels.get(label as usize).copied().flatten().unwrap_or(end);
        let ops = ops
            .into_iter()
            .map(|op| match op {
                Op::Jump(l) => Op::Jump(resolve(l)),
                Op::JumpIf(l) => Op::JumpIf(resolve(l)),
                Op::JumpIfNot(l) => Op::JumpIfNot(resolve(l)),
                Op::JumpTable { targets, default } => Op::JumpTable {
                    targets: targets.iter().map(|&l| resolve(l)).collect(),
                    default: resolve(default),
                },
                other => other,
            })
            .collect();
        CompiledFunction { ty, locals, ops }
    }
}

impl Emitter for CodeBuilder {
    fn declare_locals(&mut self, locals: &[ValueType]) {
        self.locals = locals.to_vec();
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn place_label(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.ops.len() as u32);
    }

    fn jump(&mut self, target: Label) {
        self.ops.push(Op::Jump(target.0));
    }

    fn jump_if(&mut self, target: Label) {
        self.ops.push(Op::JumpIf(target.0));
    }

    fn jump_if_not(&mut self, target: Label) {
        self.ops.push(Op::JumpIfNot(target.0));
    }

    fn jump_table(&mut self, targets: &[Label], default: Label) {
        self.ops.push(Op::JumpTable {
            targets: targets.iter().map(|l| l.0).collect(),
            default: default.0,
        });
    }

    fn push_const(&mut self, value: Value) {
        self.ops.push(Op::Const(value));
    }

    fn local_get(&mut self, slot: u32) {
        self.ops.push(Op::LocalGet(slot));
    }

    fn local_set(&mut self, slot: u32) {
        self.ops.push(Op::LocalSet(slot));
    }

    fn dup(&mut self) {
        self.ops.push(Op::Dup);
    }

    fn drop_top(&mut self) {
        self.ops.push(Op::Drop);
    }

    fn select(&mut self) {
        self.ops.push(Op::Select);
    }

    fn numeric(&mut self, op: NumericOp) {
        self.ops.push(Op::Numeric(op));
    }

    fn load(&mut self, ty: ValueType, width: u8, signed: bool, offset: u32) {
        self.ops.push(Op::Load {
            ty,
            width,
            signed,
            offset,
        });
    }

    fn store(&mut self, ty: ValueType, width: u8, offset: u32) {
        self.ops.push(Op::Store { ty, width, offset });
    }

    fn memory_size(&mut self) {
        self.ops.push(Op::MemorySize);
    }

    fn memory_grow(&mut self) {
        self.ops.push(Op::MemoryGrow);
    }

    fn global_get(&mut self, id: u32) {
        self.ops.push(Op::GlobalGet(id));
    }

    fn global_set(&mut self, id: u32) {
        self.ops.push(Op::GlobalSet(id));
    }

    fn call(&mut self, target: FunctionId) {
        self.ops.push(Op::Call(target));
    }

    fn call_indirect(&mut self, type_id: TypeId) {
        self.ops.push(Op::CallIndirect(type_id));
    }

    fn ret(&mut self) {
        self.ops.push(Op::Return);
    }

    fn trap(&mut self) {
        self.ops.push(Op::Unreachable);
    }
}
