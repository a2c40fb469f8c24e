// function.rs - Function body decoder
//
// Decodes one function's locals declaration and instruction stream into a
// visitor call sequence. The decoder carries no semantic state beyond the
// block nesting depth needed to tell an inner END from the one closing the
// body; all type and stack bookkeeping lives in the visitor.

use crate::decoder::{decode_block_type, decode_value_type};
use crate::error::FormatError;
use crate::leb128::ByteReader;
use crate::module::Code;
use crate::opcodes as op;
use crate::types::{FunctionType, Value, ValueType};

/// Receiver for a decoded instruction stream, one method per opcode family.
pub trait CodeVisitor {
    fn visit_function(&mut self, ty: Option<&FunctionType>);
    fn visit_locals(&mut self, locals: &[ValueType]) -> Result<(), FormatError>;
    fn visit_block(&mut self, opcode: u8, block_type: Option<ValueType>)
        -> Result<(), FormatError>;
    fn exit_block(&mut self) -> Result<(), FormatError>;
    fn exit_function(&mut self) -> Result<(), FormatError>;
    fn visit_branch(&mut self, opcode: u8, label: u32) -> Result<(), FormatError>;
    fn visit_table_branch(&mut self, labels: &[u32], default: u32) -> Result<(), FormatError>;
    fn visit_ctrl(&mut self, opcode: u8) -> Result<(), FormatError>;
    fn visit_call(&mut self, opcode: u8, target: u32) -> Result<(), FormatError>;
    fn visit_parametric(&mut self, opcode: u8) -> Result<(), FormatError>;
    fn visit_var(&mut self, opcode: u8, id: u32) -> Result<(), FormatError>;
    fn visit_memory(&mut self, opcode: u8, align: u32, offset: u32) -> Result<(), FormatError>;
    fn visit_const(&mut self, value: Value) -> Result<(), FormatError>;
    fn visit_numeric(&mut self, opcode: u8) -> Result<(), FormatError>;
}

const MAX_LOCALS: u32 = 65536;

/// Decodes one [`Code`] entry against its resolved signature.
pub struct FunctionDecoder<'a> {
    code: ByteReader<'a>,
    ty: FunctionType,
}

impl<'a> FunctionDecoder<'a> {
    pub fn new(code: &'a Code, ty: FunctionType) -> Self {
        FunctionDecoder {
            code: ByteReader::new(&code.body),
            ty,
        }
    }

    pub fn decode(mut self, visitor: &mut impl CodeVisitor) -> Result<(), FormatError> {
        visitor.visit_function(Some(&self.ty));
        let locals = decode_locals(&mut self.code)?;
        visitor.visit_locals(&locals)?;
        decode_expression_inner(&mut self.code, visitor, true)
    }
}

/// The run-length-encoded locals vector, expanded to one entry per slot.
fn decode_locals(r: &mut ByteReader<'_>) -> Result<Vec<ValueType>, FormatError> {
    let runs = r.decode_u32()?;
    let mut locals = Vec::new();
    for _ in 0..runs {
        let count = r.decode_u32()?;
        let ty = decode_value_type(r.read_u8()?)?;
        let total = locals.len() as u64 + count as u64;
        if total > MAX_LOCALS as u64 {
            return Err(FormatError::LimitRange {
                value: total.min(u32::MAX as u64) as u32,
                max: MAX_LOCALS,
            });
        }
        for _ in 0..count {
            locals.push(ty);
        }
    }
    Ok(locals)
}

/// Decode a standalone expression (a global initializer or a segment
/// offset), stopping after the depth-0 END so the caller can keep using
/// the cursor.
pub fn decode_expression(
    r: &mut ByteReader<'_>,
    visitor: &mut impl CodeVisitor,
) -> Result<(), FormatError> {
    decode_expression_inner(r, visitor, false)
}

fn decode_expression_inner(
    r: &mut ByteReader<'_>,
    visitor: &mut impl CodeVisitor,
    function_body: bool,
) -> Result<(), FormatError> {
    let mut block_types: Vec<Option<ValueType>> = Vec::new();

    loop {
        let opcode = r.read_u8()?;
        match opcode {
            op::END => {
                if block_types.pop().is_some() {
                    visitor.exit_block()?;
                } else {
                    if function_body {
                        visitor.exit_function()?;
                    }
                    return Ok(());
                }
            }
            op::UNREACHABLE | op::NOP | op::RETURN => visitor.visit_ctrl(opcode)?,
            op::BLOCK | op::LOOP | op::IF => {
                let block_type = decode_block_type(r)?;
                block_types.push(block_type);
                visitor.visit_block(opcode, block_type)?;
            }
            op::ELSE => {
                let block_type = *block_types
                    .last()
                    .ok_or(FormatError::UnexpectedByte {
                        context: "else outside an if",
                        value: opcode,
                    })?;
                visitor.visit_block(opcode, block_type)?;
            }
            op::BR | op::BR_IF => {
                let target = r.decode_u32()?;
                visitor.visit_branch(opcode, target)?;
            }
            op::BR_TABLE => {
                let count = r.decode_u32()?;
                let mut labels = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    labels.push(r.decode_u32()?);
                }
                let default = r.decode_u32()?;
                visitor.visit_table_branch(&labels, default)?;
            }
            op::CALL => visitor.visit_call(opcode, r.decode_u32()?)?,
            op::CALL_INDIRECT => {
                let target = r.decode_u32()?;
                visitor.visit_call(opcode, target)?;
                r.read_u8()?; // reserved trailing byte
            }
            op::DROP | op::SELECT => visitor.visit_parametric(opcode)?,
            op::LOCAL_GET | op::LOCAL_SET | op::LOCAL_TEE | op::GLOBAL_GET | op::GLOBAL_SET => {
                let id = r.decode_u32()?;
                visitor.visit_var(opcode, id)?;
            }
            op::I32_LOAD..=op::I64_STORE_32 => {
                let align = r.decode_u32()?;
                let offset = r.decode_u32()?;
                visitor.visit_memory(opcode, align, offset)?;
            }
            op::MEMORY_SIZE | op::MEMORY_GROW => {
                visitor.visit_memory(opcode, 0, 0)?;
                r.read_u8()?; // reserved trailing byte
            }
            op::I32_CONST => visitor.visit_const(Value::I32(r.decode_i32()?))?,
            op::I64_CONST => visitor.visit_const(Value::I64(r.decode_i64()?))?,
            op::F32_CONST => visitor.visit_const(Value::F32(r.read_f32()?))?,
            op::F64_CONST => visitor.visit_const(Value::F64(r.read_f64()?))?,
            op::I32_EQZ..=op::F64_REINTERPRET_I64 => visitor.visit_numeric(opcode)?,
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "opcode",
                    value,
                })
            }
        }
    }
}
