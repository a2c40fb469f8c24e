// decoder.rs - Binary module decoder
//
// State machine over section ids 0-11. Every standard section is
// length-prefixed and must decode to exactly its declared length; custom
// sections are preserved opaquely. Global, element, and data section
// payloads are kept raw for lazy decoding at compile time.

use crate::error::FormatError;
use crate::leb128::ByteReader;
use crate::module::{
    BinaryModule, Code, CustomSection, Export, ExportKind, Import, ImportKind,
};
use crate::types::{
    FunctionId, FunctionType, GlobalType, Limits, MemoryType, Mutability, TableType, TypeId,
    ValueType,
};

pub const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
pub const VERSION: u32 = 1;

/// Decode a value type tag.
pub(crate) fn decode_value_type(value: u8) -> Result<ValueType, FormatError> {
    match value {
        0x7F => Ok(ValueType::I32),
        0x7E => Ok(ValueType::I64),
        0x7D => Ok(ValueType::F32),
        0x7C => Ok(ValueType::F64),
        _ => Err(FormatError::UnexpectedByte {
            context: "value type",
            value,
        }),
    }
}

/// Decode a block result type: 0x40 marks an empty result.
pub(crate) fn decode_block_type(r: &mut ByteReader<'_>) -> Result<Option<ValueType>, FormatError> {
    let value = r.read_u8()?;
    match value {
        0x40 => Ok(None),
        _ => decode_value_type(value).map(Some),
    }
}

pub(crate) fn decode_limits(r: &mut ByteReader<'_>) -> Result<Limits, FormatError> {
    let flag = r.read_u8()?;
    let limits = match flag {
        0x00 => Limits::new(r.decode_u32()?, None),
        0x01 => {
            let min = r.decode_u32()?;
            let max = r.decode_u32()?;
            Limits::new(min, Some(max))
        }
        value => {
            return Err(FormatError::UnexpectedByte {
                context: "limit flag",
                value,
            })
        }
    };
    limits.validate()?;
    Ok(limits)
}

pub(crate) fn decode_mutability(r: &mut ByteReader<'_>) -> Result<Mutability, FormatError> {
    match r.read_u8()? {
        0x00 => Ok(Mutability::Const),
        0x01 => Ok(Mutability::Var),
        value => Err(FormatError::UnexpectedByte {
            context: "mutability flag",
            value,
        }),
    }
}

pub(crate) fn decode_global_type(r: &mut ByteReader<'_>) -> Result<GlobalType, FormatError> {
    let value_type = decode_value_type(r.read_u8()?)?;
    let mutability = decode_mutability(r)?;
    Ok(GlobalType {
        value_type,
        mutability,
    })
}

fn decode_table_type(r: &mut ByteReader<'_>) -> Result<TableType, FormatError> {
    match r.read_u8()? {
        0x70 => Ok(TableType {
            limits: decode_limits(r)?,
        }),
        value => Err(FormatError::UnexpectedByte {
            context: "table element type",
            value,
        }),
    }
}

fn decode_memory_type(r: &mut ByteReader<'_>) -> Result<MemoryType, FormatError> {
    Ok(MemoryType {
        limits: decode_limits(r)?,
    })
}

/// Parses one wasm binary into a [`BinaryModule`].
pub struct ModuleDecoder<'a> {
    r: ByteReader<'a>,
}

impl<'a> ModuleDecoder<'a> {
    pub fn new(wasm: &'a [u8]) -> Self {
        ModuleDecoder {
            r: ByteReader::new(wasm),
        }
    }

    /// Check the magic number and version.
    fn begin(&mut self) -> Result<(), FormatError> {
        let magic = self.r.read_bytes(4)?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version_bytes = self.r.read_bytes(4)?;
        let version = u32::from_le_bytes([
            version_bytes[0],
            version_bytes[1],
            version_bytes[2],
            version_bytes[3],
        ]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        Ok(())
    }

    pub fn decode_module(mut self, name: &str) -> Result<BinaryModule, FormatError> {
        self.begin()?;

        let mut module = BinaryModule::new(name);
        while self.r.has_remaining() {
            let id = self.r.read_u8()?;
            let size = self.r.decode_u32()?;
            let start = self.r.pos();
            log::trace!("module {name}: section {id} ({size} bytes)");

            match id {
                0 => {
                    let section = self.decode_custom_section(size)?;
                    module.custom_sections.push(section);
                }
                1 => module.type_section = self.decode_vec(Self::decode_function_type)?,
                2 => module.import_section = self.decode_vec(Self::decode_import)?,
                3 => {
                    module.function_section =
                        self.decode_vec(|d| d.r.decode_u32().map(TypeId))?
                }
                4 => module.table_section = self.decode_vec(|d| decode_table_type(&mut d.r))?,
                5 => module.memory_section = self.decode_vec(|d| decode_memory_type(&mut d.r))?,
                6 => module.global_section = self.r.read_bytes(size as usize)?.to_vec(),
                7 => module.export_section = self.decode_vec(Self::decode_export)?,
                8 => {
                    let index = self.r.decode_u32()?;
                    let imported = index < module.imported_function_count();
                    module.start = Some(FunctionId {
                        id: index,
                        imported,
                    });
                }
                9 => module.element_section = self.r.read_bytes(size as usize)?.to_vec(),
                10 => module.code_section = self.decode_vec(Self::decode_code)?,
                11 => module.data_section = self.r.read_bytes(size as usize)?.to_vec(),
                value => {
                    return Err(FormatError::UnexpectedByte {
                        context: "module section",
                        value,
                    })
                }
            }

            let consumed = (self.r.pos() - start) as u32;
            if consumed != size {
                return Err(FormatError::SectionLength {
                    id,
                    declared: size,
                    actual: consumed,
                });
            }
        }

        Ok(module)
    }

    /// Shared vector combinator: a u32 count followed by that many
    /// homogeneous elements.
    fn decode_vec<T>(
        &mut self,
        decode: impl Fn(&mut Self) -> Result<T, FormatError>,
    ) -> Result<Vec<T>, FormatError> {
        let count = self.r.decode_u32()?;
        let mut items = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            items.push(decode(self)?);
        }
        Ok(items)
    }

    fn decode_name(&mut self) -> Result<String, FormatError> {
        let len = self.r.decode_u32()?;
        let bytes = self.r.read_bytes(len as usize)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn decode_custom_section(&mut self, size: u32) -> Result<CustomSection, FormatError> {
        let start = self.r.pos();
        let name = self.decode_name()?;
        let name_bytes = (self.r.pos() - start) as u32;
        let payload_len = size
            .checked_sub(name_bytes)
            .ok_or(FormatError::UnexpectedEof("custom section"))?;
        let payload = self.r.read_bytes(payload_len as usize)?.to_vec();
        Ok(CustomSection { name, payload })
    }

    fn decode_function_type(&mut self) -> Result<FunctionType, FormatError> {
        match self.r.read_u8()? {
            0x60 => {
                let params = self.decode_vec(|d| decode_value_type(d.r.read_u8()?))?;
                let results = self.decode_vec(|d| decode_value_type(d.r.read_u8()?))?;
                if results.len() > 1 {
                    return Err(FormatError::MultiValue);
                }
                Ok(FunctionType::new(params, results))
            }
            value => Err(FormatError::UnexpectedByte {
                context: "function type",
                value,
            }),
        }
    }

    fn decode_import(&mut self) -> Result<Import, FormatError> {
        let module = self.decode_name()?;
        let name = self.decode_name()?;
        let kind = match self.r.read_u8()? {
            0x00 => ImportKind::Function(TypeId(self.r.decode_u32()?)),
            0x01 => ImportKind::Table(decode_table_type(&mut self.r)?),
            0x02 => ImportKind::Memory(decode_memory_type(&mut self.r)?),
            0x03 => ImportKind::Global(decode_global_type(&mut self.r)?),
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "import descriptor",
                    value,
                })
            }
        };
        Ok(Import { module, name, kind })
    }

    fn decode_export(&mut self) -> Result<Export, FormatError> {
        let name = self.decode_name()?;
        let kind = match self.r.read_u8()? {
            0x00 => ExportKind::Function(self.r.decode_u32()?),
            0x01 => ExportKind::Table(self.r.decode_u32()?),
            0x02 => ExportKind::Memory(self.r.decode_u32()?),
            0x03 => ExportKind::Global(self.r.decode_u32()?),
            value => {
                return Err(FormatError::UnexpectedByte {
                    context: "export descriptor",
                    value,
                })
            }
        };
        Ok(Export { name, kind })
    }

    fn decode_code(&mut self) -> Result<Code, FormatError> {
        let size = self.r.decode_u32()?;
        let body = self.r.read_bytes(size as usize)?.to_vec();
        Ok(Code { body })
    }
}
