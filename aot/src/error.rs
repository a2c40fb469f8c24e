// error.rs - Fault taxonomy
//
// Three non-overlapping fault categories: format faults (decoding a module),
// link faults (instantiating a module), and traps (executing translated
// code). A trap aborts the current invocation only; the instance stays
// usable for future calls.

use thiserror::Error;

/// A malformed module. Always fatal to decoding that module.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic number, is this a wasm module?")]
    BadMagic,

    #[error("unsupported wasm version {0}, only version 1 is supported")]
    UnsupportedVersion(u32),

    #[error("unexpected byte 0x{value:02x} decoding {context}")]
    UnexpectedByte { context: &'static str, value: u8 },

    #[error("unexpected end of input decoding {0}")]
    UnexpectedEof(&'static str),

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("section {id} declared {declared} bytes but decoded {actual}")]
    SectionLength { id: u8, declared: u32, actual: u32 },

    #[error("name is not valid utf-8")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("limit {value} exceeds the valid range {max}")]
    LimitRange { value: u32, max: u32 },

    #[error("limit max {max} is below min {min}")]
    LimitOrder { min: u32, max: u32 },

    #[error("functions returning more than one value are not supported")]
    MultiValue,

    #[error("{context} index {index} is out of range")]
    IndexOutOfRange { context: &'static str, index: u32 },
}

/// An import that could not be satisfied, or a module lifecycle violation.
/// Fatal to the instantiation attempt; the caller may retry with corrected
/// imports.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("missing {kind} import {module}/{name}")]
    MissingImport {
        module: String,
        name: String,
        kind: &'static str,
    },

    #[error("import {module}/{name} requires a {expected} but a {supplied} was supplied")]
    KindMismatch {
        module: String,
        name: String,
        expected: &'static str,
        supplied: &'static str,
    },

    #[error("unknown module {0}")]
    UnknownModule(String),

    #[error("module {0} has already been initialized")]
    AlreadyInitialized(String),
}

/// A runtime fault raised while executing translated code.
#[derive(Debug, Error)]
pub enum Trap {
    #[error("address 0x{addr:08x} is out of bounds (max 0x{max:08x})")]
    Segmentation { addr: u64, max: u64 },

    #[error("cannot set const global")]
    ImmutableGlobal,

    #[error("integer divide by zero")]
    DivideByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid conversion to integer")]
    InvalidConversion,

    #[error("unreachable instruction executed")]
    Unreachable,

    #[error("uninitialized table element {0}")]
    UndefinedElement(u32),

    #[error("call target type mismatch")]
    TypeMismatch,

    #[error("value stack underflow")]
    StackUnderflow,

    #[error("import slot {0} was never bound")]
    UnboundImport(u32),

    #[error("module instance has been dropped")]
    InstanceGone,
}

/// Exceeding a table's configured maximum size. Distinct from [`Trap`]
/// because it signals static misconfiguration by the caller, not a runtime
/// memory fault.
#[derive(Debug, Error)]
#[error("cannot grow table to accommodate {requested}: max size is {max}")]
pub struct LimitError {
    pub requested: u32,
    pub max: u32,
}

/// Umbrella over every fault category, for pipeline-level entry points that
/// can fail in more than one stage.
#[derive(Debug, Error)]
pub enum WasmError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Trap(#[from] Trap),

    #[error(transparent)]
    Limit(#[from] LimitError),
}
