// wasm2rt - WebAssembly module loader and AOT translator
//
// Parses the wasm 1.0 binary format, reconstructs per-function control
// flow and type information, and translates every function ahead of time
// into a linkable artifact that can be instantiated with caller-supplied
// imports and invoked through exported entry points.
//
// # Architecture
//
// The pipeline works in several phases:
//
// 1. **Decoding** (`leb128.rs`, `decoder.rs`): parse the module header and
//    the eleven section kinds into a `BinaryModule`
// 2. **Body decoding** (`function.rs`): stream one function's locals and
//    instructions into a `CodeVisitor`
// 3. **Translation** (`translate.rs`): resolve structured control flow to
//    jumps and lower every opcode through an abstract `Emitter`
// 4. **Emission** (`emit.rs`): the threaded-code backend materializes each
//    body as a flat op array, executed by `exec.rs`
// 5. **Linking** (`context.rs`, `instance.rs`): resolve imports, run
//    initializers, and expose exports by name
//
// The runtime model (`memory.rs`, `table.rs`, `global.rs`) backs each
// instance with growable bounds-checked storage.

pub mod compile;
pub mod config;
pub mod context;
pub mod decoder;
pub mod emit;
pub mod error;
pub mod exec;
pub mod function;
pub mod global;
pub mod instance;
pub mod leb128;
pub mod memory;
pub mod module;
pub mod opcodes;
pub mod table;
pub mod translate;
pub mod types;

pub use compile::CompiledModule;
pub use config::WasmConfig;
pub use context::{Imports, WasmContext};
pub use error::{FormatError, LimitError, LinkError, Trap, WasmError};
pub use global::Global;
pub use instance::Instance;
pub use memory::{AllocationMode, Memory, PAGE_SIZE};
pub use module::BinaryModule;
pub use table::{FuncRef, Table};
pub use types::{FunctionId, FunctionType, Limits, Mutability, Value, ValueType};

use std::sync::Arc;

/// Decode and translate a standalone module, without registering it in a
/// context.
pub fn compile(name: &str, wasm: &[u8]) -> Result<CompiledModule, FormatError> {
    let binary = Arc::new(decoder::ModuleDecoder::new(wasm).decode_module(name)?);
    compile::compile_module(&binary)
}
