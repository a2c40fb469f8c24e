// End-to-end pipeline tests: modules are assembled with wasm-encoder,
// then fed through decode -> translate -> instantiate -> invoke.

mod common;

use std::borrow::Cow;
use std::sync::Arc;

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, ImportSection, Instruction, MemArg, MemorySection, MemoryType,
    Module, RawSection, RefType, StartSection, TableSection, TableType, TypeSection, ValType,
};

use wasm2rt::{
    AllocationMode, FuncRef, FunctionType, Global, Imports, Limits, LinkError, Memory, Trap,
    Value, ValueType, WasmConfig, WasmContext, WasmError,
};

fn mem_arg(offset: u64, align: u32) -> MemArg {
    MemArg {
        offset,
        align,
        memory_index: 0,
    }
}

fn instantiate(name: &str, wasm: &[u8], imports: &Imports) -> (WasmContext, Arc<wasm2rt::Instance>) {
    let ctx = WasmContext::new();
    ctx.load_binary(name, wasm).expect("decode");
    let instance = ctx.instantiate(name, imports).expect("instantiate");
    (ctx, instance)
}

fn call(instance: &Arc<wasm2rt::Instance>, name: &str, args: &[Value]) -> Option<Value> {
    instance
        .exported_function(name)
        .expect("export")
        .call(args)
        .expect("call")
}

#[test]
fn scenario_a_add() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("add", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (ctx, _instance) = instantiate("add", &module.finish(), &Imports::new());
    let handle = ctx.get_exported_function("add", "add").expect("export");
    assert_eq!(
        handle.call(&[Value::I32(4), Value::I32(3)]).unwrap(),
        Some(Value::I32(7))
    );
}

#[test]
fn scenario_b_mutable_global_counter() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    // one mutable i32 global initialized to 2
    let globals = common::global_section(&[(0x7F, true, common::i32_const_expr(2))]);
    module.section(&RawSection {
        id: 6,
        data: &globals,
    });

    let mut exports = ExportSection::new();
    exports.export("increment", ExportKind::Func, 0);
    exports.export("counter", ExportKind::Global, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(0));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(0));
    f.instruction(&Instruction::GlobalGet(0));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (ctx, instance) = instantiate("counter", &module.finish(), &Imports::new());
    assert_eq!(call(&instance, "increment", &[]), Some(Value::I32(3)));
    assert_eq!(call(&instance, "increment", &[]), Some(Value::I32(4)));

    let global = ctx.get_exported_global("counter", "counter").expect("global");
    assert_eq!(global.get(), Value::I32(4));
}

#[test]
fn scenario_c_imported_memory_bounds() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![]);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(
        "env",
        "memory",
        MemoryType {
            minimum: 1,
            maximum: Some(2),
            memory64: false,
            shared: false,
            page_size_log2: None,
        },
    );
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("poke", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Store(mem_arg(0, 2)));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let memory = Arc::new(Memory::with_limits(
        Limits::new(1, Some(2)),
        AllocationMode::OnDemand,
        1024,
    ));
    let imports = Imports::new().memory("env", "memory", memory.clone());
    let (_ctx, instance) = instantiate("bounds", &module.finish(), &imports);

    let poke = instance.exported_function("poke").expect("export");

    // last word of page 0
    assert!(poke.call(&[Value::I32(65532), Value::I32(7)]).is_ok());
    assert_eq!(memory.read_i32(65532).unwrap(), 7);

    // last word of page 1
    assert!(poke.call(&[Value::I32(131068), Value::I32(-1)]).is_ok());

    // first word of page 2 is past max
    assert!(matches!(
        poke.call(&[Value::I32(131072), Value::I32(1)]),
        Err(Trap::Segmentation { .. })
    ));

    // the instance stays usable after the trap
    assert!(poke.call(&[Value::I32(0), Value::I32(1)]).is_ok());
}

#[test]
fn scenario_d_call_indirect() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]); // type 0: () -> i32
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]); // type 1
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(1);
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        table64: false,
        minimum: 2,
        maximum: Some(2),
        shared: false,
    });
    module.section(&tables);

    let mut exports = ExportSection::new();
    exports.export("call_slot", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::CallIndirect { type_index: 0, table_index: 0 });
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("indirect", &module.finish(), &Imports::new());

    let constant = FuncRef::new(
        FunctionType::new(vec![], vec![ValueType::I32]),
        |_| Ok(Some(Value::I32(42))),
    );
    instance.table().set(0, constant).unwrap();

    assert_eq!(call(&instance, "call_slot", &[Value::I32(0)]), Some(Value::I32(42)));

    let unset = instance
        .exported_function("call_slot")
        .unwrap()
        .call(&[Value::I32(1)]);
    assert!(matches!(unset, Err(Trap::UndefinedElement(1))));
}

#[test]
fn call_indirect_type_mismatch_traps() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]);
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(1);
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        table64: false,
        minimum: 1,
        maximum: Some(1),
        shared: false,
    });
    module.section(&tables);

    let mut exports = ExportSection::new();
    exports.export("call_slot", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::CallIndirect { type_index: 0, table_index: 0 });
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("mismatch", &module.finish(), &Imports::new());

    // slot holds an (i64) -> i64 target; the site expects () -> i32
    let wrong = FuncRef::new(
        FunctionType::new(vec![ValueType::I64], vec![ValueType::I64]),
        |args| Ok(Some(args[0])),
    );
    instance.table().set(0, wrong).unwrap();

    let result = instance
        .exported_function("call_slot")
        .unwrap()
        .call(&[Value::I32(0)]);
    assert!(matches!(result, Err(Trap::TypeMismatch)));
}

#[test]
fn br_table_selects_default_out_of_range() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("route", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::BrTable(Cow::Borrowed(&[0, 1]), 2));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::I32Const(10));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::I32Const(20));
    f.instruction(&Instruction::Return);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::I32Const(30));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("route", &module.finish(), &Imports::new());

    assert_eq!(call(&instance, "route", &[Value::I32(0)]), Some(Value::I32(10)));
    assert_eq!(call(&instance, "route", &[Value::I32(1)]), Some(Value::I32(20)));
    // out of range picks the default, including negative indices
    assert_eq!(call(&instance, "route", &[Value::I32(2)]), Some(Value::I32(30)));
    assert_eq!(call(&instance, "route", &[Value::I32(99)]), Some(Value::I32(30)));
    assert_eq!(call(&instance, "route", &[Value::I32(-1)]), Some(Value::I32(30)));
}

#[test]
fn division_faults() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("div_s", ExportKind::Func, 0);
    exports.export("rem_s", ExportKind::Func, 1);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut div = Function::new(vec![]);
    div.instruction(&Instruction::LocalGet(0));
    div.instruction(&Instruction::LocalGet(1));
    div.instruction(&Instruction::I32DivS);
    div.instruction(&Instruction::End);
    codes.function(&div);
    let mut rem = Function::new(vec![]);
    rem.instruction(&Instruction::LocalGet(0));
    rem.instruction(&Instruction::LocalGet(1));
    rem.instruction(&Instruction::I32RemS);
    rem.instruction(&Instruction::End);
    codes.function(&rem);
    module.section(&codes);

    let (_ctx, instance) = instantiate("div", &module.finish(), &Imports::new());

    assert_eq!(
        call(&instance, "div_s", &[Value::I32(-7), Value::I32(2)]),
        Some(Value::I32(-3))
    );

    let div = instance.exported_function("div_s").unwrap();
    assert!(matches!(
        div.call(&[Value::I32(1), Value::I32(0)]),
        Err(Trap::DivideByZero)
    ));
    assert!(matches!(
        div.call(&[Value::I32(i32::MIN), Value::I32(-1)]),
        Err(Trap::IntegerOverflow)
    ));

    // MIN % -1 is 0, not an overflow
    assert_eq!(
        call(&instance, "rem_s", &[Value::I32(i32::MIN), Value::I32(-1)]),
        Some(Value::I32(0))
    );
}

#[test]
fn trunc_traps_out_of_range() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::F64], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("to_i32", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32TruncF64S);
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("trunc", &module.finish(), &Imports::new());

    assert_eq!(
        call(&instance, "to_i32", &[Value::F64(3.7)]),
        Some(Value::I32(3))
    );
    assert_eq!(
        call(&instance, "to_i32", &[Value::F64(-3.7)]),
        Some(Value::I32(-3))
    );

    let to_i32 = instance.exported_function("to_i32").unwrap();
    assert!(matches!(
        to_i32.call(&[Value::F64(f64::NAN)]),
        Err(Trap::InvalidConversion)
    ));
    assert!(matches!(
        to_i32.call(&[Value::F64(1e10)]),
        Err(Trap::InvalidConversion)
    ));
}

#[test]
fn memory_grow_returns_previous_size_or_sentinel() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]); // type 0: grow
    types.ty().function(vec![], vec![ValType::I32]); // type 1: size
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(1);
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(2),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export("grow", ExportKind::Func, 0);
    exports.export("size", ExportKind::Func, 1);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut grow = Function::new(vec![]);
    grow.instruction(&Instruction::LocalGet(0));
    grow.instruction(&Instruction::MemoryGrow(0));
    grow.instruction(&Instruction::End);
    codes.function(&grow);
    let mut size = Function::new(vec![]);
    size.instruction(&Instruction::MemorySize(0));
    size.instruction(&Instruction::End);
    codes.function(&size);
    module.section(&codes);

    // immediate allocation, so size reflects the declared minimum
    let ctx = WasmContext::with_config(WasmConfig {
        allocation_mode: AllocationMode::Immediate,
        ..WasmConfig::default()
    });
    ctx.load_binary("grow", &module.finish()).unwrap();
    let instance = ctx.instantiate("grow", &Imports::new()).unwrap();

    assert_eq!(call(&instance, "size", &[]), Some(Value::I32(1)));
    assert_eq!(call(&instance, "grow", &[Value::I32(1)]), Some(Value::I32(1)));
    assert_eq!(call(&instance, "size", &[]), Some(Value::I32(2)));
    // growing past max fails with the sentinel, never a trap
    assert_eq!(call(&instance, "grow", &[Value::I32(1)]), Some(Value::I32(-1)));
    assert_eq!(call(&instance, "size", &[]), Some(Value::I32(2)));
}

#[test]
fn loop_with_branches_computes_factorial() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("factorial", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![(1, ValType::I32)]); // acc
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::LocalSet(1));
    f.instruction(&Instruction::Block(BlockType::Empty));
    f.instruction(&Instruction::Loop(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::BrIf(1)); // exit the block
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Mul);
    f.instruction(&Instruction::LocalSet(1));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::LocalSet(0));
    f.instruction(&Instruction::Br(0)); // continue the loop
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("fact", &module.finish(), &Imports::new());

    assert_eq!(call(&instance, "factorial", &[Value::I32(0)]), Some(Value::I32(1)));
    assert_eq!(call(&instance, "factorial", &[Value::I32(5)]), Some(Value::I32(120)));
    assert_eq!(call(&instance, "factorial", &[Value::I32(10)]), Some(Value::I32(3628800)));
}

#[test]
fn if_else_with_result() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("max", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32GtS);
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::Else);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (_ctx, instance) = instantiate("max", &module.finish(), &Imports::new());

    assert_eq!(
        call(&instance, "max", &[Value::I32(3), Value::I32(9)]),
        Some(Value::I32(9))
    );
    assert_eq!(
        call(&instance, "max", &[Value::I32(-1), Value::I32(-5)]),
        Some(Value::I32(-1))
    );
}

#[test]
fn calls_internal_and_imported_functions() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]); // type 0
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![ValType::I32]); // type 1
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "three", EntityType::Function(0));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(1); // function 1: add
    functions.function(0); // function 2: call_both
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("call_both", ExportKind::Func, 2);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut add = Function::new(vec![]);
    add.instruction(&Instruction::LocalGet(0));
    add.instruction(&Instruction::LocalGet(1));
    add.instruction(&Instruction::I32Add);
    add.instruction(&Instruction::End);
    codes.function(&add);
    // add(1, imported three()) = 4
    let mut call_both = Function::new(vec![]);
    call_both.instruction(&Instruction::I32Const(1));
    call_both.instruction(&Instruction::Call(0));
    call_both.instruction(&Instruction::Call(1));
    call_both.instruction(&Instruction::End);
    codes.function(&call_both);
    module.section(&codes);

    let three = FuncRef::new(
        FunctionType::new(vec![], vec![ValueType::I32]),
        |_| Ok(Some(Value::I32(3))),
    );
    let imports = Imports::new().function("env", "three", three);
    let (_ctx, instance) = instantiate("calls", &module.finish(), &imports);

    assert_eq!(call(&instance, "call_both", &[]), Some(Value::I32(4)));
}

#[test]
fn element_segments_populate_the_table() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]); // type 0
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]); // type 1
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0); // function 0: ten
    functions.function(0); // function 1: twenty
    functions.function(1); // function 2: pick
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        table64: false,
        minimum: 2,
        maximum: Some(2),
        shared: false,
    });
    module.section(&tables);

    let mut exports = ExportSection::new();
    exports.export("pick", ExportKind::Func, 2);
    module.section(&exports);

    let elements = common::element_section(0, &[0, 1]);
    module.section(&RawSection {
        id: 9,
        data: &elements,
    });

    let mut codes = CodeSection::new();
    let mut ten = Function::new(vec![]);
    ten.instruction(&Instruction::I32Const(10));
    ten.instruction(&Instruction::End);
    codes.function(&ten);
    let mut twenty = Function::new(vec![]);
    twenty.instruction(&Instruction::I32Const(20));
    twenty.instruction(&Instruction::End);
    codes.function(&twenty);
    let mut pick = Function::new(vec![]);
    pick.instruction(&Instruction::LocalGet(0));
    pick.instruction(&Instruction::CallIndirect { type_index: 0, table_index: 0 });
    pick.instruction(&Instruction::End);
    codes.function(&pick);
    module.section(&codes);

    let (_ctx, instance) = instantiate("elements", &module.finish(), &Imports::new());

    assert_eq!(call(&instance, "pick", &[Value::I32(0)]), Some(Value::I32(10)));
    assert_eq!(call(&instance, "pick", &[Value::I32(1)]), Some(Value::I32(20)));
}

#[test]
fn data_segments_initialize_memory() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export("read8", ExportKind::Func, 0);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load8U(mem_arg(0, 0)));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(4), b"abc".iter().copied());
    module.section(&data);

    let (_ctx, instance) = instantiate("data", &module.finish(), &Imports::new());

    assert_eq!(call(&instance, "read8", &[Value::I32(4)]), Some(Value::I32(97)));
    assert_eq!(call(&instance, "read8", &[Value::I32(6)]), Some(Value::I32(99)));
    assert_eq!(call(&instance, "read8", &[Value::I32(7)]), Some(Value::I32(0)));
    assert_eq!(instance.memory().read_u8(5).unwrap(), b'b');
}

#[test]
fn global_initializer_reads_imported_global() {
    let mut module = Module::new();

    let imports = common::global_import_section("env", "base", 0x7F, false);
    module.section(&RawSection {
        id: 2,
        data: &imports,
    });

    // local const global initialized from the imported one
    let globals = common::global_section(&[(0x7F, false, common::global_get_expr(0))]);
    module.section(&RawSection {
        id: 6,
        data: &globals,
    });

    let mut exports = ExportSection::new();
    exports.export("derived", ExportKind::Global, 1);
    module.section(&exports);

    let supplied = Imports::new().global("env", "base", Arc::new(Global::immutable(Value::I32(2))));
    let (ctx, _instance) = instantiate("init", &module.finish(), &supplied);

    let derived = ctx.get_exported_global("init", "derived").expect("global");
    assert_eq!(derived.get(), Value::I32(2));
    // the derived cell is const
    assert!(matches!(
        derived.set(Value::I32(9)),
        Err(Trap::ImmutableGlobal)
    ));
}

#[test]
fn start_function_runs_at_instantiation() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let globals = common::global_section(&[(0x7F, true, common::i32_const_expr(0))]);
    module.section(&RawSection {
        id: 6,
        data: &globals,
    });

    let mut exports = ExportSection::new();
    exports.export("flag", ExportKind::Global, 0);
    module.section(&exports);

    module.section(&StartSection { function_index: 0 });

    let mut codes = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(7));
    f.instruction(&Instruction::GlobalSet(0));
    f.instruction(&Instruction::End);
    codes.function(&f);
    module.section(&codes);

    let (ctx, _instance) = instantiate("start", &module.finish(), &Imports::new());

    let flag = ctx.get_exported_global("start", "flag").expect("global");
    assert_eq!(flag.get(), Value::I32(7));
}

#[test]
fn missing_and_mismatched_imports_fail_to_link() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![ValType::I32]);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "f", EntityType::Function(0));
    module.section(&imports);

    let wasm = module.finish();
    let ctx = WasmContext::new();
    ctx.load_binary("link", &wasm).unwrap();

    let missing = ctx.instantiate("link", &Imports::new());
    assert!(matches!(
        missing,
        Err(WasmError::Link(LinkError::MissingImport { .. }))
    ));

    // same triple, wrong kind
    let wrong = Imports::new().global("env", "f", Arc::new(Global::immutable(Value::I32(0))));
    let mismatched = ctx.instantiate("link", &wrong);
    assert!(matches!(
        mismatched,
        Err(WasmError::Link(LinkError::KindMismatch { .. }))
    ));

    // corrected imports succeed on retry
    let ok = Imports::new().function(
        "env",
        "f",
        FuncRef::new(FunctionType::new(vec![], vec![ValueType::I32]), |_| {
            Ok(Some(Value::I32(1)))
        }),
    );
    assert!(ctx.instantiate("link", &ok).is_ok());
}

#[test]
fn locked_instance_rejects_import_rebinding() {
    let mut module = Module::new();
    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![]);
    module.section(&types);

    let (_ctx, instance) = instantiate("locked", &module.finish(), &Imports::new());

    assert!(matches!(
        instance.import_memory(Arc::new(Memory::new())),
        Err(LinkError::AlreadyInitialized(_))
    ));
    assert!(matches!(
        instance.import_table(Arc::new(wasm2rt::Table::new())),
        Err(LinkError::AlreadyInitialized(_))
    ));
}

#[test]
fn select_and_eqz() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("pick", ExportKind::Func, 0);
    exports.export("is_zero", ExportKind::Func, 1);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut pick = Function::new(vec![]);
    pick.instruction(&Instruction::I32Const(100));
    pick.instruction(&Instruction::I32Const(200));
    pick.instruction(&Instruction::LocalGet(0));
    pick.instruction(&Instruction::Select);
    pick.instruction(&Instruction::End);
    codes.function(&pick);
    let mut is_zero = Function::new(vec![]);
    is_zero.instruction(&Instruction::LocalGet(0));
    is_zero.instruction(&Instruction::I32Eqz);
    is_zero.instruction(&Instruction::End);
    codes.function(&is_zero);
    module.section(&codes);

    let (_ctx, instance) = instantiate("select", &module.finish(), &Imports::new());

    assert_eq!(call(&instance, "pick", &[Value::I32(1)]), Some(Value::I32(100)));
    assert_eq!(call(&instance, "pick", &[Value::I32(0)]), Some(Value::I32(200)));
    assert_eq!(call(&instance, "is_zero", &[Value::I32(0)]), Some(Value::I32(1)));
    assert_eq!(call(&instance, "is_zero", &[Value::I32(5)]), Some(Value::I32(0)));
}

#[test]
fn unsigned_arithmetic_uses_magnitude() {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("div_u", ExportKind::Func, 0);
    exports.export("lt_u", ExportKind::Func, 1);
    module.section(&exports);

    let mut codes = CodeSection::new();
    let mut div_u = Function::new(vec![]);
    div_u.instruction(&Instruction::LocalGet(0));
    div_u.instruction(&Instruction::LocalGet(1));
    div_u.instruction(&Instruction::I32DivU);
    div_u.instruction(&Instruction::End);
    codes.function(&div_u);
    let mut lt_u = Function::new(vec![]);
    lt_u.instruction(&Instruction::LocalGet(0));
    lt_u.instruction(&Instruction::LocalGet(1));
    lt_u.instruction(&Instruction::I32LtU);
    lt_u.instruction(&Instruction::End);
    codes.function(&lt_u);
    module.section(&codes);

    let (_ctx, instance) = instantiate("unsigned", &module.finish(), &Imports::new());

    // -2 as unsigned is 0xFFFF_FFFE
    assert_eq!(
        call(&instance, "div_u", &[Value::I32(-2), Value::I32(2)]),
        Some(Value::I32(0x7FFF_FFFF))
    );
    assert_eq!(
        call(&instance, "lt_u", &[Value::I32(-1), Value::I32(1)]),
        Some(Value::I32(0))
    );
    assert_eq!(
        call(&instance, "lt_u", &[Value::I32(1), Value::I32(-1)]),
        Some(Value::I32(1))
    );
}

#[test]
fn compile_is_idempotent() {
    let mut module = Module::new();
    let mut types = TypeSection::new();
    types.ty().function(vec![], vec![]);
    module.section(&types);
    let wasm = module.finish();

    let ctx = WasmContext::new();
    ctx.load_binary("idem", &wasm).unwrap();
    let first = ctx.compile("idem").unwrap();
    let second = ctx.compile("idem").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}
