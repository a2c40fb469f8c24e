// wasm2rt - WebAssembly module loader and AOT translator
//
// Loads a wasm binary, translates it, and prints the module's export
// table; optionally instantiates it and invokes an exported function.
//
// Usage:
//   wasm2rt input.wasm
//   wasm2rt input.wasm --invoke add --args 4 3

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use wasm2rt::{Imports, Value, ValueType, WasmContext};

#[derive(Parser, Debug)]
#[command(name = "wasm2rt")]
#[command(about = "WebAssembly module loader and AOT translator")]
#[command(version)]
struct Args {
    /// Input wasm binary
    input: PathBuf,

    /// Module name (defaults to the file stem)
    #[arg(long)]
    name: Option<String>,

    /// Instantiate the module and invoke this exported function
    #[arg(long)]
    invoke: Option<String>,

    /// Integer arguments for --invoke
    #[arg(long, num_args = 0.., allow_negative_numbers = true)]
    args: Vec<i64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let wasm = std::fs::read(&args.input).context("Failed to read input module")?;
    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string()),
    };

    let ctx = WasmContext::new();
    ctx.load_binary(&name, &wasm)
        .context("Failed to decode module")?;
    let compiled = ctx.compile(&name).context("Failed to translate module")?;

    if args.verbose {
        let binary = &compiled.binary;
        eprintln!("Module: {name}");
        eprintln!("  Types: {}", binary.type_section.len());
        eprintln!("  Imports: {}", binary.import_section.len());
        eprintln!(
            "  Functions: {} ({} imported)",
            binary.function_count(),
            binary.imported_function_count()
        );
        eprintln!("  Custom sections: {}", binary.custom_sections.len());
    }

    println!("Exports:");
    for export in &compiled.binary.export_section {
        println!("  {:?}", export);
    }

    if let Some(function) = &args.invoke {
        let instance = ctx
            .instantiate(&name, &Imports::new())
            .context("Failed to instantiate module")?;
        let handle = instance
            .exported_function(function)
            .with_context(|| format!("No exported function named {function}"))?;

        if handle.ty().params.len() != args.args.len() {
            bail!(
                "{function} takes {} arguments, {} supplied",
                handle.ty().params.len(),
                args.args.len()
            );
        }
        let call_args: Vec<Value> = handle
            .ty()
            .params
            .iter()
            .zip(&args.args)
            .map(|(ty, &raw)| match ty {
                ValueType::I32 => Ok(Value::I32(raw as i32)),
                ValueType::I64 => Ok(Value::I64(raw)),
                ValueType::F32 | ValueType::F64 => {
                    bail!("float parameters are not supported from the command line")
                }
            })
            .collect::<Result<_>>()?;

        match handle.call(&call_args) {
            Ok(Some(result)) => println!("{function} -> {result:?}"),
            Ok(None) => println!("{function} -> ()"),
            Err(trap) => bail!("trap: {trap}"),
        }
    }

    Ok(())
}
