// File: src/main.rs
//
// Main entry point for the NanoJS engine CLI.
// Handles command-line argument parsing and dispatches to the appropriate
// subcommand (run, eval, or repl).

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod context;
mod errors;
mod lexer;
mod parser;
mod regex;
mod repl;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use context::Context;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use value::JsValue;

#[derive(ClapParser)]
#[command(
    name = "nanojs",
    about = "NanoJS: a self-contained JavaScript engine",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a JavaScript file
    Run {
        /// Path to the .js file
        file: PathBuf,

        /// Parse in module mode (top-level await, implied strict mode)
        #[arg(long)]
        module: bool,

        /// Print the compiled bytecode before running
        #[arg(long)]
        dump_bytecode: bool,
    },

    /// Evaluate an inline expression and print its value
    Eval {
        /// Source text
        source: String,

        #[arg(long)]
        module: bool,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, module, dump_bytecode } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("cannot read {}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            run_source(&source, module, dump_bytecode, false)
        }
        Commands::Eval { source, module } => run_source(&source, module, false, true),
        Commands::Repl => {
            repl::run_repl();
            ExitCode::SUCCESS
        }
    }
}

fn run_source(source: &str, module: bool, dump_bytecode: bool, print_value: bool) -> ExitCode {
    let program = match parser::parse(source, module, false) {
        Ok(program) => program,
        Err(err) => {
            eprint!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let bytecode = match compiler::compile_program(&program) {
        Ok(bytecode) => bytecode,
        Err(err) => {
            eprint!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    if dump_bytecode {
        print!("{}", bytecode.disassemble());
    }

    let mut ctx = Context::new();
    match vm::execute_program(&mut ctx, bytecode) {
        Ok(value) => {
            if print_value && !matches!(value, JsValue::Undefined) {
                println!("{}", value.to_js_string());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprint!("{}", err);
            ExitCode::FAILURE
        }
    }
}
