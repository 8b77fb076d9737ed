// File: src/lib.rs
//
// Library interface for the NanoJS engine.
// Exposes modules for integration testing and embedding.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod context;
pub mod errors;
pub mod lexer;
pub mod parser;
pub mod regex;
pub mod value;
pub mod vm;

use errors::JsError;
use value::JsValue;

/// Parse, compile, and run a script against a context
pub fn eval(ctx: &mut context::Context, source: &str, module: bool) -> Result<JsValue, JsError> {
    let program = parser::parse(source, module, false)?;
    let bytecode = compiler::compile_program(&program)?;
    vm::execute_program(ctx, bytecode)
}
