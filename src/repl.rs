// File: src/repl.rs
//
// Interactive REPL for the NanoJS engine.
// Reads a line, runs it against a persistent context, prints the value or
// a pretty error.

use crate::context::Context;
use crate::value::JsValue;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub fn run_repl() {
    println!("NanoJS {} — type .exit to leave", env!("CARGO_PKG_VERSION"));

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to start line editor: {}", e);
            return;
        }
    };
    let mut ctx = Context::new();

    loop {
        match editor.readline("js> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ".exit" {
                    break;
                }
                let _ = editor.add_history_entry(&line);

                let outcome = crate::parser::parse(&line, false, false)
                    .and_then(|program| crate::compiler::compile_program(&program))
                    .and_then(|bytecode| crate::vm::execute_program(&mut ctx, bytecode));
                match outcome {
                    Ok(JsValue::Undefined) => {}
                    Ok(value) => println!("{}", value.to_js_string().bright_green()),
                    Err(err) => eprint!("{}", err),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }
}
