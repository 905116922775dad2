/// Interactive REPL.
/// One engine lives for the whole session, so definitions, caches and
/// tiering state persist between lines. Errors are reported and the
/// session continues.

use crate::engine::{BoltError, Engine, EngineConfig};
use crate::value::Value;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "bolt> ";

pub fn run(config: EngineConfig) -> i32 {
    let mut engine = Engine::new(config);
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot start line editor: {}", err);
            return 1;
        }
    };

    println!("{}", format!("bolt {}", env!("CARGO_PKG_VERSION")).bold());
    println!("type expressions or statements; ctrl-d exits");

    let mut line_no = 0u32;
    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                line_no += 1;
                let name = format!("<repl:{}>", line_no);
                match engine.run_source(&name, &line) {
                    Ok(value) => {
                        for warning in engine.take_warnings() {
                            eprintln!("{}", warning.to_string().yellow());
                        }
                        if !matches!(value, Value::Null) {
                            println!("{}", value.display());
                        }
                    }
                    Err(err) => report(&mut engine, &name, err),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("input error: {}", err);
                return 1;
            }
        }
    }
    0
}

/// Report and continue; the REPL never dies on a script error.
fn report(engine: &mut Engine, source_name: &str, err: BoltError) {
    match err {
        BoltError::Parse(errors) => {
            for e in errors {
                eprintln!("{}", e.render(source_name).red());
            }
        }
        BoltError::Check(diags) => {
            for d in diags {
                eprintln!("{}", d.to_string().red());
            }
        }
        BoltError::Runtime(thrown) => {
            eprintln!("{}", thrown.render(source_name).red());
        }
    }
    // A failed line may still have produced output.
    let _ = engine.take_warnings();
}
