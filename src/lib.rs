/// Bolt language library.
/// Pipeline: source text -> tokens -> AST -> tree-walk interpretation,
/// with a profiling-driven JIT promoting hot functions through
/// Baseline (IR interpreter) to Optimized (passes + native code), and
/// polymorphic inline caches at every dynamic dispatch site.

pub mod ast;
pub mod builtins;
pub mod checker;
pub mod engine;
pub mod env;
pub mod errors;
pub mod exceptions;
pub mod inline_cache;
pub mod interp;
pub mod jit;
pub mod lexer;
pub mod modules;
pub mod parser;
pub mod pattern;
pub mod profiler;
pub mod repl;
pub mod tasks;
pub mod value;

// Re-exports for embedders and tests
pub use engine::{BoltError, Engine, EngineConfig, EngineStats};
pub use errors::{Diagnostic, ParseError, Span};
pub use exceptions::{ErrorKind, Thrown};
pub use inline_cache::{IcState, POLY_MAX};
pub use jit::ir::Tier;
pub use lexer::Lexer;
pub use parser::Parser;
pub use tasks::{EventLoop, TaskId, TaskOutcome};
pub use value::{values_equal, Value};
