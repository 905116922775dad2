/// Collaborator interfaces.
/// The core never interprets file-system paths: `import "spec"` hands
/// the literal spec to a pluggable resolver, which answers with a
/// built-in module, a native-library export table, or an error.
/// Dynamic-library loading itself lives behind this boundary; the core
/// only binds the returned `{name, fn}` pairs as callable values.
///
/// The panic reporter's debug-info hook is the same shape: an address
/// resolver a host may install to enrich tracebacks from native
/// frames.

use crate::builtins::Builtin;
use crate::engine::Engine;
use crate::errors::Span;
use crate::exceptions::Thrown;
use crate::value::{FunctionKind, FunctionValue, Value};
use std::sync::Arc;

pub type ExportFn = fn(&mut Engine, Vec<Value>, Span) -> Result<Value, Thrown>;

/// One callable a module exposes.
#[derive(Clone)]
pub struct NativeExport {
    pub name: Arc<str>,
    pub func: ExportFn,
    /// Exact arity, or `None` for variadic exports.
    pub arity: Option<usize>,
}

impl NativeExport {
    pub fn new(name: &str, arity: Option<usize>, func: ExportFn) -> Self {
        NativeExport { name: Arc::from(name), func, arity }
    }

    /// Wrap the export as a callable value.
    pub fn into_value(self) -> Value {
        Value::Function(Arc::new(FunctionValue {
            kind: FunctionKind::Native(Arc::new(ExportBuiltin(self))),
        }))
    }
}

struct ExportBuiltin(NativeExport);

impl Builtin for ExportBuiltin {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn arity(&self) -> Option<usize> {
        self.0.arity
    }

    fn call(&self, engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
        (self.0.func)(engine, args, span)
    }
}

/// A native library handle as produced by the loader collaborator.
pub struct NativeLibrary {
    pub name: Arc<str>,
    pub exports: Vec<NativeExport>,
}

pub enum ModuleHandle {
    /// A module compiled into the host.
    Builtin(Vec<NativeExport>),
    /// A dynamically loaded library's export table.
    Native(NativeLibrary),
}

impl ModuleHandle {
    pub fn into_exports(self) -> Vec<NativeExport> {
        match self {
            ModuleHandle::Builtin(exports) => exports,
            ModuleHandle::Native(lib) => lib.exports,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveError {
    pub message: String,
}

impl ResolveError {
    pub fn new(message: impl Into<String>) -> Self {
        ResolveError { message: message.into() }
    }
}

pub trait ModuleResolver: Send {
    fn resolve(&mut self, spec: &str) -> Result<ModuleHandle, ResolveError>;
}

/// Default resolver: knows no modules.
pub struct NullResolver;

impl ModuleResolver for NullResolver {
    fn resolve(&mut self, spec: &str) -> Result<ModuleHandle, ResolveError> {
        Err(ResolveError::new(format!("no resolver registered for '{}'", spec)))
    }
}

/// Table-backed resolver for hosts that register modules up front.
pub struct TableResolver {
    modules: Vec<(Arc<str>, Vec<NativeExport>)>,
}

impl TableResolver {
    pub fn new() -> Self {
        TableResolver { modules: Vec::new() }
    }

    pub fn register(&mut self, name: &str, exports: Vec<NativeExport>) {
        self.modules.push((Arc::from(name), exports));
    }
}

impl Default for TableResolver {
    fn default() -> Self {
        TableResolver::new()
    }
}

impl ModuleResolver for TableResolver {
    fn resolve(&mut self, spec: &str) -> Result<ModuleHandle, ResolveError> {
        self.modules
            .iter()
            .find(|(name, _)| name.as_ref() == spec)
            .map(|(_, exports)| ModuleHandle::Builtin(exports.clone()))
            .ok_or_else(|| ResolveError::new(format!("unknown module '{}'", spec)))
    }
}

// ---------------------------------------------------------------------------
// Debug info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub source_line: Option<String>,
}

/// Address-to-source resolver the panic reporter may consult when a
/// traceback crosses native code.
pub trait DebugInfoResolver: Send {
    fn resolve(&self, addr: usize) -> Option<ResolvedFrame>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_resolver_finds_registered_modules() {
        let mut resolver = TableResolver::new();
        resolver.register(
            "demo",
            vec![NativeExport::new("answer", Some(0), |_, _, _| Ok(Value::Num(42.0)))],
        );
        assert!(resolver.resolve("demo").is_ok());
        assert!(resolver.resolve("missing").is_err());
    }
}
