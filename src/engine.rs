/// The engine: a single object owning every piece of shared state the
/// evaluator, inline caches, profiler and JIT need. There is no global
/// mutable state; hosts construct an `Engine` and thread it through
/// every call. An embedder-facing reentrant lock guards the engine the
/// way a global interpreter lock would, so host threads serialize
/// their access while the language itself stays single-threaded.
///
/// The engine is also the tiering coordinator. On every user-function
/// call it bumps the profiler, dispatches to native code, the IR
/// interpreter or the tree-walk in that order, and on return checks
/// whether the function just became hot. Guard failures in native code
/// record a side exit, demote the function and invalidate the inline
/// caches its body uses.

use crate::ast::FuncDef;
use crate::builtins::{self, Builtin};
use crate::checker;
use crate::env::{AssignError, EnvArena, EnvId};
use crate::errors::{Diagnostic, DiagnosticLevel, ParseError, Span};
use crate::exceptions::{ErrorKind, Thrown, TraceFrame};
use crate::inline_cache::{IcManager, IcStats};
use crate::jit::backend::{self, NativeOutcome};
use crate::jit::ir::Tier;
use crate::jit::{JitManager, JitStats};
use crate::modules::{ModuleResolver, NullResolver, DebugInfoResolver};
use crate::parser::Parser;
use crate::profiler::{FuncStats, Profiler, HOT_CALL_MIN, HOT_THRESHOLD_FRAC};
use crate::tasks::{Dispatch, EventLoop, TaskId, TaskOutcome};
use crate::value::{FunctionKind, FunctionValue, Value};
use parking_lot::ReentrantMutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const MAX_STACK_DEPTH: usize = 2048;
pub const MAX_MATCH_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hot_frac: f64,
    pub hot_call_min: u64,
    /// Baseline executions before promotion to the Optimized tier.
    pub opt_threshold: u64,
    pub max_stack_depth: usize,
    pub max_match_depth: usize,
    /// Strict pattern matching: object patterns without a rest marker
    /// reject values carrying extra fields.
    pub strict_match: bool,
    pub jit_enabled: bool,
    pub native_enabled: bool,
    /// Collect program output instead of writing to stdout.
    pub capture_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            hot_frac: HOT_THRESHOLD_FRAC,
            hot_call_min: HOT_CALL_MIN,
            opt_threshold: 500,
            max_stack_depth: MAX_STACK_DEPTH,
            max_match_depth: MAX_MATCH_DEPTH,
            strict_match: false,
            jit_enabled: true,
            native_enabled: true,
            capture_output: false,
        }
    }
}

/// Top-level failure of a source run, for the CLI and the REPL.
#[derive(Debug, Error)]
pub enum BoltError {
    #[error("parse failed with {} error(s)", .0.len())]
    Parse(Vec<ParseError>),
    #[error("check failed")]
    Check(Vec<Diagnostic>),
    #[error("{}: {}", .0.kind.name(), .0.message)]
    Runtime(Thrown),
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub ic: IcStats,
    pub jit: JitStats,
    pub tiers: Vec<(Arc<str>, Tier)>,
    pub hot: Vec<(Arc<str>, FuncStats)>,
    pub live_env_frames: usize,
}

pub struct Engine {
    pub config: EngineConfig,
    pub(crate) arena: EnvArena,
    pub(crate) globals: EnvId,
    pub ic: IcManager,
    pub profiler: Profiler,
    pub jit: JitManager,
    pub(crate) resolver: Box<dyn ModuleResolver>,
    debug_info: Option<Box<dyn DebugInfoResolver>>,
    pub(crate) call_stack: Vec<TraceFrame>,
    /// Declared functions by name, for hot-spot polling.
    pub(crate) fn_registry: HashMap<Arc<str>, Arc<FuncDef>>,
    /// The cooperative task loop behind `spawn`/`async_await`.
    pub(crate) event_loop: EventLoop,
    captured: String,
    warnings: Vec<Diagnostic>,
    started: Instant,
    pub(crate) source_name: String,
    pub(crate) last_value: Value,
    /// Running id bases so programs parsed later keep unique site and
    /// function ids.
    next_site_id: u32,
    next_fn_id: u32,
    gil: Arc<ReentrantMutex<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let mut arena = EnvArena::new();
        let globals = arena.alloc(None);
        let mut engine = Engine {
            profiler: Profiler::new(config.hot_frac, config.hot_call_min),
            jit: JitManager::new(config.opt_threshold, config.native_enabled),
            config,
            arena,
            globals,
            ic: IcManager::new(),
            resolver: Box::new(NullResolver),
            debug_info: None,
            call_stack: Vec::new(),
            fn_registry: HashMap::new(),
            event_loop: EventLoop::new(),
            captured: String::new(),
            warnings: Vec::new(),
            started: Instant::now(),
            source_name: "<script>".to_string(),
            last_value: Value::Null,
            next_site_id: 0,
            next_fn_id: 0,
            gil: Arc::new(ReentrantMutex::new(())),
        };
        builtins::register_defaults(&mut engine);
        engine
    }

    // -----------------------------------------------------------------
    // Host surface
    // -----------------------------------------------------------------

    /// Bind a builtin as a callable global. Registering a name again
    /// replaces the previous binding and drops stale cache entries.
    pub fn register_builtin(&mut self, builtin: Arc<dyn Builtin>) {
        let name: Arc<str> = Arc::from(builtin.name());
        let value = Value::Function(Arc::new(FunctionValue {
            kind: FunctionKind::Native(builtin),
        }));
        let _ = self.arena.define(self.globals, name.clone(), value, false);
        self.ic.invalidate_method(&name);
    }

    pub fn set_resolver(&mut self, resolver: Box<dyn ModuleResolver>) {
        self.resolver = resolver;
    }

    pub fn set_debug_info(&mut self, resolver: Box<dyn DebugInfoResolver>) {
        self.debug_info = Some(resolver);
    }

    pub fn debug_info(&self) -> Option<&dyn DebugInfoResolver> {
        self.debug_info.as_deref()
    }

    /// The engine-wide lock for host-thread embedders. The language
    /// itself never blocks on it; hosts take it around engine calls.
    pub fn lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.gil.lock()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.arena.lookup(self.globals, name)
    }

    /// The global frame, for embedders driving `eval_expr`/`exec_stmt`
    /// directly.
    pub fn globals_env(&self) -> EnvId {
        self.globals
    }

    /// The engine's event loop, for hosts that spawn their own tasks.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    /// Run the event loop until the task settles, executing script
    /// task bodies through the evaluator. With a timeout, gives up
    /// with `TimedOut` without cancelling the task. An error raised by
    /// a task's callable settles that task as `Failed`; awaiting it
    /// re-raises.
    pub fn drive_task(
        &mut self,
        id: TaskId,
        timeout: Option<Duration>,
        span: Span,
    ) -> TaskOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(outcome) = self.event_loop.outcome(id) {
                return outcome;
            }
            if self.event_loop.is_stopped() {
                return TaskOutcome::Stopped;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return TaskOutcome::TimedOut;
                }
            }
            match self.event_loop.dispatch_next() {
                Dispatch::Polled => {}
                Dispatch::Script { id: task, callee, args } => {
                    let outcome = match self.call_value(callee, args, span) {
                        Ok(value) => TaskOutcome::Completed(value),
                        Err(thrown) => TaskOutcome::Failed(thrown),
                    };
                    self.event_loop.complete(task, outcome);
                }
                Dispatch::Idle(next) => {
                    // The awaited task cannot progress without a timer.
                    let Some(mut wake) = next else { return TaskOutcome::Stopped };
                    if let Some(deadline) = deadline {
                        wake = wake.min(deadline);
                    }
                    let now = Instant::now();
                    if wake > now {
                        std::thread::sleep(wake - now);
                    }
                }
            }
        }
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        let _ = self.arena.define(self.globals, Arc::from(name), value, false);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.captured)
    }

    pub fn take_warnings(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn write_line(&mut self, text: &str) {
        if self.config.capture_output {
            self.captured.push_str(text);
            self.captured.push('\n');
        } else {
            println!("{}", text);
        }
    }

    pub(crate) fn write_raw(&mut self, text: &str) {
        if self.config.capture_output {
            self.captured.push_str(text);
        } else {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }

    // -----------------------------------------------------------------
    // Running programs
    // -----------------------------------------------------------------

    /// Parse, check and execute a source buffer. Any parse error or
    /// checker error refuses execution.
    pub fn run_source(&mut self, name: &str, source: &str) -> Result<Value, BoltError> {
        self.source_name = name.to_string();
        let (program, errors) =
            Parser::with_id_bases(source, self.next_site_id, self.next_fn_id).parse();
        if !errors.is_empty() {
            return Err(BoltError::Parse(errors));
        }
        self.next_site_id = program.site_count;
        self.next_fn_id = program.fn_count;
        let diagnostics = checker::check(&program);
        let has_errors = diagnostics
            .iter()
            .any(|d| d.level == DiagnosticLevel::Error);
        if has_errors {
            return Err(BoltError::Check(diagnostics));
        }
        self.warnings.extend(diagnostics);
        self.interpret(&program).map_err(BoltError::Runtime)
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ic: self.ic.stats(),
            jit: self.jit.stats,
            tiers: self.jit.tiers(),
            hot: self.profiler.report(),
            live_env_frames: self.arena.live_count(),
        }
    }

    /// Observable tier of a named function; `Interp` when the JIT has
    /// not picked it up.
    pub fn function_tier(&self, name: &str) -> Tier {
        self.fn_registry
            .get(name)
            .map(|def| self.jit.tier(def.fn_id))
            .unwrap_or(Tier::Interp)
    }

    // -----------------------------------------------------------------
    // Coordinator
    // -----------------------------------------------------------------

    pub(crate) fn raise(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        span: Span,
    ) -> Thrown {
        Thrown::new(kind, message, span).with_traceback(self.current_traceback())
    }

    pub(crate) fn current_traceback(&self) -> Vec<TraceFrame> {
        self.call_stack.iter().rev().cloned().collect()
    }

    pub fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Thrown> {
        match callee {
            Value::Function(f) => match &f.kind {
                FunctionKind::Native(builtin) => {
                    let builtin = builtin.clone();
                    if let Some(arity) = builtin.arity() {
                        if args.len() != arity {
                            return Err(self.raise(
                                ErrorKind::Type,
                                format!(
                                    "{}() takes {} argument(s), got {}",
                                    builtin.name(),
                                    arity,
                                    args.len()
                                ),
                                span,
                            ));
                        }
                    }
                    builtin.call(self, args, span)
                }
                FunctionKind::User { decl, env, .. } => {
                    let decl = decl.clone();
                    let env = *env;
                    self.call_user(decl, env, args, span)
                }
            },
            Value::Null => Err(self.raise(ErrorKind::Null, "null is not callable", span)),
            other => Err(self.raise(
                ErrorKind::Type,
                format!("{} is not callable", other.type_name()),
                span,
            )),
        }
    }

    /// Function entry point of the tiering pipeline.
    pub(crate) fn call_user(
        &mut self,
        decl: Arc<FuncDef>,
        closure_env: EnvId,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Thrown> {
        if args.len() != decl.params.len() {
            return Err(self.raise(
                ErrorKind::Type,
                format!(
                    "{}() takes {} argument(s), got {}",
                    decl.name,
                    decl.params.len(),
                    args.len()
                ),
                span,
            ));
        }
        if self.call_stack.len() >= self.config.max_stack_depth {
            return Err(self.raise(
                ErrorKind::Memory,
                format!("stack overflow: call depth exceeds {}", self.config.max_stack_depth),
                span,
            ));
        }

        let name = decl.name.clone();
        self.profiler.enter(&name);
        self.call_stack.push(TraceFrame {
            function: name.clone(),
            line: span.line,
            column: span.column,
        });

        let result = self.dispatch_call(&decl, closure_env, args, span);

        self.call_stack.pop();
        self.profiler.exit(&name);

        // Newly hot functions compile synchronously on return.
        if self.config.jit_enabled
            && !self.jit.is_compiled_or_refused(decl.fn_id)
            && self.profiler.is_hot(&name)
        {
            self.jit.compile_baseline(&decl);
        }

        result
    }

    fn dispatch_call(
        &mut self,
        decl: &Arc<FuncDef>,
        closure_env: EnvId,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Thrown> {
        if self.config.jit_enabled {
            if let Some(jf) = self.jit.get(decl.fn_id) {
                if let Some(native) = &jf.native {
                    match backend::call_native(native, &args, jf.names.len()) {
                        NativeOutcome::Value(n) => return Ok(Value::Num(n)),
                        NativeOutcome::GuardFail => {
                            self.deoptimize(decl.fn_id, "argument shape guard failed");
                            return self.tree_walk_call(decl, closure_env, args, span);
                        }
                        NativeOutcome::DivByZero => {
                            // Rerun on the tree-walk, which raises the
                            // error with a proper traceback.
                            self.deoptimize(decl.fn_id, "division by zero side exit");
                            return self.tree_walk_call(decl, closure_env, args, span);
                        }
                    }
                }
                let result = self.run_ir(&jf, closure_env, args, span);
                if self.jit.note_execution(decl.fn_id) {
                    self.jit.promote(decl.fn_id);
                }
                return result;
            }
        }
        self.tree_walk_call(decl, closure_env, args, span)
    }

    fn deoptimize(&mut self, fn_id: u32, reason: &'static str) {
        let stale_sites = self.jit.record_side_exit(fn_id, reason);
        for site in stale_sites {
            self.ic.invalidate(site);
        }
    }

    pub(crate) fn tree_walk_call(
        &mut self,
        decl: &Arc<FuncDef>,
        closure_env: EnvId,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Thrown> {
        let frame = self.arena.alloc(Some(closure_env));
        for (param, arg) in decl.params.iter().zip(args) {
            let _ = self.arena.define(frame, param.clone(), arg, false);
        }
        let flow = self.exec_block_plain(frame, &decl.body);
        self.arena.release(frame);
        self.arena.drain_dead();

        match flow? {
            crate::interp::Flow::Normal => Ok(Value::Null),
            crate::interp::Flow::Return(value) => Ok(value),
            crate::interp::Flow::Break(Some(label))
            | crate::interp::Flow::Continue(Some(label)) => Err(self.raise(
                ErrorKind::Name,
                format!("no enclosing loop labeled '{}'", label),
                span,
            )),
            crate::interp::Flow::Break(None) => {
                Err(self.raise(ErrorKind::Runtime, "break outside of a loop", span))
            }
            crate::interp::Flow::Continue(None) => {
                Err(self.raise(ErrorKind::Runtime, "continue outside of a loop", span))
            }
        }
    }

    /// Between top-level statements: reclaim dropped environments and
    /// pick up functions the profiler reports as hot.
    pub(crate) fn between_statements(&mut self) {
        self.arena.drain_dead();
        if !self.config.jit_enabled {
            return;
        }
        for name in self.profiler.hot_spots() {
            if let Some(decl) = self.fn_registry.get(&name).cloned() {
                if !self.jit.is_compiled_or_refused(decl.fn_id) {
                    self.jit.compile_baseline(&decl);
                }
            }
        }
    }

    pub(crate) fn assign_error(&self, err: AssignError, name: &str, span: Span) -> Thrown {
        match err {
            AssignError::NotFound => self.raise(
                ErrorKind::Name,
                format!("undefined variable '{}'", name),
                span,
            ),
            AssignError::ConstBinding => self.raise(
                ErrorKind::Type,
                format!("cannot assign to constant '{}'", name),
                span,
            ),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}
