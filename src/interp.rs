/// Tree-walk evaluator.
/// Control flow travels as a typed `Flow` result instead of longjmp:
/// `Return`, `Break` and `Continue` ride the `Ok` side until the
/// construct that owns them clears them, and thrown errors ride `Err`
/// until a `try` recovers or the program dies. The `Throwing` state of
/// the execution machine is exactly the `Err` branch.
///
/// Dynamic dispatch (calls, method calls, member and index access)
/// funnels through the inline caches keyed by the parse-time site ids.
/// The Baseline IR interpreter at the bottom of this file shares the
/// operator helpers, so the tiering pipeline cannot drift from the
/// tree-walk's semantics.

use crate::ast::{CatchArm, Expr, MatchArm, Program, Stmt};
use crate::engine::Engine;
use crate::errors::Span;
use crate::exceptions::{ErrorKind, Thrown};
use crate::env::EnvId;
use crate::inline_cache::DispatchTarget;
use crate::jit::ir::{Const, Ir, JitFunction};
use crate::pattern;
use crate::value::{values_equal, DictMap, FunctionKind, FunctionValue, TypeKey, Value};
use once_cell::sync::Lazy;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Flow {
    Normal,
    Return(Value),
    Break(Option<Arc<str>>),
    Continue(Option<Arc<str>>),
}

enum LoopStep {
    Next,
    Exit,
    Propagate(Flow),
}

/// Resolve a loop-body outcome against this loop's label.
fn loop_step(flow: Flow, label: &Option<Arc<str>>) -> LoopStep {
    match flow {
        Flow::Normal | Flow::Continue(None) => LoopStep::Next,
        Flow::Continue(Some(l)) if label.as_deref() == Some(&*l) => LoopStep::Next,
        Flow::Break(None) => LoopStep::Exit,
        Flow::Break(Some(l)) if label.as_deref() == Some(&*l) => LoopStep::Exit,
        other => LoopStep::Propagate(other),
    }
}

static DYNAMIC_CALLEE: Lazy<Arc<str>> = Lazy::new(|| Arc::from("<dynamic>"));
static INDEX_SITE: Lazy<Arc<str>> = Lazy::new(|| Arc::from("<index>"));

impl Engine {
    // -----------------------------------------------------------------
    // Programs and statements
    // -----------------------------------------------------------------

    /// Execute all top-level statements; the result is the value of
    /// the last top-level expression statement, or null.
    pub fn interpret(&mut self, program: &Program) -> Result<Value, Thrown> {
        self.last_value = Value::Null;
        for stmt in &program.stmts {
            let flow = match stmt {
                Stmt::Expr(Expr::Match { scrutinee, arms, span }) => {
                    let (flow, value) = self.exec_match(self.globals, scrutinee, arms, *span)?;
                    self.last_value = value;
                    flow
                }
                Stmt::Expr(expr) => {
                    self.last_value = self.eval_expr(self.globals, expr)?;
                    Flow::Normal
                }
                other => self.exec_stmt(self.globals, other)?,
            };
            match flow {
                Flow::Normal => {}
                Flow::Return(value) => {
                    self.last_value = value;
                    break;
                }
                Flow::Break(Some(label)) | Flow::Continue(Some(label)) => {
                    return Err(self.raise(
                        ErrorKind::Name,
                        format!("no enclosing loop labeled '{}'", label),
                        stmt.span(),
                    ));
                }
                Flow::Break(None) => {
                    return Err(self.raise(
                        ErrorKind::Runtime,
                        "break outside of a loop",
                        stmt.span(),
                    ));
                }
                Flow::Continue(None) => {
                    return Err(self.raise(
                        ErrorKind::Runtime,
                        "continue outside of a loop",
                        stmt.span(),
                    ));
                }
            }
            self.between_statements();
        }
        Ok(self.last_value.clone())
    }

    /// Run statements in an existing frame; the caller owns the frame.
    pub(crate) fn exec_block_plain(
        &mut self,
        env: EnvId,
        stmts: &[Stmt],
    ) -> Result<Flow, Thrown> {
        for stmt in stmts {
            let flow = self.exec_stmt(env, stmt)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    /// Run statements in a fresh child frame.
    fn exec_block_scoped(&mut self, env: EnvId, stmts: &[Stmt]) -> Result<Flow, Thrown> {
        let frame = self.arena.alloc(Some(env));
        let result = self.exec_block_plain(frame, stmts);
        self.arena.release(frame);
        result
    }

    pub fn exec_stmt(&mut self, env: EnvId, stmt: &Stmt) -> Result<Flow, Thrown> {
        match stmt {
            Stmt::Expr(expr) => {
                if let Expr::Match { scrutinee, arms, span } = expr {
                    let (flow, _) = self.exec_match(env, scrutinee, arms, *span)?;
                    return Ok(flow);
                }
                self.eval_expr(env, expr)?;
                Ok(Flow::Normal)
            }

            Stmt::Let { name, value, is_const, span, .. } => {
                let value = match value {
                    Some(expr) => self.eval_expr(env, expr)?,
                    None => Value::Null,
                };
                self.arena
                    .define(env, name.clone(), value, *is_const)
                    .map_err(|e| self.assign_error(e, name, *span))?;
                Ok(Flow::Normal)
            }

            Stmt::FuncDecl { def, span } => {
                let ticket = self.arena.ticket(env);
                let value = Value::Function(Arc::new(FunctionValue {
                    kind: FunctionKind::User { decl: def.clone(), env, ticket },
                }));
                self.arena
                    .define(env, def.name.clone(), value, false)
                    .map_err(|e| self.assign_error(e, &def.name, *span))?;
                self.fn_registry.insert(def.name.clone(), def.clone());
                // A redefinition makes previously cached dispatches stale.
                self.ic.invalidate_method(&def.name);
                Ok(Flow::Normal)
            }

            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval_expr(env, expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }

            Stmt::If { cond, then_body, else_body, .. } => {
                if self.eval_expr(env, cond)?.is_truthy() {
                    self.exec_block_scoped(env, then_body)
                } else if let Some(else_body) = else_body {
                    self.exec_block_scoped(env, else_body)
                } else {
                    Ok(Flow::Normal)
                }
            }

            Stmt::While { label, cond, body, .. } => {
                loop {
                    if !self.eval_expr(env, cond)?.is_truthy() {
                        break;
                    }
                    let flow = self.exec_block_scoped(env, body)?;
                    match loop_step(flow, label) {
                        LoopStep::Next => {}
                        LoopStep::Exit => break,
                        LoopStep::Propagate(flow) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }

            Stmt::DoWhile { label, body, cond, .. } => {
                loop {
                    let flow = self.exec_block_scoped(env, body)?;
                    match loop_step(flow, label) {
                        LoopStep::Next => {}
                        LoopStep::Exit => break,
                        LoopStep::Propagate(flow) => return Ok(flow),
                    }
                    if !self.eval_expr(env, cond)?.is_truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }

            Stmt::For { label, init, cond, step, body, .. } => {
                let outer = self.arena.alloc(Some(env));
                let result = self.exec_for(outer, label, init, cond, step, body);
                self.arena.release(outer);
                result
            }

            Stmt::ForIn { label, var, iterable, body, span } => {
                let iterated = self.eval_expr(env, iterable)?;
                let items = self.iteration_items(&iterated, *span)?;
                for item in items {
                    let frame = self.arena.alloc(Some(env));
                    let define = self.arena.define(frame, var.clone(), item, false);
                    let flow = match define {
                        Ok(()) => self.exec_block_plain(frame, body),
                        Err(e) => Err(self.assign_error(e, var, *span)),
                    };
                    self.arena.release(frame);
                    match loop_step(flow?, label) {
                        LoopStep::Next => {}
                        LoopStep::Exit => break,
                        LoopStep::Propagate(flow) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }

            Stmt::Block(stmts) => self.exec_block_scoped(env, stmts),

            Stmt::Print { args, .. } => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(self.eval_expr(env, arg)?.display());
                }
                self.write_line(&parts.join(" "));
                Ok(Flow::Normal)
            }

            Stmt::Import { spec, alias, selective, span } => {
                self.exec_import(env, spec, alias.as_ref(), selective, *span)?;
                Ok(Flow::Normal)
            }

            Stmt::Break { label, .. } => Ok(Flow::Break(label.clone())),
            Stmt::Continue { label, .. } => Ok(Flow::Continue(label.clone())),

            Stmt::Try { body, catches, finally, .. } => {
                self.exec_try(env, body, catches, finally.as_deref())
            }

            Stmt::Throw { value, span } => {
                let value = self.eval_expr(env, value)?;
                let mut thrown = Thrown::from_value(&value, *span);
                thrown.traceback = self.current_traceback();
                Err(thrown)
            }

            Stmt::Pass { .. } => Ok(Flow::Normal),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_for(
        &mut self,
        outer: EnvId,
        label: &Option<Arc<str>>,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        step: &Option<Expr>,
        body: &[Stmt],
    ) -> Result<Flow, Thrown> {
        if let Some(init) = init {
            let flow = self.exec_stmt(outer, init)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        loop {
            if let Some(cond) = cond {
                if !self.eval_expr(outer, cond)?.is_truthy() {
                    break;
                }
            }
            let flow = self.exec_block_scoped(outer, body)?;
            match loop_step(flow, label) {
                LoopStep::Next => {}
                LoopStep::Exit => break,
                LoopStep::Propagate(flow) => return Ok(flow),
            }
            if let Some(step) = step {
                self.eval_expr(outer, step)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn iteration_items(&mut self, value: &Value, span: Span) -> Result<Vec<Value>, Thrown> {
        match value {
            Value::List(l) => Ok(l.read().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            Value::Array(a) => Ok(a.read().to_vec()),
            Value::Range(r) => Ok(r.iter().map(Value::Num).collect()),
            Value::Str(s) => Ok(s
                .chars()
                .map(|c| Value::Str(Arc::from(c.to_string().as_str())))
                .collect()),
            Value::Dict(d) => Ok(d.read().keys().map(|k| Value::Str(k.clone())).collect()),
            other => Err(self.raise(
                ErrorKind::Type,
                format!("{} is not iterable", other.type_name()),
                span,
            )),
        }
    }

    // -----------------------------------------------------------------
    // try / catch / finally
    // -----------------------------------------------------------------

    fn exec_try(
        &mut self,
        env: EnvId,
        body: &[Stmt],
        catches: &[CatchArm],
        finally: Option<&[Stmt]>,
    ) -> Result<Flow, Thrown> {
        let mut outcome = self.exec_block_scoped(env, body);

        if let Err(thrown) = &outcome {
            let thrown = thrown.clone();
            for arm in catches {
                if !catch_matches(arm, &thrown) {
                    continue;
                }
                let frame = self.arena.alloc(Some(env));
                let handled = match &arm.binding {
                    Some(binding) => {
                        match self.arena.define(frame, binding.clone(), thrown.to_value(), false)
                        {
                            Ok(()) => self.exec_block_plain(frame, &arm.body),
                            Err(e) => Err(self.assign_error(e, binding, arm.span)),
                        }
                    }
                    None => self.exec_block_plain(frame, &arm.body),
                };
                self.arena.release(frame);
                outcome = handled;
                break;
            }
        }

        // `finally` runs on every path; an error or early exit raised
        // inside it supplants whatever was in flight.
        if let Some(fin) = finally {
            match self.exec_block_scoped(env, fin) {
                Err(thrown) => outcome = Err(thrown),
                Ok(Flow::Normal) => {}
                Ok(flow) => outcome = Ok(flow),
            }
        }
        outcome
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    pub fn eval_expr(&mut self, env: EnvId, expr: &Expr) -> Result<Value, Thrown> {
        match expr {
            Expr::Null { .. } => Ok(Value::Null),
            Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
            Expr::Num { value, .. } => Ok(Value::Num(*value)),
            Expr::Str { value, .. } => Ok(Value::Str(value.clone())),

            Expr::Ident { name, span } => self.arena.lookup(env, name).ok_or_else(|| {
                self.raise(ErrorKind::Name, format!("undefined variable '{}'", name), *span)
            }),

            Expr::Unary { op, operand, span } => {
                let value = self.eval_expr(env, operand)?;
                self.unary_value(op, value, *span)
            }

            Expr::Binary { left, op, right, span } => match op.as_str() {
                "&&" => {
                    let l = self.eval_expr(env, left)?;
                    if l.is_truthy() {
                        self.eval_expr(env, right)
                    } else {
                        Ok(l)
                    }
                }
                "||" => {
                    let l = self.eval_expr(env, left)?;
                    if l.is_truthy() {
                        Ok(l)
                    } else {
                        self.eval_expr(env, right)
                    }
                }
                _ => {
                    let l = self.eval_expr(env, left)?;
                    let r = self.eval_expr(env, right)?;
                    self.binary_values(op, l, r, *span)
                }
            },

            Expr::Call { callee, args, site_id, span } => {
                let site_name = match callee.as_ref() {
                    Expr::Ident { name, .. } => name.clone(),
                    _ => DYNAMIC_CALLEE.clone(),
                };
                let func = self.eval_expr(env, callee)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(env, arg)?);
                }
                let key = func.type_key();
                if self.ic.lookup(*site_id, key).is_none() {
                    self.ic.update(*site_id, &site_name, key, DispatchTarget::Callable);
                }
                self.call_value(func, values, *span)
            }

            Expr::MethodCall { object, method, args, site_id, span } => {
                let receiver = self.eval_expr(env, object)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(env, arg)?);
                }
                self.dispatch_method(receiver, method, values, *site_id, *span)
            }

            Expr::Index { object, index, site_id, span } => {
                let object = self.eval_expr(env, object)?;
                let index = self.eval_expr(env, index)?;
                let key = object.type_key();
                if self.ic.lookup(*site_id, key).is_none() {
                    let target = match key {
                        TypeKey::Dict => DispatchTarget::DictEntry,
                        TypeKey::Object => DispatchTarget::ObjectField,
                        _ => DispatchTarget::Element,
                    };
                    self.ic.update(*site_id, &INDEX_SITE, key, target);
                }
                self.index_get(&object, &index, *span)
            }

            Expr::Member { object, member, site_id, span } => {
                let object = self.eval_expr(env, object)?;
                let key = object.type_key();
                if self.ic.lookup(*site_id, key).is_none() {
                    let target = match key {
                        TypeKey::Dict => DispatchTarget::DictEntry,
                        _ => DispatchTarget::ObjectField,
                    };
                    self.ic.update(*site_id, member, key, target);
                }
                self.member_get(&object, member, *span)
            }

            Expr::Assign { target, value, span } => {
                let value = self.eval_expr(env, value)?;
                self.assign_target(env, target, value.clone(), *span)?;
                Ok(value)
            }

            Expr::ListLit { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(env, item)?);
                }
                Ok(Value::list(values))
            }

            Expr::TupleLit { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(env, item)?);
                }
                Ok(Value::Tuple(values.into()))
            }

            Expr::DictLit { entries, .. } => {
                let mut map = DictMap::new();
                for (key, value_expr) in entries {
                    let value = self.eval_expr(env, value_expr)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::dict(map))
            }

            Expr::Function { def, .. } => {
                let ticket = self.arena.ticket(env);
                Ok(Value::Function(Arc::new(FunctionValue {
                    kind: FunctionKind::User { decl: def.clone(), env, ticket },
                })))
            }

            Expr::Match { scrutinee, arms, span } => {
                let (flow, value) = self.exec_match(env, scrutinee, arms, *span)?;
                match flow {
                    Flow::Normal => Ok(value),
                    _ => Err(self.raise(
                        ErrorKind::Runtime,
                        "control flow cannot leave a match used as an expression",
                        *span,
                    )),
                }
            }
        }
    }

    fn assign_target(
        &mut self,
        env: EnvId,
        target: &Expr,
        value: Value,
        span: Span,
    ) -> Result<(), Thrown> {
        match target {
            Expr::Ident { name, .. } => self
                .arena
                .assign(env, name, value)
                .map_err(|e| self.assign_error(e, name, span)),
            Expr::Index { object, index, .. } => {
                let object = self.eval_expr(env, object)?;
                let index = self.eval_expr(env, index)?;
                self.index_set(&object, &index, value, span)
            }
            Expr::Member { object, member, .. } => {
                let object = self.eval_expr(env, object)?;
                self.member_set(&object, member, value, span)
            }
            _ => Err(self.raise(ErrorKind::Type, "invalid assignment target", span)),
        }
    }

    // -----------------------------------------------------------------
    // Operators, shared with the IR interpreter
    // -----------------------------------------------------------------

    pub(crate) fn unary_value(
        &self,
        op: &str,
        value: Value,
        span: Span,
    ) -> Result<Value, Thrown> {
        match op {
            "!" => Ok(Value::Bool(!value.is_truthy())),
            "-" => match value {
                Value::Num(n) => Ok(Value::Num(-n)),
                other => Err(self.raise(
                    ErrorKind::Type,
                    format!("cannot negate {}", other.type_name()),
                    span,
                )),
            },
            other => Err(self.raise(
                ErrorKind::Type,
                format!("unknown unary operator '{}'", other),
                span,
            )),
        }
    }

    pub(crate) fn binary_values(
        &self,
        op: &str,
        l: Value,
        r: Value,
        span: Span,
    ) -> Result<Value, Thrown> {
        match op {
            "+" => match (&l, &r) {
                (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
                (Value::Str(a), Value::Str(b)) => {
                    let mut joined = String::with_capacity(a.len() + b.len());
                    joined.push_str(a);
                    joined.push_str(b);
                    Ok(Value::str(&joined))
                }
                _ => Err(self.operand_error(op, &l, &r, span)),
            },
            "-" | "*" | "/" | "%" => {
                let (Value::Num(a), Value::Num(b)) = (&l, &r) else {
                    return Err(self.operand_error(op, &l, &r, span));
                };
                match op {
                    "-" => Ok(Value::Num(a - b)),
                    "*" => Ok(Value::Num(a * b)),
                    "/" => {
                        if *b == 0.0 {
                            Err(self.raise(ErrorKind::DivisionByZero, "division by zero", span))
                        } else {
                            Ok(Value::Num(a / b))
                        }
                    }
                    _ => {
                        if *b == 0.0 {
                            Err(self.raise(
                                ErrorKind::DivisionByZero,
                                "modulo by zero",
                                span,
                            ))
                        } else {
                            Ok(Value::Num(a % b))
                        }
                    }
                }
            }
            "<" | "<=" | ">" | ">=" => {
                let (Value::Num(a), Value::Num(b)) = (&l, &r) else {
                    return Err(self.operand_error(op, &l, &r, span));
                };
                let result = match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                };
                Ok(Value::Bool(result))
            }
            "==" => Ok(Value::Bool(values_equal(&l, &r))),
            "!=" => Ok(Value::Bool(!values_equal(&l, &r))),
            other => Err(self.raise(
                ErrorKind::Type,
                format!("unknown operator '{}'", other),
                span,
            )),
        }
    }

    fn operand_error(&self, op: &str, l: &Value, r: &Value, span: Span) -> Thrown {
        self.raise(
            ErrorKind::Type,
            format!(
                "unsupported operand types for '{}': {} and {}",
                op,
                l.type_name(),
                r.type_name()
            ),
            span,
        )
    }

    // -----------------------------------------------------------------
    // Indexing and members
    // -----------------------------------------------------------------

    fn sequence_index(&self, n: f64, len: usize, span: Span) -> Result<usize, Thrown> {
        if n.fract() != 0.0 {
            return Err(self.raise(
                ErrorKind::Index,
                format!("index {} is not an integer", n),
                span,
            ));
        }
        let mut idx = n as i64;
        if idx < 0 {
            idx += len as i64;
        }
        if idx < 0 || idx as usize >= len {
            return Err(self.raise(
                ErrorKind::Index,
                format!("index {} out of range for length {}", n, len),
                span,
            ));
        }
        Ok(idx as usize)
    }

    pub(crate) fn index_get(
        &mut self,
        object: &Value,
        index: &Value,
        span: Span,
    ) -> Result<Value, Thrown> {
        match (object, index) {
            (Value::List(l), Value::Num(n)) => {
                let items = l.read();
                let idx = self.sequence_index(*n, items.len(), span)?;
                Ok(items[idx].clone())
            }
            (Value::Tuple(t), Value::Num(n)) => {
                let idx = self.sequence_index(*n, t.len(), span)?;
                Ok(t[idx].clone())
            }
            (Value::Array(a), Value::Num(n)) => {
                let items = a.read();
                let idx = self.sequence_index(*n, items.len(), span)?;
                Ok(items[idx].clone())
            }
            (Value::Str(s), Value::Num(n)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = self.sequence_index(*n, chars.len(), span)?;
                Ok(Value::Str(Arc::from(chars[idx].to_string().as_str())))
            }
            (Value::Range(r), Value::Num(n)) => {
                let idx = self.sequence_index(*n, r.len(), span)?;
                Ok(Value::Num(r.start + r.step * idx as f64))
            }
            (Value::Dict(d), Value::Str(key)) => {
                d.read().get(key).cloned().ok_or_else(|| {
                    self.raise(ErrorKind::Key, format!("missing key '{}'", key), span)
                })
            }
            (Value::Object(o), Value::Str(key)) => {
                o.read().fields.get(key).cloned().ok_or_else(|| {
                    self.raise(ErrorKind::Key, format!("missing field '{}'", key), span)
                })
            }
            (Value::Null, _) => {
                Err(self.raise(ErrorKind::Null, "cannot index into null", span))
            }
            (Value::Dict(_), other) => Err(self.raise(
                ErrorKind::Type,
                format!("dict keys are strings, got {}", other.type_name()),
                span,
            )),
            (obj, idx) => Err(self.raise(
                ErrorKind::Type,
                format!("cannot index {} with {}", obj.type_name(), idx.type_name()),
                span,
            )),
        }
    }

    pub(crate) fn index_set(
        &mut self,
        object: &Value,
        index: &Value,
        value: Value,
        span: Span,
    ) -> Result<(), Thrown> {
        match (object, index) {
            (Value::List(l), Value::Num(n)) => {
                let len = l.read().len();
                let idx = self.sequence_index(*n, len, span)?;
                l.write()[idx] = value;
                Ok(())
            }
            (Value::Array(a), Value::Num(n)) => {
                let len = a.read().len();
                let idx = self.sequence_index(*n, len, span)?;
                a.write()[idx] = value;
                Ok(())
            }
            (Value::Dict(d), Value::Str(key)) => {
                d.write().insert(key.clone(), value);
                Ok(())
            }
            (Value::Object(o), Value::Str(key)) => {
                o.write().fields.insert(key.clone(), value);
                Ok(())
            }
            (Value::Tuple(_), _) => {
                Err(self.raise(ErrorKind::Type, "tuples are immutable", span))
            }
            (Value::Str(_), _) => {
                Err(self.raise(ErrorKind::Type, "strings are immutable", span))
            }
            (Value::Null, _) => {
                Err(self.raise(ErrorKind::Null, "cannot index into null", span))
            }
            (obj, idx) => Err(self.raise(
                ErrorKind::Type,
                format!(
                    "cannot assign into {} with {} index",
                    obj.type_name(),
                    idx.type_name()
                ),
                span,
            )),
        }
    }

    pub(crate) fn member_get(
        &mut self,
        object: &Value,
        member: &str,
        span: Span,
    ) -> Result<Value, Thrown> {
        match object {
            Value::Object(o) => o.read().fields.get(member).cloned().ok_or_else(|| {
                self.raise(
                    ErrorKind::Attribute,
                    format!("no field '{}' on {}", member, o.read().class_name),
                    span,
                )
            }),
            Value::Dict(d) => d.read().get(member).cloned().ok_or_else(|| {
                self.raise(
                    ErrorKind::Attribute,
                    format!("no entry '{}' in dict", member),
                    span,
                )
            }),
            Value::Null => Err(self.raise(
                ErrorKind::Null,
                format!("cannot read '{}' of null", member),
                span,
            )),
            other => Err(self.raise(
                ErrorKind::Attribute,
                format!("{} has no field '{}'", other.type_name(), member),
                span,
            )),
        }
    }

    pub(crate) fn member_set(
        &mut self,
        object: &Value,
        member: &Arc<str>,
        value: Value,
        span: Span,
    ) -> Result<(), Thrown> {
        match object {
            Value::Object(o) => {
                o.write().fields.insert(member.clone(), value);
                Ok(())
            }
            Value::Dict(d) => {
                d.write().insert(member.clone(), value);
                Ok(())
            }
            Value::Null => Err(self.raise(
                ErrorKind::Null,
                format!("cannot set '{}' on null", member),
                span,
            )),
            other => Err(self.raise(
                ErrorKind::Attribute,
                format!("cannot set field '{}' on {}", member, other.type_name()),
                span,
            )),
        }
    }

    // -----------------------------------------------------------------
    // Method dispatch through the inline cache
    // -----------------------------------------------------------------

    fn dispatch_method(
        &mut self,
        receiver: Value,
        method: &Arc<str>,
        args: Vec<Value>,
        site_id: u32,
        span: Span,
    ) -> Result<Value, Thrown> {
        let key = receiver.type_key();

        if let Some(target) = self.ic.lookup(site_id, key) {
            match target {
                DispatchTarget::BuiltinMethod(idx) => {
                    let f = METHOD_TABLE[idx as usize].f;
                    return f(self, &receiver, args, span);
                }
                DispatchTarget::ObjectField | DispatchTarget::DictEntry => {
                    let callee = self.member_get(&receiver, method, span)?;
                    return self.call_value(callee, args, span);
                }
                DispatchTarget::Element | DispatchTarget::Callable => {
                    // Stale shape for a method site; re-resolve below.
                    self.ic.invalidate(site_id);
                }
            }
        }

        // Slow path: resolve and record the dispatch.
        if let Some(idx) = find_method(key, method) {
            self.ic
                .update(site_id, method, key, DispatchTarget::BuiltinMethod(idx));
            let f = METHOD_TABLE[idx as usize].f;
            return f(self, &receiver, args, span);
        }

        match &receiver {
            Value::Object(_) => {
                let callee = self.member_get(&receiver, method, span)?;
                self.ic.update(site_id, method, key, DispatchTarget::ObjectField);
                self.call_value(callee, args, span)
            }
            Value::Dict(_) => {
                let callee = self.member_get(&receiver, method, span)?;
                self.ic.update(site_id, method, key, DispatchTarget::DictEntry);
                self.call_value(callee, args, span)
            }
            Value::Null => {
                Err(self.raise(ErrorKind::Null, format!("cannot call '{}' on null", method), span))
            }
            other => Err(self.raise(
                ErrorKind::Attribute,
                format!("no method '{}' on {}", method, other.type_name()),
                span,
            )),
        }
    }

    // -----------------------------------------------------------------
    // match expressions
    // -----------------------------------------------------------------

    /// Evaluate a match. Returns the selected arm's flow along with its
    /// value; no matching arm yields null. Bindings from the pattern
    /// are committed to the arm's scope only after pattern and guard
    /// both succeed; a failed guard discards them with the trial frame.
    pub(crate) fn exec_match(
        &mut self,
        env: EnvId,
        scrutinee: &Expr,
        arms: &[MatchArm],
        span: Span,
    ) -> Result<(Flow, Value), Thrown> {
        let value = self.eval_expr(env, scrutinee)?;

        for arm in arms {
            let mut binds = Vec::new();
            let matched = pattern::match_pattern(
                &value,
                &arm.pattern,
                &mut binds,
                0,
                self.config.max_match_depth,
                self.config.strict_match,
            )
            .map_err(|_| {
                self.raise(ErrorKind::Runtime, "pattern match depth exceeded", span)
            })?;
            if !matched {
                continue;
            }

            let frame = self.arena.alloc(Some(env));
            for (name, bound) in binds {
                if let Err(e) = self.arena.define(frame, name.clone(), bound, false) {
                    let err = self.assign_error(e, &name, arm.span);
                    self.arena.release(frame);
                    return Err(err);
                }
            }

            if let Some(guard) = &arm.guard {
                match self.eval_expr(frame, guard) {
                    Ok(cond) if !cond.is_truthy() => {
                        self.arena.release(frame);
                        continue;
                    }
                    Err(e) => {
                        self.arena.release(frame);
                        return Err(e);
                    }
                    Ok(_) => {}
                }
            }

            let result = self.exec_arm_body(frame, &arm.body);
            self.arena.release(frame);
            return result;
        }
        Ok((Flow::Normal, Value::Null))
    }

    /// An arm's value is the value of its last expression statement.
    fn exec_arm_body(&mut self, frame: EnvId, body: &[Stmt]) -> Result<(Flow, Value), Thrown> {
        let mut last = Value::Null;
        for stmt in body {
            match stmt {
                Stmt::Expr(Expr::Match { scrutinee, arms, span }) => {
                    let (flow, value) = self.exec_match(frame, scrutinee, arms, *span)?;
                    if !matches!(flow, Flow::Normal) {
                        return Ok((flow, Value::Null));
                    }
                    last = value;
                }
                Stmt::Expr(expr) => {
                    last = self.eval_expr(frame, expr)?;
                }
                other => {
                    let flow = self.exec_stmt(frame, other)?;
                    if !matches!(flow, Flow::Normal) {
                        return Ok((flow, Value::Null));
                    }
                }
            }
        }
        Ok((Flow::Normal, last))
    }

    // -----------------------------------------------------------------
    // Baseline tier: IR interpreter
    // -----------------------------------------------------------------

    /// Execute a function's IR with full value semantics. Shares the
    /// operator helpers with the tree-walk, re-enters the coordinator
    /// for CALL (resolving the callee through the closure chain), and
    /// reports positions at the function's entry span.
    pub(crate) fn run_ir(
        &mut self,
        jf: &Arc<JitFunction>,
        closure_env: EnvId,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, Thrown> {
        let mut locals: Vec<Option<Value>> = vec![None; jf.names.len()];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = Some(arg);
        }
        let mut stack: Vec<Value> = Vec::with_capacity(16);
        let mut ip = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| {
                    self.raise(ErrorKind::Runtime, "operand stack underflow", span)
                })?
            };
        }

        while ip < jf.code.len() {
            match jf.code[ip] {
                Ir::LoadConst(Const::Num(n)) => stack.push(Value::Num(n)),
                Ir::LoadConst(Const::Bool(b)) => stack.push(Value::Bool(b)),
                Ir::LoadConst(Const::Null) => stack.push(Value::Null),
                Ir::LoadString(idx) => {
                    stack.push(Value::Str(jf.strings[idx as usize].clone()))
                }
                Ir::LoadVar(slot) => match &locals[slot as usize] {
                    Some(value) => stack.push(value.clone()),
                    None => {
                        return Err(self.raise(
                            ErrorKind::Name,
                            format!("undefined variable '{}'", jf.names[slot as usize]),
                            span,
                        ))
                    }
                },
                Ir::StoreVar(slot) => {
                    let value = pop!();
                    locals[slot as usize] = Some(value);
                }
                Ir::Add | Ir::Sub | Ir::Mul | Ir::Div
                | Ir::CompareEq | Ir::CompareLt | Ir::CompareGt => {
                    let r = pop!();
                    let l = pop!();
                    let op = match jf.code[ip] {
                        Ir::Add => "+",
                        Ir::Sub => "-",
                        Ir::Mul => "*",
                        Ir::Div => "/",
                        Ir::CompareEq => "==",
                        Ir::CompareLt => "<",
                        _ => ">",
                    };
                    stack.push(self.binary_values(op, l, r, span)?);
                }
                Ir::Neg => {
                    let value = pop!();
                    stack.push(self.unary_value("-", value, span)?);
                }
                Ir::Not => {
                    let value = pop!();
                    stack.push(Value::Bool(!value.is_truthy()));
                }
                Ir::ShiftLeft(k) => {
                    let value = pop!();
                    let factor = Value::Num((2f64).powi(k as i32));
                    stack.push(self.binary_values("*", value, factor, span)?);
                }
                Ir::Call { name, argc } => {
                    let mut call_args = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        call_args.push(pop!());
                    }
                    call_args.reverse();
                    let fn_name = &jf.names[name as usize];
                    let callee = self.arena.lookup(closure_env, fn_name).ok_or_else(|| {
                        self.raise(
                            ErrorKind::Name,
                            format!("undefined variable '{}'", fn_name),
                            span,
                        )
                    })?;
                    let result = self.call_value(callee, call_args, span)?;
                    stack.push(result);
                }
                Ir::Print(argc) => {
                    let mut parts = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        parts.push(pop!().display());
                    }
                    parts.reverse();
                    self.write_line(&parts.join(" "));
                }
                Ir::Return => {
                    return Ok(stack.pop().unwrap_or(Value::Null));
                }
                Ir::Jump(target) => {
                    ip = target as usize;
                    continue;
                }
                Ir::JumpIfFalse(target) => {
                    let value = pop!();
                    if !value.is_truthy() {
                        ip = target as usize;
                        continue;
                    }
                }
            }
            ip += 1;
        }
        Ok(Value::Null)
    }

    // -----------------------------------------------------------------
    // Imports
    // -----------------------------------------------------------------

    fn exec_import(
        &mut self,
        env: EnvId,
        spec: &Arc<str>,
        alias: Option<&Arc<str>>,
        selective: &[(Arc<str>, Option<Arc<str>>)],
        span: Span,
    ) -> Result<(), Thrown> {
        let handle = self.resolver.resolve(spec).map_err(|e| {
            self.raise(
                ErrorKind::Import,
                format!("cannot import '{}': {}", spec, e.message),
                span,
            )
        })?;
        let exports = handle.into_exports();

        if selective.is_empty() {
            // Bind the whole module as a dict of callables.
            let mut map = DictMap::new();
            let mut names = Vec::new();
            for export in exports {
                names.push(export.name.clone());
                map.insert(export.name.clone(), export.into_value());
            }
            let module_name = match alias {
                Some(alias) => alias.clone(),
                None => module_name_of(spec),
            };
            self.arena
                .define(env, module_name.clone(), Value::dict(map), false)
                .map_err(|e| self.assign_error(e, &module_name, span))?;
            self.ic.invalidate_method(&module_name);
            for name in names {
                self.ic.invalidate_method(&name);
            }
        } else {
            for (wanted, as_name) in selective {
                let export = exports.iter().find(|e| e.name == *wanted).ok_or_else(|| {
                    self.raise(
                        ErrorKind::Import,
                        format!("module '{}' has no export '{}'", spec, wanted),
                        span,
                    )
                })?;
                let bind_as = as_name.as_ref().unwrap_or(wanted).clone();
                self.arena
                    .define(env, bind_as.clone(), export.clone().into_value(), false)
                    .map_err(|e| self.assign_error(e, &bind_as, span))?;
                self.ic.invalidate_method(&bind_as);
            }
        }
        Ok(())
    }
}

/// Module binding name: the last path segment of the spec, extension
/// stripped. The core never touches the file system; this is purely a
/// naming rule.
fn module_name_of(spec: &str) -> Arc<str> {
    let base = spec.rsplit(['/', '\\']).next().unwrap_or(spec);
    let base = base.split('.').next().unwrap_or(base);
    Arc::from(base)
}

fn catch_matches(arm: &CatchArm, thrown: &Thrown) -> bool {
    match &arm.kind {
        None => true,
        Some(kind_name) => {
            if kind_name.as_ref() == "Exception" {
                return true;
            }
            thrown.kind.is_a(&ErrorKind::from_name(kind_name))
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in method table
// ---------------------------------------------------------------------------

type MethodFn = fn(&mut Engine, &Value, Vec<Value>, Span) -> Result<Value, Thrown>;

pub(crate) struct MethodDef {
    pub name: &'static str,
    pub key: TypeKey,
    pub f: MethodFn,
}

fn method_arity(
    engine: &Engine,
    name: &str,
    args: &[Value],
    expected: usize,
    span: Span,
) -> Result<(), Thrown> {
    if args.len() != expected {
        return Err(engine.raise(
            ErrorKind::Type,
            format!("{}() takes {} argument(s), got {}", name, expected, args.len()),
            span,
        ));
    }
    Ok(())
}

fn want_str(engine: &Engine, value: &Value, what: &str, span: Span) -> Result<Arc<str>, Thrown> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("{} expects a string, got {}", what, other.type_name()),
            span,
        )),
    }
}

macro_rules! str_receiver {
    ($v:expr) => {
        match $v {
            Value::Str(s) => s,
            _ => unreachable!("method table keyed by type"),
        }
    };
}

macro_rules! list_receiver {
    ($v:expr) => {
        match $v {
            Value::List(l) => l,
            _ => unreachable!("method table keyed by type"),
        }
    };
}

macro_rules! dict_receiver {
    ($v:expr) => {
        match $v {
            Value::Dict(d) => d,
            _ => unreachable!("method table keyed by type"),
        }
    };
}

pub(crate) static METHOD_TABLE: &[MethodDef] = &[
    // Strings
    MethodDef { name: "len", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        Ok(Value::Num(str_receiver!(v).chars().count() as f64))
    }},
    MethodDef { name: "upper", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "upper", &a, 0, s)?;
        Ok(Value::str(&str_receiver!(v).to_uppercase()))
    }},
    MethodDef { name: "lower", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "lower", &a, 0, s)?;
        Ok(Value::str(&str_receiver!(v).to_lowercase()))
    }},
    MethodDef { name: "trim", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "trim", &a, 0, s)?;
        Ok(Value::str(str_receiver!(v).trim()))
    }},
    MethodDef { name: "split", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "split", &a, 1, s)?;
        let sep = want_str(e, &a[0], "split()", s)?;
        let parts: Vec<Value> = str_receiver!(v)
            .split(sep.as_ref())
            .map(Value::str)
            .collect();
        Ok(Value::list(parts))
    }},
    MethodDef { name: "contains", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "contains", &a, 1, s)?;
        let needle = want_str(e, &a[0], "contains()", s)?;
        Ok(Value::Bool(str_receiver!(v).contains(needle.as_ref())))
    }},
    MethodDef { name: "starts_with", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "starts_with", &a, 1, s)?;
        let prefix = want_str(e, &a[0], "starts_with()", s)?;
        Ok(Value::Bool(str_receiver!(v).starts_with(prefix.as_ref())))
    }},
    MethodDef { name: "ends_with", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "ends_with", &a, 1, s)?;
        let suffix = want_str(e, &a[0], "ends_with()", s)?;
        Ok(Value::Bool(str_receiver!(v).ends_with(suffix.as_ref())))
    }},
    MethodDef { name: "replace", key: TypeKey::Str, f: |e, v, a, s| {
        method_arity(e, "replace", &a, 2, s)?;
        let from = want_str(e, &a[0], "replace()", s)?;
        let to = want_str(e, &a[1], "replace()", s)?;
        Ok(Value::str(&str_receiver!(v).replace(from.as_ref(), to.as_ref())))
    }},
    // Lists
    MethodDef { name: "len", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        Ok(Value::Num(list_receiver!(v).read().len() as f64))
    }},
    MethodDef { name: "push", key: TypeKey::List, f: |e, v, mut a, s| {
        method_arity(e, "push", &a, 1, s)?;
        list_receiver!(v).write().push(a.pop().expect("arity checked"));
        Ok(Value::Null)
    }},
    MethodDef { name: "pop", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "pop", &a, 0, s)?;
        list_receiver!(v)
            .write()
            .pop()
            .ok_or_else(|| e.raise(ErrorKind::Index, "pop() from an empty list", s))
    }},
    MethodDef { name: "first", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "first", &a, 0, s)?;
        Ok(list_receiver!(v).read().first().cloned().unwrap_or(Value::Null))
    }},
    MethodDef { name: "last", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "last", &a, 0, s)?;
        Ok(list_receiver!(v).read().last().cloned().unwrap_or(Value::Null))
    }},
    MethodDef { name: "contains", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "contains", &a, 1, s)?;
        let found = list_receiver!(v).read().iter().any(|item| values_equal(item, &a[0]));
        Ok(Value::Bool(found))
    }},
    MethodDef { name: "join", key: TypeKey::List, f: |e, v, a, s| {
        method_arity(e, "join", &a, 1, s)?;
        let sep = want_str(e, &a[0], "join()", s)?;
        let joined = list_receiver!(v)
            .read()
            .iter()
            .map(|item| item.display())
            .collect::<Vec<_>>()
            .join(sep.as_ref());
        Ok(Value::str(&joined))
    }},
    // Dicts
    MethodDef { name: "len", key: TypeKey::Dict, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        Ok(Value::Num(dict_receiver!(v).read().len() as f64))
    }},
    MethodDef { name: "keys", key: TypeKey::Dict, f: |e, v, a, s| {
        method_arity(e, "keys", &a, 0, s)?;
        let keys: Vec<Value> = dict_receiver!(v)
            .read()
            .keys()
            .map(|k| Value::Str(k.clone()))
            .collect();
        Ok(Value::list(keys))
    }},
    MethodDef { name: "values", key: TypeKey::Dict, f: |e, v, a, s| {
        method_arity(e, "values", &a, 0, s)?;
        let values: Vec<Value> = dict_receiver!(v).read().values().cloned().collect();
        Ok(Value::list(values))
    }},
    MethodDef { name: "has", key: TypeKey::Dict, f: |e, v, a, s| {
        method_arity(e, "has", &a, 1, s)?;
        let key = want_str(e, &a[0], "has()", s)?;
        Ok(Value::Bool(dict_receiver!(v).read().contains_key(&key)))
    }},
    MethodDef { name: "get", key: TypeKey::Dict, f: |e, v, a, s| {
        if a.is_empty() || a.len() > 2 {
            return Err(e.raise(
                ErrorKind::Type,
                format!("get() takes 1 or 2 argument(s), got {}", a.len()),
                s,
            ));
        }
        let key = want_str(e, &a[0], "get()", s)?;
        let fallback = a.get(1).cloned().unwrap_or(Value::Null);
        Ok(dict_receiver!(v).read().get(&key).cloned().unwrap_or(fallback))
    }},
    MethodDef { name: "remove", key: TypeKey::Dict, f: |e, v, a, s| {
        method_arity(e, "remove", &a, 1, s)?;
        let key = want_str(e, &a[0], "remove()", s)?;
        dict_receiver!(v)
            .write()
            .remove(&key)
            .ok_or_else(|| e.raise(ErrorKind::Key, format!("missing key '{}'", key), s))
    }},
    // Other sized receivers
    MethodDef { name: "len", key: TypeKey::Tuple, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        match v {
            Value::Tuple(t) => Ok(Value::Num(t.len() as f64)),
            _ => unreachable!("method table keyed by type"),
        }
    }},
    MethodDef { name: "len", key: TypeKey::Array, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        match v {
            Value::Array(arr) => Ok(Value::Num(arr.read().len() as f64)),
            _ => unreachable!("method table keyed by type"),
        }
    }},
    MethodDef { name: "len", key: TypeKey::Range, f: |e, v, a, s| {
        method_arity(e, "len", &a, 0, s)?;
        match v {
            Value::Range(r) => Ok(Value::Num(r.len() as f64)),
            _ => unreachable!("method table keyed by type"),
        }
    }},
];

pub(crate) fn find_method(key: TypeKey, name: &str) -> Option<u16> {
    METHOD_TABLE
        .iter()
        .position(|m| m.key == key && m.name == name)
        .map(|idx| idx as u16)
}
