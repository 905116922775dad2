/// Built-in functions.
/// Each builtin is a trait object with fixed dispatch registered at
/// engine construction; host embedders override one by registering a
/// replacement under the same name. Calling a builtin allocates no
/// call frame.

use crate::engine::Engine;
use crate::errors::Span;
use crate::exceptions::{ErrorKind, Thrown};
use crate::tasks::{TaskId, TaskOutcome};
use crate::value::{format_number, DictMap, ObjectData, RangeValue, Value};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

pub trait Builtin: Send + Sync {
    fn name(&self) -> &str;
    /// Exact argument count, or `None` for variadic builtins.
    fn arity(&self) -> Option<usize>;
    fn call(&self, engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown>;
}

type NativeFn = fn(&mut Engine, Vec<Value>, Span) -> Result<Value, Thrown>;

struct NativeBuiltin {
    name: &'static str,
    arity: Option<usize>,
    f: NativeFn,
}

impl Builtin for NativeBuiltin {
    fn name(&self) -> &str {
        self.name
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }

    fn call(&self, engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
        (self.f)(engine, args, span)
    }
}

/// Register the default builtin set on a freshly built engine.
pub fn register_defaults(engine: &mut Engine) {
    let table: &[(&'static str, Option<usize>, NativeFn)] = &[
        ("print", None, builtin_print),
        ("printf", None, builtin_printf),
        ("len", Some(1), builtin_len),
        ("type", Some(1), builtin_type),
        ("range", None, builtin_range),
        ("str", Some(1), builtin_str),
        ("num", Some(1), builtin_num),
        ("abs", Some(1), builtin_abs),
        ("floor", Some(1), builtin_floor),
        ("ceil", Some(1), builtin_ceil),
        ("sqrt", Some(1), builtin_sqrt),
        ("min", Some(2), builtin_min),
        ("max", Some(2), builtin_max),
        ("push", Some(2), builtin_push),
        ("pop", Some(1), builtin_pop),
        ("keys", Some(1), builtin_keys),
        ("values", Some(1), builtin_values),
        ("assert", None, builtin_assert),
        ("error", Some(2), builtin_error),
        ("array", Some(2), builtin_array),
        ("clock", Some(0), builtin_clock),
        ("sleep", Some(1), builtin_sleep),
        ("spawn", None, builtin_spawn),
        ("async_await", Some(1), builtin_async_await),
        ("await_timeout", Some(2), builtin_await_timeout),
        ("cancel", Some(1), builtin_cancel),
    ];
    for &(name, arity, f) in table {
        engine.register_builtin(Arc::new(NativeBuiltin { name, arity, f }));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn want_num(engine: &Engine, value: &Value, what: &str, span: Span) -> Result<f64, Thrown> {
    match value {
        Value::Num(n) => Ok(*n),
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("{} expects a number, got {}", what, other.type_name()),
            span,
        )),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn builtin_print(engine: &mut Engine, args: Vec<Value>, _span: Span) -> Result<Value, Thrown> {
    let parts: Vec<String> = args.iter().map(|v| v.display()).collect();
    engine.write_line(&parts.join(" "));
    Ok(Value::Null)
}

fn builtin_printf(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let mut iter = args.into_iter();
    let fmt = match iter.next() {
        Some(Value::Str(s)) => s,
        Some(other) => {
            return Err(engine.raise(
                ErrorKind::Type,
                format!("printf expects a format string, got {}", other.type_name()),
                span,
            ))
        }
        None => {
            return Err(engine.raise(ErrorKind::Type, "printf expects a format string", span))
        }
    };

    let mut out = String::new();
    let mut chars = fmt.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let v = iter.next().unwrap_or(Value::Null);
                out.push_str(&v.display());
            }
            Some('d') => {
                let v = iter.next().unwrap_or(Value::Null);
                let n = want_num(engine, &v, "printf %d", span)?;
                out.push_str(&format!("{}", n.trunc() as i64));
            }
            Some('f') => {
                let v = iter.next().unwrap_or(Value::Null);
                let n = want_num(engine, &v, "printf %f", span)?;
                out.push_str(&format!("{:.6}", n));
            }
            Some('g') => {
                let v = iter.next().unwrap_or(Value::Null);
                let n = want_num(engine, &v, "printf %g", span)?;
                out.push_str(&format_number(n));
            }
            Some(other) => {
                return Err(engine.raise(
                    ErrorKind::Value,
                    format!("printf: unknown conversion '%{}'", other),
                    span,
                ))
            }
            None => {
                return Err(engine.raise(
                    ErrorKind::Value,
                    "printf: format string ends with '%'",
                    span,
                ))
            }
        }
    }
    engine.write_raw(&out);
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

fn builtin_len(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(l) => l.read().len(),
        Value::Dict(d) => d.read().len(),
        Value::Tuple(t) => t.len(),
        Value::Array(a) => a.read().len(),
        Value::Range(r) => r.len(),
        other => {
            return Err(engine.raise(
                ErrorKind::Type,
                format!("len() does not apply to {}", other.type_name()),
                span,
            ))
        }
    };
    Ok(Value::Num(n as f64))
}

fn builtin_type(_engine: &mut Engine, args: Vec<Value>, _span: Span) -> Result<Value, Thrown> {
    Ok(Value::str(args[0].type_name()))
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

fn builtin_range(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let (start, end, step) = match args.len() {
        1 => (0.0, want_num(engine, &args[0], "range", span)?, 1.0),
        2 => (
            want_num(engine, &args[0], "range", span)?,
            want_num(engine, &args[1], "range", span)?,
            1.0,
        ),
        3 => (
            want_num(engine, &args[0], "range", span)?,
            want_num(engine, &args[1], "range", span)?,
            want_num(engine, &args[2], "range", span)?,
        ),
        n => {
            return Err(engine.raise(
                ErrorKind::Type,
                format!("range() takes 1 to 3 arguments, got {}", n),
                span,
            ))
        }
    };
    if step == 0.0 {
        return Err(engine.raise(ErrorKind::Value, "range() step must not be zero", span));
    }
    Ok(Value::Range(Arc::new(RangeValue { start, end, step })))
}

fn builtin_str(_engine: &mut Engine, args: Vec<Value>, _span: Span) -> Result<Value, Thrown> {
    Ok(Value::str(&args[0].display()))
}

fn builtin_num(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    match &args[0] {
        Value::Num(n) => Ok(Value::Num(*n)),
        Value::Bool(b) => Ok(Value::Num(if *b { 1.0 } else { 0.0 })),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Num).map_err(|_| {
            engine.raise(
                ErrorKind::Value,
                format!("cannot convert '{}' to a number", s),
                span,
            )
        }),
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("num() does not apply to {}", other.type_name()),
            span,
        )),
    }
}

fn builtin_abs(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    Ok(Value::Num(want_num(engine, &args[0], "abs", span)?.abs()))
}

fn builtin_floor(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    Ok(Value::Num(want_num(engine, &args[0], "floor", span)?.floor()))
}

fn builtin_ceil(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    Ok(Value::Num(want_num(engine, &args[0], "ceil", span)?.ceil()))
}

fn builtin_sqrt(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    Ok(Value::Num(want_num(engine, &args[0], "sqrt", span)?.sqrt()))
}

fn builtin_min(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let a = want_num(engine, &args[0], "min", span)?;
    let b = want_num(engine, &args[1], "min", span)?;
    Ok(Value::Num(a.min(b)))
}

fn builtin_max(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let a = want_num(engine, &args[0], "max", span)?;
    let b = want_num(engine, &args[1], "max", span)?;
    Ok(Value::Num(a.max(b)))
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

fn builtin_push(engine: &mut Engine, mut args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let value = args.pop().expect("arity checked");
    match &args[0] {
        Value::List(l) => {
            l.write().push(value);
            Ok(Value::Null)
        }
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("push() expects a list, got {}", other.type_name()),
            span,
        )),
    }
}

fn builtin_pop(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    match &args[0] {
        Value::List(l) => l.write().pop().ok_or_else(|| {
            engine.raise(ErrorKind::Index, "pop() from an empty list", span)
        }),
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("pop() expects a list, got {}", other.type_name()),
            span,
        )),
    }
}

fn builtin_keys(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    match &args[0] {
        Value::Dict(d) => {
            let keys: Vec<Value> = d.read().keys().map(|k| Value::Str(k.clone())).collect();
            Ok(Value::list(keys))
        }
        Value::Object(o) => {
            let keys: Vec<Value> =
                o.read().fields.keys().map(|k| Value::Str(k.clone())).collect();
            Ok(Value::list(keys))
        }
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("keys() expects a dict, got {}", other.type_name()),
            span,
        )),
    }
}

fn builtin_values(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    match &args[0] {
        Value::Dict(d) => {
            let values: Vec<Value> = d.read().values().cloned().collect();
            Ok(Value::list(values))
        }
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("values() expects a dict, got {}", other.type_name()),
            span,
        )),
    }
}

fn builtin_array(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let len = want_num(engine, &args[0], "array", span)?;
    if len < 0.0 || len.fract() != 0.0 {
        return Err(engine.raise(
            ErrorKind::Value,
            "array() length must be a non-negative integer",
            span,
        ));
    }
    let fill = args[1].clone();
    let items = vec![fill; len as usize].into_boxed_slice();
    Ok(Value::Array(Arc::new(RwLock::new(items))))
}

// ---------------------------------------------------------------------------
// Errors and assertions
// ---------------------------------------------------------------------------

fn builtin_assert(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let cond = args.first().map(|v| v.is_truthy()).unwrap_or(false);
    if cond {
        return Ok(Value::Null);
    }
    let message = args
        .get(1)
        .map(|v| v.display())
        .unwrap_or_else(|| "assertion failed".to_string());
    Err(engine.raise(ErrorKind::Assertion, message, span))
}

/// `error(kind, message)` builds an error object that `throw` raises
/// under the given kind.
fn builtin_error(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let kind = match &args[0] {
        Value::Str(s) => s.clone(),
        other => {
            return Err(engine.raise(
                ErrorKind::Type,
                format!("error() kind must be a string, got {}", other.type_name()),
                span,
            ))
        }
    };
    let mut fields = DictMap::new();
    fields.insert(Arc::from("type"), Value::Str(kind.clone()));
    fields.insert(Arc::from("message"), Value::str(&args[1].display()));
    fields.insert(Arc::from("line"), Value::Num(span.line as f64));
    fields.insert(Arc::from("column"), Value::Num(span.column as f64));
    Ok(Value::Object(Arc::new(RwLock::new(ObjectData { class_name: kind, fields }))))
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

fn builtin_clock(engine: &mut Engine, _args: Vec<Value>, _span: Span) -> Result<Value, Thrown> {
    Ok(Value::Num(engine.elapsed().as_secs_f64()))
}

/// Blocking sleep; one of the two suspension points the evaluator has.
fn builtin_sleep(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let ms = want_num(engine, &args[0], "sleep", span)?;
    if ms > 0.0 {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn want_task(engine: &Engine, value: &Value, what: &str, span: Span) -> Result<TaskId, Thrown> {
    match value {
        Value::Task(id) => Ok(*id),
        other => Err(engine.raise(
            ErrorKind::Type,
            format!("{} expects a task, got {}", what, other.type_name()),
            span,
        )),
    }
}

/// `spawn(f, args...)` schedules a call of `f` on the event loop and
/// returns the task handle. Nothing runs until the task is awaited.
fn builtin_spawn(engine: &mut Engine, mut args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    if args.is_empty() {
        return Err(engine.raise(
            ErrorKind::Type,
            "spawn() takes a callable and its arguments",
            span,
        ));
    }
    let callee = args.remove(0);
    if !matches!(callee, Value::Function(_)) {
        return Err(engine.raise(
            ErrorKind::Type,
            format!("spawn() expects a function, got {}", callee.type_name()),
            span,
        ));
    }
    let id = engine.event_loop.spawn_call(callee, args);
    Ok(Value::Task(id))
}

/// `async_await(task)` runs the task to completion on the current
/// thread and yields its result. A cancelled or stopped task yields
/// null; a task whose callable raised re-raises here.
fn builtin_async_await(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let id = want_task(engine, &args[0], "async_await", span)?;
    match engine.drive_task(id, None, span) {
        TaskOutcome::Completed(value) => Ok(value),
        TaskOutcome::Failed(thrown) => Err(thrown),
        TaskOutcome::Cancelled | TaskOutcome::Stopped | TaskOutcome::TimedOut => Ok(Value::Null),
    }
}

/// `await_timeout(task, ms)` is `async_await` with a deadline: the
/// result is a dict `{status, value}`, and `status` is "timeout" when
/// the deadline passes. The task is NOT cancelled on timeout.
fn builtin_await_timeout(
    engine: &mut Engine,
    args: Vec<Value>,
    span: Span,
) -> Result<Value, Thrown> {
    let id = want_task(engine, &args[0], "await_timeout", span)?;
    let ms = want_num(engine, &args[1], "await_timeout", span)?;
    let timeout = Duration::from_millis(ms.max(0.0) as u64);
    let (status, value) = match engine.drive_task(id, Some(timeout), span) {
        TaskOutcome::Completed(value) => ("completed", value),
        TaskOutcome::Failed(thrown) => return Err(thrown),
        TaskOutcome::Cancelled => ("cancelled", Value::Null),
        TaskOutcome::TimedOut => ("timeout", Value::Null),
        TaskOutcome::Stopped => ("stopped", Value::Null),
    };
    let mut map = DictMap::new();
    map.insert(Arc::from("status"), Value::str(status));
    map.insert(Arc::from("value"), value);
    Ok(Value::dict(map))
}

/// Cooperative cancellation: sets the flag the task observes at its
/// next suspension point.
fn builtin_cancel(engine: &mut Engine, args: Vec<Value>, span: Span) -> Result<Value, Thrown> {
    let id = want_task(engine, &args[0], "cancel", span)?;
    engine.event_loop.cancel(id);
    Ok(Value::Null)
}
