/// Bolt runtime values.
/// A tagged union over the eleven value kinds. Mutable aggregates sit
/// behind `Arc<RwLock<..>>` so closures and host threads can share
/// them; strings are immutable `Arc<str>`. Dict entries preserve
/// insertion order and are looked up by string key.

use crate::ast::FuncDef;
use crate::builtins::Builtin;
use crate::env::{EnvId, EnvTicket};
use crate::tasks::TaskId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
    List(Arc<RwLock<Vec<Value>>>),
    Dict(Arc<RwLock<DictMap>>),
    Tuple(Arc<[Value]>),
    Array(Arc<RwLock<Box<[Value]>>>),
    Range(Arc<RangeValue>),
    Function(Arc<FunctionValue>),
    Object(Arc<RwLock<ObjectData>>),
    /// Handle to a task on the engine's event loop, produced by
    /// `spawn` and consumed by `async_await`/`await_timeout`/`cancel`.
    Task(TaskId),
}

/// Stable per-kind key used by the inline caches and JIT guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Null,
    Bool,
    Number,
    Str,
    List,
    Dict,
    Tuple,
    Array,
    Range,
    Function,
    Object,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeValue {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        if self.step == 0.0 {
            return 0;
        }
        let span = (self.end - self.start) / self.step;
        if span <= 0.0 {
            0
        } else {
            span.ceil() as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> RangeIter {
        RangeIter { current: self.start, remaining: self.len(), step: self.step }
    }
}

pub struct RangeIter {
    current: f64,
    remaining: usize,
    step: f64,
}

impl Iterator for RangeIter {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.remaining == 0 {
            return None;
        }
        let value = self.current;
        self.current += self.step;
        self.remaining -= 1;
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Ordered dictionary
// ---------------------------------------------------------------------------

/// Insertion-ordered string-keyed map: a vector of entries plus a
/// key-to-slot index for O(1) lookup.
#[derive(Default)]
pub struct DictMap {
    entries: Vec<(Arc<str>, Value)>,
    index: HashMap<Arc<str>, usize>,
}

impl DictMap {
    pub fn new() -> Self {
        DictMap::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn insert(&mut self, key: Arc<str>, value: Value) {
        match self.index.get(&key) {
            Some(&slot) => self.entries[slot].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let slot = self.index.remove(key)?;
        let (_, value) = self.entries.remove(slot);
        for s in self.index.values_mut() {
            if *s > slot {
                *s -= 1;
            }
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Arc<str>, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Arc<str>> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// A named record with ordered fields. The exception engine materializes
/// caught errors as objects so handlers can read `e.type` and friends.
pub struct ObjectData {
    pub class_name: Arc<str>,
    pub fields: DictMap,
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

pub struct FunctionValue {
    pub kind: FunctionKind,
}

pub enum FunctionKind {
    /// A user function paired with the environment it was created in.
    /// The ticket keeps the captured frame alive in the arena for as
    /// long as any clone of this value exists.
    User {
        decl: Arc<FuncDef>,
        env: EnvId,
        #[allow(dead_code)]
        ticket: EnvTicket,
    },
    /// Built-in with fixed dispatch; calling one allocates no frame.
    Native(Arc<dyn Builtin>),
}

impl FunctionValue {
    pub fn name(&self) -> Arc<str> {
        match &self.kind {
            FunctionKind::User { decl, .. } => decl.name.clone(),
            FunctionKind::Native(b) => Arc::from(b.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Value behaviour
// ---------------------------------------------------------------------------

impl Value {
    pub fn type_key(&self) -> TypeKey {
        match self {
            Value::Null => TypeKey::Null,
            Value::Bool(_) => TypeKey::Bool,
            Value::Num(_) => TypeKey::Number,
            Value::Str(_) => TypeKey::Str,
            Value::List(_) => TypeKey::List,
            Value::Dict(_) => TypeKey::Dict,
            Value::Tuple(_) => TypeKey::Tuple,
            Value::Array(_) => TypeKey::Array,
            Value::Range(_) => TypeKey::Range,
            Value::Function(_) => TypeKey::Function,
            Value::Object(_) => TypeKey::Object,
            Value::Task(_) => TypeKey::Task,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.type_key() {
            TypeKey::Null => "null",
            TypeKey::Bool => "bool",
            TypeKey::Number => "number",
            TypeKey::Str => "string",
            TypeKey::List => "list",
            TypeKey::Dict => "dict",
            TypeKey::Tuple => "tuple",
            TypeKey::Array => "array",
            TypeKey::Range => "range",
            TypeKey::Function => "function",
            TypeKey::Object => "object",
            TypeKey::Task => "task",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.read().is_empty(),
            Value::Dict(d) => !d.read().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Array(a) => !a.read().is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Function(_) => true,
            Value::Object(_) => true,
            Value::Task(_) => true,
        }
    }

    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn dict(map: DictMap) -> Value {
        Value::Dict(Arc::new(RwLock::new(map)))
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Human-readable rendering, as `print` shows it. Rendering stops
    /// descending past a fixed depth so self-referential containers
    /// terminate.
    pub fn display(&self) -> String {
        self.display_at(0)
    }

    const MAX_DISPLAY_DEPTH: usize = 16;

    fn display_at(&self, depth: usize) -> String {
        if depth > Self::MAX_DISPLAY_DEPTH {
            return "...".to_string();
        }
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::List(l) => {
                let items = l.read();
                let parts: Vec<String> =
                    items.iter().map(|v| v.display_quoted(depth + 1)).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(t) => {
                let parts: Vec<String> = t.iter().map(|v| v.display_quoted(depth + 1)).collect();
                format!("({})", parts.join(", "))
            }
            Value::Array(a) => {
                let items = a.read();
                let parts: Vec<String> =
                    items.iter().map(|v| v.display_quoted(depth + 1)).collect();
                format!("array[{}]", parts.join(", "))
            }
            Value::Dict(d) => {
                let map = d.read();
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.display_quoted(depth + 1)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range(r) => {
                format!(
                    "range({}, {}, {})",
                    format_number(r.start),
                    format_number(r.end),
                    format_number(r.step)
                )
            }
            Value::Function(f) => format!("<function {}>", f.name()),
            Value::Object(o) => {
                let obj = o.read();
                let parts: Vec<String> = obj
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.display_quoted(depth + 1)))
                    .collect();
                format!("<{} {{{}}}>", obj.class_name, parts.join(", "))
            }
            Value::Task(id) => format!("<task {}>", id),
        }
    }

    /// Like `display`, but strings keep their quotes. Used for elements
    /// inside containers.
    fn display_quoted(&self, depth: usize) -> String {
        match self {
            Value::Str(s) => format!("\"{}\"", s),
            other => other.display_at(depth),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Format a number the short way: integral values print without a
/// fractional part, everything else uses the shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// ---------------------------------------------------------------------------
// Structural equality
// ---------------------------------------------------------------------------

/// Structural equality. Numbers compare by IEEE-754 semantics, so
/// `NaN != NaN`. Containers compare element-wise with a cycle guard:
/// a pair of aggregates already on the comparison path is assumed
/// equal, which terminates self-referential structures. Ranges compare
/// as their element sequence, including against lists.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    let mut seen: Vec<(usize, usize)> = Vec::new();
    eq_inner(a, b, &mut seen)
}

fn eq_inner(a: &Value, b: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => Arc::ptr_eq(x, y),
        (Value::Task(x), Value::Task(y)) => x == y,
        (Value::Range(x), Value::Range(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| p == q)
        }
        (Value::Range(r), Value::List(l)) | (Value::List(l), Value::Range(r)) => {
            let items = l.read();
            r.len() == items.len()
                && r.iter().zip(items.iter()).all(|(n, v)| matches!(v, Value::Num(m) if *m == n))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            let key = (x.as_ptr() as usize, y.as_ptr() as usize);
            if key.0 == key.1 || seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let result =
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| eq_inner(p, q, seen));
            seen.pop();
            result
        }
        (Value::List(x), Value::List(y)) => {
            let key = (Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
            if key.0 == key.1 || seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let xs = x.read();
            let ys = y.read();
            let result =
                xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| eq_inner(p, q, seen));
            seen.pop();
            result
        }
        (Value::Array(x), Value::Array(y)) => {
            let key = (Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
            if key.0 == key.1 || seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let xs = x.read();
            let ys = y.read();
            let result =
                xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(p, q)| eq_inner(p, q, seen));
            seen.pop();
            result
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let key = (Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
            if key.0 == key.1 || seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let xs = x.read();
            let ys = y.read();
            let result = xs.len() == ys.len()
                && xs.iter().all(|(k, v)| match ys.get(k) {
                    Some(w) => eq_inner(v, w, seen),
                    None => false,
                });
            seen.pop();
            result
        }
        (Value::Object(x), Value::Object(y)) => {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            let key = (Arc::as_ptr(x) as usize, Arc::as_ptr(y) as usize);
            if seen.contains(&key) {
                return true;
            }
            seen.push(key);
            let xo = x.read();
            let yo = y.read();
            let result = xo.class_name == yo.class_name
                && xo.fields.len() == yo.fields.len()
                && xo.fields.iter().all(|(k, v)| match yo.fields.get(k) {
                    Some(w) => eq_inner(v, w, seen),
                    None => false,
                });
            seen.pop();
            result
        }
        _ => false,
    }
}
