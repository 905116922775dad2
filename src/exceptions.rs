/// Exception engine.
/// A thrown error is `{kind, message, line, column, cause?}` with the
/// traceback captured at throw time. Kinds form a small hierarchy under
/// `RuntimeError`; catch arms match a kind or any of its descendants.
/// Errors propagate through the evaluator as the `Err` side of its
/// result type; the nearest enclosing `try` that matches recovers.

use crate::errors::Span;
use crate::value::{DictMap, ObjectData, Value};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Runtime,
    Type,
    Index,
    Key,
    Null,
    Name,
    Attribute,
    Arithmetic,
    DivisionByZero,
    Io,
    FileNotFound,
    Network,
    Assertion,
    Import,
    Memory,
    Value,
    Custom(Arc<str>),
}

impl ErrorKind {
    pub fn name(&self) -> &str {
        match self {
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Null => "NullError",
            ErrorKind::Name => "NameError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::DivisionByZero => "DivisionByZeroError",
            ErrorKind::Io => "IOError",
            ErrorKind::FileNotFound => "FileNotFoundError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Assertion => "AssertionError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Memory => "MemoryError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Custom(name) => name,
        }
    }

    pub fn parent(&self) -> Option<ErrorKind> {
        match self {
            ErrorKind::Runtime => None,
            ErrorKind::DivisionByZero => Some(ErrorKind::Arithmetic),
            ErrorKind::FileNotFound | ErrorKind::Network => Some(ErrorKind::Io),
            _ => Some(ErrorKind::Runtime),
        }
    }

    /// Kind-hierarchy membership: a kind is-a itself and every ancestor.
    pub fn is_a(&self, other: &ErrorKind) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(kind) = cursor {
            if kind == *other {
                return true;
            }
            cursor = kind.parent();
        }
        false
    }

    /// Resolve a source-level name to a kind. Unknown names become
    /// user-defined kinds rooted directly under RuntimeError.
    pub fn from_name(name: &str) -> ErrorKind {
        match name {
            "RuntimeError" => ErrorKind::Runtime,
            "TypeError" => ErrorKind::Type,
            "IndexError" => ErrorKind::Index,
            "KeyError" => ErrorKind::Key,
            "NullError" => ErrorKind::Null,
            "NameError" => ErrorKind::Name,
            "AttributeError" => ErrorKind::Attribute,
            "ArithmeticError" => ErrorKind::Arithmetic,
            "DivisionByZeroError" => ErrorKind::DivisionByZero,
            "IOError" => ErrorKind::Io,
            "FileNotFoundError" => ErrorKind::FileNotFound,
            "NetworkError" => ErrorKind::Network,
            "AssertionError" => ErrorKind::Assertion,
            "ImportError" => ErrorKind::Import,
            "MemoryError" => ErrorKind::Memory,
            "ValueError" => ErrorKind::Value,
            other => ErrorKind::Custom(Arc::from(other)),
        }
    }

    /// True for names a catch clause can use as a kind filter.
    pub fn is_known_kind_name(name: &str) -> bool {
        matches!(
            name,
            "RuntimeError"
                | "TypeError"
                | "IndexError"
                | "KeyError"
                | "NullError"
                | "NameError"
                | "AttributeError"
                | "ArithmeticError"
                | "DivisionByZeroError"
                | "IOError"
                | "FileNotFoundError"
                | "NetworkError"
                | "AssertionError"
                | "ImportError"
                | "MemoryError"
                | "ValueError"
                | "Exception"
        )
    }
}

// ---------------------------------------------------------------------------
// Thrown errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: Arc<str>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct Thrown {
    pub kind: ErrorKind,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub cause: Option<Box<Thrown>>,
    /// Frames innermost-first, captured when the error was raised.
    pub traceback: Vec<TraceFrame>,
}

impl Thrown {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Thrown {
        Thrown {
            kind,
            message: message.into(),
            line: span.line,
            column: span.column,
            cause: None,
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, frames: Vec<TraceFrame>) -> Thrown {
        self.traceback = frames;
        self
    }

    /// The value a catch arm binds: an object whose fields expose the
    /// error to the program (`e.type`, `e.message`, `e.line`, ...).
    pub fn to_value(&self) -> Value {
        let mut fields = DictMap::new();
        fields.insert(Arc::from("type"), Value::str(self.kind.name()));
        fields.insert(Arc::from("message"), Value::str(&self.message));
        fields.insert(Arc::from("line"), Value::Num(self.line as f64));
        fields.insert(Arc::from("column"), Value::Num(self.column as f64));
        if let Some(cause) = &self.cause {
            fields.insert(Arc::from("cause"), cause.to_value());
        }
        Value::Object(Arc::new(RwLock::new(ObjectData {
            class_name: Arc::from(self.kind.name()),
            fields,
        })))
    }

    /// Turn a thrown value back into an error. Strings raise a
    /// RuntimeError with that message; error objects (as produced by
    /// `to_value` or the `error` builtin) keep their kind and cause.
    pub fn from_value(value: &Value, span: Span) -> Thrown {
        match value {
            Value::Str(s) => Thrown::new(ErrorKind::Runtime, s.to_string(), span),
            Value::Object(obj) => {
                let obj = obj.read();
                let kind = obj
                    .fields
                    .get("type")
                    .and_then(|v| match v {
                        Value::Str(s) => Some(ErrorKind::from_name(s)),
                        _ => None,
                    })
                    .unwrap_or_else(|| ErrorKind::from_name(&obj.class_name));
                let message = obj
                    .fields
                    .get("message")
                    .map(|v| v.display())
                    .unwrap_or_default();
                let line = obj
                    .fields
                    .get("line")
                    .and_then(|v| v.as_num())
                    .map(|n| n as u32)
                    .unwrap_or(span.line);
                let column = obj
                    .fields
                    .get("column")
                    .and_then(|v| v.as_num())
                    .map(|n| n as u32)
                    .unwrap_or(span.column);
                let cause = obj
                    .fields
                    .get("cause")
                    .map(|v| Box::new(Thrown::from_value(v, span)));
                Thrown { kind, message, line, column, cause, traceback: Vec::new() }
            }
            other => Thrown::new(
                ErrorKind::Runtime,
                format!("thrown value: {}", other.display()),
                span,
            ),
        }
    }

    /// Fatal rendering: `Kind: message at file:line:col` followed by
    /// the captured frames, innermost first.
    pub fn render(&self, source_name: &str) -> String {
        let mut out = format!(
            "{}: {} at {}:{}:{}",
            self.kind.name(),
            self.message,
            source_name,
            self.line,
            self.column
        );
        for frame in &self.traceback {
            out.push_str(&format!(
                "\n  in {} at {}:{}:{}",
                frame.function, source_name, frame.line, frame.column
            ));
        }
        if let Some(cause) = &self.cause {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.render(source_name));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_membership() {
        assert!(ErrorKind::DivisionByZero.is_a(&ErrorKind::Arithmetic));
        assert!(ErrorKind::DivisionByZero.is_a(&ErrorKind::Runtime));
        assert!(ErrorKind::FileNotFound.is_a(&ErrorKind::Io));
        assert!(ErrorKind::Index.is_a(&ErrorKind::Runtime));
        assert!(!ErrorKind::Index.is_a(&ErrorKind::Type));
        assert!(!ErrorKind::Runtime.is_a(&ErrorKind::Io));
    }

    #[test]
    fn custom_kinds_sit_under_runtime() {
        let kind = ErrorKind::from_name("ParityError");
        assert!(kind.is_a(&ErrorKind::Runtime));
        assert_eq!(kind.name(), "ParityError");
    }

    #[test]
    fn thrown_value_round_trip() {
        let thrown = Thrown::new(ErrorKind::Key, "missing 'x'", Span::default());
        let value = thrown.to_value();
        let back = Thrown::from_value(&value, Span::default());
        assert_eq!(back.kind, ErrorKind::Key);
        assert_eq!(back.message, "missing 'x'");
    }

    #[test]
    fn render_includes_position_and_frames() {
        let thrown = Thrown::new(ErrorKind::Type, "bad operand", Span::new(0, 1, 3, 7))
            .with_traceback(vec![TraceFrame {
                function: Arc::from("work"),
                line: 3,
                column: 7,
            }]);
        let text = thrown.render("demo.bolt");
        assert!(text.starts_with("TypeError: bad operand at demo.bolt:3:7"));
        assert!(text.contains("in work"));
    }
}
