/// Bolt front-end error types.
/// Lexical and syntactic errors carry a span; runtime errors live in
/// `exceptions.rs` because they participate in try/catch.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(start: u32, end: u32, line: u32, column: u32) -> Self {
        Span { start, end, line, column }
    }

    /// Combine two spans; position information comes from the earlier one.
    pub fn merge(self, other: Span) -> Span {
        if other.start < self.start {
            Span {
                start: other.start,
                end: self.end.max(other.end),
                line: other.line,
                column: other.column,
            }
        } else {
            Span {
                start: self.start,
                end: self.end.max(other.end),
                line: self.line,
                column: self.column,
            }
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span { start: 0, end: 0, line: 1, column: 1 }
    }
}

// ---------------------------------------------------------------------------
// Lexer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },
    #[error("unterminated block comment")]
    UnterminatedComment { span: Span },
    #[error("unrecognized character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnterminatedString { span }
            | LexError::UnterminatedComment { span }
            | LexError::UnexpectedCharacter { span, .. } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String, span: Span },
    #[error("invalid syntax in {context}")]
    InvalidSyntax { context: String, span: Span },
    #[error("unexpected end of input in {context}")]
    UnexpectedEof { context: String, span: Span },
    #[error("{0}")]
    Lex(LexError),
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. }
            | ParseError::InvalidSyntax { span, .. }
            | ParseError::UnexpectedEof { span, .. } => *span,
            ParseError::Lex(e) => e.span(),
        }
    }

    /// Render with position, the way the CLI reports it.
    pub fn render(&self, source_name: &str) -> String {
        let span = self.span();
        format!("{}:{}:{}: error: {}", source_name, span.line, span.column, self)
    }
}

// ---------------------------------------------------------------------------
// Checker diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub span: Span,
    pub hint: Option<String>,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warning",
        };
        write!(
            f,
            "{}:{}: [{}] {}",
            self.span.line, self.span.column, prefix, self.message
        )?;
        if let Some(ref hint) = self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
