/// Bolt AST definitions.
/// Two sum types, `Expr` and `Stmt`, with struct variants carrying the
/// span recorded at parse time. Every dynamic-dispatch expression
/// (call, method call, index, member) carries the `site_id` the parser
/// assigned to it; the inline cache is keyed by these ids.

use crate::errors::Span;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Program {
    pub stmts: Vec<Stmt>,
    /// One past the highest call-site id assigned to this program.
    pub site_count: u32,
    /// One past the highest function id assigned to this program.
    pub fn_count: u32,
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// A function declaration or anonymous function body. Shared behind an
/// `Arc` so closures reference their declaration without cloning it.
#[derive(Debug)]
pub struct FuncDef {
    pub fn_id: u32,
    pub name: Arc<str>,
    pub params: Vec<Arc<str>>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Patterns (match arms only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    /// Literal value: number, string, bool, null, or a negated number.
    Literal(Expr),
    /// Binds the value to a name; always succeeds.
    Ident(Arc<str>),
    Wildcard,
    Tuple(Vec<Pattern>),
    List {
        items: Vec<Pattern>,
        /// `...name` at the end binds the remaining elements as a list.
        rest: Option<Arc<str>>,
    },
    Object {
        /// Field name with an optional sub-pattern; a bare name binds
        /// the field value under that name.
        fields: Vec<(Arc<str>, Option<Pattern>)>,
        /// `...` at the end tolerates extra fields even in strict mode.
        rest: bool,
    },
    /// Type-tag patterns use the reserved type keywords.
    TypeTag(TypeTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Number,
    String,
    Bool,
}

// ---------------------------------------------------------------------------
// Type annotations (best-effort checked)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeAnn {
    String,
    Number,
    Bool,
    Void,
    Any,
}

impl TypeAnn {
    pub fn name(self) -> &'static str {
        match self {
            TypeAnn::String => "string",
            TypeAnn::Number => "number",
            TypeAnn::Bool => "bool",
            TypeAnn::Void => "void",
            TypeAnn::Any => "any",
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    Let {
        name: Arc<str>,
        ty: Option<TypeAnn>,
        value: Option<Expr>,
        is_const: bool,
        span: Span,
    },
    FuncDecl {
        def: Arc<FuncDef>,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        span: Span,
    },
    While {
        label: Option<Arc<str>>,
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    DoWhile {
        label: Option<Arc<str>>,
        body: Vec<Stmt>,
        cond: Expr,
        span: Span,
    },
    For {
        label: Option<Arc<str>>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Vec<Stmt>,
        span: Span,
    },
    ForIn {
        label: Option<Arc<str>>,
        var: Arc<str>,
        iterable: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Block(Vec<Stmt>),
    Print {
        args: Vec<Expr>,
        span: Span,
    },
    Import {
        spec: Arc<str>,
        alias: Option<Arc<str>>,
        /// `from "mod" import a, b as c` selects individual exports.
        selective: Vec<(Arc<str>, Option<Arc<str>>)>,
        span: Span,
    },
    Break {
        label: Option<Arc<str>>,
        span: Span,
    },
    Continue {
        label: Option<Arc<str>>,
        span: Span,
    },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchArm>,
        finally: Option<Vec<Stmt>>,
        span: Span,
    },
    Throw {
        value: Expr,
        span: Span,
    },
    Pass {
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub struct CatchArm {
    /// Error kind name to match; `None` matches every kind.
    pub kind: Option<Arc<str>>,
    /// Name the caught error object is bound to inside the arm.
    pub binding: Option<Arc<str>>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Expr {
    Null { span: Span },
    Bool { value: bool, span: Span },
    Num { value: f64, span: Span },
    Str { value: Arc<str>, span: Span },
    Ident { name: Arc<str>, span: Span },
    Unary {
        op: String,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        left: Box<Expr>,
        op: String,
        right: Box<Expr>,
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        site_id: u32,
        span: Span,
    },
    MethodCall {
        object: Box<Expr>,
        method: Arc<str>,
        args: Vec<Expr>,
        site_id: u32,
        span: Span,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        site_id: u32,
        span: Span,
    },
    Member {
        object: Box<Expr>,
        member: Arc<str>,
        site_id: u32,
        span: Span,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        span: Span,
    },
    ListLit {
        items: Vec<Expr>,
        span: Span,
    },
    TupleLit {
        items: Vec<Expr>,
        span: Span,
    },
    DictLit {
        entries: Vec<(Arc<str>, Expr)>,
        span: Span,
    },
    Function {
        def: Arc<FuncDef>,
        span: Span,
    },
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Null { span }
            | Expr::Bool { span, .. }
            | Expr::Num { span, .. }
            | Expr::Str { span, .. }
            | Expr::Ident { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Call { span, .. }
            | Expr::MethodCall { span, .. }
            | Expr::Index { span, .. }
            | Expr::Member { span, .. }
            | Expr::Assign { span, .. }
            | Expr::ListLit { span, .. }
            | Expr::TupleLit { span, .. }
            | Expr::DictLit { span, .. }
            | Expr::Function { span, .. }
            | Expr::Match { span, .. } => *span,
        }
    }
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr(e) => e.span(),
            Stmt::Block(stmts) => stmts.first().map(|s| s.span()).unwrap_or_default(),
            Stmt::Let { span, .. }
            | Stmt::FuncDecl { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::For { span, .. }
            | Stmt::ForIn { span, .. }
            | Stmt::Print { span, .. }
            | Stmt::Import { span, .. }
            | Stmt::Break { span, .. }
            | Stmt::Continue { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Throw { span, .. }
            | Stmt::Pass { span } => *span,
        }
    }
}
