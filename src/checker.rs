/// Best-effort static checks, run after parsing and before execution.
/// Errors refuse execution; warnings are reported and ignored. The
/// pass stays deliberately shallow for a dynamic language: it knows
/// about const bindings, loop context for break/continue, label
/// scoping, and literal initializers against declared annotations.

use crate::ast::{Expr, Program, Stmt, TypeAnn};
use crate::errors::{Diagnostic, DiagnosticLevel, Span};
use std::collections::HashSet;
use std::sync::Arc;

pub fn check(program: &Program) -> Vec<Diagnostic> {
    let mut checker = Checker::default();
    checker.check_block(&program.stmts);
    checker.diagnostics
}

#[derive(Default)]
struct Checker {
    diagnostics: Vec<Diagnostic>,
    /// Const names per lexical scope, innermost last.
    const_scopes: Vec<HashSet<Arc<str>>>,
    loop_depth: usize,
    labels: Vec<Arc<str>>,
}

impl Checker {
    fn error(&mut self, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Error,
            message,
            span,
            hint: None,
        });
    }

    fn error_with_hint(&mut self, message: String, hint: &str, span: Span) {
        self.diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Error,
            message,
            span,
            hint: Some(hint.to_string()),
        });
    }

    fn warn(&mut self, message: String, span: Span) {
        self.diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Warning,
            message,
            span,
            hint: None,
        });
    }

    fn is_const(&self, name: &str) -> bool {
        self.const_scopes.iter().any(|scope| scope.contains(name))
    }

    fn check_block(&mut self, stmts: &[Stmt]) {
        self.const_scopes.push(HashSet::new());
        for stmt in stmts {
            self.check_stmt(stmt);
        }
        self.const_scopes.pop();
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let { name, ty, value, is_const, span } => {
                if let Some(value) = value {
                    self.check_expr(value);
                    if let Some(ann) = ty {
                        self.check_annotation(name, *ann, value, *span);
                    }
                } else if *is_const {
                    self.warn(format!("constant '{}' has no initializer", name), *span);
                }
                if *is_const {
                    if let Some(scope) = self.const_scopes.last_mut() {
                        scope.insert(name.clone());
                    }
                }
            }
            Stmt::Expr(expr) | Stmt::Throw { value: expr, .. } => self.check_expr(expr),
            Stmt::FuncDecl { def, .. } => {
                // A function body is a fresh loop context.
                let depth = std::mem::take(&mut self.loop_depth);
                let labels = std::mem::take(&mut self.labels);
                self.check_block(&def.body);
                self.loop_depth = depth;
                self.labels = labels;
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.check_expr(value);
                }
            }
            Stmt::If { cond, then_body, else_body, .. } => {
                self.check_expr(cond);
                self.check_block(then_body);
                if let Some(else_body) = else_body {
                    self.check_block(else_body);
                }
            }
            Stmt::While { label, cond, body, .. } => {
                self.check_expr(cond);
                self.check_loop_body(label, body);
            }
            Stmt::DoWhile { label, body, cond, .. } => {
                self.check_expr(cond);
                self.check_loop_body(label, body);
            }
            Stmt::For { label, init, cond, step, body, .. } => {
                self.const_scopes.push(HashSet::new());
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(cond) = cond {
                    self.check_expr(cond);
                }
                if let Some(step) = step {
                    self.check_expr(step);
                }
                self.check_loop_body(label, body);
                self.const_scopes.pop();
            }
            Stmt::ForIn { label, iterable, body, .. } => {
                self.check_expr(iterable);
                self.check_loop_body(label, body);
            }
            Stmt::Block(stmts) => self.check_block(stmts),
            Stmt::Print { args, .. } => {
                for arg in args {
                    self.check_expr(arg);
                }
            }
            Stmt::Import { .. } | Stmt::Pass { .. } => {}
            Stmt::Break { label, span } => {
                if self.loop_depth == 0 {
                    self.error("break outside of a loop".to_string(), *span);
                } else if let Some(label) = label {
                    if !self.labels.contains(label) {
                        self.error_with_hint(
                            format!("no enclosing loop labeled '{}'", label),
                            "labels are written as `name: while ...`",
                            *span,
                        );
                    }
                }
            }
            Stmt::Continue { label, span } => {
                if self.loop_depth == 0 {
                    self.error("continue outside of a loop".to_string(), *span);
                } else if let Some(label) = label {
                    if !self.labels.contains(label) {
                        self.error(format!("no enclosing loop labeled '{}'", label), *span);
                    }
                }
            }
            Stmt::Try { body, catches, finally, .. } => {
                self.check_block(body);
                for arm in catches {
                    self.check_block(&arm.body);
                }
                if let Some(finally) = finally {
                    self.check_block(finally);
                }
            }
        }
    }

    fn check_loop_body(&mut self, label: &Option<Arc<str>>, body: &[Stmt]) {
        if let Some(label) = label {
            self.labels.push(label.clone());
        }
        self.loop_depth += 1;
        self.check_block(body);
        self.loop_depth -= 1;
        if label.is_some() {
            self.labels.pop();
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Assign { target, value, span } => {
                if let Expr::Ident { name, .. } = target.as_ref() {
                    if self.is_const(name) {
                        self.error(format!("cannot assign to constant '{}'", name), *span);
                    }
                }
                self.check_expr(target);
                self.check_expr(value);
            }
            Expr::Unary { operand, .. } => self.check_expr(operand),
            Expr::Binary { left, right, .. } => {
                self.check_expr(left);
                self.check_expr(right);
            }
            Expr::Call { callee, args, .. } => {
                self.check_expr(callee);
                for arg in args {
                    self.check_expr(arg);
                }
            }
            Expr::MethodCall { object, args, .. } => {
                self.check_expr(object);
                for arg in args {
                    self.check_expr(arg);
                }
            }
            Expr::Index { object, index, .. } => {
                self.check_expr(object);
                self.check_expr(index);
            }
            Expr::Member { object, .. } => self.check_expr(object),
            Expr::ListLit { items, .. } | Expr::TupleLit { items, .. } => {
                for item in items {
                    self.check_expr(item);
                }
            }
            Expr::DictLit { entries, .. } => {
                for (_, value) in entries {
                    self.check_expr(value);
                }
            }
            Expr::Function { def, .. } => {
                let depth = std::mem::take(&mut self.loop_depth);
                let labels = std::mem::take(&mut self.labels);
                self.check_block(&def.body);
                self.loop_depth = depth;
                self.labels = labels;
            }
            Expr::Match { scrutinee, arms, .. } => {
                self.check_expr(scrutinee);
                for arm in arms {
                    if let Some(guard) = &arm.guard {
                        self.check_expr(guard);
                    }
                    self.check_block(&arm.body);
                }
            }
            Expr::Null { .. }
            | Expr::Bool { .. }
            | Expr::Num { .. }
            | Expr::Str { .. }
            | Expr::Ident { .. } => {}
        }
    }

    /// Literal initializers are the only values the pass types.
    fn check_annotation(&mut self, name: &str, ann: TypeAnn, value: &Expr, span: Span) {
        let literal: Option<&'static str> = match value {
            Expr::Num { .. } => Some("number"),
            Expr::Str { .. } => Some("string"),
            Expr::Bool { .. } => Some("bool"),
            Expr::Null { .. } => Some("null"),
            _ => None,
        };
        let Some(literal) = literal else { return };

        let ok = match ann {
            TypeAnn::Any => true,
            TypeAnn::Number => literal == "number",
            TypeAnn::String => literal == "string",
            TypeAnn::Bool => literal == "bool",
            TypeAnn::Void => literal == "null",
        };
        if !ok {
            self.error(
                format!(
                    "'{}' is declared {} but initialized with a {} literal",
                    name,
                    ann.name(),
                    literal
                ),
                span,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn diags(src: &str) -> Vec<Diagnostic> {
        let (program, errors) = Parser::new(src).parse();
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        check(&program)
    }

    fn error_count(src: &str) -> usize {
        diags(src)
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
            .count()
    }

    #[test]
    fn const_reassignment_is_an_error() {
        assert_eq!(error_count("const k = 1\nk = 2"), 1);
        assert_eq!(error_count("let k = 1\nk = 2"), 0);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert_eq!(error_count("break"), 1);
        assert_eq!(error_count("while true { break }"), 0);
    }

    #[test]
    fn unknown_label_is_an_error() {
        assert_eq!(error_count("outer: while true { break inner }"), 1);
        assert_eq!(error_count("outer: while true { break outer }"), 0);
    }

    #[test]
    fn annotation_mismatch_is_an_error() {
        assert_eq!(error_count("let n: number = \"text\""), 1);
        assert_eq!(error_count("let n: number = 5"), 0);
        assert_eq!(error_count("let n: any = \"text\""), 0);
    }

    #[test]
    fn function_bodies_reset_loop_context() {
        // A break inside a function defined in a loop is not a break
        // of that loop.
        assert_eq!(error_count("while true { def f() { break } }"), 1);
    }

    #[test]
    fn const_without_initializer_warns() {
        let diagnostics = diags("const k");
        assert!(diagnostics
            .iter()
            .any(|d| d.level == DiagnosticLevel::Warning));
    }
}
