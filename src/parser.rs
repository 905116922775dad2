/// Bolt parser.
/// Recursive descent with precedence climbing for expressions. A
/// newline or ';' terminates a statement; `{ ... }` and `: ...` both
/// introduce blocks (the colon form runs to the next top-level
/// `def`/`function` or EOF). On the first error in a statement the
/// parser enters panic mode and synchronizes at the next statement
/// boundary, so one bad line produces one diagnostic; any recorded
/// error makes the engine refuse to execute the program.
///
/// Every call, method call, index and member expression receives a
/// `site_id` here; those ids key the inline caches at run time.

use crate::ast::{
    CatchArm, Expr, FuncDef, MatchArm, Pattern, Program, Stmt, TypeAnn, TypeTag,
};
use crate::errors::{ParseError, Span};
use crate::exceptions::ErrorKind;
use crate::lexer::{Lexer, Token};
use std::collections::VecDeque;
use std::sync::Arc;

pub struct Parser {
    tokens: VecDeque<(Token, Span)>,
    last_span: Span,
    next_site: u32,
    next_fn: u32,
    pub errors: Vec<ParseError>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser::with_id_bases(source, 0, 0)
    }

    /// Engines that parse more than one program (the REPL, embedders)
    /// pass their running counters so call-site and function ids stay
    /// unique across programs; caches and compiled code are keyed by
    /// these ids.
    pub fn with_id_bases(source: &str, site_base: u32, fn_base: u32) -> Self {
        let tokens = Lexer::new(source).tokenize();
        Parser {
            tokens: VecDeque::from(tokens),
            last_span: Span::default(),
            next_site: site_base,
            next_fn: fn_base,
            errors: Vec::new(),
        }
    }

    /// Parse a whole program. Returns the AST and every error found;
    /// a non-empty error list means the program must not run.
    pub fn parse(mut self) -> (Program, Vec<ParseError>) {
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_end() {
                break;
            }
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        let program = Program {
            stmts,
            site_count: self.next_site,
            fn_count: self.next_fn,
        };
        (program, self.errors)
    }

    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        if let Token::Error(msg) = self.peek() {
            let span = self.span();
            self.advance();
            return Err(ParseError::InvalidSyntax { context: msg.to_string(), span });
        }

        // Labeled loop: `name: while ...`
        if matches!(self.peek(), Token::Ident(_))
            && self.peek_nth(1) == Token::Colon
            && matches!(self.peek_nth(2), Token::While | Token::For | Token::Do)
        {
            let label = self.consume_ident()?;
            self.expect(Token::Colon)?;
            return match self.peek() {
                Token::While => self.parse_while(Some(label)),
                Token::For => self.parse_for(Some(label)),
                _ => self.parse_do_while(Some(label)),
            };
        }

        match self.peek() {
            Token::Let => self.parse_let(false),
            Token::Var => self.parse_let(false),
            Token::Const => self.parse_let(true),
            Token::Def | Token::Function if matches!(self.peek_nth(1), Token::Ident(_)) => {
                self.parse_func_decl()
            }
            Token::Return => self.parse_return(),
            Token::If => self.parse_if(),
            Token::While => self.parse_while(None),
            Token::Do => self.parse_do_while(None),
            Token::For => self.parse_for(None),
            Token::Break => self.parse_break(),
            Token::Continue => self.parse_continue(),
            Token::Try => self.parse_try(),
            Token::Throw => self.parse_throw(),
            Token::Import => self.parse_import(),
            Token::From => self.parse_from_import(),
            Token::Print => self.parse_print(),
            Token::Pass => {
                let span = self.span();
                self.advance();
                self.end_statement();
                Ok(Stmt::Pass { span })
            }
            Token::Class => {
                let span = self.span();
                Err(ParseError::InvalidSyntax {
                    context: "'class' is reserved and not supported".to_string(),
                    span,
                })
            }
            Token::LBrace => {
                let body = self.parse_braced_block()?;
                Ok(Stmt::Block(body))
            }
            Token::RBrace | Token::Eof => Err(ParseError::UnexpectedToken {
                expected: "statement".to_string(),
                found: self.peek().describe(),
                span: self.span(),
            }),
            _ => {
                let expr = self.parse_expr()?;
                self.end_statement();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_let(&mut self, is_const: bool) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance(); // let / var / const
        let stmt = self.parse_let_core(is_const, start)?;
        self.end_statement();
        Ok(stmt)
    }

    /// The declaration body without terminator handling; shared with
    /// the C-style `for` initializer.
    fn parse_let_core(&mut self, is_const: bool, start: Span) -> Result<Stmt, ParseError> {
        let name = self.consume_ident()?;
        let ty = if self.peek() == Token::Colon {
            self.advance();
            Some(self.parse_type_ann()?)
        } else {
            None
        };
        let value = if self.peek() == Token::Assign {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::Let { name, ty, value, is_const, span: start.merge(self.last_span) })
    }

    fn parse_type_ann(&mut self) -> Result<TypeAnn, ParseError> {
        let ann = match self.peek() {
            Token::TyString => TypeAnn::String,
            Token::TyNumber => TypeAnn::Number,
            Token::TyBool => TypeAnn::Bool,
            Token::TyVoid => TypeAnn::Void,
            Token::TyAny => TypeAnn::Any,
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "type name".to_string(),
                    found: other.describe(),
                    span: self.span(),
                })
            }
        };
        self.advance();
        Ok(ann)
    }

    fn parse_func_decl(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance(); // def / function
        let name = self.consume_ident()?;
        let def = self.parse_func_rest(name, start)?;
        Ok(Stmt::FuncDecl { span: def.span, def: Arc::new(def) })
    }

    /// Parameters and body, shared between declarations and anonymous
    /// function expressions.
    fn parse_func_rest(&mut self, name: Arc<str>, start: Span) -> Result<FuncDef, ParseError> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if self.peek() != Token::RParen {
            loop {
                params.push(self.consume_ident()?);
                if self.peek() != Token::Comma {
                    break;
                }
                self.advance();
            }
        }
        self.expect(Token::RParen)?;
        let body = self.parse_block()?;
        let fn_id = self.next_fn;
        self.next_fn += 1;
        Ok(FuncDef { fn_id, name, params, body, span: start.merge(self.last_span) })
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let value = if matches!(
            self.peek(),
            Token::Newline | Token::Semicolon | Token::RBrace | Token::Eof
        ) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.end_statement();
        Ok(Stmt::Return { value, span: start.merge(self.last_span) })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance(); // if / elif
        let cond = self.parse_expr()?;
        let then_body = self.parse_body()?;

        let else_body = match self.peek_past_newlines() {
            Token::Elif => {
                self.skip_newlines();
                Some(vec![self.parse_if()?])
            }
            Token::Else => {
                self.skip_newlines();
                self.advance();
                if self.peek() == Token::If {
                    Some(vec![self.parse_if()?])
                } else {
                    Some(self.parse_body()?)
                }
            }
            _ => None,
        };

        Ok(Stmt::If { cond, then_body, else_body, span: start.merge(self.last_span) })
    }

    fn parse_while(&mut self, label: Option<Arc<str>>) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let cond = self.parse_expr()?;
        let body = self.parse_body()?;
        Ok(Stmt::While { label, cond, body, span: start.merge(self.last_span) })
    }

    fn parse_do_while(&mut self, label: Option<Arc<str>>) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.expect(Token::Do)?;
        let body = self.parse_body()?;
        self.skip_newlines();
        self.expect(Token::While)?;
        let cond = self.parse_expr()?;
        self.end_statement();
        Ok(Stmt::DoWhile { label, body, cond, span: start.merge(self.last_span) })
    }

    fn parse_for(&mut self, label: Option<Arc<str>>) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance(); // for
        let parenthesized = self.peek() == Token::LParen;
        if parenthesized {
            self.advance();
        }

        // `for x in xs` / `for (let x in xs)`
        let mut lookahead = 0;
        if matches!(self.peek(), Token::Let | Token::Var | Token::Const) {
            lookahead = 1;
        }
        if matches!(self.peek_nth(lookahead), Token::Ident(_))
            && self.peek_nth(lookahead + 1) == Token::In
        {
            if lookahead == 1 {
                self.advance();
            }
            let var = self.consume_ident()?;
            self.expect(Token::In)?;
            let iterable = self.parse_expr()?;
            if parenthesized {
                self.expect(Token::RParen)?;
            }
            let body = self.parse_body()?;
            return Ok(Stmt::ForIn {
                label,
                var,
                iterable,
                body,
                span: start.merge(self.last_span),
            });
        }

        // C-style: init; cond; step
        let init = if self.peek() == Token::Semicolon {
            None
        } else if matches!(self.peek(), Token::Let | Token::Var | Token::Const) {
            let is_const = self.peek() == Token::Const;
            let kw_span = self.span();
            self.advance();
            Some(Box::new(self.parse_let_core(is_const, kw_span)?))
        } else {
            Some(Box::new(Stmt::Expr(self.parse_expr()?)))
        };
        self.expect(Token::Semicolon)?;

        let cond = if self.peek() == Token::Semicolon {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Token::Semicolon)?;

        let step = if (parenthesized && self.peek() == Token::RParen)
            || matches!(self.peek(), Token::LBrace | Token::Colon)
        {
            None
        } else {
            Some(self.parse_expr()?)
        };
        if parenthesized {
            self.expect(Token::RParen)?;
        }

        let body = self.parse_body()?;
        Ok(Stmt::For { label, init, cond, step, body, span: start.merge(self.last_span) })
    }

    fn parse_break(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let label = if let Token::Ident(_) = self.peek() {
            Some(self.consume_ident()?)
        } else {
            None
        };
        self.end_statement();
        Ok(Stmt::Break { label, span: start.merge(self.last_span) })
    }

    fn parse_continue(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let label = if let Token::Ident(_) = self.peek() {
            Some(self.consume_ident()?)
        } else {
            None
        };
        self.end_statement();
        Ok(Stmt::Continue { label, span: start.merge(self.last_span) })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let body = self.parse_block()?;

        let mut catches = Vec::new();
        while self.peek_past_newlines() == Token::Catch {
            self.skip_newlines();
            catches.push(self.parse_catch_arm()?);
        }

        let finally = if self.peek_past_newlines() == Token::Finally {
            self.skip_newlines();
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };

        if catches.is_empty() && finally.is_none() {
            return Err(ParseError::InvalidSyntax {
                context: "try without catch or finally".to_string(),
                span: start,
            });
        }

        Ok(Stmt::Try { body, catches, finally, span: start.merge(self.last_span) })
    }

    fn parse_catch_arm(&mut self) -> Result<CatchArm, ParseError> {
        let start = self.span();
        self.advance(); // catch

        let (kind, binding) = match self.peek() {
            Token::Star => {
                self.advance();
                (None, None)
            }
            Token::LParen => {
                self.advance();
                let pair = if self.peek() == Token::RParen {
                    (None, None)
                } else {
                    let first = self.consume_ident()?;
                    if let Token::Ident(_) = self.peek() {
                        let second = self.consume_ident()?;
                        (Some(first), Some(second))
                    } else {
                        self.classify_catch_name(first)
                    }
                };
                self.expect(Token::RParen)?;
                pair
            }
            Token::Ident(_) => {
                let first = self.consume_ident()?;
                self.classify_catch_name(first)
            }
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "'*', '(' or an error kind".to_string(),
                    found: other.describe(),
                    span: self.span(),
                })
            }
        };

        let body = self.parse_block()?;
        Ok(CatchArm { kind, binding, body, span: start.merge(self.last_span) })
    }

    /// A single name after `catch` is a kind filter when it names a
    /// known kind (or looks like one); otherwise it binds the error.
    fn classify_catch_name(&self, name: Arc<str>) -> (Option<Arc<str>>, Option<Arc<str>>) {
        if name.as_ref() == "Exception" {
            (None, None)
        } else if ErrorKind::is_known_kind_name(&name) || name.ends_with("Error") {
            (Some(name), None)
        } else {
            (None, Some(name))
        }
    }

    fn parse_throw(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let value = self.parse_expr()?;
        self.end_statement();
        Ok(Stmt::Throw { value, span: start.merge(self.last_span) })
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let spec = self.consume_string()?;
        let alias = if self.peek() == Token::As {
            self.advance();
            Some(self.consume_ident()?)
        } else {
            None
        };
        self.end_statement();
        Ok(Stmt::Import {
            spec,
            alias,
            selective: Vec::new(),
            span: start.merge(self.last_span),
        })
    }

    fn parse_from_import(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance(); // from
        let spec = self.consume_string()?;
        self.expect(Token::Import)?;
        let mut selective = Vec::new();
        loop {
            let name = self.consume_ident()?;
            let alias = if self.peek() == Token::As {
                self.advance();
                Some(self.consume_ident()?)
            } else {
                None
            };
            selective.push((name, alias));
            if self.peek() != Token::Comma {
                break;
            }
            self.advance();
        }
        self.end_statement();
        Ok(Stmt::Import { spec, alias: None, selective, span: start.merge(self.last_span) })
    }

    fn parse_print(&mut self) -> Result<Stmt, ParseError> {
        let start = self.span();
        self.advance();
        let mut args = Vec::new();
        if !matches!(
            self.peek(),
            Token::Newline | Token::Semicolon | Token::RBrace | Token::Eof
        ) {
            loop {
                args.push(self.parse_expr()?);
                if self.peek() != Token::Comma {
                    break;
                }
                self.advance();
            }
        }
        self.end_statement();
        Ok(Stmt::Print { args, span: start.merge(self.last_span) })
    }

    // -----------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------

    /// `{ ... }` or `: ...`. The colon form collects statements until
    /// the next top-level `def`/`function`, a closing brace, an
    /// `else`/`elif`/`catch`/`finally` continuation, or EOF.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.skip_newlines();
        match self.peek() {
            Token::LBrace => self.parse_braced_block(),
            Token::Colon => {
                self.advance();
                let mut stmts = Vec::new();
                loop {
                    self.skip_terminators();
                    if matches!(
                        self.peek(),
                        Token::Def
                            | Token::Function
                            | Token::RBrace
                            | Token::Else
                            | Token::Elif
                            | Token::Catch
                            | Token::Finally
                            | Token::Eof
                    ) {
                        break;
                    }
                    stmts.push(self.parse_stmt()?);
                }
                Ok(stmts)
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "'{' or ':'".to_string(),
                found: other.describe(),
                span: self.span(),
            }),
        }
    }

    fn parse_braced_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if matches!(self.peek(), Token::RBrace | Token::Eof) {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(Token::RBrace)?;
        Ok(stmts)
    }

    /// Loop and branch bodies: a block, or a single statement.
    fn parse_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.peek() == Token::Newline {
            self.skip_newlines();
        }
        if matches!(self.peek(), Token::LBrace | Token::Colon) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_or()?;
        if self.peek() == Token::Assign {
            let start = expr.span();
            self.advance();
            let value = self.parse_assignment()?;
            let span = start.merge(value.span());
            return Ok(Expr::Assign { target: Box::new(expr), value: Box::new(value), span });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while matches!(self.peek(), Token::PipePipe | Token::Or) {
            let start = expr.span();
            self.advance();
            let right = self.parse_and()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: "||".into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_equality()?;
        while matches!(self.peek(), Token::AmpAmp | Token::And) {
            let start = expr.span();
            self.advance();
            let right = self.parse_equality()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: "&&".into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;
        while let Some(op) = match self.peek() {
            Token::Eq => Some("=="),
            Token::NotEq => Some("!="),
            _ => None,
        } {
            let start = expr.span();
            self.advance();
            let right = self.parse_comparison()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: op.into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_term()?;
        while let Some(op) = match self.peek() {
            Token::Lt => Some("<"),
            Token::LtEq => Some("<="),
            Token::Gt => Some(">"),
            Token::GtEq => Some(">="),
            _ => None,
        } {
            let start = expr.span();
            self.advance();
            let right = self.parse_term()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: op.into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_factor()?;
        while let Some(op) = match self.peek() {
            Token::Plus => Some("+"),
            Token::Minus => Some("-"),
            _ => None,
        } {
            let start = expr.span();
            self.advance();
            let right = self.parse_factor()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: op.into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        while let Some(op) = match self.peek() {
            Token::Star => Some("*"),
            Token::Slash => Some("/"),
            Token::Percent => Some("%"),
            _ => None,
        } {
            let start = expr.span();
            self.advance();
            let right = self.parse_unary()?;
            let span = start.merge(right.span());
            expr = Expr::Binary {
                left: Box::new(expr),
                op: op.into(),
                right: Box::new(right),
                span,
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        match self.peek() {
            Token::Bang | Token::Not => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span());
                Ok(Expr::Unary { op: "!".into(), operand: Box::new(operand), span })
            }
            Token::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span());
                Ok(Expr::Unary { op: "-".into(), operand: Box::new(operand), span })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_arg_list()?;
                    self.expect(Token::RParen)?;
                    let span = expr.span().merge(self.last_span);
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        site_id: self.new_site(),
                        span,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    let span = expr.span().merge(self.last_span);
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        site_id: self.new_site(),
                        span,
                    };
                }
                Token::Dot => {
                    self.advance();
                    let member = self.consume_ident()?;
                    if self.peek() == Token::LParen {
                        self.advance();
                        let args = self.parse_arg_list()?;
                        self.expect(Token::RParen)?;
                        let span = expr.span().merge(self.last_span);
                        expr = Expr::MethodCall {
                            object: Box::new(expr),
                            method: member,
                            args,
                            site_id: self.new_site(),
                            span,
                        };
                    } else {
                        let span = expr.span().merge(self.last_span);
                        expr = Expr::Member {
                            object: Box::new(expr),
                            member,
                            site_id: self.new_site(),
                            span,
                        };
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_arg_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.peek() == Token::RParen {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.peek() != Token::Comma {
                break;
            }
            self.advance();
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.span();
        match self.peek() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Num { value: n, span: start })
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str { value: s, span: start })
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool { value: true, span: start })
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool { value: false, span: start })
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Null { span: start })
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Ident { name, span: start })
            }
            // `print`/`printf` in expression position refer to the
            // builtins of the same name.
            Token::Print => {
                self.advance();
                Ok(Expr::Ident { name: Arc::from("print"), span: start })
            }
            Token::Printf => {
                self.advance();
                Ok(Expr::Ident { name: Arc::from("printf"), span: start })
            }
            Token::LParen => {
                self.advance();
                if self.peek() == Token::RParen {
                    self.advance();
                    return Ok(Expr::TupleLit {
                        items: Vec::new(),
                        span: start.merge(self.last_span),
                    });
                }
                let first = self.parse_expr()?;
                if self.peek() == Token::Comma {
                    let mut items = vec![first];
                    while self.peek() == Token::Comma {
                        self.advance();
                        if self.peek() == Token::RParen {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::TupleLit { items, span: start.merge(self.last_span) })
                } else {
                    self.expect(Token::RParen)?;
                    Ok(first)
                }
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != Token::RBracket {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.peek() != Token::Comma {
                            break;
                        }
                        self.advance();
                        if self.peek() == Token::RBracket {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::ListLit { items, span: start.merge(self.last_span) })
            }
            Token::LBrace => self.parse_dict_literal(start),
            Token::Def | Token::Function => {
                self.advance();
                let fn_id = self.next_fn;
                let name: Arc<str> = Arc::from(format!("<anon:{}>", fn_id).as_str());
                let def = self.parse_func_rest(name, start)?;
                Ok(Expr::Function { span: def.span, def: Arc::new(def) })
            }
            Token::Match => self.parse_match(start),
            Token::Error(msg) => {
                self.advance();
                Err(ParseError::InvalidSyntax { context: msg.to_string(), span: start })
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: other.describe(),
                span: start,
            }),
        }
    }

    fn parse_dict_literal(&mut self, start: Span) -> Result<Expr, ParseError> {
        self.expect(Token::LBrace)?;
        let mut entries = Vec::new();
        self.skip_newlines();
        while self.peek() != Token::RBrace {
            let key = match self.peek() {
                Token::Ident(name) => {
                    self.advance();
                    name
                }
                Token::Str(s) => {
                    self.advance();
                    s
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "dict key".to_string(),
                        found: other.describe(),
                        span: self.span(),
                    })
                }
            };
            self.expect(Token::Colon)?;
            self.skip_newlines();
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_newlines();
            if self.peek() == Token::Comma {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        self.skip_newlines();
        self.expect(Token::RBrace)?;
        Ok(Expr::DictLit { entries, span: start.merge(self.last_span) })
    }

    fn parse_match(&mut self, start: Span) -> Result<Expr, ParseError> {
        self.advance(); // match
        let scrutinee = self.parse_expr()?;
        self.expect(Token::LBrace)?;
        let mut arms = Vec::new();
        loop {
            self.skip_terminators();
            if matches!(self.peek(), Token::RBrace | Token::Eof) {
                break;
            }
            let arm_start = self.span();
            let pattern = self.parse_pattern(0)?;
            let guard = if self.peek() == Token::If {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(Token::FatArrow)?;
            self.skip_newlines();
            let body = if self.peek() == Token::LBrace {
                self.parse_braced_block()?
            } else {
                vec![Stmt::Expr(self.parse_expr()?)]
            };
            if self.peek() == Token::Comma {
                self.advance();
            }
            arms.push(MatchArm { pattern, guard, body, span: arm_start.merge(self.last_span) });
        }
        self.expect(Token::RBrace)?;
        Ok(Expr::Match {
            scrutinee: Box::new(scrutinee),
            arms,
            span: start.merge(self.last_span),
        })
    }

    // -----------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------

    const MAX_PATTERN_DEPTH: usize = 64;

    fn parse_pattern(&mut self, depth: usize) -> Result<Pattern, ParseError> {
        if depth > Self::MAX_PATTERN_DEPTH {
            return Err(ParseError::InvalidSyntax {
                context: "pattern nesting too deep".to_string(),
                span: self.span(),
            });
        }
        let start = self.span();
        match self.peek() {
            Token::Ident(name) => {
                self.advance();
                if name.as_ref() == "_" {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Ident(name))
                }
            }
            Token::Number(n) => {
                self.advance();
                Ok(Pattern::Literal(Expr::Num { value: n, span: start }))
            }
            Token::Minus => {
                self.advance();
                match self.peek() {
                    Token::Number(n) => {
                        self.advance();
                        Ok(Pattern::Literal(Expr::Num { value: -n, span: start }))
                    }
                    other => Err(ParseError::UnexpectedToken {
                        expected: "number".to_string(),
                        found: other.describe(),
                        span: self.span(),
                    }),
                }
            }
            Token::Str(s) => {
                self.advance();
                Ok(Pattern::Literal(Expr::Str { value: s, span: start }))
            }
            Token::True => {
                self.advance();
                Ok(Pattern::Literal(Expr::Bool { value: true, span: start }))
            }
            Token::False => {
                self.advance();
                Ok(Pattern::Literal(Expr::Bool { value: false, span: start }))
            }
            Token::Null => {
                self.advance();
                Ok(Pattern::Literal(Expr::Null { span: start }))
            }
            Token::TyNumber => {
                self.advance();
                Ok(Pattern::TypeTag(TypeTag::Number))
            }
            Token::TyString => {
                self.advance();
                Ok(Pattern::TypeTag(TypeTag::String))
            }
            Token::TyBool => {
                self.advance();
                Ok(Pattern::TypeTag(TypeTag::Bool))
            }
            Token::LParen => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != Token::RParen {
                    loop {
                        items.push(self.parse_pattern(depth + 1)?);
                        if self.peek() != Token::Comma {
                            break;
                        }
                        self.advance();
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Pattern::Tuple(items))
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                let mut rest = None;
                while self.peek() != Token::RBracket {
                    if self.peek() == Token::Ellipsis {
                        self.advance();
                        rest = Some(if let Token::Ident(_) = self.peek() {
                            self.consume_ident()?
                        } else {
                            Arc::from("_")
                        });
                        break;
                    }
                    items.push(self.parse_pattern(depth + 1)?);
                    if self.peek() != Token::Comma {
                        break;
                    }
                    self.advance();
                }
                self.expect(Token::RBracket)?;
                Ok(Pattern::List { items, rest })
            }
            Token::LBrace => {
                self.advance();
                self.skip_newlines();
                let mut fields = Vec::new();
                let mut rest = false;
                while self.peek() != Token::RBrace {
                    if self.peek() == Token::Ellipsis {
                        self.advance();
                        rest = true;
                        self.skip_newlines();
                        break;
                    }
                    let name = self.consume_ident()?;
                    let sub = if self.peek() == Token::Colon {
                        self.advance();
                        Some(self.parse_pattern(depth + 1)?)
                    } else {
                        None
                    };
                    fields.push((name, sub));
                    self.skip_newlines();
                    if self.peek() != Token::Comma {
                        break;
                    }
                    self.advance();
                    self.skip_newlines();
                }
                self.expect(Token::RBrace)?;
                Ok(Pattern::Object { fields, rest })
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "pattern".to_string(),
                found: other.describe(),
                span: start,
            }),
        }
    }

    // -----------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------

    fn new_site(&mut self) -> u32 {
        let id = self.next_site;
        self.next_site += 1;
        id
    }

    fn peek(&self) -> Token {
        self.tokens.front().map(|(t, _)| t.clone()).unwrap_or(Token::Eof)
    }

    fn peek_nth(&self, n: usize) -> Token {
        self.tokens.get(n).map(|(t, _)| t.clone()).unwrap_or(Token::Eof)
    }

    /// First token that is not a newline, without consuming anything.
    fn peek_past_newlines(&self) -> Token {
        for (tok, _) in &self.tokens {
            if *tok != Token::Newline {
                return tok.clone();
            }
        }
        Token::Eof
    }

    fn span(&self) -> Span {
        self.tokens.front().map(|(_, s)| *s).unwrap_or(self.last_span)
    }

    fn advance(&mut self) -> Token {
        match self.tokens.pop_front() {
            Some((tok, span)) => {
                self.last_span = span;
                tok
            }
            None => Token::Eof,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let found = self.peek();
        if std::mem::discriminant(&found) == std::mem::discriminant(&expected) {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: expected.describe(),
                found: found.describe(),
                span: self.span(),
            })
        }
    }

    fn consume_ident(&mut self) -> Result<Arc<str>, ParseError> {
        match self.peek() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: other.describe(),
                span: self.span(),
            }),
        }
    }

    fn consume_string(&mut self) -> Result<Arc<str>, ParseError> {
        match self.peek() {
            Token::Str(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "string literal".to_string(),
                found: other.describe(),
                span: self.span(),
            }),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Token::Newline {
            self.advance();
        }
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semicolon) {
            self.advance();
        }
    }

    /// Consume the statement terminator if one is present. Closing
    /// braces and EOF also end a statement and are left in place.
    fn end_statement(&mut self) {
        self.skip_terminators();
    }

    fn at_end(&self) -> bool {
        self.peek() == Token::Eof
    }

    /// Panic-mode recovery: skip to the next statement boundary.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                Token::Eof | Token::RBrace => return,
                Token::Newline | Token::Semicolon => {
                    self.advance();
                    return;
                }
                Token::Let
                | Token::Const
                | Token::Var
                | Token::Def
                | Token::Function
                | Token::Return
                | Token::If
                | Token::While
                | Token::Do
                | Token::For
                | Token::Try
                | Token::Throw
                | Token::Import
                | Token::Print
                | Token::Break
                | Token::Continue => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        let (program, errors) = Parser::new(src).parse();
        assert!(errors.is_empty(), "unexpected parse errors: {:?}", errors);
        program
    }

    fn parse_err(src: &str) -> Vec<ParseError> {
        let (_, errors) = Parser::new(src).parse();
        errors
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let program = parse_ok("1 + 2 * 3");
        let Stmt::Expr(Expr::Binary { op, right, .. }) = &program.stmts[0] else {
            panic!("expected binary expression");
        };
        assert_eq!(op, "+");
        assert!(matches!(right.as_ref(), Expr::Binary { op, .. } if op == "*"));
    }

    #[test]
    fn newline_and_semicolon_both_terminate() {
        assert_eq!(parse_ok("let a = 1\nlet b = 2").stmts.len(), 2);
        assert_eq!(parse_ok("let a = 1; let b = 2").stmts.len(), 2);
    }

    #[test]
    fn call_sites_are_numbered() {
        let program = parse_ok("f(1)\ng(2)");
        let ids: Vec<u32> = program
            .stmts
            .iter()
            .map(|s| match s {
                Stmt::Expr(Expr::Call { site_id, .. }) => *site_id,
                _ => panic!("expected call"),
            })
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(program.site_count, 2);
    }

    #[test]
    fn if_without_braces_takes_one_statement() {
        let program = parse_ok("if (n < 2) return 1\nreturn 2");
        assert_eq!(program.stmts.len(), 2);
        let Stmt::If { then_body, .. } = &program.stmts[0] else {
            panic!("expected if");
        };
        assert_eq!(then_body.len(), 1);
    }

    #[test]
    fn elif_chains() {
        let program = parse_ok("if a { pass } elif b { pass } else { pass }");
        let Stmt::If { else_body: Some(else_body), .. } = &program.stmts[0] else {
            panic!("expected if with else");
        };
        assert!(matches!(else_body[0], Stmt::If { .. }));
    }

    #[test]
    fn labeled_while() {
        let program = parse_ok("outer: while true { break outer }");
        let Stmt::While { label: Some(label), body, .. } = &program.stmts[0] else {
            panic!("expected labeled while");
        };
        assert_eq!(label.as_ref(), "outer");
        assert!(matches!(&body[0], Stmt::Break { label: Some(l), .. } if l.as_ref() == "outer"));
    }

    #[test]
    fn c_style_for() {
        let program = parse_ok("for (let i = 0; i < 3; i = i + 1) { print i }");
        assert!(matches!(
            &program.stmts[0],
            Stmt::For { init: Some(_), cond: Some(_), step: Some(_), .. }
        ));
    }

    #[test]
    fn for_in_over_expression() {
        let program = parse_ok("for x in [1, 2] { print x }");
        assert!(matches!(&program.stmts[0], Stmt::ForIn { .. }));
    }

    #[test]
    fn try_catch_finally() {
        let program = parse_ok(
            "try { f() } catch (IndexError e) { pass } catch (e) { pass } finally { pass }",
        );
        let Stmt::Try { catches, finally, .. } = &program.stmts[0] else {
            panic!("expected try");
        };
        assert_eq!(catches.len(), 2);
        assert!(catches[0].kind.is_some());
        assert!(catches[1].kind.is_none());
        assert!(catches[1].binding.is_some());
        assert!(finally.is_some());
    }

    #[test]
    fn match_with_guard_and_patterns() {
        let program = parse_ok(
            "match v { [a, ...rest] => a, {x, y: 2} => x, n if n > 0 => n, _ => 0 }",
        );
        let Stmt::Expr(Expr::Match { arms, .. }) = &program.stmts[0] else {
            panic!("expected match");
        };
        assert_eq!(arms.len(), 4);
        assert!(matches!(&arms[0].pattern, Pattern::List { rest: Some(_), .. }));
        assert!(matches!(&arms[1].pattern, Pattern::Object { .. }));
        assert!(arms[2].guard.is_some());
        assert!(matches!(&arms[3].pattern, Pattern::Wildcard));
    }

    #[test]
    fn dict_literal_and_index() {
        let program = parse_ok("let d = { a: 1 }\nprint d[\"a\"]");
        assert!(matches!(
            &program.stmts[0],
            Stmt::Let { value: Some(Expr::DictLit { .. }), .. }
        ));
    }

    #[test]
    fn error_recovery_reports_once_and_continues() {
        let errors = parse_err("let = 5\nlet ok = 1");
        assert_eq!(errors.len(), 1);
        let (program, _) = Parser::new("let = 5\nlet ok = 1").parse();
        assert!(program.stmts.iter().any(|s| matches!(s, Stmt::Let { name, .. } if name.as_ref() == "ok")));
    }

    #[test]
    fn class_is_rejected() {
        let errors = parse_err("class Foo {}");
        assert!(!errors.is_empty());
    }

    #[test]
    fn anonymous_function_expression() {
        let program = parse_ok("let f = def(x) { return x }");
        assert!(matches!(
            &program.stmts[0],
            Stmt::Let { value: Some(Expr::Function { .. }), .. }
        ));
    }

    #[test]
    fn colon_block_function() {
        let program = parse_ok("def f():\n  return 1\ndef g():\n  return 2\n");
        assert_eq!(program.stmts.len(), 2);
    }
}
