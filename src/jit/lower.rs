/// AST to IR lowering.
/// Emits stack-machine code with the evaluator's semantics, patching
/// forward jumps once targets are known. Lowering is deliberately
/// conservative: any construct the opcode set cannot express byte for
/// byte (method calls, closures, try, match, `%`, `<=`/`>=`, locals
/// escaping their declaring scope, shadowing) refuses the whole
/// function, which then stays on the tree-walk tier. Refusal is never
/// a correctness loss; it only forgoes the speedup.

use crate::ast::{Expr, FuncDef, Stmt};
use crate::jit::ir::{Const, GuardSpec, Ir, JitFunction, Tier};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bail(pub &'static str);

struct LoopCtx {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    /// Known backward target for `continue` (while loops); `None`
    /// until the step section's position is known (C-style for).
    continue_target: Option<u32>,
}

struct Lowerer {
    names: Vec<Arc<str>>,
    name_slots: HashMap<Arc<str>, u16>,
    strings: Vec<Arc<str>>,
    string_slots: HashMap<Arc<str>, u16>,
    code: Vec<Ir>,
    /// Lexical scopes of declared locals, innermost last. A name used
    /// outside its declaring scope or shadowing an outer one bails.
    scopes: Vec<Vec<u16>>,
    ever_declared: Vec<bool>,
    loops: Vec<LoopCtx>,
    sites: Vec<u32>,
    discard: u16,
}

pub fn lower_function(def: &FuncDef) -> Result<JitFunction, Bail> {
    let mut lowerer = Lowerer::new();
    // Parameters take the first name slots; the discard slot for
    // expression-statement residue comes right after.
    for param in &def.params {
        let slot = lowerer.intern_name(param)?;
        lowerer.declare(slot);
    }
    lowerer.discard = lowerer.intern_name(&Arc::from("<discard>"))?;
    if def.params.len() > 32 {
        return Err(Bail("too many parameters for guard word"));
    }

    lowerer.lower_block(&def.body)?;
    // Implicit `return null` for functions that fall off the end.
    lowerer.emit(Ir::LoadConst(Const::Null));
    lowerer.emit(Ir::Return);

    Ok(JitFunction {
        fn_id: def.fn_id,
        name: def.name.clone(),
        param_count: def.params.len(),
        names: lowerer.names,
        strings: lowerer.strings,
        code: lowerer.code,
        tier: Tier::Baseline,
        guards: GuardSpec::all_numbers(def.params.len()),
        sites: lowerer.sites,
        native: None,
        native_size: 0,
    })
}

impl Lowerer {
    fn new() -> Self {
        Lowerer {
            names: Vec::new(),
            name_slots: HashMap::new(),
            strings: Vec::new(),
            string_slots: HashMap::new(),
            code: Vec::new(),
            scopes: vec![Vec::new()],
            ever_declared: Vec::new(),
            loops: Vec::new(),
            sites: Vec::new(),
            discard: 0,
        }
    }

    fn emit(&mut self, instr: Ir) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        self.code[at] = self.code[at].with_jump_target(target);
    }

    fn intern_name(&mut self, name: &Arc<str>) -> Result<u16, Bail> {
        if let Some(&slot) = self.name_slots.get(name) {
            return Ok(slot);
        }
        if self.names.len() >= u16::MAX as usize {
            return Err(Bail("too many names"));
        }
        let slot = self.names.len() as u16;
        self.names.push(name.clone());
        self.name_slots.insert(name.clone(), slot);
        self.ever_declared.push(false);
        Ok(slot)
    }

    fn intern_string(&mut self, value: &Arc<str>) -> Result<u16, Bail> {
        if let Some(&slot) = self.string_slots.get(value) {
            return Ok(slot);
        }
        if self.strings.len() >= u16::MAX as usize {
            return Err(Bail("too many string constants"));
        }
        let slot = self.strings.len() as u16;
        self.strings.push(value.clone());
        self.string_slots.insert(value.clone(), slot);
        Ok(slot)
    }

    fn declare(&mut self, slot: u16) {
        self.scopes.last_mut().expect("scope stack never empty").push(slot);
        self.ever_declared[slot as usize] = true;
    }

    fn in_scope(&self, slot: u16) -> bool {
        self.scopes.iter().any(|scope| scope.contains(&slot))
    }

    /// Resolve an identifier to a live local slot.
    fn resolve(&mut self, name: &Arc<str>) -> Result<u16, Bail> {
        let slot = self.intern_name(name)?;
        if self.in_scope(slot) {
            Ok(slot)
        } else if self.ever_declared[slot as usize] {
            Err(Bail("local used outside its declaring scope"))
        } else {
            Err(Bail("name is not a local"))
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn lower_block(&mut self, stmts: &[Stmt]) -> Result<(), Bail> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), Bail> {
        match stmt {
            Stmt::Let { name, value, is_const, .. } => {
                if *is_const {
                    return Err(Bail("const declarations stay on the tree-walk"));
                }
                let Some(value) = value else { return Err(Bail("let without initializer")) };
                let slot = self.intern_name(name)?;
                if self.in_scope(slot) && !self.scopes.last().unwrap().contains(&slot) {
                    return Err(Bail("shadowing an outer local"));
                }
                self.lower_expr(value)?;
                self.emit(Ir::StoreVar(slot));
                self.declare(slot);
                Ok(())
            }
            Stmt::Expr(expr) => self.lower_expr_stmt(expr),
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.lower_expr(expr)?,
                    None => {
                        self.emit(Ir::LoadConst(Const::Null));
                    }
                }
                self.emit(Ir::Return);
                Ok(())
            }
            Stmt::If { cond, then_body, else_body, .. } => {
                let mut false_patches = Vec::new();
                self.lower_condition(cond, &mut false_patches)?;
                self.push_scope();
                let result = self.lower_block(then_body);
                self.pop_scope();
                result?;
                match else_body {
                    Some(else_body) => {
                        let skip_else = self.emit(Ir::Jump(0));
                        let else_start = self.here();
                        for at in false_patches {
                            self.patch(at, else_start);
                        }
                        self.push_scope();
                        let result = self.lower_block(else_body);
                        self.pop_scope();
                        result?;
                        let end = self.here();
                        self.patch(skip_else, end);
                    }
                    None => {
                        let end = self.here();
                        for at in false_patches {
                            self.patch(at, end);
                        }
                    }
                }
                Ok(())
            }
            Stmt::While { label, cond, body, .. } => {
                if label.is_some() {
                    return Err(Bail("labeled loops stay on the tree-walk"));
                }
                let start = self.here();
                let mut false_patches = Vec::new();
                self.lower_condition(cond, &mut false_patches)?;
                self.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: Some(start),
                });
                self.push_scope();
                let result = self.lower_block(body);
                self.pop_scope();
                let ctx = self.loops.pop().expect("loop context pushed above");
                result?;
                self.emit(Ir::Jump(start));
                let exit = self.here();
                for at in false_patches.into_iter().chain(ctx.break_patches) {
                    self.patch(at, exit);
                }
                for at in ctx.continue_patches {
                    self.patch(at, start);
                }
                Ok(())
            }
            Stmt::DoWhile { label, body, cond, .. } => {
                if label.is_some() {
                    return Err(Bail("labeled loops stay on the tree-walk"));
                }
                let start = self.here();
                self.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: None,
                });
                self.push_scope();
                let result = self.lower_block(body);
                self.pop_scope();
                let ctx = self.loops.pop().expect("loop context pushed above");
                result?;
                let cond_pos = self.here();
                let mut false_patches = Vec::new();
                self.lower_condition(cond, &mut false_patches)?;
                self.emit(Ir::Jump(start));
                let exit = self.here();
                for at in false_patches.into_iter().chain(ctx.break_patches) {
                    self.patch(at, exit);
                }
                for at in ctx.continue_patches {
                    self.patch(at, cond_pos);
                }
                Ok(())
            }
            Stmt::For { label, init, cond, step, body, .. } => {
                if label.is_some() {
                    return Err(Bail("labeled loops stay on the tree-walk"));
                }
                self.push_scope();
                let result = self.lower_for(init, cond, step, body);
                self.pop_scope();
                result
            }
            Stmt::Break { label, .. } => {
                if label.is_some() {
                    return Err(Bail("labeled break stays on the tree-walk"));
                }
                let at = self.emit(Ir::Jump(0));
                self.loops
                    .last_mut()
                    .ok_or(Bail("break outside loop"))?
                    .break_patches
                    .push(at);
                Ok(())
            }
            Stmt::Continue { label, .. } => {
                if label.is_some() {
                    return Err(Bail("labeled continue stays on the tree-walk"));
                }
                let target = self
                    .loops
                    .last()
                    .ok_or(Bail("continue outside loop"))?
                    .continue_target;
                match target {
                    Some(target) => {
                        self.emit(Ir::Jump(target));
                    }
                    None => {
                        let at = self.emit(Ir::Jump(0));
                        self.loops.last_mut().unwrap().continue_patches.push(at);
                    }
                }
                Ok(())
            }
            Stmt::Print { args, .. } => {
                if args.len() > 255 {
                    return Err(Bail("too many print arguments"));
                }
                for arg in args {
                    self.lower_expr(arg)?;
                }
                self.emit(Ir::Print(args.len() as u8));
                Ok(())
            }
            Stmt::Block(stmts) => {
                self.push_scope();
                let result = self.lower_block(stmts);
                self.pop_scope();
                result
            }
            Stmt::Pass { .. } => Ok(()),
            Stmt::FuncDecl { .. } => Err(Bail("nested functions stay on the tree-walk")),
            Stmt::ForIn { .. } => Err(Bail("for-in stays on the tree-walk")),
            Stmt::Try { .. } | Stmt::Throw { .. } => {
                Err(Bail("exception handling stays on the tree-walk"))
            }
            Stmt::Import { .. } => Err(Bail("imports stay on the tree-walk")),
        }
    }

    fn lower_for(
        &mut self,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        step: &Option<Expr>,
        body: &[Stmt],
    ) -> Result<(), Bail> {
        if let Some(init) = init {
            self.lower_stmt(init)?;
        }
        let start = self.here();
        let mut false_patches = Vec::new();
        if let Some(cond) = cond {
            self.lower_condition(cond, &mut false_patches)?;
        }
        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            continue_target: None,
        });
        self.push_scope();
        let result = self.lower_block(body);
        self.pop_scope();
        let ctx = self.loops.pop().expect("loop context pushed above");
        result?;
        let step_pos = self.here();
        if let Some(step) = step {
            self.lower_expr_stmt(step)?;
        }
        self.emit(Ir::Jump(start));
        let exit = self.here();
        for at in false_patches.into_iter().chain(ctx.break_patches) {
            self.patch(at, exit);
        }
        for at in ctx.continue_patches {
            self.patch(at, step_pos);
        }
        Ok(())
    }

    /// Expression in statement position. The opcode set has no plain
    /// pop, so residual values are parked in the discard slot.
    fn lower_expr_stmt(&mut self, expr: &Expr) -> Result<(), Bail> {
        match expr {
            Expr::Assign { target, value, .. } => {
                if matches!(value.as_ref(), Expr::Assign { .. }) {
                    return Err(Bail("chained assignment stays on the tree-walk"));
                }
                let Expr::Ident { name, .. } = target.as_ref() else {
                    return Err(Bail("only plain variables are assignable here"));
                };
                let slot = self.resolve(name)?;
                self.lower_expr(value)?;
                self.emit(Ir::StoreVar(slot));
                Ok(())
            }
            other => {
                self.lower_expr(other)?;
                let discard = self.discard;
                self.emit(Ir::StoreVar(discard));
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> Result<(), Bail> {
        match expr {
            Expr::Num { value, .. } => {
                self.emit(Ir::LoadConst(Const::Num(*value)));
                Ok(())
            }
            Expr::Bool { value, .. } => {
                self.emit(Ir::LoadConst(Const::Bool(*value)));
                Ok(())
            }
            Expr::Null { .. } => {
                self.emit(Ir::LoadConst(Const::Null));
                Ok(())
            }
            Expr::Str { value, .. } => {
                let idx = self.intern_string(value)?;
                self.emit(Ir::LoadString(idx));
                Ok(())
            }
            Expr::Ident { name, .. } => {
                let slot = self.resolve(name)?;
                self.emit(Ir::LoadVar(slot));
                Ok(())
            }
            Expr::Unary { op, operand, .. } => {
                self.lower_expr(operand)?;
                match op.as_str() {
                    "-" => {
                        self.emit(Ir::Neg);
                        Ok(())
                    }
                    "!" => {
                        self.emit(Ir::Not);
                        Ok(())
                    }
                    _ => Err(Bail("unknown unary operator")),
                }
            }
            Expr::Binary { left, op, right, .. } => {
                match op.as_str() {
                    "&&" | "||" => return Err(Bail("logical operators outside a condition")),
                    _ => {}
                }
                self.lower_expr(left)?;
                self.lower_expr(right)?;
                match op.as_str() {
                    "+" => self.emit(Ir::Add),
                    "-" => self.emit(Ir::Sub),
                    "*" => self.emit(Ir::Mul),
                    "/" => self.emit(Ir::Div),
                    "<" => self.emit(Ir::CompareLt),
                    ">" => self.emit(Ir::CompareGt),
                    "==" => self.emit(Ir::CompareEq),
                    "!=" => {
                        self.emit(Ir::CompareEq);
                        self.emit(Ir::Not)
                    }
                    // No direct opcode; the NOT-of-opposite rewrite is
                    // wrong for NaN operands, so these stay interpreted.
                    "%" | "<=" | ">=" => return Err(Bail("operator has no opcode")),
                    _ => return Err(Bail("unknown binary operator")),
                };
                Ok(())
            }
            Expr::Call { callee, args, site_id, .. } => {
                let Expr::Ident { name, .. } = callee.as_ref() else {
                    return Err(Bail("only direct calls by name are lowered"));
                };
                let slot = self.intern_name(name)?;
                if self.in_scope(slot) {
                    return Err(Bail("calls through local variables stay on the tree-walk"));
                }
                if args.len() > 255 {
                    return Err(Bail("too many call arguments"));
                }
                for arg in args {
                    self.lower_expr(arg)?;
                }
                self.sites.push(*site_id);
                self.emit(Ir::Call { name: slot, argc: args.len() as u8 });
                Ok(())
            }
            Expr::Assign { .. } => Err(Bail("assignment in value position")),
            Expr::MethodCall { .. }
            | Expr::Index { .. }
            | Expr::Member { .. }
            | Expr::ListLit { .. }
            | Expr::TupleLit { .. }
            | Expr::DictLit { .. }
            | Expr::Function { .. }
            | Expr::Match { .. } => Err(Bail("expression form stays on the tree-walk")),
        }
    }

    /// Lower a boolean context. All emitted branches jump when the
    /// condition is falsy; targets are patched by the caller.
    fn lower_condition(
        &mut self,
        cond: &Expr,
        false_patches: &mut Vec<usize>,
    ) -> Result<(), Bail> {
        match cond {
            Expr::Binary { left, op, right, .. } if op == "&&" => {
                self.lower_condition(left, false_patches)?;
                self.lower_condition(right, false_patches)
            }
            Expr::Binary { left, op, right, .. } if op == "||" => {
                // Left truthy: skip the right-hand test entirely.
                self.lower_expr(left)?;
                self.emit(Ir::Not);
                let to_body = self.emit(Ir::JumpIfFalse(0));
                self.lower_condition(right, false_patches)?;
                let body = self.here();
                self.patch(to_body, body);
                Ok(())
            }
            other => {
                self.lower_expr(other)?;
                let at = self.emit(Ir::JumpIfFalse(0));
                false_patches.push(at);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn lower_first_fn(src: &str) -> Result<JitFunction, Bail> {
        let (program, errors) = Parser::new(src).parse();
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        for stmt in &program.stmts {
            if let Stmt::FuncDecl { def, .. } = stmt {
                return lower_function(def);
            }
        }
        panic!("no function in source");
    }

    #[test]
    fn lowers_arithmetic_function() {
        let jf = lower_first_fn("def f(a, b) { return a + b * 2 }").unwrap();
        assert!(jf.code.contains(&Ir::Add));
        assert!(jf.code.contains(&Ir::Mul));
        assert!(matches!(jf.code.last(), Some(Ir::Return)));
        assert_eq!(jf.param_count, 2);
    }

    #[test]
    fn lowers_while_loop_with_backward_jump() {
        let jf = lower_first_fn(
            "def f(n) { let s = 0; let i = 0; while (i < n) { s = s + i; i = i + 1 } return s }",
        )
        .unwrap();
        let has_backward = jf
            .code
            .iter()
            .enumerate()
            .any(|(i, instr)| matches!(instr, Ir::Jump(t) if (*t as usize) < i));
        assert!(has_backward);
    }

    #[test]
    fn recursive_call_is_lowered_by_name() {
        let jf =
            lower_first_fn("def fact(n) { if (n < 2) return 1\nreturn n * fact(n - 1) }").unwrap();
        assert!(jf
            .code
            .iter()
            .any(|instr| matches!(instr, Ir::Call { argc: 1, .. })));
        assert_eq!(jf.sites.len(), 1);
    }

    #[test]
    fn bails_on_method_calls() {
        assert!(lower_first_fn("def f(s) { return s.upper() }").is_err());
    }

    #[test]
    fn bails_on_unscoped_local_use() {
        assert!(lower_first_fn("def f() { if (true) { let x = 1 } return x }").is_err());
    }

    #[test]
    fn bails_on_shadowing() {
        assert!(lower_first_fn("def f() { let x = 1; while (x < 3) { let x = 2 } return x }")
            .is_err());
    }

    #[test]
    fn bails_on_modulo() {
        assert!(lower_first_fn("def f(a) { return a % 2 }").is_err());
    }

    #[test]
    fn not_equal_lowers_as_eq_not() {
        let jf = lower_first_fn("def f(a, b) { return a != b }").unwrap();
        let eq_pos = jf.code.iter().position(|i| *i == Ir::CompareEq).unwrap();
        assert_eq!(jf.code[eq_pos + 1], Ir::Not);
    }
}
