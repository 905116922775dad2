/// Native backend.
/// Emits x86-64 code for the numeric IR subset: all values live as
/// doubles on the machine stack, arithmetic runs in SSE registers, and
/// locals sit in a caller-provided array. The emitted function starts
/// with a guard preamble comparing the trampoline's argument shape
/// word against the specialization's expectation; mismatch takes the
/// bail-out stub and the caller falls back to the interpreter.
/// Division checks its divisor and side-exits instead of materializing
/// an IEEE infinity the interpreter would have reported as an error.
///
/// Functions using opcodes outside the subset (CALL, PRINT, strings,
/// null constants) are rejected by the eligibility verifier and keep
/// running on the Baseline IR interpreter.
///
/// Calling convention of emitted code (SysV x86-64):
///   rdi = *mut f64 locals, rsi = *mut f64 out, rdx = shape word
///   rax return: 0 = value stored to *out, 1 = guard bail,
///               3 = division-by-zero side exit

use crate::jit::codebuf::CodeBuffer;
use crate::jit::ir::{Const, GuardSpec, Ir, JitFunction};
use crate::value::Value;

pub const EXIT_OK: u64 = 0;
pub const EXIT_GUARD: u64 = 1;
pub const EXIT_DIV_ZERO: u64 = 3;

pub type NativeEntry = unsafe extern "C" fn(*mut f64, *mut f64, u64) -> u64;

pub struct NativeCode {
    buf: CodeBuffer,
    pub size: usize,
}

impl NativeCode {
    pub fn entry(&self) -> NativeEntry {
        debug_assert!(self.buf.is_executable());
        unsafe { std::mem::transmute(self.buf.entry()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeOutcome {
    Value(f64),
    GuardFail,
    DivByZero,
}

/// Run a compiled function. The shape word is rebuilt from the actual
/// arguments so the emitted guard, not Rust code, decides whether the
/// specialization still applies.
pub fn call_native(
    native: &NativeCode,
    args: &[Value],
    locals_len: usize,
) -> NativeOutcome {
    let mut shape = args.len() as u64;
    let mut locals = vec![0f64; locals_len.max(args.len())];
    for (i, arg) in args.iter().enumerate() {
        if let Value::Num(n) = arg {
            if i < 32 {
                shape |= 1 << (8 + i);
            }
            locals[i] = *n;
        }
    }
    let mut out = 0f64;
    let entry = native.entry();
    let code = unsafe { entry(locals.as_mut_ptr(), &mut out, shape) };
    match code {
        EXIT_OK => NativeOutcome::Value(out),
        EXIT_DIV_ZERO => NativeOutcome::DivByZero,
        _ => NativeOutcome::GuardFail,
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Unknown,
    Num,
    Bool,
    Conflict,
}

fn merge(a: Ty, b: Ty) -> Ty {
    match (a, b) {
        (Ty::Unknown, x) | (x, Ty::Unknown) => x,
        (x, y) if x == y => x,
        _ => Ty::Conflict,
    }
}

/// Static check that the function stays inside the numeric subset:
/// every value on the stack is a number or a comparison result, locals
/// keep one type, the operand stack is empty at every branch, and the
/// returned value is a number. Run this on the optimized code; the
/// unreachable implicit null return has been eliminated by then.
pub fn native_eligible(jf: &JitFunction) -> Result<(), &'static str> {
    if jf.param_count > 32 {
        return Err("too many parameters for the guard word");
    }
    let mut local_ty = vec![Ty::Unknown; jf.names.len()];
    for slot in 0..jf.param_count.min(local_ty.len()) {
        local_ty[slot] = Ty::Num;
    }

    // Two passes let a loop-carried store settle before its textual
    // first load is judged.
    for final_pass in [false, true] {
        let mut stack: Vec<Ty> = Vec::new();
        for instr in &jf.code {
            match *instr {
                Ir::LoadConst(Const::Num(_)) => stack.push(Ty::Num),
                Ir::LoadConst(Const::Bool(_)) => stack.push(Ty::Bool),
                Ir::LoadConst(Const::Null) => return Err("null constant"),
                Ir::LoadString(_) => return Err("string constant"),
                Ir::Call { .. } => return Err("call opcode"),
                Ir::Print(_) => return Err("print opcode"),
                Ir::LoadVar(slot) => {
                    let ty = local_ty[slot as usize];
                    if final_pass && !matches!(ty, Ty::Num | Ty::Bool) {
                        return Err("local with unknown or mixed type");
                    }
                    stack.push(ty);
                }
                Ir::StoreVar(slot) => {
                    let ty = stack.pop().ok_or("stack underflow")?;
                    let slot = slot as usize;
                    local_ty[slot] = merge(local_ty[slot], ty);
                    if final_pass && local_ty[slot] == Ty::Conflict {
                        return Err("local with unknown or mixed type");
                    }
                }
                Ir::Add | Ir::Sub | Ir::Mul | Ir::Div => {
                    let b = stack.pop().ok_or("stack underflow")?;
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && (a != Ty::Num || b != Ty::Num) {
                        return Err("arithmetic on a non-number");
                    }
                    stack.push(Ty::Num);
                }
                Ir::CompareEq | Ir::CompareLt | Ir::CompareGt => {
                    let b = stack.pop().ok_or("stack underflow")?;
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && (a != Ty::Num || b != Ty::Num) {
                        return Err("comparison on a non-number");
                    }
                    stack.push(Ty::Bool);
                }
                Ir::Neg => {
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && a != Ty::Num {
                        return Err("negation of a non-number");
                    }
                    stack.push(Ty::Num);
                }
                Ir::Not => {
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && a != Ty::Bool {
                        return Err("logical not of a non-boolean");
                    }
                    stack.push(Ty::Bool);
                }
                Ir::ShiftLeft(_) => {
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && a != Ty::Num {
                        return Err("shift of a non-number");
                    }
                    stack.push(Ty::Num);
                }
                Ir::JumpIfFalse(_) => {
                    stack.pop().ok_or("stack underflow")?;
                    if !stack.is_empty() {
                        return Err("operand stack not empty at branch");
                    }
                }
                Ir::Jump(_) => {
                    if !stack.is_empty() {
                        return Err("operand stack not empty at branch");
                    }
                }
                Ir::Return => {
                    let a = stack.pop().ok_or("stack underflow")?;
                    if final_pass && a != Ty::Num {
                        return Err("non-number return value");
                    }
                    if !stack.is_empty() {
                        return Err("operand stack not empty at return");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", unix))]
pub fn compile(jf: &JitFunction) -> Option<NativeCode> {
    native_eligible(jf).ok()?;
    let bytes = Emitter::emit(jf)?;
    let mut buf = CodeBuffer::allocate(bytes.len()).ok()?;
    buf.write(&bytes).ok()?;
    buf.make_executable().ok()?;
    let size = bytes.len();
    Some(NativeCode { buf, size })
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
pub fn compile(_jf: &JitFunction) -> Option<NativeCode> {
    None
}

#[cfg(all(target_arch = "x86_64", unix))]
enum FixupTarget {
    Ir(usize),
    Guard,
    DivZero,
}

#[cfg(all(target_arch = "x86_64", unix))]
struct Emitter {
    code: Vec<u8>,
    fixups: Vec<(usize, FixupTarget)>,
    ir_offsets: Vec<usize>,
}

#[cfg(all(target_arch = "x86_64", unix))]
impl Emitter {
    fn emit(jf: &JitFunction) -> Option<Vec<u8>> {
        let mut e = Emitter { code: Vec::new(), fixups: Vec::new(), ir_offsets: Vec::new() };

        // Prologue: push rbp; mov rbp, rsp
        e.bytes(&[0x55, 0x48, 0x89, 0xE5]);
        e.emit_guard(jf.guards);

        for instr in &jf.code {
            e.ir_offsets.push(e.code.len());
            e.emit_instr(*instr)?;
        }
        e.ir_offsets.push(e.code.len());

        // Bail-out stubs.
        let guard_off = e.code.len();
        e.bytes(&[0xB8, 0x01, 0x00, 0x00, 0x00]); // mov eax, 1
        e.epilogue_tail();
        let div0_off = e.code.len();
        e.bytes(&[0xB8, 0x03, 0x00, 0x00, 0x00]); // mov eax, 3
        e.epilogue_tail();

        // Patch every rel32.
        for (pos, target) in std::mem::take(&mut e.fixups) {
            let dest = match target {
                FixupTarget::Ir(ir) => e.ir_offsets[ir],
                FixupTarget::Guard => guard_off,
                FixupTarget::DivZero => div0_off,
            };
            let rel = dest as i64 - (pos as i64 + 4);
            let rel: i32 = rel.try_into().ok()?;
            e.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Some(e.code)
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn rel32_placeholder(&mut self, target: FixupTarget) {
        self.fixups.push((self.code.len(), target));
        self.bytes(&[0, 0, 0, 0]);
    }

    /// Guard preamble: the trampoline's shape word in rdx must equal
    /// the specialization's expectation byte for byte.
    fn emit_guard(&mut self, guards: GuardSpec) {
        // movabs rax, shape
        self.bytes(&[0x48, 0xB8]);
        self.bytes(&guards.shape_word.to_le_bytes());
        // cmp rdx, rax
        self.bytes(&[0x48, 0x39, 0xC2]);
        // jne guard_stub
        self.bytes(&[0x0F, 0x85]);
        self.rel32_placeholder(FixupTarget::Guard);
    }

    /// mov rsp, rbp; pop rbp; ret
    fn epilogue_tail(&mut self) {
        self.bytes(&[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }

    fn push_f64_bits(&mut self, bits: u64) {
        // movabs rax, bits; push rax
        self.bytes(&[0x48, 0xB8]);
        self.bytes(&bits.to_le_bytes());
        self.bytes(&[0x50]);
    }

    /// movsd xmm1, [rsp]; add rsp, 8; movsd xmm0, [rsp]
    /// Leaves rhs in xmm1, lhs in xmm0, lhs slot at [rsp].
    fn pop_binary_operands(&mut self) {
        self.bytes(&[0xF2, 0x0F, 0x10, 0x0C, 0x24]);
        self.bytes(&[0x48, 0x83, 0xC4, 0x08]);
        self.bytes(&[0xF2, 0x0F, 0x10, 0x04, 0x24]);
    }

    /// movsd [rsp], xmm0
    fn store_result(&mut self) {
        self.bytes(&[0xF2, 0x0F, 0x11, 0x04, 0x24]);
    }

    /// movzx eax, al; cvtsi2sd xmm0, eax; movsd [rsp], xmm0
    fn flag_to_f64_result(&mut self) {
        self.bytes(&[0x0F, 0xB6, 0xC0]);
        self.bytes(&[0xF2, 0x0F, 0x2A, 0xC0]);
        self.store_result();
    }

    fn emit_instr(&mut self, instr: Ir) -> Option<()> {
        match instr {
            Ir::LoadConst(Const::Num(n)) => self.push_f64_bits(n.to_bits()),
            Ir::LoadConst(Const::Bool(b)) => {
                self.push_f64_bits(if b { 1f64.to_bits() } else { 0f64.to_bits() })
            }
            Ir::LoadVar(slot) => {
                // mov rax, [rdi + 8*slot]; push rax
                self.bytes(&[0x48, 0x8B, 0x87]);
                self.bytes(&(slot as u32 * 8).to_le_bytes());
                self.bytes(&[0x50]);
            }
            Ir::StoreVar(slot) => {
                // pop rax; mov [rdi + 8*slot], rax
                self.bytes(&[0x58, 0x48, 0x89, 0x87]);
                self.bytes(&(slot as u32 * 8).to_le_bytes());
            }
            Ir::Add => {
                self.pop_binary_operands();
                self.bytes(&[0xF2, 0x0F, 0x58, 0xC1]); // addsd xmm0, xmm1
                self.store_result();
            }
            Ir::Sub => {
                self.pop_binary_operands();
                self.bytes(&[0xF2, 0x0F, 0x5C, 0xC1]); // subsd xmm0, xmm1
                self.store_result();
            }
            Ir::Mul => {
                self.pop_binary_operands();
                self.bytes(&[0xF2, 0x0F, 0x59, 0xC1]); // mulsd xmm0, xmm1
                self.store_result();
            }
            Ir::Div => {
                self.pop_binary_operands();
                // xorpd xmm2, xmm2; ucomisd xmm1, xmm2
                self.bytes(&[0x66, 0x0F, 0x57, 0xD2]);
                self.bytes(&[0x66, 0x0F, 0x2E, 0xCA]);
                // NaN divisor is not zero: jp over the zero exit.
                self.bytes(&[0x7A, 0x06]); // jp +6
                self.bytes(&[0x0F, 0x84]); // je div0_stub
                self.rel32_placeholder(FixupTarget::DivZero);
                self.bytes(&[0xF2, 0x0F, 0x5E, 0xC1]); // divsd xmm0, xmm1
                self.store_result();
            }
            Ir::Neg => {
                // Sign-bit flip matches the interpreter for -0.0 and NaN.
                self.bytes(&[0xF2, 0x0F, 0x10, 0x04, 0x24]); // movsd xmm0, [rsp]
                self.bytes(&[0x48, 0xB8]); // movabs rax, sign bit
                self.bytes(&0x8000_0000_0000_0000u64.to_le_bytes());
                self.bytes(&[0x66, 0x48, 0x0F, 0x6E, 0xC8]); // movq xmm1, rax
                self.bytes(&[0x66, 0x0F, 0x57, 0xC1]); // xorpd xmm0, xmm1
                self.store_result();
            }
            Ir::Not => {
                // Operand is a 0.0/1.0 boolean by eligibility.
                self.bytes(&[0xF2, 0x0F, 0x10, 0x04, 0x24]); // movsd xmm0, [rsp]
                self.bytes(&[0x66, 0x0F, 0x57, 0xC9]); // xorpd xmm1, xmm1
                self.bytes(&[0x66, 0x0F, 0x2E, 0xC1]); // ucomisd xmm0, xmm1
                self.bytes(&[0x0F, 0x94, 0xC0]); // sete al
                self.flag_to_f64_result();
            }
            Ir::ShiftLeft(k) => {
                let factor = (2f64).powi(k as i32);
                self.bytes(&[0xF2, 0x0F, 0x10, 0x04, 0x24]); // movsd xmm0, [rsp]
                self.bytes(&[0x48, 0xB8]);
                self.bytes(&factor.to_bits().to_le_bytes());
                self.bytes(&[0x66, 0x48, 0x0F, 0x6E, 0xC8]); // movq xmm1, rax
                self.bytes(&[0xF2, 0x0F, 0x59, 0xC1]); // mulsd xmm0, xmm1
                self.store_result();
            }
            Ir::CompareEq => {
                self.pop_binary_operands();
                self.bytes(&[0x66, 0x0F, 0x2E, 0xC1]); // ucomisd xmm0, xmm1
                // Equal only when ZF set and the compare was ordered.
                self.bytes(&[0x0F, 0x94, 0xC0]); // sete al
                self.bytes(&[0x0F, 0x9B, 0xC1]); // setnp cl
                self.bytes(&[0x20, 0xC8]); // and al, cl
                self.flag_to_f64_result();
            }
            Ir::CompareLt => {
                self.pop_binary_operands();
                // a < b computed as b above a; unordered clears both
                // flags, so NaN compares false, like the interpreter.
                self.bytes(&[0x66, 0x0F, 0x2E, 0xC8]); // ucomisd xmm1, xmm0
                self.bytes(&[0x0F, 0x97, 0xC0]); // seta al
                self.flag_to_f64_result();
            }
            Ir::CompareGt => {
                self.pop_binary_operands();
                self.bytes(&[0x66, 0x0F, 0x2E, 0xC1]); // ucomisd xmm0, xmm1
                self.bytes(&[0x0F, 0x97, 0xC0]); // seta al
                self.flag_to_f64_result();
            }
            Ir::Jump(target) => {
                self.bytes(&[0xE9]);
                self.rel32_placeholder(FixupTarget::Ir(target as usize));
            }
            Ir::JumpIfFalse(target) => {
                // pop rax; movq xmm0, rax
                self.bytes(&[0x58]);
                self.bytes(&[0x66, 0x48, 0x0F, 0x6E, 0xC0]);
                self.bytes(&[0x66, 0x0F, 0x57, 0xC9]); // xorpd xmm1, xmm1
                self.bytes(&[0x66, 0x0F, 0x2E, 0xC1]); // ucomisd xmm0, xmm1
                // NaN is truthy: parity set means unordered, fall through.
                self.bytes(&[0x7A, 0x06]); // jp +6
                self.bytes(&[0x0F, 0x84]); // je target
                self.rel32_placeholder(FixupTarget::Ir(target as usize));
            }
            Ir::Return => {
                // pop rax; mov [rsi], rax; xor eax, eax
                self.bytes(&[0x58, 0x48, 0x89, 0x06, 0x31, 0xC0]);
                self.epilogue_tail();
            }
            Ir::LoadConst(Const::Null) | Ir::LoadString(_) | Ir::Call { .. } | Ir::Print(_) => {
                return None;
            }
        }
        Some(())
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::jit::opt::{dead_code_elimination, optimize_code, OptConfig};
    use crate::jit::lower::lower_function;
    use crate::ast::Stmt;
    use crate::parser::Parser;

    fn lowered(src: &str) -> JitFunction {
        let (program, errors) = Parser::new(src).parse();
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        for stmt in &program.stmts {
            if let Stmt::FuncDecl { def, .. } = stmt {
                let mut jf = lower_function(def).expect("lowerable");
                dead_code_elimination(&mut jf.code);
                return jf;
            }
        }
        panic!("no function in source");
    }

    fn run(native: &NativeCode, locals: usize, args: &[f64]) -> NativeOutcome {
        let values: Vec<Value> = args.iter().map(|&n| Value::Num(n)).collect();
        call_native(native, &values, locals)
    }

    #[test]
    fn adds_two_numbers() {
        let jf = lowered("def f(a, b) { return a + b }");
        let native = compile(&jf).expect("compiles");
        assert_eq!(run(&native, jf.names.len(), &[2.0, 3.0]), NativeOutcome::Value(5.0));
        assert_eq!(run(&native, jf.names.len(), &[-1.5, 0.5]), NativeOutcome::Value(-1.0));
    }

    #[test]
    fn guard_rejects_wrong_shape() {
        let jf = lowered("def f(a, b) { return a + b }");
        let native = compile(&jf).expect("compiles");
        let args = vec![Value::Num(1.0), Value::Bool(true)];
        assert_eq!(call_native(&native, &args, jf.names.len()), NativeOutcome::GuardFail);
        let args = vec![Value::Num(1.0)];
        assert_eq!(call_native(&native, &args, jf.names.len()), NativeOutcome::GuardFail);
    }

    #[test]
    fn division_by_zero_side_exits() {
        let jf = lowered("def f(a, b) { return a / b }");
        let native = compile(&jf).expect("compiles");
        assert_eq!(run(&native, jf.names.len(), &[1.0, 0.0]), NativeOutcome::DivByZero);
        assert_eq!(run(&native, jf.names.len(), &[9.0, 3.0]), NativeOutcome::Value(3.0));
    }

    #[test]
    fn loop_accumulates() {
        let jf = lowered(
            "def f(n) { let s = 0; let i = 0; while (i < n) { s = s + i; i = i + 1 } return s }",
        );
        let native = compile(&jf).expect("compiles");
        assert_eq!(run(&native, jf.names.len(), &[10.0]), NativeOutcome::Value(45.0));
        assert_eq!(run(&native, jf.names.len(), &[0.0]), NativeOutcome::Value(0.0));
    }

    #[test]
    fn comparisons_handle_nan_like_the_interpreter() {
        let jf = lowered("def f(a, b) { if (a < b) { return 1 } return 0 }");
        let native = compile(&jf).expect("compiles");
        assert_eq!(run(&native, jf.names.len(), &[f64::NAN, 1.0]), NativeOutcome::Value(0.0));
        assert_eq!(run(&native, jf.names.len(), &[0.0, 1.0]), NativeOutcome::Value(1.0));
    }

    #[test]
    fn optimized_code_still_matches() {
        let jf_src =
            "def f(n) { let s = 0; let i = 0; while (i < n) { s = s + i * 8; i = i + 1 } return s }";
        let mut jf = lowered(jf_src);
        optimize_code(&mut jf.code, &OptConfig::default());
        let native = compile(&jf).expect("compiles");
        assert_eq!(run(&native, jf.names.len(), &[5.0]), NativeOutcome::Value(80.0));
    }

    #[test]
    fn ineligible_functions_are_refused() {
        let jf = lowered("def f() { return \"text\" }");
        assert!(native_eligible(&jf).is_err());
        assert!(compile(&jf).is_none());
    }
}
