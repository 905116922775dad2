/// IR optimization passes, run in order when a function is promoted to
/// the Optimized tier:
///
///   1. Dead code elimination: reachability from entry, unreachable
///      instructions dropped, jump targets remapped after compaction.
///   2. Constant folding and strength reduction: peephole over
///      LOAD_CONST/LOAD_CONST/op triples, MUL by a power of two becomes
///      SHIFT_LEFT, ADD 0 and MUL 1 identities are removed, and a
///      constant-false JUMP_IF_FALSE becomes an unconditional JUMP.
///   3. Loop-invariant code motion: for body-first loops (single back
///      edge), a self-contained window computing into a loop-local,
///      loop-dead-outside variable from operands the body never writes
///      is moved ahead of the loop entry.

use crate::jit::ir::{Const, Ir, JitFunction};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct OptConfig {
    pub dead_code: bool,
    pub constant_folding: bool,
    pub licm: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig { dead_code: true, constant_folding: true, licm: true }
    }
}

pub fn optimize(jf: &mut JitFunction, cfg: &OptConfig) {
    optimize_code(&mut jf.code, cfg);
}

pub fn optimize_code(code: &mut Vec<Ir>, cfg: &OptConfig) {
    if cfg.dead_code {
        dead_code_elimination(code);
    }
    if cfg.constant_folding {
        for _ in 0..8 {
            if !fold_constants(code) {
                break;
            }
        }
    }
    if cfg.licm {
        for _ in 0..4 {
            if !hoist_invariants(code) {
                break;
            }
        }
    }
    if cfg.dead_code {
        dead_code_elimination(code);
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

fn jump_targets(code: &[Ir]) -> HashSet<usize> {
    code.iter()
        .filter_map(|instr| instr.jump_target())
        .map(|t| t as usize)
        .collect()
}

/// Drop tombstoned instructions and remap every jump through the
/// old-to-new index table. A target pointing at a removed instruction
/// moves to the next surviving one.
fn compact(code: Vec<Option<Ir>>) -> Vec<Ir> {
    let len = code.len();
    let mut old_to_new = vec![0u32; len + 1];
    let mut next = 0u32;
    for (i, slot) in code.iter().enumerate() {
        old_to_new[i] = next;
        if slot.is_some() {
            next += 1;
        }
    }
    old_to_new[len] = next;

    code.into_iter()
        .flatten()
        .map(|instr| match instr.jump_target() {
            Some(t) => instr.with_jump_target(old_to_new[t as usize]),
            None => instr,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pass 1: dead code elimination
// ---------------------------------------------------------------------------

pub fn dead_code_elimination(code: &mut Vec<Ir>) -> bool {
    let len = code.len();
    if len == 0 {
        return false;
    }
    let mut reachable = vec![false; len];
    let mut worklist = vec![0usize];
    while let Some(i) = worklist.pop() {
        if i >= len || reachable[i] {
            continue;
        }
        reachable[i] = true;
        match code[i] {
            Ir::Jump(t) => worklist.push(t as usize),
            Ir::JumpIfFalse(t) => {
                worklist.push(i + 1);
                worklist.push(t as usize);
            }
            Ir::Return => {}
            _ => worklist.push(i + 1),
        }
    }
    if reachable.iter().all(|&r| r) {
        return false;
    }
    let tombstoned: Vec<Option<Ir>> = code
        .iter()
        .enumerate()
        .map(|(i, &instr)| reachable[i].then_some(instr))
        .collect();
    *code = compact(tombstoned);
    true
}

// ---------------------------------------------------------------------------
// Pass 2: constant folding and strength reduction
// ---------------------------------------------------------------------------

fn fold_binary(a: Const, b: Const, op: Ir) -> Option<Const> {
    match op {
        Ir::Add | Ir::Sub | Ir::Mul | Ir::Div => {
            let (Const::Num(x), Const::Num(y)) = (a, b) else { return None };
            match op {
                Ir::Add => Some(Const::Num(x + y)),
                Ir::Sub => Some(Const::Num(x - y)),
                Ir::Mul => Some(Const::Num(x * y)),
                // Folding a division by zero would erase the runtime
                // error; leave it to the interpreter.
                Ir::Div if y != 0.0 => Some(Const::Num(x / y)),
                _ => None,
            }
        }
        Ir::CompareEq => Some(Const::Bool(match (a, b) {
            (Const::Num(x), Const::Num(y)) => x == y,
            (Const::Bool(x), Const::Bool(y)) => x == y,
            (Const::Null, Const::Null) => true,
            _ => false,
        })),
        Ir::CompareLt => {
            let (Const::Num(x), Const::Num(y)) = (a, b) else { return None };
            Some(Const::Bool(x < y))
        }
        Ir::CompareGt => {
            let (Const::Num(x), Const::Num(y)) = (a, b) else { return None };
            Some(Const::Bool(x > y))
        }
        _ => None,
    }
}

fn const_truthy(c: Const) -> bool {
    match c {
        Const::Num(n) => n != 0.0,
        Const::Bool(b) => b,
        Const::Null => false,
    }
}

fn power_of_two_exponent(n: f64) -> Option<u8> {
    if n <= 1.0 || n.fract() != 0.0 || n > (1u64 << 62) as f64 {
        return None;
    }
    let bits = n as u64;
    if bits.is_power_of_two() {
        Some(bits.trailing_zeros() as u8)
    } else {
        None
    }
}

pub fn fold_constants(code: &mut Vec<Ir>) -> bool {
    let targets = jump_targets(code);
    let len = code.len();
    let mut work: Vec<Option<Ir>> = code.iter().copied().map(Some).collect();
    let mut changed = false;

    for i in 0..len {
        let Some(first) = work[i] else { continue };

        // LOAD_CONST a; LOAD_CONST b; op  ->  LOAD_CONST result
        if i + 2 < len && !targets.contains(&(i + 1)) && !targets.contains(&(i + 2)) {
            if let (Ir::LoadConst(a), Some(Ir::LoadConst(b)), Some(op)) =
                (first, work[i + 1], work[i + 2])
            {
                if let Some(result) = fold_binary(a, b, op) {
                    work[i] = Some(Ir::LoadConst(result));
                    work[i + 1] = None;
                    work[i + 2] = None;
                    changed = true;
                    continue;
                }
            }
        }

        if i + 1 < len && !targets.contains(&(i + 1)) {
            if let Ir::LoadConst(c) = first {
                match work[i + 1] {
                    // Unary folds.
                    Some(Ir::Neg) => {
                        if let Const::Num(n) = c {
                            work[i] = Some(Ir::LoadConst(Const::Num(-n)));
                            work[i + 1] = None;
                            changed = true;
                            continue;
                        }
                    }
                    Some(Ir::Not) => {
                        work[i] = Some(Ir::LoadConst(Const::Bool(!const_truthy(c))));
                        work[i + 1] = None;
                        changed = true;
                        continue;
                    }
                    // x + 0 and x * 1 identities.
                    Some(Ir::Add) if c == Const::Num(0.0) => {
                        work[i] = None;
                        work[i + 1] = None;
                        changed = true;
                        continue;
                    }
                    Some(Ir::Mul) if c == Const::Num(1.0) => {
                        work[i] = None;
                        work[i + 1] = None;
                        changed = true;
                        continue;
                    }
                    // Multiply by a power of two: shift instead.
                    Some(Ir::Mul) => {
                        if let Const::Num(n) = c {
                            if let Some(exp) = power_of_two_exponent(n) {
                                work[i] = Some(Ir::ShiftLeft(exp));
                                work[i + 1] = None;
                                changed = true;
                                continue;
                            }
                        }
                    }
                    // A branch that can never fall through.
                    Some(Ir::JumpIfFalse(t)) if c == Const::Bool(false) => {
                        work[i] = Some(Ir::Jump(t));
                        work[i + 1] = None;
                        changed = true;
                        continue;
                    }
                    _ => {}
                }
            }
        }
    }

    if changed {
        *code = compact(work);
    }
    changed
}

// ---------------------------------------------------------------------------
// Pass 3: loop-invariant code motion
// ---------------------------------------------------------------------------

/// Hoist one invariant window out of one loop, if any qualifies.
/// Loops are found through their backward JUMP; only loops with a
/// single entry edge to the head are considered. Candidate windows sit
/// in the loop's leading straight-line segment, which executes on
/// every entry to the head, so moving a window immediately before the
/// head preserves both its effects and any error it may raise. The
/// window must read only variables the body never writes, compute a
/// single value, and store it into a variable written nowhere else and
/// read only inside the loop after the window.
pub fn hoist_invariants(code: &mut Vec<Ir>) -> bool {
    let len = code.len();
    let targets = jump_targets(code);

    for back_pos in 0..len {
        let Ir::Jump(t) = code[back_pos] else { continue };
        let head = t as usize;
        if head >= back_pos {
            continue;
        }
        // Exactly one backward edge, and no forward jump may bypass
        // the hoisted code by landing on the head from above.
        let back_edges = code
            .iter()
            .enumerate()
            .filter(|(j, instr)| {
                matches!(instr.jump_target(), Some(x) if x as usize == head && (x as usize) < *j)
            })
            .count();
        let forward_entries = code
            .iter()
            .enumerate()
            .filter(|(j, instr)| {
                *j < head && matches!(instr.jump_target(), Some(x) if x as usize == head)
            })
            .count();
        if back_edges != 1 || forward_entries != 0 {
            continue;
        }

        // Leading straight-line segment: head up to the first branch.
        let mut seg_end = back_pos;
        for j in head..back_pos {
            if matches!(code[j], Ir::Jump(_) | Ir::JumpIfFalse(_)) {
                seg_end = j;
                break;
            }
        }

        let written: HashSet<u16> = (head..=back_pos)
            .filter_map(|j| match code[j] {
                Ir::StoreVar(v) => Some(v),
                _ => None,
            })
            .collect();

        if let Some((w, w_end)) = find_window(code, head, seg_end, back_pos, &written, &targets) {
            apply_hoist(code, head, w, w_end);
            return true;
        }
    }
    false
}

fn find_window(
    code: &[Ir],
    head: usize,
    seg_end: usize,
    back_pos: usize,
    written: &HashSet<u16>,
    targets: &HashSet<usize>,
) -> Option<(usize, usize)> {
    'outer: for w in head..seg_end {
        // The only jump allowed to land on the window is the loop
        // entry itself, at the head.
        if w != head && targets.contains(&w) {
            continue 'outer;
        }
        let mut depth: i32 = 0;
        for j in w..seg_end {
            if j > w && targets.contains(&j) {
                continue 'outer;
            }
            match code[j] {
                Ir::LoadConst(_) => depth += 1,
                Ir::LoadVar(v) => {
                    if written.contains(&v) {
                        continue 'outer;
                    }
                    depth += 1;
                }
                Ir::Add | Ir::Sub | Ir::Mul | Ir::CompareEq | Ir::CompareLt | Ir::CompareGt => {
                    depth -= 1;
                    if depth < 1 {
                        continue 'outer;
                    }
                }
                Ir::Neg | Ir::Not | Ir::ShiftLeft(_) => {
                    if depth < 1 {
                        continue 'outer;
                    }
                }
                Ir::StoreVar(x) => {
                    if depth != 1 {
                        continue 'outer;
                    }
                    if store_disqualifies(code, x, w, j, back_pos) {
                        continue 'outer;
                    }
                    return Some((w, j));
                }
                // Division may fold a zero divisor into earlier control
                // flow; calls, prints and branches are never invariant.
                _ => continue 'outer,
            }
        }
    }
    None
}

/// The hoist target variable must be written only by the window's own
/// store and read only inside the loop after the window.
fn store_disqualifies(code: &[Ir], x: u16, w: usize, w_end: usize, back_pos: usize) -> bool {
    for (j, instr) in code.iter().enumerate() {
        match instr {
            Ir::StoreVar(v) if *v == x => {
                if j < w || j > w_end {
                    return true;
                }
            }
            Ir::LoadVar(v) if *v == x => {
                if j <= w_end || j > back_pos {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn apply_hoist(code: &mut Vec<Ir>, head: usize, w: usize, w_end: usize) {
    let window: Vec<Ir> = code[w..=w_end].to_vec();
    let hoist_len = (w_end - w + 1) as u32;

    // After the move, the loop's first retained instruction sits at
    // head + window length; indices past the window are unchanged.
    let remap = |u: u32| -> u32 {
        let ui = u as usize;
        if ui < head {
            u
        } else if ui < w {
            u + hoist_len
        } else if ui <= w_end {
            head as u32 + hoist_len
        } else {
            u
        }
    };

    let mut out: Vec<Ir> = Vec::with_capacity(code.len());
    out.extend_from_slice(&code[..head]);
    out.extend_from_slice(&window);
    out.extend_from_slice(&code[head..w]);
    out.extend_from_slice(&code[w_end + 1..]);

    for instr in out.iter_mut() {
        if let Some(t) = instr.jump_target() {
            *instr = instr.with_jump_target(remap(t));
        }
    }
    *code = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::Const::{Bool, Num};

    #[test]
    fn folds_constant_triples() {
        let mut code = vec![
            Ir::LoadConst(Num(2.0)),
            Ir::LoadConst(Num(3.0)),
            Ir::Add,
            Ir::Return,
        ];
        assert!(fold_constants(&mut code));
        assert_eq!(code, vec![Ir::LoadConst(Num(5.0)), Ir::Return]);
    }

    #[test]
    fn does_not_fold_division_by_zero() {
        let mut code = vec![
            Ir::LoadConst(Num(1.0)),
            Ir::LoadConst(Num(0.0)),
            Ir::Div,
            Ir::Return,
        ];
        assert!(!fold_constants(&mut code));
    }

    #[test]
    fn strength_reduces_power_of_two_multiply() {
        let mut code = vec![
            Ir::LoadVar(0),
            Ir::LoadConst(Num(8.0)),
            Ir::Mul,
            Ir::Return,
        ];
        assert!(fold_constants(&mut code));
        assert_eq!(code, vec![Ir::LoadVar(0), Ir::ShiftLeft(3), Ir::Return]);
    }

    #[test]
    fn removes_add_zero_and_mul_one() {
        let mut code = vec![
            Ir::LoadVar(0),
            Ir::LoadConst(Num(0.0)),
            Ir::Add,
            Ir::LoadConst(Num(1.0)),
            Ir::Mul,
            Ir::Return,
        ];
        while fold_constants(&mut code) {}
        assert_eq!(code, vec![Ir::LoadVar(0), Ir::Return]);
    }

    #[test]
    fn rewrites_constant_false_branch() {
        let mut code = vec![
            Ir::LoadConst(Bool(false)),
            Ir::JumpIfFalse(3),
            Ir::LoadConst(Num(1.0)),
            Ir::Return,
        ];
        assert!(fold_constants(&mut code));
        // The pair collapsed to a JUMP; the target tracked compaction.
        assert_eq!(code[0], Ir::Jump(2));
    }

    #[test]
    fn folding_respects_jump_targets() {
        // Instruction 1 is a jump target; the triple must survive.
        let mut code = vec![
            Ir::LoadConst(Num(2.0)),
            Ir::LoadConst(Num(3.0)),
            Ir::Add,
            Ir::Jump(1),
        ];
        assert!(!fold_constants(&mut code));
    }

    #[test]
    fn dce_drops_code_after_return() {
        let mut code = vec![
            Ir::LoadConst(Num(1.0)),
            Ir::Return,
            Ir::LoadConst(Num(2.0)),
            Ir::Return,
        ];
        assert!(dead_code_elimination(&mut code));
        assert_eq!(code, vec![Ir::LoadConst(Num(1.0)), Ir::Return]);
    }

    #[test]
    fn dce_remaps_surviving_jumps() {
        let mut code = vec![
            Ir::Jump(3),
            Ir::LoadConst(Num(9.0)), // unreachable
            Ir::Return,              // unreachable
            Ir::LoadConst(Num(1.0)),
            Ir::Return,
        ];
        assert!(dead_code_elimination(&mut code));
        assert_eq!(
            code,
            vec![Ir::Jump(1), Ir::LoadConst(Num(1.0)), Ir::Return]
        );
    }

    #[test]
    fn licm_hoists_from_body_first_loop() {
        // do { t = a * b; s = s + t; i = i + 1 } while-shaped loop:
        //   0: LoadVar a      <- invariant window start
        //   1: LoadVar b
        //   2: Mul
        //   3: StoreVar t     <- window end
        //   4: LoadVar s
        //   5: LoadVar t
        //   6: Add
        //   7: StoreVar s
        //   8: LoadVar i
        //   9: JumpIfFalse 11 (exit)
        //  10: Jump 0
        //  11: Return
        let a = 0u16;
        let b = 1u16;
        let t = 2u16;
        let s = 3u16;
        let i = 4u16;
        let mut code = vec![
            Ir::LoadVar(a),
            Ir::LoadVar(b),
            Ir::Mul,
            Ir::StoreVar(t),
            Ir::LoadVar(s),
            Ir::LoadVar(t),
            Ir::Add,
            Ir::StoreVar(s),
            Ir::LoadVar(i),
            Ir::JumpIfFalse(11),
            Ir::Jump(0),
            Ir::Return,
        ];
        assert!(hoist_invariants(&mut code));
        // Window now precedes the loop; the back edge lands after it.
        assert_eq!(&code[0..4], &[Ir::LoadVar(a), Ir::LoadVar(b), Ir::Mul, Ir::StoreVar(t)]);
        assert_eq!(code[10], Ir::Jump(4));
        // Nothing further qualifies.
        assert!(!hoist_invariants(&mut code));
    }

    #[test]
    fn licm_only_hoists_from_the_leading_segment() {
        // Condition-first loop: the leading segment is the condition,
        // which stores nothing, so the invariant code in the body
        // (after the exit branch) must stay put.
        //   0: LoadVar i
        //   1: JumpIfFalse 8 (exit)
        //   2: LoadVar a
        //   3: Neg
        //   4: StoreVar t
        //   5: LoadVar t
        //   6: StoreVar s
        //   7: Jump 0
        //   8: Return
        let mut code = vec![
            Ir::LoadVar(4),
            Ir::JumpIfFalse(8),
            Ir::LoadVar(0),
            Ir::Neg,
            Ir::StoreVar(2),
            Ir::LoadVar(2),
            Ir::StoreVar(3),
            Ir::Jump(0),
            Ir::Return,
        ];
        assert!(!hoist_invariants(&mut code));
    }
}
