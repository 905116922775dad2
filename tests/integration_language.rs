/// End-to-end language behaviour through the public engine API.
///
/// These tests run whole programs with captured output and verify:
///   - operator precedence and arithmetic
///   - closures capturing their defining environment
///   - loops, labels, and for-in over every iterable kind
///   - match expressions with guards and destructuring
///   - dict literals with insertion order and key lookup
///   - the documented end-to-end transcripts
use bolt::{Engine, EngineConfig, Value};

fn capture_engine() -> Engine {
    Engine::new(EngineConfig { capture_output: true, ..EngineConfig::default() })
}

fn run(src: &str) -> (Engine, Value) {
    let mut engine = capture_engine();
    let value = match engine.run_source("<test>", src) {
        Ok(value) => value,
        Err(err) => panic!("script failed: {:?}", err),
    };
    (engine, value)
}

fn output(src: &str) -> String {
    let (mut engine, _) = run(src);
    engine.take_output()
}

fn result_number(src: &str) -> f64 {
    let (_, value) = run(src);
    match value {
        Value::Num(n) => n,
        other => panic!("expected a number, got {}", other.display()),
    }
}

// ---------------------------------------------------------------------------
// Transcripts
// ---------------------------------------------------------------------------

#[test]
fn transcript_precedence() {
    assert_eq!(output("let x = 1 + 2 * 3; print(x)"), "7\n");
}

#[test]
fn transcript_factorial() {
    let src = "def fact(n) { if (n < 2) return 1; return n * fact(n-1) } print(fact(10))";
    assert_eq!(output(src), "3628800\n");
}

#[test]
fn transcript_closure_adder() {
    let src = "def adder(n) { def inner(x) { return x + n } return inner } \
               let a5 = adder(5); print(a5(10))";
    assert_eq!(output(src), "15\n");
}

#[test]
fn transcript_try_catch_finally() {
    let src = "try { let a = [1,2]; print(a[5]) } catch (e) { print(\"err:\"); print(e.type) } \
               finally { print(\"done\") }";
    assert_eq!(output(src), "err:\nIndexError\ndone\n");
}

#[test]
fn transcript_dict_lookup() {
    assert_eq!(output("let dict = { a: 1 }; print(dict[\"a\"])"), "1\n");
}

// ---------------------------------------------------------------------------
// Values and operators
// ---------------------------------------------------------------------------

#[test]
fn program_result_is_last_expression_value() {
    assert_eq!(result_number("1 + 2"), 3.0);
    let (_, value) = run("let x = 5");
    assert!(matches!(value, Value::Null));
}

#[test]
fn string_concatenation() {
    assert_eq!(output("print(\"foo\" + \"bar\")"), "foobar\n");
}

#[test]
fn short_circuit_returns_operand() {
    assert_eq!(output("print(null && 1)"), "null\n");
    assert_eq!(output("print(2 || 1)"), "2\n");
    assert_eq!(output("print(0 || \"fallback\")"), "fallback\n");
}

#[test]
fn short_circuit_skips_right_side() {
    let src = "def boom() { throw \"must not run\" } print(false && boom())";
    assert_eq!(output(src), "false\n");
}

#[test]
fn truthiness_boundaries() {
    assert_eq!(output("if \"\" { print(\"t\") } else { print(\"f\") }"), "f\n");
    assert_eq!(output("if 0 { print(\"t\") } else { print(\"f\") }"), "f\n");
    assert_eq!(output("if \"x\" { print(\"t\") } else { print(\"f\") }"), "t\n");
    assert_eq!(output("print(len(\"\"))"), "0\n");
}

#[test]
fn equality_is_structural() {
    assert_eq!(output("print([1, [2]] == [1, [2]])"), "true\n");
    assert_eq!(output("print({a: 1} == {a: 1})"), "true\n");
    assert_eq!(output("print({a: 1} == {a: 2})"), "false\n");
    assert_eq!(output("print(1 == \"1\")"), "false\n");
}

#[test]
fn range_boundaries() {
    assert_eq!(output("print(range(0, 0) == [])"), "true\n");
    assert_eq!(output("print(range(5, 0, -1) == [5, 4, 3, 2, 1])"), "true\n");
    assert_eq!(output("print(len(range(3)))"), "3\n");
}

#[test]
fn number_formatting_round_trip() {
    assert_eq!(output("print(3.5)"), "3.5\n");
    assert_eq!(output("print(10 / 4)"), "2.5\n");
    assert_eq!(output("print(-0.25)"), "-0.25\n");
}

// ---------------------------------------------------------------------------
// Bindings and scope
// ---------------------------------------------------------------------------

#[test]
fn closures_see_call_time_values() {
    let src = "let n = 1\ndef f() { return n }\nn = 2\nprint(f())";
    assert_eq!(output(src), "2\n");
}

#[test]
fn closures_capture_independent_environments() {
    let src = "def adder(n) { def inner(x) { return x + n } return inner }\n\
               let a = adder(1); let b = adder(10)\nprint(a(1)); print(b(1))";
    assert_eq!(output(src), "2\n11\n");
}

#[test]
fn shadowing_restores_outer_binding() {
    let src = "let x = 1\n{ let x = 9\nprint(x) }\nprint(x)";
    assert_eq!(output(src), "9\n1\n");
}

#[test]
fn assignment_writes_the_defining_frame() {
    let src = "let total = 0\ndef bump() { total = total + 1 }\nbump(); bump()\nprint(total)";
    assert_eq!(output(src), "2\n");
}

#[test]
fn const_rebinding_fails_across_runs() {
    let mut engine = capture_engine();
    engine.run_source("<a>", "const k = 7").unwrap();
    let err = engine.run_source("<b>", "k = 8").unwrap_err();
    match err {
        bolt::BoltError::Runtime(thrown) => {
            assert_eq!(thrown.kind, bolt::ErrorKind::Type);
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn mutual_recursion_through_the_enclosing_frame() {
    let src = "def is_even(n) { if (n == 0) return true; return is_odd(n - 1) }\n\
               def is_odd(n) { if (n == 0) return false; return is_even(n - 1) }\n\
               print(is_even(10)); print(is_odd(7))";
    assert_eq!(output(src), "true\ntrue\n");
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[test]
fn while_and_do_while() {
    assert_eq!(
        output("let i = 0; let s = 0; while (i < 5) { s = s + i; i = i + 1 } print(s)"),
        "10\n"
    );
    assert_eq!(
        output("let i = 10; do { i = i + 1 } while (i < 5)\nprint(i)"),
        "11\n"
    );
}

#[test]
fn c_style_for_loop() {
    assert_eq!(
        output("let s = 0; for (let i = 0; i < 4; i = i + 1) { s = s + i } print(s)"),
        "6\n"
    );
}

#[test]
fn for_in_over_each_iterable_kind() {
    assert_eq!(output("let s = 0; for x in [1, 2, 3] { s = s + x } print(s)"), "6\n");
    assert_eq!(output("let s = 0; for x in (4, 5) { s = s + x } print(s)"), "9\n");
    assert_eq!(output("let s = \"\"; for c in \"abc\" { s = s + c } print(s)"), "abc\n");
    assert_eq!(output("let s = 0; for n in range(1, 4) { s = s + n } print(s)"), "6\n");
    assert_eq!(
        output("let d = { a: 1, b: 2 }; let ks = \"\"; for k in d { ks = ks + k } print(ks)"),
        "ab\n"
    );
}

#[test]
fn break_and_continue() {
    assert_eq!(
        output("let s = 0; for (let i = 0; i < 10; i = i + 1) { if (i == 3) break\ns = s + i } print(s)"),
        "3\n"
    );
    assert_eq!(
        output("let s = 0; for (let i = 0; i < 5; i = i + 1) { if (i == 2) continue\ns = s + i } print(s)"),
        "8\n"
    );
}

#[test]
fn labeled_break_unwinds_nested_loops() {
    let src = "let hits = 0\n\
               outer: for (let i = 0; i < 3; i = i + 1) {\n\
                 for (let j = 0; j < 3; j = j + 1) {\n\
                   if (i * j == 2) break outer\n\
                   hits = hits + 1\n\
                 }\n\
               }\n\
               print(hits)";
    // Stops at i=1, j=2: iterations (0,0..2) and (1,0..1).
    assert_eq!(output(src), "5\n");
}

#[test]
fn labeled_continue_targets_the_outer_loop() {
    let src = "let hits = 0\n\
               outer: for (let i = 0; i < 3; i = i + 1) {\n\
                 for (let j = 0; j < 3; j = j + 1) {\n\
                   if (j == 1) continue outer\n\
                   hits = hits + 1\n\
                 }\n\
               }\n\
               print(hits)";
    assert_eq!(output(src), "3\n");
}

#[test]
fn return_unwinds_enclosing_loops() {
    let src = "def find(limit) { for (let i = 0; i < limit; i = i + 1) { if (i == 3) return i } return -1 }\n\
               print(find(10)); print(find(2))";
    assert_eq!(output(src), "3\n-1\n");
}

// ---------------------------------------------------------------------------
// Functions and builtins
// ---------------------------------------------------------------------------

#[test]
fn anonymous_functions_and_higher_order_use() {
    let src = "def apply(f, x) { return f(x) }\nprint(apply(def(n) { return n * 2 }, 21))";
    assert_eq!(output(src), "42\n");
}

#[test]
fn builtins_are_callable_values() {
    assert_eq!(output("let f = len; print(f([1, 2, 3]))"), "3\n");
    assert_eq!(output("print(type(1), type(\"s\"), type(null), type([]))"), "number string null list\n");
}

#[test]
fn printf_formats_without_trailing_newline() {
    assert_eq!(output("printf(\"%s=%d%%\\n\", \"cpu\", 93.7)"), "cpu=93%\n");
    assert_eq!(output("printf(\"%g\", 2.5)"), "2.5");
}

#[test]
fn string_and_list_methods() {
    assert_eq!(output("print(\"Hello World\".upper())"), "HELLO WORLD\n");
    assert_eq!(output("print(\"a,b,c\".split(\",\").join(\"-\"))"), "a-b-c\n");
    assert_eq!(output("let l = [1]; l.push(2); print(l.len(), l.last())"), "2 2\n");
    assert_eq!(output("let d = {a: 1}; print(d.has(\"a\"), d.get(\"b\", 9))"), "true 9\n");
}

#[test]
fn array_builtin_makes_fixed_slices() {
    assert_eq!(output("let a = array(3, 0); a[1] = 5; print(a[0], a[1], len(a))"), "0 5 3\n");
}

#[test]
fn method_calls_on_dict_stored_functions() {
    let src = "let m = { double: def(x) { return x * 2 } }\nprint(m.double(8))";
    assert_eq!(output(src), "16\n");
}

// ---------------------------------------------------------------------------
// match
// ---------------------------------------------------------------------------

#[test]
fn match_selects_first_matching_arm() {
    let src = "def describe(v) { return match v { 0 => \"zero\", n if n < 0 => \"negative\", _ => \"positive\" } }\n\
               print(describe(0)); print(describe(-4)); print(describe(9))";
    assert_eq!(output(src), "zero\nnegative\npositive\n");
}

#[test]
fn match_destructures_lists_with_rest() {
    let src = "let v = [1, 2, 3, 4]\n\
               let r = match v { [head, ...tail] => head + len(tail), _ => -1 }\n\
               print(r)";
    assert_eq!(output(src), "4\n");
}

#[test]
fn match_destructures_objects() {
    let src = "let p = { x: 3, y: 4 }\n\
               let r = match p { {x, y} => x * x + y * y, _ => 0 }\n\
               print(r)";
    assert_eq!(output(src), "25\n");
}

#[test]
fn match_type_tags() {
    let src = "def kind(v) { return match v { number => \"num\", string => \"str\", bool => \"bool\", _ => \"other\" } }\n\
               print(kind(1)); print(kind(\"x\")); print(kind(true)); print(kind([]))";
    assert_eq!(output(src), "num\nstr\nbool\nother\n");
}

#[test]
fn match_pattern_binding_round_trip() {
    // Pattern `x` always succeeds and binds the whole value.
    let src = "let v = [1, \"two\", (3, 4)]\nlet r = match v { x => x }\nprint(r == v)";
    assert_eq!(output(src), "true\n");
}

#[test]
fn match_guard_failure_discards_bindings_and_continues() {
    let src = "let r = match 5 { n if n > 10 => n * 100, n => n + 1 }\nprint(r)";
    assert_eq!(output(src), "6\n");
}

#[test]
fn match_without_matching_arm_yields_null() {
    assert_eq!(output("print(match 3 { 1 => \"one\" })"), "null\n");
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[test]
fn async_await_runs_the_task_and_yields_its_value() {
    let src = "let t = spawn(def() { return 21 })\nprint(async_await(t) * 2)";
    assert_eq!(output(src), "42\n");
}

#[test]
fn spawn_passes_extra_arguments_to_the_callable() {
    let src = "def add(a, b) { return a + b }\nprint(async_await(spawn(add, 1, 2)))";
    assert_eq!(output(src), "3\n");
}

#[test]
fn spawned_tasks_do_not_run_until_awaited() {
    let src = "let log = []\n\
               let t = spawn(def() { push(log, 1)\nreturn 0 })\n\
               print(len(log))\n\
               async_await(t)\n\
               print(len(log))";
    assert_eq!(output(src), "0\n1\n");
}

#[test]
fn tasks_on_the_same_loop_fire_in_spawn_order() {
    // Awaiting the later task still drains the queue FIFO.
    let src = "let order = []\n\
               let a = spawn(def() { push(order, \"a\")\nreturn 0 })\n\
               let b = spawn(def() { push(order, \"b\")\nreturn 0 })\n\
               async_await(b)\n\
               print(order.join(\"\"))";
    assert_eq!(output(src), "ab\n");
}

#[test]
fn cancelled_task_awaits_to_null() {
    let src = "let t = spawn(def() { return 5 })\ncancel(t)\nprint(async_await(t) == null)";
    assert_eq!(output(src), "true\n");
}

#[test]
fn failing_task_reraises_when_awaited() {
    let src = "let t = spawn(def() { throw \"boom\" })\n\
               try { async_await(t) } catch (e) { print(e.message) }";
    assert_eq!(output(src), "boom\n");
}

#[test]
fn await_timeout_reports_a_status() {
    let src = "let t = spawn(def() { return 9 })\n\
               let r = await_timeout(t, 100)\n\
               print(r.status, r.value)";
    assert_eq!(output(src), "completed 9\n");
}

#[test]
fn task_handles_are_first_class_values() {
    let src = "let t = spawn(def() { return 3 })\n\
               print(type(t))\n\
               print(async_await(t))\n\
               print(async_await(t))";
    // Awaiting a settled task just reads its outcome again.
    assert_eq!(output(src), "task\n3\n3\n");
}

// ---------------------------------------------------------------------------
// Statement surface
// ---------------------------------------------------------------------------

#[test]
fn semicolons_and_newlines_are_equivalent_terminators() {
    assert_eq!(output("let a = 1; let b = 2; print(a + b)"), "3\n");
    assert_eq!(output("let a = 1\nlet b = 2\nprint(a + b)"), "3\n");
}

#[test]
fn hash_and_block_comments_are_skipped() {
    let src = "# hash comment\nlet a = 1 // trailing\n/* block\n comment */ print(a)";
    assert_eq!(output(src), "1\n");
}

#[test]
fn colon_blocks_parse_as_function_bodies() {
    // A colon body runs to the next top-level def or EOF, so the
    // definitions and the call arrive in separate chunks.
    let mut engine = capture_engine();
    engine
        .run_source("<defs>", "def one():\n  return 1\ndef two():\n  return 2")
        .unwrap();
    engine.run_source("<call>", "print(one() + two())").unwrap();
    assert_eq!(engine.take_output(), "3\n");
}

#[test]
fn print_statement_with_multiple_arguments() {
    assert_eq!(output("print 1, \"two\", [3]"), "1 two [3]\n");
}

#[test]
fn tuple_values_are_immutable() {
    let mut engine = capture_engine();
    let err = engine.run_source("<t>", "let t = (1, 2); t[0] = 9").unwrap_err();
    match err {
        bolt::BoltError::Runtime(thrown) => assert_eq!(thrown.kind, bolt::ErrorKind::Type),
        other => panic!("expected runtime error, got {:?}", other),
    }
}
