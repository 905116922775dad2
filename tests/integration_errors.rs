/// Exception engine behaviour: kinds and their hierarchy, catch
/// matching, finally ordering, tracebacks, and the runtime boundary
/// conditions that must raise rather than silently continue.
use bolt::{BoltError, Engine, EngineConfig, ErrorKind, Parser, Thrown};

fn capture_engine() -> Engine {
    Engine::new(EngineConfig { capture_output: true, ..EngineConfig::default() })
}

fn output(src: &str) -> String {
    let mut engine = capture_engine();
    engine.run_source("<test>", src).expect("script should succeed");
    engine.take_output()
}

fn uncaught(src: &str) -> Thrown {
    let mut engine = capture_engine();
    match engine.run_source("<test>", src) {
        Err(BoltError::Runtime(thrown)) => thrown,
        Ok(_) => panic!("expected an uncaught error"),
        Err(other) => panic!("expected a runtime error, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[test]
fn division_by_zero_raises() {
    assert_eq!(uncaught("1 / 0").kind, ErrorKind::DivisionByZero);
    assert_eq!(uncaught("5 % 0").kind, ErrorKind::DivisionByZero);
}

#[test]
fn out_of_bounds_index_raises_index_error() {
    assert_eq!(uncaught("let a = [1, 2]; a[5]").kind, ErrorKind::Index);
    assert_eq!(uncaught("let a = [1, 2]; a[-3]").kind, ErrorKind::Index);
}

#[test]
fn missing_dict_key_raises_key_error() {
    assert_eq!(uncaught("let d = { a: 1 }; d[\"b\"]").kind, ErrorKind::Key);
}

#[test]
fn undefined_variable_raises_name_error() {
    assert_eq!(uncaught("ghost + 1").kind, ErrorKind::Name);
}

#[test]
fn type_mismatch_raises_type_error() {
    assert_eq!(uncaught("\"a\" * 2").kind, ErrorKind::Type);
    assert_eq!(uncaught("\"a\" + 2").kind, ErrorKind::Type);
    assert_eq!(uncaught("-\"a\"").kind, ErrorKind::Type);
    assert_eq!(uncaught("[] < []").kind, ErrorKind::Type);
}

#[test]
fn arity_mismatch_raises_type_error() {
    assert_eq!(uncaught("def f(a, b) { return a } f(1)").kind, ErrorKind::Type);
}

#[test]
fn calling_null_raises_null_error() {
    assert_eq!(uncaught("let f = null; f()").kind, ErrorKind::Null);
}

#[test]
fn member_on_null_raises_null_error() {
    assert_eq!(uncaught("let o = null; o.field").kind, ErrorKind::Null);
}

#[test]
fn infinite_recursion_raises_memory_error() {
    // Deep interpreter recursion needs the same oversized stack the
    // CLI gives its worker thread.
    let thrown = std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(|| uncaught("def spin() { return spin() } spin()"))
        .expect("spawn worker")
        .join()
        .expect("worker completed");
    assert_eq!(thrown.kind, ErrorKind::Memory);
}

#[test]
fn unknown_import_raises_import_error() {
    assert_eq!(uncaught("import \"nope\"").kind, ErrorKind::Import);
}

#[test]
fn assert_raises_assertion_error() {
    assert_eq!(uncaught("assert(false, \"boom\")").kind, ErrorKind::Assertion);
    assert_eq!(output("assert(1 == 1)\nprint(\"ok\")"), "ok\n");
}

// ---------------------------------------------------------------------------
// Catch matching and the hierarchy
// ---------------------------------------------------------------------------

#[test]
fn catch_by_exact_kind() {
    let src = "try { [1][9] } catch (IndexError e) { print(\"idx\") } catch (e) { print(\"other\") }";
    assert_eq!(output(src), "idx\n");
}

#[test]
fn catch_matches_ancestors_in_the_hierarchy() {
    // DivisionByZeroError is an ArithmeticError is a RuntimeError.
    let src = "try { 1 / 0 } catch (ArithmeticError e) { print(\"arith\") }";
    assert_eq!(output(src), "arith\n");
    let src = "try { 1 / 0 } catch (RuntimeError e) { print(\"runtime\") }";
    assert_eq!(output(src), "runtime\n");
}

#[test]
fn catch_does_not_match_siblings() {
    let src = "try { try { 1 / 0 } catch (IndexError e) { print(\"wrong\") } } \
               catch (e) { print(e.type) }";
    assert_eq!(output(src), "DivisionByZeroError\n");
}

#[test]
fn catch_star_and_exception_match_everything() {
    assert_eq!(output("try { 1 / 0 } catch * { print(\"any\") }"), "any\n");
    assert_eq!(output("try { [1][5] } catch Exception { print(\"any\") }"), "any\n");
}

#[test]
fn first_matching_catch_wins() {
    let src = "try { 1 / 0 } catch (RuntimeError e) { print(\"first\") } \
               catch (DivisionByZeroError e) { print(\"second\") }";
    assert_eq!(output(src), "first\n");
}

#[test]
fn caught_error_exposes_position_fields() {
    let src = "try { 1 / 0 } catch (e) { print(e.type); print(e.message); print(e.line > 0) }";
    assert_eq!(output(src), "DivisionByZeroError\ndivision by zero\ntrue\n");
}

// ---------------------------------------------------------------------------
// throw
// ---------------------------------------------------------------------------

#[test]
fn throw_string_becomes_runtime_error() {
    let src = "try { throw \"custom failure\" } catch (e) { print(e.type); print(e.message) }";
    assert_eq!(output(src), "RuntimeError\ncustom failure\n");
}

#[test]
fn throw_error_object_keeps_its_kind() {
    let src = "try { throw error(\"ValueError\", \"bad input\") } \
               catch (ValueError e) { print(e.message) }";
    assert_eq!(output(src), "bad input\n");
}

#[test]
fn user_defined_kinds_sit_under_runtime_error() {
    let src = "try { throw error(\"ParityError\", \"odd\") } \
               catch (RuntimeError e) { print(e.type) }";
    assert_eq!(output(src), "ParityError\n");
}

#[test]
fn rethrow_preserves_the_kind() {
    let src = "try { try { [1][5] } catch (e) { throw e } } catch (IndexError e) { print(\"again\") }";
    assert_eq!(output(src), "again\n");
}

// ---------------------------------------------------------------------------
// finally
// ---------------------------------------------------------------------------

#[test]
fn finally_runs_on_normal_completion() {
    assert_eq!(output("try { print(\"body\") } finally { print(\"fin\") }"), "body\nfin\n");
}

#[test]
fn finally_runs_on_caught_errors() {
    let src = "try { 1 / 0 } catch (e) { print(\"caught\") } finally { print(\"fin\") }";
    assert_eq!(output(src), "caught\nfin\n");
}

#[test]
fn finally_runs_on_uncaught_errors() {
    let mut engine = capture_engine();
    let err = engine.run_source("<test>", "try { 1 / 0 } finally { print(\"fin\") }");
    assert!(matches!(err, Err(BoltError::Runtime(_))));
    assert_eq!(engine.take_output(), "fin\n");
}

#[test]
fn finally_runs_on_return() {
    let src = "def f() { try { return 1 } finally { print(\"fin\") } } print(f())";
    assert_eq!(output(src), "fin\n1\n");
}

#[test]
fn error_in_finally_supplants_the_in_flight_error() {
    let src = "try { try { 1 / 0 } finally { throw \"replacement\" } } \
               catch (e) { print(e.type); print(e.message) }";
    assert_eq!(output(src), "RuntimeError\nreplacement\n");
}

// ---------------------------------------------------------------------------
// Tracebacks and labels
// ---------------------------------------------------------------------------

#[test]
fn uncaught_errors_render_kind_message_and_position() {
    let thrown = uncaught("def inner() { 1 / 0 }\ndef outer() { return inner() }\nouter()");
    let rendered = thrown.render("demo.bolt");
    assert!(rendered.starts_with("DivisionByZeroError: division by zero at demo.bolt:"));
    assert!(rendered.contains("in inner"));
    assert!(rendered.contains("in outer"));
}

#[test]
fn traceback_frames_are_innermost_first() {
    let thrown = uncaught("def inner() { ghost }\ndef outer() { return inner() }\nouter()");
    assert!(thrown.traceback.len() >= 2);
    assert_eq!(thrown.traceback[0].function.as_ref(), "inner");
    assert_eq!(thrown.traceback[1].function.as_ref(), "outer");
}

#[test]
fn unmatched_break_label_raises_name_error_at_runtime() {
    // Bypass the static checker to observe the runtime rule: a label
    // that matches no enclosing loop is a NameError, never a silent
    // break of the innermost loop.
    let (program, errors) =
        Parser::new("def f() { outer: while (true) { break missing } } f()").parse();
    assert!(errors.is_empty());
    let mut engine = capture_engine();
    let thrown = engine.interpret(&program).unwrap_err();
    assert_eq!(thrown.kind, ErrorKind::Name);
}

#[test]
fn errors_inside_loops_propagate_out() {
    let src = "try { for (let i = 0; i < 10; i = i + 1) { if (i == 2) { [0][9] } } } \
               catch (IndexError e) { print(\"caught\") }";
    assert_eq!(output(src), "caught\n");
}

#[test]
fn repl_style_engine_survives_errors() {
    let mut engine = capture_engine();
    assert!(engine.run_source("<1>", "1 / 0").is_err());
    // The engine keeps working after a failed line.
    engine.run_source("<2>", "print(2 + 2)").unwrap();
    assert_eq!(engine.take_output(), "4\n");
}
