/// Tiering pipeline behaviour: hot-spot promotion, interpreter/JIT
/// result equivalence, deoptimization on shape changes, and the
/// observable statistics the engine exposes.
use bolt::inline_cache::IcState;
use bolt::{Engine, EngineConfig, Tier, Value};

fn engine_with(config: EngineConfig) -> Engine {
    Engine::new(EngineConfig { capture_output: true, ..config })
}

/// Low thresholds so tests promote quickly.
fn eager_config() -> EngineConfig {
    EngineConfig {
        hot_call_min: 20,
        hot_frac: 0.01,
        opt_threshold: 30,
        ..EngineConfig::default()
    }
}

fn run_with(config: EngineConfig, src: &str) -> (Engine, Value) {
    let mut engine = engine_with(config);
    let value = engine
        .run_source("<jit-test>", src)
        .expect("script should succeed");
    (engine, value)
}

/// The same program through the tree-walk only and through the full
/// pipeline must produce identical output.
fn assert_jit_equivalence(src: &str) {
    let (mut interp_only, _) = run_with(
        EngineConfig { jit_enabled: false, ..EngineConfig::default() },
        src,
    );
    let (mut tiered, _) = run_with(eager_config(), src);
    assert_eq!(interp_only.take_output(), tiered.take_output());
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

#[test]
fn hot_function_is_promoted_to_baseline_or_higher() {
    let src = "def fact(n) { if (n < 2) return 1; return n * fact(n-1) }\n\
               for (let i = 0; i < 1500; i = i + 1) { fact(5) }\n\
               print(fact(5))";
    let (mut engine, _) = run_with(EngineConfig::default(), src);
    assert_eq!(engine.take_output(), "120\n");
    // The driving loop crossed both hotness thresholds.
    assert!(engine.function_tier("fact") >= Tier::Baseline);
    assert!(engine.profiler.call_count("fact") > 1500);
}

#[test]
fn numeric_loop_reaches_the_optimized_tier() {
    let src = "def total(n) { let s = 0; let i = 0; while (i < n) { s = s + i; i = i + 1 } return s }\n\
               for (let k = 0; k < 200; k = k + 1) { total(50) }\n\
               print(total(10))";
    let (mut engine, _) = run_with(eager_config(), src);
    assert_eq!(engine.take_output(), "45\n");
    assert_eq!(engine.function_tier("total"), Tier::Optimized);
    let stats = engine.stats();
    assert!(stats.jit.compiled_baseline >= 1);
    assert!(stats.jit.compiled_optimized >= 1);
}

#[test]
fn cold_functions_stay_on_the_interpreter() {
    let src = "def once(n) { return n + 1 }\nprint(once(1))";
    let (engine, _) = run_with(EngineConfig::default(), src);
    assert_eq!(engine.function_tier("once"), Tier::Interp);
}

#[test]
fn unlowerable_functions_are_refused_once() {
    // Method calls keep the function on the tree-walk forever.
    let src = "def shout(s) { return s.upper() }\n\
               for (let i = 0; i < 200; i = i + 1) { shout(\"hey\") }\n\
               print(shout(\"done\"))";
    let (mut engine, _) = run_with(eager_config(), src);
    assert_eq!(engine.take_output(), "DONE\n");
    assert_eq!(engine.function_tier("shout"), Tier::Interp);
    assert!(engine.stats().jit.lowering_bailed >= 1);
}

#[test]
fn jit_disabled_never_compiles() {
    let src = "def f(n) { return n * 2 }\n\
               for (let i = 0; i < 500; i = i + 1) { f(i) }\nprint(f(4))";
    let (mut engine, _) = run_with(
        EngineConfig { jit_enabled: false, ..EngineConfig::default() },
        src,
    );
    assert_eq!(engine.take_output(), "8\n");
    let stats = engine.stats();
    assert_eq!(stats.jit.compiled_baseline, 0);
    assert_eq!(stats.jit.compiled_optimized, 0);
}

// ---------------------------------------------------------------------------
// Equivalence
// ---------------------------------------------------------------------------

#[test]
fn equivalence_recursive_arithmetic() {
    assert_jit_equivalence(
        "def fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2) }\n\
         for (let i = 0; i < 100; i = i + 1) { fib(10) }\n\
         print(fib(15))",
    );
}

#[test]
fn equivalence_loops_and_breaks() {
    assert_jit_equivalence(
        "def count(limit) {\n\
           let n = 0\n\
           for (let i = 0; i < limit; i = i + 1) {\n\
             if (i == 40) break\n\
             if (floor(i / 2) * 2 == i) continue\n\
             n = n + 1\n\
           }\n\
           return n\n\
         }\n\
         for (let i = 0; i < 120; i = i + 1) { count(60) }\n\
         print(count(60))",
    );
}

#[test]
fn equivalence_string_building_functions() {
    // These bail out of lowering; the pipeline must leave them intact.
    assert_jit_equivalence(
        "def tag(s) { return \"<\" + s + \">\" }\n\
         for (let i = 0; i < 100; i = i + 1) { tag(\"x\") }\n\
         print(tag(\"body\"))",
    );
}

#[test]
fn equivalence_mixed_argument_types() {
    // A numeric-looking function occasionally fed strings: the guard
    // and the shared operator helpers must agree with the tree-walk.
    assert_jit_equivalence(
        "def glue(a, b) { return a + b }\n\
         for (let i = 0; i < 120; i = i + 1) { glue(i, i) }\n\
         print(glue(1, 2))\n\
         print(glue(\"a\", \"b\"))\n\
         print(glue(3, 4))",
    );
}

#[test]
fn equivalence_division_errors_under_the_jit() {
    let src = "def divide(a, b) { return a / b }\n\
               for (let i = 0; i < 120; i = i + 1) { divide(i, 3) }\n\
               try { divide(1, 0) } catch (DivisionByZeroError e) { print(\"zero\") }\n\
               print(divide(9, 3))";
    assert_jit_equivalence(src);
    // And the error kind survives at every tier.
    let (mut engine, _) = run_with(eager_config(), src);
    assert_eq!(engine.take_output(), "zero\n3\n");
}

#[test]
fn equivalence_print_inside_hot_functions() {
    assert_jit_equivalence(
        "def shout(n) { print n }\n\
         for (let i = 0; i < 80; i = i + 1) { shout(i) }",
    );
}

// ---------------------------------------------------------------------------
// Deoptimization
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn shape_change_deoptimizes_native_code() {
    let src = "def add(a, b) { return a + b }\n\
               for (let i = 0; i < 200; i = i + 1) { add(i, 1) }\n\
               print(add(\"x\", \"y\"))\n\
               print(add(2, 3))";
    let (mut engine, _) = run_with(eager_config(), src);
    // Results are correct across the guard failure.
    assert_eq!(engine.take_output(), "xy\n5\n");
    let stats = engine.stats();
    assert!(stats.jit.native_emitted >= 1, "native tier should have been used");
    assert!(stats.jit.deopts >= 1, "the string call should have side-exited");
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn native_division_by_zero_side_exits_to_the_interpreter() {
    let src = "def divide(a, b) { return a / b }\n\
               for (let i = 0; i < 200; i = i + 1) { divide(i, 3) }\n\
               try { divide(1, 0) } catch (e) { print(e.type) }";
    let (mut engine, _) = run_with(eager_config(), src);
    assert_eq!(engine.take_output(), "DivisionByZeroError\n");
}

// ---------------------------------------------------------------------------
// Inline caches feeding the pipeline
// ---------------------------------------------------------------------------

#[test]
fn method_sites_go_monomorphic_then_polymorphic() {
    // Two sites: the `measure(..)` call and the `x.len()` method call.
    let src = "def measure(x) { return x.len() }\nprint(measure(\"abc\"))";
    let (engine, _) = run_with(EngineConfig::default(), src);
    let stats = engine.stats().ic;
    assert_eq!(stats.mono, 2);
    assert_eq!(stats.poly, 0);

    // Three receiver types at the one `x.len()` site make it (and only
    // it) polymorphic.
    let src = "def measure(x) { return x.len() }\n\
               print(measure(\"abc\"))\nprint(measure([1, 2]))\nprint(measure({a: 1}))";
    let (engine, _) = run_with(EngineConfig::default(), src);
    let stats = engine.stats().ic;
    assert_eq!(stats.poly, 1);
    assert_eq!(stats.mega, 0);
}

#[test]
fn monomorphic_sites_accumulate_hits() {
    let src = "def measure(x) { return x.len() }\n\
               let n = 0\n\
               for (let i = 0; i < 50; i = i + 1) { n = measure(\"abc\") }\n\
               print(n)";
    let (mut engine, _) = run_with(
        EngineConfig { jit_enabled: false, ..EngineConfig::default() },
        src,
    );
    assert_eq!(engine.take_output(), "3\n");
    let stats = engine.stats().ic;
    assert!(stats.hits >= 49, "repeat dispatches should hit the cache");
    assert!(!engine.ic.inline_candidates(10).is_empty());
}

#[test]
fn redefinition_invalidates_cached_dispatch() {
    let src = "def f() { return 1 }\n\
               print(f())\n\
               def f() { return 2 }\n\
               print(f())";
    let (mut engine, _) = run_with(EngineConfig::default(), src);
    assert_eq!(engine.take_output(), "1\n2\n");
}

#[test]
fn ic_state_machine_is_observable_per_site() {
    // One textual site observing one receiver type stays monomorphic
    // over arbitrarily many dispatches.
    let src = "def measure(x) { return x.len() }\n\
               for (let i = 0; i < 100; i = i + 1) { measure([1]) }";
    let (engine, _) = run_with(
        EngineConfig { jit_enabled: false, ..EngineConfig::default() },
        src,
    );
    let sites = engine.stats().ic;
    assert!(sites.mono >= 1);
    assert_eq!(sites.mega, 0);
    // State names match the documented machine.
    assert_ne!(IcState::Mono, IcState::Poly);
}

// ---------------------------------------------------------------------------
// Profiler surface
// ---------------------------------------------------------------------------

#[test]
fn profiler_reports_calls_and_timing() {
    let src = "def work(n) { let s = 0; for (let i = 0; i < n; i = i + 1) { s = s + i } return s }\n\
               for (let i = 0; i < 40; i = i + 1) { work(100) }";
    let (engine, _) = run_with(
        EngineConfig { jit_enabled: false, ..EngineConfig::default() },
        src,
    );
    let stats = engine.profiler.stats_for("work").expect("profiled");
    assert_eq!(stats.call_count, 40);
    assert!(stats.total_ns > 0);
    assert!(stats.min_ns <= stats.max_ns);
}

#[test]
fn engine_stats_expose_live_environment_frames() {
    let src = "def make(n) { def get() { return n } return get }\nlet g = make(7)\nprint(g())";
    let (mut engine, _) = run_with(EngineConfig::default(), src);
    assert_eq!(engine.take_output(), "7\n");
    // At least the globals and the captured frame are alive.
    assert!(engine.stats().live_env_frames >= 2);
}
