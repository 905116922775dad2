/// The module-import boundary: the core hands the literal import spec
/// to the registered resolver and binds whatever exports come back; it
/// never interprets paths itself.
use bolt::engine::{Engine, EngineConfig};
use bolt::exceptions::ErrorKind;
use bolt::modules::{ModuleResolver, NativeExport, ResolveError, TableResolver, ModuleHandle};
use bolt::{BoltError, Value};

fn capture_engine() -> Engine {
    Engine::new(EngineConfig { capture_output: true, ..EngineConfig::default() })
}

fn math_module() -> Vec<NativeExport> {
    vec![
        NativeExport::new("double", Some(1), |_, args, span| match &args[0] {
            Value::Num(n) => Ok(Value::Num(n * 2.0)),
            other => Err(bolt::Thrown::new(
                ErrorKind::Type,
                format!("double expects a number, got {}", other.type_name()),
                span,
            )),
        }),
        NativeExport::new("answer", Some(0), |_, _, _| Ok(Value::Num(42.0))),
    ]
}

fn engine_with_modules() -> Engine {
    let mut engine = capture_engine();
    let mut resolver = TableResolver::new();
    resolver.register("mathx", math_module());
    engine.set_resolver(Box::new(resolver));
    engine
}

#[test]
fn import_binds_the_module_as_a_dict_of_callables() {
    let mut engine = engine_with_modules();
    engine
        .run_source("<t>", "import \"mathx\"\nprint(mathx.double(21))\nprint(mathx.answer())")
        .unwrap();
    assert_eq!(engine.take_output(), "42\n42\n");
}

#[test]
fn import_with_alias() {
    let mut engine = engine_with_modules();
    engine
        .run_source("<t>", "import \"mathx\" as m\nprint(m.double(5))")
        .unwrap();
    assert_eq!(engine.take_output(), "10\n");
}

#[test]
fn module_name_strips_path_and_extension() {
    let mut engine = capture_engine();
    let mut resolver = TableResolver::new();
    resolver.register("lib/util.bolt", math_module());
    engine.set_resolver(Box::new(resolver));
    engine
        .run_source("<t>", "import \"lib/util.bolt\"\nprint(util.answer())")
        .unwrap();
    assert_eq!(engine.take_output(), "42\n");
}

#[test]
fn from_import_selects_and_renames_exports() {
    let mut engine = engine_with_modules();
    engine
        .run_source("<t>", "from \"mathx\" import double as twice, answer\nprint(twice(8), answer())")
        .unwrap();
    assert_eq!(engine.take_output(), "16 42\n");
}

#[test]
fn missing_module_raises_import_error() {
    let mut engine = engine_with_modules();
    let err = engine.run_source("<t>", "import \"nosuch\"").unwrap_err();
    match err {
        BoltError::Runtime(thrown) => assert_eq!(thrown.kind, ErrorKind::Import),
        other => panic!("expected ImportError, got {:?}", other),
    }
}

#[test]
fn missing_export_raises_import_error() {
    let mut engine = engine_with_modules();
    let err = engine
        .run_source("<t>", "from \"mathx\" import missing")
        .unwrap_err();
    match err {
        BoltError::Runtime(thrown) => assert_eq!(thrown.kind, ErrorKind::Import),
        other => panic!("expected ImportError, got {:?}", other),
    }
}

#[test]
fn import_errors_are_catchable() {
    let mut engine = engine_with_modules();
    engine
        .run_source(
            "<t>",
            "try { import \"nosuch\" } catch (ImportError e) { print(\"nope\") }",
        )
        .unwrap();
    assert_eq!(engine.take_output(), "nope\n");
}

#[test]
fn custom_resolvers_see_the_literal_spec() {
    struct Recording {
        seen: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }
    impl ModuleResolver for Recording {
        fn resolve(&mut self, spec: &str) -> Result<ModuleHandle, ResolveError> {
            self.seen.lock().unwrap().push(spec.to_string());
            Err(ResolveError::new("nothing here"))
        }
    }

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut engine = capture_engine();
    engine.set_resolver(Box::new(Recording { seen: seen.clone() }));
    let _ = engine.run_source("<t>", "import \"exactly/this spec.xyz\"");
    assert_eq!(*seen.lock().unwrap(), vec!["exactly/this spec.xyz".to_string()]);
}
