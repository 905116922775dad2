/// Bolt CLI.
/// `bolt [path]`: with a path, execute the script; without one, start
/// the REPL. Exit codes: 0 success, 64 bad invocation, 65 parse or
/// check error, 70 uncaught runtime error, 74 source I/O error.

use bolt::engine::{BoltError, Engine, EngineConfig, EngineStats};
use clap::Parser as ClapParser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

// Deeply recursive scripts need more than the default main stack.
const STACK_SIZE: usize = 64 * 1024 * 1024;

const EXIT_USAGE: u8 = 64;
const EXIT_DATA: u8 = 65;
const EXIT_SOFTWARE: u8 = 70;
const EXIT_IO: u8 = 74;

#[derive(ClapParser)]
#[command(
    name = "bolt",
    version,
    about = "The Bolt language",
    long_about = "bolt - run Bolt scripts (.bolt) or start an interactive session."
)]
struct Cli {
    /// Script to execute; omit to start the REPL.
    path: Option<PathBuf>,

    /// Print inline-cache, profiler and JIT statistics after the run.
    #[arg(long)]
    stats: bool,

    /// Run everything on the tree-walk interpreter.
    #[arg(long)]
    no_jit: bool,

    /// Keep the JIT but never emit native code.
    #[arg(long)]
    no_native: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let result = std::thread::Builder::new()
        .name("bolt-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli))))
        .expect("failed to spawn bolt worker thread")
        .join();

    match result {
        Ok(Ok(code)) => ExitCode::from(code),
        Ok(Err(payload)) | Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unexpected panic in the bolt runtime".to_string()
            };
            eprintln!("{:?}", miette::miette!("internal error: {}", message));
            ExitCode::from(EXIT_SOFTWARE)
        }
    }
}

fn run(cli: Cli) -> u8 {
    let config = EngineConfig {
        jit_enabled: !cli.no_jit,
        native_enabled: !cli.no_jit && !cli.no_native,
        ..EngineConfig::default()
    };

    let Some(path) = cli.path else {
        return bolt::repl::run(config) as u8;
    };

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{:?}", miette::miette!("cannot read '{}': {}", path.display(), err));
            return EXIT_IO;
        }
    };
    let source_name = path.display().to_string();

    let mut engine = Engine::new(config);
    let outcome = engine.run_source(&source_name, &source);

    for warning in engine.take_warnings() {
        eprintln!("{}", warning.to_string().yellow());
    }

    let code = match outcome {
        Ok(_) => 0,
        Err(BoltError::Parse(errors)) => {
            for e in errors {
                eprintln!("{}", e.render(&source_name).red());
            }
            EXIT_DATA
        }
        Err(BoltError::Check(diags)) => {
            for d in diags {
                eprintln!("{}", d.to_string().red());
            }
            EXIT_DATA
        }
        Err(BoltError::Runtime(thrown)) => {
            eprintln!("{}", thrown.render(&source_name).red());
            EXIT_SOFTWARE
        }
    };

    if cli.stats {
        print_stats(&engine.stats());
    }
    code
}

fn print_stats(stats: &EngineStats) {
    eprintln!();
    eprintln!("{}", "=== engine statistics ===".bold());
    eprintln!(
        "inline caches: {} sites ({} mono, {} poly, {} mega), {} hits / {} misses",
        stats.ic.sites, stats.ic.mono, stats.ic.poly, stats.ic.mega, stats.ic.hits,
        stats.ic.misses
    );
    eprintln!(
        "jit: {} baseline, {} optimized, {} native, {} lowering bails, {} deopts",
        stats.jit.compiled_baseline,
        stats.jit.compiled_optimized,
        stats.jit.native_emitted,
        stats.jit.lowering_bailed,
        stats.jit.deopts
    );
    if !stats.tiers.is_empty() {
        eprintln!("tiers:");
        for (name, tier) in &stats.tiers {
            eprintln!("  {:<24} {:?}", name, tier);
        }
    }
    if !stats.hot.is_empty() {
        eprintln!("{:<24} {:>10} {:>12} {:>10} {:>10}", "function", "calls", "total(us)", "min(us)", "max(us)");
        for (name, f) in stats.hot.iter().take(10) {
            eprintln!(
                "{:<24} {:>10} {:>12.1} {:>10.1} {:>10.1}",
                name,
                f.call_count,
                f.total_ns as f64 / 1000.0,
                if f.min_ns == u64::MAX { 0.0 } else { f.min_ns as f64 / 1000.0 },
                f.max_ns as f64 / 1000.0
            );
        }
    }
    eprintln!("live environment frames: {}", stats.live_env_frames);
}
