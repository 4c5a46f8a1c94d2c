//! p4t CLI, driving adapter for the classifier compiler.
//!
//! Subcommands:
//! - `compile <program> <entries> [--config <file>] <step> [args...] [-- <step> [args...]]...`
//!   runs optimization steps and prints the resulting runtime commands as JSON
//! - `check <program> [entries]` validates a program and its rule sets
//! - `steps` lists the registered optimization steps
//!
//! `-v` / `--verbose` anywhere on the command line enables debug logging;
//! otherwise `RUST_LOG` decides and the default is `warn`.

use std::path::Path;
use std::process;

use log::{debug, info};
use p4t::{
    register_core_steps, CompilerConfig, EntriesConfig, ProgramConfig, ProgramGraph, StepRegistry,
    StepRegistryBuilder,
};
use serde::de::DeserializeOwned;

fn main() {
    let (verbose, args) = split_verbose(std::env::args().skip(1).collect());
    init_logging(verbose);

    if args.is_empty() {
        print_usage();
        process::exit(1);
    }

    let result = match args[0].as_str() {
        "compile" => cmd_compile(&args[1..]),
        "check" => cmd_check(&args[1..]),
        "steps" => cmd_steps(),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("error: unknown command \"{other}\"");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).init();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

fn cmd_compile(args: &[String]) -> Result<(), String> {
    let invocation = parse_compile(args)?;

    let config: CompilerConfig = match &invocation.config {
        Some(path) => load_config(path)?,
        None => CompilerConfig::default(),
    };
    let program: ProgramConfig = load_config(&invocation.program)?;
    let entries: EntriesConfig = load_config(&invocation.entries)?;

    let mut graph = ProgramGraph::from_config(&program, Some(&entries), config)
        .map_err(|e| format!("program invalid: {e}"))?;

    let registry = build_registry();
    for (step, step_args) in &invocation.steps {
        info!("running step {step} {step_args:?}");
        graph = registry
            .run(step, graph, step_args)
            .map_err(|e| format!("step {step} failed: {e}"))?;
    }

    let commands = graph
        .materialize()
        .map_err(|e| format!("materialization failed: {e}"))?;
    debug!("{} runtime commands", commands.len());

    let json = serde_json::to_string_pretty(&commands).map_err(|e| format!("JSON error: {e}"))?;
    println!("{json}");
    Ok(())
}

fn cmd_check(args: &[String]) -> Result<(), String> {
    let Some(program_path) = args.first() else {
        return Err("check requires a program file path".into());
    };
    if args.len() > 2 {
        return Err(format!("unexpected argument \"{}\"", args[2]));
    }

    let program: ProgramConfig = load_config(program_path)?;
    let entries: Option<EntriesConfig> = args.get(1).map(|p| load_config(p)).transpose()?;

    let graph = ProgramGraph::from_config(&program, entries.as_ref(), CompilerConfig::default())
        .map_err(|e| format!("program invalid: {e}"))?;

    println!(
        "Program valid: {} tables, {} rule sets",
        graph.program.tables().count(),
        graph.vmrs.len()
    );
    Ok(())
}

#[allow(clippy::unnecessary_wraps)] // Uniform return type for all commands
fn cmd_steps() -> Result<(), String> {
    println!("Registered steps:");
    for name in build_registry().names() {
        println!("  {name}");
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry assembly (composition root)
// ═══════════════════════════════════════════════════════════════════════════════

fn build_registry() -> StepRegistry {
    register_core_steps(StepRegistryBuilder::new()).build()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Config loading
// ═══════════════════════════════════════════════════════════════════════════════

fn load_config<T: DeserializeOwned>(path: &str) -> Result<T, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read \"{path}\": {e}"))?;
    parse_config(path, &content)
}

fn parse_config<T: DeserializeOwned>(path: &str, content: &str) -> Result<T, String> {
    let is_json = Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(content).map_err(|e| format!("JSON parse error in \"{path}\": {e}"))
    } else {
        // Default to YAML (handles .yaml and .yml)
        serde_yaml::from_str(content).map_err(|e| format!("YAML parse error in \"{path}\": {e}"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Argument parsing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq, Eq)]
struct CompileInvocation {
    program: String,
    entries: String,
    config: Option<String>,
    steps: Vec<(String, Vec<String>)>,
}

fn split_verbose(args: Vec<String>) -> (bool, Vec<String>) {
    let (flags, rest): (Vec<String>, Vec<String>) = args
        .into_iter()
        .partition(|a| a == "-v" || a == "--verbose");
    (!flags.is_empty(), rest)
}

fn parse_compile(args: &[String]) -> Result<CompileInvocation, String> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut i = 0;

    while i < args.len() && positional.len() < 2 {
        if args[i] == "--config" {
            i += 1;
            let path = args.get(i).ok_or("--config requires a file path")?;
            config = Some(path.clone());
        } else {
            positional.push(args[i].clone());
        }
        i += 1;
    }
    if positional.len() < 2 {
        return Err("compile requires a program and an entries file path".into());
    }
    if args.get(i).map(String::as_str) == Some("--config") {
        config = Some(args.get(i + 1).ok_or("--config requires a file path")?.clone());
        i += 2;
    }

    let mut steps = Vec::new();
    for group in args[i..].split(|a| a == "--") {
        let Some((name, step_args)) = group.split_first() else {
            return Err("empty step between \"--\" separators".into());
        };
        steps.push((name.clone(), step_args.to_vec()));
    }
    let entries = positional.pop().unwrap_or_default();
    let program = positional.pop().unwrap_or_default();
    Ok(CompileInvocation {
        program,
        entries,
        config,
        steps,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: p4t [-v] <command> [options]

Commands:
  compile <program> <entries> [--config <file>] <step> [args...] [-- <step> [args...]]...
                                     Run steps and print runtime commands as JSON
  check <program> [entries]          Validate a program and its rule sets
  steps                              List registered optimization steps
  help                               Show this help

Files ending in .json are read as JSON, anything else as YAML."
    );
}
