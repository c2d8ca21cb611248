//! `pdl`: the command-line runner for Prompt Description Language programs.
//!
//! `pdl run <file>` loads a program, evaluates it against an empty (or
//! `--scope`-seeded) scope, writes the resulting document to standard
//! output, and optionally dumps the full trace tree to a file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use pdl_core::providers::ProviderRegistry;
use pdl_core::value::{initial_scope, Scope};
use pdl_core::{eval, load_program_file, EvalState, TraceNode, Value};

#[derive(Parser)]
#[command(name = "pdl", about = "Run Prompt Description Language programs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a program and print its document to standard output.
    Run {
        file: PathBuf,

        /// Write the full evaluation trace to this path.
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Format for --trace output.
        #[arg(long, value_enum, default_value_t = TraceFormat::Yaml)]
        trace_format: TraceFormat,

        /// YAML/JSON file providing an initial scope, merged in before the
        /// root block is evaluated.
        #[arg(long)]
        scope: Option<PathBuf>,

        /// Raise log verbosity; repeat for more detail (-v, -vv, -vvv).
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TraceFormat {
    Yaml,
    Json,
}

impl std::fmt::Display for TraceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceFormat::Yaml => write!(f, "yaml"),
            TraceFormat::Json => write!(f, "json"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Run { file, trace, trace_format, scope, verbose } = cli.command;

    init_logging(verbose);

    let path = file.to_string_lossy().to_string();
    let block = match load_program_file(&path).await {
        Ok(block) => block,
        Err(err) => {
            eprintln!("{path}: {err}");
            return ExitCode::from(2);
        }
    };

    let mut initial = initial_scope();
    if let Some(scope_path) = scope {
        match load_scope_file(&scope_path).await {
            Ok(seeded) => merge_scope(&mut initial, seeded),
            Err(err) => {
                eprintln!("{}: {err}", scope_path.display());
                return ExitCode::from(2);
            }
        }
    }

    let registry = Arc::new(ProviderRegistry::with_default_providers());
    let state = EvalState::new(registry);

    let outcome = eval(&block, initial, Vec::new(), &state).await;

    println!("{}", outcome.result.as_text());
    log_errors(&outcome.trace);

    if let Some(trace_path) = trace {
        if let Err(err) = write_trace(&trace_path, &outcome.trace, trace_format).await {
            eprintln!("{}: {err}", trace_path.display());
            return ExitCode::from(2);
        }
    }

    if outcome.trace.contains_error() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

/// Walks the trace, logging each error at its own location the way the
/// user-visible `<file>:<line> - <message>` format is described (§6).
fn log_errors(node: &TraceNode) {
    for err in &node.errors {
        eprintln!("{err}");
    }
    for child in &node.children {
        log_errors(child);
    }
    for iteration in &node.iterations {
        log_errors(iteration);
    }
}

async fn load_scope_file(path: &PathBuf) -> Result<Value, String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| e.to_string())?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| e.to_string())?;
    let json = serde_json::to_value(yaml).map_err(|e| e.to_string())?;
    Ok(Value::from_json(json))
}

fn merge_scope(scope: &mut Scope, seeded: Value) {
    if let Value::Object(fields) = seeded {
        for (key, value) in fields {
            scope.insert(key, value);
        }
    }
}

async fn write_trace(path: &PathBuf, trace: &TraceNode, format: TraceFormat) -> Result<(), String> {
    let rendered = match format {
        TraceFormat::Yaml => serde_yaml::to_string(trace).map_err(|e| e.to_string())?,
        TraceFormat::Json => serde_json::to_string_pretty(trace).map_err(|e| e.to_string())?,
    };
    tokio::fs::write(path, rendered).await.map_err(|e| e.to_string())
}
