#![forbid(unsafe_code)]

//! Service driver: loads an IR document, installs the path/timeout
//! governor, runs the engine, and renders the success/failed/stopped report
//! plus the constraint JSON consumed by the external solver.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use miette::Diagnostic;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use thiserror::Error;

use argus_interpret::{Governor, LogLevel, RunReport};
use argus_ir::Stmt;

#[derive(Parser)]
#[command(name = "argus", version, about = "Symbolic shape checker for a PyTorch-derived IR")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose engine logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze an IR document (JSON statement tree).
    Run {
        /// Path to the IR JSON file.
        file: PathBuf,

        /// Fail all paths once the live count exceeds this limit.
        #[arg(long)]
        max_paths: Option<usize>,

        /// Wall-clock budget for the whole analysis.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Write the full constraint report as JSON.
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
}

#[derive(Debug, Error, Diagnostic)]
enum DriverError {
    #[error("cannot read {path}: {source}")]
    #[diagnostic(code(argus::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed IR document: {0}")]
    #[diagnostic(code(argus::parse))]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bootstrap(#[from] argus_torch::BootstrapError),
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
    match cli.command {
        Command::Run {
            file,
            max_paths,
            timeout_ms,
            json_out,
        } => run(file, max_paths, timeout_ms, json_out)?,
    }
    Ok(())
}

fn run(
    file: PathBuf,
    max_paths: Option<usize>,
    timeout_ms: Option<u64>,
    json_out: Option<PathBuf>,
) -> Result<(), DriverError> {
    let text = fs::read_to_string(&file).map_err(|source| DriverError::Io {
        path: file.display().to_string(),
        source,
    })?;
    let program: Stmt = serde_json::from_str(&text)?;

    let governor = Governor::new();
    if let Some(max) = max_paths {
        governor.limit_paths(max);
    }
    if let Some(ms) = timeout_ms {
        governor.limit_millis(ms);
    }

    let result = argus_torch::analyze(&program, governor)?;
    info!(
        "analysis finished: {} success, {} failed, {} stopped",
        result.live_count(),
        result.failed().len(),
        result.stopped().len()
    );

    println!(
        "paths: {} success, {} failed, {} stopped",
        result.live_count(),
        result.failed().len(),
        result.stopped().len()
    );
    for (label, list) in [("failed", result.failed()), ("stopped", result.stopped())] {
        for ctx in list {
            let reason = ctx
                .failed
                .as_ref()
                .map(|e| e.reason.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("[{label}] {reason}");
            for frame in ctx.call_stack.iter() {
                println!("    in {}", frame.name);
            }
            for entry in ctx.logs.iter() {
                if entry.level >= LogLevel::Warning {
                    println!("    {}: {}", entry.level.label(), entry.message);
                }
            }
        }
    }

    if let Some(out) = json_out {
        let report = RunReport::from_set(&result);
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(&out, json).map_err(|source| DriverError::Io {
            path: out.display().to_string(),
            source,
        })?;
        println!("constraint report written to {}", out.display());
    }
    Ok(())
}
