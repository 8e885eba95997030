//! Command-line interface for seaforge.
//!
//! Compiles a script file into a standalone executable built from a runtime
//! binary.

use clap::{Parser, ValueEnum};
use seaforge::{compile, CompileOptions, LogLevel};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "seaforge")]
#[command(about = "Compile a script into a standalone executable")]
struct Cli {
    /// Script to embed
    input: PathBuf,

    /// Output executable
    #[arg(short, long)]
    output: PathBuf,

    /// Log verbosity
    #[arg(short, long, value_enum, default_value_t = Level::Warn)]
    log_level: Level,

    /// Suppress the runtime's experimental-feature warning
    #[arg(long)]
    disable_warning: bool,

    /// Build the blob with a startup snapshot
    #[arg(long)]
    snapshot: bool,

    /// Include a code cache in the blob
    #[arg(long)]
    code_cache: bool,

    /// Host executable to copy instead of the runtime
    #[arg(long)]
    host: Option<PathBuf>,

    /// Keep the host's code signature (re-sign the output yourself)
    #[arg(long)]
    sign: bool,

    /// Runtime used to build the blob
    #[arg(long, default_value = "node")]
    runtime: PathBuf,

    /// Seconds to wait for the blob build step
    #[arg(long, default_value = "120")]
    timeout: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Debug,
    Warn,
    Silent,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Debug => LogLevel::Debug,
            Level::Warn => LogLevel::Warn,
            Level::Silent => LogLevel::Silent,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The per-call log level does the filtering; RUST_LOG can still narrow it.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seaforge=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let source = std::fs::read_to_string(&cli.input)?;

    let mut options = CompileOptions::new()
        .log_level(cli.log_level.into())
        .disable_warning(cli.disable_warning)
        .use_snapshot(cli.snapshot)
        .use_code_cache(cli.code_cache)
        .sign_output(cli.sign)
        .runtime(&cli.runtime)
        .timeout(Duration::from_secs(cli.timeout));

    if let Some(host) = &cli.host {
        options = options.host(host);
    }

    let artifact = compile(&source, &cli.output, options)?;

    println!("Compiled: {}", artifact.output_path.display());
    Ok(())
}
