// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for the `taskmux` demo binary, which runs one
/// invocation through the full multiplexer.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskmux",
    version,
    about = "Run a command, stream its output, and extract stack traces on failure.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the settings file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Taskmux.toml")]
    pub config: String,

    /// Hand the command to the platform shell instead of exec-ing it.
    #[arg(long)]
    pub shell: bool,

    /// Working directory for the child (default: current directory).
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Environment override, repeatable (`--env KEY=VALUE`). Values are
    /// `$VAR`-expanded.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Output encoding name (default from settings, normally utf-8).
    #[arg(long, value_name = "NAME")]
    pub encoding: Option<String>,

    /// Two-capture file/line pattern for stack-trace extraction. When
    /// omitted, Python-looking commands get the Python traceback pattern.
    #[arg(long, value_name = "PATTERN")]
    pub file_regex: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKMUX_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// The command to run (and its arguments).
    #[arg(required = true, trailing_var_arg = true, value_name = "CMD")]
    pub command: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
