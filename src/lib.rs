// src/lib.rs

//! `taskmux` is a process-execution multiplexer.
//!
//! Given a command invocation, it launches an external process, streams
//! its output incrementally to a registered destination surface, tracks
//! completion, and on non-zero exit parses the captured output for a
//! stack-trace pattern, extracting file/line frames for navigation. Many
//! invocations can run at once, each addressed by a stable [`TaskKey`]
//! with at-most-one-live-process-per-key, explicit cancellation, and
//! orphan/zombie reclamation across restarts.
//!
//! [`TaskKey`]: task::TaskKey

pub mod cli;
pub mod config;
pub mod console;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod mux;
pub mod surface;
pub mod task;
pub mod trace;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::Settings;
use crate::console::{ConsolePresenter, ConsoleWorkspace};
use crate::exec::RealSpawnerBackend;
use crate::mux::Multiplexer;
use crate::task::{CommandLine, Invocation, TaskKey};

/// High-level entry point used by `main.rs`: run one invocation through
/// the full multiplexer and resolve to its exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let mut settings = config::load_and_validate(&args.config)?;
    // The console has no prompt; Ctrl-C stands in for confirmation.
    settings.confirm_terminate = false;

    let invocation = invocation_from_args(&args, &settings)?;
    let key = TaskKey::ad_hoc(invocation.command.display());

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let presenter = ConsolePresenter::new(done_tx);
    let workspace = ConsoleWorkspace::new();
    let backend = RealSpawnerBackend::new(settings.read_chunk_bytes);

    let (mux, handle) = Multiplexer::new(settings, presenter, workspace, backend);
    let mux_task = tokio::spawn(mux.run());

    // Ctrl-C -> stop the task (which finalizes and reports), not a hard
    // process abort.
    {
        let handle = handle.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received; stopping task");
            handle.stop(key).await;
        });
    }

    handle.spawn(key.clone(), invocation).await?;

    let exit_code = done_rx.recv().await.unwrap_or(1);
    debug!(exit_code, "run finished");

    // Point at the topmost extracted frame, if the failure produced one.
    if exit_code != 0 && handle.has_stack_trace(key.clone()).await {
        handle.browse_stack_trace(key).await?;
    }

    handle.shutdown().await.ok();
    mux_task.await.context("joining multiplexer task")??;

    Ok(exit_code)
}

fn invocation_from_args(args: &CliArgs, settings: &Settings) -> Result<Invocation> {
    let command = if args.shell {
        CommandLine::Shell(args.command.join(" "))
    } else {
        CommandLine::Args(args.command.clone())
    };

    let working_dir = match &args.cwd {
        Some(dir) => dir.into(),
        None => std::env::current_dir().context("determining working directory")?,
    };

    let mut env = BTreeMap::new();
    for pair in &args.env {
        let (k, v) = pair
            .split_once('=')
            .with_context(|| format!("invalid --env pair (expected KEY=VALUE): {pair}"))?;
        env.insert(k.to_string(), v.to_string());
    }

    let file_regex = match &args.file_regex {
        Some(p) => p.clone(),
        // Same convenience the original editor plugin had: Python-looking
        // commands get traceback extraction for free.
        None if looks_like_python(&args.command) => config::PYTHON_FILE_REGEX.to_string(),
        None => String::new(),
    };

    let mut invocation = Invocation::new(command, working_dir);
    invocation.env = env;
    invocation.file_regex = file_regex;
    invocation.encoding = args
        .encoding
        .clone()
        .unwrap_or_else(|| settings.default_encoding.clone());
    Ok(invocation)
}

fn looks_like_python(command: &[String]) -> bool {
    command
        .iter()
        .any(|c| c.contains("python") || c.ends_with(".py"))
}
