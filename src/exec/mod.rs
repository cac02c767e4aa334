// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running task invocations using
//! `tokio::process::Command` and feeding output back to the multiplexer as
//! [`crate::mux::MuxEvent`]s.
//!
//! - [`runner`] wraps one child process: spawn, chunked reader loops,
//!   idempotent termination, exit-code observation.
//! - [`backend`] provides the `SpawnerBackend` trait and the concrete
//!   `RealSpawnerBackend` the multiplexer uses in production; tests can
//!   replace it with a fake that spawns no real processes.

pub mod backend;
pub mod runner;

pub use backend::{RealSpawnerBackend, RunnerHandle, SpawnerBackend};
pub use runner::ProcessRunner;
