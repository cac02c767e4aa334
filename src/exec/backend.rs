// src/exec/backend.rs

//! Pluggable process-spawning abstraction.
//!
//! The multiplexer talks to a `SpawnerBackend` instead of spawning OS
//! processes directly. This makes it easy to swap in a fake spawner in
//! tests while keeping the production implementation in [`runner`].
//!
//! - `RealSpawnerBackend` is the default implementation; it spawns a
//!   [`ProcessRunner`] per accepted invocation.
//! - Tests can provide their own `SpawnerBackend` that records spawns and
//!   lets the test script output/stream-end events by hand.
//!
//! [`runner`]: super::runner

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::errors::Result;
use crate::mux::MuxEvent;
use crate::task::{Invocation, TaskKey};

use super::runner::ProcessRunner;

/// Handle to one live (or just-exited) child process held by the registry.
pub trait RunnerHandle: Send {
    fn pid(&self) -> u32;

    /// Idempotent graceful terminate. The first call signals the child and
    /// detaches the reader loops so no further output or stream-end events
    /// are published; subsequent calls are no-ops.
    fn request_termination(&mut self);

    /// Non-blocking exit-status poll; `None` while still running.
    fn try_exit_code(&mut self) -> Option<i32>;

    /// Wait for the process to exit, escalating to a hard kill after
    /// `grace`. Resolves to the exit code, `-1` when none was observed.
    /// Only called after termination was explicitly requested.
    fn wait_exit(&mut self, grace: Duration) -> Pin<Box<dyn Future<Output = i32> + Send + '_>>;

    /// Wait for the process to exit without ever signalling it. Used to
    /// reap a child that closed its streams but kept running.
    fn wait_reap(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Trait abstracting how accepted invocations become running processes.
pub trait SpawnerBackend: Send {
    /// Spawn a process for `key`. Reader loops (if any) publish
    /// `MuxEvent::Output` / `MuxEvent::StreamClosed` on `events`.
    fn spawn(
        &mut self,
        key: &TaskKey,
        invocation: &Invocation,
        events: mpsc::Sender<MuxEvent>,
    ) -> Result<Box<dyn RunnerHandle>>;
}

/// Production spawner: one [`ProcessRunner`] per invocation.
pub struct RealSpawnerBackend {
    read_chunk_bytes: usize,
}

impl RealSpawnerBackend {
    pub fn new(read_chunk_bytes: usize) -> Self {
        Self { read_chunk_bytes }
    }
}

impl SpawnerBackend for RealSpawnerBackend {
    fn spawn(
        &mut self,
        key: &TaskKey,
        invocation: &Invocation,
        events: mpsc::Sender<MuxEvent>,
    ) -> Result<Box<dyn RunnerHandle>> {
        let runner = ProcessRunner::spawn(key.clone(), invocation, events, self.read_chunk_bytes)?;
        Ok(Box::new(runner))
    }
}
