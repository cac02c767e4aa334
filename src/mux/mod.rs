// src/mux/mod.rs

//! The multiplexer: registry of live tasks plus the single event loop that
//! owns all shared state.
//!
//! Reader loops, front-ends, and confirmation prompts never touch the
//! registry directly; everything funnels through one mpsc channel of
//! [`MuxEvent`]s consumed by [`Multiplexer::run`], which is the single
//! serialization point. Chunks for a task are delivered in pipe order and
//! its completion notification strictly follows all of its chunks.
//!
//! - [`registry`] holds the per-key state maps and incremental decoding.
//! - [`runtime`] implements the event loop and spawn/stop/finalize paths.
//! - [`reconcile`] implements the periodic orphan sweep and the one-shot
//!   startup zombie reclamation.

use tokio::sync::{mpsc, oneshot};

use crate::errors::{Result, TaskmuxError};
use crate::task::{Invocation, SurfaceId, TaskKey};

pub mod reconcile;
pub mod registry;
pub mod runtime;

pub use registry::Registry;
pub use runtime::Multiplexer;

/// Everything flowing into the multiplexer loop: front-end commands,
/// reader-loop output, and resolved confirmation prompts.
#[derive(Debug)]
pub enum MuxEvent {
    Command(MuxCommand),
    /// A non-empty chunk read from one of the task's pipes.
    Output { key: TaskKey, bytes: Vec<u8> },
    /// One of the task's pipes reached end-of-stream.
    StreamClosed { key: TaskKey },
    /// The user answered a kill-confirmation prompt.
    StopResolved { key: TaskKey, confirmed: bool },
    /// Force an orphan sweep outside the timer cadence (used by tests).
    ReconcileNow,
}

/// Front-end operations on the multiplexer.
#[derive(Debug)]
pub enum MuxCommand {
    Spawn {
        key: TaskKey,
        invocation: Invocation,
    },
    /// Re-run a task from its remembered invocation.
    Rerun { key: TaskKey },
    Stop {
        key: TaskKey,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Step through the stored stack trace, opening the next frame.
    BrowseStackTrace { key: TaskKey },
    /// A source or destination surface was closed by the user.
    ViewClosed { surface: SurfaceId },
    IsRunning {
        key: TaskKey,
        reply: oneshot::Sender<bool>,
    },
    HasStackTrace {
        key: TaskKey,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable front-end handle over the multiplexer's event channel.
#[derive(Clone)]
pub struct MuxHandle {
    tx: mpsc::Sender<MuxEvent>,
}

impl MuxHandle {
    pub(crate) fn new(tx: mpsc::Sender<MuxEvent>) -> Self {
        Self { tx }
    }

    /// Raw event sender, for wiring fakes in tests.
    pub fn event_sender(&self) -> mpsc::Sender<MuxEvent> {
        self.tx.clone()
    }

    pub async fn spawn(&self, key: TaskKey, invocation: Invocation) -> Result<()> {
        self.send(MuxCommand::Spawn { key, invocation }).await
    }

    pub async fn rerun(&self, key: TaskKey) -> Result<()> {
        self.send(MuxCommand::Rerun { key }).await
    }

    /// Request termination of the task's live process. Resolves once the
    /// stop was carried out (`true`) or declined / nothing was running
    /// (`false`).
    pub async fn stop(&self, key: TaskKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(MuxCommand::Stop {
                key,
                reply: Some(reply),
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn browse_stack_trace(&self, key: TaskKey) -> Result<()> {
        self.send(MuxCommand::BrowseStackTrace { key }).await
    }

    pub async fn view_closed(&self, surface: SurfaceId) -> Result<()> {
        self.send(MuxCommand::ViewClosed { surface }).await
    }

    pub async fn is_running(&self, key: TaskKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(MuxCommand::IsRunning { key, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn has_stack_trace(&self, key: TaskKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(MuxCommand::HasStackTrace { key, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(MuxCommand::Shutdown).await
    }

    async fn send(&self, command: MuxCommand) -> Result<()> {
        self.tx
            .send(MuxEvent::Command(command))
            .await
            .map_err(|_| TaskmuxError::Other(anyhow::anyhow!("multiplexer is not running")))
    }
}
