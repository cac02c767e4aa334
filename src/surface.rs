// src/surface.rs

//! Boundary traits between the core and the editor/UI layer.
//!
//! The core never renders anything itself: it talks to a [`Presenter`] for
//! all user-visible output and to a [`Workspace`] for surface lifecycle,
//! per-surface persisted state, prompts, and navigation. Both traits are
//! implemented by the embedding front-end; `crates/test-utils` provides
//! recording fakes for tests, and the CLI binary ships a console pair.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::{Invocation, SurfaceId, TaskKey};
use crate::trace::Generation;

/// Final facts about one finished run, handed to the presenter.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub exit_code: i32,
    pub elapsed: Duration,
    pub working_dir: std::path::PathBuf,
    /// Full decoded output captured over the run.
    pub output: String,
}

/// Receives lifecycle notifications and owns all rendering.
///
/// Calls arrive on the multiplexer's event loop, already serialized;
/// implementations should return quickly and must not call back into the
/// multiplexer synchronously.
pub trait Presenter: Send {
    /// A process was spawned for `key` into `surface`.
    fn begin_run(&mut self, surface: SurfaceId, pid: u32, invocation: &Invocation);

    /// Incremental decoded output for the destination surface.
    fn append_output(&mut self, surface: SurfaceId, text: &str);

    /// The run finished (exited or was killed) and all output was
    /// delivered beforehand.
    fn completed_run(&mut self, surface: SurfaceId, key: &TaskKey, run: &CompletedRun);

    /// A failing run produced a recognizable stack trace; `trimmed` starts
    /// at the first traceback line.
    fn display_failure_panel(&mut self, trimmed: &str, invocation: &Invocation);

    fn flash_error_indicator(&mut self, surface: SurfaceId);

    fn clear_error_indicator(&mut self, surface: SurfaceId);

    /// A process recorded as running by a previous session was killed
    /// during startup reclamation.
    fn zombie_terminated_notice(&mut self, surface: SurfaceId, invocation: &Invocation);

    /// Collapse stale output from a previous session for readability.
    fn fold_old(&mut self, surface: SurfaceId);
}

/// Per-surface state round-tripped through the boundary. Opaque to the
/// registry beyond the fields it rewrites (pid marker, task migration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSurface {
    pub invocation: Invocation,
    pub task: TaskKey,
    /// Present while (the boundary believes) the process is running; a
    /// marker surviving into a new session denotes a zombie.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub trace_generation: Option<Generation>,
    /// How far the user has navigated into the stored stack trace.
    #[serde(default)]
    pub nav_depth: u32,
}

/// Queries and effects on the surrounding editor/UI workspace.
pub trait Workspace: Send {
    /// Surfaces currently open, as the UI sees them.
    fn list_open_surfaces(&self) -> Vec<SurfaceId>;

    /// Whether a surface is still loading its persisted state.
    fn surface_is_loading(&self, surface: SurfaceId) -> bool;

    /// Find the destination surface for `key`, creating one if needed.
    /// The registry relies on this never failing once a spawn is accepted.
    fn resolve_output_surface(&mut self, key: &TaskKey) -> SurfaceId;

    /// Current view id of the surface showing `path`, if any. Used to
    /// migrate persisted associations after a file is reopened under a
    /// new id.
    fn current_view_for_path(&self, path: &str) -> Option<SurfaceId>;

    fn persisted(&self, surface: SurfaceId) -> Option<PersistedSurface>;

    fn persist(&mut self, surface: SurfaceId, state: &PersistedSurface);

    /// Drop the running-marker pid for a surface, keeping the rest.
    fn clear_running_marker(&mut self, surface: SurfaceId);

    /// Ask the user to confirm killing the named process. Non-blocking:
    /// the returned future is awaited off the multiplexer loop and the
    /// answer re-enters it as an event.
    fn confirm_kill(&mut self, label: &str) -> Pin<Box<dyn Future<Output = bool> + Send>>;

    /// Navigate the user to `path:line` (stack-trace browsing).
    fn open_file_at_line(&mut self, path: &Path, line: u32);
}
