// src/console.rs

//! Console implementations of the boundary traits for the CLI binary.
//!
//! One destination surface, output streamed to stdout, headers and
//! notices to stderr. The multiplexer core never knows the difference
//! between this and a full editor front-end.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::surface::{CompletedRun, PersistedSurface, Presenter, Workspace};
use crate::task::{Invocation, SurfaceId, TaskKey};

/// The single destination surface the CLI renders into.
pub const CONSOLE_SURFACE: SurfaceId = SurfaceId(1);

pub struct ConsolePresenter {
    /// Signals the exit code of the finished run back to `run()`.
    done_tx: mpsc::UnboundedSender<i32>,
    /// Whether any run actually began on this console.
    started: bool,
}

impl ConsolePresenter {
    pub fn new(done_tx: mpsc::UnboundedSender<i32>) -> Self {
        Self {
            done_tx,
            started: false,
        }
    }
}

impl Presenter for ConsolePresenter {
    fn begin_run(&mut self, _surface: SurfaceId, pid: u32, invocation: &Invocation) {
        self.started = true;
        eprintln!(" cmd: {}", invocation.command.display());
        eprintln!(" dir: {} [{pid}]", invocation.working_dir.display());
    }

    fn append_output(&mut self, _surface: SurfaceId, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn completed_run(&mut self, _surface: SurfaceId, _key: &TaskKey, run: &CompletedRun) {
        eprintln!(
            "\nexit {} after {:.1}s",
            run.exit_code,
            run.elapsed.as_secs_f64()
        );
        let _ = self.done_tx.send(run.exit_code);
    }

    fn display_failure_panel(&mut self, trimmed: &str, _invocation: &Invocation) {
        eprintln!("--- failure ---");
        eprintln!("{trimmed}");
        if !self.started {
            // A panel before any run began means the spawn itself failed;
            // no completion will ever arrive.
            let _ = self.done_tx.send(1);
        }
    }

    fn flash_error_indicator(&mut self, _surface: SurfaceId) {}

    fn clear_error_indicator(&mut self, _surface: SurfaceId) {}

    fn zombie_terminated_notice(&mut self, _surface: SurfaceId, invocation: &Invocation) {
        eprintln!(
            "terminated by restart: {}",
            invocation.command.display()
        );
    }

    fn fold_old(&mut self, _surface: SurfaceId) {}
}

/// Minimal workspace: one always-open surface, state held in memory.
#[derive(Default)]
pub struct ConsoleWorkspace {
    persisted: HashMap<SurfaceId, PersistedSurface>,
}

impl ConsoleWorkspace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Workspace for ConsoleWorkspace {
    fn list_open_surfaces(&self) -> Vec<SurfaceId> {
        vec![CONSOLE_SURFACE]
    }

    fn surface_is_loading(&self, _surface: SurfaceId) -> bool {
        false
    }

    fn resolve_output_surface(&mut self, _key: &TaskKey) -> SurfaceId {
        CONSOLE_SURFACE
    }

    fn current_view_for_path(&self, _path: &str) -> Option<SurfaceId> {
        None
    }

    fn persisted(&self, surface: SurfaceId) -> Option<PersistedSurface> {
        self.persisted.get(&surface).cloned()
    }

    fn persist(&mut self, surface: SurfaceId, state: &PersistedSurface) {
        self.persisted.insert(surface, state.clone());
    }

    fn clear_running_marker(&mut self, surface: SurfaceId) {
        if let Some(state) = self.persisted.get_mut(&surface) {
            state.pid = None;
        }
    }

    fn confirm_kill(&mut self, _label: &str) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        // No interactive prompt on the console; Ctrl-C means kill.
        Box::pin(std::future::ready(true))
    }

    fn open_file_at_line(&mut self, path: &Path, line: u32) {
        eprintln!("  at {}:{line}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CommandLine;

    fn invocation() -> Invocation {
        Invocation::new(CommandLine::Shell("true".into()), "/tmp")
    }

    #[test]
    fn failure_panel_before_any_run_signals_a_failed_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = ConsolePresenter::new(tx);
        presenter.display_failure_panel("no such command", &invocation());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn failure_panel_after_a_run_began_does_not_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = ConsolePresenter::new(tx);
        presenter.begin_run(CONSOLE_SURFACE, 42, &invocation());
        presenter.display_failure_panel("trace", &invocation());
        assert!(rx.try_recv().is_err());
    }
}
