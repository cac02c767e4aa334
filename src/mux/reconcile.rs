// src/mux/reconcile.rs

//! Reconciliation passes that keep the registry honest about the outside
//! world: the periodic orphan sweep (destination surface vanished while
//! the process is still live) and the one-shot startup reclamation of
//! zombies (processes recorded as running by a previous session).

use std::collections::HashSet;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::mux::registry::Registry;
use crate::surface::{Presenter, Workspace};
use crate::task::SurfaceId;

/// Kill and purge every live task whose destination surface is no longer
/// open. Returns the number of orphans reclaimed. Logged, never surfaced
/// as a user error.
pub(crate) fn sweep_orphans<W: Workspace>(registry: &mut Registry, workspace: &W) -> usize {
    let open: HashSet<SurfaceId> = workspace.list_open_surfaces().into_iter().collect();

    let orphaned: Vec<_> = registry
        .procs
        .iter()
        .filter(|(_, entry)| !open.contains(&entry.surface))
        .map(|(key, _)| key.clone())
        .collect();

    for key in &orphaned {
        warn!(task = %key, "destination surface vanished; halting orphaned process");
        if let Some(mut entry) = registry.purge(key) {
            entry.runner.request_termination();
            tokio::spawn(async move {
                let _ = entry.runner.wait_exit(Duration::from_secs(2)).await;
            });
        }
    }

    orphaned.len()
}

/// Startup pass, run once before the event loop: wait for open surfaces to
/// finish loading, then for every surface with persisted state from a
/// previous session:
///
/// - a running-marker pid means a zombie: force-kill it by pid
///   (best-effort; the pid being gone already is fine), clear the marker,
///   and post a terminated-by-restart notice;
/// - stale output without a marker is merely folded for readability;
/// - a persisted task whose source view was reopened under a new id has
///   its association migrated to the new id;
/// - either way the surface's task/invocation are re-associated into the
///   registry so reruns keep working.
pub(crate) async fn reclaim_zombies<W: Workspace, P: Presenter>(
    registry: &mut Registry,
    workspace: &mut W,
    presenter: &mut P,
) {
    wait_for_surfaces(workspace).await;

    for surface in workspace.list_open_surfaces() {
        let Some(mut state) = workspace.persisted(surface) else {
            continue;
        };

        if let Some(current) = workspace.current_view_for_path(&state.task.source_path) {
            if !state.task.view.is_none() && state.task.view != current {
                debug!(
                    task = %state.task,
                    new_view = %current,
                    "source view id changed across restart; migrating association"
                );
                state.task.view = current;
                workspace.persist(surface, &state);
            }
        }

        match state.pid {
            Some(pid) => {
                info!(task = %state.task, pid, "killing zombie process from previous session");
                kill_by_pid(pid);
                workspace.clear_running_marker(surface);
                presenter.zombie_terminated_notice(surface, &state.invocation);
            }
            None => presenter.fold_old(surface),
        }

        registry.views.insert(state.task.clone(), surface);
        registry
            .invocations
            .insert(state.task.clone(), state.invocation.clone());
    }
}

async fn wait_for_surfaces<W: Workspace>(workspace: &W) {
    // Bounded wait; a surface that never finishes loading should not wedge
    // startup forever.
    for _ in 0..100 {
        let loading = workspace
            .list_open_surfaces()
            .into_iter()
            .any(|s| workspace.surface_is_loading(s));
        if !loading {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!("surfaces still loading after bounded wait; reclaiming anyway");
}

/// Best-effort SIGKILL of a recorded pid. A pid that no longer exists is
/// treated as success.
fn kill_by_pid(pid: u32) {
    if pid <= 1 {
        return;
    }
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "zombie killed"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "zombie already gone"),
        Err(e) => warn!(pid, error = %e, "failed to kill zombie"),
    }
}
