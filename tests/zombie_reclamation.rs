// tests/zombie_reclamation.rs
//
// Startup reclamation: surfaces persisted by a previous session either
// carried a running-marker pid (zombie, force-killed and announced) or
// plain stale output (folded). Associations are rebuilt so reruns work.

use std::error::Error;

use taskmux::config::Settings;
use taskmux::mux::{Multiplexer, MuxHandle};
use taskmux::surface::PersistedSurface;
use taskmux::task::{SurfaceId, TaskKey};

use taskmux_test_utils::builders::InvocationBuilder;
use taskmux_test_utils::fake_spawner::FakeSpawner;
use taskmux_test_utils::fake_workspace::FakeWorkspace;
use taskmux_test_utils::init_tracing;
use taskmux_test_utils::recording_presenter::{PresenterCall, RecordingPresenter};

type TestResult = Result<(), Box<dyn Error>>;

// Near the default pid_max, so nothing is actually running under it and
// the force-kill resolves to "already gone".
const STALE_PID: u32 = 4_190_000;

fn persisted(path: &str, pid: Option<u32>) -> PersistedSurface {
    PersistedSurface {
        invocation: InvocationBuilder::args(&["python3", path]).build(),
        task: TaskKey::for_file(path, SurfaceId(1), SurfaceId(2)),
        pid,
        trace_generation: None,
        nav_depth: 0,
    }
}

fn start(workspace: FakeWorkspace) -> (MuxHandle, RecordingPresenter, FakeSpawner) {
    init_tracing();
    let presenter = RecordingPresenter::new();
    let spawner = FakeSpawner::new();
    let (mux, handle) = Multiplexer::new(
        Settings {
            confirm_terminate: false,
            ..Settings::default()
        },
        presenter.clone(),
        workspace,
        spawner.clone(),
    );
    tokio::spawn(mux.run());
    (handle, presenter, spawner)
}

#[tokio::test]
async fn stale_running_marker_is_killed_cleared_and_announced() -> TestResult {
    let surface = SurfaceId(7);
    let workspace =
        FakeWorkspace::new().with_persisted(surface, persisted("a.py", Some(STALE_PID)));
    let (handle, presenter, _) = start(workspace.clone());

    // First answered query is ordered after the startup pass.
    let key = TaskKey::for_file("a.py", SurfaceId(1), SurfaceId(2));
    assert!(!handle.is_running(key).await);

    assert_eq!(workspace.persisted_state(surface).unwrap().pid, None);
    assert!(presenter
        .calls()
        .iter()
        .any(|c| matches!(c, PresenterCall::ZombieNotice { surface: s } if *s == surface)));
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stale_output_without_marker_is_only_folded() -> TestResult {
    let surface = SurfaceId(7);
    let workspace = FakeWorkspace::new().with_persisted(surface, persisted("a.py", None));
    let (handle, presenter, _) = start(workspace.clone());

    let key = TaskKey::for_file("a.py", SurfaceId(1), SurfaceId(2));
    assert!(!handle.is_running(key).await);

    let calls = presenter.calls();
    assert!(calls
        .iter()
        .any(|c| matches!(c, PresenterCall::FoldOld { surface: s } if *s == surface)));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, PresenterCall::ZombieNotice { .. })));
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rerun_works_from_reassociated_invocation() -> TestResult {
    let surface = SurfaceId(7);
    let workspace = FakeWorkspace::new().with_persisted(surface, persisted("a.py", None));
    let (handle, _, spawner) = start(workspace);

    let key = TaskKey::for_file("a.py", SurfaceId(1), SurfaceId(2));
    handle.rerun(key.clone()).await?;

    assert!(handle.is_running(key).await);
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(
        spawner.spawned()[0].1,
        InvocationBuilder::args(&["python3", "a.py"]).build()
    );
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn reopened_source_view_migrates_the_association() -> TestResult {
    let surface = SurfaceId(7);
    let new_view = SurfaceId(9);
    let workspace = FakeWorkspace::new()
        .with_persisted(surface, persisted("a.py", None))
        .with_view_for_path("a.py", new_view);
    let (handle, _, spawner) = start(workspace.clone());

    // The key now answers under the migrated view id.
    let migrated = TaskKey::for_file("a.py", SurfaceId(1), new_view);
    handle.rerun(migrated.clone()).await?;
    assert!(handle.is_running(migrated.clone()).await);
    assert_eq!(spawner.spawn_count(), 1);

    assert_eq!(
        workspace.persisted_state(surface).unwrap().task.view,
        new_view
    );
    handle.shutdown().await?;
    Ok(())
}
