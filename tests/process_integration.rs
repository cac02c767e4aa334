// tests/process_integration.rs
//
// End-to-end runs through the real spawner: actual child processes, real
// pipes, real signals. Unix-only by way of `sh`.

#![cfg(unix)]

use std::error::Error;
use std::time::Duration;

use taskmux::config::{Settings, PYTHON_FILE_REGEX};
use taskmux::exec::RealSpawnerBackend;
use taskmux::mux::{Multiplexer, MuxHandle};
use taskmux::task::TaskKey;

use taskmux_test_utils::builders::{key_for, InvocationBuilder};
use taskmux_test_utils::fake_workspace::FakeWorkspace;
use taskmux_test_utils::recording_presenter::RecordingPresenter;
use taskmux_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn start() -> (MuxHandle, RecordingPresenter, FakeWorkspace) {
    init_tracing();
    let settings = Settings {
        confirm_terminate: false,
        kill_grace_ms: 500,
        ..Settings::default()
    };
    let presenter = RecordingPresenter::new();
    let workspace = FakeWorkspace::new();
    let backend = RealSpawnerBackend::new(settings.read_chunk_bytes);
    let (mux, handle) = Multiplexer::new(settings, presenter.clone(), workspace.clone(), backend);
    tokio::spawn(mux.run());
    (handle, presenter, workspace)
}

async fn wait_for_completion(handle: &MuxHandle, key: &TaskKey) {
    with_timeout(async {
        loop {
            if !handle.is_running(key.clone()).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn successful_run_reports_exit_zero_and_all_output() -> TestResult {
    let (handle, presenter, _) = start();
    let key = key_for("ok.sh");

    handle
        .spawn(
            key.clone(),
            InvocationBuilder::shell("printf 'one\\ntwo\\n'").build(),
        )
        .await?;
    wait_for_completion(&handle, &key).await;

    assert_eq!(presenter.completed_runs(), vec![(key, 0)]);
    let output = presenter
        .calls()
        .iter()
        .find_map(|c| match c {
            taskmux_test_utils::recording_presenter::PresenterCall::CompletedRun {
                output, ..
            } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(output, "one\ntwo\n");
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failing_run_extracts_the_traceback() -> TestResult {
    let (handle, presenter, _) = start();
    let key = key_for("boom.py");

    let script = "echo starting; \
        printf 'Traceback (most recent call last):\\n' >&2; \
        printf '  File \"boom.py\", line 4, in <module>\\n' >&2; \
        printf '    boom()\\n' >&2; \
        exit 3";
    handle
        .spawn(
            key.clone(),
            InvocationBuilder::shell(script)
                .file_regex(PYTHON_FILE_REGEX)
                .build(),
        )
        .await?;
    wait_for_completion(&handle, &key).await;

    assert_eq!(presenter.completed_runs(), vec![(key.clone(), 3)]);
    assert!(handle.has_stack_trace(key.clone()).await);
    let panels = presenter.failure_panels();
    assert_eq!(panels.len(), 1);
    assert!(panels[0].starts_with("  File \"boom.py\", line 4"));
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stop_kills_a_long_running_process() -> TestResult {
    let (handle, presenter, _) = start();
    let key = key_for("sleep.sh");

    handle
        .spawn(key.clone(), InvocationBuilder::shell("sleep 30").build())
        .await?;
    assert!(handle.is_running(key.clone()).await);

    assert!(with_timeout(handle.stop(key.clone())).await);
    assert!(!handle.is_running(key.clone()).await);

    // Killed, so no exit status was observed.
    assert_eq!(presenter.completed_runs(), vec![(key, -1)]);
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn child_that_closes_its_streams_early_is_left_running() -> TestResult {
    let (handle, presenter, _) = start();
    let key = key_for("daemon.sh");
    let dir = tempfile::tempdir()?;
    let marker = dir.path().join("marker");

    // Closes both pipes up front, then keeps working. The run completes
    // promptly without a status and the process is never signalled, so
    // the marker still gets written.
    let script = format!("exec 1>&- 2>&-; sleep 1; : > {}", marker.display());
    handle
        .spawn(key.clone(), InvocationBuilder::shell(&script).build())
        .await?;
    wait_for_completion(&handle, &key).await;

    assert_eq!(presenter.completed_runs(), vec![(key, -1)]);
    with_timeout(async {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn environment_and_working_dir_reach_the_child() -> TestResult {
    let (handle, presenter, _) = start();
    let key = key_for("env.sh");
    let dir = tempfile::tempdir()?;

    handle
        .spawn(
            key.clone(),
            InvocationBuilder::shell("echo \"$MARKER\"; pwd")
                .working_dir(dir.path().to_str().unwrap())
                .env("MARKER", "sentinel-value")
                .build(),
        )
        .await?;
    wait_for_completion(&handle, &key).await;

    let output = presenter
        .calls()
        .iter()
        .find_map(|c| match c {
            taskmux_test_utils::recording_presenter::PresenterCall::CompletedRun {
                output, ..
            } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert!(output.contains("sentinel-value"));
    assert!(output.contains(dir.path().file_name().unwrap().to_str().unwrap()));
    handle.shutdown().await?;
    Ok(())
}
