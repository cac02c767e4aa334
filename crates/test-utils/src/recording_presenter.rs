use std::sync::{Arc, Mutex};

use taskmux::surface::{CompletedRun, Presenter};
use taskmux::task::{Invocation, SurfaceId, TaskKey};

/// One observed presenter call, with the fields tests assert on.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenterCall {
    BeginRun { surface: SurfaceId, pid: u32 },
    AppendOutput { surface: SurfaceId, text: String },
    CompletedRun { surface: SurfaceId, key: TaskKey, exit_code: i32, output: String },
    FailurePanel { trimmed: String },
    FlashError { surface: SurfaceId },
    ClearError { surface: SurfaceId },
    ZombieNotice { surface: SurfaceId },
    FoldOld { surface: SurfaceId },
}

/// Records every presenter call for later inspection. The call log is
/// shared, so tests keep a clone while the multiplexer owns the presenter.
#[derive(Clone, Default)]
pub struct RecordingPresenter {
    calls: Arc<Mutex<Vec<PresenterCall>>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PresenterCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Full output delivered to `surface` via `append_output`, joined.
    pub fn output_for(&self, surface: SurfaceId) -> String {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                PresenterCall::AppendOutput { surface: s, text } if *s == surface => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect()
    }

    pub fn completed_runs(&self) -> Vec<(TaskKey, i32)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                PresenterCall::CompletedRun { key, exit_code, .. } => {
                    Some((key.clone(), *exit_code))
                }
                _ => None,
            })
            .collect()
    }

    pub fn failure_panels(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                PresenterCall::FailurePanel { trimmed } => Some(trimmed.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: PresenterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Presenter for RecordingPresenter {
    fn begin_run(&mut self, surface: SurfaceId, pid: u32, _invocation: &Invocation) {
        self.push(PresenterCall::BeginRun { surface, pid });
    }

    fn append_output(&mut self, surface: SurfaceId, text: &str) {
        self.push(PresenterCall::AppendOutput {
            surface,
            text: text.to_string(),
        });
    }

    fn completed_run(&mut self, surface: SurfaceId, key: &TaskKey, run: &CompletedRun) {
        self.push(PresenterCall::CompletedRun {
            surface,
            key: key.clone(),
            exit_code: run.exit_code,
            output: run.output.clone(),
        });
    }

    fn display_failure_panel(&mut self, trimmed: &str, _invocation: &Invocation) {
        self.push(PresenterCall::FailurePanel {
            trimmed: trimmed.to_string(),
        });
    }

    fn flash_error_indicator(&mut self, surface: SurfaceId) {
        self.push(PresenterCall::FlashError { surface });
    }

    fn clear_error_indicator(&mut self, surface: SurfaceId) {
        self.push(PresenterCall::ClearError { surface });
    }

    fn zombie_terminated_notice(&mut self, surface: SurfaceId, _invocation: &Invocation) {
        self.push(PresenterCall::ZombieNotice { surface });
    }

    fn fold_old(&mut self, surface: SurfaceId) {
        self.push(PresenterCall::FoldOld { surface });
    }
}
