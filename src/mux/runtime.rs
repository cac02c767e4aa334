// src/mux/runtime.rs

//! The multiplexer event loop.
//!
//! One `Multiplexer` instance exists per running application. It owns the
//! registry and consumes every [`MuxEvent`] on a single loop, so registry
//! mutation needs no locking. Process spawning goes through a
//! [`SpawnerBackend`] so tests can run the full loop without real
//! processes; all rendering goes through the [`Presenter`] boundary.

use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::errors::Result;
use crate::exec::SpawnerBackend;
use crate::mux::registry::{
    decode_chunk, decode_placeholder, ProcessEntry, Registry, StopState,
};
use crate::mux::{reconcile, MuxCommand, MuxEvent, MuxHandle};
use crate::surface::{CompletedRun, PersistedSurface, Presenter, Workspace};
use crate::task::{Invocation, SurfaceId, TaskKey};
use crate::trace::{self, Generation, StackTraceRecord};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Multiplexer<P: Presenter, W: Workspace, B: SpawnerBackend> {
    settings: Settings,
    presenter: P,
    workspace: W,
    backend: B,
    registry: Registry,
    events_tx: mpsc::Sender<MuxEvent>,
    events_rx: mpsc::Receiver<MuxEvent>,
    /// Armed only while at least one process is live.
    reconcile: Option<Interval>,
    /// Strictly-increasing source of stack-trace generation tokens.
    next_generation: u64,
}

/// What the select loop saw; handled outside the select so handlers can
/// borrow the whole struct.
enum Step {
    Event(Option<MuxEvent>),
    ReconcileTick,
}

impl<P: Presenter, W: Workspace, B: SpawnerBackend> Multiplexer<P, W, B> {
    pub fn new(settings: Settings, presenter: P, workspace: W, backend: B) -> (Self, MuxHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = MuxHandle::new(events_tx.clone());
        let mux = Self {
            settings,
            presenter,
            workspace,
            backend,
            registry: Registry::new(),
            events_tx,
            events_rx,
            reconcile: None,
            next_generation: 0,
        };
        (mux, handle)
    }

    /// Main loop. Runs startup zombie reclamation first, then consumes
    /// events until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!("taskmux multiplexer started");

        reconcile::reclaim_zombies(
            &mut self.registry,
            &mut self.workspace,
            &mut self.presenter,
        )
        .await;

        loop {
            let step = tokio::select! {
                maybe = self.events_rx.recv() => Step::Event(maybe),
                _ = armed_tick(&mut self.reconcile) => Step::ReconcileTick,
            };

            match step {
                Step::Event(Some(event)) => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                Step::Event(None) => {
                    info!("event channel closed; exiting");
                    break;
                }
                Step::ReconcileTick => {
                    self.reconcile_pass();
                }
            }
        }

        info!("multiplexer exiting");
        Ok(())
    }

    async fn handle_event(&mut self, event: MuxEvent) -> bool {
        match event {
            MuxEvent::Command(cmd) => return self.handle_command(cmd).await,
            MuxEvent::Output { key, bytes } => self.on_output(&key, &bytes),
            MuxEvent::StreamClosed { key } => self.on_stream_closed(&key).await,
            MuxEvent::StopResolved { key, confirmed } => {
                self.on_stop_resolved(&key, confirmed).await
            }
            MuxEvent::ReconcileNow => self.reconcile_pass(),
        }
        true
    }

    async fn handle_command(&mut self, command: MuxCommand) -> bool {
        match command {
            MuxCommand::Spawn { key, invocation } => self.spawn_task(key, invocation).await,
            MuxCommand::Rerun { key } => match self.registry.invocations.get(&key).cloned() {
                Some(invocation) => self.spawn_task(key, invocation).await,
                None => warn!(task = %key, "rerun requested but no invocation is remembered"),
            },
            MuxCommand::Stop { key, reply } => self.stop_task(&key, reply, None).await,
            MuxCommand::BrowseStackTrace { key } => self.browse_stack_trace(&key),
            MuxCommand::ViewClosed { surface } => self.view_closed(surface),
            MuxCommand::IsRunning { key, reply } => {
                let _ = reply.send(self.registry.is_live(&key));
            }
            MuxCommand::HasStackTrace { key, reply } => {
                let _ = reply.send(self.registry.stacks.contains_key(&key));
            }
            MuxCommand::Shutdown => {
                self.halt_all();
                return false;
            }
        }
        true
    }

    /// Accept a spawn for `key`. If a process is already live under this
    /// key, the stop path (confirmation included) must succeed first; on
    /// confirmation the replacement invocation is started automatically.
    /// Never queues, never runs two processes under one key.
    async fn spawn_task(&mut self, key: TaskKey, invocation: Invocation) {
        if self.registry.is_live(&key) {
            debug!(task = %key, "key already running; replacement requires stop first");
            self.stop_task(&key, None, Some(invocation)).await;
            return;
        }
        self.accept_spawn(key, invocation);
    }

    fn accept_spawn(&mut self, key: TaskKey, invocation: Invocation) {
        let surface = self.workspace.resolve_output_surface(&key);

        match self.backend.spawn(&key, &invocation, self.events_tx.clone()) {
            Ok(runner) => {
                let pid = runner.pid();
                self.registry.views.insert(key.clone(), surface);
                self.registry
                    .invocations
                    .insert(key.clone(), invocation.clone());
                self.workspace.persist(
                    surface,
                    &PersistedSurface {
                        invocation: invocation.clone(),
                        task: key.clone(),
                        pid: Some(pid),
                        trace_generation: self
                            .registry
                            .stacks
                            .get(&key)
                            .map(|r| r.generation),
                        nav_depth: 0,
                    },
                );
                self.presenter.begin_run(surface, pid, &invocation);

                self.registry.procs.insert(
                    key.clone(),
                    ProcessEntry {
                        runner,
                        invocation,
                        surface,
                        started: std::time::Instant::now(),
                        pending_streams: crate::exec::runner::CAPTURED_STREAMS,
                        captured: String::new(),
                        undecoded: Vec::new(),
                        stop: StopState::None,
                        finalize_deferred: false,
                    },
                );
                self.arm_reconcile();
                info!(task = %key, pid, "running");
            }
            Err(e) => {
                // Reported once via the failure panel; never retried.
                error!(task = %key, error = %e, "spawn failed");
                let report = format!(
                    "{e}\npath: {}",
                    invocation
                        .path_override
                        .clone()
                        .or_else(|| invocation.env.get("PATH").cloned())
                        .unwrap_or_else(|| std::env::var("PATH").unwrap_or_default()),
                );
                self.presenter.display_failure_panel(&report, &invocation);
            }
        }
    }

    /// Stop the live process for `key`, if any. `reply` (when present)
    /// resolves with whether the stop was carried out; `respawn` is
    /// started after a successful stop (replacement-spawn path).
    async fn stop_task(
        &mut self,
        key: &TaskKey,
        reply: Option<oneshot::Sender<bool>>,
        respawn: Option<Invocation>,
    ) {
        let Some(entry) = self.registry.procs.get_mut(key) else {
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
            return;
        };

        if let StopState::AwaitingConfirm {
            waiters,
            respawn: pending_respawn,
        } = &mut entry.stop
        {
            // A prompt is already pending for this key; join it.
            if let Some(reply) = reply {
                waiters.push(reply);
            }
            if respawn.is_some() {
                *pending_respawn = respawn;
            }
            return;
        }

        if self.settings.confirm_terminate {
            entry.stop = StopState::AwaitingConfirm {
                waiters: reply.into_iter().collect(),
                respawn,
            };
            let prompt = self.workspace.confirm_kill(&key.label());
            let events = self.events_tx.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let confirmed = prompt.await;
                let _ = events.send(MuxEvent::StopResolved { key, confirmed }).await;
            });
            return;
        }

        self.kill_and_finalize(key).await;
        if let Some(reply) = reply {
            let _ = reply.send(true);
        }
        if let Some(invocation) = respawn {
            self.accept_spawn(key.clone(), invocation);
        }
    }

    async fn on_stop_resolved(&mut self, key: &TaskKey, confirmed: bool) {
        let Some(entry) = self.registry.procs.get_mut(key) else {
            // The key was purged (surface closed) while the prompt was open.
            return;
        };
        let finalize_deferred = entry.finalize_deferred;
        let StopState::AwaitingConfirm { waiters, respawn } =
            std::mem::replace(&mut entry.stop, StopState::None)
        else {
            return;
        };

        if !confirmed {
            debug!(task = %key, "termination declined; process left running");
            for w in waiters {
                let _ = w.send(false);
            }
            if finalize_deferred {
                // Streams already ended during the prompt; complete the run
                // now that the prompt is settled.
                self.finalize(key, false).await;
            }
            return;
        }

        self.kill_and_finalize(key).await;
        for w in waiters {
            let _ = w.send(true);
        }
        if let Some(invocation) = respawn {
            self.accept_spawn(key.clone(), invocation);
        }
    }

    /// Terminate and immediately drive the completion path. Termination
    /// detaches the reader loops, so no stream-end sentinels will arrive;
    /// the finalize here is the only one.
    async fn kill_and_finalize(&mut self, key: &TaskKey) {
        if let Some(entry) = self.registry.procs.get_mut(key) {
            entry.runner.request_termination();
            info!(task = %key, "halted");
        }
        self.finalize(key, true).await;
    }

    fn on_output(&mut self, key: &TaskKey, bytes: &[u8]) {
        // Late chunks for a killed/purged key are silently dropped.
        let Some(entry) = self.registry.procs.get_mut(key) else {
            return;
        };
        let text = decode_chunk(&mut entry.undecoded, bytes, &entry.invocation.encoding);
        if text.is_empty() {
            return;
        }
        entry.captured.push_str(&text);
        self.presenter.append_output(entry.surface, &text);
    }

    async fn on_stream_closed(&mut self, key: &TaskKey) {
        let Some(entry) = self.registry.procs.get_mut(key) else {
            return;
        };
        entry.pending_streams = entry.pending_streams.saturating_sub(1);
        if entry.pending_streams == 0 {
            if matches!(entry.stop, StopState::AwaitingConfirm { .. }) {
                // Finalizing now would discard the prompt's waiters and any
                // parked replacement invocation. Park the completion until
                // the prompt resolves.
                entry.finalize_deferred = true;
                return;
            }
            self.finalize(key, false).await;
        }
    }

    /// Completion path: compute elapsed and exit code, deregister, notify
    /// the presenter, then run failure post-processing. `killed` says the
    /// process was explicitly signalled; only that path may block on (and
    /// escalate) the exit wait. A natural end of stream polls the status
    /// without blocking, and a child that closed its pipes but kept
    /// running is left alone and reaped whenever it exits.
    async fn finalize(&mut self, key: &TaskKey, killed: bool) {
        let Some(mut entry) = self.registry.procs.remove(key) else {
            return;
        };

        if !entry.undecoded.is_empty() {
            // Incomplete sequence at end of stream.
            let placeholder = decode_placeholder(&entry.invocation.encoding);
            entry.captured.push_str(&placeholder);
            self.presenter.append_output(entry.surface, &placeholder);
            entry.undecoded.clear();
        }

        let mut lingering = false;
        let exit_code = if killed {
            let grace = Duration::from_millis(self.settings.kill_grace_ms);
            entry.runner.wait_exit(grace).await
        } else {
            match entry.runner.try_exit_code() {
                Some(code) => code,
                None => {
                    warn!(
                        task = %key,
                        pid = entry.runner.pid(),
                        "streams closed but process still running; leaving it untouched"
                    );
                    lingering = true;
                    -1
                }
            }
        };
        let elapsed = entry.started.elapsed();

        self.workspace.clear_running_marker(entry.surface);
        let run = CompletedRun {
            exit_code,
            elapsed,
            working_dir: entry.invocation.working_dir.clone(),
            output: entry.captured.clone(),
        };
        self.presenter.completed_run(entry.surface, key, &run);
        info!(task = %key, exit_code, elapsed_ms = elapsed.as_millis() as u64, "complete");

        if exit_code == 0 {
            if self.registry.stacks.remove(key).is_some() {
                self.registry.nav_depth.remove(key);
                self.presenter.clear_error_indicator(entry.surface);
            }
        } else {
            self.capture_stack_trace(key, &entry);
        }

        if lingering {
            reap_lingering(entry.runner);
        }
        self.disarm_reconcile_if_idle();
    }

    /// Run the extractor over the captured output; when frames come back,
    /// replace the key's record under a fresh generation.
    fn capture_stack_trace(&mut self, key: &TaskKey, entry: &ProcessEntry) {
        if entry.invocation.file_regex.is_empty() {
            return;
        }
        let pattern = match Regex::new(&entry.invocation.file_regex) {
            Ok(p) => p,
            Err(e) => {
                // Misconfigured pattern never crashes the run.
                warn!(task = %key, error = %e, "invalid file_regex; skipping extraction");
                return;
            }
        };

        let (frames, trimmed) = trace::extract(
            &entry.captured,
            &pattern,
            &entry.invocation.working_dir,
        );
        if frames.is_empty() {
            return;
        }

        self.next_generation += 1;
        let generation = Generation(self.next_generation);
        debug!(task = %key, frames = frames.len(), ?generation, "stack trace captured");

        self.registry.stacks.insert(
            key.clone(),
            StackTraceRecord {
                frames,
                generation,
                working_dir: entry.invocation.working_dir.clone(),
            },
        );
        self.registry.nav_depth.insert(key.clone(), 0);

        if let Some(mut persisted) = self.workspace.persisted(entry.surface) {
            persisted.trace_generation = Some(generation);
            persisted.nav_depth = 0;
            self.workspace.persist(entry.surface, &persisted);
        }

        if let Some(text) = trimmed {
            self.presenter.display_failure_panel(&text, &entry.invocation);
        }
        self.presenter.flash_error_indicator(entry.surface);
        if !key.view.is_none() {
            self.presenter.flash_error_indicator(key.view);
        }
    }

    /// Open the next frame of the stored stack trace, cycling through the
    /// frames on repeated calls. Cached depth is only trusted when the
    /// persisted generation matches the record's.
    fn browse_stack_trace(&mut self, key: &TaskKey) {
        let Some(record) = self.registry.stacks.get(key) else {
            debug!(task = %key, "no stack trace stored");
            return;
        };
        if record.frames.is_empty() {
            return;
        }

        // A persisted token from a different trace means the cached depth
        // cannot be trusted.
        let surface = self.registry.views.get(key).copied();
        let stale = surface
            .and_then(|s| self.workspace.persisted(s))
            .and_then(|p| p.trace_generation)
            .map(|g| g != record.generation)
            .unwrap_or(false);

        let depth = if stale {
            0
        } else {
            *self.registry.nav_depth.get(key).unwrap_or(&0) % record.frames.len()
        };
        let frame = &record.frames[depth];
        self.workspace
            .open_file_at_line(&frame.file_path, frame.line_number);
        self.registry.nav_depth.insert(key.clone(), depth + 1);

        if let Some(surface) = surface {
            if let Some(mut persisted) = self.workspace.persisted(surface) {
                persisted.trace_generation = Some(record.generation);
                persisted.nav_depth = (depth + 1) as u32;
                self.workspace.persist(surface, &persisted);
            }
        }
    }

    /// A source or destination surface was closed: purge every key it
    /// touches and halt still-live processes.
    fn view_closed(&mut self, surface: SurfaceId) {
        for key in self.registry.keys_for_surface(surface) {
            if let Some(mut entry) = self.registry.purge(&key) {
                entry.runner.request_termination();
                info!(task = %key, "halted (surface closed)");
                reap_in_background(entry);
            }
        }
        self.presenter.clear_error_indicator(surface);
        self.disarm_reconcile_if_idle();
    }

    fn halt_all(&mut self) {
        let keys: Vec<TaskKey> = self.registry.procs.keys().cloned().collect();
        for key in keys {
            if let Some(mut entry) = self.registry.purge(&key) {
                entry.runner.request_termination();
                info!(task = %key, "halted (shutdown)");
                reap_in_background(entry);
            }
        }
        self.reconcile = None;
    }

    fn reconcile_pass(&mut self) {
        reconcile::sweep_orphans(&mut self.registry, &self.workspace);
        self.disarm_reconcile_if_idle();
    }

    fn arm_reconcile(&mut self) {
        if self.reconcile.is_none() {
            let period = Duration::from_millis(self.settings.reconcile_interval_ms);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            self.reconcile = Some(interval);
        }
    }

    /// Polling stops once nothing is live, so an idle multiplexer does no
    /// periodic work.
    fn disarm_reconcile_if_idle(&mut self) {
        if self.registry.procs.is_empty() {
            self.reconcile = None;
        }
    }
}

/// Wait out a terminated process off the loop so finalization of other
/// tasks is never blocked on it.
fn reap_in_background(mut entry: ProcessEntry) {
    tokio::spawn(async move {
        let _ = entry.runner.wait_exit(Duration::from_secs(2)).await;
    });
}

/// Reap a child that outlived its streams, without ever signalling it.
fn reap_lingering(mut runner: Box<dyn crate::exec::RunnerHandle>) {
    tokio::spawn(async move {
        runner.wait_reap().await;
    });
}

async fn armed_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
