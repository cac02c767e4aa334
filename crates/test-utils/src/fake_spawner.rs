use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use taskmux::errors::{Result, TaskmuxError};
use taskmux::exec::{RunnerHandle, SpawnerBackend};
use taskmux::mux::MuxEvent;
use taskmux::task::{Invocation, TaskKey};

#[derive(Default)]
struct RunnerState {
    exit_code: i32,
    terminations: u32,
    exited: bool,
}

struct SpawnerState {
    next_pid: u32,
    next_exit_code: i32,
    fail_next: Option<String>,
    spawns: Vec<(TaskKey, Invocation)>,
    /// Most recent runner per key; a replacement spawn swaps it out.
    runners: HashMap<TaskKey, Arc<Mutex<RunnerState>>>,
    senders: HashMap<TaskKey, mpsc::Sender<MuxEvent>>,
    /// Termination count per key across all runner generations.
    terminations: HashMap<TaskKey, u32>,
}

/// A fake spawner that hands out scripted runners instead of starting OS
/// processes. Tests drive the pipes by hand: `emit_output` and
/// `close_streams` publish the events a real reader loop would.
#[derive(Clone)]
pub struct FakeSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SpawnerState {
                next_pid: 1000,
                next_exit_code: 0,
                fail_next: None,
                spawns: Vec::new(),
                runners: HashMap::new(),
                senders: HashMap::new(),
                terminations: HashMap::new(),
            })),
        }
    }

    /// Exit code reported by the next spawned runner (and those after it,
    /// until changed again).
    pub fn set_next_exit_code(&self, code: i32) {
        self.state.lock().unwrap().next_exit_code = code;
    }

    /// Make the next `spawn` call fail with the given reason.
    pub fn fail_next_spawn(&self, reason: &str) {
        self.state.lock().unwrap().fail_next = Some(reason.to_string());
    }

    pub fn spawned(&self) -> Vec<(TaskKey, Invocation)> {
        self.state.lock().unwrap().spawns.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawns.len()
    }

    /// Terminations requested for `key`, summed over every runner that
    /// ever ran under it.
    pub fn terminations(&self, key: &TaskKey) -> u32 {
        self.state
            .lock()
            .unwrap()
            .terminations
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Deliver a chunk as if one of the task's pipes produced it.
    pub async fn emit_output(&self, key: &TaskKey, bytes: &[u8]) {
        let tx = self.sender_for(key);
        tx.send(MuxEvent::Output {
            key: key.clone(),
            bytes: bytes.to_vec(),
        })
        .await
        .expect("multiplexer gone");
    }

    /// Close both captured pipes with the process exiting, which lets the
    /// run finalize with the scripted exit code.
    pub async fn close_streams(&self, key: &TaskKey) {
        if let Some(runner) = self.state.lock().unwrap().runners.get(key) {
            runner.lock().unwrap().exited = true;
        }
        self.close_streams_without_exit(key).await;
    }

    /// Close both captured pipes while the process itself keeps running,
    /// like a child that daemonized or handed its pipes to a grandchild.
    pub async fn close_streams_without_exit(&self, key: &TaskKey) {
        let tx = self.sender_for(key);
        for _ in 0..2 {
            tx.send(MuxEvent::StreamClosed { key: key.clone() })
                .await
                .expect("multiplexer gone");
        }
    }

    fn sender_for(&self, key: &TaskKey) -> mpsc::Sender<MuxEvent> {
        self.state
            .lock()
            .unwrap()
            .senders
            .get(key)
            .cloned()
            .expect("no spawn recorded for key")
    }
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl SpawnerBackend for FakeSpawner {
    fn spawn(
        &mut self,
        key: &TaskKey,
        invocation: &Invocation,
        events: mpsc::Sender<MuxEvent>,
    ) -> Result<Box<dyn RunnerHandle>> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next.take() {
            return Err(TaskmuxError::Spawn { reason });
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        let runner_state = Arc::new(Mutex::new(RunnerState {
            exit_code: state.next_exit_code,
            ..RunnerState::default()
        }));

        state.spawns.push((key.clone(), invocation.clone()));
        state.runners.insert(key.clone(), Arc::clone(&runner_state));
        state.senders.insert(key.clone(), events);

        Ok(Box::new(FakeRunner {
            pid,
            key: key.clone(),
            state: runner_state,
            spawner: Arc::clone(&self.state),
        }))
    }
}

struct FakeRunner {
    pid: u32,
    key: TaskKey,
    state: Arc<Mutex<RunnerState>>,
    spawner: Arc<Mutex<SpawnerState>>,
}

impl RunnerHandle for FakeRunner {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn request_termination(&mut self) {
        self.state.lock().unwrap().terminations += 1;
        *self
            .spawner
            .lock()
            .unwrap()
            .terminations
            .entry(self.key.clone())
            .or_insert(0) += 1;
    }

    fn try_exit_code(&mut self) -> Option<i32> {
        let state = self.state.lock().unwrap();
        (state.exited || state.terminations > 0).then_some(state.exit_code)
    }

    fn wait_exit(&mut self, _grace: Duration) -> Pin<Box<dyn Future<Output = i32> + Send + '_>> {
        let code = {
            let mut state = self.state.lock().unwrap();
            state.exited = true;
            state.exit_code
        };
        Box::pin(std::future::ready(code))
    }

    fn wait_reap(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.state.lock().unwrap().exited = true;
        Box::pin(std::future::ready(()))
    }
}
