// src/exec/runner.rs

//! One wrapped child process with background output readers.
//!
//! `ProcessRunner::spawn` launches the invocation's command with piped
//! stdout/stderr and starts one reader loop per pipe. Each loop performs
//! bounded reads and publishes every non-empty chunk as
//! [`MuxEvent::Output`]; end-of-stream publishes [`MuxEvent::StreamClosed`].
//! The reader loops never touch registry or presenter state.
//!
//! Termination is idempotent: the first `request_termination` sends
//! SIGTERM and detaches the readers, so callbacks arriving after a kill
//! are silently dropped and the multiplexer alone drives the completion
//! path for killed processes.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{Result, TaskmuxError};
use crate::exec::backend::RunnerHandle;
use crate::mux::MuxEvent;
use crate::task::{CommandLine, Invocation, TaskKey};

/// Streams captured per spawn; the registry counts this many
/// `StreamClosed` events before finalizing a run.
pub const CAPTURED_STREAMS: u32 = 2;

#[derive(Debug)]
pub struct ProcessRunner {
    child: Child,
    pid: u32,
    killed: bool,
    /// Shared with the reader loops; once set they stop publishing.
    detached: Arc<AtomicBool>,
}

impl ProcessRunner {
    /// Launch the invocation's process and start the reader loops.
    ///
    /// The working directory and environment overrides are scoped to the
    /// child via `Command`; nothing process-global is mutated. Environment
    /// values and the optional `PATH` override are `$VAR`-expanded against
    /// the ambient environment first.
    pub fn spawn(
        key: TaskKey,
        invocation: &Invocation,
        events: mpsc::Sender<MuxEvent>,
        read_chunk_bytes: usize,
    ) -> Result<Self> {
        if !invocation.working_dir.is_dir() {
            return Err(TaskmuxError::Spawn {
                reason: format!(
                    "working directory does not exist: {}",
                    invocation.working_dir.display()
                ),
            });
        }

        let mut cmd = build_command(&invocation.command)?;
        cmd.current_dir(&invocation.working_dir);
        for (k, v) in &invocation.env {
            cmd.env(k, expand_vars(v));
        }
        if let Some(path) = &invocation.path_override {
            cmd.env("PATH", expand_vars(path));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| TaskmuxError::Spawn {
            reason: format!(
                "{e}\n cmd: {}\n pwd: {}",
                invocation.command.display(),
                invocation.working_dir.display()
            ),
        })?;

        let pid = child.id().unwrap_or(0);
        let detached = Arc::new(AtomicBool::new(false));

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(
                key.clone(),
                stdout,
                events.clone(),
                Arc::clone(&detached),
                read_chunk_bytes,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(
                key.clone(),
                stderr,
                events,
                Arc::clone(&detached),
                read_chunk_bytes,
            );
        }

        debug!(task = %key, pid, "process spawned");

        Ok(Self {
            child,
            pid,
            killed: false,
            detached,
        })
    }
}

impl RunnerHandle for ProcessRunner {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn request_termination(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.detached.store(true, Ordering::Relaxed);

        if let Some(id) = self.child.id() {
            match signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid = id, "sent SIGTERM"),
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(pid = id, "process already gone before SIGTERM")
                }
                Err(e) => warn!(pid = id, error = %e, "failed to send SIGTERM"),
            }
        }
    }

    fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "try_wait failed");
                Some(-1)
            }
        }
    }

    fn wait_exit(
        &mut self,
        grace: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = i32> + Send + '_>> {
        Box::pin(async move {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                Ok(Err(e)) => {
                    warn!(pid = self.pid, error = %e, "waiting on child failed");
                    -1
                }
                Err(_elapsed) => {
                    warn!(pid = self.pid, "grace period expired; escalating to SIGKILL");
                    if let Err(e) = self.child.start_kill() {
                        debug!(pid = self.pid, error = %e, "SIGKILL after grace failed");
                    }
                    match self.child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            warn!(pid = self.pid, error = %e, "waiting after SIGKILL failed");
                            -1
                        }
                    }
                }
            }
        })
    }

    fn wait_reap(
        &mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.child.wait().await {
                Ok(status) => debug!(pid = self.pid, ?status, "lingering child exited"),
                Err(e) => debug!(pid = self.pid, error = %e, "waiting on lingering child failed"),
            }
        })
    }
}

fn build_command(command: &CommandLine) -> Result<Command> {
    match command {
        CommandLine::Shell(line) => {
            let mut c = if cfg!(windows) {
                let mut c = Command::new("cmd");
                c.arg("/C");
                c
            } else {
                let mut c = Command::new("sh");
                c.arg("-c");
                c
            };
            c.arg(line);
            Ok(c)
        }
        CommandLine::Args(args) => {
            let (program, rest) = args.split_first().ok_or_else(|| TaskmuxError::Spawn {
                reason: "empty argument list".to_string(),
            })?;
            let mut c = Command::new(program);
            c.args(rest);
            Ok(c)
        }
    }
}

/// One background reader loop. Bounded reads; chunks are published until
/// the runner detaches, after which the pipe is still drained (so the
/// child never blocks on a full pipe) but nothing is published, including
/// the stream-end sentinel.
fn spawn_reader<R>(
    key: TaskKey,
    mut stream: R,
    events: mpsc::Sender<MuxEvent>,
    detached: Arc<AtomicBool>,
    chunk_bytes: usize,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; chunk_bytes];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if detached.load(Ordering::Relaxed) {
                        continue;
                    }
                    let chunk = buf[..n].to_vec();
                    if events
                        .send(MuxEvent::Output {
                            key: key.clone(),
                            bytes: chunk,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!(task = %key, error = %e, "reader loop error");
                    break;
                }
            }
        }
        if !detached.load(Ordering::Relaxed) {
            let _ = events.send(MuxEvent::StreamClosed { key }).await;
        }
    });
}

/// Expand `$VAR` and `${VAR}` references against the ambient environment.
/// Unknown variables are left verbatim, as `os.path.expandvars` does.
pub fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                let rest = &input[i + 2..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        match std::env::var(name) {
                            Ok(val) => out.push_str(&val),
                            Err(_) => {
                                out.push_str("${");
                                out.push_str(name);
                                out.push('}');
                            }
                        }
                        // Skip "{name}".
                        for _ in 0..name.chars().count() + 2 {
                            chars.next();
                        }
                    }
                    None => out.push('$'),
                }
            }
            Some(&(_, c2)) if c2 == '_' || c2.is_ascii_alphanumeric() => {
                let rest = &input[i + 1..];
                let end = rest
                    .find(|ch: char| ch != '_' && !ch.is_ascii_alphanumeric())
                    .unwrap_or(rest.len());
                let name = &rest[..end];
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        out.push('$');
                        out.push_str(name);
                    }
                }
                for _ in 0..name.len() {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SurfaceId;

    fn shell_invocation(line: &str) -> Invocation {
        Invocation::new(CommandLine::Shell(line.to_string()), "/tmp")
    }

    #[test]
    fn expand_vars_substitutes_known_variables() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("TASKMUX_TEST_VAR", "hello") };
        assert_eq!(expand_vars("$TASKMUX_TEST_VAR/x"), "hello/x");
        assert_eq!(expand_vars("${TASKMUX_TEST_VAR}y"), "helloy");
    }

    #[test]
    fn expand_vars_keeps_unknown_references_verbatim() {
        assert_eq!(expand_vars("$TASKMUX_NO_SUCH_VAR"), "$TASKMUX_NO_SUCH_VAR");
        assert_eq!(
            expand_vars("${TASKMUX_NO_SUCH_VAR}"),
            "${TASKMUX_NO_SUCH_VAR}"
        );
        assert_eq!(expand_vars("100$ and $"), "100$ and $");
        assert_eq!(expand_vars("${unterminated"), "${unterminated");
    }

    #[tokio::test]
    async fn spawn_streams_chunks_then_two_stream_ends() {
        let (tx, mut rx) = mpsc::channel(16);
        let key = TaskKey::ad_hoc("printf");
        let inv = shell_invocation("printf out; printf err >&2; exit 3");
        let mut runner = ProcessRunner::spawn(key.clone(), &inv, tx, 32 * 1024).unwrap();
        assert!(runner.pid() > 0);

        let mut output = Vec::new();
        let mut closed = 0;
        while closed < CAPTURED_STREAMS {
            match rx.recv().await.unwrap() {
                MuxEvent::Output { bytes, .. } => output.extend_from_slice(&bytes),
                MuxEvent::StreamClosed { .. } => closed += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(runner.wait_exit(Duration::from_secs(5)).await, 3);
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_working_directory() {
        let (tx, _rx) = mpsc::channel(4);
        let mut inv = shell_invocation("true");
        inv.working_dir = "/no/such/dir/anywhere".into();
        let err = ProcessRunner::spawn(TaskKey::ad_hoc("true"), &inv, tx, 1024).unwrap_err();
        assert!(matches!(err, TaskmuxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_executable() {
        let (tx, _rx) = mpsc::channel(4);
        let inv = Invocation::new(
            CommandLine::Args(vec!["/no/such/binary-xyz".to_string()]),
            "/tmp",
        );
        let err =
            ProcessRunner::spawn(TaskKey::ad_hoc("nope"), &inv, tx, 1024).unwrap_err();
        assert!(matches!(err, TaskmuxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn termination_is_idempotent_and_silences_readers() {
        let (tx, mut rx) = mpsc::channel(16);
        let key = TaskKey::for_file("/tmp/sleepy", SurfaceId(1), SurfaceId(2));
        let inv = shell_invocation("sleep 30");
        let mut runner = ProcessRunner::spawn(key, &inv, tx, 1024).unwrap();

        runner.request_termination();
        runner.request_termination();

        let code = runner.wait_exit(Duration::from_secs(5)).await;
        assert_eq!(code, -1); // killed by signal, no exit code

        // Readers were detached: no StreamClosed sentinel arrives.
        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err() || got.unwrap().is_none());
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut inv = shell_invocation("printf \"%s\" \"$TASKMUX_CHILD_VAR\"");
        inv.env
            .insert("TASKMUX_CHILD_VAR".to_string(), "from-parent".to_string());
        let mut runner =
            ProcessRunner::spawn(TaskKey::ad_hoc("env"), &inv, tx, 1024).unwrap();

        let mut output = Vec::new();
        let mut closed = 0;
        while closed < CAPTURED_STREAMS {
            match rx.recv().await.unwrap() {
                MuxEvent::Output { bytes, .. } => output.extend_from_slice(&bytes),
                MuxEvent::StreamClosed { .. } => closed += 1,
                _ => {}
            }
        }
        assert_eq!(String::from_utf8(output).unwrap(), "from-parent");
        assert_eq!(runner.wait_exit(Duration::from_secs(5)).await, 0);
    }
}
