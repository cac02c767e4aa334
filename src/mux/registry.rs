// src/mux/registry.rs

//! Per-key registry state owned by the multiplexer loop.
//!
//! Only the loop ever touches these maps (single-writer discipline), so
//! there is no locking here at all.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::exec::RunnerHandle;
use crate::task::{Invocation, SurfaceId, TaskKey};
use crate::trace::StackTraceRecord;

/// Stop-confirmation progress for one live process. While a prompt is
/// pending no second prompt may be issued for the same key; later stop
/// requests just join the waiter list.
pub enum StopState {
    None,
    AwaitingConfirm {
        waiters: Vec<oneshot::Sender<bool>>,
        /// Invocation to start once the stop goes through (replacement
        /// spawn on an already-running key).
        respawn: Option<Invocation>,
    },
}

/// One live process and everything needed to finalize it.
pub struct ProcessEntry {
    pub runner: Box<dyn RunnerHandle>,
    pub invocation: Invocation,
    pub surface: SurfaceId,
    pub started: Instant,
    /// Countdown of end-of-stream sentinels; finalize fires at zero.
    pub pending_streams: u32,
    /// Decoded output accumulated for failure post-processing.
    pub captured: String,
    /// Trailing bytes of an incomplete multibyte sequence, waiting for the
    /// next chunk.
    pub undecoded: Vec<u8>,
    pub stop: StopState,
    /// End-of-stream completion parked while a kill prompt is open for
    /// this key; resolved together with the prompt.
    pub finalize_deferred: bool,
}

/// The registry: task key -> live process / destination surface /
/// remembered invocation / captured stack trace.
#[derive(Default)]
pub struct Registry {
    pub procs: HashMap<TaskKey, ProcessEntry>,
    pub views: HashMap<TaskKey, SurfaceId>,
    pub invocations: HashMap<TaskKey, Invocation>,
    pub stacks: HashMap<TaskKey, StackTraceRecord>,
    pub nav_depth: HashMap<TaskKey, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, key: &TaskKey) -> bool {
        self.procs.contains_key(key)
    }

    /// Keys touching `surface`, either as source view or as destination.
    pub fn keys_for_surface(&self, surface: SurfaceId) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self
            .views
            .iter()
            .filter(|(k, dest)| k.view == surface || **dest == surface)
            .map(|(k, _)| k.clone())
            .collect();
        for k in self.procs.keys() {
            if (k.view == surface || self.procs[k].surface == surface) && !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        keys
    }

    /// Drop every trace of `key`, returning the live entry if there was
    /// one (the caller decides how to dispose of the process).
    pub fn purge(&mut self, key: &TaskKey) -> Option<ProcessEntry> {
        self.views.remove(key);
        self.invocations.remove(key);
        self.stacks.remove(key);
        self.nav_depth.remove(key);
        self.procs.remove(key)
    }
}

/// Visible substitute for undecodable output, mirroring the message shown
/// in the output buffer of the original tool.
pub fn decode_placeholder(encoding: &str) -> String {
    format!("[Decode error - output not {encoding}]\n")
}

/// Incrementally decode `bytes`, carrying incomplete multibyte tails in
/// `undecoded` across chunk boundaries. Invalid sequences substitute the
/// placeholder message; the run continues either way.
///
/// Only the UTF-8 family is actually decoded; the `encoding` name feeds
/// the placeholder text.
pub fn decode_chunk(undecoded: &mut Vec<u8>, bytes: &[u8], encoding: &str) -> String {
    undecoded.extend_from_slice(bytes);
    let data = std::mem::take(undecoded);

    let mut out = String::new();
    let mut pos = 0;
    while pos < data.len() {
        match std::str::from_utf8(&data[pos..]) {
            Ok(s) => {
                out.push_str(s);
                pos = data.len();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if let Ok(s) = std::str::from_utf8(&data[pos..pos + valid]) {
                    out.push_str(s);
                }
                pos += valid;
                match e.error_len() {
                    Some(bad) => {
                        out.push_str(&decode_placeholder(encoding));
                        pos += bad;
                    }
                    None => {
                        // Incomplete sequence at the end; hold it back.
                        *undecoded = data[pos..].to_vec();
                        return out;
                    }
                }
            }
        }
    }
    out
}
