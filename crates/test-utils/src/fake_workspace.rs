use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use taskmux::surface::{PersistedSurface, Workspace};
use taskmux::task::{SurfaceId, TaskKey};

#[derive(Default)]
struct State {
    open: Vec<SurfaceId>,
    loading: Vec<SurfaceId>,
    persisted: HashMap<SurfaceId, PersistedSurface>,
    views_by_path: HashMap<String, SurfaceId>,
    /// Destination surface handed out per key; defaults to a fresh id.
    resolved: HashMap<TaskKey, SurfaceId>,
    next_surface: i64,
    confirm_answer: bool,
    /// When set, confirm futures stay pending until `resolve_confirm`.
    manual_confirm: bool,
    pending_confirms: Vec<oneshot::Sender<bool>>,
    confirm_prompts: Vec<String>,
    opened: Vec<(PathBuf, u32)>,
}

/// In-memory workspace double. Clones share state, so a test can keep one
/// clone for assertions while the multiplexer owns another.
#[derive(Clone)]
pub struct FakeWorkspace {
    state: Arc<Mutex<State>>,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_surface: 100,
                confirm_answer: true,
                ..State::default()
            })),
        }
    }

    pub fn with_open_surface(self, surface: SurfaceId) -> Self {
        self.state.lock().unwrap().open.push(surface);
        self
    }

    pub fn with_confirm_answer(self, answer: bool) -> Self {
        self.state.lock().unwrap().confirm_answer = answer;
        self
    }

    /// Keep confirm futures pending until the test calls
    /// [`resolve_confirm`](Self::resolve_confirm).
    pub fn with_manual_confirm(self) -> Self {
        self.state.lock().unwrap().manual_confirm = true;
        self
    }

    pub fn with_persisted(self, surface: SurfaceId, persisted: PersistedSurface) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.persisted.insert(surface, persisted);
            if !state.open.contains(&surface) {
                state.open.push(surface);
            }
        }
        self
    }

    /// Pin the destination surface for `key` instead of allocating one.
    pub fn with_resolution(self, key: TaskKey, surface: SurfaceId) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.resolved.insert(key, surface);
            if !state.open.contains(&surface) {
                state.open.push(surface);
            }
        }
        self
    }

    pub fn with_view_for_path(self, path: &str, surface: SurfaceId) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.views_by_path.insert(path.to_string(), surface);
            if !state.open.contains(&surface) {
                state.open.push(surface);
            }
        }
        self
    }

    pub fn close_surface(&self, surface: SurfaceId) {
        self.state.lock().unwrap().open.retain(|s| *s != surface);
    }

    pub fn persisted_state(&self, surface: SurfaceId) -> Option<PersistedSurface> {
        self.state.lock().unwrap().persisted.get(&surface).cloned()
    }

    pub fn confirm_prompts(&self) -> Vec<String> {
        self.state.lock().unwrap().confirm_prompts.clone()
    }

    pub fn pending_confirm_count(&self) -> usize {
        self.state.lock().unwrap().pending_confirms.len()
    }

    /// Answer the oldest pending confirm prompt. Panics when none is
    /// pending.
    pub fn resolve_confirm(&self, answer: bool) {
        let sender = {
            let mut state = self.state.lock().unwrap();
            assert!(
                !state.pending_confirms.is_empty(),
                "no confirm prompt is pending"
            );
            state.pending_confirms.remove(0)
        };
        let _ = sender.send(answer);
    }

    pub fn opened_locations(&self) -> Vec<(PathBuf, u32)> {
        self.state.lock().unwrap().opened.clone()
    }
}

impl Default for FakeWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace for FakeWorkspace {
    fn list_open_surfaces(&self) -> Vec<SurfaceId> {
        self.state.lock().unwrap().open.clone()
    }

    fn surface_is_loading(&self, surface: SurfaceId) -> bool {
        self.state.lock().unwrap().loading.contains(&surface)
    }

    fn resolve_output_surface(&mut self, key: &TaskKey) -> SurfaceId {
        let mut state = self.state.lock().unwrap();
        if let Some(surface) = state.resolved.get(key) {
            return *surface;
        }
        state.next_surface += 1;
        let surface = SurfaceId(state.next_surface);
        state.resolved.insert(key.clone(), surface);
        state.open.push(surface);
        surface
    }

    fn current_view_for_path(&self, path: &str) -> Option<SurfaceId> {
        self.state.lock().unwrap().views_by_path.get(path).copied()
    }

    fn persisted(&self, surface: SurfaceId) -> Option<PersistedSurface> {
        self.state.lock().unwrap().persisted.get(&surface).cloned()
    }

    fn persist(&mut self, surface: SurfaceId, state: &PersistedSurface) {
        self.state
            .lock()
            .unwrap()
            .persisted
            .insert(surface, state.clone());
    }

    fn clear_running_marker(&mut self, surface: SurfaceId) {
        if let Some(p) = self.state.lock().unwrap().persisted.get_mut(&surface) {
            p.pid = None;
        }
    }

    fn confirm_kill(&mut self, label: &str) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        let mut state = self.state.lock().unwrap();
        state.confirm_prompts.push(label.to_string());
        if state.manual_confirm {
            let (tx, rx) = oneshot::channel();
            state.pending_confirms.push(tx);
            Box::pin(async move { rx.await.unwrap_or(false) })
        } else {
            let answer = state.confirm_answer;
            Box::pin(std::future::ready(answer))
        }
    }

    fn open_file_at_line(&mut self, path: &Path, line: u32) {
        self.state
            .lock()
            .unwrap()
            .opened
            .push((path.to_path_buf(), line));
    }
}
