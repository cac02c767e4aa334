// src/task.rs

//! Task identity and invocation value types.
//!
//! A [`TaskKey`] names one logical unit of work and is the sole map key in
//! the multiplexer registry. An [`Invocation`] is the full recipe for
//! starting the task's process; it is remembered per key so the task can be
//! rerun later, and serialized into per-surface state by the boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier of a UI surface (window, view, panel) owned by the boundary.
///
/// `SurfaceId::NONE` is the sentinel for "no surface", used by ad-hoc
/// invocations that have no originating file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SurfaceId(pub i64);

impl SurfaceId {
    pub const NONE: SurfaceId = SurfaceId(-1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identity of one logical task.
///
/// Constructed in exactly two ways: from a source file plus the surfaces it
/// lives in, or from an ad-hoc command string with sentinel surface ids.
/// Immutable once constructed; equality and hashing cover all components.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskKey {
    pub source_path: String,
    pub window: SurfaceId,
    pub view: SurfaceId,
}

impl TaskKey {
    /// Key for a run initiated from a source file open in a surface.
    pub fn for_file(path: impl Into<String>, window: SurfaceId, view: SurfaceId) -> Self {
        Self {
            source_path: path.into(),
            window,
            view,
        }
    }

    /// Key for an ad-hoc invocation (e.g. a shell string typed by the
    /// user); carries no originating surface.
    pub fn ad_hoc(command: impl Into<String>) -> Self {
        Self {
            source_path: command.into(),
            window: SurfaceId::NONE,
            view: SurfaceId::NONE,
        }
    }

    /// Short human-readable label, used in kill-confirmation prompts.
    pub fn label(&self) -> String {
        if self.view.is_none() {
            let mut s: String = self.source_path.chars().take(32).collect();
            if s.len() < self.source_path.len() {
                s.push('\u{2026}');
            }
            s
        } else {
            std::path::Path::new(&self.source_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.source_path.clone())
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.source_path, self.window, self.view)
    }
}

/// How the command line should be interpreted when spawning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLine {
    /// A pre-tokenized argument vector; the first element is the program.
    Args(Vec<String>),
    /// A single string handed to the platform shell (`sh -c` / `cmd /C`).
    Shell(String),
}

impl CommandLine {
    /// Printable form for headers and spawn-failure reports.
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(s) => s.clone(),
            CommandLine::Args(args) => args
                .iter()
                .map(|a| {
                    if a.contains(' ') {
                        format!("\"{a}\"")
                    } else {
                        a.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Everything needed to start (and later re-start) one task process.
///
/// Owned by the multiplexer registry once a spawn is accepted; the process
/// runner receives a copy so later edits cannot race a live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub command: CommandLine,
    /// Environment overrides merged onto the ambient environment; values
    /// are `$VAR` / `${VAR}` expanded before being applied.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// Name of the output encoding (e.g. "utf-8").
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Two-capture pattern locating `(file, line)` references in failure
    /// output. Empty string disables extraction.
    #[serde(default)]
    pub file_regex: String,
    /// Carried for persistence parity; not interpreted by the core.
    #[serde(default)]
    pub line_regex: String,
    /// Replacement `PATH` for the child (variable-expanded).
    #[serde(default)]
    pub path_override: Option<String>,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl Invocation {
    pub fn new(command: CommandLine, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
            encoding: default_encoding(),
            file_regex: String::new(),
            line_regex: String::new(),
            path_override: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_equal_iff_all_components_equal() {
        let a = TaskKey::for_file("/p/a.py", SurfaceId(1), SurfaceId(2));
        let b = TaskKey::for_file("/p/a.py", SurfaceId(1), SurfaceId(2));
        let c = TaskKey::for_file("/p/a.py", SurfaceId(1), SurfaceId(3));
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        map.insert(c.clone(), 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&b], 1);
    }

    #[test]
    fn ad_hoc_key_uses_sentinel_surfaces() {
        let k = TaskKey::ad_hoc("ls -la /tmp");
        assert_eq!(k.window, SurfaceId::NONE);
        assert_eq!(k.view, SurfaceId::NONE);
        assert!(k.view.is_none());
    }

    #[test]
    fn ad_hoc_label_truncates() {
        let k = TaskKey::ad_hoc("x".repeat(64));
        let label = k.label();
        assert!(label.chars().count() == 33);
        assert!(label.ends_with('\u{2026}'));
    }

    #[test]
    fn file_label_is_basename() {
        let k = TaskKey::for_file("/proj/sub/fail.py", SurfaceId(1), SurfaceId(2));
        assert_eq!(k.label(), "fail.py");
    }

    #[test]
    fn invocation_round_trips_through_serde() {
        let mut inv = Invocation::new(
            CommandLine::Args(vec!["python".into(), "-u".into(), "a.py".into()]),
            "/proj",
        );
        inv.env.insert("PYTHONPATH".into(), "/proj/lib".into());
        inv.file_regex = r#"File "(.*)", line (\d+)"#.into();

        let toml = toml::to_string(&inv).unwrap();
        let back: Invocation = toml::from_str(&toml).unwrap();
        assert_eq!(inv, back);
    }

    #[test]
    fn shell_command_displays_verbatim() {
        let c = CommandLine::Shell("echo 'a b'".into());
        assert_eq!(c.display(), "echo 'a b'");
        let c = CommandLine::Args(vec!["echo".into(), "a b".into()]);
        assert_eq!(c.display(), "echo \"a b\"");
    }
}
