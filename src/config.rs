// src/config.rs

//! Runtime settings, loaded from an optional `Taskmux.toml`.
//!
//! Every field has a default so a missing file or an empty table is valid;
//! [`load_and_validate`] is the entry point the binary uses.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{Result, TaskmuxError};

/// Default two-capture pattern for Python-style tracebacks, applied when an
/// invocation supplies none and the command looks like Python.
pub const PYTHON_FILE_REGEX: &str = r#"(?m)^[ ]*File "(.+?)", line ([0-9]+)"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Ask before killing a live process on `stop` / replacement spawn.
    pub confirm_terminate: bool,
    /// Cadence of the orphan sweep while any process is live.
    pub reconcile_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when waiting out a
    /// terminated process.
    pub kill_grace_ms: u64,
    /// Bounded read size for the output reader loops.
    pub read_chunk_bytes: usize,
    /// Encoding assumed when an invocation does not name one.
    pub default_encoding: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confirm_terminate: true,
            reconcile_interval_ms: 1000,
            kill_grace_ms: 2000,
            read_chunk_bytes: 32 * 1024,
            default_encoding: "utf-8".to_string(),
        }
    }
}

/// Load settings from `path`, or defaults when the file does not exist.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let settings = if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)?
    } else {
        Settings::default()
    };
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.reconcile_interval_ms == 0 {
        return Err(TaskmuxError::Config(
            "reconcile_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if settings.read_chunk_bytes == 0 {
        return Err(TaskmuxError::Config(
            "read_chunk_bytes must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let s = load_and_validate("/no/such/Taskmux.toml").unwrap();
        assert!(s.confirm_terminate);
        assert_eq!(s.reconcile_interval_ms, 1000);
        assert_eq!(s.read_chunk_bytes, 32 * 1024);
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let s: Settings = toml::from_str("confirm_terminate = false\n").unwrap();
        assert!(!s.confirm_terminate);
        assert_eq!(s.kill_grace_ms, 2000);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Taskmux.toml");
        std::fs::write(&path, "reconcile_interval_ms = 0\n").unwrap();
        let err = load_and_validate(&path).unwrap_err();
        assert!(matches!(err, TaskmuxError::Config(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res: std::result::Result<Settings, _> = toml::from_str("not_a_key = 1\n");
        assert!(res.is_err());
    }
}
