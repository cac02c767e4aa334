#![allow(dead_code)]

use taskmux::task::{CommandLine, Invocation, SurfaceId, TaskKey};

/// Builder for `Invocation` to simplify test setup.
pub struct InvocationBuilder {
    invocation: Invocation,
}

impl InvocationBuilder {
    pub fn args(args: &[&str]) -> Self {
        Self {
            invocation: Invocation::new(
                CommandLine::Args(args.iter().map(|s| s.to_string()).collect()),
                "/tmp",
            ),
        }
    }

    pub fn shell(cmd: &str) -> Self {
        Self {
            invocation: Invocation::new(CommandLine::Shell(cmd.to_string()), "/tmp"),
        }
    }

    pub fn working_dir(mut self, dir: &str) -> Self {
        self.invocation.working_dir = dir.into();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.invocation.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn file_regex(mut self, pattern: &str) -> Self {
        self.invocation.file_regex = pattern.to_string();
        self
    }

    pub fn encoding(mut self, encoding: &str) -> Self {
        self.invocation.encoding = encoding.to_string();
        self
    }

    pub fn build(self) -> Invocation {
        self.invocation
    }
}

/// A file-backed key with fixed surface ids, for tests that do not care
/// about the particular surfaces.
pub fn key_for(path: &str) -> TaskKey {
    TaskKey::for_file(path, SurfaceId(1), SurfaceId(2))
}
