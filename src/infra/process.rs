//! Process liveness checks and external command execution
//!
//! Commands are always run from an argument vector, never through a shell.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::common::{Error, Result};

/// Answers whether a process still exists
pub trait ProcessLiveness: Send + Sync {
    /// `None` when liveness cannot be determined
    fn is_alive(&self, pid: u32) -> Option<bool>;
}

/// Liveness via signal 0
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLiveness;

impl ProcessLiveness for SystemLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> Option<bool> {
        let Ok(pid) = i32::try_from(pid) else {
            return None;
        };
        if pid <= 0 {
            return None;
        }
        // Signal 0 tests process existence without side effects
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return Some(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Some(false),
            // exists, owned by someone else
            Some(libc::EPERM) => Some(true),
            _ => None,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> Option<bool> {
        None
    }
}

/// This process followed by its ancestors, nearest first
///
/// Cleanup must never signal these, even when their command lines carry a
/// resource name. Ancestors beyond the direct parent are read from `/proc`
/// where it exists.
pub fn own_process_chain() -> Vec<u32> {
    let mut chain = vec![std::process::id()];
    #[cfg(unix)]
    {
        let mut pid = std::os::unix::process::parent_id();
        while pid > 1 && !chain.contains(&pid) {
            chain.push(pid);
            match parent_of(pid) {
                Some(parent) => pid = parent,
                None => break,
            }
        }
    }
    chain
}

#[cfg(unix)]
fn parent_of(pid: u32) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))?
        .trim()
        .parse()
        .ok()
}

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn ok(stdout: &str) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Non-empty trimmed stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs external tools such as docker, tmux, pgrep and kill
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Whether `program` can be found
    fn is_available(&self, program: &str) -> bool;

    /// Run `program` with `args` and capture its output
    ///
    /// A non-zero exit is not an error; a missing program is
    /// [`Error::ToolUnavailable`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolUnavailable(program.to_string())
                } else {
                    Error::command_failed(program, args, &e.to_string())
                }
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        assert_eq!(SystemLiveness.is_alive(std::process::id()), Some(true));
        assert_eq!(SystemLiveness.is_alive(0), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_chain_includes_parent() {
        let chain = own_process_chain();
        assert_eq!(chain[0], std::process::id());
        let parent = std::os::unix::process::parent_id();
        if parent > 1 {
            assert_eq!(chain[1], parent);
        }
        assert!(!chain.contains(&1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(SystemLiveness.is_alive(pid), Some(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = SystemCommandRunner;
        let out = runner
            .run("sh", &["-c".into(), "echo hi; echo err >&2; exit 3".into()])
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["hi"]);
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let runner = SystemCommandRunner;
        assert!(!runner.is_available("definitely-not-a-real-tool-xyz"));
        let err = runner
            .run("definitely-not-a-real-tool-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
    }
}
