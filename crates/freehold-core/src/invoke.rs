//! Execution wrapper for the external kernel userland.
//!
//! Every side effect on loop devices, MD arrays, and dm-crypt mappings goes
//! through [`ToolInvoker`] so orchestration logic stays testable against fake
//! binaries and deterministic stdout parsing.

use crate::error::{FreeholdError, FreeholdResult};
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Binaries that must resolve before any environment mutation is attempted.
pub const REQUIRED_TOOLS: &[&str] = &["cryptsetup", "mdadm", "mkfs.f2fs"];

/// Directories searched when a tool is not on `PATH` (root shells often lack
/// the sbin entries).
const KNOWN_TOOL_DIRS: &[&str] = &["/usr/sbin", "/usr/bin", "/sbin", "/bin", "/usr/local/sbin"];

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ToolOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Abstraction over external command execution.
pub trait ToolInvoker {
    /// Run `tool` with `args`, capturing stdout/stderr and the exit status.
    /// A spawn failure is an error; a non-zero exit is not.
    fn run(&self, tool: &str, args: &[&str]) -> FreeholdResult<ToolOutput>;

    /// Resolve `tool` to an executable path, if it exists.
    fn which(&self, tool: &str) -> Option<PathBuf> {
        find_in_path(tool).or_else(|| find_in_known_dirs(tool))
    }

    /// Run `tool` and convert a non-zero exit into [`FreeholdError::ToolFailure`].
    fn run_checked(&self, tool: &str, args: &[&str]) -> FreeholdResult<ToolOutput> {
        let output = self.run(tool, args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(FreeholdError::ToolFailure {
                tool: tool.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                exit: output.status,
                stderr: output.stderr_trimmed().to_string(),
            })
        }
    }

    /// Verify that every required binary resolves.
    fn preflight(&self) -> FreeholdResult<()> {
        for tool in REQUIRED_TOOLS {
            if self.which(tool).is_none() {
                return Err(FreeholdError::PreflightFailure {
                    missing_tool: tool.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Invoker backed by the host system: resolves binaries via `PATH` (then the
/// usual sbin locations) and spawns them with piped output.
#[derive(Debug, Clone, Default)]
pub struct SystemInvoker;

impl ToolInvoker for SystemInvoker {
    fn run(&self, tool: &str, args: &[&str]) -> FreeholdResult<ToolOutput> {
        let binary = self
            .which(tool)
            .ok_or_else(|| FreeholdError::PreflightFailure {
                missing_tool: tool.to_string(),
            })?;

        let output = Command::new(&binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}

fn find_in_known_dirs(binary: &str) -> Option<PathBuf> {
    KNOWN_TOOL_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(binary))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let out = SystemInvoker.run("echo", &["hello"]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[test]
    fn run_checked_surfaces_stderr() {
        let err = SystemInvoker
            .run_checked("ls", &["/freehold-does-not-exist-42"])
            .unwrap_err();
        match err {
            FreeholdError::ToolFailure { tool, exit, stderr, .. } => {
                assert_eq!(tool, "ls");
                assert_ne!(exit, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn which_finds_shell() {
        assert!(SystemInvoker.which("sh").is_some());
        assert!(SystemInvoker.which("freehold-no-such-tool-42").is_none());
    }

    #[test]
    fn missing_binary_is_a_preflight_failure() {
        let err = SystemInvoker
            .run("freehold-no-such-tool-42", &[])
            .unwrap_err();
        assert!(matches!(err, FreeholdError::PreflightFailure { .. }));
    }
}
