//! Version-control transport.
//!
//! [`GitTransport`] is the seam the mirror talks through; [`GitCli`] drives the
//! `git` executable. Every command runs with system and global git config
//! disabled and terminal prompts off, so behaviour does not depend on the host.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ols_core::CommitId;

use crate::error::{io_err, MirrorError};
use crate::mirror::AuthorIdentity;

/// Clone/fetch/pull primitives against a single branch of a single remote.
pub trait GitTransport: Send + Sync {
    /// Shallow (depth 1), single-branch clone of `branch` into `dir`.
    fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), MirrorError>;

    /// Fetch the remote tip of `branch` into `refs/remotes/origin/<branch>`
    /// without touching the working tree.
    ///
    /// Unlike the clone, fetches are not depth-limited: a depth-1 fetch would
    /// cut the new tip off from the local history and no fast-forward could
    /// follow.
    fn fetch_branch(&self, dir: &Path, branch: &str) -> Result<(), MirrorError>;

    /// Fast-forward `branch` to `refs/remotes/origin/<branch>`; never merges.
    fn pull_fast_forward(
        &self,
        dir: &Path,
        branch: &str,
        identity: &AuthorIdentity,
    ) -> Result<(), MirrorError>;

    /// Resolve `reference` to the commit it points at.
    fn resolve_ref(&self, dir: &Path, reference: &str) -> Result<CommitId, MirrorError>;
}

/// [`GitTransport`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `git` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, workdir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    fn fetch_command(&self, dir: &Path, branch: &str) -> Command {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        let mut cmd = self.command(Some(dir));
        cmd.args(["fetch", "--no-tags", "origin"]).arg(refspec);
        cmd
    }

    fn output(&self, mut cmd: Command, context: &Path) -> Result<Output, MirrorError> {
        tracing::debug!("running {}", describe(&cmd));
        cmd.output().map_err(|e| io_err(context, e))
    }
}

impl GitTransport for GitCli {
    fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), MirrorError> {
        let mut cmd = self.command(None);
        cmd.args(["clone", "--depth", "1", "--single-branch", "--no-tags", "--branch"])
            .arg(branch)
            .arg(url)
            .arg(dir);
        let output = self.output(cmd, dir)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MirrorError::Network {
                operation: "clone",
                details: stderr_of(&output),
            })
        }
    }

    fn fetch_branch(&self, dir: &Path, branch: &str) -> Result<(), MirrorError> {
        let cmd = self.fetch_command(dir, branch);
        let output = self.output(cmd, dir)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MirrorError::Network {
                operation: "fetch",
                details: stderr_of(&output),
            })
        }
    }

    fn pull_fast_forward(
        &self,
        dir: &Path,
        branch: &str,
        identity: &AuthorIdentity,
    ) -> Result<(), MirrorError> {
        let mut cmd = self.command(Some(dir));
        cmd.arg("-c")
            .arg(format!("user.name={}", identity.name))
            .arg("-c")
            .arg(format!("user.email={}", identity.email))
            .args(["merge", "--ff-only", "--no-edit"])
            .arg(format!("refs/remotes/origin/{branch}"));
        let output = self.output(cmd, dir)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if is_non_fast_forward(&stderr) {
            Err(MirrorError::NonFastForward {
                branch: branch.to_string(),
                details: stderr,
            })
        } else {
            Err(MirrorError::CommandFailed {
                command: format!("git merge --ff-only origin/{branch}"),
                stderr,
            })
        }
    }

    fn resolve_ref(&self, dir: &Path, reference: &str) -> Result<CommitId, MirrorError> {
        let mut cmd = self.command(Some(dir));
        cmd.args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{reference}^{{commit}}"));
        let output = self.output(cmd, dir)?;
        if !output.status.success() {
            return Err(MirrorError::RefNotFound {
                reference: reference.to_string(),
            });
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            return Err(MirrorError::RefNotFound {
                reference: reference.to_string(),
            });
        }
        Ok(CommitId(sha))
    }
}

fn is_non_fast_forward(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not possible to fast-forward")
        || lower.contains("unrelated histories")
        || lower.contains("diverging branches")
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}
