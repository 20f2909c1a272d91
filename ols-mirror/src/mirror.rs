//! The local mirror of one remote branch.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use ols_core::config::AUTHOR_EMAIL;
use ols_core::{CommitId, Config, Mode};

use crate::error::{io_err, MirrorError};
use crate::transport::GitTransport;

/// Identity attached to pulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorIdentity {
    pub name: String,
    pub email: String,
}

/// What [`VersionMirror::ensure_mirrored`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The directory was absent or empty and a fresh clone was made.
    Cloned,
    /// An existing checkout was found and fetched.
    Fetched,
}

/// Local and remote-tracking tips of the mirrored branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorRefs {
    pub local: CommitId,
    pub remote: CommitId,
}

impl MirrorRefs {
    /// Plain inequality: a local tip ahead of the remote also counts.
    pub fn needs_update(&self) -> bool {
        self.local != self.remote
    }
}

/// Read-only working copy of `branch` from `remote_url`, kept at `dir`.
pub struct VersionMirror {
    transport: Arc<dyn GitTransport>,
    remote_url: String,
    dir: PathBuf,
    branch: String,
    identity: AuthorIdentity,
}

impl std::fmt::Debug for VersionMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionMirror")
            .field("remote_url", &self.remote_url)
            .field("dir", &self.dir)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl VersionMirror {
    pub fn new(
        transport: Arc<dyn GitTransport>,
        remote_url: impl Into<String>,
        dir: impl Into<PathBuf>,
        branch: impl Into<String>,
        identity: AuthorIdentity,
    ) -> Self {
        Self {
            transport,
            remote_url: remote_url.into(),
            dir: dir.into(),
            branch: branch.into(),
            identity,
        }
    }

    /// Build the mirror described by `config`; `None` in development mode.
    pub fn from_config(config: &Config, transport: Arc<dyn GitTransport>) -> Option<Self> {
        match &config.mode {
            Mode::Development { .. } => None,
            Mode::Production {
                repository,
                mirror_dir,
            } => Some(Self::new(
                transport,
                repository.clone(),
                mirror_dir.clone(),
                config.branch.clone(),
                AuthorIdentity {
                    name: config.author_name().to_string(),
                    email: AUTHOR_EMAIL.to_string(),
                },
            )),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// Make sure `dir` holds a checkout of the branch.
    ///
    /// Absent or empty → clone. Existing checkout → fetch. Anything else is
    /// refused with [`MirrorError::DirtyTargetDirectory`].
    pub fn ensure_mirrored(&self) -> Result<EnsureOutcome, MirrorError> {
        let meta = match fs::metadata(&self.dir) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(io_err(&self.dir, err)),
        };

        let Some(meta) = meta else {
            if let Some(parent) = self.dir.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            tracing::info!("cloning {} ({}) into {}", self.remote_url, self.branch, self.dir.display());
            self.transport
                .clone_branch(&self.remote_url, &self.dir, &self.branch)?;
            return Ok(EnsureOutcome::Cloned);
        };

        if !meta.is_dir() {
            return Err(MirrorError::DirtyTargetDirectory {
                path: self.dir.clone(),
            });
        }

        if self.dir.join(".git").exists() {
            tracing::info!("existing mirror at {}, fetching", self.dir.display());
            self.fetch_remote()?;
            return Ok(EnsureOutcome::Fetched);
        }

        if is_dir_empty(&self.dir)? {
            tracing::info!("cloning {} ({}) into empty {}", self.remote_url, self.branch, self.dir.display());
            self.transport
                .clone_branch(&self.remote_url, &self.dir, &self.branch)?;
            return Ok(EnsureOutcome::Cloned);
        }

        Err(MirrorError::DirtyTargetDirectory {
            path: self.dir.clone(),
        })
    }

    /// Fetch the remote tip without touching the working tree.
    pub fn fetch_remote(&self) -> Result<(), MirrorError> {
        self.transport.fetch_branch(&self.dir, &self.branch)
    }

    /// Current local and remote-tracking commits.
    pub fn resolve_refs(&self) -> Result<MirrorRefs, MirrorError> {
        let local = self
            .transport
            .resolve_ref(&self.dir, &format!("refs/heads/{}", self.branch))?;
        let remote = self
            .transport
            .resolve_ref(&self.dir, &format!("refs/remotes/origin/{}", self.branch))?;
        Ok(MirrorRefs { local, remote })
    }

    /// Current local commit.
    pub fn local_commit(&self) -> Result<CommitId, MirrorError> {
        self.transport
            .resolve_ref(&self.dir, &format!("refs/heads/{}", self.branch))
    }

    /// Fast-forward the working tree to the fetched remote tip.
    pub fn fast_forward_pull(&self) -> Result<(), MirrorError> {
        self.transport
            .pull_fast_forward(&self.dir, &self.branch, &self.identity)
    }

    /// One full update attempt: fetch, then fast-forward.
    pub fn update(&self) -> Result<(), MirrorError> {
        self.fetch_remote()?;
        self.fast_forward_pull()
    }
}

fn is_dir_empty(dir: &Path) -> Result<bool, MirrorError> {
    let mut entries = fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
        refs: Mutex<HashMap<String, CommitId>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl GitTransport for RecordingTransport {
        fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), MirrorError> {
            self.calls.lock().expect("calls").push(format!("clone {url} {branch}"));
            fs::create_dir_all(dir.join(".git")).expect("fake clone");
            Ok(())
        }

        fn fetch_branch(&self, _dir: &Path, branch: &str) -> Result<(), MirrorError> {
            self.calls.lock().expect("calls").push(format!("fetch {branch}"));
            Ok(())
        }

        fn pull_fast_forward(
            &self,
            _dir: &Path,
            branch: &str,
            identity: &AuthorIdentity,
        ) -> Result<(), MirrorError> {
            self.calls
                .lock()
                .expect("calls")
                .push(format!("pull {branch} as {}", identity.name));
            Ok(())
        }

        fn resolve_ref(&self, _dir: &Path, reference: &str) -> Result<CommitId, MirrorError> {
            self.refs
                .lock()
                .expect("refs")
                .get(reference)
                .cloned()
                .ok_or_else(|| MirrorError::RefNotFound {
                    reference: reference.to_string(),
                })
        }
    }

    fn mirror_at(dir: PathBuf, transport: Arc<RecordingTransport>) -> VersionMirror {
        VersionMirror::new(
            transport,
            "https://example.org/services.git",
            dir,
            "master",
            AuthorIdentity {
                name: "ols".into(),
                email: AUTHOR_EMAIL.into(),
            },
        )
    }

    #[test]
    fn absent_directory_is_cloned() {
        let root = TempDir::new().expect("root");
        let transport = Arc::new(RecordingTransport::default());
        let mirror = mirror_at(root.path().join("repo").join("green"), transport.clone());

        let outcome = mirror.ensure_mirrored().expect("ensure");
        assert_eq!(outcome, EnsureOutcome::Cloned);
        assert_eq!(
            transport.calls(),
            vec!["clone https://example.org/services.git master"]
        );
    }

    #[test]
    fn existing_checkout_is_fetched() {
        let root = TempDir::new().expect("root");
        fs::create_dir_all(root.path().join(".git")).expect("git dir");
        let transport = Arc::new(RecordingTransport::default());
        let mirror = mirror_at(root.path().to_path_buf(), transport.clone());

        assert_eq!(mirror.ensure_mirrored().expect("ensure"), EnsureOutcome::Fetched);
        assert_eq!(transport.calls(), vec!["fetch master"]);
    }

    #[test]
    fn empty_directory_is_cloned_into() {
        let root = TempDir::new().expect("root");
        let transport = Arc::new(RecordingTransport::default());
        let mirror = mirror_at(root.path().to_path_buf(), transport.clone());

        assert_eq!(mirror.ensure_mirrored().expect("ensure"), EnsureOutcome::Cloned);
    }

    #[test]
    fn dirty_directory_is_refused() {
        let root = TempDir::new().expect("root");
        fs::write(root.path().join("notes.txt"), "hand-placed").expect("write");
        let transport = Arc::new(RecordingTransport::default());
        let mirror = mirror_at(root.path().to_path_buf(), transport.clone());

        let err = mirror.ensure_mirrored().unwrap_err();
        assert!(matches!(err, MirrorError::DirtyTargetDirectory { .. }), "got: {err}");
        assert!(transport.calls().is_empty(), "no git command may run");
    }

    #[test]
    fn regular_file_target_is_refused() {
        let root = TempDir::new().expect("root");
        let file = root.path().join("green");
        fs::write(&file, "x").expect("write");
        let mirror = mirror_at(file, Arc::new(RecordingTransport::default()));

        assert!(matches!(
            mirror.ensure_mirrored(),
            Err(MirrorError::DirtyTargetDirectory { .. })
        ));
    }

    #[test]
    fn refs_compare_by_equality_only() {
        let root = TempDir::new().expect("root");
        let transport = Arc::new(RecordingTransport::default());
        transport
            .refs
            .lock()
            .expect("refs")
            .extend([
                ("refs/heads/master".to_string(), CommitId::from("aaa")),
                ("refs/remotes/origin/master".to_string(), CommitId::from("aaa")),
            ]);
        let mirror = mirror_at(root.path().to_path_buf(), transport.clone());

        let refs = mirror.resolve_refs().expect("refs");
        assert!(!refs.needs_update());

        transport.refs.lock().expect("refs").insert(
            "refs/remotes/origin/master".to_string(),
            CommitId::from("bbb"),
        );
        assert!(mirror.resolve_refs().expect("refs").needs_update());
    }

    #[test]
    fn update_fetches_then_pulls_with_identity() {
        let root = TempDir::new().expect("root");
        let transport = Arc::new(RecordingTransport::default());
        let mirror = mirror_at(root.path().to_path_buf(), transport.clone());

        mirror.update().expect("update");
        assert_eq!(transport.calls(), vec!["fetch master", "pull master as ols"]);
    }

    #[test]
    fn from_config_is_none_in_dev_mode() {
        let config = Config::from_vars([("OLS_DEV_MODE", "1")]).expect("config");
        assert!(VersionMirror::from_config(&config, Arc::new(RecordingTransport::default())).is_none());

        let config = Config::from_vars([
            ("OLS_REPO", "https://example.org/services.git"),
            ("OLS_INSTANCE_NAME", "edge-1"),
        ])
        .expect("config");
        let mirror = VersionMirror::from_config(&config, Arc::new(RecordingTransport::default()))
            .expect("production mirror");
        assert_eq!(mirror.branch(), "master");
        assert_eq!(mirror.dir(), Path::new("/app/repo/green"));
        assert_eq!(mirror.identity.name, "edge-1");
    }
}
