//! Local mirror of the test metadata repository
//!
//! Keeps a shallow clone under the configured path and moves it to
//! `origin/<branch>` with fetch + hard reset. Blocking libgit2 calls run
//! on the blocking pool under a wall-clock budget; cancellation therefore
//! takes effect between operations, not inside one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository, ResetType};
use tracing::{debug, info};
use walkdir::WalkDir;

use regtrack_config::{GIT_MAX_REPO_SIZE_BYTES, GIT_OPERATION_TIMEOUT_SECONDS, MetadataConfig};

use crate::error::{MetadataError, MetadataResult};

/// Manages the on-disk mirror of the metadata repository
#[derive(Clone)]
pub struct MirrorRepo {
    url: String,
    local_path: PathBuf,
    ssh_key_path: Option<PathBuf>,
    /// Shallow fetch depth; 0 means full history
    depth: i32,
}

impl MirrorRepo {
    /// Mirror handle from the process configuration
    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            url: config.git_repo_url.clone(),
            local_path: PathBuf::from(&config.git_local_path),
            ssh_key_path: config.git_ssh_key_path.as_ref().map(PathBuf::from),
            depth: regtrack_config::GIT_CLONE_DEPTH,
        }
    }

    /// Override the fetch depth (tests use 0 for local full clones)
    pub const fn with_depth(mut self, depth: i32) -> Self {
        self.depth = depth;
        self
    }

    /// The mirror's working-tree root
    pub fn root(&self) -> &Path {
        &self.local_path
    }

    /// Ensure the mirror exists and sits exactly at `origin/<branch>`
    ///
    /// Clones when the directory holds no repository; otherwise fetches the
    /// branch and hard-resets onto it. Returns the working-tree root.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unusable SSH key or an oversized mirror,
    /// `Timeout` when an operation outruns its budget, `Git` otherwise.
    pub async fn ensure_checkout(&self, branch: &str) -> MetadataResult<PathBuf> {
        self.validate_ssh_key()?;

        let this = self.clone();
        let branch = branch.to_string();
        let budget = Duration::from_secs(GIT_OPERATION_TIMEOUT_SECONDS);

        let update = tokio::task::spawn_blocking(move || this.checkout_blocking(&branch));
        let result = tokio::time::timeout(budget, update)
            .await
            .map_err(|_| MetadataError::Timeout {
                operation: "fetch/checkout".to_string(),
            })?
            .map_err(|e| MetadataError::Git(format!("git task failed: {e}")))??;

        self.enforce_size_limit()?;
        Ok(result)
    }

    fn checkout_blocking(&self, branch: &str) -> MetadataResult<PathBuf> {
        let repo = if self.local_path.join(".git").exists() {
            Repository::open(&self.local_path)
                .map_err(|e| MetadataError::Git(format!("open mirror: {e}")))?
        } else {
            info!(url = %self.url, path = %self.local_path.display(), "cloning metadata mirror");
            let mut builder = RepoBuilder::new();
            builder.fetch_options(self.fetch_options());
            builder.branch(branch);
            return builder
                .clone(&self.url, &self.local_path)
                .map(|_| self.local_path.clone())
                .map_err(|e| MetadataError::Git(format!("clone: {e}")));
        };

        {
            let mut remote = repo
                .find_remote("origin")
                .map_err(|e| MetadataError::Git(format!("find origin: {e}")))?;
            remote
                .fetch(&[branch], Some(&mut self.fetch_options()), None)
                .map_err(|e| MetadataError::Git(format!("fetch {branch}: {e}")))?;
        }

        let oid = repo
            .refname_to_id(&format!("refs/remotes/origin/{branch}"))
            .map_err(|e| MetadataError::Git(format!("resolve origin/{branch}: {e}")))?;
        let target = repo
            .find_object(oid, None)
            .map_err(|e| MetadataError::Git(format!("lookup {oid}: {e}")))?;

        repo.set_head_detached(oid)
            .map_err(|e| MetadataError::Git(format!("set head: {e}")))?;
        repo.reset(&target, ResetType::Hard, None)
            .map_err(|e| MetadataError::Git(format!("reset --hard origin/{branch}: {e}")))?;

        debug!(branch, %oid, "mirror updated");
        Ok(self.local_path.clone())
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let key_path = self.ssh_key_path.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            key_path.as_ref().map_or_else(Cred::default, |key| {
                Cred::ssh_key(username_from_url.unwrap_or("git"), None, key, None)
            })
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        if self.depth > 0 {
            options.depth(self.depth);
        }
        options
    }

    /// SSH private keys must be unreadable to group/other (mode 0600)
    fn validate_ssh_key(&self) -> MetadataResult<()> {
        let Some(key_path) = &self.ssh_key_path else {
            return Ok(());
        };

        let metadata = std::fs::metadata(key_path).map_err(|e| {
            MetadataError::Config(format!("SSH key {} unreadable: {e}", key_path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode() & 0o777;
            if mode != 0o600 {
                return Err(MetadataError::Config(format!(
                    "SSH key {} has mode {mode:o}, expected 600",
                    key_path.display()
                )));
            }
        }
        #[cfg(not(unix))]
        let _ = metadata;

        Ok(())
    }

    fn enforce_size_limit(&self) -> MetadataResult<()> {
        let mut total: u64 = 0;
        for entry in WalkDir::new(&self.local_path).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                total = total.saturating_add(entry.metadata().map(|m| m.len()).unwrap_or(0));
                if total > GIT_MAX_REPO_SIZE_BYTES {
                    return Err(MetadataError::Config(format!(
                        "mirror at {} exceeds the {GIT_MAX_REPO_SIZE_BYTES} byte limit",
                        self.local_path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    /// Build a source repository with one commit on `main`
    fn seed_source(dir: &Path) {
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .expect("git available");
            assert!(output.status.success(), "git {args:?}: {output:?}");
        };

        run(&["init", "-b", "main"]);
        std::fs::write(dir.join("test_sample.py"), "def test_one():\n    pass\n")
            .expect("write file");
        run(&["add", "."]);
        run(&["commit", "-m", "seed"]);
    }

    #[tokio::test]
    async fn clone_then_update_tracks_origin() {
        let source = tempfile::tempdir().expect("source dir");
        seed_source(source.path());

        let mirror_dir = tempfile::tempdir().expect("mirror dir");
        let mirror_path = mirror_dir.path().join("mirror");

        let mirror = MirrorRepo {
            url: source.path().to_string_lossy().into_owned(),
            local_path: mirror_path.clone(),
            ssh_key_path: None,
            depth: 0,
        };

        let root = mirror.ensure_checkout("main").await.expect("clone");
        assert!(root.join("test_sample.py").exists());

        // New commit upstream lands in the mirror on the next checkout
        std::fs::write(
            source.path().join("test_more.py"),
            "def test_two():\n    pass\n",
        )
        .expect("write");
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(source.path())
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .expect("git available");
            assert!(output.status.success());
        };
        run(&["add", "."]);
        run(&["commit", "-m", "more"]);

        let root = mirror.ensure_checkout("main").await.expect("update");
        assert!(root.join("test_more.py").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn loose_ssh_key_mode_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("dir");
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "not a real key").expect("write");
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let mirror = MirrorRepo {
            url: "git@example.com:org/tests.git".to_string(),
            local_path: dir.path().join("mirror"),
            ssh_key_path: Some(key),
            depth: 0,
        };

        let err = mirror.ensure_checkout("main").await.expect_err("must fail");
        assert!(matches!(err, MetadataError::Config(_)));
        assert!(!err.is_transient());
    }
}
