//! Session workspaces on the host.
//!
//! Each session owns `<workspace_root>/<session_id>`; the provisioner clones
//! the requested repository into it and removes it again on teardown.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

/// Errors from workspace provisioning.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The fetch command ran but failed.
    #[error("fetching {source_ref} failed: {message}")]
    FetchFailed { source_ref: String, message: String },

    /// Destination already holds content.
    #[error("workspace {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Materializes repository contents into session directories.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Fetch `source_ref` into `destination`, which must not exist yet.
    async fn provision(&self, source_ref: &str, destination: &Path) -> Result<(), WorkspaceError>;

    /// Remove `destination`. Discarding a missing directory succeeds.
    async fn discard(&self, destination: &Path) -> Result<(), WorkspaceError>;
}

/// Directory owned by a session under the workspace root.
pub fn session_dir(workspace_root: &Path, session_id: &str) -> PathBuf {
    workspace_root.join(session_id)
}

/// Provisioner that shells out to `git clone`.
#[derive(Debug, Clone)]
pub struct GitProvisioner {
    binary: String,
    /// Shallow clone depth; `None` clones full history.
    depth: Option<u32>,
}

impl Default for GitProvisioner {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            depth: Some(1),
        }
    }
}

impl GitProvisioner {
    pub fn new(binary: impl Into<String>, depth: Option<u32>) -> Self {
        Self {
            binary: binary.into(),
            depth: depth.filter(|d| *d > 0),
        }
    }

    fn clone_args(&self, source_ref: &str, destination: &Path) -> Vec<String> {
        let mut args = vec!["clone".to_string(), "--quiet".to_string()];
        if let Some(depth) = self.depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        // `--` keeps a hostile reference from being parsed as an option
        args.push("--".to_string());
        args.push(source_ref.to_string());
        args.push(destination.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitProvisioner {
    async fn provision(&self, source_ref: &str, destination: &Path) -> Result<(), WorkspaceError> {
        if tokio::fs::try_exists(destination)
            .await
            .map_err(|e| WorkspaceError::io(destination, e))?
        {
            return Err(WorkspaceError::AlreadyExists(destination.to_path_buf()));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::io(parent, e))?;
        }

        debug!("Cloning {} into {}", source_ref, destination.display());
        let output = Command::new(&self.binary)
            .args(self.clone_args(source_ref, destination))
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| WorkspaceError::FetchFailed {
                source_ref: source_ref.to_string(),
                message: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::FetchFailed {
                source_ref: source_ref.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        info!("Cloned {} into {}", source_ref, destination.display());
        Ok(())
    }

    async fn discard(&self, destination: &Path) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(destination).await {
            Ok(()) => {
                debug!("Removed workspace {}", destination.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(destination, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_args_are_shallow_and_option_safe() {
        let git = GitProvisioner::default();
        let args = git.clone_args("https://example.com/demo.git", Path::new("/ws/abc"));
        assert_eq!(
            args,
            vec![
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--",
                "https://example.com/demo.git",
                "/ws/abc"
            ]
        );

        let full = GitProvisioner::new("git", Some(0));
        assert!(
            !full
                .clone_args("repo", Path::new("/ws/x"))
                .contains(&"--depth".to_string())
        );
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dir = session_dir(root.path(), "session-1");
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();

        let git = GitProvisioner::default();
        git.discard(&dir).await.unwrap();
        assert!(!dir.exists());
        git.discard(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn provision_refuses_existing_destination() {
        let root = tempfile::tempdir().unwrap();
        let git = GitProvisioner::default();
        let err = git
            .provision("https://example.com/demo.git", root.path())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn provision_reports_missing_git_binary() {
        let root = tempfile::tempdir().unwrap();
        let git = GitProvisioner::new("/nonexistent/codepod-git", Some(1));
        let err = git
            .provision("https://example.com/demo.git", &root.path().join("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::FetchFailed { .. }));
    }
}
