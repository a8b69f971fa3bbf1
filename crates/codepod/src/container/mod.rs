//! Container runtime management module.
//!
//! Provides an async interface to supervise editor containers via the Docker
//! or Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{
    ContainerConfig, ContainerInspection, ContainerStatus, PortMapping, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use container::validate_container_name;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Supervision operations the session orchestrator relies on.
///
/// `create_container` only declares the process; `start_container` launches it.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    /// Returns `Ok(None)` when the container does not exist.
    async fn inspect_container(&self, container_id: &str)
    -> ContainerResult<Option<ContainerInspection>>;
    /// Stopping an unknown or already-stopped container succeeds.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> ContainerResult<Option<ContainerInspection>> {
        self.inspect_container(container_id).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        self.get_logs(container_id, tail).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Will fail at runtime with a clear command error
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary and return its raw output.
    async fn output(&self, command: &str, args: &[String]) -> ContainerResult<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::NoRuntimeAvailable
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    /// Run the runtime binary, failing on a non-zero exit, and return stdout.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = self.output(command, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.run("version", &["version".to_string()]).await
    }

    /// Build the CLI arguments for `create` from a validated config.
    fn create_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut owned_args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if let Some(ref entrypoint) = config.entrypoint {
            owned_args.push("--entrypoint".to_string());
            owned_args.push(entrypoint.clone());
        }

        for port in &config.ports {
            owned_args.push("-p".to_string());
            owned_args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for (host, container) in &config.volumes {
            owned_args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                owned_args.push(format!("{}:{}:Z", host, container));
            } else {
                owned_args.push(format!("{}:{}", host, container));
            }
        }

        // Sorted so the generated command line is stable
        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        let mut labels: Vec<_> = config.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            owned_args.push("-w".to_string());
            owned_args.push(workdir.clone());
        }

        owned_args.push(config.image.clone());
        owned_args.extend(config.command.iter().cloned());

        owned_args
    }

    /// Create (but do not start) a container.
    ///
    /// The configuration is validated before creating the container to prevent
    /// injection attacks and ensure all inputs are well-formed.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = self.create_args(config);
        let stdout = self.run("create", &args).await?;

        // The container ID is the last line; pulls may print progress before it
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| ContainerError::ParseError("create returned no container id".to_string()))
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.run("start", &["start".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    /// Inspect the container state.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn inspect_container(
        &self,
        container_id: &str,
    ) -> ContainerResult<Option<ContainerInspection>> {
        validate_container_name(container_id)?;

        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            ContainerInspection::FORMAT.to_string(),
            container_id.to_string(),
        ];
        match self.run("inspect", &args).await {
            Ok(stdout) => ContainerInspection::parse(&stdout).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stop a running container.
    ///
    /// Unknown containers are treated as already stopped.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(container_id)?;

        let mut owned_args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            owned_args.push("-t".to_string());
            owned_args.push(t.to_string());
        }
        owned_args.push(container_id.to_string());

        match self.run("stop", &owned_args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone, nothing to stop", container_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        match self.run("rm", &args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Get container logs (stdout and stderr combined).
    pub async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_name(container_id)?;

        let mut owned_args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            owned_args.push("--tail".to_string());
            owned_args.push(n.to_string());
        }
        owned_args.push(container_id.to_string());

        let output = self.output("logs", &owned_args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            if stderr.to_lowercase().contains("no such container") {
                return Err(ContainerError::ContainerNotFound(container_id.to_string()));
            }
            return Err(ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        // The logs command replays container stderr on our stderr
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(format!("{}{}", stdout, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful when docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    #[test]
    fn create_args_declare_process_without_starting_it() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let config = ContainerConfig::new("codercom/code-server:latest")
            .name("codepod-1234abcd")
            .entrypoint("/bin/sh")
            .port(41820, 8080)
            .volume("/data/ws/1234", "/home/coder/project")
            .env("B_VAR", "2")
            .env("A_VAR", "1")
            .workdir("/home/coder/project")
            .command(vec!["-c".to_string(), "echo hi".to_string()]);

        let args = runtime.create_args(&config);
        assert_eq!(args[0], "create");
        assert!(!args.contains(&"-d".to_string()));

        let joined = args.join(" ");
        assert!(joined.contains("--name codepod-1234abcd"));
        assert!(joined.contains("--entrypoint /bin/sh"));
        assert!(joined.contains("-p 41820:8080"));
        assert!(joined.contains("-v /data/ws/1234:/home/coder/project"));
        assert!(joined.contains("-e A_VAR=1 -e B_VAR=2"));
        assert!(joined.ends_with("codercom/code-server:latest -c echo hi"));
    }

    #[test]
    fn podman_volumes_get_selinux_label() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman);
        let config = ContainerConfig::new("editor").volume("/data/ws/1", "/workspace");
        let args = runtime.create_args(&config);
        assert!(args.contains(&"/data/ws/1:/workspace:Z".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_reports_no_runtime() {
        let runtime =
            ContainerRuntime::with_binary(RuntimeType::Docker, "/nonexistent/codepod-docker");
        let err = runtime.health_check().await.unwrap_err();
        assert!(matches!(err, ContainerError::NoRuntimeAvailable));
    }
}
