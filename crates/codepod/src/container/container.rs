//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new port mapping.
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Declarative description of a container process.
///
/// Building a config never touches the runtime; it is handed to
/// `create_container`, which creates the container without starting it.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<String>,
    /// Command (arguments passed to the entrypoint).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Reject values the runtime CLI would misread.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        if let Some(ref entrypoint) = self.entrypoint
            && entrypoint.trim().is_empty()
        {
            return Err(ContainerError::InvalidInput(
                "entrypoint cannot be empty".to_string(),
            ));
        }

        for key in self.env.keys() {
            validate_env_key(key)?;
        }
        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for mapping in &self.ports {
            if mapping.host_port == 0 || mapping.container_port == 0 {
                return Err(ContainerError::InvalidInput(format!(
                    "port mapping {}:{} must use non-zero ports",
                    mapping.host_port, mapping.container_port
                )));
            }
        }

        for (host_path, container_path) in &self.volumes {
            validate_mount_path("host", host_path)?;
            validate_mount_path("container", container_path)?;
            validate_container_path(container_path)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the image entrypoint.
    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a volume mount.
    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Coarse container status as reported by `inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container has exited.
    Exited,
    /// Container is dead.
    Dead,
    /// Unknown state.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    /// Whether the process is no longer running and will not come back by itself.
    pub fn has_exited(&self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" | "stopped" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        })
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspection {
    pub status: ContainerStatus,
    /// Exit code, meaningful once the container has exited.
    pub exit_code: Option<i64>,
    /// Runtime-reported error string (empty strings are dropped).
    pub error: Option<String>,
}

impl ContainerInspection {
    /// Go template passed to `inspect --format`; fields are separated by `|`.
    pub(crate) const FORMAT: &'static str = "{{.State.Status}}|{{.State.ExitCode}}|{{.State.Error}}";

    pub fn running() -> Self {
        Self {
            status: ContainerStatus::Running,
            exit_code: None,
            error: None,
        }
    }

    pub fn exited(exit_code: i64) -> Self {
        Self {
            status: ContainerStatus::Exited,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    /// Parse the output produced by [`Self::FORMAT`].
    pub fn parse(output: &str) -> ContainerResult<Self> {
        let line = output.trim().trim_matches('"');
        if line.is_empty() {
            return Err(ContainerError::ParseError(
                "empty inspect output".to_string(),
            ));
        }

        let mut parts = line.splitn(3, '|');
        let status: ContainerStatus = parts
            .next()
            .unwrap_or_default()
            .parse()
            .unwrap_or_default();
        let exit_code = match parts.next().map(str::trim) {
            Some("") | None => None,
            Some(code) => Some(code.parse::<i64>().map_err(|e| {
                ContainerError::ParseError(format!("invalid exit code '{}': {}", code, e))
            })?),
        };
        let error = parts
            .next()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(ToString::to_string);

        Ok(Self {
            status,
            exit_code,
            error,
        })
    }

    /// Human-readable exit description for logs.
    pub fn exit_detail(&self) -> String {
        match (&self.exit_code, &self.error) {
            (Some(code), Some(err)) => format!("exit code {} ({})", code, err),
            (Some(code), None) => format!("exit code {}", code),
            (None, Some(err)) => err.clone(),
            (None, None) => self.status.to_string(),
        }
    }
}

/// Check a value that is passed to the runtime CLI as a single argument.
///
/// Arguments never go through a shell, so the checks only keep values from
/// being read as options or splitting into extra fields.
fn check_arg(
    kind: &str,
    value: &str,
    max_len: usize,
    allowed: impl Fn(char) -> bool,
) -> ContainerResult<()> {
    if value.is_empty() {
        return Err(ContainerError::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if value.len() > max_len {
        return Err(ContainerError::InvalidInput(format!(
            "{} is longer than {} characters",
            kind, max_len
        )));
    }
    if value.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "{} '{}' cannot start with '-'",
            kind, value
        )));
    }
    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} '{}' contains {:?}",
            kind, value, bad
        )));
    }
    Ok(())
}

/// Validate an image reference such as `ghcr.io/acme/editor:1` or `name@sha256:..`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    check_arg("image", image, 256, |c| {
        c.is_ascii_alphanumeric() || "./-_:@".contains(c)
    })?;
    if image.starts_with('.') || image.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "image '{}' is not a valid reference",
            image
        )));
    }
    Ok(())
}

/// Validate a container name or ID.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    check_arg("container name", name, 128, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    })
}

fn validate_env_key(key: &str) -> ContainerResult<()> {
    check_arg("environment key", key, 256, |c| {
        c.is_ascii_alphanumeric() || c == '_'
    })?;
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "environment key '{}' cannot start with a digit",
            key
        )));
    }
    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    check_arg("label key", key, 256, |c| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
    })
}

/// Validate one side of a `-v host:container` mount.
fn validate_mount_path(side: &str, path: &str) -> ContainerResult<()> {
    // ':' would split the mount spec into extra fields
    if path.is_empty() || path.contains([':', '\0', '\n']) {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path {:?} is invalid",
            side, path
        )));
    }
    Ok(())
}

/// Paths inside the container must be absolute.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "container path {:?} must be absolute",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_references() {
        assert!(validate_image_name("codercom/code-server:latest").is_ok());
        assert!(validate_image_name("ghcr.io/acme/editor@sha256:abc123").is_ok());

        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("--privileged").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn container_names_and_ids() {
        assert!(validate_container_name("codepod-1a2b3c4d").is_ok());
        assert!(validate_container_name("4f3c2b1a0e9d").is_ok());

        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn env_and_label_keys() {
        assert!(validate_env_key("CODEPOD_SOURCE_REF").is_ok());
        assert!(validate_env_key("123VAR").is_err());
        assert!(validate_env_key("MY-VAR").is_err());

        assert!(validate_label_key("dev.codepod.session").is_ok());
        assert!(validate_label_key("bad key").is_err());
    }

    #[test]
    fn mount_paths() {
        assert!(validate_mount_path("host", "/var/lib/codepod/workspaces/abc").is_ok());
        assert!(validate_mount_path("host", "/a:/b").is_err());
        assert!(validate_mount_path("host", "").is_err());
        assert!(validate_container_path("relative/path").is_err());
        assert!(validate_container_path("/home/coder/project").is_ok());
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("codercom/code-server:latest")
            .name("codepod-1a2b3c4d")
            .env("CODEPOD_SESSION_ID", "abc")
            .port(41820, 8080)
            .volume("/tmp/ws/abc", "/home/coder/project")
            .workdir("/home/coder/project")
            .label("dev.codepod.session", "abc");
        assert!(config.validate().is_ok());

        let zero_port = ContainerConfig::new("ubuntu").port(0, 8080);
        assert!(zero_port.validate().is_err());

        let bad_workdir = ContainerConfig::new("ubuntu").workdir("project");
        assert!(bad_workdir.validate().is_err());
    }

    #[test]
    fn inspection_parses_running_container() {
        let inspection = ContainerInspection::parse("running|0|\n").unwrap();
        assert_eq!(inspection.status, ContainerStatus::Running);
        assert_eq!(inspection.exit_code, Some(0));
        assert!(inspection.error.is_none());
    }

    #[test]
    fn inspection_parses_exited_container_with_error() {
        let inspection = ContainerInspection::parse("exited|128|fatal: repository not found").unwrap();
        assert!(inspection.status.has_exited());
        assert_eq!(inspection.exit_code, Some(128));
        assert_eq!(
            inspection.exit_detail(),
            "exit code 128 (fatal: repository not found)"
        );
    }

    #[test]
    fn inspection_rejects_garbage() {
        assert!(ContainerInspection::parse("").is_err());
        assert!(ContainerInspection::parse("running|abc|").is_err());
        assert_eq!(
            ContainerInspection::parse("weird").unwrap().status,
            ContainerStatus::Unknown
        );
    }
}
