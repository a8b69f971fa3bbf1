//! Application configuration.
//!
//! Loaded in layers: built-in defaults, then the TOML config file, then
//! `CODEPOD__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerRuntime, RuntimeType};
use crate::session::{EditorSpec, ProvisionMode, ReadinessConfig, SessionServiceConfig};
use crate::workspace::GitProvisioner;

pub const APP_NAME: &str = "codepod";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub container: ContainerRuntimeConfig,
    pub editor: EditorConfig,
    pub readiness: ReadinessSettings,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Orchestrator HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host name used in session access URLs.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Base directory for workspaces. Defaults to `<data_dir>/workspaces`.
    pub workspace_root: Option<String>,
    pub preferred_port: u16,
    pub provision_mode: ProvisionMode,
    /// Unset means unlimited.
    pub max_sessions: Option<usize>,
    pub stop_timeout_seconds: u32,
    /// Limit on each container runtime call.
    pub runtime_timeout_seconds: u64,
    pub logs_tail_lines: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            preferred_port: 41820,
            provision_mode: ProvisionMode::Host,
            max_sessions: None,
            stop_timeout_seconds: 10,
            runtime_timeout_seconds: 60,
            logs_tail_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    pub binary: Option<String>,
}

impl ContainerRuntimeConfig {
    pub fn build_runtime(&self) -> ContainerRuntime {
        match (self.runtime, &self.binary) {
            (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
            (Some(rt), None) => ContainerRuntime::with_type(rt),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary.clone()),
            (None, None) => ContainerRuntime::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub image: String,
    pub container_port: u16,
    pub workspace_mount: String,
    pub args: Vec<String>,
    pub entrypoint: Option<String>,
    /// Editor launch command used when the container clones the repository.
    pub launcher: String,
    pub env: HashMap<String, String>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        let spec = EditorSpec::default();
        Self {
            image: spec.image,
            container_port: spec.container_port,
            workspace_mount: spec.workspace_mount,
            args: spec.args,
            entrypoint: spec.entrypoint,
            launcher: spec.launcher,
            env: spec.env,
        }
    }
}

impl From<&EditorConfig> for EditorSpec {
    fn from(cfg: &EditorConfig) -> Self {
        Self {
            image: cfg.image.clone(),
            container_port: cfg.container_port,
            workspace_mount: cfg.workspace_mount.clone(),
            args: cfg.args.clone(),
            entrypoint: cfg.entrypoint.clone(),
            launcher: cfg.launcher.clone(),
            env: cfg.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub attempts: u32,
    pub interval_ms: u64,
    pub host: String,
    pub path: String,
    pub request_timeout_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_ms: 1000,
            host: "127.0.0.1".to_string(),
            path: "/".to_string(),
            request_timeout_ms: 2000,
        }
    }
}

impl From<&ReadinessSettings> for ReadinessConfig {
    fn from(cfg: &ReadinessSettings) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            interval: Duration::from_millis(cfg.interval_ms),
            host: cfg.host.clone(),
            path: cfg.path.clone(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: String,
    /// Shallow clone depth; 0 clones full history.
    pub depth: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            depth: 1,
        }
    }
}

impl GitConfig {
    pub fn build_provisioner(&self) -> GitProvisioner {
        GitProvisioner::new(self.binary.clone(), self.clone_depth())
    }

    /// `None` when the full history is wanted.
    pub fn clone_depth(&self) -> Option<u32> {
        (self.depth > 0).then_some(self.depth)
    }
}

impl AppConfig {
    /// Resolve the session service settings against the data directory.
    pub fn session_service_config(&self, data_dir: &Path) -> Result<SessionServiceConfig> {
        let workspace_root = match self.sessions.workspace_root {
            Some(ref root) => expand_str_path(root)?,
            None => data_dir.join("workspaces"),
        };
        Ok(SessionServiceConfig {
            editor: EditorSpec::from(&self.editor),
            workspace_root,
            preferred_port: self.sessions.preferred_port,
            provision_mode: self.sessions.provision_mode,
            public_host: self.server.public_host.clone(),
            max_sessions: self.sessions.max_sessions,
            stop_timeout_seconds: self.sessions.stop_timeout_seconds,
            runtime_timeout: Duration::from_secs(self.sessions.runtime_timeout_seconds),
            clone_depth: self.git.clone_depth(),
            logs_tail_lines: self.sessions.logs_tail_lines,
        })
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl std::fmt::Display for AppPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

/// Load the layered configuration. A missing config file is not an error.
pub fn load_config(config_file: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sessions.preferred_port, 41820);
        assert_eq!(config.sessions.provision_mode, ProvisionMode::Host);
        assert_eq!(config.editor.image, "codercom/code-server:latest");
        assert_eq!(config.git.depth, 1);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[sessions]
preferred_port = 50000
provision_mode = "container"
max_sessions = 4

[editor]
image = "ghcr.io/example/editor:1"
args = ["--auth", "none"]

[container]
runtime = "podman"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sessions.preferred_port, 50000);
        assert_eq!(config.sessions.provision_mode, ProvisionMode::Container);
        assert_eq!(config.sessions.max_sessions, Some(4));
        assert_eq!(config.editor.image, "ghcr.io/example/editor:1");
        assert_eq!(config.editor.args, vec!["--auth", "none"]);
        assert_eq!(config.container.runtime, Some(RuntimeType::Podman));
        // Untouched keys keep their defaults
        assert_eq!(config.editor.container_port, 8080);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for codepod"));

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.public_host, "localhost");
        assert_eq!(config.readiness.attempts, 10);
    }

    #[test]
    fn service_config_resolves_workspace_root() {
        let config = AppConfig::default();
        let service = config
            .session_service_config(Path::new("/var/lib/codepod"))
            .unwrap();
        assert_eq!(
            service.workspace_root,
            PathBuf::from("/var/lib/codepod/workspaces")
        );
        assert_eq!(service.public_host, "localhost");
        assert_eq!(service.editor.workspace_mount, "/home/coder/project");

        let mut config = AppConfig::default();
        config.sessions.workspace_root = Some("/srv/pods".to_string());
        let service = config.session_service_config(Path::new("/unused")).unwrap();
        assert_eq!(service.workspace_root, PathBuf::from("/srv/pods"));
    }

    #[test]
    fn service_config_carries_runtime_limit_and_clone_depth() {
        let service = AppConfig::default()
            .session_service_config(Path::new("/unused"))
            .unwrap();
        assert_eq!(service.runtime_timeout, Duration::from_secs(60));
        assert_eq!(service.clone_depth, Some(1));

        let mut config = AppConfig::default();
        config.sessions.runtime_timeout_seconds = 5;
        config.git.depth = 0;
        let service = config.session_service_config(Path::new("/unused")).unwrap();
        assert_eq!(service.runtime_timeout, Duration::from_secs(5));
        assert_eq!(service.clone_depth, None);
    }

    #[test]
    fn readiness_settings_convert_to_durations() {
        let settings = ReadinessSettings {
            attempts: 0,
            interval_ms: 250,
            ..Default::default()
        };
        let readiness = ReadinessConfig::from(&settings);
        assert_eq!(readiness.attempts, 1);
        assert_eq!(readiness.interval, Duration::from_millis(250));
    }
}
