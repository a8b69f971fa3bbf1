//! Session service - orchestrates the editor container lifecycle.
//!
//! Creation walks a session through `Provisioning -> Starting -> Running`,
//! rolling back every acquired resource on failure. Deletion runs an ordered
//! list of best-effort teardown steps and always removes the registry entry.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::{ContainerConfig, ContainerResult, ContainerRuntimeApi};
use crate::ports::{PortAllocator, TcpPortAllocator};
use crate::workspace::{self, GitProvisioner, WorkspaceProvisioner};

use super::cleanup::{CleanupReport, CompensatingActions};
use super::error::{SessionError, SessionResult};
use super::models::{
    CreateSessionRequest, ProvisionMode, Session, SessionState, SessionSummary,
};
use super::readiness::{HttpReadinessProbe, ReadinessConfig, ReadinessOutcome, ReadinessProbe};
use super::registry::{InMemorySessionRegistry, SessionRegistry};

/// Prefix used for container names managed by this orchestrator.
const CONTAINER_NAME_PREFIX: &str = "codepod-";

/// Label carrying the session ID on every managed container.
const SESSION_LABEL: &str = "dev.codepod.session";

/// Default container image.
const DEFAULT_IMAGE: &str = "codercom/code-server:latest";

/// Default preferred host port.
const DEFAULT_PREFERRED_PORT: u16 = 41820;

/// Longest accepted source reference.
const MAX_SOURCE_REF_LEN: usize = 2048;

/// Shell snippet used when the container clones the repository itself.
/// `$@` is the editor launch command.
fn in_container_clone_script(depth: Option<u32>) -> String {
    let depth = depth
        .map(|d| format!("--depth {} ", d))
        .unwrap_or_default();
    format!(
        r#"git clone {}-- "$CODEPOD_SOURCE_REF" "$CODEPOD_WORKSPACE" && exec "$@""#,
        depth
    )
}

/// Run one container runtime call under a time limit.
async fn within<T>(
    bound: Duration,
    action: &str,
    call: impl Future<Output = ContainerResult<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(bound, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("{} did not finish within {:?}", action, bound)),
    }
}

/// How the editor container is launched.
#[derive(Debug, Clone)]
pub struct EditorSpec {
    /// Editor-server image.
    pub image: String,
    /// Port the editor listens on inside the container.
    pub container_port: u16,
    /// Where the workspace appears inside the container.
    pub workspace_mount: String,
    /// Arguments passed to the image entrypoint; the workspace mount is appended.
    pub args: Vec<String>,
    /// Optional entrypoint override (host provisioning only).
    pub entrypoint: Option<String>,
    /// Editor launch command used after an in-container clone.
    pub launcher: String,
    /// Extra environment for every session container.
    pub env: HashMap<String, String>,
}

impl Default for EditorSpec {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_port: 8080,
            workspace_mount: "/home/coder/project".to_string(),
            args: vec![
                "--bind-addr".to_string(),
                "0.0.0.0:8080".to_string(),
                "--auth".to_string(),
                "none".to_string(),
            ],
            entrypoint: None,
            launcher: "/usr/bin/entrypoint.sh".to_string(),
            env: HashMap::new(),
        }
    }
}

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub editor: EditorSpec,
    /// Base directory for session workspaces; each session gets `<root>/<id>`.
    pub workspace_root: PathBuf,
    /// Host port tried first for each new session.
    pub preferred_port: u16,
    pub provision_mode: ProvisionMode,
    /// Host name used to build access URLs.
    pub public_host: String,
    /// Upper bound on tracked sessions. `None` admits everything.
    pub max_sessions: Option<usize>,
    /// Grace period handed to `stop` before the runtime kills the container.
    pub stop_timeout_seconds: u32,
    /// Limit on each container runtime call (added on top of the stop grace period).
    pub runtime_timeout: Duration,
    /// Shallow clone depth for in-container provisioning; `None` clones full history.
    pub clone_depth: Option<u32>,
    /// Default number of log lines returned by `session_logs`.
    pub logs_tail_lines: u32,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            editor: EditorSpec::default(),
            workspace_root: std::env::temp_dir().join("codepod").join("workspaces"),
            preferred_port: DEFAULT_PREFERRED_PORT,
            provision_mode: ProvisionMode::Host,
            public_host: "localhost".to_string(),
            max_sessions: None,
            stop_timeout_seconds: 10,
            runtime_timeout: Duration::from_secs(60),
            clone_depth: Some(1),
            logs_tail_lines: 200,
        }
    }
}

/// Per-session coordination state that does not belong in the registry.
struct SessionHandle {
    /// Serializes create and delete for one session.
    lock: tokio::sync::Mutex<()>,
    /// Cancelled when the session is being deleted.
    cancel: CancellationToken,
    readiness: std::sync::Mutex<Option<JoinHandle<ReadinessOutcome>>>,
}

impl SessionHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            readiness: std::sync::Mutex::new(None),
        })
    }

    fn set_readiness(&self, task: JoinHandle<ReadinessOutcome>) {
        let mut slot = self
            .readiness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(task);
    }

    fn take_readiness(&self) -> Option<JoinHandle<ReadinessOutcome>> {
        self.readiness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Service for managing editor sessions.
#[derive(Clone)]
pub struct SessionService {
    registry: Arc<dyn SessionRegistry>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    ports: Arc<dyn PortAllocator>,
    readiness: Arc<dyn ReadinessProbe>,
    handles: Arc<DashMap<String, Arc<SessionHandle>>>,
    /// Sessions admitted and not yet removed; backs `max_sessions`.
    admitted: Arc<AtomicUsize>,
    config: Arc<SessionServiceConfig>,
}

impl SessionService {
    /// Create a session service with the default collaborators: an in-memory
    /// registry, `git` provisioning, TCP port probing and HTTP readiness.
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: SessionServiceConfig,
        readiness: ReadinessConfig,
    ) -> Result<Self, reqwest::Error> {
        let probe = HttpReadinessProbe::new(runtime.clone(), readiness)?;
        Ok(Self {
            registry: Arc::new(InMemorySessionRegistry::new()),
            runtime,
            workspaces: Arc::new(GitProvisioner::default()),
            ports: Arc::new(TcpPortAllocator::default()),
            readiness: Arc::new(probe),
            handles: Arc::new(DashMap::new()),
            admitted: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
        })
    }

    /// Replace the session registry.
    pub fn with_registry(mut self, registry: Arc<dyn SessionRegistry>) -> Self {
        self.admitted = Arc::new(AtomicUsize::new(registry.len()));
        self.registry = registry;
        self
    }

    /// Replace the workspace provisioner.
    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceProvisioner>) -> Self {
        self.workspaces = workspaces;
        self
    }

    /// Replace the port allocator.
    pub fn with_ports(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    /// Replace the readiness probe.
    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    /// Validate a source reference before any resource is allocated.
    fn validate_source_ref(source_ref: &str) -> SessionResult<String> {
        let source_ref = source_ref.trim();
        if source_ref.is_empty() {
            return Err(SessionError::validation("sourceRef must not be empty"));
        }
        if source_ref.len() > MAX_SOURCE_REF_LEN {
            return Err(SessionError::validation(format!(
                "sourceRef must be at most {} characters",
                MAX_SOURCE_REF_LEN
            )));
        }
        if source_ref.starts_with('-') {
            return Err(SessionError::validation("sourceRef cannot start with '-'"));
        }
        if source_ref
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(SessionError::validation(
                "sourceRef cannot contain whitespace or control characters",
            ));
        }
        Ok(source_ref.to_string())
    }

    /// Count a new session against `max_sessions`.
    fn admit(&self) -> SessionResult<()> {
        let limit = self.config.max_sessions;
        self.admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            })
            .map(|_| ())
            .map_err(|_| SessionError::AdmissionDenied {
                limit: limit.unwrap_or_default(),
            })
    }

    fn release_admission(&self) {
        let _ = self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Remove the registry entry and its bookkeeping. Returns whether it existed.
    fn forget(&self, session_id: &str) -> bool {
        self.handles.remove(session_id);
        let removed = self.registry.remove(session_id).is_some();
        if removed {
            self.release_admission();
        }
        removed
    }

    /// Move a session to `next`, returning the updated session.
    ///
    /// Returns `None` if the session is gone. Transitions that do not follow
    /// the lifecycle are logged and skipped.
    fn transition(&self, session_id: &str, next: SessionState) -> Option<Session> {
        self.registry.update(session_id, &mut |session| {
            if session.state.can_transition_to(next) {
                debug!(
                    "Session {}: {} -> {}",
                    session.id, session.state, next
                );
                session.state = next;
            } else {
                warn!(
                    "Session {}: ignoring invalid transition {} -> {}",
                    session.id, session.state, next
                );
            }
        })
    }

    /// Create a new session and start its editor container.
    ///
    /// Returns as soon as the container has started; readiness is probed in
    /// the background. Requests for the same `source_ref` are never merged:
    /// every call gets its own session and port.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> SessionResult<SessionSummary> {
        let source_ref = Self::validate_source_ref(&request.source_ref)?;
        self.admit()?;

        let port = match self.ports.allocate(self.config.preferred_port) {
            Ok(port) => port,
            Err(e) => {
                self.release_admission();
                error!("Port allocation failed for {}: {}", source_ref, e);
                return Err(e.into());
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let container_name = format!("{}{}", CONTAINER_NAME_PREFIX, &session_id[..8]);
        let workspace_path = match self.config.provision_mode {
            ProvisionMode::Host => Some(workspace::session_dir(
                &self.config.workspace_root,
                &session_id,
            )),
            ProvisionMode::Container => None,
        };

        let session = Session {
            id: session_id.clone(),
            source_ref: source_ref.clone(),
            port,
            workspace_path: workspace_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            container_name,
            container_id: None,
            image: self.config.editor.image.clone(),
            state: SessionState::Pending,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            error_message: None,
        };

        // Hold the session lock before the entry becomes visible so a delete
        // arriving now waits for this create to reach a checkpoint.
        let handle = SessionHandle::new();
        let _guard = handle.lock.lock().await;
        self.handles.insert(session_id.clone(), handle.clone());

        if let Err(e) = self.registry.insert(session.clone()) {
            self.handles.remove(&session_id);
            self.ports.release(port);
            self.release_admission();
            return Err(SessionError::provisioning(&session_id, e));
        }
        info!(
            "Created session {} for {} on port {}",
            session_id, source_ref, port
        );

        if self
            .transition(&session_id, SessionState::Provisioning)
            .is_none()
        {
            return Err(Self::deleted_during_create(&session_id));
        }

        if let Some(ref workspace_path) = workspace_path {
            let fetched = tokio::select! {
                _ = handle.cancel.cancelled() => {
                    return Err(Self::deleted_during_create(&session_id));
                }
                fetched = self.workspaces.provision(&source_ref, workspace_path) => fetched,
            };
            if let Err(e) = fetched {
                return Err(self.fail_creation(&session, e.to_string()).await);
            }
        }

        if handle.cancel.is_cancelled()
            || self
                .transition(&session_id, SessionState::Starting)
                .is_none()
        {
            return Err(Self::deleted_during_create(&session_id));
        }

        let config = self.container_config(&session);
        let runtime_timeout = self.config.runtime_timeout;
        let created = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                return Err(Self::deleted_during_create(&session_id));
            }
            created = within(runtime_timeout, "create", self.runtime.create_container(&config)) => created,
        };
        let container_id = match created {
            Ok(id) => id,
            Err(e) => return Err(self.fail_creation(&session, e).await),
        };
        // Record the handle right away so any teardown can find the container
        let session = self
            .registry
            .update(&session_id, &mut |s| s.container_id = Some(container_id.clone()))
            .unwrap_or_else(|| Session {
                container_id: Some(container_id.clone()),
                ..session
            });
        debug!(
            "Created container {} for session {}",
            container_id, session_id
        );

        let started = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                return Err(Self::deleted_during_create(&session_id));
            }
            started = within(runtime_timeout, "start", self.runtime.start_container(&container_id)) => started,
        };
        if let Err(e) = started {
            return Err(self.fail_creation(&session, e).await);
        }

        if handle.cancel.is_cancelled() {
            return Err(Self::deleted_during_create(&session_id));
        }

        let Some(running) = self.registry.update(&session_id, &mut |s| {
            if s.state.can_transition_to(SessionState::Running) {
                s.state = SessionState::Running;
                s.started_at = Some(Utc::now().to_rfc3339());
            }
        }) else {
            return Err(Self::deleted_during_create(&session_id));
        };
        info!(
            "Started container {} for session {} on port {}",
            container_id, session_id, port
        );

        self.spawn_readiness(&handle, &running, &container_id);

        Ok(running.summary(&self.config.public_host))
    }

    fn deleted_during_create(session_id: &str) -> SessionError {
        info!("Session {} was deleted while being created", session_id);
        SessionError::provisioning(session_id, "session was deleted during creation")
    }

    /// Name or ID under which the session's container may exist.
    fn container_ref(session: &Session) -> Option<String> {
        match session.container_id {
            Some(ref id) => Some(id.clone()),
            // A create that was abandoned may still have produced a container
            None if session.state == SessionState::Starting => {
                Some(session.container_name.clone())
            }
            None => None,
        }
    }

    /// Roll back a failed creation and produce the error to report.
    async fn fail_creation(&self, session: &Session, message: String) -> SessionError {
        error!("Failed to create session {}: {}", session.id, message);

        let container = self
            .registry
            .get(&session.id)
            .and_then(|current| Self::container_ref(&current));
        let failed = self
            .registry
            .update(&session.id, &mut |s| {
                s.state = SessionState::Failed;
                s.error_message = Some(message.clone());
            })
            .unwrap_or_else(|| session.clone());

        let report = self.teardown(&failed, container.as_deref(), false).await;
        if !report.is_clean() {
            warn!(
                "Rollback of session {} left {} step(s) incomplete",
                session.id,
                report.failures.len()
            );
        }
        self.forget(&session.id);

        SessionError::provisioning(&session.id, message)
    }

    /// Ordered, best-effort release of everything a session holds except its
    /// registry entry. Every runtime call is time-limited.
    async fn teardown(
        &self,
        session: &Session,
        container: Option<&str>,
        stop_first: bool,
    ) -> CleanupReport {
        let mut actions = CompensatingActions::new();
        let stop_timeout = self.config.stop_timeout_seconds;
        let runtime_timeout = self.config.runtime_timeout;

        if let Some(container) = container {
            if stop_first {
                let bound = Duration::from_secs(u64::from(stop_timeout)) + runtime_timeout;
                actions.push(
                    "stop container",
                    within(
                        bound,
                        "stop",
                        self.runtime.stop_container(container, Some(stop_timeout)),
                    ),
                );
            }
            actions.push(
                "remove container",
                within(
                    runtime_timeout,
                    "remove",
                    self.runtime.remove_container(container, true),
                ),
            );
        }

        if let Some(ref workspace_path) = session.workspace_path {
            actions.push(
                "discard workspace",
                self.workspaces.discard(Path::new(workspace_path)),
            );
        }

        let port = session.port;
        actions.push("release port", async move {
            self.ports.release(port);
            Ok::<(), String>(())
        });

        actions.run(&format!("session {}", session.id)).await
    }

    /// Build the container specification for a session.
    fn container_config(&self, session: &Session) -> ContainerConfig {
        let editor = &self.config.editor;
        let mount = editor.workspace_mount.clone();

        let mut config = ContainerConfig::new(&editor.image)
            .name(&session.container_name)
            .port(session.port, editor.container_port)
            .envs(editor.env.clone())
            .env("CODEPOD_SESSION_ID", &session.id)
            .env("CODEPOD_SOURCE_REF", &session.source_ref)
            .env("CODEPOD_WORKSPACE", &mount)
            .label(SESSION_LABEL, &session.id)
            .workdir(&mount);

        match session.workspace_path {
            Some(ref host_path) => {
                config = config.volume(host_path, &mount);
                if let Some(ref entrypoint) = editor.entrypoint {
                    config = config.entrypoint(entrypoint);
                }
                let mut command = editor.args.clone();
                command.push(mount);
                config.command(command)
            }
            None => {
                let mut command = vec![
                    "-c".to_string(),
                    in_container_clone_script(self.config.clone_depth),
                    "codepod-init".to_string(),
                    editor.launcher.clone(),
                ];
                command.extend(editor.args.iter().cloned());
                command.push(mount);
                config.entrypoint("/bin/sh").command(command)
            }
        }
    }

    fn spawn_readiness(&self, handle: &SessionHandle, session: &Session, container_id: &str) {
        let probe = self.readiness.clone();
        let cancel = handle.cancel.child_token();
        let session_id = session.id.clone();
        let container_id = container_id.to_string();
        let port = session.port;

        let task = tokio::spawn(async move {
            let outcome = probe.probe(&session_id, &container_id, port, cancel).await;
            debug!("Readiness probe for session {} finished: {:?}", session_id, outcome);
            outcome
        });
        handle.set_readiness(task);
    }

    /// Delete a session: stop its container, discard its workspace, release
    /// its port and drop it from the registry.
    ///
    /// Sub-step failures are logged and returned in the report; they never
    /// fail the delete itself.
    pub async fn delete_session(&self, session_id: &str) -> SessionResult<CleanupReport> {
        if self.registry.get(session_id).is_none() {
            return Err(SessionError::not_found(session_id));
        }

        let handle = self.handles.get(session_id).map(|h| h.value().clone());
        if let Some(ref handle) = handle {
            // Stops the readiness probe and any in-flight create at its next checkpoint
            handle.cancel.cancel();
        }
        let _guard = match handle {
            Some(ref handle) => Some(handle.lock.lock().await),
            None => None,
        };

        if let Some(task) = handle.as_ref().and_then(|h| h.take_readiness()) {
            task.abort();
        }

        let container = self
            .registry
            .get(session_id)
            .and_then(|current| Self::container_ref(&current));
        // A concurrent delete or a failed create may have won the race
        let Some(session) = self.transition(session_id, SessionState::Stopping) else {
            debug!("Session {} already removed", session_id);
            return Ok(CleanupReport::default());
        };
        info!("Deleting session {} ({})", session_id, session.source_ref);

        let report = self.teardown(&session, container.as_deref(), true).await;

        self.transition(session_id, SessionState::Terminated);
        self.forget(session_id);

        if report.is_clean() {
            info!("Deleted session {}", session_id);
        } else {
            warn!(
                "Deleted session {} with {} cleanup failure(s)",
                session_id,
                report.failures.len()
            );
        }
        Ok(report)
    }

    /// List all tracked sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = self.registry.list();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
            .iter()
            .map(|s| s.summary(&self.config.public_host))
            .collect()
    }

    /// Get a single session.
    pub fn get_session(&self, session_id: &str) -> SessionResult<SessionSummary> {
        self.registry
            .get(session_id)
            .map(|s| s.summary(&self.config.public_host))
            .ok_or_else(|| SessionError::not_found(session_id))
    }

    /// Fetch the tail of a session's container output.
    pub async fn session_logs(&self, session_id: &str, tail: Option<u32>) -> SessionResult<String> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::not_found(session_id))?;
        let container_id = session.container_id.ok_or_else(|| {
            SessionError::not_found(format!("{} (no container yet)", session_id))
        })?;

        let tail = tail.unwrap_or(self.config.logs_tail_lines);
        self.runtime
            .get_logs(&container_id, Some(tail))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    SessionError::not_found(format!("{} (container {} is gone)", session_id, container_id))
                } else {
                    SessionError::Runtime(e.to_string())
                }
            })
    }

    /// Delete every tracked session. Used on shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.registry.list().into_iter().map(|s| s.id).collect();
        if ids.is_empty() {
            return 0;
        }
        info!("Stopping {} session(s) before shutdown", ids.len());

        let results =
            futures::future::join_all(ids.iter().map(|id| self.delete_session(id))).await;
        results.into_iter().filter(|r| r.is_ok()).count()
    }
}
