//! Session data models.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// `Pending -> Provisioning -> Starting -> Running -> Stopping -> Terminated`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session id allocated, nothing else yet.
    Pending,
    /// Port reserved, workspace being fetched.
    Provisioning,
    /// Container being created and started.
    Starting,
    /// Container started (readiness is confirmed asynchronously).
    Running,
    /// Teardown in progress.
    Stopping,
    /// Teardown finished.
    Terminated,
    /// Creation failed.
    Failed,
}

impl SessionState {
    /// Whether the session has reached an absorbing state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }

    /// Whether the session still holds its port.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Pending
                | SessionState::Provisioning
                | SessionState::Starting
                | SessionState::Running
        )
    }

    /// Check whether moving to `next` follows the lifecycle.
    ///
    /// `Stopping` may be entered from any live state so that a delete can
    /// interrupt a session that is still being created.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (from, Stopping) => from.is_live(),
            (Pending, Provisioning) => true,
            (Provisioning, Starting) => true,
            (Starting, Running) => true,
            (Stopping, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Terminated => write!(f, "terminated"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionState::Pending),
            "provisioning" => Ok(SessionState::Provisioning),
            "starting" => Ok(SessionState::Starting),
            "running" => Ok(SessionState::Running),
            "stopping" => Ok(SessionState::Stopping),
            "terminated" => Ok(SessionState::Terminated),
            "failed" => Ok(SessionState::Failed),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// Where the repository is cloned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    /// Clone on the host into the session workspace, then bind-mount it.
    /// Fetch failures surface directly to the caller.
    #[default]
    Host,
    /// Let the container clone the repository before launching the editor.
    /// Fetch failures only show up in the container logs.
    Container,
}

impl std::fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionMode::Host => write!(f, "host"),
            ProvisionMode::Container => write!(f, "container"),
        }
    }
}

/// One editor environment tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session ID (UUID v4).
    pub id: String,
    /// Repository URL requested by the caller.
    pub source_ref: String,
    /// Host port reserved for the editor.
    pub port: u16,
    /// Host workspace directory, when the workspace is provisioned host-side.
    pub workspace_path: Option<String>,
    /// Container name, derived from the session ID.
    pub container_name: String,
    /// Container ID once the container has been created.
    pub container_id: Option<String>,
    /// Image the container runs.
    pub image: String,
    pub state: SessionState,
    /// RFC 3339 timestamps.
    pub created_at: String,
    pub started_at: Option<String>,
    /// Failure reason, if any.
    pub error_message: Option<String>,
}

impl Session {
    /// URL at which the editor is served.
    pub fn access_url(&self, host: &str) -> String {
        format!("http://{}:{}/", host, self.port)
    }

    /// Project into the externally visible summary.
    pub fn summary(&self, host: &str) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            source_ref: self.source_ref.clone(),
            port: self.port,
            state: self.state,
            process_handle: self.container_id.clone(),
            access_url: self.access_url(host),
            created_at: self.created_at.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Request to create a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Repository URL to open.
    #[serde(default, alias = "repoUrl", alias = "source_ref")]
    pub source_ref: String,
}

impl CreateSessionRequest {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
        }
    }
}

/// Session view returned by create, get and list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub source_ref: String,
    pub port: u16,
    pub state: SessionState,
    /// Container ID, absent until the container exists.
    pub process_handle: Option<String>,
    pub access_url: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            SessionState::Pending,
            SessionState::Provisioning,
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Terminated,
            SessionState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<SessionState>().unwrap(), state);
        }
        assert!("exploded".parse::<SessionState>().is_err());
    }

    #[test]
    fn lifecycle_transitions() {
        use SessionState::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Terminated));

        assert!(Provisioning.can_transition_to(Failed));
        assert!(Stopping.can_transition_to(Failed));
        assert!(Starting.can_transition_to(Stopping));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Provisioning));
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Stopping));
    }

    #[test]
    fn create_request_accepts_aliases() {
        let request: CreateSessionRequest =
            serde_json::from_str(r#"{"repoUrl":"https://example.com/demo.git"}"#).unwrap();
        assert_eq!(request.source_ref, "https://example.com/demo.git");

        let empty: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.source_ref.is_empty());
    }

    #[test]
    fn summary_uses_camel_case() {
        let session = Session {
            id: "abc".to_string(),
            source_ref: "https://example.com/demo.git".to_string(),
            port: 41820,
            workspace_path: None,
            container_name: "codepod-abc".to_string(),
            container_id: Some("deadbeef".to_string()),
            image: "editor:latest".to_string(),
            state: SessionState::Running,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            error_message: None,
        };

        let json = serde_json::to_value(session.summary("localhost")).unwrap();
        assert_eq!(json["sourceRef"], "https://example.com/demo.git");
        assert_eq!(json["accessUrl"], "http://localhost:41820/");
        assert_eq!(json["processHandle"], "deadbeef");
        assert_eq!(json["state"], "running");
        assert!(json.get("errorMessage").is_none());
    }
}
