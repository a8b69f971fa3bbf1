//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the runtime reported that the addressed container does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::ContainerNotFound(_) => true,
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("no such container") || lower.contains("no container with")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection_covers_docker_and_podman_messages() {
        let docker = ContainerError::CommandFailed {
            command: "stop".to_string(),
            message: "Error response from daemon: No such container: abc".to_string(),
        };
        let podman = ContainerError::CommandFailed {
            command: "stop".to_string(),
            message: "Error: no container with name or ID \"abc\" found".to_string(),
        };
        let other = ContainerError::CommandFailed {
            command: "stop".to_string(),
            message: "permission denied".to_string(),
        };

        assert!(docker.is_not_found());
        assert!(podman.is_not_found());
        assert!(!other.is_not_found());
        assert!(ContainerError::ContainerNotFound("abc".to_string()).is_not_found());
    }
}
