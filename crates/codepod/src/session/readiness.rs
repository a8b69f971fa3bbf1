//! Background readiness probing for freshly started editor containers.
//!
//! The probe is diagnostic: it only logs. A session is marked running as soon
//! as its container starts, whether or not the editor ever answers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::container::{ContainerInspection, ContainerRuntimeApi};

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// HTTP attempts before giving up.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
    /// Host the published port is reachable on from this process.
    pub host: String,
    /// Path requested on each attempt.
    pub path: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Log lines captured when the container has exited.
    pub log_tail_lines: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
            host: "127.0.0.1".to_string(),
            path: "/".to_string(),
            request_timeout: Duration::from_secs(2),
            log_tail_lines: 50,
        }
    }
}

/// How a readiness probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The editor answered 200 on the given attempt.
    Ready { attempts: u32 },
    /// The container process exited; `logs` holds its output tail.
    Exited { detail: String, logs: String },
    /// The container no longer exists.
    Missing,
    /// The retry budget ran out.
    GaveUp { attempts: u32 },
    /// The session was deleted while probing.
    Cancelled,
}

/// Confirms that a session's editor is serving.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(
        &self,
        session_id: &str,
        container_id: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> ReadinessOutcome;
}

/// Probe that inspects the container, then polls the published port over HTTP.
pub struct HttpReadinessProbe {
    runtime: Arc<dyn ContainerRuntimeApi>,
    client: reqwest::Client,
    config: ReadinessConfig,
}

impl HttpReadinessProbe {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: ReadinessConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            runtime,
            client,
            config,
        })
    }

    fn url(&self, port: u16) -> String {
        let path = if self.config.path.starts_with('/') {
            self.config.path.clone()
        } else {
            format!("/{}", self.config.path)
        };
        format!("http://{}:{}{}", self.config.host, port, path)
    }

    async fn inspect(&self, session_id: &str, container_id: &str) -> Option<ContainerInspection> {
        match self.runtime.inspect_container(container_id).await {
            Ok(inspection) => inspection,
            Err(e) => {
                // Inspection trouble is not evidence of a dead container; keep polling
                warn!(
                    "Readiness: failed to inspect container {} for session {}: {}",
                    container_id, session_id, e
                );
                Some(ContainerInspection {
                    status: crate::container::ContainerStatus::Unknown,
                    exit_code: None,
                    error: None,
                })
            }
        }
    }

    async fn exited(
        &self,
        session_id: &str,
        container_id: &str,
        inspection: &ContainerInspection,
    ) -> ReadinessOutcome {
        let logs = match self
            .runtime
            .get_logs(container_id, Some(self.config.log_tail_lines))
            .await
        {
            Ok(logs) => logs,
            Err(e) => format!("<logs unavailable: {}>", e),
        };
        error!(
            "Container {} for session {} exited ({}); last {} log lines:\n{}",
            container_id,
            session_id,
            inspection.exit_detail(),
            self.config.log_tail_lines,
            logs.trim_end()
        );
        ReadinessOutcome::Exited {
            detail: inspection.exit_detail(),
            logs,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(
        &self,
        session_id: &str,
        container_id: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> ReadinessOutcome {
        let inspection = tokio::select! {
            _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
            inspection = self.inspect(session_id, container_id) => inspection,
        };
        match inspection {
            None => {
                warn!(
                    "Readiness: container {} for session {} does not exist",
                    container_id, session_id
                );
                return ReadinessOutcome::Missing;
            }
            Some(ref inspection) if inspection.status.has_exited() => {
                return self.exited(session_id, container_id, inspection).await;
            }
            Some(_) => {}
        }

        let url = self.url(port);
        for attempt in 1..=self.config.attempts {
            let response = tokio::select! {
                _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                response = self.client.get(&url).send() => response,
            };
            match response {
                Ok(res) if res.status() == reqwest::StatusCode::OK => {
                    info!(
                        "Session {} ready on port {} after {} attempt(s)",
                        session_id, port, attempt
                    );
                    return ReadinessOutcome::Ready { attempts: attempt };
                }
                Ok(res) => debug!(
                    "Readiness attempt {}/{} for session {}: HTTP {}",
                    attempt,
                    self.config.attempts,
                    session_id,
                    res.status()
                ),
                Err(e) => debug!(
                    "Readiness attempt {}/{} for session {}: {}",
                    attempt, self.config.attempts, session_id, e
                ),
            }

            if attempt < self.config.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        // A late exit (e.g. a failed in-container clone) only shows up in the logs
        if let Some(inspection) = self.inspect(session_id, container_id).await
            && inspection.status.has_exited()
        {
            return self.exited(session_id, container_id, &inspection).await;
        }

        warn!(
            "Session {} not ready on {} after {} attempts; giving up",
            session_id, url, self.config.attempts
        );
        ReadinessOutcome::GaveUp {
            attempts: self.config.attempts,
        }
    }
}
