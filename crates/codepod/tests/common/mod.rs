//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use codepod::api;
use codepod::container::{
    ContainerConfig, ContainerError, ContainerInspection, ContainerResult, ContainerRuntimeApi,
};
use codepod::ports::TcpPortAllocator;
use codepod::session::{
    ReadinessConfig, ReadinessOutcome, ReadinessProbe, SessionService, SessionServiceConfig,
};
use codepod::workspace::{WorkspaceError, WorkspaceProvisioner};
use tokio_util::sync::CancellationToken;

/// Container runtime that records calls instead of running anything.
#[derive(Default)]
pub struct FakeRuntime {
    pub fail_start: AtomicBool,
    pub created: Mutex<Vec<ContainerConfig>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut created = self.created.lock().unwrap();
        created.push(config.clone());
        Ok(format!("fake-{}", created.len()))
    }

    async fn start_container(&self, _container_id: &str) -> ContainerResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "port is already allocated".to_string(),
            });
        }
        Ok(())
    }

    async fn inspect_container(
        &self,
        _container_id: &str,
    ) -> ContainerResult<Option<ContainerInspection>> {
        Ok(Some(ContainerInspection::running()))
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        Ok(format!(
            "editor {} listening (tail={})\n",
            container_id,
            tail.unwrap_or_default()
        ))
    }
}

/// Creates the workspace directory without touching the network.
pub struct DirProvisioner;

#[async_trait]
impl WorkspaceProvisioner for DirProvisioner {
    async fn provision(&self, _source_ref: &str, destination: &Path) -> Result<(), WorkspaceError> {
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| WorkspaceError::Io {
                path: destination.to_path_buf(),
                source: e,
            })
    }

    async fn discard(&self, destination: &Path) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(destination).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(WorkspaceError::Io {
                path: destination.to_path_buf(),
                source: e,
            }),
            _ => Ok(()),
        }
    }
}

/// Readiness probe that reports ready immediately.
pub struct InstantReadiness;

#[async_trait]
impl ReadinessProbe for InstantReadiness {
    async fn probe(
        &self,
        _session_id: &str,
        _container_id: &str,
        _port: u16,
        _cancel: CancellationToken,
    ) -> ReadinessOutcome {
        ReadinessOutcome::Ready { attempts: 1 }
    }
}

pub struct TestApp {
    pub router: Router,
    pub runtime: Arc<FakeRuntime>,
    pub sessions: SessionService,
    _workspaces: tempfile::TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Build the API router over in-process fakes.
pub fn test_app() -> TestApp {
    let workspaces = tempfile::tempdir().expect("create temp workspace root");
    let runtime = Arc::new(FakeRuntime::default());

    let config = SessionServiceConfig {
        workspace_root: workspaces.path().to_path_buf(),
        preferred_port: 0,
        ..Default::default()
    };

    let sessions = SessionService::new(runtime.clone(), config, ReadinessConfig::default())
        .expect("build session service")
        .with_workspaces(Arc::new(DirProvisioner))
        .with_ports(Arc::new(TcpPortAllocator::new(Ipv4Addr::LOCALHOST)))
        .with_readiness(Arc::new(InstantReadiness));

    let router = api::create_router(api::AppState::new(sessions.clone()));

    TestApp {
        router,
        runtime,
        sessions,
        _workspaces: workspaces,
    }
}
