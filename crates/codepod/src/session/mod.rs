//! Session management module.
//!
//! Each session pairs a repository reference with a reserved host port, an
//! optional host workspace and one editor container.

mod cleanup;
mod error;
mod models;
mod readiness;
mod registry;
mod service;

pub use cleanup::{CleanupFailure, CleanupReport, CompensatingActions};
pub use error::{SessionError, SessionResult};
pub use models::{CreateSessionRequest, ProvisionMode, Session, SessionState, SessionSummary};
pub use readiness::{HttpReadinessProbe, ReadinessConfig, ReadinessOutcome, ReadinessProbe};
pub use registry::{InMemorySessionRegistry, RegistryError, SessionRegistry};
pub use service::{EditorSpec, SessionService, SessionServiceConfig};
