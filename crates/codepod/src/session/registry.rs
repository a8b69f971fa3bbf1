//! Session registry - the authoritative table of tracked sessions.
//!
//! The registry validates nothing beyond key uniqueness. Lifecycle rules live
//! in the session service, which is the only writer of a session's state.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::models::Session;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    DuplicateId(String),
}

/// Concurrency-safe store of sessions keyed by ID.
///
/// Implementations must make `insert`, `update` and `remove` atomic per key.
pub trait SessionRegistry: Send + Sync {
    /// Insert a new session; fails if the ID is taken.
    fn insert(&self, session: Session) -> Result<(), RegistryError>;

    /// Replace an existing session. Returns `false` if the ID is unknown.
    fn put(&self, session: Session) -> bool;

    /// Apply `update` to the stored session and return the updated copy.
    fn update(&self, id: &str, update: &mut dyn FnMut(&mut Session)) -> Option<Session>;

    fn get(&self, id: &str) -> Option<Session>;

    /// Snapshot of all sessions, in no particular order.
    fn list(&self) -> Vec<Session>;

    fn remove(&self, id: &str) -> Option<Session>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Volatile registry held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn insert(&self, session: Session) -> Result<(), RegistryError> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    fn put(&self, session: Session) -> bool {
        match self.sessions.get_mut(&session.id) {
            Some(mut existing) => {
                *existing = session;
                true
            }
            None => false,
        }
    }

    fn update(&self, id: &str, update: &mut dyn FnMut(&mut Session)) -> Option<Session> {
        let mut entry = self.sessions.get_mut(id)?;
        update(entry.value_mut());
        Some(entry.value().clone())
    }

    fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn list(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::models::SessionState;

    fn session(id: &str, port: u16) -> Session {
        Session {
            id: id.to_string(),
            source_ref: "https://example.com/demo.git".to_string(),
            port,
            workspace_path: None,
            container_name: format!("codepod-{}", id),
            container_id: None,
            image: "editor:latest".to_string(),
            state: SessionState::Pending,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            error_message: None,
        }
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let registry = InMemorySessionRegistry::new();
        registry.insert(session("a", 1)).unwrap();
        let err = registry.insert(session("a", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "a"));
        assert_eq!(registry.get("a").unwrap().port, 1);
    }

    #[test]
    fn update_and_put_only_touch_existing_entries() {
        let registry = InMemorySessionRegistry::new();
        assert!(!registry.put(session("missing", 1)));
        assert!(
            registry
                .update("missing", &mut |s| s.state = SessionState::Running)
                .is_none()
        );

        registry.insert(session("a", 1)).unwrap();
        let updated = registry
            .update("a", &mut |s| s.state = SessionState::Provisioning)
            .unwrap();
        assert_eq!(updated.state, SessionState::Provisioning);

        let mut replacement = session("a", 1);
        replacement.container_id = Some("c1".to_string());
        assert!(registry.put(replacement));
        assert_eq!(registry.get("a").unwrap().container_id.as_deref(), Some("c1"));
    }

    #[test]
    fn list_is_a_snapshot_and_remove_is_final() {
        let registry = InMemorySessionRegistry::new();
        registry.insert(session("a", 1)).unwrap();
        registry.insert(session("b", 2)).unwrap();

        let snapshot = registry.list();
        assert_eq!(snapshot.len(), 2);

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_none());
    }
}
