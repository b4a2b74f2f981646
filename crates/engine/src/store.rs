//! Registry of live upload sessions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use uplink_transfer::{SessionId, UploadSession};

use crate::error::UploadError;

/// Live sessions, which of them currently have an upload running, and which
/// were stopped with their resume state kept.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<UploadSession>>>,
    running: RwLock<HashSet<SessionId>>,
    suspended: RwLock<HashSet<SessionId>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<UploadSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id().clone(), session);
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<UploadSession>, UploadError> {
        self.sessions
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.clone()))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<UploadSession>> {
        self.running.write().unwrap().remove(id);
        self.suspended.write().unwrap().remove(id);
        self.sessions.write().unwrap().remove(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().unwrap().contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks `id` as running. Returns `false` if it already was.
    pub fn begin_run(&self, id: &SessionId) -> bool {
        self.running.write().unwrap().insert(id.clone())
    }

    pub fn end_run(&self, id: &SessionId) {
        self.running.write().unwrap().remove(id);
    }

    pub fn is_running(&self, id: &SessionId) -> bool {
        self.running.read().unwrap().contains(id)
    }

    pub fn mark_suspended(&self, id: &SessionId) {
        self.suspended.write().unwrap().insert(id.clone());
    }

    pub fn clear_suspended(&self, id: &SessionId) {
        self.suspended.write().unwrap().remove(id);
    }

    pub fn is_suspended(&self, id: &SessionId) -> bool {
        self.suspended.read().unwrap().contains(id)
    }
}

/// Clears the running mark when dropped.
pub(crate) struct RunGuard<'a> {
    store: &'a SessionStore,
    id: SessionId,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn acquire(store: &'a SessionStore, id: &SessionId) -> Option<Self> {
        store.begin_run(id).then(|| Self {
            store,
            id: id.clone(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.store.end_run(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use uplink_transfer::{ChunkPlan, ChunkingConfig};

    use super::*;

    fn session(id: &str) -> Arc<UploadSession> {
        let plan = ChunkPlan::compute(10, &ChunkingConfig::default()).unwrap();
        Arc::new(UploadSession::new(id.into(), "a", "/tmp/a", "b", plan))
    }

    #[test]
    fn insert_get_remove() {
        let store = SessionStore::new();
        store.insert(session("s2"));
        store.insert(session("s1"));
        assert_eq!(store.ids(), vec![SessionId::from("s1"), SessionId::from("s2")]);
        assert!(store.get(&"s1".into()).is_ok());
        assert!(store.remove(&"s1".into()).is_some());
        assert!(matches!(
            store.get(&"s1".into()),
            Err(UploadError::SessionNotFound(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn run_guard_is_exclusive() {
        let store = SessionStore::new();
        let id = SessionId::from("s1");
        let guard = RunGuard::acquire(&store, &id).unwrap();
        assert!(store.is_running(&id));
        assert!(RunGuard::acquire(&store, &id).is_none());
        drop(guard);
        assert!(!store.is_running(&id));
        assert!(RunGuard::acquire(&store, &id).is_some());
    }

    #[test]
    fn suspended_mark_cleared_on_remove() {
        let store = SessionStore::new();
        let id = SessionId::from("s1");
        store.insert(session("s1"));
        store.mark_suspended(&id);
        assert!(store.is_suspended(&id));
        store.clear_suspended(&id);
        assert!(!store.is_suspended(&id));
        store.mark_suspended(&id);
        store.remove(&id);
        assert!(!store.is_suspended(&id));
    }
}
