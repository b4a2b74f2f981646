use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;
use uplink_protocol::PersistedState;

use crate::TransferError;
use crate::types::SessionId;

/// Storage for resume state, keyed by session.
pub trait PersistenceAdapter: Send + Sync {
    fn save(&self, id: &SessionId, state: &PersistedState) -> Result<(), TransferError>;

    fn load(&self, id: &SessionId) -> Result<Option<PersistedState>, TransferError>;

    fn clear(&self, id: &SessionId) -> Result<(), TransferError>;
}

/// Resume state cached in memory and persisted to a JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    states: RwLock<HashMap<SessionId, PersistedState>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing state from disk.
    pub fn new(path: PathBuf) -> Result<Self, TransferError> {
        let states = load_states(&path)?;
        Ok(Self {
            path,
            states: RwLock::new(states),
        })
    }

    /// Writes `map` to disk. Callers hold the write lock so writes never interleave.
    fn persist(&self, map: &HashMap<SessionId, PersistedState>) -> Result<(), TransferError> {
        let json = serde_json::to_string_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} session(s) to {:?}", map.len(), self.path);
        Ok(())
    }
}

impl PersistenceAdapter for JsonFileStore {
    fn save(&self, id: &SessionId, state: &PersistedState) -> Result<(), TransferError> {
        let mut map = self.states.write().unwrap();
        map.insert(id.clone(), state.clone());
        self.persist(&map)
    }

    fn load(&self, id: &SessionId) -> Result<Option<PersistedState>, TransferError> {
        Ok(self.states.read().unwrap().get(id).cloned())
    }

    fn clear(&self, id: &SessionId) -> Result<(), TransferError> {
        let mut map = self.states.write().unwrap();
        if map.remove(id).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }
}

/// Loads states from a JSON file on disk.
fn load_states(path: &Path) -> Result<HashMap<SessionId, PersistedState>, TransferError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let states: HashMap<SessionId, PersistedState> = serde_json::from_str(&data)?;
    debug!("loaded {} session(s) from {:?}", states.len(), path);
    Ok(states)
}

/// In-memory store, for tests and for callers that do not resume across restarts.
#[derive(Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<SessionId, PersistedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceAdapter for MemoryStore {
    fn save(&self, id: &SessionId, state: &PersistedState) -> Result<(), TransferError> {
        self.states
            .write()
            .unwrap()
            .insert(id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<PersistedState>, TransferError> {
        Ok(self.states.read().unwrap().get(id).cloned())
    }

    fn clear(&self, id: &SessionId) -> Result<(), TransferError> {
        self.states.write().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uplink_protocol::{ChunkReceipt, ReceiptStatus};

    use super::*;

    fn state(handle: &str) -> PersistedState {
        PersistedState {
            remote_handle: Some(handle.into()),
            key: Some("k.bin".into()),
            receipts: vec![ChunkReceipt {
                index: 0,
                token: "\"t0\"".into(),
                status: ReceiptStatus::Acked,
            }],
            file_size: 12,
            chunk_size: 4,
            container: "bucket".into(),
        }
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("resume.json");
        let id = SessionId::from("s1");

        {
            let store = JsonFileStore::new(path.clone()).unwrap();
            store.save(&id, &state("u1")).unwrap();
        }

        let store = JsonFileStore::new(path).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(state("u1")));
    }

    #[test]
    fn json_store_clear_removes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let id = SessionId::from("s1");

        let store = JsonFileStore::new(path.clone()).unwrap();
        store.save(&id, &state("u1")).unwrap();
        store.clear(&id).unwrap();
        drop(store);

        let reopened = JsonFileStore::new(path).unwrap();
        assert!(reopened.load(&id).unwrap().is_none());
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::new(path),
            Err(TransferError::Json(_))
        ));
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryStore::new();
        let id = SessionId::from("s1");
        store.save(&id, &state("u1")).unwrap();
        store.save(&id, &state("u2")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load(&id).unwrap().unwrap().remote_handle.as_deref(),
            Some("u2")
        );
        store.clear(&id).unwrap();
        assert!(store.is_empty());
    }
}
