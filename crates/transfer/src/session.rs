//! Resume session persistence.
//!
//! A session records which chunk indices of a logical file the remote side
//! has acknowledged. It is the only persisted state of the pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use paperdrop_protocol::SessionRecord;
use tracing::debug;

/// Errors from session persistence.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session store full ({capacity} sessions)")]
    Full { capacity: usize },

    #[error("invalid session key: {0}")]
    InvalidKey(String),
}

/// Key-value store for [`SessionRecord`]s.
///
/// `update` is an atomic read-modify-write per key: concurrent acks on the
/// same session never lose each other's indices.
pub trait SessionStore: Send + Sync {
    /// Returns the record for `key`, if any.
    fn load(&self, key: &str) -> Result<Option<SessionRecord>, SessionError>;

    /// Applies `apply` to the current slot for `key` and persists the result.
    ///
    /// Leaving the slot `None` deletes the record. Returns the stored value.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut Option<SessionRecord>),
    ) -> Result<Option<SessionRecord>, SessionError>;

    /// Deletes the record for `key`. Returns `true` if it existed.
    fn remove(&self, key: &str) -> Result<bool, SessionError>;

    /// Returns all stored keys.
    fn keys(&self) -> Result<Vec<String>, SessionError>;

    /// Records `index` as acked, creating the session on the first ack.
    ///
    /// A stored record from a different chunk plan is replaced.
    fn record_ack(
        &self,
        key: &str,
        file_size: u64,
        chunk_size: u64,
        index: u32,
    ) -> Result<SessionRecord, SessionError> {
        let stored = self.update(key, &mut |slot| {
            let record =
                slot.get_or_insert_with(|| SessionRecord::new(key, file_size, chunk_size));
            if !record.matches_plan(file_size, chunk_size) {
                *record = SessionRecord::new(key, file_size, chunk_size);
            }
            record.mark_acked(index);
        })?;
        stored.ok_or_else(|| SessionError::InvalidKey(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

/// In-process session store, optionally bounded.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    capacity: Option<usize>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that refuses new sessions beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.sessions.lock().unwrap().get(key).cloned())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut Option<SessionRecord>),
    ) -> Result<Option<SessionRecord>, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        let existed = sessions.contains_key(key);
        let mut slot = sessions.get(key).cloned();
        apply(&mut slot);

        match slot {
            Some(record) => {
                if !existed
                    && let Some(capacity) = self.capacity
                    && sessions.len() >= capacity
                {
                    return Err(SessionError::Full { capacity });
                }
                sessions.insert(key.to_string(), record.clone());
                Ok(Some(record))
            }
            None => {
                sessions.remove(key);
                Ok(None)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.lock().unwrap().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.sessions.lock().unwrap().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// FileSessionStore
// ---------------------------------------------------------------------------

/// On-disk session store: one JSON file per key.
///
/// Writes go to a temporary file that is then renamed over the record, so a
/// crash mid-write leaves either the old or the new record, never a torn one.
pub struct FileSessionStore {
    dir: PathBuf,
    lock: Mutex<()>,
    capacity: Option<usize>,
}

impl FileSessionStore {
    /// Creates a store rooted at `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
            capacity: None,
        })
    }

    /// Limits the number of stored sessions.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SessionError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn read(&self, path: &Path) -> Result<Option<SessionRecord>, SessionError> {
        match std::fs::read_to_string(path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, record: &SessionRecord) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            // Durable before the rename makes it visible.
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        debug!(
            key = %record.session_key,
            acked = record.acked_indices.len(),
            "persisted session"
        );
        Ok(())
    }

    fn count(&self) -> Result<usize, SessionError> {
        Ok(self.keys()?.len())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, key: &str) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.path_for(key)?;
        let _guard = self.lock.lock().unwrap();
        self.read(&path)
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut Option<SessionRecord>),
    ) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.path_for(key)?;
        let _guard = self.lock.lock().unwrap();

        let mut slot = self.read(&path)?;
        let existed = slot.is_some();
        apply(&mut slot);

        match &slot {
            Some(record) => {
                if !existed
                    && let Some(capacity) = self.capacity
                    && self.count()? >= capacity
                {
                    return Err(SessionError::Full { capacity });
                }
                self.write(&path, record)?;
            }
            None if existed => {
                std::fs::remove_file(&path)?;
            }
            None => {}
        }
        Ok(slot)
    }

    fn remove(&self, key: &str) -> Result<bool, SessionError> {
        let path = self.path_for(key)?;
        let _guard = self.lock.lock().unwrap();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, SessionError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Session keys become file names, so only a conservative alphabet is allowed.
fn validate_key(key: &str) -> Result<(), SessionError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn memory_record_ack_creates_and_updates() {
        let store = MemorySessionStore::new();
        assert!(store.load("k1").unwrap().is_none());

        store.record_ack("k1", 100, 10, 3).unwrap();
        let record = store.record_ack("k1", 100, 10, 1).unwrap();
        assert_eq!(record.acked_indices, vec![1, 3]);
        assert_eq!(store.load("k1").unwrap().unwrap(), record);
    }

    #[test]
    fn record_ack_replaces_mismatched_plan() {
        let store = MemorySessionStore::new();
        store.record_ack("k1", 100, 10, 3).unwrap();
        let record = store.record_ack("k1", 100, 20, 0).unwrap();
        assert_eq!(record.chunk_size, 20);
        assert_eq!(record.acked_indices, vec![0]);
    }

    #[test]
    fn memory_capacity_enforced_for_new_keys_only() {
        let store = MemorySessionStore::with_capacity(1);
        store.record_ack("a", 10, 1, 0).unwrap();
        // Existing key still updatable.
        store.record_ack("a", 10, 1, 1).unwrap();
        let err = store.record_ack("b", 10, 1, 0).unwrap_err();
        assert!(matches!(err, SessionError::Full { capacity: 1 }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_update_to_none_deletes() {
        let store = MemorySessionStore::new();
        store.record_ack("a", 10, 1, 0).unwrap();
        let result = store.update("a", &mut |slot| *slot = None).unwrap();
        assert!(result.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn memory_concurrent_acks_not_lost() {
        let store = Arc::new(MemorySessionStore::new());
        let mut handles = vec![];
        for t in 0..8u32 {
            let s = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..50u32 {
                    s.record_ack("shared", 4000, 1, t * 50 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load("shared").unwrap().unwrap().acked_indices.len(), 400);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileSessionStore::new(dir.path()).unwrap();
            store.record_ack("abc", 100, 10, 0).unwrap();
            store.record_ack("abc", 100, 10, 4).unwrap();
        }
        let store = FileSessionStore::new(dir.path()).unwrap();
        let record = store.load("abc").unwrap().unwrap();
        assert_eq!(record.acked_indices, vec![0, 4]);
        assert_eq!(store.keys().unwrap(), vec!["abc".to_string()]);
    }

    #[test]
    fn file_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.record_ack("abc", 100, 10, 0).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["abc.json".to_string()]);
    }

    #[test]
    fn file_store_record_on_disk_is_whole_after_each_write() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let path = dir.path().join("abc.json");
        for index in 0..10 {
            store.record_ack("abc", 100, 10, index).unwrap();
            let raw = std::fs::read_to_string(&path).unwrap();
            let record: SessionRecord = serde_json::from_str(&raw).unwrap();
            assert_eq!(record.acked_indices.len(), index as usize + 1);
        }
        assert!(!dir.path().join("abc.json.tmp").exists());
    }

    #[test]
    fn file_store_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.record_ack("abc", 100, 10, 0).unwrap();
        assert!(store.remove("abc").unwrap());
        assert!(!store.remove("abc").unwrap());
        assert!(store.load("abc").unwrap().is_none());
    }

    #[test]
    fn file_store_capacity() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap().with_capacity(1);
        store.record_ack("a", 10, 1, 0).unwrap();
        assert!(matches!(
            store.record_ack("b", 10, 1, 0),
            Err(SessionError::Full { capacity: 1 })
        ));
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        for key in ["", "../escape", "a/b", "with space"] {
            assert!(
                matches!(store.load(key), Err(SessionError::InvalidKey(_))),
                "key {key:?} accepted"
            );
        }
    }

    #[test]
    fn file_store_corrupt_record_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("bad"), Err(SessionError::Json(_))));
    }
}
