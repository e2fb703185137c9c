use crate::error::StoreError;
use crate::session::Session;
use crate::trial::{Trial, TrialMode};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Highest snapshot layout this build understands
pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Everything needed to resume a session after a reload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Mode that recorded the session; absent in older snapshots
    #[serde(default)]
    pub mode: Option<TrialMode>,
    pub session: Session,
    #[serde(default)]
    pub current_trial: Option<Trial>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    mode: TrialMode,
    session: &'a Session,
    current_trial: Option<&'a Trial>,
}

/// Durable key-value slot holding serialized snapshots
pub trait SnapshotStore: Send {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Volatile store; clones share the same slots
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    slots: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a slot directly, bypassing serialization
    pub fn put_raw(&self, key: &str, bytes: &[u8]) {
        self.slots.lock().insert(key.to_string(), bytes.to_vec());
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.put_raw(key, bytes);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.slots.lock().get(key).cloned())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.slots.lock().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per slot inside a directory
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Slots kept in a SQLite table
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;
        Ok(Self { conn })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO snapshots (key, payload, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            "#,
            params![key, bytes],
        )?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots WHERE key = ?1",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(payload)
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM snapshots WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Write-through snapshot persistence that never fails its caller
pub struct PersistenceAdapter {
    store: Box<dyn SnapshotStore>,
    key: String,
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl PersistenceAdapter {
    pub fn new(store: Box<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn encode(mode: TrialMode, session: &Session, trial: Option<&Trial>) -> Result<Vec<u8>, StoreError> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            mode,
            session,
            current_trial: trial,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Parse and validate a stored blob; anything unusable yields None
    pub fn decode(bytes: &[u8]) -> Option<Snapshot> {
        let snapshot: Snapshot = match serde_json::from_slice(bytes) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("discarding unreadable snapshot: {}", e);
                return None;
            }
        };
        if snapshot.version > SNAPSHOT_VERSION {
            log::warn!(
                "discarding snapshot with unsupported version {} (max {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
            return None;
        }
        if !snapshot.session.is_consistent() {
            log::warn!("discarding snapshot whose counters disagree with its log");
            return None;
        }
        Some(snapshot)
    }

    pub fn save(&self, mode: TrialMode, session: &Session, trial: Option<&Trial>) {
        let result =
            Self::encode(mode, session, trial).and_then(|bytes| self.store.save(&self.key, &bytes));
        if let Err(e) = result {
            log::warn!("snapshot write to '{}' failed: {}", self.key, e);
        }
    }

    pub fn restore(&self) -> Option<Snapshot> {
        match self.store.load(&self.key) {
            Ok(Some(bytes)) => Self::decode(&bytes),
            Ok(None) => None,
            Err(e) => {
                log::warn!("snapshot read from '{}' failed: {}", self.key, e);
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.clear(&self.key) {
            log::warn!("snapshot clear of '{}' failed: {}", self.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::event::{record, RawInteraction};
    use crate::trial::TrialTargets;
    use tempfile::tempdir;

    fn sample() -> (Session, Trial) {
        let clock = ManualClock::default();
        let mut session = Session::new("session", &clock.now());
        session.start(clock.now());
        session.next_trial();
        let trial = Trial::start(TrialTargets::single("a"), 3, &clock.now());
        clock.advance(90);
        let event = record(&session, Some(&trial), 1, RawInteraction::new("b", false), clock.now());
        session.append_event(event);
        (session, trial)
    }

    struct BrokenStore;

    impl SnapshotStore for BrokenStore {
        fn save(&self, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "quota exceeded").into())
        }
        fn load(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "storage unavailable").into())
        }
        fn clear(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip_memory_store() {
        let (session, trial) = sample();
        let adapter = PersistenceAdapter::new(Box::new(MemorySnapshotStore::new()), "k");
        adapter.save(TrialMode::Single, &session, Some(&trial));

        let restored = adapter.restore().unwrap();
        assert_eq!(restored.version, SNAPSHOT_VERSION);
        assert_eq!(restored.session, session);
        assert_eq!(restored.current_trial, Some(trial));
    }

    #[test]
    fn test_system_clock_readings_roundtrip_exactly() {
        let clock = SystemClock::new();
        for i in 0..500 {
            let mut session = Session::new("session", &clock.now());
            session.start(clock.now());
            let trial = Trial::start(TrialTargets::single("a"), 3, &clock.now());
            let event = record(&session, Some(&trial), 1, RawInteraction::new("a", i % 2 == 0), clock.now());
            session.append_event(event);

            let bytes = PersistenceAdapter::encode(TrialMode::Single, &session, Some(&trial)).unwrap();
            let restored = PersistenceAdapter::decode(&bytes).unwrap();
            assert_eq!(restored.session, session);
            assert_eq!(restored.current_trial.as_ref(), Some(&trial));
        }
    }

    #[test]
    fn test_mode_is_recorded() {
        let (session, trial) = sample();
        let adapter = PersistenceAdapter::new(Box::new(MemorySnapshotStore::new()), "k");
        adapter.save(TrialMode::Batch, &session, Some(&trial));
        assert_eq!(adapter.restore().unwrap().mode, Some(TrialMode::Batch));
    }

    #[test]
    fn test_roundtrip_file_store() {
        let dir = tempdir().unwrap();
        let (session, _) = sample();
        let adapter = PersistenceAdapter::new(Box::new(FileSnapshotStore::with_dir(dir.path())), "exp");
        adapter.save(TrialMode::Single, &session, None);

        assert!(dir.path().join("exp.json").exists());
        let restored = adapter.restore().unwrap();
        assert_eq!(restored.session, session);
        assert_eq!(restored.current_trial, None);

        adapter.clear();
        assert!(adapter.restore().is_none());
    }

    #[test]
    fn test_roundtrip_sqlite_store_overwrites() {
        let (session, trial) = sample();
        let adapter = PersistenceAdapter::new(Box::new(SqliteSnapshotStore::open_in_memory().unwrap()), "exp");
        adapter.save(TrialMode::Single, &session, Some(&trial));
        adapter.save(TrialMode::Single, &session, None);

        let restored = adapter.restore().unwrap();
        assert_eq!(restored.current_trial, None);
        assert_eq!(restored.session.events().len(), 1);
    }

    #[test]
    fn test_missing_slot_restores_nothing() {
        let adapter = PersistenceAdapter::new(Box::new(MemorySnapshotStore::new()), "nothing");
        assert!(adapter.restore().is_none());
    }

    #[test]
    fn test_corrupt_or_future_snapshots_are_ignored() {
        let store = MemorySnapshotStore::new();
        let adapter = PersistenceAdapter::new(Box::new(store.clone()), "k");

        store.put_raw("k", b"{not json");
        assert!(adapter.restore().is_none());

        store.put_raw("k", br#"{"current_trial": null}"#);
        assert!(adapter.restore().is_none());

        let (session, _) = sample();
        let mut value = serde_json::to_value(Snapshot {
            version: SNAPSHOT_VERSION + 1,
            mode: None,
            session,
            current_trial: None,
        })
        .unwrap();
        value["version"] = serde_json::json!(SNAPSHOT_VERSION + 1);
        store.put_raw("k", value.to_string().as_bytes());
        assert!(adapter.restore().is_none());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let store = MemorySnapshotStore::new();
        store.put_raw("k", br#"{"session": {"id": "session_1_abc"}}"#);
        let adapter = PersistenceAdapter::new(Box::new(store), "k");

        let restored = adapter.restore().unwrap();
        assert_eq!(restored.version, SNAPSHOT_VERSION);
        assert_eq!(restored.session.id, "session_1_abc");
        assert!(!restored.session.is_started());
        assert!(restored.current_trial.is_none());
        assert_eq!(restored.mode, None);
    }

    #[test]
    fn test_inconsistent_counters_are_rejected() {
        let (session, _) = sample();
        let mut value = serde_json::to_value(Snapshot {
            version: SNAPSHOT_VERSION,
            mode: None,
            session,
            current_trial: None,
        })
        .unwrap();
        value["session"]["correct_count"] = serde_json::json!(5);
        assert!(PersistenceAdapter::decode(value.to_string().as_bytes()).is_none());
    }

    #[test]
    fn test_storage_faults_are_swallowed() {
        let (session, trial) = sample();
        let adapter = PersistenceAdapter::new(Box::new(BrokenStore), "k");
        adapter.save(TrialMode::Single, &session, Some(&trial));
        assert!(adapter.restore().is_none());
    }
}
