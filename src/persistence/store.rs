use crate::config::SessionConfig;
use crate::persistence::checkpoint::Checkpoint;
use crate::persistence::wal::WalRecord;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Data integrity error: {0}")]
    Integrity(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("No durable state for session '{0}'")]
    NotFound(String),
}

/// Durable home of one session's WAL and checkpoints.
pub trait SessionStore: Send + Sync {
    fn save_config(&self, config: &SessionConfig) -> Result<(), StoreError>;
    fn load_config(&self) -> Result<Option<SessionConfig>, StoreError>;

    /// Records must arrive with strictly increasing `seq`.
    fn append(&self, record: &WalRecord) -> Result<(), StoreError>;
    /// Records with `seq > after`, ascending.
    fn entries_after(&self, after: u64) -> Result<Vec<WalRecord>, StoreError>;
    fn last_seq(&self) -> Result<u64, StoreError>;
    /// Drops records with `seq <= through`.
    fn truncate_through(&self, through: u64) -> Result<usize, StoreError>;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError>;
}

/// Opens per-session stores.
pub trait StoreProvider: Send + Sync {
    /// Fresh store for a new session; prior state under `id` is discarded.
    fn create(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError>;
    /// Existing store for restore.
    fn open(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError>;
}

// --- In-memory implementation ---

#[derive(Default)]
struct MemoryState {
    config: Option<SessionConfig>,
    wal: BTreeMap<u64, WalRecord>,
    checkpoint: Option<Checkpoint>,
}

/// Non-durable store. `set_fail_writes` injects durability failures.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    pub fn wal_len(&self) -> usize {
        self.state.read().wal.len()
    }
}

impl SessionStore for MemoryStore {
    fn save_config(&self, config: &SessionConfig) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.write().config = Some(config.clone());
        Ok(())
    }

    fn load_config(&self) -> Result<Option<SessionConfig>, StoreError> {
        Ok(self.state.read().config.clone())
    }

    fn append(&self, record: &WalRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write();
        if let Some((&last, _)) = state.wal.last_key_value() {
            if record.seq <= last {
                return Err(StoreError::Integrity(format!(
                    "WAL seq {} does not follow {}",
                    record.seq, last
                )));
            }
        }
        state.wal.insert(record.seq, record.clone());
        Ok(())
    }

    fn entries_after(&self, after: u64) -> Result<Vec<WalRecord>, StoreError> {
        let state = self.state.read();
        Ok(state
            .wal
            .range(after.saturating_add(1)..)
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn last_seq(&self) -> Result<u64, StoreError> {
        let state = self.state.read();
        let wal_last = state.wal.keys().next_back().copied().unwrap_or(0);
        let checkpoint_last = state.checkpoint.as_ref().map_or(0, |c| c.last_wal_seq);
        Ok(wal_last.max(checkpoint_last))
    }

    fn truncate_through(&self, through: u64) -> Result<usize, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write();
        let keep = state.wal.split_off(&through.saturating_add(1));
        let removed = state.wal.len();
        state.wal = keep;
        Ok(removed)
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.write().checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.state.read().checkpoint.clone())
    }
}

/// Keeps stores alive across manager instances in one process, so a test can
/// drop a manager and restore from the same state.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle, e.g. for fault injection.
    pub fn store(&self, session_id: &str) -> Option<Arc<MemoryStore>> {
        self.stores.get(session_id).map(|s| s.value().clone())
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn create(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
        let store = Arc::new(MemoryStore::new());
        self.stores.insert(session_id.to_string(), store.clone());
        Ok(store)
    }

    fn open(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
        match self.stores.get(session_id) {
            Some(store) => {
                let store: Arc<dyn SessionStore> = store.value().clone();
                Ok(store)
            }
            None => Err(StoreError::NotFound(session_id.to_string())),
        }
    }
}
