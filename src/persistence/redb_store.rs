use crate::config::SessionConfig;
use crate::persistence::checkpoint::Checkpoint;
use crate::persistence::store::{SessionStore, StoreError, StoreProvider};
use crate::persistence::wal::WalRecord;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// Tables
const WAL_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("wal_log");
const CHECKPOINT_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("checkpoints");
const META_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("metadata");

const CONFIG_KEY: &str = "session_config";

/// One redb file per session.
pub struct RedbSessionStore {
    db: Database,
    path: PathBuf,
}

impl RedbSessionStore {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;
        let store = Self { db, path };
        store.initialize()?;
        info!(path = %store.path.display(), "📦 Redb session store opened");
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let _ = txn.open_table(WAL_TABLE)?;
            let _ = txn.open_table(CHECKPOINT_TABLE)?;
            let _ = txn.open_table(META_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for RedbSessionStore {
    fn save_config(&self, config: &SessionConfig) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            let data = serde_json::to_vec(config)?;
            table.insert(CONFIG_KEY, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn load_config(&self) -> Result<Option<SessionConfig>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let config = match table.get(CONFIG_KEY)? {
            Some(v) => Some(serde_json::from_slice(&v.value())?),
            None => None,
        };
        Ok(config)
    }

    fn append(&self, record: &WalRecord) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(WAL_TABLE)?;
            let last = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            if record.seq <= last {
                return Err(StoreError::Integrity(format!(
                    "WAL seq {} does not follow {}",
                    record.seq, last
                )));
            }
            let data = serde_json::to_vec(record)?;
            table.insert(record.seq, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn entries_after(&self, after: u64) -> Result<Vec<WalRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(WAL_TABLE)?;
        let mut records = Vec::new();
        for result in table.range(after.saturating_add(1)..)? {
            let (_, v) = result?;
            records.push(serde_json::from_slice::<WalRecord>(&v.value())?);
        }
        Ok(records)
    }

    fn last_seq(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read()?;
        let wal_last = txn
            .open_table(WAL_TABLE)?
            .last()?
            .map(|(k, _)| k.value())
            .unwrap_or(0);
        let checkpoint_last = txn
            .open_table(CHECKPOINT_TABLE)?
            .last()?
            .map(|(k, _)| k.value())
            .unwrap_or(0);
        Ok(wal_last.max(checkpoint_last))
    }

    fn truncate_through(&self, through: u64) -> Result<usize, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(WAL_TABLE)?;
            let mut keys = Vec::new();
            for result in table.range(..=through)? {
                let (k, _) = result?;
                keys.push(k.value());
            }
            for key in &keys {
                table.remove(key)?;
            }
            keys.len()
        };
        txn.commit()?;
        debug!(through, removed, "WAL truncated");
        Ok(removed)
    }

    /// Keyed by `last_wal_seq`; older checkpoints are dropped in the same
    /// transaction.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHECKPOINT_TABLE)?;
            let mut stale = Vec::new();
            for result in table.range(..checkpoint.last_wal_seq)? {
                let (k, _) = result?;
                stale.push(k.value());
            }
            for key in &stale {
                table.remove(key)?;
            }
            let data = serde_json::to_vec(checkpoint)?;
            table.insert(checkpoint.last_wal_seq, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHECKPOINT_TABLE)?;
        let checkpoint = match table.last()? {
            Some((_, v)) => Some(serde_json::from_slice(&v.value())?),
            None => None,
        };
        Ok(checkpoint)
    }
}

/// `<dir>/<session_id>.redb`
pub struct RedbStoreProvider {
    dir: PathBuf,
}

impl RedbStoreProvider {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.redb", session_id))
    }
}

impl StoreProvider for RedbStoreProvider {
    fn create(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(Arc::new(RedbSessionStore::create(path)?))
    }

    fn open(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StoreError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(Arc::new(RedbSessionStore::create(path)?))
    }
}
