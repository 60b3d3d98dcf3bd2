pub mod checkpoint;
pub mod redb_store;
pub mod store;
pub mod wal;

pub use checkpoint::Checkpoint;
pub use redb_store::{RedbSessionStore, RedbStoreProvider};
pub use store::{MemoryStore, MemoryStoreProvider, SessionStore, StoreError, StoreProvider};
pub use wal::{WalEntry, WalRecord, WalWriter};
