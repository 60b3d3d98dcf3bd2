use crate::model::{Fill, Order, OrderStatus, RejectReason};
use crate::persistence::store::{SessionStore, StoreError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A state change, recorded with its realized outcome so that replay is a
/// pure assignment and never re-runs the friction model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalEntry {
    OrderAccepted {
        order: Order,
    },
    /// Rejected at admission; never entered the open-order table.
    OrderRejected {
        order: Order,
    },
    StopTriggered {
        order_id: String,
    },
    FillApplied {
        fill: Fill,
    },
    /// Canceled, expired, or rejected after acceptance.
    OrderClosed {
        order_id: String,
        status: OrderStatus,
        #[serde(default)]
        reason: Option<RejectReason>,
    },
    MarkPrice {
        symbol: String,
        price: Decimal,
    },
    DividendApplied {
        symbol: String,
        amount_per_share: Decimal,
    },
    SplitApplied {
        symbol: String,
        ratio: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    /// Position in this session's log, strictly increasing.
    pub seq: u64,
    /// Sequence number of the event or command that caused the change.
    pub trigger_seq: u64,
    pub ts_ns: i64,
    pub entry: WalEntry,
}

/// Assigns WAL sequence numbers and forwards records to the store.
pub struct WalWriter {
    store: Arc<dyn SessionStore>,
    last_seq: u64,
}

impl WalWriter {
    pub fn new(store: Arc<dyn SessionStore>, last_seq: u64) -> Self {
        Self { store, last_seq }
    }

    pub fn append(&mut self, trigger_seq: u64, ts_ns: i64, entry: WalEntry) -> Result<WalRecord, StoreError> {
        let record = WalRecord {
            seq: self.last_seq + 1,
            trigger_seq,
            ts_ns,
            entry,
        };
        self.store.append(&record)?;
        self.last_seq = record.seq;
        crate::metrics::inc_wal_appends();
        debug!(seq = record.seq, trigger_seq, "📝 WAL append");
        Ok(record)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }
}
