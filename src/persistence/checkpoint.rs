use crate::account::AccountSnapshot;
use crate::matching::MarketSnapshot;
use crate::model::Order;
use serde::{Deserialize, Serialize};

/// Full session state as of `last_wal_seq`. Recovery loads the newest one and
/// replays only WAL records after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub session_id: String,
    pub last_wal_seq: u64,
    pub last_event_seq: u64,
    pub clock_ns: i64,
    pub events_processed: u64,
    pub account: AccountSnapshot,
    /// Open orders keyed by the WAL seq that accepted them.
    pub open_orders: Vec<(u64, Order)>,
    #[serde(default)]
    pub closed_orders: Vec<Order>,
    pub market: MarketSnapshot,
}
