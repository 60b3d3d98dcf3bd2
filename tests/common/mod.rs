#![allow(dead_code)]

use marketsim_rs::config::{EngineConfig, SessionConfig};
use marketsim_rs::market_data::source::{DataSource, InMemoryDataSource};
use marketsim_rs::market_data::types::{MarketData, Quote, Trade};
use marketsim_rs::session_manager::SessionManager;
use rust_decimal::Decimal;
use std::sync::Arc;

/// 2024-03-12 14:30 UTC, a Tuesday 10:30 in New York.
pub const T0: i64 = 1_710_253_800_000_000_000;
pub const SEC: i64 = 1_000_000_000;

pub fn quote(symbol: &str, bid: Decimal, ask: Decimal, size: Decimal, ts: i64) -> MarketData {
    MarketData::Quote(Quote {
        symbol: symbol.into(),
        bid_price: bid,
        bid_size: size,
        ask_price: ask,
        ask_size: size,
        timestamp_ns: ts,
    })
}

pub fn trade(symbol: &str, price: Decimal, ts: i64) -> MarketData {
    MarketData::Trade(Trade {
        symbol: symbol.into(),
        price,
        size: Decimal::ONE_HUNDRED,
        timestamp_ns: ts,
    })
}

pub fn session_config(symbols: &[&str]) -> SessionConfig {
    let mut cfg = SessionConfig::with_symbols(symbols);
    cfg.start_ns = Some(T0 - SEC);
    cfg.rng_seed = Some(7);
    cfg
}

pub fn memory_manager(source: InMemoryDataSource) -> SessionManager {
    let source: Arc<dyn DataSource> = Arc::new(source);
    SessionManager::new(EngineConfig::default(), source).unwrap()
}

/// Queues `data` on a session that has not been started and applies it on
/// the calling thread.
pub fn feed(manager: &SessionManager, id: &str, data: MarketData) {
    let ts = data.timestamp_ns();
    assert!(manager.ingest(id, data).is_some(), "ingest into {}", id);
    assert!(manager.fast_forward(id, ts + 1), "fast forward {} to {}", id, ts + 1);
}

pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("marketsim_{}_{}", tag, uuid::Uuid::new_v4()))
}
