mod common;

use common::*;
use marketsim_rs::config::Settings;
use marketsim_rs::market_data::source::JsonlDataSource;
use marketsim_rs::model::{OrderRequest, OrderStatus, Side};
use marketsim_rs::session::SessionStatus;
use marketsim_rs::session_manager::SessionManager;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/aapl_day.jsonl");

#[test]
fn test_fixture_backtest_runs_to_completion() {
    let source = Arc::new(JsonlDataSource::open(FIXTURE).unwrap());
    let manager = SessionManager::new(Default::default(), source).unwrap();

    let mut cfg = session_config(&["AAPL"]);
    cfg.end_ns = Some(T0 + 120 * SEC);
    manager.create_session(cfg, Some("jsonl")).unwrap();
    let order_id = manager
        .submit_order("jsonl", OrderRequest::limit("AAPL", Side::Buy, dec!(10), dec!(150.00)))
        .unwrap();

    manager.start_session("jsonl").unwrap();
    assert_eq!(
        manager.wait_for_terminal("jsonl", Some(Duration::from_secs(10))),
        Some(SessionStatus::Completed)
    );

    // MSFT prints are outside the session's symbol set.
    let stats = manager.stats("jsonl").unwrap();
    assert_eq!(stats.events_processed, 4);
    assert_eq!(stats.last_event_ns, Some(T0 + 60 * SEC));

    assert_eq!(manager.get_order("jsonl", &order_id).unwrap().status, OrderStatus::Filled);
    let position = manager.positions("jsonl").unwrap().remove(0);
    assert_eq!(position.last_price, dec!(150.30));
    let account = manager.account_state("jsonl").unwrap();
    assert_eq!(account.cash, dec!(98500.00));
    assert_eq!(account.equity, dec!(100003.00));
}

#[test]
fn test_example_settings_load() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/marketsim.toml");
    let settings = Settings::load(Some(path)).unwrap();
    let mut session = settings.session;
    session.normalize();
    assert_eq!(session.symbols, vec!["AAPL".to_string()]);
    assert_eq!(session.rng_seed, Some(42));
    assert_eq!(session.execution.latency_ms, 5);
    assert_eq!(session.prior_closes.get("AAPL"), Some(&dec!(149.50)));
    assert_eq!(settings.engine.checkpoint_interval_events, 1000);
    assert!(session.validate().is_ok());
}
