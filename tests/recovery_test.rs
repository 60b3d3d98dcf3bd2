mod common;

use common::*;
use marketsim_rs::config::EngineConfig;
use marketsim_rs::context::SequentialIdProvider;
use marketsim_rs::market_data::source::InMemoryDataSource;
use marketsim_rs::model::{OrderRequest, OrderStatus, Side};
use marketsim_rs::persistence::store::MemoryStoreProvider;
use marketsim_rs::session::SessionStatus;
use marketsim_rs::session_manager::{SessionError, SessionManager};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

/// Quote, a market buy, a resting limit, then a print that re-marks the
/// position.
fn build_history(manager: &SessionManager, id: &str) -> String {
    feed(manager, id, quote("AAPL", dec!(149.99), dec!(150.00), dec!(1000), T0));
    manager
        .submit_order(id, OrderRequest::market("AAPL", Side::Buy, dec!(10)))
        .unwrap();
    let resting = manager
        .submit_order(id, OrderRequest::limit("AAPL", Side::Buy, dec!(5), dec!(140)))
        .unwrap();
    feed(manager, id, trade("AAPL", dec!(151.50), T0 + SEC));
    resting
}

#[test]
fn test_redb_restore_matches_live_state() {
    let dir = temp_dir("recovery");
    let engine = EngineConfig {
        wal_dir: Some(dir.clone()),
        checkpoint_interval_events: 0,
        ..Default::default()
    };

    let (account, positions, open_orders, resting) = {
        println!("🚀 [Engine A] Building history...");
        let manager = SessionManager::new(engine.clone(), Arc::new(InMemoryDataSource::new())).unwrap();
        manager.create_session(session_config(&["AAPL"]), Some("r1")).unwrap();
        let resting = build_history(&manager, "r1");
        (
            manager.account_state("r1").unwrap(),
            manager.positions("r1").unwrap(),
            manager.open_orders("r1").unwrap(),
            resting,
        )
    };
    assert_eq!(positions[0].last_price, dec!(151.50));

    println!("🔄 [Engine B] Restoring...");
    let manager = SessionManager::new(engine, Arc::new(InMemoryDataSource::new())).unwrap();
    let session = manager.restore_session("r1").unwrap();
    assert_eq!(session.status(), SessionStatus::Created);
    assert_eq!(manager.account_state("r1").unwrap(), account);
    assert_eq!(manager.positions("r1").unwrap(), positions);
    assert_eq!(manager.open_orders("r1").unwrap(), open_orders);
    assert_eq!(manager.get_order("r1", &resting).unwrap().status, OrderStatus::New);
    assert!(matches!(manager.restore_session("r1"), Err(SessionError::DuplicateId(_))));

    // The restored session keeps trading from where it left off.
    feed(&manager, "r1", quote("AAPL", dec!(138.90), dec!(139.00), dec!(1000), T0 + 2 * SEC));
    let order = manager.get_order("r1", &resting).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.avg_fill_price, Some(dec!(139.00)));
    assert_eq!(manager.positions("r1").unwrap()[0].qty, dec!(15));

    drop(session);
    drop(manager);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_restore_from_checkpoint_and_tail() {
    let stores = Arc::new(MemoryStoreProvider::new());
    let engine = EngineConfig {
        checkpoint_interval_events: 1,
        ..Default::default()
    };
    let manager = SessionManager::new(engine, Arc::new(InMemoryDataSource::new()))
        .unwrap()
        .with_store_provider(stores.clone());
    manager.create_session(session_config(&["AAPL"]), Some("ck")).unwrap();
    build_history(&manager, "ck");

    let stats = manager.stats("ck").unwrap();
    assert!(stats.last_checkpoint_wal_seq.is_some());
    let account = manager.account_state("ck").unwrap();
    let open = manager.open_orders("ck").unwrap();

    manager.destroy_session("ck").unwrap();
    manager.restore_session("ck").unwrap();
    assert_eq!(manager.account_state("ck").unwrap(), account);
    assert_eq!(manager.open_orders("ck").unwrap(), open);
    assert_eq!(manager.stats("ck").unwrap().wal_seq, stats.wal_seq);
}

#[test]
fn test_restored_backtest_resumes_after_recovered_clock() {
    let stores = Arc::new(MemoryStoreProvider::new());
    let source = Arc::new(InMemoryDataSource::new());
    source.push(quote("AAPL", dec!(149.99), dec!(150.00), dec!(1000), T0));
    source.push(quote("AAPL", dec!(138.90), dec!(139.00), dec!(1000), T0 + 5 * SEC));

    let mut cfg = session_config(&["AAPL"]);
    cfg.end_ns = Some(T0 + 10 * SEC);

    {
        let manager = SessionManager::new(EngineConfig::default(), source.clone())
            .unwrap()
            .with_store_provider(stores.clone());
        manager.create_session(cfg, Some("bt")).unwrap();
        feed(&manager, "bt", quote("AAPL", dec!(149.99), dec!(150.00), dec!(1000), T0));
        manager
            .submit_order("bt", OrderRequest::market("AAPL", Side::Buy, dec!(10)))
            .unwrap();
        manager
            .submit_order("bt", OrderRequest::limit("AAPL", Side::Buy, dec!(5), dec!(140)))
            .unwrap();
    }

    let manager = SessionManager::new(EngineConfig::default(), source)
        .unwrap()
        .with_store_provider(stores);
    manager.restore_session("bt").unwrap();
    manager.start_session("bt").unwrap();
    assert_eq!(
        manager.wait_for_terminal("bt", Some(Duration::from_secs(10))),
        Some(SessionStatus::Completed)
    );

    // The quote at T0 predates the recovered clock and is not fed again.
    assert_eq!(manager.stats("bt").unwrap().events_processed, 1);
    assert_eq!(manager.positions("bt").unwrap()[0].qty, dec!(15));
    assert_eq!(
        manager.account_state("bt").unwrap().cash,
        dec!(100000) - dec!(1500.00) - dec!(695.00)
    );
}

#[test]
fn test_restore_unknown_session() {
    let manager = memory_manager(InMemoryDataSource::new());
    assert!(matches!(manager.restore_session("ghost"), Err(SessionError::NotFound(_))));
}

fn redb_engine(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        wal_dir: Some(dir.to_path_buf()),
        checkpoint_interval_events: 0,
        ..Default::default()
    }
}

#[test]
fn test_split_survives_restore() {
    let dir = temp_dir("split");
    let mut cfg = session_config(&["AAPL"]);
    cfg.prior_closes.insert("AAPL".into(), dec!(400));

    let (account, positions) = {
        let manager = SessionManager::new(redb_engine(&dir), Arc::new(InMemoryDataSource::new())).unwrap();
        manager.create_session(cfg, Some("sp")).unwrap();
        feed(&manager, "sp", quote("AAPL", dec!(399.99), dec!(400.00), dec!(1000), T0));
        manager
            .submit_order("sp", OrderRequest::market("AAPL", Side::Buy, dec!(10)))
            .unwrap();
        assert!(manager.apply_split("sp", "AAPL", dec!(4)));

        // A print at the post-split price sits inside the rescaled LULD band.
        feed(&manager, "sp", trade("AAPL", dec!(100), T0 + SEC));
        feed(&manager, "sp", quote("AAPL", dec!(99.99), dec!(100.00), dec!(1000), T0 + 2 * SEC));
        let live = manager
            .submit_order("sp", OrderRequest::market("AAPL", Side::Buy, dec!(4)))
            .unwrap();
        let live = manager.get_order("sp", &live).unwrap();
        assert_eq!(live.status, OrderStatus::Filled);
        assert_eq!(live.reject_reason, None);
        (manager.account_state("sp").unwrap(), manager.positions("sp").unwrap())
    };
    assert_eq!(positions[0].qty, dec!(44));

    let manager = SessionManager::new(redb_engine(&dir), Arc::new(InMemoryDataSource::new())).unwrap();
    manager.restore_session("sp").unwrap();
    assert_eq!(manager.account_state("sp").unwrap(), account);
    assert_eq!(manager.positions("sp").unwrap(), positions);

    feed(&manager, "sp", trade("AAPL", dec!(100), T0 + 3 * SEC));
    feed(&manager, "sp", quote("AAPL", dec!(99.99), dec!(100.00), dec!(1000), T0 + 4 * SEC));
    let restored = manager
        .submit_order("sp", OrderRequest::market("AAPL", Side::Buy, dec!(4)))
        .unwrap();
    let restored = manager.get_order("sp", &restored).unwrap();
    assert_eq!(restored.status, OrderStatus::Filled);
    assert_eq!(restored.reject_reason, None);
    assert_eq!(manager.positions("sp").unwrap()[0].qty, dec!(48));

    drop(manager);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_dividend_survives_restore() {
    let stores = Arc::new(MemoryStoreProvider::new());
    let manager = SessionManager::new(EngineConfig::default(), Arc::new(InMemoryDataSource::new()))
        .unwrap()
        .with_store_provider(stores.clone());
    manager.create_session(session_config(&["AAPL"]), Some("dv")).unwrap();
    assert!(!manager.apply_dividend("dv", "AAPL", dec!(0.50)));

    feed(&manager, "dv", quote("AAPL", dec!(149.99), dec!(150.00), dec!(1000), T0));
    manager
        .submit_order("dv", OrderRequest::market("AAPL", Side::Buy, dec!(10)))
        .unwrap();
    let before = manager.account_state("dv").unwrap().cash;
    assert!(manager.apply_dividend("dv", "aapl", dec!(0.50)));
    let account = manager.account_state("dv").unwrap();
    assert_eq!(account.cash, before + dec!(5.00));

    manager.destroy_session("dv").unwrap();
    manager.restore_session("dv").unwrap();
    assert_eq!(manager.account_state("dv").unwrap(), account);
}

#[test]
fn test_restored_session_issues_fresh_order_ids() {
    let stores = Arc::new(MemoryStoreProvider::new());
    let first_id = {
        let manager = SessionManager::new(EngineConfig::default(), Arc::new(InMemoryDataSource::new()))
            .unwrap()
            .with_store_provider(stores.clone())
            .with_id_provider(Arc::new(SequentialIdProvider::new("ord")));
        manager.create_session(session_config(&["AAPL"]), Some("ids")).unwrap();
        feed(&manager, "ids", quote("AAPL", dec!(149.99), dec!(150.00), dec!(1000), T0));
        manager
            .submit_order("ids", OrderRequest::limit("AAPL", Side::Buy, dec!(5), dec!(140)))
            .unwrap()
    };

    let manager = SessionManager::new(EngineConfig::default(), Arc::new(InMemoryDataSource::new()))
        .unwrap()
        .with_store_provider(stores)
        .with_id_provider(Arc::new(SequentialIdProvider::new("ord")));
    manager.restore_session("ids").unwrap();
    let second_id = manager
        .submit_order("ids", OrderRequest::limit("AAPL", Side::Buy, dec!(5), dec!(141)))
        .expect("restored session accepts new orders");

    assert_ne!(first_id, second_id);
    assert_eq!(manager.status("ids"), Some(SessionStatus::Created));
    let open: Vec<String> = manager.open_orders("ids").unwrap().into_iter().map(|o| o.id).collect();
    assert_eq!(open, vec![first_id, second_id]);
}
