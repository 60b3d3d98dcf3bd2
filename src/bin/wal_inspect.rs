//! Dumps a persisted session: stored config, newest checkpoint, WAL tail,
//! and the account state recovery would rebuild from them.
//!
//! Usage: wal_inspect <wal_dir> <session_id>

use marketsim_rs::config::EngineConfig;
use marketsim_rs::market_data::source::InMemoryDataSource;
use marketsim_rs::persistence::redb_store::RedbStoreProvider;
use marketsim_rs::persistence::store::StoreProvider;
use marketsim_rs::session_manager::SessionManager;
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <wal_dir> <session_id>", args[0]);
        process::exit(2);
    }
    let dir = PathBuf::from(&args[1]);
    let session_id = &args[2];

    if let Err(e) = inspect(dir, session_id) {
        error!(session_id = %session_id, error = %e, "❌ Inspection failed");
        process::exit(1);
    }
}

fn inspect(dir: PathBuf, session_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let provider = RedbStoreProvider::new(&dir)?;
    let store = provider.open(session_id)?;

    if let Some(config) = store.load_config()? {
        println!("# config");
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    let checkpoint = store.load_latest_checkpoint()?;
    let after = match &checkpoint {
        Some(ckpt) => {
            println!(
                "# checkpoint wal_seq={} event_seq={} clock_ns={} open_orders={} events={}",
                ckpt.last_wal_seq,
                ckpt.last_event_seq,
                ckpt.clock_ns,
                ckpt.open_orders.len(),
                ckpt.events_processed
            );
            ckpt.last_wal_seq
        }
        None => {
            println!("# no checkpoint");
            0
        }
    };

    let records = store.entries_after(after)?;
    println!("# wal records after {}: {}", after, records.len());
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    // Release the file before the manager opens it again.
    drop(store);
    drop(provider);

    let engine = EngineConfig {
        wal_dir: Some(dir),
        ..Default::default()
    };
    let manager = SessionManager::new(engine, Arc::new(InMemoryDataSource::new()))?;
    manager.restore_session(session_id)?;
    info!(session_id, "Recovered session for inspection");
    let report = serde_json::json!({
        "account": manager.account_state(session_id),
        "positions": manager.positions(session_id),
        "open_orders": manager.open_orders(session_id),
    });
    println!("# recovered state");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
