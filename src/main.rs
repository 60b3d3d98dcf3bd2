use marketsim_rs::config::Settings;
use marketsim_rs::market_data::source::{DataSource, InMemoryDataSource, JsonlDataSource};
use marketsim_rs::session::SessionStatus;
use marketsim_rs::session_manager::SessionManager;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();
    init_logging();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                    MARKETSIM - Paper Trading                  ║");
    info!("║            Deterministic Market Simulation Engine             ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let config_path = env::args().nth(1);
    let settings = Settings::load(config_path.as_deref())?;

    let source: Arc<dyn DataSource> = match &settings.engine.data_file {
        Some(path) => {
            info!(path = %path.display(), "Loading market data");
            Arc::new(JsonlDataSource::open(path)?)
        }
        None => {
            warn!("No data file configured; session will see no market data");
            Arc::new(InMemoryDataSource::new())
        }
    };

    let manager = Arc::new(SessionManager::new(settings.engine.clone(), source)?);
    let session = manager.create_session(settings.session.clone(), None)?;
    let id = session.id().to_string();
    manager.start_session(&id)?;
    info!(session_id = %id, "🚀 Simulation running");

    let waiter = manager.clone();
    let wait_id = id.clone();
    let finished = tokio::task::spawn_blocking(move || waiter.wait_for_terminal(&wait_id, None));

    tokio::select! {
        status = finished => {
            let status = status?;
            if status == Some(SessionStatus::Error) {
                error!(session_id = %id, error = ?manager.stats(&id).and_then(|s| s.error), "❌ Simulation failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(session_id = %id, "Interrupted; stopping session");
            manager.stop_session(&id)?;
        }
    }

    let report = serde_json::json!({
        "stats": manager.stats(&id),
        "account": manager.account_state(&id),
        "positions": manager.positions(&id),
        "performance": manager.performance(&id),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown();
    Ok(())
}
