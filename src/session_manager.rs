//! Session registry and control surface.
//!
//! Every operation is keyed by session id. Lookups that miss return `None`,
//! `false`, or [`SessionError::NotFound`] depending on the operation's shape;
//! nothing here panics on a bad id.

use crate::account::{AccountManager, ClosedTrade};
use crate::config::{EngineConfig, FeedMode, SessionConfig};
use crate::context::{seed_from_id, IdProvider, RandomIdProvider, SystemTimeProvider, TimeProvider};
use crate::event::Event;
use crate::event_queue::PushOutcome;
use crate::market_data::feed::{self, SharedFeed};
use crate::market_data::source::{DataSource, DataSourceError, EventStream};
use crate::market_data::types::MarketData;
use crate::metrics;
use crate::model::{AccountState, Order, OrderRequest, Position};
use crate::performance::PerformanceSummary;
use crate::persistence::redb_store::RedbStoreProvider;
use crate::persistence::store::{MemoryStoreProvider, SessionStore, StoreError, StoreProvider};
use crate::recovery;
use crate::session::state::SessionCore;
use crate::session::{CallbackList, Session, SessionInit, SessionStats, SessionStatus, StopHandle};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session config: {0}")]
    InvalidConfig(String),
    #[error("Session '{0}' already exists")]
    DuplicateId(String),
    #[error("Session '{0}' not found")]
    NotFound(String),
    #[error("Session '{0}' has already been started")]
    AlreadyStarted(String),
    #[error("Session '{id}' is {status}; cannot {action}")]
    InvalidState {
        id: String,
        status: SessionStatus,
        action: &'static str,
    },
    #[error("Data source unavailable: {0}")]
    DataSourceUnavailable(#[from] DataSourceError),
    #[error("Durability failure: {0}")]
    Durability(#[from] StoreError),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Holds a session id between the duplicate check and registration, so
/// store I/O runs without the registry lock.
struct IdReservation<'a> {
    reserved: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.id);
    }
}

pub struct SessionManager {
    engine: EngineConfig,
    source: Arc<dyn DataSource>,
    stores: Arc<dyn StoreProvider>,
    ids: Arc<dyn IdProvider>,
    time: Arc<dyn TimeProvider>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    reserved: Mutex<HashSet<String>>,
    callbacks: Arc<CallbackList>,
    shared_feed: Mutex<Option<Arc<SharedFeed>>>,
}

impl SessionManager {
    /// Sessions persist to redb files under `engine.wal_dir` when set, and
    /// to memory otherwise.
    pub fn new(engine: EngineConfig, source: Arc<dyn DataSource>) -> Result<Self, SessionError> {
        let stores: Arc<dyn StoreProvider> = match &engine.wal_dir {
            Some(dir) => Arc::new(RedbStoreProvider::new(dir)?),
            None => Arc::new(MemoryStoreProvider::new()),
        };
        info!(
            wal_dir = ?engine.wal_dir,
            checkpoint_interval = engine.checkpoint_interval_events,
            shared_feed = engine.enable_shared_feed,
            "SessionManager initialized"
        );
        Ok(Self {
            engine,
            source,
            stores,
            ids: Arc::new(RandomIdProvider),
            time: Arc::new(SystemTimeProvider),
            sessions: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            callbacks: Arc::new(CallbackList::new()),
            shared_feed: Mutex::new(None),
        })
    }

    pub fn with_store_provider(mut self, stores: Arc<dyn StoreProvider>) -> Self {
        self.stores = stores;
        self
    }

    /// Used for generated session ids. Order ids are derived per session
    /// from its WAL position.
    pub fn with_id_provider(mut self, ids: Arc<dyn IdProvider>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    fn update_active_gauge(&self, sessions: &HashMap<String, Arc<Session>>) {
        metrics::set_active_sessions(sessions.len() as i64);
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.session(id).ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// A session that still accepts commands.
    fn live_session(&self, id: &str) -> Option<Arc<Session>> {
        self.session(id).filter(|s| !s.status().is_terminal())
    }

    fn build_core(&self, id: &str, config: &SessionConfig, store: Arc<dyn SessionStore>) -> (SessionCore, Arc<AccountManager>, u64) {
        let seed = config.rng_seed.unwrap_or_else(|| seed_from_id(id));
        let account = Arc::new(AccountManager::new(config.initial_capital, config.margin.clone()));
        let core = SessionCore::new(id, config, &self.engine, seed, store, account.clone());
        (core, account, seed)
    }

    fn reserve(&self, id: &str) -> Result<IdReservation<'_>, SessionError> {
        let mut reserved = self.reserved.lock();
        if reserved.contains(id) || self.sessions.lock().contains_key(id) {
            return Err(SessionError::DuplicateId(id.to_string()));
        }
        reserved.insert(id.to_string());
        Ok(IdReservation {
            reserved: &self.reserved,
            id: id.to_string(),
        })
    }

    fn register(&self, id: &str, session: Arc<Session>) {
        let mut sessions = self.sessions.lock();
        sessions.insert(id.to_string(), session);
        self.update_active_gauge(&sessions);
    }

    // --- Lifecycle ---

    /// Validates and registers a session. Data is not touched until start.
    pub fn create_session(&self, config: SessionConfig, id: Option<&str>) -> Result<Arc<Session>, SessionError> {
        let mut config = config;
        config.normalize();
        config.validate().map_err(SessionError::InvalidConfig)?;
        let id = match id.map(str::trim) {
            Some("") => return Err(SessionError::InvalidConfig("session id must not be blank".into())),
            Some(id) => id.to_string(),
            None => self.ids.new_id(),
        };

        let _reservation = self.reserve(&id)?;
        let store = self.stores.create(&id)?;
        store.save_config(&config)?;
        let (core, account, seed) = self.build_core(&id, &config, store);
        let session = Arc::new(Session::new(SessionInit {
            id: id.clone(),
            clock_ns: config.start_ns.unwrap_or(0),
            config,
            core,
            account,
            callbacks: self.callbacks.clone(),
            created_at_ms: self.time.now_millis(),
            last_event_seq: 0,
            resume_after_ns: None,
        }));
        self.register(&id, session.clone());
        info!(session_id = %id, seed, "🆕 Session created");
        Ok(session)
    }

    fn shared_feed(&self) -> Arc<SharedFeed> {
        self.shared_feed
            .lock()
            .get_or_insert_with(|| Arc::new(SharedFeed::new(self.source.clone())))
            .clone()
    }

    /// Backtests preload their window on the calling thread first, so a
    /// data-source failure returns an error and leaves the session Created.
    pub fn start_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.require(id)?;
        match session.status() {
            SessionStatus::Created => {}
            SessionStatus::Running | SessionStatus::Paused => {
                return Err(SessionError::AlreadyStarted(id.to_string()));
            }
            status => {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "start",
                });
            }
        }
        let config = session.config().clone();
        let resume_after = session.resume_after_ns();
        let signals = session.feed_signals();

        // Feed input is acquired before the status flips.
        enum Input {
            Preloaded(Vec<MarketData>),
            Stream(EventStream),
            Shared,
        }
        let input = match config.mode {
            FeedMode::Backtest => {
                let mut items = feed::preload(self.source.as_ref(), &config).inspect_err(|e| {
                    warn!(session_id = %id, error = %e, "Backtest preload failed");
                })?;
                if let Some(after) = resume_after {
                    items.retain(|m| m.timestamp_ns() > after);
                }
                Input::Preloaded(items)
            }
            FeedMode::Live if self.engine.enable_shared_feed => {
                self.shared_feed().subscribe(
                    id,
                    &config.symbols,
                    resume_after,
                    session.queue().clone(),
                    signals.done.clone(),
                )?;
                Input::Shared
            }
            FeedMode::Live => {
                let start = config.start_ns.unwrap_or(i64::MIN);
                let end = config.end_ns.unwrap_or(i64::MAX);
                let stream = self.source.stream_events(&config.symbols, start, end)?;
                let stream: EventStream = match resume_after {
                    Some(after) => Box::new(stream.filter(move |m| m.timestamp_ns() > after)),
                    None => stream,
                };
                Input::Stream(stream)
            }
        };

        if let Err(status) = session.transition(&[SessionStatus::Created], SessionStatus::Running) {
            return Err(SessionError::InvalidState {
                id: id.to_string(),
                status,
                action: "start",
            });
        }

        let runner = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || runner.run_loop());
        let loop_handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = session.transition(&[SessionStatus::Running], SessionStatus::Created);
                return Err(SessionError::Spawn(e));
            }
        };
        session.add_worker(loop_handle);

        match input {
            Input::Preloaded(items) => {
                let count = items.len();
                session.add_worker(feed::spawn_feeder(id, items, session.queue().clone(), signals)?);
                info!(session_id = %id, events = count, "▶️ Backtest session started");
            }
            Input::Stream(stream) => {
                session.add_worker(feed::spawn_stream(id, stream, session.queue().clone(), signals)?);
                info!(session_id = %id, "▶️ Live session started");
            }
            Input::Shared => {
                info!(session_id = %id, "▶️ Live session started on shared feed");
            }
        }
        session.mark_started(self.time.now_millis());
        Ok(())
    }

    pub fn pause_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.require(id)?;
        session
            .transition(&[SessionStatus::Running], SessionStatus::Paused)
            .map_err(|status| SessionError::InvalidState {
                id: id.to_string(),
                status,
                action: "pause",
            })?;
        session.clock().pause();
        info!(session_id = %id, "⏸️ Session paused");
        Ok(())
    }

    pub fn resume_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.require(id)?;
        session
            .transition(&[SessionStatus::Paused], SessionStatus::Running)
            .map_err(|status| SessionError::InvalidState {
                id: id.to_string(),
                status,
                action: "resume",
            })?;
        session.clock().resume();
        info!(session_id = %id, "▶️ Session resumed");
        Ok(())
    }

    /// Non-blocking stop. The returned handle joins the session's threads on
    /// `wait` or drop.
    pub fn request_stop(&self, id: &str) -> Result<StopHandle, SessionError> {
        let session = self.require(id)?;
        // Closing the queue first releases a shared-feed push blocked on it.
        let handle = session.request_stop();
        if let Some(feed) = self.shared_feed.lock().as_ref() {
            feed.unsubscribe(id);
        }
        Ok(handle)
    }

    pub fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        self.request_stop(id)?.wait();
        info!(session_id = %id, "⏹️ Session stopped");
        Ok(())
    }

    /// Stops, joins, and unregisters. Durable state stays in the store.
    pub fn destroy_session(&self, id: &str) -> Result<(), SessionError> {
        self.request_stop(id)?.wait();
        let mut sessions = self.sessions.lock();
        sessions.remove(id);
        self.update_active_gauge(&sessions);
        info!(session_id = %id, "🗑️ Session destroyed");
        Ok(())
    }

    /// Rebuilds a session from its store (checkpoint plus WAL tail) and
    /// registers it as Created. Starting it feeds only data after the
    /// recovered clock.
    pub fn restore_session(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let _reservation = self.reserve(id)?;
        let store = self.stores.open(id).map_err(|e| match e {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Durability(other),
        })?;
        let config = store
            .load_config()?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let (mut core, account, seed) = self.build_core(id, &config, store);
        let report = recovery::recover(&mut core, seed)?;

        let session = Arc::new(Session::new(SessionInit {
            id: id.to_string(),
            clock_ns: report.clock_ns.unwrap_or(config.start_ns.unwrap_or(0)),
            config,
            core,
            account,
            callbacks: self.callbacks.clone(),
            created_at_ms: self.time.now_millis(),
            last_event_seq: report.last_event_seq,
            resume_after_ns: report.clock_ns,
        }));

        self.register(id, session.clone());
        info!(
            session_id = %id,
            replayed = report.replayed,
            wal_seq = report.last_wal_seq,
            "♻️ Session restored"
        );
        Ok(session)
    }

    /// Stops every session and joins all threads.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.sessions.lock();
            let drained = registry.drain().map(|(_, s)| s).collect();
            self.update_active_gauge(&registry);
            drained
        };
        let handles: Vec<StopHandle> = sessions.iter().map(|s| s.request_stop()).collect();
        for handle in handles {
            handle.wait();
        }
        if let Some(feed) = self.shared_feed.lock().take() {
            feed.shutdown();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "SessionManager shut down");
        }
    }

    // --- Orders ---

    /// Returns the new order id. Orders that fail validation or admission are
    /// still assigned an id and recorded as REJECTED. `None` means the
    /// session is unknown, no longer accepting commands, or failed to persist.
    pub fn submit_order(&self, id: &str, request: OrderRequest) -> Option<String> {
        let session = self.live_session(id)?;
        match session.submit_order(request) {
            Ok(order) => Some(order.id),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Order submission failed");
                None
            }
        }
    }

    /// False for unknown, terminal or already-closed orders, and for
    /// sessions that no longer accept commands.
    pub fn cancel_order(&self, id: &str, order_id: &str) -> bool {
        let Some(session) = self.live_session(id) else {
            return false;
        };
        matches!(session.cancel_order(order_id), Ok(Some(_)))
    }

    // --- Clock control ---

    pub fn set_speed(&self, id: &str, factor: f64) -> bool {
        self.live_session(id)
            .is_some_and(|s| s.clock().set_speed(factor))
    }

    /// Scrubs the clock without replaying the skipped interval.
    pub fn jump_to(&self, id: &str, ts_ns: i64) -> bool {
        let Some(session) = self.live_session(id) else {
            return false;
        };
        session.clock().jump_to(ts_ns);
        true
    }

    /// Applies every queued event up to `ts_ns` without pacing, even while
    /// paused. Sessions without a running loop drain on the calling thread.
    pub fn fast_forward(&self, id: &str, ts_ns: i64) -> bool {
        let Some(session) = self.live_session(id) else {
            return false;
        };
        if !session.clock().fast_forward(ts_ns) {
            return false;
        }
        if session.status() == SessionStatus::Created && !session.has_workers() {
            return session.drain_until(ts_ns);
        }
        true
    }

    /// Sessions currently attached to the shared live feed.
    pub fn shared_feed_subscribers(&self) -> usize {
        self.shared_feed
            .lock()
            .as_ref()
            .map_or(0, |feed| feed.subscriber_count())
    }

    pub fn watermark_ns(&self, id: &str) -> Option<i64> {
        self.session(id)?.watermark_ns()
    }

    // --- Corporate actions and direct input ---

    pub fn apply_dividend(&self, id: &str, symbol: &str, amount_per_share: Decimal) -> bool {
        let Some(session) = self.live_session(id) else {
            return false;
        };
        session
            .apply_dividend(&symbol.trim().to_uppercase(), amount_per_share)
            .unwrap_or(false)
    }

    pub fn apply_split(&self, id: &str, symbol: &str, ratio: Decimal) -> bool {
        if ratio <= Decimal::ZERO {
            return false;
        }
        let Some(session) = self.live_session(id) else {
            return false;
        };
        session
            .apply_split(&symbol.trim().to_uppercase(), ratio)
            .unwrap_or(false)
    }

    /// Pushes one item straight into a session's queue.
    pub fn ingest(&self, id: &str, data: MarketData) -> Option<PushOutcome> {
        Some(self.live_session(id)?.queue().push(data))
    }

    pub fn add_event_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.callbacks.add(Arc::new(callback));
    }

    // --- Queries ---

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        Some(self.session(id)?.status())
    }

    pub fn get_order(&self, id: &str, order_id: &str) -> Option<Order> {
        self.session(id)?.order(order_id)
    }

    pub fn open_orders(&self, id: &str) -> Option<Vec<Order>> {
        Some(self.session(id)?.open_orders())
    }

    pub fn account_state(&self, id: &str) -> Option<AccountState> {
        Some(self.session(id)?.account().state())
    }

    pub fn positions(&self, id: &str) -> Option<Vec<Position>> {
        Some(self.session(id)?.account().positions())
    }

    pub fn trade_history(&self, id: &str) -> Option<Vec<ClosedTrade>> {
        Some(self.session(id)?.account().trade_history())
    }

    pub fn performance(&self, id: &str) -> Option<PerformanceSummary> {
        Some(self.session(id)?.performance())
    }

    pub fn stats(&self, id: &str) -> Option<SessionStats> {
        Some(self.session(id)?.stats())
    }

    pub fn list_sessions(&self) -> Vec<SessionStats> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        let mut stats: Vec<SessionStats> = sessions.iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Polls until the session reaches a terminal status or `timeout`
    /// elapses. Returns the last observed status.
    pub fn wait_for_terminal(&self, id: &str, timeout: Option<Duration>) -> Option<SessionStatus> {
        let session = self.session(id)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let status = session.status();
            if status.is_terminal() || deadline.is_some_and(|d| Instant::now() >= d) {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SequentialIdProvider;
    use crate::market_data::source::InMemoryDataSource;

    fn manager() -> SessionManager {
        SessionManager::new(EngineConfig::default(), Arc::new(InMemoryDataSource::new()))
            .unwrap()
            .with_id_provider(Arc::new(SequentialIdProvider::new("sim")))
    }

    #[test]
    fn test_generated_ids() {
        let mgr = manager();
        let session = mgr
            .create_session(SessionConfig::with_symbols(&["aapl"]), None)
            .unwrap();
        assert_eq!(session.id(), "sim-000001");
        assert_eq!(session.config().symbols, vec!["AAPL".to_string()]);
    }

    #[test]
    fn test_unknown_session_shapes() {
        let mgr = manager();
        assert!(mgr.submit_order("nope", OrderRequest::market("AAPL", crate::model::Side::Buy, Decimal::ONE)).is_none());
        assert!(!mgr.cancel_order("nope", "o"));
        assert!(!mgr.set_speed("nope", 2.0));
        assert!(mgr.watermark_ns("nope").is_none());
        assert!(matches!(mgr.start_session("nope"), Err(SessionError::NotFound(_))));
        assert!(matches!(mgr.restore_session("nope"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_pause_requires_running() {
        let mgr = manager();
        mgr.create_session(SessionConfig::with_symbols(&["AAPL"]), Some("s"))
            .unwrap();
        assert!(matches!(
            mgr.pause_session("s"),
            Err(SessionError::InvalidState { status: SessionStatus::Created, .. })
        ));
    }

    #[test]
    fn test_destroy_unregisters() {
        let mgr = manager();
        mgr.create_session(SessionConfig::with_symbols(&["AAPL"]), Some("s"))
            .unwrap();
        mgr.destroy_session("s").unwrap();
        assert!(mgr.status("s").is_none());
        assert!(mgr.list_sessions().is_empty());
    }

    #[test]
    fn test_reserved_id_is_a_duplicate_until_released() {
        let mgr = manager();
        let reservation = mgr.reserve("s").unwrap();
        assert!(matches!(
            mgr.create_session(SessionConfig::with_symbols(&["AAPL"]), Some("s")),
            Err(SessionError::DuplicateId(_))
        ));
        assert!(matches!(mgr.restore_session("s"), Err(SessionError::DuplicateId(_))));
        drop(reservation);

        mgr.create_session(SessionConfig::with_symbols(&["AAPL"]), Some("s"))
            .unwrap();
        assert!(mgr.reserved.lock().is_empty());
        assert!(matches!(mgr.reserve("s"), Err(SessionError::DuplicateId(_))));
    }
}
