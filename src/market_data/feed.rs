//! Moves market data from a [`DataSource`] into session queues.
//!
//! Backtests preload the whole window up front (so a data-source failure is
//! reported before any thread starts) and hand it to a feeder thread. Live
//! sessions either read their own `stream_events` iterator or subscribe to a
//! [`SharedFeed`] that multiplexes one upstream stream into many queues.

use crate::config::SessionConfig;
use crate::event_queue::{EventQueue, PushOutcome};
use crate::market_data::source::{DataSource, DataSourceError, EventStream};
use crate::market_data::types::MarketData;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

// ============================================================================
// Backtest preload
// ============================================================================

/// Everything in the session window for the configured symbols, sorted by
/// `(timestamp, kind)`.
pub fn preload(source: &dyn DataSource, config: &SessionConfig) -> Result<Vec<MarketData>, DataSourceError> {
    let start = config.start_ns.unwrap_or(i64::MIN);
    let end = config.end_ns.unwrap_or(i64::MAX);
    let mut items = Vec::new();
    for symbol in &config.symbols {
        items.extend(source.get_quotes(symbol, start, end, None)?.into_iter().map(MarketData::Quote));
        items.extend(source.get_trades(symbol, start, end, None)?.into_iter().map(MarketData::Trade));
        items.extend(source.get_bars(symbol, start, end, None)?.into_iter().map(MarketData::Bar));
        if config.apply_corporate_actions {
            items.extend(
                source
                    .get_corporate_actions(symbol, start, end)?
                    .into_iter()
                    .map(MarketData::CorporateAction),
            );
        }
    }
    items.sort_by_key(|m| (m.timestamp_ns(), m.kind_rank()));
    info!(count = items.len(), symbols = ?config.symbols, "📦 Backtest data preloaded");
    Ok(items)
}

/// Flags shared between a feed thread and its session.
#[derive(Clone)]
pub struct FeedSignals {
    pub stop: Arc<AtomicBool>,
    /// Set once the feed has nothing more to deliver.
    pub done: Arc<AtomicBool>,
}

fn pump<I: Iterator<Item = MarketData>>(items: I, queue: &EventQueue, signals: &FeedSignals) {
    for item in items {
        if signals.stop.load(Ordering::SeqCst) {
            break;
        }
        if matches!(queue.push(item), PushOutcome::Closed) {
            break;
        }
    }
    signals.done.store(true, Ordering::SeqCst);
}

/// Pushes preloaded items into the session queue, then marks the feed done.
pub fn spawn_feeder(
    session_id: &str,
    items: Vec<MarketData>,
    queue: Arc<EventQueue>,
    signals: FeedSignals,
) -> std::io::Result<JoinHandle<()>> {
    let id = session_id.to_string();
    thread::Builder::new()
        .name(format!("feeder-{}", session_id))
        .spawn(move || {
            let total = items.len();
            pump(items.into_iter(), &queue, &signals);
            debug!(session_id = %id, total, "Feeder finished");
        })
}

/// Per-session live stream reader.
pub fn spawn_stream(
    session_id: &str,
    stream: EventStream,
    queue: Arc<EventQueue>,
    signals: FeedSignals,
) -> std::io::Result<JoinHandle<()>> {
    let id = session_id.to_string();
    thread::Builder::new()
        .name(format!("stream-{}", session_id))
        .spawn(move || {
            pump(stream, &queue, &signals);
            info!(session_id = %id, "Live stream ended");
        })
}

// ============================================================================
// Shared live feed
// ============================================================================

struct Subscriber {
    symbols: HashSet<String>,
    /// Items at or before this time were already applied before a restore.
    resume_after_ns: Option<i64>,
    queue: Arc<EventQueue>,
    done: Arc<AtomicBool>,
}

impl Subscriber {
    fn wants(&self, item: &MarketData) -> bool {
        self.symbols.contains(item.symbol())
            && self.resume_after_ns.is_none_or(|after| item.timestamp_ns() > after)
    }
}

/// One upstream `stream_events` reader fanned out to every subscribed
/// session whose symbol set contains the item's symbol.
///
/// A subscriber using the `Block` overflow policy can stall delivery to the
/// others while its queue is full. Pushes happen outside the subscriber lock,
/// so closing that queue or unsubscribing always gets through.
pub struct SharedFeed {
    source: Arc<dyn DataSource>,
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SharedFeed {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Registers a session and starts the upstream reader if it is not
    /// already running.
    pub fn subscribe(
        &self,
        session_id: &str,
        symbols: &[String],
        resume_after_ns: Option<i64>,
        queue: Arc<EventQueue>,
        done: Arc<AtomicBool>,
    ) -> Result<(), DataSourceError> {
        self.subscribers.write().insert(
            session_id.to_string(),
            Subscriber {
                symbols: symbols.iter().cloned().collect(),
                resume_after_ns,
                queue,
                done,
            },
        );
        if let Err(e) = self.ensure_running() {
            self.subscribers.write().remove(session_id);
            return Err(e);
        }
        info!(session_id, "🔌 Subscribed to shared feed");
        Ok(())
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let removed = self.subscribers.write().remove(session_id).is_some();
        if removed {
            debug!(session_id, "Unsubscribed from shared feed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn ensure_running(&self) -> Result<(), DataSourceError> {
        let mut handle = self.handle.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(finished) = handle.take() {
            let _ = finished.join();
        }
        let stream = self.source.stream_events(&[], i64::MIN, i64::MAX)?;
        self.running.store(true, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);

        let subscribers = self.subscribers.clone();
        let running = self.running.clone();
        let stop = self.stop.clone();
        let spawned = thread::Builder::new().name("shared-feed".into()).spawn(move || {
            for item in stream {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let targets: Vec<Arc<EventQueue>> = subscribers
                    .read()
                    .values()
                    .filter(|s| s.wants(&item))
                    .map(|s| s.queue.clone())
                    .collect();
                for queue in targets {
                    queue.push(item.clone());
                }
            }
            for sub in subscribers.read().values() {
                sub.done.store(true, Ordering::SeqCst);
            }
            running.store(false, Ordering::SeqCst);
            info!("Shared feed ended");
        });
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                warn!(error = %e, "Failed to spawn shared feed thread");
                Err(DataSourceError::Io(e))
            }
        }
    }

    /// Stops the upstream reader and joins it.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for sub in self.subscribers.read().values() {
            sub.queue.close();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SharedFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_queue::OverflowPolicy;
    use crate::market_data::source::InMemoryDataSource;
    use crate::market_data::types::{CorporateAction, CorporateActionKind, Quote, Trade};
    use rust_decimal_macros::dec;
    use std::time::{Duration, Instant};

    fn trade(symbol: &str, ts: i64) -> MarketData {
        MarketData::Trade(Trade {
            symbol: symbol.into(),
            price: dec!(50),
            size: dec!(10),
            timestamp_ns: ts,
        })
    }

    fn quote(symbol: &str, ts: i64) -> MarketData {
        MarketData::Quote(Quote {
            symbol: symbol.into(),
            bid_price: dec!(49.99),
            bid_size: dec!(100),
            ask_price: dec!(50.01),
            ask_size: dec!(100),
            timestamp_ns: ts,
        })
    }

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_preload_orders_by_time_then_kind() {
        let source = InMemoryDataSource::from_items(vec![
            trade("AAPL", 20),
            quote("AAPL", 20),
            trade("MSFT", 10),
            MarketData::CorporateAction(CorporateAction {
                symbol: "AAPL".into(),
                kind: CorporateActionKind::Dividend {
                    amount_per_share: dec!(0.25),
                },
                timestamp_ns: 20,
            }),
        ]);
        let mut cfg = SessionConfig::with_symbols(&["AAPL", "MSFT"]);
        cfg.apply_corporate_actions = true;
        let items = preload(&source, &cfg).unwrap();
        let ranks: Vec<(i64, u8)> = items.iter().map(|m| (m.timestamp_ns(), m.kind_rank())).collect();
        assert_eq!(ranks, vec![(10, 2), (20, 0), (20, 1), (20, 2)]);

        cfg.apply_corporate_actions = false;
        assert_eq!(preload(&source, &cfg).unwrap().len(), 3);
    }

    #[test]
    fn test_preload_surfaces_unavailable_source() {
        let source = InMemoryDataSource::new();
        source.set_unavailable(true);
        let cfg = SessionConfig::with_symbols(&["AAPL"]);
        assert!(preload(&source, &cfg).is_err());
    }

    #[test]
    fn test_feeder_delivers_and_signals_done() {
        let queue = Arc::new(EventQueue::new(0, OverflowPolicy::Block));
        let signals = FeedSignals {
            stop: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(false)),
        };
        let handle = spawn_feeder("t", vec![trade("AAPL", 1), trade("AAPL", 2)], queue.clone(), signals.clone()).unwrap();
        handle.join().unwrap();
        assert!(signals.done.load(Ordering::SeqCst));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_shared_feed_routes_by_symbol() {
        let source: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::from_items(vec![
            trade("AAPL", 1),
            trade("MSFT", 2),
            trade("AAPL", 3),
        ]));
        let feed = SharedFeed::new(source);
        let aapl = Arc::new(EventQueue::new(0, OverflowPolicy::Block));
        let done = Arc::new(AtomicBool::new(false));
        feed.subscribe("a", &["AAPL".to_string()], None, aapl.clone(), done.clone()).unwrap();
        wait_for(&done);
        assert_eq!(aapl.size(), 2);
        feed.shutdown();
    }

    #[test]
    fn test_shared_feed_skips_items_before_resume_point() {
        let source: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::from_items(vec![
            trade("AAPL", 1),
            trade("AAPL", 2),
            trade("AAPL", 3),
        ]));
        let feed = SharedFeed::new(source);
        let queue = Arc::new(EventQueue::new(0, OverflowPolicy::Block));
        let done = Arc::new(AtomicBool::new(false));
        feed.subscribe("a", &["AAPL".to_string()], Some(2), queue.clone(), done.clone())
            .unwrap();
        wait_for(&done);
        let delivered: Vec<i64> = std::iter::from_fn(|| queue.try_pop()).map(|e| e.timestamp_ns).collect();
        assert_eq!(delivered, vec![3]);
        feed.shutdown();
    }

    #[test]
    fn test_unsubscribe_while_push_is_blocked() {
        let items: Vec<MarketData> = (1..=100).map(|ts| trade("AAPL", ts)).collect();
        let source: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::from_items(items));
        let feed = SharedFeed::new(source);
        let queue = Arc::new(EventQueue::new(1, OverflowPolicy::Block));
        let done = Arc::new(AtomicBool::new(false));
        feed.subscribe("a", &["AAPL".to_string()], None, queue.clone(), done.clone())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.size() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // The reader is parked on the full queue; taking the write lock must
        // not wait for it.
        let started = Instant::now();
        assert!(feed.unsubscribe("a"));
        assert!(started.elapsed() < Duration::from_secs(1));
        queue.close();
        feed.shutdown();
        assert_eq!(feed.subscriber_count(), 0);
    }
}
