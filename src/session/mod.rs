//! A running simulation: clock, queue, account, and core bound together, plus
//! the processing loop that drives them.
//!
//! The loop is the only thing that consumes the queue. Order commands arrive
//! from other threads and take the same core lock, so every state change is
//! totally ordered against market events. Callbacks run after the lock is
//! released.

pub mod state;

use self::state::SessionCore;
use crate::account::{AccountManager, ExposureMetrics};
use crate::config::{FeedMode, SessionConfig};
use crate::event::Event;
use crate::event_queue::EventQueue;
use crate::market_data::feed::FeedSignals;
use crate::metrics;
use crate::model::{Order, OrderRequest};
use crate::performance::PerformanceSummary;
use crate::persistence::store::StoreError;
use crate::time_engine::TimeEngine;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const PACING_SLICE: Duration = Duration::from_millis(50);
const NO_WATERMARK: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Error
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// --- Callbacks ---

pub type EventCallback = Arc<dyn Fn(&str, &Event) + Send + Sync>;

/// Shared by every session of a manager. A panicking callback is logged and
/// skipped; it never takes the session down.
#[derive(Default)]
pub struct CallbackList {
    callbacks: RwLock<Vec<EventCallback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: EventCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch<'a, I: IntoIterator<Item = &'a Event>>(&self, session_id: &str, events: I) {
        let callbacks = self.callbacks.read().clone();
        if callbacks.is_empty() {
            return;
        }
        for event in events {
            for callback in &callbacks {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(session_id, event)));
                if delivered.is_err() {
                    warn!(session_id, seq = event.seq, "Event callback panicked");
                }
            }
        }
    }
}

// --- Stop handle ---

/// Joins a stopping session's threads. Dropping the handle joins too, so no
/// worker outlives it.
pub struct StopHandle {
    session_id: String,
    handles: Vec<JoinHandle<()>>,
}

impl StopHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    pub fn wait(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            // A callback running on the loop thread may stop its own session.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(session_id = %self.session_id, "Session worker panicked during shutdown");
            }
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.join_all();
    }
}

// --- Stats ---

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: String,
    pub status: SessionStatus,
    pub mode: FeedMode,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub events_enqueued: u64,
    pub events_dropped: u64,
    pub events_processed: u64,
    pub events_skipped: u64,
    pub queue_size: usize,
    pub last_event_ns: Option<i64>,
    pub clock_ns: i64,
    pub speed_factor: f64,
    pub open_orders: usize,
    pub wal_seq: u64,
    pub last_checkpoint_wal_seq: Option<u64>,
    pub error: Option<String>,
    pub exposure: ExposureMetrics,
}

// --- Session ---

pub struct SessionInit {
    pub id: String,
    pub config: SessionConfig,
    pub core: SessionCore,
    pub account: Arc<AccountManager>,
    pub callbacks: Arc<CallbackList>,
    pub created_at_ms: i64,
    /// Clock start; the recovered clock for restored sessions.
    pub clock_ns: i64,
    /// Next event sequence continues after this one.
    pub last_event_seq: u64,
    /// Restored sessions ignore feed items at or before this time.
    pub resume_after_ns: Option<i64>,
}

pub struct Session {
    id: String,
    config: SessionConfig,
    status: RwLock<SessionStatus>,
    clock: Arc<TimeEngine>,
    queue: Arc<EventQueue>,
    account: Arc<AccountManager>,
    core: Mutex<SessionCore>,
    callbacks: Arc<CallbackList>,
    stop: Arc<AtomicBool>,
    feed_done: Arc<AtomicBool>,
    /// An event popped but not yet applied (paused, or beyond a fast-forward
    /// target). Always applied before anything else in the queue.
    held: Mutex<Option<Event>>,
    events_skipped: AtomicU64,
    watermark_ns: AtomicI64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    created_at_ms: i64,
    started_at_ms: Mutex<Option<i64>>,
    error: RwLock<Option<String>>,
    resume_after_ns: Option<i64>,
}

impl Session {
    pub fn new(init: SessionInit) -> Self {
        let queue = EventQueue::new(init.config.queue_capacity, init.config.overflow_policy)
            .with_starting_seq(init.last_event_seq);
        Self {
            clock: Arc::new(TimeEngine::new(init.clock_ns, init.config.speed_factor)),
            queue: Arc::new(queue),
            id: init.id,
            config: init.config,
            status: RwLock::new(SessionStatus::Created),
            account: init.account,
            core: Mutex::new(init.core),
            callbacks: init.callbacks,
            stop: Arc::new(AtomicBool::new(false)),
            feed_done: Arc::new(AtomicBool::new(false)),
            held: Mutex::new(None),
            events_skipped: AtomicU64::new(0),
            watermark_ns: AtomicI64::new(NO_WATERMARK),
            workers: Mutex::new(Vec::new()),
            created_at_ms: init.created_at_ms,
            started_at_ms: Mutex::new(None),
            error: RwLock::new(None),
            resume_after_ns: init.resume_after_ns,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn clock(&self) -> &Arc<TimeEngine> {
        &self.clock
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn account(&self) -> &Arc<AccountManager> {
        &self.account
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn resume_after_ns(&self) -> Option<i64> {
        self.resume_after_ns
    }

    /// Last applied market event time.
    pub fn watermark_ns(&self) -> Option<i64> {
        match self.watermark_ns.load(Ordering::SeqCst) {
            NO_WATERMARK => None,
            ts => Some(ts),
        }
    }

    /// Moves to `to` if the current status is one of `from`. On refusal the
    /// current status is returned.
    pub fn transition(&self, from: &[SessionStatus], to: SessionStatus) -> Result<SessionStatus, SessionStatus> {
        let mut status = self.status.write();
        if from.contains(&*status) {
            let previous = *status;
            *status = to;
            debug!(session_id = %self.id, from = %previous, to = %to, "Session status");
            Ok(previous)
        } else {
            Err(*status)
        }
    }

    pub fn mark_started(&self, at_ms: i64) {
        *self.started_at_ms.lock() = Some(at_ms);
    }

    pub fn feed_signals(&self) -> FeedSignals {
        FeedSignals {
            stop: self.stop.clone(),
            done: self.feed_done.clone(),
        }
    }

    pub fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Flags the loop and feeders to stop at the next event boundary and
    /// hands back their join handles.
    pub fn request_stop(&self) -> StopHandle {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
        let _ = self.transition(
            &[SessionStatus::Created, SessionStatus::Running, SessionStatus::Paused],
            SessionStatus::Stopped,
        );
        self.clock.resume();
        StopHandle {
            session_id: self.id.clone(),
            handles: std::mem::take(&mut *self.workers.lock()),
        }
    }

    fn fail(&self, message: String) {
        error!(session_id = %self.id, error = %message, "💥 Session failed");
        metrics::inc_session_errors();
        *self.error.write() = Some(message);
        *self.status.write() = SessionStatus::Error;
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
    }

    /// Runs `f` under the core lock, dispatches whatever it emitted, and moves
    /// the session to Error on a durability failure.
    fn with_core<T>(&self, f: impl FnOnce(&mut SessionCore, i64) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let now = self.clock.now_ns();
        let (result, emitted) = {
            let mut core = self.core.lock();
            let result = f(&mut core, now);
            (result, core.take_emitted())
        };
        self.callbacks.dispatch(&self.id, emitted.iter());
        if let Err(e) = &result {
            self.fail(format!("durability failure: {}", e));
        }
        result
    }

    // --- Commands ---

    pub fn submit_order(&self, request: OrderRequest) -> Result<Order, StoreError> {
        self.with_core(|core, now| core.submit(request, now))
    }

    pub fn cancel_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.with_core(|core, now| core.cancel(order_id, now))
    }

    pub fn apply_dividend(&self, symbol: &str, amount_per_share: Decimal) -> Result<bool, StoreError> {
        self.with_core(|core, now| core.apply_dividend(symbol, amount_per_share, now))
    }

    pub fn apply_split(&self, symbol: &str, ratio: Decimal) -> Result<bool, StoreError> {
        self.with_core(|core, now| core.apply_split(symbol, ratio, now))
    }

    pub fn checkpoint(&self) -> Result<u64, StoreError> {
        self.with_core(|core, now| core.checkpoint(now))
    }

    // --- Queries ---

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.core.lock().order(order_id)
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.core.lock().open_orders()
    }

    pub fn performance(&self) -> PerformanceSummary {
        self.core.lock().performance().summary()
    }

    pub fn stats(&self) -> SessionStats {
        let (events_processed, open_orders, wal_seq, last_checkpoint_wal_seq) = {
            let core = self.core.lock();
            (
                core.events_processed(),
                core.open_order_count(),
                core.wal_seq(),
                core.last_checkpoint_wal_seq(),
            )
        };
        SessionStats {
            id: self.id.clone(),
            status: self.status(),
            mode: self.config.mode,
            created_at_ms: self.created_at_ms,
            started_at_ms: *self.started_at_ms.lock(),
            events_enqueued: self.queue.enqueued(),
            events_dropped: self.queue.dropped(),
            events_processed,
            events_skipped: self.events_skipped.load(Ordering::SeqCst),
            queue_size: self.queue.size(),
            last_event_ns: self.watermark_ns(),
            clock_ns: self.clock.now_ns(),
            speed_factor: self.clock.speed(),
            open_orders,
            wal_seq,
            last_checkpoint_wal_seq,
            error: self.error(),
            exposure: self.account.exposure(),
        }
    }

    // --- Processing ---

    /// Applies one market event. Events older than the clock (after a
    /// backwards `jump_to`) are skipped.
    fn process(&self, event: Event) -> Result<(), StoreError> {
        let ts = event.timestamp_ns;
        if !self.clock.advance_to(ts) {
            self.events_skipped.fetch_add(1, Ordering::SeqCst);
            debug!(session_id = %self.id, seq = event.seq, ts, "Stale event skipped");
            return Ok(());
        }
        let (result, emitted) = {
            let mut core = self.core.lock();
            let result = core.on_event(&event, ts);
            (result, core.take_emitted())
        };
        self.watermark_ns.store(ts, Ordering::SeqCst);
        metrics::inc_events_processed();
        self.callbacks
            .dispatch(&self.id, std::iter::once(&event).chain(emitted.iter()));
        result
    }

    /// False once the session has failed.
    fn process_guarded(&self, event: Event) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(event))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.fail(format!("durability failure: {}", e));
                false
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.fail(format!("panic in session loop: {}", message));
                false
            }
        }
    }

    /// Sleeps until the event is due. False if interrupted by stop or pause.
    fn wait_for_pacing(&self, ts: i64) -> bool {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            if self.clock.is_paused() && !self.clock.in_fast_forward(ts) {
                return false;
            }
            let delay = self.clock.pacing_delay(ts);
            if delay.is_zero() {
                return true;
            }
            thread::sleep(delay.min(PACING_SLICE));
        }
    }

    fn finish(&self) {
        let result = self.with_core(|core, now| {
            let seq = core.last_event_seq();
            core.expire_day_orders(seq, now)?;
            if core.checkpoints_enabled() {
                core.checkpoint(now)?;
            }
            Ok(())
        });
        if result.is_ok()
            && self
                .transition(&[SessionStatus::Running], SessionStatus::Completed)
                .is_ok()
        {
            info!(session_id = %self.id, clock_ns = self.clock.now_ns(), "🏁 Session completed");
        }
    }

    /// Processing loop; runs on the session's worker thread until stopped,
    /// failed, or the feed is exhausted.
    pub fn run_loop(self: Arc<Self>) {
        info!(session_id = %self.id, "🚀 Session loop started");
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let pending = self.held.lock().take();
            let Some(event) = pending.or_else(|| self.queue.pop_timeout(POLL_INTERVAL)) else {
                if self.clock.fast_forward_target().is_some() {
                    self.clock.complete_fast_forward();
                }
                if self.feed_done.load(Ordering::SeqCst) && self.queue.is_empty() && !self.clock.is_paused() {
                    self.finish();
                    break;
                }
                continue;
            };

            if self
                .clock
                .fast_forward_target()
                .is_some_and(|target| event.timestamp_ns > target)
            {
                self.clock.complete_fast_forward();
            }
            if self.clock.is_paused() && !self.clock.in_fast_forward(event.timestamp_ns) {
                *self.held.lock() = Some(event);
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            if !self.wait_for_pacing(event.timestamp_ns) {
                *self.held.lock() = Some(event);
                continue;
            }
            if !self.process_guarded(event) {
                break;
            }
        }
        debug!(session_id = %self.id, status = %self.status(), "Session loop exited");
    }

    /// Applies queued events up to `target` on the calling thread. Used when
    /// no loop is running yet.
    pub fn drain_until(&self, target: i64) -> bool {
        loop {
            let pending = self.held.lock().take();
            let Some(event) = pending.or_else(|| self.queue.try_pop()) else {
                break;
            };
            if event.timestamp_ns > target {
                *self.held.lock() = Some(event);
                break;
            }
            if !self.process_guarded(event) {
                return false;
            }
        }
        self.clock.complete_fast_forward();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let list = CallbackList::new();
        let hits = Arc::new(AtomicUsize::new(0));
        list.add(Arc::new(|_, _| panic!("boom")));
        let counter = hits.clone();
        list.add(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = Event::order(
            1,
            0,
            crate::event::EventKind::CorporateAction(crate::market_data::types::CorporateActionKind::Split {
                ratio: rust_decimal_macros::dec!(2),
            }),
        );
        list.dispatch("s", [&event]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_handle_joins_workers() {
        let flag = Arc::new(AtomicBool::new(false));
        let worker_flag = flag.clone();
        let handle = StopHandle {
            session_id: "s".into(),
            handles: vec![thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                worker_flag.store(true, Ordering::SeqCst);
            })],
        };
        handle.wait();
        assert!(flag.load(Ordering::SeqCst));
    }
}
