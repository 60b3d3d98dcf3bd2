//! Per-session ordered event channel.
//!
//! Producers serialize through `enqueue_lock`, which is also where sequence
//! numbers are assigned, so insertion order == sequence order. The single
//! consumer (the session loop) pops without taking the lock.
use crate::event::Event;
use crate::market_data::types::MarketData;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const BLOCKED_PUSH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for space. Nothing is lost (backtest replay).
    #[default]
    Block,
    /// Evict the oldest queued event to admit the new one (live feeds).
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued { seq: u64 },
    /// Enqueued after evicting the oldest queued event.
    EnqueuedEvictedOldest { seq: u64 },
    DroppedNewest,
    Closed,
}

pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    capacity: usize,
    policy: OverflowPolicy,
    enqueue_lock: Mutex<()>,
    last_seq: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    /// `capacity == 0` means unbounded; the overflow policy is then moot.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = if capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(capacity)
        };
        Self {
            tx,
            rx,
            capacity,
            policy,
            enqueue_lock: Mutex::new(()),
            last_seq: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Continues numbering after a restore.
    pub fn with_starting_seq(self, last_seq: u64) -> Self {
        self.last_seq.store(last_seq, Ordering::SeqCst);
        self
    }

    pub fn push(&self, data: MarketData) -> PushOutcome {
        let _guard = self.enqueue_lock.lock();
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        let mut event = Event::from_market(seq, data);

        if self.capacity == 0 {
            if self.tx.send(event).is_err() {
                return PushOutcome::Closed;
            }
            return self.accept(seq, false);
        }

        match self.policy {
            OverflowPolicy::Block => loop {
                match self.tx.send_timeout(event, BLOCKED_PUSH_POLL) {
                    Ok(()) => return self.accept(seq, false),
                    Err(SendTimeoutError::Timeout(returned)) => {
                        if self.is_closed() {
                            return PushOutcome::Closed;
                        }
                        event = returned;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Closed,
                }
            },
            OverflowPolicy::DropOldest => {
                // Producers are serialized, so the queue can only shrink while
                // we hold the lock: one eviction always makes room.
                let mut evicted = false;
                loop {
                    match self.tx.try_send(event) {
                        Ok(()) => return self.accept(seq, evicted),
                        Err(TrySendError::Full(returned)) => {
                            event = returned;
                            if !evicted && self.rx.is_full() {
                                evicted = self.evict_oldest();
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
                    }
                }
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) => self.accept(seq, false),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    crate::metrics::inc_events_dropped();
                    PushOutcome::DroppedNewest
                }
                Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
            },
        }
    }

    fn evict_oldest(&self) -> bool {
        match self.rx.try_recv() {
            Ok(old) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                crate::metrics::inc_events_dropped();
                debug!(seq = old.seq, "Evicted oldest queued event");
                true
            }
            Err(_) => false,
        }
    }

    fn accept(&self, seq: u64, evicted: bool) -> PushOutcome {
        self.last_seq.store(seq, Ordering::SeqCst);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        if evicted {
            PushOutcome::EnqueuedEvictedOldest { seq }
        } else {
            PushOutcome::Enqueued { seq }
        }
    }

    pub fn try_pop(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Event queue disconnected");
                None
            }
        }
    }

    /// Stops accepting events and releases producers blocked on a full queue.
    /// Already-queued events stay poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::Trade;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::thread;

    fn trade(ts: i64) -> MarketData {
        MarketData::Trade(Trade {
            symbol: "AAPL".into(),
            price: Decimal::from(100 + ts),
            size: Decimal::ONE,
            timestamp_ns: ts,
        })
    }

    #[test]
    fn test_drop_oldest_keeps_most_recent_in_order() {
        let capacity = 4;
        let k = 3;
        let queue = EventQueue::new(capacity, OverflowPolicy::DropOldest);
        for ts in 1..=(capacity + k) as i64 {
            queue.push(trade(ts));
        }

        assert_eq!(queue.size(), capacity);
        assert_eq!(queue.dropped(), k as u64);

        let retained: Vec<i64> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.timestamp_ns)
            .collect();
        assert_eq!(retained, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_drop_newest_discards_incoming() {
        let queue = EventQueue::new(2, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(trade(1)), PushOutcome::Enqueued { seq: 1 });
        assert_eq!(queue.push(trade(2)), PushOutcome::Enqueued { seq: 2 });
        assert_eq!(queue.push(trade(3)), PushOutcome::DroppedNewest);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().map(|e| e.timestamp_ns), Some(1));
        assert_eq!(queue.try_pop().map(|e| e.timestamp_ns), Some(2));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_sequence_numbers_follow_insertion() {
        let queue = EventQueue::new(0, OverflowPolicy::Block);
        for ts in 0..5 {
            queue.push(trade(ts));
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.enqueued(), 5);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_block_waits_for_consumer() {
        let queue = Arc::new(EventQueue::new(1, OverflowPolicy::Block));
        queue.push(trade(1));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(trade(2)))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.try_pop().map(|e| e.timestamp_ns), Some(1));

        let outcome = producer.join().unwrap();
        assert_eq!(outcome, PushOutcome::Enqueued { seq: 2 });
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(EventQueue::new(1, OverflowPolicy::Block));
        queue.push(trade(1));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(trade(2)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
        assert_eq!(queue.push(trade(3)), PushOutcome::Closed);
    }

    #[test]
    fn test_starting_seq_continues_numbering() {
        let queue = EventQueue::new(0, OverflowPolicy::Block).with_starting_seq(41);
        assert_eq!(queue.push(trade(1)), PushOutcome::Enqueued { seq: 42 });
    }

    #[test]
    fn test_drop_oldest_evicts_only_when_full() {
        let queue = EventQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(trade(1));
        queue.push(trade(2));
        assert_eq!(queue.push(trade(3)), PushOutcome::EnqueuedEvictedOldest { seq: 3 });
        assert_eq!(queue.dropped(), 1);

        // Space freed by the consumer is used before anything is evicted.
        assert_eq!(queue.try_pop().map(|e| e.timestamp_ns), Some(2));
        assert_eq!(queue.push(trade(4)), PushOutcome::Enqueued { seq: 4 });
        assert_eq!(queue.dropped(), 1);
        let retained: Vec<i64> = std::iter::from_fn(|| queue.try_pop()).map(|e| e.timestamp_ns).collect();
        assert_eq!(retained, vec![3, 4]);
    }

    #[test]
    fn test_drop_oldest_with_concurrent_consumer_accounts_for_every_event() {
        let queue = Arc::new(EventQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut popped = 0u64;
                while popped + queue.dropped() < 2_000 {
                    if queue.try_pop().is_some() {
                        popped += 1;
                    }
                }
                popped
            })
        };
        let mut evictions = 0u64;
        for ts in 0..2_000 {
            if let PushOutcome::EnqueuedEvictedOldest { .. } = queue.push(trade(ts)) {
                evictions += 1;
            }
        }
        let popped = consumer.join().unwrap();
        assert_eq!(evictions, queue.dropped());
        assert_eq!(popped + queue.dropped(), 2_000);
    }
}
