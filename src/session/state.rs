//! The mutable heart of a session: matching state, the order table, and the
//! WAL writer, guarded together by the session's core lock.
//!
//! Every state change follows the same path. The live side decides (market
//! checks, friction draws), appends a [`WalEntry`] carrying the realized
//! outcome, and only then calls [`SessionCore::apply_entry`]. Recovery calls
//! `apply_entry` on the logged records and nothing else, so a replay lands on
//! the same state without consuming randomness.

use crate::account::AccountManager;
use crate::config::{EngineConfig, SessionConfig};
use crate::event::{Event, EventKind};
use crate::market_data::types::CorporateActionKind;
use crate::matching::{HaltTransition, MatchingEngine, Outcome};
use crate::metrics;
use crate::model::{Fill, Order, OrderRequest, OrderStatus, RejectReason, TimeInForce};
use crate::order_fsm::OrderStateMachine;
use crate::performance::PerformanceTracker;
use crate::persistence::checkpoint::Checkpoint;
use crate::persistence::store::{SessionStore, StoreError};
use crate::persistence::wal::{WalEntry, WalRecord, WalWriter};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SessionCore {
    session_id: String,
    matching: MatchingEngine,
    /// Working orders keyed by the WAL seq that accepted them, which is also
    /// their evaluation priority.
    open: BTreeMap<u64, Order>,
    index: HashMap<String, u64>,
    closed: HashMap<String, Order>,
    /// Retention order of `closed`, oldest first.
    closed_order: VecDeque<String>,
    max_closed: usize,
    wal: WalWriter,
    account: Arc<AccountManager>,
    apply_corporate_actions: bool,
    last_event_seq: u64,
    events_processed: u64,
    events_since_checkpoint: u64,
    checkpoint_interval: u64,
    truncate_on_checkpoint: bool,
    last_checkpoint_wal_seq: Option<u64>,
    performance: PerformanceTracker,
    emitted: Vec<Event>,
}

impl SessionCore {
    pub fn new(
        session_id: &str,
        config: &SessionConfig,
        engine: &EngineConfig,
        seed: u64,
        store: Arc<dyn SessionStore>,
        account: Arc<AccountManager>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            matching: MatchingEngine::new(config, seed),
            open: BTreeMap::new(),
            index: HashMap::new(),
            closed: HashMap::new(),
            closed_order: VecDeque::new(),
            max_closed: engine.max_closed_orders,
            wal: WalWriter::new(store, 0),
            account,
            apply_corporate_actions: config.apply_corporate_actions,
            last_event_seq: 0,
            events_processed: 0,
            events_since_checkpoint: 0,
            checkpoint_interval: engine.checkpoint_interval_events,
            truncate_on_checkpoint: engine.truncate_wal_on_checkpoint,
            last_checkpoint_wal_seq: None,
            performance: PerformanceTracker::new(config.initial_capital),
            emitted: Vec::new(),
        }
    }

    // --- Accessors ---

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.wal.store()
    }

    pub fn matching(&self) -> &MatchingEngine {
        &self.matching
    }

    pub fn wal_seq(&self) -> u64 {
        self.wal.last_seq()
    }

    pub fn last_event_seq(&self) -> u64 {
        self.last_event_seq
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn checkpoints_enabled(&self) -> bool {
        self.checkpoint_interval > 0
    }

    pub fn last_checkpoint_wal_seq(&self) -> Option<u64> {
        self.last_checkpoint_wal_seq
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.performance
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.index
            .get(order_id)
            .and_then(|key| self.open.get(key))
            .or_else(|| self.closed.get(order_id))
            .cloned()
    }

    /// Working orders in acceptance order.
    pub fn open_orders(&self) -> Vec<Order> {
        self.open.values().cloned().collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_order_count(&self) -> usize {
        self.closed.len()
    }

    pub fn take_emitted(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.emitted)
    }

    // --- Apply path (shared by live processing and replay) ---

    fn open_key(&self, order_id: &str) -> Result<u64, StoreError> {
        self.index
            .get(order_id)
            .copied()
            .ok_or_else(|| StoreError::Integrity(format!("order {} is not open", order_id)))
    }

    fn close(&mut self, key: u64) -> Option<Order> {
        let order = self.open.remove(&key)?;
        self.index.remove(&order.id);
        self.retain_closed(order.clone());
        Some(order)
    }

    fn retain_closed(&mut self, order: Order) {
        self.closed_order.push_back(order.id.clone());
        self.closed.insert(order.id.clone(), order);
        while self.max_closed > 0 && self.closed_order.len() > self.max_closed {
            if let Some(evicted) = self.closed_order.pop_front() {
                self.closed.remove(&evicted);
            }
        }
    }

    /// Applies one logged state change. Returns the order event it produced,
    /// if any.
    pub fn apply_entry(&mut self, record: &WalRecord) -> Result<Option<EventKind>, StoreError> {
        let ts = record.ts_ns;
        match &record.entry {
            WalEntry::OrderAccepted { order } => {
                if self.index.contains_key(&order.id) || self.closed.contains_key(&order.id) {
                    return Err(StoreError::Integrity(format!("duplicate order id {}", order.id)));
                }
                self.index.insert(order.id.clone(), record.seq);
                self.open.insert(record.seq, order.clone());
                Ok(Some(EventKind::OrderNew(order.clone())))
            }
            WalEntry::OrderRejected { order } => {
                if self.index.contains_key(&order.id) || self.closed.contains_key(&order.id) {
                    return Err(StoreError::Integrity(format!("duplicate order id {}", order.id)));
                }
                self.retain_closed(order.clone());
                Ok(Some(EventKind::OrderReject(order.clone())))
            }
            WalEntry::StopTriggered { order_id } => {
                let key = self.open_key(order_id)?;
                if let Some(order) = self.open.get_mut(&key) {
                    order.stop_triggered = true;
                    order.updated_at_ns = ts;
                }
                Ok(None)
            }
            WalEntry::FillApplied { fill } => {
                let key = self.open_key(&fill.order_id)?;
                let order = self
                    .open
                    .get_mut(&key)
                    .ok_or_else(|| StoreError::Integrity(format!("order {} missing", fill.order_id)))?;
                let filled = order.filled_qty + fill.qty;
                if fill.qty <= Decimal::ZERO || filled > order.qty {
                    return Err(StoreError::Integrity(format!(
                        "fill of {} overfills order {}",
                        fill.qty, order.id
                    )));
                }
                let next = if filled == order.qty {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                order.status = OrderStateMachine::transition(order.status, next)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
                let prior_notional = order.avg_fill_price.unwrap_or(Decimal::ZERO) * order.filled_qty;
                order.avg_fill_price = Some((prior_notional + fill.price * fill.qty) / filled);
                order.filled_qty = filled;
                order.updated_at_ns = ts;
                let snapshot = order.clone();
                if snapshot.is_terminal() {
                    self.close(key);
                }
                self.account.apply_fill(fill);
                Ok(Some(EventKind::OrderFill {
                    order: snapshot,
                    fill: fill.clone(),
                }))
            }
            WalEntry::OrderClosed {
                order_id,
                status,
                reason,
            } => {
                let key = self.open_key(order_id)?;
                if let Some(order) = self.open.get_mut(&key) {
                    order.status = OrderStateMachine::transition(order.status, *status)
                        .map_err(|e| StoreError::Integrity(e.to_string()))?;
                    order.reject_reason = reason.clone();
                    order.updated_at_ns = ts;
                }
                let order = self
                    .close(key)
                    .ok_or_else(|| StoreError::Integrity(format!("order {} missing", order_id)))?;
                let kind = match status {
                    OrderStatus::Canceled => EventKind::OrderCancel(order),
                    OrderStatus::Expired => EventKind::OrderExpire(order),
                    OrderStatus::Rejected => EventKind::OrderReject(order),
                    other => {
                        return Err(StoreError::Integrity(format!(
                            "order {} closed with non-terminal status {}",
                            order_id, other
                        )));
                    }
                };
                Ok(Some(kind))
            }
            WalEntry::MarkPrice { symbol, price } => {
                self.account.mark_to_market(symbol, *price);
                Ok(None)
            }
            WalEntry::DividendApplied {
                symbol,
                amount_per_share,
            } => {
                self.account.apply_dividend(symbol, *amount_per_share);
                Ok(None)
            }
            WalEntry::SplitApplied { symbol, ratio } => {
                if *ratio <= Decimal::ZERO {
                    return Err(StoreError::Integrity(format!("split ratio {} for {}", ratio, symbol)));
                }
                self.account.apply_split(symbol, *ratio);
                self.matching.apply_split(symbol, *ratio);
                for order in self.open.values_mut().filter(|o| &o.symbol == symbol) {
                    order.qty *= *ratio;
                    order.filled_qty *= *ratio;
                    order.limit_price = order.limit_price.map(|p| p / *ratio);
                    order.stop_price = order.stop_price.map(|p| p / *ratio);
                    order.avg_fill_price = order.avg_fill_price.map(|p| p / *ratio);
                    order.updated_at_ns = ts;
                }
                Ok(None)
            }
        }
    }

    /// WAL first, then apply. A failed append leaves state untouched.
    fn commit(&mut self, trigger_seq: u64, ts_ns: i64, entry: WalEntry) -> Result<(), StoreError> {
        let record = self.wal.append(trigger_seq, ts_ns, entry)?;
        if let Some(kind) = self.apply_entry(&record)? {
            self.emitted.push(Event::order(trigger_seq, ts_ns, kind));
        }
        Ok(())
    }

    // --- Commands ---

    fn reject(
        &mut self,
        mut order: Order,
        reason: RejectReason,
        trigger_seq: u64,
        now_ns: i64,
    ) -> Result<Order, StoreError> {
        warn!(session_id = %self.session_id, order_id = %order.id, symbol = %order.symbol, %reason, "⛔ Order rejected");
        metrics::inc_order_rejections();
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason);
        self.commit(trigger_seq, now_ns, WalEntry::OrderRejected { order: order.clone() })?;
        Ok(order)
    }

    /// Opening exposure must be covered by buying power; the part of an order
    /// that reduces an existing position is free.
    fn check_buying_power(&self, order: &Order, position_qty: Decimal) -> Result<(), RejectReason> {
        let reducible = if order.side.is_buy() {
            (-position_qty).max(Decimal::ZERO)
        } else {
            position_qty.max(Decimal::ZERO)
        };
        let opening = (order.qty - reducible).max(Decimal::ZERO);
        if opening.is_zero() {
            return Ok(());
        }
        let Some(price) = self.matching.estimate_price(order) else {
            return Ok(());
        };
        if self.account.has_buying_power(opening * price, order.side.is_buy()) {
            Ok(())
        } else {
            Err(RejectReason::InsufficientBuyingPower)
        }
    }

    /// The id of the next submitted order: the WAL seq of the record that
    /// will accept or reject it. Monotonic across restores and truncation.
    fn next_order_id(&self) -> String {
        format!("{}-{:06}", self.session_id, self.wal.last_seq() + 1)
    }

    /// Admits and immediately evaluates a new order. Validation and admission
    /// failures still produce a REJECTED order with an id.
    pub fn submit(&mut self, request: OrderRequest, now_ns: i64) -> Result<Order, StoreError> {
        let id = self.next_order_id();
        let trigger = self.last_event_seq;
        let qty = match request.validate() {
            Ok(qty) => qty,
            Err(reason) => {
                let order = Order::from_request(id, &request, request.qty.unwrap_or_default(), now_ns);
                return self.reject(order, reason, trigger, now_ns);
            }
        };
        let mut order = Order::from_request(id, &request, qty, now_ns);
        order.symbol = order.symbol.trim().to_uppercase();

        let position_qty = self.account.position_qty(&order.symbol);
        let admitted = self
            .matching
            .admit(&order, now_ns, position_qty)
            .and_then(|_| self.check_buying_power(&order, position_qty));
        if let Err(reason) = admitted {
            return self.reject(order, reason, trigger, now_ns);
        }

        order.eligible_at_ns = now_ns + self.matching.draw_latency_ns();
        let order_id = order.id.clone();
        info!(
            session_id = %self.session_id,
            order_id = %order_id,
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.qty,
            "📥 Order accepted"
        );
        self.commit(trigger, now_ns, WalEntry::OrderAccepted { order })?;
        let key = self.open_key(&order_id)?;
        self.evaluate(key, now_ns, false, trigger)?;
        self.order(&order_id)
            .ok_or_else(|| StoreError::Integrity(format!("order {} vanished", order_id)))
    }

    /// Returns the canceled order, or `None` if it is unknown or already
    /// terminal.
    pub fn cancel(&mut self, order_id: &str, now_ns: i64) -> Result<Option<Order>, StoreError> {
        if !self.index.contains_key(order_id) {
            return Ok(None);
        }
        self.commit(
            self.last_event_seq,
            now_ns,
            WalEntry::OrderClosed {
                order_id: order_id.to_string(),
                status: OrderStatus::Canceled,
                reason: None,
            },
        )?;
        info!(session_id = %self.session_id, order_id, "🚫 Order canceled");
        Ok(self.order(order_id))
    }

    /// Credits a dividend on a held position. False if nothing is held.
    pub fn apply_dividend(&mut self, symbol: &str, amount_per_share: Decimal, now_ns: i64) -> Result<bool, StoreError> {
        if self.account.position(symbol).is_none() {
            return Ok(false);
        }
        self.commit(
            self.last_event_seq,
            now_ns,
            WalEntry::DividendApplied {
                symbol: symbol.to_string(),
                amount_per_share,
            },
        )?;
        Ok(true)
    }

    /// Rescales the position, working orders and market reference prices.
    /// Always logged, since the market side changes even with nothing held.
    /// Returns whether a position was held.
    pub fn apply_split(&mut self, symbol: &str, ratio: Decimal, now_ns: i64) -> Result<bool, StoreError> {
        if ratio <= Decimal::ZERO {
            return Ok(false);
        }
        let held = self.account.position(symbol).is_some();
        self.commit(
            self.last_event_seq,
            now_ns,
            WalEntry::SplitApplied {
                symbol: symbol.to_string(),
                ratio,
            },
        )?;
        Ok(held)
    }

    // --- Event processing ---

    fn evaluate(&mut self, key: u64, now_ns: i64, resting: bool, trigger: u64) -> Result<(), StoreError> {
        let Some(order) = self.open.get(&key).cloned() else {
            return Ok(());
        };
        let evaluation = self.matching.evaluate(&order, now_ns, resting);
        if evaluation.stop_triggered {
            self.commit(
                trigger,
                now_ns,
                WalEntry::StopTriggered {
                    order_id: order.id.clone(),
                },
            )?;
        }
        match evaluation.outcome {
            Outcome::Wait => {}
            Outcome::Fill(plan) => {
                let fill = Fill {
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: plan.qty,
                    price: plan.price,
                    fees: plan.fees.total(),
                    liquidity: plan.liquidity,
                    timestamp_ns: now_ns,
                };
                metrics::inc_fills();
                metrics::observe_slippage(plan.slippage_bps.to_f64().unwrap_or(0.0));
                debug!(order_id = %order.id, qty = %fill.qty, price = %fill.price, "Fill");
                self.commit(trigger, now_ns, WalEntry::FillApplied { fill })?;
                if let Some(reason) = plan.cancel_remainder {
                    if self.index.contains_key(&order.id) {
                        self.commit(
                            trigger,
                            now_ns,
                            WalEntry::OrderClosed {
                                order_id: order.id.clone(),
                                status: OrderStatus::Canceled,
                                reason: Some(reason),
                            },
                        )?;
                    }
                }
            }
            Outcome::Cancel(reason) => {
                debug!(order_id = %order.id, %reason, "Order canceled by time in force");
                self.commit(
                    trigger,
                    now_ns,
                    WalEntry::OrderClosed {
                        order_id: order.id.clone(),
                        status: OrderStatus::Canceled,
                        reason: Some(reason),
                    },
                )?;
            }
            Outcome::Reject(reason) => {
                warn!(session_id = %self.session_id, order_id = %order.id, %reason, "⛔ Order rejected by venue");
                metrics::inc_order_rejections();
                self.commit(
                    trigger,
                    now_ns,
                    WalEntry::OrderClosed {
                        order_id: order.id.clone(),
                        status: OrderStatus::Rejected,
                        reason: Some(reason),
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Expires every working DAY order.
    pub fn expire_day_orders(&mut self, trigger: u64, now_ns: i64) -> Result<usize, StoreError> {
        let ids: Vec<String> = self
            .open
            .values()
            .filter(|o| o.time_in_force == TimeInForce::Day)
            .map(|o| o.id.clone())
            .collect();
        for order_id in &ids {
            self.commit(
                trigger,
                now_ns,
                WalEntry::OrderClosed {
                    order_id: order_id.clone(),
                    status: OrderStatus::Expired,
                    reason: None,
                },
            )?;
        }
        if !ids.is_empty() {
            info!(session_id = %self.session_id, count = ids.len(), "⌛ DAY orders expired");
        }
        Ok(ids.len())
    }

    /// Applies one market event at virtual time `now_ns`: day roll, market
    /// state, marks, corporate actions, then every working order in the
    /// symbol in acceptance order.
    pub fn on_event(&mut self, event: &Event, now_ns: i64) -> Result<(), StoreError> {
        self.last_event_seq = event.seq;
        self.events_processed += 1;

        if self.matching.is_new_day(event.timestamp_ns) {
            self.expire_day_orders(event.seq, now_ns)?;
        }

        let update = self.matching.on_market(&event.symbol, &event.kind, event.timestamp_ns);
        match update.halt {
            Some(HaltTransition::Halted { until_ns }) => {
                warn!(session_id = %self.session_id, symbol = %event.symbol, until_ns, "🛑 LULD halt");
            }
            Some(HaltTransition::Resumed) => {
                info!(session_id = %self.session_id, symbol = %event.symbol, "▶️ Trading resumed");
            }
            None => {}
        }
        if let Some(price) = update.mark {
            let changed = self
                .account
                .position(&event.symbol)
                .is_some_and(|p| p.last_price != price);
            if changed {
                self.commit(
                    event.seq,
                    now_ns,
                    WalEntry::MarkPrice {
                        symbol: event.symbol.clone(),
                        price,
                    },
                )?;
            }
        }

        if let EventKind::CorporateAction(action) = &event.kind {
            if self.apply_corporate_actions {
                match action {
                    CorporateActionKind::Dividend { amount_per_share } => {
                        self.apply_dividend(&event.symbol, *amount_per_share, now_ns)?;
                    }
                    CorporateActionKind::Split { ratio } => {
                        self.apply_split(&event.symbol, *ratio, now_ns)?;
                    }
                }
            }
        }

        let keys: Vec<u64> = self
            .open
            .iter()
            .filter(|(_, o)| o.symbol == event.symbol)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.evaluate(key, now_ns, true, event.seq)?;
        }

        self.performance.record(event.timestamp_ns, self.account.state().equity);
        self.events_since_checkpoint += 1;
        if self.checkpoint_interval > 0 && self.events_since_checkpoint >= self.checkpoint_interval {
            self.checkpoint(now_ns)?;
        }
        Ok(())
    }

    // --- Checkpoint and restore ---

    pub fn checkpoint(&mut self, clock_ns: i64) -> Result<u64, StoreError> {
        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            last_wal_seq: self.wal.last_seq(),
            last_event_seq: self.last_event_seq,
            clock_ns,
            events_processed: self.events_processed,
            account: self.account.snapshot(),
            open_orders: self.open.iter().map(|(k, o)| (*k, o.clone())).collect(),
            closed_orders: self
                .closed_order
                .iter()
                .filter_map(|id| self.closed.get(id))
                .cloned()
                .collect(),
            market: self.matching.snapshot(),
        };
        let seq = checkpoint.last_wal_seq;
        let store = self.wal.store().clone();
        store.save_checkpoint(&checkpoint)?;
        if self.truncate_on_checkpoint {
            store.truncate_through(seq)?;
        }
        self.events_since_checkpoint = 0;
        self.last_checkpoint_wal_seq = Some(seq);
        metrics::inc_checkpoints();
        info!(session_id = %self.session_id, wal_seq = seq, "💾 Checkpoint saved");
        Ok(seq)
    }

    pub fn restore_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.account.restore(checkpoint.account);
        self.open = checkpoint.open_orders.into_iter().collect();
        self.index = self.open.iter().map(|(k, o)| (o.id.clone(), *k)).collect();
        self.closed.clear();
        self.closed_order.clear();
        for order in checkpoint.closed_orders {
            self.retain_closed(order);
        }
        self.matching.restore(checkpoint.market);
        self.last_event_seq = checkpoint.last_event_seq;
        self.events_processed = checkpoint.events_processed;
        self.last_checkpoint_wal_seq = Some(checkpoint.last_wal_seq);
        self.wal = WalWriter::new(self.wal.store().clone(), checkpoint.last_wal_seq);
    }

    /// Positions the writer and counters after a replay.
    pub fn finish_replay(&mut self, last_wal_seq: u64, last_event_seq: u64, reseed: u64) {
        self.wal = WalWriter::new(self.wal.store().clone(), last_wal_seq);
        self.last_event_seq = self.last_event_seq.max(last_event_seq);
        self.matching.reseed(reseed);
        self.emitted.clear();
    }
}
