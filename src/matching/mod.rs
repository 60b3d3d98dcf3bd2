//! Simulated venue. Tracks NBBO and last print per symbol and decides, for
//! each live order, whether and how it executes. The simulator is the only
//! counterparty; there is no book of other participants.
//!
//! Decisions here never touch the account or the order table. The session
//! records each decision in the WAL and applies it afterwards, which keeps
//! replay free of RNG draws.
pub mod calendar;
pub mod fees;
pub mod frictions;
pub mod halts;

pub use calendar::{MarketCalendar, MarketSession};
pub use fees::FeeBreakdown;
pub use frictions::FrictionModel;
pub use halts::{HaltMonitor, HaltTransition, SymbolRestrictions};

use crate::config::{FeeSchedule, SessionConfig};
use crate::event::EventKind;
use crate::market_data::types::{Nbbo, Quote};
use crate::model::{Liquidity, Order, OrderType, RejectReason, Side, TimeInForce};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SymbolMarket {
    pub nbbo: Nbbo,
    pub last_trade: Option<Decimal>,
    pub last_trade_ns: Option<i64>,
    /// Displayed size left at the touch since the last quote. `None` means
    /// uncapped.
    pub bid_available: Option<Decimal>,
    pub ask_available: Option<Decimal>,
}

/// Market-side state carried by checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub markets: BTreeMap<String, SymbolMarket>,
    pub restrictions: BTreeMap<String, SymbolRestrictions>,
    pub current_day: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketUpdate {
    /// The event opened a new New York trading day.
    pub day_rolled: bool,
    pub halt: Option<HaltTransition>,
    /// Price to mark positions in this symbol at.
    pub mark: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillPlan {
    pub qty: Decimal,
    pub price: Decimal,
    pub fees: FeeBreakdown,
    pub liquidity: Liquidity,
    pub slippage_bps: Decimal,
    /// Set when the remainder must be canceled right after this fill (IOC).
    pub cancel_remainder: Option<RejectReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Wait,
    Fill(FillPlan),
    Cancel(RejectReason),
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// A dormant stop was touched by this evaluation.
    pub stop_triggered: bool,
    pub outcome: Outcome,
}

impl Evaluation {
    fn wait(stop_triggered: bool) -> Self {
        Self {
            stop_triggered,
            outcome: Outcome::Wait,
        }
    }
}

pub struct MatchingEngine {
    markets: BTreeMap<String, SymbolMarket>,
    halts: HaltMonitor,
    calendar: MarketCalendar,
    frictions: FrictionModel,
    fees: FeeSchedule,
    rng: StdRng,
    current_day: Option<NaiveDate>,
}

impl MatchingEngine {
    pub fn new(config: &SessionConfig, seed: u64) -> Self {
        let markets = config
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolMarket::default()))
            .collect();
        Self {
            markets,
            halts: HaltMonitor::new(&config.halts, &config.symbols, &config.prior_closes),
            calendar: MarketCalendar::new(&config.calendar),
            frictions: FrictionModel::new(&config.execution),
            fees: config.fees.clone(),
            rng: StdRng::seed_from_u64(seed),
            current_day: None,
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn knows(&self, symbol: &str) -> bool {
        self.markets.contains_key(symbol)
    }

    pub fn market(&self, symbol: &str) -> Option<&SymbolMarket> {
        self.markets.get(symbol)
    }

    pub fn session_at(&self, ts_ns: i64) -> MarketSession {
        self.calendar.session_at(ts_ns)
    }

    pub fn is_halted(&self, symbol: &str, now_ns: i64) -> bool {
        self.halts.is_halted(symbol, now_ns)
    }

    pub fn ssr_active(&self, symbol: &str) -> bool {
        self.halts.ssr_active(symbol)
    }

    pub fn restrictions(&self, symbol: &str) -> Option<&SymbolRestrictions> {
        self.halts.get(symbol)
    }

    /// Detects a New York day change without applying the event.
    pub fn is_new_day(&self, ts_ns: i64) -> bool {
        let day = MarketCalendar::trading_day(ts_ns);
        self.current_day.is_some_and(|current| day > current)
    }

    /// Updates market state from a market event.
    pub fn on_market(&mut self, symbol: &str, kind: &EventKind, ts_ns: i64) -> MarketUpdate {
        let mut update = MarketUpdate::default();
        let day = MarketCalendar::trading_day(ts_ns);
        match self.current_day {
            Some(current) if day > current => {
                self.halts.roll_day();
                self.current_day = Some(day);
                update.day_rolled = true;
            }
            None => self.current_day = Some(day),
            _ => {}
        }

        if !self.markets.contains_key(symbol) {
            return update;
        }
        let extended = self.calendar.session_at(ts_ns).is_extended();

        match kind {
            EventKind::Quote(q) => {
                self.apply_quote(q, extended);
                update.halt = self.halts.refresh(symbol, ts_ns);
                update.mark = self.markets.get(symbol).and_then(|m| m.nbbo.mid());
            }
            EventKind::Trade(t) => {
                self.record_print(symbol, t.price, ts_ns);
                update.halt = self.halts.on_print(symbol, t.price, ts_ns);
                update.mark = Some(t.price);
            }
            EventKind::Bar(b) => {
                self.record_print(symbol, b.close, ts_ns);
                update.halt = self.halts.on_print(symbol, b.close, ts_ns);
                update.mark = Some(b.close);
            }
            _ => {
                update.halt = self.halts.refresh(symbol, ts_ns);
            }
        }
        update
    }

    fn apply_quote(&mut self, q: &Quote, extended: bool) {
        let bid_available = self.frictions.available_liquidity(q.bid_size, extended);
        let ask_available = self.frictions.available_liquidity(q.ask_size, extended);
        if let Some(market) = self.markets.get_mut(&q.symbol) {
            market.nbbo = Nbbo {
                bid_price: q.bid_price,
                bid_size: q.bid_size,
                ask_price: q.ask_price,
                ask_size: q.ask_size,
                timestamp_ns: q.timestamp_ns,
            };
            market.bid_available = bid_available;
            market.ask_available = ask_available;
        }
    }

    fn record_print(&mut self, symbol: &str, price: Decimal, ts_ns: i64) {
        if let Some(market) = self.markets.get_mut(symbol) {
            market.last_trade = Some(price);
            market.last_trade_ns = Some(ts_ns);
        }
    }

    /// Best opposing price: the ask for buys, the bid for sells, falling back
    /// to the last print when that side is not quoted.
    pub fn reference_price(&self, symbol: &str, side: Side) -> Option<Decimal> {
        let market = self.markets.get(symbol)?;
        let quoted = match side {
            Side::Buy if market.nbbo.has_ask() => Some(market.nbbo.ask_price),
            Side::Sell if market.nbbo.has_bid() => Some(market.nbbo.bid_price),
            _ => None,
        };
        quoted.or(market.last_trade)
    }

    /// Price used for the pre-trade buying power check.
    pub fn estimate_price(&self, order: &Order) -> Option<Decimal> {
        order
            .effective_limit()
            .or(order.stop_price.filter(|_| order.order_type == OrderType::Stop))
            .or_else(|| self.reference_price(&order.symbol, order.side))
    }

    pub fn draw_latency_ns(&mut self) -> i64 {
        self.frictions.latency_ns(&mut self.rng)
    }

    /// Market-state admission checks for a new order. `position_qty` is the
    /// signed position currently held in the symbol.
    pub fn admit(&mut self, order: &Order, now_ns: i64, position_qty: Decimal) -> Result<(), RejectReason> {
        if !self.knows(&order.symbol) {
            return Err(RejectReason::UnknownSymbol(order.symbol.clone()));
        }
        self.halts.refresh(&order.symbol, now_ns);
        if self.halts.is_halted(&order.symbol, now_ns) {
            return Err(RejectReason::Halted);
        }
        self.calendar.check_admission(now_ns, order.extended_hours)?;

        let opens_short = order.side == Side::Sell && order.qty > position_qty.max(Decimal::ZERO);
        if opens_short && self.halts.ssr_active(&order.symbol) {
            let best_bid = self
                .markets
                .get(&order.symbol)
                .filter(|m| m.nbbo.has_bid())
                .map(|m| m.nbbo.bid_price);
            let permitted = match (order.order_type, order.limit_price, best_bid) {
                (OrderType::Limit, Some(limit), Some(bid)) => limit > bid,
                _ => false,
            };
            if !permitted {
                return Err(RejectReason::ShortSaleRestricted);
            }
        }

        if order.order_type == OrderType::Market
            && self.reference_price(&order.symbol, order.side).is_none()
        {
            return Err(RejectReason::NoMarketData);
        }
        Ok(())
    }

    /// Decides what happens to a live order at `now_ns`. `resting` is false on
    /// the evaluation made at submission.
    pub fn evaluate(&mut self, order: &Order, now_ns: i64, resting: bool) -> Evaluation {
        if now_ns < order.eligible_at_ns {
            return Evaluation::wait(false);
        }
        self.halts.refresh(&order.symbol, now_ns);
        if self.halts.is_halted(&order.symbol, now_ns)
            || !self.calendar.can_execute(now_ns, order.extended_hours)
        {
            return Evaluation::wait(false);
        }
        let Some(market) = self.markets.get(&order.symbol) else {
            return Evaluation::wait(false);
        };

        let mut stop_triggered = false;
        if !order.is_armed() {
            let Some(stop) = order.stop_price else {
                return Evaluation::wait(false);
            };
            let touched = match order.side {
                Side::Buy => {
                    market.last_trade.is_some_and(|p| p >= stop)
                        || (market.nbbo.has_ask() && market.nbbo.ask_price >= stop)
                }
                Side::Sell => {
                    market.last_trade.is_some_and(|p| p <= stop)
                        || (market.nbbo.has_bid() && market.nbbo.bid_price <= stop)
                }
            };
            if !touched {
                return Evaluation::wait(false);
            }
            debug!(order_id = %order.id, %stop, "Stop triggered");
            stop_triggered = true;
        }

        let unfillable = |reason_ioc: RejectReason| -> Outcome {
            match order.time_in_force {
                TimeInForce::Ioc => Outcome::Cancel(reason_ioc),
                TimeInForce::Fok => Outcome::Cancel(RejectReason::FillOrKillUnfilled),
                TimeInForce::Day => Outcome::Wait,
            }
        };

        let Some(base) = self.reference_price(&order.symbol, order.side) else {
            return Evaluation {
                stop_triggered,
                outcome: unfillable(RejectReason::NoMarketData),
            };
        };

        let limit = order.effective_limit();
        let marketable = match (limit, order.side) {
            (Some(l), Side::Buy) => base <= l,
            (Some(l), Side::Sell) => base >= l,
            (None, _) => true,
        };
        let remaining = order.remaining_qty();
        let available = match order.side {
            Side::Buy if market.nbbo.has_ask() => market.ask_available,
            Side::Sell if market.nbbo.has_bid() => market.bid_available,
            _ => None,
        };
        let fillable = available.map_or(remaining, |a| a.min(remaining));

        if !marketable || fillable <= Decimal::ZERO {
            return Evaluation {
                stop_triggered,
                outcome: unfillable(RejectReason::ImmediateOrCancelRemainder),
            };
        }
        if order.time_in_force == TimeInForce::Fok && fillable < remaining {
            return Evaluation {
                stop_triggered,
                outcome: Outcome::Cancel(RejectReason::FillOrKillUnfilled),
            };
        }
        if order.filled_qty.is_zero() && self.frictions.draw_reject(&mut self.rng) {
            return Evaluation {
                stop_triggered,
                outcome: Outcome::Reject(RejectReason::ExecutionRejected),
            };
        }

        let qty = if order.time_in_force == TimeInForce::Fok {
            fillable
        } else {
            self.frictions.draw_fill_qty(&mut self.rng, fillable)
        };
        let extended = self.calendar.session_at(now_ns).is_extended();
        let adjusted = self.frictions.adjust_price(order.side, base, qty, extended);
        let price = match (limit, order.side) {
            (Some(l), Side::Buy) => adjusted.price.min(l),
            (Some(l), Side::Sell) => adjusted.price.max(l),
            (None, _) => adjusted.price,
        };
        let liquidity = if resting && limit.is_some() {
            Liquidity::Maker
        } else {
            Liquidity::Taker
        };
        let fees = self
            .fees
            .compute(order.side, qty, price, liquidity, order.filled_qty.is_zero());

        if let Some(market) = self.markets.get_mut(&order.symbol) {
            let slot = match order.side {
                Side::Buy => &mut market.ask_available,
                Side::Sell => &mut market.bid_available,
            };
            if let Some(left) = slot.as_mut() {
                *left = (*left - qty).max(Decimal::ZERO);
            }
        }

        let cancel_remainder = (order.time_in_force == TimeInForce::Ioc && qty < remaining)
            .then_some(RejectReason::ImmediateOrCancelRemainder);

        Evaluation {
            stop_triggered,
            outcome: Outcome::Fill(FillPlan {
                qty,
                price,
                fees,
                liquidity,
                slippage_bps: adjusted.total_bps(),
                cancel_remainder,
            }),
        }
    }

    /// Rescales market state after a split.
    pub fn apply_split(&mut self, symbol: &str, ratio: Decimal) {
        if ratio <= Decimal::ZERO {
            return;
        }
        self.halts.apply_split(symbol, ratio);
        if let Some(market) = self.markets.get_mut(symbol) {
            market.nbbo.bid_price /= ratio;
            market.nbbo.ask_price /= ratio;
            market.nbbo.bid_size *= ratio;
            market.nbbo.ask_size *= ratio;
            market.last_trade = market.last_trade.map(|p| p / ratio);
            market.bid_available = market.bid_available.map(|s| s * ratio);
            market.ask_available = market.ask_available.map(|s| s * ratio);
        }
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            markets: self.markets.clone(),
            restrictions: self.halts.snapshot(),
            current_day: self.current_day,
        }
    }

    pub fn restore(&mut self, snapshot: MarketSnapshot) {
        for (symbol, market) in snapshot.markets {
            if self.markets.contains_key(&symbol) {
                self.markets.insert(symbol, market);
            }
        }
        self.halts.restore(snapshot.restrictions);
        self.current_day = snapshot.current_day;
    }
}
