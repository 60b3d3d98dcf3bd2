//! Cash, positions, and margin for one session.
//!
//! All mutation goes through `&self` methods that take the internal lock, so
//! the processing loop and status readers can share an `Arc<AccountManager>`.
//! Margin and buying power are recomputed after every mutation and never
//! written independently.
use crate::config::MarginConfig;
use crate::model::{AccountState, Fill, Position};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

const MAX_TRADE_HISTORY: usize = 5000;

/// A position reduction booked against the average entry price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedTrade {
    pub symbol: String,
    /// Signed quantity that was closed (positive = long closed).
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub realized_pl: Decimal,
    pub closed_at_ns: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExposureMetrics {
    /// Long minus short market value.
    pub net_exposure: Decimal,
    pub gross_notional: Decimal,
    pub long_notional: Decimal,
    pub short_notional: Decimal,
    pub position_count: usize,
}

/// Everything needed to rebuild the ledger; stored in checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub initial_capital: Decimal,
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub accrued_fees: Decimal,
    pub realized_pl: Decimal,
    #[serde(default)]
    pub trade_history: Vec<ClosedTrade>,
}

struct Ledger {
    initial_capital: Decimal,
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    accrued_fees: Decimal,
    realized_pl: Decimal,
    trade_history: Vec<ClosedTrade>,
    state: AccountState,
}

pub struct AccountManager {
    margin: MarginConfig,
    inner: Mutex<Ledger>,
}

impl AccountManager {
    pub fn new(initial_capital: Decimal, margin: MarginConfig) -> Self {
        let mut ledger = Ledger {
            initial_capital,
            cash: initial_capital,
            positions: BTreeMap::new(),
            accrued_fees: Decimal::ZERO,
            realized_pl: Decimal::ZERO,
            trade_history: Vec::new(),
            state: AccountState::default(),
        };
        recompute(&margin, &mut ledger);
        Self {
            margin,
            inner: Mutex::new(ledger),
        }
    }

    /// Books a fill: cash moves by `-signed_qty * price - fees`, the position
    /// averages in on the same side, books realized P&L on reductions, and
    /// resets its entry price on a flip or when flat.
    pub fn apply_fill(&self, fill: &Fill) -> Option<ClosedTrade> {
        let mut ledger = self.inner.lock();
        let signed = fill.side.sign() * fill.qty;
        ledger.cash -= signed * fill.price + fill.fees;
        ledger.accrued_fees += fill.fees;

        let position = ledger
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::flat(&fill.symbol));
        let old_qty = position.qty;
        let new_qty = old_qty + signed;
        let mut closed = None;

        if old_qty.is_zero() || old_qty.is_sign_positive() == signed.is_sign_positive() {
            position.avg_entry_price =
                (position.avg_entry_price * old_qty.abs() + fill.price * fill.qty) / new_qty.abs();
        } else {
            let closed_qty = fill.qty.min(old_qty.abs());
            let direction = if old_qty.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            let realized = closed_qty * (fill.price - position.avg_entry_price) * direction;
            position.realized_pl += realized;
            closed = Some(ClosedTrade {
                symbol: fill.symbol.clone(),
                qty: closed_qty * direction,
                entry_price: position.avg_entry_price,
                exit_price: fill.price,
                realized_pl: realized,
                closed_at_ns: fill.timestamp_ns,
            });
            if new_qty.is_zero() {
                position.avg_entry_price = Decimal::ZERO;
            } else if new_qty.is_sign_positive() != old_qty.is_sign_positive() {
                position.avg_entry_price = fill.price;
            }
        }
        position.qty = new_qty;
        position.last_price = fill.price;

        if let Some(trade) = &closed {
            ledger.realized_pl += trade.realized_pl;
            ledger.trade_history.push(trade.clone());
            if ledger.trade_history.len() > MAX_TRADE_HISTORY {
                let excess = ledger.trade_history.len() - MAX_TRADE_HISTORY;
                ledger.trade_history.drain(..excess);
            }
        }
        if new_qty.is_zero() {
            ledger.positions.remove(&fill.symbol);
        }
        recompute(&self.margin, &mut ledger);
        debug!(symbol = %fill.symbol, qty = %new_qty, cash = %ledger.cash, "Fill booked");
        closed
    }

    /// Re-marks a held position. Returns false (no change) if not held.
    pub fn mark_to_market(&self, symbol: &str, last_price: Decimal) -> bool {
        let mut ledger = self.inner.lock();
        match ledger.positions.get_mut(symbol) {
            Some(position) => position.last_price = last_price,
            None => return false,
        }
        recompute(&self.margin, &mut ledger);
        true
    }

    /// Pre-trade check for opening `notional` of exposure on one side.
    pub fn has_buying_power(&self, notional: Decimal, is_long: bool) -> bool {
        let ledger = self.inner.lock();
        let state = &ledger.state;
        if notional > state.buying_power {
            return false;
        }
        let (long, short) = if is_long {
            (state.long_market_value + notional, state.short_market_value)
        } else {
            (state.long_market_value, state.short_market_value + notional)
        };
        self.margin.initial_margin_rate * long.max(short) <= state.equity
    }

    /// Credits (or, for shorts, debits) `amount_per_share * qty`.
    pub fn apply_dividend(&self, symbol: &str, amount_per_share: Decimal) -> bool {
        let mut ledger = self.inner.lock();
        let Some(qty) = ledger.positions.get(symbol).map(|p| p.qty) else {
            return false;
        };
        let amount = qty * amount_per_share;
        ledger.cash += amount;
        recompute(&self.margin, &mut ledger);
        info!(symbol, %amount, "💵 Dividend applied");
        true
    }

    /// `ratio` new shares per old share; cost basis is preserved.
    pub fn apply_split(&self, symbol: &str, ratio: Decimal) -> bool {
        if ratio <= Decimal::ZERO {
            return false;
        }
        let mut ledger = self.inner.lock();
        let Some(position) = ledger.positions.get_mut(symbol) else {
            return false;
        };
        position.qty *= ratio;
        position.avg_entry_price /= ratio;
        position.last_price /= ratio;
        recompute(&self.margin, &mut ledger);
        info!(symbol, %ratio, "✂️ Split applied");
        true
    }

    pub fn state(&self) -> AccountState {
        self.inner.lock().state.clone()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.lock().positions.get(symbol).cloned()
    }

    pub fn position_qty(&self, symbol: &str) -> Decimal {
        self.inner
            .lock()
            .positions
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.qty)
    }

    pub fn trade_history(&self) -> Vec<ClosedTrade> {
        self.inner.lock().trade_history.clone()
    }

    pub fn exposure(&self) -> ExposureMetrics {
        let ledger = self.inner.lock();
        let long_notional = ledger.state.long_market_value;
        let short_notional = ledger.state.short_market_value;
        ExposureMetrics {
            net_exposure: long_notional - short_notional,
            gross_notional: long_notional + short_notional,
            long_notional,
            short_notional,
            position_count: ledger.positions.len(),
        }
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        let ledger = self.inner.lock();
        AccountSnapshot {
            initial_capital: ledger.initial_capital,
            cash: ledger.cash,
            positions: ledger.positions.clone(),
            accrued_fees: ledger.accrued_fees,
            realized_pl: ledger.realized_pl,
            trade_history: ledger.trade_history.clone(),
        }
    }

    pub fn restore(&self, snapshot: AccountSnapshot) {
        let mut ledger = self.inner.lock();
        ledger.initial_capital = snapshot.initial_capital;
        ledger.cash = snapshot.cash;
        ledger.positions = snapshot.positions;
        ledger.accrued_fees = snapshot.accrued_fees;
        ledger.realized_pl = snapshot.realized_pl;
        ledger.trade_history = snapshot.trade_history;
        recompute(&self.margin, &mut ledger);
    }
}

fn recompute(margin: &MarginConfig, ledger: &mut Ledger) {
    let mut long_mv = Decimal::ZERO;
    let mut short_mv = Decimal::ZERO;
    for position in ledger.positions.values_mut() {
        position.market_value = position.qty * position.last_price;
        position.cost_basis = position.qty * position.avg_entry_price;
        position.unrealized_pl = position.market_value - position.cost_basis;
        if position.is_long() {
            long_mv += position.market_value;
        } else {
            short_mv += position.market_value.abs();
        }
    }

    let equity = ledger.cash + long_mv - short_mv;
    let initial_margin = margin.initial_margin_rate * long_mv.max(short_mv);
    let maintenance_margin = margin.maintenance_margin_rate * (long_mv + short_mv);
    let regt = (margin.regt_multiplier * (equity - initial_margin)).max(Decimal::ZERO);
    let pattern_day_trader = equity >= margin.pdt_equity_threshold;
    let daytrading = if pattern_day_trader {
        (margin.daytrading_multiplier * (equity - maintenance_margin)).max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };

    ledger.state = AccountState {
        cash: ledger.cash,
        equity,
        regt_buying_power: regt,
        daytrading_buying_power: daytrading,
        buying_power: if pattern_day_trader { daytrading } else { regt },
        long_market_value: long_mv,
        short_market_value: short_mv,
        initial_margin,
        maintenance_margin,
        accrued_fees: ledger.accrued_fees,
        realized_pl: ledger.realized_pl,
        pattern_day_trader,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Liquidity, Side};
    use rust_decimal_macros::dec;

    fn fill(side: Side, qty: Decimal, price: Decimal) -> Fill {
        Fill {
            order_id: "o".into(),
            symbol: "AAPL".into(),
            side,
            qty,
            price,
            fees: Decimal::ZERO,
            liquidity: Liquidity::Taker,
            timestamp_ns: 0,
        }
    }

    fn account() -> AccountManager {
        AccountManager::new(dec!(100000), MarginConfig::default())
    }

    #[test]
    fn test_average_entry_recurrence_and_flip() {
        let acct = account();
        acct.apply_fill(&fill(Side::Buy, dec!(10), dec!(100)));
        acct.apply_fill(&fill(Side::Buy, dec!(10), dec!(110)));
        let pos = acct.position("AAPL").unwrap();
        assert_eq!(pos.qty, dec!(20));
        assert_eq!(pos.avg_entry_price, dec!(105));

        let closed = acct.apply_fill(&fill(Side::Sell, dec!(25), dec!(120))).unwrap();
        assert_eq!(closed.qty, dec!(20));
        assert_eq!(closed.realized_pl, dec!(300));

        let pos = acct.position("AAPL").unwrap();
        assert_eq!(pos.qty, dec!(-5));
        assert_eq!(pos.avg_entry_price, dec!(120));
        assert_eq!(acct.state().realized_pl, dec!(300));
    }

    #[test]
    fn test_flat_position_is_removed() {
        let acct = account();
        acct.apply_fill(&fill(Side::Buy, dec!(10), dec!(100)));
        acct.apply_fill(&fill(Side::Sell, dec!(10), dec!(101)));
        assert!(acct.position("AAPL").is_none());
        let state = acct.state();
        assert_eq!(state.cash, dec!(100010));
        assert_eq!(state.equity, dec!(100010));
    }

    #[test]
    fn test_cash_includes_fees() {
        let acct = account();
        let mut f = fill(Side::Buy, dec!(10), dec!(150));
        f.fees = dec!(1.25);
        acct.apply_fill(&f);
        let state = acct.state();
        assert_eq!(state.cash, dec!(98498.75));
        assert_eq!(state.accrued_fees, dec!(1.25));
        assert_eq!(state.equity, state.cash + state.long_market_value - state.short_market_value);
    }

    #[test]
    fn test_mark_to_market_and_unrealized() {
        let acct = account();
        acct.apply_fill(&fill(Side::Sell, dec!(10), dec!(50)));
        assert!(acct.mark_to_market("AAPL", dec!(45)));
        assert!(!acct.mark_to_market("MSFT", dec!(1)));

        let pos = acct.position("AAPL").unwrap();
        assert_eq!(pos.market_value, dec!(-450));
        assert_eq!(pos.cost_basis, dec!(-500));
        assert_eq!(pos.unrealized_pl, dec!(50));

        let state = acct.state();
        assert_eq!(state.short_market_value, dec!(450));
        assert_eq!(state.equity, dec!(100050));
    }

    #[test]
    fn test_buying_power_multipliers() {
        let acct = account();
        let state = acct.state();
        assert!(state.pattern_day_trader);
        assert_eq!(state.regt_buying_power, dec!(200000));
        assert_eq!(state.daytrading_buying_power, dec!(400000));
        assert_eq!(state.buying_power, dec!(400000));

        let small = AccountManager::new(dec!(10000), MarginConfig::default());
        let state = small.state();
        assert!(!state.pattern_day_trader);
        assert_eq!(state.buying_power, dec!(20000));
        assert_eq!(state.daytrading_buying_power, Decimal::ZERO);
    }

    #[test]
    fn test_has_buying_power() {
        let acct = AccountManager::new(dec!(10000), MarginConfig::default());
        assert!(acct.has_buying_power(dec!(20000), true));
        assert!(!acct.has_buying_power(dec!(20001), true));
        assert!(acct.has_buying_power(dec!(15000), false));
    }

    #[test]
    fn test_dividend_and_split_only_for_held_symbols() {
        let acct = account();
        assert!(!acct.apply_dividend("AAPL", dec!(0.24)));
        assert!(!acct.apply_split("AAPL", dec!(4)));

        acct.apply_fill(&fill(Side::Buy, dec!(10), dec!(400)));
        assert!(acct.apply_dividend("AAPL", dec!(0.24)));
        assert_eq!(acct.state().cash, dec!(100000) - dec!(4000) + dec!(2.4));

        assert!(acct.apply_split("AAPL", dec!(4)));
        let pos = acct.position("AAPL").unwrap();
        assert_eq!(pos.qty, dec!(40));
        assert_eq!(pos.avg_entry_price, dec!(100));
        assert_eq!(pos.cost_basis, dec!(4000));
    }

    #[test]
    fn test_snapshot_round_trip_preserves_state() {
        let acct = account();
        acct.apply_fill(&fill(Side::Buy, dec!(3), dec!(99.5)));
        acct.mark_to_market("AAPL", dec!(101));

        let restored = AccountManager::new(dec!(1), MarginConfig::default());
        restored.restore(acct.snapshot());
        assert_eq!(restored.state(), acct.state());
        assert_eq!(restored.positions(), acct.positions());
    }
}
