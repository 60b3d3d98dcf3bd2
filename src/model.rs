use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells. Multiplying a quantity by this gives the
    /// signed position delta.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "STOP_LIMIT")]
    StopLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeInForce {
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why an order ended up REJECTED (or CANCELED by the TIF rules).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    InvalidOrder(String),
    UnknownSymbol(String),
    MarketClosed,
    ExtendedHoursNotAllowed,
    Halted,
    ShortSaleRestricted,
    InsufficientBuyingPower,
    NoMarketData,
    /// Random venue rejection drawn from the friction model.
    ExecutionRejected,
    /// FOK could not be satisfied in full.
    FillOrKillUnfilled,
    /// IOC remainder after the immediate attempt.
    ImmediateOrCancelRemainder,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidOrder(detail) => write!(f, "invalid order: {}", detail),
            RejectReason::UnknownSymbol(symbol) => {
                write!(f, "symbol '{}' is not part of this session", symbol)
            }
            RejectReason::MarketClosed => write!(f, "market is closed"),
            RejectReason::ExtendedHoursNotAllowed => {
                write!(f, "order not eligible for extended hours")
            }
            RejectReason::Halted => write!(f, "symbol is halted (LULD)"),
            RejectReason::ShortSaleRestricted => {
                write!(f, "short sale restriction in effect")
            }
            RejectReason::InsufficientBuyingPower => write!(f, "insufficient buying power"),
            RejectReason::NoMarketData => write!(f, "no market data for symbol"),
            RejectReason::ExecutionRejected => write!(f, "rejected by simulated venue"),
            RejectReason::FillOrKillUnfilled => write!(f, "fill-or-kill could not be filled"),
            RejectReason::ImmediateOrCancelRemainder => {
                write!(f, "immediate-or-cancel remainder canceled")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Liquidity {
    #[serde(rename = "MAKER")]
    Maker,
    #[serde(rename = "TAKER")]
    Taker,
}

/// What a client submits. Validated by the session before it becomes an [`Order`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub extended_hours: bool,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, qty: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            qty: Some(qty),
            limit_price: None,
            stop_price: None,
            extended_hours: false,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, qty: Decimal, limit_price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(symbol, side, qty)
        }
    }

    pub fn stop(symbol: &str, side: Side, qty: Decimal, stop_price: Decimal) -> Self {
        Self {
            order_type: OrderType::Stop,
            stop_price: Some(stop_price),
            ..Self::market(symbol, side, qty)
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    pub fn with_extended_hours(mut self, extended_hours: bool) -> Self {
        self.extended_hours = extended_hours;
        self
    }

    /// Field-level validation. Market-state checks happen in the matching engine.
    pub fn validate(&self) -> Result<Decimal, RejectReason> {
        let qty = match self.qty {
            Some(q) if q > Decimal::ZERO => q,
            Some(_) => return Err(RejectReason::InvalidOrder("qty must be positive".into())),
            None => return Err(RejectReason::InvalidOrder("qty is required".into())),
        };
        let needs_limit = matches!(self.order_type, OrderType::Limit | OrderType::StopLimit);
        let needs_stop = matches!(self.order_type, OrderType::Stop | OrderType::StopLimit);
        match self.limit_price {
            Some(p) if p <= Decimal::ZERO => {
                return Err(RejectReason::InvalidOrder("limit_price must be positive".into()));
            }
            None if needs_limit => {
                return Err(RejectReason::InvalidOrder("limit_price is required".into()));
            }
            _ => {}
        }
        match self.stop_price {
            Some(p) if p <= Decimal::ZERO => {
                return Err(RejectReason::InvalidOrder("stop_price must be positive".into()));
            }
            None if needs_stop => {
                return Err(RejectReason::InvalidOrder("stop_price is required".into()));
            }
            _ => {}
        }
        if self.extended_hours
            && (self.order_type != OrderType::Limit || self.time_in_force != TimeInForce::Day)
        {
            return Err(RejectReason::InvalidOrder(
                "extended hours orders must be DAY limit orders".into(),
            ));
        }
        Ok(qty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub qty: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub extended_hours: bool,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    #[serde(default)]
    pub avg_fill_price: Option<Decimal>,
    pub submitted_at_ns: i64,
    pub updated_at_ns: i64,
    /// Earliest virtual time the simulated venue sees the order (latency).
    pub eligible_at_ns: i64,
    #[serde(default)]
    pub stop_triggered: bool,
    #[serde(default)]
    pub reject_reason: Option<RejectReason>,
}

impl Order {
    pub fn from_request(id: String, request: &OrderRequest, qty: Decimal, now_ns: i64) -> Self {
        Self {
            id,
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            time_in_force: request.time_in_force,
            qty,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            extended_hours: request.extended_hours,
            status: OrderStatus::New,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            submitted_at_ns: now_ns,
            updated_at_ns: now_ns,
            eligible_at_ns: now_ns,
            stop_triggered: false,
            reject_reason: None,
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stop orders are dormant until their trigger is touched.
    pub fn is_armed(&self) -> bool {
        match self.order_type {
            OrderType::Stop | OrderType::StopLimit => self.stop_triggered,
            OrderType::Market | OrderType::Limit => true,
        }
    }

    /// The limit that applies once the order is live, if any.
    pub fn effective_limit(&self) -> Option<Decimal> {
        match self.order_type {
            OrderType::Limit | OrderType::StopLimit => self.limit_price,
            OrderType::Market | OrderType::Stop => None,
        }
    }
}

/// Immutable execution record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub liquidity: Liquidity,
    pub timestamp_ns: i64,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.qty * self.price
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub last_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pl: Decimal,
    #[serde(default)]
    pub realized_pl: Decimal,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    pub fn is_long(&self) -> bool {
        self.qty > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.qty < Decimal::ZERO
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub cash: Decimal,
    pub equity: Decimal,
    pub regt_buying_power: Decimal,
    pub daytrading_buying_power: Decimal,
    pub buying_power: Decimal,
    pub long_market_value: Decimal,
    pub short_market_value: Decimal,
    pub initial_margin: Decimal,
    pub maintenance_margin: Decimal,
    pub accrued_fees: Decimal,
    pub realized_pl: Decimal,
    pub pattern_day_trader: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validate_requires_positive_qty() {
        let mut req = OrderRequest::market("AAPL", Side::Buy, dec!(10));
        assert_eq!(req.validate(), Ok(dec!(10)));

        req.qty = Some(dec!(0));
        assert!(matches!(req.validate(), Err(RejectReason::InvalidOrder(_))));

        req.qty = None;
        assert!(matches!(req.validate(), Err(RejectReason::InvalidOrder(_))));
    }

    #[test]
    fn test_validate_limit_and_stop_prices() {
        let mut req = OrderRequest::limit("AAPL", Side::Buy, dec!(1), dec!(100));
        assert!(req.validate().is_ok());
        req.limit_price = None;
        assert!(req.validate().is_err());

        let mut stop = OrderRequest::stop("AAPL", Side::Sell, dec!(1), dec!(95));
        assert!(stop.validate().is_ok());
        stop.stop_price = Some(dec!(-1));
        assert!(stop.validate().is_err());
    }

    #[test]
    fn test_extended_hours_must_be_day_limit() {
        let req = OrderRequest::market("AAPL", Side::Buy, dec!(1)).with_extended_hours(true);
        assert!(req.validate().is_err());

        let ok = OrderRequest::limit("AAPL", Side::Buy, dec!(1), dec!(10)).with_extended_hours(true);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_stop_orders_start_disarmed() {
        let req = OrderRequest::stop("AAPL", Side::Sell, dec!(5), dec!(95));
        let order = Order::from_request("o-1".into(), &req, dec!(5), 0);
        assert!(!order.is_armed());
        assert_eq!(order.effective_limit(), None);
        assert_eq!(order.remaining_qty(), dec!(5));
    }
}
