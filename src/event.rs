use crate::market_data::types::{Bar, CorporateActionKind, MarketData, Quote, Trade};
use crate::model::{Fill, Order};
use serde::{Deserialize, Serialize};

/// Everything a session consumes or emits, keyed by kind.
///
/// Market kinds travel through the [`EventQueue`](crate::event_queue::EventQueue);
/// order kinds are emitted to callbacks after the effect has been applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Quote(Quote),
    Trade(Trade),
    Bar(Bar),
    CorporateAction(CorporateActionKind),
    OrderNew(Order),
    OrderFill { order: Order, fill: Fill },
    OrderCancel(Order),
    OrderExpire(Order),
    OrderReject(Order),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Per-session sequence number. For order events this is the sequence of
    /// the input that caused them.
    pub seq: u64,
    pub timestamp_ns: i64,
    pub symbol: String,
    pub kind: EventKind,
}

impl Event {
    pub fn from_market(seq: u64, data: MarketData) -> Self {
        let timestamp_ns = data.timestamp_ns();
        let symbol = data.symbol().to_string();
        let kind = match data {
            MarketData::Quote(q) => EventKind::Quote(q),
            MarketData::Trade(t) => EventKind::Trade(t),
            MarketData::Bar(b) => EventKind::Bar(b),
            MarketData::CorporateAction(c) => EventKind::CorporateAction(c.kind),
        };
        Self {
            seq,
            timestamp_ns,
            symbol,
            kind,
        }
    }

    pub fn order(seq: u64, timestamp_ns: i64, kind: EventKind) -> Self {
        let symbol = match &kind {
            EventKind::OrderNew(o)
            | EventKind::OrderCancel(o)
            | EventKind::OrderExpire(o)
            | EventKind::OrderReject(o) => o.symbol.clone(),
            EventKind::OrderFill { order, .. } => order.symbol.clone(),
            EventKind::Quote(q) => q.symbol.clone(),
            EventKind::Trade(t) => t.symbol.clone(),
            EventKind::Bar(b) => b.symbol.clone(),
            EventKind::CorporateAction(_) => String::new(),
        };
        Self {
            seq,
            timestamp_ns,
            symbol,
            kind,
        }
    }

    pub fn is_market(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Quote(_) | EventKind::Trade(_) | EventKind::Bar(_) | EventKind::CorporateAction(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_event_carries_symbol_and_time() {
        let data = MarketData::Trade(Trade {
            symbol: "AAPL".into(),
            price: dec!(150),
            size: dec!(100),
            timestamp_ns: 42,
        });
        let event = Event::from_market(7, data);
        assert_eq!(event.seq, 7);
        assert_eq!(event.timestamp_ns, 42);
        assert_eq!(event.symbol, "AAPL");
        assert!(event.is_market());
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::from_market(
            1,
            MarketData::Quote(Quote {
                symbol: "MSFT".into(),
                bid_price: dec!(400.10),
                bid_size: dec!(3),
                ask_price: dec!(400.12),
                ask_size: dec!(5),
                timestamp_ns: 10,
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["kind"], "QUOTE");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
