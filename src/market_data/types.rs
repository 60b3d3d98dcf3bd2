use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Top-of-book snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Bar end time.
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CorporateActionKind {
    Dividend { amount_per_share: Decimal },
    Split { ratio: Decimal },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorporateAction {
    pub symbol: String,
    #[serde(flatten)]
    pub kind: CorporateActionKind,
    pub timestamp_ns: i64,
}

/// One item of a feed, before the session assigns it a sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum MarketData {
    Quote(Quote),
    Trade(Trade),
    Bar(Bar),
    CorporateAction(CorporateAction),
}

impl MarketData {
    pub fn timestamp_ns(&self) -> i64 {
        match self {
            MarketData::Quote(q) => q.timestamp_ns,
            MarketData::Trade(t) => t.timestamp_ns,
            MarketData::Bar(b) => b.timestamp_ns,
            MarketData::CorporateAction(c) => c.timestamp_ns,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            MarketData::Quote(q) => &q.symbol,
            MarketData::Trade(t) => &t.symbol,
            MarketData::Bar(b) => &b.symbol,
            MarketData::CorporateAction(c) => &c.symbol,
        }
    }

    /// Tie-break for items sharing a timestamp: actions before quotes before
    /// prints, so a bar never fills against a quote it preceded.
    pub fn kind_rank(&self) -> u8 {
        match self {
            MarketData::CorporateAction(_) => 0,
            MarketData::Quote(_) => 1,
            MarketData::Trade(_) => 2,
            MarketData::Bar(_) => 3,
        }
    }
}

/// Best bid/offer tracked by the matching engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Nbbo {
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub timestamp_ns: i64,
}

impl Nbbo {
    pub fn has_bid(&self) -> bool {
        self.bid_price > Decimal::ZERO
    }

    pub fn has_ask(&self) -> bool {
        self.ask_price > Decimal::ZERO
    }

    pub fn mid(&self) -> Option<Decimal> {
        if self.has_bid() && self.has_ask() {
            Some((self.bid_price + self.ask_price) / dec!(2))
        } else {
            None
        }
    }
}
