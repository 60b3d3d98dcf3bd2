use crate::market_data::types::{Bar, CorporateAction, MarketData, Quote, Trade};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("Data source unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Items in timestamp order. Live streams may block between items and end when
/// the upstream closes.
pub type EventStream = Box<dyn Iterator<Item = MarketData> + Send>;

/// Read-only market data collaborator shared by every session.
pub trait DataSource: Send + Sync {
    fn get_bars(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Bar>, DataSourceError>;
    fn get_trades(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Trade>, DataSourceError>;
    fn get_quotes(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Quote>, DataSourceError>;

    fn get_corporate_actions(&self, _symbol: &str, _start_ns: i64, _end_ns: i64) -> Result<Vec<CorporateAction>, DataSourceError> {
        Ok(Vec::new())
    }

    /// Live feed for `symbols` (all symbols when empty).
    fn stream_events(&self, symbols: &[String], start_ns: i64, end_ns: i64) -> Result<EventStream, DataSourceError>;
}

fn in_window(item: &MarketData, symbol: Option<&str>, start_ns: i64, end_ns: i64) -> bool {
    let ts = item.timestamp_ns();
    symbol.is_none_or(|s| item.symbol() == s) && ts >= start_ns && ts <= end_ns
}

/// Holds a fixed data set in memory. Items are kept sorted by
/// `(timestamp, kind)` so every query returns them in feed order.
#[derive(Default)]
pub struct InMemoryDataSource {
    items: RwLock<Vec<MarketData>>,
    unavailable: AtomicBool,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<MarketData>) -> Self {
        let source = Self::new();
        source.extend(items);
        source
    }

    pub fn push(&self, item: MarketData) {
        self.extend(std::iter::once(item));
    }

    pub fn extend<I: IntoIterator<Item = MarketData>>(&self, items: I) {
        let mut guard = self.items.write();
        guard.extend(items);
        guard.sort_by_key(|m| (m.timestamp_ns(), m.kind_rank()));
    }

    /// Makes every query fail, e.g. to test start-up failure handling.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DataSourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DataSourceError::Unavailable("in-memory source disabled".into()));
        }
        Ok(())
    }

    fn select<T>(
        &self,
        symbol: &str,
        start_ns: i64,
        end_ns: i64,
        limit: Option<usize>,
        pick: impl Fn(&MarketData) -> Option<T>,
    ) -> Result<Vec<T>, DataSourceError> {
        self.check()?;
        let items = self.items.read();
        Ok(items
            .iter()
            .filter(|m| in_window(m, Some(symbol), start_ns, end_ns))
            .filter_map(pick)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

impl DataSource for InMemoryDataSource {
    fn get_bars(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Bar>, DataSourceError> {
        self.select(symbol, start_ns, end_ns, limit, |m| match m {
            MarketData::Bar(b) => Some(b.clone()),
            _ => None,
        })
    }

    fn get_trades(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Trade>, DataSourceError> {
        self.select(symbol, start_ns, end_ns, limit, |m| match m {
            MarketData::Trade(t) => Some(t.clone()),
            _ => None,
        })
    }

    fn get_quotes(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Quote>, DataSourceError> {
        self.select(symbol, start_ns, end_ns, limit, |m| match m {
            MarketData::Quote(q) => Some(q.clone()),
            _ => None,
        })
    }

    fn get_corporate_actions(&self, symbol: &str, start_ns: i64, end_ns: i64) -> Result<Vec<CorporateAction>, DataSourceError> {
        self.select(symbol, start_ns, end_ns, None, |m| match m {
            MarketData::CorporateAction(c) => Some(c.clone()),
            _ => None,
        })
    }

    fn stream_events(&self, symbols: &[String], start_ns: i64, end_ns: i64) -> Result<EventStream, DataSourceError> {
        self.check()?;
        let items: Vec<MarketData> = self
            .items
            .read()
            .iter()
            .filter(|m| in_window(m, None, start_ns, end_ns))
            .filter(|m| symbols.is_empty() || symbols.iter().any(|s| s == m.symbol()))
            .cloned()
            .collect();
        Ok(Box::new(items.into_iter()))
    }
}

/// One JSON `MarketData` object per line, e.g.
/// `{"event_type":"trade","symbol":"AAPL","price":"150.00","size":"100","timestamp_ns":...}`.
/// Blank lines and lines starting with `#` are skipped.
pub struct JsonlDataSource {
    path: PathBuf,
    inner: InMemoryDataSource,
}

impl JsonlDataSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DataSourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Market data file unavailable");
            DataSourceError::Unavailable(format!("{}: {}", path.display(), e))
        })?;
        let mut items = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let item: MarketData = serde_json::from_str(trimmed).map_err(|source| DataSourceError::Parse {
                line: idx + 1,
                source,
            })?;
            items.push(item);
        }
        info!(path = %path.display(), count = items.len(), "📂 Market data loaded");
        Ok(Self {
            path,
            inner: InMemoryDataSource::from_items(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for JsonlDataSource {
    fn get_bars(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Bar>, DataSourceError> {
        self.inner.get_bars(symbol, start_ns, end_ns, limit)
    }

    fn get_trades(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Trade>, DataSourceError> {
        self.inner.get_trades(symbol, start_ns, end_ns, limit)
    }

    fn get_quotes(&self, symbol: &str, start_ns: i64, end_ns: i64, limit: Option<usize>) -> Result<Vec<Quote>, DataSourceError> {
        self.inner.get_quotes(symbol, start_ns, end_ns, limit)
    }

    fn get_corporate_actions(&self, symbol: &str, start_ns: i64, end_ns: i64) -> Result<Vec<CorporateAction>, DataSourceError> {
        self.inner.get_corporate_actions(symbol, start_ns, end_ns)
    }

    fn stream_events(&self, symbols: &[String], start_ns: i64, end_ns: i64) -> Result<EventStream, DataSourceError> {
        self.inner.stream_events(symbols, start_ns, end_ns)
    }
}
