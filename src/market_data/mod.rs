pub mod feed;
pub mod source;
pub mod types;

pub use source::{DataSource, DataSourceError, InMemoryDataSource, JsonlDataSource};
pub use types::{Bar, CorporateAction, CorporateActionKind, MarketData, Quote, Trade};
