use crate::event_queue::OverflowPolicy;
use chrono::NaiveDate;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

/// Process-wide knobs shared by every session the manager creates.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one redb file per session. `None` keeps WAL and
    /// checkpoints in memory.
    pub wal_dir: Option<PathBuf>,
    /// 0 disables checkpointing.
    pub checkpoint_interval_events: u64,
    pub truncate_wal_on_checkpoint: bool,
    /// Terminal orders kept queryable per session, oldest evicted first.
    /// 0 keeps every one.
    pub max_closed_orders: usize,
    /// Multiplex one live stream into every live session's queue.
    pub enable_shared_feed: bool,
    /// JSONL event file used by the `marketsim` binary.
    pub data_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_dir: None,
            checkpoint_interval_events: 1000,
            truncate_wal_on_checkpoint: true,
            max_closed_orders: 10_000,
            enable_shared_feed: false,
            data_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Historical window preloaded at start.
    #[default]
    Backtest,
    /// Streamed from the data source as it arrives.
    Live,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub symbols: Vec<String>,
    pub start_ns: Option<i64>,
    pub end_ns: Option<i64>,
    pub initial_capital: Decimal,
    /// 0 = unthrottled.
    pub speed_factor: f64,
    /// 0 = unbounded.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Falls back to a hash of the session id.
    pub rng_seed: Option<u64>,
    pub mode: FeedMode,
    pub apply_corporate_actions: bool,
    /// Prior-day closes used for SSR and the initial LULD reference.
    pub prior_closes: HashMap<String, Decimal>,
    pub execution: ExecutionConfig,
    pub fees: FeeSchedule,
    pub margin: MarginConfig,
    pub halts: HaltConfig,
    pub calendar: CalendarConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            start_ns: None,
            end_ns: None,
            initial_capital: dec!(100000),
            speed_factor: 0.0,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            rng_seed: None,
            mode: FeedMode::Backtest,
            apply_corporate_actions: false,
            prior_closes: HashMap::new(),
            execution: ExecutionConfig::default(),
            fees: FeeSchedule::default(),
            margin: MarginConfig::default(),
            halts: HaltConfig::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_symbols(symbols: &[&str]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Upper-cases symbols and symbol-keyed maps. The `config` crate lowercases
    /// map keys read from files.
    pub fn normalize(&mut self) {
        for symbol in self.symbols.iter_mut() {
            *symbol = symbol.trim().to_uppercase();
        }
        self.symbols.dedup();
        self.prior_closes = self
            .prior_closes
            .drain()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.halts.symbol_tiers = self
            .halts
            .symbol_tiers
            .drain()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.symbols.is_empty() {
            return Err("symbols must not be empty".into());
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err("symbols must not contain blank entries".into());
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err("initial_capital must be positive".into());
        }
        if !self.speed_factor.is_finite() || self.speed_factor < 0.0 {
            return Err("speed_factor must be a non-negative number".into());
        }
        if let (Some(start), Some(end)) = (self.start_ns, self.end_ns) {
            if end < start {
                return Err("end_ns precedes start_ns".into());
            }
        }
        for (name, p) in [
            ("partial_fill_probability", self.execution.partial_fill_probability),
            ("reject_probability", self.execution.reject_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("{} must be within [0, 1]", name));
            }
        }
        if self.margin.initial_margin_rate <= Decimal::ZERO {
            return Err("initial_margin_rate must be positive".into());
        }
        Ok(())
    }
}

/// Execution frictions. Defaults describe a frictionless venue.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub latency_ms: u64,
    /// Uniform jitter added on top of `latency_ms`.
    pub latency_jitter_ms: u64,
    pub slippage_bps: Decimal,
    pub extended_hours_slippage_multiplier: Decimal,
    /// bps per $1M of notional.
    pub impact_linear_bps: Decimal,
    /// bps per sqrt($1M of notional).
    pub impact_sqrt_bps: Decimal,
    pub partial_fill_probability: f64,
    /// Fill quantity never exceeds the displayed size at the touch.
    pub cap_to_displayed_size: bool,
    pub extended_hours_liquidity_reduction_pct: Decimal,
    pub reject_probability: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            latency_jitter_ms: 0,
            slippage_bps: Decimal::ZERO,
            extended_hours_slippage_multiplier: dec!(2),
            impact_linear_bps: Decimal::ZERO,
            impact_sqrt_bps: Decimal::ZERO,
            partial_fill_probability: 0.0,
            cap_to_displayed_size: true,
            extended_hours_liquidity_reduction_pct: dec!(50),
            reject_probability: 0.0,
        }
    }
}

/// Broker and regulatory fees. Regulatory defaults track the 2024 rates.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FeeSchedule {
    pub commission_per_share: Decimal,
    pub commission_per_order: Decimal,
    pub min_commission: Decimal,
    pub max_commission: Option<Decimal>,
    /// Dollars per $1M of sell notional.
    pub sec_fee_per_million: Decimal,
    pub finra_taf_per_share: Decimal,
    pub finra_taf_max: Decimal,
    pub maker_rebate_per_share: Decimal,
    pub taker_fee_per_share: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            commission_per_share: Decimal::ZERO,
            commission_per_order: Decimal::ZERO,
            min_commission: Decimal::ZERO,
            max_commission: None,
            sec_fee_per_million: dec!(27.80),
            finra_taf_per_share: dec!(0.000166),
            finra_taf_max: dec!(8.30),
            maker_rebate_per_share: Decimal::ZERO,
            taker_fee_per_share: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MarginConfig {
    pub initial_margin_rate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub regt_multiplier: Decimal,
    pub daytrading_multiplier: Decimal,
    pub pdt_equity_threshold: Decimal,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            initial_margin_rate: dec!(0.5),
            maintenance_margin_rate: dec!(0.25),
            regt_multiplier: dec!(2),
            daytrading_multiplier: dec!(4),
            pdt_equity_threshold: dec!(25000),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HaltConfig {
    pub enable_ssr: bool,
    pub ssr_threshold_pct: Decimal,
    pub enable_luld: bool,
    pub luld_tier1_pct: Decimal,
    pub luld_tier2_pct: Decimal,
    pub default_tier: u8,
    /// Per-symbol tier overrides (1 or 2).
    pub symbol_tiers: HashMap<String, u8>,
    pub luld_halt_duration_sec: u64,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            enable_ssr: true,
            ssr_threshold_pct: dec!(10),
            enable_luld: true,
            luld_tier1_pct: dec!(5),
            luld_tier2_pct: dec!(10),
            default_tier: 1,
            symbol_tiers: HashMap::new(),
            luld_halt_duration_sec: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CalendarConfig {
    /// When false every instant is treated as the regular session.
    pub enforce_market_hours: bool,
    pub use_default_holidays: bool,
    pub holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            enforce_market_hours: true,
            use_default_holidays: true,
            holidays: Vec::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Layers, lowest precedence first: `config/marketsim`, `config/local`,
    /// an explicit file, then `MARKETSIM__*` environment overrides
    /// (e.g. `MARKETSIM__ENGINE__WAL_DIR=/var/lib/marketsim`).
    pub fn load(explicit: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/marketsim").required(false))
            .add_source(File::with_name("config/local").required(false));
        if let Some(path) = explicit {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("MARKETSIM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
