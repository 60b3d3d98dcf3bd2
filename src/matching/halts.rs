//! Per-symbol trading restrictions: LULD price bands and the Rule 201 short
//! sale restriction.
use crate::config::HaltConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

const NS_PER_SEC: i64 = 1_000_000_000;

/// SSR covers the trigger day and the following trading day.
const SSR_DAYS: u8 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SymbolRestrictions {
    pub prior_close: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub reference_price: Option<Decimal>,
    pub halted_until_ns: Option<i64>,
    /// Print that triggered the active halt; becomes the new reference.
    pub halt_trigger_price: Option<Decimal>,
    pub ssr_days_remaining: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltTransition {
    Halted { until_ns: i64 },
    Resumed,
}

#[derive(Debug, Clone)]
pub struct HaltMonitor {
    cfg: HaltConfig,
    symbols: BTreeMap<String, SymbolRestrictions>,
}

impl HaltMonitor {
    pub fn new(cfg: &HaltConfig, symbols: &[String], prior_closes: &HashMap<String, Decimal>) -> Self {
        let symbols = symbols
            .iter()
            .map(|s| {
                let prior_close = prior_closes.get(s).copied();
                (
                    s.clone(),
                    SymbolRestrictions {
                        prior_close,
                        reference_price: prior_close,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            cfg: cfg.clone(),
            symbols,
        }
    }

    fn band_pct(&self, symbol: &str) -> Decimal {
        let tier = self
            .cfg
            .symbol_tiers
            .get(symbol)
            .copied()
            .unwrap_or(self.cfg.default_tier);
        if tier >= 2 {
            self.cfg.luld_tier2_pct
        } else {
            self.cfg.luld_tier1_pct
        }
    }

    /// (lower, upper) around the current reference.
    pub fn band(&self, symbol: &str) -> Option<(Decimal, Decimal)> {
        let reference = self.symbols.get(symbol)?.reference_price?;
        let width = reference * self.band_pct(symbol) / Decimal::ONE_HUNDRED;
        Some((reference - width, reference + width))
    }

    /// Releases an expired halt. Call before any halt-dependent decision.
    pub fn refresh(&mut self, symbol: &str, now_ns: i64) -> Option<HaltTransition> {
        let state = self.symbols.get_mut(symbol)?;
        let until = state.halted_until_ns?;
        if now_ns < until {
            return None;
        }
        state.halted_until_ns = None;
        if let Some(trigger) = state.halt_trigger_price.take() {
            state.reference_price = Some(trigger);
        }
        info!(symbol, reference = ?state.reference_price, "✅ LULD halt lifted");
        Some(HaltTransition::Resumed)
    }

    pub fn is_halted(&self, symbol: &str, now_ns: i64) -> bool {
        self.symbols
            .get(symbol)
            .and_then(|s| s.halted_until_ns)
            .is_some_and(|until| now_ns < until)
    }

    /// Feeds a trade or bar print through both LULD and SSR.
    pub fn on_print(&mut self, symbol: &str, price: Decimal, ts_ns: i64) -> Option<HaltTransition> {
        let resumed = self.refresh(symbol, ts_ns);
        let band = self.band(symbol);
        let enable_luld = self.cfg.enable_luld;
        let enable_ssr = self.cfg.enable_ssr;
        let ssr_pct = self.cfg.ssr_threshold_pct;
        let halt_ns = self.cfg.luld_halt_duration_sec as i64 * NS_PER_SEC;

        let state = self.symbols.get_mut(symbol)?;
        state.last_price = Some(price);

        if enable_ssr && state.ssr_days_remaining == 0 {
            if let Some(prior) = state.prior_close {
                let trigger = prior * (Decimal::ONE - ssr_pct / Decimal::ONE_HUNDRED);
                if price <= trigger {
                    state.ssr_days_remaining = SSR_DAYS;
                    warn!(symbol, %price, %prior, "📉 Short sale restriction triggered");
                }
            }
        }

        if !enable_luld || state.halted_until_ns.is_some() {
            return resumed;
        }
        let Some((lower, upper)) = band else {
            state.reference_price = Some(price);
            return resumed;
        };
        if price < lower || price > upper {
            let until_ns = ts_ns.saturating_add(halt_ns);
            state.halted_until_ns = Some(until_ns);
            state.halt_trigger_price = Some(price);
            crate::metrics::inc_luld_halts();
            warn!(symbol, %price, %lower, %upper, until_ns, "🚨 LULD halt");
            return Some(HaltTransition::Halted { until_ns });
        }
        resumed
    }

    pub fn ssr_active(&self, symbol: &str) -> bool {
        self.cfg.enable_ssr
            && self
                .symbols
                .get(symbol)
                .is_some_and(|s| s.ssr_days_remaining > 0)
    }

    /// New trading day: yesterday's last print becomes the prior close and
    /// the LULD reference, and SSR ages by one day.
    pub fn roll_day(&mut self) {
        for state in self.symbols.values_mut() {
            if let Some(last) = state.last_price {
                state.prior_close = Some(last);
                if state.halted_until_ns.is_none() {
                    state.reference_price = Some(last);
                }
            }
            state.ssr_days_remaining = state.ssr_days_remaining.saturating_sub(1);
        }
    }

    /// Rescales reference prices after a split of `ratio` new shares per old.
    pub fn apply_split(&mut self, symbol: &str, ratio: Decimal) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            for price in [
                &mut state.prior_close,
                &mut state.last_price,
                &mut state.reference_price,
                &mut state.halt_trigger_price,
            ] {
                if let Some(p) = price.as_mut() {
                    *p /= ratio;
                }
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, SymbolRestrictions> {
        self.symbols.clone()
    }

    pub fn restore(&mut self, symbols: BTreeMap<String, SymbolRestrictions>) {
        for (symbol, state) in symbols {
            self.symbols.insert(symbol, state);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolRestrictions> {
        self.symbols.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn monitor(prior: Option<Decimal>) -> HaltMonitor {
        let mut closes = HashMap::new();
        if let Some(p) = prior {
            closes.insert("AAPL".to_string(), p);
        }
        HaltMonitor::new(&HaltConfig::default(), &["AAPL".to_string()], &closes)
    }

    #[test]
    fn test_first_print_sets_reference() {
        let mut m = monitor(None);
        assert!(m.band("AAPL").is_none());
        assert_eq!(m.on_print("AAPL", dec!(100), 0), None);
        assert_eq!(m.band("AAPL"), Some((dec!(95), dec!(105))));
    }

    #[test]
    fn test_print_outside_band_halts_then_resets_reference() {
        let mut m = monitor(Some(dec!(100)));
        let halt = m.on_print("AAPL", dec!(106), 1_000);
        let until = 1_000 + 300 * NS_PER_SEC;
        assert_eq!(halt, Some(HaltTransition::Halted { until_ns: until }));
        assert!(m.is_halted("AAPL", until - 1));

        // Prints inside the halt do not extend it.
        assert_eq!(m.on_print("AAPL", dec!(120), 2_000), None);

        assert_eq!(m.refresh("AAPL", until), Some(HaltTransition::Resumed));
        assert!(!m.is_halted("AAPL", until));
        assert_eq!(m.get("AAPL").unwrap().reference_price, Some(dec!(106)));
    }

    #[test]
    fn test_tier_two_uses_wider_band() {
        let mut cfg = HaltConfig::default();
        cfg.symbol_tiers.insert("AAPL".into(), 2);
        let mut closes = HashMap::new();
        closes.insert("AAPL".to_string(), dec!(100));
        let mut m = HaltMonitor::new(&cfg, &["AAPL".to_string()], &closes);
        assert_eq!(m.on_print("AAPL", dec!(106), 0), None);
        assert!(m.on_print("AAPL", dec!(111), 1).is_some());
    }

    #[test]
    fn test_ssr_threshold_and_expiry() {
        let mut m = monitor(Some(dec!(100)));
        m.cfg.enable_luld = false;

        m.on_print("AAPL", dec!(91), 0);
        assert!(!m.ssr_active("AAPL"));

        m.on_print("AAPL", dec!(90), 1);
        assert!(m.ssr_active("AAPL"));

        m.roll_day();
        assert!(m.ssr_active("AAPL"), "persists through the next day");
        m.roll_day();
        assert!(!m.ssr_active("AAPL"));
    }

    #[test]
    fn test_roll_day_moves_prior_close() {
        let mut m = monitor(Some(dec!(100)));
        m.on_print("AAPL", dec!(102), 0);
        m.roll_day();
        let state = m.get("AAPL").unwrap();
        assert_eq!(state.prior_close, Some(dec!(102)));
        assert_eq!(state.reference_price, Some(dec!(102)));
    }
}
