//! Equity curve and drawdown tracking for a session.
//!
//! Samples are taken on simulated time, at most one per `sample_interval_ns`,
//! so long backtests keep a bounded curve.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_INTERVAL_NS: i64 = 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    pub ts_ns: i64,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSummary {
    /// Fractional, e.g. 0.05 for +5%.
    pub total_return: Decimal,
    /// Largest peak-to-trough decline as a fraction of the peak.
    pub max_drawdown: Decimal,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    initial_equity: Decimal,
    current: Decimal,
    peak: Decimal,
    max_drawdown: Decimal,
    equity_curve: Vec<EquityPoint>,
    sample_interval_ns: i64,
}

impl PerformanceTracker {
    pub fn new(initial_equity: Decimal) -> Self {
        Self::with_interval(initial_equity, DEFAULT_SAMPLE_INTERVAL_NS)
    }

    pub fn with_interval(initial_equity: Decimal, sample_interval_ns: i64) -> Self {
        Self {
            initial_equity,
            current: initial_equity,
            peak: initial_equity,
            max_drawdown: Decimal::ZERO,
            equity_curve: Vec::new(),
            sample_interval_ns: sample_interval_ns.max(0),
        }
    }

    /// Peak and drawdown update on every call; the curve only gets a point
    /// when the interval has elapsed since the previous one.
    pub fn record(&mut self, ts_ns: i64, equity: Decimal) {
        self.current = equity;
        if equity > self.peak {
            self.peak = equity;
        }
        if self.peak > Decimal::ZERO {
            let drawdown = (self.peak - equity) / self.peak;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
        let due = self
            .equity_curve
            .last()
            .is_none_or(|last| ts_ns - last.ts_ns >= self.sample_interval_ns);
        if due {
            self.equity_curve.push(EquityPoint { ts_ns, equity });
        }
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn summary(&self) -> PerformanceSummary {
        let total_return = if self.initial_equity.is_zero() {
            Decimal::ZERO
        } else {
            (self.current - self.initial_equity) / self.initial_equity
        };
        PerformanceSummary {
            total_return,
            max_drawdown: self.max_drawdown,
            peak_equity: self.peak,
            current_equity: self.current,
            samples: self.equity_curve.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown_and_return() {
        let mut perf = PerformanceTracker::with_interval(dec!(100000), 0);
        perf.record(1, dec!(110000));
        perf.record(2, dec!(99000));
        perf.record(3, dec!(105000));
        let s = perf.summary();
        assert_eq!(s.peak_equity, dec!(110000));
        assert_eq!(s.max_drawdown, dec!(0.1));
        assert_eq!(s.total_return, dec!(0.05));
        assert_eq!(s.samples, 3);
    }

    #[test]
    fn test_sampling_interval() {
        let mut perf = PerformanceTracker::with_interval(dec!(1000), 10);
        for ts in 0..25 {
            perf.record(ts, dec!(1000));
        }
        let stamps: Vec<i64> = perf.equity_curve().iter().map(|p| p.ts_ns).collect();
        assert_eq!(stamps, vec![0, 10, 20]);
    }
}
