//! Probabilistic execution frictions: latency, slippage, market impact,
//! liquidity caps, partial fills and venue rejections.
//!
//! Every random draw goes through the caller's RNG so a session seeded the
//! same way makes the same decisions.
use crate::config::ExecutionConfig;
use crate::model::Side;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const NS_PER_MS: i64 = 1_000_000;
const BPS: Decimal = dec!(10000);
const MILLION: Decimal = dec!(1000000);
const PRICE_DP: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAdjustment {
    pub price: Decimal,
    pub slippage_bps: Decimal,
    pub impact_bps: Decimal,
}

impl PriceAdjustment {
    pub fn total_bps(&self) -> Decimal {
        self.slippage_bps + self.impact_bps
    }
}

#[derive(Debug, Clone)]
pub struct FrictionModel {
    cfg: ExecutionConfig,
}

impl FrictionModel {
    pub fn new(cfg: &ExecutionConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    /// Fixed latency plus uniform jitter, in nanoseconds.
    pub fn latency_ns<R: Rng>(&self, rng: &mut R) -> i64 {
        let jitter_ms = if self.cfg.latency_jitter_ms > 0 {
            rng.gen_range(0..=self.cfg.latency_jitter_ms)
        } else {
            0
        };
        (self.cfg.latency_ms + jitter_ms) as i64 * NS_PER_MS
    }

    pub fn slippage_bps(&self, extended_hours: bool) -> Decimal {
        if extended_hours {
            self.cfg.slippage_bps * self.cfg.extended_hours_slippage_multiplier
        } else {
            self.cfg.slippage_bps
        }
    }

    /// `linear * (N / 1M) + sqrt_coef * sqrt(N / 1M)` basis points.
    pub fn impact_bps(&self, notional: Decimal) -> Decimal {
        if notional <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let millions = notional.abs() / MILLION;
        let linear = self.cfg.impact_linear_bps * millions;
        let sqrt_term = if self.cfg.impact_sqrt_bps.is_zero() {
            Decimal::ZERO
        } else {
            let root = millions.to_f64().map(f64::sqrt).unwrap_or(0.0);
            self.cfg.impact_sqrt_bps * Decimal::from_f64(root).unwrap_or(Decimal::ZERO)
        };
        linear + sqrt_term
    }

    /// Moves `base` against the order by slippage plus impact.
    pub fn adjust_price(
        &self,
        side: Side,
        base: Decimal,
        qty: Decimal,
        extended_hours: bool,
    ) -> PriceAdjustment {
        let slippage_bps = self.slippage_bps(extended_hours);
        let impact_bps = self.impact_bps(base * qty);
        let factor = (slippage_bps + impact_bps) / BPS;
        let price = match side {
            Side::Buy => base * (Decimal::ONE + factor),
            Side::Sell => base * (Decimal::ONE - factor),
        };
        PriceAdjustment {
            price: price.round_dp(PRICE_DP),
            slippage_bps,
            impact_bps,
        }
    }

    /// Size available at the touch. `None` when there is no displayed size to
    /// cap against (print-only data) or capping is disabled.
    pub fn available_liquidity(&self, displayed: Decimal, extended_hours: bool) -> Option<Decimal> {
        if !self.cfg.cap_to_displayed_size || displayed <= Decimal::ZERO {
            return None;
        }
        if extended_hours {
            let keep = Decimal::ONE - self.cfg.extended_hours_liquidity_reduction_pct / Decimal::ONE_HUNDRED;
            Some((displayed * keep).max(Decimal::ZERO).floor())
        } else {
            Some(displayed)
        }
    }

    /// Quantity for this fill. A partial draw takes 10%..90% of `fillable`,
    /// whole shares, at least one.
    pub fn draw_fill_qty<R: Rng>(&self, rng: &mut R, fillable: Decimal) -> Decimal {
        let p = self.cfg.partial_fill_probability;
        if p <= 0.0 || fillable <= Decimal::ONE || !rng.gen_bool(p.min(1.0)) {
            return fillable;
        }
        let fraction = Decimal::from_f64(rng.gen_range(0.1..0.9)).unwrap_or(dec!(0.5));
        (fillable * fraction).floor().max(Decimal::ONE).min(fillable)
    }

    pub fn draw_reject<R: Rng>(&self, rng: &mut R) -> bool {
        let p = self.cfg.reject_probability;
        p > 0.0 && rng.gen_bool(p.min(1.0))
    }
}
