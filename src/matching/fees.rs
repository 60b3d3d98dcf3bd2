use crate::config::FeeSchedule;
use crate::model::{Liquidity, Side};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const MILLION: Decimal = dec!(1000000);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub commission: Decimal,
    pub sec_fee: Decimal,
    pub finra_taf: Decimal,
    /// Taker fee is positive, maker rebate negative.
    pub venue: Decimal,
}

impl FeeBreakdown {
    pub fn total(&self) -> Decimal {
        self.commission + self.sec_fee + self.finra_taf + self.venue
    }
}

fn round_up_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
}

impl FeeSchedule {
    /// Fees for one fill. Per-order commission and the commission floor are
    /// charged on the order's first fill only.
    pub fn compute(
        &self,
        side: Side,
        qty: Decimal,
        price: Decimal,
        liquidity: Liquidity,
        first_fill: bool,
    ) -> FeeBreakdown {
        let mut commission = self.commission_per_share * qty;
        if first_fill {
            commission += self.commission_per_order;
            commission = commission.max(self.min_commission);
        }
        if let Some(max) = self.max_commission {
            commission = commission.min(max);
        }

        let (sec_fee, finra_taf) = match side {
            Side::Sell => (
                round_up_cents(qty * price * self.sec_fee_per_million / MILLION),
                round_up_cents((qty * self.finra_taf_per_share).min(self.finra_taf_max)),
            ),
            Side::Buy => (Decimal::ZERO, Decimal::ZERO),
        };

        let venue = match liquidity {
            Liquidity::Maker => -(self.maker_rebate_per_share * qty),
            Liquidity::Taker => self.taker_fee_per_share * qty,
        };

        FeeBreakdown {
            commission,
            sec_fee,
            finra_taf,
            venue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buys_pay_no_regulatory_fees() {
        let fees = FeeSchedule::default().compute(Side::Buy, dec!(10), dec!(150), Liquidity::Taker, true);
        assert_eq!(fees.total(), Decimal::ZERO);
    }

    #[test]
    fn test_sell_regulatory_fees_round_up() {
        // $1,500 notional: 1500 * 27.80 / 1M = 0.0417 -> 0.05
        // 10 * 0.000166 = 0.00166 -> 0.01
        let fees = FeeSchedule::default().compute(Side::Sell, dec!(10), dec!(150), Liquidity::Taker, true);
        assert_eq!(fees.sec_fee, dec!(0.05));
        assert_eq!(fees.finra_taf, dec!(0.01));
        assert_eq!(fees.total(), dec!(0.06));
    }

    #[test]
    fn test_finra_taf_is_capped() {
        let fees = FeeSchedule::default().compute(Side::Sell, dec!(100000), dec!(1), Liquidity::Taker, true);
        assert_eq!(fees.finra_taf, dec!(8.30));
    }

    #[test]
    fn test_commission_floor_and_cap() {
        let schedule = FeeSchedule {
            commission_per_share: dec!(0.005),
            commission_per_order: Decimal::ZERO,
            min_commission: dec!(1.00),
            max_commission: Some(dec!(5.00)),
            sec_fee_per_million: Decimal::ZERO,
            finra_taf_per_share: Decimal::ZERO,
            ..Default::default()
        };
        let small = schedule.compute(Side::Buy, dec!(10), dec!(10), Liquidity::Taker, true);
        assert_eq!(small.commission, dec!(1.00));

        let large = schedule.compute(Side::Buy, dec!(5000), dec!(10), Liquidity::Taker, true);
        assert_eq!(large.commission, dec!(5.00));

        let follow_up = schedule.compute(Side::Buy, dec!(10), dec!(10), Liquidity::Taker, false);
        assert_eq!(follow_up.commission, dec!(0.05));
    }

    #[test]
    fn test_maker_rebate_reduces_fees() {
        let schedule = FeeSchedule {
            maker_rebate_per_share: dec!(0.002),
            taker_fee_per_share: dec!(0.003),
            ..Default::default()
        };
        let maker = schedule.compute(Side::Buy, dec!(100), dec!(10), Liquidity::Maker, true);
        assert_eq!(maker.venue, dec!(-0.2));
        let taker = schedule.compute(Side::Buy, dec!(100), dec!(10), Liquidity::Taker, true);
        assert_eq!(taker.venue, dec!(0.3));
    }
}
