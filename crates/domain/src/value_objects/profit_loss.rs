//! 收益率计算

use serde::{Deserialize, Serialize};

use crate::enums::Direction;

/// 往返手续费假设（百分比）
pub const DEFAULT_FEE_PERCENT: f64 = 0.1;

/// 收益率计算结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PnlOutcome {
    /// 正常计算，已保留 4 位小数
    Computed(f64),
    /// 价格缺失、为零或为负，无法计算
    Unpriced,
}

impl PnlOutcome {
    /// 无法计算时取 0
    pub fn value(&self) -> f64 {
        match self {
            PnlOutcome::Computed(v) => *v,
            PnlOutcome::Unpriced => 0.0,
        }
    }

    pub fn needs_review(&self) -> bool {
        matches!(self, PnlOutcome::Unpriced)
    }
}

fn valid_price(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// 计算收益率，无法计算时返回 `Unpriced`
///
/// - 多头: `(exit - entry) / entry * 100 - fee`
/// - 空头: `(entry - exit) / entry * 100 - fee`
pub fn evaluate_pnl(
    entry_price: Option<f64>,
    exit_price: Option<f64>,
    direction: Direction,
    fee_percent: f64,
) -> PnlOutcome {
    let (Some(entry), Some(exit)) = (valid_price(entry_price), valid_price(exit_price)) else {
        return PnlOutcome::Unpriced;
    };

    let gross = match direction {
        Direction::Long => (exit - entry) / entry * 100.0,
        Direction::Short => (entry - exit) / entry * 100.0,
    };

    PnlOutcome::Computed(round4(gross - fee_percent))
}

/// 收益率百分比，无法计算时为 0
pub fn pnl_percent(
    entry_price: Option<f64>,
    exit_price: Option<f64>,
    direction: Direction,
    fee_percent: f64,
) -> f64 {
    evaluate_pnl(entry_price, exit_price, direction, fee_percent).value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pnl_sign() {
        assert_relative_eq!(
            pnl_percent(Some(100.0), Some(110.0), Direction::Long, DEFAULT_FEE_PERCENT),
            9.9
        );
        assert_relative_eq!(
            pnl_percent(Some(100.0), Some(90.0), Direction::Short, DEFAULT_FEE_PERCENT),
            9.9
        );
        assert_relative_eq!(
            pnl_percent(Some(100.0), Some(90.0), Direction::Long, DEFAULT_FEE_PERCENT),
            -10.1
        );
        assert_relative_eq!(
            pnl_percent(Some(100.0), Some(105.0), Direction::Long, DEFAULT_FEE_PERCENT),
            4.9
        );
    }

    #[test]
    fn test_rounded_to_four_places() {
        let value = pnl_percent(Some(3.0), Some(4.0), Direction::Long, 0.0);
        assert_relative_eq!(value, 33.3333);
    }

    #[test]
    fn test_invalid_prices() {
        for (entry, exit) in [
            (None, Some(1.0)),
            (Some(1.0), None),
            (Some(0.0), Some(1.0)),
            (Some(-5.0), Some(1.0)),
            (Some(1.0), Some(0.0)),
        ] {
            let outcome = evaluate_pnl(entry, exit, Direction::Long, DEFAULT_FEE_PERCENT);
            assert_eq!(outcome, PnlOutcome::Unpriced);
            assert!(outcome.needs_review());
            assert_eq!(outcome.value(), 0.0);
        }
    }
}
