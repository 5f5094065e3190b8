//! 平仓识别
//!
//! 同一个平仓事件在不同信号源里有四种写法，这里按固定顺序判定，先命中者生效：
//!
//! 1. 声明类型为 EXIT → `explicit_exit`，平仓方向取信号自身方向
//! 2. 载荷无法解析 → 不是平仓
//! 3. `marketPosition == "flat"` → `flat_position`
//! 4. `action == "close"` → `close_action`
//! 5. `prevMarketPosition` 存在、不是 "flat" 且与 `marketPosition` 不同 → `reversal`
//! 6. 其余视为普通开仓
//!
//! 3~5 的平仓方向：`prevMarketPosition == "long"` 时为 LONG，否则 SHORT。
//! 判定从不报错，拿不准时一律按"不是平仓"处理。

use serde::{Deserialize, Serialize};

use crate::enums::{Direction, ExitPattern, SignalKind};
use crate::value_objects::{AlertPayload, MarketPosition};

/// 判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitClassification {
    pub resolved_as_exit: bool,
    /// 被平掉的方向
    pub closing_direction: Option<Direction>,
    pub pattern: Option<ExitPattern>,
    /// 同一事件新开仓的方向：普通开仓为信号方向，反手为新方向
    pub opened_direction: Option<Direction>,
}

impl ExitClassification {
    fn exit(pattern: ExitPattern, closing_direction: Direction) -> Self {
        Self {
            resolved_as_exit: true,
            closing_direction: Some(closing_direction),
            pattern: Some(pattern),
            opened_direction: None,
        }
    }

    fn not_exit(opened_direction: Direction) -> Self {
        Self {
            resolved_as_exit: false,
            closing_direction: None,
            pattern: None,
            opened_direction: Some(opened_direction),
        }
    }

    pub fn is_reversal(&self) -> bool {
        self.pattern == Some(ExitPattern::Reversal)
    }

    /// 账本中记录的类型
    pub fn resolved_kind(&self, declared: SignalKind) -> SignalKind {
        if self.resolved_as_exit {
            SignalKind::Exit
        } else {
            declared
        }
    }
}

fn closing_from_prev(prev: Option<&MarketPosition>) -> Direction {
    match prev {
        Some(MarketPosition::Long) => Direction::Long,
        _ => Direction::Short,
    }
}

fn opened_from_market(market: Option<&MarketPosition>) -> Option<Direction> {
    match market {
        Some(MarketPosition::Long) => Some(Direction::Long),
        Some(MarketPosition::Short) => Some(Direction::Short),
        _ => None,
    }
}

/// 判定一个信号是否为平仓，以及平掉哪个方向
pub fn classify(
    declared_kind: SignalKind,
    declared_direction: Direction,
    payload: Option<&AlertPayload>,
) -> ExitClassification {
    if declared_kind == SignalKind::Exit {
        return ExitClassification::exit(ExitPattern::ExplicitExit, declared_direction);
    }

    let Some(payload) = payload else {
        return ExitClassification::not_exit(declared_direction);
    };

    let market = payload.market_position.as_ref();
    let prev = payload.prev_market_position.as_ref();

    if market.is_some_and(MarketPosition::is_flat) {
        return ExitClassification::exit(ExitPattern::FlatPosition, closing_from_prev(prev));
    }

    if payload.action.as_deref() == Some("close") {
        return ExitClassification::exit(ExitPattern::CloseAction, closing_from_prev(prev));
    }

    if let Some(prev_position) = prev {
        if !prev_position.is_flat() && Some(prev_position) != market {
            let mut classification =
                ExitClassification::exit(ExitPattern::Reversal, closing_from_prev(prev));
            classification.opened_direction = opened_from_market(market);
            return classification;
        }
    }

    ExitClassification::not_exit(declared_direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> AlertPayload {
        AlertPayload::parse(json).unwrap()
    }

    #[test]
    fn test_explicit_exit_wins_over_flat() {
        let p = payload(r#"{"marketPosition":"flat","prevMarketPosition":"short"}"#);
        let c = classify(SignalKind::Exit, Direction::Long, Some(&p));
        assert!(c.resolved_as_exit);
        assert_eq!(c.pattern, Some(ExitPattern::ExplicitExit));
        assert_eq!(c.closing_direction, Some(Direction::Long));
    }

    #[test]
    fn test_explicit_exit_without_payload() {
        let c = classify(SignalKind::Exit, Direction::Short, None);
        assert_eq!(c.pattern, Some(ExitPattern::ExplicitExit));
        assert_eq!(c.closing_direction, Some(Direction::Short));
    }

    #[test]
    fn test_unparseable_payload_is_not_exit() {
        let c = classify(SignalKind::Entry, Direction::Short, None);
        assert!(!c.resolved_as_exit);
        assert_eq!(c.opened_direction, Some(Direction::Short));
        assert_eq!(c.resolved_kind(SignalKind::Entry), SignalKind::Entry);
    }

    #[test]
    fn test_flat_position() {
        let p = payload(r#"{"marketPosition":"flat","prevMarketPosition":"long","price":105}"#);
        let c = classify(SignalKind::Entry, Direction::Long, Some(&p));
        assert_eq!(c.pattern, Some(ExitPattern::FlatPosition));
        assert_eq!(c.closing_direction, Some(Direction::Long));
        assert_eq!(c.resolved_kind(SignalKind::Entry), SignalKind::Exit);

        // 没有 prevMarketPosition 时默认平空
        let p = payload(r#"{"marketPosition":"flat"}"#);
        let c = classify(SignalKind::Entry, Direction::Long, Some(&p));
        assert_eq!(c.closing_direction, Some(Direction::Short));
    }

    #[test]
    fn test_close_action() {
        let p = payload(r#"{"action":"close","prevMarketPosition":"long","marketPosition":"long"}"#);
        let c = classify(SignalKind::Entry, Direction::Short, Some(&p));
        assert_eq!(c.pattern, Some(ExitPattern::CloseAction));
        assert_eq!(c.closing_direction, Some(Direction::Long));
    }

    #[test]
    fn test_reversal_opens_new_direction() {
        let p = payload(r#"{"marketPosition":"short","prevMarketPosition":"long"}"#);
        let c = classify(SignalKind::Entry, Direction::Short, Some(&p));
        assert!(c.is_reversal());
        assert_eq!(c.closing_direction, Some(Direction::Long));
        assert_eq!(c.opened_direction, Some(Direction::Short));
    }

    #[test]
    fn test_not_reversal_cases() {
        for json in [
            r#"{"marketPosition":"long","prevMarketPosition":"long"}"#,
            r#"{"marketPosition":"long","prevMarketPosition":"flat"}"#,
            r#"{"marketPosition":"long"}"#,
            r#"{"marketPosition":"long","prevMarketPosition":""}"#,
            r#"{"marketPosition":"long","prevMarketPosition":"  "}"#,
            r#"{"action":"buy"}"#,
        ] {
            let c = classify(SignalKind::Entry, Direction::Long, Some(&payload(json)));
            assert!(!c.resolved_as_exit, "{json}");
            assert_eq!(c.opened_direction, Some(Direction::Long));
        }
    }

    #[test]
    fn test_reversal_without_market_position() {
        let p = payload(r#"{"prevMarketPosition":"short"}"#);
        let c = classify(SignalKind::Update, Direction::Long, Some(&p));
        assert!(c.is_reversal());
        assert_eq!(c.closing_direction, Some(Direction::Short));
        assert_eq!(c.opened_direction, None);
    }
}
