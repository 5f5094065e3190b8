use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{classify, ExitClassification};
use crate::enums::{Direction, SignalKind, SignalStatus};
use crate::value_objects::{AlertPayload, StrategyKey};

/// 信号记录 ID（自增）
pub type SignalId = i64;

/// 信号记录：账本的基本单位
///
/// 入库后只追加，由匹配器改动一次（状态与平仓字段），原文、时间、交易对、方向不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: SignalId,
    /// 策略标识（可能是推导得到的近似值）
    pub strategy_key: StrategyKey,
    /// 交易对，如 BTCUSDT.P
    pub symbol: String,
    /// 分类后的类型
    pub kind: SignalKind,
    /// 信号源声明的类型
    pub declared_kind: SignalKind,
    /// ENTRY 为开仓方向，EXIT 为被平掉的方向
    pub direction: Direction,
    /// 本事件自身的价格
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub profit_loss_percent: Option<f64>,
    /// 收益率无法计算，需要人工复核
    pub needs_review: bool,
    pub status: SignalStatus,
    /// 原始告警文本
    pub raw_text: String,
    /// 入库时间，FIFO 排序键
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 反手事件派生的开仓记录指向原事件
    pub parent_id: Option<SignalId>,
}

/// 待入库的信号
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub strategy_key: StrategyKey,
    pub symbol: String,
    pub kind: SignalKind,
    pub declared_kind: SignalKind,
    pub direction: Direction,
    pub entry_price: Option<f64>,
    pub status: SignalStatus,
    pub raw_text: String,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<SignalId>,
}

impl NewSignal {
    /// 反手事件的派生开仓记录：新方向，沿用原文、价格和时间
    pub fn companion_of(parent: &SignalRecord, opened_direction: Direction) -> Self {
        Self {
            strategy_key: parent.strategy_key.clone(),
            symbol: parent.symbol.clone(),
            kind: SignalKind::Entry,
            declared_kind: parent.declared_kind,
            direction: opened_direction,
            entry_price: parent.entry_price,
            status: SignalStatus::Pending,
            raw_text: parent.raw_text.clone(),
            created_at: parent.created_at,
            parent_id: Some(parent.id),
        }
    }
}

impl SignalRecord {
    pub fn from_new(id: SignalId, signal: NewSignal) -> Self {
        Self {
            id,
            strategy_key: signal.strategy_key,
            symbol: signal.symbol,
            kind: signal.kind,
            declared_kind: signal.declared_kind,
            direction: signal.direction,
            entry_price: signal.entry_price,
            exit_price: None,
            closed_at: None,
            profit_loss_percent: None,
            needs_review: false,
            status: signal.status,
            raw_text: signal.raw_text,
            created_at: signal.created_at,
            updated_at: signal.created_at,
            parent_id: signal.parent_id,
        }
    }

    /// 重新解析原文
    pub fn payload(&self) -> Option<AlertPayload> {
        AlertPayload::parse(&self.raw_text)
    }

    /// 按原文重新判定；派生开仓记录永远不是平仓
    pub fn exit_classification(&self) -> ExitClassification {
        if self.parent_id.is_some() {
            return ExitClassification {
                resolved_as_exit: false,
                closing_direction: None,
                pattern: None,
                opened_direction: Some(self.direction),
            };
        }
        classify(self.declared_kind, self.direction, self.payload().as_ref())
    }

    pub fn is_companion(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.status.is_unmatched() && self.closed_at.is_none()
    }

    /// 是否是一笔可被平仓的开仓记录
    ///
    /// 历史数据里有声明为 ENTRY、实际是平仓的记录，需按原文重新判定
    pub fn opens_position(&self) -> bool {
        self.kind == SignalKind::Entry
            && self.is_open()
            && (self.is_companion() || !self.exit_classification().resolved_as_exit)
    }
}
