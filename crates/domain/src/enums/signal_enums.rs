//! 信号相关枚举

use serde::{Deserialize, Serialize};

/// 信号类型
///
/// 账本里存的是分类结果，不一定等于信号源声明的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    /// 开仓
    Entry,
    /// 平仓
    Exit,
    /// 更新（止盈止损调整等）
    Update,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Entry => "ENTRY",
            SignalKind::Exit => "EXIT",
            SignalKind::Update => "UPDATE",
        }
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ENTRY" => Ok(SignalKind::Entry),
            "EXIT" => Ok(SignalKind::Exit),
            "UPDATE" => Ok(SignalKind::Update),
            _ => Err(format!("未知的信号类型: {}", s)),
        }
    }
}

/// 持仓方向
///
/// ENTRY 记录表示开仓方向，EXIT 记录表示被平掉的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// 反向
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// 从信号源的动作字段推断方向：buy/long → LONG，sell/short → SHORT
    pub fn from_action(action: &str) -> Option<Self> {
        match action.trim().to_lowercase().as_str() {
            "buy" | "long" => Some(Direction::Long),
            "sell" | "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            _ => Err(format!("未知的持仓方向: {}", s)),
        }
    }
}

/// 信号状态
///
/// - `Pending` / `Active`: 未匹配
/// - `Executed`: 已被匹配消耗的 EXIT
/// - `Closed`: 已被匹配平仓的 ENTRY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Pending,
    Active,
    Executed,
    Closed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "PENDING",
            SignalStatus::Active => "ACTIVE",
            SignalStatus::Executed => "EXECUTED",
            SignalStatus::Closed => "CLOSED",
        }
    }

    /// 是否仍未匹配
    pub fn is_unmatched(&self) -> bool {
        matches!(self, SignalStatus::Pending | SignalStatus::Active)
    }
}

impl std::str::FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(SignalStatus::Pending),
            "ACTIVE" => Ok(SignalStatus::Active),
            "EXECUTED" => Ok(SignalStatus::Executed),
            "CLOSED" => Ok(SignalStatus::Closed),
            _ => Err(format!("未知的信号状态: {}", s)),
        }
    }
}

/// 平仓识别模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPattern {
    /// 信号源明确声明 EXIT
    ExplicitExit,
    /// marketPosition == "flat"
    FlatPosition,
    /// action == "close"
    CloseAction,
    /// 仓位反手（prevMarketPosition 与 marketPosition 不同）
    Reversal,
}

impl ExitPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitPattern::ExplicitExit => "explicit_exit",
            ExitPattern::FlatPosition => "flat_position",
            ExitPattern::CloseAction => "close_action",
            ExitPattern::Reversal => "reversal",
        }
    }
}
