//! # Signal Ledger Domain
//!
//! 领域模型层 - 纯粹的对账规则，不依赖任何基础设施
//!
//! ## 模块组织
//!
//! - `value_objects`: 告警载荷解析、策略键推导、收益率计算
//! - `classifier`: 平仓识别
//! - `entities`: 信号记录
//! - `enums`: 信号类型、方向、状态、平仓模式
//! - `traits`: 账本仓储接口
//!
//! ## 使用示例
//!
//! ```rust
//! use signal_ledger_domain::classifier::classify;
//! use signal_ledger_domain::enums::{Direction, ExitPattern, SignalKind};
//! use signal_ledger_domain::value_objects::AlertPayload;
//!
//! let payload = AlertPayload::parse(
//!     r#"AJAY{"marketPosition":"flat","prevMarketPosition":"long","price":105}"#,
//! );
//! let result = classify(SignalKind::Entry, Direction::Long, payload.as_ref());
//! assert_eq!(result.pattern, Some(ExitPattern::FlatPosition));
//! assert_eq!(result.closing_direction, Some(Direction::Long));
//! ```

pub mod classifier;
pub mod entities;
pub mod enums;
pub mod traits;
pub mod value_objects;

pub use classifier::{classify, ExitClassification};
pub use entities::{NewSignal, SignalId, SignalRecord};
pub use enums::{Direction, ExitPattern, SignalKind, SignalStatus};
pub use traits::{
    CloseOutcome, EntryClose, LedgerError, LedgerResult, LedgerSummary, LookaheadQuery,
    MatchCommit, OpenEntryQuery, ScanCursor, SignalRepository, StrategyFilter,
};
pub use value_objects::{
    AlertPayload, HeaderStrategyExtractor, MarketPosition, PnlOutcome, StrategyKey,
    StrategyKeyExtractor,
};
