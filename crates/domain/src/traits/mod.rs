//! 领域接口模块
//!
//! 定义领域层的抽象接口，由基础设施层实现

pub mod signal_repository;

pub use signal_repository::{
    CloseOutcome, EntryClose, LedgerError, LedgerResult, LedgerSummary, LookaheadQuery,
    MatchCommit, OpenEntryQuery, ScanCursor, SignalRepository, StrategyFilter,
};
