//! 信号账本仓储接口
//!
//! 平仓与消耗两次写入必须是"仍处于预期状态才更新"的条件更新，
//! 并发匹配器抢同一条记录时只有一方生效，另一方得到 `AlreadySettled`。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::{NewSignal, SignalId, SignalRecord};
use crate::enums::Direction;
use crate::value_objects::StrategyKey;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// 可重试：连接中断、死锁、锁等待超时等
    #[error("存储暂时不可用: {0}")]
    Transient(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("信号记录不存在: {0}")]
    NotFound(SignalId),

    #[error("数据不一致: {0}")]
    Inconsistent(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// 单条条件更新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Applied,
    /// 已被平仓或已被消耗，本次不做改动
    AlreadySettled,
}

/// 一次匹配提交的结果，两条记录要么都更新、要么都不动
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCommit {
    Committed,
    EntryAlreadyClosed,
    ExitAlreadyConsumed,
}

/// 写入开仓记录的平仓字段
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryClose {
    pub exit_price: Option<f64>,
    pub closed_at: DateTime<Utc>,
    pub profit_loss_percent: f64,
    pub needs_review: bool,
}

/// 策略过滤方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyFilter {
    /// 不限制
    Any,
    /// 与记录的 `strategy_key` 精确相等
    Exact(String),
    /// 记录原文包含该字符串
    Contains(String),
}

impl StrategyFilter {
    /// 显式策略名精确匹配，推导键按原文包含匹配，空键不限制
    pub fn for_key(key: &StrategyKey) -> Self {
        if key.is_empty() {
            StrategyFilter::Any
        } else if key.is_explicit() {
            StrategyFilter::Exact(key.as_str().to_string())
        } else {
            StrategyFilter::Contains(key.as_str().to_string())
        }
    }

    pub fn matches(&self, record: &SignalRecord) -> bool {
        match self {
            StrategyFilter::Any => true,
            StrategyFilter::Exact(value) => record.strategy_key.as_str() == value,
            StrategyFilter::Contains(value) => record.raw_text.contains(value.as_str()),
        }
    }
}

/// 按 (created_at, id) 排序的翻页游标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanCursor {
    pub created_at: DateTime<Utc>,
    pub id: SignalId,
}

impl ScanCursor {
    pub fn of(record: &SignalRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id,
        }
    }

    pub fn is_before(&self, record: &SignalRecord) -> bool {
        *self < Self::of(record)
    }
}

/// 查找未平仓的开仓记录
#[derive(Debug, Clone, PartialEq)]
pub struct OpenEntryQuery {
    pub strategy: StrategyFilter,
    pub symbol: String,
    pub direction: Direction,
    /// 只匹配不晚于平仓事件的开仓
    pub not_after: DateTime<Utc>,
}

/// 开仓记录之后的候选记录（回填时的有限前瞻窗口）
#[derive(Debug, Clone, PartialEq)]
pub struct LookaheadQuery {
    pub strategy: StrategyFilter,
    pub symbol: String,
    pub after: ScanCursor,
}

/// 已平仓交易汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub closed: u64,
    pub wins: u64,
    pub losses: u64,
    /// 需要人工复核
    pub flagged: u64,
    pub total_pnl: f64,
}

impl LedgerSummary {
    pub fn average_pnl(&self) -> f64 {
        let priced = self.closed.saturating_sub(self.flagged);
        if priced == 0 {
            0.0
        } else {
            self.total_pnl / priced as f64
        }
    }

    pub fn win_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided == 0 {
            0.0
        } else {
            self.wins as f64 / decided as f64
        }
    }
}

/// 信号账本仓储
#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// 追加一条信号，不做任何关联
    async fn append_signal(&self, signal: NewSignal) -> LedgerResult<SignalRecord>;

    async fn find_by_id(&self, id: SignalId) -> LedgerResult<Option<SignalRecord>>;

    /// 未平仓的 ENTRY 记录，按 (created_at, id) 升序
    ///
    /// 结果可能包含原文实为平仓的历史记录，调用方用 `opens_position` 过滤
    async fn find_open_entries(
        &self,
        query: &OpenEntryQuery,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>>;

    /// 最早的一条可平仓开仓记录
    async fn find_oldest_open_entry(
        &self,
        query: &OpenEntryQuery,
    ) -> LedgerResult<Option<SignalRecord>> {
        self.find_oldest_open_entry_where(query, &|_| false).await
    }

    /// 同上，`skip` 返回 true 的记录视为已占用
    async fn find_oldest_open_entry_where(
        &self,
        query: &OpenEntryQuery,
        skip: &(dyn for<'r> Fn(&'r SignalRecord) -> bool + Sync),
    ) -> LedgerResult<Option<SignalRecord>> {
        const PAGE: usize = 50;
        let mut after = None;
        loop {
            let page = self.find_open_entries(query, after, PAGE).await?;
            if let Some(found) = page.iter().find(|r| r.opens_position() && !skip(r)) {
                return Ok(Some(found.clone()));
            }
            match page.last() {
                Some(last) if page.len() == PAGE => after = Some(ScanCursor::of(last)),
                _ => return Ok(None),
            }
        }
    }

    /// 平仓一条开仓记录，已平仓时不做改动
    async fn close_entry(&self, entry_id: SignalId, close: EntryClose) -> LedgerResult<CloseOutcome>;

    /// 标记平仓事件已消耗，已消耗时不做改动
    async fn mark_exit_consumed(&self, exit_id: SignalId) -> LedgerResult<CloseOutcome>;

    /// 原子地完成一次匹配：平仓 + 消耗
    async fn commit_match(
        &self,
        entry_id: SignalId,
        exit_id: SignalId,
        close: EntryClose,
    ) -> LedgerResult<MatchCommit>;

    async fn find_companion_entry(&self, parent_id: SignalId) -> LedgerResult<Option<SignalRecord>>;

    /// 为反手事件创建派生开仓记录，已存在时返回已有记录，`bool` 表示是否新建
    async fn ensure_companion_entry(&self, companion: NewSignal) -> LedgerResult<(SignalRecord, bool)>;

    /// 所有未平仓 ENTRY 记录，按 (created_at, id) 升序翻页
    async fn scan_open_entries(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>>;

    /// 所有未匹配的非派生记录，按 (created_at, id) 升序翻页
    async fn scan_unconsumed_signals(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>>;

    /// 某条记录之后的未匹配非派生记录
    async fn find_following_signals(
        &self,
        query: &LookaheadQuery,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>>;

    /// 已平仓交易汇总，`strategy` 为精确的策略键
    async fn summarize_closed(&self, strategy: Option<&str>) -> LedgerResult<LedgerSummary>;
}
