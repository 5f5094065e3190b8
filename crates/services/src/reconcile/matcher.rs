//! 匹配器
//!
//! 对一个被判定为平仓的事件，找同策略、同交易对、同方向且不晚于它的最早未平仓开仓（FIFO），
//! 计算收益率后在一次提交里完成"平仓 + 消耗"。匹配器本身无状态，
//! 重复执行不会重复平仓，由账本的条件更新保证。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_domain::entities::{NewSignal, SignalId, SignalRecord};
use signal_ledger_domain::enums::{Direction, ExitPattern};
use signal_ledger_domain::traits::{
    EntryClose, LedgerResult, MatchCommit, OpenEntryQuery, SignalRepository, StrategyFilter,
};
use signal_ledger_domain::value_objects::{evaluate_pnl, PnlOutcome};

use super::retry::RetryPolicy;

/// 一对待提交的开仓/平仓
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedTrade {
    pub entry_id: SignalId,
    pub exit_id: SignalId,
    pub strategy_key: String,
    pub symbol: String,
    pub direction: Direction,
    pub pattern: ExitPattern,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub pnl: PnlOutcome,
}

impl MatchedTrade {
    pub fn entry_close(&self) -> EntryClose {
        EntryClose {
            exit_price: self.exit_price,
            closed_at: self.closed_at,
            profit_loss_percent: self.pnl.value(),
            needs_review: self.pnl.needs_review(),
        }
    }
}

/// 匹配计划（不改动账本）
#[derive(Debug, Clone, PartialEq)]
pub enum MatchPlan {
    /// 不是平仓事件
    NotAnExit,
    /// 已被消耗
    AlreadySettled,
    /// 没有可平的开仓
    Orphan(ExitPattern),
    Pair(MatchedTrade),
}

/// 匹配结果
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    NotAnExit,
    AlreadySettled,
    Orphan(ExitPattern),
    Matched(MatchedTrade),
    /// 并发匹配器抢先完成，本次跳过
    Conflict(MatchCommit),
}

pub struct SignalMatcher {
    repository: Arc<dyn SignalRepository>,
    retry: RetryPolicy,
    fee_percent: f64,
}

impl SignalMatcher {
    pub fn new(repository: Arc<dyn SignalRepository>, config: &ReconcileConfig) -> Self {
        Self {
            repository,
            retry: RetryPolicy::from_config(config),
            fee_percent: config.fee_percent,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn repository(&self) -> &Arc<dyn SignalRepository> {
        &self.repository
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// 为平仓事件找 FIFO 对手，`reserved` 中的开仓视为已占用
    pub async fn plan_exit(
        &self,
        exit: &SignalRecord,
        reserved: &HashSet<SignalId>,
    ) -> LedgerResult<MatchPlan> {
        if exit.is_companion() {
            return Ok(MatchPlan::NotAnExit);
        }
        let classification = exit.exit_classification();
        let (Some(pattern), Some(direction)) =
            (classification.pattern, classification.closing_direction)
        else {
            return Ok(MatchPlan::NotAnExit);
        };
        if !exit.status.is_unmatched() {
            return Ok(MatchPlan::AlreadySettled);
        }

        let query = OpenEntryQuery {
            strategy: StrategyFilter::for_key(&exit.strategy_key),
            symbol: exit.symbol.clone(),
            direction,
            not_after: exit.created_at,
        };

        let Some(entry) = self.oldest_open_entry(&query, exit.id, reserved).await? else {
            debug!(
                "未找到可平仓的开仓: exit_id={}, strategy={}, symbol={}, direction={}",
                exit.id,
                exit.strategy_key,
                exit.symbol,
                direction.as_str()
            );
            return Ok(MatchPlan::Orphan(pattern));
        };

        let pnl = evaluate_pnl(entry.entry_price, exit.entry_price, direction, self.fee_percent);
        Ok(MatchPlan::Pair(MatchedTrade {
            entry_id: entry.id,
            exit_id: exit.id,
            strategy_key: entry.strategy_key.as_str().to_string(),
            symbol: entry.symbol.clone(),
            direction,
            pattern,
            entry_price: entry.entry_price,
            exit_price: exit.entry_price,
            opened_at: entry.created_at,
            closed_at: exit.created_at,
            pnl,
        }))
    }

    async fn oldest_open_entry(
        &self,
        query: &OpenEntryQuery,
        exit_id: SignalId,
        reserved: &HashSet<SignalId>,
    ) -> LedgerResult<Option<SignalRecord>> {
        let taken = |r: &SignalRecord| r.id == exit_id || reserved.contains(&r.id);
        self.retry
            .run("查询未平仓开仓记录", || {
                self.repository.find_oldest_open_entry_where(query, &taken)
            })
            .await
    }

    /// 提交一对匹配；对手已被抢先处理时返回 `Conflict`
    pub async fn commit(&self, trade: MatchedTrade) -> LedgerResult<MatchResult> {
        let close = trade.entry_close();
        let outcome = self
            .retry
            .run("提交匹配", || {
                self.repository.commit_match(trade.entry_id, trade.exit_id, close)
            })
            .await?;

        match outcome {
            MatchCommit::Committed => {
                info!(
                    "✓ 匹配成功: entry={} exit={} {} {} {} pnl={:.4}%",
                    trade.entry_id,
                    trade.exit_id,
                    trade.strategy_key,
                    trade.symbol,
                    trade.pattern.as_str(),
                    trade.pnl.value()
                );
                Ok(MatchResult::Matched(trade))
            }
            conflict => {
                info!(
                    "匹配冲突，跳过: entry={} exit={} {:?}",
                    trade.entry_id, trade.exit_id, conflict
                );
                Ok(MatchResult::Conflict(conflict))
            }
        }
    }

    /// 单个事件的完整匹配
    pub async fn reconcile_exit(&self, exit: &SignalRecord) -> LedgerResult<MatchResult> {
        match self.plan_exit(exit, &HashSet::new()).await? {
            MatchPlan::NotAnExit => Ok(MatchResult::NotAnExit),
            MatchPlan::AlreadySettled => Ok(MatchResult::AlreadySettled),
            MatchPlan::Orphan(pattern) => Ok(MatchResult::Orphan(pattern)),
            MatchPlan::Pair(trade) => self.commit(trade).await,
        }
    }

    /// 反手事件的另一半：按新方向补一条开仓记录，已存在则直接返回
    ///
    /// 不是反手或新方向未知时返回 `None`，`bool` 表示是否新建
    pub async fn ensure_companion(
        &self,
        record: &SignalRecord,
    ) -> LedgerResult<Option<(SignalRecord, bool)>> {
        if record.is_companion() {
            return Ok(None);
        }
        let classification = record.exit_classification();
        let Some(opened) = classification.opened_direction.filter(|_| classification.is_reversal())
        else {
            return Ok(None);
        };

        let companion = NewSignal::companion_of(record, opened);
        let (entry, created) = self
            .retry
            .run("保存反手开仓记录", || {
                self.repository.ensure_companion_entry(companion.clone())
            })
            .await?;

        if created {
            info!(
                "反手开仓: parent={} entry={} {} {}",
                record.id,
                entry.id,
                entry.symbol,
                opened.as_str()
            );
        }
        Ok(Some((entry, created)))
    }
}
