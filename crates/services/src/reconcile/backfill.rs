//! 回填 / 修复
//!
//! 批量对历史未匹配记录跑匹配器，两种方向：
//! - `OpenEntries`: 遍历未平仓开仓（最早优先），在其后有限的前瞻窗口里找平仓事件
//! - `UnconsumedExits`: 遍历未消耗的平仓事件（最早优先），交给匹配器找 FIFO 对手
//!
//! 已平仓 / 已消耗的记录不会出现在候选中，重复执行会收敛。
//! dry-run 只在本地记录占用的记录 ID，不改动账本。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_domain::entities::{SignalId, SignalRecord};
use signal_ledger_domain::enums::ExitPattern;
use signal_ledger_domain::traits::{
    LedgerResult, LookaheadQuery, ScanCursor, SignalRepository, StrategyFilter,
};

use super::matcher::{MatchPlan, MatchResult, MatchedTrade, SignalMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillSide {
    OpenEntries,
    UnconsumedExits,
}

impl BackfillSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillSide::OpenEntries => "open_entries",
            BackfillSide::UnconsumedExits => "unconsumed_exits",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillOptions {
    pub side: BackfillSide,
    pub dry_run: bool,
    /// 最多扫描的记录数
    pub limit: Option<usize>,
    pub batch_size: usize,
    pub lookahead: usize,
}

impl BackfillOptions {
    pub fn from_config(config: &ReconcileConfig, side: BackfillSide) -> Self {
        Self {
            side,
            dry_run: false,
            limit: None,
            batch_size: config.batch_size.max(1),
            lookahead: config.lookahead.max(1),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// 按平仓模式统计的匹配数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternBreakdown {
    pub explicit_exit: u64,
    pub flat_position: u64,
    pub close_action: u64,
    pub reversal: u64,
}

impl PatternBreakdown {
    pub fn record(&mut self, pattern: ExitPattern) {
        match pattern {
            ExitPattern::ExplicitExit => self.explicit_exit += 1,
            ExitPattern::FlatPosition => self.flat_position += 1,
            ExitPattern::CloseAction => self.close_action += 1,
            ExitPattern::Reversal => self.reversal += 1,
        }
    }
}

/// 回填汇总报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub run_id: String,
    pub side: BackfillSide,
    pub dry_run: bool,
    pub scanned: u64,
    pub matched: u64,
    pub orphaned: u64,
    /// 被并发匹配器抢先处理
    pub conflicts: u64,
    pub errors: u64,
    /// 不参与匹配的记录（派生开仓、非平仓事件等）
    pub skipped: u64,
    pub profitable: u64,
    pub losing: u64,
    /// 收益率无法计算，需要人工复核
    pub flagged: u64,
    pub total_pnl: f64,
    pub patterns: PatternBreakdown,
    pub companions_created: u64,
    pub trades: Vec<MatchedTrade>,
}

impl BackfillReport {
    fn new(run_id: String, options: &BackfillOptions) -> Self {
        Self {
            run_id,
            side: options.side,
            dry_run: options.dry_run,
            scanned: 0,
            matched: 0,
            orphaned: 0,
            conflicts: 0,
            errors: 0,
            skipped: 0,
            profitable: 0,
            losing: 0,
            flagged: 0,
            total_pnl: 0.0,
            patterns: PatternBreakdown::default(),
            companions_created: 0,
            trades: Vec::new(),
        }
    }

    pub fn win_rate(&self) -> f64 {
        let decided = self.profitable + self.losing;
        if decided == 0 {
            0.0
        } else {
            self.profitable as f64 / decided as f64
        }
    }

    pub fn average_pnl(&self) -> f64 {
        let decided = self.profitable + self.losing;
        if decided == 0 {
            0.0
        } else {
            self.total_pnl / decided as f64
        }
    }

    fn tally(&mut self, trade: MatchedTrade) {
        self.matched += 1;
        self.patterns.record(trade.pattern);
        if trade.pnl.needs_review() {
            self.flagged += 1;
            warn!(
                "收益率无法计算，需人工复核: entry={} exit={} entry_price={:?} exit_price={:?}",
                trade.entry_id, trade.exit_id, trade.entry_price, trade.exit_price
            );
        } else {
            let pnl = trade.pnl.value();
            self.total_pnl += pnl;
            if pnl > 0.0 {
                self.profitable += 1;
            } else {
                self.losing += 1;
            }
        }
        self.trades.push(trade);
    }
}

/// 一次运行内的占用记录
#[derive(Default)]
struct RunState {
    reserved_entries: HashSet<SignalId>,
    consumed_exits: HashSet<SignalId>,
    visited_entries: HashSet<SignalId>,
    /// 本次运行新建的反手开仓，游标已越过它们的时间，需在本轮处理
    pending_companions: VecDeque<SignalRecord>,
}

pub struct BackfillDriver {
    matcher: Arc<SignalMatcher>,
}

impl BackfillDriver {
    pub fn new(matcher: Arc<SignalMatcher>) -> Self {
        Self { matcher }
    }

    fn repository(&self) -> &Arc<dyn SignalRepository> {
        self.matcher.repository()
    }

    /// 执行回填，总是返回汇总报告；单条记录出错只计数，不中断
    pub async fn run(&self, options: &BackfillOptions) -> BackfillReport {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("backfill", run_id = %run_id, side = options.side.as_str(), dry_run = options.dry_run);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, options: &BackfillOptions) -> BackfillReport {
        let mut report = BackfillReport::new(run_id, options);
        let mut state = RunState::default();
        let mut cursor: Option<ScanCursor> = None;
        let batch_size = options.batch_size.max(1);
        let mut batch_no = 0u64;

        info!(
            "开始回填: side={} dry_run={} limit={:?} batch_size={} lookahead={}",
            options.side.as_str(),
            options.dry_run,
            options.limit,
            batch_size,
            options.lookahead
        );

        'pages: loop {
            let page = match self.scan_page(options.side, cursor, batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!("扫描失败，提前结束: {}", e);
                    report.errors += 1;
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(ScanCursor::of(last));
            batch_no += 1;
            info!("📦 第 {} 批: {} 条记录", batch_no, page.len());

            for record in &page {
                if state.visited_entries.contains(&record.id) {
                    continue;
                }
                if options.limit.is_some_and(|limit| report.scanned >= limit as u64) {
                    break 'pages;
                }
                report.scanned += 1;

                let result = match options.side {
                    BackfillSide::OpenEntries => {
                        self.process_entry(record, options, &mut state, &mut report).await
                    }
                    BackfillSide::UnconsumedExits => {
                        self.process_exit(record, options, &mut state, &mut report).await
                    }
                };
                if let Err(e) = result {
                    error!("处理记录 {} 失败: {}", record.id, e);
                    report.errors += 1;
                }

                while let Some(companion) = state.pending_companions.pop_front() {
                    report.scanned += 1;
                    if let Err(e) = self.process_entry(&companion, options, &mut state, &mut report).await {
                        error!("处理反手开仓 {} 失败: {}", companion.id, e);
                        report.errors += 1;
                    }
                }
            }

            if page.len() < batch_size {
                break;
            }
        }

        info!(
            "回填完成: scanned={} matched={} orphaned={} conflicts={} errors={} profitable={} losing={} flagged={} total_pnl={:.4}% win_rate={:.2}% patterns={:?}",
            report.scanned,
            report.matched,
            report.orphaned,
            report.conflicts,
            report.errors,
            report.profitable,
            report.losing,
            report.flagged,
            report.total_pnl,
            report.win_rate() * 100.0,
            report.patterns
        );
        report
    }

    async fn scan_page(
        &self,
        side: BackfillSide,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let repository = self.repository();
        match side {
            BackfillSide::OpenEntries => {
                self.matcher
                    .retry()
                    .run("扫描未平仓开仓记录", || repository.scan_open_entries(after, limit))
                    .await
            }
            BackfillSide::UnconsumedExits => {
                self.matcher
                    .retry()
                    .run("扫描未匹配信号", || repository.scan_unconsumed_signals(after, limit))
                    .await
            }
        }
    }

    /// 对一笔计划中的匹配：dry-run 只占用，live 提交
    async fn apply(
        &self,
        trade: MatchedTrade,
        options: &BackfillOptions,
        state: &mut RunState,
        report: &mut BackfillReport,
    ) -> LedgerResult<bool> {
        if options.dry_run {
            debug!("[dry-run] entry={} ← exit={}", trade.entry_id, trade.exit_id);
            state.reserved_entries.insert(trade.entry_id);
            state.consumed_exits.insert(trade.exit_id);
            report.tally(trade);
            return Ok(true);
        }

        state.consumed_exits.insert(trade.exit_id);
        match self.matcher.commit(trade).await? {
            MatchResult::Matched(trade) => {
                state.reserved_entries.insert(trade.entry_id);
                report.tally(trade);
                Ok(true)
            }
            _ => {
                report.conflicts += 1;
                Ok(false)
            }
        }
    }

    async fn ensure_companion(
        &self,
        record: &SignalRecord,
        options: &BackfillOptions,
        state: &mut RunState,
        report: &mut BackfillReport,
    ) -> LedgerResult<()> {
        if options.dry_run {
            return Ok(());
        }
        if let Some((companion, true)) = self.matcher.ensure_companion(record).await? {
            report.companions_created += 1;
            if options.side == BackfillSide::OpenEntries {
                state.pending_companions.push_back(companion);
            }
        }
        Ok(())
    }

    async fn process_entry(
        &self,
        entry: &SignalRecord,
        options: &BackfillOptions,
        state: &mut RunState,
        report: &mut BackfillReport,
    ) -> LedgerResult<()> {
        if !entry.opens_position() {
            report.skipped += 1;
            return Ok(());
        }
        if !state.visited_entries.insert(entry.id) {
            return Ok(());
        }
        if state.reserved_entries.contains(&entry.id) {
            // 本次运行中已被更早的平仓事件占用
            return Ok(());
        }

        let query = LookaheadQuery {
            strategy: StrategyFilter::for_key(&entry.strategy_key),
            symbol: entry.symbol.clone(),
            after: ScanCursor::of(entry),
        };
        let repository = self.repository();
        let candidates = self
            .matcher
            .retry()
            .run("查询后续信号", || {
                repository.find_following_signals(&query, options.lookahead)
            })
            .await?;

        for candidate in &candidates {
            if state.consumed_exits.contains(&candidate.id) {
                continue;
            }
            let classification = candidate.exit_classification();
            if classification.closing_direction != Some(entry.direction) {
                continue;
            }

            // 交给匹配器按 FIFO 选对手，可能是更早的开仓
            let MatchPlan::Pair(trade) = self.matcher.plan_exit(candidate, &state.reserved_entries).await?
            else {
                continue;
            };
            let closes_this_entry = trade.entry_id == entry.id;
            if self.apply(trade, options, state, report).await? && classification.is_reversal() {
                self.ensure_companion(candidate, options, state, report).await?;
            }
            if closes_this_entry {
                return Ok(());
            }
        }

        debug!("开仓 {} 在前瞻窗口内未找到平仓事件", entry.id);
        report.orphaned += 1;
        Ok(())
    }

    async fn process_exit(
        &self,
        record: &SignalRecord,
        options: &BackfillOptions,
        state: &mut RunState,
        report: &mut BackfillReport,
    ) -> LedgerResult<()> {
        if state.consumed_exits.contains(&record.id) {
            return Ok(());
        }
        let classification = record.exit_classification();
        if !classification.resolved_as_exit {
            report.skipped += 1;
            return Ok(());
        }
        if classification.is_reversal() {
            self.ensure_companion(record, options, state, report).await?;
        }

        match self.matcher.plan_exit(record, &state.reserved_entries).await? {
            MatchPlan::Pair(trade) => {
                self.apply(trade, options, state, report).await?;
            }
            MatchPlan::Orphan(pattern) => {
                debug!("平仓事件 {} ({}) 暂无对手", record.id, pattern.as_str());
                report.orphaned += 1;
            }
            MatchPlan::NotAnExit | MatchPlan::AlreadySettled => {
                report.skipped += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_ratios() {
        let options = BackfillOptions::from_config(&ReconcileConfig::default(), BackfillSide::OpenEntries);
        let mut report = BackfillReport::new("run".to_string(), &options);
        assert_eq!(report.win_rate(), 0.0);

        report.profitable = 3;
        report.losing = 1;
        report.total_pnl = 8.0;
        assert_eq!(report.win_rate(), 0.75);
        assert_eq!(report.average_pnl(), 2.0);
    }

    #[test]
    fn test_pattern_breakdown() {
        let mut patterns = PatternBreakdown::default();
        patterns.record(ExitPattern::Reversal);
        patterns.record(ExitPattern::Reversal);
        patterns.record(ExitPattern::FlatPosition);
        assert_eq!(patterns.reversal, 2);
        assert_eq!(patterns.flat_position, 1);
        assert_eq!(patterns.explicit_exit, 0);
    }

    #[test]
    fn test_options_from_config() {
        let options = BackfillOptions::from_config(&ReconcileConfig::default(), BackfillSide::UnconsumedExits)
            .dry_run(true)
            .limit(Some(10));
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.lookahead, 20);
        assert!(options.dry_run);
        assert_eq!(options.limit, Some(10));
    }
}
