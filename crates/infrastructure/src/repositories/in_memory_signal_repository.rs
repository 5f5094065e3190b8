//! 内存版信号账本
//!
//! 与 MySQL 实现语义一致，用于测试和不落库的演练

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use signal_ledger_domain::entities::{NewSignal, SignalId, SignalRecord};
use signal_ledger_domain::enums::{SignalKind, SignalStatus};
use signal_ledger_domain::traits::{
    CloseOutcome, EntryClose, LedgerError, LedgerResult, LedgerSummary, LookaheadQuery,
    MatchCommit, OpenEntryQuery, ScanCursor, SignalRepository, StrategyFilter,
};

#[derive(Default)]
struct Ledger {
    records: BTreeMap<SignalId, SignalRecord>,
    next_id: SignalId,
}

impl Ledger {
    fn insert(&mut self, signal: NewSignal) -> SignalRecord {
        self.next_id += 1;
        let record = SignalRecord::from_new(self.next_id, signal);
        self.records.insert(record.id, record.clone());
        record
    }

    /// 按 (created_at, id) 升序筛选
    fn select<F>(&self, after: Option<ScanCursor>, limit: usize, predicate: F) -> Vec<SignalRecord>
    where
        F: Fn(&SignalRecord) -> bool,
    {
        let mut matched: Vec<&SignalRecord> = self
            .records
            .values()
            .filter(|r| after.map_or(true, |cursor| cursor.is_before(r)))
            .filter(|r| predicate(r))
            .collect();
        matched.sort_by_key(|r| ScanCursor::of(r));
        matched.into_iter().take(limit).cloned().collect()
    }

    fn get_mut(&mut self, id: SignalId) -> LedgerResult<&mut SignalRecord> {
        self.records.get_mut(&id).ok_or(LedgerError::NotFound(id))
    }
}

fn is_open_entry(record: &SignalRecord) -> bool {
    record.kind == SignalKind::Entry && record.is_open()
}

fn apply_close(record: &mut SignalRecord, close: &EntryClose) {
    let now = Utc::now();
    record.status = SignalStatus::Closed;
    record.exit_price = close.exit_price;
    record.closed_at = Some(close.closed_at);
    record.profit_loss_percent = Some(close.profit_loss_percent);
    record.needs_review = close.needs_review;
    record.updated_at = now;
}

fn apply_consume(record: &mut SignalRecord) {
    record.status = SignalStatus::Executed;
    record.updated_at = Utc::now();
}

/// 内存信号账本，写操作在同一把写锁内完成
#[derive(Default)]
pub struct InMemorySignalRepository {
    ledger: RwLock<Ledger>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部记录，按 id 升序
    pub async fn snapshot(&self) -> Vec<SignalRecord> {
        self.ledger.read().await.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.ledger.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SignalRepository for InMemorySignalRepository {
    async fn append_signal(&self, signal: NewSignal) -> LedgerResult<SignalRecord> {
        Ok(self.ledger.write().await.insert(signal))
    }

    async fn find_by_id(&self, id: SignalId) -> LedgerResult<Option<SignalRecord>> {
        Ok(self.ledger.read().await.records.get(&id).cloned())
    }

    async fn find_open_entries(
        &self,
        query: &OpenEntryQuery,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.select(after, limit, |r| {
            is_open_entry(r)
                && r.symbol == query.symbol
                && r.direction == query.direction
                && r.created_at <= query.not_after
                && query.strategy.matches(r)
        }))
    }

    async fn close_entry(&self, entry_id: SignalId, close: EntryClose) -> LedgerResult<CloseOutcome> {
        let mut ledger = self.ledger.write().await;
        let record = ledger.get_mut(entry_id)?;
        if !is_open_entry(record) {
            return Ok(CloseOutcome::AlreadySettled);
        }
        apply_close(record, &close);
        Ok(CloseOutcome::Applied)
    }

    async fn mark_exit_consumed(&self, exit_id: SignalId) -> LedgerResult<CloseOutcome> {
        let mut ledger = self.ledger.write().await;
        let record = ledger.get_mut(exit_id)?;
        if !record.status.is_unmatched() {
            return Ok(CloseOutcome::AlreadySettled);
        }
        apply_consume(record);
        Ok(CloseOutcome::Applied)
    }

    async fn commit_match(
        &self,
        entry_id: SignalId,
        exit_id: SignalId,
        close: EntryClose,
    ) -> LedgerResult<MatchCommit> {
        let mut ledger = self.ledger.write().await;

        if !ledger.get_mut(exit_id)?.status.is_unmatched() {
            return Ok(MatchCommit::ExitAlreadyConsumed);
        }
        if !is_open_entry(ledger.get_mut(entry_id)?) {
            return Ok(MatchCommit::EntryAlreadyClosed);
        }

        apply_consume(ledger.get_mut(exit_id)?);
        apply_close(ledger.get_mut(entry_id)?, &close);
        Ok(MatchCommit::Committed)
    }

    async fn find_companion_entry(&self, parent_id: SignalId) -> LedgerResult<Option<SignalRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .records
            .values()
            .find(|r| r.parent_id == Some(parent_id))
            .cloned())
    }

    async fn ensure_companion_entry(&self, companion: NewSignal) -> LedgerResult<(SignalRecord, bool)> {
        let Some(parent_id) = companion.parent_id else {
            return Err(LedgerError::Inconsistent("反手开仓记录缺少 parent_id".to_string()));
        };
        let mut ledger = self.ledger.write().await;
        if let Some(existing) = ledger.records.values().find(|r| r.parent_id == Some(parent_id)) {
            return Ok((existing.clone(), false));
        }
        Ok((ledger.insert(companion), true))
    }

    async fn scan_open_entries(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.select(after, limit, is_open_entry))
    }

    async fn scan_unconsumed_signals(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.select(after, limit, |r| {
            r.parent_id.is_none() && r.status.is_unmatched()
        }))
    }

    async fn find_following_signals(
        &self,
        query: &LookaheadQuery,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.select(Some(query.after), limit, |r| {
            r.parent_id.is_none()
                && r.status.is_unmatched()
                && r.symbol == query.symbol
                && query.strategy.matches(r)
        }))
    }

    async fn summarize_closed(&self, strategy: Option<&str>) -> LedgerResult<LedgerSummary> {
        let ledger = self.ledger.read().await;
        let filter = strategy.map(|s| StrategyFilter::Exact(s.to_string()));
        let mut summary = LedgerSummary::default();

        for record in ledger.records.values() {
            if record.kind != SignalKind::Entry || record.status != SignalStatus::Closed {
                continue;
            }
            if filter.as_ref().is_some_and(|f| !f.matches(record)) {
                continue;
            }

            summary.closed += 1;
            let pnl = record.profit_loss_percent.unwrap_or(0.0);
            if record.needs_review {
                summary.flagged += 1;
            } else {
                if pnl > 0.0 {
                    summary.wins += 1;
                } else {
                    summary.losses += 1;
                }
                summary.total_pnl += pnl;
            }
        }
        Ok(summary)
    }
}
