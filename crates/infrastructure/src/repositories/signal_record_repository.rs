//! 信号账本 MySQL 实现
//!
//! 平仓与消耗都是带前置状态条件的 UPDATE，匹配提交放在同一个事务里，
//! 任何一条影响行数不为 1 就回滚。

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use sqlx::mysql::MySqlDatabaseError;
use sqlx::{FromRow, MySql, Pool, QueryBuilder};
use tracing::{debug, error, info};

use signal_ledger_domain::entities::{NewSignal, SignalId, SignalRecord};
use signal_ledger_domain::enums::SignalStatus;
use signal_ledger_domain::traits::{
    CloseOutcome, EntryClose, LedgerError, LedgerResult, LedgerSummary, LookaheadQuery,
    MatchCommit, OpenEntryQuery, ScanCursor, SignalRepository, StrategyFilter,
};
use signal_ledger_domain::value_objects::StrategyKey;

const TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS signal_records (
    id BIGINT NOT NULL AUTO_INCREMENT,
    strategy_key VARCHAR(191) NOT NULL,
    strategy_explicit TINYINT(1) NOT NULL DEFAULT 0,
    symbol VARCHAR(64) NOT NULL,
    kind VARCHAR(16) NOT NULL,
    declared_kind VARCHAR(16) NOT NULL,
    direction VARCHAR(8) NOT NULL,
    entry_price DOUBLE NULL,
    exit_price DOUBLE NULL,
    closed_at DATETIME(3) NULL,
    profit_loss_percent DOUBLE NULL,
    needs_review TINYINT(1) NOT NULL DEFAULT 0,
    status VARCHAR(16) NOT NULL,
    raw_text TEXT CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
    created_at DATETIME(3) NOT NULL,
    updated_at DATETIME(3) NOT NULL,
    parent_id BIGINT NULL,
    PRIMARY KEY (id),
    UNIQUE KEY uk_parent (parent_id),
    KEY idx_match (symbol, direction, status, created_at, id),
    KEY idx_scan (status, created_at, id)
) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4
"#;

const SELECT_COLUMNS: &str = "SELECT id, strategy_key, strategy_explicit, symbol, kind, declared_kind, \
     direction, entry_price, exit_price, closed_at, profit_loss_percent, needs_review, status, \
     raw_text, created_at, updated_at, parent_id FROM signal_records";

const OPEN_STATUSES: &str = "('PENDING', 'ACTIVE')";

/// 信号记录数据库实体
#[derive(Debug, Clone, FromRow)]
struct SignalRecordEntity {
    id: i64,
    strategy_key: String,
    strategy_explicit: bool,
    symbol: String,
    kind: String,
    declared_kind: String,
    direction: String,
    entry_price: Option<f64>,
    exit_price: Option<f64>,
    closed_at: Option<NaiveDateTime>,
    profit_loss_percent: Option<f64>,
    needs_review: bool,
    status: String,
    raw_text: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    parent_id: Option<i64>,
}

fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

impl SignalRecordEntity {
    fn to_domain(self) -> LedgerResult<SignalRecord> {
        let bad = |field: &str, e: String| {
            LedgerError::Inconsistent(format!("记录 {} 的字段 {} 无法解析: {}", self.id, field, e))
        };

        Ok(SignalRecord {
            id: self.id,
            strategy_key: StrategyKey::from_parts(self.strategy_key.clone(), self.strategy_explicit),
            symbol: self.symbol.clone(),
            kind: self.kind.parse().map_err(|e| bad("kind", e))?,
            declared_kind: self.declared_kind.parse().map_err(|e| bad("declared_kind", e))?,
            direction: self.direction.parse().map_err(|e| bad("direction", e))?,
            entry_price: self.entry_price,
            exit_price: self.exit_price,
            closed_at: self.closed_at.map(to_utc),
            profit_loss_percent: self.profit_loss_percent,
            needs_review: self.needs_review,
            status: self.status.parse().map_err(|e| bad("status", e))?,
            raw_text: self.raw_text.clone(),
            created_at: to_utc(self.created_at),
            updated_at: to_utc(self.updated_at),
            parent_id: self.parent_id,
        })
    }
}

fn to_domain_all(entities: Vec<SignalRecordEntity>) -> LedgerResult<Vec<SignalRecord>> {
    entities.into_iter().map(SignalRecordEntity::to_domain).collect()
}

/// sqlx 错误映射：连接类错误、死锁 (1213)、锁等待超时 (1205) 可重试
fn map_sqlx_error(context: &str, e: sqlx::Error) -> LedgerError {
    let transient = match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(|my| matches!(my.number(), 1205 | 1213))
            .unwrap_or(false),
        _ => false,
    };

    if transient {
        LedgerError::Transient(format!("{}: {}", context, e))
    } else {
        error!("{}: {}", context, e);
        LedgerError::Storage(format!("{}: {}", context, e))
    }
}

fn is_duplicate_key(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn push_strategy_filter(builder: &mut QueryBuilder<'_, MySql>, filter: &StrategyFilter) {
    match filter {
        StrategyFilter::Any => {}
        StrategyFilter::Exact(value) => {
            builder.push(" AND strategy_key = ").push_bind(value.clone());
        }
        StrategyFilter::Contains(value) => {
            builder
                .push(" AND INSTR(raw_text, ")
                .push_bind(value.clone())
                .push(") > 0");
        }
    }
}

fn push_after_cursor(builder: &mut QueryBuilder<'_, MySql>, after: Option<ScanCursor>) {
    if let Some(cursor) = after {
        let created_at = cursor.created_at.naive_utc();
        builder
            .push(" AND (created_at > ")
            .push_bind(created_at)
            .push(" OR (created_at = ")
            .push_bind(created_at)
            .push(" AND id > ")
            .push_bind(cursor.id)
            .push("))");
    }
}

fn push_order_limit(builder: &mut QueryBuilder<'_, MySql>, limit: usize) {
    builder
        .push(" ORDER BY created_at ASC, id ASC LIMIT ")
        .push_bind(limit as i64);
}

/// 基于 sqlx 的信号账本仓储
pub struct SqlxSignalRepository {
    pool: Pool<MySql>,
}

impl SqlxSignalRepository {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }

    /// 建表（已存在时跳过）
    pub async fn ensure_schema(&self) -> LedgerResult<()> {
        sqlx::query(TABLE_DDL)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("创建 signal_records 表失败", e))?;
        info!("✓ signal_records 表已就绪");
        Ok(())
    }

    async fn fetch(&self, mut builder: QueryBuilder<'_, MySql>, context: &str) -> LedgerResult<Vec<SignalRecord>> {
        let entities = builder
            .build_query_as::<SignalRecordEntity>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(context, e))?;
        to_domain_all(entities)
    }

    async fn status_of(&self, id: SignalId) -> LedgerResult<SignalStatus> {
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM signal_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("查询信号状态失败", e))?;

        match status {
            Some((s,)) => s.parse().map_err(LedgerError::Inconsistent),
            None => Err(LedgerError::NotFound(id)),
        }
    }

    async fn insert(&self, signal: &NewSignal) -> Result<SignalId, sqlx::Error> {
        let created_at = signal.created_at.naive_utc();
        let result = sqlx::query(
            "INSERT INTO signal_records (
                strategy_key, strategy_explicit, symbol, kind, declared_kind, direction,
                entry_price, status, raw_text, created_at, updated_at, parent_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(signal.strategy_key.as_str())
        .bind(signal.strategy_key.is_explicit())
        .bind(&signal.symbol)
        .bind(signal.kind.as_str())
        .bind(signal.declared_kind.as_str())
        .bind(signal.direction.as_str())
        .bind(signal.entry_price)
        .bind(signal.status.as_str())
        .bind(&signal.raw_text)
        .bind(created_at)
        .bind(created_at)
        .bind(signal.parent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_id() as SignalId)
    }
}

#[async_trait]
impl SignalRepository for SqlxSignalRepository {
    async fn append_signal(&self, mut signal: NewSignal) -> LedgerResult<SignalRecord> {
        // DATETIME(3) 只保留毫秒
        signal.created_at = signal.created_at.trunc_subsecs(3);
        let id = self
            .insert(&signal)
            .await
            .map_err(|e| map_sqlx_error("保存信号失败", e))?;
        debug!("保存信号: id={}, symbol={}, kind={}", id, signal.symbol, signal.kind.as_str());
        Ok(SignalRecord::from_new(id, signal))
    }

    async fn find_by_id(&self, id: SignalId) -> LedgerResult<Option<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE id = ").push_bind(id);
        Ok(self.fetch(builder, "查询信号失败").await?.into_iter().next())
    }

    async fn find_open_entries(
        &self,
        query: &OpenEntryQuery,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder
            .push(" WHERE kind = 'ENTRY' AND closed_at IS NULL AND status IN ")
            .push(OPEN_STATUSES)
            .push(" AND symbol = ")
            .push_bind(query.symbol.clone())
            .push(" AND direction = ")
            .push_bind(query.direction.as_str())
            .push(" AND created_at <= ")
            .push_bind(query.not_after.naive_utc());
        push_strategy_filter(&mut builder, &query.strategy);
        push_after_cursor(&mut builder, after);
        push_order_limit(&mut builder, limit);
        self.fetch(builder, "查询未平仓开仓记录失败").await
    }

    async fn close_entry(&self, entry_id: SignalId, close: EntryClose) -> LedgerResult<CloseOutcome> {
        let result = sqlx::query(
            "UPDATE signal_records
             SET status = 'CLOSED', exit_price = ?, closed_at = ?, profit_loss_percent = ?,
                 needs_review = ?, updated_at = ?
             WHERE id = ? AND kind = 'ENTRY' AND closed_at IS NULL AND status IN ('PENDING', 'ACTIVE')",
        )
        .bind(close.exit_price)
        .bind(close.closed_at.naive_utc())
        .bind(close.profit_loss_percent)
        .bind(close.needs_review)
        .bind(Utc::now().naive_utc())
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("平仓开仓记录失败", e))?;

        if result.rows_affected() == 1 {
            return Ok(CloseOutcome::Applied);
        }
        // 区分"已平仓"与"不存在"
        self.status_of(entry_id).await?;
        info!("开仓记录 {} 已平仓，跳过", entry_id);
        Ok(CloseOutcome::AlreadySettled)
    }

    async fn mark_exit_consumed(&self, exit_id: SignalId) -> LedgerResult<CloseOutcome> {
        let result = sqlx::query(
            "UPDATE signal_records SET status = 'EXECUTED', updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'ACTIVE')",
        )
        .bind(Utc::now().naive_utc())
        .bind(exit_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("标记平仓信号失败", e))?;

        if result.rows_affected() == 1 {
            return Ok(CloseOutcome::Applied);
        }
        self.status_of(exit_id).await?;
        info!("平仓信号 {} 已被消耗，跳过", exit_id);
        Ok(CloseOutcome::AlreadySettled)
    }

    async fn commit_match(
        &self,
        entry_id: SignalId,
        exit_id: SignalId,
        close: EntryClose,
    ) -> LedgerResult<MatchCommit> {
        let now = Utc::now().naive_utc();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("开启事务失败", e))?;

        let consumed = sqlx::query(
            "UPDATE signal_records SET status = 'EXECUTED', updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'ACTIVE')",
        )
        .bind(now)
        .bind(exit_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("标记平仓信号失败", e))?;

        if consumed.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("回滚事务失败", e))?;
            return Ok(MatchCommit::ExitAlreadyConsumed);
        }

        let closed = sqlx::query(
            "UPDATE signal_records
             SET status = 'CLOSED', exit_price = ?, closed_at = ?, profit_loss_percent = ?,
                 needs_review = ?, updated_at = ?
             WHERE id = ? AND kind = 'ENTRY' AND closed_at IS NULL AND status IN ('PENDING', 'ACTIVE')",
        )
        .bind(close.exit_price)
        .bind(close.closed_at.naive_utc())
        .bind(close.profit_loss_percent)
        .bind(close.needs_review)
        .bind(now)
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("平仓开仓记录失败", e))?;

        if closed.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("回滚事务失败", e))?;
            return Ok(MatchCommit::EntryAlreadyClosed);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("提交事务失败", e))?;
        Ok(MatchCommit::Committed)
    }

    async fn find_companion_entry(&self, parent_id: SignalId) -> LedgerResult<Option<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE parent_id = ").push_bind(parent_id);
        Ok(self
            .fetch(builder, "查询反手开仓记录失败")
            .await?
            .into_iter()
            .next())
    }

    async fn ensure_companion_entry(&self, mut companion: NewSignal) -> LedgerResult<(SignalRecord, bool)> {
        let Some(parent_id) = companion.parent_id else {
            return Err(LedgerError::Inconsistent("反手开仓记录缺少 parent_id".to_string()));
        };
        if let Some(existing) = self.find_companion_entry(parent_id).await? {
            return Ok((existing, false));
        }

        companion.created_at = companion.created_at.trunc_subsecs(3);
        match self.insert(&companion).await {
            Ok(id) => Ok((SignalRecord::from_new(id, companion), true)),
            // 并发写入时唯一键 uk_parent 冲突，取已存在的那条
            Err(e) if is_duplicate_key(&e) => self
                .find_companion_entry(parent_id)
                .await?
                .map(|existing| (existing, false))
                .ok_or_else(|| LedgerError::Inconsistent(format!("反手开仓记录 {} 冲突后不存在", parent_id))),
            Err(e) => Err(map_sqlx_error("保存反手开仓记录失败", e)),
        }
    }

    async fn scan_open_entries(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder
            .push(" WHERE kind = 'ENTRY' AND closed_at IS NULL AND status IN ")
            .push(OPEN_STATUSES);
        push_after_cursor(&mut builder, after);
        push_order_limit(&mut builder, limit);
        self.fetch(builder, "扫描未平仓开仓记录失败").await
    }

    async fn scan_unconsumed_signals(
        &self,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder
            .push(" WHERE parent_id IS NULL AND status IN ")
            .push(OPEN_STATUSES);
        push_after_cursor(&mut builder, after);
        push_order_limit(&mut builder, limit);
        self.fetch(builder, "扫描未匹配信号失败").await
    }

    async fn find_following_signals(
        &self,
        query: &LookaheadQuery,
        limit: usize,
    ) -> LedgerResult<Vec<SignalRecord>> {
        let mut builder = QueryBuilder::new(SELECT_COLUMNS);
        builder
            .push(" WHERE parent_id IS NULL AND status IN ")
            .push(OPEN_STATUSES)
            .push(" AND symbol = ")
            .push_bind(query.symbol.clone());
        push_strategy_filter(&mut builder, &query.strategy);
        push_after_cursor(&mut builder, Some(query.after));
        push_order_limit(&mut builder, limit);
        self.fetch(builder, "查询后续信号失败").await
    }

    async fn summarize_closed(&self, strategy: Option<&str>) -> LedgerResult<LedgerSummary> {
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(
            "SELECT COUNT(*),
                CAST(COALESCE(SUM(CASE WHEN needs_review = 0 AND profit_loss_percent > 0 THEN 1 ELSE 0 END), 0) AS SIGNED),
                CAST(COALESCE(SUM(CASE WHEN needs_review = 0 AND profit_loss_percent <= 0 THEN 1 ELSE 0 END), 0) AS SIGNED),
                CAST(COALESCE(SUM(CASE WHEN needs_review = 1 THEN 1 ELSE 0 END), 0) AS SIGNED),
                COALESCE(SUM(CASE WHEN needs_review = 0 THEN profit_loss_percent ELSE 0e0 END), 0e0)
             FROM signal_records WHERE kind = 'ENTRY' AND status = 'CLOSED'",
        );
        if let Some(strategy) = strategy {
            builder.push(" AND strategy_key = ").push_bind(strategy.to_string());
        }

        let (closed, wins, losses, flagged, total_pnl): (i64, i64, i64, i64, f64) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("汇总已平仓交易失败", e))?;

        Ok(LedgerSummary {
            closed: closed.max(0) as u64,
            wins: wins.max(0) as u64,
            losses: losses.max(0) as u64,
            flagged: flagged.max(0) as u64,
            total_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use signal_ledger_domain::enums::{Direction, SignalKind};

    #[tokio::test]
    #[ignore] // 需要数据库
    async fn test_commit_match_against_mysql() {
        dotenv::dotenv().ok();
        signal_ledger_core::database::init_db_pool().await.unwrap();
        let pool = signal_ledger_core::database::get_db_pool().unwrap().clone();
        let repo = SqlxSignalRepository::new(pool);
        repo.ensure_schema().await.unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let signal = |kind: SignalKind, raw: &str, price: f64, secs: i64| NewSignal {
            strategy_key: StrategyKey::derived("ITEST"),
            symbol: "ITESTUSDT".to_string(),
            kind,
            declared_kind: kind,
            direction: Direction::Long,
            entry_price: Some(price),
            status: SignalStatus::Pending,
            raw_text: raw.to_string(),
            created_at: t0 + chrono::Duration::seconds(secs),
            parent_id: None,
        };

        let entry = repo
            .append_signal(signal(SignalKind::Entry, r#"ITEST{"action":"buy"}"#, 100.0, 0))
            .await
            .unwrap();
        let exit = repo
            .append_signal(signal(SignalKind::Exit, r#"ITEST{"action":"close"}"#, 110.0, 10))
            .await
            .unwrap();

        let close = EntryClose {
            exit_price: Some(110.0),
            closed_at: exit.created_at,
            profit_loss_percent: 9.9,
            needs_review: false,
        };
        assert_eq!(
            repo.commit_match(entry.id, exit.id, close).await.unwrap(),
            MatchCommit::Committed
        );
        assert_eq!(
            repo.commit_match(entry.id, exit.id, close).await.unwrap(),
            MatchCommit::ExitAlreadyConsumed
        );

        let stored = repo.find_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Closed);
        assert_eq!(stored.closed_at, Some(exit.created_at));
    }
}
