//! 实时入库
//!
//! 每条告警：解析 → 推导策略键 → 平仓识别 → 追加入库 → 若是平仓则立即匹配 →
//! 若是反手则补一条新方向的开仓记录。匹配或补录失败只记日志，不影响入库结果，
//! 遗漏的匹配由回填修复。

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info, warn};

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_domain::classifier::{classify, ExitClassification};
use signal_ledger_domain::entities::{NewSignal, SignalRecord};
use signal_ledger_domain::enums::{Direction, SignalKind, SignalStatus};
use signal_ledger_domain::traits::{LedgerError, SignalRepository};
use signal_ledger_domain::value_objects::{
    AlertPayload, HeaderStrategyExtractor, MarketPosition, StrategyKeyExtractor,
};

use super::matcher::{MatchResult, SignalMatcher};

const DEDUP_PRUNE_THRESHOLD: usize = 10_000;

fn de_opt_from_str<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr<Err = String>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => T::from_str(&s).map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn de_kind<'de, D>(deserializer: D) -> Result<SignalKind, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// 一条入站告警
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAlert {
    pub raw_text: String,
    #[serde(rename = "type", deserialize_with = "de_kind")]
    pub declared_kind: SignalKind,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "de_opt_from_str")]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundAlert {
    pub fn new(raw_text: impl Into<String>, declared_kind: SignalKind, received_at: DateTime<Utc>) -> Self {
        Self {
            raw_text: raw_text.into(),
            declared_kind,
            symbol: None,
            direction: None,
            price: None,
            strategy: None,
            received_at,
        }
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("告警缺少交易对")]
    MissingSymbol,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// 入库结果
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedSignal {
    pub record: SignalRecord,
    pub classification: ExitClassification,
    /// 平仓事件的匹配结果，匹配出错时为 `None`
    pub match_result: Option<MatchResult>,
    /// 反手事件补录的开仓记录
    pub companion: Option<SignalRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// 窗口期内的重复推送，未入库
    Duplicate { key: String },
    Recorded(Box<IngestedSignal>),
}

/// 声明方向 → 载荷 direction → action → marketPosition → LONG
fn derive_direction(alert: &InboundAlert, payload: Option<&AlertPayload>) -> Direction {
    if let Some(direction) = alert.direction {
        return direction;
    }
    let Some(payload) = payload else {
        return Direction::Long;
    };
    payload
        .direction
        .as_deref()
        .and_then(|d| d.parse::<Direction>().ok())
        .or_else(|| payload.action.as_deref().and_then(Direction::from_action))
        .or(match payload.market_position {
            Some(MarketPosition::Long) => Some(Direction::Long),
            Some(MarketPosition::Short) => Some(Direction::Short),
            _ => None,
        })
        .unwrap_or(Direction::Long)
}

pub struct SignalIngestService {
    matcher: Arc<SignalMatcher>,
    extractor: Box<dyn StrategyKeyExtractor>,
    duplicate_window: Duration,
    recent: DashMap<String, DateTime<Utc>>,
}

impl SignalIngestService {
    pub fn new(matcher: Arc<SignalMatcher>, config: &ReconcileConfig) -> Self {
        Self {
            matcher,
            extractor: Box::new(HeaderStrategyExtractor),
            duplicate_window: Duration::milliseconds(config.duplicate_window_ms),
            recent: DashMap::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn StrategyKeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    fn repository(&self) -> &Arc<dyn SignalRepository> {
        self.matcher.repository()
    }

    /// 窗口期内见过同一个 key 返回 true，否则记下本次时间
    fn is_duplicate(&self, key: &str, received_at: DateTime<Utc>) -> bool {
        if self.duplicate_window <= Duration::zero() {
            return false;
        }
        if let Some(last) = self.recent.get(key) {
            let elapsed = received_at - *last;
            if elapsed >= Duration::zero() && elapsed < self.duplicate_window {
                return true;
            }
        }
        if self.recent.len() > DEDUP_PRUNE_THRESHOLD {
            let horizon = received_at - self.duplicate_window;
            self.recent.retain(|_, seen| *seen >= horizon);
        }
        self.recent.insert(key.to_string(), received_at);
        false
    }

    pub async fn ingest(&self, alert: InboundAlert) -> Result<IngestOutcome, IngestError> {
        let payload = AlertPayload::parse(&alert.raw_text);
        let symbol = alert
            .symbol
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| payload.as_ref().and_then(|p| p.symbol.clone()))
            .ok_or(IngestError::MissingSymbol)?;
        let price = alert.price.or_else(|| payload.as_ref().and_then(|p| p.price));
        let explicit = alert
            .strategy
            .clone()
            .or_else(|| payload.as_ref().and_then(|p| p.strategy.clone()));
        let strategy_key = self
            .extractor
            .resolve(explicit.as_deref(), &alert.raw_text, &symbol);
        let declared_direction = derive_direction(&alert, payload.as_ref());

        let dedup_key = format!(
            "{}_{}_{}_{}",
            strategy_key,
            symbol,
            declared_direction.as_str(),
            price.map(|p| p.to_string()).unwrap_or_default()
        );
        if self.is_duplicate(&dedup_key, alert.received_at) {
            info!("重复信号，跳过: {}", dedup_key);
            return Ok(IngestOutcome::Duplicate { key: dedup_key });
        }

        let classification = classify(alert.declared_kind, declared_direction, payload.as_ref());
        let signal = NewSignal {
            strategy_key,
            symbol,
            kind: classification.resolved_kind(alert.declared_kind),
            declared_kind: alert.declared_kind,
            direction: classification.closing_direction.unwrap_or(declared_direction),
            entry_price: price,
            status: SignalStatus::Pending,
            raw_text: alert.raw_text,
            created_at: alert.received_at,
            parent_id: None,
        };

        let retry = self.matcher.retry();
        let record = retry
            .run("保存信号", || self.repository().append_signal(signal.clone()))
            .await?;
        debug!(
            "信号入库: id={} kind={} pattern={:?}",
            record.id,
            record.kind.as_str(),
            classification.pattern
        );

        let match_result = if classification.resolved_as_exit {
            match self.matcher.reconcile_exit(&record).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("信号 {} 匹配失败，留待回填: {}", record.id, e);
                    None
                }
            }
        } else {
            None
        };

        let companion = match self.matcher.ensure_companion(&record).await {
            Ok(found) => found.map(|(entry, _)| entry),
            Err(e) => {
                warn!("信号 {} 反手开仓补录失败，留待回填: {}", record.id, e);
                None
            }
        };

        // 最新状态（匹配后可能已被消耗）
        let record = match &match_result {
            Some(MatchResult::Matched(_)) => self
                .repository()
                .find_by_id(record.id)
                .await
                .ok()
                .flatten()
                .unwrap_or(record),
            _ => record,
        };

        Ok(IngestOutcome::Recorded(Box::new(IngestedSignal {
            record,
            classification,
            match_result,
            companion,
        })))
    }
}
