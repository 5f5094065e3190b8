//! 信号对账参数

use std::time::Duration;

pub use signal_ledger_domain::value_objects::DEFAULT_FEE_PERCENT;

use super::environment::{env_f64, env_i64, env_usize};

/// 回填时向后查找的候选记录数
pub const DEFAULT_LOOKAHEAD: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// 存储操作总尝试次数（含首次）
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 100;
/// 相同信号重复推送的判定窗口
pub const DEFAULT_DUPLICATE_WINDOW_MS: i64 = 5_000;

/// 对账配置
///
/// 从环境变量读取，缺省或非法时使用默认值：
/// - `RECONCILE_FEE_PERCENT`
/// - `RECONCILE_LOOKAHEAD`
/// - `RECONCILE_BATCH_SIZE`
/// - `RECONCILE_MAX_ATTEMPTS`
/// - `RECONCILE_RETRY_BASE_MS`
/// - `RECONCILE_DUPLICATE_WINDOW_MS`
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub fee_percent: f64,
    pub lookahead: usize,
    pub batch_size: usize,
    pub max_attempts: usize,
    pub retry_base_ms: u64,
    pub duplicate_window_ms: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fee_percent: DEFAULT_FEE_PERCENT,
            lookahead: DEFAULT_LOOKAHEAD,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let fee_percent = env_f64("RECONCILE_FEE_PERCENT", DEFAULT_FEE_PERCENT);
        let retry_base_ms = env_i64("RECONCILE_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS as i64);
        let duplicate_window_ms =
            env_i64("RECONCILE_DUPLICATE_WINDOW_MS", DEFAULT_DUPLICATE_WINDOW_MS);

        Self {
            fee_percent: if fee_percent < 0.0 { DEFAULT_FEE_PERCENT } else { fee_percent },
            lookahead: env_usize("RECONCILE_LOOKAHEAD", DEFAULT_LOOKAHEAD),
            batch_size: env_usize("RECONCILE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            max_attempts: env_usize("RECONCILE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            retry_base_ms: retry_base_ms.max(0) as u64,
            duplicate_window_ms: duplicate_window_ms.max(0),
        }
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}
