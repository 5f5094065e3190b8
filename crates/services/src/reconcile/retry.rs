//! 存储操作的有限重试
//!
//! 只重试 `LedgerError::Transient`，退避时间指数增长并带抖动

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, warn};

use signal_ledger_core::config::ReconcileConfig;
use signal_ledger_domain::traits::{LedgerError, LedgerResult};

const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }

    /// 不等待，测试用
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }

    // base, 2*base, 4*base ...
    fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(u64::from(!self.base_delay.is_zero()));
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(MAX_DELAY)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, action: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let result = RetryIf::spawn(self.delays(), action, |e: &LedgerError| {
            let retry = e.is_transient();
            if retry {
                warn!("{} 暂时失败，准备重试: {}", operation, e);
            }
            retry
        })
        .await;

        if let Err(e) = &result {
            if e.is_transient() {
                error!("{} 重试 {} 次后仍失败: {}", operation, self.max_attempts, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_transient_errors_are_bounded() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: LedgerResult<()> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::Transient("lock wait".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = AtomicUsize::new(0);
        let result: LedgerResult<()> = RetryPolicy::immediate(3)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::Storage("syntax".into())) }
            })
            .await;

        assert_eq!(result, Err(LedgerError::Storage("syntax".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient() {
        let calls = AtomicUsize::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(LedgerError::Transient("deadlock".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(1));
    }

    #[test]
    fn test_delay_count() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 2);
        assert!(delays.iter().all(|d| *d <= MAX_DELAY));
    }
}
