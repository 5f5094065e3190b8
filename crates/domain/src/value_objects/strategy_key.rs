//! 策略标识
//!
//! 没有权威的策略 ID 外键。信号源显式给出策略名时按精确值匹配，
//! 否则从告警头部推导一个规范化的键，用原文包含关系做近似匹配。

use serde::{Deserialize, Serialize};

/// 策略键的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyOrigin {
    /// 入库时显式提供
    Explicit,
    /// 从告警头部推导
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyKey {
    value: String,
    origin: KeyOrigin,
}

impl StrategyKey {
    pub fn explicit(value: impl Into<String>) -> Self {
        Self {
            value: value.into().trim().to_string(),
            origin: KeyOrigin::Explicit,
        }
    }

    pub fn derived(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            origin: KeyOrigin::Derived,
        }
    }

    /// 按持久化字段还原
    pub fn from_parts(value: String, explicit: bool) -> Self {
        if explicit {
            Self::explicit(value)
        } else {
            Self::derived(value)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    pub fn is_explicit(&self) -> bool {
        self.origin == KeyOrigin::Explicit
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl std::fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// 策略键推导接口
///
/// 推导规则是近似的，换实现时只需替换这一处
pub trait StrategyKeyExtractor: Send + Sync {
    fn derive(&self, raw_text: &str, symbol: &str) -> StrategyKey;

    /// 显式策略名优先，缺失时退回推导
    fn resolve(&self, explicit: Option<&str>, raw_text: &str, symbol: &str) -> StrategyKey {
        match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => StrategyKey::explicit(name),
            None => self.derive(raw_text, symbol),
        }
    }
}

/// 基于告警头部的推导
///
/// 1. 取第一个 `{` 之前的文本，没有 `{` 时取第一个 `:` 之前
/// 2. 去掉开头的 "Alert on "（大小写不敏感）
/// 3. 删除头部中出现的所有交易对字面量
/// 4. 只保留 ASCII 字母、数字和空格，再去掉首尾空白
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderStrategyExtractor;

const ALERT_PREFIX: &str = "alert on ";

impl StrategyKeyExtractor for HeaderStrategyExtractor {
    fn derive(&self, raw_text: &str, symbol: &str) -> StrategyKey {
        let header = match raw_text.find('{') {
            Some(pos) => &raw_text[..pos],
            None => raw_text.split(':').next().unwrap_or(raw_text),
        };

        let header = match header.get(..ALERT_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(ALERT_PREFIX) => &header[ALERT_PREFIX.len()..],
            _ => header,
        };

        let header = if symbol.is_empty() {
            header.to_string()
        } else {
            header.replace(symbol, "")
        };

        let cleaned: String = header
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .collect();

        StrategyKey::derived(cleaned.trim())
    }
}
