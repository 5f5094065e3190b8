//! 告警载荷值对象
//!
//! 告警原文是"头部文本 + 内嵌 JSON 片段"，不同策略作者的字段并不统一。
//! 这里只截取片段并逐字段防御式读取，任何字段都可能缺失。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 持仓状态字段（`marketPosition` / `prevMarketPosition`）
///
/// 按原样小写比较，"Flat" 不等于 "flat"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPosition {
    Long,
    Short,
    Flat,
    Other(String),
}

impl MarketPosition {
    pub fn parse(value: &str) -> Self {
        match value {
            "long" => MarketPosition::Long,
            "short" => MarketPosition::Short,
            "flat" => MarketPosition::Flat,
            other => MarketPosition::Other(other.to_string()),
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, MarketPosition::Flat)
    }
}

/// 规范化后的告警载荷
///
/// 只读取与对账相关的字段；`fields` 保留完整对象以便审计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub market_position: Option<MarketPosition>,
    pub prev_market_position: Option<MarketPosition>,
    pub action: Option<String>,
    /// `positionSize`，别名 `contracts`
    pub position_size: Option<f64>,
    /// `price`，否则 `entry`，否则 `close`
    pub price: Option<f64>,
    /// `strategy` 或 `strategyName`
    pub strategy: Option<String>,
    /// `pair` / `ticker` / `symbol`
    pub symbol: Option<String>,
    pub direction: Option<String>,
    #[serde(skip)]
    pub fields: Map<String, Value>,
}

/// 截取原文中第一个 `{` 到最后一个 `}` 之间的片段（含括号）
///
/// 多个片段时会整体截取，历史数据依赖这一行为
pub fn extract_json_fragment(raw_text: &str) -> Option<&str> {
    let start = raw_text.find('{')?;
    let end = raw_text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw_text[start..=end])
}

impl AlertPayload {
    /// 解析告警原文，片段缺失或 JSON 非法时返回 `None`
    pub fn parse(raw_text: &str) -> Option<Self> {
        let fragment = extract_json_fragment(raw_text)?;
        match serde_json::from_str::<Value>(fragment).ok()? {
            Value::Object(map) => Some(Self::from_fields(map)),
            _ => None,
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            market_position: read_position(&fields, "marketPosition"),
            prev_market_position: read_position(&fields, "prevMarketPosition"),
            action: read_str(&fields, &["action"]),
            position_size: read_f64(&fields, &["positionSize", "contracts"]),
            price: read_f64(&fields, &["price", "entry", "close"]),
            strategy: read_str(&fields, &["strategy", "strategyName"]).filter(|s| !s.trim().is_empty()),
            symbol: read_str(&fields, &["pair", "ticker", "symbol"]).filter(|s| !s.trim().is_empty()),
            direction: read_str(&fields, &["direction"]),
            fields,
        }
    }

    /// 原样读取任意字段
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn read_str(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    })
}

// 空字符串视为缺失
fn read_position(fields: &Map<String, Value>, key: &str) -> Option<MarketPosition> {
    read_str(fields, &[key])
        .filter(|s| !s.trim().is_empty())
        .map(|s| MarketPosition::parse(&s))
}

// 数字可能以字符串形式出现，如 "price": "105.5"
fn read_f64(fields: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match fields.get(*key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_with_fragment() {
        let raw = r#"Alert on XAUUSDT AJAY: {"marketPosition":"flat","prevMarketPosition":"long","price":"2315.4"}"#;
        let payload = AlertPayload::parse(raw).unwrap();

        assert_eq!(payload.market_position, Some(MarketPosition::Flat));
        assert_eq!(payload.prev_market_position, Some(MarketPosition::Long));
        assert_eq!(payload.price, Some(2315.4));
        assert!(payload.action.is_none());
    }

    #[test]
    fn test_parse_failures_return_none() {
        assert!(AlertPayload::parse("AJAY long BTCUSDT").is_none());
        assert!(AlertPayload::parse("AJAY {not json}").is_none());
        assert!(AlertPayload::parse("} AJAY {").is_none());
        assert!(AlertPayload::parse("").is_none());
    }

    #[test]
    fn test_outermost_span_over_captures() {
        let raw = r#"7RSI {"action":"buy"} note {"price":1}"#;
        assert_eq!(
            extract_json_fragment(raw),
            Some(r#"{"action":"buy"} note {"price":1}"#)
        );
        // 截取的片段不是合法 JSON，整体视为无法解析
        assert!(AlertPayload::parse(raw).is_none());
    }

    #[test]
    fn test_nested_braces_kept_whole() {
        let raw = r#"AJAY{"action":"close","meta":{"tf":"1h"},"entry":101}"#;
        let payload = AlertPayload::parse(raw).unwrap();
        assert_eq!(payload.action.as_deref(), Some("close"));
        assert_eq!(payload.price, Some(101.0));
        assert!(payload.field("meta").is_some());
    }

    #[test]
    fn test_synonyms() {
        let raw = r#"X {"close":99.5,"ticker":"ETHUSDT","strategyName":"Trend","contracts":2}"#;
        let payload = AlertPayload::parse(raw).unwrap();
        assert_eq!(payload.price, Some(99.5));
        assert_eq!(payload.symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(payload.strategy.as_deref(), Some("Trend"));
        assert_eq!(payload.position_size, Some(2.0));
    }

    #[test]
    fn test_market_position_is_case_sensitive() {
        let payload = AlertPayload::parse(r#"{"marketPosition":"Flat"}"#).unwrap();
        assert_eq!(
            payload.market_position,
            Some(MarketPosition::Other("Flat".to_string()))
        );
    }

    #[test]
    fn test_empty_positions_are_absent() {
        let payload = AlertPayload::parse(r#"{"marketPosition":"","prevMarketPosition":" "}"#).unwrap();
        assert_eq!(payload.market_position, None);
        assert_eq!(payload.prev_market_position, None);
    }
}
