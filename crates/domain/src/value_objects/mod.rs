//! 值对象模块
//!
//! 值对象是不可变的、无身份标识的领域概念

pub mod alert_payload;
pub mod profit_loss;
pub mod strategy_key;

pub use alert_payload::{extract_json_fragment, AlertPayload, MarketPosition};
pub use profit_loss::{evaluate_pnl, pnl_percent, PnlOutcome, DEFAULT_FEE_PERCENT};
pub use strategy_key::{HeaderStrategyExtractor, KeyOrigin, StrategyKey, StrategyKeyExtractor};
