//! 配置管理模块

pub mod environment;
pub mod reconcile;

// 重新导出
pub use environment::*;
pub use reconcile::ReconcileConfig;
