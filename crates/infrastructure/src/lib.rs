//! # Signal Ledger Infrastructure
//!
//! 基础设施层 - 实现领域层定义的账本接口
//!
//! - `SqlxSignalRepository`: MySQL 持久化，匹配提交在事务内完成
//! - `InMemorySignalRepository`: 语义相同的内存实现，用于测试
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use signal_ledger_infrastructure::repositories::SqlxSignalRepository;
//! use signal_ledger_domain::traits::SignalRepository;
//!
//! let repo = SqlxSignalRepository::new(db_pool);
//! repo.ensure_schema().await?;
//! let summary = repo.summarize_closed(Some("AJAY")).await?;
//! ```

pub mod repositories;

pub use repositories::{InMemorySignalRepository, SqlxSignalRepository};
