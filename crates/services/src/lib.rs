//! # Signal Ledger Services
//!
//! 应用服务层 - 协调领域对象和账本仓储，实现对账流程
//!
//! ## 架构位置
//!
//! ```text
//! cli (入口) → services (对账流程) → domain + infrastructure
//! ```
//!
//! ## 设计原则
//!
//! 1. **无状态**: 匹配器不保存跨调用状态，并发安全由账本的条件更新保证
//! 2. **依赖注入**: 通过构造函数注入 `Arc<dyn SignalRepository>`
//! 3. **累加器显式传递**: 回填统计在一次运行内累加并作为报告返回
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use signal_ledger_services::reconcile::{BackfillDriver, BackfillOptions, BackfillSide, SignalMatcher};
//!
//! let matcher = Arc::new(SignalMatcher::new(repo, &config));
//! let driver = BackfillDriver::new(matcher);
//! let report = driver
//!     .run(&BackfillOptions::from_config(&config, BackfillSide::OpenEntries).dry_run(true))
//!     .await;
//! ```

pub mod reconcile;

pub use reconcile::{BackfillDriver, SignalIngestService, SignalMatcher};
