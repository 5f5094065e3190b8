//! 数据访问层模块
//!
//! 实现 domain 层定义的 Repository 接口

pub mod in_memory_signal_repository;
pub mod signal_record_repository;

pub use in_memory_signal_repository::InMemorySignalRepository;
pub use signal_record_repository::SqlxSignalRepository;
